use crate::cache::SectorCache;
use crate::config::{DriveConfig, SECTORS_PER_TRACK};
use crate::fat::{DirEntry, FatVolume};
use crate::irq::{with_masked, IrqGuard, TimerIrq};
use crate::reader::ReadState;
use crate::resolver::{ResolveError, Resolver};
use crate::stepper::StepperTracker;
use crate::storage::BlockStorage;
use crate::writer::WriteDecoder;
use log::{debug, info};

/// The Apple II side of the drive cable.
pub trait HostBus {
    fn drive_enabled(&mut self) -> bool;
    fn write_enabled(&mut self) -> bool;
    /// Current level of the write data line.
    fn write_level(&mut self) -> bool;
    /// Stepper coils, phase 0 in bit 0.
    fn phases(&mut self) -> u8;
    /// Free running nanosecond counter. Expected to wrap.
    fn now_ns(&mut self) -> u32;
    fn set_write_protect(&mut self, protect: bool);
}

/**
Where the emulated head is. Track and stepper position survive from
 one session to the next like a real head would; the sector does not.
 Sector-ready and formatting live with the read interrupt.
*/
pub struct SessionContext<'a> {
    /// Physical half-track, 0..=69
    pub track: u8,
    pub sector: u8,
    pub stepper: StepperTracker,
    cache: &'a SectorCache,
    read: &'a ReadState,
}

impl<'a> SessionContext<'a> {
    pub fn new(cache: &'a SectorCache, read: &'a ReadState) -> Self {
        return SessionContext {
            track: 0,
            sector: 0,
            stepper: StepperTracker::new(),
            cache,
            read,
        };
    }

    pub fn disk_track(&self) -> u8 {
        return self.track >> 1;
    }

    pub fn sector_ready(&self) -> bool {
        return self.cache.is_ready();
    }

    pub fn formatting(&self) -> bool {
        return self.read.formatting();
    }

    pub fn set_formatting(&self, on: bool) {
        self.read.set_formatting(on);
    }

    /// Ask the main loop for a fresh sector. Output idles until then.
    pub fn request_refresh(&self) {
        self.cache.invalidate();
    }

    pub fn next_sector(&mut self) -> u8 {
        self.sector = (self.sector + 1) % SECTORS_PER_TRACK;
        return self.sector;
    }

    /// Start streaming a freshly loaded sector. Call with the timer masked.
    pub fn present_sector(&self) {
        self.read.reset_cursor();
        self.cache.mark_ready();
    }

    fn reset(&mut self) {
        self.sector = 0;
        self.set_formatting(false);
        self.request_refresh();
        self.read.reset_cursor();
    }
}

/// Per-session counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub sectors: u32,
    pub failed_refreshes: u32,
    pub write_bursts: u32,
    pub write_backs: u32,
    pub failed_writes: u32,
}

/**
Main loop side of the drive. Each call to `run` is one session: it
 lasts as long as the host keeps drive-enable asserted and in that time
 serves sectors to the read interrupt, follows the stepper and decodes
 write bursts.
*/
pub struct FloppySession<'a, S: BlockStorage, I: TimerIrq> {
    resolver: Resolver<'a, S>,
    ctx: SessionContext<'a>,
    decoder: WriteDecoder,
    irq: I,
    config: DriveConfig,
}

impl<'a, S: BlockStorage, I: TimerIrq> FloppySession<'a, S, I> {
    pub fn new(resolver: Resolver<'a, S>, read: &'a ReadState, irq: I, config: DriveConfig) -> Self {
        let cache = resolver.cache();
        return FloppySession {
            resolver,
            ctx: SessionContext::new(cache, read),
            decoder: WriteDecoder::new(config.volume),
            irq,
            config,
        };
    }

    pub fn resolver(&mut self) -> &mut Resolver<'a, S> {
        return &mut self.resolver;
    }

    pub fn context(&self) -> &SessionContext<'a> {
        return &self.ctx;
    }

    pub fn config(&self) -> &DriveConfig {
        return &self.config;
    }

    /**
    Put a disk in the drive: root directory entry `entry` becomes the
     image. A read-only file makes the drive write protected.
    */
    pub fn insert(&mut self, volume: &FatVolume, entry: u16) -> Result<DirEntry, ResolveError> {
        let dir = self.resolver.select(volume, entry)?;
        let read_only = dir.is_read_only();
        self.config.write_capable = !read_only;
        self.config.write_protect = read_only;
        return Ok(dir);
    }

    pub fn eject(&mut self) {
        self.resolver.unselect();
    }

    pub fn set_write_protect<B: HostBus>(&mut self, bus: &mut B, protect: bool) {
        self.config.write_protect = protect;
        bus.set_write_protect(protect);
    }

    /// Serve one session. Returns at once if the drive is off or empty.
    pub fn run<B: HostBus>(&mut self, bus: &mut B) -> SessionStats {
        let mut stats = SessionStats::default();
        if !self.resolver.is_selected() || !bus.drive_enabled() {
            return stats;
        }

        self.begin(bus);
        while bus.drive_enabled() {
            self.poll(bus, &mut stats);
        }
        self.end();

        debug!(
            "session done: {} sectors, {} write backs, {} lost",
            stats.sectors, stats.write_backs, stats.failed_writes
        );
        return stats;
    }

    fn begin<B: HostBus>(&mut self, bus: &mut B) {
        bus.set_write_protect(self.config.write_protect);
        with_masked(&self.irq, || self.ctx.reset());
        self.decoder.reset();
        info!("drive on at track {}", self.ctx.track);
    }

    fn end(&mut self) {
        self.resolver.release();
        with_masked(&self.irq, || self.ctx.reset());
        self.decoder.reset();
        info!("drive off");
    }

    fn poll<B: HostBus>(&mut self, bus: &mut B, stats: &mut SessionStats) {
        if self.config.write_capable && bus.write_enabled() {
            // Reading and writing never overlap
            let _cs = IrqGuard::new(&self.irq);
            stats.write_bursts += 1;
            let report = self.decoder.run_burst(bus, &mut self.ctx, &mut self.resolver);
            stats.write_backs += report.written;
            stats.failed_writes += report.failed;
        }

        let phases = bus.phases();
        self.ctx.stepper.poll(phases, &mut self.ctx.track);

        if !self.ctx.sector_ready() && !self.ctx.formatting() {
            if self.load_next(bus) {
                stats.sectors += 1;
            } else {
                stats.failed_refreshes += 1;
            }
        }
    }

    /// Fetch the sector after the current one and hand it to the interrupt.
    fn load_next<B: HostBus>(&mut self, bus: &mut B) -> bool {
        let sector = self.ctx.next_sector();
        let track = self.ctx.disk_track();

        if let Err(e) = self.resolver.refresh(track, sector) {
            debug!("no sector for t:{} s:{}: {}", track, sector, e);
            return false;
        }

        while !self.resolver.transfer_complete() {
            if !bus.drive_enabled() {
                // Teardown resets the engine
                return false;
            }
        }

        with_masked(&self.irq, || self.ctx.present_sector());
        return true;
    }
}
