use crate::cache::SectorCache;
use crate::config::*;
use crate::irq::TimerIrq;
use crate::reader::{BitstreamGenerator, ReadState};
use crate::sdcard::SdPins;
use crate::session::HostBus;
use crate::timing::{timer_reload, PULSE_OFFSET_NS, TICK_NS};
use core::arch::asm;
use core::sync::atomic::{AtomicU32, Ordering};
use teensycore::prelude::*;

/// Sector under the head, shared with the read interrupt.
pub static CACHE: SectorCache = SectorCache::new();
pub static READ_STATE: ReadState = ReadState::new();

static MASK_DEPTH: AtomicU32 = AtomicU32::new(0);

fn power(high: bool) -> Power {
    if high {
        return Power::High;
    }
    return Power::Low;
}

pub fn init_pins() {
    let output_config: PadConfig = PadConfig {
        hysterisis: false,
        resistance: PullUpDown::PullUp100k,
        pull_keep: PullKeep::Pull,
        pull_keep_en: false,
        open_drain: false,
        speed: PinSpeed::Max200MHz,
        drive_strength: DriveStrength::Max,
        fast_slew_rate: true,
    };

    for pin in [READ_DATA_PIN, WRITE_PROTECT_PIN, SD_CS_PIN, SD_MOSI_PIN, SD_CLK_PIN] {
        pin_pad_config(pin, output_config.clone());
        pin_mode(pin, Mode::Output);
    }

    pin_out(READ_DATA_PIN, Power::Low);
    pin_out(WRITE_PROTECT_PIN, Power::Low);
    pin_out(SD_CS_PIN, Power::High);

    // The Apple II side drives these, keep them from floating when unplugged
    let input_config: PadConfig = PadConfig {
        hysterisis: true,
        resistance: PullUpDown::PullUp22k,
        pull_keep: PullKeep::Pull,
        pull_keep_en: true,
        open_drain: false,
        speed: PinSpeed::Max200MHz,
        drive_strength: DriveStrength::MaxDiv3,
        fast_slew_rate: true,
    };

    for pin in [
        PHASE0_PIN,
        PHASE1_PIN,
        PHASE2_PIN,
        PHASE3_PIN,
        WRITE_ENABLE_PIN,
        DRIVE_ENABLE_PIN,
        WRITE_DATA_PIN,
        SD_MISO_PIN,
    ] {
        pin_pad_config(pin, input_config.clone());
        pin_mode(pin, Mode::Input);
    }
}

// i.MX RT1062 periodic interrupt timer. Channel 0 paces the bit cells,
// channel 1 is re-armed as a one-shot to place each pulse.
const CCM_CCGR1: u32 = 0x400F_C06C;
const PIT_BASE: u32 = 0x4008_4000;
const PIT_MCR: u32 = PIT_BASE;
const PIT_IRQ: u32 = 122;
const PIT_CLOCK_HZ: u32 = 24_000_000;
const TCTRL_TEN: u32 = 1 << 0;
const TCTRL_TIE: u32 = 1 << 1;
const NVIC_ISER: u32 = 0xE000_E100;
const SCB_VTOR: u32 = 0xE000_ED08;

const fn ldval(channel: u32) -> u32 {
    return PIT_BASE + 0x100 + channel * 0x10;
}

const fn tctrl(channel: u32) -> u32 {
    return ldval(channel) + 0x8;
}

const fn tflg(channel: u32) -> u32 {
    return ldval(channel) + 0xC;
}

/**
Start the read timer. Installs the PIT handler in the vector table,
 loads the 4us cell period and the 3us pulse offset, then enables the
 interrupt. Call once, after `init_pins`.
*/
pub fn start_read_timer() {
    // PIT clock gate, CG6
    assign(CCM_CCGR1, read_word(CCM_CCGR1) | (0x3 << 12));
    assign(PIT_MCR, 0);

    let slot = read_word(SCB_VTOR) + (16 + PIT_IRQ) * 4;
    assign(slot, disk2_pit_isr as usize as u32);

    assign(tctrl(1), 0);
    assign(ldval(1), timer_reload(PULSE_OFFSET_NS, PIT_CLOCK_HZ));
    assign(ldval(0), timer_reload(TICK_NS, PIT_CLOCK_HZ));
    assign(tflg(0), 1);
    assign(tflg(1), 1);
    assign(tctrl(0), TCTRL_TIE | TCTRL_TEN);

    assign(NVIC_ISER + (PIT_IRQ / 32) * 4, 1 << (PIT_IRQ % 32));
}

/**
PIT interrupt. On a cell boundary the read line drops and the next bit
 comes from the generator; a 1 arms the one-shot, which raises the
 line when it fires 3us later.
*/
#[no_mangle]
#[link_section = ".text"]
pub extern "C" fn disk2_pit_isr() {
    if read_word(tflg(1)) & 1 != 0 {
        assign(tflg(1), 1);
        assign(tctrl(1), 0);
        pin_out(READ_DATA_PIN, Power::High);
    }

    if read_word(tflg(0)) & 1 != 0 {
        assign(tflg(0), 1);
        pin_out(READ_DATA_PIN, Power::Low);

        if BitstreamGenerator::new(&CACHE, &READ_STATE).tick().is_transition() {
            // Writing TEN reloads the counter from LDVAL
            assign(tctrl(1), TCTRL_TIE | TCTRL_TEN);
        }
    }
}

/// Masks every interrupt, the read timer included. Nests.
#[derive(Copy, Clone, Default)]
pub struct TeensyIrq;

impl TimerIrq for TeensyIrq {
    fn mask(&self) {
        unsafe {
            asm!("cpsid i");
        }
        MASK_DEPTH.fetch_add(1, Ordering::Relaxed);
    }

    fn unmask(&self) {
        if MASK_DEPTH.fetch_sub(1, Ordering::Relaxed) == 1 {
            unsafe {
                asm!("cpsie i");
            }
        }
    }
}

/// Disk II cable. Enables are active low.
#[derive(Copy, Clone, Default)]
pub struct TeensyBus;

impl HostBus for TeensyBus {
    fn drive_enabled(&mut self) -> bool {
        return pin_read_fast!(DRIVE_ENABLE_PIN) == 0;
    }

    fn write_enabled(&mut self) -> bool {
        return pin_read_fast!(WRITE_ENABLE_PIN) == 0;
    }

    fn write_level(&mut self) -> bool {
        return pin_read_fast!(WRITE_DATA_PIN) > 0;
    }

    fn phases(&mut self) -> u8 {
        let mut phases = 0;
        if pin_read_fast!(PHASE0_PIN) > 0 {
            phases |= 0b0001;
        }
        if pin_read_fast!(PHASE1_PIN) > 0 {
            phases |= 0b0010;
        }
        if pin_read_fast!(PHASE2_PIN) > 0 {
            phases |= 0b0100;
        }
        if pin_read_fast!(PHASE3_PIN) > 0 {
            phases |= 0b1000;
        }
        return phases;
    }

    fn now_ns(&mut self) -> u32 {
        return nanos() as u32;
    }

    fn set_write_protect(&mut self, protect: bool) {
        pin_out(WRITE_PROTECT_PIN, power(protect));
    }
}

/// SD socket on plain GPIO. There is no shifter, block transfers are
/// clocked out in software and always complete before returning.
#[derive(Copy, Clone, Default)]
pub struct TeensySdPins;

impl SdPins for TeensySdPins {
    fn clk(&mut self, high: bool) {
        pin_out(SD_CLK_PIN, power(high));
    }

    fn mosi(&mut self, high: bool) {
        pin_out(SD_MOSI_PIN, power(high));
    }

    fn miso(&mut self) -> bool {
        return pin_read_fast!(SD_MISO_PIN) > 0;
    }

    fn cs(&mut self, high: bool) {
        pin_out(SD_CS_PIN, power(high));
    }

    fn enable_shifter(&mut self, _on: bool) {}

    fn shift(&mut self, byte: u8) -> u8 {
        let mut out = 0u8;
        for i in (0..8).rev() {
            self.mosi(byte >> i & 1 != 0);
            self.clk(true);
            out = (out << 1) | self.miso() as u8;
            self.clk(false);
        }
        return out;
    }

    fn delay_us(&mut self, us: u32) {
        wait_exact_ns(us as u64 * 1_000);
    }
}
