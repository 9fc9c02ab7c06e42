//! In-memory card and image builders for the unit tests.
extern crate std;

use crate::cache::SectorCache;
use crate::fat::FatVolume;
use crate::irq::DepthIrq;
use crate::reader::{BitstreamGenerator, ReadState};
use crate::session::HostBus;
use crate::storage::*;
use crate::timing::TICK_NS;
use core::cell::Cell;
use std::vec;
use std::vec::Vec;

pub struct MemCard {
    pub blocks: Vec<Block>,
    pub reads: Vec<u32>,
    pub writes: Vec<u32>,
    pub modes: Vec<LinkMode>,
    pub fail_reads: bool,
    pub fail_writes: bool,
    /// Polls of `transfer_busy` that report busy after each read.
    pub read_latency: u32,
    pub pending: Cell<u32>,
    /// Engine stays busy until reset.
    pub stuck: bool,
    pub resets: u32,
}

impl MemCard {
    pub fn new(blocks: usize) -> Self {
        return MemCard {
            blocks: vec![[0u8; BLOCK_SIZE]; blocks],
            reads: Vec::new(),
            writes: Vec::new(),
            modes: Vec::new(),
            fail_reads: false,
            fail_writes: false,
            read_latency: 0,
            pending: Cell::new(0),
            stuck: false,
            resets: 0,
        };
    }

    pub fn write_u16(&mut self, offset: usize, value: u16) {
        let block = offset / BLOCK_SIZE;
        let at = offset % BLOCK_SIZE;
        self.blocks[block][at..at + 2].copy_from_slice(&value.to_le_bytes());
    }
}

impl BlockStorage for MemCard {
    fn read_block(&mut self, block: u32, buf: &mut Block) -> Result<(), StorageError> {
        if self.fail_reads {
            return Err(StorageError::NoDataToken(0xFF));
        }
        let Some(src) = self.blocks.get(block as usize) else {
            return Err(StorageError::OutOfRange(block));
        };
        buf.copy_from_slice(src);
        self.reads.push(block);
        self.pending.set(self.read_latency);
        return Ok(());
    }

    fn write_block(&mut self, block: u32, buf: &Block) -> Result<(), StorageError> {
        if self.fail_writes {
            return Err(StorageError::WriteRejected(0x0D));
        }
        let Some(dst) = self.blocks.get_mut(block as usize) else {
            return Err(StorageError::OutOfRange(block));
        };
        dst.copy_from_slice(buf);
        self.writes.push(block);
        return Ok(());
    }

    fn set_mode(&mut self, mode: LinkMode) {
        self.modes.push(mode);
    }

    fn transfer_busy(&self) -> bool {
        if self.stuck {
            return true;
        }
        let left = self.pending.get();
        if left > 0 {
            self.pending.set(left - 1);
            return true;
        }
        return false;
    }

    fn reset_transfer(&mut self) {
        self.stuck = false;
        self.pending.set(0);
        self.resets += 1;
    }
}

/**
Lay down a small FAT16 volume at `boot`: one reserved block, two FATs of
 two blocks, a one block root directory (16 entries). A non-zero `boot`
 gets an MBR pointing at it.
*/
pub fn format_fat16(card: &mut MemCard, boot: u32, sectors_per_cluster: u8) -> FatVolume {
    let b = &mut card.blocks[boot as usize];
    b[0..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
    b[3..11].copy_from_slice(b"MSDOS5.0");
    b[11..13].copy_from_slice(&512u16.to_le_bytes());
    b[13] = sectors_per_cluster;
    b[14..16].copy_from_slice(&1u16.to_le_bytes());
    b[16] = 2;
    b[17..19].copy_from_slice(&16u16.to_le_bytes());
    b[22..24].copy_from_slice(&2u16.to_le_bytes());
    b[54..62].copy_from_slice(b"FAT16   ");
    b[510] = 0x55;
    b[511] = 0xAA;

    if boot != 0 {
        let mbr = &mut card.blocks[0];
        mbr[446 + 4] = 0x06;
        mbr[446 + 8..446 + 12].copy_from_slice(&boot.to_le_bytes());
        mbr[510] = 0x55;
        mbr[511] = 0xAA;
    }

    let volume = FatVolume {
        fat_start: boot + 1,
        root_start: boot + 5,
        data_start: boot + 6,
        sectors_per_cluster_log2: sectors_per_cluster.trailing_zeros() as u8,
        root_entries: 16,
    };

    let fat = volume.fat_start as usize * BLOCK_SIZE;
    card.write_u16(fat, 0xFFF8);
    card.write_u16(fat + 2, 0xFFFF);

    return volume;
}

/// Add a root directory entry whose data lives in `chain`.
pub fn add_file(card: &mut MemCard, volume: &FatVolume, index: u16, name: &[u8; 11], chain: &[u16]) {
    let root = volume.root_start as usize * BLOCK_SIZE + index as usize * 32;
    let size = chain.len() as u32 * volume.sectors_per_cluster() * BLOCK_SIZE as u32;
    {
        let entry = &mut card.blocks[root / BLOCK_SIZE][root % BLOCK_SIZE..root % BLOCK_SIZE + 32];
        entry.fill(0);
        entry[0..11].copy_from_slice(name);
        entry[11] = 0x20;
        entry[26..28].copy_from_slice(&chain.first().copied().unwrap_or(0).to_le_bytes());
        entry[28..32].copy_from_slice(&size.to_le_bytes());
    }

    let fat = volume.fat_start as usize * BLOCK_SIZE;
    for (i, cluster) in chain.iter().enumerate() {
        let next = chain.get(i + 1).copied().unwrap_or(0xFFFF);
        card.write_u16(fat + *cluster as usize * 2, next);
    }
}

/// Fill every sector of the file with a recognizable pattern: byte 0 and
/// 1 hold the linear disk sector index.
pub fn stamp_file(card: &mut MemCard, volume: &FatVolume, chain: &[u16]) {
    let spc = volume.sectors_per_cluster();
    for (slot, cluster) in chain.iter().enumerate() {
        for offset in 0..spc {
            let index = slot as u32 * spc + offset;
            let block = &mut card.blocks[(volume.cluster_block(*cluster) + offset) as usize];
            block.fill(index as u8 ^ 0x5A);
            block[0..2].copy_from_slice(&(index as u16).to_le_bytes());
        }
    }
}

/**
Host side of the cable on a fake clock. Time moves on every
 `drive_enabled` and `now_ns` call. When attached to a drive it also
 plays the read interrupt, ticking the generator every 4us unless the
 timer is masked, and records what went out on the read line.
*/
pub struct ScriptBus<'a> {
    pub now: u32,
    pub step: u32,
    /// Write line toggles at these times, ascending.
    pub edges: Vec<u32>,
    data_end: u32,
    pub write_from: u32,
    pub write_until: u32,
    pub drive_until: u32,
    /// (time, phase lines) in ascending time order.
    pub phases: Vec<(u32, u8)>,
    pub write_protect: Option<bool>,
    drive: Option<(&'a SectorCache, &'a ReadState, &'a DepthIrq)>,
    next_tick: u32,
    /// Cache tag each time a sector starts streaming.
    pub starts: Vec<Option<(u8, u8)>>,
    /// Bits actually streamed, idle ticks left out.
    pub stream: Vec<bool>,
    pub masked_ticks: u32,
}

impl<'a> ScriptBus<'a> {
    pub fn new(step: u32) -> Self {
        return ScriptBus {
            now: 0,
            step,
            edges: Vec::new(),
            data_end: 0,
            write_from: 0,
            write_until: 0,
            drive_until: 0,
            phases: Vec::new(),
            write_protect: None,
            drive: None,
            next_tick: TICK_NS,
            starts: Vec::new(),
            stream: Vec::new(),
            masked_ticks: 0,
        };
    }

    pub fn attach(&mut self, cache: &'a SectorCache, read: &'a ReadState, irq: &'a DepthIrq) {
        self.drive = Some((cache, read, irq));
    }

    /// Put `bytes` on the write line MSB first from `start`, one 4us cell
    /// per bit, a 1 being a transition mid-cell.
    pub fn write_bytes(&mut self, start: u32, bytes: &[u8]) {
        let mut cell = start;
        for byte in bytes {
            for i in (0..8).rev() {
                if byte >> i & 1 != 0 {
                    self.edges.push(cell + TICK_NS / 2);
                }
                cell += TICK_NS;
            }
        }
        self.data_end = cell;
    }

    pub fn end_of_data(&self) -> u32 {
        return self.data_end;
    }

    pub fn stream_bytes(&self) -> Vec<u8> {
        return self
            .stream
            .chunks(8)
            .filter(|bits| bits.len() == 8)
            .map(|bits| bits.iter().fold(0u8, |acc, b| (acc << 1) | *b as u8))
            .collect();
    }

    fn advance(&mut self) {
        self.now += self.step;
        while self.next_tick <= self.now {
            self.next_tick += TICK_NS;
            let Some((cache, read, irq)) = self.drive else {
                continue;
            };
            if irq.masked() {
                self.masked_ticks += 1;
                continue;
            }

            let live = cache.is_ready() && !read.formatting();
            let cursor = read.cursor();
            if live && cursor.byte == 0 && cursor.mask == 0x80 {
                self.starts.push(cache.tag());
            }
            let pulse = BitstreamGenerator::new(cache, read).tick();
            if live {
                self.stream.push(pulse.is_transition());
            }
        }
    }
}

impl<'a> HostBus for ScriptBus<'a> {
    fn drive_enabled(&mut self) -> bool {
        self.advance();
        return self.now < self.drive_until;
    }

    fn write_enabled(&mut self) -> bool {
        return self.now >= self.write_from && self.now < self.write_until;
    }

    fn write_level(&mut self) -> bool {
        return self.edges.partition_point(|t| *t <= self.now) % 2 == 1;
    }

    fn phases(&mut self) -> u8 {
        let at = self.phases.partition_point(|(t, _)| *t <= self.now);
        if at == 0 {
            return 0;
        }
        return self.phases[at - 1].1;
    }

    fn now_ns(&mut self) -> u32 {
        self.advance();
        return self.now;
    }

    fn set_write_protect(&mut self, protect: bool) {
        self.write_protect = Some(protect);
    }
}
