use crate::cache::SectorCache;
use crate::nic::STREAM_LEN;
use crate::timing::Pulse;
use core::sync::atomic::{AtomicBool, AtomicU16, Ordering};

pub const STREAM_BITS: u16 = (STREAM_LEN * 8) as u16;

/// Byte and bit position of the read head within the cached sector.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ReadCursor {
    pub byte: u16,
    pub mask: u8,
}

impl ReadCursor {
    fn from_bits(bits: u16) -> Self {
        return ReadCursor {
            byte: bits >> 3,
            mask: 0x80 >> (bits & 7),
        };
    }
}

/**
State shared between the read interrupt and the main loop. The cursor
 is a single bit counter, so a store can never be seen half done; the
 main loop still resets it under `IrqGuard` together with the cache
 handoff.
*/
pub struct ReadState {
    bits: AtomicU16,
    formatting: AtomicBool,
}

impl ReadState {
    pub const fn new() -> Self {
        return ReadState {
            bits: AtomicU16::new(0),
            formatting: AtomicBool::new(false),
        };
    }

    pub fn cursor(&self) -> ReadCursor {
        return ReadCursor::from_bits(self.bits.load(Ordering::Relaxed));
    }

    pub fn reset_cursor(&self) {
        self.bits.store(0, Ordering::Relaxed);
    }

    pub fn formatting(&self) -> bool {
        return self.formatting.load(Ordering::Relaxed);
    }

    pub fn set_formatting(&self, on: bool) {
        self.formatting.store(on, Ordering::Relaxed);
    }
}

impl Default for ReadState {
    fn default() -> Self {
        return Self::new();
    }
}

/// Interrupt side of the read path: one call per 4us bit cell.
#[derive(Copy, Clone)]
pub struct BitstreamGenerator<'a> {
    cache: &'a SectorCache,
    state: &'a ReadState,
}

impl<'a> BitstreamGenerator<'a> {
    pub fn new(cache: &'a SectorCache, state: &'a ReadState) -> Self {
        return BitstreamGenerator { cache, state };
    }

    pub fn tick(&self) -> Pulse {
        if !self.cache.is_ready() || self.state.formatting() {
            return Pulse::Idle;
        }

        let bits = self.state.bits.load(Ordering::Relaxed);
        if bits >= STREAM_BITS {
            self.cache.invalidate();
            return Pulse::Idle;
        }

        let cursor = ReadCursor::from_bits(bits);
        let Some(byte) = self.cache.byte(cursor.byte as usize) else {
            return Pulse::Idle;
        };

        let next = bits + 1;
        self.state.bits.store(next, Ordering::Relaxed);
        if next == STREAM_BITS {
            // Sector done, ask the main loop for the next one
            self.cache.invalidate();
        }

        if byte & cursor.mask != 0 {
            return Pulse::Transition;
        }
        return Pulse::Idle;
    }
}

#[cfg(test)]
mod test_reader {
    extern crate std;

    use super::*;
    use crate::cache::SectorCache;
    use crate::fat::FatVolume;
    use crate::mock::*;
    use crate::nic::{compose, AddressField, DATA_BODY_LEN, EPILOGUE, PAYLOAD_LEN};
    use crate::resolver::Resolver;
    use crate::session::SessionContext;
    use crate::timing::{BitSeparator, PULSE_OFFSET_NS, TICK_NS};
    use crate::writer::{Field, WriteDecoder};
    use std::vec::Vec;

    fn pattern() -> [u8; STREAM_LEN] {
        return core::array::from_fn(|i| (i as u8).wrapping_mul(37) ^ 0xA5);
    }

    /// Rebuild bytes from a pulse train, one pulse slot per bit cell.
    fn decode_pulses(pulses: &[Pulse]) -> Vec<u8> {
        return pulses
            .chunks(8)
            .map(|cell| {
                cell.iter()
                    .fold(0u8, |acc, p| (acc << 1) | p.is_transition() as u8)
            })
            .collect();
    }

    #[test]
    fn pulse_train_round_trips() {
        let cache = SectorCache::new();
        let state = ReadState::new();
        let data = pattern();
        cache.fill(0, 0, |block| block[..STREAM_LEN].copy_from_slice(&data));
        cache.mark_ready();

        let generator = BitstreamGenerator::new(&cache, &state);
        let pulses: Vec<Pulse> = (0..STREAM_BITS).map(|_| generator.tick()).collect();

        assert_eq!(decode_pulses(&pulses), data.to_vec());
        assert!(!cache.is_ready());
        assert_eq!(state.cursor().byte as usize, STREAM_LEN);

        // Holds idle until refreshed
        let reads = cache.reads.load(Ordering::Relaxed);
        for _ in 0..100 {
            assert_eq!(generator.tick(), Pulse::Idle);
        }
        assert_eq!(cache.reads.load(Ordering::Relaxed), reads);
    }

    #[test]
    fn streamed_sector_decodes_like_a_write() {
        let header = AddressField::new(0xFE, 17, 9);
        let mut body = [0u8; DATA_BODY_LEN];
        for (i, b) in body[..PAYLOAD_LEN].iter_mut().enumerate() {
            *b = 0x96 | (i as u8 & 0x69);
        }
        body[PAYLOAD_LEN..].copy_from_slice(&EPILOGUE);
        let image = compose(&header, &body);

        let cache = SectorCache::new();
        let state = ReadState::new();
        cache.fill(17, 9, |block| block.copy_from_slice(&image));
        cache.mark_ready();
        let generator = BitstreamGenerator::new(&cache, &state);

        // Receiving end gets its own state so an address field can't mute the source
        let rx_cache = SectorCache::new();
        let rx_state = ReadState::new();
        let ctx = SessionContext::new(&rx_cache, &rx_state);
        let mut decoder = WriteDecoder::default();
        let mut separator = BitSeparator::new(false, 0);
        let mut level = false;
        let mut fields = Vec::new();

        // Sample the line every 500ns, pulses land 3us into their cell
        for cell in 0..STREAM_BITS as u32 {
            let pulse = generator.tick();
            for offset in (0..TICK_NS).step_by(500) {
                if pulse.is_transition() && offset == PULSE_OFFSET_NS {
                    level = !level;
                }
                if let Some(bit) = separator.sample(level, cell * TICK_NS + offset) {
                    if let Some(field) = decoder.push_bit(bit, &ctx) {
                        fields.push(field);
                    }
                }
            }
        }

        assert_eq!(fields, [Field::Address(header), Field::Data]);
        assert_eq!(decoder.captured(), &body[..]);
        assert!(rx_state.formatting());
    }

    #[test]
    fn mask_walks_msb_first() {
        let cache = SectorCache::new();
        let state = ReadState::new();
        cache.fill(0, 0, |block| {
            block[0] = 0b1000_0001;
            block[1] = 0xFF;
        });
        cache.mark_ready();
        let generator = BitstreamGenerator::new(&cache, &state);

        assert_eq!(state.cursor(), ReadCursor { byte: 0, mask: 0x80 });
        assert_eq!(generator.tick(), Pulse::Transition);
        assert_eq!(state.cursor(), ReadCursor { byte: 0, mask: 0x40 });
        for _ in 0..6 {
            assert_eq!(generator.tick(), Pulse::Idle);
        }
        assert_eq!(state.cursor().mask, 0x01);
        assert_eq!(generator.tick(), Pulse::Transition);
        assert_eq!(state.cursor(), ReadCursor { byte: 1, mask: 0x80 });
    }

    #[test]
    fn formatting_mutes_output() {
        let cache = SectorCache::new();
        let state = ReadState::new();
        cache.fill(0, 0, |block| block.fill(0xFF));
        cache.mark_ready();
        state.set_formatting(true);

        let generator = BitstreamGenerator::new(&cache, &state);
        for _ in 0..16 {
            assert_eq!(generator.tick(), Pulse::Idle);
        }
        assert_eq!(state.cursor().byte, 0);
        assert_eq!(cache.reads.load(Ordering::Relaxed), 0);

        state.set_formatting(false);
        assert_eq!(generator.tick(), Pulse::Transition);
    }

    #[test]
    fn no_cache_reads_while_refreshing() {
        let mut card = MemCard::new(64);
        let volume: FatVolume = format_fat16(&mut card, 0, 4);
        let chain = [2u16, 3, 4, 5];
        add_file(&mut card, &volume, 0, b"DISK    NIC", &chain);
        stamp_file(&mut card, &volume, &chain);
        card.read_latency = 5;

        let cache = SectorCache::new();
        let state = ReadState::new();
        let generator = BitstreamGenerator::new(&cache, &state);
        let mut resolver = Resolver::new(card, &cache);
        resolver.select(&volume, 0).unwrap();

        // Fake clock: one interrupt per 4us, main loop gets a turn every tick
        let mut now_ns: u64 = 0;
        let mut sector = 0u8;
        let mut waiting = false;
        let mut served = 0;
        let mut reads_while_unready = 0;

        while served < 3 {
            let ready_before = cache.is_ready();
            let reads_before = cache.reads.load(Ordering::Relaxed);
            generator.tick();
            now_ns += 4_000;
            if !ready_before && cache.reads.load(Ordering::Relaxed) != reads_before {
                reads_while_unready += 1;
            }

            if !cache.is_ready() && !waiting {
                sector = (sector + 1) & 0xF;
                resolver.refresh(0, sector).unwrap();
                // An interrupt landing mid-transfer sees nothing
                assert_eq!(generator.tick(), Pulse::Idle);
                waiting = true;
            } else if waiting && resolver.transfer_complete() {
                state.reset_cursor();
                cache.mark_ready();
                waiting = false;
                served += 1;
            }
        }

        assert_eq!(reads_while_unready, 0);
        assert_eq!(cache.tag(), Some((0, 3)));
        assert!(now_ns > 2 * STREAM_BITS as u64 * 4_000);
    }
}
