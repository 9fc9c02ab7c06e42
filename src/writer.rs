use crate::config::{VOLUME, WRITE_BUFFER_SIZE};
use crate::nic::{
    compose, AddressField, ADDRESS_BODY_LEN, ADDRESS_MARK, DATA_BODY_LEN, DATA_MARK,
    MARK_PROLOGUE,
};
use crate::resolver::{Persist, ResolveError};
use crate::session::{HostBus, SessionContext};
use crate::timing::BitSeparator;
use log::{debug, trace, warn};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecoderState {
    Unsynced,
    Mark1,
    Mark2,
    AddressField,
    DataField,
}

/// Outcome of one write burst.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BurstReport {
    pub written: u32,
    pub failed: u32,
}

impl BurstReport {
    fn record(&mut self, result: Result<(), ResolveError>) {
        match result {
            Ok(()) => self.written += 1,
            Err(e) => {
                warn!("write back lost: {}", e);
                self.failed += 1;
            }
        }
    }
}

/// Something the decoder finished assembling.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Field {
    Address(AddressField),
    Data,
}

/**
Turns the host's write bit stream back into address and data fields.

 Bytes are framed by the `D5` sync mark: until it shows up the shift
 register is checked after every bit, afterwards every 8 bits make a
 byte. Anything unexpected after the mark drops back to hunting for it.
*/
pub struct WriteDecoder {
    state: DecoderState,
    shift: u8,
    bits: u8,
    buffer: [u8; WRITE_BUFFER_SIZE],
    len: usize,
    remaining: usize,
    address: Option<AddressField>,
    volume: u8,
}

impl WriteDecoder {
    pub fn new(volume: u8) -> Self {
        return WriteDecoder {
            state: DecoderState::Unsynced,
            shift: 0,
            bits: 0,
            buffer: [0; WRITE_BUFFER_SIZE],
            len: 0,
            remaining: 0,
            address: None,
            volume,
        };
    }

    pub fn state(&self) -> DecoderState {
        return self.state;
    }

    /// Bytes captured for the field in progress (or the last one).
    pub fn captured(&self) -> &[u8] {
        return &self.buffer[..self.len];
    }

    /// Address field waiting for its data field, if any.
    pub fn pending_address(&self) -> Option<AddressField> {
        return self.address;
    }

    /// Forget everything, including a captured address field.
    pub fn reset(&mut self) {
        self.resync();
        self.len = 0;
        self.address = None;
    }

    fn resync(&mut self) {
        self.state = DecoderState::Unsynced;
        self.shift = 0;
        self.bits = 0;
        self.remaining = 0;
    }

    fn capture(&mut self, state: DecoderState, len: usize) {
        self.state = state;
        self.len = 0;
        self.remaining = len;
    }

    /// Shift in one recovered bit.
    pub fn push_bit(&mut self, bit: bool, ctx: &SessionContext) -> Option<Field> {
        self.shift = (self.shift << 1) | bit as u8;

        if self.state == DecoderState::Unsynced {
            if self.shift == MARK_PROLOGUE[0] {
                self.state = DecoderState::Mark1;
                self.bits = 0;
            }
            return None;
        }

        self.bits += 1;
        if self.bits < 8 {
            return None;
        }
        self.bits = 0;

        return self.push_byte(self.shift, ctx);
    }

    fn push_byte(&mut self, byte: u8, ctx: &SessionContext) -> Option<Field> {
        match self.state {
            DecoderState::Unsynced => {}
            DecoderState::Mark1 => {
                if byte == MARK_PROLOGUE[1] {
                    self.state = DecoderState::Mark2;
                } else {
                    trace!("lost sync after D5: {:02X}", byte);
                    self.resync();
                }
            }
            DecoderState::Mark2 => match byte {
                ADDRESS_MARK => {
                    // Address fields are only ever written when formatting
                    ctx.set_formatting(true);
                    self.capture(DecoderState::AddressField, ADDRESS_BODY_LEN);
                }
                DATA_MARK => {
                    self.capture(DecoderState::DataField, DATA_BODY_LEN);
                }
                _ => {
                    trace!("unknown field mark D5 AA {:02X}", byte);
                    self.resync();
                }
            },
            DecoderState::AddressField | DecoderState::DataField => {
                self.buffer[self.len] = byte;
                self.len += 1;
                self.remaining -= 1;
                if self.remaining > 0 {
                    return None;
                }

                let state = self.state;
                self.resync();
                if state == DecoderState::DataField {
                    return Some(Field::Data);
                }

                let Some(address) = AddressField::decode(&self.buffer[..self.len]) else {
                    return None;
                };
                trace!(
                    "address field v:{:02X} t:{} s:{}",
                    address.volume,
                    address.track,
                    address.sector
                );
                self.address = Some(address);
                return Some(Field::Address(address));
            }
        }

        return None;
    }

    /// Header the next write-back goes to.
    fn target(&self, ctx: &SessionContext) -> AddressField {
        if let Some(address) = self.address {
            return address;
        }
        return AddressField::new(self.volume, ctx.disk_track(), ctx.sector);
    }

    /**
    Store the captured data field. A preceding address field names the
     target; without one the sector under the head is used. The cached
     sector is dropped either way so the next read comes from the card.
    */
    pub fn write_back<P: Persist>(
        &mut self,
        ctx: &mut SessionContext,
        sink: &mut P,
    ) -> Result<(), ResolveError> {
        let header = self.target(ctx);
        let image = compose(&header, &self.buffer[..self.len]);

        debug!(
            "write back t:{} s:{} ({} bytes)",
            header.track, header.sector, self.len
        );
        let result = sink.persist(&image, header.track, header.sector);

        if self.address.take().is_some() {
            ctx.sector = header.sector & 0x0F;
        }
        ctx.set_formatting(false);
        ctx.request_refresh();
        self.len = 0;

        return result;
    }

    /**
    Decode one write burst, returning once write-enable drops. A data
     field cut short by the end of the burst is still written back.
     Failed write-backs are logged and counted apart from stored ones.
    */
    pub fn run_burst<B: HostBus, P: Persist>(
        &mut self,
        bus: &mut B,
        ctx: &mut SessionContext,
        sink: &mut P,
    ) -> BurstReport {
        let mut report = BurstReport::default();
        self.resync();

        let level = bus.write_level();
        let mut separator = BitSeparator::new(level, bus.now_ns());

        while bus.write_enabled() {
            let level = bus.write_level();
            let Some(bit) = separator.sample(level, bus.now_ns()) else {
                continue;
            };

            if let Some(Field::Data) = self.push_bit(bit, ctx) {
                report.record(self.write_back(ctx, sink));
            }
        }

        if self.state == DecoderState::DataField {
            debug!("burst ended {} bytes into a data field", self.len);
            self.resync();
            report.record(self.write_back(ctx, sink));
        }

        return report;
    }
}

impl Default for WriteDecoder {
    fn default() -> Self {
        return Self::new(VOLUME);
    }
}
