use crate::storage::*;
use log::{debug, warn};

const CMD_GO_IDLE_STATE: u8 = 0;
const CMD_SEND_IF_COND: u8 = 8;
const CMD_SET_BLOCKLEN: u8 = 16;
const CMD_READ_SINGLE_BLOCK: u8 = 17;
const CMD_WRITE_BLOCK: u8 = 24;
const CMD_APP_CMD: u8 = 55;
const CMD_READ_OCR: u8 = 58;
const ACMD_SD_SEND_OP_COND: u8 = 41;

const R1_IDLE: u8 = 1 << 0;
const R1_ILLEGAL_CMD: u8 = 1 << 2;

pub const DATA_START_TOKEN: u8 = 0xFE;
const DATA_ACCEPTED: u8 = 0x05;

/// Pin level access to the card socket.
pub trait SdPins {
    fn clk(&mut self, high: bool);
    fn mosi(&mut self, high: bool);
    fn miso(&mut self) -> bool;
    /// Raw CS level. Low selects the card.
    fn cs(&mut self, high: bool);
    /// Hand the pins to (or take them back from) the hardware shifter.
    fn enable_shifter(&mut self, on: bool);
    /// Full duplex byte through the hardware shifter.
    fn shift(&mut self, byte: u8) -> u8;
    fn delay_us(&mut self, us: u32);

    fn shifter_busy(&self) -> bool {
        return false;
    }

    fn shifter_reset(&mut self) {}
}

/// Byte channel over `SdPins`, dispatching on the selected link mode.
pub struct SdLink<P: SdPins> {
    pins: P,
    mode: LinkMode,
}

impl<P: SdPins> SdLink<P> {
    pub fn new(pins: P) -> Self {
        let mut link = SdLink {
            pins,
            mode: LinkMode::BitbangSlow,
        };
        link.set_mode(LinkMode::BitbangSlow, false);
        return link;
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn pins(&mut self) -> &mut P {
        return &mut self.pins;
    }

    fn bitbang_read(&mut self, slow: bool) -> u8 {
        let mut c: u8 = 0;

        self.pins.mosi(true);
        if slow {
            self.pins.delay_us(4);
        }

        for _ in 0..8 {
            self.pins.clk(true);
            c = (c << 1) | self.pins.miso() as u8;
            if slow {
                self.pins.delay_us(4);
            }
            self.pins.clk(false);
            if slow {
                self.pins.delay_us(4);
            }
        }

        return c;
    }

    fn bitbang_write(&mut self, c: u8, slow: bool) {
        let mut mask: u8 = 0x80;
        while mask != 0 {
            self.pins.mosi(c & mask != 0);
            if slow {
                self.pins.delay_us(4);
            }
            self.pins.clk(true);
            if slow {
                self.pins.delay_us(4);
            }
            self.pins.clk(false);
            mask >>= 1;
        }

        if !slow {
            self.pins.mosi(false);
        }
    }
}

impl<P: SdPins> ByteChannel for SdLink<P> {
    fn set_mode(&mut self, mode: LinkMode, chip_select: bool) {
        self.mode = mode;
        match mode {
            LinkMode::BlockTransfer => {
                self.pins.enable_shifter(true);
                self.chip_select(false);
            }
            LinkMode::BitbangSlow | LinkMode::BitbangFast => {
                self.pins.enable_shifter(false);
                self.chip_select(chip_select);
            }
        }
    }

    fn mode(&self) -> LinkMode {
        return self.mode;
    }

    fn read_byte(&mut self) -> u8 {
        return match self.mode {
            LinkMode::BlockTransfer => self.pins.shift(0xFF),
            LinkMode::BitbangSlow => self.bitbang_read(true),
            LinkMode::BitbangFast => self.bitbang_read(false),
        };
    }

    fn write_byte(&mut self, byte: u8) {
        match self.mode {
            LinkMode::BlockTransfer => {
                self.pins.shift(byte);
            }
            LinkMode::BitbangSlow => self.bitbang_write(byte, true),
            LinkMode::BitbangFast => self.bitbang_write(byte, false),
        }
    }

    fn chip_select(&mut self, selected: bool) {
        self.pins.cs(!selected);
    }

    fn transfer_busy(&self) -> bool {
        return self.pins.shifter_busy();
    }

    fn reset_transfer(&mut self) {
        self.pins.shifter_reset();
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CardType {
    Sd1,
    Sd2,
    Sdhc,
}

/// SPI mode SD card protocol on top of a byte channel.
pub struct SdCard<C: ByteChannel> {
    link: C,
    card_type: CardType,
    // One block kept around for small reads (FAT, directory entries)
    offset_cache: Block,
    offset_cache_block: Option<u32>,
}

impl<C: ByteChannel> SdCard<C> {
    pub fn new(link: C) -> Self {
        return SdCard {
            link,
            card_type: CardType::Sd1,
            offset_cache: [0u8; BLOCK_SIZE],
            offset_cache_block: None,
        };
    }

    pub fn card_type(&self) -> CardType {
        return self.card_type;
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn link(&mut self) -> &mut C {
        return &mut self.link;
    }

    pub fn command(&mut self, command: u8, argument: u32) -> u8 {
        // Give the card a few clocks first
        self.link.read_byte();
        self.link.write_byte(command | 0x40);
        for b in argument.to_be_bytes() {
            self.link.write_byte(b);
        }

        let crc = match command {
            CMD_GO_IDLE_STATE => 0x95,
            CMD_SEND_IF_COND => 0x87,
            _ => 0xFF,
        };
        self.link.write_byte(crc);

        let mut status = 0xFF;
        for _ in 0..20 {
            status = self.link.read_byte();
            if status & 0x80 == 0 {
                break;
            }
        }

        return status;
    }

    pub fn app_command(&mut self, command: u8, argument: u32) -> u8 {
        self.command(CMD_APP_CMD, 0);
        return self.command(command, argument);
    }

    /// Clock the card until it sends something other than 0xFF.
    /// A timeout of 0 means "a long time".
    pub fn wait_for_data_token(&mut self, timeout: u16) -> u8 {
        let timeout = if timeout == 0 { 0xFFFF } else { timeout };
        let mut status = 0xFF;

        for _ in 0..timeout {
            status = self.link.read_byte();
            if status != 0xFF {
                break;
            }
        }

        return status;
    }

    fn wait_for_status(&mut self, command: u8, argument: u32, status: u8, app: bool) -> bool {
        for _ in 0..200 {
            let r1 = match app {
                true => self.app_command(command, argument),
                false => self.command(command, argument),
            };
            if r1 == status {
                return true;
            }
        }
        return false;
    }

    /**
    Bring the card into SPI mode and find out how it is addressed.
     Runs on the slow bit-banged link and leaves the link in block
     transfer mode on success.
    */
    pub fn init(&mut self) -> Result<CardType, StorageError> {
        self.link.set_mode(LinkMode::BitbangSlow, false);
        self.offset_cache_block = None;

        // At least 74 clocks with CS high, then some with CS low
        for _ in 0..200 {
            self.link.read_byte();
        }
        self.link.chip_select(true);
        for _ in 0..75 {
            self.link.read_byte();
        }

        let result = self.negotiate();
        self.link.chip_select(false);

        match result {
            Ok(card_type) => {
                debug!("sd card type {:?}", card_type);
                self.card_type = card_type;
                self.link.set_mode(LinkMode::BlockTransfer, false);
                return Ok(card_type);
            }
            Err(e) => {
                warn!("sd card init failed: {}", e);
                return Err(e);
            }
        }
    }

    fn negotiate(&mut self) -> Result<CardType, StorageError> {
        if !self.wait_for_status(CMD_GO_IDLE_STATE, 0, R1_IDLE, false) {
            return Err(StorageError::NoResponse(CMD_GO_IDLE_STATE));
        }

        let mut card_type = CardType::Sd1;
        if self.command(CMD_SEND_IF_COND, 0x1AA) & R1_ILLEGAL_CMD == 0 {
            self.link.read_byte();
            self.link.read_byte();
            // 2.7-3.6V range, then the echoed check pattern
            if self.link.read_byte() & 0x01 == 0 {
                return Err(StorageError::Init);
            }
            if self.link.read_byte() != 0xAA {
                return Err(StorageError::Init);
            }
            card_type = CardType::Sd2;
        }

        let hcs = match card_type {
            CardType::Sd2 => 0x4000_0000,
            _ => 0,
        };
        if !self.wait_for_status(ACMD_SD_SEND_OP_COND, hcs, 0x00, true) {
            return Err(StorageError::NoResponse(ACMD_SD_SEND_OP_COND));
        }

        if card_type == CardType::Sd2 {
            let status = self.command(CMD_READ_OCR, 0);
            if status != 0 {
                return Err(StorageError::Rejected {
                    command: CMD_READ_OCR,
                    status,
                });
            }
            if self.link.read_byte() & 0x40 != 0 {
                card_type = CardType::Sdhc;
            }
            self.link.read_byte();
            self.link.read_byte();
            self.link.read_byte();
        } else {
            let status = self.command(CMD_SET_BLOCKLEN, BLOCK_SIZE as u32);
            if status != 0 {
                return Err(StorageError::Rejected {
                    command: CMD_SET_BLOCKLEN,
                    status,
                });
            }
        }

        return Ok(card_type);
    }

    fn address_of(&self, block: u32) -> u32 {
        return match self.card_type {
            CardType::Sdhc => block,
            _ => block * BLOCK_SIZE as u32,
        };
    }

    fn read_block_selected(&mut self, block: u32, buf: &mut Block) -> Result<(), StorageError> {
        let status = self.command(CMD_READ_SINGLE_BLOCK, self.address_of(block));
        if status != 0 {
            return Err(StorageError::Rejected {
                command: CMD_READ_SINGLE_BLOCK,
                status,
            });
        }

        let token = self.wait_for_data_token(0);
        if token != DATA_START_TOKEN {
            return Err(StorageError::NoDataToken(token));
        }

        for b in buf.iter_mut() {
            *b = self.link.read_byte();
        }

        // CRC
        self.link.read_byte();
        self.link.read_byte();

        return Ok(());
    }

    fn write_block_selected(&mut self, block: u32, buf: &Block) -> Result<(), StorageError> {
        let status = self.command(CMD_WRITE_BLOCK, self.address_of(block));
        if status != 0 {
            return Err(StorageError::Rejected {
                command: CMD_WRITE_BLOCK,
                status,
            });
        }

        self.link.write_byte(0xFF);
        self.link.write_byte(DATA_START_TOKEN);
        for b in buf.iter() {
            self.link.write_byte(*b);
        }
        self.link.write_byte(0xFF);
        self.link.write_byte(0xFF);

        let response = self.link.read_byte();
        if response & 0x1F != DATA_ACCEPTED {
            return Err(StorageError::WriteRejected(response));
        }

        // Busy while the card holds the line low
        for _ in 0..0xFFFF {
            if self.link.read_byte() != 0x00 {
                break;
            }
        }

        return Ok(());
    }
}

impl<C: ByteChannel> BlockStorage for SdCard<C> {
    fn read_block(&mut self, block: u32, buf: &mut Block) -> Result<(), StorageError> {
        self.link.chip_select(true);
        let result = self.read_block_selected(block, buf);
        self.link.chip_select(false);
        return result;
    }

    fn write_block(&mut self, block: u32, buf: &Block) -> Result<(), StorageError> {
        if self.offset_cache_block == Some(block) {
            self.offset_cache_block = None;
        }

        self.link.chip_select(true);
        let result = self.write_block_selected(block, buf);
        self.link.chip_select(false);
        return result;
    }

    fn read_offset(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        let block = offset / BLOCK_SIZE as u32;

        if self.offset_cache_block != Some(block) {
            let mut cache = [0u8; BLOCK_SIZE];
            self.read_block(block, &mut cache)?;
            self.offset_cache = cache;
            self.offset_cache_block = Some(block);
        }

        let start = offset as usize % BLOCK_SIZE;
        let end = (start + buf.len()).min(BLOCK_SIZE);
        buf[..end - start].copy_from_slice(&self.offset_cache[start..end]);
        return Ok(());
    }

    fn set_mode(&mut self, mode: LinkMode) {
        let selected = mode == LinkMode::BitbangFast;
        self.link.set_mode(mode, selected);
    }

    fn transfer_busy(&self) -> bool {
        return self.link.transfer_busy();
    }

    fn reset_transfer(&mut self) {
        self.link.reset_transfer();
        self.link.chip_select(false);
    }
}
