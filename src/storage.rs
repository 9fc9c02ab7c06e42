use thiserror::Error;

/// SD cards are always addressed in 512 byte blocks here.
pub const BLOCK_SIZE: usize = 512;

pub type Block = [u8; BLOCK_SIZE];

#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("card did not answer command {0}")]
    NoResponse(u8),
    #[error("command {command} rejected with status {status:#04x}")]
    Rejected { command: u8, status: u8 },
    #[error("no data token (got {0:#04x})")]
    NoDataToken(u8),
    #[error("write not accepted (response {0:#04x})")]
    WriteRejected(u8),
    #[error("block {0} out of range")]
    OutOfRange(u32),
    #[error("card initialization failed")]
    Init,
}

/**
How bytes move over the card link. Block transfers go through the
 hardware shifter; the bit-banged variants are used for card bring-up
 (slow, under 400kHz) and for single bit streaming (fast).
*/
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LinkMode {
    BlockTransfer,
    BitbangSlow,
    BitbangFast,
}

impl Default for LinkMode {
    fn default() -> Self {
        return LinkMode::BlockTransfer;
    }
}

/// Raw byte transceiver to the card.
pub trait ByteChannel {
    fn set_mode(&mut self, mode: LinkMode, chip_select: bool);
    fn mode(&self) -> LinkMode;
    fn read_byte(&mut self) -> u8;
    fn write_byte(&mut self, byte: u8);
    /// `true` selects the card (drives CS low).
    fn chip_select(&mut self, selected: bool);

    /// Whether a background transfer is still running.
    fn transfer_busy(&self) -> bool {
        return false;
    }

    fn reset_transfer(&mut self) {}
}

/// Block level access used by the FAT walker and the sector resolver.
pub trait BlockStorage {
    fn read_block(&mut self, block: u32, buf: &mut Block) -> Result<(), StorageError>;
    fn write_block(&mut self, block: u32, buf: &Block) -> Result<(), StorageError>;

    /**
    Read `buf.len()` bytes at an absolute byte offset. Only the block
     holding `offset` is fetched, so the range must not cross a block.
    */
    fn read_offset(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        let mut block = [0u8; BLOCK_SIZE];
        self.read_block(offset / BLOCK_SIZE as u32, &mut block)?;
        let start = offset as usize % BLOCK_SIZE;
        let end = (start + buf.len()).min(BLOCK_SIZE);
        buf[..end - start].copy_from_slice(&block[start..end]);
        return Ok(());
    }

    fn set_mode(&mut self, _mode: LinkMode) {}

    /// A block read started by `read_block` has not landed yet.
    fn transfer_busy(&self) -> bool {
        return false;
    }

    /// Drop whatever transfer is in flight.
    fn reset_transfer(&mut self) {}
}
