// Host interface pins (Apple II side of the 20 pin ribbon)
pub static PHASE0_PIN: usize = 14;
pub static PHASE1_PIN: usize = 15;
pub static PHASE2_PIN: usize = 16;
pub static PHASE3_PIN: usize = 17;
pub static WRITE_ENABLE_PIN: usize = 18;
pub static DRIVE_ENABLE_PIN: usize = 19;
pub static WRITE_DATA_PIN: usize = 20;
pub static READ_DATA_PIN: usize = 21;
pub static WRITE_PROTECT_PIN: usize = 22;

// SD card pins. Bit-banged, so any GPIO will do.
pub static SD_CS_PIN: usize = 10;
pub static SD_MOSI_PIN: usize = 11;
pub static SD_MISO_PIN: usize = 12;
pub static SD_CLK_PIN: usize = 13;

/*
 Informationally, a 5.25" Disk II diskette has the following features:

 35 tracks (70 half-track stepper positions)
 16 sectors (per track)
 256 bytes (per sector, 343 bytes once 6-and-2 encoded)
 1 side
*/

/// Highest half-track position the head can reach.
pub const TRACK_MAX: u8 = 69;
pub const SECTORS_PER_TRACK: u8 = 16;
/// Clusters remembered for the selected image. Longer files are truncated.
pub const CHAIN_CAPACITY: usize = 150;
/// Volume number written in synthesized address fields.
pub const VOLUME: u8 = 0xFE;
/// Enough for the data field marker, payload and trailer.
pub const WRITE_BUFFER_SIZE: usize = 350;

/// Runtime knobs for one emulated drive.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DriveConfig {
    /// When false, write bursts from the host are ignored entirely.
    pub write_capable: bool,
    /// Level driven on the write-protect line.
    pub write_protect: bool,
    pub volume: u8,
}

impl Default for DriveConfig {
    fn default() -> Self {
        return DriveConfig {
            write_capable: true,
            write_protect: false,
            volume: VOLUME,
        };
    }
}
