#![cfg_attr(feature = "firmware", allow(internal_features))]
#![cfg_attr(feature = "firmware", feature(lang_items))]
#![cfg_attr(feature = "firmware", no_std)]

pub mod cache;
pub mod config;
pub mod fat;
pub mod irq;
pub mod nic;
pub mod reader;
pub mod resolver;
pub mod sdcard;
pub mod session;
pub mod stepper;
pub mod storage;
pub mod timing;
pub mod writer;

#[cfg(any(test, feature = "testing"))]
pub mod mock;

#[cfg(feature = "firmware")]
mod debug;
#[cfg(feature = "firmware")]
mod hw;

#[cfg(feature = "firmware")]
mod firmware {
    use crate::config::DriveConfig;
    use crate::fat::FatVolume;
    use crate::hw::*;
    use crate::resolver::Resolver;
    use crate::sdcard::{SdCard, SdLink};
    use crate::session::FloppySession;
    use log::{error, info, LevelFilter};
    use teensycore::prelude::*;

    fn halt(message: &[u8]) -> ! {
        loop {
            debug_str(message);
            wait_exact_ns(MS_TO_NANO * 5000);
        }
    }

    pub fn start() -> ! {
        init_pins();
        crate::debug::init(LevelFilter::Info);

        let mut card = SdCard::new(SdLink::new(TeensySdPins));
        match card.init() {
            Ok(kind) => info!("card up: {:?}", kind),
            Err(e) => {
                error!("card init: {}", e);
                halt(b"No SD card");
            }
        }

        let volume = match FatVolume::mount(&mut card) {
            Ok(volume) => volume,
            Err(e) => {
                error!("mount: {}", e);
                halt(b"No FAT16 volume");
            }
        };

        let entry = match volume.find_file(&mut card, b"NIC") {
            Ok(Some(entry)) => entry,
            _ => halt(b"No NIC image"),
        };

        let mut session = FloppySession::new(
            Resolver::new(card, &CACHE),
            &READ_STATE,
            TeensyIrq,
            DriveConfig::default(),
        );
        if let Err(e) = session.insert(&volume, entry) {
            error!("select: {}", e);
            halt(b"Bad NIC image");
        }

        start_read_timer();
        let mut bus = TeensyBus;
        loop {
            session.run(&mut bus);
        }
    }
}

#[cfg(feature = "firmware")]
teensycore::main!({
    firmware::start();
});
