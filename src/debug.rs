use core::fmt::{self, Write};
use log::{Level, LevelFilter, Log, Metadata, Record};
use teensycore::prelude::*;

const LINE_MAX: usize = 96;

/// Formats one record on the stack. Long lines are cut.
struct Line {
    buf: [u8; LINE_MAX],
    len: usize,
}

impl Write for Line {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let take = s.len().min(LINE_MAX - self.len);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        return Ok(());
    }
}

/// Sends log records out the teensycore debug serial channel.
pub struct DebugLogger;

static LOGGER: DebugLogger = DebugLogger;

impl Log for DebugLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        return metadata.level() <= log::max_level();
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let tag = match record.level() {
            Level::Error => "E",
            Level::Warn => "W",
            Level::Info => "I",
            Level::Debug => "D",
            Level::Trace => "T",
        };

        let mut line = Line {
            buf: [0; LINE_MAX],
            len: 0,
        };
        let _ = write!(line, "[{}] {}", tag, record.args());
        debug_str(&line.buf[..line.len]);
    }

    fn flush(&self) {}
}

pub fn init(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
