/*
 Disk II bit cells are 4us long. A "1" is a flux transition somewhere in
 the cell, a "0" is the absence of one. On the read side the timer fires
 once per cell and, for a 1, pulses the read line 3us in:

      /|     /|     /|     /|
     / |    / |    / |    / |
    /  |   /  |   /  |   /  |
   /   |  /   |  /   |  /   |
  /    | /    | /    | /    |
 /     |/     |/     |/     |
      _      _             _
 ____| |____| |___________| |
      1      1      0      1
*/

pub const TICK_NS: u32 = 4_000;
pub const PULSE_OFFSET_NS: u32 = 3_000;

/**
Load value for a down-counting timer that should expire every `ns`
 nanoseconds off a `clock_hz` input. The counter reloads through zero,
 so the period is one count longer than the value.
*/
pub const fn timer_reload(ns: u32, clock_hz: u32) -> u32 {
    let counts = (ns as u64 * clock_hz as u64 / 1_000_000_000) as u32;
    if counts == 0 {
        return 0;
    }
    return counts - 1;
}

/// Output for a single read tick.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Pulse {
    Idle,
    Transition,
}

impl Pulse {
    pub fn is_transition(&self) -> bool {
        return *self == Pulse::Transition;
    }
}

/**
Self-clocking data separator for the write line. A level change
 shifts in a 1 and restarts the window. The window is centered on where
 the next transition is due, so a cell that passes without one shifts
 in a 0 half a cell late, and each following quiet cell adds another.
*/
#[derive(Copy, Clone, Debug)]
pub struct BitSeparator {
    level: bool,
    deadline: u32,
}

impl BitSeparator {
    pub fn new(level: bool, now: u32) -> Self {
        return BitSeparator {
            level,
            deadline: now.wrapping_add(TICK_NS + TICK_NS / 2),
        };
    }

    /// Sample the write line. Returns a recovered bit, if any.
    pub fn sample(&mut self, level: bool, now: u32) -> Option<bool> {
        if level != self.level {
            self.level = level;
            self.deadline = now.wrapping_add(TICK_NS + TICK_NS / 2);
            return Some(true);
        }

        if now.wrapping_sub(self.deadline) as i32 >= 0 {
            self.deadline = self.deadline.wrapping_add(TICK_NS);
            return Some(false);
        }

        return None;
    }
}
