use crate::config::TRACK_MAX;

/// Quarter step offset for a phase pattern, if exactly one coil is on.
pub fn phase_offset(phases: u8) -> Option<u8> {
    return match phases & 0x0F {
        0b0001 => Some(0),
        0b0010 => Some(1),
        0b0100 => Some(2),
        0b1000 => Some(3),
        _ => None,
    };
}

/**
Follows the head stepper. Energizing the next coil in sequence moves the
 head one half track in, the previous coil one half track out. Anything
 that is not a single coil is ignored.
*/
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StepperTracker {
    offset: u8,
}

impl StepperTracker {
    pub fn new() -> Self {
        return StepperTracker { offset: 0 };
    }

    pub fn offset(&self) -> u8 {
        return self.offset;
    }

    /// Feed one phase sample, moving `track` as needed.
    pub fn poll(&mut self, phases: u8, track: &mut u8) {
        let Some(offset) = phase_offset(phases) else {
            return;
        };

        if offset == self.offset {
            return;
        }

        let mut next = *track as i16;
        if offset == (self.offset + 1) & 0x3 {
            next += 1;
        } else if offset == (self.offset + 3) & 0x3 {
            next -= 1;
        }
        self.offset = offset;

        *track = next.clamp(0, TRACK_MAX as i16) as u8;
    }

    pub fn reset(&mut self) {
        self.offset = 0;
    }
}

#[cfg(test)]
mod test_stepper {
    use super::*;

    const FORWARD: [u8; 4] = [0b0010, 0b0100, 0b1000, 0b0001];

    #[test]
    fn only_single_coils_count() {
        assert_eq!(phase_offset(0b0001), Some(0));
        assert_eq!(phase_offset(0b1000), Some(3));
        assert_eq!(phase_offset(0b0000), None);
        assert_eq!(phase_offset(0b0011), None);
        assert_eq!(phase_offset(0b1111), None);
        // Upper bits are not phase lines
        assert_eq!(phase_offset(0b1010_0100), Some(2));
    }

    #[test]
    fn forward_rotation_steps_in() {
        let mut stepper = StepperTracker::new();
        let mut track = 0;
        for i in 0..20 {
            stepper.poll(FORWARD[i % 4], &mut track);
            assert_eq!(track as usize, i + 1);
        }
    }

    #[test]
    fn reverse_rotation_steps_out() {
        let mut stepper = StepperTracker::new();
        let mut track = 10;
        let reverse = [0b1000, 0b0100, 0b0010, 0b0001];
        for i in 0..10 {
            stepper.poll(reverse[i % 4], &mut track);
            assert_eq!(track as usize, 9 - i);
        }
        // Pinned at the end stop
        for i in 0..8 {
            stepper.poll(reverse[(i + 2) % 4], &mut track);
            assert_eq!(track, 0);
        }
    }

    #[test]
    fn clamps_at_last_track() {
        let mut stepper = StepperTracker::new();
        let mut track = TRACK_MAX - 2;
        for i in 0..8 {
            stepper.poll(FORWARD[i % 4], &mut track);
        }
        assert_eq!(track, TRACK_MAX);
    }

    #[test]
    fn repeats_and_noise_do_nothing() {
        let mut stepper = StepperTracker::new();
        let mut track = 30;
        for phases in [0b0001, 0b0001, 0b0000, 0b0011, 0b0110, 0b1111, 0b0001] {
            stepper.poll(phases, &mut track);
        }
        assert_eq!(track, 30);
        assert_eq!(stepper.offset(), 0);
    }

    #[test]
    fn opposite_coil_only_resyncs() {
        let mut stepper = StepperTracker::new();
        let mut track = 12;
        stepper.poll(0b0100, &mut track);
        assert_eq!(track, 12);
        assert_eq!(stepper.offset(), 2);
        // The following step counts from the new position
        stepper.poll(0b1000, &mut track);
        assert_eq!(track, 13);
    }

    #[test]
    fn noise_between_steps_is_transparent() {
        let mut stepper = StepperTracker::new();
        let mut track = 0;
        for phases in [0b0011, 0b0010, 0b0110, 0b0000, 0b0100] {
            stepper.poll(phases, &mut track);
        }
        assert_eq!(track, 2);
    }
}
