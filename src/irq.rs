/// Mask/unmask control over the read timer interrupt.
pub trait TimerIrq {
    fn mask(&self);
    fn unmask(&self);
}

impl<T: TimerIrq + ?Sized> TimerIrq for &T {
    fn mask(&self) {
        (**self).mask();
    }

    fn unmask(&self) {
        (**self).unmask();
    }
}

/**
Scoped critical section. The read timer is masked while the guard
 lives, so the interrupt never observes a half-updated cursor.
 Nesting is up to the `TimerIrq` implementation.
*/
pub struct IrqGuard<'a, I: TimerIrq> {
    irq: &'a I,
}

impl<'a, I: TimerIrq> IrqGuard<'a, I> {
    pub fn new(irq: &'a I) -> Self {
        irq.mask();
        return IrqGuard { irq };
    }
}

impl<'a, I: TimerIrq> Drop for IrqGuard<'a, I> {
    fn drop(&mut self) {
        self.irq.unmask();
    }
}

/// Run `f` with the read timer masked.
pub fn with_masked<I: TimerIrq, R>(irq: &I, f: impl FnOnce() -> R) -> R {
    let _guard = IrqGuard::new(irq);
    return f();
}

/// For contexts without a timer (host tools, tests).
#[derive(Copy, Clone, Default, Debug)]
pub struct NoIrq;

impl TimerIrq for NoIrq {
    fn mask(&self) {}
    fn unmask(&self) {}
}

/// Counts nesting depth. Tests use it to check updates happen masked.
#[cfg(any(test, feature = "testing"))]
#[derive(Default, Debug)]
pub struct DepthIrq {
    pub depth: core::cell::Cell<u32>,
    pub masks: core::cell::Cell<u32>,
}

#[cfg(any(test, feature = "testing"))]
impl DepthIrq {
    pub fn masked(&self) -> bool {
        return self.depth.get() > 0;
    }
}

#[cfg(any(test, feature = "testing"))]
impl TimerIrq for DepthIrq {
    fn mask(&self) {
        self.depth.set(self.depth.get() + 1);
        self.masks.set(self.masks.get() + 1);
    }

    fn unmask(&self) {
        self.depth.set(self.depth.get() - 1);
    }
}

#[cfg(test)]
mod test_irq {
    use super::*;

    #[test]
    fn guard_masks_for_its_scope() {
        let irq = DepthIrq::default();
        {
            let _cs = IrqGuard::new(&irq);
            assert!(irq.masked());
            with_masked(&irq, || assert_eq!(irq.depth.get(), 2));
            assert!(irq.masked());
        }
        assert!(!irq.masked());
        assert_eq!(irq.masks.get(), 2);
    }
}
