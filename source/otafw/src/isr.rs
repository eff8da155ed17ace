/// Marks the current context as a receive interrupt handler for as long as the
/// guard lives.
///
/// Serial drivers may enter this before handing bytes to
/// [`ChannelRegistry::on_rx_complete`](crate::serial::ChannelRegistry::on_rx_complete),
/// which enters it again itself, so nesting is expected.
pub struct Isr(());

impl Drop for Isr {
    fn drop(&mut self) {
        level::exit();
    }
}

impl Isr {
    #[must_use]
    #[inline]
    pub fn enter() -> Self {
        level::enter();
        Self(())
    }

    /// Returns `true` while any [`Isr`] guard is alive in this context.
    ///
    /// Blocking serial operations assert this is `false`: busy-waiting on a
    /// ring from inside the interrupt that fills it can never finish.
    #[must_use]
    #[inline]
    pub fn is_in_isr() -> bool {
        Self::level() > 0
    }

    #[must_use]
    #[inline]
    pub(crate) fn level() -> u8 {
        level::get()
    }
}

// Single core, no OS: one counter for the whole system.
#[cfg(not(any(test, feature = "use-std")))]
mod level {
    use portable_atomic::{AtomicU8, Ordering};

    static IN_ISR: AtomicU8 = AtomicU8::new(0);

    pub(super) fn enter() {
        IN_ISR.fetch_add(1, Ordering::Release);
    }

    pub(super) fn exit() {
        IN_ISR.fetch_sub(1, Ordering::Release);
    }

    pub(super) fn get() -> u8 {
        IN_ISR.load(Ordering::Acquire)
    }
}

// Hosted builds run simulated interrupts on their own threads, so the level
// is tracked per thread.
#[cfg(any(test, feature = "use-std"))]
mod level {
    use std::cell::Cell;

    std::thread_local! {
        static IN_ISR: Cell<u8> = const { Cell::new(0) };
    }

    pub(super) fn enter() {
        IN_ISR.with(|l| l.set(l.get() + 1));
    }

    pub(super) fn exit() {
        IN_ISR.with(|l| l.set(l.get() - 1));
    }

    pub(super) fn get() -> u8 {
        IN_ISR.with(Cell::get)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn guards_nest() {
        assert!(!Isr::is_in_isr());
        let outer = Isr::enter();
        assert!(Isr::is_in_isr());
        {
            let _inner = Isr::enter();
            assert_eq!(Isr::level(), 2);
        }
        assert_eq!(Isr::level(), 1);
        drop(outer);
        assert!(!Isr::is_in_isr());
    }
}
