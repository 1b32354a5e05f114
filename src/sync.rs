use core::{
    future::{poll_fn, Future},
    task::Poll,
};

use macro_bits::{bit, check_bit};
use portable_atomic::{AtomicU8, Ordering};

use atomic_waker::AtomicWaker;

/// A group of event bits, which can be set from an interrupt and awaited by tasks.
///
/// Every bit has its own waker, so one task can wait for each bit at the same time.
pub struct EventFlags {
    flags: AtomicU8,
    wakers: [AtomicWaker; Self::COUNT],
}
impl EventFlags {
    const COUNT: usize = 3;
    /// A TX transfer completed.
    pub const TX_DONE: u8 = bit!(0);
    /// A data frame was received.
    pub const RX_DONE: u8 = bit!(1);
    /// A command was received.
    pub const RX_CMD_DONE: u8 = bit!(2);

    pub const fn new() -> Self {
        Self {
            flags: AtomicU8::new(0),
            wakers: [AtomicWaker::new(), AtomicWaker::new(), AtomicWaker::new()],
        }
    }
    /// Set the flags and wake whoever is waiting on them.
    pub fn set(&self, flags: u8) {
        self.flags.fetch_or(flags, Ordering::Release);
        for (index, waker) in self.wakers.iter().enumerate() {
            if check_bit!(flags, bit!(index)) {
                waker.wake();
            }
        }
    }
    pub fn is_set(&self, flag: u8) -> bool {
        check_bit!(self.flags.load(Ordering::Acquire), flag)
    }
    /// Wait for a single flag to become set and clear it.
    pub fn take(&self, flag: u8) -> impl Future<Output = ()> + use<'_> {
        let waker = &self.wakers[flag.trailing_zeros() as usize % Self::COUNT];
        poll_fn(move |cx| {
            // Registering first makes sure, that a flag set right after the check still wakes us.
            waker.register(cx.waker());
            if check_bit!(self.flags.fetch_and(!flag, Ordering::AcqRel), flag) {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
    }
    /// Clear all flags.
    pub fn reset(&self) {
        self.flags.store(0, Ordering::Relaxed);
    }
}
impl Default for EventFlags {
    fn default() -> Self {
        Self::new()
    }
}
