//! Guest-shared event words.
//!
//! Each port owns one 32-bit word inside a page donated by the guest. The guest
//! reads and writes these words concurrently without trapping, so the
//! hypervisor never uses plain loads and stores on them: every update is an
//! atomic fetch-or, fetch-and or compare-and-swap.
//!
//! Layout: `[PENDING | MASKED | LINKED | BUSY | reserved(11) | LINK(17)]`

use core::sync::atomic::{AtomicU32, Ordering};

use crate::abi::{
    EVTCHN_FIFO_BUSY, EVTCHN_FIFO_LINK_MASK, EVTCHN_FIFO_LINKED, EVTCHN_FIFO_MASKED,
    EVTCHN_FIFO_PENDING, Port,
};

/// Number of CAS attempts made while the tail word is held `BUSY`.
///
/// With `BUSY` set the guest can only clear `PENDING` or `LINKED` or toggle
/// `MASKED`, so the exchange cannot keep failing.
const LINK_RETRIES: usize = 4;

/// Outcome of one attempt at writing the `LINK` field of a tail word.
enum LinkAttempt {
    /// The tail is no longer `LINKED`; the guest already consumed it.
    Unlinked,
    /// `LINK` now names the new port.
    Linked,
    /// The guest changed the word between our load and the exchange.
    Raced,
}

/// One FIFO event word.
#[repr(transparent)]
pub struct EventWord(AtomicU32);

impl EventWord {
    /// Creates a word holding `bits`.
    pub const fn new(bits: u32) -> Self {
        Self(AtomicU32::new(bits))
    }

    /// Reads the raw word.
    #[inline]
    pub fn load(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    fn test_bit(&self, bit: u32) -> bool {
        self.load() & (1 << bit) != 0
    }

    /// Sets `bit`, returning its previous value.
    #[inline]
    fn set_bit(&self, bit: u32) -> bool {
        self.0.fetch_or(1 << bit, Ordering::AcqRel) & (1 << bit) != 0
    }

    #[inline]
    fn clear_bit(&self, bit: u32) {
        self.0.fetch_and(!(1 << bit), Ordering::AcqRel);
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.test_bit(EVTCHN_FIFO_PENDING)
    }

    #[inline]
    pub fn is_masked(&self) -> bool {
        self.test_bit(EVTCHN_FIFO_MASKED)
    }

    #[inline]
    pub fn is_linked(&self) -> bool {
        self.test_bit(EVTCHN_FIFO_LINKED)
    }

    #[inline]
    pub fn is_busy(&self) -> bool {
        self.test_bit(EVTCHN_FIFO_BUSY)
    }

    /// Marks the event as fired.
    #[inline]
    pub fn set_pending(&self) {
        self.set_bit(EVTCHN_FIFO_PENDING);
    }

    #[inline]
    pub fn set_masked(&self) {
        self.set_bit(EVTCHN_FIFO_MASKED);
    }

    #[inline]
    pub fn clear_masked(&self) {
        self.clear_bit(EVTCHN_FIFO_MASKED);
    }

    /// Sets `LINKED`; returns `true` if it was already set.
    #[inline]
    pub fn test_and_set_linked(&self) -> bool {
        self.set_bit(EVTCHN_FIFO_LINKED)
    }

    /// The next port in the queue, or 0 at the end.
    #[inline]
    pub fn link(&self) -> Port {
        self.load() & EVTCHN_FIFO_LINK_MASK
    }

    fn attempt_link(&self, current: &mut u32, port: Port) -> LinkAttempt {
        if *current & (1 << EVTCHN_FIFO_LINKED) == 0 {
            return LinkAttempt::Unlinked;
        }

        // Writing LINK also drops BUSY.
        let mask = (1 << EVTCHN_FIFO_BUSY) | EVTCHN_FIFO_LINK_MASK;
        let want = (*current & !mask) | (port & EVTCHN_FIFO_LINK_MASK);

        match self
            .0
            .compare_exchange(*current, want, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => LinkAttempt::Linked,
            Err(actual) => {
                *current = actual;
                LinkAttempt::Raced
            }
        }
    }

    /// Points this (tail) word at `port`, but only while it is still `LINKED`.
    ///
    /// Returns `false` if the guest consumed the tail first, in which case the
    /// caller must publish `port` as the new queue head instead.
    pub fn set_link(&self, port: Port) -> bool {
        let mut current = self.load();
        match self.attempt_link(&mut current, port) {
            LinkAttempt::Unlinked => return false,
            LinkAttempt::Linked => return true,
            LinkAttempt::Raced => {}
        }

        // Block guest unmasking while we retry.
        self.set_bit(EVTCHN_FIFO_BUSY);
        current = self.load();

        for _ in 0..LINK_RETRIES {
            match self.attempt_link(&mut current, port) {
                LinkAttempt::Unlinked => {
                    self.clear_bit(EVTCHN_FIFO_BUSY);
                    return false;
                }
                LinkAttempt::Linked => return true,
                LinkAttempt::Raced => {}
            }
        }

        warn!("evtchn: failed to link port {} after {} attempts", port, LINK_RETRIES);
        self.clear_bit(EVTCHN_FIFO_BUSY);
        true
    }
}

impl core::fmt::Debug for EventWord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let bits = self.load();
        f.debug_struct("EventWord")
            .field("pending", &(bits & (1 << EVTCHN_FIFO_PENDING) != 0))
            .field("masked", &(bits & (1 << EVTCHN_FIFO_MASKED) != 0))
            .field("linked", &(bits & (1 << EVTCHN_FIFO_LINKED) != 0))
            .field("busy", &(bits & (1 << EVTCHN_FIFO_BUSY) != 0))
            .field("link", &(bits & EVTCHN_FIFO_LINK_MASK))
            .finish()
    }
}

#[cfg(test)]
impl EventWord {
    /// Unlinks the word the way a guest consumer does and returns the next port.
    pub(crate) fn guest_consume(&self) -> Port {
        let consumed = (1 << EVTCHN_FIFO_LINKED) | (1 << EVTCHN_FIFO_PENDING) | EVTCHN_FIFO_LINK_MASK;
        self.0.fetch_and(!consumed, Ordering::AcqRel) & EVTCHN_FIFO_LINK_MASK
    }
}

const _: () = assert!(core::mem::size_of::<EventWord>().is_power_of_two());
