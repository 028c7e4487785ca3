//! Domain lifecycle with atomic state and reference tracking.
//!
//! Cross-domain operations take a reference on the remote domain for the whole
//! access. Teardown must not free a domain's event tables while such a
//! reference is outstanding, and no new reference may be taken once teardown
//! has started.
//!
//! # Design
//!
//! A single `AtomicU32` stores both the state and the reference count, so the
//! "is it alive" check and the increment happen in one CAS.
//!
//! Layout: `[state(8 bits) | ref_count(24 bits)]`

use core::sync::atomic::{AtomicU32, Ordering};

/// Domain lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DomainState {
    /// Domain is running and can be referenced.
    Running = 0,
    /// Domain is being torn down, new references are refused.
    Dying = 1,
    /// Teardown finished.
    Dead = 2,
}

/// Combined state and reference count in a single atomic value.
#[derive(Default)]
pub struct StateAndCount(AtomicU32);

impl StateAndCount {
    const STATE_SHIFT: u32 = 24;
    const COUNT_MASK: u32 = (1 << Self::STATE_SHIFT) - 1;
    const STATE_RUNNING: u32 = DomainState::Running as u32;
    const STATE_DYING: u32 = DomainState::Dying as u32;
    const STATE_DEAD: u32 = DomainState::Dead as u32;

    pub const fn new() -> Self {
        Self(AtomicU32::new(Self::STATE_RUNNING << Self::STATE_SHIFT))
    }

    fn decode(state: u32) -> DomainState {
        match state {
            Self::STATE_RUNNING => DomainState::Running,
            Self::STATE_DYING => DomainState::Dying,
            _ => DomainState::Dead,
        }
    }

    #[inline]
    pub fn state(&self) -> DomainState {
        Self::decode(self.0.load(Ordering::Acquire) >> Self::STATE_SHIFT)
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.0.load(Ordering::Acquire) & Self::COUNT_MASK
    }

    /// Takes a reference if the domain is still running.
    ///
    /// Returns `Err(state)` if it is not, or if the count would overflow.
    #[inline]
    pub fn try_acquire(&self) -> Result<(), DomainState> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let state = current >> Self::STATE_SHIFT;
            if state != Self::STATE_RUNNING {
                return Err(Self::decode(state));
            }

            let count = current & Self::COUNT_MASK;
            if count == Self::COUNT_MASK {
                return Err(DomainState::Running);
            }

            match self.0.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    #[inline]
    pub fn release(&self) {
        let previous = self.0.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous & Self::COUNT_MASK != 0, "domain reference underflow");
    }

    /// Moves to `Dying`, returning the references still held.
    pub fn set_dying(&self) -> u32 {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let count = current & Self::COUNT_MASK;
            let new_value = (Self::STATE_DYING << Self::STATE_SHIFT) | count;
            match self.0.compare_exchange_weak(
                current,
                new_value,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return count,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn set_dead(&self) {
        self.0.store(Self::STATE_DEAD << Self::STATE_SHIFT, Ordering::Release);
    }
}

/// Tracks whether a domain may be referenced and how many references are live.
///
/// ```text
/// ┌─────────┐  begin_teardown()  ┌───────┐  wait_idle()   ┌──────┐
/// │ Running │ ─────────────────> │ Dying │ ─────────────> │ Dead │
/// └─────────┘                    └───────┘                └──────┘
/// ```
pub struct DomainLifecycle {
    state_count: StateAndCount,
}

impl DomainLifecycle {
    pub const fn new() -> Self {
        Self {
            state_count: StateAndCount::new(),
        }
    }

    #[inline]
    pub fn state(&self) -> DomainState {
        self.state_count.state()
    }

    /// Number of references currently held.
    #[inline]
    pub fn references(&self) -> usize {
        self.state_count.count() as usize
    }

    /// Takes a reference. Fails once teardown has begun.
    #[inline]
    pub fn try_get(&self) -> bool {
        self.state_count.try_acquire().is_ok()
    }

    /// Drops a reference taken with [`try_get`](Self::try_get).
    #[inline]
    pub fn put(&self) {
        self.state_count.release();
    }

    /// Moves to `Dying`. Returns `false` if teardown already began.
    pub fn begin_teardown(&self) -> bool {
        if self.state() != DomainState::Running {
            return false;
        }
        let held = self.state_count.set_dying();
        debug!("domain teardown started with {} references held", held);
        true
    }

    /// Waits until every reference has been put.
    pub fn wait_idle(&self) {
        while self.state_count.count() != 0 {
            core::hint::spin_loop();
        }
    }

    /// Marks teardown finished. Call after [`wait_idle`](Self::wait_idle).
    pub fn complete_teardown(&self) {
        self.state_count.set_dead();
    }
}

impl Default for DomainLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for DomainLifecycle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DomainLifecycle")
            .field("state", &self.state())
            .field("references", &self.references())
            .finish()
    }
}
