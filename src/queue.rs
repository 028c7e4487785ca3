//! Per-vCPU FIFO event queues.

use core::sync::atomic::{AtomicU32, Ordering};

use arrayvec::ArrayVec;
use memory_addr::PAGE_SIZE_4K;
use spin::Mutex;

use crate::abi::{ControlBlock, EVTCHN_FIFO_MAX_QUEUES, NULL_PORT, Port};
use crate::mem::GuestPage;

/// Hypervisor side of one priority queue.
///
/// The head lives in the guest control block; the tail is private and lets
/// the hypervisor append in O(1).
#[derive(Debug)]
pub struct EventQueue {
    pub priority: u8,
    /// Last port linked on this queue, or 0 if the queue is known empty.
    pub tail: Port,
}

impl EventQueue {
    const fn new(priority: u8) -> Self {
        Self {
            priority,
            tail: NULL_PORT,
        }
    }
}

/// A vCPU's mapped control block plus one queue per priority.
pub struct EventControl {
    page: GuestPage,
    offset: usize,
    queues: [Mutex<EventQueue>; EVTCHN_FIFO_MAX_QUEUES],
}

impl EventControl {
    /// Places the control block at `offset` within `page`.
    pub fn new(page: GuestPage, offset: usize) -> Self {
        debug_assert!(
            offset % 8 == 0 && offset + core::mem::size_of::<ControlBlock>() <= PAGE_SIZE_4K,
            "control block offset {:#x} out of page",
            offset
        );
        Self {
            page,
            offset,
            queues: core::array::from_fn(|priority| Mutex::new(EventQueue::new(priority as u8))),
        }
    }

    /// The guest-shared block.
    pub fn block(&self) -> &ControlBlock {
        self.page.control_block(self.offset)
    }

    pub fn queue(&self, priority: u8) -> &Mutex<EventQueue> {
        &self.queues[priority as usize]
    }

    pub fn head(&self, priority: u8) -> &AtomicU32 {
        &self.block().head[priority as usize]
    }

    /// Sets the ready bit of `priority`; returns whether it was already set.
    pub fn set_ready(&self, priority: u8) -> bool {
        let bit = 1 << priority;
        self.block().ready.fetch_or(bit, Ordering::AcqRel) & bit != 0
    }

    /// Priorities whose ready bit is set, highest priority first.
    pub fn ready_queues(&self) -> ArrayVec<u8, EVTCHN_FIFO_MAX_QUEUES> {
        let ready = self.block().ready.load(Ordering::Acquire);
        (0..EVTCHN_FIFO_MAX_QUEUES as u8)
            .filter(|priority| ready & (1u32 << *priority) != 0)
            .collect()
    }
}

impl core::fmt::Debug for EventControl {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventControl")
            .field("gfn", &self.page.gfn())
            .field("offset", &self.offset)
            .field("ready", &self.ready_queues())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{GuestFrame, HostPage};
    use alloc::boxed::Box;

    fn control(offset: usize) -> EventControl {
        let host: &'static HostPage = Box::leak(Box::new(HostPage::new()));
        EventControl::new(GuestPage::from_host(GuestFrame(3), host), offset)
    }

    #[test]
    fn test_ready_bits() {
        let ctl = control(64);
        assert!(ctl.ready_queues().is_empty());

        assert!(!ctl.set_ready(7));
        assert!(ctl.set_ready(7));
        assert!(!ctl.set_ready(0));
        assert_eq!(ctl.ready_queues().as_slice(), &[0, 7]);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic]
    fn test_misaligned_control_block() {
        control(4);
    }

    #[test]
    fn test_queue_per_priority() {
        let ctl = control(0);
        for priority in 0..EVTCHN_FIFO_MAX_QUEUES as u8 {
            let queue = ctl.queue(priority).lock();
            assert_eq!(queue.priority, priority);
            assert_eq!(queue.tail, NULL_PORT);
        }
        ctl.head(3).store(9, Ordering::Release);
        assert_eq!(ctl.block().head[3].load(Ordering::Acquire), 9);
    }
}
