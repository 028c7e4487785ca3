//! Per-port channel records.

use spin::{Mutex, MutexGuard};

use crate::abi::{
    EVTCHN_FIFO_PRIORITY_DEFAULT, EVTCHNSTAT_CLOSED, EVTCHNSTAT_INTERDOMAIN, EVTCHNSTAT_IPI,
    EVTCHNSTAT_PIRQ, EVTCHNSTAT_UNBOUND, EVTCHNSTAT_VIRQ, Port, VcpuId,
};
use crate::registry::DomId;
use crate::word::EventWord;

/// What a port is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Available for allocation.
    Free,
    /// Held by the hypervisor, never handed to the guest.
    Reserved,
    /// Waiting for `remote` to bind to it.
    Unbound { remote: DomId },
    /// Connected to `port` in domain `remote`.
    Interdomain { remote: DomId, port: Port },
    Pirq(u32),
    Virq(u32),
    Ipi,
}

/// Mutable state of one channel, guarded by the channel lock.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub state: ChannelState,
    pub priority: u8,
    /// Priority of the queue the port was last linked on.
    pub prev_priority: u8,
    /// vCPU the event is delivered to.
    pub vcpu: VcpuId,
    /// vCPU whose queue the port was last linked on.
    pub prev_vcpu: VcpuId,
    pub port: Port,
    /// Raised before the port had an event word.
    pub pending: bool,
}

impl ChannelInfo {
    pub const fn new(port: Port) -> Self {
        Self {
            state: ChannelState::Free,
            priority: EVTCHN_FIFO_PRIORITY_DEFAULT,
            prev_priority: EVTCHN_FIFO_PRIORITY_DEFAULT,
            vcpu: 0,
            prev_vcpu: 0,
            port,
            pending: false,
        }
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.state == ChannelState::Free
    }

    /// Moves a freshly allocated port into `state`.
    ///
    /// `prev_*` are left alone: the word may still sit on the old queue.
    pub(crate) fn claim(&mut self, state: ChannelState) {
        self.state = state;
        self.priority = EVTCHN_FIFO_PRIORITY_DEFAULT;
        self.vcpu = 0;
        self.pending = false;
    }

    /// Returns the record to the free pool.
    pub(crate) fn free(&mut self) {
        self.state = ChannelState::Free;
        self.vcpu = 0;
        self.pending = false;
    }

    pub fn status(&self) -> ChannelStatus {
        match self.state {
            ChannelState::Free | ChannelState::Reserved => ChannelStatus::Closed,
            ChannelState::Unbound { remote } => ChannelStatus::Unbound { remote },
            ChannelState::Interdomain { remote, port } => ChannelStatus::Interdomain { remote, port },
            ChannelState::Pirq(pirq) => ChannelStatus::Pirq(pirq),
            ChannelState::Virq(virq) => ChannelStatus::Virq(virq),
            ChannelState::Ipi => ChannelStatus::Ipi,
        }
    }
}

/// Guest-visible view of a channel, as reported by `EVTCHNOP_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Closed,
    Unbound { remote: DomId },
    Interdomain { remote: DomId, port: Port },
    Pirq(u32),
    Virq(u32),
    Ipi,
}

impl ChannelStatus {
    /// The `EVTCHNSTAT_*` code.
    pub fn code(&self) -> u32 {
        match self {
            Self::Closed => EVTCHNSTAT_CLOSED,
            Self::Unbound { .. } => EVTCHNSTAT_UNBOUND,
            Self::Interdomain { .. } => EVTCHNSTAT_INTERDOMAIN,
            Self::Pirq(_) => EVTCHNSTAT_PIRQ,
            Self::Virq(_) => EVTCHNSTAT_VIRQ,
            Self::Ipi => EVTCHNSTAT_IPI,
        }
    }
}

/// A channel record padded to one cache line.
#[repr(C, align(64))]
pub struct Channel {
    info: Mutex<ChannelInfo>,
}

impl Channel {
    pub const fn new(port: Port) -> Self {
        Self {
            info: Mutex::new(ChannelInfo::new(port)),
        }
    }

    /// Locks the record. Never held across a call that can block.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, ChannelInfo> {
        self.info.lock()
    }
}

impl core::fmt::Debug for Channel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Channel").field("info", &*self.info.lock()).finish()
    }
}

const _: () = {
    let chan = core::mem::size_of::<Channel>();
    assert!(chan.is_power_of_two());
    assert!(chan > core::mem::size_of::<EventWord>());
    assert!(chan < memory_addr::PAGE_SIZE_4K);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_keeps_previous_queue() {
        let mut info = ChannelInfo::new(9);
        info.priority = 2;
        info.prev_priority = 2;
        info.vcpu = 1;
        info.prev_vcpu = 1;

        info.claim(ChannelState::Ipi);
        assert_eq!(info.priority, EVTCHN_FIFO_PRIORITY_DEFAULT);
        assert_eq!(info.vcpu, 0);
        assert_eq!(info.prev_priority, 2);
        assert_eq!(info.prev_vcpu, 1);
    }

    #[test]
    fn test_status_of_reserved_is_closed() {
        let mut info = ChannelInfo::new(0);
        info.state = ChannelState::Reserved;
        assert_eq!(info.status(), ChannelStatus::Closed);
        assert_eq!(info.status().code(), EVTCHNSTAT_CLOSED);
    }

    #[test]
    fn test_status_codes() {
        let remote = DomId(3);
        assert_eq!(ChannelStatus::Unbound { remote }.code(), EVTCHNSTAT_UNBOUND);
        assert_eq!(ChannelStatus::Interdomain { remote, port: 4 }.code(), EVTCHNSTAT_INTERDOMAIN);
        assert_eq!(ChannelStatus::Virq(0).code(), EVTCHNSTAT_VIRQ);
        assert_eq!(ChannelStatus::Ipi.code(), EVTCHNSTAT_IPI);
    }
}
