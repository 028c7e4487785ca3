//! Per-domain event channel engine: port allocation and the binding protocol.
//!
//! # Locking
//!
//! Lock order is: domain event lock(s), then one channel lock, then one queue
//! lock. A channel's state only changes while its domain's event lock is held.
//! Operations touching two domains take both event locks through
//! [`lock_pair`], ordered by domain id.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use axerrno::{AxError, AxResult, ax_err, ax_err_type};
use memory_addr::PAGE_SIZE_4K;
use spin::Mutex;

use crate::abi::{
    ControlBlock, EVTCHN_FIFO_LINK_BITS, EVTCHN_FIFO_PRIORITY_MIN, MIN_UPCALL_VECTOR, NULL_PORT,
    Port, VcpuId, virq_info,
};
use crate::chan::{Channel, ChannelState, ChannelStatus};
use crate::config::EvtchnConfig;
use crate::delivery::Upcall;
use crate::mem::{GuestFrame, GuestMemory, GuestPage};
use crate::queue::EventControl;
use crate::registry::{DomId, DomainRef, DomainRegistry};
use crate::sync::lock_pair;
use crate::table::{ChannelTable, PortLayout, WordTable};
use crate::vcpu::{VcpuEvents, VirtualCpu};
use crate::word::EventWord;

/// State guarded by the domain event lock.
#[derive(Debug)]
pub(crate) struct PortAllocator {
    /// Every port below this has been handed out at least once.
    pub(crate) port_end: Port,
}

/// The event channels of one domain.
pub struct EventChannels {
    pub(crate) domid: DomId,
    pub(crate) layout: PortLayout,
    pub(crate) event_lock: Mutex<PortAllocator>,
    pub(crate) chans: ChannelTable,
    pub(crate) words: WordTable,
    pub(crate) vcpus: Vec<VcpuEvents>,
    memory: Arc<dyn GuestMemory>,
    registry: Weak<DomainRegistry>,
}

impl EventChannels {
    /// Builds the tables for domain `domid`. Port 0 is reserved.
    ///
    /// # Panics
    ///
    /// Panics if `config` does not describe a power-of-two port space; see
    /// [`EvtchnConfig::validate`].
    pub fn new(
        domid: DomId,
        config: &EvtchnConfig,
        vcpus: Vec<Arc<dyn VirtualCpu>>,
        memory: Arc<dyn GuestMemory>,
        registry: Weak<DomainRegistry>,
    ) -> Self {
        let layout = PortLayout::new(config.nr_ports());
        let chans = ChannelTable::new(layout);
        chans.get_or_alloc(NULL_PORT).lock().state = ChannelState::Reserved;

        Self {
            domid,
            layout,
            event_lock: Mutex::new(PortAllocator {
                port_end: NULL_PORT + 1,
            }),
            chans,
            words: WordTable::new(layout),
            vcpus: vcpus.into_iter().map(VcpuEvents::new).collect(),
            memory,
            registry,
        }
    }

    pub fn domid(&self) -> DomId {
        self.domid
    }

    pub fn nr_ports(&self) -> u32 {
        self.layout.nr_ports()
    }

    pub fn vcpu_count(&self) -> usize {
        self.vcpus.len()
    }

    pub fn vcpu(&self, vcpu: VcpuId) -> Option<&VcpuEvents> {
        self.vcpus.get(vcpu as usize)
    }

    /// The record of `port`, if its channel page exists.
    pub fn port_to_chan(&self, port: Port) -> Option<&Channel> {
        if !self.layout.contains(port) {
            return None;
        }
        self.chans.get(port)
    }

    /// The event word of `port`, if the guest has mapped it.
    pub fn port_to_word(&self, port: Port) -> Option<&EventWord> {
        if !self.layout.contains(port) {
            return None;
        }
        self.words.get(port)
    }

    /// First port never handed out.
    pub fn next_free_port(&self) -> Port {
        self.event_lock.lock().port_end
    }

    pub(crate) fn allocated_chan(&self, port: Port) -> AxResult<&Channel> {
        self.port_to_chan(port)
            .ok_or_else(|| ax_err_type!(InvalidInput, "port is not allocated"))
    }

    pub(crate) fn vcpu_events(&self, vcpu: VcpuId) -> AxResult<&VcpuEvents> {
        self.vcpu(vcpu)
            .ok_or_else(|| ax_err_type!(InvalidInput, "vCPU out of range"))
    }

    /// Takes a reference on another domain, if it is still alive.
    pub(crate) fn peer(&self, id: DomId) -> Option<DomainRef> {
        self.registry.upgrade()?.get(id)
    }

    pub(crate) fn lookup(&self, id: DomId) -> AxResult<DomainRef> {
        self.peer(id)
            .ok_or_else(|| ax_err_type!(NotFound, "remote domain not found"))
    }

    fn map_frame(&self, gfn: GuestFrame) -> AxResult<GuestPage> {
        self.memory.map_guest_frame(gfn).map_err(|err| {
            warn!("evtchn: {}: cannot map frame {:#x}: {:?}", self.domid, gfn.0, err);
            AxError::Unsupported
        })
    }

    /// Checks whether `port` can be handed out, creating its page on first use.
    fn allocate_port(&self, port: Port) -> Option<&Channel> {
        let chan = self.chans.get_or_alloc(port);
        if !chan.lock().is_free() {
            return None;
        }
        if self.words.get(port).is_some_and(EventWord::is_busy) {
            return None;
        }
        Some(chan)
    }

    /// Hands out the first usable port at or above the high-water mark.
    ///
    /// Closed ports below the mark are not reused.
    fn get_free_port(&self, alloc: &mut PortAllocator) -> AxResult<(Port, &Channel)> {
        for port in alloc.port_end..self.layout.nr_ports() {
            if let Some(chan) = self.allocate_port(port) {
                alloc.port_end = port + 1;
                return Ok((port, chan));
            }
        }
        ax_err!(NoMemory, "no free event channel port")
    }

    /// Allocates a port waiting for `remote` to bind to it.
    pub fn alloc_unbound(&self, remote: DomId) -> AxResult<Port> {
        let remote = remote.resolve(self.domid);
        let mut alloc = self.event_lock.lock();
        let (port, chan) = self.get_free_port(&mut alloc)?;
        chan.lock().claim(ChannelState::Unbound { remote });

        debug!("evtchn: {} port {} unbound for {}", self.domid, port, remote);
        Ok(port)
    }

    /// Allocates a port for the hypervisor's own use.
    pub fn reserve_port(&self) -> AxResult<Port> {
        let mut alloc = self.event_lock.lock();
        let (port, chan) = self.get_free_port(&mut alloc)?;
        chan.lock().claim(ChannelState::Reserved);

        debug!("evtchn: {} port {} reserved", self.domid, port);
        Ok(port)
    }

    /// Connects a new local port to `remote_port` of domain `remote`.
    ///
    /// The remote port must be unbound and waiting for this domain. Both
    /// domains' event locks are held for the whole exchange; if the remote
    /// side refuses, nothing changes locally.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the remote domain does not exist or is dying
    /// - `InvalidInput` if `remote_port` is out of the remote's range
    /// - `ConnectionRefused` if the remote port is not awaiting this domain
    /// - `NoMemory` if no local port is free
    pub fn bind_interdomain(&self, remote: DomId, remote_port: Port) -> AxResult<Port> {
        let remote = remote.resolve(self.domid);
        let peer_ref = if remote == self.domid {
            None
        } else {
            Some(self.lookup(remote)?)
        };
        let peer = peer_ref.as_deref().map_or(self, |domain| &domain.evtchn);

        let mut locks = lock_pair(
            (self.domid, &self.event_lock),
            (peer.domid, &peer.event_lock),
        );

        let saved = locks.local().port_end;
        let (port, chan) = self.get_free_port(locks.local())?;
        if let Err(err) = peer.accept_interdomain(remote_port, self.domid, port) {
            locks.local().port_end = saved;
            return Err(err);
        }

        let mut info = chan.lock();
        info.claim(ChannelState::Interdomain {
            remote,
            port: remote_port,
        });
        debug!(
            "evtchn: {} port {} bound to {} port {}",
            self.domid, port, remote, remote_port
        );

        if let Err(err) = self.upcall(&mut info, Upcall::Queue) {
            debug!("evtchn: {} port {} not raised after bind: {:?}", self.domid, port, err);
        }
        Ok(port)
    }

    /// Remote half of [`bind_interdomain`](Self::bind_interdomain).
    ///
    /// Caller holds this domain's event lock.
    fn accept_interdomain(&self, port: Port, remote: DomId, remote_port: Port) -> AxResult {
        let Some(chan) = self.port_to_chan(port) else {
            return ax_err!(InvalidInput, "remote port out of range");
        };

        let mut info = chan.lock();
        let state = info.state;
        match state {
            ChannelState::Unbound { remote: expected } if expected == remote => {
                info.state = ChannelState::Interdomain {
                    remote,
                    port: remote_port,
                };
                debug!(
                    "evtchn: {} port {} bound to {} port {}",
                    self.domid, port, remote, remote_port
                );
                Ok(())
            }
            _ => ax_err!(ConnectionRefused, "remote port is not awaiting this domain"),
        }
    }

    /// Reverts the mirror of a closed interdomain channel to unbound.
    ///
    /// Caller holds this domain's event lock.
    fn release_interdomain(&self, port: Port, remote: DomId, remote_port: Port) -> AxResult {
        let Some(chan) = self.port_to_chan(port) else {
            return ax_err!(InvalidInput, "peer port out of range");
        };

        let mut info = chan.lock();
        let state = info.state;
        match state {
            ChannelState::Interdomain { remote: r, port: p } if r == remote && p == remote_port => {
                info.state = ChannelState::Unbound { remote };
                Ok(())
            }
            _ => ax_err!(BadState, "peer port does not mirror the closed port"),
        }
    }

    /// Binds a VIRQ to a new port delivered to `vcpu`.
    ///
    /// Global VIRQs can only be bound on vCPU 0.
    pub fn bind_virq(&self, virq: u32, vcpu: VcpuId) -> AxResult<Port> {
        let Some(info) = virq_info(virq) else {
            return ax_err!(InvalidInput, "unknown VIRQ");
        };
        if info.global && vcpu != 0 {
            return ax_err!(InvalidInput, "global VIRQ must be bound on vCPU 0");
        }
        let events = self.vcpu_events(vcpu)?;

        let mut alloc = self.event_lock.lock();
        let mut virqs = events.virqs();
        if virqs[virq as usize] != NULL_PORT {
            return ax_err!(AlreadyExists, "VIRQ already bound");
        }

        let (port, chan) = self.get_free_port(&mut alloc)?;
        let mut chan = chan.lock();
        chan.claim(ChannelState::Virq(virq));
        chan.vcpu = vcpu;
        virqs[virq as usize] = port;

        debug!(
            "evtchn: {} bound {} to port {} on vCPU {}",
            self.domid, info.name, port, vcpu
        );
        Ok(port)
    }

    /// Allocates an inter-processor port delivered to `vcpu`.
    pub fn bind_ipi(&self, vcpu: VcpuId) -> AxResult<Port> {
        self.vcpu_events(vcpu)?;

        let mut alloc = self.event_lock.lock();
        let (port, chan) = self.get_free_port(&mut alloc)?;
        let mut chan = chan.lock();
        chan.claim(ChannelState::Ipi);
        chan.vcpu = vcpu;

        debug!("evtchn: {} port {} IPI on vCPU {}", self.domid, port, vcpu);
        Ok(port)
    }

    /// Confirms that `port` is delivered to `vcpu`.
    ///
    /// Moving a bound channel to a different vCPU is not implemented and
    /// fails with `Unsupported`.
    pub fn bind_vcpu(&self, port: Port, vcpu: VcpuId) -> AxResult {
        self.vcpu_events(vcpu)?;
        let chan = self.allocated_chan(port)?;

        let info = chan.lock();
        match info.state {
            ChannelState::Unbound { .. }
            | ChannelState::Interdomain { .. }
            | ChannelState::Ipi
            | ChannelState::Virq(_) => {}
            _ => return ax_err!(BadState, "port cannot be bound to a vCPU"),
        }
        if info.vcpu != vcpu {
            return ax_err!(Unsupported, "moving a channel to another vCPU");
        }
        Ok(())
    }

    /// Closes `port`.
    ///
    /// An interdomain peer is reverted to unbound, waiting for this domain
    /// again. A peer that is already gone is skipped.
    pub fn close(&self, port: Port) -> AxResult {
        let chan = self.allocated_chan(port)?;

        loop {
            let expected = match chan.lock().state {
                ChannelState::Interdomain { remote, .. } if remote != self.domid => Some(remote),
                _ => None,
            };
            let peer_ref = expected.and_then(|id| self.peer(id));
            let peer = peer_ref.as_deref().map_or(self, |domain| &domain.evtchn);

            let _locks = lock_pair(
                (self.domid, &self.event_lock),
                (peer.domid, &peer.event_lock),
            );

            let (state, vcpu) = {
                let info = chan.lock();
                (info.state, info.vcpu)
            };
            match state {
                ChannelState::Free | ChannelState::Reserved => {
                    return ax_err!(BadState, "port is not in use");
                }
                ChannelState::Interdomain { remote, port: remote_port } => {
                    if remote != self.domid && Some(remote) != expected {
                        // Rebound while we were locking; try again.
                        continue;
                    }
                    if remote == self.domid || peer.domid == remote {
                        if let Err(err) = peer.release_interdomain(remote_port, self.domid, port) {
                            warn!(
                                "evtchn: {} port {}: {} port {} not reverted: {:?}",
                                self.domid, port, remote, remote_port, err
                            );
                        }
                    } else {
                        debug!("evtchn: {} port {}: peer {} already gone", self.domid, port, remote);
                    }
                }
                ChannelState::Virq(virq) => {
                    if let Some(events) = self.vcpu(vcpu) {
                        let mut virqs = events.virqs();
                        if virqs.get(virq as usize) == Some(&port) {
                            virqs[virq as usize] = NULL_PORT;
                        }
                    }
                }
                ChannelState::Unbound { .. } | ChannelState::Pirq(_) | ChannelState::Ipi => {}
            }

            chan.lock().free();
            debug!("evtchn: {} closed port {}", self.domid, port);
            return Ok(());
        }
    }

    /// Closes every port in use. Reserved ports are kept.
    pub fn reset(&self) {
        let ports: Vec<Port> = self
            .chans
            .iter()
            .filter(|(_, chan)| {
                !matches!(chan.lock().state, ChannelState::Free | ChannelState::Reserved)
            })
            .map(|(port, _)| port)
            .collect();

        for &port in &ports {
            if let Err(err) = self.close(port) {
                warn!("evtchn: {} reset: port {} not closed: {:?}", self.domid, port, err);
            }
        }
        debug!("evtchn: {} reset closed {} ports", self.domid, ports.len());
    }

    /// Reports what `port` is bound to and the vCPU it is delivered to.
    pub fn status(&self, port: Port) -> AxResult<(ChannelStatus, VcpuId)> {
        let chan = self.allocated_chan(port)?;
        let info = chan.lock();
        Ok((info.status(), info.vcpu))
    }

    /// Changes the queue `port` is linked on next time it is raised.
    pub fn set_priority(&self, port: Port, priority: u32) -> AxResult {
        if priority > EVTCHN_FIFO_PRIORITY_MIN as u32 {
            return ax_err!(InvalidInput, "priority out of range");
        }
        let chan = self.allocated_chan(port)?;
        chan.lock().priority = priority as u8;
        Ok(())
    }

    /// Registers the control block of `vcpu`, placed at `offset` in `gfn`.
    ///
    /// Events that became pending before the block existed are delivered.
    /// Returns the number of `LINK` bits for the guest.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` for an unknown vCPU or a misplaced block
    /// - `BadState` if the vCPU already has a control block
    /// - `Unsupported` if the frame cannot be mapped
    pub fn init_control(&self, vcpu: VcpuId, gfn: GuestFrame, offset: u32) -> AxResult<u8> {
        let events = self.vcpu_events(vcpu)?;
        let offset = offset as usize;
        if offset % 8 != 0 || offset > PAGE_SIZE_4K - core::mem::size_of::<ControlBlock>() {
            return ax_err!(InvalidInput, "control block offset");
        }

        let _guard = self.event_lock.lock();
        if events.control().is_some() {
            return ax_err!(BadState, "control block already initialized");
        }
        let page = self.map_frame(gfn)?;
        events.install_control(EventControl::new(page, offset))?;

        debug!(
            "evtchn: {} vCPU {} control block at {:#x}+{:#x}",
            self.domid, vcpu, gfn.0, offset
        );
        self.redeliver(0..self.words.mapped_ports(), Some(vcpu));
        Ok(EVTCHN_FIFO_LINK_BITS as u8)
    }

    /// Maps `gfn` as the event words of the next range of ports.
    ///
    /// Ports raised before their word existed are delivered now.
    pub fn expand_array(&self, gfn: GuestFrame) -> AxResult {
        let _guard = self.event_lock.lock();
        if self.words.is_full() {
            return ax_err!(NoMemory, "event array is full");
        }
        if self.words.contains_frame(gfn) {
            return ax_err!(AlreadyExists, "frame is already an event word page");
        }

        let page = self.map_frame(gfn)?;
        let ports = self.words.push(page)?;
        debug!(
            "evtchn: {} event words for ports {}..{} at {:#x}",
            self.domid, ports.start, ports.end, gfn.0
        );
        self.redeliver(ports, None);
        Ok(())
    }

    /// Sets the vector injected on `vcpu` when one of its queues becomes ready.
    pub fn set_upcall_vector(&self, vcpu: VcpuId, vector: u32) -> AxResult {
        if vector < MIN_UPCALL_VECTOR {
            return ax_err!(InvalidInput, "upcall vector too low");
        }
        self.vcpu_events(vcpu)?.set_upcall_vector(vector);
        debug!("evtchn: {} vCPU {} upcall vector {:#x}", self.domid, vcpu, vector);
        Ok(())
    }
}

impl core::fmt::Debug for EventChannels {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventChannels")
            .field("domid", &self.domid)
            .field("nr_ports", &self.layout.nr_ports())
            .field("mapped_ports", &self.words.mapped_ports())
            .field("vcpus", &self.vcpus)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{VIRQ_CONSOLE, VIRQ_TIMER};
    use crate::mem::HostPage;
    use alloc::boxed::Box;
    use alloc::collections::BTreeMap;

    struct FakeMemory(Mutex<BTreeMap<u64, &'static HostPage>>);

    impl GuestMemory for FakeMemory {
        fn map_guest_frame(&self, gfn: GuestFrame) -> AxResult<GuestPage> {
            if gfn.0 == 0 {
                return ax_err!(BadAddress, "frame 0 is not guest RAM");
            }
            let mut pages = self.0.lock();
            let page = *pages
                .entry(gfn.0)
                .or_insert_with(|| &*Box::leak(Box::new(HostPage::new())));
            Ok(GuestPage::from_host(gfn, page))
        }
    }

    struct Cpu(VcpuId);

    impl VirtualCpu for Cpu {
        fn id(&self) -> VcpuId {
            self.0
        }
        fn queue_virtual_interrupt(&self, _vector: u32) {}
        fn inject_virtual_interrupt(&self, _vector: u32) {}
    }

    fn channels(nr_ports: u32, vcpus: u32) -> EventChannels {
        EventChannels::new(
            DomId(1),
            &EvtchnConfig::new(nr_ports - 1),
            (0..vcpus)
                .map(|id| Arc::new(Cpu(id)) as Arc<dyn VirtualCpu>)
                .collect(),
            Arc::new(FakeMemory(Mutex::new(BTreeMap::new()))),
            Weak::new(),
        )
    }

    #[test]
    fn test_port_zero_reserved() {
        let evtchn = channels(64, 1);
        assert_eq!(evtchn.status(0).unwrap().0, ChannelStatus::Closed);
        assert_eq!(evtchn.close(0).unwrap_err(), AxError::BadState);
        assert_eq!(evtchn.alloc_unbound(DomId(2)).unwrap(), 1);
    }

    #[test]
    fn test_ports_are_never_reused() {
        let evtchn = channels(64, 1);
        let first = evtchn.bind_ipi(0).unwrap();
        evtchn.close(first).unwrap();
        let second = evtchn.bind_ipi(0).unwrap();
        assert_ne!(first, second);
        assert_eq!(evtchn.next_free_port(), second + 1);
    }

    #[test]
    fn test_exhaustion() {
        let evtchn = channels(4, 1);
        for _ in 1..4 {
            evtchn.bind_ipi(0).unwrap();
        }
        assert_eq!(evtchn.bind_ipi(0).unwrap_err(), AxError::NoMemory);
    }

    #[test]
    fn test_pages_allocated_on_demand() {
        let evtchn = channels(256, 1);
        assert!(evtchn.port_to_chan(63).is_some());
        assert!(evtchn.port_to_chan(64).is_none());
        assert!(evtchn.port_to_chan(256).is_none());
        assert_eq!(evtchn.status(64).unwrap_err(), AxError::InvalidInput);
    }

    #[test]
    fn test_alloc_unbound_self() {
        let evtchn = channels(64, 1);
        let port = evtchn.alloc_unbound(crate::abi::DOMID_SELF).unwrap();
        assert_eq!(
            evtchn.status(port).unwrap(),
            (ChannelStatus::Unbound { remote: DomId(1) }, 0)
        );
    }

    #[test]
    fn test_interdomain_within_domain() {
        let evtchn = channels(64, 1);
        let unbound = evtchn.alloc_unbound(DomId(1)).unwrap();
        let bound = evtchn.bind_interdomain(DomId(1), unbound).unwrap();

        assert_eq!(
            evtchn.status(bound).unwrap().0,
            ChannelStatus::Interdomain { remote: DomId(1), port: unbound }
        );
        assert_eq!(
            evtchn.status(unbound).unwrap().0,
            ChannelStatus::Interdomain { remote: DomId(1), port: bound }
        );

        evtchn.close(bound).unwrap();
        assert_eq!(
            evtchn.status(unbound).unwrap().0,
            ChannelStatus::Unbound { remote: DomId(1) }
        );
    }

    #[test]
    fn test_close_unbound_side_reverts_binder() {
        let evtchn = channels(64, 1);
        let unbound = evtchn.alloc_unbound(DomId(1)).unwrap();
        let bound = evtchn.bind_interdomain(DomId(1), unbound).unwrap();

        evtchn.close(unbound).unwrap();
        assert_eq!(evtchn.status(unbound).unwrap().0, ChannelStatus::Closed);
        assert_eq!(
            evtchn.status(bound).unwrap().0,
            ChannelStatus::Unbound { remote: DomId(1) }
        );
    }

    #[test]
    fn test_self_unbound_refuses_other_domains() {
        let evtchn = channels(64, 1);
        let port = evtchn.alloc_unbound(crate::abi::DOMID_SELF).unwrap();
        assert_eq!(
            evtchn.accept_interdomain(port, DomId(9), 1).unwrap_err(),
            AxError::ConnectionRefused
        );
        assert_eq!(
            evtchn.status(port).unwrap().0,
            ChannelStatus::Unbound { remote: DomId(1) }
        );
    }

    #[test]
    fn test_bind_rejected_restores_allocator() {
        let evtchn = channels(64, 1);
        let ipi = evtchn.bind_ipi(0).unwrap();
        let next = evtchn.next_free_port();

        assert_eq!(
            evtchn.bind_interdomain(DomId(1), ipi).unwrap_err(),
            AxError::ConnectionRefused
        );
        assert_eq!(evtchn.next_free_port(), next);
        assert_eq!(evtchn.status(next).unwrap().0, ChannelStatus::Closed);
    }

    #[test]
    fn test_remote_domain_unknown() {
        let evtchn = channels(64, 1);
        assert_eq!(
            evtchn.bind_interdomain(DomId(2), 1).unwrap_err(),
            AxError::NotFound
        );
    }

    #[test]
    fn test_bind_virq() {
        let evtchn = channels(64, 2);
        assert_eq!(evtchn.bind_virq(5, 0).unwrap_err(), AxError::InvalidInput);
        assert_eq!(evtchn.bind_virq(VIRQ_CONSOLE, 1).unwrap_err(), AxError::InvalidInput);
        assert_eq!(evtchn.bind_virq(VIRQ_TIMER, 2).unwrap_err(), AxError::InvalidInput);

        let port = evtchn.bind_virq(VIRQ_TIMER, 1).unwrap();
        assert_eq!(evtchn.vcpu(1).unwrap().virq_port(VIRQ_TIMER), Some(port));
        assert_eq!(evtchn.status(port).unwrap(), (ChannelStatus::Virq(VIRQ_TIMER), 1));
        assert_eq!(evtchn.bind_virq(VIRQ_TIMER, 1).unwrap_err(), AxError::AlreadyExists);

        // Per-vCPU VIRQs bind independently on each vCPU.
        assert!(evtchn.bind_virq(VIRQ_TIMER, 0).is_ok());

        evtchn.close(port).unwrap();
        assert_eq!(evtchn.vcpu(1).unwrap().virq_port(VIRQ_TIMER), None);
        assert!(evtchn.bind_virq(VIRQ_TIMER, 1).is_ok());
    }

    #[test]
    fn test_bind_vcpu_only_confirms() {
        let evtchn = channels(64, 2);
        let port = evtchn.bind_ipi(1).unwrap();
        assert!(evtchn.bind_vcpu(port, 1).is_ok());
        assert_eq!(evtchn.bind_vcpu(port, 0).unwrap_err(), AxError::Unsupported);
        assert_eq!(evtchn.bind_vcpu(port, 7).unwrap_err(), AxError::InvalidInput);

        let reserved = evtchn.reserve_port().unwrap();
        assert_eq!(evtchn.bind_vcpu(reserved, 0).unwrap_err(), AxError::BadState);
    }

    #[test]
    fn test_set_priority() {
        let evtchn = channels(64, 1);
        let port = evtchn.bind_ipi(0).unwrap();
        assert!(evtchn.set_priority(port, 0).is_ok());
        assert_eq!(evtchn.port_to_chan(port).unwrap().lock().priority, 0);
        assert_eq!(evtchn.set_priority(port, 16).unwrap_err(), AxError::InvalidInput);
    }

    #[test]
    fn test_init_control_validation() {
        let evtchn = channels(64, 1);
        assert_eq!(
            evtchn.init_control(1, GuestFrame(1), 0).unwrap_err(),
            AxError::InvalidInput
        );
        assert_eq!(
            evtchn.init_control(0, GuestFrame(1), 4).unwrap_err(),
            AxError::InvalidInput
        );
        assert_eq!(
            evtchn.init_control(0, GuestFrame(1), 4096 - 64).unwrap_err(),
            AxError::InvalidInput
        );
        assert_eq!(
            evtchn.init_control(0, GuestFrame(0), 0).unwrap_err(),
            AxError::Unsupported
        );
        assert_eq!(
            evtchn.init_control(0, GuestFrame(1), 4096 - 72).unwrap(),
            EVTCHN_FIFO_LINK_BITS as u8
        );
        assert_eq!(
            evtchn.init_control(0, GuestFrame(1), 0).unwrap_err(),
            AxError::BadState
        );
    }

    #[test]
    fn test_expand_array() {
        let evtchn = channels(2048, 1);
        assert!(evtchn.port_to_word(1).is_none());

        evtchn.expand_array(GuestFrame(10)).unwrap();
        assert!(evtchn.port_to_word(1).is_some());
        assert_eq!(
            evtchn.expand_array(GuestFrame(10)).unwrap_err(),
            AxError::AlreadyExists
        );
        assert_eq!(
            evtchn.expand_array(GuestFrame(0)).unwrap_err(),
            AxError::Unsupported
        );
        evtchn.expand_array(GuestFrame(11)).unwrap();
        assert!(evtchn.port_to_word(2047).is_some());
        assert_eq!(
            evtchn.expand_array(GuestFrame(12)).unwrap_err(),
            AxError::NoMemory
        );
    }

    #[test]
    fn test_upcall_vector() {
        let evtchn = channels(64, 1);
        assert_eq!(
            evtchn.set_upcall_vector(0, 0x0f).unwrap_err(),
            AxError::InvalidInput
        );
        evtchn.set_upcall_vector(0, 0xf3).unwrap();
        assert_eq!(evtchn.vcpu(0).unwrap().upcall_vector(), 0xf3);
    }

    #[test]
    fn test_reset_keeps_reserved() {
        let evtchn = channels(64, 1);
        let reserved = evtchn.reserve_port().unwrap();
        let ipi = evtchn.bind_ipi(0).unwrap();
        let virq = evtchn.bind_virq(VIRQ_TIMER, 0).unwrap();

        evtchn.reset();
        assert_eq!(evtchn.status(ipi).unwrap().0, ChannelStatus::Closed);
        assert_eq!(evtchn.status(virq).unwrap().0, ChannelStatus::Closed);
        assert_eq!(evtchn.close(reserved).unwrap_err(), AxError::BadState);
        assert!(evtchn.port_to_chan(reserved).unwrap().lock().state == ChannelState::Reserved);
    }
}
