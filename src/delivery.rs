//! Event delivery: linking ports onto FIFO queues and signalling vCPUs.
//!
//! See "FIFO-based event channel ABI" (Vrabel) for the queue protocol. The
//! guest consumes from the head while the hypervisor appends at the tail, and
//! the two only meet through atomic operations on event words and the
//! control block.

use core::ops::Range;
use core::sync::atomic::Ordering;

use axerrno::{AxResult, ax_err, ax_err_type};

use crate::abi::{NULL_PORT, Port, VcpuId, virq_info};
use crate::chan::{ChannelInfo, ChannelState};
use crate::evtchn::EventChannels;
use crate::registry::DomId;

/// How the destination vCPU is signalled once its queue becomes ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Upcall {
    /// Deliver on the vCPU's next entry.
    Queue,
    /// Deliver now; the vCPU is loaded on this physical CPU.
    Inject,
    /// Deliver from another domain's context.
    Push,
}

impl EventChannels {
    /// Links the channel's port onto its queue.
    ///
    /// Returns `true` if the queue was empty and its ready bit went from 0 to
    /// 1, meaning the vCPU needs an upcall. A port without an event word is
    /// remembered as pending and raised once the word page arrives.
    ///
    /// # Errors
    ///
    /// `BadState` if the destination vCPU never registered a control block.
    pub(crate) fn raise(&self, info: &mut ChannelInfo) -> AxResult<bool> {
        let port = info.port;
        let Some(word) = self.words.get(port) else {
            trace!("evtchn: {} port {} has no event word yet", self.domid, port);
            info.pending = true;
            return Ok(false);
        };

        word.set_pending();
        if word.is_masked() || word.is_linked() {
            return Ok(false);
        }

        let Some(ctl) = self.vcpu(info.vcpu).and_then(|events| events.control()) else {
            return ax_err!(BadState, "destination vCPU has no control block");
        };
        let curq = ctl.queue(info.priority);

        // The port may still be the tail of the queue it was last linked on.
        let oldq = self
            .vcpu(info.prev_vcpu)
            .and_then(|events| events.control())
            .map_or(curq, |old| old.queue(info.prev_priority));

        let mut queue = oldq.lock();
        if word.test_and_set_linked() {
            return Ok(false);
        }

        // The old queue is empty now; a stale tail would corrupt the new one.
        if queue.tail == port {
            queue.tail = NULL_PORT;
        }

        if !core::ptr::eq(oldq, curq) {
            drop(queue);
            queue = curq.lock();
        }
        info.prev_vcpu = info.vcpu;
        info.prev_priority = info.priority;

        let linked = match queue.tail {
            NULL_PORT => false,
            tail => match self.words.get(tail) {
                Some(tail_word) => tail_word.set_link(port),
                // Word pages are never unmapped.
                None => panic!("evtchn: {} queue tail {} has no event word", self.domid, tail),
            },
        };
        if !linked {
            ctl.head(info.priority).store(port, Ordering::Release);
        }
        queue.tail = port;
        drop(queue);

        trace!(
            "evtchn: {} raised port {} on vCPU {} priority {}",
            self.domid, port, info.vcpu, info.priority
        );
        Ok(!linked && !ctl.set_ready(info.priority))
    }

    /// Raises the channel and signals its vCPU the requested way.
    pub(crate) fn upcall(&self, info: &mut ChannelInfo, how: Upcall) -> AxResult {
        if !self.raise(info)? {
            return Ok(());
        }

        let Some(events) = self.vcpu(info.vcpu) else {
            return Ok(());
        };
        let vector = events.upcall_vector();
        if vector == 0 {
            trace!("evtchn: {} vCPU {} has no upcall vector", self.domid, info.vcpu);
            return Ok(());
        }

        let vcpu = events.vcpu();
        match how {
            Upcall::Queue => vcpu.queue_virtual_interrupt(vector),
            Upcall::Inject => vcpu.inject_virtual_interrupt(vector),
            Upcall::Push => vcpu.push_virtual_interrupt(vector),
        }
        Ok(())
    }

    /// Raises `port`; its vCPU is interrupted on its next entry.
    pub fn queue_upcall(&self, port: Port) -> AxResult {
        let chan = self.allocated_chan(port)?;
        self.upcall(&mut chan.lock(), Upcall::Queue)
    }

    /// Raises `port` and interrupts its vCPU immediately.
    ///
    /// Only call this on the physical CPU running that vCPU.
    pub fn inject_upcall(&self, port: Port) -> AxResult {
        let chan = self.allocated_chan(port)?;
        self.upcall(&mut chan.lock(), Upcall::Inject)
    }

    /// Raises `port` on behalf of another domain. Free ports are ignored.
    pub fn push_upcall(&self, port: Port) -> AxResult {
        let chan = self.allocated_chan(port)?;
        let mut info = chan.lock();
        if info.is_free() {
            trace!("evtchn: {} push to free port {} dropped", self.domid, port);
            return Ok(());
        }
        self.upcall(&mut info, Upcall::Push)
    }

    /// Signals `remote_port` of domain `remote`.
    ///
    /// The remote domain stays referenced until its port has been raised.
    pub fn notify_remote(&self, remote: DomId, remote_port: Port) -> AxResult {
        if remote == self.domid {
            return self.queue_upcall(remote_port);
        }

        let peer = self.lookup(remote)?;
        peer.evtchn.push_upcall(remote_port)
    }

    /// `EVTCHNOP_send`.
    ///
    /// Interdomain ports signal their peer, IPIs signal the local vCPU, and
    /// unbound ports swallow the event.
    pub fn send(&self, port: Port) -> AxResult {
        let chan = self.allocated_chan(port)?;
        let mut info = chan.lock();
        let state = info.state;
        match state {
            ChannelState::Interdomain { remote, port: remote_port } => {
                drop(info);
                self.notify_remote(remote, remote_port)
            }
            ChannelState::Ipi => self.upcall(&mut info, Upcall::Queue),
            ChannelState::Unbound { .. } => Ok(()),
            _ => ax_err!(BadState, "port cannot be sent on"),
        }
    }

    /// Sends on `port` from device or timer emulation.
    pub fn send_event(&self, port: Port) -> AxResult {
        self.send(port)
    }

    /// Clears `MASKED` and delivers the event if it fired while masked.
    pub fn unmask(&self, port: Port) -> AxResult {
        let chan = self.allocated_chan(port)?;
        let Some(word) = self.words.get(port) else {
            return Ok(());
        };

        word.clear_masked();
        if word.is_pending() {
            self.upcall(&mut chan.lock(), Upcall::Queue)?;
        }
        Ok(())
    }

    /// Raises the port bound to `virq`; delivered on the vCPU's next entry.
    ///
    /// A VIRQ nobody bound is dropped.
    pub fn queue_virq(&self, vcpu: VcpuId, virq: u32) -> AxResult {
        self.virq_upcall(vcpu, virq, Upcall::Queue)
    }

    /// Raises the port bound to `virq` and interrupts the vCPU immediately.
    pub fn inject_virq(&self, vcpu: VcpuId, virq: u32) -> AxResult {
        self.virq_upcall(vcpu, virq, Upcall::Inject)
    }

    fn virq_upcall(&self, vcpu: VcpuId, virq: u32, how: Upcall) -> AxResult {
        let info = virq_info(virq).ok_or_else(|| ax_err_type!(InvalidInput, "unknown VIRQ"))?;
        // Global VIRQs live on vCPU 0.
        let vcpu = if info.global { 0 } else { vcpu };
        let events = self.vcpu_events(vcpu)?;

        let Some(port) = events.virq_port(virq) else {
            debug!("evtchn: {} {} not bound on vCPU {}", self.domid, info.name, vcpu);
            return Ok(());
        };

        let chan = self.allocated_chan(port)?;
        let mut chan = chan.lock();
        if chan.state != ChannelState::Virq(virq) {
            // Closed since we read the table.
            return Ok(());
        }
        self.upcall(&mut chan, how)
    }

    /// Delivers events on `ports` that could not be linked when raised.
    ///
    /// Caller holds the event lock.
    pub(crate) fn redeliver(&self, ports: Range<Port>, vcpu: Option<VcpuId>) {
        for (port, chan) in self.chans.iter().filter(|(port, _)| ports.contains(port)) {
            let mut info = chan.lock();
            if info.is_free() || vcpu.is_some_and(|vcpu| vcpu != info.vcpu) {
                continue;
            }

            let stranded = self
                .words
                .get(port)
                .is_some_and(|word| word.is_pending() && !word.is_linked());
            if !info.pending && !stranded {
                continue;
            }

            info.pending = false;
            if let Err(err) = self.upcall(&mut info, Upcall::Queue) {
                warn!("evtchn: {} lost event on port {}: {:?}", self.domid, port, err);
            }
        }
    }
}
