//! `HYPERVISOR_event_channel_op` dispatch.
//!
//! The architecture's trap handler decodes the opcode, copies the argument
//! structure in from guest memory and hands it to [`dispatch`]. Output fields
//! are written back into the same structure; the caller copies it out again
//! and returns the status to the guest.

use axerrno::{AxError, AxResult, ax_err};

use crate::abi::{
    AllocUnbound, BindInterdomain, BindIpi, BindVcpu, BindVirq, Close, EvtchnSend, EvtchnStatus,
    ExpandArray, InitControl, InterdomainStatus, Reset, SetPriority, StatusInfo, UnboundStatus,
    Unmask, VcpuId,
};
use crate::chan::ChannelStatus;
use crate::error::hypercall_status;
use crate::mem::GuestFrame;
use crate::registry::{DomId, Domain, DomainRef};

/// `EVTCHNOP_*` opcodes.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvtchnOp {
    BindInterdomain = 0,
    BindVirq = 1,
    BindPirq = 2,
    Close = 3,
    Send = 4,
    Status = 5,
    AllocUnbound = 6,
    BindIpi = 7,
    BindVcpu = 8,
    Unmask = 9,
    Reset = 10,
    InitControl = 11,
    ExpandArray = 12,
    SetPriority = 13,
    ResetCont = 14,
}

impl TryFrom<u32> for EvtchnOp {
    type Error = AxError;

    fn try_from(op: u32) -> AxResult<Self> {
        Ok(match op {
            0 => Self::BindInterdomain,
            1 => Self::BindVirq,
            2 => Self::BindPirq,
            3 => Self::Close,
            4 => Self::Send,
            5 => Self::Status,
            6 => Self::AllocUnbound,
            7 => Self::BindIpi,
            8 => Self::BindVcpu,
            9 => Self::Unmask,
            10 => Self::Reset,
            11 => Self::InitControl,
            12 => Self::ExpandArray,
            13 => Self::SetPriority,
            14 => Self::ResetCont,
            _ => return Err(AxError::Unsupported),
        })
    }
}

/// A decoded hypercall with its argument structure.
#[derive(Debug)]
pub enum EvtchnArgs<'a> {
    BindInterdomain(&'a mut BindInterdomain),
    BindVirq(&'a mut BindVirq),
    Close(&'a mut Close),
    Send(&'a mut EvtchnSend),
    Status(&'a mut EvtchnStatus),
    AllocUnbound(&'a mut AllocUnbound),
    BindIpi(&'a mut BindIpi),
    BindVcpu(&'a mut BindVcpu),
    Unmask(&'a mut Unmask),
    Reset(&'a mut Reset),
    InitControl(&'a mut InitControl),
    ExpandArray(&'a mut ExpandArray),
    SetPriority(&'a mut SetPriority),
    /// A known opcode this hypervisor does not implement.
    Unsupported(EvtchnOp),
}

impl EvtchnArgs<'_> {
    pub fn op(&self) -> EvtchnOp {
        match self {
            Self::BindInterdomain(_) => EvtchnOp::BindInterdomain,
            Self::BindVirq(_) => EvtchnOp::BindVirq,
            Self::Close(_) => EvtchnOp::Close,
            Self::Send(_) => EvtchnOp::Send,
            Self::Status(_) => EvtchnOp::Status,
            Self::AllocUnbound(_) => EvtchnOp::AllocUnbound,
            Self::BindIpi(_) => EvtchnOp::BindIpi,
            Self::BindVcpu(_) => EvtchnOp::BindVcpu,
            Self::Unmask(_) => EvtchnOp::Unmask,
            Self::Reset(_) => EvtchnOp::Reset,
            Self::InitControl(_) => EvtchnOp::InitControl,
            Self::ExpandArray(_) => EvtchnOp::ExpandArray,
            Self::SetPriority(_) => EvtchnOp::SetPriority,
            Self::Unsupported(op) => *op,
        }
    }
}

/// Executes one event channel hypercall issued by `caller` of `domain`.
///
/// Returns 0 on success or a negative errno.
pub fn dispatch(domain: &Domain, caller: VcpuId, args: EvtchnArgs<'_>) -> i64 {
    let op = args.op();
    trace!("evtchn: {} vCPU {} {:?}", domain.id, caller, op);

    let result = handle(domain, args);
    if let Err(err) = result {
        debug!("evtchn: {} {:?} failed: {:?}", domain.id, op, err);
    }
    hypercall_status(result)
}

fn handle(domain: &Domain, args: EvtchnArgs<'_>) -> AxResult {
    let evtchn = &domain.evtchn;
    match args {
        EvtchnArgs::BindInterdomain(arg) => {
            arg.local_port = evtchn.bind_interdomain(DomId(arg.remote_dom), arg.remote_port)?;
        }
        EvtchnArgs::BindVirq(arg) => {
            arg.port = evtchn.bind_virq(arg.virq, arg.vcpu)?;
        }
        EvtchnArgs::Close(arg) => evtchn.close(arg.port)?,
        EvtchnArgs::Send(arg) => evtchn.send(arg.port)?,
        EvtchnArgs::Status(arg) => {
            let target = target_domain(domain, arg.dom)?;
            let target = target.as_deref().unwrap_or(domain);
            let (status, vcpu) = target.evtchn.status(arg.port)?;
            arg.status = status.code();
            arg.vcpu = vcpu;
            arg.u = status_info(status);
        }
        EvtchnArgs::AllocUnbound(arg) => {
            let remote = DomId(arg.remote_dom).resolve(domain.id);
            let target = target_domain(domain, arg.dom)?;
            let target = target.as_deref().unwrap_or(domain);
            arg.port = target.evtchn.alloc_unbound(remote)?;
        }
        EvtchnArgs::BindIpi(arg) => {
            arg.port = evtchn.bind_ipi(arg.vcpu)?;
        }
        EvtchnArgs::BindVcpu(arg) => evtchn.bind_vcpu(arg.port, arg.vcpu)?,
        EvtchnArgs::Unmask(arg) => evtchn.unmask(arg.port)?,
        EvtchnArgs::Reset(arg) => {
            let target = target_domain(domain, arg.dom)?;
            target.as_deref().unwrap_or(domain).evtchn.reset();
        }
        EvtchnArgs::InitControl(arg) => {
            arg.link_bits =
                evtchn.init_control(arg.vcpu, GuestFrame(arg.control_gfn), arg.offset)?;
        }
        EvtchnArgs::ExpandArray(arg) => evtchn.expand_array(GuestFrame(arg.array_gfn))?,
        EvtchnArgs::SetPriority(arg) => evtchn.set_priority(arg.port, arg.priority)?,
        EvtchnArgs::Unsupported(op) => return ax_err!(Unsupported, op_name(op)),
    }
    Ok(())
}

/// Resolves the `dom` field of an operation that may act on another domain.
///
/// `None` means the caller itself. Only privileged domains may name others.
fn target_domain(domain: &Domain, dom: u16) -> AxResult<Option<DomainRef>> {
    let id = DomId(dom).resolve(domain.id);
    if id == domain.id {
        return Ok(None);
    }
    if !domain.privileged {
        return ax_err!(PermissionDenied, "operation on another domain");
    }
    domain.evtchn.lookup(id).map(Some)
}

fn status_info(status: ChannelStatus) -> StatusInfo {
    match status {
        ChannelStatus::Unbound { remote } => StatusInfo {
            unbound: UnboundStatus { dom: remote.0 },
        },
        ChannelStatus::Interdomain { remote, port } => StatusInfo {
            interdomain: InterdomainStatus {
                dom: remote.0,
                port,
            },
        },
        ChannelStatus::Pirq(pirq) => StatusInfo { pirq },
        ChannelStatus::Virq(virq) => StatusInfo { virq },
        ChannelStatus::Closed | ChannelStatus::Ipi => StatusInfo::default(),
    }
}

fn op_name(op: EvtchnOp) -> &'static str {
    match op {
        EvtchnOp::BindPirq => "EVTCHNOP_bind_pirq",
        EvtchnOp::ResetCont => "EVTCHNOP_reset_cont",
        _ => "unimplemented event channel operation",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{DOMID_SELF, EVTCHNSTAT_INTERDOMAIN, EVTCHNSTAT_UNBOUND, VIRQ_TIMER};
    use crate::config::DomainConfig;
    use crate::mem::{GuestMemory, GuestPage};
    use crate::registry::DomainRegistry;
    use crate::vcpu::VirtualCpu;
    use alloc::sync::Arc;

    struct NoMemory;

    impl GuestMemory for NoMemory {
        fn map_guest_frame(&self, _gfn: GuestFrame) -> AxResult<GuestPage> {
            ax_err!(BadAddress, "no guest memory")
        }
    }

    struct IdleCpu;

    impl VirtualCpu for IdleCpu {
        fn id(&self) -> VcpuId {
            0
        }
        fn queue_virtual_interrupt(&self, _vector: u32) {}
        fn inject_virtual_interrupt(&self, _vector: u32) {}
    }

    fn domain(registry: &Arc<DomainRegistry>, id: u16, privileged: bool) -> Arc<Domain> {
        let mut config = DomainConfig::new(DomId(id));
        config.privileged = privileged;
        registry
            .create_domain(
                &config,
                alloc::vec![Arc::new(IdleCpu) as Arc<dyn VirtualCpu>],
                Arc::new(NoMemory),
            )
            .unwrap()
    }

    #[test]
    fn test_opcode_decoding() {
        assert_eq!(EvtchnOp::try_from(0).unwrap(), EvtchnOp::BindInterdomain);
        assert_eq!(EvtchnOp::try_from(13).unwrap(), EvtchnOp::SetPriority);
        assert_eq!(EvtchnOp::try_from(15).unwrap_err(), AxError::Unsupported);
        assert_eq!(EvtchnOp::ExpandArray as u32, 12);
    }

    #[test]
    fn test_alloc_unbound_and_status() {
        let registry = DomainRegistry::new();
        let dom = domain(&registry, 1, false);

        let mut alloc = AllocUnbound {
            dom: DOMID_SELF.0,
            remote_dom: 2,
            port: 0,
        };
        assert_eq!(dispatch(&dom, 0, EvtchnArgs::AllocUnbound(&mut alloc)), 0);
        assert_eq!(alloc.port, 1);

        let mut status = EvtchnStatus {
            dom: DOMID_SELF.0,
            port: alloc.port,
            ..Default::default()
        };
        assert_eq!(dispatch(&dom, 0, EvtchnArgs::Status(&mut status)), 0);
        assert_eq!(status.status, EVTCHNSTAT_UNBOUND);
        assert_eq!(unsafe { status.u.unbound.dom }, 2);
    }

    #[test]
    fn test_other_domain_needs_privilege() {
        let registry = DomainRegistry::new();
        let dom0 = domain(&registry, 0, true);
        let guest = domain(&registry, 1, false);

        let mut alloc = AllocUnbound {
            dom: 0,
            remote_dom: DOMID_SELF.0,
            port: 0,
        };
        assert_eq!(dispatch(&guest, 0, EvtchnArgs::AllocUnbound(&mut alloc)), -1);

        // dom0 sets up a port in the guest that waits for dom0.
        let mut alloc = AllocUnbound {
            dom: 1,
            remote_dom: DOMID_SELF.0,
            port: 0,
        };
        assert_eq!(dispatch(&dom0, 0, EvtchnArgs::AllocUnbound(&mut alloc)), 0);

        let mut bind = BindInterdomain {
            remote_dom: 1,
            remote_port: alloc.port,
            local_port: 0,
        };
        assert_eq!(dispatch(&dom0, 0, EvtchnArgs::BindInterdomain(&mut bind)), 0);

        let mut status = EvtchnStatus {
            dom: 1,
            port: alloc.port,
            ..Default::default()
        };
        assert_eq!(dispatch(&dom0, 0, EvtchnArgs::Status(&mut status)), 0);
        assert_eq!(status.status, EVTCHNSTAT_INTERDOMAIN);
        let peer = unsafe { status.u.interdomain };
        assert_eq!((peer.dom, peer.port), (0, bind.local_port));

        let mut reset = Reset { dom: 0 };
        assert_eq!(dispatch(&guest, 0, EvtchnArgs::Reset(&mut reset)), -1);

        let mut status = EvtchnStatus {
            dom: 9,
            port: 1,
            ..Default::default()
        };
        assert_eq!(dispatch(&dom0, 0, EvtchnArgs::Status(&mut status)), -3);
    }

    #[test]
    fn test_error_codes() {
        let registry = DomainRegistry::new();
        let dom = domain(&registry, 1, false);

        assert_eq!(dispatch(&dom, 0, EvtchnArgs::Close(&mut Close { port: 1 })), -22);
        assert_eq!(
            dispatch(&dom, 0, EvtchnArgs::Unsupported(EvtchnOp::BindPirq)),
            -38
        );

        let mut init = InitControl {
            control_gfn: 5,
            ..Default::default()
        };
        assert_eq!(dispatch(&dom, 0, EvtchnArgs::InitControl(&mut init)), -38);

        let mut virq = BindVirq {
            virq: VIRQ_TIMER,
            vcpu: 0,
            port: 0,
        };
        assert_eq!(dispatch(&dom, 0, EvtchnArgs::BindVirq(&mut virq)), 0);
        virq.port = 0;
        assert_eq!(dispatch(&dom, 0, EvtchnArgs::BindVirq(&mut virq)), -17);
    }
}
