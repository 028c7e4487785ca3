//! Guest-visible event channel ABI.
//!
//! Everything in this module is bit-exact with the Xen public header
//! `event_channel.h` (FIFO ABI). Argument structures are `#[repr(C)]` and are
//! handed to [`crate::hypercall::dispatch`] after the hypercall layer has mapped
//! the guest pointer.

use crate::registry::DomId;

/// Event channel port number.
pub type Port = u32;

/// Virtual CPU index within a domain.
pub type VcpuId = u32;

/// Port 0 is never handed out to guests.
pub const NULL_PORT: Port = 0;

/// Refers to the calling domain in `dom`/`remote_dom` fields.
pub const DOMID_SELF: DomId = DomId(0x7FF0);

/// Largest number of ports the FIFO ABI can address.
pub const EVTCHN_FIFO_NR_CHANNELS: u32 = 1 << EVTCHN_FIFO_LINK_BITS;

/// Width of the `LINK` field of an event word.
pub const EVTCHN_FIFO_LINK_BITS: u32 = 17;
/// Mask of the `LINK` field of an event word.
pub const EVTCHN_FIFO_LINK_MASK: u32 = (1 << EVTCHN_FIFO_LINK_BITS) - 1;

/// Event word bit positions.
pub const EVTCHN_FIFO_PENDING: u32 = 31;
pub const EVTCHN_FIFO_MASKED: u32 = 30;
pub const EVTCHN_FIFO_LINKED: u32 = 29;
pub const EVTCHN_FIFO_BUSY: u32 = 28;

/// Highest priority.
pub const EVTCHN_FIFO_PRIORITY_MAX: u8 = 0;
/// Priority given to newly allocated channels.
pub const EVTCHN_FIFO_PRIORITY_DEFAULT: u8 = 7;
/// Lowest priority.
pub const EVTCHN_FIFO_PRIORITY_MIN: u8 = 15;
/// One queue per priority level.
pub const EVTCHN_FIFO_MAX_QUEUES: usize = EVTCHN_FIFO_PRIORITY_MIN as usize + 1;

/// Status values reported by `EVTCHNOP_status`.
pub const EVTCHNSTAT_CLOSED: u32 = 0;
pub const EVTCHNSTAT_UNBOUND: u32 = 1;
pub const EVTCHNSTAT_INTERDOMAIN: u32 = 2;
pub const EVTCHNSTAT_PIRQ: u32 = 3;
pub const EVTCHNSTAT_VIRQ: u32 = 4;
pub const EVTCHNSTAT_IPI: u32 = 5;

/// Lowest vector accepted as an upcall vector.
pub const MIN_UPCALL_VECTOR: u32 = 0x10;

/// Per-vCPU timer.
pub const VIRQ_TIMER: u32 = 0;
/// Request guest to dump debug info.
pub const VIRQ_DEBUG: u32 = 1;
/// Bytes received on the emergency console.
pub const VIRQ_CONSOLE: u32 = 2;
/// A domain has exited.
pub const VIRQ_DOM_EXC: u32 = 3;
/// Trace buffer has records available.
pub const VIRQ_TBUF: u32 = 4;
/// A domain has paused for debugging.
pub const VIRQ_DEBUGGER: u32 = 6;
/// Profiling samples available.
pub const VIRQ_XENOPROF: u32 = 7;
/// Console ring has characters available.
pub const VIRQ_CON_RING: u32 = 8;
/// Physical CPU state changed.
pub const VIRQ_PCPU_STATE: u32 = 9;
/// Memory event ring has work.
pub const VIRQ_MEM_EVENT: u32 = 10;
/// Argo interdomain message.
pub const VIRQ_ARGO: u32 = 11;
/// Low memory in the hypervisor heap.
pub const VIRQ_ENOMEM: u32 = 12;
/// Performance monitoring unit interrupt.
pub const VIRQ_XENPMU: u32 = 13;
/// Size of the VIRQ space, including architecture-specific VIRQs.
pub const NR_VIRQS: usize = 24;

/// Static description of a VIRQ.
#[derive(Debug, Clone, Copy)]
pub struct VirqInfo {
    pub name: &'static str,
    /// Global VIRQs may only be bound on vCPU 0.
    pub global: bool,
}

const fn virq(name: &'static str, global: bool) -> Option<VirqInfo> {
    Some(VirqInfo { name, global })
}

static VIRQ_INFO: [Option<VirqInfo>; NR_VIRQS] = [
    virq("VIRQ_TIMER", false),
    virq("VIRQ_DEBUG", false),
    virq("VIRQ_CONSOLE", true),
    virq("VIRQ_DOM_EXC", true),
    virq("VIRQ_TBUF", true),
    None,
    virq("VIRQ_DEBUGGER", true),
    virq("VIRQ_XENOPROF", false),
    virq("VIRQ_CON_RING", true),
    virq("VIRQ_PCPU_STATE", true),
    virq("VIRQ_MEM_EVENT", true),
    virq("VIRQ_ARGO", true),
    virq("VIRQ_ENOMEM", true),
    virq("VIRQ_XENPMU", false),
    None,
    None,
    None,
    None,
    None,
    None,
    None,
    None,
    None,
    None,
];

/// Looks up a VIRQ recognized by this hypervisor.
pub fn virq_info(virq: u32) -> Option<&'static VirqInfo> {
    VIRQ_INFO.get(virq as usize)?.as_ref()
}

/// Guest-shared FIFO control block.
///
/// Only ever accessed through atomics: the guest reads and writes it without
/// calling into the hypervisor.
#[repr(C)]
pub struct ControlBlock {
    pub ready: core::sync::atomic::AtomicU32,
    _rsvd: core::sync::atomic::AtomicU32,
    pub head: [core::sync::atomic::AtomicU32; EVTCHN_FIFO_MAX_QUEUES],
}

/// `EVTCHNOP_init_control`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct InitControl {
    pub control_gfn: u64,
    pub offset: u32,
    pub vcpu: u32,
    /// OUT
    pub link_bits: u8,
    pub _pad: [u8; 7],
}

/// `EVTCHNOP_expand_array`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ExpandArray {
    pub array_gfn: u64,
}

/// `EVTCHNOP_set_priority`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SetPriority {
    pub port: Port,
    pub priority: u32,
}

/// Payload of [`EvtchnStatus`], selected by `status`.
#[repr(C)]
#[derive(Clone, Copy)]
pub union StatusInfo {
    pub unbound: UnboundStatus,
    pub interdomain: InterdomainStatus,
    pub pirq: u32,
    pub virq: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct UnboundStatus {
    pub dom: u16,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct InterdomainStatus {
    pub dom: u16,
    pub port: Port,
}

impl Default for StatusInfo {
    fn default() -> Self {
        Self {
            interdomain: InterdomainStatus::default(),
        }
    }
}

impl core::fmt::Debug for StatusInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("StatusInfo { .. }")
    }
}

/// `EVTCHNOP_status`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct EvtchnStatus {
    pub dom: u16,
    pub port: Port,
    /// OUT
    pub status: u32,
    /// OUT
    pub vcpu: u32,
    /// OUT
    pub u: StatusInfo,
}

/// `EVTCHNOP_unmask`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Unmask {
    pub port: Port,
}

/// `EVTCHNOP_alloc_unbound`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct AllocUnbound {
    pub dom: u16,
    pub remote_dom: u16,
    /// OUT
    pub port: Port,
}

/// `EVTCHNOP_bind_interdomain`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct BindInterdomain {
    pub remote_dom: u16,
    pub remote_port: Port,
    /// OUT
    pub local_port: Port,
}

/// `EVTCHNOP_bind_virq`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct BindVirq {
    pub virq: u32,
    pub vcpu: u32,
    /// OUT
    pub port: Port,
}

/// `EVTCHNOP_bind_ipi`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct BindIpi {
    pub vcpu: u32,
    /// OUT
    pub port: Port,
}

/// `EVTCHNOP_bind_vcpu`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct BindVcpu {
    pub port: Port,
    pub vcpu: u32,
}

/// `EVTCHNOP_close`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Close {
    pub port: Port,
}

/// `EVTCHNOP_send`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct EvtchnSend {
    pub port: Port,
}

/// `EVTCHNOP_reset`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Reset {
    pub dom: u16,
}

const _: () = assert!(core::mem::size_of::<ControlBlock>() == 72);
const _: () = assert!(core::mem::size_of::<InitControl>() == 24);
const _: () = assert!(core::mem::size_of::<EvtchnStatus>() == 24);
const _: () = assert!(EVTCHN_FIFO_NR_CHANNELS.is_power_of_two());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virq_table() {
        assert!(!virq_info(VIRQ_TIMER).unwrap().global);
        assert!(virq_info(VIRQ_CONSOLE).unwrap().global);
        assert!(virq_info(5).is_none());
        assert!(virq_info(NR_VIRQS as u32).is_none());
    }

    #[test]
    fn test_link_field_covers_all_ports() {
        assert_eq!(EVTCHN_FIFO_LINK_MASK + 1, EVTCHN_FIFO_NR_CHANNELS);
        assert!(EVTCHN_FIFO_BUSY > EVTCHN_FIFO_LINK_BITS);
    }
}
