//! Per-vCPU event state and the vCPU collaborator interface.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use axerrno::{AxResult, ax_err};
use spin::{Mutex, MutexGuard, Once};

use crate::abi::{NR_VIRQS, NULL_PORT, Port, VcpuId};
use crate::queue::EventControl;

/// The hypervisor's virtual CPU, as seen by event delivery.
pub trait VirtualCpu: Send + Sync {
    /// Index of the vCPU within its domain.
    fn id(&self) -> VcpuId;

    /// Makes `vector` pending; it is delivered on the vCPU's next entry.
    fn queue_virtual_interrupt(&self, vector: u32);

    /// Delivers `vector` immediately. Only valid on the physical CPU currently
    /// running this vCPU.
    fn inject_virtual_interrupt(&self, vector: u32);

    /// Makes `vector` pending from another domain's context, without touching
    /// this vCPU's loaded state.
    fn push_virtual_interrupt(&self, vector: u32) {
        self.queue_virtual_interrupt(vector);
    }
}

/// Event channel state owned by one vCPU.
pub struct VcpuEvents {
    vcpu: Arc<dyn VirtualCpu>,
    control: Once<EventControl>,
    upcall_vector: AtomicU32,
    virqs: Mutex<[Port; NR_VIRQS]>,
}

impl VcpuEvents {
    pub fn new(vcpu: Arc<dyn VirtualCpu>) -> Self {
        Self {
            vcpu,
            control: Once::new(),
            upcall_vector: AtomicU32::new(0),
            virqs: Mutex::new([NULL_PORT; NR_VIRQS]),
        }
    }

    pub fn vcpu(&self) -> &dyn VirtualCpu {
        self.vcpu.as_ref()
    }

    /// The control block, once the guest has registered one.
    pub fn control(&self) -> Option<&EventControl> {
        self.control.get()
    }

    /// Installs the control block. A vCPU's control block is set only once.
    pub(crate) fn install_control(&self, control: EventControl) -> AxResult {
        let mut installed = false;
        self.control.call_once(|| {
            installed = true;
            control
        });
        if !installed {
            return ax_err!(BadState, "control block already initialized");
        }
        Ok(())
    }

    /// Callback vector, or 0 if the guest has not set one.
    pub fn upcall_vector(&self) -> u32 {
        self.upcall_vector.load(Ordering::Acquire)
    }

    pub(crate) fn set_upcall_vector(&self, vector: u32) {
        self.upcall_vector.store(vector, Ordering::Release);
    }

    /// Port bound to `virq` on this vCPU.
    pub fn virq_port(&self, virq: u32) -> Option<Port> {
        let port = *self.virqs.lock().get(virq as usize)?;
        (port != NULL_PORT).then_some(port)
    }

    pub(crate) fn virqs(&self) -> MutexGuard<'_, [Port; NR_VIRQS]> {
        self.virqs.lock()
    }
}

impl core::fmt::Debug for VcpuEvents {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VcpuEvents")
            .field("vcpu", &self.vcpu.id())
            .field("control", &self.control.get())
            .field("upcall_vector", &self.upcall_vector())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{GuestFrame, GuestPage, HostPage};
    use alloc::boxed::Box;

    struct NullCpu;

    impl VirtualCpu for NullCpu {
        fn id(&self) -> VcpuId {
            0
        }
        fn queue_virtual_interrupt(&self, _vector: u32) {}
        fn inject_virtual_interrupt(&self, _vector: u32) {}
    }

    fn control() -> EventControl {
        let host: &'static HostPage = Box::leak(Box::new(HostPage::new()));
        EventControl::new(GuestPage::from_host(GuestFrame(1), host), 0)
    }

    #[test]
    fn test_control_installed_once() {
        let events = VcpuEvents::new(Arc::new(NullCpu));
        assert!(events.control().is_none());
        assert!(events.install_control(control()).is_ok());
        assert!(events.control().is_some());
        assert_eq!(
            events.install_control(control()).unwrap_err(),
            axerrno::AxError::BadState
        );
    }

    #[test]
    fn test_virq_table() {
        let events = VcpuEvents::new(Arc::new(NullCpu));
        assert_eq!(events.virq_port(0), None);
        events.virqs()[0] = 12;
        assert_eq!(events.virq_port(0), Some(12));
        assert_eq!(events.virq_port(NR_VIRQS as u32), None);
    }
}
