#![no_std]

//! # Event Channels for ArceOS Guests
//!
//! This crate implements Xen-compatible event channels using the FIFO ABI.
//! Guests, the privileged host domain and in-hypervisor device emulation use
//! them to signal each other. It is designed for `no_std` environments and
//! uses the `alloc` crate for dynamic memory allocation.
//!
//! ## Architecture
//!
//! The module is organized into multiple layers:
//!
//! ### Guest ABI
//! - [`abi`]: Event word bits, priorities, control block layout and the
//!   hypercall argument structures, bit-exact with Xen
//! - [`EventWord`]: Atomic view of one guest-shared event word
//! - [`GuestMemory`]: Trait through which guest frames are mapped
//!
//! ### Per-Domain Engine
//! - [`EventChannels`]: Port allocation, the binding protocol and event
//!   delivery into per-vCPU priority queues
//! - [`Channel`]: One cache-line sized, individually locked port record
//! - [`VirtualCpu`]: Trait through which upcall interrupts reach a vCPU
//!
//! ### Domains
//! - [`DomainRegistry`]: Reference-counted domain lookup and teardown
//! - [`DomainRef`]: Guard keeping a peer domain alive during an operation
//!
//! ### Hypercalls
//! - [`dispatch`]: Runs a decoded `EVTCHNOP_*` and returns 0 or `-errno`
//!
//! ## Locking
//!
//! All locks are spinlocks. They are taken in the order: domain event lock(s),
//! one channel lock, one queue lock. Two domains' event locks are always taken
//! in domain id order.
//!
//! ## Examples
//!
//! ```rust,ignore
//! use axevtchn::{DomId, DomainConfig, DomainRegistry, GuestFrame};
//!
//! let registry = DomainRegistry::new();
//! let dom0 = registry.create_domain(&DomainConfig::new(DomId(0)), dom0_vcpus, dom0_memory)?;
//! let guest = registry.create_domain(&DomainConfig::new(DomId(1)), guest_vcpus, guest_memory)?;
//!
//! // The guest registers its control block and first event word page.
//! guest.evtchn.init_control(0, GuestFrame(0x8000), 0)?;
//! guest.evtchn.expand_array(GuestFrame(0x8001))?;
//! guest.evtchn.set_upcall_vector(0, 0xf3)?;
//!
//! // The guest offers a port to dom0, which binds it.
//! let guest_port = guest.evtchn.alloc_unbound(DomId(0))?;
//! let dom0_port = dom0.evtchn.bind_interdomain(DomId(1), guest_port)?;
//!
//! // Signalling dom0's end links the guest's port and interrupts its vCPU.
//! dom0.evtchn.send(dom0_port)?;
//! ```
//!
//! ### Timer Interrupts
//!
//! ```rust,ignore
//! // In the timer handler of vCPU `id`:
//! domain.evtchn.inject_virq(id, axevtchn::abi::VIRQ_TIMER)?;
//! ```

extern crate alloc;
#[macro_use]
extern crate log;

pub mod abi;
mod chan;
mod config;
mod delivery;
mod error;
mod evtchn;
mod hypercall;
mod lifecycle;
mod mem;
mod queue;
mod registry;
mod sync;
mod table;
mod vcpu;
mod word;

pub use chan::{Channel, ChannelInfo, ChannelState, ChannelStatus};
pub use config::{DomainConfig, EvtchnConfig};
pub use error::{guest_errno, hypercall_status};
pub use evtchn::EventChannels;
pub use hypercall::{EvtchnArgs, EvtchnOp, dispatch};
pub use lifecycle::DomainState;
pub use mem::{GuestFrame, GuestMemory, GuestPage, HostPage};
pub use queue::{EventControl, EventQueue};
pub use registry::{DomId, Domain, DomainRef, DomainRegistry};
pub use vcpu::{VcpuEvents, VirtualCpu};
pub use word::EventWord;

pub use abi::{Port, VcpuId};
