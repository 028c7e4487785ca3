//! Domain registry with reference-counted lookup.
//!
//! Cross-domain event operations resolve their peer here. Every lookup hands
//! out a [`DomainRef`], which keeps the peer's lifecycle from completing
//! teardown until the reference is dropped.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use axerrno::{AxResult, ax_err};
use spin::RwLock;

use crate::abi::DOMID_SELF;
use crate::config::DomainConfig;
use crate::evtchn::EventChannels;
use crate::lifecycle::{DomainLifecycle, DomainState};
use crate::mem::GuestMemory;
use crate::vcpu::VirtualCpu;

/// Domain identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomId(pub u16);

impl DomId {
    /// Replaces [`DOMID_SELF`] with `current`.
    #[inline]
    pub fn resolve(self, current: DomId) -> DomId {
        if self == DOMID_SELF { current } else { self }
    }
}

impl core::fmt::Display for DomId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "d{}", self.0)
    }
}

/// A domain as far as event channels are concerned.
pub struct Domain {
    pub id: DomId,
    pub privileged: bool,
    lifecycle: DomainLifecycle,
    pub evtchn: EventChannels,
}

impl Domain {
    pub fn state(&self) -> DomainState {
        self.lifecycle.state()
    }
}

impl core::fmt::Debug for Domain {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Domain")
            .field("id", &self.id)
            .field("privileged", &self.privileged)
            .field("lifecycle", &self.lifecycle)
            .finish()
    }
}

/// A counted reference to a live domain. Dropping it performs the put.
pub struct DomainRef {
    domain: Arc<Domain>,
}

impl core::ops::Deref for DomainRef {
    type Target = Domain;

    fn deref(&self) -> &Domain {
        &self.domain
    }
}

impl Drop for DomainRef {
    fn drop(&mut self) {
        self.domain.lifecycle.put();
    }
}

/// All domains known to the hypervisor.
pub struct DomainRegistry {
    domains: RwLock<BTreeMap<DomId, Arc<Domain>>>,
}

impl DomainRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            domains: RwLock::new(BTreeMap::new()),
        })
    }

    /// Creates a domain and its event channel tables.
    ///
    /// # Arguments
    ///
    /// * `config` - Domain id, privilege and port space.
    /// * `vcpus` - The domain's vCPUs, indexed by their id.
    /// * `memory` - Mapper for the domain's guest frames.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The configuration is invalid or no vCPU is given
    /// - A domain with the same id is already registered
    pub fn create_domain(
        self: &Arc<Self>,
        config: &DomainConfig,
        vcpus: Vec<Arc<dyn VirtualCpu>>,
        memory: Arc<dyn GuestMemory>,
    ) -> AxResult<Arc<Domain>> {
        config.validate()?;
        if vcpus.is_empty() {
            return ax_err!(InvalidInput, "domain needs at least one vCPU");
        }

        let mut domains = self.domains.write();
        if domains.contains_key(&config.id) {
            return ax_err!(AlreadyExists, "domain id already in use");
        }

        let evtchn = EventChannels::new(
            config.id,
            &config.evtchn,
            vcpus,
            memory,
            Arc::downgrade(self),
        );
        let domain = Arc::new(Domain {
            id: config.id,
            privileged: config.privileged,
            lifecycle: DomainLifecycle::new(),
            evtchn,
        });
        domains.insert(config.id, domain.clone());

        debug!(
            "evtchn: created domain {} with {} ports",
            config.id,
            config.evtchn.nr_ports()
        );
        Ok(domain)
    }

    /// Looks up a running domain and takes a reference on it.
    pub fn get(&self, id: DomId) -> Option<DomainRef> {
        let domain = self.domains.read().get(&id)?.clone();
        if !domain.lifecycle.try_get() {
            return None;
        }
        Some(DomainRef { domain })
    }

    /// Tears down a domain.
    ///
    /// This performs a graceful removal:
    /// 1. Marks the domain as dying (lookups start failing)
    /// 2. Waits for outstanding references to be put
    /// 3. Closes all its channels, reverting peers to unbound
    /// 4. Marks the domain dead and unregisters it
    ///
    /// # Errors
    ///
    /// Returns an error if the domain is not found or already being torn down.
    pub fn destroy_domain(&self, id: DomId) -> AxResult {
        let Some(domain) = self.domains.read().get(&id).cloned() else {
            return ax_err!(NotFound, "domain not found");
        };

        if !domain.lifecycle.begin_teardown() {
            return ax_err!(BadState, "domain is already being destroyed");
        }

        domain.lifecycle.wait_idle();
        domain.evtchn.reset();
        domain.lifecycle.complete_teardown();

        self.domains.write().remove(&id);
        debug!("evtchn: destroyed domain {}", id);
        Ok(())
    }

    /// Ids of all registered domains.
    pub fn list_domains(&self) -> Vec<DomId> {
        self.domains.read().keys().copied().collect()
    }

    pub fn domain_count(&self) -> usize {
        self.domains.read().len()
    }
}
