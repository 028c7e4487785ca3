use axerrno::{AxResult, ax_err};

use crate::abi::{DOMID_SELF, EVTCHN_FIFO_NR_CHANNELS};
use crate::registry::DomId;

/// Event channel limits of one domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvtchnConfig {
    /// Highest usable port. `max_port + 1` ports exist, port 0 included.
    pub max_port: u32,
}

impl EvtchnConfig {
    pub const fn new(max_port: u32) -> Self {
        Self { max_port }
    }

    /// Size of the port space.
    pub const fn nr_ports(&self) -> u32 {
        self.max_port + 1
    }

    /// Checks that the port space is a power of two the FIFO ABI can address.
    pub fn validate(&self) -> AxResult {
        let Some(nr_ports) = self.max_port.checked_add(1) else {
            return ax_err!(InvalidInput, "max_port out of range");
        };
        if nr_ports < 2 || !nr_ports.is_power_of_two() {
            return ax_err!(InvalidInput, "number of ports must be a power of two");
        }
        if nr_ports > EVTCHN_FIFO_NR_CHANNELS {
            return ax_err!(InvalidInput, "number of ports exceeds the FIFO limit");
        }
        Ok(())
    }
}

impl Default for EvtchnConfig {
    fn default() -> Self {
        Self::new(1023)
    }
}

/// Per-domain settings the registry needs at creation time.
#[derive(Debug, Clone, Copy)]
pub struct DomainConfig {
    pub id: DomId,
    /// May operate on other domains' channels.
    pub privileged: bool,
    pub evtchn: EvtchnConfig,
}

impl DomainConfig {
    pub fn new(id: DomId) -> Self {
        Self {
            id,
            privileged: false,
            evtchn: EvtchnConfig::default(),
        }
    }

    pub fn validate(&self) -> AxResult {
        if self.id.0 >= DOMID_SELF.0 {
            return ax_err!(InvalidInput, "reserved domain id");
        }
        self.evtchn.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_port_space() {
        let config = EvtchnConfig::default();
        assert_eq!(config.nr_ports(), 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_port_spaces() {
        assert!(EvtchnConfig::new(1000).validate().is_err());
        assert!(EvtchnConfig::new(0).validate().is_err());
        assert!(EvtchnConfig::new(EVTCHN_FIFO_NR_CHANNELS * 2 - 1).validate().is_err());
        assert!(EvtchnConfig::new(u32::MAX).validate().is_err());
        assert!(EvtchnConfig::new(EVTCHN_FIFO_NR_CHANNELS - 1).validate().is_ok());
    }

    #[test]
    fn test_reserved_domain_id() {
        assert!(DomainConfig::new(DOMID_SELF).validate().is_err());
        assert!(DomainConfig::new(DomId(0)).validate().is_ok());
    }
}
