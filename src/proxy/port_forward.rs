//! The "port" proxy variant (§4.I): pass-through to a single fixed local
//! port shared across sessions, used to forward an ad-hoc dev server the
//! user starts inside their IDE (Live Server, Shiny, Vite, ...). Unlike the
//! IDE variants, this port is named up front by `ADDITIONAL_PORTS` and
//! never goes through `PortRegistry` — it is not session-specific.

/// One configured forwarding target. `local_port` and `remote_port` are
/// the same fixed value here: the tunnel and the proxy agree on it ahead
/// of time rather than negotiating one per session.
#[derive(Debug, Clone, Copy)]
pub struct PortForward {
    pub port: u16,
}

impl PortForward {
    pub fn new(port: u16) -> PortForward {
        PortForward { port }
    }
}

/// Builds the configured set of dev-server forwards from
/// `BrokerConfig::additional_ports`.
pub fn from_configured_ports(ports: &[u16]) -> Vec<PortForward> {
    ports.iter().copied().map(PortForward::new).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_one_forward_per_configured_port() {
        let forwards = from_configured_ports(&[5500, 8080]);
        assert_eq!(forwards.len(), 2);
        assert_eq!(forwards[0].port, 5500);
        assert_eq!(forwards[1].port, 8080);
    }

    #[test]
    fn empty_configuration_yields_no_forwards() {
        assert!(from_configured_ports(&[]).is_empty());
    }
}
