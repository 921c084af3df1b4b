//! In-band TLS upgrade negotiation.
//!
//! After `ACCEPT` on a version with the tls-upgrade capability the client
//! announces a [`TlsRequirement`] and the server answers with a
//! [`TlsResult`]. This module holds the pure decision logic; installing
//! the record layer is left to the transport through
//! [`SessionAdapter::install_tls`](crate::adapter::SessionAdapter::install_tls).

use crate::config::ProtocolConfig;
use tandem_protocol::{TlsRequirement, TlsResult};

/// One endpoint's TLS stance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TlsPolicy {
    pub supports: bool,
    pub requires: bool,
}

impl TlsPolicy {
    pub fn new(supports: bool, requires: bool) -> Self {
        Self { supports, requires }
    }

    pub fn from_config(config: &ProtocolConfig) -> Self {
        Self::new(config.supports_tls, config.requires_tls)
    }

    /// The requirement a client announces in `START_TLS_REQUEST`.
    pub fn requirement(&self) -> TlsRequirement {
        if self.requires {
            TlsRequirement::Required
        } else if self.supports {
            TlsRequirement::Supported
        } else {
            TlsRequirement::None
        }
    }

    /// The server's answer to a client requirement.
    pub fn respond(&self, requirement: TlsRequirement) -> TlsResult {
        match requirement {
            TlsRequirement::None if self.requires => TlsResult::FailedNegotiation,
            TlsRequirement::None => TlsResult::Plaintext,
            TlsRequirement::Supported if self.supports => TlsResult::Ssl,
            TlsRequirement::Supported => TlsResult::Plaintext,
            TlsRequirement::Required if self.supports => TlsResult::Ssl,
            TlsRequirement::Required => TlsResult::FailedNegotiation,
        }
    }

    /// Whether a client with this policy can live with `result`.
    pub fn accepts(&self, result: TlsResult) -> bool {
        match result {
            TlsResult::Ssl => self.supports,
            TlsResult::Plaintext => !self.requires,
            TlsResult::FailedNegotiation => false,
        }
    }
}

/// Which side of the TLS handshake this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRole {
    /// Sends the ClientHello.
    Initiator,
    /// Waits for the ClientHello.
    Acceptor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_requirement() {
        assert_eq!(TlsPolicy::new(true, true).requirement(), TlsRequirement::Required);
        assert_eq!(TlsPolicy::new(true, false).requirement(), TlsRequirement::Supported);
        assert_eq!(TlsPolicy::new(false, false).requirement(), TlsRequirement::None);
    }

    #[test]
    fn test_server_result_table() {
        use TlsRequirement::{None as Nothing, Required, Supported};
        use TlsResult::{FailedNegotiation, Plaintext, Ssl};

        // (requirement, server supports, server requires, expected)
        let cases = [
            (Nothing, false, false, Plaintext),
            (Nothing, true, false, Plaintext),
            (Nothing, true, true, FailedNegotiation),
            (Supported, false, false, Plaintext),
            (Supported, true, false, Ssl),
            (Supported, true, true, Ssl),
            (Required, false, false, FailedNegotiation),
            (Required, true, false, Ssl),
            (Required, true, true, Ssl),
        ];

        for (requirement, supports, requires, expected) in cases {
            let policy = TlsPolicy::new(supports, requires);
            assert_eq!(
                policy.respond(requirement),
                expected,
                "requirement={:?} supports={} requires={}",
                requirement,
                supports,
                requires
            );
        }
    }

    #[test]
    fn test_ssl_iff_both_support() {
        for client_supports in [false, true] {
            for client_requires in [false, true] {
                if client_requires && !client_supports {
                    continue;
                }
                for server_supports in [false, true] {
                    for server_requires in [false, true] {
                        if server_requires && !server_supports {
                            continue;
                        }
                        let client = TlsPolicy::new(client_supports, client_requires);
                        let server = TlsPolicy::new(server_supports, server_requires);
                        let result = server.respond(client.requirement());
                        assert_eq!(
                            result == TlsResult::Ssl,
                            client_supports && server_supports
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_client_acceptance() {
        let strict = TlsPolicy::new(true, true);
        assert!(strict.accepts(TlsResult::Ssl));
        assert!(!strict.accepts(TlsResult::Plaintext));
        assert!(!strict.accepts(TlsResult::FailedNegotiation));

        let lax = TlsPolicy::new(false, false);
        assert!(lax.accepts(TlsResult::Plaintext));
    }
}
