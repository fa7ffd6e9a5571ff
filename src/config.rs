//! Dispatcher configuration. A single `Config`, built once at construction
//! time and wrapped in an `Arc` the way the teacher's `endpoint::Config` is,
//! rather than read from scattered globals.

use std::sync::Arc;
use std::time::Duration;

use error::ConfigError;

/// Tunables for a `Dispatcher` (spec.md §6). Construct via `Config::new()`
/// (which applies the spec's stated defaults) and override individual
/// fields before wrapping in `Arc` and handing to `Dispatcher::new`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Overall cap on connection IDs the buffered-packet store will track at
    /// once, CHLO-complete or not.
    pub max_connections: usize,
    /// Cap on connection IDs tracked without a complete CHLO, bounding
    /// amplification exposure from unauthenticated clients.
    pub max_connections_without_chlo: usize,
    /// Cap on packets buffered for any single connection ID.
    pub max_packets_per_connection: usize,
    /// How long a buffered-but-undispatched connection is kept before the
    /// expiration sweep discards it.
    pub connection_life_span: Duration,
    /// Server connection ID length this dispatcher expects on short-header
    /// packets, absent version-specific negotiation.
    pub expected_server_connection_id_length: usize,
    /// Whether an Initial packet's destination connection ID may be shorter
    /// than `MIN_INITIAL_CID_SIZE` (8 bytes). Normally rejected to match the
    /// anti-amplification requirements of RFC 9000 §7.2.
    pub allow_short_initial_server_connection_ids: bool,
    /// If true, the first Initial packet's destination connection ID length
    /// becomes `expected_server_connection_id_length` for the rest of this
    /// dispatcher's lifetime, instead of using a fixed configured value.
    pub update_expected_server_connection_id_length_from_first_packet: bool,
    /// QUIC versions this dispatcher will create sessions for; any other
    /// version triggers a Version Negotiation packet.
    pub supported_versions: Vec<u32>,
    /// ALPN protocol identifiers this server offers, most preferred first.
    pub supported_alpns: Vec<String>,
    /// Time-wait list retention (component F).
    pub time_wait_list_capacity: usize,
    pub time_wait_list_ttl: Duration,
}

impl Config {
    /// Builds a `Config` with the spec's stated defaults.
    pub fn new() -> Self {
        Config {
            max_connections: 10_000,
            max_connections_without_chlo: 300,
            max_packets_per_connection: 100,
            connection_life_span: Duration::from_millis(100),
            expected_server_connection_id_length: 8,
            allow_short_initial_server_connection_ids: false,
            update_expected_server_connection_id_length_from_first_packet: false,
            supported_versions: vec![::VERSION],
            supported_alpns: Vec::new(),
            time_wait_list_capacity: 10_000,
            time_wait_list_ttl: Duration::from_secs(60),
        }
    }

    /// Wraps `self` in an `Arc`, checking the invariants a malformed `Config`
    /// would otherwise violate silently (spec.md §6).
    pub fn validated(self) -> Result<Arc<Self>, ConfigError> {
        if self.supported_versions.is_empty() {
            return Err(ConfigError::NoSupportedVersions);
        }
        if self.expected_server_connection_id_length > ::cid::MAX_CID_SIZE {
            return Err(ConfigError::InvalidCidLength(self.expected_server_connection_id_length));
        }
        Ok(Arc::new(self))
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.max_connections, 10_000);
        assert_eq!(cfg.max_connections_without_chlo, 300);
        assert_eq!(cfg.max_packets_per_connection, 100);
        assert_eq!(cfg.connection_life_span, Duration::from_millis(100));
        assert_eq!(cfg.expected_server_connection_id_length, 8);
        assert!(!cfg.allow_short_initial_server_connection_ids);
        assert!(!cfg.update_expected_server_connection_id_length_from_first_packet);
    }

    #[test]
    fn empty_supported_versions_is_rejected() {
        let mut cfg = Config::default();
        cfg.supported_versions.clear();
        assert!(cfg.validated().is_err());
    }
}
