//! Centralized configuration for Undertow.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::time::Duration;

use crate::net::EncryptionMode;

/// Central configuration for all Undertow components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct UndertowConfig {
    /// Peer population limits.
    pub peers: PeerConfig,
    /// Transport and discovery toggles.
    pub network: NetworkConfig,
    /// Pulse scheduling periods.
    pub timing: TimingConfig,
    /// Determinism controls for testing.
    pub simulation: SimulationConfig,
}

/// Peer population and upload-slot limits.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Hard cap on concurrent peers across all torrents.
    pub peer_limit_global: usize,
    /// Hard cap on concurrent peers per swarm.
    pub peer_limit_per_torrent: usize,
    /// Interested unchokes granted per swarm per rechoke pulse.
    pub upload_slots_per_torrent: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            peer_limit_global: 200,
            peer_limit_per_torrent: 50,
            upload_slots_per_torrent: 14,
        }
    }
}

/// Transport, discovery, and queue configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Peer-connection encryption policy.
    pub encryption_mode: EncryptionMode,
    /// Whether plain TCP connections are allowed.
    pub allows_tcp: bool,
    /// Whether uTP connections are allowed.
    pub allows_utp: bool,
    /// Whether DHT discovery is allowed.
    pub allows_dht: bool,
    /// Whether peer exchange is allowed.
    pub allows_pex: bool,
    /// Whether the download start-queue is enforced.
    pub download_queue_enabled: bool,
    /// Concurrently downloading torrents when the queue is enforced.
    pub download_queue_size: usize,
    /// Whether the seed start-queue is enforced.
    pub seed_queue_enabled: bool,
    /// Concurrently seeding torrents when the queue is enforced.
    pub seed_queue_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            encryption_mode: EncryptionMode::Preferred,
            allows_tcp: true,
            allows_utp: true,
            allows_dht: true,
            allows_pex: true,
            download_queue_enabled: true,
            download_queue_size: 5,
            seed_queue_enabled: false,
            seed_queue_size: 10,
        }
    }
}

/// Periods for the three manager pulses.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Bandwidth pulse period.
    pub bandwidth_period: Duration,
    /// Steady-state rechoke pulse period.
    pub rechoke_period: Duration,
    /// Accelerated rechoke period after swarm state changes.
    pub rechoke_soon_period: Duration,
    /// Stale-request sweep period.
    pub refill_upkeep_period: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            bandwidth_period: Duration::from_millis(500),
            rechoke_period: Duration::from_secs(10),
            rechoke_soon_period: Duration::from_millis(100),
            refill_upkeep_period: Duration::from_secs(10),
        }
    }
}

/// Determinism controls for testing and reproduction.
#[derive(Debug, Clone, Default)]
pub struct SimulationConfig {
    /// Seed for salt generation and the optimistic-unchoke draw.
    /// `None` seeds from entropy.
    pub deterministic_seed: Option<u64>,
}

impl UndertowConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(max_peers) = std::env::var("UNDERTOW_PEER_LIMIT") {
            if let Ok(count) = max_peers.parse::<usize>() {
                config.peers.peer_limit_global = count;
            }
        }

        if let Ok(max_peers) = std::env::var("UNDERTOW_PEER_LIMIT_PER_TORRENT") {
            if let Ok(count) = max_peers.parse::<usize>() {
                config.peers.peer_limit_per_torrent = count;
            }
        }

        if let Ok(slots) = std::env::var("UNDERTOW_UPLOAD_SLOTS") {
            if let Ok(count) = slots.parse::<usize>() {
                config.peers.upload_slots_per_torrent = count;
            }
        }

        if let Ok(utp) = std::env::var("UNDERTOW_UTP") {
            config.network.allows_utp = utp.parse().unwrap_or(true);
        }

        if let Ok(seed) = std::env::var("UNDERTOW_SEED") {
            if let Ok(seed_value) = seed.parse::<u64>() {
                config.simulation.deterministic_seed = Some(seed_value);
            }
        }

        config
    }

    /// Creates a configuration optimized for deterministic testing.
    pub fn for_testing() -> Self {
        Self {
            simulation: SimulationConfig {
                deterministic_seed: Some(42),
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = UndertowConfig::default();

        assert_eq!(config.peers.peer_limit_global, 200);
        assert_eq!(config.peers.peer_limit_per_torrent, 50);
        assert!(config.network.allows_tcp);
        assert!(config.network.allows_utp);
        assert_eq!(config.timing.bandwidth_period, Duration::from_millis(500));
        assert_eq!(config.timing.rechoke_period, Duration::from_secs(10));
        assert_eq!(config.simulation.deterministic_seed, None);
    }

    #[test]
    fn test_testing_preset_is_deterministic() {
        let config = UndertowConfig::for_testing();
        assert_eq!(config.simulation.deterministic_seed, Some(42));
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("UNDERTOW_PEER_LIMIT", "100");
            std::env::set_var("UNDERTOW_UPLOAD_SLOTS", "4");
            std::env::set_var("UNDERTOW_SEED", "12345");
        }

        let config = UndertowConfig::from_env();

        assert_eq!(config.peers.peer_limit_global, 100);
        assert_eq!(config.peers.upload_slots_per_torrent, 4);
        assert_eq!(config.simulation.deterministic_seed, Some(12345));

        unsafe {
            std::env::remove_var("UNDERTOW_PEER_LIMIT");
            std::env::remove_var("UNDERTOW_UPLOAD_SLOTS");
            std::env::remove_var("UNDERTOW_SEED");
        }
    }
}
