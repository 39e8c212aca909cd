//! TOML configuration for the satellite and storage node processes.
//!
//! Structs are small and typed; every knob has a default matching the
//! production values, so an empty file is a valid config. The binaries load
//! these at bootstrap (`--config-dir` / `ORBIT_CONFIG_DIR`); library code
//! receives the sub-structs by value at construction.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::Error;

/// Audit worker knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Floor for the per-share download timeout.
    pub min_download_timeout_ms: u64,
    /// Timeout scales as share_size / this rate, if larger than the floor.
    pub min_bytes_per_second: u64,
    /// Pending audits older than this convert to an offline tally.
    pub containment_window_ms: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        AuditConfig {
            min_download_timeout_ms: 5_000,
            min_bytes_per_second: 128 * 1024,
            containment_window_ms: 7 * 24 * 60 * 60 * 1000,
        }
    }
}

/// Repair checker and worker knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    /// Attempts before a queue entry is dead-lettered.
    pub max_attempts: u32,
    /// Lease duration on a dequeued segment; stale leases are reclaimed.
    pub lease_ms: u64,
    /// Checker sweep interval.
    pub interval_ms: u64,
    /// Budget for one whole-piece transfer during repair.
    pub transfer_timeout_ms: u64,
}

impl Default for RepairConfig {
    fn default() -> Self {
        RepairConfig {
            max_attempts: 5,
            lease_ms: 10 * 60 * 1000,
            interval_ms: 30_000,
            transfer_timeout_ms: 120_000,
        }
    }
}

/// Node-selection criteria applied by the overlay.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeSelectionConfig {
    /// Audits needed before a node counts as vetted.
    pub audit_threshold: u64,
    /// Fraction of each selection drawn from unvetted nodes to bootstrap
    /// their reputation.
    pub new_node_fraction: f64,
    pub min_audit_success_ratio: f64,
    pub min_uptime_ratio: f64,
    /// Vetted nodes below this audit-success ratio are disqualified.
    pub disqualification_threshold: f64,
}

impl Default for NodeSelectionConfig {
    fn default() -> Self {
        NodeSelectionConfig {
            audit_threshold: 100,
            new_node_fraction: 0.05,
            min_audit_success_ratio: 0.6,
            min_uptime_ratio: 0.9,
            disqualification_threshold: 0.6,
        }
    }
}

/// Order issuance and settlement knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrdersConfig {
    /// Issued order limits expire after this long.
    pub order_lifetime_ms: u64,
    /// Receipts are final at expiration + grace; the serial table archives
    /// past that point.
    pub settlement_grace_ms: u64,
    /// Storage-node serial seen-set retention window.
    pub serial_retention_ms: u64,
}

impl Default for OrdersConfig {
    fn default() -> Self {
        OrdersConfig {
            order_lifetime_ms: 60 * 60 * 1000,
            settlement_grace_ms: 24 * 60 * 60 * 1000,
            serial_retention_ms: 48 * 60 * 60 * 1000,
        }
    }
}

/// Satellite process configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SatelliteConfig {
    pub audit: AuditConfig,
    pub repair: RepairConfig,
    pub selection: NodeSelectionConfig,
    pub orders: OrdersConfig,
}

/// Storage node process configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageNodeConfig {
    /// Root directory for blobs, temp files and quarantine.
    pub data_dir: String,
    /// Operator-allocated disk budget in bytes.
    pub allocated_bytes: u64,
    /// Hex public keys of satellites this node will accept order limits
    /// from; node ids are derived from the keys.
    pub trusted_satellites: Vec<String>,
    pub orders: OrdersConfig,
}

impl Default for StorageNodeConfig {
    fn default() -> Self {
        StorageNodeConfig {
            data_dir: "./data".to_string(),
            allocated_bytes: 1 << 40,
            trusted_satellites: Vec::new(),
            orders: OrdersConfig::default(),
        }
    }
}

/// Load a TOML config file into `T`. Missing keys take their defaults; a
/// missing file is an error so typos in `--config-dir` surface early.
pub fn load_from_file<T: serde::de::DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, Error> {
    let raw = fs::read_to_string(path.as_ref())?;
    toml::from_str(&raw).map_err(|e| Error::invalid(format!("config parse: {}", e)))
}
