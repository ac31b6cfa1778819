//! Process configuration for the backup core
//!
//! Everything the core needs from the environment is gathered here and passed
//! explicitly into constructors. The master key in particular is loaded once
//! from a [`MasterKeySource`] and handed to the key hierarchy.

use crate::keys::{KeyAlgorithm, KeyError, MasterKey};
use chrono::Duration;
use std::fmt;

/// Environment variable holding the base64-encoded master key.
pub const DEFAULT_MASTER_KEY_ENV: &str = "VMBACKUP_MASTER_KEY";

/// Where the key encryption key comes from.
#[derive(Clone)]
pub enum MasterKeySource {
    /// Base64 in an environment variable.
    Env {
        /// Variable name.
        var: String,
    },
    /// Base64 supplied inline, e.g. from a secrets file already read.
    Base64(String),
    /// Argon2id-derived from an operator passphrase.
    Passphrase {
        /// Operator passphrase.
        passphrase: String,
        /// Salt, at least eight bytes.
        salt: String,
    },
}

impl MasterKeySource {
    /// Read the key from `VMBACKUP_MASTER_KEY`.
    pub fn from_default_env() -> Self {
        MasterKeySource::Env {
            var: DEFAULT_MASTER_KEY_ENV.to_string(),
        }
    }

    /// Resolve the source into a master key.
    pub fn load(&self) -> Result<MasterKey, KeyError> {
        match self {
            MasterKeySource::Env { var } => {
                let encoded = std::env::var(var).map_err(|_| {
                    KeyError::InvalidMasterKey(format!("environment variable {} is not set", var))
                })?;
                MasterKey::from_base64(&encoded)
            }
            MasterKeySource::Base64(encoded) => MasterKey::from_base64(encoded),
            MasterKeySource::Passphrase { passphrase, salt } => {
                MasterKey::from_passphrase(passphrase, salt.as_bytes())
            }
        }
    }
}

impl fmt::Debug for MasterKeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MasterKeySource::Env { var } => f.debug_struct("Env").field("var", var).finish(),
            MasterKeySource::Base64(_) => f.write_str("Base64(<redacted>)"),
            MasterKeySource::Passphrase { .. } => f.write_str("Passphrase(<redacted>)"),
        }
    }
}

impl Default for MasterKeySource {
    fn default() -> Self {
        Self::from_default_env()
    }
}

/// Key hierarchy settings.
#[derive(Debug, Clone)]
pub struct KeyHierarchyConfig {
    /// Create a key at the preferred scope the first time a backup needs one.
    pub auto_create_keys: bool,
    /// Algorithm for keys created on demand.
    pub default_algorithm: KeyAlgorithm,
}

impl KeyHierarchyConfig {
    /// Enable or disable on-demand key creation.
    pub fn with_auto_create_keys(mut self, enabled: bool) -> Self {
        self.auto_create_keys = enabled;
        self
    }

    /// Set the algorithm for keys created on demand.
    pub fn with_default_algorithm(mut self, algorithm: KeyAlgorithm) -> Self {
        self.default_algorithm = algorithm;
        self
    }
}

impl Default for KeyHierarchyConfig {
    fn default() -> Self {
        Self {
            auto_create_keys: true,
            default_algorithm: KeyAlgorithm::Aes256Gcm,
        }
    }
}

/// Chain planner settings.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// How long a cached incremental capability stays trusted.
    pub capability_staleness: Duration,
}

impl PlannerConfig {
    /// Set how long a capability answer is reused.
    pub fn with_capability_staleness(mut self, staleness: Duration) -> Self {
        self.capability_staleness = staleness;
        self
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            capability_staleness: Duration::hours(24),
        }
    }
}

/// Compliance evaluation thresholds.
#[derive(Debug, Clone)]
pub struct ComplianceConfig {
    /// Fraction of the RPO after which a workload turns YELLOW.
    pub warning_ratio: f64,
}

impl ComplianceConfig {
    /// Set the YELLOW threshold, clamped to `0.0..=1.0`.
    pub fn with_warning_ratio(mut self, ratio: f64) -> Self {
        self.warning_ratio = ratio.clamp(0.0, 1.0);
        self
    }
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self { warning_ratio: 0.8 }
    }
}

/// Top-level configuration
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Key encryption key for new DEKs.
    pub master_key: MasterKeySource,
    /// Earlier master keys, loaded for unwrapping only.
    pub retired_master_keys: Vec<MasterKeySource>,
    /// Key hierarchy settings.
    pub keys: KeyHierarchyConfig,
    /// Planner settings.
    pub planner: PlannerConfig,
    /// Compliance thresholds.
    pub compliance: ComplianceConfig,
    /// Upper bound on schedules planned concurrently in one tick.
    pub max_concurrent_ticks: usize,
}

impl CoreConfig {
    /// Defaults for everything except the master key.
    pub fn new(master_key: MasterKeySource) -> Self {
        Self {
            master_key,
            retired_master_keys: Vec::new(),
            keys: KeyHierarchyConfig::default(),
            planner: PlannerConfig::default(),
            compliance: ComplianceConfig::default(),
            max_concurrent_ticks: num_cpus::get().max(1),
        }
    }

    /// Also load `source`, for unwrapping DEKs issued before a master key rotation.
    pub fn with_retired_master_key(mut self, source: MasterKeySource) -> Self {
        self.retired_master_keys.push(source);
        self
    }

    /// Replace the key hierarchy settings.
    pub fn with_keys(mut self, keys: KeyHierarchyConfig) -> Self {
        self.keys = keys;
        self
    }

    /// Replace the planner settings.
    pub fn with_planner(mut self, planner: PlannerConfig) -> Self {
        self.planner = planner;
        self
    }

    /// Replace the compliance thresholds.
    pub fn with_compliance(mut self, compliance: ComplianceConfig) -> Self {
        self.compliance = compliance;
        self
    }

    /// Cap concurrent schedule planning; at least one.
    pub fn with_max_concurrent_ticks(mut self, limit: usize) -> Self {
        self.max_concurrent_ticks = limit.max(1);
        self
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self::new(MasterKeySource::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    #[test]
    fn test_master_key_source_inline() {
        let source = MasterKeySource::Base64(STANDARD.encode([5u8; 32]));
        let key = source.load().unwrap();
        assert_eq!(key.id(), MasterKey::from_bytes(&[5u8; 32]).unwrap().id());
        assert_eq!(format!("{:?}", source), "Base64(<redacted>)");
    }

    #[test]
    fn test_master_key_source_missing_env() {
        let source = MasterKeySource::Env {
            var: "VMBACKUP_TEST_UNSET_MASTER_KEY".to_string(),
        };
        assert!(matches!(source.load(), Err(KeyError::InvalidMasterKey(_))));
    }

    #[test]
    fn test_warning_ratio_is_clamped() {
        assert_eq!(ComplianceConfig::default().with_warning_ratio(1.7).warning_ratio, 1.0);
        assert_eq!(CoreConfig::default().with_max_concurrent_ticks(0).max_concurrent_ticks, 1);
    }
}
