use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::Deserialize;

use crate::error::{DriverError, Result};

pub const DRIVER_NAME: &str = "k2-volume-driver";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// K2 VG names are limited to 42 chars: a 5 char prefix, a hyphen and
// the 36 char dataset id fit exactly.
pub const VG_PREFIX: &str = "K2FVG";
pub const VOL_PREFIX: &str = "K2F";
pub const DATASET_ID_LEN: usize = 36;

/// Unlimited quota marker for volume groups.
pub const UNLIMITED_QUOTA: u64 = 0;

/// The array's internal control volume, hidden from listings.
pub const CONTROL_VOLUME_NAME: &str = "CTRL";

/// Default iSCSI target portal port.
pub const ISCSI_PORT: u16 = 3260;

/// Retry ceiling for array calls rejected with a transient busy code.
pub const DEFAULT_RETRIES: u32 = 5;
/// Delay between retries of a busy array call.
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Settle delay between the rescan steps (session, bus, multipath).
pub const RESCAN_SETTLE_DELAY: Duration = Duration::from_secs(3);
/// Bound on multipath discovery probes in `find_paths`.
pub const MULTIPATH_PROBE_LIMIT: u32 = 4;
/// Delay between multipath discovery probes.
pub const MULTIPATH_PROBE_DELAY: Duration = Duration::from_secs(5);

pub const DEFAULT_AGENT_CONFIG: &str = "/etc/flocker/agent.yml";

/// Driver settings from the agent configuration file.
///
/// The file nests the driver settings under a `dataset:` key:
///
/// ```yaml
/// dataset:
///   storage_host: "10.0.0.10"
///   username: "admin"
///   password: "secret"
///   is_dedup: true
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct DriverConfig {
    pub storage_host: String,
    pub username: String,
    pub password: String,
    #[serde(default, deserialize_with = "truthy")]
    pub is_ssl: bool,
    /// Dedup flag for every volume group this driver creates. Mandatory.
    #[serde(default, deserialize_with = "truthy_opt")]
    pub is_dedup: Option<bool>,
    /// Delete the array-side host object on detach (best effort).
    #[serde(default, deserialize_with = "truthy")]
    pub destroy_host: bool,
    pub retries: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct AgentFile {
    dataset: DriverConfig,
}

impl DriverConfig {
    /// Loads the `dataset:` section of an agent configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            DriverError::ImproperConfiguration(format!(
                "cannot read agent config {}: {}",
                path.display(),
                e
            ))
        })?;
        let parsed: AgentFile = serde_yaml::from_str(&raw).map_err(|e| {
            DriverError::ImproperConfiguration(format!(
                "cannot parse agent config {}: {}",
                path.display(),
                e
            ))
        })?;
        parsed.dataset.validate()?;
        Ok(parsed.dataset)
    }

    /// Checks the mandatory settings.
    pub fn validate(&self) -> Result<()> {
        if self.is_dedup.is_none() {
            return Err(DriverError::ImproperConfiguration(
                "'is_dedup' attribute is not set in the agent config file".into(),
            ));
        }
        Ok(())
    }

    pub fn is_dedup(&self) -> bool {
        self.is_dedup.unwrap_or(false)
    }

    pub fn retries(&self) -> u32 {
        self.retries.unwrap_or(DEFAULT_RETRIES)
    }
}

/// Accepts the loose truthy values allowed in agent files: booleans,
/// the integers 0/1 and the strings "1"/"true" (any case).
fn truthy<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_yaml::Value::deserialize(deserializer)?;
    parse_truthy(&value).ok_or_else(|| {
        de::Error::custom(format!("expected a boolean-like value, got {:?}", value))
    })
}

fn truthy_opt<'de, D>(deserializer: D) -> std::result::Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    truthy(deserializer).map(Some)
}

fn parse_truthy(value: &serde_yaml::Value) -> Option<bool> {
    match value {
        serde_yaml::Value::Bool(b) => Some(*b),
        serde_yaml::Value::Number(n) => match n.as_u64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        serde_yaml::Value::String(s) => match s.to_lowercase().as_str() {
            "1" | "true" => Some(true),
            "0" | "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> DriverConfig {
        let parsed: AgentFile = serde_yaml::from_str(yaml).unwrap();
        parsed.dataset
    }

    #[test]
    fn test_full_config_parses() {
        let config = parse(
            r#"
dataset:
  storage_host: "10.0.0.10"
  username: admin
  password: secret
  is_ssl: "true"
  is_dedup: 1
  destroy_host: true
  retries: 7
"#,
        );
        assert!(config.is_ssl);
        assert_eq!(config.is_dedup, Some(true));
        assert!(config.destroy_host);
        assert_eq!(config.retries(), 7);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_is_dedup_is_a_configuration_error() {
        let config = parse(
            r#"
dataset:
  storage_host: "10.0.0.10"
  username: admin
  password: secret
"#,
        );
        assert!(matches!(
            config.validate(),
            Err(DriverError::ImproperConfiguration(_))
        ));
    }

    #[test]
    fn test_defaults() {
        let config = parse(
            r#"
dataset:
  storage_host: "10.0.0.10"
  username: admin
  password: secret
  is_dedup: "True"
"#,
        );
        assert!(!config.is_ssl);
        assert!(!config.destroy_host);
        assert_eq!(config.retries(), DEFAULT_RETRIES);
        assert!(config.is_dedup());
    }

    #[test]
    fn test_truthy_values() {
        for (raw, expected) in [
            ("true", true),
            ("\"1\"", true),
            ("1", true),
            ("\"false\"", false),
            ("0", false),
            ("false", false),
        ] {
            let value: serde_yaml::Value = serde_yaml::from_str(raw).unwrap();
            assert_eq!(parse_truthy(&value), Some(expected), "raw: {}", raw);
        }
        let bad: serde_yaml::Value = serde_yaml::from_str("\"yes please\"").unwrap();
        assert_eq!(parse_truthy(&bad), None);
    }
}
