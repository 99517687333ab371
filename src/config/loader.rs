use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::types::Config;
use crate::router::normalize_number;

/// Fatal configuration problems
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("duplicate modem id: {0}")]
    DuplicateSlot(String),

    #[error("modem {slot}: critical balance threshold must not exceed the warning threshold")]
    Thresholds { slot: String },

    #[error("modem {slot}: invalid {field} '{value}'")]
    InvalidNumber {
        slot: String,
        field: &'static str,
        value: String,
    },

    #[error("modem {slot}: a port pattern with wildcards requires an IMEI")]
    WildcardWithoutImei { slot: String },

    #[error("modem {slot}: invalid balance pattern: {source}")]
    BalancePattern {
        slot: String,
        #[source]
        source: regex::Error,
    },

    #[error("mail: {0}")]
    Mail(String),

    #[error("server: {0}")]
    Server(String),

    #[error("api: token hash for {capability} is not a valid PHC string")]
    TokenHash { capability: String },

    #[error("api: fetch tokens configured for unknown modem {0}")]
    UnknownFetchSlot(String),

    #[error("config file {0} is readable by others")]
    WorldReadable(PathBuf),
}

impl Config {
    /// Load configuration from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        debug!(path = %path.display(), "loading configuration");

        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        Self::from_yaml(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Parse, normalize and validate configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut config: Config = serde_yaml::from_str(yaml)
            .context("failed to parse YAML configuration")?;

        config.normalize()?;
        config.validate()?;

        Ok(config)
    }

    /// Bring phone numbers and prefixes into E.123 form
    fn normalize(&mut self) -> Result<(), ConfigError> {
        for slot in &mut self.modems {
            slot.phone_number = normalize_number(&slot.phone_number).ok_or_else(|| {
                ConfigError::InvalidNumber {
                    slot: slot.id.clone(),
                    field: "phone number",
                    value: slot.phone_number.clone(),
                }
            })?;

            let mut prefixes = Vec::with_capacity(slot.prefixes.len());
            for prefix in &slot.prefixes {
                let cleaned = normalize_number(prefix).ok_or_else(|| ConfigError::InvalidNumber {
                    slot: slot.id.clone(),
                    field: "prefix",
                    value: prefix.clone(),
                })?;
                prefixes.push(cleaned);
            }
            slot.prefixes = prefixes;

            slot.imei = slot
                .imei
                .take()
                .map(|imei| imei.trim().to_string())
                .filter(|imei| !imei.is_empty());
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = HashSet::new();
        for slot in &self.modems {
            if !ids.insert(slot.id.as_str()) {
                return Err(ConfigError::DuplicateSlot(slot.id.clone()));
            }

            if slot.balance_critical > slot.balance_warning {
                return Err(ConfigError::Thresholds { slot: slot.id.clone() });
            }

            if slot.has_wildcard() && slot.imei.is_none() {
                return Err(ConfigError::WildcardWithoutImei { slot: slot.id.clone() });
            }

            if let Some(pattern) = &slot.ussd_balance_pattern {
                regex::Regex::new(pattern).map_err(|source| ConfigError::BalancePattern {
                    slot: slot.id.clone(),
                    source,
                })?;
            }

            let interval = slot.health_interval(&self.modempool);
            if interval.as_secs() <= 60 {
                warn!(
                    slot = %slot.id,
                    interval_secs = interval.as_secs(),
                    "health check interval is very short"
                );
            }

            match (&slot.ussd_balance_code, &slot.ussd_balance_pattern) {
                (None, _) => warn!(slot = %slot.id, "no USSD balance code, balance is not monitored"),
                (Some(_), None) => warn!(slot = %slot.id, "USSD balance code without extraction pattern"),
                _ => {}
            }
        }

        if self.mail.enabled {
            if self.mail.port == 25 {
                return Err(ConfigError::Mail(
                    "port 25 is not supported, only implicit TLS (SMTPS) is".into(),
                ));
            }
            if self.mail.server.is_empty() {
                return Err(ConfigError::Mail("server is required".into()));
            }
            let every_slot_has_recipient = self.modems.iter().all(|s| s.email_address.is_some());
            if self.mail.recipient.is_none() && !every_slot_has_recipient {
                return Err(ConfigError::Mail("recipient is required".into()));
            }
        }

        if self.server.certificate.is_some() != self.server.key.is_some() {
            return Err(ConfigError::Server(
                "certificate and key must be configured together".into(),
            ));
        }

        let tokens = &self.api.tokens;
        let capabilities = [
            ("send_sms", &tokens.send_sms),
            ("send_ussd", &tokens.send_ussd),
            ("get_health_state", &tokens.get_health_state),
            ("get_stats", &tokens.get_stats),
        ];
        for (capability, hashes) in capabilities {
            check_hashes(capability, hashes)?;
        }
        for (slot, hashes) in &tokens.fetch_sms {
            if !ids.contains(slot.as_str()) {
                return Err(ConfigError::UnknownFetchSlot(slot.clone()));
            }
            check_hashes(&format!("fetch_sms.{slot}"), hashes)?;
        }

        if self.api.enable_send_sms && tokens.send_sms.is_empty() {
            warn!("send_sms is enabled but no tokens are configured");
        }
        if self.api.enable_send_ussd && tokens.send_ussd.is_empty() {
            warn!("send_ussd is enabled but no tokens are configured");
        }

        info!(modems = self.modems.len(), "configuration validated successfully");
        Ok(())
    }
}

fn check_hashes(capability: &str, hashes: &[String]) -> Result<(), ConfigError> {
    for hash in hashes {
        if argon2::PasswordHash::new(hash).is_err() {
            return Err(ConfigError::TokenHash {
                capability: capability.to_string(),
            });
        }
    }
    Ok(())
}

/// Refuse config files that other users can read; they hold PINs and credentials.
#[cfg(unix)]
pub fn check_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = fs::metadata(path)
        .map(|meta| meta.permissions().mode())
        .unwrap_or(0);

    if mode & 0o004 != 0 {
        return Err(ConfigError::WorldReadable(path.to_path_buf()));
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn check_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Encoding, SelfTestCadence, TlsVersion};
    use std::time::Duration;

    const HASH: &str = "$argon2id$v=19$m=65536,t=2,p=1$c29tZXNhbHQ$CTFhFdXPJO1aFaMaO6Mm5c8y7cJHAph8ArZWb2GRPPc";

    #[test]
    fn test_minimal_config() {
        let yaml = r#"
modems:
  - id: "00"
    port: /dev/ttyUSB0
    phone_number: "+49 176 1234567"
    prefixes: "+49176 +49"
    cost_per_sms: 0.09
"#;

        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.modems.len(), 1);

        let slot = &config.modems[0];
        assert!(slot.enabled);
        assert_eq!(slot.baud, 115_200);
        assert_eq!(slot.phone_number, "+491761234567");
        assert_eq!(slot.prefixes, vec!["+49176", "+49"]);
        assert_eq!(slot.currency, "EUR");
        assert_eq!(slot.encoding, Encoding::Gsm);
        assert_eq!(slot.health_interval(&config.modempool), Duration::from_secs(600));
        assert_eq!(slot.self_test_cadence(&config.modempool), SelfTestCadence::Monthly);
        assert_eq!(config.server.min_tls_version, TlsVersion::Tls12);
        assert!(!config.mail.enabled);
    }

    #[test]
    fn test_full_config() {
        let yaml = format!(
            r#"
modems:
  - id: "01"
    port: /dev/serial/by-id/usb-*
    imei: "123456789012345"
    phone_number: "+43 660 1111111"
    prefixes: ["+43", "+49"]
    ussd_balance_code: "*100#"
    ussd_balance_pattern: "Guthaben: ([0-9]+,[0-9]+)"
    balance_warning: 10
    balance_critical: 2
    health_check_interval: 15m
    self_test: weekly
    encoding: UCS2
    email_address: ops@example.org
modempool:
  health_check_interval: 300
  discovery_interval: 5s
  hint_file: /tmp/ports.hint
mail:
  enabled: true
  server: smtp.example.org
  recipient: sms@example.org
server:
  port: 8443
  certificate: /etc/smsgated/cert.pem
  key: /etc/smsgated/key.pem
  min_tls_version: "1.3"
api:
  enable_send_sms: true
  tokens:
    send_sms: ["{HASH}"]
    fetch_sms:
      "01": ["{HASH}"]
logging:
  level: debug
  json: true
"#
        );

        let config = Config::from_yaml(&yaml).unwrap();
        let slot = &config.modems[0];
        assert_eq!(slot.encoding, Encoding::Ucs2);
        assert_eq!(slot.health_interval(&config.modempool), Duration::from_secs(900));
        assert_eq!(slot.self_test_cadence(&config.modempool), SelfTestCadence::Weekly);
        assert_eq!(config.modempool.health_check_interval, Duration::from_secs(300));
        assert_eq!(config.modempool.discovery_interval, Duration::from_secs(5));
        assert_eq!(config.mail.port, 465);
        assert_eq!(config.server.min_tls_version, TlsVersion::Tls13);
        assert_eq!(config.api.tokens.fetch_sms["01"].len(), 1);
        assert!(config.logging.json);
    }

    #[test]
    fn test_duplicate_slot_rejected() {
        let yaml = r#"
modems:
  - id: "00"
    port: /dev/ttyUSB0
    phone_number: "+491761234567"
  - id: "00"
    port: /dev/ttyUSB1
    phone_number: "+491761234568"
"#;

        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::DuplicateSlot(id)) if id == "00"
        ));
    }

    #[test]
    fn test_thresholds_rejected() {
        let yaml = r#"
modems:
  - id: "00"
    port: /dev/ttyUSB0
    phone_number: "+491761234567"
    balance_warning: 1
    balance_critical: 5
"#;

        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::Thresholds { .. })
        ));
    }

    #[test]
    fn test_wildcard_requires_imei() {
        let yaml = r#"
modems:
  - id: "00"
    port: /dev/ttyUSB*
    phone_number: "+491761234567"
"#;

        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::WildcardWithoutImei { .. })
        ));
    }

    #[test]
    fn test_invalid_prefix_rejected() {
        let yaml = r#"
modems:
  - id: "00"
    port: /dev/ttyUSB0
    phone_number: "+491761234567"
    prefixes: "0049"
"#;

        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::InvalidNumber { field: "prefix", .. })
        ));
    }

    #[test]
    fn test_smtp_port_25_rejected() {
        let yaml = r#"
mail:
  enabled: true
  server: smtp.example.org
  port: 25
  recipient: sms@example.org
"#;

        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(matches!(err.downcast_ref::<ConfigError>(), Some(ConfigError::Mail(_))));
    }

    #[test]
    fn test_bad_token_hash_rejected() {
        let yaml = r#"
api:
  tokens:
    get_stats: ["not-a-hash"]
"#;

        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::TokenHash { .. })
        ));
    }

    #[test]
    fn test_invalid_tls_version_rejected() {
        let yaml = r#"
server:
  min_tls_version: "1.1"
"#;

        assert!(Config::from_yaml(yaml).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_world_readable_config_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let file = tempfile::NamedTempFile::new().unwrap();
        fs::set_permissions(file.path(), fs::Permissions::from_mode(0o644)).unwrap();
        assert!(matches!(
            check_permissions(file.path()),
            Err(ConfigError::WorldReadable(_))
        ));

        fs::set_permissions(file.path(), fs::Permissions::from_mode(0o640)).unwrap();
        assert!(check_permissions(file.path()).is_ok());
    }
}
