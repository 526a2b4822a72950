//! Broker configuration.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Broker configuration.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerConfig {
    /// Protocol level accepted on CONNECT (3 = MQTT 3.1)
    pub protocol_version: u8,

    /// Longest accepted client identifier, in characters
    pub max_client_id_len: usize,

    /// Idle timeout as a multiple of the advertised keep-alive
    pub keep_alive_factor: f64,

    /// Level used for the copy sent to each subscriber
    pub qos_policy: QosPolicy,

    /// Level reported per filter in SUBACK
    pub suback_grant: SubAckGrant,

    /// Persistence configuration
    pub persistence: PersistenceConfig,

    /// Static credentials (user name to password); empty allows everyone
    #[serde(skip)]
    pub users: HashMap<String, String>,
}

/// Persistence configuration.
#[derive(Debug, Clone, Serialize)]
pub struct PersistenceConfig {
    /// Durable store backend
    pub store_type: StoreType,

    /// Database path (for SQLite)
    pub db_path: PathBuf,
}

/// Durable store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreType {
    /// State kept in process memory
    Memory,
    /// State kept in a SQLite file
    Sqlite,
}

/// How the outgoing level of a fanned-out publish is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum QosPolicy {
    /// Lower of the publisher's and the subscription's level
    Minimum,
    /// Publisher's level, whatever the subscription asked for
    Publisher,
}

/// What SUBACK reports for an accepted filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubAckGrant {
    /// Always QoS 0
    AtMostOnce,
    /// The level the client asked for
    Requested,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            protocol_version: 3,
            max_client_id_len: 23,
            keep_alive_factor: 1.5,
            qos_policy: QosPolicy::Minimum,
            suback_grant: SubAckGrant::AtMostOnce,
            persistence: PersistenceConfig {
                store_type: StoreType::Memory,
                db_path: PathBuf::from("./relaymq.db"),
            },
            users: HashMap::new(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `RELAYMQ_PROTOCOL_VERSION`: accepted protocol level
    /// - `RELAYMQ_MAX_CLIENT_ID_LEN`: longest accepted client identifier
    /// - `RELAYMQ_KEEP_ALIVE_FACTOR`: idle timeout multiplier
    /// - `RELAYMQ_QOS_POLICY`: "minimum" or "publisher"
    /// - `RELAYMQ_SUBACK_GRANT`: "at-most-once" or "requested"
    /// - `RELAYMQ_STORE`: "memory" or "sqlite"
    /// - `RELAYMQ_DB_PATH`: SQLite database path
    /// - `RELAYMQ_USERS`: JSON object of user name to password
    ///
    /// # Errors
    ///
    /// Returns error if a variable is present but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is present but cannot be parsed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(version) = lookup("RELAYMQ_PROTOCOL_VERSION") {
            config.protocol_version = version
                .parse()
                .context("Invalid RELAYMQ_PROTOCOL_VERSION")?;
        }

        if let Some(len) = lookup("RELAYMQ_MAX_CLIENT_ID_LEN") {
            config.max_client_id_len = len.parse().context("Invalid RELAYMQ_MAX_CLIENT_ID_LEN")?;
        }

        if let Some(factor) = lookup("RELAYMQ_KEEP_ALIVE_FACTOR") {
            let factor: f64 = factor.parse().context("Invalid RELAYMQ_KEEP_ALIVE_FACTOR")?;
            if !factor.is_finite() || factor < 0.0 {
                bail!("Invalid RELAYMQ_KEEP_ALIVE_FACTOR: must be a non-negative number");
            }
            config.keep_alive_factor = factor;
        }

        if let Some(policy) = lookup("RELAYMQ_QOS_POLICY") {
            config.qos_policy = match policy.as_str() {
                "minimum" => QosPolicy::Minimum,
                "publisher" => QosPolicy::Publisher,
                other => bail!("Invalid RELAYMQ_QOS_POLICY '{other}'"),
            };
        }

        if let Some(grant) = lookup("RELAYMQ_SUBACK_GRANT") {
            config.suback_grant = match grant.as_str() {
                "at-most-once" => SubAckGrant::AtMostOnce,
                "requested" => SubAckGrant::Requested,
                other => bail!("Invalid RELAYMQ_SUBACK_GRANT '{other}'"),
            };
        }

        if let Some(store) = lookup("RELAYMQ_STORE") {
            config.persistence.store_type = match store.as_str() {
                "memory" => StoreType::Memory,
                "sqlite" => StoreType::Sqlite,
                other => bail!("Invalid RELAYMQ_STORE '{other}'"),
            };
        }

        if let Some(db_path) = lookup("RELAYMQ_DB_PATH") {
            config.persistence.db_path = PathBuf::from(db_path);
        }

        // Parse credentials from JSON env var
        if let Some(users_json) = lookup("RELAYMQ_USERS") {
            config.users =
                serde_json::from_str(&users_json).context("Invalid RELAYMQ_USERS JSON")?;
        }

        Ok(config)
    }

    /// Idle timeout the transport should apply for an advertised keep-alive.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn idle_timeout(&self, keep_alive: u16) -> Duration {
        let secs = (f64::from(keep_alive) * self.keep_alive_factor).round();
        Duration::from_secs(secs as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults() {
        let config = BrokerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.protocol_version, 3);
        assert_eq!(config.max_client_id_len, 23);
        assert_eq!(config.qos_policy, QosPolicy::Minimum);
        assert_eq!(config.suback_grant, SubAckGrant::AtMostOnce);
        assert_eq!(config.persistence.store_type, StoreType::Memory);
        assert!(config.users.is_empty());
    }

    #[test]
    fn overrides() {
        let config = BrokerConfig::from_lookup(lookup_from(&[
            ("RELAYMQ_PROTOCOL_VERSION", "4"),
            ("RELAYMQ_QOS_POLICY", "publisher"),
            ("RELAYMQ_SUBACK_GRANT", "requested"),
            ("RELAYMQ_STORE", "sqlite"),
            ("RELAYMQ_DB_PATH", "/var/lib/relaymq/state.db"),
            ("RELAYMQ_USERS", r#"{"alice":"secret"}"#),
        ]))
        .unwrap();

        assert_eq!(config.protocol_version, 4);
        assert_eq!(config.qos_policy, QosPolicy::Publisher);
        assert_eq!(config.suback_grant, SubAckGrant::Requested);
        assert_eq!(config.persistence.store_type, StoreType::Sqlite);
        assert_eq!(
            config.persistence.db_path,
            PathBuf::from("/var/lib/relaymq/state.db")
        );
        assert_eq!(config.users.get("alice").map(String::as_str), Some("secret"));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(BrokerConfig::from_lookup(lookup_from(&[("RELAYMQ_STORE", "redis")])).is_err());
        assert!(
            BrokerConfig::from_lookup(lookup_from(&[("RELAYMQ_KEEP_ALIVE_FACTOR", "-1")]))
                .is_err()
        );
        assert!(BrokerConfig::from_lookup(lookup_from(&[("RELAYMQ_USERS", "[1,2]")])).is_err());
    }

    #[test]
    fn idle_timeout_is_one_and_a_half_keep_alives() {
        let config = BrokerConfig::default();
        assert_eq!(config.idle_timeout(60), Duration::from_secs(90));
        assert_eq!(config.idle_timeout(5), Duration::from_secs(8));
        assert_eq!(config.idle_timeout(0), Duration::ZERO);
    }
}
