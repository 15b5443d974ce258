use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Serializes a `Duration` as whole milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Bounded reconnection with capped exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    #[serde(with = "duration_ms", rename = "baseDelayMs")]
    pub base_delay: Duration,
    #[serde(with = "duration_ms", rename = "maxDelayMs")]
    pub max_delay: Duration,
    /// Fraction of the delay applied as random jitter, in `0.0..=1.0`.
    pub randomization_factor: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            randomization_factor: 0.5,
        }
    }
}

impl ReconnectPolicy {
    /// A policy that never retries.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let mut delay = self.base_delay.saturating_mul(1u32 << exp);
        let factor = self.randomization_factor.clamp(0.0, 1.0);
        if factor > 0.0 {
            let deviation = delay.mul_f64(rand::random::<f64>() * factor);
            delay = if rand::random::<bool>() {
                delay.saturating_add(deviation)
            } else {
                delay.saturating_sub(deviation)
            };
        }
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TypingConfig {
    /// How long a remote typing entry lives without a refresh.
    #[serde(with = "duration_ms", rename = "expiryMs")]
    pub expiry: Duration,
    /// Silence after the last keystroke before `isTyping=false` is sent.
    #[serde(with = "duration_ms", rename = "quietPeriodMs")]
    pub quiet_period: Duration,
    /// Minimum spacing of repeated `isTyping=true` while typing continues.
    #[serde(with = "duration_ms", rename = "refreshIntervalMs")]
    pub refresh_interval: Duration,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            expiry: Duration::from_secs(3),
            quiet_period: Duration::from_secs(1),
            refresh_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    pub relay_url: String,
    pub upload_url: Option<String>,
    pub reconnect: ReconnectPolicy,
    pub typing: TypingConfig,
    pub inbound_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:5000/ws".to_string(),
            upload_url: None,
            reconnect: ReconnectPolicy::default(),
            typing: TypingConfig::default(),
            inbound_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = ReconnectPolicy {
            randomization_factor: 0.0,
            ..ReconnectPolicy::default()
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for(40), Duration::from_secs(5));
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let policy = ReconnectPolicy::default();
        for attempt in 1..=10 {
            assert!(policy.delay_for(attempt) <= policy.max_delay);
        }
    }

    #[test]
    fn refresh_is_shorter_than_expiry_by_default() {
        let typing = TypingConfig::default();
        assert!(typing.refresh_interval < typing.expiry);
    }

    #[test]
    fn loads_partial_json_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"relayUrl":"wss://relay.example.com/ws","reconnect":{{"maxAttempts":2,"baseDelayMs":250}}}}"#
        )
        .unwrap();

        let config = ClientConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.relay_url, "wss://relay.example.com/ws");
        assert_eq!(config.reconnect.max_attempts, 2);
        assert_eq!(config.reconnect.base_delay, Duration::from_millis(250));
        assert_eq!(config.reconnect.max_delay, Duration::from_secs(5));
        assert_eq!(config.typing, TypingConfig::default());
    }
}
