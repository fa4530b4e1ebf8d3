//! Provider configuration records.
//!
//! A `ProviderConfig` selects one transport and carries the connection
//! parameters for each provider it might select, so a whole deployment can
//! share a single deserialized config file and flip providers with one
//! field.

use std::path::PathBuf;

use serde::Deserialize;

/// Transport discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// In-process only, no external dependencies.
    #[default]
    Memory,
    /// Shared Redis broker (cross-process, cross-host, glob patterns).
    Redis,
    /// POSIX message queues (single host, multi-process, Linux only).
    Ipc,
}

/// Provider selection plus per-provider sections.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Transport discriminator.
    #[serde(rename = "type")]
    pub transport: TransportKind,
    /// Redis-specific configuration.
    pub redis: RedisConfig,
    /// IPC-specific configuration.
    pub ipc: IpcConfig,
}

impl ProviderConfig {
    /// Config for the in-memory transport.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Config for the Redis transport against the given URL.
    pub fn redis(url: impl Into<String>) -> Self {
        Self {
            transport: TransportKind::Redis,
            redis: RedisConfig {
                url: url.into(),
                ..RedisConfig::default()
            },
            ..Self::default()
        }
    }

    /// Config for the IPC transport rooted at the given registry directory.
    pub fn ipc(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            transport: TransportKind::Ipc,
            ipc: IpcConfig {
                base_dir: base_dir.into(),
                ..IpcConfig::default()
            },
            ..Self::default()
        }
    }

    /// Use the given namespace for whichever provider is selected.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        self.redis.namespace = namespace.clone();
        self.ipc.namespace = namespace;
        self
    }
}

/// Redis connection parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis connection URL.
    pub url: String,
    /// Namespace segment prefixed to every key and channel.
    pub namespace: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            namespace: "global".to_string(),
        }
    }
}

impl RedisConfig {
    /// Prefix applied to every channel and key this bus touches.
    pub(crate) fn prefix(&self) -> String {
        format!("omnibus:{}:", self.namespace)
    }
}

/// POSIX message-queue parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Directory holding the subscriber registry.
    pub base_dir: PathBuf,
    /// Namespace for queue names and the registry tree.
    pub namespace: String,
    /// Permission bits for created registry directories.
    pub mode: u32,
    /// Depth of each kernel queue; a full queue rejects further puts.
    pub max_messages: i64,
    /// Upper bound on a single framed message, in bytes.
    pub message_size: i64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/dev/shm/omnibus"),
            namespace: "global".to_string(),
            mode: 0o700,
            max_messages: 10,
            message_size: 8192,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_selects_memory() {
        let config = ProviderConfig::default();
        assert_eq!(config.transport, TransportKind::Memory);
    }

    #[test]
    fn test_redis_defaults() {
        let config = RedisConfig::default();
        assert_eq!(config.url, "redis://127.0.0.1:6379");
        assert_eq!(config.prefix(), "omnibus:global:");
    }

    #[test]
    fn test_ipc_defaults() {
        let config = IpcConfig::default();
        assert_eq!(config.base_dir, PathBuf::from("/dev/shm/omnibus"));
        assert_eq!(config.max_messages, 10);
        assert_eq!(config.message_size, 8192);
    }

    #[test]
    fn test_with_namespace_applies_to_all_providers() {
        let config = ProviderConfig::memory().with_namespace("testing");
        assert_eq!(config.redis.namespace, "testing");
        assert_eq!(config.ipc.namespace, "testing");
    }

    #[test]
    fn test_deserialize_discriminator() {
        let config: ProviderConfig = serde_json::from_str(
            r#"{ "type": "redis", "redis": { "url": "redis://broker:6379" } }"#,
        )
        .unwrap();
        assert_eq!(config.transport, TransportKind::Redis);
        assert_eq!(config.redis.url, "redis://broker:6379");
        assert_eq!(config.redis.namespace, "global");
    }
}
