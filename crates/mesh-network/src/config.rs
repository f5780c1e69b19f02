//! Network layer configuration

use crate::address;
use crate::error::MeshError;
use serde::Deserialize;
use std::env;

/// Default number of network PDU slots in the pool
pub const DEFAULT_POOL_SIZE: usize = 16;

/// Default number of entries in the network message cache
pub const DEFAULT_CACHE_SIZE: usize = 8;

/// Default capacity of the service event channel
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Number of network PDUs that may exist at the same time (default: 16)
    pub pool_size: usize,
    /// Number of replay hashes remembered (default: 8)
    pub cache_size: usize,
    /// Current IV index (default: 0)
    pub iv_index: u32,
    /// Unicast address of the primary element (default: 0x0001)
    pub primary_address: u16,
    /// Number of elements on this node (default: 1)
    pub element_count: u16,
    /// Capacity of the service event channel (default: 64)
    pub event_channel_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            cache_size: DEFAULT_CACHE_SIZE,
            iv_index: 0,
            primary_address: 0x0001,
            element_count: 1,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl NetworkConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let config = NetworkConfig {
            pool_size: env::var("MESH_POOL_SIZE")
                .unwrap_or_else(|_| DEFAULT_POOL_SIZE.to_string())
                .parse()?,
            cache_size: env::var("MESH_NETWORK_CACHE_SIZE")
                .unwrap_or_else(|_| DEFAULT_CACHE_SIZE.to_string())
                .parse()?,
            iv_index: parse_u32(&env::var("MESH_IV_INDEX").unwrap_or_else(|_| "0".to_string()))?,
            primary_address: parse_u32(
                &env::var("MESH_PRIMARY_ADDRESS").unwrap_or_else(|_| "0x0001".to_string()),
            )?
            .try_into()?,
            element_count: env::var("MESH_ELEMENT_COUNT")
                .unwrap_or_else(|_| "1".to_string())
                .parse()?,
            event_channel_capacity: env::var("MESH_EVENT_CHANNEL_CAPACITY")
                .unwrap_or_else(|_| DEFAULT_EVENT_CHANNEL_CAPACITY.to_string())
                .parse()?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the network layer cannot run with
    pub fn validate(&self) -> Result<(), MeshError> {
        if self.pool_size == 0 {
            return Err(MeshError::Config("pool_size must be at least 1".into()));
        }
        if self.cache_size == 0 {
            return Err(MeshError::Config("cache_size must be at least 1".into()));
        }
        if self.element_count == 0 {
            return Err(MeshError::Config("element_count must be at least 1".into()));
        }
        if !address::is_unicast(self.primary_address) {
            return Err(MeshError::Config(format!(
                "primary_address {:04x} is not a unicast address",
                self.primary_address
            )));
        }
        if self.event_channel_capacity == 0 {
            return Err(MeshError::Config(
                "event_channel_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Parse a decimal or `0x`-prefixed hexadecimal number
fn parse_u32(value: &str) -> anyhow::Result<u32> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => Ok(u32::from_str_radix(hex, 16)?),
        None => Ok(value.parse()?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = NetworkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pool_size, DEFAULT_POOL_SIZE);
        assert_eq!(config.cache_size, DEFAULT_CACHE_SIZE);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = NetworkConfig {
            cache_size: 0,
            ..NetworkConfig::default()
        };
        assert!(matches!(config.validate(), Err(MeshError::Config(_))));

        let config = NetworkConfig {
            primary_address: 0xC000,
            ..NetworkConfig::default()
        };
        assert!(matches!(config.validate(), Err(MeshError::Config(_))));

        let config = NetworkConfig {
            primary_address: 0x0000,
            ..NetworkConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_hex_and_decimal() {
        assert_eq!(parse_u32("0x12345678").unwrap(), 0x1234_5678);
        assert_eq!(parse_u32("42").unwrap(), 42);
        assert_eq!(parse_u32(" 0X1201 ").unwrap(), 0x1201);
        assert!(parse_u32("0xzz").is_err());
    }

    #[test]
    fn test_deserialize_config() {
        let json = r#"{
            "pool_size": 4,
            "cache_size": 2,
            "iv_index": 305419896,
            "primary_address": 4609,
            "element_count": 2,
            "event_channel_capacity": 8
        }"#;
        let config: NetworkConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.iv_index, 0x1234_5678);
        assert_eq!(config.primary_address, 0x1201);
        assert!(config.validate().is_ok());
    }
}
