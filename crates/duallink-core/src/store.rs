//! File-backed configuration store (spec §6 "Config store" collaborator).
//!
//! Persists one JSON file per process: `{ primary, domains: { name: DomainConfig } }`.
//! This is the ambient-stack implementation the core ships so the crate is
//! integration-testable end to end; a product would likely swap it for a
//! platform keychain-backed store without changing the trait surface.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Persisted identity + endpoint for one rendezvous domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainConfig {
    pub uri: String,
    pub device_id: i64,
    #[serde(with = "serde_bytes")]
    pub fingerprint: Vec<u8>,
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ConfigFile {
    primary: Option<String>,
    #[serde(default)]
    domains: HashMap<String, DomainConfig>,
}

fn read(path: &Path) -> Result<ConfigFile, ConfigError> {
    if !path.exists() {
        return Ok(ConfigFile::default());
    }
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|e| ConfigError::Corrupt {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

fn write(path: &Path, file: &ConfigFile) -> Result<(), ConfigError> {
    let raw = serde_json::to_string_pretty(file).expect("ConfigFile is always serializable");
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, raw)?;
    Ok(())
}

pub fn read_primary_domain(path: &Path) -> Result<Option<String>, ConfigError> {
    Ok(read(path)?.primary)
}

pub fn save_primary_domain(path: &Path, name: &str) -> Result<(), ConfigError> {
    let mut file = read(path)?;
    file.primary = Some(name.to_string());
    write(path, &file)
}

pub fn read_domain_config(path: &Path, domain: &str) -> Result<Option<DomainConfig>, ConfigError> {
    Ok(read(path)?.domains.get(domain).cloned())
}

pub fn save_domain_config(path: &Path, domain: &str, config: DomainConfig) -> Result<(), ConfigError> {
    let mut file = read(path)?;
    file.domains.insert(domain.to_string(), config);
    write(path, &file)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DomainConfig {
        DomainConfig {
            uri: "tcp://rv.local:28000".into(),
            device_id: 100,
            fingerprint: vec![1u8; 32],
            password: "hunter2".into(),
        }
    }

    #[test]
    fn round_trips_domain_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("duallink.json");

        assert_eq!(read_primary_domain(&path).unwrap(), None);
        assert_eq!(read_domain_config(&path, "default").unwrap(), None);

        save_domain_config(&path, "default", sample()).unwrap();
        save_primary_domain(&path, "default").unwrap();

        assert_eq!(read_primary_domain(&path).unwrap().as_deref(), Some("default"));
        assert_eq!(read_domain_config(&path, "default").unwrap(), Some(sample()));
    }

    #[test]
    fn unknown_domain_is_none_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("duallink.json");
        save_primary_domain(&path, "default").unwrap();
        assert_eq!(read_domain_config(&path, "other").unwrap(), None);
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("duallink.json");
        std::fs::write(&path, b"not json").unwrap();
        assert!(matches!(read_primary_domain(&path), Err(ConfigError::Corrupt { .. })));
    }
}
