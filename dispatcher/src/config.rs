// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use storage::{DiskProvider, MemoryProvider, Provider, SelectionPolicy};

use crate::Error;

fn default_replication_factor() -> usize {
    3
}

/// How to reach a storage provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderConfig {
    /// Volatile, in-process provider.
    Memory,
    /// One file per block under `folder`.
    Disk { folder: PathBuf },
}

impl ProviderConfig {
    pub fn build(&self) -> Arc<dyn Provider> {
        match self {
            ProviderConfig::Memory => Arc::new(MemoryProvider::new()),
            ProviderConfig::Disk { folder } => Arc::new(DiskProvider::new(folder)),
        }
    }
}

/// Configuration of the dispatcher, usually read from a JSON file:
///
/// ```json
/// {
///   "replication_factor": 2,
///   "providers": {
///     "a": { "type": "disk", "folder": "/var/lib/step/a" },
///     "b": { "type": "memory" }
///   },
///   "entanglement": { "s": 1, "t": 10, "p": 3, "backend": "rs_vand" },
///   "selection": { "type": "normal", "std_dev": 1000.0 }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    pub entanglement: entangler::Config,
    #[serde(default)]
    pub selection: SelectionPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            replication_factor: default_replication_factor(),
            providers: BTreeMap::new(),
            entanglement: entangler::Config::default(),
            selection: SelectionPolicy::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let json = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.replication_factor == 0 {
            return Err(Error::InvalidArgument(
                "replication_factor must be at least 1".to_string(),
            ));
        }
        if self.providers.is_empty() {
            return Err(Error::InvalidArgument(
                "at least one provider must be configured".to_string(),
            ));
        }
        self.entanglement.validate()?;
        Ok(())
    }

    /// Instantiates every configured provider.
    pub fn build_providers(&self) -> BTreeMap<String, Arc<dyn Provider>> {
        self.providers
            .iter()
            .map(|(name, config)| (name.clone(), config.build()))
            .collect()
    }
}
