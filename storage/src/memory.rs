// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::storage::{Error, Provider};

/// Provider keeping every block in process memory.
#[derive(Clone, Default)]
pub struct MemoryProvider {
    blocks: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks held by the provider.
    pub fn len(&self) -> usize {
        self.blocks.read().map(|blocks| blocks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::Other(anyhow::anyhow!("memory provider lock poisoned"))
}

#[async_trait]
impl Provider for MemoryProvider {
    async fn put(&self, data: Bytes, key: &str) -> Result<bool, Error> {
        self.blocks
            .write()
            .map_err(poisoned)?
            .insert(key.to_string(), data);
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, Error> {
        Ok(self.blocks.read().map_err(poisoned)?.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<bool, Error> {
        Ok(self.blocks.write().map_err(poisoned)?.remove(key).is_some())
    }

    async fn quota(&self) -> Result<u64, Error> {
        Ok(self
            .blocks
            .read()
            .map_err(poisoned)?
            .values()
            .map(|block| block.len() as u64)
            .sum())
    }
}
