// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::storage::{Error as StorageError, Provider};

/// In-memory provider with fault injection for tests.
#[derive(Clone)]
pub struct FakeProvider {
    name: String,
    data: Arc<Mutex<HashMap<String, Bytes>>>,
    corrupt_keys: Arc<Mutex<HashSet<String>>>,
    unreachable: Arc<AtomicBool>,
}

impl FakeProvider {
    pub fn new(name: &str) -> Self {
        FakeProvider {
            name: name.to_string(),
            data: Arc::new(Mutex::new(HashMap::new())),
            corrupt_keys: Arc::new(Mutex::new(HashSet::new())),
            unreachable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Makes every subsequent call fail with [`StorageError::Unreachable`].
    pub fn fake_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Flips the first byte of whatever is returned for `key`.
    pub fn fake_corrupted(&self, key: &str) {
        self.corrupt_keys.lock().unwrap().insert(key.to_string());
    }

    /// Drops the replica stored under `key`.
    pub fn fake_missing(&self, key: &str) {
        self.data.lock().unwrap().remove(key);
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.lock().unwrap().contains_key(key)
    }

    fn check_reachable(&self) -> Result<(), StorageError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StorageError::Unreachable(
                self.name.clone(),
                "simulated connection failure".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Provider for FakeProvider {
    async fn put(&self, data: Bytes, key: &str) -> Result<bool, StorageError> {
        self.check_reachable()?;
        self.data.lock().unwrap().insert(key.to_string(), data);
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
        self.check_reachable()?;
        let data = self.data.lock().unwrap().get(key).cloned();
        if data.is_some() && self.corrupt_keys.lock().unwrap().contains(key) {
            let mut corrupted = data.unwrap_or_default().to_vec();
            if let Some(first) = corrupted.first_mut() {
                *first ^= 0xFF;
            } else {
                corrupted.push(0xFF);
            }
            return Ok(Some(Bytes::from(corrupted)));
        }
        Ok(data)
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        self.check_reachable()?;
        Ok(self.data.lock().unwrap().remove(key).is_some())
    }

    async fn quota(&self) -> Result<u64, StorageError> {
        self.check_reachable()?;
        Ok(self
            .data
            .lock()
            .unwrap()
            .values()
            .map(|data| data.len() as u64)
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_and_get() -> anyhow::Result<()> {
        let provider = FakeProvider::new("A");
        provider.put(Bytes::from("Hello, world!"), "doc-00").await?;
        assert_eq!(
            provider.get("doc-00").await?,
            Some(Bytes::from("Hello, world!"))
        );
        assert_eq!(provider.keys(), vec!["doc-00".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_fake_unreachable() {
        let provider = FakeProvider::new("A");
        provider.fake_unreachable(true);
        let result = provider.put(Bytes::from("x"), "doc-00").await;
        assert!(matches!(result, Err(StorageError::Unreachable(name, _)) if name == "A"));
    }

    #[tokio::test]
    async fn test_fake_corrupted() -> anyhow::Result<()> {
        let provider = FakeProvider::new("A");
        provider.put(Bytes::from(vec![1, 2, 3]), "doc-00").await?;
        provider.fake_corrupted("doc-00");
        assert_eq!(
            provider.get("doc-00").await?,
            Some(Bytes::from(vec![0xFE, 2, 3]))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_fake_missing() -> anyhow::Result<()> {
        let provider = FakeProvider::new("A");
        provider.put(Bytes::from("x"), "doc-00").await?;
        provider.fake_missing("doc-00");
        assert_eq!(provider.get("doc-00").await?, None);
        assert!(!provider.contains("doc-00"));
        Ok(())
    }
}
