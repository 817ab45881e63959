// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use storage::{compute_block_key, BlockType};

use crate::source::BlockSource;
use crate::strip::Strip;
use crate::Error;

/// In-memory block source for tests.
///
/// `get_random_blocks` is deterministic: it returns the most recently added
/// blocks, newest first.
#[derive(Clone, Default)]
pub struct FakeSource {
    blocks: Arc<Mutex<HashMap<String, Bytes>>>,
    order: Arc<Mutex<Vec<String>>>,
    unavailable: Arc<Mutex<HashSet<String>>>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `strips` as blocks `0..` of the document at `path`.
    pub fn add_document(&self, path: &str, strips: &[Bytes]) {
        for (index, data) in strips.iter().enumerate() {
            self.add_block(path, index, data.clone());
        }
    }

    pub fn add_block(&self, path: &str, index: usize, data: Bytes) {
        let key = compute_block_key(path, index);
        if self
            .blocks
            .lock()
            .unwrap()
            .insert(key.clone(), data)
            .is_none()
        {
            self.order.lock().unwrap().push(key);
        }
    }

    /// Makes `get_block` fail for the block without removing it from the
    /// random selection.
    pub fn fake_unavailable(&self, path: &str, index: usize) {
        self.unavailable
            .lock()
            .unwrap()
            .insert(compute_block_key(path, index));
    }

    pub fn len(&self) -> usize {
        self.order.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlockSource for FakeSource {
    async fn get_random_blocks(&self, n: usize) -> Result<Vec<Strip>, Error> {
        let blocks = self.blocks.lock().unwrap();
        Ok(self
            .order
            .lock()
            .unwrap()
            .iter()
            .rev()
            .take(n)
            .filter_map(|key| {
                blocks
                    .get(key)
                    .map(|data| Strip::new(key.clone(), data.clone(), BlockType::Parity))
            })
            .collect())
    }

    async fn get_block(&self, path: &str, index: usize) -> Result<Strip, Error> {
        let key = compute_block_key(path, index);
        if self.unavailable.lock().unwrap().contains(&key) {
            return Err(Error::BlockUnavailable(key));
        }
        self.blocks
            .lock()
            .unwrap()
            .get(&key)
            .map(|data| Strip::new(key.clone(), data.clone(), BlockType::Parity))
            .ok_or(Error::BlockUnavailable(key))
    }
}
