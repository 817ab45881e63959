// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::RwLock;
use std::time::Instant;

use crate::key::compute_block_key;
use crate::metadata::{Block, Document};
use crate::selection::{InvalidDeviation, SelectionPolicy};

/// Error type for metadata index operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Document {0} not found")]
    DocumentNotFound(String),

    #[error("Document {0} already exists")]
    DocumentExists(String),

    #[error("Block {0} not found")]
    BlockNotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Pointer selection failed: {0}")]
    Selection(#[from] InvalidDeviation),

    #[error("Failed to (de)serialize the index: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metadata index lock poisoned")]
    Poisoned,
}

/// Summary of a document in the entanglement graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEntry {
    pub creation_date: DateTime<Utc>,
    pub entangling_blocks: Vec<(String, usize)>,
    /// `(block key, first provider)` for every block of the document.
    pub blocks: Vec<(String, Option<String>)>,
}

/// The single source of truth for documents, blocks, replica locations and
/// back-references.
#[async_trait]
pub trait MetadataIndex: Send + Sync {
    /// Records `document` and its blocks, and appends `path` to the
    /// back-references of every entangling block, all or nothing.
    async fn put(&self, path: &str, document: Document) -> Result<String, Error>;

    async fn get(&self, path: &str) -> Result<Document, Error>;

    async fn get_block(&self, key: &str) -> Result<Block, Error>;

    /// Returns the blocks in the order of `keys`.
    async fn get_blocks(&self, keys: &[String]) -> Result<Vec<Block>, Error>;

    /// Returns up to `n` distinct blocks picked by the selection policy.
    async fn select_random_blocks(&self, n: usize) -> Result<Vec<Block>, Error>;

    /// Document paths in creation order.
    async fn keys(&self) -> Result<Vec<String>, Error>;

    /// Block keys in creation order.
    async fn list_blocks(&self) -> Result<Vec<String>, Error>;

    async fn values(&self) -> Result<Vec<Document>, Error>;

    /// Whether at least `pointers` documents use the block as a pointer, in
    /// which case its plain replicas may be pruned.
    async fn has_been_entangled_enough(&self, key: &str, pointers: usize) -> Result<bool, Error> {
        if key.is_empty() {
            return Err(Error::InvalidArgument(
                "block key must be a non-empty string".to_string(),
            ));
        }
        let block = self.get_block(key).await?;
        Ok(block.entangled_with.len() >= pointers)
    }

    async fn entanglement_graph(&self) -> Result<BTreeMap<String, GraphEntry>, Error> {
        let mut graph = BTreeMap::new();
        for document in self.values().await? {
            let blocks = document
                .blocks
                .iter()
                .map(|block| (block.key.clone(), block.providers.iter().next().cloned()))
                .collect();
            graph.insert(
                document.path.clone(),
                GraphEntry {
                    creation_date: document.creation_date,
                    entangling_blocks: document.entangling_blocks,
                    blocks,
                },
            );
        }
        Ok(graph)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocumentRecord {
    path: String,
    creation_date: DateTime<Utc>,
    original_size: u64,
    blocks: Vec<String>,
    entangling_blocks: Vec<(String, usize)>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexState {
    documents: HashMap<String, DocumentRecord>,
    blocks: HashMap<String, Block>,
    file_order: Vec<String>,
    block_order: Vec<String>,
}

impl IndexState {
    fn document(&self, path: &str) -> Result<Document, Error> {
        let record = self
            .documents
            .get(path)
            .ok_or_else(|| Error::DocumentNotFound(path.to_string()))?;
        Ok(Document {
            path: record.path.clone(),
            creation_date: record.creation_date,
            original_size: record.original_size,
            blocks: self.blocks_for(&record.blocks)?,
            entangling_blocks: record.entangling_blocks.clone(),
        })
    }

    fn blocks_for(&self, keys: &[String]) -> Result<Vec<Block>, Error> {
        keys.iter()
            .map(|key| {
                self.blocks
                    .get(key)
                    .cloned()
                    .ok_or_else(|| Error::BlockNotFound(key.clone()))
            })
            .collect()
    }
}

/// In-process metadata index that can be persisted as a JSON snapshot.
///
/// Each `put` is applied under a single write lock, so readers never observe
/// a partially recorded document.
pub struct MemoryIndex {
    state: RwLock<IndexState>,
    policy: SelectionPolicy,
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new(SelectionPolicy::default())
    }
}

impl MemoryIndex {
    pub fn new(policy: SelectionPolicy) -> Self {
        Self {
            state: RwLock::new(IndexState::default()),
            policy,
        }
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    /// Loads a snapshot written by [`MemoryIndex::save`]. A missing file
    /// yields an empty index.
    pub async fn load(path: impl AsRef<Path>, policy: SelectionPolicy) -> Result<Self, Error> {
        let state = match tokio::fs::read(path.as_ref()).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => IndexState::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            state: RwLock::new(state),
            policy,
        })
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let bytes = {
            let state = self.state.read().map_err(|_| Error::Poisoned)?;
            serde_json::to_vec_pretty(&*state)?
        };
        tokio::fs::write(path.as_ref(), bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl MetadataIndex for MemoryIndex {
    async fn put(&self, path: &str, document: Document) -> Result<String, Error> {
        if path.is_empty() {
            return Err(Error::InvalidArgument(
                "path must be a non-empty string".to_string(),
            ));
        }
        let start = Instant::now();
        let mut state = self.state.write().map_err(|_| Error::Poisoned)?;
        if state.documents.contains_key(path) {
            return Err(Error::DocumentExists(path.to_string()));
        }
        if let Some(block) = document.blocks.iter().find(|b| state.blocks.contains_key(&b.key)) {
            return Err(Error::InvalidArgument(format!(
                "block {} is already recorded",
                block.key
            )));
        }

        let pointer_keys: Vec<String> = document
            .entangling_blocks
            .iter()
            .map(|(pointer_path, index)| compute_block_key(pointer_path, *index))
            .collect();
        if let Some(missing) = pointer_keys.iter().find(|key| !state.blocks.contains_key(*key)) {
            return Err(Error::BlockNotFound(missing.clone()));
        }

        for key in &pointer_keys {
            if let Some(block) = state.blocks.get_mut(key) {
                block.entangled_with.insert(path.to_string());
            }
        }
        let mut block_keys = Vec::with_capacity(document.blocks.len());
        for block in document.blocks {
            state.block_order.push(block.key.clone());
            block_keys.push(block.key.clone());
            state.blocks.insert(block.key.clone(), block);
        }
        state.file_order.push(path.to_string());
        state.documents.insert(
            path.to_string(),
            DocumentRecord {
                path: document.path,
                creation_date: document.creation_date,
                original_size: document.original_size,
                blocks: block_keys,
                entangling_blocks: document.entangling_blocks,
            },
        );
        info!(
            "Storing metadata for {} took {:?}",
            path,
            start.elapsed()
        );
        Ok(path.to_string())
    }

    async fn get(&self, path: &str) -> Result<Document, Error> {
        if path.is_empty() {
            return Err(Error::InvalidArgument(
                "path must be a non-empty string".to_string(),
            ));
        }
        self.state.read().map_err(|_| Error::Poisoned)?.document(path)
    }

    async fn get_block(&self, key: &str) -> Result<Block, Error> {
        let state = self.state.read().map_err(|_| Error::Poisoned)?;
        state
            .blocks
            .get(key)
            .cloned()
            .ok_or_else(|| Error::BlockNotFound(key.to_string()))
    }

    async fn get_blocks(&self, keys: &[String]) -> Result<Vec<Block>, Error> {
        self.state
            .read()
            .map_err(|_| Error::Poisoned)?
            .blocks_for(keys)
    }

    async fn select_random_blocks(&self, n: usize) -> Result<Vec<Block>, Error> {
        let start = Instant::now();
        let state = self.state.read().map_err(|_| Error::Poisoned)?;
        let available = state.block_order.len();
        if available <= n {
            return state.blocks_for(&state.block_order);
        }
        let mut positions = self.policy.select(n, available, &mut rand::thread_rng())?;
        positions.sort_unstable();
        let keys: Vec<String> = positions
            .into_iter()
            .map(|position| state.block_order[position].clone())
            .collect();
        let blocks = state.blocks_for(&keys)?;
        debug!(
            "Selected {} random blocks out of {} in {:?}",
            blocks.len(),
            available,
            start.elapsed()
        );
        Ok(blocks)
    }

    async fn keys(&self) -> Result<Vec<String>, Error> {
        Ok(self
            .state
            .read()
            .map_err(|_| Error::Poisoned)?
            .file_order
            .clone())
    }

    async fn list_blocks(&self) -> Result<Vec<String>, Error> {
        Ok(self
            .state
            .read()
            .map_err(|_| Error::Poisoned)?
            .block_order
            .clone())
    }

    async fn values(&self) -> Result<Vec<Document>, Error> {
        let state = self.state.read().map_err(|_| Error::Poisoned)?;
        state
            .file_order
            .iter()
            .map(|path| state.document(path))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::BlockType;

    fn document(path: &str, blocks: usize, pointers: &[(&str, usize)]) -> Document {
        let mut document = Document::new(path, 42);
        for index in 0..blocks {
            let mut block = Block::new(
                compute_block_key(path, index),
                if index == 0 { BlockType::Data } else { BlockType::Parity },
                vec![index as u8; 32],
                10,
            );
            block.providers.insert("A".to_string());
            document.blocks.push(block);
        }
        document.entangling_blocks = pointers
            .iter()
            .map(|(path, index)| (path.to_string(), *index))
            .collect();
        document
    }

    #[tokio::test]
    async fn test_put_and_get() -> anyhow::Result<()> {
        let index = MemoryIndex::default();
        let stored = document("doc", 3, &[]);
        assert_eq!(index.put("doc", stored.clone()).await?, "doc");
        assert_eq!(index.get("doc").await?, stored);
        assert_eq!(index.keys().await?, vec!["doc".to_string()]);
        assert_eq!(
            index.list_blocks().await?,
            vec!["doc-00".to_string(), "doc-01".to_string(), "doc-02".to_string()]
        );
        assert!(matches!(
            index.get("other").await,
            Err(Error::DocumentNotFound(_))
        ));
        assert!(matches!(index.get("").await, Err(Error::InvalidArgument(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_back_references_are_recorded() -> anyhow::Result<()> {
        let index = MemoryIndex::default();
        index.put("old", document("old", 2, &[])).await?;
        index.put("new", document("new", 2, &[("old", 1)])).await?;
        index.put("newer", document("newer", 2, &[("old", 1), ("new", 0)])).await?;

        let block = index.get_block("old-01").await?;
        assert_eq!(
            block.entangled_with.into_iter().collect::<Vec<_>>(),
            vec!["new".to_string(), "newer".to_string()]
        );
        assert!(index.has_been_entangled_enough("old-01", 2).await?);
        assert!(!index.has_been_entangled_enough("old-00", 1).await?);
        assert!(index.has_been_entangled_enough("old-00", 0).await?);

        // the stored documents see the updated back-references
        let old = index.get("old").await?;
        assert_eq!(old.blocks[1].entangled_with.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_put_with_unknown_pointer_changes_nothing() -> anyhow::Result<()> {
        let index = MemoryIndex::default();
        index.put("old", document("old", 2, &[])).await?;
        let result = index
            .put("new", document("new", 2, &[("old", 0), ("ghost", 3)]))
            .await;
        assert!(matches!(result, Err(Error::BlockNotFound(key)) if key == "ghost-03"));
        assert!(index.get("new").await.is_err());
        assert!(index.get_block("old-00").await?.entangled_with.is_empty());
        assert_eq!(index.list_blocks().await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_put_never_overwrites() -> anyhow::Result<()> {
        let index = MemoryIndex::default();
        index.put("old", document("old", 2, &[])).await?;
        index.put("new", document("new", 1, &[("old", 0)])).await?;

        let result = index.put("old", document("old", 3, &[])).await;
        assert!(matches!(result, Err(Error::DocumentExists(path)) if path == "old"));
        assert_eq!(index.get("old").await?.blocks.len(), 2);
        assert!(index.get_block("old-00").await?.entangled_with.contains("new"));
        assert_eq!(index.list_blocks().await?.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_select_random_blocks() -> anyhow::Result<()> {
        let index = MemoryIndex::new(SelectionPolicy::Uniform);
        assert!(index.select_random_blocks(3).await?.is_empty());

        index.put("a", document("a", 2, &[])).await?;
        assert_eq!(index.select_random_blocks(3).await?.len(), 2);

        index.put("b", document("b", 4, &[])).await?;
        let selected = index.select_random_blocks(3).await?;
        assert_eq!(selected.len(), 3);
        let mut keys: Vec<_> = selected.iter().map(|b| b.key.clone()).collect();
        keys.dedup();
        assert_eq!(keys.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_entanglement_graph() -> anyhow::Result<()> {
        let index = MemoryIndex::default();
        index.put("old", document("old", 1, &[])).await?;
        index.put("new", document("new", 1, &[("old", 0)])).await?;
        let graph = index.entanglement_graph().await?;
        assert_eq!(graph.len(), 2);
        assert_eq!(graph["new"].entangling_blocks, vec![("old".to_string(), 0)]);
        assert_eq!(
            graph["old"].blocks,
            vec![("old-00".to_string(), Some("A".to_string()))]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("index.json");

        let index = MemoryIndex::default();
        index.put("old", document("old", 2, &[])).await?;
        index.put("new", document("new", 2, &[("old", 0)])).await?;
        index.save(&file).await?;

        let loaded = MemoryIndex::load(&file, SelectionPolicy::Uniform).await?;
        assert_eq!(loaded.values().await?, index.values().await?);
        assert_eq!(loaded.list_blocks().await?, index.list_blocks().await?);

        let missing = dir.path().join("missing.json");
        let empty = MemoryIndex::load(missing, SelectionPolicy::Uniform).await?;
        assert!(empty.keys().await?.is_empty());
        Ok(())
    }
}
