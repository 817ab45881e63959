// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use log::{debug, error, info, warn};
use rand::seq::SliceRandom;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use entangler::{BlockSource, CoderService, EncodedFile, Envelope, Strip};
use storage::{compute_block_key, Block, BlockType, Document, MetadataIndex, Provider};

use crate::config::DispatcherConfig;
use crate::placement::place;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Document {0} already exists")]
    AlreadyExists(String),

    #[error("Failed to place block {index} on provider {provider}")]
    Placement { index: usize, provider: String },

    #[error("{0}")]
    NoReplica(#[from] FetchError),

    #[error("Blocks {missing:?} cannot be recovered")]
    Irrecoverable { missing: Vec<usize> },

    #[error("Block {index} of {path} does not exist")]
    BlockNotFound { path: String, index: usize },

    #[error("Metadata index error: {0}")]
    Index(#[from] storage::index::Error),

    #[error("Coder error: {0}")]
    Coder(#[from] entangler::Error),

    #[error("Failed to parse configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Why a single replica could not be used.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaFailure {
    UnknownProvider,
    Unreachable(String),
    Missing,
    ChecksumMismatch,
}

/// Outcome of a block fetch when no replica could be used.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("Could not find any (valid) replica of block {key}")]
pub struct FetchError {
    pub key: String,
    /// Every replica that was tried, in the order it was tried.
    pub attempts: Vec<(String, ReplicaFailure)>,
}

/// The replicas held by the providers, as described by the metadata index.
#[derive(Clone)]
pub struct Replicas {
    providers: Arc<BTreeMap<String, Arc<dyn Provider>>>,
    index: Arc<dyn MetadataIndex>,
}

impl Replicas {
    pub fn new(
        providers: BTreeMap<String, Arc<dyn Provider>>,
        index: Arc<dyn MetadataIndex>,
    ) -> Self {
        Self {
            providers: Arc::new(providers),
            index,
        }
    }

    pub fn index(&self) -> &Arc<dyn MetadataIndex> {
        &self.index
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    /// Tries the replicas of `block` in random order and returns the first
    /// one matching the recorded checksum.
    pub async fn fetch_block(&self, block: &Block) -> Result<Bytes, FetchError> {
        let mut holders: Vec<String> = block.providers.iter().cloned().collect();
        holders.shuffle(&mut rand::thread_rng());

        let mut attempts = Vec::new();
        for name in holders {
            let Some(provider) = self.providers.get(&name) else {
                error!("Block {} refers to unknown provider {}", block.key, name);
                attempts.push((name, ReplicaFailure::UnknownProvider));
                continue;
            };
            debug!("About to fetch block {} from {}", block.key, name);
            match provider.get(&block.key).await {
                Ok(Some(data)) => {
                    if Sha256::digest(&data).as_slice() == block.checksum.as_slice() {
                        return Ok(data);
                    }
                    error!("Block {} from {} does not match its checksum", block.key, name);
                    attempts.push((name, ReplicaFailure::ChecksumMismatch));
                }
                Ok(None) => {
                    error!("Replica of block {} cannot be found in {}", block.key, name);
                    attempts.push((name, ReplicaFailure::Missing));
                }
                Err(e) => {
                    error!("Provider {} failed to return block {}: {}", name, block.key, e);
                    attempts.push((name, ReplicaFailure::Unreachable(e.to_string())));
                }
            }
        }
        Err(FetchError {
            key: block.key.clone(),
            attempts,
        })
    }

    /// Fetches `blocks` with one worker per distinct set of providers.
    pub async fn fetch_blocks(
        &self,
        blocks: Vec<Block>,
    ) -> Result<BTreeMap<String, Result<Bytes, FetchError>>, Error> {
        let mut groups: BTreeMap<BTreeSet<String>, Vec<Block>> = BTreeMap::new();
        for block in blocks {
            groups.entry(block.providers.clone()).or_default().push(block);
        }

        let workers = groups.into_values().map(|group| {
            let replicas = self.clone();
            tokio::spawn(async move {
                let mut results = BTreeMap::new();
                for block in group {
                    let result = replicas.fetch_block(&block).await;
                    results.insert(block.key, result);
                }
                results
            })
        });

        let mut merged = BTreeMap::new();
        for results in join_all(workers).await {
            merged.extend(results?);
        }
        Ok(merged)
    }

    async fn block_of(&self, path: &str, index: usize) -> Result<Block, Error> {
        let document = self.index.get(path).await?;
        document
            .blocks
            .into_iter()
            .find(|block| block.index() == Some(index))
            .ok_or_else(|| Error::BlockNotFound {
                path: path.to_string(),
                index,
            })
    }
}

#[async_trait]
impl BlockSource for Replicas {
    async fn get_random_blocks(&self, n: usize) -> Result<Vec<Strip>, entangler::Error> {
        let blocks = self
            .index
            .select_random_blocks(n)
            .await
            .map_err(|e| entangler::Error::Source(e.into()))?;
        let types: BTreeMap<String, BlockType> = blocks
            .iter()
            .map(|block| (block.key.clone(), block.block_type))
            .collect();
        let fetched = self
            .fetch_blocks(blocks)
            .await
            .map_err(|e| entangler::Error::Source(e.into()))?;

        Ok(fetched
            .into_iter()
            .filter_map(|(key, result)| match result {
                Ok(data) => {
                    let block_type = types.get(&key).copied().unwrap_or(BlockType::Parity);
                    Some(Strip::new(key, data, block_type))
                }
                Err(e) => {
                    warn!("Dropping random block: {}", e);
                    None
                }
            })
            .collect())
    }

    async fn get_block(&self, path: &str, index: usize) -> Result<Strip, entangler::Error> {
        let block = self
            .block_of(path, index)
            .await
            .map_err(|e| entangler::Error::Source(e.into()))?;
        let data = self
            .fetch_block(&block)
            .await
            .map_err(|_| entangler::Error::BlockUnavailable(block.key.clone()))?;
        Ok(Strip::new(block.key, data, block.block_type))
    }
}

/// Decides where blocks are stored and keeps track of how to retrieve and
/// repair them.
pub struct Dispatcher {
    replicas: Replicas,
    coder: CoderService<Replicas>,
    replication_factor: usize,
}

impl Dispatcher {
    pub fn new(
        providers: BTreeMap<String, Arc<dyn Provider>>,
        index: Arc<dyn MetadataIndex>,
        entanglement: entangler::Config,
        replication_factor: usize,
    ) -> Result<Self, Error> {
        if providers.is_empty() {
            return Err(Error::InvalidArgument(
                "at least one provider is required".to_string(),
            ));
        }
        if replication_factor == 0 {
            return Err(Error::InvalidArgument(
                "replication factor must be at least 1".to_string(),
            ));
        }
        let replicas = Replicas::new(providers, index);
        let coder = CoderService::new(replicas.clone(), entanglement)?;
        Ok(Self {
            replicas,
            coder,
            replication_factor,
        })
    }

    /// Builds the providers described by `config`.
    pub fn from_config(
        config: &DispatcherConfig,
        index: Arc<dyn MetadataIndex>,
    ) -> Result<Self, Error> {
        config.validate()?;
        Self::new(
            config.build_providers(),
            index,
            config.entanglement,
            config.replication_factor,
        )
    }

    pub fn coder(&self) -> &CoderService<Replicas> {
        &self.coder
    }

    pub fn replicas(&self) -> &Replicas {
        &self.replicas
    }

    /// Encodes `data` and stores the strips under `path`.
    pub async fn store(&self, path: &str, data: &[u8]) -> Result<Document, Error> {
        validate_path(path)?;
        self.ensure_new(path).await?;
        let encoded = self.coder.encode(path, data).await?;
        self.put(path, encoded).await
    }

    /// Pushes the strips of `path` to the providers and records the document.
    /// When a provider does not acknowledge a block, the acknowledged replicas
    /// are deleted again and nothing is recorded. Existing documents are never
    /// overwritten.
    pub async fn put(&self, path: &str, encoded: EncodedFile) -> Result<Document, Error> {
        validate_path(path)?;
        self.ensure_new(path).await?;
        let start = Instant::now();
        let strips = encoded.strips;
        let entangling_blocks = match strips.first() {
            Some(strip) => Envelope::parse(&strip.data)?.pointers,
            None => Vec::new(),
        };
        let placement = place(
            strips.len(),
            &self.replicas.provider_names(),
            self.replication_factor,
        )?;

        let blocks: Vec<(String, Bytes)> = strips
            .iter()
            .enumerate()
            .map(|(index, strip)| (compute_block_key(path, index), strip.data.clone()))
            .collect();

        let workers = placement
            .iter()
            .filter(|(_, indices)| !indices.is_empty())
            .map(|(name, indices)| {
                let provider = self.replicas.providers.get(name).cloned();
                let name = name.clone();
                let subset: Vec<(usize, String, Bytes)> = indices
                    .iter()
                    .map(|&index| (index, blocks[index].0.clone(), blocks[index].1.clone()))
                    .collect();
                tokio::spawn(async move {
                    let mut results = BTreeMap::new();
                    for (index, key, data) in subset {
                        let acknowledged = match &provider {
                            Some(provider) => match provider.put(data, &key).await {
                                Ok(acknowledged) => acknowledged,
                                Err(e) => {
                                    error!(
                                        "Could not put block {} in provider {}: {}",
                                        key, name, e
                                    );
                                    false
                                }
                            },
                            None => false,
                        };
                        debug!("Put block {} in provider {}: {}", key, name, acknowledged);
                        results.insert(index, (name.clone(), acknowledged));
                    }
                    results
                })
            });

        let mut outcomes: BTreeMap<usize, Vec<(String, bool)>> = BTreeMap::new();
        for results in join_all(workers).await {
            for (index, outcome) in results? {
                outcomes.entry(index).or_default().push(outcome);
            }
        }
        let mut acknowledged: Vec<(String, String)> = Vec::new();
        for (&index, outcome) in &outcomes {
            for (provider, _) in outcome.iter().filter(|(_, acknowledged)| *acknowledged) {
                acknowledged.push((provider.clone(), blocks[index].0.clone()));
            }
        }
        for (&index, outcome) in &outcomes {
            if let Some((provider, _)) = outcome.iter().find(|(_, acknowledged)| !acknowledged) {
                self.rollback(acknowledged).await;
                return Err(Error::Placement {
                    index,
                    provider: provider.clone(),
                });
            }
        }

        let data_indices = self.coder.data_indices();
        let mut document = Document::new(path, encoded.original_size);
        for (index, (key, data)) in blocks.iter().enumerate() {
            let block_type = if data_indices.contains(&index) {
                BlockType::Data
            } else {
                BlockType::Parity
            };
            let mut block = Block::new(
                key.clone(),
                block_type,
                Sha256::digest(data).to_vec(),
                data.len() as u64,
            );
            if let Some(outcome) = outcomes.get(&index) {
                block
                    .providers
                    .extend(outcome.iter().map(|(provider, _)| provider.clone()));
            }
            document.blocks.push(block);
        }
        document.entangling_blocks = entangling_blocks;

        if let Err(e) = self.replicas.index.put(path, document.clone()).await {
            self.rollback(acknowledged).await;
            return Err(e.into());
        }
        info!(
            "Stored {} blocks of {} in {:?}",
            document.blocks.len(),
            path,
            start.elapsed()
        );
        Ok(document)
    }

    async fn ensure_new(&self, path: &str) -> Result<(), Error> {
        match self.replicas.index.get(path).await {
            Ok(_) => Err(Error::AlreadyExists(path.to_string())),
            Err(storage::index::Error::DocumentNotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes the `(provider, key)` replicas of a failed write.
    async fn rollback(&self, replicas: Vec<(String, String)>) {
        let deletions = replicas.into_iter().filter_map(|(name, key)| {
            let provider = self.replicas.providers.get(&name).cloned()?;
            Some(async move {
                if let Err(e) = provider.delete(&key).await {
                    error!("Could not delete block {} from provider {}: {}", key, name, e);
                }
            })
        });
        join_all(deletions).await;
    }

    /// Returns block `index` of `path`. When no valid replica exists the block
    /// is rebuilt from the other blocks, if `reconstruct_if_missing` is set.
    pub async fn get_block(
        &self,
        path: &str,
        index: usize,
        reconstruct_if_missing: bool,
    ) -> Result<Bytes, Error> {
        validate_path(path)?;
        let block = self.replicas.block_of(path, index).await?;
        match self.replicas.fetch_block(&block).await {
            Ok(data) => Ok(data),
            Err(e) if reconstruct_if_missing => {
                warn!("{}, reconstructing it", e);
                let mut rebuilt = self.coder.reconstruct(path, &[index]).await?;
                rebuilt
                    .remove(&index)
                    .map(|strip| strip.data)
                    .ok_or(Error::NoReplica(e))
            }
            Err(e) => Err(Error::NoReplica(e)),
        }
    }

    /// Fetches and decodes the document stored at `path`, working around
    /// blocks that cannot be fetched.
    pub async fn get(&self, path: &str) -> Result<Bytes, Error> {
        validate_path(path)?;
        let start = Instant::now();
        let document = self.replicas.index.get(path).await?;
        let by_index: BTreeMap<usize, Block> = document
            .blocks
            .iter()
            .filter_map(|block| block.index().map(|index| (index, block.clone())))
            .collect();
        let wanted = document.data_blocks().count();

        let mut secured: BTreeMap<usize, Bytes> = BTreeMap::new();
        let mut missing: BTreeSet<usize> = BTreeSet::new();
        let data_blocks: Vec<Block> = document.data_blocks().cloned().collect();
        self.collect_blocks(data_blocks, &mut secured, &mut missing)
            .await?;

        while secured.len() < wanted {
            let missing_indices: Vec<usize> = missing.iter().copied().collect();
            let needed = self
                .coder
                .fragments_needed(&missing_indices)
                .map_err(|e| {
                    error!("Cannot work around blocks {:?} of {}: {}", missing_indices, path, e);
                    Error::Irrecoverable {
                        missing: missing_indices.clone(),
                    }
                })?;
            let mut to_fetch = Vec::new();
            for index in needed.into_iter().filter(|index| !secured.contains_key(index)) {
                match by_index.get(&index) {
                    Some(block) => to_fetch.push(block.clone()),
                    None => {
                        missing.insert(index);
                    }
                }
            }
            let keys: Vec<&str> = to_fetch.iter().map(|block| block.key.as_str()).collect();
            info!("Fetching compensating blocks {:?} of {}", keys, path);

            let before = (secured.len(), missing.len());
            self.collect_blocks(to_fetch, &mut secured, &mut missing)
                .await?;
            if (secured.len(), missing.len()) == before {
                return Err(Error::Irrecoverable {
                    missing: missing.into_iter().collect(),
                });
            }
        }

        let strips: Vec<Bytes> = secured.into_values().collect();
        let data = self.coder.decode(path, &strips).await?;
        info!("Retrieved {} in {:?}", path, start.elapsed());
        Ok(data)
    }

    async fn collect_blocks(
        &self,
        blocks: Vec<Block>,
        secured: &mut BTreeMap<usize, Bytes>,
        missing: &mut BTreeSet<usize>,
    ) -> Result<(), Error> {
        for (key, result) in self.replicas.fetch_blocks(blocks).await? {
            let Some(index) = storage::parse_block_key(&key).map(|(_, index)| index) else {
                continue;
            };
            match result {
                Ok(data) => {
                    missing.remove(&index);
                    secured.insert(index, data);
                }
                Err(e) => {
                    warn!("{}", e);
                    missing.insert(index);
                }
            }
        }
        Ok(())
    }

    /// Up to `n` `(block key, bytes)` pairs. Blocks without a valid replica
    /// are left out.
    pub async fn get_random_blocks(&self, n: usize) -> Result<Vec<(String, Bytes)>, Error> {
        let strips = self.replicas.get_random_blocks(n).await?;
        Ok(strips.into_iter().map(|strip| (strip.id, strip.data)).collect())
    }

    /// Every stored document.
    pub async fn list(&self) -> Result<Vec<Document>, Error> {
        Ok(self.replicas.index.values().await?)
    }
}

fn validate_path(path: &str) -> Result<(), Error> {
    if path.trim().is_empty() {
        return Err(Error::InvalidArgument(
            "path cannot be empty".to_string(),
        ));
    }
    Ok(())
}
