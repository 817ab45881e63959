// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use bytes::Bytes;
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use storage::BlockType;
use uuid::Uuid;

use crate::config::Config;
use crate::entangler::{Error, StepEntangler};
use crate::source::BlockSource;
use crate::strip::Strip;

/// Result of encoding a document.
#[derive(Debug, Clone)]
pub struct EncodedFile {
    /// One strip per parity, in local index order.
    pub strips: Vec<Strip>,
    pub original_size: u64,
}

/// Front end of the entangler for the dispatcher. Parities are addressed by
/// their local index `0..p` instead of their codeword index `k..k + p`.
pub struct CoderService<S: BlockSource> {
    entangler: StepEntangler<S>,
}

impl<S: BlockSource> CoderService<S> {
    pub fn new(source: S, config: Config) -> Result<Self, Error> {
        Ok(Self {
            entangler: StepEntangler::new(source, config)?,
        })
    }

    pub fn entangler(&self) -> &StepEntangler<S> {
        &self.entangler
    }

    pub fn config(&self) -> &Config {
        self.entangler.config()
    }

    /// Local indices of the strips needed to decode a document when nothing
    /// is missing. These are the DATA blocks.
    pub fn data_indices(&self) -> Vec<usize> {
        let Config { s, .. } = *self.config();
        (0..s).collect()
    }

    pub async fn encode(&self, path: &str, data: &[u8]) -> Result<EncodedFile, Error> {
        let start = Instant::now();
        let raw = self.entangler.encode(data).await?;
        let data_indices = self.data_indices();
        let strips = raw
            .into_iter()
            .enumerate()
            .map(|(index, data)| {
                let block_type = if data_indices.contains(&index) {
                    BlockType::Data
                } else {
                    BlockType::Parity
                };
                Strip::new(Uuid::new_v4().to_string(), data, block_type)
            })
            .collect();
        info!(
            "Encoded {} ({} bytes) in {:?}",
            path,
            data.len(),
            start.elapsed()
        );
        Ok(EncodedFile {
            strips,
            original_size: data.len() as u64,
        })
    }

    pub async fn decode(&self, path: &str, strips: &[Bytes]) -> Result<Bytes, Error> {
        let start = Instant::now();
        let data = self.entangler.decode(strips, Some(path)).await?;
        info!("Decoded {} in {:?}", path, start.elapsed());
        Ok(data)
    }

    /// Rebuilds the strips of `path` at the local indices `missing`, fetching
    /// the strips it needs from the block source. A strip that cannot be
    /// fetched counts as lost and the next one is tried, until the erasure
    /// budget is exhausted.
    pub async fn reconstruct(
        &self,
        path: &str,
        missing: &[usize],
    ) -> Result<BTreeMap<usize, Strip>, Error> {
        let source = self.entangler.source();
        let mut lost: BTreeSet<usize> = missing.iter().copied().collect();
        let mut fetched: BTreeMap<usize, Bytes> = BTreeMap::new();
        let needed = loop {
            let lost_indices: Vec<usize> = lost.iter().copied().collect();
            let needed = self.fragments_needed(&lost_indices)?;
            debug!("Fetching blocks {:?} of {} to rebuild {:?}", needed, path, missing);
            let mut complete = true;
            for &index in &needed {
                if fetched.contains_key(&index) {
                    continue;
                }
                match source.get_block(path, index).await {
                    Ok(strip) => {
                        fetched.insert(index, strip.data);
                    }
                    Err(e) => {
                        warn!("Block {}[{}] is lost as well: {}", path, index, e);
                        lost.insert(index);
                        complete = false;
                    }
                }
            }
            if complete {
                break needed;
            }
        };
        let available: Vec<Bytes> = needed
            .iter()
            .filter_map(|index| fetched.remove(index))
            .collect();

        let rebuilt = self
            .entangler
            .reconstruct(&available, missing, Some(path))
            .await?;
        let data_indices = self.data_indices();
        Ok(missing
            .iter()
            .zip(rebuilt)
            .map(|(&index, data)| {
                let block_type = if data_indices.contains(&index) {
                    BlockType::Data
                } else {
                    BlockType::Parity
                };
                (index, Strip::new(Uuid::new_v4().to_string(), data, block_type))
            })
            .collect())
    }

    /// Local indices of the strips to fetch when the strips at the local
    /// indices `missing` are lost.
    pub fn fragments_needed(&self, missing: &[usize]) -> Result<Vec<usize>, Error> {
        let k = self.entangler.k();
        let missing: Vec<usize> = missing.iter().map(|index| index + k).collect();
        Ok(self
            .entangler
            .fragments_needed(&missing)?
            .into_iter()
            .map(|index| index - k)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::FakeSource;
    use sha2::{Digest, Sha256};

    async fn service(blocks: usize) -> anyhow::Result<CoderService<FakeSource>> {
        let source = FakeSource::new();
        let seeder = CoderService::new(source.clone(), Config::new(1, 0, 1))?;
        for i in 0..blocks {
            let encoded = seeder.encode("seed", &[i as u8; 64]).await?;
            let strips: Vec<Bytes> = encoded.strips.into_iter().map(|s| s.data).collect();
            source.add_document(&format!("seed-{}", i), &strips);
        }
        Ok(CoderService::new(source, Config::default())?)
    }

    #[tokio::test]
    async fn test_encode_assigns_ids_checksums_and_types() -> anyhow::Result<()> {
        let service = service(10).await?;
        let encoded = service.encode("doc", b"Hello, world!").await?;
        assert_eq!(encoded.original_size, 13);
        assert_eq!(encoded.strips.len(), 3);

        let types: Vec<BlockType> = encoded.strips.iter().map(|s| s.block_type).collect();
        assert_eq!(types, vec![BlockType::Data, BlockType::Parity, BlockType::Parity]);
        for strip in &encoded.strips {
            assert!(Uuid::parse_str(&strip.id).is_ok());
            assert_eq!(strip.checksum, Sha256::digest(&strip.data).to_vec());
        }
        assert_ne!(encoded.strips[0].id, encoded.strips[1].id);
        Ok(())
    }

    #[tokio::test]
    async fn test_fragments_needed_uses_local_indices() -> anyhow::Result<()> {
        let service = service(0).await?;
        assert_eq!(service.data_indices(), vec![0]);
        assert_eq!(service.fragments_needed(&[])?, vec![0]);
        assert_eq!(service.fragments_needed(&[0])?, vec![1]);
        assert_eq!(service.fragments_needed(&[0, 1])?, vec![2]);
        assert!(service.fragments_needed(&[0, 1, 2]).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_decode_and_reconstruct() -> anyhow::Result<()> {
        let service = service(12).await?;
        let encoded = service.encode("doc", b"entangled document").await?;
        let strips: Vec<Bytes> = encoded.strips.iter().map(|s| s.data.clone()).collect();
        service.entangler().source().add_document("doc", &strips);

        assert_eq!(
            service.decode("doc", &strips[2..]).await?,
            Bytes::from_static(b"entangled document")
        );

        let rebuilt = service.reconstruct("doc", &[0, 2]).await?;
        assert_eq!(rebuilt.keys().copied().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(rebuilt[&0].data, strips[0]);
        assert_eq!(rebuilt[&0].block_type, BlockType::Data);
        assert_eq!(rebuilt[&2].data, strips[2]);
        assert_eq!(rebuilt[&2].block_type, BlockType::Parity);
        Ok(())
    }

    #[tokio::test]
    async fn test_reconstruct_skips_unavailable_blocks() -> anyhow::Result<()> {
        let service = service(12).await?;
        let encoded = service.encode("doc", b"entangled document").await?;
        let strips: Vec<Bytes> = encoded.strips.iter().map(|s| s.data.clone()).collect();
        let source = service.entangler().source();
        source.add_document("doc", &strips);
        source.fake_unavailable("doc", 0);
        source.fake_unavailable("doc", 1);

        let rebuilt = service.reconstruct("doc", &[0]).await?;
        assert_eq!(rebuilt[&0].data, strips[0]);

        source.fake_unavailable("doc", 2);
        assert!(matches!(
            service.reconstruct("doc", &[0]).await,
            Err(Error::InsufficientFragments(_))
        ));
        Ok(())
    }
}
