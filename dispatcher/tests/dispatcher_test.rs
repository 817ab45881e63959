// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use anyhow::Result;
use bytes::Bytes;
use step_entangler_dispatcher::{Dispatcher, DispatcherConfig, Error};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use storage::{
    compute_block_key, mock::FakeProvider, BlockType, MemoryIndex, MetadataIndex, Provider,
    SelectionPolicy,
};

struct Fixture {
    dispatcher: Dispatcher,
    index: Arc<MemoryIndex>,
    providers: BTreeMap<String, FakeProvider>,
}

impl Fixture {
    fn new(provider_count: usize, replication_factor: usize) -> Result<Self> {
        let providers: BTreeMap<String, FakeProvider> = (0..provider_count)
            .map(|i| {
                let name = ((b'A' + i as u8) as char).to_string();
                (name.clone(), FakeProvider::new(&name))
            })
            .collect();
        let index = Arc::new(MemoryIndex::new(SelectionPolicy::Uniform));
        let dispatcher = Dispatcher::new(
            providers
                .iter()
                .map(|(name, provider)| {
                    let provider: Arc<dyn Provider> = Arc::new(provider.clone());
                    (name.clone(), provider)
                })
                .collect(),
            index.clone(),
            entangler::Config::new(1, 10, 3),
            replication_factor,
        )?;
        Ok(Self {
            dispatcher,
            index,
            providers,
        })
    }

    /// Drops every replica of the block.
    async fn lose_block(&self, key: &str) -> Result<()> {
        for name in self.index.get_block(key).await?.providers {
            self.providers[&name].fake_missing(key);
        }
        Ok(())
    }

    async fn corrupt_block(&self, key: &str) -> Result<()> {
        for name in self.index.get_block(key).await?.providers {
            self.providers[&name].fake_corrupted(key);
        }
        Ok(())
    }
}

fn content(i: usize) -> Vec<u8> {
    format!("document number {} ", i).repeat(20 + i).into_bytes()
}

#[tokio::test]
async fn test_store_and_get() -> Result<()> {
    let fixture = Fixture::new(5, 2)?;
    for i in 0..15 {
        let document = fixture.dispatcher.store(&format!("doc-{}", i), &content(i)).await?;
        assert_eq!(document.blocks.len(), 3);
        assert_eq!(document.original_size, content(i).len() as u64);
        assert_eq!(document.entangling_blocks.len(), (3 * i).min(10));
        let types: Vec<BlockType> = document.blocks.iter().map(|b| b.block_type).collect();
        assert_eq!(types, vec![BlockType::Data, BlockType::Parity, BlockType::Parity]);
        for block in &document.blocks {
            assert_eq!(block.providers.len(), 2);
        }
    }
    for i in 0..15 {
        assert_eq!(
            fixture.dispatcher.get(&format!("doc-{}", i)).await?,
            Bytes::from(content(i))
        );
    }
    assert_eq!(fixture.dispatcher.list().await?.len(), 15);
    Ok(())
}

#[tokio::test]
async fn test_back_references_are_recorded() -> Result<()> {
    let fixture = Fixture::new(4, 2)?;
    fixture.dispatcher.store("old", &content(1)).await?;
    let new = fixture.dispatcher.store("new", &content(2)).await?;
    assert_eq!(new.entangling_blocks.len(), 3);
    for (path, index) in &new.entangling_blocks {
        assert_eq!(path, "old");
        let block = fixture.index.get_block(&compute_block_key(path, *index)).await?;
        assert!(block.entangled_with.contains("new"));
    }
    Ok(())
}

#[tokio::test]
async fn test_full_replication() -> Result<()> {
    let fixture = Fixture::new(3, 3)?;
    let document = fixture.dispatcher.store("doc", &content(0)).await?;
    for block in &document.blocks {
        assert_eq!(block.providers.len(), 3);
    }
    for provider in fixture.providers.values() {
        assert_eq!(provider.keys(), vec!["doc-00", "doc-01", "doc-02"]);
    }
    Ok(())
}

#[tokio::test]
async fn test_checksum_rejection() -> Result<()> {
    let fixture = Fixture::new(5, 2)?;
    let document = fixture.dispatcher.store("doc", &content(3)).await?;
    let block = &document.blocks[1];

    // one bad replica out of two is skipped
    let holder = block.providers.iter().next().cloned().unwrap_or_default();
    fixture.providers[&holder].fake_corrupted(&block.key);
    for _ in 0..10 {
        let data = fixture.dispatcher.get_block("doc", 1, false).await?;
        assert_eq!(Sha256::digest(&data).to_vec(), block.checksum);
    }

    fixture.corrupt_block(&block.key).await?;
    let result = fixture.dispatcher.get_block("doc", 1, false).await;
    assert!(matches!(
        result,
        Err(Error::NoReplica(e)) if e.key == "doc-01" && e.attempts.len() == 2
    ));
    Ok(())
}

#[tokio::test]
async fn test_get_block_reconstructs_missing_block() -> Result<()> {
    let fixture = Fixture::new(5, 2)?;
    for i in 0..4 {
        fixture.dispatcher.store(&format!("seed-{}", i), &content(i)).await?;
    }
    let document = fixture.dispatcher.store("doc", &content(9)).await?;
    fixture.lose_block("doc-00").await?;

    assert!(matches!(
        fixture.dispatcher.get_block("doc", 0, false).await,
        Err(Error::NoReplica(_))
    ));
    let rebuilt = fixture.dispatcher.get_block("doc", 0, true).await?;
    assert_eq!(Sha256::digest(&rebuilt).to_vec(), document.blocks[0].checksum);
    Ok(())
}

#[tokio::test]
async fn test_get_repairs_around_missing_blocks() -> Result<()> {
    let fixture = Fixture::new(5, 2)?;
    for i in 0..4 {
        fixture.dispatcher.store(&format!("seed-{}", i), &content(i)).await?;
    }
    fixture.dispatcher.store("doc", &content(7)).await?;

    fixture.lose_block("doc-00").await?;
    assert_eq!(fixture.dispatcher.get("doc").await?, Bytes::from(content(7)));

    fixture.corrupt_block("doc-01").await?;
    assert_eq!(fixture.dispatcher.get("doc").await?, Bytes::from(content(7)));

    fixture.lose_block("doc-02").await?;
    let result = fixture.dispatcher.get("doc").await;
    assert!(matches!(result, Err(Error::Irrecoverable { missing }) if missing == vec![0, 1, 2]));
    Ok(())
}

#[tokio::test]
async fn test_get_compensates_missing_pointers() -> Result<()> {
    let fixture = Fixture::new(5, 2)?;
    for i in 0..4 {
        fixture.dispatcher.store(&format!("seed-{}", i), &content(i)).await?;
    }
    let document = fixture.dispatcher.store("doc", &content(5)).await?;
    assert_eq!(document.entangling_blocks.len(), 10);

    for (path, index) in document.entangling_blocks.iter().take(2) {
        fixture.lose_block(&compute_block_key(path, *index)).await?;
    }
    assert_eq!(fixture.dispatcher.get("doc").await?, Bytes::from(content(5)));

    let (path, index) = &document.entangling_blocks[2];
    fixture.lose_block(&compute_block_key(path, *index)).await?;
    assert!(matches!(
        fixture.dispatcher.get("doc").await,
        Err(Error::Coder(entangler::Error::InsufficientFragments(_)))
    ));
    Ok(())
}

#[tokio::test]
async fn test_unreachable_provider_fails_placement() -> Result<()> {
    let fixture = Fixture::new(5, 2)?;
    fixture.providers["C"].fake_unreachable(true);

    let result = fixture.dispatcher.store("doc", &content(1)).await;
    assert!(matches!(result, Err(Error::Placement { provider, .. }) if provider == "C"));
    assert!(matches!(
        fixture.dispatcher.get("doc").await,
        Err(Error::Index(storage::index::Error::DocumentNotFound(_)))
    ));
    assert!(fixture.index.list_blocks().await?.is_empty());
    for provider in fixture.providers.values() {
        assert!(provider.keys().is_empty());
    }

    fixture.providers["C"].fake_unreachable(false);
    fixture.dispatcher.store("doc", &content(1)).await?;
    assert_eq!(fixture.dispatcher.get("doc").await?, Bytes::from(content(1)));
    Ok(())
}

#[tokio::test]
async fn test_existing_path_is_never_overwritten() -> Result<()> {
    let fixture = Fixture::new(4, 2)?;
    let old = fixture.dispatcher.store("old", &content(1)).await?;
    fixture.dispatcher.store("new", &content(2)).await?;

    let result = fixture.dispatcher.store("old", &content(3)).await;
    assert!(matches!(result, Err(Error::AlreadyExists(path)) if path == "old"));
    let encoded = fixture.dispatcher.coder().encode("old", &content(3)).await?;
    assert!(matches!(
        fixture.dispatcher.put("old", encoded).await,
        Err(Error::AlreadyExists(_))
    ));

    assert_eq!(fixture.index.get("old").await?.blocks[0].checksum, old.blocks[0].checksum);
    assert!(fixture.index.get_block("old-00").await?.entangled_with.contains("new"));
    assert_eq!(fixture.dispatcher.get("old").await?, Bytes::from(content(1)));
    assert_eq!(fixture.dispatcher.get("new").await?, Bytes::from(content(2)));
    Ok(())
}

#[tokio::test]
async fn test_get_block_reconstructs_with_two_blocks_lost() -> Result<()> {
    let fixture = Fixture::new(5, 2)?;
    for i in 0..4 {
        fixture.dispatcher.store(&format!("seed-{}", i), &content(i)).await?;
    }
    let document = fixture.dispatcher.store("doc", &content(6)).await?;
    fixture.lose_block("doc-00").await?;
    fixture.lose_block("doc-01").await?;

    let rebuilt = fixture.dispatcher.get_block("doc", 0, true).await?;
    assert_eq!(Sha256::digest(&rebuilt).to_vec(), document.blocks[0].checksum);
    assert_eq!(fixture.dispatcher.get("doc").await?, Bytes::from(content(6)));

    fixture.lose_block("doc-02").await?;
    assert!(matches!(
        fixture.dispatcher.get_block("doc", 0, true).await,
        Err(Error::Coder(entangler::Error::InsufficientFragments(_)))
    ));
    Ok(())
}

#[tokio::test]
async fn test_get_random_blocks_drops_missing_blocks() -> Result<()> {
    let fixture = Fixture::new(4, 2)?;
    for i in 0..3 {
        fixture.dispatcher.store(&format!("doc-{}", i), &content(i)).await?;
    }
    fixture.lose_block("doc-1-02").await?;

    let blocks = fixture.dispatcher.get_random_blocks(100).await?;
    assert_eq!(blocks.len(), 8);
    assert!(blocks.iter().all(|(key, _)| key != "doc-1-02"));

    assert_eq!(fixture.dispatcher.get_random_blocks(4).await?.len(), 4);
    Ok(())
}

#[tokio::test]
async fn test_invalid_arguments() -> Result<()> {
    let fixture = Fixture::new(3, 2)?;
    assert!(matches!(
        fixture.dispatcher.store("  ", b"data").await,
        Err(Error::InvalidArgument(_))
    ));
    fixture.dispatcher.store("doc", b"data").await?;
    assert!(matches!(
        fixture.dispatcher.get_block("doc", 7, true).await,
        Err(Error::BlockNotFound { index: 7, .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_from_config_with_disk_providers() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = DispatcherConfig::from_json(&format!(
        r#"{{
            "replication_factor": 2,
            "providers": {{
                "disk": {{ "type": "disk", "folder": {} }},
                "memory": {{ "type": "memory" }},
                "other": {{ "type": "memory" }}
            }},
            "entanglement": {{ "s": 2, "t": 3, "p": 4 }}
        }}"#,
        serde_json::to_string(&dir.path())?
    ))?;
    let index = Arc::new(MemoryIndex::default());
    let dispatcher = Dispatcher::from_config(&config, index)?;
    for i in 0..5 {
        dispatcher.store(&format!("file-{}", i), &content(i)).await?;
    }
    for i in 0..5 {
        assert_eq!(
            dispatcher.get(&format!("file-{}", i)).await?,
            Bytes::from(content(i))
        );
    }
    assert!(std::fs::read_dir(dir.path())?.count() > 0);
    Ok(())
}
