// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::key::parse_block_key;

/// Role of a stored block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BlockType {
    /// One of the minimal set of blocks required to decode the document.
    Data,
    /// Extra redundancy, only fetched for repairs.
    Parity,
}

/// Record of a single stored block and of the providers holding its replicas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub key: String,
    pub creation_date: DateTime<Utc>,
    pub providers: BTreeSet<String>,
    pub block_type: BlockType,
    /// SHA-256 digest of the exact bytes written to the providers.
    #[serde(with = "hex::serde")]
    pub checksum: Vec<u8>,
    pub size: u64,
    /// Paths of the documents that used this block as a pointer.
    #[serde(default)]
    pub entangled_with: BTreeSet<String>,
}

impl Block {
    pub fn new(
        key: impl Into<String>,
        block_type: BlockType,
        checksum: Vec<u8>,
        size: u64,
    ) -> Self {
        Self {
            key: key.into(),
            creation_date: Utc::now(),
            providers: BTreeSet::new(),
            block_type,
            checksum,
            size,
            entangled_with: BTreeSet::new(),
        }
    }

    /// Index of the block within its document, taken from the key.
    pub fn index(&self) -> Option<usize> {
        parse_block_key(&self.key).map(|(_, index)| index)
    }
}

/// Record describing how a document has been stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub path: String,
    pub creation_date: DateTime<Utc>,
    /// Size in bytes before padding.
    pub original_size: u64,
    /// Blocks ordered by their position in the parity range.
    pub blocks: Vec<Block>,
    /// The `(path, index)` pointers consumed when the document was encoded,
    /// in selection order.
    pub entangling_blocks: Vec<(String, usize)>,
}

impl Document {
    pub fn new(path: impl Into<String>, original_size: u64) -> Self {
        Self {
            path: path.into(),
            creation_date: Utc::now(),
            original_size,
            blocks: Vec::new(),
            entangling_blocks: Vec::new(),
        }
    }

    /// Blocks that have to be fetched to decode the document.
    pub fn data_blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks
            .iter()
            .filter(|block| block.block_type == BlockType::Data)
    }
}
