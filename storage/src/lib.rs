// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! # STeP Entanglement Storage Library
//!
//! Everything the dispatcher needs to keep blocks and to remember where they
//! are: the storage providers holding block replicas and the metadata index
//! recording documents, blocks and entanglement back-references.
//!
//! ## Modules
//!
//! - [`storage`](storage): The [`Provider`](storage::Provider) trait and its error type.
//! - [`memory`](memory): Volatile in-process provider.
//! - [`disk`](disk): Provider writing one file per block under a folder.
//! - [`key`](key): Block key naming.
//! - [`metadata`](metadata): Document and block records.
//! - [`selection`](selection): Policies used to pick pointer blocks.
//! - [`index`](index): The [`MetadataIndex`](index::MetadataIndex) trait and the in-memory index.
//! - [`mock`](mock): A provider with fault injection for testing purposes.
//!
//! ## Error Handling
//!
//! Providers report [`storage::Error`], the index reports [`index::Error`].
//!
//! ### Example
//!
//! ```rust
//! use bytes::Bytes;
//! use step_entangler_storage::{compute_block_key, MemoryProvider, Provider};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let provider = MemoryProvider::new();
//!     let key = compute_block_key("hello.txt", 0);
//!     provider.put(Bytes::from("Hello, world!"), &key).await?;
//!     assert_eq!(provider.get(&key).await?, Some(Bytes::from("Hello, world!")));
//!     Ok(())
//! }
//! ```

pub mod disk;
pub mod index;
pub mod key;
pub mod memory;
pub mod metadata;
pub mod selection;
pub mod storage;

pub use disk::DiskProvider;
pub use index::{GraphEntry, MemoryIndex, MetadataIndex};
pub use key::{compute_block_key, parse_block_key, KEY_INDEX_WIDTH};
pub use memory::MemoryProvider;
pub use metadata::{Block, BlockType, Document};
pub use selection::SelectionPolicy;
pub use storage::*;

#[cfg(any(test, feature = "mock"))]
pub mod mock;
