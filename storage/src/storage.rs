// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use async_trait::async_trait;
use bytes::Bytes;
use thiserror;

/// Error type for provider operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The provider could not be reached (connection refused, timeout, ...).
    #[error("Provider {0} is unreachable: {1}")]
    Unreachable(String, String),

    /// I/O error raised by a provider backed by a file system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The key cannot be used by the provider.
    #[error("Invalid key {0}")]
    InvalidKey(String),

    /// A catch-all error for other types of errors.
    #[error("Error occurred: {0}")]
    Other(#[source] anyhow::Error),
}

/// Trait representing a storage provider.
///
/// No provider is assumed reliable: whatever `get` returns must be validated
/// against the checksum recorded in the metadata index by the caller.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stores `data` under `key`.
    ///
    /// # Returns
    ///
    /// `true` if the provider acknowledged the write.
    async fn put(&self, data: Bytes, key: &str) -> Result<bool, Error>;

    /// Returns the bytes stored under `key`, or `None` if the key is unknown.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, Error>;

    /// Removes the bytes stored under `key`.
    ///
    /// # Returns
    ///
    /// `true` if something was deleted.
    async fn delete(&self, key: &str) -> Result<bool, Error>;

    /// Returns the number of bytes the provider currently holds.
    async fn quota(&self) -> Result<u64, Error>;
}
