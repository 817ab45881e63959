// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use async_trait::async_trait;
use std::sync::Arc;

use crate::strip::Strip;
use crate::Error;

/// Where the entangler finds the blocks of previously stored documents.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Returns up to `n` distinct stored blocks. Fewer are returned when
    /// fewer exist.
    async fn get_random_blocks(&self, n: usize) -> Result<Vec<Strip>, Error>;

    /// Returns block `index` of the document stored at `path`.
    async fn get_block(&self, path: &str, index: usize) -> Result<Strip, Error>;
}

#[async_trait]
impl<T: BlockSource + ?Sized> BlockSource for Arc<T> {
    async fn get_random_blocks(&self, n: usize) -> Result<Vec<Strip>, Error> {
        (**self).get_random_blocks(n).await
    }

    async fn get_block(&self, path: &str, index: usize) -> Result<Strip, Error> {
        (**self).get_block(path, index).await
    }
}
