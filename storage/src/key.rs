// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Block keys: `"{path}-{index}"` with the index zero padded.

/// Zero-pad width of the index part of block keys.
/// Every stored key embeds it, so changing it requires migrating the stores.
pub const KEY_INDEX_WIDTH: usize = 2;

/// Computes the key of block `index` of the document stored at `path`.
pub fn compute_block_key(path: &str, index: usize) -> String {
    format!("{}-{:0>width$}", path, index, width = KEY_INDEX_WIDTH)
}

/// Splits a block key into its document path and block index.
/// Returns `None` if the key does not end with `-<digits>`.
pub fn parse_block_key(key: &str) -> Option<(&str, usize)> {
    let (path, index) = key.rsplit_once('-')?;
    if path.is_empty() || index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((path, index.parse().ok()?))
}
