// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use storage::BlockType;

use crate::header::HEADER_SIZE;
use crate::Error;

/// Group separator placed between the parts of a strip.
pub const HEADER_DELIMITER: u8 = 0x1D;

/// A unit of encoded data as exchanged with the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct Strip {
    /// A fresh UUID for newly encoded strips, the block key for strips
    /// served by a block source.
    pub id: String,
    pub data: Bytes,
    /// SHA-256 of `data`.
    pub checksum: Vec<u8>,
    pub block_type: BlockType,
}

impl Strip {
    pub fn new(id: impl Into<String>, data: Bytes, block_type: BlockType) -> Self {
        let checksum = Sha256::digest(&data).to_vec();
        Self {
            id: id.into(),
            data,
            checksum,
            block_type,
        }
    }
}

/// The parts of a strip:
/// `<json [[path, index], ...]> 0x1D <decimal original size> 0x1D <fragment>`.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Pointers the fragment was entangled with, in codeword order.
    pub pointers: Vec<(String, usize)>,
    /// Size of the document before padding.
    pub original_size: u64,
    /// Fragment header followed by the payload.
    pub fragment: Bytes,
}

impl Envelope {
    pub fn parse(strip: &Bytes) -> Result<Self, Error> {
        let first = find_delimiter(strip, 0)
            .ok_or_else(|| {
                Error::MalformedStrip("missing entanglement header delimiter".to_string())
            })?;
        let second = find_delimiter(strip, first + 1)
            .ok_or_else(|| Error::MalformedStrip("missing size delimiter".to_string()))?;

        let pointers = serde_json::from_slice(&strip[..first])
            .map_err(|e| Error::MalformedStrip(format!("invalid entanglement header: {}", e)))?;
        let original_size = std::str::from_utf8(&strip[first + 1..second])
            .ok()
            .and_then(|size| size.parse().ok())
            .ok_or_else(|| Error::MalformedStrip("invalid original size".to_string()))?;

        Ok(Self {
            pointers,
            original_size,
            fragment: strip.slice(second + 1..),
        })
    }

    pub fn to_bytes(&self) -> Result<Bytes, Error> {
        let header = serde_json::to_vec(&self.pointers)
            .map_err(|e| Error::MalformedStrip(format!("invalid entanglement header: {}", e)))?;
        let size = self.original_size.to_string();
        let mut buf = BytesMut::with_capacity(header.len() + size.len() + 2 + self.fragment.len());
        buf.put_slice(&header);
        buf.put_u8(HEADER_DELIMITER);
        buf.put_slice(size.as_bytes());
        buf.put_u8(HEADER_DELIMITER);
        buf.put_slice(&self.fragment);
        Ok(buf.freeze())
    }

    /// Fragment bytes following the fragment header.
    pub fn payload(&self) -> Result<Bytes, Error> {
        if self.fragment.len() < HEADER_SIZE {
            return Err(Error::MalformedHeader(format!(
                "fragment of {} bytes cannot hold a header",
                self.fragment.len()
            )));
        }
        Ok(self.fragment.slice(HEADER_SIZE..))
    }
}

fn find_delimiter(data: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?
        .iter()
        .position(|&b| b == HEADER_DELIMITER)
        .map(|pos| pos + from)
}

/// Trims or zero fills `data` to exactly `len` bytes.
pub(crate) fn fit(data: &[u8], len: usize) -> Vec<u8> {
    let mut fitted = data[..data.len().min(len)].to_vec();
    fitted.resize(len, 0);
    fitted
}
