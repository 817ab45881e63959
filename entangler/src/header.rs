// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Binary header carried in front of every fragment payload.
//!
//! The layout is fixed and little endian:
//!
//! | field                   | type       |
//! |-------------------------|------------|
//! | index                   | `u32`      |
//! | size                    | `u32`      |
//! | backend_metadata_size   | `u32`      |
//! | orig_data_size          | `u64`      |
//! | checksum_type           | `u8`       |
//! | checksum                | `[u32; 8]` |
//! | checksum_mismatch       | `u8`       |
//! | backend_id              | `u8`       |
//! | backend_version         | `u32`      |
//! | magic                   | `u32`      |
//! | libec_version           | `u32`      |
//! | metadata_checksum       | `u32`      |
//! | padding                 | 9 bytes    |

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::Error;

pub const METADATA_SIZE: usize = 59;
pub const HEADER_SIZE: usize = 80;

/// Marks the start of a fragment header.
pub const FRAGMENT_MAGIC: u32 = 0x0b0c_5ecc;
pub const LIBEC_VERSION: u32 = 0x0001_0602;

const PADDING: usize = HEADER_SIZE - METADATA_SIZE - 12;

/// Per fragment metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FragmentMetadata {
    /// Position of the fragment in the codeword.
    pub index: u32,
    /// Payload size in bytes.
    pub size: u32,
    pub backend_metadata_size: u32,
    /// Size of the data that was fed to the erasure code.
    pub orig_data_size: u64,
    pub checksum_type: u8,
    pub checksum: [u32; 8],
    pub checksum_mismatch: u8,
    pub backend_id: u8,
    pub backend_version: u32,
}

impl FragmentMetadata {
    fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.index);
        buf.put_u32_le(self.size);
        buf.put_u32_le(self.backend_metadata_size);
        buf.put_u64_le(self.orig_data_size);
        buf.put_u8(self.checksum_type);
        for word in self.checksum {
            buf.put_u32_le(word);
        }
        buf.put_u8(self.checksum_mismatch);
        buf.put_u8(self.backend_id);
        buf.put_u32_le(self.backend_version);
    }

    fn read_from(buf: &mut impl Buf) -> Self {
        let index = buf.get_u32_le();
        let size = buf.get_u32_le();
        let backend_metadata_size = buf.get_u32_le();
        let orig_data_size = buf.get_u64_le();
        let checksum_type = buf.get_u8();
        let mut checksum = [0u32; 8];
        for word in checksum.iter_mut() {
            *word = buf.get_u32_le();
        }
        Self {
            index,
            size,
            backend_metadata_size,
            orig_data_size,
            checksum_type,
            checksum,
            checksum_mismatch: buf.get_u8(),
            backend_id: buf.get_u8(),
            backend_version: buf.get_u32_le(),
        }
    }

    /// CRC-32 of the packed metadata.
    pub fn crc32(&self) -> u32 {
        let mut buf = BytesMut::with_capacity(METADATA_SIZE);
        self.write_to(&mut buf);
        crc32fast::hash(&buf)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub metadata: FragmentMetadata,
    pub magic: u32,
    pub libec_version: u32,
    pub metadata_checksum: u32,
}

impl FragmentHeader {
    /// Creates a header for freshly produced fragments, stamping the magic,
    /// version and metadata checksum.
    pub fn new(metadata: FragmentMetadata) -> Self {
        Self {
            metadata,
            magic: FRAGMENT_MAGIC,
            libec_version: LIBEC_VERSION,
            metadata_checksum: metadata.crc32(),
        }
    }

    /// Parses the first [`HEADER_SIZE`] bytes of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::MalformedHeader(format!(
                "expected at least {} bytes, got {}",
                HEADER_SIZE,
                bytes.len()
            )));
        }
        let mut buf = &bytes[..HEADER_SIZE];
        let metadata = FragmentMetadata::read_from(&mut buf);
        let magic = buf.get_u32_le();
        if magic != FRAGMENT_MAGIC {
            return Err(Error::MalformedHeader(format!(
                "invalid magic number {:#010x}",
                magic
            )));
        }
        Ok(Self {
            metadata,
            magic,
            libec_version: buf.get_u32_le(),
            metadata_checksum: buf.get_u32_le(),
        })
    }

    pub fn pack(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        self.metadata.write_to(&mut buf);
        buf.put_u32_le(self.magic);
        buf.put_u32_le(self.libec_version);
        buf.put_u32_le(self.metadata_checksum);
        buf.put_bytes(0, PADDING);
        buf.freeze()
    }

    /// Returns a copy describing the fragment at codeword position `index`.
    /// Every other field, including the metadata checksum, is left as is.
    pub fn relabel(&self, index: u32, size: u32, orig_data_size: u64) -> Self {
        let mut header = *self;
        header.metadata.index = index;
        header.metadata.size = size;
        header.metadata.orig_data_size = orig_data_size;
        header
    }
}
