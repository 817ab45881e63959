// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use bytes::{BufMut, Bytes, BytesMut};
use reed_solomon_erasure::{galois_16, galois_8, Field, ReedSolomon};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::header::{FragmentHeader, FragmentMetadata, HEADER_SIZE};
use crate::Error;

const BACKEND_VERSION: u32 = 0x0006_0000;

/// Erasure code families available to the entangler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ErasureBackend {
    /// Systematic Reed-Solomon with a Vandermonde matrix over GF(2^8).
    #[default]
    #[serde(rename = "rs_vand")]
    ReedSolomonVand,
    /// Reed-Solomon over GF(2^16). Payloads are made of 2-byte words.
    #[serde(rename = "rs_gf16")]
    ReedSolomonGf16,
}

impl ErasureBackend {
    pub fn name(&self) -> &'static str {
        match self {
            ErasureBackend::ReedSolomonVand => "rs_vand",
            ErasureBackend::ReedSolomonGf16 => "rs_gf16",
        }
    }

    /// Identifier written to the `backend_id` field of fragment headers.
    pub fn id(&self) -> u8 {
        match self {
            ErasureBackend::ReedSolomonVand => 6,
            ErasureBackend::ReedSolomonGf16 => 16,
        }
    }

    /// Number of bytes in a field element. Payload sizes are multiples of it.
    pub fn word_size(&self) -> usize {
        match self {
            ErasureBackend::ReedSolomonVand => 1,
            ErasureBackend::ReedSolomonGf16 => 2,
        }
    }

    /// Largest codeword length supported by the field.
    pub fn max_fragments(&self) -> usize {
        match self {
            ErasureBackend::ReedSolomonVand => galois_8::Field::ORDER,
            ErasureBackend::ReedSolomonGf16 => galois_16::Field::ORDER,
        }
    }

    /// Creates a driver turning `k` data fragments into `m` parities.
    pub fn driver(&self, k: usize, m: usize) -> Result<ErasureDriver, Error> {
        if k == 0 || m == 0 {
            return Err(Error::InvalidConfiguration(format!(
                "{} needs at least one data and one parity fragment (k={}, m={})",
                self.name(),
                k,
                m
            )));
        }
        if k + m > self.max_fragments() {
            return Err(Error::InvalidConfiguration(format!(
                "{} supports at most {} fragments, k + m = {}",
                self.name(),
                self.max_fragments(),
                k + m
            )));
        }
        let codec = match self {
            ErasureBackend::ReedSolomonVand => Codec::Gf8(galois_8::ReedSolomon::new(k, m)?),
            ErasureBackend::ReedSolomonGf16 => Codec::Gf16(galois_16::ReedSolomon::new(k, m)?),
        };
        Ok(ErasureDriver {
            backend: *self,
            k,
            m,
            codec,
        })
    }
}

impl fmt::Display for ErasureBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ErasureBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rs_vand" => Ok(ErasureBackend::ReedSolomonVand),
            "rs_gf16" => Ok(ErasureBackend::ReedSolomonGf16),
            other => Err(Error::UnknownBackend(other.to_string())),
        }
    }
}

enum Codec {
    Gf8(galois_8::ReedSolomon),
    Gf16(galois_16::ReedSolomon),
}

/// A `(k, m)` erasure code producing fragments with a [`FragmentHeader`].
pub struct ErasureDriver {
    backend: ErasureBackend,
    k: usize,
    m: usize,
    codec: Codec,
}

impl fmt::Debug for ErasureDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErasureDriver")
            .field("backend", &self.backend)
            .field("k", &self.k)
            .field("m", &self.m)
            .finish()
    }
}

impl ErasureDriver {
    pub fn backend(&self) -> ErasureBackend {
        self.backend
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn m(&self) -> usize {
        self.m
    }

    /// Payload size used for `len` bytes of input.
    pub fn fragment_size(&self, len: usize) -> usize {
        let word = self.backend.word_size();
        let size = len.div_ceil(self.k).max(1);
        size.div_ceil(word) * word
    }

    fn header(&self, index: usize, size: usize, orig_data_size: u64) -> FragmentHeader {
        FragmentHeader::new(FragmentMetadata {
            index: index as u32,
            size: size as u32,
            orig_data_size,
            backend_id: self.backend.id(),
            backend_version: BACKEND_VERSION,
            ..Default::default()
        })
    }

    fn wrap(&self, index: usize, payload: &[u8], orig_data_size: u64) -> Bytes {
        let mut fragment = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        fragment.put(self.header(index, payload.len(), orig_data_size).pack());
        fragment.put_slice(payload);
        fragment.freeze()
    }

    /// Splits `data` into `k` zero padded payloads and computes `m` parities.
    /// Returns the `k + m` fragments in codeword order.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Bytes>, Error> {
        let size = self.fragment_size(data.len());
        let mut shards: Vec<Vec<u8>> = (0..self.k)
            .map(|i| {
                let start = (i * size).min(data.len());
                let end = ((i + 1) * size).min(data.len());
                let mut shard = data[start..end].to_vec();
                shard.resize(size, 0);
                shard
            })
            .collect();
        shards.resize(self.k + self.m, vec![0; size]);

        match &self.codec {
            Codec::Gf8(rs) => rs.encode(&mut shards)?,
            Codec::Gf16(rs) => {
                let mut words: Vec<Vec<[u8; 2]>> = shards.iter().map(|s| to_words(s)).collect();
                rs.encode(&mut words)?;
                shards = words.iter().map(|w| from_words(w)).collect();
            }
        }

        let orig_data_size = data.len() as u64;
        Ok(shards
            .iter()
            .enumerate()
            .map(|(index, shard)| self.wrap(index, shard, orig_data_size))
            .collect())
    }

    /// Rebuilds the original data from any `k` distinct fragments.
    pub fn decode(&self, fragments: &[Bytes]) -> Result<Bytes, Error> {
        let (mut shards, size, orig_data_size) = self.collect(fragments)?;
        self.run(&mut shards, true)?;
        let mut data = BytesMut::with_capacity(self.k * size);
        for shard in shards.iter().take(self.k).flatten() {
            data.put_slice(shard);
        }
        data.truncate(orig_data_size as usize);
        Ok(data.freeze())
    }

    /// Recomputes the fragments at codeword positions `missing`, in that
    /// order, with the same headers [`ErasureDriver::encode`] produces.
    pub fn reconstruct(&self, fragments: &[Bytes], missing: &[usize]) -> Result<Vec<Bytes>, Error> {
        let total = self.k + self.m;
        if let Some(&index) = missing.iter().find(|&&index| index >= total) {
            return Err(Error::IndexOutOfRange { index, bound: total });
        }
        let (mut shards, _, orig_data_size) = self.collect(fragments)?;
        for &index in missing {
            shards[index] = None;
        }
        self.run(&mut shards, false)?;
        missing
            .iter()
            .map(|&index| {
                shards[index]
                    .as_ref()
                    .map(|shard| self.wrap(index, shard, orig_data_size))
                    .ok_or_else(|| {
                        Error::InsufficientFragments(format!("fragment {} was not rebuilt", index))
                    })
            })
            .collect()
    }

    /// Lowest `k` codeword positions that are not in `missing`.
    pub fn fragments_needed(&self, missing: &[usize]) -> Result<Vec<usize>, Error> {
        let needed: Vec<usize> = (0..self.k + self.m)
            .filter(|index| !missing.contains(index))
            .take(self.k)
            .collect();
        if needed.len() < self.k {
            return Err(Error::InsufficientFragments(format!(
                "{} fragments missing out of {}, at most {} can be lost",
                missing.len(),
                self.k + self.m,
                self.m
            )));
        }
        Ok(needed)
    }

    /// Places the payloads of `fragments` at their codeword position.
    fn collect(&self, fragments: &[Bytes]) -> Result<(Vec<Option<Vec<u8>>>, usize, u64), Error> {
        let total = self.k + self.m;
        let first = fragments
            .first()
            .ok_or_else(|| Error::InsufficientFragments("no fragment provided".to_string()))?;
        let model = FragmentHeader::parse(first)?;
        let size = model.metadata.size as usize;
        if size % self.backend.word_size() != 0 {
            return Err(Error::MalformedHeader(format!(
                "fragment size {} is not a multiple of the {} word size",
                size, self.backend
            )));
        }

        let mut shards: Vec<Option<Vec<u8>>> = vec![None; total];
        let mut available = 0;
        for fragment in fragments {
            let header = FragmentHeader::parse(fragment)?;
            let index = header.metadata.index as usize;
            if index >= total {
                return Err(Error::IndexOutOfRange { index, bound: total });
            }
            let payload = &fragment[HEADER_SIZE..];
            if header.metadata.size as usize != size || payload.len() < size {
                return Err(Error::MalformedHeader(format!(
                    "fragment {} has size {} and {} payload bytes, expected {}",
                    index,
                    header.metadata.size,
                    payload.len(),
                    size
                )));
            }
            if shards[index].is_none() {
                shards[index] = Some(payload[..size].to_vec());
                available += 1;
            }
        }
        if available < self.k {
            return Err(Error::InsufficientFragments(format!(
                "{} distinct fragments available, {} required",
                available, self.k
            )));
        }
        Ok((shards, size, model.metadata.orig_data_size))
    }

    fn run(&self, shards: &mut Vec<Option<Vec<u8>>>, data_only: bool) -> Result<(), Error> {
        match &self.codec {
            Codec::Gf8(rs) => rebuild(rs, shards, data_only),
            Codec::Gf16(rs) => {
                let mut words: Vec<Option<Vec<[u8; 2]>>> = shards
                    .iter()
                    .map(|shard| shard.as_deref().map(to_words))
                    .collect();
                rebuild(rs, &mut words, data_only)?;
                *shards = words
                    .iter()
                    .map(|shard| shard.as_deref().map(from_words))
                    .collect();
                Ok(())
            }
        }
    }
}

fn rebuild<F: Field>(
    rs: &ReedSolomon<F>,
    shards: &mut [Option<Vec<F::Elem>>],
    data_only: bool,
) -> Result<(), Error> {
    if data_only {
        rs.reconstruct_data(shards)?;
    } else {
        rs.reconstruct(shards)?;
    }
    Ok(())
}

fn to_words(bytes: &[u8]) -> Vec<[u8; 2]> {
    bytes.chunks_exact(2).map(|pair| [pair[0], pair[1]]).collect()
}

fn from_words(words: &[[u8; 2]]) -> Vec<u8> {
    words.iter().flatten().copied().collect()
}
