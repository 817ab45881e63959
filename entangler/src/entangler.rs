// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use bytes::{BufMut, Bytes, BytesMut};
use futures::future::join_all;
use log::{debug, info, warn};
use std::collections::HashSet;
use storage::parse_block_key;

use crate::config::Config;
use crate::erasure::ErasureDriver;
use crate::header::FragmentHeader;
use crate::source::BlockSource;
use crate::strip::{fit, Envelope, Strip};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Malformed fragment header: {0}")]
    MalformedHeader(String),

    #[error("Malformed strip: {0}")]
    MalformedStrip(String),

    #[error("Not enough fragments: {0}")]
    InsufficientFragments(String),

    #[error("Index {index} is out of range (0 <= index < {bound})")]
    IndexOutOfRange { index: usize, bound: usize },

    #[error("A path is required to fetch additional parity fragments")]
    MissingPath,

    #[error("Pointer {0} is not a block key")]
    InvalidPointer(String),

    #[error("Block {0} is unavailable")]
    BlockUnavailable(String),

    #[error("Unknown erasure backend {0}")]
    UnknownBackend(String),

    #[error("Erasure coding failed: {0}")]
    Erasure(#[from] reed_solomon_erasure::Error),

    #[error("Block source error: {0}")]
    Source(#[source] anyhow::Error),
}

/// Size of each of the `s` source fragments for a document of `len` bytes:
/// `ceil(len / s)` rounded up to an even number, at least 2.
pub fn fragment_size(len: usize, s: usize) -> usize {
    let size = len.div_ceil(s.max(1));
    (size + size % 2).max(2)
}

/// STeP entanglement: the `s` source fragments of a document and `t`
/// pointer fragments taken from already stored blocks form the `k = s + t`
/// data symbols of a Reed-Solomon codeword. Only the `p` parities are kept.
/// Any `e = p - s` of them may be lost, as long as the pointers can still be
/// fetched.
pub struct StepEntangler<S: BlockSource> {
    source: S,
    config: Config,
    driver: ErasureDriver,
}

impl<S: BlockSource> std::fmt::Debug for StepEntangler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "StepEntangler(s={}, t={}, p={}, backend={})",
            self.config.s, self.config.t, self.config.p, self.config.backend
        )
    }
}

impl<S: BlockSource> StepEntangler<S> {
    pub fn new(source: S, config: Config) -> Result<Self, Error> {
        config.validate()?;
        let driver = config.backend.driver(config.k(), config.p)?;
        Ok(Self {
            source,
            config,
            driver,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn k(&self) -> usize {
        self.config.k()
    }

    pub fn e(&self) -> usize {
        self.config.e()
    }

    /// Encodes `data` into `p` strips.
    pub async fn encode(&self, data: &[u8]) -> Result<Vec<Bytes>, Error> {
        let Config { s, t, .. } = self.config;
        let k = self.k();

        let mut pointer_blocks = if t > 0 {
            self.source.get_random_blocks(t).await?
        } else {
            Vec::new()
        };
        pointer_blocks.truncate(t);
        if pointer_blocks.len() < t {
            info!(
                "Only {} blocks available for entanglement, {} pointer slots left empty",
                pointer_blocks.len(),
                t - pointer_blocks.len()
            );
        }

        let pointers = pointer_blocks
            .iter()
            .map(|block| {
                parse_block_key(&block.id)
                    .map(|(path, index)| (path.to_string(), index))
                    .ok_or_else(|| Error::InvalidPointer(block.id.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let size = fragment_size(data.len(), s);
        let mut symbols = BytesMut::with_capacity(k * size);
        symbols.put_slice(data);
        symbols.resize(s * size, 0);
        for block in &pointer_blocks {
            let payload = Envelope::parse(&block.data)?.payload()?;
            symbols.put_slice(&fit(&payload, size));
        }
        symbols.resize(k * size, 0);

        let fragments = self.driver.encode(&symbols)?;
        fragments
            .into_iter()
            .skip(k)
            .map(|fragment| {
                Envelope {
                    pointers: pointers.clone(),
                    original_size: data.len() as u64,
                    fragment,
                }
                .to_bytes()
            })
            .collect()
    }

    /// Decodes the document from strips produced by [`StepEntangler::encode`].
    ///
    /// `s` strips are enough while every pointer can be fetched. Each pointer
    /// that cannot be fetched is compensated by one more parity fetched from
    /// the source, which requires `path`.
    pub async fn decode(&self, strips: &[Bytes], path: Option<&str>) -> Result<Bytes, Error> {
        let envelopes = strips
            .iter()
            .map(Envelope::parse)
            .collect::<Result<Vec<_>, _>>()?;
        let first = envelopes
            .first()
            .ok_or_else(|| Error::InsufficientFragments("no strip provided".to_string()))?;
        let model = FragmentHeader::parse(&first.fragment)?;
        let capacity = (self.config.s * model.metadata.size as usize) as u64;
        if first.original_size > capacity {
            return Err(Error::MalformedStrip(format!(
                "original size {} exceeds the {} bytes held by the source fragments",
                first.original_size, capacity
            )));
        }

        let mut fragments: Vec<Bytes> = envelopes.iter().map(|e| e.fragment.clone()).collect();
        let (pointers, dropped) = self.fetch_pointers(&first.pointers, &model).await?;
        if dropped > self.e() {
            return Err(self.budget_exceeded(dropped));
        }
        fragments.extend(pointers);

        if dropped > 0 {
            let path = path.ok_or(Error::MissingPath)?;
            let highest = self.highest_index(&envelopes)?;
            let extra: Vec<usize> = (highest + 1..highest + 1 + dropped).collect();
            fragments.extend(self.fetch_parities(path, &extra).await?);
        }

        let mut data = self.driver.decode(&fragments)?;
        data.truncate(first.original_size as usize);
        Ok(data)
    }

    /// Rebuilds the strips at the local parity positions `missing` (`0..p`)
    /// from `available` strips of the same document, byte for byte.
    pub async fn reconstruct(
        &self,
        available: &[Bytes],
        missing: &[usize],
        path: Option<&str>,
    ) -> Result<Vec<Bytes>, Error> {
        let k = self.k();
        let p = self.config.p;
        if missing.len() > self.e() {
            return Err(self.budget_exceeded(missing.len()));
        }
        if let Some(&index) = missing.iter().find(|&&index| index >= p) {
            return Err(Error::IndexOutOfRange { index, bound: p });
        }

        let envelopes = available
            .iter()
            .map(Envelope::parse)
            .collect::<Result<Vec<_>, _>>()?;
        let first = envelopes
            .first()
            .ok_or_else(|| Error::InsufficientFragments("no strip provided".to_string()))?;
        let model = FragmentHeader::parse(&first.fragment)?;

        let mut fragments: Vec<Bytes> = envelopes.iter().map(|e| e.fragment.clone()).collect();
        let (pointers, dropped) = self.fetch_pointers(&first.pointers, &model).await?;
        if dropped + missing.len() > self.e() {
            return Err(self.budget_exceeded(dropped + missing.len()));
        }
        fragments.extend(pointers);

        let missing: Vec<usize> = missing.iter().map(|index| index + k).collect();
        if dropped > 0 {
            let path = path.ok_or(Error::MissingPath)?;
            let highest = self.highest_index(&envelopes)?;
            let extra: Vec<usize> = (highest + 1..k + p)
                .filter(|index| !missing.contains(index))
                .take(dropped)
                .collect();
            if extra.len() < dropped {
                return Err(Error::InsufficientFragments(format!(
                    "{} pointers missing but only {} parities left to fetch",
                    dropped,
                    extra.len()
                )));
            }
            fragments.extend(self.fetch_parities(path, &extra).await?);
        }

        debug!("Reconstructing fragments {:?}", missing);
        self.driver
            .reconstruct(&fragments, &missing)?
            .into_iter()
            .map(|fragment| {
                Envelope {
                    pointers: first.pointers.clone(),
                    original_size: first.original_size,
                    fragment,
                }
                .to_bytes()
            })
            .collect()
    }

    /// Codeword indices of the parities to fetch when the parities at the
    /// codeword indices `missing` are lost.
    pub fn fragments_needed(&self, missing: &[usize]) -> Result<Vec<usize>, Error> {
        let Config { s, t, p, .. } = self.config;
        let k = self.k();
        if self.e() == 0 {
            return Err(Error::InsufficientFragments(format!(
                "configuration (s={}, t={}, e={}, p={}) does not allow for reconstruction",
                s,
                t,
                self.e(),
                p
            )));
        }
        if missing.len() > self.e() {
            return Err(self.budget_exceeded(missing.len()));
        }
        if let Some(&index) = missing.iter().find(|&&index| index >= s + t + p) {
            return Err(Error::IndexOutOfRange {
                index,
                bound: s + t + p,
            });
        }
        Ok((k..k + p)
            .filter(|index| !missing.contains(index))
            .take(s)
            .collect())
    }

    fn budget_exceeded(&self, lost: usize) -> Error {
        let Config { s, t, p, .. } = self.config;
        Error::InsufficientFragments(format!(
            "configuration (s={}, t={}, e={}, p={}) does not allow for reconstruction \
             with {} missing fragments",
            s,
            t,
            self.e(),
            p,
            lost
        ))
    }

    fn highest_index(&self, envelopes: &[Envelope]) -> Result<usize, Error> {
        let mut highest = 0;
        for envelope in envelopes {
            let header = FragmentHeader::parse(&envelope.fragment)?;
            highest = highest.max(header.metadata.index as usize);
        }
        Ok(highest)
    }

    /// Fetches the pointers concurrently and relabels them as codeword
    /// positions `s..s + t`. Empty pointer slots become zero fragments.
    /// Returns the fragments that could be fetched and the number of
    /// pointers that could not.
    async fn fetch_pointers(
        &self,
        pointers: &[(String, usize)],
        model: &FragmentHeader,
    ) -> Result<(Vec<Bytes>, usize), Error> {
        let Config { s, t, .. } = self.config;
        if pointers.len() > t {
            return Err(Error::MalformedStrip(format!(
                "{} pointers listed, at most {} expected",
                pointers.len(),
                t
            )));
        }
        let size = model.metadata.size as usize;
        let orig_data_size = model.metadata.orig_data_size;

        let fetched = join_all(
            pointers
                .iter()
                .map(|(path, index)| self.source.get_block(path, *index)),
        )
        .await;

        let mut fragments = Vec::with_capacity(t);
        let mut dropped = 0;
        for (position, ((path, index), result)) in pointers.iter().zip(fetched).enumerate() {
            let strip: Strip = match result {
                Ok(strip) => strip,
                Err(e) => {
                    warn!("Pointer {}[{}] could not be fetched: {}", path, index, e);
                    dropped += 1;
                    continue;
                }
            };
            let envelope = Envelope::parse(&strip.data)?;
            let header = FragmentHeader::parse(&envelope.fragment)?;
            let payload = envelope.payload()?;
            fragments.push(relabelled(
                &header,
                (s + position) as u32,
                &payload,
                size,
                orig_data_size,
            ));
        }
        for position in pointers.len()..t {
            fragments.push(relabelled(
                model,
                (s + position) as u32,
                &[],
                size,
                orig_data_size,
            ));
        }
        if dropped > 0 {
            warn!("Only found {} pointers out of {}", pointers.len() - dropped, pointers.len());
        }
        Ok((fragments, dropped))
    }

    /// Fetches the parities at codeword positions `indices` from `path`.
    async fn fetch_parities(&self, path: &str, indices: &[usize]) -> Result<Vec<Bytes>, Error> {
        let k = self.k();
        let bound = k + self.config.p;
        let mut seen = HashSet::new();
        let mut fragments = Vec::with_capacity(indices.len());
        for &index in indices {
            if index >= bound || !seen.insert(index) {
                return Err(Error::InsufficientFragments(format!(
                    "no parity left to compensate for the missing pointers of {}",
                    path
                )));
            }
            info!("Fetching extra block {}[{}]", path, index - k);
            let strip = self.source.get_block(path, index - k).await?;
            fragments.push(Envelope::parse(&strip.data)?.fragment);
        }
        Ok(fragments)
    }
}

fn relabelled(
    header: &FragmentHeader,
    index: u32,
    payload: &[u8],
    size: usize,
    orig_data_size: u64,
) -> Bytes {
    let mut fragment = BytesMut::new();
    fragment.put(header.relabel(index, size as u32, orig_data_size).pack());
    fragment.put_slice(&fit(payload, size));
    fragment.freeze()
}
