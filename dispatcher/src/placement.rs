// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};

use crate::Error;

/// Spreads `n` indices over `providers` so that each index is held by
/// `replication_factor` distinct providers.
///
/// With no more providers than the replication factor every provider gets
/// every index. Otherwise the ring of providers is walked from a random
/// start for `n * replication_factor` steps, each index taking
/// `replication_factor` consecutive steps, so provider loads differ by at
/// most one.
pub fn place(
    n: usize,
    providers: &[String],
    replication_factor: usize,
) -> Result<BTreeMap<String, BTreeSet<usize>>, Error> {
    place_with_rng(n, providers, replication_factor, &mut rand::thread_rng())
}

pub fn place_with_rng<R: Rng + ?Sized>(
    n: usize,
    providers: &[String],
    replication_factor: usize,
    rng: &mut R,
) -> Result<BTreeMap<String, BTreeSet<usize>>, Error> {
    let distinct: BTreeSet<&String> = providers.iter().collect();
    if distinct.len() != providers.len() {
        return Err(Error::InvalidArgument(
            "provider names must be unique".to_string(),
        ));
    }
    if n > 0 && (providers.is_empty() || replication_factor == 0) {
        return Err(Error::InvalidArgument(format!(
            "cannot place {} blocks on {} providers with a replication factor of {}",
            n,
            providers.len(),
            replication_factor
        )));
    }

    let mut placement: BTreeMap<String, BTreeSet<usize>> = providers
        .iter()
        .map(|provider| (provider.clone(), BTreeSet::new()))
        .collect();
    if n == 0 {
        return Ok(placement);
    }
    if providers.len() <= replication_factor {
        for indices in placement.values_mut() {
            indices.extend(0..n);
        }
        return Ok(placement);
    }

    let start = rng.gen_range(0..providers.len());
    for step in 0..n * replication_factor {
        let provider = &providers[(start + step) % providers.len()];
        if let Some(indices) = placement.get_mut(provider) {
            indices.insert(step / replication_factor);
        }
    }
    Ok(placement)
}
