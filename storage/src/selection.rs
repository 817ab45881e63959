// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Policy deciding which existing blocks become pointers of a new document.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Every stored block is equally likely to be picked.
    Uniform,
    /// Blocks are drawn from a normal distribution centred on the most recent
    /// end of the block index, so recent documents are picked more often.
    Normal { std_dev: f64 },
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        SelectionPolicy::Normal { std_dev: 1000.0 }
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
#[error("Invalid standard deviation {0}")]
pub struct InvalidDeviation(pub f64);

impl SelectionPolicy {
    /// Picks `wanted` distinct positions in `0..available`.
    /// Returns every position when `wanted >= available`.
    pub fn select<R: Rng + ?Sized>(
        &self,
        wanted: usize,
        available: usize,
        rng: &mut R,
    ) -> Result<Vec<usize>, InvalidDeviation> {
        if wanted >= available {
            return Ok((0..available).collect());
        }
        match *self {
            SelectionPolicy::Uniform => Ok(uniform_selection(wanted, available, rng)),
            SelectionPolicy::Normal { std_dev } => {
                if !std_dev.is_finite() || std_dev <= 0.0 {
                    return Err(InvalidDeviation(std_dev));
                }
                normal_selection(wanted, available, std_dev, rng)
            }
        }
    }
}

fn uniform_selection<R: Rng + ?Sized>(wanted: usize, available: usize, rng: &mut R) -> Vec<usize> {
    if available - wanted < wanted {
        let mut selected: Vec<usize> = (0..available).collect();
        while selected.len() > wanted {
            selected.remove(rng.gen_range(0..selected.len()));
        }
        return selected;
    }
    let mut seen = HashSet::with_capacity(wanted);
    let mut selected = Vec::with_capacity(wanted);
    while selected.len() < wanted {
        let index = rng.gen_range(0..available);
        if seen.insert(index) {
            selected.push(index);
        }
    }
    selected
}

fn normal_selection<R: Rng + ?Sized>(
    wanted: usize,
    available: usize,
    std_dev: f64,
    rng: &mut R,
) -> Result<Vec<usize>, InvalidDeviation> {
    let std_dev = std_dev.min(available as f64);

    // Most blocks are kept: remove draws from the full set instead.
    if available - wanted < wanted {
        let mut selected: Vec<usize> = (0..available).collect();
        while selected.len() > wanted {
            let len = selected.len() as f64;
            let normal = Normal::new(len, std_dev.min(len).max(1.0))
                .map_err(|_| InvalidDeviation(std_dev))?;
            let draw = normal.sample(rng).round();
            if draw < 0.0 || draw >= len {
                continue;
            }
            selected.remove(draw as usize);
        }
        return Ok(selected);
    }

    // The deviation must leave at least `wanted` reachable positions below
    // the mean or rejection sampling never terminates.
    let normal = Normal::new(available as f64, std_dev.max(wanted as f64))
        .map_err(|_| InvalidDeviation(std_dev))?;
    let mut seen = HashSet::with_capacity(wanted);
    let mut selected = Vec::with_capacity(wanted);
    while selected.len() < wanted {
        let draw = normal.sample(rng).round();
        if draw < 0.0 || draw >= available as f64 {
            continue;
        }
        let index = draw as usize;
        if seen.insert(index) {
            selected.push(index);
        }
    }
    Ok(selected)
}
