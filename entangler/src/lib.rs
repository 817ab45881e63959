// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

pub mod entangler;
pub use entangler::*;
pub mod config;
pub use config::*;
pub mod erasure;
pub use erasure::{ErasureBackend, ErasureDriver};
pub mod header;
pub use header::{FragmentHeader, FragmentMetadata};
pub mod service;
pub use service::{CoderService, EncodedFile};
pub mod source;
pub use source::BlockSource;
pub mod strip;
pub use strip::{Envelope, Strip};

#[cfg(any(test, feature = "mock"))]
pub mod mock;
