// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! # STeP Entanglement Dispatcher
//!
//! Places the strips produced by the entangler on storage providers,
//! fetches them back with checksum validation and repairs documents whose
//! blocks went missing.

pub mod config;
pub use config::{DispatcherConfig, ProviderConfig};
pub mod dispatcher;
pub use dispatcher::*;
pub mod placement;
pub use placement::place;
