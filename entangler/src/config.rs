// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use serde::{Deserialize, Serialize};

use crate::erasure::ErasureBackend;
use crate::Error;

/// Configuration for the entangler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// The number of source fragments the document is split into.
    pub s: usize,
    /// The number of pointer fragments, blocks of previously stored documents
    /// mixed into the codeword.
    pub t: usize,
    /// The number of parity fragments kept and stored.
    pub p: usize,
    /// The erasure code used to compute the parities.
    #[serde(default)]
    pub backend: ErasureBackend,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            s: 1,
            t: 10,
            p: 3,
            backend: ErasureBackend::default(),
        }
    }
}

impl Config {
    /// Creates a new `Config` with the given parameters. The rest of the parameters are set to
    /// their default values.
    ///
    /// # Arguments
    ///
    /// * `s` - The number of source fragments.
    /// * `t` - The number of pointer fragments.
    /// * `p` - The number of parity fragments.
    ///
    /// # Returns
    ///
    /// A new `Config` with the given parameters.
    pub fn new(s: usize, t: usize, p: usize) -> Self {
        Self {
            s,
            t,
            p,
            ..Self::default()
        }
    }

    pub fn with_backend(mut self, backend: ErasureBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Number of data symbols of the codeword, `s + t`.
    pub fn k(&self) -> usize {
        self.s + self.t
    }

    /// Erasure budget, the number of fragments that may be lost, `p - s`.
    pub fn e(&self) -> usize {
        self.p.saturating_sub(self.s)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.s == 0 {
            return Err(Error::InvalidConfiguration(format!(
                "s({}) must be greater or equal to 1",
                self.s
            )));
        }
        if self.p < self.s {
            return Err(Error::InvalidConfiguration(format!(
                "p({}) must be greater or equal to s({})",
                self.p, self.s
            )));
        }
        let max = self.backend.max_fragments();
        if self.k() + self.p > max {
            return Err(Error::InvalidConfiguration(format!(
                "s + t + p ({}) exceeds the {} fragments supported by {}",
                self.k() + self.p,
                max,
                self.backend
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!((config.s, config.t, config.p), (1, 10, 3));
        assert_eq!(config.k(), 11);
        assert_eq!(config.e(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        assert!(Config::new(1, 0, 1).validate().is_ok());
        assert!(matches!(
            Config::new(0, 10, 3).validate(),
            Err(Error::InvalidConfiguration(msg)) if msg.contains("s(0)")
        ));
        assert!(matches!(
            Config::new(4, 10, 3).validate(),
            Err(Error::InvalidConfiguration(msg)) if msg.contains("p(3)")
        ));
        assert!(Config::new(2, 250, 4).validate().is_ok());
        assert!(Config::new(2, 251, 4).validate().is_err());
        assert!(Config::new(2, 251, 4)
            .with_backend(ErasureBackend::ReedSolomonGf16)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_deserialize_defaults_backend() -> anyhow::Result<()> {
        let config: Config = serde_json::from_str(r#"{"s": 2, "t": 5, "p": 4}"#)?;
        assert_eq!(config, Config::new(2, 5, 4));
        let config: Config =
            serde_json::from_str(r#"{"s": 2, "t": 5, "p": 4, "backend": "rs_gf16"}"#)?;
        assert_eq!(config.backend, ErasureBackend::ReedSolomonGf16);
        Ok(())
    }
}
