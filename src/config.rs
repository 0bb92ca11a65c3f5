//! Tuning knobs shared by the tree variants.
//!
//! [`TreeConfig`] carries the splay-probability parameters, the try-lock
//! budgets, and the optimistic version-counter width. Defaults match the
//! constants the algorithms were tuned with; [`TreeConfig::from_env`]
//! ingests the same environment variables a benchmark harness would set.

use std::env;
use std::fmt as StdFmt;

/// Configuration for the concurrent tree maps.
///
/// All variants accept a `TreeConfig` via `with_config`; `new()` uses
/// [`TreeConfig::default`]. Only the fields relevant to a given variant
/// are consulted (the AVL variant, for example, ignores the splay gate
/// parameters).
#[derive(Debug, Clone, PartialEq)]
pub struct TreeConfig {
    /// Expected number of worker threads; scales the splay probability.
    pub thread_num: u32,

    /// Inverse splay probability factor.
    /// Splay probability = 1 / (`inv_splay_prob` * `thread_num`).
    pub inv_splay_prob: u32,

    /// Depth-to-counter threshold for entering a splay.
    pub k1: f64,

    /// Depth-to-counter threshold for continuing a splay.
    pub k2: f64,

    /// Depth at or below which splaying is suppressed.
    pub max_depth: u64,

    /// Total try-lock conflicts tolerated across one splay invocation.
    pub conflicts: u32,

    /// Try-lock attempts per ancestor, and spins before yielding in the
    /// optimistic wait loop.
    pub spin_count: u32,

    /// Yields before falling back to a blocking lock in the optimistic
    /// wait loop.
    pub yield_count: u32,

    /// Width in bits of the grow/shrink counters in the optimistic
    /// version word. Must be in `1..=30`.
    pub ovl_bits_before_overflow: u32,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            thread_num: 8,
            inv_splay_prob: 8,
            k1: 3.0,
            k2: 0.5,
            max_depth: 5,
            conflicts: 500,
            spin_count: 100,
            yield_count: 0,
            ovl_bits_before_overflow: 8,
        }
    }
}

impl TreeConfig {
    /// Probability that an access enters the splay gate at all.
    #[must_use]
    pub fn splay_prob(&self) -> f64 {
        1.0 / (f64::from(self.inv_splay_prob) * f64::from(self.thread_num))
    }

    /// Read configuration from the environment.
    ///
    /// Recognized variables: `THREAD_NUM`, `INV_SPLAY_PROB`, `K1`, `K2`,
    /// `MAX_DEPTH`, `CONFLICTS`, `SPIN_COUNT`, `YIELD_COUNT`,
    /// `OVL_BITS_BEFORE_OVERFLOW`. Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable is set but does not parse,
    /// or parses to a value outside its documented range.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = read_var::<u32>("THREAD_NUM")? {
            config.thread_num = v;
        }
        if let Some(v) = read_var::<u32>("INV_SPLAY_PROB")? {
            config.inv_splay_prob = v;
        }
        if let Some(v) = read_var::<f64>("K1")? {
            config.k1 = v;
        }
        if let Some(v) = read_var::<f64>("K2")? {
            config.k2 = v;
        }
        if let Some(v) = read_var::<u64>("MAX_DEPTH")? {
            config.max_depth = v;
        }
        if let Some(v) = read_var::<u32>("CONFLICTS")? {
            config.conflicts = v;
        }
        if let Some(v) = read_var::<u32>("SPIN_COUNT")? {
            config.spin_count = v;
        }
        if let Some(v) = read_var::<u32>("YIELD_COUNT")? {
            config.yield_count = v;
        }
        if let Some(v) = read_var::<u32>("OVL_BITS_BEFORE_OVERFLOW")? {
            config.ovl_bits_before_overflow = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check range constraints on all fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::OutOfRange`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_num == 0 {
            return Err(ConfigError::OutOfRange("THREAD_NUM"));
        }
        if self.inv_splay_prob == 0 {
            return Err(ConfigError::OutOfRange("INV_SPLAY_PROB"));
        }
        if self.k1 <= 0.0 || self.k2 <= 0.0 {
            return Err(ConfigError::OutOfRange("K1/K2"));
        }
        if self.conflicts == 0 || self.spin_count == 0 {
            return Err(ConfigError::OutOfRange("CONFLICTS/SPIN_COUNT"));
        }
        if self.ovl_bits_before_overflow == 0 || self.ovl_bits_before_overflow > 30 {
            return Err(ConfigError::OutOfRange("OVL_BITS_BEFORE_OVERFLOW"));
        }
        Ok(())
    }
}

/// Read and parse one environment variable, `None` if unset.
fn read_var<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Parse { name, raw }),
        Err(_) => Ok(None),
    }
}

/// Errors from environment ingestion or range validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable was set but did not parse as the expected type.
    Parse {
        /// Variable name.
        name: &'static str,
        /// The raw value that failed to parse.
        raw: String,
    },

    /// A field value is outside its documented range.
    OutOfRange(&'static str),
}

impl StdFmt::Display for ConfigError {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::Parse { name, raw } => write!(f, "invalid value {raw:?} for {name}"),

            Self::OutOfRange(name) => write!(f, "{name} out of range"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = TreeConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.splay_prob() > 0.0 && config.splay_prob() <= 1.0);
    }

    #[test]
    fn splay_prob_scales_with_threads() {
        let mut config = TreeConfig::default();
        let base = config.splay_prob();

        config.thread_num *= 2;
        assert!((config.splay_prob() - base / 2.0).abs() < 1e-12);
    }

    #[test]
    fn rejects_zero_thread_num() {
        let config = TreeConfig {
            thread_num: 0,
            ..TreeConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::OutOfRange("THREAD_NUM")));
    }

    #[test]
    fn rejects_wide_ovl_counters() {
        let config = TreeConfig {
            ovl_bits_before_overflow: 31,
            ..TreeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn error_display_names_variable() {
        let err = ConfigError::Parse {
            name: "K1",
            raw: "abc".to_string(),
        };
        assert!(err.to_string().contains("K1"));
    }
}
