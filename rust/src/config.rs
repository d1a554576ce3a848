//! Instance shape and engine policy.
//!
//! [`InstanceConfig`] is what the caller asks for; [`Dimensions`] is the
//! padded shape the kernels actually work on; [`EnginePolicy`] selects the
//! numeric precision and rescaling strategy at construction time so both
//! variants can live side by side in one process.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable overriding [`Precision`] (`double` | `single`).
pub const PRECISION_ENV: &str = "PHYLO_ACCEL_PRECISION";
/// Environment variable overriding [`RescalingStrategy`] (`dynamic` | `none`).
pub const RESCALING_ENV: &str = "PHYLO_ACCEL_RESCALING";

/// Sizes requested when an instance is created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Number of tips; tips occupy buffer indices `0..tip_count`.
    pub tip_count: usize,
    /// Number of partial-likelihood buffers (tips included).
    pub partials_buffer_count: usize,
    /// Number of compact state buffers; caps how many tips may hold states.
    pub compact_buffer_count: usize,
    /// True number of character states (4 for nucleotides).
    pub state_count: usize,
    /// True number of site patterns.
    pub pattern_count: usize,
    /// Number of eigendecomposition slots (one per substitution model).
    pub eigen_count: usize,
    /// Number of transition-matrix slots.
    pub matrix_count: usize,
}

impl InstanceConfig {
    /// Total number of node buffer indices.
    pub fn buffer_count(&self) -> usize {
        self.partials_buffer_count + self.compact_buffer_count
    }

    /// Number of internal (non-tip) node indices.
    pub fn internal_count(&self) -> usize {
        self.buffer_count().saturating_sub(self.tip_count)
    }

    /// Reject shapes the engine cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.tip_count < 2 {
            return Err(Error::InvalidArgument(format!(
                "tip_count must be at least 2, got {}",
                self.tip_count
            )));
        }
        if self.buffer_count() <= self.tip_count {
            return Err(Error::InvalidArgument(format!(
                "buffer count {} leaves no internal nodes for {} tips",
                self.buffer_count(),
                self.tip_count
            )));
        }
        if self.compact_buffer_count > self.tip_count {
            return Err(Error::InvalidArgument(format!(
                "compact_buffer_count {} exceeds tip_count {}",
                self.compact_buffer_count, self.tip_count
            )));
        }
        if self.state_count < 2 {
            return Err(Error::InvalidArgument(format!(
                "state_count must be at least 2, got {}",
                self.state_count
            )));
        }
        if self.pattern_count == 0 {
            return Err(Error::InvalidArgument("pattern_count must be positive".into()));
        }
        if self.eigen_count == 0 || self.matrix_count == 0 {
            return Err(Error::InvalidArgument(
                "eigen_count and matrix_count must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Padded state count for a model class.
///
/// Nucleotide-sized models pad to 4, larger alphabets to the next kernel
/// width (16, 32, 48, 64), anything wider to a multiple of 16.
pub fn padded_state_count(state_count: usize) -> usize {
    match state_count {
        0..=4 => 4,
        5..=16 => 16,
        17..=32 => 32,
        33..=48 => 48,
        49..=64 => 64,
        n => n.div_ceil(16) * 16,
    }
}

/// Padded pattern count. Only the 4-state class pads patterns (to a multiple of 4).
pub fn padded_pattern_count(pattern_count: usize, padded_states: usize) -> usize {
    if padded_states == 4 {
        pattern_count.div_ceil(4) * 4
    } else {
        pattern_count
    }
}

/// Padded shape derived from a validated [`InstanceConfig`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dimensions {
    /// Tips, at indices `0..tip_count`.
    pub tip_count: usize,
    /// All node indices.
    pub buffer_count: usize,
    /// Compact tip-state buffers.
    pub compact_count: usize,
    /// Caller-visible state count.
    pub state_count: usize,
    /// Kernel state width.
    pub padded_state_count: usize,
    /// Caller-visible pattern count.
    pub pattern_count: usize,
    /// Kernel pattern count (`>= pattern_count`).
    pub padded_pattern_count: usize,
    /// Eigendecomposition slots.
    pub eigen_count: usize,
    /// Transition-matrix slots.
    pub matrix_count: usize,
    /// Rate categories; fixed at one.
    pub category_count: usize,
}

impl Dimensions {
    /// Validate `config` and compute its padded shape.
    pub fn from_config(config: &InstanceConfig) -> Result<Self> {
        config.validate()?;
        let padded_states = padded_state_count(config.state_count);
        Ok(Self {
            tip_count: config.tip_count,
            buffer_count: config.buffer_count(),
            compact_count: config.compact_buffer_count,
            state_count: config.state_count,
            padded_state_count: padded_states,
            pattern_count: config.pattern_count,
            padded_pattern_count: padded_pattern_count(config.pattern_count, padded_states),
            eigen_count: config.eigen_count,
            matrix_count: config.matrix_count,
            category_count: 1,
        })
    }

    /// Elements in one partial-likelihood buffer.
    pub fn partials_len(&self) -> usize {
        self.padded_pattern_count * self.padded_state_count * self.category_count
    }

    /// Elements in one transition matrix.
    pub fn matrix_len(&self) -> usize {
        self.padded_state_count * self.padded_state_count
    }

    /// Patterns added by padding.
    pub fn padding_patterns(&self) -> usize {
        self.padded_pattern_count - self.pattern_count
    }

    /// The "no data" state index written into padding patterns and
    /// substituted for out-of-range tip states.
    pub fn ambiguous_state(&self) -> i32 {
        self.padded_state_count as i32
    }

    /// Internal node indices.
    pub fn internal_nodes(&self) -> std::ops::Range<usize> {
        self.tip_count..self.buffer_count
    }
}

/// Numeric precision of device-resident values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// 64-bit storage and arithmetic.
    #[default]
    Double,
    /// Values are stored as 32-bit floats.
    Single,
}

impl Precision {
    /// Bytes per stored real.
    pub fn real_size(self) -> u64 {
        match self {
            Precision::Double => 8,
            Precision::Single => 4,
        }
    }
}

/// How partials are protected against underflow.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RescalingStrategy {
    /// Per-node scaling factors, forced on the first pass and then on request.
    #[default]
    Dynamic,
    /// No scaling buffers; partials are used as computed.
    None,
}

/// Construction-time engine policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnginePolicy {
    /// Default: `Double`
    pub precision: Precision,
    /// Default: `Dynamic`
    pub rescaling: RescalingStrategy,
}

impl EnginePolicy {
    /// Policy with the given precision and dynamic rescaling.
    pub fn with_precision(precision: Precision) -> Self {
        Self { precision, ..Self::default() }
    }

    /// Default policy, overridden by [`PRECISION_ENV`] and [`RESCALING_ENV`].
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut policy = Self::default();
        if let Some(raw) = lookup(PRECISION_ENV) {
            policy.precision = raw
                .parse()
                .map_err(|e: Error| Error::InvalidArgument(format!("{PRECISION_ENV}: {e}")))?;
        }
        if let Some(raw) = lookup(RESCALING_ENV) {
            policy.rescaling = raw
                .parse()
                .map_err(|e: Error| Error::InvalidArgument(format!("{RESCALING_ENV}: {e}")))?;
        }
        Ok(policy)
    }
}

impl FromStr for Precision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "double" | "f64" => Ok(Precision::Double),
            "single" | "f32" => Ok(Precision::Single),
            other => Err(Error::InvalidArgument(format!("unknown precision '{other}'"))),
        }
    }
}

impl FromStr for RescalingStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dynamic" => Ok(RescalingStrategy::Dynamic),
            "none" | "off" => Ok(RescalingStrategy::None),
            other => Err(Error::InvalidArgument(format!("unknown rescaling strategy '{other}'"))),
        }
    }
}
