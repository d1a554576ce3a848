//! Device memory and kernel contract.
//!
//! The engine never touches device memory directly. Everything it needs from
//! an accelerator is expressed by [`Backend`]: typed buffer allocation and
//! transfer, plus the numeric kernels of the pruning algorithm. Buffers are
//! released by dropping them, so every buffer is freed exactly once.
//!
//! # Layouts
//!
//! With `P` the padded state count and `N` the padded pattern count:
//!
//! - partials: `[category][pattern][state]`, `partials[p * P + s]`
//! - tip states: one `i32` per pattern; `P` marks an ambiguous state
//! - transition matrix: row-major by parent state, `m[i * P + j] = P(i -> j)`
//! - eigenvectors / inverse eigenvectors: transposed, `evec[k * P + i] = E[i][k]`,
//!   `ievc[j * P + k] = E⁻¹[k][j]`
//! - scaling factors: one linear factor per pattern; the root aggregate holds
//!   the per-pattern sum of their logs

use crate::config::Dimensions;
use crate::device::DeviceId;
use crate::error::Result;

/// Kernel launch shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelShape {
    /// Padded pattern count.
    pub pattern_count: usize,
    /// Padded state count.
    pub state_count: usize,
    /// Rate categories.
    pub category_count: usize,
}

impl From<&Dimensions> for KernelShape {
    fn from(dims: &Dimensions) -> Self {
        Self {
            pattern_count: dims.padded_pattern_count,
            state_count: dims.padded_state_count,
            category_count: dims.category_count,
        }
    }
}

/// What a pruning kernel does with the parent's scaling-factor buffer.
pub enum ScalingMode<'a, R> {
    /// No rescaling.
    Off,
    /// Reduce a fresh per-pattern factor, store it, and divide it out.
    Compute(&'a mut R),
    /// Divide out factors stored by an earlier pass.
    Apply(&'a R),
}

/// Device-resident eigendecomposition of one substitution model.
pub struct DeviceEigen<R> {
    /// Transposed eigenvectors, `P * P`.
    pub evec: R,
    /// Transposed inverse eigenvectors, `P * P`.
    pub ievc: R,
    /// Eigenvalues, `P`.
    pub evals: R,
}

/// One accelerator's memory allocator and kernel library.
pub trait Backend: Send {
    /// Device buffer of reals.
    type RealBuffer: Send;
    /// Device buffer of 32-bit integers.
    type IntBuffer: Send;

    /// Device this backend is bound to.
    fn device_id(&self) -> DeviceId;

    /// Allocate a zero-filled real buffer of `len` elements.
    fn alloc_real(&mut self, len: usize) -> Result<Self::RealBuffer>;

    /// Allocate a zero-filled integer buffer of `len` elements.
    fn alloc_int(&mut self, len: usize) -> Result<Self::IntBuffer>;

    /// Host → device copy of exactly the buffer's length.
    fn write_real(&mut self, dst: &mut Self::RealBuffer, src: &[f64]) -> Result<()>;

    /// Host → device copy of exactly the buffer's length.
    fn write_int(&mut self, dst: &mut Self::IntBuffer, src: &[i32]) -> Result<()>;

    /// Device → host copy of the first `dst.len()` elements.
    fn read_real(&self, src: &Self::RealBuffer, dst: &mut [f64]) -> Result<()>;

    /// `out[n] = E · diag(exp(λ · edge_lengths[n])) · E⁻¹` for every `n`, in one batch.
    fn transition_matrices(
        &mut self,
        eigen: &DeviceEigen<Self::RealBuffer>,
        edge_lengths: &[f64],
        out: &mut [&mut Self::RealBuffer],
        state_count: usize,
    ) -> Result<()>;

    /// Pruning step with two tip-state children.
    #[allow(clippy::too_many_arguments)]
    fn states_states(
        &mut self,
        states1: &Self::IntBuffer,
        states2: &Self::IntBuffer,
        matrix1: &Self::RealBuffer,
        matrix2: &Self::RealBuffer,
        dest: &mut Self::RealBuffer,
        scaling: ScalingMode<'_, Self::RealBuffer>,
        shape: KernelShape,
    ) -> Result<()>;

    /// Pruning step with a tip-state child (always first) and a partials child.
    #[allow(clippy::too_many_arguments)]
    fn states_partials(
        &mut self,
        states1: &Self::IntBuffer,
        partials2: &Self::RealBuffer,
        matrix1: &Self::RealBuffer,
        matrix2: &Self::RealBuffer,
        dest: &mut Self::RealBuffer,
        scaling: ScalingMode<'_, Self::RealBuffer>,
        shape: KernelShape,
    ) -> Result<()>;

    /// Pruning step with two partials children.
    #[allow(clippy::too_many_arguments)]
    fn partials_partials(
        &mut self,
        partials1: &Self::RealBuffer,
        partials2: &Self::RealBuffer,
        matrix1: &Self::RealBuffer,
        matrix2: &Self::RealBuffer,
        dest: &mut Self::RealBuffer,
        scaling: ScalingMode<'_, Self::RealBuffer>,
        shape: KernelShape,
    ) -> Result<()>;

    /// `out[p] = Σ_n ln(node_factors[n][p])` over the first `pattern_count` entries.
    fn accumulate_root_scaling(
        &mut self,
        node_factors: &[&Self::RealBuffer],
        out: &mut Self::RealBuffer,
        pattern_count: usize,
    ) -> Result<()>;

    /// `out[p] = ln(Σ_c w_c Σ_s π_s root[c][p][s]) + root_scaling[p]`.
    #[allow(clippy::too_many_arguments)]
    fn integrate_root(
        &mut self,
        root: &Self::RealBuffer,
        weights: &Self::RealBuffer,
        frequencies: &Self::RealBuffer,
        root_scaling: Option<&Self::RealBuffer>,
        out: &mut Self::RealBuffer,
        shape: KernelShape,
    ) -> Result<()>;
}
