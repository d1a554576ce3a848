//! Host-side staging of caller data into kernel layout.
//!
//! Caller arrays are in true (unpadded) shape. Before anything is sent to a
//! device it is expanded here into padded state/pattern slots, ambiguous
//! tip states are remapped, and eigenvector matrices are transposed.

use crate::config::Dimensions;
use crate::error::{Error, Result};

/// Transpose a row-major `size × size` matrix in place.
pub fn transpose_square(matrix: &mut [f64], size: usize) {
    debug_assert_eq!(matrix.len(), size * size);
    for i in 0..size.saturating_sub(1) {
        for j in i + 1..size {
            matrix.swap(i * size + j, j * size + i);
        }
    }
}

/// Nucleotide state of one symbol: `A`, `C`, `G`, `T` (or `U`) map to
/// `0..4` in either case; gaps and ambiguity codes map to `4`, which the
/// engine treats as fully ambiguous.
pub fn nucleotide_state(symbol: u8) -> i32 {
    match symbol.to_ascii_uppercase() {
        b'A' => 0,
        b'C' => 1,
        b'G' => 2,
        b'T' | b'U' => 3,
        _ => 4,
    }
}

/// Tip states of an aligned nucleotide sequence, one per column.
pub fn encode_nucleotides(sequence: &str) -> Vec<i32> {
    sequence.bytes().map(nucleotide_state).collect()
}

/// Dense `[pattern][state]` partials of an aligned nucleotide sequence;
/// ambiguous columns get all-ones rows.
pub fn nucleotide_partials(sequence: &str) -> Vec<f64> {
    sequence
        .bytes()
        .flat_map(|symbol| {
            let state = nucleotide_state(symbol);
            (0..4).map(move |s| if state == 4 || s == state { 1.0 } else { 0.0 })
        })
        .collect()
}

/// Eigendecomposition of a rate matrix, row-major, true state count.
#[derive(Clone, Debug, PartialEq)]
pub struct EigenSystem {
    /// Number of states.
    pub state_count: usize,
    /// Right eigenvectors `E`, `state_count²`, row-major.
    pub eigenvectors: Vec<f64>,
    /// Inverse eigenvectors `E⁻¹`, `state_count²`, row-major.
    pub inverse_eigenvectors: Vec<f64>,
    /// Eigenvalues, `state_count`.
    pub eigenvalues: Vec<f64>,
}

impl EigenSystem {
    /// Jukes-Cantor (1969) nucleotide model with unit mean rate.
    pub fn jukes_cantor() -> Self {
        Self {
            state_count: 4,
            eigenvectors: vec![
                1.0, 2.0, 0.0, 0.5, //
                1.0, -2.0, 0.5, 0.0, //
                1.0, 2.0, 0.0, -0.5, //
                1.0, -2.0, -0.5, 0.0,
            ],
            inverse_eigenvectors: vec![
                0.25, 0.25, 0.25, 0.25, //
                0.125, -0.125, 0.125, -0.125, //
                0.0, 1.0, 0.0, -1.0, //
                1.0, 0.0, -1.0, 0.0,
            ],
            eigenvalues: vec![0.0, -4.0 / 3.0, -4.0 / 3.0, -4.0 / 3.0],
        }
    }

    /// Two-state gain/loss model, `Q = [[-gain, gain], [loss, -loss]]`.
    ///
    /// Stationary frequencies are `[loss, gain] / (gain + loss)`.
    pub fn gain_loss(gain: f64, loss: f64) -> Result<Self> {
        let total = gain + loss;
        if !(gain >= 0.0 && loss >= 0.0 && total > 0.0 && total.is_finite()) {
            return Err(Error::InvalidArgument(format!(
                "gain/loss rates must be non-negative with a positive sum, got {gain}/{loss}"
            )));
        }
        Ok(Self {
            state_count: 2,
            eigenvectors: vec![1.0, gain, 1.0, -loss],
            inverse_eigenvectors: vec![loss / total, gain / total, 1.0 / total, -1.0 / total],
            eigenvalues: vec![0.0, -total],
        })
    }

    /// Symmetric two-state model, `Q = [[-1, 1], [1, -1]]`.
    ///
    /// `P(same, t) = (1 + e^{-2t}) / 2`, `P(diff, t) = (1 - e^{-2t}) / 2`.
    pub fn binary_symmetric() -> Self {
        Self {
            state_count: 2,
            eigenvectors: vec![1.0, 1.0, 1.0, -1.0],
            inverse_eigenvectors: vec![0.5, 0.5, 0.5, -0.5],
            eigenvalues: vec![0.0, -2.0],
        }
    }
}

/// Eigen block in device layout, borrowed from the staging area.
pub struct StagedEigen<'a> {
    /// Transposed, padded eigenvectors.
    pub evec: &'a [f64],
    /// Transposed, padded inverse eigenvectors.
    pub ievc: &'a [f64],
    /// Padded eigenvalues.
    pub evals: &'a [f64],
}

/// Reusable host caches sized for one instance.
#[derive(Debug)]
pub struct StagingArea {
    dims: Dimensions,
    partials: Vec<f64>,
    states: Vec<i32>,
    evec: Vec<f64>,
    ievc: Vec<f64>,
    evals: Vec<f64>,
    frequencies: Vec<f64>,
}

impl StagingArea {
    /// Zeroed caches for `dims`.
    pub fn new(dims: Dimensions) -> Self {
        let p = dims.padded_state_count;
        Self {
            dims,
            partials: vec![0.0; dims.partials_len()],
            states: vec![0; dims.padded_pattern_count],
            evec: vec![0.0; p * p],
            ievc: vec![0.0; p * p],
            evals: vec![0.0; p],
            frequencies: vec![0.0; p],
        }
    }

    /// Expand `[pattern][true state]` partials into the padded block.
    ///
    /// Padded state slots and padding patterns are never written, so they
    /// keep the zeros the cache was created with.
    pub fn stage_partials(&mut self, raw: &[f64]) -> Result<&[f64]> {
        let (s, p) = (self.dims.state_count, self.dims.padded_state_count);
        Error::check_len("partials", self.dims.pattern_count * s, raw.len())?;
        for (row, src) in self.partials.chunks_exact_mut(p).zip(raw.chunks_exact(s)) {
            row[..s].copy_from_slice(src);
        }
        Ok(&self.partials)
    }

    /// Copy tip states, remapping anything outside `0..state_count` and
    /// every padding pattern to the ambiguous sentinel.
    pub fn stage_tip_states(&mut self, raw: &[i32]) -> Result<&[i32]> {
        Error::check_len("tip states", self.dims.pattern_count, raw.len())?;
        let ambiguous = self.dims.ambiguous_state();
        let true_states = self.dims.state_count as i32;
        let (observed, padding) = self.states.split_at_mut(self.dims.pattern_count);
        for (dst, &state) in observed.iter_mut().zip(raw) {
            *dst = if (0..true_states).contains(&state) { state } else { ambiguous };
        }
        padding.fill(ambiguous);
        Ok(&self.states)
    }

    /// Pack an eigensystem into padded, transposed device layout.
    ///
    /// The previous contents are discarded; this is a full replace.
    pub fn stage_eigen(
        &mut self,
        eigenvectors: &[f64],
        inverse_eigenvectors: &[f64],
        eigenvalues: &[f64],
    ) -> Result<StagedEigen<'_>> {
        let (s, p) = (self.dims.state_count, self.dims.padded_state_count);
        Error::check_len("eigenvectors", s * s, eigenvectors.len())?;
        Error::check_len("inverse eigenvectors", s * s, inverse_eigenvectors.len())?;
        Error::check_len("eigenvalues", s, eigenvalues.len())?;
        if eigenvectors
            .iter()
            .chain(inverse_eigenvectors)
            .chain(eigenvalues)
            .any(|v| !v.is_finite())
        {
            return Err(Error::InvalidArgument("eigensystem contains non-finite values".into()));
        }

        self.evec.fill(0.0);
        self.ievc.fill(0.0);
        self.evals.fill(0.0);
        for i in 0..s {
            self.evec[i * p..i * p + s].copy_from_slice(&eigenvectors[i * s..(i + 1) * s]);
            self.ievc[i * p..i * p + s].copy_from_slice(&inverse_eigenvectors[i * s..(i + 1) * s]);
        }
        transpose_square(&mut self.evec, p);
        transpose_square(&mut self.ievc, p);
        self.evals[..s].copy_from_slice(eigenvalues);

        Ok(StagedEigen { evec: &self.evec, ievc: &self.ievc, evals: &self.evals })
    }

    /// Pad base frequencies to the kernel state width.
    pub fn stage_frequencies(&mut self, frequencies: &[f64]) -> Result<&[f64]> {
        let s = self.dims.state_count;
        Error::check_len("state frequencies", s, frequencies.len())?;
        self.frequencies[..s].copy_from_slice(frequencies);
        Ok(&self.frequencies)
    }
}
