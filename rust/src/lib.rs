//! Accelerator-backed Felsenstein pruning.
//!
//! An engine that computes per-site phylogenetic log-likelihoods on a
//! device. Callers create a [`LikelihoodInstance`] from a [`DevicePool`],
//! upload tip data and a substitution model's eigensystem, build transition
//! matrices for every edge in one batch, run pruning [`Operation`]s in
//! post-order, and integrate at the root.
//!
//! ```no_run
//! use phylo_accel::{AssignmentPolicy, CpuPlatform, DevicePool, EigenSystem, EnginePolicy, Tree};
//!
//! # fn main() -> phylo_accel::Result<()> {
//! let pool = DevicePool::new(CpuPlatform::new(), AssignmentPolicy::RoundRobin)?;
//! let tree = Tree::from_structure(vec![2, 2, -1], vec![0.1, 0.2, 0.0], 2)?;
//! let tips = vec![vec![0, 1, 2, 3], vec![0, 1, 3, 3]];
//! let site_ll = tree.site_log_likelihoods(
//!     &pool,
//!     EnginePolicy::default(),
//!     &EigenSystem::jukes_cantor(),
//!     &[0.25; 4],
//!     &tips,
//! )?;
//! assert_eq!(site_ll.len(), 4);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod cpu;
pub mod device;
pub mod error;
pub mod instance;
pub mod integrate;
pub mod pruning;
pub mod registry;
pub mod staging;
pub mod tree;

pub use backend::{Backend, KernelShape, ScalingMode};
pub use config::{Dimensions, EnginePolicy, InstanceConfig, Precision, RescalingStrategy};
pub use cpu::{CpuDevice, CpuPlatform, MemoryUsage};
pub use device::{AssignmentPolicy, DeviceId, DeviceInfo, DeviceLease, DevicePool, Platform};
pub use error::{BufferKind, Error, Result, ResultCode};
pub use instance::LikelihoodInstance;
pub use pruning::{Operation, RescaleStats};
pub use staging::{
    encode_nucleotides, nucleotide_partials, nucleotide_state, transpose_square, EigenSystem,
};
pub use tree::Tree;

#[cfg(feature = "python")]
mod python {
    use ndarray::Array2;
    use numpy::{PyArray1, PyArray2, PyReadonlyArray1, PyReadonlyArray2};
    use pyo3::exceptions::{PyIndexError, PyMemoryError, PyNotImplementedError, PyValueError};
    use pyo3::prelude::*;
    use pyo3::types::PyDict;
    use pyo3::wrap_pyfunction;

    use crate::{
        AssignmentPolicy, CpuDevice, CpuPlatform, DevicePool, EigenSystem, EnginePolicy, Error,
        InstanceConfig, LikelihoodInstance, Operation, Tree,
    };

    impl From<Error> for PyErr {
        fn from(e: Error) -> PyErr {
            let msg = e.to_string();
            match e {
                Error::IndexOutOfRange { .. } => PyIndexError::new_err(msg),
                Error::OutOfMemory { .. } => PyMemoryError::new_err(msg),
                Error::NotSupported(_) => PyNotImplementedError::new_err(msg),
                _ => PyValueError::new_err(msg),
            }
        }
    }

    fn eigen_system(
        eigenvectors: PyReadonlyArray2<f64>,
        inverse_eigenvectors: PyReadonlyArray2<f64>,
        eigenvalues: PyReadonlyArray1<f64>,
    ) -> EigenSystem {
        EigenSystem {
            state_count: eigenvalues.len(),
            eigenvectors: eigenvectors.as_array().iter().copied().collect(),
            inverse_eigenvectors: inverse_eigenvectors.as_array().iter().copied().collect(),
            eigenvalues: eigenvalues.as_array().to_vec(),
        }
    }

    /// CPU-backed likelihood instance.
    ///
    /// Each Python object owns a private single-device pool.
    #[pyclass(name = "LikelihoodInstance")]
    struct PyLikelihoodInstance {
        inner: LikelihoodInstance<CpuDevice>,
    }

    #[pymethods]
    impl PyLikelihoodInstance {
        #[new]
        #[pyo3(signature = (
            tip_count,
            partials_buffer_count,
            compact_buffer_count,
            state_count,
            pattern_count,
            eigen_count=1,
            matrix_count=None,
            precision="double",
            rescaling="dynamic",
        ))]
        #[allow(clippy::too_many_arguments)]
        fn new(
            tip_count: usize,
            partials_buffer_count: usize,
            compact_buffer_count: usize,
            state_count: usize,
            pattern_count: usize,
            eigen_count: usize,
            matrix_count: Option<usize>,
            precision: &str,
            rescaling: &str,
        ) -> PyResult<Self> {
            let config = InstanceConfig {
                tip_count,
                partials_buffer_count,
                compact_buffer_count,
                state_count,
                pattern_count,
                eigen_count,
                matrix_count: matrix_count.unwrap_or(partials_buffer_count + compact_buffer_count),
            };
            let policy = EnginePolicy { precision: precision.parse()?, rescaling: rescaling.parse()? };
            let pool = DevicePool::new(CpuPlatform::new(), AssignmentPolicy::Pinned(0))?;
            Ok(Self { inner: pool.create_instance(&config, policy)? })
        }

        /// Dense partials, shape (pattern_count, state_count).
        fn set_partials(&mut self, index: usize, partials: PyReadonlyArray2<f64>) -> PyResult<()> {
            let flat: Vec<f64> = partials.as_array().iter().copied().collect();
            Ok(self.inner.set_partials(index, &flat)?)
        }

        fn set_tip_states(&mut self, tip: usize, states: PyReadonlyArray1<i32>) -> PyResult<()> {
            Ok(self.inner.set_tip_states(tip, &states.as_array().to_vec())?)
        }

        fn set_eigen_decomposition(
            &mut self,
            index: usize,
            eigenvectors: PyReadonlyArray2<f64>,
            inverse_eigenvectors: PyReadonlyArray2<f64>,
            eigenvalues: PyReadonlyArray1<f64>,
        ) -> PyResult<()> {
            let model = eigen_system(eigenvectors, inverse_eigenvectors, eigenvalues);
            Ok(self.inner.set_eigen_decomposition(
                index,
                &model.eigenvectors,
                &model.inverse_eigenvectors,
                &model.eigenvalues,
            )?)
        }

        fn set_category_rates(&mut self, rates: Vec<f64>) -> PyResult<()> {
            Ok(self.inner.set_category_rates(&rates)?)
        }

        fn update_transition_matrices(
            &mut self,
            eigen_index: usize,
            matrix_indices: Vec<usize>,
            edge_lengths: PyReadonlyArray1<f64>,
        ) -> PyResult<()> {
            let lengths = edge_lengths.as_array().to_vec();
            Ok(self.inner.update_transition_matrices(eigen_index, &matrix_indices, &lengths)?)
        }

        /// Flat `[dest, child1, matrix1, child2, matrix2, ...]` operations.
        #[pyo3(signature = (operations, rescale=false))]
        fn update_partials(&mut self, operations: PyReadonlyArray1<i32>, rescale: bool) -> PyResult<()> {
            let ops = Operation::from_flat(&operations.as_array().to_vec())?;
            Ok(self.inner.update_partials(&ops, rescale)?)
        }

        fn wait_for_partials(&self, indices: Vec<usize>) -> PyResult<()> {
            Ok(self.inner.wait_for_partials(&indices)?)
        }

        fn calculate_root_log_likelihoods<'py>(
            &mut self,
            py: Python<'py>,
            roots: Vec<usize>,
            weights: Vec<f64>,
            frequencies: PyReadonlyArray1<f64>,
        ) -> PyResult<&'py PyArray1<f64>> {
            let freqs = frequencies.as_array().to_vec();
            let out = self.inner.calculate_root_log_likelihoods(&roots, &weights, &freqs)?;
            Ok(PyArray1::from_vec(py, out))
        }

        fn transition_matrix<'py>(&self, py: Python<'py>, index: usize) -> PyResult<&'py PyArray2<f64>> {
            let s = self.inner.config().state_count;
            let matrix = Array2::from_shape_vec((s, s), self.inner.transition_matrix(index)?)
                .map_err(|e| PyValueError::new_err(e.to_string()))?;
            Ok(PyArray2::from_owned_array(py, matrix))
        }

        fn scaling_factors<'py>(&self, py: Python<'py>, node: usize) -> PyResult<&'py PyArray1<f64>> {
            Ok(PyArray1::from_vec(py, self.inner.scaling_factors(node)?))
        }

        fn rescale_stats<'py>(&self, py: Python<'py>) -> PyResult<&'py PyDict> {
            let stats = self.inner.rescale_stats();
            let dict = PyDict::new(py);
            dict.set_item("passes", stats.passes)?;
            dict.set_item("rescaled_operations", stats.rescaled_operations)?;
            dict.set_item("applied_operations", stats.applied_operations)?;
            dict.set_item("root_reductions", stats.root_reductions)?;
            Ok(dict)
        }

        #[getter]
        fn device_name(&self) -> String {
            self.inner.device_info().name.clone()
        }

        #[getter]
        fn bytes_in_use(&self) -> u64 {
            self.inner.memory_usage().bytes_in_use
        }
    }

    /// Per-site log-likelihoods of a rooted binary tree.
    ///
    /// # Arguments
    /// * `parent_indices` - Parent index for each node (-1 for root), tips first
    /// * `branch_lengths` - Length of the edge above each node
    /// * `tip_states` - (n_tips, n_patterns) observed state indices
    /// * `eigenvectors`, `inverse_eigenvectors`, `eigenvalues` - Rate matrix eigensystem
    /// * `frequencies` - Equilibrium state frequencies
    ///
    /// # Returns
    /// * Vector of log-likelihoods, one per pattern
    #[pyfunction]
    #[pyo3(signature = (
        parent_indices,
        branch_lengths,
        tip_states,
        eigenvectors,
        inverse_eigenvectors,
        eigenvalues,
        frequencies,
        precision="double",
    ))]
    #[allow(clippy::too_many_arguments)]
    fn compute_site_log_likelihoods<'py>(
        py: Python<'py>,
        parent_indices: PyReadonlyArray1<i32>,
        branch_lengths: PyReadonlyArray1<f64>,
        tip_states: PyReadonlyArray2<i32>,
        eigenvectors: PyReadonlyArray2<f64>,
        inverse_eigenvectors: PyReadonlyArray2<f64>,
        eigenvalues: PyReadonlyArray1<f64>,
        frequencies: PyReadonlyArray1<f64>,
        precision: &str,
    ) -> PyResult<&'py PyArray1<f64>> {
        let states = tip_states.as_array();
        let tree = Tree::from_structure(
            parent_indices.as_array().to_vec(),
            branch_lengths.as_array().to_vec(),
            states.nrows(),
        )?;
        let rows: Vec<Vec<i32>> = states.rows().into_iter().map(|row| row.to_vec()).collect();
        let model = eigen_system(eigenvectors, inverse_eigenvectors, eigenvalues);
        let freqs = frequencies.as_array().to_vec();
        let policy = EnginePolicy::with_precision(precision.parse()?);

        let pool = DevicePool::new(CpuPlatform::new(), AssignmentPolicy::RoundRobin)?;
        let out = tree.site_log_likelihoods(&pool, policy, &model, &freqs, &rows)?;
        Ok(PyArray1::from_vec(py, out))
    }

    /// Python module definition
    #[pymodule]
    fn phylo_accel(_py: Python, m: &PyModule) -> PyResult<()> {
        m.add_class::<PyLikelihoodInstance>()?;
        m.add_function(wrap_pyfunction!(compute_site_log_likelihoods, m)?)?;
        Ok(())
    }
}
