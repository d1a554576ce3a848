//! One likelihood session bound to one device.
//!
//! A [`LikelihoodInstance`] is created through
//! [`DevicePool::create_instance`](crate::device::DevicePool::create_instance),
//! owns every buffer it uses, and releases them when dropped. Calls on one
//! instance are expected from a single control thread; separate instances
//! share nothing and may run concurrently.

use crate::backend::Backend;
use crate::config::{Dimensions, EnginePolicy, InstanceConfig};
use crate::cpu::{CpuDevice, MemoryUsage};
use crate::device::{DeviceId, DeviceInfo, DeviceLease};
use crate::error::{BufferKind, Error, Result};
use crate::integrate::{self, RootRequest};
use crate::pruning::{self, Operation, PassScaling, RescaleController, RescaleStats};
use crate::registry::{self, BufferRegistry, NodeData};
use crate::staging::StagingArea;

/// Engine session over backend `B`.
pub struct LikelihoodInstance<B: Backend> {
    config: InstanceConfig,
    dims: Dimensions,
    policy: EnginePolicy,
    device: DeviceInfo,
    // Buffers are dropped before the backend that allocated them.
    registry: BufferRegistry<B>,
    backend: B,
    lease: DeviceLease,
    staging: StagingArea,
    rescale: RescaleController,
    category_rate: f64,
}

impl<B: Backend> LikelihoodInstance<B> {
    /// Bytes of device memory an instance of this shape allocates.
    pub fn memory_requirement(config: &InstanceConfig, policy: EnginePolicy) -> Result<u64> {
        let dims = Dimensions::from_config(config)?;
        Ok(registry::memory_requirement(&dims, policy.precision, policy.rescaling))
    }

    pub(crate) fn bind(
        lease: DeviceLease,
        device: DeviceInfo,
        mut backend: B,
        config: &InstanceConfig,
        policy: EnginePolicy,
    ) -> Result<Self> {
        let dims = Dimensions::from_config(config)?;
        let required = registry::memory_requirement(&dims, policy.precision, policy.rescaling);
        tracing::info!(
            device = lease.device_id(),
            bytes = required,
            padded_states = dims.padded_state_count,
            padded_patterns = dims.padded_pattern_count,
            "instance memory requirement"
        );
        if required > device.global_memory_bytes {
            return Err(Error::OutOfMemory { requested: required, available: device.global_memory_bytes });
        }

        let registry = BufferRegistry::allocate(&mut backend, dims, policy.rescaling)?;
        Ok(Self {
            config: config.clone(),
            dims,
            policy,
            device,
            registry,
            backend,
            lease,
            staging: StagingArea::new(dims),
            rescale: RescaleController::new(policy.rescaling),
            category_rate: 1.0,
        })
    }

    /// Shape requested at creation.
    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    /// Padded shape the kernels run on.
    pub fn dimensions(&self) -> &Dimensions {
        &self.dims
    }

    /// Precision and rescaling strategy.
    pub fn policy(&self) -> EnginePolicy {
        self.policy
    }

    /// Device the instance is bound to.
    pub fn device_id(&self) -> DeviceId {
        self.lease.device_id()
    }

    /// Description of the bound device.
    pub fn device_info(&self) -> &DeviceInfo {
        &self.device
    }

    /// Set dense partials for any node, `[pattern][state]` over true counts.
    ///
    /// For a tip this fixes its representation to partials. For an internal
    /// node its scaling factors are reset to 1.
    pub fn set_partials(&mut self, index: usize, partials: &[f64]) -> Result<()> {
        let staged = self.staging.stage_partials(partials)?;
        let buffer = self.registry.bind_partials(index)?;
        self.backend.write_real(buffer, staged)?;
        if index >= self.dims.tip_count {
            self.registry.reset_scaling(&mut self.backend, index)?;
            self.rescale.invalidate_root();
        }
        self.registry.mark(index, NodeData::Caller);
        Ok(())
    }

    /// Set observed states for a tip, one per pattern.
    ///
    /// States outside `0..state_count` are treated as fully ambiguous.
    pub fn set_tip_states(&mut self, tip: usize, states: &[i32]) -> Result<()> {
        let staged = self.staging.stage_tip_states(states)?;
        let buffer = self.registry.bind_tip_states(tip)?;
        self.backend.write_int(buffer, staged)?;
        self.registry.mark(tip, NodeData::Caller);
        Ok(())
    }

    /// Replace the eigensystem of model `index` (row-major, true state count).
    ///
    /// Transition matrices already computed from the old system keep their
    /// values until recomputed.
    pub fn set_eigen_decomposition(
        &mut self,
        index: usize,
        eigenvectors: &[f64],
        inverse_eigenvectors: &[f64],
        eigenvalues: &[f64],
    ) -> Result<()> {
        // Range check before staging so a bad index leaves the cache untouched.
        self.registry.eigen.get(index)?;
        let staged = self.staging.stage_eigen(eigenvectors, inverse_eigenvectors, eigenvalues)?;
        let eigen = self.registry.eigen.get_mut(index)?;
        self.backend.write_real(&mut eigen.evec, staged.evec)?;
        self.backend.write_real(&mut eigen.ievc, staged.ievc)?;
        self.backend.write_real(&mut eigen.evals, staged.evals)?;
        self.registry.mark_eigen_loaded(index);
        Ok(())
    }

    /// Set the among-site rate categories. Only a single category is
    /// supported; its rate multiplies every edge length.
    pub fn set_category_rates(&mut self, rates: &[f64]) -> Result<()> {
        match rates {
            [rate] if rate.is_finite() && *rate > 0.0 => {
                self.category_rate = *rate;
                Ok(())
            }
            [rate] => Err(Error::InvalidArgument(format!(
                "category rate must be finite and positive, got {rate}"
            ))),
            [] => Err(Error::LengthMismatch { what: "category rates", expected: 1, actual: 0 }),
            _ => Err(Error::NotSupported("multiple rate categories")),
        }
    }

    /// Compute `P(t)` for every `(matrix_indices[n], edge_lengths[n])` pair
    /// from model `eigen_index`, in one batch.
    ///
    /// `P(t) = E · diag(exp(λ · r · t)) · E⁻¹`, where `r` is the category rate.
    ///
    /// # Arguments
    /// * `eigen_index` - Eigensystem slot, loaded by `set_eigen_decomposition`
    /// * `matrix_indices` - Destination matrix slots, each at most once
    /// * `edge_lengths` - Finite, non-negative edge length per destination
    ///
    /// # Returns
    /// `Ok(())` once every matrix is written; on an argument error nothing is.
    pub fn update_transition_matrices(
        &mut self,
        eigen_index: usize,
        matrix_indices: &[usize],
        edge_lengths: &[f64],
    ) -> Result<()> {
        Error::check_len("edge lengths", matrix_indices.len(), edge_lengths.len())?;
        let mut seen = vec![false; self.dims.matrix_count];
        for &index in matrix_indices {
            match seen.get_mut(index) {
                None => {
                    return Err(Error::out_of_range(BufferKind::Matrix, index, self.dims.matrix_count))
                }
                Some(true) => {
                    return Err(Error::InvalidArgument(format!(
                        "transition matrix {index} appears twice in one batch"
                    )))
                }
                Some(flag) => *flag = true,
            }
        }
        if let Some(t) = edge_lengths.iter().find(|t| !t.is_finite() || **t < 0.0) {
            return Err(Error::InvalidArgument(format!(
                "edge length must be finite and non-negative, got {t}"
            )));
        }
        self.registry.loaded_eigen(eigen_index)?;
        if matrix_indices.is_empty() {
            return Ok(());
        }

        let mut taken = Vec::with_capacity(matrix_indices.len());
        for &index in matrix_indices {
            match self.registry.matrices.current.take(index) {
                Ok(matrix) => taken.push(matrix),
                Err(e) => {
                    for (&index, matrix) in matrix_indices.iter().zip(taken) {
                        self.registry.matrices.current.restore(index, matrix);
                    }
                    return Err(e);
                }
            }
        }

        let lengths: Vec<f64> = edge_lengths.iter().map(|t| t * self.category_rate).collect();
        let result = match self.registry.loaded_eigen(eigen_index) {
            Ok(eigen) => {
                let mut out: Vec<&mut B::RealBuffer> = taken.iter_mut().collect();
                self.backend.transition_matrices(
                    eigen,
                    &lengths,
                    &mut out,
                    self.dims.padded_state_count,
                )
            }
            Err(e) => Err(e),
        };
        for (&index, matrix) in matrix_indices.iter().zip(taken) {
            self.registry.matrices.current.restore(index, matrix);
        }
        result?;
        for &index in matrix_indices {
            self.registry.mark_matrix_loaded(index);
        }
        Ok(())
    }

    /// Not supported: matrices are only produced from an eigensystem.
    pub fn set_transition_matrix(&mut self, _index: usize, _matrix: &[f64]) -> Result<()> {
        Err(Error::NotSupported("setting transition matrices directly"))
    }

    /// Run pruning operations in the given (post-) order.
    ///
    /// For each operation:
    /// `L[dest, s] = (Σ_x P1[s, x] · L[child1, x]) · (Σ_x P2[s, x] · L[child2, x])`
    ///
    /// # Arguments
    /// * `operations` - Operations in dependency order, children first
    /// * `rescale` - Ask for fresh scaling factors; the first pass of an
    ///   instance computes them regardless
    ///
    /// # Returns
    /// `Ok(())` when every destination holds its new partials. A failure part
    /// way through leaves earlier destinations overwritten.
    pub fn update_partials(&mut self, operations: &[Operation], rescale: bool) -> Result<()> {
        let pass = self.rescale.begin_pass(rescale);
        if pass == PassScaling::Compute {
            tracing::debug!(requested = rescale, "computing fresh scaling factors");
        }
        pruning::execute(&mut self.backend, &mut self.registry, operations, pass, &mut self.rescale)
    }

    /// [`update_partials`](Self::update_partials) over the flat 5-tuple encoding.
    pub fn update_partials_flat(&mut self, operations: &[i32], rescale: bool) -> Result<()> {
        let operations = Operation::from_flat(operations)?;
        self.update_partials(&operations, rescale)
    }

    /// Block until the listed partials are final.
    ///
    /// Kernels run synchronously, so this only checks the indices.
    pub fn wait_for_partials(&self, indices: &[usize]) -> Result<()> {
        for &index in indices {
            self.registry.provenance(index)?;
        }
        Ok(())
    }

    /// Not supported: partials stay on the device.
    pub fn get_partials(&self, _index: usize) -> Result<Vec<f64>> {
        Err(Error::NotSupported("partials readback"))
    }

    /// Per-pattern log-likelihoods at one root.
    ///
    /// # Arguments
    /// * `roots` - Root buffer index; exactly one
    /// * `weights` - Rate-category weights; exactly one
    /// * `frequencies` - Equilibrium state frequencies, `state_count` long
    ///
    /// # Returns
    /// `ln L[p]` for every true pattern, with the scaling factors divided out
    /// during pruning added back.
    pub fn calculate_root_log_likelihoods(
        &mut self,
        roots: &[usize],
        weights: &[f64],
        frequencies: &[f64],
    ) -> Result<Vec<f64>> {
        integrate::integrate(
            &mut self.backend,
            &mut self.registry,
            &mut self.staging,
            &mut self.rescale,
            RootRequest { roots, weights, frequencies },
        )
    }

    /// Not supported: edge likelihoods and their derivatives.
    pub fn calculate_edge_log_likelihoods(
        &mut self,
        _parent: usize,
        _child: usize,
        _matrix: usize,
        _weights: &[f64],
        _frequencies: &[f64],
    ) -> Result<Vec<f64>> {
        Err(Error::NotSupported("edge log-likelihoods"))
    }

    /// Transition matrix `index`, true states only, row-major by parent state.
    pub fn transition_matrix(&self, index: usize) -> Result<Vec<f64>> {
        let (s, p) = (self.dims.state_count, self.dims.padded_state_count);
        let matrix = self.registry.loaded_matrix(index)?;
        let mut padded = vec![0.0; p * p];
        self.backend.read_real(matrix, &mut padded)?;
        Ok(padded.chunks_exact(p).take(s).flat_map(|row| row[..s].iter().copied()).collect())
    }

    /// Linear scaling factors of internal node `node`, one per true pattern.
    pub fn scaling_factors(&self, node: usize) -> Result<Vec<f64>> {
        let scaling = self.registry.scaling.as_ref().ok_or_else(|| {
            Error::InvalidArgument("instance was created without rescaling".into())
        })?;
        let factors = scaling.nodes.current.get(node)?;
        let mut out = vec![0.0; self.dims.pattern_count];
        self.backend.read_real(factors, &mut out)?;
        Ok(out)
    }

    /// Rescaling counters.
    pub fn rescale_stats(&self) -> RescaleStats {
        self.rescale.stats()
    }

    /// True when the next root integration rebuilds the root scaling aggregate.
    pub fn rescaling_pending(&self) -> bool {
        self.rescale.is_pending()
    }
}

impl LikelihoodInstance<CpuDevice> {
    /// Memory in use on the bound CPU device, across all its instances.
    pub fn memory_usage(&self) -> MemoryUsage {
        self.backend.memory_usage()
    }
}

impl<B: Backend> Drop for LikelihoodInstance<B> {
    fn drop(&mut self) {
        tracing::debug!(device = self.lease.device_id(), "releasing likelihood instance");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Precision, RescalingStrategy};
    use crate::cpu::CpuPlatform;
    use crate::device::{AssignmentPolicy, DevicePool};
    use crate::error::ResultCode;
    use crate::staging::{encode_nucleotides, nucleotide_partials, EigenSystem};
    use crate::tree::Tree;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn pool() -> DevicePool<CpuPlatform> {
        DevicePool::new(CpuPlatform::new(), AssignmentPolicy::RoundRobin).unwrap()
    }

    fn policy(precision: Precision, rescaling: RescalingStrategy) -> EnginePolicy {
        EnginePolicy { precision, rescaling }
    }

    fn two_taxon_config(pattern_count: usize) -> InstanceConfig {
        InstanceConfig {
            tip_count: 2,
            partials_buffer_count: 1,
            compact_buffer_count: 2,
            state_count: 2,
            pattern_count,
            eigen_count: 1,
            matrix_count: 2,
        }
    }

    fn set_model(instance: &mut LikelihoodInstance<CpuDevice>, model: &EigenSystem) {
        instance
            .set_eigen_decomposition(
                0,
                &model.eigenvectors,
                &model.inverse_eigenvectors,
                &model.eigenvalues,
            )
            .unwrap();
    }

    fn cherry() -> Operation {
        Operation { destination: 2, child1: 0, child1_matrix: 0, child2: 1, child2_matrix: 1 }
    }

    /// Two tips under the binary symmetric model.
    fn two_taxon(
        pool: &DevicePool<CpuPlatform>,
        policy: EnginePolicy,
        a: &[i32],
        b: &[i32],
        lengths: [f64; 2],
    ) -> Vec<f64> {
        let mut inst = pool.create_instance(&two_taxon_config(a.len()), policy).unwrap();
        set_model(&mut inst, &EigenSystem::binary_symmetric());
        inst.set_tip_states(0, a).unwrap();
        inst.set_tip_states(1, b).unwrap();
        inst.update_transition_matrices(0, &[0, 1], &lengths).unwrap();
        inst.update_partials(&[cherry()], false).unwrap();
        inst.calculate_root_log_likelihoods(&[2], &[1.0], &[0.5, 0.5]).unwrap()
    }

    #[test]
    fn two_taxon_closed_form() {
        let pool = pool();
        let (t1, t2) = (0.2, 0.3);
        let e = (-2.0_f64 * (t1 + t2)).exp();
        let same = (0.25 * (1.0 + e)).ln();
        let diff = (0.25 * (1.0 - e)).ln();

        for rescaling in [RescalingStrategy::Dynamic, RescalingStrategy::None] {
            let out = two_taxon(
                &pool,
                policy(Precision::Double, rescaling),
                &[0, 0, 1],
                &[1, 0, 1],
                [t1, t2],
            );
            assert_eq!(out.len(), 3);
            assert_relative_eq!(out[0], diff, epsilon = 1e-12);
            assert_relative_eq!(out[1], same, epsilon = 1e-12);
            assert_relative_eq!(out[2], same, epsilon = 1e-12);
        }
    }

    #[test]
    fn ambiguous_tip_state_marginalises() {
        let pool = pool();
        // State 7 is out of range for a 2-state model: that tip contributes 1.
        let out = two_taxon(&pool, EnginePolicy::default(), &[0, 7], &[1, 1], [0.1, 0.4]);
        assert_relative_eq!(out[1], 0.5_f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn states_and_partials_agree() {
        let pool = pool();
        let cfg = InstanceConfig { compact_buffer_count: 1, partials_buffer_count: 2, ..two_taxon_config(3) };
        let mut inst = pool.create_instance(&cfg, EnginePolicy::default()).unwrap();
        set_model(&mut inst, &EigenSystem::binary_symmetric());
        // Tip 0 as partials, tip 1 as states: the kernel receives them swapped.
        inst.set_partials(0, &[1.0, 0.0, 1.0, 1.0, 0.0, 1.0]).unwrap();
        inst.set_tip_states(1, &[1, 0, 1]).unwrap();
        inst.update_transition_matrices(0, &[0, 1], &[0.2, 0.3]).unwrap();
        inst.update_partials(&[cherry()], false).unwrap();
        let mixed = inst.calculate_root_log_likelihoods(&[2], &[1.0], &[0.5, 0.5]).unwrap();

        let states = two_taxon(&pool, EnginePolicy::default(), &[0, -1, 1], &[1, 0, 1], [0.2, 0.3]);
        for (a, b) in mixed.iter().zip(&states) {
            assert_relative_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn output_is_true_pattern_count() {
        let pool = pool();
        let out = two_taxon(&pool, EnginePolicy::default(), &[0, 1, 1, 0, 1], &[0, 0, 1, 1, 1], [0.5, 0.5]);
        assert_eq!(out.len(), 5);
        assert!(out.iter().all(|v| v.is_finite() && *v < 0.0));
    }

    /// Caterpillar over `n` tips: tips `0..n`, internal nodes `n..2n-1`,
    /// the edge above node `k` uses matrix `k`.
    fn caterpillar(n: usize) -> (InstanceConfig, Vec<Operation>) {
        let config = InstanceConfig {
            tip_count: n,
            partials_buffer_count: n - 1,
            compact_buffer_count: n,
            state_count: 4,
            pattern_count: 7,
            eigen_count: 1,
            matrix_count: 2 * n - 1,
        };
        let mut ops = vec![Operation { destination: n, child1: 0, child1_matrix: 0, child2: 1, child2_matrix: 1 }];
        for k in 1..n - 1 {
            let below = n + k - 1;
            ops.push(Operation {
                destination: n + k,
                child1: below,
                child1_matrix: below,
                child2: k + 1,
                child2_matrix: k + 1,
            });
        }
        (config, ops)
    }

    fn jc_caterpillar(
        pool: &DevicePool<CpuPlatform>,
        policy: EnginePolicy,
        n: usize,
        seed: u64,
    ) -> (LikelihoodInstance<CpuDevice>, Vec<Operation>, usize) {
        let (config, ops) = caterpillar(n);
        let mut inst = pool.create_instance(&config, policy).unwrap();
        set_model(&mut inst, &EigenSystem::jukes_cantor());
        let mut rng = StdRng::seed_from_u64(seed);
        for tip in 0..n {
            let states: Vec<i32> = (0..config.pattern_count).map(|_| rng.gen_range(0..4)).collect();
            inst.set_tip_states(tip, &states).unwrap();
        }
        let matrices: Vec<usize> = (0..config.matrix_count).collect();
        let lengths: Vec<f64> = matrices.iter().map(|_| rng.gen_range(0.05..0.6)).collect();
        inst.update_transition_matrices(0, &matrices, &lengths).unwrap();
        let root = ops.last().map(|op| op.destination).unwrap();
        (inst, ops, root)
    }

    const UNIFORM: [f64; 4] = [0.25; 4];

    #[test]
    fn rescaling_does_not_change_likelihoods() {
        let pool = pool();
        let mut results = Vec::new();
        for rescaling in [RescalingStrategy::Dynamic, RescalingStrategy::None] {
            let (mut inst, ops, root) =
                jc_caterpillar(&pool, policy(Precision::Double, rescaling), 60, 7);
            inst.update_partials(&ops, true).unwrap();
            results.push(inst.calculate_root_log_likelihoods(&[root], &[1.0], &UNIFORM).unwrap());
        }
        for (a, b) in results[0].iter().zip(&results[1]) {
            assert!(a.is_finite());
            assert_relative_eq!(a, b, max_relative = 1e-10);
        }
    }

    #[test]
    fn rescaling_rescues_single_precision() {
        let pool = pool();
        let run = |policy| {
            let (mut inst, ops, root) = jc_caterpillar(&pool, policy, 120, 11);
            inst.update_partials(&ops, false).unwrap();
            inst.calculate_root_log_likelihoods(&[root], &[1.0], &UNIFORM).unwrap()
        };
        let reference = run(policy(Precision::Double, RescalingStrategy::Dynamic));
        let scaled = run(policy(Precision::Single, RescalingStrategy::Dynamic));
        let unscaled = run(policy(Precision::Single, RescalingStrategy::None));

        assert!(unscaled.iter().any(|v| !v.is_finite()));
        for (s, r) in scaled.iter().zip(&reference) {
            assert!(s.is_finite());
            assert_relative_eq!(s, r, max_relative = 1e-4);
        }
    }

    #[test]
    fn first_pass_rescales_then_only_on_request() {
        let pool = pool();
        let (mut inst, ops, root) =
            jc_caterpillar(&pool, policy(Precision::Double, RescalingStrategy::Dynamic), 8, 3);
        let n_ops = ops.len() as u64;
        assert!(inst.rescaling_pending());

        inst.update_partials(&ops, false).unwrap();
        assert_eq!(inst.rescale_stats().rescaled_operations, n_ops);
        let first = inst.calculate_root_log_likelihoods(&[root], &[1.0], &UNIFORM).unwrap();
        assert!(!inst.rescaling_pending());
        assert!(inst.scaling_factors(root).unwrap().iter().all(|&f| f > 0.0 && f <= 1.0));

        // New edge lengths, stored factors reused: still exact.
        let matrices: Vec<usize> = (0..inst.config().matrix_count).collect();
        let lengths = vec![0.3; matrices.len()];
        inst.update_transition_matrices(0, &matrices, &lengths).unwrap();
        inst.update_partials(&ops, false).unwrap();
        let stats = inst.rescale_stats();
        assert_eq!((stats.rescaled_operations, stats.applied_operations), (n_ops, n_ops));
        let reused = inst.calculate_root_log_likelihoods(&[root], &[1.0], &UNIFORM).unwrap();
        assert_eq!(inst.rescale_stats().root_reductions, 1);

        inst.update_partials(&ops, true).unwrap();
        assert!(inst.rescaling_pending());
        let fresh = inst.calculate_root_log_likelihoods(&[root], &[1.0], &UNIFORM).unwrap();
        assert_eq!(inst.rescale_stats().root_reductions, 2);
        for (a, b) in reused.iter().zip(&fresh) {
            assert_relative_eq!(a, b, max_relative = 1e-12);
        }
        assert!(first.iter().zip(&fresh).any(|(a, b)| (a - b).abs() > 1e-6));
    }

    #[test]
    fn matrices_are_row_stochastic() {
        let pool = pool();
        let cfg = InstanceConfig { state_count: 4, ..two_taxon_config(4) };
        let mut inst = pool.create_instance(&cfg, EnginePolicy::default()).unwrap();
        set_model(&mut inst, &EigenSystem::jukes_cantor());
        inst.update_transition_matrices(0, &[0, 1], &[0.0, 0.7]).unwrap();

        let identity = inst.transition_matrix(0).unwrap();
        let m = inst.transition_matrix(1).unwrap();
        assert_eq!(m.len(), 16);
        for i in 0..4 {
            for j in 0..4 {
                assert_relative_eq!(identity[i * 4 + j], if i == j { 1.0 } else { 0.0 }, epsilon = 1e-12);
            }
            assert_relative_eq!(m[i * 4..(i + 1) * 4].iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        }
        assert_relative_eq!(m[0], 0.25 + 0.75 * (-4.0_f64 * 0.7 / 3.0).exp(), epsilon = 1e-12);
    }

    #[test]
    fn category_rate_scales_edges() {
        let pool = pool();
        let mut inst = pool.create_instance(&two_taxon_config(2), EnginePolicy::default()).unwrap();
        set_model(&mut inst, &EigenSystem::binary_symmetric());
        inst.update_transition_matrices(0, &[0], &[0.4]).unwrap();
        inst.set_category_rates(&[2.0]).unwrap();
        inst.update_transition_matrices(0, &[1], &[0.2]).unwrap();
        assert_eq!(inst.transition_matrix(0).unwrap(), inst.transition_matrix(1).unwrap());

        assert_eq!(inst.set_category_rates(&[1.0, 2.0]).unwrap_err().code(), ResultCode::NotSupported);
        assert!(inst.set_category_rates(&[0.0]).is_err());
        assert!(inst.set_category_rates(&[]).is_err());
    }

    #[test]
    fn eigen_reset_is_idempotent() {
        let pool = pool();
        let cfg = InstanceConfig { state_count: 4, ..two_taxon_config(4) };
        let mut inst = pool.create_instance(&cfg, EnginePolicy::default()).unwrap();
        let jc = EigenSystem::jukes_cantor();
        set_model(&mut inst, &jc);
        inst.update_transition_matrices(0, &[0], &[0.37]).unwrap();
        let before = inst.transition_matrix(0).unwrap();

        let mut other = jc.clone();
        other.eigenvalues = vec![0.0, -1.0, -2.0, -3.0];
        set_model(&mut inst, &other);
        inst.update_transition_matrices(0, &[0], &[0.37]).unwrap();
        assert_ne!(inst.transition_matrix(0).unwrap(), before);

        set_model(&mut inst, &jc);
        set_model(&mut inst, &jc);
        inst.update_transition_matrices(0, &[0], &[0.37]).unwrap();
        assert_eq!(inst.transition_matrix(0).unwrap(), before);
    }

    #[test]
    fn bad_indices_are_checked() {
        let pool = pool();
        let mut inst = pool.create_instance(&two_taxon_config(3), EnginePolicy::default()).unwrap();

        let err = inst.set_partials(3, &[0.5; 6]).unwrap_err();
        assert_eq!(err.code(), ResultCode::OutOfRange);
        assert!(matches!(inst.set_tip_states(2, &[0, 1, 0]), Err(Error::IndexOutOfRange { .. })));
        assert!(matches!(
            inst.set_tip_states(0, &[0, 1]),
            Err(Error::LengthMismatch { expected: 3, actual: 2, .. })
        ));
        assert!(matches!(
            inst.update_transition_matrices(0, &[0], &[0.1]),
            Err(Error::BufferUnset { kind: BufferKind::Eigen, .. })
        ));

        set_model(&mut inst, &EigenSystem::binary_symmetric());
        assert!(matches!(
            inst.update_transition_matrices(0, &[2], &[0.1]),
            Err(Error::IndexOutOfRange { kind: BufferKind::Matrix, .. })
        ));
        assert!(inst.update_transition_matrices(0, &[0, 0], &[0.1, 0.2]).is_err());
        assert!(inst.update_transition_matrices(0, &[0, 1], &[0.1]).is_err());
        assert!(inst.update_transition_matrices(0, &[0], &[-0.1]).is_err());
        assert!(inst.set_eigen_decomposition(1, &[1.0; 4], &[1.0; 4], &[0.0; 2]).is_err());

        // Children without data.
        inst.update_transition_matrices(0, &[0, 1], &[0.1, 0.2]).unwrap();
        assert!(matches!(
            inst.update_partials(&[cherry()], false),
            Err(Error::BufferUnset { kind: BufferKind::Partials, index: 0 })
        ));
        assert!(inst.update_partials_flat(&[2, 0, 0, 1], false).is_err());
        assert!(inst.calculate_root_log_likelihoods(&[2], &[1.0], &[0.5, 0.5]).is_err());
        assert!(inst.wait_for_partials(&[0, 2]).is_ok());
        assert!(inst.wait_for_partials(&[3]).is_err());
    }

    #[test]
    fn unsupported_calls_report_not_supported() {
        let pool = pool();
        let mut inst = pool.create_instance(&two_taxon_config(2), EnginePolicy::default()).unwrap();
        let code = |r: Result<Vec<f64>>| r.unwrap_err().code();
        assert_eq!(code(inst.get_partials(2)), ResultCode::NotSupported);
        assert_eq!(code(inst.calculate_edge_log_likelihoods(2, 0, 0, &[1.0], &[0.5, 0.5])), ResultCode::NotSupported);
        assert_eq!(code(inst.calculate_root_log_likelihoods(&[2, 2], &[1.0], &[0.5, 0.5])), ResultCode::NotSupported);
        assert_eq!(code(inst.calculate_root_log_likelihoods(&[2], &[0.5, 0.5], &[0.5, 0.5])), ResultCode::NotSupported);
        assert_eq!(
            inst.set_transition_matrix(0, &[1.0, 0.0, 0.0, 1.0]).unwrap_err().code(),
            ResultCode::NotSupported
        );
    }

    #[test]
    fn creation_is_all_or_nothing() {
        let cfg = two_taxon_config(16);
        let need = LikelihoodInstance::<CpuDevice>::memory_requirement(&cfg, EnginePolicy::default()).unwrap();
        let pool = DevicePool::new(
            CpuPlatform::new().with_memory_limit(need - 1),
            AssignmentPolicy::RoundRobin,
        )
        .unwrap();
        let err = pool.create_instance(&cfg, EnginePolicy::default()).err().unwrap();
        assert!(matches!(err, Error::OutOfMemory { requested, .. } if requested == need));
        assert_eq!(err.code(), ResultCode::OutOfMemory);
        assert_eq!(pool.platform().memory_usage(0).unwrap().live_buffers, 0);
        assert_eq!(pool.loads(), vec![0]);

        // A single-precision instance of the same shape fits.
        let single = EnginePolicy::with_precision(Precision::Single);
        assert!(pool.create_instance(&cfg, single).is_ok());
    }

    #[test]
    fn buffers_released_exactly_once() {
        let pool = pool();
        let mut inst = pool.create_instance(&two_taxon_config(4), EnginePolicy::default()).unwrap();
        let usage = inst.memory_usage();
        assert!(usage.live_buffers > 0);

        // Binding a tip to states frees its partials buffer right away.
        inst.set_tip_states(0, &[0, 1, 0, 1]).unwrap();
        assert_eq!(inst.memory_usage().live_buffers, usage.live_buffers - 1);

        drop(inst);
        let after = pool.platform().memory_usage(0).unwrap();
        assert_eq!(after.live_buffers, 0);
        assert_eq!(after.bytes_in_use, 0);
        assert_eq!(after.total_allocations, usage.total_allocations);
        assert_eq!(pool.loads(), vec![0]);
    }

    #[test]
    fn instances_run_concurrently() {
        let pool = DevicePool::new(CpuPlatform::with_devices(2), AssignmentPolicy::LeastLoaded).unwrap();
        let expected = two_taxon(&pool, EnginePolicy::default(), &[0, 1, 1], &[1, 1, 0], [0.3, 0.1]);

        let results: Vec<(DeviceId, Vec<f64>)> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        let mut inst = pool.create_instance(&two_taxon_config(3), EnginePolicy::default()).unwrap();
                        set_model(&mut inst, &EigenSystem::binary_symmetric());
                        inst.set_tip_states(0, &[0, 1, 1]).unwrap();
                        inst.set_tip_states(1, &[1, 1, 0]).unwrap();
                        inst.update_transition_matrices(0, &[0, 1], &[0.3, 0.1]).unwrap();
                        inst.update_partials(&[cherry()], false).unwrap();
                        let out = inst.calculate_root_log_likelihoods(&[2], &[1.0], &[0.5, 0.5]).unwrap();
                        (inst.device_id(), out)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for (device, out) in &results {
            assert!(*device < 2);
            assert_eq!(out, &expected);
        }
        assert_eq!(pool.loads(), vec![0, 0]);
    }

    #[test]
    fn internal_partials_reset_scaling() {
        let pool = pool();
        let mut inst = pool.create_instance(&two_taxon_config(2), EnginePolicy::default()).unwrap();
        set_model(&mut inst, &EigenSystem::binary_symmetric());
        inst.set_tip_states(0, &[0, 1]).unwrap();
        inst.set_tip_states(1, &[0, 0]).unwrap();
        inst.update_transition_matrices(0, &[0, 1], &[0.4, 0.4]).unwrap();
        inst.update_partials(&[cherry()], false).unwrap();
        assert!(inst.scaling_factors(2).unwrap().iter().all(|&f| f < 1.0));

        inst.set_partials(2, &[0.5, 0.5, 0.25, 0.75]).unwrap();
        assert_eq!(inst.scaling_factors(2).unwrap(), vec![1.0, 1.0]);
        let out = inst.calculate_root_log_likelihoods(&[2], &[1.0], &[0.5, 0.5]).unwrap();
        assert_relative_eq!(out[0], 0.5_f64.ln(), epsilon = 1e-12);
        assert_relative_eq!(out[1], 0.5_f64.ln(), epsilon = 1e-12);
        assert!(inst.scaling_factors(0).is_err());
    }

    #[test]
    fn caller_partials_after_integration_drop_stale_aggregate() {
        let pool = pool();
        let mut inst = pool.create_instance(&two_taxon_config(2), EnginePolicy::default()).unwrap();
        set_model(&mut inst, &EigenSystem::binary_symmetric());
        inst.set_tip_states(0, &[0, 1]).unwrap();
        inst.set_tip_states(1, &[0, 0]).unwrap();
        inst.update_transition_matrices(0, &[0, 1], &[0.4, 0.4]).unwrap();
        inst.update_partials(&[cherry()], false).unwrap();
        let scaled = inst.calculate_root_log_likelihoods(&[2], &[1.0], &[0.5, 0.5]).unwrap();
        assert!(scaled.iter().all(|v| v.is_finite()));

        // Same root, but its contents are now raw caller data.
        inst.set_partials(2, &[0.5, 0.5, 0.25, 0.75]).unwrap();
        let out = inst.calculate_root_log_likelihoods(&[2], &[1.0], &[0.5, 0.5]).unwrap();
        assert_relative_eq!(out[0], 0.5_f64.ln(), epsilon = 1e-12);
        assert_relative_eq!(out[1], 0.5_f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn reshaped_subtree_refreshes_root_aggregate() {
        let pool = pool();
        let cfg = InstanceConfig {
            tip_count: 3,
            partials_buffer_count: 2,
            compact_buffer_count: 3,
            state_count: 4,
            pattern_count: 5,
            eigen_count: 1,
            matrix_count: 4,
        };
        let tips = [[0, 1, 2, 3, 0], [0, 1, 3, 3, 2], [1, 1, 2, 0, 0]];
        let setup = |rescaling| {
            let mut inst = pool.create_instance(&cfg, policy(Precision::Double, rescaling)).unwrap();
            set_model(&mut inst, &EigenSystem::jukes_cantor());
            for (tip, states) in tips.iter().enumerate() {
                inst.set_tip_states(tip, states).unwrap();
            }
            inst.update_transition_matrices(0, &[0, 1, 2, 3], &[0.2, 0.5, 0.3, 0.4]).unwrap();
            inst
        };
        let op = |destination, child1, child2| Operation {
            destination,
            child1,
            child1_matrix: child1,
            child2,
            child2_matrix: child2,
        };

        let mut scaled = setup(RescalingStrategy::Dynamic);
        scaled.update_partials(&[op(3, 0, 1), op(4, 3, 2)], false).unwrap();
        scaled.calculate_root_log_likelihoods(&[4], &[1.0], &UNIFORM).unwrap();
        // Stored factors, but node 3 is no longer under the root.
        scaled.update_partials(&[op(4, 0, 1)], false).unwrap();
        let out = scaled.calculate_root_log_likelihoods(&[4], &[1.0], &UNIFORM).unwrap();
        assert_eq!(scaled.rescale_stats().root_reductions, 2);

        let mut plain = setup(RescalingStrategy::None);
        plain.update_partials(&[op(4, 0, 1)], false).unwrap();
        let expected = plain.calculate_root_log_likelihoods(&[4], &[1.0], &UNIFORM).unwrap();
        for (a, b) in out.iter().zip(&expected) {
            assert_relative_eq!(a, b, max_relative = 1e-12);
        }
    }

    fn identity_model(s: usize) -> EigenSystem {
        let identity: Vec<f64> = (0..s * s).map(|k| if k % (s + 1) == 0 { 1.0 } else { 0.0 }).collect();
        EigenSystem {
            state_count: s,
            eigenvectors: identity.clone(),
            inverse_eigenvectors: identity,
            eigenvalues: vec![0.0; s],
        }
    }

    #[test]
    fn every_state_class_returns_true_patterns() {
        let pool = pool();
        let patterns = 7;
        for (s, padded_states, padded_patterns) in
            [(4, 4, 8), (5, 16, 7), (20, 32, 7), (61, 64, 7), (65, 80, 7)]
        {
            let cfg = InstanceConfig { state_count: s, ..two_taxon_config(patterns) };
            let mut inst = pool.create_instance(&cfg, EnginePolicy::default()).unwrap();
            assert_eq!(inst.dimensions().padded_state_count, padded_states);
            assert_eq!(inst.dimensions().padded_pattern_count, padded_patterns);

            // P(t) = I, so equal tips give pi_x and an ambiguous tip adds nothing.
            set_model(&mut inst, &identity_model(s));
            let states: Vec<i32> = (0..patterns).map(|p| (p * 3 % s) as i32).collect();
            let mut other = states.clone();
            other[patterns - 1] = -1;
            inst.set_tip_states(0, &states).unwrap();
            inst.set_tip_states(1, &other).unwrap();
            inst.update_transition_matrices(0, &[0, 1], &[0.3, 0.8]).unwrap();
            inst.update_partials(&[cherry()], false).unwrap();

            let freqs = vec![1.0 / s as f64; s];
            let out = inst.calculate_root_log_likelihoods(&[2], &[1.0], &freqs).unwrap();
            assert_eq!(out.len(), patterns);
            for v in out {
                assert_relative_eq!(v, (1.0 / s as f64).ln(), epsilon = 1e-12);
            }
        }
    }

    fn primates() -> Vec<String> {
        let mut sequences: Vec<String> = Vec::new();
        for line in include_str!("../testdata/primates.fasta").lines() {
            if line.starts_with('>') {
                sequences.push(String::new());
            } else if let Some(seq) = sequences.last_mut() {
                seq.push_str(line.trim());
            }
        }
        sequences
    }

    /// Human, chimp and gorilla mtDNA under JC69, `((human:0.1, chimp:0.1):0.1, gorilla:0.2)`.
    /// PAUP* reports lnL = -1574.63623 for this tree.
    #[test]
    fn primate_alignment_matches_paup() {
        let sequences = primates();
        assert_eq!(sequences.len(), 3);
        let patterns = sequences[0].len();
        let ops = Operation::from_flat(&[3, 0, 0, 1, 1, 4, 2, 2, 3, 3]).unwrap();
        let pool = pool();

        let mut totals = Vec::new();
        for compact in [3, 0] {
            let cfg = InstanceConfig {
                tip_count: 3,
                partials_buffer_count: 5 - compact,
                compact_buffer_count: compact,
                state_count: 4,
                pattern_count: patterns,
                eigen_count: 1,
                matrix_count: 4,
            };
            let mut inst = pool.create_instance(&cfg, EnginePolicy::default()).unwrap();
            for (tip, seq) in sequences.iter().enumerate() {
                if compact > 0 {
                    inst.set_tip_states(tip, &encode_nucleotides(seq)).unwrap();
                } else {
                    inst.set_partials(tip, &nucleotide_partials(seq)).unwrap();
                }
            }
            inst.set_category_rates(&[1.0]).unwrap();
            set_model(&mut inst, &EigenSystem::jukes_cantor());
            inst.update_transition_matrices(0, &[0, 1, 2, 3], &[0.1, 0.1, 0.2, 0.1]).unwrap();
            inst.update_partials(&ops, false).unwrap();
            let site_ll = inst.calculate_root_log_likelihoods(&[4], &[1.0], &UNIFORM).unwrap();
            assert_eq!(site_ll.len(), patterns);
            totals.push(site_ll.iter().sum::<f64>());
        }
        assert_relative_eq!(totals[0], -1574.63623, epsilon = 1e-5);
        assert_relative_eq!(totals[0], totals[1], max_relative = 1e-12);

        // The same schedule derived from the tree.
        let tree = Tree::from_structure(vec![3, 3, 4, 4, -1], vec![0.1, 0.1, 0.2, 0.1, 0.0], 3).unwrap();
        assert_eq!(Operation::to_flat(&tree.operations()), vec![3, 0, 0, 1, 1, 4, 2, 2, 3, 3]);
        let rows: Vec<Vec<i32>> = sequences.iter().map(|seq| encode_nucleotides(seq)).collect();
        let site_ll = tree
            .site_log_likelihoods(&pool, EnginePolicy::default(), &EigenSystem::jukes_cantor(), &UNIFORM, &rows)
            .unwrap();
        assert_relative_eq!(site_ll.iter().sum::<f64>(), totals[0], max_relative = 1e-12);
    }
}
