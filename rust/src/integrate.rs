//! Root integration: per-pattern log-likelihoods from root partials.
//!
//! `ln L[p] = ln(Σ_c w_c Σ_s π_s · L[root, c, p, s]) + Σ_n ln f[n, p]`
//!
//! The second term is the root aggregate of the scaling factors divided out
//! of every internal node under the root; it is absent without rescaling.

use crate::backend::{Backend, KernelShape};
use crate::error::{BufferKind, Error, Result};
use crate::pruning::RescaleController;
use crate::registry::{BufferRegistry, NodeData, ScalingBuffers};
use crate::staging::StagingArea;

/// Inputs of one root integration.
#[derive(Clone, Copy, Debug)]
pub struct RootRequest<'a> {
    /// Root buffer indices; exactly one is supported.
    pub roots: &'a [usize],
    /// Rate-category weights, one per category.
    pub weights: &'a [f64],
    /// Equilibrium state frequencies, true state count.
    pub frequencies: &'a [f64],
}

impl RootRequest<'_> {
    fn single_root(&self) -> Result<usize> {
        match self.roots {
            [root] => Ok(*root),
            [] => Err(Error::InvalidArgument("no root buffer given".into())),
            _ => Err(Error::NotSupported("integration over multiple root buffers")),
        }
    }

    fn check_weights(&self, category_count: usize) -> Result<()> {
        if self.weights.len() > category_count {
            return Err(Error::NotSupported("multiple rate categories"));
        }
        Error::check_len("category weights", category_count, self.weights.len())?;
        if self.weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(Error::InvalidArgument(
                "category weights must be finite and non-negative".into(),
            ));
        }
        Ok(())
    }
}

/// Integrate the root and copy back the true-pattern prefix.
///
/// # Algorithm
/// 1. Check the root holds partials and stage frequencies and weights
/// 2. Rebuild the root aggregate if factors or the subtree changed since
///    the last reduction at this root
/// 3. Integrate over states and categories, adding the aggregate back
///
/// # Returns
/// Log-likelihood per true pattern.
pub(crate) fn integrate<B: Backend>(
    backend: &mut B,
    registry: &mut BufferRegistry<B>,
    staging: &mut StagingArea,
    controller: &mut RescaleController,
    request: RootRequest<'_>,
) -> Result<Vec<f64>> {
    let dims = registry.dims;
    let root = request.single_root()?;
    request.check_weights(dims.category_count)?;
    if registry.provenance(root)? == NodeData::Unset {
        return Err(Error::BufferUnset { kind: BufferKind::Partials, index: root });
    }
    // Fails for a tip bound to compact states, which has no partials to integrate.
    registry.partials.current.get(root)?;

    let frequencies = staging.stage_frequencies(request.frequencies)?;
    backend.write_real(&mut registry.frequencies, frequencies)?;
    backend.write_real(&mut registry.weights, request.weights)?;

    if controller.needs_root_reduction(root) {
        let nodes = registry.scaled_subtree(root)?;
        if let Some(ScalingBuffers { nodes: factors, root: aggregate }) = registry.scaling.as_mut() {
            let gathered = nodes
                .iter()
                .map(|&node| factors.current.get(node))
                .collect::<Result<Vec<_>>>()?;
            backend.accumulate_root_scaling(&gathered, aggregate, dims.padded_pattern_count)?;
            tracing::debug!(root, nodes = nodes.len(), "reduced root scaling factors");
        }
        controller.finish_root_reduction(root);
    }

    let shape = KernelShape::from(&dims);
    backend.integrate_root(
        registry.partials.current.get(root)?,
        &registry.weights,
        &registry.frequencies,
        registry.scaling.as_ref().map(|s| &s.root),
        &mut registry.log_likelihoods,
        shape,
    )?;

    let mut out = vec![0.0; dims.pattern_count];
    backend.read_real(&registry.log_likelihoods, &mut out)?;
    Ok(out)
}
