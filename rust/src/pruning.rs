//! Felsenstein pruning over caller-ordered operations.
//!
//! Each [`Operation`] combines two children through their edge transition
//! matrices into a parent's partials:
//!
//! ```text
//! L[parent, p, i] = (Σ_j P1[i, j] · L[child1, p, j]) · (Σ_j P2[i, j] · L[child2, p, j])
//! ```
//!
//! A tip holding compact states contributes the matrix column of its
//! observed state directly (or 1.0 when the state is ambiguous), so the
//! engine picks one of three kernels per operation from the two child
//! representations.
//!
//! # Rescaling
//!
//! With dynamic rescaling, the first pass of an instance always computes
//! fresh per-node scaling factors. The root integration that follows folds
//! them into the root aggregate and clears the request; later passes reuse
//! the stored factors until the caller asks to rescale again.

use crate::backend::{Backend, KernelShape, ScalingMode};
use crate::config::{Dimensions, RescalingStrategy};
use crate::error::{BufferKind, Error, Result};
use crate::registry::{BufferRegistry, ChildKind, NodeData};

/// One pruning step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Operation {
    /// Parent buffer index (an internal node).
    pub destination: usize,
    /// First child buffer index.
    pub child1: usize,
    /// Transition matrix on the first child's edge.
    pub child1_matrix: usize,
    /// Second child buffer index.
    pub child2: usize,
    /// Transition matrix on the second child's edge.
    pub child2_matrix: usize,
}

impl Operation {
    /// Entries per operation in the flat encoding.
    pub const WIDTH: usize = 5;

    /// Parse the flat `[dest, child1, matrix1, child2, matrix2, ...]` array.
    ///
    /// # Returns
    /// One operation per 5-tuple, or an error for a ragged or negative entry.
    pub fn from_flat(flat: &[i32]) -> Result<Vec<Operation>> {
        if flat.len() % Self::WIDTH != 0 {
            return Err(Error::InvalidArgument(format!(
                "flat operation array of length {} is not a multiple of {}",
                flat.len(),
                Self::WIDTH
            )));
        }
        let index = |value: i32| {
            usize::try_from(value)
                .map_err(|_| Error::InvalidArgument(format!("negative index {value} in operation")))
        };
        flat.chunks_exact(Self::WIDTH)
            .map(|op| {
                Ok(Operation {
                    destination: index(op[0])?,
                    child1: index(op[1])?,
                    child1_matrix: index(op[2])?,
                    child2: index(op[3])?,
                    child2_matrix: index(op[4])?,
                })
            })
            .collect()
    }

    /// Flat encoding of `operations`.
    pub fn to_flat(operations: &[Operation]) -> Vec<i32> {
        operations
            .iter()
            .flat_map(|op| {
                [op.destination, op.child1, op.child1_matrix, op.child2, op.child2_matrix]
                    .map(|v| v as i32)
            })
            .collect()
    }

    fn check(&self, dims: &Dimensions) -> Result<()> {
        let nodes = dims.buffer_count;
        for node in [self.destination, self.child1, self.child2] {
            if node >= nodes {
                return Err(Error::out_of_range(BufferKind::Partials, node, nodes));
            }
        }
        for matrix in [self.child1_matrix, self.child2_matrix] {
            if matrix >= dims.matrix_count {
                return Err(Error::out_of_range(BufferKind::Matrix, matrix, dims.matrix_count));
            }
        }
        if self.destination < dims.tip_count {
            return Err(Error::InvalidArgument(format!(
                "operation writes into tip {}",
                self.destination
            )));
        }
        if self.destination == self.child1 || self.destination == self.child2 {
            return Err(Error::InvalidArgument(format!(
                "node {} is both parent and child of one operation",
                self.destination
            )));
        }
        Ok(())
    }
}

/// What one pass does with scaling factors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassScaling {
    /// Rescaling disabled for the instance.
    Off,
    /// Compute and store fresh factors.
    Compute,
    /// Reuse stored factors.
    Apply,
}

/// Rescaling counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RescaleStats {
    /// Calls to `update_partials`.
    pub passes: u64,
    /// Operations that computed fresh factors.
    pub rescaled_operations: u64,
    /// Operations that reused stored factors.
    pub applied_operations: u64,
    /// Root aggregates recomputed.
    pub root_reductions: u64,
}

/// One-shot-then-on-request rescaling state of an instance.
#[derive(Debug)]
pub struct RescaleController {
    enabled: bool,
    pending: bool,
    reduced_root: Option<usize>,
    stats: RescaleStats,
}

impl RescaleController {
    /// Fresh controller; the first pass always rescales when enabled.
    pub fn new(strategy: RescalingStrategy) -> Self {
        Self {
            enabled: strategy == RescalingStrategy::Dynamic,
            pending: true,
            reduced_root: None,
            stats: RescaleStats::default(),
        }
    }

    /// True when the next root integration recomputes the root aggregate.
    pub fn is_pending(&self) -> bool {
        self.enabled && self.pending
    }

    /// Decide the scaling mode of a pass.
    pub fn begin_pass(&mut self, requested: bool) -> PassScaling {
        self.stats.passes += 1;
        if !self.enabled {
            return PassScaling::Off;
        }
        if !self.pending {
            self.pending = requested;
        }
        if self.pending {
            PassScaling::Compute
        } else {
            PassScaling::Apply
        }
    }

    /// True when integrating at `root` must rebuild the root aggregate:
    /// a rescale is pending, or the aggregate was built for another root.
    pub fn needs_root_reduction(&self, root: usize) -> bool {
        self.enabled && (self.pending || self.reduced_root != Some(root))
    }

    /// Record that the root aggregate was rebuilt for `root`; clears the request.
    pub fn finish_root_reduction(&mut self, root: usize) {
        self.pending = false;
        self.reduced_root = Some(root);
        self.stats.root_reductions += 1;
    }

    /// Drop the cached root aggregate after factors change outside a pass.
    pub fn invalidate_root(&mut self) {
        self.reduced_root = None;
    }

    /// Counters so far.
    pub fn stats(&self) -> RescaleStats {
        self.stats
    }

    fn record(&mut self, pass: PassScaling, operations: usize) {
        let n = operations as u64;
        match pass {
            PassScaling::Compute => self.stats.rescaled_operations += n,
            PassScaling::Apply => self.stats.applied_operations += n,
            PassScaling::Off => {}
        }
    }
}

/// Run `operations` in order.
///
/// Indices of the whole batch are checked before anything is dispatched.
/// Missing child data is detected per operation, so a failure part way
/// through leaves the earlier destinations already overwritten.
///
/// # Arguments
/// * `pass` - Scaling mode chosen by the controller for this pass
/// * `controller` - Told when a pass outside `Compute` reshapes a subtree
pub(crate) fn execute<B: Backend>(
    backend: &mut B,
    registry: &mut BufferRegistry<B>,
    operations: &[Operation],
    pass: PassScaling,
    controller: &mut RescaleController,
) -> Result<()> {
    let dims = registry.dims;
    for op in operations {
        op.check(&dims)?;
    }
    tracing::debug!(operations = operations.len(), scaling = ?pass, "updating partials");

    let shape = KernelShape::from(&dims);
    for op in operations {
        // A new subtree shape under stored factors changes which nodes the
        // root aggregate covers.
        if run(backend, registry, op, pass, shape)? && pass != PassScaling::Compute {
            controller.invalidate_root();
        }
    }
    controller.record(pass, operations.len());
    Ok(())
}

fn run<B: Backend>(
    backend: &mut B,
    registry: &mut BufferRegistry<B>,
    op: &Operation,
    pass: PassScaling,
    shape: KernelShape,
) -> Result<bool> {
    let node = op.destination;
    let mut dest = registry.partials.current.take(node)?;
    let mut factors = match (pass, registry.scaling.as_mut()) {
        (PassScaling::Off, _) | (_, None) => None,
        (_, Some(scaling)) => match scaling.nodes.current.take(node) {
            Ok(factors) => Some(factors),
            Err(e) => {
                registry.partials.current.restore(node, dest);
                return Err(e);
            }
        },
    };

    let scaling = match (factors.as_mut(), pass) {
        (Some(f), PassScaling::Compute) => ScalingMode::Compute(f),
        (Some(f), _) => ScalingMode::Apply(&*f),
        (None, _) => ScalingMode::Off,
    };
    let result = dispatch(backend, registry, op, &mut dest, scaling, shape);

    registry.partials.current.restore(node, dest);
    if let (Some(f), Some(scaling)) = (factors, registry.scaling.as_mut()) {
        scaling.nodes.current.restore(node, f);
    }
    result?;
    Ok(registry.mark(node, NodeData::Operation { child1: op.child1, child2: op.child2 }))
}

fn dispatch<B: Backend>(
    backend: &mut B,
    registry: &BufferRegistry<B>,
    op: &Operation,
    dest: &mut B::RealBuffer,
    scaling: ScalingMode<'_, B::RealBuffer>,
    shape: KernelShape,
) -> Result<()> {
    let kinds = (registry.child_kind(op.child1)?, registry.child_kind(op.child2)?);
    let matrix1 = registry.loaded_matrix(op.child1_matrix)?;
    let matrix2 = registry.loaded_matrix(op.child2_matrix)?;
    let states = move |node| registry.tip_states.get(node);
    let partials = move |node| registry.partials.current.get(node);

    match kinds {
        (ChildKind::States, ChildKind::States) => backend.states_states(
            states(op.child1)?,
            states(op.child2)?,
            matrix1,
            matrix2,
            dest,
            scaling,
            shape,
        ),
        (ChildKind::States, ChildKind::Partials) => backend.states_partials(
            states(op.child1)?,
            partials(op.child2)?,
            matrix1,
            matrix2,
            dest,
            scaling,
            shape,
        ),
        // The kernel takes the states child first.
        (ChildKind::Partials, ChildKind::States) => backend.states_partials(
            states(op.child2)?,
            partials(op.child1)?,
            matrix2,
            matrix1,
            dest,
            scaling,
            shape,
        ),
        (ChildKind::Partials, ChildKind::Partials) => backend.partials_partials(
            partials(op.child1)?,
            partials(op.child2)?,
            matrix1,
            matrix2,
            dest,
            scaling,
            shape,
        ),
    }
}
