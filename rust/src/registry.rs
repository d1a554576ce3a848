//! Ownership of every device buffer an instance uses.
//!
//! All buffers are allocated once in [`BufferRegistry::allocate`] and live
//! until the registry is dropped. Logical indices (node, matrix, model) map
//! to buffers through bounds-checked [`SlotTable`]s, so a bad index is an
//! [`Error::IndexOutOfRange`] and a slot that was never filled is an
//! [`Error::BufferUnset`].

use crate::backend::{Backend, DeviceEigen};
use crate::config::{Dimensions, Precision, RescalingStrategy};
use crate::error::{BufferKind, Error, Result};

/// Index-addressed buffer slots of one kind.
#[derive(Debug)]
pub struct SlotTable<T> {
    kind: BufferKind,
    slots: Vec<Option<T>>,
}

impl<T> SlotTable<T> {
    /// `len` empty slots.
    pub fn new(kind: BufferKind, len: usize) -> Self {
        Self { kind, slots: std::iter::repeat_with(|| None).take(len).collect() }
    }

    /// Number of slots, filled or not.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when the table has no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, index: usize) -> Result<&Option<T>> {
        self.slots
            .get(index)
            .ok_or_else(|| Error::out_of_range(self.kind, index, self.slots.len()))
    }

    fn slot_mut(&mut self, index: usize) -> Result<&mut Option<T>> {
        let len = self.slots.len();
        let kind = self.kind;
        self.slots.get_mut(index).ok_or_else(|| Error::out_of_range(kind, index, len))
    }

    /// Borrow the buffer at `index`.
    pub fn get(&self, index: usize) -> Result<&T> {
        let kind = self.kind;
        self.slot(index)?.as_ref().ok_or(Error::BufferUnset { kind, index })
    }

    /// Mutably borrow the buffer at `index`.
    pub fn get_mut(&mut self, index: usize) -> Result<&mut T> {
        let kind = self.kind;
        self.slot_mut(index)?.as_mut().ok_or(Error::BufferUnset { kind, index })
    }

    /// True when `index` is in range and holds a buffer.
    pub fn is_set(&self, index: usize) -> bool {
        matches!(self.slots.get(index), Some(Some(_)))
    }

    /// Store `value` at `index`, returning whatever was there.
    pub fn insert(&mut self, index: usize, value: T) -> Result<Option<T>> {
        Ok(self.slot_mut(index)?.replace(value))
    }

    /// Empty the slot at `index`, returning its buffer if it had one.
    pub fn remove(&mut self, index: usize) -> Result<Option<T>> {
        Ok(self.slot_mut(index)?.take())
    }

    /// Move the buffer out of `index` for exclusive use.
    ///
    /// Pair with [`SlotTable::restore`].
    pub fn take(&mut self, index: usize) -> Result<T> {
        let kind = self.kind;
        self.slot_mut(index)?.take().ok_or(Error::BufferUnset { kind, index })
    }

    /// Put back a buffer obtained from [`SlotTable::take`].
    pub fn restore(&mut self, index: usize, value: T) {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = Some(value);
        }
    }
}

/// Current and stored generations of one buffer family.
///
/// Only `current` is read by the engine; `stored` is allocated so a
/// checkpoint/restore step can swap generations without reallocating.
#[derive(Debug)]
pub struct SlotPair<T> {
    /// Live generation.
    pub current: SlotTable<T>,
    /// Checkpoint generation.
    pub stored: SlotTable<T>,
}

impl<T> SlotPair<T> {
    fn new(kind: BufferKind, len: usize) -> Self {
        Self { current: SlotTable::new(kind, len), stored: SlotTable::new(kind, len) }
    }
}

/// Which representation a tip ended up with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TipBinding {
    /// Neither setter called yet.
    Unbound,
    /// Dense partials.
    Partials,
    /// Compact state indices.
    States,
}

/// Where a node buffer's current contents came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeData {
    /// Never written.
    Unset,
    /// Written by `set_partials` / `set_tip_states`.
    Caller,
    /// Produced by a pruning operation from two children.
    Operation {
        /// First child buffer index.
        child1: usize,
        /// Second child buffer index.
        child2: usize,
    },
}

/// How a pruning kernel reads a child.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildKind {
    /// Compact tip states.
    States,
    /// Dense partials.
    Partials,
}

/// Per-node scaling factors plus the root aggregate.
#[derive(Debug)]
pub struct ScalingBuffers<R> {
    /// One buffer per internal node and generation, initialised to 1.
    pub nodes: SlotPair<R>,
    /// Per-pattern sum of log factors used at the root.
    pub root: R,
}

/// Every buffer of one instance.
pub struct BufferRegistry<B: Backend> {
    pub(crate) dims: Dimensions,
    pub(crate) partials: SlotPair<B::RealBuffer>,
    pub(crate) tip_states: SlotTable<B::IntBuffer>,
    compact_pool: Vec<B::IntBuffer>,
    pub(crate) matrices: SlotPair<B::RealBuffer>,
    matrix_loaded: Vec<bool>,
    pub(crate) eigen: SlotTable<DeviceEigen<B::RealBuffer>>,
    eigen_loaded: Vec<bool>,
    pub(crate) scaling: Option<ScalingBuffers<B::RealBuffer>>,
    pub(crate) frequencies: B::RealBuffer,
    pub(crate) weights: B::RealBuffer,
    pub(crate) log_likelihoods: B::RealBuffer,
    provenance: Vec<NodeData>,
    tip_binding: Vec<TipBinding>,
}

/// Bytes [`BufferRegistry::allocate`] will request for `dims`.
pub fn memory_requirement(
    dims: &Dimensions,
    precision: Precision,
    rescaling: RescalingStrategy,
) -> u64 {
    let internal = dims.internal_nodes().len() as u64;
    let partials = dims.partials_len() as u64;
    let patterns = dims.padded_pattern_count as u64;
    let states = dims.padded_state_count as u64;
    let matrix = dims.matrix_len() as u64;

    let mut reals = dims.buffer_count as u64 * partials
        + internal * partials
        + 2 * dims.matrix_count as u64 * matrix
        + dims.eigen_count as u64 * (2 * matrix + states)
        + states
        + dims.category_count as u64
        + patterns;
    if rescaling == RescalingStrategy::Dynamic {
        reals += 2 * internal * patterns + patterns;
    }
    let ints = dims.compact_count as u64 * patterns;
    reals * precision.real_size() + ints * 4
}

impl<B: Backend> BufferRegistry<B> {
    /// Allocate every buffer for `dims`.
    ///
    /// All or nothing: if any allocation fails, the buffers already obtained
    /// are dropped (and so released) before the error is returned.
    pub fn allocate(backend: &mut B, dims: Dimensions, rescaling: RescalingStrategy) -> Result<Self> {
        let partials_len = dims.partials_len();
        let patterns = dims.padded_pattern_count;
        let p = dims.padded_state_count;
        let mut count = 0usize;

        let mut partials = SlotPair::new(BufferKind::Partials, dims.buffer_count);
        for node in 0..dims.buffer_count {
            partials.current.insert(node, backend.alloc_real(partials_len)?)?;
            count += 1;
        }
        for node in dims.internal_nodes() {
            partials.stored.insert(node, backend.alloc_real(partials_len)?)?;
            count += 1;
        }

        let compact_pool = (0..dims.compact_count)
            .map(|_| backend.alloc_int(patterns))
            .collect::<Result<Vec<_>>>()?;
        count += compact_pool.len();

        let mut matrices = SlotPair::new(BufferKind::Matrix, dims.matrix_count);
        for index in 0..dims.matrix_count {
            matrices.current.insert(index, backend.alloc_real(p * p)?)?;
            matrices.stored.insert(index, backend.alloc_real(p * p)?)?;
            count += 2;
        }

        let mut eigen = SlotTable::new(BufferKind::Eigen, dims.eigen_count);
        for index in 0..dims.eigen_count {
            let block = DeviceEigen {
                evec: backend.alloc_real(p * p)?,
                ievc: backend.alloc_real(p * p)?,
                evals: backend.alloc_real(p)?,
            };
            eigen.insert(index, block)?;
            count += 3;
        }

        let scaling = match rescaling {
            RescalingStrategy::Dynamic => {
                let ones = vec![1.0; patterns];
                let mut nodes = SlotPair::new(BufferKind::ScalingFactors, dims.buffer_count);
                for node in dims.internal_nodes() {
                    for table in [&mut nodes.current, &mut nodes.stored] {
                        let mut factors = backend.alloc_real(patterns)?;
                        backend.write_real(&mut factors, &ones)?;
                        table.insert(node, factors)?;
                        count += 1;
                    }
                }
                let root = backend.alloc_real(patterns)?;
                count += 1;
                Some(ScalingBuffers { nodes, root })
            }
            RescalingStrategy::None => None,
        };

        let frequencies = backend.alloc_real(p)?;
        let weights = backend.alloc_real(dims.category_count)?;
        let log_likelihoods = backend.alloc_real(patterns)?;
        count += 3;

        tracing::debug!(
            device = backend.device_id(),
            buffers = count,
            rescaling = scaling.is_some(),
            "allocated instance buffers"
        );

        Ok(Self {
            dims,
            partials,
            tip_states: SlotTable::new(BufferKind::TipStates, dims.tip_count),
            compact_pool,
            matrices,
            matrix_loaded: vec![false; dims.matrix_count],
            eigen,
            eigen_loaded: vec![false; dims.eigen_count],
            scaling,
            frequencies,
            weights,
            log_likelihoods,
            provenance: vec![NodeData::Unset; dims.buffer_count],
            tip_binding: vec![TipBinding::Unbound; dims.tip_count],
        })
    }

    /// Representation chosen for `tip`.
    pub fn tip_binding(&self, tip: usize) -> Result<TipBinding> {
        self.tip_binding
            .get(tip)
            .copied()
            .ok_or_else(|| Error::out_of_range(BufferKind::TipStates, tip, self.dims.tip_count))
    }

    /// Compact buffers not yet handed to a tip.
    pub fn compact_available(&self) -> usize {
        self.compact_pool.len()
    }

    /// Partials buffer for `node`, binding a tip to dense partials on first use.
    pub(crate) fn bind_partials(&mut self, node: usize) -> Result<&mut B::RealBuffer> {
        if node >= self.dims.buffer_count {
            return Err(Error::out_of_range(BufferKind::Partials, node, self.dims.buffer_count));
        }
        if let Some(binding) = self.tip_binding.get_mut(node) {
            match *binding {
                TipBinding::States => {
                    return Err(Error::InvalidArgument(format!(
                        "tip {node} already holds compact states"
                    )))
                }
                TipBinding::Unbound => *binding = TipBinding::Partials,
                TipBinding::Partials => {}
            }
        }
        self.partials.current.get_mut(node)
    }

    /// States buffer for `tip`, binding it to compact states on first use.
    ///
    /// Binding moves one buffer out of the compact pool and releases the
    /// tip's partials buffer.
    pub(crate) fn bind_tip_states(&mut self, tip: usize) -> Result<&mut B::IntBuffer> {
        let binding = self.tip_binding(tip)?;
        match binding {
            TipBinding::Partials => {
                return Err(Error::InvalidArgument(format!("tip {tip} already holds partials")))
            }
            TipBinding::Unbound => {
                let buffer = self.compact_pool.pop().ok_or_else(|| {
                    Error::InvalidArgument(format!(
                        "no compact buffer left for tip {tip} ({} configured)",
                        self.dims.compact_count
                    ))
                })?;
                self.tip_states.insert(tip, buffer)?;
                self.partials.current.remove(tip)?;
                self.partials.stored.remove(tip)?;
                self.tip_binding[tip] = TipBinding::States;
            }
            TipBinding::States => {}
        }
        self.tip_states.get_mut(tip)
    }

    /// Reset the scaling factors of an internal node to 1.
    pub(crate) fn reset_scaling(&mut self, backend: &mut B, node: usize) -> Result<()> {
        let patterns = self.dims.padded_pattern_count;
        if let Some(scaling) = self.scaling.as_mut() {
            if scaling.nodes.current.is_set(node) {
                backend.write_real(scaling.nodes.current.get_mut(node)?, &vec![1.0; patterns])?;
            }
        }
        Ok(())
    }

    /// How kernels must read `node` as a child.
    pub fn child_kind(&self, node: usize) -> Result<ChildKind> {
        match self.provenance(node)? {
            NodeData::Unset => Err(Error::BufferUnset { kind: BufferKind::Partials, index: node }),
            _ if self.tip_binding.get(node) == Some(&TipBinding::States) => Ok(ChildKind::States),
            _ => Ok(ChildKind::Partials),
        }
    }

    /// Provenance of `node`.
    pub fn provenance(&self, node: usize) -> Result<NodeData> {
        self.provenance
            .get(node)
            .copied()
            .ok_or_else(|| Error::out_of_range(BufferKind::Partials, node, self.dims.buffer_count))
    }

    /// Record where `node`'s data came from; true when it changed.
    pub(crate) fn mark(&mut self, node: usize, data: NodeData) -> bool {
        match self.provenance.get_mut(node) {
            Some(slot) => std::mem::replace(slot, data) != data,
            None => false,
        }
    }

    pub(crate) fn mark_matrix_loaded(&mut self, index: usize) {
        if let Some(flag) = self.matrix_loaded.get_mut(index) {
            *flag = true;
        }
    }

    /// Transition matrix `index`, failing if nothing was ever computed into it.
    pub(crate) fn loaded_matrix(&self, index: usize) -> Result<&B::RealBuffer> {
        let matrix = self.matrices.current.get(index)?;
        if self.matrix_loaded[index] {
            Ok(matrix)
        } else {
            Err(Error::BufferUnset { kind: BufferKind::Matrix, index })
        }
    }

    pub(crate) fn mark_eigen_loaded(&mut self, index: usize) {
        if let Some(flag) = self.eigen_loaded.get_mut(index) {
            *flag = true;
        }
    }

    /// Eigensystem `index`, failing if none was uploaded.
    pub(crate) fn loaded_eigen(&self, index: usize) -> Result<&DeviceEigen<B::RealBuffer>> {
        let eigen = self.eigen.get(index)?;
        if self.eigen_loaded[index] {
            Ok(eigen)
        } else {
            Err(Error::BufferUnset { kind: BufferKind::Eigen, index })
        }
    }

    /// Internal nodes computed by operations in the subtree under `root`,
    /// in discovery order.
    pub fn scaled_subtree(&self, root: usize) -> Result<Vec<usize>> {
        let mut seen = vec![false; self.dims.buffer_count];
        let mut stack = vec![root];
        let mut nodes = Vec::new();
        while let Some(node) = stack.pop() {
            let data = self.provenance(node)?;
            if std::mem::replace(&mut seen[node], true) {
                continue;
            }
            if let NodeData::Operation { child1, child2 } = data {
                nodes.push(node);
                stack.push(child2);
                stack.push(child1);
            }
        }
        Ok(nodes)
    }
}
