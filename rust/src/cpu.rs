//! CPU reference backend
//!
//! Implements [`Backend`] on host memory so the engine runs everywhere and
//! accelerator backends have something to be checked against.
//!
//! Features:
//! - Rayon for per-pattern parallelism inside every kernel
//! - `Single` precision emulated by rounding every stored value through f32
//! - Optional per-device memory limit, so allocation failure is reproducible
//! - Shared [`MemoryTracker`] reporting live buffers and bytes in use

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use rayon::prelude::*;

use crate::backend::{Backend, DeviceEigen, KernelShape, ScalingMode};
use crate::config::Precision;
use crate::device::{DeviceId, DeviceInfo, Platform};
use crate::error::{Error, Result};

const INT_SIZE: u64 = 4;

/// Allocation bookkeeping shared by every buffer on one device.
#[derive(Debug, Default)]
pub struct MemoryTracker {
    limit: Option<u64>,
    used: AtomicU64,
    live: AtomicUsize,
    allocations: AtomicUsize,
}

/// Snapshot of a [`MemoryTracker`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryUsage {
    /// Bytes currently allocated.
    pub bytes_in_use: u64,
    /// Buffers not yet released.
    pub live_buffers: usize,
    /// Allocations ever made.
    pub total_allocations: usize,
}

impl MemoryTracker {
    fn new(limit: Option<u64>) -> Self {
        Self { limit, ..Self::default() }
    }

    fn reserve(&self, bytes: u64) -> Result<()> {
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_add(bytes);
            if let Some(limit) = self.limit {
                if next > limit {
                    return Err(Error::OutOfMemory {
                        requested: bytes,
                        available: limit.saturating_sub(current),
                    });
                }
            }
            match self.used.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.live.fetch_add(1, Ordering::Relaxed);
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn release(&self, bytes: u64) {
        self.used.fetch_sub(bytes, Ordering::AcqRel);
        self.live.fetch_sub(1, Ordering::Relaxed);
    }

    /// Current usage.
    pub fn usage(&self) -> MemoryUsage {
        MemoryUsage {
            bytes_in_use: self.used.load(Ordering::Acquire),
            live_buffers: self.live.load(Ordering::Relaxed),
            total_allocations: self.allocations.load(Ordering::Relaxed),
        }
    }
}

/// Host-resident stand-in for a device buffer.
#[derive(Debug)]
pub struct CpuBuffer<T> {
    data: Vec<T>,
    bytes: u64,
    tracker: Arc<MemoryTracker>,
}

impl<T> CpuBuffer<T> {
    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the buffer holds no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrow the contents.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }
}

impl<T> Drop for CpuBuffer<T> {
    fn drop(&mut self) {
        self.tracker.release(self.bytes);
    }
}

struct CpuSlot {
    info: DeviceInfo,
    tracker: Arc<MemoryTracker>,
}

/// Platform exposing one or more host "devices".
pub struct CpuPlatform {
    devices: Vec<CpuSlot>,
}

impl CpuPlatform {
    /// A single unlimited device.
    pub fn new() -> Self {
        Self::with_devices(1)
    }

    /// `count` unlimited devices sharing the rayon thread pool.
    pub fn with_devices(count: usize) -> Self {
        let threads = rayon::current_num_threads();
        let devices = (0..count)
            .map(|id| CpuSlot {
                info: DeviceInfo {
                    name: format!("CPU device {id} ({threads} rayon threads)"),
                    global_memory_bytes: u64::MAX,
                    clock_rate_khz: 0,
                },
                tracker: Arc::new(MemoryTracker::new(None)),
            })
            .collect();
        Self { devices }
    }

    /// Cap every device at `bytes` of buffer memory.
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        for slot in &mut self.devices {
            slot.info.global_memory_bytes = bytes;
            slot.tracker = Arc::new(MemoryTracker::new(Some(bytes)));
        }
        self
    }

    /// Usage of device `id`, if it exists.
    pub fn memory_usage(&self, id: DeviceId) -> Option<MemoryUsage> {
        self.devices.get(id).map(|slot| slot.tracker.usage())
    }
}

impl Default for CpuPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for CpuPlatform {
    type Device = CpuDevice;

    fn name(&self) -> &str {
        "CPU"
    }

    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn device_info(&self, id: DeviceId) -> Result<DeviceInfo> {
        self.devices
            .get(id)
            .map(|slot| slot.info.clone())
            .ok_or_else(|| Error::InvalidArgument(format!("no CPU device {id}")))
    }

    fn open(&self, id: DeviceId, precision: Precision) -> Result<CpuDevice> {
        let slot = self
            .devices
            .get(id)
            .ok_or_else(|| Error::InvalidArgument(format!("no CPU device {id}")))?;
        Ok(CpuDevice { id, precision, tracker: Arc::clone(&slot.tracker) })
    }
}

/// Backend running every kernel on the host.
pub struct CpuDevice {
    id: DeviceId,
    precision: Precision,
    tracker: Arc<MemoryTracker>,
}

/// `P(i -> state)` from one matrix row; out-of-range states are ambiguous (1.0).
#[inline]
fn state_entry(row: &[f64], state: i32) -> f64 {
    usize::try_from(state)
        .ok()
        .and_then(|s| row.get(s))
        .copied()
        .unwrap_or(1.0)
}

fn keep_double(v: f64) -> f64 {
    v
}

fn round_to_single(v: f64) -> f64 {
    v as f32 as f64
}

#[inline]
fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

impl CpuDevice {
    /// Precision values are stored at.
    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Usage of the device this backend is bound to.
    pub fn memory_usage(&self) -> MemoryUsage {
        self.tracker.usage()
    }

    fn store(&self) -> fn(f64) -> f64 {
        match self.precision {
            Precision::Double => keep_double as fn(f64) -> f64,
            Precision::Single => round_to_single,
        }
    }

    fn alloc<T: Clone + Default>(&self, len: usize, elem_size: u64) -> Result<CpuBuffer<T>> {
        let bytes = len as u64 * elem_size;
        self.tracker.reserve(bytes)?;
        Ok(CpuBuffer { data: vec![T::default(); len], bytes, tracker: Arc::clone(&self.tracker) })
    }

    /// Shared body of the three pruning kernels.
    ///
    /// `child(pattern, parent_state)` returns the product of both children's
    /// conditional sums for one entry of the destination.
    fn prune<F>(
        &self,
        dest: &mut CpuBuffer<f64>,
        scaling: ScalingMode<'_, CpuBuffer<f64>>,
        shape: KernelShape,
        child: F,
    ) -> Result<()>
    where
        F: Fn(usize, usize) -> f64 + Sync,
    {
        if shape.category_count != 1 {
            return Err(Error::NotSupported("multiple rate categories"));
        }
        let p = shape.state_count;
        let n = shape.pattern_count;
        Error::check_len("destination partials", n * p, dest.len())?;
        let store = self.store();
        let fill = |pattern: usize, out: &mut [f64]| {
            for (state, value) in out.iter_mut().enumerate() {
                *value = store(child(pattern, state));
            }
        };

        match scaling {
            ScalingMode::Off => {
                dest.data
                    .par_chunks_mut(p)
                    .enumerate()
                    .for_each(|(pattern, out)| fill(pattern, out));
            }
            ScalingMode::Compute(factors) => {
                Error::check_len("scaling factors", n, factors.len())?;
                dest.data
                    .par_chunks_mut(p)
                    .zip(factors.data.par_iter_mut())
                    .enumerate()
                    .for_each(|(pattern, (out, factor))| {
                        fill(pattern, out);
                        let max = out.iter().copied().fold(0.0_f64, f64::max);
                        let scale = if max > 0.0 { store(max) } else { 1.0 };
                        *factor = scale;
                        for value in out.iter_mut() {
                            *value = store(*value / scale);
                        }
                    });
            }
            ScalingMode::Apply(factors) => {
                Error::check_len("scaling factors", n, factors.len())?;
                dest.data
                    .par_chunks_mut(p)
                    .zip(factors.data.par_iter())
                    .enumerate()
                    .for_each(|(pattern, (out, &scale))| {
                        fill(pattern, out);
                        for value in out.iter_mut() {
                            *value = store(*value / scale);
                        }
                    });
            }
        }
        Ok(())
    }

    fn check_matrices(matrix1: &CpuBuffer<f64>, matrix2: &CpuBuffer<f64>, p: usize) -> Result<()> {
        Error::check_len("transition matrix", p * p, matrix1.len())?;
        Error::check_len("transition matrix", p * p, matrix2.len())
    }
}

impl Backend for CpuDevice {
    type RealBuffer = CpuBuffer<f64>;
    type IntBuffer = CpuBuffer<i32>;

    fn device_id(&self) -> DeviceId {
        self.id
    }

    fn alloc_real(&mut self, len: usize) -> Result<Self::RealBuffer> {
        self.alloc(len, self.precision.real_size())
    }

    fn alloc_int(&mut self, len: usize) -> Result<Self::IntBuffer> {
        self.alloc(len, INT_SIZE)
    }

    fn write_real(&mut self, dst: &mut Self::RealBuffer, src: &[f64]) -> Result<()> {
        Error::check_len("real upload", dst.len(), src.len())?;
        let store = self.store();
        for (d, &s) in dst.data.iter_mut().zip(src) {
            *d = store(s);
        }
        Ok(())
    }

    fn write_int(&mut self, dst: &mut Self::IntBuffer, src: &[i32]) -> Result<()> {
        Error::check_len("integer upload", dst.len(), src.len())?;
        dst.data.copy_from_slice(src);
        Ok(())
    }

    fn read_real(&self, src: &Self::RealBuffer, dst: &mut [f64]) -> Result<()> {
        if dst.len() > src.len() {
            return Err(Error::Transfer(format!(
                "readback of {} elements from a buffer of {}",
                dst.len(),
                src.len()
            )));
        }
        dst.copy_from_slice(&src.data[..dst.len()]);
        Ok(())
    }

    fn transition_matrices(
        &mut self,
        eigen: &DeviceEigen<Self::RealBuffer>,
        edge_lengths: &[f64],
        out: &mut [&mut Self::RealBuffer],
        state_count: usize,
    ) -> Result<()> {
        let p = state_count;
        Error::check_len("eigenvectors", p * p, eigen.evec.len())?;
        Error::check_len("inverse eigenvectors", p * p, eigen.ievc.len())?;
        Error::check_len("eigenvalues", p, eigen.evals.len())?;
        Error::check_len("edge lengths", out.len(), edge_lengths.len())?;
        for matrix in out.iter() {
            Error::check_len("transition matrix", p * p, matrix.len())?;
        }

        let (evec, ievc, evals) = (&eigen.evec.data, &eigen.ievc.data, &eigen.evals.data);
        let store = self.store();
        out.par_iter_mut().zip(edge_lengths.par_iter()).for_each(|(matrix, &t)| {
            let exp_t: Vec<f64> = evals.iter().map(|&lambda| (lambda * t).exp()).collect();
            for i in 0..p {
                for j in 0..p {
                    let mut sum = 0.0;
                    for k in 0..p {
                        sum += evec[k * p + i] * exp_t[k] * ievc[j * p + k];
                    }
                    matrix.data[i * p + j] = store(sum);
                }
            }
        });
        Ok(())
    }

    fn states_states(
        &mut self,
        states1: &Self::IntBuffer,
        states2: &Self::IntBuffer,
        matrix1: &Self::RealBuffer,
        matrix2: &Self::RealBuffer,
        dest: &mut Self::RealBuffer,
        scaling: ScalingMode<'_, Self::RealBuffer>,
        shape: KernelShape,
    ) -> Result<()> {
        let p = shape.state_count;
        Self::check_matrices(matrix1, matrix2, p)?;
        Error::check_len("tip states", shape.pattern_count, states1.len())?;
        Error::check_len("tip states", shape.pattern_count, states2.len())?;
        let (m1, m2, s1, s2) = (&matrix1.data, &matrix2.data, &states1.data, &states2.data);
        self.prune(dest, scaling, shape, |pattern, i| {
            let row1 = &m1[i * p..(i + 1) * p];
            let row2 = &m2[i * p..(i + 1) * p];
            state_entry(row1, s1[pattern]) * state_entry(row2, s2[pattern])
        })
    }

    fn states_partials(
        &mut self,
        states1: &Self::IntBuffer,
        partials2: &Self::RealBuffer,
        matrix1: &Self::RealBuffer,
        matrix2: &Self::RealBuffer,
        dest: &mut Self::RealBuffer,
        scaling: ScalingMode<'_, Self::RealBuffer>,
        shape: KernelShape,
    ) -> Result<()> {
        let p = shape.state_count;
        Self::check_matrices(matrix1, matrix2, p)?;
        Error::check_len("tip states", shape.pattern_count, states1.len())?;
        Error::check_len("child partials", shape.pattern_count * p, partials2.len())?;
        let (m1, m2, s1, c2) = (&matrix1.data, &matrix2.data, &states1.data, &partials2.data);
        self.prune(dest, scaling, shape, |pattern, i| {
            let row1 = &m1[i * p..(i + 1) * p];
            let row2 = &m2[i * p..(i + 1) * p];
            state_entry(row1, s1[pattern]) * dot(row2, &c2[pattern * p..(pattern + 1) * p])
        })
    }

    fn partials_partials(
        &mut self,
        partials1: &Self::RealBuffer,
        partials2: &Self::RealBuffer,
        matrix1: &Self::RealBuffer,
        matrix2: &Self::RealBuffer,
        dest: &mut Self::RealBuffer,
        scaling: ScalingMode<'_, Self::RealBuffer>,
        shape: KernelShape,
    ) -> Result<()> {
        let p = shape.state_count;
        Self::check_matrices(matrix1, matrix2, p)?;
        Error::check_len("child partials", shape.pattern_count * p, partials1.len())?;
        Error::check_len("child partials", shape.pattern_count * p, partials2.len())?;
        let (m1, m2, c1, c2) = (&matrix1.data, &matrix2.data, &partials1.data, &partials2.data);
        self.prune(dest, scaling, shape, |pattern, i| {
            let site = pattern * p..(pattern + 1) * p;
            dot(&m1[i * p..(i + 1) * p], &c1[site.clone()]) * dot(&m2[i * p..(i + 1) * p], &c2[site])
        })
    }

    fn accumulate_root_scaling(
        &mut self,
        node_factors: &[&Self::RealBuffer],
        out: &mut Self::RealBuffer,
        pattern_count: usize,
    ) -> Result<()> {
        Error::check_len("root scaling factors", pattern_count, out.len())?;
        for factors in node_factors {
            Error::check_len("node scaling factors", pattern_count, factors.len())?;
        }
        let store = self.store();
        out.data.par_iter_mut().enumerate().for_each(|(pattern, total)| {
            *total = store(node_factors.iter().map(|f| f.data[pattern].ln()).sum());
        });
        Ok(())
    }

    fn integrate_root(
        &mut self,
        root: &Self::RealBuffer,
        weights: &Self::RealBuffer,
        frequencies: &Self::RealBuffer,
        root_scaling: Option<&Self::RealBuffer>,
        out: &mut Self::RealBuffer,
        shape: KernelShape,
    ) -> Result<()> {
        let (n, p) = (shape.pattern_count, shape.state_count);
        Error::check_len("root partials", shape.category_count * n * p, root.len())?;
        Error::check_len("category weights", shape.category_count, weights.len())?;
        Error::check_len("state frequencies", p, frequencies.len())?;
        Error::check_len("log-likelihood buffer", n, out.len())?;
        if let Some(scale) = root_scaling {
            Error::check_len("root scaling factors", n, scale.len())?;
        }

        let store = self.store();
        out.data.par_iter_mut().enumerate().for_each(|(pattern, value)| {
            let mut sum = 0.0;
            for (category, &w) in weights.data.iter().enumerate() {
                let base = (category * n + pattern) * p;
                sum += w * dot(&root.data[base..base + p], &frequencies.data);
            }
            let correction = root_scaling.map_or(0.0, |s| s.data[pattern]);
            *value = store(sum.ln() + correction);
        });
        Ok(())
    }
}
