//! Accelerator discovery and instance-to-device assignment.
//!
//! A [`Platform`] enumerates devices and opens a [`Backend`] on one of them.
//! [`DevicePool`] owns a platform plus an [`AssignmentPolicy`] and hands out
//! [`DeviceLease`]s, so which device an instance lands on is decided by an
//! explicit object rather than process-wide state.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::backend::Backend;
use crate::config::{EnginePolicy, InstanceConfig, Precision};
use crate::error::{Error, Result};
use crate::instance::LikelihoodInstance;

/// Zero-based device ordinal.
pub type DeviceId = usize;

/// Static description of one device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Human-readable device name.
    pub name: String,
    /// Total global memory in bytes.
    pub global_memory_bytes: u64,
    /// Clock rate in kHz (0 when unknown).
    pub clock_rate_khz: u64,
}

impl DeviceInfo {
    /// Global memory in MiB.
    pub fn memory_mb(&self) -> f64 {
        self.global_memory_bytes as f64 / 1024.0 / 1024.0
    }

    /// Clock rate in GHz.
    pub fn clock_ghz(&self) -> f64 {
        self.clock_rate_khz as f64 / 1_000_000.0
    }
}

/// Device discovery plus backend construction.
pub trait Platform: Send + Sync {
    /// Backend opened on one device.
    type Device: Backend;

    /// Platform name for diagnostics.
    fn name(&self) -> &str;

    /// Number of visible devices.
    fn device_count(&self) -> usize;

    /// Name, memory and clock of `id`.
    fn device_info(&self, id: DeviceId) -> Result<DeviceInfo>;

    /// Open a backend bound to `id`.
    fn open(&self, id: DeviceId, precision: Precision) -> Result<Self::Device>;
}

/// How [`DevicePool::acquire`] picks a device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AssignmentPolicy {
    /// Cycle through devices in order, starting at device 0.
    #[default]
    RoundRobin,
    /// Pick the device with the fewest live leases (lowest id on ties).
    LeastLoaded,
    /// Always use one device.
    Pinned(DeviceId),
}

#[derive(Debug)]
struct PoolState {
    cursor: usize,
    loads: Vec<usize>,
}

fn lock(state: &Mutex<PoolState>) -> MutexGuard<'_, PoolState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A claim on one device. The device's load count drops when this is dropped.
#[derive(Debug)]
pub struct DeviceLease {
    id: DeviceId,
    state: Arc<Mutex<PoolState>>,
}

impl DeviceLease {
    /// Device this lease is bound to.
    pub fn device_id(&self) -> DeviceId {
        self.id
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        if let Some(load) = state.loads.get_mut(self.id) {
            *load = load.saturating_sub(1);
        }
    }
}

/// Owns a platform and assigns devices to new instances.
pub struct DevicePool<P: Platform> {
    platform: P,
    policy: AssignmentPolicy,
    state: Arc<Mutex<PoolState>>,
}

impl<P: Platform> DevicePool<P> {
    /// Create a pool. Fails with [`Error::NoDevice`] when the platform is empty.
    pub fn new(platform: P, policy: AssignmentPolicy) -> Result<Self> {
        let count = platform.device_count();
        if count == 0 {
            tracing::warn!(platform = platform.name(), "no devices found");
            return Err(Error::NoDevice);
        }
        if let AssignmentPolicy::Pinned(id) = policy {
            if id >= count {
                return Err(Error::InvalidArgument(format!(
                    "pinned device {id} but platform has {count} devices"
                )));
            }
        }
        Ok(Self {
            platform,
            policy,
            state: Arc::new(Mutex::new(PoolState { cursor: 0, loads: vec![0; count] })),
        })
    }

    /// The underlying platform.
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Assignment policy in use.
    pub fn policy(&self) -> AssignmentPolicy {
        self.policy
    }

    /// Live leases per device.
    pub fn loads(&self) -> Vec<usize> {
        lock(&self.state).loads.clone()
    }

    /// Claim the next device according to the policy.
    pub fn acquire(&self) -> Result<DeviceLease> {
        let mut state = lock(&self.state);
        let count = state.loads.len();
        let id = match self.policy {
            AssignmentPolicy::RoundRobin => {
                let id = state.cursor % count;
                state.cursor = (id + 1) % count;
                id
            }
            AssignmentPolicy::LeastLoaded => state
                .loads
                .iter()
                .enumerate()
                .min_by_key(|&(id, &load)| (load, id))
                .map(|(id, _)| id)
                .ok_or(Error::NoDevice)?,
            AssignmentPolicy::Pinned(id) => id,
        };
        state.loads[id] += 1;
        Ok(DeviceLease { id, state: Arc::clone(&self.state) })
    }

    /// Create an instance bound to the next device.
    ///
    /// The binding is fixed for the instance's lifetime.
    pub fn create_instance(
        &self,
        config: &InstanceConfig,
        policy: EnginePolicy,
    ) -> Result<LikelihoodInstance<P::Device>> {
        let lease = self.acquire()?;
        let info = self.platform.device_info(lease.device_id())?;
        tracing::info!(
            device = lease.device_id(),
            name = %info.name,
            memory_mb = info.memory_mb(),
            clock_ghz = info.clock_ghz(),
            "binding likelihood instance"
        );
        let backend = self.platform.open(lease.device_id(), policy.precision)?;
        LikelihoodInstance::bind(lease, info, backend, config, policy)
    }
}
