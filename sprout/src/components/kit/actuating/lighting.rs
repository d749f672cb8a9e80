use crate::{
    devices::hardware::led_panel::{ActuatorCapability, LightingPreset},
    error::{Error, Result},
};
use serde::{Deserialize, Serialize};
use static_assertions::assert_impl_all;
use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What to do when a lease is requested while another one is outstanding.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LeasePolicy {
    /// Wait in line, leases are handed out first come first served.
    #[default]
    Block,
    /// Fail straight away with [`Error::ActuatorBusy`].
    FailFast,
}

/// What the actuator is known to be doing. Only reachable through the
/// lock, so only the lease holder can read or change it.
#[derive(Debug)]
struct ActuatorState {
    /// Last intensities written successfully.
    current: LightingPreset,
    /// Run that currently holds the lease.
    holder: Option<Uuid>,
}

struct SharedInner {
    uuid: Uuid,
    name: String,
    driver: Arc<dyn ActuatorCapability>,
    policy: LeasePolicy,
    state: Arc<Mutex<ActuatorState>>,
    closed: AtomicBool,
    acquisitions: AtomicUsize,
}

/// A lighting actuator that several callers share. Cloning is cheap and
/// every clone arbitrates through the same lock, so at most one
/// [`ActuatorLease`] exists per actuator at any time.
#[derive(Clone)]
pub struct SharedActuator {
    inner: Arc<SharedInner>,
}

impl SharedActuator {
    /// Wrap a driver. The panel is assumed to be switched off.
    ///
    /// * `name`: used in logs.
    /// * `driver`: the lighting driver.
    /// * `policy`: contention policy for [`ActuatorLease::acquire`].
    pub fn new(
        name: impl Into<String>,
        driver: Arc<dyn ActuatorCapability>,
        policy: LeasePolicy,
    ) -> Self {
        Self {
            inner: Arc::new(SharedInner {
                uuid: Uuid::new_v4(),
                name: name.into(),
                driver,
                policy,
                state: Arc::new(Mutex::new(ActuatorState {
                    current: LightingPreset::OFF,
                    holder: None,
                })),
                closed: AtomicBool::new(false),
                acquisitions: AtomicUsize::new(0),
            }),
        }
    }

    /// Return the unique identifier of the actuator.
    pub fn get_uuid(&self) -> Uuid {
        self.inner.uuid
    }

    /// Name of the actuator.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Contention policy in force.
    pub fn policy(&self) -> LeasePolicy {
        self.inner.policy
    }

    /// Stop handing out leases. The outstanding lease, if any, is not
    /// affected; waiters and later callers get [`Error::ActuatorUnavailable`].
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        info!(actuator = %self.inner.name, "Actuator closed");
    }

    /// Whether [`SharedActuator::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Whether a lease is outstanding right now.
    pub fn is_leased(&self) -> bool {
        self.inner.state.try_lock().is_err()
    }

    /// Number of leases handed out so far.
    pub fn acquisitions(&self) -> usize {
        self.inner.acquisitions.load(Ordering::SeqCst)
    }
}

impl Debug for SharedActuator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedActuator")
            .field("uuid", &self.inner.uuid)
            .field("name", &self.inner.name)
            .field("policy", &self.inner.policy)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Peripheral discovery, replaces looking the LED panel up by type.
pub trait ActuatorRegistry: Send + Sync {
    /// An actuator that can be leased, if the kit has one.
    fn find_controllable_actuator(&self) -> Option<SharedActuator>;
}

/// Registry of the actuators attached to the kit.
#[derive(Default, Clone, Debug)]
pub struct PeripheralRegistry {
    actuators: Vec<SharedActuator>,
}

impl PeripheralRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an actuator to the registry.
    pub fn with_actuator(mut self, actuator: SharedActuator) -> Self {
        self.actuators.push(actuator);
        self
    }

    /// Number of registered actuators.
    pub fn len(&self) -> usize {
        self.actuators.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.actuators.is_empty()
    }
}

impl ActuatorRegistry for PeripheralRegistry {
    fn find_controllable_actuator(&self) -> Option<SharedActuator> {
        self.actuators.iter().find(|a| !a.is_closed()).cloned()
    }
}

/// Prior intensities still to be written back before the lock goes. Meant
/// for the blocking pool; if the pool drops it unrun (runtime shutting down)
/// the write happens inline on drop.
struct PendingRestore {
    driver: Arc<dyn ActuatorCapability>,
    prior: LightingPreset,
    holder: Uuid,
    guard: Option<OwnedMutexGuard<ActuatorState>>,
}

impl PendingRestore {
    fn new(lease: &ActuatorLease, guard: OwnedMutexGuard<ActuatorState>) -> Self {
        Self {
            driver: lease.actuator.inner.driver.clone(),
            prior: lease.prior,
            holder: lease.holder,
            guard: Some(guard),
        }
    }

    /// Write `prior` back and unlock. Blocking.
    fn run(mut self) -> Result<()> {
        self.restore()
    }

    fn restore(&mut self) -> Result<()> {
        let Some(mut guard) = self.guard.take() else {
            return Ok(());
        };
        let restored = self.driver.set_intensities(self.prior);
        if restored.is_ok() {
            guard.current = self.prior;
        }
        guard.holder = None;
        restored
    }
}

impl Drop for PendingRestore {
    fn drop(&mut self) {
        if self.guard.is_none() {
            return;
        }
        warn!(holder = %self.holder, "Restoring lighting inline, blocking pool unavailable");
        if let Err(e) = self.restore() {
            warn!(holder = %self.holder, error = %e, "Failed to restore lighting");
        }
    }
}

/// Exclusive ownership of a [`SharedActuator`] by one capture run.
///
/// Release with [`ActuatorLease::release`]. A lease that is dropped
/// without being released (early return, cancelled future, panic) still
/// lets go of the actuator, restoring the prior intensities first when
/// `reset_on_exit` is set.
#[must_use = "the actuator stays locked until the lease is released or dropped"]
pub struct ActuatorLease {
    /// Run that owns the lease.
    holder: Uuid,
    actuator: SharedActuator,
    /// `None` once released.
    guard: Option<OwnedMutexGuard<ActuatorState>>,
    /// Intensities in force when the lease was acquired.
    prior: LightingPreset,
    reset_on_exit: bool,
    /// Set once anything was written through the lease.
    touched: bool,
}

assert_impl_all!(ActuatorLease: Send);
assert_impl_all!(SharedActuator: Send, Sync, Clone);

impl ActuatorLease {
    /// Take exclusive control of `actuator` on behalf of `holder`.
    /// Waits or fails with [`Error::ActuatorBusy`] depending on the
    /// actuator's [`LeasePolicy`].
    pub async fn acquire(actuator: &SharedActuator, holder: Uuid) -> Result<Self> {
        let shared = &actuator.inner;
        if actuator.is_closed() {
            return Err(Error::ActuatorUnavailable);
        }

        let mut guard = match shared.policy {
            LeasePolicy::Block => shared.state.clone().lock_owned().await,
            LeasePolicy::FailFast => shared
                .state
                .clone()
                .try_lock_owned()
                .map_err(|_| Error::ActuatorBusy)?,
        };
        // The actuator may have been closed while we were queued.
        if actuator.is_closed() {
            return Err(Error::ActuatorUnavailable);
        }

        guard.holder = Some(holder);
        shared.acquisitions.fetch_add(1, Ordering::SeqCst);
        let prior = guard.current;
        info!(actuator = %shared.name, holder = %holder, %prior, "Lease acquired");

        Ok(Self {
            holder,
            actuator: actuator.clone(),
            guard: Some(guard),
            prior,
            reset_on_exit: false,
            touched: false,
        })
    }

    /// Find an actuator in `registry` and lease it, failing with
    /// [`Error::ActuatorUnavailable`] when there is none.
    pub async fn acquire_from(registry: &dyn ActuatorRegistry, holder: Uuid) -> Result<Self> {
        let actuator = registry
            .find_controllable_actuator()
            .ok_or(Error::ActuatorUnavailable)?;
        Self::acquire(&actuator, holder).await
    }

    /// Restore the prior intensities when the lease ends.
    pub fn with_reset_on_exit(mut self, reset_on_exit: bool) -> Self {
        self.reset_on_exit = reset_on_exit;
        self
    }

    /// Run that owns the lease.
    pub fn holder(&self) -> Uuid {
        self.holder
    }

    /// Intensities in force when the lease was acquired.
    pub fn prior(&self) -> LightingPreset {
        self.prior
    }

    /// Intensities in force now, `None` once released.
    pub fn current(&self) -> Option<LightingPreset> {
        self.guard.as_ref().map(|guard| guard.current)
    }

    /// Whether the lease has been released.
    pub fn is_released(&self) -> bool {
        self.guard.is_none()
    }

    /// Set all three channel intensities. The driver call runs on a
    /// blocking worker.
    pub async fn apply(&mut self, preset: LightingPreset) -> Result<()> {
        preset.validate()?;
        if self.guard.is_none() {
            return Err(Error::ActuatorUnavailable);
        }
        self.touched = true;

        let driver = self.actuator.inner.driver.clone();
        tokio::task::spawn_blocking(move || driver.set_intensities(preset)).await??;

        if let Some(guard) = self.guard.as_mut() {
            guard.current = preset;
        }
        debug!(holder = %self.holder, %preset, "Lighting applied");
        Ok(())
    }

    /// Let go of the actuator, restoring the prior intensities first when
    /// `reset_on_exit` is set. Calling it again does nothing.
    pub async fn release(&mut self) -> Result<()> {
        let Some(mut guard) = self.guard.take() else {
            return Ok(());
        };

        let result = if self.reset_on_exit && self.touched {
            let pending = PendingRestore::new(self, guard);
            tokio::task::spawn_blocking(move || pending.run())
                .await
                .map_err(Error::from)
                .and_then(|restored| restored)
        } else {
            guard.holder = None;
            drop(guard);
            Ok(())
        };

        match &result {
            Ok(()) => info!(actuator = %self.actuator.name(), holder = %self.holder, "Lease released"),
            Err(e) => warn!(
                actuator = %self.actuator.name(),
                holder = %self.holder,
                error = %e,
                "Lease released, prior lighting not restored"
            ),
        }
        result
    }
}

impl Drop for ActuatorLease {
    fn drop(&mut self) {
        let Some(mut guard) = self.guard.take() else {
            return;
        };
        warn!(holder = %self.holder, "Lease dropped without release");

        if !(self.reset_on_exit && self.touched) {
            guard.holder = None;
            return;
        }

        let pending = PendingRestore::new(self, guard);
        let holder = self.holder;
        let restore = move || {
            if let Err(e) = pending.run() {
                warn!(holder = %holder, error = %e, "Failed to restore lighting of dropped lease");
            }
        };
        // Drop cannot await, hand the write to the blocking pool and keep
        // the actuator locked until it is done.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(restore);
            }
            Err(_) => restore(),
        }
    }
}
