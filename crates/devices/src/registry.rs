//! Explicit ownership of the station's hardware handles.
//!
//! One process owns at most one balance and one arm. The registry hands out
//! shared handles; asking for a device that is already open returns the same
//! handle instead of opening the port a second time. Each handle is behind a
//! mutex, so only one operation is in flight per device.

use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use tracing::info;

use crate::arm::{ArmConfig, ArmDriver, RobotArm};
use crate::balance::{Balance, BalanceConfig, PowderBalance};
use crate::error::DeviceError;
use crate::retry::Sleeper;

pub type SharedBalance = Arc<Mutex<dyn PowderBalance>>;
pub type SharedArm = Arc<Mutex<dyn RobotArm>>;

#[derive(Default)]
pub struct DeviceRegistry {
    balance: Mutex<Option<SharedBalance>>,
    arm: Mutex<Option<SharedArm>>,
}

fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a balance (a real driver or a stand-in). Returns the handle
    /// already installed if there is one.
    pub fn install_balance(&self, balance: SharedBalance) -> SharedBalance {
        let mut slot = lock(&self.balance);
        Arc::clone(slot.get_or_insert(balance))
    }

    pub fn install_arm(&self, arm: SharedArm) -> SharedArm {
        let mut slot = lock(&self.arm);
        Arc::clone(slot.get_or_insert(arm))
    }

    /// The process balance, opening the serial port on first use.
    pub fn open_balance(&self, config: BalanceConfig, sleeper: Arc<dyn Sleeper>) -> Result<SharedBalance, DeviceError> {
        let mut slot = lock(&self.balance);
        if let Some(existing) = slot.as_ref() {
            return Ok(Arc::clone(existing));
        }
        let port = config.port.clone();
        let mut balance = Balance::new(config, sleeper);
        if !balance.open() {
            return Err(DeviceError::Open {
                device: "balance",
                reason: format!("could not open {port}"),
            });
        }
        info!(%port, "balance registered");
        let shared: SharedBalance = Arc::new(Mutex::new(balance));
        *slot = Some(Arc::clone(&shared));
        Ok(shared)
    }

    /// The process arm. A failed initial connection still registers the
    /// driver; callers reconnect explicitly.
    pub fn open_arm(&self, config: ArmConfig, sleeper: Arc<dyn Sleeper>) -> SharedArm {
        let mut slot = lock(&self.arm);
        if let Some(existing) = slot.as_ref() {
            return Arc::clone(existing);
        }
        let mut arm = ArmDriver::new(config, sleeper);
        arm.connect();
        let shared: SharedArm = Arc::new(Mutex::new(arm));
        *slot = Some(Arc::clone(&shared));
        shared
    }

    pub fn balance(&self) -> Option<SharedBalance> {
        lock(&self.balance).clone()
    }

    pub fn arm(&self) -> Option<SharedArm> {
        lock(&self.arm).clone()
    }
}

/// Lock a shared device, recovering from a poisoned mutex.
pub fn acquire<T: ?Sized>(device: &Arc<Mutex<T>>) -> MutexGuard<'_, T> {
    lock(device)
}

/// Lock a shared device unless an operation already holds it.
pub fn try_acquire<T: ?Sized>(device: &Arc<Mutex<T>>) -> Option<MutexGuard<'_, T>> {
    match device.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::NoSleep;
    use crate::testing::{SimulatedArm, SimulatedBalancePort};

    #[test]
    fn second_install_returns_existing_balance() {
        let registry = DeviceRegistry::new();
        let first: SharedBalance = Arc::new(Mutex::new(Balance::with_link(
            BalanceConfig::default(),
            Box::new(SimulatedBalancePort::new()),
            Arc::new(NoSleep),
        )));
        let second: SharedBalance = Arc::new(Mutex::new(Balance::with_link(
            BalanceConfig::default(),
            Box::new(SimulatedBalancePort::new()),
            Arc::new(NoSleep),
        )));
        let a = registry.install_balance(Arc::clone(&first));
        let b = registry.install_balance(second);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &first));
        assert!(acquire(&a).is_connected());
    }

    #[test]
    fn open_balance_reuses_installed_handle() {
        let registry = DeviceRegistry::new();
        let installed = registry.install_balance(Arc::new(Mutex::new(Balance::with_link(
            BalanceConfig::default(),
            Box::new(SimulatedBalancePort::new()),
            Arc::new(NoSleep),
        ))));
        let config = BalanceConfig {
            port: "/dev/no-such-port".into(),
            ..BalanceConfig::default()
        };
        let opened = registry.open_balance(config, Arc::new(NoSleep)).unwrap();
        assert!(Arc::ptr_eq(&installed, &opened));
    }

    #[test]
    fn open_balance_failure_leaves_slot_empty() {
        let registry = DeviceRegistry::new();
        let config = BalanceConfig {
            port: "/dev/no-such-port".into(),
            ..BalanceConfig::default()
        };
        assert!(registry.open_balance(config, Arc::new(NoSleep)).is_err());
        assert!(registry.balance().is_none());
    }

    #[test]
    fn arm_handle_is_shared() {
        let registry = DeviceRegistry::new();
        let sim = SimulatedArm::new();
        let mut driver = ArmDriver::with_connector(ArmConfig::default(), Box::new(sim), Arc::new(NoSleep));
        assert!(driver.connect());
        let arm = registry.install_arm(Arc::new(Mutex::new(driver)));
        let again = registry.arm().unwrap();
        assert!(Arc::ptr_eq(&arm, &again));
        assert!(acquire(&again).is_connected());
    }

    #[test]
    fn try_acquire_yields_while_a_device_is_held() {
        let balance: SharedBalance = Arc::new(Mutex::new(Balance::with_link(
            BalanceConfig::default(),
            Box::new(SimulatedBalancePort::new()),
            Arc::new(NoSleep),
        )));
        let held = acquire(&balance);
        assert!(try_acquire(&balance).is_none());
        drop(held);
        assert!(try_acquire(&balance).is_some());
    }
}
