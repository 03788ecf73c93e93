//! Powder and liquid dispensing station ("gypl").
//!
//! One batch fills a 15 mL tube: it goes to the balance, every requested
//! hopper doses into it, then every requested beaker is pipetted into it
//! with a fresh tip, and the tube goes back to its rack.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use lims_devices::registry::{acquire, try_acquire};
use lims_devices::{DeviceError, DeviceRegistry, SharedArm, SharedBalance, Sleeper};
use lims_protocol::{round3, BatchRequest, BottleHeight, DeviceStatus, DispenseMode, DispenseRequest};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::StationError;
use crate::grid::{Rack, TipInventory};

// Arm registers holding the physical slot for each rack.
const REG_HOPPER: u32 = 24;
const REG_TIP: u32 = 26;
const REG_TUBE: u32 = 27;
const REG_BEAKER: u32 = 28;
// Double register holding the aspiration volume in mL.
const REG_VOLUME: u32 = 11;

const PROG_TUBE_TO_BALANCE: &str = "guticl_ning_shiguan";
const PROG_TUBE_BACK: &str = "shiguan_back";
const PROG_BEAKER_OPEN: &str = "guticl_ning_shaobei";
const PROG_BEAKER_BACK: &str = "shaobei_back";
const PROG_PICK_TIP: &str = "guticl_pick_tip";
const PROG_REMOVE_TIP: &str = "guticl_remove_tip";
const PROG_ASPIRATE: &str = "guticl_suck_shaobei_to_tp";
const PROG_HOPPER_TAKE: &str = "guticl_fentong_take";
const PROG_HOPPER_BACK: &str = "guticl_fentong_back";

#[derive(Debug, Clone)]
pub struct DispensingSettings {
    pub mode: DispenseMode,
    pub bottle_height: BottleHeight,
    /// Wait after opening the baffle before the hopper is moved.
    pub baffle_settle: Duration,
    /// Wait after aspirating before the tip is dropped.
    pub aspirate_settle: Duration,
}

impl Default for DispensingSettings {
    fn default() -> Self {
        Self {
            mode: DispenseMode::Precision,
            bottle_height: BottleHeight::Ml15,
            baffle_settle: Duration::from_secs(2),
            aspirate_settle: Duration::from_secs(2),
        }
    }
}

/// One hopper's contribution to a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SolidRecord {
    pub position: u32,
    pub target: f64,
    pub actual: f64,
    /// Balance reading after the dose; `None` when the balance did not answer.
    pub real_time: Option<f64>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiquidRecord {
    pub position: u32,
    pub volume: f64,
    pub tip: i64,
    pub real_time: Option<f64>,
}

/// What a batch reports back: the request with solids replaced by the
/// measured masses and the tip flags after consumption. Liquid volumes are
/// not measured and are echoed as requested.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub solids_list: Vec<f64>,
    pub liquids_list: Vec<f64>,
    pub bottle_15ml_pos: u32,
    pub start_tip_pos: Vec<u8>,
    pub solids: Vec<SolidRecord>,
    pub liquids: Vec<LiquidRecord>,
}

/// Append-only record of every batch this station has run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchHistory {
    pub solids_parameters: Vec<Vec<f64>>,
    pub liquids_parameters: Vec<Vec<f64>>,
    pub solids_results: Vec<Vec<SolidRecord>>,
    pub liquids_results: Vec<Vec<f64>>,
}

pub struct DispensingStation {
    arm: SharedArm,
    balance: SharedBalance,
    sleeper: Arc<dyn Sleeper>,
    settings: DispensingSettings,
    history: Mutex<BatchHistory>,
    /// Last connectivity actually observed for each device.
    last_status: Mutex<DeviceStatus>,
}

fn step_error(step: impl Into<String>) -> impl FnOnce(DeviceError) -> StationError {
    let step = step.into();
    move |source| StationError::Dispensing { step, source }
}

impl DispensingStation {
    pub fn new(arm: SharedArm, balance: SharedBalance, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            arm,
            balance,
            sleeper,
            settings: DispensingSettings::default(),
            history: Mutex::default(),
            last_status: Mutex::default(),
        }
    }

    /// Build from the devices already installed in `registry`.
    pub fn from_registry(registry: &DeviceRegistry, sleeper: Arc<dyn Sleeper>) -> Result<Self, StationError> {
        let arm = registry
            .arm()
            .ok_or_else(|| StationError::Unavailable("机械臂未初始化".into()))?;
        let balance = registry
            .balance()
            .ok_or_else(|| StationError::Unavailable("天平/加粉仪未初始化".into()))?;
        Ok(Self::new(arm, balance, sleeper))
    }

    pub fn with_settings(mut self, settings: DispensingSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn arm(&self) -> &SharedArm {
        &self.arm
    }

    pub fn history(&self) -> BatchHistory {
        self.record().clone()
    }

    fn record(&self) -> std::sync::MutexGuard<'_, BatchHistory> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connectivity probe of both devices. Never reconnects and never waits
    /// on a device a batch is using: a held device keeps its last observed
    /// state and the snapshot is marked busy.
    pub fn device_status(&self) -> DeviceStatus {
        let mut last = self.last_status.lock().unwrap_or_else(PoisonError::into_inner);
        let mut busy = false;
        match try_acquire(&self.arm) {
            Some(mut arm) => {
                last.arm = arm.is_connected();
                if !last.arm {
                    warn!("arm connectivity check failed");
                }
            }
            None => busy = true,
        }
        match try_acquire(&self.balance) {
            Some(mut balance) => {
                last.balance = balance.is_connected();
                if !last.balance {
                    warn!("balance connectivity check failed");
                }
            }
            None => busy = true,
        }
        DeviceStatus {
            arm: last.arm,
            balance: last.balance,
            powder_dispenser: last.balance,
            busy,
        }
    }

    fn arm_at(&self, register: u32, rack: Rack, logical: u32, program: &str) -> Result<(), StationError> {
        let physical = rack.physical(i64::from(logical))?;
        let mut arm = acquire(&self.arm);
        arm.set_b(register, physical)
            .and_then(|_| arm.run_named_program(program))
            .map_err(step_error(program))
    }

    fn live_weight(&self) -> Option<f64> {
        match acquire(&self.balance).try_read_live_weight() {
            Ok(mg) => Some(mg),
            Err(e) => {
                warn!(error = %e, "live weight unreadable");
                None
            }
        }
    }

    /// Run one complete batch. Solid doses are best effort: a short dose is
    /// recorded and the batch continues. Missing tips fail the batch before
    /// anything moves; arm or balance faults abort it where they happen.
    ///
    /// Batches are not meant to overlap; the devices serialise each step,
    /// not whole batches.
    pub fn run_full_batch(&self, request: &BatchRequest) -> Result<BatchOutcome, StationError> {
        {
            let mut history = self.record();
            history.solids_parameters.push(request.solids_list.clone());
            history.liquids_parameters.push(request.liquids_list.clone());
        }

        let mut tips = TipInventory::new(request.start_tip_pos.clone());
        let liquids_needed = request.liquids_list.iter().filter(|v| **v > 0.0).count();
        if liquids_needed > tips.available() {
            warn!(liquids_needed, tips = tips.available(), "not enough tips for batch");
            return Err(StationError::NoTipsAvailable);
        }
        Rack::Tube.physical(i64::from(request.bottle_15ml_pos))?;

        info!(tube = request.bottle_15ml_pos, "batch started");
        acquire(&self.balance)
            .open_baffle()
            .map_err(step_error("open baffle"))?;
        self.arm_at(REG_TUBE, Rack::Tube, request.bottle_15ml_pos, PROG_TUBE_TO_BALANCE)?;

        let solids = self.add_solids(&request.solids_list)?;
        self.record().solids_results.push(solids.clone());
        let mut solids_list = request.solids_list.clone();
        for record in &solids {
            if let Some(slot) = solids_list.get_mut(record.position as usize - 1) {
                *slot = record.actual;
            }
        }

        let liquids = self.add_liquids(&request.liquids_list, &mut tips)?;
        self.record().liquids_results.push(request.liquids_list.clone());

        self.arm_at(REG_TUBE, Rack::Tube, request.bottle_15ml_pos, PROG_TUBE_BACK)?;
        info!(tube = request.bottle_15ml_pos, "batch finished");

        Ok(BatchOutcome {
            solids_list,
            liquids_list: request.liquids_list.clone(),
            bottle_15ml_pos: request.bottle_15ml_pos,
            start_tip_pos: tips.into_flags(),
            solids,
            liquids,
        })
    }

    fn add_solids(&self, targets: &[f64]) -> Result<Vec<SolidRecord>, StationError> {
        let mut records = Vec::new();
        for (position, target) in (1u32..).zip(targets.iter().copied()) {
            if target <= 0.0 {
                continue;
            }
            info!(hopper = position, target_mg = target, "dosing");
            self.arm_at(REG_HOPPER, Rack::Solid, position, PROG_HOPPER_TAKE)?;

            let result = acquire(&self.balance).dispense(&DispenseRequest {
                target_mass_mg: target,
                mode: self.settings.mode,
                bottle_height: self.settings.bottle_height,
            });
            if !result.success {
                warn!(hopper = position, error = ?result.error, "dose underperformed, continuing");
            }
            records.push(SolidRecord {
                position,
                target,
                actual: round3(result.actual_mg),
                real_time: self.live_weight(),
                success: result.success,
                error: result.error,
            });

            acquire(&self.balance)
                .open_baffle()
                .map_err(step_error("open baffle"))?;
            self.sleeper.sleep(self.settings.baffle_settle);
            self.arm_at(REG_HOPPER, Rack::Solid, position, PROG_HOPPER_BACK)?;
        }
        Ok(records)
    }

    fn add_liquids(&self, volumes: &[f64], tips: &mut TipInventory) -> Result<Vec<LiquidRecord>, StationError> {
        let mut records = Vec::new();
        for (position, volume) in (1u32..).zip(volumes.iter().copied()) {
            if volume <= 0.0 {
                continue;
            }
            let tip = tips.take()?;
            info!(beaker = position, volume_ml = volume, tip, "aspirating");

            self.arm_at(REG_BEAKER, Rack::Liquid, position, PROG_BEAKER_OPEN)?;
            let tip_physical = Rack::Tip.physical(tip)?;
            {
                let mut arm = acquire(&self.arm);
                arm.set_b(REG_TIP, tip_physical)
                    .and_then(|_| arm.run_named_program(PROG_PICK_TIP))
                    .and_then(|_| arm.set_d(REG_VOLUME, volume))
                    .and_then(|_| arm.run_named_program(PROG_ASPIRATE))
                    .map_err(step_error(PROG_ASPIRATE))?;
            }
            let real_time = self.live_weight();
            self.sleeper.sleep(self.settings.aspirate_settle);
            acquire(&self.arm)
                .run_named_program(PROG_REMOVE_TIP)
                .map_err(step_error(PROG_REMOVE_TIP))?;
            self.arm_at(REG_BEAKER, Rack::Liquid, position, PROG_BEAKER_BACK)?;

            records.push(LiquidRecord {
                position,
                volume,
                tip,
                real_time,
            });
        }
        Ok(records)
    }
}
