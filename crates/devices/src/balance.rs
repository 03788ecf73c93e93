//! Serial balance / powder dispenser.
//!
//! Half-duplex request/response over a [`SerialLink`]: every operation
//! writes one CRC-framed command and polls for the reply a bounded number
//! of times. [`Balance::send_and_receive`] is the only place the driver
//! touches the port.

use std::sync::Arc;
use std::time::Duration;

use lims_protocol::frame::{self, register, DISPENSE_COMPLETE_STATUS, RESET_MAGIC};
use lims_protocol::{BottleHeight, DispenseMode, DispenseRequest, DispenseResult};
use tracing::{debug, info, warn};

use crate::error::DeviceError;
use crate::retry::{RetryPolicy, Sleeper};
use crate::serial::{SerialLink, SerialPortLink};

const DEVICE: &str = "balance";

#[derive(Debug, Clone)]
pub struct BalanceConfig {
    pub port: String,
    pub baud: u32,
    pub read_timeout: Duration,
    /// Polls for a reply after each write.
    pub reply_poll: RetryPolicy,
    /// Attempts for a weight read.
    pub weight_retry: RetryPolicy,
    /// Pause after every command so the device can act on it.
    pub command_settle: Duration,
    /// Status polls while waiting for a dispense cycle to finish.
    pub dispense_poll: RetryPolicy,
    /// Wait after resetting the sampler at the end of a cycle.
    pub sampler_settle: Duration,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            port: "COM21".to_string(),
            baud: 115_200,
            read_timeout: Duration::from_millis(100),
            reply_poll: RetryPolicy::fixed(9, Duration::from_millis(100)),
            weight_retry: RetryPolicy::fixed(3, Duration::from_millis(500)),
            command_settle: Duration::from_millis(500),
            dispense_poll: RetryPolicy::fixed(6_000, Duration::from_millis(100)),
            sampler_settle: Duration::from_secs(35),
        }
    }
}

/// What an orchestrator needs from a balance.
pub trait PowderBalance: Send {
    /// Liveness probe: a status read that gets any reply.
    fn is_connected(&mut self) -> bool;

    fn open_baffle(&mut self) -> Result<(), DeviceError>;

    /// Run one full dispense cycle.
    fn dispense(&mut self, request: &DispenseRequest) -> DispenseResult;

    fn try_read_live_weight(&mut self) -> Result<f64, DeviceError>;
}

pub struct Balance {
    config: BalanceConfig,
    link: Option<Box<dyn SerialLink>>,
    sleeper: Arc<dyn Sleeper>,
}

impl Balance {
    /// A balance that will open `config.port` on [`Balance::open`].
    pub fn new(config: BalanceConfig, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            config,
            link: None,
            sleeper,
        }
    }

    /// A balance over an already-open link.
    pub fn with_link(config: BalanceConfig, link: Box<dyn SerialLink>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            config,
            link: Some(link),
            sleeper,
        }
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    /// Open the configured port. A no-op when already open; failures are
    /// logged and reported as `false`.
    pub fn open(&mut self) -> bool {
        if self.link.is_some() {
            return true;
        }
        match SerialPortLink::open(&self.config.port, self.config.baud, self.config.read_timeout) {
            Ok(link) => {
                info!(port = %self.config.port, baud = self.config.baud, "balance port opened");
                self.link = Some(Box::new(link));
                true
            }
            Err(e) => {
                warn!(port = %self.config.port, error = %e, "failed to open balance port");
                false
            }
        }
    }

    pub fn close(&mut self) {
        if self.link.take().is_some() {
            info!(port = %self.config.port, "balance port closed");
        }
    }

    /// Write `frame` and wait for the reply bytes.
    pub fn send_and_receive(&mut self, frame: &[u8]) -> Result<Vec<u8>, DeviceError> {
        self.exchange("send_and_receive", frame)
    }

    fn exchange(&mut self, operation: &str, frame: &[u8]) -> Result<Vec<u8>, DeviceError> {
        let io = |source| DeviceError::Io {
            device: DEVICE,
            source,
        };
        let link = self
            .link
            .as_mut()
            .ok_or(DeviceError::NotConnected { device: DEVICE })?;
        link.clear_input().map_err(io)?;
        link.write_frame(frame).map_err(io)?;

        let reply = self.config.reply_poll.poll(self.sleeper.as_ref(), || {
            match link.bytes_waiting() {
                Ok(0) => None,
                Ok(n) => Some(link.read_waiting(n)),
                Err(e) => Some(Err(e)),
            }
        });
        match reply {
            Some(Ok(bytes)) => {
                debug!(operation, sent = %hex::encode(frame), received = %hex::encode(&bytes), "balance exchange");
                Ok(bytes)
            }
            Some(Err(e)) => Err(io(e)),
            None => Err(DeviceError::Timeout {
                device: DEVICE,
                operation: operation.to_string(),
            }),
        }
    }

    /// Send a command, then give the device time to act on it.
    fn command(&mut self, operation: &str, frame: &[u8]) -> Result<Vec<u8>, DeviceError> {
        let reply = self.exchange(operation, frame);
        self.sleeper.sleep(self.config.command_settle);
        if let Err(e) = &reply {
            warn!(operation, error = %e, "balance command failed");
        }
        reply
    }

    // ── Register operations ─────────────────────────────────────────

    pub fn read_status(&mut self) -> Result<Vec<u8>, DeviceError> {
        self.exchange("read_status", &frame::read_registers(register::STATUS, 1))
    }

    pub fn open_baffle(&mut self) -> Result<(), DeviceError> {
        self.command("open_baffle", &frame::write_register(register::BAFFLE, 1))
            .map(drop)
    }

    pub fn close_baffle(&mut self) -> Result<(), DeviceError> {
        self.command("close_baffle", &frame::write_register(register::BAFFLE, 0))
            .map(drop)
    }

    pub fn start_dispense(&mut self) -> Result<(), DeviceError> {
        self.exchange("start_dispense", &frame::write_register(register::DISPENSE, 1))
            .map(drop)
    }

    pub fn pause_dispense(&mut self) -> Result<(), DeviceError> {
        self.command("pause_dispense", &frame::write_register(register::DISPENSE, 2))
            .map(drop)
    }

    pub fn reset_balance(&mut self) -> Result<(), DeviceError> {
        self.command("reset_balance", &frame::write_register(register::BALANCE_RESET, RESET_MAGIC))
            .map(drop)
    }

    pub fn reset_sampler(&mut self) -> Result<(), DeviceError> {
        self.command("reset_sampler", &frame::write_register(register::SAMPLER_RESET, RESET_MAGIC))
            .map(drop)
    }

    pub fn set_mode(&mut self, mode: DispenseMode) -> Result<(), DeviceError> {
        self.command("set_mode", &frame::write_register(register::MODE, mode.register_value()))
            .map(drop)
    }

    pub fn set_bottle_height(&mut self, height: BottleHeight) -> Result<(), DeviceError> {
        self.command(
            "set_bottle_height",
            &frame::write_register(register::BOTTLE_HEIGHT, height.register_value()),
        )
        .map(drop)
    }

    /// Write the target mass. The device must acknowledge the multi-register write.
    pub fn set_target_weight(&mut self, target_mg: f64) -> Result<(), DeviceError> {
        let raw = frame::mg_to_micrograms(target_mg);
        let reply = self.command(
            "set_target_weight",
            &frame::write_u32(register::TARGET_WEIGHT, raw),
        )?;
        if frame::is_write_multiple_ack(&reply) {
            Ok(())
        } else {
            Err(DeviceError::Rejected {
                operation: "set_target_weight".to_string(),
                detail: hex::encode(reply),
            })
        }
    }

    /// Poll the status register until it reports a finished cycle.
    pub fn wait_for_dispense_complete(&mut self) -> Result<(), DeviceError> {
        let policy = self.config.dispense_poll;
        let sleeper = Arc::clone(&self.sleeper);
        let done = policy.poll(sleeper.as_ref(), || match self.read_status() {
            Ok(status) if status == DISPENSE_COMPLETE_STATUS => Some(()),
            _ => None,
        });
        match done {
            Some(()) => Ok(()),
            None if sleeper.is_cancelled() => Err(DeviceError::Cancelled),
            None => Err(DeviceError::Timeout {
                device: DEVICE,
                operation: "dispense completion".to_string(),
            }),
        }
    }

    fn read_weight(&mut self, operation: &str, reg: u16) -> Result<f64, DeviceError> {
        let request = frame::read_registers(reg, 2);
        let policy = self.config.weight_retry;
        let sleeper = Arc::clone(&self.sleeper);
        let reply = policy.retry(sleeper.as_ref(), |_| self.exchange(operation, &request))?;
        match frame::decode_i32_reply(&reply) {
            Ok(raw) => Ok(frame::micrograms_to_mg(raw)),
            Err(source) => {
                warn!(operation, reply = %hex::encode(&reply), error = %source, "rejected balance reply");
                Err(DeviceError::Frame {
                    operation: operation.to_string(),
                    source,
                })
            }
        }
    }

    /// Current mass on the pan in mg.
    pub fn try_read_live_weight(&mut self) -> Result<f64, DeviceError> {
        self.read_weight("read_live_weight", register::LIVE_WEIGHT)
    }

    /// Current mass in mg, or `0.0` when the reading failed.
    ///
    /// A zero here is ambiguous; prefer [`Balance::try_read_live_weight`].
    pub fn read_live_weight(&mut self) -> f64 {
        self.try_read_live_weight().unwrap_or(0.0)
    }

    /// Mass recorded by the dispenser for the last cycle, in mg.
    pub fn read_final_weight(&mut self) -> Result<f64, DeviceError> {
        self.read_weight("read_final_weight", register::FINAL_WEIGHT)
    }

    // ── Dispense cycle ──────────────────────────────────────────────

    /// Dispense `target_mg` using a bottle height given by name
    /// (`"5ml"`, `"15ml"` or `"20ml"`). Unknown heights fail without
    /// touching the device.
    pub fn dispense_to_target(&mut self, target_mg: f64, mode: DispenseMode, bottle_height: &str) -> DispenseResult {
        match bottle_height.parse::<BottleHeight>() {
            Ok(bottle_height) => self.dispense(&DispenseRequest {
                target_mass_mg: target_mg,
                mode,
                bottle_height,
            }),
            Err(e) => DispenseResult::failed(target_mg, e.to_string()),
        }
    }

    /// reset → mode → bottle height → target → trigger → wait → read → reset sampler.
    ///
    /// Failures before the trigger abort with `success = false`. After the
    /// trigger the final weight is still read and reported, even when a
    /// later step fails.
    pub fn dispense(&mut self, request: &DispenseRequest) -> DispenseResult {
        let target = request.target_mass_mg;
        if !target.is_finite() || target <= 0.0 {
            return DispenseResult::failed(target, format!("invalid target mass {target}"));
        }

        let prepared = self
            .reset_balance()
            .map_err(|e| format!("reset balance: {e}"))
            .and_then(|_| self.set_mode(request.mode).map_err(|e| format!("set mode: {e}")))
            .and_then(|_| {
                self.set_bottle_height(request.bottle_height)
                    .map_err(|e| format!("set bottle height: {e}"))
            })
            .and_then(|_| {
                self.set_target_weight(target)
                    .map_err(|e| format!("set target weight: {e}"))
            })
            .and_then(|_| self.start_dispense().map_err(|e| format!("start dispense: {e}")));
        if let Err(error) = prepared {
            warn!(target_mg = target, %error, "dispense aborted before trigger");
            return DispenseResult::failed(target, error);
        }

        info!(target_mg = target, mode = ?request.mode, "dispensing");
        let completion = self.wait_for_dispense_complete();
        let actual = match self.read_final_weight() {
            Ok(actual) => actual,
            Err(e) => {
                let error = match completion {
                    Err(c) => format!("dispense did not complete: {c}; final weight unreadable: {e}"),
                    Ok(()) => format!("final weight unreadable: {e}"),
                };
                return DispenseResult::failed(target, error);
            }
        };

        let reset = self.reset_sampler();
        self.sleeper.sleep(self.config.sampler_settle);

        let mut result = DispenseResult::measured(target, actual);
        let error = match (completion, reset) {
            (Err(e), _) => Some(format!("dispense did not complete: {e}")),
            (Ok(()), Err(e)) => Some(format!("reset sampler: {e}")),
            (Ok(()), Ok(())) => None,
        };
        if let Some(error) = error {
            result.success = false;
            result.error = Some(error);
        }
        info!(
            target_mg = result.target_mg,
            actual_mg = result.actual_mg,
            deviation_mg = result.deviation_mg,
            deviation_percent = result.deviation_percent,
            success = result.success,
            "dispense finished"
        );
        result
    }
}

impl PowderBalance for Balance {
    fn is_connected(&mut self) -> bool {
        self.read_status().is_ok()
    }

    fn open_baffle(&mut self) -> Result<(), DeviceError> {
        Balance::open_baffle(self)
    }

    fn dispense(&mut self, request: &DispenseRequest) -> DispenseResult {
        Balance::dispense(self, request)
    }

    fn try_read_live_weight(&mut self) -> Result<f64, DeviceError> {
        Balance::try_read_live_weight(self)
    }
}
