//! In-memory stand-ins for the station hardware.
//!
//! [`SimulatedBalancePort`] answers balance frames the way the real
//! dispenser does; [`SimulatedArm`] plays the arm controller. Both are
//! cheap to clone and share state, so a test keeps one handle for
//! inspection while the driver owns the other.

use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::sync::{Arc, Mutex, MutexGuard};

use lims_protocol::frame::{register, DISPENSE_COMPLETE_STATUS, READ_HOLDING, WRITE_MULTIPLE, WRITE_SINGLE};
use lims_protocol::{append_checksum, verify, JbiState, RobotMode};
use serde_json::{json, Value};

use crate::arm::{ArmConnector, ArmLink};
use crate::serial::SerialLink;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ──────────────────────────────────────────────
// Balance
// ──────────────────────────────────────────────

#[derive(Debug, Default)]
struct BalanceState {
    pending: Vec<u8>,
    silent: bool,
    override_reply: Option<Vec<u8>>,
    live_weight_ug: i32,
    final_weight_ug: i32,
    target_ug: Option<u32>,
    /// Target writes still to be rejected; `u32::MAX` rejects forever.
    reject_targets: u32,
    dispensing: bool,
    status_polls_until_complete: u32,
    status_polls: u32,
    frames: Vec<Vec<u8>>,
    polls: u32,
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedBalancePort {
    state: Arc<Mutex<BalanceState>>,
}

impl SimulatedBalancePort {
    pub fn new() -> Self {
        let port = Self::default();
        lock(&port.state).status_polls_until_complete = 1;
        port
    }

    /// Never answer any frame.
    pub fn set_silent(&self, silent: bool) {
        lock(&self.state).silent = silent;
    }

    pub fn set_live_weight_ug(&self, ug: i32) {
        lock(&self.state).live_weight_ug = ug;
    }

    pub fn set_final_weight_ug(&self, ug: i32) {
        lock(&self.state).final_weight_ug = ug;
    }

    /// Status reads after the trigger until the completion pattern appears.
    pub fn set_status_polls_until_complete(&self, polls: u32) {
        lock(&self.state).status_polls_until_complete = polls;
    }

    pub fn set_reject_target(&self, reject: bool) {
        lock(&self.state).reject_targets = if reject { u32::MAX } else { 0 };
    }

    /// Reject only the next `count` target-weight writes.
    pub fn reject_next_targets(&self, count: u32) {
        lock(&self.state).reject_targets = count;
    }

    /// Replace the reply to the next frame.
    pub fn override_next_reply(&self, reply: Vec<u8>) {
        lock(&self.state).override_reply = Some(reply);
    }

    pub fn frames_written(&self) -> usize {
        lock(&self.state).frames.len()
    }

    /// Number of `bytes_waiting` polls so far.
    pub fn polls(&self) -> u32 {
        lock(&self.state).polls
    }

    pub fn target_ug(&self) -> Option<u32> {
        lock(&self.state).target_ug
    }

    /// `(function, register)` for every write frame, in order.
    pub fn written_registers(&self) -> Vec<(u8, u16)> {
        lock(&self.state)
            .frames
            .iter()
            .filter(|f| f.len() >= 4 && (f[1] == WRITE_SINGLE || f[1] == WRITE_MULTIPLE))
            .map(|f| (f[1], u16::from_be_bytes([f[2], f[3]])))
            .collect()
    }
}

impl BalanceState {
    fn weight_reply(ug: i32) -> Vec<u8> {
        let mut body = vec![0x01, READ_HOLDING, 0x04];
        body.extend_from_slice(&ug.to_be_bytes());
        append_checksum(&body)
    }

    fn answer(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        if self.silent || !verify(frame) || frame.len() < 8 {
            return None;
        }
        if let Some(reply) = self.override_reply.take() {
            return Some(reply);
        }
        let reg = u16::from_be_bytes([frame[2], frame[3]]);
        match (frame[1], reg) {
            (READ_HOLDING, register::STATUS) => {
                if self.dispensing {
                    self.status_polls += 1;
                    if self.status_polls >= self.status_polls_until_complete {
                        self.dispensing = false;
                        return Some(DISPENSE_COMPLETE_STATUS.to_vec());
                    }
                }
                Some(append_checksum(&[0x01, READ_HOLDING, 0x02, 0x00, 0x00]))
            }
            (READ_HOLDING, register::LIVE_WEIGHT) => Some(Self::weight_reply(self.live_weight_ug)),
            (READ_HOLDING, register::FINAL_WEIGHT) => Some(Self::weight_reply(self.final_weight_ug)),
            (WRITE_SINGLE, register::DISPENSE) if frame[5] == 0x01 => {
                self.dispensing = true;
                self.status_polls = 0;
                Some(frame.to_vec())
            }
            (WRITE_SINGLE, _) => Some(frame.to_vec()),
            (WRITE_MULTIPLE, register::TARGET_WEIGHT) if frame.len() >= 13 => {
                if self.reject_targets > 0 {
                    if self.reject_targets != u32::MAX {
                        self.reject_targets -= 1;
                    }
                    return Some(append_checksum(&[0x01, 0x90, 0x02]));
                }
                self.target_ug = Some(u32::from_be_bytes([frame[7], frame[8], frame[9], frame[10]]));
                Some(append_checksum(&frame[..6]))
            }
            _ => None,
        }
    }
}

impl SerialLink for SimulatedBalancePort {
    fn clear_input(&mut self) -> std::io::Result<()> {
        lock(&self.state).pending.clear();
        Ok(())
    }

    fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        let mut state = lock(&self.state);
        state.frames.push(frame.to_vec());
        if let Some(reply) = state.answer(frame) {
            state.pending.extend(reply);
        }
        Ok(())
    }

    fn bytes_waiting(&mut self) -> std::io::Result<usize> {
        let mut state = lock(&self.state);
        state.polls += 1;
        Ok(state.pending.len())
    }

    fn read_waiting(&mut self, len: usize) -> std::io::Result<Vec<u8>> {
        let mut state = lock(&self.state);
        let n = len.min(state.pending.len());
        Ok(state.pending.drain(..n).collect())
    }
}

// ──────────────────────────────────────────────
// Arm
// ──────────────────────────────────────────────

#[derive(Debug, Default)]
struct ArmState {
    servo_enabled: bool,
    programs: HashMap<String, VecDeque<Vec<JbiState>>>,
    launches: HashMap<String, u32>,
    current: VecDeque<JbiState>,
    last_state: Option<JbiState>,
    modes: VecDeque<RobotMode>,
    last_mode: Option<RobotMode>,
    b: HashMap<u64, i64>,
    d: HashMap<u64, f64>,
    calls: Vec<String>,
    fail_next: Option<ErrorKind>,
    double_encode: bool,
}

#[derive(Debug, Clone)]
pub struct SimulatedArm {
    state: Arc<Mutex<ArmState>>,
}

impl Default for SimulatedArm {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedArm {
    pub fn new() -> Self {
        let state = ArmState {
            servo_enabled: true,
            ..ArmState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn set_servo_enabled(&self, enabled: bool) {
        lock(&self.state).servo_enabled = enabled;
    }

    /// Register a program whose first run walks through `states`.
    pub fn add_program(&self, name: &str, states: Vec<JbiState>) {
        self.add_program_run(name, states);
    }

    /// Queue the run-state script for the next launch of `name`.
    pub fn add_program_run(&self, name: &str, states: Vec<JbiState>) {
        lock(&self.state)
            .programs
            .entry(name.to_string())
            .or_default()
            .push_back(states);
    }

    /// Programs that finish immediately on every launch.
    pub fn add_instant_programs(&self, names: &[&str]) {
        let mut state = lock(&self.state);
        for name in names {
            state.programs.entry((*name).to_string()).or_default();
        }
    }

    pub fn script_modes(&self, modes: Vec<RobotMode>) {
        lock(&self.state).modes = modes.into();
    }

    pub fn fail_next(&self, kind: ErrorKind) {
        lock(&self.state).fail_next = Some(kind);
    }

    /// Send every result as a JSON-encoded string.
    pub fn set_double_encode(&self, on: bool) {
        lock(&self.state).double_encode = on;
    }

    pub fn launches(&self, name: &str) -> u32 {
        lock(&self.state).launches.get(name).copied().unwrap_or(0)
    }

    pub fn calls(&self, method: &str) -> usize {
        lock(&self.state).calls.iter().filter(|m| *m == method).count()
    }

    /// Programs launched, in order.
    pub fn launch_log(&self) -> Vec<String> {
        lock(&self.state)
            .calls
            .iter()
            .filter_map(|c| c.strip_prefix("runJbi:").map(str::to_string))
            .collect()
    }

    pub fn b_register(&self, addr: u64) -> Option<i64> {
        lock(&self.state).b.get(&addr).copied()
    }

    pub fn d_register(&self, addr: u64) -> Option<f64> {
        lock(&self.state).d.get(&addr).copied()
    }
}

impl ArmState {
    fn dispatch(&mut self, method: &str, params: &Value) -> Value {
        let addr = params.get("addr").and_then(Value::as_u64).unwrap_or_default();
        match method {
            "getServoStatus" => json!(if self.servo_enabled { 1 } else { 0 }),
            "set_servo_status" => {
                self.servo_enabled = params.get("status").and_then(Value::as_i64) == Some(1);
                json!(true)
            }
            "getRobotMode" => {
                let mode = self.modes.pop_front().or(self.last_mode).unwrap_or(RobotMode::Remote);
                self.last_mode = Some(mode);
                json!(match mode {
                    RobotMode::Auto => 0,
                    RobotMode::Teach => 1,
                    RobotMode::Remote => 2,
                })
            }
            "checkJbiExist" => {
                let name = params.get("filename").and_then(Value::as_str).unwrap_or_default();
                json!(if self.programs.contains_key(name) { 1 } else { 0 })
            }
            "runJbi" => {
                let name = params.get("filename").and_then(Value::as_str).unwrap_or_default().to_string();
                self.calls.push(format!("runJbi:{name}"));
                *self.launches.entry(name.clone()).or_default() += 1;
                let script = self
                    .programs
                    .get_mut(&name)
                    .and_then(VecDeque::pop_front)
                    .unwrap_or_else(|| vec![JbiState::Stopped]);
                self.current = script.into();
                self.last_state = None;
                json!(true)
            }
            "getJbiState" => {
                let state = self.current.pop_front().or(self.last_state).unwrap_or(JbiState::Stopped);
                self.last_state = Some(state);
                let code = match state {
                    JbiState::Stopped => 0,
                    JbiState::Paused => 1,
                    JbiState::EmergencyStop => 2,
                    JbiState::Running => 3,
                    JbiState::Error => 4,
                };
                json!({ "runState": code })
            }
            "setSysVarB" => {
                let value = params.get("value").and_then(Value::as_i64).unwrap_or_default();
                self.b.insert(addr, value);
                json!(true)
            }
            "setSysVarD" => {
                let value = params.get("value").and_then(Value::as_f64).unwrap_or_default();
                self.d.insert(addr, value);
                json!(true)
            }
            "getSysVarB" => json!(self.b.get(&addr).copied().unwrap_or_default()),
            _ => Value::Null,
        }
    }
}

impl ArmLink for SimulatedArm {
    fn exchange(&mut self, request: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut state = lock(&self.state);
        if let Some(kind) = state.fail_next.take() {
            return Err(std::io::Error::new(kind, "simulated failure"));
        }
        let request: Value = serde_json::from_slice(request)
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
        let method = request.get("method").and_then(Value::as_str).unwrap_or_default();
        let params = request.get("params").cloned().unwrap_or(Value::Null);
        state.calls.push(method.to_string());
        let mut result = state.dispatch(method, &params);
        if state.double_encode {
            result = Value::String(result.to_string());
        }
        let reply = json!({ "jsonrpc": "2.0", "result": result, "id": request.get("id") });
        let mut bytes = reply.to_string().into_bytes();
        bytes.push(b'\n');
        Ok(bytes)
    }
}

impl ArmConnector for SimulatedArm {
    fn connect(&self) -> std::io::Result<Box<dyn ArmLink>> {
        Ok(Box::new(self.clone()))
    }
}
