//! Robot arm controller client (newline-delimited JSON-RPC over TCP).
//!
//! The driver never reconnects on its own: a fatal socket error drops the
//! connection and every later command fails until the caller invokes
//! [`ArmDriver::connect`] again. Timeouts keep the connection open.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use lims_protocol::{JbiState, RobotMode};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::DeviceError;
use crate::retry::{RetryPolicy, Sleeper};

const DEVICE: &str = "arm";
const MAX_REPLY_BYTES: usize = 64 * 1024;

// ──────────────────────────────────────────────
// Transport
// ──────────────────────────────────────────────

/// One request/response exchange with the controller.
pub trait ArmLink: Send {
    /// Send one newline-terminated request and return the raw reply bytes.
    /// `ErrorKind::TimedOut` / `WouldBlock` mean the peer may still be alive.
    fn exchange(&mut self, request: &[u8]) -> std::io::Result<Vec<u8>>;
}

/// Opens links to the controller.
pub trait ArmConnector: Send {
    fn connect(&self) -> std::io::Result<Box<dyn ArmLink>>;
}

pub struct TcpArmLink {
    stream: TcpStream,
}

impl ArmLink for TcpArmLink {
    fn exchange(&mut self, request: &[u8]) -> std::io::Result<Vec<u8>> {
        self.stream.write_all(request)?;
        let mut reply = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Err(std::io::Error::new(
                    ErrorKind::ConnectionReset,
                    "connection closed by peer",
                ));
            }
            reply.extend_from_slice(&chunk[..n]);
            let complete = reply.ends_with(b"\n")
                || serde_json::from_slice::<Value>(&reply).is_ok()
                || reply.len() >= MAX_REPLY_BYTES;
            if complete {
                return Ok(reply);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TcpArmConnector {
    pub address: String,
    pub timeout: Duration,
}

impl ArmConnector for TcpArmConnector {
    fn connect(&self) -> std::io::Result<Box<dyn ArmLink>> {
        let addr: SocketAddr = self
            .address
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "arm address did not resolve"))?;
        let stream = TcpStream::connect_timeout(&addr, self.timeout)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        Ok(Box::new(TcpArmLink { stream }))
    }
}

// ──────────────────────────────────────────────
// Driver
// ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ArmConfig {
    /// `host:port` of the controller; the JSON-RPC port is 8055.
    pub address: String,
    pub timeout: Duration,
    /// Checks for the program file before giving up.
    pub program_lookup: RetryPolicy,
    /// Interval between run-state / mode polls.
    pub poll_interval: Duration,
    /// Consecutive failed state queries tolerated while a program runs.
    pub max_state_failures: u32,
    /// Operator recovery cycles allowed for one program run.
    pub max_recovery_cycles: u32,
}

impl Default for ArmConfig {
    fn default() -> Self {
        Self {
            address: "192.168.58.210:8055".to_string(),
            timeout: Duration::from_secs(5),
            program_lookup: RetryPolicy::fixed(10, Duration::ZERO),
            poll_interval: Duration::from_secs(1),
            max_state_failures: 30,
            max_recovery_cycles: 3,
        }
    }
}

/// Outcome of one JSON-RPC call.
#[derive(Debug, Clone, PartialEq)]
pub struct ArmReply {
    pub success: bool,
    /// The `result` on success, otherwise the controller error or a description.
    pub result: Value,
    pub id: Option<u64>,
}

impl ArmReply {
    fn failure(detail: impl Into<String>, id: Option<u64>) -> Self {
        Self {
            success: false,
            result: Value::String(detail.into()),
            id,
        }
    }
}

/// Controllers report booleans as `1`, `true` or `"true"`.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64() == Some(1),
        Value::String(s) => s.eq_ignore_ascii_case("true") || s == "1",
        _ => false,
    }
}

/// What an orchestrator needs from a robot arm.
pub trait RobotArm: Send {
    fn is_connected(&mut self) -> bool;
    fn set_b(&mut self, addr: u32, value: i64) -> Result<(), DeviceError>;
    fn set_d(&mut self, addr: u32, value: f64) -> Result<(), DeviceError>;
    fn get_b(&mut self, addr: u32) -> Result<i64, DeviceError>;
    fn run_named_program(&mut self, name: &str) -> Result<(), DeviceError>;
    fn get_servo_status(&mut self) -> Option<bool>;
    fn get_robot_mode(&mut self) -> Option<RobotMode>;
}

pub struct ArmDriver {
    config: ArmConfig,
    connector: Box<dyn ArmConnector>,
    link: Option<Box<dyn ArmLink>>,
    sleeper: Arc<dyn Sleeper>,
    next_id: u64,
}

/// Phases of one program run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Lookup,
    Launch,
    Monitor,
    /// Error seen: wait for the operator to take the arm out of remote mode.
    AwaitLeaveRemote,
    /// Wait for the operator to finish in teach mode.
    AwaitLeaveTeach,
    /// Wait for remote mode to return before retrying.
    AwaitRemote,
}

impl ArmDriver {
    pub fn new(config: ArmConfig, sleeper: Arc<dyn Sleeper>) -> Self {
        let connector = TcpArmConnector {
            address: config.address.clone(),
            timeout: config.timeout,
        };
        Self::with_connector(config, Box::new(connector), sleeper)
    }

    pub fn with_connector(config: ArmConfig, connector: Box<dyn ArmConnector>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            config,
            connector,
            link: None,
            sleeper,
            next_id: 1,
        }
    }

    /// (Re)open the connection. Any existing link is dropped first.
    pub fn connect(&mut self) -> bool {
        self.disconnect();
        match self.connector.connect() {
            Ok(link) => {
                info!(address = %self.config.address, "arm connected");
                self.link = Some(link);
                true
            }
            Err(e) => {
                warn!(address = %self.config.address, error = %e, "arm connection failed");
                false
            }
        }
    }

    pub fn disconnect(&mut self) {
        if self.link.take().is_some() {
            info!(address = %self.config.address, "arm disconnected");
        }
    }

    pub fn has_link(&self) -> bool {
        self.link.is_some()
    }

    /// One correlated request/response.
    pub fn send_command(&mut self, method: &str, params: Value) -> ArmReply {
        let Some(link) = self.link.as_mut() else {
            return ArmReply::failure("Socket not connected", None);
        };
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);

        let request = json!({
            "method": method,
            "params": params,
            "jsonrpc": "2.0",
            "id": id,
        });
        let mut bytes = request.to_string().into_bytes();
        bytes.push(b'\n');

        let raw = match link.exchange(&bytes) {
            Ok(raw) => raw,
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                warn!(method, error = %e, "arm command timed out");
                return ArmReply::failure(e.to_string(), None);
            }
            Err(e) => {
                warn!(method, error = %e, "arm connection lost");
                self.disconnect();
                return ArmReply::failure(e.to_string(), None);
            }
        };

        let reply: Value = match serde_json::from_slice(&raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(method, reply = %String::from_utf8_lossy(&raw), error = %e, "undecodable arm reply");
                return ArmReply::failure(e.to_string(), None);
            }
        };
        let reply_id = reply.get("id").and_then(Value::as_u64);
        if reply_id.is_some_and(|rid| rid != id) {
            warn!(method, expected = id, received = ?reply_id, "arm reply id mismatch");
            return ArmReply::failure("reply id mismatch", reply_id);
        }

        match reply.get("result") {
            Some(result) => {
                debug!(method, result = %result, "arm reply");
                ArmReply {
                    success: true,
                    result: decode_nested(result),
                    id: reply_id,
                }
            }
            None => ArmReply {
                success: false,
                result: reply.get("error").cloned().unwrap_or_else(|| json!("Unknown error")),
                id: reply_id,
            },
        }
    }

    fn call(&mut self, method: &str, params: Value) -> Result<Value, DeviceError> {
        let reply = self.send_command(method, params);
        if reply.success {
            Ok(reply.result)
        } else if !self.has_link() {
            Err(DeviceError::NotConnected { device: DEVICE })
        } else {
            Err(DeviceError::Rejected {
                operation: method.to_string(),
                detail: reply.result.to_string(),
            })
        }
    }

    pub fn enable_servo(&mut self, enable: bool) -> bool {
        let reply = self.send_command("set_servo_status", json!({ "status": i32::from(enable) }));
        let ok = reply.success && is_truthy(&reply.result);
        if !ok {
            warn!(enable, result = %reply.result, "servo change refused");
        }
        ok
    }

    /// `Some(enabled)` when the query succeeded.
    pub fn get_servo_status(&mut self) -> Option<bool> {
        let reply = self.send_command("getServoStatus", json!({}));
        reply.success.then(|| is_truthy(&reply.result))
    }

    /// Liveness: the servo query succeeded and reports enabled.
    pub fn is_connected(&mut self) -> bool {
        self.get_servo_status() == Some(true)
    }

    pub fn get_robot_mode(&mut self) -> Option<RobotMode> {
        let reply = self.send_command("getRobotMode", json!({}));
        if !reply.success {
            return None;
        }
        reply.result.as_i64().and_then(RobotMode::from_code)
    }

    /// Alias kept for callers that think in run modes.
    pub fn get_run_mode(&mut self) -> Option<RobotMode> {
        self.get_robot_mode()
    }

    /// Accepts `{"runState": n}` or a bare integer.
    pub fn get_jbi_state(&mut self) -> Option<JbiState> {
        let reply = self.send_command("getJbiState", json!({}));
        if !reply.success {
            return None;
        }
        let code = match &reply.result {
            Value::Object(map) => map.get("runState").and_then(Value::as_i64),
            other => other.as_i64(),
        };
        code.and_then(JbiState::from_code)
    }

    pub fn program_exists(&mut self, name: &str) -> bool {
        let reply = self.send_command("checkJbiExist", json!({ "filename": name }));
        reply.success && reply.result.as_i64() == Some(1)
    }

    pub fn set_b(&mut self, addr: u32, value: i64) -> Result<(), DeviceError> {
        self.call("setSysVarB", json!({ "addr": addr, "value": value })).map(drop)
    }

    pub fn set_d(&mut self, addr: u32, value: f64) -> Result<(), DeviceError> {
        self.call("setSysVarD", json!({ "addr": addr, "value": value })).map(drop)
    }

    pub fn get_b(&mut self, addr: u32) -> Result<i64, DeviceError> {
        let value = self.call("getSysVarB", json!({ "addr": addr }))?;
        value.as_i64().ok_or_else(|| DeviceError::Rejected {
            operation: "getSysVarB".to_string(),
            detail: value.to_string(),
        })
    }

    /// Run a jbi program to completion.
    ///
    /// The program must exist (checked up to `program_lookup` times). Once
    /// launched the run state is polled until `stopped`. An `error` state
    /// waits for the operator to cycle the controller out of remote mode,
    /// through teach mode and back to remote, then relaunches the same
    /// program. At most `max_recovery_cycles` relaunches are attempted.
    pub fn run_named_program(&mut self, name: &str) -> Result<(), DeviceError> {
        let mut phase = Phase::Lookup;
        let mut recovery_cycles = 0u32;
        let mut state_failures = 0u32;
        let interval = self.config.poll_interval;

        loop {
            if self.sleeper.is_cancelled() && phase != Phase::Monitor {
                return Err(DeviceError::Cancelled);
            }
            phase = match phase {
                Phase::Lookup => {
                    let lookup = self.config.program_lookup;
                    let sleeper = Arc::clone(&self.sleeper);
                    let found = lookup
                        .poll(sleeper.as_ref(), || self.program_exists(name).then_some(()))
                        .is_some();
                    if !found {
                        warn!(program = name, "program file not found");
                        return Err(DeviceError::ProgramMissing(name.to_string()));
                    }
                    Phase::Launch
                }
                Phase::Launch => {
                    self.call("runJbi", json!({ "filename": name }))?;
                    info!(program = name, "program launched");
                    state_failures = 0;
                    Phase::Monitor
                }
                Phase::Monitor => {
                    self.sleeper.sleep(interval);
                    match self.get_jbi_state() {
                        Some(JbiState::Stopped) => {
                            info!(program = name, "program finished");
                            return Ok(());
                        }
                        Some(JbiState::Error) => {
                            warn!(program = name, "program entered error state, waiting for operator recovery");
                            Phase::AwaitLeaveRemote
                        }
                        Some(_) => {
                            state_failures = 0;
                            Phase::Monitor
                        }
                        None => {
                            state_failures += 1;
                            if state_failures >= self.config.max_state_failures {
                                return Err(DeviceError::Timeout {
                                    device: DEVICE,
                                    operation: format!("run state of {name}"),
                                });
                            }
                            Phase::Monitor
                        }
                    }
                }
                Phase::AwaitLeaveRemote => {
                    self.wait_for_mode(|mode| mode != RobotMode::Remote)?;
                    Phase::AwaitLeaveTeach
                }
                Phase::AwaitLeaveTeach => {
                    self.wait_for_mode(|mode| mode != RobotMode::Teach)?;
                    Phase::AwaitRemote
                }
                Phase::AwaitRemote => {
                    self.wait_for_mode(|mode| mode == RobotMode::Remote)?;
                    recovery_cycles += 1;
                    if recovery_cycles > self.config.max_recovery_cycles {
                        return Err(DeviceError::RecoveryExhausted {
                            program: name.to_string(),
                            cycles: recovery_cycles - 1,
                        });
                    }
                    info!(program = name, cycle = recovery_cycles, "operator recovery complete, relaunching");
                    Phase::Lookup
                }
            };
        }
    }

    /// Block until the robot mode satisfies `ready`. Waiting on the operator
    /// has no wall-clock bound, but a controller that stops answering does.
    fn wait_for_mode(&mut self, ready: impl Fn(RobotMode) -> bool) -> Result<(), DeviceError> {
        let mut failures = 0u32;
        loop {
            match self.get_robot_mode() {
                Some(mode) if ready(mode) => return Ok(()),
                Some(_) => failures = 0,
                None => {
                    failures += 1;
                    if failures >= self.config.max_state_failures {
                        return Err(DeviceError::Timeout {
                            device: DEVICE,
                            operation: "robot mode".to_string(),
                        });
                    }
                }
            }
            if !self.sleeper.sleep(self.config.poll_interval) {
                return Err(DeviceError::Cancelled);
            }
        }
    }
}

/// Results sometimes arrive JSON-encoded inside a string; decode once more
/// when that parses, otherwise keep the string.
fn decode_nested(result: &Value) -> Value {
    match result {
        Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| result.clone()),
        other => other.clone(),
    }
}

impl RobotArm for ArmDriver {
    fn is_connected(&mut self) -> bool {
        ArmDriver::is_connected(self)
    }

    fn set_b(&mut self, addr: u32, value: i64) -> Result<(), DeviceError> {
        ArmDriver::set_b(self, addr, value)
    }

    fn set_d(&mut self, addr: u32, value: f64) -> Result<(), DeviceError> {
        ArmDriver::set_d(self, addr, value)
    }

    fn get_b(&mut self, addr: u32) -> Result<i64, DeviceError> {
        ArmDriver::get_b(self, addr)
    }

    fn run_named_program(&mut self, name: &str) -> Result<(), DeviceError> {
        ArmDriver::run_named_program(self, name)
    }

    fn get_servo_status(&mut self) -> Option<bool> {
        ArmDriver::get_servo_status(self)
    }

    fn get_robot_mode(&mut self) -> Option<RobotMode> {
        ArmDriver::get_robot_mode(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::NoSleep;
    use crate::testing::SimulatedArm;

    fn driver(sim: &SimulatedArm) -> ArmDriver {
        let mut arm = ArmDriver::with_connector(ArmConfig::default(), Box::new(sim.clone()), Arc::new(NoSleep));
        assert!(arm.connect());
        arm
    }

    #[test]
    fn truthy_encodings() {
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!("true")));
        assert!(is_truthy(&json!("TRUE")));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("false")));
        assert!(!is_truthy(&json!(null)));
    }

    #[test]
    fn double_encoded_result_is_decoded() {
        assert_eq!(decode_nested(&json!("{\"runState\": 3}")), json!({"runState": 3}));
        assert_eq!(decode_nested(&json!("not json")), json!("not json"));
        assert_eq!(decode_nested(&json!(7)), json!(7));
    }

    #[test]
    fn commands_without_connection_fail() {
        let sim = SimulatedArm::new();
        let mut arm = ArmDriver::with_connector(ArmConfig::default(), Box::new(sim), Arc::new(NoSleep));
        let reply = arm.send_command("getServoStatus", json!({}));
        assert!(!reply.success);
        assert_eq!(reply.result, json!("Socket not connected"));
        assert!(!arm.is_connected());
    }

    #[test]
    fn servo_status_drives_liveness() {
        let sim = SimulatedArm::new();
        let mut arm = driver(&sim);
        assert!(arm.is_connected());
        sim.set_servo_enabled(false);
        assert!(!arm.is_connected());
        assert_eq!(arm.get_servo_status(), Some(false));
    }

    #[test]
    fn timeout_keeps_connection_reset_drops_it() {
        let sim = SimulatedArm::new();
        let mut arm = driver(&sim);

        sim.fail_next(ErrorKind::TimedOut);
        assert!(!arm.send_command("getRobotMode", json!({})).success);
        assert!(arm.has_link());

        sim.fail_next(ErrorKind::ConnectionReset);
        assert!(!arm.send_command("getRobotMode", json!({})).success);
        assert!(!arm.has_link());

        // No silent reconnect.
        assert!(!arm.send_command("getRobotMode", json!({})).success);
        assert!(arm.connect());
        assert_eq!(arm.get_robot_mode(), Some(RobotMode::Remote));
    }

    #[test]
    fn registers_round_trip_through_controller() {
        let sim = SimulatedArm::new();
        let mut arm = driver(&sim);
        arm.set_b(24, 13).unwrap();
        arm.set_d(11, 2.5).unwrap();
        assert_eq!(arm.get_b(24).unwrap(), 13);
        assert_eq!(sim.d_register(11), Some(2.5));
    }

    #[test]
    fn program_runs_until_stopped() {
        let sim = SimulatedArm::new();
        sim.add_program("guticl_pick_tip", vec![JbiState::Running, JbiState::Running, JbiState::Stopped]);
        let mut arm = driver(&sim);
        arm.run_named_program("guticl_pick_tip").unwrap();
        assert_eq!(sim.launches("guticl_pick_tip"), 1);
    }

    #[test]
    fn missing_program_fails_after_bounded_lookups() {
        let sim = SimulatedArm::new();
        let mut arm = driver(&sim);
        assert!(matches!(
            arm.run_named_program("nope"),
            Err(DeviceError::ProgramMissing(name)) if name == "nope"
        ));
        assert_eq!(sim.calls("checkJbiExist"), 10);
        assert_eq!(sim.calls("runJbi"), 0);
    }

    #[test]
    fn error_state_waits_for_operator_cycle_then_relaunches() {
        let sim = SimulatedArm::new();
        sim.add_program("kb_to_gcms", vec![JbiState::Running, JbiState::Error]);
        sim.add_program_run("kb_to_gcms", vec![JbiState::Stopped]);
        sim.script_modes(vec![
            RobotMode::Remote,
            RobotMode::Remote,
            RobotMode::Teach,
            RobotMode::Teach,
            RobotMode::Auto,
            RobotMode::Remote,
        ]);
        let mut arm = driver(&sim);
        arm.run_named_program("kb_to_gcms").unwrap();
        assert_eq!(sim.launches("kb_to_gcms"), 2);
    }

    #[test]
    fn recovery_cycles_are_bounded() {
        let sim = SimulatedArm::new();
        for _ in 0..10 {
            sim.add_program_run("gc_drop", vec![JbiState::Error]);
        }
        sim.script_modes(
            std::iter::repeat([RobotMode::Teach, RobotMode::Remote])
                .take(20)
                .flatten()
                .collect(),
        );
        let config = ArmConfig {
            max_recovery_cycles: 2,
            ..ArmConfig::default()
        };
        let mut arm = ArmDriver::with_connector(config, Box::new(sim.clone()), Arc::new(NoSleep));
        assert!(arm.connect());
        assert!(matches!(
            arm.run_named_program("gc_drop"),
            Err(DeviceError::RecoveryExhausted { cycles: 2, .. })
        ));
        assert_eq!(sim.launches("gc_drop"), 3);
    }
}
