//! lims-devices: drivers for the physical station hardware.
//!
//! - [`balance`]: the Modbus-style serial balance / powder dispenser.
//! - [`arm`]: the robot arm JSON-RPC client and its program state machine.
//! - [`registry`]: the explicitly-owned handles an orchestrator is built from.
//! - [`retry`]: bounded retry policies and injectable sleeping, so timing
//!   behavior can be tested without real sleeps.
//!
//! All drivers are blocking; async callers run them on a blocking thread.

pub mod arm;
pub mod balance;
pub mod error;
pub mod registry;
pub mod retry;
pub mod serial;
pub mod testing;

pub use arm::{ArmConfig, ArmDriver, ArmReply, RobotArm};
pub use balance::{Balance, BalanceConfig, PowderBalance};
pub use error::DeviceError;
pub use registry::{DeviceRegistry, SharedArm, SharedBalance};
pub use retry::{CancelFlag, NoSleep, RetryPolicy, Sleeper, ThreadSleeper};
