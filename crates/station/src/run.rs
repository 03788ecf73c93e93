//! Bookkeeping shared by the analysis procedures: the current stage,
//! progress reporting, cancellable waits and stage-tagged errors.

use std::time::Duration;

use lims_devices::registry::acquire;
use lims_devices::{CancelFlag, DeviceError, SharedArm, Sleeper};
use lims_instruments::InstrumentError;
use lims_protocol::Stage;
use lims_storage::StorageError;

use crate::error::StationError;

/// Receives one call per stage entered, in order.
pub trait ProgressSink {
    fn progress(&mut self, stage: Stage, message: String);
}

impl<F: FnMut(Stage, String)> ProgressSink for F {
    fn progress(&mut self, stage: Stage, message: String) {
        self(stage, message)
    }
}

pub struct RunContext<'a> {
    cancel: &'a CancelFlag,
    sink: &'a mut dyn ProgressSink,
    stage: Stage,
}

impl<'a> RunContext<'a> {
    pub fn new(cancel: &'a CancelFlag, sink: &'a mut dyn ProgressSink) -> Self {
        Self {
            cancel,
            sink,
            stage: Stage::Started,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Move to `stage`. A pending cancellation is honoured here, before the
    /// next stage starts any hardware.
    pub fn enter(&mut self, stage: Stage, message: impl Into<String>) -> Result<(), StationError> {
        if self.cancel.is_cancelled() {
            tracing::warn!(stage = %self.stage, "run cancelled at stage boundary");
            return Err(StationError::Cancelled { stage: self.stage });
        }
        let message = message.into();
        tracing::info!(stage = %stage, %message, "stage");
        self.stage = stage;
        self.sink.progress(stage, message);
        Ok(())
    }

    /// Report the final stage. The result already exists at this point, so
    /// a late cancellation no longer applies.
    pub fn finish(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(stage = %Stage::Finished, %message, "stage");
        self.stage = Stage::Finished;
        self.sink.progress(Stage::Finished, message);
    }

    /// Sleep, waking early if the run is cancelled.
    pub fn wait(&self, duration: Duration) -> Result<(), StationError> {
        if self.cancel.sleep(duration) {
            Ok(())
        } else {
            Err(StationError::Cancelled { stage: self.stage })
        }
    }

    pub fn device(&self, source: DeviceError) -> StationError {
        StationError::Device {
            stage: self.stage,
            source,
        }
    }

    pub fn instrument(&self, source: InstrumentError) -> StationError {
        StationError::Instrument {
            stage: self.stage,
            source,
        }
    }

    pub fn storage(&self, source: StorageError) -> StationError {
        StationError::Storage {
            stage: self.stage,
            source,
        }
    }

    pub fn failed(&self, message: impl Into<String>) -> StationError {
        StationError::Procedure {
            stage: self.stage,
            message: message.into(),
        }
    }
}

/// Point the arm at `bottle` (register B0) and run `programs` in order.
pub(crate) fn run_arm_programs(arm: &SharedArm, bottle: u32, programs: &[&str]) -> Result<(), DeviceError> {
    let mut arm = acquire(arm);
    arm.set_b(0, i64::from(bottle))?;
    for program in programs {
        arm.run_named_program(program)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_are_reported_in_order() {
        let cancel = CancelFlag::new();
        let mut seen = Vec::new();
        let mut sink = |stage: Stage, _msg: String| seen.push(stage);
        let mut ctx = RunContext::new(&cancel, &mut sink);
        ctx.enter(Stage::Started, "a").unwrap();
        ctx.enter(Stage::Preparing, "b").unwrap();
        assert_eq!(ctx.stage(), Stage::Preparing);
        drop(ctx);
        assert_eq!(seen, vec![Stage::Started, Stage::Preparing]);
    }

    #[test]
    fn cancellation_stops_at_next_boundary() {
        let cancel = CancelFlag::new();
        let mut sink = |_: Stage, _: String| {};
        let mut ctx = RunContext::new(&cancel, &mut sink);
        ctx.enter(Stage::Started, "go").unwrap();
        cancel.cancel();
        let err = ctx.enter(Stage::Preparing, "never").unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Started));
        assert!(err.is_cancelled());
        assert!(ctx.wait(Duration::from_secs(60)).is_err());
    }
}
