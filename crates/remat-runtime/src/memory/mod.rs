pub mod manager;
pub mod stages;

use crate::MemoryError;
use crate::driver::{MemoryDriver, PhysicalHandle};
use std::sync::Arc;

/// Obtains and disposes of physical memory handles.
///
/// A producer either creates memory locally through the driver or imports it
/// from elsewhere; it carries its own configuration. `produce` must not leak
/// resources when it fails. `dispose` is called exactly once for every
/// successful `produce`, and only then.
pub trait Producer: Send {
    /// Produces a physical handle.
    fn produce(&mut self, driver: &dyn MemoryDriver) -> Result<PhysicalHandle, MemoryError>;

    /// Disposes of a handle returned by `produce`.
    fn dispose(
        &mut self,
        driver: &dyn MemoryDriver,
        handle: PhysicalHandle,
    ) -> Result<(), MemoryError>;
}

/// One configuration step applied to a produced handle.
///
/// Stages are set up in list order during materialize and torn down in
/// reverse order during release. `teardown` is only called for stages whose
/// `setup` succeeded. A `setup` that performs several driver calls must roll
/// back its own partial work before returning an error; the allocation will
/// not call `teardown` for a failed `setup`.
pub trait MemoryStage: Send {
    /// Configures the handle.
    fn setup(
        &mut self,
        driver: &dyn MemoryDriver,
        handle: PhysicalHandle,
    ) -> Result<(), MemoryError>;

    /// Reverts a successful [`MemoryStage::setup`].
    fn teardown(
        &mut self,
        driver: &dyn MemoryDriver,
        handle: PhysicalHandle,
    ) -> Result<(), MemoryError>;
}

/// The observable state of a [`VirtualAllocation`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// No physical memory is outstanding; the allocation can materialize.
    Released,
    /// Physical memory is produced and every stage is set up.
    Materialized,
    /// A materialize or release stopped partway; only `release` (or drop)
    /// is meaningful now.
    Errored,
}

/// A reversible virtual memory allocation.
///
/// Binds one [`Producer`] and an ordered list of [`MemoryStage`]s, and
/// tracks how far the staged setup has progressed. Materialize is
/// fail-fast: the first error propagates without any teardown, and the
/// progress counter fully describes what is alive. Release is
/// best-effort-complete: every set-up stage is torn down and the handle is
/// disposed even when individual steps fail, so one faulty stage cannot
/// strand resources owned by the others.
///
/// The allocation is not thread-safe; the cohort manager serializes access
/// and only ever moves allocations by value.
pub struct VirtualAllocation {
    driver: Arc<dyn MemoryDriver>,
    producer: Box<dyn Producer>,
    stages: Vec<Box<dyn MemoryStage>>,
    handle: PhysicalHandle,
    /// Stages `[0..progress)` are currently set up.
    progress: usize,
}

impl VirtualAllocation {
    /// Creates an allocation in the [`Status::Released`] state.
    pub fn new(
        driver: Arc<dyn MemoryDriver>,
        producer: Box<dyn Producer>,
        stages: Vec<Box<dyn MemoryStage>>,
    ) -> Self {
        Self {
            driver,
            producer,
            stages,
            handle: 0,
            progress: 0,
        }
    }

    /// The current state, derived from the handle and the progress counter.
    pub fn status(&self) -> Status {
        if self.progress == 0 && self.handle == 0 {
            Status::Released
        } else if self.progress == self.stages.len() && self.handle != 0 {
            Status::Materialized
        } else {
            Status::Errored
        }
    }

    /// The produced physical handle, or zero when none is outstanding.
    pub fn handle(&self) -> PhysicalHandle {
        self.handle
    }

    /// Produces physical memory and sets up every stage in order.
    ///
    /// Stops at the first error and propagates it without tearing anything
    /// down; the allocation is then [`Status::Errored`] and must be released
    /// before it can materialize again.
    pub fn materialize(&mut self) -> Result<(), MemoryError> {
        let status = self.status();
        if status != Status::Released {
            return Err(MemoryError::InvalidState {
                operation: "materialize",
                status,
            });
        }

        self.handle = self.producer.produce(self.driver.as_ref())?;
        while self.progress < self.stages.len() {
            self.stages[self.progress].setup(self.driver.as_ref(), self.handle)?;
            self.progress += 1;
        }
        Ok(())
    }

    /// Tears down every set-up stage in reverse order and disposes of the
    /// handle.
    ///
    /// Never stops early: a failing teardown is recorded and the remaining
    /// stages still run, as does the dispose. The most recent error is
    /// returned and earlier ones are logged. On every exit path the
    /// allocation ends with no stage set up and no handle outstanding.
    ///
    /// Releasing an already released allocation is a no-op.
    pub fn release(&mut self) -> Result<(), MemoryError> {
        if self.handle == 0 && self.progress == 0 {
            return Ok(());
        }

        let mut last_error: Option<MemoryError> = None;
        let record = |error: MemoryError, last_error: &mut Option<MemoryError>| {
            if let Some(previous) = last_error.replace(error) {
                log::warn!("error superseded during release: {previous}");
            }
        };

        while self.progress > 0 {
            self.progress -= 1;
            // A failing stage is still considered disarmed.
            if let Err(err) = self.stages[self.progress].teardown(self.driver.as_ref(), self.handle)
            {
                record(err, &mut last_error);
            }
        }

        if self.handle != 0 {
            if let Err(err) = self.producer.dispose(self.driver.as_ref(), self.handle) {
                record(err, &mut last_error);
            }
            self.handle = 0;
        }

        match last_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for VirtualAllocation {
    fn drop(&mut self) {
        if self.handle != 0
            && let Err(err) = self.release()
        {
            log::error!("failed to release virtual allocation during drop: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverError;
    use crate::driver::testing::NullDriver;
    use std::sync::Mutex;

    type CallLog = Arc<Mutex<Vec<String>>>;

    fn driver() -> Arc<dyn MemoryDriver> {
        Arc::new(NullDriver)
    }

    struct ScriptedProducer {
        log: CallLog,
        fail_produce: bool,
    }

    impl Producer for ScriptedProducer {
        fn produce(&mut self, _: &dyn MemoryDriver) -> Result<PhysicalHandle, MemoryError> {
            self.log.lock().unwrap().push("produce".into());
            if self.fail_produce {
                return Err(DriverError::OutOfMemory { size: 4096 }.into());
            }
            Ok(7)
        }

        fn dispose(
            &mut self,
            _: &dyn MemoryDriver,
            handle: PhysicalHandle,
        ) -> Result<(), MemoryError> {
            assert_eq!(handle, 7);
            self.log.lock().unwrap().push("dispose".into());
            Ok(())
        }
    }

    struct ScriptedStage {
        name: &'static str,
        log: CallLog,
        fail_setup: bool,
        fail_teardown: bool,
    }

    impl ScriptedStage {
        fn ok(name: &'static str, log: &CallLog) -> Box<Self> {
            Box::new(Self {
                name,
                log: log.clone(),
                fail_setup: false,
                fail_teardown: false,
            })
        }
    }

    impl MemoryStage for ScriptedStage {
        fn setup(&mut self, _: &dyn MemoryDriver, _: PhysicalHandle) -> Result<(), MemoryError> {
            self.log.lock().unwrap().push(format!("{}.setup", self.name));
            if self.fail_setup {
                return Err(DriverError::Call {
                    op: "setup",
                    reason: self.name.into(),
                }
                .into());
            }
            Ok(())
        }

        fn teardown(&mut self, _: &dyn MemoryDriver, _: PhysicalHandle) -> Result<(), MemoryError> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}.teardown", self.name));
            if self.fail_teardown {
                return Err(DriverError::Call {
                    op: "teardown",
                    reason: self.name.into(),
                }
                .into());
            }
            Ok(())
        }
    }

    fn allocation(
        log: &CallLog,
        fail_produce: bool,
        stages: Vec<Box<dyn MemoryStage>>,
    ) -> VirtualAllocation {
        VirtualAllocation::new(
            driver(),
            Box::new(ScriptedProducer {
                log: log.clone(),
                fail_produce,
            }),
            stages,
        )
    }

    fn entries(log: &CallLog) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[test_log::test]
    fn materialize_and_release_run_stages_in_order() {
        let log = CallLog::default();
        let mut memory = allocation(
            &log,
            false,
            vec![ScriptedStage::ok("a", &log), ScriptedStage::ok("b", &log)],
        );

        assert_eq!(memory.status(), Status::Released);
        memory.materialize().unwrap();
        assert_eq!(memory.status(), Status::Materialized);
        assert_eq!(entries(&log), ["produce", "a.setup", "b.setup"]);

        memory.release().unwrap();
        assert_eq!(memory.status(), Status::Released);
        assert_eq!(
            entries(&log),
            ["produce", "a.setup", "b.setup", "b.teardown", "a.teardown", "dispose"]
        );
    }

    #[test_log::test]
    fn failed_produce_leaves_the_allocation_released() {
        let log = CallLog::default();
        let mut memory = allocation(&log, true, vec![ScriptedStage::ok("a", &log)]);

        assert!(memory.materialize().is_err());
        assert_eq!(memory.status(), Status::Released);
        assert_eq!(entries(&log), ["produce"]);
    }

    #[test_log::test]
    fn failed_setup_stops_without_any_teardown() {
        let log = CallLog::default();
        let mut failing = ScriptedStage::ok("b", &log);
        failing.fail_setup = true;
        let mut memory = allocation(
            &log,
            false,
            vec![
                ScriptedStage::ok("a", &log),
                failing,
                ScriptedStage::ok("c", &log),
            ],
        );

        assert!(memory.materialize().is_err());
        assert_eq!(memory.status(), Status::Errored);
        assert_eq!(entries(&log), ["produce", "a.setup", "b.setup"]);

        // Only the stage that succeeded is torn down.
        memory.release().unwrap();
        assert_eq!(memory.status(), Status::Released);
        assert_eq!(
            entries(&log),
            ["produce", "a.setup", "b.setup", "a.teardown", "dispose"]
        );
    }

    #[test_log::test]
    fn release_is_best_effort_complete() {
        let log = CallLog::default();
        let mut failing = ScriptedStage::ok("b", &log);
        failing.fail_teardown = true;
        let mut memory = allocation(
            &log,
            false,
            vec![
                ScriptedStage::ok("a", &log),
                failing,
                ScriptedStage::ok("c", &log),
            ],
        );

        memory.materialize().unwrap();
        let err = memory.release().unwrap_err();
        assert!(err.to_string().ends_with(": b"));

        // Every teardown and the dispose still ran.
        assert_eq!(
            entries(&log),
            [
                "produce",
                "a.setup",
                "b.setup",
                "c.setup",
                "c.teardown",
                "b.teardown",
                "a.teardown",
                "dispose"
            ]
        );
        assert_eq!(memory.status(), Status::Released);
        assert_eq!(memory.handle(), 0);
    }

    #[test_log::test]
    fn most_recent_error_is_returned() {
        let log = CallLog::default();
        let mut first = ScriptedStage::ok("a", &log);
        first.fail_teardown = true;
        let mut second = ScriptedStage::ok("b", &log);
        second.fail_teardown = true;
        let mut memory = allocation(&log, false, vec![first, second]);

        memory.materialize().unwrap();
        // Teardown runs b then a; a's error is the most recent one.
        let err = memory.release().unwrap_err();
        assert!(err.to_string().ends_with(": a"));
    }

    #[test_log::test]
    fn release_of_released_allocation_is_a_noop() {
        let log = CallLog::default();
        let mut memory = allocation(&log, false, vec![ScriptedStage::ok("a", &log)]);

        memory.release().unwrap();
        assert!(entries(&log).is_empty());
    }

    #[test_log::test]
    fn materialize_of_materialized_allocation_is_rejected() {
        let log = CallLog::default();
        let mut memory = allocation(&log, false, vec![ScriptedStage::ok("a", &log)]);

        memory.materialize().unwrap();
        assert!(matches!(
            memory.materialize(),
            Err(MemoryError::InvalidState {
                operation: "materialize",
                status: Status::Materialized,
            })
        ));
    }

    #[test_log::test]
    fn drop_releases_outstanding_memory() {
        let log = CallLog::default();
        let mut memory = allocation(&log, false, vec![ScriptedStage::ok("a", &log)]);

        memory.materialize().unwrap();
        drop(memory);
        assert_eq!(entries(&log), ["produce", "a.setup", "a.teardown", "dispose"]);
    }

    #[test_log::test]
    fn drop_after_release_does_nothing() {
        let log = CallLog::default();
        let mut memory = allocation(&log, false, vec![ScriptedStage::ok("a", &log)]);

        memory.materialize().unwrap();
        memory.release().unwrap();
        let count = entries(&log).len();
        drop(memory);
        assert_eq!(entries(&log).len(), count);
    }

    #[test_log::test]
    fn ownership_transfer_keeps_a_single_release() {
        let log = CallLog::default();
        let mut memory = allocation(&log, false, vec![ScriptedStage::ok("a", &log)]);
        memory.materialize().unwrap();

        // Moving the allocation moves the staged state with it; the single
        // release happens wherever the value ends up dropping.
        let mut slot = Vec::new();
        slot.push(memory);
        let moved = slot.pop().unwrap();
        assert_eq!(moved.status(), Status::Materialized);
        drop(moved);
        drop(slot);

        assert_eq!(entries(&log), ["produce", "a.setup", "a.teardown", "dispose"]);
    }

    #[test_log::test]
    fn produce_and_dispose_counts_balance() {
        let log = CallLog::default();
        let mut memory = allocation(&log, false, vec![ScriptedStage::ok("a", &log)]);

        for _ in 0..3 {
            memory.materialize().unwrap();
            memory.release().unwrap();
        }
        drop(memory);

        let log = entries(&log);
        let produces = log.iter().filter(|e| *e == "produce").count();
        let disposes = log.iter().filter(|e| *e == "dispose").count();
        assert_eq!(produces, 3);
        assert_eq!(produces, disposes);
    }
}
