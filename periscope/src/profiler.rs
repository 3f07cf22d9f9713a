//! Session coordination facade.
//!
//! A [`Profiler`] owns exactly one [`Backend`] and is the object callers
//! share (typically behind an `Arc`) instead of mutating process-wide
//! globals. It delegates `start`/`stop`/`results` and adds the
//! `run`-a-closure form with guaranteed cleanup.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::error;

use crate::backend::Backend;
use crate::engine::SamplingEngine;
use crate::error::Error;
use crate::lock::SessionLock;
use crate::params::SessionParams;
use crate::profile::Profile;

pub struct Profiler {
    backend: Mutex<Backend>,
}

/// What a [`Profiler::run`] call produced: the closure's own output plus
/// the profile, when this call was the one that started the session.
#[derive(Debug)]
pub struct RunOutcome<T> {
    pub output: T,
    pub profile: Option<Profile>,
}

/// Stops the session from `Drop` when `run`'s closure unwinds, so a
/// panicking workload cannot leave the engine sampling.
struct StopGuard<'a> {
    profiler: &'a Profiler,
    armed: bool,
}

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.profiler.stop();
        }
    }
}

impl Profiler {
    pub fn new(engine: Box<dyn SamplingEngine>) -> Self {
        let lock = Arc::new(SessionLock::new());
        Self {
            backend: Mutex::new(Backend::new(engine, lock)),
        }
    }

    pub fn engine_name(&self) -> &'static str {
        self.backend().engine_name()
    }

    pub fn is_running(&self) -> bool {
        self.backend().is_running()
    }

    /// Begin a session. `false` when another session (local or foreign) is
    /// already in flight, or the engine failed to start.
    pub fn start(&self, params: &SessionParams) -> bool {
        self.backend().start(params)
    }

    pub fn stop(&self) -> bool {
        self.backend().stop()
    }

    pub fn results(&self) -> Option<Profile> {
        self.backend().results()
    }

    /// Replace the active sampling engine, returning the previous one.
    ///
    /// Switching while a session is running is a configuration fault;
    /// silently ignoring it would let the caller believe the switch
    /// happened.
    pub fn set_engine(
        &self,
        engine: Box<dyn SamplingEngine>,
    ) -> Result<Box<dyn SamplingEngine>, Error> {
        let mut backend = self.backend();
        if backend.is_running() {
            return Err(Error::EngineRunning);
        }
        Ok(backend.replace_engine(engine))
    }

    /// Profile the given closure.
    ///
    /// The closure always runs, even when the session could not be started
    /// (a foreign session is observed, never disturbed). The session is
    /// stopped and collected only if this call started it, and it is
    /// stopped even when the closure panics; the panic then resumes.
    pub fn run<T>(&self, params: &SessionParams, work: impl FnOnce() -> T) -> RunOutcome<T> {
        let started = self.start(params);
        let started_at = Instant::now();

        let mut guard = StopGuard {
            profiler: self,
            armed: started,
        };
        let output = work();

        let profile = if started {
            guard.armed = false;
            let duration = started_at.elapsed();
            self.stop();
            self.results().map(|mut profile| {
                profile.set_duration_secs(duration.as_secs_f64());
                profile
            })
        } else {
            None
        };

        RunOutcome { output, profile }
    }

    /// Profile the closure with a one-off engine, restoring the previously
    /// active engine afterwards.
    ///
    /// When the swap is refused because a session is running, the fault is
    /// logged and the closure still runs, unprofiled.
    pub fn run_with_engine<T>(
        &self,
        engine: Box<dyn SamplingEngine>,
        params: &SessionParams,
        work: impl FnOnce() -> T,
    ) -> RunOutcome<T> {
        let previous = match self.set_engine(engine) {
            Ok(previous) => previous,
            Err(err) => {
                error!("cannot profile with a one-off engine: {}", err);
                return RunOutcome {
                    output: work(),
                    profile: None,
                };
            }
        };

        let outcome = self.run(params, work);

        if let Err(err) = self.set_engine(previous) {
            error!("failed to restore the previous engine: {}", err);
        }
        outcome
    }

    fn backend(&self) -> MutexGuard<'_, Backend> {
        self.backend.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
