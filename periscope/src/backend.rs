//! Single-flight wrapper around one sampling engine.
//!
//! Every engine call is fault-isolated here: an engine error becomes a log
//! line and a `false`/`None` sentinel, never a propagated error. The
//! session lock is only ever mutated by [`Backend::start`] and
//! [`Backend::stop`].

use std::sync::Arc;

use tracing::{info, warn};

use crate::engine::SamplingEngine;
use crate::lock::SessionLock;
use crate::params::SessionParams;
use crate::profile::Profile;

pub struct Backend {
    engine: Box<dyn SamplingEngine>,
    lock: Arc<SessionLock>,
    holds_lock: bool,
}

/// Releases the session lock on every exit path of `stop`, including an
/// unwind out of the engine's stop call.
struct ReleaseGuard<'a> {
    lock: &'a SessionLock,
    holds_lock: &'a mut bool,
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        if *self.holds_lock {
            self.lock.release();
            *self.holds_lock = false;
        }
    }
}

impl Backend {
    pub fn new(engine: Box<dyn SamplingEngine>, lock: Arc<SessionLock>) -> Self {
        Self {
            engine,
            lock,
            holds_lock: false,
        }
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    pub fn is_running(&self) -> bool {
        self.engine.is_running()
    }

    /// Begin a session. Returns `true` only if the engine actually began
    /// sampling on behalf of this call.
    pub fn start(&mut self, params: &SessionParams) -> bool {
        // A session started by a foreign entry point is observed, not stolen.
        if self.engine.is_running() {
            return false;
        }
        if !self.lock.try_acquire() {
            return false;
        }
        self.holds_lock = true;

        // Engines may recycle internal buffers across sessions; drain any
        // stale result before starting a new one.
        if let Err(error) = self.engine.take_results() {
            info!("failed to clear stale profiler results: {:#}", error);
            self.release_lock();
            return false;
        }

        match self.engine.start(params) {
            Ok(true) => true,
            Ok(false) => {
                info!("engine {} refused to start", self.engine.name());
                self.release_lock();
                false
            }
            Err(error) => {
                info!("failed to start the profiler: {:#}", error);
                self.release_lock();
                false
            }
        }
    }

    /// Stop the session. The lock release is guaranteed even when the
    /// engine's stop call fails.
    pub fn stop(&mut self) -> bool {
        let Self {
            engine,
            lock,
            holds_lock,
        } = self;
        let _release = ReleaseGuard {
            lock: &**lock,
            holds_lock,
        };

        match engine.stop() {
            Ok(stopped) => stopped,
            Err(error) => {
                info!("failed to stop the profiler: {:#}", error);
                false
            }
        }
    }

    /// Collect the completed profile. `None` is normal when no session has
    /// produced results yet; extraction faults are logged and also yield
    /// `None`.
    pub fn results(&mut self) -> Option<Profile> {
        let raw = match self.engine.take_results() {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(error) => {
                info!("failed to obtain the profile: {:#}", error);
                return None;
            }
        };

        match Profile::from_engine(self.engine.name(), raw) {
            Ok(profile) => Some(profile),
            Err(error) => {
                warn!("engine produced an unusable profile: {}", error);
                None
            }
        }
    }

    /// Swap the engine. Callers must ensure no session is running; the
    /// coordinator enforces this with a typed error.
    pub(crate) fn replace_engine(
        &mut self,
        engine: Box<dyn SamplingEngine>,
    ) -> Box<dyn SamplingEngine> {
        std::mem::replace(&mut self.engine, engine)
    }

    fn release_lock(&mut self) {
        if self.holds_lock {
            self.lock.release();
            self.holds_lock = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::FakeEngine;

    fn backend() -> (Backend, crate::engine::testing::FakeHandle, Arc<SessionLock>) {
        let engine = FakeEngine::new();
        let handle = engine.handle();
        let lock = Arc::new(SessionLock::new());
        (Backend::new(Box::new(engine), Arc::clone(&lock)), handle, lock)
    }

    #[test]
    fn test_start_stop_collects_results() {
        let (mut backend, _handle, lock) = backend();

        assert!(backend.start(&SessionParams::default()));
        assert!(backend.is_running());
        assert!(lock.is_held());

        assert!(backend.stop());
        assert!(!lock.is_held());

        let profile = backend.results().unwrap();
        assert_eq!("cpu", profile.mode());
        assert!(backend.results().is_none());
    }

    #[test]
    fn test_start_defers_to_foreign_session() {
        let (mut backend, handle, lock) = backend();
        handle.start_externally();

        assert!(!backend.start(&SessionParams::default()));
        // The foreign session is untouched and the lock was never taken.
        assert!(handle.is_running());
        assert!(!lock.is_held());
        assert_eq!(0, handle.start_calls());
    }

    #[test]
    fn test_start_fails_when_lock_is_held() {
        let (mut backend, handle, lock) = backend();
        assert!(lock.try_acquire());

        assert!(!backend.start(&SessionParams::default()));
        assert_eq!(0, handle.start_calls());
    }

    #[test]
    fn test_engine_start_fault_releases_lock() {
        let (mut backend, handle, lock) = backend();
        handle.fail_start(true);

        assert!(!backend.start(&SessionParams::default()));
        assert!(!lock.is_held());

        // The lock is usable again once the fault clears.
        handle.fail_start(false);
        assert!(backend.start(&SessionParams::default()));
        assert!(lock.is_held());
    }

    #[test]
    fn test_engine_refusing_to_start_releases_lock() {
        let (mut backend, handle, lock) = backend();
        handle.refuse_start(true);

        assert!(!backend.start(&SessionParams::default()));
        assert!(!lock.is_held());
    }

    #[test]
    fn test_stop_releases_lock_on_engine_fault() {
        let (mut backend, handle, lock) = backend();
        assert!(backend.start(&SessionParams::default()));

        handle.fail_stop(true);
        assert!(!backend.stop());
        assert!(!lock.is_held());
    }

    #[test]
    fn test_start_clears_stale_results() {
        let (mut backend, handle, _lock) = backend();
        handle.plant_stale_results(serde_json::json!({"mode": "wall"}));

        assert!(backend.start(&SessionParams::default()));
        assert!(!handle.has_pending_results());
    }

    #[test]
    fn test_results_fault_is_a_logged_none() {
        let (mut backend, handle, _lock) = backend();
        assert!(backend.start(&SessionParams::default()));
        assert!(backend.stop());

        handle.fail_results(true);
        assert!(backend.results().is_none());
    }

    #[test]
    fn test_results_before_any_session_is_none() {
        let (mut backend, _handle, _lock) = backend();
        assert!(backend.results().is_none());
    }
}
