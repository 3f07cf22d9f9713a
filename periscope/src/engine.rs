//! Sampling engine contract
//!
//! The engines that actually capture stack or allocation samples are
//! external collaborators. The coordinator only ever talks to them through
//! this trait and treats every call as fallible: errors are logged at the
//! [`Backend`](crate::Backend) boundary and never propagate further.

use anyhow::Result;
use serde_json::Value;

use crate::params::SessionParams;

/// One sampling engine (CPU/wall/allocation sampler).
///
/// `take_results` drains the engine's completed profile, if any. It is also
/// invoked before every start: engines may recycle internal buffers across
/// sessions, and a stale result left in place would corrupt the next
/// profile.
pub trait SamplingEngine: Send + std::fmt::Debug {
    /// Short engine name, recorded into profile metadata.
    fn name(&self) -> &'static str;

    /// Begin sampling. `Ok(false)` means the engine refused to start.
    fn start(&mut self, params: &SessionParams) -> Result<bool>;

    /// Stop sampling. `Ok(false)` means there was no session to stop.
    fn stop(&mut self) -> Result<bool>;

    /// Remove and return the completed profile payload, if one exists.
    fn take_results(&mut self) -> Result<Option<Value>>;

    fn is_running(&self) -> bool;
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    //! Deterministic in-memory engine for tests.

    use std::sync::{Arc, Mutex, PoisonError};

    use anyhow::{bail, Result};
    use serde_json::{json, Value};

    use crate::params::SessionParams;

    use super::SamplingEngine;

    #[derive(Debug, Default)]
    struct FakeState {
        running: bool,
        params: Option<SessionParams>,
        pending: Option<Value>,
        start_calls: u32,
        stop_calls: u32,
        fail_start: bool,
        refuse_start: bool,
        fail_stop: bool,
        fail_results: bool,
    }

    /// An engine that fabricates a small but well-formed profile payload.
    ///
    /// State lives behind an `Arc` so tests can keep a [`FakeHandle`] to
    /// inject faults or simulate a session started by foreign code.
    #[derive(Debug)]
    pub struct FakeEngine {
        state: Arc<Mutex<FakeState>>,
    }

    /// Test-side control handle for a [`FakeEngine`].
    #[derive(Clone)]
    pub struct FakeHandle {
        state: Arc<Mutex<FakeState>>,
    }

    impl FakeEngine {
        pub fn new() -> Self {
            Self {
                state: Arc::new(Mutex::new(FakeState::default())),
            }
        }

        pub fn handle(&self) -> FakeHandle {
            FakeHandle {
                state: Arc::clone(&self.state),
            }
        }
    }

    impl Default for FakeEngine {
        fn default() -> Self {
            Self::new()
        }
    }

    fn profile_payload(params: &SessionParams) -> Value {
        json!({
            "mode": params.mode.as_str(),
            "interval": params.interval,
            "ignore_gc": params.ignore_gc,
            "samples": [1, 2, 3],
            "sample_count": 3,
            "metadata": Value::Object(params.metadata.clone()),
        })
    }

    impl SamplingEngine for FakeEngine {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn start(&mut self, params: &SessionParams) -> Result<bool> {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.start_calls += 1;
            if state.fail_start {
                bail!("injected start failure");
            }
            if state.refuse_start {
                return Ok(false);
            }
            state.running = true;
            state.params = Some(params.clone());
            Ok(true)
        }

        fn stop(&mut self) -> Result<bool> {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.stop_calls += 1;
            if state.fail_stop {
                bail!("injected stop failure");
            }
            if !state.running {
                return Ok(false);
            }
            state.running = false;
            if let Some(params) = state.params.take() {
                state.pending = Some(profile_payload(&params));
            }
            Ok(true)
        }

        fn take_results(&mut self) -> Result<Option<Value>> {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.fail_results {
                bail!("injected results failure");
            }
            Ok(state.pending.take())
        }

        fn is_running(&self) -> bool {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.running
        }
    }

    impl FakeHandle {
        /// Simulate a session started by a foreign entry point, bypassing the
        /// coordinator entirely.
        pub fn start_externally(&self) {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.running = true;
            state.params = Some(SessionParams::default());
        }

        pub fn is_running(&self) -> bool {
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .running
        }

        pub fn start_calls(&self) -> u32 {
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .start_calls
        }

        pub fn stop_calls(&self) -> u32 {
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .stop_calls
        }

        pub fn fail_start(&self, fail: bool) {
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .fail_start = fail;
        }

        pub fn refuse_start(&self, refuse: bool) {
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .refuse_start = refuse;
        }

        pub fn fail_stop(&self, fail: bool) {
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .fail_stop = fail;
        }

        pub fn fail_results(&self, fail: bool) {
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .fail_results = fail;
        }

        /// Plant a payload as if a previous session had completed without its
        /// results being collected.
        pub fn plant_stale_results(&self, payload: Value) {
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pending = Some(payload);
        }

        pub fn has_pending_results(&self) -> bool {
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pending
                .is_some()
        }
    }
}
