//! Bounded asynchronous upload queue
//!
//! Decouples "profile finished" from "profile persisted". `enqueue` never
//! blocks: a full queue drops the incoming profile and reports it through
//! the failure hook. A background worker drains the queue on a fixed
//! interval, swapping the buffer out atomically so producers never wait on
//! upload I/O.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::profile::Profile;
use crate::storage::Storage;

/// Upload queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of profiles waiting to be uploaded.
    pub max_length: usize,

    /// How often the drain worker wakes.
    pub interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_length: 10,
            interval: Duration::from_secs(5),
        }
    }
}

impl QueueConfig {
    /// Defaults overridden from `PERISCOPE_UPLOAD_QUEUE_*` environment
    /// variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(max_length) = env_parse("PERISCOPE_UPLOAD_QUEUE_MAX_LENGTH") {
            config.max_length = max_length;
        }
        if let Some(secs) = env_parse("PERISCOPE_UPLOAD_QUEUE_INTERVAL_SECS") {
            config.interval = Duration::from_secs(secs);
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

type EnqueueSuccessHook = Box<dyn Fn() + Send + Sync>;
type EnqueueFailureHook = Box<dyn Fn(Profile) + Send + Sync>;
type AfterDrainHook = Box<dyn Fn(usize, usize) + Send + Sync>;

#[derive(Default)]
struct Hooks {
    enqueue_success: Option<EnqueueSuccessHook>,
    enqueue_failure: Option<EnqueueFailureHook>,
    after_drain: Option<AfterDrainHook>,
}

struct QueueEntry {
    profile: Profile,
    enqueued_at: Instant,
}

/// The drain worker for one process generation. A handle whose pid does
/// not match the current process belongs to a pre-fork parent and is dead
/// here; it is left alone and replaced, never joined or torn down.
struct Worker {
    pid: u32,
    handle: JoinHandle<()>,
}

struct Inner {
    config: QueueConfig,
    storage: Arc<dyn Storage>,
    queue: Mutex<VecDeque<QueueEntry>>,
    hooks: Hooks,
    shutdown: AtomicBool,
}

pub struct UploadQueue {
    inner: Arc<Inner>,
    worker: Mutex<Option<Worker>>,
}

impl UploadQueue {
    pub fn new(storage: Arc<dyn Storage>, config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                storage,
                queue: Mutex::new(VecDeque::new()),
                hooks: Hooks::default(),
                shutdown: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Invoked after each successful enqueue.
    pub fn on_enqueue_success(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks_mut().enqueue_success = Some(Box::new(hook));
        self
    }

    /// Invoked with each profile dropped because the queue was full.
    pub fn on_enqueue_failure(
        mut self,
        hook: impl Fn(Profile) + Send + Sync + 'static,
    ) -> Self {
        self.hooks_mut().enqueue_failure = Some(Box::new(hook));
        self
    }

    /// Invoked after every drain with (success_count, failure_count).
    pub fn after_drain(
        mut self,
        hook: impl Fn(usize, usize) + Send + Sync + 'static,
    ) -> Self {
        self.hooks_mut().after_drain = Some(Box::new(hook));
        self
    }

    /// Queue a profile for background upload. Never blocks: when the queue
    /// is full the profile is dropped and reported through the failure
    /// hook.
    pub fn enqueue(&self, profile: Profile) {
        let rejected = {
            let mut queue = self.inner.queue_guard();
            if queue.len() >= self.inner.config.max_length {
                Some(profile)
            } else {
                queue.push_back(QueueEntry {
                    profile,
                    enqueued_at: Instant::now(),
                });
                None
            }
        };

        match rejected {
            Some(profile) => {
                warn!(
                    "upload queue full ({} pending), dropping profile id={}",
                    self.inner.config.max_length,
                    profile.id()
                );
                if let Some(hook) = &self.inner.hooks.enqueue_failure {
                    hook(profile);
                }
            }
            None => {
                if let Some(hook) = &self.inner.hooks.enqueue_success {
                    hook();
                }
                self.ensure_worker();
            }
        }
    }

    /// Upload everything currently queued. Returns (successes, failures).
    pub fn drain(&self) -> (usize, usize) {
        self.inner.drain()
    }

    pub fn len(&self) -> usize {
        self.inner.queue_guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ask the worker to exit at its next wake and flush what is queued.
    pub fn shutdown(&self) -> (usize, usize) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.drain()
    }

    /// Start the drain worker if this process has no live one. An existing
    /// handle is dead when its thread finished or when it was spawned by a
    /// pre-fork parent pid.
    fn ensure_worker(&self) {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return;
        }

        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        let alive = worker
            .as_ref()
            .map(|w| w.pid == std::process::id() && !w.handle.is_finished())
            .unwrap_or(false);
        if alive {
            return;
        }

        let inner = Arc::clone(&self.inner);
        match thread::Builder::new()
            .name("periscope-upload".into())
            .spawn(move || drain_loop(inner))
        {
            Ok(handle) => {
                debug!("started upload drain worker");
                *worker = Some(Worker {
                    pid: std::process::id(),
                    handle,
                });
            }
            Err(err) => error!("failed to spawn upload drain worker: {}", err),
        }
    }

    fn hooks_mut(&mut self) -> &mut Hooks {
        // Hooks are only configurable before the queue is shared; at that
        // point the Arc is still uniquely held.
        &mut Arc::get_mut(&mut self.inner)
            .expect("upload queue hooks must be configured before sharing")
            .hooks
    }

    #[cfg(test)]
    fn worker_pid(&self) -> Option<u32> {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|w| w.pid)
    }

    #[cfg(test)]
    fn pretend_worker_pid(&self, pid: u32) {
        if let Some(worker) = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            worker.pid = pid;
        }
    }
}

fn drain_loop(inner: Arc<Inner>) {
    loop {
        thread::sleep(inner.config.interval);
        if inner.shutdown.load(Ordering::SeqCst) {
            break;
        }
        inner.drain();
    }
}

impl Inner {
    /// Swap the queue for an empty one, then upload the swapped-out batch.
    /// The queue mutex is never held across upload I/O, so producers keep
    /// enqueueing while a drain is in progress.
    fn drain(&self) -> (usize, usize) {
        let batch = std::mem::take(&mut *self.queue_guard());

        let mut successes = 0;
        let mut failures = 0;
        for entry in batch {
            debug!(
                "uploading profile id={} queued for {:?}",
                entry.profile.id(),
                entry.enqueued_at.elapsed()
            );
            match self.storage.upload(&entry.profile) {
                Ok(location) => {
                    successes += 1;
                    info!(
                        "profile uploaded: profile_url={} profile_name={}",
                        location.url, location.name
                    );
                }
                Err(error) => {
                    failures += 1;
                    warn!("failed to upload profile: {:#}", error);
                }
            }
        }

        if let Some(hook) = &self.hooks.after_drain {
            hook(successes, failures);
        }
        (successes, failures)
    }

    fn queue_guard(&self) -> MutexGuard<'_, VecDeque<QueueEntry>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
