//! Artifact storage adapters
//!
//! Storage is an external collaborator: the coordinator and upload queue
//! only ever call [`Storage::upload`]. The upload is synchronous; callers
//! that must not block route profiles through the
//! [`UploadQueue`](crate::UploadQueue) instead.

pub mod file;

use anyhow::Result;

use crate::profile::Profile;

pub use file::FileStorage;

/// Where an uploaded profile ended up.
#[derive(Debug, Clone)]
pub struct UploadLocation {
    /// Address a viewer or operator can fetch the profile from.
    pub url: String,

    /// The artifact's name within the backing store.
    pub name: String,
}

/// Storage backend trait
pub trait Storage: Send + Sync {
    /// Persist one profile. Blocking; returns the stored location.
    fn upload(&self, profile: &Profile) -> Result<UploadLocation>;
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    //! Recording storage double for tests.

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Condvar, Mutex, PoisonError};

    use anyhow::{bail, Result};

    use crate::profile::Profile;

    use super::{Storage, UploadLocation};

    /// Records uploaded profile ids; can fail on demand and block uploads
    /// until released, for exercising drain behavior.
    #[derive(Default)]
    pub struct RecordingStorage {
        uploads: Mutex<Vec<String>>,
        attempts: AtomicUsize,
        fail: AtomicBool,
        gate: Mutex<bool>,
        gate_cvar: Condvar,
    }

    impl RecordingStorage {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn uploaded_ids(&self) -> Vec<String> {
            self.uploads
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Uploads started so far, including those currently blocked on the
        /// gate and those that failed.
        pub fn upload_attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        pub fn fail_uploads(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        /// Make subsequent uploads block until [`Self::release`] is called.
        pub fn hold_uploads(&self) {
            *self.gate.lock().unwrap_or_else(PoisonError::into_inner) = true;
        }

        pub fn release(&self) {
            *self.gate.lock().unwrap_or_else(PoisonError::into_inner) = false;
            self.gate_cvar.notify_all();
        }
    }

    impl Storage for RecordingStorage {
        fn upload(&self, profile: &Profile) -> Result<UploadLocation> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let mut held = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
            while *held {
                held = self
                    .gate_cvar
                    .wait(held)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            drop(held);

            if self.fail.load(Ordering::SeqCst) {
                bail!("injected upload failure");
            }

            let id = profile.id().to_string();
            self.uploads
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(id.clone());
            Ok(UploadLocation {
                url: format!("memory://{id}"),
                name: id,
            })
        }
    }
}
