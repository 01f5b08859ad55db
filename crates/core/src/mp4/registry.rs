//! Process-wide registry of live muxers for emergency finalization.
//!
//! Every recording muxer is registered while it is alive. On an abnormal
//! stop (SIGINT handler, fatal error path) [`MuxerRegistry::finalize_all`]
//! walks the registry and finalizes whatever it can lock within a bounded
//! wait. A muxer held by a wedged capture thread is skipped rather than
//! waited on, so the shutdown path can never deadlock.
//!
//! ```text
//! register ──► SharedMuxer (Arc) ──drop last clone──► unregister + finalize
//!                   ▲
//!   registry ── Weak ┘  (finalize_all upgrades, try-locks, finalizes)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Weak};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use super::muxer::Mp4Muxer;

static GLOBAL: LazyLock<MuxerRegistry> = LazyLock::new(MuxerRegistry::new);

/// Outcome of [`MuxerRegistry::finalize_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmergencyReport {
    /// Muxers finalized successfully.
    pub finalized: usize,
    /// Muxers whose finalize returned an error.
    pub failed: usize,
    /// Muxers still locked by another thread after the timeout.
    pub skipped: usize,
    /// The registry itself could not be locked; nothing was attempted.
    pub registry_contended: bool,
}

struct Entry {
    id: u64,
    muxer: Mutex<Mp4Muxer>,
    registry: MuxerRegistry,
}

impl Drop for Entry {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

/// Thread-safe set of live muxers.
///
/// Holds weak references only; a muxer's lifetime is owned by its
/// [`SharedMuxer`] handles.
#[derive(Clone)]
pub struct MuxerRegistry {
    entries: Arc<Mutex<HashMap<u64, Weak<Entry>>>>,
    next_id: Arc<AtomicU64>,
}

impl MuxerRegistry {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// The process-wide registry used by the capture pipeline.
    pub fn global() -> &'static MuxerRegistry {
        &GLOBAL
    }

    /// Take ownership of `muxer` and register it.
    pub fn register(&self, muxer: Mp4Muxer) -> SharedMuxer {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let entry = Arc::new(Entry {
            id,
            muxer: Mutex::new(muxer),
            registry: self.clone(),
        });
        let mut entries = self.entries.lock();
        entries.insert(id, Arc::downgrade(&entry));
        tracing::debug!(muxer_id = id, total = entries.len(), "muxer registered");
        SharedMuxer { entry }
    }

    fn unregister(&self, id: u64) {
        let mut entries = self.entries.lock();
        if entries.remove(&id).is_some() {
            tracing::debug!(muxer_id = id, remaining = entries.len(), "muxer unregistered");
        }
    }

    /// Number of registered muxers.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Finalize every registered muxer that can be locked within `timeout`.
    ///
    /// Each lock (the registry's and every muxer's) is a bounded try-lock.
    /// Muxers that are already finalized are left alone.
    pub fn finalize_all(&self, timeout: Duration) -> EmergencyReport {
        let mut report = EmergencyReport::default();

        let live: Vec<Arc<Entry>> = match self.entries.try_lock_for(timeout) {
            Some(mut entries) => {
                entries.retain(|_, weak| weak.strong_count() > 0);
                entries.values().filter_map(Weak::upgrade).collect()
            }
            None => {
                tracing::error!("muxer registry locked, emergency finalize skipped");
                report.registry_contended = true;
                return report;
            }
        };

        for entry in &live {
            let Some(mut muxer) = entry.muxer.try_lock_for(timeout) else {
                tracing::warn!(muxer_id = entry.id, "muxer busy, skipped emergency finalize");
                report.skipped += 1;
                continue;
            };
            if !muxer.is_streaming() {
                continue;
            }
            match muxer.finalize() {
                Ok(summary) => {
                    tracing::info!(
                        muxer_id = entry.id,
                        frames = summary.frames,
                        "emergency finalize"
                    );
                    report.finalized += 1;
                }
                Err(e) => {
                    tracing::error!(muxer_id = entry.id, error = %e, "emergency finalize failed");
                    report.failed += 1;
                }
            }
        }
        report
    }
}

impl Default for MuxerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle to a registered [`Mp4Muxer`].
///
/// Clones refer to the same muxer. Dropping the last clone unregisters it
/// and lets [`Mp4Muxer`]'s `Drop` finalize a still-streaming file.
#[derive(Clone)]
pub struct SharedMuxer {
    entry: Arc<Entry>,
}

impl SharedMuxer {
    pub fn id(&self) -> u64 {
        self.entry.id
    }

    pub fn lock(&self) -> MutexGuard<'_, Mp4Muxer> {
        self.entry.muxer.lock()
    }

    pub fn try_lock_for(&self, timeout: Duration) -> Option<MutexGuard<'_, Mp4Muxer>> {
        self.entry.muxer.try_lock_for(timeout)
    }
}

impl std::fmt::Debug for SharedMuxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMuxer").field("id", &self.entry.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;

    use super::*;
    use crate::media::VideoCodec;
    use crate::media::params::ParameterSets;
    use crate::mp4::{Mp4Config, TrackInfo};

    fn muxer(dir: &std::path::Path, name: &str) -> Mp4Muxer {
        let track = TrackInfo {
            codec: VideoCodec::H264,
            params: ParameterSets::h264(vec![0x67, 0x42, 0x00, 0x1F], vec![0x68, 0xCE]),
            width: 640,
            height: 480,
            fps: 25,
        };
        Mp4Muxer::create(dir.join(name), Mp4Config::default(), track).unwrap()
    }

    #[test]
    fn drop_unregisters() {
        let dir = tempfile::tempdir().unwrap();
        let registry = MuxerRegistry::new();
        let a = registry.register(muxer(dir.path(), "a.mp4"));
        let b = a.clone();
        assert_eq!(registry.len(), 1);

        drop(a);
        assert_eq!(registry.len(), 1, "clone still alive");
        drop(b);
        assert!(registry.is_empty());
    }

    #[test]
    fn finalize_all_finalizes_streaming_muxers() {
        let dir = tempfile::tempdir().unwrap();
        let registry = MuxerRegistry::new();
        let a = registry.register(muxer(dir.path(), "a.mp4"));
        let b = registry.register(muxer(dir.path(), "b.mp4"));
        a.lock().add_frame(&[0x65, 0x01], true).unwrap();
        b.lock().finalize().unwrap();

        let report = registry.finalize_all(Duration::from_millis(50));
        assert_eq!(report.finalized, 1);
        assert_eq!(report.skipped, 0);
        assert!(a.lock().is_finalized());

        let again = registry.finalize_all(Duration::from_millis(50));
        assert_eq!(again.finalized, 0);
    }

    #[test]
    fn busy_muxer_is_skipped_not_waited_on() {
        let dir = tempfile::tempdir().unwrap();
        let registry = MuxerRegistry::new();
        let shared = registry.register(muxer(dir.path(), "busy.mp4"));

        let (locked_tx, locked_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let holder = shared.clone();
        let handle = thread::spawn(move || {
            let _guard = holder.lock();
            locked_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        locked_rx.recv().unwrap();

        let report = registry.finalize_all(Duration::from_millis(20));
        assert_eq!(report.skipped, 1);
        assert_eq!(report.finalized, 0);

        release_tx.send(()).unwrap();
        handle.join().unwrap();
        assert!(shared.lock().is_streaming());
    }
}
