//! Debounced dispatcher: watches the spool's working directory and decides
//! when a study has gone quiet long enough, and received enough files, to
//! hand off to the orchestrator.
//!
//! Grounded on `git-gov-core`'s `monitor.rs`: a `notify` callback feeds a
//! bounded raw-event channel so the filesystem callback never blocks or
//! locks, an async pipeline task applies per-key debounce using monotonic
//! time, and a `HashMap` of per-key state is the only place single-flight
//! bookkeeping lives. The key here is the study directory (the `UID_`-prefixed
//! first path component under the spool root, prefix stripped) rather than a
//! whole-repo relative path, and single-flight is enforced by a `scheduled`
//! flag instead of suppressing repeat notifications outright — a study that
//! gets new files after being scheduled, but before the orchestrator has
//! claimed it, must re-debounce. Only events under `DCM/` or `Structure/`
//! count as activity: the orchestrator's own writes into `Addition/` and
//! `DebugDicom/` while a pipeline runs must never be mistaken for new
//! reception traffic on the same study.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::WatcherConfig;
use crate::spool::{Spool, SUBDIR_DCM, SUBDIR_STRUCTURE};

/// A study has gone quiet for at least the debounce window and has met the
/// minimum file count — ready for the orchestrator to claim.
#[derive(Debug, Clone)]
pub struct StudyReady {
    pub study_key: String,
}

#[derive(Debug)]
struct RawActivity {
    study_key: String,
}

#[derive(Debug)]
struct StudyState {
    last_event: Instant,
    file_count: usize,
    scheduled: bool,
}

pub struct Watcher {
    cfg: WatcherConfig,
    spool: Spool,
}

impl Watcher {
    pub fn new(cfg: WatcherConfig, spool: Spool) -> Self {
        Watcher { cfg, spool }
    }

    /// Runs until `shutdown` fires. Emits `StudyReady` on `ready_tx` once a
    /// study has been quiet for the debounce window and has at least
    /// `min_file_count_for_processing` files. Recovers studies left over
    /// from a previous run by enumerating the working directory on startup
    /// and seeding each with an already-elapsed timer, so a restart with a
    /// fully-received study dispatches it immediately rather than waiting
    /// for new file activity that will never come.
    pub async fn run(
        &self,
        working_dir: PathBuf,
        ready_tx: mpsc::Sender<StudyReady>,
        mut completed_rx: mpsc::Receiver<String>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), notify::Error> {
        let (raw_tx, mut raw_rx) = mpsc::channel::<RawActivity>(4096);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_cb = Arc::clone(&stop);
        let root_cb = working_dir.clone();

        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                if stop_cb.load(Ordering::Acquire) {
                    return;
                }
                let event = match res {
                    Ok(ev) => ev,
                    Err(e) => {
                        warn!(error = %e, "filesystem watch error");
                        return;
                    }
                };
                for path in &event.paths {
                    if let Some(key) = receiving_study_key(&root_cb, path) {
                        let _ = raw_tx.try_send(RawActivity { study_key: key });
                    }
                }
            })?;
        watcher.watch(&working_dir, RecursiveMode::Recursive)?;

        let mut states: HashMap<String, StudyState> = HashMap::new();
        for key in self.spool.list_studies().unwrap_or_default() {
            let count = self
                .spool
                .path_for(&key)
                .map(|root| count_files(&root.join(SUBDIR_DCM)) + count_files(&root.join(SUBDIR_STRUCTURE)))
                .unwrap_or(0);
            states.insert(
                key,
                StudyState {
                    last_event: Instant::now() - self.debounce_window() - Duration::from_secs(1),
                    file_count: count,
                    scheduled: false,
                },
            );
        }
        info!(recovered = states.len(), "watcher recovered studies from previous run");

        let mut tick = tokio::time::interval(Duration::from_millis(500));

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    stop.store(true, Ordering::Release);
                    drop(watcher);
                    return Ok(());
                }
                maybe = raw_rx.recv() => {
                    match maybe {
                        Some(raw) => {
                            let entry = states.entry(raw.study_key.clone()).or_insert_with(|| StudyState {
                                last_event: Instant::now(),
                                file_count: 0,
                                scheduled: false,
                            });
                            entry.last_event = Instant::now();
                            entry.file_count += 1;
                            entry.scheduled = false;
                            debug!(study = %raw.study_key, count = entry.file_count, "activity recorded");
                        }
                        None => continue,
                    }
                }
                _ = tick.tick() => {
                    self.dispatch_ready(&mut states, &ready_tx).await;
                }
                maybe = completed_rx.recv() => {
                    match maybe {
                        Some(study_key) => {
                            states.remove(&study_key);
                            debug!(study = %study_key, "dispatch complete, entry cleared");
                        }
                        None => continue,
                    }
                }
            }
        }
    }

    fn debounce_window(&self) -> Duration {
        Duration::from_secs(self.cfg.debounce_interval_seconds)
    }

    async fn dispatch_ready(
        &self,
        states: &mut HashMap<String, StudyState>,
        ready_tx: &mpsc::Sender<StudyReady>,
    ) {
        let now = Instant::now();
        for (key, state) in states.iter_mut() {
            if state.scheduled {
                continue;
            }
            if state.file_count < self.cfg.min_file_count_for_processing {
                continue;
            }
            if now.duration_since(state.last_event) < self.debounce_window() {
                continue;
            }
            state.scheduled = true;
            if ready_tx
                .send(StudyReady {
                    study_key: key.clone(),
                })
                .await
                .is_err()
            {
                warn!("orchestrator channel closed, watcher cannot dispatch further studies");
            }
        }
    }
}

/// Extracts the study key from a filesystem event path, but only when the
/// event falls under that study's `DCM/` or `Structure/` subdirectory — the
/// only two places an upstream peer's reception activity ever lands. This
/// deliberately ignores `Addition/` and `DebugDicom/`, which the
/// orchestrator itself writes into mid-pipeline; counting those as
/// reception activity would reset a study's debounce state while its own
/// pipeline is still running.
fn receiving_study_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut components = rel.components();
    let first = components.next()?.as_os_str().to_string_lossy().to_string();
    let key = first.strip_prefix("UID_")?.to_string();
    let second = components.next()?.as_os_str().to_string_lossy();
    if second == SUBDIR_DCM || second == SUBDIR_STRUCTURE {
        Some(key)
    } else {
        None
    }
}

fn count_files(dir: &Path) -> usize {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receiving_study_key_accepts_only_dcm_and_structure() {
        let root = Path::new("/spool");
        assert_eq!(
            receiving_study_key(root, Path::new("/spool/UID_1.2.3/DCM/a.dcm")),
            Some("1.2.3".to_string())
        );
        assert_eq!(
            receiving_study_key(root, Path::new("/spool/UID_1.2.3/Structure/s.dcm")),
            Some("1.2.3".to_string())
        );
        assert_eq!(receiving_study_key(root, Path::new("/spool/quarantine/x/a.dcm")), None);
        assert_eq!(receiving_study_key(root, Path::new("/other/UID_1.2.3/DCM/a.dcm")), None);
        // the orchestrator's own mid-pipeline writes must never register as activity
        assert_eq!(
            receiving_study_key(root, Path::new("/spool/UID_1.2.3/Addition/1.2.3.200/a.dcm")),
            None
        );
        assert_eq!(
            receiving_study_key(root, Path::new("/spool/UID_1.2.3/DebugDicom/1.2.3.200/a.dcm")),
            None
        );
    }

    #[tokio::test]
    async fn dispatch_ready_is_single_flight_until_new_activity() {
        let cfg = WatcherConfig {
            debounce_interval_seconds: 0,
            min_file_count_for_processing: 1,
        };
        let tmp = tempfile::tempdir().unwrap();
        let spool = Spool::new(crate::config::DirectoriesConfig {
            working: tmp.path().to_path_buf(),
            logs: tmp.path().join("logs"),
            quarantine_subdir: "quarantine".to_string(),
        });
        let watcher = Watcher::new(cfg, spool);
        let (tx, mut rx) = mpsc::channel(8);
        let mut states = HashMap::new();
        states.insert(
            "1.2.3".to_string(),
            StudyState {
                last_event: Instant::now() - Duration::from_secs(5),
                file_count: 1,
                scheduled: false,
            },
        );
        watcher.dispatch_ready(&mut states, &tx).await;
        assert!(rx.try_recv().is_ok());
        // second pass without new activity: already scheduled, no duplicate dispatch
        watcher.dispatch_ready(&mut states, &tx).await;
        assert!(rx.try_recv().is_err());
    }
}
