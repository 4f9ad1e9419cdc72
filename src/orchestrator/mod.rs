//! Orchestrator: owns the study lifecycle and wires the anonymiser, contour
//! engine, series synthesiser, and sender around the spool.
//!
//! New module; the dispatch-worker bound and the one-task-per-unit-of-work
//! shape follow the teacher's association-handling loop in `storescp/mod.rs`
//! (one task per accepted association, a bounded count of them in flight),
//! generalised from per-association concurrency to per-study pipeline
//! concurrency. The completion handoff back to the Watcher is this
//! service's own addition, since the teacher has no equivalent lifecycle.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use dicom_object::DefaultDicomObject;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::anonymize;
use crate::config::Config;
use crate::contour::{self, MaskPlane};
use crate::dicom_view;
use crate::error::{Error, Result};
use crate::sender;
use crate::spool::{Spool, SUBDIR_ADDITION, SUBDIR_DCM, SUBDIR_DEBUG, SUBDIR_STRUCTURE};
use crate::synth;
use crate::txlog::{Event, TransactionLog};
use crate::watcher::StudyReady;

/// Recommended attempt count from this service's send-retry policy.
const SEND_RETRY_ATTEMPTS: u32 = 3;

enum Outcome {
    Sent,
    Quarantined(&'static str),
}

pub struct Orchestrator {
    spool: Spool,
    cfg: Config,
    txlog: Arc<TransactionLog>,
    fatal_tx: mpsc::Sender<String>,
}

impl Orchestrator {
    pub fn new(cfg: Config, spool: Spool, txlog: Arc<TransactionLog>, fatal_tx: mpsc::Sender<String>) -> Self {
        Orchestrator {
            spool,
            cfg,
            txlog,
            fatal_tx,
        }
    }

    /// Runs until `ready_rx` closes or `shutdown` fires. Spawns one task per
    /// dispatched study, bounded by `concurrency.pipeline_workers`
    /// concurrent permits. A shutdown signal stops accepting new studies,
    /// then this waits for every already-spawned dispatch to finish before
    /// returning — an in-flight pipeline is never interrupted.
    ///
    /// `in_flight_keys` enforces spec.md §8's testable invariant that at
    /// most one pipeline worker ever holds the lock for a given study key:
    /// a `StudyReady` for a key already dispatched is dropped rather than
    /// spawning a second concurrent pipeline for the same study.
    pub async fn run(
        self: Arc<Self>,
        mut ready_rx: mpsc::Receiver<StudyReady>,
        completed_tx: mpsc::Sender<String>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.cfg.concurrency.pipeline_workers.max(1)));
        let mut in_flight: JoinSet<String> = JoinSet::new();
        let mut in_flight_keys: HashSet<String> = HashSet::new();
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("orchestrator stopped accepting new studies, draining in-flight pipelines");
                    break;
                }
                maybe = ready_rx.recv() => {
                    match maybe {
                        Some(ready) => {
                            if !in_flight_keys.insert(ready.study_key.clone()) {
                                warn!(study = %ready.study_key, "study already has an in-flight pipeline, dropping duplicate dispatch");
                                continue;
                            }
                            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                                Ok(p) => p,
                                Err(_) => break,
                            };
                            let this = Arc::clone(&self);
                            let completed_tx = completed_tx.clone();
                            let key = ready.study_key.clone();
                            in_flight.spawn(async move {
                                this.dispatch(key.clone()).await;
                                drop(permit);
                                let _ = completed_tx.send(key.clone()).await;
                                key
                            });
                        }
                        None => break,
                    }
                }
                finished = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Some(Ok(key)) = finished {
                        in_flight_keys.remove(&key);
                    }
                }
            }
        }
        while let Some(finished) = in_flight.join_next().await {
            if let Ok(key) = finished {
                in_flight_keys.remove(&key);
            }
        }
    }

    fn peer_endpoint(&self) -> String {
        format!("{}:{}", self.cfg.dicom_destination.ip, self.cfg.dicom_destination.port)
    }

    async fn dispatch(&self, study_key: String) {
        self.txlog.record(&study_key, None, Event::ProcessingStart, None);

        let mut result = self.run_pipeline(&study_key).await;
        if let Err(Error::Io { .. }) = &result {
            warn!(study = %study_key, "spool io error mid-pipeline, retrying once");
            result = self.run_pipeline(&study_key).await;
        }

        match result {
            Ok(Outcome::Sent) => {
                info!(study = %study_key, "study processed, sent, and cleaned up");
                self.txlog.record(&study_key, Some(&self.peer_endpoint()), Event::SendingSuccess, None);
            }
            Ok(Outcome::Quarantined(reason)) => {
                self.txlog.record(&study_key, None, Event::Quarantined, Some(reason));
            }
            Err(e) => {
                tracing::error!(study = %study_key, error = %e, "unrecoverable spool error, escalating to fatal abort");
                self.txlog.record(&study_key, None, Event::FatalAbort, Some(e.kind().as_str()));
                let _ = self.fatal_tx.send(format!("study {study_key}: {e}")).await;
            }
        }
    }

    async fn run_pipeline(&self, study_key: &str) -> Result<Outcome> {
        match self.run_pipeline_inner(study_key).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => self.classify_pipeline_error(study_key, e),
        }
    }

    fn classify_pipeline_error(&self, study_key: &str, e: Error) -> Result<Outcome> {
        match &e {
            // io-error on the spool escalates past this function; the
            // caller decides whether to retry once more or go fatal.
            Error::Io { .. } => Err(e),
            Error::SendTransient { .. } | Error::SendFatal { .. } => {
                self.spool.quarantine(study_key, "send-failed", &timestamp_suffix())?;
                Ok(Outcome::Quarantined("send-failed"))
            }
            _ => {
                let reason = e.kind().as_str();
                self.spool.quarantine(study_key, reason, &timestamp_suffix())?;
                Ok(Outcome::Quarantined(reason))
            }
        }
    }

    async fn run_pipeline_inner(&self, study_key: &str) -> Result<Outcome> {
        let dcm_root = self.spool.subdir_path(study_key, SUBDIR_DCM)?;
        let structure_root = self.spool.subdir_path(study_key, SUBDIR_STRUCTURE)?;

        let dcm_files = collect_dcm_files(&dcm_root);
        let structure_files = collect_dcm_files(&structure_root);
        if dcm_files.is_empty() || structure_files.is_empty() {
            return Err(Error::IncompleteStudy {
                study: study_key.to_string(),
                reason: "DCM/ or Structure/ has no instances".to_string(),
            });
        }

        if self.cfg.anonymization.enabled {
            for path in dcm_files.iter().chain(structure_files.iter()) {
                anonymize_file_in_place(path, &self.cfg.anonymization)?;
            }
        }

        if structure_files.len() > 1 {
            warn!(
                study = %study_key,
                count = structure_files.len(),
                chosen = %structure_files[0].display(),
                "multiple structure set files found, using the lexicographically first"
            );
        }
        let structure_obj: DefaultDicomObject = dicom_object::open_file(&structure_files[0]).map_err(Error::codec)?;
        let structure_set = contour::parse_structure_set(&structure_obj)?;

        let survivors: Vec<_> = structure_set
            .rois
            .iter()
            .filter(|roi| !contour::is_ignored(&roi.name, &self.cfg.processing.ignore_contour_names_containing))
            .collect();
        if survivors.is_empty() {
            return Err(Error::RoiEmpty);
        }
        if survivors.len() > 1 {
            warn!(study = %study_key, count = survivors.len(), "multiple non-ignored ROIs, merging");
        }

        let mut instances: Vec<(DefaultDicomObject, dicom_view::InstancePose, i64, String)> = Vec::new();
        for path in &dcm_files {
            let obj: DefaultDicomObject = dicom_object::open_file(path).map_err(Error::codec)?;
            let for_key = dicom_view::frame_of_reference(&obj);
            if for_key.as_ref() != Some(&structure_set.frame_of_reference) {
                continue;
            }
            let pose = dicom_view::instance_pose(&obj)?;
            let sop = dicom_view::sop_instance_uid(&obj)?;
            let instance_num = dicom_view::instance_number(&obj).unwrap_or(0);
            instances.push((obj, pose, instance_num, sop));
        }
        if instances.is_empty() {
            return Err(Error::CoordinateMismatch {
                reason: "no DCM/ instance shares the structure set's frame-of-reference".to_string(),
            });
        }

        instances.sort_by(|a, b| {
            a.1.slice_position()
                .partial_cmp(&b.1.slice_position())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.2.cmp(&b.2))
                .then_with(|| a.3.cmp(&b.3))
        });

        let mut masks: Vec<MaskPlane> = instances
            .iter()
            .map(|(_, pose, _, _)| MaskPlane::empty(pose.rows, pose.columns))
            .collect();

        let slice_positions: Vec<f64> = instances.iter().map(|(_, pose, _, _)| pose.slice_position()).collect();
        let slice_match_tolerance_mm = contour::slice_match_tolerance_mm(&slice_positions);
        debug!(study = %study_key, tolerance = slice_match_tolerance_mm, "derived slice-match tolerance from series spacing");

        for roi in &survivors {
            for polygon in &roi.contours {
                let z = polygon.points.first().map(|p| p[2]).unwrap_or(0.0);
                let matched = instances
                    .iter()
                    .position(|(_, pose, _, _)| (pose.slice_position() - z).abs() <= slice_match_tolerance_mm);
                match matched {
                    Some(i) => {
                        let plane = contour::rasterize_polygon(polygon, &instances[i].1);
                        masks[i].merge(&plane);
                    }
                    None => {
                        debug!(study = %study_key, roi = %roi.name, z, "contour polygon matched no slice, dropped");
                    }
                }
            }
        }

        let series_instance_uid = synth::new_uid();
        let addition_root = self.spool.subdir_path(study_key, SUBDIR_ADDITION)?.join(&series_instance_uid);
        std::fs::create_dir_all(&addition_root).map_err(|e| Error::io(&addition_root, e))?;

        let debug_root = if self.cfg.feature_flags.enable_debug_visualisation {
            let root = self.spool.subdir_path(study_key, SUBDIR_DEBUG)?.join(&series_instance_uid);
            std::fs::create_dir_all(&root).map_err(|e| Error::io(&root, e))?;
            Some(root)
        } else {
            None
        };

        let mut addition_files = Vec::new();
        let mut debug_files = Vec::new();

        for (i, ((source_obj, _pose, _num, _sop), mask)) in instances.iter().zip(masks.iter()).enumerate() {
            let transfer_syntax_uid = source_obj.meta().transfer_syntax.trim_end_matches('\0').to_string();
            let instance_number = (i + 1) as i64;

            let derived = synth::build_overlay_instance(
                source_obj,
                std::slice::from_ref(mask),
                &series_instance_uid,
                instance_number,
                &self.cfg.processing,
            )?;
            let derived_file = synth::finalize_file_meta(derived, &transfer_syntax_uid)?;
            let sop_instance_uid = dicom_view::sop_instance_uid(&derived_file)?;
            let dest = addition_root.join(format!("{sop_instance_uid}.dcm"));
            write_dicom_atomic(&derived_file, &dest)?;
            addition_files.push(dest);

            if let Some(debug_root) = &debug_root {
                let debug_instance = synth::build_debug_capture_instance(
                    source_obj,
                    mask,
                    &series_instance_uid,
                    instance_number,
                    &self.cfg.processing,
                )?;
                let debug_file = synth::finalize_file_meta(debug_instance, &transfer_syntax_uid)?;
                let debug_sop = dicom_view::sop_instance_uid(&debug_file)?;
                let dest = debug_root.join(format!("{debug_sop}.dcm"));
                write_dicom_atomic(&debug_file, &dest)?;
                debug_files.push(dest);
            }
        }

        self.txlog.record(study_key, None, Event::ProcessingSuccess, None);

        let mut queued = Vec::new();
        for path in addition_files.iter().chain(debug_files.iter()) {
            queued.push(sender::check_file(path)?);
        }
        self.txlog.record(study_key, Some(&self.peer_endpoint()), Event::SendingStart, None);
        sender::send_batch(
            &self.cfg.dicom_destination,
            &self.cfg.dicom_listener.ae_title,
            &queued,
            SEND_RETRY_ATTEMPTS,
        )
        .await?;

        self.spool.cleanup(study_key)?;
        Ok(Outcome::Sent)
    }
}

fn timestamp_suffix() -> String {
    Utc::now().format("%Y%m%dT%H%M%S%3f").to_string()
}

fn collect_dcm_files(dir: &Path) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().to_path_buf())
        .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("dcm"))
        .collect();
    out.sort();
    out
}

fn anonymize_file_in_place(path: &Path, cfg: &crate::config::AnonymizationConfig) -> Result<()> {
    let mut obj: DefaultDicomObject = dicom_object::open_file(path).map_err(Error::codec)?;
    anonymize::apply(&mut obj, cfg)?;
    write_dicom_atomic(&obj, path)
}

fn write_dicom_atomic(obj: &DefaultDicomObject, dest: &Path) -> Result<()> {
    let parent = dest.parent().ok_or_else(|| Error::internal("destination has no parent"))?;
    let tmp_name = format!(".tmp-{}", dest.file_name().and_then(|n| n.to_str()).unwrap_or("write"));
    let tmp_path = parent.join(tmp_name);
    obj.write_to_file(&tmp_path).map_err(Error::codec)?;
    std::fs::rename(&tmp_path, dest).map_err(|e| Error::io(dest, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_dcm_files_ignores_non_dcm_entries_and_sorts() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("series1")).unwrap();
        std::fs::write(tmp.path().join("series1").join("b.dcm"), b"x").unwrap();
        std::fs::write(tmp.path().join("series1").join("a.dcm"), b"x").unwrap();
        std::fs::write(tmp.path().join("series1").join("notes.txt"), b"x").unwrap();

        let files = collect_dcm_files(tmp.path());
        assert_eq!(files.len(), 2);
        assert!(files[0] < files[1]);
    }

    #[test]
    fn timestamp_suffix_is_sortable_and_nonempty() {
        let a = timestamp_suffix();
        assert!(!a.is_empty());
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '.'));
    }
}
