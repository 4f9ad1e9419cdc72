//! A `Spool` holds no in-memory state beyond its configured paths, so a
//! fresh instance built over the same working directory after a simulated
//! process restart must behave identically to the instance that created it
//! — recovering from crash leftovers and picking the study back up.

use netrt_edge::config::DirectoriesConfig;
use netrt_edge::spool::{Spool, SUBDIR_DCM, SUBDIR_STRUCTURE};

fn dirs_cfg(dir: &std::path::Path) -> DirectoriesConfig {
    DirectoriesConfig {
        working: dir.to_path_buf(),
        logs: dir.join("logs"),
        quarantine_subdir: "quarantine".to_string(),
    }
}

#[test]
fn study_created_before_restart_is_visible_and_cleanable_after() {
    let tmp = tempfile::tempdir().unwrap();

    let spool_a = Spool::new(dirs_cfg(tmp.path()));
    spool_a.init().unwrap();
    let root = spool_a.create("1.2.840.10008.1").unwrap();
    spool_a
        .write_atomic(&root.join(SUBDIR_DCM).join("a.dcm"), b"image-bytes")
        .unwrap();
    spool_a
        .write_atomic(&root.join(SUBDIR_STRUCTURE).join("s.dcm"), b"rtstruct-bytes")
        .unwrap();
    drop(spool_a);

    // simulate process restart: a brand new Spool over the same directories
    let spool_b = Spool::new(dirs_cfg(tmp.path()));
    spool_b.init().unwrap();
    spool_b.sweep_deleted_markers().unwrap();

    let studies = spool_b.list_studies().unwrap();
    assert_eq!(studies, vec!["1.2.840.10008.1".to_string()]);

    let dcm_path = spool_b.subdir_path("1.2.840.10008.1", SUBDIR_DCM).unwrap().join("a.dcm");
    assert_eq!(std::fs::read(&dcm_path).unwrap(), b"image-bytes");

    spool_b.cleanup("1.2.840.10008.1").unwrap();
    assert!(spool_b.list_studies().unwrap().is_empty());
}

#[test]
fn crash_between_rename_and_remove_is_swept_on_next_startup() {
    let tmp = tempfile::tempdir().unwrap();
    let spool = Spool::new(dirs_cfg(tmp.path()));
    spool.init().unwrap();
    let root = spool.create("1.2.3").unwrap();

    // emulate the half-finished state `cleanup` would leave behind if the
    // process died between the rename and the remove_dir_all
    std::fs::rename(&root, tmp.path().join(".deleted-1.2.3")).unwrap();
    assert!(tmp.path().join(".deleted-1.2.3").exists());

    let spool_restarted = Spool::new(dirs_cfg(tmp.path()));
    spool_restarted.init().unwrap();
    spool_restarted.sweep_deleted_markers().unwrap();

    assert!(!tmp.path().join(".deleted-1.2.3").exists());
    assert!(spool_restarted.list_studies().unwrap().is_empty());
}

#[test]
fn crash_mid_write_leaves_no_temp_file_visible_after_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let spool = Spool::new(dirs_cfg(tmp.path()));
    spool.init().unwrap();
    let root = spool.create("1.2.3").unwrap();

    // emulate a crash mid-write: a bare `.tmp-` file left in a series dir
    std::fs::write(root.join(SUBDIR_DCM).join(".tmp-a.dcm"), b"partial").unwrap();

    let spool_restarted = Spool::new(dirs_cfg(tmp.path()));
    spool_restarted.init().unwrap();

    let leftovers: Vec<_> = std::fs::read_dir(root.join(SUBDIR_DCM))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
        .collect();
    assert!(leftovers.is_empty());
}
