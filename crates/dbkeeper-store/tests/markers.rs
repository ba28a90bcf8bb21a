//! Cross-handle behavior of the file-backed markers: separate handles on the
//! same paths stand in for separate processes.

use dbkeeper_store::{InstallMarkers, InstallProgress, InstanceLayout, MarkerFile};

fn layout(root: &std::path::Path) -> InstanceLayout {
    InstanceLayout::new(root.join("data"), root.join("ext"), root.join("log"))
        .with_install_lock(root.join("tmp").join("set_install_step_lock"))
        .with_restore_dir(root.join("restore"))
}

#[test]
fn two_handles_race_on_install_lock() {
    let dir = tempfile::tempdir().unwrap();
    let a = InstallMarkers::new(&layout(dir.path()));
    let b = InstallMarkers::new(&layout(dir.path()));

    assert!(a.begin().unwrap());
    assert!(!b.begin().unwrap());
    assert_eq!(b.progress().unwrap(), InstallProgress::InProgress);

    a.mark_complete().unwrap();
    a.end().unwrap();
    assert_eq!(b.progress().unwrap(), InstallProgress::Complete);
}

#[test]
fn concurrent_acquire_has_single_winner() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ins_lock");
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let path = path.clone();
            std::thread::spawn(move || MarkerFile::new(path).try_acquire("").unwrap())
        })
        .collect();
    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);
}

#[test]
fn stop_lock_survives_clearing_install_lock() {
    let dir = tempfile::tempdir().unwrap();
    let layout = layout(dir.path());
    let stop = MarkerFile::new(layout.stop_lock());
    stop.try_acquire("").unwrap();

    let markers = InstallMarkers::new(&layout);
    markers.begin().unwrap();
    markers.end().unwrap();
    assert!(stop.is_held());
}
