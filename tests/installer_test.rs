//! Atomic installation behavior.

use std::fs;
use std::os::unix::fs::PermissionsExt;

use warden::update::{atomic_install, validate_installed, InstallError, INSTALL_MODE};

#[test]
fn install_copies_content_and_sets_mode() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("staged");
    let dest = dir.path().join("bin").join("miner");
    fs::create_dir(dir.path().join("bin")).unwrap();
    fs::write(&src, b"payload-v2").unwrap();

    let installed = atomic_install(&src, &dest, INSTALL_MODE).unwrap();
    assert_eq!(installed, dest);
    assert_eq!(fs::read(&dest).unwrap(), b"payload-v2");

    let mode = fs::metadata(&dest).unwrap().permissions().mode() & 0o7777;
    assert_eq!(mode, 0o755);
    assert!(validate_installed(&dest, INSTALL_MODE));
}

#[test]
fn install_replaces_existing_destination() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("staged");
    let dest = dir.path().join("miner");
    fs::write(&src, b"new").unwrap();
    fs::write(&dest, b"old").unwrap();

    atomic_install(&src, &dest, INSTALL_MODE).unwrap();
    assert_eq!(fs::read(&dest).unwrap(), b"new");
}

#[test]
fn missing_source_leaves_destination_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("does-not-exist");
    let dest = dir.path().join("miner");
    fs::write(&dest, b"old").unwrap();

    let err = atomic_install(&src, &dest, INSTALL_MODE).unwrap_err();
    assert!(matches!(err, InstallError::SourceMissing(_)));
    assert_eq!(fs::read(&dest).unwrap(), b"old");
}

#[test]
fn no_stray_temp_files_remain_after_install() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("staged");
    let dest = dir.path().join("miner");
    fs::write(&src, b"payload").unwrap();

    atomic_install(&src, &dest, INSTALL_MODE).unwrap();

    let names: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names.len(), 2, "only source and destination expected: {names:?}");
}

#[test]
fn validation_rejects_wrong_mode_and_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("miner");
    fs::write(&path, b"payload").unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

    assert!(!validate_installed(&path, INSTALL_MODE));
    assert!(!validate_installed(&dir.path().join("absent"), INSTALL_MODE));
}
