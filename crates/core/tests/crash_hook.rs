use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use tempfile::tempdir;
use tilerefine_core::logging::{
    install_panic_hook, PanicHookInstallPlan, DEFAULT_CRASH_DIR_NAME, DEFAULT_LOG_DIR_NAME,
};

const CHILD_MODE_ENV: &str = "TILEREFINE_PANIC_CHILD_MODE";
const CHILD_DATA_DIR_ENV: &str = "TILEREFINE_PANIC_CHILD_DATA_DIR";

fn run_panic_child(mode: &str, data_dir: &Path) -> std::process::Output {
    Command::new(std::env::current_exe().expect("test executable path"))
        .arg("panic_hook_child_entrypoint")
        .arg("--exact")
        .arg("--nocapture")
        .env(CHILD_MODE_ENV, mode)
        .env(CHILD_DATA_DIR_ENV, data_dir)
        .output()
        .expect("run panic hook child")
}

fn crash_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(DEFAULT_LOG_DIR_NAME).join(DEFAULT_CRASH_DIR_NAME)
}

fn crash_artifacts(dir: &Path) -> Vec<PathBuf> {
    let mut paths = fs::read_dir(dir)
        .expect("read crash directory")
        .map(|entry| entry.expect("read crash directory entry").path())
        .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("log"))
        .collect::<Vec<_>>();
    paths.sort();
    paths
}

/// Runs only inside the child process spawned by the tests below.
#[test]
fn panic_hook_child_entrypoint() {
    let Ok(mode) = std::env::var(CHILD_MODE_ENV) else {
        return;
    };
    let data_dir = PathBuf::from(std::env::var(CHILD_DATA_DIR_ENV).expect("data dir env"));

    let first = install_panic_hook(Some(data_dir.as_path()));
    assert!(matches!(first, PanicHookInstallPlan::Installed { .. }));
    let second = install_panic_hook(Some(data_dir.as_path()));
    assert!(matches!(second, PanicHookInstallPlan::AlreadyInstalled { .. }));

    match mode.as_str() {
        "write_success" => panic!("tile 3 exploded"),
        "write_failure" => {
            let dir = crash_dir(&data_dir);
            fs::remove_dir_all(&dir).expect("remove crash directory");
            fs::write(&dir, b"not-a-directory").expect("replace crash directory with file");
            panic!("crash dir is gone");
        }
        other => panic!("unknown panic hook child mode: {other}"),
    }
}

#[test]
fn crash_hook_writes_crash_file() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_panic_child("write_success", data_dir.path());
    assert!(!output.status.success(), "child process should panic");

    let artifacts = crash_artifacts(&crash_dir(data_dir.path()));
    let newest = artifacts.last().expect("expected crash artifact");
    let contents = fs::read_to_string(newest).expect("read crash artifact");

    assert!(contents.contains("timestamp_utc="));
    assert!(contents.contains("payload=tile 3 exploded"));
    assert!(contents.contains("location="));
    assert!(contents.contains("backtrace:"));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("thread panicked while panicking"));
}

#[test]
fn crash_hook_unwritable_dir_warns_and_does_not_repanic() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_panic_child("write_failure", data_dir.path());
    assert!(!output.status.success(), "child process should panic");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("crash dir is gone"));
    assert!(stderr.contains("Warning: failed to write panic crash artifact under"));
    assert!(!stderr.contains("thread panicked while panicking"));
}
