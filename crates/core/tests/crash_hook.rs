use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use stemflow_core::logging::{crash_dir, install_panic_hook, PanicHookStatus};
use tempfile::tempdir;

const MODE_ENV: &str = "STEMFLOW_PANIC_CHILD_MODE";
const DATA_DIR_ENV: &str = "STEMFLOW_PANIC_CHILD_DATA_DIR";

fn run_child(mode: &str, data_dir: &Path) -> Output {
    Command::new(std::env::current_exe().expect("test binary"))
        .args(["panicking_child", "--exact", "--nocapture"])
        .env(MODE_ENV, mode)
        .env(DATA_DIR_ENV, data_dir)
        .output()
        .expect("spawn child")
}

fn crash_logs(dir: &Path) -> Vec<PathBuf> {
    let mut logs: Vec<PathBuf> = fs::read_dir(dir)
        .expect("crash dir")
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "log"))
        .collect();
    logs.sort();
    logs
}

/// Entry point re-run in a child process by the tests below; a no-op otherwise.
#[test]
fn panicking_child() {
    let Ok(mode) = std::env::var(MODE_ENV) else {
        return;
    };
    let data_dir = PathBuf::from(std::env::var(DATA_DIR_ENV).expect("data dir env"));

    assert!(matches!(
        install_panic_hook(Some(&data_dir)),
        PanicHookStatus::Installed(_) | PanicHookStatus::AlreadyInstalled(_)
    ));
    assert!(matches!(
        install_panic_hook(Some(&data_dir)),
        PanicHookStatus::AlreadyInstalled(_)
    ));

    match mode.as_str() {
        "writable" => panic!("scheduler tick exploded"),
        "unwritable" => {
            let dir = crash_dir(&data_dir);
            fs::remove_dir_all(&dir).expect("remove crash dir");
            fs::write(&dir, b"file in the way").expect("block crash dir");
            panic!("scheduler tick exploded without a crash dir");
        }
        other => panic!("unknown child mode {other}"),
    }
}

#[test]
fn panic_writes_crash_report() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_child("writable", data_dir.path());
    assert!(!output.status.success());

    let logs = crash_logs(&crash_dir(data_dir.path()));
    assert_eq!(logs.len(), 1, "exactly one crash report expected");
    let text = fs::read_to_string(&logs[0]).expect("read crash report");
    assert!(text.contains("message=scheduler tick exploded"));
    assert!(text.contains("location="));
    assert!(text.contains("backtrace:"));
}

#[test]
fn unwritable_crash_dir_still_panics_normally() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_child("unwritable", data_dir.path());
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("could not write crash report"));
    assert!(stderr.contains("scheduler tick exploded without a crash dir"));
    assert!(crash_dir(data_dir.path()).is_file());
}

#[test]
fn hook_needs_a_data_dir() {
    assert!(matches!(
        install_panic_hook(None),
        PanicHookStatus::Unavailable(_)
    ));
}
