use assert_cmd::prelude::*;
use std::path::Path;
use std::process::Command;

fn stdout(assert: &assert_cmd::assert::Assert) -> String {
    String::from_utf8_lossy(&assert.get_output().stdout).to_string()
}

fn stderr(assert: &assert_cmd::assert::Assert) -> String {
    String::from_utf8_lossy(&assert.get_output().stderr).to_string()
}

fn write_config(dir: &Path, config: serde_json::Value) -> std::path::PathBuf {
    let path = dir.join("ferry.json");
    std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
    path
}

#[test]
fn test_usage_error_exits_2() {
    let assert = Command::cargo_bin("migrate")
        .unwrap()
        .assert()
        .code(2);
    assert!(stderr(&assert).contains("Usage: migrate"));
}

#[test]
fn test_invalid_config_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        serde_json::json!({
            "localStatePath": dir.path().join("state"),
            "maxParallel": 0
        }),
    );

    let assert = Command::cargo_bin("migrate")
        .unwrap()
        .args(["run", "--devices", "PC-01", "--config"])
        .arg(&config)
        .assert()
        .code(2);
    assert!(stderr(&assert).contains("maxParallel"));
}

#[test]
fn test_missing_commands_is_fatal_before_any_work() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state");
    let config = write_config(dir.path(), serde_json::json!({ "localStatePath": state }));

    let assert = Command::cargo_bin("migrate")
        .unwrap()
        .args(["run", "--devices", "PC-01,PC-02", "--config"])
        .arg(&config)
        .assert()
        .code(2);
    assert!(stderr(&assert).contains("removeSourceManagement"));

    assert!(!state.join("ferry.redb").exists());
}

#[cfg(unix)]
#[test]
fn test_remote_device_without_continuation_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state");
    let devices = dir.path().join("devices");
    std::fs::create_dir_all(&devices).unwrap();
    std::fs::write(devices.join("PC-REMOTE-01.source"), "").unwrap();
    let d = devices.display();
    let config = write_config(
        dir.path(),
        serde_json::json!({
            "localStatePath": state,
            "commands": {
                "sourceManagementPresent": format!("test -f {d}/{{device}}.source"),
                "removeSourceManagement": format!("rm -f {d}/{{device}}.source"),
                "prepareTargetEnrollment": "true",
                "joinTargetDirectory": "true",
                "enrollTargetManagement": "true",
                "verifyEnrollment": "true",
                "captureComponent": "true",
                "restoreComponent": "true"
            }
        }),
    );

    let assert = Command::cargo_bin("migrate")
        .unwrap()
        .args(["run", "--devices", "PC-REMOTE-01", "--config"])
        .arg(&config)
        .assert()
        .code(2);
    assert!(stderr(&assert).contains("No continuation commands configured"));

    assert!(devices.join("PC-REMOTE-01.source").exists());
    assert!(!state.join("ferry.redb").exists());
}

#[cfg(unix)]
mod simulated_fleet {
    use super::*;

    /// Devices modelled as marker files in `devices`; a restart bumps the
    /// device's boot counter
    fn fleet_config(dir: &Path) -> std::path::PathBuf {
        let d = dir.join("devices");
        std::fs::create_dir_all(&d).unwrap();
        let d = d.display().to_string();

        write_config(
            dir,
            serde_json::json!({
                "localStatePath": dir.join("state"),
                "commands": {
                    "sourceManagementPresent": format!("test -f {d}/{{device}}.source"),
                    "removeSourceManagement": format!("rm -f {d}/{{device}}.source"),
                    "prepareTargetEnrollment": "true",
                    "joinTargetDirectory": format!("touch {d}/{{device}}.joined"),
                    "enrollTargetManagement": format!("test {{device}} != PC-BAD && touch {d}/{{device}}.enrolled"),
                    "verifyEnrollment": format!("test -f {d}/{{device}}.enrolled"),
                    "captureComponent": "echo {component} > {location}",
                    "restoreComponent": "true",
                    "restartDevice": format!(
                        "echo $(( $(cat {d}/{{device}}.boot 2>/dev/null || echo 0) + 1 )) > {d}/{{device}}.tmp && mv {d}/{{device}}.tmp {d}/{{device}}.boot"
                    )
                },
                "continuation": {
                    "register": format!("echo {{stage}} > {d}/{{device}}.task"),
                    "consume": format!("rm -f {d}/{{device}}.task"),
                    "bootId": format!("cat {d}/{{device}}.boot 2>/dev/null || echo 0"),
                    "isRegistered": format!("test -f {d}/{{device}}.task")
                }
            }),
        )
    }

    fn add_device(dir: &Path, device: &str) {
        std::fs::write(dir.join("devices").join(format!("{}.source", device)), "").unwrap();
    }

    #[test]
    fn test_fleet_run_succeeds_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let config = fleet_config(dir.path());
        add_device(dir.path(), "PC-01");
        add_device(dir.path(), "PC-02");
        let reports = dir.path().join("reports");

        let assert = Command::cargo_bin("migrate")
            .unwrap()
            .args(["run", "--devices", "PC-01,PC-02", "--parallel", "2", "--report-path"])
            .arg(&reports)
            .arg("--config")
            .arg(&config)
            .assert()
            .code(0);
        assert!(stdout(&assert).contains("2 succeeded"));

        let report = std::fs::read_dir(&reports)
            .unwrap()
            .map(|e| e.unwrap().path())
            .find(|p| p.file_name().unwrap().to_string_lossy().starts_with("fleet-report-"))
            .unwrap();
        let report: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(report).unwrap()).unwrap();
        assert_eq!(report["summary"]["succeeded"], 2);
        assert_eq!(report["jobs"][0]["status"], "succeeded");

        let devices = dir.path().join("devices");
        assert!(!devices.join("PC-01.source").exists());
        assert!(devices.join("PC-01.enrolled").exists());
        assert!(!devices.join("PC-01.task").exists());

        let output = Command::cargo_bin("migrate")
            .unwrap()
            .args(["status", "--device", "PC-01", "--config"])
            .arg(&config)
            .output()
            .unwrap();
        assert!(output.status.success());
        let record: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(record["stage"], "completed");
    }

    #[test]
    fn test_unwritable_report_keeps_fleet_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let config = fleet_config(dir.path());
        add_device(dir.path(), "PC-01");
        let reports = dir.path().join("reports");

        // The report directory is replaced by a file while the fleet runs
        let mut json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&config).unwrap()).unwrap();
        json["commands"]["finalize"] = serde_json::Value::String(format!(
            "rm -rf {r} && touch {r}",
            r = reports.display()
        ));
        std::fs::write(&config, serde_json::to_string_pretty(&json).unwrap()).unwrap();

        let assert = Command::cargo_bin("migrate")
            .unwrap()
            .args(["run", "--devices", "PC-01", "--report-path"])
            .arg(&reports)
            .arg("--config")
            .arg(&config)
            .assert()
            .code(0);
        assert!(stdout(&assert).contains("1 succeeded"));
        assert!(stderr(&assert).contains("Failed to write fleet report"));
        assert!(reports.is_file());
    }

    #[test]
    fn test_failed_device_exits_1_without_affecting_others() {
        let dir = tempfile::tempdir().unwrap();
        let config = fleet_config(dir.path());
        add_device(dir.path(), "PC-01");
        add_device(dir.path(), "PC-BAD");

        let assert = Command::cargo_bin("migrate")
            .unwrap()
            .args(["run", "--devices", "PC-01,PC-BAD", "--config"])
            .arg(&config)
            .assert()
            .code(1);
        assert!(stdout(&assert).contains("1 succeeded, 1 failed"));

        let output = Command::cargo_bin("migrate")
            .unwrap()
            .args(["status", "--device", "PC-BAD", "--config"])
            .arg(&config)
            .output()
            .unwrap();
        let record: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(record["stage"], "rolledBack");

        // A rolled back device can be archived without --force
        let assert = Command::cargo_bin("migrate")
            .unwrap()
            .args(["cleanup", "--device", "PC-BAD", "--config"])
            .arg(&config)
            .assert()
            .code(0);
        assert!(stdout(&assert).contains("Archived PC-BAD"));

        Command::cargo_bin("migrate")
            .unwrap()
            .args(["status", "--device", "PC-BAD", "--config"])
            .arg(&config)
            .assert()
            .code(1);
    }
}
