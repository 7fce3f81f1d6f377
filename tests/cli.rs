use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn mari(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("mari").unwrap();
    cmd.env_clear()
        .env("NO_COLOR", "1")
        .env("STORAGE_PATH", dir.path().join("letters.json"))
        .env("BACKUP_PATH", dir.path().join("backup"));
    cmd
}

fn request(dir: &TempDir, user: &str) -> String {
    let output = mari(dir)
        .args(["request", "--user", user, "--theme", "感謝", "--hour", "2"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let stdout = String::from_utf8(output.stdout).unwrap();
    stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix("ID:"))
        .map(|id| id.trim().to_string())
        .expect("request prints the letter id")
}

#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("mari").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage: mari <COMMAND>"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("batch"))
        .stdout(predicate::str::contains("request"))
        .stdout(predicate::str::contains("letters"))
        .stdout(predicate::str::contains("chat"));
}

#[test]
fn test_config_hides_keys() {
    let dir = TempDir::new().unwrap();
    mari(&dir)
        .env("GROQ_API_KEY", "gsk-very-secret")
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("batch_schedule_hours"))
        .stdout(predicate::str::contains("key set"))
        .stdout(predicate::str::contains("Configuration is valid."))
        .stdout(predicate::str::contains("gsk-very-secret").not());
}

#[test]
fn test_config_reports_problems() {
    let dir = TempDir::new().unwrap();
    mari(&dir)
        .env("GENERATION_TIMEOUT", "10")
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("GENERATION_TIMEOUT must be at least 60"));

    mari(&dir)
        .env("GENERATION_TIMEOUT", "10")
        .args(["letters", "--user", "u1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid configuration"));
}

#[test]
fn test_request_then_list() {
    let dir = TempDir::new().unwrap();
    let id = request(&dir, "u1");

    mari(&dir)
        .args(["letters", "--user", "u1"])
        .assert()
        .success()
        .stdout(predicate::str::contains(id.as_str()))
        .stdout(predicate::str::contains("pending"))
        .stdout(predicate::str::contains("gratitude"));

    mari(&dir)
        .arg("read")
        .arg(&id)
        .assert()
        .success()
        .stdout(predicate::str::contains("not been written yet"));
}

#[test]
fn test_second_request_same_day_is_rejected() {
    let dir = TempDir::new().unwrap();
    request(&dir, "u1");

    mari(&dir)
        .args(["request", "--user", "u1", "--theme", "daily", "--hour", "3"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Daily request limit reached"));
}

#[test]
fn test_request_rejects_low_affinity_and_bad_hour() {
    let dir = TempDir::new().unwrap();
    mari(&dir)
        .args(["request", "--user", "u1", "--theme", "daily", "--hour", "2", "--affinity", "10"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("below the required 40"));

    mari(&dir)
        .args(["request", "--user", "u1", "--theme", "daily", "--hour", "14"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not one of the batch hours"));
}

#[test]
fn test_read_unknown_letter() {
    let dir = TempDir::new().unwrap();
    mari(&dir)
        .args(["read", "no-such-letter"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Letter not found"));
}

#[test]
fn test_batch_with_nothing_due() {
    let dir = TempDir::new().unwrap();
    request(&dir, "u1");

    // The request is for a future hour, so nothing is generated.
    mari(&dir)
        .arg("batch")
        .assert()
        .success()
        .stdout(predicate::str::contains("Examined:  0"));
}

#[test]
fn test_batch_disabled() {
    let dir = TempDir::new().unwrap();
    mari(&dir)
        .env("ASYNC_LETTER_ENABLED", "false")
        .arg("batch")
        .assert()
        .success()
        .stdout(predicate::str::contains("disabled"));
}
