use std::process::Command;

#[test]
fn main_lists_devices() {
    let bin = env!("CARGO_BIN_EXE_echomon");
    let output = Command::new(bin)
        .arg("--list-devices")
        .env("ECHOMON_TEST_INPUTS", "Mic A,Mic B")
        .env("ECHOMON_TEST_OUTPUTS", "Speaker A")
        .output()
        .expect("run echomon");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Available audio input devices:"));
    assert!(stdout.contains("Mic A"));
    assert!(stdout.contains("Mic B"));
    assert!(stdout.contains("Available audio output devices:"));
    assert!(stdout.contains("Speaker A"));
}

#[test]
fn main_reports_no_devices() {
    let bin = env!("CARGO_BIN_EXE_echomon");
    let output = Command::new(bin)
        .arg("--list-devices")
        .env("ECHOMON_TEST_INPUTS", "")
        .env("ECHOMON_TEST_OUTPUTS", "")
        .output()
        .expect("run echomon");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("No audio input devices detected."));
    assert!(stdout.contains("No audio output devices detected."));
}

#[test]
fn main_rejects_bad_sample_rate() {
    let bin = env!("CARGO_BIN_EXE_echomon");
    let output = Command::new(bin)
        .args(["--sample-rate", "100"])
        .output()
        .expect("run echomon");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--sample-rate"));
}
