use std::process::{Command, Output};

fn cosim_run(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_cosim-run"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("failed to run cosim-run")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn demo_model_runs_for_the_requested_quanta() {
    let output = cosim_run(&["--quantum-ns", "1000", "--max-quanta", "5"]);
    let out = stdout(&output);
    assert!(
        output.status.success(),
        "stdout:\n{out}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(out.contains("cosim demo: hello"), "{out}");
    assert!(out.contains("reason=QuantumLimit"), "{out}");
    assert!(out.contains("now_ns=5000 quanta=5"), "{out}");
}

#[test]
fn host_dmi_serves_the_demo_without_the_mailbox() {
    let output = cosim_run(&[
        "--quantum-ns",
        "1000",
        "--max-quanta",
        "3",
        "--dmi",
        "host",
        "--dmi-base",
        "0x80000000",
        "--dmi-size",
        "0x1000",
    ]);
    let out = stdout(&output);
    assert!(output.status.success(), "{out}");
    // One write and one read per quantum through the fast path.
    assert!(out.contains("dmi_hits=6"), "{out}");
}

#[test]
fn config_file_values_are_used_and_flags_override_them() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cosim.json");
    std::fs::write(&path, r#"{ "quantum_ns": 250, "max_quanta": 9 }"#).unwrap();

    let output = cosim_run(&["--config", path.to_str().unwrap(), "--max-quanta", "2"]);
    let out = stdout(&output);
    assert!(output.status.success(), "{out}");
    assert!(out.contains("now_ns=500 quanta=2"), "{out}");
}

#[test]
fn missing_library_is_a_fatal_setup_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("libnope.so");
    let output = cosim_run(&["--library", missing.to_str().unwrap()]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to attach CPU module"), "{stderr}");
}

#[test]
fn invalid_config_is_rejected() {
    let output = cosim_run(&["--quantum-ns", "0"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("quantum_ns must be non-zero"), "{stderr}");
}
