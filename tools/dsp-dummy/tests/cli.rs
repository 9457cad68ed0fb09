use assert_cmd::Command;
use predicates::prelude::*;

fn dsp_dummy() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_dsp-dummy"));
    for var in [
        "DSP_DUMMY_LOG",
        "DSP_DUMMY_NTIMES",
        "DSP_DUMMY_BUFFER_SIZE",
        "DSP_DUMMY_ALIGNMENT",
        "DSP_DUMMY_GUARD_PAGES",
        "DSP_DUMMY_PROCESSOR",
        "DSP_DUMMY_NODE",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn help_lists_flags() {
    dsp_dummy()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--ntimes"))
        .stdout(predicate::str::contains("--debug"))
        .stdout(predicate::str::contains("--guard-pages"));
}

#[test]
fn default_run_completes_every_cycle() {
    dsp_dummy()
        .assert()
        .success()
        .stdout(predicate::str::contains("1000 cycles completed"));
}

#[test]
fn ntimes_flag_bounds_the_loop() {
    dsp_dummy()
        .args(["-n", "7", "--verify"])
        .assert()
        .success()
        .stdout(predicate::str::contains("7 cycles completed"));
}

#[test]
fn ntimes_can_come_from_the_environment() {
    dsp_dummy()
        .env("DSP_DUMMY_NTIMES", "3")
        .assert()
        .success()
        .stdout(predicate::str::contains("3 cycles completed"));
}

#[test]
fn buffer_layout_options_are_accepted() {
    dsp_dummy()
        .args([
            "-d",
            "--ntimes",
            "2",
            "--buffer-size",
            "10000",
            "--alignment",
            "1",
            "--guard-pages",
            "2",
            "--verify",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 cycles completed"));
}

#[test]
fn invalid_alignment_fails() {
    dsp_dummy()
        .args(["--alignment", "48", "-n", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid buffer configuration"));
}

#[test]
fn guard_pages_outside_range_are_rejected() {
    dsp_dummy().args(["--guard-pages", "3"]).assert().failure();
}

#[test]
fn missing_processor_is_a_lifecycle_failure() {
    dsp_dummy()
        .args(["--processor", "4", "-n", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to attach to processor 4"));
}

#[test]
fn unknown_node_is_a_lifecycle_failure() {
    dsp_dummy()
        .args(["--node", "00000000-0000-0000-0000-000000000001", "-n", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to allocate node"));
}

#[test]
fn malformed_node_uuid_is_rejected() {
    dsp_dummy().args(["--node", "not-a-uuid"]).assert().failure();
}
