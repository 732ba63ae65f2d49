use std::path::Path;
use std::process::Command;

fn run_kiln(args: &[&str], dir: &Path) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_kiln"))
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to execute kiln");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn assert_success(args: &[&str], dir: &Path) -> (String, String) {
    let (stdout, stderr, success) = run_kiln(args, dir);
    assert!(success, "kiln {:?} should succeed, stderr:\n{}", args, stderr);
    (stdout, stderr)
}

fn assert_failure(args: &[&str], dir: &Path) -> String {
    let (_, stderr, success) = run_kiln(args, dir);
    assert!(!success, "kiln {:?} should fail", args);
    stderr
}

fn write_batch(dir: &Path, source: &str) {
    std::fs::write(dir.join("batch.toml"), source).unwrap();
}

#[test]
fn test_init_then_emit() {
    let dir = tempfile::tempdir().unwrap();
    let (stdout, _) = assert_success(&["init", "."], dir.path());
    assert!(stdout.contains("Created sample batch"));
    assert!(dir.path().join("batch.toml").exists());
    assert!(dir.path().join("kiln.toml").exists());

    let (stdout, _) = assert_success(&["emit", "batch.toml"], dir.path());
    assert!(stdout.contains("main (fn0) @ 0x"));
    assert!(stdout.contains("helper (fn1) @ 0x"));
    assert!(stdout.contains("2 functions"));
    assert!(stdout.contains("8 arena bytes"));
}

#[test]
fn test_init_refuses_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    assert_success(&["init", "."], dir.path());
    let stderr = assert_failure(&["init", "."], dir.path());
    assert!(stderr.contains("already exists"));
}

#[test]
fn test_emit_json_report() {
    let dir = tempfile::tempdir().unwrap();
    write_batch(
        dir.path(),
        r#"
[[functions]]
id = 0
name = "answer"

[[functions.blocks]]
number = 0
insts = [{ op = "mov_ri", dst = "rax", imm = 42 }, { op = "ret" }]
"#,
    );
    let (stdout, _) = assert_success(&["emit", "batch.toml", "--format", "json"], dir.path());
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let func = &report["functions"][0];
    assert_eq!(func["name"], "answer");
    assert_eq!(func["size"], 8);
    // mov rax, 42; ret
    assert_eq!(func["code"], "48c7c02a000000c3");
    assert_eq!(report["stats"]["functions"], 1);
    assert_eq!(report["stats"]["retries"], 0);
}

#[test]
fn test_emit_retries_small_buffer() {
    let dir = tempfile::tempdir().unwrap();
    let nops = vec![r#"{ op = "nop" }"#; 5000].join(", ");
    write_batch(
        dir.path(),
        &format!(
            "[[functions]]\nid = 0\nname = \"big\"\n\n[[functions.blocks]]\nnumber = 0\ninsts = [{}, {{ op = \"ret\" }}]\n",
            nops
        ),
    );
    let (stdout, _) = assert_success(
        &["emit", "batch.toml", "--format", "json", "--initial-size", "64"],
        dir.path(),
    );
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["functions"][0]["size"], 5001);
    assert!(report["stats"]["retries"].as_u64().unwrap() >= 1);
}

#[test]
fn test_trace_logs_to_stderr() {
    let dir = tempfile::tempdir().unwrap();
    assert_success(&["init", "."], dir.path());
    let (_, stderr) = assert_success(&["emit", "batch.toml", "--trace"], dir.path());
    assert!(stderr.contains("emitting 'main'"));
}

#[test]
fn test_config_beside_batch() {
    let dir = tempfile::tempdir().unwrap();
    assert_success(&["init", "."], dir.path());
    std::fs::write(dir.path().join("kiln.toml"), "format = \"json\"\n").unwrap();
    let (stdout, _) = assert_success(&["emit", "batch.toml"], dir.path());
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["functions"].as_array().unwrap().len(), 2);
}

#[test]
fn test_unresolved_symbol_fails() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("kiln.toml"),
        "search_process_symbols = false\n",
    )
    .unwrap();
    write_batch(
        dir.path(),
        r#"
[[functions]]
id = 0
name = "caller"

[[functions.blocks]]
number = 0
insts = [{ op = "call_symbol", name = "kiln_missing_symbol" }, { op = "ret" }]
"#,
    );
    let stderr = assert_failure(&["emit", "batch.toml"], dir.path());
    assert!(stderr.contains("kiln_missing_symbol"));
}

#[test]
fn test_missing_batch_fails() {
    let dir = tempfile::tempdir().unwrap();
    let stderr = assert_failure(&["emit", "nope.toml"], dir.path());
    assert!(stderr.contains("failed to read"));
}

#[test]
fn test_malformed_batch_fails() {
    let dir = tempfile::tempdir().unwrap();
    write_batch(dir.path(), "[[functions]]\nid = \"zero\"\n");
    let stderr = assert_failure(&["emit", "batch.toml"], dir.path());
    assert!(stderr.contains("failed to parse"));
}
