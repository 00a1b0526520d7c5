use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn skillforge_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("skillforge");
    path
}

fn run_skillforge(args: &[&str]) -> (String, String, i32) {
    let binary = skillforge_binary();
    let output = Command::new(&binary)
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run skillforge binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.code().unwrap_or(-1))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha\n\nNotes about the Rust toolchain and cargo workspaces.",
    )
    .unwrap();
    fs::write(
        files_dir.join("beta.md"),
        "# Beta\n\nNotes about container images and deployment.",
    )
    .unwrap();

    let config = format!(
        r#"
definitions:
  - skill: {{ id: scan, type: file-scanner, name: file-scanner, params: {{ path: "{files}", filter: ["*.md"] }} }}
  - skill: {{ id: read, type: reader, name: file-reader }}
  - skill: {{ id: split, type: splitter, name: recursive-character, params: {{ chunk_size: 200, overlap: 20 }} }}
  - skill: {{ id: write, type: uploader, name: json-writer, params: {{ output_path: "{out}" }} }}
  - skillset:
      id: docs
      skills: [scan, read, split, write]
indexer:
  id: docs-indexer
  skillset: docs
"#,
        files = files_dir.display(),
        out = root.join("out/chunks.json").display(),
    );
    let config_path = root.join("indexer.yaml");
    fs::write(&config_path, config).unwrap();

    (tmp, config_path)
}

fn path_arg(p: &Path) -> &str {
    p.to_str().unwrap()
}

#[test]
fn test_validate_accepts_good_config() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, code) = run_skillforge(&["validate", "-c", path_arg(&config_path)]);
    assert_eq!(code, 0, "stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("configuration is valid"));
    assert!(stdout.contains("docs-indexer"));
}

#[test]
fn test_validate_rejects_bad_config_with_exit_3() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("bad.yaml");
    fs::write(
        &config_path,
        r#"
indexer:
  id: idx
  skillset:
    - { type: file-scanner, name: file-scanner, params: { path: /tmp } }
    - { type: splitter, name: recursive-character, params: { chunk_size: -1 } }
"#,
    )
    .unwrap();

    let (_, stderr, code) = run_skillforge(&["validate", "-c", path_arg(&config_path)]);
    assert_eq!(code, 3);
    assert!(stderr.contains("chunk_size"), "stderr={}", stderr);
}

#[test]
fn test_missing_config_file_exits_3() {
    let (_, _, code) = run_skillforge(&["validate", "-c", "/definitely/not/here.yaml"]);
    assert_eq!(code, 3);
}

#[test]
fn test_skills_lists_builtins() {
    let (stdout, _, code) = run_skillforge(&["skills"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("file-scanner/file-scanner"));
    assert!(stdout.contains("embedding/openai"));
    assert!(stdout.contains("uploader/json-writer"));
}

#[test]
fn test_run_writes_json_output() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, code) = run_skillforge(&[
        "run",
        "-c",
        path_arg(&config_path),
        "--progress",
        "off",
        "--json",
    ]);
    assert_eq!(code, 0, "stdout={}, stderr={}", stdout, stderr);

    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["indexer"], "docs-indexer");
    assert_eq!(report["runs"][0]["processed"], 2);
    assert_eq!(report["runs"][0]["failed"], 0);

    let written = fs::read_to_string(tmp.path().join("out/chunks.json")).unwrap();
    let chunks: Vec<String> = serde_json::from_str(&written).unwrap();
    assert_eq!(chunks.len(), 2);
    assert!(chunks.iter().any(|c| c.contains("cargo workspaces")));
}

#[test]
fn test_run_summary_is_human_readable() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, code) = run_skillforge(&["run", "-c", path_arg(&config_path), "--progress", "off"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("docs: 2 processed, 0 skipped, 0 failed"));
}

#[test]
fn test_fatal_run_still_prints_completed_skillsets() {
    let (tmp, _) = setup_test_env();
    let config_path = tmp.path().join("two.yaml");
    fs::write(
        &config_path,
        format!(
            r#"
definitions:
  - skill: {{ id: scan, type: file-scanner, name: file-scanner, params: {{ path: "{files}", filter: ["*.md"] }} }}
  - skill: {{ id: read, type: reader, name: file-reader }}
  - skill: {{ id: split, type: splitter, name: recursive-character, params: {{ chunk_size: 200, overlap: 20 }} }}
  - skill: {{ id: web, type: exporter, name: web, params: {{ url: "http://127.0.0.1:1/", timeout_secs: 2 }} }}
  - skillset: {{ id: docs, skills: [scan, read, split] }}
  - skillset: {{ id: site, skills: [web] }}
indexer:
  id: docs-indexer
  skillset: [docs, site]
"#,
            files = tmp.path().join("files").display(),
        ),
    )
    .unwrap();

    let (stdout, stderr, code) = run_skillforge(&["run", "-c", path_arg(&config_path), "--progress", "off"]);
    assert_eq!(code, 2, "stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("docs: 2 processed"), "stdout={}", stdout);
    assert!(stdout.contains("site: 0 processed"), "stdout={}", stdout);
    assert!(stderr.contains("unreachable"), "stderr={}", stderr);
}
