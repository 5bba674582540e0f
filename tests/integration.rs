use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

const LIBRARY_MSP: &str = "\
Name: target
DB#: LIB-1
PrecursorMZ: 300.1
Precursor_type: [M+H]+
Num Peaks: 2
100 50
150 100

Name: decoy
DB#: LIB-2
PrecursorMZ: 410.2
Precursor_type: [M+H]+
Num Peaks: 2
120 10
200 90
";

const QUERY_MGF: &str = "\
BEGIN IONS
TITLE=query one
PEPMASS=300.1
CHARGE=1+
100 50
150 100
END IONS
BEGIN IONS
TITLE=no charge
PEPMASS=410.2
120 10
END IONS
";

fn backend_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("entropy_search_backend");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();

    fs::write(root.join("library.msp"), LIBRARY_MSP).unwrap();
    fs::write(root.join("query.mgf"), QUERY_MGF).unwrap();

    let config_path = root.join("entropy.toml");
    fs::write(
        &config_path,
        r#"[search]
top_n = 10
cores = 2

[logging]
level = "warn"
"#,
    )
    .unwrap();

    (tmp, config_path)
}

fn run_backend(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = backend_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run backend binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn path_arg(dir: &TempDir, name: &str) -> String {
    dir.path().join(name).to_str().unwrap().to_string()
}

#[test]
fn test_info_reports_counts_and_charges() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) =
        run_backend(&config_path, &["info", &path_arg(&tmp, "library.msp")]);
    assert!(success, "info failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Spectra:     2"), "stdout: {}", stdout);
    assert!(stdout.contains("Peaks:       4"), "stdout: {}", stdout);
    assert!(stdout.contains("+1"), "stdout: {}", stdout);
}

#[test]
fn test_pack_then_info_on_esi() {
    let (tmp, config_path) = setup_test_env();
    let esi = path_arg(&tmp, "library.esi");

    let (stdout, stderr, success) =
        run_backend(&config_path, &["pack", &path_arg(&tmp, "library.msp"), &esi]);
    assert!(success, "pack failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Packed 2 spectra"));
    assert!(Path::new(&esi).exists());

    let (stdout, _, success) = run_backend(&config_path, &["info", &esi]);
    assert!(success);
    assert!(stdout.contains("Spectra:     2"));
}

#[test]
fn test_search_json_output() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_backend(
        &config_path,
        &[
            "search",
            "--query",
            &path_arg(&tmp, "query.mgf"),
            "--library",
            &path_arg(&tmp, "library.msp"),
            "--format",
            "json",
            "--progress",
            "off",
        ],
    );
    assert!(success, "search failed: stdout={}, stderr={}", stdout, stderr);

    let reports: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let reports = reports.as_array().unwrap();
    assert_eq!(reports.len(), 2);

    let first = &reports[0];
    assert_eq!(first["scan"], 1);
    assert_eq!(first["charge"], 1);
    let top = &first["identity_search"][0];
    assert_eq!(top["library-name"], "target");
    assert_eq!(top["library-id"], "LIB-1");
    assert!((top["score"].as_f64().unwrap() - 1.0).abs() < 1e-6);
    for mode in ["open_search", "neutral_loss_search", "hybrid_search"] {
        assert!(first[mode].is_array(), "missing {}", mode);
    }

    let second = &reports[1];
    assert_eq!(second["skipped"], "unknown charge");
    assert_eq!(second["identity_search"].as_array().unwrap().len(), 0);
}

#[test]
fn test_search_charge_override_searches_every_query() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_backend(
        &config_path,
        &[
            "search",
            "--query",
            &path_arg(&tmp, "query.mgf"),
            "--library",
            &path_arg(&tmp, "library.msp"),
            "--charge",
            "1+",
            "--format",
            "json",
            "--progress",
            "off",
        ],
    );
    assert!(success, "search failed: stdout={}, stderr={}", stdout, stderr);
    let reports: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert!(reports
        .as_array()
        .unwrap()
        .iter()
        .all(|r| r["skipped"].is_null() && r["charge"] == 1));
}

#[test]
fn test_search_text_output() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_backend(
        &config_path,
        &[
            "search",
            "--query",
            &path_arg(&tmp, "query.mgf"),
            "--library",
            &path_arg(&tmp, "library.msp"),
            "--progress",
            "off",
        ],
    );
    assert!(success);
    assert!(stdout.contains("scan 1 / query one"));
    assert!(stdout.contains("identity_search"));
    assert!(stdout.contains("target [M+H]+"));
    assert!(stdout.contains("skipped: unknown charge"));
}

#[test]
fn test_search_missing_file_fails() {
    let (tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_backend(
        &config_path,
        &[
            "search",
            "--query",
            &path_arg(&tmp, "missing.mgf"),
            "--library",
            &path_arg(&tmp, "library.msp"),
            "--progress",
            "off",
        ],
    );
    assert!(!success);
    assert!(stderr.contains("failed to read"), "stderr: {}", stderr);
}

#[test]
fn test_search_rejects_bad_tolerance() {
    let (tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_backend(
        &config_path,
        &[
            "search",
            "--query",
            &path_arg(&tmp, "query.mgf"),
            "--library",
            &path_arg(&tmp, "library.msp"),
            "--ms2",
            "0",
        ],
    );
    assert!(!success);
    assert!(stderr.contains("ms2_tolerance_in_da must be > 0"), "stderr: {}", stderr);
}
