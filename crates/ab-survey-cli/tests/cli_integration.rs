use std::ffi::OsStr;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    fn new(prefix: &str, items: &[&str]) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
            .as_nanos();
        let root = std::env::temp_dir().join(format!("{prefix}-{now}"));
        for dir in ["images_a", "images_b", "testers"] {
            fs::create_dir_all(root.join(dir))
                .unwrap_or_else(|err| panic!("failed to create {dir} in {}: {err}", root.display()));
        }
        for item in items {
            for dir in ["images_a", "images_b"] {
                let path = root.join(dir).join(item);
                fs::write(&path, dir.as_bytes())
                    .unwrap_or_else(|err| panic!("failed to write {}: {err}", path.display()));
            }
        }
        Self { root }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn base_args(&self) -> Vec<String> {
        vec![
            "--variant-a-dir".to_string(),
            path_string(&self.path("images_a")),
            "--variant-b-dir".to_string(),
            path_string(&self.path("images_b")),
            "--db".to_string(),
            path_string(&self.path("ab_survey.sqlite3")),
            "--results-csv".to_string(),
            path_string(&self.path("ab_test_results.csv")),
            "--tester-results-dir".to_string(),
            path_string(&self.path("testers")),
        ]
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn path_string(path: &Path) -> String {
    path.to_str()
        .unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
        .to_string()
}

fn run_abt<I, S>(sandbox: &Sandbox, args: I, stdin: &str) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut child = Command::new(env!("CARGO_BIN_EXE_abt"))
        .current_dir(&sandbox.root)
        .args(sandbox.base_args())
        .args(args)
        .env_remove("ABT_LOG")
        .env_remove("ABT_SEED")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap_or_else(|err| panic!("failed to execute abt binary: {err}"));

    child
        .stdin
        .take()
        .unwrap_or_else(|| panic!("stdin should be piped"))
        .write_all(stdin.as_bytes())
        .unwrap_or_else(|err| panic!("failed to write stdin: {err}"));

    child.wait_with_output().unwrap_or_else(|err| panic!("failed to wait for abt: {err}"))
}

fn run_json<I, S>(sandbox: &Sandbox, args: I, stdin: &str) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_abt(sandbox, args, stdin);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "abt command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let value: Value = serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"));
    assert_eq!(value.get("contract_version").and_then(Value::as_str), Some("cli.v1"));
    value
}

fn csv_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", path.display()))
        .lines()
        .map(str::to_string)
        .collect()
}

fn report_path(report: &Value, key: &str) -> PathBuf {
    PathBuf::from(
        report[key].as_str().unwrap_or_else(|| panic!("report has no {key}: {report}")),
    )
}

const HEADER: &str =
    "tester_id,item_id,left_variant,right_variant,preferred_side,preferred_variant,confidence,comment";

#[test]
fn alice_completes_cat_and_dog_survey() {
    let sandbox = Sandbox::new("abt-cli-e2e", &["cat.png", "dog.png"]);

    let pool = run_json(&sandbox, ["--seed", "7", "pool"], "");
    let order = pool["order"].as_array().cloned().unwrap_or_default();
    assert_eq!(order.len(), 2);
    let second_item = order[1].as_str().unwrap_or_default().to_string();

    let report = run_json(
        &sandbox,
        ["--seed", "7", "run", "--json-summary"],
        "alice\nl\n5\n\nn\n2\nblurry\n",
    );
    assert_eq!(report["outcome"]["status"], "recorded");
    assert_eq!(report["outcome"]["responses"], 2);

    let summary = &report["summary"];
    assert_eq!(summary["tester_id"], "alice");
    assert_eq!(summary["total_comparisons"], 2);
    assert_eq!(summary["mean_confidence"], 3.5);
    assert_eq!(summary["preference_counts"]["None"], 1);
    assert_eq!(summary["commented_items"][0]["item_id"], second_item.as_str());
    assert_eq!(summary["commented_items"][0]["comment"], "blurry");

    let global = csv_lines(&sandbox.path("ab_test_results.csv"));
    assert_eq!(global.len(), 3);
    assert_eq!(global[0], HEADER);
    assert!(global[2].ends_with(",No preference,None,2,blurry"));
    let tester_file = report_path(&report, "tester_results_csv");
    assert_eq!(tester_file, sandbox.path("testers").join("results_alice_2bd806c9.csv"));
    assert_eq!(csv_lines(&tester_file), global);
}

#[test]
fn second_tester_appends_after_first() {
    let sandbox = Sandbox::new("abt-cli-append", &["cat.png", "dog.png"]);

    let alice =
        run_json(&sandbox, ["run", "--tester", "alice", "--json-summary"], "r\n4\n\nr\n4\n\n");
    let alice_path = report_path(&alice, "tester_results_csv");
    let alice_file = csv_lines(&alice_path);

    run_json(&sandbox, ["run", "--tester", "bob", "--json-summary"], "l\n1\nmeh\nl\n1\n\n");
    let global = csv_lines(&sandbox.path("ab_test_results.csv"));
    assert_eq!(global.len(), 5);
    assert!(global[1].starts_with("alice,"));
    assert!(global[2].starts_with("alice,"));
    assert!(global[3].starts_with("bob,"));
    assert!(global[4].starts_with("bob,"));
    assert_eq!(csv_lines(&alice_path), alice_file);

    let summary = run_json(&sandbox, ["summary", "--tester", "bob"], "");
    assert_eq!(summary["total_comparisons"], 2);
    assert_eq!(summary["mean_confidence"], 1.0);
}

#[test]
fn blank_identity_is_asked_again() {
    let sandbox = Sandbox::new("abt-cli-identity", &["cat.png"]);
    let output = run_abt(&sandbox, ["run"], "\n   \ncarol\nl\n3\n\n");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.matches("Tester ID: ").count(), 3);
    assert!(stdout.contains("non-empty"));
    assert!(stdout.contains("Thanks, carol!"));
    assert!(stdout.contains("001-left.png"), "stdout:\n{stdout}");
    assert!(!stdout.contains("images_a"), "variant directory shown:\n{stdout}");
    assert!(!stdout.contains("images_b"), "variant directory shown:\n{stdout}");
}

#[test]
fn existing_results_file_rows_are_kept_on_first_run() {
    let sandbox = Sandbox::new("abt-cli-legacy-live", &["cat.png"]);
    fs::write(
        sandbox.path("ab_test_results.csv"),
        "tester,image,left_model,right_model,preferred_side,preferred_model,confidence,comment\n\
         bob,cat.png,B,A,Left,B,2,from the old tool\n",
    )
    .unwrap_or_else(|err| panic!("failed to write results csv: {err}"));

    run_json(&sandbox, ["run", "--tester", "alice", "--json-summary"], "r\n4\n\n");
    let global = csv_lines(&sandbox.path("ab_test_results.csv"));
    assert_eq!(global.len(), 3);
    assert_eq!(global[0], HEADER);
    assert_eq!(global[1], "bob,cat.png,B,A,Left,B,2,from the old tool");
    assert!(global[2].starts_with("alice,cat.png,"));

    let import = run_json(&sandbox, ["import", "--in", "./ab_test_results.csv"], "");
    assert_eq!(import["summary"]["outcome"]["status"], "already_recorded");
    let integrity = run_json(&sandbox, ["db", "integrity-check"], "");
    assert_eq!(integrity["response_rows"], 2);
}

#[test]
fn abandoned_survey_writes_nothing() {
    let sandbox = Sandbox::new("abt-cli-abandon", &["cat.png", "dog.png"]);
    let output = run_abt(&sandbox, ["run", "--tester", "dave"], "l\n4\n\n");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("nothing was saved"), "stderr:\n{stderr}");
    assert!(!sandbox.path("ab_test_results.csv").exists());

    let integrity = run_json(&sandbox, ["db", "integrity-check"], "");
    assert_eq!(integrity["response_rows"], 0);
}

#[test]
fn empty_pool_fails_before_any_prompt() {
    let sandbox = Sandbox::new("abt-cli-empty", &[]);
    fs::write(sandbox.path("images_a").join("owl.png"), b"a")
        .unwrap_or_else(|err| panic!("failed to write owl.png: {err}"));

    let output = run_abt(&sandbox, ["run"], "alice\n");
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no comparable items"), "stderr:\n{stderr}");
    assert!(stderr.contains("owl.png"), "skip warning missing:\n{stderr}");
}

#[test]
fn legacy_import_is_idempotent() {
    let sandbox = Sandbox::new("abt-cli-import", &["cat.png"]);
    let legacy = sandbox.path("old_results.csv");
    fs::write(
        &legacy,
        "tester,image,left_model,right_model,preferred_side,preferred_model,confidence,comment\n\
         erin,cat.png,B,A,Left,B,4,\"crisp, clean\"\n\
         erin,dog.png,A,B,No preference,None,2,\n",
    )
    .unwrap_or_else(|err| panic!("failed to write legacy csv: {err}"));

    let first = run_json(&sandbox, ["import", "--in", path_string(&legacy).as_str()], "");
    assert_eq!(first["summary"]["rows_in_file"], 2);
    assert_eq!(first["summary"]["outcome"]["status"], "recorded");

    let second = run_json(&sandbox, ["import", "--in", path_string(&legacy).as_str()], "");
    assert_eq!(second["summary"]["outcome"]["status"], "already_recorded");

    let summary = run_json(&sandbox, ["summary", "--tester", "erin"], "");
    assert_eq!(summary["total_comparisons"], 2);
    assert_eq!(summary["preference_counts"]["B"], 1);
    assert_eq!(summary["mean_confidence"], 3.0);

    let global = csv_lines(&sandbox.path("ab_test_results.csv"));
    assert_eq!(global.len(), 3);
    assert_eq!(global[1], "erin,cat.png,B,A,Left,B,4,\"crisp, clean\"");
}

#[test]
fn export_and_db_commands_emit_contract_json() {
    let sandbox = Sandbox::new("abt-cli-db", &["cat.png"]);

    let before = run_json(&sandbox, ["db", "schema-version"], "");
    assert_eq!(before["current_version"], 0);
    let dry_run = run_json(&sandbox, ["db", "migrate", "--dry-run"], "");
    assert_eq!(dry_run["would_apply_versions"], serde_json::json!([1, 2]));
    let migrate = run_json(&sandbox, ["db", "migrate"], "");
    assert_eq!(migrate["after_version"], 2);

    run_json(&sandbox, ["run", "--tester", "frank", "--json-summary"], "n\n\n\n");

    let out = sandbox.path("exports").join("frank.csv");
    let export = run_json(
        &sandbox,
        ["export", "--out", path_string(&out).as_str(), "--tester", "frank"],
        "",
    );
    assert_eq!(export["rows"], 1);
    let exported = csv_lines(&out);
    assert_eq!(exported.len(), 2);
    assert!(exported[1].starts_with("frank,cat.png,"));
    assert!(exported[1].ends_with(",No preference,None,3,"));

    let backup = sandbox.path("backup.sqlite3");
    let backed_up = run_json(&sandbox, ["db", "backup", "--out", path_string(&backup).as_str()], "");
    assert_eq!(backed_up["status"], "ok");
    assert!(backup.exists());

    let integrity = run_json(&sandbox, ["db", "integrity-check"], "");
    assert_eq!(integrity["quick_check_ok"], true);
    assert_eq!(integrity["response_rows"], 1);
}

#[test]
fn unknown_config_key_is_rejected() {
    let sandbox = Sandbox::new("abt-cli-config", &["cat.png"]);
    fs::write(sandbox.path("abt.toml"), "variant_c_dir = \"nope\"\n")
        .unwrap_or_else(|err| panic!("failed to write config: {err}"));

    let output = run_abt(&sandbox, ["pool"], "");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("abt.toml"), "stderr:\n{stderr}");
}
