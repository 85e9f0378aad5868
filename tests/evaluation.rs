//! End-to-end evaluation runs against the local backend
//!
//! Submissions are shell scripts named `main`, so no compiler is needed.

use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use kelvin_eval::pipeline::registry::StepRegistry;
use kelvin_eval::pipeline::PipeKind;
use kelvin_eval::results::{load_manifest, MANIFEST_FILE};
use kelvin_eval::{
    evaluate, evaluate_with, EngineConfig, EvaluationRequest, EvaluationResult, JobStatus,
    Metadata, SandboxKind,
};
use std::fs;
use std::io::Cursor;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Task, submission and result directories of one run
struct Fixture {
    tmp: TempDir,
}

impl Fixture {
    fn new(config: &str) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("task")).unwrap();
        fs::create_dir_all(tmp.path().join("submission")).unwrap();
        fs::write(tmp.path().join("task/config.yml"), config).unwrap();
        Self { tmp }
    }

    fn task(&self) -> PathBuf {
        self.tmp.path().join("task")
    }

    fn result_dir(&self) -> PathBuf {
        self.tmp.path().join("result")
    }

    fn write_executable(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn submit_script(&self, body: &str) {
        Self::write_executable(&self.tmp.path().join("submission"), "main", body);
    }

    fn submit_file(&self, name: &str, body: impl AsRef<[u8]>) {
        fs::write(self.tmp.path().join("submission").join(name), body).unwrap();
    }

    /// Host file outside every directory the evaluator manages
    fn host_file(&self, name: &str, body: &str) -> PathBuf {
        let path = self.tmp.path().join(name);
        fs::write(&path, body).unwrap();
        path
    }

    fn task_file(&self, name: &str, body: &str) {
        Self::write_executable(&self.task(), name, body);
    }

    fn request(&self, metadata: Metadata) -> EvaluationRequest {
        EvaluationRequest {
            task_dir: self.task(),
            submission_dir: self.tmp.path().join("submission"),
            result_dir: self.result_dir(),
            metadata,
        }
    }

    fn engine(&self) -> EngineConfig {
        EngineConfig {
            sandbox: SandboxKind::Local,
            scratch_root: self.tmp.path().join("scratch"),
            docker_bin: PathBuf::from("/nonexistent/docker"),
            ..Default::default()
        }
    }

    fn run(&self) -> EvaluationResult {
        self.run_with(Metadata::new(), &JobStatus::new())
    }

    fn run_with(&self, metadata: Metadata, status: &JobStatus) -> EvaluationResult {
        evaluate(&self.request(metadata), &self.engine(), status).unwrap()
    }
}

const LIMITS: &str = "limits:\n  processes: 0\n";

#[test]
fn test_hello_world_passes() {
    let fx = Fixture::new(&format!(
        "{}pipeline:\n  - type: tests\ntests:\n  - name: hello\n    stdout: \"Hello world\\n\"\n",
        LIMITS
    ));
    fx.submit_script("#!/bin/sh\necho 'Hello world'\n");

    let result = fx.run();
    assert_eq!(result.pipes.len(), 1);
    let pipe = &result.pipes[0];
    assert_eq!(pipe.type_name, "tests");
    assert!(!pipe.failed);
    assert_eq!(pipe.tests.len(), 1);

    let test = &pipe.tests[0];
    assert!(test.success, "errors: {:?}", test.errors);
    assert!(test.errors.is_empty());
    let stdout = test.file("stdout").unwrap();
    assert!(stdout.success);
    assert_eq!(stdout.actual.as_deref(), Some("hello.stdout"));
    assert!(stdout.diff.is_none());

    let step_dir = fx.result_dir().join("1");
    assert_eq!(fs::read_to_string(step_dir.join("hello.stdout")).unwrap(), "Hello world\n");
    assert!(step_dir.join("hello.stdout.expected").is_file());
    assert!(result.finished_at.is_some());
}

#[test]
fn test_manifest_matches_returned_result() {
    let fx = Fixture::new(&format!(
        "{}pipeline:\n  - type: tests\ntests:\n  - name: hello\n    stdout: \"hi\\n\"\n",
        LIMITS
    ));
    fx.submit_script("#!/bin/sh\necho hi\n");

    let mut meta = Metadata::new();
    meta.insert("login".to_string(), "abc123".to_string());
    let result = fx.run_with(meta, &JobStatus::new());

    assert!(fx.result_dir().join(MANIFEST_FILE).is_file());
    let loaded = load_manifest(&fx.result_dir()).unwrap();
    assert_eq!(loaded.run_id, result.run_id);
    assert_eq!(loaded.pipes.len(), 1);
    assert_eq!(loaded.metadata.get("login").map(String::as_str), Some("abc123"));
}

#[test]
fn test_segfault_is_reported() {
    let fx = Fixture::new(&format!(
        "{}pipeline:\n  - type: tests\ntests:\n  - name: crash\n    stdout: \"ok\\n\"\n",
        LIMITS
    ));
    fx.submit_script("#!/bin/sh\nkill -SEGV $$\n");

    let result = fx.run();
    let test = &result.pipes[0].tests[0];
    assert!(!test.success);
    assert!(
        test.errors.iter().any(|e| e == "Segmentation fault"),
        "errors: {:?}",
        test.errors
    );
    // tests steps do not abort the pipeline unless asked to
    assert!(!result.pipes[0].failed);
}

#[test]
fn test_segfault_fails_step_with_fail_on_error() {
    let fx = Fixture::new(&format!(
        "{}pipeline:\n  - type: tests\n    fail_on_error: true\n  - type: commands\n    commands: [\"true\"]\ntests:\n  - name: crash\n    stdout: \"ok\\n\"\n",
        LIMITS
    ));
    fx.submit_script("#!/bin/sh\nkill -SEGV $$\n");

    let result = fx.run();
    assert_eq!(result.pipes.len(), 1);
    assert!(result.pipes[0].failed);
    assert!(result.failed());
}

#[test]
fn test_exit_code_mismatch_message() {
    let fx = Fixture::new(&format!(
        "{}pipeline:\n  - type: tests\ntests:\n  - name: status\n    exit_code: 0\n",
        LIMITS
    ));
    fx.submit_script("#!/bin/sh\nexit 3\n");

    let result = fx.run();
    let test = &result.pipes[0].tests[0];
    assert!(!test.success);
    assert_eq!(test.exit_code, Some(3));
    assert!(test.errors.contains(&"Expected exit code 0, got 3".to_string()));
}

#[test]
fn test_missing_output_file_is_named() {
    let fx = Fixture::new(&format!(
        "{}pipeline:\n  - type: tests\ntests:\n  - name: writer\n    files_out:\n      result.txt: \"42\\n\"\n",
        LIMITS
    ));
    fx.submit_script("#!/bin/sh\nexit 0\n");

    let result = fx.run();
    let test = &result.pipes[0].tests[0];
    assert!(!test.success);
    assert!(test
        .errors
        .contains(&"Missing output file 'result.txt'".to_string()));
    let file = test.file("result.txt").unwrap();
    assert!(!file.success);
    assert!(file.actual.is_none());
}

#[test]
fn test_output_mismatch_writes_diff() {
    let fx = Fixture::new(&format!(
        "{}pipeline:\n  - type: tests\ntests:\n  - name: greet\n    stdout: \"Hello\\n\"\n",
        LIMITS
    ));
    fx.submit_script("#!/bin/sh\necho Bye\n");

    let result = fx.run();
    let file = result.pipes[0].tests[0].file("stdout").unwrap().clone();
    assert!(!file.success);
    assert_eq!(file.diff.as_deref(), Some("greet.diff.stdout"));
    assert_eq!(file.html.as_deref(), Some("greet.html.stdout"));
    let diff = fs::read_to_string(fx.result_dir().join("1/greet.diff.stdout")).unwrap();
    assert!(diff.contains("-Hello"));
    assert!(diff.contains("+Bye"));
}

#[test]
fn test_filters_apply_before_comparison() {
    let fx = Fixture::new(&format!(
        "{}filters: [lower, collapse_whitespace, strip]\npipeline:\n  - type: tests\ntests:\n  - name: loose\n    stdout: \"hello world\"\n",
        LIMITS
    ));
    fx.submit_script("#!/bin/sh\necho '  HELLO    World  '\n");

    let result = fx.run();
    let test = &result.pipes[0].tests[0];
    assert!(test.success, "errors: {:?}", test.errors);
}

#[test]
fn test_fixture_files_become_tests() {
    let fx = Fixture::new(&format!("{}pipeline:\n  - type: tests\n", LIMITS));
    fs::create_dir_all(fx.task().join("tests")).unwrap();
    fs::write(fx.task().join("tests/double.in"), "21\n").unwrap();
    fs::write(fx.task().join("tests/double.out"), "42\n").unwrap();
    fx.submit_script("#!/bin/sh\nread n\necho $((n * 2))\n");

    let result = fx.run();
    let pipe = &result.pipes[0];
    assert_eq!(pipe.tests.len(), 1);
    assert_eq!(pipe.tests[0].name, "double");
    assert!(pipe.tests[0].success, "errors: {:?}", pipe.tests[0].errors);
}

#[test]
fn test_failed_build_stops_pipeline() {
    let fx = Fixture::new(&format!(
        "{}pipeline:\n  - type: gcc\n    compiler: \"false\"\n  - type: tests\ntests:\n  - name: t\n    stdout: \"x\\n\"\n",
        LIMITS
    ));
    fx.submit_file("main.c", "int main(void) { return 0; }\n");

    let result = fx.run();
    assert_eq!(result.pipes.len(), 1);
    let pipe = &result.pipes[0];
    assert_eq!(pipe.type_name, "gcc");
    assert!(pipe.failed);
    assert!(pipe.tests.is_empty());
    assert!(fx.result_dir().join("1/build.log").is_file());
    assert!(result.failed());
}

#[test]
fn test_failing_step_aborts_remaining_steps() {
    let fx = Fixture::new(&format!(
        "{}pipeline:\n  - type: commands\n    commands: [\"true\"]\n  - type: run\n    commands: [\"exit 4\", \"echo never\"]\n  - type: tests\n",
        LIMITS
    ));
    fx.submit_script("#!/bin/sh\nexit 0\n");

    let result = fx.run();
    assert_eq!(result.pipes.len(), 2);
    assert!(!result.pipes[0].failed);
    assert!(result.pipes[1].failed);
    assert!(result.pipes[1].html.contains("exit code 4"));
    assert!(!result.pipes[1].html.contains("never"));
}

#[test]
fn test_fail_on_error_false_keeps_going() {
    let fx = Fixture::new(&format!(
        "{}pipeline:\n  - type: commands\n    fail_on_error: false\n    commands: [\"false\"]\n  - type: commands\n    commands: [\"true\"]\n",
        LIMITS
    ));

    let result = fx.run();
    assert_eq!(result.pipes.len(), 2);
    assert!(!result.pipes[0].failed);
    assert!(!result.failed());
}

#[test]
fn test_unknown_type_delegates_to_image() {
    let fx = Fixture::new(&format!(
        "{}pipeline:\n  - type: mytool\n    level: 2\n  - type: commands\n    commands: [\"true\"]\n",
        LIMITS
    ));

    let result = fx.run();
    // docker is unavailable here: the step reports the error but does not fail by default
    assert_eq!(result.pipes.len(), 2);
    let pipe = &result.pipes[0];
    assert_eq!(pipe.type_name, "mytool");
    assert_eq!(pipe.title, "mytool");
    assert!(pipe.html.contains("kelvin/mytool"));
    assert!(!pipe.failed);
}

#[test]
fn test_disabled_steps_count_towards_progress() {
    let fx = Fixture::new(&format!(
        "{}pipeline:\n  - type: commands\n    enabled: false\n    commands: [\"true\"]\n  - type: commands\n    enabled: announce\n    commands: [\"true\"]\n  - type: commands\n    commands: [\"true\"]\n",
        LIMITS
    ));

    let status = JobStatus::new();
    let result = fx.run_with(Metadata::new(), &status);
    assert_eq!(result.pipes.len(), 1);
    assert_eq!(result.pipes[0].id, 3);
    assert_eq!(status.steps_total(), 3);
    assert_eq!(status.steps_completed(), 3);
    assert_eq!(status.percent(), 100);

    let mut meta = Metadata::new();
    meta.insert("announce".to_string(), "1".to_string());
    let result = fx.run_with(meta, &JobStatus::new());
    let ids: Vec<usize> = result.pipes.iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![2, 3]);
}

#[test]
fn test_rerun_purges_stale_artifacts() {
    let fx = Fixture::new(&format!(
        "{}pipeline:\n  - type: tests\ntests:\n  - name: hello\n    stdout: \"hi\\n\"\n",
        LIMITS
    ));
    fx.submit_script("#!/bin/sh\necho hi\n");
    fs::create_dir_all(fx.result_dir().join("7")).unwrap();
    fs::write(fx.result_dir().join("7/old.stdout"), "stale").unwrap();

    fx.run();
    assert!(!fx.result_dir().join("7").exists());

    let second = fx.run();
    assert_eq!(second.pipes.len(), 1);
    assert!(fx.result_dir().join("1/hello.stdout").is_file());
}

#[test]
fn test_config_problems_become_warnings() {
    let fx = Fixture::new(&format!(
        "{}bogus: 1\nfilters: [lower, sparkle]\npipeline:\n  - type: tests\ntests:\n  - name: a\n    stdout: \"A\\n\"\n",
        LIMITS
    ));
    fx.submit_script("#!/bin/sh\necho a\n");

    let result = fx.run();
    assert!(result
        .warnings
        .iter()
        .any(|w| w.contains("unknown top-level key 'bogus'")));
    assert!(result.warnings.iter().any(|w| w.contains("sparkle")));
    assert!(result.pipes[0].tests[0].success);
}

#[test]
fn test_malformed_pipeline_degrades_to_empty() {
    let fx = Fixture::new("pipeline:\n  - type: tests\n    bogus: true\n");

    let result = fx.run();
    assert!(result.pipes.is_empty());
    assert!(!result.warnings.is_empty());
    assert!(!result.failed());
}

#[test]
fn test_generated_inputs_checked_against_reference() {
    let fx = Fixture::new(&format!(
        "{}pipeline:\n  - type: input_generator\n    generator: gen.sh\n    reference: ref.sh\n    iterations: 3\n",
        LIMITS
    ));
    fx.task_file("gen.sh", "echo \"seed $1\"\n");
    fx.task_file("ref.sh", "tr a-z A-Z\n");
    fx.submit_script("#!/bin/sh\ntr a-z A-Z\n");

    let result = fx.run();
    let pipe = &result.pipes[0];
    assert_eq!(pipe.type_name, "input_generator");
    let names: Vec<&str> = pipe.tests.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["gen1", "gen2", "gen3"]);
    assert!(pipe.tests.iter().all(|t| t.success));
    assert!(!pipe.failed);
    assert_eq!(
        fs::read_to_string(fx.result_dir().join("1/gen2.stdout")).unwrap(),
        "SEED 2\n"
    );
}

#[test]
fn test_check_hook_adds_errors() {
    let fx = Fixture::new(&format!(
        "{}pipeline:\n  - type: tests\ntests:\n  - name: a\n    stdout: \"a\\n\"\n",
        LIMITS
    ));
    fx.task_file(
        "script",
        "#!/bin/sh\ncase \"$1\" in\n  hooks) echo '[\"check\"]' > \"$3\" ;;\n  check) echo '{\"messages\": [\"style: use more functions\"]}' > \"$3\" ;;\nesac\n",
    );
    fx.submit_script("#!/bin/sh\necho a\n");

    let result = fx.run();
    let test = &result.pipes[0].tests[0];
    assert!(!test.success);
    assert_eq!(test.errors, vec!["style: use more functions".to_string()]);
}

fn verify_step(
    _: &str,
    value: serde_yaml::Value,
    location: &str,
) -> kelvin_eval::Result<PipeKind> {
    let params = serde_yaml::from_value(value)
        .map_err(|e| kelvin_eval::EvalError::parse(location, e.to_string()))?;
    Ok(PipeKind::RunCommands(params))
}

#[test]
fn test_custom_registry_resolves_alias() {
    let fx = Fixture::new(&format!(
        "{}pipeline:\n  - type: verify\n    commands: [\"exit 1\"]\n",
        LIMITS
    ));
    let mut registry = StepRegistry::builtin();
    registry.register("verify", verify_step);

    let result = evaluate_with(
        &fx.request(Metadata::new()),
        &fx.engine(),
        &JobStatus::new(),
        &registry,
    )
    .unwrap();
    assert_eq!(result.pipes.len(), 1);
    assert_eq!(result.pipes[0].type_name, "verify");
    assert_eq!(result.pipes[0].title, "Commands");
    assert!(result.pipes[0].failed);
    assert!(result.pipes[0].html.contains("exit code 1"));
}

#[test]
fn test_symlinked_output_is_not_followed() {
    let fx = Fixture::new(&format!(
        "{}pipeline:\n  - type: tests\ntests:\n  - name: w\n    files_out:\n      out.txt: \"x\\n\"\n",
        LIMITS
    ));
    let secret = fx.host_file("secret", "HOST-SECRET\n");
    fx.submit_script(&format!("#!/bin/sh\nln -s {} out.txt\n", secret.display()));

    let result = fx.run();
    let test = &result.pipes[0].tests[0];
    assert!(!test.success);
    assert!(
        test.errors.contains(&"Output 'out.txt' is a symbolic link".to_string()),
        "errors: {:?}",
        test.errors
    );
    assert!(test.file("out.txt").unwrap().actual.is_none());
    assert!(!fx.result_dir().join("1/w.out.txt").exists());
}

#[test]
fn test_planted_link_does_not_redirect_input_staging() {
    let fx = Fixture::new(&format!(
        "{}pipeline:\n  - type: tests\ntests:\n  - name: plant\n  - name: stage\n    files_in:\n      in.txt: \"data\\n\"\n    stdout: \"data\\n\"\n",
        LIMITS
    ));
    let victim = fx.host_file("victim", "VICTIM\n");
    fx.submit_script(&format!(
        "#!/bin/sh\ncat in.txt 2>/dev/null\nrm -f in.txt\nln -s {} in.txt\n",
        victim.display()
    ));

    let result = fx.run();
    let stage = &result.pipes[0].tests[1];
    assert_eq!(stage.name, "stage");
    assert!(stage.success, "errors: {:?}", stage.errors);
    assert_eq!(fs::read_to_string(&victim).unwrap(), "VICTIM\n");
}

#[test]
fn test_submission_cannot_rewrite_reference() {
    let fx = Fixture::new(&format!(
        "{}pipeline:\n  - type: input_generator\n    generator: gen.sh\n    reference: ref.sh\n    iterations: 3\n",
        LIMITS
    ));
    fx.task_file("gen.sh", "echo \"seed $1\"\n");
    fx.task_file("ref.sh", "tr a-z A-Z\n");
    fx.submit_script(
        "#!/bin/sh\nmkdir -p .kelvin-gen\necho 'echo PWNED' > .kelvin-gen/ref.sh\necho 'echo PWNED' > .kelvin-gen/gen.sh\necho PWNED\n",
    );

    let result = fx.run();
    let pipe = &result.pipes[0];
    assert_eq!(pipe.tests.len(), 3);
    assert!(pipe.tests.iter().all(|t| !t.success));
    let stdout = fs::read_to_string(fx.result_dir().join("1/gen1.stdout.expected")).unwrap();
    assert_eq!(stdout, "SEED 1\n");
}

#[test]
fn test_unrepresentable_limits_become_warnings() {
    for limits in ["wall_time: 1e300", "time: .inf", "memory: \"99999999999999G\"", "processes: 4294967296"] {
        let fx = Fixture::new(&format!(
            "limits:\n  {}\npipeline:\n  - type: tests\ntests:\n  - name: hello\n    stdout: \"hi\\n\"\n",
            limits
        ));
        fx.submit_script("#!/bin/sh\necho hi\n");
        let mut engine = fx.engine();
        engine.default_limits.processes = Some(0);

        let result = evaluate(&fx.request(Metadata::new()), &engine, &JobStatus::new()).unwrap();
        assert!(
            result.warnings.iter().any(|w| w.contains("ignoring limits")),
            "{}: {:?}",
            limits,
            result.warnings
        );
        assert!(result.pipes[0].tests[0].success, "{}", limits);
    }
}

#[test]
fn test_missing_stderr_is_named() {
    let fx = Fixture::new(&format!(
        "{}pipeline:\n  - type: tests\ntests:\n  - name: quiet\n    stderr: \"warning\\n\"\n",
        LIMITS
    ));
    fx.submit_script("#!/bin/sh\nrm -f .kelvin-*.stderr\n");

    let result = fx.run();
    let test = &result.pipes[0].tests[0];
    assert!(!test.success);
    assert!(test
        .errors
        .contains(&"Missing standard error output".to_string()));
    assert!(!test.file("stderr").unwrap().success);
}

#[test]
fn test_binary_comparator_ignores_filters() {
    let fx = Fixture::new(&format!(
        "{}filters: [lower]\npipeline:\n  - type: tests\ntests:\n  - name: loose\n    stdout: \"HELLO\\n\"\n  - name: exact\n    stdout: \"HELLO\\n\"\n    comparators:\n      stdout: binary\n",
        LIMITS
    ));
    fx.submit_script("#!/bin/sh\necho hello\n");

    let result = fx.run();
    let tests = &result.pipes[0].tests;
    assert!(tests[0].success, "errors: {:?}", tests[0].errors);
    assert!(!tests[1].success);
    let diff = fs::read_to_string(fx.result_dir().join("1/exact.diff.stdout")).unwrap();
    assert!(diff.contains("48454c4c4f0a"));
    assert!(diff.contains("68656c6c6f0a"));
}

fn encode(img: &RgbaImage, format: ImageFormat) -> Vec<u8> {
    let mut buf = Vec::new();
    DynamicImage::ImageRgba8(img.clone())
        .write_to(&mut Cursor::new(&mut buf), format)
        .unwrap();
    buf
}

#[test]
fn test_image_comparator_compares_pixels() {
    let fx = Fixture::new(&format!(
        "{}pipeline:\n  - type: tests\ntests:\n  - name: same\n    args: [same.bmp]\n    files_out:\n      out.png: {{path: expected.png}}\n    comparators:\n      out.png: image\n  - name: off\n    args: [off.png]\n    files_out:\n      out.png: {{path: expected.png}}\n    comparators:\n      out.png: image\n",
        LIMITS
    ));
    let picture = RgbaImage::from_fn(4, 3, |x, y| Rgba([x as u8 * 40, y as u8 * 60, 7, 255]));
    let mut off = picture.clone();
    off.put_pixel(1, 2, Rgba([255, 0, 0, 255]));
    fs::write(fx.task().join("expected.png"), encode(&picture, ImageFormat::Png)).unwrap();
    fx.submit_file("same.bmp", encode(&picture, ImageFormat::Bmp));
    fx.submit_file("off.png", encode(&off, ImageFormat::Png));
    fx.submit_script("#!/bin/sh\ncp \"$1\" out.png\n");

    let result = fx.run();
    let tests = &result.pipes[0].tests;
    assert!(tests[0].success, "errors: {:?}", tests[0].errors);
    assert!(!tests[1].success);
    let diff = fs::read_to_string(fx.result_dir().join("1/off.diff.out.png")).unwrap();
    assert_eq!(diff, "1 of 12 pixels differ");
}

const ALLOCATING_PROGRAM: &str = r#"#include <stdio.h>
#include <stdlib.h>
#include <string.h>

static char *grab(size_t n)
{
    char *p = malloc(n);
    ON_NULL
    memset(p, 'x', n);
    return p;
}

int main(void)
{
    char *a = grab(16);
    char *b = grab(32);
    printf("%c%c
", a[0], b[0]);
    free(a);
    free(b);
    return 0;
}
"#;

fn fault_injection_fixture(on_null: &str) -> Fixture {
    let fx = Fixture::new(&format!(
        "{}pipeline:\n  - type: malloc_fail\n    max_fails: 3\ntests:\n  - name: t\n",
        LIMITS
    ));
    fx.submit_file("main.c", ALLOCATING_PROGRAM.replace("ON_NULL", on_null));
    fx
}

#[test]
fn test_fault_injection_runs_each_allocation_index() {
    let fx = fault_injection_fixture("if (!p) { fputs(\"out of memory\\n\", stderr); exit(1); }");

    let result = fx.run();
    let pipe = &result.pipes[0];
    assert_eq!(pipe.type_name, "malloc_fail");
    let names: Vec<&str> = pipe.tests.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["t#1", "t#2", "t#3"]);
    assert!(pipe.tests.iter().all(|t| t.success), "{:?}", pipe.tests);
    assert_eq!(pipe.tests[0].exit_code, Some(1));
    assert_eq!(pipe.tests[2].exit_code, Some(0));
}

#[test]
fn test_fault_injection_reports_unchecked_allocation() {
    let fx = fault_injection_fixture("");

    let result = fx.run();
    let tests = &result.pipes[0].tests;
    assert_eq!(tests.len(), 3);
    for crashed in &tests[..2] {
        assert!(!crashed.success);
        assert!(
            crashed.errors.contains(&"Segmentation fault".to_string()),
            "errors: {:?}",
            crashed.errors
        );
    }
    assert!(tests[2].success);
    assert!(fx.result_dir().join("1/t.malloc1.stderr").is_file());
}

#[test]
fn test_fault_injection_accepts_instrumentation_abort() {
    let fx = fault_injection_fixture(
        "if (!p) { fputs(\"==1==ERROR: AddressSanitizer: allocator is out of memory\\n\", stderr); abort(); }",
    );

    let result = fx.run();
    let tests = &result.pipes[0].tests;
    assert!(tests.iter().all(|t| t.success), "{:?}", tests);
    assert_eq!(tests[0].usage.as_ref().unwrap().signal, Some(6));
}
