//! Black-box tests driving the built binary: the seed programs under both
//! execution paths and under a one-megabyte heap, error surfaces, and the
//! textual bytecode input path.

use std::io::Write;
use std::process::{Command, Stdio};

fn bin() -> &'static str {
    env!("CARGO_BIN_EXE_mitscript")
}

fn write_file(dir: &tempfile::TempDir, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

struct Outcome {
    status: i32,
    stdout: String,
    stderr: String,
}

fn run_args(args: &[&str]) -> Outcome {
    let out = Command::new(bin()).args(args).output().unwrap();
    Outcome {
        status: out.status.code().unwrap_or(-1),
        stdout: String::from_utf8(out.stdout).unwrap(),
        stderr: String::from_utf8(out.stderr).unwrap(),
    }
}

/// Run one source program under every mode/heap combination and demand
/// identical stdout and a zero exit.
fn check_source(src: &str, expected_stdout: &str) {
    let dir = tempfile::tempdir().unwrap();
    let file = write_file(&dir, "prog.ms", src);
    let file = file.to_str().unwrap();
    for extra in [&[][..], &["--compile"][..], &["--mem", "1"][..], &["--compile", "--mem", "1"][..]] {
        let mut args = vec!["-s", file];
        args.extend_from_slice(extra);
        let out = run_args(&args);
        assert_eq!(out.status, 0, "args {args:?}: stderr {}", out.stderr);
        assert_eq!(out.stdout, expected_stdout, "args {args:?}");
    }
}

fn check_failure(src: &str, kind: &str) {
    let dir = tempfile::tempdir().unwrap();
    let file = write_file(&dir, "prog.ms", src);
    let file = file.to_str().unwrap();
    for extra in [&[][..], &["--compile"][..]] {
        let mut args = vec!["-s", file];
        args.extend_from_slice(extra);
        let out = run_args(&args);
        assert_eq!(out.status, 1, "args {args:?}");
        assert!(
            out.stderr.starts_with(kind),
            "args {args:?}: stderr {:?} should start with {kind}",
            out.stderr
        );
    }
}

#[test]
fn test_scenario_addition() {
    check_source("print(1 + 2);", "3\n");
}

#[test]
fn test_scenario_string_concat() {
    check_source("x = \"a\"; x = x + 1; print(x);", "a1\n");
}

#[test]
fn test_scenario_counter() {
    check_source(
        "x = 0; f = fun() { x = x + 1; return x; }; print(f()); print(f());",
        "1\n2\n",
    );
}

#[test]
fn test_scenario_records() {
    check_source(
        "r = {}; r.a = 1; r[\"b\"] = 2; print(r.a + r.b); print(r.missing);",
        "3\nNone\n",
    );
}

#[test]
fn test_scenario_division_by_zero() {
    check_failure("x = 5; y = 0; print(x / y);", "ArithmeticError");
}

#[test]
fn test_scenario_bool_plus_int() {
    check_failure("x = true; print(x + 1);", "TypeError");
}

#[test]
fn test_unknown_variable_fails_at_compile_time() {
    check_failure("print(nope);", "UninitializedVariable");
}

#[test]
fn test_parse_error() {
    check_failure("x = ;", "ParseError");
}

#[test]
fn test_closures_and_loops() {
    check_source(
        "adder = fun(x) { return fun(y) { return x + y; }; }; \
         total = 0; i = 0; add2 = adder(2); \
         while (i < 10) { total = add2(total); i = i + 1; } \
         print(total);",
        "20\n",
    );
}

#[test]
fn test_bytecode_input() {
    let bytecode = r#"
function {
  functions = [],
  constants = [1, 2],
  parameter_count = 0,
  local_vars = [],
  local_ref_vars = [],
  free_vars = [],
  names = [],
  instructions = [load_const 0, load_const 1, add, pop]
}
"#;
    let dir = tempfile::tempdir().unwrap();
    let file = write_file(&dir, "prog.msbc", bytecode);
    let out = run_args(&["-b", file.to_str().unwrap()]);
    assert_eq!(out.status, 0, "stderr: {}", out.stderr);
    assert_eq!(out.stdout, "");
}

#[test]
fn test_input_builtin_reads_stdin() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_file(&dir, "prog.ms", "print(\"got \" + input());");
    let mut child = Command::new(bin())
        .args(["-s", file.to_str().unwrap()])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .as_mut()
        .unwrap()
        .write_all(b"hello\n")
        .unwrap();
    let out = child.wait_with_output().unwrap();
    assert!(out.status.success());
    assert_eq!(String::from_utf8(out.stdout).unwrap(), "got hello\n");
}

#[test]
fn test_requires_exactly_one_input_kind() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_file(&dir, "prog.ms", "print(1);");
    let out = run_args(&[file.to_str().unwrap()]);
    assert_eq!(out.status, 1);
}

#[test]
fn test_missing_file() {
    let out = run_args(&["-s", "/nonexistent/path.ms"]);
    assert_eq!(out.status, 1);
}
