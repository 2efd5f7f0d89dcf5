use std::{
    ffi::OsStr,
    fs,
    path::Path,
    process::{Command, Stdio},
};

use tempfile::tempdir;

#[derive(Debug, Clone, PartialEq, Eq)]
struct RunLog {
    stdout: String,
    stderr: String,
    status: i32,
}

fn run_sable<I, S>(args: I) -> RunLog
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let out = Command::new(assert_cmd::cargo::cargo_bin!("sable"))
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .expect("failed to execute binary");
    RunLog {
        stdout: String::from_utf8_lossy(&out.stdout).trim_end().to_string(),
        stderr: String::from_utf8_lossy(&out.stderr).trim_end().to_string(),
        status: out.status.code().unwrap_or(-1),
    }
}

fn write_source(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).expect("failed to write source");
    path
}

#[test]
fn help_exits_zero() {
    let log = run_sable(["--help"]);
    assert_eq!(log.status, 0);
    assert!(log.stdout.starts_with("Usage: sable"));
}

#[test]
fn missing_input_prints_usage() {
    let log = run_sable(Vec::<&str>::new());
    assert_eq!(log.status, 2);
    assert!(log.stderr.contains("Usage: sable"));
}

#[test]
fn compiles_next_to_input_by_default() {
    let dir = tempdir().unwrap();
    let src = write_source(dir.path(), "five.sb", "public int main() { return 5; }\n");

    let log = run_sable([&src]);
    assert_eq!(log.status, 0, "stderr: {}", log.stderr);

    let asm = fs::read_to_string(dir.path().join("five.sb.asm")).unwrap();
    assert!(asm.starts_with("bits 64\n"));
    assert!(asm.contains("global $main\n"));
    assert!(asm.contains("    mov rax, 5\n"));
}

#[test]
fn output_flag_picks_the_path() {
    let dir = tempdir().unwrap();
    let src = write_source(dir.path(), "five.sb", "public int main() { return 5; }\n");
    let out = dir.path().join("custom.s");

    let log = run_sable([src.as_os_str(), OsStr::new("-o"), out.as_os_str()]);
    assert_eq!(log.status, 0, "stderr: {}", log.stderr);
    assert!(out.exists());
    assert!(!dir.path().join("five.sb.asm").exists());
}

#[test]
fn dangling_output_flag_falls_back() {
    let dir = tempdir().unwrap();
    let src = write_source(dir.path(), "five.sb", "public int main() { return 5; }\n");

    let log = run_sable([src.as_os_str(), OsStr::new("-o")]);
    assert_eq!(log.status, 0);
    assert!(log.stderr.starts_with("info: "));
    assert!(dir.path().join("five.sb.asm").exists());
}

#[test]
fn tokenize_dumps_tokens_without_compiling() {
    let dir = tempdir().unwrap();
    let src = write_source(dir.path(), "t.sb", "int x = 1;");

    let log = run_sable([src.as_os_str(), OsStr::new("-tokenize")]);
    assert_eq!(log.status, 0);
    assert_eq!(
        log.stdout,
        "1 keyword int\n1 identifier x\n1 punctuator =\n1 constant 1\n1 punctuator ;\n1 end"
    );
    assert!(!dir.path().join("t.sb.asm").exists());
}

#[test]
fn compile_error_is_rendered_with_its_line() {
    let dir = tempdir().unwrap();
    let src = write_source(
        dir.path(),
        "bad.sb",
        "public int main() {\n    return y;\n}\n",
    );

    let log = run_sable([&src]);
    assert_eq!(log.status, 1);
    assert_eq!(
        log.stderr,
        "2: undefined symbol 'y'\n2 |     return y;\n  |     ^^^^^^^^^"
    );
    assert!(!dir.path().join("bad.sb.asm").exists());
}

#[test]
fn repeated_import_is_reported_as_info() {
    let dir = tempdir().unwrap();
    write_source(dir.path(), "lib.sb", "int one() { return 1; }\n");
    let src = write_source(
        dir.path(),
        "main.sb",
        "use lib;\nuse lib;\npublic int main() { return one(); }\n",
    );

    let log = run_sable([&src]);
    assert_eq!(log.status, 0);
    assert_eq!(log.stderr, "info: 2: 'lib.sb' is already compiled, skipping");
    let asm = fs::read_to_string(dir.path().join("main.sb.asm")).unwrap();
    assert!(asm.contains("\n$one:\n"));
}
