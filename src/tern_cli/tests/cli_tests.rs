//! Command-line interface tests against the built binary.

use std::path::PathBuf;
use std::process::Command;

fn write_temp(name: &str, src: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("tern_cli_tests");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, src).unwrap();
    path
}

fn tern() -> Command {
    Command::new(env!("CARGO_BIN_EXE_tern"))
}

#[test]
fn bare_file_invocation_runs_the_program() {
    let path = write_temp("bare.tn", "def Main()\n  WriteLn(\"bare\")\nend\n");
    let out = tern().arg(&path).output().expect("binary runs");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(String::from_utf8_lossy(&out.stdout), "bare\n");
}

#[test]
fn bare_file_invocation_passes_program_arguments() {
    let src = "\
def Main(args)
  for a in args
    WriteLn(a)
  end
end
";
    let path = write_temp("bare_args.tn", src);
    let out = tern()
        .arg(&path)
        .arg("one")
        .arg("two")
        .output()
        .expect("binary runs");
    assert!(out.status.success());
    assert_eq!(String::from_utf8_lossy(&out.stdout), "one\ntwo\n");
}

#[test]
fn run_subcommand_is_equivalent() {
    let path = write_temp("sub.tn", "def Main()\n  WriteLn(\"sub\")\nend\n");
    let out = tern().arg("run").arg(&path).output().expect("binary runs");
    assert!(out.status.success());
    assert_eq!(String::from_utf8_lossy(&out.stdout), "sub\n");
}

#[test]
fn uncaught_exception_exits_with_status_three() {
    let path = write_temp(
        "boom.tn",
        "def Main()\n  raise ValueError(\"boom\")\nend\n",
    );
    let out = tern().arg(&path).output().expect("binary runs");
    assert_eq!(out.status.code(), Some(3));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("ValueError"));
}

#[test]
fn compile_errors_are_reported_without_running() {
    let path = write_temp(
        "bad.tn",
        "def Main()\n  var a = missing\nend\n",
    );
    let out = tern().arg("compile").arg(&path).output().expect("binary runs");
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("undefined"));
}
