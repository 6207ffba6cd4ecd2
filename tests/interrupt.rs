#![cfg(all(unix, feature = "cli"))]

use std::io::{BufRead, BufReader};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

const EDL: &str = env!("CARGO_BIN_EXE_edl");

/// A terminal Ctrl-C signals the whole foreground process group. The worker
/// must survive it and run its ON_STOP section on the forwarded stop.
#[test]
fn ctrl_c_on_the_terminal_group_stops_the_run_cleanly() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let script = dir.path().join("stop.edl");
    std::fs::write(
        &script,
        "print(\"running\");\nforever {\n  wait(0.05);\n}\nON_STOP:\nprint(\"cleanup\");\n",
    )
    .expect("write script");

    let mut child = Command::new(EDL)
        .arg("run")
        .arg("--skip-test")
        .arg(&script)
        .env("RUST_LOG", "warn")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()
        .expect("spawn edl");
    let group = child.id();
    let mut lines = BufReader::new(child.stdout.take().expect("stdout")).lines();

    let mut seen = Vec::new();
    for line in lines.by_ref() {
        let line = line.expect("read");
        let running = line == "running";
        seen.push(line);
        if running {
            break;
        }
    }
    assert_eq!(seen.last().map(String::as_str), Some("running"), "{seen:?}");

    let kill = Command::new("kill")
        .args(["-INT", "--", &format!("-{group}")])
        .status()
        .expect("kill");
    assert!(kill.success());

    for line in lines {
        seen.push(line.expect("read"));
    }
    let status = child.wait().expect("wait");

    assert!(seen.iter().any(|line| line == "cleanup"), "{seen:?}");
    assert!(seen.iter().any(|line| line.ends_with("Stopped")), "{seen:?}");
    assert!(status.success(), "{status:?}");
}
