use std::io::{Read, Write};
use std::process::{Child, Command, Output, Stdio};

const BIN: &str = env!("CARGO_BIN_EXE_shmtest");

fn spawn(args: &[&str]) -> Child {
    Command::new(BIN)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap()
}

/// Runs the binary with `input` on stdin.
fn run(args: &[&str], input: &str) -> Output {
    let mut child = spawn(args);
    // The process may exit before reading all of it.
    let _ = child.stdin.take().unwrap().write_all(input.as_bytes());
    child.wait_with_output().unwrap()
}

/// Id from `Allocated <size> bytes on segment id <id>`.
fn segment_id(stdout: &str) -> i32 {
    let (_, rest) = stdout.split_once("on segment id ").unwrap();
    rest.split_whitespace().next().unwrap().parse().unwrap()
}

#[test]
fn allocate_and_release() {
    let output = run(&[], "4096\n0\n");
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert_eq!(output.status.code(), Some(0), "stdout: {stdout}");
    assert!(stdout.starts_with(shmtest::SIZE_PROMPT));
    assert!(stdout.contains("Allocated 4096 bytes on segment id "));
    assert!(stdout.contains(shmtest::CONTINUE_PROMPT));
    assert!(stdout.ends_with("Done.\n"));

    let id = segment_id(&stdout);
    assert_eq!(shared_memory_segment::status(id).unwrap(), None);
}

#[test]
fn repeatable() {
    for _ in 0..2 {
        let output = run(&["--size", "65536"], "1\n");
        assert_eq!(output.status.code(), Some(0));
        let stdout = String::from_utf8(output.stdout).unwrap();
        assert!(!stdout.contains(shmtest::SIZE_PROMPT));
        assert_eq!(shared_memory_segment::status(segment_id(&stdout)).unwrap(), None);
    }
}

#[test]
fn too_big() {
    let output = run(&[], "-1\n");
    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.ends_with(&format!(
        "Looks like we cannot allocate {} bytes, sorry.\n",
        usize::MAX
    )));
    assert!(!stdout.contains("Allocated"));
}

#[test]
fn too_big_flag() {
    let output = run(&["--size", "-1"], "");
    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert_eq!(
        stdout,
        format!("Looks like we cannot allocate {} bytes, sorry.\n", usize::MAX)
    );
}

#[test]
fn zero() {
    let output = run(&["--size", "0"], "");
    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert_eq!(stdout, "Looks like we cannot allocate 0 bytes, sorry.\n");
}

#[test]
fn not_a_number() {
    let output = run(&[], "many\n0\n");
    assert_eq!(output.status.code(), Some(3));
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("\"many\" is not a number of bytes"));
    assert!(!stdout.contains("Allocated"));
}

#[test]
fn no_input() {
    let output = run(&[], "");
    assert_eq!(output.status.code(), Some(3));
}

#[test]
fn touch_and_mode() {
    let output = run(&["--touch", "--mode", "600", "--size", "1048576"], "0\n");
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("Allocated 1048576 bytes on segment id "));
}

#[test]
fn touch_releases() {
    let output = run(&["--touch", "--size", "65536"], "0\n");
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert_eq!(shared_memory_segment::status(segment_id(&stdout)).unwrap(), None);
}

#[test]
fn invalid_mode() {
    let output = run(&["--mode", "999"], "4096\n0\n");
    assert_eq!(output.status.code(), Some(64));
    assert!(String::from_utf8(output.stdout).unwrap().is_empty());
    assert!(String::from_utf8(output.stderr).unwrap().contains("999"));
}

#[test]
fn custom_prompts() {
    let output = run(&["--prompt", "size? ", "--continue-prompt", "go? "], "4096\n0\n");
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.starts_with("size? Allocated 4096 bytes"));
    assert!(stdout.ends_with("go? Done.\n"));
}

#[test]
fn limits() {
    let output = run(&["--limits"], "");
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.starts_with("shmmax: "));
    assert!(stdout.contains("shmmni: "));
}

#[test]
fn interrupted_while_waiting() {
    let mut child = spawn(&[]);
    let mut stdin = child.stdin.take().unwrap();
    stdin.write_all(b"4096\n").unwrap();
    stdin.flush().unwrap();

    // Wait until the segment is held.
    let mut stdout = child.stdout.take().unwrap();
    let mut seen = Vec::new();
    let mut buf = [0; 256];
    while !String::from_utf8_lossy(&seen).ends_with(shmtest::CONTINUE_PROMPT) {
        let read = stdout.read(&mut buf).unwrap();
        assert_ne!(read, 0, "stdout closed: {}", String::from_utf8_lossy(&seen));
        seen.extend_from_slice(&buf[..read]);
    }
    let id = segment_id(&String::from_utf8(seen).unwrap());
    assert!(shared_memory_segment::status(id).unwrap().is_some());

    // Interrupt (`ctrl+c`)
    // SAFETY:
    // This call should always be safe.
    unsafe {
        let pid = i32::try_from(child.id()).unwrap();
        libc::kill(pid, libc::SIGINT);
    }
    let status = child.wait().unwrap();
    assert_eq!(status.code(), Some(shmtest::interrupt::INTERRUPTED));
    assert_eq!(shared_memory_segment::status(id).unwrap(), None);
    drop(stdin);
}
