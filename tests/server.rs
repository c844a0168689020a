//! End-to-end tests driving the compiled `pwnable-server` binary.
//!
//! Tests that bind ports, fork workers, and drop privileges require root
//! and a `nobody` account; they skip themselves when run unprivileged.

use nix::{
    sys::signal::{kill, Signal},
    unistd::{Pid, Uid},
};
use std::{
    io::{Read, Write},
    net::TcpStream,
    process::{Child, Command, Stdio},
    thread,
    time::{Duration, Instant},
};

const BIN: &str = env!("CARGO_BIN_EXE_pwnable-server");

struct Server(Child);

impl Server {
    fn start(args: &[&str]) -> Self {
        let child = Command::new(BIN)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn server");
        Self(child)
    }

    fn pid(&self) -> u32 {
        self.0.id()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn skip_unless_root() -> bool {
    if Uid::effective().is_root() {
        return false;
    }
    eprintln!("skipping: requires root");
    true
}

fn connect(port: u16) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => {
                stream
                    .set_read_timeout(Some(Duration::from_secs(10)))
                    .unwrap();
                return stream;
            }
            Err(err) => {
                assert!(Instant::now() < deadline, "server did not come up: {}", err);
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

fn read_line(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => {
                buf.push(byte[0]);
                if byte[0] == b'\n' {
                    break;
                }
            }
            Err(err) => panic!("read: {}", err),
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Count zombie children of the given process.
#[cfg(target_os = "linux")]
fn zombie_children(ppid: u32) -> usize {
    let mut count = 0;
    for entry in std::fs::read_dir("/proc").unwrap() {
        let name = entry.unwrap().file_name();
        let Some(pid) = name.to_str().and_then(|name| name.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
            continue;
        };
        // pid (comm) state ppid ...; comm may contain spaces.
        let Some(idx) = stat.rfind(')') else { continue };
        let mut fields = stat[idx + 1..].split_whitespace();
        let state = fields.next().unwrap_or("");
        let parent = fields.next().and_then(|field| field.parse::<u32>().ok());
        if parent == Some(ppid) && state == "Z" {
            count += 1;
        }
    }
    count
}

#[test]
fn unknown_flag_prints_usage() {
    let output = Command::new(BIN).arg("--bogus").output().unwrap();
    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--bogus"), "error line expected: {}", stdout);
    assert!(stdout.contains("--listen"), "usage block expected: {}", stdout);
}

#[test]
fn help_exits_nonzero() {
    let output = Command::new(BIN).arg("--help").output().unwrap();
    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--alarm"));
    // The usage block carries the current defaults.
    assert!(stdout.contains("65001"));
}

#[test]
fn refuses_to_start_without_handler_or_exec() {
    let output = Command::new(BIN).arg("-l").output().unwrap();
    assert!(!output.status.success());
}

#[test]
fn echo_happy_path() {
    if skip_unless_root() {
        return;
    }
    let _server = Server::start(&[
        "-l",
        "-u",
        "nobody",
        "--no-chroot",
        "-p",
        "46010",
        "-a",
        "5",
        "-e",
        "/bin/cat",
    ]);

    let mut stream = connect(46010);
    stream.write_all(b"hello\n").unwrap();
    assert_eq!(read_line(&mut stream), "hello\n");
}

#[test]
fn password_gate_accepts() {
    if skip_unless_root() {
        return;
    }
    let _server = Server::start(&[
        "-l",
        "-u",
        "nobody",
        "--no-chroot",
        "-p",
        "46011",
        "-k",
        "letmein",
        "-e",
        "/bin/cat",
    ]);

    let mut stream = connect(46011);
    let mut prompt = [0u8; 10];
    stream.read_exact(&mut prompt).unwrap();
    assert_eq!(&prompt, b"Password: ");

    stream.write_all(b"letmein\n").unwrap();
    stream.write_all(b"ping\n").unwrap();
    assert_eq!(read_line(&mut stream), "ping\n");
}

#[test]
fn password_gate_rejects_then_accepts() {
    if skip_unless_root() {
        return;
    }
    let _server = Server::start(&[
        "-l",
        "-u",
        "nobody",
        "--no-chroot",
        "-p",
        "46012",
        "-k",
        "letmein",
        "-e",
        "/bin/cat",
    ]);

    let mut stream = connect(46012);
    let mut prompt = [0u8; 10];
    stream.read_exact(&mut prompt).unwrap();
    stream.write_all(b"nope\n").unwrap();

    let mut rest = String::new();
    stream.read_to_string(&mut rest).unwrap();
    assert_eq!(rest, "Incorrect password.\n");

    // One rejected client does not poison the gate for the next one.
    let mut stream = connect(46012);
    stream.read_exact(&mut prompt).unwrap();
    stream.write_all(b"letmein\n").unwrap();
    stream.write_all(b"still works\n").unwrap();
    assert_eq!(read_line(&mut stream), "still works\n");
}

#[test]
fn alarm_kills_stalled_worker() {
    if skip_unless_root() {
        return;
    }
    let _server = Server::start(&[
        "-l",
        "-u",
        "nobody",
        "--no-chroot",
        "-p",
        "46013",
        "-a",
        "1",
        "-e",
        "/bin/cat",
    ]);

    // The worker never receives a line, so only the alarm can end it.
    let mut stream = connect(46013);
    let start = Instant::now();
    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(n, 0, "expected EOF from the killed worker");
    assert!(start.elapsed() < Duration::from_secs(4));

    // The listener keeps accepting afterwards.
    let mut stream = connect(46013);
    stream.write_all(b"still-alive\n").unwrap();
    assert_eq!(read_line(&mut stream), "still-alive\n");
}

#[test]
fn concurrent_workers_are_independent() {
    if skip_unless_root() {
        return;
    }
    let server = Server::start(&[
        "-l",
        "-u",
        "nobody",
        "--no-chroot",
        "-p",
        "46014",
        "-e",
        "/bin/cat",
    ]);

    let mut streams: Vec<TcpStream> = (0..5).map(|_| connect(46014)).collect();
    for (i, stream) in streams.iter_mut().enumerate() {
        stream
            .write_all(format!("worker {}\n", i).as_bytes())
            .unwrap();
    }
    // Each one echoes independently, whatever order we read them in.
    for (i, stream) in streams.iter_mut().enumerate().rev() {
        assert_eq!(read_line(stream), format!("worker {}\n", i));
    }

    // Closing one connection does not affect the others.
    drop(streams.pop());
    let stream = &mut streams[0];
    stream.write_all(b"again\n").unwrap();
    assert_eq!(read_line(stream), "again\n");

    drop(streams);

    // Workers are reaped automatically; none of them linger as zombies.
    #[cfg(target_os = "linux")]
    {
        thread::sleep(Duration::from_millis(300));
        assert_eq!(zombie_children(server.pid()), 0);
    }
    #[cfg(not(target_os = "linux"))]
    let _ = &server;
}

#[test]
fn sigterm_exits_with_signal_status() {
    if skip_unless_root() {
        return;
    }
    let mut server = Server::start(&[
        "-l",
        "-u",
        "nobody",
        "--no-chroot",
        "-p",
        "46015",
        "-e",
        "/bin/cat",
    ]);

    // Make sure the listener is up before signalling it.
    drop(connect(46015));

    kill(Pid::from_raw(server.pid() as i32), Signal::SIGTERM).unwrap();
    let status = server.0.wait().unwrap();
    assert_eq!(status.code(), Some(15));
}
