//! Command executor: newline-delimited command dispatch with length-framed
//! `$`-command output.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::config::{DaemonConfig, PING_TIMEOUT_MS};
use crate::connstate::ConnState;
use crate::error::SessionError;
use crate::subprocess::ChildGuard;

const READ_RETRY_SLEEP: Duration = Duration::from_millis(50);
const SHELL_READ_CHUNK: usize = 1024;
const MAX_LINE_LEN: usize = 255;

/// A parsed command line, classified by its leading prefix. Pure parsing,
/// no I/O — kept separate from dispatch so it can be unit-tested without a
/// subprocess or socket.
#[derive(Debug, PartialEq, Eq)]
enum Command_ {
    Spawn(Vec<String>),
    Shell(String),
    InjectInput(String),
    VideoFps(u32),
    XwinFps(u32),
    Lcd(String),
    Ping,
    Unrecognized,
}

fn classify(line: &str) -> Command_ {
    if let Some(rest) = line.strip_prefix('@') {
        let args: Vec<String> = rest.split(' ').filter(|s| !s.is_empty()).take(63).map(String::from).collect();
        return Command_::Spawn(args);
    }
    if let Some(rest) = line.strip_prefix('$') {
        return Command_::Shell(rest.to_string());
    }
    if let Some(rest) = line.strip_prefix("inject_input=") {
        return Command_::InjectInput(rest.to_string());
    }
    if let Some(rest) = line.strip_prefix("vfps=") {
        if let Ok(n) = rest.parse::<u32>() {
            return Command_::VideoFps(n);
        }
        return Command_::Unrecognized;
    }
    if let Some(rest) = line.strip_prefix("xfps=") {
        if let Ok(n) = rest.parse::<u32>() {
            return Command_::XwinFps(n);
        }
        return Command_::Unrecognized;
    }
    if let Some(rest) = line.strip_prefix("lcd=") {
        return Command_::Lcd(rest.to_string());
    }
    if line == "ping" {
        return Command_::Ping;
    }
    Command_::Unrecognized
}

/// Write a 4-byte big-endian length-prefixed chunk, or a zero-length
/// terminator when `data` is empty.
fn write_framed(client: &mut TcpStream, data: &[u8]) -> std::io::Result<()> {
    let len = u32::try_from(data.len()).unwrap_or(u32::MAX);
    client.write_all(&len.to_be_bytes())?;
    client.write_all(data)
}

/// Run a shell command, streaming its stdout in length-framed chunks,
/// followed by a zero-length terminator.
fn run_shell(client: &mut TcpStream, cmd: &str) -> Result<()> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map(ChildGuard::new);

    let mut child = match child {
        Ok(c) => c,
        Err(e) => {
            tracing::debug!(error = %e, "failed to spawn shell command");
            write_framed(client, &[]).map_err(SessionError::ClientWrite)?;
            return Ok(());
        }
    };

    let mut stdout = child
        .inner_mut()
        .stdout
        .take()
        .context("shell child had no stdout pipe")?;

    let mut chunk = [0u8; SHELL_READ_CHUNK];
    loop {
        match stdout.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => write_framed(client, &chunk[..n]).map_err(SessionError::ClientWrite)?,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }

    write_framed(client, &[]).map_err(SessionError::ClientWrite)?;
    Ok(())
}

/// Tokenize `@`-style dispatch and fork+exec via argv, not waited on.
fn run_spawn(args: &[String]) {
    if args.is_empty() {
        return;
    }
    match Command::new(&args[0]).args(&args[1..]).spawn() {
        Ok(child) => {
            // Parent does not wait; SIGCHLD is ignored process-wide so the
            // child self-reaps on exit.
            std::mem::drop(child);
        }
        Err(e) => tracing::debug!(cmd = %args[0], error = %e, "failed to spawn command"),
    }
}

fn run_lcd(config: &DaemonConfig, arg: &str) {
    if let Err(e) = Command::new(&config.lcd_control_script).arg(arg).spawn() {
        tracing::debug!(error = %e, "failed to spawn lcd control script");
    }
}

pub fn handle(client: TcpStream, state: Arc<ConnState>, config: &DaemonConfig) -> Result<()> {
    client
        .set_nonblocking(true)
        .context("failed to set executor socket non-blocking")?;
    let mut client = client;

    let mut injector = Command::new(&config.input_injector_command[0])
        .args(&config.input_injector_command[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map(ChildGuard::new)
        .context("failed to spawn input-injection helper")?;

    let injector_stdin = injector
        .inner_mut()
        .stdin
        .take()
        .context("input-injection helper had no stdin pipe")?;

    let mut reader = NonBlockingLineSource::new(client.try_clone().context("failed to clone executor socket")?);
    let mut injector_stdin = injector_stdin;
    let mut last_ping_time = Instant::now();

    loop {
        let line = match reader.read_line() {
            Ok(Some(line)) => line,
            Ok(None) => {
                std::thread::sleep(READ_RETRY_SLEEP);
                if last_ping_time.elapsed() > Duration::from_millis(PING_TIMEOUT_MS) {
                    return Err(SessionError::PingTimeout.into());
                }
                continue;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(READ_RETRY_SLEEP);
                if last_ping_time.elapsed() > Duration::from_millis(PING_TIMEOUT_MS) {
                    return Err(SessionError::PingTimeout.into());
                }
                continue;
            }
            Err(e) => return Err(e).context("executor client read failed"),
        };

        // `run_shell` streams its own framed chunks and writes the
        // terminator itself; every other branch gets a single terminator
        // written after dispatch. A terminator follows *every* handled
        // command, not only `$` ones.
        match classify(&line) {
            Command_::Shell(cmd) => run_shell(&mut client, &cmd)?,
            other => {
                match other {
                    Command_::Spawn(args) => run_spawn(&args),
                    Command_::InjectInput(payload) => {
                        let _ = writeln!(injector_stdin, "{payload}");
                        let _ = injector_stdin.flush();
                    }
                    Command_::VideoFps(n) => state.set_video_fps(n),
                    Command_::XwinFps(n) => state.set_xwin_fps(n),
                    Command_::Lcd(arg) => run_lcd(config, &arg),
                    Command_::Ping => last_ping_time = Instant::now(),
                    Command_::Unrecognized => tracing::debug!(line, "unrecognized executor command"),
                    Command_::Shell(_) => unreachable!(),
                }
                write_framed(&mut client, &[]).map_err(SessionError::ClientWrite)?;
            }
        }

        if last_ping_time.elapsed() > Duration::from_millis(PING_TIMEOUT_MS) {
            return Err(SessionError::PingTimeout.into());
        }
    }
}

/// Buffered, best-effort non-blocking line reader over a non-blocking TCP
/// socket. Overlong incomplete lines are discarded rather than buffered
/// forever.
struct NonBlockingLineSource {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl NonBlockingLineSource {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    /// `Ok(None)` covers both "would block" and "line not yet complete".
    fn read_line(&mut self) -> std::io::Result<Option<String>> {
        if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            return Ok(Some(finish_line(line)));
        }

        let mut chunk = [0u8; 256];
        match self.stream.read(&mut chunk) {
            Ok(0) => Ok(None),
            Ok(n) => {
                self.buf.extend_from_slice(&chunk[..n]);
                if self.buf.len() > MAX_LINE_LEN && !self.buf.contains(&b'\n') {
                    self.buf.clear();
                }
                if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = self.buf.drain(..=pos).collect();
                    Ok(Some(finish_line(line)))
                } else {
                    Ok(None)
                }
            }
            Err(e) => Err(e),
        }
    }
}

fn finish_line(mut raw: Vec<u8>) -> String {
    if raw.last() == Some(&b'\n') {
        raw.pop();
    }
    if raw.last() == Some(&b'\r') {
        raw.pop();
    }
    String::from_utf8_lossy(&raw).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_spawn_prefix() {
        assert_eq!(
            classify("@echo hi there"),
            Command_::Spawn(vec!["echo".into(), "hi".into(), "there".into()])
        );
    }

    #[test]
    fn classify_shell_prefix() {
        assert_eq!(classify("$echo hello"), Command_::Shell("echo hello".into()));
    }

    #[test]
    fn classify_inject_input() {
        assert_eq!(
            classify("inject_input=tap 10 20"),
            Command_::InjectInput("tap 10 20".into())
        );
    }

    #[test]
    fn classify_fps_commands() {
        assert_eq!(classify("vfps=15"), Command_::VideoFps(15));
        assert_eq!(classify("xfps=30"), Command_::XwinFps(30));
        assert_eq!(classify("vfps=nope"), Command_::Unrecognized);
    }

    #[test]
    fn classify_lcd_and_ping() {
        assert_eq!(classify("lcd=on"), Command_::Lcd("on".into()));
        assert_eq!(classify("ping"), Command_::Ping);
    }

    #[test]
    fn classify_unknown_line() {
        assert_eq!(classify("garbage"), Command_::Unrecognized);
    }

    #[test]
    fn write_framed_encodes_length_prefix() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        write_framed(&mut client, b"hello\n").unwrap();
        write_framed(&mut client, &[]).unwrap();

        let mut buf = vec![0u8; 4 + 6 + 4];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..4], &6u32.to_be_bytes());
        assert_eq!(&buf[4..10], b"hello\n");
        assert_eq!(&buf[10..14], &0u32.to_be_bytes());
    }
}
