//! Notify multiplexer: HEVC power-state polling, X-event probe
//! passthrough, connection-state edge surfacing, and liveness pings.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::config::DaemonConfig;
use crate::connstate::ConnState;
use crate::error::SessionError;
use crate::subprocess::ChildGuard;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const PING_EVERY_N_ITERATIONS: u32 = 10;

#[derive(Debug, PartialEq, Eq)]
enum HevcState {
    Unknown,
    On,
    Off,
}

/// Accumulates bytes from a non-blocking pipe fd and yields whole lines.
struct NonBlockingLineReader {
    fd_file: File,
    buf: Vec<u8>,
}

impl NonBlockingLineReader {
    /// Attempt to pull one complete line out of the pipe without blocking.
    /// `Ok(None)` means no complete line is available yet (including the
    /// would-block case); the caller sleeps and retries.
    fn try_read_line(&mut self) -> std::io::Result<Option<String>> {
        if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line = self.buf.drain(..=pos).collect::<Vec<u8>>();
            return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
        }

        let mut chunk = [0u8; 256];
        match self.fd_file.read(&mut chunk) {
            Ok(0) => Ok(None),
            Ok(n) => {
                self.buf.extend_from_slice(&chunk[..n]);
                if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                    let line = self.buf.drain(..=pos).collect::<Vec<u8>>();
                    Ok(Some(String::from_utf8_lossy(&line).into_owned()))
                } else {
                    Ok(None)
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn set_nonblocking(file: &File) -> Result<()> {
    let fd = file.as_raw_fd();
    let flags = fcntl(fd, FcntlArg::F_GETFL).context("fcntl(F_GETFL) failed")?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).context("fcntl(F_SETFL) failed")?;
    Ok(())
}

pub fn handle(mut client: TcpStream, state: Arc<ConnState>, config: &DaemonConfig) -> Result<()> {
    let result = run(&mut client, &state, config);
    // The notify socket closing (for any reason) requests the video
    // session to terminate on its next iteration.
    state.raise_video_close_request();
    result
}

fn run(client: &mut TcpStream, state: &Arc<ConnState>, config: &DaemonConfig) -> Result<()> {
    let mut hevc_file = File::open(&config.hevc_state_path)
        .with_context(|| format!("failed to open {}", config.hevc_state_path.display()))?;

    let mut probe = Command::new("sh")
        .arg("-c")
        .arg(&config.xev_probe_command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map(ChildGuard::new)
        .context("failed to spawn X-event probe")?;

    let probe_stdout = probe
        .inner_mut()
        .stdout
        .take()
        .context("event probe had no stdout pipe")?;

    let mut reader = NonBlockingLineReader {
        fd_file: probe_stdout,
        buf: Vec::new(),
    };

    // First line (still blocking at this point) is the probe's PID.
    let pid = read_pid_line_blocking(&mut reader.fd_file)
        .context("failed to read event probe PID")?;
    tracing::debug!(pid, "event probe started");

    set_nonblocking(&reader.fd_file)?;

    let mut hevc_state = HevcState::Unknown;
    let mut iteration: u32 = 0;

    let run_result = (|| -> Result<()> {
        loop {
            iteration += 1;

            poll_hevc_state(&mut hevc_file, &mut hevc_state, client)?;

            match reader.try_read_line() {
                Ok(Some(line)) => {
                    client
                        .write_all(line.as_bytes())
                        .map_err(SessionError::ClientWrite)?;
                }
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(SessionError::ProbeRead(e).into()),
            }

            if state.take_video_closed() {
                client
                    .write_all(b"socket_closed=video\n")
                    .map_err(SessionError::ClientWrite)?;
            }
            if state.take_xwin_closed() {
                client
                    .write_all(b"socket_closed=xwin\n")
                    .map_err(SessionError::ClientWrite)?;
            }
            if state.take_executor_closed() {
                client
                    .write_all(b"socket_closed=executor\n")
                    .map_err(SessionError::ClientWrite)?;
            }

            if iteration % PING_EVERY_N_ITERATIONS == 0 {
                client
                    .write_all(b"ping\n")
                    .map_err(SessionError::ClientWrite)?;
            }
        }
    })();

    let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
    run_result
}

fn read_pid_line_blocking(pipe: &mut File) -> Result<i32> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = pipe.read(&mut byte)?;
        if n == 0 {
            bail!("event probe closed before printing its PID");
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    String::from_utf8_lossy(&line)
        .trim()
        .parse::<i32>()
        .context("event probe's first line was not a PID")
}

fn poll_hevc_state(
    hevc_file: &mut File,
    hevc_state: &mut HevcState,
    client: &mut TcpStream,
) -> Result<()> {
    hevc_file
        .seek(SeekFrom::Start(0))
        .context("failed to rewind HEVC state file")?;
    let mut buf = [0u8; 256];
    let n = hevc_file.read(&mut buf).unwrap_or(0);

    if buf[..n].starts_with(b"on") {
        if *hevc_state != HevcState::On {
            *hevc_state = HevcState::On;
            client
                .write_all(b"hevc=on\n")
                .map_err(SessionError::ClientWrite)?;
        }
    } else if buf[..n].starts_with(b"off") && *hevc_state != HevcState::Off {
        *hevc_state = HevcState::Off;
        client
            .write_all(b"hevc=off\n")
            .map_err(SessionError::ClientWrite)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;
    use std::os::unix::net::UnixStream;

    /// `File` works for both a real pipe fd and a Unix socket fd; borrow
    /// one half of a socketpair as the `File` the reader expects.
    fn reader_over(sock: UnixStream) -> NonBlockingLineReader {
        use std::os::fd::{AsRawFd, FromRawFd};
        sock.set_nonblocking(true).unwrap();
        let fd = sock.as_raw_fd();
        std::mem::forget(sock);
        NonBlockingLineReader {
            fd_file: unsafe { File::from_raw_fd(fd) },
            buf: Vec::new(),
        }
    }

    #[test]
    fn yields_none_when_no_data_available() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut reader = reader_over(a);
        assert!(matches!(reader.try_read_line(), Ok(None)));
    }

    #[test]
    fn accumulates_partial_writes_into_one_line() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut reader = reader_over(a);

        b.write_all(b"xev ").unwrap();
        assert!(matches!(reader.try_read_line(), Ok(None)));

        b.write_all(b"ButtonPress\n").unwrap();
        std::thread::sleep(Duration::from_millis(10));
        let line = reader.try_read_line().unwrap().unwrap();
        assert_eq!(line, "xev ButtonPress\n");
    }

    #[test]
    fn splits_two_lines_delivered_in_one_read() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut reader = reader_over(a);

        b.write_all(b"one\ntwo\n").unwrap();
        std::thread::sleep(Duration::from_millis(10));

        assert_eq!(reader.try_read_line().unwrap().unwrap(), "one\n");
        assert_eq!(reader.try_read_line().unwrap().unwrap(), "two\n");
        assert!(matches!(reader.try_read_line(), Ok(None)));
    }

    #[test]
    fn hevc_poll_emits_only_on_state_change() {
        let path = std::env::temp_dir().join(format!(
            "nx-remote-controller-daemon-test-hevc-{:?}",
            std::thread::current().id()
        ));
        std::fs::write(&path, b"on").unwrap();
        let mut state_file = File::open(&path).unwrap();

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        let mut hevc_state = HevcState::Unknown;
        poll_hevc_state(&mut state_file, &mut hevc_state, &mut client).unwrap();
        assert_eq!(hevc_state, HevcState::On);

        // Re-polling the same state must not emit a second message.
        poll_hevc_state(&mut state_file, &mut hevc_state, &mut client).unwrap();

        let mut buf = [0u8; 8];
        server.set_nonblocking(true).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        let n = server.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hevc=on\n");
        assert!(matches!(
            server.read(&mut buf),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock
        ));

        let _ = std::fs::remove_file(&path);
    }
}
