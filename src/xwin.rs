//! XWin capture handler: hash-diffed BGRA segment streaming from an
//! `xwd -root` subprocess.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::config::{
    DaemonConfig, XWD_SKIP_BYTES, XWIN_EOF_INDEX, XWIN_FRAME_SIZE, XWIN_NUM_SEGMENTS,
    XWIN_SEGMENT_PIXELS, XWIN_SEGMENT_WIRE_SIZE,
};
use crate::connstate::ConnState;
use crate::error::SessionError;
use crate::hash::segment_hash;
use crate::subprocess::ChildGuard;

/// Per-segment hash table. `None` means the segment has never been
/// transmitted, so it is always emitted once regardless of what it
/// hashes to — a segment whose real content happens to hash to exactly
/// 0 must still be treated as "changed" on its first appearance.
pub type SegmentHashes = [Option<u32>; XWIN_NUM_SEGMENTS];

/// Read exactly `buf.len()` bytes or report how many were actually read.
fn read_exact_or_short(mut r: impl Read, buf: &mut [u8]) -> std::io::Result<Option<usize>> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => return Ok(Some(filled)),
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

/// One capture iteration: spawn `xwd -root`, skip its header, diff and
/// stream every segment, emit the end-of-frame marker. Returns `Ok(true)`
/// if the iteration completed a full frame, `Ok(false)` if it was
/// abandoned for a transient reason (subprocess spawn/short read) and the
/// caller should simply retry next tick.
fn run_iteration(
    client: &mut TcpStream,
    config: &DaemonConfig,
    segment_hashes: &mut SegmentHashes,
) -> Result<bool> {
    let mut cmd = Command::new(&config.xwd_command[0]);
    cmd.args(&config.xwd_command[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = match cmd.spawn() {
        Ok(c) => ChildGuard::new(c),
        Err(e) => {
            tracing::debug!(error = %e, "failed to spawn xwd, retrying next tick");
            return Ok(false);
        }
    };

    let mut stdout = child
        .inner_mut()
        .stdout
        .take()
        .context("xwd child had no stdout pipe")?;

    let mut skip_buf = vec![0u8; XWD_SKIP_BYTES];
    if let Some(got) = read_exact_or_short(&mut stdout, &mut skip_buf)? {
        let short = SessionError::ShortRead { got, wanted: XWD_SKIP_BYTES };
        tracing::debug!(error = %short, "short xwd header, abandoning frame");
        return Ok(false);
    }

    let mut record = [0u8; XWIN_SEGMENT_WIRE_SIZE];
    let mut total_pixel_bytes = 0usize;

    for index in 0..XWIN_NUM_SEGMENTS {
        let pixel_bytes = XWIN_SEGMENT_PIXELS * 4;
        if let Some(got) = read_exact_or_short(&mut stdout, &mut record[2..2 + pixel_bytes])? {
            let short = SessionError::ShortRead { got, wanted: pixel_bytes };
            tracing::debug!(index, error = %short, "short segment read, abandoning frame");
            return Ok(false);
        }
        total_pixel_bytes += pixel_bytes;

        let hash = segment_hash(&record[2..2 + pixel_bytes]);
        if segment_hashes[index] == Some(hash) {
            continue;
        }
        segment_hashes[index] = Some(hash);

        let idx = index as u16;
        record[0] = (idx >> 8) as u8;
        record[1] = (idx & 0xff) as u8;
        client.write_all(&record).map_err(SessionError::ClientWrite)?;
    }

    if total_pixel_bytes != XWIN_FRAME_SIZE {
        tracing::debug!(total_pixel_bytes, wanted = XWIN_FRAME_SIZE, "frame size mismatch");
        return Ok(false);
    }

    record[0] = (XWIN_EOF_INDEX >> 8) as u8;
    record[1] = (XWIN_EOF_INDEX & 0xff) as u8;
    client.write_all(&record).map_err(SessionError::ClientWrite)?;

    Ok(true)
}

pub fn handle(mut client: TcpStream, state: Arc<ConnState>, config: &DaemonConfig) -> Result<()> {
    let mut segment_hashes: SegmentHashes = [None; XWIN_NUM_SEGMENTS];

    loop {
        let iter_start = Instant::now();

        run_iteration(&mut client, config, &mut segment_hashes)?;

        let fps = state.xwin_fps();
        let frame_time = Duration::from_millis(1000 / u64::from(fps));
        let elapsed = iter_start.elapsed();
        if elapsed < frame_time {
            std::thread::sleep(frame_time - elapsed);
        }
    }
}
