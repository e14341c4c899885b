//! Video capture handler: YUV 4:2:0 framebuffer streaming with per-region
//! header-hash change detection.

use std::io::Write;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::config::{DaemonConfig, VIDEO_FRAME_SIZE};
use crate::connstate::ConnState;
use crate::error::SessionError;
use crate::hash::additive_hash;
use crate::memregion::MemRegion;

const HEADER_HASH_BYTES: usize = 2 * crate::config::FRAME_WIDTH;

/// One accepted video session: map every configured region, stream whole
/// frames whenever a region's header hash changes, pace at `video_fps`.
pub fn handle(mut client: TcpStream, state: Arc<ConnState>, config: &DaemonConfig) -> Result<()> {
    let regions: Vec<MemRegion> = config
        .framebuffer_offsets
        .iter()
        .map(|&offset| MemRegion::map(&config.dev_mem_path, offset, config.mmap_size))
        .collect::<Result<_>>()?;

    let mut prior_hashes = vec![0u32; regions.len()];

    loop {
        let iter_start = Instant::now();

        if state.take_video_close_request() {
            tracing::debug!("video session closing on notify-socket disconnect");
            return Ok(());
        }

        for (region, prior) in regions.iter().zip(prior_hashes.iter_mut()) {
            let hash = additive_hash(region.header(HEADER_HASH_BYTES));
            if *prior != 0 && hash != *prior {
                let frame = &region.as_bytes()[..VIDEO_FRAME_SIZE];
                client.write_all(frame).map_err(SessionError::ClientWrite)?;
            }
            *prior = hash;
        }

        let fps = state.video_fps();
        let frame_time = Duration::from_millis(1000 / u64::from(fps));
        let elapsed = iter_start.elapsed();
        if elapsed < frame_time {
            std::thread::sleep(frame_time - elapsed);
        }
    }
}
