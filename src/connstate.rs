//! Process-wide connection-state bus shared by every listener and worker.
//!
//! Mirrors the single global record in the original daemon: a live-client
//! counter plus a handful of raise-once, clear-on-read edge flags. Edges
//! are write-by-one-producer, read-and-clear-by-one-consumer, safe under
//! relaxed atomic ordering; the FPS knobs tolerate stale reads for up to
//! one frame.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

const DEFAULT_FPS: u32 = 5;

/// Shared, lock-free state threaded through every worker via `Arc`.
pub struct ConnState {
    client_count: AtomicU32,
    video_closed: AtomicBool,
    xwin_closed: AtomicBool,
    executor_closed: AtomicBool,
    video_close_request: AtomicBool,
    video_fps: AtomicU32,
    xwin_fps: AtomicU32,
}

impl ConnState {
    pub fn new() -> Self {
        Self {
            client_count: AtomicU32::new(0),
            video_closed: AtomicBool::new(false),
            xwin_closed: AtomicBool::new(false),
            executor_closed: AtomicBool::new(false),
            video_close_request: AtomicBool::new(false),
            video_fps: AtomicU32::new(DEFAULT_FPS),
            xwin_fps: AtomicU32::new(DEFAULT_FPS),
        }
    }

    /// Number of TCP clients currently connected across every listener.
    pub fn client_count(&self) -> u32 {
        self.client_count.load(Ordering::Relaxed)
    }

    pub fn client_connected(&self) {
        self.client_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturating decrement: never underflows below 0.
    pub fn client_disconnected(&self) {
        let _ = self
            .client_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }

    pub fn raise_video_closed(&self) {
        self.video_closed.store(true, Ordering::Relaxed);
    }

    pub fn raise_xwin_closed(&self) {
        self.xwin_closed.store(true, Ordering::Relaxed);
    }

    pub fn raise_executor_closed(&self) {
        self.executor_closed.store(true, Ordering::Relaxed);
    }

    /// Raised when the notify socket itself disconnects; consumed once by
    /// the next video-session iteration.
    pub fn raise_video_close_request(&self) {
        self.video_close_request.store(true, Ordering::Relaxed);
    }

    /// Read-and-clear. Each edge has its own flag — unlike the source's
    /// single shared `s_video_socket_closed_notify`, video-closed and
    /// xwin-closed never mask each other here.
    pub fn take_video_closed(&self) -> bool {
        self.video_closed.swap(false, Ordering::Relaxed)
    }

    pub fn take_xwin_closed(&self) -> bool {
        self.xwin_closed.swap(false, Ordering::Relaxed)
    }

    pub fn take_executor_closed(&self) -> bool {
        self.executor_closed.swap(false, Ordering::Relaxed)
    }

    pub fn take_video_close_request(&self) -> bool {
        self.video_close_request.swap(false, Ordering::Relaxed)
    }

    pub fn video_fps(&self) -> u32 {
        self.video_fps.load(Ordering::Relaxed).max(1)
    }

    pub fn set_video_fps(&self, fps: u32) {
        self.video_fps.store(fps.max(1), Ordering::Relaxed);
    }

    pub fn xwin_fps(&self) -> u32 {
        self.xwin_fps.load(Ordering::Relaxed).max(1)
    }

    pub fn set_xwin_fps(&self, fps: u32) {
        self.xwin_fps.store(fps.max(1), Ordering::Relaxed);
    }
}

impl Default for ConnState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_count_saturates_at_zero() {
        let state = ConnState::new();
        state.client_disconnected();
        assert_eq!(state.client_count(), 0);
        state.client_connected();
        state.client_connected();
        state.client_disconnected();
        assert_eq!(state.client_count(), 1);
    }

    #[test]
    fn edges_are_clear_on_read() {
        let state = ConnState::new();
        assert!(!state.take_executor_closed());
        state.raise_executor_closed();
        assert!(state.take_executor_closed());
        assert!(!state.take_executor_closed());
    }

    #[test]
    fn fps_defaults_to_five() {
        let state = ConnState::new();
        assert_eq!(state.video_fps(), 5);
        assert_eq!(state.xwin_fps(), 5);
        state.set_xwin_fps(30);
        assert_eq!(state.xwin_fps(), 30);
    }
}
