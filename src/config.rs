//! Daemon configuration, loaded from an optional TOML file.
//!
//! Every field defaults to the value hard-coded in the original C daemon;
//! the file only needs to exist on hosts where one of those constants
//! (physical framebuffer offsets, tool paths) needs overriding for testing.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const FRAME_WIDTH: usize = 720;
pub const FRAME_HEIGHT: usize = 480;
pub const VIDEO_FRAME_SIZE: usize = FRAME_WIDTH * FRAME_HEIGHT * 3 / 2;
pub const XWIN_SEGMENT_PIXELS: usize = 320;
pub const XWIN_SEGMENT_WIRE_SIZE: usize = 2 + XWIN_SEGMENT_PIXELS * 4;
pub const XWIN_NUM_SEGMENTS: usize = FRAME_WIDTH * FRAME_HEIGHT / XWIN_SEGMENT_PIXELS;
pub const XWIN_FRAME_SIZE: usize = FRAME_WIDTH * FRAME_HEIGHT * 4;
pub const XWIN_EOF_INDEX: u16 = 0x0FFF;
pub const XWD_SKIP_BYTES: usize = 3179;
pub const PING_TIMEOUT_MS: u64 = 5000;
pub const DISCOVERY_PACKET_SIZE: usize = 32;
pub const DISCOVERY_BANNER: &str = "NX_REMOTE|1.0|NX500|";

pub const PORT_NOTIFY: u16 = 5677;
pub const PORT_VIDEO: u16 = 5678;
pub const PORT_XWIN: u16 = 5679;
pub const PORT_EXECUTOR: u16 = 5680;
pub const PORT_DISCOVERY: u16 = 5681;

const APP_PATH: &str = "/opt/usr/apps/nx-remote-controller-mod";

/// `MMAP_SIZE_2` from the original source: the mapping size used by the
/// commented-out second address group and by the superseded `nx-streamer.c`
/// prototype. Never wired into the active region list — kept only so the
/// constant isn't silently lost (see DESIGN.md).
#[allow(dead_code)]
pub const MMAP_SIZE_2: usize = 695_296;

fn default_mmap_size() -> usize {
    522_496
}

fn default_addrs() -> Vec<u64> {
    vec![0xbbaea500, 0xbbb68e00, 0xbbbe7700, 0xbba6bc00]
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_dev_mem() -> PathBuf {
    PathBuf::from("/dev/mem")
}

fn default_hevc_state_path() -> PathBuf {
    PathBuf::from("/sys/kernel/debug/pmu/hevc/state")
}

fn default_xev_probe_command() -> String {
    format!(
        "chroot {app}/tools xev-nx -p -id \"$(chroot {app}/tools xdotool search --class di-camera-app)\"",
        app = APP_PATH
    )
}

fn default_xwd_command() -> Vec<String> {
    vec!["xwd".to_string(), "-root".to_string()]
}

fn default_input_injector_command() -> Vec<String> {
    vec![
        "chroot".to_string(),
        format!("{APP_PATH}/tools"),
        "nx-input-injector".to_string(),
    ]
}

fn default_lcd_control_script() -> PathBuf {
    PathBuf::from(format!("{APP_PATH}/lcd_control.sh"))
}

fn default_popup_script() -> PathBuf {
    PathBuf::from(format!("{APP_PATH}/popup_timeout.sh"))
}

fn default_popup_timeout_secs() -> u32 {
    3
}

fn default_popup_message() -> String {
    "Disconnected".to_string()
}

fn default_initial_fps() -> u32 {
    5
}

/// Daemon-wide configuration. All fields have defaults matching the
/// original daemon's compile-time constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Address every TCP listener and the UDP broadcaster bind to.
    pub bind_addr: String,

    /// Physical `/dev/mem` byte offsets scanned by the video capture
    /// handler, in fixed order.
    pub framebuffer_offsets: Vec<u64>,

    /// Bytes mapped per framebuffer region.
    pub mmap_size: usize,

    /// Path to the physical memory device.
    pub dev_mem_path: PathBuf,

    /// Shell command line for the external X-event probe (notify).
    pub xev_probe_command: String,

    /// Argv for the external XWD capture subprocess (xwin).
    pub xwd_command: Vec<String>,

    /// Path to the HEVC power-state pseudo-file polled by notify.
    pub hevc_state_path: PathBuf,

    /// Argv for the external input-injection helper (executor).
    pub input_injector_command: Vec<String>,

    /// Path to the LCD-control shell script invoked by executor's `lcd=`.
    pub lcd_control_script: PathBuf,

    /// Path to the popup/notification shell script invoked by discovery.
    pub popup_script: PathBuf,

    /// Seconds argument passed to the popup script.
    pub popup_timeout_secs: u32,

    /// Message argument passed to the popup script.
    pub popup_message: String,

    /// Initial `video_fps`/`xwin_fps` value for freshly-accepted sessions.
    pub initial_fps: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            framebuffer_offsets: default_addrs(),
            mmap_size: default_mmap_size(),
            dev_mem_path: default_dev_mem(),
            xev_probe_command: default_xev_probe_command(),
            xwd_command: default_xwd_command(),
            hevc_state_path: default_hevc_state_path(),
            input_injector_command: default_input_injector_command(),
            lcd_control_script: default_lcd_control_script(),
            popup_script: default_popup_script(),
            popup_timeout_secs: default_popup_timeout_secs(),
            popup_message: default_popup_message(),
            initial_fps: default_initial_fps(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a TOML file, falling back to defaults when
    /// `path` is `None` or the file does not exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            tracing::debug!("no config path given, using built-in defaults");
            return Ok(Self::default());
        };

        if !path.exists() {
            tracing::debug!(?path, "config file not found, using built-in defaults");
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config: {}", path.display()))?;

        tracing::info!(?path, "configuration loaded");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_constants() {
        let cfg = DaemonConfig::default();
        assert_eq!(cfg.framebuffer_offsets, vec![
            0xbbaea500, 0xbbb68e00, 0xbbbe7700, 0xbba6bc00,
        ]);
        assert_eq!(cfg.mmap_size, 522_496);
        assert_eq!(cfg.initial_fps, 5);
        assert_eq!(VIDEO_FRAME_SIZE, 518_400);
        assert_eq!(XWIN_NUM_SEGMENTS, 1080);
        assert_eq!(XWIN_SEGMENT_WIRE_SIZE, 1282);
        assert_eq!(XWIN_FRAME_SIZE, 1_382_400);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = DaemonConfig::load(Some(Path::new("/nonexistent/path.toml"))).unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0");
    }

    #[test]
    fn toml_round_trip() {
        let cfg = DaemonConfig::default();
        let text = toml::to_string(&cfg).unwrap();
        let parsed: DaemonConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.mmap_size, cfg.mmap_size);
        assert_eq!(parsed.framebuffer_offsets, cfg.framebuffer_offsets);
    }
}
