//! Default configuration constants for storyloom.
//!
//! This module provides shared constants used across different configuration
//! types to ensure consistency and eliminate duplication.

/// Default WebSocket endpoint of the generation service.
pub const SERVICE_WS_URL: &str = "ws://localhost:8000/api/ws";

/// Default base URL of the one-shot HTTP fallback API.
pub const SERVICE_API_URL: &str = "http://localhost:8000/api";

/// Heartbeat interval in seconds.
///
/// While connected, a liveness probe is sent this often. 30s keeps idle
/// connections alive through typical proxy timeouts without flooding the
/// service.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Heartbeat acknowledgment timeout in seconds.
///
/// If no acknowledgment arrives within this window after a probe, the
/// connection is considered silently dead and is force-closed.
pub const HEARTBEAT_TIMEOUT_SECS: u64 = 5;

/// Fixed delay between reconnect attempts in seconds.
pub const RECONNECT_DELAY_SECS: u64 = 3;

/// Maximum consecutive reconnect attempts before giving up.
///
/// After this many failures the connection reaches the terminal `failed`
/// state; resuming requires an explicit reconnect request.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Assumed total duration of a remote image generation, in seconds.
///
/// Drives the simulated progress ramp while the real completion time is
/// unknown.
pub const IMAGE_PROGRESS_WINDOW_SECS: u64 = 120;

/// Assumed total duration of a remote video generation, in seconds.
pub const VIDEO_PROGRESS_WINDOW_SECS: u64 = 400;

/// Ceiling for simulated progress, in percent.
///
/// Simulated progress approaches but never exceeds this value; only the real
/// result arrival moves it to 100.
pub const PROGRESS_CEILING: u8 = 90;

/// Interval between simulated progress emissions in milliseconds.
pub const PROGRESS_TICK_MS: u64 = 500;

/// How long the 100% value stays visible before resetting to 0, in
/// milliseconds.
pub const PROGRESS_DISPLAY_DELAY_MS: u64 = 1000;

/// Buffer size of the outbound request channel.
pub const REQUEST_BUFFER: usize = 32;

/// Buffer size of the transport frame channels.
pub const TRANSPORT_BUFFER: usize = 64;
