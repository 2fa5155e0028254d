//! IS22 Frame Gateway Library
//!
//! Real-time camera frame streaming over WebSocket
//!
//! ## Architecture
//!
//! 1. ChannelRegistry - Session ID to client channel mapping
//! 2. HeartbeatMonitor - Channel liveness (ping + inactivity sweep)
//! 3. FrameSource - Frame producers (transcoder pipeline, direct feed)
//! 4. SessionController - Per-session lifecycle state machine
//! 5. StreamGateway - go2rtc relay and vendor playback collaborator
//! 6. CameraDirectory - Camera config lookup collaborator
//! 7. WebAPI - Control endpoints and WebSocket attach
//!
//! ## Design Principles
//!
//! - One actor task owns each session's producer and queue
//! - The registry map is the only cross-session shared state
//! - Every exit path releases the transcoder process and channel

pub mod camera_directory;
pub mod channel_registry;
pub mod error;
pub mod frame_source;
pub mod heartbeat_monitor;
pub mod models;
pub mod session_controller;
pub mod state;
pub mod stream_gateway;
pub mod web_api;

pub use error::{Error, Result};
pub use state::AppState;
