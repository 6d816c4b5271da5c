//! Real-time voice call client.
//!
//! ```text
//! UI commands ──▶ call::CallController ──┬─▶ session::SessionNegotiator ◀─▶ transport::TransportConnection
//!                                        ├─▶ audio::CapturePipeline ──▶ transport (binary frames)
//!                                        └─▶ audio::PlaybackPipeline ◀── transport / remote peer track
//! ```
//!
//! Every component is owned by a single [`call::CallController`] which
//! serialises all events on one tokio task.

pub mod app;
pub mod audio;
pub mod call;
pub mod config;
pub mod hotkey;
pub mod session;
pub mod signaling;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;
