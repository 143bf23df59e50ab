#![forbid(unsafe_code)]

// meshcall library - signaling and room coordination for full-mesh group calls

pub mod error;
pub mod media;
pub mod metrics;
pub mod room;
pub mod session;
pub mod signaling;
