#![forbid(unsafe_code)]

// Media module - the RPC boundary to the external media engine.
// The engine owns pipelines, WebRTC endpoints, and filters; this side only
// holds opaque handles and drives the control protocol.

pub mod config;
pub mod fake;
pub mod kurento;

pub use config::MediaConfig;
pub use fake::FakeMediaEngine;
pub use kurento::KurentoClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Custom error type for media engine operations
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("engine transport error: {0}")]
    Transport(String),

    #[error("engine rejected request: {0}")]
    Rejected(String),

    #[error("pipeline error: {0}")]
    Pipeline(String),

    #[error("endpoint error: {0}")]
    Endpoint(String),

    #[error("filter error: {0}")]
    Filter(String),

    #[error("engine connection closed")]
    Closed,
}

/// Result type alias for media operations
pub type MediaResult<T> = Result<T, MediaError>;

/// Handle to a per-participant media-processing pipeline owned by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineHandle(pub String);

/// Handle to a media element (endpoint or filter) inside a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaElement(pub String);

/// Connectivity candidate as carried on the wire and relayed to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInfo {
    pub candidate: String,
    pub sdp_mid: String,
    pub sdp_m_line_index: u32,
}

/// Parameters for the visual-effect filter applied at a publisher.
#[derive(Debug, Clone)]
pub struct FilterParams {
    pub image_uri: String,
    pub offset_x: f32,
    pub offset_y: f32,
    pub width: f32,
    pub height: f32,
}

/// Control surface of the external real-time media engine.
///
/// Calls are awaitable and fallible; they may block on a network round-trip,
/// so callers must not hold a room lock across them.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Allocates a fresh media-processing pipeline.
    async fn create_pipeline(&self) -> MediaResult<PipelineHandle>;

    /// Creates the endpoint publishing a participant's own stream.
    async fn create_outbound_endpoint(
        &self,
        pipeline: &PipelineHandle,
    ) -> MediaResult<MediaElement>;

    /// Creates an endpoint receiving `peer`'s stream into `pipeline`.
    async fn create_inbound_endpoint(
        &self,
        pipeline: &PipelineHandle,
        peer: &str,
    ) -> MediaResult<MediaElement>;

    /// Runs offer/answer negotiation on an endpoint, returning the SDP answer.
    async fn process_offer(
        &self,
        endpoint: &MediaElement,
        sdp_offer: &str,
    ) -> MediaResult<String>;

    /// Starts ICE candidate gathering on an endpoint.
    async fn gather_candidates(&self, endpoint: &MediaElement) -> MediaResult<()>;

    /// Relays a remote candidate to an endpoint.
    async fn add_ice_candidate(
        &self,
        endpoint: &MediaElement,
        candidate: &IceCandidateInfo,
    ) -> MediaResult<()>;

    /// Subscribes to engine-generated candidates for an endpoint. The channel
    /// closes when the endpoint is released.
    async fn subscribe_candidates(
        &self,
        endpoint: &MediaElement,
    ) -> MediaResult<mpsc::Receiver<IceCandidateInfo>>;

    /// Connects a source element's media flow into a sink element.
    async fn connect(&self, source: &MediaElement, sink: &MediaElement) -> MediaResult<()>;

    /// Creates a visual-effect filter element inside a pipeline.
    async fn create_filter(
        &self,
        pipeline: &PipelineHandle,
        params: &FilterParams,
    ) -> MediaResult<MediaElement>;

    /// Releases a single element (endpoint or filter).
    async fn release_element(&self, element: &MediaElement) -> MediaResult<()>;

    /// Releases a pipeline and every element it still contains.
    async fn release_pipeline(&self, pipeline: &PipelineHandle) -> MediaResult<()>;
}
