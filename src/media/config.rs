#![forbid(unsafe_code)]

// Media engine configuration, read from the environment at startup.

use crate::media::FilterParams;
use tracing::info;

/// Overlay image used when no FILTER_IMAGE_URL is configured.
const DEFAULT_FILTER_IMAGE: &str =
    "https://raw.githubusercontent.com/Kurento/test-files/main/img/mario-wings.png";

/// Configuration for the media engine connection and the filter effect.
#[derive(Debug, Clone)]
pub struct MediaConfig {
    /// WebSocket URL of the media engine's control endpoint. `None` selects
    /// the in-process fake engine (tests, local development).
    pub engine_url: Option<String>,
    /// Visual-effect filter applied on `startFilter`.
    pub filter: FilterParams,
}

impl MediaConfig {
    /// Loads configuration from `KMS_URL` and `FILTER_IMAGE_URL`.
    pub fn from_env() -> Self {
        let engine_url = std::env::var("KMS_URL").ok();
        match &engine_url {
            Some(url) => info!("Using media engine at {}", url),
            None => info!("KMS_URL not set — using in-process fake media engine"),
        }

        let image_uri = std::env::var("FILTER_IMAGE_URL")
            .unwrap_or_else(|_| DEFAULT_FILTER_IMAGE.to_string());

        Self {
            engine_url,
            filter: FilterParams {
                image_uri,
                ..FilterParams::default()
            },
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            engine_url: None,
            filter: FilterParams::default(),
        }
    }
}

impl Default for FilterParams {
    fn default() -> Self {
        // Overlay geometry that places the image over a detected face.
        Self {
            image_uri: DEFAULT_FILTER_IMAGE.to_string(),
            offset_x: -0.35,
            offset_y: -1.2,
            width: 1.6,
            height: 1.6,
        }
    }
}
