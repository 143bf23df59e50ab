#![forbid(unsafe_code)]

// Kurento media server client - JSON-RPC 2.0 over WebSocket.
// Requests are matched to responses through a pending map of oneshot channels
// keyed by request id; IceCandidateFound notifications are fanned out to
// per-endpoint subscriber channels.

use crate::media::{
    FilterParams, IceCandidateInfo, MediaElement, MediaEngine, MediaError, MediaResult,
    PipelineHandle,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// Upper bound on a single control round-trip to the engine.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Outgoing frame buffer toward the engine.
const WRITE_CAPACITY: usize = 256;

struct Shared {
    next_id: AtomicU64,
    pending: StdMutex<HashMap<u64, oneshot::Sender<MediaResult<Value>>>>,
    /// object id -> subscriber for IceCandidateFound events on that object
    candidate_subs: StdMutex<HashMap<String, mpsc::Sender<IceCandidateInfo>>>,
    session_id: StdMutex<Option<String>>,
    writer: mpsc::Sender<String>,
}

/// Client for a Kurento-style media engine.
pub struct KurentoClient {
    shared: Arc<Shared>,
}

impl KurentoClient {
    /// Connects to the engine's WebSocket control endpoint and spawns the
    /// reader/writer tasks.
    pub async fn connect(url: &str) -> MediaResult<Self> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| MediaError::Transport(format!("connect to {url}: {e}")))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (writer_tx, mut writer_rx) = mpsc::channel::<String>(WRITE_CAPACITY);

        let shared = Arc::new(Shared {
            next_id: AtomicU64::new(1),
            pending: StdMutex::new(HashMap::new()),
            candidate_subs: StdMutex::new(HashMap::new()),
            session_id: StdMutex::new(None),
            writer: writer_tx,
        });

        tokio::spawn(async move {
            while let Some(frame) = writer_rx.recv().await {
                if ws_writer.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
        });

        let reader_shared = shared.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => dispatch_frame(&reader_shared, &text),
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            // Dropping the pending senders fails every in-flight request.
            reader_shared
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
            reader_shared
                .candidate_subs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
            warn!("Media engine connection closed");
        });

        Ok(Self { shared })
    }

    async fn request(&self, method: &str, mut params: Value) -> MediaResult<Value> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);

        let session_id = self
            .shared
            .session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let (Some(session), Some(map)) = (session_id, params.as_object_mut()) {
            map.insert("sessionId".to_string(), Value::String(session));
        }

        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        })
        .to_string();

        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);

        if self.shared.writer.send(frame).await.is_err() {
            self.shared
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
            return Err(MediaError::Closed);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped: connection went away mid-request.
            Ok(Err(_)) => Err(MediaError::Closed),
            Err(_) => {
                self.shared
                    .pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
                Err(MediaError::Transport(format!("{method} request timed out")))
            }
        }
    }

    async fn create(&self, object_type: &str, constructor_params: Value) -> MediaResult<String> {
        let result = self
            .request(
                "create",
                json!({ "type": object_type, "constructorParams": constructor_params }),
            )
            .await?;
        result["value"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| MediaError::Rejected(format!("create {object_type}: missing value")))
    }

    async fn invoke(&self, object: &str, operation: &str, operation_params: Value) -> MediaResult<Value> {
        self.request(
            "invoke",
            json!({
                "object": object,
                "operation": operation,
                "operationParams": operation_params,
            }),
        )
        .await
    }

    async fn release(&self, object: &str) -> MediaResult<()> {
        self.shared
            .candidate_subs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(object);
        self.request("release", json!({ "object": object })).await?;
        Ok(())
    }
}

/// Routes one inbound frame: a response to a pending request, or an event.
fn dispatch_frame(shared: &Arc<Shared>, text: &str) {
    let frame: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!("Unparseable frame from media engine: {}", e);
            return;
        }
    };

    if let Some(id) = frame["id"].as_u64() {
        if let Some(session) = frame["result"]["sessionId"].as_str() {
            let mut slot = shared.session_id.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(session.to_string());
            }
        }

        let outcome = if frame["error"].is_object() {
            let message = frame["error"]["message"]
                .as_str()
                .unwrap_or("unknown engine error")
                .to_string();
            Err(MediaError::Rejected(message))
        } else {
            Ok(frame["result"].clone())
        };

        let tx = shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        match tx {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => debug!("Response for unknown request id {}", id),
        }
        return;
    }

    if frame["method"].as_str() == Some("onEvent") {
        if let Some((object, candidate)) = event_candidate(&frame) {
            let tx = shared
                .candidate_subs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&object)
                .cloned();
            match tx {
                Some(tx) => {
                    if tx.try_send(candidate).is_err() {
                        debug!("Dropping candidate for {} (subscriber gone or full)", object);
                    }
                }
                None => debug!("Candidate event for unsubscribed object {}", object),
            }
        }
    }
}

/// Extracts (object id, candidate) from an IceCandidateFound notification.
fn event_candidate(frame: &Value) -> Option<(String, IceCandidateInfo)> {
    let value = &frame["params"]["value"];
    if value["type"].as_str() != Some("IceCandidateFound") {
        return None;
    }
    let object = value["object"].as_str()?.to_string();
    let candidate = serde_json::from_value(value["data"]["candidate"].clone()).ok()?;
    Some((object, candidate))
}

#[async_trait]
impl MediaEngine for KurentoClient {
    async fn create_pipeline(&self) -> MediaResult<PipelineHandle> {
        let id = self.create("MediaPipeline", json!({})).await?;
        Ok(PipelineHandle(id))
    }

    async fn create_outbound_endpoint(
        &self,
        pipeline: &PipelineHandle,
    ) -> MediaResult<MediaElement> {
        let id = self
            .create("WebRtcEndpoint", json!({ "mediaPipeline": pipeline.0 }))
            .await?;
        Ok(MediaElement(id))
    }

    async fn create_inbound_endpoint(
        &self,
        pipeline: &PipelineHandle,
        peer: &str,
    ) -> MediaResult<MediaElement> {
        debug!("Creating inbound endpoint for peer {}", peer);
        let id = self
            .create("WebRtcEndpoint", json!({ "mediaPipeline": pipeline.0 }))
            .await?;
        Ok(MediaElement(id))
    }

    async fn process_offer(
        &self,
        endpoint: &MediaElement,
        sdp_offer: &str,
    ) -> MediaResult<String> {
        let result = self
            .invoke(&endpoint.0, "processOffer", json!({ "offer": sdp_offer }))
            .await?;
        result["value"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| MediaError::Rejected("processOffer: missing answer".into()))
    }

    async fn gather_candidates(&self, endpoint: &MediaElement) -> MediaResult<()> {
        self.invoke(&endpoint.0, "gatherCandidates", json!({}))
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(
        &self,
        endpoint: &MediaElement,
        candidate: &IceCandidateInfo,
    ) -> MediaResult<()> {
        let payload = serde_json::to_value(candidate)
            .map_err(|e| MediaError::Rejected(format!("candidate serialization: {e}")))?;
        self.invoke(&endpoint.0, "addIceCandidate", json!({ "candidate": payload }))
            .await?;
        Ok(())
    }

    async fn subscribe_candidates(
        &self,
        endpoint: &MediaElement,
    ) -> MediaResult<mpsc::Receiver<IceCandidateInfo>> {
        let (tx, rx) = mpsc::channel(16);
        self.shared
            .candidate_subs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(endpoint.0.clone(), tx);
        self.request(
            "subscribe",
            json!({ "object": endpoint.0, "type": "IceCandidateFound" }),
        )
        .await?;
        Ok(rx)
    }

    async fn connect(&self, source: &MediaElement, sink: &MediaElement) -> MediaResult<()> {
        self.invoke(&source.0, "connect", json!({ "sink": sink.0 }))
            .await?;
        Ok(())
    }

    async fn create_filter(
        &self,
        pipeline: &PipelineHandle,
        params: &FilterParams,
    ) -> MediaResult<MediaElement> {
        let id = self
            .create("FaceOverlayFilter", json!({ "mediaPipeline": pipeline.0 }))
            .await?;
        self.invoke(
            &id,
            "setOverlayedImage",
            json!({
                "uri": params.image_uri,
                "offsetXPercent": params.offset_x,
                "offsetYPercent": params.offset_y,
                "widthPercent": params.width,
                "heightPercent": params.height,
            }),
        )
        .await
        .map_err(|e| MediaError::Filter(e.to_string()))?;
        Ok(MediaElement(id))
    }

    async fn release_element(&self, element: &MediaElement) -> MediaResult<()> {
        self.release(&element.0).await
    }

    async fn release_pipeline(&self, pipeline: &PipelineHandle) -> MediaResult<()> {
        self.release(&pipeline.0).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_candidate_extraction() {
        let frame = json!({
            "jsonrpc": "2.0",
            "method": "onEvent",
            "params": {
                "value": {
                    "type": "IceCandidateFound",
                    "object": "endpoint-42",
                    "data": {
                        "candidate": {
                            "candidate": "candidate:1 1 UDP 2013266431 10.0.0.5 40834 typ host",
                            "sdpMid": "audio0",
                            "sdpMLineIndex": 0
                        }
                    }
                }
            }
        });

        let (object, candidate) = event_candidate(&frame).expect("candidate event");
        assert_eq!(object, "endpoint-42");
        assert_eq!(candidate.sdp_mid, "audio0");
        assert_eq!(candidate.sdp_m_line_index, 0);
    }

    #[test]
    fn test_event_candidate_ignores_other_events() {
        let frame = json!({
            "method": "onEvent",
            "params": { "value": { "type": "MediaStateChanged", "object": "endpoint-1" } }
        });
        assert!(event_candidate(&frame).is_none());
    }
}
