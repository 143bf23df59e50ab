#![forbid(unsafe_code)]

// Per-participant state: identity, outbound media, and one inbound endpoint
// per peer currently being viewed. Implements the negotiation relay.

use crate::error::{SignalError, SignalResult};
use crate::media::{IceCandidateInfo, MediaElement, MediaEngine, PipelineHandle};
use crate::session::ConnectionId;
use crate::signaling::protocol::ServerMessage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};

/// One connected participant's control-plane and media-resource state.
///
/// The inbound map is guarded by its own async mutex so negotiation for one
/// participant serializes without touching the room lock; invariantly its keys
/// are peers currently in the same room.
pub struct UserSession {
    name: String,
    room_name: String,
    connection: ConnectionId,
    sender: mpsc::Sender<Arc<String>>,
    engine: Arc<dyn MediaEngine>,
    pipeline: PipelineHandle,
    outbound: MediaElement,
    /// peer identity -> endpoint receiving that peer's stream
    inbound: TokioMutex<HashMap<String, MediaElement>>,
    released: AtomicBool,
}

impl UserSession {
    /// Allocates the participant's pipeline and outbound endpoint via the
    /// media engine and wires up candidate relaying for the outbound stream.
    /// Partially created resources are released on failure.
    pub(crate) async fn create(
        name: &str,
        room_name: &str,
        connection: ConnectionId,
        sender: mpsc::Sender<Arc<String>>,
        engine: Arc<dyn MediaEngine>,
    ) -> SignalResult<Arc<Self>> {
        let pipeline = engine.create_pipeline().await?;

        let outbound = match engine.create_outbound_endpoint(&pipeline).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                if let Err(release_err) = engine.release_pipeline(&pipeline).await {
                    warn!(
                        "Failed to release pipeline for {} after endpoint failure: {}",
                        name, release_err
                    );
                }
                return Err(e.into());
            }
        };

        let candidates = engine.subscribe_candidates(&outbound).await?;
        spawn_candidate_relay(sender.clone(), name.to_string(), candidates);

        Ok(Arc::new(Self {
            name: name.to_string(),
            room_name: room_name.to_string(),
            connection,
            sender,
            engine,
            pipeline,
            outbound,
            inbound: TokioMutex::new(HashMap::new()),
            released: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn room_name(&self) -> &str {
        &self.room_name
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn outbound(&self) -> &MediaElement {
        &self.outbound
    }

    pub fn pipeline(&self) -> &PipelineHandle {
        &self.pipeline
    }

    /// Serializes and queues an outbound message on this participant's
    /// connection. A full or closed channel is a per-recipient delivery
    /// failure, never a routing failure for anyone else.
    pub fn send(&self, message: &ServerMessage) -> SignalResult<()> {
        let json = serde_json::to_string(message)
            .map_err(|e| SignalError::Delivery(format!("serialize for {}: {e}", self.name)))?;
        match self.sender.try_send(Arc::new(json)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SignalError::Delivery(format!(
                "channel full for {}",
                self.name
            ))),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SignalError::Delivery(format!(
                "channel closed for {} (disconnected)",
                self.name
            ))),
        }
    }

    /// Negotiates reception of `sender`'s stream: reuses (or creates) the
    /// inbound endpoint, processes the offer, and delivers the answer
    /// addressed to `sender`. Repeated offers from the same sender reuse the
    /// existing endpoint.
    pub async fn receive_video_from(
        &self,
        sender: &UserSession,
        sdp_offer: &str,
    ) -> SignalResult<()> {
        info!(
            "PARTICIPANT {}: connecting with {} in room {}",
            self.name, sender.name, self.room_name
        );

        let endpoint = self.endpoint_receiving(sender).await?;

        let sdp_answer = self.engine.process_offer(&endpoint, sdp_offer).await?;
        self.send(&ServerMessage::ReceiveVideoAnswer {
            name: sender.name.clone(),
            sdp_answer,
        })?;
        self.engine.gather_candidates(&endpoint).await?;
        Ok(())
    }

    /// Resolves the endpoint on which this participant receives `sender`.
    /// A self-offer targets the participant's own outbound endpoint
    /// (loopback preview); anything else is an inbound endpoint wired to the
    /// sender's published stream.
    async fn endpoint_receiving(&self, sender: &UserSession) -> SignalResult<MediaElement> {
        if sender.name == self.name {
            debug!("PARTICIPANT {}: configuring loopback", self.name);
            return Ok(self.outbound.clone());
        }

        let mut inbound = self.inbound.lock().await;
        if let Some(existing) = inbound.get(&sender.name) {
            debug!(
                "PARTICIPANT {}: reusing inbound endpoint for {}",
                self.name, sender.name
            );
            return Ok(existing.clone());
        }

        debug!(
            "PARTICIPANT {}: creating inbound endpoint for {}",
            self.name, sender.name
        );
        let endpoint = self
            .engine
            .create_inbound_endpoint(&self.pipeline, &sender.name)
            .await?;

        // Wire candidate events and the sender's stream before exposing the
        // endpoint; release it if either step fails.
        let wired = async {
            let candidates = self.engine.subscribe_candidates(&endpoint).await?;
            spawn_candidate_relay(self.sender.clone(), sender.name.clone(), candidates);
            self.engine.connect(&sender.outbound, &endpoint).await
        }
        .await;

        if let Err(e) = wired {
            if let Err(release_err) = self.engine.release_element(&endpoint).await {
                warn!(
                    "Failed to release half-wired endpoint for {}: {}",
                    self.name, release_err
                );
            }
            return Err(e.into());
        }

        inbound.insert(sender.name.clone(), endpoint.clone());
        Ok(endpoint)
    }

    /// Routes a connectivity candidate to the endpoint associated with
    /// `peer`: the outbound endpoint for a self-candidate, the matching
    /// inbound endpoint otherwise. Candidates are best-effort; a missing
    /// endpoint or engine refusal is logged and dropped.
    pub async fn add_candidate(&self, candidate: &IceCandidateInfo, peer: &str) {
        let endpoint = if peer == self.name {
            Some(self.outbound.clone())
        } else {
            self.inbound.lock().await.get(peer).cloned()
        };

        match endpoint {
            Some(endpoint) => {
                if let Err(e) = self.engine.add_ice_candidate(&endpoint, candidate).await {
                    warn!(
                        "PARTICIPANT {}: engine refused candidate for {}: {}",
                        self.name, peer, e
                    );
                }
            }
            None => debug!(
                "PARTICIPANT {}: candidate for {} arrived before negotiation, dropping",
                self.name, peer
            ),
        }
    }

    /// Returns the inbound endpoint currently receiving `peer`, if any.
    pub async fn inbound_for(&self, peer: &str) -> Option<MediaElement> {
        self.inbound.lock().await.get(peer).cloned()
    }

    /// Drops and releases the inbound endpoint for a departed peer. No-op if
    /// this participant never negotiated with them.
    pub async fn cancel_video_from(&self, peer: &str) {
        let endpoint = self.inbound.lock().await.remove(peer);
        if let Some(endpoint) = endpoint {
            debug!(
                "PARTICIPANT {}: removing inbound endpoint for {}",
                self.name, peer
            );
            if let Err(e) = self.engine.release_element(&endpoint).await {
                warn!(
                    "PARTICIPANT {}: failed to release endpoint for {}: {}",
                    self.name, peer, e
                );
            }
        }
    }

    /// Releases all media resources exactly once. Safe to call from both the
    /// explicit leave path and the transport-close path.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("PARTICIPANT {}: releasing resources", self.name);

        let endpoints: Vec<(String, MediaElement)> =
            self.inbound.lock().await.drain().collect();
        for (peer, endpoint) in endpoints {
            if let Err(e) = self.engine.release_element(&endpoint).await {
                warn!(
                    "PARTICIPANT {}: could not release inbound endpoint for {}: {}",
                    self.name, peer, e
                );
            }
        }

        if let Err(e) = self.engine.release_pipeline(&self.pipeline).await {
            warn!(
                "PARTICIPANT {}: could not release pipeline: {}",
                self.name, e
            );
        }
    }
}

/// Forwards engine-generated candidates for one endpoint to the owning
/// participant, addressed to the peer whose stream the endpoint carries.
/// The task ends when the engine drops the subscription.
fn spawn_candidate_relay(
    sender: mpsc::Sender<Arc<String>>,
    peer: String,
    mut candidates: mpsc::Receiver<IceCandidateInfo>,
) {
    tokio::spawn(async move {
        while let Some(candidate) = candidates.recv().await {
            let message = ServerMessage::IceCandidate {
                candidate,
                name: peer.clone(),
            };
            let json = match serde_json::to_string(&message) {
                Ok(j) => Arc::new(j),
                Err(e) => {
                    warn!("Failed to serialize candidate for {}: {}", peer, e);
                    continue;
                }
            };
            match sender.try_send(json) {
                Ok(()) => {}
                // A full channel drops this candidate only; more may follow.
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Dropping candidate for {} (channel full)", peer);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
    });
}
