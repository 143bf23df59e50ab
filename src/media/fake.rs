#![forbid(unsafe_code)]

// In-process media engine. Hands out sequential object ids and records every
// control operation so tests can assert on topology; also serves as the
// KMS_URL-unset fallback for local development without a media server.

use crate::media::{
    FilterParams, IceCandidateInfo, MediaElement, MediaEngine, MediaError, MediaResult,
    PipelineHandle,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Default)]
struct State {
    next_id: u64,
    /// element id -> owning pipeline id
    elements: HashMap<String, String>,
    connections: Vec<(String, String)>,
    released_pipelines: Vec<String>,
    released_elements: Vec<String>,
    candidate_subs: HashMap<String, mpsc::Sender<IceCandidateInfo>>,
    offers_processed: u64,
    candidates_added: u64,
}

/// Fake engine for tests and local development.
#[derive(Default)]
pub struct FakeMediaEngine {
    state: StdMutex<State>,
    fail_pipelines: AtomicBool,
    fail_connects: AtomicBool,
}

impl FakeMediaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(state: &mut State, prefix: &str) -> String {
        state.next_id += 1;
        format!("{}-{}", prefix, state.next_id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes subsequent `create_pipeline` calls fail (error-path tests).
    pub fn set_fail_pipelines(&self, fail: bool) {
        self.fail_pipelines.store(fail, Ordering::Relaxed);
    }

    /// Makes subsequent `connect` calls fail (error-path tests).
    pub fn set_fail_connects(&self, fail: bool) {
        self.fail_connects.store(fail, Ordering::Relaxed);
    }

    /// Pushes an engine-generated candidate to an endpoint's subscriber.
    /// Returns false if nothing is subscribed.
    pub fn emit_candidate(&self, endpoint: &MediaElement, candidate: IceCandidateInfo) -> bool {
        let tx = {
            let state = self.lock();
            state.candidate_subs.get(&endpoint.0).cloned()
        };
        match tx {
            Some(tx) => tx.try_send(candidate).is_ok(),
            None => false,
        }
    }

    pub fn element_count(&self) -> usize {
        self.lock().elements.len()
    }

    pub fn is_connected(&self, source: &MediaElement, sink: &MediaElement) -> bool {
        self.lock()
            .connections
            .iter()
            .any(|(s, k)| s == &source.0 && k == &sink.0)
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn pipeline_released(&self, pipeline: &PipelineHandle) -> bool {
        self.lock().released_pipelines.contains(&pipeline.0)
    }

    pub fn element_released(&self, element: &MediaElement) -> bool {
        self.lock().released_elements.contains(&element.0)
    }

    pub fn offers_processed(&self) -> u64 {
        self.lock().offers_processed
    }

    pub fn candidates_added(&self) -> u64 {
        self.lock().candidates_added
    }

    fn create_element(&self, pipeline: &PipelineHandle, prefix: &str) -> MediaElement {
        let mut state = self.lock();
        let id = Self::next_id(&mut state, prefix);
        state.elements.insert(id.clone(), pipeline.0.clone());
        MediaElement(id)
    }
}

#[async_trait]
impl MediaEngine for FakeMediaEngine {
    async fn create_pipeline(&self) -> MediaResult<PipelineHandle> {
        if self.fail_pipelines.load(Ordering::Relaxed) {
            return Err(MediaError::Pipeline("injected pipeline failure".into()));
        }
        let mut state = self.lock();
        let id = Self::next_id(&mut state, "pipeline");
        Ok(PipelineHandle(id))
    }

    async fn create_outbound_endpoint(
        &self,
        pipeline: &PipelineHandle,
    ) -> MediaResult<MediaElement> {
        Ok(self.create_element(pipeline, "endpoint"))
    }

    async fn create_inbound_endpoint(
        &self,
        pipeline: &PipelineHandle,
        peer: &str,
    ) -> MediaResult<MediaElement> {
        debug!("fake engine: inbound endpoint for peer {}", peer);
        Ok(self.create_element(pipeline, "endpoint"))
    }

    async fn process_offer(
        &self,
        endpoint: &MediaElement,
        sdp_offer: &str,
    ) -> MediaResult<String> {
        let mut state = self.lock();
        if !state.elements.contains_key(&endpoint.0) {
            return Err(MediaError::Endpoint(format!(
                "unknown endpoint {}",
                endpoint.0
            )));
        }
        state.offers_processed += 1;
        Ok(format!("sdp-answer:{sdp_offer}"))
    }

    async fn gather_candidates(&self, _endpoint: &MediaElement) -> MediaResult<()> {
        Ok(())
    }

    async fn add_ice_candidate(
        &self,
        endpoint: &MediaElement,
        _candidate: &IceCandidateInfo,
    ) -> MediaResult<()> {
        let mut state = self.lock();
        if !state.elements.contains_key(&endpoint.0) {
            return Err(MediaError::Endpoint(format!(
                "unknown endpoint {}",
                endpoint.0
            )));
        }
        state.candidates_added += 1;
        Ok(())
    }

    async fn subscribe_candidates(
        &self,
        endpoint: &MediaElement,
    ) -> MediaResult<mpsc::Receiver<IceCandidateInfo>> {
        let (tx, rx) = mpsc::channel(16);
        self.lock().candidate_subs.insert(endpoint.0.clone(), tx);
        Ok(rx)
    }

    async fn connect(&self, source: &MediaElement, sink: &MediaElement) -> MediaResult<()> {
        if self.fail_connects.load(Ordering::Relaxed) {
            return Err(MediaError::Endpoint("injected connect failure".into()));
        }
        let mut state = self.lock();
        if !state.elements.contains_key(&source.0) || !state.elements.contains_key(&sink.0) {
            return Err(MediaError::Endpoint("connect on unknown element".into()));
        }
        state.connections.push((source.0.clone(), sink.0.clone()));
        Ok(())
    }

    async fn create_filter(
        &self,
        pipeline: &PipelineHandle,
        _params: &FilterParams,
    ) -> MediaResult<MediaElement> {
        Ok(self.create_element(pipeline, "filter"))
    }

    async fn release_element(&self, element: &MediaElement) -> MediaResult<()> {
        let mut state = self.lock();
        state.elements.remove(&element.0);
        state.candidate_subs.remove(&element.0);
        state.released_elements.push(element.0.clone());
        Ok(())
    }

    async fn release_pipeline(&self, pipeline: &PipelineHandle) -> MediaResult<()> {
        let mut state = self.lock();
        // Releasing a pipeline cascades to its remaining elements.
        let orphaned: Vec<String> = state
            .elements
            .iter()
            .filter(|(_, p)| *p == &pipeline.0)
            .map(|(e, _)| e.clone())
            .collect();
        for element in orphaned {
            state.elements.remove(&element);
            state.candidate_subs.remove(&element);
            state.released_elements.push(element);
        }
        state.released_pipelines.push(pipeline.0.clone());
        Ok(())
    }
}
