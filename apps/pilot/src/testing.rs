//! Fakes shared by unit tests across modules.

use async_trait::async_trait;
use bytes::Bytes;
use pilot_proto::OutboundEnvelope;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use url::Url;

use crate::collaborators::{EntityId, EntityManager, TransferListener};
use crate::fusion::MotionVector;
use crate::session::{ControlChannel, Dialer, SessionError, SessionState, WsStream};
use crate::transfer::{ObjectStore, StoreError, StoreResponse, TransferKind};

pub(crate) struct FakeStore {
    pub put: u16,
    pub get: u16,
    pub delete: u16,
    /// Requests to this URL never complete.
    pub hang_on: Option<String>,
    pub calls: Mutex<Vec<(&'static str, String)>>,
}

impl FakeStore {
    pub fn ok() -> Self {
        Self {
            put: 200,
            get: 200,
            delete: 204,
            hang_on: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(&'static str, String)> {
        self.calls.lock().unwrap().clone()
    }

    async fn respond(&self, method: &'static str, url: &str) -> Result<StoreResponse, StoreError> {
        self.calls.lock().unwrap().push((method, url.to_string()));
        if self.hang_on.as_deref() == Some(url) {
            std::future::pending::<()>().await;
        }
        let status = match method {
            "PUT" => self.put,
            "GET" => self.get,
            _ => self.delete,
        };
        Ok(StoreResponse::new(status, Bytes::from_static(b"remote")))
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn put(&self, url: &str, _body: Bytes) -> Result<StoreResponse, StoreError> {
        self.respond("PUT", url).await
    }

    async fn get(&self, url: &str) -> Result<StoreResponse, StoreError> {
        self.respond("GET", url).await
    }

    async fn delete(&self, url: &str) -> Result<StoreResponse, StoreError> {
        self.respond("DELETE", url).await
    }
}

pub(crate) struct FakeChannel {
    pub state: watch::Sender<SessionState>,
    pub sent: Mutex<Vec<OutboundEnvelope>>,
}

impl FakeChannel {
    pub fn connected() -> Self {
        let (state, _) = watch::channel(SessionState::Connected);
        Self {
            state,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn drop_connection(&self) {
        self.state.send_replace(SessionState::Closed);
    }

    pub fn sent(&self) -> Vec<OutboundEnvelope> {
        self.sent.lock().unwrap().clone()
    }
}

impl ControlChannel for FakeChannel {
    fn user_id(&self) -> &str {
        "alice"
    }

    fn session_id(&self) -> &str {
        "alice-1"
    }

    fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn send_envelope(&self, envelope: &OutboundEnvelope) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        self.sent.lock().unwrap().push(envelope.clone());
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct Recorder {
    pub completions: Mutex<Vec<(TransferKind, bool, Option<PathBuf>)>>,
    pub progress: Mutex<Vec<(usize, usize)>>,
}

impl Recorder {
    pub fn completions(&self) -> Vec<(TransferKind, bool, Option<PathBuf>)> {
        self.completions.lock().unwrap().clone()
    }
}

impl TransferListener for Recorder {
    fn on_sync_progress(&self, uploaded: usize, downloaded: usize) {
        self.progress.lock().unwrap().push((uploaded, downloaded));
    }

    fn on_transfer_complete(&self, kind: TransferKind, success: bool, path: Option<&Path>) {
        self.completions
            .lock()
            .unwrap()
            .push((kind, success, path.map(Path::to_path_buf)));
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeEntities {
    pub names: HashMap<String, EntityId>,
    pub next_id: u64,
    pub deleted: Vec<String>,
    pub motion: Vec<(EntityId, MotionVector)>,
    pub detection_toggles: u32,
}

impl EntityManager for FakeEntities {
    fn select_or_spawn(&mut self, name: &str) -> Option<EntityId> {
        if let Some(id) = self.names.get(name) {
            return Some(*id);
        }
        self.next_id += 1;
        let id = EntityId(self.next_id);
        self.names.insert(name.to_string(), id);
        Some(id)
    }

    fn delete(&mut self, name: &str) -> Option<EntityId> {
        let removed = self.names.remove(name);
        if removed.is_some() {
            self.deleted.push(name.to_string());
        }
        removed
    }

    fn set_motion_vector(&mut self, entity: EntityId, vector: MotionVector) {
        self.motion.push((entity, vector));
    }

    fn toggle_detection_mode(&mut self) {
        self.detection_toggles += 1;
    }
}

/// Dials plain `ws://` endpoints; for loopback servers in tests.
pub(crate) struct PlainDialer;

#[async_trait]
impl Dialer for PlainDialer {
    async fn dial(&self, endpoint: &Url) -> Result<WsStream, SessionError> {
        connect_async(endpoint.as_str())
            .await
            .map(|(stream, _)| stream)
            .map_err(|err| SessionError::Handshake(err.to_string()))
    }
}
