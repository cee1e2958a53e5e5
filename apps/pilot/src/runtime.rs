//! The owner loop. `Pilot` holds every component and is the only place
//! where session events, routed commands, transfer outcomes and fusion output
//! meet.

use pilot_proto::ScreenshotKey;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info, warn};

use crate::collaborators::{EntityManager, Settings, TransferListener};
use crate::config::PilotConfig;
use crate::epoch_millis;
use crate::fusion::{FusionRegistry, InputMode};
use crate::router::{CommandRouter, RouteContext, RouterStats};
use crate::session::{
    self, ControlChannel, Dialer, SessionConfig, SessionEvent, SessionHandle, SessionState,
};
use crate::transfer::{
    Capture, ObjectStore, ScreenshotLibrary, TransferCoordinator, TransferError, TransferKind,
    TransferOutcome,
};

pub struct Pilot {
    session_config: SessionConfig,
    dialer: Arc<dyn Dialer>,
    session: Option<SessionHandle>,
    events: Option<mpsc::Receiver<SessionEvent>>,
    router: CommandRouter,
    fusion: FusionRegistry,
    transfers: TransferCoordinator,
    entities: Box<dyn EntityManager>,
    settings: Box<dyn Settings>,
}

impl Pilot {
    pub fn new(
        config: &PilotConfig,
        dialer: Arc<dyn Dialer>,
        store: Arc<dyn ObjectStore>,
        listener: Arc<dyn TransferListener>,
        entities: Box<dyn EntityManager>,
        settings: Box<dyn Settings>,
    ) -> Self {
        let fusion = FusionRegistry::new(
            config.fusion,
            mode_for(settings.as_ref()),
            settings.sensitivity(),
        );
        let transfers = TransferCoordinator::new(
            config.transfer,
            store,
            ScreenshotLibrary::new(&config.data_dir),
            listener,
        );
        Self {
            session_config: config.session_config(),
            dialer,
            session: None,
            events: None,
            router: CommandRouter::new(),
            fusion,
            transfers,
            entities,
            settings,
        }
    }

    /// Opens a session unless one is already live. The outcome arrives as a
    /// session event on a later tick.
    pub fn connect(&mut self) {
        if let Some(existing) = &self.session {
            if !existing.state().is_terminal() {
                debug!(target: "pilot::session", "connect ignored; session already live");
                return;
            }
        }
        let (tx, rx) = mpsc::channel(self.session_config.event_queue.max(1));
        let handle = session::connect(&self.session_config, Arc::clone(&self.dialer), tx);
        self.session = Some(handle);
        self.events = Some(rx);
    }

    pub fn disconnect(&mut self) {
        if let Some(mut handle) = self.session.take() {
            handle.close();
        }
        self.events = None;
        self.transfers.on_session_lost();
    }

    pub fn session_state(&self) -> SessionState {
        self.session
            .as_ref()
            .map(|handle| handle.state())
            .unwrap_or(SessionState::Idle)
    }

    pub fn is_connected(&self) -> bool {
        self.session_state() == SessionState::Connected
    }

    pub fn transfers(&self) -> &TransferCoordinator {
        &self.transfers
    }

    pub fn fusion(&self) -> &FusionRegistry {
        &self.fusion
    }

    pub fn router_stats(&self) -> RouterStats {
        self.router.stats()
    }

    /// Advances the owner loop by one frame of `dt` seconds and returns the
    /// transfer outcomes that settled during it.
    pub fn tick(&mut self, dt: f32) -> Vec<TransferOutcome> {
        for event in self.take_session_events() {
            self.handle_session_event(event);
        }
        let outcomes = self.transfers.drain_outcomes();

        let mode = mode_for(self.settings.as_ref());
        if self.fusion.mode() != mode {
            self.fusion.set_mode(mode);
        }
        let sensitivity = self.settings.sensitivity();
        if self.fusion.sensitivity() != sensitivity {
            self.fusion.set_sensitivity(sensitivity);
        }
        for (entity, vector) in self.fusion.tick(dt) {
            self.entities.set_motion_vector(entity, vector);
        }
        outcomes
    }

    pub fn upload_capture(&mut self, capture: Capture) -> Result<(), TransferError> {
        let channel = live_channel(&self.session, TransferKind::Upload)?;
        self.transfers.request_upload(channel, capture)
    }

    /// Stores `bytes` as a capture stamped now and requests its upload.
    pub async fn save_and_upload(&mut self, bytes: &[u8]) -> Result<ScreenshotKey, TransferError> {
        live_channel(&self.session, TransferKind::Upload)?;
        let capture = self
            .transfers
            .library()
            .save_capture(&self.settings.username(), epoch_millis(), bytes)
            .await
            .map_err(|err| TransferError::Io(err.to_string()))?;
        let key = capture.key.clone();
        self.upload_capture(capture)?;
        Ok(key)
    }

    pub fn delete_capture(&mut self, captured_at: i64) -> Result<ScreenshotKey, TransferError> {
        let key = ScreenshotKey::new(&self.settings.username(), captured_at);
        let channel = live_channel(&self.session, TransferKind::Delete)?;
        self.transfers.request_delete(channel, key.clone())?;
        Ok(key)
    }

    pub fn sync(&mut self) -> Result<usize, TransferError> {
        let channel = live_channel(&self.session, TransferKind::SyncManifest)?;
        self.transfers.request_sync(channel)
    }

    fn take_session_events(&mut self) -> Vec<SessionEvent> {
        let Some(events) = self.events.as_mut() else {
            return Vec::new();
        };
        let mut drained = Vec::new();
        let mut finished = false;
        loop {
            match events.try_recv() {
                Ok(event) => drained.push(event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    finished = true;
                    break;
                }
            }
        }
        if finished {
            self.events = None;
            warn!(target: "pilot::session", "session event channel closed");
            self.transfers.on_session_lost();
        }
        drained
    }

    fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connected => {
                info!(target: "pilot::session", "control channel ready");
            }
            SessionEvent::Message(text) => {
                let mut ctx = RouteContext {
                    entities: self.entities.as_mut(),
                    settings: self.settings.as_mut(),
                    fusion: &mut self.fusion,
                    transfers: &mut self.transfers,
                };
                let _ = self.router.route_frame(&text, &mut ctx);
            }
            SessionEvent::Closed => {
                info!(target: "pilot::session", "control channel closed");
                self.transfers.on_session_lost();
            }
            SessionEvent::Error(message) => {
                warn!(target: "pilot::session", error = %message, "control channel failed");
                self.transfers.on_session_lost();
            }
        }
    }
}

fn mode_for(settings: &dyn Settings) -> InputMode {
    if settings.is_discrete_mode() {
        InputMode::Discrete
    } else {
        InputMode::Streaming
    }
}

fn live_channel(
    session: &Option<SessionHandle>,
    kind: TransferKind,
) -> Result<&dyn ControlChannel, TransferError> {
    match session {
        Some(handle) if handle.is_connected() => Ok(handle as &dyn ControlChannel),
        _ => Err(TransferError::NotConnected { kind }),
    }
}
