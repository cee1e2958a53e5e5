//! Dispatches decoded inbound frames to the entity manager, the fusion
//! registry or the transfer coordinator. Nothing here is fatal: bad frames
//! are logged, counted and dropped.

use pilot_proto::{decode_inbound, EnvelopeError, EventType, InboundEvent, SettingAction, SettingCommand};
use tracing::{debug, info, warn};

use crate::collaborators::{EntityManager, Settings};
use crate::fusion::{FusionRegistry, MAX_SENSITIVITY, MIN_SENSITIVITY};
use crate::transfer::TransferCoordinator;

/// Sensitivity change applied by one `UP` or `DOWN` setting command.
pub const SENSITIVITY_STEP: f32 = 0.25;

/// Everything a routed event may touch, borrowed from the owner for one frame.
pub struct RouteContext<'a> {
    pub entities: &'a mut dyn EntityManager,
    pub settings: &'a mut dyn Settings,
    pub fusion: &'a mut FusionRegistry,
    pub transfers: &'a mut TransferCoordinator,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RouterStats {
    pub routed: u64,
    pub unknown: u64,
    pub malformed: u64,
    pub orphaned_errors: u64,
}

#[derive(Debug, Default)]
pub struct CommandRouter {
    stats: RouterStats,
}

impl CommandRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    /// Decodes and dispatches one text frame. The error is returned for the
    /// caller's diagnostics only; it has already been logged.
    pub fn route_frame(
        &mut self,
        text: &str,
        ctx: &mut RouteContext<'_>,
    ) -> Result<EventType, EnvelopeError> {
        match decode_inbound(text) {
            Ok(event) => {
                let event_type = event.event_type();
                self.route(event, ctx);
                Ok(event_type)
            }
            Err(err) => {
                match &err {
                    EnvelopeError::UnknownEventType(name) => {
                        self.stats.unknown += 1;
                        warn!(target: "pilot::router", event_type = %name, "unknown event type dropped");
                    }
                    _ => {
                        self.stats.malformed += 1;
                        warn!(target: "pilot::router", error = %err, "malformed frame dropped");
                    }
                }
                Err(err)
            }
        }
    }

    pub fn route(&mut self, event: InboundEvent, ctx: &mut RouteContext<'_>) {
        self.stats.routed += 1;
        debug!(target: "pilot::router", event_type = %event.event_type(), "routing");
        match event {
            InboundEvent::Select(target) => select(&target.name, ctx),
            InboundEvent::Delete(target) => delete(&target.name, ctx),
            InboundEvent::Move(sample) => {
                if !ctx.fusion.apply_move(sample) {
                    debug!(target: "pilot::router", "move sample with no armed entity");
                }
            }
            InboundEvent::Rotate(sample) => {
                if !ctx.fusion.apply_rotate(sample) {
                    debug!(target: "pilot::router", "rotate sample with no armed entity");
                }
            }
            InboundEvent::Set(command) => apply_setting(&command, ctx),
            InboundEvent::UploadGrant(url) => ctx.transfers.on_upload_grant(&url),
            InboundEvent::DeleteGrant(url) => ctx.transfers.on_delete_grant(&url),
            InboundEvent::SyncManifest(manifest) => ctx.transfers.on_sync_manifest(manifest),
            InboundEvent::TransferError(message) => self.transfer_error(message, ctx),
        }
    }

    // S3_ERROR names no operation; it goes to whichever one is still waiting
    // on the server.
    fn transfer_error(&mut self, message: Option<String>, ctx: &mut RouteContext<'_>) {
        match ctx.transfers.pending_request() {
            Some(kind) => {
                warn!(
                    target: "pilot::router",
                    %kind,
                    message = message.as_deref().unwrap_or(""),
                    "server reported a transfer error"
                );
                ctx.transfers.fail_pending(kind, message);
            }
            None => {
                self.stats.orphaned_errors += 1;
                warn!(
                    target: "pilot::router",
                    message = message.as_deref().unwrap_or(""),
                    "orphaned transfer error; nothing pending"
                );
            }
        }
    }
}

fn select(name: &str, ctx: &mut RouteContext<'_>) {
    let name = name.trim();
    if name.is_empty() {
        warn!(target: "pilot::router", "select without an entity name");
        return;
    }
    match ctx.entities.select_or_spawn(name) {
        Some(id) => {
            ctx.fusion.arm(id);
            info!(target: "pilot::router", name, entity = %id, "entity selected");
        }
        None => warn!(target: "pilot::router", name, "entity manager refused selection"),
    }
}

fn delete(name: &str, ctx: &mut RouteContext<'_>) {
    let name = name.trim();
    if name.is_empty() {
        warn!(target: "pilot::router", "delete without an entity name");
        return;
    }
    match ctx.entities.delete(name) {
        Some(id) => ctx.fusion.remove(id),
        None => debug!(target: "pilot::router", name, "delete for unknown entity"),
    }
}

fn apply_setting(command: &SettingCommand, ctx: &mut RouteContext<'_>) {
    let Some(action) = command.action() else {
        warn!(
            target: "pilot::router",
            command = %command.command,
            result = %command.result,
            "unknown setting dropped"
        );
        return;
    };
    let step = match action {
        SettingAction::SensitivityUp => SENSITIVITY_STEP,
        SettingAction::SensitivityDown => -SENSITIVITY_STEP,
        SettingAction::ToggleDetection => {
            ctx.entities.toggle_detection_mode();
            return;
        }
    };
    let current = ctx.settings.sensitivity();
    let next = (current + step).clamp(MIN_SENSITIVITY, MAX_SENSITIVITY);
    ctx.settings.set_sensitivity(next);
    ctx.fusion.set_sensitivity(next);
    info!(target: "pilot::router", from = current, to = next, "sensitivity changed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{EntityId, LocalSettings, TransferListener};
    use crate::fusion::{FusionConfig, InputMode};
    use crate::testing::{FakeChannel, FakeEntities, FakeStore, Recorder};
    use crate::transfer::{ObjectStore, ScreenshotLibrary, TransferConfig, TransferKind};
    use std::sync::Arc;

    struct World {
        _dir: tempfile::TempDir,
        entities: FakeEntities,
        settings: LocalSettings,
        fusion: FusionRegistry,
        transfers: TransferCoordinator,
        recorder: Arc<Recorder>,
        router: CommandRouter,
    }

    impl World {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let recorder = Arc::new(Recorder::default());
            let transfers = TransferCoordinator::new(
                TransferConfig::default(),
                Arc::new(FakeStore::ok()) as Arc<dyn ObjectStore>,
                ScreenshotLibrary::new(dir.path()),
                Arc::clone(&recorder) as Arc<dyn TransferListener>,
            );
            Self {
                _dir: dir,
                entities: FakeEntities::default(),
                settings: LocalSettings::new("alice", 1.0, false),
                fusion: FusionRegistry::new(FusionConfig::default(), InputMode::Streaming, 1.0),
                transfers,
                recorder,
                router: CommandRouter::new(),
            }
        }

        fn route(&mut self, text: &str) -> Result<EventType, EnvelopeError> {
            let mut ctx = RouteContext {
                entities: &mut self.entities,
                settings: &mut self.settings,
                fusion: &mut self.fusion,
                transfers: &mut self.transfers,
            };
            self.router.route_frame(text, &mut ctx)
        }
    }

    #[test]
    fn select_arms_and_move_reaches_fusion() {
        let mut world = World::new();
        assert_eq!(
            world.route(r#"{"eventType":"COMMAND_SELECT","data":{"name":"cube"}}"#),
            Ok(EventType::CommandSelect)
        );
        let id = world.entities.names["cube"];
        assert_eq!(world.fusion.armed(), Some(id));

        world
            .route(r#"{"eventType":"COMMAND_MOVE","data":[0.5,0.0,0.9]}"#)
            .unwrap();
        let target = world.fusion.get(id).unwrap().target();
        assert_eq!(target.horizontal, 0.5);
        assert!(target.forward);
    }

    #[test]
    fn delete_removes_entity_and_its_input() {
        let mut world = World::new();
        world
            .route(r#"{"eventType":"COMMAND_SELECT","data":{"name":"cube"}}"#)
            .unwrap();
        world
            .route(r#"{"eventType":"COMMAND_DELETE","data":{"name":"cube"}}"#)
            .unwrap();
        assert_eq!(world.entities.deleted, vec!["cube".to_string()]);
        assert_eq!(world.fusion.armed(), None);
        assert!(world.fusion.get(EntityId(1)).is_none());
    }

    #[test]
    fn sensitivity_steps_are_clamped() {
        let mut world = World::new();
        for _ in 0..20 {
            world
                .route(r#"{"eventType":"COMMAND_SET","data":{"command":"sensitivity","result":"UP"}}"#)
                .unwrap();
        }
        assert_eq!(world.settings.sensitivity(), MAX_SENSITIVITY);
        assert_eq!(world.fusion.sensitivity(), MAX_SENSITIVITY);

        world
            .route(r#"{"eventType":"COMMAND_SET","data":{"command":"sensitivity","result":"DOWN"}}"#)
            .unwrap();
        assert_eq!(world.settings.sensitivity(), 2.75);
    }

    #[test]
    fn odm_toggles_detection_mode() {
        let mut world = World::new();
        world
            .route(r#"{"eventType":"COMMAND_SET","data":{"command":"mode","result":"ODM"}}"#)
            .unwrap();
        assert_eq!(world.entities.detection_toggles, 1);

        world
            .route(r#"{"eventType":"COMMAND_SET","data":{"command":"mode","result":"??"}}"#)
            .unwrap();
        assert_eq!(world.entities.detection_toggles, 1);
    }

    #[test]
    fn bad_frames_are_counted_and_dropped() {
        let mut world = World::new();
        assert!(matches!(
            world.route(r#"{"eventType":"COMMAND_TELEPORT","data":null}"#),
            Err(EnvelopeError::UnknownEventType(_))
        ));
        assert!(world.route("{not json").is_err());
        assert!(world
            .route(r#"{"eventType":"COMMAND_MOVE","data":[1.0]}"#)
            .is_err());
        assert!(world
            .route(r#"{"eventType":"COMMAND_SELECT","data":{}}"#)
            .is_err());

        let stats = world.router.stats();
        assert_eq!(stats.unknown, 1);
        assert_eq!(stats.malformed, 3);
        assert_eq!(stats.routed, 0);
        assert!(world.entities.names.is_empty());
    }

    #[test]
    fn samples_without_armed_entity_are_ignored() {
        let mut world = World::new();
        world
            .route(r#"{"eventType":"COMMAND_ROTATE","data":[1.0,1.0,1.0]}"#)
            .unwrap();
        assert_eq!(world.router.stats().routed, 1);
        assert!(world.fusion.tick(0.1).is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn transfer_error_resolves_to_the_pending_upload() {
        let mut world = World::new();
        let channel = FakeChannel::connected();
        let capture = world
            .transfers
            .library()
            .save_capture("alice", 5, b"x")
            .await
            .unwrap();
        world.transfers.request_upload(&channel, capture).unwrap();

        world
            .route(r#"{"eventType":"S3_ERROR","data":"AccessDenied"}"#)
            .unwrap();
        assert!(!world.transfers.is_upload_pending());
        assert_eq!(
            world.recorder.completions(),
            vec![(
                TransferKind::Upload,
                false,
                Some(world.transfers.library().root().join("alice/5.jpg"))
            )]
        );

        world
            .route(r#"{"eventType":"S3_ERROR","data":null}"#)
            .unwrap();
        assert_eq!(world.router.stats().orphaned_errors, 1);
        assert_eq!(world.recorder.completions().len(), 1);
    }
}
