//! Seams to the host application: the scene's entity manager, the settings
//! store and whoever wants to hear about finished transfers.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::fusion::MotionVector;
use crate::transfer::TransferKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity#{}", self.0)
    }
}

/// Owns the controllable entities in the scene.
pub trait EntityManager {
    /// Selects the entity called `name`, spawning it first if needed.
    fn select_or_spawn(&mut self, name: &str) -> Option<EntityId>;
    /// Removes the entity called `name`, returning its id if it existed.
    fn delete(&mut self, name: &str) -> Option<EntityId>;
    fn set_motion_vector(&mut self, entity: EntityId, vector: MotionVector);
    /// Flips the placement/detection mode owned by the host.
    fn toggle_detection_mode(&mut self);
}

pub trait Settings {
    fn username(&self) -> String;
    fn sensitivity(&self) -> f32;
    fn set_sensitivity(&mut self, value: f32);
    fn is_discrete_mode(&self) -> bool;
}

pub trait TransferListener: Send + Sync {
    fn on_sync_progress(&self, uploaded: usize, downloaded: usize);
    fn on_transfer_complete(&self, kind: TransferKind, success: bool, path: Option<&Path>);
}

/// Headless entity manager used by the CLI: tracks names and logs motion.
#[derive(Debug, Default)]
pub struct LoggingEntityManager {
    entities: HashMap<String, EntityId>,
    next_id: u64,
    detection_mode: bool,
}

impl LoggingEntityManager {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EntityManager for LoggingEntityManager {
    fn select_or_spawn(&mut self, name: &str) -> Option<EntityId> {
        if let Some(id) = self.entities.get(name) {
            info!(target: "pilot::entities", name, entity = %id, "selected");
            return Some(*id);
        }
        self.next_id += 1;
        let id = EntityId(self.next_id);
        self.entities.insert(name.to_string(), id);
        info!(target: "pilot::entities", name, entity = %id, "spawned");
        Some(id)
    }

    fn delete(&mut self, name: &str) -> Option<EntityId> {
        let removed = self.entities.remove(name);
        match removed {
            Some(id) => info!(target: "pilot::entities", name, entity = %id, "deleted"),
            None => warn!(target: "pilot::entities", name, "delete for unknown entity"),
        }
        removed
    }

    fn set_motion_vector(&mut self, entity: EntityId, vector: MotionVector) {
        if !vector.is_zero() {
            debug!(target: "pilot::entities", entity = %entity, ?vector, "motion");
        }
    }

    fn toggle_detection_mode(&mut self) {
        self.detection_mode = !self.detection_mode;
        info!(
            target: "pilot::entities",
            enabled = self.detection_mode,
            "detection mode toggled"
        );
    }
}

/// In-memory settings seeded from the CLI configuration.
#[derive(Debug, Clone)]
pub struct LocalSettings {
    username: String,
    sensitivity: f32,
    discrete: bool,
}

impl LocalSettings {
    pub fn new(username: &str, sensitivity: f32, discrete: bool) -> Self {
        Self {
            username: username.to_string(),
            sensitivity,
            discrete,
        }
    }
}

impl Settings for LocalSettings {
    fn username(&self) -> String {
        self.username.clone()
    }

    fn sensitivity(&self) -> f32 {
        self.sensitivity
    }

    fn set_sensitivity(&mut self, value: f32) {
        self.sensitivity = value;
    }

    fn is_discrete_mode(&self) -> bool {
        self.discrete
    }
}

#[derive(Debug, Default)]
pub struct LoggingTransferListener;

impl TransferListener for LoggingTransferListener {
    fn on_sync_progress(&self, uploaded: usize, downloaded: usize) {
        info!(target: "pilot::transfer", uploaded, downloaded, "sync progress");
    }

    fn on_transfer_complete(&self, kind: TransferKind, success: bool, path: Option<&Path>) {
        let path = path.map(|p| p.display().to_string()).unwrap_or_default();
        if success {
            info!(target: "pilot::transfer", ?kind, path = %path, "transfer complete");
        } else {
            warn!(target: "pilot::transfer", ?kind, path = %path, "transfer failed");
        }
    }
}
