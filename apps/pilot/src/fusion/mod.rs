//! Virtual input fusion: remote motion samples in, one bounded motion vector
//! per simulation tick out.

mod input;

pub use input::VirtualInput;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::collaborators::EntityId;

pub const MIN_SENSITIVITY: f32 = 0.0;
pub const MAX_SENSITIVITY: f32 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    /// Continuous stream of small samples, smoothed toward the latest value.
    #[default]
    Streaming,
    /// Sparse packets, each becoming a short impulse.
    Discrete,
}

/// Tuning for both fusion modes. Loaded from TOML; every field is optional.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub sensor_scale: f32,
    pub deadzone: f32,
    /// Exponential approach rate in streaming mode, per second.
    pub smoothing_speed: f32,
    /// Seconds without a sample before streaming targets drop to zero.
    pub streaming_timeout: f32,
    pub max_streaming_speed: f32,
    pub latch_threshold: f32,
    pub discrete_packet_scale: f32,
    pub max_discrete_distance: f32,
    pub impulse_duration: f32,
    pub decay_speed: f32,
    pub rest_epsilon: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            sensor_scale: 1.0,
            deadzone: 0.05,
            smoothing_speed: 10.0,
            streaming_timeout: 0.2,
            max_streaming_speed: 3.0,
            latch_threshold: 0.5,
            discrete_packet_scale: 1.0,
            max_discrete_distance: 1.0,
            impulse_duration: 0.25,
            decay_speed: 8.0,
            rest_epsilon: 1e-3,
        }
    }
}

impl FusionConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Returns the name of the first field that is out of range.
    pub fn validate(&self) -> Result<(), &'static str> {
        let positive = [
            ("smoothing_speed", self.smoothing_speed),
            ("streaming_timeout", self.streaming_timeout),
            ("max_streaming_speed", self.max_streaming_speed),
            ("max_discrete_distance", self.max_discrete_distance),
            ("impulse_duration", self.impulse_duration),
            ("decay_speed", self.decay_speed),
            ("rest_epsilon", self.rest_epsilon),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(name);
            }
        }
        let non_negative = [
            ("sensor_scale", self.sensor_scale),
            ("deadzone", self.deadzone),
            ("latch_threshold", self.latch_threshold),
            ("discrete_packet_scale", self.discrete_packet_scale),
        ];
        for (name, value) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                return Err(name);
            }
        }
        Ok(())
    }
}

/// Motion handed to the entity manager each tick.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MotionVector {
    pub horizontal: f32,
    pub vertical: f32,
    pub pitch: f32,
    pub yaw: f32,
    pub roll: f32,
    pub forward: bool,
    pub backward: bool,
}

impl MotionVector {
    pub const ZERO: Self = Self {
        horizontal: 0.0,
        vertical: 0.0,
        pitch: 0.0,
        yaw: 0.0,
        roll: 0.0,
        forward: false,
        backward: false,
    };

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn planar_magnitude(&self) -> f32 {
        (self.horizontal * self.horizontal + self.vertical * self.vertical).sqrt()
    }
}

/// Owns one [`VirtualInput`] per entity and tracks which entity, if any, is
/// currently driven by the remote.
#[derive(Debug)]
pub struct FusionRegistry {
    config: FusionConfig,
    mode: InputMode,
    sensitivity: f32,
    inputs: HashMap<EntityId, VirtualInput>,
    armed: Option<EntityId>,
    // Entities that lost remote control and still need a final zero vector.
    stopping: Vec<EntityId>,
}

impl FusionRegistry {
    pub fn new(config: FusionConfig, mode: InputMode, sensitivity: f32) -> Self {
        let sensitivity = if sensitivity.is_finite() {
            sensitivity.clamp(MIN_SENSITIVITY, MAX_SENSITIVITY)
        } else {
            1.0
        };
        Self {
            config,
            mode,
            sensitivity,
            inputs: HashMap::new(),
            armed: None,
            stopping: Vec::new(),
        }
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn sensitivity(&self) -> f32 {
        self.sensitivity
    }

    pub fn armed(&self) -> Option<EntityId> {
        self.armed
    }

    pub fn get(&self, entity: EntityId) -> Option<&VirtualInput> {
        self.inputs.get(&entity)
    }

    pub fn spawn(&mut self, entity: EntityId) {
        self.inputs
            .entry(entity)
            .or_insert_with(|| VirtualInput::new(self.config, self.mode, self.sensitivity));
    }

    pub fn remove(&mut self, entity: EntityId) {
        if self.armed == Some(entity) {
            self.armed = None;
        }
        self.stopping.retain(|id| *id != entity);
        if self.inputs.remove(&entity).is_some() {
            debug!(target: "pilot::fusion", entity = %entity, "input removed");
        }
    }

    /// Hands remote control to `entity`, releasing whichever entity had it.
    pub fn arm(&mut self, entity: EntityId) {
        if self.armed == Some(entity) {
            return;
        }
        self.disarm();
        self.spawn(entity);
        if let Some(input) = self.inputs.get_mut(&entity) {
            input.set_remote_controlled(true);
        }
        self.stopping.retain(|id| *id != entity);
        self.armed = Some(entity);
        info!(target: "pilot::fusion", entity = %entity, mode = ?self.mode, "remote control armed");
    }

    pub fn disarm(&mut self) {
        let Some(previous) = self.armed.take() else {
            return;
        };
        if let Some(input) = self.inputs.get_mut(&previous) {
            input.set_remote_controlled(false);
            self.stopping.push(previous);
        }
        info!(target: "pilot::fusion", entity = %previous, "remote control released");
    }

    /// Switches every input to `mode`, resetting their state.
    pub fn set_mode(&mut self, mode: InputMode) {
        if self.mode == mode {
            return;
        }
        self.mode = mode;
        for input in self.inputs.values_mut() {
            input.set_mode(mode);
        }
        info!(target: "pilot::fusion", ?mode, "input mode changed");
    }

    /// Applies the clamped sensitivity to every input and returns it.
    pub fn set_sensitivity(&mut self, value: f32) -> f32 {
        if value.is_finite() {
            self.sensitivity = value.clamp(MIN_SENSITIVITY, MAX_SENSITIVITY);
        }
        for input in self.inputs.values_mut() {
            input.set_sensitivity(self.sensitivity);
        }
        self.sensitivity
    }

    /// Returns `false` when no entity is armed and the sample was dropped.
    pub fn apply_move(&mut self, sample: [f32; 3]) -> bool {
        match self.armed_input() {
            Some(input) => {
                input.apply_move(sample);
                true
            }
            None => false,
        }
    }

    pub fn apply_rotate(&mut self, sample: [f32; 3]) -> bool {
        match self.armed_input() {
            Some(input) => {
                input.apply_rotate(sample);
                true
            }
            None => false,
        }
    }

    /// Advances the armed input and returns the vectors to hand to the entity
    /// manager, including a single zero vector for each entity just released.
    pub fn tick(&mut self, dt: f32) -> Vec<(EntityId, MotionVector)> {
        let mut out: Vec<(EntityId, MotionVector)> = self
            .stopping
            .drain(..)
            .map(|id| (id, MotionVector::ZERO))
            .collect();
        if let Some(id) = self.armed {
            if let Some(input) = self.inputs.get_mut(&id) {
                out.push((id, input.tick(dt)));
            }
        }
        out
    }

    fn armed_input(&mut self) -> Option<&mut VirtualInput> {
        let id = self.armed?;
        self.inputs.get_mut(&id)
    }
}
