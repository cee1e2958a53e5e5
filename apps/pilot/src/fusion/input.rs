use tracing::debug;

use super::{FusionConfig, InputMode, MotionVector, MAX_SENSITIVITY, MIN_SENSITIVITY};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct Channels {
    planar: [f32; 2],
    rotary: [f32; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct Streaming {
    current: Channels,
    target: Channels,
    /// Seconds since the last sample; `None` until one arrives.
    since_packet: Option<f32>,
    released: bool,
    forward: bool,
    backward: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct Pulse {
    impulse: [f32; 3],
    current: [f32; 3],
    timer: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct Discrete {
    planar: Pulse,
    rotary: Pulse,
    forward: bool,
    backward: bool,
}

/// Per-entity state machine turning sporadic remote samples into a bounded
/// motion signal that is sampled once per simulation tick.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualInput {
    config: FusionConfig,
    mode: InputMode,
    sensitivity: f32,
    remote_controlled: bool,
    streaming: Streaming,
    discrete: Discrete,
}

impl VirtualInput {
    pub fn new(config: FusionConfig, mode: InputMode, sensitivity: f32) -> Self {
        Self {
            config,
            mode,
            sensitivity: clamp_sensitivity(sensitivity, 1.0),
            remote_controlled: false,
            streaming: Streaming::default(),
            discrete: Discrete::default(),
        }
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn sensitivity(&self) -> f32 {
        self.sensitivity
    }

    pub fn is_remote_controlled(&self) -> bool {
        self.remote_controlled
    }

    /// Per-axis clamp applied to streaming targets.
    pub fn axis_bound(&self) -> f32 {
        self.sensitivity.max(1.0)
    }

    pub fn set_sensitivity(&mut self, value: f32) {
        self.sensitivity = clamp_sensitivity(value, self.sensitivity);
    }

    pub fn set_mode(&mut self, mode: InputMode) {
        self.mode = mode;
        self.reset();
    }

    pub fn set_remote_controlled(&mut self, enabled: bool) {
        self.remote_controlled = enabled;
        self.reset();
    }

    /// Clears targets, impulses, timers and latches. Mode, sensitivity and the
    /// remote-control flag survive.
    pub fn reset(&mut self) {
        self.streaming = Streaming::default();
        self.discrete = Discrete::default();
    }

    /// Current streaming target, as a motion vector.
    pub fn target(&self) -> MotionVector {
        let s = &self.streaming;
        compose(s.target.planar, s.target.rotary, s.forward, s.backward)
    }

    /// Magnitudes of the pending discrete impulses: (planar, rotary).
    pub fn impulse_magnitudes(&self) -> (f32, f32) {
        (
            norm(&self.discrete.planar.impulse),
            norm(&self.discrete.rotary.impulse),
        )
    }

    /// Translation sample `[x, y, z]`; `z` drives the forward/backward latches.
    pub fn apply_move(&mut self, sample: [f32; 3]) {
        if !self.remote_controlled {
            return;
        }
        match self.mode {
            InputMode::Streaming => {
                let [x, y, z] = sample.map(|v| self.shape_streaming(v));
                let s = &mut self.streaming;
                s.target.planar = [x, y];
                s.forward = z > self.config.latch_threshold;
                s.backward = z < -self.config.latch_threshold;
                s.since_packet = Some(0.0);
                s.released = false;
            }
            InputMode::Discrete => {
                let [x, y, z] = sample.map(|v| self.shape_discrete(v));
                let capped = cap_magnitude([x, y, 0.0], self.config.max_discrete_distance);
                let d = &mut self.discrete;
                d.planar.impulse = capped;
                d.planar.timer = self.config.impulse_duration;
                d.forward = z > self.config.latch_threshold;
                d.backward = z < -self.config.latch_threshold;
            }
        }
    }

    /// Rotation sample `[pitch, yaw, roll]`.
    pub fn apply_rotate(&mut self, sample: [f32; 3]) {
        if !self.remote_controlled {
            return;
        }
        match self.mode {
            InputMode::Streaming => {
                let shaped = sample.map(|v| self.shape_streaming(v));
                let s = &mut self.streaming;
                s.target.rotary = shaped;
                s.since_packet = Some(0.0);
                s.released = false;
            }
            InputMode::Discrete => {
                let shaped = sample.map(|v| self.shape_discrete(v));
                let d = &mut self.discrete;
                d.rotary.impulse = cap_magnitude(shaped, self.config.max_discrete_distance);
                d.rotary.timer = self.config.impulse_duration;
            }
        }
    }

    /// Advances the state by `dt` seconds and returns the motion for this tick.
    pub fn tick(&mut self, dt: f32) -> MotionVector {
        if !self.remote_controlled {
            return MotionVector::ZERO;
        }
        let dt = if dt.is_finite() { dt.max(0.0) } else { 0.0 };
        match self.mode {
            InputMode::Streaming => self.tick_streaming(dt),
            InputMode::Discrete => self.tick_discrete(dt),
        }
    }

    fn tick_streaming(&mut self, dt: f32) -> MotionVector {
        let timeout = self.config.streaming_timeout;
        let bound = self.axis_bound();
        let smoothing = self.config.smoothing_speed;
        let epsilon = self.config.rest_epsilon;
        let s = &mut self.streaming;

        if let Some(age) = s.since_packet.as_mut() {
            *age += dt;
            if *age >= timeout && !s.released {
                s.target = Channels::default();
                s.forward = false;
                s.backward = false;
                s.released = true;
                debug!(target: "pilot::fusion", age = *age, "stream went quiet; releasing");
            }
        }

        let alpha = (smoothing * dt).clamp(0.0, 1.0);
        // After a release every axis moves at least `bound * smoothing` per
        // second, so a full-scale value reaches rest within 1/smoothing s.
        let floor = if s.released { bound * smoothing * dt } else { 0.0 };
        for (current, target) in s.current.planar.iter_mut().zip(s.target.planar) {
            *current = approach(*current, target, alpha, floor, epsilon);
        }
        for (current, target) in s.current.rotary.iter_mut().zip(s.target.rotary) {
            *current = approach(*current, target, alpha, floor, epsilon);
        }

        let [x, y] = s.current.planar;
        let magnitude = (x * x + y * y).sqrt();
        let max_speed = self.config.max_streaming_speed;
        if magnitude > max_speed && magnitude > 0.0 {
            let scale = max_speed / magnitude;
            s.current.planar = [x * scale, y * scale];
        }

        compose(s.current.planar, s.current.rotary, s.forward, s.backward)
    }

    fn tick_discrete(&mut self, dt: f32) -> MotionVector {
        let duration = self.config.impulse_duration;
        let decay = (self.config.decay_speed * dt).clamp(0.0, 1.0);
        let epsilon = self.config.rest_epsilon;
        let d = &mut self.discrete;

        for pulse in [&mut d.planar, &mut d.rotary] {
            if pulse.timer > 0.0 {
                let fraction = if duration > 0.0 {
                    (pulse.timer / duration).clamp(0.0, 1.0)
                } else {
                    0.0
                };
                pulse.current = pulse.impulse.map(|v| v * fraction);
                pulse.timer -= dt;
                if pulse.timer <= 0.0 {
                    pulse.timer = 0.0;
                    pulse.impulse = [0.0; 3];
                }
            } else {
                pulse.current = pulse.current.map(|v| {
                    let next = v - v * decay;
                    if next.abs() < epsilon {
                        0.0
                    } else {
                        next
                    }
                });
            }
        }

        let at_rest = d.planar.timer <= 0.0
            && d.planar.current[0].abs() < epsilon
            && d.planar.current[1].abs() < epsilon;
        if at_rest {
            d.forward = false;
            d.backward = false;
        }

        compose(
            [d.planar.current[0], d.planar.current[1]],
            d.rotary.current,
            d.forward,
            d.backward,
        )
    }

    fn shape_streaming(&self, raw: f32) -> f32 {
        let bound = self.axis_bound();
        let scaled = finite_or_zero(raw) * self.config.sensor_scale * self.sensitivity;
        apply_deadzone(scaled, self.config.deadzone).clamp(-bound, bound)
    }

    // Sensitivity is deliberately ignored here so discrete gestures move the
    // same distance at every sensitivity setting.
    fn shape_discrete(&self, raw: f32) -> f32 {
        let scaled = finite_or_zero(raw) * self.config.discrete_packet_scale;
        apply_deadzone(scaled, self.config.deadzone)
    }
}

fn clamp_sensitivity(value: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value.clamp(MIN_SENSITIVITY, MAX_SENSITIVITY)
    } else {
        fallback
    }
}

fn finite_or_zero(value: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

fn apply_deadzone(value: f32, deadzone: f32) -> f32 {
    if value.abs() < deadzone {
        0.0
    } else {
        value
    }
}

fn approach(current: f32, target: f32, alpha: f32, floor: f32, epsilon: f32) -> f32 {
    let diff = target - current;
    if diff.abs() <= epsilon {
        return target;
    }
    let mut step = diff * alpha;
    if step.abs() < floor {
        step = floor.min(diff.abs()).copysign(diff);
    }
    let next = current + step;
    if (target - next).abs() <= epsilon {
        target
    } else {
        next
    }
}

fn norm(values: &[f32]) -> f32 {
    values.iter().map(|v| v * v).sum::<f32>().sqrt()
}

fn cap_magnitude(values: [f32; 3], max: f32) -> [f32; 3] {
    let magnitude = norm(&values);
    if magnitude <= max || magnitude == 0.0 {
        return values;
    }
    let scale = max / magnitude;
    values.map(|v| v * scale)
}

fn compose(planar: [f32; 2], rotary: [f32; 3], forward: bool, backward: bool) -> MotionVector {
    MotionVector {
        horizontal: planar[0],
        vertical: planar[1],
        pitch: rotary[0],
        yaw: rotary[1],
        roll: rotary[2],
        forward,
        backward,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DT: f32 = 1.0 / 60.0;

    fn armed(mode: InputMode, sensitivity: f32) -> VirtualInput {
        let mut input = VirtualInput::new(FusionConfig::default(), mode, sensitivity);
        input.set_remote_controlled(true);
        input
    }

    #[test]
    fn reset_twice_yields_identical_zero_state() {
        let mut input = armed(InputMode::Streaming, 1.0);
        input.apply_move([0.8, -0.4, 0.9]);
        input.apply_rotate([0.2, 0.3, 0.4]);
        input.tick(DT);

        input.reset();
        let first = input.clone();
        input.reset();
        assert_eq!(first, input);
        assert_eq!(input.target(), MotionVector::ZERO);
        assert_eq!(input.tick(0.0), MotionVector::ZERO);
    }

    #[test]
    fn ignores_samples_until_remote_controlled() {
        let mut input = VirtualInput::new(FusionConfig::default(), InputMode::Streaming, 1.0);
        input.apply_move([1.0, 1.0, 1.0]);
        assert_eq!(input.target(), MotionVector::ZERO);
        assert_eq!(input.tick(DT), MotionVector::ZERO);
    }

    #[test]
    fn streaming_applies_deadzone_and_latches() {
        let mut input = armed(InputMode::Streaming, 1.0);
        input.apply_move([0.01, -0.5, 0.9]);
        let target = input.target();
        assert_eq!(target.horizontal, 0.0);
        assert_eq!(target.vertical, -0.5);
        assert!(target.forward);
        assert!(!target.backward);

        input.apply_move([0.0, 0.0, -0.9]);
        let target = input.target();
        assert!(!target.forward);
        assert!(target.backward);
    }

    #[test]
    fn sensitivity_three_widens_the_clamp_bound() {
        let mut input = armed(InputMode::Streaming, 1.0);
        input.set_sensitivity(3.0);
        input.apply_move([1.0, 0.0, 0.0]);
        assert_eq!(input.axis_bound(), 3.0);
        assert_eq!(input.target().horizontal, 3.0);

        input.set_sensitivity(0.5);
        input.apply_move([5.0, 0.0, 0.0]);
        assert_eq!(input.target().horizontal, 1.0);
    }

    #[test]
    fn sensitivity_is_clamped_to_range() {
        let mut input = armed(InputMode::Streaming, 1.0);
        input.set_sensitivity(7.0);
        assert_eq!(input.sensitivity(), MAX_SENSITIVITY);
        input.set_sensitivity(-1.0);
        assert_eq!(input.sensitivity(), MIN_SENSITIVITY);
        input.set_sensitivity(f32::NAN);
        assert_eq!(input.sensitivity(), MIN_SENSITIVITY);
    }

    #[test]
    fn streaming_approaches_target_exponentially() {
        let mut input = armed(InputMode::Streaming, 1.0);
        input.apply_move([1.0, 0.0, 0.0]);
        let first = input.tick(DT).horizontal;
        let second = input.tick(DT).horizontal;
        assert!(first > 0.0 && first < 1.0);
        assert!(second > first && second < 1.0);
        // Each step covers the same fraction of the remaining distance.
        let ratio_one = (1.0 - first) / 1.0;
        let ratio_two = (1.0 - second) / (1.0 - first);
        assert!((ratio_one - ratio_two).abs() < 1e-4);
    }

    #[test]
    fn planar_speed_is_clamped_preserving_direction() {
        let mut config = FusionConfig::default();
        config.max_streaming_speed = 1.0;
        config.smoothing_speed = 1_000.0;
        let mut input = VirtualInput::new(config, InputMode::Streaming, 3.0);
        input.set_remote_controlled(true);
        input.apply_move([1.0, 1.0, 0.0]);
        let v = input.tick(DT);
        assert!((v.planar_magnitude() - 1.0).abs() < 1e-5);
        assert!((v.horizontal - v.vertical).abs() < 1e-6);
    }

    #[test]
    fn streaming_auto_release_converges_within_one_time_constant() {
        let config = FusionConfig::default();
        for dt in [1.0 / 30.0, 1.0 / 60.0, 1.0 / 120.0] {
            for sensitivity in [0.5, 1.0, 3.0] {
                let mut input = armed(InputMode::Streaming, sensitivity);
                for step in 0..20 {
                    let phase = step as f32 * 0.37;
                    input.apply_move([phase.sin(), phase.cos(), 1.0]);
                    input.apply_rotate([phase.cos(), -1.0, 0.5]);
                    input.tick(dt);
                }
                let deadline = config.streaming_timeout + 1.0 / config.smoothing_speed + dt;
                let mut quiet = 0.0f32;
                let mut last = MotionVector::ZERO;
                while quiet < deadline {
                    last = input.tick(dt);
                    quiet += dt;
                }
                assert_eq!(last, MotionVector::ZERO, "dt={dt} sensitivity={sensitivity}");
            }
        }
    }

    #[test]
    fn streaming_holds_value_while_packets_keep_arriving() {
        let mut input = armed(InputMode::Streaming, 1.0);
        let mut last = MotionVector::ZERO;
        for _ in 0..60 {
            input.apply_move([0.6, 0.0, 0.0]);
            last = input.tick(DT);
        }
        assert!((last.horizontal - 0.6).abs() < 1e-3);
    }

    #[test]
    fn discrete_impulse_never_exceeds_max_distance() {
        let config = FusionConfig::default();
        let mut input = armed(InputMode::Discrete, 3.0);
        let values = [-1_000.0, -3.0, -1.0, -0.2, 0.0, 0.3, 0.99, 2.5, 1e6];
        for &x in &values {
            for &y in &values {
                for &z in &values {
                    input.apply_move([x, y, z]);
                    input.apply_rotate([x, y, z]);
                    let (planar, rotary) = input.impulse_magnitudes();
                    let limit = config.max_discrete_distance * (1.0 + 1e-5);
                    assert!(planar <= limit, "planar {planar} for {x},{y},{z}");
                    assert!(rotary <= limit, "rotary {rotary} for {x},{y},{z}");
                }
            }
        }
    }

    #[test]
    fn discrete_ignores_sensitivity() {
        let mut low = armed(InputMode::Discrete, 0.5);
        let mut high = armed(InputMode::Discrete, 3.0);
        low.apply_move([0.4, 0.2, 0.0]);
        high.apply_move([0.4, 0.2, 0.0]);
        assert_eq!(low.tick(DT), high.tick(DT));
    }

    #[test]
    fn discrete_impulse_decays_then_latches_clear() {
        let config = FusionConfig::default();
        let mut input = armed(InputMode::Discrete, 1.0);
        input.apply_move([0.6, 0.0, 0.9]);

        let first = input.tick(DT);
        assert!((first.horizontal - 0.6).abs() < 1e-6);
        assert!(first.forward);

        let second = input.tick(DT);
        assert!(second.horizontal < first.horizontal);

        let mut elapsed = 2.0 * DT;
        let mut last = second;
        while elapsed < config.impulse_duration + 2.0 {
            last = input.tick(DT);
            elapsed += DT;
        }
        assert_eq!(last, MotionVector::ZERO);
    }

    #[test]
    fn mode_switch_resets_state() {
        let mut input = armed(InputMode::Streaming, 1.0);
        input.apply_move([1.0, 1.0, 1.0]);
        input.tick(DT);
        input.set_mode(InputMode::Discrete);
        assert_eq!(input.mode(), InputMode::Discrete);
        assert_eq!(input.target(), MotionVector::ZERO);
        assert_eq!(input.impulse_magnitudes(), (0.0, 0.0));
        assert_eq!(input.tick(DT), MotionVector::ZERO);
    }

    #[test]
    fn releasing_remote_control_clears_everything() {
        let mut input = armed(InputMode::Discrete, 1.0);
        input.apply_move([1.0, 0.0, 1.0]);
        input.set_remote_controlled(false);
        input.set_remote_controlled(true);
        assert_eq!(input.impulse_magnitudes(), (0.0, 0.0));
        assert_eq!(input.tick(DT), MotionVector::ZERO);
    }
}
