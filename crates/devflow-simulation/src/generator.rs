//! Simulated signal generator
//!
//! Produces Level events for one signal and segment at a fixed sampling
//! period. Each level is `offset + gain * activation + noise`, where the
//! activation comes from a [`SignalPattern`] and the noise from a seeded
//! Gaussian, so runs with the same seed are reproducible.

use crate::patterns::SignalPattern;
use devflow_core::{DeviceEvent, DeviceTime, DevflowError, DevflowResult, EventFactory, SegmentId, SignalId};
use devflow_engine::EventSink;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Noise added on top of the pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseConfig {
    /// Gaussian noise standard deviation (0.0 = no noise)
    pub gaussian_std: f64,
    /// Probability of a sensor artifact per sample
    pub artifact_prob: f64,
    /// Artifact amplitude
    pub artifact_amp: f64,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            gaussian_std: 0.1,
            artifact_prob: 0.0,
            artifact_amp: 2.0,
        }
    }
}

impl NoiseConfig {
    /// No noise at all
    pub fn none() -> Self {
        Self {
            gaussian_std: 0.0,
            artifact_prob: 0.0,
            artifact_amp: 0.0,
        }
    }
}

/// Configuration for a [`SignalGenerator`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub signal_id: SignalId,
    pub segment_id: SegmentId,
    /// Device time of the first sample; `None` uses the wall clock
    pub start: Option<DeviceTime>,
    /// Sampling period in seconds
    pub sampling_period: f64,
    pub pattern: SignalPattern,
    pub noise: NoiseConfig,
    pub offset: f64,
    pub gain: f64,
    /// Random seed for reproducibility
    pub seed: Option<u64>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            signal_id: SignalId::from_u128(1),
            segment_id: SegmentId(1),
            start: None,
            sampling_period: 300.0,
            pattern: SignalPattern::default(),
            noise: NoiseConfig::default(),
            offset: 4.0,
            gain: 8.0,
            seed: None,
        }
    }
}

impl GeneratorConfig {
    pub fn validate(&self) -> DevflowResult<()> {
        if !(self.sampling_period.is_finite() && self.sampling_period > 0.0) {
            return Err(DevflowError::Source {
                reason: format!("sampling period must be positive, got {}", self.sampling_period),
            });
        }
        if self.segment_id.is_reserved() {
            return Err(DevflowError::Source {
                reason: format!("segment {} is reserved", self.segment_id),
            });
        }
        if !(0.0..=1.0).contains(&self.noise.artifact_prob) {
            return Err(DevflowError::Source {
                reason: "artifact probability must be within [0, 1]".to_string(),
            });
        }
        Ok(())
    }
}

/// Seeded generator of Level events
pub struct SignalGenerator {
    config: GeneratorConfig,
    events: Arc<EventFactory>,
    rng: rand::rngs::StdRng,
    normal_dist: Normal<f64>,
    start: DeviceTime,
    sample_index: u64,
    activation_override: Option<f64>,
}

impl SignalGenerator {
    pub fn new(config: GeneratorConfig, events: Arc<EventFactory>) -> DevflowResult<Self> {
        config.validate()?;

        let rng = match config.seed {
            Some(seed) => rand::rngs::StdRng::seed_from_u64(seed),
            None => rand::rngs::StdRng::from_entropy(),
        };
        let normal_dist = Normal::new(0.0, config.noise.gaussian_std).map_err(|e| DevflowError::Source {
            reason: format!("failed to create normal distribution: {}", e),
        })?;
        let start = config.start.unwrap_or_else(DeviceTime::now);

        debug!(
            signal = %config.signal_id,
            segment = %config.segment_id,
            pattern = config.pattern.description(),
            "signal generator created"
        );
        Ok(Self {
            config,
            events,
            rng,
            normal_dist,
            start,
            sample_index: 0,
            activation_override: None,
        })
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    /// Number of levels generated so far
    pub fn generated(&self) -> u64 {
        self.sample_index
    }

    /// Device time of the next sample
    pub fn next_time(&self) -> DeviceTime {
        self.start + self.elapsed()
    }

    /// Replace the pattern with a fixed activation until cleared
    pub fn set_activation(&mut self, activation: Option<f64>) {
        self.activation_override = activation;
    }

    pub fn set_pattern(&mut self, pattern: SignalPattern) {
        self.config.pattern = pattern;
        self.activation_override = None;
    }

    /// Restart from the first sample
    pub fn reset(&mut self) {
        self.sample_index = 0;
    }

    pub fn segment_start(&self) -> DeviceEvent {
        let mut event = self.events.segment_start(self.config.segment_id);
        event.signal_id = self.config.signal_id;
        event.device_time = self.next_time();
        event
    }

    pub fn segment_stop(&self) -> DeviceEvent {
        let mut event = self.events.segment_stop(self.config.segment_id);
        event.signal_id = self.config.signal_id;
        event.device_time = self.next_time();
        event
    }

    /// Generate the next Level event
    pub fn next_level(&mut self) -> DeviceEvent {
        let seconds = self.elapsed().as_secs_f64();
        let activation = self
            .activation_override
            .unwrap_or_else(|| self.config.pattern.activation_at_time(seconds));
        let level = self.config.offset + self.config.gain * activation + self.noise();
        let event = self.events.level(
            self.config.signal_id,
            self.config.segment_id,
            self.next_time(),
            level,
        );
        self.sample_index += 1;
        event
    }

    /// Generate `count` consecutive Level events
    pub fn generate(&mut self, count: usize) -> Vec<DeviceEvent> {
        (0..count).map(|_| self.next_level()).collect()
    }

    /// Push a whole segment (start, `count` levels, stop) into `sink`
    pub fn emit_segment(&mut self, count: usize, sink: &dyn EventSink) -> DevflowResult<()> {
        sink.push(self.segment_start())?;
        for _ in 0..count {
            sink.push(self.next_level())?;
        }
        sink.push(self.segment_stop())
    }

    fn elapsed(&self) -> Duration {
        Duration::from_secs_f64(self.sample_index as f64 * self.config.sampling_period)
    }

    fn noise(&mut self) -> f64 {
        let mut noise = self.normal_dist.sample(&mut self.rng);
        if self.config.noise.artifact_prob > 0.0 && self.rng.gen::<f64>() < self.config.noise.artifact_prob {
            noise += self.config.noise.artifact_amp * self.rng.gen_range(-1.0..1.0);
        }
        noise
    }
}
