//! Pre-defined activation patterns for simulated signals
//!
//! A pattern maps elapsed time (seconds) to an activation in roughly
//! `[0, 1]`; the generator scales that into signal levels.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Predefined activation patterns
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "pattern", rename_all = "snake_case")]
pub enum SignalPattern {
    /// Constant activation level
    Constant { level: f64 },
    /// Periodic oscillation around a baseline
    Sinusoidal {
        frequency: f64,
        amplitude: f64,
        baseline: f64,
    },
    /// Linear change, then hold at the end level
    Ramp {
        start_level: f64,
        end_level: f64,
        duration: f64,
    },
    /// On/off cycles
    Burst {
        on_duration: f64,
        off_duration: f64,
        amplitude: f64,
    },
    /// Exponentially decaying amplitude
    Fatigue {
        initial_amplitude: f64,
        decay_rate: f64,
    },
    /// Base activation with a small tremor, clamped to `[0, 1]`
    Realistic {
        base_activation: f64,
        tremor_frequency: f64,
        tremor_amplitude: f64,
    },
}

impl SignalPattern {
    /// Activation at `time` seconds after the start of the signal
    pub fn activation_at_time(&self, time: f64) -> f64 {
        match self {
            SignalPattern::Constant { level } => *level,

            SignalPattern::Sinusoidal { frequency, amplitude, baseline } => {
                baseline + amplitude * (2.0 * PI * frequency * time).sin()
            }

            SignalPattern::Ramp { start_level, end_level, duration } => {
                if time >= *duration || *duration <= 0.0 {
                    *end_level
                } else {
                    start_level + (end_level - start_level) * (time / duration)
                }
            }

            SignalPattern::Burst { on_duration, off_duration, amplitude } => {
                let cycle = on_duration + off_duration;
                if cycle <= 0.0 {
                    return 0.0;
                }
                if time % cycle < *on_duration {
                    *amplitude
                } else {
                    0.0
                }
            }

            SignalPattern::Fatigue { initial_amplitude, decay_rate } => {
                initial_amplitude * (-decay_rate * time).exp()
            }

            SignalPattern::Realistic { base_activation, tremor_frequency, tremor_amplitude } => {
                let tremor = tremor_amplitude * (2.0 * PI * tremor_frequency * time).sin();
                (base_activation + tremor).clamp(0.0, 1.0)
            }
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            SignalPattern::Constant { .. } => "Constant activation",
            SignalPattern::Sinusoidal { .. } => "Sinusoidal oscillation",
            SignalPattern::Ramp { .. } => "Gradual ramp",
            SignalPattern::Burst { .. } => "Burst pattern",
            SignalPattern::Fatigue { .. } => "Decaying amplitude",
            SignalPattern::Realistic { .. } => "Realistic with tremor",
        }
    }

    /// Named presets, periods chosen for five minute sampling
    pub fn presets() -> Vec<(&'static str, SignalPattern)> {
        vec![
            ("Fasting", SignalPattern::Constant { level: 0.2 }),
            ("Elevated", SignalPattern::Constant { level: 0.6 }),
            ("Daily Cycle", SignalPattern::Sinusoidal {
                frequency: 1.0 / 86_400.0,
                amplitude: 0.2,
                baseline: 0.4,
            }),
            ("Meal Rise", SignalPattern::Ramp {
                start_level: 0.2,
                end_level: 0.7,
                duration: 3_600.0,
            }),
            ("Meals", SignalPattern::Burst {
                on_duration: 7_200.0,
                off_duration: 14_400.0,
                amplitude: 0.7,
            }),
            ("Clearance", SignalPattern::Fatigue {
                initial_amplitude: 0.9,
                decay_rate: 1.0 / 7_200.0,
            }),
            ("Noisy Sensor", SignalPattern::Realistic {
                base_activation: 0.4,
                tremor_frequency: 1.0 / 900.0,
                tremor_amplitude: 0.05,
            }),
        ]
    }

    /// Look up a preset by name, ignoring case
    pub fn preset(name: &str) -> Option<SignalPattern> {
        Self::presets()
            .into_iter()
            .find(|(preset, _)| preset.eq_ignore_ascii_case(name))
            .map(|(_, pattern)| pattern)
    }
}

impl Default for SignalPattern {
    fn default() -> Self {
        SignalPattern::Realistic {
            base_activation: 0.4,
            tremor_frequency: 1.0 / 900.0,
            tremor_amplitude: 0.05,
        }
    }
}
