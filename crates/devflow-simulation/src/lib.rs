//! devflow-simulation: event sources for the devflow pipeline
//!
//! Simulated signals with activation patterns and noise, a wall clock paced
//! stream, and JSON-lines recording and replay of event logs.

pub mod generator;
pub mod patterns;
pub mod replay;
pub mod stream;

pub use generator::{GeneratorConfig, NoiseConfig, SignalGenerator};
pub use patterns::SignalPattern;
pub use replay::{EventRecorder, EventReplay};
pub use stream::{RealTimeStream, StreamCommand, StreamConfig, StreamStats};
