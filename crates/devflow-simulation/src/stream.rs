//! Real-time event stream
//!
//! Paces a [`SignalGenerator`] against the wall clock and pushes its events
//! into any [`EventSink`], usually a running filter chain. Pushing can block
//! on a full stage queue, so every batch is handed to the blocking pool.

use crate::generator::{GeneratorConfig, SignalGenerator};
use crate::patterns::SignalPattern;
use devflow_core::{DeviceEvent, DevflowError, DevflowResult, EventFactory};
use devflow_engine::EventSink;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Configuration for real-time streaming
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub generator: GeneratorConfig,
    /// Wall clock ticks per second
    pub update_rate: f64,
    /// Levels generated per tick
    pub samples_per_tick: usize,
    /// Wrap every start/stop in segment start and stop events
    pub frame_segments: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            generator: GeneratorConfig::default(),
            update_rate: 10.0,
            samples_per_tick: 1,
            frame_segments: true,
        }
    }
}

/// Commands for controlling the stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamCommand {
    Start,
    /// Stop and rewind the generator
    Stop,
    Pause,
    Resume,
    SetPattern(SignalPattern),
    /// Fixed activation, or `None` to go back to the pattern
    SetActivation(Option<f64>),
    /// Leave [`RealTimeStream::run`]
    Shutdown,
}

/// Stream statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamStats {
    pub is_running: bool,
    pub ticks: u64,
    pub events_sent: u64,
    pub failures: u64,
}

/// Wall clock paced event source
pub struct RealTimeStream {
    config: StreamConfig,
    generator: SignalGenerator,
    target: Arc<dyn EventSink>,
    control_receiver: mpsc::Receiver<StreamCommand>,
    control_sender: mpsc::Sender<StreamCommand>,
    stats_sender: watch::Sender<StreamStats>,
    segment_open: bool,
}

impl RealTimeStream {
    pub fn new(
        config: StreamConfig,
        events: Arc<EventFactory>,
        target: Arc<dyn EventSink>,
    ) -> DevflowResult<Self> {
        if !(config.update_rate.is_finite() && config.update_rate > 0.0) {
            return Err(DevflowError::Source {
                reason: format!("update rate must be positive, got {}", config.update_rate),
            });
        }
        let generator = SignalGenerator::new(config.generator.clone(), events)?;
        let (control_sender, control_receiver) = mpsc::channel(32);
        let (stats_sender, _) = watch::channel(StreamStats::default());

        Ok(Self {
            config,
            generator,
            target,
            control_receiver,
            control_sender,
            stats_sender,
            segment_open: false,
        })
    }

    /// Sender for control commands
    pub fn control_handle(&self) -> mpsc::Sender<StreamCommand> {
        self.control_sender.clone()
    }

    /// Receiver of statistics updates
    pub fn subscribe_stats(&self) -> watch::Receiver<StreamStats> {
        self.stats_sender.subscribe()
    }

    /// Drive the stream until [`StreamCommand::Shutdown`]
    pub async fn run(&mut self) -> DevflowResult<StreamStats> {
        let mut ticker = interval(Duration::from_secs_f64(1.0 / self.config.update_rate));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stats = StreamStats::default();

        info!(
            update_rate = self.config.update_rate,
            samples_per_tick = self.config.samples_per_tick,
            "event stream ready"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !stats.is_running {
                        continue;
                    }
                    stats.ticks += 1;
                    let batch = self.generator.generate(self.config.samples_per_tick);
                    self.deliver(batch, &mut stats).await;
                }

                command = self.control_receiver.recv() => {
                    match command {
                        Some(StreamCommand::Start) => {
                            if !stats.is_running {
                                stats.is_running = true;
                                if self.config.frame_segments && !self.segment_open {
                                    self.segment_open = true;
                                    let start = self.generator.segment_start();
                                    self.deliver(vec![start], &mut stats).await;
                                }
                                info!("event stream started");
                            }
                        }
                        Some(StreamCommand::Stop) => {
                            self.close_segment(&mut stats).await;
                            stats.is_running = false;
                            self.generator.reset();
                            info!(events_sent = stats.events_sent, "event stream stopped");
                        }
                        Some(StreamCommand::Pause) => {
                            stats.is_running = false;
                            debug!("event stream paused");
                        }
                        Some(StreamCommand::Resume) => {
                            stats.is_running = true;
                            debug!("event stream resumed");
                        }
                        Some(StreamCommand::SetPattern(pattern)) => {
                            debug!(pattern = pattern.description(), "pattern changed");
                            self.generator.set_pattern(pattern);
                        }
                        Some(StreamCommand::SetActivation(activation)) => {
                            self.generator.set_activation(activation);
                        }
                        Some(StreamCommand::Shutdown) | None => {
                            self.close_segment(&mut stats).await;
                            stats.is_running = false;
                            self.stats_sender.send_replace(stats.clone());
                            return Ok(stats);
                        }
                    }
                }
            }
            self.stats_sender.send_replace(stats.clone());
        }
    }

    async fn close_segment(&mut self, stats: &mut StreamStats) {
        if self.segment_open {
            self.segment_open = false;
            let stop = self.generator.segment_stop();
            self.deliver(vec![stop], stats).await;
        }
    }

    /// Push a batch on the blocking pool; a failed push pauses the stream
    async fn deliver(&self, batch: Vec<DeviceEvent>, stats: &mut StreamStats) {
        let target = self.target.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut sent = 0u64;
            for event in batch {
                target.push(event)?;
                sent += 1;
            }
            Ok::<_, DevflowError>(sent)
        })
        .await;

        match result {
            Ok(Ok(sent)) => stats.events_sent += sent,
            Ok(Err(error)) => {
                stats.failures += 1;
                stats.is_running = false;
                warn!(%error, "event stream paused after a failed push");
            }
            Err(error) => {
                stats.failures += 1;
                stats.is_running = false;
                warn!(%error, "event stream push task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devflow_core::{DeviceTime, EventKind};
    use devflow_engine::CollectingSink;

    fn config() -> StreamConfig {
        StreamConfig {
            generator: GeneratorConfig {
                start: Some(DeviceTime::from_days(45_000.0)),
                seed: Some(3),
                ..GeneratorConfig::default()
            },
            update_rate: 200.0,
            samples_per_tick: 2,
            frame_segments: true,
        }
    }

    #[tokio::test]
    async fn test_stream_frames_segment() {
        let sink = Arc::new(CollectingSink::new());
        let mut stream = RealTimeStream::new(config(), Arc::new(EventFactory::new()), sink.clone()).unwrap();
        let control = stream.control_handle();
        let task = tokio::spawn(async move { stream.run().await });

        control.send(StreamCommand::Start).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        control.send(StreamCommand::Stop).await.unwrap();
        control.send(StreamCommand::Shutdown).await.unwrap();

        let stats = task.await.unwrap().unwrap();
        assert!(!stats.is_running);
        assert!(stats.ticks > 0);

        let kinds = sink.kinds();
        assert_eq!(kinds.first(), Some(&EventKind::TimeSegmentStart));
        assert_eq!(kinds.last(), Some(&EventKind::TimeSegmentStop));
        assert_eq!(sink.levels().len() as u64, stats.ticks * 2);
        assert_eq!(stats.events_sent, stats.ticks * 2 + 2);
    }

    #[tokio::test]
    async fn test_idle_stream_sends_nothing() {
        let sink = Arc::new(CollectingSink::new());
        let mut stream = RealTimeStream::new(config(), Arc::new(EventFactory::new()), sink.clone()).unwrap();
        let control = stream.control_handle();
        let task = tokio::spawn(async move { stream.run().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        control.send(StreamCommand::Shutdown).await.unwrap();
        let stats = task.await.unwrap().unwrap();

        assert_eq!(stats.events_sent, 0);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_zero_update_rate_rejected() {
        let config = StreamConfig {
            update_rate: 0.0,
            ..config()
        };
        let result = RealTimeStream::new(config, Arc::new(EventFactory::new()), Arc::new(CollectingSink::new()));
        assert!(matches!(result, Err(DevflowError::Source { .. })));
    }
}
