//! Chain run service: wires an event source, a chain and the output sink

use anyhow::{Context, Result};
use devflow_core::{DeviceEvent, DevflowResult, EventKind, FilterChainConfiguration};
use devflow_engine::{
    ChainFile, EngineSettings, Engine, EventSink, ExecutorStats, FilterChainExecutor, FilterDescriptor,
    StopStatus,
};
use devflow_simulation::{
    EventRecorder, EventReplay, GeneratorConfig, RealTimeStream, SignalGenerator, StreamCommand,
    StreamConfig,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Where the events of a run come from
#[derive(Debug, Clone)]
pub enum Source {
    /// One generated segment of `count` levels
    Generated { count: usize, config: GeneratorConfig },
    /// A JSON-lines event log
    Replay(PathBuf),
    /// Wall clock paced generation for `duration`, or until Ctrl-C
    RealTime { config: StreamConfig, duration: Duration },
}

/// Result of one chain run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub sent: u64,
    pub received: HashMap<EventKind, u64>,
    pub stages: Vec<(String, ExecutorStats)>,
    pub stop: StopStatus,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn received_of(&self, kind: EventKind) -> u64 {
        self.received.get(&kind).copied().unwrap_or(0)
    }
}

/// Terminal sink counting events per kind, optionally recording them
struct SummarySink {
    counts: Mutex<HashMap<EventKind, u64>>,
    recorder: Option<EventRecorder>,
}

impl SummarySink {
    fn new(recorder: Option<EventRecorder>) -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
            recorder,
        }
    }

    fn counts(&self) -> HashMap<EventKind, u64> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl EventSink for SummarySink {
    fn push(&self, event: DeviceEvent) -> DevflowResult<()> {
        *self
            .counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event.kind())
            .or_insert(0) += 1;
        match &self.recorder {
            Some(recorder) => recorder.push(event),
            None => Ok(()),
        }
    }
}

/// Counts events on their way into the chain
struct CountingTarget {
    chain: Arc<FilterChainExecutor>,
    sent: AtomicU64,
}

impl EventSink for CountingTarget {
    fn push(&self, event: DeviceEvent) -> DevflowResult<()> {
        self.chain.send(event)?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// An engine plus the chain configuration of one chain file
pub struct ChainService {
    engine: Engine,
    configuration: FilterChainConfiguration,
}

impl ChainService {
    /// Load a chain file; `plugin_dir` overrides the file's setting
    pub fn from_chain_file(path: &Path, plugin_dir: Option<PathBuf>) -> Result<Self> {
        let mut file = ChainFile::load(path).with_context(|| format!("loading {}", path.display()))?;
        if plugin_dir.is_some() {
            file.engine.plugin_dir = plugin_dir;
        }
        let engine = Self::open_engine(file.engine.clone())?;
        let configuration = file
            .to_configuration(engine.registry())
            .with_context(|| format!("resolving filters of {}", path.display()))?;
        Ok(Self { engine, configuration })
    }

    /// Service without a chain, for listing filters
    pub fn without_chain(plugin_dir: Option<PathBuf>) -> Result<Self> {
        let settings = EngineSettings {
            plugin_dir,
            ..EngineSettings::default()
        };
        Ok(Self {
            engine: Self::open_engine(settings)?,
            configuration: FilterChainConfiguration::new(),
        })
    }

    fn open_engine(settings: EngineSettings) -> Result<Engine> {
        let engine = Engine::new(settings).context("creating engine")?;
        // SAFETY: plugin directories are chosen by the operator, who vouches
        // for the libraries in them
        let loaded = unsafe { engine.load_plugins() }.context("loading plugins")?;
        if loaded > 0 {
            info!(loaded, "plugin modules loaded");
        }
        Ok(engine)
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn configuration(&self) -> &FilterChainConfiguration {
        &self.configuration
    }

    /// Every filter type the registry can build
    pub fn describe_filters(&self) -> Vec<FilterDescriptor> {
        let mut descriptors = self.engine.registry().descriptors();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// Build the chain once and stop it again
    pub fn check(&self) -> Result<Vec<String>> {
        let chain = self
            .engine
            .build_chain(&self.configuration, Arc::new(SummarySink::new(None)))
            .context("building chain")?;
        let names = chain.stage_names();
        chain.stop().context("stopping chain")?;
        Ok(names)
    }

    /// Run `source` through a fresh chain and stop it
    pub async fn run(&self, source: Source, record: Option<PathBuf>) -> Result<RunSummary> {
        let recorder = match record {
            Some(path) => Some(
                EventRecorder::create(&path)
                    .with_context(|| format!("recording to {}", path.display()))?,
            ),
            None => None,
        };
        let sink = Arc::new(SummarySink::new(recorder));
        let chain = Arc::new(
            self.engine
                .build_chain(&self.configuration, sink.clone())
                .context("building chain")?,
        );
        chain.start().context("starting chain")?;
        info!(stages = ?chain.stage_names(), "chain running");

        let target = Arc::new(CountingTarget {
            chain: chain.clone(),
            sent: AtomicU64::new(0),
        });
        let started = Instant::now();
        let fed = self.feed(source, target.clone()).await;

        let stopping = chain.clone();
        let stop = tokio::task::spawn_blocking(move || stopping.stop())
            .await
            .context("stop task failed")?
            .context("stopping chain")?;
        fed?;

        Ok(RunSummary {
            sent: target.sent.load(Ordering::Relaxed),
            received: sink.counts(),
            stages: chain.stats(),
            stop,
            elapsed: started.elapsed(),
        })
    }

    async fn feed(&self, source: Source, target: Arc<CountingTarget>) -> Result<()> {
        match source {
            Source::Generated { count, config } => {
                let events = self.engine.events().clone();
                tokio::task::spawn_blocking(move || -> Result<()> {
                    let mut generator = SignalGenerator::new(config, events)?;
                    generator.emit_segment(count, target.as_ref())?;
                    Ok(())
                })
                .await
                .context("generator task failed")?
            }
            Source::Replay(path) => {
                let replay = EventReplay::open(&path, self.engine.events().clone())?;
                let sent = tokio::task::spawn_blocking(move || replay.replay_into(target.as_ref()))
                    .await
                    .context("replay task failed")??;
                info!(sent, path = %path.display(), "replay finished");
                Ok(())
            }
            Source::RealTime { config, duration } => {
                let mut stream = RealTimeStream::new(config, self.engine.events().clone(), target)?;
                let control = stream.control_handle();
                let task = tokio::spawn(async move { stream.run().await });

                control.send(StreamCommand::Start).await?;
                tokio::select! {
                    _ = tokio::time::sleep(duration) => {}
                    _ = tokio::signal::ctrl_c() => warn!("interrupted"),
                }
                control.send(StreamCommand::Stop).await?;
                control.send(StreamCommand::Shutdown).await?;
                let stats = task.await.context("stream task failed")??;
                info!(ticks = stats.ticks, failures = stats.failures, "stream finished");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devflow_core::DeviceTime;
    use tempfile::TempDir;

    const CHAIN: &str = r#"
[engine]
queue_capacity = 8

[[filter]]
filter = "identity"

[[filter]]
filter = "decoupler"
"#;

    fn service(dir: &TempDir) -> ChainService {
        let path = dir.path().join("chain.toml");
        std::fs::write(&path, CHAIN).unwrap();
        ChainService::from_chain_file(&path, None).unwrap()
    }

    fn generated(count: usize) -> Source {
        Source::Generated {
            count,
            config: GeneratorConfig {
                start: Some(DeviceTime::from_days(45_000.0)),
                seed: Some(1),
                ..GeneratorConfig::default()
            },
        }
    }

    #[tokio::test]
    async fn test_generated_run_reaches_the_sink() {
        let dir = TempDir::new().unwrap();
        let summary = service(&dir).run(generated(25), None).await.unwrap();

        assert_eq!(summary.sent, 27);
        assert_eq!(summary.received_of(EventKind::Level), 25);
        assert_eq!(summary.received_of(EventKind::TimeSegmentStart), 1);
        assert_eq!(summary.received_of(EventKind::ShutDown), 1);
        assert_eq!(summary.stop, StopStatus::Stopped);
        assert_eq!(summary.stages.len(), 2);
    }

    #[tokio::test]
    async fn test_recorded_run_replays() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let log = dir.path().join("run.jsonl");

        service.run(generated(10), Some(log.clone())).await.unwrap();
        let replayed = service.run(Source::Replay(log), None).await.unwrap();

        assert_eq!(replayed.sent, 12);
        assert_eq!(replayed.received_of(EventKind::Level), 10);
    }

    #[test]
    fn test_unknown_filter_name_fails_to_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chain.toml");
        std::fs::write(&path, "[[filter]]\nfilter = \"no such filter\"\n").unwrap();
        let error = ChainService::from_chain_file(&path, None).err().unwrap();
        assert!(format!("{:#}", error).contains("no such filter"));
    }

    #[test]
    fn test_check_lists_stages() {
        let dir = TempDir::new().unwrap();
        let names = service(&dir).check().unwrap();
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn test_builtin_filters_listed() {
        let service = ChainService::without_chain(None).unwrap();
        let names: Vec<String> = service.describe_filters().into_iter().map(|d| d.name).collect();
        assert!(names.contains(&"identity".to_string()));
        assert!(names.contains(&"masking".to_string()));
    }
}
