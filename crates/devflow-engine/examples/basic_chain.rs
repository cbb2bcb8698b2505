//! Basic usage of the devflow engine
//!
//! Builds a small chain from a TOML description, pushes a few glucose levels
//! through it and prints what arrived at the end.

use devflow_core::{DeviceTime, DevflowResult, EventKind, SegmentId, SignalId};
use devflow_engine::{ChainFile, CollectingSink, Engine};
use std::sync::Arc;

const CHAIN: &str = r#"
[engine]
queue_capacity = 16

[[filter]]
filter = "signal mapping"
parameters = [
    { name = "source_signal", value = { guid = "00000000-0000-0000-0000-00000000b100" } },
    { name = "destination_signal", value = { guid = "00000000-0000-0000-0000-0000000015f0" } },
]

[[filter]]
filter = "decoupler"

[[filter]]
filter = "masking"
parameters = [
    { name = "signal", value = { guid = "00000000-0000-0000-0000-0000000015f0" } },
    { name = "bitmask", value = { wstring = "1110" } },
]
"#;

const BLOOD_GLUCOSE: SignalId = SignalId::from_u128(0xb100);

fn main() -> DevflowResult<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    println!("=== devflow basic chain ===\n");

    let file = ChainFile::from_toml_str(CHAIN)?;
    let engine = Engine::new(file.engine.clone())?;
    let configuration = file.to_configuration(engine.registry())?;
    println!("1. Chain has {} links", configuration.len());

    let sink = Arc::new(CollectingSink::new());
    let chain = engine.build_chain(&configuration, sink.clone())?;
    println!("   stages: {}", chain.stage_names().join(" -> "));

    chain.start()?;
    let start = DeviceTime::now();
    let events = engine.events();
    chain.send(events.segment_start(SegmentId(1)))?;
    for i in 0..8 {
        let time = DeviceTime::from_days(start.as_days() + i as f64 * 5.0 * DeviceTime::ONE_MINUTE);
        chain.send(events.level(BLOOD_GLUCOSE, SegmentId(1), time, 5.0 + 0.25 * i as f64))?;
    }
    chain.send(events.segment_stop(SegmentId(1)))?;
    let status = chain.stop()?;
    println!("\n2. Chain stopped: {:?}", status);

    println!("\n3. Received events:");
    for event in sink.take() {
        match event.kind() {
            EventKind::Level | EventKind::MaskedLevel => println!(
                "   {:<14} {} signal={} level={:.2}",
                event.kind().to_string(),
                event.device_time,
                event.signal_id,
                event.level().unwrap_or_default()
            ),
            kind => println!("   {:<14} segment={}", kind.to_string(), event.segment_id),
        }
    }

    for (stage, stats) in chain.stats() {
        println!("   {:<18} processed={} failed={}", stage, stats.processed, stats.failed);
    }
    Ok(())
}
