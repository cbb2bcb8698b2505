//! DeviceEvent: the message unit flowing through a filter chain

use crate::device_time::DeviceTime;
use crate::error::{DevflowError, DevflowResult};
use crate::ids::{SegmentId, SignalId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Event kind tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum EventKind {
    /// Measured or computed signal level
    Level = 1,
    /// Level hidden from downstream consumers (e.g. for cross-validation)
    MaskedLevel = 2,
    /// Model parameter vector
    Parameters = 3,
    /// Suggested parameters for a solver
    ParametersHint = 4,
    Information = 5,
    Warning = 6,
    Error = 7,
    TimeSegmentStart = 8,
    TimeSegmentStop = 9,
    WarmReset = 10,
    /// Shutdown sentinel; the last event a stage ever forwards
    ShutDown = 11,
    SolveParameters = 12,
}

impl EventKind {
    pub const ALL: [EventKind; 12] = [
        EventKind::Level,
        EventKind::MaskedLevel,
        EventKind::Parameters,
        EventKind::ParametersHint,
        EventKind::Information,
        EventKind::Warning,
        EventKind::Error,
        EventKind::TimeSegmentStart,
        EventKind::TimeSegmentStop,
        EventKind::WarmReset,
        EventKind::ShutDown,
        EventKind::SolveParameters,
    ];

    /// Stable numeric code used at the plugin boundary
    pub const fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.code() == code)
    }

    /// Empty payload matching this kind
    pub fn default_payload(self) -> Payload {
        match self {
            EventKind::Level | EventKind::MaskedLevel => Payload::Level(0.0),
            EventKind::Parameters | EventKind::ParametersHint => Payload::Parameters(Vec::new()),
            EventKind::Information | EventKind::Warning | EventKind::Error => {
                Payload::Text(String::new())
            }
            _ => Payload::None,
        }
    }

    /// Whether `payload` is the shape this kind carries
    pub fn accepts(self, payload: &Payload) -> bool {
        matches!(
            (self, payload),
            (EventKind::Level | EventKind::MaskedLevel, Payload::Level(_))
                | (EventKind::Parameters | EventKind::ParametersHint, Payload::Parameters(_))
                | (
                    EventKind::Information | EventKind::Warning | EventKind::Error,
                    Payload::Text(_)
                )
                | (
                    EventKind::TimeSegmentStart
                        | EventKind::TimeSegmentStop
                        | EventKind::WarmReset
                        | EventKind::ShutDown
                        | EventKind::SolveParameters,
                    Payload::None
                )
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventKind::Level => "Level",
            EventKind::MaskedLevel => "Masked_Level",
            EventKind::Parameters => "Parameters",
            EventKind::ParametersHint => "Parameters_Hint",
            EventKind::Information => "Information",
            EventKind::Warning => "Warning",
            EventKind::Error => "Error",
            EventKind::TimeSegmentStart => "Time_Segment_Start",
            EventKind::TimeSegmentStop => "Time_Segment_Stop",
            EventKind::WarmReset => "Warm_Reset",
            EventKind::ShutDown => "Shut_Down",
            EventKind::SolveParameters => "Solve_Parameters",
        };
        f.write_str(name)
    }
}

/// Kind-specific event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    None,
    Level(f64),
    Parameters(Vec<f64>),
    Text(String),
}

/// Timestamped message unit
///
/// Events are moved from stage to stage; a stage that wants to keep a copy
/// must ask the [`EventFactory`] for a clone, which is a new event with its
/// own logical clock.
#[derive(Debug, PartialEq, Serialize)]
pub struct DeviceEvent {
    kind: EventKind,
    logical_clock: u64,
    pub device_time: DeviceTime,
    pub segment_id: SegmentId,
    pub signal_id: SignalId,
    payload: Payload,
}

impl DeviceEvent {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn logical_clock(&self) -> u64 {
        self.logical_clock
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn is_shutdown(&self) -> bool {
        self.kind == EventKind::ShutDown
    }

    /// Level carried by Level and MaskedLevel events
    pub fn level(&self) -> Option<f64> {
        match self.payload {
            Payload::Level(level) => Some(level),
            _ => None,
        }
    }

    pub fn parameters(&self) -> Option<&[f64]> {
        match &self.payload {
            Payload::Parameters(values) => Some(values),
            _ => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Replace the level of a Level/MaskedLevel event
    pub fn set_level(&mut self, level: f64) -> DevflowResult<()> {
        match &mut self.payload {
            Payload::Level(value) => {
                *value = level;
                Ok(())
            }
            _ => Err(DevflowError::filter_failed(format!(
                "{} event carries no level",
                self.kind
            ))),
        }
    }

    /// Change the kind, keeping the payload; the payload must fit the new kind
    pub fn set_kind(&mut self, kind: EventKind) -> DevflowResult<()> {
        if !kind.accepts(&self.payload) {
            return Err(DevflowError::filter_failed(format!(
                "cannot turn {} into {}",
                self.kind, kind
            )));
        }
        self.kind = kind;
        Ok(())
    }

    /// Decompose into raw parts, keeping the logical clock
    pub fn into_parts(self) -> EventParts {
        EventParts {
            kind: self.kind.code(),
            logical_clock: self.logical_clock,
            device_time: self.device_time,
            segment_id: self.segment_id,
            signal_id: self.signal_id,
            payload: self.payload,
        }
    }
}

/// Raw, unchecked event description
///
/// This is the shape events take at the plugin boundary and in recorded
/// event logs. [`EventFactory::from_parts`] validates it back into a
/// [`DeviceEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventParts {
    pub kind: u32,
    /// Zero requests a fresh clock
    #[serde(default)]
    pub logical_clock: u64,
    pub device_time: DeviceTime,
    #[serde(default)]
    pub segment_id: SegmentId,
    #[serde(default)]
    pub signal_id: SignalId,
    pub payload: Payload,
}

/// Process-wide logical clock
///
/// Strictly increasing, never reused. Created once by whoever assembles the
/// engine and shared through [`EventFactory`].
#[derive(Debug)]
pub struct LogicalClock {
    last: AtomicU64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// Issue the next clock value
    pub fn tick(&self) -> u64 {
        self.last.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Highest value issued so far
    pub fn current(&self) -> u64 {
        self.last.load(Ordering::Relaxed)
    }
}

impl Default for LogicalClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Creates, clones and releases device events
#[derive(Debug, Default)]
pub struct EventFactory {
    clock: LogicalClock,
}

impl EventFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clock(&self) -> &LogicalClock {
        &self.clock
    }

    /// New event of `kind` stamped with the current time and an empty payload
    pub fn new_event(&self, kind: EventKind) -> DeviceEvent {
        DeviceEvent {
            kind,
            logical_clock: self.clock.tick(),
            device_time: DeviceTime::now(),
            segment_id: SegmentId::INVALID,
            signal_id: SignalId::NONE,
            payload: kind.default_payload(),
        }
    }

    /// Deep copy with a fresh logical clock
    pub fn clone_event(&self, event: &DeviceEvent) -> DeviceEvent {
        DeviceEvent {
            kind: event.kind,
            logical_clock: self.clock.tick(),
            device_time: event.device_time,
            segment_id: event.segment_id,
            signal_id: event.signal_id,
            payload: event.payload.clone(),
        }
    }

    /// End the caller's ownership of an event
    pub fn release(&self, event: DeviceEvent) {
        drop(event);
    }

    /// Rebuild an event from raw parts
    pub fn from_parts(&self, parts: EventParts) -> DevflowResult<DeviceEvent> {
        let kind = EventKind::from_code(parts.kind).ok_or_else(|| DevflowError::InvalidSource {
            reason: format!("unknown event kind code {}", parts.kind),
        })?;
        if !kind.accepts(&parts.payload) {
            return Err(DevflowError::InvalidSource {
                reason: format!("payload does not match {} event", kind),
            });
        }
        let logical_clock = match parts.logical_clock {
            0 => self.clock.tick(),
            clock if clock <= self.clock.current() => clock,
            clock => {
                return Err(DevflowError::InvalidSource {
                    reason: format!("logical clock {} was never issued", clock),
                })
            }
        };
        Ok(DeviceEvent {
            kind,
            logical_clock,
            device_time: parts.device_time,
            segment_id: parts.segment_id,
            signal_id: parts.signal_id,
            payload: parts.payload,
        })
    }

    pub fn level(
        &self,
        signal_id: SignalId,
        segment_id: SegmentId,
        device_time: DeviceTime,
        level: f64,
    ) -> DeviceEvent {
        let mut event = self.new_event(EventKind::Level);
        event.signal_id = signal_id;
        event.segment_id = segment_id;
        event.device_time = device_time;
        event.payload = Payload::Level(level);
        event
    }

    pub fn parameters(
        &self,
        signal_id: SignalId,
        segment_id: SegmentId,
        values: Vec<f64>,
    ) -> DeviceEvent {
        let mut event = self.new_event(EventKind::Parameters);
        event.signal_id = signal_id;
        event.segment_id = segment_id;
        event.payload = Payload::Parameters(values);
        event
    }

    pub fn information(&self, text: impl Into<String>) -> DeviceEvent {
        self.text_event(EventKind::Information, text.into())
    }

    pub fn warning(&self, text: impl Into<String>) -> DeviceEvent {
        self.text_event(EventKind::Warning, text.into())
    }

    pub fn error(&self, text: impl Into<String>) -> DeviceEvent {
        self.text_event(EventKind::Error, text.into())
    }

    pub fn segment_start(&self, segment_id: SegmentId) -> DeviceEvent {
        let mut event = self.new_event(EventKind::TimeSegmentStart);
        event.segment_id = segment_id;
        event
    }

    pub fn segment_stop(&self, segment_id: SegmentId) -> DeviceEvent {
        let mut event = self.new_event(EventKind::TimeSegmentStop);
        event.segment_id = segment_id;
        event
    }

    /// The shutdown sentinel, scoped to every segment
    pub fn shutdown(&self) -> DeviceEvent {
        let mut event = self.new_event(EventKind::ShutDown);
        event.segment_id = SegmentId::ALL;
        event
    }

    fn text_event(&self, kind: EventKind, text: String) -> DeviceEvent {
        let mut event = self.new_event(kind);
        event.segment_id = SegmentId::ALL;
        event.payload = Payload::Text(text);
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GLUCOSE: SignalId = SignalId::from_u128(0x6a);

    #[test]
    fn test_logical_clock_strictly_increases() {
        let factory = EventFactory::new();
        let clocks: Vec<u64> = (0..100)
            .map(|_| factory.new_event(EventKind::Level).logical_clock())
            .collect();
        assert!(clocks.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(factory.clock().current(), 100);
    }

    #[test]
    fn test_clone_gets_new_identity() {
        let factory = EventFactory::new();
        let original = factory.level(GLUCOSE, SegmentId(1), DeviceTime::from_days(1.0), 5.5);
        let copy = factory.clone_event(&original);

        assert_ne!(copy.logical_clock(), original.logical_clock());
        assert_eq!(copy.level(), Some(5.5));
        assert_eq!(copy.signal_id, original.signal_id);
        assert_eq!(copy.segment_id, original.segment_id);
        factory.release(original);
        assert_eq!(copy.level(), Some(5.5));
    }

    #[test]
    fn test_new_event_has_empty_payload() {
        let factory = EventFactory::new();
        assert_eq!(factory.new_event(EventKind::Level).level(), Some(0.0));
        assert_eq!(factory.new_event(EventKind::Parameters).parameters(), Some(&[][..]));
        assert_eq!(factory.new_event(EventKind::Warning).text(), Some(""));
        assert_eq!(factory.new_event(EventKind::WarmReset).payload(), &Payload::None);
    }

    #[test]
    fn test_from_parts_rejects_unreadable_sources() {
        let factory = EventFactory::new();
        let valid = factory.level(GLUCOSE, SegmentId(1), DeviceTime::from_days(1.0), 1.0);

        let mut parts = valid.into_parts();
        parts.kind = 99;
        assert!(matches!(
            factory.from_parts(parts.clone()),
            Err(DevflowError::InvalidSource { .. })
        ));

        parts.kind = EventKind::Level.code();
        parts.payload = Payload::Text("oops".into());
        assert!(matches!(
            factory.from_parts(parts.clone()),
            Err(DevflowError::InvalidSource { .. })
        ));

        parts.payload = Payload::Level(2.0);
        parts.logical_clock = 1_000;
        assert!(matches!(
            factory.from_parts(parts),
            Err(DevflowError::InvalidSource { .. })
        ));
    }

    #[test]
    fn test_from_parts_keeps_issued_clock() {
        let factory = EventFactory::new();
        let event = factory.level(GLUCOSE, SegmentId(2), DeviceTime::from_days(2.0), 7.0);
        let clock = event.logical_clock();

        let rebuilt = factory.from_parts(event.into_parts()).unwrap();
        assert_eq!(rebuilt.logical_clock(), clock);

        let mut fresh = rebuilt.into_parts();
        fresh.logical_clock = 0;
        assert!(factory.from_parts(fresh).unwrap().logical_clock() > clock);
    }

    #[test]
    fn test_kind_changes_respect_payload() {
        let factory = EventFactory::new();
        let mut event = factory.level(GLUCOSE, SegmentId(1), DeviceTime::from_days(1.0), 3.0);
        assert!(event.set_kind(EventKind::MaskedLevel).is_ok());
        assert_eq!(event.kind(), EventKind::MaskedLevel);
        assert!(event.set_kind(EventKind::Information).is_err());
        assert!(event.set_level(4.0).is_ok());

        let mut info = factory.information("hello");
        assert!(info.set_level(1.0).is_err());
    }

    #[test]
    fn test_kind_codes_are_stable() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(EventKind::from_code(0), None);
        assert_eq!(EventKind::ShutDown.to_string(), "Shut_Down");
    }
}
