//! Signal id rewriting

use crate::filter::{Filter, FilterOutput, Services};
use devflow_core::{ConfigError, DeviceEvent, DevflowResult, FilterLink, SignalId};

/// Rewrites `signal_id` from a source signal to a destination signal
///
/// Parameters: `source_signal` (guid, `All` maps every signal) and
/// `destination_signal` (guid).
#[derive(Debug, Clone)]
pub struct SignalMapping {
    source: SignalId,
    destination: SignalId,
}

impl Default for SignalMapping {
    fn default() -> Self {
        Self {
            source: SignalId::NONE,
            destination: SignalId::NONE,
        }
    }
}

impl Filter for SignalMapping {
    fn configure(&mut self, link: &FilterLink, _services: &Services) -> Result<(), Vec<ConfigError>> {
        let mut errors = Vec::new();
        match link.require_guid("source_signal") {
            Ok(id) => self.source = SignalId(id),
            Err(error) => errors.push(error),
        }
        match link.require_guid("destination_signal") {
            Ok(id) if SignalId(id) == SignalId::ALL => errors.push(ConfigError::invalid(
                "destination_signal",
                "cannot map onto the All wildcard",
            )),
            Ok(id) => self.destination = SignalId(id),
            Err(error) => errors.push(error),
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn execute(&mut self, mut event: DeviceEvent, output: &FilterOutput<'_>) -> DevflowResult<()> {
        if !event.signal_id.is_none() && self.source.matches(event.signal_id) {
            event.signal_id = self.destination;
        }
        output.send(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::testing::Harness;
    use crate::filters::SIGNAL_MAPPING_ID;
    use devflow_core::{DeviceTime, SegmentId};

    const BLOOD: SignalId = SignalId::from_u128(0xb1);
    const INTERSTITIAL: SignalId = SignalId::from_u128(0x1f);
    const OTHER: SignalId = SignalId::from_u128(0x77);

    #[test]
    fn test_maps_only_the_source_signal() {
        let harness = Harness::new();
        let mut filter = SignalMapping::default();
        harness.configure(
            &mut filter,
            &FilterLink::new(SIGNAL_MAPPING_ID)
                .with("source_signal", BLOOD.0)
                .with("destination_signal", INTERSTITIAL.0),
        );

        let events = &harness.services.events;
        let time = DeviceTime::from_days(10.0);
        harness.run(&mut filter, events.level(BLOOD, SegmentId(1), time, 6.1)).unwrap();
        harness.run(&mut filter, events.level(OTHER, SegmentId(1), time, 6.2)).unwrap();

        let received = harness.collector.take();
        assert_eq!(received[0].signal_id, INTERSTITIAL);
        assert_eq!(received[1].signal_id, OTHER);
    }

    #[test]
    fn test_wildcard_source_maps_everything_with_a_signal() {
        let harness = Harness::new();
        let mut filter = SignalMapping::default();
        harness.configure(
            &mut filter,
            &FilterLink::new(SIGNAL_MAPPING_ID)
                .with("source_signal", SignalId::ALL.0)
                .with("destination_signal", INTERSTITIAL.0),
        );

        let events = &harness.services.events;
        harness
            .run(&mut filter, events.level(OTHER, SegmentId(1), DeviceTime::from_days(1.0), 1.0))
            .unwrap();
        harness.run(&mut filter, events.information("no signal")).unwrap();

        let received = harness.collector.take();
        assert_eq!(received[0].signal_id, INTERSTITIAL);
        assert!(received[1].signal_id.is_none());
    }

    #[test]
    fn test_reports_every_problem() {
        let harness = Harness::new();
        let link = FilterLink::new(SIGNAL_MAPPING_ID).with("destination_signal", SignalId::ALL.0);
        let errors = SignalMapping::default()
            .configure(&link, &harness.services)
            .unwrap_err();
        assert_eq!(errors.len(), 2);
    }
}
