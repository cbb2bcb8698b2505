//! Pass-through filters

use crate::filter::{Filter, FilterOutput};
use devflow_core::{DeviceEvent, DevflowResult};

/// Forwards every event unchanged, inline
#[derive(Debug, Default, Clone, Copy)]
pub struct Identity;

impl Filter for Identity {
    fn execute(&mut self, event: DeviceEvent, output: &FilterOutput<'_>) -> DevflowResult<()> {
        output.send(event)
    }
}

/// Forwards every event unchanged on its own worker
///
/// Placed between two synchronous stages it splits them into separate
/// regions, so a slow consumer no longer holds up the producer side.
#[derive(Debug, Default, Clone, Copy)]
pub struct Decoupler;

impl Filter for Decoupler {
    fn execute(&mut self, event: DeviceEvent, output: &FilterOutput<'_>) -> DevflowResult<()> {
        output.send(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::testing::Harness;
    use devflow_core::EventKind;

    #[test]
    fn test_identity_keeps_the_event() {
        let harness = Harness::new();
        let events = &harness.services.events;
        let event = events.warning("calibration overdue");
        let clock = event.logical_clock();

        harness.run(&mut Identity, event).unwrap();
        let received = harness.collector.take();
        assert_eq!(received[0].logical_clock(), clock);
        assert_eq!(received[0].kind(), EventKind::Warning);
    }
}
