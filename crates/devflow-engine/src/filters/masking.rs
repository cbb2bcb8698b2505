//! Level masking for cross-validation runs

use crate::filter::{Filter, FilterOutput, Services};
use devflow_core::{ConfigError, DeviceEvent, DevflowResult, EventKind, FilterLink, SignalId};

/// Hides selected Level events of one signal
///
/// Parameters: `signal` (guid) and `bitmask`, a string of `0`/`1` digits
/// (spaces and underscores ignored). The mask is applied cyclically to the
/// Level events of `signal`; a `0` turns the event into a MaskedLevel.
/// Every other event passes unchanged.
#[derive(Debug, Clone, Default)]
pub struct Masking {
    signal: SignalId,
    mask: Vec<bool>,
    position: usize,
}

impl Masking {
    fn parse_mask(text: &str) -> Result<Vec<bool>, ConfigError> {
        let mut mask = Vec::with_capacity(text.len());
        for c in text.chars().filter(|c| !c.is_whitespace() && *c != '_') {
            match c {
                '0' => mask.push(false),
                '1' => mask.push(true),
                other => {
                    return Err(ConfigError::invalid(
                        "bitmask",
                        format!("unexpected character '{}'", other),
                    ))
                }
            }
        }
        if mask.is_empty() {
            return Err(ConfigError::invalid("bitmask", "must not be empty"));
        }
        Ok(mask)
    }
}

impl Filter for Masking {
    fn configure(&mut self, link: &FilterLink, _services: &Services) -> Result<(), Vec<ConfigError>> {
        let mut errors = Vec::new();
        match link.require_guid("signal") {
            Ok(id) => self.signal = SignalId(id),
            Err(error) => errors.push(error),
        }
        match link.require_str("bitmask").and_then(Self::parse_mask) {
            Ok(mask) => self.mask = mask,
            Err(error) => errors.push(error),
        }
        self.position = 0;
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn execute(&mut self, mut event: DeviceEvent, output: &FilterOutput<'_>) -> DevflowResult<()> {
        if event.kind() == EventKind::Level && self.signal.matches(event.signal_id) && !self.mask.is_empty() {
            let keep = self.mask[self.position % self.mask.len()];
            self.position = (self.position + 1) % self.mask.len();
            if !keep {
                event.set_kind(EventKind::MaskedLevel)?;
            }
        }
        output.send(event)
    }
}
