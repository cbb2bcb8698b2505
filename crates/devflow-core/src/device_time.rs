//! Fractional-day device timestamps
//!
//! Device events carry their time as a number of days (with fraction) since
//! the OLE automation epoch, 1899-12-30 00:00 UTC. One unit is one day, so a
//! five minute sampling period is `5.0 / 1440.0`.

use crate::error::{DevflowError, DevflowResult};
use chrono::{DateTime, TimeZone, Utc};
use core::fmt;
use core::ops::{Add, Sub};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Seconds between 1899-12-30 and the Unix epoch
const EPOCH_OFFSET_SECS: i64 = 2_209_161_600;
const SECS_PER_DAY: f64 = 86_400.0;

/// Device time in fractional days
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct DeviceTime(f64);

impl DeviceTime {
    /// One minute expressed in days
    pub const ONE_MINUTE: f64 = 1.0 / 1440.0;
    /// One second expressed in days
    pub const ONE_SECOND: f64 = 1.0 / SECS_PER_DAY;

    #[inline]
    pub const fn from_days(days: f64) -> Self {
        Self(days)
    }

    #[inline]
    pub const fn as_days(&self) -> f64 {
        self.0
    }

    /// Current wall clock time
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Convert a wall clock instant
    pub fn from_datetime(datetime: DateTime<Utc>) -> Self {
        let secs = datetime.timestamp() + EPOCH_OFFSET_SECS;
        let nanos = datetime.timestamp_subsec_nanos() as f64 / 1_000_000_000.0;
        Self((secs as f64 + nanos) / SECS_PER_DAY)
    }

    /// Convert back to a wall clock instant
    pub fn to_datetime(&self) -> DevflowResult<DateTime<Utc>> {
        if !self.0.is_finite() {
            return Err(DevflowError::InvalidTimestamp {
                reason: "device time is not finite",
            });
        }
        let total_secs = self.0 * SECS_PER_DAY;
        let secs = total_secs.floor();
        let nanos = ((total_secs - secs) * 1_000_000_000.0).round() as u32;
        Utc.timestamp_opt(secs as i64 - EPOCH_OFFSET_SECS, nanos.min(999_999_999))
            .single()
            .ok_or(DevflowError::InvalidTimestamp {
                reason: "device time outside representable range",
            })
    }

    /// Calculate duration since an earlier device time
    pub fn duration_since(&self, earlier: DeviceTime) -> DevflowResult<Duration> {
        if self.0 >= earlier.0 {
            Ok(Duration::from_secs_f64((self.0 - earlier.0) * SECS_PER_DAY))
        } else {
            Err(DevflowError::InvalidTimestamp {
                reason: "timestamp is earlier than reference",
            })
        }
    }

    /// Check the time is finite and not before the epoch
    pub fn validate(&self) -> DevflowResult<()> {
        if !self.0.is_finite() {
            Err(DevflowError::InvalidTimestamp {
                reason: "device time is not finite",
            })
        } else if self.0 < 0.0 {
            Err(DevflowError::InvalidTimestamp {
                reason: "device time before epoch",
            })
        } else {
            Ok(())
        }
    }
}

impl fmt::Display for DeviceTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Ok(datetime) => write!(f, "{}", datetime.format("%Y-%m-%d %H:%M:%S%.3f")),
            Err(_) => write!(f, "{}d", self.0),
        }
    }
}

impl Add<Duration> for DeviceTime {
    type Output = DeviceTime;

    fn add(self, rhs: Duration) -> DeviceTime {
        DeviceTime(self.0 + rhs.as_secs_f64() / SECS_PER_DAY)
    }
}

impl Sub<DeviceTime> for DeviceTime {
    type Output = f64;

    /// Difference in days
    fn sub(self, rhs: DeviceTime) -> f64 {
        self.0 - rhs.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_epoch_conversion() {
        let unix_epoch = Utc.timestamp_opt(0, 0).single().unwrap();
        let time = DeviceTime::from_datetime(unix_epoch);
        assert!((time.as_days() - 25_569.0).abs() < 1e-9);
        assert_eq!(time.to_datetime().unwrap(), unix_epoch);
    }

    #[test]
    fn test_duration_arithmetic() {
        let start = DeviceTime::from_days(45_000.0);
        let later = start + Duration::from_secs(300);
        assert!((later - start - 5.0 * DeviceTime::ONE_MINUTE).abs() < 1e-9);

        let elapsed = later.duration_since(start).unwrap();
        assert!((elapsed.as_secs_f64() - 300.0).abs() < 1e-3);
        assert!(start.duration_since(later).is_err());
    }

    #[test]
    fn test_validation() {
        assert!(DeviceTime::now().validate().is_ok());
        assert!(DeviceTime::from_days(-1.0).validate().is_err());
        assert!(DeviceTime::from_days(f64::NAN).validate().is_err());
    }
}
