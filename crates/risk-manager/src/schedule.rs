use std::str::FromStr;

use analysis_core::EngineError;
use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Allowed trading window in a local timezone.
///
/// Hours are `[open_hour, close_hour)` in local time; `open_hour == close_hour`
/// means all day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingSchedule {
    pub timezone: Tz,
    pub open_hour: u32,
    pub close_hour: u32,
    pub allow_weekends: bool,
}

impl Default for TradingSchedule {
    fn default() -> Self {
        Self {
            timezone: Tz::UTC,
            open_hour: 0,
            close_hour: 0,
            allow_weekends: true,
        }
    }
}

impl TradingSchedule {
    /// Reason trading is not allowed at `now`, if any
    pub fn check(&self, now: DateTime<Utc>) -> Option<String> {
        let local = now.with_timezone(&self.timezone);
        if !self.allow_weekends && matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return Some(format!("Outside trading days ({} in {})", local.weekday(), self.timezone));
        }
        if self.open_hour == self.close_hour {
            return None;
        }
        let hour = local.hour();
        let open = if self.open_hour < self.close_hour {
            hour >= self.open_hour && hour < self.close_hour
        } else {
            // window wraps midnight
            hour >= self.open_hour || hour < self.close_hour
        };
        if open {
            None
        } else {
            Some(format!(
                "Outside trading hours ({:02}:00 {}, window {:02}-{:02})",
                hour, self.timezone, self.open_hour, self.close_hour
            ))
        }
    }
}

/// Parses `"<tz>,<open>,<close>[,weekdays]"`, e.g. `"America/New_York,9,16,weekdays"`.
impl FromStr for TradingSchedule {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |msg: String| EngineError::Configuration(format!("trading hours '{}': {}", s, msg));
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        if parts.len() < 3 || parts.len() > 4 {
            return Err(bad("expected tz,open,close[,weekdays]".to_string()));
        }

        let timezone: Tz = parts[0].parse().map_err(|e| bad(format!("{}", e)))?;
        let hour = |p: &str| -> Result<u32, EngineError> {
            let h: u32 = p.parse().map_err(|_| bad(format!("invalid hour '{}'", p)))?;
            if h > 23 {
                return Err(bad(format!("hour {} out of range", h)));
            }
            Ok(h)
        };
        let open_hour = hour(parts[1])?;
        let close_hour = hour(parts[2])?;
        let allow_weekends = match parts.get(3) {
            None => true,
            Some(&"weekdays") => false,
            Some(&"all") => true,
            Some(other) => return Err(bad(format!("unknown day filter '{}'", other))),
        };

        Ok(Self {
            timezone,
            open_hour,
            close_hour,
            allow_weekends,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn new_york_session() {
        let schedule: TradingSchedule = "America/New_York,9,16,weekdays".parse().unwrap();

        // Tuesday 15:00 UTC = 11:00 EDT
        let open = Utc.with_ymd_and_hms(2024, 6, 4, 15, 0, 0).unwrap();
        assert!(schedule.check(open).is_none());

        // Tuesday 22:00 UTC = 18:00 EDT
        let closed = Utc.with_ymd_and_hms(2024, 6, 4, 22, 0, 0).unwrap();
        assert!(schedule.check(closed).unwrap().contains("hours"));

        // Saturday
        let weekend = Utc.with_ymd_and_hms(2024, 6, 8, 15, 0, 0).unwrap();
        assert!(schedule.check(weekend).unwrap().contains("days"));
    }

    #[test]
    fn default_is_always_open() {
        let schedule = TradingSchedule::default();
        let sunday = Utc.with_ymd_and_hms(2024, 6, 9, 3, 0, 0).unwrap();
        assert!(schedule.check(sunday).is_none());
    }

    #[test]
    fn window_can_wrap_midnight() {
        let schedule: TradingSchedule = "UTC,22,4".parse().unwrap();
        assert!(schedule.check(Utc.with_ymd_and_hms(2024, 6, 4, 23, 0, 0).unwrap()).is_none());
        assert!(schedule.check(Utc.with_ymd_and_hms(2024, 6, 4, 12, 0, 0).unwrap()).is_some());
    }

    #[test]
    fn rejects_garbage() {
        assert!("Mars/Olympus,9,16".parse::<TradingSchedule>().is_err());
        assert!("UTC,9".parse::<TradingSchedule>().is_err());
        assert!("UTC,9,25".parse::<TradingSchedule>().is_err());
    }
}
