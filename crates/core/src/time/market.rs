use crate::config::Settings;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use chrono_tz::Tz;
use std::collections::HashSet;

// Fixed-date closures observed every year. Anything else comes from MARKET_HOLIDAYS.
const FIXED_HOLIDAYS: [(u32, u32); 2] = [(1, 1), (12, 25)];

#[derive(Debug, Clone)]
pub struct MarketCalendar {
    tz: Tz,
    holidays: HashSet<NaiveDate>,
}

impl MarketCalendar {
    pub fn new(tz: Tz, holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            tz,
            holidays: holidays.into_iter().collect(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.market_tz, settings.market_holidays.iter().copied())
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        !is_weekend(date) && !self.is_holiday(date)
    }

    pub fn now_in_market_tz(&self, now_utc: DateTime<Utc>) -> DateTime<Tz> {
        now_utc.with_timezone(&self.tz)
    }

    /// Calendar date in the market timezone. Not rolled back on weekends.
    pub fn market_date(&self, now_utc: DateTime<Utc>) -> NaiveDate {
        self.now_in_market_tz(now_utc).date_naive()
    }

    pub fn resolve_as_of_date(
        &self,
        as_of_date_arg: Option<&str>,
        now_utc: DateTime<Utc>,
    ) -> anyhow::Result<NaiveDate> {
        if let Some(s) = as_of_date_arg {
            return Ok(NaiveDate::parse_from_str(s, "%Y-%m-%d")?);
        }
        Ok(self.market_date(now_utc))
    }

    fn is_holiday(&self, date: NaiveDate) -> bool {
        FIXED_HOLIDAYS.contains(&(date.month(), date.day())) || self.holidays.contains(&date)
    }
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    fn ny() -> MarketCalendar {
        MarketCalendar::new(chrono_tz::America::New_York, [])
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn weekends_are_not_trading_days() {
        let cal = ny();
        // 2026-01-03 is Saturday.
        assert!(!cal.is_trading_day(d(2026, 1, 3)));
        assert!(!cal.is_trading_day(d(2026, 1, 4)));
        assert!(cal.is_trading_day(d(2026, 1, 5)));
    }

    #[test]
    fn fixed_and_configured_holidays_are_closed() {
        let cal = MarketCalendar::new(chrono_tz::America::New_York, [d(2026, 7, 3)]);
        assert!(!cal.is_trading_day(d(2025, 12, 25)));
        assert!(!cal.is_trading_day(d(2026, 1, 1)));
        assert!(!cal.is_trading_day(d(2026, 7, 3)));
        assert!(cal.is_trading_day(d(2026, 7, 2)));
    }

    #[test]
    fn market_date_uses_market_timezone() {
        let cal = ny();
        // 2026-01-06 02:00 UTC is still 2026-01-05 21:00 in New York.
        let now = Utc.with_ymd_and_hms(2026, 1, 6, 2, 0, 0).unwrap();
        assert_eq!(cal.market_date(now), d(2026, 1, 5));
        assert_eq!(cal.now_in_market_tz(now).hour(), 21);
    }

    #[test]
    fn explicit_as_of_date_wins() {
        let cal = ny();
        let now = Utc.with_ymd_and_hms(2026, 1, 6, 2, 0, 0).unwrap();
        assert_eq!(
            cal.resolve_as_of_date(Some("2025-11-03"), now).unwrap(),
            d(2025, 11, 3)
        );
        assert!(cal.resolve_as_of_date(Some("11/03/2025"), now).is_err());
    }
}
