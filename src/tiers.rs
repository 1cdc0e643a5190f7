//! Age-based polling tiers

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fmt;

/// Polling cadence bucket. Ordered from youngest to oldest; a post only
/// ever moves forward because its age only grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollTier {
    /// Younger than 1 hour
    Fresh,
    /// 1 to 24 hours
    Recent,
    /// 1 to 7 days
    Daily,
    /// Older than 7 days
    Weekly,
}

impl PollTier {
    pub const ALL: [PollTier; 4] = [
        PollTier::Fresh,
        PollTier::Recent,
        PollTier::Daily,
        PollTier::Weekly,
    ];

    /// Tier for a post of the given age. Boundaries belong to the older tier.
    pub fn for_age(age_hours: f64) -> Self {
        let age = if age_hours.is_nan() { 0.0 } else { age_hours.max(0.0) };
        PollTier::ALL
            .into_iter()
            .find(|tier| tier.max_age_hours().map_or(true, |max| age < max))
            .unwrap_or(PollTier::Weekly)
    }

    pub fn interval(self) -> Duration {
        match self {
            PollTier::Fresh => Duration::minutes(10),
            PollTier::Recent => Duration::minutes(30),
            PollTier::Daily => Duration::hours(6),
            PollTier::Weekly => Duration::hours(24),
        }
    }

    /// Shortest interval of any tier; nothing checked more recently is due
    pub fn min_interval() -> Duration {
        PollTier::Fresh.interval()
    }

    /// Exclusive upper age bound in hours; `None` for the oldest tier
    pub fn max_age_hours(self) -> Option<f64> {
        match self {
            PollTier::Fresh => Some(1.0),
            PollTier::Recent => Some(24.0),
            PollTier::Daily => Some(168.0),
            PollTier::Weekly => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PollTier::Fresh => "fresh",
            PollTier::Recent => "recent",
            PollTier::Daily => "daily",
            PollTier::Weekly => "weekly",
        }
    }

    /// Whether a post last checked at `last_checked_at` is due at `now`
    pub fn is_due(self, last_checked_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last_checked_at {
            None => true,
            Some(last) => last + self.interval() <= now,
        }
    }
}

/// SQL `CASE` expression mapping an age-in-hours expression to a value per
/// tier, so queries bucket posts the same way `PollTier::for_age` does.
pub fn tier_case_sql(age_expr: &str, value: impl Fn(PollTier) -> String) -> String {
    let mut sql = String::from("CASE");
    for tier in PollTier::ALL {
        match tier.max_age_hours() {
            Some(max) => sql.push_str(&format!(
                " WHEN {} < {} THEN {}",
                age_expr,
                max,
                value(tier)
            )),
            None => sql.push_str(&format!(" ELSE {}", value(tier))),
        }
    }
    sql.push_str(" END");
    sql
}

/// Poll interval of each tier as a Postgres interval literal
pub fn interval_sql(tier: PollTier) -> String {
    format!("INTERVAL '{} seconds'", tier.interval().num_seconds())
}

impl fmt::Display for PollTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_boundaries() {
        assert_eq!(PollTier::for_age(0.0), PollTier::Fresh);
        assert_eq!(PollTier::for_age(0.99), PollTier::Fresh);
        assert_eq!(PollTier::for_age(1.0), PollTier::Recent);
        assert_eq!(PollTier::for_age(23.99), PollTier::Recent);
        assert_eq!(PollTier::for_age(24.0), PollTier::Daily);
        assert_eq!(PollTier::for_age(167.9), PollTier::Daily);
        assert_eq!(PollTier::for_age(168.0), PollTier::Weekly);
        assert_eq!(PollTier::for_age(10_000.0), PollTier::Weekly);
    }

    #[test]
    fn test_negative_and_nan_ages() {
        assert_eq!(PollTier::for_age(-3.0), PollTier::Fresh);
        assert_eq!(PollTier::for_age(f64::NAN), PollTier::Fresh);
    }

    #[test]
    fn test_tiers_are_monotonic_in_age() {
        let mut last = PollTier::Fresh;
        for tenth in 0..2_000 {
            let tier = PollTier::for_age(tenth as f64 / 10.0);
            assert!(tier >= last);
            last = tier;
        }
    }

    #[test]
    fn test_intervals() {
        assert_eq!(PollTier::Fresh.interval(), Duration::minutes(10));
        assert_eq!(PollTier::Recent.interval(), Duration::minutes(30));
        assert_eq!(PollTier::Daily.interval(), Duration::hours(6));
        assert_eq!(PollTier::Weekly.interval(), Duration::hours(24));
        assert!(PollTier::ALL.iter().all(|t| t.interval() >= PollTier::min_interval()));
    }

    #[test]
    fn test_tier_case_sql() {
        let sql = tier_case_sql("age", |t| format!("'{}'", t));
        assert_eq!(
            sql,
            "CASE WHEN age < 1 THEN 'fresh' WHEN age < 24 THEN 'recent' \
             WHEN age < 168 THEN 'daily' ELSE 'weekly' END"
        );
        assert_eq!(interval_sql(PollTier::Recent), "INTERVAL '1800 seconds'");
    }

    #[test]
    fn test_is_due() {
        let now = Utc::now();
        assert!(PollTier::Weekly.is_due(None, now));
        assert!(PollTier::Fresh.is_due(Some(now - Duration::minutes(10)), now));
        assert!(!PollTier::Fresh.is_due(Some(now - Duration::minutes(9)), now));
        assert!(!PollTier::Daily.is_due(Some(now - Duration::hours(5)), now));
    }
}
