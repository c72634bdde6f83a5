/// Day / month quota tracking with UTC rollover
///
/// The check is pure with respect to the usage counters: crossing a UTC
/// boundary zeroes the stale counters and stamps the marker, but an allowed
/// check mutates nothing else. The Gate calls `record` only after the
/// backend call succeeded, and `unrecord` when it refunds.
use chrono::{DateTime, Utc};

use crate::models::api_key::{utc_day, utc_month, ApiKeyRecord, QuotaConfig};

/// First-matching deny reason, in the normative order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDenial {
    DailyCalls,
    MonthlyCalls,
    DailyCredits,
    MonthlyCredits,
}

impl QuotaDenial {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaDenial::DailyCalls => "daily_call_limit_exceeded",
            QuotaDenial::MonthlyCalls => "monthly_call_limit_exceeded",
            QuotaDenial::DailyCredits => "daily_credit_limit_exceeded",
            QuotaDenial::MonthlyCredits => "monthly_credit_limit_exceeded",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QuotaTracker {
    global: Option<QuotaConfig>,
}

impl QuotaTracker {
    pub fn new(global: Option<QuotaConfig>) -> Self {
        Self { global }
    }

    /// Roll stale counters over, then evaluate limits in order:
    /// dailyCalls → monthlyCalls → dailyCredits → monthlyCredits.
    /// Call limits deny at `current ≥ limit`; credit limits deny when
    /// `current + required > limit`. A zero limit is "no limit".
    pub fn check(
        &self,
        record: &mut ApiKeyRecord,
        credits_required: u64,
        now: DateTime<Utc>,
    ) -> Result<(), QuotaDenial> {
        self.rollover(record, now);

        let Some(quota) = record.effective_quota(self.global.as_ref()) else {
            return Ok(());
        };

        if quota.daily_calls > 0 && record.quota_daily_calls >= quota.daily_calls {
            return Err(QuotaDenial::DailyCalls);
        }
        if quota.monthly_calls > 0 && record.quota_monthly_calls >= quota.monthly_calls {
            return Err(QuotaDenial::MonthlyCalls);
        }
        if quota.daily_credits > 0
            && record.quota_daily_credits + credits_required > quota.daily_credits
        {
            return Err(QuotaDenial::DailyCredits);
        }
        if quota.monthly_credits > 0
            && record.quota_monthly_credits + credits_required > quota.monthly_credits
        {
            return Err(QuotaDenial::MonthlyCredits);
        }
        Ok(())
    }

    /// Post-success accounting: bump all four counters.
    pub fn record(&self, record: &mut ApiKeyRecord, credits_charged: u64, now: DateTime<Utc>) {
        self.rollover(record, now);
        record.quota_daily_calls += 1;
        record.quota_monthly_calls += 1;
        record.quota_daily_credits += credits_charged;
        record.quota_monthly_credits += credits_charged;
    }

    /// Refund path: decrement with floor at zero.
    pub fn unrecord(&self, record: &mut ApiKeyRecord, credits_refunded: u64) {
        record.quota_daily_calls = record.quota_daily_calls.saturating_sub(1);
        record.quota_monthly_calls = record.quota_monthly_calls.saturating_sub(1);
        record.quota_daily_credits = record.quota_daily_credits.saturating_sub(credits_refunded);
        record.quota_monthly_credits =
            record.quota_monthly_credits.saturating_sub(credits_refunded);
    }

    /// Zero stale counters exactly once per boundary crossing.
    fn rollover(&self, record: &mut ApiKeyRecord, now: DateTime<Utc>) {
        let today = utc_day(now);
        if record.quota_last_reset_day.as_deref() != Some(today.as_str()) {
            record.quota_daily_calls = 0;
            record.quota_daily_credits = 0;
            record.quota_last_reset_day = Some(today);
        }

        let month = utc_month(now);
        if record.quota_last_reset_month.as_deref() != Some(month.as_str()) {
            record.quota_monthly_calls = 0;
            record.quota_monthly_credits = 0;
            record.quota_last_reset_month = Some(month);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn keyed(quota: QuotaConfig) -> ApiKeyRecord {
        let mut record = ApiKeyRecord::new("q", 1000);
        record.quota = Some(quota);
        record
    }

    #[test]
    fn test_no_quota_always_allows() {
        let tracker = QuotaTracker::new(None);
        let mut record = ApiKeyRecord::new("free", 0);
        assert!(tracker.check(&mut record, 10_000, Utc::now()).is_ok());
    }

    #[test]
    fn test_daily_call_limit_denies_in_order() {
        let tracker = QuotaTracker::new(None);
        let mut record = keyed(QuotaConfig {
            daily_calls: 2,
            monthly_calls: 2,
            ..Default::default()
        });
        let now = Utc::now();

        tracker.record(&mut record, 1, now);
        tracker.record(&mut record, 1, now);

        // both dimensions exhausted; daily is reported first
        assert_eq!(
            tracker.check(&mut record, 1, now),
            Err(QuotaDenial::DailyCalls)
        );
    }

    #[test]
    fn test_credit_limit_counts_prospective_charge() {
        let tracker = QuotaTracker::new(None);
        let mut record = keyed(QuotaConfig {
            daily_credits: 10,
            ..Default::default()
        });
        let now = Utc::now();

        tracker.record(&mut record, 8, now);
        // 8 + 2 == 10 is allowed, 8 + 3 > 10 is not
        assert!(tracker.check(&mut record, 2, now).is_ok());
        assert_eq!(
            tracker.check(&mut record, 3, now),
            Err(QuotaDenial::DailyCredits)
        );
    }

    #[test]
    fn test_check_is_pure_on_allow() {
        let tracker = QuotaTracker::new(None);
        let mut record = keyed(QuotaConfig {
            daily_calls: 5,
            ..Default::default()
        });
        let now = Utc::now();
        tracker.check(&mut record, 1, now).unwrap();
        tracker.check(&mut record, 1, now).unwrap();
        assert_eq!(record.quota_daily_calls, 0);
    }

    #[test]
    fn test_midnight_rollover_resets_daily_once() {
        let tracker = QuotaTracker::new(None);
        let mut record = keyed(QuotaConfig {
            daily_calls: 5,
            ..Default::default()
        });

        let before = at("2026-03-09T23:59:59Z");
        for _ in 0..5 {
            assert!(tracker.check(&mut record, 0, before).is_ok());
            tracker.record(&mut record, 0, before);
        }
        assert!(tracker.check(&mut record, 0, before).is_err());

        // one second past midnight the counters are fresh
        let after = at("2026-03-10T00:00:01Z");
        assert!(tracker.check(&mut record, 0, after).is_ok());
        tracker.record(&mut record, 0, after);
        assert_eq!(record.quota_daily_calls, 1);
        assert_eq!(record.quota_last_reset_day.as_deref(), Some("2026-03-10"));
        // month did not change, monthly counters kept accumulating
        assert_eq!(record.quota_monthly_calls, 6);
    }

    #[test]
    fn test_month_rollover() {
        let tracker = QuotaTracker::new(None);
        let mut record = keyed(QuotaConfig {
            monthly_credits: 100,
            ..Default::default()
        });

        tracker.record(&mut record, 90, at("2026-03-31T12:00:00Z"));
        assert!(tracker
            .check(&mut record, 20, at("2026-03-31T13:00:00Z"))
            .is_err());
        assert!(tracker
            .check(&mut record, 20, at("2026-04-01T00:00:01Z"))
            .is_ok());
    }

    #[test]
    fn test_unrecord_floors_at_zero() {
        let tracker = QuotaTracker::new(None);
        let mut record = keyed(QuotaConfig::default());
        tracker.record(&mut record, 4, Utc::now());
        tracker.unrecord(&mut record, 10);
        assert_eq!(record.quota_daily_calls, 0);
        assert_eq!(record.quota_daily_credits, 0);
        tracker.unrecord(&mut record, 10);
        assert_eq!(record.quota_monthly_credits, 0);
    }

    #[test]
    fn test_global_quota_applies_without_override() {
        let tracker = QuotaTracker::new(Some(QuotaConfig {
            daily_calls: 1,
            ..Default::default()
        }));
        let mut record = ApiKeyRecord::new("g", 0);
        let now = Utc::now();
        assert!(tracker.check(&mut record, 0, now).is_ok());
        tracker.record(&mut record, 0, now);
        assert_eq!(
            tracker.check(&mut record, 0, now),
            Err(QuotaDenial::DailyCalls)
        );
    }
}
