//! Per-backend query quotas
//!
//! Backends may declare a maximum number of queries per day and per
//! calendar month (UTC). Counters roll over by comparing dates when they
//! are touched; there is no timer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::clock::Clock;
use super::types::IndexerDefinition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QuotaCounter {
    day: NaiveDate,
    day_count: u32,
    month: (i32, u32),
    month_count: u32,
}

impl QuotaCounter {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            day: now.date_naive(),
            day_count: 0,
            month: (now.year(), now.month()),
            month_count: 0,
        }
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if self.day != today {
            self.day = today;
            self.day_count = 0;
        }
        let month = (now.year(), now.month());
        if self.month != month {
            self.month = month;
            self.month_count = 0;
        }
    }
}

/// Usage counters for one backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryUsage {
    pub today: u32,
    pub this_month: u32,
}

/// Counts dispatched queries against each backend's limits
pub struct QueryQuotaTracker {
    entries: RwLock<HashMap<i32, Arc<Mutex<QuotaCounter>>>>,
    clock: Arc<dyn Clock>,
}

impl QueryQuotaTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    fn entry(&self, id: i32, now: DateTime<Utc>) -> Arc<Mutex<QuotaCounter>> {
        if let Some(entry) = self.entries.read().get(&id) {
            return entry.clone();
        }
        self.entries
            .write()
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(QuotaCounter::new(now))))
            .clone()
    }

    /// Count one outbound request
    pub fn record_query(&self, id: i32) {
        let now = self.clock.now();
        let entry = self.entry(id, now);
        let mut counter = entry.lock();
        counter.roll(now);
        counter.day_count = counter.day_count.saturating_add(1);
        counter.month_count = counter.month_count.saturating_add(1);
    }

    pub fn usage(&self, id: i32, now: DateTime<Utc>) -> QueryUsage {
        let Some(entry) = self.entries.read().get(&id).cloned() else {
            return QueryUsage::default();
        };
        let mut counter = entry.lock();
        counter.roll(now);
        QueryUsage {
            today: counter.day_count,
            this_month: counter.month_count,
        }
    }

    fn limits_hit(&self, definition: &IndexerDefinition, now: DateTime<Utc>) -> (bool, bool) {
        let usage = self.usage(definition.id, now);
        let daily = definition
            .query_limit
            .is_some_and(|limit| usage.today >= limit);
        let monthly = definition
            .query_limit_monthly
            .is_some_and(|limit| usage.this_month >= limit);
        (daily, monthly)
    }

    /// Whether the backend has used up its daily or monthly allowance
    pub fn at_query_limit(&self, definition: &IndexerDefinition, now: DateTime<Utc>) -> bool {
        let (daily, monthly) = self.limits_hit(definition, now);
        if daily || monthly {
            debug!(
                indexer_id = definition.id,
                daily_limit = ?definition.query_limit,
                monthly_limit = ?definition.query_limit_monthly,
                "Indexer at query limit"
            );
        }
        daily || monthly
    }

    /// Time until the exhausted quota resets, if the backend is at a limit
    pub fn retry_after(&self, definition: &IndexerDefinition, now: DateTime<Utc>) -> Option<Duration> {
        let (daily, monthly) = self.limits_hit(definition, now);
        let reset = if monthly {
            next_month_start(now)
        } else if daily {
            next_day_start(now)
        } else {
            return None;
        };
        (reset - now).to_std().ok()
    }
}

impl std::fmt::Debug for QueryQuotaTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryQuotaTracker")
            .field("tracked", &self.entries.read().len())
            .finish()
    }
}

fn next_day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn next_month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
