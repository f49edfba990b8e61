//! Cached HTTP-date formatting.
//!
//! [`HttpDateCache::current_date`] re-formats "now" at most once per
//! one-second window. [`HttpDateCache::date`] and
//! [`HttpDateCache::parse_date`] memoize every distinct input with no
//! eviction, so they are meant for a small set of recurring values such as
//! expiry headers, not for arbitrary client-supplied timestamps.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// How long a formatted "now" stays valid
const FRESHNESS: Duration = Duration::from_secs(1);

/// Last instant an HTTP date can express, 9999-12-31T23:59:59Z
const MAX_HTTP_DATE_SECS: u64 = 253_402_300_799;

struct CurrentDate {
    generated: SystemTime,
    formatted: Arc<str>,
}

/// Process-wide HTTP date cache. Share it behind an `Arc`.
pub struct HttpDateCache {
    current: RwLock<Option<CurrentDate>>,
    formatted: RwLock<HashMap<SystemTime, Arc<str>>>,
    parsed: RwLock<HashMap<String, SystemTime>>,
}

impl Default for HttpDateCache {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpDateCache {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(None),
            formatted: RwLock::new(HashMap::new()),
            parsed: RwLock::new(HashMap::new()),
        }
    }

    /// HTTP date for the current time
    pub fn current_date(&self) -> Arc<str> {
        self.current_date_at(SystemTime::now())
    }

    /// HTTP date for `now`, reusing the cached value while it is less than
    /// one second old. Out-of-range instants are clamped like [`date`](Self::date).
    pub fn current_date_at(&self, now: SystemTime) -> Arc<str> {
        let now = clamp_http_date(now);
        if let Some(current) = self.current.read().as_ref()
            && is_fresh(current, now)
        {
            return current.formatted.clone();
        }

        let mut current = self.current.write();
        if let Some(cached) = current.as_ref()
            && is_fresh(cached, now)
        {
            return cached.formatted.clone();
        }
        let formatted: Arc<str> = httpdate::fmt_http_date(now).into();
        *current = Some(CurrentDate {
            generated: now,
            formatted: formatted.clone(),
        });
        formatted
    }

    /// HTTP date for an arbitrary instant, memoized per instant.
    ///
    /// Instants before the Unix epoch or after the year 9999 are clamped to
    /// the nearest date HTTP can express.
    pub fn date(&self, time: SystemTime) -> Arc<str> {
        let time = clamp_http_date(time);
        if let Some(formatted) = self.formatted.read().get(&time) {
            return formatted.clone();
        }
        self.formatted
            .write()
            .entry(time)
            .or_insert_with(|| httpdate::fmt_http_date(time).into())
            .clone()
    }

    /// Parse an HTTP date, memoizing successful parses.
    pub fn parse_date(&self, value: &str) -> Option<SystemTime> {
        if let Some(time) = self.parsed.read().get(value) {
            return Some(*time);
        }
        let time = httpdate::parse_http_date(value).ok()?;
        self.parsed.write().insert(value.to_string(), time);
        Some(time)
    }

    /// Number of memoized formatted instants
    pub fn cached_dates(&self) -> usize {
        self.formatted.read().len()
    }

    /// Number of memoized parsed values
    pub fn cached_parses(&self) -> usize {
        self.parsed.read().len()
    }
}

fn clamp_http_date(time: SystemTime) -> SystemTime {
    time.clamp(UNIX_EPOCH, UNIX_EPOCH + Duration::from_secs(MAX_HTTP_DATE_SECS))
}

fn is_fresh(current: &CurrentDate, now: SystemTime) -> bool {
    now.duration_since(current.generated)
        .is_ok_and(|age| age < FRESHNESS)
}
