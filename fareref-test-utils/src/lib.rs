//! fareref Test Utilities
//!
//! Shared test infrastructure for the fareref workspace:
//! - A concrete fare record implementing the effectivity contract
//! - A counting, scriptable loader for single-flight and failure tests
//! - Proptest generators for dates, records, queries and bucket granularities
//! - Fixtures for the common date scenarios
//! - One-time tracing setup for tests

use chrono::NaiveDate;
use fareref_core::{Date, Effective, FareRefResult, Loader, LoaderError, SalesRestriction};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

// ============================================================================
// TRACING
// ============================================================================

/// Install a test subscriber once per process.
///
/// Respects `RUST_LOG`; defaults to warnings only so failing tests are not
/// buried in cache chatter.
pub fn init_test_tracing() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Shorthand for building dates in tests. Panics on an invalid date.
#[track_caller]
pub fn date(year: i32, month: u32, day: u32) -> Date {
    NaiveDate::from_ymd_opt(year, month, day)
        .unwrap_or_else(|| panic!("invalid test date {year}-{month}-{day}"))
}

// ============================================================================
// FARE RECORD
// ============================================================================

/// Minimal reference record with every effectivity field populated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FareRecord {
    pub carrier: String,
    pub sequence: u32,
    pub effective: Date,
    pub discontinue: Date,
    pub expire: Option<Date>,
    pub created: Option<Date>,
    pub sales: SalesRestriction,
}

impl FareRecord {
    pub fn new(carrier: impl Into<String>, effective: Date, discontinue: Date) -> Self {
        Self {
            carrier: carrier.into(),
            sequence: 0,
            effective,
            discontinue,
            expire: None,
            created: None,
            sales: SalesRestriction::unrestricted(),
        }
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_expire(mut self, expire: Date) -> Self {
        self.expire = Some(expire);
        self
    }

    pub fn with_created(mut self, created: Date) -> Self {
        self.created = Some(created);
        self
    }

    pub fn with_sales(mut self, sales: SalesRestriction) -> Self {
        self.sales = sales;
        self
    }
}

impl Effective for FareRecord {
    fn effective_date(&self) -> Date {
        self.effective
    }

    fn discontinue_date(&self) -> Date {
        self.discontinue
    }

    fn expire_date(&self) -> Date {
        self.expire.unwrap_or(self.discontinue)
    }

    fn create_date(&self) -> Option<Date> {
        self.created
    }

    fn sales_restriction(&self) -> SalesRestriction {
        self.sales
    }
}

// ============================================================================
// COUNTING LOADER
// ============================================================================

type Producer<K, V> = dyn Fn(&K) -> V + Send + Sync;

/// Loader that counts invocations and can be scripted to sleep or fail.
///
/// Clones share counters, so a test can hand one clone to the cache and
/// keep another to assert on.
pub struct CountingLoader<K, V> {
    name: String,
    calls: Arc<AtomicUsize>,
    failures_remaining: Arc<AtomicUsize>,
    delay: Duration,
    produce: Arc<Producer<K, V>>,
}

impl<K, V> CountingLoader<K, V> {
    pub fn new(name: impl Into<String>, produce: impl Fn(&K) -> V + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            calls: Arc::new(AtomicUsize::new(0)),
            failures_remaining: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
            produce: Arc::new(produce),
        }
    }

    /// Sleep inside every load, widening race windows.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the next `n` loads with a [`LoaderError::Failed`].
    pub fn fail_next(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Number of `load` calls so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<K, V> Clone for CountingLoader<K, V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            calls: Arc::clone(&self.calls),
            failures_remaining: Arc::clone(&self.failures_remaining),
            delay: self.delay,
            produce: Arc::clone(&self.produce),
        }
    }
}

impl<K, V> Loader<K, V> for CountingLoader<K, V>
where
    K: Debug + Send + Sync,
    V: Send + Sync,
{
    fn load(&self, key: &K) -> FareRefResult<V> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::trace!(loader = %self.name, ?key, call, "test load");
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let scripted_failure = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure {
            return Err(LoaderError::failed(&self.name, format!("{key:?}"), "scripted failure").into());
        }
        Ok((self.produce)(key))
    }
}

impl<K, V> Debug for CountingLoader<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountingLoader")
            .field("name", &self.name)
            .field("calls", &self.calls())
            .field("delay", &self.delay)
            .finish()
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for fareref types.

    use super::*;
    use fareref_core::{BucketGranularity, EffectivityQuery};
    use proptest::prelude::*;

    /// A date between 1990-01-01 and roughly 2060.
    pub fn arb_date() -> impl Strategy<Value = Date> {
        (0i64..25_000).prop_map(|offset| date(1990, 1, 1) + chrono::Duration::days(offset))
    }

    /// An ordered `(start, end)` pair, possibly equal.
    pub fn arb_date_range() -> impl Strategy<Value = (Date, Date)> {
        (arb_date(), 0i64..2_000)
            .prop_map(|(start, len)| (start, start + chrono::Duration::days(len)))
    }

    pub fn arb_granularity() -> impl Strategy<Value = BucketGranularity> {
        prop_oneof![
            (1u32..=90).prop_map(BucketGranularity::Days),
            (1u32..=24).prop_map(BucketGranularity::Months),
            (1u32..=5).prop_map(BucketGranularity::Years),
        ]
    }

    pub fn arb_carrier() -> impl Strategy<Value = String> {
        "[A-Z0-9]{2}"
    }

    pub fn arb_fare_record() -> impl Strategy<Value = FareRecord> {
        (
            arb_carrier(),
            any::<u32>(),
            arb_date_range(),
            proptest::option::of(arb_date()),
        )
            .prop_map(|(carrier, sequence, (eff, disc), created)| {
                let record = FareRecord::new(carrier, eff, disc).with_sequence(sequence);
                match created {
                    Some(created) => record.with_created(created),
                    None => record,
                }
            })
    }

    pub fn arb_fare_records(max: usize) -> impl Strategy<Value = Vec<FareRecord>> {
        prop::collection::vec(arb_fare_record(), 0..max)
    }

    pub fn arb_query() -> impl Strategy<Value = EffectivityQuery> {
        (arb_date(), arb_date(), any::<bool>()).prop_map(|(as_of, ticket, historical)| {
            if historical {
                EffectivityQuery::historical(as_of, ticket)
            } else {
                EffectivityQuery::current(as_of, ticket)
            }
        })
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built records for the common effectivity scenarios.

    use super::*;

    /// Two back-to-back half-year records for 2020.
    pub fn half_year_records() -> Vec<FareRecord> {
        vec![
            FareRecord::new("LO", date(2020, 1, 1), date(2020, 6, 30)).with_sequence(1),
            FareRecord::new("LO", date(2020, 7, 1), date(2020, 12, 31)).with_sequence(2),
        ]
    }

    /// A 2020 record created in the back office on 2020-09-01.
    pub fn late_created_record() -> FareRecord {
        FareRecord::new("LO", date(2020, 1, 1), date(2020, 12, 31))
            .with_sequence(3)
            .with_created(date(2020, 9, 1))
    }

    /// One record per carrier under a shared default key.
    pub fn default_key_records() -> Vec<FareRecord> {
        ["LO", "LH", "BA"]
            .into_iter()
            .zip(1..)
            .map(|(carrier, sequence)| {
                FareRecord::new(carrier, date(2020, 1, 1), date(2020, 12, 31))
                    .with_sequence(sequence)
            })
            .collect()
    }
}


#[cfg(test)]
mod prop_tests {
    use super::generators::*;
    use super::*;
    use fareref_core::{effective_indices, first_effective, is_effective, select_effective};
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_generated_ranges_are_ordered(record in arb_fare_record()) {
            prop_assert!(record.effective <= record.discontinue);
            prop_assert_eq!(record.expire_date(), record.discontinue);
        }

        #[test]
        fn prop_buckets_contain_their_date(d in arb_date(), g in arb_granularity()) {
            let bucket = g.bucket_for(d).expect("in range");
            prop_assert!(bucket.contains(d));
        }

        #[test]
        fn prop_selection_paths_agree(
            records in arb_fare_records(20),
            query in arb_query(),
        ) {
            let indices = effective_indices(&records, &query);
            let selected: Vec<&FareRecord> = select_effective(&records, &query).collect();
            let by_index: Vec<&FareRecord> = indices.iter().map(|&i| &records[i]).collect();
            prop_assert_eq!(&selected, &by_index);
            prop_assert!(indices.windows(2).all(|w| w[0] < w[1]));
            for (i, record) in records.iter().enumerate() {
                prop_assert_eq!(indices.contains(&i), is_effective(record, &query));
            }
            prop_assert_eq!(first_effective(&records, &query), selected.first().copied());
        }
    }
}
