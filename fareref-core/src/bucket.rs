//! Date bucketing for historical cache variants.
//!
//! A ticket date is folded into a calendar-aligned, half-open
//! `[start, end)` window. Two ticket dates in the same window share a cache
//! entry; crossing a boundary selects a different entry.

use crate::Date;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Width of a historical bucket.
///
/// All variants are aligned to fixed calendar origins so that a bucket is a
/// pure function of the date: `Years(n)` aligns on year 0, `Months(n)` on
/// January of year 0, and `Days(n)` on day 1 of the common era.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "unit", content = "count", rename_all = "lowercase")]
pub enum BucketGranularity {
    Days(u32),
    Months(u32),
    Years(u32),
}

impl Default for BucketGranularity {
    fn default() -> Self {
        BucketGranularity::Years(1)
    }
}

impl BucketGranularity {
    /// Number of units per bucket.
    pub fn count(&self) -> u32 {
        match self {
            BucketGranularity::Days(n)
            | BucketGranularity::Months(n)
            | BucketGranularity::Years(n) => *n,
        }
    }

    /// Compute the bucket containing `date`.
    ///
    /// Returns `None` only when the bucket bounds fall outside the range
    /// representable by [`NaiveDate`].
    pub fn bucket_for(&self, date: Date) -> Option<DateBucket> {
        let n = i64::from(self.count().max(1));
        let (start, end) = match self {
            BucketGranularity::Years(_) => {
                let year = i64::from(date.year());
                let first = year - year.rem_euclid(n);
                (
                    NaiveDate::from_ymd_opt(i32::try_from(first).ok()?, 1, 1)?,
                    NaiveDate::from_ymd_opt(i32::try_from(first + n).ok()?, 1, 1)?,
                )
            }
            BucketGranularity::Months(_) => {
                let index = i64::from(date.year()) * 12 + i64::from(date.month0());
                let first = index - index.rem_euclid(n);
                (month_start(first)?, month_start(first + n)?)
            }
            BucketGranularity::Days(_) => {
                let day = i64::from(date.num_days_from_ce());
                let first = day - day.rem_euclid(n);
                (
                    NaiveDate::from_num_days_from_ce_opt(i32::try_from(first).ok()?)?,
                    NaiveDate::from_num_days_from_ce_opt(i32::try_from(first + n).ok()?)?,
                )
            }
        };
        Some(DateBucket { start, end })
    }
}

fn month_start(month_index: i64) -> Option<NaiveDate> {
    let year = i32::try_from(month_index.div_euclid(12)).ok()?;
    let month = u32::try_from(month_index.rem_euclid(12)).ok()? + 1;
    NaiveDate::from_ymd_opt(year, month, 1)
}

impl fmt::Display for BucketGranularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BucketGranularity::Days(n) => write!(f, "{}d", n),
            BucketGranularity::Months(n) => write!(f, "{}mo", n),
            BucketGranularity::Years(n) => write!(f, "{}y", n),
        }
    }
}

/// A half-open `[start, end)` date window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DateBucket {
    pub start: Date,
    pub end: Date,
}

impl DateBucket {
    /// Check whether `date` falls inside this window.
    pub fn contains(&self, date: Date) -> bool {
        self.start <= date && date < self.end
    }
}

impl fmt::Display for DateBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> Date {
        NaiveDate::from_ymd_opt(y, m, day).expect("valid test date")
    }

    #[test]
    fn test_yearly_bucket_is_calendar_year() {
        let bucket = BucketGranularity::Years(1)
            .bucket_for(d(2020, 8, 1))
            .expect("bucket");
        assert_eq!(bucket.start, d(2020, 1, 1));
        assert_eq!(bucket.end, d(2021, 1, 1));
        assert_eq!(bucket.to_string(), "[2020-01-01, 2021-01-01)");
    }

    #[test]
    fn test_year_boundary_changes_bucket() {
        let g = BucketGranularity::Years(1);
        assert_ne!(g.bucket_for(d(2020, 12, 31)), g.bucket_for(d(2021, 1, 1)));
        assert_eq!(g.bucket_for(d(2020, 1, 1)), g.bucket_for(d(2020, 12, 31)));
    }

    #[test]
    fn test_quarter_buckets() {
        let g = BucketGranularity::Months(3);
        let q3 = g.bucket_for(d(2020, 8, 15)).expect("bucket");
        assert_eq!(q3.start, d(2020, 7, 1));
        assert_eq!(q3.end, d(2020, 10, 1));
    }

    #[test]
    fn test_week_buckets_are_seven_days() {
        let g = BucketGranularity::Days(7);
        let bucket = g.bucket_for(d(2021, 3, 10)).expect("bucket");
        assert_eq!((bucket.end - bucket.start).num_days(), 7);
        assert!(bucket.contains(d(2021, 3, 10)));
    }

    #[test]
    fn test_zero_count_treated_as_one() {
        let bucket = BucketGranularity::Years(0)
            .bucket_for(d(1999, 5, 5))
            .expect("bucket");
        assert_eq!(bucket.start, d(1999, 1, 1));
        assert_eq!(bucket.end, d(2000, 1, 1));
    }

    #[test]
    fn test_granularity_serde_shape() {
        let json = serde_json::to_string(&BucketGranularity::Months(6)).expect("serialize");
        assert_eq!(json, r#"{"unit":"months","count":6}"#);
        let back: BucketGranularity = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, BucketGranularity::Months(6));
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn granularity_strategy() -> impl Strategy<Value = BucketGranularity> {
        prop_oneof![
            (1u32..60).prop_map(BucketGranularity::Days),
            (1u32..24).prop_map(BucketGranularity::Months),
            (1u32..5).prop_map(BucketGranularity::Years),
        ]
    }

    fn date_strategy() -> impl Strategy<Value = Date> {
        (0i64..365 * 40).prop_map(|offset| {
            NaiveDate::from_ymd_opt(2000, 1, 1).expect("epoch") + chrono::Duration::days(offset)
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        /// A date always lies inside its own bucket.
        #[test]
        fn prop_bucket_contains_date(g in granularity_strategy(), date in date_strategy()) {
            let bucket = g.bucket_for(date).expect("in range");
            prop_assert!(bucket.contains(date));
        }

        /// Every date inside a bucket maps back to the same bucket.
        #[test]
        fn prop_bucket_is_stable_within_window(g in granularity_strategy(), date in date_strategy()) {
            let bucket = g.bucket_for(date).expect("in range");
            prop_assert_eq!(g.bucket_for(bucket.start), Some(bucket));
            let last = bucket.end.pred_opt().expect("has predecessor");
            prop_assert_eq!(g.bucket_for(last), Some(bucket));
            prop_assert_ne!(g.bucket_for(bucket.end), Some(bucket));
        }
    }
}
