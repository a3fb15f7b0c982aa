//! Effectivity filtering over cached candidate records.
//!
//! A cache entry typically holds every record stored under a key, across all
//! of their validity windows. Callers select the records valid for a given
//! as-of date and ticket date with [`is_effective`] and the scanning helpers
//! below.
//!
//! # Modes
//!
//! - [`EffectivityMode::Current`]: the record must be in effect on the as-of
//!   date, not expired on the as-of date, and sellable on the ticket date.
//! - [`EffectivityMode::Historical`]: point-in-time query as of the ticket
//!   date. Records created after the ticket date did not exist yet and are
//!   excluded. Expiry is checked against the ticket date instead of the
//!   as-of date, and the ticketing-side expiry is not enforced.

use crate::Date;
use serde::{Deserialize, Serialize};

/// Current-data vs point-in-time query semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectivityMode {
    #[default]
    Current,
    Historical,
}

/// The two reference dates plus mode for one effectivity evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EffectivityQuery {
    pub as_of: Date,
    pub ticket_date: Date,
    pub mode: EffectivityMode,
}

impl EffectivityQuery {
    pub fn current(as_of: Date, ticket_date: Date) -> Self {
        Self {
            as_of,
            ticket_date,
            mode: EffectivityMode::Current,
        }
    }

    pub fn historical(as_of: Date, ticket_date: Date) -> Self {
        Self {
            as_of,
            ticket_date,
            mode: EffectivityMode::Historical,
        }
    }

    pub fn is_historical(&self) -> bool {
        self.mode == EffectivityMode::Historical
    }
}

/// Ticketing-side restriction dates. `None` means unrestricted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SalesRestriction {
    /// First date a ticket may be issued.
    pub effective: Option<Date>,
    /// Last date a ticket may be issued.
    pub discontinue: Option<Date>,
    /// Date after which the restriction record itself is withdrawn.
    pub expire: Option<Date>,
}

impl SalesRestriction {
    pub fn unrestricted() -> Self {
        Self::default()
    }

    fn permits(&self, ticket_date: Date, mode: EffectivityMode) -> bool {
        if self.effective.is_some_and(|eff| ticket_date < eff) {
            return false;
        }
        if self.discontinue.is_some_and(|disc| ticket_date > disc) {
            return false;
        }
        match mode {
            EffectivityMode::Current => !self.expire.is_some_and(|exp| ticket_date > exp),
            EffectivityMode::Historical => true,
        }
    }
}

/// A record carrying effective-date metadata.
pub trait Effective {
    /// First date the record is in effect.
    fn effective_date(&self) -> Date;

    /// Last date the record is in effect (inclusive).
    fn discontinue_date(&self) -> Date;

    /// Date after which the record is withdrawn. Defaults to the
    /// discontinue date.
    fn expire_date(&self) -> Date {
        self.discontinue_date()
    }

    /// When the record was created in the backing store, if tracked.
    fn create_date(&self) -> Option<Date> {
        None
    }

    fn sales_restriction(&self) -> SalesRestriction {
        SalesRestriction::unrestricted()
    }
}

/// Evaluate a single record against a query.
pub fn is_effective<R: Effective + ?Sized>(record: &R, query: &EffectivityQuery) -> bool {
    let as_of = query.as_of;
    if as_of < record.effective_date() || as_of > record.discontinue_date() {
        return false;
    }

    match query.mode {
        EffectivityMode::Current => {
            if as_of > record.expire_date() {
                return false;
            }
        }
        EffectivityMode::Historical => {
            if record
                .create_date()
                .is_some_and(|created| created > query.ticket_date)
            {
                return false;
            }
            if query.ticket_date > record.expire_date() {
                return false;
            }
        }
    }

    record
        .sales_restriction()
        .permits(query.ticket_date, query.mode)
}

/// Find the first effective record, then keep scanning for later ones.
///
/// Several records under one key may be effective at once (for example one
/// per carrier under a shared default key), so this never stops at the first
/// match. Positions are returned in candidate order.
pub fn effective_indices<R: Effective>(candidates: &[R], query: &EffectivityQuery) -> Vec<usize> {
    let mut selected = Vec::new();
    collect_effective_indices(candidates, query, &mut selected);
    selected
}

/// Same as [`effective_indices`] but appends into a caller-provided buffer,
/// which lets pooled buffers be reused.
pub fn collect_effective_indices<R: Effective>(
    candidates: &[R],
    query: &EffectivityQuery,
    out: &mut Vec<usize>,
) {
    let Some(first) = candidates.iter().position(|r| is_effective(r, query)) else {
        return;
    };
    out.push(first);
    out.extend(
        candidates[first + 1..]
            .iter()
            .enumerate()
            .filter(|(_, r)| is_effective(*r, query))
            .map(|(offset, _)| first + 1 + offset),
    );
}

/// Iterate over the effective records in candidate order.
pub fn select_effective<'a, R: Effective>(
    candidates: &'a [R],
    query: &'a EffectivityQuery,
) -> impl Iterator<Item = &'a R> + 'a {
    candidates.iter().filter(move |r| is_effective(*r, query))
}

/// The first effective record, if any.
pub fn first_effective<'a, R: Effective>(
    candidates: &'a [R],
    query: &EffectivityQuery,
) -> Option<&'a R> {
    candidates.iter().find(|r| is_effective(*r, query))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[derive(Debug, Clone)]
    struct Rec {
        name: &'static str,
        eff: Date,
        disc: Date,
        expire: Option<Date>,
        created: Option<Date>,
        sales: SalesRestriction,
    }

    impl Effective for Rec {
        fn effective_date(&self) -> Date {
            self.eff
        }
        fn discontinue_date(&self) -> Date {
            self.disc
        }
        fn expire_date(&self) -> Date {
            self.expire.unwrap_or(self.disc)
        }
        fn create_date(&self) -> Option<Date> {
            self.created
        }
        fn sales_restriction(&self) -> SalesRestriction {
            self.sales
        }
    }

    fn d(y: i32, m: u32, day: u32) -> Date {
        NaiveDate::from_ymd_opt(y, m, day).expect("valid test date")
    }

    fn rec(name: &'static str, eff: Date, disc: Date) -> Rec {
        Rec {
            name,
            eff,
            disc,
            expire: None,
            created: None,
            sales: SalesRestriction::unrestricted(),
        }
    }

    fn half_years() -> Vec<Rec> {
        vec![
            rec("R1", d(2020, 1, 1), d(2020, 6, 30)),
            rec("R2", d(2020, 7, 1), d(2020, 12, 31)),
        ]
    }

    #[test]
    fn test_current_mode_selects_by_as_of_date() {
        let records = half_years();

        let q = EffectivityQuery::current(d(2020, 3, 1), d(2020, 3, 1));
        let names: Vec<_> = select_effective(&records, &q).map(|r| r.name).collect();
        assert_eq!(names, vec!["R1"]);

        let q = EffectivityQuery::current(d(2020, 8, 1), d(2020, 8, 1));
        let names: Vec<_> = select_effective(&records, &q).map(|r| r.name).collect();
        assert_eq!(names, vec!["R2"]);

        let q = EffectivityQuery::current(d(2021, 1, 1), d(2021, 1, 1));
        assert!(first_effective(&records, &q).is_none());
        assert!(effective_indices(&records, &q).is_empty());
    }

    #[test]
    fn test_boundaries_are_inclusive() {
        let records = half_years();
        let q = EffectivityQuery::current(d(2020, 6, 30), d(2020, 6, 30));
        assert_eq!(effective_indices(&records, &q), vec![0]);
        let q = EffectivityQuery::current(d(2020, 7, 1), d(2020, 7, 1));
        assert_eq!(effective_indices(&records, &q), vec![1]);
    }

    #[test]
    fn test_historical_excludes_records_created_after_ticket_date() {
        let mut r = rec("late", d(2020, 1, 1), d(2021, 12, 31));
        r.created = Some(d(2020, 9, 1));

        let before = EffectivityQuery::historical(d(2020, 11, 1), d(2020, 8, 1));
        assert!(!is_effective(&r, &before));

        let after = EffectivityQuery::historical(d(2020, 11, 1), d(2020, 10, 1));
        assert!(is_effective(&r, &after));
    }

    #[test]
    fn test_create_date_ignored_in_current_mode() {
        let mut r = rec("late", d(2020, 1, 1), d(2021, 12, 31));
        r.created = Some(d(2020, 9, 1));
        let q = EffectivityQuery::current(d(2020, 11, 1), d(2020, 8, 1));
        assert!(is_effective(&r, &q));
    }

    #[test]
    fn test_historical_relaxes_expiry_to_ticket_date() {
        let mut r = rec("withdrawn", d(2020, 1, 1), d(2020, 12, 31));
        r.expire = Some(d(2020, 5, 31));

        let current = EffectivityQuery::current(d(2020, 7, 1), d(2020, 4, 1));
        assert!(!is_effective(&r, &current));

        let historical = EffectivityQuery::historical(d(2020, 7, 1), d(2020, 4, 1));
        assert!(is_effective(&r, &historical));

        let ticketed_late = EffectivityQuery::historical(d(2020, 7, 1), d(2020, 6, 15));
        assert!(!is_effective(&r, &ticketed_late));
    }

    #[test]
    fn test_sales_restriction_window() {
        let mut r = rec("sale", d(2020, 1, 1), d(2020, 12, 31));
        r.sales = SalesRestriction {
            effective: Some(d(2020, 2, 1)),
            discontinue: Some(d(2020, 2, 28)),
            expire: Some(d(2020, 2, 20)),
        };

        assert!(!is_effective(&r, &EffectivityQuery::current(d(2020, 6, 1), d(2020, 1, 15))));
        assert!(is_effective(&r, &EffectivityQuery::current(d(2020, 6, 1), d(2020, 2, 10))));
        // Past the ticketing expiry only matters for current data.
        assert!(!is_effective(&r, &EffectivityQuery::current(d(2020, 6, 1), d(2020, 2, 25))));
        assert!(is_effective(&r, &EffectivityQuery::historical(d(2020, 6, 1), d(2020, 2, 25))));
        assert!(!is_effective(&r, &EffectivityQuery::historical(d(2020, 6, 1), d(2020, 3, 1))));
    }

    #[test]
    fn test_scan_continues_past_first_match() {
        let records = vec![
            rec("A", d(2019, 1, 1), d(2019, 12, 31)),
            rec("B", d(2020, 1, 1), d(2020, 12, 31)),
            rec("C", d(2018, 1, 1), d(2018, 12, 31)),
            rec("D", d(2020, 3, 1), d(2020, 3, 31)),
        ];
        let q = EffectivityQuery::current(d(2020, 3, 15), d(2020, 3, 15));
        assert_eq!(effective_indices(&records, &q), vec![1, 3]);
        assert_eq!(first_effective(&records, &q).map(|r| r.name), Some("B"));
    }

    #[test]
    fn test_collect_appends_into_existing_buffer() {
        let records = half_years();
        let q = EffectivityQuery::current(d(2020, 3, 1), d(2020, 3, 1));
        let mut buf = Vec::with_capacity(4);
        collect_effective_indices(&records, &q, &mut buf);
        assert_eq!(buf, vec![0]);
    }
}
