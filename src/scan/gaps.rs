//! Gap prediction and gap auditing.
//!
//! Some catalogs allocate ids in fixed-size blocks: a post consumes `B`
//! consecutive ids and only the first one resolves. Once a post is seen at
//! id `e`, ids `e+1 .. e+B-1` are known gaps and need no network request.
//! The block size depends on the id range and is site-specific, so it is
//! supplied as a [`GapTable`].
//!
//! [`GapAudit`] is the diagnostic side: it measures the lengths of observed
//! not-found runs so an operator can tell whether a block size holds.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use tracing::{info, warn};

use crate::item::Outcome;

/// Known ids kept behind the scan position for prediction.
const KNOWN_WINDOW: u64 = 64;

/// Ordered `(first_id, block_size)` ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GapTable {
    ranges: Vec<(u64, u64)>,
}

impl GapTable {
    /// Builds a table. Ranges are sorted by first id; block sizes outside
    /// 2..=4 are rejected.
    ///
    /// # Errors
    ///
    /// Returns a message naming the offending range.
    pub fn new(mut ranges: Vec<(u64, u64)>) -> Result<Self, String> {
        if let Some((first, block)) = ranges.iter().find(|(_, b)| !(2..=4).contains(b)) {
            return Err(format!(
                "block size {block} for ids from {first} is outside 2..=4"
            ));
        }
        ranges.sort_unstable_by_key(|(first, _)| *first);
        ranges.dedup_by_key(|(first, _)| *first);
        Ok(Self { ranges })
    }

    /// Whether the table has no ranges.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Block size for `id`, if a range covers it.
    #[must_use]
    pub fn block_size(&self, id: u64) -> Option<u64> {
        self.ranges
            .iter()
            .rev()
            .find(|(first, _)| *first <= id)
            .map(|(_, block)| *block)
    }
}

impl FromStr for GapTable {
    type Err = String;

    /// Parses `first:block` pairs separated by commas: `0:2,500000:3`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut ranges = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (first, block) = part
                .split_once(':')
                .ok_or_else(|| format!("invalid gap range '{part}', expected first:block"))?;
            let first = first
                .trim()
                .parse::<u64>()
                .map_err(|_| format!("invalid first id in '{part}'"))?;
            let block = block
                .trim()
                .parse::<u64>()
                .map_err(|_| format!("invalid block size in '{part}'"))?;
            ranges.push((first, block));
        }
        Self::new(ranges)
    }
}

fn exists(outcome: Outcome) -> Option<bool> {
    match outcome {
        Outcome::NotFound => Some(false),
        // transient or unknown: the id's existence was not established
        Outcome::EmptyResponse | Outcome::RetriesExhausted => None,
        _ => Some(true),
    }
}

/// Skips fetches for ids that the block structure says cannot exist.
#[derive(Debug)]
pub struct GapPredictor {
    table: GapTable,
    enabled: bool,
    known: BTreeMap<u64, bool>,
    last_existing: Option<u64>,
}

impl GapPredictor {
    /// Creates a predictor. Prediction starts disabled when `enabled` is
    /// false or the table is empty.
    #[must_use]
    pub fn new(table: GapTable, enabled: bool) -> Self {
        let enabled = enabled && !table.is_empty();
        Self {
            table,
            enabled,
            known: BTreeMap::new(),
            last_existing: None,
        }
    }

    /// Whether prediction is still active.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns `true` if `id` is predicted to be a gap.
    ///
    /// Walks back from `id - 1` over at most `block_size - 1` predecessors:
    /// every one of them must be known, and an existing one must be reached
    /// with only not-found ids in between.
    #[must_use]
    pub fn predict(&self, id: u64) -> bool {
        if !self.enabled {
            return false;
        }
        let Some(block) = self.table.block_size(id) else {
            return false;
        };
        for distance in 1..block {
            let Some(prev) = id.checked_sub(distance) else {
                return false;
            };
            match self.known.get(&prev) {
                Some(true) => return true,
                Some(false) => {}
                None => return false,
            }
        }
        false
    }

    /// Records the outcome for `id`.
    ///
    /// An existing id whose distance from the previous existing id is not a
    /// multiple of the block size disables prediction for the rest of the run.
    pub fn observe(&mut self, id: u64, outcome: Outcome) {
        let Some(found) = exists(outcome) else {
            return;
        };
        self.known.insert(id, found);
        if found {
            self.check_alignment(id);
            self.last_existing = Some(self.last_existing.map_or(id, |prev| prev.max(id)));
        }
        if let Some(floor) = id.checked_sub(KNOWN_WINDOW) {
            self.known = self.known.split_off(&floor);
        }
    }

    fn check_alignment(&mut self, id: u64) {
        if !self.enabled {
            return;
        }
        let Some(prev) = self.last_existing.filter(|prev| *prev < id) else {
            return;
        };
        let (Some(block), Some(prev_block)) = (self.table.block_size(id), self.table.block_size(prev))
        else {
            return;
        };
        if block != prev_block {
            return;
        }
        let distance = id - prev;
        if distance % block != 0 {
            self.enabled = false;
            warn!(
                id,
                previous_existing = prev,
                distance,
                block_size = block,
                "existing post at an offset that contradicts the block size, gap prediction disabled"
            );
        }
    }
}

/// Summary of observed not-found runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GapReport {
    /// Closed gaps observed (runs bounded by existing ids on both sides).
    pub gaps: usize,
    /// Fraction of gap lengths divisible by 2.
    pub div2: f64,
    /// Fraction of gap lengths divisible by 3.
    pub div3: f64,
    /// Fraction of gap lengths divisible by 4.
    pub div4: f64,
}

impl fmt::Display for GapReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} gaps, divisible by 2: {:.0}%, by 3: {:.0}%, by 4: {:.0}%",
            self.gaps,
            self.div2 * 100.0,
            self.div3 * 100.0,
            self.div4 * 100.0
        )
    }
}

/// Records boundaries of not-found runs over consecutive ids.
#[derive(Debug, Default)]
pub struct GapAudit {
    last_id: Option<u64>,
    seen_existing: bool,
    run: u64,
    lengths: Vec<u64>,
}

impl GapAudit {
    /// Creates an empty audit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the outcome for `id`. A non-consecutive id resets the current run.
    pub fn observe(&mut self, id: u64, outcome: Outcome) {
        let Some(found) = exists(outcome) else {
            return;
        };
        if self.last_id.is_some_and(|last| last.checked_add(1) != Some(id)) {
            self.run = 0;
            self.seen_existing = false;
        }
        self.last_id = Some(id);
        if found {
            if self.seen_existing && self.run > 0 {
                self.lengths.push(self.run);
            }
            self.run = 0;
            self.seen_existing = true;
        } else if self.seen_existing {
            self.run += 1;
        }
    }

    /// Lengths of closed gaps, in observation order.
    #[must_use]
    pub fn lengths(&self) -> &[u64] {
        &self.lengths
    }

    /// Computes the report.
    #[must_use]
    pub fn report(&self) -> GapReport {
        let gaps = self.lengths.len();
        #[allow(clippy::cast_precision_loss)]
        let fraction = |k: u64| {
            if gaps == 0 {
                0.0
            } else {
                self.lengths.iter().filter(|len| *len % k == 0).count() as f64 / gaps as f64
            }
        };
        GapReport {
            gaps,
            div2: fraction(2),
            div3: fraction(3),
            div4: fraction(4),
        }
    }

    /// Logs the report.
    pub fn log_report(&self) {
        let report = self.report();
        info!(
            gaps = report.gaps,
            div2 = report.div2,
            div3 = report.div3,
            div4 = report.div4,
            "gap audit: {report}"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn table(ranges: &[(u64, u64)]) -> GapTable {
        GapTable::new(ranges.to_vec()).unwrap()
    }

    #[test]
    fn test_gap_table_lookup_and_parse() {
        let table: GapTable = "500:3, 0:2".parse().unwrap();
        assert_eq!(table.block_size(0), Some(2));
        assert_eq!(table.block_size(499), Some(2));
        assert_eq!(table.block_size(500), Some(3));
        assert!("0:5".parse::<GapTable>().is_err());
        assert!("abc".parse::<GapTable>().is_err());
        assert!(GapTable::default().block_size(1).is_none());
    }

    #[test]
    fn test_predicts_gap_after_existing_within_block() {
        let mut predictor = GapPredictor::new(table(&[(0, 3)]), true);
        predictor.observe(9, Outcome::Success);
        assert!(predictor.predict(10));
        predictor.observe(10, Outcome::NotFound);
        assert!(predictor.predict(11));
        predictor.observe(11, Outcome::NotFound);
        // 12 is a block boundary: nearest existing is 3 ids back
        assert!(!predictor.predict(12));
    }

    #[test]
    fn test_no_prediction_with_unknown_predecessor() {
        let mut predictor = GapPredictor::new(table(&[(0, 4)]), true);
        predictor.observe(5, Outcome::Success);
        // 6 unknown
        assert!(!predictor.predict(7));
        assert!(!predictor.predict(0));
    }

    #[test]
    fn test_inconsistent_offset_disables_prediction() {
        let mut predictor = GapPredictor::new(table(&[(0, 2)]), true);
        predictor.observe(10, Outcome::Success);
        predictor.observe(11, Outcome::NotFound);
        predictor.observe(12, Outcome::Success);
        assert!(predictor.is_enabled());
        predictor.observe(13, Outcome::SkippedByFilter);
        assert!(!predictor.is_enabled());
        assert!(!predictor.predict(14));
    }

    #[test]
    fn test_disabled_without_table_or_flag() {
        assert!(!GapPredictor::new(GapTable::default(), true).is_enabled());
        assert!(!GapPredictor::new(table(&[(0, 2)]), false).is_enabled());
    }

    #[test]
    fn test_transient_outcomes_do_not_count() {
        let mut predictor = GapPredictor::new(table(&[(0, 2)]), true);
        predictor.observe(4, Outcome::EmptyResponse);
        assert!(!predictor.predict(5));
    }

    #[test]
    fn test_audit_counts_closed_gaps() {
        let mut audit = GapAudit::new();
        let pattern = [
            (1, Outcome::NotFound), // leading run is not bounded, ignored
            (2, Outcome::Success),
            (3, Outcome::NotFound),
            (4, Outcome::NotFound),
            (5, Outcome::Success),
            (6, Outcome::NotFound),
            (7, Outcome::NotFound),
            (8, Outcome::NotFound),
            (9, Outcome::AlreadyExists),
            (10, Outcome::NotFound), // trailing run is open, ignored
        ];
        for (id, outcome) in pattern {
            audit.observe(id, outcome);
        }
        assert_eq!(audit.lengths(), &[2, 3]);
        let report = audit.report();
        assert_eq!(report.gaps, 2);
        assert!((report.div2 - 0.5).abs() < f64::EPSILON);
        assert!((report.div3 - 0.5).abs() < f64::EPSILON);
        assert!(report.div4.abs() < f64::EPSILON);
        assert_eq!(
            report.to_string(),
            "2 gaps, divisible by 2: 50%, by 3: 50%, by 4: 0%"
        );
    }

    #[test]
    fn test_audit_resets_on_id_jump() {
        let mut audit = GapAudit::new();
        audit.observe(1, Outcome::Success);
        audit.observe(2, Outcome::NotFound);
        audit.observe(10, Outcome::Success);
        assert!(audit.lengths().is_empty());
    }
}
