//! Candidate ranking
//!
//! Pure reduction over collected reports.

use super::{ProbeReport, RankBy};

/// Index of the report with the strictly greatest offset
///
/// Ties keep the earliest report, so the winner depends on input order only,
/// never on the order probes completed in.
pub fn most_advanced(reports: &[ProbeReport], rank_by: RankBy) -> Option<usize> {
    let mut best: Option<(usize, u64)> = None;

    for (index, report) in reports.iter().enumerate() {
        let Some(position) = report.outcome.position() else {
            continue;
        };
        let offset = rank_by.offset(position);

        match best {
            Some((_, best_offset)) if offset <= best_offset => {}
            _ => best = Some((index, offset)),
        }
    }

    best.map(|(index, _)| index)
}
