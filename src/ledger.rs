use std::collections::{HashMap, HashSet};

use crate::config::ExcludedReviewers;
use crate::models::{ChangeRecord, ChangeStatus, PatchSet, VoteKind};
use crate::timeline::age_of_patch;

/// Per-reviewer tallies over the reporting window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReviewerStats {
    /// Code-review votes cast (the approval bucket is counted separately).
    pub total: u64,
    pub minus_two: u64,
    pub minus_one: u64,
    pub plus_one: u64,
    pub plus_two: u64,
    /// Final approvals: Approved votes, or positive Workflow votes.
    pub approvals: u64,
    /// Votes later overturned by a core reviewer on the same patch set.
    pub disagreements: u64,
    /// Reviews received on this person's own patches.
    pub received: u64,
}

impl ReviewerStats {
    fn record_vote(&mut self, value: i32) {
        match value {
            -2 => self.minus_two += 1,
            -1 => self.minus_one += 1,
            1 => self.plus_one += 1,
            2 => self.plus_two += 1,
            _ => {}
        }
    }

    fn plus_minus_total(&self) -> u64 {
        self.plus_one + self.plus_two + self.minus_one + self.minus_two
    }

    /// Share of positive votes among all +/- votes, as a percentage.
    /// 0 when no votes were cast.
    pub fn plus_ratio(&self) -> f64 {
        let all = self.plus_minus_total();
        if all == 0 {
            return 0.0;
        }
        (self.plus_one + self.plus_two) as f64 / all as f64 * 100.0
    }

    /// Share of overturned votes among all +/- votes, as a percentage.
    pub fn disagreement_ratio(&self) -> f64 {
        let all = self.plus_minus_total();
        if all == 0 {
            return 0.0;
        }
        self.disagreements as f64 / all as f64 * 100.0
    }

    /// Reviews given over reviews received, as a percentage; None when
    /// nothing was received (rendered as "inf" upstream).
    pub fn received_ratio(&self) -> Option<f64> {
        if self.received == 0 {
            return None;
        }
        Some(self.total as f64 / self.received as f64 * 100.0)
    }
}

/// Aggregates reviewer activity across a population of patch sets.
pub struct ReviewerLedger {
    /// Reviews granted before this timestamp are outside the window.
    cut_off: i64,
    excluded: ExcludedReviewers,
    reviewers: HashMap<String, ReviewerStats>,
}

impl ReviewerLedger {
    pub fn new(cut_off: i64, excluded: ExcludedReviewers) -> Self {
        Self {
            cut_off,
            excluded,
            reviewers: HashMap::new(),
        }
    }

    /// Tally one patch set against the given core team.
    ///
    /// Two passes: first find the latest timestamps at which a core member
    /// cast a positive and a negative code-review vote, then count each
    /// in-window review, flagging it as a disagreement when a core vote of
    /// the opposite sign landed after it.
    pub fn record_patch_set(&mut self, patch_set: &PatchSet, core_team: &HashSet<String>) {
        let mut latest_core_pos = 0_i64;
        let mut latest_core_neg = 0_i64;

        for review in &patch_set.approvals {
            if review.kind != VoteKind::CodeReview {
                continue;
            }
            if !core_team.contains(review.by.username_or_unknown()) {
                continue;
            }
            if review.numeric_value() > 0 {
                latest_core_pos = latest_core_pos.max(review.granted_on);
            } else {
                latest_core_neg = latest_core_neg.max(review.granted_on);
            }
        }

        let submitter = patch_set.uploader.username_or_unknown().to_string();

        for review in &patch_set.approvals {
            if review.granted_on < self.cut_off {
                continue;
            }
            if !matches!(
                review.kind,
                VoteKind::CodeReview | VoteKind::Approved | VoteKind::Workflow
            ) {
                continue;
            }

            let reviewer = review.by.username_or_unknown().to_string();
            let value = review.numeric_value();

            if review.kind == VoteKind::Approved
                || (review.kind == VoteKind::Workflow && value > 0)
            {
                self.reviewers.entry(reviewer).or_default().approvals += 1;
                continue;
            }
            if review.kind == VoteKind::Workflow {
                // Negative workflow votes mark WIP, not review activity.
                continue;
            }

            let stats = self.reviewers.entry(reviewer).or_default();
            stats.total += 1;
            stats.record_vote(value);
            if (value > 0 && review.granted_on < latest_core_neg)
                || (value < 0 && review.granted_on < latest_core_pos)
            {
                // A core member's later vote overturned this one.
                stats.disagreements += 1;
            }

            self.reviewers.entry(submitter.clone()).or_default().received += 1;
        }
    }

    /// Final rows, with automated accounts dropped, sorted by review count
    /// descending (ties broken by name for stable output).
    pub fn into_rows(self) -> Vec<(String, ReviewerStats)> {
        let excluded = self.excluded;
        let mut rows: Vec<(String, ReviewerStats)> = self
            .reviewers
            .into_iter()
            .filter(|(name, _)| !excluded.contains(name))
            .collect();
        rows.sort_by(|a, b| b.1.total.cmp(&a.1.total).then_with(|| a.0.cmp(&b.0)));
        rows
    }
}

/// Change-population counters for the reporting window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangePopulationStats {
    /// Patch sets submitted inside the window.
    pub patches: u64,
    /// Changes whose first patch set falls inside the window.
    pub created: u64,
    /// Changes with any patch set inside the window.
    pub involved: u64,
    pub merged: u64,
    pub abandoned: u64,
    pub wip: u64,
}

impl ChangePopulationStats {
    /// Net growth of the open-review queue over the window.
    pub fn queue_growth(&self) -> i64 {
        self.created as i64 - self.merged as i64 - self.abandoned as i64 - self.wip as i64
    }
}

/// Fold population counters over a change set. A patch set is in-window
/// when its effective submission time (see `age_of_patch`) is newer than
/// the cut-off.
pub fn population_stats(
    changes: &[ChangeRecord],
    cut_off: i64,
    now_ts: i64,
) -> ChangePopulationStats {
    let mut stats = ChangePopulationStats::default();

    for change in changes {
        let mut patch_in_window = false;
        for (index, patch_set) in change.patch_sets.iter().enumerate() {
            let age = age_of_patch(patch_set, now_ts);
            if now_ts - age > cut_off {
                stats.patches += 1;
                patch_in_window = true;
                if index == 0 {
                    stats.created += 1;
                }
            }
        }
        if patch_in_window {
            stats.involved += 1;
            match change.status {
                ChangeStatus::Merged => stats.merged += 1,
                ChangeStatus::Abandoned => stats.abandoned += 1,
                ChangeStatus::Workinprogress => stats.wip += 1,
                _ => {}
            }
        }
    }

    stats
}
