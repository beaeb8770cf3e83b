use crate::models::{ChangeRecord, ChangeStatus, PatchSet, VoteKind};

/// Party a change is currently waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitingOn {
    /// The latest revision was rejected; the author has to act.
    Submitter,
    /// No reviewer has rejected the latest revision yet.
    Reviewer,
}

/// An open change with its derived age metrics.
#[derive(Debug, Clone)]
pub struct ClassifiedChange {
    pub waiting_on: WaitingOn,
    /// Seconds waiting since the latest revision appeared.
    pub age: i64,
    /// Seconds since the first revision: total time under review.
    pub age2: i64,
    /// Seconds since the change was last in a clean, non-rejected state;
    /// zero when every revision has been nacked at some point.
    pub age3: i64,
    pub url: String,
    pub subject: String,
}

/// Shared reporting predicate. A change is skipped when it is not open,
/// is work-in-progress in either form, sits on a stable branch (unless
/// stable reporting was requested), or its latest revision already carries
/// a final approval and is just waiting to merge.
pub fn should_report(change: &ChangeRecord, include_stable: bool) -> bool {
    if change.status != ChangeStatus::New {
        return false;
    }
    if !include_stable && change.branch.contains("stable") {
        return false;
    }
    if change.is_work_in_progress() {
        return false;
    }
    match change.latest_patch_set() {
        Some(latest) => !latest.is_approved(),
        None => false,
    }
}

/// Age of a patch set in seconds.
///
/// The createdOn timestamp on the patch isn't what we want: it says when
/// the patch was written, not when it was submitted for review. The next
/// best thing in the data we have is the time of the first review; CI
/// usually comments within an hour or two of submission.
pub fn age_of_patch(patch: &PatchSet, now_ts: i64) -> i64 {
    patch
        .sorted_approvals()
        .first()
        .map(|a| now_ts - a.granted_on)
        .unwrap_or(now_ts - patch.created_on)
}

/// Walk patch sets newest to oldest and return the oldest one in the
/// unbroken un-nacked suffix. Only negative code-review votes count as
/// authoritative nacks here.
fn oldest_without_nack(change: &ChangeRecord) -> Option<&PatchSet> {
    let mut candidate = None;
    for patch in change.patch_sets.iter().rev() {
        let nacked = patch
            .approvals
            .iter()
            .any(|a| a.kind == VoteKind::CodeReview && a.is_negative());
        if nacked {
            break;
        }
        candidate = Some(patch);
    }
    candidate
}

/// Classify one change, or None when the shared predicate excludes it.
pub fn classify(
    change: &ChangeRecord,
    now_ts: i64,
    include_stable: bool,
) -> Option<ClassifiedChange> {
    if !should_report(change, include_stable) {
        return None;
    }
    let latest = change.latest_patch_set()?;
    let first = change.first_patch_set()?;

    let mut waiting_on = WaitingOn::Reviewer;
    for approval in latest.sorted_approvals() {
        if !matches!(approval.kind, VoteKind::CodeReview | VoteKind::Verified) {
            continue;
        }
        if approval.is_negative() {
            waiting_on = WaitingOn::Submitter;
            break;
        }
    }

    Some(ClassifiedChange {
        waiting_on,
        age: age_of_patch(latest, now_ts),
        age2: age_of_patch(first, now_ts),
        age3: oldest_without_nack(change)
            .map(|p| age_of_patch(p, now_ts))
            .unwrap_or(0),
        url: change.url_or_id().to_string(),
        subject: change.subject_or_empty().to_string(),
    })
}

/// True when an earlier revision carried a final approval but the latest
/// one does not: the signature of an approved change that failed to merge
/// and was trivially rebased. Changes whose latest revision drew negative
/// review or verify feedback need a real re-review and are skipped.
pub fn approved_then_rebased(change: &ChangeRecord, include_stable: bool) -> bool {
    // should_report already rules out closed, WIP, stable (unless asked
    // for) and changes whose latest revision is approved
    if !should_report(change, include_stable) {
        return false;
    }
    let Some((latest, earlier)) = change.patch_sets.split_last() else {
        return false;
    };
    if has_negative_feedback(latest) {
        return false;
    }
    earlier.iter().any(PatchSet::is_approved)
}

fn has_negative_feedback(patch: &PatchSet) -> bool {
    patch
        .approvals
        .iter()
        .any(|a| matches!(a.kind, VoteKind::CodeReview | VoteKind::Verified) && a.is_negative())
}

/// Mean age in seconds over a classified set; 0 for an empty set.
pub fn average_age<F>(changes: &[ClassifiedChange], key: F) -> i64
where
    F: Fn(&ClassifiedChange) -> i64,
{
    if changes.is_empty() {
        return 0;
    }
    let total: i64 = changes.iter().map(&key).sum();
    total / changes.len() as i64
}

/// Quartile age via sort-then-index, no interpolation. quartile 1 is the
/// 25th percentile, 2 the median, 3 the 75th.
pub fn quartile_age<F>(changes: &[ClassifiedChange], quartile: usize, key: F) -> i64
where
    F: Fn(&ClassifiedChange) -> i64,
{
    if changes.is_empty() {
        return 0;
    }
    let mut ages: Vec<i64> = changes.iter().map(&key).collect();
    ages.sort_unstable();
    let index = (ages.len() * quartile / 4).min(ages.len() - 1);
    ages[index]
}

/// Count of changes strictly older than the threshold: sort descending,
/// return the length of the prefix that still exceeds it.
pub fn number_waiting_more_than<F>(changes: &[ClassifiedChange], seconds: i64, key: F) -> usize
where
    F: Fn(&ClassifiedChange) -> i64,
{
    let mut ages: Vec<i64> = changes.iter().map(&key).collect();
    ages.sort_unstable_by(|a, b| b.cmp(a));
    for (index, age) in ages.iter().enumerate() {
        if *age <= seconds {
            return index;
        }
    }
    ages.len()
}

/// Render a second count as "N days, N hours, N minutes".
pub fn sec_to_period_string(seconds: i64) -> String {
    let days = seconds / (3600 * 24);
    let hours = (seconds / 3600) - days * 24;
    let minutes = (seconds / 60) - days * 24 * 60 - hours * 60;
    format!("{} days, {} hours, {} minutes", days, hours, minutes)
}
