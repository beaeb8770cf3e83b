use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::models::ChangeRecord;

/// Current snapshot schema. Version 1 stored a flat list keyed only by
/// change id; anything but the current version is treated as a cache miss
/// so old snapshots never get mis-merged into new ones.
const SCHEMA_VERSION: u32 = 2;

/// Working set of changes for one project, keyed by the composite
/// (id, project, branch) storage key.
pub type ChangeMap = BTreeMap<String, ChangeRecord>;

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    schema: u32,
    changes: ChangeMap,
}

/// Outcome of merging a record (or page of records) into the working set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// At least one record was inserted or replaced; keep paging.
    Updated,
    /// An incoming record was already cached, byte for byte. The remote
    /// stream is ordered newest-first, so everything past this point is
    /// already known and paging can stop.
    Frontier,
}

/// Merge one record under its composite key. Whole-record replacement;
/// fields are never merged individually.
pub fn merge_record(changes: &mut ChangeMap, record: ChangeRecord) -> MergeOutcome {
    let key = record.key().storage_key();
    match changes.get(&key) {
        Some(existing) if *existing == record => MergeOutcome::Frontier,
        _ => {
            changes.insert(key, record);
            MergeOutcome::Updated
        }
    }
}

/// Merge a page of records, reporting the frontier if any record hit it.
pub fn merge_page(changes: &mut ChangeMap, page: Vec<ChangeRecord>) -> MergeOutcome {
    let mut outcome = MergeOutcome::Updated;
    for record in page {
        if merge_record(changes, record) == MergeOutcome::Frontier {
            outcome = MergeOutcome::Frontier;
        }
    }
    outcome
}

/// Durable per-project change snapshots.
///
/// Snapshots are advisory: anything unreadable, stale, or in an old schema
/// is silently treated as absent, which just costs a full resync. Only a
/// save is allowed to fail loudly.
pub struct ChangeCache {
    dir: PathBuf,
    max_age: Duration,
}

impl ChangeCache {
    pub fn new(dir: impl AsRef<Path>, max_age: Duration) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create cache directory: {}", dir.display()))?;
        Ok(Self { dir, max_age })
    }

    fn snapshot_path(&self, project_name: &str) -> PathBuf {
        // Descriptor names are short identifiers ("nova"), safe as filenames.
        self.dir.join(format!("{}-changes.json", project_name))
    }

    /// Load the snapshot for a project, or an empty map when there is no
    /// usable one.
    pub fn load(&self, project_name: &str) -> ChangeMap {
        let path = self.snapshot_path(project_name);

        let metadata = match fs::metadata(&path) {
            Ok(m) => m,
            Err(_) => {
                debug!(project = project_name, "No cached snapshot");
                return ChangeMap::new();
            }
        };

        if self.is_stale(&metadata) {
            info!(project = project_name, "Cached snapshot is stale, ignoring");
            return ChangeMap::new();
        }

        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(err) => {
                warn!(project = project_name, error = %err, "Unreadable snapshot, ignoring");
                return ChangeMap::new();
            }
        };

        match serde_json::from_str::<Snapshot>(&content) {
            Ok(snapshot) if snapshot.schema == SCHEMA_VERSION => {
                debug!(
                    project = project_name,
                    changes = snapshot.changes.len(),
                    "Loaded cached snapshot"
                );
                snapshot.changes
            }
            Ok(snapshot) => {
                info!(
                    project = project_name,
                    schema = snapshot.schema,
                    "Snapshot in old schema, forcing resync"
                );
                ChangeMap::new()
            }
            Err(err) => {
                warn!(project = project_name, error = %err, "Corrupt snapshot, forcing resync");
                ChangeMap::new()
            }
        }
    }

    /// Persist the full mapping as one atomic unit: written to a temp file
    /// in the same directory and renamed over the old snapshot.
    pub fn save(&self, project_name: &str, changes: &ChangeMap) -> Result<()> {
        let path = self.snapshot_path(project_name);
        let tmp = self.dir.join(format!(".{}-changes.json.tmp", project_name));

        let snapshot = Snapshot {
            schema: SCHEMA_VERSION,
            changes: changes.clone(),
        };
        let content = serde_json::to_string(&snapshot)?;

        fs::write(&tmp, content)
            .with_context(|| format!("Failed to write snapshot: {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace snapshot: {}", path.display()))?;

        debug!(
            project = project_name,
            changes = changes.len(),
            "Saved snapshot"
        );

        Ok(())
    }

    fn is_stale(&self, metadata: &fs::Metadata) -> bool {
        match metadata.modified() {
            Ok(mtime) => SystemTime::now()
                .duration_since(mtime)
                .map(|age| age > self.max_age)
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}
