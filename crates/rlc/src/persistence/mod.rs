use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info};

use crate::integrity::StateSnapshot;
use crate::runtime::ComponentRuntime;
use crate::{RlcError, RlcResult};

const SNAPSHOT_EXTENSION: &str = ".snapshot.json";

/// On-disk form of one component's snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSnapshot {
    pub component_id: String,
    pub component_type: String,
    pub revision: u64,
    pub snapshot: StateSnapshot,
}

/// Checksum of the last written state per component id
///
/// Revisions restart at zero when a component is hydrated, so they cannot
/// tell whether the file is current.
type WrittenChecksums = Arc<Mutex<HashMap<String, String>>>;

/// Persists component snapshots to a directory in the background
///
/// Stored snapshots are offered back to the runtime by
/// [`load_all`](Self::load_all) and go through the same verification as
/// client-supplied ones when the component is next instantiated.
pub struct SnapshotStore {
    runtime: Arc<ComponentRuntime>,
    storage_path: PathBuf,
    check_interval: Duration,
    written: WrittenChecksums,
    handles: JoinSet<()>,
}

impl SnapshotStore {
    /// Create a new snapshot store
    pub fn new(runtime: Arc<ComponentRuntime>, storage_path: impl Into<PathBuf>) -> Self {
        Self {
            runtime,
            storage_path: storage_path.into(),
            check_interval: Duration::from_secs(10), // Default: check every 10 seconds
            written: Arc::new(Mutex::new(HashMap::new())),
            handles: JoinSet::new(),
        }
    }

    /// Set the interval for checking changed components
    pub fn set_check_interval(&mut self, interval: Duration) {
        self.check_interval = interval;
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    /// Start persisting in the background
    pub async fn start(&mut self) -> RlcResult<()> {
        ensure_storage_dir(&self.storage_path).await?;

        info!(
            "Starting snapshot store with storage path: {:?}",
            self.storage_path
        );

        let runtime = self.runtime.clone();
        let storage_path = self.storage_path.clone();
        let written = self.written.clone();
        let check_interval = self.check_interval;

        self.handles.spawn(async move {
            let mut interval = interval(check_interval);

            loop {
                interval.tick().await;

                match persist_pass(&runtime, &storage_path, &written).await {
                    Ok(0) => {}
                    Ok(count) => debug!("Persisted {} component snapshot(s)", count),
                    Err(e) => error!("Snapshot persistence pass failed: {}", e),
                }
            }
        });

        Ok(())
    }

    /// Stop the background loop after a final persistence pass
    pub async fn stop(&mut self) {
        info!("Stopping snapshot store");

        if let Err(e) = persist_pass(&self.runtime, &self.storage_path, &self.written).await {
            error!("Final snapshot persistence pass failed: {}", e);
        }

        self.handles.abort_all();

        while let Some(result) = self.handles.join_next().await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    error!("Snapshot store task error: {}", e);
                }
            }
        }
    }

    /// Write every component whose state changed since its last write
    ///
    /// Files of components that were released are removed. Returns the
    /// number of snapshots written.
    pub async fn persist_changed(&self) -> RlcResult<usize> {
        ensure_storage_dir(&self.storage_path).await?;
        persist_pass(&self.runtime, &self.storage_path, &self.written).await
    }

    /// Load stored snapshots and stage them for hydration
    ///
    /// Call on startup, before clients reattach. Unreadable files are
    /// logged and skipped. Returns the number of snapshots staged.
    pub async fn load_all(&self) -> RlcResult<usize> {
        info!(
            "Loading snapshots from storage path: {:?}",
            self.storage_path
        );

        let mut entries = tokio::fs::read_dir(&self.storage_path).await?;
        let mut written = self.written.lock().await;
        let mut loaded = 0;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_snapshot = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(SNAPSHOT_EXTENSION));
            if !is_snapshot {
                continue;
            }

            match read_snapshot(&path).await {
                Ok(stored) => {
                    debug!("Loaded snapshot of '{}'", stored.component_id);
                    // Track the file so it is removed if the component never returns
                    written.insert(
                        stored.component_id.clone(),
                        stored.snapshot.checksum.clone(),
                    );
                    self.runtime
                        .stage_snapshot(stored.component_id, stored.snapshot);
                    loaded += 1;
                }
                Err(e) => error!("Failed to load snapshot from {:?}: {}", path, e),
            }
        }

        info!("Staged {} stored snapshot(s)", loaded);
        Ok(loaded)
    }
}

async fn ensure_storage_dir(storage_path: &Path) -> RlcResult<()> {
    if tokio::fs::try_exists(storage_path).await? {
        let metadata = tokio::fs::metadata(storage_path).await?;
        if !metadata.is_dir() {
            return Err(RlcError::Persistence(format!(
                "{:?} is not a directory",
                storage_path
            )));
        }
        return Ok(());
    }
    tokio::fs::create_dir_all(storage_path).await?;
    Ok(())
}

async fn persist_pass(
    runtime: &ComponentRuntime,
    storage_path: &Path,
    written: &Mutex<HashMap<String, String>>,
) -> RlcResult<usize> {
    let mut written = written.lock().await;
    let live = runtime.component_ids();
    let mut count = 0;

    for component_id in &live {
        let Ok(checksum) = runtime.checksum(component_id) else {
            continue;
        };
        if written.get(component_id) == Some(&checksum) {
            continue;
        }

        let (Ok(snapshot), Some(component_type), Some(revision)) = (
            runtime.snapshot(component_id),
            runtime.component_type_of(component_id),
            runtime.revision(component_id),
        ) else {
            // Released since the id list was taken
            continue;
        };

        let stored = StoredSnapshot {
            component_id: component_id.clone(),
            component_type,
            revision,
            snapshot,
        };

        match write_snapshot(storage_path, &stored).await {
            Ok(()) => {
                written.insert(component_id.clone(), stored.snapshot.checksum);
                count += 1;
            }
            Err(e) => error!("Failed to persist component '{}': {}", component_id, e),
        }
    }

    // Released components must start fresh, not from a stale file
    let released: Vec<String> = written
        .keys()
        .filter(|id| !live.contains(id))
        .cloned()
        .collect();
    for component_id in released {
        let path = snapshot_path(storage_path, &component_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!("Removed snapshot of released component '{}'", component_id),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                error!("Failed to remove {:?}: {}", path, e);
                continue;
            }
        }
        written.remove(&component_id);
    }

    Ok(count)
}

/// Persist a single snapshot to disk
async fn write_snapshot(storage_path: &Path, stored: &StoredSnapshot) -> RlcResult<()> {
    let file_path = snapshot_path(storage_path, &stored.component_id);
    let json_data = serde_json::to_string_pretty(stored)?;

    tokio::fs::write(&file_path, json_data).await?;

    Ok(())
}

async fn read_snapshot(file_path: &Path) -> RlcResult<StoredSnapshot> {
    let json_data = tokio::fs::read_to_string(file_path).await?;
    Ok(serde_json::from_str(&json_data)?)
}

fn snapshot_path(storage_path: &Path, component_id: &str) -> PathBuf {
    let file_stem: String = component_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    storage_path.join(format!("{}{}", file_stem, SNAPSHOT_EXTENSION))
}
