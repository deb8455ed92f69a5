//! Append-only progress ledger
//!
//! One JSON-lines file per partition under the ledger directory. Records are
//! only ever appended; [`ProgressLedger::load`] replays a partition in file
//! order and keeps the last record per unit, so host clock changes cannot
//! reorder progress. A torn final line (crash mid-write) is skipped with a
//! warning.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use super::types::{ProgressRecord, WorkUnitStatus};
use crate::error::{HarvestError, Result};

const LEDGER_EXTENSION: &str = "jsonl";

pub struct ProgressLedger {
    dir: PathBuf,
    target_per_unit: u64,
    write_lock: Mutex<()>,
}

impl ProgressLedger {
    /// Open (creating if needed) the ledger directory
    pub fn open(dir: impl Into<PathBuf>, target_per_unit: u64) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            HarvestError::Ledger(format!("failed to create {}: {}", dir.display(), e))
        })?;
        Ok(Self {
            dir,
            target_per_unit,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn target_per_unit(&self) -> u64 {
        self.target_per_unit
    }

    fn partition_path(&self, partition: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", sanitize_segment(partition), LEDGER_EXTENSION))
    }

    /// Append one record and sync it to disk
    pub fn append(&self, record: &ProgressRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let path = self.partition_path(&record.partition);
        let _guard = self.write_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| HarvestError::Ledger(format!("failed to open {}: {}", path.display(), e)))?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;

        tracing::debug!(
            partition = %record.partition,
            unit_id = %record.unit_id,
            status = %record.status,
            records_so_far = record.records_so_far,
            "Progress recorded"
        );
        Ok(())
    }

    /// Latest record per unit for one partition; empty if never written
    pub fn load(&self, partition: &str) -> Result<HashMap<String, ProgressRecord>> {
        let path = self.partition_path(partition);
        let mut latest = HashMap::new();
        for record in read_records(&path)? {
            if record.partition == partition {
                merge_latest(&mut latest, record);
            }
        }
        Ok(latest)
    }

    /// Every partition in the ledger directory, reduced like [`Self::load`]
    pub fn load_all(&self) -> Result<BTreeMap<String, HashMap<String, ProgressRecord>>> {
        let mut partitions: BTreeMap<String, HashMap<String, ProgressRecord>> = BTreeMap::new();

        let entries = fs::read_dir(&self.dir).map_err(|e| {
            HarvestError::Ledger(format!("failed to read {}: {}", self.dir.display(), e))
        })?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == LEDGER_EXTENSION))
            .collect();
        paths.sort();

        for path in paths {
            for record in read_records(&path)? {
                merge_latest(partitions.entry(record.partition.clone()).or_default(), record);
            }
        }
        Ok(partitions)
    }

    /// Whether a unit needs no further work
    pub fn is_complete(&self, record: &ProgressRecord) -> bool {
        is_complete(record, self.target_per_unit)
    }
}

pub fn is_complete(record: &ProgressRecord, target_per_unit: u64) -> bool {
    record.status == WorkUnitStatus::Completed || record.records_so_far >= target_per_unit
}

/// The later line wins; `recorded_at` is informational only
fn merge_latest(latest: &mut HashMap<String, ProgressRecord>, record: ProgressRecord) {
    latest.insert(record.unit_id.clone(), record);
}

fn read_records(path: &Path) -> Result<Vec<ProgressRecord>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(HarvestError::Ledger(format!(
                "failed to open {}: {}",
                path.display(),
                e
            )))
        },
    };

    let mut records = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ProgressRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => tracing::warn!(
                path = %path.display(),
                line = index + 1,
                error = %e,
                "Skipping malformed ledger line"
            ),
        }
    }
    Ok(records)
}

fn sanitize_segment(value: &str) -> String {
    let out: String = value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() {
        "_".to_string()
    } else {
        out
    }
}
