//! Index construction with process-wide build coordination.
//!
//! Building an index means a full sequential scan of the geometry file, so
//! at most one build per target index file runs at a time within the
//! process. A second caller arriving while a build is in flight waits in
//! bounded quanta for the first build to finish and then returns without
//! rebuilding; waiting longer than the configured cap is an error.
//!
//! The index is written to a `<target>.bld` temporary in the same directory
//! and moved over the target only once fully written and synced, so a crash
//! mid-build never corrupts a previously committed index.

use super::{IndexEntry, QuadTreeIndex, RTreeIndex, best_effort};
use crate::error::{Result, ShapeError};
use crate::shp::ShpReader;
use crate::types::{BoundingBox, BuildWaitConfig, ByteOrder, TreeConfig};
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Which index structure to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    RTree,
    QuadTree,
}

impl IndexKind {
    /// File extension of the persisted index.
    pub fn extension(self) -> &'static str {
        match self {
            IndexKind::RTree => "grx",
            IndexKind::QuadTree => "qix",
        }
    }
}

/// Outcome of a build request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    /// Records written into the index; zero when this caller waited out a
    /// concurrent build instead of performing one.
    pub records_indexed: u64,
    /// Path of the committed index file.
    pub index_path: PathBuf,
}

struct BuildState {
    done: Mutex<bool>,
    cv: Condvar,
}

static ACTIVE_BUILDS: Lazy<Mutex<FxHashMap<PathBuf, Arc<BuildState>>>> =
    Lazy::new(|| Mutex::new(FxHashMap::default()));

/// Removes the registry entry and wakes waiters when the build finishes,
/// successfully or not.
struct BuildGuard {
    key: PathBuf,
    state: Arc<BuildState>,
}

impl Drop for BuildGuard {
    fn drop(&mut self) {
        ACTIVE_BUILDS.lock().remove(&self.key);
        *self.state.done.lock() = true;
        self.state.cv.notify_all();
    }
}

/// Configurable builder for the persisted spatial indexes.
#[derive(Debug, Clone)]
pub struct IndexBuilder {
    kind: IndexKind,
    tree_config: TreeConfig,
    byte_order: ByteOrder,
    wait: BuildWaitConfig,
}

impl IndexBuilder {
    pub fn new(kind: IndexKind) -> Self {
        Self {
            kind,
            tree_config: TreeConfig::default(),
            byte_order: ByteOrder::default(),
            wait: BuildWaitConfig::default(),
        }
    }

    /// Node sizing and split policy for R-tree builds.
    pub fn with_tree_config(mut self, config: TreeConfig) -> Self {
        self.tree_config = config;
        self
    }

    /// Byte order for quad-tree index files.
    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    /// Poll quantum and cap for waiting on a concurrent build.
    pub fn with_wait_config(mut self, wait: BuildWaitConfig) -> Self {
        self.wait = wait;
        self
    }

    /// Build (or wait for) the index of `shp_path`'s geometry file.
    pub fn build<P: AsRef<Path>>(&self, shp_path: P) -> Result<BuildResult> {
        let shp_path = shp_path.as_ref();
        let canonical = shp_path.canonicalize()?;
        let key = canonical.with_extension(self.kind.extension());

        let mut registry = ACTIVE_BUILDS.lock();
        if let Some(state) = registry.get(&key) {
            let state = Arc::clone(state);
            drop(registry);
            self.wait_for(&state)?;
            return Ok(BuildResult {
                records_indexed: 0,
                index_path: key,
            });
        }

        let state = Arc::new(BuildState {
            done: Mutex::new(false),
            cv: Condvar::new(),
        });
        registry.insert(key.clone(), Arc::clone(&state));
        drop(registry);

        // Dropped on every exit path, so waiters always wake and the
        // registry entry never outlives the build.
        let guard = BuildGuard {
            key: key.clone(),
            state,
        };
        let records = self.run_build(&canonical, &key)?;
        drop(guard);

        Ok(BuildResult {
            records_indexed: records,
            index_path: key,
        })
    }

    /// Block in poll quanta until the in-flight build for `state` completes.
    fn wait_for(&self, state: &BuildState) -> Result<()> {
        let deadline = Instant::now() + self.wait.max_wait();
        let mut done = state.done.lock();
        while !*done {
            if Instant::now() >= deadline {
                return Err(ShapeError::BuildTimeout(self.wait.max_wait()));
            }
            state.cv.wait_for(&mut done, self.wait.poll());
        }
        Ok(())
    }

    fn run_build(&self, shp_path: &Path, target: &Path) -> Result<u64> {
        log::info!(
            "building {:?} index for {} -> {}",
            self.kind,
            shp_path.display(),
            target.display()
        );
        let started = Instant::now();

        let mut reader = ShpReader::open(shp_path)?;
        let mut items: Vec<(BoundingBox, IndexEntry)> = Vec::new();
        let mut bounds: Option<BoundingBox> = None;

        while let Some(record) = reader.read_record()? {
            let Some(bbox) = record.bbox()? else {
                // Null shapes have no extent and cannot be indexed.
                log::debug!("skipping record {} with no geometry", record.number);
                continue;
            };
            bounds = Some(match bounds {
                Some(acc) => acc.union(&bbox),
                None => bbox,
            });
            items.push((
                bbox,
                IndexEntry {
                    record_number: record.number,
                    offset: record.offset,
                },
            ));
        }

        let bounds = bounds.unwrap_or_else(|| BoundingBox::new(0.0, 0.0, 0.0, 0.0));
        let records = items.len() as u64;

        let temp = temp_path(target);
        let save_result = match self.kind {
            IndexKind::RTree => {
                let mut tree = RTreeIndex::new(self.tree_config.clone());
                for (bbox, entry) in items {
                    tree.insert(bbox, entry);
                }
                tree.save(&temp)
            }
            IndexKind::QuadTree => {
                let mut tree = QuadTreeIndex::new(bounds, records as u32, self.byte_order);
                for (bbox, entry) in items {
                    tree.insert(bbox, entry);
                }
                tree.save(&temp)
            }
        };
        if let Err(e) = save_result {
            best_effort(
                std::fs::remove_file(&temp).map_err(Into::into),
                "temp index cleanup",
            );
            return Err(e);
        }

        commit(&temp, target)?;
        log::info!(
            "indexed {} records into {} in {:?}",
            records,
            target.display(),
            started.elapsed()
        );
        Ok(records)
    }
}

/// Temporary file the index is staged in before commit, alongside the target.
fn temp_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".bld");
    PathBuf::from(name)
}

/// Move the fully written temp file over the target. Rename overwrites
/// atomically, so any previous index stays readable until the new file has
/// fully replaced it; if the filesystem refuses the rename, fall back to a
/// byte copy. The temp file never survives, whether the commit succeeds or
/// fails.
fn commit(temp: &Path, target: &Path) -> Result<()> {
    let rename_err = match std::fs::rename(temp, target) {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };

    log::warn!(
        "rename of {} failed ({rename_err}), copying instead",
        temp.display()
    );
    let outcome = match std::fs::copy(temp, target) {
        Ok(_) => Ok(()),
        Err(copy_err) => Err(ShapeError::Commit {
            path: target.display().to_string(),
            reason: format!("rename failed ({rename_err}) and copy failed ({copy_err})"),
        }),
    };
    best_effort(
        std::fs::remove_file(temp).map_err(Into::into),
        "temp index cleanup",
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::SpatialIndex;
    use crate::shp::ShpWriter;
    use crate::types::ShapeType;
    use tempfile::tempdir;

    fn write_points(path: &Path, count: usize) {
        let mut writer = ShpWriter::create(path, ShapeType::Point).unwrap();
        for i in 0..count {
            writer.append_point(i as f64, i as f64).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_build_rtree_and_query() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("points.shp");
        write_points(&path, 30);

        let result = IndexBuilder::new(IndexKind::RTree).build(&path).unwrap();
        assert_eq!(result.records_indexed, 30);
        assert_eq!(result.index_path.extension().unwrap(), "grx");

        let tree = RTreeIndex::open(&result.index_path).unwrap().unwrap();
        let hits = tree
            .query(&BoundingBox::new(4.5, 4.5, 6.5, 6.5))
            .unwrap();
        let numbers: Vec<_> = hits.iter().map(|e| e.record_number).collect();
        assert_eq!(numbers, vec![6, 7]);
    }

    #[test]
    fn test_build_quadtree_and_query() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("points.shp");
        write_points(&path, 30);

        let result = IndexBuilder::new(IndexKind::QuadTree)
            .with_byte_order(ByteOrder::BigEndian)
            .build(&path)
            .unwrap();
        assert_eq!(result.records_indexed, 30);

        let tree = QuadTreeIndex::open(&result.index_path).unwrap().unwrap();
        assert_eq!(tree.byte_order(), ByteOrder::BigEndian);
        let hits = tree
            .query(&BoundingBox::new(9.5, 9.5, 10.5, 10.5))
            .unwrap();
        assert!(hits.iter().any(|e| e.record_number == 11));
    }

    #[test]
    fn test_rebuild_replaces_existing_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("points.shp");
        write_points(&path, 5);

        let builder = IndexBuilder::new(IndexKind::RTree);
        builder.build(&path).unwrap();

        write_points(&path, 12);
        let result = builder.build(&path).unwrap();
        assert_eq!(result.records_indexed, 12);

        let tree = RTreeIndex::open(&result.index_path).unwrap().unwrap();
        assert_eq!(tree.len(), 12);
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("points.shp");
        write_points(&path, 8);

        let result = IndexBuilder::new(IndexKind::QuadTree).build(&path).unwrap();
        assert!(!temp_path(&result.index_path).exists());
    }

    #[test]
    fn test_concurrent_build_runs_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("points.shp");
        write_points(&path, 2000);

        let builder = IndexBuilder::new(IndexKind::RTree).with_wait_config(
            BuildWaitConfig::default().with_poll(std::time::Duration::from_millis(10)),
        );
        let results: Vec<BuildResult> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let builder = builder.clone();
                    let path = path.clone();
                    s.spawn(move || builder.build(&path).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        // Exactly one thread performed the scan; the rest waited it out.
        let performed: Vec<_> = results
            .iter()
            .filter(|r| r.records_indexed == 2000)
            .collect();
        assert_eq!(performed.len(), 1);
        assert!(results.iter().all(|r| {
            r.records_indexed == 2000 || r.records_indexed == 0
        }));

        let tree = RTreeIndex::open(&results[0].index_path).unwrap().unwrap();
        assert_eq!(tree.len(), 2000);
    }

    #[test]
    fn test_failed_commit_keeps_existing_target() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("points.shp");
        write_points(&path, 10);

        // A directory squatting on the target path defeats both the rename
        // and the copy fallback.
        let target = path.canonicalize().unwrap().with_extension("grx");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("keep"), b"x").unwrap();

        let err = IndexBuilder::new(IndexKind::RTree).build(&path).unwrap_err();
        assert!(matches!(err, ShapeError::Commit { .. }));

        // The failed commit left the target alone and cleaned its temp file.
        assert!(target.is_dir());
        assert_eq!(std::fs::read(target.join("keep")).unwrap(), b"x");
        assert!(!temp_path(&target).exists());
    }

    #[test]
    fn test_missing_geometry_file_is_io_error() {
        let dir = tempdir().unwrap();
        let err = IndexBuilder::new(IndexKind::RTree)
            .build(dir.path().join("absent.shp"))
            .unwrap_err();
        assert!(matches!(err, ShapeError::Io(_)));
    }
}
