//! Indexed access to shapefile geometry with sidecar spatial indexes.
//!
//! ## Features
//! - **Geometry codec**: Streaming reader and two-phase writer for `.shp`
//!   files and their `.shx` offset sidecars, mixed endianness handled
//! - **Spatial indexes**: Persisted R-tree (`.grx`) and quad-tree (`.qix`)
//!   built by a full scan, queried read-only in ascending record order
//! - **Feature-id index**: `.fix` log mapping feature ids to records,
//!   searched with predictive interpolation
//! - **Coordinated builds**: At most one index build per target file per
//!   process; concurrent callers wait with a bounded timeout
//!
//! ## Query behavior
//! Index queries are **candidate generators**: they may return a superset of
//! the records intersecting the query box, never a subset. [`ShapeStore`]
//! verifies each candidate's actual extent, and downgrades to a full scan
//! whenever the selected index cannot be loaded or queried.
//!
//! ```no_run
//! use shapedex::{BoundingBox, IndexBuilder, IndexKind, ShapeStore, ShapeType, ShpWriter};
//!
//! let mut writer = ShpWriter::create("cities.shp", ShapeType::Point)?;
//! writer.append_point(-74.0060, 40.7128)?;
//! writer.append_point(2.3522, 48.8566)?;
//! writer.finalize()?;
//!
//! IndexBuilder::new(IndexKind::RTree).build("cities.shp")?;
//!
//! let store = ShapeStore::open("cities.shp")?;
//! let hudson = BoundingBox::new(-75.0, 40.0, -73.0, 41.0);
//! for record in store.records(Some(hudson))? {
//!     println!("record {}", record?.number);
//! }
//! # Ok::<(), shapedex::ShapeError>(())
//! ```

pub mod error;
pub mod fid;
pub mod index;
pub mod query;
pub mod shp;
pub mod types;

pub use error::{Result, ShapeError};

pub use shp::{ShpHeader, ShpReader, ShpRecord, ShpWriter, ShxReader};

pub use fid::{FidEntry, FidHeader, FidReader, FidSearcher, FidWriter};

pub use index::{
    BuildResult, IndexBuilder, IndexEntry, IndexKind, QuadTreeIndex, RTreeIndex, SpatialIndex,
};

pub use query::{IndexSelection, RecordIter, ShapeStore, StoreStats};

pub use types::{
    BoundingBox, BuildWaitConfig, ByteOrder, ShapeType, SplitPolicy, TreeConfig,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common imports
pub mod prelude {

    pub use crate::{Result, ShapeError};

    pub use crate::{ShpReader, ShpRecord, ShpWriter};

    pub use crate::{BuildResult, IndexBuilder, IndexKind, SpatialIndex};

    pub use crate::{IndexSelection, ShapeStore};

    pub use crate::{BoundingBox, ShapeType, TreeConfig};
}
