//! Core types shared across the codec, indexes, and query layers.

use crate::error::{Result, ShapeError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A 2D axis-aligned bounding box.
///
/// Wraps `geo::Rect` with the accessors and set operations the codec and the
/// spatial indexes need. Coordinates are whatever the shapefile stores;
/// no coordinate system semantics are attached.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    /// The underlying geometric rectangle
    pub rect: geo::Rect,
}

impl BoundingBox {
    /// Create a bounding box from minimum and maximum coordinates.
    ///
    /// # Examples
    ///
    /// ```
    /// use shapedex::BoundingBox;
    ///
    /// let bbox = BoundingBox::new(-74.0, 40.7, -73.9, 40.8);
    /// assert_eq!(bbox.width(), 0.1);
    /// ```
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            rect: geo::Rect::new(
                geo::coord! { x: min_x, y: min_y },
                geo::coord! { x: max_x, y: max_y },
            ),
        }
    }

    /// Get the minimum x coordinate.
    pub fn min_x(&self) -> f64 {
        self.rect.min().x
    }

    /// Get the minimum y coordinate.
    pub fn min_y(&self) -> f64 {
        self.rect.min().y
    }

    /// Get the maximum x coordinate.
    pub fn max_x(&self) -> f64 {
        self.rect.max().x
    }

    /// Get the maximum y coordinate.
    pub fn max_y(&self) -> f64 {
        self.rect.max().y
    }

    /// Get the width of the bounding box.
    pub fn width(&self) -> f64 {
        self.max_x() - self.min_x()
    }

    /// Get the height of the bounding box.
    pub fn height(&self) -> f64 {
        self.max_y() - self.min_y()
    }

    /// All four coordinates are finite numbers.
    pub fn is_finite(&self) -> bool {
        [self.min_x(), self.min_y(), self.max_x(), self.max_y()]
            .iter()
            .all(|v| v.is_finite())
    }

    /// Check if this bounding box intersects with another.
    ///
    /// Touching edges count as an intersection.
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        !(self.max_x() < other.min_x()
            || self.min_x() > other.max_x()
            || self.max_y() < other.min_y()
            || self.min_y() > other.max_y())
    }

    /// Check if this bounding box fully contains another.
    pub fn contains(&self, other: &BoundingBox) -> bool {
        self.min_x() <= other.min_x()
            && self.min_y() <= other.min_y()
            && self.max_x() >= other.max_x()
            && self.max_y() >= other.max_y()
    }

    /// The smallest bounding box containing both `self` and `other`.
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox::new(
            self.min_x().min(other.min_x()),
            self.min_y().min(other.min_y()),
            self.max_x().max(other.max_x()),
            self.max_y().max(other.max_y()),
        )
    }

    /// Area of the bounding box. Degenerate boxes have zero area.
    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    /// Area the box would have after growing to include `other`.
    pub fn enlarged_area(&self, other: &BoundingBox) -> f64 {
        self.union(other).area()
    }

    /// Split into four quadrants by the midpoint, ordered
    /// [south-west, south-east, north-west, north-east].
    pub fn quadrants(&self) -> [BoundingBox; 4] {
        let mid_x = (self.min_x() + self.max_x()) / 2.0;
        let mid_y = (self.min_y() + self.max_y()) / 2.0;
        [
            BoundingBox::new(self.min_x(), self.min_y(), mid_x, mid_y),
            BoundingBox::new(mid_x, self.min_y(), self.max_x(), mid_y),
            BoundingBox::new(self.min_x(), mid_y, mid_x, self.max_y()),
            BoundingBox::new(mid_x, mid_y, self.max_x(), self.max_y()),
        ]
    }
}

/// Shapefile geometry type codes.
///
/// The numeric values are the on-disk codes from the shapefile format and
/// must not be changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ShapeType {
    Null = 0,
    Point = 1,
    PolyLine = 3,
    Polygon = 5,
    MultiPoint = 8,
    PointZ = 11,
    PolyLineZ = 13,
    PolygonZ = 15,
    MultiPointZ = 18,
    PointM = 21,
    PolyLineM = 23,
    PolygonM = 25,
    MultiPointM = 28,
}

impl ShapeType {
    /// Decode an on-disk type code.
    pub fn from_code(code: i32) -> Result<Self> {
        Ok(match code {
            0 => Self::Null,
            1 => Self::Point,
            3 => Self::PolyLine,
            5 => Self::Polygon,
            8 => Self::MultiPoint,
            11 => Self::PointZ,
            13 => Self::PolyLineZ,
            15 => Self::PolygonZ,
            18 => Self::MultiPointZ,
            21 => Self::PointM,
            23 => Self::PolyLineM,
            25 => Self::PolygonM,
            28 => Self::MultiPointM,
            other => return Err(ShapeError::InvalidShapeType(other)),
        })
    }

    /// The on-disk type code.
    pub fn code(&self) -> i32 {
        *self as i32
    }

    /// Whether records of this type carry a single coordinate pair rather
    /// than an embedded bounding box.
    pub fn is_point(&self) -> bool {
        matches!(self, Self::Point | Self::PointZ | Self::PointM)
    }

    /// Whether records of this type carry Z ordinates.
    pub fn has_z(&self) -> bool {
        matches!(
            self,
            Self::PointZ | Self::PolyLineZ | Self::PolygonZ | Self::MultiPointZ
        )
    }

    /// Whether records of this type carry M ordinates. Z types always do.
    pub fn has_m(&self) -> bool {
        self.has_z()
            || matches!(
                self,
                Self::PointM | Self::PolyLineM | Self::PolygonM | Self::MultiPointM
            )
    }
}

/// Node split policy for the R-tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SplitPolicy {
    /// Quadratic pick-seeds split (recommended default)
    #[default]
    Quadratic,
    /// Linear pick-seeds split (faster build, worse query envelopes)
    Linear,
}

/// Build parameters for the R-tree index.
///
/// # Example
///
/// ```rust
/// use shapedex::{SplitPolicy, TreeConfig};
///
/// let config = TreeConfig::default();
/// assert_eq!(config.max_entries, 50);
///
/// let json = r#"{ "split_policy": "linear" }"#;
/// let config: TreeConfig = serde_json::from_str(json).unwrap();
/// assert_eq!(config.split_policy, SplitPolicy::Linear);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Maximum entries per node before a split
    #[serde(default = "TreeConfig::default_max_entries")]
    pub max_entries: usize,

    /// Minimum entries assigned to each half of a split
    #[serde(default = "TreeConfig::default_min_entries")]
    pub min_entries: usize,

    /// Split policy applied when a node overflows
    #[serde(default)]
    pub split_policy: SplitPolicy,
}

impl TreeConfig {
    const fn default_max_entries() -> usize {
        50
    }

    const fn default_min_entries() -> usize {
        25
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        assert!(max_entries >= 2, "R-tree nodes need at least 2 entries");
        self.max_entries = max_entries;
        self.min_entries = self.min_entries.min(max_entries / 2);
        self
    }

    pub fn with_min_entries(mut self, min_entries: usize) -> Self {
        assert!(
            min_entries >= 1 && min_entries <= self.max_entries / 2,
            "min_entries must be in 1..=max_entries/2"
        );
        self.min_entries = min_entries;
        self
    }

    pub fn with_split_policy(mut self, policy: SplitPolicy) -> Self {
        self.split_policy = policy;
        self
    }
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_entries: Self::default_max_entries(),
            min_entries: Self::default_min_entries(),
            split_policy: SplitPolicy::default(),
        }
    }
}

/// Wait parameters for threads that find an index build already in progress.
///
/// The defaults (2 second poll quantum, 5 minute cap) reproduce the behavior
/// of existing shapefile tooling and are configurable rather than tuned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildWaitConfig {
    /// Seconds between checks on the other builder's progress
    #[serde(default = "BuildWaitConfig::default_poll_seconds")]
    pub poll_seconds: f64,

    /// Total seconds to wait before giving up with a timeout error
    #[serde(default = "BuildWaitConfig::default_max_wait_seconds")]
    pub max_wait_seconds: f64,
}

impl BuildWaitConfig {
    const fn default_poll_seconds() -> f64 {
        2.0
    }

    const fn default_max_wait_seconds() -> f64 {
        300.0
    }

    /// Poll quantum as a [`Duration`].
    pub fn poll(&self) -> Duration {
        Duration::from_secs_f64(self.poll_seconds)
    }

    /// Maximum total wait as a [`Duration`].
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs_f64(self.max_wait_seconds)
    }

    pub fn with_poll(mut self, quantum: Duration) -> Self {
        self.poll_seconds = quantum.as_secs_f64();
        self
    }

    pub fn with_max_wait(mut self, max: Duration) -> Self {
        self.max_wait_seconds = max.as_secs_f64();
        self
    }
}

impl Default for BuildWaitConfig {
    fn default() -> Self {
        Self {
            poll_seconds: Self::default_poll_seconds(),
            max_wait_seconds: Self::default_max_wait_seconds(),
        }
    }
}

/// Byte order flag persisted in the quad-tree index header.
///
/// Chosen at build time and honored on every subsequent read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// Little-endian node records ("NL")
    #[default]
    LittleEndian,
    /// Big-endian node records ("NM")
    BigEndian,
}

impl ByteOrder {
    /// On-disk flag byte.
    pub(crate) fn flag(&self) -> u8 {
        match self {
            Self::LittleEndian => b'L',
            Self::BigEndian => b'M',
        }
    }

    pub(crate) fn from_flag(flag: u8) -> Option<Self> {
        match flag {
            b'L' => Some(Self::LittleEndian),
            b'M' => Some(Self::BigEndian),
            _ => None,
        }
    }
}
