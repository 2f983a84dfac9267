//! Persisted R-tree index (`.grx`).
//!
//! Built once by insertion during an index build, serialized depth-first,
//! and loaded read-only for queries. Node capacity and the split policy are
//! build parameters; the file layout is private to this crate.

use super::{Decoder, Encoder, IndexEntry, SpatialIndex, sort_candidates};
use crate::error::{Result, ShapeError};
use crate::types::{BoundingBox, ByteOrder, SplitPolicy, TreeConfig};
use std::fs::File;
use std::io::Write;
use std::path::Path;

const GRX_MAGIC: [u8; 4] = *b"GRX1";

const TAG_LEAF: u8 = 0;
const TAG_BRANCH: u8 = 1;

/// A leaf-level record reference with the bounding box it was indexed under.
#[derive(Debug, Clone, Copy)]
struct LeafEntry {
    bbox: BoundingBox,
    entry: IndexEntry,
}

#[derive(Debug)]
enum Node {
    Leaf {
        bbox: BoundingBox,
        entries: Vec<LeafEntry>,
    },
    Branch {
        bbox: BoundingBox,
        children: Vec<Node>,
    },
}

trait Bounded {
    fn bounds(&self) -> BoundingBox;
}

impl Bounded for LeafEntry {
    fn bounds(&self) -> BoundingBox {
        self.bbox
    }
}

impl Bounded for Node {
    fn bounds(&self) -> BoundingBox {
        match self {
            Node::Leaf { bbox, .. } | Node::Branch { bbox, .. } => *bbox,
        }
    }
}

/// R-tree over shapefile record bounding boxes.
#[derive(Debug)]
pub struct RTreeIndex {
    config: TreeConfig,
    root: Option<Node>,
    len: usize,
}

impl RTreeIndex {
    /// An empty tree ready for build-time insertion.
    pub fn new(config: TreeConfig) -> Self {
        Self {
            config,
            root: None,
            len: 0,
        }
    }

    /// The build parameters this tree was created or loaded with.
    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// Insert one record reference. Only used at build time; the tree is
    /// read-only once persisted.
    pub fn insert(&mut self, bbox: BoundingBox, entry: IndexEntry) {
        let item = LeafEntry { bbox, entry };
        match self.root.take() {
            None => {
                self.root = Some(Node::Leaf {
                    bbox,
                    entries: vec![item],
                });
            }
            Some(mut root) => {
                if let Some(sibling) = insert_into(&mut root, item, &self.config) {
                    let bbox = root.bounds().union(&sibling.bounds());
                    root = Node::Branch {
                        bbox,
                        children: vec![root, sibling],
                    };
                }
                self.root = Some(root);
            }
        }
        self.len += 1;
    }

    /// Serialize the tree to `path`, truncating any existing file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        // The R-tree file is always big-endian.
        let mut enc = Encoder::new(ByteOrder::BigEndian);
        enc.buf.extend_from_slice(&GRX_MAGIC);
        enc.put_u8(match self.config.split_policy {
            SplitPolicy::Quadratic => 0,
            SplitPolicy::Linear => 1,
        });
        enc.put_u32(self.config.max_entries as u32);
        enc.put_u32(self.config.min_entries as u32);
        enc.put_u64(self.len as u64);
        match &self.root {
            Some(root) => {
                enc.put_u8(1);
                encode_node(&mut enc, root);
            }
            None => enc.put_u8(0),
        }

        let mut file = File::create(path)?;
        file.write_all(&enc.buf)?;
        file.sync_all()?;
        Ok(())
    }

    /// Load a persisted tree. `Ok(None)` means no index file exists, the
    /// common cold-start case; the caller decides whether to build one or
    /// scan unindexed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read(path)?;
        Ok(Some(Self::decode(&data)?))
    }

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 || data[0..4] != GRX_MAGIC {
            return Err(ShapeError::Format(
                "not an R-tree index file: bad magic".into(),
            ));
        }

        let mut dec = Decoder::new(ByteOrder::BigEndian, &data[4..]);
        let split_policy = match dec.u8()? {
            0 => SplitPolicy::Quadratic,
            1 => SplitPolicy::Linear,
            other => {
                return Err(ShapeError::Format(format!(
                    "unknown R-tree split policy code {other}"
                )));
            }
        };
        let max_entries = dec.u32()? as usize;
        let min_entries = dec.u32()? as usize;
        let declared_len = dec.u64()? as usize;

        let root = if dec.u8()? == 1 {
            Some(decode_node(&mut dec)?)
        } else {
            None
        };

        let len = root.as_ref().map_or(0, count_entries);
        if len != declared_len {
            return Err(ShapeError::Format(format!(
                "R-tree entry count mismatch: header says {declared_len}, tree has {len}"
            )));
        }

        Ok(Self {
            config: TreeConfig {
                max_entries,
                min_entries,
                split_policy,
            },
            root,
            len,
        })
    }
}

impl SpatialIndex for RTreeIndex {
    fn bounds(&self) -> BoundingBox {
        self.root
            .as_ref()
            .map_or_else(|| BoundingBox::new(0.0, 0.0, 0.0, 0.0), Bounded::bounds)
    }

    fn len(&self) -> usize {
        self.len
    }

    fn query(&self, bbox: &BoundingBox) -> Result<Vec<IndexEntry>> {
        let Some(root) = &self.root else {
            return Ok(Vec::new());
        };
        if !bbox.is_finite() {
            log::warn!("rejecting R-tree query with non-finite bounding box");
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        if bbox.contains(&root.bounds()) {
            // The query covers everything the tree holds; filtering per node
            // gains nothing.
            collect_all(root, &mut out);
        } else {
            collect_intersecting(root, bbox, &mut out);
        }
        sort_candidates(&mut out);
        Ok(out)
    }
}

fn insert_into(node: &mut Node, item: LeafEntry, config: &TreeConfig) -> Option<Node> {
    match node {
        Node::Leaf { bbox, entries } => {
            *bbox = bbox.union(&item.bbox);
            entries.push(item);
            if entries.len() <= config.max_entries {
                return None;
            }
            let items = std::mem::take(entries);
            let (keep, spill) = split_items(items, config);
            *bbox = bbox_of(&keep);
            *entries = keep;
            Some(Node::Leaf {
                bbox: bbox_of(&spill),
                entries: spill,
            })
        }
        Node::Branch { bbox, children } => {
            *bbox = bbox.union(&item.bbox);
            let target = choose_child(children, &item.bbox);
            let sibling = insert_into(&mut children[target], item, config)?;
            children.push(sibling);
            if children.len() <= config.max_entries {
                return None;
            }
            let items = std::mem::take(children);
            let (keep, spill) = split_items(items, config);
            *bbox = bbox_of(&keep);
            *children = keep;
            Some(Node::Branch {
                bbox: bbox_of(&spill),
                children: spill,
            })
        }
    }
}

/// Child whose envelope grows least when taking `bbox`; ties go to the
/// smaller envelope.
fn choose_child(children: &[Node], bbox: &BoundingBox) -> usize {
    let mut best = 0;
    let mut best_growth = f64::INFINITY;
    let mut best_area = f64::INFINITY;
    for (i, child) in children.iter().enumerate() {
        let area = child.bounds().area();
        let growth = child.bounds().enlarged_area(bbox) - area;
        if growth < best_growth || (growth == best_growth && area < best_area) {
            best = i;
            best_growth = growth;
            best_area = area;
        }
    }
    best
}

fn bbox_of<T: Bounded>(items: &[T]) -> BoundingBox {
    let mut iter = items.iter();
    let first = iter
        .next()
        .expect("split groups always hold at least one item")
        .bounds();
    iter.fold(first, |acc, item| acc.union(&item.bounds()))
}

fn split_items<T: Bounded>(mut items: Vec<T>, config: &TreeConfig) -> (Vec<T>, Vec<T>) {
    let min = config.min_entries.clamp(1, config.max_entries / 2);

    let (a, b) = match config.split_policy {
        SplitPolicy::Quadratic => pick_seeds_quadratic(&items),
        SplitPolicy::Linear => pick_seeds_linear(&items),
    };
    let (hi, lo) = if a > b { (a, b) } else { (b, a) };
    let seed_b = items.swap_remove(hi);
    let seed_a = items.swap_remove(lo);

    let mut bbox_a = seed_a.bounds();
    let mut bbox_b = seed_b.bounds();
    let mut group_a = vec![seed_a];
    let mut group_b = vec![seed_b];

    while let Some(item) = {
        // Once one group must absorb everything left to reach the minimum,
        // stop choosing and hand the remainder over.
        if group_a.len() + items.len() <= min {
            group_a.extend(items.drain(..).inspect(|i| bbox_a = bbox_a.union(&i.bounds())));
            None
        } else if group_b.len() + items.len() <= min {
            group_b.extend(items.drain(..).inspect(|i| bbox_b = bbox_b.union(&i.bounds())));
            None
        } else if items.is_empty() {
            None
        } else {
            let next = match config.split_policy {
                SplitPolicy::Quadratic => pick_next_quadratic(&items, &bbox_a, &bbox_b),
                SplitPolicy::Linear => 0,
            };
            Some(items.swap_remove(next))
        }
    } {
        let growth_a = bbox_a.enlarged_area(&item.bounds()) - bbox_a.area();
        let growth_b = bbox_b.enlarged_area(&item.bounds()) - bbox_b.area();
        let take_a = growth_a < growth_b
            || (growth_a == growth_b
                && (bbox_a.area() < bbox_b.area()
                    || (bbox_a.area() == bbox_b.area() && group_a.len() <= group_b.len())));
        if take_a {
            bbox_a = bbox_a.union(&item.bounds());
            group_a.push(item);
        } else {
            bbox_b = bbox_b.union(&item.bounds());
            group_b.push(item);
        }
    }

    (group_a, group_b)
}

/// Quadratic pick-seeds: the pair wasting the most area when paired.
fn pick_seeds_quadratic<T: Bounded>(items: &[T]) -> (usize, usize) {
    let mut best = (0, 1);
    let mut worst_waste = f64::NEG_INFINITY;
    for i in 0..items.len() {
        for j in (i + 1)..items.len() {
            let a = items[i].bounds();
            let b = items[j].bounds();
            let waste = a.enlarged_area(&b) - a.area() - b.area();
            if waste > worst_waste {
                worst_waste = waste;
                best = (i, j);
            }
        }
    }
    best
}

/// Linear pick-seeds: extremes with the greatest normalized separation
/// along either axis.
fn pick_seeds_linear<T: Bounded>(items: &[T]) -> (usize, usize) {
    let mut highest_min_x = 0;
    let mut lowest_max_x = 0;
    let mut highest_min_y = 0;
    let mut lowest_max_y = 0;
    let mut total = items[0].bounds();

    for (i, item) in items.iter().enumerate() {
        let b = item.bounds();
        total = total.union(&b);
        if b.min_x() > items[highest_min_x].bounds().min_x() {
            highest_min_x = i;
        }
        if b.max_x() < items[lowest_max_x].bounds().max_x() {
            lowest_max_x = i;
        }
        if b.min_y() > items[highest_min_y].bounds().min_y() {
            highest_min_y = i;
        }
        if b.max_y() < items[lowest_max_y].bounds().max_y() {
            lowest_max_y = i;
        }
    }

    let sep_x = (items[highest_min_x].bounds().min_x() - items[lowest_max_x].bounds().max_x()).abs()
        / total.width().max(f64::MIN_POSITIVE);
    let sep_y = (items[highest_min_y].bounds().min_y() - items[lowest_max_y].bounds().max_y()).abs()
        / total.height().max(f64::MIN_POSITIVE);

    let (a, b) = if sep_x >= sep_y {
        (highest_min_x, lowest_max_x)
    } else {
        (highest_min_y, lowest_max_y)
    };
    if a == b {
        // Degenerate input (identical boxes); any distinct pair works.
        (0, 1)
    } else {
        (a, b)
    }
}

/// Quadratic pick-next: the item with the strongest preference for one group.
fn pick_next_quadratic<T: Bounded>(
    items: &[T],
    bbox_a: &BoundingBox,
    bbox_b: &BoundingBox,
) -> usize {
    let mut best = 0;
    let mut best_diff = f64::NEG_INFINITY;
    for (i, item) in items.iter().enumerate() {
        let growth_a = bbox_a.enlarged_area(&item.bounds()) - bbox_a.area();
        let growth_b = bbox_b.enlarged_area(&item.bounds()) - bbox_b.area();
        let diff = (growth_a - growth_b).abs();
        if diff > best_diff {
            best_diff = diff;
            best = i;
        }
    }
    best
}

fn collect_all(node: &Node, out: &mut Vec<IndexEntry>) {
    match node {
        Node::Leaf { entries, .. } => out.extend(entries.iter().map(|e| e.entry)),
        Node::Branch { children, .. } => {
            for child in children {
                collect_all(child, out);
            }
        }
    }
}

fn collect_intersecting(node: &Node, bbox: &BoundingBox, out: &mut Vec<IndexEntry>) {
    match node {
        Node::Leaf { entries, .. } => {
            out.extend(
                entries
                    .iter()
                    .filter(|e| e.bbox.intersects(bbox))
                    .map(|e| e.entry),
            );
        }
        Node::Branch { children, .. } => {
            for child in children {
                if child.bounds().intersects(bbox) {
                    collect_intersecting(child, bbox, out);
                }
            }
        }
    }
}

fn count_entries(node: &Node) -> usize {
    match node {
        Node::Leaf { entries, .. } => entries.len(),
        Node::Branch { children, .. } => children.iter().map(count_entries).sum(),
    }
}

fn encode_node(enc: &mut Encoder, node: &Node) {
    match node {
        Node::Leaf { bbox, entries } => {
            enc.put_u8(TAG_LEAF);
            enc.put_bbox(bbox);
            enc.put_u32(entries.len() as u32);
            for e in entries {
                enc.put_bbox(&e.bbox);
                enc.put_u32(e.entry.record_number);
                enc.put_u64(e.entry.offset);
            }
        }
        Node::Branch { bbox, children } => {
            enc.put_u8(TAG_BRANCH);
            enc.put_bbox(bbox);
            enc.put_u32(children.len() as u32);
            for child in children {
                encode_node(enc, child);
            }
        }
    }
}

fn decode_node(dec: &mut Decoder<'_>) -> Result<Node> {
    let tag = dec.u8()?;
    let bbox = dec.bbox()?;
    let count = dec.u32()? as usize;
    match tag {
        TAG_LEAF => {
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let bbox = dec.bbox()?;
                let record_number = dec.u32()?;
                let offset = dec.u64()?;
                entries.push(LeafEntry {
                    bbox,
                    entry: IndexEntry {
                        record_number,
                        offset,
                    },
                });
            }
            Ok(Node::Leaf { bbox, entries })
        }
        TAG_BRANCH => {
            let mut children = Vec::with_capacity(count);
            for _ in 0..count {
                children.push(decode_node(dec)?);
            }
            Ok(Node::Branch { bbox, children })
        }
        other => Err(ShapeError::Format(format!(
            "unknown R-tree node tag {other}"
        ))),
    }
}
