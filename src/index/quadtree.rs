//! Persisted quad-tree index (`.qix`).
//!
//! The tree is fixed at build time to the geometry file's record count and
//! global bounding box. Nodes split space 4-way at the midpoint; an entry is
//! stored at the shallowest node whose quadrant fully contains its bounding
//! box. The file header carries a byte-order flag chosen at build time that
//! every subsequent read honors.

use super::{Decoder, Encoder, IndexEntry, SpatialIndex, sort_candidates};
use crate::error::{Result, ShapeError};
use crate::types::{BoundingBox, ByteOrder};
use std::fs::File;
use std::io::Write;
use std::path::Path;

const QIX_MAGIC: [u8; 3] = *b"SQT";

/// Depth cap regardless of record count; 4^16 leaves is beyond any shapefile.
const MAX_DEPTH_CAP: u32 = 16;

#[derive(Debug, Default)]
struct QuadNode {
    entries: Vec<IndexEntry>,
    children: [Option<Box<QuadNode>>; 4],
}

/// Quad-tree over shapefile record bounding boxes.
pub struct QuadTreeIndex {
    bounds: BoundingBox,
    max_depth: u32,
    byte_order: ByteOrder,
    root: QuadNode,
    len: usize,
}

impl QuadTreeIndex {
    /// An empty tree sized for `record_count` records spanning `bounds`.
    pub fn new(bounds: BoundingBox, record_count: u32, byte_order: ByteOrder) -> Self {
        Self {
            bounds,
            max_depth: depth_for(record_count),
            byte_order,
            root: QuadNode::default(),
            len: 0,
        }
    }

    /// The byte order node records are persisted in.
    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    /// Depth limit derived from the record count at creation time.
    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Insert one record reference. Entries outside the global bounds are
    /// kept at the root rather than lost.
    pub fn insert(&mut self, bbox: BoundingBox, entry: IndexEntry) {
        let mut node = &mut self.root;
        let mut node_bounds = self.bounds;
        let mut depth = 0;

        while depth < self.max_depth {
            let quadrants = node_bounds.quadrants();
            let Some(quadrant) = quadrants.iter().position(|q| q.contains(&bbox)) else {
                break;
            };
            node = node.children[quadrant].get_or_insert_with(Box::default);
            node_bounds = quadrants[quadrant];
            depth += 1;
        }

        node.entries.push(entry);
        self.len += 1;
    }

    /// Serialize the tree to `path`, truncating any existing file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut enc = Encoder::new(self.byte_order);
        enc.buf.extend_from_slice(&QIX_MAGIC);
        enc.put_u8(self.byte_order.flag());
        enc.put_u32(self.len as u32);
        enc.put_u32(self.max_depth);
        enc.put_bbox(&self.bounds);
        encode_node(&mut enc, &self.root);

        let mut file = File::create(path)?;
        file.write_all(&enc.buf)?;
        file.sync_all()?;
        Ok(())
    }

    /// Load a persisted tree. `Ok(None)` means no index file exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read(path)?;
        Ok(Some(Self::decode(&data)?))
    }

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 || data[0..3] != QIX_MAGIC {
            return Err(ShapeError::Format(
                "not a quad-tree index file: bad magic".into(),
            ));
        }
        let byte_order = ByteOrder::from_flag(data[3]).ok_or_else(|| {
            ShapeError::Format(format!("unknown quad-tree byte order flag {:#04x}", data[3]))
        })?;

        let mut dec = Decoder::new(byte_order, &data[4..]);
        let declared_len = dec.u32()? as usize;
        let max_depth = dec.u32()?;
        let bounds = dec.bbox()?;
        let root = decode_node(&mut dec)?;

        let len = count_entries(&root);
        if len != declared_len {
            return Err(ShapeError::Format(format!(
                "quad-tree entry count mismatch: header says {declared_len}, tree has {len}"
            )));
        }

        Ok(Self {
            bounds,
            max_depth,
            byte_order,
            root,
            len,
        })
    }
}

impl SpatialIndex for QuadTreeIndex {
    fn bounds(&self) -> BoundingBox {
        self.bounds
    }

    fn len(&self) -> usize {
        self.len
    }

    fn query(&self, bbox: &BoundingBox) -> Result<Vec<IndexEntry>> {
        if !bbox.is_finite() {
            log::warn!("rejecting quad-tree query with non-finite bounding box");
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        if bbox.contains(&self.bounds) {
            collect_all(&self.root, &mut out);
        } else {
            collect_intersecting(&self.root, self.bounds, bbox, &mut out);
        }
        sort_candidates(&mut out);
        Ok(out)
    }
}

/// Smallest depth whose leaf count covers the record count, capped.
fn depth_for(record_count: u32) -> u32 {
    let mut depth = 1;
    let mut leaves = 4u64;
    while leaves < record_count as u64 && depth < MAX_DEPTH_CAP {
        depth += 1;
        leaves *= 4;
    }
    depth
}

fn count_entries(node: &QuadNode) -> usize {
    node.entries.len()
        + node
            .children
            .iter()
            .flatten()
            .map(|c| count_entries(c))
            .sum::<usize>()
}

fn collect_all(node: &QuadNode, out: &mut Vec<IndexEntry>) {
    out.extend_from_slice(&node.entries);
    for child in node.children.iter().flatten() {
        collect_all(child, out);
    }
}

fn collect_intersecting(
    node: &QuadNode,
    node_bounds: BoundingBox,
    bbox: &BoundingBox,
    out: &mut Vec<IndexEntry>,
) {
    // Entries parked at this level span multiple quadrants; they are
    // candidates whenever the node itself is reached.
    out.extend_from_slice(&node.entries);

    let quadrants = node_bounds.quadrants();
    for (quadrant, child) in node.children.iter().enumerate() {
        if let Some(child) = child {
            if quadrants[quadrant].intersects(bbox) {
                collect_intersecting(child, quadrants[quadrant], bbox, out);
            }
        }
    }
}

fn encode_node(enc: &mut Encoder, node: &QuadNode) {
    enc.put_u32(node.entries.len() as u32);
    for entry in &node.entries {
        enc.put_u32(entry.record_number);
        enc.put_u64(entry.offset);
    }

    let present = node.children.iter().flatten().count() as u8;
    enc.put_u8(present);
    for (quadrant, child) in node.children.iter().enumerate() {
        if let Some(child) = child {
            enc.put_u8(quadrant as u8);
            encode_node(enc, child);
        }
    }
}

fn decode_node(dec: &mut Decoder<'_>) -> Result<QuadNode> {
    let entry_count = dec.u32()? as usize;
    let mut entries = Vec::with_capacity(entry_count);
    for _ in 0..entry_count {
        let record_number = dec.u32()?;
        let offset = dec.u64()?;
        entries.push(IndexEntry {
            record_number,
            offset,
        });
    }

    let mut children: [Option<Box<QuadNode>>; 4] = Default::default();
    let present = dec.u8()?;
    if present > 4 {
        return Err(ShapeError::Format(format!(
            "quad-tree node claims {present} children"
        )));
    }
    for _ in 0..present {
        let quadrant = dec.u8()? as usize;
        if quadrant >= 4 || children[quadrant].is_some() {
            return Err(ShapeError::Format(format!(
                "invalid quad-tree child quadrant {quadrant}"
            )));
        }
        children[quadrant] = Some(Box::new(decode_node(dec)?));
    }

    Ok(QuadNode { entries, children })
}
