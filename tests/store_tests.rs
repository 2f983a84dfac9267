//! End-to-end tests: write a shapefile, build indexes, query through the
//! store, and cross-check indexed queries against full scans.

use shapedex::{
    BoundingBox, ByteOrder, FidWriter, IndexBuilder, IndexKind, IndexSelection, ShapeStore,
    ShapeType, ShpWriter, SplitPolicy, TreeConfig,
};
use std::path::{Path, PathBuf};
use tempfile::tempdir;

fn write_three_points(dir: &Path) -> PathBuf {
    let path = dir.join("points.shp");
    let mut writer = ShpWriter::create(&path, ShapeType::Point).unwrap();
    writer.append_point(0.5, 0.5).unwrap();
    writer.append_point(5.5, 5.5).unwrap();
    writer.append_point(10.5, 10.5).unwrap();
    writer.finalize().unwrap();
    path
}

fn write_point_grid(dir: &Path, side: u32) -> PathBuf {
    let path = dir.join("grid.shp");
    let mut writer = ShpWriter::create(&path, ShapeType::Point).unwrap();
    for gy in 0..side {
        for gx in 0..side {
            writer.append_point(gx as f64 * 3.0, gy as f64 * 3.0).unwrap();
        }
    }
    writer.finalize().unwrap();
    path
}

fn query_numbers(store: &ShapeStore, bbox: BoundingBox) -> Vec<u32> {
    store
        .records(Some(bbox))
        .unwrap()
        .map(|r| r.unwrap().number)
        .collect()
}

#[test]
fn test_quadtree_point_lookup() {
    let dir = tempdir().unwrap();
    let path = write_three_points(dir.path());

    let built = IndexBuilder::new(IndexKind::QuadTree).build(&path).unwrap();
    assert_eq!(built.records_indexed, 3);

    let store = ShapeStore::open(&path).unwrap();
    assert!(matches!(store.selection(), IndexSelection::QuadTree(_)));

    assert_eq!(
        query_numbers(&store, BoundingBox::new(4.0, 4.0, 7.0, 7.0)),
        vec![2]
    );
    assert_eq!(
        query_numbers(&store, BoundingBox::new(-1.0, -1.0, 20.0, 20.0)),
        vec![1, 2, 3]
    );
    assert_eq!(
        query_numbers(&store, BoundingBox::new(100.0, 100.0, 110.0, 110.0)),
        Vec::<u32>::new()
    );
}

#[test]
fn test_indexed_queries_agree_with_scans() {
    let dir = tempdir().unwrap();
    let path = write_point_grid(dir.path(), 12);

    let scan_store = ShapeStore::open(&path).unwrap();

    let queries = [
        BoundingBox::new(0.0, 0.0, 5.0, 5.0),
        BoundingBox::new(10.0, 3.0, 20.0, 9.0),
        BoundingBox::new(-5.0, -5.0, 100.0, 100.0),
        BoundingBox::new(17.5, 17.5, 17.9, 17.9),
        BoundingBox::new(33.0, 0.0, 33.0, 33.0),
    ];

    // Scan answers first, before any index exists.
    let expected: Vec<Vec<u32>> = queries
        .iter()
        .map(|q| query_numbers(&scan_store, *q))
        .collect();

    for kind in [IndexKind::RTree, IndexKind::QuadTree] {
        let built = IndexBuilder::new(kind)
            .with_tree_config(
                TreeConfig::default()
                    .with_max_entries(6)
                    .with_min_entries(3),
            )
            .build(&path)
            .unwrap();
        assert_eq!(built.records_indexed, 144);

        let store = ShapeStore::open(&path).unwrap();
        for (query, expected) in queries.iter().zip(&expected) {
            assert_eq!(&query_numbers(&store, *query), expected, "query {query:?}");
        }
        std::fs::remove_file(&built.index_path).unwrap();
    }
}

#[test]
fn test_linear_split_gives_same_answers() {
    let dir = tempdir().unwrap();
    let path = write_point_grid(dir.path(), 8);

    IndexBuilder::new(IndexKind::RTree)
        .with_tree_config(
            TreeConfig::default()
                .with_max_entries(4)
                .with_split_policy(SplitPolicy::Linear),
        )
        .build(&path)
        .unwrap();

    let store = ShapeStore::open(&path).unwrap();
    let query = BoundingBox::new(2.0, 2.0, 10.0, 10.0);
    let got = query_numbers(&store, query);

    let unindexed_dir = tempdir().unwrap();
    let unindexed = write_point_grid(unindexed_dir.path(), 8);
    let scan_store = ShapeStore::open(&unindexed).unwrap();
    assert_eq!(got, query_numbers(&scan_store, query));
}

#[test]
fn test_big_endian_quadtree_round_trip() {
    let dir = tempdir().unwrap();
    let path = write_point_grid(dir.path(), 6);

    IndexBuilder::new(IndexKind::QuadTree)
        .with_byte_order(ByteOrder::BigEndian)
        .build(&path)
        .unwrap();

    let raw = std::fs::read(path.with_extension("qix")).unwrap();
    assert_eq!(raw[3], b'M');

    let store = ShapeStore::open(&path).unwrap();
    let hits = query_numbers(&store, BoundingBox::new(0.0, 0.0, 4.0, 4.0));
    assert_eq!(hits, vec![1, 2, 7, 8]);
}

#[test]
fn test_results_stay_sorted_under_index() {
    let dir = tempdir().unwrap();
    let path = write_point_grid(dir.path(), 10);
    IndexBuilder::new(IndexKind::RTree)
        .with_tree_config(TreeConfig::default().with_max_entries(4).with_min_entries(2))
        .build(&path)
        .unwrap();

    let store = ShapeStore::open(&path).unwrap();
    let numbers = query_numbers(&store, BoundingBox::new(0.0, 0.0, 30.0, 30.0));
    assert!(numbers.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_fid_lookup_through_store() {
    let dir = tempdir().unwrap();
    let path = write_three_points(dir.path());

    // Gappy ids, shuffled record numbers: the post-edit shape of a fid index.
    let mut fix = FidWriter::create(path.with_extension("fix")).unwrap();
    fix.append(3, 2).unwrap();
    fix.append(7, 1).unwrap();
    fix.append(12, 3).unwrap();
    fix.finalize().unwrap();
    drop(fix);

    let store = ShapeStore::open(&path).unwrap();
    assert_eq!(
        store.record_for_fid("points.7").unwrap().unwrap().number,
        1
    );
    assert_eq!(
        store.record_for_fid("points.12").unwrap().unwrap().number,
        3
    );
    assert_eq!(store.record_for_fid("points.5").unwrap(), None);
    assert_eq!(store.record_for_fid("garbage").unwrap(), None);
}

#[test]
fn test_store_survives_index_deleted_after_open() {
    let dir = tempdir().unwrap();
    let path = write_three_points(dir.path());
    let built = IndexBuilder::new(IndexKind::RTree).build(&path).unwrap();

    let store = ShapeStore::open(&path).unwrap();
    std::fs::remove_file(&built.index_path).unwrap();

    // The probe result is stale now; queries must still answer via scan.
    assert_eq!(
        query_numbers(&store, BoundingBox::new(4.0, 4.0, 7.0, 7.0)),
        vec![2]
    );
}

#[test]
fn test_empty_shapefile() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("empty.shp");
    let mut writer = ShpWriter::create(&path, ShapeType::Point).unwrap();
    writer.finalize().unwrap();
    drop(writer);

    let built = IndexBuilder::new(IndexKind::QuadTree).build(&path).unwrap();
    assert_eq!(built.records_indexed, 0);

    let store = ShapeStore::open(&path).unwrap();
    assert_eq!(
        query_numbers(&store, BoundingBox::new(0.0, 0.0, 1.0, 1.0)),
        Vec::<u32>::new()
    );
    assert_eq!(store.records(None).unwrap().count(), 0);
}
