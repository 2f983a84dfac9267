use clap::{Parser, Subcommand, ValueEnum};
use shapedex::{
    BoundingBox, ByteOrder, FidWriter, IndexBuilder, IndexKind, IndexSelection, ShapeStore,
    SplitPolicy, TreeConfig,
};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about = "Build and inspect shapefile spatial indexes", long_about = None)]
struct Args {
    /// Log at debug level instead of warn
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a spatial index next to the geometry file
    #[command(visible_alias = "index")]
    Build {
        /// Path to the .shp geometry file
        shp: PathBuf,

        /// Index structure to build
        #[arg(short, long, visible_alias = "type", value_enum, default_value_t = KindArg::Rtree)]
        kind: KindArg,

        /// Maximum entries per R-tree node
        #[arg(long)]
        max: Option<usize>,

        /// Minimum entries per R-tree node after a split
        #[arg(long)]
        min: Option<usize>,

        /// R-tree node split policy
        #[arg(long, value_enum, default_value_t = SplitArg::Quadratic)]
        split: SplitArg,

        /// Byte order of quad-tree node records
        #[arg(long, value_enum, default_value_t = OrderArg::Nl)]
        byteorder: OrderArg,
    },
    /// Regenerate the feature-id index with the identity mapping
    Fix {
        /// Path to the .shp geometry file
        shp: PathBuf,
    },
    /// Print a summary of the geometry file and its sidecar indexes
    Info {
        /// Path to the .shp geometry file
        shp: PathBuf,

        /// Count records intersecting this box, given as minx,miny,maxx,maxy
        #[arg(long, value_name = "BOX", value_parser = parse_bbox)]
        query: Option<BoundingBox>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum KindArg {
    Rtree,
    Quadtree,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum SplitArg {
    Quadratic,
    Linear,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum OrderArg {
    /// Little-endian node records
    Nl,
    /// Big-endian node records
    Nm,
}

/// Validate `--max`/`--min` before handing them to the tree configuration,
/// so bad values surface as a CLI error instead of a panic.
fn tree_config(
    max: Option<usize>,
    min: Option<usize>,
    split: SplitArg,
) -> anyhow::Result<TreeConfig> {
    let mut config = TreeConfig::default().with_split_policy(match split {
        SplitArg::Quadratic => SplitPolicy::Quadratic,
        SplitArg::Linear => SplitPolicy::Linear,
    });

    if let Some(max) = max {
        anyhow::ensure!(max >= 2, "--max must be at least 2, got {max}");
        config = config.with_max_entries(max);
    }
    if let Some(min) = min {
        let cap = config.max_entries / 2;
        anyhow::ensure!(
            min >= 1 && min <= cap,
            "--min must be between 1 and {cap} (half of --max), got {min}"
        );
        config = config.with_min_entries(min);
    }
    Ok(config)
}

fn parse_bbox(raw: &str) -> Result<BoundingBox, String> {
    let parts: Vec<f64> = raw
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|e| format!("invalid coordinate: {e}"))?;
    let &[min_x, min_y, max_x, max_y] = parts.as_slice() else {
        return Err(format!("expected 4 coordinates, got {}", parts.len()));
    };
    Ok(BoundingBox::new(min_x, min_y, max_x, max_y))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        if args.verbose { "debug" } else { "warn" },
    ))
    .init();

    match args.command {
        Command::Build {
            shp,
            kind,
            max,
            min,
            split,
            byteorder,
        } => {
            let config = tree_config(max, min, split)?;

            let kind = match kind {
                KindArg::Rtree => IndexKind::RTree,
                KindArg::Quadtree => IndexKind::QuadTree,
            };
            let byte_order = match byteorder {
                OrderArg::Nl => ByteOrder::LittleEndian,
                OrderArg::Nm => ByteOrder::BigEndian,
            };

            let result = IndexBuilder::new(kind)
                .with_tree_config(config)
                .with_byte_order(byte_order)
                .build(&shp)?;
            if result.records_indexed == 0 {
                println!(
                    "{}: built by a concurrent process",
                    result.index_path.display()
                );
            } else {
                println!(
                    "{}: indexed {} records",
                    result.index_path.display(),
                    result.records_indexed
                );
            }
        }
        Command::Fix { shp } => {
            let store = ShapeStore::open(&shp)?;
            let stats = store.stats()?;
            let count = stats
                .record_count
                .ok_or_else(|| anyhow::anyhow!("regenerating the fid index needs a .shx file"))?;
            let fix_path = shp.with_extension("fix");
            FidWriter::regenerate(&fix_path, count)?;
            println!("{}: wrote {} entries", fix_path.display(), count);
        }
        Command::Info { shp, query } => {
            let store = ShapeStore::open(&shp)?;
            let stats = store.stats()?;
            let bounds = stats.bounds;

            println!("shape type:   {:?}", stats.shape_type);
            println!(
                "extent:       ({}, {}) - ({}, {})",
                bounds.min_x(),
                bounds.min_y(),
                bounds.max_x(),
                bounds.max_y()
            );
            match stats.record_count {
                Some(count) => println!("records:      {count}"),
                None => println!("records:      unknown (no .shx)"),
            }
            match &stats.index {
                IndexSelection::None => println!("index:        none"),
                IndexSelection::QuadTree(path) => {
                    println!("index:        quad-tree ({})", path.display())
                }
                IndexSelection::RTree(path) => {
                    println!("index:        r-tree ({})", path.display())
                }
            }

            if let Some(bbox) = query {
                let mut hits = 0usize;
                for record in store.records(Some(bbox))? {
                    record?;
                    hits += 1;
                }
                println!("query hits:   {hits}");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_node_sizes_are_errors_not_panics() {
        assert!(tree_config(Some(1), None, SplitArg::Quadratic).is_err());
        assert!(tree_config(Some(40), Some(30), SplitArg::Quadratic).is_err());
        assert!(tree_config(None, Some(0), SplitArg::Quadratic).is_err());
        assert!(tree_config(None, Some(26), SplitArg::Quadratic).is_err());

        let config = tree_config(Some(40), Some(20), SplitArg::Linear).unwrap();
        assert_eq!(config.max_entries, 40);
        assert_eq!(config.min_entries, 20);
        assert_eq!(config.split_policy, SplitPolicy::Linear);
    }

    #[test]
    fn test_defaults_pass_validation() {
        let config = tree_config(None, None, SplitArg::Quadratic).unwrap();
        assert_eq!(config.max_entries, 50);
        assert_eq!(config.min_entries, 25);
    }

    #[test]
    fn test_index_and_type_aliases_parse() {
        let args =
            Args::try_parse_from(["shpindex", "index", "--type", "quadtree", "x.shp"]).unwrap();
        let Command::Build { kind, shp, .. } = args.command else {
            panic!("expected the build subcommand");
        };
        assert!(matches!(kind, KindArg::Quadtree));
        assert_eq!(shp, PathBuf::from("x.shp"));
    }

    #[test]
    fn test_bbox_argument_parsing() {
        let bbox = parse_bbox("1, 2,3 ,4").unwrap();
        assert_eq!(bbox, BoundingBox::new(1.0, 2.0, 3.0, 4.0));
        assert!(parse_bbox("1,2,3").is_err());
        assert!(parse_bbox("a,b,c,d").is_err());
    }
}
