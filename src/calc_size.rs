//! Per-tree size statistics: bytes per level, seek distances between
//! consecutive leaves, and cluster sizes of adjacent blocks.

use crate::ctree::TreeRoot;
use crate::error::Result;
use crate::fs::FsInfo;
use crate::structures::*;

#[derive(Default)]
pub struct TreeStats {
    pub total_nodes: u64,
    pub total_leaves: u64,
    pub total_bytes: u64,
    /// histogram of forward seek distances, power-of-two buckets
    pub seek_histogram: Vec<(u64, u64)>,
    pub forward_seeks: u64,
    pub backward_seeks: u64,
    pub clusters: u64,
    pub cluster_bytes: u64,
}

fn bucket_for(distance: u64) -> u64 {
    let mut bucket = 4096_u64;
    while bucket < distance && bucket < 1 << 60 {
        bucket <<= 1;
    }
    bucket
}

/// level-order walk recording every block position
pub fn calc_tree_size(fs: &mut FsInfo, root: &TreeRoot) -> Result<TreeStats> {
    let nodesize = fs.nodesize() as u64;
    let mut stats = TreeStats::default();
    let mut histogram: std::collections::BTreeMap<u64, u64> = std::collections::BTreeMap::new();

    let mut level_bytenrs: Vec<u64> = vec![root.bytenr];
    let mut leaf_order: Vec<u64> = Vec::new();
    while let Some(bytenr) = level_bytenrs.pop() {
        let eb = fs.read_block(bytenr, None)?;
        let (level, n) = {
            let b = eb.borrow();
            (b.level(), b.nritems() as usize)
        };
        stats.total_bytes += nodesize;
        if level == 0 {
            stats.total_leaves += 1;
            leaf_order.push(bytenr);
        } else {
            stats.total_nodes += 1;
            // push right-to-left so leaves pop in key order
            for slot in (0..n).rev() {
                let ptr = eb.borrow().key_ptr(slot);
                level_bytenrs.push(ptr.blockptr);
            }
        }
    }

    let mut cluster_start: Option<u64> = None;
    let mut cluster_len = 0_u64;
    for pair in leaf_order.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        if b == a + nodesize {
            if cluster_start.is_none() {
                cluster_start = Some(a);
                cluster_len = nodesize;
            }
            cluster_len += nodesize;
            continue;
        }
        if cluster_start.take().is_some() {
            stats.clusters += 1;
            stats.cluster_bytes += cluster_len;
            cluster_len = 0;
        }
        if b > a {
            stats.forward_seeks += 1;
            *histogram.entry(bucket_for(b - a)).or_default() += 1;
        } else {
            stats.backward_seeks += 1;
            *histogram.entry(bucket_for(a - b)).or_default() += 1;
        }
    }
    if cluster_start.is_some() {
        stats.clusters += 1;
        stats.cluster_bytes += cluster_len;
    }
    stats.seek_histogram = histogram.into_iter().collect();
    Ok(stats)
}

pub fn print_tree_stats(name: &str, stats: &TreeStats) {
    println!(
        "{name}: {} nodes, {} leaves, {} bytes",
        stats.total_nodes, stats.total_leaves, stats.total_bytes
    );
    println!(
        "\tseeks: {} forward, {} backward; {} clusters ({} bytes)",
        stats.forward_seeks, stats.backward_seeks, stats.clusters, stats.cluster_bytes
    );
    for (bucket, count) in &stats.seek_histogram {
        println!("\tseeks <= {bucket}: {count}");
    }
}

/// statistics for every well-known tree of the pool
pub fn calc_size(fs: &mut FsInfo, verbose: bool) -> Result<()> {
    for (name, objectid) in [
        ("root tree", BTRFS_ROOT_TREE_OBJECTID),
        ("chunk tree", BTRFS_CHUNK_TREE_OBJECTID),
        ("extent tree", BTRFS_EXTENT_TREE_OBJECTID),
        ("device tree", BTRFS_DEV_TREE_OBJECTID),
        ("csum tree", BTRFS_CSUM_TREE_OBJECTID),
        ("fs tree", BTRFS_FS_TREE_OBJECTID),
    ] {
        let Ok(root) = fs.root(objectid) else {
            continue;
        };
        let stats = calc_tree_size(fs, &root)?;
        print_tree_stats(name, &stats);
        if verbose {
            println!("\ttop bytenr {} level {}", root.bytenr, root.level);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_are_powers_of_two() {
        assert_eq!(bucket_for(1), 4096);
        assert_eq!(bucket_for(4096), 4096);
        assert_eq!(bucket_for(4097), 8192);
        assert_eq!(bucket_for(100_000), 131072);
    }
}
