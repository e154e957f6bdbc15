//! Mirror and parity repair scenarios on small multi-device pools.

mod common;

use btrfs_kit::extent_io::read_logical;
use btrfs_kit::root_tree::mksubvol;
use btrfs_kit::scrub::scrub;
use btrfs_kit::structures::*;
use btrfs_kit::transaction::{commit_transaction, start_transaction};
use btrfs_kit::volumes::{map_block, MapOp};

use common::*;
use std::io::{Seek, SeekFrom, Write};

const DEV_BYTES: u64 = 512 * 1024 * 1024;

fn corrupt(path: &std::path::Path, physical: u64, len: usize) {
    let mut f = std::fs::OpenOptions::new().write(true).open(path).unwrap();
    f.seek(SeekFrom::Start(physical)).unwrap();
    f.write_all(&vec![0x5C_u8; len]).unwrap();
}

fn device_path<'a>(pool: &'a TestPool, fs: &btrfs_kit::fs::FsInfo, devid: u64) -> &'a std::path::Path {
    let want = fs.devices.get(devid).unwrap().path.clone();
    pool.paths
        .iter()
        .find(|p| *p == &want)
        .map(|p| p.as_path())
        .unwrap()
}

#[test]
fn scrub_clean_pool_is_idempotent() {
    let pool = sparse_devices(1, DEV_BYTES);
    mkfs_pool(&pool, 0, 0);
    let mut fs = open_pool(&pool, true);
    {
        let trans = start_transaction(&mut fs).unwrap();
        let mut sub = mksubvol(&mut fs, &trans, BTRFS_FS_TREE_OBJECTID, "sub", 300).unwrap();
        let data = vec![0x42_u8; 16384];
        write_file(
            &mut fs,
            &trans,
            &mut sub,
            BTRFS_FIRST_FREE_OBJECTID,
            b"f",
            16384,
            &data,
        )
        .unwrap();
        fs.set_root(sub);
        commit_transaction(&mut fs, trans).unwrap();
    }
    let first = scrub(&mut fs, false).unwrap();
    let second = scrub(&mut fs, false).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.csum_errors, 0);
    assert_eq!(first.uncorrectable_errors, 0);
    assert!(first.data_bytes_scrubbed >= 16384);
}

#[test]
fn raid1_mirror_repair() {
    let pool = sparse_devices(2, DEV_BYTES);
    mkfs_pool(&pool, 0, BTRFS_BLOCK_GROUP_RAID1);
    let mut fs = open_pool(&pool, true);

    let data: Vec<u8> = (0..16384_u32).map(|i| (i % 251) as u8).collect();
    let bytenr;
    {
        let trans = start_transaction(&mut fs).unwrap();
        let mut sub = mksubvol(&mut fs, &trans, BTRFS_FS_TREE_OBJECTID, "sub", 300).unwrap();
        let got = write_file(
            &mut fs,
            &trans,
            &mut sub,
            BTRFS_FIRST_FREE_OBJECTID,
            b"f",
            16384,
            &data,
        )
        .unwrap();
        bytenr = got.1;
        fs.set_root(sub);
        commit_transaction(&mut fs, trans).unwrap();
    }

    // sectors 0 and 4096 on the first mirror, sector 8192 on the second
    for (mirror, sector) in [(1_u16, 0_u64), (1, 4096), (2, 8192)] {
        let m = map_block(&fs.chunk_map, MapOp::Read, bytenr + sector, 4096, mirror).unwrap();
        let path = device_path(&pool, &fs, m.stripes[0].devid);
        corrupt(path, m.stripes[0].physical, 4096);
    }

    let progress = scrub(&mut fs, true).unwrap();
    assert_eq!(progress.csum_errors, 3);
    assert_eq!(progress.uncorrectable_errors, 0);
    assert_eq!(progress.corrected_errors, 3);

    // both mirrors must read identically now
    let m1 = read_logical(&fs.devices, &fs.chunk_map, bytenr, 16384, 1).unwrap();
    let m2 = read_logical(&fs.devices, &fs.chunk_map, bytenr, 16384, 2).unwrap();
    assert_eq!(m1, m2);
    assert_eq!(m1, data);

    let clean = scrub(&mut fs, false).unwrap();
    assert_eq!(clean.csum_errors, 0);
}

#[test]
fn raid5_parity_repair() {
    let pool = sparse_devices(4, DEV_BYTES);
    mkfs_pool(&pool, 0, BTRFS_BLOCK_GROUP_RAID5);
    let mut fs = open_pool(&pool, true);

    let data: Vec<u8> = (0..196608_u32).map(|i| (i % 253) as u8).collect();
    let bytenr;
    {
        let trans = start_transaction(&mut fs).unwrap();
        let mut sub = mksubvol(&mut fs, &trans, BTRFS_FS_TREE_OBJECTID, "sub", 300).unwrap();
        let got = write_file(
            &mut fs,
            &trans,
            &mut sub,
            BTRFS_FIRST_FREE_OBJECTID,
            b"big",
            196608,
            &data,
        )
        .unwrap();
        bytenr = got.1;
        fs.set_root(sub);
        commit_transaction(&mut fs, trans).unwrap();
    }

    // flip bytes inside one data stripe
    let m = map_block(&fs.chunk_map, MapOp::Read, bytenr + 8192, 4096, 0).unwrap();
    let path = device_path(&pool, &fs, m.stripes[0].devid);
    corrupt(path, m.stripes[0].physical, 64);

    let report = scrub(&mut fs, false).unwrap();
    assert!(report.csum_errors > 0, "corruption must be noticed");
    assert_eq!(report.uncorrectable_errors, 0, "one bad stripe is recoverable");
    assert_eq!(report.corrected_errors, 0, "read-only scrub must not write");

    let repaired = scrub(&mut fs, true).unwrap();
    assert_eq!(repaired.uncorrectable_errors, 0);
    assert!(repaired.corrected_errors > 0);

    let clean = scrub(&mut fs, false).unwrap();
    assert_eq!(clean.csum_errors, 0);
    assert_eq!(clean.uncorrectable_errors, 0);

    let back = read_logical(&fs.devices, &fs.chunk_map, bytenr, 196608, 0).unwrap();
    assert_eq!(back, data);
}
