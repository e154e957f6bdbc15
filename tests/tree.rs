//! End-to-end B-tree scenarios: build a pool, write through the CoW paths,
//! reopen and check what came back.

mod common;

use btrfs_kit::ctree;
use btrfs_kit::error::BtrfsError;
use btrfs_kit::extent_io::read_logical;
use btrfs_kit::extent_tree::verify_block_groups;
use btrfs_kit::root_tree::{mksubvol, read_fs_root};
use btrfs_kit::structures::*;
use btrfs_kit::transaction::{abort_transaction, commit_transaction, start_transaction};
use btrfs_kit::{dir_item, inode};

use common::*;

const GIB: u64 = 1024 * 1024 * 1024;

#[test]
fn build_and_read() {
    let pool = sparse_devices(1, GIB);
    mkfs_pool(&pool, 0, 0);

    let file_data: Vec<u8> = (0..4096_u32).map(|i| (i % 16) as u8).collect();
    let (ino, bytenr);
    {
        let mut fs = open_pool(&pool, true);
        let trans = start_transaction(&mut fs).unwrap();
        let mut sub = mksubvol(&mut fs, &trans, BTRFS_FS_TREE_OBJECTID, "sub", 300).unwrap();
        let got = write_file(
            &mut fs,
            &trans,
            &mut sub,
            BTRFS_FIRST_FREE_OBJECTID,
            b"f",
            64,
            &file_data,
        )
        .unwrap();
        ino = got.0;
        bytenr = got.1;
        fs.set_root(sub);
        commit_transaction(&mut fs, trans).unwrap();
        verify_block_groups(&mut fs).unwrap();
    }

    // a fresh open must expose the same state
    let mut fs = open_pool(&pool, false);
    let mut sub = read_fs_root(&mut fs, 300).unwrap();
    let item = inode::read_inode(&mut fs, &mut sub, ino).unwrap();
    let size = item.size;
    let nbytes = item.nbytes;
    let nlink = item.nlink;
    assert_eq!(size, 64);
    assert_eq!(nbytes, 4096);
    assert_eq!(nlink, 1);

    let entry = dir_item::lookup_dir_item(&mut fs, &mut sub, BTRFS_FIRST_FREE_OBJECTID, b"f")
        .unwrap()
        .expect("dir entry");
    let entry_location_objectid = entry.location.objectid;
    assert_eq!(entry_location_objectid, ino);

    // straight through the chunk mapping
    let disk = read_logical(&fs.devices, &fs.chunk_map, bytenr, 4096, 0).unwrap();
    assert_eq!(disk, file_data);
    // and through the file-extent walk
    let content = inode::read_file(&mut fs, &mut sub, ino).unwrap();
    assert_eq!(&content[..], &file_data[..64]);
}

#[test]
fn snapshot_isolation() {
    let pool = sparse_devices(1, GIB);
    mkfs_pool(&pool, 0, 0);
    let mut fs = open_pool(&pool, true);

    let old_data = vec![0xAA_u8; 4096];
    let (ino, old_bytenr);
    {
        let trans = start_transaction(&mut fs).unwrap();
        let mut sub = mksubvol(&mut fs, &trans, BTRFS_FS_TREE_OBJECTID, "sub", 300).unwrap();
        let got = write_file(
            &mut fs,
            &trans,
            &mut sub,
            BTRFS_FIRST_FREE_OBJECTID,
            b"f",
            4096,
            &old_data,
        )
        .unwrap();
        ino = got.0;
        old_bytenr = got.1;
        fs.set_root(sub);
        commit_transaction(&mut fs, trans).unwrap();
    }

    // snapshot, then overwrite in the source subvolume
    {
        let trans = start_transaction(&mut fs).unwrap();
        mksubvol(&mut fs, &trans, 300, "snap", 301).unwrap();
        commit_transaction(&mut fs, trans).unwrap();
    }
    assert_eq!(extent_refcount(&mut fs, old_bytenr, 4096), Some(2));

    let new_data = vec![0x55_u8; 4096];
    let new_bytenr;
    {
        let trans = start_transaction(&mut fs).unwrap();
        let mut sub = read_fs_root(&mut fs, 300).unwrap();
        inode::remove_file_extent(&mut fs, &trans, &mut sub, ino, 0).unwrap();
        let bytenr = btrfs_kit::extent_tree::alloc_data_extent(
            &mut fs, &trans, 4096, 300, ino, 0,
        )
        .unwrap();
        btrfs_kit::extent_io::write_logical(&fs.devices, &fs.chunk_map, bytenr, &new_data)
            .unwrap();
        inode::insert_file_extent(&mut fs, &trans, &mut sub, ino, 0, bytenr, 4096, 4096, true)
            .unwrap();
        inode::insert_data_csums(&mut fs, &trans, bytenr, &new_data).unwrap();
        new_bytenr = bytenr;
        fs.set_root(sub);
        commit_transaction(&mut fs, trans).unwrap();
    }

    // both trees resolve their own extent
    let mut sub = read_fs_root(&mut fs, 300).unwrap();
    let mut snap = read_fs_root(&mut fs, 301).unwrap();
    assert_eq!(inode::read_file(&mut fs, &mut sub, ino).unwrap(), new_data);
    assert_eq!(inode::read_file(&mut fs, &mut snap, ino).unwrap(), old_data);

    // the old extent lives on through the snapshot, the new one is private
    assert!(extent_refcount(&mut fs, old_bytenr, 4096).unwrap() >= 1);
    assert_eq!(extent_refcount(&mut fs, new_bytenr, 4096), Some(1));
    verify_block_groups(&mut fs).unwrap();
}

#[test]
fn insert_delete_leaves_key_set_unchanged() {
    let pool = sparse_devices(1, GIB);
    mkfs_pool(&pool, 0, 0);
    let mut fs = open_pool(&pool, true);

    let trans = start_transaction(&mut fs).unwrap();
    let mut sub = mksubvol(&mut fs, &trans, BTRFS_FS_TREE_OBJECTID, "sub", 300).unwrap();
    fs.set_root(sub.clone());
    commit_transaction(&mut fs, trans).unwrap();

    sub = read_fs_root(&mut fs, 300).unwrap();
    let before_keys = collect_keys(&mut fs, &sub);
    let before_bytenr = sub.bytenr;

    let trans = start_transaction(&mut fs).unwrap();
    let key = btrfs_disk_key::new(999, BtrfsItemType::INODE_ITEM, 0);
    let item = inode::new_inode_item(0o100644, 0, trans.transid);
    ctree::insert_item(&mut fs, &trans, &mut sub, &key, struct_bytes(&item)).unwrap();
    let (mut path, found) = ctree::search_slot(&mut fs, Some(&trans), &mut sub, &key, 0, true)
        .unwrap();
    assert!(found);
    ctree::delete_item(&mut fs, &trans, &mut sub, &mut path).unwrap();
    drop(path);
    fs.set_root(sub.clone());
    commit_transaction(&mut fs, trans).unwrap();

    let sub = read_fs_root(&mut fs, 300).unwrap();
    let after_keys = collect_keys(&mut fs, &sub);
    assert_eq!(before_keys, after_keys);
    // CoW means the top moved even though the content did not
    assert_ne!(before_bytenr, sub.bytenr);
}

#[test]
fn transactions_are_exclusive() {
    let pool = sparse_devices(1, GIB);
    mkfs_pool(&pool, 0, 0);
    let mut fs = open_pool(&pool, true);

    let t1 = start_transaction(&mut fs).unwrap();
    assert!(matches!(
        start_transaction(&mut fs),
        Err(BtrfsError::TransactionInProgress)
    ));
    abort_transaction(&mut fs, t1);
    let t2 = start_transaction(&mut fs).unwrap();
    abort_transaction(&mut fs, t2);
}

#[test]
fn oversized_item_fails_before_dirtying() {
    let pool = sparse_devices(1, GIB);
    mkfs_pool(&pool, 0, 0);
    let mut fs = open_pool(&pool, true);

    let trans = start_transaction(&mut fs).unwrap();
    let mut fs_root = fs.root(BTRFS_FS_TREE_OBJECTID).unwrap();
    let key = btrfs_disk_key::new(999, BtrfsItemType::XATTR_ITEM, 0);
    let payload = vec![0_u8; fs.leaf_data_size()];
    assert!(matches!(
        ctree::insert_item(&mut fs, &trans, &mut fs_root, &key, &payload),
        Err(BtrfsError::NoSpace { .. })
    ));
    assert!(fs.cache.dirty_bytenrs().is_empty());
    abort_transaction(&mut fs, trans);
}

#[test]
fn superblock_recovery_picks_best_mirror() {
    let pool = sparse_devices(1, GIB);
    mkfs_pool(&pool, 0, 0);
    let expected_generation;
    {
        let fs = open_pool(&pool, false);
        expected_generation = fs.sb.generation;
    }

    // a trashed primary must not stop a recovering open
    {
        use std::io::{Seek, SeekFrom, Write};
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .open(&pool.paths[0])
            .unwrap();
        f.seek(SeekFrom::Start(btrfs_sb_offset(0))).unwrap();
        f.write_all(&[0xFF_u8; 4096]).unwrap();
    }
    let mut registry = btrfs_kit::device::Registry::new();
    let fs = btrfs_kit::fs::open_fs(
        &mut registry,
        &[pool.paths[0].as_path()],
        btrfs_kit::fs::OpenFlags {
            recover: true,
            ..Default::default()
        },
    )
    .unwrap();
    let sb_generation = fs.sb.generation;
    assert_eq!(sb_generation, expected_generation);
}

#[test]
fn many_inserts_split_leaves() {
    let pool = sparse_devices(1, GIB);
    mkfs_pool(&pool, 0, 0);
    let mut fs = open_pool(&pool, true);

    let trans = start_transaction(&mut fs).unwrap();
    let mut sub = mksubvol(&mut fs, &trans, BTRFS_FS_TREE_OBJECTID, "sub", 300).unwrap();
    // enough payload to push the tree past one leaf
    for i in 0..2000_u64 {
        let key = btrfs_disk_key::new(500 + i, BtrfsItemType::INODE_ITEM, 0);
        let item = inode::new_inode_item(0o100644, i, trans.transid);
        ctree::insert_item(&mut fs, &trans, &mut sub, &key, struct_bytes(&item)).unwrap();
    }
    fs.set_root(sub.clone());
    commit_transaction(&mut fs, trans).unwrap();
    assert!(sub.level >= 1 || fs.root(300).unwrap().level >= 1);

    // every key must come back in order after reopen
    let mut fs = open_pool(&pool, false);
    let sub = read_fs_root(&mut fs, 300).unwrap();
    let keys = collect_keys(&mut fs, &sub);
    let inode_keys: Vec<u64> = keys
        .iter()
        .filter(|k| k.item_type == BtrfsItemType::INODE_ITEM && k.objectid >= 500)
        .map(|k| k.objectid)
        .collect();
    assert_eq!(inode_keys.len(), 2000);
    assert!(inode_keys.windows(2).all(|w| w[0] < w[1]));
}
