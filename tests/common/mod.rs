//! Shared scaffolding for the end-to-end tests: temporary image files,
//! pool creation, and a small file-writing helper.

use btrfs_kit::ctree::TreeRoot;
use btrfs_kit::device::Registry;
use btrfs_kit::error::Result;
use btrfs_kit::extent_io::write_logical;
use btrfs_kit::fs::{open_fs, FsInfo, OpenFlags};
use btrfs_kit::mkfs::{make_filesystem, MkfsConfig};
use btrfs_kit::structures::*;
use btrfs_kit::transaction::Transaction;
use btrfs_kit::{dir_item, extent_tree, inode};

use std::fs::File;
use std::path::{Path, PathBuf};

pub struct TestPool {
    pub dir: tempfile::TempDir,
    pub paths: Vec<PathBuf>,
}

pub fn sparse_devices(count: usize, bytes: u64) -> TestPool {
    let dir = tempfile::tempdir().unwrap();
    let mut paths = Vec::new();
    for i in 0..count {
        let path = dir.path().join(format!("dev{i}"));
        let f = File::create(&path).unwrap();
        f.set_len(bytes).unwrap();
        paths.push(path);
    }
    TestPool { dir, paths }
}

pub fn mkfs_pool(pool: &TestPool, metadata_profile: u64, data_profile: u64) {
    let mut cfg = MkfsConfig::new(pool.paths.clone());
    cfg.metadata_profile = metadata_profile;
    cfg.data_profile = data_profile;
    make_filesystem(&cfg).unwrap();
}

pub fn open_pool(pool: &TestPool, writable: bool) -> FsInfo {
    let mut registry = Registry::new();
    let refs: Vec<&Path> = pool.paths.iter().map(|p| p.as_path()).collect();
    open_fs(
        &mut registry,
        &refs,
        OpenFlags {
            writable,
            ..Default::default()
        },
    )
    .unwrap()
}

/// create a regular file with one on-disk extent holding `data`
pub fn write_file(
    fs: &mut FsInfo,
    trans: &Transaction,
    root: &mut TreeRoot,
    parent: u64,
    name: &[u8],
    size: u64,
    data: &[u8],
) -> Result<(u64, u64)> {
    assert_eq!(data.len() % fs.sectorsize() as usize, 0);
    let ino = dir_item::find_free_ino(fs, root)?;
    let mut item = inode::new_inode_item(0o100644, size, trans.transid);
    item.nlink = 0;
    item.nbytes = data.len() as u64;
    inode::insert_inode(fs, trans, root, ino, &item)?;
    dir_item::add_link(fs, trans, root, ino, parent, name, BTRFS_FT_REG_FILE, None)?;

    let bytenr = extent_tree::alloc_data_extent(
        fs,
        trans,
        data.len() as u64,
        root.objectid,
        ino,
        0,
    )?;
    write_logical(&fs.devices, &fs.chunk_map, bytenr, data)?;
    inode::insert_file_extent(
        fs,
        trans,
        root,
        ino,
        0,
        bytenr,
        data.len() as u64,
        data.len() as u64,
        true,
    )?;
    inode::insert_data_csums(fs, trans, bytenr, data)?;
    Ok((ino, bytenr))
}

/// refcount of one data extent as the extent tree records it
pub fn extent_refcount(fs: &mut FsInfo, bytenr: u64, num_bytes: u64) -> Option<u64> {
    let mut extent_root = fs.root(BTRFS_EXTENT_TREE_OBJECTID).unwrap();
    let key = btrfs_disk_key::new(bytenr, BtrfsItemType::EXTENT_ITEM, num_bytes);
    let (path, found) =
        btrfs_kit::ctree::search_slot(fs, None, &mut extent_root, &key, 0, false).unwrap();
    if !found {
        return None;
    }
    let rec = extent_tree::ExtentRec::decode(&path.item_data()).unwrap();
    assert_eq!(rec.refs, rec.ref_sum(), "refcount must equal backref sum");
    Some(rec.refs)
}

/// every key of a tree, in walk order
pub fn collect_keys(fs: &mut FsInfo, root: &TreeRoot) -> Vec<btrfs_disk_key> {
    let mut keys = Vec::new();
    btrfs_kit::fs::walk_leaves(fs, root, &mut |_fs, leaf, slot| {
        keys.push(leaf.borrow().key(slot));
        Ok(())
    })
    .unwrap();
    keys
}
