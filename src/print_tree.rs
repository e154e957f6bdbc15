//! Text output for show-super and debug-tree.

use crate::ctree::TreeRoot;
use crate::error::Result;
use crate::extent_io::EbRef;
use crate::extent_tree::ExtentRec;
use crate::fs::{walk_leaves, FsInfo};
use crate::structures::*;
use crate::superblock::SysChunkIter;

fn uuid_str(uuid: &BtrfsUuid) -> String {
    std::format!(
        "{}-{}-{}-{}-{}",
        hex::encode(&uuid[0..4]),
        hex::encode(&uuid[4..6]),
        hex::encode(&uuid[6..8]),
        hex::encode(&uuid[8..10]),
        hex::encode(&uuid[10..])
    )
}

pub fn dump_super(sb: &btrfs_super_block, label: &str) {
    println!("{label}");
    let csum_type = sb.csum_type;
    let bytenr = sb.bytenr;
    let generation = sb.generation;
    let root = sb.root;
    let chunk_root = sb.chunk_root;
    let log_root = sb.log_root;
    let total_bytes = sb.total_bytes;
    let bytes_used = sb.bytes_used;
    let num_devices = sb.num_devices;
    let sectorsize = sb.sectorsize;
    let nodesize = sb.nodesize;
    let stripesize = sb.stripesize;
    let sys_array_size = sb.sys_chunk_array_size;
    let compat = sb.compat_flags;
    let compat_ro = sb.compat_ro_flags;
    let incompat = sb.incompat_flags;
    let magic = sb.magic;
    let devid = sb.dev_item.devid;
    let dev_total = sb.dev_item.total_bytes;
    let dev_used = sb.dev_item.bytes_used;

    println!("superblock: bytenr={bytenr}");
    println!("---------------------------------------------------------");
    println!("csum_type\t\t{:?}", csum_type);
    println!("bytenr\t\t\t{bytenr}");
    println!("magic\t\t\t{:#018x}", magic);
    println!("fsid\t\t\t{}", uuid_str(&sb.fsid));
    println!("metadata_uuid\t\t{}", uuid_str(&sb.metadata_uuid));
    println!(
        "label\t\t\t{}",
        String::from_utf8_lossy(&sb.label).trim_end_matches('\0')
    );
    println!("generation\t\t{generation}");
    println!("root\t\t\t{root}");
    println!("chunk_root\t\t{chunk_root}");
    println!("log_root\t\t{log_root}");
    println!("total_bytes\t\t{total_bytes}");
    println!("bytes_used\t\t{bytes_used}");
    println!("num_devices\t\t{num_devices}");
    println!("sectorsize\t\t{sectorsize}");
    println!("nodesize\t\t{nodesize}");
    println!("stripesize\t\t{stripesize}");
    println!("sys_chunk_array_size\t{sys_array_size}");
    println!("compat_flags\t\t{compat:#x}");
    println!("compat_ro_flags\t\t{compat_ro:#x}");
    println!("incompat_flags\t\t{incompat:#x}");
    println!("dev_item.devid\t\t{devid}");
    println!("dev_item.total_bytes\t{dev_total}");
    println!("dev_item.bytes_used\t{dev_used}");
    println!("dev_item.uuid\t\t{}", uuid_str(&sb.dev_item.uuid));
}

/// sys_chunk_array has members with inconsistent lengths. Each member is comprised of a btrfs_disk_key, a btrfs_chunk (which contains one btrfs_stripe) then btrfs_chunk.num_stripes -1 additional btrfs_stripes.
pub fn dump_sys_chunks(sb: &btrfs_super_block) {
    for ci in SysChunkIter::new(sb) {
        let offset = ci.0.offset;
        let length = ci.1.length;
        let num_stripes = ci.1.num_stripes;
        let sub_stripes = ci.1.sub_stripes;
        println!(
            "sys chunk: start {offset} length {length} num_stripes {num_stripes} sub_stripes {sub_stripes}"
        );
        for stripe in &ci.2 {
            let devid = stripe.devid;
            let phys = stripe.offset;
            println!(
                "\tstripe devid {devid} offset {phys} dev_uuid {}",
                uuid_str(&stripe.dev_uuid)
            );
        }
    }
}

pub fn dump_node_header(eb: &EbRef) {
    let b = eb.borrow();
    let hdr = b.header();
    let bytenr = hdr.bytenr;
    let owner = hdr.owner;
    let gen = hdr.generation;
    let nritems = hdr.nritems;
    let level = hdr.level;
    println!(
        "node {bytenr} level {level} items {nritems} generation {gen} owner {owner} fsid {}",
        uuid_str(&hdr.fsid)
    );
}

fn dump_one_item(eb: &EbRef, slot: usize) {
    let b = eb.borrow();
    let key = b.key(slot);
    let item = b.item(slot);
    let size = item.size;
    print!("\titem {slot} key {:?} itemsize {size}", key);
    match key.item_type {
        BtrfsItemType::INODE_ITEM => {
            let ii: btrfs_inode_item = b.read_item_struct(slot, 0);
            let size = ii.size;
            let nbytes = ii.nbytes;
            let nlink = ii.nlink;
            let mode = ii.mode;
            println!("\n\t\tinode size {size} nbytes {nbytes} nlink {nlink} mode {mode:o}");
        }
        BtrfsItemType::ROOT_ITEM => {
            let ri: btrfs_root_item = b.read_item_struct(slot, 0);
            let bytenr = ri.bytenr;
            let level = ri.level;
            let refs = ri.refs;
            println!("\n\t\troot bytenr {bytenr} level {level} refs {refs}");
        }
        BtrfsItemType::EXTENT_ITEM => {
            match ExtentRec::decode(&b.item_data(slot)) {
                Ok(rec) => {
                    let refs = rec.refs;
                    let flags = rec.flags;
                    println!("\n\t\textent refs {refs} flags {flags:#x} backrefs {:?}", rec.inline);
                }
                Err(_) => println!(" (undecodable extent item)"),
            };
        }
        BtrfsItemType::EXTENT_DATA => {
            let fe: btrfs_file_extent_item = b.read_item_struct(slot, 0);
            if fe.r#type == BTRFS_FILE_EXTENT_INLINE {
                let ram = fe.ram_bytes;
                println!("\n\t\tinline extent ram_bytes {ram} compression {}", fe.compression);
            } else {
                let disk_bytenr = fe.disk_bytenr;
                let disk_num = fe.disk_num_bytes;
                let num = fe.num_bytes;
                println!(
                    "\n\t\textent disk_bytenr {disk_bytenr} disk_num_bytes {disk_num} num_bytes {num}"
                );
            }
        }
        BtrfsItemType::CHUNK_ITEM => {
            let chunk: btrfs_chunk = b.read_item_struct(slot, 0);
            let length = chunk.length;
            let num_stripes = chunk.num_stripes;
            let flags = chunk.r#type;
            println!("\n\t\tchunk length {length} type {flags:#x} num_stripes {num_stripes}");
        }
        BtrfsItemType::DEV_EXTENT => {
            let de: btrfs_dev_extent = b.read_item_struct(slot, 0);
            let chunk_offset = de.chunk_offset;
            let length = de.length;
            println!("\n\t\tdev extent chunk_offset {chunk_offset} length {length}");
        }
        BtrfsItemType::BLOCK_GROUP_ITEM => {
            let bg: btrfs_block_group_item = b.read_item_struct(slot, 0);
            let used = bg.used;
            let flags = bg.flags;
            println!("\n\t\tblock group used {used} flags {flags:#x}");
        }
        BtrfsItemType::DIR_ITEM | BtrfsItemType::DIR_INDEX | BtrfsItemType::XATTR_ITEM => {
            match crate::dir_item::decode_dir_entries(&b.item_data(slot)) {
                Ok(entries) => {
                    print!("\n\t\t");
                    for e in entries {
                        print!("name {:?} ", String::from_utf8_lossy(&e.name));
                    }
                    println!();
                }
                Err(_) => println!(" (undecodable dir item)"),
            }
        }
        BtrfsItemType::QGROUP_STATUS
        | BtrfsItemType::QGROUP_INFO
        | BtrfsItemType::QGROUP_LIMIT
        | BtrfsItemType::QGROUP_RELATION => {
            println!(" (quota item)");
        }
        _ => println!(),
    }
}

/// selection flags for debug-tree
#[derive(Clone, Copy, Default)]
pub struct DumpSelection {
    pub extents_only: bool,
    pub devices_only: bool,
    pub roots_only: bool,
    pub uuid_only: bool,
    pub backups: bool,
    pub block: Option<u64>,
}

pub fn dump_tree(fs: &mut FsInfo, root: &TreeRoot) -> Result<()> {
    walk_leaves(fs, root, &mut |_fs, leaf, slot| {
        if slot == 0 {
            dump_node_header(leaf);
        }
        dump_one_item(leaf, slot);
        Ok(())
    })
}

pub fn dump_all(fs: &mut FsInfo, selection: &DumpSelection) -> Result<()> {
    if let Some(bytenr) = selection.block {
        let eb = fs.read_block(bytenr, None)?;
        dump_node_header(&eb);
        let n = eb.borrow().nritems() as usize;
        if eb.borrow().level() == 0 {
            for slot in 0..n {
                dump_one_item(&eb, slot);
            }
        }
        return Ok(());
    }
    let mut wanted: Vec<u64> = Vec::new();
    if selection.extents_only {
        wanted.push(BTRFS_EXTENT_TREE_OBJECTID);
    }
    if selection.devices_only {
        wanted.push(BTRFS_DEV_TREE_OBJECTID);
    }
    if selection.uuid_only {
        wanted.push(BTRFS_UUID_TREE_OBJECTID);
    }
    if selection.roots_only || wanted.is_empty() {
        wanted.push(BTRFS_ROOT_TREE_OBJECTID);
    }
    if wanted.len() == 1 && wanted[0] == BTRFS_ROOT_TREE_OBJECTID && !selection.roots_only {
        wanted.extend([
            BTRFS_CHUNK_TREE_OBJECTID,
            BTRFS_EXTENT_TREE_OBJECTID,
            BTRFS_DEV_TREE_OBJECTID,
            BTRFS_CSUM_TREE_OBJECTID,
            BTRFS_FS_TREE_OBJECTID,
        ]);
    }
    for objectid in wanted {
        match fs.root(objectid) {
            Ok(root) => {
                println!("tree {objectid}:");
                dump_tree(fs, &root)?;
            }
            Err(_) => println!("tree {objectid}: not present"),
        }
    }
    if selection.backups {
        for (i, backup) in fs.sb.super_roots.iter().enumerate() {
            let tree_root = backup.tree_root;
            let gen = backup.tree_root_gen;
            println!("backup {i}: tree_root {tree_root} generation {gen}");
        }
    }
    Ok(())
}
