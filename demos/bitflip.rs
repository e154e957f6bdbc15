use anyhow::*;
use clap::Parser;
use std::fs::File;
use std::io::prelude::*;
use std::path::Path;

use btrfs_kit::ctree;
use btrfs_kit::device::Registry;
use btrfs_kit::extent_io::write_tree_block;
use btrfs_kit::fs::{open_fs, OpenFlags};
use btrfs_kit::structures::*;

/// A leaf entry in the extent tree is known to have suffered a bitflip
/// leading to an invalid extent length being written to disc, e.g. a
/// btrfs_disk_key.offset of 4 PiB + 8 KiB where 8 KiB was meant.
/// This locates the leaf holding the corrupt key, backs the block up to a
/// file, flips the bit back, recomputes the checksum and rewrites the block
/// to every mirror.
///
/// Each available block device in the filesystem should be specified on the command line.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
struct Params {
    /// objectid of the corrupt key
    #[arg(long)]
    objectid: u64,
    /// offset of the corrupt key as found on disk
    #[arg(long)]
    offset: u64,
    /// bit to flip back within the key's offset field
    #[arg(long, default_value_t = 52)]
    bit: u32,
    #[clap(required = true)]
    paths: Vec<std::path::PathBuf>,
}

fn write_backup(data: &[u8], path: &Path) -> anyhow::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Params::parse();

    let mut registry = Registry::new();
    let refs: Vec<&Path> = args.paths.iter().map(|p| p.as_path()).collect();
    let mut fs = open_fs(
        &mut registry,
        &refs,
        OpenFlags {
            writable: true,
            ..Default::default()
        },
    )?;

    for (devid, di) in fs.devices.devid_map.iter() {
        println!("devid {} is {}", devid, di.path.display());
    }
    let num_devices = fs.sb.num_devices;
    println!("{}/{} devices present", fs.devices.num_devices(), num_devices);

    let bad_key = btrfs_disk_key::new(args.objectid, BtrfsItemType::EXTENT_ITEM, args.offset);
    let mut extent_root = fs.root(BTRFS_EXTENT_TREE_OBJECTID)?;
    let (path, found) = ctree::search_slot(&mut fs, None, &mut extent_root, &bad_key, 0, false)?;
    if !found {
        return Err(anyhow!("didn't find leaf block containing key"));
    }
    let leaf = path.leaf();
    let corrupt_offset = leaf.borrow().bytenr;
    println!("corrupt block virtual address: {corrupt_offset}");

    let backup_filename = format!("offset_{corrupt_offset}_backup.bin");
    write_backup(&leaf.borrow().data, Path::new(&backup_filename))?;
    println!("backup written to {backup_filename}");

    // flip the bit inside the item key's offset field and push the block
    // back out through the normal mirrored write path
    {
        let mut b = leaf.borrow_mut();
        let mut item = b.item(path.slot());
        item.key.offset ^= 1 << args.bit;
        b.set_item(path.slot(), &item);
    }
    let mut b = leaf.borrow_mut();
    write_tree_block(&fs.devices, &fs.chunk_map, fs.sb.csum_type, &mut b)?;
    let fixed = b.item(path.slot()).key;
    println!("rewrote block with key {:?}", fixed);

    Ok(())
}
