//! In-place conversion of a foreign filesystem. User data never moves; the
//! new metadata grows in the source's free space and an image subvolume
//! keeps the original bytes reachable until a rollback or a cleanup.

use crate::ctree::{self, TreeRoot};
use crate::device::{Device, Registry};
use crate::dir_item;
use crate::error::{BtrfsError, Result};
use crate::extent_io::{read_logical, write_logical};
use crate::extent_tree;
use crate::fs::{self, FsInfo, OpenFlags};
use crate::inode;
use crate::mkfs::{self, BootstrapLayout, MkfsConfig};
use crate::root_tree;
use crate::source_fs::{SourceFs, SourceInode};
use crate::structures::*;
use crate::transaction::{commit_transaction, start_transaction, Transaction};
use crate::volumes::{ChunkMapping, ChunkStripe};

use log::{debug, info};
use std::path::Path;

pub const IMAGE_SUBVOL_NAME: &str = "ext2_saved";
pub const IMAGE_FILE_NAME: &str = "image";
const IMAGE_SUBVOL_OBJECTID: u64 = BTRFS_FIRST_FREE_OBJECTID;
/// inode id shift between source and target namespaces
const INO_OFFSET: u64 = BTRFS_FIRST_FREE_OBJECTID - crate::source_ext2::EXT2_ROOT_INO;
/// the largest extent one file item may describe
const MAX_EXTENT_BYTES: u64 = 128 * 1024 * 1024;

pub struct ConvertOptions {
    pub datacsum: bool,
    pub copy_label: bool,
}

impl Default for ConvertOptions {
    fn default() -> ConvertOptions {
        ConvertOptions {
            datacsum: true,
            copy_label: true,
        }
    }
}

/// ranges no chunk may ever cover
fn reserved_ranges() -> [(u64, u64); 3] {
    [
        (0, BTRFS_DEVICE_RANGE_RESERVED),
        (btrfs_sb_offset(1), BTRFS_STRIPE_LEN),
        (btrfs_sb_offset(2), BTRFS_STRIPE_LEN),
    ]
}

fn overlaps(a: (u64, u64), b: (u64, u64)) -> bool {
    a.0 < b.0 + b.1 && b.0 < a.0 + a.1
}

/// subtract every reserved range from `(start, len)`
fn subtract_reserved(start: u64, len: u64) -> Vec<(u64, u64)> {
    let mut parts = vec![(start, len)];
    for (rs, rl) in reserved_ranges() {
        let mut next = Vec::new();
        for (s, l) in parts {
            if !overlaps((s, l), (rs, rl)) {
                next.push((s, l));
                continue;
            }
            if s < rs {
                next.push((s, rs - s));
            }
            let tail_start = rs + rl;
            if s + l > tail_start {
                next.push((tail_start, s + l - tail_start));
            }
        }
        parts = next;
    }
    parts
}

/// Step 2 of the conversion: grow and merge the used ranges into the data
/// chunk layout, reserved ranges excluded.
pub fn plan_data_ranges(used: &[(u64, u64)], total_bytes: u64) -> Vec<(u64, u64)> {
    let min_len = 2 * BTRFS_STRIPE_LEN;
    let mut merged: Vec<(u64, u64)> = Vec::new();
    for (s, l) in used.iter().copied() {
        let mut s = s;
        let mut l = l.max(min_len);
        if s + l > total_bytes {
            s = total_bytes.saturating_sub(l);
        }
        match merged.last_mut() {
            Some((ps, pl)) if s <= *ps + *pl + min_len => {
                let end = (s + l).max(*ps + *pl);
                *pl = end - *ps;
            }
            _ => merged.push((s, l)),
        }
    }
    let mut out = Vec::new();
    for (s, l) in merged {
        out.extend(subtract_reserved(s, l));
    }
    out
}

/// the complement of data ranges and reserved ranges within the device
fn free_ranges(data: &[(u64, u64)], total_bytes: u64) -> Vec<(u64, u64)> {
    let mut busy: Vec<(u64, u64)> = data.to_vec();
    busy.extend_from_slice(&reserved_ranges());
    busy.sort_by_key(|r| r.0);
    let mut out = Vec::new();
    let mut cursor = 0_u64;
    for (s, l) in busy {
        if s > cursor {
            out.push((cursor, s - cursor));
        }
        cursor = cursor.max(s + l);
    }
    if cursor < total_bytes {
        out.push((cursor, total_bytes - cursor));
    }
    out
}

/// a chunk whose logical addresses equal its physical addresses
fn insert_identity_data_chunk(
    fs: &mut FsInfo,
    trans: &Transaction,
    start: u64,
    length: u64,
) -> Result<()> {
    let devid = 1;
    let dev_uuid = fs
        .dev_items
        .iter()
        .find(|(id, _)| *id == devid)
        .map(|(_, di)| di.uuid)
        .ok_or_else(|| BtrfsError::corrupt("devid 1 missing"))?;
    let mapping = ChunkMapping {
        logical: start,
        length,
        type_flags: BTRFS_BLOCK_GROUP_DATA,
        stripe_len: BTRFS_STRIPE_LEN,
        num_stripes: 1,
        sub_stripes: 1,
        stripes: vec![ChunkStripe {
            devid,
            physical: start,
            dev_uuid,
        }],
    };
    fs.chunk_map.insert(mapping.clone())?;
    fs.dev_alloc.reserve(devid, start, length);
    fs.block_groups.add(start, length, BTRFS_BLOCK_GROUP_DATA, 0);

    let (chunk, stripes) = mapping.to_disk();
    let mut payload = struct_bytes(&chunk).to_vec();
    payload.extend_from_slice(struct_bytes(&stripes[0]));
    let chunk_key = btrfs_disk_key::new(
        BTRFS_FIRST_CHUNK_TREE_OBJECTID,
        BtrfsItemType::CHUNK_ITEM,
        start,
    );
    let mut chunk_root = fs.root(BTRFS_CHUNK_TREE_OBJECTID)?;
    ctree::insert_item(fs, trans, &mut chunk_root, &chunk_key, &payload)?;
    fs.set_root(chunk_root);

    let de = btrfs_dev_extent {
        chunk_tree: BTRFS_CHUNK_TREE_OBJECTID,
        chunk_objectid: BTRFS_FIRST_CHUNK_TREE_OBJECTID,
        chunk_offset: start,
        length,
        chunk_tree_uuid: fs.sb.metadata_uuid,
    };
    let mut dev_root = fs.root(BTRFS_DEV_TREE_OBJECTID)?;
    ctree::insert_item(
        fs,
        trans,
        &mut dev_root,
        &btrfs_disk_key::new(devid, BtrfsItemType::DEV_EXTENT, start),
        struct_bytes(&de),
    )?;
    fs.set_root(dev_root);

    let bg = btrfs_block_group_item {
        used: 0,
        chunk_objectid: BTRFS_FIRST_CHUNK_TREE_OBJECTID,
        flags: BTRFS_BLOCK_GROUP_DATA,
    };
    let mut extent_root = fs.root(BTRFS_EXTENT_TREE_OBJECTID)?;
    ctree::insert_item(
        fs,
        trans,
        &mut extent_root,
        &btrfs_disk_key::new(start, BtrfsItemType::BLOCK_GROUP_ITEM, length),
        struct_bytes(&bg),
    )?;
    fs.set_root(extent_root);
    Ok(())
}

/// a new empty subvolume root with its own root directory inode
fn create_empty_subvol(
    fs: &mut FsInfo,
    trans: &Transaction,
    objectid: u64,
    name: &str,
) -> Result<TreeRoot> {
    let eb = ctree::alloc_empty_block(fs, trans, objectid, 0)?;
    let bytenr = eb.borrow().bytenr;
    let mut root = TreeRoot::new(objectid, bytenr, 0, trans.transid);

    let mut dir = inode::new_inode_item(0o40755, 0, trans.transid);
    dir.nbytes = fs.nodesize() as u64;
    inode::insert_inode(fs, trans, &mut root, BTRFS_FIRST_FREE_OBJECTID, &dir)?;
    dir_item::insert_inode_ref(
        fs,
        trans,
        &mut root,
        BTRFS_FIRST_FREE_OBJECTID,
        BTRFS_FIRST_FREE_OBJECTID,
        b"..",
        0,
    )?;

    let item = root_tree::default_root_item(root.bytenr, root.level, trans.transid);
    let key = btrfs_disk_key::new(objectid, BtrfsItemType::ROOT_ITEM, 0);
    let mut tree_root = fs.root(BTRFS_ROOT_TREE_OBJECTID)?;
    ctree::insert_item(fs, trans, &mut tree_root, &key, struct_bytes(&item))?;
    fs.set_root(tree_root);

    root.root_item = Some(item);
    fs.set_root(root.clone());

    // visible from the main tree's root directory
    let mut fs_root = fs.root(BTRFS_FS_TREE_OBJECTID)?;
    let location = btrfs_disk_key::new(objectid, BtrfsItemType::ROOT_ITEM, u64::MAX);
    let index = dir_item::next_dir_index(fs, &mut fs_root, BTRFS_FIRST_FREE_OBJECTID)?;
    dir_item::insert_dir_item(
        fs,
        trans,
        &mut fs_root,
        BTRFS_FIRST_FREE_OBJECTID,
        name.as_bytes(),
        location,
        BTRFS_FT_DIR,
    )?;
    dir_item::insert_dir_index(
        fs,
        trans,
        &mut fs_root,
        BTRFS_FIRST_FREE_OBJECTID,
        index,
        name.as_bytes(),
        location,
        BTRFS_FT_DIR,
    )?;
    fs.set_root(fs_root);

    let ref_key = btrfs_disk_key::new(BTRFS_FS_TREE_OBJECTID, BtrfsItemType::ROOT_REF, objectid);
    let rr = btrfs_root_ref {
        dirid: BTRFS_FIRST_FREE_OBJECTID,
        sequence: index,
        name_len: name.len() as u16,
    };
    let mut payload = struct_bytes(&rr).to_vec();
    payload.extend_from_slice(name.as_bytes());
    let mut tree_root = fs.root(BTRFS_ROOT_TREE_OBJECTID)?;
    ctree::insert_item(fs, trans, &mut tree_root, &ref_key, &payload)?;
    let back_key =
        btrfs_disk_key::new(objectid, BtrfsItemType::ROOT_BACKREF, BTRFS_FS_TREE_OBJECTID);
    ctree::insert_item(fs, trans, &mut tree_root, &back_key, &payload)?;
    fs.set_root(tree_root);
    Ok(root)
}

/// Step 4: the image file, pointing 1:1 at the source's still-in-place
/// blocks; only reserved-range collisions are copied into fresh space.
fn create_image_file(
    fs: &mut FsInfo,
    trans: &Transaction,
    source: &mut dyn SourceFs,
    used: &[(u64, u64)],
) -> Result<()> {
    let mut image_root = create_empty_subvol(fs, trans, IMAGE_SUBVOL_OBJECTID, IMAGE_SUBVOL_NAME)?;
    let image_ino = BTRFS_FIRST_FREE_OBJECTID + 1;
    let mut item = inode::new_inode_item(0o100600, source.total_bytes(), trans.transid);
    item.flags = BTRFS_INODE_NODATASUM | BTRFS_INODE_NODATACOW;
    item.nlink = 0;
    item.nbytes = used.iter().map(|(_, l)| l).sum();
    inode::insert_inode(fs, trans, &mut image_root, image_ino, &item)?;
    dir_item::add_link(
        fs,
        trans,
        &mut image_root,
        image_ino,
        BTRFS_FIRST_FREE_OBJECTID,
        IMAGE_FILE_NAME.as_bytes(),
        BTRFS_FT_REG_FILE,
        None,
    )?;

    // every still-in-place block leaves the free pool before any
    // relocation can allocate on top of it
    for (start, len) in used.iter().copied() {
        for (s, l) in subtract_reserved(start, len) {
            claim_existing_extent(fs, s, l)?;
        }
    }

    for (start, len) in used.iter().copied() {
        // identity parts keep their bytes, reserved collisions move
        for (s, l) in subtract_reserved(start, len) {
            let mut off = s;
            while off < s + l {
                let piece = std::cmp::min(MAX_EXTENT_BYTES, s + l - off);
                inode::insert_file_extent(
                    fs, trans, &mut image_root, image_ino, off, off, piece, piece, true,
                )?;
                extent_tree::inc_data_ref(
                    fs, trans, off, piece, IMAGE_SUBVOL_OBJECTID, image_ino, off, true,
                );
                off += piece;
            }
        }
        for (rs, rl) in reserved_ranges() {
            let cs = start.max(rs);
            let ce = (start + len).min(rs + rl);
            if cs >= ce {
                continue;
            }
            let bytes = source.read_bytes(cs, ce - cs)?;
            let new_bytenr = extent_tree::alloc_data_extent(
                fs,
                trans,
                (ce - cs).next_multiple_of(fs.sectorsize() as u64),
                IMAGE_SUBVOL_OBJECTID,
                image_ino,
                cs,
            )?;
            write_logical(&fs.devices, &fs.chunk_map, new_bytenr, &bytes)?;
            inode::insert_file_extent(
                fs,
                trans,
                &mut image_root,
                image_ino,
                cs,
                new_bytenr,
                (ce - cs).next_multiple_of(fs.sectorsize() as u64),
                ce - cs,
                true,
            )?;
            debug!("relocated reserved block {cs}..{ce} to {new_bytenr}");
        }
    }
    fs.set_root(image_root);
    Ok(())
}

/// take the space of a still-in-place source extent out of the free pool
/// before its reference is queued
fn claim_existing_extent(fs: &mut FsInfo, bytenr: u64, num_bytes: u64) -> Result<()> {
    fs.block_groups.free.remove(bytenr, num_bytes)?;
    let g = fs
        .block_groups
        .lookup_mut(bytenr)
        .ok_or_else(|| BtrfsError::corrupt(format!("extent {bytenr} outside any block group")))?;
    g.used += num_bytes;
    g.dirty = true;
    Ok(())
}

fn filetype_of(mode: u32) -> u8 {
    match mode & 0o170000 {
        0o40000 => BTRFS_FT_DIR,
        0o120000 => BTRFS_FT_SYMLINK,
        0o20000 => BTRFS_FT_CHRDEV,
        0o60000 => BTRFS_FT_BLKDEV,
        0o10000 => BTRFS_FT_FIFO,
        0o140000 => BTRFS_FT_SOCK,
        _ => BTRFS_FT_REG_FILE,
    }
}

fn translate_inode_item(src: &SourceInode, transid: u64) -> btrfs_inode_item {
    let mut item = inode::new_inode_item(src.mode, src.size, transid);
    item.uid = src.uid;
    item.gid = src.gid;
    item.nlink = src.nlink;
    item.rdev = src.rdev;
    item.flags = inode::inode_flags_from_attrs(
        src.attrs.append,
        src.attrs.immutable,
        src.attrs.noatime,
        src.attrs.nodump,
        src.attrs.sync,
        src.attrs.dirsync,
        false,
    );
    item.atime = btrfs_timespec {
        sec: src.times.atime,
        nsec: 0,
    };
    item.ctime = btrfs_timespec {
        sec: src.times.ctime,
        nsec: 0,
    };
    item.mtime = btrfs_timespec {
        sec: src.times.mtime,
        nsec: 0,
    };
    item
}

/// Step 5: inodes, directories, data mappings and xattrs
fn copy_inodes(
    fs: &mut FsInfo,
    trans: &Transaction,
    source: &mut dyn SourceFs,
    opts: &ConvertOptions,
) -> Result<()> {
    let block_size = source.block_size();
    let root_ino = source.root_ino();
    let mut fs_root = fs.root(BTRFS_FS_TREE_OBJECTID)?;
    for src in source.inodes()? {
        let ino = src.ino + INO_OFFSET;
        let mut item = translate_inode_item(&src, trans.transid);

        if src.is_dir() {
            let entries = source.dir_entries(src.ino)?;
            // the image subvolume may already occupy the first indices of
            // the root directory
            let mut index = dir_item::next_dir_index(fs, &mut fs_root, ino)?;
            let mut dirsize = 0_u64;
            for e in &entries {
                let child = e.ino + INO_OFFSET;
                let location = btrfs_disk_key::new(child, BtrfsItemType::INODE_ITEM, 0);
                dir_item::insert_dir_item(
                    fs, trans, &mut fs_root, ino, &e.name, location, e.filetype,
                )?;
                dir_item::insert_dir_index(
                    fs, trans, &mut fs_root, ino, index, &e.name, location, e.filetype,
                )?;
                dir_item::insert_inode_ref(fs, trans, &mut fs_root, child, ino, &e.name, index)?;
                dirsize += 2 * e.name.len() as u64;
                index += 1;
            }
            item.size = dirsize;
            item.nbytes = fs.nodesize() as u64;
        } else if src.is_reg() {
            let mut nbytes = 0_u64;
            for run in source.data_blocks(src.ino)? {
                if run.disk_block == 0 {
                    continue;
                }
                let mut off = 0_u64;
                while off < run.count * block_size {
                    let piece = std::cmp::min(MAX_EXTENT_BYTES, run.count * block_size - off);
                    let file_offset = run.file_block * block_size + off;
                    let disk_bytenr = run.disk_block * block_size + off;
                    inode::insert_file_extent(
                        fs,
                        trans,
                        &mut fs_root,
                        ino,
                        file_offset,
                        disk_bytenr,
                        piece,
                        piece,
                        true,
                    )?;
                    extent_tree::inc_data_ref(
                        fs,
                        trans,
                        disk_bytenr,
                        piece,
                        BTRFS_FS_TREE_OBJECTID,
                        ino,
                        file_offset,
                        true,
                    );
                    if opts.datacsum {
                        let bytes = source.read_bytes(disk_bytenr, piece)?;
                        match inode::insert_data_csums(fs, trans, disk_bytenr, &bytes) {
                            Ok(()) | Err(BtrfsError::Exists) => {}
                            Err(e) => return Err(e),
                        }
                    }
                    nbytes += piece;
                    off += piece;
                }
            }
            item.nbytes = nbytes;
            if !opts.datacsum {
                item.flags |= BTRFS_INODE_NODATASUM | BTRFS_INODE_NODATACOW;
            }
        } else if src.is_symlink() {
            let target = source.symlink_target(src.ino)?;
            item.size = target.len() as u64;
            item.nbytes = target.len() as u64;
            if src.ino != root_ino {
                inode::insert_inode(fs, trans, &mut fs_root, ino, &item)?;
            }
            inode::insert_inline_extent(
                fs,
                trans,
                &mut fs_root,
                ino,
                0,
                &target,
                BTRFS_COMPRESS_NONE,
                target.len() as u64,
            )?;
            for (name, value) in source.xattrs(src.ino)? {
                dir_item::insert_xattr(fs, trans, &mut fs_root, ino, &name, &value)?;
            }
            continue;
        }

        if src.ino == root_ino {
            // the root directory already exists; refresh its attributes
            inode::update_inode(fs, trans, &mut fs_root, ino, &item)?;
        } else {
            inode::insert_inode(fs, trans, &mut fs_root, ino, &item)?;
        }
        for (name, value) in source.xattrs(src.ino)? {
            dir_item::insert_xattr(fs, trans, &mut fs_root, ino, &name, &value)?;
        }
    }
    fs.set_root(fs_root);
    Ok(())
}

/// Convert the filesystem at `path` in place. The source keeps working
/// until the final superblock swap.
pub fn convert(
    path: &Path,
    source: &mut dyn SourceFs,
    opts: &ConvertOptions,
) -> Result<()> {
    source.check_state()?;
    let total_bytes = source.total_bytes();
    let used = source.used_space()?;
    let data_ranges = plan_data_ranges(&used, total_bytes);
    let free = free_ranges(&data_ranges, total_bytes);
    info!(
        "source: {} used ranges, {} data chunks planned",
        used.len(),
        data_ranges.len()
    );

    // step 3: bootstrap metadata inside a free range
    let need = mkfs::BOOTSTRAP_BYTES + 2 * BTRFS_STRIPE_LEN;
    let (base, _) = free
        .iter()
        .copied()
        .map(|(s, l)| {
            let aligned = s.next_multiple_of(BTRFS_STRIPE_LEN);
            (aligned, (s + l).saturating_sub(aligned))
        })
        .find(|(_, l)| *l >= need)
        .ok_or(BtrfsError::NoSpace {
            kind: "conversion bootstrap",
            needed: need,
        })?;
    let layout = BootstrapLayout {
        sb_offset: base,
        sys_chunk_start: base + BTRFS_STRIPE_LEN,
        meta_chunk_start: base + BTRFS_STRIPE_LEN + 4 * 1024 * 1024,
    };
    let mut cfg = MkfsConfig::new(vec![path.to_path_buf()]);
    if opts.copy_label {
        cfg.label = source.label();
    }
    {
        let dev = Device::open(path, true)?;
        mkfs::write_bootstrap(&dev, &cfg, layout)?;
    }

    let mut registry = Registry::new();
    let mut fsinfo = fs::open_fs(
        &mut registry,
        &[path],
        OpenFlags {
            writable: true,
            sb_bytenr: layout.sb_offset,
            ..Default::default()
        },
    )?;

    let trans = start_transaction(&mut fsinfo)?;
    for (s, l) in &data_ranges {
        insert_identity_data_chunk(&mut fsinfo, &trans, *s, *l)?;
    }
    create_image_file(&mut fsinfo, &trans, source, &used)?;
    copy_inodes(&mut fsinfo, &trans, source, opts)?;
    commit_transaction(&mut fsinfo, trans)?;

    // step 6: swap the superblock into its canonical slot
    let mut sb = fsinfo.sb;
    let dev = fsinfo
        .devices
        .get(1)
        .ok_or_else(|| BtrfsError::corrupt("devid 1 missing"))?;
    dev.zero_range(0, BTRFS_SUPER_INFO_OFFSET)?;
    dev.flush()?;
    sb.bytenr = BTRFS_SUPER_INFO_OFFSET;
    crate::superblock::write_dev_supers(dev, &sb)?;
    dev.zero_range(layout.sb_offset, BTRFS_SUPER_INFO_SIZE as u64)?;
    dev.flush()?;
    info!("conversion finished, image subvolume {IMAGE_SUBVOL_NAME}");
    Ok(())
}

struct ImageExtent {
    file_offset: u64,
    disk_bytenr: u64,
    num_bytes: u64,
}

fn image_extents(fs: &mut FsInfo, image_root: &mut TreeRoot) -> Result<Vec<ImageExtent>> {
    let image_ino = BTRFS_FIRST_FREE_OBJECTID + 1;
    let key = btrfs_disk_key::new(image_ino, BtrfsItemType::EXTENT_DATA, 0);
    let (mut path, _) = ctree::search_slot(fs, None, image_root, &key, 0, false)?;
    let mut out = Vec::new();
    loop {
        let leaf = path.leaf();
        let slot = path.slot();
        if slot >= leaf.borrow().nritems() as usize {
            if !ctree::next_leaf(fs, image_root, &mut path)? {
                break;
            }
            continue;
        }
        let k = leaf.borrow().key(slot);
        if k.objectid != image_ino || k.item_type != BtrfsItemType::EXTENT_DATA {
            break;
        }
        let fe: btrfs_file_extent_item = leaf.borrow().read_item_struct(slot, 0);
        out.push(ImageExtent {
            file_offset: k.offset,
            disk_bytenr: fe.disk_bytenr,
            num_bytes: fe.num_bytes,
        });
        if !ctree::next_item(fs, image_root, &mut path)? {
            break;
        }
    }
    Ok(out)
}

/// Undo a conversion: every non-1:1 image extent is copied back over its
/// original location, then the original boot sector area and superblock
/// return, and finally the filesystem's own metadata areas are wiped.
pub fn rollback(path: &Path) -> Result<()> {
    let mut registry = Registry::new();
    let mut fs = fs::open_fs(
        &mut registry,
        &[path],
        OpenFlags {
            writable: true,
            ..Default::default()
        },
    )?;

    // a half-finished relocation means 1:1 no longer holds
    if root_tree::read_root_item(&mut fs, BTRFS_TREE_RELOC_OBJECTID).is_ok() {
        return Err(BtrfsError::corrupt(
            "relocation tree present, rollback is not safe",
        ));
    }
    let mut fs_root = fs.root(BTRFS_FS_TREE_OBJECTID)?;
    let subvol = dir_item::lookup_dir_item(
        &mut fs,
        &mut fs_root,
        BTRFS_FIRST_FREE_OBJECTID,
        IMAGE_SUBVOL_NAME.as_bytes(),
    )?
    .ok_or_else(|| BtrfsError::corrupt("image subvolume not found"))?;
    let mut image_root = root_tree::read_fs_root(&mut fs, subvol.location.objectid)?;

    let extents = image_extents(&mut fs, &mut image_root)?;
    let mut relocated: Vec<&ImageExtent> = Vec::new();
    for e in &extents {
        if e.disk_bytenr == e.file_offset {
            continue;
        }
        let in_reserved = reserved_ranges()
            .iter()
            .any(|r| overlaps((e.file_offset, e.num_bytes), *r));
        if !in_reserved {
            return Err(BtrfsError::corrupt(format!(
                "image extent at {} was relocated outside the reserved ranges",
                e.file_offset
            )));
        }
        relocated.push(e);
    }
    info!("rollback: {} relocated extents to restore", relocated.len());

    // collect the metadata areas to wipe once the source is back
    let mut wipe: Vec<(u64, u64)> = Vec::new();
    for chunk in fs.chunk_map.iter() {
        if chunk.type_flags & BTRFS_BLOCK_GROUP_DATA == 0 {
            let size = chunk.stripe_size();
            for stripe in &chunk.stripes {
                wipe.push((stripe.physical, size));
                if chunk.type_flags & BTRFS_BLOCK_GROUP_SYSTEM != 0
                    && stripe.physical >= BTRFS_STRIPE_LEN
                {
                    // the provisional superblock sat one stripe ahead of
                    // the bootstrap system chunk
                    wipe.push((stripe.physical - BTRFS_STRIPE_LEN, BTRFS_STRIPE_LEN));
                }
            }
        }
    }

    let primary = (BTRFS_SUPER_INFO_OFFSET, BTRFS_SUPER_INFO_SIZE as u64);
    let mut last: Option<(u64, Vec<u8>)> = None;
    let mut writes: Vec<(u64, Vec<u8>)> = Vec::new();
    for e in &relocated {
        let bytes = read_logical(&fs.devices, &fs.chunk_map, e.disk_bytenr, e.num_bytes, 0)?;
        if overlaps((e.file_offset, e.num_bytes), primary) {
            last = Some((e.file_offset, bytes));
        } else {
            writes.push((e.file_offset, bytes));
        }
    }

    let dev = fs
        .devices
        .get(1)
        .ok_or_else(|| BtrfsError::corrupt("devid 1 missing"))?;
    for (offset, bytes) in &writes {
        dev.write_all_at(bytes, *offset)?;
    }
    for mirror in 1..BTRFS_SUPER_MIRROR_MAX {
        let offset = btrfs_sb_offset(mirror);
        if offset + BTRFS_SUPER_INFO_SIZE as u64 <= dev.total_bytes {
            dev.zero_range(offset, BTRFS_SUPER_INFO_SIZE as u64)?;
        }
    }
    dev.flush()?;
    // the write that makes it an ext filesystem again
    match last {
        Some((offset, bytes)) => dev.write_all_at(&bytes, offset)?,
        None => dev.zero_range(BTRFS_SUPER_INFO_OFFSET, BTRFS_SUPER_INFO_SIZE as u64)?,
    }
    dev.flush()?;
    for e in &relocated {
        // the relocated copies themselves sat in source free space
        dev.zero_range(e.disk_bytenr, e.num_bytes)?;
    }
    for (offset, len) in wipe {
        dev.zero_range(offset, len)?;
    }
    dev.flush()?;
    info!("rollback complete");
    Ok(())
}
