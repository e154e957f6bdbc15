//! Inode items, file extents and the data checksum items that shadow them.

use crate::compression;
use crate::ctree::{self, TreeRoot};
use crate::csum::{csum_data, csum_size};
use crate::error::{BtrfsError, Result};
use crate::extent_io::read_logical;
use crate::extent_tree;
use crate::fs::FsInfo;
use crate::structures::*;
use crate::transaction::Transaction;

/// iteration guard for pathological extent chains
pub const MAX_EXTENT_WALK_RETRIES: u32 = 1024;

/// translation of the generic attribute set into inode item flags
pub fn inode_flags_from_attrs(
    append: bool,
    immutable: bool,
    noatime: bool,
    nodump: bool,
    sync: bool,
    dirsync: bool,
    compress: bool,
) -> u64 {
    let mut flags = 0;
    if append {
        flags |= BTRFS_INODE_APPEND;
    }
    if immutable {
        flags |= BTRFS_INODE_IMMUTABLE;
    }
    if noatime {
        flags |= BTRFS_INODE_NOATIME;
    }
    if nodump {
        flags |= BTRFS_INODE_NODUMP;
    }
    if sync {
        flags |= BTRFS_INODE_SYNC;
    }
    if dirsync {
        flags |= BTRFS_INODE_DIRSYNC;
    }
    if compress {
        flags |= BTRFS_INODE_COMPRESS;
    }
    flags
}

pub fn new_inode_item(mode: u32, size: u64, generation: u64) -> btrfs_inode_item {
    let mut item: btrfs_inode_item = read_struct(&[0_u8; 160], 0);
    item.generation = generation;
    item.transid = generation;
    item.size = size;
    item.nlink = 1;
    item.mode = mode;
    item
}

pub fn insert_inode(
    fs: &mut FsInfo,
    trans: &Transaction,
    root: &mut TreeRoot,
    ino: u64,
    item: &btrfs_inode_item,
) -> Result<()> {
    let key = btrfs_disk_key::new(ino, BtrfsItemType::INODE_ITEM, 0);
    ctree::insert_item(fs, trans, root, &key, struct_bytes(item))
}

pub fn read_inode(fs: &mut FsInfo, root: &mut TreeRoot, ino: u64) -> Result<btrfs_inode_item> {
    let key = btrfs_disk_key::new(ino, BtrfsItemType::INODE_ITEM, 0);
    let (path, found) = ctree::search_slot(fs, None, root, &key, 0, false)?;
    if !found {
        return Err(BtrfsError::NotFound);
    }
    Ok(path.leaf().borrow().read_item_struct(path.slot(), 0))
}

pub fn update_inode(
    fs: &mut FsInfo,
    trans: &Transaction,
    root: &mut TreeRoot,
    ino: u64,
    item: &btrfs_inode_item,
) -> Result<()> {
    let key = btrfs_disk_key::new(ino, BtrfsItemType::INODE_ITEM, 0);
    let (path, found) = ctree::search_slot(fs, Some(trans), root, &key, 0, true)?;
    if !found {
        return Err(BtrfsError::NotFound);
    }
    let leaf = path.leaf();
    leaf.borrow_mut()
        .write_item_data(path.slot(), struct_bytes(item));
    leaf.borrow_mut().dirty = true;
    Ok(())
}

/// largest payload an inline extent may carry in this leaf geometry
pub fn max_inline_size(fs: &FsInfo) -> usize {
    std::cmp::min(
        fs.sectorsize() as usize - 1,
        fs.leaf_data_size()
            - std::mem::size_of::<btrfs_item>()
            - BTRFS_FILE_EXTENT_INLINE_DATA_START,
    )
    .min(2048 - BTRFS_FILE_EXTENT_INLINE_DATA_START)
}

pub fn insert_inline_extent(
    fs: &mut FsInfo,
    trans: &Transaction,
    root: &mut TreeRoot,
    ino: u64,
    file_offset: u64,
    data: &[u8],
    compression: u8,
    ram_bytes: u64,
) -> Result<()> {
    assert!(data.len() <= max_inline_size(fs));
    let fe = btrfs_file_extent_item {
        generation: trans.transid,
        ram_bytes,
        compression,
        encryption: 0,
        other_encoding: 0,
        r#type: BTRFS_FILE_EXTENT_INLINE,
        disk_bytenr: 0,
        disk_num_bytes: 0,
        offset: 0,
        num_bytes: 0,
    };
    let mut payload = Vec::with_capacity(BTRFS_FILE_EXTENT_INLINE_DATA_START + data.len());
    payload.extend_from_slice(&struct_bytes(&fe)[..BTRFS_FILE_EXTENT_INLINE_DATA_START]);
    payload.extend_from_slice(data);
    let key = btrfs_disk_key::new(ino, BtrfsItemType::EXTENT_DATA, file_offset);
    ctree::insert_item(fs, trans, root, &key, &payload)
}

/// reference `num_bytes` of an on-disk extent from `(ino, file_offset)`;
/// the data ref is queued against the extent tree as part of the insert
#[allow(clippy::too_many_arguments)]
pub fn insert_file_extent(
    fs: &mut FsInfo,
    trans: &Transaction,
    root: &mut TreeRoot,
    ino: u64,
    file_offset: u64,
    disk_bytenr: u64,
    disk_num_bytes: u64,
    num_bytes: u64,
    new_extent: bool,
) -> Result<()> {
    let fe = btrfs_file_extent_item {
        generation: trans.transid,
        ram_bytes: num_bytes,
        compression: BTRFS_COMPRESS_NONE,
        encryption: 0,
        other_encoding: 0,
        r#type: BTRFS_FILE_EXTENT_REG,
        disk_bytenr,
        disk_num_bytes,
        offset: 0,
        num_bytes,
    };
    let key = btrfs_disk_key::new(ino, BtrfsItemType::EXTENT_DATA, file_offset);
    ctree::insert_item(fs, trans, root, &key, struct_bytes(&fe))?;
    if disk_bytenr != 0 && !new_extent {
        // extents fresh from the allocator already carry their first ref
        extent_tree::inc_data_ref(
            fs,
            trans,
            disk_bytenr,
            disk_num_bytes,
            root.objectid,
            ino,
            file_offset,
            false,
        );
    }
    Ok(())
}

/// drop one file extent item, its data reference, and shrink the file
pub fn remove_file_extent(
    fs: &mut FsInfo,
    trans: &Transaction,
    root: &mut TreeRoot,
    ino: u64,
    file_offset: u64,
) -> Result<()> {
    let key = btrfs_disk_key::new(ino, BtrfsItemType::EXTENT_DATA, file_offset);
    let (mut path, found) = ctree::search_slot(fs, Some(trans), root, &key, 0, true)?;
    if !found {
        return Err(BtrfsError::NotFound);
    }
    let fe: btrfs_file_extent_item = path.leaf().borrow().read_item_struct(path.slot(), 0);
    if fe.r#type != BTRFS_FILE_EXTENT_INLINE {
        let disk_bytenr = fe.disk_bytenr;
        if disk_bytenr != 0 {
            extent_tree::drop_data_ref(
                fs,
                trans,
                disk_bytenr,
                fe.disk_num_bytes,
                root.objectid,
                ino,
                file_offset,
            );
        }
    }
    ctree::delete_item(fs, trans, root, &mut path)
}

/// Materialize a file's content by walking its extent items: inline data is
/// decompressed in place, holes read back as zeroes, and regular extents go
/// through the chunk mapping.
pub fn read_file(fs: &mut FsInfo, root: &mut TreeRoot, ino: u64) -> Result<Vec<u8>> {
    let inode = read_inode(fs, root, ino)?;
    let size = inode.size;
    let mut out = vec![0_u8; size as usize];

    let key = btrfs_disk_key::new(ino, BtrfsItemType::EXTENT_DATA, 0);
    let (mut path, _) = ctree::search_slot(fs, None, root, &key, 0, false)?;
    let mut retries = 0_u32;
    loop {
        let leaf = path.leaf();
        let slot = path.slot();
        let n = leaf.borrow().nritems() as usize;
        if slot >= n {
            if !ctree::next_leaf(fs, root, &mut path)? {
                break;
            }
            retries += 1;
            if retries >= MAX_EXTENT_WALK_RETRIES {
                return Err(BtrfsError::corrupt(format!(
                    "extent walk for inode {ino} does not terminate"
                )));
            }
            continue;
        }
        let k = leaf.borrow().key(slot);
        if k.objectid != ino || k.item_type != BtrfsItemType::EXTENT_DATA {
            if k.objectid > ino {
                break;
            }
            if !ctree::next_item(fs, root, &mut path)? {
                break;
            }
            continue;
        }
        let file_offset = k.offset;
        let fe: btrfs_file_extent_item = leaf.borrow().read_item_struct(slot, 0);
        match fe.r#type {
            BTRFS_FILE_EXTENT_INLINE => {
                let raw = leaf.borrow().item_data(slot);
                let inline = &raw[BTRFS_FILE_EXTENT_INLINE_DATA_START..];
                let ram = fe.ram_bytes as usize;
                let bytes = compression::decompress(inline, fe.compression, ram)?;
                let end = std::cmp::min(file_offset as usize + bytes.len(), out.len());
                out[file_offset as usize..end]
                    .copy_from_slice(&bytes[..end - file_offset as usize]);
            }
            BTRFS_FILE_EXTENT_REG | BTRFS_FILE_EXTENT_PREALLOC => {
                let disk_bytenr = fe.disk_bytenr;
                if disk_bytenr != 0 && fe.r#type == BTRFS_FILE_EXTENT_REG {
                    let disk = read_logical(
                        &fs.devices,
                        &fs.chunk_map,
                        disk_bytenr,
                        fe.disk_num_bytes,
                        0,
                    )?;
                    let decoded = if fe.compression == BTRFS_COMPRESS_NONE {
                        disk
                    } else {
                        compression::decompress(&disk, fe.compression, fe.ram_bytes as usize)?
                    };
                    let from = fe.offset as usize;
                    let want = fe.num_bytes as usize;
                    let avail = decoded.len().saturating_sub(from).min(want);
                    let end = std::cmp::min(file_offset as usize + avail, out.len());
                    if end > file_offset as usize {
                        out[file_offset as usize..end]
                            .copy_from_slice(&decoded[from..from + (end - file_offset as usize)]);
                    }
                }
                // holes and prealloc stay zero
            }
            other => {
                return Err(BtrfsError::corrupt(format!(
                    "unknown file extent type {other}"
                )))
            }
        }
        if !ctree::next_item(fs, root, &mut path)? {
            break;
        }
    }
    Ok(out)
}

/// per-sector checksums of a fresh data extent, one csum item per call
pub fn insert_data_csums(
    fs: &mut FsInfo,
    trans: &Transaction,
    bytenr: u64,
    data: &[u8],
) -> Result<()> {
    let sectorsize = fs.sectorsize() as usize;
    assert_eq!(data.len() % sectorsize, 0);
    let csize = csum_size(fs.csum_type());
    let mut payload = Vec::with_capacity(data.len() / sectorsize * csize);
    for sector in data.chunks(sectorsize) {
        let cs = csum_data(sector, fs.csum_type());
        payload.extend_from_slice(&cs[..csize]);
    }
    let key = btrfs_disk_key::new(BTRFS_EXTENT_CSUM_OBJECTID, BtrfsItemType::EXTENT_CSUM, bytenr);
    let mut csum_root = fs.root(BTRFS_CSUM_TREE_OBJECTID)?;
    ctree::insert_item(fs, trans, &mut csum_root, &key, &payload)?;
    fs.set_root(csum_root);
    Ok(())
}

/// the stored checksum of the sector at `bytenr`, if any
pub fn lookup_data_csum(fs: &mut FsInfo, bytenr: u64) -> Result<Option<Vec<u8>>> {
    let mut csum_root = fs.root(BTRFS_CSUM_TREE_OBJECTID)?;
    let sectorsize = fs.sectorsize() as u64;
    let csize = csum_size(fs.csum_type());
    let key = btrfs_disk_key::new(BTRFS_EXTENT_CSUM_OBJECTID, BtrfsItemType::EXTENT_CSUM, bytenr);
    let (path, found) = ctree::search_slot(fs, None, &mut csum_root, &key, 0, false)?;
    let (leaf, slot) = if found {
        (path.leaf(), path.slot())
    } else {
        // the covering item starts below; step back one
        let mut path = path;
        if !ctree::prev_item(fs, &csum_root, &mut path)? {
            return Ok(None);
        }
        (path.leaf(), path.slot())
    };
    let k = leaf.borrow().key(slot);
    if k.objectid != BTRFS_EXTENT_CSUM_OBJECTID || k.item_type != BtrfsItemType::EXTENT_CSUM {
        return Ok(None);
    }
    let item_len = leaf.borrow().item(slot).size as u64;
    let covered = item_len / csize as u64 * sectorsize;
    if bytenr < k.offset || bytenr >= k.offset + covered {
        return Ok(None);
    }
    let idx = ((bytenr - k.offset) / sectorsize) as usize;
    let data = leaf.borrow().item_data(slot);
    Ok(Some(data[idx * csize..(idx + 1) * csize].to_vec()))
}

/// remove every csum item covering `[bytenr, bytenr+len)`
pub fn remove_data_csums(
    fs: &mut FsInfo,
    trans: &Transaction,
    bytenr: u64,
    len: u64,
) -> Result<()> {
    let Ok(mut csum_root) = fs.root(BTRFS_CSUM_TREE_OBJECTID) else {
        return Ok(());
    };
    loop {
        let key = btrfs_disk_key::new(BTRFS_EXTENT_CSUM_OBJECTID, BtrfsItemType::EXTENT_CSUM, bytenr);
        let (mut path, found) = ctree::search_slot(fs, Some(trans), &mut csum_root, &key, 0, true)?;
        if !found {
            let leaf = path.leaf();
            let slot = path.slot();
            let n = leaf.borrow().nritems() as usize;
            if slot >= n {
                break;
            }
            let k = leaf.borrow().key(slot);
            if k.item_type != BtrfsItemType::EXTENT_CSUM || k.offset >= bytenr + len {
                break;
            }
            ctree::delete_item(fs, trans, &mut csum_root, &mut path)?;
            continue;
        }
        ctree::delete_item(fs, trans, &mut csum_root, &mut path)?;
    }
    fs.set_root(csum_root);
    Ok(())
}

/// orphan items park half-deleted inodes for the next writable open
pub fn insert_orphan_item(
    fs: &mut FsInfo,
    trans: &Transaction,
    root: &mut TreeRoot,
    ino: u64,
) -> Result<()> {
    let key = btrfs_disk_key::new(BTRFS_ORPHAN_OBJECTID, BtrfsItemType::ORPHAN_ITEM, ino);
    ctree::insert_item(fs, trans, root, &key, &[])
}

/// finish unlinks a crash left behind: drop the inode's items and the
/// orphan marker itself
pub fn process_orphans(fs: &mut FsInfo, trans: &Transaction, root_objectid: u64) -> Result<()> {
    let mut root = crate::root_tree::read_fs_root(fs, root_objectid)?;
    loop {
        let key = btrfs_disk_key::new(BTRFS_ORPHAN_OBJECTID, BtrfsItemType::ORPHAN_ITEM, 0);
        let (mut path, found) = ctree::search_slot(fs, None, &mut root, &key, 0, false)?;
        if !found && !ctree::normalize_slot(fs, &root, &mut path)? {
            break;
        }
        let ino = {
            let k = path.leaf().borrow().key(path.slot());
            if k.objectid != BTRFS_ORPHAN_OBJECTID || k.item_type != BtrfsItemType::ORPHAN_ITEM {
                break;
            }
            k.offset
        };
        drop_inode_items(fs, trans, &mut root, ino)?;
        let okey = btrfs_disk_key::new(BTRFS_ORPHAN_OBJECTID, BtrfsItemType::ORPHAN_ITEM, ino);
        let (mut path, found) = ctree::search_slot(fs, Some(trans), &mut root, &okey, 0, true)?;
        if found {
            ctree::delete_item(fs, trans, &mut root, &mut path)?;
        }
    }
    fs.set_root(root);
    Ok(())
}

/// delete every item keyed by this inode, dropping data refs on the way
pub fn drop_inode_items(
    fs: &mut FsInfo,
    trans: &Transaction,
    root: &mut TreeRoot,
    ino: u64,
) -> Result<()> {
    loop {
        let key = btrfs_disk_key::new(ino, BtrfsItemType::MIN, 0);
        let (mut path, _) = ctree::search_slot(fs, Some(trans), root, &key, 0, true)?;
        if !ctree::normalize_slot(fs, root, &mut path)? {
            break;
        }
        let (k, is_extent) = {
            let k = path.leaf().borrow().key(path.slot());
            (k, k.item_type == BtrfsItemType::EXTENT_DATA)
        };
        if k.objectid != ino {
            break;
        }
        if is_extent {
            let fe: btrfs_file_extent_item = path.leaf().borrow().read_item_struct(path.slot(), 0);
            if fe.r#type != BTRFS_FILE_EXTENT_INLINE {
                let disk_bytenr = fe.disk_bytenr;
                if disk_bytenr != 0 {
                    extent_tree::drop_data_ref(
                        fs,
                        trans,
                        disk_bytenr,
                        fe.disk_num_bytes,
                        root.objectid,
                        ino,
                        k.offset,
                    );
                }
            }
        }
        ctree::delete_item(fs, trans, root, &mut path)?;
    }
    Ok(())
}
