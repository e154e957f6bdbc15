//! Directory linkage: the hash-keyed dir items, creation-ordered indices,
//! and the inode refs that point back at the parents.

use crate::csum::{btrfs_crc32c, btrfs_name_hash};
use crate::ctree::{self, TreeRoot};
use crate::error::{BtrfsError, Result};
use crate::fs::FsInfo;
use crate::inode;
use crate::structures::*;
use crate::transaction::Transaction;

use log::debug;

/// hash for the scalable extref fallback, seeded by the parent inode
pub fn extref_hash(parent_ino: u64, name: &[u8]) -> u64 {
    btrfs_crc32c(parent_ino as u32, name) as u64
}

/// one decoded entry of a DIR_ITEM / DIR_INDEX / XATTR_ITEM payload
#[derive(Clone, Debug)]
pub struct DirEntry {
    pub location: btrfs_disk_key,
    pub transid: u64,
    pub filetype: u8,
    pub name: Vec<u8>,
    pub data: Vec<u8>,
}

pub fn decode_dir_entries(payload: &[u8]) -> Result<Vec<DirEntry>> {
    let mut out = Vec::new();
    let mut off = 0;
    while off < payload.len() {
        if payload.len() - off < std::mem::size_of::<btrfs_dir_item>() {
            return Err(BtrfsError::corrupt("truncated dir item"));
        }
        let di: btrfs_dir_item = read_struct(payload, off);
        off += std::mem::size_of::<btrfs_dir_item>();
        let name_len = di.name_len as usize;
        let data_len = di.data_len as usize;
        if payload.len() - off < name_len + data_len {
            return Err(BtrfsError::corrupt("dir item name overruns item"));
        }
        out.push(DirEntry {
            location: di.location,
            transid: di.transid,
            filetype: di.r#type,
            name: payload[off..off + name_len].to_vec(),
            data: payload[off + name_len..off + name_len + data_len].to_vec(),
        });
        off += name_len + data_len;
    }
    Ok(out)
}

pub fn encode_dir_entries(entries: &[DirEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    for e in entries {
        let di = btrfs_dir_item {
            location: e.location,
            transid: e.transid,
            data_len: e.data.len() as u16,
            name_len: e.name.len() as u16,
            r#type: e.filetype,
        };
        out.extend_from_slice(struct_bytes(&di));
        out.extend_from_slice(&e.name);
        out.extend_from_slice(&e.data);
    }
    out
}

/// insert into the hash-chained item, growing the overflow list on collision
fn insert_hash_entry(
    fs: &mut FsInfo,
    trans: &Transaction,
    root: &mut TreeRoot,
    key: &btrfs_disk_key,
    entry: DirEntry,
) -> Result<()> {
    let (mut path, found) = ctree::search_slot(fs, Some(trans), root, key, 0, true)?;
    if !found {
        drop(path);
        let payload = encode_dir_entries(std::slice::from_ref(&entry));
        return ctree::insert_item(fs, trans, root, key, &payload);
    }
    let mut entries = decode_dir_entries(&path.item_data())?;
    if entries.iter().any(|e| e.name == entry.name) {
        return Err(BtrfsError::Exists);
    }
    entries.push(entry);
    let payload = encode_dir_entries(&entries);
    ctree::delete_item(fs, trans, root, &mut path)?;
    ctree::insert_item(fs, trans, root, key, &payload)
}

pub fn insert_dir_item(
    fs: &mut FsInfo,
    trans: &Transaction,
    root: &mut TreeRoot,
    dir_ino: u64,
    name: &[u8],
    location: btrfs_disk_key,
    filetype: u8,
) -> Result<()> {
    let key = btrfs_disk_key::new(dir_ino, BtrfsItemType::DIR_ITEM, btrfs_name_hash(name));
    insert_hash_entry(
        fs,
        trans,
        root,
        &key,
        DirEntry {
            location,
            transid: trans.transid,
            filetype,
            name: name.to_vec(),
            data: Vec::new(),
        },
    )
}

pub fn insert_dir_index(
    fs: &mut FsInfo,
    trans: &Transaction,
    root: &mut TreeRoot,
    dir_ino: u64,
    index: u64,
    name: &[u8],
    location: btrfs_disk_key,
    filetype: u8,
) -> Result<()> {
    let key = btrfs_disk_key::new(dir_ino, BtrfsItemType::DIR_INDEX, index);
    let entry = DirEntry {
        location,
        transid: trans.transid,
        filetype,
        name: name.to_vec(),
        data: Vec::new(),
    };
    let payload = encode_dir_entries(std::slice::from_ref(&entry));
    ctree::insert_item(fs, trans, root, &key, &payload)
}

/// xattrs ride the same wire format keyed by the attribute name hash
pub fn insert_xattr(
    fs: &mut FsInfo,
    trans: &Transaction,
    root: &mut TreeRoot,
    ino: u64,
    name: &[u8],
    value: &[u8],
) -> Result<()> {
    let key = btrfs_disk_key::new(ino, BtrfsItemType::XATTR_ITEM, btrfs_name_hash(name));
    insert_hash_entry(
        fs,
        trans,
        root,
        &key,
        DirEntry {
            location: btrfs_disk_key::new(0, BtrfsItemType::MIN, 0),
            transid: trans.transid,
            filetype: BTRFS_FT_XATTR,
            name: name.to_vec(),
            data: value.to_vec(),
        },
    )
}

pub fn lookup_dir_item(
    fs: &mut FsInfo,
    root: &mut TreeRoot,
    dir_ino: u64,
    name: &[u8],
) -> Result<Option<DirEntry>> {
    let key = btrfs_disk_key::new(dir_ino, BtrfsItemType::DIR_ITEM, btrfs_name_hash(name));
    let (path, found) = ctree::search_slot(fs, None, root, &key, 0, false)?;
    if !found {
        return Ok(None);
    }
    let entries = decode_dir_entries(&path.item_data())?;
    Ok(entries.into_iter().find(|e| e.name == name))
}

/// highest DIR_INDEX sequence in use, so new links append in order
pub fn next_dir_index(fs: &mut FsInfo, root: &mut TreeRoot, dir_ino: u64) -> Result<u64> {
    let key = btrfs_disk_key::new(dir_ino, BtrfsItemType::DIR_INDEX, u64::MAX);
    let (mut path, found) = ctree::search_slot(fs, None, root, &key, 0, false)?;
    if !found {
        let n = path.leaf().borrow().nritems() as usize;
        if path.slot() >= n && !ctree::prev_item(fs, root, &mut path)? {
            return Ok(2);
        } else if path.slot() < n {
            // slot points past the last DIR_INDEX; step back to it
            if !ctree::prev_item(fs, root, &mut path)? {
                return Ok(2);
            }
        }
    }
    let k = path.leaf().borrow().key(path.slot());
    if k.objectid == dir_ino && k.item_type == BtrfsItemType::DIR_INDEX {
        Ok(k.offset + 1)
    } else {
        // indices start at 2, after the implied . and ..
        Ok(2)
    }
}

pub fn insert_inode_ref(
    fs: &mut FsInfo,
    trans: &Transaction,
    root: &mut TreeRoot,
    child_ino: u64,
    parent_ino: u64,
    name: &[u8],
    index: u64,
) -> Result<()> {
    let key = btrfs_disk_key::new(child_ino, BtrfsItemType::INODE_REF, parent_ino);
    let iref = btrfs_inode_ref {
        index,
        name_len: name.len() as u16,
    };
    let mut entry = Vec::with_capacity(std::mem::size_of::<btrfs_inode_ref>() + name.len());
    entry.extend_from_slice(struct_bytes(&iref));
    entry.extend_from_slice(name);

    let (mut path, found) = ctree::search_slot(fs, Some(trans), root, &key, 0, true)?;
    if !found {
        drop(path);
        return ctree::insert_item(fs, trans, root, &key, &entry);
    }
    let mut payload = path.item_data();
    // the inline list only grows so far before the scalable extref takes over
    if payload.len() + entry.len() > fs.leaf_data_size() / 4 {
        drop(path);
        let ekey = btrfs_disk_key::new(
            child_ino,
            BtrfsItemType::INODE_EXTREF,
            extref_hash(parent_ino, name),
        );
        let eref = btrfs_inode_extref {
            parent_objectid: parent_ino,
            index,
            name_len: name.len() as u16,
        };
        let mut epayload = Vec::new();
        epayload.extend_from_slice(struct_bytes(&eref));
        epayload.extend_from_slice(name);
        return ctree::insert_item(fs, trans, root, &ekey, &epayload);
    }
    payload.extend_from_slice(&entry);
    ctree::delete_item(fs, trans, root, &mut path)?;
    ctree::insert_item(fs, trans, root, &key, &payload)
}

fn remove_inode_ref(
    fs: &mut FsInfo,
    trans: &Transaction,
    root: &mut TreeRoot,
    child_ino: u64,
    parent_ino: u64,
    name: &[u8],
) -> Result<()> {
    let key = btrfs_disk_key::new(child_ino, BtrfsItemType::INODE_REF, parent_ino);
    let (mut path, found) = ctree::search_slot(fs, Some(trans), root, &key, 0, true)?;
    if found {
        let payload = path.item_data();
        let mut entries: Vec<(btrfs_inode_ref, Vec<u8>)> = Vec::new();
        let mut off = 0;
        while off < payload.len() {
            let r: btrfs_inode_ref = read_struct(&payload, off);
            off += std::mem::size_of::<btrfs_inode_ref>();
            let n = payload[off..off + r.name_len as usize].to_vec();
            off += r.name_len as usize;
            entries.push((r, n));
        }
        let before = entries.len();
        entries.retain(|(_, n)| n != name);
        if entries.len() == before {
            return Err(BtrfsError::NotFound);
        }
        if entries.is_empty() {
            ctree::delete_item(fs, trans, root, &mut path)?;
            return Ok(());
        }
        // shrink the surviving list in place
        let mut payload = Vec::new();
        for (r, n) in entries {
            payload.extend_from_slice(struct_bytes(&r));
            payload.extend_from_slice(&n);
        }
        let leaf = path.leaf();
        leaf.borrow_mut().write_item_data(path.slot(), &payload);
        ctree::truncate_item(&mut path, payload.len())?;
        leaf.borrow_mut().dirty = true;
        return Ok(());
    }
    drop(path);
    let ekey = btrfs_disk_key::new(
        child_ino,
        BtrfsItemType::INODE_EXTREF,
        extref_hash(parent_ino, name),
    );
    let (mut path, found) = ctree::search_slot(fs, Some(trans), root, &ekey, 0, true)?;
    if !found {
        return Err(BtrfsError::NotFound);
    }
    ctree::delete_item(fs, trans, root, &mut path)
}

/// Wire `(parent, name) -> child` through all three directory records and
/// adjust the inode counters, atomically within the caller's transaction.
pub fn add_link(
    fs: &mut FsInfo,
    trans: &Transaction,
    root: &mut TreeRoot,
    child_ino: u64,
    parent_ino: u64,
    name: &[u8],
    filetype: u8,
    index: Option<u64>,
) -> Result<()> {
    if name.len() > BTRFS_NAME_LEN {
        return Err(BtrfsError::InvalidArgument("name too long".into()));
    }
    let mut parent = inode::read_inode(fs, root, parent_ino)?;
    let pmode = parent.mode;
    if pmode & 0o170000 != 0o40000 {
        return Err(BtrfsError::InvalidArgument(format!(
            "inode {parent_ino} is not a directory"
        )));
    }
    if lookup_dir_item(fs, root, parent_ino, name)?.is_some() {
        return Err(BtrfsError::Exists);
    }
    let index = match index {
        Some(i) => {
            let probe = btrfs_disk_key::new(parent_ino, BtrfsItemType::DIR_INDEX, i);
            let (_, taken) = ctree::search_slot(fs, None, root, &probe, 0, false)?;
            if taken {
                return Err(BtrfsError::Exists);
            }
            i
        }
        None => next_dir_index(fs, root, parent_ino)?,
    };

    let location = btrfs_disk_key::new(child_ino, BtrfsItemType::INODE_ITEM, 0);
    insert_dir_item(fs, trans, root, parent_ino, name, location, filetype)?;
    insert_dir_index(fs, trans, root, parent_ino, index, name, location, filetype)?;
    insert_inode_ref(fs, trans, root, child_ino, parent_ino, name, index)?;

    let mut child = inode::read_inode(fs, root, child_ino)?;
    child.nlink += 1;
    inode::update_inode(fs, trans, root, child_ino, &child)?;
    parent.size += 2 * name.len() as u64;
    inode::update_inode(fs, trans, root, parent_ino, &parent)?;
    debug!(
        "linked {} as {:?} under {}",
        child_ino,
        String::from_utf8_lossy(name),
        parent_ino
    );
    Ok(())
}

/// inverse of add_link; with `add_orphan` the inode is parked for a future
/// mount to finish when its link count reaches zero
#[allow(clippy::too_many_arguments)]
pub fn unlink(
    fs: &mut FsInfo,
    trans: &Transaction,
    root: &mut TreeRoot,
    child_ino: u64,
    parent_ino: u64,
    name: &[u8],
    index: u64,
    add_orphan: bool,
) -> Result<()> {
    // DIR_ITEM: drop the one entry, keep the collision chain
    let key = btrfs_disk_key::new(parent_ino, BtrfsItemType::DIR_ITEM, btrfs_name_hash(name));
    let (mut path, found) = ctree::search_slot(fs, Some(trans), root, &key, 0, true)?;
    if !found {
        return Err(BtrfsError::NotFound);
    }
    let mut entries = decode_dir_entries(&path.item_data())?;
    let before = entries.len();
    entries.retain(|e| e.name != name);
    if entries.len() == before {
        return Err(BtrfsError::NotFound);
    }
    ctree::delete_item(fs, trans, root, &mut path)?;
    if !entries.is_empty() {
        let payload = encode_dir_entries(&entries);
        ctree::insert_item(fs, trans, root, &key, &payload)?;
    }

    let ikey = btrfs_disk_key::new(parent_ino, BtrfsItemType::DIR_INDEX, index);
    let (mut path, found) = ctree::search_slot(fs, Some(trans), root, &ikey, 0, true)?;
    if found {
        ctree::delete_item(fs, trans, root, &mut path)?;
    }

    remove_inode_ref(fs, trans, root, child_ino, parent_ino, name)?;

    let mut parent = inode::read_inode(fs, root, parent_ino)?;
    parent.size = parent.size.saturating_sub(2 * name.len() as u64);
    inode::update_inode(fs, trans, root, parent_ino, &parent)?;

    let mut child = inode::read_inode(fs, root, child_ino)?;
    child.nlink = child.nlink.saturating_sub(1);
    inode::update_inode(fs, trans, root, child_ino, &child)?;
    if child.nlink == 0 && add_orphan {
        inode::insert_orphan_item(fs, trans, root, child_ino)?;
    }
    Ok(())
}

/// inode number allocation: one past the highest inode key in the tree
pub fn find_free_ino(fs: &mut FsInfo, root: &mut TreeRoot) -> Result<u64> {
    let key = btrfs_disk_key::new(BTRFS_LAST_FREE_OBJECTID, BtrfsItemType::MIN, 0);
    let (mut path, _) = ctree::search_slot(fs, None, root, &key, 0, false)?;
    // step to the last key below the reserved upper range
    if !ctree::prev_item(fs, root, &mut path)? {
        return Ok(BTRFS_FIRST_FREE_OBJECTID);
    }
    let k = path.leaf().borrow().key(path.slot());
    if k.objectid >= BTRFS_FIRST_FREE_OBJECTID && k.objectid < BTRFS_LAST_FREE_OBJECTID {
        Ok(k.objectid + 1)
    } else {
        Ok(BTRFS_FIRST_FREE_OBJECTID)
    }
}

/// Reattach an unreferenced inode under `lost+found`, creating the
/// directory on demand and suffixing the name until it is free.
pub fn link_inode_to_lost_found(
    fs: &mut FsInfo,
    trans: &Transaction,
    root: &mut TreeRoot,
    ino: u64,
    base_name: &str,
) -> Result<Vec<u8>> {
    let root_dir = root
        .root_item
        .as_ref()
        .map(|i| i.root_dirid)
        .unwrap_or(BTRFS_FIRST_FREE_OBJECTID);

    let lf_ino = match lookup_dir_item(fs, root, root_dir, b"lost+found")? {
        Some(e) => e.location.objectid,
        None => {
            let new_ino = find_free_ino(fs, root)?;
            let mut dir = inode::new_inode_item(0o40700, 0, trans.transid);
            dir.nlink = 0; // add_link raises it
            inode::insert_inode(fs, trans, root, new_ino, &dir)?;
            add_link(fs, trans, root, new_ino, root_dir, b"lost+found", BTRFS_FT_DIR, None)?;
            new_ino
        }
    };

    let ftype = {
        let item = inode::read_inode(fs, root, ino)?;
        let mode = item.mode;
        match mode & 0o170000 {
            0o40000 => BTRFS_FT_DIR,
            0o120000 => BTRFS_FT_SYMLINK,
            _ => BTRFS_FT_REG_FILE,
        }
    };

    let mut name = base_name.as_bytes().to_vec();
    name.truncate(BTRFS_NAME_LEN);
    loop {
        match add_link(fs, trans, root, ino, lf_ino, &name, ftype, None) {
            Ok(()) => return Ok(name),
            Err(BtrfsError::Exists) => {
                let suffix = format!(".{ino}");
                let keep = BTRFS_NAME_LEN.saturating_sub(suffix.len());
                let mut base = base_name.as_bytes().to_vec();
                base.truncate(keep);
                base.extend_from_slice(suffix.as_bytes());
                if base == name {
                    return Err(BtrfsError::Exists);
                }
                name = base;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_entry_codec_round_trip() {
        let entries = vec![
            DirEntry {
                location: btrfs_disk_key::new(257, BtrfsItemType::INODE_ITEM, 0),
                transid: 4,
                filetype: BTRFS_FT_REG_FILE,
                name: b"hello".to_vec(),
                data: Vec::new(),
            },
            DirEntry {
                location: btrfs_disk_key::new(258, BtrfsItemType::INODE_ITEM, 0),
                transid: 4,
                filetype: BTRFS_FT_DIR,
                name: b"colliding".to_vec(),
                data: Vec::new(),
            },
        ];
        let enc = encode_dir_entries(&entries);
        let back = decode_dir_entries(&enc).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].name, b"hello");
        assert_eq!(back[1].filetype, BTRFS_FT_DIR);
        let back1_location_objectid = back[1].location.objectid;
        assert_eq!(back1_location_objectid, 258);
    }

    #[test]
    fn xattr_entries_carry_data() {
        let e = DirEntry {
            location: btrfs_disk_key::new(0, BtrfsItemType::MIN, 0),
            transid: 1,
            filetype: BTRFS_FT_XATTR,
            name: b"user.test".to_vec(),
            data: b"value".to_vec(),
        };
        let back = decode_dir_entries(&encode_dir_entries(std::slice::from_ref(&e))).unwrap();
        assert_eq!(back[0].data, b"value");
    }

    #[test]
    fn truncated_payload_is_corrupt() {
        let e = DirEntry {
            location: btrfs_disk_key::new(1, BtrfsItemType::INODE_ITEM, 0),
            transid: 1,
            filetype: BTRFS_FT_REG_FILE,
            name: b"x".to_vec(),
            data: Vec::new(),
        };
        let mut enc = encode_dir_entries(std::slice::from_ref(&e));
        enc.truncate(enc.len() - 1);
        assert!(decode_dir_entries(&enc).is_err());
    }
}
