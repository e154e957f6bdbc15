//! Root items, root refs and subvolume/snapshot creation.

use crate::ctree::{self, TreeRoot};
use crate::csum::btrfs_name_hash;
use crate::error::{BtrfsError, Result};
use crate::fs::FsInfo;
use crate::structures::*;
use crate::transaction::Transaction;

use log::debug;

/// locate the ROOT_ITEM of a tree regardless of its key offset
pub fn read_root_item(fs: &mut FsInfo, objectid: u64) -> Result<(btrfs_root_item, u64)> {
    let mut tree_root = fs.root(BTRFS_ROOT_TREE_OBJECTID)?;
    let key = btrfs_disk_key::new(objectid, BtrfsItemType::ROOT_ITEM, 0);
    let (mut path, found) = ctree::search_slot(fs, None, &mut tree_root, &key, 0, false)?;
    if !found && !ctree::normalize_slot(fs, &tree_root, &mut path)? {
        return Err(BtrfsError::NotFound);
    }
    let leaf = path.leaf();
    let slot = path.slot();
    let k = if found {
        key
    } else {
        let k = leaf.borrow().key(slot);
        if k.objectid != objectid || k.item_type != BtrfsItemType::ROOT_ITEM {
            return Err(BtrfsError::NotFound);
        }
        k
    };
    let item: btrfs_root_item = leaf.borrow().read_item_struct(slot, 0);
    Ok((item, k.offset))
}

/// a root item whose embedded inode makes the tree look like a directory
pub fn default_root_item(bytenr: u64, level: u8, generation: u64) -> btrfs_root_item {
    let mut item: btrfs_root_item = read_struct(&[0_u8; 439], 0);
    item.inode.generation = 1;
    item.inode.size = 3;
    item.inode.nlink = 1;
    item.inode.nbytes = 16384;
    item.inode.mode = 0o40755;
    item.generation = generation;
    item.generation_v2 = generation;
    item.bytenr = bytenr;
    item.level = level;
    item.refs = 1;
    item.root_dirid = BTRFS_FIRST_FREE_OBJECTID;
    item.drop_progress = btrfs_disk_key::new(0, BtrfsItemType::MIN, 0);
    item
}

/// write the tree's current top into its root item, inserting one if the
/// tree is new this transaction
pub fn update_root_item(fs: &mut FsInfo, trans: &Transaction, objectid: u64) -> Result<()> {
    let mut root = fs.root(objectid)?;
    let mut item = root
        .root_item
        .unwrap_or_else(|| default_root_item(root.bytenr, root.level, root.generation));
    item.bytenr = root.bytenr;
    item.level = root.level;
    item.generation = root.generation;
    item.generation_v2 = root.generation;
    item.last_snapshot = root.last_snapshot;

    let mut tree_root = fs.root(BTRFS_ROOT_TREE_OBJECTID)?;
    let probe = btrfs_disk_key::new(objectid, BtrfsItemType::ROOT_ITEM, 0);
    let (mut path, found) = ctree::search_slot(fs, Some(trans), &mut tree_root, &probe, 0, true)?;
    let exact = if found {
        Some(probe)
    } else if ctree::normalize_slot(fs, &tree_root, &mut path)? {
        let k = path.leaf().borrow().key(path.slot());
        (k.objectid == objectid && k.item_type == BtrfsItemType::ROOT_ITEM).then_some(k)
    } else {
        None
    };
    match exact {
        Some(_) => {
            let leaf = path.leaf();
            leaf.borrow_mut()
                .write_item_data(path.slot(), struct_bytes(&item));
            leaf.borrow_mut().dirty = true;
        }
        None => {
            drop(path);
            let key = btrfs_disk_key::new(objectid, BtrfsItemType::ROOT_ITEM, 0);
            ctree::insert_item(fs, trans, &mut tree_root, &key, struct_bytes(&item))?;
        }
    }
    fs.set_root(tree_root);
    root.root_item = Some(item);
    fs.set_root(root);
    Ok(())
}

/// fetch (and cache) a subvolume root by objectid
pub fn read_fs_root(fs: &mut FsInfo, objectid: u64) -> Result<TreeRoot> {
    if let Ok(r) = fs.root(objectid) {
        return Ok(r);
    }
    let (item, _) = read_root_item(fs, objectid)?;
    let root = TreeRoot::from_item(objectid, &item);
    fs.set_root(root.clone());
    Ok(root)
}

fn insert_root_ref(
    fs: &mut FsInfo,
    trans: &Transaction,
    key: &btrfs_disk_key,
    dirid: u64,
    sequence: u64,
    name: &[u8],
) -> Result<()> {
    let rr = btrfs_root_ref {
        dirid,
        sequence,
        name_len: name.len() as u16,
    };
    let mut payload = Vec::with_capacity(std::mem::size_of::<btrfs_root_ref>() + name.len());
    payload.extend_from_slice(struct_bytes(&rr));
    payload.extend_from_slice(name);
    let mut tree_root = fs.root(BTRFS_ROOT_TREE_OBJECTID)?;
    ctree::insert_item(fs, trans, &mut tree_root, key, &payload)?;
    fs.set_root(tree_root);
    Ok(())
}

/// map a subvolume uuid to its root objectid in the uuid tree
pub fn uuid_tree_add(
    fs: &mut FsInfo,
    trans: &Transaction,
    uuid: &BtrfsUuid,
    key_type: BtrfsItemType,
    subvol_id: u64,
) -> Result<()> {
    let mut uuid_root = match fs.root(BTRFS_UUID_TREE_OBJECTID) {
        Ok(r) => r,
        Err(_) => {
            let eb = ctree::alloc_empty_block(fs, trans, BTRFS_UUID_TREE_OBJECTID, 0)?;
            let bytenr = eb.borrow().bytenr;
            let root = TreeRoot::new(BTRFS_UUID_TREE_OBJECTID, bytenr, 0, trans.transid);
            fs.set_root(root.clone());
            root
        }
    };
    let lo = u64::from_le_bytes(uuid[0..8].try_into().unwrap());
    let hi = u64::from_le_bytes(uuid[8..16].try_into().unwrap());
    let key = btrfs_disk_key::new(lo, key_type, hi);
    ctree::insert_item(fs, trans, &mut uuid_root, &key, &subvol_id.to_le_bytes())?;
    fs.set_root(uuid_root);
    fs.sb.uuid_tree_generation = trans.transid;
    Ok(())
}

/// Create a subvolume (or snapshot, when `src` names an existing tree):
/// clone the source top block, write the new root item, name it in the
/// root-tree directory and tie parent and child with mutual refs.
pub fn mksubvol(
    fs: &mut FsInfo,
    trans: &Transaction,
    src_objectid: u64,
    name: &str,
    new_objectid: u64,
) -> Result<TreeRoot> {
    if !(BTRFS_FIRST_FREE_OBJECTID..=BTRFS_LAST_FREE_OBJECTID).contains(&new_objectid) {
        return Err(BtrfsError::InvalidArgument(format!(
            "subvolume id {new_objectid} outside the allowed range"
        )));
    }
    if fs.root(new_objectid).is_ok() || read_root_item(fs, new_objectid).is_ok() {
        return Err(BtrfsError::Exists);
    }

    let mut src = read_fs_root(fs, src_objectid)?;
    // the source keeps sharing every block below its (old) top
    src.last_snapshot = trans.transid;
    fs.set_root(src.clone());

    let new_root = ctree::copy_root(fs, trans, &src, new_objectid)?;

    let mut item = default_root_item(new_root.bytenr, new_root.level, trans.transid);
    if let Some(src_item) = &src.root_item {
        item.inode = src_item.inode;
        item.root_dirid = src_item.root_dirid;
        let bytes = src_item.bytes_used;
        item.bytes_used = bytes;
    }
    let uuid: BtrfsUuid = *uuid::Uuid::new_v4().as_bytes();
    item.uuid = uuid;
    item.otransid = trans.transid;

    let key = btrfs_disk_key::new(new_objectid, BtrfsItemType::ROOT_ITEM, trans.transid);
    let mut tree_root = fs.root(BTRFS_ROOT_TREE_OBJECTID)?;
    ctree::insert_item(fs, trans, &mut tree_root, &key, struct_bytes(&item))?;
    fs.set_root(tree_root);

    // visible name in the directory of roots
    let name_bytes = name.as_bytes();
    let dir_key = btrfs_disk_key::new(
        BTRFS_ROOT_TREE_DIR_OBJECTID,
        BtrfsItemType::DIR_ITEM,
        btrfs_name_hash(name_bytes),
    );
    let di = btrfs_dir_item {
        location: btrfs_disk_key::new(new_objectid, BtrfsItemType::ROOT_ITEM, u64::MAX),
        transid: trans.transid,
        data_len: 0,
        name_len: name_bytes.len() as u16,
        r#type: BTRFS_FT_DIR,
    };
    let mut payload = Vec::new();
    payload.extend_from_slice(struct_bytes(&di));
    payload.extend_from_slice(name_bytes);
    let mut tree_root = fs.root(BTRFS_ROOT_TREE_OBJECTID)?;
    match ctree::insert_item(fs, trans, &mut tree_root, &dir_key, &payload) {
        Ok(()) | Err(BtrfsError::Exists) => {}
        Err(e) => return Err(e),
    }
    fs.set_root(tree_root);

    let ref_key = btrfs_disk_key::new(src_objectid, BtrfsItemType::ROOT_REF, new_objectid);
    insert_root_ref(fs, trans, &ref_key, BTRFS_FIRST_FREE_OBJECTID, 0, name_bytes)?;
    let backref_key = btrfs_disk_key::new(new_objectid, BtrfsItemType::ROOT_BACKREF, src_objectid);
    insert_root_ref(fs, trans, &backref_key, BTRFS_FIRST_FREE_OBJECTID, 0, name_bytes)?;

    uuid_tree_add(fs, trans, &uuid, BtrfsItemType::UUID_KEY_SUBVOL, new_objectid)?;

    let mut tracked = TreeRoot::from_item(new_objectid, &item);
    tracked.last_snapshot = trans.transid;
    fs.set_root(tracked.clone());
    debug!("created subvolume {name} as root {new_objectid}");
    Ok(tracked)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_root_item_shape() {
        let item = default_root_item(16384, 0, 1);
        let bytenr = item.bytenr;
        let refs = item.refs;
        let dirid = item.root_dirid;
        assert_eq!(bytenr, 16384);
        assert_eq!(refs, 1);
        assert_eq!(dirid, BTRFS_FIRST_FREE_OBJECTID);
        let mode = item.inode.mode;
        assert_eq!(mode & 0o170000, 0o40000);
    }
}
