use crate::error::{BtrfsError, Result};
use crate::extent_io::EbRef;
use crate::extent_tree;
use crate::fs::FsInfo;
use crate::structures::*;
use crate::transaction::Transaction;

use log::debug;
use std::cmp::Ordering;

/// Functions/structures to search and mutate a btrfs tree.

pub fn comp_keys(left: &btrfs_disk_key, right: &btrfs_disk_key) -> Ordering {
    if left.objectid < right.objectid {
        Ordering::Less
    } else if left.objectid > right.objectid {
        Ordering::Greater
    } else if left.item_type < right.item_type {
        Ordering::Less
    } else if left.item_type > right.item_type {
        Ordering::Greater
    } else if left.offset < right.offset {
        Ordering::Less
    } else if left.offset > right.offset {
        Ordering::Greater
    } else {
        Ordering::Equal
    }
}

/// One tree, tracked by its current top block. `last_snapshot` drives the
/// shared-subtree bookkeeping during CoW.
#[derive(Clone)]
pub struct TreeRoot {
    pub objectid: u64,
    pub bytenr: u64,
    pub level: u8,
    pub generation: u64,
    pub last_snapshot: u64,
    pub root_item: Option<btrfs_root_item>,
}

impl TreeRoot {
    pub fn new(objectid: u64, bytenr: u64, level: u8, generation: u64) -> TreeRoot {
        TreeRoot {
            objectid,
            bytenr,
            level,
            generation,
            last_snapshot: 0,
            root_item: None,
        }
    }

    pub fn from_item(objectid: u64, item: &btrfs_root_item) -> TreeRoot {
        TreeRoot {
            objectid,
            bytenr: item.bytenr,
            level: item.level,
            generation: item.generation,
            last_snapshot: item.last_snapshot,
            root_item: Some(*item),
        }
    }
}

/// Block per level plus the slot the search chose there. Level 0 is the leaf.
pub struct Path {
    pub nodes: [Option<EbRef>; BTRFS_MAX_LEVEL],
    pub slots: [usize; BTRFS_MAX_LEVEL],
    pending_key: Option<btrfs_disk_key>,
}

impl Default for Path {
    fn default() -> Path {
        Path {
            nodes: Default::default(),
            slots: [0; BTRFS_MAX_LEVEL],
            pending_key: None,
        }
    }
}

impl Path {
    pub fn new() -> Path {
        Path::default()
    }

    pub fn leaf(&self) -> EbRef {
        self.nodes[0].as_ref().expect("path has no leaf").clone()
    }

    pub fn slot(&self) -> usize {
        self.slots[0]
    }

    pub fn key(&self) -> btrfs_disk_key {
        self.leaf().borrow().key(self.slot())
    }

    pub fn item_data(&self) -> Vec<u8> {
        self.leaf().borrow().item_data(self.slot())
    }

    pub fn release(&mut self) {
        for n in self.nodes.iter_mut() {
            *n = None;
        }
        self.slots = [0; BTRFS_MAX_LEVEL];
    }
}

/// binary search within one node or leaf; Ok(slot) on exact match,
/// Err(slot) names the insertion point
pub fn bin_search(eb: &crate::extent_io::ExtentBuffer, key: &btrfs_disk_key) -> std::result::Result<usize, usize> {
    let n = eb.nritems() as usize;
    let mut lo = 0_usize;
    let mut hi = n;
    while lo < hi {
        let mid = (lo + hi) / 2;
        match comp_keys(&eb.key(mid), key) {
            Ordering::Less => lo = mid + 1,
            Ordering::Greater => hi = mid,
            Ordering::Equal => return Ok(mid),
        }
    }
    Err(lo)
}

fn should_cow(eb: &crate::extent_io::ExtentBuffer, trans: &Transaction) -> bool {
    let hdr = eb.header();
    let gen = hdr.generation;
    let flags = hdr.flags;
    !(gen == trans.transid && flags & BTRFS_HEADER_FLAG_WRITTEN == 0)
}

/// Copy-on-write of one block on the descent path. The copy joins `root`;
/// shared originals keep their other referees through the back-reference
/// rules worked out against the extent tree.
pub fn cow_block(
    fs: &mut FsInfo,
    trans: &Transaction,
    root: &mut TreeRoot,
    eb: &EbRef,
    parent: Option<(&EbRef, usize)>,
) -> Result<EbRef> {
    if !should_cow(&eb.borrow(), trans) {
        return Ok(eb.clone());
    }
    let (bytenr, level, data, old_flags_hdr, old_owner, old_gen) = {
        let b = eb.borrow();
        let h = b.header();
        (b.bytenr, h.level, b.data.clone(), h.flags, h.owner, h.generation)
    };
    let (refs, extent_flags) = extent_tree::lookup_tree_block_refs(fs, bytenr)?;
    if refs == 0 {
        return Err(BtrfsError::corrupt(format!(
            "tree block {bytenr} has no extent reference"
        )));
    }

    let new_bytenr = extent_tree::alloc_tree_block(fs, trans, root.objectid, level)?;
    let new_eb = fs.cache.find_or_create(new_bytenr, fs.nodesize() as usize);
    {
        let mut nb = new_eb.borrow_mut();
        nb.data = data;
        nb.uptodate = true;
        nb.dirty = true;
        let mut hdr = nb.header();
        hdr.bytenr = new_bytenr;
        hdr.generation = trans.transid;
        hdr.owner = root.objectid;
        hdr.flags = old_flags_hdr & !BTRFS_HEADER_FLAG_WRITTEN;
        hdr.fsid = fs.fsid;
        nb.set_header(&hdr);
    }

    let _ = old_gen;
    if refs > 1 {
        if old_owner == root.objectid && extent_flags & BTRFS_BLOCK_FLAG_FULL_BACKREF == 0 {
            // the original stays with the snapshots: its children switch to
            // refs keyed by the original block itself
            extent_tree::ref_children(fs, trans, eb, root.objectid, true, true)?;
            extent_tree::set_extent_flags(fs, trans, bytenr, BTRFS_BLOCK_FLAG_FULL_BACKREF)?;
            extent_tree::queue_drop_ref(
                fs,
                trans,
                bytenr,
                fs.nodesize() as u64,
                extent_tree::RefKind::TreeBlock {
                    root: root.objectid,
                    level,
                },
            )?;
        } else {
            // shared through a cowed parent: the copy's children take refs
            // keyed by our root, then our path-ref on the original goes away
            extent_tree::ref_children(fs, trans, &new_eb, root.objectid, false, true)?;
            let kind = if extent_flags & BTRFS_BLOCK_FLAG_FULL_BACKREF != 0 {
                let parent_bytenr = parent
                    .map(|(p, _)| p.borrow().bytenr)
                    .unwrap_or(0);
                extent_tree::RefKind::SharedBlock {
                    parent: parent_bytenr,
                    level,
                }
            } else {
                extent_tree::RefKind::TreeBlock {
                    root: root.objectid,
                    level,
                }
            };
            extent_tree::queue_drop_ref(fs, trans, bytenr, fs.nodesize() as u64, kind)?;
        }
    } else {
        if extent_flags & BTRFS_BLOCK_FLAG_FULL_BACKREF != 0 {
            // last referee of a shared-keyed block: re-key the children to
            // the copy before the original disappears
            extent_tree::ref_children(fs, trans, &new_eb, root.objectid, true, true)?;
            extent_tree::ref_children(fs, trans, eb, root.objectid, true, false)?;
        }
        extent_tree::free_tree_block(fs, trans, bytenr, old_owner, level)?;
    }

    match parent {
        Some((peb, pslot)) => {
            let mut pb = peb.borrow_mut();
            let mut ptr = pb.key_ptr(pslot);
            ptr.blockptr = new_bytenr;
            ptr.generation = trans.transid;
            pb.set_key_ptr(pslot, &ptr);
            pb.dirty = true;
        }
        None => {
            root.bytenr = new_bytenr;
            root.generation = trans.transid;
        }
    }
    fs.cache.remove(bytenr);
    Ok(new_eb)
}

/// grow the tree by one level, the old top becoming the single child
fn insert_new_root(
    fs: &mut FsInfo,
    trans: &Transaction,
    root: &mut TreeRoot,
    child: &EbRef,
) -> Result<EbRef> {
    let level = root.level + 1;
    let new_bytenr = extent_tree::alloc_tree_block(fs, trans, root.objectid, level)?;
    let new_eb = fs.cache.find_or_create(new_bytenr, fs.nodesize() as usize);
    {
        let mut nb = new_eb.borrow_mut();
        nb.uptodate = true;
        nb.dirty = true;
        let mut hdr = nb.header();
        hdr.bytenr = new_bytenr;
        hdr.generation = trans.transid;
        hdr.owner = root.objectid;
        hdr.level = level;
        hdr.nritems = 1;
        hdr.fsid = fs.fsid;
        hdr.chunk_tree_uuid = fs.sb.metadata_uuid;
        nb.set_header(&hdr);
        let cb = child.borrow();
        let ptr = btrfs_key_ptr {
            key: cb.key(0),
            blockptr: cb.bytenr,
            generation: cb.generation(),
        };
        drop(cb);
        nb.set_key_ptr(0, &ptr);
    }
    root.bytenr = new_bytenr;
    root.level = level;
    root.generation = trans.transid;
    Ok(new_eb)
}

fn node_ptr_size() -> usize {
    std::mem::size_of::<btrfs_key_ptr>()
}

fn item_size() -> usize {
    std::mem::size_of::<btrfs_item>()
}

/// move the upper part of `src` into the fresh right sibling `dst`
fn move_node_items(src: &EbRef, dst: &EbRef, from: usize) {
    let mut sb = src.borrow_mut();
    let mut db = dst.borrow_mut();
    let n = sb.nritems() as usize;
    let moving = n - from;
    for i in 0..moving {
        let ptr = sb.key_ptr(from + i);
        db.set_nritems(i as u32 + 1);
        db.set_key_ptr(i, &ptr);
    }
    sb.set_nritems(from as u32);
    db.set_nritems(moving as u32);
    sb.dirty = true;
    db.dirty = true;
}

fn insert_node_ptr(eb: &EbRef, slot: usize, ptr: &btrfs_key_ptr) {
    let mut b = eb.borrow_mut();
    let n = b.nritems() as usize;
    assert!(slot <= n);
    for i in (slot..n).rev() {
        let p = b.key_ptr(i);
        b.set_nritems((i + 2) as u32);
        b.set_key_ptr(i + 1, &p);
    }
    b.set_nritems((n + 1) as u32);
    b.set_key_ptr(slot, ptr);
    b.dirty = true;
}

fn del_node_ptr(eb: &EbRef, slot: usize) {
    let mut b = eb.borrow_mut();
    let n = b.nritems() as usize;
    assert!(slot < n);
    for i in slot..n - 1 {
        let p = b.key_ptr(i + 1);
        b.set_key_ptr(i, &p);
    }
    b.set_nritems((n - 1) as u32);
    b.dirty = true;
}

/// new block for `root` at `level`, blank apart from the stamped header
pub fn alloc_empty_block(
    fs: &mut FsInfo,
    trans: &Transaction,
    root_objectid: u64,
    level: u8,
) -> Result<EbRef> {
    let bytenr = extent_tree::alloc_tree_block(fs, trans, root_objectid, level)?;
    let eb = fs.cache.find_or_create(bytenr, fs.nodesize() as usize);
    {
        let mut b = eb.borrow_mut();
        b.data.fill(0);
        b.uptodate = true;
        b.dirty = true;
        let mut hdr = b.header();
        hdr.bytenr = bytenr;
        hdr.generation = trans.transid;
        hdr.owner = root_objectid;
        hdr.level = level;
        hdr.nritems = 0;
        hdr.fsid = fs.fsid;
        hdr.chunk_tree_uuid = fs.sb.metadata_uuid;
        b.set_header(&hdr);
    }
    Ok(eb)
}

/// split an over-full interior node; the parent is guaranteed to have room
/// by the eager splitting on the way down
fn split_node(
    fs: &mut FsInfo,
    trans: &Transaction,
    root: &mut TreeRoot,
    path: &mut Path,
    level: usize,
) -> Result<()> {
    let eb = path.nodes[level].as_ref().unwrap().clone();
    if path.nodes[level + 1].is_none() {
        let new_top = insert_new_root(fs, trans, root, &eb)?;
        path.nodes[level + 1] = Some(new_top);
        path.slots[level + 1] = 0;
    }
    let split = {
        let b = eb.borrow();
        b.nritems() as usize / 2
    };
    let right = alloc_empty_block(fs, trans, root.objectid, level as u8)?;
    move_node_items(&eb, &right, split);

    let parent = path.nodes[level + 1].as_ref().unwrap().clone();
    let rkey = right.borrow().key(0);
    let rb = right.borrow();
    let ptr = btrfs_key_ptr {
        key: rkey,
        blockptr: rb.bytenr,
        generation: trans.transid,
    };
    drop(rb);
    insert_node_ptr(&parent, path.slots[level + 1] + 1, &ptr);

    // follow the half the search key landed in
    if path.slots[level] >= split {
        path.slots[level] -= split;
        path.slots[level + 1] += 1;
        path.nodes[level] = Some(right);
    }
    Ok(())
}

fn leaf_space_used(eb: &crate::extent_io::ExtentBuffer, from: usize, count: usize) -> usize {
    let mut total = count * item_size();
    for i in from..from + count {
        total += eb.item(i).size as usize;
    }
    total
}

/// move the last `count` items of `src` into the empty/right-packed `dst`
fn move_leaf_items_right(src: &EbRef, dst: &EbRef, count: usize, leaf_data: usize) {
    let mut sb = src.borrow_mut();
    let mut db = dst.borrow_mut();
    let sn = sb.nritems() as usize;
    let dn = db.nritems() as usize;
    assert!(count <= sn);
    let from = sn - count;

    // make room in dst: existing items shift right in the header array and
    // their data moves left
    let moved_size: usize = (from..sn).map(|i| sb.item(i).size as usize).sum();
    if dn > 0 {
        let dst_data_start = db.leaf_data_start();
        let dst_data_end = db.item(0).offset as usize + db.item(0).size as usize;
        let region = db.data[BTRFS_HEADER_SIZE + dst_data_start..BTRFS_HEADER_SIZE + dst_data_end]
            .to_vec();
        db.data[BTRFS_HEADER_SIZE + dst_data_start - moved_size
            ..BTRFS_HEADER_SIZE + dst_data_end - moved_size]
            .copy_from_slice(&region);
        for i in (0..dn).rev() {
            let mut it = db.item(i);
            it.offset -= moved_size as u32;
            db.set_nritems((i + count + 1) as u32);
            db.set_item(i + count, &it);
        }
    }
    db.set_nritems((dn + count) as u32);

    // place the moved payloads at the right end of dst
    let mut write_off = leaf_data;
    for i in 0..count {
        let it = sb.item(from + i);
        let payload = {
            let start = BTRFS_HEADER_SIZE + it.offset as usize;
            sb.data[start..start + it.size as usize].to_vec()
        };
        write_off -= it.size as usize;
        db.data[BTRFS_HEADER_SIZE + write_off..BTRFS_HEADER_SIZE + write_off + payload.len()]
            .copy_from_slice(&payload);
        let new_item = btrfs_item {
            key: it.key,
            offset: write_off as u32,
            size: it.size,
        };
        db.set_item(i, &new_item);
    }
    sb.set_nritems(from as u32);
    sb.dirty = true;
    db.dirty = true;
}

/// split by accumulated payload size so both halves end up roughly even
fn split_leaf(
    fs: &mut FsInfo,
    trans: &Transaction,
    root: &mut TreeRoot,
    path: &mut Path,
    ins_len: usize,
) -> Result<()> {
    let leaf = path.nodes[0].as_ref().unwrap().clone();
    if path.nodes[1].is_none() {
        let new_top = insert_new_root(fs, trans, root, &leaf)?;
        path.nodes[1] = Some(new_top);
        path.slots[1] = 0;
    }
    let leaf_data = fs.leaf_data_size();
    let (n, half_split) = {
        let b = leaf.borrow();
        let n = b.nritems() as usize;
        let total = leaf_space_used(&b, 0, n);
        let mut acc = 0;
        let mut split = n;
        for i in 0..n {
            acc += b.item(i).size as usize + item_size();
            if acc > total / 2 {
                split = i;
                break;
            }
        }
        (n, split.max(1))
    };
    // appending to the end gets an empty right sibling and stays cheap for
    // sequential key insertion
    let slot = path.slots[0];
    let split = if slot == n { n } else { half_split.min(n) };
    let count = n - split;

    let right = alloc_empty_block(fs, trans, root.objectid, 0)?;
    if count > 0 {
        move_leaf_items_right(&leaf, &right, count, leaf_data);
    }

    let parent = path.nodes[1].as_ref().unwrap().clone();
    let rkey = if count > 0 {
        right.borrow().key(0)
    } else {
        // empty sibling: it will immediately receive the pending insert
        path_pending_key(path)
    };
    let ptr = btrfs_key_ptr {
        key: rkey,
        blockptr: right.borrow().bytenr,
        generation: trans.transid,
    };
    insert_node_ptr(&parent, path.slots[1] + 1, &ptr);

    if path.slots[0] >= split {
        path.slots[0] -= split;
        path.slots[1] += 1;
        path.nodes[0] = Some(right.clone());
    }

    let free = path.nodes[0].as_ref().unwrap().borrow().leaf_free_space();
    if (free as usize) < ins_len + item_size() {
        return Err(BtrfsError::corrupt(
            "leaf still over-full after split".to_string(),
        ));
    }
    Ok(())
}

// the key about to be inserted, stashed on the path by search_slot so an
// empty-sibling split can name it in the parent
fn path_pending_key(path: &Path) -> btrfs_disk_key {
    path.pending_key
        .expect("split of empty sibling without a pending key")
}

/// Descend from the root to `key`. With `cow` every visited block is
/// replaced first; with `ins_len > 0` nodes and the target leaf are split
/// eagerly so the insert cannot fail midway. Returns the path and whether
/// the exact key was found; a miss leaves the path at the insert position.
pub fn search_slot(
    fs: &mut FsInfo,
    trans: Option<&Transaction>,
    root: &mut TreeRoot,
    key: &btrfs_disk_key,
    ins_len: usize,
    cow: bool,
) -> Result<(Path, bool)> {
    if cow {
        assert!(trans.is_some(), "cow search without a transaction");
    }
    let mut path = Path::new();
    path.pending_key = Some(*key);

    let mut eb = fs.read_block(root.bytenr, Some(root.generation))?;
    if cow {
        eb = cow_block(fs, trans.unwrap(), root, &eb, None)?;
    }

    loop {
        let level = eb.borrow().level() as usize;
        if level > 0 {
            // eager split keeps every ancestor under the fanout cap
            if cow && ins_len > 0 {
                let nritems = eb.borrow().nritems();
                if nritems >= crate::extent_io::max_node_items(fs.nodesize()) - 3 {
                    path.nodes[level] = Some(eb.clone());
                    path.slots[level] = match bin_search(&eb.borrow(), key) {
                        Ok(s) => s,
                        Err(s) => s.saturating_sub(1),
                    };
                    split_node(fs, trans.unwrap(), root, &mut path, level)?;
                    eb = path.nodes[level].as_ref().unwrap().clone();
                }
            }
            let slot = match bin_search(&eb.borrow(), key) {
                Ok(s) => s,
                Err(s) => s.saturating_sub(1),
            };
            path.nodes[level] = Some(eb.clone());
            path.slots[level] = slot;

            let (child_bytenr, child_gen) = {
                let b = eb.borrow();
                let ptr = b.key_ptr(slot);
                (ptr.blockptr, ptr.generation)
            };
            let mut child = fs.read_block(child_bytenr, Some(child_gen))?;
            if cow {
                child = cow_block(fs, trans.unwrap(), root, &child, Some((&eb, slot)))?;
            }
            eb = child;
        } else {
            let found = match bin_search(&eb.borrow(), key) {
                Ok(s) => {
                    path.slots[0] = s;
                    true
                }
                Err(s) => {
                    path.slots[0] = s;
                    false
                }
            };
            path.nodes[0] = Some(eb.clone());
            if cow && ins_len > 0 {
                let free = eb.borrow().leaf_free_space();
                if (free as usize) < ins_len + item_size() {
                    split_leaf(fs, trans.unwrap(), root, &mut path, ins_len)?;
                }
            }
            debug!(
                "search {:?} in root {}: found={found} slot={}",
                key, root.objectid, path.slots[0]
            );
            return Ok((path, found));
        }
    }
}

/// propagate a changed leftmost key up every ancestor where we sit in slot 0
fn fixup_low_keys(path: &Path, key: &btrfs_disk_key) {
    for level in 1..BTRFS_MAX_LEVEL {
        let Some(eb) = path.nodes[level].as_ref() else {
            break;
        };
        let slot = path.slots[level];
        let mut b = eb.borrow_mut();
        let mut ptr = b.key_ptr(slot);
        ptr.key = *key;
        b.set_key_ptr(slot, &ptr);
        b.dirty = true;
        if slot != 0 {
            break;
        }
    }
}

/// make room for one item of `size` at the path position and stamp the key;
/// payload area is left zeroed for the caller
pub fn insert_empty_item_at(
    fs: &mut FsInfo,
    path: &mut Path,
    key: &btrfs_disk_key,
    size: usize,
) -> Result<()> {
    let leaf = path.nodes[0].as_ref().unwrap().clone();
    let slot = path.slots[0];
    let mut b = leaf.borrow_mut();
    let free = b.leaf_free_space();
    if (free as usize) < size + item_size() {
        return Err(BtrfsError::NoSpace {
            kind: "leaf",
            needed: (size + item_size()) as u64,
        });
    }
    let n = b.nritems() as usize;
    assert!(slot <= n);

    let data_end = b.leaf_data_start();
    let prev_end = if slot == 0 {
        fs.leaf_data_size()
    } else {
        b.item(slot - 1).offset as usize
    };
    // payloads of the items after the slot slide left
    if slot < n {
        let region = b.data[BTRFS_HEADER_SIZE + data_end..BTRFS_HEADER_SIZE + prev_end].to_vec();
        b.data[BTRFS_HEADER_SIZE + data_end - size..BTRFS_HEADER_SIZE + prev_end - size]
            .copy_from_slice(&region);
    }
    for i in (slot..n).rev() {
        let mut it = b.item(i);
        it.offset -= size as u32;
        b.set_nritems((i + 2) as u32);
        b.set_item(i + 1, &it);
    }
    b.set_nritems((n + 1) as u32);
    let item = btrfs_item {
        key: *key,
        offset: (prev_end - size) as u32,
        size: size as u32,
    };
    b.set_item(slot, &item);
    // fresh payload area starts zeroed
    let start = BTRFS_HEADER_SIZE + prev_end - size;
    b.data[start..start + size].fill(0);
    b.dirty = true;
    drop(b);
    if slot == 0 {
        fixup_low_keys(path, key);
    }
    Ok(())
}

/// cow-search then place one fully formed item
pub fn insert_item(
    fs: &mut FsInfo,
    trans: &Transaction,
    root: &mut TreeRoot,
    key: &btrfs_disk_key,
    payload: &[u8],
) -> Result<()> {
    // oversized items must fail before anything is dirtied
    if payload.len() + item_size() > fs.leaf_data_size() {
        return Err(BtrfsError::NoSpace {
            kind: "leaf",
            needed: (payload.len() + item_size()) as u64,
        });
    }
    let (mut path, found) = search_slot(fs, Some(trans), root, key, payload.len(), true)?;
    if found {
        return Err(BtrfsError::Exists);
    }
    insert_empty_item_at(fs, &mut path, key, payload.len())?;
    let leaf = path.leaf();
    leaf.borrow_mut().write_item_data(path.slot(), payload);
    Ok(())
}

/// remove the item the path points at, then rebalance or collapse
pub fn delete_item(
    fs: &mut FsInfo,
    trans: &Transaction,
    root: &mut TreeRoot,
    path: &mut Path,
) -> Result<()> {
    let leaf = path.nodes[0].as_ref().unwrap().clone();
    let slot = path.slots[0];
    {
        let mut b = leaf.borrow_mut();
        let n = b.nritems() as usize;
        assert!(slot < n);
        let it = b.item(slot);
        let size = it.size as usize;
        let data_end = b.leaf_data_start();
        // payloads left of ours slide right over the hole
        if data_end < it.offset as usize {
            let region =
                b.data[BTRFS_HEADER_SIZE + data_end..BTRFS_HEADER_SIZE + it.offset as usize]
                    .to_vec();
            b.data[BTRFS_HEADER_SIZE + data_end + size
                ..BTRFS_HEADER_SIZE + it.offset as usize + size]
                .copy_from_slice(&region);
        }
        for i in slot..n - 1 {
            let mut nxt = b.item(i + 1);
            nxt.offset += size as u32;
            b.set_item(i, &nxt);
        }
        b.set_nritems((n - 1) as u32);
        b.dirty = true;
    }

    let nritems = leaf.borrow().nritems();
    if path.nodes[1].is_none() {
        // the leaf is the tree top; empty is fine there
        return Ok(());
    }
    if nritems == 0 {
        // drop the empty leaf out of its parent
        let parent = path.nodes[1].as_ref().unwrap().clone();
        del_node_ptr(&parent, path.slots[1]);
        let bytenr = leaf.borrow().bytenr;
        let owner = leaf.borrow().owner();
        extent_tree::free_tree_block(fs, trans, bytenr, owner, 0)?;
        collapse_root(fs, trans, root)?;
        return Ok(());
    }
    if slot == 0 {
        let key = leaf.borrow().key(0);
        fixup_low_keys(path, &key);
    }

    let used = {
        let b = leaf.borrow();
        leaf_space_used(&b, 0, b.nritems() as usize)
    };
    if used < fs.leaf_data_size() / 3 {
        try_merge_leaf(fs, trans, root, path)?;
    }
    Ok(())
}

/// underfull leaf: fold it into the left sibling, or pull the right sibling
/// into it, whenever the combined payload fits one leaf
fn try_merge_leaf(
    fs: &mut FsInfo,
    trans: &Transaction,
    root: &mut TreeRoot,
    path: &mut Path,
) -> Result<()> {
    let Some(parent) = path.nodes[1].clone() else {
        return Ok(());
    };
    let pslot = path.slots[1];
    let leaf = path.nodes[0].as_ref().unwrap().clone();
    let leaf_data = fs.leaf_data_size();
    let used = {
        let b = leaf.borrow();
        leaf_space_used(&b, 0, b.nritems() as usize)
    };

    if pslot > 0 {
        let left_bytenr = parent.borrow().key_ptr(pslot - 1).blockptr;
        let left_gen = parent.borrow().key_ptr(pslot - 1).generation;
        let left = fs.read_block(left_bytenr, Some(left_gen))?;
        let left = cow_block(fs, trans, root, &left, Some((&parent, pslot - 1)))?;
        let left_used = {
            let b = left.borrow();
            leaf_space_used(&b, 0, b.nritems() as usize)
        };
        if left_used + used <= leaf_data {
            // append everything to the left sibling
            let count = leaf.borrow().nritems() as usize;
            move_leaf_items_left(&left, &leaf, count);
            del_node_ptr(&parent, pslot);
            let bytenr = leaf.borrow().bytenr;
            let owner = leaf.borrow().owner();
            extent_tree::free_tree_block(fs, trans, bytenr, owner, 0)?;
            path.nodes[0] = Some(left);
            path.slots[1] = pslot - 1;
            collapse_root(fs, trans, root)?;
            return Ok(());
        }
    }

    let pn = parent.borrow().nritems() as usize;
    if pslot + 1 < pn {
        let right_bytenr = parent.borrow().key_ptr(pslot + 1).blockptr;
        let right_gen = parent.borrow().key_ptr(pslot + 1).generation;
        let right = fs.read_block(right_bytenr, Some(right_gen))?;
        let right = cow_block(fs, trans, root, &right, Some((&parent, pslot + 1)))?;
        let right_used = {
            let b = right.borrow();
            leaf_space_used(&b, 0, b.nritems() as usize)
        };
        if right_used + used <= leaf_data {
            let count = right.borrow().nritems() as usize;
            move_leaf_items_left(&leaf, &right, count);
            del_node_ptr(&parent, pslot + 1);
            let bytenr = right.borrow().bytenr;
            let owner = right.borrow().owner();
            extent_tree::free_tree_block(fs, trans, bytenr, owner, 0)?;
            collapse_root(fs, trans, root)?;
        }
    }
    Ok(())
}

/// append every item of `src` to the tail of `dst` (dst is the left leaf)
fn move_leaf_items_left(dst: &EbRef, src: &EbRef, count: usize) {
    let mut db = dst.borrow_mut();
    let mut sb = src.borrow_mut();
    let dn = db.nritems() as usize;
    assert!(count <= sb.nritems() as usize);
    let mut write_off = db.leaf_data_start();
    for i in 0..count {
        let it = sb.item(i);
        let payload = {
            let start = BTRFS_HEADER_SIZE + it.offset as usize;
            sb.data[start..start + it.size as usize].to_vec()
        };
        write_off -= it.size as usize;
        db.data[BTRFS_HEADER_SIZE + write_off..BTRFS_HEADER_SIZE + write_off + payload.len()]
            .copy_from_slice(&payload);
        db.set_nritems((dn + i + 1) as u32);
        let item = btrfs_item {
            key: it.key,
            offset: write_off as u32,
            size: it.size,
        };
        db.set_item(dn + i, &item);
    }
    let sn = sb.nritems() as usize;
    // anything unmoved shifts down (only the full move is used today)
    for i in count..sn {
        let it = sb.item(i);
        sb.set_item(i - count, &it);
    }
    sb.set_nritems((sn - count) as u32);
    sb.dirty = true;
    db.dirty = true;
}

/// drop levels whose node has a single child
fn collapse_root(fs: &mut FsInfo, trans: &Transaction, root: &mut TreeRoot) -> Result<()> {
    loop {
        let top = fs.read_block(root.bytenr, Some(root.generation))?;
        let (level, nritems) = {
            let b = top.borrow();
            (b.level(), b.nritems())
        };
        if level == 0 || nritems != 1 {
            return Ok(());
        }
        let child_bytenr = top.borrow().key_ptr(0).blockptr;
        let old_bytenr = root.bytenr;
        let owner = top.borrow().owner();
        root.bytenr = child_bytenr;
        root.level = level - 1;
        extent_tree::free_tree_block(fs, trans, old_bytenr, owner, level)?;
    }
}

/// shrink an item in place, keeping the payload head
pub fn truncate_item(path: &mut Path, new_size: usize) -> Result<()> {
    let leaf = path.nodes[0].as_ref().unwrap().clone();
    let slot = path.slots[0];
    let mut b = leaf.borrow_mut();
    let it = b.item(slot);
    let old_size = it.size as usize;
    if new_size == old_size {
        return Ok(());
    }
    assert!(new_size < old_size);
    let diff = old_size - new_size;
    let n = b.nritems() as usize;
    let data_end = b.leaf_data_start();

    let payload = {
        let start = BTRFS_HEADER_SIZE + it.offset as usize;
        b.data[start..start + new_size].to_vec()
    };
    // everything left of the item slides right by the shrink
    let region = b.data[BTRFS_HEADER_SIZE + data_end..BTRFS_HEADER_SIZE + it.offset as usize]
        .to_vec();
    b.data[BTRFS_HEADER_SIZE + data_end + diff..BTRFS_HEADER_SIZE + it.offset as usize + diff]
        .copy_from_slice(&region);
    for i in slot..n {
        let mut item = b.item(i);
        item.offset += diff as u32;
        if i == slot {
            item.size = new_size as u32;
        }
        b.set_item(i, &item);
    }
    let start = BTRFS_HEADER_SIZE + b.item(slot).offset as usize;
    b.data[start..start + new_size].copy_from_slice(&payload);
    b.dirty = true;
    Ok(())
}

/// a search that landed past the last slot continues in the next leaf
pub fn normalize_slot(fs: &mut FsInfo, root: &TreeRoot, path: &mut Path) -> Result<bool> {
    let n = path.leaf().borrow().nritems() as usize;
    if path.slot() < n {
        return Ok(true);
    }
    next_leaf(fs, root, path)
}

/// walk to the next leaf; Ok(false) at the end of the tree
pub fn next_leaf(fs: &mut FsInfo, root: &TreeRoot, path: &mut Path) -> Result<bool> {
    let mut level = 1;
    loop {
        if level >= BTRFS_MAX_LEVEL || path.nodes[level].is_none() {
            return Ok(false);
        }
        let eb = path.nodes[level].as_ref().unwrap().clone();
        let slot = path.slots[level];
        if slot + 1 < eb.borrow().nritems() as usize {
            path.slots[level] = slot + 1;
            break;
        }
        level += 1;
    }
    // descend leftmost from the advanced slot
    let _ = root;
    loop {
        let eb = path.nodes[level].as_ref().unwrap().clone();
        let slot = path.slots[level];
        let (child_bytenr, child_gen) = {
            let b = eb.borrow();
            let ptr = b.key_ptr(slot);
            (ptr.blockptr, ptr.generation)
        };
        let child = fs.read_block(child_bytenr, Some(child_gen))?;
        level -= 1;
        let child_level = child.borrow().level() as usize;
        assert_eq!(child_level, level);
        path.nodes[level] = Some(child);
        path.slots[level] = 0;
        if level == 0 {
            return Ok(true);
        }
    }
}

/// advance one item, crossing leaf boundaries as needed
pub fn next_item(fs: &mut FsInfo, root: &TreeRoot, path: &mut Path) -> Result<bool> {
    let leaf = path.nodes[0].as_ref().unwrap().clone();
    if path.slots[0] + 1 < leaf.borrow().nritems() as usize {
        path.slots[0] += 1;
        return Ok(true);
    }
    next_leaf(fs, root, path)
}

/// step back one item, walking into the previous leaf when the slot runs out
pub fn prev_item(fs: &mut FsInfo, root: &TreeRoot, path: &mut Path) -> Result<bool> {
    if path.slots[0] > 0 {
        path.slots[0] -= 1;
        return Ok(true);
    }
    let mut level = 1;
    loop {
        if level >= BTRFS_MAX_LEVEL || path.nodes[level].is_none() {
            return Ok(false);
        }
        if path.slots[level] > 0 {
            path.slots[level] -= 1;
            break;
        }
        level += 1;
    }
    let _ = root;
    loop {
        let eb = path.nodes[level].as_ref().unwrap().clone();
        let slot = path.slots[level];
        let child_bytenr = eb.borrow().key_ptr(slot).blockptr;
        let child = fs.read_block(child_bytenr, None)?;
        level -= 1;
        let n = child.borrow().nritems() as usize;
        path.nodes[level] = Some(child);
        path.slots[level] = n.saturating_sub(1);
        if level == 0 {
            return Ok(true);
        }
    }
}

/// O(1) root clone for subvolume/snapshot creation: copy the top block and
/// hand one extra reference to every direct descendant
pub fn copy_root(
    fs: &mut FsInfo,
    trans: &Transaction,
    src: &TreeRoot,
    new_objectid: u64,
) -> Result<TreeRoot> {
    let src_eb = fs.read_block(src.bytenr, Some(src.generation))?;
    let level = src_eb.borrow().level();
    let new_bytenr = extent_tree::alloc_tree_block(fs, trans, new_objectid, level)?;
    let new_eb = fs.cache.find_or_create(new_bytenr, fs.nodesize() as usize);
    {
        let mut nb = new_eb.borrow_mut();
        nb.data = src_eb.borrow().data.clone();
        nb.uptodate = true;
        nb.dirty = true;
        let mut hdr = nb.header();
        hdr.bytenr = new_bytenr;
        hdr.generation = trans.transid;
        hdr.owner = new_objectid;
        hdr.flags &= !BTRFS_HEADER_FLAG_WRITTEN;
        nb.set_header(&hdr);
    }
    // descendants stay shared: one extra ref each, keyed by the new root
    extent_tree::ref_children(fs, trans, &new_eb, new_objectid, false, true)?;
    Ok(TreeRoot {
        objectid: new_objectid,
        bytenr: new_bytenr,
        level,
        generation: trans.transid,
        last_snapshot: trans.transid,
        root_item: None,
    })
}
