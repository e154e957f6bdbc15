//! Extent tree bookkeeping: extent items with their inline back-references,
//! block groups, the free-space view of the pool, and the delayed-ref queue
//! that keeps reference updates from recursing through their own tree.

use crate::ctree::{self, TreeRoot};
use crate::error::{BtrfsError, Result};
use crate::extent_io::EbRef;
use crate::fs::FsInfo;
use crate::structures::*;
use crate::transaction::Transaction;
use crate::volumes;

use log::debug;
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefKind {
    TreeBlock { root: u64, level: u8 },
    SharedBlock { parent: u64, level: u8 },
    Data { root: u64, objectid: u64, offset: u64 },
    SharedData { parent: u64 },
}

#[derive(Clone, Copy)]
pub enum RefAction {
    Inc,
    Dec,
    SetFlags(u64),
}

/// fresh allocations carry what the new extent item should look like;
/// `accounted` is set when the allocator already took the space
#[derive(Clone, Copy)]
pub struct NewExtent {
    pub flags: u64,
    pub level: u8,
    pub accounted: bool,
}

pub struct DelayedRef {
    pub bytenr: u64,
    pub num_bytes: u64,
    pub action: RefAction,
    pub kind: RefKind,
    pub new_extent: Option<NewExtent>,
}

/// decoded payload of one EXTENT_ITEM
#[derive(Clone)]
pub struct ExtentRec {
    pub refs: u64,
    pub generation: u64,
    pub flags: u64,
    pub block_info: Option<btrfs_tree_block_info>,
    pub inline: Vec<InlineRef>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InlineRef {
    TreeBlock { root: u64 },
    SharedBlock { parent: u64 },
    Data { root: u64, objectid: u64, offset: u64, count: u32 },
    SharedData { parent: u64, count: u32 },
}

impl InlineRef {
    fn type_byte(&self) -> u8 {
        match self {
            InlineRef::TreeBlock { .. } => BtrfsItemType::TREE_BLOCK_REF as u8,
            InlineRef::Data { .. } => BtrfsItemType::EXTENT_DATA_REF as u8,
            InlineRef::SharedBlock { .. } => BtrfsItemType::SHARED_BLOCK_REF as u8,
            InlineRef::SharedData { .. } => BtrfsItemType::SHARED_DATA_REF as u8,
        }
    }

    fn count(&self) -> u64 {
        match self {
            InlineRef::TreeBlock { .. } | InlineRef::SharedBlock { .. } => 1,
            InlineRef::Data { count, .. } => *count as u64,
            InlineRef::SharedData { count, .. } => *count as u64,
        }
    }

    /// sort key: type byte, then the discriminating offset
    fn order(&self) -> (u8, u64) {
        match self {
            InlineRef::TreeBlock { root } => (self.type_byte(), *root),
            InlineRef::SharedBlock { parent } => (self.type_byte(), *parent),
            InlineRef::Data { root, .. } => (self.type_byte(), *root),
            InlineRef::SharedData { parent, .. } => (self.type_byte(), *parent),
        }
    }
}

impl ExtentRec {
    pub fn decode(payload: &[u8]) -> Result<ExtentRec> {
        if payload.len() < std::mem::size_of::<btrfs_extent_item>() {
            return Err(BtrfsError::corrupt("extent item too small"));
        }
        let item: btrfs_extent_item = read_struct(payload, 0);
        let mut off = std::mem::size_of::<btrfs_extent_item>();
        let block_info = if item.flags & BTRFS_EXTENT_FLAG_TREE_BLOCK != 0 {
            let info: btrfs_tree_block_info = read_struct(payload, off);
            off += std::mem::size_of::<btrfs_tree_block_info>();
            Some(info)
        } else {
            None
        };
        let mut inline = Vec::new();
        while off < payload.len() {
            let t = payload[off];
            if t == BtrfsItemType::TREE_BLOCK_REF as u8 {
                let r: btrfs_extent_inline_ref = read_struct(payload, off);
                inline.push(InlineRef::TreeBlock { root: r.offset });
                off += std::mem::size_of::<btrfs_extent_inline_ref>();
            } else if t == BtrfsItemType::SHARED_BLOCK_REF as u8 {
                let r: btrfs_extent_inline_ref = read_struct(payload, off);
                inline.push(InlineRef::SharedBlock { parent: r.offset });
                off += std::mem::size_of::<btrfs_extent_inline_ref>();
            } else if t == BtrfsItemType::EXTENT_DATA_REF as u8 {
                let r: btrfs_extent_data_ref = read_struct(payload, off + 1);
                inline.push(InlineRef::Data {
                    root: r.root,
                    objectid: r.objectid,
                    offset: r.offset,
                    count: r.count,
                });
                off += 1 + std::mem::size_of::<btrfs_extent_data_ref>();
            } else if t == BtrfsItemType::SHARED_DATA_REF as u8 {
                let r: btrfs_extent_inline_ref = read_struct(payload, off);
                let c: btrfs_shared_data_ref =
                    read_struct(payload, off + std::mem::size_of::<btrfs_extent_inline_ref>());
                inline.push(InlineRef::SharedData {
                    parent: r.offset,
                    count: c.count,
                });
                off += std::mem::size_of::<btrfs_extent_inline_ref>()
                    + std::mem::size_of::<btrfs_shared_data_ref>();
            } else {
                return Err(BtrfsError::corrupt(format!(
                    "unknown inline ref type {t:#x}"
                )));
            }
        }
        Ok(ExtentRec {
            refs: item.refs,
            generation: item.generation,
            flags: item.flags,
            block_info,
            inline,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut inline = self.inline.clone();
        inline.sort_by_key(|r| r.order());
        let mut out = Vec::new();
        let item = btrfs_extent_item {
            refs: self.refs,
            generation: self.generation,
            flags: self.flags,
        };
        out.extend_from_slice(struct_bytes(&item));
        if let Some(info) = &self.block_info {
            out.extend_from_slice(struct_bytes(info));
        }
        for r in &inline {
            match r {
                InlineRef::TreeBlock { root } => {
                    let ir = btrfs_extent_inline_ref {
                        r#type: r.type_byte(),
                        offset: *root,
                    };
                    out.extend_from_slice(struct_bytes(&ir));
                }
                InlineRef::SharedBlock { parent } => {
                    let ir = btrfs_extent_inline_ref {
                        r#type: r.type_byte(),
                        offset: *parent,
                    };
                    out.extend_from_slice(struct_bytes(&ir));
                }
                InlineRef::Data {
                    root,
                    objectid,
                    offset,
                    count,
                } => {
                    out.push(r.type_byte());
                    let dr = btrfs_extent_data_ref {
                        root: *root,
                        objectid: *objectid,
                        offset: *offset,
                        count: *count,
                    };
                    out.extend_from_slice(struct_bytes(&dr));
                }
                InlineRef::SharedData { parent, count } => {
                    let ir = btrfs_extent_inline_ref {
                        r#type: r.type_byte(),
                        offset: *parent,
                    };
                    out.extend_from_slice(struct_bytes(&ir));
                    let sr = btrfs_shared_data_ref { count: *count };
                    out.extend_from_slice(struct_bytes(&sr));
                }
            }
        }
        out
    }

    pub fn ref_sum(&self) -> u64 {
        self.inline.iter().map(|r| r.count()).sum()
    }
}

/// merged free intervals of the logical address space
#[derive(Default)]
pub struct SpaceMap {
    free: BTreeMap<u64, u64>,
}

impl SpaceMap {
    pub fn new() -> SpaceMap {
        SpaceMap::default()
    }

    pub fn add_free(&mut self, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        let mut start = start;
        let mut len = len;
        if let Some((ps, pl)) = self
            .free
            .range(..start)
            .next_back()
            .map(|(s, l)| (*s, *l))
        {
            assert!(ps + pl <= start, "free range overlap at {start}");
            if ps + pl == start {
                start = ps;
                len += pl;
                self.free.remove(&ps);
            }
        }
        if let Some((ns, nl)) = self.free.range(start + len..).next().map(|(s, l)| (*s, *l)) {
            if start + len == ns {
                len += nl;
                self.free.remove(&ns);
            }
        }
        self.free.insert(start, len);
    }

    /// carve `len` bytes out of the free range containing `start`
    pub fn remove(&mut self, start: u64, len: u64) -> Result<()> {
        let (fs_, fl) = self
            .free
            .range(..=start)
            .next_back()
            .map(|(s, l)| (*s, *l))
            .ok_or_else(|| BtrfsError::corrupt(format!("range {start} not free")))?;
        if start < fs_ || start + len > fs_ + fl {
            return Err(BtrfsError::corrupt(format!(
                "range {start}+{len} not inside a free extent"
            )));
        }
        self.free.remove(&fs_);
        if start > fs_ {
            self.free.insert(fs_, start - fs_);
        }
        if start + len < fs_ + fl {
            self.free.insert(start + len, fs_ + fl - start - len);
        }
        Ok(())
    }

    /// first aligned fit inside [lo, hi)
    pub fn find_in(&self, lo: u64, hi: u64, len: u64, align: u64) -> Option<u64> {
        for (s, l) in self.free.range(..hi) {
            let start = std::cmp::max(*s, lo);
            let start = (start + align - 1) / align * align;
            let end = std::cmp::min(s + l, hi);
            if start < end && end - start >= len {
                return Some(start);
            }
        }
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.free.iter().map(|(s, l)| (*s, *l))
    }
}

/// one block group's in-memory record
pub struct BlockGroup {
    pub start: u64,
    pub length: u64,
    pub flags: u64,
    pub used: u64,
    pub dirty: bool,
}

#[derive(Default)]
pub struct BlockGroupCache {
    pub groups: BTreeMap<u64, BlockGroup>,
    pub free: SpaceMap,
    /// allocation cursor per flavor, pointing at the previously used group
    pub last_alloc: BTreeMap<u64, u64>,
}

impl BlockGroupCache {
    pub fn new() -> BlockGroupCache {
        BlockGroupCache::default()
    }

    pub fn add(&mut self, start: u64, length: u64, flags: u64, used: u64) {
        self.groups.insert(
            start,
            BlockGroup {
                start,
                length,
                flags,
                used,
                dirty: false,
            },
        );
        self.free.add_free(start, length);
    }

    pub fn lookup(&self, bytenr: u64) -> Option<&BlockGroup> {
        self.groups
            .range(..=bytenr)
            .next_back()
            .map(|(_, g)| g)
            .filter(|g| bytenr < g.start + g.length)
    }

    pub fn lookup_mut(&mut self, bytenr: u64) -> Option<&mut BlockGroup> {
        self.groups
            .range_mut(..=bytenr)
            .next_back()
            .map(|(_, g)| g)
            .filter(|g| bytenr < g.start + g.length)
    }

    /// a cursor that prefers the previously used group before scanning
    fn candidate_groups(&self, type_flag: u64) -> Vec<u64> {
        let pref = self.last_alloc.get(&type_flag).copied();
        let mut out: Vec<u64> = Vec::new();
        if let Some(p) = pref {
            out.push(p);
        }
        for (s, g) in self.groups.iter() {
            if g.flags & type_flag != 0 && Some(*s) != pref {
                out.push(*s);
            }
        }
        out
    }
}

fn alloc_in_groups(fs: &mut FsInfo, type_flag: u64, len: u64, align: u64) -> Option<u64> {
    for gstart in fs.block_groups.candidate_groups(type_flag) {
        let Some(g) = fs.block_groups.groups.get(&gstart) else {
            continue;
        };
        let (lo, hi) = (g.start, g.start + g.length);
        if let Some(found) = fs.block_groups.free.find_in(lo, hi, len, align) {
            fs.block_groups.free.remove(found, len).ok()?;
            let g = fs.block_groups.groups.get_mut(&gstart).unwrap();
            g.used += len;
            g.dirty = true;
            fs.block_groups.last_alloc.insert(type_flag, gstart);
            return Some(found);
        }
    }
    None
}

fn block_flavor(owner: u64) -> u64 {
    if owner == BTRFS_CHUNK_TREE_OBJECTID {
        BTRFS_BLOCK_GROUP_SYSTEM
    } else {
        BTRFS_BLOCK_GROUP_METADATA
    }
}

/// Reserve one tree block, growing the pool by a fresh chunk if every group
/// of the right flavor is exhausted. The extent item is queued, not written.
pub fn alloc_tree_block(
    fs: &mut FsInfo,
    trans: &Transaction,
    root_objectid: u64,
    level: u8,
) -> Result<u64> {
    let flavor = block_flavor(root_objectid);
    let nodesize = fs.nodesize() as u64;
    let bytenr = match alloc_in_groups(fs, flavor, nodesize, nodesize) {
        Some(b) => b,
        None => {
            allocate_chunk(fs, trans, flavor | fs.metadata_profile_flags(), None)?;
            alloc_in_groups(fs, flavor, nodesize, nodesize).ok_or(BtrfsError::NoSpace {
                kind: "tree block",
                needed: nodesize,
            })?
        }
    };
    fs.delayed_refs.push_back(DelayedRef {
        bytenr,
        num_bytes: nodesize,
        action: RefAction::Inc,
        kind: RefKind::TreeBlock {
            root: root_objectid,
            level,
        },
        new_extent: Some(NewExtent {
            flags: BTRFS_EXTENT_FLAG_TREE_BLOCK,
            level,
            accounted: true,
        }),
    });
    debug!("alloc tree block {bytenr} for root {root_objectid} level {level}");
    Ok(bytenr)
}

/// Reserve a data extent and queue its first file-extent reference.
pub fn alloc_data_extent(
    fs: &mut FsInfo,
    trans: &Transaction,
    num_bytes: u64,
    root: u64,
    objectid: u64,
    file_offset: u64,
) -> Result<u64> {
    let sectorsize = fs.sectorsize() as u64;
    assert_eq!(num_bytes % sectorsize, 0);
    let bytenr = match alloc_in_groups(fs, BTRFS_BLOCK_GROUP_DATA, num_bytes, sectorsize) {
        Some(b) => b,
        None => {
            allocate_chunk(
                fs,
                trans,
                BTRFS_BLOCK_GROUP_DATA | fs.data_profile_flags(),
                Some(num_bytes),
            )?;
            alloc_in_groups(fs, BTRFS_BLOCK_GROUP_DATA, num_bytes, sectorsize).ok_or(
                BtrfsError::NoSpace {
                    kind: "data extent",
                    needed: num_bytes,
                },
            )?
        }
    };
    fs.delayed_refs.push_back(DelayedRef {
        bytenr,
        num_bytes,
        action: RefAction::Inc,
        kind: RefKind::Data {
            root,
            objectid,
            offset: file_offset,
        },
        new_extent: Some(NewExtent {
            flags: BTRFS_EXTENT_FLAG_DATA,
            level: 0,
            accounted: true,
        }),
    });
    let _ = trans;
    Ok(bytenr)
}

/// take an additional reference on an existing data extent
pub fn inc_data_ref(
    fs: &mut FsInfo,
    _trans: &Transaction,
    bytenr: u64,
    num_bytes: u64,
    root: u64,
    objectid: u64,
    file_offset: u64,
    first_ref: bool,
) {
    fs.delayed_refs.push_back(DelayedRef {
        bytenr,
        num_bytes,
        action: RefAction::Inc,
        kind: RefKind::Data {
            root,
            objectid,
            offset: file_offset,
        },
        new_extent: if first_ref {
            // callers referencing blocks already on disk account the space
            // themselves before queueing
            Some(NewExtent {
                flags: BTRFS_EXTENT_FLAG_DATA,
                level: 0,
                accounted: true,
            })
        } else {
            None
        },
    });
}

pub fn drop_data_ref(
    fs: &mut FsInfo,
    _trans: &Transaction,
    bytenr: u64,
    num_bytes: u64,
    root: u64,
    objectid: u64,
    file_offset: u64,
) {
    fs.delayed_refs.push_back(DelayedRef {
        bytenr,
        num_bytes,
        action: RefAction::Dec,
        kind: RefKind::Data {
            root,
            objectid,
            offset: file_offset,
        },
        new_extent: None,
    });
}

pub fn queue_drop_ref(
    fs: &mut FsInfo,
    _trans: &Transaction,
    bytenr: u64,
    num_bytes: u64,
    kind: RefKind,
) -> Result<()> {
    fs.delayed_refs.push_back(DelayedRef {
        bytenr,
        num_bytes,
        action: RefAction::Dec,
        kind,
        new_extent: None,
    });
    Ok(())
}

/// drop the owning reference of a tree block that left the tree
pub fn free_tree_block(
    fs: &mut FsInfo,
    trans: &Transaction,
    bytenr: u64,
    owner: u64,
    level: u8,
) -> Result<()> {
    queue_drop_ref(
        fs,
        trans,
        bytenr,
        fs.nodesize() as u64,
        RefKind::TreeBlock { root: owner, level },
    )
}

pub fn set_extent_flags(
    fs: &mut FsInfo,
    _trans: &Transaction,
    bytenr: u64,
    flags: u64,
) -> Result<()> {
    fs.delayed_refs.push_back(DelayedRef {
        bytenr,
        num_bytes: fs.nodesize() as u64,
        action: RefAction::SetFlags(flags),
        kind: RefKind::TreeBlock { root: 0, level: 0 },
        new_extent: None,
    });
    Ok(())
}

/// Queue one reference adjustment per direct child of `eb`: key pointers of
/// a node, or the on-disk data extents a leaf's file extents name.
pub fn ref_children(
    fs: &mut FsInfo,
    trans: &Transaction,
    eb: &EbRef,
    root_objectid: u64,
    full_backref: bool,
    inc: bool,
) -> Result<()> {
    let b = eb.borrow();
    let level = b.level();
    let parent = b.bytenr;
    let nodesize = fs.nodesize() as u64;
    let action = if inc { RefAction::Inc } else { RefAction::Dec };
    let n = b.nritems() as usize;
    let mut queued = Vec::new();
    if level > 0 {
        for slot in 0..n {
            let ptr = b.key_ptr(slot);
            let kind = if full_backref {
                RefKind::SharedBlock {
                    parent,
                    level: level - 1,
                }
            } else {
                RefKind::TreeBlock {
                    root: root_objectid,
                    level: level - 1,
                }
            };
            queued.push(DelayedRef {
                bytenr: ptr.blockptr,
                num_bytes: nodesize,
                action,
                kind,
                new_extent: None,
            });
        }
    } else {
        for slot in 0..n {
            let key = b.key(slot);
            if key.item_type != BtrfsItemType::EXTENT_DATA {
                continue;
            }
            let fe: btrfs_file_extent_item = b.read_item_struct(slot, 0);
            if fe.r#type == BTRFS_FILE_EXTENT_INLINE {
                continue;
            }
            let disk_bytenr = fe.disk_bytenr;
            if disk_bytenr == 0 {
                continue;
            }
            let kind = if full_backref {
                RefKind::SharedData { parent }
            } else {
                let fe_offset = fe.offset;
                RefKind::Data {
                    root: root_objectid,
                    objectid: key.objectid,
                    offset: key.offset.wrapping_sub(fe_offset),
                }
            };
            queued.push(DelayedRef {
                bytenr: disk_bytenr,
                num_bytes: fe.disk_num_bytes,
                action,
                kind,
                new_extent: None,
            });
        }
    }
    drop(b);
    let _ = trans;
    fs.delayed_refs.extend(queued);
    Ok(())
}

/// on-disk refcount and flags of a tree block, adjusted by whatever is
/// still sitting in the queue
pub fn lookup_tree_block_refs(fs: &mut FsInfo, bytenr: u64) -> Result<(u64, u64)> {
    let mut extent_root = fs.root(BTRFS_EXTENT_TREE_OBJECTID)?;
    let key = btrfs_disk_key::new(bytenr, BtrfsItemType::EXTENT_ITEM, fs.nodesize() as u64);
    let (path, found) = ctree::search_slot(fs, None, &mut extent_root, &key, 0, false)?;
    let (mut refs, mut flags) = if found {
        let rec = ExtentRec::decode(&path.item_data())?;
        (rec.refs, rec.flags)
    } else {
        (0, 0)
    };
    for r in fs.delayed_refs.iter() {
        if r.bytenr != bytenr {
            continue;
        }
        match r.action {
            RefAction::Inc => refs += 1,
            RefAction::Dec => refs = refs.saturating_sub(1),
            RefAction::SetFlags(f) => flags |= f,
        }
        if let Some(ne) = &r.new_extent {
            flags |= ne.flags;
        }
    }
    Ok((refs, flags))
}

fn matching_ref(rec: &ExtentRec, kind: &RefKind) -> Option<usize> {
    rec.inline.iter().position(|r| match (r, kind) {
        (InlineRef::TreeBlock { root }, RefKind::TreeBlock { root: want, .. }) => root == want,
        (InlineRef::SharedBlock { parent }, RefKind::SharedBlock { parent: want, .. }) => {
            parent == want
        }
        (
            InlineRef::Data {
                root,
                objectid,
                offset,
                ..
            },
            RefKind::Data {
                root: wr,
                objectid: wo,
                offset: woff,
            },
        ) => root == wr && objectid == wo && offset == woff,
        (InlineRef::SharedData { parent, .. }, RefKind::SharedData { parent: want }) => {
            parent == want
        }
        _ => false,
    })
}

/// a dec whose exact key is gone falls back to any ref of the same class so
/// the refcount invariant survives re-keyed shared blocks
fn matching_ref_lenient(rec: &ExtentRec, kind: &RefKind) -> Option<usize> {
    if let Some(i) = matching_ref(rec, kind) {
        return Some(i);
    }
    match kind {
        RefKind::TreeBlock { .. } | RefKind::SharedBlock { .. } => rec
            .inline
            .iter()
            .position(|r| matches!(r, InlineRef::SharedBlock { .. }))
            .or_else(|| {
                rec.inline
                    .iter()
                    .position(|r| matches!(r, InlineRef::TreeBlock { .. }))
            }),
        RefKind::Data { .. } | RefKind::SharedData { .. } => rec
            .inline
            .iter()
            .position(|r| matches!(r, InlineRef::SharedData { .. }))
            .or_else(|| {
                rec.inline
                    .iter()
                    .position(|r| matches!(r, InlineRef::Data { .. }))
            }),
    }
}

/// Drain the queue. Processing an entry may cow extent-tree blocks and push
/// further entries; the loop runs until the tree and the queue agree.
pub fn run_delayed_refs(fs: &mut FsInfo, trans: &Transaction) -> Result<()> {
    let mut guard = 0_u32;
    while let Some(r) = fs.delayed_refs.pop_front() {
        guard += 1;
        if guard > 1_000_000 {
            return Err(BtrfsError::corrupt("delayed ref queue does not settle"));
        }
        apply_one_ref(fs, trans, r)?;
    }
    Ok(())
}

fn apply_one_ref(fs: &mut FsInfo, trans: &Transaction, r: DelayedRef) -> Result<()> {
    let mut extent_root = fs.root(BTRFS_EXTENT_TREE_OBJECTID)?;
    let key = btrfs_disk_key::new(r.bytenr, BtrfsItemType::EXTENT_ITEM, r.num_bytes);
    let (mut path, found) = ctree::search_slot(fs, Some(trans), &mut extent_root, &key, 0, true)?;

    match r.action {
        RefAction::SetFlags(flags) => {
            if !found {
                fs.set_root(extent_root);
                return Err(BtrfsError::corrupt(format!(
                    "flag update for unknown extent {}",
                    r.bytenr
                )));
            }
            let mut rec = ExtentRec::decode(&path.item_data())?;
            rec.flags |= flags;
            let leaf = path.leaf();
            leaf.borrow_mut().write_item_data(path.slot(), &rec.encode());
            leaf.borrow_mut().dirty = true;
        }
        RefAction::Inc => {
            let mut rec = if found {
                ExtentRec::decode(&path.item_data())?
            } else {
                let ne = r.new_extent.ok_or_else(|| {
                    BtrfsError::corrupt(format!("ref increment on unknown extent {}", r.bytenr))
                })?;
                if !ne.accounted {
                    let _ = fs.block_groups.free.remove(r.bytenr, r.num_bytes);
                    if let Some(g) = fs.block_groups.lookup_mut(r.bytenr) {
                        g.used += r.num_bytes;
                        g.dirty = true;
                    }
                }
                ExtentRec {
                    refs: 0,
                    generation: trans.transid,
                    flags: ne.flags,
                    block_info: if ne.flags & BTRFS_EXTENT_FLAG_TREE_BLOCK != 0 {
                        Some(btrfs_tree_block_info {
                            key: btrfs_disk_key::new(0, BtrfsItemType::MIN, 0),
                            level: ne.level,
                        })
                    } else {
                        None
                    },
                    inline: Vec::new(),
                }
            };
            match matching_ref(&rec, &r.kind) {
                Some(i) => match &mut rec.inline[i] {
                    InlineRef::Data { count, .. } | InlineRef::SharedData { count, .. } => {
                        *count += 1
                    }
                    _ => {
                        fs.set_root(extent_root);
                        return Err(BtrfsError::corrupt(format!(
                            "duplicate tree ref on extent {}",
                            r.bytenr
                        )));
                    }
                },
                None => rec.inline.push(match r.kind {
                    RefKind::TreeBlock { root, .. } => InlineRef::TreeBlock { root },
                    RefKind::SharedBlock { parent, .. } => InlineRef::SharedBlock { parent },
                    RefKind::Data {
                        root,
                        objectid,
                        offset,
                    } => InlineRef::Data {
                        root,
                        objectid,
                        offset,
                        count: 1,
                    },
                    RefKind::SharedData { parent } => InlineRef::SharedData { parent, count: 1 },
                }),
            }
            rec.refs += 1;
            let payload = rec.encode();
            if found {
                // size may have grown: replace the item
                ctree::delete_item(fs, trans, &mut extent_root, &mut path)?;
            }
            fs.set_root(extent_root);
            let mut extent_root = fs.root(BTRFS_EXTENT_TREE_OBJECTID)?;
            ctree::insert_item(fs, trans, &mut extent_root, &key, &payload)?;
            fs.set_root(extent_root);
            return Ok(());
        }
        RefAction::Dec => {
            if !found {
                fs.set_root(extent_root);
                return Err(BtrfsError::corrupt(format!(
                    "ref decrement on unknown extent {}",
                    r.bytenr
                )));
            }
            let mut rec = ExtentRec::decode(&path.item_data())?;
            let Some(i) = matching_ref_lenient(&rec, &r.kind) else {
                fs.set_root(extent_root);
                return Err(BtrfsError::corrupt(format!(
                    "no matching back-reference on extent {}",
                    r.bytenr
                )));
            };
            let remove = match &mut rec.inline[i] {
                InlineRef::Data { count, .. } | InlineRef::SharedData { count, .. } => {
                    *count -= 1;
                    *count == 0
                }
                _ => true,
            };
            if remove {
                rec.inline.remove(i);
            }
            rec.refs -= 1;

            if rec.refs == 0 {
                let is_tree = rec.flags & BTRFS_EXTENT_FLAG_TREE_BLOCK != 0;
                ctree::delete_item(fs, trans, &mut extent_root, &mut path)?;
                fs.set_root(extent_root);
                release_extent(fs, trans, r.bytenr, r.num_bytes, is_tree, rec.flags)?;
                return Ok(());
            }
            let payload = rec.encode();
            ctree::delete_item(fs, trans, &mut extent_root, &mut path)?;
            fs.set_root(extent_root);
            let mut extent_root = fs.root(BTRFS_EXTENT_TREE_OBJECTID)?;
            ctree::insert_item(fs, trans, &mut extent_root, &key, &payload)?;
            fs.set_root(extent_root);
            return Ok(());
        }
    }
    fs.set_root(extent_root);
    Ok(())
}

/// the last reference went away: return the space and, for tree blocks,
/// walk the block to drop what it referenced
fn release_extent(
    fs: &mut FsInfo,
    trans: &Transaction,
    bytenr: u64,
    num_bytes: u64,
    is_tree: bool,
    flags: u64,
) -> Result<()> {
    if is_tree {
        // same-transaction blocks only exist in the cache; older ones are
        // still readable from disk
        let eb = match fs.cache.lookup(bytenr) {
            Some(eb) => eb,
            None => fs.read_block(bytenr, None)?,
        };
        let full = flags & BTRFS_BLOCK_FLAG_FULL_BACKREF != 0;
        let owner = eb.borrow().owner();
        ref_children(fs, trans, &eb, owner, full, false)?;
        eb.borrow_mut().dirty = false;
        fs.cache.remove(bytenr);
    } else {
        crate::inode::remove_data_csums(fs, trans, bytenr, num_bytes)?;
    }
    fs.block_groups.free.add_free(bytenr, num_bytes);
    if let Some(g) = fs.block_groups.lookup_mut(bytenr) {
        g.used = g.used.saturating_sub(num_bytes);
        g.dirty = true;
    }
    Ok(())
}

/// Grow the pool: plan a chunk, wire it into the in-memory maps first so
/// the tree inserts below can already allocate from it, then write the
/// chunk item, device extents and block group item.
pub fn allocate_chunk(
    fs: &mut FsInfo,
    trans: &Transaction,
    type_flags: u64,
    size_hint: Option<u64>,
) -> Result<u64> {
    let devices: Vec<(u64, u64, BtrfsUuid)> = fs
        .dev_items
        .iter()
        .map(|(devid, di)| (*devid, di.total_bytes, di.uuid))
        .collect();
    let plan = volumes::plan_chunk(
        &devices,
        &fs.dev_alloc,
        &fs.chunk_map,
        type_flags,
        size_hint,
    )?;
    let mapping = plan.mapping.clone();
    let logical = mapping.logical;
    debug!(
        "allocate chunk {:#x} type {:#x} length {}",
        logical, type_flags, mapping.length
    );

    for stripe in &mapping.stripes {
        fs.dev_alloc.reserve(stripe.devid, stripe.physical, plan.stripe_size);
        if let Some((_, di)) = fs.dev_items.iter_mut().find(|(id, _)| *id == stripe.devid) {
            di.bytes_used += plan.stripe_size;
        }
    }
    fs.chunk_map.insert(mapping.clone())?;
    fs.block_groups
        .add(mapping.logical, mapping.length, type_flags, 0);

    let (chunk, stripes) = mapping.to_disk();
    let chunk_key = btrfs_disk_key::new(
        BTRFS_FIRST_CHUNK_TREE_OBJECTID,
        BtrfsItemType::CHUNK_ITEM,
        logical,
    );
    if type_flags & BTRFS_BLOCK_GROUP_SYSTEM != 0 {
        crate::superblock::append_sys_chunk(&mut fs.sb, &chunk_key, &chunk, &stripes)?;
    }

    let mut payload = Vec::new();
    payload.extend_from_slice(struct_bytes(&chunk));
    for s in &stripes {
        payload.extend_from_slice(struct_bytes(s));
    }
    let mut chunk_root = fs.root(BTRFS_CHUNK_TREE_OBJECTID)?;
    ctree::insert_item(fs, trans, &mut chunk_root, &chunk_key, &payload)?;
    fs.set_root(chunk_root);

    let mut dev_root = fs.root(BTRFS_DEV_TREE_OBJECTID)?;
    for stripe in &mapping.stripes {
        let de = btrfs_dev_extent {
            chunk_tree: BTRFS_CHUNK_TREE_OBJECTID,
            chunk_objectid: BTRFS_FIRST_CHUNK_TREE_OBJECTID,
            chunk_offset: logical,
            length: plan.stripe_size,
            chunk_tree_uuid: fs.sb.metadata_uuid,
        };
        let de_key = btrfs_disk_key::new(stripe.devid, BtrfsItemType::DEV_EXTENT, stripe.physical);
        ctree::insert_item(fs, trans, &mut dev_root, &de_key, struct_bytes(&de))?;
    }
    fs.set_root(dev_root);

    let bg = btrfs_block_group_item {
        used: 0,
        chunk_objectid: BTRFS_FIRST_CHUNK_TREE_OBJECTID,
        flags: type_flags,
    };
    let bg_key = btrfs_disk_key::new(logical, BtrfsItemType::BLOCK_GROUP_ITEM, mapping.length);
    let mut extent_root = fs.root(BTRFS_EXTENT_TREE_OBJECTID)?;
    ctree::insert_item(fs, trans, &mut extent_root, &bg_key, struct_bytes(&bg))?;
    fs.set_root(extent_root);

    Ok(logical)
}

/// push the in-memory `used` counters back into the block group items
pub fn write_dirty_block_groups(fs: &mut FsInfo, trans: &Transaction) -> Result<()> {
    loop {
        let dirty: Vec<(u64, u64, u64, u64)> = fs
            .block_groups
            .groups
            .values()
            .filter(|g| g.dirty)
            .map(|g| (g.start, g.length, g.flags, g.used))
            .collect();
        if dirty.is_empty() {
            return Ok(());
        }
        for (start, length, flags, used) in dirty {
            if let Some(g) = fs.block_groups.groups.get_mut(&start) {
                g.dirty = false;
            }
            let key = btrfs_disk_key::new(start, BtrfsItemType::BLOCK_GROUP_ITEM, length);
            let mut extent_root = fs.root(BTRFS_EXTENT_TREE_OBJECTID)?;
            let (path, found) = ctree::search_slot(fs, Some(trans), &mut extent_root, &key, 0, true)?;
            if !found {
                fs.set_root(extent_root);
                return Err(BtrfsError::corrupt(format!(
                    "block group item missing for {start}"
                )));
            }
            let bg = btrfs_block_group_item {
                used,
                chunk_objectid: BTRFS_FIRST_CHUNK_TREE_OBJECTID,
                flags,
            };
            let leaf = path.leaf();
            leaf.borrow_mut()
                .write_item_data(path.slot(), struct_bytes(&bg));
            leaf.borrow_mut().dirty = true;
            fs.set_root(extent_root);
        }
        run_delayed_refs(fs, trans)?;
    }
}

/// recompute used bytes per block group straight from the extent items and
/// compare with the cached accounting
pub fn verify_block_groups(fs: &mut FsInfo) -> Result<()> {
    let mut recomputed: BTreeMap<u64, u64> = BTreeMap::new();
    let mut extent_root = fs.root(BTRFS_EXTENT_TREE_OBJECTID)?;
    let key = btrfs_disk_key::new(0, BtrfsItemType::MIN, 0);
    let (mut path, _) = ctree::search_slot(fs, None, &mut extent_root, &key, 0, false)?;
    loop {
        let leaf = path.leaf();
        let n = leaf.borrow().nritems() as usize;
        if path.slot() < n {
            let k = leaf.borrow().key(path.slot());
            if k.item_type == BtrfsItemType::EXTENT_ITEM {
                if let Some(g) = fs.block_groups.lookup(k.objectid) {
                    *recomputed.entry(g.start).or_default() += k.offset;
                }
            }
        }
        if !ctree::next_item(fs, &extent_root, &mut path)? {
            break;
        }
    }
    for g in fs.block_groups.groups.values() {
        let want = recomputed.get(&g.start).copied().unwrap_or(0);
        if g.used != want {
            return Err(BtrfsError::corrupt(format!(
                "block group {} accounts {} bytes used, extents say {}",
                g.start, g.used, want
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn space_map_merges_neighbours() {
        let mut sm = SpaceMap::new();
        sm.add_free(0, 4096);
        sm.add_free(8192, 4096);
        sm.add_free(4096, 4096);
        let all: Vec<(u64, u64)> = sm.iter().collect();
        assert_eq!(all, vec![(0, 12288)]);
    }

    #[test]
    fn space_map_remove_splits() {
        let mut sm = SpaceMap::new();
        sm.add_free(0, 16384);
        sm.remove(4096, 4096).unwrap();
        let all: Vec<(u64, u64)> = sm.iter().collect();
        assert_eq!(all, vec![(0, 4096), (8192, 8192)]);
        assert!(sm.remove(4096, 4096).is_err());
    }

    #[test]
    fn space_map_aligned_find() {
        let mut sm = SpaceMap::new();
        sm.add_free(1000, 100000);
        let found = sm.find_in(0, u64::MAX, 4096, 4096).unwrap();
        assert_eq!(found % 4096, 0);
        assert!(found >= 1000);
    }

    #[test]
    fn extent_rec_round_trip() {
        let rec = ExtentRec {
            refs: 3,
            generation: 7,
            flags: BTRFS_EXTENT_FLAG_TREE_BLOCK,
            block_info: Some(btrfs_tree_block_info {
                key: btrfs_disk_key::new(0, BtrfsItemType::MIN, 0),
                level: 1,
            }),
            inline: vec![
                InlineRef::SharedBlock { parent: 1234 },
                InlineRef::TreeBlock { root: 5 },
                InlineRef::TreeBlock { root: 256 },
            ],
        };
        let enc = rec.encode();
        let back = ExtentRec::decode(&enc).unwrap();
        assert_eq!(back.refs, 3);
        assert_eq!(back.flags, BTRFS_EXTENT_FLAG_TREE_BLOCK);
        assert_eq!(back.inline.len(), 3);
        // tree refs sort before shared refs
        assert_eq!(back.inline[0], InlineRef::TreeBlock { root: 5 });
        assert_eq!(back.inline[2], InlineRef::SharedBlock { parent: 1234 });
        assert_eq!(back.ref_sum(), 3);
    }

    #[test]
    fn extent_rec_data_refs() {
        let rec = ExtentRec {
            refs: 5,
            generation: 9,
            flags: BTRFS_EXTENT_FLAG_DATA,
            block_info: None,
            inline: vec![
                InlineRef::Data {
                    root: 5,
                    objectid: 257,
                    offset: 0,
                    count: 4,
                },
                InlineRef::SharedData {
                    parent: 65536,
                    count: 1,
                },
            ],
        };
        let back = ExtentRec::decode(&rec.encode()).unwrap();
        assert_eq!(back.ref_sum(), 5);
        assert_eq!(back.inline[0],
            InlineRef::Data { root: 5, objectid: 257, offset: 0, count: 4 });
    }
}
