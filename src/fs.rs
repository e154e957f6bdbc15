//! Pool state and the open/commit paths tying the layers together.

use crate::ctree::TreeRoot;
use crate::device::{Device, DeviceSet, Registry};
use crate::error::{BtrfsError, Result};
use crate::extent_io::{self, EbRef, ExtentCache};
use crate::extent_tree::{self, BlockGroupCache, DelayedRef};
use crate::structures::*;
use crate::superblock::{self, SbReadFlags, SysChunkIter};
use crate::transaction::Transaction;
use crate::volumes::{ChunkMap, ChunkMapping, DevAllocMap};

use log::{debug, warn};
use std::collections::{HashMap, VecDeque};
use std::path::Path as FsPath;

#[derive(Clone, Copy)]
pub struct OpenFlags {
    pub writable: bool,
    /// alternate primary superblock offset, used by the converter
    pub sb_bytenr: u64,
    pub temporary_magic: bool,
    pub recover: bool,
}

impl Default for OpenFlags {
    fn default() -> OpenFlags {
        OpenFlags {
            writable: false,
            sb_bytenr: BTRFS_SUPER_INFO_OFFSET,
            temporary_magic: false,
            recover: false,
        }
    }
}

/// processed info about the filesystem
pub struct FsInfo {
    pub devices: DeviceSet,
    pub sb: btrfs_super_block,
    pub fsid: BtrfsFsid,
    pub chunk_map: ChunkMap,
    pub dev_alloc: DevAllocMap,
    pub dev_items: Vec<(u64, btrfs_dev_item)>,
    pub cache: ExtentCache,
    pub block_groups: BlockGroupCache,
    pub delayed_refs: VecDeque<DelayedRef>,
    roots: HashMap<u64, TreeRoot>,
    pub generation: u64,
    pub trans_running: bool,
    pub writable: bool,
    pub sb_bytenr: u64,
    pub metadata_profile: u64,
    pub data_profile: u64,
}

impl FsInfo {
    pub fn nodesize(&self) -> u32 {
        self.sb.nodesize
    }

    pub fn sectorsize(&self) -> u32 {
        self.sb.sectorsize
    }

    pub fn csum_type(&self) -> BtrfsCsumType {
        self.sb.csum_type
    }

    pub fn leaf_data_size(&self) -> usize {
        btrfs_leaf_data_size(self.sb.nodesize)
    }

    pub fn metadata_profile_flags(&self) -> u64 {
        self.metadata_profile
    }

    pub fn data_profile_flags(&self) -> u64 {
        self.data_profile
    }

    pub fn read_block(&mut self, bytenr: u64, expected_generation: Option<u64>) -> Result<EbRef> {
        extent_io::read_tree_block(
            &self.devices,
            &self.chunk_map,
            &mut self.cache,
            self.sb.csum_type,
            self.sb.nodesize,
            bytenr,
            expected_generation,
        )
    }

    pub fn root(&self, objectid: u64) -> Result<TreeRoot> {
        self.roots
            .get(&objectid)
            .cloned()
            .ok_or(BtrfsError::NotFound)
    }

    pub fn set_root(&mut self, root: TreeRoot) {
        self.roots.insert(root.objectid, root);
    }

    pub fn forget_root(&mut self, objectid: u64) {
        self.roots.remove(&objectid);
    }

    pub fn known_roots(&self) -> Vec<u64> {
        self.roots.keys().copied().collect()
    }
}

/// Open a pool from its member device paths. Single-device pools pass one
/// path; the caller lists every member for multi-device pools.
pub fn open_fs(registry: &mut Registry, paths: &[&FsPath], flags: OpenFlags) -> Result<FsInfo> {
    if paths.is_empty() {
        return Err(BtrfsError::InvalidArgument("no devices given".into()));
    }
    let sbflags = SbReadFlags {
        temporary: flags.temporary_magic,
        recover: flags.recover,
    };

    let mut devices: Option<DeviceSet> = None;
    let mut master: Option<btrfs_super_block> = None;
    let mut dev_items: Vec<(u64, btrfs_dev_item)> = Vec::new();

    for path in paths {
        let mut dev = Device::open(path, flags.writable)?;
        let sb = if flags.sb_bytenr != BTRFS_SUPER_INFO_OFFSET {
            superblock::read_super(&dev, flags.sb_bytenr, sbflags)?
        } else {
            superblock::read_best_super(&dev, sbflags)?
        };
        registry.record(sb.fsid, path);
        dev.devid = sb.dev_item.devid;
        dev.dev_uuid = sb.dev_item.uuid;
        dev.total_bytes = sb.dev_item.total_bytes;
        dev.sector_size = sb.dev_item.sector_size;
        dev.io_align = sb.dev_item.io_align;

        match &devices {
            None => {
                let mut set = DeviceSet::new(sb.fsid, flags.writable);
                dev_items.push((dev.devid, sb.dev_item));
                set.insert(dev);
                devices = Some(set);
            }
            Some(_) => {
                let set = devices.as_mut().unwrap();
                if sb.fsid != set.fsid {
                    return Err(BtrfsError::corrupt(format!(
                        "{} belongs to a different filesystem",
                        path.display()
                    )));
                }
                dev_items.push((dev.devid, sb.dev_item));
                set.insert(dev);
            }
        }
        match &master {
            None => master = Some(sb),
            Some(m) => {
                let m_gen = m.generation;
                let gen = sb.generation;
                if gen > m_gen {
                    master = Some(sb);
                }
            }
        }
    }

    let devices = devices.unwrap();
    let sb = master.unwrap();
    let expected = sb.num_devices;
    let present = devices.num_devices() as u64;
    if present < expected {
        warn!("{present}/{expected} devices present");
        if flags.writable {
            return Err(BtrfsError::corrupt(
                "refusing writable open with missing devices",
            ));
        }
    }

    let mut fs = FsInfo {
        fsid: sb.fsid,
        devices,
        sb,
        chunk_map: ChunkMap::new(),
        dev_alloc: DevAllocMap::new(),
        dev_items,
        cache: ExtentCache::new(),
        block_groups: BlockGroupCache::new(),
        delayed_refs: VecDeque::new(),
        roots: HashMap::new(),
        generation: sb.generation,
        trans_running: false,
        writable: flags.writable,
        sb_bytenr: flags.sb_bytenr,
        metadata_profile: 0,
        data_profile: 0,
    };

    // bootstrap mapping straight out of the superblock, then the real thing
    for ci in SysChunkIter::new(&fs.sb) {
        let logical = ci.0.offset;
        fs.chunk_map
            .insert(ChunkMapping::from_disk(logical, &ci.1, ci.2))?;
    }
    read_chunk_tree(&mut fs)?;
    fs.dev_alloc.seed_from_chunks(&fs.chunk_map);

    let tree_root = TreeRoot::new(
        BTRFS_ROOT_TREE_OBJECTID,
        fs.sb.root,
        fs.sb.root_level,
        fs.sb.generation,
    );
    fs.set_root(tree_root);
    let chunk_root = TreeRoot::new(
        BTRFS_CHUNK_TREE_OBJECTID,
        fs.sb.chunk_root,
        fs.sb.chunk_root_level,
        fs.sb.chunk_root_generation,
    );
    fs.set_root(chunk_root);

    for objectid in [
        BTRFS_EXTENT_TREE_OBJECTID,
        BTRFS_DEV_TREE_OBJECTID,
        BTRFS_CSUM_TREE_OBJECTID,
        BTRFS_FS_TREE_OBJECTID,
        BTRFS_UUID_TREE_OBJECTID,
    ] {
        match crate::root_tree::read_root_item(&mut fs, objectid) {
            Ok((item, _)) => {
                fs.set_root(TreeRoot::from_item(objectid, &item));
            }
            Err(BtrfsError::NotFound) if objectid == BTRFS_UUID_TREE_OBJECTID => {}
            Err(e) => return Err(e),
        }
    }

    load_block_groups(&mut fs)?;
    debug!(
        "opened pool {} generation {}",
        hex::encode(fs.fsid),
        fs.generation
    );
    Ok(fs)
}

/// walk the chunk tree, filling the chunk map and the device table
fn read_chunk_tree(fs: &mut FsInfo) -> Result<()> {
    let root = TreeRoot::new(
        BTRFS_CHUNK_TREE_OBJECTID,
        fs.sb.chunk_root,
        fs.sb.chunk_root_level,
        fs.sb.chunk_root_generation,
    );
    walk_leaves(fs, &root, &mut |fs, leaf, slot| {
        let key = leaf.borrow().key(slot);
        match key.item_type {
            BtrfsItemType::CHUNK_ITEM => {
                let data = leaf.borrow().item_data(slot);
                let chunk: btrfs_chunk = read_struct(&data, 0);
                let mut stripes = Vec::new();
                let mut off = std::mem::size_of::<btrfs_chunk>();
                for _ in 0..chunk.num_stripes {
                    stripes.push(read_struct::<btrfs_stripe>(&data, off));
                    off += std::mem::size_of::<btrfs_stripe>();
                }
                let mapping = ChunkMapping::from_disk(key.offset, &chunk, stripes);
                if fs.chunk_map.lookup(key.offset).is_none() {
                    fs.chunk_map.insert(mapping)?;
                }
            }
            BtrfsItemType::DEV_ITEM => {
                let di: btrfs_dev_item = leaf.borrow().read_item_struct(slot, 0);
                if let Some(entry) = fs.dev_items.iter_mut().find(|(id, _)| *id == di.devid) {
                    entry.1 = di;
                } else {
                    fs.dev_items.push((di.devid, di));
                }
            }
            _ => {}
        }
        Ok(())
    })
}

/// depth-first sweep over every leaf item of a tree
pub fn walk_leaves(
    fs: &mut FsInfo,
    root: &TreeRoot,
    visit: &mut dyn FnMut(&mut FsInfo, &EbRef, usize) -> Result<()>,
) -> Result<()> {
    fn recurse(
        fs: &mut FsInfo,
        bytenr: u64,
        gen: u64,
        visit: &mut dyn FnMut(&mut FsInfo, &EbRef, usize) -> Result<()>,
    ) -> Result<()> {
        let eb = fs.read_block(bytenr, Some(gen))?;
        let level = eb.borrow().level();
        let n = eb.borrow().nritems() as usize;
        if level == 0 {
            for slot in 0..n {
                visit(fs, &eb, slot)?;
            }
        } else {
            for slot in 0..n {
                let ptr = eb.borrow().key_ptr(slot);
                recurse(fs, ptr.blockptr, ptr.generation, visit)?;
            }
        }
        Ok(())
    }
    recurse(fs, root.bytenr, root.generation, visit)
}

/// block groups and the free-space complement of the extent items
fn load_block_groups(fs: &mut FsInfo) -> Result<()> {
    let Ok(extent_root) = fs.root(BTRFS_EXTENT_TREE_OBJECTID) else {
        return Ok(());
    };
    let mut groups: Vec<(u64, u64, u64, u64)> = Vec::new();
    let mut extents: Vec<(u64, u64)> = Vec::new();
    walk_leaves(fs, &extent_root, &mut |_fs, leaf, slot| {
        let key = leaf.borrow().key(slot);
        match key.item_type {
            BtrfsItemType::BLOCK_GROUP_ITEM => {
                let bg: btrfs_block_group_item = leaf.borrow().read_item_struct(slot, 0);
                groups.push((key.objectid, key.offset, bg.flags, bg.used));
            }
            BtrfsItemType::EXTENT_ITEM => {
                extents.push((key.objectid, key.offset));
            }
            _ => {}
        }
        Ok(())
    })?;

    for (start, length, flags, used) in groups {
        fs.block_groups.add(start, length, flags, used);
        if flags & BTRFS_BLOCK_GROUP_METADATA != 0 {
            fs.metadata_profile = flags & BTRFS_BLOCK_GROUP_PROFILE_MASK;
        }
        if flags & BTRFS_BLOCK_GROUP_DATA != 0 {
            fs.data_profile = flags & BTRFS_BLOCK_GROUP_PROFILE_MASK;
        }
    }
    for (start, len) in extents {
        fs.block_groups.free.remove(start, len)?;
    }
    Ok(())
}

/// rank used to write trees in dependency order at commit
fn owner_rank(owner: u64) -> u8 {
    match owner {
        BTRFS_CHUNK_TREE_OBJECTID => 0,
        BTRFS_DEV_TREE_OBJECTID => 1,
        BTRFS_EXTENT_TREE_OBJECTID => 2,
        BTRFS_ROOT_TREE_OBJECTID => 4,
        _ => 3,
    }
}

/// Settle the trees, write every dirty block, then the superblocks last.
pub fn commit(fs: &mut FsInfo, trans: &Transaction) -> Result<()> {
    // iterate to a fixed point: settling refs can dirty block groups and
    // root items, which dirties more tree blocks
    for _ in 0..64 {
        extent_tree::run_delayed_refs(fs, trans)?;
        extent_tree::write_dirty_block_groups(fs, trans)?;

        let mut changed = false;
        for objectid in fs.known_roots() {
            if objectid == BTRFS_ROOT_TREE_OBJECTID || objectid == BTRFS_CHUNK_TREE_OBJECTID {
                continue;
            }
            let root = fs.root(objectid)?;
            let stale = match &root.root_item {
                Some(item) => {
                    let b = item.bytenr;
                    let g = item.generation;
                    b != root.bytenr || g != root.generation
                }
                None => true,
            };
            if stale {
                crate::root_tree::update_root_item(fs, trans, objectid)?;
                changed = true;
            }
        }
        if !changed && fs.delayed_refs.is_empty() {
            break;
        }
    }
    if !fs.delayed_refs.is_empty() {
        return Err(BtrfsError::corrupt("commit did not reach a fixed point"));
    }

    // write dirty blocks, leaves first within dependency-ordered trees
    let mut dirty = fs.cache.dirty_bytenrs();
    dirty.sort_by_key(|bytenr| {
        fs.cache
            .lookup(*bytenr)
            .map(|eb| {
                let b = eb.borrow();
                (owner_rank(b.owner()), b.level(), b.bytenr)
            })
            .unwrap_or((255, 255, *bytenr))
    });
    for bytenr in dirty {
        if let Some(eb) = fs.cache.lookup(bytenr) {
            let mut b = eb.borrow_mut();
            extent_io::write_tree_block(&fs.devices, &fs.chunk_map, fs.sb.csum_type, &mut b)?;
        }
    }

    // publish the new generation
    let tree_root = fs.root(BTRFS_ROOT_TREE_OBJECTID)?;
    let chunk_root = fs.root(BTRFS_CHUNK_TREE_OBJECTID)?;
    fs.sb.generation = trans.transid;
    fs.sb.root = tree_root.bytenr;
    fs.sb.root_level = tree_root.level;
    fs.sb.chunk_root = chunk_root.bytenr;
    fs.sb.chunk_root_level = chunk_root.level;
    fs.sb.chunk_root_generation = chunk_root.generation;
    fs.sb.bytes_used = fs.block_groups.groups.values().map(|g| g.used).sum();
    for (devid, di) in fs.dev_items.iter_mut() {
        let _ = devid;
        di.generation = trans.transid;
    }

    if fs.sb_bytenr == BTRFS_SUPER_INFO_OFFSET {
        superblock::write_all_supers(&fs.devices, &fs.sb, &fs.dev_items)?;
    } else {
        // converter intermediate state: one provisional copy only
        for dev in fs.devices.devid_map.values() {
            dev.flush()?;
            superblock::write_one_super(dev, &fs.sb, fs.sb_bytenr)?;
            dev.flush()?;
        }
    }
    fs.cache.shrink();
    Ok(())
}
