//! Creation of an empty pool. The first few tree blocks are laid out by
//! hand with identity-mapped bootstrap chunks; everything after that goes
//! through normal transactions on the opened filesystem.

use crate::csum::csum_data;
use crate::device::{Device, Registry};
use crate::error::{BtrfsError, Result};
use crate::fs::{self, FsInfo, OpenFlags};
use crate::structures::*;
use crate::superblock;
use crate::transaction::{commit_transaction, start_transaction, Transaction};

use log::debug;
use std::path::{Path, PathBuf};

const BTRFS_FEATURE_INCOMPAT_MIXED_BACKREF: u64 = 1 << 0;

const SYSTEM_CHUNK_START: u64 = 1024 * 1024;
const SYSTEM_CHUNK_SIZE: u64 = 4 * 1024 * 1024;
const METADATA_CHUNK_START: u64 = SYSTEM_CHUNK_START + SYSTEM_CHUNK_SIZE;
const METADATA_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

pub struct MkfsConfig {
    pub paths: Vec<PathBuf>,
    pub label: String,
    pub nodesize: u32,
    pub sectorsize: u32,
    pub csum_type: BtrfsCsumType,
    pub metadata_profile: u64,
    pub data_profile: u64,
}

impl MkfsConfig {
    pub fn new(paths: Vec<PathBuf>) -> MkfsConfig {
        MkfsConfig {
            paths,
            label: String::new(),
            nodesize: 16384,
            sectorsize: 4096,
            csum_type: BtrfsCsumType::CRC32,
            metadata_profile: 0,
            data_profile: 0,
        }
    }
}

/// append-only builder for the handcrafted bootstrap leaves
struct LeafBuilder {
    data: Vec<u8>,
    nritems: u32,
    data_end: usize,
}

impl LeafBuilder {
    fn new(nodesize: u32) -> LeafBuilder {
        LeafBuilder {
            data: vec![0_u8; nodesize as usize],
            nritems: 0,
            data_end: btrfs_leaf_data_size(nodesize),
        }
    }

    fn add(&mut self, key: btrfs_disk_key, payload: &[u8]) {
        self.data_end -= payload.len();
        let item = btrfs_item {
            key,
            offset: self.data_end as u32,
            size: payload.len() as u32,
        };
        write_struct(
            &mut self.data,
            BTRFS_HEADER_SIZE + self.nritems as usize * std::mem::size_of::<btrfs_item>(),
            &item,
        );
        self.data[BTRFS_HEADER_SIZE + self.data_end
            ..BTRFS_HEADER_SIZE + self.data_end + payload.len()]
            .copy_from_slice(payload);
        self.nritems += 1;
    }

    fn finish(
        mut self,
        bytenr: u64,
        owner: u64,
        fsid: &BtrfsFsid,
        chunk_tree_uuid: &BtrfsUuid,
        csum_type: BtrfsCsumType,
    ) -> Vec<u8> {
        let mut hdr: btrfs_header = read_struct(&[0_u8; BTRFS_HEADER_SIZE], 0);
        hdr.fsid = *fsid;
        hdr.bytenr = bytenr;
        hdr.flags = BTRFS_HEADER_FLAG_WRITTEN;
        hdr.chunk_tree_uuid = *chunk_tree_uuid;
        hdr.generation = 1;
        hdr.owner = owner;
        hdr.nritems = self.nritems;
        hdr.level = 0;
        write_struct(&mut self.data, 0, &hdr);
        let cs = csum_data(&self.data[BTRFS_CSUM_SIZE..], csum_type);
        self.data[..BTRFS_CSUM_SIZE].copy_from_slice(&cs);
        self.data
    }
}

fn extent_item_payload(owner: u64) -> Vec<u8> {
    let item = btrfs_extent_item {
        refs: 1,
        generation: 1,
        flags: BTRFS_EXTENT_FLAG_TREE_BLOCK,
    };
    let info = btrfs_tree_block_info {
        key: btrfs_disk_key::new(0, BtrfsItemType::MIN, 0),
        level: 0,
    };
    let iref = btrfs_extent_inline_ref {
        r#type: BtrfsItemType::TREE_BLOCK_REF as u8,
        offset: owner,
    };
    let mut out = Vec::new();
    out.extend_from_slice(struct_bytes(&item));
    out.extend_from_slice(struct_bytes(&info));
    out.extend_from_slice(struct_bytes(&iref));
    out
}

/// Placement of the handcrafted first blocks; mkfs uses the fixed layout,
/// the converter aims everything at a free range of the source.
#[derive(Clone, Copy)]
pub struct BootstrapLayout {
    pub sb_offset: u64,
    pub sys_chunk_start: u64,
    pub meta_chunk_start: u64,
}

impl Default for BootstrapLayout {
    fn default() -> BootstrapLayout {
        BootstrapLayout {
            sb_offset: BTRFS_SUPER_INFO_OFFSET,
            sys_chunk_start: SYSTEM_CHUNK_START,
            meta_chunk_start: METADATA_CHUNK_START,
        }
    }
}

pub const BOOTSTRAP_BYTES: u64 = SYSTEM_CHUNK_SIZE + METADATA_CHUNK_SIZE;

/// Lay the fixed trees onto the first device, then run one transaction to
/// pull in the other devices and stamp the requested profiles.
pub fn make_filesystem(cfg: &MkfsConfig) -> Result<()> {
    if cfg.paths.is_empty() {
        return Err(BtrfsError::InvalidArgument("no devices given".into()));
    }
    let dev = Device::open(&cfg.paths[0], true)?;
    write_bootstrap(&dev, cfg, BootstrapLayout::default())?;
    drop(dev);

    // second phase: regular transactions for the remaining devices
    let mut registry = Registry::new();
    let mut fs = fs::open_fs(
        &mut registry,
        &[cfg.paths[0].as_path()],
        OpenFlags {
            writable: true,
            ..Default::default()
        },
    )?;
    fs.metadata_profile = cfg.metadata_profile;
    fs.data_profile = cfg.data_profile;
    let trans = start_transaction(&mut fs)?;
    for path in &cfg.paths[1..] {
        add_device(&mut fs, &trans, path)?;
    }
    commit_transaction(&mut fs, trans)?;
    Ok(())
}

/// write the six bootstrap tree blocks plus the superblock
pub fn write_bootstrap(dev: &Device, cfg: &MkfsConfig, layout: BootstrapLayout) -> Result<BtrfsFsid> {
    let nodesize = cfg.nodesize;
    let n = nodesize as u64;
    let min_bytes = layout.meta_chunk_start + METADATA_CHUNK_SIZE;
    if dev.total_bytes < min_bytes {
        return Err(BtrfsError::InvalidArgument(format!(
            "device smaller than {min_bytes} bytes"
        )));
    }

    let fsid: BtrfsFsid = *uuid::Uuid::new_v4().as_bytes();
    let chunk_tree_uuid: BtrfsUuid = *uuid::Uuid::new_v4().as_bytes();
    let dev_uuid: BtrfsUuid = *uuid::Uuid::new_v4().as_bytes();

    let chunk_root = layout.sys_chunk_start;
    let tree_root = layout.meta_chunk_start;
    let extent_root = layout.meta_chunk_start + n;
    let dev_root = layout.meta_chunk_start + 2 * n;
    let csum_root = layout.meta_chunk_start + 3 * n;
    let fs_root = layout.meta_chunk_start + 4 * n;

    let dev_item = btrfs_dev_item {
        devid: 1,
        total_bytes: dev.total_bytes,
        bytes_used: SYSTEM_CHUNK_SIZE + METADATA_CHUNK_SIZE,
        io_align: cfg.sectorsize,
        io_width: cfg.sectorsize,
        sector_size: cfg.sectorsize,
        r#type: 0,
        generation: 0,
        start_offset: 0,
        dev_group: 0,
        seek_speed: 0,
        bandwidth: 0,
        uuid: dev_uuid,
        fsid,
    };

    let sys_chunk = btrfs_chunk {
        length: SYSTEM_CHUNK_SIZE,
        owner: BTRFS_EXTENT_TREE_OBJECTID,
        stripe_len: BTRFS_STRIPE_LEN,
        r#type: BTRFS_BLOCK_GROUP_SYSTEM,
        io_align: cfg.sectorsize,
        io_width: cfg.sectorsize,
        sector_size: cfg.sectorsize,
        num_stripes: 1,
        sub_stripes: 1,
    };
    let meta_chunk = btrfs_chunk {
        length: METADATA_CHUNK_SIZE,
        r#type: BTRFS_BLOCK_GROUP_METADATA,
        ..sys_chunk
    };
    let stripe = |physical| btrfs_stripe {
        devid: 1,
        offset: physical,
        dev_uuid,
    };

    // chunk tree: the device table plus the two bootstrap chunks
    let mut chunk_leaf = LeafBuilder::new(nodesize);
    chunk_leaf.add(
        btrfs_disk_key::new(BTRFS_DEV_ITEMS_OBJECTID, BtrfsItemType::DEV_ITEM, 1),
        struct_bytes(&dev_item),
    );
    let mut payload = struct_bytes(&sys_chunk).to_vec();
    payload.extend_from_slice(struct_bytes(&stripe(layout.sys_chunk_start)));
    chunk_leaf.add(
        btrfs_disk_key::new(
            BTRFS_FIRST_CHUNK_TREE_OBJECTID,
            BtrfsItemType::CHUNK_ITEM,
            layout.sys_chunk_start,
        ),
        &payload,
    );
    let mut payload = struct_bytes(&meta_chunk).to_vec();
    payload.extend_from_slice(struct_bytes(&stripe(layout.meta_chunk_start)));
    chunk_leaf.add(
        btrfs_disk_key::new(
            BTRFS_FIRST_CHUNK_TREE_OBJECTID,
            BtrfsItemType::CHUNK_ITEM,
            layout.meta_chunk_start,
        ),
        &payload,
    );

    // root tree: one root item per fixed tree
    let mut root_leaf = LeafBuilder::new(nodesize);
    for (objectid, bytenr) in [
        (BTRFS_EXTENT_TREE_OBJECTID, extent_root),
        (BTRFS_DEV_TREE_OBJECTID, dev_root),
        (BTRFS_FS_TREE_OBJECTID, fs_root),
        (BTRFS_CSUM_TREE_OBJECTID, csum_root),
    ] {
        let item = crate::root_tree::default_root_item(bytenr, 0, 1);
        root_leaf.add(
            btrfs_disk_key::new(objectid, BtrfsItemType::ROOT_ITEM, 0),
            struct_bytes(&item),
        );
    }

    // extent tree: every bootstrap block plus both block groups
    let mut extent_leaf = LeafBuilder::new(nodesize);
    extent_leaf.add(
        btrfs_disk_key::new(chunk_root, BtrfsItemType::EXTENT_ITEM, n),
        &extent_item_payload(BTRFS_CHUNK_TREE_OBJECTID),
    );
    let sys_bg = btrfs_block_group_item {
        used: n,
        chunk_objectid: BTRFS_FIRST_CHUNK_TREE_OBJECTID,
        flags: BTRFS_BLOCK_GROUP_SYSTEM,
    };
    extent_leaf.add(
        btrfs_disk_key::new(
            layout.sys_chunk_start,
            BtrfsItemType::BLOCK_GROUP_ITEM,
            SYSTEM_CHUNK_SIZE,
        ),
        struct_bytes(&sys_bg),
    );
    for (bytenr, owner) in [
        (tree_root, BTRFS_ROOT_TREE_OBJECTID),
        (extent_root, BTRFS_EXTENT_TREE_OBJECTID),
        (dev_root, BTRFS_DEV_TREE_OBJECTID),
        (csum_root, BTRFS_CSUM_TREE_OBJECTID),
        (fs_root, BTRFS_FS_TREE_OBJECTID),
    ] {
        if bytenr == tree_root {
            let meta_bg = btrfs_block_group_item {
                used: 5 * n,
                chunk_objectid: BTRFS_FIRST_CHUNK_TREE_OBJECTID,
                flags: BTRFS_BLOCK_GROUP_METADATA,
            };
            // block group key sorts between the chunk start extent and the
            // following blocks only when inserted here
            extent_leaf.add(
                btrfs_disk_key::new(bytenr, BtrfsItemType::EXTENT_ITEM, n),
                &extent_item_payload(owner),
            );
            extent_leaf.add(
                btrfs_disk_key::new(
                    layout.meta_chunk_start,
                    BtrfsItemType::BLOCK_GROUP_ITEM,
                    METADATA_CHUNK_SIZE,
                ),
                struct_bytes(&meta_bg),
            );
        } else {
            extent_leaf.add(
                btrfs_disk_key::new(bytenr, BtrfsItemType::EXTENT_ITEM, n),
                &extent_item_payload(owner),
            );
        }
    }

    // device tree: the physical extents behind the two chunks
    let mut dev_leaf = LeafBuilder::new(nodesize);
    for (physical, length) in [
        (layout.sys_chunk_start, SYSTEM_CHUNK_SIZE),
        (layout.meta_chunk_start, METADATA_CHUNK_SIZE),
    ] {
        let de = btrfs_dev_extent {
            chunk_tree: BTRFS_CHUNK_TREE_OBJECTID,
            chunk_objectid: BTRFS_FIRST_CHUNK_TREE_OBJECTID,
            chunk_offset: physical,
            length,
            chunk_tree_uuid,
        };
        dev_leaf.add(
            btrfs_disk_key::new(1, BtrfsItemType::DEV_EXTENT, physical),
            struct_bytes(&de),
        );
    }

    let csum_leaf = LeafBuilder::new(nodesize);

    // fs tree: the root directory
    let mut fs_leaf = LeafBuilder::new(nodesize);
    let mut root_dir = crate::inode::new_inode_item(0o40755, 0, 1);
    root_dir.nbytes = n;
    fs_leaf.add(
        btrfs_disk_key::new(BTRFS_FIRST_FREE_OBJECTID, BtrfsItemType::INODE_ITEM, 0),
        struct_bytes(&root_dir),
    );
    let iref = btrfs_inode_ref {
        index: 0,
        name_len: 2,
    };
    let mut payload = struct_bytes(&iref).to_vec();
    payload.extend_from_slice(b"..");
    fs_leaf.add(
        btrfs_disk_key::new(
            BTRFS_FIRST_FREE_OBJECTID,
            BtrfsItemType::INODE_REF,
            BTRFS_FIRST_FREE_OBJECTID,
        ),
        &payload,
    );

    for (builder, bytenr, owner) in [
        (chunk_leaf, chunk_root, BTRFS_CHUNK_TREE_OBJECTID),
        (root_leaf, tree_root, BTRFS_ROOT_TREE_OBJECTID),
        (extent_leaf, extent_root, BTRFS_EXTENT_TREE_OBJECTID),
        (dev_leaf, dev_root, BTRFS_DEV_TREE_OBJECTID),
        (csum_leaf, csum_root, BTRFS_CSUM_TREE_OBJECTID),
        (fs_leaf, fs_root, BTRFS_FS_TREE_OBJECTID),
    ] {
        let block = builder.finish(bytenr, owner, &fsid, &chunk_tree_uuid, cfg.csum_type);
        // bootstrap chunks are identity mapped
        dev.write_all_at(&block, bytenr)?;
    }

    let mut sb: btrfs_super_block = read_struct(&[0_u8; BTRFS_SUPER_INFO_SIZE], 0);
    sb.fsid = fsid;
    sb.metadata_uuid = fsid;
    sb.magic = BTRFS_MAGIC;
    sb.generation = 1;
    sb.root = tree_root;
    sb.chunk_root = chunk_root;
    sb.total_bytes = dev.total_bytes;
    sb.bytes_used = 6 * n;
    sb.root_dir_object_id = BTRFS_ROOT_TREE_DIR_OBJECTID;
    sb.num_devices = 1;
    sb.sectorsize = cfg.sectorsize;
    sb.nodesize = nodesize;
    sb.__unused_leafsize = nodesize;
    sb.stripesize = cfg.sectorsize;
    sb.chunk_root_generation = 1;
    sb.incompat_flags = BTRFS_FEATURE_INCOMPAT_MIXED_BACKREF;
    sb.csum_type = cfg.csum_type;
    sb.dev_item = dev_item;
    let label = cfg.label.as_bytes();
    sb.label[..label.len().min(BTRFS_LABEL_SIZE)]
        .copy_from_slice(&label[..label.len().min(BTRFS_LABEL_SIZE)]);
    let key = btrfs_disk_key::new(
        BTRFS_FIRST_CHUNK_TREE_OBJECTID,
        BtrfsItemType::CHUNK_ITEM,
        layout.sys_chunk_start,
    );
    superblock::append_sys_chunk(&mut sb, &key, &sys_chunk, &[stripe(layout.sys_chunk_start)])?;
    if layout.sb_offset == BTRFS_SUPER_INFO_OFFSET {
        superblock::write_dev_supers(dev, &sb)?;
    } else {
        // provisional placement, swapped into the canonical offset later
        superblock::write_one_super(dev, &sb, layout.sb_offset)?;
        dev.flush()?;
    }
    debug!("wrote bootstrap filesystem on {}", dev.path.display());
    Ok(fsid)
}

/// grow the pool by one blank device
pub fn add_device(fs: &mut FsInfo, trans: &Transaction, path: &Path) -> Result<()> {
    let mut dev = Device::open(path, true)?;
    let devid = fs.dev_items.iter().map(|(id, _)| *id).max().unwrap_or(0) + 1;
    let dev_uuid: BtrfsUuid = *uuid::Uuid::new_v4().as_bytes();
    dev.devid = devid;
    dev.dev_uuid = dev_uuid;

    let item = btrfs_dev_item {
        devid,
        total_bytes: dev.total_bytes,
        bytes_used: 0,
        io_align: fs.sectorsize(),
        io_width: fs.sectorsize(),
        sector_size: fs.sectorsize(),
        r#type: 0,
        generation: 0,
        start_offset: 0,
        dev_group: 0,
        seek_speed: 0,
        bandwidth: 0,
        uuid: dev_uuid,
        fsid: fs.fsid,
    };
    let key = btrfs_disk_key::new(BTRFS_DEV_ITEMS_OBJECTID, BtrfsItemType::DEV_ITEM, devid);
    let mut chunk_root = fs.root(BTRFS_CHUNK_TREE_OBJECTID)?;
    crate::ctree::insert_item(fs, trans, &mut chunk_root, &key, struct_bytes(&item))?;
    fs.set_root(chunk_root);

    fs.sb.num_devices += 1;
    fs.sb.total_bytes += dev.total_bytes;
    fs.dev_items.push((devid, item));
    fs.devices.insert(dev);
    debug!("added device {} as devid {devid}", path.display());
    Ok(())
}
