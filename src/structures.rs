#![allow(non_camel_case_types)]

//! On-disk format definitions. Every struct here mirrors the little-endian
//! disk layout exactly; sizes are pinned by static assertions at the bottom.

pub const BTRFS_CSUM_SIZE: usize = 32;
pub const BTRFS_FSID_SIZE: usize = 16;
pub const BTRFS_UUID_SIZE: usize = 16;
pub const BTRFS_SUPER_INFO_OFFSET: u64 = 65536;
pub const BTRFS_SUPER_INFO_SIZE: usize = 4096;

pub const BTRFS_SUPER_MIRROR_MAX: usize = 3;
pub const BTRFS_SUPER_MIRROR_SHIFT: usize = 12;

pub const BTRFS_SYSTEM_CHUNK_ARRAY_SIZE: usize = 2048;
pub const BTRFS_LABEL_SIZE: usize = 256;
pub const BTRFS_NAME_LEN: usize = 255;

/// `_BHRfS_M`
pub const BTRFS_MAGIC: u64 = 0x4D5F53665248425F;
/// `!BHRfS_M`, written by the converter before the final super swap
pub const BTRFS_MAGIC_TEMPORARY: u64 = 0x4D5F536652484221;
pub const BTRFS_NUM_BACKUP_ROOTS: usize = 4;

pub const BTRFS_MAX_LEVEL: usize = 8;
pub const BTRFS_STRIPE_LEN: u64 = 64 * 1024;

/// first 1MiB of every device is never allocated
pub const BTRFS_DEVICE_RANGE_RESERVED: u64 = 1024 * 1024;

pub const BTRFS_ROOT_TREE_OBJECTID: u64 = 1;
pub const BTRFS_EXTENT_TREE_OBJECTID: u64 = 2;
pub const BTRFS_CHUNK_TREE_OBJECTID: u64 = 3;
pub const BTRFS_DEV_TREE_OBJECTID: u64 = 4;
pub const BTRFS_FS_TREE_OBJECTID: u64 = 5;
pub const BTRFS_ROOT_TREE_DIR_OBJECTID: u64 = 6;
pub const BTRFS_CSUM_TREE_OBJECTID: u64 = 7;
pub const BTRFS_QUOTA_TREE_OBJECTID: u64 = 8;
pub const BTRFS_UUID_TREE_OBJECTID: u64 = 9;
pub const BTRFS_FREE_SPACE_TREE_OBJECTID: u64 = 10;

pub const BTRFS_DEV_STATS_OBJECTID: u64 = 0;
pub const BTRFS_BALANCE_OBJECTID: u64 = -4_i64 as u64;
pub const BTRFS_ORPHAN_OBJECTID: u64 = -5_i64 as u64;
pub const BTRFS_TREE_LOG_OBJECTID: u64 = -6_i64 as u64;
pub const BTRFS_TREE_LOG_FIXUP_OBJECTID: u64 = -7_i64 as u64;
pub const BTRFS_TREE_RELOC_OBJECTID: u64 = -8_i64 as u64;
pub const BTRFS_DATA_RELOC_TREE_OBJECTID: u64 = -9_i64 as u64;
pub const BTRFS_EXTENT_CSUM_OBJECTID: u64 = -10_i64 as u64;
pub const BTRFS_FREE_SPACE_OBJECTID: u64 = -11_i64 as u64;
pub const BTRFS_FREE_INO_OBJECTID: u64 = -12_i64 as u64;
pub const BTRFS_MULTIPLE_OBJECTIDS: u64 = -255_i64 as u64;

pub const BTRFS_FIRST_FREE_OBJECTID: u64 = 256;
pub const BTRFS_LAST_FREE_OBJECTID: u64 = -256_i64 as u64;
pub const BTRFS_FIRST_CHUNK_TREE_OBJECTID: u64 = 256;
pub const BTRFS_DEV_ITEMS_OBJECTID: u64 = 1;

/// raid_map sentinels; data stripes sort before P which sorts before Q
pub const BTRFS_RAID5_P_STRIPE: u64 = u64::MAX - 1;
pub const BTRFS_RAID6_Q_STRIPE: u64 = u64::MAX;

pub const BTRFS_BLOCK_GROUP_DATA: u64 = 1 << 0;
pub const BTRFS_BLOCK_GROUP_SYSTEM: u64 = 1 << 1;
pub const BTRFS_BLOCK_GROUP_METADATA: u64 = 1 << 2;
pub const BTRFS_BLOCK_GROUP_RAID0: u64 = 1 << 3;
pub const BTRFS_BLOCK_GROUP_RAID1: u64 = 1 << 4;
pub const BTRFS_BLOCK_GROUP_DUP: u64 = 1 << 5;
pub const BTRFS_BLOCK_GROUP_RAID10: u64 = 1 << 6;
pub const BTRFS_BLOCK_GROUP_RAID5: u64 = 1 << 7;
pub const BTRFS_BLOCK_GROUP_RAID6: u64 = 1 << 8;
pub const BTRFS_BLOCK_GROUP_PROFILE_MASK: u64 = BTRFS_BLOCK_GROUP_RAID0
    | BTRFS_BLOCK_GROUP_RAID1
    | BTRFS_BLOCK_GROUP_DUP
    | BTRFS_BLOCK_GROUP_RAID10
    | BTRFS_BLOCK_GROUP_RAID5
    | BTRFS_BLOCK_GROUP_RAID6;
pub const BTRFS_BLOCK_GROUP_TYPE_MASK: u64 =
    BTRFS_BLOCK_GROUP_DATA | BTRFS_BLOCK_GROUP_SYSTEM | BTRFS_BLOCK_GROUP_METADATA;

pub const BTRFS_HEADER_FLAG_WRITTEN: u64 = 1 << 0;
pub const BTRFS_HEADER_FLAG_RELOC: u64 = 1 << 1;
pub const BTRFS_SUPER_FLAG_SEEDING: u64 = 1 << 32;
pub const BTRFS_SUPER_FLAG_METADUMP: u64 = 1 << 33;

pub const BTRFS_EXTENT_FLAG_DATA: u64 = 1 << 0;
pub const BTRFS_EXTENT_FLAG_TREE_BLOCK: u64 = 1 << 1;
pub const BTRFS_BLOCK_FLAG_FULL_BACKREF: u64 = 1 << 8;

pub const BTRFS_INODE_NODATASUM: u64 = 1 << 0;
pub const BTRFS_INODE_NODATACOW: u64 = 1 << 1;
pub const BTRFS_INODE_READONLY: u64 = 1 << 2;
pub const BTRFS_INODE_NOCOMPRESS: u64 = 1 << 3;
pub const BTRFS_INODE_PREALLOC: u64 = 1 << 4;
pub const BTRFS_INODE_SYNC: u64 = 1 << 5;
pub const BTRFS_INODE_IMMUTABLE: u64 = 1 << 6;
pub const BTRFS_INODE_APPEND: u64 = 1 << 7;
pub const BTRFS_INODE_NODUMP: u64 = 1 << 8;
pub const BTRFS_INODE_NOATIME: u64 = 1 << 9;
pub const BTRFS_INODE_DIRSYNC: u64 = 1 << 10;
pub const BTRFS_INODE_COMPRESS: u64 = 1 << 11;

pub const BTRFS_ROOT_SUBVOL_RDONLY: u64 = 1 << 0;

pub const BTRFS_FT_UNKNOWN: u8 = 0;
pub const BTRFS_FT_REG_FILE: u8 = 1;
pub const BTRFS_FT_DIR: u8 = 2;
pub const BTRFS_FT_CHRDEV: u8 = 3;
pub const BTRFS_FT_BLKDEV: u8 = 4;
pub const BTRFS_FT_FIFO: u8 = 5;
pub const BTRFS_FT_SOCK: u8 = 6;
pub const BTRFS_FT_SYMLINK: u8 = 7;
pub const BTRFS_FT_XATTR: u8 = 8;

pub const BTRFS_FILE_EXTENT_INLINE: u8 = 0;
pub const BTRFS_FILE_EXTENT_REG: u8 = 1;
pub const BTRFS_FILE_EXTENT_PREALLOC: u8 = 2;

pub const BTRFS_COMPRESS_NONE: u8 = 0;
pub const BTRFS_COMPRESS_ZLIB: u8 = 1;
pub const BTRFS_COMPRESS_LZO: u8 = 2;
pub const BTRFS_COMPRESS_ZSTD: u8 = 3;

/// superblock copy offsets: 64KiB, 64MiB, 256GiB
pub fn btrfs_sb_offset(mirror: usize) -> u64 {
    let start = 16 * 1024_u64;
    if mirror > 0 {
        start << (BTRFS_SUPER_MIRROR_SHIFT * mirror)
    } else {
        BTRFS_SUPER_INFO_OFFSET
    }
}

/*
  repr(u16) will not work on big-endian architectures. We could work around this with target_endian confg so that we declare these values with swapped bytes on big-endian systems. But I'm not going to write code I'm not going to test.
*/
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(dead_code, non_camel_case_types)]
pub enum BtrfsCsumType {
    CRC32 = 0,
    XXHASH = 1,
    SHA256 = 2,
    BLAKE2 = 3,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[allow(dead_code, non_camel_case_types)]
pub enum BtrfsItemType {
    MIN = 0x00, //to facilitate searching through any possible byte value
    INODE_ITEM = 0x01,
    INODE_REF = 0x0c,
    INODE_EXTREF = 0x0d,
    XATTR_ITEM = 0x18,
    VERITY_DESC_ITEM = 0x24,
    VERITY_MERKLE_ITEM = 0x25,
    ORPHAN_ITEM = 0x30,
    DIR_LOG_ITEM = 0x3c,
    DIR_LOG_INDEX = 0x48,
    DIR_ITEM = 0x54,
    DIR_INDEX = 0x60,
    EXTENT_DATA = 0x6c,
    CSUM_ITEM = 0x78,
    EXTENT_CSUM = 0x80,
    ROOT_ITEM = 0x84,
    ROOT_BACKREF = 0x90,
    ROOT_REF = 0x9c,
    EXTENT_ITEM = 0xa8,
    METADATA_ITEM = 0xa9,
    TREE_BLOCK_REF = 0xb0,
    EXTENT_DATA_REF = 0xb2,
    EXTENT_REF_V0 = 0xb4,
    SHARED_BLOCK_REF = 0xb6,
    SHARED_DATA_REF = 0xb8,
    BLOCK_GROUP_ITEM = 0xc0,
    FREE_SPACE_INFO = 0xc6,
    FREE_SPACE_EXTENT = 0xc7,
    FREE_SPACE_BITMAP = 0xc8,
    DEV_EXTENT = 0xcc,
    DEV_ITEM = 0xd8,
    CHUNK_ITEM = 0xe4,
    QGROUP_STATUS = 0xf0,
    QGROUP_INFO = 0xf2,
    QGROUP_LIMIT = 0xf4,
    QGROUP_RELATION = 0xf6,
    TEMPORARY_ITEM = 0xf8,
    PERSISTENT_ITEM = 0xf9,
    DEV_REPLACE = 0xfa,
    UUID_KEY_SUBVOL = 0xfb,
    UUID_KEY_RECEIVED_SUBVOL = 0xfc,
    STRING_ITEM = 0xfd,
    MAX = 0xff, //to facilitate searching through any possible byte value
}

impl BtrfsItemType {
    /// leaves unknown byte values at the nearest known sentinel-free meaning;
    /// print paths use this instead of transmuting untrusted bytes
    pub fn from_byte(b: u8) -> Option<BtrfsItemType> {
        use BtrfsItemType::*;
        let all = [
            MIN,
            INODE_ITEM,
            INODE_REF,
            INODE_EXTREF,
            XATTR_ITEM,
            VERITY_DESC_ITEM,
            VERITY_MERKLE_ITEM,
            ORPHAN_ITEM,
            DIR_LOG_ITEM,
            DIR_LOG_INDEX,
            DIR_ITEM,
            DIR_INDEX,
            EXTENT_DATA,
            CSUM_ITEM,
            EXTENT_CSUM,
            ROOT_ITEM,
            ROOT_BACKREF,
            ROOT_REF,
            EXTENT_ITEM,
            METADATA_ITEM,
            TREE_BLOCK_REF,
            EXTENT_DATA_REF,
            EXTENT_REF_V0,
            SHARED_BLOCK_REF,
            SHARED_DATA_REF,
            BLOCK_GROUP_ITEM,
            FREE_SPACE_INFO,
            FREE_SPACE_EXTENT,
            FREE_SPACE_BITMAP,
            DEV_EXTENT,
            DEV_ITEM,
            CHUNK_ITEM,
            QGROUP_STATUS,
            QGROUP_INFO,
            QGROUP_LIMIT,
            QGROUP_RELATION,
            TEMPORARY_ITEM,
            PERSISTENT_ITEM,
            DEV_REPLACE,
            UUID_KEY_SUBVOL,
            UUID_KEY_RECEIVED_SUBVOL,
            STRING_ITEM,
            MAX,
        ];
        all.into_iter().find(|t| *t as u8 == b)
    }
}

/// on-disc format is little-endian
pub type LE16 = u16;
pub type LE32 = u32;
pub type LE64 = u64;

pub type BtrfsCsum = [u8; BTRFS_CSUM_SIZE];
pub type BtrfsUuid = [u8; BTRFS_UUID_SIZE];
pub type BtrfsFsid = [u8; BTRFS_FSID_SIZE];

/// Copy a struct out of a byte buffer at `off`, unaligned.
pub fn read_struct<T: Copy>(buf: &[u8], off: usize) -> T {
    assert!(off + std::mem::size_of::<T>() <= buf.len());
    unsafe { std::ptr::read_unaligned(buf.as_ptr().add(off) as *const T) }
}

/// Copy a struct into a byte buffer at `off`, unaligned.
pub fn write_struct<T: Copy>(buf: &mut [u8], off: usize, val: &T) {
    assert!(off + std::mem::size_of::<T>() <= buf.len());
    unsafe {
        std::ptr::copy_nonoverlapping(
            val as *const T as *const u8,
            buf.as_mut_ptr().add(off),
            std::mem::size_of::<T>(),
        )
    }
}

pub fn struct_bytes<T: Copy>(val: &T) -> &[u8] {
    unsafe { std::slice::from_raw_parts(val as *const T as *const u8, std::mem::size_of::<T>()) }
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_super_block {
    pub csum: BtrfsCsum,
    pub fsid: BtrfsFsid,
    pub bytenr: LE64,
    pub flags: LE64,
    pub magic: LE64,
    pub generation: LE64,
    pub root: LE64,
    pub chunk_root: LE64,
    pub log_root: LE64,
    pub __unused_log_root_transid: LE64,
    pub total_bytes: LE64,
    pub bytes_used: LE64,
    pub root_dir_object_id: LE64,
    pub num_devices: LE64,
    pub sectorsize: LE32,
    pub nodesize: LE32,
    pub __unused_leafsize: LE32,
    pub stripesize: LE32,
    pub sys_chunk_array_size: LE32,
    pub chunk_root_generation: LE64,
    pub compat_flags: LE64,
    pub compat_ro_flags: LE64,
    pub incompat_flags: LE64,
    pub csum_type: BtrfsCsumType,
    pub root_level: u8,
    pub chunk_root_level: u8,
    pub log_root_level: u8,
    pub dev_item: btrfs_dev_item,
    pub label: [u8; BTRFS_LABEL_SIZE],
    pub cache_generation: LE64,
    pub uuid_tree_generation: LE64,
    pub metadata_uuid: BtrfsFsid, //fsid vs uuid as per ctree.h
    pub nr_global_roots: LE64,
    pub reserved: [LE64; 27],
    pub sys_chunk_array: [u8; BTRFS_SYSTEM_CHUNK_ARRAY_SIZE],
    pub super_roots: [btrfs_root_backup; BTRFS_NUM_BACKUP_ROOTS],
    pub padding: [u8; 565],
}
static_assertions::assert_eq_size!([u8; BTRFS_SUPER_INFO_SIZE], btrfs_super_block);

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_root_backup {
    pub tree_root: LE64,
    pub tree_root_gen: LE64,

    pub chunk_root: LE64,
    pub chunk_root_gen: LE64,

    pub extent_root: LE64,
    pub extent_root_gen: LE64,

    pub fs_root: LE64,
    pub fs_root_gen: LE64,

    pub dev_root: LE64,
    pub dev_root_gen: LE64,

    pub csum_root: LE64,
    pub csum_root_gen: LE64,

    pub total_bytes: LE64,
    pub bytes_used: LE64,
    pub num_devices: LE64,

    pub unused_64: [LE64; 4],

    pub tree_root_level: u8,
    pub chunk_root_level: u8,
    pub extent_root_level: u8,
    pub fs_root_level: u8,
    pub dev_root_level: u8,
    pub csum_root_level: u8,
    pub unused_8: [u8; 10],
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_dev_item {
    pub devid: LE64,
    pub total_bytes: LE64,
    pub bytes_used: LE64,
    pub io_align: LE32,
    pub io_width: LE32,
    pub sector_size: LE32,
    pub r#type: LE64,
    pub generation: LE64,
    pub start_offset: LE64,
    pub dev_group: LE32,
    pub seek_speed: u8,
    pub bandwidth: u8,
    pub uuid: BtrfsUuid,
    pub fsid: BtrfsFsid,
}

/* header is stored at the start of every tree node */
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_header {
    pub csum: BtrfsCsum,
    pub fsid: BtrfsFsid,
    pub bytenr: LE64,
    pub flags: LE64,

    pub chunk_tree_uuid: BtrfsUuid,
    pub generation: LE64,
    pub owner: LE64,
    pub nritems: LE32,
    pub level: u8,
}

pub const BTRFS_HEADER_SIZE: usize = 101;
static_assertions::assert_eq_size!([u8; BTRFS_HEADER_SIZE], btrfs_header);

/// usable item/data bytes in one leaf or node
pub fn btrfs_leaf_data_size(nodesize: u32) -> usize {
    nodesize as usize - BTRFS_HEADER_SIZE
}

/* leaf nodes are full of btrfs_items, and data */
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_item {
    pub key: btrfs_disk_key,
    pub offset: LE32, //counting starts at end of btrfs_header
    pub size: LE32,
}

/* non-leaf nodes are full of btrfs_key_ptrs */
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_key_ptr {
    pub key: btrfs_disk_key,
    pub blockptr: LE64,
    pub generation: LE64,
}

#[repr(C, packed)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct btrfs_disk_key {
    pub objectid: LE64,
    pub item_type: BtrfsItemType,
    pub offset: LE64,
}

impl btrfs_disk_key {
    pub fn new(objectid: u64, item_type: BtrfsItemType, offset: u64) -> Self {
        btrfs_disk_key {
            objectid,
            item_type,
            offset,
        }
    }
}

impl std::fmt::Debug for btrfs_disk_key {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let objectid = self.objectid;
        let item_type = self.item_type;
        let offset = self.offset;
        write!(f, "({} {:?} {})", objectid, item_type, offset)
    }
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_stripe {
    pub devid: LE64,
    pub offset: LE64,
    pub dev_uuid: BtrfsUuid,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_chunk {
    pub length: LE64,
    pub owner: LE64,
    pub stripe_len: LE64,
    pub r#type: LE64,
    pub io_align: LE32,
    pub io_width: LE32,
    pub sector_size: LE32,
    pub num_stripes: LE16,
    pub sub_stripes: LE16,
    /* num_stripes btrfs_stripes follow */
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_timespec {
    pub sec: LE64,
    pub nsec: LE32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_inode_item {
    pub generation: LE64,
    pub transid: LE64,
    pub size: LE64,
    pub nbytes: LE64,
    pub block_group: LE64,
    pub nlink: LE32,
    pub uid: LE32,
    pub gid: LE32,
    pub mode: LE32,
    pub rdev: LE64,
    pub flags: LE64,

    pub sequence: LE64,
    pub __reserved: [LE64; 4],
    pub atime: btrfs_timespec,
    pub ctime: btrfs_timespec,
    pub mtime: btrfs_timespec,
    pub otime: btrfs_timespec,
}

/* there was an older version of this structure which I'm ignoring */
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_root_item {
    pub inode: btrfs_inode_item,
    pub generation: LE64,
    pub root_dirid: LE64,
    pub bytenr: LE64,
    pub byte_limit: LE64,
    pub bytes_used: LE64,
    pub last_snapshot: LE64,
    pub flags: LE64,
    pub refs: LE32,
    pub drop_progress: btrfs_disk_key,
    pub drop_level: u8,
    pub level: u8,
    pub generation_v2: LE64,
    pub uuid: BtrfsUuid,
    pub parent_uuid: BtrfsUuid,
    pub received_uuid: BtrfsUuid,
    pub ctransid: LE64,
    pub otransid: LE64,
    pub stransid: LE64,
    pub rtransid: LE64,
    pub ctime: btrfs_timespec,
    pub otime: btrfs_timespec,
    pub stime: btrfs_timespec,
    pub rtime: btrfs_timespec,
    pub global_tree_id: LE64,
    pub __reserved: [LE64; 7],
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_root_ref {
    pub dirid: LE64,
    pub sequence: LE64,
    pub name_len: LE16,
    /* the name follows here */
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_extent_item {
    pub refs: LE64,
    pub generation: LE64,
    pub flags: LE64,
}

/* follows btrfs_extent_item when the extent is a tree block */
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_tree_block_info {
    pub key: btrfs_disk_key,
    pub level: u8,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_extent_inline_ref {
    pub r#type: u8,
    pub offset: LE64,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_extent_data_ref {
    pub root: LE64,
    pub objectid: LE64,
    pub offset: LE64,
    pub count: LE32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_shared_data_ref {
    pub count: LE32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_file_extent_item {
    pub generation: LE64,
    /// uncompressed size of the full extent
    pub ram_bytes: LE64,
    pub compression: u8,
    pub encryption: u8,
    pub other_encoding: LE16,
    pub r#type: u8,
    /* inline data stops here, the rest only applies to REG/PREALLOC */
    pub disk_bytenr: LE64,
    pub disk_num_bytes: LE64,
    pub offset: LE64,
    pub num_bytes: LE64,
}

/// bytes of a file_extent_item before the inline payload
pub const BTRFS_FILE_EXTENT_INLINE_DATA_START: usize = 21;

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_dir_item {
    pub location: btrfs_disk_key,
    pub transid: LE64,
    pub data_len: LE16,
    pub name_len: LE16,
    pub r#type: u8,
    /* name (and xattr data) follow here */
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_inode_ref {
    pub index: LE64,
    pub name_len: LE16,
    /* the name follows here */
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_inode_extref {
    pub parent_objectid: LE64,
    pub index: LE64,
    pub name_len: LE16,
    /* the name follows here */
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_dev_extent {
    pub chunk_tree: LE64,
    pub chunk_objectid: LE64,
    pub chunk_offset: LE64,
    pub length: LE64,
    pub chunk_tree_uuid: BtrfsUuid,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_block_group_item {
    pub used: LE64,
    pub chunk_objectid: LE64,
    pub flags: LE64,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_free_space_info {
    pub extent_count: LE32,
    pub flags: LE32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_qgroup_status_item {
    pub version: LE64,
    pub generation: LE64,
    pub flags: LE64,
    pub rescan: LE64,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_qgroup_info_item {
    pub generation: LE64,
    pub referenced: LE64,
    pub referenced_compressed: LE64,
    pub exclusive: LE64,
    pub exclusive_compressed: LE64,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_qgroup_limit_item {
    pub flags: LE64,
    pub max_referenced: LE64,
    pub max_exclusive: LE64,
    pub rsv_referenced: LE64,
    pub rsv_exclusive: LE64,
}

static_assertions::assert_eq_size!([u8; 17], btrfs_disk_key);
static_assertions::assert_eq_size!([u8; 25], btrfs_item);
static_assertions::assert_eq_size!([u8; 33], btrfs_key_ptr);
static_assertions::assert_eq_size!([u8; 48], btrfs_chunk);
static_assertions::assert_eq_size!([u8; 32], btrfs_stripe);
static_assertions::assert_eq_size!([u8; 160], btrfs_inode_item);
static_assertions::assert_eq_size!([u8; 439], btrfs_root_item);
static_assertions::assert_eq_size!([u8; 24], btrfs_extent_item);
static_assertions::assert_eq_size!([u8; 18], btrfs_tree_block_info);
static_assertions::assert_eq_size!([u8; 9], btrfs_extent_inline_ref);
static_assertions::assert_eq_size!([u8; 28], btrfs_extent_data_ref);
static_assertions::assert_eq_size!([u8; 53], btrfs_file_extent_item);
static_assertions::assert_eq_size!([u8; 30], btrfs_dir_item);
static_assertions::assert_eq_size!([u8; 48], btrfs_dev_extent);
static_assertions::assert_eq_size!([u8; 24], btrfs_block_group_item);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sb_offsets() {
        assert_eq!(btrfs_sb_offset(0), 64 * 1024);
        assert_eq!(btrfs_sb_offset(1), 64 * 1024 * 1024);
        assert_eq!(btrfs_sb_offset(2), 256 * 1024 * 1024 * 1024);
    }

    #[test]
    fn struct_round_trip() {
        let mut buf = vec![0_u8; 64];
        let key = btrfs_disk_key::new(256, BtrfsItemType::INODE_ITEM, 0);
        write_struct(&mut buf, 7, &key);
        let back: btrfs_disk_key = read_struct(&buf, 7);
        assert_eq!(back, key);
    }

    #[test]
    fn item_type_order() {
        assert!(BtrfsItemType::INODE_ITEM < BtrfsItemType::DIR_ITEM);
        assert!(BtrfsItemType::DIR_ITEM < BtrfsItemType::DIR_INDEX);
        assert!(BtrfsItemType::EXTENT_ITEM < BtrfsItemType::METADATA_ITEM);
        assert_eq!(BtrfsItemType::from_byte(0xe4), Some(BtrfsItemType::CHUNK_ITEM));
        assert_eq!(BtrfsItemType::from_byte(0x02), None);
    }
}
