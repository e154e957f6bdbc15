use crate::csum::csum_data;
use crate::device::{Device, DeviceSet};
use crate::error::{BtrfsError, Result};
use crate::structures::*;

use log::{debug, warn};
use std::io::Read;

/// btrfsprogs does quite a lot of work when opening a btrfs filesystem.
/// It uses libblkid to scan devices and identify those that are part of
/// the same filesystem then performs a lot of checks on the validity of
/// the superblock. We keep the checks and require the user to provide the
/// device list.
#[derive(Clone, Copy, Default)]
pub struct SbReadFlags {
    /// accept the `!BHRfS_M` magic the converter leaves before the swap
    pub temporary: bool,
    /// tolerate a bad primary and fall back to mirrors
    pub recover: bool,
}

fn super_from_buf(buf: &[u8; BTRFS_SUPER_INFO_SIZE]) -> btrfs_super_block {
    read_struct(&buf[..], 0)
}

pub fn super_to_buf(sb: &btrfs_super_block) -> [u8; BTRFS_SUPER_INFO_SIZE] {
    let mut buf = [0_u8; BTRFS_SUPER_INFO_SIZE];
    write_struct(&mut buf, 0, sb);
    buf
}

/// magic, checksum, self-bytenr, then the structural field checks
pub fn read_super(dev: &Device, offset: u64, flags: SbReadFlags) -> Result<btrfs_super_block> {
    let mut buf = [0_u8; BTRFS_SUPER_INFO_SIZE];
    dev.read_exact_at(&mut buf, offset)?;
    let sb = super_from_buf(&buf);

    let magic = sb.magic;
    if magic != BTRFS_MAGIC && !(flags.temporary && magic == BTRFS_MAGIC_TEMPORARY) {
        return Err(BtrfsError::structural(offset, "invalid magic in superblock"));
    }
    if csum_data(&buf[BTRFS_CSUM_SIZE..], sb.csum_type) != sb.csum {
        return Err(BtrfsError::BadChecksum {
            bytenr: offset,
            mirror: 0,
        });
    }
    let bytenr = sb.bytenr;
    if bytenr != offset {
        return Err(BtrfsError::structural(
            offset,
            format!("superblock claims bytenr {bytenr}"),
        ));
    }
    check_super(&sb, offset)?;
    Ok(sb)
}

pub fn check_super(sb: &btrfs_super_block, offset: u64) -> Result<()> {
    let fail = |reason: String| Err(BtrfsError::structural(offset, reason));

    if sb.root_level as usize >= BTRFS_MAX_LEVEL {
        return fail(format!("root level {} too large", sb.root_level));
    }
    if sb.chunk_root_level as usize >= BTRFS_MAX_LEVEL {
        return fail(format!("chunk root level {} too large", sb.chunk_root_level));
    }
    if sb.log_root_level as usize >= BTRFS_MAX_LEVEL {
        return fail(format!("log root level {} too large", sb.log_root_level));
    }
    let sectorsize = sb.sectorsize;
    let nodesize = sb.nodesize;
    if sectorsize < 4096 || !sectorsize.is_power_of_two() {
        return fail(format!("invalid sectorsize {sectorsize}"));
    }
    if nodesize < sectorsize || !nodesize.is_power_of_two() {
        return fail(format!("invalid nodesize {nodesize}"));
    }
    let sys_array_size = sb.sys_chunk_array_size;
    if sys_array_size as usize > BTRFS_SYSTEM_CHUNK_ARRAY_SIZE {
        return fail(format!("sys_chunk_array_size {sys_array_size} out of bounds"));
    }
    let root = sb.root;
    let chunk_root = sb.chunk_root;
    if root % nodesize as u64 != 0 || chunk_root % nodesize as u64 != 0 {
        return fail("tree roots unaligned".to_string());
    }
    if sb.dev_item.fsid != sb.metadata_uuid && sb.dev_item.fsid != sb.fsid {
        return fail("dev_item fsid does not match filesystem uuid".to_string());
    }
    Ok(())
}

/// Scan every mirror offset that fits the device. The valid copy with the
/// highest generation wins; copies disagreeing with the primary's identity
/// are rejected outright.
pub fn read_best_super(dev: &Device, flags: SbReadFlags) -> Result<btrfs_super_block> {
    let mut best: Option<btrfs_super_block> = None;
    for mirror in 0..BTRFS_SUPER_MIRROR_MAX {
        let offset = btrfs_sb_offset(mirror);
        if offset + BTRFS_SUPER_INFO_SIZE as u64 > dev.total_bytes {
            break;
        }
        match read_super(dev, offset, flags) {
            Ok(sb) => match &best {
                None => best = Some(sb),
                Some(b) => {
                    if sb.fsid != b.fsid || sb.metadata_uuid != b.metadata_uuid {
                        warn!(
                            "superblock mirror {} on {} belongs to a different filesystem",
                            mirror,
                            dev.path.display()
                        );
                        continue;
                    }
                    let sb_gen = sb.generation;
                    let best_gen = b.generation;
                    if sb_gen > best_gen {
                        debug!("mirror {mirror} has newer generation {sb_gen}");
                        best = Some(sb);
                    }
                }
            },
            Err(e) => {
                if mirror == 0 && !flags.recover {
                    return Err(e);
                }
                debug!("superblock mirror {mirror} rejected: {e}");
            }
        }
    }
    best.ok_or_else(|| BtrfsError::corrupt("no usable superblock on device"))
}

/// Primary first with a flush on either side, then every mirror that fits.
/// The flush pair is what makes the generation bump crash-safe.
pub fn write_dev_supers(dev: &Device, sb: &btrfs_super_block) -> Result<()> {
    dev.flush()?;
    write_one_super(dev, sb, btrfs_sb_offset(0))?;
    dev.flush()?;
    for mirror in 1..BTRFS_SUPER_MIRROR_MAX {
        let offset = btrfs_sb_offset(mirror);
        if offset + BTRFS_SUPER_INFO_SIZE as u64 > dev.total_bytes {
            break;
        }
        write_one_super(dev, sb, offset)?;
    }
    dev.flush()
}

pub fn write_one_super(dev: &Device, sb: &btrfs_super_block, offset: u64) -> Result<()> {
    let mut copy = *sb;
    copy.bytenr = offset;
    let mut buf = super_to_buf(&copy);
    let cs = csum_data(&buf[BTRFS_CSUM_SIZE..], copy.csum_type);
    buf[..BTRFS_CSUM_SIZE].copy_from_slice(&cs);
    dev.write_all_at(&buf, offset)
}

/// replicate one superblock to every device of the set
pub fn write_all_supers(set: &DeviceSet, sb: &btrfs_super_block, dev_items: &[(u64, btrfs_dev_item)]) -> Result<()> {
    for dev in set.devid_map.values() {
        let mut copy = *sb;
        if let Some((_, di)) = dev_items.iter().find(|(id, _)| *id == dev.devid) {
            copy.dev_item = *di;
        }
        write_dev_supers(dev, &copy)?;
    }
    Ok(())
}

pub struct ChunkInfo(pub btrfs_disk_key, pub btrfs_chunk, pub Vec<btrfs_stripe>);

/// sys_chunk_array has members with inconsistent lengths. Each member is comprised of a btrfs_disk_key, a btrfs_chunk (which contains one btrfs_stripe) then btrfs_chunk.num_stripes -1 additional btrfs_stripes.
pub struct SysChunkIter<'a> {
    cursor: std::io::Cursor<&'a [u8]>,
    size: u64,
}

impl SysChunkIter<'_> {
    pub fn new(sb: &btrfs_super_block) -> SysChunkIter {
        SysChunkIter {
            cursor: std::io::Cursor::<&[u8]>::new(&sb.sys_chunk_array),
            size: sb.sys_chunk_array_size as u64,
        }
    }
}

impl Iterator for SysChunkIter<'_> {
    type Item = ChunkInfo;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor.position() >= self.size {
            return None;
        }
        let mut stripes = Vec::<btrfs_stripe>::new();

        type DiskKeyBuf = [u8; std::mem::size_of::<btrfs_disk_key>()];
        let mut buf: DiskKeyBuf = [0_u8; std::mem::size_of::<btrfs_disk_key>()];
        self.cursor.read_exact(&mut buf).ok()?;
        let key: btrfs_disk_key = read_struct(&buf, 0);

        type ChunkBuf = [u8; std::mem::size_of::<btrfs_chunk>()];
        let mut buf: ChunkBuf = [0_u8; std::mem::size_of::<btrfs_chunk>()];
        self.cursor.read_exact(&mut buf).ok()?;
        let chunk: btrfs_chunk = read_struct(&buf, 0);

        for _ in 0..chunk.num_stripes {
            type StripeBuf = [u8; std::mem::size_of::<btrfs_stripe>()];
            let mut buf: StripeBuf = [0_u8; std::mem::size_of::<btrfs_stripe>()];
            self.cursor.read_exact(&mut buf).ok()?;
            stripes.push(read_struct(&buf, 0));
        }

        Some(ChunkInfo(key, chunk, stripes))
    }
}

/// system chunks are mirrored into the superblock so the chunk tree itself
/// can be located at open time
pub fn append_sys_chunk(
    sb: &mut btrfs_super_block,
    key: &btrfs_disk_key,
    chunk: &btrfs_chunk,
    stripes: &[btrfs_stripe],
) -> Result<()> {
    let entry_len = std::mem::size_of::<btrfs_disk_key>()
        + std::mem::size_of::<btrfs_chunk>()
        + stripes.len() * std::mem::size_of::<btrfs_stripe>();
    let used = sb.sys_chunk_array_size as usize;
    if used + entry_len > BTRFS_SYSTEM_CHUNK_ARRAY_SIZE {
        return Err(BtrfsError::NoSpace {
            kind: "sys_chunk_array",
            needed: entry_len as u64,
        });
    }
    let mut off = used;
    let arr: &mut [u8] = &mut sb.sys_chunk_array;
    write_struct(arr, off, key);
    off += std::mem::size_of::<btrfs_disk_key>();
    write_struct(arr, off, chunk);
    off += std::mem::size_of::<btrfs_chunk>();
    for stripe in stripes {
        write_struct(arr, off, stripe);
        off += std::mem::size_of::<btrfs_stripe>();
    }
    sb.sys_chunk_array_size = off as u32;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_super() -> btrfs_super_block {
        let buf = [0_u8; BTRFS_SUPER_INFO_SIZE];
        let mut sb = super_from_buf(&buf);
        sb.magic = BTRFS_MAGIC;
        sb.csum_type = BtrfsCsumType::CRC32;
        sb.sectorsize = 4096;
        sb.nodesize = 16384;
        sb
    }

    #[test]
    fn check_super_rejects_bad_nodesize() {
        let mut sb = blank_super();
        sb.nodesize = 1000;
        assert!(check_super(&sb, 65536).is_err());
    }

    #[test]
    fn check_super_rejects_deep_root() {
        let mut sb = blank_super();
        sb.root_level = 9;
        assert!(check_super(&sb, 65536).is_err());
    }

    #[test]
    fn sys_chunk_append_then_iterate() {
        let mut sb = blank_super();
        let key = btrfs_disk_key::new(
            BTRFS_FIRST_CHUNK_TREE_OBJECTID,
            BtrfsItemType::CHUNK_ITEM,
            1024 * 1024,
        );
        let chunk = btrfs_chunk {
            length: 4 * 1024 * 1024,
            owner: BTRFS_EXTENT_TREE_OBJECTID,
            stripe_len: BTRFS_STRIPE_LEN,
            r#type: BTRFS_BLOCK_GROUP_SYSTEM,
            io_align: 4096,
            io_width: 4096,
            sector_size: 4096,
            num_stripes: 1,
            sub_stripes: 1,
        };
        let stripe = btrfs_stripe {
            devid: 1,
            offset: 1024 * 1024,
            dev_uuid: [7; BTRFS_UUID_SIZE],
        };
        append_sys_chunk(&mut sb, &key, &chunk, &[stripe]).unwrap();

        let mut it = SysChunkIter::new(&sb);
        let ChunkInfo(k, c, s) = it.next().unwrap();
        assert_eq!(k, key);
        let len = c.length;
        assert_eq!(len, 4 * 1024 * 1024);
        assert_eq!(s.len(), 1);
        assert!(it.next().is_none());
    }

    #[test]
    fn sys_chunk_array_overflow_is_no_space() {
        let mut sb = blank_super();
        let key = btrfs_disk_key::new(
            BTRFS_FIRST_CHUNK_TREE_OBJECTID,
            BtrfsItemType::CHUNK_ITEM,
            0,
        );
        let chunk = btrfs_chunk {
            length: 1,
            owner: 0,
            stripe_len: BTRFS_STRIPE_LEN,
            r#type: BTRFS_BLOCK_GROUP_SYSTEM,
            io_align: 4096,
            io_width: 4096,
            sector_size: 4096,
            num_stripes: 1,
            sub_stripes: 1,
        };
        let stripe = btrfs_stripe {
            devid: 1,
            offset: 0,
            dev_uuid: [0; BTRFS_UUID_SIZE],
        };
        let mut appended = 0;
        loop {
            match append_sys_chunk(&mut sb, &key, &chunk, &[stripe]) {
                Ok(()) => appended += 1,
                Err(BtrfsError::NoSpace { .. }) => break,
                Err(e) => panic!("unexpected error {e}"),
            }
            assert!(appended < 100);
        }
        assert_eq!(
            appended,
            BTRFS_SYSTEM_CHUNK_ARRAY_SIZE / (17 + 48 + 32)
        );
    }
}
