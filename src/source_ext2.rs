//! Default SourceFs implementation for the extended filesystem family
//! (ext2/3, and ext4 images that stick to indirect block maps).

#![allow(non_camel_case_types)]

use crate::device::Device;
use crate::error::{BtrfsError, Result};
use crate::source_fs::*;
use crate::structures::{read_struct, write_struct};

use log::debug;
use std::path::Path;

pub const EXT2_SUPER_MAGIC: u16 = 0xEF53;
pub const EXT2_ROOT_INO: u64 = 2;
pub const EXT2_FIRST_NONRESERVED_INO: u64 = 11;
const EXT2_VALID_FS: u16 = 1;
const EXT2_NDIR_BLOCKS: usize = 12;
const EXT2_XATTR_MAGIC: u32 = 0xEA020000;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct ext2_super_block {
    s_inodes_count: u32,
    s_blocks_count: u32,
    s_r_blocks_count: u32,
    s_free_blocks_count: u32,
    s_free_inodes_count: u32,
    s_first_data_block: u32,
    s_log_block_size: u32,
    s_log_frag_size: u32,
    s_blocks_per_group: u32,
    s_frags_per_group: u32,
    s_inodes_per_group: u32,
    s_mtime: u32,
    s_wtime: u32,
    s_mnt_count: u16,
    s_max_mnt_count: u16,
    s_magic: u16,
    s_state: u16,
    s_errors: u16,
    s_minor_rev_level: u16,
    s_lastcheck: u32,
    s_checkinterval: u32,
    s_creator_os: u32,
    s_rev_level: u32,
    s_def_resuid: u16,
    s_def_resgid: u16,
    s_first_ino: u32,
    s_inode_size: u16,
    s_block_group_nr: u16,
    s_feature_compat: u32,
    s_feature_incompat: u32,
    s_feature_ro_compat: u32,
    s_uuid: [u8; 16],
    s_volume_name: [u8; 16],
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct ext2_group_desc {
    bg_block_bitmap: u32,
    bg_inode_bitmap: u32,
    bg_inode_table: u32,
    bg_free_blocks_count: u16,
    bg_free_inodes_count: u16,
    bg_used_dirs_count: u16,
    bg_pad: u16,
    bg_reserved: [u32; 3],
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct ext2_inode {
    i_mode: u16,
    i_uid: u16,
    i_size: u32,
    i_atime: u32,
    i_ctime: u32,
    i_mtime: u32,
    i_dtime: u32,
    i_gid: u16,
    i_links_count: u16,
    i_blocks: u32,
    i_flags: u32,
    i_osd1: u32,
    i_block: [u32; 15],
    i_generation: u32,
    i_file_acl: u32,
    i_size_high: u32,
    i_faddr: u32,
    i_osd2: [u32; 3],
}

pub struct Ext2Fs {
    dev: Device,
    block_size: u64,
    blocks_count: u64,
    first_data_block: u64,
    blocks_per_group: u64,
    inodes_per_group: u64,
    inodes_count: u64,
    inode_size: usize,
    state: u16,
    label: String,
    groups: Vec<ext2_group_desc>,
}

impl Ext2Fs {
    pub fn open(path: &Path) -> Result<Ext2Fs> {
        let dev = Device::open(path, false)?;
        let mut buf = vec![0_u8; 1024];
        dev.read_exact_at(&mut buf, 1024)?;
        let sb: ext2_super_block = read_struct(&buf, 0);
        let magic = sb.s_magic;
        if magic != EXT2_SUPER_MAGIC {
            return Err(BtrfsError::structural(1024, "not an ext2 superblock"));
        }
        let block_size = 1024_u64 << sb.s_log_block_size;
        let rev = sb.s_rev_level;
        let inode_size = if rev >= 1 { sb.s_inode_size as usize } else { 128 };
        let blocks_count = sb.s_blocks_count as u64;
        let blocks_per_group = sb.s_blocks_per_group as u64;
        let ngroups = (blocks_count - sb.s_first_data_block as u64 + blocks_per_group - 1)
            / blocks_per_group;

        // group descriptors follow the superblock's block
        let desc_block = if block_size == 1024 { 2 } else { 1 };
        let desc_bytes = ngroups as usize * std::mem::size_of::<ext2_group_desc>();
        let mut desc_buf = vec![0_u8; desc_bytes.div_ceil(block_size as usize) * block_size as usize];
        dev.read_exact_at(&mut desc_buf, desc_block * block_size)?;
        let groups = (0..ngroups as usize)
            .map(|i| read_struct(&desc_buf, i * std::mem::size_of::<ext2_group_desc>()))
            .collect();

        let label = String::from_utf8_lossy(&sb.s_volume_name)
            .trim_end_matches('\0')
            .to_string();
        debug!(
            "ext2 source: {} blocks of {}, {} groups",
            blocks_count, block_size, ngroups
        );
        Ok(Ext2Fs {
            dev,
            block_size,
            blocks_count,
            first_data_block: sb.s_first_data_block as u64,
            blocks_per_group,
            inodes_per_group: sb.s_inodes_per_group as u64,
            inodes_count: sb.s_inodes_count as u64,
            inode_size,
            state: sb.s_state,
            label,
            groups,
        })
    }

    fn read_block(&self, block: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; self.block_size as usize];
        self.dev.read_exact_at(&mut buf, block * self.block_size)?;
        Ok(buf)
    }

    fn raw_inode(&self, ino: u64) -> Result<ext2_inode> {
        if ino == 0 || ino > self.inodes_count {
            return Err(BtrfsError::InvalidArgument(format!("bad inode {ino}")));
        }
        let group = (ino - 1) / self.inodes_per_group;
        let index = (ino - 1) % self.inodes_per_group;
        let desc = &self.groups[group as usize];
        let table = desc.bg_inode_table as u64;
        let offset = table * self.block_size + index * self.inode_size as u64;
        let mut buf = vec![0_u8; self.inode_size];
        self.dev.read_exact_at(&mut buf, offset)?;
        Ok(read_struct(&buf, 0))
    }

    /// collect the block list of an inode through the indirect chains
    fn block_list(&self, inode: &ext2_inode) -> Result<Vec<u64>> {
        let per_block = self.block_size as usize / 4;
        let nblocks =
            (inode_size_of(inode) + self.block_size - 1) / self.block_size;
        let mut out = Vec::with_capacity(nblocks as usize);

        let read_indirect = |block: u32, out: &mut Vec<u64>, depth: usize| -> Result<()> {
            fn walk(
                fs: &Ext2Fs,
                block: u32,
                depth: usize,
                per_block: usize,
                out: &mut Vec<u64>,
            ) -> Result<()> {
                if block == 0 {
                    // a missing indirect block is a run of holes
                    out.extend(std::iter::repeat(0).take(per_block.pow(depth as u32)));
                    return Ok(());
                }
                let data = fs.read_block(block as u64)?;
                for i in 0..per_block {
                    let ptr = u32::from_le_bytes(data[i * 4..i * 4 + 4].try_into().unwrap());
                    if depth == 1 {
                        out.push(ptr as u64);
                    } else {
                        walk(fs, ptr, depth - 1, per_block, out)?;
                    }
                }
                Ok(())
            }
            walk(self, block, depth, per_block, out)
        };

        let iblock = inode.i_block;
        for b in iblock.iter().take(EXT2_NDIR_BLOCKS) {
            out.push(*b as u64);
        }
        if out.len() < nblocks as usize {
            read_indirect(iblock[12], &mut out, 1)?;
        }
        if out.len() < nblocks as usize {
            read_indirect(iblock[13], &mut out, 2)?;
        }
        if out.len() < nblocks as usize {
            read_indirect(iblock[14], &mut out, 3)?;
        }
        out.truncate(nblocks as usize);
        Ok(out)
    }
}

fn inode_size_of(inode: &ext2_inode) -> u64 {
    let mode = inode.i_mode;
    let size = inode.i_size as u64;
    if mode & 0o170000 == 0o100000 {
        size | ((inode.i_size_high as u64) << 32)
    } else {
        size
    }
}

impl SourceFs for Ext2Fs {
    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn total_bytes(&self) -> u64 {
        self.blocks_count * self.block_size
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    fn root_ino(&self) -> u64 {
        EXT2_ROOT_INO
    }

    fn check_state(&mut self) -> Result<()> {
        if self.state & EXT2_VALID_FS == 0 {
            return Err(BtrfsError::corrupt(
                "source filesystem was not cleanly unmounted",
            ));
        }
        Ok(())
    }

    fn used_space(&mut self) -> Result<Vec<(u64, u64)>> {
        let mut ranges: Vec<(u64, u64)> = Vec::new();
        for (g, desc) in self.groups.iter().enumerate() {
            let bitmap = self.read_block(desc.bg_block_bitmap as u64)?;
            let base = self.first_data_block + g as u64 * self.blocks_per_group;
            let in_group = std::cmp::min(
                self.blocks_per_group,
                self.blocks_count - base,
            );
            for b in 0..in_group {
                let used = bitmap[(b / 8) as usize] & (1 << (b % 8)) != 0;
                if !used {
                    continue;
                }
                let start = (base + b) * self.block_size;
                match ranges.last_mut() {
                    Some((s, l)) if *s + *l == start => *l += self.block_size,
                    _ => ranges.push((start, self.block_size)),
                }
            }
        }
        Ok(ranges)
    }

    fn inodes(&mut self) -> Result<Vec<SourceInode>> {
        let mut out = Vec::new();
        for ino in std::iter::once(EXT2_ROOT_INO)
            .chain(EXT2_FIRST_NONRESERVED_INO..=self.inodes_count)
        {
            let raw = self.raw_inode(ino)?;
            let links = raw.i_links_count;
            let mode = raw.i_mode;
            let dtime = raw.i_dtime;
            if links == 0 || mode == 0 || dtime != 0 {
                continue;
            }
            let iflags = raw.i_flags;
            out.push(SourceInode {
                ino,
                mode: mode as u32,
                uid: raw.i_uid as u32,
                gid: raw.i_gid as u32,
                nlink: links as u32,
                size: inode_size_of(&raw),
                rdev: decode_rdev(&raw),
                times: SourceTimes {
                    atime: raw.i_atime as u64,
                    ctime: raw.i_ctime as u64,
                    mtime: raw.i_mtime as u64,
                },
                attrs: SourceAttrs {
                    sync: iflags & 0x8 != 0,
                    immutable: iflags & 0x10 != 0,
                    append: iflags & 0x20 != 0,
                    nodump: iflags & 0x40 != 0,
                    noatime: iflags & 0x80 != 0,
                    dirsync: iflags & 0x10000 != 0,
                },
            });
        }
        Ok(out)
    }

    fn data_blocks(&mut self, ino: u64) -> Result<Vec<SourceBlockRun>> {
        let raw = self.raw_inode(ino)?;
        let blocks = self.block_list(&raw)?;
        let mut runs: Vec<SourceBlockRun> = Vec::new();
        for (i, disk) in blocks.iter().enumerate() {
            match runs.last_mut() {
                Some(run)
                    if run.file_block + run.count == i as u64
                        && ((run.disk_block == 0 && *disk == 0)
                            || run.disk_block + run.count == *disk && *disk != 0) =>
                {
                    run.count += 1
                }
                _ => runs.push(SourceBlockRun {
                    file_block: i as u64,
                    disk_block: *disk,
                    count: 1,
                }),
            }
        }
        Ok(runs)
    }

    fn dir_entries(&mut self, ino: u64) -> Result<Vec<SourceDirEntry>> {
        let raw = self.raw_inode(ino)?;
        let blocks = self.block_list(&raw)?;
        let mut out = Vec::new();
        for block in blocks {
            if block == 0 {
                continue;
            }
            let data = self.read_block(block)?;
            let mut off = 0_usize;
            while off + 8 <= data.len() {
                let entry_ino = u32::from_le_bytes(data[off..off + 4].try_into().unwrap());
                let rec_len =
                    u16::from_le_bytes(data[off + 4..off + 6].try_into().unwrap()) as usize;
                let name_len = data[off + 6] as usize;
                let file_type = data[off + 7];
                if rec_len < 8 || off + rec_len > data.len() {
                    break;
                }
                if entry_ino != 0 && name_len > 0 {
                    let name = data[off + 8..off + 8 + name_len].to_vec();
                    if name != b"." && name != b".." {
                        out.push(SourceDirEntry {
                            name,
                            ino: entry_ino as u64,
                            filetype: file_type,
                        });
                    }
                }
                off += rec_len;
            }
        }
        Ok(out)
    }

    fn symlink_target(&mut self, ino: u64) -> Result<Vec<u8>> {
        let raw = self.raw_inode(ino)?;
        let size = inode_size_of(&raw) as usize;
        let blocks = raw.i_blocks;
        let file_acl = raw.i_file_acl;
        let acl_blocks = if file_acl != 0 {
            self.block_size / 512
        } else {
            0
        };
        if blocks as u64 <= acl_blocks && size <= 60 {
            // fast symlink: the target lives in the block array itself
            let iblock = raw.i_block;
            let mut raw_bytes = [0_u8; 60];
            for (i, b) in iblock.iter().enumerate() {
                write_struct(&mut raw_bytes, i * 4, b);
            }
            return Ok(raw_bytes[..size].to_vec());
        }
        let list = self.block_list(&raw)?;
        let first = list.first().copied().unwrap_or(0);
        if first == 0 {
            return Err(BtrfsError::corrupt(format!("symlink {ino} has no data")));
        }
        let data = self.read_block(first)?;
        Ok(data[..size.min(data.len())].to_vec())
    }

    fn xattrs(&mut self, ino: u64) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let raw = self.raw_inode(ino)?;
        let acl_block = raw.i_file_acl;
        if acl_block == 0 {
            return Ok(Vec::new());
        }
        let data = self.read_block(acl_block as u64)?;
        let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
        if magic != EXT2_XATTR_MAGIC {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        // entries start after the 32-byte header
        let mut off = 32_usize;
        while off + 16 <= data.len() {
            let name_len = data[off] as usize;
            let name_index = data[off + 1];
            let value_offs =
                u16::from_le_bytes(data[off + 2..off + 4].try_into().unwrap()) as usize;
            let value_size =
                u32::from_le_bytes(data[off + 8..off + 12].try_into().unwrap()) as usize;
            if name_len == 0 && name_index == 0 {
                break;
            }
            if off + 16 + name_len > data.len() || value_offs + value_size > data.len() {
                break;
            }
            let name_suffix = &data[off + 16..off + 16 + name_len];
            let prefix: &[u8] = match name_index {
                1 => b"user.",
                2 => b"system.posix_acl_access",
                3 => b"system.posix_acl_default",
                4 => b"trusted.",
                6 => b"security.",
                _ => b"",
            };
            let mut name = prefix.to_vec();
            if name_index != 2 && name_index != 3 {
                name.extend_from_slice(name_suffix);
            }
            out.push((name, data[value_offs..value_offs + value_size].to_vec()));
            // entries are padded to four bytes
            off += 16 + name_len.div_ceil(4) * 4;
        }
        Ok(out)
    }

    fn read_bytes(&mut self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; len as usize];
        self.dev.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }
}

fn decode_rdev(inode: &ext2_inode) -> u64 {
    let mode = inode.i_mode;
    let ft = mode & 0o170000;
    if ft != 0o20000 && ft != 0o60000 {
        return 0;
    }
    let iblock = inode.i_block;
    let raw = iblock[0];
    if raw != 0 {
        // old encoding: 8-bit major, 8-bit minor
        let major = (raw >> 8) & 0xff;
        let minor = raw & 0xff;
        ((major as u64) << 8) | minor as u64
    } else {
        let raw = iblock[1];
        let major = (raw & 0xfff00) >> 8;
        let minor = (raw & 0xff) | ((raw >> 12) & 0xfff00);
        ((major as u64) << 8) | minor as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superblock_layout_offsets() {
        // s_magic sits at byte 56 of the superblock
        assert_eq!(std::mem::size_of::<ext2_group_desc>(), 32);
        let mut buf = vec![0_u8; 1024];
        buf[56] = 0x53;
        buf[57] = 0xEF;
        let sb: ext2_super_block = read_struct(&buf, 0);
        let magic = sb.s_magic;
        assert_eq!(magic, EXT2_SUPER_MAGIC);
    }

    #[test]
    fn rdev_old_encoding() {
        let mut raw: ext2_inode = read_struct(&[0_u8; 128], 0);
        raw.i_mode = 0o20000;
        let mut blocks = [0_u32; 15];
        blocks[0] = (8 << 8) | 1;
        raw.i_block = blocks;
        assert_eq!(decode_rdev(&raw), (8 << 8) | 1);
    }
}
