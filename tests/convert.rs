//! Converter round-trip: a handcrafted ext2 image goes to btrfs in place,
//! every file stays readable, and rollback restores the original bytes.

mod common;

use btrfs_kit::convert::{convert, rollback, ConvertOptions, IMAGE_SUBVOL_NAME};
use btrfs_kit::device::Registry;
use btrfs_kit::fs::{open_fs, OpenFlags};
use btrfs_kit::restore::{restore, RestoreOptions};
use btrfs_kit::root_tree::read_fs_root;
use btrfs_kit::source_ext2::Ext2Fs;
use btrfs_kit::source_fs::SourceFs;
use btrfs_kit::structures::*;
use btrfs_kit::{dir_item, inode};

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const BLOCK: u64 = 4096;
const TOTAL_BLOCKS: u64 = 16384; // 64 MiB
const EXT2_MAGIC_OFFSET: u64 = 1024 + 56;

const HELLO_INO: u32 = 12;
const BIG_INO: u32 = 13;
const HELLO_BLOCK: u64 = 300;
const BIG_FIRST_BLOCK: u64 = 400;
const BIG_BLOCKS: u64 = 10;

fn hello_bytes() -> Vec<u8> {
    b"hello world\n".to_vec()
}

fn big_bytes() -> Vec<u8> {
    (0..BIG_BLOCKS * BLOCK).map(|i| (i % 241) as u8).collect()
}

fn put(buf: &mut [u8], off: usize, bytes: &[u8]) {
    buf[off..off + bytes.len()].copy_from_slice(bytes);
}

fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    put(buf, off, &v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    put(buf, off, &v.to_le_bytes());
}

/// one-group ext2 image with a root directory and two regular files
fn build_ext2_image(path: &Path) {
    let mut image = vec![0_u8; (TOTAL_BLOCKS * BLOCK) as usize];

    // superblock at byte 1024
    {
        let sb = &mut image[1024..2048];
        put_u32(sb, 0, 128); // inodes_count
        put_u32(sb, 4, TOTAL_BLOCKS as u32); // blocks_count
        put_u32(sb, 12, (TOTAL_BLOCKS - 500) as u32); // free blocks, informational
        put_u32(sb, 16, 100); // free inodes
        put_u32(sb, 20, 0); // first_data_block
        put_u32(sb, 24, 2); // log_block_size -> 4096
        put_u32(sb, 32, 32768); // blocks_per_group
        put_u32(sb, 40, 128); // inodes_per_group
        put_u16(sb, 56, 0xEF53); // magic
        put_u16(sb, 58, 1); // state: cleanly unmounted
        put_u32(sb, 76, 1); // rev_level
        put_u32(sb, 84, 11); // first_ino
        put_u16(sb, 88, 256); // inode_size
        put(sb, 120, b"testsrc");
    }

    // one group descriptor at block 1
    {
        let gd = &mut image[BLOCK as usize..];
        put_u32(gd, 0, 3); // block bitmap at block 3
        put_u32(gd, 4, 4); // inode bitmap at block 4
        put_u32(gd, 8, 5); // inode table at block 5
    }

    // block bitmap: metadata blocks 0..=13, then the file blocks
    {
        let bb = &mut image[(3 * BLOCK) as usize..];
        for b in 0..=13_u64 {
            bb[(b / 8) as usize] |= 1 << (b % 8);
        }
        bb[(HELLO_BLOCK / 8) as usize] |= 1 << (HELLO_BLOCK % 8);
        for b in BIG_FIRST_BLOCK..BIG_FIRST_BLOCK + BIG_BLOCKS {
            bb[(b / 8) as usize] |= 1 << (b % 8);
        }
    }

    // inode bitmap: the 10 reserved inodes plus our three live ones
    {
        let ib = &mut image[(4 * BLOCK) as usize..];
        for i in 0..13_u64 {
            ib[(i / 8) as usize] |= 1 << (i % 8);
        }
    }

    // inode table at block 5, 256 bytes per inode
    let inode_at = |ino: u32| (5 * BLOCK) as usize + (ino as usize - 1) * 256;
    {
        let off = inode_at(2); // root directory
        let ino = &mut image[off..off + 256];
        put_u16(ino, 0, 0o40755);
        put_u32(ino, 4, BLOCK as u32); // size
        put_u16(ino, 26, 3); // links
        put_u32(ino, 28, 8); // 512-byte sectors
        put_u32(ino, 40, 13); // block[0] -> dir data at block 13
    }
    {
        let off = inode_at(HELLO_INO);
        let ino = &mut image[off..off + 256];
        put_u16(ino, 0, 0o100644);
        put_u32(ino, 4, hello_bytes().len() as u32);
        put_u16(ino, 26, 1);
        put_u32(ino, 28, 8);
        put_u32(ino, 40, HELLO_BLOCK as u32);
    }
    {
        let off = inode_at(BIG_INO);
        let ino = &mut image[off..off + 256];
        put_u16(ino, 0, 0o100644);
        put_u32(ino, 4, (BIG_BLOCKS * BLOCK) as u32);
        put_u16(ino, 26, 1);
        put_u32(ino, 28, (BIG_BLOCKS * 8) as u32);
        for i in 0..BIG_BLOCKS {
            put_u32(ino, 40 + (i as usize) * 4, (BIG_FIRST_BLOCK + i) as u32);
        }
    }

    // root directory entries at block 13
    {
        let base = (13 * BLOCK) as usize;
        let mut off = base;
        let mut entry = |image: &mut Vec<u8>,
                         off: &mut usize,
                         ino: u32,
                         rec_len: u16,
                         ftype: u8,
                         name: &[u8]| {
            put_u32(image, *off, ino);
            put_u16(image, *off + 4, rec_len);
            image[*off + 6] = name.len() as u8;
            image[*off + 7] = ftype;
            put(image, *off + 8, name);
            *off += rec_len as usize;
        };
        entry(&mut image, &mut off, 2, 12, 2, b".");
        entry(&mut image, &mut off, 2, 12, 2, b"..");
        entry(&mut image, &mut off, HELLO_INO, 20, 1, b"hello.txt");
        let remaining = (base + BLOCK as usize - off) as u16;
        entry(&mut image, &mut off, BIG_INO, remaining, 1, b"big.bin");
    }

    put(
        &mut image,
        (HELLO_BLOCK * BLOCK) as usize,
        &hello_bytes(),
    );
    put(&mut image, (BIG_FIRST_BLOCK * BLOCK) as usize, &big_bytes());

    let mut f = File::create(path).unwrap();
    f.write_all(&image).unwrap();
}

fn sha256_of(path: &Path) -> [u8; 32] {
    let mut f = File::open(path).unwrap();
    let mut hasher = Sha256::new();
    let mut buf = vec![0_u8; 1 << 20];
    loop {
        let n = f.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    hasher.finalize().into()
}

fn image_path() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("source.img");
    build_ext2_image(&path);
    (dir, path)
}

#[test]
fn ext2_reader_sees_the_handcrafted_image() {
    let (_dir, path) = image_path();
    let mut src = Ext2Fs::open(&path).unwrap();
    src.check_state().unwrap();
    assert_eq!(src.block_size(), BLOCK);
    assert_eq!(src.total_bytes(), TOTAL_BLOCKS * BLOCK);
    assert_eq!(src.label(), "testsrc");

    let used = src.used_space().unwrap();
    assert!(used
        .iter()
        .any(|(s, l)| *s == 0 && *l >= 14 * BLOCK));
    assert!(used.contains(&(HELLO_BLOCK * BLOCK, BLOCK)));
    assert!(used.contains(&(BIG_FIRST_BLOCK * BLOCK, BIG_BLOCKS * BLOCK)));

    let inodes = src.inodes().unwrap();
    assert_eq!(inodes.len(), 3);
    let entries = src.dir_entries(2).unwrap();
    let names: Vec<String> = entries
        .iter()
        .map(|e| String::from_utf8_lossy(&e.name).to_string())
        .collect();
    assert_eq!(names, vec!["hello.txt", "big.bin"]);

    let runs = src.data_blocks(BIG_INO as u64).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].disk_block, BIG_FIRST_BLOCK);
    assert_eq!(runs[0].count, BIG_BLOCKS);
}

#[test]
fn convert_then_read_then_rollback() {
    let (_dir, path) = image_path();
    let pristine = sha256_of(&path);

    {
        let mut src = Ext2Fs::open(&path).unwrap();
        convert(&path, &mut src, &ConvertOptions::default()).unwrap();
    }

    // the converted pool opens at the canonical superblock offset
    {
        let mut registry = Registry::new();
        let mut fs = open_fs(&mut registry, &[path.as_path()], OpenFlags::default()).unwrap();

        let mut fs_root = fs.root(BTRFS_FS_TREE_OBJECTID).unwrap();
        let hello = dir_item::lookup_dir_item(
            &mut fs,
            &mut fs_root,
            BTRFS_FIRST_FREE_OBJECTID,
            b"hello.txt",
        )
        .unwrap()
        .expect("hello.txt present");
        let content =
            inode::read_file(&mut fs, &mut fs_root, hello.location.objectid).unwrap();
        assert_eq!(content, hello_bytes());

        let big = dir_item::lookup_dir_item(
            &mut fs,
            &mut fs_root,
            BTRFS_FIRST_FREE_OBJECTID,
            b"big.bin",
        )
        .unwrap()
        .expect("big.bin present");
        let content = inode::read_file(&mut fs, &mut fs_root, big.location.objectid).unwrap();
        assert_eq!(content, big_bytes());

        // the image subvolume exposes the source bytes, hello block included
        let sub = dir_item::lookup_dir_item(
            &mut fs,
            &mut fs_root,
            BTRFS_FIRST_FREE_OBJECTID,
            IMAGE_SUBVOL_NAME.as_bytes(),
        )
        .unwrap()
        .expect("image subvolume linked");
        let mut image_root = read_fs_root(&mut fs, sub.location.objectid).unwrap();
        let image = dir_item::lookup_dir_item(
            &mut fs,
            &mut image_root,
            BTRFS_FIRST_FREE_OBJECTID,
            b"image",
        )
        .unwrap()
        .expect("image file");
        let bytes =
            inode::read_file(&mut fs, &mut image_root, image.location.objectid).unwrap();
        assert_eq!(bytes.len() as u64, TOTAL_BLOCKS * BLOCK);
        assert_eq!(
            &bytes[(HELLO_BLOCK * BLOCK) as usize
                ..(HELLO_BLOCK * BLOCK) as usize + hello_bytes().len()],
            &hello_bytes()[..]
        );
        // the relocated source superblock is reachable through the image
        assert_eq!(&bytes[1024 + 56..1024 + 58], &0xEF53_u16.to_le_bytes()[..]);

        // a full restore run sees both files
        let out = tempfile::tempdir().unwrap();
        let stats = restore(
            &mut fs,
            BTRFS_FS_TREE_OBJECTID,
            out.path(),
            &RestoreOptions::default(),
        )
        .unwrap();
        assert_eq!(stats.errors, 0);
        assert!(stats.files >= 2);
        let restored = std::fs::read(out.path().join("hello.txt")).unwrap();
        assert_eq!(restored, hello_bytes());
    }

    // the device itself no longer starts with the ext2 magic
    {
        let mut f = File::open(&path).unwrap();
        f.seek(SeekFrom::Start(EXT2_MAGIC_OFFSET)).unwrap();
        let mut magic = [0_u8; 2];
        f.read_exact(&mut magic).unwrap();
        assert_ne!(magic, 0xEF53_u16.to_le_bytes());
    }

    rollback(&path).unwrap();
    assert_eq!(sha256_of(&path), pristine);

    // and the source reads like nothing happened
    let mut src = Ext2Fs::open(&path).unwrap();
    let entries = src.dir_entries(2).unwrap();
    assert_eq!(entries.len(), 2);
}
