//! Offline file extraction: walk a filesystem tree and write its contents
//! into a local directory, no mount involved.

use crate::ctree::{self, TreeRoot};
use crate::dir_item::decode_dir_entries;
use crate::error::{BtrfsError, Result};
use crate::fs::FsInfo;
use crate::inode::{self, MAX_EXTENT_WALK_RETRIES};
use crate::root_tree;
use crate::structures::*;

use log::{info, warn};
use std::fs as stdfs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

pub struct RestoreOptions {
    /// descend into snapshots and other subvolumes
    pub snapshots: bool,
    /// restore mode and mtime onto the extracted files
    pub metadata: bool,
    pub verbose: bool,
    /// overwrite files that already exist in the target
    pub overwrite: bool,
}

impl Default for RestoreOptions {
    fn default() -> RestoreOptions {
        RestoreOptions {
            snapshots: false,
            metadata: false,
            verbose: false,
            overwrite: true,
        }
    }
}

#[derive(Default)]
pub struct RestoreStats {
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    pub errors: u64,
}

/// entries of one directory inode, in index order
fn list_dir(
    fs: &mut FsInfo,
    root: &mut TreeRoot,
    dir_ino: u64,
) -> Result<Vec<(Vec<u8>, btrfs_disk_key, u8)>> {
    let key = btrfs_disk_key::new(dir_ino, BtrfsItemType::DIR_INDEX, 0);
    let (mut path, _) = ctree::search_slot(fs, None, root, &key, 0, false)?;
    let mut out = Vec::new();
    let mut spins = 0_u32;
    loop {
        let leaf = path.leaf();
        let slot = path.slot();
        if slot >= leaf.borrow().nritems() as usize {
            spins += 1;
            if spins >= MAX_EXTENT_WALK_RETRIES {
                return Err(BtrfsError::corrupt(format!(
                    "directory walk for inode {dir_ino} does not terminate"
                )));
            }
            if !ctree::next_leaf(fs, root, &mut path)? {
                break;
            }
            continue;
        }
        let k = leaf.borrow().key(slot);
        if k.objectid != dir_ino || k.item_type != BtrfsItemType::DIR_INDEX {
            if k.objectid > dir_ino {
                break;
            }
            if !ctree::next_item(fs, root, &mut path)? {
                break;
            }
            continue;
        }
        for e in decode_dir_entries(&leaf.borrow().item_data(slot))? {
            out.push((e.name, e.location, e.filetype));
        }
        if !ctree::next_item(fs, root, &mut path)? {
            break;
        }
    }
    Ok(out)
}

fn apply_metadata(target: &Path, item: &btrfs_inode_item) -> Result<()> {
    let mode = item.mode;
    stdfs::set_permissions(target, stdfs::Permissions::from_mode(mode & 0o7777)).map_err(|e| {
        BtrfsError::IoWrite {
            devid: 0,
            offset: 0,
            source: e,
        }
    })?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn restore_dir(
    fs: &mut FsInfo,
    root: &mut TreeRoot,
    dir_ino: u64,
    target: &Path,
    opts: &RestoreOptions,
    stats: &mut RestoreStats,
    depth: usize,
) -> Result<()> {
    if depth > BTRFS_MAX_LEVEL * 32 {
        return Err(BtrfsError::corrupt("directory tree too deep"));
    }
    stdfs::create_dir_all(target).map_err(|e| BtrfsError::IoWrite {
        devid: 0,
        offset: 0,
        source: e,
    })?;
    stats.dirs += 1;

    for (name, location, filetype) in list_dir(fs, root, dir_ino)? {
        let name_str = String::from_utf8_lossy(&name).to_string();
        let child_path: PathBuf = target.join(&name_str);

        if location.item_type == BtrfsItemType::ROOT_ITEM {
            // a nested subvolume boundary
            if !opts.snapshots {
                if opts.verbose {
                    info!("skipping subvolume {name_str}");
                }
                continue;
            }
            let mut sub = root_tree::read_fs_root(fs, location.objectid)?;
            let sub_dir = sub
                .root_item
                .as_ref()
                .map(|i| i.root_dirid)
                .unwrap_or(BTRFS_FIRST_FREE_OBJECTID);
            restore_dir(fs, &mut sub, sub_dir, &child_path, opts, stats, depth + 1)?;
            continue;
        }

        let ino = location.objectid;
        match filetype {
            BTRFS_FT_DIR => restore_dir(fs, root, ino, &child_path, opts, stats, depth + 1)?,
            BTRFS_FT_REG_FILE => {
                if child_path.exists() && !opts.overwrite {
                    continue;
                }
                match inode::read_file(fs, root, ino) {
                    Ok(data) => {
                        let mut f = stdfs::File::create(&child_path).map_err(|e| {
                            BtrfsError::IoWrite {
                                devid: 0,
                                offset: 0,
                                source: e,
                            }
                        })?;
                        f.write_all(&data).map_err(|e| BtrfsError::IoWrite {
                            devid: 0,
                            offset: 0,
                            source: e,
                        })?;
                        if opts.metadata {
                            let item = inode::read_inode(fs, root, ino)?;
                            apply_metadata(&child_path, &item)?;
                        }
                        if opts.verbose {
                            info!("restored {}", child_path.display());
                        }
                        stats.files += 1;
                    }
                    Err(e) => {
                        warn!("failed to restore {}: {e}", child_path.display());
                        stats.errors += 1;
                    }
                }
            }
            BTRFS_FT_SYMLINK => {
                match inode::read_file(fs, root, ino) {
                    Ok(target_bytes) => {
                        let target_str = String::from_utf8_lossy(&target_bytes).to_string();
                        let _ = stdfs::remove_file(&child_path);
                        std::os::unix::fs::symlink(&target_str, &child_path).map_err(|e| {
                            BtrfsError::IoWrite {
                                devid: 0,
                                offset: 0,
                                source: e,
                            }
                        })?;
                        stats.symlinks += 1;
                    }
                    Err(e) => {
                        warn!("failed to restore symlink {}: {e}", child_path.display());
                        stats.errors += 1;
                    }
                }
            }
            _ => {
                // device nodes and fifos are left behind on purpose
                if opts.verbose {
                    info!("skipping special file {name_str}");
                }
            }
        }
    }
    Ok(())
}

/// walk `root_objectid` (default: the main filesystem tree) and extract
/// everything under `target`
pub fn restore(
    fs: &mut FsInfo,
    root_objectid: u64,
    target: &Path,
    opts: &RestoreOptions,
) -> Result<RestoreStats> {
    let mut root = root_tree::read_fs_root(fs, root_objectid)?;
    let root_dir = root
        .root_item
        .as_ref()
        .map(|i| i.root_dirid)
        .unwrap_or(BTRFS_FIRST_FREE_OBJECTID);
    let mut stats = RestoreStats::default();
    restore_dir(fs, &mut root, root_dir, target, opts, &mut stats, 0)?;
    info!(
        "restore: {} files, {} dirs, {} symlinks, {} errors",
        stats.files, stats.dirs, stats.symlinks, stats.errors
    );
    Ok(stats)
}
