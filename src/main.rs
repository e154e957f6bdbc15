use btrfs_kit::device::{Device, Registry};
use btrfs_kit::error::BtrfsError;
use btrfs_kit::fs::{open_fs, OpenFlags};
use btrfs_kit::print_tree::{dump_all, dump_super, dump_sys_chunks, DumpSelection};
use btrfs_kit::structures::*;
use btrfs_kit::superblock::{read_super, write_one_super, SbReadFlags};
use btrfs_kit::{convert, mkfs, restore, scrub};

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

/// offline tools for an unmounted btrfs filesystem
///
/// Each command takes the block devices (or image files) of one pool.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
struct Params {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// dump superblock copies
    ShowSuper {
        /// dump every field
        #[arg(short = 'f')]
        full: bool,
        /// dump all mirrors
        #[arg(short = 'a')]
        all: bool,
        /// tolerate a bad magic
        #[arg(short = 'F')]
        force: bool,
        /// specific mirror to dump
        #[arg(short = 'i', default_value_t = 0)]
        mirror: usize,
        #[clap(required = true)]
        paths: Vec<PathBuf>,
    },
    /// print trees of an unmounted filesystem
    DebugTree {
        /// only the extent tree
        #[arg(short = 'e')]
        extents: bool,
        /// only the device tree
        #[arg(short = 'd')]
        devices: bool,
        /// only root items
        #[arg(short = 'r')]
        roots: bool,
        /// only the uuid tree
        #[arg(short = 'u')]
        uuid: bool,
        /// include backup roots
        #[arg(short = 'R')]
        backups: bool,
        /// print one block only
        #[arg(short = 'b')]
        block: Option<u64>,
        path: PathBuf,
    },
    /// overwrite the primary superblock with a mirror copy
    SelectSuper {
        #[arg(short = 's')]
        mirror: usize,
        path: PathBuf,
    },
    /// clear the log tree pointer after a committed transaction
    ZeroLog { path: PathBuf },
    /// per-tree size and seek statistics
    CalcSize {
        #[arg(short = 'v')]
        verbose: bool,
        path: PathBuf,
    },
    /// copy files out of an unmounted filesystem
    Restore {
        /// descend into snapshots
        #[arg(short = 's')]
        snapshots: bool,
        #[arg(short = 'v')]
        verbose: bool,
        /// restore permissions as well
        #[arg(short = 'm')]
        metadata: bool,
        /// tree id to restore from
        #[arg(short = 'f', default_value_t = BTRFS_FS_TREE_OBJECTID)]
        tree: u64,
        path: PathBuf,
        target: PathBuf,
    },
    /// verify every copy of every extent, optionally repairing
    Scrub {
        /// write repaired copies back
        #[arg(long)]
        repair: bool,
        #[clap(required = true)]
        paths: Vec<PathBuf>,
    },
    /// create a new filesystem
    Mkfs {
        #[arg(short = 'L', default_value = "")]
        label: String,
        /// metadata profile (single, dup, raid1)
        #[arg(short = 'm', default_value = "single")]
        metadata: String,
        /// data profile (single, raid0, raid1, raid10, raid5, raid6)
        #[arg(short = 'd', default_value = "single")]
        data: String,
        #[clap(required = true)]
        paths: Vec<PathBuf>,
    },
    /// convert an ext2/3 filesystem in place
    Convert {
        /// skip data checksums
        #[arg(short = 'd')]
        no_datacsum: bool,
        /// do not copy the source label
        #[arg(short = 'L')]
        no_label: bool,
        /// undo a previous conversion instead
        #[arg(long)]
        rollback: bool,
        path: PathBuf,
    },
}

fn profile_flags(name: &str) -> anyhow::Result<u64> {
    Ok(match name {
        "single" => 0,
        "dup" => BTRFS_BLOCK_GROUP_DUP,
        "raid0" => BTRFS_BLOCK_GROUP_RAID0,
        "raid1" => BTRFS_BLOCK_GROUP_RAID1,
        "raid10" => BTRFS_BLOCK_GROUP_RAID10,
        "raid5" => BTRFS_BLOCK_GROUP_RAID5,
        "raid6" => BTRFS_BLOCK_GROUP_RAID6,
        other => return Err(anyhow!("unknown profile {other}")),
    })
}

fn open_ro(paths: &[PathBuf]) -> anyhow::Result<btrfs_kit::fs::FsInfo> {
    let mut registry = Registry::new();
    let refs: Vec<&std::path::Path> = paths.iter().map(|p| p.as_path()).collect();
    Ok(open_fs(&mut registry, &refs, OpenFlags::default())?)
}

fn run() -> anyhow::Result<ExitCode> {
    let args = Params::parse();
    match args.command {
        Command::ShowSuper {
            full: _,
            all,
            force,
            mirror,
            paths,
        } => {
            for path in &paths {
                let dev = Device::open(path, false)?;
                let flags = SbReadFlags {
                    temporary: force,
                    recover: force,
                };
                let mirrors: Vec<usize> = if all {
                    (0..BTRFS_SUPER_MIRROR_MAX).collect()
                } else {
                    vec![mirror]
                };
                for m in mirrors {
                    let offset = btrfs_sb_offset(m);
                    if offset + BTRFS_SUPER_INFO_SIZE as u64 > dev.total_bytes {
                        continue;
                    }
                    match read_super(&dev, offset, flags) {
                        Ok(sb) => {
                            dump_super(
                                &sb,
                                &format!("{} (mirror {m})", path.display()),
                            );
                            dump_sys_chunks(&sb);
                        }
                        Err(e) => println!("{} mirror {m}: {e}", path.display()),
                    }
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::DebugTree {
            extents,
            devices,
            roots,
            uuid,
            backups,
            block,
            path,
        } => {
            let mut fs = open_ro(std::slice::from_ref(&path))?;
            let selection = DumpSelection {
                extents_only: extents,
                devices_only: devices,
                roots_only: roots,
                uuid_only: uuid,
                backups,
                block,
            };
            dump_all(&mut fs, &selection)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::SelectSuper { mirror, path } => {
            if mirror == 0 || mirror >= BTRFS_SUPER_MIRROR_MAX {
                return Err(anyhow!("mirror must be 1 or 2"));
            }
            let dev = Device::open(&path, true)?;
            let sb = read_super(&dev, btrfs_sb_offset(mirror), SbReadFlags::default())
                .with_context(|| format!("mirror {mirror} is not usable"))?;
            write_one_super(&dev, &sb, btrfs_sb_offset(0))?;
            dev.flush()?;
            println!("using superblock mirror {mirror}");
            Ok(ExitCode::SUCCESS)
        }
        Command::ZeroLog { path } => {
            let dev = Device::open(&path, true)?;
            let mut sb = read_super(&dev, btrfs_sb_offset(0), SbReadFlags::default())?;
            let log_root = sb.log_root;
            let log_level = sb.log_root_level;
            println!("clearing log_root {log_root} level {log_level}");
            sb.log_root = 0;
            sb.log_root_level = 0;
            for m in 0..BTRFS_SUPER_MIRROR_MAX {
                let offset = btrfs_sb_offset(m);
                if offset + BTRFS_SUPER_INFO_SIZE as u64 <= dev.total_bytes {
                    write_one_super(&dev, &sb, offset)?;
                }
            }
            dev.flush()?;
            Ok(ExitCode::SUCCESS)
        }
        Command::CalcSize { verbose, path } => {
            let mut fs = open_ro(std::slice::from_ref(&path))?;
            btrfs_kit::calc_size::calc_size(&mut fs, verbose)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Restore {
            snapshots,
            verbose,
            metadata,
            tree,
            path,
            target,
        } => {
            let mut fs = open_ro(std::slice::from_ref(&path))?;
            let opts = restore::RestoreOptions {
                snapshots,
                metadata,
                verbose,
                overwrite: true,
            };
            let stats = restore::restore(&mut fs, tree, &target, &opts)?;
            if stats.errors > 0 {
                return Ok(ExitCode::from(2));
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Scrub { repair, paths } => {
            let mut registry = Registry::new();
            let refs: Vec<&std::path::Path> = paths.iter().map(|p| p.as_path()).collect();
            let mut fs = open_fs(
                &mut registry,
                &refs,
                OpenFlags {
                    writable: repair,
                    ..Default::default()
                },
            )?;
            let progress = scrub::scrub(&mut fs, repair)?;
            println!("tree bytes scrubbed: {}", progress.tree_bytes_scrubbed);
            println!("data bytes scrubbed: {}", progress.data_bytes_scrubbed);
            println!("read errors: {}", progress.read_errors);
            println!("csum errors: {}", progress.csum_errors);
            println!("verify errors: {}", progress.verify_errors);
            println!("sectors without csum: {}", progress.csum_discards);
            println!("corrected: {}", progress.corrected_errors);
            println!("uncorrectable: {}", progress.uncorrectable_errors);
            if progress.uncorrectable_errors > 0 {
                return Ok(ExitCode::from(3));
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Mkfs {
            label,
            metadata,
            data,
            paths,
        } => {
            let mut cfg = mkfs::MkfsConfig::new(paths);
            cfg.label = label;
            cfg.metadata_profile = profile_flags(&metadata)?;
            cfg.data_profile = profile_flags(&data)?;
            mkfs::make_filesystem(&cfg)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Convert {
            no_datacsum,
            no_label,
            rollback,
            path,
        } => {
            if rollback {
                convert::rollback(&path)?;
                return Ok(ExitCode::SUCCESS);
            }
            let mut source = btrfs_kit::source_ext2::Ext2Fs::open(&path)?;
            let opts = convert::ConvertOptions {
                datacsum: !no_datacsum,
                copy_label: !no_label,
            };
            convert::convert(&path, &mut source, &opts)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            if e.downcast_ref::<BtrfsError>()
                .map(|b| matches!(b, BtrfsError::InvalidArgument(_)))
                .unwrap_or(false)
            {
                ExitCode::from(1)
            } else {
                ExitCode::from(2)
            }
        }
    }
}
