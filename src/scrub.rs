//! Offline scrub: walk every block group, verify each copy of every extent,
//! and optionally write repairs back. Mirror profiles repair from a good
//! copy, parity profiles reconstruct through P/Q.

use crate::csum::{csum_data, csum_size};
use crate::ctree::{self};
use crate::error::{BtrfsError, Result};
use crate::extent_io::read_logical;
use crate::fs::FsInfo;
use crate::inode::lookup_data_csum;
use crate::raid56;
use crate::structures::*;
use crate::volumes::{map_block, num_copies, MapOp, RaidProfile};

use log::{info, warn};

#[derive(Default, Clone, Copy, PartialEq, Eq, Debug)]
pub struct ScrubProgress {
    pub tree_extents_scrubbed: u64,
    pub data_extents_scrubbed: u64,
    pub tree_bytes_scrubbed: u64,
    pub data_bytes_scrubbed: u64,
    pub read_errors: u64,
    pub csum_errors: u64,
    pub verify_errors: u64,
    pub csum_discards: u64,
    pub corrected_errors: u64,
    pub uncorrectable_errors: u64,
}

impl ScrubProgress {
    pub fn has_findings(&self) -> bool {
        self.read_errors + self.csum_errors + self.verify_errors + self.uncorrectable_errors > 0
    }
}

struct ExtentSpan {
    bytenr: u64,
    num_bytes: u64,
    is_tree: bool,
}

/// data/metadata extents inside one block group
fn extents_in_range(fs: &mut FsInfo, start: u64, len: u64) -> Result<Vec<ExtentSpan>> {
    let mut out = Vec::new();
    let mut extent_root = fs.root(BTRFS_EXTENT_TREE_OBJECTID)?;
    let key = btrfs_disk_key::new(start, BtrfsItemType::EXTENT_ITEM, 0);
    let (mut path, _) = ctree::search_slot(fs, None, &mut extent_root, &key, 0, false)?;
    loop {
        let leaf = path.leaf();
        let slot = path.slot();
        if slot >= leaf.borrow().nritems() as usize {
            if !ctree::next_leaf(fs, &extent_root, &mut path)? {
                break;
            }
            continue;
        }
        let k = leaf.borrow().key(slot);
        if k.objectid >= start + len {
            break;
        }
        if k.item_type == BtrfsItemType::EXTENT_ITEM && k.objectid >= start {
            let rec = crate::extent_tree::ExtentRec::decode(&leaf.borrow().item_data(slot))?;
            out.push(ExtentSpan {
                bytenr: k.objectid,
                num_bytes: k.offset,
                is_tree: rec.flags & BTRFS_EXTENT_FLAG_TREE_BLOCK != 0,
            });
        }
        if !ctree::next_item(fs, &extent_root, &mut path)? {
            break;
        }
    }
    Ok(out)
}

/// write one logical range to one specific mirror
fn write_mirror(fs: &FsInfo, logical: u64, data: &[u8], mirror: u16) -> Result<()> {
    let mut done = 0_u64;
    let len = data.len() as u64;
    while done < len {
        let m = map_block(&fs.chunk_map, MapOp::Read, logical + done, len - done, mirror)?;
        let seg = std::cmp::min(m.length, len - done);
        let stripe = &m.stripes[0];
        let dev = fs
            .devices
            .get(stripe.devid)
            .ok_or_else(|| BtrfsError::corrupt(format!("devid {} missing", stripe.devid)))?;
        dev.write_all_at(&data[done as usize..(done + seg) as usize], stripe.physical)?;
        done += seg;
    }
    Ok(())
}

fn tree_block_ok(fs: &FsInfo, bytenr: u64, data: &[u8]) -> bool {
    let want: BtrfsCsum = data[..BTRFS_CSUM_SIZE].try_into().unwrap();
    if csum_data(&data[BTRFS_CSUM_SIZE..], fs.csum_type()) != want {
        return false;
    }
    let hdr: btrfs_header = read_struct(data, 0);
    let hdr_bytenr = hdr.bytenr;
    hdr_bytenr == bytenr
}

/// verdict for one mirror of one extent: which sectors failed
fn check_data_mirror(
    fs: &mut FsInfo,
    span: &ExtentSpan,
    data: &[u8],
    progress: &mut ScrubProgress,
    count_discards: bool,
) -> Result<Vec<usize>> {
    let sectorsize = fs.sectorsize() as usize;
    let csize = csum_size(fs.csum_type());
    let mut bad = Vec::new();
    for (i, sector) in data.chunks(sectorsize).enumerate() {
        let bytenr = span.bytenr + (i * sectorsize) as u64;
        match lookup_data_csum(fs, bytenr)? {
            Some(want) => {
                let got = csum_data(sector, fs.csum_type());
                progress.data_bytes_scrubbed += sectorsize as u64;
                if got[..csize] != want[..] {
                    progress.csum_errors += 1;
                    bad.push(i);
                }
            }
            None => {
                if count_discards {
                    progress.csum_discards += 1;
                }
            }
        }
    }
    Ok(bad)
}

fn scrub_mirror_extent(
    fs: &mut FsInfo,
    span: &ExtentSpan,
    write: bool,
    progress: &mut ScrubProgress,
) -> Result<()> {
    let copies = num_copies(&fs.chunk_map, span.bytenr)?;
    let sectorsize = fs.sectorsize() as usize;
    let mut mirrors: Vec<Option<Vec<u8>>> = Vec::new();
    let mut bad_sectors: Vec<Vec<usize>> = Vec::new();

    for mirror in 1..=copies {
        match read_logical(&fs.devices, &fs.chunk_map, span.bytenr, span.num_bytes, mirror) {
            Ok(data) => {
                if span.is_tree {
                    progress.tree_bytes_scrubbed += span.num_bytes;
                    if tree_block_ok(fs, span.bytenr, &data) {
                        bad_sectors.push(Vec::new());
                    } else {
                        progress.csum_errors += 1;
                        bad_sectors.push(vec![0]);
                    }
                } else {
                    let bad = check_data_mirror(fs, span, &data, progress, mirror == 1)?;
                    bad_sectors.push(bad);
                }
                mirrors.push(Some(data));
            }
            Err(e) => {
                warn!("read error on extent {} mirror {mirror}: {e}", span.bytenr);
                progress.read_errors += 1;
                mirrors.push(None);
                bad_sectors.push(Vec::new());
            }
        }
    }
    if span.is_tree {
        progress.tree_extents_scrubbed += 1;
    } else {
        progress.data_extents_scrubbed += 1;
    }

    // tree blocks verify as a unit, data per sector
    let nsectors = if span.is_tree {
        1
    } else {
        (span.num_bytes as usize).div_ceil(sectorsize)
    };
    let mut unrecoverable = false;
    for sector in 0..nsectors {
        let good = (0..copies as usize).find(|m| {
            mirrors[*m].is_some() && !bad_sectors[*m].contains(&sector)
        });
        let any_bad = (0..copies as usize)
            .any(|m| mirrors[m].is_none() || bad_sectors[m].contains(&sector));
        match (good, any_bad) {
            (Some(_), false) => {}
            (Some(g), true) => {
                if write {
                    // per-sector rewrite of every failing copy
                    let (from, to) = if span.is_tree {
                        (0, span.num_bytes as usize)
                    } else {
                        (
                            sector * sectorsize,
                            ((sector + 1) * sectorsize).min(span.num_bytes as usize),
                        )
                    };
                    let good_data = mirrors[g].as_ref().unwrap()[from..to].to_vec();
                    for m in 0..copies as usize {
                        let failing =
                            mirrors[m].is_none() || bad_sectors[m].contains(&sector);
                        if failing {
                            write_mirror(
                                fs,
                                span.bytenr + from as u64,
                                &good_data,
                                (m + 1) as u16,
                            )?;
                            progress.corrected_errors += 1;
                        }
                    }
                }
            }
            (None, _) => {
                unrecoverable = true;
            }
        }
    }
    if unrecoverable {
        progress.uncorrectable_errors += 1;
        info!(
            "extent {} ({} bytes): unrecoverable, no good copy left",
            span.bytenr, span.num_bytes
        );
    }
    Ok(())
}

/// sectors of one rebuilt data stripe checked against the csum tree, plus
/// whole tree blocks inside the stripe
fn verify_stripe_content(
    fs: &mut FsInfo,
    spans: &[ExtentSpan],
    stripe_logical: u64,
    stripe_len: u64,
    data: &[u8],
    progress: &mut ScrubProgress,
    count: bool,
) -> Result<bool> {
    let mut ok = true;
    for span in spans {
        let from = span.bytenr.max(stripe_logical);
        let to = (span.bytenr + span.num_bytes).min(stripe_logical + stripe_len);
        if from >= to {
            continue;
        }
        if span.is_tree {
            if span.bytenr >= stripe_logical && span.bytenr + span.num_bytes <= stripe_logical + stripe_len {
                let off = (span.bytenr - stripe_logical) as usize;
                let block = &data[off..off + span.num_bytes as usize];
                if count {
                    progress.tree_bytes_scrubbed += span.num_bytes;
                }
                if !tree_block_ok(fs, span.bytenr, block) {
                    if count {
                        progress.csum_errors += 1;
                    }
                    ok = false;
                }
            }
            continue;
        }
        let sectorsize = fs.sectorsize() as u64;
        let csize = csum_size(fs.csum_type());
        let mut bytenr = from;
        while bytenr < to {
            let off = (bytenr - stripe_logical) as usize;
            let sector = &data[off..off + sectorsize as usize];
            match lookup_data_csum(fs, bytenr)? {
                Some(want) => {
                    if count {
                        progress.data_bytes_scrubbed += sectorsize;
                    }
                    if csum_data(sector, fs.csum_type())[..csize] != want[..] {
                        if count {
                            progress.csum_errors += 1;
                        }
                        ok = false;
                    }
                }
                None => {
                    if count {
                        progress.csum_discards += 1;
                    }
                }
            }
            bytenr += sectorsize;
        }
    }
    Ok(ok)
}

/// One raid5/6 full stripe: read the whole set, reconstruct what is
/// missing, cross-check data against checksums, and rewrite whatever the
/// single allowed recovery pass fixed.
#[allow(clippy::too_many_arguments)]
fn scrub_full_stripe(
    fs: &mut FsInfo,
    spans: &[ExtentSpan],
    logical: u64,
    nparity: usize,
    write: bool,
    progress: &mut ScrubProgress,
) -> Result<()> {
    let m = map_block(&fs.chunk_map, MapOp::Read, logical, 1, 2)?;
    let raid_map = m
        .raid_map
        .clone()
        .ok_or_else(|| BtrfsError::corrupt("parity profile without raid map"))?;
    let stripe_len = m.stripe_len;
    let total = m.stripes.len();
    let ndata = total - nparity;

    // read phase: device loss shows up as a missing stripe
    let mut set: Vec<Option<Vec<u8>>> = Vec::with_capacity(total);
    for stripe in &m.stripes {
        let dev = fs.devices.get(stripe.devid);
        let data = dev.and_then(|d| {
            let mut buf = vec![0_u8; stripe_len as usize];
            d.read_exact_at(&mut buf, stripe.physical).ok().map(|_| buf)
        });
        if data.is_none() {
            progress.read_errors += 1;
        }
        set.push(data);
    }
    let missing = set.iter().filter(|s| s.is_none()).count();
    if missing > nparity {
        progress.uncorrectable_errors += 1;
        info!("full stripe {logical}: {missing} stripes lost, beyond parity");
        return Ok(());
    }
    let mut recovered = missing > 0;
    if recovered {
        raid56::rebuild_raid56(&mut set, nparity)?;
    }

    // csum phase against the reconstructed data
    let mut bad_data: Vec<usize> = Vec::new();
    for i in 0..ndata {
        let ok = verify_stripe_content(
            fs,
            spans,
            raid_map[i],
            stripe_len,
            set[i].as_ref().unwrap(),
            progress,
            true,
        )?;
        if !ok {
            bad_data.push(i);
        }
    }
    let parity_ok = raid56::verify_parity(&set, nparity);

    if bad_data.is_empty() && parity_ok {
        return Ok(());
    }
    if bad_data.is_empty() && !parity_ok {
        // data is fine, parity is stale: regenerate
        progress.verify_errors += 1;
        if write {
            for s in set.iter_mut().skip(ndata) {
                *s = None;
            }
            raid56::rebuild_raid56(&mut set, nparity)?;
            write_stripe_set(fs, &m.stripes, &set)?;
            progress.corrected_errors += 1;
        }
        return Ok(());
    }

    // data stripes failed their csums: one recovery pass through parity
    if recovered || bad_data.len() > nparity {
        progress.uncorrectable_errors += 1;
        info!(
            "full stripe {logical}: {} bad data stripes, recovery exhausted",
            bad_data.len()
        );
        return Ok(());
    }
    recovered = true;
    let _ = recovered;
    for i in &bad_data {
        set[*i] = None;
    }
    raid56::rebuild_raid56(&mut set, nparity)?;
    for i in &bad_data {
        let ok = verify_stripe_content(
            fs,
            spans,
            raid_map[*i],
            stripe_len,
            set[*i].as_ref().unwrap(),
            progress,
            false,
        )?;
        if !ok {
            progress.uncorrectable_errors += 1;
            info!("full stripe {logical}: reconstruction still fails checksums");
            return Ok(());
        }
    }
    if write {
        write_stripe_set(fs, &m.stripes, &set)?;
        progress.corrected_errors += bad_data.len() as u64;
        info!("full stripe {logical}: repaired {} stripes", bad_data.len());
    } else {
        info!("full stripe {logical}: recoverable");
    }
    Ok(())
}

fn write_stripe_set(
    fs: &FsInfo,
    stripes: &[crate::volumes::MapStripe],
    set: &[Option<Vec<u8>>],
) -> Result<()> {
    for (i, stripe) in stripes.iter().enumerate() {
        let dev = fs
            .devices
            .get(stripe.devid)
            .ok_or_else(|| BtrfsError::corrupt(format!("devid {} missing", stripe.devid)))?;
        dev.write_all_at(set[i].as_ref().unwrap(), stripe.physical)?;
    }
    Ok(())
}

/// scrub every block group of the pool
pub fn scrub(fs: &mut FsInfo, write: bool) -> Result<ScrubProgress> {
    let mut progress = ScrubProgress::default();
    let groups: Vec<(u64, u64, u64)> = fs
        .block_groups
        .groups
        .values()
        .map(|g| (g.start, g.length, g.flags))
        .collect();

    for (start, length, flags) in groups {
        let spans = extents_in_range(fs, start, length)?;
        let profile = RaidProfile::from_flags(flags);
        match profile {
            RaidProfile::Raid5 | RaidProfile::Raid6 => {
                let nparity = profile.nparity() as usize;
                let chunk = fs
                    .chunk_map
                    .lookup(start)
                    .ok_or_else(|| BtrfsError::corrupt(format!("block group {start} unmapped")))?;
                let data_stripes = chunk.nr_data_stripes() as u64;
                let full_len = data_stripes * chunk.stripe_len;
                let mut logical = start;
                while logical + full_len <= start + length {
                    let in_use = spans
                        .iter()
                        .any(|s| s.bytenr < logical + full_len && s.bytenr + s.num_bytes > logical);
                    if in_use {
                        scrub_full_stripe(fs, &spans, logical, nparity, write, &mut progress)?;
                    }
                    logical += full_len;
                }
            }
            _ => {
                for span in &spans {
                    scrub_mirror_extent(fs, span, write, &mut progress)?;
                }
            }
        }
    }
    info!(
        "scrub done: {} tree bytes, {} data bytes, {} csum errors, {} uncorrectable",
        progress.tree_bytes_scrubbed,
        progress.data_bytes_scrubbed,
        progress.csum_errors,
        progress.uncorrectable_errors
    );
    Ok(progress)
}
