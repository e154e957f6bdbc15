use crate::csum::csum_data;
use crate::device::DeviceSet;
use crate::error::{BtrfsError, Result};
use crate::raid56;
use crate::structures::*;
use crate::volumes::{map_block, num_copies, ChunkMap, MapOp};

use log::{debug, warn};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// In-memory image of one tree block. Refcounted through the cache; a dirty
/// buffer stays pinned until the transaction that dirtied it commits.
pub struct ExtentBuffer {
    pub bytenr: u64,
    pub data: Vec<u8>,
    pub uptodate: bool,
    pub dirty: bool,
    /// set when the one-shot transid override accepted this buffer
    pub flagged_bad_transid: bool,
}

pub type EbRef = Rc<RefCell<ExtentBuffer>>;

impl ExtentBuffer {
    pub fn header(&self) -> btrfs_header {
        read_struct(&self.data, 0)
    }

    pub fn set_header(&mut self, hdr: &btrfs_header) {
        write_struct(&mut self.data, 0, hdr);
    }

    pub fn level(&self) -> u8 {
        self.header().level
    }

    pub fn nritems(&self) -> u32 {
        self.header().nritems
    }

    pub fn generation(&self) -> u64 {
        self.header().generation
    }

    pub fn owner(&self) -> u64 {
        self.header().owner
    }

    pub fn set_nritems(&mut self, nritems: u32) {
        let mut hdr = self.header();
        hdr.nritems = nritems;
        self.set_header(&hdr);
    }

    pub fn key_ptr(&self, slot: usize) -> btrfs_key_ptr {
        assert!(slot < self.nritems() as usize);
        read_struct(
            &self.data,
            BTRFS_HEADER_SIZE + slot * std::mem::size_of::<btrfs_key_ptr>(),
        )
    }

    pub fn set_key_ptr(&mut self, slot: usize, ptr: &btrfs_key_ptr) {
        write_struct(
            &mut self.data,
            BTRFS_HEADER_SIZE + slot * std::mem::size_of::<btrfs_key_ptr>(),
            ptr,
        );
    }

    pub fn item(&self, slot: usize) -> btrfs_item {
        assert!(slot < self.nritems() as usize);
        read_struct(
            &self.data,
            BTRFS_HEADER_SIZE + slot * std::mem::size_of::<btrfs_item>(),
        )
    }

    pub fn set_item(&mut self, slot: usize, item: &btrfs_item) {
        write_struct(
            &mut self.data,
            BTRFS_HEADER_SIZE + slot * std::mem::size_of::<btrfs_item>(),
            item,
        );
    }

    pub fn key(&self, slot: usize) -> btrfs_disk_key {
        if self.level() == 0 {
            self.item(slot).key
        } else {
            self.key_ptr(slot).key
        }
    }

    /// item payloads sit after the header, addressed by item.offset
    pub fn item_data(&self, slot: usize) -> Vec<u8> {
        let item = self.item(slot);
        let start = BTRFS_HEADER_SIZE + item.offset as usize;
        self.data[start..start + item.size as usize].to_vec()
    }

    pub fn write_item_data(&mut self, slot: usize, payload: &[u8]) {
        let item = self.item(slot);
        assert!(payload.len() <= item.size as usize);
        let start = BTRFS_HEADER_SIZE + item.offset as usize;
        self.data[start..start + payload.len()].copy_from_slice(payload);
    }

    pub fn read_item_struct<T: Copy>(&self, slot: usize, off: usize) -> T {
        let item = self.item(slot);
        assert!(off + std::mem::size_of::<T>() <= item.size as usize);
        read_struct(&self.data, BTRFS_HEADER_SIZE + item.offset as usize + off)
    }

    pub fn write_item_struct<T: Copy>(&mut self, slot: usize, off: usize, val: &T) {
        let item = self.item(slot);
        assert!(off + std::mem::size_of::<T>() <= item.size as usize);
        write_struct(
            &mut self.data,
            BTRFS_HEADER_SIZE + item.offset as usize + off,
            val,
        );
    }

    /// start of the packed payload area, where the leftmost data byte lives
    pub fn leaf_data_start(&self) -> usize {
        let n = self.nritems() as usize;
        if n == 0 {
            btrfs_leaf_data_size(self.data.len() as u32)
        } else {
            self.item(n - 1).offset as usize
        }
    }

    pub fn leaf_free_space(&self) -> i64 {
        let n = self.nritems() as usize;
        self.leaf_data_start() as i64 - (n * std::mem::size_of::<btrfs_item>()) as i64
    }
}

/// per-filesystem buffer cache keyed by bytenr
#[derive(Default)]
pub struct ExtentCache {
    map: HashMap<u64, EbRef>,
}

impl ExtentCache {
    pub fn new() -> ExtentCache {
        ExtentCache::default()
    }

    pub fn find_or_create(&mut self, bytenr: u64, len: usize) -> EbRef {
        if let Some(eb) = self.map.get(&bytenr) {
            return Rc::clone(eb);
        }
        let eb = Rc::new(RefCell::new(ExtentBuffer {
            bytenr,
            data: vec![0_u8; len],
            uptodate: false,
            dirty: false,
            flagged_bad_transid: false,
        }));
        self.map.insert(bytenr, Rc::clone(&eb));
        eb
    }

    pub fn lookup(&self, bytenr: u64) -> Option<EbRef> {
        self.map.get(&bytenr).map(Rc::clone)
    }

    pub fn remove(&mut self, bytenr: u64) {
        self.map.remove(&bytenr);
    }

    /// buffers awaiting the commit write-out, lowest bytenr first
    pub fn dirty_bytenrs(&self) -> Vec<u64> {
        let mut v: Vec<u64> = self
            .map
            .iter()
            .filter(|(_, eb)| eb.borrow().dirty)
            .map(|(b, _)| *b)
            .collect();
        v.sort();
        v
    }

    /// drop clean unshared buffers; a dirty buffer held elsewhere is a bug
    pub fn shrink(&mut self) {
        self.map
            .retain(|_, eb| eb.borrow().dirty || Rc::strong_count(eb) > 1);
    }
}

/// raw logical-range read, reissued stripe by stripe
pub fn read_logical(
    devices: &DeviceSet,
    chunk_map: &ChunkMap,
    logical: u64,
    len: u64,
    mirror: u16,
) -> Result<Vec<u8>> {
    let mut out = vec![0_u8; len as usize];
    let mut done = 0_u64;
    while done < len {
        let m = map_block(chunk_map, MapOp::Read, logical + done, len - done, mirror)?;
        let seg = std::cmp::min(m.length, len - done);
        let stripe = &m.stripes[0];
        let dev = devices.get(stripe.devid).ok_or(BtrfsError::IoRead {
            devid: stripe.devid,
            offset: stripe.physical,
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        })?;
        dev.read_exact_at(
            &mut out[done as usize..(done + seg) as usize],
            stripe.physical,
        )?;
        done += seg;
    }
    Ok(out)
}

/// mirror-replicating logical write; parity profiles detour through the
/// full-stripe writer
pub fn write_logical(
    devices: &DeviceSet,
    chunk_map: &ChunkMap,
    logical: u64,
    data: &[u8],
) -> Result<()> {
    let len = data.len() as u64;
    let mut done = 0_u64;
    while done < len {
        let m = map_block(chunk_map, MapOp::Write, logical + done, len - done, 0)?;
        let seg = std::cmp::min(m.length, len - done);
        if let Some(raid_map) = &m.raid_map {
            write_full_stripe(
                devices,
                &m.stripes,
                raid_map,
                m.stripe_len,
                logical + done,
                &data[done as usize..(done + seg) as usize],
            )?;
        } else {
            for stripe in &m.stripes {
                let dev = devices.get(stripe.devid).ok_or(BtrfsError::IoWrite {
                    devid: stripe.devid,
                    offset: stripe.physical,
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                })?;
                dev.write_all_at(&data[done as usize..(done + seg) as usize], stripe.physical)?;
            }
        }
        done += seg;
    }
    Ok(())
}

/// Read-modify-write of one raid5/6 full stripe: overlay the new bytes on
/// the surviving data stripes, regenerate parity, write everything back.
fn write_full_stripe(
    devices: &DeviceSet,
    stripes: &[crate::volumes::MapStripe],
    raid_map: &[u64],
    stripe_len: u64,
    logical: u64,
    data: &[u8],
) -> Result<()> {
    let nparity = if raid_map.contains(&BTRFS_RAID6_Q_STRIPE) {
        2
    } else {
        1
    };
    let ndata = stripes.len() - nparity;

    let mut set: Vec<Option<Vec<u8>>> = Vec::with_capacity(stripes.len());
    for i in 0..ndata {
        let dev = devices.get(stripes[i].devid).ok_or(BtrfsError::IoRead {
            devid: stripes[i].devid,
            offset: stripes[i].physical,
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        })?;
        let mut buf = vec![0_u8; stripe_len as usize];
        dev.read_exact_at(&mut buf, stripes[i].physical)?;
        set.push(Some(buf));
    }
    for _ in 0..nparity {
        set.push(None);
    }

    // overlay the caller's bytes where their logical range intersects
    for (i, stripe_logical) in raid_map.iter().take(ndata).enumerate() {
        let stripe_end = stripe_logical + stripe_len;
        let data_end = logical + data.len() as u64;
        if logical >= stripe_end || data_end <= *stripe_logical {
            continue;
        }
        let from = std::cmp::max(logical, *stripe_logical);
        let to = std::cmp::min(data_end, stripe_end);
        let dst = set[i].as_mut().unwrap();
        dst[(from - stripe_logical) as usize..(to - stripe_logical) as usize]
            .copy_from_slice(&data[(from - logical) as usize..(to - logical) as usize]);
    }

    raid56::rebuild_raid56(&mut set, nparity)?;

    for (i, stripe) in stripes.iter().enumerate() {
        let dev = devices.get(stripe.devid).ok_or(BtrfsError::IoWrite {
            devid: stripe.devid,
            offset: stripe.physical,
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        })?;
        dev.write_all_at(set[i].as_ref().unwrap(), stripe.physical)?;
    }
    Ok(())
}

/// max key pointers an interior node can hold
pub fn max_node_items(nodesize: u32) -> u32 {
    (btrfs_leaf_data_size(nodesize) / std::mem::size_of::<btrfs_key_ptr>()) as u32
}

/// bytenr, level, item counts, owner and fsid all have to line up before a
/// block is believed
pub fn verify_tree_block(
    devices: &DeviceSet,
    eb: &ExtentBuffer,
    nodesize: u32,
) -> Result<()> {
    let hdr = eb.header();
    let hdr_bytenr = hdr.bytenr;
    if hdr_bytenr != eb.bytenr {
        return Err(BtrfsError::structural(
            eb.bytenr,
            format!("header claims bytenr {hdr_bytenr}"),
        ));
    }
    if hdr.level as usize >= BTRFS_MAX_LEVEL {
        return Err(BtrfsError::structural(
            eb.bytenr,
            format!("level {} too large", hdr.level),
        ));
    }
    let nritems = hdr.nritems;
    if hdr.level > 0 {
        if nritems == 0 {
            return Err(BtrfsError::structural(eb.bytenr, "empty interior node"));
        }
        if nritems > max_node_items(nodesize) {
            return Err(BtrfsError::structural(
                eb.bytenr,
                format!("node nritems {nritems} too large"),
            ));
        }
    } else if nritems as usize * std::mem::size_of::<btrfs_item>()
        > btrfs_leaf_data_size(nodesize)
    {
        return Err(BtrfsError::structural(
            eb.bytenr,
            format!("leaf nritems {nritems} too large"),
        ));
    }
    if !devices.fsid_allowed(&hdr.fsid) {
        return Err(BtrfsError::structural(
            eb.bytenr,
            "header fsid belongs to no known device set",
        ));
    }
    Ok(())
}

fn csum_ok(data: &[u8], csum_type: BtrfsCsumType) -> bool {
    let want: BtrfsCsum = data[..BTRFS_CSUM_SIZE].try_into().unwrap();
    csum_data(&data[BTRFS_CSUM_SIZE..], csum_type) == want
}

/// Checksum-verified, mirror-retrying tree block read. The best structurally
/// valid copy seen is kept as a fallback: when every mirror fails the
/// transid expectation we accept the newest copy once and flag it.
#[allow(clippy::too_many_arguments)]
pub fn read_tree_block(
    devices: &DeviceSet,
    chunk_map: &ChunkMap,
    cache: &mut ExtentCache,
    csum_type: BtrfsCsumType,
    nodesize: u32,
    bytenr: u64,
    expected_generation: Option<u64>,
) -> Result<EbRef> {
    if bytenr % nodesize as u64 != 0 {
        return Err(BtrfsError::InvalidArgument(format!(
            "tree block bytenr {bytenr} not aligned to nodesize"
        )));
    }
    let eb = cache.find_or_create(bytenr, nodesize as usize);
    if eb.borrow().uptodate {
        return Ok(eb);
    }

    let copies = num_copies(chunk_map, bytenr)?;
    let mut fallback: Option<(u64, Vec<u8>)> = None;
    let mut last_err: Option<BtrfsError> = None;

    for mirror in 1..=copies {
        let data = match read_logical(devices, chunk_map, bytenr, nodesize as u64, mirror) {
            Ok(d) => d,
            Err(e) => {
                debug!("tree block {bytenr} mirror {mirror}: {e}");
                last_err = Some(e);
                continue;
            }
        };
        if !csum_ok(&data, csum_type) {
            debug!("tree block {bytenr} mirror {mirror}: checksum mismatch");
            last_err = Some(BtrfsError::BadChecksum { bytenr, mirror });
            continue;
        }
        {
            let mut b = eb.borrow_mut();
            b.data = data.clone();
            if let Err(e) = verify_tree_block(devices, &b, nodesize) {
                debug!("tree block {bytenr} mirror {mirror}: {e}");
                last_err = Some(e);
                continue;
            }
        }
        let found_gen = eb.borrow().generation();
        if let Some(wanted) = expected_generation {
            if found_gen != wanted {
                debug!(
                    "tree block {bytenr} mirror {mirror}: transid {found_gen}, wanted {wanted}"
                );
                match &fallback {
                    Some((g, _)) if *g >= found_gen => {}
                    _ => fallback = Some((found_gen, data)),
                }
                last_err = Some(BtrfsError::BadTransid {
                    bytenr,
                    found: found_gen,
                    wanted,
                });
                continue;
            }
        }
        let mut b = eb.borrow_mut();
        b.uptodate = true;
        b.flagged_bad_transid = false;
        return Ok(eb.clone());
    }

    if let Some((gen, data)) = fallback {
        let wanted = expected_generation.unwrap_or(0);
        warn!("tree block {bytenr}: accepting generation {gen}, wanted {wanted}");
        let mut b = eb.borrow_mut();
        if b.flagged_bad_transid {
            // the one-shot override was already spent on this buffer
            return Err(BtrfsError::BadTransid {
                bytenr,
                found: gen,
                wanted,
            });
        }
        b.data = data;
        b.uptodate = true;
        b.flagged_bad_transid = true;
        drop(b);
        return Ok(eb);
    }

    cache.remove(bytenr);
    Err(last_err.unwrap_or(BtrfsError::NotFound))
}

/// stamp the written flag and checksum, then replicate to every mirror
pub fn write_tree_block(
    devices: &DeviceSet,
    chunk_map: &ChunkMap,
    csum_type: BtrfsCsumType,
    eb: &mut ExtentBuffer,
) -> Result<()> {
    let mut hdr = eb.header();
    hdr.flags |= BTRFS_HEADER_FLAG_WRITTEN;
    eb.set_header(&hdr);
    let cs = csum_data(&eb.data[BTRFS_CSUM_SIZE..], csum_type);
    eb.data[..BTRFS_CSUM_SIZE].copy_from_slice(&cs);
    write_logical(devices, chunk_map, eb.bytenr, &eb.data)?;
    eb.dirty = false;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_leaf(bytenr: u64, nodesize: u32) -> ExtentBuffer {
        let mut eb = ExtentBuffer {
            bytenr,
            data: vec![0_u8; nodesize as usize],
            uptodate: true,
            dirty: false,
            flagged_bad_transid: false,
        };
        let mut hdr = eb.header();
        hdr.bytenr = bytenr;
        hdr.level = 0;
        hdr.nritems = 0;
        eb.set_header(&hdr);
        eb
    }

    #[test]
    fn free_space_of_empty_leaf() {
        let eb = empty_leaf(16384, 16384);
        assert_eq!(eb.leaf_free_space(), (16384 - BTRFS_HEADER_SIZE) as i64);
    }

    #[test]
    fn cache_returns_same_buffer() {
        let mut cache = ExtentCache::new();
        let a = cache.find_or_create(16384, 16384);
        let b = cache.find_or_create(16384, 16384);
        assert!(Rc::ptr_eq(&a, &b));
        a.borrow_mut().dirty = true;
        assert_eq!(cache.dirty_bytenrs(), vec![16384]);
    }

    #[test]
    fn shrink_keeps_dirty() {
        let mut cache = ExtentCache::new();
        {
            let a = cache.find_or_create(16384, 4096);
            a.borrow_mut().dirty = true;
        }
        {
            let _b = cache.find_or_create(32768, 4096);
        }
        cache.shrink();
        assert!(cache.lookup(16384).is_some());
        assert!(cache.lookup(32768).is_none());
    }
}
