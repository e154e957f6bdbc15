use crate::error::{BtrfsError, Result};
use crate::structures::*;

use log::debug;
use more_asserts::*;
use std::collections::{BTreeMap, HashMap};

/// RAID layout of one chunk. The numeric flags live on disk; everything in
/// here switches on this enum instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RaidProfile {
    Single,
    Dup,
    Raid0,
    Raid1,
    Raid10,
    Raid5,
    Raid6,
}

impl RaidProfile {
    pub fn from_flags(flags: u64) -> RaidProfile {
        if flags & BTRFS_BLOCK_GROUP_RAID0 != 0 {
            RaidProfile::Raid0
        } else if flags & BTRFS_BLOCK_GROUP_RAID1 != 0 {
            RaidProfile::Raid1
        } else if flags & BTRFS_BLOCK_GROUP_DUP != 0 {
            RaidProfile::Dup
        } else if flags & BTRFS_BLOCK_GROUP_RAID10 != 0 {
            RaidProfile::Raid10
        } else if flags & BTRFS_BLOCK_GROUP_RAID5 != 0 {
            RaidProfile::Raid5
        } else if flags & BTRFS_BLOCK_GROUP_RAID6 != 0 {
            RaidProfile::Raid6
        } else {
            RaidProfile::Single
        }
    }

    pub fn to_flags(self) -> u64 {
        match self {
            RaidProfile::Single => 0,
            RaidProfile::Dup => BTRFS_BLOCK_GROUP_DUP,
            RaidProfile::Raid0 => BTRFS_BLOCK_GROUP_RAID0,
            RaidProfile::Raid1 => BTRFS_BLOCK_GROUP_RAID1,
            RaidProfile::Raid10 => BTRFS_BLOCK_GROUP_RAID10,
            RaidProfile::Raid5 => BTRFS_BLOCK_GROUP_RAID5,
            RaidProfile::Raid6 => BTRFS_BLOCK_GROUP_RAID6,
        }
    }

    pub fn nparity(self) -> u16 {
        match self {
            RaidProfile::Raid5 => 1,
            RaidProfile::Raid6 => 2,
            _ => 0,
        }
    }
}

#[derive(Clone)]
pub struct ChunkStripe {
    pub devid: u64,
    pub physical: u64,
    pub dev_uuid: BtrfsUuid,
}

/// in-memory image of one chunk item
#[derive(Clone)]
pub struct ChunkMapping {
    pub logical: u64,
    pub length: u64,
    pub type_flags: u64,
    pub stripe_len: u64,
    pub num_stripes: u16,
    pub sub_stripes: u16,
    pub stripes: Vec<ChunkStripe>,
}

impl ChunkMapping {
    pub fn profile(&self) -> RaidProfile {
        RaidProfile::from_flags(self.type_flags)
    }

    pub fn nr_data_stripes(&self) -> u16 {
        self.num_stripes - self.profile().nparity()
    }

    pub fn end(&self) -> u64 {
        self.logical + self.length
    }

    /// bytes each member device contributes
    pub fn stripe_size(&self) -> u64 {
        match self.profile() {
            RaidProfile::Single | RaidProfile::Dup | RaidProfile::Raid1 => self.length,
            RaidProfile::Raid0 => self.length / self.num_stripes as u64,
            RaidProfile::Raid10 => self.length / (self.num_stripes / self.sub_stripes) as u64,
            RaidProfile::Raid5 => self.length / (self.num_stripes - 1) as u64,
            RaidProfile::Raid6 => self.length / (self.num_stripes - 2) as u64,
        }
    }

    pub fn from_disk(logical: u64, chunk: &btrfs_chunk, stripes: Vec<btrfs_stripe>) -> ChunkMapping {
        ChunkMapping {
            logical,
            length: chunk.length,
            type_flags: chunk.r#type,
            stripe_len: chunk.stripe_len,
            num_stripes: chunk.num_stripes,
            sub_stripes: chunk.sub_stripes,
            stripes: stripes
                .iter()
                .map(|s| ChunkStripe {
                    devid: s.devid,
                    physical: s.offset,
                    dev_uuid: s.dev_uuid,
                })
                .collect(),
        }
    }

    pub fn to_disk(&self) -> (btrfs_chunk, Vec<btrfs_stripe>) {
        let chunk = btrfs_chunk {
            length: self.length,
            owner: BTRFS_EXTENT_TREE_OBJECTID,
            stripe_len: self.stripe_len,
            r#type: self.type_flags,
            io_align: self.stripe_len as u32,
            io_width: self.stripe_len as u32,
            sector_size: 4096,
            num_stripes: self.num_stripes,
            sub_stripes: self.sub_stripes,
        };
        let stripes = self
            .stripes
            .iter()
            .map(|s| btrfs_stripe {
                devid: s.devid,
                offset: s.physical,
                dev_uuid: s.dev_uuid,
            })
            .collect();
        (chunk, stripes)
    }
}

/// logical address space, an interval tree keyed by chunk start
#[derive(Default)]
pub struct ChunkMap {
    chunks: BTreeMap<u64, ChunkMapping>,
}

impl ChunkMap {
    pub fn new() -> ChunkMap {
        ChunkMap::default()
    }

    pub fn insert(&mut self, mapping: ChunkMapping) -> Result<()> {
        if let Some(prev) = self.lookup(mapping.logical) {
            return Err(BtrfsError::InvalidArgument(format!(
                "chunk at {} overlaps existing chunk at {}",
                mapping.logical, prev.logical
            )));
        }
        if let Some((start, _)) = self
            .chunks
            .range(mapping.logical..mapping.end())
            .next()
        {
            return Err(BtrfsError::InvalidArgument(format!(
                "chunk at {} overlaps existing chunk at {}",
                mapping.logical, start
            )));
        }
        self.chunks.insert(mapping.logical, mapping);
        Ok(())
    }

    pub fn remove(&mut self, logical: u64) -> Option<ChunkMapping> {
        self.chunks.remove(&logical)
    }

    pub fn lookup(&self, logical: u64) -> Option<&ChunkMapping> {
        self.chunks
            .range(..=logical)
            .next_back()
            .map(|(_, c)| c)
            .filter(|c| logical < c.end())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChunkMapping> {
        self.chunks.values()
    }

    /// highest mapped logical address plus one, used to place fresh chunks
    pub fn next_free_logical(&self) -> u64 {
        self.chunks
            .values()
            .next_back()
            .map(|c| c.end())
            .unwrap_or(0)
    }

    /// physical → logical, the direction scrub and rollback walk
    pub fn logical_of_physical(&self, devid: u64, physical: u64) -> Option<u64> {
        for chunk in self.chunks.values() {
            let stripe_size = chunk.stripe_size();
            for (i, stripe) in chunk.stripes.iter().enumerate() {
                if stripe.devid != devid
                    || physical < stripe.physical
                    || physical >= stripe.physical + stripe_size
                {
                    continue;
                }
                let stripe_nr = (physical - stripe.physical) / chunk.stripe_len;
                let stripe_off = (physical - stripe.physical) % chunk.stripe_len;
                let logical_stripe = match chunk.profile() {
                    RaidProfile::Single | RaidProfile::Dup | RaidProfile::Raid1 => {
                        return Some(chunk.logical + physical - stripe.physical);
                    }
                    RaidProfile::Raid0 => stripe_nr * chunk.num_stripes as u64 + i as u64,
                    RaidProfile::Raid10 => {
                        let factor = (chunk.num_stripes / chunk.sub_stripes) as u64;
                        stripe_nr * factor + (i as u64 / chunk.sub_stripes as u64)
                    }
                    RaidProfile::Raid5 | RaidProfile::Raid6 => {
                        // parity rotates; find this device's data slot on the
                        // full stripe, parity slots map to no logical byte
                        let data = chunk.nr_data_stripes() as u64;
                        let rot = stripe_nr % chunk.num_stripes as u64;
                        let slot =
                            (i as u64 + chunk.num_stripes as u64 - rot) % chunk.num_stripes as u64;
                        if slot >= data {
                            return None;
                        }
                        stripe_nr * data + slot
                    }
                };
                return Some(chunk.logical + logical_stripe * chunk.stripe_len + stripe_off);
            }
        }
        None
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum MapOp {
    Read,
    Write,
}

#[derive(Clone, Debug)]
pub struct MapStripe {
    pub devid: u64,
    pub physical: u64,
}

/// result of one map_block call, clipped to a single stripe unless the
/// profile requires the whole set
pub struct MultiMap {
    pub length: u64,
    pub type_flags: u64,
    pub stripe_len: u64,
    pub stripes: Vec<MapStripe>,
    /// logical address per returned stripe for raid5/6 writes and recovery;
    /// data stripes first, then the P and Q sentinels
    pub raid_map: Option<Vec<u64>>,
}

/// how many independent copies of a byte the profile stores
pub fn num_copies(map: &ChunkMap, logical: u64) -> Result<u16> {
    let chunk = map
        .lookup(logical)
        .ok_or_else(|| BtrfsError::corrupt(format!("logical {logical} not mapped")))?;
    Ok(match chunk.profile() {
        RaidProfile::Dup | RaidProfile::Raid1 => chunk.num_stripes,
        RaidProfile::Raid10 => chunk.sub_stripes,
        RaidProfile::Raid5 => 2,
        RaidProfile::Raid6 => 3,
        _ => 1,
    })
}

/// Translate a logical range to device stripes, following the original
/// stripe arithmetic profile by profile. `mirror` is 1-origin; 0 lets the
/// mapper pick. Returns the clipped length that fits one stripe.
pub fn map_block(
    map: &ChunkMap,
    op: MapOp,
    logical: u64,
    len: u64,
    mirror: u16,
) -> Result<MultiMap> {
    let chunk = map
        .lookup(logical)
        .ok_or_else(|| BtrfsError::corrupt(format!("logical {logical} not mapped")))?;
    let offset = logical - chunk.logical;
    let profile = chunk.profile();
    debug!(
        "map_block: logical {logical} len {len} profile {:?} mirror {mirror}",
        profile
    );

    /*
     * stripe_nr counts the total number of stripes we have to stride
     * to get to this block
     */
    let mut stripe_nr = offset / chunk.stripe_len;
    let stripe_offset = offset - stripe_nr * chunk.stripe_len;

    let mut length = match profile {
        RaidProfile::Single => chunk.length - offset,
        _ => std::cmp::min(chunk.length - offset, chunk.stripe_len - stripe_offset),
    };
    length = std::cmp::min(length, len.max(1));

    let mut stripe_index: usize;
    let mut nstripes = 1_usize;
    let mut raid_map = None;

    match profile {
        RaidProfile::Single => {
            stripe_index = (stripe_nr % chunk.num_stripes as u64) as usize;
            stripe_nr /= chunk.num_stripes as u64;
        }
        RaidProfile::Raid1 | RaidProfile::Dup => {
            if op == MapOp::Write {
                nstripes = chunk.num_stripes as usize;
                stripe_index = 0;
            } else if mirror > 0 {
                stripe_index = (mirror - 1) as usize;
            } else if profile == RaidProfile::Raid1 {
                stripe_index = (stripe_nr % chunk.num_stripes as u64) as usize;
            } else {
                stripe_index = 0;
            }
        }
        RaidProfile::Raid0 => {
            stripe_index = (stripe_nr % chunk.num_stripes as u64) as usize;
            stripe_nr /= chunk.num_stripes as u64;
        }
        RaidProfile::Raid10 => {
            let factor = (chunk.num_stripes / chunk.sub_stripes) as u64;
            stripe_index = ((stripe_nr % factor) * chunk.sub_stripes as u64) as usize;
            if op == MapOp::Write {
                nstripes = chunk.sub_stripes as usize;
            } else if mirror > 0 {
                stripe_index += (mirror - 1) as usize;
            }
            stripe_nr /= factor;
        }
        RaidProfile::Raid5 | RaidProfile::Raid6 => {
            let data = chunk.nr_data_stripes() as u64;
            if op == MapOp::Write || mirror > 1 {
                /* RAID[56] write or recovery. Return all stripes */
                let full_stripe_len = data * chunk.stripe_len;
                let full_start = (offset / full_stripe_len) * full_stripe_len;

                let fs_nr = full_start / chunk.stripe_len / data;
                let rot = (fs_nr % chunk.num_stripes as u64) as usize;

                let mut rmap = vec![0_u64; chunk.num_stripes as usize];
                let tmp = fs_nr * data;
                for i in 0..data as usize {
                    rmap[(i + rot) % chunk.num_stripes as usize] =
                        chunk.logical + (tmp + i as u64) * chunk.stripe_len;
                }
                rmap[(data as usize + rot) % chunk.num_stripes as usize] = BTRFS_RAID5_P_STRIPE;
                if profile == RaidProfile::Raid6 {
                    rmap[(data as usize + rot + 1) % chunk.num_stripes as usize] =
                        BTRFS_RAID6_Q_STRIPE;
                }

                length = chunk.stripe_len;
                stripe_index = 0;
                stripe_nr = fs_nr;
                nstripes = chunk.num_stripes as usize;
                raid_map = Some(rmap);

                let mut stripes = Vec::with_capacity(nstripes);
                for i in 0..nstripes {
                    stripes.push(MapStripe {
                        devid: chunk.stripes[i].devid,
                        physical: chunk.stripes[i].physical + stripe_nr * chunk.stripe_len,
                    });
                }
                let rmap = raid_map.as_mut().unwrap();
                sort_parity_stripes(&mut stripes, rmap);
                return Ok(MultiMap {
                    length,
                    type_flags: chunk.type_flags,
                    stripe_len: chunk.stripe_len,
                    stripes,
                    raid_map,
                });
            }
            /*
             * Mirror #0 or #1 means the original data block.
             * Mirror #2 is RAID5 parity block.
             * Mirror #3 is RAID6 Q block.
             */
            stripe_index = (stripe_nr % data) as usize;
            stripe_nr /= data;
            if mirror > 1 {
                stripe_index = data as usize + mirror as usize - 2;
            }
            stripe_index = ((stripe_nr + stripe_index as u64) % chunk.num_stripes as u64) as usize;
        }
    }
    assert_lt!(stripe_index, chunk.num_stripes as usize);

    let mut stripes = Vec::with_capacity(nstripes);
    for _ in 0..nstripes {
        stripes.push(MapStripe {
            devid: chunk.stripes[stripe_index].devid,
            physical: chunk.stripes[stripe_index].physical
                + stripe_offset
                + stripe_nr * chunk.stripe_len,
        });
        stripe_index += 1;
    }

    Ok(MultiMap {
        length,
        type_flags: chunk.type_flags,
        stripe_len: chunk.stripe_len,
        stripes,
        raid_map,
    })
}

/// data stripes sort by logical address below the P then Q sentinels
fn sort_parity_stripes(stripes: &mut [MapStripe], raid_map: &mut [u64]) {
    let mut order: Vec<usize> = (0..stripes.len()).collect();
    order.sort_by_key(|i| raid_map[*i]);
    let sorted_stripes: Vec<MapStripe> = order.iter().map(|i| stripes[*i].clone()).collect();
    let sorted_map: Vec<u64> = order.iter().map(|i| raid_map[*i]).collect();
    stripes.clone_from_slice(&sorted_stripes);
    raid_map.copy_from_slice(&sorted_map);
}

/// Physical allocations per device, rebuilt from the chunk map at open time
/// and consulted by the chunk allocator. The first megabyte and every
/// superblock mirror stay out of reach permanently.
#[derive(Default)]
pub struct DevAllocMap {
    allocated: HashMap<u64, BTreeMap<u64, u64>>,
}

impl DevAllocMap {
    pub fn new() -> DevAllocMap {
        DevAllocMap::default()
    }

    pub fn reserve(&mut self, devid: u64, physical: u64, len: u64) {
        let map = self.allocated.entry(devid).or_default();
        map.insert(physical, len);
    }

    pub fn release(&mut self, devid: u64, physical: u64) {
        if let Some(map) = self.allocated.get_mut(&devid) {
            map.remove(&physical);
        }
    }

    pub fn seed_from_chunks(&mut self, chunks: &ChunkMap) {
        for chunk in chunks.iter() {
            let stripe_size = chunk.stripe_size();
            for stripe in &chunk.stripes {
                self.reserve(stripe.devid, stripe.physical, stripe_size);
            }
        }
    }

    /// first-fit search skipping the reserved ranges
    pub fn find_free(&self, devid: u64, dev_total: u64, needed: u64) -> Option<u64> {
        let empty = BTreeMap::new();
        let map = self.allocated.get(&devid).unwrap_or(&empty);
        let mut cursor = BTRFS_DEVICE_RANGE_RESERVED;
        loop {
            // push past any superblock mirror the candidate would overlap
            let mut moved = true;
            while moved {
                moved = false;
                for mirror in 0..BTRFS_SUPER_MIRROR_MAX {
                    let sb_start = btrfs_sb_offset(mirror);
                    let sb_end = sb_start + BTRFS_STRIPE_LEN;
                    if cursor < sb_end && cursor + needed > sb_start {
                        cursor = sb_end;
                        moved = true;
                    }
                }
                for (start, len) in map.range(..cursor + needed) {
                    if start + len > cursor && *start < cursor + needed {
                        cursor = start + len;
                        moved = true;
                    }
                }
            }
            if cursor + needed > dev_total {
                return None;
            }
            // stable position means nothing overlaps
            return Some(cursor);
        }
    }

    pub fn bytes_allocated(&self, devid: u64) -> u64 {
        self.allocated
            .get(&devid)
            .map(|m| m.values().sum())
            .unwrap_or(0)
    }
}

/// per-type sizing policy for fresh chunks
pub struct ChunkPolicy {
    pub calc_size: u64,
    pub max_chunk_size: u64,
    pub min_stripe_size: u64,
}

pub fn chunk_policy(type_flags: u64) -> ChunkPolicy {
    if type_flags & BTRFS_BLOCK_GROUP_SYSTEM != 0 {
        ChunkPolicy {
            calc_size: 8 * 1024 * 1024,
            max_chunk_size: 16 * 1024 * 1024,
            min_stripe_size: 1024 * 1024,
        }
    } else if type_flags & BTRFS_BLOCK_GROUP_METADATA != 0 {
        ChunkPolicy {
            calc_size: 1024 * 1024 * 1024,
            max_chunk_size: 4 * 1024 * 1024 * 1024,
            min_stripe_size: 32 * 1024 * 1024,
        }
    } else {
        ChunkPolicy {
            calc_size: 1024 * 1024 * 1024,
            max_chunk_size: 10 * 1024 * 1024 * 1024,
            min_stripe_size: 64 * 1024 * 1024,
        }
    }
}

pub fn chunk_bytes_by_type(profile: RaidProfile, calc_size: u64, num_stripes: u16, sub_stripes: u16) -> u64 {
    match profile {
        RaidProfile::Single | RaidProfile::Dup | RaidProfile::Raid1 => calc_size,
        RaidProfile::Raid10 => calc_size * (num_stripes / sub_stripes) as u64,
        RaidProfile::Raid5 => calc_size * (num_stripes - 1) as u64,
        RaidProfile::Raid6 => calc_size * (num_stripes - 2) as u64,
        RaidProfile::Raid0 => calc_size * num_stripes as u64,
    }
}

/// A fully planned chunk: logical placement, per-device stripes and the
/// resulting length, ready to be committed to the trees.
pub struct ChunkPlan {
    pub mapping: ChunkMapping,
    pub stripe_size: u64,
}

/// Pick stripe counts and device extents for a new chunk of `type_flags`.
/// Pure planning: nothing is recorded until the caller commits the plan.
pub fn plan_chunk(
    devices: &[(u64, u64, BtrfsUuid)], // (devid, total_bytes, uuid)
    dev_alloc: &DevAllocMap,
    chunk_map: &ChunkMap,
    type_flags: u64,
    size_hint: Option<u64>,
) -> Result<ChunkPlan> {
    let profile = RaidProfile::from_flags(type_flags);
    let policy = chunk_policy(type_flags);
    let ndev = devices.len() as u16;

    let (mut num_stripes, sub_stripes): (u16, u16) = match profile {
        RaidProfile::Single => (1, 1),
        RaidProfile::Dup => (2, 1),
        RaidProfile::Raid1 => {
            if ndev < 2 {
                return Err(BtrfsError::InvalidArgument(
                    "raid1 needs at least 2 devices".into(),
                ));
            }
            (2, 1)
        }
        RaidProfile::Raid0 => {
            if ndev < 2 {
                return Err(BtrfsError::InvalidArgument(
                    "raid0 needs at least 2 devices".into(),
                ));
            }
            (ndev, 1)
        }
        RaidProfile::Raid10 => {
            if ndev < 4 {
                return Err(BtrfsError::InvalidArgument(
                    "raid10 needs at least 4 devices".into(),
                ));
            }
            ((ndev / 2) * 2, 2)
        }
        RaidProfile::Raid5 => {
            if ndev < 2 {
                return Err(BtrfsError::InvalidArgument(
                    "raid5 needs at least 2 devices".into(),
                ));
            }
            (ndev, 1)
        }
        RaidProfile::Raid6 => {
            if ndev < 3 {
                return Err(BtrfsError::InvalidArgument(
                    "raid6 needs at least 3 devices".into(),
                ));
            }
            (ndev, 1)
        }
    };

    let total_pool: u64 = devices.iter().map(|(_, t, _)| t).sum();
    let percent_max = total_pool / 10;
    let max_chunk = std::cmp::min(percent_max, policy.max_chunk_size);

    let mut calc_size = size_hint.unwrap_or(policy.calc_size);
    if chunk_bytes_by_type(profile, calc_size, num_stripes, sub_stripes) > max_chunk {
        calc_size = max_chunk / num_stripes as u64;
    }
    calc_size = std::cmp::max(calc_size, policy.min_stripe_size);
    calc_size = (calc_size / BTRFS_STRIPE_LEN) * BTRFS_STRIPE_LEN;

    // dup places both stripes on one device and needs room for both
    let min_free = if profile == RaidProfile::Dup {
        calc_size * 2
    } else {
        calc_size
    };

    // most-free devices first
    let mut ordered: Vec<(u64, u64, BtrfsUuid)> = devices.to_vec();
    ordered.sort_by_key(|d| d.1 - dev_alloc.bytes_allocated(d.0));
    ordered.reverse();

    let mut chosen: Vec<(u64, u64, BtrfsUuid)> = Vec::new();
    loop {
        chosen.clear();
        let mut shrink_to: Option<u64> = None;
        for (devid, total, uuid) in &ordered {
            if chosen.len() == num_stripes as usize {
                break;
            }
            match dev_alloc.find_free(*devid, *total, min_free) {
                Some(physical) => {
                    chosen.push((*devid, physical, *uuid));
                    if profile == RaidProfile::Dup && chosen.len() < num_stripes as usize {
                        // second copy immediately after the first
                        chosen.push((*devid, physical + calc_size, *uuid));
                    }
                }
                None => {
                    if let Some(free) = dev_alloc.find_free(*devid, *total, policy.min_stripe_size)
                    {
                        let avail = total - free;
                        shrink_to = Some(std::cmp::max(
                            shrink_to.unwrap_or(0),
                            (avail / BTRFS_STRIPE_LEN) * BTRFS_STRIPE_LEN,
                        ));
                    }
                }
            }
        }
        if chosen.len() == num_stripes as usize {
            break;
        }
        // fewer devices than planned: striped profiles can narrow
        let found = chosen.len() as u16;
        match profile {
            RaidProfile::Raid0 if found >= 2 => num_stripes = found,
            RaidProfile::Raid5 if found >= 2 => num_stripes = found,
            RaidProfile::Raid6 if found >= 3 => num_stripes = found,
            RaidProfile::Raid10 if found >= 4 => num_stripes = (found / 2) * 2,
            _ => {
                if let Some(smaller) = shrink_to {
                    if smaller >= policy.min_stripe_size && smaller < calc_size {
                        calc_size = smaller;
                        continue;
                    }
                }
                return Err(BtrfsError::NoSpace {
                    kind: "chunk",
                    needed: min_free,
                });
            }
        }
    }

    let length = chunk_bytes_by_type(profile, calc_size, num_stripes, sub_stripes);
    let logical = chunk_map.next_free_logical();
    let mapping = ChunkMapping {
        logical,
        length,
        type_flags,
        stripe_len: BTRFS_STRIPE_LEN,
        num_stripes,
        sub_stripes,
        stripes: chosen
            .into_iter()
            .map(|(devid, physical, dev_uuid)| ChunkStripe {
                devid,
                physical,
                dev_uuid,
            })
            .collect(),
    };
    Ok(ChunkPlan {
        mapping,
        stripe_size: calc_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_chunk(profile: RaidProfile, num_stripes: u16, sub_stripes: u16, length: u64) -> ChunkMap {
        let mut map = ChunkMap::new();
        let stripes = (0..num_stripes)
            .map(|i| ChunkStripe {
                devid: i as u64 + 1,
                physical: 1024 * 1024,
                dev_uuid: [i as u8; BTRFS_UUID_SIZE],
            })
            .collect();
        map.insert(ChunkMapping {
            logical: 1024 * 1024,
            length,
            type_flags: BTRFS_BLOCK_GROUP_DATA | profile.to_flags(),
            stripe_len: BTRFS_STRIPE_LEN,
            num_stripes,
            sub_stripes,
            stripes,
        })
        .unwrap();
        map
    }

    #[test]
    fn single_maps_linear() {
        let map = one_chunk(RaidProfile::Single, 1, 1, 16 * 1024 * 1024);
        let m = map_block(&map, MapOp::Read, 1024 * 1024 + 8192, 4096, 0).unwrap();
        assert_eq!(m.stripes.len(), 1);
        assert_eq!(m.stripes[0].devid, 1);
        assert_eq!(m.stripes[0].physical, 1024 * 1024 + 8192);
    }

    #[test]
    fn raid1_write_hits_all_mirrors() {
        let map = one_chunk(RaidProfile::Raid1, 2, 1, 16 * 1024 * 1024);
        let m = map_block(&map, MapOp::Write, 1024 * 1024, 4096, 0).unwrap();
        assert_eq!(m.stripes.len(), 2);
        assert_eq!(m.stripes[0].physical, m.stripes[1].physical);
        assert_ne!(m.stripes[0].devid, m.stripes[1].devid);
    }

    #[test]
    fn raid1_read_selects_mirror() {
        let map = one_chunk(RaidProfile::Raid1, 2, 1, 16 * 1024 * 1024);
        let m1 = map_block(&map, MapOp::Read, 1024 * 1024, 4096, 1).unwrap();
        let m2 = map_block(&map, MapOp::Read, 1024 * 1024, 4096, 2).unwrap();
        assert_eq!(m1.stripes[0].devid, 1);
        assert_eq!(m2.stripes[0].devid, 2);
    }

    #[test]
    fn raid0_strides_across_devices() {
        let map = one_chunk(RaidProfile::Raid0, 2, 1, 16 * 1024 * 1024);
        let a = map_block(&map, MapOp::Read, 1024 * 1024, 4096, 0).unwrap();
        let b = map_block(&map, MapOp::Read, 1024 * 1024 + BTRFS_STRIPE_LEN, 4096, 0).unwrap();
        let c = map_block(
            &map,
            MapOp::Read,
            1024 * 1024 + 2 * BTRFS_STRIPE_LEN,
            4096,
            0,
        )
        .unwrap();
        assert_eq!(a.stripes[0].devid, 1);
        assert_eq!(b.stripes[0].devid, 2);
        assert_eq!(c.stripes[0].devid, 1);
        assert_eq!(c.stripes[0].physical, a.stripes[0].physical + BTRFS_STRIPE_LEN);
    }

    #[test]
    fn read_clips_at_stripe_boundary() {
        let map = one_chunk(RaidProfile::Raid0, 2, 1, 16 * 1024 * 1024);
        let m = map_block(&map, MapOp::Read, 1024 * 1024 + 4096, 1 << 30, 0).unwrap();
        assert_eq!(m.length, BTRFS_STRIPE_LEN - 4096);
    }

    #[test]
    fn raid5_write_returns_full_set_sorted() {
        let map = one_chunk(RaidProfile::Raid5, 4, 1, 48 * 1024 * 1024);
        let m = map_block(&map, MapOp::Write, 1024 * 1024, 4096, 0).unwrap();
        assert_eq!(m.stripes.len(), 4);
        let rmap = m.raid_map.as_ref().unwrap();
        assert_eq!(rmap.len(), 4);
        assert_eq!(rmap[3], BTRFS_RAID5_P_STRIPE);
        assert!(rmap[0] < rmap[1] && rmap[1] < rmap[2]);
    }

    #[test]
    fn raid6_write_has_p_and_q() {
        let map = one_chunk(RaidProfile::Raid6, 4, 1, 32 * 1024 * 1024);
        let m = map_block(&map, MapOp::Write, 1024 * 1024, 4096, 0).unwrap();
        let rmap = m.raid_map.as_ref().unwrap();
        assert_eq!(rmap[2], BTRFS_RAID5_P_STRIPE);
        assert_eq!(rmap[3], BTRFS_RAID6_Q_STRIPE);
    }

    #[test]
    fn copies_per_profile() {
        assert_eq!(
            num_copies(&one_chunk(RaidProfile::Raid1, 2, 1, 1 << 24), 1024 * 1024).unwrap(),
            2
        );
        assert_eq!(
            num_copies(&one_chunk(RaidProfile::Raid10, 4, 2, 1 << 24), 1024 * 1024).unwrap(),
            2
        );
        assert_eq!(
            num_copies(&one_chunk(RaidProfile::Raid5, 3, 1, 1 << 24), 1024 * 1024).unwrap(),
            2
        );
        assert_eq!(
            num_copies(&one_chunk(RaidProfile::Raid6, 4, 1, 1 << 24), 1024 * 1024).unwrap(),
            3
        );
        assert_eq!(
            num_copies(&one_chunk(RaidProfile::Single, 1, 1, 1 << 24), 1024 * 1024).unwrap(),
            1
        );
    }

    #[test]
    fn dev_alloc_skips_reserved_and_supers() {
        let mut alloc = DevAllocMap::new();
        let total = 512 * 1024 * 1024_u64;
        let a = alloc.find_free(1, total, 8 * 1024 * 1024).unwrap();
        assert_ge!(a, BTRFS_DEVICE_RANGE_RESERVED);
        alloc.reserve(1, a, 8 * 1024 * 1024);
        // next allocation may not overlap the first nor the 64MiB mirror
        let b = alloc.find_free(1, total, 80 * 1024 * 1024).unwrap();
        assert_ge!(b, a + 8 * 1024 * 1024);
        let sb1 = btrfs_sb_offset(1);
        assert!(b >= sb1 + BTRFS_STRIPE_LEN || b + 80 * 1024 * 1024 <= sb1);
    }

    #[test]
    fn physical_round_trip_raid0() {
        let map = one_chunk(RaidProfile::Raid0, 2, 1, 16 * 1024 * 1024);
        for logical in [
            1024 * 1024_u64,
            1024 * 1024 + 4096,
            1024 * 1024 + BTRFS_STRIPE_LEN,
            1024 * 1024 + 3 * BTRFS_STRIPE_LEN + 512,
        ] {
            let m = map_block(&map, MapOp::Read, logical, 1, 0).unwrap();
            let back = map
                .logical_of_physical(m.stripes[0].devid, m.stripes[0].physical)
                .unwrap();
            assert_eq!(back, logical);
        }
    }

    #[test]
    fn plan_chunk_respects_profile_width() {
        let devices: Vec<(u64, u64, BtrfsUuid)> = (1..=4)
            .map(|i| (i, 2 * 1024 * 1024 * 1024, [i as u8; BTRFS_UUID_SIZE]))
            .collect();
        let alloc = DevAllocMap::new();
        let map = ChunkMap::new();
        let plan = plan_chunk(
            &devices,
            &alloc,
            &map,
            BTRFS_BLOCK_GROUP_DATA | BTRFS_BLOCK_GROUP_RAID5,
            None,
        )
        .unwrap();
        assert_eq!(plan.mapping.num_stripes, 4);
        assert_eq!(plan.mapping.length, plan.stripe_size * 3);
        let devids: Vec<u64> = plan.mapping.stripes.iter().map(|s| s.devid).collect();
        let mut sorted = devids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 4);
    }
}
