use crate::structures::{BtrfsCsum, BtrfsCsumType, BTRFS_CSUM_SIZE};

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use crc::{Crc, CRC_32_ISCSI};
use sha2::Sha256;
use xxhash_rust::xxh64::xxh64;

type Blake2b256 = Blake2b<U32>;

/* the checksums range from 4-32 bytes depending on the algorithm in use. For simplicity we'll always return a 32 byte buffer, but this could be improved upon */
pub fn csum_data(buf: &[u8], csum_type: BtrfsCsumType) -> BtrfsCsum {
    match csum_type {
        BtrfsCsumType::CRC32 => csum_data_crc32(buf),
        BtrfsCsumType::XXHASH => csum_data_xxhash(buf),
        BtrfsCsumType::SHA256 => csum_data_sha256(buf),
        BtrfsCsumType::BLAKE2 => csum_data_blake2(buf),
    }
}

/// bytes of the checksum that are actually significant for a given algorithm
pub fn csum_size(csum_type: BtrfsCsumType) -> usize {
    match csum_type {
        BtrfsCsumType::CRC32 => 4,
        BtrfsCsumType::XXHASH => 8,
        BtrfsCsumType::SHA256 => 32,
        BtrfsCsumType::BLAKE2 => 32,
    }
}

fn csum_data_crc32(buf: &[u8]) -> BtrfsCsum {
    const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
    let mut ret = [0_u8; BTRFS_CSUM_SIZE];
    let cs = CASTAGNOLI.checksum(buf).to_le_bytes();
    ret[..cs.len()].copy_from_slice(&cs[..]);
    ret
}

fn csum_data_xxhash(buf: &[u8]) -> BtrfsCsum {
    let mut ret = [0_u8; BTRFS_CSUM_SIZE];
    let cs = xxh64(buf, 0).to_le_bytes();
    ret[..cs.len()].copy_from_slice(&cs[..]);
    ret
}

fn csum_data_sha256(buf: &[u8]) -> BtrfsCsum {
    let mut ret = [0_u8; BTRFS_CSUM_SIZE];
    ret.copy_from_slice(&Sha256::digest(buf));
    ret
}

fn csum_data_blake2(buf: &[u8]) -> BtrfsCsum {
    let mut ret = [0_u8; BTRFS_CSUM_SIZE];
    ret.copy_from_slice(&Blake2b256::digest(buf));
    ret
}

/// crc32c with the btrfs seed, used for directory name hashing and for
/// per-sector data checksums when csum_type is CRC32
pub fn btrfs_crc32c(seed: u32, data: &[u8]) -> u32 {
    const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
    let mut digest = CASTAGNOLI.digest_with_initial(seed);
    digest.update(data);
    digest.finalize()
}

/// hash of a directory entry name, seeded with (u32)~1
pub fn btrfs_name_hash(name: &[u8]) -> u64 {
    btrfs_crc32c(!1_u32, name) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_known_vector() {
        // crc32c("123456789") = 0xE3069283
        let cs = csum_data(b"123456789", BtrfsCsumType::CRC32);
        assert_eq!(&cs[..4], &0xE3069283_u32.to_le_bytes());
        assert_eq!(&cs[4..], &[0_u8; 28][..]);
    }

    #[test]
    fn algorithms_disagree() {
        let body = [0xAB_u8; 4096];
        let a = csum_data(&body, BtrfsCsumType::CRC32);
        let b = csum_data(&body, BtrfsCsumType::XXHASH);
        let c = csum_data(&body, BtrfsCsumType::SHA256);
        let d = csum_data(&body, BtrfsCsumType::BLAKE2);
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(c, d);
    }

    #[test]
    fn name_hash_stable() {
        let h1 = btrfs_name_hash(b"lost+found");
        let h2 = btrfs_name_hash(b"lost+found");
        assert_eq!(h1, h2);
        assert_ne!(h1, btrfs_name_hash(b"lost+foune"));
    }
}
