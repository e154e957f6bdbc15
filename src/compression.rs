//! Decoders for the on-disk compression formats. zlib and zstd come from
//! their crates; lzo1x is decoded here because the format's segmented
//! framing and the match encoding are small enough to carry directly.

use crate::error::{BtrfsError, Result};
use crate::structures::*;

use std::io::Read;

pub fn decompress(data: &[u8], compression: u8, ram_bytes: usize) -> Result<Vec<u8>> {
    match compression {
        BTRFS_COMPRESS_NONE => Ok(data.to_vec()),
        BTRFS_COMPRESS_ZLIB => decompress_zlib(data, ram_bytes),
        BTRFS_COMPRESS_LZO => decompress_lzo(data, ram_bytes),
        BTRFS_COMPRESS_ZSTD => decompress_zstd(data, ram_bytes),
        other => Err(BtrfsError::corrupt(format!(
            "unknown compression tag {other}"
        ))),
    }
}

fn decompress_zlib(data: &[u8], ram_bytes: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(ram_bytes);
    let mut decoder = flate2::read::ZlibDecoder::new(data);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| BtrfsError::corrupt(format!("zlib stream: {e}")))?;
    out.truncate(ram_bytes);
    Ok(out)
}

fn decompress_zstd(data: &[u8], ram_bytes: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(ram_bytes);
    let mut decoder = zstd::stream::read::Decoder::new(data)
        .map_err(|e| BtrfsError::corrupt(format!("zstd stream: {e}")))?;
    decoder
        .read_to_end(&mut out)
        .map_err(|e| BtrfsError::corrupt(format!("zstd stream: {e}")))?;
    out.truncate(ram_bytes);
    Ok(out)
}

/// The lzo framing: a u32 total length, then per-segment u32 lengths ahead
/// of each lzo1x block. Segments never span a sectorsize boundary.
fn decompress_lzo(data: &[u8], ram_bytes: usize) -> Result<Vec<u8>> {
    if data.len() < 4 {
        return Err(BtrfsError::corrupt("lzo stream too short"));
    }
    let total = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
    if total > data.len() {
        return Err(BtrfsError::corrupt("lzo stream length overruns extent"));
    }
    let mut out = Vec::with_capacity(ram_bytes);
    let mut off = 4;
    while off + 4 <= total && out.len() < ram_bytes {
        let seg = u32::from_le_bytes(data[off..off + 4].try_into().unwrap()) as usize;
        off += 4;
        if seg == 0 || off + seg > data.len() {
            return Err(BtrfsError::corrupt("lzo segment overruns stream"));
        }
        lzo1x_decompress(&data[off..off + seg], &mut out)?;
        off += seg;
        // segment headers are padded so they do not straddle a sector
        let sector = 4096;
        if off % sector + 4 > sector {
            off = (off / sector + 1) * sector;
        }
    }
    out.truncate(ram_bytes);
    Ok(out)
}

/// Plain lzo1x match decoder, enough for the streams the compressor side of
/// the format emits.
fn lzo1x_decompress(src: &[u8], out: &mut Vec<u8>) -> Result<()> {
    let err = || BtrfsError::corrupt("malformed lzo1x block");
    let mut ip = 0_usize;
    let start = out.len();

    let read = |ip: &mut usize| -> Result<u8> {
        let b = *src.get(*ip).ok_or_else(err)?;
        *ip += 1;
        Ok(b)
    };
    let count_zero_run = |ip: &mut usize| -> Result<usize> {
        let mut extra = 0_usize;
        loop {
            let b = read(ip)?;
            if b != 0 {
                return Ok(extra * 255 + b as usize);
            }
            extra += 1;
            if extra > src.len() {
                return Err(err());
            }
        }
    };
    let copy_match = |out: &mut Vec<u8>, dist: usize, len: usize| -> Result<()> {
        if dist == 0 || dist > out.len() - start {
            return Err(err());
        }
        let mut pos = out.len() - dist;
        for _ in 0..len {
            let b = out[pos];
            out.push(b);
            pos += 1;
        }
        Ok(())
    };

    let mut t = read(&mut ip)? as usize;
    let mut state;
    if t > 17 {
        // first byte above 17 encodes an initial literal run
        let len = t - 17;
        for _ in 0..len {
            let b = read(&mut ip)?;
            out.push(b);
        }
        state = 4;
        t = read(&mut ip)? as usize;
    } else {
        state = 0;
    }

    loop {
        if t >= 64 {
            // 2-byte match, distance up to 2048
            let len = (t >> 5) - 1;
            let b = read(&mut ip)? as usize;
            let dist = ((t >> 2) & 7) + (b << 3) + 1;
            copy_match(out, dist, len + 2)?;
            state = t & 3;
        } else if t >= 32 {
            // long match through the zero-run length encoding
            let mut len = t & 31;
            if len == 0 {
                len = 31 + count_zero_run(&mut ip)?;
            }
            let b0 = read(&mut ip)? as usize;
            let b1 = read(&mut ip)? as usize;
            let dist = (b0 >> 2) + (b1 << 6) + 1;
            copy_match(out, dist, len + 2)?;
            state = b0 & 3;
        } else if t >= 16 {
            // match reaching past 16 KiB; distance 16384 marks the end
            let mut len = t & 7;
            if len == 0 {
                len = 7 + count_zero_run(&mut ip)?;
            }
            let b0 = read(&mut ip)? as usize;
            let b1 = read(&mut ip)? as usize;
            let dist = 16384 + ((t & 8) << 11) + (b0 >> 2) + (b1 << 6);
            if dist == 16384 {
                return Ok(());
            }
            copy_match(out, dist, len + 2)?;
            state = b0 & 3;
        } else if state == 0 {
            // literal run
            let mut len = t;
            if len == 0 {
                len = 15 + count_zero_run(&mut ip)?;
            }
            for _ in 0..len + 3 {
                let b = read(&mut ip)?;
                out.push(b);
            }
            state = 4;
        } else if state < 4 {
            // short match plus up to three literals
            let b = read(&mut ip)? as usize;
            let dist = (t >> 2) + (b << 2) + 1;
            copy_match(out, dist, 2)?;
            state = t & 3;
        } else {
            let b = read(&mut ip)? as usize;
            let dist = (t >> 2) + (b << 2) + 2049;
            copy_match(out, dist, 3)?;
            state = t & 3;
        }
        // matches carry up to three trailing literals; literal runs do not
        if state < 4 {
            for _ in 0..state {
                let b = read(&mut ip)?;
                out.push(b);
            }
        }
        t = read(&mut ip)? as usize;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn none_is_identity() {
        let data = b"plain bytes";
        assert_eq!(
            decompress(data, BTRFS_COMPRESS_NONE, data.len()).unwrap(),
            data
        );
    }

    #[test]
    fn zlib_round_trip() {
        let original = vec![7_u8; 10000];
        let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(&original).unwrap();
        let compressed = enc.finish().unwrap();
        let back = decompress(&compressed, BTRFS_COMPRESS_ZLIB, original.len()).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn zstd_round_trip() {
        let original: Vec<u8> = (0..8192_u32).map(|i| (i % 251) as u8).collect();
        let compressed = zstd::stream::encode_all(&original[..], 3).unwrap();
        let back = decompress(&compressed, BTRFS_COMPRESS_ZSTD, original.len()).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn lzo_literal_stream() {
        // hand-built block: initial literal marker (17 + len), the bytes,
        // then the end-of-stream match
        let payload = b"abcdefgh";
        let mut block = vec![17 + payload.len() as u8];
        block.extend_from_slice(payload);
        block.extend_from_slice(&[0x11, 0, 0]);

        let mut framed = Vec::new();
        let total = 4 + 4 + block.len();
        framed.extend_from_slice(&(total as u32).to_le_bytes());
        framed.extend_from_slice(&(block.len() as u32).to_le_bytes());
        framed.extend_from_slice(&block);

        let out = decompress(&framed, BTRFS_COMPRESS_LZO, payload.len()).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(decompress(b"x", 9, 1).is_err());
    }
}
