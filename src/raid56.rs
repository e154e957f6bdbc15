//! Parity math for the striped profiles. P is a plain xor across the data
//! stripes; Q is the raid6 syndrome over GF(2^8) with the 0x11d generator
//! polynomial, matching what the on-disk format expects.

use crate::error::{BtrfsError, Result};

const GF_POLY: u16 = 0x11d;

const fn build_tables() -> ([u8; 512], [u8; 256]) {
    let mut exp = [0_u8; 512];
    let mut log = [0_u8; 256];
    let mut x: u16 = 1;
    let mut i = 0;
    while i < 255 {
        exp[i] = x as u8;
        log[x as usize] = i as u8;
        x <<= 1;
        if x & 0x100 != 0 {
            x ^= GF_POLY;
        }
        i += 1;
    }
    let mut j = 255;
    while j < 510 {
        exp[j] = exp[j - 255];
        j += 1;
    }
    (exp, log)
}

const TABLES: ([u8; 512], [u8; 256]) = build_tables();

fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    let (exp, log) = (&TABLES.0, &TABLES.1);
    exp[log[a as usize] as usize + log[b as usize] as usize]
}

fn gf_inv(a: u8) -> u8 {
    assert_ne!(a, 0);
    let (exp, log) = (&TABLES.0, &TABLES.1);
    exp[255 - log[a as usize] as usize]
}

/// g^n for the generator g = 2
fn gf_pow2(n: usize) -> u8 {
    TABLES.0[n % 255]
}

pub fn xor_into(dst: &mut [u8], src: &[u8]) {
    assert_eq!(dst.len(), src.len());
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d ^= *s;
    }
}

/// P = D0 ^ D1 ^ ... ^ Dn-1
pub fn raid5_gen_parity(data: &[&[u8]], p: &mut [u8]) {
    p.fill(0);
    for stripe in data {
        xor_into(p, stripe);
    }
}

/// P as above, Q = sum over i of g^i * Di
pub fn raid6_gen_syndrome(data: &[&[u8]], p: &mut [u8], q: &mut [u8]) {
    raid5_gen_parity(data, p);
    q.fill(0);
    for (i, stripe) in data.iter().enumerate() {
        let coeff = gf_pow2(i);
        for (qb, db) in q.iter_mut().zip(stripe.iter()) {
            *qb ^= gf_mul(coeff, *db);
        }
    }
}

/// Stripe set in sorted order: data stripes, then P, then Q (raid6 only).
/// `None` marks a missing stripe. Rebuilds every missing slot in place or
/// reports the set unrecoverable.
pub fn rebuild_raid56(stripes: &mut [Option<Vec<u8>>], nparity: usize) -> Result<()> {
    let total = stripes.len();
    let ndata = total - nparity;
    let stripe_len = stripes
        .iter()
        .flatten()
        .map(|s| s.len())
        .next()
        .ok_or_else(|| BtrfsError::corrupt("no stripe present in set"))?;

    let missing: Vec<usize> = (0..total).filter(|i| stripes[*i].is_none()).collect();
    if missing.is_empty() {
        return Ok(());
    }
    if missing.len() > nparity {
        return Err(BtrfsError::corrupt(format!(
            "{} stripes missing, parity tolerates {}",
            missing.len(),
            nparity
        )));
    }

    let missing_data: Vec<usize> = missing.iter().copied().filter(|i| *i < ndata).collect();
    let p_missing = missing.contains(&ndata);
    let q_missing = nparity == 2 && missing.contains(&(ndata + 1));

    match (missing_data.len(), p_missing, q_missing) {
        (0, _, _) => {
            // only parity lost, regenerate from data
            regen_parity(stripes, ndata, nparity, stripe_len);
        }
        (1, false, _) => {
            // xor of P and the surviving data
            let x = missing_data[0];
            let mut buf = vec![0_u8; stripe_len];
            xor_into(&mut buf, stripes[ndata].as_ref().unwrap());
            for i in 0..ndata {
                if i != x {
                    xor_into(&mut buf, stripes[i].as_ref().unwrap());
                }
            }
            stripes[x] = Some(buf);
            if q_missing {
                regen_parity(stripes, ndata, nparity, stripe_len);
            }
        }
        (1, true, false) => {
            // P gone as well: recover the data stripe from Q
            let x = missing_data[0];
            let mut buf = vec![0_u8; stripe_len];
            xor_into(&mut buf, stripes[ndata + 1].as_ref().unwrap());
            for i in 0..ndata {
                if i == x {
                    continue;
                }
                let coeff = gf_pow2(i);
                for (b, d) in buf.iter_mut().zip(stripes[i].as_ref().unwrap().iter()) {
                    *b ^= gf_mul(coeff, *d);
                }
            }
            let ginv = gf_inv(gf_pow2(x));
            for b in buf.iter_mut() {
                *b = gf_mul(ginv, *b);
            }
            stripes[x] = Some(buf);
            regen_parity(stripes, ndata, nparity, stripe_len);
        }
        (2, false, false) => {
            // two data stripes from P and Q
            let (x, y) = (missing_data[0], missing_data[1]);
            let mut pxy = vec![0_u8; stripe_len];
            let mut qxy = vec![0_u8; stripe_len];
            xor_into(&mut pxy, stripes[ndata].as_ref().unwrap());
            xor_into(&mut qxy, stripes[ndata + 1].as_ref().unwrap());
            for i in 0..ndata {
                if i == x || i == y {
                    continue;
                }
                let d = stripes[i].as_ref().unwrap();
                xor_into(&mut pxy, d);
                let coeff = gf_pow2(i);
                for (b, db) in qxy.iter_mut().zip(d.iter()) {
                    *b ^= gf_mul(coeff, *db);
                }
            }
            let denom = gf_inv(gf_pow2(y - x) ^ 1);
            let a = gf_mul(gf_pow2(y - x), denom);
            let b_coeff = gf_mul(gf_inv(gf_pow2(x)), denom);
            let mut dx = vec![0_u8; stripe_len];
            for i in 0..stripe_len {
                dx[i] = gf_mul(a, pxy[i]) ^ gf_mul(b_coeff, qxy[i]);
            }
            let mut dy = pxy;
            xor_into(&mut dy, &dx);
            stripes[x] = Some(dx);
            stripes[y] = Some(dy);
        }
        _ => {
            return Err(BtrfsError::corrupt(
                "unsupported loss pattern for parity rebuild",
            ))
        }
    }
    Ok(())
}

fn regen_parity(stripes: &mut [Option<Vec<u8>>], ndata: usize, nparity: usize, stripe_len: usize) {
    let data: Vec<&[u8]> = (0..ndata)
        .map(|i| stripes[i].as_ref().unwrap().as_slice())
        .collect();
    let mut p = vec![0_u8; stripe_len];
    if nparity == 2 {
        let mut q = vec![0_u8; stripe_len];
        raid6_gen_syndrome(&data, &mut p, &mut q);
        stripes[ndata] = Some(p);
        stripes[ndata + 1] = Some(q);
    } else {
        raid5_gen_parity(&data, &mut p);
        stripes[ndata] = Some(p);
    }
}

/// recompute P (and Q) from the data stripes and compare against the set
pub fn verify_parity(stripes: &[Option<Vec<u8>>], nparity: usize) -> bool {
    let total = stripes.len();
    let ndata = total - nparity;
    if stripes.iter().any(|s| s.is_none()) {
        return false;
    }
    let stripe_len = stripes[0].as_ref().unwrap().len();
    let data: Vec<&[u8]> = (0..ndata)
        .map(|i| stripes[i].as_ref().unwrap().as_slice())
        .collect();
    let mut p = vec![0_u8; stripe_len];
    if nparity == 2 {
        let mut q = vec![0_u8; stripe_len];
        raid6_gen_syndrome(&data, &mut p, &mut q);
        p == *stripes[ndata].as_ref().unwrap() && q == *stripes[ndata + 1].as_ref().unwrap()
    } else {
        raid5_gen_parity(&data, &mut p);
        p == *stripes[ndata].as_ref().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_set(ndata: usize, nparity: usize, len: usize) -> Vec<Option<Vec<u8>>> {
        let mut stripes: Vec<Option<Vec<u8>>> = (0..ndata)
            .map(|i| Some((0..len).map(|j| ((i * 37 + j * 11) % 251) as u8).collect()))
            .collect();
        for _ in 0..nparity {
            stripes.push(Some(vec![0_u8; len]));
        }
        regen_parity(&mut stripes, ndata, nparity, len);
        stripes
    }

    #[test]
    fn gf_basics() {
        assert_eq!(gf_mul(1, 77), 77);
        assert_eq!(gf_mul(0, 77), 0);
        for a in 1..=255_u8 {
            assert_eq!(gf_mul(a, gf_inv(a)), 1);
        }
        // g^8 = 0x1d for the 0x11d polynomial
        assert_eq!(gf_pow2(8), 0x1d);
    }

    #[test]
    fn parity_verifies_clean_set() {
        let set = sample_set(3, 1, 1024);
        assert!(verify_parity(&set, 1));
        let set6 = sample_set(4, 2, 1024);
        assert!(verify_parity(&set6, 2));
    }

    #[test]
    fn raid5_single_loss() {
        let pristine = sample_set(3, 1, 512);
        for lost in 0..4 {
            let mut set = pristine.clone();
            set[lost] = None;
            rebuild_raid56(&mut set, 1).unwrap();
            for i in 0..4 {
                assert_eq!(set[i], pristine[i], "stripe {i} after losing {lost}");
            }
        }
    }

    #[test]
    fn raid6_double_loss() {
        let pristine = sample_set(4, 2, 512);
        for lost_a in 0..6 {
            for lost_b in (lost_a + 1)..6 {
                let mut set = pristine.clone();
                set[lost_a] = None;
                set[lost_b] = None;
                rebuild_raid56(&mut set, 2).unwrap();
                for i in 0..6 {
                    assert_eq!(
                        set[i], pristine[i],
                        "stripe {i} after losing {lost_a},{lost_b}"
                    );
                }
            }
        }
    }

    #[test]
    fn too_many_missing_is_fatal() {
        let mut set = sample_set(4, 1, 64);
        set[0] = None;
        set[1] = None;
        assert!(rebuild_raid56(&mut set, 1).is_err());
    }
}
