//! Redundancy predicates for the deterministic stages. A later stage
//! skips any substitution an earlier stage already produced; these answer
//! "could that value have come from stage X?".

use super::tables::{INTERESTING_16, INTERESTING_32, INTERESTING_8};

/// Whether `xor_val = old ^ new` is reachable by the walking bit flips:
/// runs of 1, 2 or 4 bits anywhere, or byte-aligned full-byte/word/dword
/// inversions.
pub fn could_be_bitflip(mut xor_val: u32) -> bool {
    if xor_val == 0 {
        return true;
    }
    let mut sh = 0u32;
    while xor_val & 1 == 0 {
        sh += 1;
        xor_val >>= 1;
    }
    if xor_val == 1 || xor_val == 3 || xor_val == 15 {
        return true;
    }
    if sh & 7 != 0 {
        return false;
    }
    xor_val == 0xff || xor_val == 0xffff || xor_val == 0xffff_ffff
}

/// Whether `new_val` is reachable from `old_val` by adding or subtracting
/// up to `arith_max` at any byte, word or dword position, in either
/// endianness. `blen` is the width of the value in bytes.
pub fn could_be_arith(old_val: u32, new_val: u32, blen: usize, arith_max: u32) -> bool {
    if old_val == new_val {
        return true;
    }

    // single-byte adjustment somewhere?
    let mut diffs = 0;
    let mut ov = 0u8;
    let mut nv = 0u8;
    for i in 0..blen {
        let a = (old_val >> (8 * i)) as u8;
        let b = (new_val >> (8 * i)) as u8;
        if a != b {
            diffs += 1;
            ov = a;
            nv = b;
        }
    }
    if diffs == 1
        && (u32::from(ov.wrapping_sub(nv)) <= arith_max
            || u32::from(nv.wrapping_sub(ov)) <= arith_max)
    {
        return true;
    }
    if blen == 1 {
        return false;
    }

    // single-word adjustment, little or big endian?
    let mut diffs = 0;
    let mut ov = 0u16;
    let mut nv = 0u16;
    for i in 0..blen / 2 {
        let a = (old_val >> (16 * i)) as u16;
        let b = (new_val >> (16 * i)) as u16;
        if a != b {
            diffs += 1;
            ov = a;
            nv = b;
        }
    }
    if diffs == 1 {
        if u32::from(ov.wrapping_sub(nv)) <= arith_max
            || u32::from(nv.wrapping_sub(ov)) <= arith_max
        {
            return true;
        }
        let (ov, nv) = (ov.swap_bytes(), nv.swap_bytes());
        if u32::from(ov.wrapping_sub(nv)) <= arith_max
            || u32::from(nv.wrapping_sub(ov)) <= arith_max
        {
            return true;
        }
    }

    // whole-dword adjustment, either endianness?
    if blen == 4 {
        if old_val.wrapping_sub(new_val) <= arith_max || new_val.wrapping_sub(old_val) <= arith_max
        {
            return true;
        }
        let (old_val, new_val) = (old_val.swap_bytes(), new_val.swap_bytes());
        if old_val.wrapping_sub(new_val) <= arith_max || new_val.wrapping_sub(old_val) <= arith_max
        {
            return true;
        }
    }

    false
}

/// Whether `new_val` is reachable from `old_val` by pasting an interesting
/// value at some position. `check_le` asks for the little-endian word and
/// dword checks too (used when preparing the big-endian pass).
pub fn could_be_interest(old_val: u32, new_val: u32, blen: usize, check_le: bool) -> bool {
    if old_val == new_val {
        return true;
    }

    for i in 0..blen {
        for &v in &INTERESTING_8 {
            let tval = (old_val & !(0xffu32 << (8 * i))) | (u32::from(v as u8) << (8 * i));
            if new_val == tval {
                return true;
            }
        }
    }

    if blen == 2 && !check_le {
        return false;
    }

    for i in 0..blen.saturating_sub(1) {
        for &v in &INTERESTING_16 {
            let tval = (old_val & !(0xffffu32 << (8 * i))) | (u32::from(v as u16) << (8 * i));
            if new_val == tval {
                return true;
            }
            if blen > 2 {
                let tval = (old_val & !(0xffffu32 << (8 * i)))
                    | (u32::from((v as u16).swap_bytes()) << (8 * i));
                if new_val == tval {
                    return true;
                }
            }
        }
    }

    if blen == 4 && check_le {
        for &v in &INTERESTING_32 {
            if new_val == v as u32 {
                return true;
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitflip_identity_and_walks() {
        assert!(could_be_bitflip(0));
        assert!(could_be_bitflip(1));
        assert!(could_be_bitflip(0b11 << 5));
        assert!(could_be_bitflip(0b1111 << 9));
        assert!(could_be_bitflip(0xff00));
        assert!(could_be_bitflip(0xffff_ffff));
        assert!(!could_be_bitflip(0b101));
        assert!(!could_be_bitflip(0xff << 4));
    }

    #[test]
    fn arith_identity_and_reach() {
        assert!(could_be_arith(7, 7, 1, 35));
        assert!(could_be_arith(0, 35, 1, 35));
        assert!(!could_be_arith(0, 36, 1, 35));
        // +1 carries across the low byte: reachable as a word op
        assert!(could_be_arith(0x00ff, 0x0100, 2, 35));
        // big-endian word adjustment
        let old = u32::from(u16::from_be_bytes([0x12, 0xff]));
        let new = u32::from(u16::from_be_bytes([0x13, 0x00]));
        assert!(could_be_arith(old, new, 2, 35));
    }

    #[test]
    fn interest_identity_and_reach() {
        assert!(could_be_interest(5, 5, 1, false));
        assert!(could_be_interest(0, 100, 1, false));
        // 0x7fff pasted over the low word
        assert!(could_be_interest(0xaabb_0000, 0xaabb_7fff, 4, false));
        // full-dword little-endian paste only when asked
        assert!(could_be_interest(1, 0x7fff_ffff, 4, true));
        assert!(!could_be_interest(0xdead_beef, 0x1122_3344, 4, true));
    }
}
