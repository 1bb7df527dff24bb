//! XOR helpers for fixed-width binary merges.
//!
//! Two interchangeable strategies: one byte at a time, and eight bytes at a
//! time with a byte-wise tail. They must agree bit for bit on every input.

const WORD: usize = std::mem::size_of::<u64>();

/// `out[i] = a[i] ^ b[i]`, one byte per step.
pub fn xor_bytes(a: &[u8], b: &[u8], out: &mut [u8]) {
    debug_assert!(a.len() == b.len() && a.len() == out.len());
    for ((o, x), y) in out.iter_mut().zip(a).zip(b) {
        *o = x ^ y;
    }
}

/// Same result as [`xor_bytes`], processing whole `u64` words first.
pub fn xor_words(a: &[u8], b: &[u8], out: &mut [u8]) {
    debug_assert!(a.len() == b.len() && a.len() == out.len());
    let words = out.len() / WORD * WORD;

    for ((o, x), y) in out[..words]
        .chunks_exact_mut(WORD)
        .zip(a[..words].chunks_exact(WORD))
        .zip(b[..words].chunks_exact(WORD))
    {
        let mut xw = [0u8; WORD];
        let mut yw = [0u8; WORD];
        xw.copy_from_slice(x);
        yw.copy_from_slice(y);
        o.copy_from_slice(&(u64::from_ne_bytes(xw) ^ u64::from_ne_bytes(yw)).to_ne_bytes());
    }

    xor_bytes(&a[words..], &b[words..], &mut out[words..]);
}

/// Allocate and return `a ^ b`, or `None` when the lengths differ.
pub fn xor_to_vec(a: &[u8], b: &[u8]) -> Option<Vec<u8>> {
    if a.len() != b.len() {
        return None;
    }
    let mut out = vec![0u8; a.len()];
    xor_words(a, b, &mut out);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_strategies_agree_on_odd_length() {
        let a: Vec<u8> = [0u8, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10].iter().cycle().take(44).copied().chain([7, 5, 3]).collect();
        let b: Vec<u8> = [10u8, 9, 8, 7, 6, 5, 4, 3, 2, 1, 0].iter().cycle().take(44).copied().chain([7, 5, 3]).collect();
        assert_eq!(a.len(), 47);

        let mut by_byte = vec![0u8; a.len()];
        let mut by_word = vec![0u8; a.len()];
        xor_bytes(&a, &b, &mut by_byte);
        xor_words(&a, &b, &mut by_word);
        assert_eq!(by_byte, by_word);
        assert_eq!(&by_byte[44..], &[0, 0, 0]);
    }

    #[test]
    fn test_strategies_agree_on_every_small_length() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        for len in 0..=64 {
            let a: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let b: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let mut by_byte = vec![0u8; len];
            let mut by_word = vec![0u8; len];
            xor_bytes(&a, &b, &mut by_byte);
            xor_words(&a, &b, &mut by_word);
            assert_eq!(by_byte, by_word, "length {}", len);
        }
    }

    #[test]
    fn test_self_inverse() {
        let v = b"fixed-width value".to_vec();
        let o = b"operand of same!!".to_vec();
        let once = xor_to_vec(&v, &o).unwrap();
        assert_ne!(once, v);
        assert_eq!(xor_to_vec(&once, &o).unwrap(), v);
    }

    #[test]
    fn test_length_mismatch() {
        assert_eq!(xor_to_vec(b"abc", b"abcd"), None);
    }
}
