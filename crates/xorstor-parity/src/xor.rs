//! XOR kernels.

/// XOR `src` into `dst` over their common length.
///
/// Works on 8-byte words so the loop vectorizes; the tail is bytewise.
#[inline]
pub fn xor_into(dst: &mut [u8], src: &[u8]) {
    let len = dst.len().min(src.len());
    let (dst, src) = (&mut dst[..len], &src[..len]);

    let mut dst_words = dst.chunks_exact_mut(8);
    let mut src_words = src.chunks_exact(8);
    for (d, s) in (&mut dst_words).zip(&mut src_words) {
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        a.copy_from_slice(d);
        b.copy_from_slice(s);
        d.copy_from_slice(&(u64::from_ne_bytes(a) ^ u64::from_ne_bytes(b)).to_ne_bytes());
    }
    for (d, s) in dst_words
        .into_remainder()
        .iter_mut()
        .zip(src_words.remainder())
    {
        *d ^= s;
    }
}

/// Overwrite `acc` with the XOR of all `blocks`.
///
/// The first block is copied rather than XORed into a zeroed buffer.
pub fn xor_blocks<B: AsRef<[u8]>>(acc: &mut [u8], blocks: &[B]) {
    let Some((first, rest)) = blocks.split_first() else {
        acc.fill(0);
        return;
    };
    let first = first.as_ref();
    let n = acc.len().min(first.len());
    acc[..n].copy_from_slice(&first[..n]);
    acc[n..].fill(0);
    for block in rest {
        xor_into(acc, block.as_ref());
    }
}
