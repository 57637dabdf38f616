// Vector buffer descriptors let one read or write move potentially
// non-contiguous regions of a user buffer in a single request without
// extraneous copying on the client side.
//
// The descriptor defines a regular vector of fixed size byte blocks at a
// fixed stride. Access begins at a given offset inside the first block and,
// after reaching the end of that block, continues block by block at the
// stride until the requested byte count is satisfied:
//
//                 |--- effective access range ---|
//
//               +----+----+----+----+----+----+----+
//               | B0 |    | B1 |    | B2 |    | B3 |
//               +----+----+----+----+----+----+----+
//                 ^                              ^
//                 |                              |__ last byte accessed
//                 |__ first byte accessed
//
// Striped file views use one descriptor per segment: block size is the
// stripe unit, the stride is the segment count, and the first block is the
// (possibly partial) stripe unit the access starts in.

/// Strided window over a user buffer; offsets are into that buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VbufSpec {
    /// Vector block size in bytes.
    pub blksz: i64,
    /// Distance between successive block starts, in blocks.
    pub stride: i64,
    /// Buffer offset of the first byte accessed.
    pub first_off: i64,
    /// Net size of the first block: bytes from `first_off` to block end.
    pub firstblk_netsz: i64,
}

impl VbufSpec {
    /// The trivial contiguous descriptor over `nbyte` bytes at `first_off`.
    pub fn contiguous(first_off: i64, nbyte: i64) -> Self {
        VbufSpec {
            blksz: nbyte.max(1),
            stride: 1,
            first_off,
            firstblk_netsz: nbyte.max(1),
        }
    }

    /// Buffer regions `(offset, len)` covering `nbyte` bytes of access.
    fn regions(&self, nbyte: i64) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        if nbyte <= 0 {
            return out;
        }
        let mut remaining = nbyte;
        let first = remaining.min(self.firstblk_netsz);
        out.push((self.first_off as usize, first as usize));
        remaining -= first;
        let mut off = self.first_off + self.firstblk_netsz + (self.stride - 1) * self.blksz;
        while remaining > 0 {
            let take = remaining.min(self.blksz);
            out.push((off as usize, take as usize));
            remaining -= take;
            off += self.stride * self.blksz;
        }
        out
    }

    /// Pack `nbyte` bytes of the window over `src` into a contiguous wire
    /// payload. The contiguous single-run case degenerates to one copy.
    pub fn gather(&self, src: &[u8], nbyte: i64) -> Vec<u8> {
        if self.stride == 1 {
            let start = self.first_off as usize;
            let end = start + nbyte.max(0) as usize;
            return src[start..end].to_vec();
        }
        let mut out = Vec::with_capacity(nbyte.max(0) as usize);
        for (off, len) in self.regions(nbyte) {
            out.extend_from_slice(&src[off..off + len]);
        }
        out
    }

    /// Unpack a contiguous payload into the window over `dst`; returns the
    /// number of bytes placed (the payload may be short).
    pub fn scatter(&self, dst: &mut [u8], data: &[u8]) -> usize {
        if self.stride == 1 {
            let start = self.first_off as usize;
            let n = data.len().min(dst.len() - start);
            dst[start..start + n].copy_from_slice(&data[..n]);
            return n;
        }
        let mut placed = 0;
        for (off, len) in self.regions(data.len() as i64) {
            dst[off..off + len].copy_from_slice(&data[placed..placed + len]);
            placed += len;
        }
        placed
    }
}
