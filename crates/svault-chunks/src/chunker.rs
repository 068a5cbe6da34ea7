//! Fixed-size chunking of a packed stream
//!
//! Segments are cut at fixed offsets: every segment is exactly
//! `segment_size` bytes except the last, which holds the remainder. The
//! sequence is deterministic for a given stream and size, which is what lets
//! a resumed upload re-derive the segments it still owes and prove they match
//! what was recorded.

use std::io::{self, Read};

use crate::blake3::{hash_bytes, Hash};
use crate::compress::max_compressed_len;

/// One plaintext slice of the packed stream.
#[derive(Debug, Clone)]
pub struct Segment {
    /// 0-based position in the stream
    pub index: u64,
    pub data: Vec<u8>,
    /// BLAKE3 of `data`
    pub hash: Hash,
}

/// Lazy, finite, non-restartable iterator over the segments of a reader.
///
/// Memory use is one segment. An empty stream yields no segments; after the
/// first error or the end of input the iterator is exhausted.
pub struct Chunker<R> {
    reader: R,
    segment_size: usize,
    next_index: u64,
    done: bool,
}

impl<R: Read> Chunker<R> {
    /// # Panics
    /// If `segment_size` is zero.
    pub fn new(reader: R, segment_size: usize) -> Self {
        assert!(segment_size > 0, "segment size must be at least 1");
        Self {
            reader,
            segment_size,
            next_index: 0,
            done: false,
        }
    }

    /// Fill `buf` from the reader; short only at end of input.
    fn fill(&mut self, buf: &mut Vec<u8>) -> io::Result<()> {
        let mut filled = 0;
        while filled < self.segment_size {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buf.truncate(filled);
        Ok(())
    }
}

impl<R: Read> Iterator for Chunker<R> {
    type Item = io::Result<Segment>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut buf = vec![0u8; self.segment_size];
        if let Err(e) = self.fill(&mut buf) {
            self.done = true;
            return Some(Err(e));
        }
        if buf.len() < self.segment_size {
            self.done = true;
        }
        if buf.is_empty() {
            return None;
        }

        let index = self.next_index;
        self.next_index += 1;
        let hash = hash_bytes(&buf);
        Some(Ok(Segment {
            index,
            data: buf,
            hash,
        }))
    }
}

impl<R: Read> std::iter::FusedIterator for Chunker<R> {}

/// Split an in-memory buffer into segments of at most `segment_size` bytes.
pub fn split(data: &[u8], segment_size: usize) -> Vec<Segment> {
    assert!(segment_size > 0, "segment size must be at least 1");
    data.chunks(segment_size)
        .enumerate()
        .map(|(i, piece)| Segment {
            index: i as u64,
            data: piece.to_vec(),
            hash: hash_bytes(piece),
        })
        .collect()
}

/// Concatenate segments in index order.
///
/// Fails if the indices are not exactly `0..n` or a segment's content no
/// longer matches its recorded hash.
pub fn rejoin(mut segments: Vec<Segment>) -> anyhow::Result<Vec<u8>> {
    segments.sort_by_key(|s| s.index);
    let total: usize = segments.iter().map(|s| s.data.len()).sum();
    let mut out = Vec::with_capacity(total);

    for (expected, seg) in segments.iter().enumerate() {
        if seg.index != expected as u64 {
            anyhow::bail!(
                "segment sequence broken: expected index {expected}, found {}",
                seg.index
            );
        }
        if hash_bytes(&seg.data) != seg.hash {
            anyhow::bail!("segment {} does not match its hash", seg.index);
        }
        out.extend_from_slice(&seg.data);
    }
    Ok(out)
}

/// Largest plaintext segment whose compressed and encrypted form is
/// guaranteed to fit in `cap` bytes, given `overhead` bytes added by
/// encryption. `None` if not even a 1-byte segment fits.
pub fn segment_budget(cap: u64, overhead: u64) -> Option<u64> {
    let fits = |n: u64| max_compressed_len(n as usize) as u64 + overhead <= cap;
    if !fits(1) {
        return None;
    }

    // compress_bound is monotonic, so binary search for the largest fit
    let (mut lo, mut hi) = (1u64, cap);
    while lo < hi {
        let mid = lo + (hi - lo + 1) / 2;
        if fits(mid) {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    Some(lo)
}

/// Number of segments a stream of `len` bytes produces.
pub fn expected_chunk_count(len: u64, segment_size: u64) -> u64 {
    if segment_size == 0 {
        return 0;
    }
    len.div_ceil(segment_size)
}
