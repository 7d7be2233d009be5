use anyhow::Result as AnyhowResult;

pub type Result<T> = AnyhowResult<T>;

/// Half-open byte range `[offset, offset + size)` of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub size: u64,
}

impl ByteRange {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// Inclusive last byte, as used by `Range` and `Content-Range` headers.
    pub fn last(&self) -> u64 {
        self.offset + self.size.saturating_sub(1)
    }

    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    pub fn range_header(&self) -> String {
        format!("bytes={}-{}", self.offset, self.last())
    }

    pub fn content_range_header(&self) -> String {
        format!("bytes {}-{}/*", self.offset, self.last())
    }
}

/// Splits `[0, total)` into contiguous ranges of `chunk_size` bytes; the last
/// range holds the remainder.
pub fn partition(total: u64, chunk_size: u64) -> Vec<ByteRange> {
    if chunk_size == 0 {
        return Vec::new();
    }

    let count = total.div_ceil(chunk_size);
    (0..count)
        .map(|index| {
            let offset = index * chunk_size;
            ByteRange::new(offset, chunk_size.min(total - offset))
        })
        .collect()
}
