/// How a blob is transmitted, chosen once per upload from its size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStrategy {
    /// One transmission, progress reported at the end
    Direct,
    /// Progress reported in `chunks` steps of `chunk_size` bytes.
    /// The blob itself still goes out in one transmission.
    Chunked { chunk_size: u64, chunks: u64 },
}

impl UploadStrategy {
    pub fn select(size: u64, chunk_size: u64) -> Self {
        if chunk_size == 0 || size <= chunk_size.saturating_mul(2) {
            return UploadStrategy::Direct;
        }

        UploadStrategy::Chunked {
            chunk_size,
            chunks: size.div_ceil(chunk_size),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            UploadStrategy::Direct => "direct",
            UploadStrategy::Chunked { .. } => "chunked",
        }
    }
}
