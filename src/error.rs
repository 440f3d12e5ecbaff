use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to map {size} bytes of anonymous memory")]
    Alloc {
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("{kernel} counted {actual} elements above {threshold}, scalar reference counted {expected}")]
    Mismatch {
        kernel: &'static str,
        threshold: i8,
        expected: usize,
        actual: usize,
    },

    #[error("length {len} is not a multiple of the group width {group}")]
    UnalignedLength { len: usize, group: usize },

    #[error("chunk of {chunk_bytes} bytes is smaller than one group of {group} elements")]
    ChunkTooSmall { chunk_bytes: usize, group: usize },

    #[error("value bound must be positive, got {0}")]
    EmptyValueRange(i8),
}
