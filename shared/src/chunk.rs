//! Splitting work into bounded-size batches.
//!
//! Backing stores typically cap how many records one operation may touch.
//! [`chunked`] partitions an input into groups no larger than that cap, and
//! [`FlushBuffer`] accumulates items and hands back a full batch each time the
//! cap is reached. Neither knows anything about the store itself.
use std::mem;
use std::num::NonZeroUsize;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ChunkError {
    #[error("batch size must be greater than zero")]
    ZeroSize,
}

/// Returns an iterator over `items` yielding vectors of at most `size` elements.
/// Every input item appears in exactly one chunk; only the last chunk may be short.
pub fn chunked<I>(items: I, size: usize) -> Result<Chunked<I::IntoIter>, ChunkError>
where
    I: IntoIterator,
{
    let size = NonZeroUsize::new(size).ok_or(ChunkError::ZeroSize)?;
    Ok(Chunked {
        iter: items.into_iter(),
        size,
    })
}

pub struct Chunked<I> {
    iter: I,
    size: NonZeroUsize,
}

impl<I: Iterator> Iterator for Chunked<I> {
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk: Vec<_> = self.iter.by_ref().take(self.size.get()).collect();
        if chunk.is_empty() { None } else { Some(chunk) }
    }
}

/// Accumulates items until `limit` is reached.
pub struct FlushBuffer<T> {
    items: Vec<T>,
    limit: NonZeroUsize,
}

impl<T> FlushBuffer<T> {
    pub fn new(limit: usize) -> Result<Self, ChunkError> {
        let limit = NonZeroUsize::new(limit).ok_or(ChunkError::ZeroSize)?;
        Ok(FlushBuffer {
            items: Vec::with_capacity(limit.get()),
            limit,
        })
    }

    /// Adds an item. Returns the buffered batch once it holds `limit` items.
    pub fn push(&mut self, item: T) -> Option<Vec<T>> {
        self.items.push(item);
        if self.items.len() >= self.limit.get() {
            Some(self.take())
        } else {
            None
        }
    }

    /// Returns whatever is left in the buffer, if anything.
    pub fn take_remainder(&mut self) -> Option<Vec<T>> {
        if self.items.is_empty() {
            None
        } else {
            Some(self.take())
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn take(&mut self) -> Vec<T> {
        mem::replace(&mut self.items, Vec::with_capacity(self.limit.get()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunked_covers_every_item_once() {
        let chunks: Vec<Vec<u32>> = chunked(0..7, 3).unwrap().collect();
        assert_eq!(chunks, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);

        // Exact multiple leaves no empty trailing chunk
        let chunks: Vec<Vec<u32>> = chunked(0..6, 3).unwrap().collect();
        assert_eq!(chunks.len(), 2);

        let chunks: Vec<Vec<u32>> = chunked(Vec::<u32>::new(), 3).unwrap().collect();
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(chunked(0..3, 0), Err(ChunkError::ZeroSize)));
        assert!(matches!(FlushBuffer::<u32>::new(0), Err(ChunkError::ZeroSize)));
    }

    #[test]
    fn test_flush_buffer() {
        let mut buffer = FlushBuffer::new(2).unwrap();
        assert_eq!(buffer.push(1), None);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.push(2), Some(vec![1, 2]));
        assert!(buffer.is_empty());
        assert_eq!(buffer.push(3), None);
        assert_eq!(buffer.take_remainder(), Some(vec![3]));
        assert_eq!(buffer.take_remainder(), None);
    }
}
