//! Host memory buffer accounting for tensor storage.
//!
//! A single pool feeds all tensor storage of a process. Allocation is
//! first-fit over a free-span list with coalescing on release; a low free
//! watermark lets callers trigger opportunistic garbage collection before
//! blocking or failing.

use std::sync::Mutex;

use crate::error::TneError;

/// A reserved byte range of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug)]
struct PoolInner {
    /// Free spans sorted by offset, pairwise non-adjacent.
    free: Vec<Span>,
    used: u64,
}

/// First-fit memory pool with span coalescing.
///
/// # Examples
/// ```
/// # use tne::runtime::memory::MemoryPool;
/// let pool = MemoryPool::new(1024);
/// let a = pool.allocate(256).unwrap();
/// let b = pool.allocate(256).unwrap();
/// pool.release(a);
/// pool.release(b);
/// assert_eq!(pool.free_bytes(), 1024);
/// ```
#[derive(Debug)]
pub struct MemoryPool {
    capacity: u64,
    watermark: u64,
    inner: Mutex<PoolInner>,
}

impl MemoryPool {
    /// Creates a pool of `capacity` bytes with a free watermark at 1/8th of
    /// the capacity.
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            watermark: capacity / 8,
            inner: Mutex::new(PoolInner {
                free: vec![Span {
                    offset: 0,
                    len: capacity,
                }],
                used: 0,
            }),
        }
    }

    /// Total pool size in bytes.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes currently free.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.capacity - self.inner.lock().unwrap().used
    }

    /// Whether free memory has fallen below the watermark, suggesting an
    /// opportunistic garbage-collection pass.
    #[must_use]
    pub fn below_watermark(&self) -> bool {
        self.free_bytes() < self.watermark
    }

    /// Reserves `len` bytes, first-fit. Zero-length requests reserve a
    /// zero-byte span.
    pub fn allocate(&self, len: u64) -> Result<Span, TneError> {
        let mut inner = self.inner.lock().unwrap();
        if len == 0 {
            return Ok(Span { offset: 0, len: 0 });
        }
        let position = inner.free.iter().position(|span| span.len >= len);
        match position {
            Some(index) => {
                let span = inner.free[index];
                let allocated = Span {
                    offset: span.offset,
                    len,
                };
                if span.len == len {
                    inner.free.remove(index);
                } else {
                    inner.free[index] = Span {
                        offset: span.offset + len,
                        len: span.len - len,
                    };
                }
                inner.used += len;
                Ok(allocated)
            }
            None => Err(TneError::ResourceExhausted {
                requested: len,
                available: self.capacity - inner.used,
            }),
        }
    }

    /// Returns a span to the pool, coalescing with adjacent free spans.
    pub fn release(&self, span: Span) {
        if span.len == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.used -= span.len;
        let index = inner
            .free
            .partition_point(|free| free.offset < span.offset);
        inner.free.insert(index, span);
        // Coalesce with the successor, then the predecessor.
        if index + 1 < inner.free.len()
            && inner.free[index].offset + inner.free[index].len == inner.free[index + 1].offset
        {
            inner.free[index].len += inner.free[index + 1].len;
            inner.free.remove(index + 1);
        }
        if index > 0
            && inner.free[index - 1].offset + inner.free[index - 1].len
                == inner.free[index].offset
        {
            inner.free[index - 1].len += inner.free[index].len;
            inner.free.remove(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fit_and_exhaustion() {
        let pool = MemoryPool::new(100);
        let a = pool.allocate(60).unwrap();
        assert_eq!(a.offset, 0);
        let b = pool.allocate(40).unwrap();
        assert_eq!(b.offset, 60);
        assert!(matches!(
            pool.allocate(1),
            Err(TneError::ResourceExhausted { requested: 1, available: 0 })
        ));
        pool.release(a);
        // First fit reuses the leading hole.
        let c = pool.allocate(10).unwrap();
        assert_eq!(c.offset, 0);
    }

    #[test]
    fn test_coalescing() {
        let pool = MemoryPool::new(90);
        let a = pool.allocate(30).unwrap();
        let b = pool.allocate(30).unwrap();
        let c = pool.allocate(30).unwrap();
        // Release out of order; the pool must coalesce back to one span.
        pool.release(b);
        pool.release(a);
        pool.release(c);
        assert_eq!(pool.free_bytes(), 90);
        let all = pool.allocate(90).unwrap();
        assert_eq!(all.offset, 0);
    }

    #[test]
    fn test_watermark() {
        let pool = MemoryPool::new(80);
        assert!(!pool.below_watermark());
        let _a = pool.allocate(75).unwrap();
        assert!(pool.below_watermark());
    }
}
