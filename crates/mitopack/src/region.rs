//! # Shared memory regions
//!
//! A `SharedRegion` is a block of bytes nameable from every execution
//! context holding a handle to it. Identity is the handle, not the
//! contents: cloning a handle never copies bytes, and mutations through one
//! handle are visible through all of them.
//!
//! Regions are jointly owned. Nothing here frees a region explicitly; it is
//! dropped when the last handle goes away. Content access is guarded by an
//! internal lock for memory safety only — the protocol provides no ordering
//! or mutual exclusion between contexts mutating the same region.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use parking_lot::RwLock;

static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A view or access would fall outside the region's bounds.
    OutOfBounds {
        offset: usize,
        len: usize,
        region_len: usize,
    },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfBounds { offset, len, region_len } => write!(
                f,
                "range {}..{} is outside region of {} bytes",
                offset,
                offset + len,
                region_len
            ),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Identifier for a shared region, stable across contexts.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct RegionId(pub u64);

impl std::fmt::Display for RegionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "region-{}", self.0)
    }
}

struct RegionInner {
    id: RegionId,
    len: usize,
    bytes: RwLock<Box<[u8]>>,
}

/// Handle to a jointly owned block of shared bytes.
#[derive(Clone)]
pub struct SharedRegion {
    inner: Arc<RegionInner>,
}

impl SharedRegion {
    /// Allocates a fresh zero-filled region of `len` bytes.
    pub fn allocate(len: usize) -> Self {
        let id = RegionId(NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed));
        Self {
            inner: Arc::new(RegionInner {
                id,
                len,
                bytes: RwLock::new(vec![0u8; len].into_boxed_slice()),
            }),
        }
    }

    /// Allocates a region of `bytes.len()` bytes and copies `bytes` in once.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let region = Self::allocate(bytes.len());
        region.inner.bytes.write().copy_from_slice(bytes);
        region
    }

    pub fn id(&self) -> RegionId {
        self.inner.id
    }

    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Two handles name the same region iff they share the same allocation.
    pub fn same_region(a: &SharedRegion, b: &SharedRegion) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Validates that `offset..offset + len` lies inside the region.
    pub fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        if offset.checked_add(len).is_none_or(|end| end > self.inner.len) {
            return Err(Error::OutOfBounds {
                offset,
                len,
                region_len: self.inner.len,
            });
        }
        Ok(())
    }

    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.inner.bytes.read())
    }

    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.inner.bytes.write())
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.bytes.read().to_vec()
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedRegion({}, {} bytes)", self.inner.id, self.inner.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_alias_the_same_bytes() {
        let a = SharedRegion::allocate(4);
        let b = a.clone();
        a.with_bytes_mut(|bytes| bytes[2] = 0xAB);
        assert_eq!(b.snapshot(), vec![0, 0, 0xAB, 0]);
        assert!(SharedRegion::same_region(&a, &b));
    }

    #[test]
    fn distinct_allocations_have_distinct_ids() {
        let a = SharedRegion::allocate(1);
        let b = SharedRegion::allocate(1);
        assert_ne!(a.id(), b.id());
        assert!(!SharedRegion::same_region(&a, &b));
    }

    #[test]
    fn range_checks() {
        let r = SharedRegion::allocate(8);
        assert!(r.check_range(0, 8).is_ok());
        assert!(r.check_range(4, 4).is_ok());
        assert!(r.check_range(4, 5).is_err());
        assert!(r.check_range(usize::MAX, 2).is_err());
    }
}
