use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::errors::BufferPoolExhausted;

/// Smallest allocation unit handed out by the pool.
pub const MIN_REGION_SIZE: usize = 256;

/// Bounded arena for append buffers and partition keys. One pool is shared
/// by all shards of a dataset. Freed regions return to per-size-class
/// freelists; there is no compaction.
///
/// Cheap to clone, all clones share the same arena.
#[derive(Clone)]
pub struct NativeBufferPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    capacity: usize,
    bytes_free: AtomicUsize,
    // One freelist per power-of-two size class, smallest first.
    classes: Vec<SizeClass>,
    tags: Vec<(String, String)>,
}

struct SizeClass {
    region_size: usize,
    freelist: Mutex<Vec<Box<[u8]>>>,
}

impl NativeBufferPool {
    pub fn new(capacity: usize, tags: Vec<(String, String)>) -> NativeBufferPool {
        let mut classes = Vec::new();
        let mut region_size = MIN_REGION_SIZE;
        while region_size <= capacity.max(MIN_REGION_SIZE) {
            classes.push(SizeClass {
                region_size,
                freelist: Mutex::new(Vec::new()),
            });
            region_size *= 2;
        }
        NativeBufferPool {
            shared: Arc::new(PoolShared {
                capacity,
                bytes_free: AtomicUsize::new(capacity),
                classes,
                tags,
            }),
        }
    }

    /// Hands out a region of at least `size` bytes, or signals exhaustion.
    /// The region returns to the pool when dropped.
    pub fn allocate(&self, size: usize) -> Result<Region, BufferPoolExhausted> {
        let class = self
            .shared
            .classes
            .iter()
            .position(|c| c.region_size >= size)
            .ok_or(BufferPoolExhausted)?;
        let region_size = self.shared.classes[class].region_size;
        self.reserve(region_size)?;
        let buf = {
            let mut freelist = self.shared.classes[class].freelist.lock().unwrap();
            freelist.pop()
        };
        let buf = buf.unwrap_or_else(|| vec![0u8; region_size].into_boxed_slice());
        Ok(Region {
            buf: Some(buf),
            class,
            pool: Arc::clone(&self.shared),
        })
    }

    fn reserve(&self, bytes: usize) -> Result<(), BufferPoolExhausted> {
        let mut free = self.shared.bytes_free.load(Ordering::SeqCst);
        loop {
            if free < bytes {
                return Err(BufferPoolExhausted);
            }
            match self.shared.bytes_free.compare_exchange(
                free,
                free - bytes,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => free = actual,
            }
        }
    }

    pub fn bytes_free(&self) -> usize {
        self.shared.bytes_free.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn tags(&self) -> &[(String, String)] {
        &self.shared.tags
    }
}

/// An owned slice of pool memory. Dropping the region recycles its bytes
/// into the originating size-class freelist.
pub struct Region {
    buf: Option<Box<[u8]>>,
    class: usize,
    pool: Arc<PoolShared>,
}

impl Region {
    pub fn capacity(&self) -> usize {
        self.pool.classes[self.class].region_size
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_ref().unwrap()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf.as_mut().unwrap()
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            let class = &self.pool.classes[self.class];
            class.freelist.lock().unwrap().push(buf);
            self.pool
                .bytes_free
                .fetch_add(class.region_size, Ordering::SeqCst);
        }
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_rounds_up_to_size_class() {
        let pool = NativeBufferPool::new(4096, vec![]);
        let region = pool.allocate(300).unwrap();
        assert_eq!(region.capacity(), 512);
        assert_eq!(pool.bytes_free(), 4096 - 512);
    }

    #[test]
    fn test_drop_recycles_bytes() {
        let pool = NativeBufferPool::new(1024, vec![]);
        let region = pool.allocate(1000).unwrap();
        assert_eq!(pool.bytes_free(), 0);
        drop(region);
        assert_eq!(pool.bytes_free(), 1024);
        // The next allocation of the same class reuses the freed buffer.
        let region = pool.allocate(1000).unwrap();
        assert_eq!(region.capacity(), 1024);
    }

    #[test]
    fn test_exhaustion() {
        let pool = NativeBufferPool::new(1024, vec![]);
        let _a = pool.allocate(512).unwrap();
        let _b = pool.allocate(512).unwrap();
        assert!(pool.allocate(1).is_err());
        assert_eq!(pool.bytes_free(), 0);
    }

    #[test]
    fn test_oversized_request_rejected() {
        let pool = NativeBufferPool::new(1024, vec![]);
        assert!(pool.allocate(2048).is_err());
    }
}
