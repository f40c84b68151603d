//! Shared handles to the fixed-size buffers holding block contents.

use bytes::Bytes;
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

/// A fixed-size in-memory buffer holding (or about to hold) the contents of one block.
///
/// Cloning a [Page] produces another handle to the same buffer. Pages are only created and
/// reclaimed by an [crate::alloc::Allocator].
#[derive(Clone)]
pub struct Page {
    data: Arc<Mutex<Box<[u8]>>>,
}

impl Page {
    /// Wrap `data` in a new page.
    pub(crate) fn new(data: Box<[u8]>) -> Self {
        Self {
            data: Arc::new(Mutex::new(data)),
        }
    }

    /// Return a new page of `size` zeroed bytes.
    pub(crate) fn zeroed(size: usize) -> Self {
        Self::new(vec![0; size].into_boxed_slice())
    }

    /// Recover the underlying buffer if this is the only handle to it.
    pub(crate) fn into_inner(self) -> Option<Box<[u8]>> {
        Arc::into_inner(self.data).map(|data| data.into_inner().unwrap())
    }

    /// The size of the page in bytes.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the page holds zero bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lock the page for reading.
    pub fn read(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.data.lock().unwrap()
    }

    /// Lock the page for writing.
    pub fn write(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.data.lock().unwrap()
    }

    /// Copy the current contents of the page.
    pub fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.read())
    }

    /// Whether `self` and `other` are handles to the same buffer.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("ptr", &Arc::as_ptr(&self.data))
            .finish()
    }
}
