use crate::bridge::host::{Host, HostContext};
use crate::error::HostError;

/// Ownership token for a host buffer that must outlive the call that pinned it.
///
/// Obtained from a host's pin operation and consumed by [`BufferRef::release`],
/// which needs the host context. A token dropped without being released is
/// leaked: the host handle is forgotten rather than released off-context.
pub struct BufferRef<H: Host> {
    handle: Option<H::Buffer>,
    ptr: *mut u8,
    len: usize,
}

// The raw span is only dereferenced through `&self`/`&mut self`, and the host
// keeps it in place while `handle` is retained.
unsafe impl<H: Host> Send for BufferRef<H> {}

impl<H: Host> BufferRef<H> {
    /// # Safety
    ///
    /// `ptr..ptr + len` must stay valid and in place for as long as `handle`
    /// is retained, and the host must not access those bytes until the
    /// reference is released.
    pub unsafe fn from_raw_parts(handle: H::Buffer, ptr: *mut u8, len: usize) -> Self {
        Self {
            handle: Some(handle),
            ptr,
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        if self.len == 0 || self.ptr.is_null() {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        if self.len == 0 || self.ptr.is_null() {
            return &mut [];
        }
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    pub fn release(mut self, cx: &mut dyn HostContext<H>) -> Result<(), HostError> {
        match self.handle.take() {
            Some(handle) => cx.release(handle),
            None => Ok(()),
        }
    }

    /// Gives up the token without releasing; the caller now owns the retention.
    pub(crate) fn into_handle(mut self) -> Option<H::Buffer> {
        self.handle.take()
    }
}

impl<H: Host> Drop for BufferRef<H> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            crate::tb_warn!(len = self.len, "buffer reference dropped without release, leaking it");
            std::mem::forget(handle);
        }
    }
}
