use anyhow::{Context, Result, ensure};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;

const AREA_ALIGNMENT: usize = 64;

/// Zeroed, aligned host memory backing one exchange buffer.
///
/// The engine treats the host address as the bus address of the region.
pub struct DmaArea {
    ptr: NonNull<u8>,
    layout: Layout,
}

unsafe impl Send for DmaArea {}
unsafe impl Sync for DmaArea {}

impl DmaArea {
    pub fn new(len: usize) -> Result<Self> {
        ensure!(len > 0, "dma area length must be positive");
        let layout = Layout::from_size_align(len, AREA_ALIGNMENT).context("dma area layout")?;
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).context("allocate dma area")?;
        Ok(Self { ptr, layout })
    }

    pub fn bus_addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for DmaArea {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

impl std::fmt::Debug for DmaArea {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaArea")
            .field("bus_addr", &format_args!("{:#x}", self.bus_addr()))
            .field("len", &self.len())
            .finish()
    }
}
