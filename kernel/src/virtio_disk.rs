//! The disk driver the buffer cache reads through.
//!
//! The virtio queue protocol itself is out of scope here; this module is
//! the thin, opaque collaborator the cache calls into, matching the FFI
//! boundary the original driver crossed into C.
use bcache::BlockDevice;

use crate::param::BSIZE;

mod ffi {
    unsafe extern "C" {
        pub fn virtio_disk_init();
        pub fn virtio_disk_rw(dev: u32, blockno: u32, data: *mut u8, write: i32) -> i32;
    }
}

/// A block device backed by the virtio-blk driver.
#[derive(Debug, Default)]
pub struct VirtioDisk {
    _private: (),
}

impl VirtioDisk {
    pub const fn new() -> Self {
        Self { _private: () }
    }

    pub fn init(&self) {
        unsafe {
            ffi::virtio_disk_init();
        }
    }
}

/// An error reported by the virtio queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("virtio disk request failed with status {0}")]
pub struct DiskError(pub i32);

impl BlockDevice<BSIZE> for VirtioDisk {
    type Error = DiskError;

    fn read(&self, dev: u32, blockno: u32, data: &mut [u8; BSIZE]) -> Result<(), Self::Error> {
        let status = unsafe { ffi::virtio_disk_rw(dev, blockno, data.as_mut_ptr(), 0) };
        if status == 0 { Ok(()) } else { Err(DiskError(status)) }
    }

    fn write(&self, dev: u32, blockno: u32, data: &[u8; BSIZE]) -> Result<(), Self::Error> {
        let status = unsafe { ffi::virtio_disk_rw(dev, blockno, data.as_ptr().cast_mut(), 1) };
        if status == 0 { Ok(()) } else { Err(DiskError(status)) }
    }
}
