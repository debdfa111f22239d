//! The kernel's block buffer cache: a thin binding of [`bcache`] to this
//! kernel's lock types and disk driver.
use bcache::{BlockBufferCache, BufGuard, TickClock};
use once_init::OnceInit;

use crate::{
    param::{BSIZE, NBUCKET, NBUF},
    sleeplock::SleepLock,
    spinlock::SpinLock,
    virtio_disk::{DiskError, VirtioDisk},
};

type Cache = BlockBufferCache<
    VirtioDisk,
    SpinLock<bcache::BucketState>,
    SpinLock<()>,
    SleepLock<bcache::Entry<BSIZE>>,
    TickClock,
    BSIZE,
>;

/// A locked handle to a cached disk block.
pub type Buf<'a> = BufGuard<
    'a,
    VirtioDisk,
    SpinLock<bcache::BucketState>,
    SpinLock<()>,
    SleepLock<bcache::Entry<BSIZE>>,
    TickClock,
    BSIZE,
>;

static BCACHE: OnceInit<Cache> = OnceInit::new();

/// Initializes the buffer cache and the disk it reads through.
///
/// # Panics
///
/// Panics if called more than once.
pub fn init() {
    let disk = VirtioDisk::new();
    disk.init();
    BCACHE.init(Cache::new(disk, TickClock::new(), NBUCKET, NBUF));
    log::info!("buffer cache initialized: {NBUCKET} buckets, {NBUF} buffers");
}

fn cache() -> &'static Cache {
    BCACHE.get()
}

/// Returns a locked buffer with the contents of the indicated block,
/// fetching it from disk on first use.
///
/// # Errors
///
/// Returns the disk's error if the underlying read fails.
///
/// # Panics
///
/// Panics if every buffer is pinned or otherwise in use (see
/// [`BlockBufferCache::get`](bcache::BlockBufferCache::get)).
pub fn read(dev: u32, blockno: u32) -> Result<Buf<'static>, DiskError> {
    cache().read(dev, blockno)
}

/// Writes `buf`'s contents to disk. `buf` must have been obtained from
/// [`read`].
///
/// # Errors
///
/// Returns the disk's error if the underlying write fails.
pub fn write(buf: &Buf<'static>) -> Result<(), DiskError> {
    cache().write(buf)
}
