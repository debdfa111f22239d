/// Device number of the file system root disk.
pub const ROOTDEV: u32 = 1;

/// Max # of blocks any FS op writes, used to size the buffer pool.
pub const MAX_OP_BLOCKS: usize = 10;

/// Size of the disk block buffer pool.
pub const NBUF: usize = MAX_OP_BLOCKS * 3;

/// Number of hash buckets the buffer pool is sharded into.
pub const NBUCKET: usize = 13;

/// Size in bytes of a disk block.
pub const BSIZE: usize = 1024;
