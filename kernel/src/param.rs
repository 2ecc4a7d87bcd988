/// Maximum number of processes.
pub const NPROC: usize = 64;

/// Maximum number of CPUs.
pub const NCPU: usize = 8;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Open files per system.
pub const NFILE: usize = 100;

/// Maximum number of active i-nodes.
pub const NINODE: usize = 50;

/// Maximum major device number.
pub const NDEV: usize = 10;

/// Device number of the file system root disk.
pub const ROOTDEV: u32 = 1;

/// Pseudo device number of procfs.
pub const PROCDEV: u32 = 2;

/// Max exec arguments.
pub const MAXARG: usize = 32;

/// Block size.
pub const BSIZE: usize = 512;

/// Max # of blocks any FS op writes.
pub const MAXOPBLOCKS: usize = 10;

/// Max data blocks in the on-disk log.
pub const LOGSIZE: usize = MAXOPBLOCKS * 3;

/// Size of the disk block cache. Must leave headroom above the largest
/// transaction (log blocks plus indirect, bitmap and two blocks of slop),
/// or a single big write could deadlock waiting for buffers it pinned.
pub const NBUF: usize = LOGSIZE + MAXOPBLOCKS;

/// Maximum file path name.
pub const MAXPATH: usize = 128;

/// Maximum length of a process name.
pub const MAXPROCNAME: usize = 16;

/// Maximum number of supplementary groups per process.
pub const NGROUPS_MAX: usize = 16;

/// Interpreter nesting allowed by exec for `#!` scripts.
pub const MAXSHEBANG: usize = 5;
