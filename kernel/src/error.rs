//! Kernel-wide error type.
//!
//! Kernel routines return `Result<T>`; the syscall layer turns an `Err`
//! into a negative errno in the trap frame, which the user-space stubs
//! translate into `errno` plus a `-1` return. The numbering follows the
//! classical Unix values so the user-space headers can share it.

/// Error number.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    EPERM = 1,     /* Operation not permitted */
    ENOENT = 2,    /* No such file or directory */
    ESRCH = 3,     /* No such process */
    EINTR = 4,     /* Interrupted system call */
    EIO = 5,       /* I/O error */
    ENXIO = 6,     /* No such device or address */
    E2BIG = 7,     /* Argument list too long */
    ENOEXEC = 8,   /* Exec format error */
    EBADF = 9,     /* Bad file number */
    ECHILD = 10,   /* No child processes */
    EAGAIN = 11,   /* Try again */
    ENOMEM = 12,   /* Out of memory */
    EACCES = 13,   /* Permission denied */
    EFAULT = 14,   /* Bad address */
    EBUSY = 16,    /* Device or resource busy */
    EEXIST = 17,   /* File exists */
    EXDEV = 18,    /* Cross-device link */
    ENODEV = 19,   /* No such device */
    ENOTDIR = 20,  /* Not a directory */
    EISDIR = 21,   /* Is a directory */
    EINVAL = 22,   /* Invalid argument */
    ENFILE = 23,   /* File table overflow */
    EMFILE = 24,   /* Too many open files */
    EFBIG = 27,    /* File too large */
    ENOSPC = 28,   /* No space left on device */
    EROFS = 30,    /* Read-only file system */
    EMLINK = 31,   /* Too many links */
    EPIPE = 32,    /* Broken pipe */
    ENOSYS = 38,   /* Invalid system call number */
    ENOTEMPTY = 39, /* Directory not empty */
    ELOOP = 40,    /* Too many levels of nesting */
}

pub type Result<T> = core::result::Result<T, KernelError>;

impl KernelError {
    /// The value the syscall layer leaves in `eax`: `-errno`.
    pub const fn to_ret(self) -> i32 {
        -(self as i32)
    }
}
