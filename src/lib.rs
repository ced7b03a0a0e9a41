//! User-space FAT32 driver for raw disk images.
//!
//! [`FatFs`] mounts any `Read + Write + Seek` device holding a FAT32 volume
//! and offers path lookup, byte-addressed file access, and file creation and
//! deletion. Changes to the allocation table and the FSInfo sector are
//! cached and reach the device on [`FatFs::unmount`].

pub mod device;
pub mod error;
pub mod fs;

pub use error::{FatError, Result};
pub use fs::{Directory, Entry, Expect, FatFs, File, FileState, MountOptions};
