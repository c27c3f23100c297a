//! Fsverity as a capability of the host, not something this crate
//! assumes exists.
//!
//! The populator treats a failure to enable verity as advisory (see
//! [`crate::store`] step 7), but the capability itself reports the real
//! result so tests can observe what actually happened before that
//! swallowing occurs. The ioctl shape mirrors
//! `original_source/tools/mkcomposefs.c`'s `enable_verity`: a zeroed
//! `fsverity_enable_arg` with `hash_algorithm = FS_VERITY_HASH_ALG_SHA256`
//! and a 4096-byte block size, no salt, no signature.

use std::fs::File;
use std::io;

use rustix::ioctl::{ioctl, Updater, WriteOpcode};

/// Something that can try to turn on fsverity for a file.
pub trait VerityEnabler {
    fn enable_verity(&self, file: &File) -> io::Result<()>;
}

const FS_VERITY_HASH_ALG_SHA256: u32 = 1;

#[repr(C)]
#[derive(Debug, Default)]
struct FsverityEnableArg {
    version: u32,
    hash_algorithm: u32,
    block_size: u32,
    salt_size: u32,
    salt_ptr: u64,
    sig_size: u32,
    reserved1: u32,
    sig_ptr: u64,
    reserved: [u64; 11],
}

type EnableVerityOpcode = WriteOpcode<b'f', 133, FsverityEnableArg>;

/// Issues the real `FS_IOC_ENABLE_VERITY` ioctl via `rustix`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostVerityEnabler;

impl VerityEnabler for HostVerityEnabler {
    fn enable_verity(&self, file: &File) -> io::Result<()> {
        let mut arg = FsverityEnableArg {
            version: 1,
            hash_algorithm: FS_VERITY_HASH_ALG_SHA256,
            block_size: 4096,
            ..Default::default()
        };
        unsafe {
            let ctl = Updater::<EnableVerityOpcode, FsverityEnableArg>::new(&mut arg);
            ioctl(file, ctl)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) struct AlwaysFailVerityEnabler;

#[cfg(test)]
impl VerityEnabler for AlwaysFailVerityEnabler {
    fn enable_verity(&self, _file: &File) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "fsverity disabled for test",
        ))
    }
}
