use crate::kfd::ioctl::{
    AMDKFD_IOC_GET_VERSION, AMDKFD_IOC_SMI_EVENTS, GetVersionArgs, SmiEventsArgs,
};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Arc;

/// A handle to the KFD driver character device (`/dev/kfd`).
///
/// The file is held in an `Arc` so the event notifier and anything else that needs the driver
/// can share one descriptor.
#[derive(Clone, Debug)]
pub struct KfdDevice {
    pub file: Arc<File>,
}

impl KfdDevice {
    /// Opens `/dev/kfd` (or whatever `path` redirects it to) read-write.
    ///
    /// # Errors
    /// The `open(2)` failure, typically `ENOENT` without amdgpu or `EACCES` outside the
    /// render group.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        Ok(Self {
            file: Arc::new(file),
        })
    }

    /// # Safety
    /// `T` must be the argument struct the kernel expects for `cmd`.
    unsafe fn ioctl<T>(&self, cmd: u32, arg: &mut T) -> io::Result<()> {
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), cmd as _, arg as *mut T) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// KFD interface version, logged when the event notifier first opens the driver.
    ///
    /// # Errors
    /// The ioctl failure.
    pub fn get_version(&self) -> io::Result<GetVersionArgs> {
        let mut args = GetVersionArgs::default();
        // SAFETY: GET_VERSION takes a `GetVersionArgs`.
        unsafe { self.ioctl(AMDKFD_IOC_GET_VERSION, &mut args)? };
        Ok(args)
    }

    /// Opens the SMI event stream for `gpu_id` and returns its descriptor.
    ///
    /// The caller owns the returned descriptor.
    ///
    /// # Errors
    /// The ioctl failure, e.g. `EINVAL` for an unknown `gpu_id`.
    pub fn smi_events(&self, gpu_id: u32) -> io::Result<i32> {
        let mut args = SmiEventsArgs { gpu_id, anon_fd: 0 };
        // SAFETY: SMI_EVENTS takes a `SmiEventsArgs`.
        unsafe { self.ioctl(AMDKFD_IOC_SMI_EVENTS, &mut args)? };
        #[allow(clippy::cast_possible_wrap)]
        Ok(args.anon_fd as i32)
    }
}
