use crate::utils::{ior, iowr};

// ===============================================================================================
// Constants and Versioning
// ===============================================================================================

pub const KFD_IOCTL_BASE: u32 = 0x4B; // 'K'

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GetVersionArgs {
    pub major_version: u32,
    pub minor_version: u32,
}

// ===============================================================================================
// SMI (System Management Interface)
// ===============================================================================================

/// Returned by the driver in `anon_fd`: a per-GPU event stream.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct SmiEventsArgs {
    pub gpu_id: u32,
    pub anon_fd: u32,
}

pub const KFD_SMI_EVENT_VMFAULT: u32 = 1;
pub const KFD_SMI_EVENT_THERMAL_THROTTLE: u32 = 2;
pub const KFD_SMI_EVENT_GPU_PRE_RESET: u32 = 3;
pub const KFD_SMI_EVENT_GPU_POST_RESET: u32 = 4;

/// Mask bit for an SMI event id.
#[must_use]
pub const fn kfd_smi_event_mask_from_index(id: u32) -> u64 {
    1u64 << (id - 1)
}

// ===============================================================================================
// IOCTL Numbers
// ===============================================================================================

pub const AMDKFD_IOC_GET_VERSION: u32 = ior::<GetVersionArgs>(KFD_IOCTL_BASE, 0x01);
pub const AMDKFD_IOC_SMI_EVENTS: u32 = iowr::<SmiEventsArgs>(KFD_IOCTL_BASE, 0x1F);
