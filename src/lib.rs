//! System management for AMD GPUs on Linux.
//!
//! Devices are discovered from the amdgpu DRM sysfs tree and bound to their KFD topology nodes.
//! [`smi::RocmSmi`] owns the session; [`smi::SmiState`] carries the accessors. The `rsmi_*`
//! C ABI in [`ffi`] wraps the same session in a process-wide instance.

pub mod api;
pub mod config;
pub mod counters;
pub mod device;
pub mod discovery;
pub mod error;
pub mod ffi;
pub mod func_iter;
pub mod kfd;
pub mod logging;
pub mod smi;
pub mod sysfs;
pub mod topology;
pub mod utils;

pub use config::{Config, InitFlags};
pub use error::{RsmiError, RsmiResult, Status};
pub use smi::{RocmSmi, SmiState};
