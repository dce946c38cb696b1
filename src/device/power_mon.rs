use crate::error::{RsmiError, RsmiResult, Status};
use crate::sysfs;
use std::path::{Path, PathBuf};
use tracing::trace;

const PM_INFO_FILE: &str = "amdgpu_pm_info";
const MAX_GPU_POWER_TAG: &str = "(max GPU)";

/// Power readings from `<debugfs>/dri/<N>/amdgpu_pm_info`.
#[derive(Debug, Clone)]
pub struct PowerMon {
    path: PathBuf,
}

impl PowerMon {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// The debugfs directory of DRM minor `index`.
    #[must_use]
    pub fn for_dri_index(debugfs_dri_root: &Path, index: u32) -> Self {
        Self::new(debugfs_dri_root.join(index.to_string()))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Maximum GPU power in milliwatts.
    ///
    /// # Errors
    /// `EPERM` when the summary line is missing (the file is only fully populated for root).
    pub fn max_gpu_power(&self) -> RsmiResult<u64> {
        let path = self.path.join(PM_INFO_FILE);
        let content = sysfs::read_all(&path)?;
        let power = parse_max_gpu_power(&content).map_err(|e| match e {
            RsmiError::Status(Status::NotSupported) => {
                RsmiError::sysfs(&path, std::io::Error::from_raw_os_error(libc::EPERM))
            }
            other => other,
        })?;
        trace!(path = %path.display(), power, "max gpu power");
        Ok(power)
    }
}

/// Finds the `"<watts> W (max GPU)"` line and converts it to milliwatts.
///
/// # Errors
/// `NotSupported` if the line is absent, `UnexpectedData` for any unit other than `W`.
pub fn parse_max_gpu_power(content: &str) -> RsmiResult<u64> {
    let line = content
        .lines()
        .find(|l| l.contains(MAX_GPU_POWER_TAG))
        .ok_or(RsmiError::Status(Status::NotSupported))?;

    let mut tokens = line.split_whitespace();
    let watts: f64 = tokens
        .next()
        .and_then(|t| t.parse().ok())
        .ok_or(RsmiError::Status(Status::UnexpectedData))?;
    if tokens.next() != Some("W") {
        return Err(Status::UnexpectedData.into());
    }
    #[allow(clippy::cast_precision_loss)]
    let limit = u64::MAX as f64 / 1000.0;
    if !(0.0..=limit).contains(&watts) {
        return Err(Status::UnexpectedData.into());
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let milliwatts = (watts * 1000.0) as u64;
    Ok(milliwatts)
}
