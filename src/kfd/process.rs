use crate::error::{RsmiError, RsmiResult};
use crate::sysfs;
use crate::utils::is_number;
use std::collections::BTreeSet;
use std::io;
use std::path::Path;
use tracing::{debug, warn};

/// Per-process GPU accounting (`rsmi_process_info_t`).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessInfo {
    pub process_id: u32,
    pub pasid: u32,
    pub vram_usage: u64,
    pub sdma_usage: u64,
    /// Percentage of the compute units of the GPUs in use.
    pub cu_occupancy: u32,
}

fn einval(path: &Path) -> RsmiError {
    RsmiError::sysfs(path, io::Error::from_raw_os_error(libc::EINVAL))
}

fn read_number(path: &Path) -> RsmiResult<u64> {
    let token = sysfs::read_token(path)?;
    if !is_number(&token) {
        return Err(einval(path));
    }
    token.parse().map_err(|_| einval(path))
}

/// Every process that currently has a KFD context, with its pasid.
///
/// Processes whose pasid cannot be read (they exited mid-walk) are skipped.
///
/// # Errors
/// Fails if the proc root cannot be listed or a pasid is not numeric.
pub fn list_processes(proc_root: &Path) -> RsmiResult<Vec<ProcessInfo>> {
    std::fs::read_dir(proc_root).map_err(|e| RsmiError::sysfs(proc_root, e))?;

    let mut procs = Vec::new();
    for (pid, dir) in sysfs::numeric_entries(proc_root) {
        let pasid_path = dir.join("pasid");
        let pasid = match sysfs::read_token(&pasid_path) {
            Ok(p) => p,
            Err(e) => {
                debug!(pid, error = %e, "skipping process without pasid");
                continue;
            }
        };
        if !is_number(&pasid) {
            return Err(einval(&pasid_path));
        }
        procs.push(ProcessInfo {
            process_id: pid,
            pasid: pasid.parse().map_err(|_| einval(&pasid_path))?,
            ..ProcessInfo::default()
        });
    }
    Ok(procs)
}

/// The set of KFD gpu ids `pid` has queues on.
///
/// # Errors
/// `ESRCH` when the process has no queues directory, `ENXIO` on a malformed gpu id.
pub fn process_gpus(proc_root: &Path, pid: u32) -> RsmiResult<BTreeSet<u64>> {
    let queues = proc_root.join(pid.to_string()).join("queues");
    if !queues.is_dir() {
        return Err(RsmiError::sysfs(
            &queues,
            io::Error::from_raw_os_error(libc::ESRCH),
        ));
    }

    let mut gpus = BTreeSet::new();
    for (_, queue) in sysfs::numeric_entries(&queues) {
        let path = queue.join("gpuid");
        let Ok(raw) = sysfs::read_token(&path) else {
            continue;
        };
        match raw.parse::<u64>() {
            Ok(gpu_id) => {
                gpus.insert(gpu_id);
            }
            Err(_) => {
                warn!(path = %path.display(), value = %raw, "invalid gpu id in queue");
                return Err(RsmiError::sysfs(
                    &path,
                    io::Error::from_raw_os_error(libc::ENXIO),
                ));
            }
        }
    }
    Ok(gpus)
}

/// Accounting for `pid` summed over `gpus`.
///
/// `cu_count_of` resolves a gpu id to that GPU's compute-unit count. CU occupancy is only
/// counted for GPUs that expose `stats_<gpu>/cu_occupancy`.
///
/// # Errors
/// `ESRCH` if the process is gone, `EINVAL` on non-numeric counters.
pub fn process_info_for_pid<F>(
    proc_root: &Path,
    pid: u32,
    gpus: &BTreeSet<u64>,
    cu_count_of: F,
) -> RsmiResult<ProcessInfo>
where
    F: Fn(u64) -> Option<u64>,
{
    let dir = proc_root.join(pid.to_string());
    if !dir.exists() {
        return Err(RsmiError::sysfs(
            &dir,
            io::Error::from_raw_os_error(libc::ESRCH),
        ));
    }

    let pasid_path = dir.join("pasid");
    let pasid = read_number(&pasid_path)?;
    let mut info = ProcessInfo {
        process_id: pid,
        pasid: u32::try_from(pasid).map_err(|_| einval(&pasid_path))?,
        ..ProcessInfo::default()
    };

    let mut occupancy = 0u64;
    let mut cu_total = 0u64;
    for gpu in gpus {
        info.vram_usage += read_number(&dir.join(format!("vram_{gpu}")))?;
        info.sdma_usage += read_number(&dir.join(format!("sdma_{gpu}")))?;

        let cu_path = dir.join(format!("stats_{gpu}")).join("cu_occupancy");
        if let Ok(token) = sysfs::read_token(&cu_path) {
            if !is_number(&token) {
                return Err(einval(&cu_path));
            }
            occupancy += token.parse::<u64>().map_err(|_| einval(&cu_path))?;
            cu_total += cu_count_of(*gpu).unwrap_or(0);
        }
    }

    if cu_total > 0 {
        occupancy = occupancy * 100 / cu_total;
    }
    info.cu_occupancy = u32::try_from(occupancy).unwrap_or(u32::MAX);
    Ok(info)
}
