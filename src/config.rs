use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use tracing::warn;

// ===============================================================================================
// Init flags
// ===============================================================================================

/// Flags accepted by `rsmi_init`. Only honoured on the first (0 -> 1) initialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitFlags(pub u64);

impl InitFlags {
    /// Attempt to add every DRM card, not just AMD ones.
    pub const ALL_GPUS: u64 = 0x1;
    /// Device mutexes are try-locked; contention surfaces as `Busy`.
    pub const NON_BLOCKING: u64 = 0x0800_0000_0000_0000;

    #[must_use]
    pub const fn all_gpus(self) -> bool {
        self.0 & Self::ALL_GPUS != 0
    }

    #[must_use]
    pub const fn non_blocking(self) -> bool {
        self.0 & Self::NON_BLOCKING != 0
    }
}

// ===============================================================================================
// Filesystem roots
// ===============================================================================================

const DRM_ROOT: &str = "/sys/class/drm";
const KFD_NODES_ROOT: &str = "/sys/class/kfd/kfd/topology/nodes";
const KFD_PROC_ROOT: &str = "/sys/class/kfd/kfd/proc";
const DEBUGFS_DRI_ROOT: &str = "/sys/kernel/debug/dri";
const EVENT_SOURCE_ROOT: &str = "/sys/bus/event_source/devices";
const KFD_DEVICE: &str = "/dev/kfd";
const DRIVER_VERSION_FILE: &str = "/sys/module/amdgpu/version";

/// Debug tracing bits from `RSMI_DEBUG_BITFIELD`.
pub const DEBUG_TRACE_PATHS: u64 = 0x1;
pub const DEBUG_TRACE_VALUES: u64 = 0x2;

/// Every path the library touches, plus the debug overrides that redirect them.
#[derive(Debug, Clone)]
pub struct Config {
    pub drm_root: PathBuf,
    pub kfd_nodes_root: PathBuf,
    pub kfd_proc_root: PathBuf,
    pub debugfs_dri_root: PathBuf,
    pub event_source_root: PathBuf,
    pub kfd_device: PathBuf,
    pub driver_version_file: PathBuf,

    pub debug_bitfield: u64,
    pub drm_root_override: Option<PathBuf>,
    pub hwmon_root_override: Option<PathBuf>,
    pub pp_root_override: Option<PathBuf>,
    /// Attribute ids whose reads and writes are routed to `drm_root_override`.
    pub enum_overrides: HashSet<u32>,
    pub logging_level: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            drm_root: DRM_ROOT.into(),
            kfd_nodes_root: KFD_NODES_ROOT.into(),
            kfd_proc_root: KFD_PROC_ROOT.into(),
            debugfs_dri_root: DEBUGFS_DRI_ROOT.into(),
            event_source_root: EVENT_SOURCE_ROOT.into(),
            kfd_device: KFD_DEVICE.into(),
            driver_version_file: DRIVER_VERSION_FILE.into(),
            debug_bitfield: 0,
            drm_root_override: None,
            hwmon_root_override: None,
            pp_root_override: None,
            enum_overrides: HashSet::new(),
            logging_level: 0,
        }
    }
}

impl Config {
    /// Re-roots every system path under `root`, keeping the usual relative layout.
    #[must_use]
    pub fn with_root(root: &Path) -> Self {
        let under = |abs: &str| root.join(abs.trim_start_matches('/'));
        Self {
            drm_root: under(DRM_ROOT),
            kfd_nodes_root: under(KFD_NODES_ROOT),
            kfd_proc_root: under(KFD_PROC_ROOT),
            debugfs_dri_root: under(DEBUGFS_DRI_ROOT),
            event_source_root: under(EVENT_SOURCE_ROOT),
            kfd_device: under(KFD_DEVICE),
            driver_version_file: under(DRIVER_VERSION_FILE),
            ..Self::default()
        }
    }

    /// Live system paths with the `RSMI_*` environment overrides applied.
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env(|key| env::var(key).ok());
        cfg
    }

    /// Applies overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("RSMI_DEBUG_BITFIELD") {
            match parse_number(&v) {
                Some(bits) => self.debug_bitfield = bits,
                None => warn!(value = %v, "ignoring unparsable RSMI_DEBUG_BITFIELD"),
            }
        }

        let non_empty_path = |key: &str| lookup(key).filter(|v| !v.is_empty()).map(PathBuf::from);
        if let Some(p) = non_empty_path("RSMI_DEBUG_DRM_ROOT_OVERRIDE") {
            self.drm_root_override = Some(p);
        }
        if let Some(p) = non_empty_path("RSMI_DEBUG_HWMON_ROOT_OVERRIDE") {
            self.hwmon_root_override = Some(p);
        }
        if let Some(p) = non_empty_path("RSMI_DEBUG_PP_ROOT_OVERRIDE") {
            self.pp_root_override = Some(p);
        }

        if let Some(v) = lookup("RSMI_DEBUG_ENUM_OVERRIDE") {
            for item in v.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                match item.parse::<u32>() {
                    Ok(id) => {
                        self.enum_overrides.insert(id);
                    }
                    Err(_) => warn!(item, "ignoring unparsable RSMI_DEBUG_ENUM_OVERRIDE entry"),
                }
            }
        }

        if let Some(v) = lookup("RSMI_LOGGING") {
            match v.trim().parse::<u32>() {
                Ok(level) => self.logging_level = level,
                Err(_) => warn!(value = %v, "ignoring unparsable RSMI_LOGGING"),
            }
        }
    }

    #[must_use]
    pub const fn trace_paths(&self) -> bool {
        self.debug_bitfield & DEBUG_TRACE_PATHS != 0
    }

    #[must_use]
    pub const fn trace_values(&self) -> bool {
        self.debug_bitfield & DEBUG_TRACE_VALUES != 0
    }

    /// The override root for attribute `id`, if one applies.
    #[must_use]
    pub fn override_for(&self, id: u32) -> Option<&Path> {
        self.drm_root_override
            .as_deref()
            .filter(|_| self.enum_overrides.contains(&id))
    }
}

fn parse_number(s: &str) -> Option<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}
