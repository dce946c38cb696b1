//! One DRM card and everything hanging off it.

pub mod attribute;
pub mod capability;
pub mod gpu_metrics;
pub mod monitor;
pub mod power_mon;

use crate::config::Config;
use crate::error::{RsmiError, RsmiResult, Status};
use crate::sysfs;
use crate::utils::numeric_suffix;
use attribute::{DevAttr, PerfLevel, ReadKind};
use capability::{DEVICE_FUNCS, FileSet, MONITOR_FUNCS, SensorTag, SupportedFuncMap};
use gpu_metrics::{GpuMetrics, HeaderCache, MAX_BLOB_SIZE, MetricsHeader, MetricsRecord};
use monitor::Monitor;
use power_mon::PowerMon;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, TryLockError};
use std::time::Instant;
use tracing::{debug, trace};

/// Subdirectories of `<card>/device` that carry capability-relevant files.
const CAPABILITY_SUBDIRS: [&str; 2] = ["ras", "fw_version"];

#[derive(Debug)]
pub struct Device {
    path: PathBuf,
    card_index: u32,
    config: Arc<Config>,

    pub(crate) bdf: Option<u64>,
    pub(crate) drm_render_minor: u32,
    pub(crate) kfd_gpu_id: u64,
    pub(crate) kfd_node_index: Option<u32>,
    pub(crate) event_groups: BTreeSet<u32>,

    monitor: Option<Monitor>,
    power_mon: PowerMon,

    supported: OnceLock<SupportedFuncMap>,
    metrics_header: Mutex<HeaderCache>,
    mutex: Mutex<()>,
}

impl Device {
    /// Wraps the card directory `path` (e.g. `/sys/class/drm/card0`).
    #[must_use]
    pub fn new(path: PathBuf, card_index: u32, config: Arc<Config>) -> Self {
        let monitor = match &config.hwmon_root_override {
            Some(dir) => Some(dir.clone()),
            None => monitor::find_hwmon(&path),
        }
        .map(Monitor::new);

        let pp_root = config
            .pp_root_override
            .as_deref()
            .unwrap_or(&config.debugfs_dri_root);
        let power_mon = PowerMon::for_dri_index(pp_root, card_index);

        let drm_render_minor = render_minor(&path);
        debug!(
            card = card_index,
            path = %path.display(),
            render_minor = drm_render_minor,
            hwmon = ?monitor.as_ref().map(|m| m.path().display().to_string()),
            "device created"
        );

        Self {
            path,
            card_index,
            config,
            bdf: None,
            drm_render_minor,
            kfd_gpu_id: 0,
            kfd_node_index: None,
            event_groups: BTreeSet::new(),
            monitor,
            power_mon,
            supported: OnceLock::new(),
            metrics_header: Mutex::new(HeaderCache::default()),
            mutex: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn card_index(&self) -> u32 {
        self.card_index
    }

    /// BDF identifier including the partition nibble; zero before discovery resolves it.
    #[must_use]
    pub fn bdf(&self) -> u64 {
        self.bdf.unwrap_or(0)
    }

    #[must_use]
    pub const fn drm_render_minor(&self) -> u32 {
        self.drm_render_minor
    }

    #[must_use]
    pub const fn kfd_gpu_id(&self) -> u64 {
        self.kfd_gpu_id
    }

    #[must_use]
    pub fn monitor(&self) -> Option<&Monitor> {
        self.monitor.as_ref()
    }

    /// # Errors
    /// `NotSupported` when the card has no AMD hwmon directory.
    pub fn require_monitor(&self) -> RsmiResult<&Monitor> {
        self.monitor
            .as_ref()
            .ok_or(RsmiError::Status(Status::NotSupported))
    }

    #[must_use]
    pub fn power_mon(&self) -> &PowerMon {
        &self.power_mon
    }

    #[must_use]
    pub fn event_groups(&self) -> &BTreeSet<u32> {
        &self.event_groups
    }

    // -------------------------------------------------------------------------------------------
    // Concurrency
    // -------------------------------------------------------------------------------------------

    /// Serializes sysfs access to this device.
    ///
    /// # Errors
    /// In non-blocking mode a contended lock is `Busy`.
    pub fn guard(&self, non_blocking: bool) -> RsmiResult<MutexGuard<'_, ()>> {
        if !non_blocking {
            return Ok(self.mutex.lock().unwrap_or_else(PoisonError::into_inner));
        }
        match self.mutex.try_lock() {
            Ok(g) => Ok(g),
            Err(TryLockError::Poisoned(p)) => Ok(p.into_inner()),
            Err(TryLockError::WouldBlock) => Err(Status::Busy.into()),
        }
    }

    // -------------------------------------------------------------------------------------------
    // Attribute access
    // -------------------------------------------------------------------------------------------

    /// Resolves `attr`, honouring the DRM-root debug override for reads and writes.
    #[must_use]
    pub fn attr_path(&self, attr: DevAttr, for_write: bool) -> PathBuf {
        let path = match self.config.override_for(attr.id()) {
            Some(root) if for_write => {
                let mut write_root = root.as_os_str().to_owned();
                write_root.push(".write");
                PathBuf::from(write_root).join("device").join(attr.file_name())
            }
            Some(root) => root.join("device").join(attr.file_name()),
            None => self.path.join("device").join(attr.file_name()),
        };
        if self.config.trace_paths() {
            trace!(card = self.card_index, ?attr, path = %path.display(), "attribute path");
        }
        path
    }

    fn trace_value(&self, attr: DevAttr, value: &dyn std::fmt::Debug) {
        if self.config.trace_values() {
            trace!(card = self.card_index, ?attr, ?value, "attribute value");
        }
    }

    /// Numeric attribute, decoded as hex or decimal per the catalogue.
    ///
    /// # Errors
    /// `InvalidArgs` for attributes that are not numeric.
    pub fn read_u64(&self, attr: DevAttr) -> RsmiResult<u64> {
        let path = self.attr_path(attr, false);
        let value = match attr.read_kind() {
            ReadKind::Hex => sysfs::read_hex_u64(&path)?,
            ReadKind::Decimal => sysfs::read_u64(&path)?,
            _ => return Err(Status::InvalidArgs.into()),
        };
        self.trace_value(attr, &value);
        Ok(value)
    }

    /// First token of the attribute.
    pub fn read_str(&self, attr: DevAttr) -> RsmiResult<String> {
        if !attr.readable_as_token() && attr.read_kind() != ReadKind::Token {
            return Err(Status::InvalidArgs.into());
        }
        let value = sysfs::read_token(&self.attr_path(attr, false))?;
        self.trace_value(attr, &value);
        Ok(value)
    }

    /// First line of the attribute, spaces included.
    pub fn read_line(&self, attr: DevAttr) -> RsmiResult<String> {
        let value = sysfs::read_line(&self.attr_path(attr, false))?;
        self.trace_value(attr, &value);
        Ok(value)
    }

    pub fn read_lines(&self, attr: DevAttr) -> RsmiResult<Vec<String>> {
        if attr.read_kind() != ReadKind::MultiLine {
            return Err(Status::InvalidArgs.into());
        }
        let value = sysfs::read_lines(&self.attr_path(attr, false))?;
        self.trace_value(attr, &value);
        Ok(value)
    }

    pub fn read_binary(&self, attr: DevAttr, max_len: usize) -> RsmiResult<Vec<u8>> {
        if attr.read_kind() != ReadKind::Binary {
            return Err(Status::InvalidArgs.into());
        }
        sysfs::read_binary(&self.attr_path(attr, false), max_len)
    }

    /// Numeric write. The performance level is written as its keyword.
    ///
    /// # Errors
    /// `InvalidArgs` for attributes that do not take numbers or unknown performance levels.
    pub fn write_u64(&self, attr: DevAttr, value: u64) -> RsmiResult<()> {
        if !attr.writable_as_u64() {
            return Err(Status::InvalidArgs.into());
        }
        let text = if attr == DevAttr::PerfLevel {
            PerfLevel::from_raw(value)
                .ok_or(RsmiError::Status(Status::InvalidArgs))?
                .keyword()
                .to_string()
        } else {
            value.to_string()
        };
        self.trace_value(attr, &text);
        sysfs::write_str(&self.attr_path(attr, true), &text)
    }

    pub fn write_str(&self, attr: DevAttr, value: &str) -> RsmiResult<()> {
        if !attr.writable_as_str() {
            return Err(Status::InvalidArgs.into());
        }
        self.trace_value(attr, &value);
        sysfs::write_str(&self.attr_path(attr, true), value)
    }

    // -------------------------------------------------------------------------------------------
    // Capabilities
    // -------------------------------------------------------------------------------------------

    /// The capability map, derived on first use and fixed afterwards.
    pub fn supported_funcs(&self) -> &SupportedFuncMap {
        self.supported.get_or_init(|| {
            let files = FileSet::scan(&self.path.join("device"), &CAPABILITY_SUBDIRS);
            let untagged = |_: SensorTag, _: u32| 0u64;
            let mut map = capability::derive_supported(DEVICE_FUNCS, &files, &untagged);
            if let Some(mon) = &self.monitor {
                let tag_of = |tag: SensorTag, index: u32| mon.sensor_tag(tag, index);
                capability::merge(
                    &mut map,
                    capability::derive_supported(MONITOR_FUNCS, &mon.files(), &tag_of),
                );
            }
            debug!(card = self.card_index, functions = map.len(), "capabilities derived");
            map
        })
    }

    /// # Errors
    /// `NotSupported` or `InvalidArgs`, see [`capability::check_support`].
    pub fn check_support(&self, name: &str, variant: u64, sub: u64) -> RsmiResult<()> {
        capability::check_support(self.supported_funcs(), name, variant, sub).map_err(Into::into)
    }

    // -------------------------------------------------------------------------------------------
    // gpu_metrics
    // -------------------------------------------------------------------------------------------

    fn read_metrics_blob(&self) -> RsmiResult<Vec<u8>> {
        self.read_binary(DevAttr::GpuMetrics, MAX_BLOB_SIZE)
    }

    /// The table header, re-read when the cached copy is older than five seconds.
    pub fn gpu_metrics_header(&self) -> RsmiResult<MetricsHeader> {
        self.metrics_header
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_refresh(Instant::now(), || self.read_metrics_blob())
    }

    /// The raw table as the driver wrote it.
    pub fn gpu_metrics_blob(&self) -> RsmiResult<Vec<u8>> {
        let blob = self.read_metrics_blob()?;
        if blob.len() < gpu_metrics::HEADER_SIZE {
            return Err(Status::UnexpectedSize.into());
        }
        Ok(blob)
    }

    /// Decoded table.
    ///
    /// # Errors
    /// `NotSupported` for table layouts this library does not know.
    pub fn gpu_metrics(&self) -> RsmiResult<GpuMetrics> {
        let blob = self.gpu_metrics_blob()?;
        let record = MetricsRecord::decode(&blob)?;
        self.metrics_header
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_refresh(Instant::now(), || Ok(blob.clone()))?;
        Ok(GpuMetrics::from(&record))
    }
}

/// `N` of `<card>/device/drm/renderD<N>`, or 0 when absent.
fn render_minor(card_path: &Path) -> u32 {
    sysfs::list_names(&card_path.join("device").join("drm"))
        .iter()
        .find_map(|n| numeric_suffix(n, "renderD"))
        .unwrap_or(0)
}
