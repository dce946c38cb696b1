//! The `rsmi_*` C ABI.
//!
//! Every entry point runs inside `catch_unwind` and reports a [`Status`]. Accessors write their
//! result through an output pointer; passing a null output pointer turns the call into a
//! capability probe that returns `NotSupported` or `InvalidArgs` without touching sysfs.

use crate::api::{
    ErrorCount, Frequencies, PcieBandwidth, RetiredPage, XgmiStatus, hwmon_index,
};
use crate::config::{Config, InitFlags};
use crate::counters::{Counter, CounterValue};
use crate::device::attribute::{ClockType, MemoryType, PerfLevel};
use crate::device::capability::DEFAULT_VARIANT;
use crate::device::gpu_metrics::GpuMetrics;
use crate::device::monitor::{TempMetric, TempSensor, VoltMetric, VoltSensor};
use crate::error::{RsmiError, RsmiResult, Status};
use crate::func_iter::{FuncIter, FuncIterValue};
use crate::kfd::events::MAX_EVENT_MESSAGE_SIZE;
use crate::kfd::process::ProcessInfo;
use crate::smi::{RocmSmi, SmiState};
use crate::topology;
use std::collections::BTreeMap;
use std::ffi::{CString, c_char, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::LazyLock;
use tracing::{debug, error};

static SMI: LazyLock<RocmSmi> = LazyLock::new(|| RocmSmi::new(Config::from_env()));

static VERSION_BUILD: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");

/// `rsmi_version_str_get` component selecting the kernel driver.
pub const SW_COMP_DRIVER: u32 = 0;

pub const COUNTER_CMD_START: u32 = 0;
pub const COUNTER_CMD_STOP: u32 = 1;

/// Library version (`rsmi_version_t`).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub build: *const c_char,
}

/// One KFD event record (`rsmi_evt_notification_data_t`).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EvtNotificationData {
    pub dv_ind: u32,
    pub event: u32,
    pub message: [c_char; MAX_EVENT_MESSAGE_SIZE],
}

/// Value under a function iterator (`rsmi_func_id_value_t`).
#[repr(C)]
#[derive(Clone, Copy)]
pub union FuncIdValue {
    pub id: u64,
    pub name: *const c_char,
}

/// Opaque iterator handle handed to C callers.
#[derive(Debug)]
pub struct FuncIterHandle {
    iter: FuncIter,
    name: Option<CString>,
}

// ===============================================================================================
// Plumbing
// ===============================================================================================

fn guarded<F>(call: F) -> Status
where
    F: FnOnce() -> RsmiResult<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(())) => Status::Success,
        Ok(Err(e)) => {
            debug!(error = %e, "call failed");
            e.status()
        }
        Err(_) => {
            error!("panic caught at the C boundary");
            Status::InternalException
        }
    }
}

fn with_state<F>(call: F) -> Status
where
    F: FnOnce(&SmiState) -> RsmiResult<()>,
{
    guarded(|| {
        let state = SMI.state()?;
        call(&state)
    })
}

type Probe = Box<dyn FnOnce(&SmiState) -> RsmiResult<()>>;

fn supported(dv_ind: u32, name: &'static str) -> Probe {
    Box::new(move |s| s.supports(dv_ind, name, DEFAULT_VARIANT, DEFAULT_VARIANT))
}

fn supported_variant(dv_ind: u32, name: &'static str, variant: u64) -> Probe {
    Box::new(move |s| s.supports(dv_ind, name, variant, DEFAULT_VARIANT))
}

fn supported_sensor(dv_ind: u32, name: &'static str, sensor_ind: u32) -> Probe {
    Box::new(move |s| {
        s.supports(dv_ind, name, DEFAULT_VARIANT, u64::from(hwmon_index(sensor_ind)))
    })
}

/// For outputs with no capability entry a null pointer is simply invalid.
fn unprobed() -> Probe {
    Box::new(|_| Ok(()))
}

/// Stores `read`'s result in `out`, or runs `probe` when `out` is null.
///
/// # Safety
/// `out` must be null or valid for a write of `T`.
unsafe fn read_with<T, R>(state: &SmiState, out: *mut T, probe: Probe, read: R) -> RsmiResult<()>
where
    R: FnOnce(&SmiState) -> RsmiResult<T>,
{
    if out.is_null() {
        probe(state)?;
        return Err(Status::InvalidArgs.into());
    }
    let value = read(state)?;
    // SAFETY: non-null, and the caller guarantees it is writable.
    unsafe { out.write(value) };
    Ok(())
}

/// # Safety
/// As for [`read_with`].
unsafe fn read_into<T, R>(out: *mut T, probe: Probe, read: R) -> Status
where
    R: FnOnce(&SmiState) -> RsmiResult<T>,
{
    // SAFETY: forwarded from the caller.
    with_state(|s| unsafe { read_with(s, out, probe, read) })
}

/// Copies `value` into a NUL-terminated buffer of `len` bytes.
///
/// # Safety
/// `buf` must be valid for `len` bytes of writes.
unsafe fn copy_string(buf: *mut c_char, len: u32, value: &str) -> RsmiResult<()> {
    if len == 0 {
        return Err(Status::InvalidArgs.into());
    }
    let bytes = value.as_bytes();
    let n = bytes.len().min(len as usize - 1);
    // SAFETY: `n < len` and the caller guarantees `len` writable bytes.
    unsafe {
        ptr::copy_nonoverlapping(bytes.as_ptr().cast::<c_char>(), buf, n);
        buf.add(n).write(0);
    }
    if n < bytes.len() {
        return Err(Status::InsufficientSize.into());
    }
    Ok(())
}

/// # Safety
/// `buf` must be null or valid for `len` bytes of writes.
unsafe fn read_string<R>(buf: *mut c_char, len: u32, probe: Probe, read: R) -> Status
where
    R: FnOnce(&SmiState) -> RsmiResult<String>,
{
    with_state(|s| {
        if buf.is_null() {
            probe(s)?;
            return Err(Status::InvalidArgs.into());
        }
        let value = read(s)?;
        // SAFETY: forwarded from the caller.
        unsafe { copy_string(buf, len, &value) }
    })
}

/// `*count` is the capacity of `items` on entry and the number written on return. A null
/// `items` only reports how many there are.
///
/// # Safety
/// `count` must be null or writable; `items` must be null or valid for `*count` writes.
unsafe fn fill_slice<T: Copy>(items: *mut T, count: *mut u32, values: &[T]) -> RsmiResult<()> {
    // SAFETY: the caller guarantees `count` is null or writable.
    let Some(count) = (unsafe { count.as_mut() }) else {
        return Err(Status::InvalidArgs.into());
    };
    if items.is_null() {
        *count = u32::try_from(values.len()).unwrap_or(u32::MAX);
        return Ok(());
    }
    let n = values.len().min(*count as usize);
    // SAFETY: `n <= *count`, the capacity the caller vouched for.
    unsafe { ptr::copy_nonoverlapping(values.as_ptr(), items, n) };
    *count = u32::try_from(n).unwrap_or(u32::MAX);
    if n < values.len() {
        return Err(Status::InsufficientSize.into());
    }
    Ok(())
}

fn arg<T>(value: Option<T>) -> RsmiResult<T> {
    value.ok_or(RsmiError::Status(Status::InvalidArgs))
}

// ===============================================================================================
// Lifecycle and library info
// ===============================================================================================

#[unsafe(no_mangle)]
pub extern "C" fn rsmi_init(init_flags: u64) -> Status {
    guarded(|| SMI.init(InitFlags(init_flags)).map(|_| ()))
}

#[unsafe(no_mangle)]
pub extern "C" fn rsmi_shut_down() -> Status {
    guarded(|| SMI.shutdown())
}

/// # Safety
/// `num_devices` must be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmi_num_monitor_devices(num_devices: *mut u32) -> Status {
    // SAFETY: forwarded from the caller.
    unsafe { read_into(num_devices, unprobed(), |s| Ok(s.num_devices())) }
}

static STATUS_STRINGS: LazyLock<BTreeMap<u32, CString>> = LazyLock::new(|| {
    (0..=Status::Busy as u32)
        .chain([Status::UnknownError as u32])
        .filter_map(Status::from_raw)
        .map(|s| (s as u32, CString::new(s.description()).unwrap_or_default()))
        .collect()
});

/// # Safety
/// `status_string` must be null or writable. The returned string lives for the whole process.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmi_status_string(status: u32, status_string: *mut *const c_char) -> Status {
    guarded(|| {
        let text = arg(STATUS_STRINGS.get(&status))?;
        // SAFETY: the caller guarantees the pointer is null or writable.
        let out = arg(unsafe { status_string.as_mut() })?;
        *out = text.as_ptr();
        Ok(())
    })
}

/// # Safety
/// `version` must be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmi_version_get(version: *mut Version) -> Status {
    guarded(|| {
        // SAFETY: the caller guarantees the pointer is null or writable.
        let out = arg(unsafe { version.as_mut() })?;
        let part = |s: &str| s.parse().unwrap_or(0);
        *out = Version {
            major: part(env!("CARGO_PKG_VERSION_MAJOR")),
            minor: part(env!("CARGO_PKG_VERSION_MINOR")),
            patch: part(env!("CARGO_PKG_VERSION_PATCH")),
            build: VERSION_BUILD.as_ptr().cast(),
        };
        Ok(())
    })
}

/// # Safety
/// `ver_str` must be null or valid for `len` bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmi_version_str_get(component: u32, ver_str: *mut c_char, len: u32) -> Status {
    // SAFETY: forwarded from the caller.
    unsafe {
        read_string(ver_str, len, unprobed(), |s| {
            if component != SW_COMP_DRIVER {
                return Err(Status::InvalidArgs.into());
            }
            s.driver_version()
        })
    }
}

// ===============================================================================================
// Identity
// ===============================================================================================

macro_rules! id_getter {
    ($(#[$doc:meta])* $fn_name:ident, $cap:literal, $ty:ty, $method:ident) => {
        $(#[$doc])*
        /// # Safety
        /// The output pointer must be null or writable.
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $fn_name(dv_ind: u32, out: *mut $ty) -> Status {
            // SAFETY: forwarded from the caller.
            unsafe { read_into(out, supported(dv_ind, $cap), |s| s.$method(dv_ind)) }
        }
    };
}

id_getter!(rsmi_dev_id_get, "rsmi_dev_id_get", u16, dev_id);
id_getter!(rsmi_dev_vendor_id_get, "rsmi_dev_vendor_id_get", u16, vendor_id);
id_getter!(rsmi_dev_subsystem_id_get, "rsmi_dev_subsystem_id_get", u16, subsystem_id);
id_getter!(
    rsmi_dev_subsystem_vendor_id_get,
    "rsmi_dev_subsystem_vendor_id_get",
    u16,
    subsystem_vendor_id
);
id_getter!(
    /// BDF identifier, partition nibble included.
    rsmi_dev_pci_id_get,
    "rsmi_dev_pci_id_get",
    u64,
    pci_id
);
id_getter!(
    rsmi_dev_drm_render_minor_get,
    "rsmi_dev_drm_render_minor_get",
    u32,
    drm_render_minor
);
id_getter!(rsmi_dev_unique_id_get, "rsmi_dev_unique_id_get", u64, unique_id);
id_getter!(rsmi_topo_numa_affinity_get, "rsmi_topo_numa_affinity_get", i32, numa_affinity);
id_getter!(rsmi_dev_overdrive_level_get, "rsmi_dev_overdrive_level_get", u32, overdrive_level);
id_getter!(rsmi_dev_busy_percent_get, "rsmi_dev_busy_percent_get", u32, busy_percent);
id_getter!(
    rsmi_dev_memory_busy_percent_get,
    "rsmi_dev_memory_busy_percent_get",
    u32,
    memory_busy_percent
);
id_getter!(
    rsmi_dev_pci_replay_counter_get,
    "rsmi_dev_pci_replay_counter_get",
    u64,
    pci_replay_counter
);
id_getter!(rsmi_dev_ecc_enabled_get, "rsmi_dev_ecc_enabled_get", u64, ecc_enabled);
id_getter!(rsmi_dev_xgmi_error_status, "rsmi_dev_xgmi_error_status", XgmiStatus, xgmi_error_status);
id_getter!(
    rsmi_dev_pci_bandwidth_get,
    "rsmi_dev_pci_bandwidth_get",
    PcieBandwidth,
    pci_bandwidth
);
id_getter!(
    rsmi_dev_gpu_metrics_info_get,
    "rsmi_dev_gpu_metrics_info_get",
    GpuMetrics,
    gpu_metrics
);

/// Maximum GPU power in milliwatts.
///
/// # Safety
/// `power` must be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmi_dev_power_max_get(dv_ind: u32, power: *mut u64) -> Status {
    // SAFETY: forwarded from the caller.
    unsafe { read_into(power, unprobed(), |s| s.max_gpu_power(dv_ind)) }
}

macro_rules! string_getter {
    ($fn_name:ident, $cap:literal, $method:ident) => {
        /// # Safety
        /// The buffer must be null or valid for `len` bytes.
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $fn_name(dv_ind: u32, buf: *mut c_char, len: u32) -> Status {
            // SAFETY: forwarded from the caller.
            unsafe { read_string(buf, len, supported(dv_ind, $cap), |s| s.$method(dv_ind)) }
        }
    };
}

string_getter!(rsmi_dev_serial_number_get, "rsmi_dev_serial_number_get", serial_number);
string_getter!(rsmi_dev_vbios_version_get, "rsmi_dev_vbios_version_get", vbios_version);
string_getter!(rsmi_dev_vram_vendor_get, "rsmi_dev_vram_vendor_get", vram_vendor);
string_getter!(
    rsmi_dev_compute_partition_get,
    "rsmi_dev_compute_partition_get",
    compute_partition
);
string_getter!(
    rsmi_dev_memory_partition_get,
    "rsmi_dev_memory_partition_get",
    memory_partition
);

// ===============================================================================================
// Performance level, clocks, PCIe
// ===============================================================================================

/// # Safety
/// `perf` must be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmi_dev_perf_level_get(dv_ind: u32, perf: *mut u32) -> Status {
    // SAFETY: forwarded from the caller.
    unsafe {
        read_into(perf, supported(dv_ind, "rsmi_dev_perf_level_get"), |s| {
            s.perf_level(dv_ind).map(|l| l as u32)
        })
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn rsmi_dev_perf_level_set(dv_ind: u32, perf_level: u32) -> Status {
    with_state(|s| {
        let level = arg(PerfLevel::from_raw(u64::from(perf_level)))?;
        s.set_perf_level(dv_ind, level)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn rsmi_dev_overdrive_level_set(dv_ind: u32, od: u32) -> Status {
    with_state(|s| s.set_overdrive_level(dv_ind, od))
}

/// # Safety
/// `f` must be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmi_dev_gpu_clk_freq_get(
    dv_ind: u32,
    clk_type: u32,
    f: *mut Frequencies,
) -> Status {
    let probe = supported_variant(dv_ind, "rsmi_dev_gpu_clk_freq_get", u64::from(clk_type));
    // SAFETY: forwarded from the caller.
    unsafe {
        read_into(f, probe, |s| {
            s.gpu_clk_freq(dv_ind, arg(ClockType::from_raw(clk_type))?)
        })
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn rsmi_dev_gpu_clk_freq_set(dv_ind: u32, clk_type: u32, freq_bitmask: u64) -> Status {
    with_state(|s| s.set_gpu_clk_freq(dv_ind, arg(ClockType::from_raw(clk_type))?, freq_bitmask))
}

#[unsafe(no_mangle)]
pub extern "C" fn rsmi_dev_pci_bandwidth_set(dv_ind: u32, bw_bitmask: u64) -> Status {
    with_state(|s| s.set_pci_bandwidth(dv_ind, bw_bitmask))
}

#[unsafe(no_mangle)]
pub extern "C" fn rsmi_dev_power_profile_set(dv_ind: u32, _reserved: u32, profile: u64) -> Status {
    with_state(|s| s.set_power_profile(dv_ind, profile))
}

/// # Safety
/// Each output must be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmi_dev_pci_throughput_get(
    dv_ind: u32,
    sent: *mut u64,
    received: *mut u64,
    max_pkt_sz: *mut u64,
) -> Status {
    with_state(|s| {
        if sent.is_null() || received.is_null() || max_pkt_sz.is_null() {
            s.supports(dv_ind, "rsmi_dev_pci_throughput_get", DEFAULT_VARIANT, DEFAULT_VARIANT)?;
            return Err(Status::InvalidArgs.into());
        }
        let t = s.pci_throughput(dv_ind)?;
        // SAFETY: all three are non-null and the caller guarantees they are writable.
        unsafe {
            sent.write(t.sent);
            received.write(t.received);
            max_pkt_sz.write(t.max_pkt_sz);
        }
        Ok(())
    })
}

// ===============================================================================================
// Memory, firmware, RAS
// ===============================================================================================

/// # Safety
/// `total` must be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmi_dev_memory_total_get(dv_ind: u32, mem_type: u32, total: *mut u64) -> Status {
    let probe = supported_variant(dv_ind, "rsmi_dev_memory_total_get", u64::from(mem_type));
    // SAFETY: forwarded from the caller.
    unsafe {
        read_into(total, probe, |s| {
            s.memory_total(dv_ind, arg(MemoryType::from_raw(mem_type))?)
        })
    }
}

/// # Safety
/// `used` must be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmi_dev_memory_usage_get(dv_ind: u32, mem_type: u32, used: *mut u64) -> Status {
    let probe = supported_variant(dv_ind, "rsmi_dev_memory_usage_get", u64::from(mem_type));
    // SAFETY: forwarded from the caller.
    unsafe {
        read_into(used, probe, |s| {
            s.memory_usage(dv_ind, arg(MemoryType::from_raw(mem_type))?)
        })
    }
}

/// # Safety
/// `num_pages` must be null or writable; `records` null or valid for `*num_pages` entries.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmi_dev_memory_reserved_pages_get(
    dv_ind: u32,
    num_pages: *mut u32,
    records: *mut RetiredPage,
) -> Status {
    with_state(|s| {
        let pages = s.memory_reserved_pages(dv_ind)?;
        // SAFETY: forwarded from the caller.
        unsafe { fill_slice(records, num_pages, &pages) }
    })
}

/// # Safety
/// `fw_version` must be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmi_dev_firmware_version_get(
    dv_ind: u32,
    block: u32,
    fw_version: *mut u64,
) -> Status {
    let probe = supported_variant(dv_ind, "rsmi_dev_firmware_version_get", u64::from(block));
    // SAFETY: forwarded from the caller.
    unsafe { read_into(fw_version, probe, |s| s.firmware_version(dv_ind, block)) }
}

/// # Safety
/// `ec` must be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmi_dev_ecc_count_get(dv_ind: u32, block: u64, ec: *mut ErrorCount) -> Status {
    let probe = supported_variant(dv_ind, "rsmi_dev_ecc_count_get", block);
    // SAFETY: forwarded from the caller.
    unsafe { read_into(ec, probe, |s| s.ecc_count(dv_ind, block)) }
}

#[unsafe(no_mangle)]
pub extern "C" fn rsmi_dev_xgmi_error_reset(dv_ind: u32) -> Status {
    with_state(|s| s.xgmi_error_reset(dv_ind))
}

// ===============================================================================================
// hwmon
// ===============================================================================================

/// # Safety
/// `temperature` must be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmi_dev_temp_metric_get(
    dv_ind: u32,
    sensor_type: u32,
    metric: u32,
    temperature: *mut i64,
) -> Status {
    let probe: Probe = Box::new(move |s| {
        let sensor = arg(TempSensor::from_raw(sensor_type))?;
        let index = s.temp_sensor_index(dv_ind, sensor)?;
        s.supports(dv_ind, "rsmi_dev_temp_metric_get", u64::from(metric), u64::from(index))
    });
    // SAFETY: forwarded from the caller.
    unsafe {
        read_into(temperature, probe, |s| {
            s.temp_metric(
                dv_ind,
                arg(TempSensor::from_raw(sensor_type))?,
                arg(TempMetric::from_raw(metric))?,
            )
        })
    }
}

/// # Safety
/// `voltage` must be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmi_dev_volt_metric_get(
    dv_ind: u32,
    sensor_type: u32,
    metric: u32,
    voltage: *mut i64,
) -> Status {
    let probe: Probe = Box::new(move |s| {
        let sensor = arg(VoltSensor::from_raw(sensor_type))?;
        let index = s.volt_sensor_index(dv_ind, sensor)?;
        s.supports(dv_ind, "rsmi_dev_volt_metric_get", u64::from(metric), u64::from(index))
    });
    // SAFETY: forwarded from the caller.
    unsafe {
        read_into(voltage, probe, |s| {
            s.volt_metric(
                dv_ind,
                arg(VoltSensor::from_raw(sensor_type))?,
                arg(VoltMetric::from_raw(metric))?,
            )
        })
    }
}

macro_rules! sensor_getter {
    ($(#[$doc:meta])* $fn_name:ident, $cap:literal, $ty:ty, $method:ident) => {
        $(#[$doc])*
        /// # Safety
        /// The output pointer must be null or writable.
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $fn_name(dv_ind: u32, sensor_ind: u32, out: *mut $ty) -> Status {
            let probe = supported_sensor(dv_ind, $cap, sensor_ind);
            // SAFETY: forwarded from the caller.
            unsafe { read_into(out, probe, |s| s.$method(dv_ind, sensor_ind)) }
        }
    };
}

sensor_getter!(rsmi_dev_fan_rpms_get, "rsmi_dev_fan_rpms_get", i64, fan_rpms);
sensor_getter!(rsmi_dev_fan_speed_get, "rsmi_dev_fan_speed_get", i64, fan_speed);
sensor_getter!(rsmi_dev_fan_speed_max_get, "rsmi_dev_fan_speed_max_get", u64, fan_speed_max);
sensor_getter!(
    /// Average power in microwatts.
    rsmi_dev_power_ave_get,
    "rsmi_dev_power_ave_get",
    u64,
    power_average
);
sensor_getter!(rsmi_dev_power_cap_get, "rsmi_dev_power_cap_get", u64, power_cap);

/// # Safety
/// `max` and `min` must be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmi_dev_power_cap_range_get(
    dv_ind: u32,
    sensor_ind: u32,
    max: *mut u64,
    min: *mut u64,
) -> Status {
    with_state(|s| {
        if max.is_null() || min.is_null() {
            supported_sensor(dv_ind, "rsmi_dev_power_cap_range_get", sensor_ind)(s)?;
            return Err(Status::InvalidArgs.into());
        }
        let (hi, lo) = s.power_cap_range(dv_ind, sensor_ind)?;
        // SAFETY: both are non-null and the caller guarantees they are writable.
        unsafe {
            max.write(hi);
            min.write(lo);
        }
        Ok(())
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn rsmi_dev_power_cap_set(dv_ind: u32, sensor_ind: u32, cap: u64) -> Status {
    with_state(|s| s.set_power_cap(dv_ind, sensor_ind, cap))
}

#[unsafe(no_mangle)]
pub extern "C" fn rsmi_dev_fan_reset(dv_ind: u32, sensor_ind: u32) -> Status {
    with_state(|s| s.fan_reset(dv_ind, sensor_ind))
}

#[unsafe(no_mangle)]
pub extern "C" fn rsmi_dev_fan_speed_set(dv_ind: u32, sensor_ind: u32, speed: u64) -> Status {
    with_state(|s| s.set_fan_speed(dv_ind, sensor_ind, speed))
}

// ===============================================================================================
// Topology
// ===============================================================================================

/// # Safety
/// `numa_node` must be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmi_topo_get_numa_node_number(dv_ind: u32, numa_node: *mut u32) -> Status {
    // SAFETY: forwarded from the caller.
    unsafe { read_into(numa_node, unprobed(), |s| topology::numa_node_number(s, dv_ind)) }
}

/// # Safety
/// `weight` must be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmi_topo_get_link_weight(
    dv_ind_src: u32,
    dv_ind_dst: u32,
    weight: *mut u64,
) -> Status {
    // SAFETY: forwarded from the caller.
    unsafe {
        read_into(weight, unprobed(), |s| {
            topology::link_weight(s, dv_ind_src, dv_ind_dst)
        })
    }
}

/// # Safety
/// `min_bandwidth` and `max_bandwidth` must be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmi_minmax_bandwidth_get(
    dv_ind_src: u32,
    dv_ind_dst: u32,
    min_bandwidth: *mut u64,
    max_bandwidth: *mut u64,
) -> Status {
    with_state(|s| {
        if min_bandwidth.is_null() || max_bandwidth.is_null() {
            return Err(Status::InvalidArgs.into());
        }
        let (lo, hi) = topology::minmax_bandwidth(s, dv_ind_src, dv_ind_dst)?;
        // SAFETY: both are non-null and the caller guarantees they are writable.
        unsafe {
            min_bandwidth.write(lo);
            max_bandwidth.write(hi);
        }
        Ok(())
    })
}

/// # Safety
/// `hops` and `link_type` must be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmi_topo_get_link_type(
    dv_ind_src: u32,
    dv_ind_dst: u32,
    hops: *mut u64,
    link_type: *mut u32,
) -> Status {
    with_state(|s| {
        if hops.is_null() || link_type.is_null() {
            return Err(Status::InvalidArgs.into());
        }
        let (h, t) = topology::link_type(s, dv_ind_src, dv_ind_dst)?;
        // SAFETY: both are non-null and the caller guarantees they are writable.
        unsafe {
            hops.write(h);
            link_type.write(t as u32);
        }
        Ok(())
    })
}

/// # Safety
/// `accessible` must be null or writable.
#[allow(non_snake_case)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmi_is_P2P_accessible(
    dv_ind_src: u32,
    dv_ind_dst: u32,
    accessible: *mut bool,
) -> Status {
    // SAFETY: forwarded from the caller.
    unsafe {
        read_into(accessible, unprobed(), |s| {
            topology::is_p2p_accessible(s, dv_ind_src, dv_ind_dst)
        })
    }
}

// ===============================================================================================
// Processes
// ===============================================================================================

/// # Safety
/// `num_items` must be null or writable; `procs` null or valid for `*num_items` entries.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmi_compute_process_info_get(
    procs: *mut ProcessInfo,
    num_items: *mut u32,
) -> Status {
    with_state(|s| {
        let list = s.compute_processes()?;
        // SAFETY: forwarded from the caller.
        unsafe { fill_slice(procs, num_items, &list) }
    })
}

/// # Safety
/// `proc` must be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmi_compute_process_info_by_pid_get(pid: u32, proc: *mut ProcessInfo) -> Status {
    // SAFETY: forwarded from the caller.
    unsafe { read_into(proc, unprobed(), |s| s.compute_process_info(pid)) }
}

/// # Safety
/// `num_devices` must be null or writable; `dv_indices` null or valid for `*num_devices` entries.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmi_compute_process_gpus_get(
    pid: u32,
    dv_indices: *mut u32,
    num_devices: *mut u32,
) -> Status {
    with_state(|s| {
        let gpus = s.compute_process_gpus(pid)?;
        // SAFETY: forwarded from the caller.
        unsafe { fill_slice(dv_indices, num_devices, &gpus) }
    })
}

// ===============================================================================================
// Capability iterators
// ===============================================================================================

fn into_handle(iter: FuncIter) -> *mut FuncIterHandle {
    Box::into_raw(Box::new(FuncIterHandle { iter, name: None }))
}

/// # Safety
/// `handle` must be null or writable. The handle must be released with
/// [`rsmi_dev_supported_func_iterator_close`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmi_dev_supported_func_iterator_open(
    dv_ind: u32,
    handle: *mut *mut FuncIterHandle,
) -> Status {
    with_state(|s| {
        // SAFETY: the caller guarantees the pointer is null or writable.
        let out = arg(unsafe { handle.as_mut() })?;
        let iter = FuncIter::functions(s.device(dv_ind)?.supported_funcs())?;
        *out = into_handle(iter);
        Ok(())
    })
}

/// # Safety
/// `parent` must be a live handle; `handle` must be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmi_dev_supported_variant_iterator_open(
    parent: *const FuncIterHandle,
    handle: *mut *mut FuncIterHandle,
) -> Status {
    guarded(|| {
        // SAFETY: the caller guarantees both pointers are null or valid.
        let (parent, out) = unsafe { (arg(parent.as_ref())?, arg(handle.as_mut())?) };
        *out = into_handle(parent.iter.open_child()?);
        Ok(())
    })
}

/// # Safety
/// `handle` must be a live handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmi_func_iter_next(handle: *mut FuncIterHandle) -> Status {
    guarded(|| {
        // SAFETY: the caller guarantees the handle is live.
        let handle = arg(unsafe { handle.as_mut() })?;
        handle.iter.next()
    })
}

/// The name pointer stays valid until the handle is advanced or closed.
///
/// # Safety
/// `handle` must be a live handle and `value` null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmi_func_iter_value_get(
    handle: *mut FuncIterHandle,
    value: *mut FuncIdValue,
) -> Status {
    guarded(|| {
        // SAFETY: the caller guarantees both pointers are null or valid.
        let (handle, out) = unsafe { (arg(handle.as_mut())?, arg(value.as_mut())?) };
        *out = match handle.iter.value() {
            FuncIterValue::Id(id) => FuncIdValue { id },
            FuncIterValue::Name(name) => {
                let name = handle.name.insert(CString::new(name).unwrap_or_default());
                FuncIdValue {
                    name: name.as_ptr(),
                }
            }
        };
        Ok(())
    })
}

/// # Safety
/// `handle` must be null or point at a handle from one of the `open` calls.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmi_dev_supported_func_iterator_close(
    handle: *mut *mut FuncIterHandle,
) -> Status {
    guarded(|| {
        // SAFETY: the caller guarantees the pointer is null or valid.
        let slot = arg(unsafe { handle.as_mut() })?;
        if slot.is_null() {
            return Err(Status::InvalidArgs.into());
        }
        // SAFETY: the handle came from `Box::into_raw` and is released exactly once.
        drop(unsafe { Box::from_raw(*slot) });
        *slot = ptr::null_mut();
        Ok(())
    })
}

// ===============================================================================================
// Event counters
// ===============================================================================================

#[unsafe(no_mangle)]
pub extern "C" fn rsmi_dev_counter_group_supported(dv_ind: u32, group: u32) -> Status {
    with_state(|s| s.counter_group_supported(dv_ind, group))
}

/// # Safety
/// `evnt_handle` must be null or writable. The counter must be released with
/// [`rsmi_dev_counter_destroy`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmi_dev_counter_create(
    dv_ind: u32,
    event_type: u32,
    evnt_handle: *mut *mut Counter,
) -> Status {
    with_state(|s| {
        // SAFETY: the caller guarantees the pointer is null or writable.
        let out = arg(unsafe { evnt_handle.as_mut() })?;
        *out = Box::into_raw(Box::new(s.counter_create(dv_ind, event_type)?));
        Ok(())
    })
}

/// # Safety
/// `evnt_handle` must be null or a live counter from [`rsmi_dev_counter_create`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmi_dev_counter_destroy(evnt_handle: *mut Counter) -> Status {
    guarded(|| {
        if evnt_handle.is_null() {
            return Err(Status::InvalidArgs.into());
        }
        // SAFETY: the counter came from `Box::into_raw` and is released exactly once.
        drop(unsafe { Box::from_raw(evnt_handle) });
        Ok(())
    })
}

/// # Safety
/// `evt_handle` must be null or a live counter.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmi_counter_control(
    evt_handle: *mut Counter,
    cmd: u32,
    _cmd_args: *mut c_void,
) -> Status {
    guarded(|| {
        // SAFETY: the caller guarantees the handle is null or live.
        let counter = arg(unsafe { evt_handle.as_mut() })?;
        match cmd {
            COUNTER_CMD_START => counter.start(),
            COUNTER_CMD_STOP => counter.stop(),
            _ => Err(Status::InvalidArgs.into()),
        }
    })
}

/// # Safety
/// `evt_handle` must be null or a live counter; `value` null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmi_counter_read(evt_handle: *mut Counter, value: *mut CounterValue) -> Status {
    guarded(|| {
        // SAFETY: the caller guarantees both pointers are null or valid.
        let (counter, out) = unsafe { (arg(evt_handle.as_mut())?, arg(value.as_mut())?) };
        *out = counter.read()?;
        Ok(())
    })
}

/// # Safety
/// `available` must be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmi_counter_available_counters_get(
    dv_ind: u32,
    group: u32,
    available: *mut u32,
) -> Status {
    let probe = supported_variant(dv_ind, "rsmi_counter_available_counters_get", u64::from(group));
    // SAFETY: forwarded from the caller.
    unsafe {
        read_into(available, probe, |s| {
            s.available_counters(dv_ind, group).and_then(|n| {
                u32::try_from(n).map_err(|_| RsmiError::Status(Status::UnexpectedData))
            })
        })
    }
}

// ===============================================================================================
// KFD event notification
// ===============================================================================================

#[unsafe(no_mangle)]
pub extern "C" fn rsmi_event_notification_init(dv_ind: u32) -> Status {
    with_state(|s| s.event_notification_init(dv_ind))
}

#[unsafe(no_mangle)]
pub extern "C" fn rsmi_event_notification_mask_set(dv_ind: u32, mask: u64) -> Status {
    with_state(|s| s.event_notification_mask_set(dv_ind, mask))
}

fn notification_record(dv_ind: u32, event: u32, message: &str) -> EvtNotificationData {
    let mut data = EvtNotificationData {
        dv_ind,
        event,
        message: [0; MAX_EVENT_MESSAGE_SIZE],
    };
    let bytes = message.as_bytes();
    for (dst, src) in data.message.iter_mut().zip(&bytes[..bytes.len().min(MAX_EVENT_MESSAGE_SIZE - 1)]) {
        *dst = c_char::from_ne_bytes([*src]);
    }
    data
}

/// On entry `*num_elem` is the capacity of `data`; on return, the number of records written.
///
/// # Safety
/// `num_elem` must be null or writable; `data` null or valid for `*num_elem` entries.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rsmi_event_notification_get(
    timeout_ms: i32,
    num_elem: *mut u32,
    data: *mut EvtNotificationData,
) -> Status {
    with_state(|s| {
        // SAFETY: the caller guarantees the pointer is null or writable.
        let capacity = arg(unsafe { num_elem.as_ref() })?;
        if data.is_null() || *capacity == 0 {
            return Err(Status::InvalidArgs.into());
        }
        let events = s.event_notification_get(timeout_ms, *capacity as usize)?;
        let records: Vec<EvtNotificationData> = events
            .iter()
            .map(|e| notification_record(e.dv_ind, e.event, &e.message))
            .collect();
        // SAFETY: forwarded from the caller.
        unsafe { fill_slice(data, num_elem, &records) }
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn rsmi_event_notification_stop(dv_ind: u32) -> Status {
    with_state(|s| s.event_notification_stop(dv_ind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::tests::write_linked_card;
    use crate::kfd::node::tests::write_gpu_node;
    use std::ffi::CStr;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn state(root: &std::path::Path) -> SmiState {
        let card = write_linked_card(root, 0, "0000:03:00.0", "0x1002");
        fs::write(card.join("device/device"), "0x66af\n").unwrap();
        write_gpu_node(&Config::with_root(root).kfd_nodes_root, 1, 11, 0x300, 0);
        SmiState::build(Arc::new(Config::with_root(root)), InitFlags::default()).unwrap()
    }

    #[test]
    fn null_output_probes_capabilities() {
        let tmp = TempDir::new().unwrap();
        let s = state(tmp.path());
        let probe = |name, variant| -> Status {
            // SAFETY: a null output is the probe path and is never written.
            let r = unsafe {
                read_with(&s, ptr::null_mut::<u64>(), supported_variant(0, name, variant), |_| Ok(0))
            };
            r.map_or_else(|e| e.status(), |()| Status::Success)
        };

        assert_eq!(probe("rsmi_dev_id_get", DEFAULT_VARIANT), Status::InvalidArgs);
        assert_eq!(probe("rsmi_dev_serial_number_get", DEFAULT_VARIANT), Status::NotSupported);
        assert_eq!(probe("rsmi_dev_gpu_clk_freq_get", 0), Status::NotSupported);

        let mut out = 0u16;
        // SAFETY: `out` is a live local.
        unsafe { read_with(&s, &raw mut out, unprobed(), |s| s.dev_id(0)) }.unwrap();
        assert_eq!(out, 0x66af);
    }

    #[test]
    fn strings_truncate_with_insufficient_size() {
        let mut buf = [0x7f as c_char; 4];
        // SAFETY: `buf` holds 4 bytes.
        let err = unsafe { copy_string(buf.as_mut_ptr(), 4, "amdgpu") }.unwrap_err();
        assert_eq!(err.status(), Status::InsufficientSize);
        // SAFETY: copy_string always terminates within `len`.
        assert_eq!(unsafe { CStr::from_ptr(buf.as_ptr()) }.to_str().unwrap(), "amd");

        let mut buf = [0 as c_char; 8];
        // SAFETY: as above.
        unsafe { copy_string(buf.as_mut_ptr(), 8, "6.3.6") }.unwrap();
        // SAFETY: as above.
        assert_eq!(unsafe { CStr::from_ptr(buf.as_ptr()) }.to_str().unwrap(), "6.3.6");
        // SAFETY: zero length never writes.
        assert!(unsafe { copy_string(buf.as_mut_ptr(), 0, "x") }.is_err());
    }

    #[test]
    fn slices_report_count_then_fill() {
        let values = [3u32, 1, 4];
        let mut count = 0u32;
        // SAFETY: null items only writes the count.
        unsafe { fill_slice(ptr::null_mut(), &raw mut count, &values) }.unwrap();
        assert_eq!(count, 3);

        let mut items = [0u32; 2];
        count = 2;
        // SAFETY: `items` holds `count` entries.
        let err = unsafe { fill_slice(items.as_mut_ptr(), &raw mut count, &values) }.unwrap_err();
        assert_eq!(err.status(), Status::InsufficientSize);
        assert_eq!((items, count), ([3, 1], 2));
    }

    #[test]
    fn calls_before_init_report_init_error() {
        let mut count = 0u32;
        // SAFETY: `count` is a live local.
        assert_eq!(unsafe { rsmi_num_monitor_devices(&raw mut count) }, Status::InitError);
        assert_eq!(rsmi_dev_perf_level_set(0, 0), Status::InitError);
        assert_eq!(rsmi_shut_down(), Status::InitError);
    }

    #[test]
    fn panics_become_internal_exception() {
        assert_eq!(guarded(|| panic!("boom")), Status::InternalException);
        assert_eq!(guarded(|| Err(Status::Busy.into())), Status::Busy);
    }

    #[test]
    fn status_strings_and_version() {
        let mut text: *const c_char = ptr::null();
        // SAFETY: `text` is a live local.
        assert_eq!(unsafe { rsmi_status_string(0x10, &raw mut text) }, Status::Success);
        // SAFETY: status strings live for the whole process.
        let text = unsafe { CStr::from_ptr(text) }.to_str().unwrap();
        assert_eq!(text, Status::Busy.description());
        let mut unknown: *const c_char = ptr::null();
        // SAFETY: `unknown` is a live local.
        assert_eq!(unsafe { rsmi_status_string(0x11, &raw mut unknown) }, Status::InvalidArgs);
        assert!(unknown.is_null());

        let mut version = Version {
            major: 9,
            minor: 9,
            patch: 9,
            build: ptr::null(),
        };
        // SAFETY: `version` is a live local.
        assert_eq!(unsafe { rsmi_version_get(&raw mut version) }, Status::Success);
        assert_eq!((version.major, version.minor, version.patch), (0, 1, 0));
        // SAFETY: the build string is a static NUL-terminated literal.
        assert_eq!(unsafe { CStr::from_ptr(version.build) }.to_str().unwrap(), "0.1.0");
    }

    #[test]
    fn iterator_handles_walk_and_close() {
        let tmp = TempDir::new().unwrap();
        let s = state(tmp.path());
        let mut handle = into_handle(FuncIter::functions(s.device(0).unwrap().supported_funcs()).unwrap());

        let mut value = FuncIdValue { id: 0 };
        // SAFETY: `handle` is live and `value` a local.
        assert_eq!(unsafe { rsmi_func_iter_value_get(handle, &raw mut value) }, Status::Success);
        // SAFETY: the iterator starts on a function, so the name field is set.
        let first = unsafe { CStr::from_ptr(value.name) }.to_str().unwrap().to_owned();
        assert!(first.starts_with("rsmi_"));

        // SAFETY: `handle` is live.
        while unsafe { rsmi_func_iter_next(handle) } == Status::Success {}
        // SAFETY: `handle` came from `into_handle`.
        assert_eq!(unsafe { rsmi_dev_supported_func_iterator_close(&raw mut handle) }, Status::Success);
        assert!(handle.is_null());
        // SAFETY: a null slot is rejected without being dereferenced further.
        assert_eq!(
            unsafe { rsmi_dev_supported_func_iterator_close(&raw mut handle) },
            Status::InvalidArgs
        );
    }

    #[test]
    fn event_records_are_nul_terminated() {
        let long = "x".repeat(100);
        let record = notification_record(1, 2, &long);
        assert_eq!(record.message[MAX_EVENT_MESSAGE_SIZE - 1], 0);
        assert_eq!(record.message[0], c_char::from_ne_bytes([b'x']));
    }
}
