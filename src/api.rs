//! Typed accessors over an initialized session.
//!
//! Every accessor resolves the device index, takes the device lock (failing with `Busy` in
//! non-blocking mode) and reads or writes through the device's attribute layer. Writes that need
//! root fail with `Permission` before anything is touched.

use crate::counters::{Counter, EventGroup};
use crate::device::Device;
use crate::device::attribute::{
    ClockType, DevAttr, FW_BLOCKS, MemoryType, PerfLevel, ecc_count_attr,
};
use crate::device::gpu_metrics::GpuMetrics;
use crate::device::monitor::{MonitorAttr, TempMetric, TempSensor, VoltMetric, VoltSensor};
use crate::error::{RsmiError, RsmiResult, Status};
use crate::kfd::events::EventNotification;
use crate::kfd::process::{self, ProcessInfo};
use crate::smi::SmiState;
use crate::sysfs;
use crate::utils::{parse_frequency_line, parse_hex};
use std::sync::MutexGuard;
use tracing::debug;

/// Longest frequency table handed back (`RSMI_MAX_NUM_FREQUENCIES`).
pub const MAX_NUM_FREQUENCIES: usize = 32;
pub const MAX_OVERDRIVE_LEVEL: u32 = 20;

const FAN_MODE_MANUAL: &str = "1";
const FAN_MODE_AUTO: &str = "2";

// ===============================================================================================
// Records
// ===============================================================================================

/// A DPM table (`rsmi_frequencies_t`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Frequencies {
    pub num_supported: u32,
    pub current: u32,
    pub frequency: [u64; MAX_NUM_FREQUENCIES],
}

impl Frequencies {
    #[must_use]
    pub fn levels(&self) -> &[u64] {
        &self.frequency[..self.num_supported as usize]
    }
}

/// PCIe link states (`rsmi_pcie_bandwidth_t`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PcieBandwidth {
    pub transfer_rate: Frequencies,
    pub lanes: [u32; MAX_NUM_FREQUENCIES],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PcieThroughput {
    pub sent: u64,
    pub received: u64,
    pub max_pkt_sz: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorCount {
    pub correctable_err: u64,
    pub uncorrectable_err: u64,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XgmiStatus {
    NoErrors = 0,
    Error = 1,
    MultipleErrors = 2,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    Reserved = 0,
    Pending = 1,
    Unreservable = 2,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetiredPage {
    pub page_address: u64,
    pub page_size: u64,
    pub status: PageStatus,
}

// ===============================================================================================
// Parsers
// ===============================================================================================

fn frequency_table(lines: &[String]) -> RsmiResult<(Frequencies, [u32; MAX_NUM_FREQUENCIES])> {
    let mut freqs = Frequencies::default();
    let mut lanes = [0u32; MAX_NUM_FREQUENCIES];
    let mut current = None;

    let levels = lines.iter().filter(|l| !l.trim().is_empty());
    for (i, line) in levels.enumerate() {
        if i >= MAX_NUM_FREQUENCIES {
            return Err(Status::UnexpectedSize.into());
        }
        let level = parse_frequency_line(line)?;
        freqs.frequency[i] = level.frequency;
        lanes[i] = level.lanes.unwrap_or(0);
        if level.is_current {
            current = Some(i);
        }
        freqs.num_supported += 1;
    }
    if freqs.num_supported == 0 {
        return Err(Status::NotYetImplemented.into());
    }
    // Older drivers do not mark the current level.
    let current = current.ok_or(RsmiError::Status(Status::NotSupported))?;
    freqs.current = u32::try_from(current).unwrap_or(0);
    Ok((freqs, lanes))
}

/// `"0 2 5"`: the indices of the set bits of `mask` below `levels`.
fn level_selection(mask: u64, levels: u32) -> RsmiResult<String> {
    let picked: Vec<String> = (0..levels.min(64))
        .filter(|i| mask & (1 << i) != 0)
        .map(|i| i.to_string())
        .collect();
    if picked.is_empty() {
        return Err(Status::InvalidArgs.into());
    }
    Ok(picked.join(" "))
}

fn parse_error_count(lines: &[String]) -> RsmiResult<ErrorCount> {
    let field = |key: &str| {
        lines.iter().find_map(|l| {
            let (k, v) = l.split_once(':')?;
            if k.trim() == key { v.trim().parse::<u64>().ok() } else { None }
        })
    };
    match (field("ce"), field("ue")) {
        (Some(ce), Some(ue)) => Ok(ErrorCount {
            correctable_err: ce,
            uncorrectable_err: ue,
        }),
        _ => Err(Status::UnexpectedData.into()),
    }
}

fn parse_retired_page(line: &str) -> RsmiResult<RetiredPage> {
    let bad = || RsmiError::parse("bad page table", format!("{line:?}"));
    let mut parts = line.split(':').map(str::trim);
    let address = parts.next().and_then(parse_hex).ok_or_else(bad)?;
    let size = parts.next().and_then(parse_hex).ok_or_else(bad)?;
    let status = match parts.next() {
        Some("R") => PageStatus::Reserved,
        Some("P") => PageStatus::Pending,
        Some("F") => PageStatus::Unreservable,
        _ => return Err(bad()),
    };
    Ok(RetiredPage {
        page_address: address,
        page_size: size,
        status,
    })
}

fn narrow<T: TryFrom<u64>>(value: u64) -> RsmiResult<T> {
    T::try_from(value).map_err(|_| RsmiError::Status(Status::UnexpectedData))
}

fn percent(value: u64) -> RsmiResult<u32> {
    if value > 100 {
        return Err(Status::UnexpectedData.into());
    }
    narrow(value)
}

/// hwmon files count from one; the API counts sensors from zero.
pub(crate) const fn hwmon_index(sensor_ind: u32) -> u32 {
    sensor_ind.saturating_add(1)
}

// ===============================================================================================
// Accessors
// ===============================================================================================

impl SmiState {
    fn locked(&self, dv_ind: u32) -> RsmiResult<(&Device, MutexGuard<'_, ()>)> {
        let dev = self.device(dv_ind)?;
        let guard = dev.guard(self.flags().non_blocking())?;
        Ok((dev, guard))
    }

    /// Whether the capability table backs `(name, variant, subvariant)`.
    ///
    /// # Errors
    /// `NotSupported` when the function is absent, `InvalidArgs` when the combination is not
    /// stored.
    pub fn supports(&self, dv_ind: u32, name: &str, variant: u64, sub: u64) -> RsmiResult<()> {
        self.device(dv_ind)?.check_support(name, variant, sub)
    }

    // -------------------------------------------------------------------------------------------
    // Identity
    // -------------------------------------------------------------------------------------------

    pub fn dev_id(&self, dv_ind: u32) -> RsmiResult<u16> {
        let (dev, _g) = self.locked(dv_ind)?;
        narrow(dev.read_u64(DevAttr::DevId)?)
    }

    pub fn vendor_id(&self, dv_ind: u32) -> RsmiResult<u16> {
        let (dev, _g) = self.locked(dv_ind)?;
        narrow(dev.read_u64(DevAttr::VendorId)?)
    }

    pub fn subsystem_id(&self, dv_ind: u32) -> RsmiResult<u16> {
        let (dev, _g) = self.locked(dv_ind)?;
        narrow(dev.read_u64(DevAttr::SubSysDevId)?)
    }

    pub fn subsystem_vendor_id(&self, dv_ind: u32) -> RsmiResult<u16> {
        let (dev, _g) = self.locked(dv_ind)?;
        narrow(dev.read_u64(DevAttr::SubSysVendorId)?)
    }

    /// BDF identifier, partition nibble included.
    pub fn pci_id(&self, dv_ind: u32) -> RsmiResult<u64> {
        Ok(self.device(dv_ind)?.bdf())
    }

    pub fn drm_render_minor(&self, dv_ind: u32) -> RsmiResult<u32> {
        match self.device(dv_ind)?.drm_render_minor() {
            0 => Err(Status::InitError.into()),
            minor => Ok(minor),
        }
    }

    pub fn unique_id(&self, dv_ind: u32) -> RsmiResult<u64> {
        let (dev, _g) = self.locked(dv_ind)?;
        dev.read_u64(DevAttr::UniqueId)
    }

    pub fn serial_number(&self, dv_ind: u32) -> RsmiResult<String> {
        let (dev, _g) = self.locked(dv_ind)?;
        dev.read_str(DevAttr::SerialNumber)
    }

    pub fn vbios_version(&self, dv_ind: u32) -> RsmiResult<String> {
        let (dev, _g) = self.locked(dv_ind)?;
        dev.read_str(DevAttr::VBiosVer)
    }

    pub fn vram_vendor(&self, dv_ind: u32) -> RsmiResult<String> {
        let (dev, _g) = self.locked(dv_ind)?;
        dev.read_str(DevAttr::VramVendor)
    }

    /// Current compute partition mode, e.g. `SPX` or `CPX`.
    pub fn compute_partition(&self, dv_ind: u32) -> RsmiResult<String> {
        let (dev, _g) = self.locked(dv_ind)?;
        dev.read_str(DevAttr::ComputePartition)
    }

    pub fn memory_partition(&self, dv_ind: u32) -> RsmiResult<String> {
        let (dev, _g) = self.locked(dv_ind)?;
        dev.read_str(DevAttr::MemoryPartition)
    }

    /// NUMA node of the PCI device; `-1` when the platform has none.
    pub fn numa_affinity(&self, dv_ind: u32) -> RsmiResult<i32> {
        let (dev, _g) = self.locked(dv_ind)?;
        let raw = dev.read_line(DevAttr::NumaNode)?;
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Status::NoData.into());
        }
        raw.parse().map_err(|_| RsmiError::Status(Status::UnexpectedData))
    }

    // -------------------------------------------------------------------------------------------
    // Performance level, overdrive and clocks
    // -------------------------------------------------------------------------------------------

    pub fn perf_level(&self, dv_ind: u32) -> RsmiResult<PerfLevel> {
        let (dev, _g) = self.locked(dv_ind)?;
        Ok(PerfLevel::from_keyword(&dev.read_str(DevAttr::PerfLevel)?))
    }

    pub fn set_perf_level(&self, dv_ind: u32, level: PerfLevel) -> RsmiResult<()> {
        self.require_root()?;
        if level == PerfLevel::Unknown {
            return Err(Status::InvalidArgs.into());
        }
        let (dev, _g) = self.locked(dv_ind)?;
        dev.write_u64(DevAttr::PerfLevel, level as u64)
    }

    pub fn overdrive_level(&self, dv_ind: u32) -> RsmiResult<u32> {
        let (dev, _g) = self.locked(dv_ind)?;
        narrow(dev.read_u64(DevAttr::OverDriveLevel)?)
    }

    pub fn set_overdrive_level(&self, dv_ind: u32, level: u32) -> RsmiResult<()> {
        self.require_root()?;
        if level > MAX_OVERDRIVE_LEVEL {
            return Err(Status::InvalidArgs.into());
        }
        let (dev, _g) = self.locked(dv_ind)?;
        dev.write_u64(DevAttr::OverDriveLevel, u64::from(level))
    }

    pub fn gpu_clk_freq(&self, dv_ind: u32, clock: ClockType) -> RsmiResult<Frequencies> {
        let (dev, _g) = self.locked(dv_ind)?;
        let lines = dev.read_lines(clock.attr())?;
        frequency_table(&lines).map(|(freqs, _)| freqs)
    }

    /// Restricts `clock` to the levels whose bits are set in `mask`.
    ///
    /// The performance level is switched to manual first, as the driver requires.
    pub fn set_gpu_clk_freq(&self, dv_ind: u32, clock: ClockType, mask: u64) -> RsmiResult<()> {
        self.require_root()?;
        let (dev, _g) = self.locked(dv_ind)?;
        let (freqs, _) = frequency_table(&dev.read_lines(clock.attr())?)?;
        let selection = level_selection(mask, freqs.num_supported)?;
        dev.write_u64(DevAttr::PerfLevel, PerfLevel::Manual as u64)?;
        debug!(dv_ind, ?clock, %selection, "restricting clock levels");
        dev.write_str(clock.attr(), &selection)
    }

    pub fn pci_bandwidth(&self, dv_ind: u32) -> RsmiResult<PcieBandwidth> {
        let (dev, _g) = self.locked(dv_ind)?;
        let (transfer_rate, lanes) = frequency_table(&dev.read_lines(DevAttr::PcieClk)?)?;
        Ok(PcieBandwidth {
            transfer_rate,
            lanes,
        })
    }

    pub fn set_pci_bandwidth(&self, dv_ind: u32, mask: u64) -> RsmiResult<()> {
        self.require_root()?;
        let (dev, _g) = self.locked(dv_ind)?;
        let (freqs, _) = frequency_table(&dev.read_lines(DevAttr::PcieClk)?)?;
        let selection = level_selection(mask, freqs.num_supported)?;
        dev.write_u64(DevAttr::PerfLevel, PerfLevel::Manual as u64)?;
        dev.write_str(DevAttr::PcieClk, &selection)
    }

    /// Selects the power profile given as a single-bit mask.
    pub fn set_power_profile(&self, dv_ind: u32, profile: u64) -> RsmiResult<()> {
        self.require_root()?;
        if profile.count_ones() != 1 {
            return Err(Status::InvalidArgs.into());
        }
        let (dev, _g) = self.locked(dv_ind)?;
        dev.write_u64(DevAttr::PerfLevel, PerfLevel::Manual as u64)?;
        dev.write_u64(DevAttr::PowerProfileMode, u64::from(profile.trailing_zeros()))
    }

    // -------------------------------------------------------------------------------------------
    // PCIe, memory and activity
    // -------------------------------------------------------------------------------------------

    /// Bytes sent and received over the last second.
    pub fn pci_throughput(&self, dv_ind: u32) -> RsmiResult<PcieThroughput> {
        let (dev, _g) = self.locked(dv_ind)?;
        let line = dev.read_line(DevAttr::PcieThroughput)?;
        let fields: Vec<u64> = line
            .split_whitespace()
            .map(str::parse)
            .collect::<Result<_, _>>()
            .map_err(|_| RsmiError::Status(Status::UnexpectedData))?;
        let [sent, received, max_pkt_sz] = fields[..] else {
            return Err(Status::UnexpectedData.into());
        };
        Ok(PcieThroughput {
            sent: sent.saturating_mul(max_pkt_sz),
            received: received.saturating_mul(max_pkt_sz),
            max_pkt_sz,
        })
    }

    pub fn pci_replay_counter(&self, dv_ind: u32) -> RsmiResult<u64> {
        let (dev, _g) = self.locked(dv_ind)?;
        dev.read_u64(DevAttr::PcieReplayCount)
    }

    pub fn memory_total(&self, dv_ind: u32, kind: MemoryType) -> RsmiResult<u64> {
        let (dev, _g) = self.locked(dv_ind)?;
        dev.read_u64(kind.total_attr())
    }

    pub fn memory_usage(&self, dv_ind: u32, kind: MemoryType) -> RsmiResult<u64> {
        let (dev, _g) = self.locked(dv_ind)?;
        dev.read_u64(kind.used_attr())
    }

    pub fn memory_busy_percent(&self, dv_ind: u32) -> RsmiResult<u32> {
        let (dev, _g) = self.locked(dv_ind)?;
        percent(dev.read_u64(DevAttr::MemBusyPercent)?)
    }

    pub fn busy_percent(&self, dv_ind: u32) -> RsmiResult<u32> {
        let (dev, _g) = self.locked(dv_ind)?;
        percent(dev.read_u64(DevAttr::Usage)?)
    }

    pub fn memory_reserved_pages(&self, dv_ind: u32) -> RsmiResult<Vec<RetiredPage>> {
        let (dev, _g) = self.locked(dv_ind)?;
        dev.read_lines(DevAttr::MemPageBad)?
            .iter()
            .filter(|l| !l.trim().is_empty())
            .map(|l| parse_retired_page(l))
            .collect()
    }

    // -------------------------------------------------------------------------------------------
    // Firmware and RAS
    // -------------------------------------------------------------------------------------------

    /// Firmware version of block `block` (`rsmi_fw_block_t` order).
    pub fn firmware_version(&self, dv_ind: u32, block: u32) -> RsmiResult<u64> {
        let attr = *FW_BLOCKS
            .get(block as usize)
            .ok_or(RsmiError::Status(Status::InvalidArgs))?;
        let (dev, _g) = self.locked(dv_ind)?;
        dev.read_u64(attr)
    }

    pub fn ecc_count(&self, dv_ind: u32, block: u64) -> RsmiResult<ErrorCount> {
        let attr = ecc_count_attr(block).ok_or(RsmiError::Status(Status::InvalidArgs))?;
        let (dev, _g) = self.locked(dv_ind)?;
        parse_error_count(&dev.read_lines(attr)?)
    }

    /// Bitmask of RAS-enabled blocks.
    pub fn ecc_enabled(&self, dv_ind: u32) -> RsmiResult<u64> {
        let (dev, _g) = self.locked(dv_ind)?;
        let line = dev.read_line(DevAttr::ErrCntFeatures)?;
        let value = line.rsplit(':').next().unwrap_or_default();
        parse_hex(value).ok_or(RsmiError::Status(Status::UnexpectedData))
    }

    pub fn xgmi_error_status(&self, dv_ind: u32) -> RsmiResult<XgmiStatus> {
        let (dev, _g) = self.locked(dv_ind)?;
        Ok(match dev.read_u64(DevAttr::XgmiError)? {
            0 => XgmiStatus::NoErrors,
            1 => XgmiStatus::Error,
            _ => XgmiStatus::MultipleErrors,
        })
    }

    /// Reading the error file clears it.
    pub fn xgmi_error_reset(&self, dv_ind: u32) -> RsmiResult<()> {
        let (dev, _g) = self.locked(dv_ind)?;
        dev.read_u64(DevAttr::XgmiError).map(|_| ())
    }

    // -------------------------------------------------------------------------------------------
    // hwmon: temperature, voltage, fans, power
    // -------------------------------------------------------------------------------------------

    /// hwmon file index backing temperature sensor `sensor`.
    pub fn temp_sensor_index(&self, dv_ind: u32, sensor: TempSensor) -> RsmiResult<u32> {
        self.device(dv_ind)?.require_monitor()?.temp_index(sensor)
    }

    pub fn volt_sensor_index(&self, dv_ind: u32, sensor: VoltSensor) -> RsmiResult<u32> {
        self.device(dv_ind)?.require_monitor()?.volt_index(sensor)
    }

    /// Millidegrees Celsius.
    pub fn temp_metric(
        &self,
        dv_ind: u32,
        sensor: TempSensor,
        metric: TempMetric,
    ) -> RsmiResult<i64> {
        let (dev, _g) = self.locked(dv_ind)?;
        let mon = dev.require_monitor()?;
        mon.read_i64(MonitorAttr::Temp(metric), mon.temp_index(sensor)?)
    }

    /// Millivolts.
    pub fn volt_metric(
        &self,
        dv_ind: u32,
        sensor: VoltSensor,
        metric: VoltMetric,
    ) -> RsmiResult<i64> {
        let (dev, _g) = self.locked(dv_ind)?;
        let mon = dev.require_monitor()?;
        mon.read_i64(MonitorAttr::Volt(metric), mon.volt_index(sensor)?)
    }

    pub fn fan_rpms(&self, dv_ind: u32, sensor_ind: u32) -> RsmiResult<i64> {
        let (dev, _g) = self.locked(dv_ind)?;
        dev.require_monitor()?
            .read_i64(MonitorAttr::FanRpms, hwmon_index(sensor_ind))
    }

    pub fn fan_speed(&self, dv_ind: u32, sensor_ind: u32) -> RsmiResult<i64> {
        let (dev, _g) = self.locked(dv_ind)?;
        dev.require_monitor()?
            .read_i64(MonitorAttr::FanSpeed, hwmon_index(sensor_ind))
    }

    pub fn fan_speed_max(&self, dv_ind: u32, sensor_ind: u32) -> RsmiResult<u64> {
        let (dev, _g) = self.locked(dv_ind)?;
        dev.require_monitor()?
            .read_u64(MonitorAttr::MaxFanSpeed, hwmon_index(sensor_ind))
    }

    /// Hands fan control back to the firmware.
    pub fn fan_reset(&self, dv_ind: u32, sensor_ind: u32) -> RsmiResult<()> {
        self.require_root()?;
        let (dev, _g) = self.locked(dv_ind)?;
        dev.require_monitor()?.write(
            MonitorAttr::FanControlEnable,
            hwmon_index(sensor_ind),
            FAN_MODE_AUTO,
        )
    }

    /// Switches the fan to manual control and sets its PWM duty.
    ///
    /// # Errors
    /// `InputOutOfBounds` when `speed` exceeds the fan's maximum.
    pub fn set_fan_speed(&self, dv_ind: u32, sensor_ind: u32, speed: u64) -> RsmiResult<()> {
        self.require_root()?;
        let (dev, _g) = self.locked(dv_ind)?;
        let mon = dev.require_monitor()?;
        let index = hwmon_index(sensor_ind);
        if speed > mon.read_u64(MonitorAttr::MaxFanSpeed, index)? {
            return Err(Status::InputOutOfBounds.into());
        }
        mon.write(MonitorAttr::FanControlEnable, index, FAN_MODE_MANUAL)?;
        mon.write(MonitorAttr::FanSpeed, index, &speed.to_string())
    }

    /// Microwatts.
    pub fn power_average(&self, dv_ind: u32, sensor_ind: u32) -> RsmiResult<u64> {
        let (dev, _g) = self.locked(dv_ind)?;
        dev.require_monitor()?
            .read_u64(MonitorAttr::PowerAverage, hwmon_index(sensor_ind))
    }

    pub fn power_cap(&self, dv_ind: u32, sensor_ind: u32) -> RsmiResult<u64> {
        let (dev, _g) = self.locked(dv_ind)?;
        dev.require_monitor()?
            .read_u64(MonitorAttr::PowerCap, hwmon_index(sensor_ind))
    }

    /// `(max, min)` power cap in microwatts.
    pub fn power_cap_range(&self, dv_ind: u32, sensor_ind: u32) -> RsmiResult<(u64, u64)> {
        let (dev, _g) = self.locked(dv_ind)?;
        let mon = dev.require_monitor()?;
        let index = hwmon_index(sensor_ind);
        Ok((
            mon.read_u64(MonitorAttr::PowerCapMax, index)?,
            mon.read_u64(MonitorAttr::PowerCapMin, index)?,
        ))
    }

    /// # Errors
    /// `InvalidArgs` when `cap` lies outside the reported range.
    pub fn set_power_cap(&self, dv_ind: u32, sensor_ind: u32, cap: u64) -> RsmiResult<()> {
        self.require_root()?;
        let (dev, _g) = self.locked(dv_ind)?;
        let mon = dev.require_monitor()?;
        let index = hwmon_index(sensor_ind);
        let max = mon.read_u64(MonitorAttr::PowerCapMax, index)?;
        let min = mon.read_u64(MonitorAttr::PowerCapMin, index)?;
        if !(min..=max).contains(&cap) {
            return Err(Status::InvalidArgs.into());
        }
        mon.write(MonitorAttr::PowerCap, index, &cap.to_string())
    }

    /// Maximum GPU power in milliwatts, from debugfs.
    pub fn max_gpu_power(&self, dv_ind: u32) -> RsmiResult<u64> {
        let (dev, _g) = self.locked(dv_ind)?;
        dev.power_mon().max_gpu_power()
    }

    // -------------------------------------------------------------------------------------------
    // gpu_metrics
    // -------------------------------------------------------------------------------------------

    pub fn gpu_metrics(&self, dv_ind: u32) -> RsmiResult<GpuMetrics> {
        let (dev, _g) = self.locked(dv_ind)?;
        dev.gpu_metrics()
    }

    pub fn gpu_metrics_blob(&self, dv_ind: u32) -> RsmiResult<Vec<u8>> {
        let (dev, _g) = self.locked(dv_ind)?;
        dev.gpu_metrics_blob()
    }

    // -------------------------------------------------------------------------------------------
    // Processes
    // -------------------------------------------------------------------------------------------

    pub fn compute_processes(&self) -> RsmiResult<Vec<ProcessInfo>> {
        process::list_processes(&self.config().kfd_proc_root)
    }

    /// Usage of `pid` summed over the GPUs it has queues on.
    pub fn compute_process_info(&self, pid: u32) -> RsmiResult<ProcessInfo> {
        let root = &self.config().kfd_proc_root;
        let gpus = process::process_gpus(root, pid)?;
        process::process_info_for_pid(root, pid, &gpus, |gpu_id| {
            let dv_ind = self.dev_index_for_gpu_id(gpu_id)?;
            self.kfd_node(dv_ind).ok().map(|n| n.cu_count)
        })
    }

    /// Device indices `pid` is using.
    pub fn compute_process_gpus(&self, pid: u32) -> RsmiResult<Vec<u32>> {
        let gpus = process::process_gpus(&self.config().kfd_proc_root, pid)?;
        Ok(gpus
            .into_iter()
            .filter_map(|g| self.dev_index_for_gpu_id(g))
            .collect())
    }

    // -------------------------------------------------------------------------------------------
    // Versions
    // -------------------------------------------------------------------------------------------

    pub fn driver_version(&self) -> RsmiResult<String> {
        let version = sysfs::read_line(&self.config().driver_version_file)?;
        let version = version.trim();
        if version.is_empty() {
            return Err(Status::NoData.into());
        }
        Ok(version.to_string())
    }

    // -------------------------------------------------------------------------------------------
    // Event counters
    // -------------------------------------------------------------------------------------------

    /// # Errors
    /// `InvalidArgs` for an unknown group, `NotSupported` when the card lacks it.
    pub fn counter_group_supported(&self, dv_ind: u32, group: u32) -> RsmiResult<()> {
        let group = EventGroup::from_raw(group).ok_or(RsmiError::Status(Status::InvalidArgs))?;
        if self.device(dv_ind)?.event_groups().contains(&(group as u32)) {
            Ok(())
        } else {
            Err(Status::NotSupported.into())
        }
    }

    /// A closed counter for `event`; the caller owns it.
    pub fn counter_create(&self, dv_ind: u32, event: u32) -> RsmiResult<Counter> {
        let group = EventGroup::of_event(event).ok_or(RsmiError::Status(Status::InvalidArgs))?;
        self.counter_group_supported(dv_ind, group as u32)?;
        let dev = self.device(dv_ind)?;
        Counter::new(
            &self.config().event_source_root,
            dev.card_index(),
            dv_ind,
            event,
        )
    }

    /// Counters still free in `group`. Only the XGMI group reports this.
    pub fn available_counters(&self, dv_ind: u32, group: u32) -> RsmiResult<u64> {
        self.counter_group_supported(dv_ind, group)?;
        if EventGroup::from_raw(group) != Some(EventGroup::Xgmi) {
            return Err(Status::NotSupported.into());
        }
        let (dev, _g) = self.locked(dv_ind)?;
        dev.read_u64(DevAttr::DfCountersAvailable)
    }

    // -------------------------------------------------------------------------------------------
    // KFD event notification
    // -------------------------------------------------------------------------------------------

    pub fn event_notification_init(&self, dv_ind: u32) -> RsmiResult<()> {
        let gpu_id = self.device(dv_ind)?.kfd_gpu_id();
        let gpu_id = u32::try_from(gpu_id).map_err(|_| RsmiError::Status(Status::InvalidArgs))?;
        self.events().init(dv_ind, gpu_id)
    }

    pub fn event_notification_mask_set(&self, dv_ind: u32, mask: u64) -> RsmiResult<()> {
        self.device(dv_ind)?;
        self.events().mask_set(dv_ind, mask)
    }

    pub fn event_notification_get(
        &self,
        timeout_ms: i32,
        max: usize,
    ) -> RsmiResult<Vec<EventNotification>> {
        self.events().get(timeout_ms, max)
    }

    pub fn event_notification_stop(&self, dv_ind: u32) -> RsmiResult<()> {
        self.device(dv_ind)?;
        self.events().stop(dv_ind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, InitFlags};
    use crate::device::capability::DEFAULT_VARIANT;
    use crate::device::monitor::tests::write_hwmon;
    use crate::discovery::tests::write_linked_card;
    use crate::kfd::node::tests::write_gpu_node;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use tempfile::TempDir;

    const GPU_ID: u64 = 4321;

    const DEVICE_FILES: &[(&str, &str)] = &[
        ("device", "0x66af"),
        ("subsystem_device", "0x081e"),
        ("subsystem_vendor", "0x1002"),
        ("unique_id", "1f2e3d4c"),
        ("serial_number", "692025000000"),
        ("vbios_version", "113-D1631400-X11"),
        ("mem_info_vram_vendor", "samsung"),
        ("numa_node", "-1"),
        ("current_compute_partition", "SPX"),
        ("power_dpm_force_performance_level", "auto"),
        ("pp_sclk_od", "3"),
        ("pp_dpm_sclk", "0: 500Mhz\n1: 1000Mhz *\n"),
        ("pp_dpm_pcie", "0: 2.5GT/s, x8\n1: 8.0GT/s, x16 *\n"),
        ("pp_power_profile_mode", "0 BOOTUP_DEFAULT*"),
        ("pcie_bw", "10 20 128"),
        ("pcie_replay_count", "0"),
        ("gpu_busy_percent", "37"),
        ("mem_busy_percent", "150"),
        ("mem_info_vram_total", "17163091968"),
        ("mem_info_vram_used", "13000000"),
        ("ras/umc_err_count", "ue: 1\nce: 5"),
        ("ras/features", "feature mask: 0x0000006f"),
        ("ras/gpu_vram_bad_pages", "0x00000001 : 0x00001000 : R\n0x00000002 : 0x00001000 : P"),
        ("fw_version/smc_fw_version", "0x00283900"),
        ("df_cntr_avail", "4"),
    ];

    const HWMON_FILES: &[(&str, &str)] = &[
        ("temp1_label", "edge"),
        ("temp1_input", "45000"),
        ("temp2_label", "junction"),
        ("temp2_input", "60000"),
        ("in0_label", "vddgfx"),
        ("in0_input", "906"),
        ("pwm1", "128"),
        ("pwm1_max", "255"),
        ("pwm1_enable", "2"),
        ("fan1_input", "1200"),
        ("power1_average", "35000000"),
        ("power1_cap", "200000000"),
        ("power1_cap_max", "250000000"),
        ("power1_cap_min", "0"),
    ];

    fn write_files(dir: &Path, files: &[(&str, &str)]) {
        for (name, content) in files {
            let path = dir.join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, format!("{content}\n")).unwrap();
        }
    }

    fn system(root: &Path) -> PathBuf {
        let card = write_linked_card(root, 0, "0000:03:00.0", "0x1002");
        write_files(&card.join("device"), DEVICE_FILES);
        write_hwmon(&card, HWMON_FILES);
        fs::create_dir_all(Config::with_root(root).event_source_root.join("amdgpu_df_0")).unwrap();
        write_gpu_node(&Config::with_root(root).kfd_nodes_root, 1, GPU_ID, 0x300, 0);
        card
    }

    fn state(root: &Path, flags: InitFlags, euid: u32) -> SmiState {
        SmiState::build(Arc::new(Config::with_root(root)), flags)
            .unwrap()
            .with_euid(euid)
    }

    fn read(card: &Path, name: &str) -> String {
        fs::read_to_string(card.join("device").join(name)).unwrap()
    }

    #[test]
    fn identity_reads() {
        let tmp = TempDir::new().unwrap();
        system(tmp.path());
        let s = state(tmp.path(), InitFlags::default(), 0);

        assert_eq!(s.dev_id(0).unwrap(), 0x66af);
        assert_eq!(s.vendor_id(0).unwrap(), 0x1002);
        assert_eq!(s.subsystem_id(0).unwrap(), 0x081e);
        assert_eq!(s.pci_id(0).unwrap(), 0x300);
        assert_eq!(s.drm_render_minor(0).unwrap(), 128);
        assert_eq!(s.unique_id(0).unwrap(), 0x1f2e_3d4c);
        assert_eq!(s.serial_number(0).unwrap(), "692025000000");
        assert_eq!(s.vbios_version(0).unwrap(), "113-D1631400-X11");
        assert_eq!(s.vram_vendor(0).unwrap(), "samsung");
        assert_eq!(s.numa_affinity(0).unwrap(), -1);
        assert_eq!(s.compute_partition(0).unwrap(), "SPX");
        assert!(s.memory_partition(0).is_err());
        assert_eq!(s.dev_id(1).unwrap_err().status(), Status::InvalidArgs);
    }

    #[test]
    fn perf_level_round_trip_needs_root() {
        let tmp = TempDir::new().unwrap();
        let card = system(tmp.path());

        let user = state(tmp.path(), InitFlags::default(), 1000);
        assert_eq!(user.perf_level(0).unwrap(), PerfLevel::Auto);
        assert_eq!(
            user.set_perf_level(0, PerfLevel::High).unwrap_err().status(),
            Status::Permission
        );
        assert_eq!(read(&card, "power_dpm_force_performance_level"), "auto\n");

        let root = state(tmp.path(), InitFlags::default(), 0);
        root.set_perf_level(0, PerfLevel::StablePeak).unwrap();
        assert_eq!(root.perf_level(0).unwrap(), PerfLevel::StablePeak);
        assert_eq!(
            root.set_perf_level(0, PerfLevel::Unknown).unwrap_err().status(),
            Status::InvalidArgs
        );

        assert_eq!(root.overdrive_level(0).unwrap(), 3);
        root.set_overdrive_level(0, 20).unwrap();
        assert_eq!(root.overdrive_level(0).unwrap(), 20);
        assert_eq!(
            root.set_overdrive_level(0, 21).unwrap_err().status(),
            Status::InvalidArgs
        );
    }

    #[test]
    fn clock_tables_and_level_selection() {
        let tmp = TempDir::new().unwrap();
        let card = system(tmp.path());
        let s = state(tmp.path(), InitFlags::default(), 0);

        let sclk = s.gpu_clk_freq(0, ClockType::Sys).unwrap();
        assert_eq!(sclk.levels(), &[500_000_000, 1_000_000_000]);
        assert_eq!(sclk.current, 1);
        assert_eq!(
            s.gpu_clk_freq(0, ClockType::Mem).unwrap_err().status(),
            Status::NotSupported
        );

        s.set_gpu_clk_freq(0, ClockType::Sys, 0b11).unwrap();
        assert_eq!(read(&card, "pp_dpm_sclk"), "0 1");
        assert_eq!(read(&card, "power_dpm_force_performance_level"), "manual");

        fs::write(card.join("device/pp_dpm_sclk"), "0: 500Mhz\n1: 1000Mhz *\n").unwrap();
        assert_eq!(
            s.set_gpu_clk_freq(0, ClockType::Sys, 0b100).unwrap_err().status(),
            Status::InvalidArgs
        );

        let pcie = s.pci_bandwidth(0).unwrap();
        assert_eq!(pcie.transfer_rate.levels(), &[2_500_000_000, 8_000_000_000]);
        assert_eq!(pcie.transfer_rate.current, 1);
        assert_eq!(&pcie.lanes[..2], &[8, 16]);

        s.set_power_profile(0, 1 << 4).unwrap();
        assert_eq!(read(&card, "pp_power_profile_mode"), "4");
        assert_eq!(
            s.set_power_profile(0, 0b11).unwrap_err().status(),
            Status::InvalidArgs
        );
    }

    #[test]
    fn pcie_memory_and_activity() {
        let tmp = TempDir::new().unwrap();
        system(tmp.path());
        let s = state(tmp.path(), InitFlags::default(), 0);

        assert_eq!(s.pci_throughput(0).unwrap(), PcieThroughput {
            sent: 1280,
            received: 2560,
            max_pkt_sz: 128,
        });
        assert_eq!(s.pci_replay_counter(0).unwrap(), 0);
        assert_eq!(s.memory_total(0, MemoryType::Vram).unwrap(), 17_163_091_968);
        assert_eq!(s.memory_usage(0, MemoryType::Vram).unwrap(), 13_000_000);
        assert_eq!(
            s.memory_total(0, MemoryType::Gtt).unwrap_err().status(),
            Status::NotSupported
        );
        assert_eq!(s.busy_percent(0).unwrap(), 37);
        assert_eq!(
            s.memory_busy_percent(0).unwrap_err().status(),
            Status::UnexpectedData
        );
    }

    #[test]
    fn ras_and_firmware() {
        let tmp = TempDir::new().unwrap();
        system(tmp.path());
        let s = state(tmp.path(), InitFlags::default(), 0);

        assert_eq!(s.ecc_count(0, 0x1).unwrap(), ErrorCount {
            correctable_err: 5,
            uncorrectable_err: 1,
        });
        assert_eq!(s.ecc_count(0, 0x4).unwrap_err().status(), Status::NotSupported);
        assert_eq!(s.ecc_count(0, 0x8).unwrap_err().status(), Status::InvalidArgs);
        assert_eq!(s.ecc_enabled(0).unwrap(), 0x6f);

        let pages = s.memory_reserved_pages(0).unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].page_address, 1);
        assert_eq!(pages[0].page_size, 0x1000);
        assert_eq!(pages[1].status, PageStatus::Pending);

        assert_eq!(s.firmware_version(0, 14).unwrap(), 0x0028_3900);
        assert_eq!(s.firmware_version(0, 0).unwrap_err().status(), Status::NotSupported);
        assert_eq!(s.firmware_version(0, 99).unwrap_err().status(), Status::InvalidArgs);
        assert_eq!(
            s.xgmi_error_status(0).unwrap_err().status(),
            Status::NotSupported
        );
    }

    #[test]
    fn hwmon_sensors() {
        let tmp = TempDir::new().unwrap();
        system(tmp.path());
        let s = state(tmp.path(), InitFlags::default(), 0);

        assert_eq!(
            s.temp_metric(0, TempSensor::Junction, TempMetric::Current).unwrap(),
            60_000
        );
        assert_eq!(
            s.temp_metric(0, TempSensor::Memory, TempMetric::Current)
                .unwrap_err()
                .status(),
            Status::NotSupported
        );
        assert_eq!(
            s.volt_metric(0, VoltSensor::Vddgfx, VoltMetric::Current).unwrap(),
            906
        );
        assert_eq!(s.fan_rpms(0, 0).unwrap(), 1200);
        assert_eq!(s.fan_speed(0, 0).unwrap(), 128);
        assert_eq!(s.fan_speed_max(0, 0).unwrap(), 255);
        assert_eq!(s.power_average(0, 0).unwrap(), 35_000_000);
        assert_eq!(s.power_cap_range(0, 0).unwrap(), (250_000_000, 0));
    }

    #[test]
    fn hwmon_writes_validate_ranges() {
        let tmp = TempDir::new().unwrap();
        let card = system(tmp.path());
        let hwmon = card.join("device/hwmon/hwmon3");
        let s = state(tmp.path(), InitFlags::default(), 0);

        assert_eq!(
            s.set_fan_speed(0, 0, 300).unwrap_err().status(),
            Status::InputOutOfBounds
        );
        s.set_fan_speed(0, 0, 100).unwrap();
        assert_eq!(fs::read_to_string(hwmon.join("pwm1")).unwrap(), "100");
        assert_eq!(fs::read_to_string(hwmon.join("pwm1_enable")).unwrap(), "1");
        s.fan_reset(0, 0).unwrap();
        assert_eq!(fs::read_to_string(hwmon.join("pwm1_enable")).unwrap(), "2");

        assert_eq!(
            s.set_power_cap(0, 0, 300_000_000).unwrap_err().status(),
            Status::InvalidArgs
        );
        s.set_power_cap(0, 0, 150_000_000).unwrap();
        assert_eq!(s.power_cap(0, 0).unwrap(), 150_000_000);
    }

    #[test]
    fn capability_probe() {
        let tmp = TempDir::new().unwrap();
        system(tmp.path());
        let s = state(tmp.path(), InitFlags::default(), 0);

        s.supports(0, "rsmi_dev_perf_level_get", DEFAULT_VARIANT, DEFAULT_VARIANT)
            .unwrap();
        s.supports(0, "rsmi_dev_gpu_clk_freq_get", ClockType::Sys as u64, DEFAULT_VARIANT)
            .unwrap();
        assert_eq!(
            s.supports(0, "rsmi_dev_xgmi_error_status", DEFAULT_VARIANT, DEFAULT_VARIANT)
                .unwrap_err()
                .status(),
            Status::NotSupported
        );
        assert_eq!(
            s.supports(0, "rsmi_dev_gpu_clk_freq_get", ClockType::Dcef as u64, DEFAULT_VARIANT)
                .unwrap_err()
                .status(),
            Status::InvalidArgs
        );

        let junction = s.temp_sensor_index(0, TempSensor::Junction).unwrap();
        s.supports(0, "rsmi_dev_temp_metric_get", TempMetric::Current as u64, u64::from(junction))
            .unwrap();
        assert_eq!(
            s.supports(0, "rsmi_dev_temp_metric_get", TempMetric::Current as u64, 7)
                .unwrap_err()
                .status(),
            Status::InvalidArgs
        );
    }

    #[test]
    fn non_blocking_mode_reports_busy() {
        let tmp = TempDir::new().unwrap();
        system(tmp.path());
        let s = state(tmp.path(), InitFlags(InitFlags::NON_BLOCKING), 0);

        let held = s.device(0).unwrap().guard(true).unwrap();
        assert_eq!(s.busy_percent(0).unwrap_err().status(), Status::Busy);
        drop(held);
        assert_eq!(s.busy_percent(0).unwrap(), 37);
    }

    #[test]
    fn processes_map_to_devices() {
        let tmp = TempDir::new().unwrap();
        system(tmp.path());
        let proc_dir = Config::with_root(tmp.path()).kfd_proc_root.join("77");
        write_files(&proc_dir, &[
            ("pasid", "32769"),
            ("queues/0/gpuid", &GPU_ID.to_string()),
            (&format!("vram_{GPU_ID}"), "4096"),
            (&format!("sdma_{GPU_ID}"), "8"),
            (&format!("stats_{GPU_ID}/cu_occupancy"), "60"),
        ]);
        let s = state(tmp.path(), InitFlags::default(), 0);

        let procs = s.compute_processes().unwrap();
        assert_eq!((procs[0].process_id, procs[0].pasid), (77, 32769));

        let info = s.compute_process_info(77).unwrap();
        assert_eq!(info.vram_usage, 4096);
        assert_eq!(info.sdma_usage, 8);
        assert_eq!(info.cu_occupancy, 50);
        assert_eq!(s.compute_process_gpus(77).unwrap(), vec![0]);
        assert_eq!(
            s.compute_process_info(78).unwrap_err().status(),
            Status::NotFound
        );
    }

    #[test]
    fn counter_groups_follow_event_source_tree() {
        let tmp = TempDir::new().unwrap();
        system(tmp.path());
        let s = state(tmp.path(), InitFlags::default(), 0);

        s.counter_group_supported(0, EventGroup::Xgmi as u32).unwrap();
        assert_eq!(
            s.counter_group_supported(0, EventGroup::XgmiDataOut as u32)
                .unwrap_err()
                .status(),
            Status::NotSupported
        );
        assert_eq!(
            s.counter_group_supported(0, 3).unwrap_err().status(),
            Status::InvalidArgs
        );

        let counter = s.counter_create(0, 5).unwrap();
        assert_eq!((counter.event(), counter.dev_ind()), (5, 0));
        assert!(!counter.is_open());
        assert_eq!(s.counter_create(0, 12).unwrap_err().status(), Status::NotSupported);
        assert_eq!(s.available_counters(0, EventGroup::Xgmi as u32).unwrap(), 4);
    }

    #[test]
    fn driver_version_comes_from_module_file() {
        let tmp = TempDir::new().unwrap();
        system(tmp.path());
        let s = state(tmp.path(), InitFlags::default(), 0);
        assert_eq!(s.driver_version().unwrap_err().status(), Status::NotSupported);

        let file = Config::with_root(tmp.path()).driver_version_file;
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, "6.3.6\n").unwrap();
        assert_eq!(s.driver_version().unwrap(), "6.3.6");
    }

    #[test]
    fn parsers_reject_malformed_content() {
        assert!(parse_retired_page("0x1 : zz : R").is_err());
        assert!(parse_retired_page("0x1 : 0x1000 : X").is_err());
        assert_eq!(
            parse_error_count(&["ue: 3".to_string()]).unwrap_err().status(),
            Status::UnexpectedData
        );
        assert_eq!(level_selection(0b101, 3).unwrap(), "0 2");
    }

    fn levels(lines: &[&str]) -> Vec<String> {
        lines.iter().map(|l| (*l).to_string()).collect()
    }

    #[test]
    fn frequency_table_without_current_level_is_not_supported() {
        let err = frequency_table(&levels(&["0: 500Mhz", "1: 800Mhz"])).unwrap_err();
        assert_eq!(err.status(), Status::NotSupported);

        let tmp = TempDir::new().unwrap();
        let card = system(tmp.path());
        fs::write(card.join("device/pp_dpm_mclk"), "0: 100Mhz\n1: 875Mhz\n").unwrap();
        let s = state(tmp.path(), InitFlags::default(), 0);
        assert_eq!(
            s.gpu_clk_freq(0, ClockType::Mem).unwrap_err().status(),
            Status::NotSupported
        );
    }

    #[test]
    fn empty_frequency_table_is_not_yet_implemented() {
        assert_eq!(
            frequency_table(&[]).unwrap_err().status(),
            Status::NotYetImplemented
        );
        assert_eq!(
            frequency_table(&levels(&["", "  "])).unwrap_err().status(),
            Status::NotYetImplemented
        );
    }

    #[test]
    fn oversized_frequency_table_is_unexpected_size() {
        let full: Vec<String> = (0..MAX_NUM_FREQUENCIES)
            .map(|i| format!("{i}: {}Mhz{}", 100 + i, if i == 0 { " *" } else { "" }))
            .collect();
        let (freqs, _) = frequency_table(&full).unwrap();
        assert_eq!(freqs.levels().len(), MAX_NUM_FREQUENCIES);

        let mut over = full;
        over.push(format!("{MAX_NUM_FREQUENCIES}: 999Mhz"));
        assert_eq!(
            frequency_table(&over).unwrap_err().status(),
            Status::UnexpectedSize
        );
    }
}
