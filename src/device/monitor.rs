//! hwmon sensors of one card.

use crate::device::capability::{FileSet, SensorTag};
use crate::error::{RsmiError, RsmiResult, Status};
use crate::sysfs;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// hwmon `name` values that mark an AMD GPU monitor.
const AMD_MONITOR_NAMES: [&str; 2] = ["radeon", "amdgpu"];

/// A hwmon file, named with `#` standing for the 1-based sensor index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorAttr {
    Name,
    Temp(TempMetric),
    TempLabel,
    Volt(VoltMetric),
    VoltLabel,
    FanSpeed,
    FanControlEnable,
    MaxFanSpeed,
    FanRpms,
    PowerCap,
    PowerCapMax,
    PowerCapMin,
    PowerAverage,
}

impl MonitorAttr {
    #[must_use]
    pub const fn pattern(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Temp(m) => m.pattern(),
            Self::TempLabel => "temp#_label",
            Self::Volt(m) => m.pattern(),
            Self::VoltLabel => "in#_label",
            Self::FanSpeed => "pwm#",
            Self::FanControlEnable => "pwm#_enable",
            Self::MaxFanSpeed => "pwm#_max",
            Self::FanRpms => "fan#_input",
            Self::PowerCap => "power#_cap",
            Self::PowerCapMax => "power#_cap_max",
            Self::PowerCapMin => "power#_cap_min",
            Self::PowerAverage => "power#_average",
        }
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempMetric {
    Current = 0,
    Max,
    Min,
    MaxHyst,
    MinHyst,
    Critical,
    CriticalHyst,
    Emergency,
    EmergencyHyst,
    CritMin,
    CritMinHyst,
    Offset,
    Lowest,
    Highest,
}

impl TempMetric {
    pub const ALL: [Self; 14] = [
        Self::Current,
        Self::Max,
        Self::Min,
        Self::MaxHyst,
        Self::MinHyst,
        Self::Critical,
        Self::CriticalHyst,
        Self::Emergency,
        Self::EmergencyHyst,
        Self::CritMin,
        Self::CritMinHyst,
        Self::Offset,
        Self::Lowest,
        Self::Highest,
    ];

    #[must_use]
    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }

    #[must_use]
    pub const fn pattern(self) -> &'static str {
        match self {
            Self::Current => "temp#_input",
            Self::Max => "temp#_max",
            Self::Min => "temp#_min",
            Self::MaxHyst => "temp#_max_hyst",
            Self::MinHyst => "temp#_min_hyst",
            Self::Critical => "temp#_crit",
            Self::CriticalHyst => "temp#_crit_hyst",
            Self::Emergency => "temp#_emergency",
            Self::EmergencyHyst => "temp#_emergency_hyst",
            Self::CritMin => "temp#_lcrit",
            Self::CritMinHyst => "temp#_lcrit_hyst",
            Self::Offset => "temp#_offset",
            Self::Lowest => "temp#_lowest",
            Self::Highest => "temp#_highest",
        }
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoltMetric {
    Current = 0,
    Max,
    MinCrit,
    Min,
    MaxCrit,
    Average,
    Lowest,
    Highest,
}

impl VoltMetric {
    pub const ALL: [Self; 8] = [
        Self::Current,
        Self::Max,
        Self::MinCrit,
        Self::Min,
        Self::MaxCrit,
        Self::Average,
        Self::Lowest,
        Self::Highest,
    ];

    #[must_use]
    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }

    #[must_use]
    pub const fn pattern(self) -> &'static str {
        match self {
            Self::Current => "in#_input",
            Self::Max => "in#_max",
            Self::MinCrit => "in#_lcrit",
            Self::Min => "in#_min",
            Self::MaxCrit => "in#_crit",
            Self::Average => "in#_average",
            Self::Lowest => "in#_lowest",
            Self::Highest => "in#_highest",
        }
    }
}

/// Semantic temperature sensor (`rsmi_temperature_type_t`).
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TempSensor {
    Edge = 0,
    Junction = 1,
    Memory = 2,
}

impl TempSensor {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Edge),
            1 => Some(Self::Junction),
            2 => Some(Self::Memory),
            _ => None,
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        match label {
            "edge" => Some(Self::Edge),
            "junction" => Some(Self::Junction),
            "mem" => Some(Self::Memory),
            _ => None,
        }
    }
}

/// Semantic voltage sensor (`rsmi_voltage_type_t`).
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VoltSensor {
    Vddgfx = 0,
}

impl VoltSensor {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Vddgfx),
            _ => None,
        }
    }
}

/// Label maps in both directions for the tagged sensor families.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct SensorLabels {
    temp: BTreeMap<TempSensor, u32>,
    temp_by_index: BTreeMap<u32, TempSensor>,
    volt: BTreeMap<VoltSensor, u32>,
    volt_by_index: BTreeMap<u32, VoltSensor>,
}

#[derive(Debug)]
pub struct Monitor {
    path: PathBuf,
    labels: SensorLabels,
}

impl Monitor {
    /// Opens the hwmon directory at `path` and reads its sensor labels.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        let labels = scan_labels(&path);
        debug!(
            path = %path.display(),
            temps = ?labels.temp,
            volts = ?labels.volt,
            "monitor labels"
        );
        Self { path, labels }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `<hwmon>/<pattern>` with `#` replaced by `index`.
    #[must_use]
    pub fn attr_path(&self, attr: MonitorAttr, index: u32) -> PathBuf {
        self.path
            .join(attr.pattern().replace('#', &index.to_string()))
    }

    pub fn read(&self, attr: MonitorAttr, index: u32) -> RsmiResult<String> {
        sysfs::read_token(&self.attr_path(attr, index))
    }

    pub fn read_u64(&self, attr: MonitorAttr, index: u32) -> RsmiResult<u64> {
        sysfs::read_u64(&self.attr_path(attr, index))
    }

    /// Signed reading, e.g. temperatures below zero or offsets.
    pub fn read_i64(&self, attr: MonitorAttr, index: u32) -> RsmiResult<i64> {
        let path = self.attr_path(attr, index);
        let token = sysfs::read_token(&path)?;
        if token.is_empty() {
            return Err(Status::NoData.into());
        }
        token
            .parse()
            .map_err(|_| RsmiError::parse(&path, format!("expected an integer, found {token:?}")))
    }

    pub fn write(&self, attr: MonitorAttr, index: u32, value: &str) -> RsmiResult<()> {
        sysfs::write_str(&self.attr_path(attr, index), value)
    }

    /// File index of a temperature sensor.
    ///
    /// # Errors
    /// `NotSupported` when no `temp#_label` names it.
    pub fn temp_index(&self, sensor: TempSensor) -> RsmiResult<u32> {
        self.labels
            .temp
            .get(&sensor)
            .copied()
            .ok_or_else(|| Status::NotSupported.into())
    }

    pub fn volt_index(&self, sensor: VoltSensor) -> RsmiResult<u32> {
        self.labels
            .volt
            .get(&sensor)
            .copied()
            .ok_or_else(|| Status::NotSupported.into())
    }

    /// The semantic type id of file index `index` in a tagged family.
    #[must_use]
    pub fn sensor_tag(&self, tag: SensorTag, index: u32) -> u64 {
        match tag {
            SensorTag::Temperature => self
                .labels
                .temp_by_index
                .get(&index)
                .map_or(0, |s| *s as u64),
            SensorTag::Voltage => self
                .labels
                .volt_by_index
                .get(&index)
                .map_or(0, |s| *s as u64),
            SensorTag::None => 0,
        }
    }

    #[must_use]
    pub fn files(&self) -> FileSet {
        FileSet::scan(&self.path, &[])
    }
}

fn scan_labels(dir: &Path) -> SensorLabels {
    let files = FileSet::scan(dir, &[]);
    let mut labels = SensorLabels::default();

    let temp_indices = files.indices(MonitorAttr::TempLabel.pattern());
    if temp_indices.is_empty() {
        labels.temp.insert(TempSensor::Edge, 1);
        labels.temp_by_index.insert(1, TempSensor::Edge);
    }
    for index in temp_indices {
        let path = dir.join(format!("temp{index}_label"));
        let Ok(label) = sysfs::read_token(&path) else {
            continue;
        };
        if let Some(sensor) = TempSensor::from_label(&label) {
            labels.temp.entry(sensor).or_insert(index);
            labels.temp_by_index.insert(index, sensor);
        }
    }

    for index in files.indices(MonitorAttr::VoltLabel.pattern()) {
        let path = dir.join(format!("in{index}_label"));
        if sysfs::read_token(&path).is_ok_and(|l| l == "vddgfx") {
            labels.volt.entry(VoltSensor::Vddgfx).or_insert(index);
            labels.volt_by_index.insert(index, VoltSensor::Vddgfx);
        }
    }
    labels
}

/// Finds the AMD hwmon directory under `<card>/device/hwmon`.
#[must_use]
pub fn find_hwmon(card_path: &Path) -> Option<PathBuf> {
    let root = card_path.join("device").join("hwmon");
    sysfs::list_names(&root)
        .into_iter()
        .map(|n| root.join(n))
        .find(|dir| {
            sysfs::read_token(&dir.join("name"))
                .is_ok_and(|name| AMD_MONITOR_NAMES.contains(&name.as_str()))
        })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    pub(crate) fn write_hwmon(card: &Path, files: &[(&str, &str)]) -> PathBuf {
        let dir = card.join("device/hwmon/hwmon3");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("name"), "amdgpu\n").unwrap();
        for (name, content) in files {
            fs::write(dir.join(name), format!("{content}\n")).unwrap();
        }
        dir
    }

    #[test]
    fn finds_amd_monitor_only() {
        let tmp = TempDir::new().unwrap();
        let other = tmp.path().join("device/hwmon/hwmon0");
        fs::create_dir_all(&other).unwrap();
        fs::write(other.join("name"), "k10temp\n").unwrap();
        assert_eq!(find_hwmon(tmp.path()), None);

        let dir = write_hwmon(tmp.path(), &[]);
        assert_eq!(find_hwmon(tmp.path()), Some(dir));
    }

    #[test]
    fn labels_map_sensors_to_files() {
        let tmp = TempDir::new().unwrap();
        let dir = write_hwmon(
            tmp.path(),
            &[
                ("temp1_label", "edge"),
                ("temp2_label", "junction"),
                ("temp3_label", "mem"),
                ("in0_label", "vddgfx"),
                ("temp2_input", "65000"),
            ],
        );
        let mon = Monitor::new(dir);
        assert_eq!(mon.temp_index(TempSensor::Junction).unwrap(), 2);
        assert_eq!(mon.volt_index(VoltSensor::Vddgfx).unwrap(), 0);
        assert_eq!(mon.sensor_tag(SensorTag::Temperature, 3), TempSensor::Memory as u64);
        assert_eq!(
            mon.read_u64(MonitorAttr::Temp(TempMetric::Current), 2).unwrap(),
            65000
        );
    }

    #[test]
    fn unlabelled_monitor_treats_temp1_as_edge() {
        let tmp = TempDir::new().unwrap();
        let dir = write_hwmon(tmp.path(), &[("temp1_input", "40000")]);
        let mon = Monitor::new(dir);
        assert_eq!(mon.temp_index(TempSensor::Edge).unwrap(), 1);
        assert_eq!(
            mon.temp_index(TempSensor::Memory).unwrap_err().status(),
            Status::NotSupported
        );
    }

    #[test]
    fn paths_replace_index() {
        let mon = Monitor {
            path: PathBuf::from("/hw"),
            labels: SensorLabels::default(),
        };
        assert_eq!(
            mon.attr_path(MonitorAttr::PowerCapMax, 1),
            PathBuf::from("/hw/power1_cap_max")
        );
        assert_eq!(
            mon.attr_path(MonitorAttr::Volt(VoltMetric::MinCrit), 0),
            PathBuf::from("/hw/in0_lcrit")
        );
    }
}
