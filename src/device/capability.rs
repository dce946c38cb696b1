//! Capability derivation.
//!
//! Each public function is described by the files it needs. Evaluating the tables against the
//! set of files a device actually exposes yields the device's [`SupportedFuncMap`], which every
//! accessor consults before touching sysfs.

use crate::device::attribute::{ClockType, DevAttr, FW_BLOCKS, MemoryType, gpu_block};
use crate::error::Status;
use crate::sysfs;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Variant/subvariant wildcard (`RSMI_DEFAULT_VARIANT`).
pub const DEFAULT_VARIANT: u64 = u64::MAX;

/// Subvariants carry the semantic sensor type above this bit.
pub const MONITOR_TYPE_BIT_POSITION: u32 = 16;
pub const MONITOR_IND_BIT_MASK: u64 = (1 << MONITOR_TYPE_BIT_POSITION) - 1;

pub type SubvariantList = Vec<u64>;
pub type VariantMap = BTreeMap<u64, Option<SubvariantList>>;
pub type SupportedFuncMap = BTreeMap<&'static str, Option<VariantMap>>;

/// Which label map supplies the semantic tag of a sensor index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorTag {
    None,
    Temperature,
    Voltage,
}

/// One row of a dependency table.
#[derive(Debug, Clone, Copy)]
pub struct FuncDepends {
    pub name: &'static str,
    /// Files that must all exist. `#` marks a sensor index.
    pub mandatory: &'static [&'static str],
    /// `(variant id, file)` pairs; an empty list means the function has no variants.
    pub variants: &'static [(u64, &'static str)],
    pub tag: SensorTag,
}

const fn dep(name: &'static str, mandatory: &'static [&'static str]) -> FuncDepends {
    FuncDepends {
        name,
        mandatory,
        variants: &[],
        tag: SensorTag::None,
    }
}

// ===============================================================================================
// Device table
// ===============================================================================================

const PERF: &str = DevAttr::PerfLevel.file_name();

const MEM_TOTAL_VARIANTS: &[(u64, &str)] = &[
    (MemoryType::Gtt as u64, DevAttr::MemTotGtt.file_name()),
    (MemoryType::VisVram as u64, DevAttr::MemTotVisVram.file_name()),
    (MemoryType::Vram as u64, DevAttr::MemTotVram.file_name()),
];

const MEM_USED_VARIANTS: &[(u64, &str)] = &[
    (MemoryType::Gtt as u64, DevAttr::MemUsedGtt.file_name()),
    (MemoryType::VisVram as u64, DevAttr::MemUsedVisVram.file_name()),
    (MemoryType::Vram as u64, DevAttr::MemUsedVram.file_name()),
];

const CLOCK_VARIANTS: &[(u64, &str)] = &[
    (ClockType::Sys as u64, ClockType::Sys.attr().file_name()),
    (ClockType::Mem as u64, ClockType::Mem.attr().file_name()),
    (ClockType::Df as u64, ClockType::Df.attr().file_name()),
    (ClockType::Dcef as u64, ClockType::Dcef.attr().file_name()),
    (ClockType::Soc as u64, ClockType::Soc.attr().file_name()),
];

const FW_VARIANTS: &[(u64, &str)] = &{
    let mut out = [(0u64, ""); FW_BLOCKS.len()];
    let mut i = 0;
    while i < FW_BLOCKS.len() {
        out[i] = (i as u64, FW_BLOCKS[i].file_name());
        i += 1;
    }
    out
};

const ECC_COUNT_VARIANTS: &[(u64, &str)] = &[
    (gpu_block::UMC, DevAttr::ErrCntUmc.file_name()),
    (gpu_block::SDMA, DevAttr::ErrCntSdma.file_name()),
    (gpu_block::GFX, DevAttr::ErrCntGfx.file_name()),
];

/// The XGMI event group is counted through `df_cntr_avail`.
const COUNTER_VARIANTS: &[(u64, &str)] = &[(0, DevAttr::DfCountersAvailable.file_name())];

pub const DEVICE_FUNCS: &[FuncDepends] = &[
    dep("rsmi_dev_vram_vendor_get", &[DevAttr::VramVendor.file_name()]),
    dep("rsmi_dev_id_get", &[DevAttr::DevId.file_name()]),
    dep("rsmi_dev_vendor_id_get", &[DevAttr::VendorId.file_name()]),
    dep(
        "rsmi_dev_name_get",
        &[DevAttr::VendorId.file_name(), DevAttr::DevId.file_name()],
    ),
    dep("rsmi_dev_brand_get", &[DevAttr::VendorId.file_name()]),
    dep("rsmi_dev_vendor_name_get", &[DevAttr::VendorId.file_name()]),
    dep("rsmi_dev_serial_number_get", &[DevAttr::SerialNumber.file_name()]),
    dep("rsmi_dev_subsystem_id_get", &[DevAttr::SubSysDevId.file_name()]),
    dep(
        "rsmi_dev_subsystem_name_get",
        &[
            DevAttr::SubSysVendorId.file_name(),
            DevAttr::VendorId.file_name(),
            DevAttr::DevId.file_name(),
        ],
    ),
    dep("rsmi_dev_drm_render_minor_get", &[]),
    dep(
        "rsmi_dev_subsystem_vendor_id_get",
        &[DevAttr::SubSysVendorId.file_name()],
    ),
    dep("rsmi_dev_unique_id_get", &[DevAttr::UniqueId.file_name()]),
    dep("rsmi_dev_pci_bandwidth_get", &[DevAttr::PcieClk.file_name()]),
    dep("rsmi_dev_pci_id_get", &[]),
    dep("rsmi_dev_pci_throughput_get", &[DevAttr::PcieThroughput.file_name()]),
    dep(
        "rsmi_dev_pci_replay_counter_get",
        &[DevAttr::PcieReplayCount.file_name()],
    ),
    dep(
        "rsmi_dev_pci_bandwidth_set",
        &[PERF, DevAttr::PcieClk.file_name()],
    ),
    dep(
        "rsmi_dev_power_profile_set",
        &[PERF, DevAttr::PowerProfileMode.file_name()],
    ),
    dep(
        "rsmi_dev_memory_busy_percent_get",
        &[DevAttr::MemBusyPercent.file_name()],
    ),
    dep("rsmi_dev_busy_percent_get", &[DevAttr::Usage.file_name()]),
    dep(
        "rsmi_dev_memory_reserved_pages_get",
        &[DevAttr::MemPageBad.file_name()],
    ),
    dep(
        "rsmi_dev_overdrive_level_get",
        &[DevAttr::OverDriveLevel.file_name()],
    ),
    dep(
        "rsmi_dev_overdrive_level_set",
        &[DevAttr::OverDriveLevel.file_name()],
    ),
    dep(
        "rsmi_dev_power_profile_presets_get",
        &[DevAttr::PowerProfileMode.file_name()],
    ),
    dep("rsmi_dev_perf_level_set", &[PERF]),
    dep("rsmi_dev_perf_level_get", &[PERF]),
    dep("rsmi_dev_vbios_version_get", &[DevAttr::VBiosVer.file_name()]),
    dep("rsmi_dev_od_volt_info_get", &[DevAttr::PowerOdVoltage.file_name()]),
    dep(
        "rsmi_dev_od_volt_curve_regions_get",
        &[DevAttr::PowerOdVoltage.file_name()],
    ),
    dep("rsmi_dev_ecc_enabled_get", &[DevAttr::ErrCntFeatures.file_name()]),
    dep("rsmi_dev_ecc_status_get", &[DevAttr::ErrCntFeatures.file_name()]),
    dep("rsmi_dev_counter_group_supported", &[]),
    dep("rsmi_dev_counter_create", &[]),
    dep("rsmi_dev_xgmi_error_status", &[DevAttr::XgmiError.file_name()]),
    dep("rsmi_dev_xgmi_error_reset", &[DevAttr::XgmiError.file_name()]),
    dep("rsmi_topo_numa_affinity_get", &[DevAttr::NumaNode.file_name()]),
    dep("rsmi_dev_gpu_metrics_info_get", &[DevAttr::GpuMetrics.file_name()]),
    dep(
        "rsmi_dev_compute_partition_get",
        &[DevAttr::ComputePartition.file_name()],
    ),
    dep(
        "rsmi_dev_memory_partition_get",
        &[DevAttr::MemoryPartition.file_name()],
    ),
    FuncDepends {
        name: "rsmi_dev_memory_total_get",
        mandatory: &[],
        variants: MEM_TOTAL_VARIANTS,
        tag: SensorTag::None,
    },
    FuncDepends {
        name: "rsmi_dev_memory_usage_get",
        mandatory: &[],
        variants: MEM_USED_VARIANTS,
        tag: SensorTag::None,
    },
    FuncDepends {
        name: "rsmi_dev_gpu_clk_freq_get",
        mandatory: &[],
        variants: CLOCK_VARIANTS,
        tag: SensorTag::None,
    },
    FuncDepends {
        name: "rsmi_dev_gpu_clk_freq_set",
        mandatory: &[PERF],
        variants: CLOCK_VARIANTS,
        tag: SensorTag::None,
    },
    FuncDepends {
        name: "rsmi_dev_firmware_version_get",
        mandatory: &[],
        variants: FW_VARIANTS,
        tag: SensorTag::None,
    },
    FuncDepends {
        name: "rsmi_dev_ecc_count_get",
        mandatory: &[],
        variants: ECC_COUNT_VARIANTS,
        tag: SensorTag::None,
    },
    FuncDepends {
        name: "rsmi_counter_available_counters_get",
        mandatory: &[],
        variants: COUNTER_VARIANTS,
        tag: SensorTag::None,
    },
];

// ===============================================================================================
// Monitor (hwmon) table
// ===============================================================================================

const TEMP_METRIC_VARIANTS: &[(u64, &str)] = &[
    (0, "temp#_input"),
    (1, "temp#_max"),
    (2, "temp#_min"),
    (3, "temp#_max_hyst"),
    (4, "temp#_min_hyst"),
    (5, "temp#_crit"),
    (6, "temp#_crit_hyst"),
    (7, "temp#_emergency"),
    (8, "temp#_emergency_hyst"),
    (9, "temp#_lcrit"),
    (10, "temp#_lcrit_hyst"),
    (11, "temp#_offset"),
    (12, "temp#_lowest"),
    (13, "temp#_highest"),
];

const VOLT_METRIC_VARIANTS: &[(u64, &str)] = &[
    (0, "in#_input"),
    (1, "in#_max"),
    (2, "in#_lcrit"),
    (3, "in#_min"),
    (4, "in#_crit"),
    (5, "in#_average"),
    (6, "in#_lowest"),
    (7, "in#_highest"),
];

pub const MONITOR_FUNCS: &[FuncDepends] = &[
    dep("rsmi_dev_power_ave_get", &["power#_average"]),
    dep("rsmi_dev_power_cap_get", &["power#_cap"]),
    dep(
        "rsmi_dev_power_cap_range_get",
        &["power#_cap_max", "power#_cap_min"],
    ),
    dep("rsmi_dev_power_cap_set", &["power#_cap_max", "power#_cap_min"]),
    dep("rsmi_dev_fan_rpms_get", &["fan#_input"]),
    dep("rsmi_dev_fan_speed_get", &["pwm#"]),
    dep("rsmi_dev_fan_speed_max_get", &["pwm#_max"]),
    dep("rsmi_dev_fan_reset", &["pwm#_enable"]),
    dep("rsmi_dev_fan_speed_set", &["pwm#_max", "pwm#_enable", "pwm#"]),
    FuncDepends {
        name: "rsmi_dev_temp_metric_get",
        mandatory: &["temp#_label"],
        variants: TEMP_METRIC_VARIANTS,
        tag: SensorTag::Temperature,
    },
    FuncDepends {
        name: "rsmi_dev_volt_metric_get",
        mandatory: &["in#_label"],
        variants: VOLT_METRIC_VARIANTS,
        tag: SensorTag::Voltage,
    },
];

// ===============================================================================================
// File sets
// ===============================================================================================

/// The relative file names present under one directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSet {
    names: BTreeSet<String>,
}

impl FileSet {
    #[must_use]
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Lists `root` plus the given subdirectories, recording entries as `sub/name`.
    #[must_use]
    pub fn scan(root: &Path, subdirs: &[&str]) -> Self {
        let mut names: BTreeSet<String> = sysfs::list_names(root).into_iter().collect();
        for sub in subdirs {
            names.extend(
                sysfs::list_names(&root.join(sub))
                    .into_iter()
                    .map(|n| format!("{sub}/{n}")),
            );
        }
        Self { names }
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Sensor indices `N` for which `pattern` with `#` replaced by `N` is present.
    #[must_use]
    pub fn indices(&self, pattern: &str) -> BTreeSet<u32> {
        let regex_src = pattern
            .split('#')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(r"(\d+)");
        let Ok(re) = Regex::new(&format!("^{regex_src}$")) else {
            return BTreeSet::new();
        };
        self.names
            .iter()
            .filter_map(|n| re.captures(n))
            .filter_map(|c| c.get(1).and_then(|m| m.as_str().parse().ok()))
            .collect()
    }
}

fn is_indexed(file: &str) -> bool {
    file.contains('#')
}

fn encode(indices: &BTreeSet<u32>, tag: SensorTag, tag_of: &dyn Fn(SensorTag, u32) -> u64) -> SubvariantList {
    indices
        .iter()
        .map(|&i| (tag_of(tag, i) << MONITOR_TYPE_BIT_POSITION) | u64::from(i))
        .collect()
}

/// Evaluates `table` against `files`.
///
/// `tag_of` maps a sensor index to its semantic type for tagged rows (temperature and voltage
/// sensors); it is not consulted for untagged rows.
#[must_use]
pub fn derive_supported(
    table: &[FuncDepends],
    files: &FileSet,
    tag_of: &dyn Fn(SensorTag, u32) -> u64,
) -> SupportedFuncMap {
    let mut map = SupportedFuncMap::new();
    let tag_for = |tag: SensorTag, i: u32| if tag == SensorTag::None { 0 } else { tag_of(tag, i) };

    'funcs: for func in table {
        let mut indices: Option<BTreeSet<u32>> = None;
        for file in func.mandatory {
            if is_indexed(file) {
                let found = files.indices(file);
                indices = Some(match indices {
                    None => found,
                    Some(acc) => acc.intersection(&found).copied().collect(),
                });
            } else if !files.contains(file) {
                continue 'funcs;
            }
        }
        if indices.as_ref().is_some_and(BTreeSet::is_empty) {
            continue;
        }

        if func.variants.is_empty() {
            let entry = indices.map(|set| {
                VariantMap::from([(DEFAULT_VARIANT, Some(encode(&set, func.tag, &tag_for)))])
            });
            map.insert(func.name, entry);
            continue;
        }

        let mut variants = VariantMap::new();
        for &(variant, file) in func.variants {
            if is_indexed(file) {
                let found = files.indices(file);
                let set: BTreeSet<u32> = match &indices {
                    None => found,
                    Some(acc) => acc.intersection(&found).copied().collect(),
                };
                if !set.is_empty() {
                    variants.insert(variant, Some(encode(&set, func.tag, &tag_for)));
                }
            } else if files.contains(file) {
                variants.insert(
                    variant,
                    indices.as_ref().map(|set| encode(set, func.tag, &tag_for)),
                );
            }
        }
        if !variants.is_empty() {
            map.insert(func.name, Some(variants));
        }
    }
    map
}

/// Whether `(name, variant, subvariant)` is backed by the capability table.
///
/// Subvariants match on the sensor index only; the semantic tag bits are ignored.
#[must_use]
pub fn is_supported(map: &SupportedFuncMap, name: &str, variant: u64, sub: u64) -> bool {
    check_support(map, name, variant, sub).is_ok()
}

/// `NotSupported` if `name` is absent, `InvalidArgs` if the combination is not stored.
///
/// # Errors
/// See above.
pub fn check_support(
    map: &SupportedFuncMap,
    name: &str,
    variant: u64,
    sub: u64,
) -> Result<(), Status> {
    let Some(entry) = map.get(name) else {
        return Err(Status::NotSupported);
    };

    let sub_matches = |subs: &Option<SubvariantList>| {
        sub == DEFAULT_VARIANT
            || subs
                .as_ref()
                .is_some_and(|s| s.iter().any(|x| x & MONITOR_IND_BIT_MASK == sub))
    };

    let ok = if variant == DEFAULT_VARIANT {
        sub == DEFAULT_VARIANT
            || entry
                .as_ref()
                .and_then(|v| v.get(&DEFAULT_VARIANT))
                .is_some_and(sub_matches)
    } else {
        entry
            .as_ref()
            .and_then(|v| v.get(&variant))
            .is_some_and(sub_matches)
    };

    if ok { Ok(()) } else { Err(Status::InvalidArgs) }
}

/// Folds `other` into `into`; entries already present win.
pub fn merge(into: &mut SupportedFuncMap, other: SupportedFuncMap) {
    for (name, entry) in other {
        into.entry(name).or_insert(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_tags(_: SensorTag, _: u32) -> u64 {
        0
    }

    #[test]
    fn device_rows_need_every_mandatory_file() {
        let files = FileSet::from_names(["vendor", "device", "mem_info_vram_total", "pp_dpm_sclk"]);
        let map = derive_supported(DEVICE_FUNCS, &files, &no_tags);

        assert_eq!(map.get("rsmi_dev_name_get"), Some(&None));
        assert!(!map.contains_key("rsmi_dev_subsystem_name_get"));
        assert_eq!(map.get("rsmi_dev_pci_id_get"), Some(&None));

        let mem = map["rsmi_dev_memory_total_get"].as_ref().unwrap();
        assert_eq!(mem.keys().copied().collect::<Vec<_>>(), vec![MemoryType::Vram as u64]);
        assert_eq!(mem[&(MemoryType::Vram as u64)], None);

        assert!(map.contains_key("rsmi_dev_gpu_clk_freq_get"));
        assert!(!map.contains_key("rsmi_dev_gpu_clk_freq_set"));
        assert!(!map.contains_key("rsmi_dev_memory_usage_get"));
    }

    #[test]
    fn nested_paths_are_matched() {
        let files = FileSet::from_names(["ras/umc_err_count", "fw_version/vcn_fw_version"]);
        let map = derive_supported(DEVICE_FUNCS, &files, &no_tags);
        let ecc = map["rsmi_dev_ecc_count_get"].as_ref().unwrap();
        assert!(ecc.contains_key(&gpu_block::UMC));
        let fw = map["rsmi_dev_firmware_version_get"].as_ref().unwrap();
        assert_eq!(fw.keys().copied().collect::<Vec<_>>(), vec![20]);
    }

    #[test]
    fn sensor_indices_are_intersected() {
        let files = FileSet::from_names([
            "pwm1", "pwm1_max", "pwm1_enable", "pwm2", "pwm2_max", "fan1_input", "power1_cap",
            "power1_cap_max",
        ]);
        let map = derive_supported(MONITOR_FUNCS, &files, &no_tags);

        let speed = map["rsmi_dev_fan_speed_get"].as_ref().unwrap();
        assert_eq!(speed[&DEFAULT_VARIANT], Some(vec![1, 2]));
        let set = map["rsmi_dev_fan_speed_set"].as_ref().unwrap();
        assert_eq!(set[&DEFAULT_VARIANT], Some(vec![1]));
        assert!(!map.contains_key("rsmi_dev_power_cap_range_get"));
        assert!(map.contains_key("rsmi_dev_power_cap_get"));
    }

    #[test]
    fn temperature_subvariants_carry_label_tag() {
        let files = FileSet::from_names([
            "temp1_input", "temp1_label", "temp1_crit", "temp2_input", "temp2_label",
            "temp3_input",
        ]);
        let tag_of = |tag: SensorTag, i: u32| match (tag, i) {
            (SensorTag::Temperature, 2) => 1,
            _ => 0,
        };
        let map = derive_supported(MONITOR_FUNCS, &files, &tag_of);
        let temp = map["rsmi_dev_temp_metric_get"].as_ref().unwrap();

        assert_eq!(temp[&0], Some(vec![1, (1 << 16) | 2]));
        assert_eq!(temp[&5], Some(vec![1]));
        assert!(!temp.contains_key(&1));

        assert!(is_supported(&map, "rsmi_dev_temp_metric_get", 0, 2));
        assert!(!is_supported(&map, "rsmi_dev_temp_metric_get", 0, 3));
    }

    #[test]
    fn derivation_is_idempotent() {
        let files = FileSet::from_names(["temp1_input", "temp1_label", "pwm1", "in0_label", "in0_input"]);
        let a = derive_supported(MONITOR_FUNCS, &files, &no_tags);
        let b = derive_supported(MONITOR_FUNCS, &files, &no_tags);
        assert_eq!(a, b);
        assert!(a.contains_key("rsmi_dev_volt_metric_get"));
    }

    #[test]
    fn support_checks_distinguish_missing_from_mismatched() {
        let files = FileSet::from_names(["pwm1", "mem_info_gtt_total", "vendor"]);
        let mut map = derive_supported(DEVICE_FUNCS, &files, &no_tags);
        merge(&mut map, derive_supported(MONITOR_FUNCS, &files, &no_tags));

        assert_eq!(
            check_support(&map, "rsmi_dev_busy_percent_get", DEFAULT_VARIANT, DEFAULT_VARIANT),
            Err(Status::NotSupported)
        );
        assert_eq!(
            check_support(&map, "rsmi_dev_vendor_id_get", DEFAULT_VARIANT, DEFAULT_VARIANT),
            Ok(())
        );
        assert_eq!(
            check_support(&map, "rsmi_dev_vendor_id_get", DEFAULT_VARIANT, 1),
            Err(Status::InvalidArgs)
        );
        assert_eq!(
            check_support(&map, "rsmi_dev_memory_total_get", MemoryType::Gtt as u64, DEFAULT_VARIANT),
            Ok(())
        );
        assert_eq!(
            check_support(&map, "rsmi_dev_memory_total_get", MemoryType::Vram as u64, DEFAULT_VARIANT),
            Err(Status::InvalidArgs)
        );
        assert_eq!(
            check_support(&map, "rsmi_dev_fan_speed_get", DEFAULT_VARIANT, 1),
            Ok(())
        );
        assert_eq!(
            check_support(&map, "rsmi_dev_fan_speed_get", DEFAULT_VARIANT, 2),
            Err(Status::InvalidArgs)
        );
    }

    #[test]
    fn index_patterns() {
        let files = FileSet::from_names(["temp1_input", "temp10_input", "temp_input", "temp2_inputx"]);
        assert_eq!(
            files.indices("temp#_input").into_iter().collect::<Vec<_>>(),
            vec![1, 10]
        );
    }
}
