//! Device attribute catalogue: which file backs each attribute and how it is parsed.

/// How an attribute's content is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadKind {
    Hex,
    Decimal,
    MultiLine,
    Token,
    Binary,
}

macro_rules! dev_attrs {
    ($($variant:ident => $file:literal, $kind:ident;)*) => {
        /// A sysfs attribute under `<card>/device/`.
        ///
        /// The discriminant is the id matched by `RSMI_DEBUG_ENUM_OVERRIDE`.
        #[repr(u32)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum DevAttr {
            $($variant,)*
        }

        impl DevAttr {
            pub const ALL: &'static [Self] = &[$(Self::$variant,)*];

            /// Path relative to `<card>/device/`.
            #[must_use]
            pub const fn file_name(self) -> &'static str {
                match self {
                    $(Self::$variant => $file,)*
                }
            }

            #[must_use]
            pub const fn read_kind(self) -> ReadKind {
                match self {
                    $(Self::$variant => ReadKind::$kind,)*
                }
            }
        }
    };
}

dev_attrs! {
    PerfLevel => "power_dpm_force_performance_level", Token;
    OverDriveLevel => "pp_sclk_od", Decimal;
    DevId => "device", Hex;
    VendorId => "vendor", Hex;
    SubSysDevId => "subsystem_device", Hex;
    SubSysVendorId => "subsystem_vendor", Hex;
    GpuMClk => "pp_dpm_mclk", MultiLine;
    GpuSClk => "pp_dpm_sclk", MultiLine;
    DcefClk => "pp_dpm_dcefclk", MultiLine;
    FClk => "pp_dpm_fclk", MultiLine;
    SocClk => "pp_dpm_socclk", MultiLine;
    PcieClk => "pp_dpm_pcie", MultiLine;
    PowerProfileMode => "pp_power_profile_mode", MultiLine;
    Usage => "gpu_busy_percent", Decimal;
    PowerOdVoltage => "pp_od_clk_voltage", MultiLine;
    VBiosVer => "vbios_version", Token;
    PcieThroughput => "pcie_bw", Token;
    ErrCntSdma => "ras/sdma_err_count", MultiLine;
    ErrCntUmc => "ras/umc_err_count", MultiLine;
    ErrCntGfx => "ras/gfx_err_count", MultiLine;
    ErrCntFeatures => "ras/features", Hex;
    MemTotGtt => "mem_info_gtt_total", Decimal;
    MemTotVisVram => "mem_info_vis_vram_total", Decimal;
    MemTotVram => "mem_info_vram_total", Decimal;
    MemUsedGtt => "mem_info_gtt_used", Decimal;
    MemUsedVisVram => "mem_info_vis_vram_used", Decimal;
    MemUsedVram => "mem_info_vram_used", Decimal;
    VramVendor => "mem_info_vram_vendor", Token;
    PcieReplayCount => "pcie_replay_count", Decimal;
    UniqueId => "unique_id", Hex;
    DfCountersAvailable => "df_cntr_avail", Decimal;
    MemBusyPercent => "mem_busy_percent", Decimal;
    XgmiError => "xgmi_error", Decimal;
    FwVersionAsd => "fw_version/asd_fw_version", Hex;
    FwVersionCe => "fw_version/ce_fw_version", Hex;
    FwVersionDmcu => "fw_version/dmcu_fw_version", Hex;
    FwVersionMc => "fw_version/mc_fw_version", Hex;
    FwVersionMe => "fw_version/me_fw_version", Hex;
    FwVersionMec => "fw_version/mec_fw_version", Hex;
    FwVersionMec2 => "fw_version/mec2_fw_version", Hex;
    FwVersionPfp => "fw_version/pfp_fw_version", Hex;
    FwVersionRlc => "fw_version/rlc_fw_version", Hex;
    FwVersionRlcSrlc => "fw_version/rlc_srlc_fw_version", Hex;
    FwVersionRlcSrlg => "fw_version/rlc_srlg_fw_version", Hex;
    FwVersionRlcSrls => "fw_version/rlc_srls_fw_version", Hex;
    FwVersionSdma => "fw_version/sdma_fw_version", Hex;
    FwVersionSdma2 => "fw_version/sdma2_fw_version", Hex;
    FwVersionSmc => "fw_version/smc_fw_version", Hex;
    FwVersionSos => "fw_version/sos_fw_version", Hex;
    FwVersionTaRas => "fw_version/ta_ras_fw_version", Hex;
    FwVersionTaXgmi => "fw_version/ta_xgmi_fw_version", Hex;
    FwVersionUvd => "fw_version/uvd_fw_version", Hex;
    FwVersionVce => "fw_version/vce_fw_version", Hex;
    FwVersionVcn => "fw_version/vcn_fw_version", Hex;
    SerialNumber => "serial_number", Token;
    MemPageBad => "ras/gpu_vram_bad_pages", MultiLine;
    NumaNode => "numa_node", Decimal;
    GpuMetrics => "gpu_metrics", Binary;
    ComputePartition => "current_compute_partition", Token;
    MemoryPartition => "current_memory_partition", Token;
}

impl DevAttr {
    #[must_use]
    pub const fn id(self) -> u32 {
        self as u32
    }

    /// Attributes that may also be read as a first-token string.
    #[must_use]
    pub const fn readable_as_token(self) -> bool {
        matches!(
            self,
            Self::PerfLevel
                | Self::Usage
                | Self::OverDriveLevel
                | Self::DevId
                | Self::SubSysDevId
                | Self::SubSysVendorId
                | Self::VendorId
                | Self::VramVendor
                | Self::VBiosVer
                | Self::PcieThroughput
                | Self::SerialNumber
        )
    }

    /// Attributes accepting a numeric write.
    #[must_use]
    pub const fn writable_as_u64(self) -> bool {
        matches!(
            self,
            Self::OverDriveLevel | Self::PowerProfileMode | Self::PerfLevel
        )
    }

    /// Attributes accepting a raw string write.
    #[must_use]
    pub const fn writable_as_str(self) -> bool {
        matches!(
            self,
            Self::GpuMClk
                | Self::DcefClk
                | Self::FClk
                | Self::GpuSClk
                | Self::PcieClk
                | Self::PowerOdVoltage
                | Self::SocClk
        )
    }
}

// ===============================================================================================
// Performance levels
// ===============================================================================================

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerfLevel {
    Auto = 0,
    Low = 1,
    High = 2,
    Manual = 3,
    StableStd = 4,
    StablePeak = 5,
    StableMinMclk = 6,
    StableMinSclk = 7,
    Unknown = 0x100,
}

impl PerfLevel {
    const KNOWN: [Self; 8] = [
        Self::Auto,
        Self::Low,
        Self::High,
        Self::Manual,
        Self::StableStd,
        Self::StablePeak,
        Self::StableMinMclk,
        Self::StableMinSclk,
    ];

    /// Keyword accepted by `power_dpm_force_performance_level`.
    #[must_use]
    pub const fn keyword(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Low => "low",
            Self::High => "high",
            Self::Manual => "manual",
            Self::StableStd => "profile_standard",
            Self::StablePeak => "profile_peak",
            Self::StableMinMclk => "profile_min_mclk",
            Self::StableMinSclk => "profile_min_sclk",
            Self::Unknown => "unknown",
        }
    }

    #[must_use]
    pub fn from_keyword(s: &str) -> Self {
        Self::KNOWN
            .into_iter()
            .find(|l| l.keyword() == s)
            .unwrap_or(Self::Unknown)
    }

    #[must_use]
    pub fn from_raw(raw: u64) -> Option<Self> {
        Self::KNOWN.into_iter().find(|l| *l as u64 == raw)
    }
}

// ===============================================================================================
// Variant selectors
// ===============================================================================================

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockType {
    Sys = 0,
    Df = 1,
    Dcef = 2,
    Soc = 3,
    Mem = 4,
}

impl ClockType {
    pub const ALL: [Self; 5] = [Self::Sys, Self::Df, Self::Dcef, Self::Soc, Self::Mem];

    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Sys),
            1 => Some(Self::Df),
            2 => Some(Self::Dcef),
            3 => Some(Self::Soc),
            4 => Some(Self::Mem),
            _ => None,
        }
    }

    #[must_use]
    pub const fn attr(self) -> DevAttr {
        match self {
            Self::Sys => DevAttr::GpuSClk,
            Self::Df => DevAttr::FClk,
            Self::Dcef => DevAttr::DcefClk,
            Self::Soc => DevAttr::SocClk,
            Self::Mem => DevAttr::GpuMClk,
        }
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    Vram = 0,
    VisVram = 1,
    Gtt = 2,
}

impl MemoryType {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Vram),
            1 => Some(Self::VisVram),
            2 => Some(Self::Gtt),
            _ => None,
        }
    }

    #[must_use]
    pub const fn total_attr(self) -> DevAttr {
        match self {
            Self::Vram => DevAttr::MemTotVram,
            Self::VisVram => DevAttr::MemTotVisVram,
            Self::Gtt => DevAttr::MemTotGtt,
        }
    }

    #[must_use]
    pub const fn used_attr(self) -> DevAttr {
        match self {
            Self::Vram => DevAttr::MemUsedVram,
            Self::VisVram => DevAttr::MemUsedVisVram,
            Self::Gtt => DevAttr::MemUsedGtt,
        }
    }
}

/// Firmware blocks in `rsmi_fw_block_t` order.
pub const FW_BLOCKS: [DevAttr; 21] = [
    DevAttr::FwVersionAsd,
    DevAttr::FwVersionCe,
    DevAttr::FwVersionDmcu,
    DevAttr::FwVersionMc,
    DevAttr::FwVersionMe,
    DevAttr::FwVersionMec,
    DevAttr::FwVersionMec2,
    DevAttr::FwVersionPfp,
    DevAttr::FwVersionRlc,
    DevAttr::FwVersionRlcSrlc,
    DevAttr::FwVersionRlcSrlg,
    DevAttr::FwVersionRlcSrls,
    DevAttr::FwVersionSdma,
    DevAttr::FwVersionSdma2,
    DevAttr::FwVersionSmc,
    DevAttr::FwVersionSos,
    DevAttr::FwVersionTaRas,
    DevAttr::FwVersionTaXgmi,
    DevAttr::FwVersionUvd,
    DevAttr::FwVersionVce,
    DevAttr::FwVersionVcn,
];

/// RAS-capable GPU blocks (`rsmi_gpu_block_t`), a bitmask.
pub mod gpu_block {
    pub const UMC: u64 = 0x1;
    pub const SDMA: u64 = 0x2;
    pub const GFX: u64 = 0x4;
    pub const MMHUB: u64 = 0x8;
    pub const ATHUB: u64 = 0x10;
    pub const PCIE_BIF: u64 = 0x20;
    pub const HDP: u64 = 0x40;
    pub const XGMI_WAFL: u64 = 0x80;
    pub const DF: u64 = 0x100;
    pub const SMN: u64 = 0x200;
    pub const SEM: u64 = 0x400;
    pub const MP0: u64 = 0x800;
    pub const MP1: u64 = 0x1000;
    pub const FUSE: u64 = 0x2000;
}

/// The error-count file for a RAS block, where the driver has one.
#[must_use]
pub const fn ecc_count_attr(block: u64) -> Option<DevAttr> {
    match block {
        gpu_block::UMC => Some(DevAttr::ErrCntUmc),
        gpu_block::SDMA => Some(DevAttr::ErrCntSdma),
        gpu_block::GFX => Some(DevAttr::ErrCntGfx),
        _ => None,
    }
}
