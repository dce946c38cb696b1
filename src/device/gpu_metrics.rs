//! `gpu_metrics` blob decoding.
//!
//! The driver exposes one binary table per device. Its 4-byte header names the layout; the
//! layouts handled here are format 1 content 1..=3, decoded little-endian with C alignment and
//! folded into one canonical [`GpuMetrics`] record.

use crate::error::{RsmiError, RsmiResult, Status};
use std::time::{Duration, Instant};

pub const HEADER_SIZE: usize = 4;
pub const MAX_NUM_HBM_INSTANCES: usize = 4;
/// Cached headers older than this are re-read.
pub const EXPIRATION: Duration = Duration::from_secs(5);
/// Upper bound on a blob read.
pub const MAX_BLOB_SIZE: usize = 4096;

const V11_SIZE: usize = 96;
const V12_SIZE: usize = 104;
const V13_SIZE: usize = 120;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsHeader {
    pub structure_size: u16,
    pub format_revision: u8,
    pub content_revision: u8,
}

impl MetricsHeader {
    /// # Errors
    /// `UnexpectedSize` if fewer than four bytes are available.
    pub fn parse(blob: &[u8]) -> RsmiResult<Self> {
        let r = Reader::new(blob);
        Ok(Self {
            structure_size: r.u16_at(0)?,
            format_revision: r.u8_at(2)?,
            content_revision: r.u8_at(3)?,
        })
    }

    #[must_use]
    pub const fn version(self) -> (u8, u8) {
        (self.format_revision, self.content_revision)
    }
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn bytes<const N: usize>(&self, off: usize) -> RsmiResult<[u8; N]> {
        self.buf
            .get(off..off + N)
            .and_then(|s| s.try_into().ok())
            .ok_or(RsmiError::Status(Status::UnexpectedSize))
    }

    fn u8_at(&self, off: usize) -> RsmiResult<u8> {
        Ok(self.bytes::<1>(off)?[0])
    }

    fn u16_at(&self, off: usize) -> RsmiResult<u16> {
        self.bytes(off).map(u16::from_le_bytes)
    }

    fn u32_at(&self, off: usize) -> RsmiResult<u32> {
        self.bytes(off).map(u32::from_le_bytes)
    }

    fn u64_at(&self, off: usize) -> RsmiResult<u64> {
        self.bytes(off).map(u64::from_le_bytes)
    }

    fn u16_array<const N: usize>(&self, off: usize) -> RsmiResult<[u16; N]> {
        let mut out = [0u16; N];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.u16_at(off + 2 * i)?;
        }
        Ok(out)
    }
}

/// Fields shared by every format-1 layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsV11 {
    pub header: MetricsHeader,
    pub temperature_edge: u16,
    pub temperature_hotspot: u16,
    pub temperature_mem: u16,
    pub temperature_vrgfx: u16,
    pub temperature_vrsoc: u16,
    pub temperature_vrmem: u16,
    pub average_gfx_activity: u16,
    pub average_umc_activity: u16,
    pub average_mm_activity: u16,
    pub average_socket_power: u16,
    pub energy_accumulator: u64,
    pub system_clock_counter: u64,
    /// gfx, soc, uclk, vclk0, dclk0, vclk1, dclk1.
    pub average_clocks: [u16; 7],
    pub current_clocks: [u16; 7],
    pub throttle_status: u32,
    pub current_fan_speed: u16,
    pub pcie_link_width: u16,
    /// In 0.1 GT/s.
    pub pcie_link_speed: u16,
    pub gfx_activity_acc: u32,
    pub mem_activity_acc: u32,
    pub temperature_hbm: [u16; MAX_NUM_HBM_INSTANCES],
}

impl MetricsV11 {
    fn decode(header: MetricsHeader, r: &Reader<'_>) -> RsmiResult<Self> {
        let temps: [u16; 6] = r.u16_array(4)?;
        Ok(Self {
            header,
            temperature_edge: temps[0],
            temperature_hotspot: temps[1],
            temperature_mem: temps[2],
            temperature_vrgfx: temps[3],
            temperature_vrsoc: temps[4],
            temperature_vrmem: temps[5],
            average_gfx_activity: r.u16_at(16)?,
            average_umc_activity: r.u16_at(18)?,
            average_mm_activity: r.u16_at(20)?,
            average_socket_power: r.u16_at(22)?,
            energy_accumulator: r.u64_at(24)?,
            system_clock_counter: r.u64_at(32)?,
            average_clocks: r.u16_array(40)?,
            current_clocks: r.u16_array(54)?,
            throttle_status: r.u32_at(68)?,
            current_fan_speed: r.u16_at(72)?,
            pcie_link_width: r.u16_at(74)?,
            pcie_link_speed: r.u16_at(76)?,
            gfx_activity_acc: r.u32_at(80)?,
            mem_activity_acc: r.u32_at(84)?,
            temperature_hbm: r.u16_array(88)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsV12 {
    pub base: MetricsV11,
    pub firmware_timestamp: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsV13 {
    pub base: MetricsV12,
    pub voltage_soc: u16,
    pub voltage_gfx: u16,
    pub voltage_mem: u16,
    pub indep_throttle_status: u64,
}

/// A decoded table in the layout the driver reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricsRecord {
    V11(MetricsV11),
    V12(MetricsV12),
    V13(MetricsV13),
}

impl MetricsRecord {
    /// # Errors
    /// `NotSupported` for unknown layouts, `UnexpectedSize` for a truncated blob.
    pub fn decode(blob: &[u8]) -> RsmiResult<Self> {
        let header = MetricsHeader::parse(blob)?;
        let r = Reader::new(blob);
        let min_size = match header.version() {
            (1, 1) => V11_SIZE,
            (1, 2) => V12_SIZE,
            (1, 3) => V13_SIZE,
            _ => return Err(Status::NotSupported.into()),
        };
        if blob.len() < min_size {
            return Err(Status::UnexpectedSize.into());
        }

        let v11 = MetricsV11::decode(header, &r)?;
        if header.content_revision == 1 {
            return Ok(Self::V11(v11));
        }
        let v12 = MetricsV12 {
            base: v11,
            firmware_timestamp: r.u64_at(96)?,
        };
        if header.content_revision == 2 {
            return Ok(Self::V12(v12));
        }
        Ok(Self::V13(MetricsV13 {
            base: v12,
            voltage_soc: r.u16_at(104)?,
            voltage_gfx: r.u16_at(106)?,
            voltage_mem: r.u16_at(108)?,
            indep_throttle_status: r.u64_at(112)?,
        }))
    }

    #[must_use]
    pub fn header(&self) -> MetricsHeader {
        match self {
            Self::V11(m) => m.header,
            Self::V12(m) => m.base.header,
            Self::V13(m) => m.base.base.header,
        }
    }
}

/// The canonical record handed to callers (`rsmi_gpu_metrics_t`).
///
/// Fields a layout does not carry are zero.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GpuMetrics {
    pub common_header: MetricsHeader,
    pub temperature_edge: u16,
    pub temperature_hotspot: u16,
    pub temperature_mem: u16,
    pub temperature_vrgfx: u16,
    pub temperature_vrsoc: u16,
    pub temperature_vrmem: u16,
    pub average_gfx_activity: u16,
    pub average_umc_activity: u16,
    pub average_mm_activity: u16,
    pub average_socket_power: u16,
    pub energy_accumulator: u64,
    pub system_clock_counter: u64,
    pub average_gfxclk_frequency: u16,
    pub average_socclk_frequency: u16,
    pub average_uclk_frequency: u16,
    pub average_vclk0_frequency: u16,
    pub average_dclk0_frequency: u16,
    pub average_vclk1_frequency: u16,
    pub average_dclk1_frequency: u16,
    pub current_gfxclk: u16,
    pub current_socclk: u16,
    pub current_uclk: u16,
    pub current_vclk0: u16,
    pub current_dclk0: u16,
    pub current_vclk1: u16,
    pub current_dclk1: u16,
    pub throttle_status: u32,
    pub current_fan_speed: u16,
    pub pcie_link_width: u16,
    pub pcie_link_speed: u16,
    pub padding: u16,
    pub gfx_activity_acc: u32,
    pub mem_activity_acc: u32,
    pub temperature_hbm: [u16; MAX_NUM_HBM_INSTANCES],
    pub firmware_timestamp: u64,
    pub voltage_soc: u16,
    pub voltage_gfx: u16,
    pub voltage_mem: u16,
    pub padding1: u16,
    pub indep_throttle_status: u64,
}

impl From<&MetricsV11> for GpuMetrics {
    fn from(m: &MetricsV11) -> Self {
        let [agfx, asoc, auclk, avclk0, adclk0, avclk1, adclk1] = m.average_clocks;
        let [cgfx, csoc, cuclk, cvclk0, cdclk0, cvclk1, cdclk1] = m.current_clocks;
        Self {
            common_header: m.header,
            temperature_edge: m.temperature_edge,
            temperature_hotspot: m.temperature_hotspot,
            temperature_mem: m.temperature_mem,
            temperature_vrgfx: m.temperature_vrgfx,
            temperature_vrsoc: m.temperature_vrsoc,
            temperature_vrmem: m.temperature_vrmem,
            average_gfx_activity: m.average_gfx_activity,
            average_umc_activity: m.average_umc_activity,
            average_mm_activity: m.average_mm_activity,
            average_socket_power: m.average_socket_power,
            energy_accumulator: m.energy_accumulator,
            system_clock_counter: m.system_clock_counter,
            average_gfxclk_frequency: agfx,
            average_socclk_frequency: asoc,
            average_uclk_frequency: auclk,
            average_vclk0_frequency: avclk0,
            average_dclk0_frequency: adclk0,
            average_vclk1_frequency: avclk1,
            average_dclk1_frequency: adclk1,
            current_gfxclk: cgfx,
            current_socclk: csoc,
            current_uclk: cuclk,
            current_vclk0: cvclk0,
            current_dclk0: cdclk0,
            current_vclk1: cvclk1,
            current_dclk1: cdclk1,
            throttle_status: m.throttle_status,
            current_fan_speed: m.current_fan_speed,
            pcie_link_width: m.pcie_link_width,
            pcie_link_speed: m.pcie_link_speed,
            gfx_activity_acc: m.gfx_activity_acc,
            mem_activity_acc: m.mem_activity_acc,
            temperature_hbm: m.temperature_hbm,
            ..Self::default()
        }
    }
}

impl From<&MetricsRecord> for GpuMetrics {
    fn from(record: &MetricsRecord) -> Self {
        match record {
            MetricsRecord::V11(m) => Self::from(m),
            MetricsRecord::V12(m) => Self {
                firmware_timestamp: m.firmware_timestamp,
                ..Self::from(&m.base)
            },
            MetricsRecord::V13(m) => Self {
                firmware_timestamp: m.base.firmware_timestamp,
                voltage_soc: m.voltage_soc,
                voltage_gfx: m.voltage_gfx,
                voltage_mem: m.voltage_mem,
                indep_throttle_status: m.indep_throttle_status,
                ..Self::from(&m.base.base)
            },
        }
    }
}

/// Per-device header cache.
#[derive(Debug, Default)]
pub struct HeaderCache {
    entry: Option<(MetricsHeader, Instant)>,
}

impl HeaderCache {
    /// Returns the cached header, calling `read` when it is missing or stale.
    ///
    /// # Errors
    /// Propagates failures of `read` and of header parsing.
    pub fn get_or_refresh<F>(&mut self, now: Instant, read: F) -> RsmiResult<MetricsHeader>
    where
        F: FnOnce() -> RsmiResult<Vec<u8>>,
    {
        if let Some((header, at)) = self.entry
            && now.saturating_duration_since(at) < EXPIRATION
        {
            return Ok(header);
        }
        let header = MetricsHeader::parse(&read()?)?;
        self.entry = Some((header, now));
        Ok(header)
    }

    pub fn invalidate(&mut self) {
        self.entry = None;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_blob(content_rev: u8) -> Vec<u8> {
        let size = match content_rev {
            1 => V11_SIZE,
            2 => V12_SIZE,
            _ => V13_SIZE,
        };
        let mut blob = vec![0u8; size];
        blob[0..2].copy_from_slice(&u16::try_from(size).unwrap().to_le_bytes());
        blob[2] = 1;
        blob[3] = content_rev;
        blob[4..6].copy_from_slice(&45u16.to_le_bytes());
        blob[22..24].copy_from_slice(&120u16.to_le_bytes());
        blob[24..32].copy_from_slice(&0xDEAD_BEEFu64.to_le_bytes());
        blob[40..42].copy_from_slice(&1500u16.to_le_bytes());
        blob[66..68].copy_from_slice(&800u16.to_le_bytes());
        blob[68..72].copy_from_slice(&0x11u32.to_le_bytes());
        blob[94..96].copy_from_slice(&70u16.to_le_bytes());
        if content_rev >= 2 {
            blob[96..104].copy_from_slice(&42u64.to_le_bytes());
        }
        if content_rev >= 3 {
            blob[106..108].copy_from_slice(&900u16.to_le_bytes());
            blob[112..120].copy_from_slice(&7u64.to_le_bytes());
        }
        blob
    }

    #[test]
    fn decodes_v11() {
        let record = MetricsRecord::decode(&sample_blob(1)).unwrap();
        assert!(matches!(record, MetricsRecord::V11(_)));
        let m = GpuMetrics::from(&record);
        assert_eq!(m.common_header.version(), (1, 1));
        assert_eq!(m.temperature_edge, 45);
        assert_eq!(m.average_socket_power, 120);
        assert_eq!(m.energy_accumulator, 0xDEAD_BEEF);
        assert_eq!(m.average_gfxclk_frequency, 1500);
        assert_eq!(m.current_dclk1, 800);
        assert_eq!(m.throttle_status, 0x11);
        assert_eq!(m.temperature_hbm[3], 70);
        assert_eq!(m.firmware_timestamp, 0);
    }

    #[test]
    fn later_revisions_extend_the_record() {
        let m = GpuMetrics::from(&MetricsRecord::decode(&sample_blob(2)).unwrap());
        assert_eq!(m.firmware_timestamp, 42);
        assert_eq!(m.voltage_gfx, 0);

        let record = MetricsRecord::decode(&sample_blob(3)).unwrap();
        assert_eq!(record.header().structure_size, 120);
        let m = GpuMetrics::from(&record);
        assert_eq!(m.firmware_timestamp, 42);
        assert_eq!(m.voltage_gfx, 900);
        assert_eq!(m.indep_throttle_status, 7);
        assert_eq!(m.temperature_edge, 45);
    }

    #[test]
    fn rejects_unknown_and_truncated_tables() {
        let mut blob = sample_blob(1);
        blob[3] = 9;
        assert_eq!(
            MetricsRecord::decode(&blob).unwrap_err().status(),
            Status::NotSupported
        );
        let blob = sample_blob(3);
        assert_eq!(
            MetricsRecord::decode(&blob[..100]).unwrap_err().status(),
            Status::UnexpectedSize
        );
        assert_eq!(
            MetricsHeader::parse(&[1, 0]).unwrap_err().status(),
            Status::UnexpectedSize
        );
    }

    #[test]
    fn header_cache_expires() {
        let mut cache = HeaderCache::default();
        let start = Instant::now();
        let mut reads = 0;
        for offset in [0, 1, 4] {
            cache
                .get_or_refresh(start + Duration::from_secs(offset), || {
                    reads += 1;
                    Ok(sample_blob(1))
                })
                .unwrap();
        }
        assert_eq!(reads, 1);
        cache
            .get_or_refresh(start + Duration::from_secs(6), || {
                reads += 1;
                Ok(sample_blob(2))
            })
            .unwrap();
        assert_eq!(reads, 2);
    }
}
