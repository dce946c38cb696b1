//! Hardware event counters backed by `perf_event_open`.
//!
//! Each counter owns one perf descriptor, opened on first start. The event's `config` word is
//! assembled from the PMU's sysfs description: `events/<name>` assigns values to named fields
//! and `format/<field>` says where each field lives in the word.

use crate::error::{RsmiError, RsmiResult, Status};
use crate::sysfs;
use crate::utils::{io, parse_hex};
use std::collections::BTreeSet;
use std::io as stdio;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

// ===============================================================================================
// perf_event ABI
// ===============================================================================================

const PERF_SAMPLE_IDENTIFIER: u64 = 1 << 16;
const PERF_FORMAT_TOTAL_TIME_ENABLED: u64 = 1 << 0;
const PERF_FORMAT_TOTAL_TIME_RUNNING: u64 = 1 << 1;
const PERF_FLAG_FD_NO_GROUP: libc::c_ulong = 1 << 0;

const ATTR_FLAG_DISABLED: u64 = 1 << 0;
const ATTR_FLAG_INHERIT: u64 = 1 << 1;

const PERF_EVENT_IOC_ENABLE: u32 = io(b'$' as u32, 0);
const PERF_EVENT_IOC_DISABLE: u32 = io(b'$' as u32, 1);

/// `struct perf_event_attr` up to `PERF_ATTR_SIZE_VER0`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct PerfEventAttr {
    type_: u32,
    size: u32,
    config: u64,
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events: u32,
    bp_type: u32,
    config1: u64,
}

/// Layout produced by `read(2)` with the read format above.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RawSample {
    pub value: u64,
    pub time_enabled: u64,
    pub time_running: u64,
}

const RAW_SAMPLE_SIZE: usize = std::mem::size_of::<RawSample>();

/// Deltas larger than this are treated as a wrapped or reset counter.
pub const COUNTER_DELTA_LIMIT: u64 = 1 << 48;
const MAX_REREADS: usize = 3;

// ===============================================================================================
// Groups and events
// ===============================================================================================

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventGroup {
    Xgmi = 0,
    XgmiDataOut = 10,
}

impl EventGroup {
    pub const ALL: [Self; 2] = [Self::Xgmi, Self::XgmiDataOut];

    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Xgmi),
            10 => Some(Self::XgmiDataOut),
            _ => None,
        }
    }

    /// Event-source directory name, `#` standing for the card number.
    #[must_use]
    pub const fn dir_template(self) -> &'static str {
        match self {
            Self::Xgmi => "amdgpu_df_#",
            Self::XgmiDataOut => "amdgpu_#",
        }
    }

    #[must_use]
    pub fn dir_name(self, card_index: u32) -> String {
        self.dir_template().replace('#', &card_index.to_string())
    }

    const fn event_range(self) -> (u32, u32) {
        match self {
            Self::Xgmi => (0, 7),
            Self::XgmiDataOut => (10, 15),
        }
    }

    #[must_use]
    pub fn of_event(event: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|g| {
            let (first, last) = g.event_range();
            (first..=last).contains(&event)
        })
    }
}

const XGMI_EVENT_SUFFIXES: [&str; 4] = [
    "pcsout_txmeta",
    "ftiinstat_reqalloc",
    "ftiinstat_rspalloc",
    "pcsout_txdata",
];

/// The `events/` file describing `event`.
#[must_use]
pub fn event_file_name(event: u32) -> Option<String> {
    match EventGroup::of_event(event)? {
        EventGroup::Xgmi => Some(format!(
            "cake{}_{}",
            event / 4,
            XGMI_EVENT_SUFFIXES[(event % 4) as usize]
        )),
        EventGroup::XgmiDataOut => Some(format!("xgmi_link{}_data_outbound", event - 10)),
    }
}

/// Groups whose event-source directory exists for card `card_index`.
#[must_use]
pub fn supported_groups(event_root: &Path, card_index: u32) -> BTreeSet<u32> {
    EventGroup::ALL
        .into_iter()
        .filter(|g| event_root.join(g.dir_name(card_index)).is_dir())
        .map(|g| g as u32)
        .collect()
}

// ===============================================================================================
// Config assembly
// ===============================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldConfig {
    pub value: u64,
    pub start_bit: u8,
    pub field_size: u8,
}

/// Parses a `format/<field>` description such as `config:0-7`.
///
/// # Errors
/// `UnexpectedSize` for inverted or oversized ranges.
pub fn parse_format(content: &str) -> RsmiResult<(u8, u8)> {
    let malformed = || RsmiError::parse("perf format", format!("{content:?}"));
    let (_, range) = content.trim().split_once(':').ok_or_else(malformed)?;
    let (start, end) = match range.split_once('-') {
        Some((s, e)) => (s, e),
        None => (range, range),
    };
    let start: u32 = start.trim().parse().map_err(|_| malformed())?;
    let end: u32 = end.trim().parse().map_err(|_| malformed())?;

    if start > end || start > 0xFF || end > 0xFF || end - start + 1 > 0xFF {
        return Err(Status::UnexpectedSize.into());
    }
    let start_bit = u8::try_from(start).map_err(|_| RsmiError::Status(Status::UnexpectedSize))?;
    let size = u8::try_from(end - start + 1).map_err(|_| RsmiError::Status(Status::UnexpectedSize))?;
    Ok((start_bit, size))
}

/// Parses an `events/<name>` description such as `event=0x7,instance=0x46`.
pub fn parse_event_fields(content: &str) -> RsmiResult<Vec<(String, u64)>> {
    content
        .trim()
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|assignment| {
            let (name, value) = assignment.split_once('=').unwrap_or((assignment, "0x1"));
            let value = parse_hex(value).ok_or_else(|| {
                RsmiError::parse("perf event", format!("bad value in {assignment:?}"))
            })?;
            Ok((name.trim().to_string(), value))
        })
        .collect()
}

#[must_use]
pub fn assemble_config(fields: &[FieldConfig]) -> u64 {
    fields
        .iter()
        .fold(0, |acc, f| acc | (f.value << f.start_bit))
}

// ===============================================================================================
// Counter
// ===============================================================================================

/// A counter reading handed to callers (`rsmi_counter_value_t`).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CounterValue {
    pub value: u64,
    pub time_enabled: u64,
    pub time_running: u64,
}

#[derive(Debug)]
pub struct Counter {
    event: u32,
    dev_ind: u32,
    group_root: PathBuf,
    fd: Option<OwnedFd>,
    prev_value: u64,
}

impl Counter {
    /// A closed counter for `event` on the card numbered `card_index`.
    ///
    /// # Errors
    /// `InvalidArgs` for an event id outside every group.
    pub fn new(event_root: &Path, card_index: u32, dev_ind: u32, event: u32) -> RsmiResult<Self> {
        let group = EventGroup::of_event(event).ok_or(RsmiError::Status(Status::InvalidArgs))?;
        Ok(Self {
            event,
            dev_ind,
            group_root: event_root.join(group.dir_name(card_index)),
            fd: None,
            prev_value: 0,
        })
    }

    #[must_use]
    pub const fn event(&self) -> u32 {
        self.event
    }

    #[must_use]
    pub const fn dev_ind(&self) -> u32 {
        self.dev_ind
    }

    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    /// The PMU `type` and `config` words for this counter's event.
    pub fn perf_config(&self) -> RsmiResult<(u32, u64)> {
        let file = event_file_name(self.event).ok_or(RsmiError::Status(Status::InvalidArgs))?;
        let content = sysfs::read_all(&self.group_root.join("events").join(file))?;

        let mut fields = Vec::new();
        for (name, value) in parse_event_fields(&content)? {
            let format = sysfs::read_all(&self.group_root.join("format").join(&name))?;
            let (start_bit, field_size) = parse_format(&format)?;
            fields.push(FieldConfig {
                value,
                start_bit,
                field_size,
            });
        }

        let type_path = self.group_root.join("type");
        let pmu_type = sysfs::read_u64(&type_path)?;
        let pmu_type = u32::try_from(pmu_type)
            .map_err(|_| RsmiError::parse(&type_path, format!("pmu type {pmu_type} too large")))?;
        Ok((pmu_type, assemble_config(&fields)))
    }

    fn open(&mut self) -> RsmiResult<RawFd> {
        if let Some(fd) = &self.fd {
            return Ok(fd.as_raw_fd());
        }
        let (pmu_type, config) = self.perf_config()?;
        let attr = PerfEventAttr {
            type_: pmu_type,
            size: u32::try_from(std::mem::size_of::<PerfEventAttr>()).unwrap_or(64),
            config,
            sample_type: PERF_SAMPLE_IDENTIFIER,
            read_format: PERF_FORMAT_TOTAL_TIME_ENABLED | PERF_FORMAT_TOTAL_TIME_RUNNING,
            flags: ATTR_FLAG_DISABLED | ATTR_FLAG_INHERIT,
            ..PerfEventAttr::default()
        };

        // SAFETY: `attr` is a valid perf_event_attr for the size it declares.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_perf_event_open,
                &raw const attr,
                -1 as libc::pid_t,
                0 as libc::c_int,
                -1 as libc::c_int,
                PERF_FLAG_FD_NO_GROUP,
            )
        };
        if ret < 0 {
            return Err(stdio::Error::last_os_error().into());
        }
        let raw = RawFd::try_from(ret).map_err(|_| RsmiError::errno(libc::EBADF))?;
        // SAFETY: the kernel just returned this descriptor to us.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        debug!(event = self.event, dev_ind = self.dev_ind, pmu_type, config, "perf counter opened");
        self.fd = Some(fd);
        Ok(raw)
    }

    fn perf_ioctl(fd: RawFd, request: u32) -> RsmiResult<()> {
        // SAFETY: the enable/disable requests take no argument.
        let ret = unsafe { libc::ioctl(fd, request as _, 0) };
        if ret == -1 {
            return Err(stdio::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Opens the perf handle if needed and enables counting.
    pub fn start(&mut self) -> RsmiResult<()> {
        let fd = self.open()?;
        Self::perf_ioctl(fd, PERF_EVENT_IOC_ENABLE)
    }

    /// # Errors
    /// `EBADF` when the counter was never started.
    pub fn stop(&mut self) -> RsmiResult<()> {
        let fd = self.raw_fd()?;
        Self::perf_ioctl(fd, PERF_EVENT_IOC_DISABLE)
    }

    fn raw_fd(&self) -> RsmiResult<RawFd> {
        self.fd
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or_else(|| RsmiError::errno(libc::EBADF))
    }

    /// Counts accumulated since the previous read.
    ///
    /// # Errors
    /// `EBADF` before the first start, `EIO` on a short read.
    pub fn read(&mut self) -> RsmiResult<CounterValue> {
        let fd = self.raw_fd()?;
        self.sample_with(|| read_raw(fd))
    }

    /// Turns raw samples into a delta, re-sampling when the delta is implausible.
    pub fn sample_with<F>(&mut self, mut sample: F) -> RsmiResult<CounterValue>
    where
        F: FnMut() -> RsmiResult<RawSample>,
    {
        for _ in 0..MAX_REREADS {
            let raw = sample()?;
            let delta = raw.value.wrapping_sub(self.prev_value);
            self.prev_value = raw.value;
            if delta > COUNTER_DELTA_LIMIT {
                warn!(
                    event = self.event,
                    dev_ind = self.dev_ind,
                    raw = raw.value,
                    "discarding implausible counter delta"
                );
                continue;
            }
            trace!(event = self.event, delta, "counter read");
            return Ok(CounterValue {
                value: delta,
                time_enabled: raw.time_enabled,
                time_running: raw.time_running,
            });
        }
        Err(Status::UnexpectedData.into())
    }
}

/// Reads one sample, retrying on `EINTR`.
fn read_raw(fd: RawFd) -> RsmiResult<RawSample> {
    let mut buf = [0u8; RAW_SAMPLE_SIZE];
    let mut filled = 0;
    while filled < RAW_SAMPLE_SIZE {
        // SAFETY: the destination range lies within `buf`.
        let n = unsafe {
            libc::read(
                fd,
                buf[filled..].as_mut_ptr().cast(),
                RAW_SAMPLE_SIZE - filled,
            )
        };
        match n {
            0 => break,
            n if n < 0 => {
                let err = stdio::Error::last_os_error();
                if err.kind() == stdio::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }
            #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            n => filled += n as usize,
        }
    }
    if filled != RAW_SAMPLE_SIZE {
        return Err(RsmiError::errno(libc::EIO));
    }
    let word = |i: usize| {
        let mut w = [0u8; 8];
        w.copy_from_slice(&buf[i * 8..(i + 1) * 8]);
        u64::from_ne_bytes(w)
    };
    Ok(RawSample {
        value: word(0),
        time_enabled: word(1),
        time_running: word(2),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_group(root: &Path) -> PathBuf {
        let grp = root.join("amdgpu_df_1");
        fs::create_dir_all(grp.join("events")).unwrap();
        fs::create_dir_all(grp.join("format")).unwrap();
        fs::write(grp.join("type"), "23\n").unwrap();
        fs::write(grp.join("events/cake1_pcsout_txdata"), "event=0x7,instance=0x47,umask=0x3f\n")
            .unwrap();
        fs::write(grp.join("format/event"), "config:0-7\n").unwrap();
        fs::write(grp.join("format/instance"), "config:8-15\n").unwrap();
        fs::write(grp.join("format/umask"), "config:16-23\n").unwrap();
        grp
    }

    #[test]
    fn event_names_follow_groups() {
        assert_eq!(event_file_name(0).as_deref(), Some("cake0_pcsout_txmeta"));
        assert_eq!(event_file_name(5).as_deref(), Some("cake1_ftiinstat_reqalloc"));
        assert_eq!(event_file_name(7).as_deref(), Some("cake1_pcsout_txdata"));
        assert_eq!(event_file_name(12).as_deref(), Some("xgmi_link2_data_outbound"));
        assert_eq!(event_file_name(8), None);
        assert_eq!(EventGroup::of_event(15), Some(EventGroup::XgmiDataOut));
    }

    #[test]
    fn groups_must_be_directories() {
        let tmp = TempDir::new().unwrap();
        write_group(tmp.path());
        fs::write(tmp.path().join("amdgpu_1"), "").unwrap();
        assert_eq!(
            supported_groups(tmp.path(), 1).into_iter().collect::<Vec<_>>(),
            vec![EventGroup::Xgmi as u32]
        );
        assert!(supported_groups(tmp.path(), 2).is_empty());
    }

    #[test]
    fn formats_are_range_checked() {
        assert_eq!(parse_format("config:8-15\n").unwrap(), (8, 8));
        assert_eq!(parse_format("config:63").unwrap(), (63, 1));
        assert_eq!(parse_format("config:9-3").unwrap_err().status(), Status::UnexpectedSize);
        assert_eq!(parse_format("config:0-300").unwrap_err().status(), Status::UnexpectedSize);
        assert!(parse_format("garbage").is_err());
    }

    #[test]
    fn assembles_config_from_sysfs() {
        let tmp = TempDir::new().unwrap();
        write_group(tmp.path());
        let counter = Counter::new(tmp.path(), 1, 0, 7).unwrap();
        let (pmu_type, config) = counter.perf_config().unwrap();
        assert_eq!(pmu_type, 23);
        assert_eq!(config, 0x3f_47_07);
    }

    #[test]
    fn unopened_counter_is_bad_fd() {
        let tmp = TempDir::new().unwrap();
        let mut counter = Counter::new(tmp.path(), 0, 0, 10).unwrap();
        assert!(!counter.is_open());
        assert_eq!(counter.read().unwrap_err().status(), Status::FileError);
        assert_eq!(counter.stop().unwrap_err().status(), Status::FileError);
        assert_eq!(
            Counter::new(tmp.path(), 0, 0, 9).unwrap_err().status(),
            Status::InvalidArgs
        );
    }

    #[test]
    fn reads_report_deltas() {
        let tmp = TempDir::new().unwrap();
        let mut counter = Counter::new(tmp.path(), 0, 0, 0).unwrap();
        let mut values = [100u64, 250, 1000].into_iter();
        let mut next = || {
            Ok(RawSample {
                value: values.next().unwrap(),
                time_enabled: 5,
                time_running: 5,
            })
        };
        assert_eq!(counter.sample_with(&mut next).unwrap().value, 100);
        assert_eq!(counter.sample_with(&mut next).unwrap().value, 150);
        assert_eq!(counter.sample_with(&mut next).unwrap().value, 750);
    }

    #[test]
    fn implausible_delta_is_discarded_and_reread() {
        let tmp = TempDir::new().unwrap();
        let mut counter = Counter::new(tmp.path(), 0, 0, 0).unwrap();
        let mut values = [10u64, (1 << 48) + 100, (1 << 48) + 160].into_iter();
        let mut next = || {
            Ok(RawSample {
                value: values.next().unwrap(),
                ..RawSample::default()
            })
        };
        assert_eq!(counter.sample_with(&mut next).unwrap().value, 10);
        assert_eq!(counter.sample_with(&mut next).unwrap().value, 60);

        let mut wild = || {
            Ok(RawSample {
                value: 0,
                ..RawSample::default()
            })
        };
        counter.prev_value = 1 << 50;
        assert_eq!(counter.sample_with(&mut wild).unwrap().value, 0);
    }
}
