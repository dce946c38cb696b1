//! KFD SMI event notification.
//!
//! The driver hands out one anonymous descriptor per GPU through `AMDKFD_IOC_SMI_EVENTS` on a
//! shared `/dev/kfd` handle. The shared handle is reference counted under its own mutex and
//! closed when the last device stops listening.

use crate::error::{RsmiError, RsmiResult, Status};
use crate::kfd::device::KfdDevice;
use crate::kfd::ioctl::kfd_smi_event_mask_from_index;
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};

/// Longest message carried by one notification, including the terminator.
pub const MAX_EVENT_MESSAGE_SIZE: usize = 64;

const READ_CHUNK: usize = 4096;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    VmFault = 1,
    ThermalThrottle = 2,
    GpuPreReset = 3,
    GpuPostReset = 4,
}

impl EventType {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::VmFault),
            2 => Some(Self::ThermalThrottle),
            3 => Some(Self::GpuPreReset),
            4 => Some(Self::GpuPostReset),
            _ => None,
        }
    }

    #[must_use]
    pub const fn mask(self) -> u64 {
        kfd_smi_event_mask_from_index(self as u32)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventNotification {
    pub dv_ind: u32,
    pub event: u32,
    pub message: String,
}

#[derive(Debug, Default)]
struct SharedKfd {
    device: Option<KfdDevice>,
    refcount: u32,
}

/// Per-device descriptors plus records read but not yet handed out.
///
/// Lock order: `streams` before `shared`.
#[derive(Debug, Default)]
struct Streams {
    fds: BTreeMap<u32, OwnedFd>,
    pending: VecDeque<EventNotification>,
}

#[derive(Debug)]
pub struct EventNotifier {
    kfd_path: PathBuf,
    shared: Mutex<SharedKfd>,
    streams: Mutex<Streams>,
}

impl EventNotifier {
    #[must_use]
    pub fn new(kfd_path: PathBuf) -> Self {
        Self {
            kfd_path,
            shared: Mutex::new(SharedKfd::default()),
            streams: Mutex::new(Streams::default()),
        }
    }

    /// Starts listening for events on device `dv_ind` (KFD `gpu_id`).
    ///
    /// Calling it again for a device that is already listening is a no-op.
    ///
    /// # Errors
    /// Fails if `/dev/kfd` cannot be opened or the driver rejects the request.
    pub fn init(&self, dv_ind: u32, gpu_id: u32) -> RsmiResult<()> {
        let mut streams = self.lock_streams();
        if streams.fds.contains_key(&dv_ind) {
            return Ok(());
        }

        let mut shared = self.lock_shared();
        if shared.device.is_none() {
            let device = KfdDevice::open(&self.kfd_path)
                .map_err(|e| RsmiError::sysfs(&self.kfd_path, e))?;
            match device.get_version() {
                Ok(v) => debug!(major = v.major_version, minor = v.minor_version, "opened kfd"),
                Err(e) => warn!(error = %e, "kfd version query failed"),
            }
            shared.device = Some(device);
        }
        let Some(device) = shared.device.as_ref() else {
            return Err(Status::InternalException.into());
        };

        let fd = match device.smi_events(gpu_id) {
            Ok(fd) if fd >= 0 => fd,
            Ok(_) => return Err(RsmiError::errno(libc::EBADF)),
            Err(e) => {
                if shared.refcount == 0 {
                    shared.device = None;
                }
                return Err(e.into());
            }
        };
        shared.refcount += 1;

        // SAFETY: the driver just handed us this descriptor and nothing else owns it.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        streams.fds.insert(dv_ind, fd);
        debug!(dv_ind, gpu_id, refcount = shared.refcount, "event notification started");
        Ok(())
    }

    #[cfg(test)]
    fn register_stream(&self, dv_ind: u32, fd: OwnedFd) {
        self.lock_streams().fds.insert(dv_ind, fd);
    }

    /// Selects which events device `dv_ind` reports.
    ///
    /// # Errors
    /// `InitError` if [`init`](Self::init) was not called for the device.
    pub fn mask_set(&self, dv_ind: u32, mask: u64) -> RsmiResult<()> {
        let streams = self.lock_streams();
        let fd = streams
            .fds
            .get(&dv_ind)
            .ok_or(RsmiError::Status(Status::InitError))?;
        let bytes = mask.to_ne_bytes();
        // SAFETY: `bytes` outlives the call and the descriptor is owned by `streams`.
        let ret = unsafe { libc::write(fd.as_raw_fd(), bytes.as_ptr().cast(), bytes.len()) };
        if ret < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if usize::try_from(ret).ok() != Some(bytes.len()) {
            return Err(Status::UnexpectedSize.into());
        }
        Ok(())
    }

    /// Collects up to `max` notifications, waiting at most `timeout_ms`.
    ///
    /// Records beyond `max` stay queued for the next call.
    ///
    /// # Errors
    /// `NoData` when nothing arrived before the timeout.
    pub fn get(&self, timeout_ms: i32, max: usize) -> RsmiResult<Vec<EventNotification>> {
        let mut streams = self.lock_streams();
        if streams.fds.is_empty() {
            return Err(Status::InitError.into());
        }

        if streams.pending.len() < max {
            let wait = if streams.pending.is_empty() { timeout_ms } else { 0 };
            let Streams { fds, pending } = &mut *streams;
            read_ready(fds, wait, pending)?;
        }

        let take = max.min(streams.pending.len());
        if take == 0 {
            return Err(Status::NoData.into());
        }
        Ok(streams.pending.drain(..take).collect())
    }

    /// Stops listening on `dv_ind` and drops its share of `/dev/kfd`.
    ///
    /// # Errors
    /// `InvalidArgs` if the device was not listening.
    pub fn stop(&self, dv_ind: u32) -> RsmiResult<()> {
        let mut streams = self.lock_streams();
        if streams.fds.remove(&dv_ind).is_none() {
            return Err(Status::InvalidArgs.into());
        }
        streams.pending.retain(|e| e.dv_ind != dv_ind);
        let mut shared = self.lock_shared();
        shared.refcount = shared.refcount.saturating_sub(1);
        if shared.refcount == 0 {
            shared.device = None;
        }
        debug!(dv_ind, remaining = shared.refcount, "event notification stopped");
        Ok(())
    }

    #[must_use]
    pub fn handle_refcount(&self) -> u32 {
        self.lock_shared().refcount
    }

    fn lock_streams(&self) -> MutexGuard<'_, Streams> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_shared(&self) -> MutexGuard<'_, SharedKfd> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Polls every stream once and queues whatever records are ready.
fn read_ready(
    streams: &BTreeMap<u32, OwnedFd>,
    timeout_ms: i32,
    pending: &mut VecDeque<EventNotification>,
) -> RsmiResult<()> {
    let mut order: Vec<u32> = Vec::with_capacity(streams.len());
    let mut fds: Vec<libc::pollfd> = Vec::with_capacity(streams.len());
    for (dv_ind, fd) in streams {
        order.push(*dv_ind);
        fds.push(libc::pollfd {
            fd: fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
    }

    #[allow(clippy::cast_possible_truncation)]
    // SAFETY: `fds` is a live, correctly sized array of pollfd.
    let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if ready < 0 {
        return Err(io::Error::last_os_error().into());
    }

    for (dv_ind, pfd) in order.iter().zip(&fds) {
        if pfd.revents & libc::POLLIN == 0 {
            continue;
        }
        let mut buf = [0u8; READ_CHUNK];
        // SAFETY: `buf` is writable for its full length.
        let n = unsafe { libc::read(pfd.fd, buf.as_mut_ptr().cast(), buf.len()) };
        let Ok(n) = usize::try_from(n) else {
            return Err(io::Error::last_os_error().into());
        };
        for line in String::from_utf8_lossy(&buf[..n]).lines() {
            if let Some((event, message)) = parse_event_line(line) {
                trace!(dv_ind, event, %message, "event notification");
                pending.push_back(EventNotification {
                    dv_ind: *dv_ind,
                    event,
                    message,
                });
            }
        }
    }
    Ok(())
}

/// Parses one `"<hex id> <message>"` record.
#[must_use]
pub fn parse_event_line(line: &str) -> Option<(u32, String)> {
    let line = line.trim();
    let (id, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let event = u32::from_str_radix(id, 16).ok()?;
    let mut message = rest.trim().to_string();
    if message.len() >= MAX_EVENT_MESSAGE_SIZE {
        let mut cut = MAX_EVENT_MESSAGE_SIZE - 1;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }
    Some((event, message))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    fn write_all(fd: &OwnedFd, data: &[u8]) {
        let n = unsafe { libc::write(fd.as_raw_fd(), data.as_ptr().cast(), data.len()) };
        assert_eq!(n as usize, data.len());
    }

    #[test]
    fn parses_records() {
        assert_eq!(
            parse_event_line("2 throttle 0x1"),
            Some((2, "throttle 0x1".to_string()))
        );
        assert_eq!(parse_event_line("a"), Some((10, String::new())));
        assert_eq!(parse_event_line("zz nope"), None);

        let long = format!("1 {}", "x".repeat(100));
        let (_, msg) = parse_event_line(&long).unwrap();
        assert_eq!(msg.len(), MAX_EVENT_MESSAGE_SIZE - 1);
    }

    #[test]
    fn masks_follow_event_ids() {
        assert_eq!(EventType::VmFault.mask(), 0x1);
        assert_eq!(EventType::ThermalThrottle.mask(), 0x2);
        assert_eq!(EventType::GpuPostReset.mask(), 0x8);
        assert_eq!(EventType::from_raw(5), None);
    }

    #[test]
    fn collects_pending_events_and_times_out() {
        let notifier = EventNotifier::new(PathBuf::from("/nonexistent/kfd"));
        let (rx, tx) = pipe();
        notifier.register_stream(3, rx);

        write_all(&tx, b"1 fault at 0xdead\n3 reset\n");
        let events = notifier.get(100, 8).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].dv_ind, 3);
        assert_eq!(events[0].event, 1);
        assert_eq!(events[1].message, "reset");

        assert_eq!(notifier.get(10, 8).unwrap_err().status(), Status::NoData);
    }

    #[test]
    fn records_beyond_max_are_kept_for_next_call() {
        let notifier = EventNotifier::new(PathBuf::from("/nonexistent/kfd"));
        let (rx, tx) = pipe();
        notifier.register_stream(1, rx);

        write_all(&tx, b"1 first\n2 second\n4 third\n");
        let events = notifier.get(100, 1).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "first");

        let events = notifier.get(0, 8).unwrap();
        let messages: Vec<&str> = events.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, ["second", "third"]);
        assert_eq!(notifier.get(0, 8).unwrap_err().status(), Status::NoData);
    }

    #[test]
    fn init_for_listening_device_keeps_existing_stream() {
        let notifier = EventNotifier::new(PathBuf::from("/nonexistent/kfd"));
        let (rx, tx) = pipe();
        notifier.register_stream(2, rx);

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| notifier.init(2, 99).unwrap());
            }
        });
        assert_eq!(notifier.handle_refcount(), 0);

        write_all(&tx, b"2 still here\n");
        assert_eq!(notifier.get(100, 8).unwrap()[0].message, "still here");
    }

    #[test]
    fn stop_discards_queued_records() {
        let notifier = EventNotifier::new(PathBuf::from("/nonexistent/kfd"));
        let (rx0, tx0) = pipe();
        let (rx1, _tx1) = pipe();
        notifier.register_stream(0, rx0);
        notifier.register_stream(1, rx1);

        write_all(&tx0, b"1 a\n1 b\n");
        assert_eq!(notifier.get(100, 1).unwrap().len(), 1);
        notifier.stop(0).unwrap();
        assert_eq!(notifier.get(0, 8).unwrap_err().status(), Status::NoData);
    }

    #[test]
    fn mask_set_writes_to_stream() {
        let notifier = EventNotifier::new(PathBuf::from("/nonexistent/kfd"));
        let (rx, tx) = pipe();
        notifier.register_stream(0, tx);
        notifier.mask_set(0, 0x5).unwrap();

        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(rx.as_raw_fd(), buf.as_mut_ptr().cast(), 8) };
        assert_eq!(n, 8);
        assert_eq!(u64::from_ne_bytes(buf), 0x5);

        assert_eq!(notifier.mask_set(1, 1).unwrap_err().status(), Status::InitError);
    }

    #[test]
    fn init_without_driver_fails_and_stop_requires_listener() {
        let notifier = EventNotifier::new(PathBuf::from("/nonexistent/kfd"));
        assert_eq!(notifier.init(0, 1234).unwrap_err().status(), Status::NotSupported);
        assert_eq!(notifier.handle_refcount(), 0);
        assert_eq!(notifier.stop(0).unwrap_err().status(), Status::InvalidArgs);
    }
}
