use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Status codes returned across the C ABI.
///
/// The discriminants are part of the ABI and must never be renumbered.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success = 0x0,
    InvalidArgs = 0x1,
    NotSupported = 0x2,
    FileError = 0x3,
    Permission = 0x4,
    OutOfResources = 0x5,
    InternalException = 0x6,
    InputOutOfBounds = 0x7,
    InitError = 0x8,
    NotYetImplemented = 0x9,
    NotFound = 0xA,
    InsufficientSize = 0xB,
    Interrupt = 0xC,
    UnexpectedSize = 0xD,
    NoData = 0xE,
    UnexpectedData = 0xF,
    Busy = 0x10,
    UnknownError = 0xFFFF_FFFF,
}

impl Status {
    /// Collapses an OS errno into the status taxonomy.
    ///
    /// Every path that ends in a raw errno goes through here, so two accessors failing on the
    /// same kernel condition always report the same status.
    #[must_use]
    pub const fn from_errno(errno: i32) -> Self {
        match errno {
            0 => Self::Success,
            libc::ESRCH => Self::NotFound,
            libc::EACCES => Self::Permission,
            libc::EPERM | libc::ENOENT => Self::NotSupported,
            libc::EBADF | libc::EISDIR => Self::FileError,
            libc::EINTR => Self::Interrupt,
            libc::EIO => Self::UnexpectedSize,
            libc::ENXIO => Self::UnexpectedData,
            libc::EBUSY => Self::Busy,
            libc::EINVAL => Self::InvalidArgs,
            libc::ENOMEM => Self::OutOfResources,
            _ => Self::UnknownError,
        }
    }

    #[must_use]
    pub const fn from_raw(value: u32) -> Option<Self> {
        let status = match value {
            0x0 => Self::Success,
            0x1 => Self::InvalidArgs,
            0x2 => Self::NotSupported,
            0x3 => Self::FileError,
            0x4 => Self::Permission,
            0x5 => Self::OutOfResources,
            0x6 => Self::InternalException,
            0x7 => Self::InputOutOfBounds,
            0x8 => Self::InitError,
            0x9 => Self::NotYetImplemented,
            0xA => Self::NotFound,
            0xB => Self::InsufficientSize,
            0xC => Self::Interrupt,
            0xD => Self::UnexpectedSize,
            0xE => Self::NoData,
            0xF => Self::UnexpectedData,
            0x10 => Self::Busy,
            0xFFFF_FFFF => Self::UnknownError,
            _ => return None,
        };
        Some(status)
    }

    /// Human-readable description, as handed out by `rsmi_status_string`.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Success => "RSMI_STATUS_SUCCESS: The function has been executed successfully.",
            Self::InvalidArgs => {
                "RSMI_STATUS_INVALID_ARGS: The provided arguments do not meet the preconditions \
                 required for calling this function."
            }
            Self::NotSupported => {
                "RSMI_STATUS_NOT_SUPPORTED: This function is not supported in the current \
                 environment."
            }
            Self::FileError => {
                "RSMI_STATUS_FILE_ERROR: A file or directory could not be found or opened. The \
                 running kernel may not expose this interface."
            }
            Self::Permission => {
                "RSMI_STATUS_PERMISSION: The calling process lacks the privileges this command \
                 requires. Running as root usually fixes this."
            }
            Self::OutOfResources => "Unable to acquire memory or other resource",
            Self::InternalException => "An internal exception was caught",
            Self::InputOutOfBounds => "The provided input is out of allowable or safe range",
            Self::InitError => {
                "An error occurred during initialization, monitor discovery or while building \
                 internal data structures"
            }
            Self::NotYetImplemented => {
                "The called function has not been implemented for this device type"
            }
            Self::NotFound => "An item required to complete the call was not found",
            Self::InsufficientSize => "Not enough space was provided to fully return the result",
            Self::Interrupt => "An interrupt occurred while executing the call",
            Self::UnexpectedSize => "The data read or written had an unexpected size",
            Self::NoData => "No data was found for the given input",
            Self::UnexpectedData => "The data read or provided was not in the expected form",
            Self::Busy => "The device is busy; retry the call",
            Self::UnknownError => {
                "An unknown error prevented the call from completing successfully"
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum RsmiError {
    #[error("{}", .0.description())]
    Status(Status),

    #[error("I/O Error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to access {}: {source}", path.display())]
    Sysfs {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed content in {}: {detail}", path.display())]
    Parse { path: PathBuf, detail: String },

    #[error("Initialization failed: {0}")]
    Init(String),
}

impl RsmiError {
    /// Wraps a raw errno without translating it.
    #[must_use]
    pub fn errno(errno: i32) -> Self {
        Self::Io(io::Error::from_raw_os_error(errno))
    }

    pub fn sysfs(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Sysfs {
            path: path.into(),
            source,
        }
    }

    pub fn parse(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// The raw errno behind this error, if there is one.
    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Io(e) | Self::Sysfs { source: e, .. } => Some(io_errno(e)),
            _ => None,
        }
    }

    #[must_use]
    pub fn status(&self) -> Status {
        match self {
            Self::Status(s) => *s,
            Self::Io(e) | Self::Sysfs { source: e, .. } => Status::from_errno(io_errno(e)),
            Self::Parse { .. } => Status::UnexpectedData,
            Self::Init(_) => Status::InitError,
        }
    }
}

impl From<Status> for RsmiError {
    fn from(status: Status) -> Self {
        Self::Status(status)
    }
}

fn io_errno(e: &io::Error) -> i32 {
    if let Some(code) = e.raw_os_error() {
        return code;
    }
    match e.kind() {
        io::ErrorKind::NotFound => libc::ENOENT,
        io::ErrorKind::PermissionDenied => libc::EACCES,
        io::ErrorKind::Interrupted => libc::EINTR,
        io::ErrorKind::InvalidInput => libc::EINVAL,
        io::ErrorKind::InvalidData => libc::ENXIO,
        io::ErrorKind::UnexpectedEof => libc::EIO,
        io::ErrorKind::OutOfMemory => libc::ENOMEM,
        _ => -1,
    }
}

pub type RsmiResult<T> = Result<T, RsmiError>;
