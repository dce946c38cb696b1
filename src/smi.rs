use crate::config::{Config, InitFlags};
use crate::device::Device;
use crate::discovery::{self, SystemTopology};
use crate::error::{RsmiError, RsmiResult, Status};
use crate::kfd::events::EventNotifier;
use crate::kfd::io_link::IoLink;
use crate::kfd::node::KfdNode;
use crate::logging;
use crate::utils::effective_uid;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info};

// ===============================================================================================
// Session State
// ===============================================================================================

/// Everything one initialized session knows about the machine.
///
/// Built once by discovery and never mutated afterwards; the per-device mutex inside each
/// [`Device`] is the only lock taken by accessors.
#[derive(Debug)]
pub struct SmiState {
    config: Arc<Config>,
    flags: InitFlags,
    euid: u32,
    devices: Vec<Device>,
    /// `nodes[dv_ind]` is the KFD node bound to device `dv_ind`.
    nodes: Vec<KfdNode>,
    io_links: BTreeMap<(u32, u32), IoLink>,
    gpu_id_to_dev: BTreeMap<u64, u32>,
    events: EventNotifier,
}

impl SmiState {
    /// Runs discovery and assembles the session tables.
    ///
    /// # Errors
    /// Any discovery failure is reported as `InitError`.
    pub fn build(config: Arc<Config>, flags: InitFlags) -> RsmiResult<Self> {
        let SystemTopology {
            devices,
            nodes,
            io_links,
        } = discovery::discover(&config, flags).map_err(|e| {
            error!(error = %e, "topology discovery failed");
            match e {
                RsmiError::Init(_) => e,
                other => RsmiError::Init(other.to_string()),
            }
        })?;

        let gpu_id_to_dev = devices
            .iter()
            .zip(0u32..)
            .map(|(d, i)| (d.kfd_gpu_id(), i))
            .collect();

        Ok(Self {
            events: EventNotifier::new(config.kfd_device.clone()),
            config,
            flags,
            euid: effective_uid(),
            devices,
            nodes,
            io_links,
            gpu_id_to_dev,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_euid(mut self, euid: u32) -> Self {
        self.euid = euid;
        self
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn flags(&self) -> InitFlags {
        self.flags
    }

    #[must_use]
    pub const fn euid(&self) -> u32 {
        self.euid
    }

    /// Fails with `Permission` unless the session runs as root.
    ///
    /// # Errors
    /// `Permission` for any non-zero effective uid.
    pub fn require_root(&self) -> RsmiResult<()> {
        if self.euid == 0 {
            Ok(())
        } else {
            Err(Status::Permission.into())
        }
    }

    #[must_use]
    pub fn num_devices(&self) -> u32 {
        u32::try_from(self.devices.len()).unwrap_or(u32::MAX)
    }

    #[must_use]
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// # Errors
    /// `InvalidArgs` if `dv_ind` is out of range.
    pub fn device(&self, dv_ind: u32) -> RsmiResult<&Device> {
        self.devices
            .get(dv_ind as usize)
            .ok_or(RsmiError::Status(Status::InvalidArgs))
    }

    /// The KFD node bound to `dv_ind`.
    ///
    /// # Errors
    /// `InvalidArgs` for an unknown device; `InitError` if the device has no node, which
    /// discovery never allows.
    pub fn kfd_node(&self, dv_ind: u32) -> RsmiResult<&KfdNode> {
        self.device(dv_ind)?;
        self.nodes
            .get(dv_ind as usize)
            .ok_or(RsmiError::Status(Status::InitError))
    }

    /// Device index owning KFD `gpu_id`.
    #[must_use]
    pub fn dev_index_for_gpu_id(&self, gpu_id: u64) -> Option<u32> {
        self.gpu_id_to_dev.get(&gpu_id).copied()
    }

    /// KFD node index backing device `dv_ind`.
    ///
    /// # Errors
    /// As for [`kfd_node`](Self::kfd_node).
    pub fn node_index(&self, dv_ind: u32) -> RsmiResult<u32> {
        self.kfd_node(dv_ind).map(|n| n.node_indx)
    }

    #[must_use]
    pub fn io_link(&self, node_from: u32, node_to: u32) -> Option<&IoLink> {
        self.io_links.get(&(node_from, node_to))
    }

    #[must_use]
    pub fn io_links(&self) -> &BTreeMap<(u32, u32), IoLink> {
        &self.io_links
    }

    #[must_use]
    pub fn events(&self) -> &EventNotifier {
        &self.events
    }
}

// ===============================================================================================
// Registry
// ===============================================================================================

#[derive(Debug, Default)]
struct Registry {
    refcount: u32,
    state: Option<Arc<SmiState>>,
}

/// Reference-counted session owner.
///
/// The first `init` runs discovery with its flags; later calls only bump the count and hand out
/// the same state. The state is dropped when the count returns to zero.
#[derive(Debug)]
pub struct RocmSmi {
    config: Arc<Config>,
    registry: Mutex<Registry>,
}

impl RocmSmi {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            registry: Mutex::new(Registry::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens (or joins) the session.
    ///
    /// # Errors
    /// `InitError` if discovery fails on the first call; the count is left untouched.
    pub fn init(&self, flags: InitFlags) -> RsmiResult<Arc<SmiState>> {
        let mut registry = self.lock();
        if let Some(state) = registry.state.clone() {
            registry.refcount += 1;
            debug!(refcount = registry.refcount, "joined existing session");
            return Ok(state);
        }

        logging::init(self.config.logging_level);
        let state = Arc::new(SmiState::build(Arc::clone(&self.config), flags)?);
        registry.state = Some(Arc::clone(&state));
        registry.refcount = 1;
        info!(
            devices = state.num_devices(),
            flags = %format!("{:#x}", flags.0),
            "session initialized"
        );
        Ok(state)
    }

    /// Drops one reference; the last one tears the session down.
    ///
    /// # Errors
    /// `InitError` if there is no open session.
    pub fn shutdown(&self) -> RsmiResult<()> {
        let mut registry = self.lock();
        if registry.refcount == 0 {
            return Err(Status::InitError.into());
        }
        registry.refcount -= 1;
        if registry.refcount == 0 {
            registry.state = None;
            info!("session shut down");
        }
        Ok(())
    }

    /// The live session.
    ///
    /// # Errors
    /// `InitError` before `init` or after the last `shutdown`.
    pub fn state(&self) -> RsmiResult<Arc<SmiState>> {
        self.lock()
            .state
            .clone()
            .ok_or(RsmiError::Status(Status::InitError))
    }

    #[must_use]
    pub fn refcount(&self) -> u32 {
        self.lock().refcount
    }
}
