//! Builds the device table: DRM cards matched one-to-one with KFD GPU nodes.

use crate::config::{Config, InitFlags};
use crate::counters;
use crate::device::Device;
use crate::device::attribute::DevAttr;
use crate::error::{RsmiError, RsmiResult};
use crate::kfd::io_link::{self, IoLink, LinkDirectory};
use crate::kfd::node::{self, KfdNode, PROP_UNIQUE_ID};
use crate::sysfs;
use crate::utils::{bdf_string, numeric_suffix, parse_hex};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const AMD_VENDOR_ID: u64 = 0x1002;

/// Clears the partition nibble (bits 28..31) so partitions sort next to their parent.
const BDF_SORT_MASK: u64 = 0xFFFF_FFFF_0FFF_FFFF;

/// Everything discovery produces. `nodes[i]` is the KFD node bound to `devices[i]`.
#[derive(Debug)]
pub struct SystemTopology {
    pub devices: Vec<Device>,
    pub nodes: Vec<KfdNode>,
    pub io_links: BTreeMap<(u32, u32), IoLink>,
}

/// Parses `DDDD:BB:DD.F` into `(domain << 32) | (bus << 8) | (device << 3) | function`.
#[must_use]
pub fn parse_bdf(segment: &str) -> Option<u64> {
    let b = segment.as_bytes();
    if b.len() != 12 || b[4] != b':' || b[7] != b':' || b[10] != b'.' {
        return None;
    }
    let hex = |s: &str| {
        if s.bytes().all(|c| c.is_ascii_hexdigit()) {
            u64::from_str_radix(s, 16).ok()
        } else {
            None
        }
    };
    let domain = hex(&segment[0..4])?;
    let bus = hex(&segment[5..7])?;
    let dev = hex(&segment[8..10])?;
    let func = hex(&segment[11..12])?;
    if dev > 0x1F || func > 0x7 {
        return None;
    }
    Some((domain << 32) | (bus << 8) | (dev << 3) | func)
}

/// BDF of a card, from the last segment of its `device` symlink.
///
/// # Errors
/// An unreadable link or a malformed segment is an initialization error.
pub fn construct_bdf_id(card_path: &Path) -> RsmiResult<u64> {
    let link = card_path.join("device");
    let target = fs::read_link(&link).map_err(|e| RsmiError::sysfs(&link, e))?;
    let segment = target
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    parse_bdf(segment).ok_or_else(|| {
        RsmiError::Init(format!(
            "{}: cannot derive BDF from link target {}",
            link.display(),
            target.display()
        ))
    })
}

/// Card numbers present under the DRM root, in ascending order.
fn card_indices(drm_root: &Path) -> Vec<u32> {
    let max = sysfs::list_names(drm_root)
        .iter()
        .filter_map(|n| numeric_suffix(n, "card"))
        .max();
    let Some(max) = max else {
        return Vec::new();
    };
    (0..=max)
        .filter(|i| drm_root.join(format!("card{i}")).is_dir())
        .collect()
}

fn is_amd_card(card_path: &Path) -> bool {
    sysfs::read_token(&card_path.join("device").join(DevAttr::VendorId.file_name()))
        .ok()
        .and_then(|v| parse_hex(&v))
        == Some(AMD_VENDOR_ID)
}

/// BDFs of KFD GPU nodes, grouped by the GPU's `unique_id`.
fn partitions_by_unique_id(nodes: &BTreeMap<u64, KfdNode>) -> BTreeMap<u64, Vec<u64>> {
    let mut groups: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
    for (bdf, node) in nodes {
        if let Some(uid) = node.properties.get(PROP_UNIQUE_ID) {
            groups.entry(*uid).or_default().push(*bdf);
        }
    }
    groups
}

/// Creates the devices for every eligible card, one per compute partition.
fn enumerate_devices(
    config: &Arc<Config>,
    flags: InitFlags,
    partitions: &BTreeMap<u64, Vec<u64>>,
) -> Vec<Device> {
    let drm_root = config.drm_root.as_path();
    let mut devices = Vec::new();
    for index in card_indices(drm_root) {
        let path = drm_root.join(format!("card{index}"));
        if !flags.all_gpus() && !is_amd_card(&path) {
            debug!(card = index, "skipping non-AMD card");
            continue;
        }

        let groups = counters::supported_groups(&config.event_source_root, index);
        let unique_id = sysfs::read_hex_u64(
            &path.join("device").join(DevAttr::UniqueId.file_name()),
        )
        .ok();
        let partition_bdfs = unique_id
            .and_then(|uid| partitions.get(&uid))
            .filter(|bdfs| bdfs.len() > 1);

        match partition_bdfs {
            Some(bdfs) => {
                for bdf in bdfs {
                    let mut dev = Device::new(path.clone(), index, Arc::clone(config));
                    dev.bdf = Some(*bdf);
                    dev.event_groups.clone_from(&groups);
                    devices.push(dev);
                }
                debug!(card = index, partitions = bdfs.len(), "card is partitioned");
            }
            None => {
                let mut dev = Device::new(path, index, Arc::clone(config));
                dev.event_groups = groups;
                devices.push(dev);
            }
        }
    }
    devices
}

/// Joins devices with KFD nodes by BDF. Devices without a node are dropped.
fn bind_devices(
    devices: Vec<Device>,
    mut kfd_nodes: BTreeMap<u64, KfdNode>,
) -> (Vec<Device>, Vec<KfdNode>) {
    let mut bound_devices = Vec::with_capacity(devices.len());
    let mut bound_nodes = Vec::with_capacity(devices.len());
    for mut dev in devices {
        let bdf = dev.bdf();
        let Some(mut node) = kfd_nodes.remove(&bdf) else {
            warn!(
                card = dev.card_index(),
                bdf = %bdf_string(bdf),
                "no KFD node matches device, dropping it"
            );
            continue;
        };
        let dev_ind = u32::try_from(bound_devices.len()).unwrap_or(u32::MAX);
        node.amdgpu_dev_index = Some(dev_ind);
        dev.kfd_gpu_id = node.gpu_id;
        dev.kfd_node_index = Some(node.node_indx);
        debug!(
            dev_ind,
            card = dev.card_index(),
            bdf = %bdf_string(bdf),
            node = node.node_indx,
            gpu_id = node.gpu_id,
            "bound device"
        );
        bound_devices.push(dev);
        bound_nodes.push(node);
    }
    (bound_devices, bound_nodes)
}

/// Runs full discovery against the roots in `config`.
///
/// # Errors
/// Malformed KFD nodes or io-links, or a card whose BDF cannot be derived, abort discovery.
pub fn discover(config: &Arc<Config>, flags: InitFlags) -> RsmiResult<SystemTopology> {
    let kfd_nodes = node::discover_kfd_nodes(&config.kfd_nodes_root)?;
    let partitions = partitions_by_unique_id(&kfd_nodes);

    let mut devices = enumerate_devices(config, flags, &partitions);
    for dev in &mut devices {
        if dev.bdf.is_none() {
            dev.bdf = Some(construct_bdf_id(dev.path())?);
        }
    }
    devices.sort_by_key(|d| d.bdf() & BDF_SORT_MASK);

    let (devices, nodes) = bind_devices(devices, kfd_nodes);

    let io_links = io_link::discover_links(&config.kfd_nodes_root, LinkDirectory::IoLinks)
        .map_err(|e| RsmiError::Init(format!("io link discovery failed: {e}")))?;

    info!(devices = devices.len(), links = io_links.len(), "device discovery complete");
    Ok(SystemTopology {
        devices,
        nodes,
        io_links,
    })
}
