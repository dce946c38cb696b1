//! Pairwise GPU topology queries over the tables built at init.

use crate::error::{RsmiError, RsmiResult, Status};
use crate::kfd::io_link::{KfdLinkType, LinkType};
use crate::kfd::node::KfdNode;
use crate::smi::SmiState;

/// Assumed CPU-to-CPU weight when the two NUMA nodes have no direct link.
const DEFAULT_CPU_LINK_WEIGHT: u64 = 20;
/// Extra cost of crossing more than one CPU hop.
const EXTRA_CPU_HOP_WEIGHT: u64 = 10;
/// QPI links heavier than this are treated as multi-hop.
const QPI_DIRECT_WEIGHT_LIMIT: u64 = 20;

/// How two GPUs reach each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuPath {
    pub hops: u64,
    pub link_type: LinkType,
    pub weight: u64,
}

fn node_pair(state: &SmiState, src: u32, dst: u32) -> RsmiResult<(&KfdNode, &KfdNode)> {
    if src == dst {
        return Err(Status::InvalidArgs.into());
    }
    Ok((state.kfd_node(src)?, state.kfd_node(dst)?))
}

/// Resolves the path between devices `src` and `dst`.
///
/// # Errors
/// `InvalidArgs` for identical or unknown devices; `NotSupported` when neither a direct link
/// nor NUMA affinity for both GPUs is known.
pub fn gpu_path(state: &SmiState, src: u32, dst: u32) -> RsmiResult<GpuPath> {
    let (from, to) = node_pair(state, src, dst)?;

    if let Ok(link) = from.link(to.node_indx) {
        return Ok(GpuPath {
            hops: 1,
            link_type: link.link_type.into(),
            weight: link.weight,
        });
    }

    let (Some(numa_from), Some(numa_to)) = (from.numa, to.numa) else {
        return Err(Status::NotSupported.into());
    };
    let gpu_weights = numa_from.weight + numa_to.weight;

    if numa_from.node == numa_to.node {
        return Ok(GpuPath {
            hops: 2,
            link_type: LinkType::PciExpress,
            weight: gpu_weights,
        });
    }

    let cpu_link = state.io_link(numa_from.node, numa_to.node);
    let path = match cpu_link {
        Some(link)
            if !(link.link_type == KfdLinkType::Qpi11
                && link.weight > QPI_DIRECT_WEIGHT_LIMIT) =>
        {
            GpuPath {
                hops: 3,
                link_type: LinkType::PciExpress,
                weight: gpu_weights + link.weight,
            }
        }
        _ => {
            let cpu_weight = cpu_link.map_or(DEFAULT_CPU_LINK_WEIGHT, |l| l.weight);
            GpuPath {
                hops: 4,
                link_type: LinkType::PciExpress,
                weight: gpu_weights + cpu_weight + EXTRA_CPU_HOP_WEIGHT,
            }
        }
    };
    Ok(path)
}

/// NUMA node closest to device `dv_ind`.
///
/// # Errors
/// `NotSupported` if the node has no CPU link.
pub fn numa_node_number(state: &SmiState, dv_ind: u32) -> RsmiResult<u32> {
    state
        .kfd_node(dv_ind)?
        .numa
        .map(|n| n.node)
        .ok_or(RsmiError::Status(Status::NotSupported))
}

/// # Errors
/// As for [`gpu_path`].
pub fn link_weight(state: &SmiState, src: u32, dst: u32) -> RsmiResult<u64> {
    gpu_path(state, src, dst).map(|p| p.weight)
}

/// `(hops, type)` between two devices.
///
/// # Errors
/// As for [`gpu_path`].
pub fn link_type(state: &SmiState, src: u32, dst: u32) -> RsmiResult<(u64, LinkType)> {
    gpu_path(state, src, dst).map(|p| (p.hops, p.link_type))
}

/// `(min, max)` bandwidth in MB/s. Only direct XGMI links report one.
///
/// # Errors
/// `NotSupported` for anything other than a direct XGMI link.
pub fn minmax_bandwidth(state: &SmiState, src: u32, dst: u32) -> RsmiResult<(u64, u64)> {
    let (from, to) = node_pair(state, src, dst)?;
    match from.link(to.node_indx) {
        Ok(link) if link.link_type == KfdLinkType::Xgmi => {
            Ok((link.min_bandwidth, link.max_bandwidth))
        }
        _ => Err(Status::NotSupported.into()),
    }
}

/// Whether `src` can reach `dst` peer-to-peer.
///
/// # Errors
/// `InvalidArgs` for identical or unknown devices.
pub fn is_p2p_accessible(state: &SmiState, src: u32, dst: u32) -> RsmiResult<bool> {
    let (from, to) = node_pair(state, src, dst)?;
    Ok(from.p2p_links.contains_key(&to.node_indx) || from.links.contains_key(&to.node_indx))
}
