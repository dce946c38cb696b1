use crate::error::{RsmiError, RsmiResult, Status};
use crate::kfd::io_link::{self, IoLink, KfdLinkType, LinkDirectory};
use crate::sysfs;
use crate::utils::is_number;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const PROP_LOCATION_ID: &str = "location_id";
pub const PROP_DOMAIN: &str = "domain";
pub const PROP_HIVE_ID: &str = "hive_id";
pub const PROP_UNIQUE_ID: &str = "unique_id";
pub const PROP_SIMD_ARRAYS_PER_ENGINE: &str = "simd_arrays_per_engine";
pub const PROP_ARRAY_COUNT: &str = "array_count";
pub const PROP_CU_PER_SIMD_ARRAY: &str = "cu_per_simd_array";

/// The CPU node a GPU is closest to, chosen by minimum io-link weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumaAffinity {
    pub node: u32,
    pub weight: u64,
    pub link_type: KfdLinkType,
}

/// One compute node from the KFD topology tree.
///
/// Built once by [`KfdNode::initialize`] and read-only afterwards, apart from the device index
/// recorded when the node is bound to a DRM device.
#[derive(Debug, Clone)]
pub struct KfdNode {
    pub node_indx: u32,
    pub gpu_id: u64,
    pub name: String,
    pub xgmi_hive_id: u64,
    pub properties: HashMap<String, u64>,
    pub numa: Option<NumaAffinity>,
    /// Non-CPU neighbours, keyed by `node_to`.
    pub links: BTreeMap<u32, IoLink>,
    pub p2p_links: BTreeMap<u32, IoLink>,
    pub cu_count: u64,
    pub amdgpu_dev_index: Option<u32>,
}

fn node_dir(nodes_root: &Path, node_indx: u32) -> PathBuf {
    nodes_root.join(node_indx.to_string())
}

/// A node is usable when its `properties` file exists and is non-empty.
#[must_use]
pub fn node_supported(nodes_root: &Path, node_indx: u32) -> bool {
    sysfs::read_properties(&node_dir(nodes_root, node_indx).join("properties")).is_ok()
}

/// Reads `<node>/gpu_id`. Zero marks a CPU node.
///
/// # Errors
/// `ENXIO` if the content is not a plain decimal number.
pub fn read_gpu_id(nodes_root: &Path, node_indx: u32) -> RsmiResult<u64> {
    let path = node_dir(nodes_root, node_indx).join("gpu_id");
    let raw: String = sysfs::read_all(&path)?
        .chars()
        .filter(|c| *c != '\n')
        .collect();
    if !is_number(&raw) {
        return Err(RsmiError::sysfs(
            &path,
            std::io::Error::from_raw_os_error(libc::ENXIO),
        ));
    }
    raw.parse()
        .map_err(|_| RsmiError::parse(&path, format!("gpu_id out of range: {raw}")))
}

impl KfdNode {
    /// Reads a node and resolves its links.
    ///
    /// CPU nodes stop after the `gpu_id` read and come back with `gpu_id == 0`; callers are
    /// expected to skip them.
    ///
    /// # Errors
    /// Missing `hive_id`, a failed link walk or a missing CU-count property is an
    /// initialization error.
    pub fn initialize(nodes_root: &Path, node_indx: u32) -> RsmiResult<Self> {
        let dir = node_dir(nodes_root, node_indx);
        let properties = sysfs::read_properties(&dir.join("properties"))?;

        let mut node = Self {
            node_indx,
            gpu_id: read_gpu_id(nodes_root, node_indx)?,
            name: String::new(),
            xgmi_hive_id: 0,
            properties,
            numa: None,
            links: BTreeMap::new(),
            p2p_links: BTreeMap::new(),
            cu_count: 0,
            amdgpu_dev_index: None,
        };
        if node.gpu_id == 0 {
            return Ok(node);
        }

        match sysfs::read_all(&dir.join("name")) {
            Ok(name) => node.name = name.replace('\n', ""),
            Err(e) => warn!(node = node_indx, error = %e, "kfd node has no readable name"),
        }

        node.xgmi_hive_id = node.property(PROP_HIVE_ID).map_err(|_| {
            RsmiError::Init(format!("kfd node {node_indx}: missing xgmi hive id"))
        })?;

        let links = io_link::discover_node_links(nodes_root, node_indx, LinkDirectory::IoLinks)
            .map_err(|e| {
                RsmiError::Init(format!("kfd node {node_indx}: io link discovery failed: {e}"))
            })?;
        for (node_to, link) in links {
            if read_gpu_id(nodes_root, node_to)? == 0 {
                node.consider_numa_edge(&link);
            } else {
                node.links.insert(node_to, link);
            }
        }

        node.p2p_links =
            io_link::discover_node_links(nodes_root, node_indx, LinkDirectory::P2pLinks)
                .unwrap_or_else(|e| {
                    warn!(node = node_indx, error = %e, "p2p link discovery failed");
                    BTreeMap::new()
                });

        node.cu_count = [
            PROP_SIMD_ARRAYS_PER_ENGINE,
            PROP_ARRAY_COUNT,
            PROP_CU_PER_SIMD_ARRAY,
        ]
        .into_iter()
        .try_fold(1u64, |acc, key| {
            node.property(key)
                .map_err(|_| RsmiError::Init(format!("kfd node {node_indx}: missing {key}")))
                .and_then(|v| acc.checked_mul(v).ok_or(RsmiError::Status(Status::UnexpectedData)))
        })?;

        debug!(
            node = node_indx,
            gpu_id = node.gpu_id,
            name = %node.name,
            cu_count = node.cu_count,
            numa = ?node.numa.map(|n| n.node),
            "initialized kfd node"
        );
        Ok(node)
    }

    /// Keeps the lightest CPU edge. Ties keep the first one seen.
    fn consider_numa_edge(&mut self, link: &IoLink) {
        let replace = match self.numa {
            None => true,
            Some(current) => current.weight > link.weight,
        };
        if replace {
            self.numa = Some(NumaAffinity {
                node: link.node_to,
                weight: link.weight,
                link_type: link.link_type,
            });
        }
    }

    /// # Errors
    /// `InvalidArgs` when the property is absent.
    pub fn property(&self, key: &str) -> RsmiResult<u64> {
        self.properties
            .get(key)
            .copied()
            .ok_or(RsmiError::Status(Status::InvalidArgs))
    }

    /// The identifier used to join this node with a DRM device.
    pub fn bdf_id(&self) -> RsmiResult<u64> {
        let location = self.property(PROP_LOCATION_ID)?;
        let domain = self.property(PROP_DOMAIN)?;
        Ok((domain << 32) | location)
    }

    pub fn link(&self, node_to: u32) -> RsmiResult<&IoLink> {
        self.links
            .get(&node_to)
            .ok_or(RsmiError::Status(Status::InvalidArgs))
    }

    pub fn link_type(&self, node_to: u32) -> RsmiResult<KfdLinkType> {
        self.link(node_to).map(|l| l.link_type)
    }

    pub fn link_weight(&self, node_to: u32) -> RsmiResult<u64> {
        self.link(node_to).map(|l| l.weight)
    }

    pub fn max_bandwidth(&self, node_to: u32) -> RsmiResult<u64> {
        self.link(node_to).map(|l| l.max_bandwidth)
    }

    pub fn min_bandwidth(&self, node_to: u32) -> RsmiResult<u64> {
        self.link(node_to).map(|l| l.min_bandwidth)
    }
}

/// Every GPU node in the tree, keyed by its `(domain << 32) | location_id` identifier.
///
/// Unsupported nodes and CPU nodes are skipped.
///
/// # Errors
/// A GPU node lacking `location_id` or `domain` aborts discovery.
pub fn discover_kfd_nodes(nodes_root: &Path) -> RsmiResult<BTreeMap<u64, KfdNode>> {
    let mut nodes = BTreeMap::new();
    for (node_indx, _) in sysfs::numeric_entries(nodes_root) {
        if !node_supported(nodes_root, node_indx) {
            debug!(node = node_indx, "skipping kfd node without properties");
            continue;
        }
        let node = KfdNode::initialize(nodes_root, node_indx)?;
        if node.gpu_id == 0 {
            continue;
        }
        let bdf = node.bdf_id().map_err(|_| {
            RsmiError::Init(format!("kfd node {node_indx}: missing location_id or domain"))
        })?;
        nodes.insert(bdf, node);
    }
    Ok(nodes)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::kfd::io_link::tests::write_link;
    use std::fs;
    use tempfile::TempDir;

    pub(crate) fn write_cpu_node(root: &Path, idx: u32) {
        let dir = root.join(idx.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("properties"), "cpu_cores_count 16\nsimd_count 0\n").unwrap();
        fs::write(dir.join("gpu_id"), "0\n").unwrap();
    }

    pub(crate) fn write_gpu_node(root: &Path, idx: u32, gpu_id: u64, location: u64, domain: u64) {
        let dir = root.join(idx.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("properties"),
            format!(
                "simd_count 240\nlocation_id {location}\ndomain {domain}\nhive_id 0\n\
                 unique_id 77\nsimd_arrays_per_engine 2\narray_count 4\ncu_per_simd_array 15\n"
            ),
        )
        .unwrap();
        fs::write(dir.join("gpu_id"), format!("{gpu_id}\n")).unwrap();
        fs::write(dir.join("name"), "gfx908\n").unwrap();
    }

    #[test]
    fn cpu_nodes_are_returned_early_and_excluded() {
        let tmp = TempDir::new().unwrap();
        write_cpu_node(tmp.path(), 0);
        write_gpu_node(tmp.path(), 1, 1234, 0x1a00, 0);

        let cpu = KfdNode::initialize(tmp.path(), 0).unwrap();
        assert_eq!(cpu.gpu_id, 0);

        let nodes = discover_kfd_nodes(tmp.path()).unwrap();
        assert_eq!(nodes.len(), 1);
        let gpu = &nodes[&0x1a00];
        assert_eq!(gpu.gpu_id, 1234);
        assert_eq!(gpu.name, "gfx908");
        assert_eq!(gpu.cu_count, 120);
    }

    #[test]
    fn numa_edge_is_minimum_weight_first_seen_on_ties() {
        let tmp = TempDir::new().unwrap();
        for cpu in 0..3 {
            write_cpu_node(tmp.path(), cpu);
        }
        write_gpu_node(tmp.path(), 3, 99, 0x300, 0);
        write_gpu_node(tmp.path(), 4, 98, 0x400, 0);
        write_link(tmp.path(), LinkDirectory::IoLinks, 3, 0, (2, 0, 40));
        write_link(tmp.path(), LinkDirectory::IoLinks, 3, 1, (2, 1, 20));
        write_link(tmp.path(), LinkDirectory::IoLinks, 3, 2, (2, 2, 20));
        write_link(tmp.path(), LinkDirectory::IoLinks, 3, 3, (11, 4, 15));

        let node = KfdNode::initialize(tmp.path(), 3).unwrap();
        let numa = node.numa.unwrap();
        assert_eq!(numa.weight, 20);
        assert_eq!(numa.node, 1);
        assert_eq!(numa.link_type, KfdLinkType::PciExpress);

        assert_eq!(node.links.len(), 1);
        assert_eq!(node.link_weight(4).unwrap(), 15);
        assert_eq!(node.link_type(4).unwrap(), KfdLinkType::Xgmi);
        assert_eq!(node.link_weight(0).unwrap_err().status(), Status::InvalidArgs);
    }

    #[test]
    fn missing_hive_id_is_init_error() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("1");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("properties"), "location_id 1\ndomain 0\n").unwrap();
        fs::write(dir.join("gpu_id"), "5\n").unwrap();

        let err = KfdNode::initialize(tmp.path(), 1).unwrap_err();
        assert_eq!(err.status(), Status::InitError);
    }

    #[test]
    fn missing_cu_property_is_init_error() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("1");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("properties"), "hive_id 0\narray_count 4\n").unwrap();
        fs::write(dir.join("gpu_id"), "5\n").unwrap();

        let err = KfdNode::initialize(tmp.path(), 1).unwrap_err();
        assert_eq!(err.status(), Status::InitError);
    }

    #[test]
    fn overflowing_cu_count_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("1");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("properties"),
            "hive_id 0\nsimd_arrays_per_engine 4294967296\narray_count 4294967296\n\
             cu_per_simd_array 1\n",
        )
        .unwrap();
        fs::write(dir.join("gpu_id"), "5\n").unwrap();

        let err = KfdNode::initialize(tmp.path(), 1).unwrap_err();
        assert_eq!(err.status(), Status::UnexpectedData);
    }

    #[test]
    fn unreadable_p2p_links_leave_node_usable() {
        let tmp = TempDir::new().unwrap();
        write_gpu_node(tmp.path(), 1, 1234, 0x1a00, 0);
        fs::create_dir_all(tmp.path().join("1/p2p_links/0")).unwrap();

        let node = KfdNode::initialize(tmp.path(), 1).unwrap();
        assert!(node.p2p_links.is_empty());
        assert_eq!(node.cu_count, 120);
    }

    #[test]
    fn non_numeric_gpu_id_is_unexpected_data() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("0");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("gpu_id"), "abc\n").unwrap();
        assert_eq!(
            read_gpu_id(tmp.path(), 0).unwrap_err().status(),
            Status::UnexpectedData
        );
    }

    #[test]
    fn unsupported_nodes_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("0");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("properties"), "").unwrap();
        write_gpu_node(tmp.path(), 1, 7, 0x100, 1);

        let nodes = discover_kfd_nodes(tmp.path()).unwrap();
        assert_eq!(nodes.keys().copied().collect::<Vec<_>>(), vec![(1u64 << 32) | 0x100]);
    }
}
