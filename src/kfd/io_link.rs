use crate::error::{RsmiError, RsmiResult};
use crate::sysfs;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::debug;

// ===============================================================================================
// Link types
// ===============================================================================================

/// Link type as reported in a KFD io_link `properties` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KfdLinkType {
    Undefined,
    HyperTransport,
    PciExpress,
    Amba,
    Mipi,
    Qpi11,
    RapidIo,
    Infiniband,
    Xgmi,
    Xgop,
    Gz,
    EthernetRdma,
    RdmaOther,
    Other,
    Unknown(u64),
}

impl From<u64> for KfdLinkType {
    fn from(raw: u64) -> Self {
        match raw {
            0 => Self::Undefined,
            1 => Self::HyperTransport,
            2 => Self::PciExpress,
            3 => Self::Amba,
            4 => Self::Mipi,
            5 => Self::Qpi11,
            8 => Self::RapidIo,
            9 => Self::Infiniband,
            11 => Self::Xgmi,
            12 => Self::Xgop,
            13 => Self::Gz,
            14 => Self::EthernetRdma,
            15 => Self::RdmaOther,
            16 => Self::Other,
            n => Self::Unknown(n),
        }
    }
}

/// Link type exposed through the public topology API (`RSMI_IO_LINK_TYPE`).
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkType {
    Undefined = 0,
    PciExpress = 1,
    Xgmi = 2,
}

impl From<KfdLinkType> for LinkType {
    fn from(kfd: KfdLinkType) -> Self {
        match kfd {
            KfdLinkType::PciExpress => Self::PciExpress,
            KfdLinkType::Xgmi => Self::Xgmi,
            _ => Self::Undefined,
        }
    }
}

/// Which per-node directory a link was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkDirectory {
    IoLinks,
    P2pLinks,
}

impl LinkDirectory {
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::IoLinks => "io_links",
            Self::P2pLinks => "p2p_links",
        }
    }
}

// ===============================================================================================
// IoLink
// ===============================================================================================

const REQUIRED_KEYS: [&str; 6] = [
    "type",
    "node_from",
    "node_to",
    "weight",
    "min_bandwidth",
    "max_bandwidth",
];

/// One topology edge read from `<node>/<io_links|p2p_links>/<link>/properties`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoLink {
    pub node_indx: u32,
    pub link_indx: u32,
    pub directory: LinkDirectory,
    pub link_type: KfdLinkType,
    pub node_from: u32,
    pub node_to: u32,
    pub weight: u64,
    pub min_bandwidth: u64,
    pub max_bandwidth: u64,
}

impl IoLink {
    /// Reads and validates one link.
    ///
    /// # Errors
    /// Fails if the properties file cannot be read or any required key is absent.
    pub fn read(
        nodes_root: &Path,
        node_indx: u32,
        link_indx: u32,
        directory: LinkDirectory,
    ) -> RsmiResult<Self> {
        let path = nodes_root
            .join(node_indx.to_string())
            .join(directory.dir_name())
            .join(link_indx.to_string())
            .join("properties");
        let props = sysfs::read_properties(&path)?;
        Self::from_properties(&path, node_indx, link_indx, directory, &props)
    }

    fn from_properties(
        path: &Path,
        node_indx: u32,
        link_indx: u32,
        directory: LinkDirectory,
        props: &HashMap<String, u64>,
    ) -> RsmiResult<Self> {
        let mut values = [0u64; REQUIRED_KEYS.len()];
        for (slot, key) in values.iter_mut().zip(REQUIRED_KEYS) {
            *slot = *props
                .get(key)
                .ok_or_else(|| RsmiError::parse(path, format!("missing io-link key {key:?}")))?;
        }
        let [link_type, node_from, node_to, weight, min_bandwidth, max_bandwidth] = values;

        let narrow = |v: u64, key: &str| {
            u32::try_from(v)
                .map_err(|_| RsmiError::parse(path, format!("{key} out of range: {v}")))
        };

        Ok(Self {
            node_indx,
            link_indx,
            directory,
            link_type: KfdLinkType::from(link_type),
            node_from: narrow(node_from, "node_from")?,
            node_to: narrow(node_to, "node_to")?,
            weight,
            min_bandwidth,
            max_bandwidth,
        })
    }
}

// ===============================================================================================
// Discovery
// ===============================================================================================

/// All links of one node, keyed by `node_to`.
///
/// A missing link directory is not an error; the node simply has no links of that kind.
pub fn discover_node_links(
    nodes_root: &Path,
    node_indx: u32,
    directory: LinkDirectory,
) -> RsmiResult<BTreeMap<u32, IoLink>> {
    let dir = nodes_root
        .join(node_indx.to_string())
        .join(directory.dir_name());
    let mut links = BTreeMap::new();
    for (link_indx, _) in sysfs::numeric_entries(&dir) {
        let link = IoLink::read(nodes_root, node_indx, link_indx, directory)?;
        links.insert(link.node_to, link);
    }
    Ok(links)
}

/// Links of every node, keyed by `(node_from, node_to)`.
pub fn discover_links(
    nodes_root: &Path,
    directory: LinkDirectory,
) -> RsmiResult<BTreeMap<(u32, u32), IoLink>> {
    let mut links = BTreeMap::new();
    for (node_indx, _) in sysfs::numeric_entries(nodes_root) {
        for (_, link) in discover_node_links(nodes_root, node_indx, directory)? {
            links.insert((link.node_from, link.node_to), link);
        }
    }
    debug!(count = links.len(), kind = directory.dir_name(), "discovered topology links");
    Ok(links)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::Status;
    use std::fs;
    use tempfile::TempDir;

    pub(crate) fn write_link(
        nodes_root: &Path,
        dir: LinkDirectory,
        node: u32,
        link: u32,
        (ty, to, weight): (u64, u32, u64),
    ) {
        let path = nodes_root
            .join(node.to_string())
            .join(dir.dir_name())
            .join(link.to_string());
        fs::create_dir_all(&path).unwrap();
        fs::write(
            path.join("properties"),
            format!(
                "type {ty}\nversion_major 0\nnode_from {node}\nnode_to {to}\nweight {weight}\n\
                 min_latency 0\nmin_bandwidth 312\nmax_bandwidth 50000\nflags 1\n"
            ),
        )
        .unwrap();
    }

    #[test]
    fn reads_complete_link() {
        let dir = TempDir::new().unwrap();
        write_link(dir.path(), LinkDirectory::IoLinks, 1, 0, (11, 2, 15));

        let link = IoLink::read(dir.path(), 1, 0, LinkDirectory::IoLinks).unwrap();
        assert_eq!(link.link_type, KfdLinkType::Xgmi);
        assert_eq!(LinkType::from(link.link_type), LinkType::Xgmi);
        assert_eq!((link.node_from, link.node_to, link.weight), (1, 2, 15));
        assert_eq!((link.min_bandwidth, link.max_bandwidth), (312, 50000));
    }

    #[test]
    fn missing_key_is_hard_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0/io_links/0");
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("properties"), "type 2\nnode_from 0\nnode_to 1\n").unwrap();

        let err = IoLink::read(dir.path(), 0, 0, LinkDirectory::IoLinks).unwrap_err();
        assert_eq!(err.status(), Status::UnexpectedData);
    }

    #[test]
    fn discovers_per_node_and_global() {
        let dir = TempDir::new().unwrap();
        write_link(dir.path(), LinkDirectory::IoLinks, 0, 0, (2, 1, 20));
        write_link(dir.path(), LinkDirectory::IoLinks, 1, 0, (2, 0, 20));
        write_link(dir.path(), LinkDirectory::IoLinks, 1, 1, (11, 2, 15));
        fs::create_dir_all(dir.path().join("2")).unwrap();

        let per_node = discover_node_links(dir.path(), 1, LinkDirectory::IoLinks).unwrap();
        assert_eq!(per_node.keys().copied().collect::<Vec<_>>(), vec![0, 2]);

        let all = discover_links(dir.path(), LinkDirectory::IoLinks).unwrap();
        assert!(all.contains_key(&(0, 1)));
        assert!(all.contains_key(&(1, 2)));
        assert_eq!(all.len(), 3);

        let p2p = discover_links(dir.path(), LinkDirectory::P2pLinks).unwrap();
        assert!(p2p.is_empty());
    }
}
