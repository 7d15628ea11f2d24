//! Typed multigraph of one host's interconnect: accelerators, processors,
//! PCI bridges, fabric switches, NICs and network ports.
//!
//! Nodes live in fixed-capacity per-kind arrays and reference each other
//! through stable `(kind, index)` pairs, so removing a node during
//! normalization is an explicit index-remap rather than pointer surgery.

pub mod build;
pub mod paths;
pub mod query;
pub mod transform;

use serde::{Deserialize, Serialize};

use crate::cpuset::CpuSet;
use crate::devtree::TreeDecodeError;

/// Per-kind node capacity. Construction fails rather than grow past this.
pub const MAX_NODES: usize = 256;
/// Bound on logical ranks sharing one accelerator.
pub const MAX_RANKS_PER_GPU: usize = 8;
/// Width of a node's link to itself, and of anything considered free.
pub const LOC_WIDTH: f64 = 5000.0;

pub const KIND_COUNT: usize = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, strum_macros::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum NodeKind {
    Gpu,
    Pci,
    Switch,
    Cpu,
    Nic,
    Net,
}

impl NodeKind {
    pub const ALL: [NodeKind; KIND_COUNT] =
        [NodeKind::Gpu, NodeKind::Pci, NodeKind::Switch, NodeKind::Cpu, NodeKind::Nic, NodeKind::Net];

    pub fn slot(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum LinkKind {
    Loc,
    Fabric,
    Pci,
    Sys,
    Net,
}

/// Path quality classification, best first. `Disconnected` is the sentinel
/// for unreachable pairs. `PciDistant` is reserved for consumers that reroute
/// accelerator/network traffic through a peer accelerator; the base path
/// computation never emits it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, strum_macros::Display)]
pub enum PathTier {
    #[strum(serialize = "LOC")]
    Loc,
    #[strum(serialize = "FAB")]
    Fabric,
    #[strum(serialize = "FNB")]
    FabricBridged,
    #[strum(serialize = "PIX")]
    PciAdjacent,
    #[strum(serialize = "PXB")]
    PciBridged,
    #[strum(serialize = "PXD")]
    PciDistant,
    #[strum(serialize = "PHB")]
    HostBridged,
    #[strum(serialize = "SYS")]
    Sys,
    #[strum(serialize = "DIS")]
    Disconnected,
}

/// Stable handle into a [`TopoSystem`]'s per-kind node arrays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    pub kind: NodeKind,
    pub index: usize,
}

impl NodeRef {
    pub fn new(kind: NodeKind, index: usize) -> Self {
        Self { kind, index }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub kind: LinkKind,
    pub peer: NodeRef,
    pub width: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuArch {
    X86,
    Arm,
    Power,
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuVendor {
    Intel,
    Amd,
    Zhaoxin,
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuModel {
    Broadwell,
    Skylake,
    Zen,
    Rome,
    Yongfeng,
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GpuAttrs {
    pub dev: i64,
    pub ranks: Vec<i64>,
    pub comp_cap: i64,
    pub gdr: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CpuAttrs {
    pub arch: CpuArch,
    pub vendor: CpuVendor,
    pub model: CpuModel,
    pub affinity: CpuSet,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PciAttrs {
    /// Packed vendor/device/subsystem-vendor/subsystem-device signature,
    /// 16 bits each, high to low.
    pub device: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetAttrs {
    pub asic: u64,
    pub port: i64,
    pub width: f64,
    pub latency: f64,
    pub gdr: bool,
    pub max_channels: i64,
    pub coll: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NodeAttrs {
    Gpu(GpuAttrs),
    Cpu(CpuAttrs),
    Pci(PciAttrs),
    Net(NetAttrs),
    Switch,
    Nic,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub kind: NodeKind,
    pub id: u64,
    pub attrs: NodeAttrs,
    pub links: Vec<Link>,
}

impl Node {
    pub fn gpu(&self) -> Option<&GpuAttrs> {
        match &self.attrs {
            NodeAttrs::Gpu(g) => Some(g),
            _ => None,
        }
    }

    pub fn gpu_mut(&mut self) -> Option<&mut GpuAttrs> {
        match &mut self.attrs {
            NodeAttrs::Gpu(g) => Some(g),
            _ => None,
        }
    }

    pub fn cpu(&self) -> Option<&CpuAttrs> {
        match &self.attrs {
            NodeAttrs::Cpu(c) => Some(c),
            _ => None,
        }
    }

    pub fn cpu_mut(&mut self) -> Option<&mut CpuAttrs> {
        match &mut self.attrs {
            NodeAttrs::Cpu(c) => Some(c),
            _ => None,
        }
    }

    pub fn pci(&self) -> Option<&PciAttrs> {
        match &self.attrs {
            NodeAttrs::Pci(p) => Some(p),
            _ => None,
        }
    }

    pub fn pci_mut(&mut self) -> Option<&mut PciAttrs> {
        match &mut self.attrs {
            NodeAttrs::Pci(p) => Some(p),
            _ => None,
        }
    }

    pub fn net(&self) -> Option<&NetAttrs> {
        match &self.attrs {
            NodeAttrs::Net(n) => Some(n),
            _ => None,
        }
    }

    pub fn net_mut(&mut self) -> Option<&mut NetAttrs> {
        match &mut self.attrs {
            NodeAttrs::Net(n) => Some(n),
            _ => None,
        }
    }
}

/// Reachability summary for one ordered node pair.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PathSummary {
    pub tier: PathTier,
    pub width: f64,
    pub hops: usize,
}

impl PathSummary {
    pub const DISCONNECTED: PathSummary =
        PathSummary { tier: PathTier::Disconnected, width: 0.0, hops: 0 };

    pub fn is_connected(&self) -> bool {
        self.tier != PathTier::Disconnected
    }
}

/// Per-source table of path summaries, indexed by destination kind and index.
#[derive(Clone, Debug, Default)]
pub struct PathTable {
    by_kind: [Vec<PathSummary>; KIND_COUNT],
}

impl PathTable {
    pub fn get(&self, kind: NodeKind) -> &[PathSummary] {
        &self.by_kind[kind.slot()]
    }

    pub(crate) fn get_mut(&mut self, kind: NodeKind) -> &mut Vec<PathSummary> {
        &mut self.by_kind[kind.slot()]
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TopoError {
    #[error("too many nodes of kind {kind} (capacity {MAX_NODES})")]
    CapacityExceeded { kind: NodeKind },
    #[error("no {kind} node with id {id:#x}")]
    UnresolvedReference { kind: NodeKind, id: u64 },
    #[error("no GPU owns rank {0}")]
    RankNotFound(i64),
    #[error("no GPU with device index {0}")]
    DevNotFound(i64),
    #[error("topology has no GPU nodes")]
    NoGpu,
    #[error("topology has no processor nodes")]
    NoCpu,
    #[error(transparent)]
    Tree(#[from] TreeDecodeError),
}

/// One host's finished interconnect graph. Mutated only while the builder and
/// the normalization passes run; immutable (and freely shared across threads)
/// once paths are computed.
#[derive(Debug, Default)]
pub struct TopoSystem {
    nodes: [Vec<Node>; KIND_COUNT],
    paths: [Vec<PathTable>; KIND_COUNT],
    max_width: f64,
    total_width: f64,
}

impl TopoSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self, kind: NodeKind) -> &[Node] {
        &self.nodes[kind.slot()]
    }

    pub fn node(&self, r: NodeRef) -> &Node {
        &self.nodes[r.kind.slot()][r.index]
    }

    pub fn node_mut(&mut self, r: NodeRef) -> &mut Node {
        &mut self.nodes[r.kind.slot()][r.index]
    }

    pub fn count(&self, kind: NodeKind) -> usize {
        self.nodes[kind.slot()].len()
    }

    pub fn max_width(&self) -> f64 {
        self.max_width
    }

    pub fn total_width(&self) -> f64 {
        self.total_width
    }

    pub(crate) fn set_widths(&mut self, max_width: f64, total_width: f64) {
        self.max_width = max_width;
        self.total_width = total_width;
    }

    /// Path summary from `src` to `dst`. Panics if called before path
    /// computation has filled the tables.
    pub fn path(&self, src: NodeRef, dst: NodeRef) -> &PathSummary {
        &self.paths[src.kind.slot()][src.index].get(dst.kind)[dst.index]
    }

    pub fn path_table(&self, src: NodeRef) -> &PathTable {
        &self.paths[src.kind.slot()][src.index]
    }

    pub(crate) fn reset_path_tables(&mut self) {
        for kind in NodeKind::ALL {
            let count = self.count(kind);
            let tables = &mut self.paths[kind.slot()];
            tables.clear();
            tables.resize_with(count, PathTable::default);
            for table in tables.iter_mut() {
                for dst_kind in NodeKind::ALL {
                    let dst_count = self.nodes[dst_kind.slot()].len();
                    let v = table.get_mut(dst_kind);
                    v.clear();
                    v.resize(dst_count, PathSummary::DISCONNECTED);
                }
            }
        }
    }

    pub(crate) fn path_mut(&mut self, src: NodeRef, dst: NodeRef) -> &mut PathSummary {
        &mut self.paths[src.kind.slot()][src.index].get_mut(dst.kind)[dst.index]
    }

    /// Look up a node by id within its kind.
    pub fn get_node(&self, kind: NodeKind, id: u64) -> Option<NodeRef> {
        self.nodes(kind).iter().position(|n| n.id == id).map(|i| NodeRef::new(kind, i))
    }

    pub fn id_to_index(&self, kind: NodeKind, id: u64) -> Result<usize, TopoError> {
        self.nodes(kind)
            .iter()
            .position(|n| n.id == id)
            .ok_or(TopoError::UnresolvedReference { kind, id })
    }

    /// Discovery-order index of the GPU node owning `rank`.
    pub fn rank_to_index(&self, rank: i64) -> Result<usize, TopoError> {
        self.nodes(NodeKind::Gpu)
            .iter()
            .position(|n| n.gpu().is_some_and(|g| g.ranks.contains(&rank)))
            .ok_or(TopoError::RankNotFound(rank))
    }

    /// Create a node, enforcing the per-kind capacity. GPU nodes get their
    /// zero-cost self-link immediately.
    pub fn create_node(&mut self, kind: NodeKind, id: u64, attrs: NodeAttrs) -> Result<NodeRef, TopoError> {
        let list = &mut self.nodes[kind.slot()];
        if list.len() == MAX_NODES {
            return Err(TopoError::CapacityExceeded { kind });
        }
        let index = list.len();
        let mut node = Node { kind, id, attrs, links: Vec::new() };
        if kind == NodeKind::Gpu {
            node.links.push(Link {
                kind: LinkKind::Loc,
                peer: NodeRef::new(kind, index),
                width: LOC_WIDTH,
            });
        }
        list.push(node);
        Ok(NodeRef::new(kind, index))
    }

    /// Add `width` to the link `node -> peer` of the given kind, creating it
    /// if absent, then restore descending-width adjacency order. Parallel
    /// links of one kind always aggregate into a single entry.
    pub fn connect_nodes(&mut self, node: NodeRef, peer: NodeRef, kind: LinkKind, width: f64) {
        let links = &mut self.node_mut(node).links;
        let pos = links.iter().position(|l| l.peer == peer && l.kind == kind);
        let mut pos = match pos {
            Some(p) => {
                links[p].width += width;
                p
            }
            None => {
                links.push(Link { kind, peer, width });
                links.len() - 1
            }
        };
        // Float the updated link up past strictly narrower ones; equal widths
        // keep insertion order.
        while pos > 0 && links[pos - 1].width < links[pos].width {
            links.swap(pos - 1, pos);
            pos -= 1;
        }
    }

    /// Remove one node and remap every stored reference to the shifted
    /// indices in the same pass. Links pointing at the removed node are
    /// dropped everywhere.
    pub fn remove_node(&mut self, kind: NodeKind, index: usize) {
        let removed = NodeRef::new(kind, index);
        for k in NodeKind::ALL {
            for node in self.nodes[k.slot()].iter_mut() {
                node.links.retain(|l| l.peer != removed);
                for link in node.links.iter_mut() {
                    if link.peer.kind == kind && link.peer.index > index {
                        link.peer.index -= 1;
                    }
                }
            }
        }
        self.nodes[kind.slot()].remove(index);
    }
}
