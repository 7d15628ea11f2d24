pub mod cpuset;
pub mod devtree;
pub mod graph;
pub mod report;

pub use cpuset::CpuSet;
pub use devtree::{DeviceNode, DeviceTree, TreeDecodeError};
pub use graph::build::system_from_tree;
pub use graph::{
    Link, LinkKind, Node, NodeAttrs, NodeKind, NodeRef, PathSummary, PathTier, TopoError, TopoSystem,
};
