//! Human-readable topology logging: one walk over the graph from each
//! processor root, then the precomputed path tables at debug level.

use crate::graph::{LinkKind, NodeAttrs, NodeKind, NodeRef, TopoSystem};

fn node_label(system: &TopoSystem, r: NodeRef) -> String {
    let node = system.node(r);
    match &node.attrs {
        NodeAttrs::Gpu(g) => {
            let ranks: Vec<String> = g.ranks.iter().map(|r| r.to_string()).collect();
            format!("{}/{:x} ({})", node.kind, node.id, ranks.join("/"))
        }
        NodeAttrs::Cpu(c) => {
            format!("{}/{:x} ({:?}/{:?}/{:?})", node.kind, node.id, c.arch, c.vendor, c.model)
        }
        NodeAttrs::Pci(p) => format!("{}/{:x} ({:x})", node.kind, node.id, p.device),
        NodeAttrs::Net(n) => {
            format!("{}/{:x} ({:x}/{}/{:.1})", node.kind, node.id, n.asic, n.port, n.width)
        }
        NodeAttrs::Switch | NodeAttrs::Nic => format!("{}/{:x}", node.kind, node.id),
    }
}

fn log_subtree(system: &TopoSystem, node: NodeRef, prev: Option<NodeRef>, offset: usize) {
    log::info!("{:offset$}{}", "", node_label(system, node));
    for link in &system.node(node).links {
        if link.kind == LinkKind::Loc {
            continue;
        }
        if link.kind == LinkKind::Pci && Some(link.peer) == prev {
            continue;
        }
        log::info!("{:offset$}+ {}[{:.1}] - {}", "", link.kind, link.width, node_label(system, link.peer));
        if link.kind == LinkKind::Pci {
            log_subtree(system, link.peer, Some(node), offset + 2);
        }
    }
}

pub fn log_topology(system: &TopoSystem) {
    log::info!(
        "=== System : maxWidth {:.1} totalWidth {:.1} ===",
        system.max_width(),
        system.total_width()
    );
    for c in 0..system.count(NodeKind::Cpu) {
        log_subtree(system, NodeRef::new(NodeKind::Cpu, c), None, 0);
    }
    log::info!("==========================================");
}

pub fn log_paths(system: &TopoSystem) {
    for src_kind in NodeKind::ALL {
        for src_idx in 0..system.count(src_kind) {
            let src = NodeRef::new(src_kind, src_idx);
            for dst_kind in NodeKind::ALL {
                for dst_idx in 0..system.count(dst_kind) {
                    let dst = NodeRef::new(dst_kind, dst_idx);
                    let path = system.path(src, dst);
                    if !path.is_connected() || src == dst {
                        continue;
                    }
                    log::debug!(
                        "{} -> {} : {} width {:.1} hops {}",
                        node_label(system, src),
                        node_label(system, dst),
                        path.tier,
                        path.width,
                        path.hops
                    );
                }
            }
        }
    }
}
