//! Structural normalization passes, run once after the builder and before
//! path computation: switch flattening, processor interconnection, and
//! deterministic adjacency ordering.

use crate::graph::{
    CpuArch, CpuAttrs, CpuModel, CpuVendor, Link, LinkKind, NodeKind, NodeRef, TopoError, TopoSystem,
};

/// Matched signature of switch chipsets that report a spurious two-level
/// hierarchy for a single physical part (full bandwidth across all ports).
const FLATTEN_SIG_MASK: u64 = 0xffff_ffff_ffff_f000;
const FLATTEN_SIG_MATCH: u64 = 0x1000_c010_1000_a000;
/// Signature written back after flattening so the switch never matches twice.
const FLATTEN_SIG_REWRITE: u64 = 0x1000_c010_1000_0000;

const POWER_SYS_WIDTH: f64 = 32.0;
const ARM_SYS_WIDTH: f64 = 6.0;
const INTEL_SKL_SYS_WIDTH: f64 = 9.0;
const ZHAOXIN_YONGFENG_SYS_WIDTH: f64 = 9.0;
/// Cross-processor bandwidth assumed for anything not in the tables.
const SYS_WIDTH_BASELINE: f64 = 6.0;

pub fn run(system: &mut TopoSystem) -> Result<(), TopoError> {
    flatten_pci_switches(system)?;
    connect_cpus(system);
    sort_system(system);
    Ok(())
}

/// Fuse two-level switches: splice each same-signature child bridge's edges
/// directly onto its parent, drop the child, rewrite the parent signature.
/// The scan restarts from the top after every fuse since indices shift.
pub fn flatten_pci_switches(system: &mut TopoSystem) -> Result<(), TopoError> {
    let mut s = 0;
    while s < system.count(NodeKind::Pci) {
        let node = &system.nodes(NodeKind::Pci)[s];
        let sig = node.pci().map_or(0, |p| p.device);
        if sig & FLATTEN_SIG_MASK != FLATTEN_SIG_MATCH {
            s += 1;
            continue;
        }
        let parent_id = node.id;
        let sub_ids: Vec<u64> = node
            .links
            .iter()
            .filter(|l| l.peer.kind == NodeKind::Pci)
            .filter(|l| system.node(l.peer).pci().is_some_and(|p| p.device == sig))
            .map(|l| system.node(l.peer).id)
            .collect();

        for sub_id in sub_ids {
            let parent_idx = system.id_to_index(NodeKind::Pci, parent_id)?;
            let sub_idx = system.id_to_index(NodeKind::Pci, sub_id)?;
            let parent = NodeRef::new(NodeKind::Pci, parent_idx);
            let sub = NodeRef::new(NodeKind::Pci, sub_idx);

            let sub_links = system.node(sub).links.clone();
            for link in sub_links {
                if link.peer == parent {
                    continue;
                }
                system
                    .node_mut(parent)
                    .links
                    .push(Link { kind: link.kind, peer: link.peer, width: link.width });
                for back in system.node_mut(link.peer).links.iter_mut() {
                    if back.peer == sub {
                        back.peer = parent;
                        break;
                    }
                }
            }
            // Drops the parent's own edge to the child and remaps indices.
            system.remove_node(NodeKind::Pci, sub_idx);
        }

        let parent_idx = system.id_to_index(NodeKind::Pci, parent_id)?;
        if let Some(pci) = system.node_mut(NodeRef::new(NodeKind::Pci, parent_idx)).pci_mut() {
            pci.device = FLATTEN_SIG_REWRITE;
        }
        log::debug!("flattened switch {parent_id:#x}");
        s = 0;
    }
    Ok(())
}

fn inter_cpu_width(cpu: &CpuAttrs) -> f64 {
    match (cpu.arch, cpu.vendor) {
        (CpuArch::Power, _) => POWER_SYS_WIDTH,
        (CpuArch::Arm, _) => ARM_SYS_WIDTH,
        (CpuArch::X86, CpuVendor::Intel) => {
            if cpu.model == CpuModel::Skylake {
                INTEL_SKL_SYS_WIDTH
            } else {
                SYS_WIDTH_BASELINE
            }
        }
        (CpuArch::X86, CpuVendor::Zhaoxin) => {
            if cpu.model == CpuModel::Yongfeng {
                ZHAOXIN_YONGFENG_SYS_WIDTH
            } else {
                SYS_WIDTH_BASELINE
            }
        }
        _ => SYS_WIDTH_BASELINE,
    }
}

/// Interconnect every pair of distinct processors with a system-tier link.
pub fn connect_cpus(system: &mut TopoSystem) {
    let count = system.count(NodeKind::Cpu);
    for n in 0..count {
        for p in 0..count {
            if n == p {
                continue;
            }
            let width = system.nodes(NodeKind::Cpu)[n].cpu().map_or(SYS_WIDTH_BASELINE, inter_cpu_width);
            system.connect_nodes(
                NodeRef::new(NodeKind::Cpu, n),
                NodeRef::new(NodeKind::Cpu, p),
                LinkKind::Sys,
                width,
            );
        }
    }
}

/// Canonical adjacency order for traversal: fabric links first, then PCI
/// descent, then the PCI link back up, with system links last. Achieved by
/// rotating each node's uplink to the end while descending the PCI tree from
/// every processor root.
pub fn sort_system(system: &mut TopoSystem) {
    for c in 0..system.count(NodeKind::Cpu) {
        sort_subtree(system, NodeRef::new(NodeKind::Cpu, c), None);
    }
}

fn sort_subtree(system: &mut TopoSystem, node: NodeRef, up: Option<NodeRef>) {
    if let Some(up) = up {
        let links = &mut system.node_mut(node).links;
        if let Some(pos) = links.iter().position(|l| l.peer == up) {
            let up_link = links.remove(pos);
            links.push(up_link);
        }
    }
    let children: Vec<NodeRef> = system
        .node(node)
        .links
        .iter()
        .filter(|l| l.kind == LinkKind::Pci && Some(l.peer) != up)
        .map(|l| l.peer)
        .collect();
    for child in children {
        sort_subtree(system, child, Some(node));
    }
}
