//! All-pairs best-path computation.
//!
//! For every source node, a widest-path relaxation over the lexicographic key
//! (tier ascending, width descending, hop count ascending). A candidate
//! replaces the stored summary only on strict improvement, so equally good
//! paths resolve to the first one discovered and the sweep is deterministic.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::graph::{
    Link, LinkKind, NodeKind, NodeRef, PathSummary, PathTier, TopoSystem, LOC_WIDTH,
};

#[derive(Clone, Copy, Debug)]
struct Candidate {
    tier: PathTier,
    width: f64,
    hops: usize,
    seq: u64,
    node: NodeRef,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    // Max-heap: "greater" means better (lower tier, wider, fewer hops,
    // earlier discovery).
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .tier
            .cmp(&self.tier)
            .then_with(|| self.width.total_cmp(&other.width))
            .then_with(|| other.hops.cmp(&self.hops))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Tier contributed by traversing `link` out of `tail` on a path rooted at
/// `src`.
fn edge_tier(tail: NodeRef, link: &Link, src: NodeRef) -> PathTier {
    match link.kind {
        // Self-links are free; network edges don't factor into the
        // port-to-accelerator classification.
        LinkKind::Loc | LinkKind::Net => PathTier::Loc,
        LinkKind::Sys => PathTier::Sys,
        LinkKind::Fabric => {
            // A fabric hop leaving an accelerator other than the source
            // means the path is being forwarded through that accelerator.
            if tail.kind == NodeKind::Gpu && tail != src {
                PathTier::FabricBridged
            } else {
                PathTier::Fabric
            }
        }
        LinkKind::Pci => {
            if tail.kind == NodeKind::Pci && link.peer.kind == NodeKind::Pci {
                PathTier::PciBridged
            } else if tail.kind == NodeKind::Cpu || link.peer.kind == NodeKind::Cpu {
                PathTier::HostBridged
            } else {
                PathTier::PciAdjacent
            }
        }
    }
}

fn improves(tier: PathTier, width: f64, hops: usize, best: &PathSummary) -> bool {
    tier < best.tier
        || (tier == best.tier && width > best.width)
        || (tier == best.tier && width == best.width && hops < best.hops)
}

fn relax_from(system: &mut TopoSystem, src: NodeRef) {
    let mut heap = BinaryHeap::new();
    let mut seq = 0u64;
    *system.path_mut(src, src) = PathSummary { tier: PathTier::Loc, width: LOC_WIDTH, hops: 0 };
    heap.push(Candidate { tier: PathTier::Loc, width: LOC_WIDTH, hops: 0, seq, node: src });

    while let Some(cand) = heap.pop() {
        let best = *system.path(src, cand.node);
        // Superseded queue entry.
        if cand.tier != best.tier || cand.width != best.width || cand.hops != best.hops {
            continue;
        }
        let links = system.node(cand.node).links.clone();
        for link in &links {
            let tier = edge_tier(cand.node, link, src).max(cand.tier);
            let width = cand.width.min(link.width);
            let hops = cand.hops + 1;
            let entry = system.path_mut(src, link.peer);
            if improves(tier, width, hops, entry) {
                *entry = PathSummary { tier, width, hops };
                seq += 1;
                heap.push(Candidate { tier, width, hops, seq, node: link.peer });
            }
        }
    }
}

/// Whole-graph bandwidth scalars consumed by downstream tuning: the best
/// accelerator egress width (to a network port when any exist, to a peer
/// accelerator otherwise), maximized and summed across accelerators.
fn derive_widths(system: &mut TopoSystem) {
    let gpu_count = system.count(NodeKind::Gpu);
    let net_count = system.count(NodeKind::Net);
    if gpu_count == 0 {
        system.set_widths(0.0, 0.0);
        return;
    }
    if gpu_count == 1 && net_count == 0 {
        system.set_widths(LOC_WIDTH, LOC_WIDTH);
        return;
    }
    let mut max_width = 0.0f64;
    let mut total_width = 0.0f64;
    for g in 0..gpu_count {
        let src = NodeRef::new(NodeKind::Gpu, g);
        let mut best = 0.0f64;
        if net_count > 0 {
            for n in 0..net_count {
                best = best.max(system.path(src, NodeRef::new(NodeKind::Net, n)).width);
            }
        } else {
            for p in 0..gpu_count {
                if p != g {
                    best = best.max(system.path(src, NodeRef::new(NodeKind::Gpu, p)).width);
                }
            }
        }
        max_width = max_width.max(best);
        total_width += best;
    }
    system.set_widths(max_width, total_width);
}

/// Fill every node's path table. After this returns the system is complete
/// and treated as immutable.
pub fn compute(system: &mut TopoSystem) {
    system.reset_path_tables();
    for kind in NodeKind::ALL {
        for index in 0..system.count(kind) {
            relax_from(system, NodeRef::new(kind, index));
        }
    }
    derive_widths(system);
}
