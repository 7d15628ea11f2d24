//! Read-only placement queries over a finished topology. Safe to call
//! concurrently; nothing here mutates the system.

use crate::cpuset::CpuSet;
use crate::graph::{CpuArch, CpuModel, CpuVendor, NodeKind, NodeRef, PathTier, TopoError, TopoSystem};

/// Pick the network port closest to the accelerator owning `rank`: widest
/// path first, then best tier. Equally good candidates are spread across
/// devices by `dev mod candidates` so co-located ranks fan out instead of
/// piling onto one port. `None` when the host has no network ports.
pub fn local_net(system: &TopoSystem, rank: i64) -> Result<Option<i64>, TopoError> {
    let g = system.rank_to_index(rank)?;
    let gpu = NodeRef::new(NodeKind::Gpu, g);

    let mut max_width = 0.0f64;
    let mut min_tier = PathTier::Sys;
    let mut nets: Vec<i64> = Vec::new();
    for n in 0..system.count(NodeKind::Net) {
        let path = system.path(NodeRef::new(NodeKind::Net, n), gpu);
        if path.width > max_width || (path.width == max_width && path.tier < min_tier) {
            max_width = path.width;
            min_tier = path.tier;
            nets.clear();
        }
        if path.width == max_width && path.tier == min_tier {
            nets.push(system.nodes(NodeKind::Net)[n].id as i64);
        }
    }
    if nets.is_empty() {
        return Ok(None);
    }
    let dev = system.nodes(NodeKind::Gpu)[g].gpu().map_or(0, |a| a.dev);
    let pick = dev.rem_euclid(nets.len() as i64) as usize;
    Ok(Some(nets[pick]))
}

/// Affinity mask for the processor nearest (fewest hops) to the accelerator
/// owning `rank`, intersected with the caller's granted mask unless told to
/// ignore it.
pub fn cpu_affinity(
    system: &TopoSystem,
    rank: i64,
    granted: &CpuSet,
    ignore_granted: bool,
) -> Result<CpuSet, TopoError> {
    let g = system.rank_to_index(rank)?;
    let gpu = NodeRef::new(NodeKind::Gpu, g);

    let mut nearest: Option<(usize, usize)> = None;
    for c in 0..system.count(NodeKind::Cpu) {
        let path = system.path(gpu, NodeRef::new(NodeKind::Cpu, c));
        if !path.is_connected() {
            continue;
        }
        if nearest.is_none_or(|(hops, _)| path.hops < hops) {
            nearest = Some((path.hops, c));
        }
    }
    let Some((_, c)) = nearest else {
        return Err(TopoError::NoCpu);
    };

    let cpu_mask = system.nodes(NodeKind::Cpu)[c]
        .cpu()
        .map_or_else(CpuSet::new, |attrs| attrs.affinity);
    let mask = if ignore_granted { cpu_mask } else { cpu_mask.intersect(granted) };
    if !mask.is_empty() {
        let dev = system.nodes(NodeKind::Gpu)[g].gpu().map_or(-1, |a| a.dev);
        log::info!("affinity for GPU {dev} set to {mask}");
    }
    Ok(mask)
}

/// Minimum and maximum compute capability across all accelerators.
pub fn comp_cap_range(system: &TopoSystem) -> Result<(i64, i64), TopoError> {
    let gpus = system.nodes(NodeKind::Gpu);
    let mut caps = gpus.iter().filter_map(|n| n.gpu()).map(|g| g.comp_cap);
    let first = caps.next().ok_or(TopoError::NoGpu)?;
    let (min, max) = caps.fold((first, first), |(lo, hi), cc| (lo.min(cc), hi.max(cc)));
    Ok((min, max))
}

/// Discovery-order index of the accelerator owning `rank`.
pub fn local_rank(system: &TopoSystem, rank: i64) -> Result<usize, TopoError> {
    system.rank_to_index(rank)
}

pub fn net_count(system: &TopoSystem) -> usize {
    system.count(NodeKind::Net)
}

/// Classification of the first discovered processor.
pub fn cpu_kind(system: &TopoSystem) -> Result<(CpuArch, CpuVendor, CpuModel), TopoError> {
    system
        .nodes(NodeKind::Cpu)
        .first()
        .and_then(|n| n.cpu())
        .map(|c| (c.arch, c.vendor, c.model))
        .ok_or(TopoError::NoCpu)
}

/// First logical rank bound to the accelerator with device index `dev`.
pub fn dev_to_rank(system: &TopoSystem, dev: i64) -> Result<i64, TopoError> {
    system
        .nodes(NodeKind::Gpu)
        .iter()
        .filter_map(|n| n.gpu())
        .find(|g| g.dev == dev)
        .and_then(|g| g.ranks.first().copied())
        .ok_or(TopoError::DevNotFound(dev))
}
