//! Graph builder: attributed device tree in, populated [`TopoSystem`] out.

use std::collections::HashSet;

use crate::cpuset::CpuSet;
use crate::devtree::{bus_id_to_u64, DeviceNode, DeviceTree, TreeDecodeError, MAX_TREE_DEPTH};
use crate::graph::{
    paths, transform, CpuArch, CpuAttrs, CpuModel, CpuVendor, GpuAttrs, LinkKind, NetAttrs, NodeAttrs,
    NodeKind, NodeRef, PciAttrs, TopoError, TopoSystem, LOC_WIDTH, MAX_RANKS_PER_GPU,
};

/// Lanes assumed when the tree does not declare a PCI link width.
const DEFAULT_PCI_LANES: i64 = 16;
/// Per-lane rates in hundred-Mbps units, keyed by link-generation prefix.
/// Divided by 80 to land on bandwidth units per `lanes * rate / 80`.
const PCI_GEN_RATES: &[(&str, i64)] = &[
    ("2.5 GT/s", 15),
    ("5 GT/s", 30),
    ("5.0 GT/s", 30),
    ("8 GT/s", 60),
    ("8.0 GT/s", 60),
    ("16 GT/s", 120),
    ("16.0 GT/s", 120),
    ("32 GT/s", 240),
    ("32.0 GT/s", 240),
    ("64 GT/s", 480),
    ("64.0 GT/s", 480),
];
const DEFAULT_PCI_GEN_RATE: i64 = 60;
const PCI_RATE_DIVISOR: f64 = 80.0;

/// Port speeds arrive in Mbps; some adapters report -1 for "unknown".
const DEFAULT_NET_SPEED_MBPS: i64 = 10_000;
const NET_SPEED_DIVISOR: f64 = 8_000.0;
const DEFAULT_MAX_CHANNELS: i64 = 32;

const PCI_CLASSES: &[(&str, NodeKind)] = &[
    ("0x060400", NodeKind::Pci),
    ("0x068000", NodeKind::Switch),
    ("0x068001", NodeKind::Cpu),
    ("0x03", NodeKind::Gpu),
    ("0x02", NodeKind::Nic),
];

fn kv_prefix_match<T: Copy>(s: &str, table: &[(&str, T)], default: T) -> T {
    for (prefix, value) in table {
        if s.starts_with(prefix) {
            return *value;
        }
    }
    default
}

/// Per-link fabric rate by accelerator generation (compute capability).
fn fabric_link_width(comp_cap: i64) -> f64 {
    if comp_cap == 86 {
        12.0
    } else if comp_cap >= 70 {
        22.0
    } else {
        18.0
    }
}

fn pci_edge_width(pci: &DeviceNode) -> Result<f64, TreeDecodeError> {
    let mut lanes = pci.attr_i64_default("link_width", 0)?;
    if lanes == 0 {
        lanes = DEFAULT_PCI_LANES;
    }
    let rate = match pci.attr("link_speed") {
        Some(s) => kv_prefix_match(s, PCI_GEN_RATES, DEFAULT_PCI_GEN_RATE),
        None => DEFAULT_PCI_GEN_RATE,
    };
    Ok(lanes as f64 * rate as f64 / PCI_RATE_DIVISOR)
}

fn parse_ranks(gpu: &DeviceNode) -> Option<Vec<i64>> {
    let raw = gpu.attr("rank")?;
    let mut ranks = Vec::new();
    for token in raw.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let Ok(rank) = token.parse::<i64>() else {
            log::warn!("skipping GPU with malformed rank list \"{raw}\"");
            return None;
        };
        if ranks.len() == MAX_RANKS_PER_GPU {
            log::warn!("GPU rank list \"{raw}\" exceeds {MAX_RANKS_PER_GPU} ranks, truncating");
            break;
        }
        ranks.push(rank);
    }
    if ranks.is_empty() { None } else { Some(ranks) }
}

fn add_gpu_node(system: &mut TopoSystem, xml_gpu: &DeviceNode, bus_id: u64) -> Result<Option<NodeRef>, TopoError> {
    let Some(ranks) = parse_ranks(xml_gpu) else {
        return Ok(None);
    };
    let Some(dev) = xml_gpu.attr("dev") else {
        log::warn!("skipping GPU {bus_id:#x} with no device index");
        return Ok(None);
    };
    let dev = dev.parse::<i64>().map_err(|_| TreeDecodeError::MalformedAttribute {
        key: "dev".to_string(),
        value: dev.to_string(),
    })?;
    let comp_cap = match xml_gpu.attr_i64_default("sm", 0) {
        Ok(cc) => cc,
        Err(e) => {
            log::warn!("GPU {bus_id:#x}: {e}, assuming base generation");
            0
        }
    };
    let gdr = xml_gpu.attr_i64_default("gdr", 0)? != 0;
    let node = system.create_node(
        NodeKind::Gpu,
        bus_id,
        NodeAttrs::Gpu(GpuAttrs { dev, ranks, comp_cap, gdr }),
    )?;
    Ok(Some(node))
}

fn add_net(system: &mut TopoSystem, xml_net: &DeviceNode, nic: NodeRef) -> Result<(), TopoError> {
    let dev = xml_net.attr_i64("dev")?;
    let asic = xml_net.attr_u64_hex_default("guid", dev as u64)?;
    let mut speed = xml_net.attr_i64_default("speed", 0)?;
    if speed <= 0 {
        speed = DEFAULT_NET_SPEED_MBPS;
    }
    let width = speed as f64 / NET_SPEED_DIVISOR;
    let latency = xml_net.attr_f64_default("latency", 0.0)?;
    let port = xml_net.attr_i64_default("port", 0)?;
    let gdr = xml_net.attr_i64_default("gdr", 0)? != 0;
    let max_channels = xml_net.attr_i64_default("maxconn", DEFAULT_MAX_CHANNELS)?;
    let coll = xml_net.attr_i64_default("coll", 0)? != 0;

    let net = system.create_node(
        NodeKind::Net,
        dev as u64,
        NodeAttrs::Net(NetAttrs { asic, port, width, latency, gdr, max_channels, coll }),
    )?;
    system.connect_nodes(nic, net, LinkKind::Net, width);
    system.connect_nodes(net, nic, LinkKind::Net, width);
    Ok(())
}

fn add_nic(system: &mut TopoSystem, xml_nic: &DeviceNode, nic: NodeRef) -> Result<(), TopoError> {
    for xml_net in xml_nic.children_named("net") {
        if xml_net.attr("dev").is_none() {
            log::warn!("skipping network port with no device index");
            continue;
        }
        add_net(system, xml_net, nic)?;
    }
    Ok(())
}

fn add_pci(
    system: &mut TopoSystem,
    xml_pci: &DeviceNode,
    parent: NodeRef,
    depth: usize,
) -> Result<(), TopoError> {
    if depth >= MAX_TREE_DEPTH {
        return Err(TreeDecodeError::DepthLimit.into());
    }
    let Some(class) = xml_pci.attr("class") else {
        log::warn!("skipping PCI entry with no class");
        return Ok(());
    };
    let kind = kv_prefix_match(class, PCI_CLASSES, NodeKind::Pci);
    let bus_id = bus_id_to_u64("busid", xml_pci.attr_str("busid")?)?;

    let mut node = None;
    if let Some(xml_gpu) = xml_pci.find_child("gpu") {
        node = add_gpu_node(system, xml_gpu, bus_id)?;
    } else if let Some(xml_nic) = xml_pci.find_child("nic") {
        // Merge multi-port adapters into one node: functions of one physical
        // device share the PCI link.
        let nic_id = bus_id & !0xf;
        let nic = match system.get_node(NodeKind::Nic, nic_id) {
            Some(existing) => existing,
            None => {
                let created = system.create_node(NodeKind::Nic, nic_id, NodeAttrs::Nic)?;
                node = Some(created);
                created
            }
        };
        add_nic(system, xml_nic, nic)?;
    } else if kind == NodeKind::Pci {
        // Sub-functions collapse onto one bridge node.
        let bridge_id = bus_id & !0xf;
        let bridge = match system.get_node(NodeKind::Pci, bridge_id) {
            Some(existing) => existing,
            None => {
                let mut device: u64 = 0;
                for (attr, shift) in [
                    ("vendor", 48),
                    ("device", 32),
                    ("subsystem_vendor", 16),
                    ("subsystem_device", 0),
                ] {
                    if xml_pci.attr(attr).is_some() {
                        device += xml_pci.attr_u64_hex(attr)? << shift;
                    }
                }
                let created =
                    system.create_node(NodeKind::Pci, bridge_id, NodeAttrs::Pci(PciAttrs { device }))?;
                node = Some(created);
                created
            }
        };
        for xml_sub in xml_pci.children_named("pci") {
            add_pci(system, xml_sub, bridge, depth + 1)?;
        }
    } else {
        log::debug!("ignoring PCI entry {bus_id:#x} of class {class}");
    }

    if let Some(node) = node {
        let width = pci_edge_width(xml_pci)?;
        system.connect_nodes(node, parent, LinkKind::Pci, width);
        system.connect_nodes(parent, node, LinkKind::Pci, width);
    }
    Ok(())
}

fn cpu_model(vendor: CpuVendor, family: i64, model: i64) -> CpuModel {
    match vendor {
        CpuVendor::Intel => {
            if family == 6 && model >= 0x55 {
                CpuModel::Skylake
            } else {
                CpuModel::Broadwell
            }
        }
        CpuVendor::Zhaoxin => {
            if family == 7 && model == 0x5b {
                CpuModel::Yongfeng
            } else {
                CpuModel::Unknown
            }
        }
        CpuVendor::Amd => {
            if (family == 143 && model >= 49) || family == 175 {
                CpuModel::Rome
            } else {
                CpuModel::Zen
            }
        }
        CpuVendor::Unknown => CpuModel::Unknown,
    }
}

fn add_cpu(system: &mut TopoSystem, xml_cpu: &DeviceNode) -> Result<(), TopoError> {
    let numa_id = xml_cpu.attr_i64("numaid")?;

    let affinity = match xml_cpu.attr("affinity") {
        Some(mask) => match CpuSet::from_mask_str(mask) {
            Ok(set) => set,
            Err(e) => {
                log::warn!("processor {numa_id}: {e}, using empty affinity");
                CpuSet::new()
            }
        },
        None => CpuSet::new(),
    };

    let arch = match xml_cpu.attr("arch") {
        Some("x86_64") => CpuArch::X86,
        Some("arm64") => CpuArch::Arm,
        Some("ppc64") => CpuArch::Power,
        Some(other) => {
            log::warn!("processor {numa_id}: unknown architecture \"{other}\"");
            CpuArch::Unknown
        }
        None => CpuArch::Unknown,
    };
    let vendor = if arch == CpuArch::X86 {
        match xml_cpu.attr("vendor") {
            Some("GenuineIntel") => CpuVendor::Intel,
            Some("AuthenticAMD") => CpuVendor::Amd,
            Some("CentaurHauls") | Some("  Shanghai  ") => CpuVendor::Zhaoxin,
            _ => CpuVendor::Unknown,
        }
    } else {
        CpuVendor::Unknown
    };
    let family = xml_cpu.attr_i64_default("familyid", -1)?;
    let model_id = xml_cpu.attr_i64_default("modelid", -1)?;
    let model = cpu_model(vendor, family, model_id);

    let cpu = system.create_node(
        NodeKind::Cpu,
        numa_id as u64,
        NodeAttrs::Cpu(CpuAttrs { arch, vendor, model, affinity }),
    )?;

    for child in &xml_cpu.children {
        if child.name == "pci" {
            add_pci(system, child, cpu, 1)?;
        } else if child.name == "nic" {
            // Port with no PCI parent: hang it off the processor directly,
            // sharing one synthetic NIC node.
            let nic = match system.get_node(NodeKind::Nic, 0) {
                Some(existing) => existing,
                None => {
                    let created = system.create_node(NodeKind::Nic, 0, NodeAttrs::Nic)?;
                    system.connect_nodes(cpu, created, LinkKind::Pci, LOC_WIDTH);
                    system.connect_nodes(created, cpu, LinkKind::Pci, LOC_WIDTH);
                    created
                }
            };
            add_nic(system, child, nic)?;
        }
    }
    Ok(())
}

/// Walk outward from `start` across PCI edges until a processor is found.
fn find_local_cpu(system: &TopoSystem, start: NodeRef) -> Option<NodeRef> {
    let mut visited = HashSet::new();
    let mut stack = vec![start];
    while let Some(node) = stack.pop() {
        if node.kind == NodeKind::Cpu {
            return Some(node);
        }
        if !visited.insert(node) {
            continue;
        }
        for link in &system.node(node).links {
            if link.kind == LinkKind::Pci && !visited.contains(&link.peer) {
                stack.push(link.peer);
            }
        }
    }
    None
}

fn add_fabric_links(system: &mut TopoSystem, root: &DeviceNode) -> Result<(), TopoError> {
    let Some(fabric) = root.find_child("fabric") else {
        return Ok(());
    };
    for xml_link in fabric.children_named("fabriclink") {
        let Some(bus_id) = xml_link.attr("busid") else {
            log::warn!("skipping fabric link with no source bus address");
            continue;
        };
        let bus_id = bus_id_to_u64("busid", bus_id)?;
        let Some(gpu) = system.get_node(NodeKind::Gpu, bus_id) else {
            return Err(TopoError::UnresolvedReference { kind: NodeKind::Gpu, id: bus_id });
        };
        let count = match xml_link.attr_i64("count") {
            Ok(c) if c > 0 => c,
            _ => {
                log::warn!("skipping fabric link from {bus_id:#x} with missing or bad count");
                continue;
            }
        };

        let remote = match xml_link.attr("tclass") {
            Some(tclass) => match kv_prefix_match(tclass, PCI_CLASSES, NodeKind::Switch) {
                NodeKind::Gpu => {
                    let target = bus_id_to_u64("target", xml_link.attr_str("target")?)?;
                    let Some(peer) = system.get_node(NodeKind::Gpu, target) else {
                        // The peer accelerator is not part of this graph.
                        log::debug!("fabric link target {target:#x} not present, skipping");
                        continue;
                    };
                    Some(peer)
                }
                NodeKind::Cpu => find_local_cpu(system, gpu),
                _ => shared_switch(system)?,
            },
            None => shared_switch(system)?,
        };
        let Some(remote) = remote else {
            continue;
        };

        let comp_cap = system.node(gpu).gpu().map_or(0, |g| g.comp_cap);
        let width = count as f64 * fabric_link_width(comp_cap);
        system.connect_nodes(gpu, remote, LinkKind::Fabric, width);
        if remote.kind != NodeKind::Gpu {
            // A peer GPU adds the reverse direction from its own entries.
            system.connect_nodes(remote, gpu, LinkKind::Fabric, width);
        }
    }
    Ok(())
}

fn shared_switch(system: &mut TopoSystem) -> Result<Option<NodeRef>, TopoError> {
    match system.get_node(NodeKind::Switch, 0) {
        Some(existing) => Ok(Some(existing)),
        None => Ok(Some(system.create_node(NodeKind::Switch, 0, NodeAttrs::Switch)?)),
    }
}

/// Build a complete, immutable topology from a device tree: ingest, run the
/// normalization passes, precompute all path summaries.
pub fn system_from_tree(tree: &DeviceTree) -> Result<TopoSystem, TopoError> {
    tree.validate()?;
    let mut system = TopoSystem::new();
    for xml_cpu in tree.root.children_named("cpu") {
        add_cpu(&mut system, xml_cpu)?;
    }
    add_fabric_links(&mut system, &tree.root)?;
    transform::run(&mut system)?;
    paths::compute(&mut system);
    Ok(system)
}
