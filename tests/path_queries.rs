use fabric_topo::cpuset::CpuSet;
use fabric_topo::devtree::{DeviceNode, DeviceTree};
use fabric_topo::graph::query;
use fabric_topo::graph::{CpuArch, CpuModel, CpuVendor, NodeKind, NodeRef, PathTier, TopoError, TopoSystem};
use fabric_topo::system_from_tree;

fn elem(name: &str, attrs: &[(&str, &str)]) -> DeviceNode {
    let mut node = DeviceNode::new(name);
    for (k, v) in attrs {
        node.set_attr(k, v);
    }
    node
}

fn with_children(mut node: DeviceNode, children: Vec<DeviceNode>) -> DeviceNode {
    node.children = children;
    node
}

fn tree(children: Vec<DeviceNode>) -> DeviceTree {
    let mut t = DeviceTree::new();
    t.root.children = children;
    t
}

fn intel_cpu(numa: &str, affinity: &str) -> DeviceNode {
    elem(
        "cpu",
        &[
            ("numaid", numa),
            ("affinity", affinity),
            ("arch", "x86_64"),
            ("vendor", "GenuineIntel"),
            ("familyid", "6"),
            ("modelid", "85"),
        ],
    )
}

fn bridge(busid: &str, speed: &str) -> DeviceNode {
    elem(
        "pci",
        &[("class", "0x060400"), ("busid", busid), ("link_width", "16"), ("link_speed", speed)],
    )
}

fn gpu_pci(busid: &str, dev: &str, rank: &str, sm: &str) -> DeviceNode {
    with_children(
        elem(
            "pci",
            &[("class", "0x030000"), ("busid", busid), ("link_width", "16"), ("link_speed", "16.0 GT/s PCIe")],
        ),
        vec![elem("gpu", &[("sm", sm), ("rank", rank), ("dev", dev), ("gdr", "1")])],
    )
}

fn gpu_ref(i: usize) -> NodeRef {
    NodeRef::new(NodeKind::Gpu, i)
}

/// Two sockets: GPUs 0 and 1 behind a two-deep bridge hierarchy on socket 0
/// together with a dual-port NIC, GPU 2 directly on socket 1.
fn dual_socket() -> TopoSystem {
    let nic = with_children(
        elem(
            "pci",
            &[("class", "0x020000"), ("busid", "0000:04:00.0"), ("link_width", "16"), ("link_speed", "16.0 GT/s PCIe")],
        ),
        vec![with_children(
            DeviceNode::new("nic"),
            vec![
                elem("net", &[("dev", "0"), ("speed", "100000"), ("port", "1"), ("gdr", "1")]),
                elem("net", &[("dev", "1"), ("speed", "100000"), ("port", "2"), ("gdr", "1")]),
            ],
        )],
    );
    let b = with_children(
        bridge("0000:02:00.0", "8.0 GT/s PCIe"),
        vec![gpu_pci("0000:03:00.0", "0", "0", "80"), nic],
    );
    let c = with_children(bridge("0000:05:00.0", "8.0 GT/s PCIe"), vec![gpu_pci("0000:06:00.0", "1", "1", "80")]);
    let a = with_children(bridge("0000:01:00.0", "16.0 GT/s PCIe"), vec![b, c]);
    let t = tree(vec![
        with_children(intel_cpu("0", "ffff"), vec![a]),
        with_children(intel_cpu("1", "ffff0000"), vec![gpu_pci("0000:81:00.0", "2", "2", "86")]),
    ]);
    system_from_tree(&t).expect("builds")
}

#[test]
fn tier_classification_across_the_graph() {
    let system = dual_socket();

    // Same bridge pair, two bridges apart, through the host bridge, and
    // across the socket interconnect.
    assert_eq!(system.path(gpu_ref(0), gpu_ref(1)).tier, PathTier::PciBridged);
    assert_eq!(system.path(gpu_ref(0), gpu_ref(1)).width, 12.0);
    assert_eq!(system.path(gpu_ref(0), gpu_ref(1)).hops, 4);

    let cpu0 = NodeRef::new(NodeKind::Cpu, 0);
    assert_eq!(system.path(gpu_ref(0), cpu0).tier, PathTier::HostBridged);
    assert_eq!(system.path(gpu_ref(0), cpu0).width, 12.0);

    assert_eq!(system.path(gpu_ref(0), gpu_ref(2)).tier, PathTier::Sys);
    assert_eq!(system.path(gpu_ref(0), gpu_ref(2)).width, 9.0);
    assert_eq!(system.path(gpu_ref(0), gpu_ref(2)).hops, 5);

    let net0 = NodeRef::new(NodeKind::Net, 0);
    assert_eq!(system.path(net0, gpu_ref(0)).tier, PathTier::PciAdjacent);
    assert_eq!(system.path(net0, gpu_ref(0)).width, 12.5);
    assert_eq!(system.path(net0, gpu_ref(0)).hops, 3);
    assert_eq!(system.path(net0, gpu_ref(1)).tier, PathTier::PciBridged);
}

#[test]
fn summaries_degrade_monotonically_along_a_chain() {
    let system = dual_socket();
    let chain = [
        NodeRef::new(NodeKind::Pci, 1), // near bridge
        NodeRef::new(NodeKind::Pci, 0), // top bridge
        NodeRef::new(NodeKind::Cpu, 0),
        NodeRef::new(NodeKind::Cpu, 1),
        gpu_ref(2),
    ];
    let mut last_tier = PathTier::Loc;
    let mut last_width = f64::MAX;
    for dst in chain {
        let path = system.path(gpu_ref(0), dst);
        assert!(path.is_connected());
        assert!(path.tier >= last_tier, "tier regressed toward {dst:?}");
        assert!(path.width <= last_width, "width grew toward {dst:?}");
        last_tier = path.tier;
        last_width = path.width;
    }
}

#[test]
fn local_net_prefers_widest_then_spreads_by_device() {
    let system = dual_socket();

    // Both ports are equally good; the pick is a pure function of the
    // device index and the candidate count.
    for _ in 0..3 {
        assert_eq!(query::local_net(&system, 0).expect("rank 0"), Some(0));
        assert_eq!(query::local_net(&system, 1).expect("rank 1"), Some(1));
        assert_eq!(query::local_net(&system, 2).expect("rank 2"), Some(0));
    }
}

#[test]
fn local_net_without_ports_is_none() {
    let t = tree(vec![with_children(
        intel_cpu("0", "ffff"),
        vec![gpu_pci("0000:01:00.0", "0", "0", "80")],
    )]);
    let system = system_from_tree(&t).expect("builds");
    assert_eq!(query::local_net(&system, 0).expect("no ports"), None);
}

#[test]
fn cpu_affinity_intersects_granted_mask() {
    let system = dual_socket();
    let granted = CpuSet::from_mask_str("ff").expect("mask");

    let mask = query::cpu_affinity(&system, 0, &granted, false).expect("rank 0");
    assert_eq!(mask, CpuSet::from_mask_str("ff").expect("mask"));

    // The override returns the processor's own mask untouched.
    let full = query::cpu_affinity(&system, 0, &granted, true).expect("rank 0");
    assert_eq!(full, CpuSet::from_mask_str("ffff").expect("mask"));

    // Rank 2 sits on socket 1; the granted low bits do not overlap it.
    let far = query::cpu_affinity(&system, 2, &granted, false).expect("rank 2");
    assert!(far.is_empty());
    let far_own = query::cpu_affinity(&system, 2, &granted, true).expect("rank 2");
    assert_eq!(far_own, CpuSet::from_mask_str("ffff0000").expect("mask"));

    let err = query::cpu_affinity(&system, 9, &granted, false).expect_err("unknown rank");
    assert!(matches!(err, TopoError::RankNotFound(9)));
}

#[test]
fn comp_cap_range_and_rank_lookups() {
    let system = dual_socket();
    assert_eq!(query::comp_cap_range(&system).expect("gpus present"), (80, 86));
    assert_eq!(query::local_rank(&system, 2).expect("rank 2"), 2);
    assert!(matches!(query::local_rank(&system, 7), Err(TopoError::RankNotFound(7))));
    assert_eq!(query::dev_to_rank(&system, 1).expect("dev 1"), 1);
    assert!(matches!(query::dev_to_rank(&system, 5), Err(TopoError::DevNotFound(5))));
    assert_eq!(query::net_count(&system), 2);
    assert_eq!(
        query::cpu_kind(&system).expect("cpus present"),
        (CpuArch::X86, CpuVendor::Intel, CpuModel::Skylake)
    );
}

#[test]
fn comp_cap_range_requires_gpus() {
    let t = tree(vec![intel_cpu("0", "ffff")]);
    let system = system_from_tree(&t).expect("builds");
    assert!(matches!(query::comp_cap_range(&system), Err(TopoError::NoGpu)));
}

#[test]
fn whole_graph_width_scalars() {
    let system = dual_socket();
    assert_eq!(system.max_width(), 12.5);
    assert_eq!(system.total_width(), 33.5);
}

fn fabric_tree(links: Vec<DeviceNode>, gpus: usize) -> DeviceTree {
    let bus = ["0000:01:00.0", "0000:02:00.0", "0000:03:00.0"];
    let mut children = Vec::new();
    for g in 0..gpus {
        children.push(gpu_pci(bus[g], &g.to_string(), &g.to_string(), "80"));
    }
    let mut t = tree(vec![with_children(intel_cpu("0", "ffff"), children)]);
    t.root.children.push(with_children(DeviceNode::new("fabric"), links));
    t
}

#[test]
fn fabric_hop_through_peer_gpu_is_bridged_tier() {
    // 0 <-> 1 and 1 <-> 2 direct fabric, nothing between 0 and 2.
    let links = vec![
        elem("fabriclink", &[("busid", "0000:01:00.0"), ("count", "2"), ("tclass", "0x030000"), ("target", "0000:02:00.0")]),
        elem("fabriclink", &[("busid", "0000:02:00.0"), ("count", "2"), ("tclass", "0x030000"), ("target", "0000:01:00.0")]),
        elem("fabriclink", &[("busid", "0000:02:00.0"), ("count", "2"), ("tclass", "0x030000"), ("target", "0000:03:00.0")]),
        elem("fabriclink", &[("busid", "0000:03:00.0"), ("count", "2"), ("tclass", "0x030000"), ("target", "0000:02:00.0")]),
    ];
    let system = system_from_tree(&fabric_tree(links, 3)).expect("builds");

    assert_eq!(system.path(gpu_ref(0), gpu_ref(1)).tier, PathTier::Fabric);
    let hop = system.path(gpu_ref(0), gpu_ref(2));
    assert_eq!(hop.tier, PathTier::FabricBridged);
    assert_eq!(hop.width, 44.0);
    assert_eq!(hop.hops, 2);
}

#[test]
fn switch_mediated_fabric_stays_direct_tier() {
    // No target class: both accelerators land on the shared fabric switch.
    let links = vec![
        elem("fabriclink", &[("busid", "0000:01:00.0"), ("count", "6")]),
        elem("fabriclink", &[("busid", "0000:02:00.0"), ("count", "6")]),
    ];
    let system = system_from_tree(&fabric_tree(links, 2)).expect("builds");

    assert_eq!(system.count(NodeKind::Switch), 1);
    let path = system.path(gpu_ref(0), gpu_ref(1));
    assert_eq!(path.tier, PathTier::Fabric);
    assert_eq!(path.width, 132.0);
    assert_eq!(path.hops, 2);
}

#[test]
fn fabric_link_to_local_processor() {
    let links = vec![elem("fabriclink", &[("busid", "0000:01:00.0"), ("count", "3"), ("tclass", "0x068001")])];
    let system = system_from_tree(&fabric_tree(links, 1)).expect("builds");

    let cpu0 = NodeRef::new(NodeKind::Cpu, 0);
    let path = system.path(gpu_ref(0), cpu0);
    assert_eq!(path.tier, PathTier::Fabric);
    assert_eq!(path.width, 66.0);
    assert_eq!(path.hops, 1);
}
