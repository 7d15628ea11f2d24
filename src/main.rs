use std::path::Path;

use fabric_topo::devtree::DeviceTree;
use fabric_topo::graph::build::system_from_tree;

fn main() {
    env_logger::init();

    let path = std::env::args().nth(1).expect("usage: fabric-topo <device-tree.json>");
    let tree = DeviceTree::from_json_file(Path::new(&path)).unwrap();
    let system = system_from_tree(&tree).unwrap();

    fabric_topo::report::log_topology(&system);
    fabric_topo::report::log_paths(&system);
}
