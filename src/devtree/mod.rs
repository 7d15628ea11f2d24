//! Attributed device-description tree.
//!
//! The tree is materialized by an external collaborator (OS enumeration or a
//! pre-captured file) and handed to the graph builder. This module only owns
//! the data shape, attribute access, and the JSON dump/load path used for
//! diagnostic capture.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Hard bound on tree nesting, checked before the builder walks anything.
pub const MAX_TREE_DEPTH: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum TreeDecodeError {
    #[error("missing required attribute \"{0}\"")]
    MissingAttribute(&'static str),
    #[error("malformed attribute {key}=\"{value}\"")]
    MalformedAttribute { key: String, value: String },
    #[error("device tree exceeds maximum depth of {MAX_TREE_DEPTH}")]
    DepthLimit,
    #[error("device tree decoding error")]
    Json(#[from] anyhow::Error),
}

/// One element of the device tree: a name, an ordered attribute list and
/// nested children.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceNode {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<DeviceNode>,
}

impl DeviceNode {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), attrs: Vec::new(), children: Vec::new() }
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn attr_str(&self, key: &'static str) -> Result<&str, TreeDecodeError> {
        self.attr(key).ok_or(TreeDecodeError::MissingAttribute(key))
    }

    pub fn attr_i64(&self, key: &'static str) -> Result<i64, TreeDecodeError> {
        parse_i64(key, self.attr_str(key)?)
    }

    pub fn attr_i64_default(&self, key: &'static str, default: i64) -> Result<i64, TreeDecodeError> {
        match self.attr(key) {
            Some(v) => parse_i64(key, v),
            None => Ok(default),
        }
    }

    pub fn attr_f64_default(&self, key: &'static str, default: f64) -> Result<f64, TreeDecodeError> {
        match self.attr(key) {
            Some(v) => v.parse::<f64>().map_err(|_| TreeDecodeError::MalformedAttribute {
                key: key.to_string(),
                value: v.to_string(),
            }),
            None => Ok(default),
        }
    }

    /// Hex attribute, with or without a `0x` prefix.
    pub fn attr_u64_hex(&self, key: &'static str) -> Result<u64, TreeDecodeError> {
        let v = self.attr_str(key)?;
        parse_u64_hex(key, v)
    }

    pub fn attr_u64_hex_default(&self, key: &'static str, default: u64) -> Result<u64, TreeDecodeError> {
        match self.attr(key) {
            Some(v) => parse_u64_hex(key, v),
            None => Ok(default),
        }
    }

    pub fn set_attr(&mut self, key: &str, value: &str) {
        for (k, v) in self.attrs.iter_mut() {
            if k == key {
                *v = value.to_string();
                return;
            }
        }
        self.attrs.push((key.to_string(), value.to_string()));
    }

    /// Set an attribute only if it is not already present. Used by the
    /// collaborator that fills in enumerated defaults over a loaded tree.
    pub fn init_attr(&mut self, key: &str, value: &str) {
        if self.attr(key).is_none() {
            self.attrs.push((key.to_string(), value.to_string()));
        }
    }

    pub fn init_attr_i64(&mut self, key: &str, value: i64) {
        self.init_attr(key, &value.to_string());
    }

    pub fn init_attr_u64_hex(&mut self, key: &str, value: u64) {
        self.init_attr(key, &format!("{value:#x}"));
    }

    pub fn find_child(&self, name: &str) -> Option<&DeviceNode> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a DeviceNode> {
        self.children.iter().filter(move |c| c.name == name)
    }

    fn check_depth(&self, depth: usize) -> Result<(), TreeDecodeError> {
        if depth >= MAX_TREE_DEPTH {
            return Err(TreeDecodeError::DepthLimit);
        }
        for child in &self.children {
            child.check_depth(depth + 1)?;
        }
        Ok(())
    }
}

/// A whole device description, rooted at a `system` element.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceTree {
    pub root: DeviceNode,
}

impl DeviceTree {
    pub fn new() -> Self {
        let mut root = DeviceNode::new("system");
        root.set_attr("version", "1");
        Self { root }
    }

    /// Bound the nesting depth before anything recurses over the tree.
    pub fn validate(&self) -> Result<(), TreeDecodeError> {
        self.root.check_depth(0)
    }

    pub fn from_json_reader<R: Read>(reader: R) -> Result<Self, TreeDecodeError> {
        let tree: DeviceTree =
            serde_json::from_reader(reader).map_err(|e| TreeDecodeError::Json(anyhow::Error::from(e)))?;
        tree.validate()?;
        Ok(tree)
    }

    pub fn to_json_writer<W: Write>(&self, writer: W) -> Result<(), TreeDecodeError> {
        serde_json::to_writer_pretty(writer, self).map_err(|e| TreeDecodeError::Json(anyhow::Error::from(e)))
    }

    pub fn from_json_file(path: &Path) -> Result<Self, TreeDecodeError> {
        let file = File::open(path).map_err(|e| TreeDecodeError::Json(anyhow::Error::from(e)))?;
        Self::from_json_reader(BufReader::new(file))
    }

    pub fn to_json_file(&self, path: &Path) -> Result<(), TreeDecodeError> {
        let file = File::create(path).map_err(|e| TreeDecodeError::Json(anyhow::Error::from(e)))?;
        self.to_json_writer(BufWriter::new(file))
    }
}

impl Default for DeviceTree {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_i64(key: &str, v: &str) -> Result<i64, TreeDecodeError> {
    let parsed = if let Some(hex) = v.strip_prefix("0x") {
        i64::from_str_radix(hex, 16)
    } else {
        v.parse::<i64>()
    };
    parsed.map_err(|_| TreeDecodeError::MalformedAttribute { key: key.to_string(), value: v.to_string() })
}

fn parse_u64_hex(key: &str, v: &str) -> Result<u64, TreeDecodeError> {
    let hex = v.strip_prefix("0x").unwrap_or(v);
    u64::from_str_radix(hex, 16)
        .map_err(|_| TreeDecodeError::MalformedAttribute { key: key.to_string(), value: v.to_string() })
}

/// Parse a PCI bus address of the form `0000:0a:02.1` into a packed integer,
/// one nibble per hex digit with separators dropped.
pub fn bus_id_to_u64(key: &str, bus_id: &str) -> Result<u64, TreeDecodeError> {
    let mut id: u64 = 0;
    let mut digits = 0;
    for c in bus_id.chars() {
        if c == ':' || c == '.' {
            continue;
        }
        let d = c.to_digit(16).ok_or_else(|| TreeDecodeError::MalformedAttribute {
            key: key.to_string(),
            value: bus_id.to_string(),
        })? as u64;
        id = (id << 4) + d;
        digits += 1;
    }
    if digits == 0 || digits > 16 {
        return Err(TreeDecodeError::MalformedAttribute {
            key: key.to_string(),
            value: bus_id.to_string(),
        });
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_id_packs_nibbles() {
        assert_eq!(bus_id_to_u64("busid", "0000:00:02.0").expect("parses"), 0x20);
        assert_eq!(bus_id_to_u64("busid", "0000:0a:02.1").expect("parses"), 0xa021);
        assert!(bus_id_to_u64("busid", "not-a-bus-id").is_err());
    }

    #[test]
    fn init_attr_does_not_overwrite() {
        let mut node = DeviceNode::new("net");
        node.set_attr("speed", "100000");
        node.init_attr_i64("speed", 10000);
        assert_eq!(node.attr("speed"), Some("100000"));
        node.init_attr_i64("port", 1);
        assert_eq!(node.attr("port"), Some("1"));
    }

    #[test]
    fn depth_limit_rejected() {
        let mut tree = DeviceTree::new();
        let mut node = DeviceNode::new("pci");
        for _ in 0..MAX_TREE_DEPTH {
            let mut outer = DeviceNode::new("pci");
            outer.children.push(node);
            node = outer;
        }
        tree.root.children.push(node);
        assert!(matches!(tree.validate(), Err(TreeDecodeError::DepthLimit)));
    }
}
