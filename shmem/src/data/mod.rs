//! Minimal owned data tree and the flat value form handed to value-shaped
//! callbacks.
//!
//! Parsing and validating trees against a schema happens elsewhere; these
//! types only carry what the subscription core needs to walk a payload and
//! convert its nodes.

use crate::errors::{Result, SrError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafType {
    Binary,
    Bits,
    Bool,
    Decimal64,
    Empty,
    Enum,
    IdentityRef,
    InstanceId,
    Int8,
    Int16,
    Int32,
    Int64,
    String,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Container { presence: bool },
    List,
    Leaf(LeafType),
    LeafList(LeafType),
    Notification,
    AnyXml,
    AnyData,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataNode {
    pub module: String,
    pub name: String,
    pub kind: NodeKind,
    /// Canonical value string of leaves and leaf-list entries.
    pub value: Option<String>,
    pub dflt: bool,
    /// List keys in schema order.
    pub keys: Vec<(String, String)>,
    pub children: Vec<DataNode>,
}

impl DataNode {
    pub fn new(module: &str, name: &str, kind: NodeKind) -> DataNode {
        DataNode {
            module: module.to_string(),
            name: name.to_string(),
            kind,
            value: None,
            dflt: false,
            keys: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn notification(module: &str, name: &str) -> DataNode {
        DataNode::new(module, name, NodeKind::Notification)
    }

    pub fn container(module: &str, name: &str) -> DataNode {
        DataNode::new(module, name, NodeKind::Container { presence: false })
    }

    pub fn list(module: &str, name: &str, keys: &[(&str, &str)]) -> DataNode {
        let mut node = DataNode::new(module, name, NodeKind::List);
        node.keys = keys.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        node
    }

    pub fn leaf(module: &str, name: &str, ty: LeafType, value: &str) -> DataNode {
        let mut node = DataNode::new(module, name, NodeKind::Leaf(ty));
        if ty != LeafType::Empty {
            node.value = Some(value.to_string());
        }
        node
    }

    pub fn with_child(mut self, child: DataNode) -> DataNode {
        self.children.push(child);
        self
    }

    /// One path step; the module prefix is only written when it differs
    /// from the parent's.
    fn step(&self, parent_module: Option<&str>) -> String {
        let mut step = match parent_module {
            Some(m) if m == self.module => self.name.clone(),
            _ => format!("{}:{}", self.module, self.name),
        };
        match self.kind {
            NodeKind::List => {
                for (k, v) in &self.keys {
                    step.push_str(&format!("[{}='{}']", k, v));
                }
            }
            NodeKind::LeafList(_) => {
                if let Some(v) = &self.value {
                    step.push_str(&format!("[.='{}']", v));
                }
            }
            _ => {}
        }
        step
    }

    /// Canonical path of this node taken as a top-level node.
    pub fn path(&self) -> String {
        format!("/{}", self.step(None))
    }

    /// Every node below this one in document (depth-first) order, each with
    /// its canonical path.
    pub fn descendants(&self) -> Vec<(String, &DataNode)> {
        let mut out = Vec::new();
        let mut stack: Vec<(String, &DataNode)> = self
            .children
            .iter()
            .rev()
            .map(|c| (format!("{}/{}", self.path(), c.step(Some(&self.module))), c))
            .collect();
        while let Some((path, node)) = stack.pop() {
            for child in node.children.iter().rev() {
                stack.push((format!("{}/{}", path, child.step(Some(&node.module))), child));
            }
            out.push((path, node));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValueData {
    Binary(String),
    Bits(String),
    Bool(bool),
    Decimal64(f64),
    LeafEmpty,
    Enum(String),
    IdentityRef(String),
    InstanceId(String),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    String(String),
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
    Container,
    ContainerPresence,
    List,
    Notification,
    AnyXml,
    AnyData,
}

impl ValueData {
    /// String form of a leaf value, `None` for valueless nodes.
    pub fn value_str(&self) -> Option<String> {
        match self {
            ValueData::Binary(s)
            | ValueData::Bits(s)
            | ValueData::Enum(s)
            | ValueData::IdentityRef(s)
            | ValueData::InstanceId(s)
            | ValueData::String(s) => Some(s.clone()),
            ValueData::Bool(b) => Some(if *b { "true" } else { "false" }.to_string()),
            ValueData::Decimal64(d) => Some(d.to_string()),
            ValueData::Int8(v) => Some(v.to_string()),
            ValueData::Int16(v) => Some(v.to_string()),
            ValueData::Int32(v) => Some(v.to_string()),
            ValueData::Int64(v) => Some(v.to_string()),
            ValueData::Uint8(v) => Some(v.to_string()),
            ValueData::Uint16(v) => Some(v.to_string()),
            ValueData::Uint32(v) => Some(v.to_string()),
            ValueData::Uint64(v) => Some(v.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SrValue {
    pub xpath: String,
    pub dflt: bool,
    pub data: ValueData,
}

fn parse_num<T: std::str::FromStr>(value: &str, what: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| SrError::Validation(format!("Value \"{}\" is not a valid {} number.", value, what)))
}

fn leaf_data(ty: LeafType, value: Option<&str>, xpath: &str) -> Result<ValueData> {
    if ty == LeafType::Empty {
        return Ok(ValueData::LeafEmpty);
    }
    let value = value.ok_or_else(|| SrError::Validation(format!("Leaf \"{}\" has no value.", xpath)))?;
    Ok(match ty {
        LeafType::Binary => ValueData::Binary(value.to_string()),
        LeafType::Bits => ValueData::Bits(value.to_string()),
        LeafType::Bool => match value {
            "true" => ValueData::Bool(true),
            "false" => ValueData::Bool(false),
            _ => return Err(SrError::Validation(format!("Value \"{}\" is not a valid boolean.", value))),
        },
        LeafType::Decimal64 => ValueData::Decimal64(parse_num(value, "decimal64")?),
        LeafType::Empty => ValueData::LeafEmpty,
        LeafType::Enum => ValueData::Enum(value.to_string()),
        LeafType::IdentityRef => ValueData::IdentityRef(value.to_string()),
        LeafType::InstanceId => ValueData::InstanceId(value.to_string()),
        LeafType::Int8 => ValueData::Int8(parse_num(value, "int8")?),
        LeafType::Int16 => ValueData::Int16(parse_num(value, "int16")?),
        LeafType::Int32 => ValueData::Int32(parse_num(value, "int32")?),
        LeafType::Int64 => ValueData::Int64(parse_num(value, "int64")?),
        LeafType::String => ValueData::String(value.to_string()),
        LeafType::Uint8 => ValueData::Uint8(parse_num(value, "uint8")?),
        LeafType::Uint16 => ValueData::Uint16(parse_num(value, "uint16")?),
        LeafType::Uint32 => ValueData::Uint32(parse_num(value, "uint32")?),
        LeafType::Uint64 => ValueData::Uint64(parse_num(value, "uint64")?),
    })
}

impl SrValue {
    pub fn from_node(node: &DataNode, xpath: String) -> Result<SrValue> {
        let data = match node.kind {
            NodeKind::Leaf(ty) | NodeKind::LeafList(ty) => leaf_data(ty, node.value.as_deref(), &xpath)?,
            NodeKind::Container { presence: true } => ValueData::ContainerPresence,
            NodeKind::Container { presence: false } => ValueData::Container,
            NodeKind::List => ValueData::List,
            NodeKind::Notification => ValueData::Notification,
            NodeKind::AnyXml => ValueData::AnyXml,
            NodeKind::AnyData => ValueData::AnyData,
        };
        Ok(SrValue {
            xpath,
            dflt: node.dflt,
            data,
        })
    }
}
