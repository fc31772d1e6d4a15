//! OMA TLV codec
//!
//! Header byte layout:
//!
//! | bits | meaning                                                      |
//! |------|--------------------------------------------------------------|
//! | 7-6  | 00 object instance, 01 resource instance, 10 multiple resource, 11 resource |
//! | 5    | identifier width: 0 = 8 bits, 1 = 16 bits                    |
//! | 4-3  | length width: 00 = in bits 2-0, 01/10/11 = 8/16/24 bits      |
//! | 2-0  | value length when bits 4-3 are 00                            |
//!
//! Integers and times use the shortest of 1, 2, 4 or 8 big-endian bytes,
//! floats are 8-byte IEEE 754 (4 bytes are accepted on input) and object
//! links are two big-endian 16-bit IDs.

use super::{Codec, TreeAssembler};
use crate::coap_types::ContentFormat;
use crate::definition::DefinitionRegistry;
use crate::error::{Lwm2mError, Result};
use crate::path::ResourcePath;
use crate::tree::{NodeKind, TreeNode};
use crate::types::{ObjectLink, ResourceType, Value};

const MAX_LENGTH: usize = 0x00FF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TlvKind {
    ObjectInstance = 0b00,
    ResourceInstance = 0b01,
    MultipleResource = 0b10,
    Resource = 0b11,
}

impl TlvKind {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => Self::ObjectInstance,
            0b01 => Self::ResourceInstance,
            0b10 => Self::MultipleResource,
            _ => Self::Resource,
        }
    }
}

#[derive(Debug)]
struct Tlv<'a> {
    kind: TlvKind,
    id: u16,
    value: &'a [u8],
}

/// TLV codec for content formats 1542 and 11542
#[derive(Debug, Clone, Copy)]
pub struct TlvCodec {
    format: ContentFormat,
}

impl TlvCodec {
    pub fn new(format: ContentFormat) -> Self {
        Self { format }
    }
}

impl Default for TlvCodec {
    fn default() -> Self {
        Self::new(ContentFormat::Lwm2mTlv)
    }
}

impl Codec for TlvCodec {
    fn content_format(&self) -> ContentFormat {
        self.format
    }

    fn serialise(&self, tree: &TreeNode, _path: &ResourcePath) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match tree.kind() {
            NodeKind::Root => {
                return Err(Lwm2mError::Protocol(
                    "TLV cannot encode the root node".to_string(),
                ));
            }
            NodeKind::Object | NodeKind::ObjectInstance => {
                for child in tree.children() {
                    encode_node(child, &mut out)?;
                }
            }
            _ => encode_node(tree, &mut out)?,
        }
        Ok(out)
    }

    fn deserialise(
        &self,
        definitions: &DefinitionRegistry,
        path: &ResourcePath,
        payload: &[u8],
    ) -> Result<TreeNode> {
        let tlvs = parse_all(payload)?;
        let mut leaves = Vec::new();

        match path.depth() {
            0 => {
                return Err(Lwm2mError::Protocol(
                    "TLV payloads cannot target the root".to_string(),
                ));
            }
            1 | 2 => collect_leaves(tlvs, path.depth(), &[], &mut leaves)?,
            3 => {
                // The resource itself may or may not be wrapped around its instances
                let wrapper = match tlvs.as_slice() {
                    [tlv] if Some(tlv.id) == path.resource_id => Some((tlv.kind, tlv.value)),
                    _ => None,
                };
                match wrapper {
                    Some((TlvKind::Resource, value)) => leaves.push((Vec::new(), value)),
                    Some((TlvKind::MultipleResource, value)) => {
                        collect_leaves(parse_all(value)?, 3, &[], &mut leaves)?;
                    }
                    _ => collect_leaves(tlvs, 3, &[], &mut leaves)?,
                }
            }
            _ => match tlvs.as_slice() {
                [tlv] if matches!(tlv.kind, TlvKind::Resource | TlvKind::ResourceInstance) => {
                    leaves.push((Vec::new(), tlv.value));
                }
                _ => {
                    return Err(Lwm2mError::Protocol(format!(
                        "expected a single value for {}",
                        path
                    )));
                }
            },
        }

        let mut assembler = TreeAssembler::new(definitions, path)?;
        for (ids, bytes) in leaves {
            assembler.insert(&ids, |resource_type| decode_value(resource_type, bytes))?;
        }
        Ok(assembler.finish())
    }
}

fn encode_node(node: &TreeNode, out: &mut Vec<u8>) -> Result<()> {
    let id = node
        .id()
        .ok_or_else(|| Lwm2mError::Internal(format!("{:?} node without ID", node.kind())))?;
    match node.kind() {
        NodeKind::ObjectInstance => {
            let mut body = Vec::new();
            for resource in node.children() {
                encode_node(resource, &mut body)?;
            }
            write_tlv(out, TlvKind::ObjectInstance, id, &body)
        }
        NodeKind::Resource => {
            let meta = node
                .meta()
                .ok_or_else(|| Lwm2mError::Internal(format!("resource {} has no type", id)))?;
            if meta.multiple {
                let mut body = Vec::new();
                for instance in node.children() {
                    encode_node(instance, &mut body)?;
                }
                write_tlv(out, TlvKind::MultipleResource, id, &body)
            } else {
                match node.children().first() {
                    Some(instance) => {
                        write_tlv(out, TlvKind::Resource, id, &encode_leaf(instance)?)
                    }
                    None => Ok(()),
                }
            }
        }
        NodeKind::ResourceInstance => {
            write_tlv(out, TlvKind::ResourceInstance, id, &encode_leaf(node)?)
        }
        NodeKind::Root | NodeKind::Object => Err(Lwm2mError::Internal(format!(
            "{:?} node inside TLV payload",
            node.kind()
        ))),
    }
}

fn encode_leaf(node: &TreeNode) -> Result<Vec<u8>> {
    let (Some(meta), Some(bytes)) = (node.meta(), node.value()) else {
        return Err(Lwm2mError::Internal(format!(
            "resource instance {:?} has no type or value",
            node.id()
        )));
    };
    Ok(encode_value(&Value::from_bytes(meta.resource_type, bytes)?))
}

fn encode_value(value: &Value) -> Vec<u8> {
    match value {
        Value::None => Vec::new(),
        Value::String(s) => s.as_bytes().to_vec(),
        Value::Opaque(bytes) => bytes.clone(),
        Value::Integer(n) | Value::Time(n) => encode_integer(*n),
        Value::Float(f) => f.to_be_bytes().to_vec(),
        Value::Boolean(b) => vec![u8::from(*b)],
        Value::ObjectLink(link) => {
            let mut bytes = link.object_id.to_be_bytes().to_vec();
            bytes.extend_from_slice(&link.instance_id.to_be_bytes());
            bytes
        }
    }
}

fn encode_integer(n: i64) -> Vec<u8> {
    if let Ok(n) = i8::try_from(n) {
        n.to_be_bytes().to_vec()
    } else if let Ok(n) = i16::try_from(n) {
        n.to_be_bytes().to_vec()
    } else if let Ok(n) = i32::try_from(n) {
        n.to_be_bytes().to_vec()
    } else {
        n.to_be_bytes().to_vec()
    }
}

fn decode_value(resource_type: ResourceType, bytes: &[u8]) -> Result<Value> {
    let bad_length = || {
        Lwm2mError::Protocol(format!(
            "{:?} value cannot be {} bytes",
            resource_type,
            bytes.len()
        ))
    };
    let integer = || -> Result<i64> {
        match *bytes {
            [a] => Ok(i64::from(i8::from_be_bytes([a]))),
            [a, b] => Ok(i64::from(i16::from_be_bytes([a, b]))),
            [a, b, c, d] => Ok(i64::from(i32::from_be_bytes([a, b, c, d]))),
            _ => bytes
                .try_into()
                .map(i64::from_be_bytes)
                .map_err(|_| bad_length()),
        }
    };

    match resource_type {
        ResourceType::None => Err(Lwm2mError::Protocol(
            "executable resources carry no value".to_string(),
        )),
        ResourceType::String => String::from_utf8(bytes.to_vec())
            .map(Value::String)
            .map_err(|e| Lwm2mError::Protocol(format!("invalid UTF-8 string: {}", e))),
        ResourceType::Opaque => Ok(Value::Opaque(bytes.to_vec())),
        ResourceType::Integer => integer().map(Value::Integer),
        ResourceType::Time => integer().map(Value::Time),
        ResourceType::Float => match *bytes {
            [a, b, c, d] => Ok(Value::Float(f64::from(f32::from_be_bytes([a, b, c, d])))),
            _ => bytes
                .try_into()
                .map(|b| Value::Float(f64::from_be_bytes(b)))
                .map_err(|_| bad_length()),
        },
        ResourceType::Boolean => match *bytes {
            [0] => Ok(Value::Boolean(false)),
            [1] => Ok(Value::Boolean(true)),
            _ => Err(bad_length()),
        },
        ResourceType::ObjectLink => match *bytes {
            [a, b, c, d] => Ok(Value::ObjectLink(ObjectLink::new(
                u16::from_be_bytes([a, b]),
                u16::from_be_bytes([c, d]),
            ))),
            _ => Err(bad_length()),
        },
    }
}

fn write_tlv(out: &mut Vec<u8>, kind: TlvKind, id: u16, value: &[u8]) -> Result<()> {
    let len = value.len();
    if len > MAX_LENGTH {
        return Err(Lwm2mError::capacity(
            format!("TLV value of {} bytes", len),
            MAX_LENGTH,
        ));
    }

    let mut header = (kind as u8) << 6;
    let id_bytes = match u8::try_from(id) {
        Ok(id) => vec![id],
        Err(_) => {
            header |= 0x20;
            id.to_be_bytes().to_vec()
        }
    };
    let len_bytes = if len < 8 {
        header |= len as u8;
        Vec::new()
    } else if len <= 0xFF {
        header |= 0x08;
        vec![len as u8]
    } else if len <= 0xFFFF {
        header |= 0x10;
        (len as u16).to_be_bytes().to_vec()
    } else {
        header |= 0x18;
        (len as u32).to_be_bytes()[1..].to_vec()
    };

    out.push(header);
    out.extend_from_slice(&id_bytes);
    out.extend_from_slice(&len_bytes);
    out.extend_from_slice(value);
    Ok(())
}

fn parse_all(mut input: &[u8]) -> Result<Vec<Tlv<'_>>> {
    let mut tlvs = Vec::new();
    while !input.is_empty() {
        let (tlv, rest) = parse_one(input)?;
        tlvs.push(tlv);
        input = rest;
    }
    Ok(tlvs)
}

fn truncated() -> Lwm2mError {
    Lwm2mError::Protocol("truncated TLV".to_string())
}

fn take(input: &[u8], n: usize) -> Result<(&[u8], &[u8])> {
    if input.len() < n {
        return Err(truncated());
    }
    Ok(input.split_at(n))
}

fn parse_one(input: &[u8]) -> Result<(Tlv<'_>, &[u8])> {
    let (&header, rest) = input.split_first().ok_or_else(truncated)?;
    let (id_bytes, rest) = take(rest, if header & 0x20 != 0 { 2 } else { 1 })?;
    let id = id_bytes
        .iter()
        .fold(0u16, |acc, b| (acc << 8) | u16::from(*b));

    let (len, rest) = match (header >> 3) & 0b11 {
        0 => (usize::from(header & 0b111), rest),
        width => {
            let (len_bytes, rest) = take(rest, usize::from(width))?;
            let len = len_bytes
                .iter()
                .fold(0usize, |acc, b| (acc << 8) | usize::from(*b));
            (len, rest)
        }
    };
    let (value, rest) = take(rest, len)?;

    Ok((
        Tlv {
            kind: TlvKind::from_bits(header >> 6),
            id,
            value,
        },
        rest,
    ))
}

/// Collect (relative IDs, encoded value) pairs from TLVs that are the
/// children of a node at `depth`
fn collect_leaves<'a>(
    tlvs: Vec<Tlv<'a>>,
    depth: usize,
    prefix: &[u16],
    leaves: &mut Vec<(Vec<u16>, &'a [u8])>,
) -> Result<()> {
    for tlv in tlvs {
        let mut ids = prefix.to_vec();
        ids.push(tlv.id);
        match (depth, tlv.kind) {
            (1, TlvKind::ObjectInstance) => {
                collect_leaves(parse_all(tlv.value)?, 2, &ids, leaves)?;
            }
            (2, TlvKind::Resource) => leaves.push((ids, tlv.value)),
            (2, TlvKind::MultipleResource) => {
                collect_leaves(parse_all(tlv.value)?, 3, &ids, leaves)?;
            }
            (3, TlvKind::ResourceInstance) => leaves.push((ids, tlv.value)),
            (depth, kind) => {
                return Err(Lwm2mError::Protocol(format!(
                    "unexpected {:?} TLV at depth {}",
                    kind, depth
                )));
            }
        }
    }
    Ok(())
}
