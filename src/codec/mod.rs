//! Wire codecs: resource tree <-> payload bytes
//!
//! Every codec is stateless per call. Serialisation takes the tree for the
//! node addressed by `path`; deserialisation needs the definitions to type
//! the values and returns a tree rooted at the node addressed by `path`.

mod json;
mod opaque;
mod plain;
mod senml_cbor;
mod tlv;

pub use json::JsonCodec;
pub use opaque::OpaqueCodec;
pub use plain::PlainTextCodec;
pub use senml_cbor::SenmlCborCodec;
pub use tlv::TlvCodec;

use crate::coap_types::ContentFormat;
use crate::definition::DefinitionRegistry;
use crate::error::{Lwm2mError, Result};
use crate::path::ResourcePath;
use crate::tree::{NodeKind, ResourceMeta, TreeNode};
use crate::types::{ResourceType, Value};

/// Transcoder between resource trees and one payload format
pub trait Codec {
    /// Content format produced and accepted
    fn content_format(&self) -> ContentFormat;

    /// Encode `tree`, the node addressed by `path`
    fn serialise(&self, tree: &TreeNode, path: &ResourcePath) -> Result<Vec<u8>>;

    /// Decode `payload` into a tree rooted at the node addressed by `path`
    fn deserialise(
        &self,
        definitions: &DefinitionRegistry,
        path: &ResourcePath,
        payload: &[u8],
    ) -> Result<TreeNode>;
}

/// Codec for a content format
pub fn codec_for(format: ContentFormat) -> Result<Box<dyn Codec>> {
    match format {
        ContentFormat::Lwm2mJson | ContentFormat::OmaJson => Ok(Box::new(JsonCodec::new(format))),
        ContentFormat::Lwm2mTlv | ContentFormat::OmaTlv => Ok(Box::new(TlvCodec::new(format))),
        ContentFormat::TextPlain | ContentFormat::Lwm2mText => {
            Ok(Box::new(PlainTextCodec::new(format)))
        }
        ContentFormat::OctetStream => Ok(Box::new(OpaqueCodec)),
        ContentFormat::SenmlCbor => Ok(Box::new(SenmlCborCodec)),
        other => Err(Lwm2mError::UnsupportedContentType(other.as_u16())),
    }
}

/// Codec for a raw Content-Format option value
pub fn codec_for_u16(format: u16) -> Result<Box<dyn Codec>> {
    ContentFormat::from_u16(format)
        .ok_or(Lwm2mError::UnsupportedContentType(format))
        .and_then(codec_for)
}

/// One resource-instance value, addressed relative to the serialisation root
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Record {
    /// IDs below the root, ending with the resource instance ID. Empty when
    /// the root is the resource instance itself.
    pub ids: Vec<u16>,
    pub meta: ResourceMeta,
    pub value: Value,
}

impl Record {
    /// Relative IDs as named on the wire: single-instance resources drop
    /// their implicit resource instance 0
    pub fn name_ids(&self) -> &[u16] {
        if self.meta.multiple {
            &self.ids
        } else {
            &self.ids[..self.ids.len().saturating_sub(1)]
        }
    }

    /// `/`-separated relative name
    pub fn name(&self) -> String {
        self.name_ids()
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Flatten a tree into its resource-instance values in tree order
pub(crate) fn flatten(tree: &TreeNode) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    let mut error = None;
    tree.walk(|ancestors, node| {
        if node.kind() != NodeKind::ResourceInstance || error.is_some() {
            return;
        }
        let (Some(meta), Some(bytes)) = (node.meta(), node.value()) else {
            error = Some(Lwm2mError::Internal(format!(
                "resource instance {:?} has no type or value",
                node.id()
            )));
            return;
        };
        match Value::from_bytes(meta.resource_type, bytes) {
            // the root is fixed by the request path and never named
            Ok(value) => records.push(Record {
                ids: match ancestors {
                    [] => Vec::new(),
                    [_, below @ ..] => below
                        .iter()
                        .chain(std::iter::once(&node))
                        .filter_map(|n| n.id())
                        .collect(),
                },
                meta,
                value,
            }),
            Err(e) => error = Some(e),
        }
    });
    match error {
        Some(e) => Err(e),
        None => Ok(records),
    }
}

/// The single value of a tree addressing one resource (instance)
pub(crate) fn single_value(tree: &TreeNode, format: ContentFormat) -> Result<Record> {
    let mut records = flatten(tree)?;
    if records.len() != 1 {
        return Err(Lwm2mError::Protocol(format!(
            "content format {} carries exactly one value, tree has {}",
            format.as_u16(),
            records.len()
        )));
    }
    Ok(records.remove(0))
}

/// Builds a typed tree from decoded values
pub(crate) struct TreeAssembler<'a> {
    definitions: &'a DefinitionRegistry,
    path: ResourcePath,
    root: TreeNode,
}

impl<'a> TreeAssembler<'a> {
    pub fn new(definitions: &'a DefinitionRegistry, path: &ResourcePath) -> Result<Self> {
        let root = match (path.object_id, path.instance_id, path.resource_id) {
            (None, ..) => TreeNode::root(),
            (Some(o), None, _) => {
                definitions.object(o)?;
                TreeNode::object(o)
            }
            (Some(o), Some(i), None) => {
                definitions.object(o)?;
                TreeNode::object_instance(i)
            }
            (Some(o), Some(_), Some(r)) => {
                let meta = resource_meta(definitions, o, r)?;
                match path.resource_instance_id {
                    None => TreeNode::resource(r, meta),
                    Some(ri) => TreeNode::resource_instance(ri, meta, Vec::new()),
                }
            }
        };
        Ok(Self {
            definitions,
            path: *path,
            root,
        })
    }

    /// Full path of a value named by `ids` relative to the root. A name
    /// ending at a single-instance resource addresses its instance 0.
    pub fn resolve(&self, ids: &[u16]) -> Result<(ResourcePath, ResourceMeta)> {
        let mut full = self.path;
        for id in ids {
            full = full.child(*id)?;
        }
        let (Some(o), Some(r)) = (full.object_id, full.resource_id) else {
            return Err(Lwm2mError::Protocol(format!(
                "{} does not address a resource",
                full
            )));
        };
        let meta = resource_meta(self.definitions, o, r)?;
        if full.resource_instance_id.is_none() {
            if meta.multiple {
                return Err(Lwm2mError::Protocol(format!(
                    "array resource {} needs a resource instance ID",
                    full
                )));
            }
            full = full.child(0)?;
        }
        Ok((full, meta))
    }

    /// Insert the value named by `ids`. `decode` produces the value given the
    /// resource's declared type.
    pub fn insert<F>(&mut self, ids: &[u16], decode: F) -> Result<()>
    where
        F: FnOnce(ResourceType) -> Result<Value>,
    {
        let (full, meta) = self.resolve(ids)?;
        let value = decode(meta.resource_type)?;
        if value.resource_type() != meta.resource_type {
            return Err(Lwm2mError::Protocol(format!(
                "{} expects {:?}, got {:?}",
                full,
                meta.resource_type,
                value.resource_type()
            )));
        }
        let bytes = value.to_bytes();

        let mut node = &mut self.root;
        for (depth, &id) in full.ids().iter().enumerate().skip(self.path.depth()) {
            if depth == 3 {
                if node.child(id).is_some() {
                    return Err(Lwm2mError::Protocol(format!("duplicate value for {}", full)));
                }
                node.add_child(TreeNode::resource_instance(id, meta, bytes))?;
                return Ok(());
            }
            let child = match depth {
                0 => TreeNode::object(id),
                1 => TreeNode::object_instance(id),
                _ => TreeNode::resource(id, meta),
            };
            node = node.child_or_insert(child)?;
        }
        node.set_value(bytes);
        Ok(())
    }

    pub fn finish(self) -> TreeNode {
        self.root
    }
}

fn resource_meta(
    definitions: &DefinitionRegistry,
    object_id: u16,
    resource_id: u16,
) -> Result<ResourceMeta> {
    let definition = definitions.resource(object_id, resource_id)?;
    Ok(ResourceMeta::new(
        definition.resource_type,
        definition.is_multiple(),
    ))
}

/// Drop trailing NUL padding and whitespace from a text payload
pub(crate) fn trim_text(payload: &[u8]) -> &[u8] {
    let end = payload
        .iter()
        .rposition(|b| *b != 0 && !b.is_ascii_whitespace())
        .map_or(0, |p| p + 1);
    &payload[..end]
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::definition::{DefinitionRegistry, ObjectDefinition, ResourceDefinition};
    use crate::object_store::ObjectStore;
    use crate::types::ResourceType;

    /// Object 0 instance 0 with a single mandatory resource 0 of `resource_type`
    pub fn single_resource_store(resource_type: ResourceType) -> ObjectStore {
        let mut definitions = DefinitionRegistry::new();
        definitions
            .register_object(
                ObjectDefinition::new(0, "Test").mandatory().with_resource(
                    ResourceDefinition::new(0, "Res1", resource_type).mandatory(),
                ),
            )
            .unwrap();
        let mut store = ObjectStore::new(definitions);
        store.create_object_instance(0, Some(0)).unwrap();
        store
    }

    /// Object 1000 with string, integer, float, boolean, opaque, time,
    /// object link and an integer array resource
    pub fn mixed_definitions() -> DefinitionRegistry {
        let mut definitions = DefinitionRegistry::new();
        definitions
            .register_object(
                ObjectDefinition::new(1000, "Mixed")
                    .instances(0, 4)
                    .with_resource(ResourceDefinition::new(0, "Name", ResourceType::String))
                    .with_resource(ResourceDefinition::new(1, "Count", ResourceType::Integer))
                    .with_resource(ResourceDefinition::new(2, "Ratio", ResourceType::Float))
                    .with_resource(ResourceDefinition::new(3, "Enabled", ResourceType::Boolean))
                    .with_resource(ResourceDefinition::new(4, "Blob", ResourceType::Opaque))
                    .with_resource(ResourceDefinition::new(5, "Stamp", ResourceType::Time))
                    .with_resource(ResourceDefinition::new(6, "Link", ResourceType::ObjectLink))
                    .with_resource(
                        ResourceDefinition::new(7, "Samples", ResourceType::Integer).multiple(8),
                    )
                    .with_resource(ResourceDefinition::new(8, "Reset", ResourceType::None)),
            )
            .unwrap();
        definitions
    }
}
