//! Raw octet-stream codec for single Opaque resource values

use super::{Codec, TreeAssembler, single_value};
use crate::coap_types::ContentFormat;
use crate::definition::DefinitionRegistry;
use crate::error::{Lwm2mError, Result};
use crate::path::ResourcePath;
use crate::tree::TreeNode;
use crate::types::{ResourceType, Value};

/// Octet-stream codec (content format 42)
#[derive(Debug, Clone, Copy, Default)]
pub struct OpaqueCodec;

impl Codec for OpaqueCodec {
    fn content_format(&self) -> ContentFormat {
        ContentFormat::OctetStream
    }

    fn serialise(&self, tree: &TreeNode, _path: &ResourcePath) -> Result<Vec<u8>> {
        match single_value(tree, ContentFormat::OctetStream)?.value {
            Value::Opaque(bytes) => Ok(bytes),
            _ => Err(Lwm2mError::UnsupportedContentType(
                ContentFormat::OctetStream.as_u16(),
            )),
        }
    }

    fn deserialise(
        &self,
        definitions: &DefinitionRegistry,
        path: &ResourcePath,
        payload: &[u8],
    ) -> Result<TreeNode> {
        let mut assembler = TreeAssembler::new(definitions, path)?;
        assembler.insert(&[], |resource_type| match resource_type {
            ResourceType::Opaque => Ok(Value::Opaque(payload.to_vec())),
            _ => Err(Lwm2mError::UnsupportedContentType(
                ContentFormat::OctetStream.as_u16(),
            )),
        })?;
        Ok(assembler.finish())
    }
}
