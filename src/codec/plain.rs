//! Plain text codec for single resource values
//!
//! Booleans are `1`/`0`, opaque values are base64, object links `o:i`.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

use super::{Codec, TreeAssembler, single_value, trim_text};
use crate::coap_types::ContentFormat;
use crate::definition::DefinitionRegistry;
use crate::error::{Lwm2mError, Result};
use crate::path::ResourcePath;
use crate::tree::TreeNode;
use crate::types::{ResourceType, Value};

/// Plain text codec for content formats 0 and 1541
#[derive(Debug, Clone, Copy)]
pub struct PlainTextCodec {
    format: ContentFormat,
}

impl PlainTextCodec {
    pub fn new(format: ContentFormat) -> Self {
        Self { format }
    }
}

impl Default for PlainTextCodec {
    fn default() -> Self {
        Self::new(ContentFormat::Lwm2mText)
    }
}

impl Codec for PlainTextCodec {
    fn content_format(&self) -> ContentFormat {
        self.format
    }

    fn serialise(&self, tree: &TreeNode, _path: &ResourcePath) -> Result<Vec<u8>> {
        let text = match single_value(tree, self.format)?.value {
            Value::String(s) => s,
            Value::Integer(n) | Value::Time(n) => n.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Boolean(b) => (if b { "1" } else { "0" }).to_string(),
            Value::Opaque(bytes) => BASE64.encode(bytes),
            Value::ObjectLink(link) => link.to_string(),
            Value::None => String::new(),
        };
        Ok(text.into_bytes())
    }

    fn deserialise(
        &self,
        definitions: &DefinitionRegistry,
        path: &ResourcePath,
        payload: &[u8],
    ) -> Result<TreeNode> {
        let text = std::str::from_utf8(trim_text(payload))
            .map_err(|e| Lwm2mError::Protocol(format!("invalid UTF-8 text: {}", e)))?;

        let mut assembler = TreeAssembler::new(definitions, path)?;
        assembler.insert(&[], |resource_type| parse_text(resource_type, text))?;
        Ok(assembler.finish())
    }
}

fn parse_text(resource_type: ResourceType, text: &str) -> Result<Value> {
    let invalid = || Lwm2mError::Protocol(format!("'{}' is not a valid {:?}", text, resource_type));
    match resource_type {
        ResourceType::String => Ok(Value::String(text.to_string())),
        ResourceType::Integer => text.trim().parse().map(Value::Integer).map_err(|_| invalid()),
        ResourceType::Time => text.trim().parse().map(Value::Time).map_err(|_| invalid()),
        ResourceType::Float => text.trim().parse().map(Value::Float).map_err(|_| invalid()),
        ResourceType::Boolean => match text.trim() {
            "1" => Ok(Value::Boolean(true)),
            "0" => Ok(Value::Boolean(false)),
            _ => Err(invalid()),
        },
        ResourceType::Opaque => BASE64
            .decode(text.trim())
            .map(Value::Opaque)
            .map_err(|_| invalid()),
        ResourceType::ObjectLink => text.parse().map(Value::ObjectLink),
        ResourceType::None => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::test_support::mixed_definitions;

    fn round_trip(resource_id: u16, text: &str) -> String {
        let definitions = mixed_definitions();
        let path = ResourcePath::resource(1000, 0, resource_id);
        let codec = PlainTextCodec::default();
        let tree = codec.deserialise(&definitions, &path, text.as_bytes()).unwrap();
        String::from_utf8(codec.serialise(&tree, &path).unwrap()).unwrap()
    }

    #[test]
    fn test_values() {
        assert_eq!(round_trip(0, "Open Mobile Alliance"), "Open Mobile Alliance");
        assert_eq!(round_trip(1, "-17"), "-17");
        assert_eq!(round_trip(2, "5.23"), "5.23");
        assert_eq!(round_trip(3, "1"), "1");
        assert_eq!(round_trip(4, "T3BlbiBNb2JpbGUgQWxsaWFuY2U="), "T3BlbiBNb2JpbGUgQWxsaWFuY2U=");
        assert_eq!(round_trip(5, "1700000000\0"), "1700000000");
        assert_eq!(round_trip(6, "3:0"), "3:0");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let definitions = mixed_definitions();
        let codec = PlainTextCodec::default();
        for (resource_id, text) in [(1, "abc"), (3, "true"), (4, "!!"), (6, "3")] {
            let path = ResourcePath::resource(1000, 0, resource_id);
            assert!(codec.deserialise(&definitions, &path, text.as_bytes()).is_err());
        }
    }

    #[test]
    fn test_requires_single_value() {
        let definitions = mixed_definitions();
        let codec = PlainTextCodec::default();

        let err = codec
            .deserialise(&definitions, &ResourcePath::instance(1000, 0), b"1")
            .unwrap_err();
        assert!(matches!(err, Lwm2mError::Protocol(_)));

        let err = codec
            .serialise(&TreeNode::object_instance(0), &ResourcePath::instance(1000, 0))
            .unwrap_err();
        assert!(matches!(err, Lwm2mError::Protocol(_)));
    }
}
