//! LWM2M JSON codec
//!
//! Output layout is fixed byte-for-byte:
//!
//! ```text
//! {"e":[
//! {"n":"0/0","sv":"Open Mobile Alliance"},
//! {"n":"1/0","v":42}]
//! }
//! ```
//!
//! followed by a newline. Names are relative to the serialised node.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::Deserialize;

use super::{Codec, Record, TreeAssembler, flatten, trim_text};
use crate::coap_types::ContentFormat;
use crate::definition::DefinitionRegistry;
use crate::error::{Lwm2mError, Result};
use crate::path::ResourcePath;
use crate::tree::TreeNode;
use crate::types::{ResourceType, Value};

/// JSON codec for content formats 1543 and 11543
#[derive(Debug, Clone, Copy)]
pub struct JsonCodec {
    format: ContentFormat,
}

impl JsonCodec {
    pub fn new(format: ContentFormat) -> Self {
        Self { format }
    }
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self::new(ContentFormat::Lwm2mJson)
    }
}

impl Codec for JsonCodec {
    fn content_format(&self) -> ContentFormat {
        self.format
    }

    fn serialise(&self, tree: &TreeNode, _path: &ResourcePath) -> Result<Vec<u8>> {
        let entries = flatten(tree)?
            .iter()
            .map(encode_entry)
            .collect::<Result<Vec<_>>>()?;

        let mut out = String::from("{\"e\":[\n");
        out.push_str(&entries.join(",\n"));
        out.push_str("]\n}\n");
        Ok(out.into_bytes())
    }

    fn deserialise(
        &self,
        definitions: &DefinitionRegistry,
        path: &ResourcePath,
        payload: &[u8],
    ) -> Result<TreeNode> {
        let document: Document = serde_json::from_slice(trim_text(payload))
            .map_err(|e| Lwm2mError::Protocol(format!("malformed JSON payload: {}", e)))?;

        let mut assembler = TreeAssembler::new(definitions, path)?;
        for entry in document.e {
            let name = entry.n.as_deref().unwrap_or("");
            let ids = parse_name(name)?;
            assembler.insert(&ids, |resource_type| entry.decode(name, resource_type))?;
        }
        Ok(assembler.finish())
    }
}

fn encode_entry(record: &Record) -> Result<String> {
    let name = serde_json::to_string(&record.name())?;
    let (tag, value) = match &record.value {
        Value::String(s) => ("sv", serde_json::to_string(s)?),
        Value::Opaque(bytes) => ("sv", format!("\"{}\"", BASE64.encode(bytes))),
        Value::Integer(n) | Value::Time(n) => ("v", n.to_string()),
        Value::Float(f) if f.is_finite() => ("v", format!("{:.6}", f)),
        Value::Float(f) => {
            return Err(Lwm2mError::Protocol(format!(
                "{} cannot be represented in JSON",
                f
            )));
        }
        Value::Boolean(b) => ("bv", format!("\"{}\"", b)),
        Value::ObjectLink(link) => ("ov", format!("\"{}\"", link)),
        Value::None => {
            return Err(Lwm2mError::Protocol(format!(
                "executable resource {} has no value",
                record.name()
            )));
        }
    };
    Ok(format!("{{\"n\":{},\"{}\":{}}}", name, tag, value))
}

fn parse_name(name: &str) -> Result<Vec<u16>> {
    name.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse()
                .map_err(|_| Lwm2mError::Protocol(format!("invalid entry name '{}'", name)))
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct Document {
    e: Vec<Entry>,
}

#[derive(Debug, Deserialize)]
struct Entry {
    n: Option<String>,
    v: Option<serde_json::Number>,
    sv: Option<String>,
    bv: Option<BoolValue>,
    ov: Option<String>,
}

/// `bv` is written quoted but unquoted booleans are accepted too
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BoolValue {
    Bool(bool),
    Text(String),
}

impl Entry {
    fn decode(&self, name: &str, resource_type: ResourceType) -> Result<Value> {
        let missing = |tag: &str| {
            Lwm2mError::Protocol(format!(
                "entry '{}' needs a '{}' value for {:?}",
                name, tag, resource_type
            ))
        };
        let number = || self.v.as_ref().ok_or_else(|| missing("v"));
        let integer = || {
            number()?
                .as_i64()
                .ok_or_else(|| Lwm2mError::Protocol(format!("entry '{}' is not an integer", name)))
        };

        match resource_type {
            ResourceType::String => Ok(Value::String(
                self.sv.clone().ok_or_else(|| missing("sv"))?,
            )),
            ResourceType::Opaque => {
                let text = self.sv.as_deref().ok_or_else(|| missing("sv"))?;
                BASE64
                    .decode(text)
                    .map(Value::Opaque)
                    .map_err(|e| Lwm2mError::Protocol(format!("entry '{}': base64 decode: {}", name, e)))
            }
            ResourceType::Integer => Ok(Value::Integer(integer()?)),
            ResourceType::Time => Ok(Value::Time(integer()?)),
            ResourceType::Float => number()?
                .as_f64()
                .map(Value::Float)
                .ok_or_else(|| Lwm2mError::Protocol(format!("entry '{}' is not a number", name))),
            ResourceType::Boolean => match self.bv.as_ref().ok_or_else(|| missing("bv"))? {
                BoolValue::Bool(b) => Ok(Value::Boolean(*b)),
                BoolValue::Text(text) => match text.as_str() {
                    "true" => Ok(Value::Boolean(true)),
                    "false" => Ok(Value::Boolean(false)),
                    other => Err(Lwm2mError::Protocol(format!(
                        "entry '{}': invalid boolean '{}'",
                        name, other
                    ))),
                },
            },
            ResourceType::ObjectLink => self
                .ov
                .as_deref()
                .ok_or_else(|| missing("ov"))?
                .parse()
                .map(Value::ObjectLink),
            ResourceType::None => Err(Lwm2mError::Protocol(format!(
                "entry '{}' names an executable resource",
                name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::test_support::{mixed_definitions, single_resource_store};
    use crate::tree::NodeKind;
    use crate::tree_builder::{RequestOrigin, create_tree_from_object};
    use crate::types::ObjectLink;

    fn serialise_object_zero(value: Value) -> String {
        let mut store = single_resource_store(value.resource_type());
        store.set_value(0, 0, 0, 0, value).unwrap();
        let tree = create_tree_from_object(&store, RequestOrigin::Client, 0).unwrap();
        let bytes = JsonCodec::default()
            .serialise(&tree, &ResourcePath::object(0))
            .unwrap();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_serialise_string() {
        assert_eq!(
            serialise_object_zero(Value::String("Open Mobile Alliance".into())),
            "{\"e\":[\n{\"n\":\"0/0\",\"sv\":\"Open Mobile Alliance\"}]\n}\n"
        );
    }

    #[test]
    fn test_serialise_opaque() {
        assert_eq!(
            serialise_object_zero(Value::Opaque(b"Open Mobile Alliance".to_vec())),
            "{\"e\":[\n{\"n\":\"0/0\",\"sv\":\"T3BlbiBNb2JpbGUgQWxsaWFuY2U=\"}]\n}\n"
        );
    }

    #[test]
    fn test_serialise_integer() {
        assert_eq!(
            serialise_object_zero(Value::Integer(9001)),
            "{\"e\":[\n{\"n\":\"0/0\",\"v\":9001}]\n}\n"
        );
    }

    #[test]
    fn test_serialise_float() {
        assert_eq!(
            serialise_object_zero(Value::Float(5.23)),
            "{\"e\":[\n{\"n\":\"0/0\",\"v\":5.230000}]\n}\n"
        );
    }

    #[test]
    fn test_serialise_boolean() {
        assert_eq!(
            serialise_object_zero(Value::Boolean(true)),
            "{\"e\":[\n{\"n\":\"0/0\",\"bv\":\"true\"}]\n}\n"
        );
    }

    #[test]
    fn test_serialise_time_and_link() {
        assert_eq!(
            serialise_object_zero(Value::Time(1_700_000_000)),
            "{\"e\":[\n{\"n\":\"0/0\",\"v\":1700000000}]\n}\n"
        );
        assert_eq!(
            serialise_object_zero(Value::ObjectLink(ObjectLink::new(3, 1))),
            "{\"e\":[\n{\"n\":\"0/0\",\"ov\":\"3:1\"}]\n}\n"
        );
    }

    #[test]
    fn test_string_escaping() {
        assert_eq!(
            serialise_object_zero(Value::String("say \"hi\"".into())),
            "{\"e\":[\n{\"n\":\"0/0\",\"sv\":\"say \\\"hi\\\"\"}]\n}\n"
        );
    }

    #[test]
    fn test_empty_tree() {
        let bytes = JsonCodec::default()
            .serialise(&TreeNode::object(0), &ResourcePath::object(0))
            .unwrap();
        assert_eq!(bytes, b"{\"e\":[\n]\n}\n");
    }

    #[test]
    fn test_deserialise_instance() {
        let input = "{\"e\":[\n\
            {\"n\":\"7/0\",\"v\":1},\n\
            {\"n\":\"0\",\"sv\":\"sensor\"},\n\
            {\"n\":\"7/3\",\"v\":5},\n\
            {\"n\":\"1\",\"v\":2718619435},\n\
            {\"n\":\"2\",\"v\":0.5},\n\
            {\"n\":\"3\",\"bv\":\"false\"},\n\
            {\"n\":\"4\",\"sv\":\"AAEC\"},\n\
            {\"n\":\"6\",\"ov\":\"3:0\"}]\n\
            }\0";
        let definitions = mixed_definitions();
        let tree = JsonCodec::default()
            .deserialise(&definitions, &ResourcePath::instance(1000, 0), input.as_bytes())
            .unwrap();

        assert_eq!(tree.kind(), NodeKind::ObjectInstance);
        assert_eq!(tree.child_count(), 7);
        assert_eq!(tree.leaf_count(), 8);

        let value = |r: u16, ri: u16| {
            let leaf = tree.child(r).unwrap().child(ri).unwrap();
            Value::from_bytes(leaf.meta().unwrap().resource_type, leaf.value().unwrap()).unwrap()
        };
        assert_eq!(value(0, 0), Value::String("sensor".into()));
        assert_eq!(value(1, 0), Value::Integer(0xA20AD72B));
        assert_eq!(value(2, 0), Value::Float(0.5));
        assert_eq!(value(3, 0), Value::Boolean(false));
        assert_eq!(value(4, 0), Value::Opaque(vec![0, 1, 2]));
        assert_eq!(value(6, 0), Value::ObjectLink(ObjectLink::new(3, 0)));
        assert_eq!(value(7, 3), Value::Integer(5));
    }

    #[test]
    fn test_round_trip_all_types() {
        let definitions = mixed_definitions();
        let mut store = crate::object_store::ObjectStore::new(definitions);
        store.create_object_instance(1000, Some(0)).unwrap();
        store.set_value(1000, 0, 0, 0, "name").unwrap();
        store.set_value(1000, 0, 1, 0, -42i64).unwrap();
        store.set_value(1000, 0, 2, 0, 1.25f64).unwrap();
        store.set_value(1000, 0, 3, 0, true).unwrap();
        store.set_value(1000, 0, 4, 0, Value::Opaque(vec![0xde, 0xad])).unwrap();
        store.set_value(1000, 0, 5, 0, Value::Time(86_400)).unwrap();
        store.set_value(1000, 0, 6, 0, ObjectLink::new(4, 2)).unwrap();
        store.set_value(1000, 0, 7, 3, 30i64).unwrap();

        let path = ResourcePath::object(1000);
        let tree = create_tree_from_object(&store, RequestOrigin::Client, 1000).unwrap();
        let codec = JsonCodec::default();
        let bytes = codec.serialise(&tree, &path).unwrap();
        let decoded = codec.deserialise(store.definitions(), &path, &bytes).unwrap();
        assert_eq!(decoded, tree);
    }

    #[test]
    fn test_malformed_payload_rejected() {
        let definitions = mixed_definitions();
        let path = ResourcePath::instance(1000, 0);
        let codec = JsonCodec::default();

        for input in [
            &b"{\"e\":"[..],
            &b"[1,2]"[..],
            &b"{\"e\":[{\"n\":\"x\",\"v\":1}]}"[..],
            &b"{\"e\":[{\"n\":\"1\",\"sv\":\"not a number\"}]}"[..],
            &b"{\"e\":[{\"n\":\"3\",\"bv\":\"yes\"}]}"[..],
        ] {
            let err = codec.deserialise(&definitions, &path, input).unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::Protocol, "{:?}", input);
        }
    }

    #[test]
    fn test_resource_level_names() {
        let definitions = mixed_definitions();
        let codec = JsonCodec::default();

        let path = ResourcePath::resource(1000, 0, 7);
        let tree = codec
            .deserialise(&definitions, &path, b"{\"e\":[{\"n\":\"1\",\"v\":3}]}")
            .unwrap();
        let bytes = codec.serialise(&tree, &path).unwrap();
        assert_eq!(bytes, b"{\"e\":[\n{\"n\":\"1\",\"v\":3}]\n}\n");

        let path = ResourcePath::resource(1000, 0, 1);
        let tree = codec
            .deserialise(&definitions, &path, b"{\"e\":[{\"n\":\"\",\"v\":3}]}")
            .unwrap();
        let bytes = codec.serialise(&tree, &path).unwrap();
        assert_eq!(bytes, b"{\"e\":[\n{\"n\":\"\",\"v\":3}]\n}\n");
    }
}
