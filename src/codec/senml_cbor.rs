//! SenML-CBOR codec
//!
//! A payload is a CBOR array of records. Each record carries an absolute
//! resource path name (key 0, optionally prefixed by a base name, key -2)
//! and one value: number (2), string (3), boolean (4), bytes (8) or object
//! link (`"vlo"`).

use ciborium::value::Value as Cbor;

use super::{Codec, TreeAssembler, flatten};
use crate::coap_types::{ContentFormat, join_path};
use crate::definition::DefinitionRegistry;
use crate::error::{Lwm2mError, Result};
use crate::path::ResourcePath;
use crate::tree::TreeNode;
use crate::types::{ResourceType, Value};

const BASE_NAME: i64 = -2;
const NAME: i64 = 0;
const NUMBER: i64 = 2;
const STRING: i64 = 3;
const BOOLEAN: i64 = 4;
const DATA: i64 = 8;
const OBJECT_LINK: &str = "vlo";

/// SenML-CBOR codec (content format 112)
#[derive(Debug, Clone, Copy, Default)]
pub struct SenmlCborCodec;

impl Codec for SenmlCborCodec {
    fn content_format(&self) -> ContentFormat {
        ContentFormat::SenmlCbor
    }

    fn serialise(&self, tree: &TreeNode, path: &ResourcePath) -> Result<Vec<u8>> {
        let mut records = Vec::new();
        for record in flatten(tree)? {
            let mut ids = path.ids();
            ids.extend_from_slice(record.name_ids());
            let ids: Vec<String> = ids.iter().map(u16::to_string).collect();

            let (key, value) = match record.value {
                Value::String(s) => (int_key(STRING), Cbor::Text(s)),
                Value::Integer(n) | Value::Time(n) => (int_key(NUMBER), Cbor::Integer(n.into())),
                Value::Float(f) => (int_key(NUMBER), Cbor::Float(f)),
                Value::Boolean(b) => (int_key(BOOLEAN), Cbor::Bool(b)),
                Value::Opaque(bytes) => (int_key(DATA), Cbor::Bytes(bytes)),
                Value::ObjectLink(link) => {
                    (Cbor::Text(OBJECT_LINK.to_string()), Cbor::Text(link.to_string()))
                }
                Value::None => {
                    return Err(Lwm2mError::Protocol(format!(
                        "executable resource {} has no value",
                        join_path(&ids)
                    )));
                }
            };
            records.push(Cbor::Map(vec![
                (int_key(NAME), Cbor::Text(join_path(&ids))),
                (key, value),
            ]));
        }

        let mut out = Vec::new();
        ciborium::into_writer(&Cbor::Array(records), &mut out)
            .map_err(|e| Lwm2mError::Protocol(format!("CBOR encode: {}", e)))?;
        Ok(out)
    }

    fn deserialise(
        &self,
        definitions: &DefinitionRegistry,
        path: &ResourcePath,
        payload: &[u8],
    ) -> Result<TreeNode> {
        let document: Cbor = ciborium::from_reader(payload)
            .map_err(|e| Lwm2mError::Protocol(format!("CBOR decode: {}", e)))?;
        let Cbor::Array(entries) = document else {
            return Err(Lwm2mError::Protocol(
                "SenML payload must be an array".to_string(),
            ));
        };

        let mut assembler = TreeAssembler::new(definitions, path)?;
        let mut base_name = String::new();
        for entry in entries {
            let record = SenmlRecord::parse(entry)?;
            if let Some(bn) = &record.base_name {
                base_name.clone_from(bn);
            }
            let name = format!("{}{}", base_name, record.name.as_deref().unwrap_or(""));
            let ids = relative_ids(path, &name)?;
            assembler.insert(&ids, |resource_type| record.decode(&name, resource_type))?;
        }
        Ok(assembler.finish())
    }
}

fn int_key(key: i64) -> Cbor {
    Cbor::Integer(key.into())
}

/// IDs of `name` below `root`
fn relative_ids(root: &ResourcePath, name: &str) -> Result<Vec<u16>> {
    let full: ResourcePath = name.parse()?;
    let (full_ids, root_ids) = (full.ids(), root.ids());
    match full_ids.strip_prefix(root_ids.as_slice()) {
        Some(rest) => Ok(rest.to_vec()),
        None => Err(Lwm2mError::Protocol(format!(
            "record {} lies outside {}",
            name, root
        ))),
    }
}

#[derive(Debug, Clone, Copy)]
enum Number {
    Int(i64),
    Float(f64),
}

#[derive(Debug, Default)]
struct SenmlRecord {
    base_name: Option<String>,
    name: Option<String>,
    number: Option<Number>,
    string: Option<String>,
    boolean: Option<bool>,
    data: Option<Vec<u8>>,
    link: Option<String>,
}

impl SenmlRecord {
    fn parse(entry: Cbor) -> Result<Self> {
        let Cbor::Map(fields) = entry else {
            return Err(Lwm2mError::Protocol(
                "SenML record must be a map".to_string(),
            ));
        };

        let mut record = Self::default();
        for (key, value) in fields {
            match (key, value) {
                (Cbor::Integer(key), value) => match (i64::try_from(key), value) {
                    (Ok(BASE_NAME), Cbor::Text(s)) => record.base_name = Some(s),
                    (Ok(NAME), Cbor::Text(s)) => record.name = Some(s),
                    (Ok(NUMBER), Cbor::Integer(n)) => {
                        let n = i64::try_from(n).map_err(|_| {
                            Lwm2mError::Protocol("SenML integer out of range".to_string())
                        })?;
                        record.number = Some(Number::Int(n));
                    }
                    (Ok(NUMBER), Cbor::Float(f)) => record.number = Some(Number::Float(f)),
                    (Ok(STRING), Cbor::Text(s)) => record.string = Some(s),
                    (Ok(BOOLEAN), Cbor::Bool(b)) => record.boolean = Some(b),
                    (Ok(DATA), Cbor::Bytes(b)) => record.data = Some(b),
                    (Ok(key @ (BASE_NAME | NAME | NUMBER | STRING | BOOLEAN | DATA)), _) => {
                        return Err(Lwm2mError::Protocol(format!(
                            "SenML field {} has the wrong type",
                            key
                        )));
                    }
                    _ => {}
                },
                (Cbor::Text(key), Cbor::Text(s)) if key == OBJECT_LINK => record.link = Some(s),
                _ => {}
            }
        }
        Ok(record)
    }

    fn decode(&self, name: &str, resource_type: ResourceType) -> Result<Value> {
        let missing = || {
            Lwm2mError::Protocol(format!(
                "record {} has no value for {:?}",
                name, resource_type
            ))
        };
        match resource_type {
            ResourceType::String => self.string.clone().map(Value::String).ok_or_else(missing),
            ResourceType::Opaque => self.data.clone().map(Value::Opaque).ok_or_else(missing),
            ResourceType::Boolean => self.boolean.map(Value::Boolean).ok_or_else(missing),
            ResourceType::Integer | ResourceType::Time => match self.number {
                Some(Number::Int(n)) if resource_type == ResourceType::Time => Ok(Value::Time(n)),
                Some(Number::Int(n)) => Ok(Value::Integer(n)),
                _ => Err(missing()),
            },
            ResourceType::Float => match self.number {
                Some(Number::Float(f)) => Ok(Value::Float(f)),
                Some(Number::Int(n)) => Ok(Value::Float(n as f64)),
                None => Err(missing()),
            },
            ResourceType::ObjectLink => self
                .link
                .as_deref()
                .ok_or_else(missing)?
                .parse()
                .map(Value::ObjectLink),
            ResourceType::None => Err(missing()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::test_support::mixed_definitions;
    use crate::object_store::ObjectStore;
    use crate::tree_builder::{RequestOrigin, create_tree_from_path};
    use crate::types::ObjectLink;

    #[test]
    fn test_round_trip_instance() {
        let mut store = ObjectStore::new(mixed_definitions());
        store.create_object_instance(1000, Some(0)).unwrap();
        store.set_value(1000, 0, 0, 0, "Open Mobile Alliance").unwrap();
        store.set_value(1000, 0, 1, 0, 2718619435i64).unwrap();
        store.set_value(1000, 0, 2, 0, 5.23f64).unwrap();
        store.set_value(1000, 0, 3, 0, false).unwrap();
        store.set_value(1000, 0, 4, 0, Value::Opaque(vec![1, 2, 3])).unwrap();
        store.set_value(1000, 0, 5, 0, Value::Time(0)).unwrap();
        store.set_value(1000, 0, 6, 0, ObjectLink::new(3, 0)).unwrap();
        store.set_value(1000, 0, 7, 4, -9i64).unwrap();

        let path = ResourcePath::instance(1000, 0);
        let tree = create_tree_from_path(&store, RequestOrigin::Client, &path).unwrap();
        let bytes = SenmlCborCodec.serialise(&tree, &path).unwrap();
        let decoded = SenmlCborCodec
            .deserialise(store.definitions(), &path, &bytes)
            .unwrap();
        assert_eq!(decoded, tree);
    }

    #[test]
    fn test_record_names_are_absolute() {
        let mut store = ObjectStore::new(mixed_definitions());
        store.create_object_instance(1000, Some(0)).unwrap();
        store.set_value(1000, 0, 7, 1, 5i64).unwrap();

        let path = ResourcePath::resource(1000, 0, 7);
        let tree = create_tree_from_path(&store, RequestOrigin::Client, &path).unwrap();
        let bytes = SenmlCborCodec.serialise(&tree, &path).unwrap();

        let document: Cbor = ciborium::from_reader(bytes.as_slice()).unwrap();
        let expected = Cbor::Array(vec![Cbor::Map(vec![
            (int_key(NAME), Cbor::Text("/1000/0/7/1".to_string())),
            (int_key(NUMBER), Cbor::Integer(5.into())),
        ])]);
        assert_eq!(document, expected);
    }

    #[test]
    fn test_base_name_applied() {
        let payload = Cbor::Array(vec![
            Cbor::Map(vec![
                (int_key(BASE_NAME), Cbor::Text("/1000/0/".to_string())),
                (int_key(NAME), Cbor::Text("1".to_string())),
                (int_key(NUMBER), Cbor::Integer(7.into())),
            ]),
            Cbor::Map(vec![
                (int_key(NAME), Cbor::Text("3".to_string())),
                (int_key(BOOLEAN), Cbor::Bool(true)),
            ]),
        ]);
        let mut bytes = Vec::new();
        ciborium::into_writer(&payload, &mut bytes).unwrap();

        let definitions = mixed_definitions();
        let tree = SenmlCborCodec
            .deserialise(&definitions, &ResourcePath::instance(1000, 0), &bytes)
            .unwrap();
        assert_eq!(tree.leaf_count(), 2);
        assert_eq!(
            tree.child(3).unwrap().child(0).unwrap().value(),
            Some(&[1u8][..])
        );
    }

    #[test]
    fn test_malformed_payload_rejected() {
        let definitions = mixed_definitions();
        let path = ResourcePath::instance(1000, 0);

        let mut not_array = Vec::new();
        ciborium::into_writer(&Cbor::Integer(1.into()), &mut not_array).unwrap();
        assert!(SenmlCborCodec.deserialise(&definitions, &path, &not_array).is_err());
        assert!(SenmlCborCodec.deserialise(&definitions, &path, &[0xff, 0x00]).is_err());

        let outside = Cbor::Array(vec![Cbor::Map(vec![
            (int_key(NAME), Cbor::Text("/3/0/1".to_string())),
            (int_key(STRING), Cbor::Text("x".to_string())),
        ])]);
        let mut bytes = Vec::new();
        ciborium::into_writer(&outside, &mut bytes).unwrap();
        assert!(SenmlCborCodec.deserialise(&definitions, &path, &bytes).is_err());
    }
}
