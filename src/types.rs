//! LWM2M resource data types and their internal byte representation
//!
//! Values held by the object store (and carried by resource tree leaves) are
//! plain byte buffers. Fixed-size types use the native-endian memory layout an
//! application handler would hand over: 8 bytes for Integer, Float and Time,
//! 1 byte for Boolean, 4 bytes (object ID, instance ID) for ObjectLink.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Lwm2mError, Result};

pub type ObjectId = u16;
pub type InstanceId = u16;
pub type ResourceId = u16;
pub type ResourceInstanceId = u16;

/// Reserved ID meaning "undefined"; never a valid object/instance/resource ID
pub const INVALID_ID: u16 = u16::MAX;

/// Resource data types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    /// Executable resources carry no value
    None,
    String,
    Integer,
    Float,
    Boolean,
    Opaque,
    Time,
    ObjectLink,
}

impl ResourceType {
    /// Size of the internal representation, or `None` for variable-size types
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            Self::Integer | Self::Float | Self::Time => Some(8),
            Self::Boolean => Some(1),
            Self::ObjectLink => Some(4),
            Self::None => Some(0),
            Self::String | Self::Opaque => None,
        }
    }

    /// Value used when a resource is created without an explicit default
    pub fn default_bytes(self) -> Vec<u8> {
        vec![0; self.fixed_size().unwrap_or(0)]
    }

    /// Check that `len` bytes is a valid internal length for this type
    pub fn check_length(self, len: usize) -> Result<()> {
        match self.fixed_size() {
            Some(size) if len > size => Err(Lwm2mError::capacity(
                format!("{:?} value of {} bytes", self, len),
                size,
            )),
            Some(size) if len < size => Err(Lwm2mError::Protocol(format!(
                "{:?} value must be {} bytes, got {}",
                self, size, len
            ))),
            _ => Ok(()),
        }
    }
}

/// Reference to an object instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectLink {
    pub object_id: ObjectId,
    pub instance_id: InstanceId,
}

impl ObjectLink {
    pub fn new(object_id: ObjectId, instance_id: InstanceId) -> Self {
        Self {
            object_id,
            instance_id,
        }
    }
}

impl fmt::Display for ObjectLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_id, self.instance_id)
    }
}

impl FromStr for ObjectLink {
    type Err = Lwm2mError;

    fn from_str(s: &str) -> Result<Self> {
        let (object, instance) = s
            .split_once(':')
            .ok_or_else(|| Lwm2mError::Protocol(format!("invalid object link: {}", s)))?;
        let parse = |part: &str| {
            part.trim()
                .parse::<u16>()
                .map_err(|_| Lwm2mError::Protocol(format!("invalid object link: {}", s)))
        };
        Ok(Self::new(parse(object)?, parse(instance)?))
    }
}

/// A typed resource value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Opaque(Vec<u8>),
    Time(i64),
    ObjectLink(ObjectLink),
}

impl Value {
    /// The resource type this value belongs to
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Self::None => ResourceType::None,
            Self::String(_) => ResourceType::String,
            Self::Integer(_) => ResourceType::Integer,
            Self::Float(_) => ResourceType::Float,
            Self::Boolean(_) => ResourceType::Boolean,
            Self::Opaque(_) => ResourceType::Opaque,
            Self::Time(_) => ResourceType::Time,
            Self::ObjectLink(_) => ResourceType::ObjectLink,
        }
    }

    /// Encode to the internal byte representation
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::None => Vec::new(),
            Self::String(s) => s.as_bytes().to_vec(),
            Self::Integer(n) | Self::Time(n) => n.to_ne_bytes().to_vec(),
            Self::Float(f) => f.to_ne_bytes().to_vec(),
            Self::Boolean(b) => vec![u8::from(*b)],
            Self::Opaque(bytes) => bytes.clone(),
            Self::ObjectLink(link) => {
                let mut bytes = link.object_id.to_ne_bytes().to_vec();
                bytes.extend_from_slice(&link.instance_id.to_ne_bytes());
                bytes
            }
        }
    }

    /// Decode from the internal byte representation of `resource_type`
    pub fn from_bytes(resource_type: ResourceType, bytes: &[u8]) -> Result<Self> {
        resource_type.check_length(bytes.len())?;

        let value = match resource_type {
            ResourceType::None => Self::None,
            ResourceType::String => Self::String(
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| Lwm2mError::Protocol(format!("invalid UTF-8 string: {}", e)))?,
            ),
            ResourceType::Integer => Self::Integer(i64::from_ne_bytes(fixed(bytes)?)),
            ResourceType::Time => Self::Time(i64::from_ne_bytes(fixed(bytes)?)),
            ResourceType::Float => Self::Float(f64::from_ne_bytes(fixed(bytes)?)),
            ResourceType::Boolean => Self::Boolean(bytes[0] != 0),
            ResourceType::Opaque => Self::Opaque(bytes.to_vec()),
            ResourceType::ObjectLink => Self::ObjectLink(ObjectLink::new(
                u16::from_ne_bytes([bytes[0], bytes[1]]),
                u16::from_ne_bytes([bytes[2], bytes[3]]),
            )),
        };
        Ok(value)
    }
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| Lwm2mError::Protocol(format!("expected {} bytes, got {}", N, bytes.len())))
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<ObjectLink> for Value {
    fn from(link: ObjectLink) -> Self {
        Self::ObjectLink(link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_sizes() {
        assert_eq!(ResourceType::Integer.fixed_size(), Some(8));
        assert_eq!(ResourceType::Boolean.fixed_size(), Some(1));
        assert_eq!(ResourceType::Time.fixed_size(), Some(8));
        assert_eq!(ResourceType::Float.fixed_size(), Some(8));
        assert_eq!(ResourceType::String.fixed_size(), None);
    }

    #[test]
    fn test_integer_bytes() {
        let bytes = Value::Integer(0xA20AD72B).to_bytes();
        assert_eq!(bytes.len(), 8);
        assert_eq!(
            Value::from_bytes(ResourceType::Integer, &bytes).unwrap(),
            Value::Integer(0xA20AD72B)
        );
    }

    #[test]
    fn test_wrong_length_rejected() {
        let err = Value::from_bytes(ResourceType::Boolean, &[1, 0]).unwrap_err();
        assert!(matches!(err, Lwm2mError::Capacity { capacity: 1, .. }));

        let err = Value::from_bytes(ResourceType::Integer, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, Lwm2mError::Protocol(_)));
    }

    #[test]
    fn test_object_link_parse() {
        let link: ObjectLink = "3:5".parse().unwrap();
        assert_eq!(link, ObjectLink::new(3, 5));
        assert_eq!(link.to_string(), "3:5");
        assert!("3".parse::<ObjectLink>().is_err());
    }

    #[test]
    fn test_invalid_utf8_string() {
        assert!(Value::from_bytes(ResourceType::String, &[0xff, 0xfe]).is_err());
    }
}
