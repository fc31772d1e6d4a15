//! LWM2M resource path addressing
//!
//! Paths have the textual form `/<object>/<instance>/<resource>/<resource-instance>`,
//! with trailing levels omitted for coarser-grained operations.

use std::fmt;
use std::str::FromStr;

use crate::error::{Lwm2mError, Result};
use crate::types::{INVALID_ID, InstanceId, ObjectId, ResourceId, ResourceInstanceId};

/// A (possibly partial) path into the object hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ResourcePath {
    pub object_id: Option<ObjectId>,
    pub instance_id: Option<InstanceId>,
    pub resource_id: Option<ResourceId>,
    pub resource_instance_id: Option<ResourceInstanceId>,
}

impl ResourcePath {
    /// The root path `/`
    pub fn root() -> Self {
        Self::default()
    }

    pub fn object(object_id: ObjectId) -> Self {
        Self {
            object_id: Some(object_id),
            ..Self::default()
        }
    }

    pub fn instance(object_id: ObjectId, instance_id: InstanceId) -> Self {
        Self {
            instance_id: Some(instance_id),
            ..Self::object(object_id)
        }
    }

    pub fn resource(object_id: ObjectId, instance_id: InstanceId, resource_id: ResourceId) -> Self {
        Self {
            resource_id: Some(resource_id),
            ..Self::instance(object_id, instance_id)
        }
    }

    pub fn resource_instance(
        object_id: ObjectId,
        instance_id: InstanceId,
        resource_id: ResourceId,
        resource_instance_id: ResourceInstanceId,
    ) -> Self {
        Self {
            resource_instance_id: Some(resource_instance_id),
            ..Self::resource(object_id, instance_id, resource_id)
        }
    }

    /// Build a path from up to four IDs
    pub fn from_ids(ids: &[u16]) -> Result<Self> {
        let mut path = Self::root();
        for &id in ids {
            path = path.child(id)?;
        }
        Ok(path)
    }

    /// Number of levels present (0 for the root)
    pub fn depth(&self) -> usize {
        self.ids().len()
    }

    pub fn is_root(&self) -> bool {
        self.object_id.is_none()
    }

    /// The IDs of all present levels, outermost first
    pub fn ids(&self) -> Vec<u16> {
        [
            self.object_id,
            self.instance_id,
            self.resource_id,
            self.resource_instance_id,
        ]
        .into_iter()
        .map_while(|id| id)
        .collect()
    }

    /// Path one level deeper
    pub fn child(&self, id: u16) -> Result<Self> {
        if id == INVALID_ID {
            return Err(Lwm2mError::Protocol(format!(
                "ID {} is reserved",
                INVALID_ID
            )));
        }
        let mut path = *self;
        match self.depth() {
            0 => path.object_id = Some(id),
            1 => path.instance_id = Some(id),
            2 => path.resource_id = Some(id),
            3 => path.resource_instance_id = Some(id),
            _ => {
                return Err(Lwm2mError::Protocol(format!(
                    "path {} cannot be extended",
                    self
                )));
            }
        }
        Ok(path)
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids = self.ids();
        if ids.is_empty() {
            return f.write_str("/");
        }
        for id in ids {
            write!(f, "/{}", id)?;
        }
        Ok(())
    }
}

impl FromStr for ResourcePath {
    type Err = Lwm2mError;

    fn from_str(s: &str) -> Result<Self> {
        let mut path = Self::root();
        for part in s.split('/').filter(|p| !p.is_empty()) {
            let id: u16 = part
                .parse()
                .map_err(|_| Lwm2mError::Protocol(format!("invalid path segment '{}' in {}", part, s)))?;
            path = path.child(id)?;
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_path() {
        let path: ResourcePath = "/3/0/6/1".parse().unwrap();
        assert_eq!(path, ResourcePath::resource_instance(3, 0, 6, 1));
        assert_eq!(path.depth(), 4);
        assert_eq!(path.to_string(), "/3/0/6/1");
    }

    #[test]
    fn test_parse_partial_paths() {
        assert_eq!("/3".parse::<ResourcePath>().unwrap(), ResourcePath::object(3));
        assert_eq!("3/0/".parse::<ResourcePath>().unwrap(), ResourcePath::instance(3, 0));
        assert!("/".parse::<ResourcePath>().unwrap().is_root());
        assert_eq!(ResourcePath::root().to_string(), "/");
    }

    #[test]
    fn test_rejects_invalid_paths() {
        assert!("/3/x".parse::<ResourcePath>().is_err());
        assert!("/3/0/1/2/3".parse::<ResourcePath>().is_err());
        assert!("/65535".parse::<ResourcePath>().is_err());
        assert!("/70000".parse::<ResourcePath>().is_err());
    }
}
