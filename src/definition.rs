//! Object and resource type definitions
//!
//! Definitions are immutable once registered: redefinition is rejected, never
//! merged.

use std::collections::BTreeMap;
use std::fmt;

use crate::callback::SharedHandler;
use crate::error::{Lwm2mError, Result};
use crate::types::{INVALID_ID, ObjectId, ResourceId, ResourceType, Value};

/// Permitted operations on a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Operations(u8);

impl Operations {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(0b001);
    pub const WRITE: Self = Self(0b010);
    pub const EXECUTE: Self = Self(0b100);
    pub const READ_WRITE: Self = Self(0b011);
    pub const READ_EXECUTE: Self = Self(0b101);
    pub const WRITE_EXECUTE: Self = Self(0b110);
    pub const READ_WRITE_EXECUTE: Self = Self(0b111);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn can_read(self) -> bool {
        self.contains(Self::READ)
    }

    pub fn can_write(self) -> bool {
        self.contains(Self::WRITE)
    }

    pub fn can_execute(self) -> bool {
        self.contains(Self::EXECUTE)
    }
}

impl std::ops::BitOr for Operations {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Where resource values live
#[derive(Clone)]
pub enum ResourceStorage {
    /// Managed by the object store, initialised from `default`
    Internal { default: Vec<u8> },
    /// Every access is forwarded to the application handler
    External(SharedHandler),
}

impl fmt::Debug for ResourceStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal { default } => f
                .debug_struct("Internal")
                .field("default", default)
                .finish(),
            Self::External(_) => f.write_str("External(..)"),
        }
    }
}

/// Definition of a resource within an object
#[derive(Debug, Clone)]
pub struct ResourceDefinition {
    pub id: ResourceId,
    pub name: String,
    pub resource_type: ResourceType,
    pub min_instances: u16,
    pub max_instances: u16,
    pub operations: Operations,
    /// Upper bound on the stored value length for variable-size types
    pub max_size: Option<usize>,
    pub storage: ResourceStorage,
}

impl ResourceDefinition {
    /// Optional single-instance resource with internal storage. Type `None`
    /// defaults to Execute, everything else to ReadWrite.
    pub fn new(id: ResourceId, name: impl Into<String>, resource_type: ResourceType) -> Self {
        let operations = if resource_type == ResourceType::None {
            Operations::EXECUTE
        } else {
            Operations::READ_WRITE
        };
        Self {
            id,
            name: name.into(),
            resource_type,
            min_instances: 0,
            max_instances: 1,
            operations,
            max_size: None,
            storage: ResourceStorage::Internal {
                default: resource_type.default_bytes(),
            },
        }
    }

    pub fn mandatory(mut self) -> Self {
        self.min_instances = self.min_instances.max(1);
        self
    }

    /// Make this an array resource holding up to `max_instances` instances
    pub fn multiple(mut self, max_instances: u16) -> Self {
        self.max_instances = max_instances.max(2);
        self
    }

    pub fn operations(mut self, operations: Operations) -> Self {
        self.operations = operations;
        self
    }

    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.storage = ResourceStorage::Internal {
            default: value.into().to_bytes(),
        };
        self
    }

    pub fn handler(mut self, handler: SharedHandler) -> Self {
        self.storage = ResourceStorage::External(handler);
        self
    }

    pub fn is_mandatory(&self) -> bool {
        self.min_instances > 0
    }

    pub fn is_multiple(&self) -> bool {
        self.max_instances > 1
    }

    pub fn external_handler(&self) -> Option<&SharedHandler> {
        match &self.storage {
            ResourceStorage::External(handler) => Some(handler),
            ResourceStorage::Internal { .. } => None,
        }
    }

    /// Check that a value of `len` bytes fits this resource
    pub fn check_value_length(&self, len: usize) -> Result<()> {
        self.resource_type.check_length(len)?;
        match self.max_size {
            Some(max) if len > max => Err(Lwm2mError::capacity(
                format!("value of {} bytes for resource {}", len, self.id),
                max,
            )),
            _ => Ok(()),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.id == INVALID_ID {
            return Err(Lwm2mError::OperationInvalid(format!(
                "resource ID {} is reserved",
                INVALID_ID
            )));
        }
        let is_none = self.resource_type == ResourceType::None;
        if !is_none && self.operations.can_execute() {
            return Err(Lwm2mError::OperationInvalid(format!(
                "resource {} ({}): executable resources must have type None",
                self.id, self.name
            )));
        }
        if is_none && self.operations != Operations::EXECUTE {
            return Err(Lwm2mError::OperationInvalid(format!(
                "resource {} ({}): type None resources are Execute-only",
                self.id, self.name
            )));
        }
        if self.min_instances > self.max_instances {
            return Err(Lwm2mError::OperationInvalid(format!(
                "resource {} ({}): minimum instances exceed maximum",
                self.id, self.name
            )));
        }
        if let ResourceStorage::Internal { default } = &self.storage
            && !is_none
        {
            self.check_value_length(default.len())?;
        }
        Ok(())
    }
}

/// Definition of an object type
#[derive(Clone)]
pub struct ObjectDefinition {
    pub id: ObjectId,
    pub name: String,
    pub min_instances: u16,
    pub max_instances: u16,
    /// Receives CreateObjectInstance / DeleteObjectInstance
    pub handler: Option<SharedHandler>,
    resources: BTreeMap<ResourceId, ResourceDefinition>,
    // IDs passed to `with_resource` more than once
    duplicates: Vec<ResourceId>,
}

impl fmt::Debug for ObjectDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("min_instances", &self.min_instances)
            .field("max_instances", &self.max_instances)
            .field("handler", &self.handler.is_some())
            .field("resources", &self.resources)
            .finish()
    }
}

impl ObjectDefinition {
    /// Single-instance optional object
    pub fn new(id: ObjectId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            min_instances: 0,
            max_instances: 1,
            handler: None,
            resources: BTreeMap::new(),
            duplicates: Vec::new(),
        }
    }

    pub fn instances(mut self, min_instances: u16, max_instances: u16) -> Self {
        self.min_instances = min_instances;
        self.max_instances = max_instances;
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.min_instances = self.min_instances.max(1);
        self
    }

    pub fn handler(mut self, handler: SharedHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Add a resource definition; validated when the object is registered.
    /// The first definition of an ID is kept and a repeated ID makes
    /// registration fail.
    pub fn with_resource(mut self, resource: ResourceDefinition) -> Self {
        if self.resources.contains_key(&resource.id) {
            self.duplicates.push(resource.id);
        } else {
            self.resources.insert(resource.id, resource);
        }
        self
    }

    pub fn is_mandatory(&self) -> bool {
        self.min_instances > 0
    }

    pub fn is_multiple(&self) -> bool {
        self.max_instances > 1
    }

    pub fn resource(&self, resource_id: ResourceId) -> Option<&ResourceDefinition> {
        self.resources.get(&resource_id)
    }

    /// Resource definitions in ascending ID order
    pub fn resources(&self) -> impl Iterator<Item = &ResourceDefinition> {
        self.resources.values()
    }
}

/// Registry of object and resource definitions
#[derive(Debug, Clone, Default)]
pub struct DefinitionRegistry {
    objects: BTreeMap<ObjectId, ObjectDefinition>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an object type; its resource set may be pre-populated
    pub fn register_object(&mut self, definition: ObjectDefinition) -> Result<()> {
        if definition.id == INVALID_ID {
            return Err(Lwm2mError::OperationInvalid(format!(
                "object ID {} is reserved",
                INVALID_ID
            )));
        }
        if definition.min_instances > definition.max_instances || definition.max_instances == 0 {
            return Err(Lwm2mError::OperationInvalid(format!(
                "object {} ({}): invalid instance bounds",
                definition.id, definition.name
            )));
        }
        if self.objects.contains_key(&definition.id) {
            return Err(Lwm2mError::AlreadyExists(format!(
                "object {} already defined",
                definition.id
            )));
        }
        if let Some(resource_id) = definition.duplicates.first() {
            return Err(Lwm2mError::AlreadyExists(format!(
                "resource {} defined twice on object {}",
                resource_id, definition.id
            )));
        }
        for resource in definition.resources() {
            resource.validate()?;
        }
        tracing::debug!(object_id = definition.id, name = %definition.name, "object type registered");
        self.objects.insert(definition.id, definition);
        Ok(())
    }

    /// Register a resource type on an already-registered object
    pub fn register_resource(
        &mut self,
        object_id: ObjectId,
        definition: ResourceDefinition,
    ) -> Result<()> {
        let object = self
            .objects
            .get_mut(&object_id)
            .ok_or_else(|| Lwm2mError::NotFound(format!("object {} not defined", object_id)))?;
        if object.resources.contains_key(&definition.id) {
            return Err(Lwm2mError::AlreadyExists(format!(
                "resource {} already defined on object {}",
                definition.id, object_id
            )));
        }
        definition.validate()?;
        tracing::debug!(object_id, resource_id = definition.id, name = %definition.name, "resource type registered");
        object.resources.insert(definition.id, definition);
        Ok(())
    }

    /// Look up an object definition
    pub fn object(&self, object_id: ObjectId) -> Result<&ObjectDefinition> {
        self.objects
            .get(&object_id)
            .ok_or_else(|| Lwm2mError::NotFound(format!("object {} not defined", object_id)))
    }

    /// Look up a resource definition
    pub fn resource(
        &self,
        object_id: ObjectId,
        resource_id: ResourceId,
    ) -> Result<&ResourceDefinition> {
        self.object(object_id)?.resource(resource_id).ok_or_else(|| {
            Lwm2mError::NotFound(format!(
                "resource {} not defined on object {}",
                resource_id, object_id
            ))
        })
    }

    pub fn contains(&self, object_id: ObjectId) -> bool {
        self.objects.contains_key(&object_id)
    }

    /// Object definitions in ascending ID order
    pub fn objects(&self) -> impl Iterator<Item = &ObjectDefinition> {
        self.objects.values()
    }
}
