//! Object store: the live object instances and resource values
//!
//! Every operation is routed either to internal storage or to the
//! application handler bound in the resource (or object) definition.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::callback::{self, HandlerCall, HandlerResult, Operation, SharedHandler};
use crate::definition::{DefinitionRegistry, ResourceStorage};
use crate::error::{Lwm2mError, Result};
use crate::types::{
    INVALID_ID, InstanceId, ObjectId, ResourceId, ResourceInstanceId, ResourceType, Value,
};

/// Resource instances present for one resource. For externally-managed
/// resources the stored buffers are empty and only mark presence.
#[derive(Debug, Default)]
struct ResourceEntry {
    instances: BTreeMap<ResourceInstanceId, Vec<u8>>,
}

#[derive(Debug, Default)]
struct InstanceEntry {
    resources: BTreeMap<ResourceId, ResourceEntry>,
}

type ObjectMap = BTreeMap<ObjectId, BTreeMap<InstanceId, InstanceEntry>>;

/// Runtime instance data for all defined objects
#[derive(Debug, Default)]
pub struct ObjectStore {
    /// Object and resource definitions
    definitions: DefinitionRegistry,
    /// Object ID -> instance ID -> resources
    objects: ObjectMap,
}

impl ObjectStore {
    /// Create an empty store over the given definitions
    pub fn new(definitions: DefinitionRegistry) -> Self {
        Self {
            definitions,
            objects: BTreeMap::new(),
        }
    }

    /// Get the definition registry
    pub fn definitions(&self) -> &DefinitionRegistry {
        &self.definitions
    }

    /// Get the definition registry for registering further definitions
    pub fn definitions_mut(&mut self) -> &mut DefinitionRegistry {
        &mut self.definitions
    }

    /// Create an object instance. With `instance_id` unset the lowest free ID
    /// is allocated. Mandatory resources are created before this returns.
    pub fn create_object_instance(
        &mut self,
        object_id: ObjectId,
        instance_id: Option<InstanceId>,
    ) -> Result<InstanceId> {
        let definition = self.definitions.object(object_id)?;
        let handler = definition.handler.clone();
        let max_instances = usize::from(definition.max_instances);
        let mandatory: Vec<ResourceId> = definition
            .resources()
            .filter(|r| r.is_mandatory())
            .map(|r| r.id)
            .collect();

        let existing = self.objects.get(&object_id);
        let exists = |id: InstanceId| existing.is_some_and(|m| m.contains_key(&id));
        let instance_id = match instance_id {
            Some(INVALID_ID) => {
                return Err(Lwm2mError::OperationInvalid(format!(
                    "instance ID {} is reserved",
                    INVALID_ID
                )));
            }
            Some(id) if exists(id) => {
                return Err(Lwm2mError::AlreadyExists(format!(
                    "object instance /{}/{}",
                    object_id, id
                )));
            }
            Some(id) => id,
            None => (0..INVALID_ID).find(|id| !exists(*id)).ok_or_else(|| {
                Lwm2mError::capacity(format!("object {} instances", object_id), max_instances)
            })?,
        };
        if existing.map_or(0, BTreeMap::len) >= max_instances {
            return Err(Lwm2mError::capacity(
                format!("object {} instances", object_id),
                max_instances,
            ));
        }

        if let Some(handler) = &handler {
            call_handler(
                handler,
                Operation::CreateObjectInstance,
                (object_id, instance_id, None, None),
                &mut Vec::new(),
            )?;
        }
        self.objects
            .entry(object_id)
            .or_default()
            .insert(instance_id, InstanceEntry::default());

        for resource_id in mandatory {
            if let Err(e) = self.create_resource(object_id, instance_id, resource_id) {
                warn!(object_id, instance_id, resource_id, error = %e, "mandatory resource creation failed, rolling back");
                self.remove_instance(object_id, instance_id);
                if let Some(handler) = &handler {
                    let _ = call_handler(
                        handler,
                        Operation::DeleteObjectInstance,
                        (object_id, instance_id, None, None),
                        &mut Vec::new(),
                    );
                }
                return Err(e);
            }
        }

        debug!(object_id, instance_id, "object instance created");
        Ok(instance_id)
    }

    /// Create a resource on an existing instance. Single-instance resources
    /// get instance 0 holding the default value; array resources start empty.
    pub fn create_resource(
        &mut self,
        object_id: ObjectId,
        instance_id: InstanceId,
        resource_id: ResourceId,
    ) -> Result<()> {
        let definition = self.definitions.resource(object_id, resource_id)?;
        if instance(&self.objects, object_id, instance_id)?
            .resources
            .contains_key(&resource_id)
        {
            return Err(Lwm2mError::AlreadyExists(format!(
                "resource /{}/{}/{}",
                object_id, instance_id, resource_id
            )));
        }

        let has_single_value =
            !definition.is_multiple() && definition.resource_type != ResourceType::None;
        let mut entry = ResourceEntry::default();
        match &definition.storage {
            ResourceStorage::Internal { default } => {
                if has_single_value {
                    entry.instances.insert(0, default.clone());
                }
            }
            ResourceStorage::External(handler) => {
                call_handler(
                    handler,
                    Operation::CreateResource,
                    (object_id, instance_id, Some(resource_id), None),
                    &mut Vec::new(),
                )?;
                if has_single_value {
                    entry.instances.insert(0, Vec::new());
                }
            }
        }

        instance_mut(&mut self.objects, object_id, instance_id)?
            .resources
            .insert(resource_id, entry);
        debug!(object_id, instance_id, resource_id, "resource created");
        Ok(())
    }

    /// Check that writing `value` to a resource instance would be accepted,
    /// without changing anything: the value fits the definition and the
    /// resource has room for the instance.
    pub fn check_resource_instance_value(
        &self,
        object_id: ObjectId,
        instance_id: InstanceId,
        resource_id: ResourceId,
        resource_instance_id: ResourceInstanceId,
        value: &[u8],
    ) -> Result<()> {
        let entry = instance(&self.objects, object_id, instance_id)?;
        let definition = self.definitions.resource(object_id, resource_id)?;
        if definition.resource_type == ResourceType::None {
            return Err(Lwm2mError::Permission(format!(
                "resource /{}/{}/{} is executable and holds no value",
                object_id, instance_id, resource_id
            )));
        }
        if !definition.is_multiple() && resource_instance_id != 0 {
            return Err(Lwm2mError::OperationInvalid(format!(
                "resource /{}/{}/{} is single-instance",
                object_id, instance_id, resource_id
            )));
        }
        definition.check_value_length(value.len())?;

        let max_instances = usize::from(definition.max_instances);
        let present = entry
            .resources
            .get(&resource_id)
            .map_or(0, |r| r.instances.len());
        let replaces = entry
            .resources
            .get(&resource_id)
            .is_some_and(|r| r.instances.contains_key(&resource_instance_id));
        if !replaces && present >= max_instances {
            return Err(Lwm2mError::capacity(
                format!("resource /{}/{}/{} instances", object_id, instance_id, resource_id),
                max_instances,
            ));
        }
        Ok(())
    }

    /// Write a resource instance value in its internal byte representation.
    /// The resource is created first if it does not exist yet, and removed
    /// again if the write fails. Returns whether the value changed.
    pub fn set_resource_instance_value(
        &mut self,
        object_id: ObjectId,
        instance_id: InstanceId,
        resource_id: ResourceId,
        resource_instance_id: ResourceInstanceId,
        value: &[u8],
    ) -> Result<bool> {
        self.check_resource_instance_value(
            object_id,
            instance_id,
            resource_id,
            resource_instance_id,
            value,
        )?;
        let created = !self.resource_exists(object_id, instance_id, resource_id);
        if created {
            self.create_resource(object_id, instance_id, resource_id)?;
        }

        let written = self.write_resource_instance(
            object_id,
            instance_id,
            resource_id,
            resource_instance_id,
            value,
        );
        if written.is_err() && created {
            self.discard_resource(object_id, instance_id, resource_id);
        }
        written
    }

    fn write_resource_instance(
        &mut self,
        object_id: ObjectId,
        instance_id: InstanceId,
        resource_id: ResourceId,
        resource_instance_id: ResourceInstanceId,
        value: &[u8],
    ) -> Result<bool> {
        let definition = self.definitions.resource(object_id, resource_id)?;
        let resource = resource_mut(&mut self.objects, object_id, instance_id, resource_id)?;
        match &definition.storage {
            ResourceStorage::Internal { .. } => {
                let changed = resource
                    .instances
                    .get(&resource_instance_id)
                    .is_none_or(|old| old.as_slice() != value);
                resource
                    .instances
                    .insert(resource_instance_id, value.to_vec());
                Ok(changed)
            }
            ResourceStorage::External(handler) => {
                let mut data = value.to_vec();
                let (_, changed) = call_handler(
                    handler,
                    Operation::Write,
                    (
                        object_id,
                        instance_id,
                        Some(resource_id),
                        Some(resource_instance_id),
                    ),
                    &mut data,
                )?;
                resource.instances.entry(resource_instance_id).or_default();
                Ok(changed)
            }
        }
    }

    /// Drop a resource created by a write that then failed
    fn discard_resource(&mut self, object_id: ObjectId, instance_id: InstanceId, resource_id: ResourceId) {
        if let Ok(definition) = self.definitions.resource(object_id, resource_id)
            && let Some(handler) = definition.external_handler()
        {
            let _ = call_handler(
                handler,
                Operation::DeleteResource,
                (object_id, instance_id, Some(resource_id), None),
                &mut Vec::new(),
            );
        }
        if let Ok(entry) = instance_mut(&mut self.objects, object_id, instance_id) {
            entry.resources.remove(&resource_id);
        }
        warn!(object_id, instance_id, resource_id, "write failed, resource removed");
    }

    /// Read a resource instance value in its internal byte representation
    pub fn get_resource_instance_value(
        &self,
        object_id: ObjectId,
        instance_id: InstanceId,
        resource_id: ResourceId,
        resource_instance_id: ResourceInstanceId,
    ) -> Result<Vec<u8>> {
        let definition = self.definitions.resource(object_id, resource_id)?;
        let stored = resource(&self.objects, object_id, instance_id, resource_id)?
            .instances
            .get(&resource_instance_id)
            .ok_or_else(|| {
                Lwm2mError::NotFound(format!(
                    "resource instance /{}/{}/{}/{}",
                    object_id, instance_id, resource_id, resource_instance_id
                ))
            })?;

        match &definition.storage {
            ResourceStorage::Internal { .. } => Ok(stored.clone()),
            ResourceStorage::External(handler) => {
                let mut data = Vec::new();
                call_handler(
                    handler,
                    Operation::Read,
                    (
                        object_id,
                        instance_id,
                        Some(resource_id),
                        Some(resource_instance_id),
                    ),
                    &mut data,
                )?;
                definition.check_value_length(data.len())?;
                Ok(data)
            }
        }
    }

    /// Write a typed value; the type must match the resource definition
    pub fn set_value(
        &mut self,
        object_id: ObjectId,
        instance_id: InstanceId,
        resource_id: ResourceId,
        resource_instance_id: ResourceInstanceId,
        value: impl Into<Value>,
    ) -> Result<bool> {
        let value = value.into();
        let expected = self
            .definitions
            .resource(object_id, resource_id)?
            .resource_type;
        if value.resource_type() != expected {
            return Err(Lwm2mError::Protocol(format!(
                "resource {} expects {:?}, got {:?}",
                resource_id,
                expected,
                value.resource_type()
            )));
        }
        self.set_resource_instance_value(
            object_id,
            instance_id,
            resource_id,
            resource_instance_id,
            &value.to_bytes(),
        )
    }

    /// Read a typed value
    pub fn get_value(
        &self,
        object_id: ObjectId,
        instance_id: InstanceId,
        resource_id: ResourceId,
        resource_instance_id: ResourceInstanceId,
    ) -> Result<Value> {
        let resource_type = self
            .definitions
            .resource(object_id, resource_id)?
            .resource_type;
        let bytes = self.get_resource_instance_value(
            object_id,
            instance_id,
            resource_id,
            resource_instance_id,
        )?;
        Value::from_bytes(resource_type, &bytes)
    }

    /// Delete an object instance and, with it, all of its resources.
    ///
    /// Mirrors creation: every present resource with its own handler is sent
    /// DeleteResource, then the object handler (if any) is sent
    /// DeleteObjectInstance.
    pub fn delete_object_instance(
        &mut self,
        object_id: ObjectId,
        instance_id: InstanceId,
    ) -> Result<()> {
        let definition = self.definitions.object(object_id)?;
        let entry = instance(&self.objects, object_id, instance_id)?;

        for resource_id in entry.resources.keys() {
            if let Some(handler) = definition
                .resource(*resource_id)
                .and_then(|r| r.external_handler())
            {
                call_handler(
                    handler,
                    Operation::DeleteResource,
                    (object_id, instance_id, Some(*resource_id), None),
                    &mut Vec::new(),
                )?;
            }
        }
        if let Some(handler) = &definition.handler {
            call_handler(
                handler,
                Operation::DeleteObjectInstance,
                (object_id, instance_id, None, None),
                &mut Vec::new(),
            )?;
        }

        self.remove_instance(object_id, instance_id);
        debug!(object_id, instance_id, "object instance deleted");
        Ok(())
    }

    /// Delete a resource and all of its instances
    pub fn delete_resource(
        &mut self,
        object_id: ObjectId,
        instance_id: InstanceId,
        resource_id: ResourceId,
    ) -> Result<()> {
        let definition = self.definitions.resource(object_id, resource_id)?;
        resource(&self.objects, object_id, instance_id, resource_id)?;

        if let Some(handler) = definition.external_handler() {
            call_handler(
                handler,
                Operation::DeleteResource,
                (object_id, instance_id, Some(resource_id), None),
                &mut Vec::new(),
            )?;
        }

        instance_mut(&mut self.objects, object_id, instance_id)?
            .resources
            .remove(&resource_id);
        debug!(object_id, instance_id, resource_id, "resource deleted");
        Ok(())
    }

    /// Delete one instance of an array resource. A resource never drops below
    /// its minimum instance count.
    pub fn delete_resource_instance(
        &mut self,
        object_id: ObjectId,
        instance_id: InstanceId,
        resource_id: ResourceId,
        resource_instance_id: ResourceInstanceId,
    ) -> Result<()> {
        let definition = self.definitions.resource(object_id, resource_id)?;
        let entry = resource(&self.objects, object_id, instance_id, resource_id)?;
        if !entry.instances.contains_key(&resource_instance_id) {
            return Err(Lwm2mError::NotFound(format!(
                "resource instance /{}/{}/{}/{}",
                object_id, instance_id, resource_id, resource_instance_id
            )));
        }
        if entry.instances.len() <= usize::from(definition.min_instances) {
            return Err(Lwm2mError::Permission(format!(
                "resource /{}/{}/{} needs at least {} instance(s)",
                object_id, instance_id, resource_id, definition.min_instances
            )));
        }

        if let Some(handler) = definition.external_handler() {
            call_handler(
                handler,
                Operation::DeleteResource,
                (
                    object_id,
                    instance_id,
                    Some(resource_id),
                    Some(resource_instance_id),
                ),
                &mut Vec::new(),
            )?;
        }

        resource_mut(&mut self.objects, object_id, instance_id, resource_id)?
            .instances
            .remove(&resource_instance_id);
        debug!(object_id, instance_id, resource_id, resource_instance_id, "resource instance deleted");
        Ok(())
    }

    /// Execute a resource present in the instance. The handler's result code
    /// is passed back as-is.
    pub fn execute_resource(
        &mut self,
        object_id: ObjectId,
        instance_id: InstanceId,
        resource_id: ResourceId,
        arguments: &[u8],
    ) -> Result<HandlerResult> {
        let definition = self.definitions.resource(object_id, resource_id)?;
        if !definition.operations.can_execute() {
            return Err(Lwm2mError::Permission(format!(
                "resource /{}/{}/{} is not executable",
                object_id, instance_id, resource_id
            )));
        }
        resource(&self.objects, object_id, instance_id, resource_id)?;

        match definition.external_handler() {
            Some(handler) => {
                let mut data = arguments.to_vec();
                let (result, _) = call_handler(
                    handler,
                    Operation::Execute,
                    (object_id, instance_id, Some(resource_id), None),
                    &mut data,
                )?;
                Ok(result)
            }
            None => {
                debug!(object_id, instance_id, resource_id, "execute without handler");
                Ok(HandlerResult::Success)
            }
        }
    }

    /// IDs of existing instances of an object, ascending
    pub fn instance_ids(&self, object_id: ObjectId) -> Vec<InstanceId> {
        self.objects
            .get(&object_id)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    /// IDs of existing resources of an instance, ascending
    pub fn resource_ids(&self, object_id: ObjectId, instance_id: InstanceId) -> Result<Vec<ResourceId>> {
        Ok(instance(&self.objects, object_id, instance_id)?
            .resources
            .keys()
            .copied()
            .collect())
    }

    /// IDs of existing resource instances, ascending
    pub fn resource_instance_ids(
        &self,
        object_id: ObjectId,
        instance_id: InstanceId,
        resource_id: ResourceId,
    ) -> Result<Vec<ResourceInstanceId>> {
        Ok(resource(&self.objects, object_id, instance_id, resource_id)?
            .instances
            .keys()
            .copied()
            .collect())
    }

    pub fn instance_exists(&self, object_id: ObjectId, instance_id: InstanceId) -> bool {
        instance(&self.objects, object_id, instance_id).is_ok()
    }

    pub fn resource_exists(
        &self,
        object_id: ObjectId,
        instance_id: InstanceId,
        resource_id: ResourceId,
    ) -> bool {
        resource(&self.objects, object_id, instance_id, resource_id).is_ok()
    }

    fn remove_instance(&mut self, object_id: ObjectId, instance_id: InstanceId) {
        if let Some(instances) = self.objects.get_mut(&object_id) {
            instances.remove(&instance_id);
            if instances.is_empty() {
                self.objects.remove(&object_id);
            }
        }
    }
}

type HandlerIds = (ObjectId, InstanceId, Option<ResourceId>, Option<ResourceInstanceId>);

/// Invoke a handler and validate its result code against the operation
fn call_handler(
    handler: &SharedHandler,
    operation: Operation,
    (object_id, instance_id, resource_id, resource_instance_id): HandlerIds,
    data: &mut Vec<u8>,
) -> Result<(HandlerResult, bool)> {
    let mut changed = false;
    let mut call = HandlerCall {
        operation,
        object_id,
        instance_id,
        resource_id,
        resource_instance_id,
        data,
        changed: &mut changed,
    };
    let result = callback::invoke(handler, &mut call);

    if !result.is_success() {
        return Err(Lwm2mError::Handler { operation, result });
    }
    if !result.is_valid_for(operation) {
        return Err(Lwm2mError::Internal(format!(
            "handler returned {:?} for {}",
            result, operation
        )));
    }
    Ok((result, changed))
}

fn instance(objects: &ObjectMap, object_id: ObjectId, instance_id: InstanceId) -> Result<&InstanceEntry> {
    objects
        .get(&object_id)
        .and_then(|m| m.get(&instance_id))
        .ok_or_else(|| Lwm2mError::NotFound(format!("object instance /{}/{}", object_id, instance_id)))
}

fn instance_mut(
    objects: &mut ObjectMap,
    object_id: ObjectId,
    instance_id: InstanceId,
) -> Result<&mut InstanceEntry> {
    objects
        .get_mut(&object_id)
        .and_then(|m| m.get_mut(&instance_id))
        .ok_or_else(|| Lwm2mError::NotFound(format!("object instance /{}/{}", object_id, instance_id)))
}

fn resource(
    objects: &ObjectMap,
    object_id: ObjectId,
    instance_id: InstanceId,
    resource_id: ResourceId,
) -> Result<&ResourceEntry> {
    instance(objects, object_id, instance_id)?
        .resources
        .get(&resource_id)
        .ok_or_else(|| {
            Lwm2mError::NotFound(format!(
                "resource /{}/{}/{}",
                object_id, instance_id, resource_id
            ))
        })
}

fn resource_mut(
    objects: &mut ObjectMap,
    object_id: ObjectId,
    instance_id: InstanceId,
    resource_id: ResourceId,
) -> Result<&mut ResourceEntry> {
    instance_mut(objects, object_id, instance_id)?
        .resources
        .get_mut(&resource_id)
        .ok_or_else(|| {
            Lwm2mError::NotFound(format!(
                "resource /{}/{}/{}",
                object_id, instance_id, resource_id
            ))
        })
}
