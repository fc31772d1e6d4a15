//! Conversion between live object store state and resource trees
//!
//! Building reads every leaf through the object store (so external handlers
//! see Read calls) and orders nodes by ascending ID. Applying walks a tree
//! top-down and turns it back into create/write/delete calls.

use tracing::{debug, warn};

use crate::definition::ResourceDefinition;
use crate::error::{Lwm2mError, Result};
use crate::object_store::ObjectStore;
use crate::path::ResourcePath;
use crate::tree::{NodeEvent, NodeKind, ResourceMeta, TreeNode};
use crate::types::{InstanceId, ObjectId, ResourceId, ResourceInstanceId, ResourceType};

/// Who issued a request. Local API calls bypass resource permissions;
/// requests from a server are checked against them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestOrigin {
    #[default]
    Client,
    Server,
}

/// How a tree is applied to existing state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Optional resources and resource instances absent from the tree are deleted
    Replace,
    /// Only the values present in the tree change
    Update,
}

/// Build the tree for the node addressed by `path`
pub fn create_tree_from_path(
    store: &ObjectStore,
    origin: RequestOrigin,
    path: &ResourcePath,
) -> Result<TreeNode> {
    match (
        path.object_id,
        path.instance_id,
        path.resource_id,
        path.resource_instance_id,
    ) {
        (None, ..) => {
            let mut root = TreeNode::root();
            for definition in store.definitions().objects() {
                if !store.instance_ids(definition.id).is_empty() {
                    root.add_child(create_tree_from_object(store, origin, definition.id)?)?;
                }
            }
            Ok(root)
        }
        (Some(o), None, ..) => create_tree_from_object(store, origin, o),
        (Some(o), Some(i), None, _) => create_tree_from_object_instance(store, origin, o, i),
        (Some(o), Some(i), Some(r), None) => create_tree_from_resource(store, origin, o, i, r),
        (Some(o), Some(i), Some(r), Some(ri)) => {
            let mut resource = create_tree_from_resource(store, origin, o, i, r)?;
            resource.remove_child(ri).ok_or_else(|| {
                Lwm2mError::NotFound(format!("resource instance {}", path))
            })
        }
    }
}

/// Build a tree holding every instance of an object
pub fn create_tree_from_object(
    store: &ObjectStore,
    origin: RequestOrigin,
    object_id: ObjectId,
) -> Result<TreeNode> {
    store.definitions().object(object_id)?;
    let mut object = TreeNode::object(object_id);
    for instance_id in store.instance_ids(object_id) {
        object.add_child(create_tree_from_object_instance(
            store,
            origin,
            object_id,
            instance_id,
        )?)?;
    }
    Ok(object)
}

/// Build a tree for one object instance
pub fn create_tree_from_object_instance(
    store: &ObjectStore,
    origin: RequestOrigin,
    object_id: ObjectId,
    instance_id: InstanceId,
) -> Result<TreeNode> {
    let mut instance = TreeNode::object_instance(instance_id);
    for resource_id in store.resource_ids(object_id, instance_id)? {
        let definition = store.definitions().resource(object_id, resource_id)?;
        if definition.resource_type == ResourceType::None {
            continue;
        }
        if origin == RequestOrigin::Server && !definition.operations.can_read() {
            continue;
        }
        let resource = build_resource(store, definition, object_id, instance_id)?;
        if resource.child_count() > 0 {
            instance.add_child(resource)?;
        }
    }
    Ok(instance)
}

/// Build a tree for one resource and its instances
pub fn create_tree_from_resource(
    store: &ObjectStore,
    origin: RequestOrigin,
    object_id: ObjectId,
    instance_id: InstanceId,
    resource_id: ResourceId,
) -> Result<TreeNode> {
    let definition = store.definitions().resource(object_id, resource_id)?;
    let readable = definition.operations.can_read() || origin == RequestOrigin::Client;
    if definition.resource_type == ResourceType::None || !readable {
        return Err(Lwm2mError::Permission(format!(
            "resource /{}/{}/{} is not readable",
            object_id, instance_id, resource_id
        )));
    }
    build_resource(store, definition, object_id, instance_id)
}

fn build_resource(
    store: &ObjectStore,
    definition: &ResourceDefinition,
    object_id: ObjectId,
    instance_id: InstanceId,
) -> Result<TreeNode> {
    let meta = ResourceMeta::new(definition.resource_type, definition.is_multiple());
    let mut resource = TreeNode::resource(definition.id, meta);

    for ri in store.resource_instance_ids(object_id, instance_id, definition.id)? {
        match store.get_resource_instance_value(object_id, instance_id, definition.id, ri) {
            Ok(value) => {
                resource.add_child(TreeNode::resource_instance(ri, meta, value))?;
            }
            Err(e) => {
                warn!(
                    path = %ResourcePath::resource_instance(object_id, instance_id, definition.id, ri),
                    error = %e,
                    "omitting unreadable value"
                );
            }
        }
    }
    Ok(resource)
}

/// Apply `tree`, the node addressed by `path`, to the object store.
///
/// The whole tree is checked against the definitions first, so a tree that
/// would fail part way (permission, type, size or capacity) changes nothing.
/// Missing instances and resources are created on the way down. Within a
/// node, children flagged with [`NodeEvent::Delete`] are applied before any
/// of their siblings. In [`WriteMode::Replace`] values absent from the tree
/// are removed after the tree's own values are written.
pub fn apply_tree(
    store: &mut ObjectStore,
    origin: RequestOrigin,
    mode: WriteMode,
    path: &ResourcePath,
    tree: &TreeNode,
) -> Result<()> {
    if NodeKind::for_depth(path.depth()) != Some(tree.kind()) {
        return Err(Lwm2mError::Protocol(format!(
            "{:?} node cannot be applied at {}",
            tree.kind(),
            path
        )));
    }
    if tree.kind() != NodeKind::Root && tree.id() != path.ids().last().copied() {
        return Err(Lwm2mError::Protocol(format!(
            "node ID {:?} does not match {}",
            tree.id(),
            path
        )));
    }

    let mut writer = TreeWriter {
        store,
        origin,
        mode,
    };
    writer.validate(path, tree)?;
    match (
        path.object_id,
        path.instance_id,
        path.resource_id,
        path.resource_instance_id,
    ) {
        (None, ..) => {
            for object in ordered(tree) {
                writer.apply_object(node_id(object)?, object)?;
            }
            Ok(())
        }
        (Some(o), None, ..) => writer.apply_object(o, tree),
        (Some(o), Some(i), None, _) => writer.apply_instance(o, i, tree),
        (Some(o), Some(i), Some(r), None) => writer.apply_resource(o, i, r, tree),
        (Some(o), Some(i), Some(r), Some(ri)) => {
            writer.check_writable(o, i, r)?;
            writer.apply_resource_instance(o, i, r, ri, tree)
        }
    }
}

struct TreeWriter<'a> {
    store: &'a mut ObjectStore,
    origin: RequestOrigin,
    mode: WriteMode,
}

impl TreeWriter<'_> {
    fn apply_object(&mut self, object_id: ObjectId, object: &TreeNode) -> Result<()> {
        for instance in ordered(object) {
            self.apply_instance(object_id, node_id(instance)?, instance)?;
        }
        Ok(())
    }

    fn apply_instance(
        &mut self,
        object_id: ObjectId,
        instance_id: InstanceId,
        instance: &TreeNode,
    ) -> Result<()> {
        if instance.event() == Some(NodeEvent::Delete) {
            return self.store.delete_object_instance(object_id, instance_id);
        }
        if !self.store.instance_exists(object_id, instance_id) {
            debug!(object_id, instance_id, "creating instance from tree");
            self.store
                .create_object_instance(object_id, Some(instance_id))?;
        }

        for resource in ordered(instance) {
            let resource_id = node_id(resource)?;
            if resource.event() == Some(NodeEvent::Delete) {
                self.store
                    .delete_resource(object_id, instance_id, resource_id)?;
            } else {
                self.apply_resource(object_id, instance_id, resource_id, resource)?;
            }
        }

        if self.mode == WriteMode::Replace {
            for resource_id in self.store.resource_ids(object_id, instance_id)? {
                if instance.child(resource_id).is_some() {
                    continue;
                }
                let definition = self.store.definitions().resource(object_id, resource_id)?;
                let removable = !definition.is_mandatory()
                    && definition.resource_type != ResourceType::None
                    && (self.origin == RequestOrigin::Client || definition.operations.can_write());
                if removable {
                    self.store
                        .delete_resource(object_id, instance_id, resource_id)?;
                }
            }
        }
        Ok(())
    }

    fn apply_resource(
        &mut self,
        object_id: ObjectId,
        instance_id: InstanceId,
        resource_id: ResourceId,
        resource: &TreeNode,
    ) -> Result<()> {
        self.check_writable(object_id, instance_id, resource_id)?;
        let multiple = self
            .store
            .definitions()
            .resource(object_id, resource_id)?
            .is_multiple();

        if !self
            .store
            .resource_exists(object_id, instance_id, resource_id)
        {
            self.store
                .create_resource(object_id, instance_id, resource_id)?;
        }

        for resource_instance in ordered(resource) {
            self.apply_resource_instance(
                object_id,
                instance_id,
                resource_id,
                node_id(resource_instance)?,
                resource_instance,
            )?;
        }

        if self.mode == WriteMode::Replace && multiple {
            for ri in self
                .store
                .resource_instance_ids(object_id, instance_id, resource_id)?
            {
                if resource.child(ri).is_none() {
                    self.store
                        .delete_resource_instance(object_id, instance_id, resource_id, ri)?;
                }
            }
        }
        Ok(())
    }

    fn apply_resource_instance(
        &mut self,
        object_id: ObjectId,
        instance_id: InstanceId,
        resource_id: ResourceId,
        resource_instance_id: ResourceInstanceId,
        node: &TreeNode,
    ) -> Result<()> {
        if node.event() == Some(NodeEvent::Delete) {
            return self.store.delete_resource_instance(
                object_id,
                instance_id,
                resource_id,
                resource_instance_id,
            );
        }
        let value = node.value().ok_or_else(|| {
            Lwm2mError::Protocol(format!(
                "no value for /{}/{}/{}/{}",
                object_id, instance_id, resource_id, resource_instance_id
            ))
        })?;
        self.store.set_resource_instance_value(
            object_id,
            instance_id,
            resource_id,
            resource_instance_id,
            value,
        )?;
        Ok(())
    }

    /// Check `tree` against the definitions and the current store contents
    fn validate(&self, path: &ResourcePath, tree: &TreeNode) -> Result<()> {
        match (
            path.object_id,
            path.instance_id,
            path.resource_id,
            path.resource_instance_id,
        ) {
            (None, ..) => {
                for object in written(tree) {
                    self.validate_object(node_id(object)?, object)?;
                }
                Ok(())
            }
            (Some(o), None, ..) => self.validate_object(o, tree),
            (Some(o), Some(i), None, _) => {
                let definition = self.store.definitions().object(o)?;
                let max_instances = usize::from(definition.max_instances);
                if !self.store.instance_exists(o, i)
                    && self.store.instance_ids(o).len() >= max_instances
                {
                    return Err(Lwm2mError::capacity(
                        format!("object {} instances", o),
                        max_instances,
                    ));
                }
                self.validate_instance(o, i, tree)
            }
            (Some(o), Some(i), Some(r), None) => self.validate_resource(o, i, r, tree),
            (Some(o), Some(i), Some(r), Some(ri)) => {
                if tree.event() == Some(NodeEvent::Delete) {
                    return Ok(());
                }
                self.check_writable(o, i, r)?;
                self.validate_value(o, r, ri, tree)?;
                let value = tree.value().unwrap_or_default();
                self.store.check_resource_instance_value(o, i, r, ri, value)
            }
        }
    }

    fn validate_object(&self, object_id: ObjectId, object: &TreeNode) -> Result<()> {
        let definition = self.store.definitions().object(object_id)?;
        let existing = self.store.instance_ids(object_id);
        let removed = deleted_ids(object)
            .filter(|id| existing.contains(id))
            .count();
        let added = written(object)
            .filter_map(TreeNode::id)
            .filter(|id| !existing.contains(id))
            .count();
        let max_instances = usize::from(definition.max_instances);
        if existing.len() - removed + added > max_instances {
            return Err(Lwm2mError::capacity(
                format!("object {} instances", object_id),
                max_instances,
            ));
        }

        for instance in written(object) {
            self.validate_instance(object_id, node_id(instance)?, instance)?;
        }
        Ok(())
    }

    fn validate_instance(
        &self,
        object_id: ObjectId,
        instance_id: InstanceId,
        instance: &TreeNode,
    ) -> Result<()> {
        for resource in written(instance) {
            self.validate_resource(object_id, instance_id, node_id(resource)?, resource)?;
        }
        Ok(())
    }

    fn validate_resource(
        &self,
        object_id: ObjectId,
        instance_id: InstanceId,
        resource_id: ResourceId,
        resource: &TreeNode,
    ) -> Result<()> {
        self.check_writable(object_id, instance_id, resource_id)?;
        let definition = self.store.definitions().resource(object_id, resource_id)?;

        // instances left once the tree is applied
        let mut remaining: Vec<ResourceInstanceId> = if self.mode == WriteMode::Replace {
            Vec::new()
        } else {
            self.store
                .resource_instance_ids(object_id, instance_id, resource_id)
                .unwrap_or_default()
        };
        remaining.retain(|ri| deleted_ids(resource).all(|d| d != *ri));
        for resource_instance in written(resource) {
            let ri = node_id(resource_instance)?;
            self.validate_value(object_id, resource_id, ri, resource_instance)?;
            if !remaining.contains(&ri) {
                remaining.push(ri);
            }
        }

        let max_instances = usize::from(definition.max_instances);
        if remaining.len() > max_instances {
            return Err(Lwm2mError::capacity(
                format!(
                    "resource /{}/{}/{} instances",
                    object_id, instance_id, resource_id
                ),
                max_instances,
            ));
        }
        Ok(())
    }

    fn validate_value(
        &self,
        object_id: ObjectId,
        resource_id: ResourceId,
        resource_instance_id: ResourceInstanceId,
        node: &TreeNode,
    ) -> Result<()> {
        let definition = self.store.definitions().resource(object_id, resource_id)?;
        if definition.resource_type == ResourceType::None {
            return Err(Lwm2mError::Permission(format!(
                "resource {} holds no value",
                definition.id
            )));
        }
        if !definition.is_multiple() && resource_instance_id != 0 {
            return Err(Lwm2mError::OperationInvalid(format!(
                "resource {} is single-instance",
                definition.id
            )));
        }
        if let Some(meta) = node.meta()
            && meta.resource_type != definition.resource_type
        {
            return Err(Lwm2mError::Protocol(format!(
                "resource {} expects {:?}, got {:?}",
                definition.id, definition.resource_type, meta.resource_type
            )));
        }
        let value = node
            .value()
            .ok_or_else(|| {
                Lwm2mError::Protocol(format!(
                    "no value for resource {} instance {}",
                    definition.id, resource_instance_id
                ))
            })?;
        definition.check_value_length(value.len())
    }

    fn check_writable(
        &self,
        object_id: ObjectId,
        instance_id: InstanceId,
        resource_id: ResourceId,
    ) -> Result<()> {
        let definition = self.store.definitions().resource(object_id, resource_id)?;
        if self.origin == RequestOrigin::Server && !definition.operations.can_write() {
            return Err(Lwm2mError::Permission(format!(
                "resource /{}/{}/{} is not writable",
                object_id, instance_id, resource_id
            )));
        }
        Ok(())
    }
}

/// Children with delete events first, then the rest in tree order
fn ordered(node: &TreeNode) -> impl Iterator<Item = &TreeNode> {
    let deletes = node
        .children()
        .iter()
        .filter(|c| c.event() == Some(NodeEvent::Delete));
    let others = node
        .children()
        .iter()
        .filter(|c| c.event() != Some(NodeEvent::Delete));
    deletes.chain(others)
}

/// Children that are written rather than deleted
fn written(node: &TreeNode) -> impl Iterator<Item = &TreeNode> {
    node.children()
        .iter()
        .filter(|c| c.event() != Some(NodeEvent::Delete))
}

/// IDs of children flagged for deletion
fn deleted_ids(node: &TreeNode) -> impl Iterator<Item = u16> + '_ {
    node.children()
        .iter()
        .filter(|c| c.event() == Some(NodeEvent::Delete))
        .filter_map(TreeNode::id)
}

fn node_id(node: &TreeNode) -> Result<u16> {
    node.id()
        .ok_or_else(|| Lwm2mError::Protocol(format!("{:?} node without ID", node.kind())))
}
