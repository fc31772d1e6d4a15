//! Resource tree: the intermediate form between the object store and the
//! wire codecs
//!
//! Each node owns its children by value, so dropping a subtree frees it.
//! Values live on resource-instance leaves only; a single-instance resource
//! holds its value in resource instance 0.

use crate::error::{Lwm2mError, Result};
use crate::types::ResourceType;

/// Level of a node in the object hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Root,
    Object,
    ObjectInstance,
    Resource,
    ResourceInstance,
}

impl NodeKind {
    /// Kind of node addressed by a path with `depth` levels
    pub fn for_depth(depth: usize) -> Option<Self> {
        match depth {
            0 => Some(Self::Root),
            1 => Some(Self::Object),
            2 => Some(Self::ObjectInstance),
            3 => Some(Self::Resource),
            4 => Some(Self::ResourceInstance),
            _ => None,
        }
    }

    /// Kind of the children a node of this kind may hold
    pub fn child_kind(self) -> Option<Self> {
        match self {
            Self::Root => Some(Self::Object),
            Self::Object => Some(Self::ObjectInstance),
            Self::ObjectInstance => Some(Self::Resource),
            Self::Resource => Some(Self::ResourceInstance),
            Self::ResourceInstance => None,
        }
    }
}

/// Marks a node as an explicit create or delete in a partial update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    Create,
    Delete,
}

/// Type information carried by resource and resource-instance nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceMeta {
    pub resource_type: ResourceType,
    pub multiple: bool,
}

impl ResourceMeta {
    pub fn new(resource_type: ResourceType, multiple: bool) -> Self {
        Self {
            resource_type,
            multiple,
        }
    }
}

/// A node of the resource tree
#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    kind: NodeKind,
    id: Option<u16>,
    value: Option<Vec<u8>>,
    meta: Option<ResourceMeta>,
    event: Option<NodeEvent>,
    children: Vec<TreeNode>,
}

impl TreeNode {
    fn new(kind: NodeKind, id: Option<u16>) -> Self {
        Self {
            kind,
            id,
            value: None,
            meta: None,
            event: None,
            children: Vec::new(),
        }
    }

    /// Root node; has no ID
    pub fn root() -> Self {
        Self::new(NodeKind::Root, None)
    }

    pub fn object(id: u16) -> Self {
        Self::new(NodeKind::Object, Some(id))
    }

    pub fn object_instance(id: u16) -> Self {
        Self::new(NodeKind::ObjectInstance, Some(id))
    }

    pub fn resource(id: u16, meta: ResourceMeta) -> Self {
        Self {
            meta: Some(meta),
            ..Self::new(NodeKind::Resource, Some(id))
        }
    }

    pub fn resource_instance(id: u16, meta: ResourceMeta, value: Vec<u8>) -> Self {
        Self {
            meta: Some(meta),
            value: Some(value),
            ..Self::new(NodeKind::ResourceInstance, Some(id))
        }
    }

    /// Flag this node as an explicit create/delete
    pub fn with_event(mut self, event: NodeEvent) -> Self {
        self.event = Some(event);
        self
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn id(&self) -> Option<u16> {
        self.id
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn set_value(&mut self, value: Vec<u8>) {
        self.value = Some(value);
    }

    pub fn meta(&self) -> Option<ResourceMeta> {
        self.meta
    }

    pub fn event(&self) -> Option<NodeEvent> {
        self.event
    }

    pub fn children(&self) -> &[TreeNode] {
        &self.children
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub fn child(&self, id: u16) -> Option<&TreeNode> {
        self.children.iter().find(|c| c.id == Some(id))
    }

    pub fn child_mut(&mut self, id: u16) -> Option<&mut TreeNode> {
        self.children.iter_mut().find(|c| c.id == Some(id))
    }

    /// Append a child. The child must be one level below this node and its
    /// ID must not already be present.
    pub fn add_child(&mut self, child: TreeNode) -> Result<&mut TreeNode> {
        if self.kind.child_kind() != Some(child.kind) {
            return Err(Lwm2mError::Internal(format!(
                "{:?} node cannot hold a {:?} child",
                self.kind, child.kind
            )));
        }
        if let Some(id) = child.id
            && self.child(id).is_some()
        {
            return Err(Lwm2mError::AlreadyExists(format!(
                "{:?} {} already in tree",
                child.kind, id
            )));
        }
        self.children.push(child);
        let last = self.children.len() - 1;
        Ok(&mut self.children[last])
    }

    /// Return the child with the same ID as `child`, adding `child` if absent
    pub fn child_or_insert(&mut self, child: TreeNode) -> Result<&mut TreeNode> {
        match child.id.and_then(|id| self.children.iter().position(|c| c.id == Some(id))) {
            Some(index) => Ok(&mut self.children[index]),
            None => self.add_child(child),
        }
    }

    pub fn remove_child(&mut self, id: u16) -> Option<TreeNode> {
        let index = self.children.iter().position(|c| c.id == Some(id))?;
        Some(self.children.remove(index))
    }

    /// Order children by ascending ID, recursively
    pub fn sort(&mut self) {
        self.children.sort_by_key(|c| c.id);
        for child in &mut self.children {
            child.sort();
        }
    }

    /// Number of resource-instance leaves in this subtree
    pub fn leaf_count(&self) -> usize {
        let mut count = 0;
        self.walk(|_, node| {
            if node.kind == NodeKind::ResourceInstance {
                count += 1;
            }
        });
        count
    }

    /// Visit every node depth-first, parents before children. The visitor
    /// receives the chain of ancestors (outermost first) and the node.
    pub fn walk<'a, F>(&'a self, mut visitor: F)
    where
        F: FnMut(&[&'a TreeNode], &'a TreeNode),
    {
        let mut ancestors = Vec::new();
        self.walk_inner(&mut ancestors, &mut visitor);
    }

    fn walk_inner<'a, F>(&'a self, ancestors: &mut Vec<&'a TreeNode>, visitor: &mut F)
    where
        F: FnMut(&[&'a TreeNode], &'a TreeNode),
    {
        visitor(ancestors, self);
        ancestors.push(self);
        for child in &self.children {
            child.walk_inner(ancestors, visitor);
        }
        ancestors.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string_meta() -> ResourceMeta {
        ResourceMeta::new(ResourceType::String, false)
    }

    #[test]
    fn test_hierarchy_enforced() {
        let mut root = TreeNode::root();
        assert!(root.add_child(TreeNode::object_instance(0)).is_err());

        let object = root.add_child(TreeNode::object(3)).unwrap();
        let instance = object.add_child(TreeNode::object_instance(0)).unwrap();
        let resource = instance
            .add_child(TreeNode::resource(1, string_meta()))
            .unwrap();
        resource
            .add_child(TreeNode::resource_instance(0, string_meta(), b"x".to_vec()))
            .unwrap();

        assert_eq!(root.leaf_count(), 1);
        assert_eq!(root.child(3).unwrap().child_count(), 1);
    }

    #[test]
    fn test_duplicate_child_rejected() {
        let mut object = TreeNode::object(3);
        object.add_child(TreeNode::object_instance(0)).unwrap();
        assert!(matches!(
            object.add_child(TreeNode::object_instance(0)),
            Err(Lwm2mError::AlreadyExists(_))
        ));
        object.child_or_insert(TreeNode::object_instance(0)).unwrap();
        assert_eq!(object.child_count(), 1);
    }

    #[test]
    fn test_walk_reports_ancestors() {
        let mut instance = TreeNode::object_instance(0);
        for id in [2, 1] {
            instance
                .add_child(TreeNode::resource(id, string_meta()))
                .unwrap()
                .add_child(TreeNode::resource_instance(0, string_meta(), vec![]))
                .unwrap();
        }
        instance.sort();

        let mut paths = Vec::new();
        instance.walk(|ancestors, node| {
            if node.kind() == NodeKind::ResourceInstance {
                let ids: Vec<_> = ancestors.iter().filter_map(|n| n.id()).collect();
                paths.push(ids);
            }
        });
        assert_eq!(paths, vec![vec![0, 1], vec![0, 2]]);
    }

    #[test]
    fn test_remove_child() {
        let mut object = TreeNode::object(3);
        object.add_child(TreeNode::object_instance(0)).unwrap();
        object.add_child(TreeNode::object_instance(1)).unwrap();
        assert_eq!(object.remove_child(0).unwrap().id(), Some(0));
        assert!(object.remove_child(0).is_none());
        assert_eq!(object.child_count(), 1);
    }
}
