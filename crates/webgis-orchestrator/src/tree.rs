//! In-memory cache of the remote resource hierarchy.
//!
//! The tree only ever holds state the remote has confirmed. Inside the
//! orchestrator it is mutated exclusively by the reconciliation engine;
//! everyone else sees it through a read guard.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use webgis_core::{Error, MetadataEntry, NodeData, ResourceId, ResourceKind, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResourceNode {
    pub id: ResourceId,
    /// Back reference by identity. Never owning.
    pub parent: Option<ResourceId>,
    pub kind: ResourceKind,
    pub display_name: String,
    pub metadata: BTreeMap<String, String>,
    /// Ordered child identities.
    pub children: Vec<ResourceId>,
    /// Starts at 1 on insert, bumped by every confirmed mutation of this node.
    pub revision: u64,
    /// Whether the children listing was fetched from the remote.
    pub children_loaded: bool,
}

impl ResourceNode {
    fn from_data(data: NodeData, parent: Option<ResourceId>) -> Self {
        Self {
            id: data.id,
            parent,
            kind: data.kind,
            display_name: data.display_name,
            metadata: data.metadata,
            children: Vec::new(),
            revision: 1,
            children_loaded: false,
        }
    }

    pub fn to_data(&self) -> NodeData {
        NodeData {
            id: self.id,
            parent: self.parent,
            kind: self.kind,
            display_name: self.display_name.clone(),
            metadata: self.metadata.clone(),
        }
    }

    fn sort_key(&self) -> (u8, String) {
        (self.kind.display_rank(), self.display_name.to_lowercase())
    }
}

#[derive(Debug, Default)]
pub struct ResourceTree {
    nodes: HashMap<ResourceId, ResourceNode>,
    root: Option<ResourceId>,
}

impl ResourceTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: NodeData) -> Self {
        let mut tree = Self::new();
        let id = root.id;
        tree.nodes.insert(id, ResourceNode::from_data(root, None));
        tree.root = Some(id);
        tree
    }

    /// Build a tree from a flat listing in any order. Exactly one entry must be parentless.
    pub fn from_snapshot(entries: Vec<NodeData>) -> Result<Self> {
        let mut roots = entries.iter().filter(|e| e.parent.is_none());
        let root = roots
            .next()
            .cloned()
            .ok_or_else(|| Error::invalid_intent("snapshot has no root resource"))?;
        if roots.next().is_some() {
            return Err(Error::invalid_intent("snapshot has more than one root resource"));
        }

        let mut tree = Self::with_root(root);
        let mut pending: Vec<NodeData> = entries.into_iter().filter(|e| e.parent.is_some()).collect();
        while !pending.is_empty() {
            let before = pending.len();
            let mut deferred = Vec::new();
            for entry in pending {
                match entry.parent {
                    Some(parent) if tree.contains(parent) => tree.insert(parent, entry)?,
                    _ => deferred.push(entry),
                }
            }
            if deferred.len() == before {
                let orphan = deferred[0].id;
                return Err(Error::invalid_intent(format!(
                    "snapshot entry {orphan} has no reachable parent"
                )));
            }
            pending = deferred;
        }

        for node in tree.nodes.values_mut() {
            node.children_loaded = true;
        }
        Ok(tree)
    }

    pub fn root(&self) -> Option<ResourceId> {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn get(&self, id: ResourceId) -> Result<&ResourceNode> {
        self.nodes.get(&id).ok_or(Error::NotFound(id))
    }

    pub fn children(&self, id: ResourceId) -> Result<Vec<&ResourceNode>> {
        let node = self.get(id)?;
        Ok(node
            .children
            .iter()
            .filter_map(|child| self.nodes.get(child))
            .collect())
    }

    /// Ancestors of `id`, nearest first. Empty for the root or unknown ids.
    pub fn ancestors(&self, id: ResourceId) -> Vec<ResourceId> {
        let mut out = Vec::new();
        let mut cursor = self.nodes.get(&id).and_then(|n| n.parent);
        while let Some(parent) = cursor {
            out.push(parent);
            cursor = self.nodes.get(&parent).and_then(|n| n.parent);
        }
        out
    }

    /// All descendants of `id` in pre-order, excluding `id` itself.
    pub fn descendants(&self, id: ResourceId) -> Vec<ResourceId> {
        let mut out = Vec::new();
        let mut stack: Vec<ResourceId> = match self.nodes.get(&id) {
            Some(node) => node.children.iter().rev().copied().collect(),
            None => return out,
        };
        while let Some(next) = stack.pop() {
            out.push(next);
            if let Some(node) = self.nodes.get(&next) {
                stack.extend(node.children.iter().rev().copied());
            }
        }
        out
    }

    pub fn is_descendant(&self, candidate: ResourceId, of: ResourceId) -> bool {
        self.ancestors(candidate).contains(&of)
    }

    /// `id` itself if it is a group, otherwise its closest group ancestor.
    pub fn nearest_group(&self, id: ResourceId) -> Result<ResourceId> {
        let node = self.get(id)?;
        if node.kind.is_group() {
            return Ok(id);
        }
        self.ancestors(id)
            .into_iter()
            .find(|a| self.nodes.get(a).is_some_and(|n| n.kind.is_group()))
            .ok_or_else(|| Error::invalid_intent(format!("resource {id} has no enclosing group")))
    }

    pub fn insert(&mut self, parent: ResourceId, data: NodeData) -> Result<()> {
        if self.nodes.contains_key(&data.id) {
            return Err(Error::conflict(format!("resource {} already present", data.id)));
        }
        if !self.nodes.contains_key(&parent) {
            return Err(Error::NotFound(parent));
        }
        let node = ResourceNode::from_data(data, Some(parent));
        let id = node.id;
        let position = self.child_position(parent, &node);
        self.nodes.insert(id, node);
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children.insert(position, id);
        }
        Ok(())
    }

    /// Detach `id` and its cached subtree. Returns every removed identity.
    pub fn remove(&mut self, id: ResourceId, recursive: bool) -> Result<Vec<ResourceId>> {
        let node = self.get(id)?;
        if !node.children.is_empty() && !recursive {
            return Err(Error::NonEmptyGroup(id));
        }
        let parent = node.parent;

        let mut removed = vec![id];
        removed.extend(self.descendants(id));
        for gone in &removed {
            self.nodes.remove(gone);
        }
        match parent {
            Some(parent) => {
                if let Some(parent_node) = self.nodes.get_mut(&parent) {
                    parent_node.children.retain(|c| *c != id);
                }
            }
            None => self.root = None,
        }
        Ok(removed)
    }

    pub fn rename(&mut self, id: ResourceId, new_name: &str) -> Result<()> {
        let node = self.nodes.get_mut(&id).ok_or(Error::NotFound(id))?;
        node.display_name = new_name.to_string();
        node.revision += 1;
        let parent = node.parent;
        if let Some(parent) = parent {
            self.detach_child(parent, id);
            self.attach_child(parent, id);
        }
        Ok(())
    }

    pub fn move_node(&mut self, id: ResourceId, new_parent: ResourceId) -> Result<()> {
        let node = self.get(id)?;
        let old_parent = node.parent;
        if !self.contains(new_parent) {
            return Err(Error::NotFound(new_parent));
        }
        if new_parent == id || self.is_descendant(new_parent, id) {
            return Err(Error::Cycle { id, new_parent });
        }
        if old_parent == Some(new_parent) {
            return Ok(());
        }

        if let Some(old_parent) = old_parent {
            self.detach_child(old_parent, id);
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            node.parent = Some(new_parent);
            node.revision += 1;
        }
        self.attach_child(new_parent, id);
        Ok(())
    }

    pub fn update_metadata(&mut self, id: ResourceId, entries: &[MetadataEntry]) -> Result<()> {
        let node = self.nodes.get_mut(&id).ok_or(Error::NotFound(id))?;
        for entry in entries {
            node.metadata.insert(entry.key.clone(), entry.value.clone());
        }
        node.revision += 1;
        Ok(())
    }

    /// Bump the revision of a resource whose content changed remotely (style upload).
    pub fn touch(&mut self, id: ResourceId) -> Result<()> {
        let node = self.nodes.get_mut(&id).ok_or(Error::NotFound(id))?;
        node.revision += 1;
        Ok(())
    }

    pub fn mark_children_loaded(&mut self, id: ResourceId) -> Result<()> {
        let node = self.nodes.get_mut(&id).ok_or(Error::NotFound(id))?;
        node.children_loaded = true;
        Ok(())
    }

    /// Pre-order listing of the whole tree.
    pub fn snapshot(&self) -> Vec<NodeData> {
        let Some(root) = self.root else {
            return Vec::new();
        };
        std::iter::once(root)
            .chain(self.descendants(root))
            .filter_map(|id| self.nodes.get(&id).map(ResourceNode::to_data))
            .collect()
    }

    /// Index before the first sibling that `node` outranks.
    fn child_position(&self, parent: ResourceId, node: &ResourceNode) -> usize {
        let key = node.sort_key();
        let Some(parent_node) = self.nodes.get(&parent) else {
            return 0;
        };
        parent_node
            .children
            .iter()
            .position(|sibling| {
                self.nodes
                    .get(sibling)
                    .is_some_and(|s| key < s.sort_key())
            })
            .unwrap_or(parent_node.children.len())
    }

    fn detach_child(&mut self, parent: ResourceId, child: ResourceId) {
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children.retain(|c| *c != child);
        }
    }

    fn attach_child(&mut self, parent: ResourceId, child: ResourceId) {
        let Some(node) = self.nodes.get(&child) else {
            return;
        };
        let position = self.child_position(parent, node);
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children.insert(position, child);
        }
    }
}
