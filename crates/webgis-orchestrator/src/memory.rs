//! In-memory Web GIS backend.
//!
//! Behaves like the remote service for everything the orchestrator relies on:
//! sibling names are unique, non-empty groups refuse a plain delete, moves into
//! one's own subtree fail. Failures can be scripted per resource name or id,
//! optionally for a limited number of calls, and every call can be slowed down
//! to exercise concurrency.

use crate::remote::RemoteResourceClient;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;
use webgis_core::{
    Error, LayerSource, MetadataEntry, NodeData, NodeSpec, ResourceId, ResourceKind, Result,
    ServiceDescriptor, ServiceKind, StyleSource,
};

#[derive(Clone, Debug, PartialEq, Eq)]
enum Matcher {
    Name(String),
    Resource(ResourceId),
}

#[derive(Clone, Debug)]
struct ScriptedFailure {
    matcher: Matcher,
    error: Error,
    /// `None` fails forever.
    remaining: Option<u32>,
}

#[derive(Default)]
struct State {
    nodes: HashMap<ResourceId, NodeData>,
    children: HashMap<ResourceId, Vec<ResourceId>>,
    next_id: u64,
    failures: Vec<ScriptedFailure>,
    calls_by_name: HashMap<String, usize>,
}

impl State {
    fn node(&self, id: ResourceId) -> Result<&NodeData> {
        self.nodes.get(&id).ok_or(Error::NotFound(id))
    }

    fn children_of(&self, id: ResourceId) -> &[ResourceId] {
        self.children.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    fn require_unique(&self, parent: ResourceId, name: &str, except: Option<ResourceId>) -> Result<()> {
        let clash = self.children_of(parent).iter().any(|c| {
            Some(*c) != except
                && self
                    .nodes
                    .get(c)
                    .is_some_and(|n| n.display_name.eq_ignore_ascii_case(name))
        });
        if clash {
            return Err(Error::conflict(format!(
                "resource named \"{}\" already exists in {}",
                name, parent
            )));
        }
        Ok(())
    }

    fn require_container(&self, parent: ResourceId, kind: ResourceKind) -> Result<()> {
        let parent_kind = self.node(parent)?.kind;
        let allowed = match kind {
            ResourceKind::Style => parent_kind.is_layer(),
            _ => parent_kind.is_group(),
        };
        if !allowed {
            return Err(Error::invalid_intent(format!(
                "{} cannot be placed in {} ({})",
                kind, parent, parent_kind
            )));
        }
        Ok(())
    }

    fn allocate(&mut self) -> ResourceId {
        self.next_id += 1;
        ResourceId(self.next_id)
    }

    fn attach(&mut self, node: NodeData) {
        if let Some(parent) = node.parent {
            self.children.entry(parent).or_default().push(node.id);
        }
        self.nodes.insert(node.id, node);
    }

    fn detach(&mut self, id: ResourceId) {
        let parent = self.nodes.get(&id).and_then(|n| n.parent);
        if let Some(siblings) = parent.and_then(|p| self.children.get_mut(&p)) {
            siblings.retain(|c| *c != id);
        }
    }

    fn subtree(&self, id: ResourceId) -> Vec<ResourceId> {
        let mut out = vec![id];
        let mut i = 0;
        while i < out.len() {
            out.extend_from_slice(self.children_of(out[i]));
            i += 1;
        }
        out
    }

    fn create(&mut self, parent: ResourceId, kind: ResourceKind, name: &str) -> Result<NodeData> {
        self.require_container(parent, kind)?;
        self.require_unique(parent, name, None)?;
        let id = self.allocate();
        let node = NodeData::new(id, Some(parent), kind, name);
        self.attach(node.clone());
        Ok(node)
    }

    /// Count the call and fire the first matching scripted failure, if any.
    fn check(&mut self, name: &str, id: Option<ResourceId>) -> Result<()> {
        *self.calls_by_name.entry(name.to_string()).or_default() += 1;
        let hit = self.failures.iter().position(|f| {
            let matches = match &f.matcher {
                Matcher::Name(n) => n == name,
                Matcher::Resource(r) => Some(*r) == id,
            };
            matches && f.remaining != Some(0)
        });
        let Some(index) = hit else {
            return Ok(());
        };
        let failure = &mut self.failures[index];
        if let Some(remaining) = failure.remaining.as_mut() {
            *remaining -= 1;
        }
        debug!(item = name, error = %failure.error, "Scripted failure");
        Err(failure.error.clone())
    }
}

/// Decrements the in-flight gauge when the call returns.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct InMemoryRemote {
    state: Mutex<State>,
    latency: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Seed with the same resources the cached tree starts from.
    pub fn from_snapshot(nodes: impl IntoIterator<Item = NodeData>) -> Self {
        let remote = Self::new();
        {
            let mut state = remote.lock();
            for node in nodes {
                state.next_id = state.next_id.max(node.id.get());
                state.attach(node);
            }
        }
        remote
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Every call touching a resource with this name fails with `error`.
    pub fn fail_on_name(&self, name: impl Into<String>, error: Error) {
        self.script(Matcher::Name(name.into()), error, None);
    }

    /// The next `times` calls touching a resource with this name fail with `error`.
    pub fn fail_on_name_times(&self, name: impl Into<String>, error: Error, times: u32) {
        self.script(Matcher::Name(name.into()), error, Some(times));
    }

    pub fn fail_on_resource(&self, id: ResourceId, error: Error) {
        self.script(Matcher::Resource(id), error, None);
    }

    pub fn get(&self, id: ResourceId) -> Option<NodeData> {
        self.lock().nodes.get(&id).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<NodeData> {
        self.lock()
            .nodes
            .values()
            .find(|n| n.display_name == name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of remote calls served.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, name: &str) -> usize {
        self.lock().calls_by_name.get(name).copied().unwrap_or(0)
    }

    /// Highest number of calls observed running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn script(&self, matcher: Matcher, error: Error, remaining: Option<u32>) {
        self.lock().failures.push(ScriptedFailure {
            matcher,
            error,
            remaining,
        });
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn enter(&self) -> InFlight<'_> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        guard
    }

    fn name_of(state: &State, id: ResourceId) -> String {
        state
            .nodes
            .get(&id)
            .map(|n| n.display_name.clone())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl RemoteResourceClient for InMemoryRemote {
    async fn create_node(&self, parent: ResourceId, spec: NodeSpec) -> Result<NodeData> {
        let _call = self.enter().await;
        let mut state = self.lock();
        state.check(&spec.display_name, None)?;
        for reference in &spec.references {
            state.node(*reference)?;
        }
        state.create(parent, spec.kind, &spec.display_name)
    }

    async fn delete_node(&self, id: ResourceId, recursive: bool) -> Result<()> {
        let _call = self.enter().await;
        let mut state = self.lock();
        let name = Self::name_of(&state, id);
        state.check(&name, Some(id))?;
        state.node(id)?;
        if !recursive && !state.children_of(id).is_empty() {
            return Err(Error::NonEmptyGroup(id));
        }
        state.detach(id);
        for gone in state.subtree(id) {
            state.children.remove(&gone);
            state.nodes.remove(&gone);
        }
        Ok(())
    }

    async fn rename_node(&self, id: ResourceId, name: &str) -> Result<()> {
        let _call = self.enter().await;
        let mut state = self.lock();
        let current = Self::name_of(&state, id);
        state.check(&current, Some(id))?;
        let parent = state.node(id)?.parent;
        if let Some(parent) = parent {
            state.require_unique(parent, name, Some(id))?;
        }
        if let Some(node) = state.nodes.get_mut(&id) {
            node.display_name = name.to_string();
        }
        Ok(())
    }

    async fn move_node(&self, id: ResourceId, new_parent: ResourceId) -> Result<()> {
        let _call = self.enter().await;
        let mut state = self.lock();
        let name = Self::name_of(&state, id);
        state.check(&name, Some(id))?;
        let kind = state.node(id)?.kind;
        state.require_container(new_parent, kind)?;
        if state.subtree(id).contains(&new_parent) {
            return Err(Error::Cycle { id, new_parent });
        }
        state.require_unique(new_parent, &name, Some(id))?;
        state.detach(id);
        if let Some(node) = state.nodes.get_mut(&id) {
            node.parent = Some(new_parent);
        }
        state.children.entry(new_parent).or_default().push(id);
        Ok(())
    }

    async fn copy_node(&self, id: ResourceId, new_parent: ResourceId) -> Result<NodeData> {
        let _call = self.enter().await;
        let mut state = self.lock();
        let name = Self::name_of(&state, id);
        state.check(&name, Some(id))?;
        let kind = state.node(id)?.kind;
        state.require_container(new_parent, kind)?;
        if state.subtree(id).contains(&new_parent) {
            return Err(Error::Cycle { id, new_parent });
        }
        state.require_unique(new_parent, &name, None)?;

        let mut mapping: HashMap<ResourceId, ResourceId> = HashMap::new();
        let mut top = None;
        for original in state.subtree(id) {
            let source = state.node(original)?.clone();
            let copy_id = state.allocate();
            mapping.insert(original, copy_id);
            let parent = match source.parent.and_then(|p| mapping.get(&p)) {
                Some(mapped) if original != id => *mapped,
                _ => new_parent,
            };
            let copy = NodeData {
                id: copy_id,
                parent: Some(parent),
                ..source
            };
            if original == id {
                top = Some(copy.clone());
            }
            state.attach(copy);
        }
        top.ok_or(Error::NotFound(id))
    }

    async fn import_layer(&self, parent: ResourceId, source: LayerSource) -> Result<NodeData> {
        let _call = self.enter().await;
        let mut state = self.lock();
        state.check(&source.display_name, None)?;
        if !source.kind.is_layer() {
            return Err(Error::invalid_intent(format!(
                "{} is not a layer kind",
                source.kind
            )));
        }
        let mut node = state.create(parent, source.kind, &source.display_name)?;
        node.metadata.insert("source".into(), source.uri);
        if let Some(stored) = state.nodes.get_mut(&node.id) {
            stored.metadata = node.metadata.clone();
        }
        Ok(node)
    }

    async fn publish_service(
        &self,
        layer: ResourceId,
        parent: ResourceId,
        kind: ServiceKind,
    ) -> Result<ServiceDescriptor> {
        let _call = self.enter().await;
        let mut state = self.lock();
        let name = Self::name_of(&state, layer);
        state.check(&name, Some(layer))?;
        state.node(layer)?;
        let (suffix, path) = match kind {
            ServiceKind::Wfs { .. } => ("WFS service", "wfs"),
            ServiceKind::Wms { style } => {
                state.node(style)?;
                ("WMS service", "wms")
            }
        };
        let node = state.create(parent, kind.resource_kind(), &format!("{} {}", name, suffix))?;
        let url = format!("memory://resource/{}/{}", node.id, path);
        Ok(ServiceDescriptor { node, url })
    }

    async fn update_style(&self, id: ResourceId, style: StyleSource) -> Result<Vec<MetadataEntry>> {
        let _call = self.enter().await;
        let mut state = self.lock();
        let name = Self::name_of(&state, id);
        state.check(&name, Some(id))?;
        let node = state.nodes.get_mut(&id).ok_or(Error::NotFound(id))?;
        if node.kind != ResourceKind::Style {
            return Err(Error::invalid_intent(format!("resource {} is not a style", id)));
        }
        let written = vec![
            MetadataEntry::new("format", style.format),
            MetadataEntry::new("content_length", style.content.len().to_string()),
        ];
        write_metadata(node, &written);
        Ok(written)
    }

    async fn overwrite_layer(&self, id: ResourceId, source: LayerSource) -> Result<Vec<MetadataEntry>> {
        let _call = self.enter().await;
        let mut state = self.lock();
        let name = Self::name_of(&state, id);
        state.check(&name, Some(id))?;
        let node = state.nodes.get_mut(&id).ok_or(Error::NotFound(id))?;
        if node.kind != ResourceKind::VectorLayer || source.kind != ResourceKind::VectorLayer {
            return Err(Error::invalid_intent(format!(
                "resource {} cannot be overwritten with {}",
                id, source.kind
            )));
        }
        let written = vec![MetadataEntry::new("source", source.uri)];
        write_metadata(node, &written);
        debug!(id = %id, "Layer overwritten");
        Ok(written)
    }

    async fn update_metadata(&self, id: ResourceId, entries: &[MetadataEntry]) -> Result<()> {
        let _call = self.enter().await;
        let mut state = self.lock();
        let name = Self::name_of(&state, id);
        state.check(&name, Some(id))?;
        let node = state.nodes.get_mut(&id).ok_or(Error::NotFound(id))?;
        write_metadata(node, entries);
        Ok(())
    }

    async fn list_children(&self, id: ResourceId) -> Result<Vec<NodeData>> {
        let _call = self.enter().await;
        let mut state = self.lock();
        let name = Self::name_of(&state, id);
        state.check(&name, Some(id))?;
        state.node(id)?;
        Ok(state
            .children_of(id)
            .iter()
            .filter_map(|c| state.nodes.get(c).cloned())
            .collect())
    }
}

fn write_metadata(node: &mut NodeData, entries: &[MetadataEntry]) {
    for entry in entries {
        node.metadata.insert(entry.key.clone(), entry.value.clone());
    }
}
