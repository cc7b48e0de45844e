//! Remote resource client trait
//!
//! The orchestrator treats the Web GIS API as an opaque capability. Every call
//! either succeeds or fails with a classified [`webgis_core::Error`]; only
//! `Transient` failures are retried by the scheduler.

use webgis_core::{
    LayerSource, MetadataEntry, NodeData, NodeSpec, ResourceId, Result, ServiceDescriptor,
    ServiceKind, StyleSource,
};

#[async_trait::async_trait]
pub trait RemoteResourceClient: Send + Sync {
    /// Create a resource (group, web map, style) under `parent`.
    async fn create_node(&self, parent: ResourceId, spec: NodeSpec) -> Result<NodeData>;

    async fn delete_node(&self, id: ResourceId, recursive: bool) -> Result<()>;

    async fn rename_node(&self, id: ResourceId, name: &str) -> Result<()>;

    async fn move_node(&self, id: ResourceId, new_parent: ResourceId) -> Result<()>;

    /// Deep copy of `id` under `new_parent`. Returns the new top-level resource.
    async fn copy_node(&self, id: ResourceId, new_parent: ResourceId) -> Result<NodeData>;

    async fn import_layer(&self, parent: ResourceId, source: LayerSource) -> Result<NodeData>;

    /// Publish `layer` as a web service placed in the group `parent`.
    async fn publish_service(
        &self,
        layer: ResourceId,
        parent: ResourceId,
        kind: ServiceKind,
    ) -> Result<ServiceDescriptor>;

    /// Upload new style content. Returns the metadata the remote rewrote.
    async fn update_style(&self, id: ResourceId, style: StyleSource) -> Result<Vec<MetadataEntry>>;

    /// Replace the features of a vector layer. Returns the metadata the remote rewrote.
    async fn overwrite_layer(&self, id: ResourceId, source: LayerSource) -> Result<Vec<MetadataEntry>>;

    async fn update_metadata(&self, id: ResourceId, entries: &[MetadataEntry]) -> Result<()>;

    async fn list_children(&self, id: ResourceId) -> Result<Vec<NodeData>>;
}
