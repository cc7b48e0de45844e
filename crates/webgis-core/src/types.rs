//! Core types for the Web GIS resource hierarchy

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Stable identity assigned by the remote service.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(pub u64);

impl ResourceId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ResourceId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    ResourceGroup,
    VectorLayer,
    RasterLayer,
    WfsService,
    WmsService,
    WebMap,
    Style,
}

impl ResourceKind {
    pub fn is_group(self) -> bool {
        matches!(self, Self::ResourceGroup)
    }

    pub fn is_layer(self) -> bool {
        matches!(self, Self::VectorLayer | Self::RasterLayer)
    }

    /// Sibling ordering rank. Lower ranks are listed first.
    pub fn display_rank(self) -> u8 {
        if self.is_group() {
            0
        } else {
            1
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ResourceGroup => write!(f, "resource_group"),
            Self::VectorLayer => write!(f, "vector_layer"),
            Self::RasterLayer => write!(f, "raster_layer"),
            Self::WfsService => write!(f, "wfs_service"),
            Self::WmsService => write!(f, "wms_service"),
            Self::WebMap => write!(f, "webmap"),
            Self::Style => write!(f, "style"),
        }
    }
}

/// A resource as described by the remote service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeData {
    pub id: ResourceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ResourceId>,
    pub kind: ResourceKind,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl NodeData {
    pub fn new(
        id: impl Into<ResourceId>,
        parent: Option<ResourceId>,
        kind: ResourceKind,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            parent,
            kind,
            display_name: display_name.into(),
            metadata: BTreeMap::new(),
        }
    }
}

/// Request body for creating a resource under a parent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub kind: ResourceKind,
    pub display_name: String,
    /// Resources the new one is built from (styles of a web map).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<ResourceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<StyleSource>,
}

impl NodeSpec {
    pub fn group(name: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::ResourceGroup,
            display_name: name.into(),
            references: Vec::new(),
            style: None,
        }
    }

    pub fn web_map(name: impl Into<String>, references: Vec<ResourceId>) -> Self {
        Self {
            kind: ResourceKind::WebMap,
            display_name: name.into(),
            references,
            style: None,
        }
    }

    pub fn style(style: StyleSource) -> Self {
        Self {
            kind: ResourceKind::Style,
            display_name: style.display_name.clone(),
            references: Vec::new(),
            style: Some(style),
        }
    }
}

/// A local layer to upload. Conversion of the data itself happens outside the orchestrator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSource {
    pub display_name: String,
    pub kind: ResourceKind,
    /// Opaque locator understood by the remote client (file path, provider URI).
    pub uri: String,
}

impl LayerSource {
    pub fn vector(name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            display_name: name.into(),
            kind: ResourceKind::VectorLayer,
            uri: uri.into(),
        }
    }

    pub fn raster(name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            display_name: name.into(),
            kind: ResourceKind::RasterLayer,
            uri: uri.into(),
        }
    }
}

/// Serialized style (QML or similar). `Bytes` keeps clones cheap across retries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyleSource {
    pub display_name: String,
    pub format: String,
    pub content: Bytes,
}

impl StyleSource {
    pub fn qml(name: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            display_name: name.into(),
            format: "qml".into(),
            content: content.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceKind {
    Wfs { max_features: u32 },
    Wms { style: ResourceId },
}

impl ServiceKind {
    pub fn resource_kind(self) -> ResourceKind {
        match self {
            Self::Wfs { .. } => ResourceKind::WfsService,
            Self::Wms { .. } => ResourceKind::WmsService,
        }
    }
}

/// Result of publishing a layer as a web service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub node: NodeData,
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub key: String,
    pub value: String,
}

impl MetadataEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}
