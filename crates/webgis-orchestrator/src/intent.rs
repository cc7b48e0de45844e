//! User intents and their decomposition into lock sets and jobs.
//!
//! Planning is synchronous and reads the cached tree only. Everything that can
//! be rejected without talking to the remote is rejected here, so the caller of
//! `submit` gets validation errors immediately.

use crate::job::JobPayload;
use crate::tracker::{LockRequest, LockScope, OperationKind};
use crate::tree::ResourceTree;
use serde::{Deserialize, Serialize};
use webgis_core::{
    Error, LayerSource, MetadataEntry, NodeSpec, ResourceId, ResourceKind, Result, ServiceKind,
    StyleSource,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Intent {
    CreateGroup {
        parent: ResourceId,
        name: String,
    },
    Delete {
        target: ResourceId,
        #[serde(default)]
        recursive: bool,
    },
    Rename {
        target: ResourceId,
        name: String,
    },
    Move {
        target: ResourceId,
        new_parent: ResourceId,
    },
    Copy {
        target: ResourceId,
        new_parent: ResourceId,
    },
    /// One independent job per layer.
    ImportLayers {
        parent: ResourceId,
        layers: Vec<LayerSource>,
    },
    /// Create a group named after the project, then import every layer into it.
    ImportProject {
        parent: ResourceId,
        group_name: String,
        layers: Vec<LayerSource>,
    },
    PublishWfs {
        layer: ResourceId,
        max_features: u32,
    },
    PublishWms {
        layer: ResourceId,
        style: ResourceId,
    },
    /// Web map for a style, or for a layer together with one of its styles.
    CreateWebMap {
        source: ResourceId,
        #[serde(default)]
        style: Option<ResourceId>,
        #[serde(default)]
        name: Option<String>,
    },
    CreateStyle {
        layer: ResourceId,
        style: StyleSource,
    },
    UpdateStyle {
        style: ResourceId,
        source: StyleSource,
    },
    UpdateMetadata {
        target: ResourceId,
        entries: Vec<MetadataEntry>,
    },
    /// Replace the features of an existing vector layer.
    OverwriteLayer {
        layer: ResourceId,
        source: LayerSource,
    },
    /// Fetch the children of a resource into the cache.
    LoadChildren {
        parent: ResourceId,
    },
}

impl Intent {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::CreateGroup { .. } => OperationKind::Creating,
            Self::Delete { .. } => OperationKind::Deleting,
            Self::Rename { .. } => OperationKind::Renaming,
            Self::Move { .. } => OperationKind::Moving,
            Self::Copy { .. } => OperationKind::Copying,
            Self::ImportLayers { .. } => OperationKind::Importing,
            Self::ImportProject { .. } => OperationKind::ImportingProject,
            Self::PublishWfs { .. } => OperationKind::PublishingWfs,
            Self::PublishWms { .. } => OperationKind::PublishingWms,
            Self::CreateWebMap { .. } => OperationKind::CreatingWebMap,
            Self::CreateStyle { .. } => OperationKind::CreatingStyle,
            Self::UpdateStyle { .. } => OperationKind::UpdatingStyle,
            Self::UpdateMetadata { .. } => OperationKind::UpdatingMetadata,
            Self::OverwriteLayer { .. } => OperationKind::UpdatingLayer,
            Self::LoadChildren { .. } => OperationKind::Loading,
        }
    }

    /// Short description used in logs and reports.
    pub fn label(&self) -> String {
        match self {
            Self::CreateGroup { parent, name } => format!("create group '{}' in {}", name, parent),
            Self::Delete { target, recursive: true } => format!("delete {} recursively", target),
            Self::Delete { target, .. } => format!("delete {}", target),
            Self::Rename { target, name } => format!("rename {} to '{}'", target, name),
            Self::Move { target, new_parent } => format!("move {} to {}", target, new_parent),
            Self::Copy { target, new_parent } => format!("copy {} to {}", target, new_parent),
            Self::ImportLayers { parent, layers } => {
                format!("import {} layer(s) into {}", layers.len(), parent)
            }
            Self::ImportProject {
                parent, group_name, ..
            } => format!("import project '{}' into {}", group_name, parent),
            Self::PublishWfs { layer, .. } => format!("publish {} as WFS", layer),
            Self::PublishWms { layer, .. } => format!("publish {} as WMS", layer),
            Self::CreateWebMap { source, .. } => format!("create web map for {}", source),
            Self::CreateStyle { layer, .. } => format!("create style for {}", layer),
            Self::UpdateStyle { style, .. } => format!("update style {}", style),
            Self::UpdateMetadata { target, .. } => format!("update metadata of {}", target),
            Self::OverwriteLayer { layer, source } => {
                format!("overwrite {} with '{}'", layer, source.uri)
            }
            Self::LoadChildren { parent } => format!("load children of {}", parent),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PlannedJob {
    pub item: String,
    pub targets: Vec<ResourceId>,
    pub payload: JobPayload,
}

/// Layers imported into the group created by the first stage of a project import.
#[derive(Clone, Debug)]
pub struct FollowUp {
    pub layers: Vec<LayerSource>,
}

#[derive(Clone, Debug)]
pub struct Plan {
    pub kind: OperationKind,
    pub locks: Vec<LockRequest>,
    pub jobs: Vec<PlannedJob>,
    pub follow_up: Option<FollowUp>,
}

impl Plan {
    fn single(kind: OperationKind, locks: Vec<LockRequest>, job: PlannedJob) -> Self {
        Self {
            kind,
            locks,
            jobs: vec![job],
            follow_up: None,
        }
    }
}

/// Validate `intent` against the cached tree and decompose it.
pub fn plan(intent: &Intent, tree: &ResourceTree) -> Result<Plan> {
    let kind = intent.kind();
    match intent {
        Intent::CreateGroup { parent, name } => {
            require_name(name)?;
            let group = tree.nearest_group(*parent)?;
            Ok(Plan::single(
                kind,
                vec![LockRequest::new(group, kind)],
                PlannedJob {
                    item: name.clone(),
                    targets: vec![group],
                    payload: JobPayload::CreateNode {
                        parent: group,
                        spec: NodeSpec::group(name.clone()),
                    },
                },
            ))
        }

        Intent::Delete { target, recursive } => {
            let node = tree.get(*target)?;
            require_not_root(node.parent, "deleted")?;
            if !recursive && !node.children.is_empty() {
                return Err(Error::NonEmptyGroup(*target));
            }
            Ok(Plan::single(
                kind,
                vec![LockRequest::new(*target, kind)],
                PlannedJob {
                    item: node.display_name.clone(),
                    targets: vec![*target],
                    payload: JobPayload::Delete {
                        id: *target,
                        recursive: *recursive,
                    },
                },
            ))
        }

        Intent::Rename { target, name } => {
            require_name(name)?;
            let node = tree.get(*target)?;
            require_not_root(node.parent, "renamed")?;
            Ok(Plan::single(
                kind,
                vec![LockRequest::new(*target, kind)],
                PlannedJob {
                    item: node.display_name.clone(),
                    targets: vec![*target],
                    payload: JobPayload::Rename {
                        id: *target,
                        name: name.clone(),
                    },
                },
            ))
        }

        Intent::Move { target, new_parent } | Intent::Copy { target, new_parent } => {
            let node = tree.get(*target)?;
            let verb = if kind == OperationKind::Moving { "moved" } else { "copied" };
            require_not_root(node.parent, verb)?;
            require_group(tree, *new_parent)?;
            if new_parent == target || tree.is_descendant(*new_parent, *target) {
                return Err(Error::Cycle {
                    id: *target,
                    new_parent: *new_parent,
                });
            }
            if kind == OperationKind::Moving && node.parent == Some(*new_parent) {
                return Err(Error::invalid_intent(format!(
                    "resource {} is already in {}",
                    target, new_parent
                )));
            }
            let payload = if kind == OperationKind::Moving {
                JobPayload::Move {
                    id: *target,
                    new_parent: *new_parent,
                }
            } else {
                JobPayload::Copy {
                    id: *target,
                    new_parent: *new_parent,
                }
            };
            Ok(Plan::single(
                kind,
                vec![
                    LockRequest::new(*target, kind),
                    LockRequest {
                        id: *new_parent,
                        kind,
                        scope: LockScope::Node,
                    },
                ],
                PlannedJob {
                    item: node.display_name.clone(),
                    targets: vec![*target, *new_parent],
                    payload,
                },
            ))
        }

        Intent::ImportLayers { parent, layers } => {
            require_layers(layers)?;
            let group = tree.nearest_group(*parent)?;
            let jobs = layers
                .iter()
                .map(|source| PlannedJob {
                    item: source.display_name.clone(),
                    targets: vec![group],
                    payload: JobPayload::ImportLayer {
                        parent: group,
                        source: source.clone(),
                    },
                })
                .collect();
            Ok(Plan {
                kind,
                locks: vec![LockRequest::new(group, kind)],
                jobs,
                follow_up: None,
            })
        }

        Intent::ImportProject {
            parent,
            group_name,
            layers,
        } => {
            require_name(group_name)?;
            require_layers(layers)?;
            let group = tree.nearest_group(*parent)?;
            Ok(Plan {
                kind,
                locks: vec![LockRequest::new(group, kind)],
                jobs: vec![PlannedJob {
                    item: group_name.clone(),
                    targets: vec![group],
                    payload: JobPayload::CreateNode {
                        parent: group,
                        spec: NodeSpec::group(group_name.clone()),
                    },
                }],
                follow_up: Some(FollowUp {
                    layers: layers.clone(),
                }),
            })
        }

        Intent::PublishWfs {
            layer,
            max_features,
        } => {
            let node = tree.get(*layer)?;
            if node.kind != ResourceKind::VectorLayer {
                return Err(Error::invalid_intent(format!(
                    "WFS can only be published for vector layers, {} is {}",
                    layer, node.kind
                )));
            }
            if *max_features == 0 {
                return Err(Error::invalid_intent("max_features must be positive"));
            }
            publish_plan(
                tree,
                kind,
                *layer,
                ServiceKind::Wfs {
                    max_features: *max_features,
                },
            )
        }

        Intent::PublishWms { layer, style } => {
            let node = tree.get(*layer)?;
            if !node.kind.is_layer() {
                return Err(Error::invalid_intent(format!(
                    "WMS can only be published for layers, {} is {}",
                    layer, node.kind
                )));
            }
            require_style_of(tree, *style, *layer)?;
            publish_plan(tree, kind, *layer, ServiceKind::Wms { style: *style })
        }

        Intent::CreateWebMap {
            source,
            style,
            name,
        } => {
            let node = tree.get(*source)?;
            let style_id = match (node.kind, style) {
                (ResourceKind::Style, _) => *source,
                (k, Some(style)) if k.is_layer() => {
                    require_style_of(tree, *style, *source)?;
                    *style
                }
                (k, None) if k.is_layer() => tree
                    .children(*source)?
                    .into_iter()
                    .find(|c| c.kind == ResourceKind::Style)
                    .map(|c| c.id)
                    .ok_or_else(|| {
                        Error::invalid_intent(format!("layer {} has no style to display", source))
                    })?,
                (k, _) => {
                    return Err(Error::invalid_intent(format!(
                        "web maps are built from layers or styles, {} is {}",
                        source, k
                    )))
                }
            };
            let map_name = match name {
                Some(n) => {
                    require_name(n)?;
                    n.clone()
                }
                None => format!("{} map", node.display_name),
            };
            let group = tree.nearest_group(*source)?;
            Ok(Plan::single(
                kind,
                vec![LockRequest::new(*source, kind)],
                PlannedJob {
                    item: map_name.clone(),
                    targets: vec![*source],
                    payload: JobPayload::CreateNode {
                        parent: group,
                        spec: NodeSpec::web_map(map_name, vec![style_id]),
                    },
                },
            ))
        }

        Intent::CreateStyle { layer, style } => {
            require_name(&style.display_name)?;
            let node = tree.get(*layer)?;
            if !node.kind.is_layer() {
                return Err(Error::invalid_intent(format!(
                    "styles belong to layers, {} is {}",
                    layer, node.kind
                )));
            }
            Ok(Plan::single(
                kind,
                vec![LockRequest::new(*layer, kind)],
                PlannedJob {
                    item: style.display_name.clone(),
                    targets: vec![*layer],
                    payload: JobPayload::CreateNode {
                        parent: *layer,
                        spec: NodeSpec::style(style.clone()),
                    },
                },
            ))
        }

        Intent::UpdateStyle { style, source } => {
            let node = tree.get(*style)?;
            if node.kind != ResourceKind::Style {
                return Err(Error::invalid_intent(format!(
                    "resource {} is {}, not a style",
                    style, node.kind
                )));
            }
            Ok(Plan::single(
                kind,
                vec![LockRequest::new(*style, kind)],
                PlannedJob {
                    item: node.display_name.clone(),
                    targets: vec![*style],
                    payload: JobPayload::UpdateStyle {
                        id: *style,
                        style: source.clone(),
                    },
                },
            ))
        }

        Intent::UpdateMetadata { target, entries } => {
            if entries.is_empty() {
                return Err(Error::invalid_intent("no metadata entries to update"));
            }
            if entries.iter().any(|e| e.key.trim().is_empty()) {
                return Err(Error::invalid_intent("metadata keys must not be empty"));
            }
            let node = tree.get(*target)?;
            Ok(Plan::single(
                kind,
                vec![LockRequest::new(*target, kind)],
                PlannedJob {
                    item: node.display_name.clone(),
                    targets: vec![*target],
                    payload: JobPayload::UpdateMetadata {
                        id: *target,
                        entries: entries.clone(),
                    },
                },
            ))
        }

        Intent::OverwriteLayer { layer, source } => {
            let node = tree.get(*layer)?;
            if node.kind != ResourceKind::VectorLayer {
                return Err(Error::invalid_intent(format!(
                    "only vector layers can be overwritten, {} is {}",
                    layer, node.kind
                )));
            }
            if source.kind != ResourceKind::VectorLayer {
                return Err(Error::invalid_intent(format!(
                    "'{}' is not a vector source ({})",
                    source.display_name, source.kind
                )));
            }
            if source.uri.trim().is_empty() {
                return Err(Error::invalid_intent("layer source has no location"));
            }
            Ok(Plan::single(
                kind,
                vec![LockRequest::new(*layer, kind)],
                PlannedJob {
                    item: node.display_name.clone(),
                    targets: vec![*layer],
                    payload: JobPayload::OverwriteLayer {
                        id: *layer,
                        source: source.clone(),
                    },
                },
            ))
        }

        Intent::LoadChildren { parent } => {
            let node = tree.get(*parent)?;
            Ok(Plan::single(
                kind,
                vec![LockRequest::new(*parent, kind)],
                PlannedJob {
                    item: node.display_name.clone(),
                    targets: vec![*parent],
                    payload: JobPayload::ListChildren { parent: *parent },
                },
            ))
        }
    }
}

/// Jobs of the second stage of a project import, targeting the freshly created group.
pub fn follow_up_jobs(group: ResourceId, follow_up: &FollowUp) -> Vec<PlannedJob> {
    follow_up
        .layers
        .iter()
        .map(|source| PlannedJob {
            item: source.display_name.clone(),
            targets: vec![group],
            payload: JobPayload::ImportLayer {
                parent: group,
                source: source.clone(),
            },
        })
        .collect()
}

fn publish_plan(
    tree: &ResourceTree,
    kind: OperationKind,
    layer: ResourceId,
    service: ServiceKind,
) -> Result<Plan> {
    let node = tree.get(layer)?;
    let group = tree.nearest_group(layer)?;
    Ok(Plan::single(
        kind,
        vec![LockRequest::new(layer, kind)],
        PlannedJob {
            item: node.display_name.clone(),
            targets: vec![layer],
            payload: JobPayload::Publish {
                layer,
                parent: group,
                service,
            },
        },
    ))
}

fn require_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::invalid_intent("display name must not be empty"));
    }
    Ok(())
}

fn require_layers(layers: &[LayerSource]) -> Result<()> {
    if layers.is_empty() {
        return Err(Error::invalid_intent("nothing to import"));
    }
    for layer in layers {
        require_name(&layer.display_name)?;
        if !layer.kind.is_layer() {
            return Err(Error::invalid_intent(format!(
                "'{}' is not a layer source ({})",
                layer.display_name, layer.kind
            )));
        }
    }
    Ok(())
}

fn require_not_root(parent: Option<ResourceId>, verb: &str) -> Result<()> {
    if parent.is_none() {
        return Err(Error::invalid_intent(format!(
            "the root resource group cannot be {}",
            verb
        )));
    }
    Ok(())
}

fn require_group(tree: &ResourceTree, id: ResourceId) -> Result<()> {
    let node = tree.get(id)?;
    if !node.kind.is_group() {
        return Err(Error::invalid_intent(format!(
            "destination {} is {}, not a resource group",
            id, node.kind
        )));
    }
    Ok(())
}

fn require_style_of(tree: &ResourceTree, style: ResourceId, layer: ResourceId) -> Result<()> {
    let node = tree.get(style)?;
    if node.kind != ResourceKind::Style || node.parent != Some(layer) {
        return Err(Error::invalid_intent(format!(
            "resource {} is not a style of layer {}",
            style, layer
        )));
    }
    Ok(())
}
