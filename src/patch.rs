//! Patch construction.  Emits the RFC 6902 operations that append the
//! exporter sidecar to a Pod and mark the Pod as injected.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, ContainerPort, Pod, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use once_cell::sync::Lazy;
use serde::Serialize;

use crate::{
    INJECT_ANNOTATION, PROMETHEUS_PATH_ANNOTATION, PROMETHEUS_PORT_ANNOTATION,
    PROMETHEUS_SCRAPE_ANNOTATION,
};

/// Exporter image, pinned to a tag so rollouts stay reproducible.
pub const EXPORTER_IMAGE: &str = "oliver006/redis_exporter:v0.33.0-alpine";
/// Port the exporter listens on inside the Pod.
pub const EXPORTER_PORT: i32 = 9121;

const EXPORTER_CPU: &str = "100m";
const EXPORTER_MEMORY: &str = "100Mi";

/// One RFC 6902 operation addressed into the Pod document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
    Add { path: String, value: PatchValue },
    Replace { path: String, value: PatchValue },
    Remove { path: String },
}

/// Payloads this webhook ever embeds in a patch operation.  Keeping the set
/// closed makes serialization exhaustive instead of funnelling everything
/// through an untyped value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PatchValue {
    Container(Box<Container>),
    Annotations(BTreeMap<String, String>),
    String(String),
}

static DEFAULT_SIDECAR: Lazy<Container> = Lazy::new(|| Container {
    name: "exporter".to_owned(),
    image: Some(EXPORTER_IMAGE.to_owned()),
    image_pull_policy: Some("IfNotPresent".to_owned()),
    ports: Some(vec![ContainerPort {
        container_port: EXPORTER_PORT,
        name: Some("http".to_owned()),
        protocol: Some("TCP".to_owned()),
        ..Default::default()
    }]),
    resources: Some(ResourceRequirements {
        requests: Some(exporter_resources()),
        limits: Some(exporter_resources()),
        ..Default::default()
    }),
    ..Default::default()
});

/// The injected container.  Requests and limits are equal, which pins the
/// sidecar to the Guaranteed QoS class.
pub fn default_sidecar() -> Container {
    DEFAULT_SIDECAR.clone()
}

fn exporter_resources() -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("cpu".to_owned(), Quantity(EXPORTER_CPU.to_owned())),
        ("memory".to_owned(), Quantity(EXPORTER_MEMORY.to_owned())),
    ])
}

fn add_sidecar() -> PatchOperation {
    PatchOperation::Add {
        path: "/spec/containers/-".to_owned(),
        value: PatchValue::Container(Box::new(default_sidecar())),
    }
}

fn update_annotations(annotations: Option<&BTreeMap<String, String>>) -> PatchOperation {
    let inject = annotations
        .and_then(|map| map.get(INJECT_ANNOTATION))
        .map(String::as_str)
        .unwrap_or_default();

    if inject.is_empty() {
        // Whole-map add: a Pod without an inject value gets a fresh
        // annotation map, and anything else that was set on it is dropped.
        return PatchOperation::Add {
            path: "/metadata/annotations".to_owned(),
            value: PatchValue::Annotations(BTreeMap::from([
                (INJECT_ANNOTATION.to_owned(), "injected".to_owned()),
                (PROMETHEUS_SCRAPE_ANNOTATION.to_owned(), "true".to_owned()),
                (PROMETHEUS_PORT_ANNOTATION.to_owned(), String::new()),
                (PROMETHEUS_PATH_ANNOTATION.to_owned(), "/metrics".to_owned()),
            ])),
        };
    }

    PatchOperation::Replace {
        path: format!(
            "/metadata/annotations/{}",
            escape_pointer_token(INJECT_ANNOTATION)
        ),
        value: PatchValue::String("injected".to_owned()),
    }
}

/// RFC 6901 escaping for a single reference token.
fn escape_pointer_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

/// The ordered operation sequence for one Pod: the container append first,
/// the annotation update second.
pub fn build_patch(pod: &Pod) -> Vec<PatchOperation> {
    vec![
        add_sidecar(),
        update_annotations(pod.metadata.annotations.as_ref()),
    ]
}

/// Serialized form of [`build_patch`], ready for the response envelope.
pub fn create_patch(pod: &Pod) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&build_patch(pod))
}
