//! Mutation policy.  Decides from Pod metadata whether the exporter sidecar
//! has to be injected.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::{INJECT_ANNOTATION, STATUS_ANNOTATION};

/// Annotation values that opt a Pod into injection.
const TRUTHY_TOKENS: [&str; 4] = ["y", "yes", "true", "on"];

/// Returns true when the Pod opts into the sidecar and has not been injected
/// by a previous pass.  A Pod whose status annotation already reads
/// `injected` is never mutated again, so resubmitting a mutated Pod is a
/// no-op.  Pods without an annotation map are left alone.
pub fn mutation_required(metadata: &ObjectMeta) -> bool {
    let annotations = metadata.annotations.as_ref();
    let status = annotations
        .and_then(|map| map.get(STATUS_ANNOTATION))
        .map(String::as_str)
        .unwrap_or_default();

    let required = if annotations.is_none() || status.eq_ignore_ascii_case("injected") {
        false
    } else {
        annotations
            .and_then(|map| map.get(INJECT_ANNOTATION))
            .map(|value| TRUTHY_TOKENS.contains(&value.to_lowercase().as_str()))
            .unwrap_or(false)
    };

    tracing::info!(
        namespace = metadata.namespace.as_deref().unwrap_or_default(),
        name = metadata.name.as_deref().unwrap_or_default(),
        status,
        required,
        "mutation policy evaluated"
    );
    required
}
