//! Mutating admission webhook for GPU environment injection
//!
//! Intercepts pod CREATE admission and injects `CUDA_VISIBLE_DEVICES` into
//! every container of pods that opted in to the GPU scheduler. The handler
//! is stateless: each request is decided entirely from the pod snapshot in
//! the AdmissionReview, never from a live re-fetch, since admission runs
//! before the object is persisted.
//!
//! The decision pipeline short-circuits to an unmodified "allowed" response
//! at the first non-applicable step. This webhook never rejects a pod - it
//! only optionally mutates it. A pod that cannot be resolved here (e.g. no
//! concrete name yet) simply starts without the variable or is handled by
//! the scheduler once its name exists.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use json_patch::{AddOperation, PatchOperation, ReplaceOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::core::v1::Pod;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::assignment::{ordinal_from_generate_name, parse_assignment_map, ParsePolicy};
use crate::{CUDA_DEVICES_ENV, SCHEDULING_MAP_ANNOTATION};

/// Shared state for the mutation handler
#[derive(Clone, Debug)]
pub struct WebhookState {
    /// Scheduler name pods must declare to be mutated
    pub scheduler_name: String,
    /// Malformed-line policy for annotation parsing
    pub parse_policy: ParsePolicy,
}

/// Create the webhook router
///
/// - `POST /mutate` - pod admission mutation
/// - `GET /healthz` - liveness for the TLS listener itself
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/mutate", post(mutate_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

/// Handle a pod AdmissionReview request
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<Pod>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<Pod> = match review.try_into() {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    Json(mutate_pod(&state, &request).into_review())
}

/// Decide and apply the mutation for one admission request.
///
/// Always allowed; the correlation uid is echoed unchanged via the response
/// built from the request.
fn mutate_pod(state: &WebhookState, request: &AdmissionRequest<Pod>) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);

    let Some(pod) = request.object.as_ref() else {
        debug!(uid = %request.uid, "No pod object in request, allowing unchanged");
        return response;
    };

    let Some(devices) = device_set_for_pod(pod, &state.scheduler_name, state.parse_policy) else {
        return response;
    };

    let patches = build_env_patches(pod, &devices);
    if patches.is_empty() {
        debug!(uid = %request.uid, "Pod has no containers, nothing to patch");
        return response;
    }

    info!(
        uid = %request.uid,
        pod = ?pod.metadata.name,
        devices = %devices,
        patches = patches.len(),
        "Injecting CUDA_VISIBLE_DEVICES"
    );

    match response.with_patch(json_patch::Patch(patches)) {
        Ok(patched) => patched,
        Err(e) => {
            // Never reject: on a patch serialization failure the pod is
            // admitted unmodified and the scheduler-side logs carry the miss.
            error!(uid = %request.uid, error = %e, "Failed to serialize patch, allowing unchanged");
            AdmissionResponse::from(request)
        }
    }
}

/// Resolve the device set this pod should see, or `None` for a no-op.
///
/// Short-circuits in order: scheduler-name mismatch, missing annotation, no
/// concrete name (deferred to the scheduler, which resolves ordinals from
/// the eventually-assigned name), unparseable map, unresolvable ordinal,
/// ordinal absent from the map.
pub fn device_set_for_pod(pod: &Pod, scheduler_name: &str, policy: ParsePolicy) -> Option<String> {
    let declared = pod.spec.as_ref().and_then(|s| s.scheduler_name.as_deref());
    if declared != Some(scheduler_name) {
        debug!(scheduler = ?declared, "Pod uses a different scheduler");
        return None;
    }

    let raw = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(SCHEDULING_MAP_ANNOTATION))?;

    let name = pod.metadata.name.as_deref().unwrap_or("");
    let generate_name = pod.metadata.generate_name.as_deref().unwrap_or("");
    if name.is_empty() {
        warn!(
            generate_name = %generate_name,
            "Pod has no concrete name yet, deferring to the scheduler"
        );
        return None;
    }

    let map = parse_assignment_map(raw, policy);
    if map.is_empty() {
        warn!(pod = %name, "No valid entries in scheduling map");
        return None;
    }

    let Some(ordinal) = ordinal_from_generate_name(name, generate_name) else {
        warn!(pod = %name, "Could not determine replica ordinal");
        return None;
    };

    match map.get(&ordinal) {
        Some(assignment) => Some(assignment.device_set.clone()),
        None => {
            warn!(pod = %name, ordinal, "No GPU assignment for this ordinal");
            None
        }
    }
}

/// Build the JSON Patch that sets `CUDA_VISIBLE_DEVICES` in every container.
///
/// A container already declaring the variable gets a positional `replace`
/// against that exact array index; one without an env list gets an `add` of
/// a one-element list; otherwise the variable is appended with `env/-`.
pub fn build_env_patches(pod: &Pod, devices: &str) -> Vec<PatchOperation> {
    let mut ops = Vec::new();
    let Some(spec) = pod.spec.as_ref() else {
        return ops;
    };

    for (i, container) in spec.containers.iter().enumerate() {
        let idx = i.to_string();
        let env = container.env.as_deref().unwrap_or(&[]);

        if let Some(j) = env.iter().position(|e| e.name == CUDA_DEVICES_ENV) {
            let jdx = j.to_string();
            ops.push(PatchOperation::Replace(ReplaceOperation {
                path: PointerBuf::from_tokens([
                    "spec",
                    "containers",
                    idx.as_str(),
                    "env",
                    jdx.as_str(),
                    "value",
                ]),
                value: Value::String(devices.to_string()),
            }));
        } else if env.is_empty() {
            ops.push(PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens(["spec", "containers", idx.as_str(), "env"]),
                value: json!([{ "name": CUDA_DEVICES_ENV, "value": devices }]),
            }));
        } else {
            ops.push(PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens(["spec", "containers", idx.as_str(), "env", "-"]),
                value: json!({ "name": CUDA_DEVICES_ENV, "value": devices }),
            }));
        }
    }

    ops
}
