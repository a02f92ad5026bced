//! Pod-to-node binding submission
//!
//! Placement decisions are handed to Kubernetes through the pod `binding`
//! subresource, the privileged primitive that assigns an unscheduled pod to
//! a node. Dispatch is attempted at most once per observed event; duplicate
//! binds are rejected by the API server, not deduplicated here. Failures are
//! logged and surfaced to the caller - retry, if any, rides on the watch
//! stream re-emitting the pod.

use k8s_openapi::api::core::v1::{Binding, ObjectReference, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use tracing::info;

use crate::Result;

/// A resolved placement decision, consumed immediately by [`dispatch_binding`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindingIntent {
    /// Name of the pod to place
    pub pod_name: String,
    /// Namespace of the pod
    pub namespace: String,
    /// Physical node the pod is bound to
    pub target_node: String,
    /// Device set the pod's containers will see (logging only; injection is
    /// the webhook's job)
    pub device_set: String,
}

/// Build the Binding object submitted to the binding subresource
pub fn binding_for(intent: &BindingIntent) -> Binding {
    Binding {
        metadata: ObjectMeta {
            name: Some(intent.pod_name.clone()),
            namespace: Some(intent.namespace.clone()),
            ..Default::default()
        },
        target: ObjectReference {
            api_version: Some("v1".to_string()),
            kind: Some("Node".to_string()),
            name: Some(intent.target_node.clone()),
            ..Default::default()
        },
    }
}

/// Submit a placement decision to the API server.
pub async fn dispatch_binding(client: &Client, intent: &BindingIntent) -> Result<()> {
    let binding = binding_for(intent);
    let data = serde_json::to_vec(&binding)?;

    let pods: Api<Pod> = Api::namespaced(client.clone(), &intent.namespace);
    // The apiserver answers a successful binding POST with a Status body,
    // not the Binding that was submitted.
    let _: Status = pods
        .create_subresource("binding", &intent.pod_name, &PostParams::default(), data)
        .await?;

    info!(
        pod = %intent.pod_name,
        namespace = %intent.namespace,
        node = %intent.target_node,
        devices = %intent.device_set,
        "Bound pod to node"
    );
    Ok(())
}
