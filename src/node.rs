//! Logical-to-physical node name resolution
//!
//! Logical GPU node names (the `nodeN` tokens in scheduling maps) are mapped
//! to real Kubernetes node names through the `gpu-node-name` node label.
//! Every resolution performs a full live node listing - no cache, so the
//! mapping always reflects current cluster state at the cost of an O(nodes)
//! scan per call. Node topology changes are rare relative to call volume.

use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::{debug, info, warn};

use crate::{Result, GPU_NODE_LABEL};

/// Pick the physical node whose `gpu-node-name` label equals `logical_node`.
///
/// When several nodes carry the same label value, the one with the
/// lexicographically smallest name wins, making the tie-break deterministic
/// regardless of listing order.
pub fn select_physical_node(nodes: &[Node], logical_node: &str) -> Option<String> {
    nodes
        .iter()
        .filter(|node| {
            node.metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(GPU_NODE_LABEL))
                .is_some_and(|value| value == logical_node)
        })
        .filter_map(|node| node.metadata.name.clone())
        .min()
}

/// Resolve a logical node name to the physical node that carries its label.
///
/// Lists all nodes on every call. Returns `Ok(None)` when no node matches;
/// the caller decides whether that is a warning or a hard failure.
pub async fn resolve_physical_node(client: &Client, logical_node: &str) -> Result<Option<String>> {
    debug!(logical_node = %logical_node, "Looking up physical node for logical node");

    let nodes: Api<Node> = Api::all(client.clone());
    let list = nodes.list(&ListParams::default()).await?;

    match select_physical_node(&list.items, logical_node) {
        Some(physical) => {
            info!(
                logical_node = %logical_node,
                physical_node = %physical,
                "Resolved logical node"
            );
            Ok(Some(physical))
        }
        None => {
            warn!(
                logical_node = %logical_node,
                nodes = list.items.len(),
                "No node carries a matching gpu-node-name label"
            );
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn labeled_node(name: &str, gpu_node_name: Option<&str>) -> Node {
        let labels = gpu_node_name.map(|value| {
            BTreeMap::from([(GPU_NODE_LABEL.to_string(), value.to_string())])
        });
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn selects_matching_node() {
        let nodes = vec![
            labeled_node("worker-1", Some("node2")),
            labeled_node("worker-7", Some("node1")),
            labeled_node("worker-9", None),
        ];
        assert_eq!(
            select_physical_node(&nodes, "node1"),
            Some("worker-7".to_string())
        );
    }

    #[test]
    fn no_match_yields_none() {
        let nodes = vec![
            labeled_node("worker-1", Some("node2")),
            labeled_node("worker-2", None),
        ];
        assert_eq!(select_physical_node(&nodes, "node9"), None);
        assert_eq!(select_physical_node(&[], "node1"), None);
    }

    #[test]
    fn tie_break_is_deterministic_by_physical_name() {
        // Listing order must not matter: smallest physical name wins.
        let forward = vec![
            labeled_node("worker-b", Some("node1")),
            labeled_node("worker-a", Some("node1")),
        ];
        let reverse = vec![
            labeled_node("worker-a", Some("node1")),
            labeled_node("worker-b", Some("node1")),
        ];
        assert_eq!(
            select_physical_node(&forward, "node1"),
            Some("worker-a".to_string())
        );
        assert_eq!(
            select_physical_node(&reverse, "node1"),
            Some("worker-a".to_string())
        );
    }

    #[test]
    fn label_value_must_match_exactly() {
        let nodes = vec![labeled_node("worker-1", Some("node10"))];
        assert_eq!(select_physical_node(&nodes, "node1"), None);
    }
}
