//! Annotation parsing and replica-ordinal resolution
//!
//! The `gpu-scheduling-map` annotation maps replica ordinals to GPU
//! assignments, one line per replica:
//!
//! ```text
//! <ordinal>=<logicalNode>:<deviceList>
//! ```
//!
//! The device list is opaque to us; it is injected verbatim into
//! `CUDA_VISIBLE_DEVICES`. Maps are parsed fresh from the annotation on
//! every use and never cached across pods - an assignment only applies to a
//! pod whose resolved ordinal is a key in that pod's own map.

use std::collections::BTreeMap;

use tracing::warn;

/// A single replica's GPU placement, parsed from one annotation line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Assignment {
    /// Replica ordinal this assignment applies to
    pub ordinal: u32,
    /// User-chosen symbolic GPU-host name, resolved to a physical node later
    pub logical_node: String,
    /// Opaque device token list (e.g. "0,1"), injected verbatim
    pub device_set: String,
}

/// Ordinal -> assignment map for one pod, keyed for duplicate-line overwrite
pub type AssignmentMap = BTreeMap<u32, Assignment>;

/// How to treat a line whose ordinal fails to parse as an integer.
///
/// The per-line fold is the redesigned default: one corrupt line never
/// discards otherwise-valid entries. `AbortOnMalformed` reproduces the
/// source behavior where the first bad ordinal stops all remaining lines
/// (entries already parsed are kept).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ParsePolicy {
    /// Skip the malformed line and keep folding (default)
    #[default]
    SkipMalformed,
    /// Stop parsing at the first malformed ordinal
    AbortOnMalformed,
}

/// Parse the scheduling-map annotation into an [`AssignmentMap`].
///
/// Blank lines and lines missing `=` or `:` are skipped under both
/// policies. All tokens are trimmed. Duplicate ordinals: the later line
/// wins. Pure and idempotent: re-parsing the same text yields the same map.
pub fn parse_assignment_map(text: &str, policy: ParsePolicy) -> AssignmentMap {
    let mut map = AssignmentMap::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Some((ordinal_str, rest)) = line.split_once('=') else {
            continue;
        };
        let Some((logical_node, device_set)) = rest.split_once(':') else {
            continue;
        };

        let ordinal: u32 = match ordinal_str.trim().parse() {
            Ok(n) => n,
            Err(_) => {
                warn!(line = %line, "Skipping scheduling-map line with non-numeric ordinal");
                match policy {
                    ParsePolicy::SkipMalformed => continue,
                    ParsePolicy::AbortOnMalformed => break,
                }
            }
        };

        map.insert(
            ordinal,
            Assignment {
                ordinal,
                logical_node: logical_node.trim().to_string(),
                device_set: device_set.trim().to_string(),
            },
        );
    }

    map
}

/// Extract a replica ordinal from a concrete pod name.
///
/// Assumes the `<group>-<ordinal>` convention (StatefulSet-style names like
/// `my-app-0`). Purely syntactic: dash-less, empty, and non-numeric-suffix
/// names resolve to `None`.
pub fn ordinal_from_name(pod_name: &str) -> Option<u32> {
    let (_, suffix) = pod_name.rsplit_once('-')?;
    suffix.parse().ok()
}

/// Extract a replica ordinal from a pod name using its `generateName` prefix.
///
/// Controllers set `generateName` ending in a separator (`my-app-`); if the
/// name extends that prefix with `-<suffix>`, the suffix is the ordinal
/// candidate. Falls back to [`ordinal_from_name`] when the prefix does not
/// match or the suffix is not numeric.
pub fn ordinal_from_generate_name(pod_name: &str, generate_name: &str) -> Option<u32> {
    let prefix = generate_name.strip_suffix('-').unwrap_or(generate_name);
    if !prefix.is_empty() {
        if let Some(suffix) = pod_name.strip_prefix(prefix).and_then(|s| s.strip_prefix('-')) {
            if let Ok(ordinal) = suffix.parse() {
                return Some(ordinal);
            }
        }
    }

    ordinal_from_name(pod_name)
}
