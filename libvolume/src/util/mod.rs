//! Helpers shared by the state tables and the operation generator.

pub mod block;
pub mod mount;

use std::collections::BTreeMap;

use crate::error::VolumeError;
use crate::plugin::VolumePlugin;
use crate::types::{
    NodeAffinity, NodeSelectorOperator, NodeSelectorRequirement, NodeSelectorTerm,
    UniquePodName, UniqueVolumeName, VolumeSpec,
};

/// `<plugin-name>/<volume-name>`.
pub fn unique_volume_name(plugin_name: &str, volume_name: &str) -> UniqueVolumeName {
    UniqueVolumeName(format!("{plugin_name}/{volume_name}"))
}

/// Unique name of an attachable volume, shared by every pod that uses it.
pub fn unique_volume_name_from_spec(
    plugin: &dyn VolumePlugin,
    spec: &VolumeSpec,
) -> Result<UniqueVolumeName, VolumeError> {
    let volume_name = plugin.volume_name(spec)?;
    Ok(unique_volume_name(plugin.name(), &volume_name))
}

/// Unique name of a non-attachable volume; scoped to the pod because nothing
/// is shared across pods.
pub fn unique_volume_name_for_non_attachable(
    pod_name: &UniquePodName,
    plugin: &dyn VolumePlugin,
    spec: &VolumeSpec,
) -> UniqueVolumeName {
    unique_volume_name(plugin.name(), &format!("{pod_name}-{}", spec.name))
}

/// Whether `labels` satisfy `affinity`. An affinity without terms matches
/// every node.
pub fn node_affinity_matches(affinity: &NodeAffinity, labels: &BTreeMap<String, String>) -> bool {
    affinity.required.is_empty()
        || affinity
            .required
            .iter()
            .any(|term| term_matches(term, labels))
}

fn term_matches(term: &NodeSelectorTerm, labels: &BTreeMap<String, String>) -> bool {
    // An empty term matches nothing.
    !term.match_expressions.is_empty()
        && term
            .match_expressions
            .iter()
            .all(|req| requirement_matches(req, labels))
}

fn requirement_matches(req: &NodeSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let value = labels.get(&req.key);
    match req.operator {
        NodeSelectorOperator::In => value.is_some_and(|v| req.values.contains(v)),
        NodeSelectorOperator::NotIn => value.is_none_or(|v| !req.values.contains(v)),
        NodeSelectorOperator::Exists => value.is_some(),
        NodeSelectorOperator::DoesNotExist => value.is_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    fn requirement(key: &str, operator: NodeSelectorOperator, values: &[&str]) -> NodeSelectorRequirement {
        NodeSelectorRequirement {
            key: key.to_owned(),
            operator,
            values: values.iter().map(|v| (*v).to_owned()).collect(),
        }
    }

    #[test]
    fn unique_names() {
        assert_eq!(
            unique_volume_name("fake", "disk-1"),
            UniqueVolumeName::from("fake/disk-1")
        );
    }

    #[test]
    fn empty_affinity_matches() {
        assert!(node_affinity_matches(&NodeAffinity::default(), &labels(&[])));
    }

    #[test]
    fn terms_are_ored_expressions_anded() {
        let affinity = NodeAffinity {
            required: vec![
                NodeSelectorTerm {
                    match_expressions: vec![
                        requirement("zone", NodeSelectorOperator::In, &["a"]),
                        requirement("disk", NodeSelectorOperator::Exists, &[]),
                    ],
                },
                NodeSelectorTerm {
                    match_expressions: vec![requirement(
                        "hostname",
                        NodeSelectorOperator::In,
                        &["node-9"],
                    )],
                },
            ],
        };

        assert!(node_affinity_matches(
            &affinity,
            &labels(&[("zone", "a"), ("disk", "ssd")])
        ));
        // First term fails on the missing `disk` label.
        assert!(!node_affinity_matches(&affinity, &labels(&[("zone", "a")])));
        assert!(node_affinity_matches(
            &affinity,
            &labels(&[("hostname", "node-9")])
        ));
    }

    #[test]
    fn negative_operators() {
        let affinity = NodeAffinity {
            required: vec![NodeSelectorTerm {
                match_expressions: vec![
                    requirement("zone", NodeSelectorOperator::NotIn, &["b"]),
                    requirement("cordoned", NodeSelectorOperator::DoesNotExist, &[]),
                ],
            }],
        };
        assert!(node_affinity_matches(&affinity, &labels(&[])));
        assert!(node_affinity_matches(&affinity, &labels(&[("zone", "a")])));
        assert!(!node_affinity_matches(&affinity, &labels(&[("zone", "b")])));
        assert!(!node_affinity_matches(
            &affinity,
            &labels(&[("cordoned", "true")])
        ));
    }
}
