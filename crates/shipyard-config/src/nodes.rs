// Helper functions for extracting values from KDL nodes

use kdl::KdlNode;
use std::collections::BTreeMap;

pub(crate) fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

/// Values of a property that may be repeated (`needs="a" needs="b"`) or
/// given as a child node (`needs "a" "b"`).
pub(crate) fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    let repeated: Vec<String> = node
        .entries()
        .iter()
        .filter(|e| e.name().is_some_and(|n| n.value() == name))
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect();

    if !repeated.is_empty() {
        return repeated;
    }

    node.children()
        .and_then(|children| children.nodes().iter().find(|c| c.name().value() == name))
        .map(get_all_string_args)
        .unwrap_or_default()
}

/// Key/value pairs from the children of an `env { KEY "value" }` block.
pub(crate) fn get_env_block(node: &KdlNode) -> BTreeMap<String, String> {
    node.children()
        .map(|children| {
            children
                .nodes()
                .iter()
                .filter_map(|child| {
                    get_first_string_arg(child).map(|val| (child.name().value().to_string(), val))
                })
                .collect()
        })
        .unwrap_or_default()
}
