//! Accessors over KDL nodes.
//!
//! Settings are written as child nodes with positional arguments
//! (`window-days 30`), so most lookups find a child by name and read its
//! first argument.

use anyhow::Result;
use kdl::{KdlNode, KdlValue};

/// Positional (unnamed) arguments of a node
pub fn positional_args(node: &KdlNode) -> impl Iterator<Item = &KdlValue> {
    node.entries()
        .iter()
        .filter(|entry| entry.name().is_none())
        .map(|entry| entry.value())
}

/// First positional argument as a string
pub fn get_first_arg_string(node: &KdlNode) -> Option<String> {
    positional_args(node)
        .next()
        .and_then(|value| value.as_string())
        .map(str::to_string)
}

/// All positional arguments as strings; fails on non-string arguments
pub fn get_string_args(node: &KdlNode) -> Result<Vec<String>> {
    positional_args(node)
        .map(|value| {
            value.as_string().map(str::to_string).ok_or_else(|| {
                anyhow::anyhow!(
                    "'{}' expects string arguments, got {}",
                    node.name().value(),
                    value
                )
            })
        })
        .collect()
}

/// Find a direct child node by name
pub fn find_child<'a>(node: &'a KdlNode, name: &str) -> Option<&'a KdlNode> {
    node.children()?
        .nodes()
        .iter()
        .find(|child| child.name().value() == name)
}

/// String value of the child node `name`
pub fn get_string_entry(node: &KdlNode, name: &str) -> Option<String> {
    find_child(node, name).and_then(get_first_arg_string)
}

/// Integer value of the child node `name`
pub fn get_int_entry(node: &KdlNode, name: &str) -> Option<i128> {
    find_child(node, name)
        .and_then(|child| positional_args(child).next())
        .and_then(|value| value.as_integer())
}

/// Non-negative integer value of the child node `name`, range-checked
/// against the target type
pub fn get_uint_entry<T>(node: &KdlNode, name: &str) -> Result<Option<T>>
where
    T: TryFrom<i128>,
{
    match get_int_entry(node, name) {
        Some(value) => T::try_from(value).map(Some).map_err(|_| {
            anyhow::anyhow!(
                "'{}' in '{}' is out of range: {}",
                name,
                node.name().value(),
                value
            )
        }),
        None => Ok(None),
    }
}

/// Boolean value of the child node `name`
pub fn get_bool_entry(node: &KdlNode, name: &str) -> Option<bool> {
    find_child(node, name)
        .and_then(|child| positional_args(child).next())
        .and_then(|value| value.as_bool())
}

/// Reject child nodes that are not in `known`
pub fn ensure_known_children(node: &KdlNode, known: &[&str]) -> Result<()> {
    let Some(children) = node.children() else {
        return Ok(());
    };

    for child in children.nodes() {
        let name = child.name().value();
        if !known.contains(&name) {
            return Err(anyhow::anyhow!(
                "Unknown setting '{}' in '{}' block. Valid settings: {}",
                name,
                node.name().value(),
                known.join(", ")
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kdl::KdlDocument;

    fn first_node(src: &str) -> KdlNode {
        let doc: KdlDocument = src.parse().unwrap();
        doc.nodes()[0].clone()
    }

    #[test]
    fn test_entry_lookups() {
        let node = first_node(
            r#"renewal {
                window-days 14
                name "weekly"
                enabled #true
            }"#,
        );

        assert_eq!(get_int_entry(&node, "window-days"), Some(14));
        assert_eq!(get_string_entry(&node, "name"), Some("weekly".to_string()));
        assert_eq!(get_bool_entry(&node, "enabled"), Some(true));
        assert_eq!(get_int_entry(&node, "missing"), None);
    }

    #[test]
    fn test_uint_entry_range_checked() {
        let node = first_node("renewal { concurrency -1 }");
        assert!(get_uint_entry::<usize>(&node, "concurrency").is_err());

        let node = first_node("renewal { concurrency 8 }");
        assert_eq!(get_uint_entry::<usize>(&node, "concurrency").unwrap(), Some(8));
    }

    #[test]
    fn test_string_args() {
        let node = first_node(r#"command "systemctl" "reload" "nginx""#);
        assert_eq!(
            get_string_args(&node).unwrap(),
            vec!["systemctl", "reload", "nginx"]
        );

        let node = first_node(r#"command "sleep" 5"#);
        assert!(get_string_args(&node).is_err());
    }

    #[test]
    fn test_unknown_children_rejected() {
        let node = first_node("renewal { window-days 30\n bogus 1 }");
        let err = ensure_known_children(&node, &["window-days"]).unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }
}
