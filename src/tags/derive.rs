//! Tag derivation for changed nodes.

use std::collections::{HashMap, HashSet, VecDeque};

use super::{ChangedNode, TAG_EVERYTHING, TagSet};

/// Declared supertype relation between node types.
///
/// Mirrors a CMS node type schema: each type may declare any number of
/// direct supertypes, and type-level invalidation must reach every type a
/// changed node is an instance of.
#[derive(Debug, Clone, Default)]
pub struct NodeTypeRegistry {
    supertypes: HashMap<String, Vec<String>>,
}

impl NodeTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `name` with its direct supertypes, replacing any previous
    /// declaration of the same type.
    pub fn declare<I, S>(&mut self, name: &str, supertypes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.supertypes.insert(
            name.to_string(),
            supertypes.into_iter().map(Into::into).collect(),
        );
    }

    /// The type itself plus every transitively declared supertype, each
    /// exactly once, in breadth-first declaration order. A visited set keeps
    /// diamonds and declaration cycles from looping.
    pub fn supertype_closure(&self, name: &str) -> Vec<String> {
        let mut closure = Vec::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([name.to_string()]);

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(declared) = self.supertypes.get(&current) {
                queue.extend(declared.iter().cloned());
            }
            closure.push(current);
        }

        closure
    }
}

/// Derives the full invalidation tag set for one changed node.
///
/// The set contains the catch-all tag, one type tag per member of the
/// node type's supertype closure, the node's own identity tag and one
/// descendant tag per known ancestor, each repeated per workspace prefix.
/// Pure and deterministic: the same descriptor always yields the same set.
pub fn derive_tags(node: &ChangedNode, registry: &NodeTypeRegistry) -> TagSet {
    let mut tags = TagSet::new();
    tags.insert(TAG_EVERYTHING.to_string());

    let closure = registry.supertype_closure(&node.node_type);
    for prefix in node.workspace.prefixes() {
        for type_name in &closure {
            tags.insert(format!("NodeType_{prefix}{type_name}"));
        }
        tags.insert(format!("Node_{prefix}{}", node.identifier));
        for ancestor in &node.ancestors {
            tags.insert(format!("DescendantOf_{prefix}{ancestor}"));
        }
    }

    tags
}

#[cfg(test)]
mod tests {
    use crate::tags::WorkspaceScope;

    use super::*;

    fn page_registry() -> NodeTypeRegistry {
        let mut registry = NodeTypeRegistry::new();
        registry.declare("Acme.Site:Page", ["Neos.Neos:Document"]);
        registry.declare("Neos.Neos:Document", ["Neos.Neos:Node"]);
        registry
    }

    fn page_node() -> ChangedNode {
        ChangedNode {
            identifier: "af6f1b15".to_string(),
            node_type: "Acme.Site:Page".to_string(),
            ancestors: vec!["9fd9b188".to_string(), "35d4cbc7".to_string()],
            workspace: WorkspaceScope::Live,
        }
    }

    #[test]
    fn live_node_yields_identity_type_and_descendant_tags() {
        let tags = derive_tags(&page_node(), &page_registry());

        let expected: TagSet = [
            "Everything",
            "NodeType_Acme.Site:Page",
            "NodeType_Neos.Neos:Document",
            "NodeType_Neos.Neos:Node",
            "Node_af6f1b15",
            "DescendantOf_9fd9b188",
            "DescendantOf_35d4cbc7",
        ]
        .into_iter()
        .map(str::to_string)
        .collect();
        assert_eq!(tags, expected);
    }

    #[test]
    fn derivation_is_deterministic() {
        let node = page_node();
        let registry = page_registry();

        assert_eq!(derive_tags(&node, &registry), derive_tags(&node, &registry));
    }

    #[test]
    fn diamond_supertypes_are_counted_once() {
        let mut registry = NodeTypeRegistry::new();
        registry.declare("A", ["B", "C"]);
        registry.declare("B", ["D"]);
        registry.declare("C", ["D"]);

        assert_eq!(registry.supertype_closure("A"), vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn supertype_cycles_terminate() {
        let mut registry = NodeTypeRegistry::new();
        registry.declare("A", ["B"]);
        registry.declare("B", ["A"]);

        assert_eq!(registry.supertype_closure("A"), vec!["A", "B"]);
    }

    #[test]
    fn undeclared_type_still_tags_itself() {
        let registry = NodeTypeRegistry::new();
        let mut node = page_node();
        node.node_type = "Acme.Site:Mystery".to_string();
        node.ancestors.clear();

        let tags = derive_tags(&node, &registry);
        assert!(tags.contains("NodeType_Acme.Site:Mystery"));
        assert!(tags.contains("Node_af6f1b15"));
        assert!(!tags.iter().any(|tag| tag.starts_with("DescendantOf_")));
    }

    #[test]
    fn workspace_scope_prefixes_every_tag() {
        let mut node = page_node();
        node.workspace = WorkspaceScope::Workspace("user-jane".to_string());

        let tags = derive_tags(&node, &page_registry());
        assert!(tags.contains("Node_user-jane_af6f1b15"));
        assert!(tags.contains("NodeType_user-jane_Acme.Site:Page"));
        assert!(tags.contains("DescendantOf_user-jane_9fd9b188"));
        assert!(!tags.contains("Node_af6f1b15"));
    }

    #[test]
    fn workspace_chain_emits_one_tag_per_member() {
        let mut node = page_node();
        node.workspace =
            WorkspaceScope::Chain(vec!["user-jane".to_string(), "review".to_string()]);

        let tags = derive_tags(&node, &page_registry());
        assert!(tags.contains("Node_user-jane_af6f1b15"));
        assert!(tags.contains("Node_review_af6f1b15"));
        assert!(tags.contains("Everything"));
    }

    #[test]
    fn empty_chain_degrades_to_live_tags() {
        let mut node = page_node();
        node.workspace = WorkspaceScope::Chain(Vec::new());

        let tags = derive_tags(&node, &page_registry());
        assert!(tags.contains("Node_af6f1b15"));
    }
}
