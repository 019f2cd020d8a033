//! Deterministic component addressing and the parent/child hierarchy.
//!
//! Identities live in an arena keyed by component id. Parent and child links
//! are stored as ids, never as owning references, and every link operation is
//! checked for cycles.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use tracing::{debug, info};

use crate::integrity;
use crate::{RlcError, RlcResult};

const ID_HASH_LEN: usize = 16;
const PATH_KEY_LEN: usize = 8;

/// What distinguishes one instance of a component type from another
#[derive(Debug, Clone, Copy)]
pub enum IdentityKey<'a> {
    /// An id chosen by the owner, e.g. a database key
    Supplied(&'a str),
    /// No id supplied: the initial props are hashed instead
    Props(&'a JsonValue),
}

impl IdentityKey<'_> {
    fn material(&self) -> String {
        match self {
            IdentityKey::Supplied(id) => format!("id:{}", id),
            IdentityKey::Props(props) => format!("props:{}", canonical_props(props)),
        }
    }

    fn display(&self) -> String {
        match self {
            IdentityKey::Supplied(id) => (*id).to_string(),
            IdentityKey::Props(_) => {
                let mut hash = blake3::hash(self.material().as_bytes()).to_hex().to_string();
                hash.truncate(PATH_KEY_LEN);
                hash
            }
        }
    }
}

fn canonical_props(props: &JsonValue) -> String {
    integrity::canonical_json(props)
}

/// Address and hierarchy position of a component instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentIdentity {
    pub component_id: String,
    pub component_type: String,
    pub parent_id: Option<String>,
    pub child_ids: BTreeSet<String>,
    pub depth: u32,
    /// Dotted path for hierarchy display, e.g. `Dashboard[main].Counter[a]`
    pub path: String,
}

/// Compute the deterministic component id
///
/// The id is a pure function of the component type, the identity key and the
/// parent id, so a reconnecting client arrives at the same id without having
/// to remember a server-issued value.
pub fn component_id_for(
    component_type: &str,
    key: IdentityKey<'_>,
    parent_id: Option<&str>,
) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(component_type.as_bytes());
    hasher.update(b"\0");
    hasher.update(key.material().as_bytes());
    hasher.update(b"\0");
    hasher.update(parent_id.unwrap_or("").as_bytes());

    let mut hash = hasher.finalize().to_hex().to_string();
    hash.truncate(ID_HASH_LEN);
    format!("{}-{}", component_type, hash)
}

/// Arena of component identities
#[derive(Debug, Default)]
pub struct IdentityManager {
    identities: HashMap<String, ComponentIdentity>,
}

impl IdentityManager {
    pub fn new() -> Self {
        Self {
            identities: HashMap::new(),
        }
    }

    /// Resolve the identity for `(component_type, key, parent_id)`, creating it if absent
    ///
    /// A new identity is linked into its parent's children. Nothing is created
    /// when the parent is unknown or when the link would form a cycle.
    pub fn resolve_or_create(
        &mut self,
        component_type: &str,
        key: IdentityKey<'_>,
        parent_id: Option<&str>,
    ) -> RlcResult<ComponentIdentity> {
        let component_id = component_id_for(component_type, key, parent_id);

        if let Some(existing) = self.identities.get(&component_id) {
            debug!("Resolved existing identity '{}'", component_id);
            return Ok(existing.clone());
        }

        let (depth, path) = match parent_id {
            Some(parent_id) => {
                let parent = self
                    .identities
                    .get(parent_id)
                    .ok_or_else(|| RlcError::ParentNotFound {
                        id: parent_id.to_string(),
                    })?;

                if self.is_ancestor_or_self(&component_id, parent_id) {
                    return Err(RlcError::CircularHierarchy {
                        component_id,
                        parent_id: parent_id.to_string(),
                    });
                }

                (
                    parent.depth + 1,
                    format!("{}.{}[{}]", parent.path, component_type, key.display()),
                )
            }
            None => (0, format!("{}[{}]", component_type, key.display())),
        };

        let identity = ComponentIdentity {
            component_id: component_id.clone(),
            component_type: component_type.to_string(),
            parent_id: parent_id.map(str::to_string),
            child_ids: BTreeSet::new(),
            depth,
            path,
        };

        if let Some(parent) = parent_id.and_then(|id| self.identities.get_mut(id)) {
            parent.child_ids.insert(component_id.clone());
        }
        self.identities.insert(component_id.clone(), identity.clone());

        info!(
            "Created identity '{}' at '{}' (depth {})",
            component_id, identity.path, identity.depth
        );
        Ok(identity)
    }

    /// Whether `candidate` is `start` or one of its ancestors
    fn is_ancestor_or_self(&self, candidate: &str, start: &str) -> bool {
        let mut seen = HashSet::new();
        let mut current = Some(start.to_string());

        while let Some(id) = current {
            if id == candidate || !seen.insert(id.clone()) {
                return true;
            }
            current = self
                .identities
                .get(&id)
                .and_then(|identity| identity.parent_id.clone());
        }

        false
    }

    /// Get an identity by id
    pub fn get(&self, component_id: &str) -> Option<&ComponentIdentity> {
        self.identities.get(component_id)
    }

    pub fn contains(&self, component_id: &str) -> bool {
        self.identities.contains_key(component_id)
    }

    /// Get the number of tracked identities
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Remove an identity and all of its descendants
    ///
    /// Returns the removed ids innermost-first, the order in which their
    /// instances must be torn down. An unknown id removes nothing.
    pub fn cleanup(&mut self, component_id: &str) -> Vec<String> {
        if !self.identities.contains_key(component_id) {
            debug!("Attempted to clean up unknown identity '{}'", component_id);
            return Vec::new();
        }

        let parent_id = self
            .identities
            .get(component_id)
            .and_then(|identity| identity.parent_id.clone());

        let mut removed = Vec::new();
        self.collect_post_order(component_id, &mut removed);

        for id in &removed {
            self.identities.remove(id);
        }

        if let Some(parent) = parent_id.and_then(|id| self.identities.get_mut(&id)) {
            parent.child_ids.remove(component_id);
        }

        info!(
            "Cleaned up identity '{}' with {} descendant(s)",
            component_id,
            removed.len().saturating_sub(1)
        );
        removed
    }

    fn collect_post_order(&self, component_id: &str, out: &mut Vec<String>) {
        // Explicit stack so deep hierarchies cannot overflow
        let mut stack = vec![(component_id.to_string(), false)];
        let mut visited = HashSet::new();

        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                out.push(id);
                continue;
            }
            if !visited.insert(id.clone()) {
                continue;
            }
            stack.push((id.clone(), true));
            if let Some(identity) = self.identities.get(&id) {
                for child in identity.child_ids.iter().rev() {
                    stack.push((child.clone(), false));
                }
            }
        }
    }

    /// Order `ids` root-to-leaf: every parent precedes its children
    pub fn initialization_order(&self, ids: &[String]) -> RlcResult<Vec<String>> {
        for id in ids {
            if !self.identities.contains_key(id) {
                return Err(RlcError::ComponentNotFound { id: id.clone() });
            }
        }

        topological_order(ids, |id| {
            self.identities
                .get(id)
                .and_then(|identity| identity.parent_id.clone())
        })
    }

    /// Order `ids` leaf-to-root: every child precedes its parent
    pub fn cleanup_order(&self, ids: &[String]) -> RlcResult<Vec<String>> {
        let mut order = self.initialization_order(ids)?;
        order.reverse();
        Ok(order)
    }
}

/// Kahn's algorithm over the parent relation restricted to `ids`
///
/// Ties keep the input order. Fails with `DependencyCycle` when the parent
/// relation over the set contains a cycle.
fn topological_order<F>(ids: &[String], parent_of: F) -> RlcResult<Vec<String>>
where
    F: Fn(&str) -> Option<String>,
{
    let mut nodes: Vec<String> = Vec::new();
    let mut members = HashSet::new();
    for id in ids {
        if members.insert(id.clone()) {
            nodes.push(id.clone());
        }
    }

    let mut pending_parent: HashMap<String, String> = HashMap::new();
    let mut children: HashMap<String, Vec<String>> = HashMap::new();
    for id in &nodes {
        if let Some(parent) = parent_of(id).filter(|parent| members.contains(parent)) {
            children.entry(parent.clone()).or_default().push(id.clone());
            pending_parent.insert(id.clone(), parent);
        }
    }

    let mut ready: VecDeque<String> = nodes
        .iter()
        .filter(|id| !pending_parent.contains_key(*id))
        .cloned()
        .collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(id) = ready.pop_front() {
        if let Some(kids) = children.get(&id) {
            for kid in kids {
                pending_parent.remove(kid);
                ready.push_back(kid.clone());
            }
        }
        order.push(id);
    }

    if order.len() != nodes.len() {
        let mut cycle: Vec<String> = pending_parent.into_keys().collect();
        cycle.sort();
        return Err(RlcError::DependencyCycle { ids: cycle });
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn position(order: &[String], id: &str) -> usize {
        order.iter().position(|x| x == id).unwrap()
    }

    #[test]
    fn test_deterministic_addressing() {
        let mut manager = IdentityManager::new();

        let a = manager
            .resolve_or_create("Counter", IdentityKey::Supplied("a"), None)
            .unwrap();
        let again = manager
            .resolve_or_create("Counter", IdentityKey::Supplied("a"), None)
            .unwrap();
        let b = manager
            .resolve_or_create("Counter", IdentityKey::Supplied("b"), None)
            .unwrap();

        assert_eq!(a.component_id, again.component_id);
        assert_ne!(a.component_id, b.component_id);
        assert!(a.component_id.starts_with("Counter-"));
        assert_eq!(manager.len(), 2);

        // Survives a destroy/recreate cycle
        manager.cleanup(&a.component_id);
        let recreated = manager
            .resolve_or_create("Counter", IdentityKey::Supplied("a"), None)
            .unwrap();
        assert_eq!(recreated.component_id, a.component_id);
    }

    #[test]
    fn test_props_key_ignores_field_order() {
        let first = component_id_for("Chart", IdentityKey::Props(&json!({ "x": 1, "y": 2 })), None);
        let second = component_id_for("Chart", IdentityKey::Props(&json!({ "y": 2, "x": 1 })), None);
        let other = component_id_for("Chart", IdentityKey::Props(&json!({ "x": 2 })), None);
        let nested = component_id_for(
            "Chart",
            IdentityKey::Props(&json!({ "x": 1, "y": 2, "_z": { "b": 1, "a": 0 } })),
            None,
        );
        let nested_reordered = component_id_for(
            "Chart",
            IdentityKey::Props(&json!({ "_z": { "a": 0, "b": 1 }, "y": 2, "x": 1 })),
            None,
        );

        assert_eq!(first, second);
        assert_ne!(first, other);
        // Underscore-prefixed props are part of the address too
        assert_ne!(first, nested);
        assert_eq!(nested, nested_reordered);
    }

    #[test]
    fn test_parent_is_part_of_the_address() {
        let mut manager = IdentityManager::new();
        let p1 = manager
            .resolve_or_create("Panel", IdentityKey::Supplied("1"), None)
            .unwrap();
        let p2 = manager
            .resolve_or_create("Panel", IdentityKey::Supplied("2"), None)
            .unwrap();

        let c1 = manager
            .resolve_or_create("Counter", IdentityKey::Supplied("a"), Some(&p1.component_id))
            .unwrap();
        let c2 = manager
            .resolve_or_create("Counter", IdentityKey::Supplied("a"), Some(&p2.component_id))
            .unwrap();

        assert_ne!(c1.component_id, c2.component_id);
        assert_eq!(c1.depth, 1);
        assert_eq!(c1.path, "Panel[1].Counter[a]");
        assert!(manager
            .get(&p1.component_id)
            .unwrap()
            .child_ids
            .contains(&c1.component_id));
    }

    #[test]
    fn test_unknown_parent_creates_nothing() {
        let mut manager = IdentityManager::new();
        let err = manager
            .resolve_or_create("Counter", IdentityKey::Supplied("a"), Some("missing"))
            .unwrap_err();

        assert!(matches!(err, RlcError::ParentNotFound { .. }));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_circular_hierarchy_rejected() {
        let mut manager = IdentityManager::new();
        let root = manager
            .resolve_or_create("Panel", IdentityKey::Supplied("root"), None)
            .unwrap();
        let child_id = component_id_for("Counter", IdentityKey::Supplied("c"), Some(&root.component_id));

        // Corrupt the arena so the id about to be created is already the root's parent
        if let Some(root_identity) = manager.identities.get_mut(&root.component_id) {
            root_identity.parent_id = Some(child_id.clone());
        }

        let err = manager
            .resolve_or_create("Counter", IdentityKey::Supplied("c"), Some(&root.component_id))
            .unwrap_err();
        assert!(matches!(err, RlcError::CircularHierarchy { .. }));
        assert!(!manager.contains(&child_id));
    }

    #[test]
    fn test_cleanup_is_innermost_first() {
        let mut manager = IdentityManager::new();
        let root = manager
            .resolve_or_create("App", IdentityKey::Supplied("main"), None)
            .unwrap();
        let panel = manager
            .resolve_or_create("Panel", IdentityKey::Supplied("p"), Some(&root.component_id))
            .unwrap();
        let leaf = manager
            .resolve_or_create("Counter", IdentityKey::Supplied("c"), Some(&panel.component_id))
            .unwrap();
        let sibling = manager
            .resolve_or_create("Toggle", IdentityKey::Supplied("t"), Some(&root.component_id))
            .unwrap();

        let removed = manager.cleanup(&panel.component_id);
        assert_eq!(removed, vec![leaf.component_id.clone(), panel.component_id.clone()]);
        assert!(!manager
            .get(&root.component_id)
            .unwrap()
            .child_ids
            .contains(&panel.component_id));
        assert!(manager.contains(&sibling.component_id));

        let removed = manager.cleanup(&root.component_id);
        assert_eq!(removed.last(), Some(&root.component_id));
        assert!(manager.is_empty());

        assert!(manager.cleanup("unknown").is_empty());
    }

    #[test]
    fn test_initialization_and_cleanup_order() {
        let mut manager = IdentityManager::new();
        let root = manager
            .resolve_or_create("App", IdentityKey::Supplied("main"), None)
            .unwrap()
            .component_id;
        let panel = manager
            .resolve_or_create("Panel", IdentityKey::Supplied("p"), Some(&root))
            .unwrap()
            .component_id;
        let leaf = manager
            .resolve_or_create("Counter", IdentityKey::Supplied("c"), Some(&panel))
            .unwrap()
            .component_id;

        let ids = vec![leaf.clone(), root.clone(), panel.clone()];

        let init = manager.initialization_order(&ids).unwrap();
        assert!(position(&init, &root) < position(&init, &panel));
        assert!(position(&init, &panel) < position(&init, &leaf));

        let cleanup = manager.cleanup_order(&ids).unwrap();
        assert_eq!(cleanup, vec![leaf.clone(), panel.clone(), root.clone()]);

        // A subset without the middle node leaves the others unconstrained
        let subset = manager.initialization_order(&[leaf.clone(), root.clone()]).unwrap();
        assert_eq!(subset, vec![leaf, root]);

        let err = manager.initialization_order(&["missing".to_string()]).unwrap_err();
        assert!(matches!(err, RlcError::ComponentNotFound { .. }));
    }

    #[test]
    fn test_topological_order_detects_cycles() {
        let parents: HashMap<&str, &str> = [("a", "b"), ("b", "c"), ("c", "a"), ("d", "a")]
            .into_iter()
            .collect();
        let ids: Vec<String> = ["a", "b", "c", "d", "e"].iter().map(|s| s.to_string()).collect();

        let err = topological_order(&ids, |id| parents.get(id).map(|p| p.to_string())).unwrap_err();
        match err {
            RlcError::DependencyCycle { ids } => {
                assert_eq!(ids, vec!["a", "b", "c", "d"]);
            }
            other => panic!("Expected DependencyCycle, got: {:?}", other),
        }
    }
}
