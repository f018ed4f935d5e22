//! Naming conventions shared by every sync component.
//!
//! All derived names (sync group prefixes, item names, storage keys, blob
//! names) come from one [`Namespace`] so that every participant agrees on
//! them.

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::name::{Component, Name};

/// Keywords and derivation rules for names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    /// Marks sync traffic under an application prefix.
    pub sync_keyword: Component,
    /// Names the at-least-once group under the sync keyword.
    pub at_least_once_keyword: Component,
    /// Names the latest-only group under the sync keyword.
    pub latest_only_keyword: Component,
    /// Leads local-only storage keys.
    pub local_keyword: Component,
    /// Trails persisted state vector keys.
    pub sync_vector_keyword: Component,
    /// Leads generated blob names under the application prefix.
    pub blob_component: Component,
}

impl Default for Namespace {
    fn default() -> Self {
        Self {
            sync_keyword: Component::keyword("sync"),
            at_least_once_keyword: Component::keyword("alo"),
            latest_only_keyword: Component::keyword("late"),
            local_keyword: Component::keyword("local"),
            sync_vector_keyword: Component::keyword("syncVector"),
            blob_component: Component::generic("blob"),
        }
    }
}

impl Namespace {
    /// The application prefix: the node id without its last component.
    pub fn app_prefix_from_node_id(&self, node_id: &Name) -> Name {
        node_id.drop_last(1)
    }

    /// `<app>/32=sync/32=alo`.
    pub fn at_least_once_prefix(&self, app_prefix: &Name) -> Name {
        app_prefix
            .append(self.sync_keyword.clone())
            .append(self.at_least_once_keyword.clone())
    }

    /// `<app>/32=sync/32=late`.
    pub fn latest_only_prefix(&self, app_prefix: &Name) -> Name {
        app_prefix
            .append(self.sync_keyword.clone())
            .append(self.latest_only_keyword.clone())
    }

    /// Key under which latest-only items are kept: the name without its
    /// final (sequence) component.
    pub fn latest_only_key(&self, item_name: &Name) -> String {
        item_name.drop_last(1).to_string()
    }

    /// Prefix under which a node publishes into a sync group.
    ///
    /// The node id followed by the sync prefix with the application prefix
    /// stripped. If the sync prefix does not start with the application
    /// prefix, the whole sync prefix is appended.
    pub fn base_name(&self, node_id: &Name, sync_prefix: &Name) -> Name {
        let app_prefix = self.app_prefix_from_node_id(node_id);
        let tail = if app_prefix.is_prefix_of(sync_prefix) {
            sync_prefix.suffix_from(app_prefix.len())
        } else {
            sync_prefix.clone()
        };
        node_id.join(&tail)
    }

    /// `<base>/seq=<n>`.
    pub fn sequence_name(&self, base_name: &Name, seq: u64) -> Name {
        base_name.append(Component::sequence(seq))
    }

    /// Storage key of the persisted state vector for a delivery.
    pub fn sync_state_key(&self, base_name: &Name) -> String {
        Name::new()
            .append(self.local_keyword.clone())
            .join(base_name)
            .append(self.sync_vector_keyword.clone())
            .to_string()
    }

    /// A fresh, random blob name under the application prefix.
    pub fn gen_blob_name(&self, app_prefix: &Name) -> Name {
        let mut id = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut id);
        app_prefix
            .append(self.blob_component.clone())
            .append(Component::generic(&hex::encode(id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(s: &str) -> Name {
        Name::parse(s).unwrap()
    }

    #[test]
    fn test_group_prefixes() {
        let ns = Namespace::default();
        let app = ns.app_prefix_from_node_id(&n("/app/alice"));
        assert_eq!(app, n("/app"));
        assert_eq!(ns.at_least_once_prefix(&app), n("/app/32=sync/32=alo"));
        assert_eq!(ns.latest_only_prefix(&app), n("/app/32=sync/32=late"));
    }

    #[test]
    fn test_base_name() {
        let ns = Namespace::default();
        assert_eq!(
            ns.base_name(&n("/app/alice"), &n("/app/32=sync/32=alo")),
            n("/app/alice/32=sync/32=alo")
        );
        assert_eq!(
            ns.base_name(&n("/app/alice"), &n("/other/group")),
            n("/app/alice/other/group")
        );
    }

    #[test]
    fn test_storage_keys() {
        let ns = Namespace::default();
        let base = n("/app/alice/32=sync/32=alo");
        assert_eq!(
            ns.sync_state_key(&base),
            "/32=local/app/alice/32=sync/32=alo/32=syncVector"
        );
        assert_eq!(
            ns.latest_only_key(&ns.sequence_name(&base, 9)),
            "/app/alice/32=sync/32=alo"
        );
    }

    #[test]
    fn test_blob_names_are_unique() {
        let ns = Namespace::default();
        let a = ns.gen_blob_name(&n("/app"));
        let b = ns.gen_blob_name(&n("/app"));
        assert_ne!(a, b);
        assert_eq!(a.len(), 3);
        assert!(n("/app/blob").is_prefix_of(&a));
    }
}
