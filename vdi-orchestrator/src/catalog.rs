//! Bundle catalog views.

use serde::Serialize;
use std::collections::BTreeMap;

use vdi_provider::Bundle;

#[derive(Debug, Clone, Serialize)]
pub struct GroupedCatalog {
    pub groups: BTreeMap<String, Vec<Bundle>>,
}

/// Group bundles by compute type, each group sorted by name.
pub fn group_by_compute_type(bundles: Vec<Bundle>) -> GroupedCatalog {
    let mut groups: BTreeMap<String, Vec<Bundle>> = BTreeMap::new();
    for bundle in bundles {
        groups
            .entry(bundle.compute_type.clone())
            .or_default()
            .push(bundle);
    }
    for group in groups.values_mut() {
        group.sort_by(|a, b| a.name.cmp(&b.name));
    }
    GroupedCatalog { groups }
}

/// Whether a bundle id appears in the provider's catalog. Used for soft
/// validation: an unknown id is warned about, not rejected, since catalogs
/// lag behind newly published bundles.
pub fn bundle_known(bundles: &[Bundle], bundle_id: &str) -> bool {
    bundles.iter().any(|b| b.bundle_id == bundle_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdi_core::CloudProvider;

    fn bundle(id: &str, name: &str, compute: &str) -> Bundle {
        Bundle {
            bundle_id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            compute_type: compute.to_string(),
            user_storage_gb: Some(100),
            root_storage_gb: Some(80),
            owner: "AMAZON".to_string(),
            provider: CloudProvider::Aws,
        }
    }

    #[test]
    fn groups_by_compute_type_and_sorts_by_name() {
        let catalog = group_by_compute_type(vec![
            bundle("b-3", "Zeta", "STANDARD"),
            bundle("b-1", "Alpha", "STANDARD"),
            bundle("b-2", "Mid", "POWER"),
        ]);
        assert_eq!(catalog.groups.len(), 2);
        let standard = &catalog.groups["STANDARD"];
        assert_eq!(standard[0].name, "Alpha");
        assert_eq!(standard[1].name, "Zeta");
    }

    #[test]
    fn unknown_bundle_is_reported() {
        let bundles = vec![bundle("b-1", "Alpha", "STANDARD")];
        assert!(bundle_known(&bundles, "b-1"));
        assert!(!bundle_known(&bundles, "b-404"));
    }
}
