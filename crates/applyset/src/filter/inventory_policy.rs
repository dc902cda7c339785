//! Skips applies that would steal an object from another inventory.

use kube::core::DynamicObject;

use crate::{
    annotations,
    filter::{Filter, FilterContext, FilterError},
    inventory::InventoryPolicy,
    object::ObjMetadata,
};

pub struct InventoryPolicyFilter {
    inventory_id: String,
    policy: InventoryPolicy,
}

impl InventoryPolicyFilter {
    pub fn new(inventory_id: impl Into<String>, policy: InventoryPolicy) -> Self {
        Self {
            inventory_id: inventory_id.into(),
            policy,
        }
    }
}

impl Filter for InventoryPolicyFilter {
    fn name(&self) -> &'static str {
        "inventory-policy"
    }

    fn filter(
        &self,
        _id: &ObjMetadata,
        _object: &DynamicObject,
        context: &FilterContext<'_>,
    ) -> Result<(), FilterError> {
        let Some(live) = context.live else {
            // Nothing to adopt or overwrite.
            return Ok(());
        };

        match annotations::owning_inventory(live) {
            Some(owner) if owner == self.inventory_id => Ok(()),
            Some(owner) => match self.policy {
                InventoryPolicy::AdoptAll => Ok(()),
                InventoryPolicy::MustMatch | InventoryPolicy::AdoptIfNoInventory => {
                    Err(FilterError::InventoryOverlap {
                        owner: owner.to_owned(),
                    })
                }
            },
            None => match self.policy {
                InventoryPolicy::AdoptIfNoInventory | InventoryPolicy::AdoptAll => Ok(()),
                InventoryPolicy::MustMatch => Err(FilterError::InventoryOverlap {
                    owner: String::new(),
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::filter::test_support::ContextFixture;

    fn pod(owner: Option<&str>) -> DynamicObject {
        let annotations = owner
            .map(|owner| {
                format!(
                    "
  annotations:
    config.k8s.io/owning-inventory: {owner}"
                )
            })
            .unwrap_or_default();
        serde_yaml::from_str(&format!(
            "
apiVersion: v1
kind: Pod
metadata:
  name: pod-a
  namespace: test{annotations}
"
        ))
        .unwrap()
    }

    fn id() -> ObjMetadata {
        ObjMetadata::namespaced("", "Pod", "test", "pod-a")
    }

    #[rstest]
    #[case(InventoryPolicy::MustMatch, None, false)]
    #[case(InventoryPolicy::MustMatch, Some("ours"), true)]
    #[case(InventoryPolicy::MustMatch, Some("theirs"), false)]
    #[case(InventoryPolicy::AdoptIfNoInventory, None, true)]
    #[case(InventoryPolicy::AdoptIfNoInventory, Some("theirs"), false)]
    #[case(InventoryPolicy::AdoptAll, Some("theirs"), true)]
    fn policy_matrix(
        #[case] policy: InventoryPolicy,
        #[case] owner: Option<&str>,
        #[case] allowed: bool,
    ) {
        let mut fixture = ContextFixture::default();
        fixture.live = Some(pod(owner));

        let filter = InventoryPolicyFilter::new("ours", policy);
        let verdict = filter.filter(&id(), &pod(None), &fixture.context());
        assert_eq!(verdict.is_ok(), allowed, "policy {policy}, owner {owner:?}");
    }

    #[test]
    fn absent_object_always_passes() {
        let fixture = ContextFixture::default();
        let filter = InventoryPolicyFilter::new("ours", InventoryPolicy::MustMatch);
        assert!(filter.filter(&id(), &pod(None), &fixture.context()).is_ok());
    }
}
