//! Node to Instance correlation
//!
//! A Node and the Instance that produced it share a name. Node watch events
//! are mapped to the Instance through the controller's reflector store, so
//! Nodes that no Instance accounts for (control plane, manually added
//! machines) never enqueue work.

use k8s_openapi::api::core::v1::Node;
use kube::runtime::reflector::{ObjectRef, Store};

use fleet_common::crd::Instance;

/// Instance to re-evaluate when `node` changes or disappears
pub fn instance_for_node(store: &Store<Instance>, node: &Node) -> Option<ObjectRef<Instance>> {
    let name = node.metadata.name.as_deref()?;
    let key = ObjectRef::new(name);
    store.get(&key).map(|_| key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_common::crd::InstanceSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::runtime::reflector::store::Writer;
    use kube::runtime::watcher;

    fn named_node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn store_with(names: &[&str]) -> Store<Instance> {
        let mut writer: Writer<Instance> = Writer::default();
        for name in names {
            let instance = Instance::new(name, InstanceSpec::default());
            writer.apply_watcher_event(&watcher::Event::Apply(instance));
        }
        writer.as_reader()
    }

    #[test]
    fn node_maps_to_instance_of_same_name() {
        let store = store_with(&["pool-a-abcdefgh"]);
        let target = instance_for_node(&store, &named_node("pool-a-abcdefgh")).unwrap();
        assert_eq!(target.name, "pool-a-abcdefgh");
    }

    #[test]
    fn unrelated_node_maps_to_nothing() {
        let store = store_with(&["pool-a-abcdefgh"]);
        assert!(instance_for_node(&store, &named_node("cp-0")).is_none());
        assert!(instance_for_node(&store, &Node::default()).is_none());
    }
}
