//! The boundary between reconciliation and the external load balancer.

use crate::{node::NodeInfo, resolve::ServiceRoute};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Applies resolved state to a load balancer.
///
/// Implementations are shared by every sync handler and must tolerate
/// concurrent calls. Calls are fire-and-forget: the controller does not wait
/// for the load balancer to reload.
pub trait Configurator: Send + Sync + 'static {
    /// Records a node, returning the keys of services whose configuration
    /// depends on it.
    fn add_or_update_node(&self, node: NodeInfo) -> Vec<String>;

    /// Forgets a node, returning the keys of services whose configuration
    /// depended on it.
    fn delete_node(&self, name: &str) -> Vec<String>;

    fn add_or_update_service(&self, id: &str, spec: ServiceSpec);

    fn delete_configuration(&self, id: &str, class: ConfigClass);
}

/// The desired load balancer configuration for a single service.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct ServiceSpec {
    /// The service's `namespace/name` key.
    pub key: String,
    pub tcp: Vec<ServiceRoute>,
    pub udp: Vec<ServiceRoute>,
    /// Set for `NodePort` services, whose backends are reached through node addresses.
    pub node_port: bool,
}

/// The kind of load balancer configuration being removed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ConfigClass {
    /// Layer-4 stream (TCP and UDP) proxying.
    Stream,
}

/// Holds the desired load balancer configuration in memory.
///
/// Every effective change is logged; updates that would not change anything
/// are dropped so that a downstream writer only sees real changes.
#[derive(Debug, Default)]
pub struct MemoryConfigurator {
    state: RwLock<State>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct State {
    pub nodes: BTreeMap<String, NodeInfo>,
    /// Service configurations by identifier.
    pub services: BTreeMap<String, ServiceSpec>,
}

/// Returns the configuration identifier for a service key.
///
/// Namespaces and names are DNS labels, which never contain `_`, so distinct
/// keys always map to distinct identifiers.
pub fn config_id(key: &str) -> String {
    key.replace('/', "_")
}

// === impl MemoryConfigurator ===

impl MemoryConfigurator {
    pub fn snapshot(&self) -> State {
        self.state.read().clone()
    }

    fn node_dependents(state: &State) -> Vec<String> {
        state
            .services
            .values()
            .filter(|spec| spec.node_port)
            .map(|spec| spec.key.clone())
            .collect()
    }
}

impl Configurator for MemoryConfigurator {
    fn add_or_update_node(&self, node: NodeInfo) -> Vec<String> {
        let mut state = self.state.write();
        if state.nodes.get(&node.name) == Some(&node) {
            tracing::trace!(node = %node.name, "node unchanged");
            return Vec::new();
        }

        tracing::info!(
            node = %node.name,
            active = node.active,
            internal_ip = ?node.internal_ip,
            external_ip = ?node.external_ip,
            "node updated"
        );
        state.nodes.insert(node.name.clone(), node);
        Self::node_dependents(&state)
    }

    fn delete_node(&self, name: &str) -> Vec<String> {
        let mut state = self.state.write();
        if state.nodes.remove(name).is_none() {
            tracing::trace!(node = %name, "node already removed");
            return Vec::new();
        }

        tracing::info!(node = %name, "node removed");
        Self::node_dependents(&state)
    }

    fn add_or_update_service(&self, id: &str, spec: ServiceSpec) {
        let mut state = self.state.write();
        if state.services.get(id) == Some(&spec) {
            tracing::trace!(%id, "configuration unchanged");
            return;
        }

        tracing::info!(
            %id,
            tcp = spec.tcp.len(),
            udp = spec.udp.len(),
            "configuration updated"
        );
        tracing::debug!(?spec);
        state.services.insert(id.to_string(), spec);
    }

    fn delete_configuration(&self, id: &str, class: ConfigClass) {
        if self.state.write().services.remove(id).is_some() {
            tracing::info!(%id, ?class, "configuration removed");
        }
    }
}
