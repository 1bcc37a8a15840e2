//! Joins services with their endpoints into load balancer routing models.
//!
//! Resolution only reads from the caches. The same cache contents always
//! produce the same output, and both output lists are sorted by rule name so
//! that a configurator can compare results without spurious reordering.

use crate::{
    annotations::{self, Algorithm},
    cache::Cache,
};
use k8s_openapi::{
    api::core::v1::{EndpointSubset, Endpoints, Service, ServicePort},
    apimachinery::pkg::util::intstr::IntOrString,
};
use kube::ResourceExt;
use std::collections::HashSet;

/// The service type whose load balancer is provisioned by the platform.
const NATIVE_LOAD_BALANCER: &str = "LoadBalancer";

/// A load-balanced frontend port and the backend addresses it routes to.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRoute {
    /// Identifies the rule as `<namespace>_<service>_<port>`.
    pub name: String,
    /// Backend addresses formatted as `ip:port`.
    pub endpoints: Vec<String>,
    pub frontend_port: i32,
    pub backend_port: i32,
    pub algorithm: Algorithm,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct Resolved {
    pub tcp: Vec<ServiceRoute>,
    pub udp: Vec<ServiceRoute>,
}

/// Resolves the routes for the service stored under `key`.
///
/// Nothing is returned for services that do not exist, are of the platform's
/// native load balancer type, are not opted in, fall outside of `scope`, or
/// have no ready endpoints.
pub fn resolve_service(
    services: &impl Cache<Service>,
    endpoints: &impl Cache<Endpoints>,
    scope: Option<&str>,
    key: &str,
) -> Resolved {
    let Some(svc) = services.get_by_key(key) else {
        return Resolved::default();
    };
    if !is_candidate(&svc, scope) {
        return Resolved::default();
    }
    let (Some(ns), Some(ports)) = (
        svc.namespace(),
        svc.spec.as_ref().and_then(|spec| spec.ports.as_ref()),
    ) else {
        return Resolved::default();
    };
    let name = svc.name_any();

    // The endpoints object always shares its service's name and namespace.
    let Some(eps) = endpoints.get_by_key(key) else {
        tracing::debug!(%ns, service = %name, "no endpoints");
        return Resolved::default();
    };
    let subsets = eps.subsets.as_deref().unwrap_or_default();

    let host = annotations::host(&svc);
    let algorithm = annotations::algorithm(&svc);

    let mut resolved = Resolved::default();
    for port in ports {
        let Some((backend_port, addrs)) = port_endpoints(port, subsets) else {
            tracing::debug!(%ns, service = %name, port = port.port, "no endpoints for port");
            continue;
        };

        let route = ServiceRoute {
            name: rule_name(&ns, &name, port.port),
            endpoints: addrs,
            frontend_port: port.port,
            backend_port,
            algorithm,
            host: host.clone(),
        };
        tracing::trace!(?route, "resolved");
        if protocol(port.protocol.as_deref()) == "UDP" {
            resolved.udp.push(route);
        } else {
            resolved.tcp.push(route);
        }
    }

    resolved.sort();
    resolved
}

/// Resolves the routes for every cached service.
pub fn resolve_all(
    services: &impl Cache<Service>,
    endpoints: &impl Cache<Endpoints>,
    scope: Option<&str>,
) -> Resolved {
    let mut resolved = Resolved::default();
    for svc in services.list() {
        let r = resolve_service(services, endpoints, scope, &crate::cache::key_of(&*svc));
        resolved.tcp.extend(r.tcp);
        resolved.udp.extend(r.udp);
    }
    resolved.sort();
    resolved
}

/// Indicates whether a service should be managed by this controller,
/// regardless of its endpoints.
pub fn is_candidate(svc: &Service, scope: Option<&str>) -> bool {
    let type_ = svc.spec.as_ref().and_then(|spec| spec.type_.as_deref());
    if type_ == Some(NATIVE_LOAD_BALANCER) {
        tracing::trace!(service = %svc.name_any(), "skipping native load balancer service");
        return false;
    }

    if !annotations::is_eligible(svc) {
        tracing::trace!(service = %svc.name_any(), "skipping service without lbex class");
        return false;
    }

    match scope {
        Some(only) if only != svc.name_any() => {
            tracing::trace!(service = %svc.name_any(), "skipping service out of scope");
            false
        }
        _ => true,
    }
}

/// Names the rule for a service port. `_` cannot appear in a namespace or
/// service name, so names are unique per port.
pub fn rule_name(ns: &str, service: &str, port: i32) -> String {
    format!("{ns}_{service}_{port}")
}

/// Collects the union of ready addresses across every subset exposing the
/// service port's target, with the resolved backend port.
///
/// Numeric targets match endpoint ports by number; named targets match by
/// name only. Either way the endpoint port must carry the service port's
/// protocol. Addresses keep first-seen order and appear once.
fn port_endpoints(port: &ServicePort, subsets: &[EndpointSubset]) -> Option<(i32, Vec<String>)> {
    let target = port
        .target_port
        .clone()
        .unwrap_or(IntOrString::Int(port.port));
    let want = protocol(port.protocol.as_deref());

    let mut backend_port = None;
    let mut seen = HashSet::new();
    let mut addrs = Vec::new();
    for subset in subsets {
        for ep_port in subset.ports.iter().flatten() {
            let matched = match target {
                IntOrString::Int(n) => ep_port.port == n,
                IntOrString::String(ref name) => ep_port.name.as_deref() == Some(name.as_str()),
            };
            if !matched || protocol(ep_port.protocol.as_deref()) != want {
                continue;
            }

            backend_port.get_or_insert(ep_port.port);
            for addr in subset.addresses.iter().flatten() {
                let addr = format!("{}:{}", addr.ip, ep_port.port);
                if seen.insert(addr.clone()) {
                    addrs.push(addr);
                }
            }
        }
    }

    if addrs.is_empty() {
        return None;
    }
    Some((backend_port?, addrs))
}

/// Kubernetes defaults unset port protocols to TCP.
fn protocol(protocol: Option<&str>) -> &str {
    protocol.unwrap_or("TCP")
}

// === impl Resolved ===

impl Resolved {
    pub fn is_empty(&self) -> bool {
        self.tcp.is_empty() && self.udp.is_empty()
    }

    fn sort(&mut self) {
        self.tcp.sort_by(|a, b| a.name.cmp(&b.name));
        self.udp.sort_by(|a, b| a.name.cmp(&b.name));
    }
}
