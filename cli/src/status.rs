use crate::table::{Column, Table};
use anyhow::Result;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::{
    api::ListParams,
    runtime::{reflector, watcher},
    Api, Client,
};
use lbex_controller::{resolve, Resolved, ServiceRoute};
use serde::Serialize;

/// A resolved route, tagged with its protocol for display.
#[derive(Serialize)]
pub struct RouteStatus<'a> {
    protocol: &'static str,
    #[serde(flatten)]
    route: &'a ServiceRoute,
}

/// Lists services and endpoints and resolves them exactly as the controller
/// would.
pub async fn status(
    client: Client,
    namespace: Option<&str>,
    service: Option<&str>,
) -> Result<Resolved> {
    let (services, endpoints) = match namespace {
        Some(ns) => (
            Api::<Service>::namespaced(client.clone(), ns),
            Api::<Endpoints>::namespaced(client, ns),
        ),
        None => (Api::<Service>::all(client.clone()), Api::<Endpoints>::all(client)),
    };
    let params = ListParams::default();

    let (services_store, mut writer) = reflector::store();
    writer.apply_watcher_event(&watcher::Event::Restarted(
        services.list(&params).await?.items,
    ));
    let (endpoints_store, mut writer) = reflector::store();
    writer.apply_watcher_event(&watcher::Event::Restarted(
        endpoints.list(&params).await?.items,
    ));

    Ok(resolve::resolve_all(
        &services_store,
        &endpoints_store,
        service,
    ))
}

fn routes(resolved: &Resolved) -> Vec<RouteStatus<'_>> {
    let tcp = resolved.tcp.iter().map(|route| RouteStatus {
        protocol: "TCP",
        route,
    });
    let udp = resolved.udp.iter().map(|route| RouteStatus {
        protocol: "UDP",
        route,
    });
    tcp.chain(udp).collect()
}

pub fn print_status(resolved: &Resolved) {
    let routes = routes(resolved);
    let table = Table {
        cols: vec![
            Column::new("NAME", Box::new(|r: &RouteStatus<'_>| r.route.name.clone())),
            Column::new("PROTOCOL", Box::new(|r: &RouteStatus<'_>| r.protocol.to_string())),
            Column::new(
                "FRONTEND",
                Box::new(|r: &RouteStatus<'_>| r.route.frontend_port.to_string()),
            ),
            Column::new(
                "BACKEND",
                Box::new(|r: &RouteStatus<'_>| r.route.backend_port.to_string()),
            ),
            Column::new(
                "ALGORITHM",
                Box::new(|r: &RouteStatus<'_>| r.route.algorithm.to_string()),
            ),
            Column::new(
                "HOST",
                Box::new(|r: &RouteStatus<'_>| r.route.host.clone().unwrap_or_else(|| "-".into())),
            ),
            Column::new(
                "ENDPOINTS",
                Box::new(|r: &RouteStatus<'_>| r.route.endpoints.join(",")),
            ),
        ],
        data: &routes,
    };
    print!("{table}");
}

pub fn json_print_status(resolved: &Resolved) -> Result<()> {
    serde_json::to_writer_pretty(std::io::stdout(), &routes(resolved))?;
    println!();
    Ok(())
}
