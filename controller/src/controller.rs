use crate::{
    cache::{parse_key, Cache},
    configurator::{config_id, ConfigClass, Configurator, ServiceSpec},
    informer::Informer,
    node::NodeInfo,
    queue::Queue,
    resolve,
};
use anyhow::Result;
use futures::prelude::*;
use k8s_openapi::api::core::v1::{Endpoints, Node, Service};
use kube::runtime::{reflector::Store, watcher::Event};
use std::sync::Arc;
use tokio::{task::JoinSet, time};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Reconciles nodes, services, and endpoints into load balancer configuration.
pub struct Controller<C> {
    inner: Arc<Inner<C>>,
}

struct Inner<C> {
    nodes: Store<Node>,
    nodes_queue: Queue,
    services: Store<Service>,
    services_queue: Queue,
    endpoints: Store<Endpoints>,
    endpoints_queue: Queue,
    configurator: C,
    /// When set, only the service with this name is managed.
    scope: Option<String>,
}

/// The informers that feed a [`Controller`]'s caches.
pub struct Informers {
    pub nodes: Informer<Node>,
    pub services: Informer<Service>,
    pub endpoints: Informer<Endpoints>,
}

/// Watch event streams for each resource kind.
pub struct Watches<N, S, E> {
    pub nodes: N,
    pub services: S,
    pub endpoints: E,
}

#[derive(Copy, Clone, Debug)]
pub struct RunParams {
    /// Delay between starting the node and endpoints informers and starting the
    /// service informer, so that services are first reconciled against
    /// populated caches.
    pub settle: time::Duration,
    pub workers: usize,
    /// How often idle queue workers poll for work.
    pub drain_period: time::Duration,
}

// === impl RunParams ===

impl Default for RunParams {
    fn default() -> Self {
        Self {
            settle: time::Duration::from_secs(5),
            workers: 1,
            drain_period: time::Duration::from_secs(1),
        }
    }
}

// === impl Controller ===

impl<C> Clone for Controller<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Configurator> Controller<C> {
    pub fn new(
        configurator: C,
        scope: Option<String>,
        resync: time::Duration,
    ) -> (Self, Informers) {
        let informers = Informers {
            nodes: Informer::new(Queue::new("nodes"), resync),
            services: Informer::new(Queue::new("services"), resync),
            endpoints: Informer::new(Queue::new("endpoints"), resync),
        };
        let inner = Inner {
            nodes: informers.nodes.store(),
            nodes_queue: informers.nodes.queue().clone(),
            services: informers.services.store(),
            services_queue: informers.services.queue().clone(),
            endpoints: informers.endpoints.store(),
            endpoints_queue: informers.endpoints.queue().clone(),
            configurator,
            scope,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            informers,
        )
    }

    pub fn configurator(&self) -> &C {
        &self.inner.configurator
    }

    /// Runs all informers and queues until `shutdown` fires and every
    /// in-flight sync has completed.
    pub async fn run<N, S, E>(
        self,
        informers: Informers,
        watches: Watches<N, S, E>,
        params: RunParams,
        shutdown: CancellationToken,
    ) where
        N: Stream<Item = Event<Node>> + Send + 'static,
        S: Stream<Item = Event<Service>> + Send + 'static,
        E: Stream<Item = Event<Endpoints>> + Send + 'static,
    {
        let Informers {
            nodes,
            services,
            endpoints,
        } = informers;
        let RunParams {
            settle,
            workers,
            drain_period,
        } = params;
        let mut tasks = JoinSet::new();

        tasks.spawn(
            nodes
                .run(watches.nodes, shutdown.clone())
                .instrument(tracing::info_span!("nodes")),
        );
        tasks.spawn(
            self.inner
                .nodes_queue
                .clone()
                .run(
                    workers,
                    drain_period,
                    {
                        let ctrl = self.clone();
                        move |key| future::ready(ctrl.sync_nodes(&key))
                    },
                    shutdown.clone(),
                )
                .instrument(tracing::info_span!("nodes")),
        );
        tasks.spawn(
            endpoints
                .run(watches.endpoints, shutdown.clone())
                .instrument(tracing::info_span!("endpoints")),
        );
        tasks.spawn(
            self.inner
                .endpoints_queue
                .clone()
                .run(
                    workers,
                    drain_period,
                    {
                        let ctrl = self.clone();
                        move |key| future::ready(ctrl.sync_endpoints(&key))
                    },
                    shutdown.clone(),
                )
                .instrument(tracing::info_span!("endpoints")),
        );

        tracing::debug!(?settle, "waiting for node and endpoint caches to settle");
        tokio::select! {
            _ = time::sleep(settle) => {}
            _ = shutdown.cancelled() => {}
        }

        tasks.spawn(
            services
                .run(watches.services, shutdown.clone())
                .instrument(tracing::info_span!("services")),
        );
        tasks.spawn(
            self.inner
                .services_queue
                .clone()
                .run(
                    workers,
                    drain_period,
                    {
                        let ctrl = self.clone();
                        move |key| future::ready(ctrl.sync_services(&key))
                    },
                    shutdown.clone(),
                )
                .instrument(tracing::info_span!("services")),
        );
        tracing::info!("controller started");

        while let Some(res) = tasks.join_next().await {
            if let Err(error) = res {
                tracing::error!(%error, "controller task failed");
            }
        }
        tracing::info!("controller stopped");
    }

    /// Applies the node stored under `key` to the configurator and enqueues every
    /// service that depends on it.
    #[tracing::instrument(skip(self))]
    pub fn sync_nodes(&self, key: &str) -> Result<()> {
        if self.inner.nodes_queue.is_shutting_down() {
            return Ok(());
        }
        parse_key(key)?;

        let affected = match self.inner.nodes.get_by_key(key) {
            None => {
                tracing::debug!("deleting node");
                self.inner.configurator.delete_node(key)
            }
            Some(node) => match NodeInfo::from_node(&node) {
                Ok(info) => {
                    tracing::debug!(active = info.active, "updating node");
                    self.inner.configurator.add_or_update_node(info)
                }
                Err(error) => {
                    // Retrying cannot fix an invalid object; a later update will.
                    tracing::warn!(%error, "ignoring invalid node");
                    return Ok(());
                }
            },
        };

        if !affected.is_empty() {
            tracing::debug!(services = ?affected, "queueing affected services");
        }
        for svc in affected {
            self.inner.services_queue.enqueue(svc);
        }
        Ok(())
    }

    /// Resolves the service stored under `key` and applies (or removes) its load
    /// balancer configuration.
    #[tracing::instrument(skip(self))]
    pub fn sync_services(&self, key: &str) -> Result<()> {
        if self.inner.services_queue.is_shutting_down() {
            return Ok(());
        }
        parse_key(key)?;
        let id = config_id(key);

        let Some(svc) = self.inner.services.get_by_key(key) else {
            tracing::debug!("deleting service");
            self.inner
                .configurator
                .delete_configuration(&id, ConfigClass::Stream);
            return Ok(());
        };
        if let Err(error) = validate_service(&svc) {
            tracing::warn!(%error, "ignoring invalid service");
            return Ok(());
        }

        let resolve::Resolved { tcp, udp } = self.resolve(key);
        if tcp.is_empty() && udp.is_empty() {
            // Not (or no longer) managed; drop anything left from before.
            tracing::trace!("not an lbex-managed service");
            self.inner
                .configurator
                .delete_configuration(&id, ConfigClass::Stream);
            return Ok(());
        }

        let node_port = svc.spec.as_ref().and_then(|s| s.type_.as_deref()) == Some("NodePort");
        tracing::debug!(tcp = tcp.len(), udp = udp.len(), "updating service");
        self.inner.configurator.add_or_update_service(
            &id,
            ServiceSpec {
                key: key.to_string(),
                tcp,
                udp,
                node_port,
            },
        );
        Ok(())
    }

    /// Enqueues the owning service of the endpoints stored under `key` when its
    /// configuration may need to change.
    #[tracing::instrument(skip(self))]
    pub fn sync_endpoints(&self, key: &str) -> Result<()> {
        if self.inner.endpoints_queue.is_shutting_down() {
            return Ok(());
        }
        parse_key(key)?;

        if self.inner.endpoints.get_by_key(key).is_none() {
            // The service's addresses are gone; let the service sync drop them.
            tracing::debug!("endpoints removed");
            self.inner.services_queue.enqueue(key);
            return Ok(());
        }

        let resolved = self.resolve(key);
        if !resolved.is_empty() {
            tracing::debug!(
                tcp = resolved.tcp.len(),
                udp = resolved.udp.len(),
                "endpoints changed for managed service"
            );
            self.inner.services_queue.enqueue(key);
            return Ok(());
        }

        // A managed service may have just lost its last ready address.
        let managed = self
            .inner
            .services
            .get_by_key(key)
            .map(|svc| resolve::is_candidate(&svc, self.inner.scope.as_deref()))
            .unwrap_or(false);
        if managed {
            tracing::debug!("managed service has no ready endpoints");
            self.inner.services_queue.enqueue(key);
        } else {
            tracing::trace!("not an lbex-managed service endpoint");
        }
        Ok(())
    }

    fn resolve(&self, key: &str) -> resolve::Resolved {
        resolve::resolve_service(
            &self.inner.services,
            &self.inner.endpoints,
            self.inner.scope.as_deref(),
            key,
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvalidService {
    #[error("service has no namespace")]
    MissingNamespace,

    #[error("service has no spec")]
    MissingSpec,
}

fn validate_service(svc: &Service) -> Result<(), InvalidService> {
    if svc.metadata.namespace.as_deref().unwrap_or_default().is_empty() {
        return Err(InvalidService::MissingNamespace);
    }
    if svc.spec.is_none() {
        return Err(InvalidService::MissingSpec);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        annotations::{CLASS, CLASS_LBEX},
        configurator::MemoryConfigurator,
    };
    use k8s_openapi::{
        api::core::v1::{
            EndpointAddress, EndpointPort, EndpointSubset, NodeAddress, NodeStatus, ServicePort,
            ServiceSpec as K8sServiceSpec,
        },
        apimachinery::pkg::{apis::meta::v1::ObjectMeta, util::intstr::IntOrString},
    };
    use maplit::btreemap;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    const RESYNC: time::Duration = time::Duration::from_secs(30);

    fn mk_service(ns: &str, name: &str, type_: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                annotations: Some(btreemap! { CLASS.to_string() => CLASS_LBEX.to_string() }),
                ..Default::default()
            },
            spec: Some(K8sServiceSpec {
                type_: Some(type_.to_string()),
                ports: Some(vec![ServicePort {
                    port: 80,
                    target_port: Some(IntOrString::Int(8080)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn mk_endpoints(ns: &str, name: &str, ips: &[&str]) -> Endpoints {
        Endpoints {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            subsets: Some(vec![EndpointSubset {
                addresses: Some(
                    ips.iter()
                        .map(|ip| EndpointAddress {
                            ip: ip.to_string(),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ports: Some(vec![EndpointPort {
                    port: 8080,
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
        }
    }

    fn mk_node(name: &str, ip: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                addresses: Some(vec![NodeAddress {
                    type_: "InternalIP".to_string(),
                    address: ip.to_string(),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Records calls and reports fixed node dependents.
    #[derive(Default)]
    struct Recorder {
        dependents: Vec<String>,
        calls: Mutex<Vec<String>>,
    }

    impl Configurator for Recorder {
        fn add_or_update_node(&self, node: NodeInfo) -> Vec<String> {
            self.calls.lock().push(format!("add-node {}", node.name));
            self.dependents.clone()
        }

        fn delete_node(&self, name: &str) -> Vec<String> {
            self.calls.lock().push(format!("delete-node {name}"));
            self.dependents.clone()
        }

        fn add_or_update_service(&self, id: &str, _: ServiceSpec) {
            self.calls.lock().push(format!("add-service {id}"));
        }

        fn delete_configuration(&self, id: &str, _: ConfigClass) {
            self.calls.lock().push(format!("delete-service {id}"));
        }
    }

    #[test]
    fn node_deletion_cascades_to_services() {
        let recorder = Recorder {
            dependents: vec!["ns/svc-a".to_string(), "ns/svc-c".to_string()],
            ..Default::default()
        };
        let (ctrl, mut informers) = Controller::new(recorder, None, RESYNC);
        informers.nodes.apply(Event::Applied(mk_node("node-0", "10.0.0.1")));
        informers.nodes.apply(Event::Deleted(mk_node("node-0", "10.0.0.1")));

        ctrl.sync_nodes("node-0").unwrap();
        assert_eq!(*ctrl.configurator().calls.lock(), ["delete-node node-0"]);
        let queue = informers.services.queue();
        assert_eq!(queue.len(), 2);
        assert!(queue.contains("ns/svc-a"));
        assert!(queue.contains("ns/svc-c"));
    }

    #[test]
    fn node_updates_cascade_through_memory_configurator() {
        let (ctrl, mut informers) = Controller::new(MemoryConfigurator::default(), None, RESYNC);
        for (svc, type_) in [("svc-a", "NodePort"), ("svc-b", "ClusterIP"), ("svc-c", "NodePort")] {
            informers.services.apply(Event::Applied(mk_service("ns", svc, type_)));
            informers
                .endpoints
                .apply(Event::Applied(mk_endpoints("ns", svc, &["10.1.0.1"])));
            ctrl.sync_services(&format!("ns/{svc}")).unwrap();
        }
        assert_eq!(ctrl.configurator().snapshot().services.len(), 3);
        let services = informers.services.queue();
        services.drain();

        informers.nodes.apply(Event::Applied(mk_node("node-0", "10.0.0.1")));
        ctrl.sync_nodes("node-0").unwrap();
        assert_eq!(services.drain(), ["ns/svc-a", "ns/svc-c"]);

        // Removing the node from the cache cascades the same way.
        informers.nodes.apply(Event::Deleted(mk_node("node-0", "10.0.0.1")));
        ctrl.sync_nodes("node-0").unwrap();
        assert_eq!(services.drain(), ["ns/svc-a", "ns/svc-c"]);
    }

    #[test]
    fn invalid_nodes_are_dropped_without_error() {
        let (ctrl, mut informers) = Controller::new(Recorder::default(), None, RESYNC);
        let mut node = mk_node("node-0", "10.0.0.1");
        node.status = None;
        informers.nodes.apply(Event::Applied(node));

        ctrl.sync_nodes("node-0").unwrap();
        assert!(ctrl.configurator().calls.lock().is_empty());
    }

    #[test]
    fn malformed_keys_are_errors() {
        let (ctrl, _informers) = Controller::new(Recorder::default(), None, RESYNC);
        assert!(ctrl.sync_nodes("a/b/c").is_err());
        assert!(ctrl.sync_services("a/b/c").is_err());
        assert!(ctrl.sync_endpoints("/").is_err());
    }

    #[test]
    fn services_are_configured_and_removed() {
        let (ctrl, mut informers) = Controller::new(MemoryConfigurator::default(), None, RESYNC);
        informers
            .services
            .apply(Event::Applied(mk_service("ns-0", "web", "ClusterIP")));
        informers
            .endpoints
            .apply(Event::Applied(mk_endpoints("ns-0", "web", &["10.1.0.1", "10.1.0.2"])));

        ctrl.sync_services("ns-0/web").unwrap();
        let state = ctrl.configurator().snapshot();
        let spec = &state.services["ns-0_web"];
        assert_eq!(spec.key, "ns-0/web");
        assert!(!spec.node_port);
        assert_eq!(spec.tcp[0].name, "ns-0_web_80");
        assert_eq!(spec.tcp[0].endpoints, ["10.1.0.1:8080", "10.1.0.2:8080"]);

        // Replaying the same key with the same cache contents changes nothing.
        ctrl.sync_services("ns-0/web").unwrap();
        assert_eq!(ctrl.configurator().snapshot(), state);

        informers
            .services
            .apply(Event::Deleted(mk_service("ns-0", "web", "ClusterIP")));
        ctrl.sync_services("ns-0/web").unwrap();
        assert!(ctrl.configurator().snapshot().services.is_empty());
    }

    #[test]
    fn unmanaged_services_are_not_configured() {
        let (ctrl, mut informers) = Controller::new(Recorder::default(), None, RESYNC);
        let mut svc = mk_service("ns-0", "web", "ClusterIP");
        svc.metadata.annotations = None;
        informers.services.apply(Event::Applied(svc));
        informers
            .endpoints
            .apply(Event::Applied(mk_endpoints("ns-0", "web", &["10.1.0.1"])));

        ctrl.sync_services("ns-0/web").unwrap();
        assert_eq!(*ctrl.configurator().calls.lock(), ["delete-service ns-0_web"]);
    }

    #[test]
    fn invalid_services_are_dropped_without_error() {
        let (ctrl, mut informers) = Controller::new(Recorder::default(), None, RESYNC);
        let mut svc = mk_service("ns-0", "web", "ClusterIP");
        svc.spec = None;
        informers.services.apply(Event::Applied(svc));

        ctrl.sync_services("ns-0/web").unwrap();
        assert!(ctrl.configurator().calls.lock().is_empty());
    }

    #[test]
    fn scoped_controller_ignores_other_services() {
        let (ctrl, mut informers) =
            Controller::new(MemoryConfigurator::default(), Some("svc-a".to_string()), RESYNC);
        for svc in ["svc-a", "svc-b"] {
            informers
                .services
                .apply(Event::Applied(mk_service("ns-0", svc, "ClusterIP")));
            informers
                .endpoints
                .apply(Event::Applied(mk_endpoints("ns-0", svc, &["10.1.0.1"])));
            ctrl.sync_services(&format!("ns-0/{svc}")).unwrap();
        }

        let ids = ctrl
            .configurator()
            .snapshot()
            .services
            .into_keys()
            .collect::<Vec<_>>();
        assert_eq!(ids, ["ns-0_svc-a"]);
    }

    #[test]
    fn endpoint_changes_requeue_managed_services() {
        let (ctrl, mut informers) = Controller::new(MemoryConfigurator::default(), None, RESYNC);
        informers
            .services
            .apply(Event::Applied(mk_service("ns-0", "web", "ClusterIP")));
        let mut plain = mk_service("ns-0", "plain", "ClusterIP");
        plain.metadata.annotations = None;
        informers.services.apply(Event::Applied(plain));
        let services = informers.services.queue();
        services.drain();

        informers
            .endpoints
            .apply(Event::Applied(mk_endpoints("ns-0", "web", &["10.1.0.1"])));
        informers
            .endpoints
            .apply(Event::Applied(mk_endpoints("ns-0", "plain", &["10.1.0.9"])));
        ctrl.sync_endpoints("ns-0/web").unwrap();
        ctrl.sync_endpoints("ns-0/plain").unwrap();
        assert_eq!(services.drain(), ["ns-0/web"]);

        // Losing every ready address still requeues the managed service.
        ctrl.sync_services("ns-0/web").unwrap();
        assert!(ctrl.configurator().snapshot().services.contains_key("ns-0_web"));
        informers
            .endpoints
            .apply(Event::Applied(mk_endpoints("ns-0", "web", &[])));
        ctrl.sync_endpoints("ns-0/web").unwrap();
        assert_eq!(services.drain(), ["ns-0/web"]);

        // Once the service sync runs, the stale configuration is removed.
        ctrl.sync_services("ns-0/web").unwrap();
        assert!(ctrl.configurator().snapshot().services.is_empty());
    }

    #[test]
    fn endpoint_deletion_requeues_the_service() {
        let (ctrl, mut informers) = Controller::new(Recorder::default(), None, RESYNC);
        informers
            .endpoints
            .apply(Event::Applied(mk_endpoints("ns-0", "web", &["10.1.0.1"])));
        informers
            .endpoints
            .apply(Event::Deleted(mk_endpoints("ns-0", "web", &["10.1.0.1"])));

        ctrl.sync_endpoints("ns-0/web").unwrap();
        assert!(informers.services.queue().contains("ns-0/web"));
    }

    #[tokio::test(start_paused = true)]
    async fn runs_until_shutdown() {
        let (ctrl, informers) = Controller::new(MemoryConfigurator::default(), None, RESYNC);
        let (nodes_tx, nodes_rx) = mpsc::unbounded_channel();
        let (services_tx, services_rx) = mpsc::unbounded_channel();
        let (endpoints_tx, endpoints_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(ctrl.clone().run(
            informers,
            Watches {
                nodes: UnboundedReceiverStream::new(nodes_rx),
                services: UnboundedReceiverStream::new(services_rx),
                endpoints: UnboundedReceiverStream::new(endpoints_rx),
            },
            RunParams::default(),
            shutdown.clone(),
        ));

        nodes_tx
            .send(Event::Restarted(vec![mk_node("node-0", "10.0.0.1")]))
            .unwrap();
        endpoints_tx
            .send(Event::Restarted(vec![mk_endpoints("ns-0", "web", &["10.1.0.1"])]))
            .unwrap();
        services_tx
            .send(Event::Restarted(vec![mk_service("ns-0", "web", "NodePort")]))
            .unwrap();

        // Services are only reconciled once the settle delay has elapsed.
        time::sleep(time::Duration::from_secs(1)).await;
        let state = ctrl.configurator().snapshot();
        assert!(state.nodes.contains_key("node-0"));
        assert!(state.services.is_empty());

        time::sleep(time::Duration::from_secs(10)).await;
        let state = ctrl.configurator().snapshot();
        assert_eq!(
            state.services["ns-0_web"].tcp[0].endpoints,
            ["10.1.0.1:8080"]
        );

        // Endpoint changes flow through to the service configuration.
        endpoints_tx
            .send(Event::Applied(mk_endpoints("ns-0", "web", &["10.1.0.2"])))
            .unwrap();
        time::sleep(time::Duration::from_secs(5)).await;
        assert_eq!(
            ctrl.configurator().snapshot().services["ns-0_web"].tcp[0].endpoints,
            ["10.1.0.2:8080"]
        );

        shutdown.cancel();
        task.await.unwrap();
    }
}
