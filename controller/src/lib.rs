//! An external load balancer controller.
//!
//! The controller watches the cluster's nodes, services, and endpoints and keeps
//! a load balancer configured to route each opted-in service port to the ready
//! addresses behind it:
//!
//! ```text
//! [ Node ] ------------------------\
//! [ Service ] -> [ ServiceRoute ] --> [ Configurator ]
//! [ Endpoints ] --/
//! ```
//!
//! Each resource kind has an [`Informer`] that mirrors it into a local cache and
//! enqueues the key of every changed object on a deduplicating [`Queue`]. The
//! [`Controller`] drains those queues, always re-reading the caches, so the
//! result of a sync depends only on the current cluster state and not on the
//! order in which events were observed.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod annotations;
pub mod cache;
pub mod configurator;
mod controller;
pub mod informer;
pub mod node;
pub mod queue;
pub mod resolve;

pub use self::{
    annotations::Algorithm,
    cache::Cache,
    configurator::{ConfigClass, Configurator, MemoryConfigurator, ServiceSpec},
    controller::{Controller, Informers, InvalidService, RunParams, Watches},
    informer::Informer,
    node::NodeInfo,
    queue::{Backoff, Queue},
    resolve::{Resolved, ServiceRoute},
};
