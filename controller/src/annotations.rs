//! Service annotations that control load balancer management.

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use std::{fmt, str::FromStr};

/// Opts a service in to external load balancing when set to [`CLASS_LBEX`].
pub const CLASS: &str = "kubernetes.io/loadbalancer-class";
pub const CLASS_LBEX: &str = "loadbalancer-lbex";

/// An optional virtual host for the service's frontend.
pub const HOST: &str = "loadbalancer.lbex/host";

/// The load balancing algorithm, one of [`Algorithm`].
pub const ALGORITHM: &str = "loadbalancer.lbex/algorithm";

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    #[default]
    RoundRobin,
    LeastConn,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unsupported load balancing algorithm: {0:?}")]
pub struct UnsupportedAlgorithm(String);

/// Indicates whether the service carries the lbex load balancer class.
pub fn is_eligible(svc: &Service) -> bool {
    svc.annotations().get(CLASS).map(String::as_str) == Some(CLASS_LBEX)
}

pub fn host(svc: &Service) -> Option<String> {
    svc.annotations().get(HOST).cloned()
}

/// Returns the annotated algorithm, falling back to the default when the
/// annotation is missing or names an unsupported algorithm.
pub fn algorithm(svc: &Service) -> Algorithm {
    let Some(value) = svc.annotations().get(ALGORITHM) else {
        return Algorithm::default();
    };
    value.parse().unwrap_or_else(|error| {
        tracing::debug!(service = %svc.name_any(), %error, "using default algorithm");
        Algorithm::default()
    })
}

// === impl Algorithm ===

impl Algorithm {
    pub const SUPPORTED: [Algorithm; 2] = [Algorithm::RoundRobin, Algorithm::LeastConn];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "roundrobin",
            Self::LeastConn => "leastconn",
        }
    }
}

impl FromStr for Algorithm {
    type Err = UnsupportedAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::SUPPORTED
            .into_iter()
            .find(|alg| alg.as_str() == s)
            .ok_or_else(|| UnsupportedAlgorithm(s.to_string()))
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
