//! Node addressing, as needed to route traffic to node ports.

use k8s_openapi::api::core::v1::Node;

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct NodeInfo {
    pub name: String,
    pub hostname: Option<String>,
    pub external_ip: Option<String>,
    pub internal_ip: Option<String>,
    /// False when the node is cordoned.
    pub active: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvalidNode {
    #[error("node has no name")]
    MissingName,

    #[error("node {0} has no status")]
    MissingStatus(String),

    #[error("node {0} has no hostname, external, or internal address")]
    MissingAddress(String),
}

// === impl NodeInfo ===

impl NodeInfo {
    pub fn from_node(node: &Node) -> Result<Self, InvalidNode> {
        let name = node
            .metadata
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or(InvalidNode::MissingName)?;
        let status = node
            .status
            .as_ref()
            .ok_or_else(|| InvalidNode::MissingStatus(name.clone()))?;

        let mut info = NodeInfo {
            active: !node
                .spec
                .as_ref()
                .and_then(|spec| spec.unschedulable)
                .unwrap_or(false),
            ..Default::default()
        };
        // The first address of each type wins.
        for addr in status.addresses.iter().flatten() {
            let slot = match addr.type_.as_str() {
                "Hostname" => &mut info.hostname,
                "ExternalIP" => &mut info.external_ip,
                "InternalIP" => &mut info.internal_ip,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(addr.address.clone());
            }
        }

        if info.hostname.is_none() && info.external_ip.is_none() && info.internal_ip.is_none() {
            return Err(InvalidNode::MissingAddress(name));
        }
        info.name = name;
        Ok(info)
    }
}
