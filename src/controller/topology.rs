//! Node topology: which nodes run etcd and which addresses they have.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};

use crate::error::{Error, Result};

pub const DEFAULT_CONTROL_PLANE_SELECTOR: &str = "node-role.kubernetes.io/master";

#[async_trait]
pub trait NodeTopology: Send + Sync {
    /// Names of the nodes that host etcd members.
    async fn control_plane_nodes(&self) -> Result<Vec<String>>;

    /// Internal IP literals of a node, in the order the node reports them.
    async fn internal_ips(&self, node_name: &str) -> Result<Vec<String>>;
}

pub struct KubeNodeTopology {
    client: Client,
    selector: String,
}

impl KubeNodeTopology {
    pub fn new(client: Client, selector: impl Into<String>) -> Self {
        Self {
            client,
            selector: selector.into(),
        }
    }
}

/// `InternalIP` addresses from a Node's status.
pub fn node_internal_ips(node: &Node) -> Vec<String> {
    node.status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .map(|addresses| {
            addresses
                .iter()
                .filter(|a| a.type_ == "InternalIP")
                .map(|a| a.address.clone())
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl NodeTopology for KubeNodeTopology {
    async fn control_plane_nodes(&self) -> Result<Vec<String>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api
            .list(&ListParams::default().labels(&self.selector))
            .await
            .map_err(|e| Error::TopologyError(format!("failed to list nodes: {e}")))?;
        let mut names: Vec<String> = nodes.items.iter().map(|n| n.name_any()).collect();
        names.sort();
        Ok(names)
    }

    async fn internal_ips(&self, node_name: &str) -> Result<Vec<String>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let node = api
            .get(node_name)
            .await
            .map_err(|e| Error::TopologyError(format!("failed to get node {node_name}: {e}")))?;
        let ips = node_internal_ips(&node);
        if ips.is_empty() {
            return Err(Error::TopologyError(format!(
                "node {node_name} has no InternalIP address"
            )));
        }
        Ok(ips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeAddress, NodeStatus};

    #[test]
    fn test_node_internal_ips_filters_by_type() {
        let node = Node {
            status: Some(NodeStatus {
                addresses: Some(vec![
                    NodeAddress {
                        type_: "Hostname".to_string(),
                        address: "master-0".to_string(),
                    },
                    NodeAddress {
                        type_: "InternalIP".to_string(),
                        address: "10.0.0.5".to_string(),
                    },
                    NodeAddress {
                        type_: "ExternalIP".to_string(),
                        address: "203.0.113.9".to_string(),
                    },
                    NodeAddress {
                        type_: "InternalIP".to_string(),
                        address: "fd00::5".to_string(),
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            node_internal_ips(&node),
            vec!["10.0.0.5".to_string(), "fd00::5".to_string()]
        );
    }

    #[test]
    fn test_node_without_status() {
        assert!(node_internal_ips(&Node::default()).is_empty());
    }
}
