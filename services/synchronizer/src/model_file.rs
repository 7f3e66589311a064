//! JSON model file used to seed the in-memory store.
//!
//! Records refer to each other by name. Address-manager service instances
//! are provisioned through [`AddressManagerService`], so they allocate their
//! address exactly as a live request would.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::path::Path;

use amsync_id::{InstanceId, NodeId, ServiceId, ServiceInstanceId};
use amsync_networking::{AddressPool, Ipv4Prefix, MacAddress};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::models::{OnosService, ServiceKind};
use crate::provisioning::{AddressManagerService, ServiceInstanceRequest};
use crate::store::MemoryStore;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelFile {
    #[serde(default)]
    pub services: Vec<ServiceEntry>,
    #[serde(default)]
    pub address_pools: Vec<AddressPoolEntry>,
    #[serde(default)]
    pub nodes: Vec<NodeEntry>,
    #[serde(default)]
    pub instances: Vec<InstanceEntry>,
    #[serde(default)]
    pub service_instances: Vec<ServiceInstanceEntry>,
    #[serde(default)]
    pub links: Vec<LinkEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    #[serde(flatten)]
    pub kind: ServiceKindEntry,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServiceKindEntry {
    Fabric {
        #[serde(default)]
        autoconfig: bool,
    },
    Onos {
        #[serde(default = "default_rest_scheme")]
        rest_scheme: String,
        rest_hostname: String,
        rest_port: u16,
        rest_username: String,
        rest_password: String,
    },
    AddressManager,
    Other {
        #[serde(rename = "type")]
        type_name: String,
    },
}

fn default_rest_scheme() -> String {
    "http".to_string()
}

impl From<ServiceKindEntry> for ServiceKind {
    fn from(entry: ServiceKindEntry) -> Self {
        match entry {
            ServiceKindEntry::Fabric { autoconfig } => ServiceKind::Fabric { autoconfig },
            ServiceKindEntry::Onos {
                rest_scheme,
                rest_hostname,
                rest_port,
                rest_username,
                rest_password,
            } => ServiceKind::Onos(OnosService {
                rest_scheme,
                rest_hostname,
                rest_port,
                rest_username,
                rest_password,
            }),
            ServiceKindEntry::AddressManager => ServiceKind::AddressManager,
            ServiceKindEntry::Other { type_name } => ServiceKind::Other { kind: type_name },
        }
    }
}

/// A pool is seeded from `addresses` if given, else from every host
/// address of `cidr` except the gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddressPoolEntry {
    pub name: String,
    pub service: String,
    pub cidr: Option<Ipv4Prefix>,
    pub gateway_ip: Option<Ipv4Addr>,
    pub gateway_mac: Option<MacAddress>,
    pub addresses: Option<Vec<Ipv4Addr>>,
}

impl AddressPoolEntry {
    fn build(&self) -> Result<AddressPool> {
        let pool = match (&self.addresses, self.cidr) {
            (Some(addresses), cidr) => {
                let pool = AddressPool::new(&self.name, addresses.iter().copied());
                match cidr {
                    Some(cidr) => pool
                        .with_cidr(cidr)
                        .with_context(|| format!("address pool {}", self.name))?,
                    None => pool,
                }
            }
            (None, Some(cidr)) => AddressPool::from_cidr_range(&self.name, cidr, self.gateway_ip),
            (None, None) => bail!(
                "address pool {} needs either addresses or a cidr",
                self.name
            ),
        };

        Ok(match self.gateway_ip {
            Some(ip) => pool.with_gateway(ip, self.gateway_mac),
            None => pool,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeEntry {
    pub name: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceEntry {
    pub name: String,
    pub instance_name: Option<String>,
    pub node: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceInstanceEntry {
    pub name: String,
    pub owner: String,
    #[serde(flatten)]
    pub kind: ServiceInstanceKindEntry,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServiceInstanceKindEntry {
    AddressManager {
        address_pool: String,
        tenant_for_instance: Option<String>,
    },
    Subscriber {
        instance: Option<String>,
    },
    Plain {
        #[serde(rename = "type")]
        type_name: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkEntry {
    pub provider: String,
    pub subscriber_service_instance: Option<String>,
    pub subscriber_service: Option<String>,
}

/// Counts of what a model file put in the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedSummary {
    pub services: usize,
    pub address_pools: usize,
    pub nodes: usize,
    pub instances: usize,
    pub service_instances: usize,
    pub links: usize,
}

fn lookup<T: Copy>(names: &HashMap<String, T>, kind: &str, name: &str) -> Result<T> {
    names
        .get(name)
        .copied()
        .with_context(|| format!("unknown {kind} '{name}'"))
}

impl ModelFile {
    /// Read and parse a model file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read model file {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("invalid model file {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Insert everything into `store`.
    pub async fn seed(&self, store: &MemoryStore) -> Result<SeedSummary> {
        let mut summary = SeedSummary::default();

        let mut services: HashMap<String, ServiceId> = HashMap::new();
        for entry in &self.services {
            let id = store
                .add_service(&entry.name, entry.kind.clone().into())
                .await;
            if services.insert(entry.name.clone(), id).is_some() {
                bail!("duplicate service '{}'", entry.name);
            }
            summary.services += 1;
        }

        for entry in &self.address_pools {
            let service = lookup(&services, "service", &entry.service)?;
            store
                .add_address_pool(service, entry.build()?)
                .await
                .with_context(|| format!("address pool {}", entry.name))?;
            summary.address_pools += 1;
        }

        let mut nodes: HashMap<String, NodeId> = HashMap::new();
        for entry in &self.nodes {
            let id = store.add_node(&entry.name).await;
            for (name, value) in &entry.tags {
                store.set_node_tag(id, name, value.clone()).await;
            }
            nodes.insert(entry.name.clone(), id);
            summary.nodes += 1;
        }

        let mut instances: HashMap<String, InstanceId> = HashMap::new();
        for entry in &self.instances {
            let node = lookup(&nodes, "node", &entry.node)?;
            let id = store.add_instance(entry.instance_name.clone(), node).await;
            instances.insert(entry.name.clone(), id);
            summary.instances += 1;
        }

        let mut service_instances: HashMap<String, ServiceInstanceId> = HashMap::new();
        for entry in &self.service_instances {
            let owner = lookup(&services, "service", &entry.owner)?;
            let id = match &entry.kind {
                ServiceInstanceKindEntry::AddressManager {
                    address_pool,
                    tenant_for_instance,
                } => {
                    let mut request = ServiceInstanceRequest::new(address_pool);
                    if let Some(instance) = tenant_for_instance {
                        request = request.for_instance(lookup(&instances, "instance", instance)?);
                    }
                    let record = AddressManagerService::new(store, owner)
                        .get_service_instance(request)
                        .await
                        .with_context(|| format!("service instance {}", entry.name))?;
                    record
                        .id
                        .with_context(|| format!("service instance {} was not saved", entry.name))?
                }
                ServiceInstanceKindEntry::Subscriber { instance } => {
                    let instance = instance
                        .as_deref()
                        .map(|name| lookup(&instances, "instance", name))
                        .transpose()?;
                    store.add_subscriber_instance(owner, instance).await
                }
                ServiceInstanceKindEntry::Plain { type_name } => {
                    store.add_plain_instance(owner, type_name.clone()).await
                }
            };
            service_instances.insert(entry.name.clone(), id);
            summary.service_instances += 1;
        }

        for entry in &self.links {
            let provider = lookup(&service_instances, "service instance", &entry.provider)?;
            let subscriber_service_instance = entry
                .subscriber_service_instance
                .as_deref()
                .map(|name| lookup(&service_instances, "service instance", name))
                .transpose()?;
            let subscriber_service = entry
                .subscriber_service
                .as_deref()
                .map(|name| lookup(&services, "service", name))
                .transpose()?;
            store
                .add_link(provider, subscriber_service_instance, subscriber_service)
                .await?;
            summary.links += 1;
        }

        info!(
            services = summary.services,
            address_pools = summary.address_pools,
            nodes = summary.nodes,
            instances = summary.instances,
            service_instances = summary.service_instances,
            links = summary.links,
            "Model file loaded"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ModelAccessor;
    use amsync_reconcile::Backoff;

    const MODEL: &str = r#"{
        "services": [
            {"name": "fabric", "kind": "fabric", "autoconfig": true},
            {"name": "onos-fabric", "kind": "onos", "rest_hostname": "onos", "rest_port": 8181,
             "rest_username": "onos", "rest_password": "rocks"},
            {"name": "addressmanager", "kind": "address_manager"},
            {"name": "vsg", "kind": "other", "type": "VSGService"}
        ],
        "address_pools": [
            {"name": "public", "service": "addressmanager", "cidr": "10.0.0.0/30",
             "gateway_ip": "10.0.0.1", "gateway_mac": "a4:23:05:00:00:01"}
        ],
        "nodes": [{"name": "compute-1", "tags": {"dataPlaneIp": "10.6.1.2/24"}}],
        "instances": [{"name": "vm-1", "instance_name": "vm-1", "node": "compute-1"}],
        "service_instances": [
            {"name": "fabric-app", "owner": "onos-fabric", "kind": "plain", "type": "ONOSApp"},
            {"name": "vsg-1", "owner": "vsg", "kind": "subscriber", "instance": "vm-1"},
            {"name": "addr-1", "owner": "addressmanager", "kind": "address_manager",
             "address_pool": "public"}
        ],
        "links": [
            {"provider": "fabric-app", "subscriber_service": "fabric"},
            {"provider": "addr-1", "subscriber_service_instance": "vsg-1"}
        ]
    }"#;

    #[tokio::test]
    async fn test_seed() {
        let (store, _rx) = MemoryStore::new(Backoff::default());
        let model = ModelFile::from_json(MODEL).unwrap();
        let summary = model.seed(&store).await.unwrap();
        assert_eq!(
            summary,
            SeedSummary {
                services: 4,
                address_pools: 1,
                nodes: 1,
                instances: 1,
                service_instances: 3,
                links: 2,
            }
        );

        let pending = store.fetch_pending(false).await.unwrap();
        assert_eq!(pending.len(), 1);
        // 10.0.0.0/30 has hosts .1 and .2; .1 is the gateway.
        assert_eq!(pending[0].public_ip, Some("10.0.0.2".parse().unwrap()));
        assert_eq!(pending[0].gateway_ip(), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(pending[0].netbits(), Some(30));
    }

    #[tokio::test]
    async fn test_example_model_file() {
        let (store, _rx) = MemoryStore::new(Backoff::default());
        let model = ModelFile::from_json(include_str!("../model.example.json")).unwrap();
        model.seed(&store).await.unwrap();

        let pending = store.fetch_pending(false).await.unwrap();
        assert_eq!(pending[0].public_ip, Some("10.6.1.130".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_unknown_reference() {
        let (store, _rx) = MemoryStore::new(Backoff::default());
        let model = ModelFile::from_json(
            r#"{"address_pools": [{"name": "p", "service": "nope", "addresses": []}]}"#,
        )
        .unwrap();
        let err = model.seed(&store).await.unwrap_err();
        assert!(err.to_string().contains("unknown service 'nope'"));
    }

    #[test]
    fn test_pool_needs_addresses_or_cidr() {
        let entry = AddressPoolEntry {
            name: "p".into(),
            service: "am".into(),
            cidr: None,
            gateway_ip: None,
            gateway_mac: None,
            addresses: None,
        };
        assert!(entry.build().is_err());
    }

    #[test]
    fn test_addresses_must_fit_cidr() {
        let entry = AddressPoolEntry {
            name: "p".into(),
            service: "am".into(),
            cidr: Some("10.0.0.0/30".parse().unwrap()),
            gateway_ip: None,
            gateway_mac: None,
            addresses: Some(vec!["10.0.1.1".parse().unwrap()]),
        };
        assert!(entry.build().is_err());
    }
}
