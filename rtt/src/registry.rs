// Site and server inventory as seen by the aggregator and the resolver.
// The inventory itself is managed elsewhere; this module only reads a
// snapshot of it.
use crate::types::{ServerAddress, SiteId};
use rand::seq::SliceRandom;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("could not parse inventory: {0}")]
    Parse(#[from] serde_yaml::Error),
}

pub trait SiteRegistry: Send + Sync {
    /// Maps a server address (either family) to the site hosting it.
    fn site_for_server(&self, ip: IpAddr) -> Option<SiteId>;

    /// Picks an online server running `service_id` at `site_id`, uniformly at random.
    fn random_online_server(&self, site_id: &str, service_id: &str) -> Option<ServerAddress>;
}

fn default_online() -> bool {
    true
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Server {
    pub service_id: String,
    pub site_id: SiteId,
    pub fqdn: String,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    #[serde(default = "default_online")]
    pub online: bool,
}

impl Server {
    fn address(&self) -> Option<ServerAddress> {
        let ip = self
            .ipv4
            .map(IpAddr::V4)
            .or_else(|| self.ipv6.map(IpAddr::V6))?;
        Some(ServerAddress {
            site_id: self.site_id.clone(),
            fqdn: self.fqdn.clone(),
            ip,
        })
    }
}

#[derive(Deserialize)]
struct Inventory {
    servers: Vec<Server>,
}

/// Registry built once from a list of servers.
#[derive(Debug, Default)]
pub struct StaticRegistry {
    site_by_ip: HashMap<IpAddr, SiteId>,
    // (site_id, service_id) -> servers
    servers: HashMap<(SiteId, String), Vec<Server>>,
}

impl StaticRegistry {
    pub fn new(servers: impl IntoIterator<Item = Server>) -> Self {
        let mut registry = StaticRegistry::default();
        for server in servers {
            if let Some(v4) = server.ipv4 {
                registry
                    .site_by_ip
                    .insert(IpAddr::V4(v4), server.site_id.clone());
            }
            if let Some(v6) = server.ipv6 {
                registry
                    .site_by_ip
                    .insert(IpAddr::V6(v6), server.site_id.clone());
            }
            registry
                .servers
                .entry((server.site_id.clone(), server.service_id.clone()))
                .or_default()
                .push(server);
        }
        registry
    }

    /// Loads an inventory file of the form `servers: [...]`.
    pub fn from_file(path: &Path) -> Result<Self, RegistryError> {
        let file = File::open(path)?;
        let inventory: Inventory = serde_yaml::from_reader(file)?;
        tracing::info!(
            servers = inventory.servers.len(),
            "loaded server inventory from {}",
            path.display()
        );
        Ok(StaticRegistry::new(inventory.servers))
    }

    pub fn len(&self) -> usize {
        self.servers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

impl SiteRegistry for StaticRegistry {
    fn site_for_server(&self, ip: IpAddr) -> Option<SiteId> {
        self.site_by_ip.get(&ip.to_canonical()).cloned()
    }

    fn random_online_server(&self, site_id: &str, service_id: &str) -> Option<ServerAddress> {
        let servers = self
            .servers
            .get(&(site_id.to_string(), service_id.to_string()))?;
        let candidates: Vec<ServerAddress> = servers
            .iter()
            .filter(|s| s.online)
            .filter_map(Server::address)
            .collect();
        candidates.choose(&mut rand::thread_rng()).cloned()
    }
}
