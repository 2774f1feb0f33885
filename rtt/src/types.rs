use crate::bucket::AddressBucket;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

pub type SiteId = String;

/// Best known RTT from a client group to one site.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SiteRtt {
    pub site_id: SiteId,
    // milliseconds
    pub rtt: f64,
    pub last_updated: DateTime<Utc>,
}

impl SiteRtt {
    pub fn new<S: Into<SiteId>>(site_id: S, rtt: f64, last_updated: DateTime<Utc>) -> Self {
        SiteRtt {
            site_id: site_id.into(),
            rtt,
            last_updated,
        }
    }
}

/// All known site RTTs for one address bucket, ordered by ascending RTT.
/// Holds at most one entry per site.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientGroup {
    pub bucket: AddressBucket,
    #[serde(default)]
    pub site_rtts: Vec<SiteRtt>,
}

impl ClientGroup {
    pub fn new(bucket: AddressBucket) -> Self {
        ClientGroup {
            bucket,
            site_rtts: Vec::new(),
        }
    }

    pub fn with_site_rtts(bucket: AddressBucket, mut site_rtts: Vec<SiteRtt>) -> Self {
        sort_by_rtt(&mut site_rtts);
        ClientGroup { bucket, site_rtts }
    }

    pub fn find(&self, site_id: &str) -> Option<&SiteRtt> {
        self.site_rtts.iter().find(|s| s.site_id == site_id)
    }

    pub fn is_empty(&self) -> bool {
        self.site_rtts.is_empty()
    }

    pub fn sort(&mut self) {
        sort_by_rtt(&mut self.site_rtts);
    }

    pub fn is_sorted(&self) -> bool {
        self.site_rtts.windows(2).all(|w| w[0].rtt <= w[1].rtt)
    }
}

// Ties are left in arbitrary order.
fn sort_by_rtt(site_rtts: &mut [SiteRtt]) {
    site_rtts.sort_unstable_by(|a, b| a.rtt.total_cmp(&b.rtt));
}

/// One traceroute-derived measurement as delivered by the analytical source.
#[derive(Clone, Debug, PartialEq)]
pub struct RawSample {
    pub logged_at: DateTime<Utc>,
    pub server_ip: IpAddr,
    pub client_ip: IpAddr,
    pub rtt: f64,
}

/// A concrete server picked for a client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ServerAddress {
    pub site_id: SiteId,
    pub fqdn: String,
    pub ip: IpAddr,
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ip)
    }
}
