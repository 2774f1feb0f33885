//! Client address bucketing.
//!
//! RTT data is aggregated per address block rather than per address. An IPv4
//! address is truncated to its /22 network, an IPv6 address to its /56.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

pub const V4_PREFIX_LEN: u8 = 22;
pub const V6_PREFIX_LEN: u8 = 56;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BucketError {
    #[error("invalid address: {0:?}")]
    InvalidAddress(String),
}

/// The network address of a client group. Always holds an already truncated
/// address, so equality of buckets is equality of networks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AddressBucket(IpAddr);

impl AddressBucket {
    pub fn of(ip: IpAddr) -> Self {
        match ip.to_canonical() {
            IpAddr::V4(v4) => {
                let mask = u32::MAX << (32 - V4_PREFIX_LEN);
                AddressBucket(IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask)))
            }
            IpAddr::V6(v6) => {
                let mask = u128::MAX << (128 - V6_PREFIX_LEN);
                AddressBucket(IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask)))
            }
        }
    }

    pub fn network(&self) -> IpAddr {
        self.0
    }

    pub fn prefix_len(&self) -> u8 {
        match self.0 {
            IpAddr::V4(_) => V4_PREFIX_LEN,
            IpAddr::V6(_) => V6_PREFIX_LEN,
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        AddressBucket::of(ip) == *self
    }
}

/// Buckets an address given in text form.
pub fn bucket(ip: &str) -> Result<AddressBucket, BucketError> {
    ip.trim()
        .parse::<IpAddr>()
        .map(AddressBucket::of)
        .map_err(|_| BucketError::InvalidAddress(ip.to_string()))
}

pub fn same_bucket(a: IpAddr, b: IpAddr) -> bool {
    AddressBucket::of(a) == AddressBucket::of(b)
}

impl fmt::Display for AddressBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Parsing re-buckets, so any address inside the block yields the same key.
impl FromStr for AddressBucket {
    type Err = BucketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        bucket(s)
    }
}

impl TryFrom<String> for AddressBucket {
    type Error = BucketError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AddressBucket> for String {
    fn from(bucket: AddressBucket) -> Self {
        bucket.to_string()
    }
}
