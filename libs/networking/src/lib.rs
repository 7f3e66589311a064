//! Networking primitives for the address-manager synchronizer.
//!
//! This library provides:
//! - IPv4 prefix parsing and host enumeration
//! - Address pools with explicit exhaustion and idempotent release
//! - Deterministic MAC derivation for synthetic network identities

use std::collections::{BTreeSet, VecDeque};
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Invalid MAC address.
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),

    /// Address pool exhausted.
    #[error("address pool '{0}' has run out of addresses")]
    PoolExhausted(String),

    /// Address already handed out.
    #[error("address {address} in pool '{pool}' is already allocated")]
    AddressInUse { pool: String, address: Ipv4Addr },

    /// Address released into a pool that never owned it.
    #[error("address {address} does not belong to pool '{pool}'")]
    UnknownAddress { pool: String, address: Ipv4Addr },
}

impl NetworkError {
    /// Returns true if this error indicates an empty pool.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, NetworkError::PoolExhausted(_))
    }
}

// ============================================================================
// IPv4 Prefixes
// ============================================================================

/// IPv4 prefix in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Prefix {
    /// Base address of the prefix.
    pub address: Ipv4Addr,

    /// Prefix length (e.g., 24 for /24).
    pub prefix_len: u8,
}

impl Ipv4Prefix {
    /// Create a new prefix, masking host bits off the address.
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, NetworkError> {
        if prefix_len > 32 {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds 32",
                prefix_len
            )));
        }

        Ok(Self {
            address: mask_ipv4(address, prefix_len),
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g., "10.6.1.0/24").
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let s = s.trim();
        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!(
                "missing '/' in CIDR: {}",
                s
            )));
        };

        let address = Ipv4Addr::from_str(addr_str.trim())
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = prefix_str
            .trim()
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    /// Check if an address is within this prefix.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        mask_ipv4(addr, self.prefix_len) == self.address
    }

    /// Number of addresses in this prefix.
    pub fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix_len))
    }

    /// Usable host addresses.
    ///
    /// For /31 and /32 every address is usable; otherwise the network and
    /// broadcast addresses are skipped.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let base = u64::from(u32::from(self.address));
        let size = self.size();
        let (first, last) = if self.prefix_len >= 31 {
            (base, base + size - 1)
        } else {
            (base + 1, base + size - 2)
        };
        (first..=last).map(|n| Ipv4Addr::from(n as u32))
    }
}

impl std::fmt::Display for Ipv4Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for Ipv4Prefix {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_cidr(s)
    }
}

impl Serialize for Ipv4Prefix {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ipv4Prefix {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_cidr(&s).map_err(serde::de::Error::custom)
    }
}

/// Mask an IPv4 address to a prefix length.
fn mask_ipv4(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    let bits = u32::from(addr);
    let mask = if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len.min(32)))
    };
    Ipv4Addr::from(bits & mask)
}

/// Strip a trailing `/n` from an address string ("10.0.0.2/24" -> "10.0.0.2").
pub fn strip_prefix_len(s: &str) -> &str {
    s.split('/').next().unwrap_or(s).trim()
}

// ============================================================================
// MAC Addresses
// ============================================================================

/// Locally administered OUI used for synthetic identities.
const SYNTHETIC_MAC_PREFIX: [u8; 2] = [0x02, 0x42];

/// A 48-bit MAC address, rendered lowercase and colon-separated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// Create from raw octets.
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Raw octets.
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl std::fmt::Display for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddress {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.trim().split(':');
        for slot in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| NetworkError::InvalidMac(s.to_string()))?;
            if part.len() != 2 {
                return Err(NetworkError::InvalidMac(s.to_string()));
            }
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| NetworkError::InvalidMac(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(NetworkError::InvalidMac(s.to_string()));
        }
        Ok(Self(octets))
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Derive a locally administered MAC (`02:42:xx:xx:xx:xx`) from an IPv4
/// address, one octet per byte.
///
/// Pools with overlapping ranges derive identical MACs.
pub fn derive_mac(ip: Ipv4Addr) -> MacAddress {
    let [a, b, c, d] = ip.octets();
    let [p0, p1] = SYNTHETIC_MAC_PREFIX;
    MacAddress([p0, p1, a, b, c, d])
}

// ============================================================================
// Address Pools
// ============================================================================

/// A finite pool of IPv4 addresses.
///
/// Every address the pool owns is either available or allocated, never both.
/// Gateway and CIDR are fixed at construction. The pool does no locking of
/// its own; callers serialize access per pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPool {
    name: String,
    cidr: Option<Ipv4Prefix>,
    gateway_ip: Option<Ipv4Addr>,
    gateway_mac: Option<MacAddress>,
    available: VecDeque<Ipv4Addr>,
    allocated: BTreeSet<Ipv4Addr>,
}

impl AddressPool {
    /// Create a pool over an explicit address list. Duplicates are dropped,
    /// first occurrence wins.
    pub fn new(name: impl Into<String>, addresses: impl IntoIterator<Item = Ipv4Addr>) -> Self {
        let mut seen = BTreeSet::new();
        let available = addresses
            .into_iter()
            .filter(|addr| seen.insert(*addr))
            .collect();

        Self {
            name: name.into(),
            cidr: None,
            gateway_ip: None,
            gateway_mac: None,
            available,
            allocated: BTreeSet::new(),
        }
    }

    /// Create a pool holding every host address of `cidr` except the gateway.
    pub fn from_cidr_range(
        name: impl Into<String>,
        cidr: Ipv4Prefix,
        gateway_ip: Option<Ipv4Addr>,
    ) -> Self {
        let addresses = cidr.hosts().filter(|addr| Some(*addr) != gateway_ip);
        let mut pool = Self::new(name, addresses);
        pool.cidr = Some(cidr);
        pool.gateway_ip = gateway_ip;
        pool
    }

    /// Attach the CIDR the pool's addresses live in.
    ///
    /// Fails if any address the pool owns falls outside it.
    pub fn with_cidr(mut self, cidr: Ipv4Prefix) -> Result<Self, NetworkError> {
        if let Some(outside) = self.owned().find(|addr| !cidr.contains(*addr)) {
            return Err(NetworkError::InvalidAddress(format!(
                "{} is not in prefix {}",
                outside, cidr
            )));
        }
        self.cidr = Some(cidr);
        Ok(self)
    }

    /// Attach the gateway identity.
    pub fn with_gateway(mut self, ip: Ipv4Addr, mac: Option<MacAddress>) -> Self {
        self.gateway_ip = Some(ip);
        self.gateway_mac = mac;
        self
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// CIDR, if configured.
    pub fn cidr(&self) -> Option<Ipv4Prefix> {
        self.cidr
    }

    /// Gateway IP, if configured.
    pub fn gateway_ip(&self) -> Option<Ipv4Addr> {
        self.gateway_ip
    }

    /// Gateway MAC, if configured.
    pub fn gateway_mac(&self) -> Option<MacAddress> {
        self.gateway_mac
    }

    /// Take the first available address and mark it allocated.
    pub fn get_address(&mut self) -> Result<Ipv4Addr, NetworkError> {
        let addr = self
            .available
            .pop_front()
            .ok_or_else(|| NetworkError::PoolExhausted(self.name.clone()))?;
        self.allocated.insert(addr);
        Ok(addr)
    }

    /// Allocate a specific address (for records created with a
    /// pre-assigned IP).
    pub fn claim_address(&mut self, addr: Ipv4Addr) -> Result<(), NetworkError> {
        if self.allocated.contains(&addr) {
            return Err(NetworkError::AddressInUse {
                pool: self.name.clone(),
                address: addr,
            });
        }

        let Some(pos) = self.available.iter().position(|a| *a == addr) else {
            return Err(NetworkError::UnknownAddress {
                pool: self.name.clone(),
                address: addr,
            });
        };
        self.available.remove(pos);
        self.allocated.insert(addr);
        Ok(())
    }

    /// Return an address to the pool.
    ///
    /// Releasing an address that is already available is a no-op, so a
    /// retried delete never duplicates it.
    pub fn put_address(&mut self, addr: Ipv4Addr) -> Result<(), NetworkError> {
        if self.allocated.remove(&addr) {
            self.available.push_back(addr);
            return Ok(());
        }

        if self.available.contains(&addr) {
            return Ok(());
        }

        Err(NetworkError::UnknownAddress {
            pool: self.name.clone(),
            address: addr,
        })
    }

    /// Addresses that can still be handed out, in allocation order.
    pub fn available(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.available.iter().copied()
    }

    /// Addresses currently handed out.
    pub fn allocated(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.allocated.iter().copied()
    }

    /// Number of addresses still available.
    pub fn remaining(&self) -> usize {
        self.available.len()
    }

    /// True if `addr` is currently allocated from this pool.
    pub fn is_allocated(&self, addr: Ipv4Addr) -> bool {
        self.allocated.contains(&addr)
    }

    /// True if the pool owns `addr` in either state.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.allocated.contains(&addr) || self.available.contains(&addr)
    }

    fn owned(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.available().chain(self.allocated())
    }
}
