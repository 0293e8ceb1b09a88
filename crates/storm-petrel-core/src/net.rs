//! Source-address predicates
//!
//! CIDR blocks are used in two places: the per-user allowed-source list and
//! the PROXY protocol allow-list. A bare address parses as a host route
//! (/32 or /128).

use std::net::IpAddr;
use std::str::FromStr;

/// An IPv4 or IPv6 network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrBlock {
    network: IpAddr,
    prefix: u8,
}

impl CidrBlock {
    /// True when `addr` falls inside this block. Mixed address families never
    /// match.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix)
                };
                (u32::from(net) & mask) == (u32::from(ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix)
                };
                (u128::from(net) & mask) == (u128::from(ip) & mask)
            }
            _ => false,
        }
    }

    /// Parse a list of CIDR strings, dropping malformed entries with a
    /// warning. An unparseable entry must never widen access, so it simply
    /// does not match anything.
    pub fn parse_list(entries: &[String]) -> Vec<CidrBlock> {
        entries
            .iter()
            .filter_map(|e| match e.parse::<CidrBlock>() {
                Ok(block) => Some(block),
                Err(err) => {
                    tracing::warn!("ignoring malformed network {:?}: {}", e, err);
                    None
                }
            })
            .collect()
    }

    /// True when `addr` matches any block in `blocks`.
    pub fn matches_any(blocks: &[CidrBlock], addr: IpAddr) -> bool {
        blocks.iter().any(|b| b.contains(addr))
    }
}

impl FromStr for CidrBlock {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_part, prefix_part) = match s.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (s, None),
        };

        let network: IpAddr = addr_part
            .parse()
            .map_err(|e| format!("invalid address {:?}: {}", addr_part, e))?;

        let max_prefix = if network.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix_part {
            Some(p) => p
                .parse::<u8>()
                .map_err(|e| format!("invalid prefix {:?}: {}", p, e))?,
            None => max_prefix,
        };

        if prefix > max_prefix {
            return Err(format!("prefix /{} too long for {}", prefix, addr_part));
        }

        Ok(CidrBlock { network, prefix })
    }
}
