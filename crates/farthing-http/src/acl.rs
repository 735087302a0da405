use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error(
    "invalid -rpcallowip subnet specification: {spec}. Valid are a single IP (e.g. 1.2.3.4), \
     a network/netmask (e.g. 1.2.3.4/255.255.255.0) or a network/CIDR (e.g. 1.2.3.4/24)"
)]
pub struct AclError {
    spec: String,
}

/// An address/prefix pair matched against peer addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: IpAddr,
    prefix: u8,
}

impl Subnet {
    /// Parse a single IP, `network/CIDR`, or IPv4 `network/netmask`.
    pub fn parse(spec: &str) -> Result<Self, AclError> {
        let err = || AclError {
            spec: spec.to_string(),
        };

        let (addr_part, mask_part) = match spec.split_once('/') {
            Some((addr, mask)) => (addr, Some(mask)),
            None => (spec, None),
        };

        let network = canonical(addr_part.parse().map_err(|_| err())?);
        let bits = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };

        let prefix = match mask_part {
            None => bits,
            Some(mask) => {
                if let Ok(prefix) = mask.parse::<u8>() {
                    if prefix > bits {
                        return Err(err());
                    }
                    prefix
                } else {
                    // Dotted-quad netmask form, IPv4 only.
                    if !matches!(network, IpAddr::V4(_)) {
                        return Err(err());
                    }
                    let mask: Ipv4Addr = mask.parse().map_err(|_| err())?;
                    netmask_prefix(u32::from(mask)).ok_or_else(err)?
                }
            }
        };

        Ok(Self { network, prefix })
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.network, canonical(addr)) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                prefix_match(u32::from(net) as u128, u32::from(ip) as u128, 32, self.prefix)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                prefix_match(u128::from(net), u128::from(ip), 128, self.prefix)
            }
            _ => false,
        }
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Ordered set of subnets allowed to contact the server.
///
/// Loopback is always allowed; additional subnets come from the node's
/// `-rpcallowip` settings. Unmatched addresses are denied.
pub struct Acl {
    subnets: Vec<Subnet>,
}

impl Acl {
    pub fn new(allow: &[String]) -> Result<Self, AclError> {
        let mut subnets = vec![
            Subnet {
                network: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 0)),
                prefix: 8,
            },
            Subnet {
                network: IpAddr::V6(Ipv6Addr::LOCALHOST),
                prefix: 128,
            },
        ];

        for spec in allow {
            subnets.push(Subnet::parse(spec)?);
        }

        Ok(Self { subnets })
    }

    pub fn is_allowed(&self, addr: IpAddr) -> bool {
        self.subnets.iter().any(|subnet| subnet.contains(addr))
    }
}

impl fmt::Display for Acl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for subnet in &self.subnets {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{subnet}")?;
            first = false;
        }
        Ok(())
    }
}

fn prefix_match(a: u128, b: u128, bits: u8, prefix: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    (a ^ b) >> (bits - prefix) == 0
}

/// Prefix length of a contiguous-from-the-top netmask.
fn netmask_prefix(mask: u32) -> Option<u8> {
    let ones = mask.leading_ones();
    if mask.count_ones() == ones {
        Some(ones as u8)
    } else {
        None
    }
}

/// Fold IPv4-mapped IPv6 addresses back into IPv4 so dual-stack peers
/// match IPv4 subnets.
fn canonical(addr: IpAddr) -> IpAddr {
    if let IpAddr::V6(v6) = addr {
        let seg = v6.segments();
        if seg[..5] == [0, 0, 0, 0, 0] && seg[5] == 0xffff {
            let [a, b] = seg[6].to_be_bytes();
            let [c, d] = seg[7].to_be_bytes();
            return IpAddr::V4(Ipv4Addr::new(a, b, c, d));
        }
    }
    addr
}
