use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::config::ConfigError;

/// Source-address ranges allowed to reach the protected endpoints.
///
/// Parsed once from a comma separated list such as `"10.0.0.0/8,::1"`. An
/// empty string yields an empty list, which rejects every address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct AllowList {
    ranges: Vec<IpRange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IpRange {
    V4 { network: u32, prefix: u8 },
    V6 { network: u128, prefix: u8 },
}

impl AllowList {
    pub(crate) fn new(raw: &str) -> Result<Self, ConfigError> {
        let ranges = raw
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(IpRange::parse)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { ranges })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Returns false for anything that does not parse as a bare IP address.
    pub(crate) fn includes(&self, ip: &str) -> bool {
        match ip.parse::<IpAddr>() {
            Ok(addr) => self.includes_addr(addr),
            Err(_) => false,
        }
    }

    pub(crate) fn includes_addr(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.ranges.iter().any(|range| range.contains(ip))
    }
}

impl IpRange {
    fn parse(entry: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidRange {
            entry: entry.to_string(),
            reason: reason.to_string(),
        };

        let (addr, prefix) = match entry.split_once('/') {
            Some((addr, prefix)) => {
                let prefix = prefix
                    .parse::<u8>()
                    .map_err(|_| invalid("prefix length is not a number"))?;
                (addr, Some(prefix))
            }
            None => (entry, None),
        };

        let addr = addr
            .parse::<IpAddr>()
            .map_err(|_| invalid("not an IP address"))?;

        match addr {
            IpAddr::V4(v4) => {
                let prefix = prefix.unwrap_or(32);
                if prefix > 32 {
                    return Err(invalid("IPv4 prefix length must be at most 32"));
                }
                Ok(Self::V4 {
                    network: u32::from(v4) & v4_mask(prefix),
                    prefix,
                })
            }
            IpAddr::V6(v6) => {
                let prefix = prefix.unwrap_or(128);
                if prefix > 128 {
                    return Err(invalid("IPv6 prefix length must be at most 128"));
                }
                Ok(Self::V6 {
                    network: u128::from(v6) & v6_mask(prefix),
                    prefix,
                })
            }
        }
    }

    fn contains(&self, ip: IpAddr) -> bool {
        match (self, ip) {
            (Self::V4 { network, prefix }, IpAddr::V4(v4)) => {
                u32::from(v4) & v4_mask(*prefix) == *network
            }
            (Self::V6 { network, prefix }, IpAddr::V6(v6)) => {
                u128::from(v6) & v6_mask(*prefix) == *network
            }
            _ => false,
        }
    }
}

fn v4_mask(prefix: u8) -> u32 {
    u32::MAX
        .checked_shl(u32::from(32 - prefix))
        .unwrap_or(0)
}

fn v6_mask(prefix: u8) -> u128 {
    u128::MAX
        .checked_shl(u32::from(128 - prefix))
        .unwrap_or(0)
}

impl std::fmt::Display for IpRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V4 { network, prefix } => write!(f, "{}/{prefix}", Ipv4Addr::from(*network)),
            Self::V6 { network, prefix } => write!(f, "{}/{prefix}", Ipv6Addr::from(*network)),
        }
    }
}

impl std::fmt::Display for AllowList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ranges = self
            .ranges
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        f.write_str(&ranges.join(","))
    }
}
