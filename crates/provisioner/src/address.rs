//! Deterministic private addresses for topology slots.
//!
//! The Nth node of a role gets the first three octets of the subnet and
//! `role_offset + N` as the fourth octet. Ranges are checked once when the
//! topology is validated; [`allocate`] itself only guards the octet bound.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::error::ConfigError;
use crate::topology::{NetworkConfig, Role};

/// Parse an IPv4 CIDR.
///
/// # Errors
/// Returns [`ConfigError::InvalidCidr`] if the string is not a CIDR.
pub fn parse_cidr(cidr: &str) -> Result<Ipv4Net, ConfigError> {
    cidr.parse::<Ipv4Net>()
        .map_err(|e| ConfigError::InvalidCidr {
            cidr: cidr.to_string(),
            reason: e.to_string(),
        })
}

/// Private address of node `index` in a role starting at `role_offset`.
///
/// # Errors
/// Returns [`ConfigError::InvalidCidr`] for an unparsable CIDR and
/// [`ConfigError::OctetOverflow`] when the fourth octet exceeds 255.
pub fn allocate(cidr: &str, role_offset: u8, index: u32) -> Result<Ipv4Addr, ConfigError> {
    let [a, b, c, _] = parse_cidr(cidr)?.network().octets();
    let octet = u32::from(role_offset).saturating_add(index);
    let last = u8::try_from(octet).map_err(|_| ConfigError::OctetOverflow { octet })?;
    Ok(Ipv4Addr::new(a, b, c, last))
}

/// Half-open range of fourth-octet values used by a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OctetRange {
    /// Role owning the range.
    pub role: Role,
    /// First octet.
    pub start: u32,
    /// One past the last octet.
    pub end: u32,
}

impl OctetRange {
    fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }

    const fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// Check that no role's range leaves the fourth octet or collides with another.
///
/// `max_counts` holds the largest node count each role must fit.
///
/// # Errors
/// Returns [`ConfigError::AddressOverflow`], [`ConfigError::OverlappingRanges`]
/// or [`ConfigError::MissingOffset`].
pub fn validate_ranges(
    network: &NetworkConfig,
    max_counts: &[(Role, u32)],
) -> Result<Vec<OctetRange>, ConfigError> {
    parse_cidr(&network.cidr)?;

    let mut ranges = Vec::with_capacity(max_counts.len());
    for &(role, count) in max_counts {
        let start = u32::from(network.offset(role)?);
        // start <= 255, so a count that fits keeps `end` within 256
        if count > 0 && count - 1 > u32::from(u8::MAX) - start {
            return Err(ConfigError::AddressOverflow {
                role,
                index: count - 1,
                octet: start.saturating_add(count - 1),
            });
        }
        ranges.push(OctetRange {
            role,
            start,
            end: start + count,
        });
    }

    for (i, first) in ranges.iter().enumerate() {
        for second in &ranges[i + 1..] {
            if !first.is_empty() && !second.is_empty() && first.overlaps(second) {
                return Err(ConfigError::OverlappingRanges {
                    first: first.role,
                    first_start: first.start,
                    first_end: first.end - 1,
                    second: second.role,
                    second_start: second.start,
                    second_end: second.end - 1,
                });
            }
        }
    }

    Ok(ranges)
}
