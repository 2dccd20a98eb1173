//! Parser for the macOS vmnet DHCP lease table (`/var/db/dhcpd_leases`).
//!
//! The file is a sequence of brace-delimited records:
//!
//! ```text
//! {
//!     name=mcpvm-swift-otter
//!     ip_address=192.168.64.5
//!     hw_address=1,52:54:0:ab:1:cd
//!     identifier=1,52:54:0:ab:1:cd
//!     lease=0x65f0c0de
//! }
//! ```
//!
//! `hw_address` carries a type prefix (`1,` = Ethernet) and drops leading
//! zeros in each octet, so lookups normalize both sides before comparing.

use std::net::Ipv4Addr;

use crate::util::parse_ipv4;

/// Normalize a MAC address for comparison: lowercase hex, no zero padding.
/// Returns None when the string is not six colon-separated hex octets.
fn normalize_mac(mac: &str) -> Option<String> {
    let octets: Vec<u8> = mac
        .split(':')
        .map(|o| u8::from_str_radix(o, 16))
        .collect::<Result<_, _>>()
        .ok()?;
    if octets.len() != 6 {
        return None;
    }
    Some(
        octets
            .iter()
            .map(|o| format!("{o:x}"))
            .collect::<Vec<_>>()
            .join(":"),
    )
}

/// Find the leased IPv4 address for a MAC in dhcpd_leases contents.
/// Later records win: the daemon appends renewals, so the last entry for a
/// MAC is the current lease.
pub fn lease_ip_for_mac(contents: &str, mac: &str) -> Option<Ipv4Addr> {
    let wanted = normalize_mac(mac)?;
    let mut found = None;

    let mut current_ip: Option<Ipv4Addr> = None;
    let mut current_matches = false;

    for line in contents.lines() {
        let line = line.trim();
        if line == "{" {
            current_ip = None;
            current_matches = false;
        } else if line == "}" {
            if current_matches && current_ip.is_some() {
                found = current_ip;
            }
        } else if let Some(value) = line.strip_prefix("ip_address=") {
            current_ip = parse_ipv4(value);
        } else if let Some(value) = line.strip_prefix("hw_address=") {
            // Strip the "1," hardware-type prefix.
            let raw = value.split(',').nth(1).unwrap_or(value);
            if normalize_mac(raw).as_deref() == Some(wanted.as_str()) {
                current_matches = true;
            }
        }
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
{
	name=mcpvm-swift-otter
	ip_address=192.168.64.5
	hw_address=1,52:54:0:ab:1:cd
	identifier=1,52:54:0:ab:1:cd
	lease=0x65f0c0de
}
{
	name=other-vm
	ip_address=192.168.64.9
	hw_address=1,aa:bb:cc:d:e:f
	lease=0x65f0c0ff
}
";

    #[test]
    fn finds_lease_despite_zero_stripping() {
        let ip = lease_ip_for_mac(SAMPLE, "52:54:00:ab:01:cd");
        assert_eq!(ip, "192.168.64.5".parse().ok());
    }

    #[test]
    fn distinguishes_macs() {
        let ip = lease_ip_for_mac(SAMPLE, "aa:bb:cc:0d:0e:0f");
        assert_eq!(ip, "192.168.64.9".parse().ok());
    }

    #[test]
    fn unknown_mac_yields_none() {
        assert_eq!(lease_ip_for_mac(SAMPLE, "de:ad:be:ef:00:01"), None);
    }

    #[test]
    fn later_renewal_wins() {
        let contents = format!(
            "{SAMPLE}{{\n\tname=mcpvm-swift-otter\n\tip_address=192.168.64.17\n\thw_address=1,52:54:0:ab:1:cd\n}}\n"
        );
        let ip = lease_ip_for_mac(&contents, "52:54:00:ab:01:cd");
        assert_eq!(ip, "192.168.64.17".parse().ok());
    }

    #[test]
    fn garbage_input_yields_none() {
        assert_eq!(lease_ip_for_mac("", "52:54:00:ab:01:cd"), None);
        assert_eq!(lease_ip_for_mac("not a lease file", "52:54:00:ab:01:cd"), None);
        assert_eq!(lease_ip_for_mac(SAMPLE, "not-a-mac"), None);
    }
}
