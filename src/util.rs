use std::net::Ipv4Addr;

use rand::Rng;

/// Parse a dotted-quad IPv4 address, rejecting anything else (IPv6,
/// hostnames, partial matches). Backend IP discovery funnels through here so
/// a driver can never hand the orchestrator a malformed address.
pub fn parse_ipv4(s: &str) -> Option<Ipv4Addr> {
    s.trim().parse::<Ipv4Addr>().ok()
}

/// Find the first IPv4 address in free-form tool output (comma- or
/// whitespace-separated tokens).
pub fn first_ipv4(text: &str) -> Option<Ipv4Addr> {
    text.split(|c: char| c.is_whitespace() || c == ',')
        .find_map(parse_ipv4)
}

/// Generate a random MAC in QEMU's locally-administered 52:54:00 range.
/// Persisted per VM and used as the stable key for DHCP lease correlation.
pub fn random_mac<R: Rng>(rng: &mut R) -> String {
    let octets: [u8; 3] = rng.r#gen();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        octets[0], octets[1], octets[2]
    )
}

/// Host architecture as cloud images name it.
pub fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => "aarch64",
        _ => "x86_64",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn parse_ipv4_accepts_dotted_quads_only() {
        assert_eq!(parse_ipv4("192.168.124.7"), "192.168.124.7".parse().ok());
        assert_eq!(parse_ipv4(" 10.0.0.1\n"), "10.0.0.1".parse().ok());
        assert!(parse_ipv4("").is_none());
        assert!(parse_ipv4("not-an-ip").is_none());
        assert!(parse_ipv4("192.168.1").is_none());
        assert!(parse_ipv4("192.168.1.256").is_none());
        assert!(parse_ipv4("fe80::1").is_none());
    }

    #[test]
    fn first_ipv4_scans_tool_output() {
        assert_eq!(
            first_ipv4("fe80::abcd, 192.168.64.5"),
            "192.168.64.5".parse().ok()
        );
        assert_eq!(first_ipv4("no addresses here"), None);
        assert_eq!(first_ipv4("10.0.0.9"), "10.0.0.9".parse().ok());
    }

    #[test]
    fn random_mac_uses_qemu_prefix() {
        let mut rng = StdRng::seed_from_u64(1);
        let mac = random_mac(&mut rng);
        assert!(mac.starts_with("52:54:00:"));
        assert_eq!(mac.len(), 17);
    }
}
