//! Address helpers - prefix math and radvd configuration
//!
//! Used by the routing and tethering steps to derive subnets, the tethered IPv6
//! /64 prefix and the router advertisement daemon's config file.

use ipnet::{Ipv4Net, Ipv6Net};
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Parse a numeric address, accepting a `%scope` suffix on IPv6
pub fn parse_ip(addr: &str) -> Option<IpAddr> {
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return Some(ip);
    }
    let (host, _scope) = addr.split_once('%')?;
    host.parse::<Ipv6Addr>().ok().map(IpAddr::V6)
}

pub fn is_ipv6(addr: &str) -> bool {
    matches!(parse_ip(addr), Some(IpAddr::V6(_)))
}

/// Default route destination matching the family of `gateway`
pub fn default_route_for(gateway: &str) -> &'static str {
    if is_ipv6(gateway) {
        "::/0"
    } else {
        "0.0.0.0/0"
    }
}

/// Network part of `ip` under `prefix_length`, without the length suffix.
///
/// Lengths beyond the family width keep the whole address.
pub fn subnet_ip(ip: &str, prefix_length: u32) -> Option<String> {
    match parse_ip(ip)? {
        IpAddr::V4(v4) => {
            let len = prefix_length.min(32) as u8;
            Ipv4Net::new(v4, len).ok().map(|net| net.network().to_string())
        }
        IpAddr::V6(v6) => {
            let len = prefix_length.min(128) as u8;
            Ipv6Net::new(v6, len).ok().map(|net| net.network().to_string())
        }
    }
}

/// IPv4 network address for a dotted-quad `ip` and a decimal `prefix`
pub fn ipv4_network_addr(ip: &str, prefix: &str) -> Option<Ipv4Addr> {
    let addr: Ipv4Addr = ip.trim().parse().ok()?;
    let len: u8 = prefix.trim().parse().ok()?;
    Ipv4Net::new(addr, len).ok().map(|net| net.network())
}

/// IPv4 netmask for `prefix_length`, saturating at /32
pub fn ipv4_mask(prefix_length: u32) -> Ipv4Addr {
    let len = prefix_length.min(32) as u8;
    Ipv4Net::new(Ipv4Addr::UNSPECIFIED, len)
        .map(|net| net.netmask())
        .unwrap_or(Ipv4Addr::BROADCAST)
}

/// Value of an IPv4 address as it sits in memory in network byte order
pub fn ipv4_to_network_order(addr: Ipv4Addr) -> u32 {
    u32::from_ne_bytes(addr.octets())
}

/// `/64` prefix of an IPv6 address: the low 64 bits zeroed, suffixed with `/64`
pub fn ipv6_prefix(addr: &str) -> Option<String> {
    let v6: Ipv6Addr = match parse_ip(addr)? {
        IpAddr::V6(v6) => v6,
        IpAddr::V4(_) => return None,
    };
    let net = Ipv6Net::new(v6, 64).ok()?;
    Some(format!("{}/64", net.network()))
}

/// Router advertisement config announcing `prefix` and `dns_servers` on `iface`
pub fn radvd_config(iface: &str, prefix: &str, dns_servers: &[String]) -> String {
    let rdnss: String = dns_servers.iter().map(|s| format!(" {}", s)).collect();
    format!(
        "interface {iface}\n{{\n\tAdvSendAdvert on;\n\
         \tMinRtrAdvInterval 3;\n\tMaxRtrAdvInterval 10;\n\
         \tAdvManagedFlag off;\n\tAdvOtherConfigFlag off;\n\
         \tprefix {prefix}\n\
         \t{{\n\t\tAdvOnLink off;\n\
         \t\tAdvAutonomous on;\n\
         \t\tAdvRouterAddr off;\n\
         \t}};\n\tRDNSS{rdnss}\n\
         \t{{\n\
         \t\tAdvRDNSSLifetime 3600;\n\
         \t}};\n}};\n"
    )
}

/// Write the radvd config readable by the daemon (0664), optionally chowned to `owner`
pub fn write_radvd_config(path: &Path, contents: &str, owner: Option<u32>) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(path, contents)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o664))?;

    if let Some(id) = owner {
        nix::unistd::chown(
            path,
            Some(nix::unistd::Uid::from_raw(id)),
            Some(nix::unistd::Gid::from_raw(id)),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_family() {
        assert!(is_ipv6("2001:db8::1"));
        assert!(is_ipv6("fe80::1%wlan0"));
        assert!(!is_ipv6("8.8.8.8"));
        assert!(!is_ipv6("not-an-ip"));
        assert_eq!(default_route_for("2001:db8::1"), "::/0");
        assert_eq!(default_route_for("192.168.1.1"), "0.0.0.0/0");
    }

    #[test]
    fn test_subnet_ip() {
        assert_eq!(subnet_ip("192.168.1.77", 24).as_deref(), Some("192.168.1.0"));
        assert_eq!(subnet_ip("10.1.2.3", 8).as_deref(), Some("10.0.0.0"));
        assert_eq!(subnet_ip("10.1.2.3", 40).as_deref(), Some("10.1.2.3"));
        assert_eq!(subnet_ip("2001:db8:1:2:3:4:5:6", 48).as_deref(), Some("2001:db8:1::"));
        assert!(subnet_ip("bogus", 24).is_none());
    }

    #[test]
    fn test_ipv4_network_addr() {
        assert_eq!(ipv4_network_addr("192.168.43.1", "24"), Some(Ipv4Addr::new(192, 168, 43, 0)));
        assert_eq!(ipv4_network_addr("192.168.43.1", "0"), Some(Ipv4Addr::UNSPECIFIED));
        assert!(ipv4_network_addr("192.168.43.1", "x").is_none());
        assert!(ipv4_network_addr("", "24").is_none());
    }

    #[test]
    fn test_ipv4_mask() {
        assert_eq!(ipv4_mask(24), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(ipv4_mask(0), Ipv4Addr::UNSPECIFIED);
        assert_eq!(ipv4_mask(99), Ipv4Addr::BROADCAST);
    }

    #[test]
    fn test_ipv6_prefix_zeroes_interface_id() {
        assert_eq!(
            ipv6_prefix("2001:db8:aaaa:bbbb:1:2:3:4").as_deref(),
            Some("2001:db8:aaaa:bbbb::/64")
        );
        assert!(ipv6_prefix("192.168.1.1").is_none());
        assert!(ipv6_prefix("").is_none());
    }

    #[test]
    fn test_radvd_config_lists_dns() {
        let conf = radvd_config("rndis0", "2001:db8::/64", &["2001:4860::8888".to_string(), "2001:4860::8844".to_string()]);

        assert!(conf.starts_with("interface rndis0\n{\n\tAdvSendAdvert on;\n"));
        assert!(conf.contains("\tprefix 2001:db8::/64\n"));
        assert!(conf.contains("\tRDNSS 2001:4860::8888 2001:4860::8844\n"));
        assert!(conf.ends_with("\t\tAdvRDNSSLifetime 3600;\n\t};\n};\n"));
    }

    #[test]
    fn test_write_radvd_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("radvd").join("radvd.conf");

        write_radvd_config(&path, "interface x\n", None).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "interface x\n");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o664);
    }
}
