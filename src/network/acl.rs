//! IP blacklist checked at accept.
//!
//! Entries are "a.b.c.d", "a.b.c.d/bits", "a.b.c.d/e.f.g.h" or "all".

use std::net::{IpAddr, Ipv4Addr};

/// An IPv4 address + mask pair, both in host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpMask {
    pub ip: u32,
    /// 0 matches everything
    pub mask: u32,
}

impl IpMask {
    pub fn matches(&self, ip: u32) -> bool {
        self.mask == 0 || (ip & self.mask) == (self.ip & self.mask)
    }
}

/// Parse an IP/mask string. Returns `None` on invalid input.
pub fn parse_ipmask(s: &str) -> Option<IpMask> {
    let s = s.trim();
    if s == "all" {
        return Some(IpMask { ip: 0, mask: 0 });
    }

    if let Some((addr_part, mask_part)) = s.split_once('/') {
        let ip = parse_ipv4(addr_part)?;
        if mask_part.contains('.') {
            let mask = parse_ipv4(mask_part)?;
            return Some(IpMask { ip, mask });
        }
        let bits: u32 = mask_part.parse().ok()?;
        if bits > 32 {
            return None;
        }
        return Some(IpMask { ip, mask: prefix_to_mask(bits) });
    }

    let ip = parse_ipv4(s)?;
    Some(IpMask { ip, mask: 0xFFFF_FFFF })
}

fn parse_ipv4(s: &str) -> Option<u32> {
    s.parse::<Ipv4Addr>().ok().map(u32::from)
}

fn prefix_to_mask(bits: u32) -> u32 {
    if bits == 0 {
        0
    } else {
        0xFFFF_FFFF_u32 << (32 - bits)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Blacklist {
    entries: Vec<IpMask>,
}

impl Blacklist {
    /// Invalid entries are skipped with a warning; config validation
    /// normally rejects them first.
    pub fn from_entries<S: AsRef<str>>(entries: &[S]) -> Self {
        let entries = entries
            .iter()
            .filter_map(|e| {
                let parsed = parse_ipmask(e.as_ref());
                if parsed.is_none() {
                    tracing::warn!("[acl] [parse] invalid entry={}", e.as_ref());
                }
                parsed
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// IPv6 peers are only refused by "all"; mapped IPv4 addresses are
    /// checked as IPv4.
    pub fn is_blocked(&self, addr: IpAddr) -> bool {
        let ip = match addr {
            IpAddr::V4(v4) => u32::from(v4),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => u32::from(v4),
                None => return self.entries.iter().any(|e| e.mask == 0),
            },
        };
        self.entries.iter().any(|e| e.matches(ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> u32 {
        u32::from(s.parse::<Ipv4Addr>().unwrap())
    }

    #[test]
    fn test_all_matches_everything() {
        let acl = parse_ipmask("all").unwrap();
        assert_eq!(acl, IpMask { ip: 0, mask: 0 });
        assert!(acl.matches(0xDEAD_BEEF));
    }

    #[test]
    fn test_exact_host() {
        let acl = parse_ipmask("192.168.1.1").unwrap();
        assert_eq!(acl.mask, 0xFFFF_FFFF);
        assert!(acl.matches(ip("192.168.1.1")));
        assert!(!acl.matches(ip("192.168.1.2")));
    }

    #[test]
    fn test_cidr_prefix() {
        let acl = parse_ipmask("192.168.1.0/24").unwrap();
        assert!(acl.matches(ip("192.168.1.42")));
        assert!(!acl.matches(ip("192.168.2.42")));
    }

    #[test]
    fn test_dotted_mask() {
        let acl = parse_ipmask("10.0.0.0/255.0.0.0").unwrap();
        assert!(acl.matches(ip("10.99.1.2")));
        assert!(!acl.matches(ip("11.0.0.0")));
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(parse_ipmask("").is_none());
        assert!(parse_ipmask("999.0.0.1").is_none());
        assert!(parse_ipmask("1.2.3.4/33").is_none());
        assert!(parse_ipmask("not-an-ip").is_none());
    }

    #[test]
    fn test_blacklist_checks_peers() {
        let list = Blacklist::from_entries(&["10.0.0.0/8", "bogus", "127.0.0.2"]);
        assert_eq!(list.len(), 2);
        assert!(list.is_blocked("10.1.2.3".parse().unwrap()));
        assert!(list.is_blocked("127.0.0.2".parse().unwrap()));
        assert!(!list.is_blocked("127.0.0.1".parse().unwrap()));
        assert!(list.is_blocked("::ffff:10.0.0.1".parse().unwrap()));
        assert!(!list.is_blocked("::1".parse().unwrap()));
    }
}
