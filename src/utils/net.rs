//! IPv4 network helpers for classifier set handling

use std::net::Ipv4Addr;

/// An IPv4 network in CIDR form, normalized so no host bits are set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cidr {
    pub addr: Ipv4Addr,
    pub prefix: u8,
}

impl Cidr {
    /// Parse `a.b.c.d` or `a.b.c.d/len`, clearing any host bits.
    ///
    /// A bare address gets a /32. The kernel rejects set elements with
    /// non-zero host bits, so `52.33.95.61/24` becomes `52.33.95.0/24`.
    pub fn parse(input: &str) -> Option<Cidr> {
        let (addr_part, prefix) = match input.split_once('/') {
            Some((a, p)) => (a, p.parse::<u8>().ok()?),
            None => (input, 32),
        };
        if prefix > 32 {
            return None;
        }
        let addr: Ipv4Addr = addr_part.trim().parse().ok()?;
        Some(Cidr {
            addr: mask_addr(addr, prefix),
            prefix,
        })
    }

    /// True if any address in this network falls inside a range that
    /// must never be tunnel-marked.
    pub fn is_private_or_loopback(&self) -> bool {
        let net = u32::from(self.addr);
        RESERVED_V4.iter().any(|r| {
            let range = u32::from(r.addr);
            let range_mask = prefix_mask(r.prefix);
            // Overlap either way: the entry inside the reserved range, or
            // a wide entry that covers it.
            (net & range_mask) == (range & range_mask)
                || (range & prefix_mask(self.prefix)) == (net & prefix_mask(self.prefix))
        })
    }
}

impl std::fmt::Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Ranges excluded from classification: RFC1918 plus loopback.
const RESERVED_V4: [Cidr; 4] = [
    Cidr {
        addr: Ipv4Addr::new(10, 0, 0, 0),
        prefix: 8,
    },
    Cidr {
        addr: Ipv4Addr::new(172, 16, 0, 0),
        prefix: 12,
    },
    Cidr {
        addr: Ipv4Addr::new(192, 168, 0, 0),
        prefix: 16,
    },
    Cidr {
        addr: Ipv4Addr::new(127, 0, 0, 0),
        prefix: 8,
    },
];

fn prefix_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    }
}

fn mask_addr(addr: Ipv4Addr, prefix: u8) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(addr) & prefix_mask(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_address_gets_host_prefix() {
        let c = Cidr::parse("93.184.216.34").unwrap();
        assert_eq!(c.to_string(), "93.184.216.34/32");
    }

    #[test]
    fn host_bits_are_cleared() {
        let c = Cidr::parse("52.33.95.61/24").unwrap();
        assert_eq!(c.to_string(), "52.33.95.0/24");
    }

    #[test]
    fn invalid_inputs_rejected() {
        assert!(Cidr::parse("not-an-ip").is_none());
        assert!(Cidr::parse("10.0.0.0/33").is_none());
        assert!(Cidr::parse("").is_none());
    }

    #[test]
    fn reserved_ranges_detected() {
        assert!(Cidr::parse("10.1.2.3/32").unwrap().is_private_or_loopback());
        assert!(Cidr::parse("172.20.0.0/16")
            .unwrap()
            .is_private_or_loopback());
        assert!(Cidr::parse("192.168.1.1").unwrap().is_private_or_loopback());
        assert!(Cidr::parse("127.0.0.1").unwrap().is_private_or_loopback());
        assert!(!Cidr::parse("8.8.8.8").unwrap().is_private_or_loopback());
        // A /0 covers everything reserved
        assert!(Cidr::parse("0.0.0.0/0").unwrap().is_private_or_loopback());
    }
}
