// Copyright (C) 2019-2020  Pierre Krieger
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Subnet-masked source address used to index the rate and concurrency
/// tables. Two sources inside the same masked range always compare equal.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdmissionKey(IpAddr);

impl AdmissionKey {
    /// Builds the key for `source`: the address is normalized (IPv4-mapped
    /// IPv6 unwrapped) and masked to the configured prefix length of its
    /// family.
    pub fn from_source(source: IpAddr, v4_prefix: u8, v6_prefix: u8) -> AdmissionKey {
        match normalize(source) {
            IpAddr::V4(addr) => AdmissionKey(IpAddr::V4(mask_v4(addr, v4_prefix))),
            IpAddr::V6(addr) => AdmissionKey(IpAddr::V6(mask_v6(addr, v6_prefix))),
        }
    }

    /// The masked address, for logging.
    pub fn address(&self) -> IpAddr {
        self.0
    }
}

impl fmt::Debug for AdmissionKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for AdmissionKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unwraps IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) so that the same
/// host reaches the same key whichever stack it arrived on. Other IPv6
/// addresses, including IPv4-compatible ones, are left alone.
pub fn normalize(source: IpAddr) -> IpAddr {
    if let IpAddr::V6(v6) = source {
        let octets = v6.octets();
        if octets[..10] == [0; 10] && octets[10] == 0xff && octets[11] == 0xff {
            return IpAddr::V4(Ipv4Addr::new(
                octets[12], octets[13], octets[14], octets[15],
            ));
        }
    }
    source
}

/// Whether `source` belongs to a range that `exclude_local_network` exempts
/// from limiting: loopback, RFC 1918 private space, link-local, and the
/// IPv6 unique-local block.
pub fn is_local_source(source: &IpAddr) -> bool {
    match source {
        IpAddr::V4(addr) => {
            addr.is_loopback() || addr.is_private() || addr.is_link_local()
        }
        IpAddr::V6(addr) => {
            addr.is_loopback()
                || (addr.octets()[0] & 0xfe) == 0xfc // fc00::/7 unique local
                || (addr.segments()[0] & 0xffc0) == 0xfe80 // fe80::/10 link local
        }
    }
}

fn mask_v4(addr: Ipv4Addr, prefix: u8) -> Ipv4Addr {
    if prefix >= 32 {
        return addr;
    }
    // A zero prefix shifts out the whole word; the key is then the
    // all-zero address, one shared range.
    let mask = u32::max_value()
        .checked_shl(32 - u32::from(prefix))
        .unwrap_or(0);
    Ipv4Addr::from(u32::from(addr) & mask)
}

fn mask_v6(addr: Ipv6Addr, prefix: u8) -> Ipv6Addr {
    if prefix >= 128 {
        return addr;
    }
    let mask = u128::max_value()
        .checked_shl(128 - u32::from(prefix))
        .unwrap_or(0);
    Ipv6Addr::from(u128::from(addr) & mask)
}

#[cfg(test)]
mod tests {
    use super::{is_local_source, normalize, AdmissionKey};
    use std::net::{IpAddr, Ipv6Addr};

    #[test]
    fn same_subnet_same_key() {
        let a = AdmissionKey::from_source("10.0.0.5".parse().unwrap(), 24, 56);
        let b = AdmissionKey::from_source("10.0.0.200".parse().unwrap(), 24, 56);
        let c = AdmissionKey::from_source("10.0.1.5".parse().unwrap(), 24, 56);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn v6_prefix_masking() {
        // /56 keeps the first 56 bits: everything below the top byte of the
        // fourth segment is masked off.
        let a = AdmissionKey::from_source("2001:db8:0:a0ff::1".parse().unwrap(), 24, 56);
        let b = AdmissionKey::from_source("2001:db8:0:a000::2".parse().unwrap(), 24, 56);
        let c = AdmissionKey::from_source("2001:db8:0:b000::1".parse().unwrap(), 24, 56);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn zero_prefix_collapses_to_one_key() {
        let a = AdmissionKey::from_source("8.8.8.8".parse().unwrap(), 0, 0);
        let b = AdmissionKey::from_source("203.0.113.9".parse().unwrap(), 0, 0);
        assert_eq!(a, b);

        let v6_a = AdmissionKey::from_source("2001:db8::1".parse().unwrap(), 0, 0);
        let v6_b = AdmissionKey::from_source("fe80::2".parse().unwrap(), 0, 0);
        assert_eq!(v6_a, v6_b);
        assert_ne!(a, v6_a);
    }

    #[test]
    fn full_length_prefix_keeps_address() {
        let addr: IpAddr = "192.0.2.77".parse().unwrap();
        let key = AdmissionKey::from_source(addr, 32, 128);
        assert_eq!(key.address(), addr);
    }

    #[test]
    fn mapped_v6_unwraps_to_v4() {
        let mapped = IpAddr::V6("::ffff:10.0.0.5".parse::<Ipv6Addr>().unwrap());
        assert_eq!(normalize(mapped), "10.0.0.5".parse::<IpAddr>().unwrap());

        // Same key as the plain IPv4 form.
        let a = AdmissionKey::from_source(mapped, 24, 56);
        let b = AdmissionKey::from_source("10.0.0.9".parse().unwrap(), 24, 56);
        assert_eq!(a, b);
    }

    #[test]
    fn plain_v6_not_unwrapped() {
        let addr: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(normalize(addr), addr);
    }

    #[test]
    fn local_ranges() {
        assert!(is_local_source(&"127.0.0.1".parse().unwrap()));
        assert!(is_local_source(&"10.1.2.3".parse().unwrap()));
        assert!(is_local_source(&"192.168.0.1".parse().unwrap()));
        assert!(is_local_source(&"169.254.0.1".parse().unwrap()));
        assert!(is_local_source(&"::1".parse().unwrap()));
        assert!(is_local_source(&"fd00::1".parse().unwrap()));
        assert!(is_local_source(&"fe80::1".parse().unwrap()));
        assert!(!is_local_source(&"8.8.8.8".parse().unwrap()));
        assert!(!is_local_source(&"2001:db8::1".parse().unwrap()));
    }
}
