//! IP address resources.
//!
//! An address, IPv4 or IPv6, lives in a 16 byte buffer together with a
//! prefix length. IPv4 addresses occupy the leading four bytes with the
//! rest zero, which makes unsigned lexicographic comparison work the same
//! for both families. Every certificate element additionally carries its
//! canonical `[min, max]` byte form so that coverage checks never have to
//! look at the prefix representation again.

use std::{cmp, fmt};
use std::net::{Ipv4Addr, Ipv6Addr};
use bcder::{decode, BitString, OctetString, Tag};
use bcder::decode::ContentError;
use bcder::decode::DecodeError;
use super::{BlocksError, Coverage};


//------------ Afi -----------------------------------------------------------

/// An address family identifier as assigned by IANA.
///
/// Only the IPv4 and IPv6 values are accepted anywhere in this crate.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Afi {
    V4 = 1,
    V6 = 2,
}

impl Afi {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Afi::V4),
            2 => Some(Afi::V6),
            _ => None
        }
    }

    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// The number of bytes an address of this family occupies.
    pub fn addr_len(self) -> usize {
        match self {
            Afi::V4 => 4,
            Afi::V6 => 16,
        }
    }

    /// The largest permissible prefix length for this family.
    pub fn max_prefixlen(self) -> u8 {
        match self {
            Afi::V4 => 32,
            Afi::V6 => 128,
        }
    }

    /// Takes the addressFamily octet string of an IPAddressFamily sequence.
    ///
    /// This is a two byte octet string holding the AFI in network order.
    /// A three byte string would carry a SAFI which RFC 6487 forbids.
    pub fn take_from<S: decode::Source>(
        cons: &mut decode::Constructed<S>
    ) -> Result<Self, DecodeError<S::Error>> {
        let str = OctetString::take_from(cons)?;
        let mut octets = str.octets();
        let first = octets.next();
        let second = octets.next();
        if octets.next().is_some() {
            return Err(cons.content_err("AFI with SAFI not allowed"))
        }
        match (first, second) {
            (Some(0), Some(1)) => Ok(Afi::V4),
            (Some(0), Some(2)) => Ok(Afi::V6),
            _ => Err(cons.content_err("unknown address family"))
        }
    }
}

impl fmt::Display for Afi {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            Afi::V4 => "IPv4",
            Afi::V6 => "IPv6",
        })
    }
}


//------------ Addr ----------------------------------------------------------

/// A binary address prefix as it appears on the wire.
///
/// `prefixlen` gives the number of leading bits that are significant. All
/// bits past the prefix length are zero.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Addr {
    bytes: [u8; 16],
    prefixlen: u8,
}

impl Addr {
    pub fn new(bytes: [u8; 16], prefixlen: u8) -> Self {
        Addr { bytes, prefixlen }
    }

    /// Creates an address from an RFC 3779 IPAddress bit string.
    ///
    /// The bit string's length is the prefix length; any unused bits in
    /// the final octet must already be zero, which DER guarantees.
    pub fn from_bit_string<S: decode::Source>(
        cons: &mut decode::Constructed<S>,
        src: &BitString,
        afi: Afi,
    ) -> Result<Self, DecodeError<S::Error>> {
        if src.bit_len() > afi.max_prefixlen() as usize {
            return Err(cons.content_err("address prefix too long"))
        }
        let mut bytes = [0u8; 16];
        let mut pos = 0;
        for octet in src.octets() {
            bytes[pos] = octet;
            pos += 1;
        }
        Ok(Addr::new(bytes, src.bit_len() as u8))
    }

    pub fn bytes(&self) -> &[u8; 16] {
        &self.bytes
    }

    pub fn prefixlen(&self) -> u8 {
        self.prefixlen
    }

    /// Returns the smallest address covered by this prefix.
    ///
    /// Since all host bits are zero, this is just the byte buffer.
    pub fn min(&self) -> [u8; 16] {
        self.bytes
    }

    /// Returns the largest address covered by this prefix.
    ///
    /// All host bits within the family's address length are set to one.
    pub fn max(&self, afi: Afi) -> [u8; 16] {
        let mut res = self.bytes;
        let len = afi.addr_len();
        let plen = self.prefixlen as usize;
        for (i, byte) in res.iter_mut().enumerate().take(len) {
            let bit = i * 8;
            if bit + 8 <= plen {
                continue
            }
            if bit >= plen {
                *byte = 0xFF;
            }
            else {
                *byte |= 0xFF >> (plen - bit);
            }
        }
        res
    }

    /// Formats the address for the given family.
    pub fn display(&self, afi: Afi) -> AddrDisplay {
        AddrDisplay { addr: *self, afi }
    }
}


//--- PartialOrd and Ord
//
//    Lexicographic unsigned byte order; ties broken by prefix length with
//    the shorter prefix ordering first.

impl PartialOrd for Addr {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Addr {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        match self.bytes.cmp(&other.bytes) {
            cmp::Ordering::Equal => self.prefixlen.cmp(&other.prefixlen),
            other => other
        }
    }
}


//------------ AddrDisplay ---------------------------------------------------

/// Helper for printing an address in its family's conventional form.
pub struct AddrDisplay {
    addr: Addr,
    afi: Afi,
}

impl fmt::Display for AddrDisplay {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.afi {
            Afi::V4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&self.addr.bytes[..4]);
                write!(
                    f, "{}/{}",
                    Ipv4Addr::from(octets), self.addr.prefixlen
                )
            }
            Afi::V6 => {
                write!(
                    f, "{}/{}",
                    Ipv6Addr::from(self.addr.bytes), self.addr.prefixlen
                )
            }
        }
    }
}


//------------ AddrRange -----------------------------------------------------

/// A closed range of addresses.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct AddrRange {
    pub min: Addr,
    pub max: Addr,
}


//------------ CertIp --------------------------------------------------------

/// A single element of a certificate's IP resources.
///
/// The canonical `[min, max]` byte form is composed when the element is
/// built and is the only thing the coverage arithmetic looks at.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CertIp {
    afi: Afi,
    kind: CertIpKind,
    min: [u8; 16],
    max: [u8; 16],
}

/// The three shapes an IP resource element can take.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CertIpKind {
    /// An address range with a shared prefix.
    Prefix(Addr),

    /// An explicit min/max range.
    Range(AddrRange),

    /// The element is inherited from the issuer.
    Inherit,
}

impl CertIp {
    /// Creates a prefix element, composing its canonical range.
    pub fn prefix(afi: Afi, addr: Addr) -> Self {
        CertIp {
            afi,
            min: Addr::min(&addr),
            max: Addr::max(&addr, afi),
            kind: CertIpKind::Prefix(addr),
        }
    }

    /// Creates a range element, composing its canonical range.
    pub fn range(afi: Afi, range: AddrRange) -> Self {
        CertIp {
            afi,
            min: Addr::min(&range.min),
            max: Addr::max(&range.max, afi),
            kind: CertIpKind::Range(range),
        }
    }

    pub fn inherit(afi: Afi) -> Self {
        CertIp {
            afi,
            min: [0; 16],
            max: [0; 16],
            kind: CertIpKind::Inherit,
        }
    }

    pub fn afi(&self) -> Afi {
        self.afi
    }

    pub fn kind(&self) -> &CertIpKind {
        &self.kind
    }

    pub fn is_inherit(&self) -> bool {
        matches!(self.kind, CertIpKind::Inherit)
    }

    pub fn min(&self) -> &[u8; 16] {
        &self.min
    }

    pub fn max(&self) -> &[u8; 16] {
        &self.max
    }

    /// Returns whether this element overlaps the given range.
    fn overlaps(&self, min: &[u8; 16], max: &[u8; 16]) -> bool {
        !self.is_inherit()
            && self.min.as_ref() <= max.as_ref()
            && min.as_ref() <= self.max.as_ref()
    }
}


//------------ IpBlocks ------------------------------------------------------

/// The IP resources of a certificate.
///
/// Elements are kept in the order they appeared in the extension. The
/// parser enforces the structural invariants: per family the elements are
/// sorted by minimum and pairwise disjoint, and a family that inherits has
/// no other elements.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct IpBlocks(Vec<CertIp>);

impl IpBlocks {
    pub fn empty() -> Self {
        IpBlocks(Vec::new())
    }

    pub fn from_elements(elements: Vec<CertIp>) -> Self {
        IpBlocks(elements)
    }

    pub fn iter(&self) -> std::slice::Iter<CertIp> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns whether the family of `afi` consists of an inherit element.
    pub fn is_inherit(&self, afi: Afi) -> bool {
        self.0.iter().any(|el| el.afi() == afi && el.is_inherit())
    }

    /// Returns whether any element of the given family is present.
    pub fn has_family(&self, afi: Afi) -> bool {
        self.0.iter().any(|el| el.afi() == afi)
    }

    /// Appends an element, enforcing the per-certificate invariants.
    ///
    /// Elements of one family must arrive sorted by minimum and must not
    /// overlap; an inherit element excludes everything else of its family.
    pub fn push(&mut self, el: CertIp) -> Result<(), BlocksError> {
        for have in &self.0 {
            if have.afi() != el.afi() {
                continue
            }
            if have.is_inherit() || el.is_inherit() {
                return Err(BlocksError::InheritMixed)
            }
            if have.overlaps(&el.min, &el.max) {
                return Err(BlocksError::Overlap)
            }
            if el.min <= have.min {
                return Err(BlocksError::Unordered)
            }
        }
        self.0.push(el);
        Ok(())
    }

    /// Checks that `[min, max]` of family `afi` is covered by this set.
    pub fn check_covered(
        &self, afi: Afi, min: &[u8; 16], max: &[u8; 16]
    ) -> Coverage {
        for el in &self.0 {
            if el.afi() != afi {
                continue
            }
            if el.is_inherit() {
                return Coverage::Inherit
            }
            if el.min().as_ref() <= min.as_ref()
                && max.as_ref() <= el.max().as_ref()
            {
                return Coverage::Covered
            }
        }
        Coverage::NotCovered
    }
}

impl<'a> IntoIterator for &'a IpBlocks {
    type Item = &'a CertIp;
    type IntoIter = std::slice::Iter<'a, CertIp>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}


//--- Decoding

impl IpBlocks {
    /// Takes the content of an RFC 3779 IPAddrBlocks extension.
    ///
    /// ```text
    /// IPAddrBlocks        ::= SEQUENCE OF IPAddressFamily
    ///
    /// IPAddressFamily     ::= SEQUENCE {
    ///     addressFamily       OCTET STRING (SIZE (2..3)),
    ///     ipAddressChoice     IPAddressChoice }
    ///
    /// IPAddressChoice     ::= CHOICE {
    ///     inherit             NULL,
    ///     addressesOrRanges   SEQUENCE OF IPAddressOrRange }
    ///
    /// IPAddressOrRange    ::= CHOICE {
    ///     addressPrefix       IPAddress,
    ///     addressRange        IPAddressRange }
    ///
    /// IPAddressRange      ::= SEQUENCE {
    ///     min                 IPAddress,
    ///     max                 IPAddress }
    /// ```
    pub fn take_from<S: decode::Source>(
        cons: &mut decode::Constructed<S>
    ) -> Result<Self, DecodeError<S::Error>> {
        cons.take_sequence(|cons| {
            let mut res = IpBlocks::empty();
            let mut last_afi = None;
            while let Some(()) = cons.take_opt_sequence(|cons| {
                let afi = Afi::take_from(cons)?;
                // Each family may appear at most once, IPv4 before IPv6.
                if last_afi.map_or(false, |last| afi <= last) {
                    return Err(cons.content_err(
                        "out of order address family"
                    ))
                }
                last_afi = Some(afi);
                Self::take_family(cons, afi, &mut res)
            })? { }
            Ok(res)
        })
    }

    fn take_family<S: decode::Source>(
        cons: &mut decode::Constructed<S>,
        afi: Afi,
        res: &mut IpBlocks,
    ) -> Result<(), DecodeError<S::Error>> {
        if cons.take_opt_primitive_if(Tag::NULL, |_| Ok(()))?.is_some() {
            res.push(CertIp::inherit(afi)).map_err(|err| {
                cons.content_err(ContentError::from_boxed(Box::new(err)))
            })
        }
        else {
            cons.take_sequence(|cons| {
                while let Some(el) = Self::take_opt_element(cons, afi)? {
                    res.push(el).map_err(|err| cons.content_err(ContentError::from_boxed(Box::new(err))))?;
                }
                Ok(())
            })
        }
    }

    fn take_opt_element<S: decode::Source>(
        cons: &mut decode::Constructed<S>,
        afi: Afi,
    ) -> Result<Option<CertIp>, DecodeError<S::Error>> {
        if let Some(bits) = cons.take_opt_value_if(
            Tag::BIT_STRING, BitString::from_content
        )? {
            let addr = Addr::from_bit_string(cons, &bits, afi)?;
            return Ok(Some(CertIp::prefix(afi, addr)))
        }
        cons.take_opt_sequence(|cons| {
            let min_bits = BitString::take_from(cons)?;
            let min = Addr::from_bit_string(cons, &min_bits, afi)?;
            let max_bits = BitString::take_from(cons)?;
            let max = Addr::from_bit_string(cons, &max_bits, afi)?;
            let range = AddrRange { min, max };
            if Addr::min(&range.min) > Addr::max(&range.max, afi) {
                return Err(cons.content_err("inverted address range"))
            }
            Ok(CertIp::range(afi, range))
        })
    }
}


//============ Testing =======================================================

#[cfg(test)]
pub mod test {
    use super::*;

    /// Builds an IPv4 prefix element from dotted bytes and a length.
    pub fn v4(a: u8, b: u8, c: u8, d: u8, len: u8) -> CertIp {
        let mut bytes = [0u8; 16];
        bytes[0] = a;
        bytes[1] = b;
        bytes[2] = c;
        bytes[3] = d;
        CertIp::prefix(Afi::V4, Addr::new(bytes, len))
    }

    #[test]
    fn compose_prefix_ranges() {
        let el = v4(10, 0, 0, 0, 8);
        assert_eq!(&el.min()[..4], &[10, 0, 0, 0]);
        assert_eq!(&el.max()[..4], &[10, 255, 255, 255]);
        assert_eq!(&el.max()[4..], &[0u8; 12]);

        let el = v4(192, 0, 2, 128, 25);
        assert_eq!(&el.min()[..4], &[192, 0, 2, 128]);
        assert_eq!(&el.max()[..4], &[192, 0, 2, 255]);
    }

    #[test]
    fn default_route_covers_everything() {
        let mut blocks = IpBlocks::empty();
        blocks.push(v4(0, 0, 0, 0, 0)).unwrap();
        let probe = v4(203, 0, 113, 0, 24);
        assert_eq!(
            blocks.check_covered(Afi::V4, probe.min(), probe.max()),
            Coverage::Covered
        );
    }

    #[test]
    fn coverage() {
        let mut blocks = IpBlocks::empty();
        blocks.push(v4(10, 0, 0, 0, 16)).unwrap();

        let inside = v4(10, 0, 12, 0, 24);
        assert_eq!(
            blocks.check_covered(Afi::V4, inside.min(), inside.max()),
            Coverage::Covered
        );
        let outside = v4(10, 1, 0, 0, 16);
        assert_eq!(
            blocks.check_covered(Afi::V4, outside.min(), outside.max()),
            Coverage::NotCovered
        );
        // The exact same prefix is covered as well.
        let same = v4(10, 0, 0, 0, 16);
        assert_eq!(
            blocks.check_covered(Afi::V4, same.min(), same.max()),
            Coverage::Covered
        );
    }

    #[test]
    fn inherit_recurses() {
        let mut blocks = IpBlocks::empty();
        blocks.push(CertIp::inherit(Afi::V4)).unwrap();
        let probe = v4(10, 0, 0, 0, 8);
        assert_eq!(
            blocks.check_covered(Afi::V4, probe.min(), probe.max()),
            Coverage::Inherit
        );
        // An empty family means nothing of it is covered.
        assert_eq!(
            blocks.check_covered(Afi::V6, probe.min(), probe.max()),
            Coverage::NotCovered
        );
    }

    #[test]
    fn push_enforces_invariants() {
        let mut blocks = IpBlocks::empty();
        blocks.push(v4(10, 0, 0, 0, 16)).unwrap();
        assert_eq!(
            blocks.push(v4(10, 0, 128, 0, 17)),
            Err(BlocksError::Overlap)
        );
        assert_eq!(
            blocks.push(v4(9, 0, 0, 0, 16)),
            Err(BlocksError::Unordered)
        );
        blocks.push(v4(10, 1, 0, 0, 16)).unwrap();
        assert_eq!(
            blocks.push(CertIp::inherit(Afi::V4)),
            Err(BlocksError::InheritMixed)
        );
        // A different family is independent.
        blocks.push(CertIp::inherit(Afi::V6)).unwrap();
    }

    #[test]
    fn addr_order() {
        let a = Addr::new([10, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0], 8);
        let b = Addr::new([10, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0], 16);
        assert!(a < b); // shorter prefix orders first on equal bytes
        let c = Addr::new([11, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0], 8);
        assert!(b < c);
    }
}
