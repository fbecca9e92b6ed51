//! Validated ROA payloads and their aggregation store.
//!
//! The store is the product of the whole run: an ordered, de-duplicating
//! index of everything the walk validated. The order of the key gives the
//! output files their deterministic order, so this must stay an ordered
//! map.

use std::collections::btree_map::{BTreeMap, Entry};
use std::fmt;
use crate::resources::ip::{Addr, Afi};
use crate::roa::Roa;
use crate::x509::Time;


//------------ VrpKey --------------------------------------------------------

/// The identity of a VRP.
///
/// Ordering is ascending on AFI, then on the address bytes (unsigned
/// lexicographic, zero padded to 16), then prefix length, max length and
/// finally the AS number.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct VrpKey {
    afi: Afi,
    addr: [u8; 16],
    prefixlen: u8,
    maxlength: u8,
    asid: u32,
}

impl VrpKey {
    pub fn new(
        afi: Afi, addr: Addr, maxlength: u8, asid: u32
    ) -> Self {
        VrpKey {
            afi,
            addr: *addr.bytes(),
            prefixlen: addr.prefixlen(),
            maxlength,
            asid,
        }
    }

    pub fn afi(&self) -> Afi {
        self.afi
    }

    pub fn addr(&self) -> Addr {
        Addr::new(self.addr, self.prefixlen)
    }

    pub fn prefixlen(&self) -> u8 {
        self.prefixlen
    }

    pub fn maxlength(&self) -> u8 {
        self.maxlength
    }

    pub fn asid(&self) -> u32 {
        self.asid
    }
}

impl fmt::Display for VrpKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f, "{} => AS{}",
            self.addr().display(self.afi), self.asid
        )
    }
}


//------------ Vrp -----------------------------------------------------------

/// A validated ROA payload.
#[derive(Clone, Debug)]
pub struct Vrp {
    key: VrpKey,

    /// The name of the TAL below which the first contributing ROA was
    /// found.
    tal: String,

    /// The transitive expiry moment: the earliest notAfter on the chain,
    /// maximized over all contributing ROAs.
    expires: Time,
}

impl Vrp {
    pub fn key(&self) -> &VrpKey {
        &self.key
    }

    pub fn tal(&self) -> &str {
        &self.tal
    }

    pub fn expires(&self) -> Time {
        self.expires
    }
}


//------------ VrpStore ------------------------------------------------------

/// The ordered set of all validated payloads.
#[derive(Debug, Default)]
pub struct VrpStore(BTreeMap<VrpKey, Vrp>);

impl VrpStore {
    pub fn new() -> Self {
        VrpStore(BTreeMap::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the payloads in key order.
    pub fn iter(&self) -> impl Iterator<Item = &Vrp> {
        self.0.values()
    }

    /// Inserts one payload.
    ///
    /// On collision the stored `expires` is raised to the maximum of both
    /// and the provenance of the first inserter is retained. Returns
    /// whether a new key was added.
    pub fn insert(
        &mut self, key: VrpKey, tal: &str, expires: Time
    ) -> bool {
        match self.0.entry(key) {
            Entry::Vacant(entry) => {
                entry.insert(Vrp {
                    key,
                    tal: tal.into(),
                    expires,
                });
                true
            }
            Entry::Occupied(mut entry) => {
                let vrp = entry.get_mut();
                if expires > vrp.expires {
                    vrp.expires = expires;
                }
                false
            }
        }
    }

    /// Inserts all payloads of a validated ROA.
    ///
    /// Increments `total` for every prefix of the ROA and `unique` only
    /// for those that added a new key.
    pub fn insert_roa(
        &mut self, roa: &Roa, unique: &mut usize, total: &mut usize
    ) {
        for ip in roa.ips() {
            let key = VrpKey::new(
                ip.afi(), *ip.addr(), ip.maxlength(), roa.asid()
            );
            if self.insert(key, roa.tal(), roa.expires()) {
                *unique += 1;
            }
            *total += 1;
        }
    }
}

impl<'a> IntoIterator for &'a VrpStore {
    type Item = &'a Vrp;
    type IntoIter = std::collections::btree_map::Values<'a, VrpKey, Vrp>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.values()
    }
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    fn v4addr(a: u8, b: u8, c: u8, d: u8, len: u8) -> Addr {
        let mut bytes = [0u8; 16];
        bytes[0] = a;
        bytes[1] = b;
        bytes[2] = c;
        bytes[3] = d;
        Addr::new(bytes, len)
    }

    fn key(a: u8, len: u8, maxlen: u8, asid: u32) -> VrpKey {
        VrpKey::new(Afi::V4, v4addr(a, 0, 0, 0, len), maxlen, asid)
    }

    #[test]
    fn insert_deduplicates_and_maximizes_expiry() {
        let mut store = VrpStore::new();
        let early = Time::from_timestamp(1_000).unwrap();
        let late = Time::from_timestamp(2_000).unwrap();

        assert!(store.insert(key(10, 16, 24, 64500), "first", early));
        assert!(!store.insert(key(10, 16, 24, 64500), "second", late));
        assert_eq!(store.len(), 1);

        let vrp = store.iter().next().unwrap();
        assert_eq!(vrp.tal(), "first");
        assert_eq!(vrp.expires(), late);

        // A lower expiry leaves the stored one alone.
        assert!(!store.insert(key(10, 16, 24, 64500), "third", early));
        assert_eq!(store.iter().next().unwrap().expires(), late);
    }

    #[test]
    fn iteration_order() {
        let mut store = VrpStore::new();
        let t = Time::from_timestamp(0).unwrap();
        store.insert(key(20, 16, 24, 1), "t", t);
        store.insert(key(10, 16, 24, 2), "t", t);
        store.insert(key(10, 16, 24, 1), "t", t);
        store.insert(key(10, 16, 16, 9), "t", t);
        store.insert(key(10, 8, 16, 9), "t", t);

        let keys: Vec<_> = store.iter().map(|vrp| *vrp.key()).collect();
        // Address bytes dominate, then prefixlen, then maxlen, then asid.
        assert_eq!(keys[0], key(10, 8, 16, 9));
        assert_eq!(keys[1], key(10, 16, 16, 9));
        assert_eq!(keys[2], key(10, 16, 24, 1));
        assert_eq!(keys[3], key(10, 16, 24, 2));
        assert_eq!(keys[4], key(20, 16, 24, 1));
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn v4_orders_before_v6() {
        let mut store = VrpStore::new();
        let t = Time::from_timestamp(0).unwrap();
        let v6 = VrpKey::new(
            Afi::V6, Addr::new([0x20, 0x01, 0, 0, 0, 0, 0, 0,
                                0, 0, 0, 0, 0, 0, 0, 0], 32),
            32, 1
        );
        store.insert(v6, "t", t);
        store.insert(key(250, 8, 8, 1), "t", t);
        let keys: Vec<_> = store.iter().map(|vrp| *vrp.key()).collect();
        assert_eq!(keys[0].afi(), Afi::V4);
        assert_eq!(keys[1].afi(), Afi::V6);
    }
}
