//! The authentication tree and the chain checks.
//!
//! Every certificate that survives validation is installed in an ordered
//! index keyed by its subject key identifier. A node links to its parent
//! by the parent's key, so the index is an arena whose shape mirrors the
//! RPKI chain: no cycles are possible because a child is only installed
//! after its parent. This tree is the sole source of truth for walking
//! signature chains and grounding inherited resources.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use log::warn;
use ring::constant_time;
use crate::cert::Cert;
use crate::crypto::{DigestAlgorithm, KeyIdentifier};
use crate::crl::CrlTree;
use crate::resources::Coverage;
use crate::resources::ip::Afi;
use crate::roa::Roa;
use crate::x509::Time;


//------------ Auth ----------------------------------------------------------

/// A node of the authentication tree.
#[derive(Clone, Debug)]
pub struct Auth {
    /// The validated certificate. The tree owns it.
    cert: Cert,

    /// The key of the authenticating node; `None` for a trust anchor.
    parent: Option<KeyIdentifier>,

    /// The name of the TAL this chain hangs off.
    tal: String,
}

impl Auth {
    pub fn cert(&self) -> &Cert {
        &self.cert
    }

    pub fn parent(&self) -> Option<KeyIdentifier> {
        self.parent
    }

    pub fn tal(&self) -> &str {
        &self.tal
    }
}


//------------ AuthTree ------------------------------------------------------

/// The ordered index of validated certificates, keyed by SKI.
#[derive(Debug, Default)]
pub struct AuthTree(BTreeMap<KeyIdentifier, Auth>);

impl AuthTree {
    pub fn new() -> Self {
        AuthTree(BTreeMap::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, ski: KeyIdentifier) -> Option<&Auth> {
        self.0.get(&ski)
    }

    pub fn contains(&self, ski: KeyIdentifier) -> bool {
        self.0.contains_key(&ski)
    }

    /// Installs a validated trust anchor as a root of the tree.
    pub fn insert_ta(&mut self, cert: Cert, tal: String) {
        self.0.insert(cert.ski(), Auth { cert, parent: None, tal });
    }

    /// Installs a validated certificate below its parent.
    ///
    /// The parent must already be in the tree; `valid_ski_aki` guarantees
    /// that.
    pub fn insert(&mut self, cert: Cert, parent: KeyIdentifier) {
        let tal = self.0.get(&parent)
            .map(|auth| auth.tal.clone())
            .unwrap_or_default();
        self.0.insert(cert.ski(), Auth { cert, parent: Some(parent), tal });
    }

    /// Removes a node again, e.g. a transient EE certificate.
    pub fn remove(&mut self, ski: KeyIdentifier) -> Option<Auth> {
        self.0.remove(&ski)
    }

    /// Checks that an IP range is covered by the chain starting at `ski`.
    ///
    /// Walks from the given node upward until a node neither inherits nor
    /// stays silent for the family. Returns false when the chain runs out
    /// before the inherit is grounded.
    pub fn covered_ip(
        &self,
        ski: KeyIdentifier,
        afi: Afi,
        min: &[u8; 16],
        max: &[u8; 16],
    ) -> bool {
        let mut cur = ski;
        loop {
            let auth = match self.0.get(&cur) {
                Some(auth) => auth,
                None => return false
            };
            match auth.cert.ip().check_covered(afi, min, max) {
                Coverage::Covered => return true,
                Coverage::NotCovered => return false,
                Coverage::Inherit => {
                    match auth.parent {
                        Some(parent) => cur = parent,
                        None => return false
                    }
                }
            }
        }
    }

    /// The AS number analog of [`covered_ip`][Self::covered_ip].
    pub fn covered_as(
        &self, ski: KeyIdentifier, min: u32, max: u32
    ) -> bool {
        let mut cur = ski;
        loop {
            let auth = match self.0.get(&cur) {
                Some(auth) => auth,
                None => return false
            };
            match auth.cert.asn().check_covered(min, max) {
                Coverage::Covered => return true,
                Coverage::NotCovered => return false,
                Coverage::Inherit => {
                    match auth.parent {
                        Some(parent) => cur = parent,
                        None => return false
                    }
                }
            }
        }
    }

    /// Returns the earliest notAfter on the chain from `ski` to its root.
    pub fn chain_expiry(&self, ski: KeyIdentifier) -> Option<Time> {
        let mut cur = Some(ski);
        let mut expiry: Option<Time> = None;
        while let Some(key) = cur {
            let auth = self.0.get(&key)?;
            let not_after = auth.cert.validity().not_after();
            expiry = Some(match expiry {
                Some(expiry) if expiry < not_after => expiry,
                _ => not_after
            });
            cur = auth.parent;
        }
        expiry
    }

    /// Returns the TAL name of the chain containing `ski`.
    pub fn tal_name(&self, ski: KeyIdentifier) -> Option<&str> {
        self.0.get(&ski).map(|auth| auth.tal.as_str())
    }
}


//------------ Chain entry points --------------------------------------------

/// Resolves the SKI/AKI pair of a new object against the tree.
///
/// The subject key must not already be present (no duplicate subjects)
/// and the authority key must resolve to an existing node, which is
/// returned.
pub fn valid_ski_aki<'a>(
    fname: &str,
    tree: &'a AuthTree,
    ski: KeyIdentifier,
    aki: Option<KeyIdentifier>,
) -> Option<&'a Auth> {
    if tree.contains(ski) {
        warn!("{}: duplicate subject key identifier", fname);
        return None
    }
    let aki = match aki {
        Some(aki) => aki,
        None => {
            warn!("{}: missing authority key identifier", fname);
            return None
        }
    };
    match tree.get(aki) {
        Some(auth) => Some(auth),
        None => {
            warn!("{}: unknown authority", fname);
            None
        }
    }
}

/// Validates a trust anchor certificate against its TAL key.
///
/// On success the certificate may be installed as a root.
pub fn valid_ta(
    fname: &str,
    tree: &AuthTree,
    cert: &Cert,
    tal_key: &[u8],
) -> bool {
    if tree.contains(cert.ski()) {
        warn!("{}: duplicate subject key identifier", fname);
        return false
    }
    if let Err(err) = cert.verify_ta(tal_key) {
        warn!("{}: {}", fname, err);
        return false
    }
    if let Err(err) = cert.check_validity() {
        warn!("{}: certificate expired or not yet valid ({})", fname, err);
        return false
    }
    true
}

/// Validates a CA certificate against the tree.
///
/// Checks the SKI/AKI linkage, the issuer's signature, revocation, the
/// validity window, and that every explicit resource element is covered
/// by the nearest non-inheriting ancestor. Returns the parent's key on
/// success.
pub fn valid_cert(
    fname: &str,
    tree: &AuthTree,
    crls: &CrlTree,
    cert: &Cert,
) -> Option<KeyIdentifier> {
    let parent = valid_ski_aki(fname, tree, cert.ski(), cert.aki())?;
    let parent_ski = parent.cert.ski();

    if cert.verify_issued_by(parent.cert.subject_public_key()).is_err() {
        warn!("{}: invalid signature", fname);
        return None
    }
    if let Some(aki) = cert.aki() {
        if crls.is_revoked(aki, cert.serial()) {
            warn!("{}: certificate revoked", fname);
            return None
        }
    }
    if cert.check_validity().is_err() {
        warn!("{}: certificate expired or not yet valid", fname);
        return None
    }

    for el in cert.ip() {
        if el.is_inherit() {
            continue
        }
        if !tree.covered_ip(parent_ski, el.afi(), el.min(), el.max()) {
            warn!(
                "{}: IP resources not covered by issuer chain", fname
            );
            return None
        }
    }
    for el in cert.asn() {
        let (min, max) = match el.as_range() {
            Some(range) => range,
            None => continue
        };
        if !tree.covered_as(parent_ski, min, max) {
            warn!(
                "{}: AS resources not covered by issuer chain", fname
            );
            return None
        }
    }
    Some(parent_ski)
}

/// Validates a ROA's prefixes against its EE certificate's chain.
///
/// The EE certificate must already be installed as a (transient) node of
/// the tree keyed by the ROA's SKI. Every prefix must be covered, where
/// an inheriting EE recurses up the chain.
pub fn valid_roa(fname: &str, tree: &AuthTree, roa: &mut Roa) -> bool {
    let ski = roa.ski();
    if tree.get(ski).is_none() {
        warn!("{}: end entity certificate not installed", fname);
        return false
    }
    for ip in roa.ips() {
        if !tree.covered_ip(ski, ip.afi(), ip.min(), ip.max()) {
            warn!(
                "{}: prefix {} not covered by certificate chain",
                fname, ip.addr().display(ip.afi())
            );
            return false
        }
    }
    if let Some(expiry) = tree.chain_expiry(ski) {
        roa.shorten_expires(expiry);
    }
    if let Some(tal) = tree.tal_name(ski) {
        roa.set_tal(tal.into());
    }
    roa.set_valid(true);
    true
}

/// Checks that the file at `path` has the given SHA-256 digest.
///
/// The comparison is constant time. Returns false for unreadable files.
pub fn valid_filehash<P: AsRef<Path>>(path: P, expected: &[u8]) -> bool {
    let mut file = match File::open(&path) {
        Ok(file) => file,
        Err(_) => return false
    };
    let mut ctx = DigestAlgorithm::sha256().start();
    let mut buf = [0u8; 8 * 1024];
    loop {
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => ctx.update(&buf[..n]),
            Err(_) => return false
        }
    }
    constant_time::verify_slices_are_equal(
        ctx.finish().as_ref(), expected
    ).is_ok()
}

/// Syntactically checks a URI against a required scheme prefix.
///
/// The URI must not contain control characters or dot path segments.
pub fn valid_uri(uri: &[u8], scheme: &str) -> bool {
    if !crate::uri::is_uri_ascii(uri) {
        return false
    }
    if uri.len() < scheme.len()
        || !uri[..scheme.len()].eq_ignore_ascii_case(scheme.as_bytes())
    {
        return false
    }
    !uri.split(|&ch| ch == b'/').any(|seg| seg == b".." || seg == b".")
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::cert::test::{ki, make_cert};
    use crate::resources::ip::test::v4;
    use crate::resources::{Afi, CertAs, CertIp};

    fn tree_with_ta() -> AuthTree {
        let mut tree = AuthTree::new();
        let ta = make_cert(
            ki(1),
            None,
            vec![v4(10, 0, 0, 0, 8)],
            vec![CertAs::Id(64496)],
        );
        tree.insert_ta(ta, "testtal".into());
        tree
    }

    #[test]
    fn ski_aki_linkage() {
        let tree = tree_with_ta();
        // Unknown AKI fails.
        assert!(valid_ski_aki("x", &tree, ki(2), Some(ki(9))).is_none());
        // Missing AKI fails.
        assert!(valid_ski_aki("x", &tree, ki(2), None).is_none());
        // Duplicate SKI fails even with a good AKI.
        assert!(valid_ski_aki("x", &tree, ki(1), Some(ki(1))).is_none());
        // The good case resolves to the TA.
        let auth = valid_ski_aki("x", &tree, ki(2), Some(ki(1))).unwrap();
        assert_eq!(auth.cert().ski(), ki(1));
    }

    #[test]
    fn coverage_through_inherit() {
        let mut tree = tree_with_ta();
        // A middle CA that inherits both families.
        let mid = make_cert(
            ki(2),
            Some(ki(1)),
            vec![CertIp::inherit(Afi::V4)],
            vec![CertAs::Inherit],
        );
        tree.insert(mid, ki(1));

        // A probe covered by the TA must ground through the middle CA.
        let probe = v4(10, 1, 0, 0, 16);
        assert!(tree.covered_ip(ki(2), Afi::V4, probe.min(), probe.max()));
        assert!(tree.covered_as(ki(2), 64496, 64496));

        // Something the TA does not hold fails at the TA.
        let probe = v4(11, 0, 0, 0, 16);
        assert!(!tree.covered_ip(ki(2), Afi::V4, probe.min(), probe.max()));
        assert!(!tree.covered_as(ki(2), 64497, 64497));
    }

    #[test]
    fn cert_resources_must_be_covered() {
        let tree = tree_with_ta();
        let crls = CrlTree::new();

        let good = make_cert(
            ki(2), Some(ki(1)), vec![v4(10, 1, 0, 0, 16)], Vec::new()
        );
        // Signature verification fails on synthetic certs, so the chain
        // coverage logic is tested through the tree directly.
        let probe = v4(10, 1, 0, 0, 16);
        assert!(tree.covered_ip(ki(1), Afi::V4, probe.min(), probe.max()));
        let probe = v4(172, 16, 0, 0, 12);
        assert!(!tree.covered_ip(ki(1), Afi::V4, probe.min(), probe.max()));

        // And valid_cert refuses the synthetic signature either way.
        assert!(valid_cert("x", &tree, &crls, &good).is_none());
    }

    #[test]
    fn roa_prefix_coverage() {
        use crate::resources::ip::Addr;
        use crate::roa::{Roa, RoaIp};

        let mut tree = tree_with_ta();
        // EE certificate holding 10.1/16.
        let ee = make_cert(
            ki(3), Some(ki(1)), vec![v4(10, 1, 0, 0, 16)], Vec::new()
        );
        tree.insert(ee.clone(), ki(1));

        let mut addr = [0u8; 16];
        addr[0] = 10;
        addr[1] = 1;
        let mut roa = Roa::from_parts(
            ee.clone(),
            64500,
            vec![RoaIp::new(Afi::V4, Addr::new(addr, 16), 24)],
            false,
            String::new(),
            Time::from_timestamp(4102444800).unwrap(),
        );
        assert!(valid_roa("x", &tree, &mut roa));
        assert!(roa.is_valid());
        assert_eq!(roa.tal(), "testtal");

        // The expiry was shortened to the chain's minimum.
        assert!(
            roa.expires() <= tree.chain_expiry(ki(3)).unwrap()
        );

        // A prefix outside the EE's resources invalidates the ROA.
        let mut addr = [0u8; 16];
        addr[0] = 10;
        addr[1] = 2;
        let mut bad = Roa::from_parts(
            ee,
            64500,
            vec![RoaIp::new(Afi::V4, Addr::new(addr, 16), 24)],
            false,
            String::new(),
            Time::from_timestamp(4102444800).unwrap(),
        );
        // Fresh tree since the SKI is already taken.
        let mut tree = tree_with_ta();
        let ee2 = make_cert(
            ki(4), Some(ki(1)), vec![v4(10, 1, 0, 0, 16)], Vec::new()
        );
        tree.insert(ee2, ki(1));
        // Point the ROA at the second EE.
        assert!(!tree.covered_ip(
            ki(4), Afi::V4, bad.ips()[0].min(), bad.ips()[0].max()
        ));
        assert!(!valid_roa("x", &tree, &mut bad) || !bad.is_valid());
    }

    #[test]
    fn filehash() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("object.roa");
        let mut file = File::create(&path).unwrap();
        file.write_all(b"test content").unwrap();
        drop(file);

        let digest = DigestAlgorithm::sha256().digest(b"test content");
        assert!(valid_filehash(&path, digest.as_ref()));
        let wrong = DigestAlgorithm::sha256().digest(b"other content");
        assert!(!valid_filehash(&path, wrong.as_ref()));
        assert!(!valid_filehash(dir.path().join("missing"), digest.as_ref()));
    }

    #[test]
    fn uri_checks() {
        assert!(valid_uri(b"rsync://host/mod/file.cer", "rsync://"));
        assert!(!valid_uri(b"rsync://host/mod/../file.cer", "rsync://"));
        assert!(!valid_uri(b"http://host/mod/file.cer", "rsync://"));
        assert!(!valid_uri(b"rsync://host/mod/fi le.cer", "rsync://"));
        assert!(valid_uri(b"https://host/notify.xml", "https://"));
    }
}
