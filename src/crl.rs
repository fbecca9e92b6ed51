//! Certificate revocation lists.
//!
//! CRLs in the RPKI are standard X.509 v2 CRLs (RFC 5280 restricted by
//! RFC 6487). The validator keeps one CRL per issuing CA in an index
//! keyed by the authority key identifier; certificates are checked for
//! revocation by serial number before they are accepted into the
//! authentication tree.

use std::collections::BTreeMap;
use bcder::{decode, Oid, Mode, OctetString, Tag, Unsigned};
use bcder::decode::{DecodeError, IntoSource, Source};
use bytes::Bytes;
use log::warn;
use crate::crypto::{KeyIdentifier, PublicKey};
use crate::oid;
use crate::x509::{SignedData, Time, ValidationError};


//------------ Crl -----------------------------------------------------------

/// A decoded CRL.
#[derive(Clone, Debug)]
pub struct Crl {
    /// The signed portion and signature for verification.
    signed_data: SignedData,

    /// The key identifier of the issuing CA.
    aki: KeyIdentifier,

    this_update: Time,
    next_update: Time,

    /// The revoked serial numbers, raw and sorted for binary search.
    serials: Vec<Bytes>,
}

impl Crl {
    /// Parses a CRL from DER bytes.
    pub fn parse(fname: &str, data: Bytes) -> Result<Self, ValidationError> {
        Self::decode(data).map_err(|err| {
            warn!("{}: {}", fname, err);
            ValidationError
        })
    }

    pub fn decode<S: IntoSource>(
        source: S
    ) -> Result<Self, DecodeError<<S::Source as Source>::Error>> {
        Mode::Der.decode(source, Self::take_from)
    }

    pub fn take_from<S: decode::Source>(
        cons: &mut decode::Constructed<S>
    ) -> Result<Self, DecodeError<S::Error>> {
        cons.take_sequence(|cons| {
            let signed_data = SignedData::take_content_from(cons)?;
            let mut crl = Mode::Der.decode(
                signed_data.data().clone(),
                Self::take_tbs
            ).map_err(DecodeError::convert)?;
            crl.signed_data = signed_data;
            Ok(crl)
        })
    }

    /// Parses the TBSCertList sequence.
    ///
    /// ```text
    /// TBSCertList ::= SEQUENCE {
    ///     version              INTEGER { v2(1) },
    ///     signature            AlgorithmIdentifier,
    ///     issuer               Name,
    ///     thisUpdate           Time,
    ///     nextUpdate           Time OPTIONAL,  -- required by RFC 6487
    ///     revokedCertificates  SEQUENCE OF SEQUENCE {
    ///         userCertificate      CertificateSerialNumber,
    ///         revocationDate       Time,
    ///         crlEntryExtensions   Extensions OPTIONAL } OPTIONAL,
    ///     crlExtensions        [0] EXPLICIT Extensions OPTIONAL }
    /// ```
    fn take_tbs<S: decode::Source>(
        cons: &mut decode::Constructed<S>
    ) -> Result<Self, DecodeError<S::Error>> {
        cons.take_sequence(|cons| {
            cons.skip_u8_if(1)?; // version -- v2 is 1
            cons.skip_one()?;    // signature algorithm
            cons.skip_one()?;    // issuer name
            let this_update = Time::take_from(cons)?;
            let next_update = Time::take_from(cons)?;
            let mut serials = Vec::new();
            cons.take_opt_sequence(|cons| {
                while let Some(()) = cons.take_opt_sequence(|cons| {
                    let serial = Unsigned::take_from(cons)?;
                    serials.push(Bytes::copy_from_slice(serial.as_ref()));
                    Time::take_from(cons)?; // revocationDate
                    cons.skip_all()?;       // crlEntryExtensions
                    Ok(())
                })? { }
                Ok(())
            })?;
            let mut aki = None;
            cons.take_constructed_if(Tag::CTX_0, |cons| {
                cons.take_sequence(|cons| {
                    while let Some(()) = cons.take_opt_sequence(|cons| {
                        let id = Oid::take_from(cons)?;
                        cons.take_opt_bool()?; // critical
                        let value = OctetString::take_from(cons)?;
                        Mode::Der.decode(value, |content| {
                            if id == oid::CE_AUTHORITY_KEY_IDENTIFIER {
                                aki = Some(content.take_sequence(|cons| {
                                    cons.take_value_if(
                                        Tag::CTX_0,
                                        KeyIdentifier::from_content
                                    )
                                })?);
                                Ok(())
                            }
                            else if id == oid::CE_CRL_NUMBER {
                                content.take_u64().map(|_| ())
                            }
                            else {
                                Err(content.content_err(
                                    "unexpected CRL extension"
                                ))
                            }
                        }).map_err(DecodeError::convert)?;
                        Ok(())
                    })? { }
                    Ok(())
                })
            })?;
            serials.sort();
            Ok(Crl {
                signed_data: SignedData::new(
                    Bytes::new(),
                    crate::crypto::Signature::new(
                        Default::default(), Bytes::new()
                    ),
                ),
                aki: aki.ok_or_else(|| {
                    cons.content_err(
                        "missing Authority Key Identifier extension"
                    )
                })?,
                this_update,
                next_update,
                serials,
            })
        })
    }
}

impl Crl {
    pub fn aki(&self) -> KeyIdentifier {
        self.aki
    }

    pub fn this_update(&self) -> Time {
        self.this_update
    }

    pub fn next_update(&self) -> Time {
        self.next_update
    }

    /// Returns whether the given serial number is on the list.
    pub fn contains(&self, serial: &[u8]) -> bool {
        self.serials.binary_search_by(|s| {
            s.as_ref().cmp(serial)
        }).is_ok()
    }

    /// Verifies the CRL's signature against the issuer's key.
    pub fn verify_signature(
        &self, public_key: &PublicKey
    ) -> Result<(), ValidationError> {
        self.signed_data.verify_signature(public_key)
    }
}


/// # Wire format
///
impl Crl {
    pub fn compose(&self, buf: &mut crate::ipc::IoBuf) {
        buf.buf(self.signed_data.data().as_ref());
        buf.buf(self.signed_data.signature().value().as_ref());
        buf.simple_bytes(self.aki.as_slice());
        buf.simple_i64(self.this_update.timestamp());
        buf.simple_i64(self.next_update.timestamp());
        buf.simple_u32(self.serials.len() as u32);
        for serial in &self.serials {
            buf.buf(serial.as_ref());
        }
    }

    pub fn parse_frame(
        frame: &mut crate::ipc::Frame
    ) -> std::io::Result<Self> {
        use std::convert::TryFrom;

        fn bad(msg: &'static str) -> std::io::Error {
            std::io::Error::new(std::io::ErrorKind::InvalidData, msg)
        }

        let data = frame.take_buf()?;
        let sig = frame.take_buf()?;
        let aki = frame.take_bytes(20)?;
        let aki = KeyIdentifier::try_from(aki.as_ref())
            .map_err(|_| bad("invalid key identifier"))?;
        let this_update = Time::from_timestamp(frame.take_i64()?)
            .map_err(|_| bad("invalid timestamp"))?;
        let next_update = Time::from_timestamp(frame.take_i64()?)
            .map_err(|_| bad("invalid timestamp"))?;
        let count = frame.take_u32()?;
        let mut serials = Vec::with_capacity(count as usize);
        for _ in 0..count {
            serials.push(frame.take_buf()?);
        }
        serials.sort();
        Ok(Crl {
            signed_data: SignedData::new(
                data,
                crate::crypto::Signature::new(Default::default(), sig),
            ),
            aki,
            this_update,
            next_update,
            serials,
        })
    }
}


//------------ CrlTree -------------------------------------------------------

/// The CRLs of all CAs seen so far, keyed by authority key identifier.
#[derive(Debug, Default)]
pub struct CrlTree(BTreeMap<KeyIdentifier, Crl>);

impl CrlTree {
    pub fn new() -> Self {
        CrlTree(BTreeMap::new())
    }

    /// Inserts a CRL, replacing an earlier one for the same issuer.
    pub fn insert(&mut self, crl: Crl) {
        self.0.insert(crl.aki(), crl);
    }

    pub fn get(&self, aki: KeyIdentifier) -> Option<&Crl> {
        self.0.get(&aki)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns whether a certificate with `serial` issued by the CA with
    /// key `aki` has been revoked.
    ///
    /// An absent CRL means we cannot tell; the caller decides whether
    /// that is acceptable.
    pub fn is_revoked(&self, aki: KeyIdentifier, serial: &[u8]) -> bool {
        self.get(aki).map_or(false, |crl| crl.contains(serial))
    }
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::convert::TryFrom;

    fn ki(byte: u8) -> KeyIdentifier {
        KeyIdentifier::try_from([byte; 20].as_ref()).unwrap()
    }

    fn make_crl(aki: KeyIdentifier, serials: Vec<&'static [u8]>) -> Crl {
        let mut serials: Vec<Bytes> =
            serials.into_iter().map(Bytes::from_static).collect();
        serials.sort();
        Crl {
            signed_data: SignedData::new(
                Bytes::new(),
                crate::crypto::Signature::new(
                    Default::default(), Bytes::new()
                ),
            ),
            aki,
            this_update: Time::from_timestamp(0).unwrap(),
            next_update: Time::from_timestamp(1).unwrap(),
            serials,
        }
    }

    #[test]
    fn contains_serial() {
        let crl = make_crl(ki(1), vec![&[5], &[1, 0], &[2]]);
        assert!(crl.contains(&[5]));
        assert!(crl.contains(&[1, 0]));
        assert!(!crl.contains(&[1]));
    }

    #[test]
    fn tree_replaces_and_looks_up() {
        let mut tree = CrlTree::new();
        tree.insert(make_crl(ki(1), vec![&[7]]));
        tree.insert(make_crl(ki(2), vec![]));
        assert!(tree.is_revoked(ki(1), &[7]));
        assert!(!tree.is_revoked(ki(2), &[7]));
        // Unknown issuer: cannot tell, treated as not revoked.
        assert!(!tree.is_revoked(ki(3), &[7]));
        // A newer CRL for the same issuer replaces the older one.
        tree.insert(make_crl(ki(1), vec![]));
        assert_eq!(tree.len(), 2);
        assert!(!tree.is_revoked(ki(1), &[7]));
    }
}
