//! Digests, keys, and signatures.
//!
//! RPKI limits itself to exactly one digest algorithm (SHA-256, RFC 7935)
//! and one key flavor (2048 bit RSA), so the algorithm types in here are
//! zero-sized markers that only check the DER encoding names the right
//! thing. Actual digest and verification work is done by ring.

use std::{fmt, io, str};
use std::convert::TryFrom;
use std::str::FromStr;
use bcder::{decode, encode};
use bcder::{BitString, Captured, Mode, OctetString, Tag};
use bcder::decode::{Content, DecodeError, Source};
use bcder::encode::PrimitiveContent;
use bytes::Bytes;
use ring::digest;
use ring::signature::VerificationAlgorithm;
use untrusted::Input;
use crate::oid;

pub use ring::digest::Digest;


//------------ DigestAlgorithm -----------------------------------------------

/// The digest algorithm used by RPKI: SHA-256 and nothing else.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct DigestAlgorithm(());

impl DigestAlgorithm {
    pub fn sha256() -> Self {
        DigestAlgorithm(())
    }

    pub fn digest_len(self) -> usize {
        32
    }

    /// Returns the digest of `data` using this algorithm.
    pub fn digest(self, data: &[u8]) -> Digest {
        digest::digest(&digest::SHA256, data)
    }

    /// Returns a digest context for multi-step calculation of the digest.
    pub fn start(self) -> DigestContext {
        DigestContext(digest::Context::new(&digest::SHA256))
    }
}

/// # ASN.1 Values
///
/// In certificates and CMS structures the algorithm appears as an
/// `AlgorithmIdentifier` sequence of the `id-sha256` object identifier and
/// absent or NULL parameters.
impl DigestAlgorithm {
    pub fn take_from<S: decode::Source>(
        cons: &mut decode::Constructed<S>
    ) -> Result<Self, DecodeError<S::Error>> {
        cons.take_sequence(Self::from_constructed)
    }

    pub fn take_opt_from<S: decode::Source>(
        cons: &mut decode::Constructed<S>
    ) -> Result<Option<Self>, DecodeError<S::Error>> {
        cons.take_opt_sequence(Self::from_constructed)
    }

    fn from_constructed<S: decode::Source>(
        cons: &mut decode::Constructed<S>
    ) -> Result<Self, DecodeError<S::Error>> {
        oid::SHA256.skip_if(cons)?;
        cons.take_opt_null()?;
        Ok(DigestAlgorithm::default())
    }

    /// Parses a SET OF DigestAlgorithmIdentifiers.
    ///
    /// Section 2.1.2 of RFC 6488 requires the set in the SignedData
    /// container to hold exactly one element.
    pub fn take_set_from<S: decode::Source>(
        cons: &mut decode::Constructed<S>
    ) -> Result<Self, DecodeError<S::Error>> {
        cons.take_set(Self::take_from)
    }

    /// Takes just the algorithm object identifier.
    pub fn take_oid_from<S: decode::Source>(
        cons: &mut decode::Constructed<S>
    ) -> Result<Self, DecodeError<S::Error>> {
        oid::SHA256.skip_if(cons)?;
        Ok(Self::default())
    }
}


//------------ DigestContext -------------------------------------------------

#[derive(Clone)]
pub struct DigestContext(digest::Context);

impl DigestContext {
    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data)
    }

    pub fn finish(self) -> Digest {
        self.0.finish()
    }
}

impl io::Write for DigestContext {
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        Ok(())
    }
}


//------------ SignatureAlgorithm --------------------------------------------

/// The signature algorithm used by RPKI.
///
/// This is RSA PKCS#1 v1.5 with SHA-256. In certificates the identifier is
/// `sha256WithRSAEncryption`; RFC 6488 additionally allows plain
/// `rsaEncryption` in the signatureAlgorithm field of a SignerInfo.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct SignatureAlgorithm(());

impl SignatureAlgorithm {
    /// Takes a signature algorithm identifier as used in X.509.
    pub fn x509_take_from<S: decode::Source>(
        cons: &mut decode::Constructed<S>
    ) -> Result<Self, DecodeError<S::Error>> {
        cons.take_sequence(|cons| {
            oid::SHA256_WITH_RSA_ENCRYPTION.skip_if(cons)?;
            cons.take_opt_null()?;
            Ok(SignatureAlgorithm(()))
        })
    }

    /// Takes a signature algorithm identifier as used in CMS SignerInfo.
    pub fn cms_take_from<S: decode::Source>(
        cons: &mut decode::Constructed<S>
    ) -> Result<Self, DecodeError<S::Error>> {
        cons.take_sequence(|cons| {
            let oid = bcder::Oid::take_from(cons)?;
            if oid != oid::SHA256_WITH_RSA_ENCRYPTION
                && oid != oid::RSA_ENCRYPTION
            {
                return Err(cons.content_err(
                    "invalid signature algorithm"
                ))
            }
            cons.take_opt_null()?;
            Ok(SignatureAlgorithm(()))
        })
    }
}


//------------ Signature -----------------------------------------------------

/// A signature value together with its algorithm.
#[derive(Clone, Debug)]
pub struct Signature {
    algorithm: SignatureAlgorithm,
    value: Bytes,
}

impl Signature {
    pub fn new(algorithm: SignatureAlgorithm, value: Bytes) -> Self {
        Signature { algorithm, value }
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }
}


//------------ PublicKey -----------------------------------------------------

/// A public key in its `SubjectPublicKeyInfo` form.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PublicKey {
    bits: BitString,
}

impl PublicKey {
    pub fn decode<S: decode::IntoSource>(
        source: S
    ) -> Result<Self, DecodeError<<S::Source as Source>::Error>> {
        Mode::Der.decode(source, Self::take_from)
    }

    pub fn take_from<S: decode::Source>(
        cons: &mut decode::Constructed<S>
    ) -> Result<Self, DecodeError<S::Error>> {
        cons.take_sequence(|cons| {
            cons.take_sequence(|cons| {
                oid::RSA_ENCRYPTION.skip_if(cons)?;
                cons.take_opt_null()?;
                Ok(())
            })?;
            Ok(PublicKey {
                bits: BitString::take_from(cons)?
            })
        })
    }

    /// Returns the raw bits of the key.
    pub fn bits(&self) -> &[u8] {
        // The bit string of an RSA key is always a whole number of octets.
        self.bits.octet_slice().unwrap()
    }

    /// Returns the key identifier: the SHA-1 digest over the key bits.
    pub fn key_identifier(&self) -> KeyIdentifier {
        KeyIdentifier::try_from(
            digest::digest(
                &digest::SHA1_FOR_LEGACY_USE_ONLY, self.bits()
            ).as_ref()
        ).unwrap()
    }

    /// Re-encodes the key as its DER `SubjectPublicKeyInfo`.
    pub fn to_info_bytes(&self) -> Bytes {
        let values = encode::sequence((
            encode::sequence((
                oid::RSA_ENCRYPTION.encode(),
                ().encode(),
            )),
            self.bits.encode_ref(),
        ));
        Captured::from_values(Mode::Der, values).into_bytes()
    }

    /// Verifies a signature over `message` with this key.
    pub fn verify(
        &self, message: &[u8], signature: &Signature
    ) -> Result<(), VerificationError> {
        ring::signature::RSA_PKCS1_2048_8192_SHA256.verify(
            Input::from(self.bits()),
            Input::from(message),
            Input::from(signature.value().as_ref())
        ).map_err(|_| VerificationError)
    }
}


//------------ KeyIdentifier -------------------------------------------------

/// A key identifier: the SHA-1 digest of a public key's bits.
///
/// Used both as the subject key identifier of a certificate and, in the
/// authority key identifier extension, as the link to the issuer. All the
/// ordered indexes of the validator are keyed by values of this type.
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd
)]
pub struct KeyIdentifier([u8; 20]);

impl KeyIdentifier {
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_ref()
    }

    /// Takes an encoded key identifier from a constructed value.
    ///
    /// ```text
    /// KeyIdentifier ::= OCTET STRING
    /// ```
    ///
    /// The content of the octet string needs to be a SHA-1 hash, so it must
    /// be exactly 20 octets long.
    pub fn take_from<S: decode::Source>(
        cons: &mut decode::Constructed<S>
    ) -> Result<Self, DecodeError<S::Error>> {
        cons.take_value_if(Tag::OCTET_STRING, Self::from_content)
    }

    pub fn from_content<S: decode::Source>(
        content: &mut Content<S>
    ) -> Result<Self, DecodeError<S::Error>> {
        let octets = OctetString::from_content(content)?;
        if let Some(slice) = octets.as_slice() {
            Self::try_from(slice).map_err(|_| {
                content.content_err("invalid key identifier")
            })
        }
        else if octets.len() != 20 {
            Err(content.content_err("invalid key identifier"))
        }
        else {
            let mut res = KeyIdentifier(Default::default());
            let mut pos = 0;
            for slice in &octets {
                let end = pos + slice.len();
                res.0[pos..end].copy_from_slice(slice);
                pos = end;
            }
            Ok(res)
        }
    }
}


//--- TryFrom and FromStr

impl<'a> TryFrom<&'a [u8]> for KeyIdentifier {
    type Error = RepresentationError;

    fn try_from(value: &'a [u8]) -> Result<Self, Self::Error> {
        TryFrom::try_from(value)
            .map(KeyIdentifier)
            .map_err(|_| RepresentationError)
    }
}

impl FromStr for KeyIdentifier {
    type Err = RepresentationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.len() != 40 || !value.is_ascii() {
            return Err(RepresentationError)
        }
        let mut res = KeyIdentifier(Default::default());
        for (pos, ch) in value.as_bytes().chunks(2).enumerate() {
            let ch = str::from_utf8(ch).map_err(|_| RepresentationError)?;
            res.0[pos] = u8::from_str_radix(ch, 16)
                .map_err(|_| RepresentationError)?;
        }
        Ok(res)
    }
}


//--- AsRef and Display

impl AsRef<[u8]> for KeyIdentifier {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Display for KeyIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for ch in self.0.iter() {
            write!(f, "{:02X}", ch)?
        }
        Ok(())
    }
}


//------------ VerificationError ---------------------------------------------

/// An error happened while verifying a signature.
///
/// No further information is provided. This is on purpose.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VerificationError;

impl fmt::Display for VerificationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("signature verification failed")
    }
}

impl std::error::Error for VerificationError { }


//------------ RepresentationError -------------------------------------------

/// A value cannot be represented as a key identifier.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RepresentationError;

impl fmt::Display for RepresentationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("invalid key identifier representation")
    }
}

impl std::error::Error for RepresentationError { }


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn key_identifier_from_str() {
        let ki = KeyIdentifier::from_str(
            "0123456789abcdef0123456789abcdef01234567"
        ).unwrap();
        assert_eq!(ki.as_slice()[0], 0x01);
        assert_eq!(ki.as_slice()[19], 0x67);
        assert_eq!(
            ki.to_string(),
            "0123456789ABCDEF0123456789ABCDEF01234567"
        );
        assert!(KeyIdentifier::from_str("0123").is_err());
    }

    #[test]
    fn digest_len() {
        let alg = DigestAlgorithm::sha256();
        assert_eq!(alg.digest(b"foo").as_ref().len(), alg.digest_len());
    }
}
