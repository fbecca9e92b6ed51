//! Resource certificates.
//!
//! Parsing follows RFC 6487: an X.509 certificate with the RFC 3779
//! resource extensions. The parser extracts the handful of attributes the
//! validator needs into a flat structure and keeps the signed portion
//! around for signature verification against the issuer's key. Structural
//! invariants of the resource sets (ordering, disjointness, inherit
//! exclusivity) are enforced while the extension is read, so a certificate
//! that decodes successfully always carries well-formed sets.

use std::io;
use bcder::{decode, BitString, Mode, OctetString, Oid, Tag, Unsigned};
use bcder::decode::{DecodeError, IntoSource, Source};
use bcder::string::Ia5String;
use bytes::Bytes;
use crate::crypto::{KeyIdentifier, PublicKey};
use crate::ipc::{Frame, IoBuf};
use crate::oid;
use crate::resources::ip::CertIp;
use crate::resources::{AsBlocks, IpBlocks};
use crate::uri;
use crate::x509::{update_first, SignedData, ValidationError, Validity};


//------------ Cert ----------------------------------------------------------

/// A parsed resource certificate.
#[derive(Clone, Debug)]
pub struct Cert {
    /// The signed portion and signature for chain verification.
    signed_data: SignedData,

    /// The raw serial number, at most 20 octets, no leading zeros.
    serial: Bytes,

    validity: Validity,
    subject_public_key: PublicKey,

    /// Whether the basic constraints extension marks this a CA.
    basic_ca: bool,

    key_usage: KeyUsage,
    ski: KeyIdentifier,
    aki: Option<KeyIdentifier>,

    /// The location of the issuer's CRL. Absent only for a trust anchor.
    crl: Option<uri::Rsync>,

    /// The issuer's certificate. Absent only for a trust anchor.
    aia: Option<uri::Rsync>,

    /// The CA's publication point. Present on CA certificates.
    repo: Option<uri::Rsync>,

    /// The CA's manifest. Present on CA certificates.
    mft: Option<uri::Rsync>,

    /// The RRDP update notification file, if the CA publishes over RRDP.
    notify: Option<uri::Https>,

    /// The location of the object an EE certificate signs.
    signed_object: Option<uri::Rsync>,

    ip: IpBlocks,
    asn: AsBlocks,

    /// Whether the resources have been validated against the chain.
    valid: bool,
}

impl Cert {
    /// Decodes a certificate from DER bytes.
    pub fn decode<S: IntoSource>(
        source: S
    ) -> Result<Self, DecodeError<<S::Source as Source>::Error>> {
        Mode::Der.decode(source, Self::take_from)
    }

    pub fn take_from<S: decode::Source>(
        cons: &mut decode::Constructed<S>
    ) -> Result<Self, DecodeError<S::Error>> {
        cons.take_sequence(Self::from_constructed)
    }

    pub fn from_constructed<S: decode::Source>(
        cons: &mut decode::Constructed<S>
    ) -> Result<Self, DecodeError<S::Error>> {
        let signed_data = SignedData::take_content_from(cons)?;
        let mut cert = Mode::Der.decode(
            signed_data.data().clone(),
            Self::take_tbs
        ).map_err(DecodeError::convert)?;
        cert.signed_data = signed_data;
        Ok(cert)
    }

    /// Parses the TBSCertificate sequence.
    ///
    /// The result still has a placeholder in `signed_data`.
    fn take_tbs<S: decode::Source>(
        cons: &mut decode::Constructed<S>
    ) -> Result<Self, DecodeError<S::Error>> {
        cons.take_sequence(|cons| {
            // version [0] EXPLICIT Version -- must be v3, i.e., 2.
            cons.take_constructed_if(Tag::CTX_0, |c| c.skip_u8_if(2))?;

            let serial = Unsigned::take_from(cons)?;
            if AsRef::<[u8]>::as_ref(&serial).len() > 20 {
                return Err(cons.content_err("serial number too long"))
            }
            let serial = Bytes::copy_from_slice(serial.as_ref());

            // signature AlgorithmIdentifier -- checked by SignedData
            // against the outer algorithm implicitly; skip here.
            cons.skip_one()?;
            skip_name(cons)?; // issuer
            let validity = Validity::take_from(cons)?;
            skip_name(cons)?; // subject
            let subject_public_key = PublicKey::take_from(cons)?;

            // issuerUniqueID and subjectUniqueID must not be present in
            // resource certificates, so extensions are next.
            let mut basic_ca = None;
            let mut ski = None;
            let mut aki = None;
            let mut key_usage = None;
            let mut crl = None;
            let mut aia = None;
            let mut sia = None;
            let mut policies = false;
            let mut ip = None;
            let mut asn = None;

            cons.take_constructed_if(Tag::CTX_3, |c| c.take_sequence(|cons| {
                while let Some(()) = cons.take_opt_sequence(|cons| {
                    let id = Oid::take_from(cons)?;
                    let critical = cons.take_opt_bool()?.unwrap_or(false);
                    let value = OctetString::take_from(cons)?;
                    Mode::Der.decode(value, |content| {
                        if id == oid::CE_BASIC_CONSTRAINTS {
                            take_basic_constraints(content, &mut basic_ca)
                        }
                        else if id == oid::CE_SUBJECT_KEY_IDENTIFIER {
                            take_subject_key_identifier(content, &mut ski)
                        }
                        else if id == oid::CE_AUTHORITY_KEY_IDENTIFIER {
                            take_authority_key_identifier(content, &mut aki)
                        }
                        else if id == oid::CE_KEY_USAGE {
                            take_key_usage(content, &mut key_usage)
                        }
                        else if id == oid::CE_EXTENDED_KEY_USAGE {
                            // Only ever present on router certificates
                            // which we do not process; skip.
                            content.skip_all()
                        }
                        else if id == oid::CE_CRL_DISTRIBUTION_POINTS {
                            take_crl_distribution_points(content, &mut crl)
                        }
                        else if id == oid::PE_AUTHORITY_INFO_ACCESS {
                            take_authority_info_access(content, &mut aia)
                        }
                        else if id == oid::PE_SUBJECT_INFO_ACCESS {
                            take_subject_info_access(content, &mut sia)
                        }
                        else if id == oid::CE_CERTIFICATE_POLICIES {
                            policies = true;
                            content.skip_all()
                        }
                        else if id == oid::PE_IP_ADDR_BLOCK {
                            take_ip_resources(content, &mut ip)
                        }
                        else if id == oid::PE_AUTONOMOUS_SYS_IDS {
                            take_as_resources(content, &mut asn)
                        }
                        else if critical {
                            Err(content.content_err(
                                "unexpected critical extension"
                            ))
                        }
                        else {
                            // RFC 5280 says we can ignore non-critical
                            // extensions we don't know of.
                            content.skip_all()
                        }
                    }).map_err(DecodeError::convert)?;
                    Ok(())
                })? { }
                Ok(())
            }))?;

            if ip.is_none() && asn.is_none() {
                return Err(cons.content_err(
                    "both AS and IP resources extensions missing"
                ))
            }
            if !policies {
                return Err(cons.content_err(
                    "missing Certificate Policies extension"
                ))
            }
            let sia = sia.unwrap_or_default();
            Ok(Cert {
                signed_data: SignedData::new(
                    Bytes::new(),
                    crate::crypto::Signature::new(
                        Default::default(), Bytes::new()
                    ),
                ),
                serial,
                validity,
                subject_public_key,
                basic_ca: basic_ca.unwrap_or(false),
                key_usage: key_usage.ok_or_else(|| {
                    cons.content_err("missing Key Usage extension")
                })?,
                ski: ski.ok_or_else(|| {
                    cons.content_err(
                        "missing Subject Key Identifier extension"
                    )
                })?,
                aki,
                crl,
                aia,
                repo: sia.ca_repository,
                mft: sia.rpki_manifest,
                notify: sia.rpki_notify,
                signed_object: sia.signed_object,
                ip: ip.unwrap_or_default(),
                asn: asn.unwrap_or_default(),
                valid: false,
            })
        })
    }
}

/// # Access to the data
///
impl Cert {
    pub fn serial(&self) -> &Bytes {
        &self.serial
    }

    pub fn validity(&self) -> Validity {
        self.validity
    }

    pub fn subject_public_key(&self) -> &PublicKey {
        &self.subject_public_key
    }

    pub fn is_ca(&self) -> bool {
        self.basic_ca && matches!(self.key_usage, KeyUsage::Ca)
    }

    pub fn is_ee(&self) -> bool {
        !self.basic_ca && matches!(self.key_usage, KeyUsage::Ee)
    }

    pub fn ski(&self) -> KeyIdentifier {
        self.ski
    }

    pub fn aki(&self) -> Option<KeyIdentifier> {
        self.aki
    }

    pub fn crl(&self) -> Option<&uri::Rsync> {
        self.crl.as_ref()
    }

    pub fn aia(&self) -> Option<&uri::Rsync> {
        self.aia.as_ref()
    }

    pub fn repo(&self) -> Option<&uri::Rsync> {
        self.repo.as_ref()
    }

    pub fn mft(&self) -> Option<&uri::Rsync> {
        self.mft.as_ref()
    }

    pub fn notify(&self) -> Option<&uri::Https> {
        self.notify.as_ref()
    }

    pub fn signed_object(&self) -> Option<&uri::Rsync> {
        self.signed_object.as_ref()
    }

    pub fn ip(&self) -> &IpBlocks {
        &self.ip
    }

    pub fn asn(&self) -> &AsBlocks {
        &self.asn
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn set_valid(&mut self, valid: bool) {
        self.valid = valid
    }

    pub fn signed_data(&self) -> &SignedData {
        &self.signed_data
    }
}

/// # Validation primitives
///
impl Cert {
    /// Checks the time constraints against the wall clock.
    pub fn check_validity(&self) -> Result<(), ValidationError> {
        self.validity.validate()
    }

    /// Verifies that this certificate was signed with `issuer_key`.
    pub fn verify_issued_by(
        &self, issuer_key: &PublicKey
    ) -> Result<(), ValidationError> {
        self.signed_data.verify_signature(issuer_key)
    }

    /// Performs the structural checks specific to a trust anchor.
    ///
    /// The subject key must equal the key asserted by the TAL, the
    /// certificate must be a self-signed CA certificate, and neither
    /// family may inherit since there is nothing to inherit from.
    pub fn verify_ta(
        &self, tal_key: &[u8]
    ) -> Result<(), ValidationError> {
        if self.subject_public_key.to_info_bytes() != tal_key {
            return Err(ValidationError)
        }
        if !self.is_ca() {
            return Err(ValidationError)
        }
        if let Some(aki) = self.aki {
            if aki != self.ski {
                return Err(ValidationError)
            }
        }
        if self.aia.is_some() {
            return Err(ValidationError)
        }
        if self.ip.iter().any(|el| el.is_inherit())
            || self.asn.is_inherit()
        {
            return Err(ValidationError)
        }
        self.signed_data.verify_signature(&self.subject_public_key)
    }
}


/// # Wire format
///
/// Certificates cross the channel between parser and orchestrator field
/// by field; the serialization is exhaustive so the receiving side ends
/// up with a bit-for-bit identical value.
impl Cert {
    pub fn compose(&self, buf: &mut IoBuf) {
        buf.buf(self.signed_data.data().as_ref());
        buf.buf(self.signed_data.signature().value().as_ref());
        buf.buf(self.serial.as_ref());
        buf.simple_i64(self.validity.not_before().timestamp());
        buf.simple_i64(self.validity.not_after().timestamp());
        buf.buf(self.subject_public_key.to_info_bytes().as_ref());
        buf.simple_bool(self.basic_ca);
        buf.simple_u8(self.key_usage.to_u8());
        buf.simple_bytes(self.ski.as_slice());
        match self.aki {
            Some(aki) => {
                buf.simple_bool(true);
                buf.simple_bytes(aki.as_slice());
            }
            None => buf.simple_bool(false)
        }
        compose_opt_uri(buf, self.crl.as_ref().map(|u| u.to_string()));
        compose_opt_uri(buf, self.aia.as_ref().map(|u| u.to_string()));
        compose_opt_uri(buf, self.repo.as_ref().map(|u| u.to_string()));
        compose_opt_uri(buf, self.mft.as_ref().map(|u| u.to_string()));
        compose_opt_uri(buf, self.notify.as_ref().map(|u| u.to_string()));
        compose_opt_uri(
            buf, self.signed_object.as_ref().map(|u| u.to_string())
        );
        buf.simple_u32(self.ip.len() as u32);
        for el in &self.ip {
            compose_cert_ip(buf, el);
        }
        buf.simple_u32(self.asn.len() as u32);
        for el in &self.asn {
            compose_cert_as(buf, el);
        }
        buf.simple_bool(self.valid);
    }

    pub fn parse_frame(frame: &mut Frame) -> io::Result<Self> {
        let tbs = frame.take_buf()?;
        let sig = frame.take_buf()?;
        let serial = frame.take_buf()?;
        let not_before = take_time(frame)?;
        let not_after = take_time(frame)?;
        let spki = frame.take_buf()?;
        let subject_public_key = PublicKey::decode(spki.as_ref())
            .map_err(|_| bad_data("invalid public key"))?;
        let basic_ca = frame.take_bool()?;
        let key_usage = KeyUsage::from_u8(frame.take_u8()?)
            .ok_or_else(|| bad_data("invalid key usage"))?;
        let ski = take_key_id(frame)?;
        let aki = if frame.take_bool()? {
            Some(take_key_id(frame)?)
        }
        else {
            None
        };
        let crl = take_opt_rsync(frame)?;
        let aia = take_opt_rsync(frame)?;
        let repo = take_opt_rsync(frame)?;
        let mft = take_opt_rsync(frame)?;
        let notify = take_opt_https(frame)?;
        let signed_object = take_opt_rsync(frame)?;
        let mut ip = IpBlocks::empty();
        for _ in 0..frame.take_u32()? {
            ip.push(take_cert_ip(frame)?)
                .map_err(|_| bad_data("invalid IP resources"))?;
        }
        let mut asn = AsBlocks::empty();
        for _ in 0..frame.take_u32()? {
            asn.push(take_cert_as(frame)?)
                .map_err(|_| bad_data("invalid AS resources"))?;
        }
        let valid = frame.take_bool()?;
        Ok(Cert {
            signed_data: SignedData::new(
                tbs,
                crate::crypto::Signature::new(Default::default(), sig),
            ),
            serial,
            validity: Validity::new(not_before, not_after),
            subject_public_key,
            basic_ca,
            key_usage,
            ski,
            aki,
            crl,
            aia,
            repo,
            mft,
            notify,
            signed_object,
            ip,
            asn,
            valid,
        })
    }
}

fn bad_data(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn take_time(frame: &mut Frame) -> io::Result<crate::x509::Time> {
    crate::x509::Time::from_timestamp(frame.take_i64()?)
        .map_err(|_| bad_data("invalid timestamp"))
}

fn take_key_id(frame: &mut Frame) -> io::Result<KeyIdentifier> {
    use std::convert::TryFrom;

    let bytes = frame.take_bytes(20)?;
    KeyIdentifier::try_from(bytes.as_ref())
        .map_err(|_| bad_data("invalid key identifier"))
}

fn compose_opt_uri(buf: &mut IoBuf, uri: Option<String>) {
    buf.opt_str(uri.as_deref())
}

fn take_opt_rsync(frame: &mut Frame) -> io::Result<Option<uri::Rsync>> {
    match frame.take_opt_str()? {
        Some(s) => uri::Rsync::from_string(s)
            .map(Some)
            .map_err(|_| bad_data("invalid rsync URI")),
        None => Ok(None)
    }
}

fn take_opt_https(frame: &mut Frame) -> io::Result<Option<uri::Https>> {
    match frame.take_opt_str()? {
        Some(s) => uri::Https::from_string(s)
            .map(Some)
            .map_err(|_| bad_data("invalid https URI")),
        None => Ok(None)
    }
}

fn compose_cert_ip(buf: &mut IoBuf, el: &CertIp) {
    use crate::resources::ip::CertIpKind;

    buf.simple_u8(el.afi().to_u16() as u8);
    match el.kind() {
        CertIpKind::Prefix(addr) => {
            buf.simple_u8(0);
            buf.simple_bytes(addr.bytes());
            buf.simple_u8(addr.prefixlen());
        }
        CertIpKind::Range(range) => {
            buf.simple_u8(1);
            buf.simple_bytes(range.min.bytes());
            buf.simple_u8(range.min.prefixlen());
            buf.simple_bytes(range.max.bytes());
            buf.simple_u8(range.max.prefixlen());
        }
        CertIpKind::Inherit => buf.simple_u8(2),
    }
}

fn take_cert_ip(frame: &mut Frame) -> io::Result<CertIp> {
    use crate::resources::ip::{AddrRange, Afi};

    let afi = Afi::from_u16(frame.take_u8()? as u16)
        .ok_or_else(|| bad_data("invalid AFI"))?;
    match frame.take_u8()? {
        0 => {
            let addr = take_addr(frame)?;
            Ok(CertIp::prefix(afi, addr))
        }
        1 => {
            let min = take_addr(frame)?;
            let max = take_addr(frame)?;
            Ok(CertIp::range(afi, AddrRange { min, max }))
        }
        2 => Ok(CertIp::inherit(afi)),
        _ => Err(bad_data("invalid IP element kind"))
    }
}

fn take_addr(frame: &mut Frame) -> io::Result<crate::resources::ip::Addr> {
    let bytes = frame.take_bytes(16)?;
    let mut addr = [0u8; 16];
    addr.copy_from_slice(bytes.as_ref());
    let prefixlen = frame.take_u8()?;
    if prefixlen > 128 {
        return Err(bad_data("invalid prefix length"))
    }
    Ok(crate::resources::ip::Addr::new(addr, prefixlen))
}

fn compose_cert_as(buf: &mut IoBuf, el: &crate::resources::CertAs) {
    use crate::resources::CertAs;

    match *el {
        CertAs::Id(id) => {
            buf.simple_u8(0);
            buf.simple_u32(id);
        }
        CertAs::Range { min, max } => {
            buf.simple_u8(1);
            buf.simple_u32(min);
            buf.simple_u32(max);
        }
        CertAs::Inherit => buf.simple_u8(2),
    }
}

fn take_cert_as(
    frame: &mut Frame
) -> io::Result<crate::resources::CertAs> {
    use crate::resources::CertAs;

    match frame.take_u8()? {
        0 => Ok(CertAs::Id(frame.take_u32()?)),
        1 => {
            let min = frame.take_u32()?;
            let max = frame.take_u32()?;
            if min > max {
                return Err(bad_data("inverted AS range"))
            }
            Ok(CertAs::Range { min, max })
        }
        2 => Ok(CertAs::Inherit),
        _ => Err(bad_data("invalid AS element kind"))
    }
}


//------------ KeyUsage ------------------------------------------------------

/// The allowed key usages of a resource certificate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyUsage {
    /// The certificate may sign certificates and CRLs.
    Ca,

    /// The certificate may sign anything else.
    Ee,
}

impl KeyUsage {
    pub fn to_u8(self) -> u8 {
        match self {
            KeyUsage::Ca => 0,
            KeyUsage::Ee => 1,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(KeyUsage::Ca),
            1 => Some(KeyUsage::Ee),
            _ => None
        }
    }
}


//------------ Extension parsing ---------------------------------------------

/// Skips over an X.501 Name.
fn skip_name<S: decode::Source>(
    cons: &mut decode::Constructed<S>
) -> Result<(), DecodeError<S::Error>> {
    if cons.skip_one()?.is_none() {
        Err(cons.content_err("missing name"))
    }
    else {
        Ok(())
    }
}

/// Parses the Basic Constraints extension.
///
/// ```text
/// BasicConstraints ::= SEQUENCE {
///     cA                  BOOLEAN DEFAULT FALSE,
///     pathLenConstraint   INTEGER (0..MAX) OPTIONAL }
/// ```
///
/// The pathLenConstraint field must not be present in RPKI.
fn take_basic_constraints<S: decode::Source>(
    cons: &mut decode::Constructed<S>,
    basic_ca: &mut Option<bool>,
) -> Result<(), DecodeError<S::Error>> {
    if basic_ca.is_some() {
        return Err(cons.content_err(
            "duplicate Basic Constraints extension"
        ))
    }
    cons.take_sequence(|cons| {
        *basic_ca = Some(cons.take_opt_bool()?.unwrap_or(false));
        if cons.take_opt_u64()?.is_some() {
            Err(cons.content_err(
                "pathLenConstraint in Basic Constraints extension"
            ))
        }
        else {
            Ok(())
        }
    })
}

/// Parses the Subject Key Identifier extension.
fn take_subject_key_identifier<S: decode::Source>(
    cons: &mut decode::Constructed<S>,
    ski: &mut Option<KeyIdentifier>,
) -> Result<(), DecodeError<S::Error>> {
    if ski.is_some() {
        return Err(cons.content_err(
            "duplicate Subject Key Identifier extension"
        ))
    }
    *ski = Some(KeyIdentifier::take_from(cons)?);
    Ok(())
}

/// Parses the Authority Key Identifier extension.
///
/// ```text
/// AuthorityKeyIdentifier ::= SEQUENCE {
///   keyIdentifier             [0] KeyIdentifier           OPTIONAL,
///   authorityCertIssuer       [1] GeneralNames            OPTIONAL,
///   authorityCertSerialNumber [2] CertificateSerialNumber OPTIONAL }
/// ```
///
/// Only the keyIdentifier field may be present.
fn take_authority_key_identifier<S: decode::Source>(
    cons: &mut decode::Constructed<S>,
    aki: &mut Option<KeyIdentifier>,
) -> Result<(), DecodeError<S::Error>> {
    if aki.is_some() {
        return Err(cons.content_err(
            "duplicate Authority Key Identifier extension"
        ))
    }
    *aki = Some(cons.take_sequence(|cons| {
        cons.take_value_if(Tag::CTX_0, KeyIdentifier::from_content)
    })?);
    Ok(())
}

/// Parses the Key Usage extension.
///
/// In CA certificates keyCertSign and cRLSign must be set, in EE
/// certificates digitalSignature must be set.
fn take_key_usage<S: decode::Source>(
    cons: &mut decode::Constructed<S>,
    key_usage: &mut Option<KeyUsage>,
) -> Result<(), DecodeError<S::Error>> {
    if key_usage.is_some() {
        return Err(cons.content_err("duplicate Key Usage extension"))
    }
    let bits = BitString::take_from(cons)?;
    *key_usage = Some(
        if bits.bit(5) && bits.bit(6) {
            KeyUsage::Ca
        }
        else if bits.bit(0) {
            KeyUsage::Ee
        }
        else {
            return Err(cons.content_err("invalid Key Usage"))
        }
    );
    Ok(())
}

/// Parses the CRL Distribution Points extension.
///
/// Exactly one distribution point with only the fullName choice of one or
/// more URIs; the first rsync URI wins.
fn take_crl_distribution_points<S: decode::Source>(
    cons: &mut decode::Constructed<S>,
    crl: &mut Option<uri::Rsync>,
) -> Result<(), DecodeError<S::Error>> {
    if crl.is_some() {
        return Err(cons.content_err(
            "duplicate CRL Distribution Points extension"
        ))
    }
    *crl = Some(
        cons.take_sequence(|cons| {         // CRLDistributionPoints
            cons.take_sequence(|cons| {     // DistributionPoint
                cons.take_constructed_if(Tag::CTX_0, |cons| {
                    cons.take_constructed_if(Tag::CTX_0, |cons| {
                        take_general_names_content(
                            cons,
                            "invalid CRL Distribution Points extension",
                            uri::Rsync::from_bytes,
                        )
                    })
                })
            })
        })?
    );
    Ok(())
}

/// Parses the Authority Information Access extension.
///
/// Must contain an id-ad-caIssuers entry with at least one rsync URI.
fn take_authority_info_access<S: decode::Source>(
    cons: &mut decode::Constructed<S>,
    aia: &mut Option<uri::Rsync>,
) -> Result<(), DecodeError<S::Error>> {
    if aia.is_some() {
        return Err(cons.content_err(
            "duplicate Authority Information Access extension"
        ))
    }
    *aia = Some(
        cons.take_sequence(|cons| {
            cons.take_sequence(|cons| {
                oid::AD_CA_ISSUERS.skip_if(cons)?;
                take_general_names_content(
                    cons,
                    "invalid Authority Information Access extension",
                    uri::Rsync::from_bytes,
                )
            })
        })?
    );
    Ok(())
}

/// Parses the Subject Information Access extension.
fn take_subject_info_access<S: decode::Source>(
    cons: &mut decode::Constructed<S>,
    sia: &mut Option<Sia>,
) -> Result<(), DecodeError<S::Error>> {
    if sia.is_some() {
        return Err(cons.content_err(
            "duplicate Subject Information Access extension"
        ))
    }
    *sia = Some(Sia::take_from(cons)?);
    Ok(())
}

/// Parses the IP resources extension into checked blocks.
fn take_ip_resources<S: decode::Source>(
    cons: &mut decode::Constructed<S>,
    ip: &mut Option<IpBlocks>,
) -> Result<(), DecodeError<S::Error>> {
    if ip.is_some() {
        return Err(cons.content_err("duplicate IP Resources extension"))
    }
    *ip = Some(IpBlocks::take_from(cons)?);
    Ok(())
}

/// Parses the AS resources extension into checked blocks.
fn take_as_resources<S: decode::Source>(
    cons: &mut decode::Constructed<S>,
    asn: &mut Option<AsBlocks>,
) -> Result<(), DecodeError<S::Error>> {
    if asn.is_some() {
        return Err(cons.content_err("duplicate AS Resources extension"))
    }
    *asn = Some(AsBlocks::take_from(cons)?);
    Ok(())
}

/// Parses the content of a GeneralNames sequence, mapping URI choices.
///
/// The first URI `op` accepts wins; at least one must be acceptable.
fn take_general_names_content<S: decode::Source, F, T, E>(
    cons: &mut decode::Constructed<S>,
    error_msg: &'static str,
    mut op: F
) -> Result<T, DecodeError<S::Error>>
where F: FnMut(Bytes) -> Result<T, E> {
    let mut res = None;
    while let Some(()) = cons.take_opt_value_if(Tag::CTX_6, |content| {
        let uri = Ia5String::from_content(content)?;
        if res.is_none() {
            if let Ok(uri) = op(uri.into_bytes()) {
                res = Some(uri)
            }
        }
        Ok(())
    })? { }
    match res {
        Some(res) => Ok(res),
        None => Err(cons.content_err(error_msg))
    }
}

fn take_general_name<S: decode::Source, F, T, E>(
    cons: &mut decode::Constructed<S>,
    mut op: F
) -> Result<Option<T>, DecodeError<S::Error>>
where F: FnMut(Bytes) -> Result<T, E> {
    cons.take_value_if(Tag::CTX_6, |content| {
        Ia5String::from_content(content).map(|uri| {
            op(uri.into_bytes()).ok()
        })
    })
}


//------------ Sia -----------------------------------------------------------

/// Helper for parsing Subject Information Access.
#[derive(Clone, Debug, Default)]
struct Sia {
    ca_repository: Option<uri::Rsync>,
    rpki_manifest: Option<uri::Rsync>,
    signed_object: Option<uri::Rsync>,
    rpki_notify: Option<uri::Https>,
}

impl Sia {
    fn take_from<S: decode::Source>(
        cons: &mut decode::Constructed<S>
    ) -> Result<Self, DecodeError<S::Error>> {
        let mut sia = Sia::default();
        let mut any_seen = false;
        cons.take_sequence(|cons| {
            while let Some(()) = cons.take_opt_sequence(|cons| {
                let oid = Oid::take_from(cons)?;
                any_seen = true;
                if oid == oid::AD_CA_REPOSITORY {
                    update_first(&mut sia.ca_repository, || {
                        take_general_name(cons, uri::Rsync::from_bytes)
                    })
                }
                else if oid == oid::AD_RPKI_MANIFEST {
                    update_first(&mut sia.rpki_manifest, || {
                        take_general_name(cons, uri::Rsync::from_bytes)
                    })
                }
                else if oid == oid::AD_SIGNED_OBJECT {
                    update_first(&mut sia.signed_object, || {
                        take_general_name(cons, uri::Rsync::from_bytes)
                    })
                }
                else if oid == oid::AD_RPKI_NOTIFY {
                    update_first(&mut sia.rpki_notify, || {
                        take_general_name(cons, uri::Https::from_bytes)
                    })
                }
                else {
                    cons.skip_all()
                }
            })? { }
            Ok(())
        })?;
        if any_seen {
            Ok(sia)
        }
        else {
            Err(cons.content_err(
                "empty Subject Information Access extension"
            ))
        }
    }
}


//============ Testing =======================================================

#[cfg(test)]
pub mod test {
    use std::convert::TryFrom;
    use super::*;
    use crate::crypto::Signature;
    use crate::resources::ip::test::v4;
    use crate::resources::{Afi, CertAs, CertIp};
    use crate::x509::Time;

    /// Builds a certificate value directly for validation tests.
    ///
    /// The signed data is empty, so anything that verifies signatures will
    /// fail; the coverage and linkage logic never looks at it.
    pub fn make_cert(
        ski: KeyIdentifier,
        aki: Option<KeyIdentifier>,
        ip: Vec<CertIp>,
        asn: Vec<CertAs>,
    ) -> Cert {
        Cert {
            signed_data: SignedData::new(
                Bytes::new(),
                Signature::new(Default::default(), Bytes::new()),
            ),
            serial: Bytes::from_static(&[1]),
            validity: Validity::new(
                Time::from_timestamp(0).unwrap(),
                Time::from_timestamp(4102444800).unwrap(), // 2100-01-01
            ),
            subject_public_key: dummy_key(),
            basic_ca: true,
            key_usage: KeyUsage::Ca,
            ski,
            aki,
            crl: None,
            aia: None,
            repo: None,
            mft: None,
            notify: None,
            signed_object: None,
            ip: {
                let mut blocks = IpBlocks::empty();
                for el in ip {
                    blocks.push(el).unwrap();
                }
                blocks
            },
            asn: {
                let mut blocks = AsBlocks::empty();
                for el in asn {
                    blocks.push(el).unwrap();
                }
                blocks
            },
            valid: false,
        }
    }

    pub fn dummy_key() -> PublicKey {
        // The 512 bit test key also used by the TAL tests.
        let der = base64::decode(
            "MFwwDQYJKoZIhvcNAQEBBQADSwAwSAJBAAECAwQFBgcICQoLDA0ODxAREhMUFRYX\
             GBkaGxwdHh8gISIjJCUmJygpKissLS4vMDEyMzQ1Njc4OTo7PD0+P0ACAwEAAQ=="
        ).unwrap();
        PublicKey::decode(der.as_ref()).unwrap()
    }

    pub fn ki(byte: u8) -> KeyIdentifier {
        KeyIdentifier::try_from([byte; 20].as_ref()).unwrap()
    }

    #[test]
    fn ca_and_ee_flags() {
        let mut cert = make_cert(ki(1), None, vec![v4(10, 0, 0, 0, 8)], vec![]);
        assert!(cert.is_ca());
        assert!(!cert.is_ee());
        cert.basic_ca = false;
        cert.key_usage = KeyUsage::Ee;
        assert!(cert.is_ee());
    }

    #[test]
    fn ta_must_not_inherit() {
        let cert = make_cert(
            ki(1), None, vec![CertIp::inherit(Afi::V4)], vec![]
        );
        assert!(cert.verify_ta(
            cert.subject_public_key().to_info_bytes().as_ref()
        ).is_err());
    }

    #[test]
    fn ta_key_mismatch() {
        let cert = make_cert(ki(1), None, vec![v4(10, 0, 0, 0, 8)], vec![]);
        assert!(cert.verify_ta(b"not the right key").is_err());
    }

    #[test]
    fn wire_round_trip() {
        let mut cert = make_cert(
            ki(7),
            Some(ki(1)),
            vec![v4(10, 0, 0, 0, 8), CertIp::inherit(Afi::V6)],
            vec![CertAs::Id(64496), CertAs::Range { min: 64500, max: 64510 }],
        );
        cert.crl = Some("rsync://h/m/ca.crl".parse().unwrap());
        cert.aia = Some("rsync://h/m/parent.cer".parse().unwrap());
        cert.repo = Some("rsync://h/m/repo/".parse().unwrap());
        cert.mft = Some("rsync://h/m/repo/ca.mft".parse().unwrap());
        cert.notify = Some("https://h/notify.xml".parse().unwrap());
        cert.valid = true;

        let mut buf = IoBuf::new();
        cert.compose(&mut buf);
        let frame = buf.finish();
        let mut frame = Frame::new(frame[4..].to_vec());
        let read = Cert::parse_frame(&mut frame).unwrap();
        assert_eq!(frame.remaining(), 0);

        assert_eq!(read.serial(), cert.serial());
        assert_eq!(read.validity(), cert.validity());
        assert_eq!(read.subject_public_key(), cert.subject_public_key());
        assert_eq!(read.ski(), cert.ski());
        assert_eq!(read.aki(), cert.aki());
        assert_eq!(read.crl(), cert.crl());
        assert_eq!(read.aia(), cert.aia());
        assert_eq!(read.repo(), cert.repo());
        assert_eq!(read.mft(), cert.mft());
        assert_eq!(read.notify(), cert.notify());
        assert_eq!(read.ip(), cert.ip());
        assert_eq!(read.asn(), cert.asn());
        assert_eq!(read.is_valid(), cert.is_valid());
        assert_eq!(
            read.signed_data().data(), cert.signed_data().data()
        );
    }
}
