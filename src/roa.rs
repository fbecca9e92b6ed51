//! Route Origin Authorizations.
//!
//! A ROA (RFC 6482) binds one AS number to a list of address prefixes the
//! AS may originate, each optionally widened by a maxLength. A validated
//! ROA contributes one VRP per prefix to the output.

use bcder::{decode, BitString};
use bcder::decode::{DecodeError, Source};
use bcder::string::OctetStringSource;
use bytes::Bytes;
use log::warn;
use crate::cert::Cert;
use crate::crypto::KeyIdentifier;
use crate::oid;
use crate::resources::ip::{Addr, Afi};
use crate::sigobj::{take_econtent_version, SignedObject};
use crate::uri;
use crate::x509::{Time, ValidationError};


//------------ Roa -----------------------------------------------------------

/// A decoded and locally verified ROA.
#[derive(Clone, Debug)]
pub struct Roa {
    /// The EE certificate the ROA was signed with.
    ee: Cert,

    /// The asID; zero disavows the prefixes (RFC 6483, section 4).
    asid: u32,

    ips: Vec<RoaIp>,

    /// Whether the resources have been validated against the chain.
    valid: bool,

    /// The name of the TAL this ROA was found under.
    tal: String,

    /// The moment the weakest certificate on the chain expires.
    expires: Time,
}

impl Roa {
    /// Parses a ROA from DER bytes, verifying the CMS shell.
    pub fn parse(fname: &str, data: Bytes) -> Result<Self, ValidationError> {
        let signed = SignedObject::decode(data).map_err(|err| {
            warn!("{}: {}", fname, err);
            ValidationError
        })?;
        if signed.content_type().ne(&oid::CT_ROUTE_ORIGIN_AUTH) {
            warn!("{}: not a ROA", fname);
            return Err(ValidationError)
        }
        let (asid, ips) = signed.decode_content(
            Self::take_content
        ).map_err(|err| {
            warn!("{}: {}", fname, err);
            ValidationError
        })?;
        if let Err(err) = signed.verify() {
            warn!("{}: {}", fname, err);
            return Err(err)
        }
        let ee = signed.into_cert();
        let expires = ee.validity().not_after();
        Ok(Roa {
            ee,
            asid,
            ips,
            valid: false,
            tal: String::new(),
            expires,
        })
    }

    /// Parses the RouteOriginAttestation eContent.
    ///
    /// ```text
    /// RouteOriginAttestation ::= SEQUENCE {
    ///     version      [0] INTEGER DEFAULT 0,
    ///     asID             ASID,
    ///     ipAddrBlocks     SEQUENCE OF ROAIPAddressFamily }
    ///
    /// ROAIPAddressFamily ::= SEQUENCE {
    ///     addressFamily    OCTET STRING (SIZE (2..3)),
    ///     addresses        SEQUENCE OF ROAIPAddress }
    ///
    /// ROAIPAddress ::= SEQUENCE {
    ///     address          IPAddress,
    ///     maxLength        INTEGER OPTIONAL }
    /// ```
    fn take_content(
        cons: &mut decode::Constructed<OctetStringSource>
    ) -> Result<
        (u32, Vec<RoaIp>),
        DecodeError<<OctetStringSource as Source>::Error>
    > {
        cons.take_sequence(|cons| {
            take_econtent_version(cons)?;
            let asid = cons.take_u32()?;
            let mut ips = Vec::new();
            cons.take_sequence(|cons| {
                while let Some(()) = cons.take_opt_sequence(|cons| {
                    let afi = Afi::take_from(cons)?;
                    cons.take_sequence(|cons| {
                        while let Some(ip) = RoaIp::take_opt_from(
                            cons, afi
                        )? {
                            ips.push(ip);
                        }
                        Ok(())
                    })
                })? { }
                Ok(())
            })?;
            Ok((asid, ips))
        })
    }

    /// Re-assembles a ROA from its parts, e.g. after IPC transfer.
    pub fn from_parts(
        ee: Cert,
        asid: u32,
        ips: Vec<RoaIp>,
        valid: bool,
        tal: String,
        expires: Time,
    ) -> Self {
        Roa { ee, asid, ips, valid, tal, expires }
    }
}

impl Roa {
    pub fn ee(&self) -> &Cert {
        &self.ee
    }

    pub fn asid(&self) -> u32 {
        self.asid
    }

    pub fn ips(&self) -> &[RoaIp] {
        &self.ips
    }

    pub fn ski(&self) -> KeyIdentifier {
        self.ee.ski()
    }

    pub fn aki(&self) -> Option<KeyIdentifier> {
        self.ee.aki()
    }

    pub fn aia(&self) -> Option<&uri::Rsync> {
        self.ee.aia()
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn set_valid(&mut self, valid: bool) {
        self.valid = valid
    }

    pub fn tal(&self) -> &str {
        &self.tal
    }

    pub fn set_tal(&mut self, tal: String) {
        self.tal = tal
    }

    pub fn expires(&self) -> Time {
        self.expires
    }

    /// Lowers the expiry moment to `at` if that is earlier.
    ///
    /// Called while walking up the chain so the ROA ends up with the
    /// minimum notAfter of every certificate involved.
    pub fn shorten_expires(&mut self, at: Time) {
        if at < self.expires {
            self.expires = at;
        }
    }
}


/// # Wire format
///
impl Roa {
    pub fn compose(&self, buf: &mut crate::ipc::IoBuf) {
        self.ee.compose(buf);
        buf.simple_u32(self.asid);
        buf.simple_u32(self.ips.len() as u32);
        for ip in &self.ips {
            buf.simple_u8(ip.afi.to_u16() as u8);
            buf.simple_bytes(ip.addr.bytes());
            buf.simple_u8(ip.addr.prefixlen());
            buf.simple_u8(ip.maxlength);
        }
        buf.simple_bool(self.valid);
        buf.str(&self.tal);
        buf.simple_i64(self.expires.timestamp());
    }

    pub fn parse_frame(
        frame: &mut crate::ipc::Frame
    ) -> std::io::Result<Self> {
        fn bad(msg: &'static str) -> std::io::Error {
            std::io::Error::new(std::io::ErrorKind::InvalidData, msg)
        }

        let ee = Cert::parse_frame(frame)?;
        let asid = frame.take_u32()?;
        let count = frame.take_u32()?;
        let mut ips = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let afi = Afi::from_u16(frame.take_u8()? as u16)
                .ok_or_else(|| bad("invalid AFI"))?;
            let bytes = frame.take_bytes(16)?;
            let mut addr = [0u8; 16];
            addr.copy_from_slice(bytes.as_ref());
            let prefixlen = frame.take_u8()?;
            let maxlength = frame.take_u8()?;
            if prefixlen > afi.max_prefixlen()
                || maxlength < prefixlen
                || maxlength > afi.max_prefixlen()
            {
                return Err(bad("invalid prefix"))
            }
            ips.push(RoaIp::new(
                afi, Addr::new(addr, prefixlen), maxlength
            ));
        }
        let valid = frame.take_bool()?;
        let tal = frame.take_str()?;
        let expires = Time::from_timestamp(frame.take_i64()?)
            .map_err(|_| bad("invalid timestamp"))?;
        Ok(Roa { ee, asid, ips, valid, tal, expires })
    }
}


//------------ RoaIp ---------------------------------------------------------

/// A single prefix of a ROA.
///
/// The canonical `[min, max]` byte range is always recomputed from the
/// prefix when the value is built and is never taken from the wire.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RoaIp {
    afi: Afi,
    addr: Addr,
    maxlength: u8,
    min: [u8; 16],
    max: [u8; 16],
}

impl RoaIp {
    /// Builds a value, composing the canonical range.
    pub fn new(afi: Afi, addr: Addr, maxlength: u8) -> Self {
        RoaIp {
            afi,
            addr,
            maxlength,
            min: Addr::min(&addr),
            max: Addr::max(&addr, afi),
        }
    }

    pub fn afi(&self) -> Afi {
        self.afi
    }

    pub fn addr(&self) -> &Addr {
        &self.addr
    }

    pub fn maxlength(&self) -> u8 {
        self.maxlength
    }

    pub fn min(&self) -> &[u8; 16] {
        &self.min
    }

    pub fn max(&self) -> &[u8; 16] {
        &self.max
    }

    fn take_opt_from<S: decode::Source>(
        cons: &mut decode::Constructed<S>,
        afi: Afi,
    ) -> Result<Option<Self>, DecodeError<S::Error>> {
        cons.take_opt_sequence(|cons| {
            let bits = BitString::take_from(cons)?;
            let addr = Addr::from_bit_string(cons, &bits, afi)?;
            let maxlength = match cons.take_opt_u8()? {
                Some(maxlength) => {
                    // maxLength must lie between the prefix length and
                    // the family maximum.
                    if maxlength < addr.prefixlen()
                        || maxlength > afi.max_prefixlen()
                    {
                        return Err(cons.content_err("invalid maxLength"))
                    }
                    maxlength
                }
                None => addr.prefixlen()
            };
            Ok(RoaIp::new(afi, addr, maxlength))
        })
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

    #[test]
    fn roa_ip_composes_ranges() {
        let ip = RoaIp::new(Afi::V4, v4addr(10, 1, 0, 0, 16), 24);
        assert_eq!(&ip.min()[..4], &[10, 1, 0, 0]);
        assert_eq!(&ip.max()[..4], &[10, 1, 255, 255]);
        assert_eq!(ip.maxlength(), 24);
    }

    #[test]
    fn maxlength_bounds() {
        // maxLength equal to the prefix length is the degenerate but
        // valid case.
        let ip = RoaIp::new(Afi::V4, v4addr(10, 1, 0, 0, 16), 16);
        assert_eq!(ip.maxlength(), ip.addr().prefixlen());
    }

    #[test]
    fn wire_round_trip() {
        use crate::cert::test::{ki, make_cert};

        let roa = Roa::from_parts(
            make_cert(ki(6), Some(ki(1)), Vec::new(), Vec::new()),
            64500,
            vec![
                RoaIp::new(Afi::V4, v4addr(10, 1, 0, 0, 16), 24),
                RoaIp::new(Afi::V4, v4addr(192, 0, 2, 0, 24), 24),
            ],
            true,
            "example".into(),
            Time::from_timestamp(1_700_000_000).unwrap(),
        );
        let mut buf = crate::ipc::IoBuf::new();
        roa.compose(&mut buf);
        let frame = buf.finish();
        let mut frame = crate::ipc::Frame::new(frame[4..].to_vec());
        let read = Roa::parse_frame(&mut frame).unwrap();
        assert_eq!(frame.remaining(), 0);
        assert_eq!(read.asid(), roa.asid());
        assert_eq!(read.ips(), roa.ips());
        assert_eq!(read.is_valid(), roa.is_valid());
        assert_eq!(read.tal(), roa.tal());
        assert_eq!(read.expires(), roa.expires());
        assert_eq!(read.ski(), roa.ski());
    }

    #[test]
    fn shorten_expires() {
        use crate::cert::test::{ki, make_cert};

        let mut roa = Roa::from_parts(
            make_cert(ki(9), Some(ki(1)), Vec::new(), Vec::new()),
            64500,
            Vec::new(),
            false,
            String::new(),
            Time::from_timestamp(1_000_000).unwrap(),
        );
        roa.shorten_expires(Time::from_timestamp(2_000_000).unwrap());
        assert_eq!(roa.expires().timestamp(), 1_000_000);
        roa.shorten_expires(Time::from_timestamp(500_000).unwrap());
        assert_eq!(roa.expires().timestamp(), 500_000);
    }
}
