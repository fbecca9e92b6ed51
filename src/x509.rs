//! Types common to all things X.509.

use std::{fmt, ops, str};
use std::str::FromStr;
use bcder::decode;
use bcder::{BitString, Mode, Tag};
use bcder::decode::{DecodeError, IntoSource, Source};
use bytes::Bytes;
use chrono::{DateTime, Datelike, LocalResult, TimeZone, Timelike, Utc};
use crate::crypto::{PublicKey, Signature, SignatureAlgorithm};
use crate::time;


//------------ Functions -----------------------------------------------------

/// Updates an optional value the first time.
///
/// Always runs `op` but only assigns its result to `opt` if that doesn't
/// hold a value yet.
pub fn update_first<F, T, E>(opt: &mut Option<T>, op: F) -> Result<(), E>
where F: FnOnce() -> Result<Option<T>, E> {
    if let Some(value) = op()? {
        if opt.is_none() {
            *opt = Some(value);
        }
    }
    Ok(())
}


//------------ SignedData ----------------------------------------------------

/// The outer shell of a signed X.509 structure.
///
/// Both certificates and CRLs are a sequence of the to-be-signed data, a
/// signature algorithm, and the signature. The to-be-signed part is kept as
/// the exact bytes that appeared on the wire so the signature can be
/// checked over them, and so the whole thing survives a trip across the
/// worker channel unchanged.
#[derive(Clone, Debug)]
pub struct SignedData {
    data: Bytes,
    signature: Signature,
}

impl SignedData {
    /// Re-assembles a value from its parts, e.g. after IPC transfer.
    pub fn new(data: Bytes, signature: Signature) -> Self {
        SignedData { data, signature }
    }

    pub fn decode<S: IntoSource>(
        source: S
    ) -> Result<Self, DecodeError<<S::Source as Source>::Error>> {
        Mode::Der.decode(source, Self::take_from)
    }

    pub fn take_from<S: decode::Source>(
        cons: &mut decode::Constructed<S>
    ) -> Result<Self, DecodeError<S::Error>> {
        cons.take_sequence(Self::take_content_from)
    }

    pub fn take_content_from<S: decode::Source>(
        cons: &mut decode::Constructed<S>
    ) -> Result<Self, DecodeError<S::Error>> {
        Ok(SignedData {
            data: cons.capture_one()?.into_bytes(),
            signature: Signature::new(
                SignatureAlgorithm::x509_take_from(cons)?,
                BitString::take_from(cons)?.octet_bytes()
            )
        })
    }

    /// Returns the to-be-signed data.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Returns the signature.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Verifies the signature against the given public key.
    pub fn verify_signature(
        &self, public_key: &PublicKey
    ) -> Result<(), ValidationError> {
        public_key.verify(
            self.data.as_ref(), &self.signature
        ).map_err(|_| ValidationError)
    }
}


//------------ Time ----------------------------------------------------------

/// A DER-encoded point in time.
///
/// X.509 encodes times before 2050 as UTCTime and later ones as
/// GeneralizedTime, both in their stripped-down RFC 5280 profile.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Time(DateTime<Utc>);

impl Time {
    pub fn new(dt: DateTime<Utc>) -> Self {
        Time(dt)
    }

    pub fn now() -> Self {
        Self::new(time::now())
    }

    pub fn from_timestamp(secs: i64) -> Result<Self, ValidationError> {
        match Utc.timestamp_opt(secs, 0) {
            LocalResult::Single(dt) => Ok(Time(dt)),
            _ => Err(ValidationError)
        }
    }

    pub fn timestamp(self) -> i64 {
        self.0.timestamp()
    }

    pub fn take_from<S: decode::Source>(
        cons: &mut decode::Constructed<S>
    ) -> Result<Self, DecodeError<S::Error>> {
        cons.take_primitive(|tag, prim| {
            match tag {
                Tag::UTC_TIME => {
                    // RFC 5280 requires the format YYMMDDHHMMSSZ.
                    let year = read_two_char(prim)? as i32;
                    let year = if year >= 50 { year + 1900 }
                               else { year + 2000 };
                    let res = (
                        year,
                        read_two_char(prim)?,
                        read_two_char(prim)?,
                        read_two_char(prim)?,
                        read_two_char(prim)?,
                        read_two_char(prim)?,
                    );
                    if prim.take_u8()? != b'Z' {
                        return Err(prim.content_err("invalid time"))
                    }
                    Self::from_parts(res).map_err(|_| {
                        prim.content_err("invalid time")
                    })
                }
                Tag::GENERALIZED_TIME => {
                    // RFC 5280 requires the format YYYYMMDDHHMMSSZ.
                    let res = (
                        read_four_char(prim)? as i32,
                        read_two_char(prim)?,
                        read_two_char(prim)?,
                        read_two_char(prim)?,
                        read_two_char(prim)?,
                        read_two_char(prim)?,
                    );
                    if prim.take_u8()? != b'Z' {
                        return Err(prim.content_err("invalid time"))
                    }
                    Self::from_parts(res).map_err(|_| {
                        prim.content_err("invalid time")
                    })
                }
                _ => Err(prim.content_err("expected UTC or generalized time"))
            }
        })
    }

    fn from_parts(
        parts: (i32, u32, u32, u32, u32, u32)
    ) -> Result<Self, ValidationError> {
        match Utc.with_ymd_and_hms(
            parts.0, parts.1, parts.2, parts.3, parts.4, parts.5
        ) {
            LocalResult::Single(dt) => Ok(Time(dt)),
            _ => Err(ValidationError)
        }
    }

    pub fn validate_not_before(&self) -> Result<(), ValidationError> {
        if time::now() < self.0 {
            Err(ValidationError)
        }
        else {
            Ok(())
        }
    }

    pub fn validate_not_after(&self) -> Result<(), ValidationError> {
        if time::now() > self.0 {
            Err(ValidationError)
        }
        else {
            Ok(())
        }
    }
}

impl ops::Deref for Time {
    type Target = DateTime<Utc>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f, "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
            self.0.year(), self.0.month(), self.0.day(),
            self.0.hour(), self.0.minute(), self.0.second()
        )
    }
}

fn read_two_char<S: decode::Source>(
    source: &mut decode::Primitive<S>
) -> Result<u32, DecodeError<S::Error>> {
    let mut s = [0u8; 2];
    s[0] = source.take_u8()?;
    s[1] = source.take_u8()?;
    let s = match str::from_utf8(&s[..]) {
        Ok(s) => s,
        Err(_) => return Err(source.content_err("invalid time"))
    };
    u32::from_str(s).map_err(|_| source.content_err("invalid time"))
}

fn read_four_char<S: decode::Source>(
    source: &mut decode::Primitive<S>
) -> Result<u32, DecodeError<S::Error>> {
    let mut s = [0u8; 4];
    for ch in &mut s {
        *ch = source.take_u8()?;
    }
    let s = match str::from_utf8(&s[..]) {
        Ok(s) => s,
        Err(_) => return Err(source.content_err("invalid time"))
    };
    u32::from_str(s).map_err(|_| source.content_err("invalid time"))
}


//------------ Validity ------------------------------------------------------

/// The validity period of a certificate.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Validity {
    not_before: Time,
    not_after: Time,
}

impl Validity {
    pub fn new(not_before: Time, not_after: Time) -> Self {
        Validity { not_before, not_after }
    }

    pub fn take_from<S: decode::Source>(
        cons: &mut decode::Constructed<S>
    ) -> Result<Self, DecodeError<S::Error>> {
        cons.take_sequence(|cons| {
            Ok(Validity::new(
                Time::take_from(cons)?,
                Time::take_from(cons)?,
            ))
        })
    }

    pub fn not_before(&self) -> Time {
        self.not_before
    }

    pub fn not_after(&self) -> Time {
        self.not_after
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.not_before.validate_not_before()?;
        self.not_after.validate_not_after()?;
        Ok(())
    }
}


//------------ ValidationError -----------------------------------------------

/// An object failed validation.
///
/// Carries no further information; details go to the log at the point of
/// failure, and the statistics record the category.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ValidationError;

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("validation error")
    }
}

impl std::error::Error for ValidationError { }


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn time_from_parts() {
        let t = Time::from_parts((2021, 9, 9, 14, 15, 49)).unwrap();
        assert_eq!(t.to_string(), "2021-09-09T14:15:49Z");
        assert!(Time::from_parts((2021, 13, 1, 0, 0, 0)).is_err());
    }

    #[test]
    fn time_timestamp_round_trip() {
        let t = Time::from_parts((2030, 1, 2, 3, 4, 5)).unwrap();
        assert_eq!(Time::from_timestamp(t.timestamp()).unwrap(), t);
    }

    #[test]
    fn validity_order() {
        let early = Time::from_parts((2000, 1, 1, 0, 0, 0)).unwrap();
        let late = Time::from_parts((2040, 1, 1, 0, 0, 0)).unwrap();
        assert!(early < late);
        assert!(early.validate_not_before().is_ok());
        assert!(late.validate_not_after().is_ok());
        assert!(late.validate_not_before().is_err());
        assert!(early.validate_not_after().is_err());
    }
}
