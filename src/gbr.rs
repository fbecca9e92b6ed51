//! Ghostbuster records.
//!
//! A ghostbuster record (RFC 6493) wraps a vCard with contact data for
//! whoever to call when a prefix is haunted. The payload is treated as
//! inert: it is validated like any signed object but contributes nothing
//! to the VRP store.

use bytes::Bytes;
use log::warn;
use crate::cert::Cert;
use crate::crypto::KeyIdentifier;
use crate::oid;
use crate::sigobj::SignedObject;
use crate::uri;
use crate::x509::ValidationError;


//------------ Gbr -----------------------------------------------------------

/// A decoded and locally verified ghostbuster record.
#[derive(Clone, Debug)]
pub struct Gbr {
    /// The EE certificate the record was signed with.
    ee: Cert,

    /// The raw vCard payload.
    vcard: Bytes,
}

impl Gbr {
    /// Parses a ghostbuster record from DER bytes.
    pub fn parse(fname: &str, data: Bytes) -> Result<Self, ValidationError> {
        let signed = SignedObject::decode(data).map_err(|err| {
            warn!("{}: {}", fname, err);
            ValidationError
        })?;
        if signed.content_type().ne(&oid::CT_GHOSTBUSTERS) {
            warn!("{}: not a ghostbuster record", fname);
            return Err(ValidationError)
        }
        let vcard = signed.content().to_bytes();
        // The payload must at least look like a vCard.
        if !vcard.starts_with(b"BEGIN:VCARD") {
            warn!("{}: payload is not a vCard", fname);
            return Err(ValidationError)
        }
        if let Err(err) = signed.verify() {
            warn!("{}: {}", fname, err);
            return Err(err)
        }
        Ok(Gbr {
            ee: signed.into_cert(),
            vcard,
        })
    }

    /// Re-assembles a record from its parts, e.g. after IPC transfer.
    pub fn from_parts(ee: Cert, vcard: Bytes) -> Self {
        Gbr { ee, vcard }
    }

    pub fn ee(&self) -> &Cert {
        &self.ee
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

    pub fn vcard(&self) -> &Bytes {
        &self.vcard
    }
}

/// # Wire format
///
impl Gbr {
    pub fn compose(&self, buf: &mut crate::ipc::IoBuf) {
        self.ee.compose(buf);
        buf.buf(self.vcard.as_ref());
    }

    pub fn parse_frame(
        frame: &mut crate::ipc::Frame
    ) -> std::io::Result<Self> {
        Ok(Gbr {
            ee: Cert::parse_frame(frame)?,
            vcard: frame.take_buf()?,
        })
    }
}
