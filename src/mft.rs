//! RPKI manifests.
//!
//! A manifest (RFC 6486) lists every file its CA currently publishes,
//! each with a SHA-256 digest of its body. Processing a repository is
//! driven off the manifest: only files it lists, with matching digests,
//! enter the object walk.

use std::cmp::Ordering;
use std::fmt;
use bcder::{decode, BitString, OctetString, Tag, Unsigned};
use bcder::decode::{DecodeError, Source};
use bcder::string::OctetStringSource;
use bytes::Bytes;
use log::warn;
use crate::cert::Cert;
use crate::crypto::{DigestAlgorithm, KeyIdentifier};
use crate::oid;
use crate::sigobj::{take_econtent_version, SignedObject};
use crate::time;
use crate::uri;
use crate::x509::{Time, ValidationError};


//------------ Mft -----------------------------------------------------------

/// A decoded and locally verified manifest.
#[derive(Clone, Debug)]
pub struct Mft {
    /// The EE certificate the manifest was signed with.
    ee: Cert,

    /// The manifestNumber, an unsigned big-endian integer of up to
    /// 20 octets.
    seqnum: Bytes,

    this_update: Time,
    next_update: Time,

    /// The files and their expected digests.
    files: Vec<MftFile>,

    /// Whether the wall clock was past `next_update` when we parsed.
    stale: bool,
}

impl Mft {
    /// Parses a manifest from DER bytes, verifying the CMS shell.
    ///
    /// `fname` is used in log messages only.
    pub fn parse(fname: &str, data: Bytes) -> Result<Self, ValidationError> {
        let signed = SignedObject::decode(data).map_err(|err| {
            warn!("{}: {}", fname, err);
            ValidationError
        })?;
        if signed.content_type().ne(&oid::CT_RPKI_MANIFEST) {
            warn!("{}: not a manifest", fname);
            return Err(ValidationError)
        }
        let content = signed.decode_content(
            Self::take_content
        ).map_err(|err| {
            warn!("{}: {}", fname, err);
            ValidationError
        })?;
        if let Err(err) = signed.verify() {
            warn!("{}: {}", fname, err);
            return Err(err)
        }
        let (seqnum, this_update, next_update, files) = content;
        let stale = Time::new(time::now()) > next_update;
        Ok(Mft {
            ee: signed.into_cert(),
            seqnum,
            this_update,
            next_update,
            files,
            stale,
        })
    }

    /// Parses the manifest eContent.
    ///
    /// ```text
    /// Manifest ::= SEQUENCE {
    ///     version        [0] INTEGER DEFAULT 0,
    ///     manifestNumber     INTEGER (0..MAX),
    ///     thisUpdate         GeneralizedTime,
    ///     nextUpdate         GeneralizedTime,
    ///     fileHashAlg        OBJECT IDENTIFIER,
    ///     fileList           SEQUENCE SIZE (0..MAX) OF FileAndHash }
    ///
    /// FileAndHash ::= SEQUENCE {
    ///     file               IA5String,
    ///     hash               BIT STRING }
    /// ```
    #[allow(clippy::type_complexity)]
    fn take_content(
        cons: &mut decode::Constructed<OctetStringSource>
    ) -> Result<
        (Bytes, Time, Time, Vec<MftFile>),
        DecodeError<<OctetStringSource as Source>::Error>
    > {
        cons.take_sequence(|cons| {
            take_econtent_version(cons)?;
            let seqnum = Unsigned::take_from(cons)?;
            if AsRef::<[u8]>::as_ref(&seqnum).len() > 20 {
                return Err(cons.content_err("manifestNumber too long"))
            }
            let seqnum = Bytes::copy_from_slice(seqnum.as_ref());
            let this_update = Time::take_from(cons)?;
            let next_update = Time::take_from(cons)?;
            if this_update > next_update {
                return Err(cons.content_err(
                    "thisUpdate after nextUpdate"
                ))
            }
            oid::SHA256.skip_if(cons)?;
            let mut files = Vec::new();
            cons.take_sequence(|cons| {
                while let Some(file) = MftFile::take_opt_from(cons)? {
                    files.push(file);
                }
                Ok(())
            })?;
            Ok((seqnum, this_update, next_update, files))
        })
    }

    /// Re-assembles a manifest from its parts, e.g. after IPC transfer.
    pub fn from_parts(
        ee: Cert,
        seqnum: Bytes,
        this_update: Time,
        next_update: Time,
        files: Vec<MftFile>,
        stale: bool,
    ) -> Self {
        Mft { ee, seqnum, this_update, next_update, files, stale }
    }
}

impl Mft {
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

    pub fn seqnum(&self) -> &Bytes {
        &self.seqnum
    }

    pub fn this_update(&self) -> Time {
        self.this_update
    }

    pub fn next_update(&self) -> Time {
        self.next_update
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn files(&self) -> &[MftFile] {
        &self.files
    }

    /// Keeps only the file entries for which `keep` returns true.
    pub fn retain_files<F: FnMut(&MftFile) -> bool>(&mut self, keep: F) {
        self.files.retain(keep)
    }

    /// Compares two manifest numbers.
    ///
    /// The numbers are unsigned big-endian integers; comparing by length
    /// first after stripping leading zeros orders them numerically without
    /// any bignum arithmetic.
    pub fn cmp_seqnum(a: &[u8], b: &[u8]) -> Ordering {
        fn strip(mut s: &[u8]) -> &[u8] {
            while let Some((&0, rest)) = s.split_first() {
                s = rest;
            }
            s
        }
        let a = strip(a);
        let b = strip(b);
        match a.len().cmp(&b.len()) {
            Ordering::Equal => a.cmp(b),
            other => other
        }
    }
}


/// # Wire format
///
impl Mft {
    pub fn compose(&self, buf: &mut crate::ipc::IoBuf) {
        self.ee.compose(buf);
        buf.buf(self.seqnum.as_ref());
        buf.simple_i64(self.this_update.timestamp());
        buf.simple_i64(self.next_update.timestamp());
        buf.simple_bool(self.stale);
        buf.simple_u32(self.files.len() as u32);
        for file in &self.files {
            buf.str(&file.file);
            buf.buf(file.hash.as_ref());
        }
    }

    pub fn parse_frame(
        frame: &mut crate::ipc::Frame
    ) -> std::io::Result<Self> {
        fn take_time(
            frame: &mut crate::ipc::Frame
        ) -> std::io::Result<Time> {
            Time::from_timestamp(frame.take_i64()?).map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData, "invalid timestamp"
                )
            })
        }

        let ee = Cert::parse_frame(frame)?;
        let seqnum = frame.take_buf()?;
        let this_update = take_time(frame)?;
        let next_update = take_time(frame)?;
        let stale = frame.take_bool()?;
        let count = frame.take_u32()?;
        let mut files = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let file = frame.take_str()?;
            let hash = frame.take_buf()?;
            if hash.len() != DigestAlgorithm::sha256().digest_len() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData, "invalid file hash"
                ))
            }
            files.push(MftFile { file, hash });
        }
        Ok(Mft {
            ee, seqnum, this_update, next_update, files, stale
        })
    }
}


//------------ MftFile -------------------------------------------------------

/// A single entry of a manifest's file list.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MftFile {
    file: String,
    hash: Bytes,
}

impl MftFile {
    pub fn new(file: String, hash: Bytes) -> Self {
        MftFile { file, hash }
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn hash(&self) -> &Bytes {
        &self.hash
    }

    fn take_opt_from<S: decode::Source>(
        cons: &mut decode::Constructed<S>
    ) -> Result<Option<Self>, DecodeError<S::Error>> {
        cons.take_opt_sequence(|cons| {
            let file = cons.take_value_if(
                Tag::IA5_STRING, OctetString::from_content
            )?;
            let hash = BitString::take_from(cons)?;
            if hash.unused() != 0
                || hash.octet_len() != DigestAlgorithm::sha256().digest_len()
            {
                return Err(cons.content_err("invalid file hash"))
            }
            let file = file.into_bytes();
            if !file.is_ascii() || file.is_empty() {
                return Err(cons.content_err("invalid file name"))
            }
            let file = String::from_utf8(file.to_vec()).unwrap();
            // File names are basenames: no path separators, no leading dot.
            if file.contains('/') || file.starts_with('.') {
                return Err(cons.content_err("invalid file name"))
            }
            Ok(MftFile {
                file,
                hash: hash.octet_bytes(),
            })
        })
    }
}

impl fmt::Display for MftFile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.file)
    }
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wire_round_trip() {
        use crate::cert::test::{ki, make_cert};

        let mft = Mft::from_parts(
            make_cert(ki(5), Some(ki(1)), Vec::new(), Vec::new()),
            Bytes::from_static(&[1, 44]),
            Time::from_timestamp(1_600_000_000).unwrap(),
            Time::from_timestamp(1_700_000_000).unwrap(),
            vec![
                MftFile::new("child.cer".into(), Bytes::from(vec![7; 32])),
                MftFile::new("origin.roa".into(), Bytes::from(vec![9; 32])),
            ],
            true,
        );
        let mut buf = crate::ipc::IoBuf::new();
        mft.compose(&mut buf);
        let frame = buf.finish();
        let mut frame = crate::ipc::Frame::new(frame[4..].to_vec());
        let read = Mft::parse_frame(&mut frame).unwrap();
        assert_eq!(frame.remaining(), 0);
        assert_eq!(read.seqnum(), mft.seqnum());
        assert_eq!(read.this_update(), mft.this_update());
        assert_eq!(read.next_update(), mft.next_update());
        assert_eq!(read.is_stale(), mft.is_stale());
        assert_eq!(read.files(), mft.files());
        assert_eq!(read.ski(), mft.ski());
    }

    #[test]
    fn seqnum_ordering() {
        assert_eq!(Mft::cmp_seqnum(&[1], &[2]), Ordering::Less);
        assert_eq!(Mft::cmp_seqnum(&[2], &[1]), Ordering::Greater);
        assert_eq!(Mft::cmp_seqnum(&[1, 0], &[2]), Ordering::Greater);
        assert_eq!(Mft::cmp_seqnum(&[0, 0, 3], &[3]), Ordering::Equal);
        assert_eq!(
            Mft::cmp_seqnum(&[0, 255, 255], &[1, 0, 0]),
            Ordering::Less
        );
    }
}
