//! Trust Anchor Locators.
//!
//! A TAL (RFC 7730, extended by RFC 8630 to allow HTTPS) names one or more
//! URIs where the trust anchor certificate can be fetched plus the DER
//! encoded public key the fetched certificate must carry. The file format
//! is a block of optional comment lines, the URIs one per line, a blank
//! line, and the base64 encoded key.

use std::{fmt, io};
use std::fs::{read_dir, DirEntry, File, ReadDir};
use std::io::Read;
use std::path::Path;
use bcder::decode::DecodeError;
use bytes::Bytes;
use log::{debug, error};
use crate::crypto::PublicKey;
use crate::uri;


//------------ Tal -----------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Tal {
    uris: Vec<TalUri>,
    key: Bytes,
    name: String,
}

impl Tal {
    /// Reads all TAL files from a directory.
    pub fn read_dir<P: AsRef<Path>>(path: P) -> Result<TalIter, io::Error> {
        read_dir(path).map(TalIter)
    }

    /// Reads a TAL from a reader.
    ///
    /// The path is only used to derive the TAL's name: its file stem, which
    /// becomes the provenance recorded on every VRP derived below this
    /// trust anchor.
    pub fn read<P: AsRef<Path>, R: Read>(
        path: P,
        reader: &mut R
    ) -> Result<Self, ReadError> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;

        let mut data = data.as_ref();
        Self::skip_comments(&mut data);
        let mut uris = Vec::new();
        while let Some(uri) = Self::take_uri(&mut data)? {
            uris.push(uri)
        }
        if uris.is_empty() {
            return Err(ReadError::NoUris)
        }
        let data: Vec<_> = data.iter().filter_map(|b|
            if b.is_ascii_whitespace() { None }
            else { Some(*b) }
        ).collect();
        let key = Bytes::from(base64::decode(&data)?);

        // The key must be a well-formed SubjectPublicKeyInfo.
        let _ = PublicKey::decode(key.as_ref())?;

        let name = path.as_ref().file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Tal { uris, key, name })
    }

    /// Skips over any leading lines starting with a `#`.
    fn skip_comments(data: &mut &[u8]) {
        while let Some(&b'#') = data.first() {
            match data.iter().position(|&ch| ch == b'\n') {
                Some(pos) => *data = &data[pos + 1..],
                None => {
                    *data = b"";
                    return
                }
            }
        }
    }

    fn take_uri(data: &mut &[u8]) -> Result<Option<TalUri>, ReadError> {
        let mut split = data.splitn(2, |&ch| ch == b'\n');
        let mut line = split.next().ok_or(ReadError::UnexpectedEof)?;
        *data = split.next().ok_or(ReadError::UnexpectedEof)?;
        if line.ends_with(b"\r") {
            line = line.split_last().unwrap().1;
        }
        if line.is_empty() {
            Ok(None)
        }
        else {
            Ok(Some(TalUri::from_slice(line)?))
        }
    }
}

impl Tal {
    pub fn uris(&self) -> std::slice::Iter<TalUri> {
        self.uris.iter()
    }

    /// The first rsync URI, if the TAL has one.
    pub fn rsync_uri(&self) -> Option<&uri::Rsync> {
        self.uris.iter().find_map(|uri| match uri {
            TalUri::Rsync(ref uri) => Some(uri),
            _ => None
        })
    }

    /// The DER encoded SubjectPublicKeyInfo the TA certificate must carry.
    pub fn key(&self) -> &Bytes {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}


/// # Wire format
///
impl Tal {
    pub fn compose(&self, buf: &mut crate::ipc::IoBuf) {
        buf.simple_u32(self.uris.len() as u32);
        for uri in &self.uris {
            buf.str(&uri.to_string());
        }
        buf.buf(self.key.as_ref());
        buf.str(&self.name);
    }

    pub fn parse_frame(
        frame: &mut crate::ipc::Frame
    ) -> io::Result<Self> {
        let count = frame.take_u32()?;
        let mut uris = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let uri = frame.take_str()?;
            uris.push(TalUri::from_slice(uri.as_bytes()).map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidData, "invalid TAL URI"
                )
            })?);
        }
        if uris.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData, "TAL without URIs"
            ))
        }
        Ok(Tal {
            uris,
            key: frame.take_buf()?,
            name: frame.take_str()?,
        })
    }
}


//------------ TalIter -------------------------------------------------------

pub struct TalIter(ReadDir);

impl Iterator for TalIter {
    type Item = Result<Tal, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.0.next() {
                Some(Ok(entry)) => {
                    match next_entry(&entry) {
                        Ok(Some(res)) => return Some(Ok(res)),
                        Ok(None) => { }
                        Err(err) => {
                            error!("Bad trust anchor {}", err);
                            return Some(Err(err))
                        }
                    }
                }
                Some(Err(err)) => return Some(Err(err.into())),
                None => return None
            };
        }
    }
}

fn next_entry(entry: &DirEntry) -> Result<Option<Tal>, ReadError> {
    if !entry.file_type()?.is_file() {
        return Ok(None)
    }
    let path = entry.path();
    if path.extension().map_or(true, |ext| ext != "tal") {
        return Ok(None)
    }
    debug!("Processing TAL {}", path.display());
    Tal::read(&path, &mut File::open(&path)?).map(Some)
}


//------------ TalUri --------------------------------------------------------

/// A URI a trust anchor certificate may be fetched from.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum TalUri {
    Rsync(uri::Rsync),
    Https(uri::Https),
}

impl TalUri {
    pub fn from_slice(slice: &[u8]) -> Result<Self, uri::Error> {
        if let Ok(uri) = uri::Rsync::from_slice(slice) {
            return Ok(TalUri::Rsync(uri))
        }
        uri::Https::from_slice(slice).map(TalUri::Https)
    }

    pub fn is_rsync(&self) -> bool {
        matches!(*self, TalUri::Rsync(_))
    }

    pub fn is_https(&self) -> bool {
        matches!(*self, TalUri::Https(_))
    }
}

impl From<uri::Rsync> for TalUri {
    fn from(uri: uri::Rsync) -> Self {
        TalUri::Rsync(uri)
    }
}

impl From<uri::Https> for TalUri {
    fn from(uri: uri::Https) -> Self {
        TalUri::Https(uri)
    }
}

impl fmt::Display for TalUri {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            TalUri::Rsync(ref inner) => inner.fmt(f),
            TalUri::Https(ref inner) => inner.fmt(f),
        }
    }
}


//------------ ReadError -----------------------------------------------------

#[derive(Debug)]
pub enum ReadError {
    Io(io::Error),
    UnexpectedEof,
    NoUris,
    BadUri(uri::Error),
    BadKeyEncoding(base64::DecodeError),
    BadKey,
}

impl From<io::Error> for ReadError {
    fn from(err: io::Error) -> ReadError {
        ReadError::Io(err)
    }
}

impl From<uri::Error> for ReadError {
    fn from(err: uri::Error) -> ReadError {
        ReadError::BadUri(err)
    }
}

impl From<base64::DecodeError> for ReadError {
    fn from(err: base64::DecodeError) -> ReadError {
        ReadError::BadKeyEncoding(err)
    }
}

impl<S: fmt::Display + fmt::Debug> From<DecodeError<S>> for ReadError {
    fn from(_: DecodeError<S>) -> ReadError {
        ReadError::BadKey
    }
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ReadError::Io(ref err) => err.fmt(f),
            ReadError::UnexpectedEof => {
                f.write_str("unexpected end of file")
            }
            ReadError::NoUris => f.write_str("no URIs in trust anchor"),
            ReadError::BadUri(ref err) => {
                write!(f, "bad trust anchor URI: {}", err)
            }
            ReadError::BadKeyEncoding(ref err) => {
                write!(f, "bad key info: {}", err)
            }
            ReadError::BadKey => f.write_str("bad key info"),
        }
    }
}

impl std::error::Error for ReadError { }


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    // A 512 bit RSA SubjectPublicKeyInfo; small but structurally valid.
    const KEY_B64: &str =
        "MFwwDQYJKoZIhvcNAQEBBQADSwAwSAJBAAECAwQFBgcICQoLDA0ODxAREhMUFRYX\n\
         GBkaGxwdHh8gISIjJCUmJygpKissLS4vMDEyMzQ1Njc4OTo7PD0+P0ACAwEAAQ==";

    fn sample_tal() -> String {
        format!(
            "# Example trust anchor\n\
             # for testing only\n\
             rsync://example.net/ta/root.cer\n\
             https://example.net/ta/root.cer\n\
             \n\
             {}\n",
            KEY_B64
        )
    }

    #[test]
    fn read_tal() {
        let data = sample_tal();
        let tal = Tal::read("example.tal", &mut data.as_bytes()).unwrap();
        assert_eq!(tal.name(), "example");
        assert_eq!(tal.uris().len(), 2);
        assert!(tal.uris().next().unwrap().is_rsync());
        assert_eq!(
            tal.rsync_uri().unwrap().to_string(),
            "rsync://example.net/ta/root.cer"
        );
        assert!(!tal.key().is_empty());
    }

    #[test]
    fn rejects_bad_key() {
        let data = "rsync://example.net/ta/root.cer\n\naGVsbG8=\n";
        assert!(matches!(
            Tal::read("x.tal", &mut data.as_bytes()),
            Err(ReadError::BadKey)
        ));
    }

    #[test]
    fn wire_round_trip() {
        let data = sample_tal();
        let tal = Tal::read("example.tal", &mut data.as_bytes()).unwrap();
        let mut buf = crate::ipc::IoBuf::new();
        tal.compose(&mut buf);
        let frame = buf.finish();
        let mut frame = crate::ipc::Frame::new(frame[4..].to_vec());
        let read = Tal::parse_frame(&mut frame).unwrap();
        assert_eq!(frame.remaining(), 0);
        assert_eq!(read.name(), tal.name());
        assert_eq!(read.key(), tal.key());
        assert_eq!(
            read.uris().map(|u| u.to_string()).collect::<Vec<_>>(),
            tal.uris().map(|u| u.to_string()).collect::<Vec<_>>(),
        );
    }

    #[test]
    fn rejects_empty_uri_list() {
        let data = format!("\n{}\n", KEY_B64);
        assert!(matches!(
            Tal::read("x.tal", &mut data.as_bytes()),
            Err(ReadError::NoUris)
        ));
    }
}
