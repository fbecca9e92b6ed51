//! URIs.
//!
//! RPKI objects point at each other through rsync URIs, with RRDP adding
//! HTTPS URIs for the update notification files. Both types here implement
//! a simplified form of the respective URI syntax: only absolute URIs with
//! an authority are allowed, no forbidden characters may be present, and
//! dot segments are rejected outright since they would allow an object to
//! escape its repository's directory.

use std::{fmt, hash, str};
use std::convert::TryFrom;
use std::str::FromStr;
use bytes::{Buf, BufMut, Bytes, BytesMut};


//------------ Rsync ---------------------------------------------------------

/// An rsync URI.
///
/// This implements a simplified form of the rsync URI defined in RFC 5781
/// which in turn references RFC 3986.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct Rsync {
    module: RsyncModule,
    path: Bytes,
}

impl Rsync {
    pub fn new(module: RsyncModule, path: Bytes) -> Self {
        Rsync { module, path }
    }

    pub fn from_string(s: String) -> Result<Self, Error> {
        Self::from_bytes(Bytes::from(s))
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, Error> {
        Self::from_bytes(Bytes::copy_from_slice(slice))
    }

    pub fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        if !is_uri_ascii(&bytes) {
            return Err(Error::NotAscii)
        }
        if bytes.len() < 8 || !bytes[..8].eq_ignore_ascii_case(b"rsync://") {
            return Err(Error::BadScheme)
        }
        bytes.advance(8);

        let (authority, module) = {
            let mut parts = bytes.splitn(3, |ch| *ch == b'/');
            let authority = match parts.next() {
                Some(part) if !part.is_empty() => part.len(),
                _ => return Err(Error::BadUri)
            };
            let module = match parts.next() {
                Some(part) if !part.is_empty() => part.len(),
                _ => return Err(Error::BadUri)
            };
            (authority, module)
        };
        let authority = bytes.split_to(authority);
        bytes.advance(1);
        let module = bytes.split_to(module);
        if bytes.is_empty() {
            return Err(Error::BadUri)
        }
        bytes.advance(1);
        Self::check_path(&bytes)?;
        Ok(Rsync {
            module: RsyncModule::new(authority, module),
            path: bytes
        })
    }

    fn check_path(path: &[u8]) -> Result<(), Error> {
        // No ".." or "." anywhere. No empty segments except at the end.
        let mut items = path.split(|ch| *ch == b'/');
        loop {
            let item = match items.next() {
                Some(item) => item,
                None => return Ok(())
            };
            if item.is_empty() {
                break
            }
            if item == b".." || item == b"." {
                return Err(Error::DotSegments)
            }
        }
        if items.next().is_some() {
            Err(Error::EmptySegments)
        }
        else {
            Ok(())
        }
    }

    pub fn module(&self) -> &RsyncModule {
        &self.module
    }

    pub fn to_module(&self) -> RsyncModule {
        self.module.clone()
    }

    pub fn authority(&self) -> &str {
        self.module.authority()
    }

    pub fn path(&self) -> &str {
        unsafe { str::from_utf8_unchecked(self.path.as_ref()) }
    }

    /// Returns the last path segment, if there is one.
    pub fn file_name(&self) -> Option<&str> {
        let path = self.path();
        if path.is_empty() || path.ends_with('/') {
            None
        }
        else {
            path.rsplit('/').next()
        }
    }

    /// Returns the URI of the directory containing this URI's target.
    pub fn parent(&self) -> Option<Self> {
        // rsplit always returns at least one element.
        let tail = self.path.rsplit(|ch| *ch == b'/').next().unwrap().len();
        if tail == 0 {
            None
        }
        else {
            let mut res = self.clone();
            if tail == self.path.len() {
                res.path = Bytes::from_static(b"")
            }
            else {
                res.path = self.path.slice(..self.path.len() - tail - 1);
            }
            Some(res)
        }
    }

    pub fn join(&self, path: &[u8]) -> Self {
        assert!(is_uri_ascii(path));
        let mut res = BytesMut::with_capacity(
            self.path.len() + path.len() + 1
        );
        if !self.path.is_empty() {
            res.put_slice(self.path.as_ref());
            if !self.path.ends_with(b"/") {
                res.put_slice(b"/");
            }
        }
        res.put_slice(path);
        Self::new(self.module.clone(), res.freeze())
    }

    pub fn ends_with(&self, extension: &str) -> bool {
        self.path.ends_with(extension.as_bytes())
    }

    /// Returns whether this URI names a directory containing the other.
    pub fn is_parent_of(&self, other: &Rsync) -> bool {
        self.module == other.module &&
        (self.path.is_empty() || (
            other.path.starts_with(self.path.as_ref()) &&
            (self.path.ends_with(b"/") ||
                other.path.get(self.path.len()) == Some(&b'/'))
        ))
    }
}


//--- TryFrom and FromStr

impl TryFrom<String> for Rsync {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Error> {
        Self::from_string(s)
    }
}

impl FromStr for Rsync {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Self::from_slice(s.as_bytes())
    }
}


//--- Display

impl fmt::Display for Rsync {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f, "rsync://{}/{}/{}",
            self.module.authority(), self.module.module(), self.path()
        )
    }
}


//------------ RsyncModule ---------------------------------------------------

/// The authority and module part of an rsync URI.
///
/// An rsync fetch always mirrors a whole module, so this is the unit the
/// repository table keys transports on.
#[derive(Clone, Debug, Eq, Ord, PartialOrd)]
pub struct RsyncModule {
    authority: Bytes,
    module: Bytes,
}

impl RsyncModule {
    pub fn new<A, M>(authority: A, module: M) -> Self
    where A: Into<Bytes>, M: Into<Bytes> {
        RsyncModule {
            authority: authority.into(),
            module: module.into(),
        }
    }

    pub fn authority(&self) -> &str {
        unsafe { str::from_utf8_unchecked(self.authority.as_ref()) }
    }

    pub fn module(&self) -> &str {
        unsafe { str::from_utf8_unchecked(self.module.as_ref()) }
    }

    pub fn to_uri(&self) -> String {
        format!("rsync://{}/{}/", self.authority(), self.module())
    }
}


//--- PartialEq and Hash
//
//    The authority is a host name and therefore case insensitive.

impl PartialEq for RsyncModule {
    fn eq(&self, other: &Self) -> bool {
        self.authority.eq_ignore_ascii_case(other.authority.as_ref())
        && self.module == other.module
    }
}

impl hash::Hash for RsyncModule {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        for ch in self.authority.as_ref() {
            ch.to_ascii_lowercase().hash(state)
        }
        self.module.hash(state)
    }
}

impl fmt::Display for RsyncModule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "rsync://{}/{}/", self.authority(), self.module())
    }
}


//------------ Https ---------------------------------------------------------

/// An HTTPS URI, as used by RRDP update notification files.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct Https {
    uri: Bytes,

    /// Length of the "https://" prefix plus the authority.
    path_idx: usize,
}

impl Https {
    pub fn from_string(s: String) -> Result<Self, Error> {
        Self::from_bytes(Bytes::from(s))
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, Error> {
        Self::from_bytes(Bytes::copy_from_slice(slice))
    }

    pub fn from_bytes(bytes: Bytes) -> Result<Self, Error> {
        if !is_uri_ascii(&bytes) {
            return Err(Error::NotAscii)
        }
        const SCHEME: &[u8] = b"https://";
        if bytes.len() < SCHEME.len()
            || !bytes[..SCHEME.len()].eq_ignore_ascii_case(SCHEME)
        {
            return Err(Error::BadScheme)
        }
        let authority = bytes[SCHEME.len()..].iter()
            .position(|ch| *ch == b'/')
            .unwrap_or(bytes.len() - SCHEME.len());
        if authority == 0 {
            return Err(Error::BadUri)
        }
        Ok(Https { uri: bytes, path_idx: SCHEME.len() + authority })
    }

    pub fn authority(&self) -> &str {
        &self.as_str()[8..self.path_idx]
    }

    pub fn path(&self) -> &str {
        &self.as_str()[self.path_idx..]
    }

    pub fn as_str(&self) -> &str {
        unsafe { str::from_utf8_unchecked(self.uri.as_ref()) }
    }
}


//--- TryFrom and FromStr

impl TryFrom<String> for Https {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Error> {
        Self::from_string(s)
    }
}

impl FromStr for Https {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Self::from_slice(s.as_bytes())
    }
}


//--- AsRef and Display

impl AsRef<str> for Https {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for Https {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


//------------ Helpers -------------------------------------------------------

/// Returns whether the slice contains only characters allowed in a URI.
///
/// In particular, forbidden are
///
///    SPACE CONTROL " # < > ? [ \ ] ^ ` { | }
pub fn is_uri_ascii(slice: &[u8]) -> bool {
    slice.iter().all(|&ch| {
        matches!(ch,
            b'!' | b'$'..=b';' | b'=' | b'@'..=b'Z' | b'_' | b'a'..=b'z'
            | b'~'
        )
    })
}


//------------ Error ---------------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    NotAscii,
    BadUri,
    BadScheme,
    DotSegments,
    EmptySegments,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            Error::NotAscii => "invalid characters",
            Error::BadUri => "bad URI",
            Error::BadScheme => "bad URI scheme",
            Error::DotSegments => "URI with dot path segments",
            Error::EmptySegments => "URI with empty path segments",
        })
    }
}

impl std::error::Error for Error { }


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rsync_from_str() {
        let uri = Rsync::from_str(
            "rsync://rpki.example.net/repo/ca/cert.cer"
        ).unwrap();
        assert_eq!(uri.authority(), "rpki.example.net");
        assert_eq!(uri.module().module(), "repo");
        assert_eq!(uri.path(), "ca/cert.cer");
        assert_eq!(uri.file_name(), Some("cert.cer"));
    }

    #[test]
    fn rsync_rejects_bad_input() {
        assert_eq!(
            Rsync::from_str("http://example.net/m/p"),
            Err(Error::BadScheme)
        );
        assert_eq!(
            Rsync::from_str("rsync://example.net/m/a/../b"),
            Err(Error::DotSegments)
        );
        assert_eq!(
            Rsync::from_str("rsync://example.net/m/a//b"),
            Err(Error::EmptySegments)
        );
        assert_eq!(
            Rsync::from_str("rsync://example.net/m/a b"),
            Err(Error::NotAscii)
        );
        assert!(Rsync::from_str("rsync://example.net/m").is_err());
    }

    #[test]
    fn rsync_join_and_parent() {
        let base = Rsync::from_str("rsync://host/mod/dir").unwrap();
        let joined = base.join(b"file.roa");
        assert_eq!(joined.path(), "dir/file.roa");
        assert_eq!(joined.parent().unwrap().path(), "dir");
        assert!(base.is_parent_of(&joined));
        let other = Rsync::from_str("rsync://host/mod/dirx/f").unwrap();
        assert!(!base.is_parent_of(&other));
    }

    #[test]
    fn https_from_str() {
        let uri = Https::from_str(
            "https://rrdp.example.net/notification.xml"
        ).unwrap();
        assert_eq!(uri.authority(), "rrdp.example.net");
        assert_eq!(uri.path(), "/notification.xml");
        assert_eq!(Https::from_str("https://"), Err(Error::BadUri));
        assert_eq!(
            Https::from_str("rsync://a/b/c"),
            Err(Error::BadScheme)
        );
    }

    #[test]
    fn module_authority_case_insensitive() {
        let a = Rsync::from_str("rsync://Example.NET/mod/p").unwrap();
        let b = Rsync::from_str("rsync://example.net/mod/p").unwrap();
        assert_eq!(a.module(), b.module());
    }
}
