//! The RPKI Repository Delta Protocol.
//!
//! RRDP (RFC 8182) delivers repository contents over HTTPS: a small
//! notification file names the current session and serial together with a
//! snapshot and a list of deltas. A relying party that is on the same
//! session applies the missing deltas; otherwise it reloads the snapshot.
//! This module holds the per-repository session state and the parsers for
//! the three document types. The actual fetching and file shuffling lives
//! with the RRDP worker and the repository table.

use std::{fmt, io};
use std::fs;
use std::path::Path;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::xml;


//------------ RrdpSession ---------------------------------------------------

/// The persisted state of one RRDP repository.
///
/// Saved after every successful sync so the next run can pick up at the
/// right spot.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RrdpSession {
    /// The session identity given by the server.
    pub session_id: Uuid,

    /// The serial we have successfully applied.
    pub serial: u64,

    /// The Last-Modified header of the last notification fetch.
    pub last_mod: Option<String>,
}

impl RrdpSession {
    /// A fresh state forcing a snapshot load.
    pub fn new() -> Self {
        RrdpSession {
            session_id: Uuid::nil(),
            serial: 0,
            last_mod: None,
        }
    }

    /// Loads persisted state, falling back to a fresh one.
    pub fn load(path: &Path) -> Self {
        fs::File::open(path).ok()
            .and_then(|file| serde_json::from_reader(file).ok())
            .unwrap_or_else(Self::new)
    }

    /// Atomically persists the state next to the repository.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let tmp = path.with_extension("tmp");
        let data = serde_json::to_vec_pretty(self)?;
        fs::write(&tmp, data)?;
        fs::rename(&tmp, path)
    }
}

impl Default for RrdpSession {
    fn default() -> Self {
        Self::new()
    }
}


//------------ NotificationFile ----------------------------------------------

/// A parsed update notification file.
pub struct NotificationFile {
    pub session_id: Uuid,
    pub serial: u64,
    pub snapshot: UriAndHash,
    pub deltas: Vec<(u64, UriAndHash)>,
}

impl NotificationFile {
    pub fn parse<R: io::BufRead>(reader: R) -> Result<Self, xml::Error> {
        let mut reader = xml::Reader::new(reader);

        let mut session_id = None;
        let mut serial = None;
        let mut outer = reader.start(|element| {
            if element.name() != b"notification" {
                return Err(xml::Error::Malformed)
            }
            element.attributes(|name, value| match name {
                b"version" => {
                    if value.ascii_into::<u8>()? != 1 {
                        return Err(xml::Error::Malformed)
                    }
                    Ok(())
                }
                b"session_id" => {
                    session_id = Some(value.ascii_into()?);
                    Ok(())
                }
                b"serial" => {
                    serial = Some(value.ascii_into()?);
                    Ok(())
                }
                _ => Err(xml::Error::Malformed)
            })
        })?;

        let mut snapshot = None;
        let mut deltas = Vec::new();
        while let Some(mut content) = outer.take_opt_element(
            &mut reader,
            |element| {
                match element.name() {
                    b"snapshot" => {
                        if snapshot.is_some() {
                            return Err(xml::Error::Malformed)
                        }
                        snapshot = Some(UriAndHash::from_element(&element)?);
                        Ok(())
                    }
                    b"delta" => {
                        let mut serial = None;
                        let uri_hash = UriAndHash::from_element_with(
                            &element,
                            |name, value| match name {
                                b"serial" => {
                                    serial = Some(value.ascii_into()?);
                                    Ok(())
                                }
                                _ => Err(xml::Error::Malformed)
                            }
                        )?;
                        match serial {
                            Some(serial) => {
                                deltas.push((serial, uri_hash));
                                Ok(())
                            }
                            None => Err(xml::Error::Malformed)
                        }
                    }
                    _ => Err(xml::Error::Malformed)
                }
            }
        )? {
            content.take_end(&mut reader)?;
        }

        reader.end()?;
        match (session_id, serial, snapshot) {
            (Some(session_id), Some(serial), Some(snapshot)) => {
                deltas.sort_by_key(|delta| delta.0);
                Ok(NotificationFile {
                    session_id, serial, snapshot, deltas
                })
            }
            _ => Err(xml::Error::Malformed)
        }
    }

    /// Decides how to catch up from `state` to this notification.
    pub fn plan(&self, state: &RrdpSession) -> FetchPlan {
        if self.session_id == state.session_id
            && self.serial == state.serial
        {
            return FetchPlan::UpToDate
        }
        if self.session_id == state.session_id
            && self.serial > state.serial
        {
            // All deltas from the next serial on must be present and
            // contiguous, otherwise we fall back to the snapshot.
            let mut expected = state.serial + 1;
            let mut plan = Vec::new();
            for (serial, uri_hash) in &self.deltas {
                if *serial < expected {
                    continue
                }
                if *serial != expected {
                    return FetchPlan::Snapshot
                }
                plan.push((*serial, uri_hash.clone()));
                expected += 1;
            }
            if expected == self.serial + 1 {
                return FetchPlan::Deltas(plan)
            }
        }
        FetchPlan::Snapshot
    }
}


//------------ FetchPlan -----------------------------------------------------

/// How to catch up with a repository.
#[derive(Clone, Debug)]
pub enum FetchPlan {
    /// Nothing changed since last time.
    UpToDate,

    /// Apply these deltas in order.
    Deltas(Vec<(u64, UriAndHash)>),

    /// Reload the whole snapshot.
    Snapshot,
}


//------------ UriAndHash ----------------------------------------------------

/// A URI together with the SHA-256 hash of the document behind it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UriAndHash {
    pub uri: String,
    pub hash: [u8; 32],
}

impl UriAndHash {
    fn from_element(element: &xml::Element) -> Result<Self, xml::Error> {
        Self::from_element_with(element, |_, _| Err(xml::Error::Malformed))
    }

    /// Collects the uri and hash attributes, handing anything else on.
    fn from_element_with<F>(
        element: &xml::Element,
        mut extra: F,
    ) -> Result<Self, xml::Error>
    where F: FnMut(&[u8], xml::AttrValue) -> Result<(), xml::Error> {
        let mut uri = None;
        let mut hash = None;
        element.attributes(|name, value| match name {
            b"uri" => {
                uri = Some(value.ascii_into::<String>()?);
                Ok(())
            }
            b"hash" => {
                hash = Some(decode_hash(
                    &value.ascii_into::<String>()?
                ).ok_or(xml::Error::Malformed)?);
                Ok(())
            }
            _ => extra(name, value)
        })?;
        match (uri, hash) {
            (Some(uri), Some(hash)) => Ok(UriAndHash { uri, hash }),
            _ => Err(xml::Error::Malformed)
        }
    }
}


//------------ PublishType ---------------------------------------------------

/// What a delta element does to a file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PublishType {
    /// Create the file; it must not exist yet with different content.
    Add,

    /// Replace the file; the old content's hash must match.
    Update,

    /// Remove the file; its content's hash must match.
    Withdraw,
}

impl PublishType {
    pub fn to_u8(self) -> u8 {
        match self {
            PublishType::Add => 0,
            PublishType::Update => 1,
            PublishType::Withdraw => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PublishType::Add),
            1 => Some(PublishType::Update),
            2 => Some(PublishType::Withdraw),
            _ => None
        }
    }
}

impl fmt::Display for PublishType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            PublishType::Add => "publish",
            PublishType::Update => "update",
            PublishType::Withdraw => "withdraw",
        })
    }
}


//------------ Snapshot and delta processing ---------------------------------

/// One file operation from a snapshot or delta document.
pub struct FileOp {
    pub what: PublishType,
    pub uri: String,

    /// The expected hash of the existing file for update and withdraw.
    pub hash: Option<[u8; 32]>,

    /// The new file body; empty for withdraw.
    pub data: Vec<u8>,
}

/// Parses a snapshot document, streaming each publish element to `op`.
///
/// The session and serial attributes must match the notification that
/// led here.
pub fn parse_snapshot<R, F>(
    reader: R,
    session_id: Uuid,
    serial: u64,
    mut op: F,
) -> Result<(), xml::Error>
where
    R: io::BufRead,
    F: FnMut(FileOp) -> Result<(), xml::Error>,
{
    let mut reader = xml::Reader::new(reader);
    let mut outer = reader.start(|element| {
        if element.name() != b"snapshot" {
            return Err(xml::Error::Malformed)
        }
        check_session_attrs(&element, session_id, serial)
    })?;

    loop {
        let mut uri = None;
        let content = outer.take_opt_element(&mut reader, |element| {
            if element.name() != b"publish" {
                return Err(xml::Error::Malformed)
            }
            element.attributes(|name, value| match name {
                b"uri" => {
                    uri = Some(value.ascii_into::<String>()?);
                    Ok(())
                }
                _ => Err(xml::Error::Malformed)
            })
        })?;
        let mut content = match content {
            Some(content) => content,
            None => break
        };
        let uri = uri.ok_or(xml::Error::Malformed)?;
        let data = content.take_final_text(&mut reader, |text| {
            text.base64_decode()
        })?;
        op(FileOp {
            what: PublishType::Add,
            uri,
            hash: None,
            data,
        })?;
    }

    reader.end()
}

/// Parses a delta document, streaming each operation to `op`.
pub fn parse_delta<R, F>(
    reader: R,
    session_id: Uuid,
    serial: u64,
    mut op: F,
) -> Result<(), xml::Error>
where
    R: io::BufRead,
    F: FnMut(FileOp) -> Result<(), xml::Error>,
{
    let mut reader = xml::Reader::new(reader);
    let mut outer = reader.start(|element| {
        if element.name() != b"delta" {
            return Err(xml::Error::Malformed)
        }
        check_session_attrs(&element, session_id, serial)
    })?;

    loop {
        let mut withdraw = false;
        let mut uri = None;
        let mut hash = None;
        let content = outer.take_opt_element(&mut reader, |element| {
            match element.name() {
                b"publish" => { }
                b"withdraw" => withdraw = true,
                _ => return Err(xml::Error::Malformed)
            }
            element.attributes(|name, value| match name {
                b"uri" => {
                    uri = Some(value.ascii_into::<String>()?);
                    Ok(())
                }
                b"hash" => {
                    hash = Some(decode_hash(
                        &value.ascii_into::<String>()?
                    ).ok_or(xml::Error::Malformed)?);
                    Ok(())
                }
                _ => Err(xml::Error::Malformed)
            })
        })?;
        let mut content = match content {
            Some(content) => content,
            None => break
        };
        let uri = uri.ok_or(xml::Error::Malformed)?;
        let data = content.take_final_text(&mut reader, |text| {
            text.base64_decode()
        })?;
        let what = if withdraw {
            // A withdraw carries no content and must name the hash of
            // the file it removes (RFC 8182, 3.5.3).
            if !data.is_empty() || hash.is_none() {
                return Err(xml::Error::Malformed)
            }
            PublishType::Withdraw
        }
        else if hash.is_some() {
            PublishType::Update
        }
        else {
            PublishType::Add
        };
        op(FileOp { what, uri, hash, data })?;
    }

    reader.end()
}

fn check_session_attrs(
    element: &xml::Element,
    session_id: Uuid,
    serial: u64,
) -> Result<(), xml::Error> {
    let mut ok_session = false;
    let mut ok_serial = false;
    element.attributes(|name, value| match name {
        b"version" => {
            if value.ascii_into::<u8>()? != 1 {
                return Err(xml::Error::Malformed)
            }
            Ok(())
        }
        b"session_id" => {
            ok_session = value.ascii_into::<Uuid>()? == session_id;
            Ok(())
        }
        b"serial" => {
            ok_serial = value.ascii_into::<u64>()? == serial;
            Ok(())
        }
        _ => Err(xml::Error::Malformed)
    })?;
    if ok_session && ok_serial {
        Ok(())
    }
    else {
        Err(xml::Error::Malformed)
    }
}


//------------ Helpers -------------------------------------------------------

/// Decodes a lowercase or uppercase hex SHA-256 hash.
pub fn decode_hash(s: &str) -> Option<[u8; 32]> {
    if s.len() != 64 || !s.is_ascii() {
        return None
    }
    let mut res = [0u8; 32];
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let chunk = std::str::from_utf8(chunk).ok()?;
        res[i] = u8::from_str_radix(chunk, 16).ok()?;
    }
    Some(res)
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    const SESSION: &str = "9df4b597-af9e-4dca-bdda-719cce2c4e28";
    const HASH: &str =
        "aaaabbbbccccddddeeeeffff00001111\
         22223333444455556666777788889999";

    fn hash_str() -> String {
        HASH.into()
    }

    fn notification_xml() -> String {
        format!(
            r#"<notification xmlns="http://www.ripe.net/rpki/rrdp"
                version="1" session_id="{s}" serial="42">
                <snapshot uri="https://x.example/snap.xml" hash="{h}"/>
                <delta serial="42"
                    uri="https://x.example/42.xml" hash="{h}"/>
                <delta serial="41"
                    uri="https://x.example/41.xml" hash="{h}"/>
            </notification>"#,
            s = SESSION, h = hash_str()
        )
    }

    #[test]
    fn parse_notification() {
        let doc = notification_xml();
        let not = NotificationFile::parse(doc.as_bytes()).unwrap();
        assert_eq!(not.session_id.to_string(), SESSION);
        assert_eq!(not.serial, 42);
        assert_eq!(not.snapshot.uri, "https://x.example/snap.xml");
        // Deltas come out sorted by serial.
        assert_eq!(not.deltas[0].0, 41);
        assert_eq!(not.deltas[1].0, 42);
    }

    #[test]
    fn plan_decides_deltas_or_snapshot() {
        let doc = notification_xml();
        let not = NotificationFile::parse(doc.as_bytes()).unwrap();

        // Same session, behind by both available deltas.
        let state = RrdpSession {
            session_id: SESSION.parse().unwrap(),
            serial: 40,
            last_mod: None,
        };
        match not.plan(&state) {
            FetchPlan::Deltas(deltas) => {
                assert_eq!(deltas.len(), 2);
                assert_eq!(deltas[0].0, 41);
            }
            other => panic!("expected deltas, got {:?}", other)
        }

        // Caught up already.
        let state = RrdpSession {
            serial: 42, ..state.clone()
        };
        assert!(matches!(not.plan(&state), FetchPlan::UpToDate));

        // Too far behind: the delta chain does not reach back.
        let state = RrdpSession {
            serial: 10, ..state.clone()
        };
        assert!(matches!(not.plan(&state), FetchPlan::Snapshot));

        // Different session: snapshot.
        let state = RrdpSession::new();
        assert!(matches!(not.plan(&state), FetchPlan::Snapshot));
    }

    #[test]
    fn parse_snapshot_streams_files() {
        let doc = format!(
            r#"<snapshot xmlns="http://www.ripe.net/rpki/rrdp"
                version="1" session_id="{s}" serial="42">
                <publish uri="rsync://x.example/repo/a.cer">aGVsbG8=
                </publish>
                <publish uri="rsync://x.example/repo/b.roa">d29ybGQ=
                </publish>
            </snapshot>"#,
            s = SESSION
        );
        let mut seen = Vec::new();
        parse_snapshot(
            doc.as_bytes(),
            SESSION.parse().unwrap(),
            42,
            |op| {
                assert_eq!(op.what, PublishType::Add);
                seen.push((op.uri, op.data));
                Ok(())
            }
        ).unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "rsync://x.example/repo/a.cer");
        assert_eq!(seen[0].1, b"hello");
        assert_eq!(seen[1].1, b"world");
    }

    #[test]
    fn parse_snapshot_rejects_wrong_serial() {
        let doc = format!(
            r#"<snapshot version="1" session_id="{s}" serial="41">
            </snapshot>"#,
            s = SESSION
        );
        assert!(parse_snapshot(
            doc.as_bytes(), SESSION.parse().unwrap(), 42, |_| Ok(())
        ).is_err());
    }

    #[test]
    fn parse_delta_classifies_operations() {
        let doc = format!(
            r#"<delta version="1" session_id="{s}" serial="43">
                <publish uri="rsync://x.example/repo/new.cer">aGVsbG8=
                </publish>
                <publish uri="rsync://x.example/repo/upd.roa"
                    hash="{h}">d29ybGQ=</publish>
                <withdraw uri="rsync://x.example/repo/old.gbr"
                    hash="{h}"/>
            </delta>"#,
            s = SESSION, h = hash_str()
        );
        let mut seen = Vec::new();
        parse_delta(
            doc.as_bytes(),
            SESSION.parse().unwrap(),
            43,
            |op| {
                seen.push((op.what, op.uri, op.hash.is_some()));
                Ok(())
            }
        ).unwrap();
        assert_eq!(seen[0], (
            PublishType::Add, "rsync://x.example/repo/new.cer".into(), false
        ));
        assert_eq!(seen[1], (
            PublishType::Update, "rsync://x.example/repo/upd.roa".into(), true
        ));
        assert_eq!(seen[2], (
            PublishType::Withdraw, "rsync://x.example/repo/old.gbr".into(),
            true
        ));
    }

    #[test]
    fn session_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let state = RrdpSession {
            session_id: SESSION.parse().unwrap(),
            serial: 7,
            last_mod: Some("Tue, 01 Jan 2030 00:00:00 GMT".into()),
        };
        state.save(&path).unwrap();
        assert_eq!(RrdpSession::load(&path), state);
        // A missing or corrupt file yields a fresh session.
        assert_eq!(
            RrdpSession::load(&dir.path().join("nope.json")),
            RrdpSession::new()
        );
    }

    #[test]
    fn hash_decoding() {
        assert!(decode_hash(&hash_str()).is_some());
        assert!(decode_hash("abcd").is_none());
        assert!(decode_hash(&"g".repeat(64)).is_none());
    }
}
