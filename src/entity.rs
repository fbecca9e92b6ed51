//! Queued work items.
//!
//! An entity is one file that needs to be parsed and validated: its type,
//! its path in the local cache, the expected public key when it is a
//! trust anchor certificate, and the name of the TAL it descends from.
//! Entities wait in a FIFO queue; items whose repository is still syncing
//! are parked with the repository and flushed back when it is ready.

use std::collections::VecDeque;
use std::io;
use bytes::Bytes;
use crate::ipc::{Frame, IoBuf};


//------------ RType ---------------------------------------------------------

/// The resource types specified by the RPKI profiles.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RType {
    Tal,
    Mft,
    Roa,
    Cer,
    Crl,
    Gbr,
}

impl RType {
    /// Classifies a file by its name suffix.
    ///
    /// Returns `None` for unknown suffixes, which the walk ignores
    /// silently.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let ext = name.rsplit_once('.')?.1;
        match ext {
            "cer" => Some(RType::Cer),
            "mft" => Some(RType::Mft),
            "roa" => Some(RType::Roa),
            "crl" => Some(RType::Crl),
            "gbr" => Some(RType::Gbr),
            _ => None
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            RType::Tal => 1,
            RType::Mft => 2,
            RType::Roa => 3,
            RType::Cer => 4,
            RType::Crl => 5,
            RType::Gbr => 6,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(RType::Tal),
            2 => Some(RType::Mft),
            3 => Some(RType::Roa),
            4 => Some(RType::Cer),
            5 => Some(RType::Crl),
            6 => Some(RType::Gbr),
            _ => None
        }
    }
}


//------------ Entity --------------------------------------------------------

/// One file pending parse and validation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Entity {
    /// What kind of object the file should contain.
    pub rtype: RType,

    /// The path of the file in the local cache.
    pub path: String,

    /// The expected public key for a trust anchor certificate.
    pub pkey: Option<Bytes>,

    /// The name of the TAL this entity descends from.
    pub tal: String,
}

impl Entity {
    pub fn new(rtype: RType, path: String, tal: String) -> Self {
        Entity { rtype, path, pkey: None, tal }
    }

    pub fn with_pkey(
        rtype: RType, path: String, pkey: Bytes, tal: String
    ) -> Self {
        Entity { rtype, path, pkey: Some(pkey), tal }
    }

    /// Serializes the entity into a frame buffer.
    pub fn compose(&self, buf: &mut IoBuf) {
        buf.simple_u8(self.rtype.to_u8());
        buf.str(&self.path);
        buf.opt_buf(self.pkey.as_deref());
        buf.str(&self.tal);
    }

    /// Decodes an entity from a received frame.
    pub fn parse(frame: &mut Frame) -> io::Result<Self> {
        let rtype = RType::from_u8(frame.take_u8()?).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "bad entity type")
        })?;
        Ok(Entity {
            rtype,
            path: frame.take_str()?,
            pkey: frame.take_opt_buf()?,
            tal: frame.take_str()?,
        })
    }
}


//------------ EntityQueue ---------------------------------------------------

/// The FIFO of entities pending parse and validation.
#[derive(Debug, Default)]
pub struct EntityQueue {
    queue: VecDeque<Entity>,

    /// Entities handed to the parser whose responses are still out.
    outstanding: usize,
}

impl EntityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entity: Entity) {
        self.queue.push_back(entity)
    }

    pub fn pop(&mut self) -> Option<Entity> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Records that a request went out to the parser.
    pub fn sent(&mut self) {
        self.outstanding += 1
    }

    /// Records that a parser response came back.
    pub fn answered(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1)
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Returns whether all work has drained.
    pub fn idle(&self) -> bool {
        self.queue.is_empty() && self.outstanding == 0
    }
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classify_by_suffix() {
        assert_eq!(RType::from_file_name("x.cer"), Some(RType::Cer));
        assert_eq!(RType::from_file_name("x.mft"), Some(RType::Mft));
        assert_eq!(RType::from_file_name("x.roa"), Some(RType::Roa));
        assert_eq!(RType::from_file_name("x.crl"), Some(RType::Crl));
        assert_eq!(RType::from_file_name("x.gbr"), Some(RType::Gbr));
        // Unknown suffixes are silently ignored.
        assert_eq!(RType::from_file_name("x.txt"), None);
        assert_eq!(RType::from_file_name("no-extension"), None);
    }

    #[test]
    fn entity_frame_round_trip() {
        let entity = Entity::with_pkey(
            RType::Tal,
            "ta/example/root.cer".into(),
            Bytes::from_static(b"\x30\x0d"),
            "example".into(),
        );
        let mut buf = IoBuf::new();
        entity.compose(&mut buf);
        let frame = buf.finish();
        let mut frame = crate::ipc::Frame::new(frame[4..].to_vec());
        assert_eq!(Entity::parse(&mut frame).unwrap(), entity);

        let entity = Entity::new(
            RType::Roa, "repo/a/b.roa".into(), "example".into()
        );
        let mut buf = IoBuf::new();
        entity.compose(&mut buf);
        let frame = buf.finish();
        let mut frame = crate::ipc::Frame::new(frame[4..].to_vec());
        assert_eq!(Entity::parse(&mut frame).unwrap(), entity);
    }

    #[test]
    fn queue_tracks_outstanding() {
        let mut queue = EntityQueue::new();
        assert!(queue.idle());
        queue.push(Entity::new(RType::Cer, "a.cer".into(), "t".into()));
        assert!(!queue.idle());
        let _ = queue.pop().unwrap();
        queue.sent();
        assert!(!queue.idle());
        queue.answered();
        assert!(queue.idle());
    }
}
