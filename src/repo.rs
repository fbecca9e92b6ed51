//! The repository table.
//!
//! Every publication point maps to one repository record that tracks how
//! its local mirror is coming along. A repository starts out new, gets a
//! transport dispatched, and ends up ready or failed; an RRDP repository
//! that fails falls back to rsync first. Entities whose repository is
//! still in flight are parked here and flushed when the sync concludes.
//!
//! The table also owns the set of all file paths claimed during the run.
//! After the walk, everything below the cache root that no repository
//! claimed is garbage from an earlier run and gets removed.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use log::{info, warn};
use crate::crypto::DigestAlgorithm;
use crate::entity::Entity;
use crate::rrdp::{PublishType, RrdpSession};
use crate::tal::{Tal, TalUri};
use crate::uri;


//------------ Transport -----------------------------------------------------

/// The ways a repository can be synchronized.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Transport {
    Rsync,
    Http,
    Rrdp,
}


//------------ RepoState -----------------------------------------------------

/// Where a repository stands with its synchronization.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RepoState {
    /// Created but no fetch dispatched yet.
    New,

    /// A fetch over the preferred transport is in flight.
    Syncing,

    /// RRDP failed; rsync is having a go.
    Fallback,

    /// The local mirror is as good as it gets; entities may be parsed.
    Ready,

    /// Nothing more will happen for this repository.
    Failed,
}


//------------ RepoEvent -----------------------------------------------------

/// What the orchestrator must do after a state transition.
#[derive(Debug)]
pub enum RepoEvent {
    /// Nothing; e.g. a late completion for a finished repository.
    Nothing,

    /// The repository is ready; parse the flushed entities.
    Ready(Vec<Entity>),

    /// RRDP failed; dispatch an rsync fetch for the same repository.
    FallbackToRsync,

    /// The repository failed for good; the parked entities are dropped.
    Failed(Vec<Entity>),
}


//------------ Repo ----------------------------------------------------------

/// A single repository.
#[derive(Debug)]
pub struct Repo {
    /// The table index, used to tag fetch requests.
    id: usize,

    /// The publication point, e.g. `rsync://host/module/`.
    uri: String,

    /// The RRDP notification URI if the CA offers RRDP.
    notify: Option<uri::Https>,

    /// The candidate URIs when this is a trust anchor pseudo-repository.
    ta_uris: Vec<TalUri>,

    /// The local directory the repository mirrors into.
    local: PathBuf,

    state: RepoState,

    /// The transport that finally provided the data.
    provided_by: Option<Transport>,

    /// Entities waiting for the sync to conclude.
    queued: Vec<Entity>,

    /// When the current fetch was dispatched, for the watchdog.
    started: Option<Instant>,
}

impl Repo {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn notify(&self) -> Option<&uri::Https> {
        self.notify.as_ref()
    }

    pub fn ta_uris(&self) -> &[TalUri] {
        &self.ta_uris
    }

    pub fn local(&self) -> &Path {
        &self.local
    }

    pub fn state(&self) -> RepoState {
        self.state
    }

    pub fn provided_by(&self) -> Option<Transport> {
        self.provided_by
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, RepoState::Ready)
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, RepoState::Ready | RepoState::Failed)
    }

    /// The transport a fresh fetch should use.
    pub fn preferred_transport(&self) -> Transport {
        if !self.ta_uris.is_empty() {
            match self.ta_uris.iter().find(|uri| uri.is_https()) {
                Some(_) => Transport::Http,
                None => Transport::Rsync,
            }
        }
        else if self.notify.is_some() {
            Transport::Rrdp
        }
        else {
            Transport::Rsync
        }
    }

    /// Records that a fetch was dispatched.
    pub fn fetch_started(&mut self, now: Instant) {
        debug_assert!(matches!(
            self.state, RepoState::New | RepoState::Fallback
        ));
        if self.state == RepoState::New {
            self.state = RepoState::Syncing;
        }
        self.started = Some(now);
    }

    /// Parks an entity until the repository concludes.
    ///
    /// Returns false if the repository is already done and the entity
    /// should be processed (or dropped) right away.
    pub fn defer(&mut self, entity: Entity) -> bool {
        if self.is_done() {
            return false
        }
        self.queued.push(entity);
        true
    }

    /// Applies a transport completion.
    pub fn finish(&mut self, transport: Transport, ok: bool) -> RepoEvent {
        match self.state {
            RepoState::Syncing => {
                if ok {
                    self.became_ready(transport)
                }
                else if transport == Transport::Rrdp {
                    // RRDP gets a second chance over rsync.
                    self.state = RepoState::Fallback;
                    RepoEvent::FallbackToRsync
                }
                else {
                    self.became_failed()
                }
            }
            RepoState::Fallback => {
                if ok {
                    self.became_ready(transport)
                }
                else {
                    self.became_failed()
                }
            }
            // Late completion after a watchdog kill or duplicate
            // answer; drop it.
            _ => RepoEvent::Nothing
        }
    }

    /// Marks the repository failed if its budget is used up.
    pub fn check_timeout(
        &mut self, now: Instant, budget: Duration
    ) -> Option<RepoEvent> {
        if !matches!(
            self.state, RepoState::Syncing | RepoState::Fallback
        ) {
            return None
        }
        let started = self.started?;
        if now.duration_since(started) < budget {
            return None
        }
        warn!("{}: fetch timed out", self.uri);
        Some(self.became_failed())
    }

    fn became_ready(&mut self, transport: Transport) -> RepoEvent {
        self.state = RepoState::Ready;
        self.provided_by = Some(transport);
        info!("{}: loaded from {:?}", self.uri, transport);
        RepoEvent::Ready(std::mem::take(&mut self.queued))
    }

    fn became_failed(&mut self) -> RepoEvent {
        self.state = RepoState::Failed;
        RepoEvent::Failed(std::mem::take(&mut self.queued))
    }

    /// The path of the RRDP session state file of this repository.
    pub fn session_path(&self) -> PathBuf {
        self.local.join(".state.json")
    }

    /// Loads the persisted RRDP session state.
    pub fn load_session(&self) -> RrdpSession {
        RrdpSession::load(&self.session_path())
    }

    /// Maps a file name below the publication point into the local mirror.
    pub fn filename(&self, file: &str) -> PathBuf {
        self.local.join(file)
    }
}


//------------ RepoTable -----------------------------------------------------

/// All repositories of a run plus the claimed file paths.
#[derive(Debug, Default)]
pub struct RepoTable {
    repos: Vec<Repo>,

    /// Publication point to table index.
    by_uri: BTreeMap<String, usize>,

    /// Every local path written or claimed during this run.
    filepaths: BTreeSet<PathBuf>,
}

impl RepoTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.repos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repos.is_empty()
    }

    pub fn get(&self, id: usize) -> Option<&Repo> {
        self.repos.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Repo> {
        self.repos.get_mut(id)
    }

    pub fn iter(&self) -> std::slice::Iter<Repo> {
        self.repos.iter()
    }

    /// Returns the synthetic repository for a trust anchor.
    ///
    /// The mirror directory is `ta/<name>` below the cache root.
    pub fn ta_lookup(&mut self, tal: &Tal, cache_dir: &Path) -> usize {
        let key = format!("ta/{}", tal.name());
        if let Some(&id) = self.by_uri.get(&key) {
            return id
        }
        let id = self.repos.len();
        self.repos.push(Repo {
            id,
            uri: key.clone(),
            notify: None,
            ta_uris: tal.uris().cloned().collect(),
            local: cache_dir.join("ta").join(tal.name()),
            state: RepoState::New,
            provided_by: None,
            queued: Vec::new(),
            started: None,
        });
        self.by_uri.insert(key, id);
        id
    }

    /// Returns or creates the repository for a publication point.
    ///
    /// The point is the module of `uri`; everything below one module is
    /// mirrored in one go. When `notify` is present, RRDP is preferred
    /// with rsync as the fallback.
    pub fn lookup(
        &mut self,
        uri: &uri::Rsync,
        notify: Option<&uri::Https>,
        cache_dir: &Path,
    ) -> usize {
        let key = uri.module().to_uri();
        if let Some(&id) = self.by_uri.get(&key) {
            return id
        }
        let id = self.repos.len();
        self.repos.push(Repo {
            id,
            uri: key.clone(),
            notify: notify.cloned(),
            ta_uris: Vec::new(),
            local: cache_dir
                .join(uri.module().authority())
                .join(uri.module().module()),
            state: RepoState::New,
            provided_by: None,
            queued: Vec::new(),
            started: None,
        });
        self.by_uri.insert(key, id);
        id
    }

    /// Records a local path as claimed by this run.
    ///
    /// Returns false if the path was already claimed.
    pub fn filepath_add(&mut self, path: PathBuf) -> bool {
        self.filepaths.insert(path)
    }

    pub fn filepath_contains(&self, path: &Path) -> bool {
        self.filepaths.contains(path)
    }

    /// Applies one RRDP file operation to the local cache.
    ///
    /// The hash preconditions of RFC 8182 section 3.5.2 apply: an add
    /// must not clobber a file with different content, an update or
    /// withdraw must name the hash of the current content.
    pub fn rrdp_handle_file(
        &mut self,
        id: usize,
        what: PublishType,
        uri_str: &str,
        hash: Option<&[u8]>,
        data: &[u8],
    ) -> io::Result<()> {
        let repo = self.repos.get(id).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "unknown repo")
        })?;
        let parsed = uri::Rsync::from_slice(uri_str.as_bytes())
            .map_err(|_| bad_publish(uri_str, "invalid URI"))?;
        if parsed.module().to_uri() != repo.uri {
            return Err(bad_publish(uri_str, "outside publication point"))
        }
        let path = repo.local.join(parsed.path());

        match what {
            PublishType::Add => {
                if let Ok(existing) = fs::read(&path) {
                    let digest =
                        DigestAlgorithm::sha256().digest(&existing);
                    if Some(digest.as_ref()) != hash
                        && existing.as_slice() != data
                    {
                        return Err(bad_publish(
                            uri_str, "file exists with different content"
                        ))
                    }
                }
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&path, data)?;
            }
            PublishType::Update => {
                let expected = hash.ok_or_else(|| {
                    bad_publish(uri_str, "update without hash")
                })?;
                let existing = fs::read(&path).map_err(|_| {
                    bad_publish(uri_str, "update of missing file")
                })?;
                let digest = DigestAlgorithm::sha256().digest(&existing);
                if digest.as_ref() != expected {
                    return Err(bad_publish(uri_str, "hash mismatch"))
                }
                fs::write(&path, data)?;
            }
            PublishType::Withdraw => {
                let expected = hash.ok_or_else(|| {
                    bad_publish(uri_str, "withdraw without hash")
                })?;
                let existing = fs::read(&path).map_err(|_| {
                    bad_publish(uri_str, "withdraw of missing file")
                })?;
                let digest = DigestAlgorithm::sha256().digest(&existing);
                if digest.as_ref() != expected {
                    return Err(bad_publish(uri_str, "hash mismatch"))
                }
                fs::remove_file(&path)?;
                self.filepaths.remove(&path);
                return Ok(())
            }
        }
        self.filepaths.insert(path);
        Ok(())
    }

    /// Atomically persists a repository's RRDP session state.
    pub fn rrdp_save_state(
        &mut self, id: usize, session: &RrdpSession
    ) -> io::Result<()> {
        let repo = self.repos.get(id).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "unknown repo")
        })?;
        let path = repo.session_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        session.save(&path)?;
        self.filepaths.insert(path);
        Ok(())
    }

    /// Removes everything below `cache_dir` this run did not claim.
    ///
    /// Files go first, then directories that ended up empty, bottom-up.
    /// Returns the number of files and directories removed.
    pub fn cleanup(&self, cache_dir: &Path) -> (usize, usize) {
        let mut del_files = 0;
        let mut del_dirs = 0;
        cleanup_dir(
            cache_dir, &self.filepaths, &mut del_files, &mut del_dirs
        );
        (del_files, del_dirs)
    }
}

fn bad_publish(uri: &str, what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("{}: {}", uri, what),
    )
}

/// Removes unclaimed files below `dir`; returns whether it is now empty.
fn cleanup_dir(
    dir: &Path,
    keep: &BTreeSet<PathBuf>,
    del_files: &mut usize,
    del_dirs: &mut usize,
) -> bool {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return false
    };
    let mut empty = true;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_dir = entry.file_type()
            .map(|ft| ft.is_dir())
            .unwrap_or(false);
        if is_dir {
            if cleanup_dir(&path, keep, del_files, del_dirs) {
                if fs::remove_dir(&path).is_ok() {
                    *del_dirs += 1;
                    continue
                }
            }
            empty = false;
        }
        else if !keep.contains(&path) {
            if fs::remove_file(&path).is_ok() {
                *del_files += 1;
            }
            else {
                empty = false;
            }
        }
        else {
            empty = false;
        }
    }
    empty
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;
    use crate::entity::{Entity, RType};

    fn table_with_repo(notify: bool) -> (RepoTable, usize, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut table = RepoTable::new();
        let uri = uri::Rsync::from_str(
            "rsync://host/module/ca/cert.cer"
        ).unwrap();
        let notify = if notify {
            Some(uri::Https::from_str("https://host/notify.xml").unwrap())
        }
        else {
            None
        };
        let id = table.lookup(&uri, notify.as_ref(), dir.path());
        (table, id, dir)
    }

    #[test]
    fn lookup_is_keyed_by_module() {
        let (mut table, id, dir) = table_with_repo(false);
        let other = uri::Rsync::from_str(
            "rsync://host/module/other/file.roa"
        ).unwrap();
        assert_eq!(table.lookup(&other, None, dir.path()), id);
        let third = uri::Rsync::from_str(
            "rsync://host/other/file.roa"
        ).unwrap();
        assert_ne!(table.lookup(&third, None, dir.path()), id);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn state_machine_direct_rsync() {
        let (mut table, id, _dir) = table_with_repo(false);
        let repo = table.get_mut(id).unwrap();
        assert_eq!(repo.state(), RepoState::New);
        assert_eq!(repo.preferred_transport(), Transport::Rsync);

        repo.fetch_started(Instant::now());
        assert_eq!(repo.state(), RepoState::Syncing);
        assert!(repo.defer(
            Entity::new(RType::Cer, "x.cer".into(), "t".into())
        ));

        match repo.finish(Transport::Rsync, true) {
            RepoEvent::Ready(entities) => assert_eq!(entities.len(), 1),
            other => panic!("expected ready, got {:?}", other)
        }
        assert_eq!(repo.provided_by(), Some(Transport::Rsync));

        // A late completion is discarded.
        assert!(matches!(
            repo.finish(Transport::Rsync, false), RepoEvent::Nothing
        ));
    }

    #[test]
    fn state_machine_rrdp_fallback() {
        let (mut table, id, _dir) = table_with_repo(true);
        let repo = table.get_mut(id).unwrap();
        assert_eq!(repo.preferred_transport(), Transport::Rrdp);

        repo.fetch_started(Instant::now());
        assert!(matches!(
            repo.finish(Transport::Rrdp, false),
            RepoEvent::FallbackToRsync
        ));
        assert_eq!(repo.state(), RepoState::Fallback);

        repo.fetch_started(Instant::now());
        assert!(matches!(
            repo.finish(Transport::Rsync, true), RepoEvent::Ready(_)
        ));
        assert_eq!(repo.provided_by(), Some(Transport::Rsync));
    }

    #[test]
    fn state_machine_rrdp_fallback_fails() {
        let (mut table, id, _dir) = table_with_repo(true);
        let repo = table.get_mut(id).unwrap();
        repo.fetch_started(Instant::now());
        repo.finish(Transport::Rrdp, false);
        repo.fetch_started(Instant::now());
        assert!(matches!(
            repo.finish(Transport::Rsync, false), RepoEvent::Failed(_)
        ));
        assert_eq!(repo.state(), RepoState::Failed);
        // Deferral is refused once the repository is done.
        assert!(!repo.defer(
            Entity::new(RType::Cer, "x.cer".into(), "t".into())
        ));
    }

    #[test]
    fn watchdog_times_out() {
        let (mut table, id, _dir) = table_with_repo(false);
        let repo = table.get_mut(id).unwrap();
        let start = Instant::now();
        repo.fetch_started(start);
        assert!(repo.check_timeout(
            start + Duration::from_secs(1), Duration::from_secs(10)
        ).is_none());
        assert!(matches!(
            repo.check_timeout(
                start + Duration::from_secs(11), Duration::from_secs(10)
            ),
            Some(RepoEvent::Failed(_))
        ));
        // Completions after the kill are discarded.
        assert!(matches!(
            repo.finish(Transport::Rsync, true), RepoEvent::Nothing
        ));
    }

    #[test]
    fn rrdp_file_handling() {
        let (mut table, id, _dir) = table_with_repo(true);
        let uri = "rsync://host/module/ca/file.cer";

        // Add.
        table.rrdp_handle_file(
            id, PublishType::Add, uri, None, b"content"
        ).unwrap();
        let path = table.get(id).unwrap().filename("ca/file.cer");
        assert_eq!(fs::read(&path).unwrap(), b"content");
        assert!(table.filepath_contains(&path));

        // Update with matching hash.
        let digest = DigestAlgorithm::sha256().digest(b"content");
        table.rrdp_handle_file(
            id, PublishType::Update, uri, Some(digest.as_ref()), b"newer"
        ).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"newer");

        // Update with stale hash is refused.
        assert!(table.rrdp_handle_file(
            id, PublishType::Update, uri, Some(digest.as_ref()), b"x"
        ).is_err());

        // Withdraw with matching hash.
        let digest = DigestAlgorithm::sha256().digest(b"newer");
        table.rrdp_handle_file(
            id, PublishType::Withdraw, uri, Some(digest.as_ref()), b""
        ).unwrap();
        assert!(!path.exists());
        assert!(!table.filepath_contains(&path));

        // Publishing outside the module is refused.
        assert!(table.rrdp_handle_file(
            id, PublishType::Add, "rsync://evil/module/f.cer", None, b"x"
        ).is_err());
    }

    #[test]
    fn cleanup_removes_unclaimed() {
        let (mut table, id, dir) = table_with_repo(false);
        let keep = table.get(id).unwrap().filename("keep.cer");
        fs::create_dir_all(keep.parent().unwrap()).unwrap();
        fs::write(&keep, b"keep").unwrap();
        table.filepath_add(keep.clone());

        let stray = table.get(id).unwrap().filename("stray.cer");
        fs::write(&stray, b"stray").unwrap();
        let stray_dir = dir.path().join("host/gone");
        fs::create_dir_all(&stray_dir).unwrap();
        fs::write(stray_dir.join("old.roa"), b"x").unwrap();

        let (files, dirs) = table.cleanup(dir.path());
        assert_eq!(files, 2);
        assert!(dirs >= 1);
        assert!(keep.exists());
        assert!(!stray.exists());
        assert!(!stray_dir.exists());
    }
}
