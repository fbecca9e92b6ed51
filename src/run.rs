//! The orchestrator.
//!
//! The main process owns the work queue, the repository table, the
//! authentication tree, the CRL index and the VRP store, and drives the
//! whole validation run: TALs are read, trust anchors fetched and
//! installed, manifests walked, and every validated ROA folded into the
//! store. All heavy lifting happens in the worker processes; the
//! orchestrator multiplexes their four channels with a readiness wait
//! and never blocks on a single descriptor.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::fs;
use std::io;
use std::os::fd::{IntoRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Instant;
use bytes::Bytes;
use log::{info, warn};
use crate::config::Config;
use crate::crl::CrlTree;
use crate::crypto::KeyIdentifier;
use crate::entity::{Entity, EntityQueue, RType};
use crate::ipc::{Channel, Frame, IoBuf};
use crate::mft::Mft;
use crate::output;
use crate::repo::{RepoEvent, RepoState, RepoTable, Transport};
use crate::roa::Roa;
use crate::rrdp::{PublishType, RrdpSession};
use crate::stats::Stats;
use crate::tal::{Tal, TalUri};
use crate::validate::{
    valid_cert, valid_roa, valid_ski_aki, valid_ta, AuthTree,
};
use crate::vrp::VrpStore;
use crate::worker::{
    rrdp_msg, HttpResult, PROC_HTTP, PROC_PARSER, PROC_RRDP, PROC_RSYNC,
};
use crate::cert::Cert;
use crate::crl::Crl;
use crate::gbr::Gbr;


//------------ Runner --------------------------------------------------------

/// One validation run.
pub struct Runner<'a> {
    config: &'a Config,

    parser: Worker,
    rsync: Worker,
    http: Worker,
    rrdp: Worker,

    repos: RepoTable,
    queue: EntityQueue,
    auths: AuthTree,
    crls: CrlTree,
    vrps: VrpStore,
    stats: Stats,

    /// Who the HTTP responses currently in flight belong to, in request
    /// order; the HTTP worker answers strictly FIFO.
    http_pending: VecDeque<HttpReq>,

    /// RRDP session states announced by the worker but not yet final.
    rrdp_sessions: BTreeMap<usize, RrdpSession>,

    /// The TALs by name, kept for the trust anchor key checks.
    tals: BTreeMap<String, Tal>,

    /// The largest manifest number accepted per issuing CA.
    mft_seqnums: BTreeMap<KeyIdentifier, Bytes>,

    started: Instant,
}

/// A worker process and its channel.
struct Worker {
    channel: Channel,
    child: Child,
}

/// The owner of an in-flight HTTP request.
#[derive(Clone, Debug)]
enum HttpReq {
    /// A trust anchor fetch; the body went into the named file.
    Ta { repo: usize, path: String },

    /// A fetch relayed for the RRDP worker.
    Rrdp,
}

impl<'a> Runner<'a> {
    /// Spawns the worker processes and sets up an idle runner.
    pub fn new(config: &'a Config) -> Result<Self, Error> {
        fs::create_dir_all(&config.cache_dir).map_err(|err| {
            Error::msg(format!(
                "cannot create cache directory {}: {}",
                config.cache_dir.display(), err
            ))
        })?;
        fs::create_dir_all(&config.output_dir).map_err(|err| {
            Error::msg(format!(
                "cannot create output directory {}: {}",
                config.output_dir.display(), err
            ))
        })?;

        let parser = spawn_worker(PROC_PARSER, &[])?;
        let rsync = spawn_worker(
            PROC_RSYNC, &["--rsync-command", &config.rsync_command]
        )?;
        let http = spawn_worker(PROC_HTTP, &[])?;
        let rrdp = spawn_worker(PROC_RRDP, &[])?;

        Ok(Runner {
            config,
            parser,
            rsync,
            http,
            rrdp,
            repos: RepoTable::new(),
            queue: EntityQueue::new(),
            auths: AuthTree::new(),
            crls: CrlTree::new(),
            vrps: VrpStore::new(),
            stats: Stats::default(),
            http_pending: VecDeque::new(),
            rrdp_sessions: BTreeMap::new(),
            tals: BTreeMap::new(),
            mft_seqnums: BTreeMap::new(),
            started: Instant::now(),
        })
    }

    /// Performs the whole run.
    ///
    /// Returns true if at least one trust anchor yielded at least one
    /// VRP.
    pub fn run(mut self) -> Result<bool, Error> {
        self.load_tals()?;
        if self.stats.tals == 0 {
            return Err(Error::msg(
                "no trust anchor locators found".into()
            ))
        }

        self.event_loop()?;

        // Everything settled; account for the repositories.
        self.account_repos();
        let (del_files, del_dirs) =
            self.repos.cleanup(&self.config.cache_dir);
        self.stats.del_files = del_files;
        self.stats.del_dirs = del_dirs;
        self.stats.record_times(self.started.elapsed());

        info!(
            "{} VRPs ({} unique), {} certificates, {} ROAs",
            self.stats.vrps, self.stats.uniqs,
            self.stats.certs, self.stats.roas,
        );

        output::outputfiles(&self.vrps, &self.stats, self.config)
            .map_err(|err| {
                Error::msg(format!("cannot write output: {}", err))
            })?;

        let produced = !self.vrps.is_empty();
        self.shutdown();
        Ok(produced)
    }

    /// Reads the TALs and dispatches the trust anchor fetches.
    fn load_tals(&mut self) -> Result<(), Error> {
        let mut tals = Vec::new();
        if self.config.tal_files.is_empty() {
            let iter = Tal::read_dir(&self.config.tal_dir)
                .map_err(|err| Error::msg(format!(
                    "cannot read TAL directory {}: {}",
                    self.config.tal_dir.display(), err
                )))?;
            for tal in iter {
                tals.push(tal.map_err(|err| {
                    Error::msg(format!("bad TAL: {}", err))
                })?);
            }
        }
        else {
            for path in &self.config.tal_files {
                let mut file = fs::File::open(path).map_err(|err| {
                    Error::msg(format!(
                        "cannot open {}: {}", path.display(), err
                    ))
                })?;
                tals.push(Tal::read(path, &mut file).map_err(|err| {
                    Error::msg(format!(
                        "{}: {}", path.display(), err
                    ))
                })?);
            }
        }

        for tal in tals {
            self.stats.tals += 1;
            if !self.stats.talnames.is_empty() {
                self.stats.talnames.push(',');
            }
            self.stats.talnames.push_str(tal.name());
            self.start_ta(tal);
        }
        Ok(())
    }

    /// Dispatches the fetch of one trust anchor certificate.
    fn start_ta(&mut self, tal: Tal) {
        let id = self.repos.ta_lookup(&tal, &self.config.cache_dir);
        let (state, transport, local, uris) = {
            let repo = self.repos.get(id).unwrap();
            (
                repo.state(),
                repo.preferred_transport(),
                repo.local().to_path_buf(),
                repo.ta_uris().to_vec(),
            )
        };
        if state != RepoState::New {
            return
        }

        // Pick the file name from the first URI; all candidates name
        // the same object.
        let file = tal.uris().next()
            .and_then(|uri| match uri {
                TalUri::Rsync(uri) => uri.file_name().map(String::from),
                TalUri::Https(uri) => {
                    uri.path().rsplit('/').next().map(String::from)
                }
            })
            .unwrap_or_else(|| "ta.cer".into());
        let path_str = local.join(&file).to_string_lossy().into_owned();
        self.repos.filepath_add(path_str.clone().into());

        let entity = Entity::with_pkey(
            RType::Tal, path_str.clone(), tal.key().clone(),
            tal.name().into(),
        );
        self.tals.insert(tal.name().into(), tal);

        if self.config.no_network {
            let repo = self.repos.get_mut(id).unwrap();
            repo.fetch_started(Instant::now());
            repo.defer(entity);
            let event = repo.finish(Transport::Rsync, true);
            self.handle_repo_event(event);
            return
        }

        {
            let repo = self.repos.get_mut(id).unwrap();
            repo.fetch_started(Instant::now());
            repo.defer(entity);
        }
        match transport {
            Transport::Http => {
                let uri = uris.iter()
                    .find(|uri| uri.is_https())
                    .map(|uri| uri.to_string())
                    .unwrap();
                self.http_fetch_ta(id, &uri, &path_str);
            }
            _ => {
                let uri = uris.iter()
                    .find(|uri| uri.is_rsync())
                    .map(|uri| uri.to_string())
                    .unwrap();
                self.rsync_fetch(id, &uri);
            }
        }
    }

    /// Sends an rsync fetch request.
    fn rsync_fetch(&mut self, id: usize, uri: &str) {
        let dst = self.repos.get(id).unwrap()
            .local().to_string_lossy().into_owned();
        let mut buf = IoBuf::new();
        buf.simple_u64(id as u64);
        buf.str(uri);
        buf.str(&dst);
        self.rsync.channel.send(buf);
    }

    /// Sends an HTTP fetch for a trust anchor certificate.
    ///
    /// The body goes straight into the target file whose descriptor
    /// rides along with the request.
    fn http_fetch_ta(&mut self, id: usize, uri: &str, path: &str) {
        if let Some(parent) = Path::new(path).parent() {
            let _ = fs::create_dir_all(parent);
        }
        let file = match fs::File::create(path) {
            Ok(file) => file,
            Err(err) => {
                warn!("{}: {}", path, err);
                let event = self.repos.get_mut(id).unwrap()
                    .finish(Transport::Http, false);
                self.handle_repo_event(event);
                return
            }
        };
        let mut buf = IoBuf::new();
        buf.simple_u64(id as u64);
        buf.str(uri);
        buf.opt_str(None);
        let fd = OwnedFd::from(file);
        self.http.channel.send_fd(buf, fd.into_raw_fd());
        self.http_pending.push_back(HttpReq::Ta {
            repo: id, path: path.into()
        });
    }

    /// Sends an RRDP sync request.
    fn rrdp_fetch(&mut self, id: usize) {
        let repo = self.repos.get(id).unwrap();
        let notify = repo.notify().unwrap().to_string();
        let session = repo.load_session();
        let mut buf = IoBuf::new();
        buf.simple_u8(rrdp_msg::START);
        buf.simple_u64(id as u64);
        buf.str(&notify);
        buf.str(&session.session_id.to_string());
        buf.simple_u64(session.serial);
        buf.opt_str(session.last_mod.as_deref());
        self.rrdp.channel.send(buf);
    }

    /// The readiness-driven heart of the run.
    fn event_loop(&mut self) -> Result<(), Error> {
        loop {
            self.drain_parser_queue();
            if self.is_idle() {
                return Ok(())
            }
            self.poll_once()?;
            self.check_watchdog();
        }
    }

    /// Returns whether all work has settled.
    fn is_idle(&self) -> bool {
        self.queue.idle()
            && self.http_pending.is_empty()
            && self.repos.iter().all(|repo| {
                matches!(
                    repo.state(),
                    RepoState::Ready | RepoState::Failed
                )
            })
            && !self.parser.channel.wants_write()
    }

    /// Waits for and processes one round of channel readiness.
    fn poll_once(&mut self) -> Result<(), Error> {
        let mut fds = [
            pollfd(&self.parser.channel),
            pollfd(&self.rsync.channel),
            pollfd(&self.http.channel),
            pollfd(&self.rrdp.channel),
        ];
        let res = unsafe {
            libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, 1000)
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(())
            }
            return Err(Error::msg(format!("poll failed: {}", err)))
        }

        for (idx, fd) in fds.iter().enumerate() {
            if fd.revents & libc::POLLOUT != 0 {
                self.worker_mut(idx).channel.flush().map_err(|err| {
                    Error::worker_io(idx, err)
                })?;
            }
            if fd.revents
                & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0
            {
                let frames = self.worker_mut(idx).channel.recv()
                    .map_err(|err| Error::worker_io(idx, err))?;
                for frame in frames {
                    self.dispatch(idx, frame)?;
                }
                if self.worker_mut(idx).channel.is_eof()
                    && !self.is_idle()
                {
                    return Err(Error::msg(format!(
                        "{} worker exited unexpectedly",
                        worker_name(idx)
                    )))
                }
            }
        }
        Ok(())
    }

    fn worker_mut(&mut self, idx: usize) -> &mut Worker {
        match idx {
            0 => &mut self.parser,
            1 => &mut self.rsync,
            2 => &mut self.http,
            _ => &mut self.rrdp,
        }
    }

    /// Routes one received frame to its handler.
    fn dispatch(&mut self, idx: usize, frame: Frame) -> Result<(), Error> {
        match idx {
            0 => self.on_parser(frame),
            1 => self.on_rsync(frame),
            2 => self.on_http(frame),
            _ => self.on_rrdp(frame),
        }
    }

    /// Sends queued entities to the parser.
    fn drain_parser_queue(&mut self) {
        while let Some(entity) = self.queue.pop() {
            let mut buf = IoBuf::new();
            entity.compose(&mut buf);
            self.parser.channel.send(buf);
            self.queue.sent();
        }
        let _ = self.parser.channel.flush();
        let _ = self.rsync.channel.flush();
        let _ = self.http.channel.flush();
        let _ = self.rrdp.channel.flush();
    }

    /// Fails every repository whose sync exceeded its budget.
    fn check_watchdog(&mut self) {
        let now = Instant::now();
        let budget = self.config.repo_timeout;
        let mut events = Vec::new();
        for id in 0..self.repos.len() {
            if let Some(repo) = self.repos.get_mut(id) {
                if let Some(event) = repo.check_timeout(now, budget) {
                    events.push(event);
                }
            }
        }
        for event in events {
            self.handle_repo_event(event);
        }
    }

    /// Applies a repository state machine outcome.
    fn handle_repo_event(&mut self, event: RepoEvent) {
        match event {
            RepoEvent::Nothing => { }
            RepoEvent::Ready(entities) => {
                for entity in entities {
                    self.queue.push(entity);
                }
            }
            RepoEvent::FallbackToRsync => { }
            RepoEvent::Failed(entities) => {
                for entity in entities {
                    warn!("{}: dropped, repository failed", entity.path);
                }
            }
        }
    }

    /// Queues an entity, deferring it while its repository syncs.
    fn enqueue(&mut self, repo_id: usize, entity: Entity) {
        let repo = match self.repos.get_mut(repo_id) {
            Some(repo) => repo,
            None => return
        };
        match repo.state() {
            RepoState::Ready => self.queue.push(entity),
            RepoState::Failed => {
                warn!("{}: dropped, repository failed", entity.path);
            }
            _ => {
                repo.defer(entity);
            }
        }
    }

    /// Looks up a repository and starts its sync if it is new.
    fn want_repo(
        &mut self,
        uri: &crate::uri::Rsync,
        notify: Option<&crate::uri::Https>,
    ) -> usize {
        let id = self.repos.lookup(uri, notify, &self.config.cache_dir);
        let repo = self.repos.get_mut(id).unwrap();
        if repo.state() != RepoState::New {
            return id
        }
        if self.config.no_network {
            repo.fetch_started(Instant::now());
            let event = repo.finish(Transport::Rsync, true);
            self.handle_repo_event(event);
            return id
        }
        let transport = repo.preferred_transport();
        repo.fetch_started(Instant::now());
        match transport {
            Transport::Rrdp => self.rrdp_fetch(id),
            _ => {
                let uri = self.repos.get(id).unwrap().uri().to_string();
                self.rsync_fetch(id, &uri);
            }
        }
        id
    }
}

/// # Handling parser responses
///
impl<'a> Runner<'a> {
    fn on_parser(&mut self, mut frame: Frame) -> Result<(), Error> {
        self.queue.answered();
        let rtype = RType::from_u8(
            frame.take_u8().map_err(Error::frame)?
        ).ok_or_else(|| Error::msg("bad parser response".into()))?;
        let path = frame.take_str().map_err(Error::frame)?;
        let ok = frame.take_bool().map_err(Error::frame)?;

        match rtype {
            RType::Tal => {
                self.stats.certs += 1;
                if !ok {
                    self.stats.certs_fail += 1;
                    return Ok(())
                }
                let cert = Cert::parse_frame(&mut frame)
                    .map_err(Error::frame)?;
                self.on_ta_cert(&path, cert);
            }
            RType::Cer => {
                self.stats.certs += 1;
                if !ok {
                    self.stats.certs_fail += 1;
                    return Ok(())
                }
                let cert = Cert::parse_frame(&mut frame)
                    .map_err(Error::frame)?;
                self.on_cert(&path, cert);
            }
            RType::Mft => {
                self.stats.mfts += 1;
                if !ok {
                    self.stats.mfts_fail += 1;
                    return Ok(())
                }
                let mft = Mft::parse_frame(&mut frame)
                    .map_err(Error::frame)?;
                self.on_mft(&path, mft);
            }
            RType::Crl => {
                self.stats.crls += 1;
                if !ok {
                    return Ok(())
                }
                let crl = Crl::parse_frame(&mut frame)
                    .map_err(Error::frame)?;
                self.on_crl(&path, crl);
            }
            RType::Roa => {
                self.stats.roas += 1;
                if !ok {
                    self.stats.roas_fail += 1;
                    return Ok(())
                }
                let roa = Roa::parse_frame(&mut frame)
                    .map_err(Error::frame)?;
                self.on_roa(&path, roa);
            }
            RType::Gbr => {
                self.stats.gbrs += 1;
                if !ok {
                    return Ok(())
                }
                let gbr = Gbr::parse_frame(&mut frame)
                    .map_err(Error::frame)?;
                self.on_gbr(&path, gbr);
            }
        }
        Ok(())
    }

    /// Installs a freshly parsed trust anchor certificate.
    ///
    /// The parser verified the self-signature; the key against the TAL
    /// is checked again here since the TAL is at hand anyway.
    fn on_ta_cert(&mut self, path: &str, mut cert: Cert) {
        let tal = match ta_name_for_path(&self.repos, path) {
            Some(tal) => tal,
            None => {
                warn!("{}: orphaned trust anchor response", path);
                return
            }
        };
        let key = match self.tals.get(&tal) {
            Some(tal) => tal.key().clone(),
            None => {
                warn!("{}: unknown TAL {}", path, tal);
                return
            }
        };
        if !valid_ta(path, &self.auths, &cert, key.as_ref()) {
            self.stats.certs_invalid += 1;
            return
        }
        cert.set_valid(true);
        self.auths.insert_ta(cert.clone(), tal);
        self.walk_ca(&cert);
    }

    /// Validates and installs a CA certificate.
    fn on_cert(&mut self, path: &str, mut cert: Cert) {
        if !cert.is_ca() {
            warn!("{}: not a CA certificate", path);
            self.stats.certs_invalid += 1;
            return
        }
        let parent = match valid_cert(
            path, &self.auths, &self.crls, &cert
        ) {
            Some(parent) => parent,
            None => {
                self.stats.certs_invalid += 1;
                return
            }
        };
        cert.set_valid(true);
        self.auths.insert(cert.clone(), parent);
        self.walk_ca(&cert);
    }

    /// Starts the manifest walk below an installed CA certificate.
    fn walk_ca(&mut self, cert: &Cert) {
        let mft_uri = match cert.mft() {
            Some(uri) => uri.clone(),
            None => {
                warn!("CA certificate without manifest, skipping");
                return
            }
        };
        let repo_uri = match cert.repo() {
            Some(uri) => uri.clone(),
            None => mft_uri.clone(),
        };
        let tal = self.auths.tal_name(cert.ski())
            .map(String::from)
            .unwrap_or_default();

        let id = self.want_repo(&repo_uri, cert.notify());
        let local = self.repos.get(id).unwrap().filename(mft_uri.path());
        let entity = Entity::new(
            RType::Mft,
            local.to_string_lossy().into_owned(),
            tal,
        );
        self.enqueue(id, entity);
    }

    /// Validates a manifest and queues the files it lists.
    fn on_mft(&mut self, path: &str, mft: Mft) {
        if mft.is_stale() {
            self.stats.mfts_stale += 1;
        }
        let parent = match valid_ski_aki(
            path, &self.auths, mft.ski(), mft.aki()
        ) {
            Some(parent) => parent,
            None => {
                self.stats.mfts_fail += 1;
                return
            }
        };
        let parent_key = parent.cert().ski();
        if mft.ee().verify_issued_by(
            parent.cert().subject_public_key()
        ).is_err() {
            warn!("{}: invalid manifest signature", path);
            self.stats.mfts_fail += 1;
            return
        }
        if mft.ee().check_validity().is_err() {
            warn!("{}: manifest EE certificate expired", path);
            self.stats.mfts_fail += 1;
            return
        }
        if let Some(aki) = mft.aki() {
            if self.crls.is_revoked(aki, mft.ee().serial()) {
                warn!("{}: manifest EE certificate revoked", path);
                self.stats.mfts_fail += 1;
                return
            }
        }

        // The manifest number must only ever go up.
        if let Some(seen) = self.mft_seqnums.get(&parent_key) {
            if Mft::cmp_seqnum(mft.seqnum(), seen)
                != std::cmp::Ordering::Greater
            {
                warn!("{}: manifest number went backwards", path);
                self.stats.mfts_fail += 1;
                return
            }
        }
        self.mft_seqnums.insert(
            parent_key, mft.seqnum().clone()
        );

        let tal = self.auths.tal_name(parent_key)
            .map(String::from)
            .unwrap_or_default();
        let dir = Path::new(path).parent()
            .map(|dir| dir.to_path_buf())
            .unwrap_or_default();

        // Claim everything on the manifest for cleanup purposes, and
        // queue the objects: CRLs first so revocation data is in place
        // before the certificates arrive.
        let mut files: Vec<_> = mft.files().iter().collect();
        files.sort_by_key(|file| {
            RType::from_file_name(file.file()) != Some(RType::Crl)
        });
        for file in files {
            let local = dir.join(file.file());
            self.repos.filepath_add(local.clone());
            let rtype = match RType::from_file_name(file.file()) {
                Some(rtype) => rtype,
                // Unknown suffixes are ignored silently.
                None => continue
            };
            if rtype == RType::Mft {
                continue
            }
            self.queue.push(Entity::new(
                rtype,
                local.to_string_lossy().into_owned(),
                tal.clone(),
            ));
        }
        self.repos.filepath_add(path.into());
    }

    /// Verifies a CRL and installs it in the index.
    fn on_crl(&mut self, path: &str, crl: Crl) {
        let issuer = match self.auths.get(crl.aki()) {
            Some(issuer) => issuer,
            None => {
                warn!("{}: CRL from unknown issuer", path);
                return
            }
        };
        if crl.verify_signature(
            issuer.cert().subject_public_key()
        ).is_err() {
            warn!("{}: invalid CRL signature", path);
            return
        }
        self.crls.insert(crl);
    }

    /// Validates a ROA and inserts its payloads.
    fn on_roa(&mut self, path: &str, mut roa: Roa) {
        let parent = match valid_ski_aki(
            path, &self.auths, roa.ski(), roa.aki()
        ) {
            Some(parent) => parent,
            None => {
                self.stats.roas_invalid += 1;
                return
            }
        };
        let parent_key = parent.cert().ski();
        if roa.ee().verify_issued_by(
            parent.cert().subject_public_key()
        ).is_err() {
            warn!("{}: invalid ROA signature", path);
            self.stats.roas_invalid += 1;
            return
        }
        if roa.ee().check_validity().is_err() {
            warn!("{}: ROA EE certificate expired", path);
            self.stats.roas_invalid += 1;
            return
        }
        if let Some(aki) = roa.aki() {
            if self.crls.is_revoked(aki, roa.ee().serial()) {
                warn!("{}: ROA EE certificate revoked", path);
                self.stats.roas_invalid += 1;
                return
            }
        }

        // Install the EE certificate as a transient node so the
        // coverage walk can ground inherited resources.
        self.auths.insert(roa.ee().clone(), parent_key);
        if !valid_roa(path, &self.auths, &mut roa) {
            self.stats.roas_invalid += 1;
            return
        }
        self.vrps.insert_roa(
            &roa, &mut self.stats.uniqs, &mut self.stats.vrps
        );
    }

    /// Validates a ghostbuster record; it contributes nothing further.
    fn on_gbr(&mut self, path: &str, gbr: Gbr) {
        let parent = match valid_ski_aki(
            path, &self.auths, gbr.ski(), gbr.aki()
        ) {
            Some(parent) => parent,
            None => return
        };
        if gbr.ee().verify_issued_by(
            parent.cert().subject_public_key()
        ).is_err() {
            warn!("{}: invalid ghostbuster signature", path);
        }
    }
}

/// # Handling transport completions
///
impl<'a> Runner<'a> {
    fn on_rsync(&mut self, mut frame: Frame) -> Result<(), Error> {
        let id = frame.take_u64().map_err(Error::frame)? as usize;
        let ok = frame.take_bool().map_err(Error::frame)?;
        if let Some(repo) = self.repos.get_mut(id) {
            let event = repo.finish(Transport::Rsync, ok);
            self.handle_repo_event(event);
        }
        Ok(())
    }

    fn on_http(&mut self, mut frame: Frame) -> Result<(), Error> {
        let id = frame.take_u64().map_err(Error::frame)?;
        let result = HttpResult::from_u8(
            frame.take_u8().map_err(Error::frame)?
        ).ok_or_else(|| Error::msg("bad HTTP result".into()))?;
        let last_mod = frame.take_opt_str().map_err(Error::frame)?;

        let owner = self.http_pending.pop_front().ok_or_else(|| {
            Error::msg("unsolicited HTTP response".into())
        })?;
        match owner {
            HttpReq::Ta { repo, path } => {
                if !result.is_success() {
                    // A failed fetch leaves an empty file around.
                    let _ = fs::remove_file(&path);
                }
                else {
                    self.repos.filepath_add(path.into());
                }
                if let Some(repo) = self.repos.get_mut(repo) {
                    let event = repo.finish(
                        Transport::Http, result.is_success()
                    );
                    self.handle_repo_event(event);
                }
            }
            HttpReq::Rrdp => {
                let mut buf = IoBuf::new();
                buf.simple_u8(rrdp_msg::HTTP_FIN);
                buf.simple_u64(id);
                buf.simple_u8(result.to_u8());
                buf.opt_str(last_mod.as_deref());
                self.rrdp.channel.send(buf);
            }
        }
        Ok(())
    }

    fn on_rrdp(&mut self, mut frame: Frame) -> Result<(), Error> {
        let msg = frame.take_u8().map_err(Error::frame)?;
        let id = frame.take_u64().map_err(Error::frame)? as usize;
        match msg {
            rrdp_msg::HTTP_REQ => {
                let uri = frame.take_str().map_err(Error::frame)?;
                let last_mod = frame.take_opt_str()
                    .map_err(Error::frame)?;
                let fd = self.rrdp.channel.take_fd().ok_or_else(|| {
                    Error::msg("HTTP_REQ without descriptor".into())
                })?;
                let mut buf = IoBuf::new();
                buf.simple_u64(id as u64);
                buf.str(&uri);
                buf.opt_str(last_mod.as_deref());
                self.http.channel.send_fd(buf, fd);
                self.http_pending.push_back(HttpReq::Rrdp);
            }
            rrdp_msg::SESSION => {
                let session_id = frame.take_str().map_err(Error::frame)?;
                let serial = frame.take_u64().map_err(Error::frame)?;
                let last_mod = frame.take_opt_str()
                    .map_err(Error::frame)?;
                if let Ok(session_id) = session_id.parse() {
                    self.rrdp_sessions.insert(id, RrdpSession {
                        session_id, serial, last_mod
                    });
                }
            }
            rrdp_msg::FILE => {
                let what = PublishType::from_u8(
                    frame.take_u8().map_err(Error::frame)?
                ).ok_or_else(|| {
                    Error::msg("bad publish type".into())
                })?;
                let uri = frame.take_str().map_err(Error::frame)?;
                let hash = frame.take_opt_buf().map_err(Error::frame)?;
                let data = frame.take_buf().map_err(Error::frame)?;
                if let Err(err) = self.repos.rrdp_handle_file(
                    id, what, &uri, hash.as_deref(), data.as_ref()
                ) {
                    warn!("{}", err);
                }
            }
            rrdp_msg::END => {
                let ok = frame.take_bool().map_err(Error::frame)?;
                if ok {
                    if let Some(session) = self.rrdp_sessions.remove(&id) {
                        if let Err(err) = self.repos.rrdp_save_state(
                            id, &session
                        ) {
                            warn!("cannot save RRDP state: {}", err);
                        }
                    }
                }
                else {
                    self.rrdp_sessions.remove(&id);
                }
                if let Some(repo) = self.repos.get_mut(id) {
                    let event = repo.finish(Transport::Rrdp, ok);
                    if matches!(event, RepoEvent::FallbackToRsync) {
                        let uri = repo.uri().to_string();
                        repo.fetch_started(Instant::now());
                        self.rsync_fetch(id, &uri);
                    }
                    else {
                        self.handle_repo_event(event);
                    }
                }
            }
            _ => {
                return Err(Error::msg(
                    "unexpected RRDP message".into()
                ))
            }
        }
        Ok(())
    }
}

/// # Wrapping up
///
impl<'a> Runner<'a> {
    /// Derives the per-protocol repository counts.
    fn account_repos(&mut self) {
        for repo in self.repos.iter() {
            self.stats.repos += 1;
            let had_rrdp = repo.notify().is_some();
            match (repo.state(), repo.provided_by()) {
                (RepoState::Ready, Some(Transport::Rrdp)) => {
                    self.stats.rrdp_repos += 1;
                }
                (RepoState::Ready, Some(Transport::Rsync)) => {
                    self.stats.rsync_repos += 1;
                    if had_rrdp {
                        self.stats.rrdp_fails += 1;
                    }
                }
                (RepoState::Ready, Some(Transport::Http)) => {
                    self.stats.http_repos += 1;
                }
                _ => {
                    if had_rrdp {
                        self.stats.rrdp_fails += 1;
                        self.stats.rsync_fails += 1;
                    }
                    else if !repo.ta_uris().is_empty()
                        && repo.preferred_transport() == Transport::Http
                    {
                        self.stats.http_fails += 1;
                    }
                    else {
                        self.stats.rsync_fails += 1;
                    }
                }
            }
        }
    }

    /// Closes the channels and reaps the workers.
    fn shutdown(mut self) {
        drop(self.parser.channel);
        drop(self.rsync.channel);
        drop(self.http.channel);
        drop(self.rrdp.channel);
        let _ = self.parser.child.wait();
        let _ = self.rsync.child.wait();
        let _ = self.http.child.wait();
        let _ = self.rrdp.child.wait();
    }
}

/// Finds the TAL name for a trust anchor file path.
fn ta_name_for_path(repos: &RepoTable, path: &str) -> Option<String> {
    let path = Path::new(path);
    repos.iter()
        .filter(|repo| !repo.ta_uris().is_empty())
        .find(|repo| path.starts_with(repo.local()))
        .and_then(|repo| {
            repo.uri().strip_prefix("ta/").map(String::from)
        })
}

fn pollfd(channel: &Channel) -> libc::pollfd {
    let mut events = libc::POLLIN;
    if channel.wants_write() {
        events |= libc::POLLOUT;
    }
    libc::pollfd {
        fd: channel.raw_fd(),
        events,
        revents: 0,
    }
}

fn worker_name(idx: usize) -> &'static str {
    match idx {
        0 => PROC_PARSER,
        1 => PROC_RSYNC,
        2 => PROC_HTTP,
        _ => PROC_RRDP,
    }
}

/// Spawns one worker process with a socket pair on its standard input.
fn spawn_worker(name: &str, extra: &[&str]) -> Result<Worker, Error> {
    let exe = std::env::current_exe().map_err(|err| {
        Error::msg(format!("cannot find own executable: {}", err))
    })?;
    let (ours, theirs) = UnixStream::pair().map_err(|err| {
        Error::msg(format!("cannot create socket pair: {}", err))
    })?;
    let child = Command::new(exe)
        .arg("--proc")
        .arg(name)
        .args(extra)
        .stdin(Stdio::from(OwnedFd::from(theirs)))
        .spawn()
        .map_err(|err| {
            Error::msg(format!(
                "cannot spawn {} worker: {}", name, err
            ))
        })?;
    let channel = Channel::new(ours).map_err(|err| {
        Error::msg(format!("cannot set up {} channel: {}", name, err))
    })?;
    Ok(Worker { channel, child })
}


//------------ Error ---------------------------------------------------------

/// A fatal error; the run cannot continue.
#[derive(Debug)]
pub struct Error(String);

impl Error {
    fn msg(msg: String) -> Self {
        Error(msg)
    }

    fn frame(err: io::Error) -> Self {
        Error(format!("corrupted worker message: {}", err))
    }

    fn worker_io(idx: usize, err: io::Error) -> Self {
        Error(format!("{} worker: {}", worker_name(idx), err))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Error { }
