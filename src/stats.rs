//! Run-time statistics.
//!
//! Counters collected over a run and reported at the end, both to the
//! log and into the headers of the output files.

use std::time::Duration;

/// Statistics collected during run-time.
#[derive(Clone, Debug, Default)]
pub struct Stats {
    /// Total number of locators.
    pub tals: usize,

    /// Total number of manifests.
    pub mfts: usize,
    /// Manifests failing the syntactic parse.
    pub mfts_fail: usize,
    /// Manifests past their nextUpdate.
    pub mfts_stale: usize,

    /// Certificates.
    pub certs: usize,
    /// Certificates failing the syntactic parse.
    pub certs_fail: usize,
    /// Certificates with invalid resources.
    pub certs_invalid: usize,

    /// Route origin authorizations.
    pub roas: usize,
    /// ROAs failing the syntactic parse.
    pub roas_fail: usize,
    /// ROAs with invalid resources.
    pub roas_invalid: usize,

    /// Repositories.
    pub repos: usize,
    /// Synced rsync repositories.
    pub rsync_repos: usize,
    /// Failed rsync repositories.
    pub rsync_fails: usize,
    /// Synced plain-HTTP repositories.
    pub http_repos: usize,
    /// Failed plain-HTTP repositories.
    pub http_fails: usize,
    /// Synced RRDP repositories.
    pub rrdp_repos: usize,
    /// Failed RRDP repositories.
    pub rrdp_fails: usize,

    /// Revocation lists.
    pub crls: usize,

    /// Ghostbuster records.
    pub gbrs: usize,

    /// Total number of VRPs contributed by ROAs.
    pub vrps: usize,
    /// Number of unique VRPs in the store.
    pub uniqs: usize,

    /// Files removed in cleanup.
    pub del_files: usize,
    /// Directories removed in cleanup.
    pub del_dirs: usize,

    /// The names of all processed TALs, comma separated.
    pub talnames: String,

    pub elapsed_time: Duration,
    pub user_time: Duration,
    pub system_time: Duration,
}

impl Stats {
    /// Fills in the user and system time from the OS.
    ///
    /// Includes the resources of the (waited-for) worker processes.
    pub fn record_times(&mut self, elapsed: Duration) {
        self.elapsed_time = elapsed;
        let (user, system) = rusage_times(libc::RUSAGE_SELF);
        let (cuser, csystem) = rusage_times(libc::RUSAGE_CHILDREN);
        self.user_time = user + cuser;
        self.system_time = system + csystem;
    }
}

fn rusage_times(who: libc::c_int) -> (Duration, Duration) {
    unsafe {
        let mut usage: libc::rusage = std::mem::zeroed();
        if libc::getrusage(who, &mut usage) != 0 {
            return (Duration::ZERO, Duration::ZERO)
        }
        (tv_to_duration(usage.ru_utime), tv_to_duration(usage.ru_stime))
    }
}

fn tv_to_duration(tv: libc::timeval) -> Duration {
    Duration::new(tv.tv_sec.max(0) as u64, (tv.tv_usec.max(0) as u32) * 1000)
}
