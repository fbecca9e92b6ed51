//! Runtime configuration.
//!
//! Everything the components need to know about the invocation travels in
//! an explicit [`Config`] value threaded through by reference. There is
//! no global mutable state.

use std::path::PathBuf;
use std::time::Duration;

/// The default location of the local object cache.
pub const DEFAULT_CACHE_DIR: &str = "/var/cache/rpki-client";

/// The default location the output files are placed in.
pub const DEFAULT_OUTPUT_DIR: &str = "/var/db/rpki-client";

/// The default location TAL files are picked up from.
pub const DEFAULT_TAL_DIR: &str = "/etc/rpki";


//------------ Config --------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Config {
    /// Log chattiness; 0 is warnings and errors only.
    pub verbose: u32,

    /// The directory the repositories are mirrored into.
    pub cache_dir: PathBuf,

    /// The directory the output files are atomically placed in.
    pub output_dir: PathBuf,

    /// The TAL files to process. Empty means all of `tal_dir`.
    pub tal_files: Vec<PathBuf>,

    /// The directory searched for TAL files.
    pub tal_dir: PathBuf,

    /// The output formats to produce.
    pub outformats: OutFormats,

    /// Which BIRD dialect to write when BIRD output is selected.
    pub bird_version: BirdVersion,

    /// The wall-clock budget for a single repository sync. A repository
    /// still in flight when this expires is marked failed.
    pub repo_timeout: Duration,

    /// The rsync client to invoke.
    pub rsync_command: String,

    /// Do not fetch anything, work from the existing cache.
    pub no_network: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            verbose: 0,
            cache_dir: DEFAULT_CACHE_DIR.into(),
            output_dir: DEFAULT_OUTPUT_DIR.into(),
            tal_files: Vec::new(),
            tal_dir: DEFAULT_TAL_DIR.into(),
            outformats: OutFormats::default(),
            bird_version: BirdVersion::Bird2,
            repo_timeout: Duration::from_secs(15 * 60),
            rsync_command: "rsync".into(),
            no_network: false,
        }
    }
}


//------------ OutFormats ----------------------------------------------------

/// The bitmask of output formats to produce.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OutFormats(u8);

impl OutFormats {
    pub const OPENBGPD: Self = OutFormats(0x01);
    pub const BIRD: Self = OutFormats(0x02);
    pub const CSV: Self = OutFormats(0x04);
    pub const JSON: Self = OutFormats(0x08);

    pub fn empty() -> Self {
        OutFormats(0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn add(&mut self, other: Self) {
        self.0 |= other.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for OutFormats {
    fn default() -> Self {
        Self::OPENBGPD
    }
}


//------------ BirdVersion ---------------------------------------------------

/// The dialect of BIRD configuration to write.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BirdVersion {
    /// BIRD 1.x, IPv4 table.
    Bird1v4,

    /// BIRD 1.x, IPv6 table.
    Bird1v6,

    /// BIRD 2.x, both families in one table.
    Bird2,
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn format_mask() {
        let mut formats = OutFormats::empty();
        assert!(formats.is_empty());
        formats.add(OutFormats::CSV);
        formats.add(OutFormats::JSON);
        assert!(formats.contains(OutFormats::CSV));
        assert!(formats.contains(OutFormats::JSON));
        assert!(!formats.contains(OutFormats::OPENBGPD));
        assert!(!formats.contains(OutFormats::BIRD));
    }
}
