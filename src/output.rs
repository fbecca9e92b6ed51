//! Writing out the validated payloads.
//!
//! Each selected format is written to a temporary file in the output
//! directory and atomically moved into place, so consumers never see a
//! partial file. All formats iterate the store in its key order, which
//! makes repeated runs over an unchanged cache produce identical files.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use crate::config::{BirdVersion, Config, OutFormats};
use crate::resources::Afi;
use crate::stats::Stats;
use crate::vrp::VrpStore;


//------------ Entry point ---------------------------------------------------

/// Writes all configured output files.
pub fn outputfiles(
    store: &VrpStore, stats: &Stats, config: &Config
) -> io::Result<()> {
    if config.outformats.contains(OutFormats::OPENBGPD) {
        output_file(
            &config.output_dir, "openbgpd",
            |file| output_bgpd(file, store, stats)
        )?;
    }
    if config.outformats.contains(OutFormats::BIRD) {
        match config.bird_version {
            BirdVersion::Bird1v4 => {
                output_file(
                    &config.output_dir, "bird1v4",
                    |file| output_bird1v4(file, store, stats)
                )?;
            }
            BirdVersion::Bird1v6 => {
                output_file(
                    &config.output_dir, "bird1v6",
                    |file| output_bird1v6(file, store, stats)
                )?;
            }
            BirdVersion::Bird2 => {
                output_file(
                    &config.output_dir, "bird",
                    |file| output_bird2(file, store, stats)
                )?;
            }
        }
    }
    if config.outformats.contains(OutFormats::CSV) {
        output_file(
            &config.output_dir, "csv",
            |file| output_csv(file, store, stats)
        )?;
    }
    if config.outformats.contains(OutFormats::JSON) {
        output_file(
            &config.output_dir, "json",
            |file| output_json(file, store, stats)
        )?;
    }
    Ok(())
}

/// Writes one output file via a temporary and a rename into place.
fn output_file<F>(dir: &Path, name: &str, op: F) -> io::Result<()>
where F: FnOnce(&mut fs::File) -> io::Result<()> {
    let tmp = dir.join(format!(".{}.tmp", name));
    let mut file = fs::File::create(&tmp)?;
    op(&mut file)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, dir.join(name))
}


//------------ Headers -------------------------------------------------------

/// Writes the generated-by comment header used by the text formats.
pub fn outputheader(
    file: &mut dyn Write, stats: &Stats
) -> io::Result<()> {
    writeln!(
        file,
        "# Generated on data from {} trust anchor locators ({})",
        stats.tals, stats.talnames
    )?;
    writeln!(
        file,
        "# Processing time {} seconds ({} seconds user, \
         {} seconds system)",
        stats.elapsed_time.as_secs(),
        stats.user_time.as_secs(),
        stats.system_time.as_secs(),
    )?;
    writeln!(
        file,
        "# Route Origin Authorizations: {} (unique {})",
        stats.vrps, stats.uniqs
    )?;
    writeln!(
        file,
        "# Certificates: {} ({} invalid)",
        stats.certs, stats.certs_invalid
    )?;
    writeln!(
        file,
        "# Manifests: {} ({} failed parse, {} stale)",
        stats.mfts, stats.mfts_fail, stats.mfts_stale
    )?;
    writeln!(
        file,
        "# Certificate revocation lists: {}", stats.crls
    )?;
    writeln!(
        file,
        "# Ghostbuster records: {}", stats.gbrs
    )?;
    writeln!(
        file,
        "# Repositories: {} ({} rsync, {} https, {} RRDP)",
        stats.repos, stats.rsync_repos, stats.http_repos,
        stats.rrdp_repos,
    )
}


//------------ Formats -------------------------------------------------------

/// OpenBGPD roa-set configuration.
pub fn output_bgpd(
    file: &mut dyn Write, store: &VrpStore, stats: &Stats
) -> io::Result<()> {
    outputheader(file, stats)?;
    writeln!(file, "roa-set {{")?;
    for vrp in store {
        let key = vrp.key();
        writeln!(
            file,
            "\t{} maxlen {} source-as {} expires {}",
            key.addr().display(key.afi()),
            key.maxlength(),
            key.asid(),
            vrp.expires().timestamp(),
        )?;
    }
    writeln!(file, "}}")
}

/// BIRD 1.x roa statements, IPv4 only.
pub fn output_bird1v4(
    file: &mut dyn Write, store: &VrpStore, stats: &Stats
) -> io::Result<()> {
    outputheader(file, stats)?;
    for vrp in store {
        let key = vrp.key();
        if key.afi() != Afi::V4 {
            continue
        }
        writeln!(
            file,
            "roa {} max {} as {};",
            key.addr().display(key.afi()), key.maxlength(), key.asid(),
        )?;
    }
    Ok(())
}

/// BIRD 1.x roa statements, IPv6 only.
pub fn output_bird1v6(
    file: &mut dyn Write, store: &VrpStore, stats: &Stats
) -> io::Result<()> {
    outputheader(file, stats)?;
    for vrp in store {
        let key = vrp.key();
        if key.afi() != Afi::V6 {
            continue
        }
        writeln!(
            file,
            "roa {} max {} as {};",
            key.addr().display(key.afi()), key.maxlength(), key.asid(),
        )?;
    }
    Ok(())
}

/// BIRD 2.x route statements for both families.
pub fn output_bird2(
    file: &mut dyn Write, store: &VrpStore, stats: &Stats
) -> io::Result<()> {
    outputheader(file, stats)?;
    writeln!(file, "define force_roa_table_update = {};",
        stats.elapsed_time.as_secs())?;
    writeln!(file)?;
    writeln!(file, "roa4 table ROAS4;")?;
    writeln!(file, "roa6 table ROAS6;")?;
    writeln!(file)?;
    writeln!(file, "protocol static {{")?;
    writeln!(file, "\troa4 {{ table ROAS4; }};")?;
    for vrp in store {
        let key = vrp.key();
        if key.afi() != Afi::V4 {
            continue
        }
        writeln!(
            file,
            "\troute {} max {} as {};",
            key.addr().display(key.afi()), key.maxlength(), key.asid(),
        )?;
    }
    writeln!(file, "}}")?;
    writeln!(file)?;
    writeln!(file, "protocol static {{")?;
    writeln!(file, "\troa6 {{ table ROAS6; }};")?;
    for vrp in store {
        let key = vrp.key();
        if key.afi() != Afi::V6 {
            continue
        }
        writeln!(
            file,
            "\troute {} max {} as {};",
            key.addr().display(key.afi()), key.maxlength(), key.asid(),
        )?;
    }
    writeln!(file, "}}")
}

/// Comma separated values with a column header.
pub fn output_csv(
    file: &mut dyn Write, store: &VrpStore, _stats: &Stats
) -> io::Result<()> {
    writeln!(file, "ASN,IP Prefix,Max Length,Trust Anchor,Expires")?;
    for vrp in store {
        let key = vrp.key();
        writeln!(
            file,
            "AS{},{},{},{},{}",
            key.asid(),
            key.addr().display(key.afi()),
            key.maxlength(),
            vrp.tal(),
            vrp.expires().timestamp(),
        )?;
    }
    Ok(())
}

/// JSON with a metadata block and the payload array.
pub fn output_json(
    file: &mut dyn Write, store: &VrpStore, stats: &Stats
) -> io::Result<()> {
    let metadata = serde_json::json!({
        "buildtime": crate::time::now().to_rfc3339(),
        "elapsedtime": stats.elapsed_time.as_secs(),
        "usertime": stats.user_time.as_secs(),
        "systemtime": stats.system_time.as_secs(),
        "tals": stats.tals,
        "talfiles": stats.talnames,
        "certificates": stats.certs,
        "invalidcertificates": stats.certs_invalid,
        "manifests": stats.mfts,
        "failedmanifests": stats.mfts_fail,
        "stalemanifests": stats.mfts_stale,
        "crls": stats.crls,
        "gbrs": stats.gbrs,
        "repositories": stats.repos,
        "vrps": stats.vrps,
        "uniquevrps": stats.uniqs,
        "cachecleanup": {
            "removedfiles": stats.del_files,
            "removeddirs": stats.del_dirs,
        },
    });

    writeln!(file, "{{")?;
    writeln!(file, "  \"metadata\": {},", metadata)?;
    writeln!(file, "  \"roas\": [")?;
    let mut first = true;
    for vrp in store {
        if !first {
            writeln!(file, ",")?;
        }
        first = false;
        let key = vrp.key();
        write!(
            file,
            "    {{ \"asn\": \"AS{}\", \"prefix\": \"{}\", \
             \"maxLength\": {}, \"ta\": \"{}\", \"expires\": {} }}",
            key.asid(),
            key.addr().display(key.afi()),
            key.maxlength(),
            vrp.tal(),
            vrp.expires().timestamp(),
        )?;
    }
    if !first {
        writeln!(file)?;
    }
    writeln!(file, "  ]")?;
    writeln!(file, "}}")
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::resources::ip::Addr;
    use crate::vrp::VrpKey;
    use crate::x509::Time;

    fn sample_store() -> VrpStore {
        let mut store = VrpStore::new();
        let mut addr = [0u8; 16];
        addr[0] = 10;
        store.insert(
            VrpKey::new(Afi::V4, Addr::new(addr, 8), 24, 64496),
            "example",
            Time::from_timestamp(1_700_000_000).unwrap(),
        );
        let mut addr = [0u8; 16];
        addr[0] = 0x20;
        addr[1] = 0x01;
        addr[2] = 0x0d;
        addr[3] = 0xb8;
        store.insert(
            VrpKey::new(Afi::V6, Addr::new(addr, 32), 48, 64497),
            "example",
            Time::from_timestamp(1_700_000_000).unwrap(),
        );
        store
    }

    #[test]
    fn csv_format() {
        let mut out = Vec::new();
        output_csv(&mut out, &sample_store(), &Stats::default()).unwrap();
        let out = String::from_utf8(out).unwrap();
        let mut lines = out.lines();
        assert_eq!(
            lines.next().unwrap(),
            "ASN,IP Prefix,Max Length,Trust Anchor,Expires"
        );
        assert_eq!(
            lines.next().unwrap(),
            "AS64496,10.0.0.0/8,24,example,1700000000"
        );
        assert_eq!(
            lines.next().unwrap(),
            "AS64497,2001:db8::/32,48,example,1700000000"
        );
    }

    #[test]
    fn bgpd_format() {
        let mut out = Vec::new();
        output_bgpd(&mut out, &sample_store(), &Stats::default()).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("roa-set {"));
        assert!(out.contains(
            "\t10.0.0.0/8 maxlen 24 source-as 64496 expires 1700000000"
        ));
        assert!(out.trim_end().ends_with('}'));
    }

    #[test]
    fn bird_splits_families() {
        let store = sample_store();
        let stats = Stats::default();

        let mut v4 = Vec::new();
        output_bird1v4(&mut v4, &store, &stats).unwrap();
        let v4 = String::from_utf8(v4).unwrap();
        assert!(v4.contains("roa 10.0.0.0/8 max 24 as 64496;"));
        assert!(!v4.contains("2001:db8::"));

        let mut v6 = Vec::new();
        output_bird1v6(&mut v6, &store, &stats).unwrap();
        let v6 = String::from_utf8(v6).unwrap();
        assert!(v6.contains("roa 2001:db8::/32 max 48 as 64497;"));
        assert!(!v6.contains("10.0.0.0/8"));
    }

    #[test]
    fn json_is_valid() {
        let mut out = Vec::new();
        output_json(&mut out, &sample_store(), &Stats::default()).unwrap();
        let parsed: serde_json::Value =
            serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed["roas"].as_array().unwrap().len(), 2);
        assert_eq!(parsed["roas"][0]["asn"], "AS64496");
        assert_eq!(parsed["roas"][0]["maxLength"], 24);
    }

    #[test]
    fn files_written_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.output_dir = dir.path().into();
        config.outformats = OutFormats::empty();
        config.outformats.add(OutFormats::CSV);
        config.outformats.add(OutFormats::JSON);

        outputfiles(
            &sample_store(), &Stats::default(), &config
        ).unwrap();
        assert!(dir.path().join("csv").exists());
        assert!(dir.path().join("json").exists());
        assert!(!dir.path().join(".csv.tmp").exists());
        assert!(!dir.path().join("openbgpd").exists());
    }
}
