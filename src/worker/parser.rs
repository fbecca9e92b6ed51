//! The parser worker.
//!
//! Accepts one entity per request, reads the named file from the local
//! cache, decodes and cryptographically checks it, and answers with the
//! parsed structure or a failure marker. The worker never touches the
//! network and never writes to the filesystem; its only effect is
//! reading the cache. Responses leave in request order.

use std::fs;
use std::io;
use std::path::Path;
use bytes::Bytes;
use log::warn;
use crate::cert::Cert;
use crate::crl::Crl;
use crate::entity::{Entity, RType};
use crate::gbr::Gbr;
use crate::ipc::{IoBuf, WorkerChannel};
use crate::mft::Mft;
use crate::roa::Roa;
use crate::validate::valid_filehash;
use crate::x509::ValidationError;

/// Runs the parser worker until its ingress stream ends.
pub fn run(mut channel: WorkerChannel) -> io::Result<()> {
    while let Some(mut frame) = channel.read_frame()? {
        let entity = Entity::parse(&mut frame)?;
        let response = serve(&entity);
        channel.write_frame(response)?;
    }
    Ok(())
}

/// Handles one request, producing the response frame.
///
/// The response repeats the entity type and path so the orchestrator can
/// correlate, followed by an ok flag and, on success, the object.
fn serve(entity: &Entity) -> IoBuf {
    let mut buf = IoBuf::new();
    buf.simple_u8(entity.rtype.to_u8());
    buf.str(&entity.path);

    match parse_entity(entity, &mut buf) {
        Ok(()) => { }
        Err(_) => {
            // Start over with a bare failure marker.
            let mut buf = IoBuf::new();
            buf.simple_u8(entity.rtype.to_u8());
            buf.str(&entity.path);
            buf.simple_bool(false);
            return buf
        }
    }
    buf
}

fn parse_entity(
    entity: &Entity, buf: &mut IoBuf
) -> Result<(), ValidationError> {
    let data = read_file(&entity.path)?;
    match entity.rtype {
        RType::Tal => {
            // The entity names a trust anchor certificate; the expected
            // key came along from the TAL.
            let pkey = entity.pkey.as_ref().ok_or(ValidationError)?;
            let cert = ta_parse(&entity.path, data, pkey)?;
            buf.simple_bool(true);
            cert.compose(buf);
        }
        RType::Cer => {
            let cert = cert_parse(&entity.path, data)?;
            buf.simple_bool(true);
            cert.compose(buf);
        }
        RType::Mft => {
            let mut mft = Mft::parse(&entity.path, data)?;
            mft_check(&entity.path, &mut mft);
            buf.simple_bool(true);
            mft.compose(buf);
        }
        RType::Roa => {
            let roa = Roa::parse(&entity.path, data)?;
            buf.simple_bool(true);
            roa.compose(buf);
        }
        RType::Crl => {
            let crl = Crl::parse(&entity.path, data)?;
            buf.simple_bool(true);
            crl.compose(buf);
        }
        RType::Gbr => {
            let gbr = Gbr::parse(&entity.path, data)?;
            buf.simple_bool(true);
            gbr.compose(buf);
        }
    }
    Ok(())
}

fn read_file(path: &str) -> Result<Bytes, ValidationError> {
    match fs::read(path) {
        Ok(data) => Ok(Bytes::from(data)),
        Err(err) => {
            warn!("{}: {}", path, err);
            Err(ValidationError)
        }
    }
}

/// Parses a plain certificate.
pub fn cert_parse(
    fname: &str, data: Bytes
) -> Result<Cert, ValidationError> {
    Cert::decode(data).map_err(|err| {
        warn!("{}: {}", fname, err);
        ValidationError
    })
}

/// Parses a trust anchor certificate.
///
/// On top of the certificate syntax, the public key must equal the one
/// the TAL asserts, the certificate must be self-signed, and it must not
/// inherit any resources.
pub fn ta_parse(
    fname: &str, data: Bytes, pkey: &[u8]
) -> Result<Cert, ValidationError> {
    let cert = cert_parse(fname, data)?;
    if let Err(err) = cert.verify_ta(pkey) {
        warn!("{}: trust anchor check failed", fname);
        return Err(err)
    }
    Ok(cert)
}

/// Cross-checks the manifest's file list against the local cache.
///
/// Entries whose file is missing or whose digest does not match are
/// logged and dropped; the manifest itself stays usable.
pub fn mft_check(fname: &str, mft: &mut Mft) {
    let dir = Path::new(fname).parent()
        .map(|dir| dir.to_path_buf())
        .unwrap_or_default();
    mft.retain_files(|file| {
        let path = dir.join(file.file());
        if valid_filehash(&path, file.hash().as_ref()) {
            true
        }
        else {
            warn!("{}: bad hash for {}", fname, file.file());
            false
        }
    });
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;
    use crate::crypto::DigestAlgorithm;
    use crate::mft::MftFile;
    use crate::x509::Time;

    #[test]
    fn failure_marker_for_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.cer");
        fs::File::create(&path).unwrap()
            .write_all(b"this is not DER").unwrap();

        let entity = Entity::new(
            RType::Cer,
            path.to_str().unwrap().into(),
            "t".into(),
        );
        let mut buf = serve(&entity).finish();
        let mut frame = crate::ipc::Frame::new(buf.split_off(4));
        assert_eq!(frame.take_u8().unwrap(), RType::Cer.to_u8());
        assert_eq!(frame.take_str().unwrap(), path.to_str().unwrap());
        assert!(!frame.take_bool().unwrap());
        assert_eq!(frame.remaining(), 0);
    }

    #[test]
    fn mft_check_drops_bad_entries() {
        use crate::cert::test::{ki, make_cert};

        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("good.roa"), b"good body").unwrap();
        fs::write(dir.path().join("tampered.cer"), b"evil body").unwrap();

        let good_hash = DigestAlgorithm::sha256().digest(b"good body");
        let wrong_hash = DigestAlgorithm::sha256().digest(b"other body");
        let mut mft = Mft::from_parts(
            make_cert(ki(2), Some(ki(1)), Vec::new(), Vec::new()),
            Bytes::from_static(&[1]),
            Time::from_timestamp(0).unwrap(),
            Time::from_timestamp(1).unwrap(),
            vec![
                MftFile::new(
                    "good.roa".into(),
                    Bytes::copy_from_slice(good_hash.as_ref()),
                ),
                MftFile::new(
                    "tampered.cer".into(),
                    Bytes::copy_from_slice(wrong_hash.as_ref()),
                ),
                MftFile::new(
                    "missing.gbr".into(),
                    Bytes::copy_from_slice(good_hash.as_ref()),
                ),
            ],
            false,
        );

        let fname = dir.path().join("x.mft");
        mft_check(fname.to_str().unwrap(), &mut mft);
        assert_eq!(mft.files().len(), 1);
        assert_eq!(mft.files()[0].file(), "good.roa");
    }
}
