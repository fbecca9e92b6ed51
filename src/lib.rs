//! An RPKI relying party validator.
//!
//! Starting from a set of trust anchor locators, this crate discovers,
//! fetches, and cryptographically validates the tree of signed RPKI objects
//! and condenses it into a set of validated ROA payloads for consumption by
//! BGP routers.
//!
//! The work is spread over several processes that only talk to each other
//! through length-framed messages: the orchestrator in [`run`] owns the work
//! queue, repository table, authentication tree and VRP store, while the
//! workers in [`worker`] parse objects and move bytes over rsync, HTTP and
//! RRDP. No process trusts another with respect to input validity.

pub mod cert;
pub mod config;
pub mod crl;
pub mod crypto;
pub mod entity;
pub mod gbr;
pub mod ipc;
pub mod mft;
pub mod oid;
pub mod output;
pub mod repo;
pub mod resources;
pub mod roa;
pub mod rrdp;
pub mod run;
pub mod sigobj;
pub mod stats;
pub mod tal;
pub mod time;
pub mod uri;
pub mod validate;
pub mod vrp;
pub mod worker;
pub mod x509;
pub mod xml;
