//! Handling of RFC 3779 resources.
//!
//! Resource certificates carry two families of delegations: IP address
//! blocks and AS number blocks. Both families keep their elements as flat
//! sorted vectors of disjoint elements so that the containment arithmetic
//! of the validation engine stays simple byte and integer comparisons.

pub mod asn;
pub mod ip;

pub use self::asn::{AsBlocks, CertAs};
pub use self::ip::{Addr, AddrRange, Afi, CertIp, IpBlocks};


use std::fmt;


//------------ Coverage ------------------------------------------------------

/// The outcome of checking an element against a parent's resource set.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Coverage {
    /// The element is fully contained in one of the parent's elements.
    Covered,

    /// The element is not contained in any of the parent's elements.
    NotCovered,

    /// The parent inherits this family; the check must recurse upward.
    Inherit,
}


//------------ BlocksError ---------------------------------------------------

/// A resource set violated its structural invariants.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlocksError {
    Overlap,
    Unordered,
    InheritMixed,
}

impl fmt::Display for BlocksError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            BlocksError::Overlap => "overlapping resource elements",
            BlocksError::Unordered => "unordered resource elements",
            BlocksError::InheritMixed => {
                "inherit mixed with explicit resources"
            }
        })
    }
}

impl std::error::Error for BlocksError { }
