//! AS number resources.
//!
//! AS numbers are unsigned 32 bit integers (RFC 6793). A certificate's AS
//! resources are a sorted vector of disjoint singletons and ranges, or a
//! single inherit marker.

use std::fmt;
use bcder::{decode, Tag};
use bcder::decode::ContentError;
use bcder::decode::DecodeError;
use super::{BlocksError, Coverage};


//------------ CertAs --------------------------------------------------------

/// A single element of a certificate's AS resources.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CertAs {
    /// A single AS number.
    Id(u32),

    /// A closed range of AS numbers.
    Range { min: u32, max: u32 },

    /// The element is inherited from the issuer.
    Inherit,
}

impl CertAs {
    pub fn is_inherit(&self) -> bool {
        matches!(self, CertAs::Inherit)
    }

    /// Returns the canonical `[min, max]` form of the element.
    ///
    /// A singleton is the range from itself to itself.
    pub fn as_range(&self) -> Option<(u32, u32)> {
        match *self {
            CertAs::Id(id) => Some((id, id)),
            CertAs::Range { min, max } => Some((min, max)),
            CertAs::Inherit => None,
        }
    }
}

impl fmt::Display for CertAs {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            CertAs::Id(id) => write!(f, "AS{}", id),
            CertAs::Range { min, max } => write!(f, "AS{}-AS{}", min, max),
            CertAs::Inherit => f.write_str("inherit"),
        }
    }
}


//------------ AsBlocks ------------------------------------------------------

/// The AS resources of a certificate.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AsBlocks(Vec<CertAs>);

impl AsBlocks {
    pub fn empty() -> Self {
        AsBlocks(Vec::new())
    }

    pub fn from_elements(elements: Vec<CertAs>) -> Self {
        AsBlocks(elements)
    }

    pub fn iter(&self) -> std::slice::Iter<CertAs> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_inherit(&self) -> bool {
        self.0.iter().any(CertAs::is_inherit)
    }

    /// Appends an element, enforcing the structural invariants.
    pub fn push(&mut self, el: CertAs) -> Result<(), BlocksError> {
        for have in &self.0 {
            if have.is_inherit() || el.is_inherit() {
                return Err(BlocksError::InheritMixed)
            }
            let (hmin, hmax) = have.as_range().unwrap();
            let (emin, emax) = el.as_range().unwrap();
            if emin <= hmax && hmin <= emax {
                return Err(BlocksError::Overlap)
            }
            if emin <= hmin {
                return Err(BlocksError::Unordered)
            }
        }
        self.0.push(el);
        Ok(())
    }

    /// Checks that the range `[min, max]` is covered by this set.
    pub fn check_covered(&self, min: u32, max: u32) -> Coverage {
        for el in &self.0 {
            match el.as_range() {
                None => return Coverage::Inherit,
                Some((emin, emax)) => {
                    if emin <= min && max <= emax {
                        return Coverage::Covered
                    }
                }
            }
        }
        Coverage::NotCovered
    }
}

impl<'a> IntoIterator for &'a AsBlocks {
    type Item = &'a CertAs;
    type IntoIter = std::slice::Iter<'a, CertAs>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}


//--- Decoding

impl AsBlocks {
    /// Takes the content of an RFC 3779 ASIdentifiers extension.
    ///
    /// ```text
    /// ASIdentifiers       ::= SEQUENCE {
    ///     asnum               [0] EXPLICIT ASIdentifierChoice OPTIONAL,
    ///     rdi                 [1] EXPLICIT ASIdentifierChoice OPTIONAL }
    ///
    /// ASIdentifierChoice  ::= CHOICE {
    ///     inherit             NULL,
    ///     asIdsOrRanges       SEQUENCE OF ASIdOrRange }
    ///
    /// ASIdOrRange         ::= CHOICE {
    ///     id                  ASId,
    ///     range               ASRange }
    ///
    /// ASRange             ::= SEQUENCE { min ASId, max ASId }
    /// ```
    ///
    /// RFC 6487 forbids the rdi choice.
    pub fn take_from<S: decode::Source>(
        cons: &mut decode::Constructed<S>
    ) -> Result<Self, DecodeError<S::Error>> {
        cons.take_sequence(|cons| {
            let res = cons.take_constructed_if(Tag::CTX_0, |cons| {
                let mut res = AsBlocks::empty();
                if cons.take_opt_primitive_if(Tag::NULL, |_| Ok(()))?.is_some() {
                    res.push(CertAs::Inherit).map_err(|err| {
                        cons.content_err(ContentError::from_boxed(Box::new(err)))
                    })?;
                    return Ok(res)
                }
                cons.take_sequence(|cons| {
                    while let Some(el) = Self::take_opt_element(cons)? {
                        res.push(el).map_err(|err| cons.content_err(ContentError::from_boxed(Box::new(err))))?;
                    }
                    Ok(())
                })?;
                Ok(res)
            })?;
            Ok(res)
        })
    }

    fn take_opt_element<S: decode::Source>(
        cons: &mut decode::Constructed<S>
    ) -> Result<Option<CertAs>, DecodeError<S::Error>> {
        if let Some(id) = cons.take_opt_u32()? {
            return Ok(Some(CertAs::Id(id)))
        }
        cons.take_opt_sequence(|cons| {
            let min = cons.take_u32()?;
            let max = cons.take_u32()?;
            if min > max {
                return Err(cons.content_err("inverted AS range"))
            }
            Ok(CertAs::Range { min, max })
        })
    }
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn singleton_equals_degenerate_range() {
        let mut id = AsBlocks::empty();
        id.push(CertAs::Id(64496)).unwrap();
        let mut range = AsBlocks::empty();
        range.push(CertAs::Range { min: 64496, max: 64496 }).unwrap();

        assert_eq!(id.check_covered(64496, 64496), Coverage::Covered);
        assert_eq!(range.check_covered(64496, 64496), Coverage::Covered);
        assert_eq!(
            id.check_covered(64496, 64497),
            range.check_covered(64496, 64497)
        );
    }

    #[test]
    fn coverage() {
        let mut blocks = AsBlocks::empty();
        blocks.push(CertAs::Range { min: 64496, max: 64511 }).unwrap();
        blocks.push(CertAs::Id(65000)).unwrap();

        assert_eq!(blocks.check_covered(64500, 64501), Coverage::Covered);
        assert_eq!(blocks.check_covered(65000, 65000), Coverage::Covered);
        assert_eq!(blocks.check_covered(64511, 64512), Coverage::NotCovered);
        assert_eq!(blocks.check_covered(1, 1), Coverage::NotCovered);
    }

    #[test]
    fn inherit() {
        let mut blocks = AsBlocks::empty();
        blocks.push(CertAs::Inherit).unwrap();
        assert_eq!(blocks.check_covered(1, 2), Coverage::Inherit);
        // An empty set covers nothing and inherits nothing.
        assert_eq!(
            AsBlocks::empty().check_covered(1, 2),
            Coverage::NotCovered
        );
    }

    #[test]
    fn push_enforces_invariants() {
        let mut blocks = AsBlocks::empty();
        blocks.push(CertAs::Range { min: 10, max: 20 }).unwrap();
        assert_eq!(
            blocks.push(CertAs::Id(15)),
            Err(BlocksError::Overlap)
        );
        assert_eq!(
            blocks.push(CertAs::Id(5)),
            Err(BlocksError::Unordered)
        );
        blocks.push(CertAs::Id(30)).unwrap();
        assert_eq!(
            blocks.push(CertAs::Inherit),
            Err(BlocksError::InheritMixed)
        );
    }
}
