use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{CollectionAddress, EdgeDirection, FieldAddress};

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// data flows from `f1` to `f2`.
    Directed,
    /// data flows away from whichever end is reached first.
    Bidirectional,
}

/// Dependency between two fields in (usually) different collections.
///
/// Bidirectional edges are stored with their endpoints sorted,
/// so two edges over the same pair of fields compare equal.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    pub f1: FieldAddress,
    pub f2: FieldAddress,
    pub kind: EdgeKind,
}

impl Edge {
    pub fn directed(from: FieldAddress, to: FieldAddress) -> Self {
        Self {
            f1: from,
            f2: to,
            kind: EdgeKind::Directed,
        }
    }

    pub fn bidirectional(a: FieldAddress, b: FieldAddress) -> Self {
        let (f1, f2) = if a <= b { (a, b) } else { (b, a) };
        Self {
            f1,
            f2,
            kind: EdgeKind::Bidirectional,
        }
    }

    /// Build the edge declared by a reference on field `local` to field `referenced`.
    pub fn from_reference(
        local: FieldAddress,
        referenced: FieldAddress,
        direction: Option<EdgeDirection>,
    ) -> Self {
        match direction {
            Some(EdgeDirection::From) => Self::directed(referenced, local),
            Some(EdgeDirection::To) => Self::directed(local, referenced),
            None => Self::bidirectional(local, referenced),
        }
    }

    /// True if both ends are in the same collection.
    pub fn is_self_reference(&self) -> bool {
        self.f1.collection == self.f2.collection
    }

    /// True if data can flow out of `addr` along this edge.
    pub fn flows_from(&self, addr: &CollectionAddress) -> bool {
        match self.kind {
            EdgeKind::Directed => &self.f1.collection == addr,
            EdgeKind::Bidirectional => &self.f1.collection == addr || &self.f2.collection == addr,
        }
    }

    /// True if this edge must be traversed before `addr` can be visited.
    pub fn blocks(&self, addr: &CollectionAddress) -> bool {
        self.kind == EdgeKind::Directed && &self.f2.collection == addr
    }

    /// Directed copy of this edge, flowing out of `addr`.
    /// Should only be called when [`Edge::flows_from`] is true.
    pub fn oriented_from(&self, addr: &CollectionAddress) -> Edge {
        if self.kind == EdgeKind::Bidirectional && &self.f2.collection == addr {
            Edge::directed(self.f2.clone(), self.f1.clone())
        } else {
            Edge::directed(self.f1.clone(), self.f2.clone())
        }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arrow = match self.kind {
            EdgeKind::Directed => "->",
            EdgeKind::Bidirectional => "<->",
        };
        write!(f, "{} {arrow} {}", self.f1, self.f2)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr(s: &str) -> FieldAddress {
        s.parse().unwrap()
    }

    #[test]
    fn test_reference_directions() {
        let local = addr("db:orders:customer_id");
        let other = addr("db:customer:id");
        let from = Edge::from_reference(local.clone(), other.clone(), Some(EdgeDirection::From));
        assert_eq!((from.f1.clone(), from.f2.clone()), (other.clone(), local.clone()));
        let to = Edge::from_reference(local.clone(), other.clone(), Some(EdgeDirection::To));
        assert_eq!((to.f1, to.f2), (local.clone(), other.clone()));
    }

    #[test]
    fn test_bidirectional_is_unordered() {
        let a = addr("db:a:x");
        let b = addr("db:b:y");
        assert_eq!(
            Edge::bidirectional(a.clone(), b.clone()),
            Edge::bidirectional(b.clone(), a.clone())
        );
        let e = Edge::bidirectional(a.clone(), b.clone());
        let b_addr = b.collection.clone();
        assert!(e.flows_from(&b_addr));
        assert!(!e.blocks(&b_addr));
        let oriented = e.oriented_from(&b_addr);
        assert_eq!((oriented.f1, oriented.f2), (b, a));
    }
}
