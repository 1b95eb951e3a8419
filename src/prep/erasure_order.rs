use std::collections::{BTreeMap, BTreeSet};

use graph::CollectionAddress;

use super::Error;

/// Fail if `deps` (collection -> collections it waits on) contains a cycle.
/// Dependencies on collections outside `deps` are ignored.
pub fn check_acyclic(deps: &BTreeMap<CollectionAddress, Vec<CollectionAddress>>) -> Result<(), Error> {
    let mut done: BTreeSet<&CollectionAddress> = BTreeSet::new();
    loop {
        let ready: Vec<&CollectionAddress> = deps
            .iter()
            .filter(|(addr, _)| !done.contains(addr))
            .filter(|(_, waits_on)| {
                waits_on
                    .iter()
                    .all(|d| done.contains(d) || !deps.contains_key(d))
            })
            .map(|(addr, _)| addr)
            .collect();
        if ready.is_empty() {
            break;
        }
        done.extend(ready);
    }

    if done.len() == deps.len() {
        return Ok(());
    }
    let stuck: Vec<String> = deps
        .keys()
        .filter(|addr| !done.contains(addr))
        .map(CollectionAddress::to_string)
        .collect();
    Err(Error::ErasureCycle(stuck.join(", ")))
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr(s: &str) -> CollectionAddress {
        CollectionAddress::new("db", s)
    }

    #[test]
    fn test_detects_cycle() {
        let mut deps = BTreeMap::new();
        deps.insert(addr("a"), vec![]);
        deps.insert(addr("b"), vec![addr("a"), addr("c")]);
        deps.insert(addr("c"), vec![addr("b")]);
        let err = check_acyclic(&deps).unwrap_err().to_string();
        assert!(err.contains("db:b, db:c"));
        assert!(!err.contains("db:a"));
    }

    #[test]
    fn test_ignores_outside_deps() {
        let mut deps = BTreeMap::new();
        deps.insert(addr("a"), vec![addr("elsewhere")]);
        deps.insert(addr("b"), vec![addr("a")]);
        assert!(check_acyclic(&deps).is_ok());
    }
}
