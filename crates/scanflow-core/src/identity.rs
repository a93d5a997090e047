//! Re-association of join outputs with their originating keys
//!
//! Join output order carries no meaning, so consumers always look elements up
//! by their structured [`IterationKey`]. Nothing here ever inspects a filename.

use scanflow_common::{IterationKey, Keyed, Result, ScanflowError};
use std::collections::HashMap;

/// Key lookups over a joined collection
pub struct IdentityResolver;

impl IdentityResolver {
    /// The single element keyed exactly `key`
    pub fn resolve<'a, T>(collection: &'a [Keyed<T>], key: &IterationKey) -> Result<&'a T> {
        let mut matches = collection.iter().filter(|item| &item.key == key);
        let first = matches
            .next()
            .ok_or_else(|| ScanflowError::NotFound(key.clone()))?;
        let extra = matches.count();
        if extra > 0 {
            return Err(ScanflowError::DuplicateMatch {
                key: key.clone(),
                count: extra + 1,
            });
        }
        Ok(&first.value)
    }

    /// Every element scoped under `parent`, in key order
    pub fn resolve_prefixed<'a, T>(
        collection: &'a [Keyed<T>],
        parent: &IterationKey,
    ) -> Vec<&'a Keyed<T>> {
        let mut scoped: Vec<_> = collection
            .iter()
            .filter(|item| parent.is_prefix_of(&item.key))
            .collect();
        scoped.sort_by(|a, b| a.key.cmp(&b.key));
        scoped
    }

    /// Fail with `DuplicateMatch` when any key appears more than once
    pub fn ensure_unique<T>(collection: &[Keyed<T>]) -> Result<()> {
        let mut counts: HashMap<&IterationKey, usize> = HashMap::with_capacity(collection.len());
        for item in collection {
            *counts.entry(&item.key).or_default() += 1;
        }
        let mut duplicates: Vec<_> = counts.into_iter().filter(|(_, n)| *n > 1).collect();
        duplicates.sort();
        match duplicates.first() {
            Some((key, count)) => Err(ScanflowError::DuplicateMatch {
                key: (*key).clone(),
                count: *count,
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyed(sub: &str, value: &'static str) -> Keyed<&'static str> {
        Keyed::new(IterationKey::subject(sub), value)
    }

    #[test]
    fn test_resolve_does_not_substring_match() {
        let collection = vec![keyed("s10", "B"), keyed("s1", "A")];
        let found = IdentityResolver::resolve(&collection, &IterationKey::subject("s1")).unwrap();
        assert_eq!(*found, "A");
    }

    #[test]
    fn test_resolve_not_found() {
        let collection = vec![keyed("s10", "B")];
        let err = IdentityResolver::resolve(&collection, &IterationKey::subject("s1")).unwrap_err();
        assert!(matches!(err, ScanflowError::NotFound(_)));
    }

    #[test]
    fn test_resolve_duplicate() {
        let collection = vec![keyed("s1", "A"), keyed("s1", "C"), keyed("s2", "B")];
        let err = IdentityResolver::resolve(&collection, &IterationKey::subject("s1")).unwrap_err();
        assert!(matches!(err, ScanflowError::DuplicateMatch { count: 2, .. }));
        assert!(IdentityResolver::ensure_unique(&collection).is_err());
    }

    #[test]
    fn test_resolve_prefixed_scopes_by_parent() {
        let run = |sub: &str, ses: &str, run: &str| {
            IterationKey::run(sub, Some(ses.to_string()), run)
        };
        let collection = vec![
            Keyed::new(run("s1", "1", "2"), 2),
            Keyed::new(run("s10", "1", "1"), 10),
            Keyed::new(run("s1", "1", "1"), 1),
            Keyed::new(run("s1", "2", "1"), 3),
        ];
        let parent = IterationKey::session("s1", Some("1".to_string()));
        let scoped: Vec<_> = IdentityResolver::resolve_prefixed(&collection, &parent)
            .into_iter()
            .map(|k| k.value)
            .collect();
        assert_eq!(scoped, vec![1, 2]);
        assert!(IdentityResolver::ensure_unique(&collection).is_ok());
    }
}
