//! Object path classification for the Secret Service namespace.
//!
//! Secret Service objects live under fixed roots:
//!
//! ```text
//! /org/freedesktop/secrets                         service
//! /org/freedesktop/secrets/collection/<c>          collection
//! /org/freedesktop/secrets/aliases/<alias>         collection (by alias)
//! /org/freedesktop/secrets/collection/<c>/<i>      item
//! /org/freedesktop/secrets/session/<s>             session
//! /org/freedesktop/secrets/prompt/<p>              prompt
//! ```
//!
//! Most off-the-shelf clients address the default collection through
//! `aliases/default`, so both the collection root and the alias root are
//! valid collection namespaces. Items are only recognised below the
//! collection root.
//!
//! Everything in this module is pure: no I/O, no allocation.

/// Root object path of the service.
pub const SERVICE_ROOT: &str = "/org/freedesktop/secrets";

/// Root under which collections are exported.
pub const COLLECTION_ROOT: &str = "/org/freedesktop/secrets/collection";

/// Root under which collection aliases are exported.
pub const ALIAS_ROOT: &str = "/org/freedesktop/secrets/aliases";

/// Root under which sessions are exported.
pub const SESSION_ROOT: &str = "/org/freedesktop/secrets/session";

/// Root under which prompts are exported.
pub const PROMPT_ROOT: &str = "/org/freedesktop/secrets/prompt";

/// The shape an object path has within the Secret Service namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathKind {
    /// `<collectionRoot>/<segment>` or `<aliasRoot>/<segment>`.
    Collection,
    /// `<collectionRoot>/<segment>/<segment2>`.
    Item,
    /// Anything else, including bare roots.
    Neither,
}

/// Classifies an object path.
///
/// Exactly one [`PathKind`] is returned for every input.
#[must_use]
pub fn classify(path: &str) -> PathKind {
    if let Some(rest) = strip_root(path, COLLECTION_ROOT) {
        return match rest.split_once('/') {
            None if !rest.is_empty() => PathKind::Collection,
            Some((collection, item))
                if !collection.is_empty() && !item.is_empty() && !item.contains('/') =>
            {
                PathKind::Item
            },
            _ => PathKind::Neither,
        };
    }

    match strip_root(path, ALIAS_ROOT) {
        Some(rest) if is_single_segment(rest) => PathKind::Collection,
        _ => PathKind::Neither,
    }
}

/// Returns `true` if `path` names a collection (directly or by alias).
#[must_use]
pub fn is_collection(path: &str) -> bool {
    classify(path) == PathKind::Collection
}

/// Returns `true` if `path` names an item.
#[must_use]
pub fn is_item(path: &str) -> bool {
    classify(path) == PathKind::Item
}

/// Returns `true` if `path` names a session object.
#[must_use]
pub fn is_session(path: &str) -> bool {
    strip_root(path, SESSION_ROOT).is_some_and(is_single_segment)
}

/// Returns `true` if `path` names a prompt object.
#[must_use]
pub fn is_prompt(path: &str) -> bool {
    strip_root(path, PROMPT_ROOT).is_some_and(is_single_segment)
}

/// Returns the collection path that owns an item path.
///
/// Returns `None` if `path` is not an item.
#[must_use]
pub fn parent_collection(path: &str) -> Option<&str> {
    if !is_item(path) {
        return None;
    }
    path.rsplit_once('/').map(|(parent, _)| parent)
}

/// Strips `root` followed by a `/` separator, returning the remainder.
fn strip_root<'a>(path: &'a str, root: &str) -> Option<&'a str> {
    path.strip_prefix(root)?.strip_prefix('/')
}

fn is_single_segment(rest: &str) -> bool {
    !rest.is_empty() && !rest.contains('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_table() {
        let cases: &[(&str, PathKind)] = &[
            ("/org/freedesktop/secrets/collection/login", PathKind::Collection),
            ("/org/freedesktop/secrets/collection/default", PathKind::Collection),
            ("/org/freedesktop/secrets/aliases/default", PathKind::Collection),
            ("/org/freedesktop/secrets/collection/login/1", PathKind::Item),
            ("/org/freedesktop/secrets/collection/login/abc_2d1", PathKind::Item),
            // Bare roots and trailing separators
            ("/org/freedesktop/secrets", PathKind::Neither),
            ("/org/freedesktop/secrets/collection", PathKind::Neither),
            ("/org/freedesktop/secrets/collection/", PathKind::Neither),
            ("/org/freedesktop/secrets/aliases", PathKind::Neither),
            ("/org/freedesktop/secrets/aliases/", PathKind::Neither),
            ("/org/freedesktop/secrets/collection/login/", PathKind::Neither),
            ("/org/freedesktop/secrets/collection//1", PathKind::Neither),
            // Too deep
            ("/org/freedesktop/secrets/collection/login/1/2", PathKind::Neither),
            ("/org/freedesktop/secrets/aliases/default/1", PathKind::Neither),
            // Other namespaces
            ("/org/freedesktop/secrets/session/s1", PathKind::Neither),
            ("/org/freedesktop/secrets/prompt/p1", PathKind::Neither),
            ("/org/freedesktop/secrets/collectionx/login", PathKind::Neither),
            ("/org/freedesktop/secrets/aliasesx", PathKind::Neither),
            ("/org/freedesktop/systemd1", PathKind::Neither),
            ("/", PathKind::Neither),
            ("", PathKind::Neither),
        ];

        for (path, expected) in cases {
            assert_eq!(classify(path), *expected, "path {path:?}");
        }
    }

    #[test]
    fn test_predicates_agree_with_classify() {
        assert!(is_collection("/org/freedesktop/secrets/aliases/default"));
        assert!(!is_item("/org/freedesktop/secrets/aliases/default"));
        assert!(is_item("/org/freedesktop/secrets/collection/login/7"));
        assert!(!is_collection("/org/freedesktop/secrets/collection/login/7"));
    }

    #[test]
    fn test_session_and_prompt_paths() {
        assert!(is_session("/org/freedesktop/secrets/session/s1"));
        assert!(!is_session("/org/freedesktop/secrets/session"));
        assert!(!is_session("/org/freedesktop/secrets/session/s1/x"));
        assert!(is_prompt("/org/freedesktop/secrets/prompt/u7"));
        assert!(!is_prompt("/org/freedesktop/secrets/prompt/"));
    }

    #[test]
    fn test_parent_collection() {
        assert_eq!(
            parent_collection("/org/freedesktop/secrets/collection/login/3"),
            Some("/org/freedesktop/secrets/collection/login")
        );
        assert_eq!(
            parent_collection("/org/freedesktop/secrets/collection/login"),
            None
        );
    }
}
