//! Path resolution.
//!
//! Absolute paths are resolved component by component from the root
//! directory. Every resolved prefix is remembered in a byte-budgeted cache
//! keyed by the prefix without its leading slash (`/a/b` → `"a/b"`), so a
//! later lookup restarts the directory walk from the deepest cached
//! ancestor. Eviction is the clock algorithm: a rotating hand clears
//! `visited` bits as it sweeps and evicts the first entry found clear.

use std::collections::BTreeMap;
use std::ops::Bound;

use log::debug;

use crate::{Error, Result, fs::FileSystem, inode::Inode};

struct CacheEntry {
    inode: Inode,
    visited: bool,
}

const ENTRY_OVERHEAD: usize = size_of::<String>() + size_of::<CacheEntry>();

fn entry_cost(key: &str) -> usize {
    key.len() + ENTRY_OVERHEAD
}

/// Splits off the final component: `/a/b/c` → (`"/a/"` + `"b"`) parent and
/// `"c"`. The parent keeps its trailing slash; a path with no slash after
/// trimming yields an empty parent.
#[must_use]
pub fn split_parent(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(i) => (&trimmed[..=i], &trimmed[i + 1..]),
        None => ("", trimmed),
    }
}

fn normalize(path: &str) -> &str {
    path.trim_matches('/')
}

/// Walks directories from the root, consulting and filling the prefix
/// cache.
pub struct PathResolver {
    cache: BTreeMap<String, CacheEntry>,
    /// Clock hand: the key most recently passed or evicted.
    hand: Option<String>,
    cur_bytes: usize,
    max_bytes: usize,
}

impl PathResolver {
    #[must_use]
    pub fn new(max_bytes: usize) -> Self {
        Self {
            cache: BTreeMap::new(),
            hand: None,
            cur_bytes: 0,
            max_bytes,
        }
    }

    /// Resolves an absolute path to an inode.
    pub fn resolve(&mut self, fs: &mut FileSystem, path: &str) -> Result<Inode> {
        if !path.starts_with('/') {
            return Err(Error::InvalidPath);
        }
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        if parts.is_empty() {
            return Ok(fs.root());
        }

        let mut keys = Vec::with_capacity(parts.len());
        let mut acc = String::new();
        for part in &parts {
            if !acc.is_empty() {
                acc.push('/');
            }
            acc.push_str(part);
            keys.push(acc.clone());
        }

        // start the walk from the deepest cached prefix
        let mut cur = fs.root();
        let mut start = 0;
        for (i, key) in keys.iter().enumerate() {
            if let Some(entry) = self.cache.get_mut(key) {
                entry.visited = true;
                cur = entry.inode;
                start = i + 1;
            }
        }

        for i in start..parts.len() {
            debug!("resolve: walking {:?}", keys[i]);
            cur = cur
                .find(fs, parts[i].as_bytes())?
                .ok_or(Error::NotFound)?;
            self.insert(keys[i].clone(), cur);
        }
        Ok(cur)
    }

    /// Drops every cached prefix starting with `path`. Called after any
    /// operation that unlinks or renames, since stale positions must not be
    /// handed out again.
    pub fn invalidate_prefix(&mut self, path: &str) {
        let prefix = normalize(path);
        let doomed: Vec<String> = self
            .cache
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in doomed {
            debug!("resolver: invalidating {key:?}");
            self.cur_bytes -= entry_cost(&key);
            self.cache.remove(&key);
        }
    }

    fn insert(&mut self, key: String, inode: Inode) {
        let cost = entry_cost(&key);
        if !self.cache.contains_key(&key) {
            if self.cur_bytes + cost > self.max_bytes {
                self.evict(self.cur_bytes + cost - self.max_bytes);
            }
            self.cur_bytes += cost;
        }
        self.cache.insert(
            key,
            CacheEntry {
                inode,
                visited: true,
            },
        );
    }

    /// Reclaims at least `need` bytes with the clock sweep.
    fn evict(&mut self, need: usize) {
        let mut reclaimed = 0;
        while reclaimed < need && !self.cache.is_empty() {
            let key = self.next_victim();
            debug!("resolver: evicting {key:?}");
            let cost = entry_cost(&key);
            self.cache.remove(&key);
            self.cur_bytes -= cost;
            reclaimed += cost;
            self.hand = Some(key);
        }
    }

    /// Sweeps the hand forward, clearing visited bits, until it lands on an
    /// unvisited entry.
    fn next_victim(&mut self) -> String {
        loop {
            let key = self.advance();
            let entry = self.cache.get_mut(&key).expect("hand points into cache");
            if entry.visited {
                entry.visited = false;
                self.hand = Some(key);
            } else {
                return key;
            }
        }
    }

    /// The key after the hand, wrapping to the smallest key.
    fn advance(&self) -> String {
        let next = self.hand.as_ref().and_then(|hand| {
            self.cache
                .range::<str, _>((Bound::Excluded(hand.as_str()), Bound::Unbounded))
                .next()
        });
        match next {
            Some((key, _)) => key.clone(),
            None => self.cache.keys().next().expect("cache not empty").clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use oxfs_types::{T_DIR, T_FILE};

    use crate::fs::new_test_fs;
    use crate::inode::new_disk_inode;

    fn mkdirs(fs: &mut FileSystem, path: &str) {
        let mut resolver = PathResolver::new(usize::MAX);
        let (parent, name) = split_parent(path);
        let dir = resolver.resolve(fs, parent).unwrap();
        dir.create(fs, name.as_bytes(), new_disk_inode(T_DIR, libc::S_IFDIR | 0o755))
            .unwrap();
    }

    #[test]
    fn split_parent_cases() {
        assert_eq!(split_parent("/a"), ("/", "a"));
        assert_eq!(split_parent("/a/bb/c"), ("/a/bb/", "c"));
        assert_eq!(split_parent("/a/bb/c/"), ("/a/bb/", "c"));
        assert_eq!(split_parent("/"), ("", ""));
    }

    #[test]
    fn resolve_root_and_children() {
        let (_dir, mut fs) = new_test_fs();
        mkdirs(&mut fs, "/a");
        mkdirs(&mut fs, "/a/b");

        let mut resolver = PathResolver::new(1 << 20);
        assert_eq!(resolver.resolve(&mut fs, "/").unwrap(), fs.root());
        let a = resolver.resolve(&mut fs, "/a").unwrap();
        let b = resolver.resolve(&mut fs, "/a/b").unwrap();
        assert_ne!(a, b);
        // trailing and doubled slashes resolve to the same place
        assert_eq!(resolver.resolve(&mut fs, "/a/b/").unwrap(), b);
        assert_eq!(resolver.resolve(&mut fs, "//a//b").unwrap(), b);
    }

    #[test]
    fn resolve_requires_absolute_paths() {
        let (_dir, mut fs) = new_test_fs();
        let mut resolver = PathResolver::new(1 << 20);
        assert!(matches!(
            resolver.resolve(&mut fs, "a/b"),
            Err(Error::InvalidPath)
        ));
        assert!(matches!(
            resolver.resolve(&mut fs, ""),
            Err(Error::InvalidPath)
        ));
    }

    #[test]
    fn resolve_missing_component_fails() {
        let (_dir, mut fs) = new_test_fs();
        mkdirs(&mut fs, "/a");
        let mut resolver = PathResolver::new(1 << 20);
        assert!(matches!(
            resolver.resolve(&mut fs, "/a/nope"),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn resolve_through_file_is_not_a_directory() {
        let (_dir, mut fs) = new_test_fs();
        let root = fs.root();
        root.create(&mut fs, b"f", new_disk_inode(T_FILE, libc::S_IFREG | 0o644))
            .unwrap();
        let mut resolver = PathResolver::new(1 << 20);
        assert!(matches!(
            resolver.resolve(&mut fs, "/f/x"),
            Err(Error::NotDirectory)
        ));
    }

    #[test]
    fn resolve_fills_prefix_cache() {
        let (_dir, mut fs) = new_test_fs();
        mkdirs(&mut fs, "/a");
        mkdirs(&mut fs, "/a/b");
        mkdirs(&mut fs, "/a/b/c");

        let mut resolver = PathResolver::new(1 << 20);
        resolver.resolve(&mut fs, "/a/b/c").unwrap();
        assert!(resolver.cache.contains_key("a"));
        assert!(resolver.cache.contains_key("a/b"));
        assert!(resolver.cache.contains_key("a/b/c"));
    }

    #[test]
    fn invalidate_prefix_drops_the_subtree_only() {
        let (_dir, mut fs) = new_test_fs();
        mkdirs(&mut fs, "/a");
        mkdirs(&mut fs, "/a/b");
        mkdirs(&mut fs, "/a/b/c");

        let mut resolver = PathResolver::new(1 << 20);
        resolver.resolve(&mut fs, "/a/b/c").unwrap();
        resolver.invalidate_prefix("/a/b");
        assert!(resolver.cache.contains_key("a"));
        assert!(!resolver.cache.contains_key("a/b"));
        assert!(!resolver.cache.contains_key("a/b/c"));
        assert_eq!(resolver.cur_bytes, entry_cost("a"));
    }

    #[test]
    fn clock_eviction_respects_the_budget() {
        let (_dir, mut fs) = new_test_fs();
        for name in ["/a", "/b", "/c", "/d", "/e"] {
            mkdirs(&mut fs, name);
        }

        // room for roughly three single-letter entries
        let mut resolver = PathResolver::new(3 * entry_cost("x"));
        for name in ["/a", "/b", "/c", "/d", "/e"] {
            resolver.resolve(&mut fs, name).unwrap();
        }
        assert!(resolver.cur_bytes <= resolver.max_bytes);
        assert!(!resolver.cache.is_empty());
        // evicted entries simply re-resolve
        let a = resolver.resolve(&mut fs, "/a").unwrap();
        assert_eq!(resolver.resolve(&mut fs, "/a").unwrap(), a);
    }

    #[test]
    fn clock_clears_visited_bits_before_evicting() {
        let (_dir, mut fs) = new_test_fs();
        for name in ["/a", "/b", "/c"] {
            mkdirs(&mut fs, name);
        }
        let mut resolver = PathResolver::new(usize::MAX);
        for name in ["/a", "/b", "/c"] {
            resolver.resolve(&mut fs, name).unwrap();
        }
        // all entries are visited: the sweep clears every bit on its first
        // lap, wraps, and evicts the first entry it cleared
        resolver.evict(1);
        assert_eq!(resolver.cache.len(), 2);
        assert!(!resolver.cache.contains_key("a"));
        assert!(resolver.cache.values().all(|e| !e.visited));
    }
}
