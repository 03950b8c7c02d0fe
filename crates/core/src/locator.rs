// Bounded depth-first file search

use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Default bound on how far below the search root the walk descends
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Errors that abort a search. Failures below the root never do.
#[derive(Debug, thiserror::Error)]
pub enum LocateError {
    #[error("Search root {} is not readable: {source}", .path.display())]
    RootUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Search root {} is not a directory", .0.display())]
    NotADirectory(PathBuf),
}

/// When a search stops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    /// Stop at the first matching file in traversal order
    FirstMatch,
    /// Walk the whole tree and collect every match
    AllMatches,
}

/// A file-name pattern. `*.jar` matches by suffix, `lib*` by prefix,
/// anything else must match exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamePattern {
    Exact(String),
    Suffix(String),
    Prefix(String),
}

impl NamePattern {
    pub fn parse(pattern: &str) -> Self {
        if let Some(suffix) = pattern.strip_prefix('*') {
            if !suffix.contains('*') {
                return Self::Suffix(suffix.to_string());
            }
        }
        if let Some(prefix) = pattern.strip_suffix('*') {
            if !prefix.contains('*') {
                return Self::Prefix(prefix.to_string());
            }
        }
        Self::Exact(pattern.to_string())
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Exact(exact) => name == exact,
            Self::Suffix(suffix) => name.ends_with(suffix.as_str()),
            Self::Prefix(prefix) => name.starts_with(prefix.as_str()),
        }
    }
}

/// What to look for and when to stop
#[derive(Debug, Clone)]
pub struct SearchQuery {
    filename: Option<String>,
    pattern: Option<NamePattern>,
    name_filter: Option<String>,
    policy: MatchPolicy,
}

impl SearchQuery {
    /// First file named exactly `filename`
    pub fn first(filename: impl Into<String>) -> Self {
        Self {
            filename: Some(filename.into()),
            pattern: None,
            name_filter: None,
            policy: MatchPolicy::FirstMatch,
        }
    }

    /// Every file named exactly `filename`
    pub fn all(filename: impl Into<String>) -> Self {
        Self {
            policy: MatchPolicy::AllMatches,
            ..Self::first(filename)
        }
    }

    /// Every file whose name matches `pattern`
    pub fn matching(pattern: NamePattern) -> Self {
        Self {
            filename: None,
            pattern: Some(pattern),
            name_filter: None,
            policy: MatchPolicy::AllMatches,
        }
    }

    /// Also accept names matching `pattern`
    pub fn with_pattern(mut self, pattern: NamePattern) -> Self {
        self.pattern = Some(pattern);
        self
    }

    /// Only keep matches named exactly `name`
    pub fn with_name_filter(mut self, name: impl Into<String>) -> Self {
        self.name_filter = Some(name.into());
        self
    }

    pub fn policy(&self) -> MatchPolicy {
        self.policy
    }

    pub fn matches(&self, name: &str) -> bool {
        let hit = self.filename.as_deref() == Some(name)
            || self.pattern.as_ref().is_some_and(|p| p.matches(name));

        hit && self.name_filter.as_deref().map_or(true, |filter| filter == name)
    }
}

/// Outcome of a single search. A miss is `found: false`, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub found: bool,
    pub matches: Vec<PathBuf>,
    pub search_root: PathBuf,
}

impl SearchResult {
    fn new(search_root: PathBuf, matches: Vec<PathBuf>) -> Self {
        Self {
            found: !matches.is_empty(),
            matches,
            search_root,
        }
    }

    /// First match in traversal order
    pub fn first(&self) -> Option<&Path> {
        self.matches.first().map(PathBuf::as_path)
    }
}

/// Depth-first file finder.
///
/// Entries inside a directory are visited sorted by file name so that the
/// traversal order, and with it "first match", is stable for an unchanged
/// tree. Symlinked directories are followed by default; cycles are detected
/// and skipped, and `max_depth` bounds the walk regardless.
#[derive(Debug, Clone)]
pub struct FileLocator {
    max_depth: usize,
    follow_links: bool,
}

impl FileLocator {
    pub fn new() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            follow_links: true,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_follow_links(mut self, follow_links: bool) -> Self {
        self.follow_links = follow_links;
        self
    }

    /// Find the first file named `filename` under `root`
    pub fn locate(&self, filename: &str, root: &Path) -> Result<SearchResult, LocateError> {
        self.search(&SearchQuery::first(filename), root)
    }

    /// Find every file named `filename` under `root`
    pub fn locate_all(&self, filename: &str, root: &Path) -> Result<SearchResult, LocateError> {
        self.search(&SearchQuery::all(filename), root)
    }

    /// Run `query` against the tree rooted at `root`.
    ///
    /// Unreadable subdirectories and broken links are logged and skipped.
    /// Only an unreadable root is an error.
    pub fn search(&self, query: &SearchQuery, root: &Path) -> Result<SearchResult, LocateError> {
        let search_root = open_root(root)?;
        let mut matches = Vec::new();

        let walker = WalkDir::new(&search_root)
            .follow_links(self.follow_links)
            .max_depth(self.max_depth)
            .sort_by_file_name();

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    if let Some(ancestor) = err.loop_ancestor() {
                        tracing::debug!(
                            "Skipping symlink cycle back to {}",
                            ancestor.display()
                        );
                    } else {
                        tracing::warn!(
                            path = ?err.path(),
                            "Skipping unreadable entry: {}",
                            err
                        );
                    }
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let Some(name) = entry.file_name().to_str() else {
                continue;
            };

            if query.matches(name) {
                matches.push(entry.into_path());
                if query.policy() == MatchPolicy::FirstMatch {
                    break;
                }
            }
        }

        tracing::debug!(
            "Search under {} finished with {} match(es)",
            search_root.display(),
            matches.len()
        );

        Ok(SearchResult::new(search_root, matches))
    }
}

impl Default for FileLocator {
    fn default() -> Self {
        Self::new()
    }
}

fn open_root(root: &Path) -> Result<PathBuf, LocateError> {
    let unreadable = |source| LocateError::RootUnreadable {
        path: root.to_path_buf(),
        source,
    };

    let canonical = std::fs::canonicalize(root).map_err(unreadable)?;
    if !canonical.is_dir() {
        return Err(LocateError::NotADirectory(canonical));
    }
    std::fs::read_dir(&canonical).map_err(unreadable)?;

    Ok(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(root: &Path, relative: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"").unwrap();
    }

    fn target_tree() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        touch(temp_dir.path(), "a/b/target.txt");
        touch(temp_dir.path(), "a/c/target.txt");
        touch(temp_dir.path(), "a/c/other.txt");
        touch(temp_dir.path(), "z/unrelated.md");
        temp_dir
    }

    #[test]
    fn test_first_match_returns_one_of_the_targets() {
        let temp_dir = target_tree();
        let result = FileLocator::new()
            .locate("target.txt", temp_dir.path())
            .unwrap();

        let root = &result.search_root;
        let expected = [root.join("a/b/target.txt"), root.join("a/c/target.txt")];

        assert!(result.found);
        assert_eq!(result.matches.len(), 1);
        assert!(expected.contains(&result.matches[0]));
    }

    #[test]
    fn test_all_matches_returns_exactly_the_targets() {
        let temp_dir = target_tree();
        let result = FileLocator::new()
            .locate_all("target.txt", temp_dir.path())
            .unwrap();

        let root = &result.search_root;
        assert_eq!(
            result.matches,
            vec![root.join("a/b/target.txt"), root.join("a/c/target.txt")]
        );
    }

    #[test]
    fn test_no_match_is_not_an_error() {
        let temp_dir = target_tree();
        let result = FileLocator::new()
            .locate("missing.txt", temp_dir.path())
            .unwrap();

        assert!(!result.found);
        assert!(result.matches.is_empty());
        assert!(result.first().is_none());
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let err = FileLocator::new()
            .locate("target.txt", &temp_dir.path().join("does-not-exist"))
            .unwrap_err();

        assert!(matches!(err, LocateError::RootUnreadable { .. }));
    }

    #[test]
    fn test_file_root_is_an_error() {
        let temp_dir = target_tree();
        let err = FileLocator::new()
            .locate("target.txt", &temp_dir.path().join("z/unrelated.md"))
            .unwrap_err();

        assert!(matches!(err, LocateError::NotADirectory(_)));
    }

    #[test]
    fn test_jar_tree_order_is_stable() {
        let temp_dir = TempDir::new().unwrap();
        touch(temp_dir.path(), "lib/foo.jar");
        touch(temp_dir.path(), "lib/deep/foo.jar");
        touch(temp_dir.path(), "lib/deep/bar.jar");

        let locator = FileLocator::new();
        let all = locator.locate_all("foo.jar", temp_dir.path()).unwrap();
        let root = &all.search_root;
        assert_eq!(
            all.matches,
            vec![root.join("lib/deep/foo.jar"), root.join("lib/foo.jar")]
        );

        let first = locator.locate("foo.jar", temp_dir.path()).unwrap();
        for _ in 0..3 {
            let again = locator.locate("foo.jar", temp_dir.path()).unwrap();
            assert_eq!(again, first);
        }
        assert_eq!(first.first(), Some(root.join("lib/deep/foo.jar").as_path()));
    }

    #[test]
    fn test_suffix_pattern_with_name_filter() {
        let temp_dir = TempDir::new().unwrap();
        touch(temp_dir.path(), "lib/foo.jar");
        touch(temp_dir.path(), "lib/bar.jar");
        touch(temp_dir.path(), "lib/foo.txt");

        let locator = FileLocator::new();
        let jars = locator
            .search(&SearchQuery::matching(NamePattern::parse("*.jar")), temp_dir.path())
            .unwrap();
        assert_eq!(jars.matches.len(), 2);

        let foo = locator
            .search(
                &SearchQuery::matching(NamePattern::parse("*.jar")).with_name_filter("foo.jar"),
                temp_dir.path(),
            )
            .unwrap();
        assert_eq!(foo.matches, vec![foo.search_root.join("lib/foo.jar")]);
    }

    #[test]
    fn test_name_pattern_parse() {
        assert_eq!(NamePattern::parse("*.jar"), NamePattern::Suffix(".jar".into()));
        assert_eq!(NamePattern::parse("lib*"), NamePattern::Prefix("lib".into()));
        assert_eq!(NamePattern::parse("a*b*"), NamePattern::Exact("a*b*".into()));
        assert!(NamePattern::parse("*.jar").matches("x.jar"));
        assert!(!NamePattern::parse("*.jar").matches("x.jar.bak"));
    }

    #[test]
    fn test_max_depth_bounds_the_walk() {
        let temp_dir = TempDir::new().unwrap();
        touch(temp_dir.path(), "a/b/c/deep.txt");

        let shallow = FileLocator::new()
            .with_max_depth(2)
            .locate("deep.txt", temp_dir.path())
            .unwrap();
        assert!(!shallow.found);

        let deep = FileLocator::new()
            .with_max_depth(4)
            .locate("deep.txt", temp_dir.path())
            .unwrap();
        assert!(deep.found);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_cycle_terminates() {
        let temp_dir = target_tree();
        std::os::unix::fs::symlink(temp_dir.path(), temp_dir.path().join("a/loop")).unwrap();
        std::os::unix::fs::symlink(
            temp_dir.path().join("nowhere"),
            temp_dir.path().join("a/broken"),
        )
        .unwrap();

        let result = FileLocator::new()
            .locate_all("target.txt", temp_dir.path())
            .unwrap();

        let root = &result.search_root;
        assert_eq!(
            result.matches,
            vec![root.join("a/b/target.txt"), root.join("a/c/target.txt")]
        );
    }
}
