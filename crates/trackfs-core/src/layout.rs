//! Versioned layout and object naming under a commit root.
//!
//! ```text
//! tracker/<version>.txt
//! commit/<version>/<uniqueId>
//! commit/<version>/COMMIT-HINT.TXT
//! archive/<version>.txt@<expiryEpochMillis>
//! commit/<version>/sub-tracker/<sub>.txt
//! commit/<version>/sub-hint/COMMIT-HINT.TXT
//! commit/<version>/sub-hint/<recordName>
//! commit/<version>/<sub>/PRE_COMMIT-<uniqueId>.txt
//! commit/<version>/<sub>/<uniqueId>.txt
//! commit/<version>/<sub>/EXPIRED-HINT.TXT
//! ```
//!
//! Marker names always carry a suffix so that prefix listing on object
//! stores cannot match a longer sibling (`1` vs `15`).

/// Name of the hint object that finalizes a (sub)version.
pub const COMMIT_HINT: &str = "COMMIT-HINT.TXT";

/// Name of the marker that permanently abandons a sub-version.
pub const EXPIRED_HINT: &str = "EXPIRED-HINT.TXT";

/// Prefix of a Protocol B phase-one record.
pub const PRE_COMMIT_PREFIX: &str = "PRE_COMMIT-";

const MARKER_SUFFIX: &str = ".txt";
const ARCHIVE_SEPARATOR: char = '@';

/// Key builder for the three namespaces of one commit root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Root prefix, empty or ending with `/`.
    root: String,
}

impl Layout {
    /// Create a layout rooted at `root` (empty means the backend root).
    pub fn new(root: impl AsRef<str>) -> Self {
        let trimmed = root.as_ref().trim_matches('/');
        let root = if trimmed.is_empty() {
            String::new()
        } else {
            format!("{trimmed}/")
        };
        Self { root }
    }

    /// The normalized root prefix.
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn tracker_dir(&self) -> String {
        format!("{}tracker/", self.root)
    }

    pub fn commit_root(&self) -> String {
        format!("{}commit/", self.root)
    }

    pub fn archive_dir(&self) -> String {
        format!("{}archive/", self.root)
    }

    /// `tracker/<version>.txt`
    pub fn tracker_marker(&self, version: u64) -> String {
        format!("{}{}", self.tracker_dir(), marker_name(version))
    }

    /// `commit/<version>/`
    pub fn version_dir(&self, version: u64) -> String {
        format!("{}{version}/", self.commit_root())
    }

    /// `commit/<version>/COMMIT-HINT.TXT`
    pub fn commit_hint(&self, version: u64) -> String {
        format!("{}{COMMIT_HINT}", self.version_dir(version))
    }

    /// `commit/<version>/<record>`
    pub fn record(&self, version: u64, record: &str) -> String {
        format!("{}{record}", self.version_dir(version))
    }

    /// `archive/<name>`
    pub fn archive_entry(&self, name: &str) -> String {
        format!("{}{name}", self.archive_dir())
    }

    /// `commit/<version>/sub-tracker/`
    pub fn sub_tracker_dir(&self, version: u64) -> String {
        format!("{}sub-tracker/", self.version_dir(version))
    }

    /// `commit/<version>/sub-tracker/<sub>.txt`
    pub fn sub_tracker_marker(&self, version: u64, sub: u64) -> String {
        format!("{}{}", self.sub_tracker_dir(version), marker_name(sub))
    }

    /// `commit/<version>/sub-hint/`
    pub fn sub_hint_dir(&self, version: u64) -> String {
        format!("{}sub-hint/", self.version_dir(version))
    }

    /// `commit/<version>/sub-hint/COMMIT-HINT.TXT`
    pub fn sub_hint(&self, version: u64) -> String {
        format!("{}{COMMIT_HINT}", self.sub_hint_dir(version))
    }

    /// `commit/<version>/sub-hint/<record>`
    pub fn debug_marker(&self, version: u64, record: &str) -> String {
        format!("{}{record}", self.sub_hint_dir(version))
    }

    /// `commit/<version>/<sub>/`
    pub fn detail_dir(&self, version: u64, sub: u64) -> String {
        format!("{}{sub}/", self.version_dir(version))
    }

    /// `commit/<version>/<sub>/EXPIRED-HINT.TXT`
    pub fn expired_hint(&self, version: u64, sub: u64) -> String {
        format!("{}{EXPIRED_HINT}", self.detail_dir(version, sub))
    }

    /// `commit/<version>/<sub>/<name>`
    pub fn detail_record(&self, version: u64, sub: u64, name: &str) -> String {
        format!("{}{name}", self.detail_dir(version, sub))
    }
}

/// `<version>.txt`
pub fn marker_name(version: u64) -> String {
    format!("{version}{MARKER_SUFFIX}")
}

/// Parse the version out of a tracker or archive marker name.
///
/// Accepts `<version>.txt` and `<version>.txt@<expiry>`.
pub fn parse_marker_version(name: &str) -> Option<u64> {
    let (head, _) = name.split_once('.')?;
    head.parse().ok()
}

/// Strip the phase-one prefix so both phases of one record share a name.
pub fn canonical_record_name(name: &str) -> &str {
    name.strip_prefix(PRE_COMMIT_PREFIX).unwrap_or(name)
}

/// A delayed-deletion ticket: `<version>.txt@<expiryEpochMillis>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveMarker {
    pub version: u64,
    pub expires_at_millis: i64,
}

impl ArchiveMarker {
    /// Schedule `version` for deletion at `expires_at_millis`.
    pub fn new(version: u64, expires_at_millis: i64) -> Self {
        Self {
            version,
            expires_at_millis,
        }
    }

    /// The object name of this marker inside `archive/`.
    pub fn file_name(&self) -> String {
        format!(
            "{}{ARCHIVE_SEPARATOR}{}",
            marker_name(self.version),
            self.expires_at_millis
        )
    }

    /// Parse an archive object name. Returns `None` for foreign names.
    pub fn parse(name: &str) -> Option<Self> {
        let (marker, expiry) = name.split_once(ARCHIVE_SEPARATOR)?;
        let version = parse_marker_version(marker)?;
        let expires_at_millis = expiry.parse().ok()?;
        Some(Self {
            version,
            expires_at_millis,
        })
    }

    /// Whether physical deletion is allowed at `now_millis`.
    pub fn is_expired(&self, now_millis: i64) -> bool {
        now_millis > self.expires_at_millis
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_keys() {
        let layout = Layout::new("tables/orders");
        assert_eq!(layout.tracker_marker(7), "tables/orders/tracker/7.txt");
        assert_eq!(layout.commit_hint(0), "tables/orders/commit/0/COMMIT-HINT.TXT");
        assert_eq!(layout.sub_hint(3), "tables/orders/commit/3/sub-hint/COMMIT-HINT.TXT");
        assert_eq!(
            layout.sub_tracker_marker(3, 1),
            "tables/orders/commit/3/sub-tracker/1.txt"
        );
        assert_eq!(
            layout.expired_hint(3, 1),
            "tables/orders/commit/3/1/EXPIRED-HINT.TXT"
        );
    }

    #[test]
    fn test_layout_root_normalization() {
        assert_eq!(Layout::new("").tracker_dir(), "tracker/");
        assert_eq!(Layout::new("/a/b/").archive_dir(), "a/b/archive/");
        assert_eq!(Layout::new("a"), Layout::new("a/"));
    }

    #[test]
    fn test_parse_marker_version() {
        assert_eq!(parse_marker_version("15.txt"), Some(15));
        assert_eq!(parse_marker_version("15.txt@1700000000000"), Some(15));
        assert_eq!(parse_marker_version("COMMIT-HINT.TXT"), None);
        assert_eq!(parse_marker_version("15"), None);
    }

    #[test]
    fn test_canonical_record_name() {
        assert_eq!(canonical_record_name("PRE_COMMIT-abc.txt"), "abc.txt");
        assert_eq!(canonical_record_name("abc.txt"), "abc.txt");
    }

    #[test]
    fn test_archive_marker_name() {
        let marker = ArchiveMarker::new(4, 1_700_000_030_000);
        assert_eq!(marker.file_name(), "4.txt@1700000030000");
        assert_eq!(ArchiveMarker::parse(&marker.file_name()), Some(marker.clone()));
        assert!(!marker.is_expired(1_700_000_030_000));
        assert!(marker.is_expired(1_700_000_030_001));
        assert_eq!(ArchiveMarker::parse("4.txt"), None);
    }
}
