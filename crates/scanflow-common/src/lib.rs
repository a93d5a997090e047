/// Common types shared by every scanflow crate: iteration identity, scan
/// records and the error taxonomy.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Discovery failures. Each variant names the offending key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    #[error("No subject could be discovered under {0}")]
    NoSubjects(PathBuf),

    #[error("Missing {modality} scan for {key}")]
    MissingModality { key: IterationKey, modality: Modality },

    #[error("Duplicate {modality} scans match {key}: {paths:?}")]
    DuplicateMatch {
        key: IterationKey,
        modality: Modality,
        paths: Vec<PathBuf>,
    },
}

/// Processing errors
#[derive(Debug, Error)]
pub enum ScanflowError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Join mismatch: {0}")]
    JoinMismatch(String),

    #[error("Registration failed: {0}")]
    Registration(String),

    #[error("Transform composition error: {0}")]
    Composition(String),

    #[error("Resource exhausted: node '{node}' needs {requested} but the budget is {budget}")]
    ResourceExhausted {
        node: String,
        requested: String,
        budget: String,
    },

    #[error("No element keyed {0}")]
    NotFound(IterationKey),

    #[error("{count} elements keyed {key}")]
    DuplicateMatch { key: IterationKey, count: usize },

    #[error("Node '{node}' timed out after {secs}s")]
    Timeout { node: String, secs: u64 },

    #[error("Skipped: upstream node '{0}' failed")]
    UpstreamFailed(String),

    #[error("Task failed: {0}")]
    TaskFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScanflowError {
    /// Taxonomy bucket used in run reports
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Discovery(_) => ErrorKind::Discovery,
            Self::JoinMismatch(_) => ErrorKind::JoinMismatch,
            Self::Registration(_) => ErrorKind::RegistrationFailure,
            Self::Composition(_) => ErrorKind::Composition,
            Self::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::DuplicateMatch { .. } => ErrorKind::DuplicateMatch,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::UpstreamFailed(_) => ErrorKind::UpstreamFailed,
            Self::TaskFailed(_) => ErrorKind::TaskFailed,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether the error aborts graph construction before anything runs
    #[must_use]
    pub fn is_build_time(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Configuration | ErrorKind::Discovery | ErrorKind::JoinMismatch
        )
    }
}

/// Result type for scanflow operations
pub type Result<T> = std::result::Result<T, ScanflowError>;

/// Error taxonomy as recorded in reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Discovery,
    JoinMismatch,
    RegistrationFailure,
    Composition,
    ResourceExhausted,
    NotFound,
    DuplicateMatch,
    Timeout,
    UpstreamFailed,
    TaskFailed,
    Io,
}

/// Scan modality
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    /// Structural scan (`T1w`, `T2w`)
    Anatomical,
    /// Functional series (`bold`, `cbv`)
    Functional,
}

impl Modality {
    /// Map a filename suffix to a modality
    #[must_use]
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "T1w" | "T2w" => Some(Self::Anatomical),
            "bold" | "cbv" => Some(Self::Functional),
            _ => None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Anatomical => "anatomical",
            Self::Functional => "functional",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity of one fan-out branch: `(subject[, session[, run]])`.
///
/// The derived ordering is lexicographic over (subject, session, run), with an
/// absent component sorting before any present one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IterationKey {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
}

impl IterationKey {
    #[must_use]
    pub fn subject(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            session: None,
            run: None,
        }
    }

    #[must_use]
    pub fn session(subject: impl Into<String>, session: Option<String>) -> Self {
        Self {
            subject: subject.into(),
            session,
            run: None,
        }
    }

    #[must_use]
    pub fn run(subject: impl Into<String>, session: Option<String>, run: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            session,
            run: Some(run.into()),
        }
    }

    /// Key one nesting level up, or `None` for a subject-level key
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.run.is_some() {
            Some(Self::session(self.subject.clone(), self.session.clone()))
        } else if self.session.is_some() {
            Some(Self::subject(self.subject.clone()))
        } else {
            None
        }
    }

    /// Drop the run component (the subject+session scope of this key)
    #[must_use]
    pub fn without_run(&self) -> Self {
        Self::session(self.subject.clone(), self.session.clone())
    }

    /// True when `self` equals `other` or is one of its ancestors.
    ///
    /// Comparison is structural: `sub-s1` is never a prefix of `sub-s10`.
    #[must_use]
    pub fn is_prefix_of(&self, other: &IterationKey) -> bool {
        let mut current = Some(other.clone());
        while let Some(key) = current {
            if &key == self {
                return true;
            }
            current = key.parent();
        }
        false
    }

    /// Relative output directory, e.g. `sub-01/ses-1/run-2`
    #[must_use]
    pub fn relative_dir(&self) -> PathBuf {
        let mut path = PathBuf::from(format!("sub-{}", self.subject));
        if let Some(session) = &self.session {
            path.push(format!("ses-{session}"));
        }
        if let Some(run) = &self.run {
            path.push(format!("run-{run}"));
        }
        path
    }
}

impl fmt::Display for IterationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.subject)?;
        if let Some(session) = &self.session {
            write!(f, "_ses-{session}")?;
        }
        if let Some(run) = &self.run {
            write!(f, "_run-{run}")?;
        }
        Ok(())
    }
}

/// A value tagged with the key of the replica that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyed<T> {
    pub key: IterationKey,
    pub value: T,
}

impl<T> Keyed<T> {
    pub fn new(key: IterationKey, value: T) -> Self {
        Self { key, value }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Keyed<U> {
        Keyed {
            key: self.key,
            value: f(self.value),
        }
    }
}

/// One discovered scan. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRecord {
    /// Full identity of the file (subject, session and run when present)
    pub key: IterationKey,
    pub modality: Modality,
    pub path: PathBuf,
}

impl ScanRecord {
    #[must_use]
    pub fn new(key: IterationKey, modality: Modality, path: impl AsRef<Path>) -> Self {
        Self {
            key,
            modality,
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(sub: &str, ses: Option<&str>, run: Option<&str>) -> IterationKey {
        IterationKey {
            subject: sub.to_string(),
            session: ses.map(str::to_string),
            run: run.map(str::to_string),
        }
    }

    #[test]
    fn test_key_ordering_is_lexicographic() {
        let mut keys = vec![
            key("02", Some("1"), Some("1")),
            key("01", Some("2"), Some("1")),
            key("01", Some("1"), Some("2")),
            key("01", Some("1"), Some("1")),
        ];
        keys.sort();
        assert_eq!(keys[0], key("01", Some("1"), Some("1")));
        assert_eq!(keys[1], key("01", Some("1"), Some("2")));
        assert_eq!(keys[2], key("01", Some("2"), Some("1")));
        assert_eq!(keys[3], key("02", Some("1"), Some("1")));
    }

    #[test]
    fn test_prefix_is_structural() {
        let parent = key("s1", Some("1"), None);
        assert!(parent.is_prefix_of(&key("s1", Some("1"), Some("1"))));
        assert!(parent.is_prefix_of(&parent));
        assert!(!parent.is_prefix_of(&key("s10", Some("1"), Some("1"))));
        assert!(!parent.is_prefix_of(&key("s1", Some("2"), Some("1"))));
        assert!(key("s1", None, None).is_prefix_of(&key("s1", Some("1"), Some("3"))));
    }

    #[test]
    fn test_prefix_without_sessions() {
        let parent = key("a", None, None);
        let child = key("a", None, Some("1"));
        assert!(parent.is_prefix_of(&child));
        assert!(!child.is_prefix_of(&parent));
    }

    #[test]
    fn test_display_and_relative_dir() {
        let k = key("01", Some("pre"), Some("2"));
        assert_eq!(k.to_string(), "sub-01_ses-pre_run-2");
        assert_eq!(k.relative_dir(), PathBuf::from("sub-01/ses-pre/run-2"));
        assert_eq!(key("01", None, None).to_string(), "sub-01");
    }

    #[test]
    fn test_modality_suffixes() {
        assert_eq!(Modality::from_suffix("T2w"), Some(Modality::Anatomical));
        assert_eq!(Modality::from_suffix("cbv"), Some(Modality::Functional));
        assert_eq!(Modality::from_suffix("dwi"), None);
    }

    #[test]
    fn test_error_kinds() {
        let err = ScanflowError::JoinMismatch("lengths differ".to_string());
        assert_eq!(err.kind(), ErrorKind::JoinMismatch);
        assert!(err.is_build_time());
        let err = ScanflowError::Registration("exit 1".to_string());
        assert!(!err.is_build_time());
    }

    #[test]
    fn test_keyed_serialization() {
        let keyed = Keyed::new(key("01", None, Some("1")), 7u32);
        let json = serde_json::to_string(&keyed).unwrap();
        let back: Keyed<u32> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, keyed);
        assert!(!json.contains("session"));
    }
}
