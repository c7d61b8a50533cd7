//! Content fingerprints of file trees.
//!
//! A [`Fingerprint`] is an ordered list of normalized path keys, each mapped
//! to the hash and kind of the file found there, together with a single
//! combined hash. Two fingerprints with the same combined hash describe the
//! same file system state under the sensitivity they were taken with.

use std::collections::BTreeMap;
use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::core::{Blake3Hasher, Hash32};
use crate::error::FingerprintError;
use crate::item::{InputSpec, OutputKind, OutputSpec};

/// File name patterns excluded from every walk unless the list is replaced.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    // Git
    ".git",
    ".gitignore",
    ".gitattributes",
    ".gitmodules",
    // Mercurial
    ".hg",
    ".hgignore",
    ".hgtags",
    // Subversion
    ".svn",
    // CVS
    "CVS",
    ".cvsignore",
    // SCCS
    "SCCS",
    // Visual SourceSafe
    "vssver.scc",
    // Bazaar
    ".bzr",
    ".bzrignore",
    // Darcs
    "_darcs",
    // Misc
    ".DS_Store",
    "*~",
    "#*#",
    ".#*",
    "%*%",
    "._*",
];

/// How a path is turned into the key recorded in a fingerprint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sensitivity {
    /// The absolute path of the file.
    Absolute,
    /// The path relative to the declared root. A file root is keyed by its
    /// file name.
    #[default]
    Relative,
    /// Only the base name, so moving files between directories is invisible.
    NameOnly,
    /// Paths are dropped, every entry is keyed by the empty string. Only the
    /// contents and, under [`DirectorySensitivity::Default`], the directories
    /// of the tree count.
    Ignored,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DirectorySensitivity {
    /// Directories, including empty ones and the root itself, are recorded.
    #[default]
    Default,
    /// Only regular files are recorded.
    IgnoreDirectories,
}

/// How entries are folded into the combined hash.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashStrategy {
    /// Order-insensitive, entries are sorted before combining.
    #[default]
    Sort,
    /// Order-sensitive, entries are combined in insertion order.
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FileKind {
    Regular,
    Directory,
    Missing,
}

impl FileKind {
    fn tag(self) -> u8 {
        match self {
            FileKind::Regular => 0,
            FileKind::Directory => 1,
            FileKind::Missing => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryFingerprint {
    pub kind: FileKind,
    pub hash: Hash32,
}

impl EntryFingerprint {
    pub fn regular(hash: Hash32) -> Self {
        Self {
            kind: FileKind::Regular,
            hash,
        }
    }

    /// Sentinel used for every directory, the contents are covered by the
    /// entries below it.
    pub fn directory() -> Self {
        Self {
            kind: FileKind::Directory,
            hash: Hash32::hash(b"\0kasane:directory"),
        }
    }

    pub fn missing() -> Self {
        Self {
            kind: FileKind::Missing,
            hash: Hash32::hash(b"\0kasane:missing"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    entries: Vec<(String, EntryFingerprint)>,
    strategy: HashStrategy,
    combined: Hash32,
}

impl Fingerprint {
    /// Builds a fingerprint from precomputed entries.
    pub fn from_entries(entries: Vec<(String, EntryFingerprint)>, strategy: HashStrategy) -> Self {
        let combined = combine(&entries, strategy);
        Self {
            entries,
            strategy,
            combined,
        }
    }

    pub fn empty(strategy: HashStrategy) -> Self {
        Self::from_entries(Vec::new(), strategy)
    }

    pub fn entries(&self) -> &[(String, EntryFingerprint)] {
        &self.entries
    }

    pub fn combined(&self) -> Hash32 {
        self.combined
    }

    pub fn strategy(&self) -> HashStrategy {
        self.strategy
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lists the keys that differ between `self` (the previous state) and
    /// `other` (the current state).
    pub fn diff(&self, other: &Fingerprint) -> FingerprintDiff {
        let before = group(&self.entries);
        let after = group(&other.entries);
        let mut diff = FingerprintDiff::default();

        for (key, old) in &before {
            match after.get(key) {
                None => diff.removed.push(key.to_string()),
                Some(new) if new != old => diff.modified.push(key.to_string()),
                Some(_) => {}
            }
        }

        for key in after.keys() {
            if !before.contains_key(key) {
                diff.added.push(key.to_string());
            }
        }

        diff
    }
}

fn group(entries: &[(String, EntryFingerprint)]) -> BTreeMap<&str, Vec<EntryFingerprint>> {
    let mut map: BTreeMap<&str, Vec<EntryFingerprint>> = BTreeMap::new();
    for (key, entry) in entries {
        map.entry(key.as_str()).or_default().push(*entry);
    }
    for values in map.values_mut() {
        values.sort();
    }
    map
}

fn combine(entries: &[(String, EntryFingerprint)], strategy: HashStrategy) -> Hash32 {
    let mut ordered: Vec<&(String, EntryFingerprint)> = entries.iter().collect();
    if strategy == HashStrategy::Sort {
        ordered.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    }

    let mut hasher = Blake3Hasher::default();
    hasher.update(&(ordered.len() as u64).to_le_bytes());
    for (key, entry) in ordered {
        hasher
            .update(&(key.len() as u64).to_le_bytes())
            .update(key.as_bytes())
            .update(&[0, entry.kind.tag()])
            .update(entry.hash.as_bytes());
    }
    hasher.into()
}

/// Keys that differ between two fingerprints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FingerprintDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
}

impl FingerprintDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    /// All changed keys, in sorted order.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .added
            .iter()
            .chain(&self.removed)
            .chain(&self.modified)
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

/// Walks file trees and produces [`Fingerprint`]s.
///
/// The fingerprinter is pure, it never writes to the file system.
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    excludes: Vec<glob::Pattern>,
}

impl Default for Fingerprinter {
    fn default() -> Self {
        let excludes = DEFAULT_EXCLUDES
            .iter()
            .filter_map(|pattern| glob::Pattern::new(pattern).ok())
            .collect();

        Self { excludes }
    }
}

impl Fingerprinter {
    /// Creates a fingerprinter that excludes file names matching `patterns`
    /// instead of [`DEFAULT_EXCLUDES`].
    pub fn with_excludes<I, S>(patterns: I) -> Result<Self, FingerprintError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let excludes = patterns
            .into_iter()
            .map(|pattern| glob::Pattern::new(pattern.as_ref()))
            .collect::<Result<_, _>>()?;

        Ok(Self { excludes })
    }

    fn is_excluded(&self, name: &str) -> bool {
        self.excludes.iter().any(|pattern| pattern.matches(name))
    }

    /// Fingerprints the declared input roots of a work item.
    pub fn fingerprint(
        &self,
        roots: &[InputSpec],
        directories: DirectorySensitivity,
        strategy: HashStrategy,
    ) -> Result<Fingerprint, FingerprintError> {
        let mut entries = Vec::new();
        for root in roots {
            self.walk(&root.path, root.sensitivity, directories, false, &mut entries)?;
        }
        Ok(Fingerprint::from_entries(entries, strategy))
    }

    /// Fingerprints declared outputs by absolute path. Missing file outputs
    /// are recorded so that deleting one is visible.
    pub fn fingerprint_outputs(
        &self,
        outputs: &[OutputSpec],
    ) -> Result<Fingerprint, FingerprintError> {
        let mut entries = Vec::new();
        for output in outputs {
            let record_missing = output.kind == OutputKind::File;
            self.walk(
                &output.path,
                Sensitivity::Absolute,
                DirectorySensitivity::Default,
                record_missing,
                &mut entries,
            )?;
        }
        Ok(Fingerprint::from_entries(entries, HashStrategy::Sort))
    }

    fn walk(
        &self,
        root: &Utf8Path,
        sensitivity: Sensitivity,
        directories: DirectorySensitivity,
        record_missing: bool,
        entries: &mut Vec<(String, EntryFingerprint)>,
    ) -> Result<(), FingerprintError> {
        let absolute = absolute(root)?;

        let metadata = match fs::metadata(&absolute) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if record_missing {
                    let key = file_key(&absolute, sensitivity);
                    entries.push((key, EntryFingerprint::missing()));
                }
                return Ok(());
            }
            Err(source) => {
                return Err(FingerprintError::Io {
                    path: absolute,
                    source,
                });
            }
        };

        if !metadata.is_dir() {
            let entry = hash_file(&absolute)?;
            entries.push((file_key(&absolute, sensitivity), entry));
            return Ok(());
        }

        let walker = WalkDir::new(&absolute)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0
                    || !entry
                        .file_name()
                        .to_str()
                        .is_some_and(|name| self.is_excluded(name))
            });

        for entry in walker {
            let entry = entry.map_err(|source| FingerprintError::Walk {
                root: absolute.clone(),
                source,
            })?;

            let is_dir = entry.file_type().is_dir()
                || (entry.path_is_symlink() && entry.path().is_dir());
            if is_dir && directories == DirectorySensitivity::IgnoreDirectories {
                continue;
            }

            let path = Utf8PathBuf::try_from(entry.into_path())?;
            let key = match sensitivity {
                Sensitivity::Absolute => path.to_string(),
                Sensitivity::Relative => relative_key(&absolute, &path),
                Sensitivity::NameOnly => path.file_name().unwrap_or_default().to_string(),
                Sensitivity::Ignored => String::new(),
            };

            let fingerprint = match is_dir {
                true => EntryFingerprint::directory(),
                false => hash_file(&path)?,
            };

            entries.push((key, fingerprint));
        }

        Ok(())
    }
}

fn absolute(path: &Utf8Path) -> Result<Utf8PathBuf, FingerprintError> {
    let absolute = std::path::absolute(path).map_err(|source| FingerprintError::Io {
        path: path.to_owned(),
        source,
    })?;
    Ok(Utf8PathBuf::try_from(absolute)?)
}

fn file_key(path: &Utf8Path, sensitivity: Sensitivity) -> String {
    match sensitivity {
        Sensitivity::Absolute => path.to_string(),
        Sensitivity::Ignored => String::new(),
        Sensitivity::Relative | Sensitivity::NameOnly => {
            path.file_name().unwrap_or_default().to_string()
        }
    }
}

fn relative_key(root: &Utf8Path, path: &Utf8Path) -> String {
    match path.strip_prefix(root) {
        Ok(relative) => relative
            .components()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join("/"),
        Err(_) => path.to_string(),
    }
}

/// Hashes a regular file. A dangling symlink is recorded as missing.
fn hash_file(path: &Utf8Path) -> Result<EntryFingerprint, FingerprintError> {
    match Hash32::hash_file(path) {
        Ok(hash) => Ok(EntryFingerprint::regular(hash)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(EntryFingerprint::missing()),
        Err(source) => Err(FingerprintError::Io {
            path: path.to_owned(),
            source,
        }),
    }
}
