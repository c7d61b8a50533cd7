//! Content-addressable storage of work item outputs.
//!
//! When two builds would execute the same action on the same inputs, the
//! second one can restore the outputs produced by the first one instead.

use std::fs;
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::core::{Blake3Hasher, Hash32};
use crate::error::CacheError;
use crate::fingerprint::Fingerprint;
use crate::item::{OutputKind, OutputSpec, WorkItem};

const MANIFEST_VERSION: u32 = 1;

/// Storage for outputs keyed by [`cache_key`].
pub trait BuildCache: Send + Sync {
    /// Restores the outputs stored under `key` into their declared locations
    /// and returns the output fingerprint recorded when they were stored.
    fn load(&self, key: Hash32, outputs: &[OutputSpec]) -> Result<Option<Fingerprint>, CacheError>;

    /// Stores the current contents of `outputs` under `key`.
    fn store(
        &self,
        key: Hash32,
        outputs: &[OutputSpec],
        fingerprint: &Fingerprint,
    ) -> Result<(), CacheError>;

    /// Drops the entry stored under `key`.
    fn remove(&self, key: Hash32) -> Result<(), CacheError>;
}

/// Key under which the outputs of `item` are cached, given its current input
/// fingerprint.
pub fn cache_key(item: &WorkItem, inputs: &Fingerprint) -> Hash32 {
    let mut hasher = Blake3Hasher::default();
    hasher
        .update(item.action_identity().as_bytes())
        .update(inputs.combined().as_bytes());

    for output in item.outputs() {
        let tag = match output.kind {
            OutputKind::File => 0,
            OutputKind::Directory => 1,
        };
        hasher
            .update(&[tag])
            .update(&(output.path.as_str().len() as u64).to_le_bytes())
            .update(output.path.as_str().as_bytes());
    }

    hasher.into()
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    outputs: Vec<CachedOutput>,
    fingerprint: Fingerprint,
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedOutput {
    kind: OutputKind,
    present: bool,
    dirs: Vec<String>,
    files: Vec<CachedFile>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedFile {
    path: String,
    hash: Hash32,
}

/// A [`BuildCache`] backed by a local directory.
///
/// Every entry is a directory named after the hex of its key, holding a CBOR
/// `manifest.cbor` and a copy of every output file under `files/`. Entries
/// are assembled in a temporary directory and renamed into place.
#[derive(Debug, Clone)]
pub struct LocalBuildCache {
    root: Utf8PathBuf,
}

impl LocalBuildCache {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn entry(&self, key: Hash32) -> Utf8PathBuf {
        self.root.join(key.to_hex())
    }

    fn read_manifest(&self, key: Hash32, entry: &Utf8Path) -> Result<Manifest, CacheError> {
        let file = fs::File::open(entry.join("manifest.cbor"))?;
        let manifest: Manifest =
            ciborium::from_reader(io::BufReader::new(file)).map_err(|e| corrupt(key, e))?;

        if manifest.version != MANIFEST_VERSION {
            return Err(corrupt(key, format!("unsupported manifest version {}", manifest.version)));
        }

        Ok(manifest)
    }

    fn verify(
        &self,
        key: Hash32,
        entry: &Utf8Path,
        manifest: &Manifest,
        outputs: &[OutputSpec],
    ) -> Result<(), CacheError> {
        if manifest.outputs.len() != outputs.len() {
            return Err(corrupt(key, "manifest does not match declared outputs"));
        }

        for (i, (cached, output)) in manifest.outputs.iter().zip(outputs).enumerate() {
            if cached.kind != output.kind {
                return Err(corrupt(key, format!("output {} changed kind", output.path)));
            }

            let base = entry.join("files").join(i.to_string());
            for file in &cached.files {
                let path = stored_path(&base, &file.path);
                let hash = Hash32::hash_file(&path)
                    .map_err(|e| corrupt(key, format!("{path}: {e}")))?;
                if hash != file.hash {
                    return Err(corrupt(key, format!("{path} does not match its recorded hash")));
                }
            }
        }

        Ok(())
    }

    fn restore(
        &self,
        entry: &Utf8Path,
        manifest: &Manifest,
        outputs: &[OutputSpec],
    ) -> Result<(), CacheError> {
        for (i, (cached, output)) in manifest.outputs.iter().zip(outputs).enumerate() {
            remove_path(&output.path)?;
            if !cached.present {
                continue;
            }

            let base = entry.join("files").join(i.to_string());
            match cached.kind {
                OutputKind::File => {
                    if let Some(parent) = output.path.parent()
                        && !parent.as_str().is_empty()
                    {
                        fs::create_dir_all(parent)?;
                    }
                    if let Some(file) = cached.files.first() {
                        fs::copy(stored_path(&base, &file.path), &output.path)?;
                    }
                }
                OutputKind::Directory => {
                    fs::create_dir_all(&output.path)?;
                    for dir in &cached.dirs {
                        fs::create_dir_all(output.path.join(dir))?;
                    }
                    for file in &cached.files {
                        let target = output.path.join(&file.path);
                        if let Some(parent) = target.parent() {
                            fs::create_dir_all(parent)?;
                        }
                        fs::copy(stored_path(&base, &file.path), &target)?;
                    }
                }
            }
        }

        Ok(())
    }

    fn load_entry(
        &self,
        key: Hash32,
        entry: &Utf8Path,
        outputs: &[OutputSpec],
    ) -> Result<Fingerprint, CacheError> {
        let manifest = self.read_manifest(key, entry)?;
        self.verify(key, entry, &manifest, outputs)?;
        self.restore(entry, &manifest, outputs)?;
        Ok(manifest.fingerprint)
    }
}

impl BuildCache for LocalBuildCache {
    fn load(&self, key: Hash32, outputs: &[OutputSpec]) -> Result<Option<Fingerprint>, CacheError> {
        let entry = self.entry(key);
        if !entry.is_dir() {
            return Ok(None);
        }

        match self.load_entry(key, &entry, outputs) {
            Ok(fingerprint) => Ok(Some(fingerprint)),
            Err(e @ CacheError::Corrupt { .. }) => {
                self.remove(key)?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn store(
        &self,
        key: Hash32,
        outputs: &[OutputSpec],
        fingerprint: &Fingerprint,
    ) -> Result<(), CacheError> {
        let entry = self.entry(key);
        if entry.is_dir() {
            debug!(key = %key.short(), "cache entry already present");
            return Ok(());
        }

        fs::create_dir_all(&self.root)?;
        let temp = tempfile::Builder::new().prefix(".entry").tempdir_in(&self.root)?;
        let temp_root = Utf8PathBuf::try_from(temp.path().to_path_buf())
            .map_err(|e| corrupt(key, e))?;

        let mut cached = Vec::with_capacity(outputs.len());
        for (i, output) in outputs.iter().enumerate() {
            let base = temp_root.join("files").join(i.to_string());
            cached.push(copy_output(output, &base)?);
        }

        let manifest = Manifest {
            version: MANIFEST_VERSION,
            outputs: cached,
            fingerprint: fingerprint.clone(),
        };
        let mut writer = io::BufWriter::new(fs::File::create(temp_root.join("manifest.cbor"))?);
        ciborium::into_writer(&manifest, &mut writer)?;
        writer.flush()?;

        match fs::rename(&temp_root, &entry) {
            Ok(()) => Ok(()),
            // Another writer stored the same key first.
            Err(_) if entry.is_dir() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&self, key: Hash32) -> Result<(), CacheError> {
        match fs::remove_dir_all(self.entry(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn corrupt(key: Hash32, reason: impl ToString) -> CacheError {
    CacheError::Corrupt {
        key: key.short(),
        reason: reason.to_string(),
    }
}

/// Location of a stored file. A file output is stored under `base/content`.
fn stored_path(base: &Utf8Path, relative: &str) -> Utf8PathBuf {
    match relative.is_empty() {
        true => base.join("content"),
        false => base.join(relative),
    }
}

fn copy_output(output: &OutputSpec, base: &Utf8Path) -> Result<CachedOutput, CacheError> {
    let mut cached = CachedOutput {
        kind: output.kind,
        present: output.path.exists(),
        dirs: Vec::new(),
        files: Vec::new(),
    };

    if !cached.present {
        return Ok(cached);
    }

    fs::create_dir_all(base)?;
    match output.kind {
        OutputKind::File => {
            fs::copy(&output.path, stored_path(base, ""))?;
            cached.files.push(CachedFile {
                path: String::new(),
                hash: Hash32::hash_file(&output.path)?,
            });
        }
        OutputKind::Directory => {
            for entry in WalkDir::new(&output.path).min_depth(1).sort_by_file_name() {
                let entry = entry.map_err(io::Error::from)?;
                let relative = entry
                    .path()
                    .strip_prefix(&output.path)
                    .map_err(io::Error::other)?
                    .to_str()
                    .ok_or_else(|| io::Error::other("output path is not valid UTF-8"))?
                    .replace('\\', "/");

                if entry.file_type().is_dir() {
                    fs::create_dir_all(base.join(&relative))?;
                    cached.dirs.push(relative);
                } else {
                    fs::copy(entry.path(), base.join(&relative))?;
                    cached.files.push(CachedFile {
                        hash: Hash32::hash_file(entry.path())?,
                        path: relative,
                    });
                }
            }
        }
    }

    Ok(cached)
}

fn remove_path(path: &Utf8Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprinter;

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    fn outputs(root: &Utf8Path) -> Vec<OutputSpec> {
        vec![
            OutputSpec {
                path: root.join("work/app.bin"),
                kind: OutputKind::File,
            },
            OutputSpec {
                path: root.join("work/classes"),
                kind: OutputKind::Directory,
            },
        ]
    }

    fn produce(root: &Utf8Path) {
        fs::create_dir_all(root.join("work/classes/empty")).unwrap();
        fs::create_dir_all(root.join("work/classes/pkg")).unwrap();
        fs::write(root.join("work/app.bin"), "binary").unwrap();
        fs::write(root.join("work/classes/pkg/A.class"), "class A").unwrap();
    }

    #[test]
    fn test_store_then_restore() {
        let (_dir, root) = tempdir();
        let cache = LocalBuildCache::new(root.join("cache"));
        let outputs = outputs(&root);
        let key = Hash32::hash(b"key");

        produce(&root);
        let fingerprinter = Fingerprinter::default();
        let before = fingerprinter.fingerprint_outputs(&outputs).unwrap();
        cache.store(key, &outputs, &before).unwrap();

        fs::remove_dir_all(root.join("work")).unwrap();
        let restored = cache.load(key, &outputs).unwrap().unwrap();
        let after = fingerprinter.fingerprint_outputs(&outputs).unwrap();

        assert_eq!(restored.combined(), before.combined());
        assert_eq!(after.combined(), before.combined());
    }

    #[test]
    fn test_unknown_key_misses() {
        let (_dir, root) = tempdir();
        let cache = LocalBuildCache::new(root.join("cache"));
        assert!(cache.load(Hash32::hash(b"nope"), &outputs(&root)).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_entry_is_discarded() {
        let (_dir, root) = tempdir();
        let cache = LocalBuildCache::new(root.join("cache"));
        let outputs = outputs(&root);
        let key = Hash32::hash(b"key");

        produce(&root);
        let fingerprint = Fingerprinter::default().fingerprint_outputs(&outputs).unwrap();
        cache.store(key, &outputs, &fingerprint).unwrap();

        let stored = cache.entry(key).join("files/1/pkg/A.class");
        fs::write(&stored, "tampered").unwrap();

        assert!(matches!(cache.load(key, &outputs), Err(CacheError::Corrupt { .. })));
        assert!(!cache.entry(key).exists());
        assert_eq!(fs::read_to_string(root.join("work/classes/pkg/A.class")).unwrap(), "class A");
    }
}
