//! Persisted execution history of work items.
//!
//! Every successful execution leaves a [`FingerprintRecord`] behind. The next
//! build compares it against the current state of the file system to decide
//! whether the work item has to run again.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::{Hash32, Identity};
use crate::error::StoreError;
use crate::fingerprint::Fingerprint;

const MAGIC: &[u8; 4] = b"KSNF";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 8;

/// State of a work item at its last successful execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub action_identity: Hash32,
    pub inputs: Fingerprint,
    pub outputs: Fingerprint,
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    identity: &'a Identity,
    record: &'a FingerprintRecord,
}

#[derive(Deserialize)]
struct Envelope {
    identity: Identity,
    record: FingerprintRecord,
}

/// Why a work item cannot be skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationReason {
    NoHistory,
    ActionChanged,
    InputsChanged(Vec<String>),
    OutputsChanged(Vec<String>),
}

impl fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidationReason::NoHistory => f.write_str("no history is available"),
            InvalidationReason::ActionChanged => {
                f.write_str("the action implementation has changed")
            }
            InvalidationReason::InputsChanged(keys) => {
                write!(f, "inputs have changed: {}", keys.join(", "))
            }
            InvalidationReason::OutputsChanged(keys) => {
                write!(f, "outputs have changed: {}", keys.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    UpToDate,
    Stale(InvalidationReason),
}

impl Verdict {
    pub fn is_up_to_date(&self) -> bool {
        matches!(self, Verdict::UpToDate)
    }
}

/// Decides whether a work item is up to date given its last record.
///
/// The item is up to date when a record exists, the action identity is the
/// same, the input fingerprint is the same and the outputs on disk still
/// match what was recorded.
pub fn decide(
    previous: Option<&FingerprintRecord>,
    action_identity: Hash32,
    inputs: &Fingerprint,
    outputs: &Fingerprint,
) -> Verdict {
    let Some(previous) = previous else {
        return Verdict::Stale(InvalidationReason::NoHistory);
    };

    if previous.action_identity != action_identity {
        return Verdict::Stale(InvalidationReason::ActionChanged);
    }

    if previous.inputs.combined() != inputs.combined() {
        let keys = previous.inputs.diff(inputs).keys();
        return Verdict::Stale(InvalidationReason::InputsChanged(keys));
    }

    if previous.outputs.combined() != outputs.combined() {
        let keys = previous.outputs.diff(outputs).keys();
        return Verdict::Stale(InvalidationReason::OutputsChanged(keys));
    }

    Verdict::UpToDate
}

/// Holds an advisory lock on a record until dropped.
struct RecordLock(File);

impl RecordLock {
    fn shared(path: &Utf8Path) -> io::Result<Self> {
        let file = open_lock_file(path)?;
        file.lock_shared()?;
        Ok(Self(file))
    }

    fn exclusive(path: &Utf8Path) -> io::Result<Self> {
        let file = open_lock_file(path)?;
        file.lock_exclusive()?;
        Ok(Self(file))
    }
}

impl Drop for RecordLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

fn open_lock_file(path: &Utf8Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

/// On-disk store of [`FingerprintRecord`]s, one file per work item.
///
/// Records live under `<cache_dir>/fingerprints/<blake3(identity)>.bin`. Each
/// record has a sibling `.lock` file guarding it, so that only a single writer
/// touches a record at any time.
#[derive(Debug, Clone)]
pub struct FingerprintStore {
    dir: Utf8PathBuf,
}

impl FingerprintStore {
    pub fn new(cache_dir: impl AsRef<Utf8Path>) -> Self {
        Self {
            dir: cache_dir.as_ref().join("fingerprints"),
        }
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    fn paths(&self, identity: &Identity) -> (Utf8PathBuf, Utf8PathBuf) {
        let name = Hash32::hash(identity.as_str()).to_hex();
        (
            self.dir.join(format!("{name}.bin")),
            self.dir.join(format!("{name}.lock")),
        )
    }

    /// Loads the record of `identity`, if there is one.
    pub fn try_load(&self, identity: &Identity) -> Result<Option<FingerprintRecord>, StoreError> {
        let (record, lock) = self.paths(identity);
        if !record.exists() {
            return Ok(None);
        }

        let bytes = {
            let _lock = RecordLock::shared(&lock)?;
            match fs::read(&record) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        };

        if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
            return Err(StoreError::BadMagic);
        }

        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[4..HEADER_LEN]);
        let version = u32::from_le_bytes(version);
        if version != VERSION {
            return Err(StoreError::Version {
                found: version,
                expected: VERSION,
            });
        }

        let envelope: Envelope = ciborium::from_reader(&bytes[HEADER_LEN..])?;
        if &envelope.identity != identity {
            return Err(StoreError::IdentityMismatch {
                found: envelope.identity,
                expected: identity.clone(),
            });
        }

        Ok(Some(envelope.record))
    }

    /// Loads the record of `identity`. Any problem reading it is logged and
    /// treated as if there was no record at all.
    pub fn load(&self, identity: &Identity) -> Option<FingerprintRecord> {
        match self.try_load(identity) {
            Ok(record) => record,
            Err(e) => {
                warn!(item = %identity, "ignoring unreadable fingerprint record: {e}");
                None
            }
        }
    }

    /// Atomically replaces the record of `identity`.
    pub fn save(&self, identity: &Identity, record: &FingerprintRecord) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        let (path, lock) = self.paths(identity);
        let _lock = RecordLock::exclusive(&lock)?;

        let mut temp = tempfile::NamedTempFile::new_in(&self.dir)?;
        temp.write_all(MAGIC)?;
        temp.write_all(&VERSION.to_le_bytes())?;
        ciborium::into_writer(&EnvelopeRef { identity, record }, &mut temp)?;
        temp.as_file().sync_all()?;
        temp.persist(&path)?;

        Ok(())
    }

    /// Removes the record of `identity`, the next check will report no
    /// history.
    pub fn invalidate(&self, identity: &Identity) -> Result<(), StoreError> {
        let (path, lock) = self.paths(identity);
        if !path.exists() {
            return Ok(());
        }

        let _lock = RecordLock::exclusive(&lock)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn check(
        &self,
        identity: &Identity,
        inputs: &Fingerprint,
        action_identity: Hash32,
        outputs: &Fingerprint,
    ) -> Verdict {
        let previous = self.load(identity);
        decide(previous.as_ref(), action_identity, inputs, outputs)
    }

    pub fn is_up_to_date(
        &self,
        identity: &Identity,
        inputs: &Fingerprint,
        action_identity: Hash32,
        outputs: &Fingerprint,
    ) -> bool {
        self.check(identity, inputs, action_identity, outputs)
            .is_up_to_date()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{EntryFingerprint, HashStrategy};

    fn fingerprint(pairs: &[(&str, &str)]) -> Fingerprint {
        let entries = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), EntryFingerprint::regular(Hash32::hash(v))))
            .collect();
        Fingerprint::from_entries(entries, HashStrategy::Sort)
    }

    fn record() -> FingerprintRecord {
        FingerprintRecord {
            action_identity: Hash32::hash(b"action"),
            inputs: fingerprint(&[("main.c", "int main")]),
            outputs: fingerprint(&[("/out/main.o", "obj")]),
        }
    }

    fn store() -> (tempfile::TempDir, FingerprintStore) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, FingerprintStore::new(root))
    }

    #[test]
    fn test_save_then_load() {
        let (_dir, store) = store();
        let id = Identity::from("compile");

        assert_eq!(store.try_load(&id).unwrap(), None);
        store.save(&id, &record()).unwrap();
        assert_eq!(store.try_load(&id).unwrap(), Some(record()));
    }

    #[test]
    fn test_invalidate_removes_record() {
        let (_dir, store) = store();
        let id = Identity::from("compile");

        store.save(&id, &record()).unwrap();
        store.invalidate(&id).unwrap();
        assert_eq!(store.load(&id), None);
        store.invalidate(&id).unwrap();
    }

    #[test]
    fn test_corrupt_record_fails_open() {
        let (_dir, store) = store();
        let id = Identity::from("compile");
        store.save(&id, &record()).unwrap();

        let (path, _) = store.paths(&id);
        fs::write(&path, b"garbage").unwrap();
        assert!(matches!(store.try_load(&id), Err(StoreError::BadMagic)));
        assert_eq!(store.load(&id), None);

        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&99u32.to_le_bytes());
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            store.try_load(&id),
            Err(StoreError::Version { found: 99, expected: VERSION })
        ));

        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&VERSION.to_le_bytes());
        bytes.extend_from_slice(&[0xff, 0x00, 0x13]);
        fs::write(&path, &bytes).unwrap();
        assert!(store.try_load(&id).is_err());
        assert_eq!(store.load(&id), None);
    }

    #[test]
    fn test_identity_mismatch_rejected() {
        let (_dir, store) = store();
        let a = Identity::from("a");
        let b = Identity::from("b");
        store.save(&a, &record()).unwrap();

        let (from, _) = store.paths(&a);
        let (to, _) = store.paths(&b);
        fs::copy(from, to).unwrap();

        assert!(matches!(
            store.try_load(&b),
            Err(StoreError::IdentityMismatch { .. })
        ));
    }

    #[test]
    fn test_decide_reasons() {
        let r = record();
        let action = r.action_identity;

        assert_eq!(
            decide(None, action, &r.inputs, &r.outputs),
            Verdict::Stale(InvalidationReason::NoHistory)
        );
        assert_eq!(decide(Some(&r), action, &r.inputs, &r.outputs), Verdict::UpToDate);
        assert_eq!(
            decide(Some(&r), Hash32::hash(b"other"), &r.inputs, &r.outputs),
            Verdict::Stale(InvalidationReason::ActionChanged)
        );
        assert_eq!(
            decide(Some(&r), action, &fingerprint(&[("main.c", "changed")]), &r.outputs),
            Verdict::Stale(InvalidationReason::InputsChanged(vec!["main.c".into()]))
        );
        assert_eq!(
            decide(Some(&r), action, &r.inputs, &fingerprint(&[])),
            Verdict::Stale(InvalidationReason::OutputsChanged(vec!["/out/main.o".into()]))
        );
    }

    #[test]
    fn test_check_uses_saved_record() {
        let (_dir, store) = store();
        let id = Identity::from("compile");
        let r = record();

        assert!(!store.is_up_to_date(&id, &r.inputs, r.action_identity, &r.outputs));
        store.save(&id, &r).unwrap();
        assert!(store.is_up_to_date(&id, &r.inputs, r.action_identity, &r.outputs));
    }
}
