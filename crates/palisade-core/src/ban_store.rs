use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

const BANNED_IPS_FILE: &str = "banned_ips.json";
const SPAMMERS_FILE: &str = "spammers.json";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanRecord {
    pub ip: String,
    pub timestamp: u64,
}

#[derive(Debug)]
pub enum BanStoreError {
    Io { path: PathBuf, source: std::io::Error },
    Corrupt { path: PathBuf, source: serde_json::Error },
}

impl std::fmt::Display for BanStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BanStoreError::Io { path, source } => {
                write!(f, "ban store I/O error at {}: {}", path.display(), source)
            }
            BanStoreError::Corrupt { path, source } => {
                write!(f, "ban store file {} is not valid JSON: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for BanStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BanStoreError::Io { source, .. } => Some(source),
            BanStoreError::Corrupt { source, .. } => Some(source),
        }
    }
}

/// Durable ban and spammer lists, stored as two JSON arrays under one directory.
///
/// A `BanStore` without a directory keeps nothing on disk.
pub struct BanStore {
    dir: Option<PathBuf>,
    /// Serializes read-modify-write cycles on the two files.
    write_lock: Mutex<()>,
}

impl BanStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            dir: None,
            write_lock: Mutex::new(()),
        }
    }

    fn path(&self, name: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(name))
    }

    pub fn load_bans(&self) -> Result<Vec<BanRecord>, BanStoreError> {
        match self.path(BANNED_IPS_FILE) {
            Some(path) => read_array(&path),
            None => Ok(Vec::new()),
        }
    }

    pub fn load_spammers(&self) -> Result<Vec<String>, BanStoreError> {
        match self.path(SPAMMERS_FILE) {
            Some(path) => Ok(read_array::<String>(&path)?
                .into_iter()
                .map(|a| a.to_lowercase())
                .collect()),
            None => Ok(Vec::new()),
        }
    }

    /// Append a ban, replacing an earlier record for the same IP. Returns whether the
    /// file changed.
    pub fn append_ban(&self, record: &BanRecord) -> Result<bool, BanStoreError> {
        let Some(path) = self.path(BANNED_IPS_FILE) else {
            return Ok(false);
        };
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut records: Vec<BanRecord> = read_array(&path)?;
        if records.iter().any(|r| r == record) {
            return Ok(false);
        }
        records.retain(|r| r.ip != record.ip);
        records.push(record.clone());
        write_array(&path, &records)?;
        Ok(true)
    }

    pub fn append_spammer(&self, address: &str) -> Result<bool, BanStoreError> {
        let Some(path) = self.path(SPAMMERS_FILE) else {
            return Ok(false);
        };
        let address = address.to_lowercase();
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut spammers: Vec<String> = read_array(&path)?;
        if spammers.iter().any(|s| s.eq_ignore_ascii_case(&address)) {
            return Ok(false);
        }
        spammers.push(address);
        write_array(&path, &spammers)?;
        Ok(true)
    }
}

fn read_array<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, BanStoreError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(BanStoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    serde_json::from_slice(&bytes).map_err(|source| BanStoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

fn write_array<T: Serialize>(path: &Path, items: &[T]) -> Result<(), BanStoreError> {
    let io_err = |source| BanStoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let body = serde_json::to_vec_pretty(items).map_err(|source| BanStoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    // Write-then-rename so a crash never leaves a half-written list behind.
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, body).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_load_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = BanStore::new(dir.path());
        assert!(store.load_bans().unwrap().is_empty());
        assert!(store.load_spammers().unwrap().is_empty());
    }

    #[test]
    fn ban_append_dedupes_by_ip() {
        let dir = tempfile::tempdir().unwrap();
        let store = BanStore::new(dir.path());
        let first = BanRecord {
            ip: "1.2.3.4".to_string(),
            timestamp: 10,
        };
        assert!(store.append_ban(&first).unwrap());
        assert!(!store.append_ban(&first).unwrap());

        let renewed = BanRecord {
            ip: "1.2.3.4".to_string(),
            timestamp: 20,
        };
        assert!(store.append_ban(&renewed).unwrap());
        assert_eq!(store.load_bans().unwrap(), vec![renewed]);

        let raw = std::fs::read_to_string(dir.path().join(BANNED_IPS_FILE)).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed[0]["ip"], "1.2.3.4");
    }

    #[test]
    fn spammers_are_lowercased_and_deduped() {
        let dir = tempfile::tempdir().unwrap();
        let store = BanStore::new(dir.path());
        assert!(store.append_spammer("0xABCDEF").unwrap());
        assert!(!store.append_spammer("0xabcdef").unwrap());
        assert_eq!(store.load_spammers().unwrap(), vec!["0xabcdef".to_string()]);
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SPAMMERS_FILE), "{not json").unwrap();
        let store = BanStore::new(dir.path());
        assert!(matches!(
            store.load_spammers(),
            Err(BanStoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn in_memory_store_never_touches_disk() {
        let store = BanStore::in_memory();
        let record = BanRecord {
            ip: "9.9.9.9".to_string(),
            timestamp: 1,
        };
        assert!(!store.append_ban(&record).unwrap());
        assert!(store.load_bans().unwrap().is_empty());
    }
}
