//! Directory-backed [Store] implementation.
//!
//! Each key is one file under the store directory. Writes go to a temporary
//! file first and are renamed into place, so a reader never observes a torn
//! value.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use log::trace;
use tokio::{fs, io::AsyncWriteExt};

use crate::{store::Store, Error, Result};

const TEMP_SUFFIX: &str = ".tmp";

/// [Store] keeping one file per key in a directory.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open a store rooted at `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if root.as_os_str().is_empty() {
            return Err(Error::invalid("root", "store directory must not be empty"));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !valid || key.ends_with(TEMP_SUFFIX) {
            return Err(Error::invalid("key", format!("{key:?} is not a valid store key")));
        }
        Ok(self.root.join(key))
    }

    async fn write_atomic(&self, path: &Path, value: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        let mut temp = path.as_os_str().to_owned();
        temp.push(TEMP_SUFFIX);
        fs::write(&temp, value).await?;
        fs::rename(&temp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for FileStore {
    async fn add(&self, key: &str, value: Bytes) -> Result<()> {
        let path = self.path_of(key)?;
        fs::create_dir_all(&self.root).await?;
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::KeyExists(key.to_owned()))
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(&value).await?;
        file.flush().await?;
        Ok(())
    }

    async fn add_or_update(&self, key: &str, value: Bytes) -> Result<()> {
        let path = self.path_of(key)?;
        trace!("write {} ({} bytes)", path.display(), value.len());
        self.write_atomic(&path, &value).await
    }

    async fn read(&self, key: &str) -> Result<Option<Bytes>> {
        match fs::read(self.path_of(key)?).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_of(key)?).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        Ok(fs::try_exists(self.path_of(key)?).await?)
    }

    async fn clear(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn get_all_keys(&self) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if !name.ends_with(TEMP_SUFFIX) {
                    keys.push(name.to_owned());
                }
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    #[tokio::test]
    async fn test_read_write() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path().join("feed")).unwrap();

        assert_eq!(store.read("0").await.unwrap(), None);
        assert!(!store.contains("0").await.unwrap());
        assert!(store.get_all_keys().await.unwrap().is_empty());

        store.add_or_update("0", Bytes::from("page zero")).await.unwrap();
        store.add_or_update("0", Bytes::from("page 0")).await.unwrap();
        assert_eq!(store.read("0").await.unwrap(), Some(Bytes::from("page 0")));
        assert!(store.contains("0").await.unwrap());

        store.remove("0").await.unwrap();
        store.remove("0").await.unwrap();
        assert!(!store.contains("0").await.unwrap());
    }

    #[tokio::test]
    async fn test_add_and_clear() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path().join("feed")).unwrap();

        store.add("10", Bytes::from("a")).await.unwrap();
        let err = store.add("10", Bytes::from("b")).await.unwrap_err();
        assert!(matches!(err, Error::KeyExists(_)));
        store.add_or_update("__settings", Bytes::from("{}")).await.unwrap();

        let mut keys = store.get_all_keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["10", "__settings"]);

        store.clear().await.unwrap();
        assert!(store.get_all_keys().await.unwrap().is_empty());
        // clearing an already missing directory succeeds
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_path_like_keys() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        for key in ["", "../escape", "a/b", ".hidden", "x.tmp"] {
            let err = store.add_or_update(key, Bytes::new()).await.unwrap_err();
            assert!(matches!(err, Error::InvalidArgument { name: "key", .. }), "{key}");
        }
    }
}
