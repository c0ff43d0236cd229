//! Filesystem-backed block store.
//!
//! Blocks live under `objects/<first-2-hex>/<hash>`. Writes go to a
//! temporary sibling which is fsync'd and renamed into place, so a block
//! is either fully present or absent.

use crate::{BlockStore, ByteStream, StoreError, StoreResult};
use async_trait::async_trait;
use bytes::Bytes;
use courier_core::CidHash;
use futures::stream;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;

const READ_CHUNK: usize = 64 * 1024;

/// Block store rooted at a local directory.
pub struct FilesystemStore {
    objects_dir: PathBuf,
}

impl FilesystemStore {
    /// Open (creating if missing) a store rooted at `base`.
    pub async fn new(base: impl AsRef<Path>) -> StoreResult<Self> {
        let objects_dir = base.as_ref().join("objects");
        tokio::fs::create_dir_all(&objects_dir).await?;
        Ok(Self { objects_dir })
    }

    fn block_path(&self, hash: &CidHash) -> StoreResult<PathBuf> {
        let key = hash.as_str();
        if key.len() < 2 || !key.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.objects_dir.join(&key[..2]).join(key))
    }
}

#[async_trait]
impl BlockStore for FilesystemStore {
    async fn put(&self, hash: &CidHash, data: Bytes) -> StoreResult<()> {
        let path = self.block_path(hash)?;
        let parent = path.parent().expect("block path has a shard directory");
        tokio::fs::create_dir_all(parent).await?;

        let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
        let mut file = tokio::fs::File::create(&tmp).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, &data).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn get(&self, hash: &CidHash) -> StoreResult<Bytes> {
        let path = self.block_path(hash)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(hash.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_reader(&self, hash: &CidHash) -> StoreResult<(ByteStream, u64)> {
        let path = self.block_path(hash)?;
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(hash.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();

        let stream = stream::unfold(file, |mut file| async move {
            let mut buf = vec![0u8; READ_CHUNK];
            match file.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok(Bytes::from(buf)), file))
                }
                Err(e) => Some((Err(StoreError::Io(e)), file)),
            }
        });

        Ok((Box::pin(stream), size))
    }

    async fn has(&self, hash: &CidHash) -> StoreResult<bool> {
        Ok(tokio::fs::try_exists(self.block_path(hash)?).await?)
    }

    async fn delete(&self, hash: &CidHash) -> StoreResult<()> {
        let path = self.block_path(hash)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(hash.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn key_count(&self) -> StoreResult<u64> {
        Ok(self.iter_keys().await?.len() as u64)
    }

    async fn iter_keys(&self) -> StoreResult<Vec<CidHash>> {
        let mut keys = Vec::new();
        let mut shards = tokio::fs::read_dir(&self.objects_dir).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = tokio::fs::read_dir(shard.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                // skip in-progress temp files
                if name.contains('.') {
                    continue;
                }
                keys.push(CidHash::from_hex(name));
            }
        }
        Ok(keys)
    }

    async fn disk_usage(&self) -> StoreResult<u64> {
        let mut total = 0u64;
        let mut shards = tokio::fs::read_dir(&self.objects_dir).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = tokio::fs::read_dir(shard.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                total += entry.metadata().await?.len();
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use tempfile::tempdir;

    fn hash(s: &str) -> CidHash {
        CidHash::from_hex(s)
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let temp = tempdir().unwrap();
        let store = FilesystemStore::new(temp.path()).await.unwrap();

        let key = hash("ab12cd34");
        store.put(&key, Bytes::from_static(b"hello")).await.unwrap();

        assert!(store.has(&key).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(store.key_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let temp = tempdir().unwrap();
        let store = FilesystemStore::new(temp.path()).await.unwrap();

        let err = store.get(&hash("ab12")).await.unwrap_err();
        assert!(err.is_not_found());
        let err = store.delete(&hash("ab12")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_reader_streams_full_block_with_size() {
        let temp = tempdir().unwrap();
        let store = FilesystemStore::new(temp.path()).await.unwrap();

        let data = vec![7u8; 200_000];
        let key = hash("ffee0011");
        store.put(&key, Bytes::from(data.clone())).await.unwrap();

        let (stream, size) = store.get_reader(&key).await.unwrap();
        assert_eq!(size, data.len() as u64);
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        let joined: Vec<u8> = chunks.concat();
        assert_eq!(joined, data);
    }

    #[tokio::test]
    async fn test_iter_keys_no_duplicates() {
        let temp = tempdir().unwrap();
        let store = FilesystemStore::new(temp.path()).await.unwrap();

        for i in 0..20u32 {
            let key = hash(&format!("{i:08x}"));
            store.put(&key, Bytes::from_static(b"x")).await.unwrap();
        }

        let mut keys = store.iter_keys().await.unwrap();
        let before = keys.len();
        keys.dedup_by(|a, b| a == b);
        assert_eq!(before, 20);
        assert_eq!(keys.len(), 20);
    }

    #[tokio::test]
    async fn test_rejects_traversal_keys() {
        let temp = tempdir().unwrap();
        let store = FilesystemStore::new(temp.path()).await.unwrap();
        let err = store.get(&hash("../../etc/passwd")).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn test_overwrite_same_key_is_idempotent() {
        let temp = tempdir().unwrap();
        let store = FilesystemStore::new(temp.path()).await.unwrap();
        let key = hash("aa55");
        store.put(&key, Bytes::from_static(b"one")).await.unwrap();
        store.put(&key, Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), Bytes::from_static(b"two"));
        assert_eq!(store.key_count().await.unwrap(), 1);
    }
}
