//! Persistent CID <-> FID index.
//!
//! FIDs are the scheduler-assigned per-device ordinals naming local
//! blocks; both directions are kept as small files next to the block
//! store so the mapping survives restarts.

use crate::error::NodeResult;
use courier_core::CidHash;
use std::path::{Path, PathBuf};

pub struct CidFidIndex {
    fid_dir: PathBuf,
    cid_dir: PathBuf,
}

impl CidFidIndex {
    pub async fn new(base: impl AsRef<Path>) -> NodeResult<Self> {
        let fid_dir = base.as_ref().join("index").join("fid");
        let cid_dir = base.as_ref().join("index").join("cid");
        tokio::fs::create_dir_all(&fid_dir).await?;
        tokio::fs::create_dir_all(&cid_dir).await?;
        Ok(Self { fid_dir, cid_dir })
    }

    fn fid_path(&self, fid: i64) -> PathBuf {
        self.fid_dir.join(fid.to_string())
    }

    fn cid_path(&self, hash: &CidHash) -> PathBuf {
        let key = hash.as_str();
        self.cid_dir.join(&key[..2.min(key.len())]).join(key)
    }

    /// Bind a CID to a FID, replacing any previous binding of either side.
    pub async fn set(&self, cid: &str, hash: &CidHash, fid: i64) -> NodeResult<()> {
        if let Some(old_fid) = self.get_fid(hash).await?
            && old_fid != fid
        {
            let _ = tokio::fs::remove_file(self.fid_path(old_fid)).await;
        }

        let cid_path = self.cid_path(hash);
        if let Some(parent) = cid_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&cid_path, fid.to_string()).await?;
        tokio::fs::write(self.fid_path(fid), cid).await?;
        Ok(())
    }

    /// The CID stored under a FID, if any.
    pub async fn get_cid(&self, fid: i64) -> NodeResult<Option<String>> {
        match tokio::fs::read_to_string(self.fid_path(fid)).await {
            Ok(cid) => Ok(Some(cid)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// The FID a CID is stored under, if any.
    pub async fn get_fid(&self, hash: &CidHash) -> NodeResult<Option<i64>> {
        match tokio::fs::read_to_string(self.cid_path(hash)).await {
            Ok(fid) => Ok(fid.trim().parse().ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop the binding for a CID.
    pub async fn remove(&self, hash: &CidHash) -> NodeResult<()> {
        if let Some(fid) = self.get_fid(hash).await? {
            let _ = tokio::fs::remove_file(self.fid_path(fid)).await;
        }
        let _ = tokio::fs::remove_file(self.cid_path(hash)).await;
        Ok(())
    }

    /// Drop every binding.
    pub async fn clear(&self) -> NodeResult<()> {
        for dir in [&self.fid_dir, &self.cid_dir] {
            tokio::fs::remove_dir_all(dir).await?;
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn hash(s: &str) -> CidHash {
        CidHash::from_hex(s)
    }

    #[tokio::test]
    async fn test_set_get_round_trip() {
        let temp = tempdir().unwrap();
        let index = CidFidIndex::new(temp.path()).await.unwrap();

        index.set("bafyone", &hash("aa01"), 7).await.unwrap();
        assert_eq!(index.get_cid(7).await.unwrap().as_deref(), Some("bafyone"));
        assert_eq!(index.get_fid(&hash("aa01")).await.unwrap(), Some(7));
        assert_eq!(index.get_cid(8).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rebinding_fid_drops_stale_entry() {
        let temp = tempdir().unwrap();
        let index = CidFidIndex::new(temp.path()).await.unwrap();

        index.set("bafyone", &hash("aa01"), 7).await.unwrap();
        index.set("bafyone", &hash("aa01"), 9).await.unwrap();

        assert_eq!(index.get_fid(&hash("aa01")).await.unwrap(), Some(9));
        assert_eq!(index.get_cid(7).await.unwrap(), None);
        assert_eq!(index.get_cid(9).await.unwrap().as_deref(), Some("bafyone"));
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let temp = tempdir().unwrap();
        let index = CidFidIndex::new(temp.path()).await.unwrap();

        index.set("bafyone", &hash("aa01"), 1).await.unwrap();
        index.set("bafytwo", &hash("bb02"), 2).await.unwrap();

        index.remove(&hash("aa01")).await.unwrap();
        assert_eq!(index.get_fid(&hash("aa01")).await.unwrap(), None);
        assert_eq!(index.get_cid(1).await.unwrap(), None);

        index.clear().await.unwrap();
        assert_eq!(index.get_fid(&hash("bb02")).await.unwrap(), None);
    }
}
