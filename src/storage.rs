/// Content-addressed disk storage.
///
/// Every stored file lives under `{root}/{owner-id}/{dir}/{filename}`
/// where `dir` and `filename` come from the path transform. The default
/// transform hashes the user key with SHA-1 and splits the 40-character
/// hex digest into five 8-character directory segments, which bounds the
/// fan-out of any single directory. The owner id namespaces the tree so
/// several logical nodes can share one filesystem root.
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::debug;

use crate::crypto::{self, KEY_SIZE};
use crate::error::MeshResult;

/// Default storage root when none is configured.
pub const DEFAULT_ROOT: &str = "../NetworkFiles";

/// Width of one directory segment in the sharded layout.
const SEGMENT_LEN: usize = 8;

/// The on-disk location derived from a user key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathKey {
    /// Directory part, segments joined by `/`.
    pub dir: String,
    /// File name inside `dir`.
    pub filename: String,
}

impl PathKey {
    /// Path of the file relative to the owner directory.
    pub fn full_path(&self) -> String {
        format!("{}/{}", self.dir, self.filename)
    }
}

/// Maps a user key to its on-disk location.
pub type PathTransformFn = fn(&str) -> PathKey;

/// Content-addressed transform: SHA-1 digest, sharded into 8-char segments.
pub fn cas_path_transform(key: &str) -> PathKey {
    let hash = hex::encode(Sha1::digest(key.as_bytes()));
    let dir = (0..hash.len())
        .step_by(SEGMENT_LEN)
        .map(|i| &hash[i..i + SEGMENT_LEN])
        .collect::<Vec<_>>()
        .join("/");
    PathKey {
        dir,
        filename: hash,
    }
}

/// Identity transform; keeps the key as the path. Useful in tests.
pub fn default_path_transform(key: &str) -> PathKey {
    PathKey {
        dir: key.to_owned(),
        filename: key.to_owned(),
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Filesystem root the node stores under.
    pub root: PathBuf,
    /// Key-to-path derivation.
    pub path_transform: PathTransformFn,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            path_transform: cas_path_transform,
        }
    }
}

/// Streaming file store. All state lives on the filesystem; there is no
/// in-memory index.
#[derive(Debug, Clone)]
pub struct Storage {
    config: StorageConfig,
}

impl Storage {
    pub fn new(config: StorageConfig) -> Self {
        Self { config }
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    fn dir_path(&self, id: &str, key: &str) -> PathBuf {
        let pk = (self.config.path_transform)(key);
        self.config.root.join(id).join(pk.dir)
    }

    fn file_path(&self, id: &str, key: &str) -> PathBuf {
        let pk = (self.config.path_transform)(key);
        self.config.root.join(id).join(pk.full_path())
    }

    /// True iff the sharded directory for `key` exists under `id`.
    pub async fn has(&self, id: &str, key: &str) -> bool {
        fs::metadata(self.dir_path(id, key)).await.is_ok()
    }

    /// Stream `reader` to disk under `id`/`key`. Returns the number of
    /// bytes copied.
    pub async fn write<R>(&self, id: &str, key: &str, mut reader: R) -> MeshResult<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut file = self.create_file(id, key).await?;
        let n = tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        debug!(bytes = n, path = %self.file_path(id, key).display(), "wrote file to disk");
        Ok(n)
    }

    /// Stream an IV-prefixed ciphertext from `reader` to disk as
    /// plaintext. Used to persist a stream fetched from a peer. The
    /// returned count follows the [`crypto::copy_decrypt`] accounting.
    pub async fn write_decrypt<R>(
        &self,
        enc_key: &[u8; KEY_SIZE],
        id: &str,
        key: &str,
        mut reader: R,
    ) -> MeshResult<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut file = self.create_file(id, key).await?;
        let n = crypto::copy_decrypt(enc_key, &mut reader, &mut file).await?;
        file.flush().await?;
        debug!(bytes = n, path = %self.file_path(id, key).display(), "decrypted stream to disk");
        Ok(n)
    }

    /// Open `key` for reading. Returns the file size and an owning handle.
    /// A missing file surfaces the OS error.
    pub async fn read(&self, id: &str, key: &str) -> MeshResult<(u64, fs::File)> {
        let path = self.file_path(id, key);
        let size = fs::metadata(&path).await?.len();
        let file = fs::File::open(&path).await?;
        Ok((size, file))
    }

    /// Remove the sharded directory for `key`. Parent directories are left
    /// alone so sibling keys sharing a hash prefix are untouched. Deleting
    /// a key that was never stored is a success.
    pub async fn delete(&self, id: &str, key: &str) -> MeshResult<()> {
        let dir = self.dir_path(id, key);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(path = %dir.display(), "deleted from disk");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Remove the entire storage root.
    pub async fn clear(&self) -> MeshResult<()> {
        match fs::remove_dir_all(&self.config.root).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn create_file(&self, id: &str, key: &str) -> MeshResult<fs::File> {
        fs::create_dir_all(self.dir_path(id, key)).await?;
        Ok(fs::File::create(self.file_path(id, key)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_storage() -> (TempDir, Storage) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(StorageConfig {
            root: dir.path().to_path_buf(),
            path_transform: cas_path_transform,
        });
        (dir, storage)
    }

    #[test]
    fn cas_transform_shards_the_digest() {
        let pk = cas_path_transform("SydneyHoliday");
        assert_eq!(pk.dir, "9f439c1a/a7f3f395/3942e163/05978bbc/bb32dde8");
        assert_eq!(pk.filename, "9f439c1aa7f3f3953942e16305978bbcbb32dde8");
        assert_eq!(pk.filename, pk.dir.replace('/', ""));
        assert_eq!(pk.dir.split('/').count(), 5);
        assert!(pk.dir.split('/').all(|seg| seg.len() == 8));
    }

    #[test]
    fn cas_transform_is_deterministic() {
        assert_eq!(cas_path_transform("a"), cas_path_transform("a"));
        assert_ne!(cas_path_transform("a"), cas_path_transform("b"));
    }

    #[tokio::test]
    async fn write_then_read_returns_the_bytes() {
        let (_dir, storage) = temp_storage();
        let n = storage
            .write("node", "somekey", b"some jpg bytes".as_slice())
            .await
            .unwrap();
        assert_eq!(n, 14);
        assert!(storage.has("node", "somekey").await);

        let (size, mut file) = storage.read("node", "somekey").await.unwrap();
        assert_eq!(size, 14);
        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut file, &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"some jpg bytes");
    }

    #[tokio::test]
    async fn empty_file_round_trips() {
        let (_dir, storage) = temp_storage();
        let n = storage.write("node", "empty", b"".as_slice()).await.unwrap();
        assert_eq!(n, 0);
        assert!(storage.has("node", "empty").await);
        let (size, _file) = storage.read("node", "empty").await.unwrap();
        assert_eq!(size, 0);
    }

    #[tokio::test]
    async fn delete_removes_only_this_key() {
        let (_dir, storage) = temp_storage();
        storage.write("node", "first", b"1".as_slice()).await.unwrap();
        storage.write("node", "second", b"2".as_slice()).await.unwrap();

        storage.delete("node", "first").await.unwrap();
        assert!(!storage.has("node", "first").await);
        assert!(storage.has("node", "second").await);
    }

    #[tokio::test]
    async fn delete_of_missing_key_is_ok() {
        let (_dir, storage) = temp_storage();
        storage.delete("node", "never-stored").await.unwrap();
    }

    #[tokio::test]
    async fn write_decrypt_pairs_with_copy_encrypt() {
        let (_dir, storage) = temp_storage();
        let enc_key = crypto::new_encryption_key();
        let payload = b"ciphertext over the wire";

        let mut ciphertext = Vec::new();
        crypto::copy_encrypt(&enc_key, &mut payload.as_slice(), &mut ciphertext)
            .await
            .unwrap();

        let n = storage
            .write_decrypt(&enc_key, "node", "fetched", ciphertext.as_slice())
            .await
            .unwrap();
        assert_eq!(n as usize, payload.len() + crypto::IV_SIZE);

        let (size, mut file) = storage.read("node", "fetched").await.unwrap();
        assert_eq!(size as usize, payload.len());
        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut file, &mut out)
            .await
            .unwrap();
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn identity_transform_keeps_the_key_as_path() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(StorageConfig {
            root: dir.path().to_path_buf(),
            path_transform: default_path_transform,
        });

        storage
            .write("node", "plainname", b"v".as_slice())
            .await
            .unwrap();
        assert!(dir.path().join("node/plainname/plainname").is_file());
    }

    #[tokio::test]
    async fn clear_removes_the_whole_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("store");
        let storage = Storage::new(StorageConfig {
            root: root.clone(),
            path_transform: cas_path_transform,
        });

        storage.write("node", "a", b"1".as_slice()).await.unwrap();
        storage.write("node", "b", b"2".as_slice()).await.unwrap();
        storage.clear().await.unwrap();
        assert!(!storage.root().exists());

        // Clearing an already-missing root is fine.
        storage.clear().await.unwrap();
    }

    #[tokio::test]
    async fn owner_ids_namespace_the_root() {
        let (_dir, storage) = temp_storage();
        storage.write("alpha", "shared", b"a".as_slice()).await.unwrap();
        assert!(storage.has("alpha", "shared").await);
        assert!(!storage.has("beta", "shared").await);
    }
}
