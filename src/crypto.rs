/// Streaming encryption for file payloads.
///
/// Files travel between nodes as AES-256-CTR ciphertext with a random
/// 16-byte IV prepended, so every replica can decrypt independently with
/// the shared cluster key. Encryption and decryption are streaming: the
/// payload is processed in 32 KiB chunks and never has to fit in memory
/// as a whole on the storage side.
use aes::cipher::{KeyIvInit, StreamCipher};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::MeshResult;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Cluster encryption keys are exactly 32 bytes (AES-256).
pub const KEY_SIZE: usize = 32;
/// The IV prefix on every encrypted stream.
pub const IV_SIZE: usize = 16;

/// Working buffer for the streaming cipher loops.
const COPY_BUF_SIZE: usize = 32 * 1024;

/// Generate a fresh random cluster encryption key.
pub fn new_encryption_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    key
}

/// Generate a random node identifier. Hex-encode it before using it as a
/// path component or putting it in a message.
pub fn generate_id() -> [u8; 32] {
    let mut id = [0u8; 32];
    OsRng.fill_bytes(&mut id);
    id
}

/// Encrypt `src` to `dst` under `key`.
///
/// Writes a random 16-byte IV first, then the CTR ciphertext. Returns the
/// total number of bytes written to `dst` (IV included), which is the
/// on-the-wire size a receiver has to drain.
pub async fn copy_encrypt<R, W>(key: &[u8; KEY_SIZE], src: &mut R, dst: &mut W) -> MeshResult<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);
    dst.write_all(&iv).await?;

    let mut cipher = Aes256Ctr::new(key.into(), (&iv).into());
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut written = IV_SIZE as u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n]).await?;
        written += n as u64;
    }
    Ok(written)
}

/// Decrypt a stream produced by [`copy_encrypt`].
///
/// Reads the 16-byte IV off the front of `src`, then stream-decrypts the
/// remainder into `dst`. The returned count includes 16 accounting bytes
/// for the IV so that encrypt and decrypt report the same total for one
/// payload.
pub async fn copy_decrypt<R, W>(key: &[u8; KEY_SIZE], src: &mut R, dst: &mut W) -> MeshResult<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut iv = [0u8; IV_SIZE];
    src.read_exact(&mut iv).await?;

    let mut cipher = Aes256Ctr::new(key.into(), (&iv).into());
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut written = IV_SIZE as u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n]).await?;
        written += n as u64;
    }
    Ok(written)
}
