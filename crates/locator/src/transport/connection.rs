// Encrypted point-to-point link: handshake, framing and AES-256-GCM frames

use crate::{LocatorError, PeerIdentity, Result};
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::debug;
use x25519_dalek::{EphemeralSecret, PublicKey};

/// Version of the link handshake
pub const LINK_VERSION: u8 = 1;

/// Largest frame accepted on the wire
pub const MAX_FRAME_LEN: usize = 64 * 1024;

const NONCE_LEN: usize = 12;
const KEY_LABEL: &[u8] = b"airtag-locate link v1";

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// What each side announces before keys are derived
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Hello {
    version: u8,
    name: String,
    instance: String,
    public_key: String,
}

/// Identity of the remote end, as announced in its hello
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHello {
    pub peer: PeerIdentity,
    pub instance_id: String,
}

/// Receiving half of an established link
pub struct LinkReader<S> {
    half: ReadHalf<S>,
    cipher: Aes256Gcm,
}

/// Sending half of an established link
pub struct LinkWriter<S> {
    half: WriteHalf<S>,
    cipher: Aes256Gcm,
}

/// Run the handshake over `stream` and split it into encrypted halves
pub async fn establish<S>(
    stream: S,
    role: Role,
    local: &PeerIdentity,
    instance_id: &str,
) -> Result<(RemoteHello, LinkReader<S>, LinkWriter<S>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = split(stream);

    let secret = EphemeralSecret::random_from_rng(&mut OsRng);
    let public = PublicKey::from(&secret);

    let hello = Hello {
        version: LINK_VERSION,
        name: local.display_name().to_string(),
        instance: instance_id.to_string(),
        public_key: bs58::encode(public.as_bytes()).into_string(),
    };
    write_frame(&mut writer, &serde_json::to_vec(&hello)?).await?;

    let remote: Hello = serde_json::from_slice(&read_frame(&mut reader).await?)
        .map_err(|e| LocatorError::ConnectionFailed(format!("Malformed hello: {}", e)))?;

    if remote.version != LINK_VERSION {
        return Err(LocatorError::ProtocolVersion {
            expected: LINK_VERSION,
            found: remote.version,
        });
    }

    let remote_key: [u8; 32] = bs58::decode(&remote.public_key)
        .into_vec()
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| LocatorError::Encryption("Invalid peer public key".to_string()))?;
    let remote_public = PublicKey::from(remote_key);

    let shared = secret.diffie_hellman(&remote_public);
    if !shared.was_contributory() {
        return Err(LocatorError::Encryption("Non-contributory key exchange".to_string()));
    }

    let (initiator_key, responder_key) = match role {
        Role::Initiator => (public.as_bytes(), remote_public.as_bytes()),
        Role::Responder => (remote_public.as_bytes(), public.as_bytes()),
    };
    let to_responder = derive_key(shared.as_bytes(), initiator_key, responder_key, b"i2r");
    let to_initiator = derive_key(shared.as_bytes(), initiator_key, responder_key, b"r2i");

    let (send_key, recv_key) = match role {
        Role::Initiator => (to_responder, to_initiator),
        Role::Responder => (to_initiator, to_responder),
    };

    let remote_hello = RemoteHello {
        peer: PeerIdentity::new(remote.name),
        instance_id: remote.instance,
    };
    debug!(peer = %remote_hello.peer, ?role, "Link handshake complete");

    Ok((
        remote_hello,
        LinkReader {
            half: reader,
            cipher: Aes256Gcm::new((&recv_key).into()),
        },
        LinkWriter {
            half: writer,
            cipher: Aes256Gcm::new((&send_key).into()),
        },
    ))
}

fn derive_key(shared: &[u8; 32], initiator: &[u8; 32], responder: &[u8; 32], direction: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(KEY_LABEL);
    hasher.update(shared);
    hasher.update(initiator);
    hasher.update(responder);
    hasher.update(direction);
    hasher.finalize().into()
}

impl<S: AsyncRead> LinkReader<S> {
    /// Next decrypted payload, `None` once the peer closed the link
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        let frame = match read_frame(&mut self.half).await {
            Ok(frame) => frame,
            Err(LocatorError::NetworkError(_)) | Err(LocatorError::ConnectionTimeout(_)) => {
                return Ok(None)
            }
            Err(e) => return Err(e),
        };

        if frame.len() < NONCE_LEN {
            return Err(LocatorError::Encryption("Truncated frame".to_string()));
        }

        let (nonce_bytes, ciphertext) = frame.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| LocatorError::Encryption(format!("Decryption failed: {}", e)))?;

        Ok(Some(plaintext))
    }
}

impl<S: AsyncWrite> LinkWriter<S> {
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), payload)
            .map_err(|e| LocatorError::Encryption(format!("Encryption failed: {}", e)))?;

        let mut frame = nonce_bytes.to_vec();
        frame.extend_from_slice(&ciphertext);
        write_frame(&mut self.half, &frame).await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.half.shutdown().await?;
        Ok(())
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<()> {
    if body.len() > MAX_FRAME_LEN {
        return Err(LocatorError::ConnectionFailed(format!(
            "Frame of {} bytes exceeds limit",
            body.len()
        )));
    }

    writer.write_u32(body.len() as u32).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(LocatorError::ConnectionFailed(format!(
            "Peer announced a {} byte frame",
            len
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}
