//! Long-term endpoint identity.
//!
//! An identity is an ML-DSA-87 keypair plus an Ed25519 keypair. The 32-byte
//! endpoint id is the SHA-256 digest of the ML-DSA-87 public key and is
//! stable for the lifetime of the key material.
//!
//! On disk the identity is two files under the configured keys directory:
//! the private key blob (owner-read-only) and a text file with the
//! hex-encoded endpoint id. Corruption or a size mismatch on load refuses to
//! start; regeneration requires deleting both files.

use std::fs;
use std::path::{Path, PathBuf};

use rand_core::OsRng;
use tracing::{info, warn};
use veilnet_crypto::pq_sign::{PqKeyPair, PqVerifyingKey};
use veilnet_crypto::sign::{EdSigningKey, EdVerifyingKey};
use veilnet_crypto::{PQ_PUBLIC_KEY_SIZE, PQ_SECRET_KEY_SIZE};

use crate::error::IdentityError;
use crate::EndpointId;

/// Serialized private key blob: PQ secret || PQ public || Ed25519 seed
const KEY_FILE_SIZE: usize = PQ_SECRET_KEY_SIZE + PQ_PUBLIC_KEY_SIZE + 32;

/// A long-term endpoint identity
pub struct Identity {
    pq: PqKeyPair,
    ed: EdSigningKey,
    endpoint_id: EndpointId,
}

impl Identity {
    /// Generate a fresh identity without touching the filesystem
    #[must_use]
    pub fn generate() -> Self {
        let pq = PqKeyPair::generate();
        let ed = EdSigningKey::generate(&mut OsRng);
        let endpoint_id = pq.verifying_key().endpoint_id();

        Self {
            pq,
            ed,
            endpoint_id,
        }
    }

    /// Load the identity from `keys_dir`, generating and persisting it if
    /// the private key file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::InvalidIdentity`] if existing key material
    /// is corrupt, truncated, or inconsistent with the stored endpoint id.
    pub fn load_or_generate(
        keys_dir: &Path,
        private_key_file: &str,
        endpoint_id_file: &str,
    ) -> Result<Self, IdentityError> {
        let key_path = keys_dir.join(private_key_file);
        let id_path = keys_dir.join(endpoint_id_file);

        if key_path.exists() {
            Self::load(&key_path, &id_path)
        } else {
            let identity = Self::generate();
            identity.persist(keys_dir, &key_path, &id_path)?;
            info!(id = %hex::encode(identity.endpoint_id), "generated new identity");
            Ok(identity)
        }
    }

    fn load(key_path: &Path, id_path: &Path) -> Result<Self, IdentityError> {
        let blob = fs::read(key_path)?;
        if blob.len() != KEY_FILE_SIZE {
            return Err(IdentityError::InvalidIdentity(format!(
                "private key file is {} bytes, expected {}",
                blob.len(),
                KEY_FILE_SIZE
            )));
        }

        let (pq_secret, rest) = blob.split_at(PQ_SECRET_KEY_SIZE);
        let (pq_public, ed_seed) = rest.split_at(PQ_PUBLIC_KEY_SIZE);

        let pq = PqKeyPair::from_bytes(pq_public, pq_secret)
            .map_err(|e| IdentityError::InvalidIdentity(e.to_string()))?;

        let mut seed = [0u8; 32];
        seed.copy_from_slice(ed_seed);
        let ed = EdSigningKey::from_bytes(&seed);

        let endpoint_id = pq.verifying_key().endpoint_id();

        match fs::read_to_string(id_path) {
            Ok(stored) => {
                let stored = stored.trim();
                if stored != hex::encode(endpoint_id) {
                    return Err(IdentityError::InvalidIdentity(
                        "endpoint id file does not match private key".into(),
                    ));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Key material is authoritative; restore the derived id.
                warn!(path = %id_path.display(), "endpoint id file missing, rewriting");
                write_private(id_path, hex::encode(endpoint_id).as_bytes())?;
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            pq,
            ed,
            endpoint_id,
        })
    }

    fn persist(
        &self,
        keys_dir: &Path,
        key_path: &PathBuf,
        id_path: &PathBuf,
    ) -> Result<(), IdentityError> {
        fs::create_dir_all(keys_dir)?;

        let mut blob = Vec::with_capacity(KEY_FILE_SIZE);
        blob.extend_from_slice(&self.pq.secret_bytes());
        blob.extend_from_slice(self.pq.verifying_key().as_bytes());
        blob.extend_from_slice(&self.ed.to_bytes());

        write_private(key_path, &blob)?;
        write_private(id_path, hex::encode(self.endpoint_id).as_bytes())?;
        Ok(())
    }

    /// The 32-byte endpoint identifier
    #[must_use]
    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint_id
    }

    /// The long-term ML-DSA-87 keypair
    #[must_use]
    pub fn pq(&self) -> &PqKeyPair {
        &self.pq
    }

    /// The long-term ML-DSA-87 verify key
    #[must_use]
    pub fn pq_verifying_key(&self) -> PqVerifyingKey {
        self.pq.verifying_key()
    }

    /// The long-term Ed25519 signing key
    #[must_use]
    pub fn ed(&self) -> &EdSigningKey {
        &self.ed
    }

    /// The long-term Ed25519 verify key
    #[must_use]
    pub fn ed_verifying_key(&self) -> EdVerifyingKey {
        self.ed.verifying_key()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("endpoint_id", &hex::encode(&self.endpoint_id[..8]))
            .finish_non_exhaustive()
    }
}

/// Write a file readable only by its owner.
fn write_private(path: &Path, contents: &[u8]) -> Result<(), IdentityError> {
    fs::write(path, contents)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const KEY_FILE: &str = "identity.key";
    const ID_FILE: &str = "endpoint_id";

    #[test]
    fn test_generate_then_load_roundtrip() {
        let dir = TempDir::new().unwrap();

        let first = Identity::load_or_generate(dir.path(), KEY_FILE, ID_FILE).unwrap();
        let second = Identity::load_or_generate(dir.path(), KEY_FILE, ID_FILE).unwrap();

        assert_eq!(first.endpoint_id(), second.endpoint_id());

        // Same key material signs identically
        let sig = first.ed().sign(b"probe");
        assert!(second.ed_verifying_key().verify(b"probe", &sig).is_ok());
    }

    #[test]
    fn test_id_file_matches_derived_id() {
        let dir = TempDir::new().unwrap();
        let identity = Identity::load_or_generate(dir.path(), KEY_FILE, ID_FILE).unwrap();

        let stored = fs::read_to_string(dir.path().join(ID_FILE)).unwrap();
        assert_eq!(stored.trim(), hex::encode(identity.endpoint_id()));
    }

    #[test]
    fn test_truncated_key_refused() {
        let dir = TempDir::new().unwrap();
        Identity::load_or_generate(dir.path(), KEY_FILE, ID_FILE).unwrap();

        let key_path = dir.path().join(KEY_FILE);
        let blob = fs::read(&key_path).unwrap();
        fs::write(&key_path, &blob[..blob.len() - 7]).unwrap();

        assert!(matches!(
            Identity::load_or_generate(dir.path(), KEY_FILE, ID_FILE),
            Err(IdentityError::InvalidIdentity(_))
        ));
    }

    #[test]
    fn test_mismatched_id_file_refused() {
        let dir = TempDir::new().unwrap();
        Identity::load_or_generate(dir.path(), KEY_FILE, ID_FILE).unwrap();

        fs::write(dir.path().join(ID_FILE), hex::encode([0u8; 32])).unwrap();

        assert!(matches!(
            Identity::load_or_generate(dir.path(), KEY_FILE, ID_FILE),
            Err(IdentityError::InvalidIdentity(_))
        ));
    }

    #[test]
    fn test_missing_id_file_rewritten() {
        let dir = TempDir::new().unwrap();
        let identity = Identity::load_or_generate(dir.path(), KEY_FILE, ID_FILE).unwrap();

        fs::remove_file(dir.path().join(ID_FILE)).unwrap();
        let reloaded = Identity::load_or_generate(dir.path(), KEY_FILE, ID_FILE).unwrap();

        assert_eq!(identity.endpoint_id(), reloaded.endpoint_id());
        assert!(dir.path().join(ID_FILE).exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        Identity::load_or_generate(dir.path(), KEY_FILE, ID_FILE).unwrap();

        let mode = fs::metadata(dir.path().join(KEY_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
