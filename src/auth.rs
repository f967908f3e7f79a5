use crate::protocol::AdbError;
use base64::{engine::general_purpose, Engine as _};
use rsa::{
    pkcs1::DecodeRsaPrivateKey,
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding},
    traits::{PrivateKeyParts, PublicKeyParts},
    BigUint, RsaPrivateKey, RsaPublicKey,
};
use std::fs;
use std::io::Write;
use std::path::Path;

/// Key size adbd expects
pub const KEY_LENGTH_BITS: usize = 2048;
pub const KEY_LENGTH_BYTES: usize = KEY_LENGTH_BITS / 8;
pub const KEY_LENGTH_WORDS: usize = KEY_LENGTH_BYTES / 4;

/// Size of the binary public key adbd parses: word count, n0inv, modulus,
/// R^2 mod N, exponent.
pub const ADB_PUBLIC_KEY_LENGTH: usize = 4 + 4 + KEY_LENGTH_BYTES + KEY_LENGTH_BYTES + 4;

/// Length of the auth challenge adbd sends
pub const TOKEN_LENGTH: usize = 20;

/// EMSA-PKCS1-v1_5 block prefix for a SHA-1 DigestInfo. The token is
/// appended as if it were the digest; the result fills one 2048-bit block.
pub const SIGNATURE_PADDING: [u8; KEY_LENGTH_BYTES - TOKEN_LENGTH] = signature_padding();

const SHA1_DIGEST_INFO: [u8; 15] = [
    0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02, 0x1a, 0x05, 0x00, 0x04, 0x14,
];

const fn signature_padding() -> [u8; KEY_LENGTH_BYTES - TOKEN_LENGTH] {
    let mut padding = [0xffu8; KEY_LENGTH_BYTES - TOKEN_LENGTH];
    padding[0] = 0x00;
    padding[1] = 0x01;
    let separator = padding.len() - SHA1_DIGEST_INFO.len() - 1;
    padding[separator] = 0x00;
    let mut i = 0;
    while i < SHA1_DIGEST_INFO.len() {
        padding[separator + 1 + i] = SHA1_DIGEST_INFO[i];
        i += 1;
    }
    padding
}

/// ADB key pair for authentication
#[derive(Clone)]
pub struct AdbKeyPair {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl AdbKeyPair {
    /// Generate a new 2048-bit RSA key pair
    pub fn generate() -> Result<Self, AdbError> {
        use rsa::rand_core::OsRng;

        let mut rng = OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, KEY_LENGTH_BITS)
            .map_err(|e| AdbError::AuthenticationFailed(format!("Failed to generate key: {}", e)))?;

        let public_key = RsaPublicKey::from(&private_key);

        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// Rebuild a key pair from its persisted forms: PKCS#8 DER private key
    /// and X.509 SubjectPublicKeyInfo DER public key.
    pub fn load(private_der: &[u8], public_der: &[u8]) -> Result<Self, AdbError> {
        let private_key = RsaPrivateKey::from_pkcs8_der(private_der)
            .map_err(|e| AdbError::InvalidKeyData(format!("private key: {}", e)))?;
        let public_key = RsaPublicKey::from_public_key_der(public_der)
            .map_err(|e| AdbError::InvalidKeyData(format!("public key: {}", e)))?;

        if RsaPublicKey::from(&private_key) != public_key {
            return Err(AdbError::InvalidKeyData(
                "public key does not match private key".to_string(),
            ));
        }

        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// Load from PEM-encoded private key string (PKCS#1 or PKCS#8), e.g. an
    /// existing `~/.android/adbkey`.
    pub fn from_pem(pem: &str) -> Result<Self, AdbError> {
        let private_key = if let Ok(key) = RsaPrivateKey::from_pkcs1_pem(pem) {
            key
        } else {
            RsaPrivateKey::from_pkcs8_pem(pem)
                .map_err(|e| AdbError::InvalidKeyData(format!("Failed to parse PEM: {}", e)))?
        };

        let public_key = RsaPublicKey::from(&private_key);

        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// Read both key files and rebuild the pair
    pub fn load_from_files(private_path: &Path, public_path: &Path) -> Result<Self, AdbError> {
        let private_der = fs::read(private_path)?;
        let public_der = fs::read(public_path)?;
        Self::load(&private_der, &public_der)
    }

    /// Write both encoded keys. The private key file is created owner-only
    /// on unix.
    pub fn persist(&self, private_path: &Path, public_path: &Path) -> Result<(), AdbError> {
        let private_der = self
            .private_key
            .to_pkcs8_der()
            .map_err(|e| AdbError::InvalidKeyData(format!("Failed to encode private key: {}", e)))?;
        let public_der = self
            .public_key
            .to_public_key_der()
            .map_err(|e| AdbError::InvalidKeyData(format!("Failed to encode public key: {}", e)))?;

        write_private_file(private_path, private_der.as_bytes())?;
        fs::write(public_path, public_der.as_bytes())?;
        Ok(())
    }

    /// Load the persisted identity, or create and persist a new one.
    ///
    /// Any load or persist failure degrades to a fresh in-memory pair, so
    /// the caller only sees an error when key generation itself fails.
    pub fn load_or_generate(private_path: &Path, public_path: &Path) -> Result<Self, AdbError> {
        if private_path.exists() && public_path.exists() {
            match Self::load_from_files(private_path, public_path) {
                Ok(keypair) => {
                    log::info!("Loaded ADB key pair from {}", private_path.display());
                    return Ok(keypair);
                }
                Err(e) => {
                    log::error!("Failed to load ADB key pair: {}", e);
                    return Self::generate();
                }
            }
        }

        log::info!("Generating new ADB key pair");
        let keypair = Self::generate()?;
        if let Err(e) = keypair.persist(private_path, public_path) {
            log::error!("Failed to save ADB key pair: {}", e);
        }
        Ok(keypair)
    }

    /// Sign an auth token the way adbd verifies it: raw RSA over the fixed
    /// padding prefix followed by the token.
    pub fn sign_token(&self, token: &[u8]) -> Result<Vec<u8>, AdbError> {
        let key_size = self.private_key.size();
        if SIGNATURE_PADDING.len() + token.len() != key_size {
            return Err(AdbError::AuthenticationFailed(format!(
                "Cannot sign {}-byte token with a {}-byte key",
                token.len(),
                key_size
            )));
        }

        let mut block = Vec::with_capacity(key_size);
        block.extend_from_slice(&SIGNATURE_PADDING);
        block.extend_from_slice(token);

        let m = BigUint::from_bytes_be(&block);
        let s = m.modpow(self.private_key.d(), self.private_key.n());
        Ok(left_pad(&s.to_bytes_be(), key_size))
    }

    /// Public key in adbd's binary layout (524 bytes)
    pub fn adb_public_key(&self) -> Result<Vec<u8>, AdbError> {
        convert_public_key(&self.public_key)
    }

    /// AUTH/RSA_PUBLIC payload: base64(adb key) + " " + label + "\0"
    pub fn get_public_key(&self, name: &str) -> Result<Vec<u8>, AdbError> {
        let encoded = general_purpose::STANDARD.encode(self.adb_public_key()?);

        let mut result = encoded.into_bytes();
        result.push(b' ');
        result.extend_from_slice(name.as_bytes());
        result.push(0);

        Ok(result)
    }

    /// Get private key as PKCS#8 PEM
    pub fn private_key_pem(&self) -> Result<String, AdbError> {
        let pem = self
            .private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| AdbError::InvalidKeyData(format!("Failed to encode private key: {}", e)))?;
        Ok(pem.to_string())
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }
}

/// Convert an RSA public key into adbd's Montgomery-form layout.
pub fn convert_public_key(public_key: &RsaPublicKey) -> Result<Vec<u8>, AdbError> {
    let n = public_key.n();
    if public_key.size() > KEY_LENGTH_BYTES {
        return Err(AdbError::InvalidKeyData(format!(
            "modulus is {} bytes, expected at most {}",
            public_key.size(),
            KEY_LENGTH_BYTES
        )));
    }

    let n_le = right_pad(&n.to_bytes_le(), KEY_LENGTH_BYTES);
    let n0 = u32::from_le_bytes([n_le[0], n_le[1], n_le[2], n_le[3]]);
    if n0 & 1 == 0 {
        return Err(AdbError::InvalidKeyData("modulus is even".to_string()));
    }

    // Newton iteration: each step doubles the number of correct low bits.
    let mut inv = n0;
    for _ in 0..5 {
        inv = inv.wrapping_mul(2u32.wrapping_sub(n0.wrapping_mul(inv)));
    }
    let n0inv = inv.wrapping_neg();

    let r_squared = (BigUint::from(1u32) << (KEY_LENGTH_WORDS * 32 * 2)) % n;
    let rr_le = right_pad(&r_squared.to_bytes_le(), KEY_LENGTH_BYTES);

    let e_le = public_key.e().to_bytes_le();
    if e_le.len() > 4 {
        return Err(AdbError::InvalidKeyData(
            "public exponent does not fit in 32 bits".to_string(),
        ));
    }
    let exponent = right_pad(&e_le, 4);

    let mut out = Vec::with_capacity(ADB_PUBLIC_KEY_LENGTH);
    out.extend_from_slice(&(KEY_LENGTH_WORDS as u32).to_le_bytes());
    out.extend_from_slice(&n0inv.to_le_bytes());
    out.extend_from_slice(&n_le);
    out.extend_from_slice(&rr_le);
    out.extend_from_slice(&exponent);
    Ok(out)
}

fn left_pad(bytes: &[u8], len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len.saturating_sub(bytes.len())];
    out.extend_from_slice(bytes);
    out
}

fn right_pad(bytes: &[u8], len: usize) -> Vec<u8> {
    let mut out = bytes.to_vec();
    out.resize(len.max(bytes.len()), 0);
    out
}

#[cfg(unix)]
fn write_private_file(path: &Path, bytes: &[u8]) -> Result<(), AdbError> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private_file(path: &Path, bytes: &[u8]) -> Result<(), AdbError> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    Ok(())
}
