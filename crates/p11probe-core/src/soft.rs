//! A software provider backed by RustCrypto primitives.
//!
//! It behaves like a single-slot token: keys are session objects until they
//! are persisted under a label, persisting requires a login, and token objects
//! live as long as the provider value. It is what the CLI uses when no PKCS#11
//! module is configured and what most tests run against.

use std::{collections::HashMap, fmt};

use aes::{
    cipher::{
        block_padding::{NoPadding, Pkcs7},
        BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit, StreamCipher,
    },
    Aes128, Aes192, Aes256,
};
use aes_gcm::{
    aead::{consts::U12, Aead, Payload},
    AesGcm, Nonce,
};
use cryptoki_sys::{
    CKM_AES_CBC, CKM_AES_CBC_PAD, CKM_AES_CTR, CKM_AES_ECB, CKM_AES_GCM, CKM_AES_KEY_GEN,
    CKM_SHA224, CKM_SHA256, CKM_SHA384, CKM_SHA512, CKM_SHA_1, CK_MECHANISM_TYPE,
};
use parking_lot::Mutex;
use rand::{rngs::OsRng, RngCore};
use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use tracing::debug;

use crate::{
    cipher::GCM_TAG_BITS,
    error::{ProbeError, ProbeResult},
    keystore::Pin,
    provider::{check_aes_key_bits, CipherParams, DigestAlgorithm, Provider, ProviderInfo},
    transformation::{Direction, Mode, Padding, Transformation, GCM_DEFAULT_IV_LEN},
};

pub const SOFT_PROVIDER_NAME: &str = "p11probe-soft";

/// Runs `$body` with `$cipher` bound to the AES variant matching the key length.
macro_rules! with_aes {
    ($key:expr, $cipher:ident => $body:expr) => {
        match $key.len() {
            16 => {
                type $cipher = Aes128;
                $body
            }
            24 => {
                type $cipher = Aes192;
                $body
            }
            32 => {
                type $cipher = Aes256;
                $body
            }
            len => Err(ProbeError::InvalidKey(format!("AES key of {len} bytes"))),
        }
    };
}

/// Handle to a secret key held by [`SoftProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftKey {
    handle: u64,
    len: usize,
    token: bool,
    label: Option<String>,
}

impl SoftKey {
    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn bits(&self) -> usize {
        self.len * 8
    }

    pub fn is_token(&self) -> bool {
        self.token
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }
}

impl fmt::Display for SoftKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AES secret key, {} bytes (id {}, {} object",
            self.len,
            self.handle,
            if self.token { "token" } else { "session" }
        )?;
        if let Some(label) = &self.label {
            write!(f, ", label {label:?}")?;
        }
        f.write_str(")")
    }
}

struct SoftObject {
    material: Vec<u8>,
    token: bool,
    label: Option<String>,
}

impl SoftObject {
    fn handle_for(&self, handle: u64) -> SoftKey {
        SoftKey {
            handle,
            len: self.material.len(),
            token: self.token,
            label: self.label.clone(),
        }
    }
}

#[derive(Default)]
struct SoftState {
    next_handle: u64,
    objects: HashMap<u64, SoftObject>,
    logged_in: bool,
}

impl SoftState {
    fn insert(&mut self, object: SoftObject) -> SoftKey {
        self.next_handle += 1;
        let handle = self.next_handle;
        let key = object.handle_for(handle);
        self.objects.insert(handle, object);
        key
    }
}

pub struct SoftProvider {
    name: String,
    pin: Pin,
    state: Mutex<SoftState>,
}

impl SoftProvider {
    /// A provider whose token accepts `pin` as the user PIN.
    pub fn new(pin: Pin) -> Self {
        Self {
            name: SOFT_PROVIDER_NAME.to_string(),
            pin,
            state: Mutex::new(SoftState::default()),
        }
    }

    /// Creates a session key from known key material.
    pub fn import_secret_key(&self, material: &[u8]) -> ProbeResult<SoftKey> {
        check_aes_key_bits(material.len() * 8)?;
        Ok(self.state.lock().insert(SoftObject {
            material: material.to_vec(),
            token: false,
            label: None,
        }))
    }

    fn material(&self, key: &SoftKey) -> ProbeResult<Vec<u8>> {
        self.state
            .lock()
            .objects
            .get(&key.handle)
            .map(|object| object.material.clone())
            .ok_or_else(|| ProbeError::InvalidKey(format!("no object with id {}", key.handle)))
    }
}

impl Provider for SoftProvider {
    type Key = SoftKey;

    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> ProbeResult<ProviderInfo> {
        Ok(ProviderInfo {
            description: Some("software provider".to_string()),
            library: "RustCrypto".to_string(),
            library_manufacturer: "p11probe".to_string(),
            library_version: env!("CARGO_PKG_VERSION").to_string(),
            cryptoki_version: "n/a".to_string(),
            slot: None,
            token_label: Some(self.name.clone()),
            ..ProviderInfo::default()
        })
    }

    fn mechanisms(&self) -> ProbeResult<Vec<CK_MECHANISM_TYPE>> {
        Ok([
            CKM_SHA_1,
            CKM_SHA256,
            CKM_SHA224,
            CKM_SHA384,
            CKM_SHA512,
            CKM_AES_KEY_GEN,
            CKM_AES_ECB,
            CKM_AES_CBC,
            CKM_AES_CBC_PAD,
            CKM_AES_CTR,
            CKM_AES_GCM,
        ]
        .iter()
        .map(|mechanism| *mechanism as CK_MECHANISM_TYPE)
        .collect())
    }

    fn ensure_supported(&self, _transformation: &Transformation) -> ProbeResult<()> {
        Ok(())
    }

    fn digest(&self, algorithm: DigestAlgorithm, data: &[u8]) -> ProbeResult<Vec<u8>> {
        Ok(match algorithm {
            DigestAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
            DigestAlgorithm::Sha224 => Sha224::digest(data).to_vec(),
            DigestAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            DigestAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
            DigestAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        })
    }

    fn generate_random(&self, len: usize) -> ProbeResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        OsRng.fill_bytes(&mut buf);
        Ok(buf)
    }

    fn login(&self, pin: &Pin) -> ProbeResult<()> {
        if *pin != self.pin {
            return Err(ProbeError::Authentication("incorrect PIN".to_string()));
        }
        self.state.lock().logged_in = true;
        Ok(())
    }

    fn generate_secret_key(&self, bits: usize) -> ProbeResult<SoftKey> {
        let len = check_aes_key_bits(bits)?;
        let material = self.generate_random(len)?;
        let key = self.state.lock().insert(SoftObject {
            material,
            token: false,
            label: None,
        });
        debug!(key = %key, "generated secret key");
        Ok(key)
    }

    fn persist_key(&self, key: &SoftKey, alias: &str) -> ProbeResult<SoftKey> {
        let material = self.material(key)?;
        let mut state = self.state.lock();
        if !state.logged_in {
            return Err(ProbeError::Authentication("user not logged in".to_string()));
        }
        Ok(state.insert(SoftObject {
            material,
            token: true,
            label: Some(alias.to_string()),
        }))
    }

    fn find_keys(&self, alias: &str) -> ProbeResult<Vec<SoftKey>> {
        let state = self.state.lock();
        let mut keys: Vec<SoftKey> = state
            .objects
            .iter()
            .filter(|(_, object)| object.token && object.label.as_deref() == Some(alias))
            .map(|(handle, object)| object.handle_for(*handle))
            .collect();
        keys.sort_by_key(|key| key.handle);
        Ok(keys)
    }

    fn key_aliases(&self) -> ProbeResult<Vec<String>> {
        let state = self.state.lock();
        Ok(state
            .objects
            .values()
            .filter(|object| object.token)
            .filter_map(|object| object.label.clone())
            .collect())
    }

    fn destroy_key(&self, key: &SoftKey) -> ProbeResult<()> {
        self.state
            .lock()
            .objects
            .remove(&key.handle)
            .map(|_| ())
            .ok_or_else(|| ProbeError::InvalidKey(format!("no object with id {}", key.handle)))
    }

    fn encrypt(
        &self,
        key: &SoftKey,
        params: &CipherParams<'_>,
        data: &[u8],
    ) -> ProbeResult<Vec<u8>> {
        let material = self.material(key)?;
        params
            .transformation
            .check_input_len(Direction::Encrypt, data.len())?;
        let padding = params.transformation.padding;
        match params.transformation.mode {
            Mode::Ecb => with_aes!(material, C => {
                let cipher = <ecb::Encryptor<C> as KeyInit>::new_from_slice(&material)
                    .map_err(ProbeError::crypto)?;
                Ok(match padding {
                    Padding::None => cipher.encrypt_padded_vec_mut::<NoPadding>(data),
                    Padding::Pkcs5 => cipher.encrypt_padded_vec_mut::<Pkcs7>(data),
                })
            }),
            Mode::Cbc => {
                let iv = params.block_iv()?;
                with_aes!(material, C => {
                    let cipher = cbc::Encryptor::<C>::new_from_slices(&material, iv)
                        .map_err(ProbeError::crypto)?;
                    Ok(match padding {
                        Padding::None => cipher.encrypt_padded_vec_mut::<NoPadding>(data),
                        Padding::Pkcs5 => cipher.encrypt_padded_vec_mut::<Pkcs7>(data),
                    })
                })
            }
            Mode::Ctr => ctr_apply(&material, params.block_iv()?, data),
            Mode::Gcm => {
                let iv = gcm_iv(params)?;
                let payload = Payload {
                    msg: data,
                    aad: params.aad,
                };
                with_aes!(material, C => {
                    let cipher = <AesGcm<C, U12> as KeyInit>::new_from_slice(&material)
                        .map_err(ProbeError::crypto)?;
                    cipher
                        .encrypt(Nonce::<U12>::from_slice(iv), payload)
                        .map_err(ProbeError::crypto)
                })
            }
        }
    }

    fn decrypt(
        &self,
        key: &SoftKey,
        params: &CipherParams<'_>,
        data: &[u8],
    ) -> ProbeResult<Vec<u8>> {
        let material = self.material(key)?;
        params
            .transformation
            .check_input_len(Direction::Decrypt, data.len())?;
        let padding = params.transformation.padding;
        match params.transformation.mode {
            Mode::Ecb => with_aes!(material, C => {
                let cipher = <ecb::Decryptor<C> as KeyInit>::new_from_slice(&material)
                    .map_err(ProbeError::crypto)?;
                let plain = match padding {
                    Padding::None => cipher.decrypt_padded_vec_mut::<NoPadding>(data),
                    Padding::Pkcs5 => cipher.decrypt_padded_vec_mut::<Pkcs7>(data),
                };
                plain.map_err(|_| ProbeError::BadPadding)
            }),
            Mode::Cbc => {
                let iv = params.block_iv()?;
                with_aes!(material, C => {
                    let cipher = cbc::Decryptor::<C>::new_from_slices(&material, iv)
                        .map_err(ProbeError::crypto)?;
                    let plain = match padding {
                        Padding::None => cipher.decrypt_padded_vec_mut::<NoPadding>(data),
                        Padding::Pkcs5 => cipher.decrypt_padded_vec_mut::<Pkcs7>(data),
                    };
                    plain.map_err(|_| ProbeError::BadPadding)
                })
            }
            Mode::Ctr => ctr_apply(&material, params.block_iv()?, data),
            Mode::Gcm => {
                let iv = gcm_iv(params)?;
                let payload = Payload {
                    msg: data,
                    aad: params.aad,
                };
                with_aes!(material, C => {
                    let cipher = <AesGcm<C, U12> as KeyInit>::new_from_slice(&material)
                        .map_err(ProbeError::crypto)?;
                    cipher
                        .decrypt(Nonce::<U12>::from_slice(iv), payload)
                        .map_err(|_| ProbeError::crypto("GCM tag mismatch"))
                })
            }
        }
    }
}

fn ctr_apply(material: &[u8], iv: &[u8], data: &[u8]) -> ProbeResult<Vec<u8>> {
    with_aes!(material, C => {
        let mut cipher = ctr::Ctr128BE::<C>::new_from_slices(material, iv)
            .map_err(ProbeError::crypto)?;
        let mut buf = data.to_vec();
        cipher.apply_keystream(&mut buf);
        Ok(buf)
    })
}

fn gcm_iv<'a>(params: &CipherParams<'a>) -> ProbeResult<&'a [u8]> {
    if params.tag_bits != GCM_TAG_BITS {
        return Err(ProbeError::invalid_parameter(format!(
            "software GCM supports {GCM_TAG_BITS} bit tags only, got {}",
            params.tag_bits
        )));
    }
    match params.iv {
        Some(iv) if iv.len() == GCM_DEFAULT_IV_LEN => Ok(iv),
        Some(iv) => Err(ProbeError::invalid_parameter(format!(
            "software GCM supports {GCM_DEFAULT_IV_LEN} byte IVs only, got {}",
            iv.len()
        ))),
        None => Err(ProbeError::invalid_parameter("GCM needs an IV")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transformation::{AES_BLOCK_CIPHERS, AES_GCM};

    const PLAIN: &[u8] = b"Hello, world!!!!";

    fn provider() -> SoftProvider {
        SoftProvider::new(Pin::from("pin"))
    }

    fn params<'a>(text: &str, iv: Option<&'a [u8]>, aad: &'a [u8]) -> CipherParams<'a> {
        CipherParams {
            transformation: text.parse::<Transformation>().unwrap(),
            iv,
            aad,
            tag_bits: 128,
        }
    }

    #[test]
    fn sha256_of_hello_world() {
        let digest = provider()
            .digest(DigestAlgorithm::Sha256, b"Hello, world!")
            .unwrap();
        assert_eq!(
            hex::encode(digest),
            "315f5bdb76d078c43b8ac0064e4a0164612b1fce77c869345bfc94c75894edd3"
        );
    }

    #[test]
    fn aes128_ecb_known_answer() {
        let provider = provider();
        let key = provider
            .import_secret_key(&hex::decode("000102030405060708090a0b0c0d0e0f").unwrap())
            .unwrap();
        let pt = hex::decode("00112233445566778899aabbccddeeff").unwrap();
        let ct = provider
            .encrypt(&key, &params("AES/ECB/NoPadding", None, &[]), &pt)
            .unwrap();
        assert_eq!(hex::encode(ct), "69c4e0d86a7b0430d8cdb78070b4c55a");
    }

    #[test]
    fn aes128_gcm_known_answer() {
        let provider = provider();
        let key = provider.import_secret_key(&[0u8; 16]).unwrap();
        let iv = [0u8; 12];
        let ct = provider
            .encrypt(&key, &params(AES_GCM, Some(&iv), &[]), &[0u8; 16])
            .unwrap();
        assert_eq!(
            hex::encode(ct),
            "0388dace60b6a392f328c2b971b2fe78ab6e47d42cec13bdf53a67b21257bddf"
        );
    }

    #[test]
    fn block_ciphers_round_trip_for_every_key_size() {
        let provider = provider();
        let iv = [7u8; 16];
        for bits in [128, 192, 256] {
            let key = provider.generate_secret_key(bits).unwrap();
            for text in AES_BLOCK_CIPHERS {
                let iv = (!text.contains("ECB")).then_some(&iv[..]);
                let p = params(text, iv, &[]);
                let ct = provider.encrypt(&key, &p, PLAIN).unwrap();
                assert_ne!(ct, PLAIN, "{text}");
                assert_eq!(provider.decrypt(&key, &p, &ct).unwrap(), PLAIN, "{text}");
            }
        }
    }

    #[test]
    fn padded_modes_add_a_block() {
        let provider = provider();
        let key = provider.generate_secret_key(128).unwrap();
        let ct = provider
            .encrypt(&key, &params("AES/ECB/PKCS5Padding", None, &[]), PLAIN)
            .unwrap();
        assert_eq!(ct.len(), 32);
    }

    #[test]
    fn gcm_rejects_tampering_and_wrong_aad() {
        let provider = provider();
        let key = provider.generate_secret_key(256).unwrap();
        let iv = [1u8; 12];
        let aad = [2u8; 20];
        let p = params(AES_GCM, Some(&iv), &aad);
        let mut ct = provider.encrypt(&key, &p, PLAIN).unwrap();
        assert_eq!(ct.len(), PLAIN.len() + 16);
        assert_eq!(provider.decrypt(&key, &p, &ct).unwrap(), PLAIN);

        let other_aad = params(AES_GCM, Some(&iv), &aad[..10]);
        assert!(provider.decrypt(&key, &other_aad, &ct).is_err());
        ct[0] ^= 1;
        assert!(provider.decrypt(&key, &p, &ct).is_err());
    }

    #[test]
    fn parameter_errors() {
        let provider = provider();
        let key = provider.generate_secret_key(128).unwrap();
        assert!(matches!(
            provider.encrypt(&key, &params("AES/CBC/NoPadding", None, &[]), PLAIN),
            Err(ProbeError::InvalidParameter(_))
        ));
        assert!(matches!(
            provider.encrypt(&key, &params("AES/CBC/NoPadding", Some(&[0u8; 8]), &[]), PLAIN),
            Err(ProbeError::InvalidParameter(_))
        ));
        assert!(matches!(
            provider.encrypt(&key, &params("AES/ECB/NoPadding", None, &[]), b"short"),
            Err(ProbeError::IllegalBlockSize(_))
        ));
        assert!(provider.import_secret_key(&[0u8; 10]).is_err());
        assert!(provider.generate_secret_key(100).is_err());
    }

    #[test]
    fn persist_requires_login() {
        let provider = provider();
        let key = provider.generate_secret_key(128).unwrap();
        assert!(matches!(
            provider.persist_key(&key, "k"),
            Err(ProbeError::Authentication(_))
        ));
        provider.login(&Pin::from("pin")).unwrap();
        let stored = provider.persist_key(&key, "k").unwrap();
        assert!(stored.is_token());
        assert_ne!(stored.handle(), key.handle());
        assert_eq!(stored.label(), Some("k"));
        assert_eq!(provider.find_keys("k").unwrap(), vec![stored.clone()]);

        provider.destroy_key(&stored).unwrap();
        assert!(provider.destroy_key(&stored).is_err());
        assert!(provider.find_keys("k").unwrap().is_empty());
    }

    #[test]
    fn key_display() {
        let provider = provider();
        let key = provider.generate_secret_key(192).unwrap();
        assert_eq!(
            key.to_string(),
            format!("AES secret key, 24 bytes (id {}, session object)", key.handle())
        );
    }
}
