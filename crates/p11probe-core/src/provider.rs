//! The seam between the probe driver and a cryptographic provider.

use std::{fmt, str::FromStr};

use cryptoki_sys::CK_MECHANISM_TYPE;

use crate::{
    error::{ProbeError, ProbeResult},
    keystore::Pin,
    transformation::{Transformation, AES_BLOCK_SIZE},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha1 => "SHA-1",
            DigestAlgorithm::Sha224 => "SHA-224",
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha384 => "SHA-384",
            DigestAlgorithm::Sha512 => "SHA-512",
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = ProbeError;

    fn from_str(s: &str) -> ProbeResult<Self> {
        match s.to_ascii_uppercase().replace('-', "").as_str() {
            "SHA1" => Ok(DigestAlgorithm::Sha1),
            "SHA224" => Ok(DigestAlgorithm::Sha224),
            "SHA256" => Ok(DigestAlgorithm::Sha256),
            "SHA384" => Ok(DigestAlgorithm::Sha384),
            "SHA512" => Ok(DigestAlgorithm::Sha512),
            _ => Err(ProbeError::no_such_algorithm(format!(
                "{s} MessageDigest not available"
            ))),
        }
    }
}

/// Everything a provider needs to run one single-part cipher operation.
#[derive(Debug, Clone, Copy)]
pub struct CipherParams<'a> {
    pub transformation: Transformation,
    pub iv: Option<&'a [u8]>,
    pub aad: &'a [u8],
    pub tag_bits: usize,
}

impl<'a> CipherParams<'a> {
    /// The IV for CBC and CTR, which must be exactly one block.
    pub(crate) fn block_iv(&self) -> ProbeResult<&'a [u8]> {
        match self.iv {
            Some(iv) if iv.len() == AES_BLOCK_SIZE => Ok(iv),
            Some(iv) => Err(ProbeError::invalid_parameter(format!(
                "{} needs a {AES_BLOCK_SIZE} byte IV, got {}",
                self.transformation,
                iv.len()
            ))),
            None => Err(ProbeError::invalid_parameter(format!(
                "{} needs an IV",
                self.transformation
            ))),
        }
    }
}

/// Descriptive information about a configured provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderInfo {
    pub description: Option<String>,
    pub library: String,
    pub library_manufacturer: String,
    pub library_version: String,
    pub cryptoki_version: String,
    pub slot: Option<u64>,
    pub token_label: Option<String>,
    pub token_manufacturer: Option<String>,
    pub token_model: Option<String>,
    pub token_serial: Option<String>,
}

impl fmt::Display for ProviderInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(description) = &self.description {
            writeln!(f, "description: {description}")?;
        }
        writeln!(
            f,
            "library    : {} ({}), version {}",
            self.library, self.library_manufacturer, self.library_version
        )?;
        write!(f, "cryptoki   : {}", self.cryptoki_version)?;
        if let Some(slot) = self.slot {
            write!(f, "\nslot       : {slot}")?;
        }
        if let Some(label) = &self.token_label {
            write!(f, "\ntoken      : {label}")?;
            let model = [&self.token_manufacturer, &self.token_model]
                .iter()
                .filter_map(|part| part.as_deref())
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join(" ");
            if !model.is_empty() {
                write!(f, " ({model})")?;
            }
            if let Some(serial) = self.token_serial.as_deref().filter(|s| !s.is_empty()) {
                write!(f, ", serial {serial}")?;
            }
        }
        Ok(())
    }
}

/// A source of digests, random bytes, secret keys, token storage and AES
/// encryption. The probe only talks to providers through this trait.
pub trait Provider {
    /// Handle to a secret key owned by the provider.
    type Key: Clone + PartialEq + fmt::Debug + fmt::Display;

    fn name(&self) -> &str;

    fn info(&self) -> ProbeResult<ProviderInfo>;

    /// Mechanisms the provider makes available.
    fn mechanisms(&self) -> ProbeResult<Vec<CK_MECHANISM_TYPE>>;

    /// Fails with [`ProbeError::NoSuchAlgorithm`] when the transformation
    /// cannot be served.
    fn ensure_supported(&self, transformation: &Transformation) -> ProbeResult<()>;

    fn digest(&self, algorithm: DigestAlgorithm, data: &[u8]) -> ProbeResult<Vec<u8>>;

    fn generate_random(&self, len: usize) -> ProbeResult<Vec<u8>>;

    fn login(&self, pin: &Pin) -> ProbeResult<()>;

    /// Generates a session AES key of `bits` bits.
    fn generate_secret_key(&self, bits: usize) -> ProbeResult<Self::Key>;

    /// Stores a copy of `key` as a token object labelled `alias`.
    fn persist_key(&self, key: &Self::Key, alias: &str) -> ProbeResult<Self::Key>;

    /// Token secret keys labelled `alias`.
    fn find_keys(&self, alias: &str) -> ProbeResult<Vec<Self::Key>>;

    /// Labels of all token secret keys.
    fn key_aliases(&self) -> ProbeResult<Vec<String>>;

    fn destroy_key(&self, key: &Self::Key) -> ProbeResult<()>;

    fn encrypt(
        &self,
        key: &Self::Key,
        params: &CipherParams<'_>,
        data: &[u8],
    ) -> ProbeResult<Vec<u8>>;

    fn decrypt(
        &self,
        key: &Self::Key,
        params: &CipherParams<'_>,
        data: &[u8],
    ) -> ProbeResult<Vec<u8>>;
}

pub(crate) fn check_aes_key_bits(bits: usize) -> ProbeResult<usize> {
    match bits {
        128 | 192 | 256 => Ok(bits / 8),
        _ => Err(ProbeError::invalid_parameter(format!(
            "AES key size must be 128, 192 or 256 bits, not {bits}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_names() {
        assert_eq!("SHA-256".parse::<DigestAlgorithm>().unwrap(), DigestAlgorithm::Sha256);
        assert_eq!("sha512".parse::<DigestAlgorithm>().unwrap(), DigestAlgorithm::Sha512);
        assert!("MD5".parse::<DigestAlgorithm>().is_err());
    }

    #[test]
    fn block_iv_must_be_one_block() {
        let params = |iv| CipherParams {
            transformation: "AES/CBC/NoPadding".parse().unwrap(),
            iv,
            aad: &[],
            tag_bits: 128,
        };
        let iv = [7u8; 16];
        assert_eq!(params(Some(&iv[..])).block_iv().unwrap(), &iv[..]);
        assert!(matches!(
            params(Some(&iv[..12])).block_iv(),
            Err(ProbeError::InvalidParameter(_))
        ));
        assert!(params(None).block_iv().is_err());
    }

    #[test]
    fn info_block_skips_missing_token_details() {
        let info = ProviderInfo {
            library: "Virtual PKCS#11".into(),
            library_manufacturer: "Example".into(),
            library_version: "1.0".into(),
            cryptoki_version: "2.40".into(),
            slot: Some(0),
            token_label: Some("demo".into()),
            token_model: Some("v1".into()),
            ..ProviderInfo::default()
        };
        let text = info.to_string();
        assert!(text.contains("library    : Virtual PKCS#11 (Example), version 1.0"));
        assert!(text.contains("token      : demo (v1)"));
        assert!(!text.contains("serial"));
    }

    #[test]
    fn key_sizes() {
        assert_eq!(check_aes_key_bits(128).unwrap(), 16);
        assert_eq!(check_aes_key_bits(256).unwrap(), 32);
        assert!(check_aes_key_bits(64).is_err());
    }
}
