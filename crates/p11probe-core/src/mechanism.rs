//! PKCS#11 mechanism names.
//!
//! Mechanisms appear in provider configuration files by their `CKM_*` name and
//! in the report when listing what a token offers. This module maps between
//! the two representations.

use std::fmt;

use cryptoki_sys::{CKM_VENDOR_DEFINED, CK_MECHANISM_TYPE};

const NAMES: &[(CK_MECHANISM_TYPE, &str)] = &[
    (0x0000, "CKM_RSA_PKCS_KEY_PAIR_GEN"),
    (0x0001, "CKM_RSA_PKCS"),
    (0x0003, "CKM_RSA_X_509"),
    (0x0006, "CKM_SHA1_RSA_PKCS"),
    (0x0009, "CKM_RSA_PKCS_OAEP"),
    (0x000D, "CKM_RSA_PKCS_PSS"),
    (0x000E, "CKM_SHA1_RSA_PKCS_PSS"),
    (0x0040, "CKM_SHA256_RSA_PKCS"),
    (0x0041, "CKM_SHA384_RSA_PKCS"),
    (0x0042, "CKM_SHA512_RSA_PKCS"),
    (0x0043, "CKM_SHA256_RSA_PKCS_PSS"),
    (0x0044, "CKM_SHA384_RSA_PKCS_PSS"),
    (0x0045, "CKM_SHA512_RSA_PKCS_PSS"),
    (0x0046, "CKM_SHA224_RSA_PKCS"),
    (0x0131, "CKM_DES3_KEY_GEN"),
    (0x0132, "CKM_DES3_ECB"),
    (0x0133, "CKM_DES3_CBC"),
    (0x0136, "CKM_DES3_CBC_PAD"),
    (0x0210, "CKM_MD5"),
    (0x0220, "CKM_SHA_1"),
    (0x0221, "CKM_SHA_1_HMAC"),
    (0x0250, "CKM_SHA256"),
    (0x0251, "CKM_SHA256_HMAC"),
    (0x0255, "CKM_SHA224"),
    (0x0256, "CKM_SHA224_HMAC"),
    (0x0260, "CKM_SHA384"),
    (0x0261, "CKM_SHA384_HMAC"),
    (0x0270, "CKM_SHA512"),
    (0x0271, "CKM_SHA512_HMAC"),
    (0x0350, "CKM_GENERIC_SECRET_KEY_GEN"),
    (0x1040, "CKM_EC_KEY_PAIR_GEN"),
    (0x1041, "CKM_ECDSA"),
    (0x1042, "CKM_ECDSA_SHA1"),
    (0x1043, "CKM_ECDSA_SHA224"),
    (0x1044, "CKM_ECDSA_SHA256"),
    (0x1045, "CKM_ECDSA_SHA384"),
    (0x1046, "CKM_ECDSA_SHA512"),
    (0x1050, "CKM_ECDH1_DERIVE"),
    (0x1055, "CKM_EC_EDWARDS_KEY_PAIR_GEN"),
    (0x1057, "CKM_EDDSA"),
    (0x1080, "CKM_AES_KEY_GEN"),
    (0x1081, "CKM_AES_ECB"),
    (0x1082, "CKM_AES_CBC"),
    (0x1083, "CKM_AES_MAC"),
    (0x1084, "CKM_AES_MAC_GENERAL"),
    (0x1085, "CKM_AES_CBC_PAD"),
    (0x1086, "CKM_AES_CTR"),
    (0x1087, "CKM_AES_GCM"),
    (0x1088, "CKM_AES_CCM"),
    (0x1089, "CKM_AES_CTS"),
    (0x108A, "CKM_AES_CMAC"),
    (0x108B, "CKM_AES_CMAC_GENERAL"),
    (0x108C, "CKM_AES_XCBC_MAC"),
    (0x108E, "CKM_AES_GMAC"),
    (0x1104, "CKM_AES_ECB_ENCRYPT_DATA"),
    (0x1105, "CKM_AES_CBC_ENCRYPT_DATA"),
    (0x2109, "CKM_AES_KEY_WRAP"),
    (0x210A, "CKM_AES_KEY_WRAP_PAD"),
];

/// Symbolic `CKM_*` name of a mechanism, when it is a well-known one.
pub fn mechanism_name(mechanism: CK_MECHANISM_TYPE) -> Option<&'static str> {
    NAMES
        .iter()
        .find(|(value, _)| *value == mechanism)
        .map(|(_, name)| *name)
}

/// Parses a mechanism given either as a `CKM_*` name or as a number
/// (`0x1082` or `4226`).
pub fn parse_mechanism(text: &str) -> Option<CK_MECHANISM_TYPE> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return CK_MECHANISM_TYPE::from_str_radix(hex, 16).ok();
    }
    if text.bytes().all(|b| b.is_ascii_digit()) && !text.is_empty() {
        return text.parse().ok();
    }
    NAMES
        .iter()
        .find(|(_, name)| name.eq_ignore_ascii_case(text))
        .map(|(value, _)| *value)
}

/// Display adapter rendering a mechanism as `CKM_NAME (0x…)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MechanismLabel(pub CK_MECHANISM_TYPE);

impl fmt::Display for MechanismLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let vendor = CKM_VENDOR_DEFINED as CK_MECHANISM_TYPE;
        match mechanism_name(self.0) {
            Some(name) => write!(f, "{name} ({:#x})", self.0),
            None if self.0 >= vendor => {
                write!(f, "CKM_VENDOR_DEFINED+{:#x}", self.0 - vendor)
            }
            None => write!(f, "{:#x}", self.0),
        }
    }
}
