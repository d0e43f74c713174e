//! Symbolic names for PKCS#11 return values.

use std::fmt;

use cryptoki_sys::{CKR_OK, CKR_VENDOR_DEFINED, CK_RV};

/// A `CK_RV` as returned by a PKCS#11 function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReturnValue(pub CK_RV);

const NAMES: &[(CK_RV, &str)] = &[
    (0x0000_0000, "CKR_OK"),
    (0x0000_0001, "CKR_CANCEL"),
    (0x0000_0002, "CKR_HOST_MEMORY"),
    (0x0000_0003, "CKR_SLOT_ID_INVALID"),
    (0x0000_0005, "CKR_GENERAL_ERROR"),
    (0x0000_0006, "CKR_FUNCTION_FAILED"),
    (0x0000_0007, "CKR_ARGUMENTS_BAD"),
    (0x0000_0008, "CKR_NO_EVENT"),
    (0x0000_0009, "CKR_NEED_TO_CREATE_THREADS"),
    (0x0000_000A, "CKR_CANT_LOCK"),
    (0x0000_0010, "CKR_ATTRIBUTE_READ_ONLY"),
    (0x0000_0011, "CKR_ATTRIBUTE_SENSITIVE"),
    (0x0000_0012, "CKR_ATTRIBUTE_TYPE_INVALID"),
    (0x0000_0013, "CKR_ATTRIBUTE_VALUE_INVALID"),
    (0x0000_001B, "CKR_ACTION_PROHIBITED"),
    (0x0000_0020, "CKR_DATA_INVALID"),
    (0x0000_0021, "CKR_DATA_LEN_RANGE"),
    (0x0000_0030, "CKR_DEVICE_ERROR"),
    (0x0000_0031, "CKR_DEVICE_MEMORY"),
    (0x0000_0032, "CKR_DEVICE_REMOVED"),
    (0x0000_0040, "CKR_ENCRYPTED_DATA_INVALID"),
    (0x0000_0041, "CKR_ENCRYPTED_DATA_LEN_RANGE"),
    (0x0000_0042, "CKR_AEAD_DECRYPT_FAILED"),
    (0x0000_0050, "CKR_FUNCTION_CANCELED"),
    (0x0000_0051, "CKR_FUNCTION_NOT_PARALLEL"),
    (0x0000_0054, "CKR_FUNCTION_NOT_SUPPORTED"),
    (0x0000_0060, "CKR_KEY_HANDLE_INVALID"),
    (0x0000_0062, "CKR_KEY_SIZE_RANGE"),
    (0x0000_0063, "CKR_KEY_TYPE_INCONSISTENT"),
    (0x0000_0064, "CKR_KEY_NOT_NEEDED"),
    (0x0000_0065, "CKR_KEY_CHANGED"),
    (0x0000_0066, "CKR_KEY_NEEDED"),
    (0x0000_0067, "CKR_KEY_INDIGESTIBLE"),
    (0x0000_0068, "CKR_KEY_FUNCTION_NOT_PERMITTED"),
    (0x0000_0069, "CKR_KEY_NOT_WRAPPABLE"),
    (0x0000_006A, "CKR_KEY_UNEXTRACTABLE"),
    (0x0000_0070, "CKR_MECHANISM_INVALID"),
    (0x0000_0071, "CKR_MECHANISM_PARAM_INVALID"),
    (0x0000_0082, "CKR_OBJECT_HANDLE_INVALID"),
    (0x0000_0090, "CKR_OPERATION_ACTIVE"),
    (0x0000_0091, "CKR_OPERATION_NOT_INITIALIZED"),
    (0x0000_00A0, "CKR_PIN_INCORRECT"),
    (0x0000_00A1, "CKR_PIN_INVALID"),
    (0x0000_00A2, "CKR_PIN_LEN_RANGE"),
    (0x0000_00A3, "CKR_PIN_EXPIRED"),
    (0x0000_00A4, "CKR_PIN_LOCKED"),
    (0x0000_00B0, "CKR_SESSION_CLOSED"),
    (0x0000_00B1, "CKR_SESSION_COUNT"),
    (0x0000_00B3, "CKR_SESSION_HANDLE_INVALID"),
    (0x0000_00B4, "CKR_SESSION_PARALLEL_NOT_SUPPORTED"),
    (0x0000_00B5, "CKR_SESSION_READ_ONLY"),
    (0x0000_00B6, "CKR_SESSION_EXISTS"),
    (0x0000_00B7, "CKR_SESSION_READ_ONLY_EXISTS"),
    (0x0000_00B8, "CKR_SESSION_READ_WRITE_SO_EXISTS"),
    (0x0000_00C0, "CKR_SIGNATURE_INVALID"),
    (0x0000_00C1, "CKR_SIGNATURE_LEN_RANGE"),
    (0x0000_00D0, "CKR_TEMPLATE_INCOMPLETE"),
    (0x0000_00D1, "CKR_TEMPLATE_INCONSISTENT"),
    (0x0000_00E0, "CKR_TOKEN_NOT_PRESENT"),
    (0x0000_00E1, "CKR_TOKEN_NOT_RECOGNIZED"),
    (0x0000_00E2, "CKR_TOKEN_WRITE_PROTECTED"),
    (0x0000_00F0, "CKR_UNWRAPPING_KEY_HANDLE_INVALID"),
    (0x0000_00F1, "CKR_UNWRAPPING_KEY_SIZE_RANGE"),
    (0x0000_00F2, "CKR_UNWRAPPING_KEY_TYPE_INCONSISTENT"),
    (0x0000_0100, "CKR_USER_ALREADY_LOGGED_IN"),
    (0x0000_0101, "CKR_USER_NOT_LOGGED_IN"),
    (0x0000_0102, "CKR_USER_PIN_NOT_INITIALIZED"),
    (0x0000_0103, "CKR_USER_TYPE_INVALID"),
    (0x0000_0104, "CKR_USER_ANOTHER_ALREADY_LOGGED_IN"),
    (0x0000_0105, "CKR_USER_TOO_MANY_TYPES"),
    (0x0000_0110, "CKR_WRAPPED_KEY_INVALID"),
    (0x0000_0112, "CKR_WRAPPED_KEY_LEN_RANGE"),
    (0x0000_0113, "CKR_WRAPPING_KEY_HANDLE_INVALID"),
    (0x0000_0114, "CKR_WRAPPING_KEY_SIZE_RANGE"),
    (0x0000_0115, "CKR_WRAPPING_KEY_TYPE_INCONSISTENT"),
    (0x0000_0120, "CKR_RANDOM_SEED_NOT_SUPPORTED"),
    (0x0000_0121, "CKR_RANDOM_NO_RNG"),
    (0x0000_0130, "CKR_DOMAIN_PARAMS_INVALID"),
    (0x0000_0140, "CKR_CURVE_NOT_SUPPORTED"),
    (0x0000_0150, "CKR_BUFFER_TOO_SMALL"),
    (0x0000_0160, "CKR_SAVED_STATE_INVALID"),
    (0x0000_0170, "CKR_INFORMATION_SENSITIVE"),
    (0x0000_0180, "CKR_STATE_UNSAVEABLE"),
    (0x0000_0190, "CKR_CRYPTOKI_NOT_INITIALIZED"),
    (0x0000_0191, "CKR_CRYPTOKI_ALREADY_INITIALIZED"),
    (0x0000_01A0, "CKR_MUTEX_BAD"),
    (0x0000_01A1, "CKR_MUTEX_NOT_LOCKED"),
    (0x0000_01B0, "CKR_NEW_PIN_MODE"),
    (0x0000_01B1, "CKR_NEXT_OTP"),
    (0x0000_01B5, "CKR_EXCEEDED_MAX_ITERATIONS"),
    (0x0000_01B6, "CKR_FIPS_SELF_TEST_FAILED"),
    (0x0000_01B7, "CKR_LIBRARY_LOAD_FAILED"),
    (0x0000_01B8, "CKR_PIN_TOO_WEAK"),
    (0x0000_01B9, "CKR_PUBLIC_KEY_INVALID"),
    (0x0000_0200, "CKR_FUNCTION_REJECTED"),
];

impl ReturnValue {
    pub fn is_ok(self) -> bool {
        self.0 == CKR_OK as CK_RV
    }

    pub fn name(self) -> Option<&'static str> {
        NAMES
            .iter()
            .find(|(value, _)| *value == self.0)
            .map(|(_, name)| *name)
    }
}

impl fmt::Display for ReturnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({:#x})", self.0),
            None if self.0 >= CKR_VENDOR_DEFINED as CK_RV => {
                write!(f, "CKR_VENDOR_DEFINED+{:#x}", self.0 - CKR_VENDOR_DEFINED as CK_RV)
            }
            None => write!(f, "CKR_UNKNOWN ({:#x})", self.0),
        }
    }
}
