use std::path::PathBuf;

use thiserror::Error;

use crate::rv::ReturnValue;

pub type ProbeResult<T> = Result<T, ProbeError>;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("failed to load PKCS#11 library {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },
    #[error("{function} failed: {rv}")]
    Pkcs11 {
        function: &'static str,
        rv: ReturnValue,
    },
    #[error("{0} is not provided by the PKCS#11 module")]
    FunctionNotSupported(&'static str),
    #[error("no such algorithm: {0}")]
    NoSuchAlgorithm(String),
    #[error("invalid algorithm parameter: {0}")]
    InvalidParameter(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("illegal block size: {0}")]
    IllegalBlockSize(String),
    #[error("bad padding")]
    BadPadding,
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("keystore error: {0}")]
    KeyStore(String),
    #[error("unrecoverable key: {0}")]
    UnrecoverableKey(String),
    #[error("cryptography error: {0}")]
    Crypto(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProbeError {
    pub fn config<E: std::fmt::Display>(err: E) -> Self {
        Self::Config(err.to_string())
    }
    pub fn crypto<E: std::fmt::Display>(err: E) -> Self {
        Self::Crypto(err.to_string())
    }
    pub fn invalid_parameter<E: std::fmt::Display>(err: E) -> Self {
        Self::InvalidParameter(err.to_string())
    }
    pub fn no_such_algorithm<E: std::fmt::Display>(err: E) -> Self {
        Self::NoSuchAlgorithm(err.to_string())
    }
    pub fn keystore<E: std::fmt::Display>(err: E) -> Self {
        Self::KeyStore(err.to_string())
    }

    /// The PKCS#11 return value carried by this error, if any.
    pub fn return_value(&self) -> Option<ReturnValue> {
        match self {
            Self::Pkcs11 { rv, .. } => Some(*rv),
            _ => None,
        }
    }
}
