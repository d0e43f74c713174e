//! Core of p11probe, a smoke test for PKCS#11 providers.
//!
//! A [`provider::Provider`] is either a PKCS#11 module loaded through a
//! SunPKCS11-style configuration file ([`pkcs11::Pkcs11Provider`]) or the
//! built-in RustCrypto implementation ([`soft::SoftProvider`]). The
//! [`driver`] runs the digest, random, keystore and AES tests against it and
//! writes a human-readable report.

#[macro_use]
extern crate lazy_static;

pub mod cipher;
pub mod config;
pub mod driver;
pub mod error;
pub mod keystore;
pub mod mechanism;
pub mod module;
pub mod pkcs11;
pub mod provider;
pub mod rv;
pub mod session;
pub mod soft;
pub mod transformation;

pub use config::ProviderConfig;
pub use driver::{run, run_loaded, Outcome, ProbeSettings};
pub use error::{ProbeError, ProbeResult};
pub use keystore::{KeyStore, Pin};
pub use pkcs11::Pkcs11Provider;
pub use provider::Provider;
pub use soft::SoftProvider;
