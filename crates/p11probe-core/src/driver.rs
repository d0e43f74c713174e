//! The smoke test itself: provider banner, digest, random, AES block ciphers
//! and AES-GCM, reported on a writer.
//!
//! Individual failures are logged and the run moves on to the next test. The
//! only result that changes the outcome is a decrypted buffer that differs
//! from its plaintext.

use std::io::Write;

use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::{
    cipher::{AlgorithmParams, Cipher, Direction, GCM_TAG_BITS},
    error::{ProbeError, ProbeResult},
    keystore::{KeyStore, Pin},
    mechanism::MechanismLabel,
    provider::{DigestAlgorithm, Provider},
    transformation::{AES_BLOCK_CIPHERS, AES_GCM},
};

pub const DIGEST_INPUT: &[u8] = b"Hello, world!";
pub const DIGEST_ALGORITHM: &str = "SHA-256";
pub const PLAINTEXT: &[u8] = b"Hello, world!!!!";
pub const DEFAULT_PIN: &str = "pin";
pub const DEFAULT_ALIAS: &str = "AES key";
pub const DEFAULT_KEY_BITS: usize = 128;
pub const RANDOM_LEN: usize = 16;
pub const GCM_IV_LEN: usize = 12;
pub const GCM_AAD_LEN: usize = 20;

#[derive(Debug, Clone)]
pub struct ProbeSettings {
    /// Keystore PIN, also used as the key entry PIN.
    pub pin: Pin,
    pub alias: String,
    pub key_bits: usize,
    pub list_mechanisms: bool,
    /// Delete the key entry once the cipher tests are done.
    pub remove_key: bool,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            pin: Pin::from(DEFAULT_PIN),
            alias: DEFAULT_ALIAS.to_string(),
            key_bits: DEFAULT_KEY_BITS,
            list_mechanisms: false,
            remove_key: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// A round trip produced something other than the plaintext.
    Mismatch { transformation: String },
}

impl Outcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            Outcome::Completed => 0,
            Outcome::Mismatch { .. } => 1,
        }
    }
}

/// Runs the probe against a provider that may have failed to load. A load
/// failure is logged and the run completes without testing anything.
pub fn run_loaded<P, W>(
    provider: ProbeResult<P>,
    settings: &ProbeSettings,
    out: &mut W,
) -> ProbeResult<Outcome>
where
    P: Provider,
    W: Write,
{
    match provider {
        Ok(provider) => run(&provider, settings, out),
        Err(err) => {
            error!("{}", error_chain(&err));
            Ok(Outcome::Completed)
        }
    }
}

/// Runs every test against `provider`. Only failures to write the report
/// are returned as errors.
pub fn run<P, W>(provider: &P, settings: &ProbeSettings, out: &mut W) -> ProbeResult<Outcome>
where
    P: Provider,
    W: Write,
{
    let mut probe = Probe {
        provider,
        settings,
        out,
    };
    probe.banner()?;
    if settings.list_mechanisms {
        probe.list_mechanisms()?;
    }
    probe.message_digest()?;
    probe.random()?;
    let outcome = probe.aes()?;
    probe.out.flush()?;
    Ok(outcome)
}

/// Renders an error followed by its sources.
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !text.contains(&cause_text) {
            text.push_str(": ");
            text.push_str(&cause_text);
        }
        source = cause.source();
    }
    text
}

struct Probe<'a, P: Provider, W: Write> {
    provider: &'a P,
    settings: &'a ProbeSettings,
    out: &'a mut W,
}

/// Splits report-writing failures, which end the run, from everything
/// else, which is logged.
fn io_error(err: ProbeError) -> Result<ProbeError, ProbeError> {
    match err {
        ProbeError::Io(_) => Err(err),
        other => Ok(other),
    }
}

impl<'a, P: Provider, W: Write> Probe<'a, P, W> {
    fn banner(&mut self) -> ProbeResult<()> {
        writeln!(self.out, "Provider: {}:", self.provider.name())?;
        match self.provider.info() {
            Ok(info) => writeln!(self.out, "{info}")?,
            Err(err) => warn!(provider = self.provider.name(), "provider info: {err}"),
        }
        Ok(())
    }

    fn list_mechanisms(&mut self) -> ProbeResult<()> {
        match self.provider.mechanisms() {
            Ok(mechanisms) => {
                writeln!(self.out, "Mechanisms:")?;
                for mechanism in mechanisms {
                    writeln!(self.out, "  {}", MechanismLabel(mechanism))?;
                }
            }
            Err(err) => error!("Mechanisms: {err}"),
        }
        Ok(())
    }

    fn message_digest(&mut self) -> ProbeResult<()> {
        let algorithm: DigestAlgorithm = DIGEST_ALGORITHM.parse()?;
        writeln!(self.out, "MessageDigest: {algorithm}")?;
        match self.provider.digest(algorithm, DIGEST_INPUT) {
            Ok(digest) => {
                writeln!(self.out, "digest: {}", hex::encode(&digest))?;
                let reference = Sha256::digest(DIGEST_INPUT);
                if digest.as_slice() != reference.as_slice() {
                    warn!(
                        expected = %hex::encode(reference),
                        "{algorithm} digest differs from the software reference"
                    );
                }
            }
            Err(err) => error!("MessageDigest: {err}"),
        }
        Ok(())
    }

    fn random(&mut self) -> ProbeResult<()> {
        match self.provider.generate_random(RANDOM_LEN) {
            Ok(bytes) => writeln!(self.out, "random: {}", hex::encode(bytes))?,
            Err(err) => error!("SecureRandom: {err}"),
        }
        Ok(())
    }

    fn aes(&mut self) -> ProbeResult<Outcome> {
        writeln!(self.out, "Creating AES secret key")?;
        let (keystore, key) = match self.create_key() {
            Ok(created) => created,
            Err(err) => {
                error!("Creating AES key failed: {err}");
                return Ok(Outcome::Completed);
            }
        };
        writeln!(self.out, "key: {key}")?;
        let key = match self.store_and_reload(&keystore, &key) {
            Ok(key) => key,
            Err(err) => {
                error!("Creating AES key failed: {err}");
                return Ok(Outcome::Completed);
            }
        };

        writeln!(self.out, "Testing AES block ciphers")?;
        for transformation in AES_BLOCK_CIPHERS {
            writeln!(self.out, "- {transformation}")?;
            match self.block_cipher(transformation, &key) {
                Ok(true) => {}
                Ok(false) => {
                    error!("decrypted does not match plaintext");
                    return Ok(Outcome::Mismatch {
                        transformation: transformation.to_string(),
                    });
                }
                Err(err) => {
                    let err = io_error(err)?;
                    error!("Cipher '{transformation}' failed: {err}");
                }
            }
        }

        writeln!(self.out, "Testing AES GCM")?;
        if let Err(err) = self.gcm(&key) {
            let err = io_error(err)?;
            error!("AES GCM: {err}");
        }

        if self.settings.remove_key {
            match keystore.delete_entry(&self.settings.alias) {
                Ok(true) => info!(alias = %self.settings.alias, "removed key entry"),
                Ok(false) => debug!(alias = %self.settings.alias, "no key entry to remove"),
                Err(err) => error!("Removing AES key failed: {err}"),
            }
        }
        Ok(Outcome::Completed)
    }

    fn create_key(&self) -> ProbeResult<(KeyStore<'a, P>, P::Key)> {
        let keystore = KeyStore::load(self.provider, &self.settings.pin)?;
        let key = self.provider.generate_secret_key(self.settings.key_bits)?;
        Ok((keystore, key))
    }

    fn store_and_reload(&self, keystore: &KeyStore<'a, P>, key: &P::Key) -> ProbeResult<P::Key> {
        let alias = &self.settings.alias;
        let pin = &self.settings.pin;
        keystore.set_key_entry(alias, key, pin)?;
        keystore
            .get_key(alias, pin)?
            .ok_or_else(|| ProbeError::keystore(format!("no key entry under {alias:?}")))
    }

    /// Returns whether the decrypted buffer matched the plaintext.
    fn block_cipher(&mut self, transformation: &str, key: &P::Key) -> ProbeResult<bool> {
        let mut encrypt = Cipher::get_instance(self.provider, transformation)?;
        encrypt.init(Direction::Encrypt, key, None)?;
        let iv = encrypt.iv().map(<[u8]>::to_vec);
        let mut decrypt = Cipher::get_instance(self.provider, transformation)?;
        decrypt.init(Direction::Decrypt, key, iv.as_deref().map(AlgorithmParams::Iv))?;
        self.round_trip(&mut encrypt, Some(&mut decrypt))
    }

    fn gcm(&mut self, key: &P::Key) -> ProbeResult<bool> {
        let mut cipher = Cipher::get_instance(self.provider, AES_GCM)?;
        let iv = counting_bytes(GCM_IV_LEN);
        let aad = counting_bytes(GCM_AAD_LEN);
        cipher.init(
            Direction::Encrypt,
            key,
            Some(AlgorithmParams::Gcm {
                iv: &iv,
                tag_bits: GCM_TAG_BITS,
            }),
        )?;
        cipher.update_aad(&aad)?;
        self.round_trip(&mut cipher, None)
    }

    fn round_trip(
        &mut self,
        encrypt: &mut Cipher<'a, P>,
        decrypt: Option<&mut Cipher<'a, P>>,
    ) -> ProbeResult<bool> {
        writeln!(self.out, "  - cipher   : {}", encrypt.algorithm())?;
        writeln!(self.out, "  - blockSize: {}", encrypt.block_size())?;
        if let Some(iv) = encrypt.iv() {
            writeln!(self.out, "  - IV       : {}", hex::encode(iv))?;
        }
        let encrypted = encrypt.do_final(PLAINTEXT)?;
        writeln!(self.out, "  - plain    : {}", hex::encode(PLAINTEXT))?;
        writeln!(self.out, "  - encrypted: {}", hex::encode(&encrypted))?;

        let Some(decrypt) = decrypt else {
            return Ok(true);
        };
        let decrypted = decrypt.do_final(&encrypted)?;
        writeln!(self.out, "  - decrypted: {}", hex::encode(&decrypted))?;
        Ok(decrypted == PLAINTEXT)
    }
}

/// `len` bytes counting up from zero.
fn counting_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| i as u8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        provider::{CipherParams, ProviderInfo},
        soft::{SoftKey, SoftProvider},
        transformation::{Mode, Transformation},
    };
    use cryptoki_sys::CK_MECHANISM_TYPE;

    fn soft() -> SoftProvider {
        SoftProvider::new(Pin::from(DEFAULT_PIN))
    }

    fn report<P: Provider>(provider: &P, settings: &ProbeSettings) -> (Outcome, String) {
        let mut out = Vec::new();
        let outcome = run(provider, settings, &mut out).unwrap();
        (outcome, String::from_utf8(out).unwrap())
    }

    /// Delegates to a soft provider, optionally failing one mode or
    /// corrupting decryption output.
    struct Faulty {
        inner: SoftProvider,
        fail_mode: Option<Mode>,
        corrupt: bool,
    }

    impl Provider for Faulty {
        type Key = SoftKey;

        fn name(&self) -> &str {
            "faulty"
        }
        fn info(&self) -> ProbeResult<ProviderInfo> {
            self.inner.info()
        }
        fn mechanisms(&self) -> ProbeResult<Vec<CK_MECHANISM_TYPE>> {
            self.inner.mechanisms()
        }
        fn ensure_supported(&self, transformation: &Transformation) -> ProbeResult<()> {
            if Some(transformation.mode) == self.fail_mode {
                return Err(ProbeError::no_such_algorithm(transformation));
            }
            Ok(())
        }
        fn digest(&self, algorithm: DigestAlgorithm, data: &[u8]) -> ProbeResult<Vec<u8>> {
            self.inner.digest(algorithm, data)
        }
        fn generate_random(&self, len: usize) -> ProbeResult<Vec<u8>> {
            self.inner.generate_random(len)
        }
        fn login(&self, pin: &Pin) -> ProbeResult<()> {
            self.inner.login(pin)
        }
        fn generate_secret_key(&self, bits: usize) -> ProbeResult<SoftKey> {
            self.inner.generate_secret_key(bits)
        }
        fn persist_key(&self, key: &SoftKey, alias: &str) -> ProbeResult<SoftKey> {
            self.inner.persist_key(key, alias)
        }
        fn find_keys(&self, alias: &str) -> ProbeResult<Vec<SoftKey>> {
            self.inner.find_keys(alias)
        }
        fn key_aliases(&self) -> ProbeResult<Vec<String>> {
            self.inner.key_aliases()
        }
        fn destroy_key(&self, key: &SoftKey) -> ProbeResult<()> {
            self.inner.destroy_key(key)
        }
        fn encrypt(
            &self,
            key: &SoftKey,
            params: &CipherParams<'_>,
            data: &[u8],
        ) -> ProbeResult<Vec<u8>> {
            self.inner.encrypt(key, params, data)
        }
        fn decrypt(
            &self,
            key: &SoftKey,
            params: &CipherParams<'_>,
            data: &[u8],
        ) -> ProbeResult<Vec<u8>> {
            let mut plain = self.inner.decrypt(key, params, data)?;
            if self.corrupt {
                plain[0] ^= 0xff;
            }
            Ok(plain)
        }
    }

    #[test]
    fn soft_provider_report() {
        let (outcome, text) = report(&soft(), &ProbeSettings::default());
        assert_eq!(outcome, Outcome::Completed);
        assert!(text.starts_with("Provider: p11probe-soft:\n"));
        assert!(text.contains("MessageDigest: SHA-256\n"));
        assert!(text.contains(
            "digest: 315f5bdb76d078c43b8ac0064e4a0164612b1fce77c869345bfc94c75894edd3\n"
        ));
        assert!(text.contains("Creating AES secret key\nkey: AES secret key, 16 bytes"));
        for transformation in AES_BLOCK_CIPHERS {
            assert!(text.contains(&format!("- {transformation}\n")));
        }
        assert_eq!(text.matches("  - decrypted: 48656c6c6f2c20776f726c6421212121\n").count(), 5);
        // CBC and CTR print an IV, ECB does not, GCM prints the fixed one.
        assert_eq!(text.matches("  - IV       : ").count(), 4);
        assert!(text.contains("Testing AES GCM\n  - cipher   : AES/GCM/NoPadding\n"));
        assert!(text.contains("  - IV       : 000102030405060708090a0b\n"));
        assert!(text.contains("  - blockSize: 16\n"));
    }

    #[test]
    fn key_entry_is_kept_unless_removal_requested() {
        let provider = soft();
        report(&provider, &ProbeSettings::default());
        assert_eq!(provider.find_keys(DEFAULT_ALIAS).unwrap().len(), 1);

        let settings = ProbeSettings {
            remove_key: true,
            ..ProbeSettings::default()
        };
        report(&provider, &settings);
        assert!(provider.find_keys(DEFAULT_ALIAS).unwrap().is_empty());
    }

    #[test]
    fn corrupted_decryption_is_a_mismatch() {
        let provider = Faulty {
            inner: soft(),
            fail_mode: None,
            corrupt: true,
        };
        let (outcome, text) = report(&provider, &ProbeSettings::default());
        assert_eq!(
            outcome,
            Outcome::Mismatch {
                transformation: "AES/CBC/NoPadding".to_string()
            }
        );
        assert_eq!(outcome.exit_code(), 1);
        assert!(!text.contains("AES/CBC/PKCS5Padding"));
        assert!(!text.contains("Testing AES GCM"));
    }

    #[test]
    fn failing_transformation_does_not_stop_the_run() {
        let provider = Faulty {
            inner: soft(),
            fail_mode: Some(Mode::Ecb),
            corrupt: false,
        };
        let (outcome, text) = report(&provider, &ProbeSettings::default());
        assert_eq!(outcome, Outcome::Completed);
        assert!(text.contains("- AES/ECB/NoPadding\n- AES/ECB/PKCS5Padding\n- AES/CTR/NoPadding"));
        assert_eq!(text.matches("  - decrypted: ").count(), 3);
        assert!(text.contains("Testing AES GCM"));
    }

    #[test]
    fn wrong_pin_ends_the_cipher_test() {
        let settings = ProbeSettings {
            pin: Pin::from("wrong"),
            ..ProbeSettings::default()
        };
        let (outcome, text) = report(&soft(), &settings);
        assert_eq!(outcome, Outcome::Completed);
        assert!(text.contains("digest: "));
        assert!(text.ends_with("Creating AES secret key\n"));
    }

    #[test]
    fn mechanisms_are_listed_on_request() {
        let settings = ProbeSettings {
            list_mechanisms: true,
            ..ProbeSettings::default()
        };
        let (_, text) = report(&soft(), &settings);
        assert!(text.contains("Mechanisms:\n"));
        assert!(text.contains("  CKM_AES_GCM (0x1087)\n"));
    }

    #[test]
    fn load_failure_is_logged_not_fatal() {
        let mut out = Vec::new();
        let outcome = run_loaded::<SoftProvider, _>(
            Err(ProbeError::config("pkcs11.cfg: No such file or directory")),
            &ProbeSettings::default(),
            &mut out,
        )
        .unwrap();
        assert_eq!(outcome, Outcome::Completed);
        assert!(out.is_empty());
    }

    #[test]
    fn counting_bytes_start_at_zero() {
        assert_eq!(hex::encode(counting_bytes(GCM_IV_LEN)), "000102030405060708090a0b");
        assert_eq!(counting_bytes(GCM_AAD_LEN).len(), 20);
    }
}
