//! A single-part cipher front-end over a [`Provider`].
//!
//! Usage follows get-instance / init / do-final: a [`Cipher`] is obtained for
//! a transformation, initialised for a direction with a key and optional
//! parameters, then run over a complete buffer.

use tracing::trace;

use crate::{
    error::{ProbeError, ProbeResult},
    provider::{CipherParams, Provider},
    transformation::{Mode, Transformation},
};

pub use crate::transformation::Direction;

pub const GCM_TAG_BITS: usize = 128;

/// Algorithm parameters supplied to [`Cipher::init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmParams<'a> {
    Iv(&'a [u8]),
    Gcm { iv: &'a [u8], tag_bits: usize },
}

struct Initialized<K> {
    direction: Direction,
    key: K,
    iv: Option<Vec<u8>>,
    tag_bits: usize,
    aad: Vec<u8>,
    consumed: bool,
}

pub struct Cipher<'p, P: Provider> {
    provider: &'p P,
    transformation: Transformation,
    state: Option<Initialized<P::Key>>,
    /// Key and IV of the last GCM encryption set up on this cipher.
    last_gcm_encryption: Option<(P::Key, Vec<u8>)>,
}

impl<'p, P: Provider> Cipher<'p, P> {
    /// Fails with [`ProbeError::NoSuchAlgorithm`] if the transformation is
    /// malformed or the provider cannot serve it.
    pub fn get_instance(provider: &'p P, transformation: &str) -> ProbeResult<Self> {
        let transformation: Transformation = transformation.parse()?;
        provider.ensure_supported(&transformation)?;
        Ok(Self {
            provider,
            transformation,
            state: None,
            last_gcm_encryption: None,
        })
    }

    pub fn algorithm(&self) -> String {
        self.transformation.to_string()
    }

    pub fn transformation(&self) -> Transformation {
        self.transformation
    }

    pub fn block_size(&self) -> usize {
        self.transformation.block_size()
    }

    pub fn init(
        &mut self,
        direction: Direction,
        key: &P::Key,
        params: Option<AlgorithmParams<'_>>,
    ) -> ProbeResult<()> {
        let t = self.transformation;
        let (iv, tag_bits) = match (t.mode, params) {
            (Mode::Ecb, None) => (None, GCM_TAG_BITS),
            (Mode::Ecb, Some(_)) => {
                return Err(ProbeError::invalid_parameter(format!(
                    "{t} does not take parameters"
                )))
            }
            (Mode::Gcm, Some(AlgorithmParams::Gcm { iv, tag_bits })) => {
                check_tag_bits(tag_bits)?;
                (Some(check_iv(t, iv)?.to_vec()), tag_bits)
            }
            (Mode::Cbc | Mode::Ctr, Some(AlgorithmParams::Gcm { .. })) => {
                return Err(ProbeError::invalid_parameter(format!(
                    "{t} does not take GCM parameters"
                )))
            }
            (_, Some(AlgorithmParams::Iv(iv))) => (Some(check_iv(t, iv)?.to_vec()), GCM_TAG_BITS),
            (_, None) => match direction {
                Direction::Encrypt => {
                    let len = t.default_iv_len().unwrap_or_default();
                    (Some(self.provider.generate_random(len)?), GCM_TAG_BITS)
                }
                Direction::Decrypt => {
                    return Err(ProbeError::invalid_parameter(format!(
                        "{t} decryption needs an IV"
                    )))
                }
            },
        };
        if t.is_aead() && direction == Direction::Encrypt {
            if let Some(iv) = &iv {
                let reused = self
                    .last_gcm_encryption
                    .as_ref()
                    .is_some_and(|(last_key, last_iv)| last_key == key && last_iv == iv);
                if reused {
                    return Err(ProbeError::invalid_parameter(
                        "cannot reuse IV for GCM encryption",
                    ));
                }
                self.last_gcm_encryption = Some((key.clone(), iv.clone()));
            }
        }
        trace!(transformation = %t, ?direction, "cipher initialised");
        self.state = Some(Initialized {
            direction,
            key: key.clone(),
            iv,
            tag_bits,
            aad: Vec::new(),
            consumed: false,
        });
        Ok(())
    }

    /// The IV in use, including one generated during [`Cipher::init`].
    pub fn iv(&self) -> Option<&[u8]> {
        self.state.as_ref().and_then(|state| state.iv.as_deref())
    }

    pub fn update_aad(&mut self, aad: &[u8]) -> ProbeResult<()> {
        if !self.transformation.is_aead() {
            return Err(ProbeError::IllegalState(format!(
                "{} does not accept additional authenticated data",
                self.transformation
            )));
        }
        let state = self.state_mut()?;
        state.aad.extend_from_slice(aad);
        Ok(())
    }

    pub fn do_final(&mut self, input: &[u8]) -> ProbeResult<Vec<u8>> {
        let provider = self.provider;
        let transformation = self.transformation;
        let state = self.state_mut()?;
        if state.consumed {
            return Err(ProbeError::IllegalState(
                "GCM encryption must be re-initialised with a new IV".to_string(),
            ));
        }
        transformation.check_input_len(state.direction, input.len())?;
        let params = CipherParams {
            transformation,
            iv: state.iv.as_deref(),
            aad: &state.aad,
            tag_bits: state.tag_bits,
        };
        let output = match state.direction {
            Direction::Encrypt => provider.encrypt(&state.key, &params, input),
            Direction::Decrypt => provider.decrypt(&state.key, &params, input),
        }?;
        state.aad.clear();
        if transformation.is_aead() && state.direction == Direction::Encrypt {
            state.consumed = true;
        }
        Ok(output)
    }

    fn state_mut(&mut self) -> ProbeResult<&mut Initialized<P::Key>> {
        self.state
            .as_mut()
            .ok_or_else(|| ProbeError::IllegalState("cipher not initialised".to_string()))
    }
}

fn check_iv(transformation: Transformation, iv: &[u8]) -> ProbeResult<&[u8]> {
    let valid = match transformation.mode {
        Mode::Gcm => !iv.is_empty(),
        _ => iv.len() == transformation.block_size(),
    };
    if !valid {
        return Err(ProbeError::invalid_parameter(format!(
            "{transformation}: IV of {} bytes",
            iv.len()
        )));
    }
    Ok(iv)
}

fn check_tag_bits(tag_bits: usize) -> ProbeResult<()> {
    match tag_bits {
        96 | 104 | 112 | 120 | 128 => Ok(()),
        _ => Err(ProbeError::invalid_parameter(format!(
            "unsupported GCM tag length {tag_bits}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{keystore::Pin, soft::SoftProvider, transformation::AES_BLOCK_CIPHERS};

    const PLAIN: &[u8] = b"Hello, world!!!!";

    fn provider() -> SoftProvider {
        SoftProvider::new(Pin::from("pin"))
    }

    #[test]
    fn round_trips_with_generated_iv() {
        let provider = provider();
        let key = provider.generate_secret_key(128).unwrap();
        for text in AES_BLOCK_CIPHERS {
            let mut enc = Cipher::get_instance(&provider, text).unwrap();
            enc.init(Direction::Encrypt, &key, None).unwrap();
            assert_eq!(enc.block_size(), 16);
            assert_eq!(enc.algorithm(), text);
            let iv = enc.iv().map(<[u8]>::to_vec);
            assert_eq!(iv.is_some(), !text.contains("ECB"), "{text}");
            let ct = enc.do_final(PLAIN).unwrap();

            let mut dec = Cipher::get_instance(&provider, text).unwrap();
            dec.init(Direction::Decrypt, &key, iv.as_deref().map(AlgorithmParams::Iv))
                .unwrap();
            assert_eq!(dec.do_final(&ct).unwrap(), PLAIN, "{text}");
        }
    }

    #[test]
    fn gcm_encryptor_is_single_use() {
        let provider = provider();
        let key = provider.generate_secret_key(128).unwrap();
        let iv: Vec<u8> = (0u8..12).collect();
        let aad: Vec<u8> = (0u8..20).collect();
        let mut enc = Cipher::get_instance(&provider, "AES/GCM/NoPadding").unwrap();
        enc.init(
            Direction::Encrypt,
            &key,
            Some(AlgorithmParams::Gcm {
                iv: &iv,
                tag_bits: 128,
            }),
        )
        .unwrap();
        enc.update_aad(&aad).unwrap();
        let ct = enc.do_final(PLAIN).unwrap();
        assert_eq!(ct.len(), PLAIN.len() + 16);
        assert!(matches!(
            enc.do_final(PLAIN),
            Err(ProbeError::IllegalState(_))
        ));

        let mut dec = Cipher::get_instance(&provider, "AES/GCM/NoPadding").unwrap();
        dec.init(
            Direction::Decrypt,
            &key,
            Some(AlgorithmParams::Gcm {
                iv: &iv,
                tag_bits: 128,
            }),
        )
        .unwrap();
        dec.update_aad(&aad).unwrap();
        assert_eq!(dec.do_final(&ct).unwrap(), PLAIN);
    }

    #[test]
    fn gcm_encryption_refuses_repeated_key_and_iv() {
        let provider = provider();
        let key = provider.generate_secret_key(128).unwrap();
        let other = provider.generate_secret_key(128).unwrap();
        fn gcm(iv: &[u8]) -> Option<AlgorithmParams<'_>> {
            Some(AlgorithmParams::Gcm {
                iv,
                tag_bits: GCM_TAG_BITS,
            })
        }
        let mut enc = Cipher::get_instance(&provider, "AES/GCM/NoPadding").unwrap();
        enc.init(Direction::Encrypt, &key, gcm(&[0; 12])).unwrap();
        enc.do_final(b"one").unwrap();

        assert!(matches!(
            enc.init(Direction::Encrypt, &key, gcm(&[0; 12])),
            Err(ProbeError::InvalidParameter(_))
        ));
        assert!(matches!(enc.do_final(b"two"), Err(ProbeError::IllegalState(_))));

        enc.init(Direction::Encrypt, &other, gcm(&[0; 12])).unwrap();
        enc.do_final(b"two").unwrap();
        enc.init(Direction::Encrypt, &key, gcm(&[1; 12])).unwrap();
        enc.do_final(b"three").unwrap();
        enc.init(Direction::Decrypt, &key, gcm(&[1; 12])).unwrap();
    }

    #[test]
    fn parameter_validation() {
        let provider = provider();
        let key = provider.generate_secret_key(128).unwrap();

        let mut ecb = Cipher::get_instance(&provider, "AES/ECB/NoPadding").unwrap();
        assert!(ecb
            .init(Direction::Encrypt, &key, Some(AlgorithmParams::Iv(&[0; 16])))
            .is_err());
        ecb.init(Direction::Encrypt, &key, None).unwrap();
        assert!(matches!(
            ecb.do_final(b"not sixteen"),
            Err(ProbeError::IllegalBlockSize(_))
        ));
        assert!(matches!(ecb.update_aad(b"x"), Err(ProbeError::IllegalState(_))));

        let mut cbc = Cipher::get_instance(&provider, "AES/CBC/NoPadding").unwrap();
        assert!(matches!(
            cbc.init(Direction::Decrypt, &key, None),
            Err(ProbeError::InvalidParameter(_))
        ));
        assert!(cbc
            .init(Direction::Encrypt, &key, Some(AlgorithmParams::Iv(&[0; 8])))
            .is_err());
        assert!(matches!(cbc.do_final(PLAIN), Err(ProbeError::IllegalState(_))));

        let mut gcm = Cipher::get_instance(&provider, "AES/GCM/NoPadding").unwrap();
        assert!(gcm
            .init(
                Direction::Encrypt,
                &key,
                Some(AlgorithmParams::Gcm {
                    iv: &[0; 12],
                    tag_bits: 64
                })
            )
            .is_err());
    }

    #[test]
    fn unknown_transformations_are_rejected() {
        let provider = provider();
        assert!(matches!(
            Cipher::get_instance(&provider, "AES/XTS/NoPadding"),
            Err(ProbeError::NoSuchAlgorithm(_))
        ));
    }
}
