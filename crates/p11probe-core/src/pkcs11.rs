//! A [`Provider`] backed by a PKCS#11 module.

use std::{fmt, path::Path, sync::Arc};

use cryptoki_sys::{
    CKA_CLASS, CKA_DECRYPT, CKA_ENCRYPT, CKA_KEY_TYPE, CKA_LABEL, CKA_TOKEN, CKA_VALUE_LEN,
    CKK_AES, CKM_AES_CBC, CKM_AES_CBC_PAD, CKM_AES_CTR, CKM_AES_ECB, CKM_AES_GCM,
    CKM_AES_KEY_GEN, CKM_SHA224, CKM_SHA256, CKM_SHA384, CKM_SHA512, CKM_SHA_1,
    CKO_SECRET_KEY, CK_ATTRIBUTE_TYPE, CK_MECHANISM_TYPE, CK_OBJECT_HANDLE, CK_SLOT_ID, CK_ULONG,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    config::{ProviderConfig, SlotSelector},
    error::{ProbeError, ProbeResult},
    keystore::Pin,
    mechanism::MechanismLabel,
    module::{padded_string, version_string, Module},
    provider::{check_aes_key_bits, CipherParams, DigestAlgorithm, Provider, ProviderInfo},
    session::{Mechanism, MechanismParam, Session, Template},
    transformation::{
        pkcs5_pad, pkcs5_unpad, Direction, Mode, Padding, Transformation, AES_BLOCK_SIZE,
    },
};

const CTR_COUNTER_BITS: CK_ULONG = 128;

/// Handle to an AES secret key object on the token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pkcs11Key {
    handle: CK_OBJECT_HANDLE,
    len: usize,
    token: bool,
    label: Option<String>,
}

impl Pkcs11Key {
    pub fn handle(&self) -> CK_OBJECT_HANDLE {
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

impl fmt::Display for Pkcs11Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PKCS#11 AES secret key, {} bits (handle {}, {} object",
            self.bits(),
            self.handle,
            if self.token { "token" } else { "session" }
        )?;
        if let Some(label) = &self.label {
            write!(f, ", label {label:?}")?;
        }
        f.write_str(")")
    }
}

pub struct Pkcs11Provider {
    name: String,
    config: ProviderConfig,
    module: Arc<Module>,
    slot: CK_SLOT_ID,
    mechanisms: Vec<CK_MECHANISM_TYPE>,
    session: Mutex<Session>,
}

impl Pkcs11Provider {
    /// Reads a provider configuration file and configures the provider.
    pub fn from_config_file(path: &Path) -> ProbeResult<Self> {
        Self::configure(ProviderConfig::load(path)?)
    }

    pub fn configure(config: ProviderConfig) -> ProbeResult<Self> {
        let module = Module::load(&config)?;
        let slot = select_slot(&module, config.slot)?;
        let mechanisms: Vec<CK_MECHANISM_TYPE> = module
            .mechanisms(slot)?
            .into_iter()
            .filter(|mechanism| {
                let allowed = config.mechanism_allowed(*mechanism);
                if !allowed {
                    debug!(mechanism = %MechanismLabel(*mechanism), "mechanism disabled by configuration");
                }
                allowed
            })
            .collect();
        let session = Session::open(module.clone(), slot)?;
        let provider = Self {
            name: format!("PKCS11-{}", config.name),
            config,
            module,
            slot,
            mechanisms,
            session: Mutex::new(session),
        };
        info!(
            provider = %provider.name,
            library = %provider.module.path().display(),
            slot,
            mechanisms = provider.mechanisms.len(),
            "configured PKCS#11 provider"
        );
        if provider.config.show_info {
            show_details(&provider.name, provider.info());
        }
        Ok(provider)
    }

    fn require(&self, mechanism: CK_MECHANISM_TYPE, what: impl fmt::Display) -> ProbeResult<()> {
        if self.mechanisms.contains(&mechanism) {
            Ok(())
        } else {
            Err(ProbeError::no_such_algorithm(format!(
                "{what} is not available from {} ({} is not enabled)",
                self.name,
                MechanismLabel(mechanism)
            )))
        }
    }

    fn key_from_object(&self, session: &Session, object: CK_OBJECT_HANDLE) -> ProbeResult<Pkcs11Key> {
        let len = session
            .attribute_ulong(object, CKA_VALUE_LEN as CK_ATTRIBUTE_TYPE)?
            .unwrap_or(0) as usize;
        let label = session
            .attribute_bytes(object, CKA_LABEL as CK_ATTRIBUTE_TYPE)?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
        Ok(Pkcs11Key {
            handle: object,
            len,
            token: true,
            label,
        })
    }
}

fn select_slot(module: &Module, selector: SlotSelector) -> ProbeResult<CK_SLOT_ID> {
    match selector {
        SlotSelector::Id(id) => {
            let slots = module.slots(false)?;
            if !slots.contains(&id) {
                return Err(ProbeError::Config(format!(
                    "slot {id} does not exist (available: {slots:?})"
                )));
            }
            debug!(slot = id, "selected slot by id");
            Ok(id)
        }
        SlotSelector::ListIndex(index) => {
            let slots = module.slots(true)?;
            let slot = slots.get(index).copied().ok_or_else(|| {
                ProbeError::Config(format!(
                    "slotListIndex {index} is out of range, {} slot(s) with a token",
                    slots.len()
                ))
            })?;
            debug!(slot, index, "selected slot by list index");
            Ok(slot)
        }
    }
}

/// The mechanism serving `transformation`. ECB with PKCS#5 padding uses raw
/// ECB and pads in software.
pub fn cipher_mechanism(transformation: &Transformation) -> CK_MECHANISM_TYPE {
    (match (transformation.mode, transformation.padding) {
        (Mode::Cbc, Padding::None) => CKM_AES_CBC,
        (Mode::Cbc, Padding::Pkcs5) => CKM_AES_CBC_PAD,
        (Mode::Ecb, _) => CKM_AES_ECB,
        (Mode::Ctr, _) => CKM_AES_CTR,
        (Mode::Gcm, _) => CKM_AES_GCM,
    }) as CK_MECHANISM_TYPE
}

pub fn digest_mechanism(algorithm: DigestAlgorithm) -> CK_MECHANISM_TYPE {
    (match algorithm {
        DigestAlgorithm::Sha1 => CKM_SHA_1,
        DigestAlgorithm::Sha224 => CKM_SHA224,
        DigestAlgorithm::Sha256 => CKM_SHA256,
        DigestAlgorithm::Sha384 => CKM_SHA384,
        DigestAlgorithm::Sha512 => CKM_SHA512,
    }) as CK_MECHANISM_TYPE
}

/// Logs the `showInfo` details. Returns whether they could be read.
fn show_details(provider: &str, details: ProbeResult<ProviderInfo>) -> bool {
    match details {
        Ok(details) => {
            info!(provider, "\n{details}");
            true
        }
        Err(err) => {
            warn!(provider, "provider info: {err}");
            false
        }
    }
}

fn mechanism_for<'a>(params: &CipherParams<'a>) -> ProbeResult<Mechanism<'a>> {
    let kind = cipher_mechanism(&params.transformation);
    let param = match params.transformation.mode {
        Mode::Ecb => MechanismParam::None,
        Mode::Cbc => MechanismParam::Iv(params.block_iv()?),
        Mode::Ctr => {
            let mut block = [0u8; AES_BLOCK_SIZE];
            block.copy_from_slice(params.block_iv()?);
            MechanismParam::Ctr {
                counter_bits: CTR_COUNTER_BITS,
                block,
            }
        }
        Mode::Gcm => MechanismParam::Gcm {
            iv: params
                .iv
                .filter(|iv| !iv.is_empty())
                .ok_or_else(|| ProbeError::invalid_parameter("GCM needs an IV"))?,
            aad: params.aad,
            tag_bits: params.tag_bits as CK_ULONG,
        },
    };
    Ok(Mechanism::with_param(kind, param))
}

fn emulates_padding(transformation: &Transformation) -> bool {
    transformation.mode == Mode::Ecb && transformation.padding == Padding::Pkcs5
}

impl Provider for Pkcs11Provider {
    type Key = Pkcs11Key;

    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> ProbeResult<ProviderInfo> {
        let library = self.module.info()?;
        let token = self.module.token_info(self.slot)?;
        Ok(ProviderInfo {
            description: self.config.description.clone(),
            library: padded_string(&library.libraryDescription),
            library_manufacturer: padded_string(&library.manufacturerID),
            library_version: version_string(library.libraryVersion),
            cryptoki_version: version_string(library.cryptokiVersion),
            slot: Some(self.slot as u64),
            token_label: Some(padded_string(&token.label)),
            token_manufacturer: Some(padded_string(&token.manufacturerID)),
            token_model: Some(padded_string(&token.model)),
            token_serial: Some(padded_string(&token.serialNumber)),
        })
    }

    fn mechanisms(&self) -> ProbeResult<Vec<CK_MECHANISM_TYPE>> {
        Ok(self.mechanisms.clone())
    }

    fn ensure_supported(&self, transformation: &Transformation) -> ProbeResult<()> {
        self.require(cipher_mechanism(transformation), transformation)
    }

    fn digest(&self, algorithm: DigestAlgorithm, data: &[u8]) -> ProbeResult<Vec<u8>> {
        let mechanism = digest_mechanism(algorithm);
        self.require(mechanism, format_args!("{algorithm} MessageDigest"))?;
        self.session.lock().digest(&Mechanism::new(mechanism), data)
    }

    fn generate_random(&self, len: usize) -> ProbeResult<Vec<u8>> {
        self.session.lock().generate_random(len)
    }

    fn login(&self, pin: &Pin) -> ProbeResult<()> {
        self.session.lock().login(pin)?;
        debug!(provider = %self.name, "logged in");
        Ok(())
    }

    fn generate_secret_key(&self, bits: usize) -> ProbeResult<Pkcs11Key> {
        let len = check_aes_key_bits(bits)?;
        let mechanism = CKM_AES_KEY_GEN as CK_MECHANISM_TYPE;
        self.require(mechanism, "AES KeyGenerator")?;
        let template = Template::new()
            .ulong(CKA_CLASS as CK_ATTRIBUTE_TYPE, CKO_SECRET_KEY as CK_ULONG)
            .ulong(CKA_KEY_TYPE as CK_ATTRIBUTE_TYPE, CKK_AES as CK_ULONG)
            .ulong(CKA_VALUE_LEN as CK_ATTRIBUTE_TYPE, len as CK_ULONG)
            .bool(CKA_TOKEN as CK_ATTRIBUTE_TYPE, false)
            .bool(CKA_ENCRYPT as CK_ATTRIBUTE_TYPE, true)
            .bool(CKA_DECRYPT as CK_ATTRIBUTE_TYPE, true);
        let handle = self
            .session
            .lock()
            .generate_key(&Mechanism::new(mechanism), &template)?;
        let key = Pkcs11Key {
            handle,
            len,
            token: false,
            label: None,
        };
        debug!(key = %key, "generated secret key");
        Ok(key)
    }

    fn persist_key(&self, key: &Pkcs11Key, alias: &str) -> ProbeResult<Pkcs11Key> {
        let template = Template::new()
            .bool(CKA_TOKEN as CK_ATTRIBUTE_TYPE, true)
            .bytes(CKA_LABEL as CK_ATTRIBUTE_TYPE, alias);
        let handle = self.session.lock().copy_object(key.handle, &template)?;
        Ok(Pkcs11Key {
            handle,
            len: key.len,
            token: true,
            label: Some(alias.to_string()),
        })
    }

    fn find_keys(&self, alias: &str) -> ProbeResult<Vec<Pkcs11Key>> {
        let template = Template::new()
            .ulong(CKA_CLASS as CK_ATTRIBUTE_TYPE, CKO_SECRET_KEY as CK_ULONG)
            .bool(CKA_TOKEN as CK_ATTRIBUTE_TYPE, true)
            .bytes(CKA_LABEL as CK_ATTRIBUTE_TYPE, alias);
        let session = self.session.lock();
        session
            .find_objects(&template)?
            .into_iter()
            .map(|object| self.key_from_object(&session, object))
            .collect()
    }

    fn key_aliases(&self) -> ProbeResult<Vec<String>> {
        let template = Template::new()
            .ulong(CKA_CLASS as CK_ATTRIBUTE_TYPE, CKO_SECRET_KEY as CK_ULONG)
            .bool(CKA_TOKEN as CK_ATTRIBUTE_TYPE, true);
        let session = self.session.lock();
        let mut aliases = Vec::new();
        for object in session.find_objects(&template)? {
            if let Some(label) = session.attribute_bytes(object, CKA_LABEL as CK_ATTRIBUTE_TYPE)? {
                aliases.push(String::from_utf8_lossy(&label).into_owned());
            }
        }
        Ok(aliases)
    }

    fn destroy_key(&self, key: &Pkcs11Key) -> ProbeResult<()> {
        self.session.lock().destroy_object(key.handle)
    }

    fn encrypt(
        &self,
        key: &Pkcs11Key,
        params: &CipherParams<'_>,
        data: &[u8],
    ) -> ProbeResult<Vec<u8>> {
        let transformation = &params.transformation;
        self.ensure_supported(transformation)?;
        transformation.check_input_len(Direction::Encrypt, data.len())?;
        let mechanism = mechanism_for(params)?;
        let session = self.session.lock();
        if emulates_padding(transformation) {
            session.encrypt(&mechanism, key.handle, &pkcs5_pad(data))
        } else {
            session.encrypt(&mechanism, key.handle, data)
        }
    }

    fn decrypt(
        &self,
        key: &Pkcs11Key,
        params: &CipherParams<'_>,
        data: &[u8],
    ) -> ProbeResult<Vec<u8>> {
        let transformation = &params.transformation;
        self.ensure_supported(transformation)?;
        transformation.check_input_len(Direction::Decrypt, data.len())?;
        let mechanism = mechanism_for(params)?;
        let plain = self
            .session
            .lock()
            .decrypt(&mechanism, key.handle, data)?;
        if emulates_padding(transformation) {
            pkcs5_unpad(plain)
        } else {
            Ok(plain)
        }
    }
}
