//! Alias-addressed secret key storage on top of a provider's token objects.

use std::fmt;

use tracing::{debug, info};

use crate::{
    error::{ProbeError, ProbeResult},
    provider::Provider,
};

/// A PIN or password. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Pin(String);

impl Pin {
    pub fn new(pin: impl Into<String>) -> Self {
        Self(pin.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl From<&str> for Pin {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pin(***)")
    }
}

/// A keystore backed by the provider's token. The token has a single user
/// PIN, so every entry is protected by the PIN the keystore was loaded with.
pub struct KeyStore<'p, P: Provider> {
    provider: &'p P,
    pin: Pin,
}

impl<'p, P: Provider> KeyStore<'p, P> {
    /// Logs in to the provider's token with `pin`.
    pub fn load(provider: &'p P, pin: &Pin) -> ProbeResult<Self> {
        provider.login(pin)?;
        debug!(provider = provider.name(), "keystore loaded");
        Ok(Self {
            provider,
            pin: pin.clone(),
        })
    }

    /// Stores `key` under `alias`, replacing any existing entry.
    pub fn set_key_entry(&self, alias: &str, key: &P::Key, entry_pin: &Pin) -> ProbeResult<()> {
        check_alias(alias)?;
        self.check_entry_pin(alias, entry_pin)?;
        for existing in self.provider.find_keys(alias)? {
            debug!(alias, key = %existing, "replacing keystore entry");
            self.provider.destroy_key(&existing)?;
        }
        let stored = self.provider.persist_key(key, alias)?;
        info!(alias, key = %stored, "stored key entry");
        Ok(())
    }

    /// The key stored under `alias`, or `None` when there is no such entry.
    pub fn get_key(&self, alias: &str, entry_pin: &Pin) -> ProbeResult<Option<P::Key>> {
        check_alias(alias)?;
        self.check_entry_pin(alias, entry_pin)?;
        let mut keys = self.provider.find_keys(alias)?;
        match keys.len() {
            0 => Ok(None),
            1 => Ok(keys.pop()),
            n => Err(ProbeError::keystore(format!(
                "{n} token objects share the alias {alias:?}"
            ))),
        }
    }

    pub fn contains_alias(&self, alias: &str) -> ProbeResult<bool> {
        Ok(!self.provider.find_keys(alias)?.is_empty())
    }

    pub fn aliases(&self) -> ProbeResult<Vec<String>> {
        let mut aliases = self.provider.key_aliases()?;
        aliases.sort();
        aliases.dedup();
        Ok(aliases)
    }

    /// Removes the entry under `alias`. Returns whether anything was removed.
    pub fn delete_entry(&self, alias: &str) -> ProbeResult<bool> {
        let keys = self.provider.find_keys(alias)?;
        for key in &keys {
            self.provider.destroy_key(key)?;
        }
        if !keys.is_empty() {
            info!(alias, "deleted key entry");
        }
        Ok(!keys.is_empty())
    }

    fn check_entry_pin(&self, alias: &str, entry_pin: &Pin) -> ProbeResult<()> {
        if *entry_pin != self.pin {
            return Err(ProbeError::UnrecoverableKey(format!(
                "entry PIN for {alias:?} does not match the token PIN"
            )));
        }
        Ok(())
    }
}

fn check_alias(alias: &str) -> ProbeResult<()> {
    if alias.is_empty() {
        return Err(ProbeError::keystore("alias must not be empty"));
    }
    Ok(())
}
