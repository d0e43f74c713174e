//! PKCS#11 sessions, attribute templates and mechanism parameters.

use std::{mem, ptr, sync::Arc};

use cryptoki_sys::{
    CKF_RW_SESSION, CKF_SERIAL_SESSION, CKR_USER_ALREADY_LOGGED_IN, CKU_USER,
    CK_AES_CTR_PARAMS, CK_ATTRIBUTE, CK_ATTRIBUTE_TYPE, CK_BBOOL, CK_BYTE_PTR, CK_FALSE, CK_FLAGS,
    CK_GCM_PARAMS, CK_MECHANISM, CK_MECHANISM_TYPE, CK_OBJECT_HANDLE, CK_RV, CK_SESSION_HANDLE,
    CK_SLOT_ID, CK_TRUE, CK_ULONG, CK_UNAVAILABLE_INFORMATION, CK_USER_TYPE, CK_VOID_PTR,
};
use tracing::{debug, trace, warn};

use crate::{
    error::{ProbeError, ProbeResult},
    keystore::Pin,
    module::{call, Module},
};

const FIND_BATCH: usize = 16;

#[derive(Debug, Clone)]
enum AttributeValue {
    Bool(CK_BBOOL),
    Ulong(CK_ULONG),
    Bytes(Vec<u8>),
}

/// An attribute template owning the values its raw form points to.
#[derive(Debug, Clone, Default)]
pub struct Template {
    attributes: Vec<(CK_ATTRIBUTE_TYPE, AttributeValue)>,
}

impl Template {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bool(mut self, kind: CK_ATTRIBUTE_TYPE, value: bool) -> Self {
        let value = if value { CK_TRUE } else { CK_FALSE };
        self.attributes
            .push((kind, AttributeValue::Bool(value as CK_BBOOL)));
        self
    }

    pub fn ulong(mut self, kind: CK_ATTRIBUTE_TYPE, value: CK_ULONG) -> Self {
        self.attributes.push((kind, AttributeValue::Ulong(value)));
        self
    }

    pub fn bytes(mut self, kind: CK_ATTRIBUTE_TYPE, value: impl Into<Vec<u8>>) -> Self {
        self.attributes
            .push((kind, AttributeValue::Bytes(value.into())));
        self
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Raw attributes pointing into `self`; valid while `self` is borrowed.
    fn raw(&self) -> Vec<CK_ATTRIBUTE> {
        self.attributes
            .iter()
            .map(|(kind, value)| {
                let (pointer, len) = match value {
                    AttributeValue::Bool(b) => (b as *const CK_BBOOL as CK_VOID_PTR, mem::size_of::<CK_BBOOL>()),
                    AttributeValue::Ulong(u) => (u as *const CK_ULONG as CK_VOID_PTR, mem::size_of::<CK_ULONG>()),
                    AttributeValue::Bytes(bytes) => (bytes.as_ptr() as CK_VOID_PTR, bytes.len()),
                };
                CK_ATTRIBUTE {
                    type_: *kind,
                    pValue: pointer,
                    ulValueLen: len as CK_ULONG,
                }
            })
            .collect()
    }
}

/// Parameter block passed along with a mechanism.
#[derive(Debug, Clone, Copy)]
pub enum MechanismParam<'a> {
    None,
    Iv(&'a [u8]),
    Ctr {
        counter_bits: CK_ULONG,
        block: [u8; 16],
    },
    Gcm {
        iv: &'a [u8],
        aad: &'a [u8],
        tag_bits: CK_ULONG,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct Mechanism<'a> {
    pub kind: CK_MECHANISM_TYPE,
    pub param: MechanismParam<'a>,
}

impl<'a> Mechanism<'a> {
    pub fn new(kind: CK_MECHANISM_TYPE) -> Self {
        Self {
            kind,
            param: MechanismParam::None,
        }
    }

    pub fn with_param(kind: CK_MECHANISM_TYPE, param: MechanismParam<'a>) -> Self {
        Self { kind, param }
    }

    /// Runs `f` with the raw `CK_MECHANISM`, whose parameter block lives on
    /// this stack frame.
    fn with_raw<R>(&self, f: impl FnOnce(&mut CK_MECHANISM) -> R) -> R {
        let mut raw = CK_MECHANISM {
            mechanism: self.kind,
            pParameter: ptr::null_mut(),
            ulParameterLen: 0,
        };
        match self.param {
            MechanismParam::None => f(&mut raw),
            MechanismParam::Iv(iv) => {
                raw.pParameter = iv.as_ptr() as CK_VOID_PTR;
                raw.ulParameterLen = iv.len() as CK_ULONG;
                f(&mut raw)
            }
            MechanismParam::Ctr {
                counter_bits,
                block,
            } => {
                let mut params = CK_AES_CTR_PARAMS {
                    ulCounterBits: counter_bits,
                    cb: block,
                };
                raw.pParameter = &mut params as *mut CK_AES_CTR_PARAMS as CK_VOID_PTR;
                raw.ulParameterLen = mem::size_of::<CK_AES_CTR_PARAMS>() as CK_ULONG;
                f(&mut raw)
            }
            MechanismParam::Gcm { iv, aad, tag_bits } => {
                let mut params = CK_GCM_PARAMS {
                    pIv: iv.as_ptr() as CK_BYTE_PTR,
                    ulIvLen: iv.len() as CK_ULONG,
                    ulIvBits: (iv.len() * 8) as CK_ULONG,
                    pAAD: if aad.is_empty() {
                        ptr::null_mut()
                    } else {
                        aad.as_ptr() as CK_BYTE_PTR
                    },
                    ulAADLen: aad.len() as CK_ULONG,
                    ulTagBits: tag_bits,
                };
                raw.pParameter = &mut params as *mut CK_GCM_PARAMS as CK_VOID_PTR;
                raw.ulParameterLen = mem::size_of::<CK_GCM_PARAMS>() as CK_ULONG;
                f(&mut raw)
            }
        }
    }
}

/// A read/write session on one slot, closed on drop.
pub struct Session {
    module: Arc<Module>,
    handle: CK_SESSION_HANDLE,
}

impl Session {
    pub fn open(module: Arc<Module>, slot: CK_SLOT_ID) -> ProbeResult<Self> {
        let mut handle: CK_SESSION_HANDLE = 0;
        let flags = (CKF_SERIAL_SESSION | CKF_RW_SESSION) as CK_FLAGS;
        call!(
            module,
            C_OpenSession(slot, flags, ptr::null_mut(), None, &mut handle)
        )?;
        debug!(slot, session = handle, "opened session");
        Ok(Self { module, handle })
    }

    pub fn handle(&self) -> CK_SESSION_HANDLE {
        self.handle
    }

    pub fn login(&self, pin: &Pin) -> ProbeResult<()> {
        let bytes = pin.as_bytes();
        let result = call!(
            self.module,
            C_Login(
                self.handle,
                CKU_USER as CK_USER_TYPE,
                bytes.as_ptr() as CK_BYTE_PTR,
                bytes.len() as CK_ULONG
            )
        );
        match result {
            Err(ProbeError::Pkcs11 { rv, .. }) if rv.0 == CKR_USER_ALREADY_LOGGED_IN as CK_RV => {
                debug!(session = self.handle, "user already logged in");
                Ok(())
            }
            other => other,
        }
    }

    pub fn generate_key(
        &self,
        mechanism: &Mechanism<'_>,
        template: &Template,
    ) -> ProbeResult<CK_OBJECT_HANDLE> {
        let mut raw = template.raw();
        let mut key: CK_OBJECT_HANDLE = 0;
        mechanism.with_raw(|mech| {
            call!(
                self.module,
                C_GenerateKey(
                    self.handle,
                    mech,
                    raw.as_mut_ptr(),
                    raw.len() as CK_ULONG,
                    &mut key
                )
            )
        })?;
        Ok(key)
    }

    pub fn copy_object(
        &self,
        object: CK_OBJECT_HANDLE,
        template: &Template,
    ) -> ProbeResult<CK_OBJECT_HANDLE> {
        let mut raw = template.raw();
        let mut copy: CK_OBJECT_HANDLE = 0;
        call!(
            self.module,
            C_CopyObject(
                self.handle,
                object,
                raw.as_mut_ptr(),
                raw.len() as CK_ULONG,
                &mut copy
            )
        )?;
        Ok(copy)
    }

    pub fn destroy_object(&self, object: CK_OBJECT_HANDLE) -> ProbeResult<()> {
        call!(self.module, C_DestroyObject(self.handle, object))
    }

    /// Objects matching `template`. The search is always finalized.
    pub fn find_objects(&self, template: &Template) -> ProbeResult<Vec<CK_OBJECT_HANDLE>> {
        let mut raw = template.raw();
        call!(
            self.module,
            C_FindObjectsInit(self.handle, raw.as_mut_ptr(), raw.len() as CK_ULONG)
        )?;
        let found = self.collect_found();
        let finished = call!(self.module, C_FindObjectsFinal(self.handle));
        let found = found?;
        finished?;
        Ok(found)
    }

    fn collect_found(&self) -> ProbeResult<Vec<CK_OBJECT_HANDLE>> {
        let mut found = Vec::new();
        let mut batch = [0 as CK_OBJECT_HANDLE; FIND_BATCH];
        loop {
            let mut count: CK_ULONG = 0;
            call!(
                self.module,
                C_FindObjects(
                    self.handle,
                    batch.as_mut_ptr(),
                    FIND_BATCH as CK_ULONG,
                    &mut count
                )
            )?;
            if count == 0 {
                return Ok(found);
            }
            found.extend_from_slice(&batch[..count as usize]);
        }
    }

    /// Value of a byte-string attribute, `None` when the object does not
    /// expose it.
    pub fn attribute_bytes(
        &self,
        object: CK_OBJECT_HANDLE,
        kind: CK_ATTRIBUTE_TYPE,
    ) -> ProbeResult<Option<Vec<u8>>> {
        let mut attribute = CK_ATTRIBUTE {
            type_: kind,
            pValue: ptr::null_mut(),
            ulValueLen: 0,
        };
        if let Err(err) = call!(
            self.module,
            C_GetAttributeValue(self.handle, object, &mut attribute, 1)
        ) {
            trace!(object, attribute = kind, error = %err, "attribute not readable");
            return Ok(None);
        }
        if attribute.ulValueLen == CK_UNAVAILABLE_INFORMATION as CK_ULONG {
            return Ok(None);
        }
        let mut value = vec![0u8; attribute.ulValueLen as usize];
        attribute.pValue = value.as_mut_ptr() as CK_VOID_PTR;
        call!(
            self.module,
            C_GetAttributeValue(self.handle, object, &mut attribute, 1)
        )?;
        value.truncate(attribute.ulValueLen as usize);
        Ok(Some(value))
    }

    pub fn attribute_ulong(
        &self,
        object: CK_OBJECT_HANDLE,
        kind: CK_ATTRIBUTE_TYPE,
    ) -> ProbeResult<Option<CK_ULONG>> {
        let mut value: CK_ULONG = 0;
        let mut attribute = CK_ATTRIBUTE {
            type_: kind,
            pValue: &mut value as *mut CK_ULONG as CK_VOID_PTR,
            ulValueLen: mem::size_of::<CK_ULONG>() as CK_ULONG,
        };
        match call!(
            self.module,
            C_GetAttributeValue(self.handle, object, &mut attribute, 1)
        ) {
            Ok(()) if attribute.ulValueLen != CK_UNAVAILABLE_INFORMATION as CK_ULONG => {
                Ok(Some(value))
            }
            Ok(()) => Ok(None),
            Err(err) => {
                trace!(object, attribute = kind, error = %err, "attribute not readable");
                Ok(None)
            }
        }
    }

    pub fn digest(&self, mechanism: &Mechanism<'_>, data: &[u8]) -> ProbeResult<Vec<u8>> {
        mechanism.with_raw(|mech| call!(self.module, C_DigestInit(self.handle, mech)))?;
        self.two_call("C_Digest", |out, out_len| {
            call!(
                self.module,
                C_Digest(
                    self.handle,
                    data.as_ptr() as CK_BYTE_PTR,
                    data.len() as CK_ULONG,
                    out,
                    out_len
                )
            )
        })
    }

    pub fn generate_random(&self, len: usize) -> ProbeResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        call!(
            self.module,
            C_GenerateRandom(self.handle, buf.as_mut_ptr(), len as CK_ULONG)
        )?;
        Ok(buf)
    }

    pub fn encrypt(
        &self,
        mechanism: &Mechanism<'_>,
        key: CK_OBJECT_HANDLE,
        data: &[u8],
    ) -> ProbeResult<Vec<u8>> {
        mechanism.with_raw(|mech| call!(self.module, C_EncryptInit(self.handle, mech, key)))?;
        self.two_call("C_Encrypt", |out, out_len| {
            call!(
                self.module,
                C_Encrypt(
                    self.handle,
                    data.as_ptr() as CK_BYTE_PTR,
                    data.len() as CK_ULONG,
                    out,
                    out_len
                )
            )
        })
    }

    pub fn decrypt(
        &self,
        mechanism: &Mechanism<'_>,
        key: CK_OBJECT_HANDLE,
        data: &[u8],
    ) -> ProbeResult<Vec<u8>> {
        mechanism.with_raw(|mech| call!(self.module, C_DecryptInit(self.handle, mech, key)))?;
        self.two_call("C_Decrypt", |out, out_len| {
            call!(
                self.module,
                C_Decrypt(
                    self.handle,
                    data.as_ptr() as CK_BYTE_PTR,
                    data.len() as CK_ULONG,
                    out,
                    out_len
                )
            )
        })
    }

    /// Single-part output convention: a call without a buffer reports the
    /// length, the second call fills the buffer.
    fn two_call<F>(&self, function: &'static str, mut f: F) -> ProbeResult<Vec<u8>>
    where
        F: FnMut(CK_BYTE_PTR, &mut CK_ULONG) -> ProbeResult<()>,
    {
        let mut len: CK_ULONG = 0;
        f(ptr::null_mut(), &mut len)?;
        let mut out = vec![0u8; len as usize];
        f(out.as_mut_ptr(), &mut len)?;
        out.truncate(len as usize);
        trace!(function, len = out.len(), "single-part operation finished");
        Ok(out)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let result: ProbeResult<()> = (|| call!(self.module, C_CloseSession(self.handle)))();
        if let Err(err) = result {
            warn!(session = self.handle, error = %err, "C_CloseSession failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryptoki_sys::{CKA_LABEL, CKA_TOKEN, CKA_VALUE_LEN};

    #[test]
    fn template_points_at_owned_values() {
        let template = Template::new()
            .bool(CKA_TOKEN as CK_ATTRIBUTE_TYPE, true)
            .ulong(CKA_VALUE_LEN as CK_ATTRIBUTE_TYPE, 16)
            .bytes(CKA_LABEL as CK_ATTRIBUTE_TYPE, "AES key");
        assert_eq!(template.len(), 3);
        let raw = template.raw();
        assert_eq!(raw[0].ulValueLen as usize, mem::size_of::<CK_BBOOL>());
        assert_eq!(unsafe { *(raw[0].pValue as *const CK_BBOOL) }, CK_TRUE as CK_BBOOL);
        assert_eq!(unsafe { *(raw[1].pValue as *const CK_ULONG) }, 16);
        let label =
            unsafe { std::slice::from_raw_parts(raw[2].pValue as *const u8, raw[2].ulValueLen as usize) };
        assert_eq!(label, b"AES key");
    }

    #[test]
    fn gcm_parameters_are_laid_out_for_the_call() {
        let iv = [1u8; 12];
        let aad = [2u8; 20];
        let mechanism = Mechanism::with_param(
            0x1087,
            MechanismParam::Gcm {
                iv: &iv,
                aad: &aad,
                tag_bits: 128,
            },
        );
        mechanism.with_raw(|raw| {
            assert_eq!(raw.mechanism, 0x1087);
            assert_eq!(raw.ulParameterLen as usize, mem::size_of::<CK_GCM_PARAMS>());
            let params = unsafe { &*(raw.pParameter as *const CK_GCM_PARAMS) };
            assert_eq!(params.ulIvLen, 12);
            assert_eq!(params.ulIvBits, 96);
            assert_eq!(params.ulAADLen, 20);
            assert_eq!(params.ulTagBits, 128);
        });
    }

    #[test]
    fn ctr_parameters_carry_the_counter_block() {
        let mechanism = Mechanism::with_param(
            0x1086,
            MechanismParam::Ctr {
                counter_bits: 128,
                block: [9u8; 16],
            },
        );
        mechanism.with_raw(|raw| {
            let params = unsafe { &*(raw.pParameter as *const CK_AES_CTR_PARAMS) };
            assert_eq!(params.ulCounterBits, 128);
            assert_eq!(params.cb, [9u8; 16]);
        });
    }
}
