//! Loading PKCS#11 modules and calling into their function lists.
//!
//! A module is loaded at most once per process. Providers configured against
//! the same library share the loaded [`Module`], which calls `C_Initialize`
//! when it is first loaded and `C_Finalize` when the last provider using it
//! goes away.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    ptr,
    sync::{Arc, Weak},
};

use cryptoki_sys::{
    CKF_OS_LOCKING_OK, CKR_CRYPTOKI_ALREADY_INITIALIZED, CKR_OK, CK_BBOOL, CK_C_INITIALIZE_ARGS,
    CK_FALSE, CK_FLAGS, CK_FUNCTION_LIST, CK_FUNCTION_LIST_PTR, CK_FUNCTION_LIST_PTR_PTR, CK_INFO,
    CK_MECHANISM_TYPE, CK_RV, CK_SLOT_ID, CK_TOKEN_INFO, CK_TRUE, CK_ULONG, CK_VERSION,
    CK_VOID_PTR,
};
use libloading::{Library, Symbol};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    config::ProviderConfig,
    error::{ProbeError, ProbeResult},
    rv::ReturnValue,
};

type GetFunctionList = unsafe extern "C" fn(CK_FUNCTION_LIST_PTR_PTR) -> CK_RV;

lazy_static! {
    static ref MODULES: Mutex<HashMap<PathBuf, Weak<Module>>> = Mutex::new(HashMap::new());
}

/// Calls a function from a module's function list, turning a missing entry
/// into [`ProbeError::FunctionNotSupported`] and a failing return value into
/// [`ProbeError::Pkcs11`].
macro_rules! call {
    ($module:expr, $function:ident($($arg:expr),* $(,)?)) => {{
        let function = $module
            .functions()
            .$function
            .ok_or($crate::error::ProbeError::FunctionNotSupported(stringify!($function)))?;
        #[allow(unused_unsafe)]
        let rv = unsafe { function($($arg),*) };
        $crate::module::check(stringify!($function), rv)
    }};
}

pub(crate) use call;

pub(crate) fn check(function: &'static str, rv: CK_RV) -> ProbeResult<()> {
    if rv == CKR_OK as CK_RV {
        Ok(())
    } else {
        Err(ProbeError::Pkcs11 {
            function,
            rv: ReturnValue(rv),
        })
    }
}

pub struct Module {
    path: PathBuf,
    functions: CK_FUNCTION_LIST_PTR,
    finalize_on_drop: bool,
    // Dropped last: the function list points into the library image.
    _library: Library,
}

// The function list is immutable once returned and modules are initialized
// with CKF_OS_LOCKING_OK, so calls may come from any thread.
unsafe impl Send for Module {}
unsafe impl Sync for Module {}

impl Module {
    /// Returns the already loaded module for the configured library, or
    /// loads and initializes it.
    pub fn load(config: &ProviderConfig) -> ProbeResult<Arc<Module>> {
        let key = config
            .library
            .canonicalize()
            .unwrap_or_else(|_| config.library.clone());
        let mut modules = MODULES.lock();
        if let Some(module) = modules.get(&key).and_then(Weak::upgrade) {
            debug!(library = %key.display(), "reusing loaded PKCS#11 module");
            return Ok(module);
        }
        let module = Arc::new(Module::open(config)?);
        modules.retain(|_, module| module.strong_count() > 0);
        modules.insert(key, Arc::downgrade(&module));
        Ok(module)
    }

    fn open(config: &ProviderConfig) -> ProbeResult<Module> {
        let path = config.library.clone();
        let load_error = |source| ProbeError::Load {
            path: path.clone(),
            source,
        };
        let library = unsafe { Library::new(&path) }.map_err(load_error)?;
        let functions = unsafe {
            let get_function_list: Symbol<GetFunctionList> = library
                .get(config.function_list.as_bytes())
                .map_err(load_error)?;
            let mut functions: CK_FUNCTION_LIST_PTR = ptr::null_mut();
            check("C_GetFunctionList", get_function_list(&mut functions))?;
            functions
        };
        if functions.is_null() {
            return Err(ProbeError::IllegalState(format!(
                "{} returned no function list",
                config.function_list
            )));
        }

        let mut module = Module {
            path,
            functions,
            finalize_on_drop: false,
            _library: library,
        };
        if config.omit_initialize {
            debug!(library = %module.path.display(), "skipping C_Initialize");
        } else {
            module.finalize_on_drop = module.initialize()?;
        }
        info!(library = %module.path.display(), "loaded PKCS#11 module");
        Ok(module)
    }

    /// Returns whether this call initialized the library.
    fn initialize(&self) -> ProbeResult<bool> {
        let mut args = CK_C_INITIALIZE_ARGS {
            CreateMutex: None,
            DestroyMutex: None,
            LockMutex: None,
            UnlockMutex: None,
            flags: CKF_OS_LOCKING_OK as CK_FLAGS,
            pReserved: ptr::null_mut(),
        };
        let args_ptr = &mut args as *mut CK_C_INITIALIZE_ARGS as CK_VOID_PTR;
        match call!(self, C_Initialize(args_ptr)) {
            Ok(()) => Ok(true),
            Err(ProbeError::Pkcs11 { rv, .. })
                if rv.0 == CKR_CRYPTOKI_ALREADY_INITIALIZED as CK_RV =>
            {
                debug!(library = %self.path.display(), "library was already initialized");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    pub(crate) fn functions(&self) -> &CK_FUNCTION_LIST {
        unsafe { &*self.functions }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self) -> ProbeResult<CK_INFO> {
        let mut info = CK_INFO::default();
        call!(self, C_GetInfo(&mut info))?;
        Ok(info)
    }

    pub fn slots(&self, token_present: bool) -> ProbeResult<Vec<CK_SLOT_ID>> {
        let present: CK_BBOOL = if token_present {
            CK_TRUE as CK_BBOOL
        } else {
            CK_FALSE as CK_BBOOL
        };
        let mut count: CK_ULONG = 0;
        call!(self, C_GetSlotList(present, ptr::null_mut(), &mut count))?;
        let mut slots = vec![0 as CK_SLOT_ID; count as usize];
        call!(self, C_GetSlotList(present, slots.as_mut_ptr(), &mut count))?;
        slots.truncate(count as usize);
        Ok(slots)
    }

    pub fn token_info(&self, slot: CK_SLOT_ID) -> ProbeResult<CK_TOKEN_INFO> {
        let mut info = CK_TOKEN_INFO::default();
        call!(self, C_GetTokenInfo(slot, &mut info))?;
        Ok(info)
    }

    pub fn mechanisms(&self, slot: CK_SLOT_ID) -> ProbeResult<Vec<CK_MECHANISM_TYPE>> {
        let mut count: CK_ULONG = 0;
        call!(self, C_GetMechanismList(slot, ptr::null_mut(), &mut count))?;
        let mut mechanisms = vec![0 as CK_MECHANISM_TYPE; count as usize];
        call!(self, C_GetMechanismList(slot, mechanisms.as_mut_ptr(), &mut count))?;
        mechanisms.truncate(count as usize);
        Ok(mechanisms)
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        if !self.finalize_on_drop {
            return;
        }
        let result: ProbeResult<()> = (|| call!(self, C_Finalize(ptr::null_mut())))();
        match result {
            Ok(()) => debug!(library = %self.path.display(), "finalized PKCS#11 module"),
            Err(err) => warn!(library = %self.path.display(), error = %err, "C_Finalize failed"),
        }
    }
}

/// Decodes a blank-padded PKCS#11 string field.
pub(crate) fn padded_string(field: &[u8]) -> String {
    String::from_utf8_lossy(field)
        .trim_end_matches([' ', '\0'])
        .to_string()
}

pub(crate) fn version_string(version: CK_VERSION) -> String {
    format!("{}.{}", version.major, version.minor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_padded_strings_are_trimmed() {
        let mut field = [b' '; 32];
        field[..7].copy_from_slice(b"SoftHSM");
        assert_eq!(padded_string(&field), "SoftHSM");
        assert_eq!(padded_string(&[0u8; 4]), "");
    }

    #[test]
    fn versions() {
        assert_eq!(version_string(CK_VERSION { major: 2, minor: 40 }), "2.40");
    }

    #[test]
    fn check_maps_return_values() {
        assert!(check("C_Login", CKR_OK as CK_RV).is_ok());
        let err = check("C_Login", 0xA0).unwrap_err();
        assert_eq!(err.return_value(), Some(ReturnValue(0xA0)));
        assert!(err.to_string().starts_with("C_Login failed: CKR_PIN_INCORRECT"));
    }

    #[test]
    fn missing_library_is_a_load_error() {
        let config = ProviderConfig::new("missing", "/nonexistent/libmissing-pkcs11.so");
        assert!(matches!(
            Module::load(&config),
            Err(ProbeError::Load { .. })
        ));
    }
}
