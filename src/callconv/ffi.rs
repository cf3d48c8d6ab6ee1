//! Calls into native libraries through libffi, for methods whose code is a
//! plain exported function rather than code built against the runtime's
//! own entry convention.
use super::ArgClass;
use crate::types::PrimitiveKind;
use dashmap::DashMap;
use libffi::middle::{Cif, CodePtr, Type};
use libloading::{Library, Symbol};
use std::{ffi::c_void, path::PathBuf};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum NativeLibraryError {
    #[error("no library named '{0}' under the library root")]
    LibraryNotFound(String),
    #[error("'{0}' exports no entry point '{1}'")]
    SymbolNotFound(String, String),
    #[error("cannot load '{0}': {1}")]
    LoadError(String, String),
}

#[cfg(target_os = "windows")]
const SUFFIXES: &[&str] = &[".dll"];
#[cfg(target_os = "macos")]
const SUFFIXES: &[&str] = &[".dylib", ".so"];
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
const SUFFIXES: &[&str] = &[".so"];

/// Libraries opened on first use and kept for the life of the runtime, so
/// resolved entry points stay valid.
pub struct NativeLibraries {
    root: PathBuf,
    opened: DashMap<String, Library>,
}

impl NativeLibraries {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            opened: DashMap::new(),
        }
    }

    /// `name` as given, then with the platform suffix, then as `lib<name>`.
    fn candidates<'a>(&'a self, name: &'a str) -> impl Iterator<Item = PathBuf> + 'a {
        let plain = std::iter::once(self.root.join(name));
        let suffixed = SUFFIXES.iter().flat_map(move |suffix| {
            [
                self.root.join(format!("{name}{suffix}")),
                self.root.join(format!("lib{name}{suffix}")),
            ]
        });
        plain.chain(suffixed)
    }

    fn open(&self, name: &str) -> Result<dashmap::mapref::one::Ref<'_, String, Library>, NativeLibraryError> {
        if let Some(lib) = self.opened.get(name) {
            return Ok(lib);
        }
        let path = self
            .candidates(name)
            .find(|p| p.is_file())
            .ok_or_else(|| NativeLibraryError::LibraryNotFound(name.to_string()))?;
        tracing::debug!(library = name, path = %path.display(), "opening native library");
        // SAFETY: loading runs the library's initializers; libraries named
        // by method metadata are trusted the same way their callers are.
        let lib = unsafe { Library::new(&path) }
            .map_err(|e| NativeLibraryError::LoadError(name.to_string(), e.to_string()))?;
        Ok(self.opened.entry(name.to_string()).or_insert(lib).downgrade())
    }

    /// Address of `entry_point` in `library`.
    pub fn get_function(&self, library: &str, entry_point: &str) -> Result<usize, NativeLibraryError> {
        let lib = self.open(library)?;
        // SAFETY: the symbol is only used as an address; its signature is
        // supplied separately by the caller.
        let symbol: Symbol<unsafe extern "C" fn()> = unsafe { lib.get(entry_point.as_bytes()) }
            .map_err(|_| NativeLibraryError::SymbolNotFound(library.to_string(), entry_point.to_string()))?;
        Ok(*symbol as usize)
    }
}

fn primitive_to_ffi(kind: PrimitiveKind) -> Type {
    use PrimitiveKind::*;
    match kind {
        I1 => Type::i8(),
        Bool | U1 => Type::u8(),
        I2 => Type::i16(),
        Char | U2 => Type::u16(),
        I4 => Type::i32(),
        U4 => Type::u32(),
        I8 => Type::i64(),
        U8 => Type::u64(),
        R4 => Type::f32(),
        R8 => Type::f64(),
        NativeInt => Type::isize(),
        NativeUInt => Type::usize(),
        Void => Type::void(),
        Object | ByRef | Ptr => Type::pointer(),
    }
}

fn class_to_ffi(class: &ArgClass) -> Type {
    match class {
        ArgClass::Int { size: 1 } => Type::u8(),
        ArgClass::Int { size: 2 } => Type::u16(),
        ArgClass::Int { size: 4 } => Type::u32(),
        ArgClass::Int { .. } => Type::u64(),
        ArgClass::Float { size: 4 } => Type::f32(),
        ArgClass::Float { .. } => Type::f64(),
        ArgClass::Struct(info) => {
            Type::structure(info.fields.iter().map(|f| primitive_to_ffi(f.kind)))
        }
    }
}

/// A native function with a fixed signature, callable with raw argument
/// addresses in declaration order.
#[derive(Clone, Debug)]
pub struct FfiCallee {
    pub address: usize,
    pub params: Vec<ArgClass>,
    pub ret: Option<ArgClass>,
}

impl FfiCallee {
    pub fn new(address: usize, params: Vec<ArgClass>, ret: Option<ArgClass>) -> Self {
        Self {
            address,
            params,
            ret,
        }
    }

    /// # Safety
    /// `args[i]` must point to a readable value of `params[i]`'s size, and
    /// `ret` must have room for the return value (at least one slot for scalars).
    pub unsafe fn call(&self, args: &[*mut u8], ret: *mut u8) {
        let cif = Cif::new(
            self.params.iter().map(class_to_ffi),
            self.ret.as_ref().map_or_else(Type::void, class_to_ffi),
        );
        let mut arg_ptrs: Vec<*mut c_void> = args.iter().map(|a| a.cast()).collect();
        let code = CodePtr::from_ptr(self.address as *const c_void);
        libffi::raw::ffi_call(
            cif.as_raw_ptr(),
            Some(*code.as_fun()),
            ret.cast(),
            arg_ptrs.as_mut_ptr(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn add_mixed(a: i32, b: i64, c: f64) -> i64 {
        a as i64 + b + c as i64
    }

    #[test]
    fn calls_through_libffi() {
        let callee = FfiCallee::new(
            add_mixed as usize,
            vec![
                ArgClass::Int { size: 4 },
                ArgClass::Int { size: 8 },
                ArgClass::Float { size: 8 },
            ],
            Some(ArgClass::Int { size: 8 }),
        );
        let mut a = 5i32;
        let mut b = 10i64;
        let mut c = 2.5f64;
        let mut ret = 0u64;
        unsafe {
            callee.call(
                &[
                    (&mut a as *mut i32).cast(),
                    (&mut b as *mut i64).cast(),
                    (&mut c as *mut f64).cast(),
                ],
                (&mut ret as *mut u64).cast(),
            )
        };
        assert_eq!(ret, 17);
    }

    #[test]
    fn missing_library_is_reported() {
        let libs = NativeLibraries::new("/nonexistent");
        assert_eq!(
            libs.get_function("nolib", "f"),
            Err(NativeLibraryError::LibraryNotFound("nolib".to_string()))
        );
    }

    #[test]
    fn candidate_paths_try_the_plain_name_first() {
        let libs = NativeLibraries::new("/opt/native");
        let paths: Vec<PathBuf> = {
            let name = String::from("m");
            libs.candidates(&name).collect()
        };
        assert_eq!(paths[0], PathBuf::from("/opt/native/m"));
        assert_eq!(paths.len(), 1 + 2 * SUFFIXES.len());
        assert_eq!(paths[2], PathBuf::from(format!("/opt/native/libm{}", SUFFIXES[0])));
    }
}
