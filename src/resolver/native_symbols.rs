//! Native address-to-symbol lookups (§4.8): `dladdr` on POSIX,
//! `DbgHelp` on Windows. Never called from signal context — only from
//! the resolver, which may block and allocate freely.

/// Nearest exported symbol at or below `addr`, plus the library it
/// came from. `None` when the platform call itself fails to resolve
/// anything (an address in an anonymous mapping, a stripped binary).
pub struct NativeSymbol {
    pub library_path: String,
    pub symbol_name: String,
    /// Library's load base address, for [`super::merge::RuntimeLibraryRange`]
    /// classification without re-resolving.
    pub library_base: usize,
}

#[cfg(unix)]
pub fn resolve(addr: usize) -> Option<NativeSymbol> {
    use std::ffi::CStr;
    use std::mem::MaybeUninit;

    // SAFETY: `dladdr` only reads the loader's own symbol tables; the
    // output struct is fully initialized by the call whenever it
    // returns non-zero, which is the only case this function reads it.
    unsafe {
        let mut info = MaybeUninit::<libc::Dl_info>::zeroed();
        let rc = libc::dladdr(addr as *const libc::c_void, info.as_mut_ptr());
        if rc == 0 {
            return None;
        }
        let info = info.assume_init();
        if info.dli_fname.is_null() {
            return None;
        }
        let library_path = CStr::from_ptr(info.dli_fname).to_string_lossy().into_owned();
        let symbol_name = if info.dli_sname.is_null() {
            String::new()
        } else {
            CStr::from_ptr(info.dli_sname).to_string_lossy().into_owned()
        };
        Some(NativeSymbol {
            library_path,
            symbol_name,
            library_base: info.dli_fbase as usize,
        })
    }
}

#[cfg(windows)]
pub fn resolve(addr: usize) -> Option<NativeSymbol> {
    use std::mem::size_of;
    use std::sync::Once;

    use windows_sys::Win32::System::Diagnostics::Debug::{
        SymFromAddr, SymGetModuleInfo64, SymInitialize, IMAGEHLP_MODULE64, SYMBOL_INFO,
    };
    use windows_sys::Win32::System::Threading::GetCurrentProcess;

    const MAX_SYM_NAME: usize = 2000;

    static SYM_INIT: Once = Once::new();
    SYM_INIT.call_once(|| {
        // SAFETY: `SymInitialize` is safe to call on the current
        // pseudo-handle with a null search path; `Once` guarantees it
        // runs exactly once per process, matching DbgHelp's
        // one-init-per-process contract.
        unsafe {
            SymInitialize(GetCurrentProcess(), std::ptr::null(), 1);
        }
    });

    // `SYMBOL_INFO` ends in a flexible `Name` array; back it with a
    // byte buffer sized for the struct plus `MAX_SYM_NAME` bytes of
    // name and tell DbgHelp that size via `SizeOfStruct`/`MaxNameLen`.
    let mut buf = vec![0u8; size_of::<SYMBOL_INFO>() + MAX_SYM_NAME];
    let info = buf.as_mut_ptr() as *mut SYMBOL_INFO;
    // SAFETY: `info` points at `buf`, which is large enough to hold a
    // `SYMBOL_INFO` plus `MAX_SYM_NAME` bytes of trailing name data.
    unsafe {
        (*info).SizeOfStruct = size_of::<SYMBOL_INFO>() as u32;
        (*info).MaxNameLen = MAX_SYM_NAME as u32;
    }

    let mut displacement: u64 = 0;
    // SAFETY: `info` is a live, correctly-sized `SYMBOL_INFO`
    // allocation for the duration of this call; `SymFromAddr` never
    // writes past `SizeOfStruct + MaxNameLen` bytes.
    let resolved = unsafe { SymFromAddr(GetCurrentProcess(), addr as u64, &mut displacement, info) };
    if resolved == 0 {
        return None;
    }

    // SAFETY: `NameLen` is populated by the successful `SymFromAddr`
    // call above and bounded by the `MaxNameLen` passed to it.
    let symbol_name = unsafe {
        let name_len = (*info).NameLen as usize;
        let name_ptr = (*info).Name.as_ptr();
        let slice = std::slice::from_raw_parts(name_ptr, name_len);
        String::from_utf8_lossy(slice).into_owned()
    };

    let mut module: IMAGEHLP_MODULE64 = unsafe { std::mem::zeroed() };
    module.SizeOfStruct = size_of::<IMAGEHLP_MODULE64>() as u32;
    // SAFETY: `module` is zeroed and sized per `SizeOfStruct`;
    // `SymGetModuleInfo64` only ever writes fields within it.
    let has_module = unsafe { SymGetModuleInfo64(GetCurrentProcess(), addr as u64, &mut module) } != 0;
    if !has_module {
        return Some(NativeSymbol {
            library_path: String::new(),
            symbol_name,
            library_base: 0,
        });
    }

    let library_path = {
        let raw = &module.ImageName;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        String::from_utf8_lossy(&raw[..end]).into_owned()
    };

    Some(NativeSymbol {
        library_path,
        symbol_name,
        library_base: module.BaseOfImage as usize,
    })
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;

    #[test]
    fn resolves_a_known_in_process_function() {
        let addr = resolve as *const () as usize;
        let symbol = resolve(addr);
        assert!(symbol.is_some(), "dladdr should resolve a function in this binary");
    }

    #[test]
    fn returns_none_for_an_address_with_no_mapping() {
        assert!(resolve(0x1).is_none());
    }
}
