//! Extended startup attribute list carrying a pseudo console handle.

use std::io;
use std::mem;
use std::ptr;

use winapi::shared::minwindef::DWORD;
use winapi::um::processthreadsapi::{
    DeleteProcThreadAttributeList, InitializeProcThreadAttributeList, UpdateProcThreadAttribute,
    LPPROC_THREAD_ATTRIBUTE_LIST,
};

use super::conpty::HPCON;
use crate::error::{PtyError, Result};

const PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE: usize = 0x0002_0016;

pub(crate) struct ProcThreadAttributeList {
    /// `usize` words keep the opaque list pointer-aligned.
    data: Vec<usize>,
}

impl ProcThreadAttributeList {
    pub(crate) fn with_capacity(attributes: DWORD) -> Result<Self> {
        let mut bytes_required: usize = 0;
        // SAFETY: sizing call, writes only `bytes_required`
        unsafe {
            InitializeProcThreadAttributeList(ptr::null_mut(), attributes, 0, &mut bytes_required)
        };
        let words = bytes_required.div_ceil(mem::size_of::<usize>());
        let mut list = ProcThreadAttributeList {
            data: vec![0; words.max(1)],
        };

        // SAFETY: the buffer holds at least `bytes_required` bytes
        let ok = unsafe {
            InitializeProcThreadAttributeList(list.as_mut_ptr(), attributes, 0, &mut bytes_required)
        };
        if ok == 0 {
            // Never initialized; nothing to delete.
            let err = io::Error::last_os_error();
            mem::forget(list);
            return Err(PtyError::launch(
                "InitializeProcThreadAttributeList",
                err,
            ));
        }
        Ok(list)
    }

    pub(crate) fn as_mut_ptr(&mut self) -> LPPROC_THREAD_ATTRIBUTE_LIST {
        self.data.as_mut_ptr() as LPPROC_THREAD_ATTRIBUTE_LIST
    }

    /// Attaches `console`; it must outlive process creation.
    pub(crate) fn set_pseudo_console(&mut self, console: HPCON) -> Result<()> {
        // SAFETY: the list was initialized with room for one attribute
        let ok = unsafe {
            UpdateProcThreadAttribute(
                self.as_mut_ptr(),
                0,
                PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE,
                console,
                mem::size_of::<HPCON>(),
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(PtyError::launch(
                "UpdateProcThreadAttribute",
                io::Error::last_os_error(),
            ));
        }
        Ok(())
    }
}

impl Drop for ProcThreadAttributeList {
    fn drop(&mut self) {
        // SAFETY: initialized in `with_capacity`
        unsafe { DeleteProcThreadAttributeList(self.as_mut_ptr()) };
    }
}
