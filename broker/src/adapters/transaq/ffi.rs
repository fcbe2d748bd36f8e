//! Foreign call interface of the native connector library.
//!
//! The library pushes every server message through one registered callback
//! and answers commands synchronously. Each string it hands out is owned by
//! the library and must be returned through `FreeMemory`.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::ptr;
use std::sync::{Arc, PoisonError, RwLock};

use libloading::Library;
use tracing::{debug, error, info};

use crate::error::BrokerError;

/// Receives each callback payload as an owned string. Must not block.
pub type CallbackSink = Arc<dyn Fn(String) + Send + Sync>;

pub trait ForeignTransport: Send + Sync {
    fn initialize(&self, log_dir: &Path, log_level: u8) -> Result<(), BrokerError>;
    fn set_callback(&self, sink: CallbackSink) -> Result<(), BrokerError>;
    /// Detaches the sink; payloads arriving afterwards are dropped.
    fn clear_callback(&self);
    /// `command` is a nul-terminated XML document.
    fn send_command(&self, command: &[u8]) -> Result<String, BrokerError>;
    fn uninitialize(&self) -> Result<(), BrokerError>;
}

type InitializeFn = unsafe extern "system" fn(*const c_char, c_int) -> *mut c_char;
type PayloadCallback = extern "system" fn(*mut c_char, *mut c_void) -> bool;
type SetCallbackExFn = unsafe extern "system" fn(PayloadCallback, *mut c_void) -> bool;
type SendCommandFn = unsafe extern "system" fn(*const c_char) -> *mut c_char;
type FreeMemoryFn = unsafe extern "system" fn(*mut c_char) -> bool;
type UnInitializeFn = unsafe extern "system" fn() -> *mut c_char;

/// A library-owned string, released on drop.
struct ForeignBuffer {
    ptr: *mut c_char,
    free: FreeMemoryFn,
}

impl ForeignBuffer {
    fn new(ptr: *mut c_char, free: FreeMemoryFn) -> Option<Self> {
        (!ptr.is_null()).then_some(Self { ptr, free })
    }

    fn to_string_lossy(&self) -> String {
        // SAFETY: non-null and nul-terminated per the library contract; the
        // buffer stays valid until `FreeMemory` runs in `drop`.
        unsafe { CStr::from_ptr(self.ptr) }.to_string_lossy().into_owned()
    }
}

impl Drop for ForeignBuffer {
    fn drop(&mut self) {
        // SAFETY: `ptr` came from the library and is freed exactly once.
        unsafe {
            (self.free)(self.ptr);
        }
    }
}

struct CallbackSlot {
    sink: RwLock<Option<CallbackSink>>,
    free: FreeMemoryFn,
}

extern "system" fn on_payload(data: *mut c_char, context: *mut c_void) -> bool {
    if context.is_null() {
        return false;
    }
    // SAFETY: `context` is the leaked `CallbackSlot` registered in
    // `set_callback`; it lives for the rest of the process.
    let slot = unsafe { &*(context as *const CallbackSlot) };
    let Some(buffer) = ForeignBuffer::new(data, slot.free) else {
        return true;
    };
    let payload = buffer.to_string_lossy();
    drop(buffer);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let sink = slot.sink.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(sink) = sink.as_ref() {
            sink(payload);
        }
    }));
    outcome.is_ok()
}

/// Transport over the dynamically loaded connector library.
pub struct DllTransport {
    initialize: InitializeFn,
    set_callback_ex: SetCallbackExFn,
    send_command: SendCommandFn,
    free_memory: FreeMemoryFn,
    uninitialize: UnInitializeFn,
    slot: &'static CallbackSlot,
    _library: Library,
}

impl DllTransport {
    pub fn load(path: &Path) -> Result<Self, BrokerError> {
        // SAFETY: loading runs the library's initializers; the path is trusted
        // configuration.
        let library = unsafe { Library::new(path) }
            .map_err(|err| BrokerError::Fatal(format!("cannot load {}: {err}", path.display())))?;

        // SAFETY: the signatures match the exported functions of the library.
        let (initialize, set_callback_ex, send_command, free_memory, uninitialize) = unsafe {
            (
                *library.get::<InitializeFn>(b"Initialize\0").map_err(missing_symbol)?,
                *library.get::<SetCallbackExFn>(b"SetCallbackEx\0").map_err(missing_symbol)?,
                *library.get::<SendCommandFn>(b"SendCommand\0").map_err(missing_symbol)?,
                *library.get::<FreeMemoryFn>(b"FreeMemory\0").map_err(missing_symbol)?,
                *library.get::<UnInitializeFn>(b"UnInitialize\0").map_err(missing_symbol)?,
            )
        };

        // The library may call back at any time until the process exits.
        let slot: &'static CallbackSlot = Box::leak(Box::new(CallbackSlot {
            sink: RwLock::new(None),
            free: free_memory,
        }));

        info!(path = %path.display(), "connector library loaded");
        Ok(Self {
            initialize,
            set_callback_ex,
            send_command,
            free_memory,
            uninitialize,
            slot,
            _library: library,
        })
    }

    fn take_text(&self, ptr: *mut c_char) -> Option<String> {
        ForeignBuffer::new(ptr, self.free_memory).map(|buffer| buffer.to_string_lossy())
    }
}

impl ForeignTransport for DllTransport {
    fn initialize(&self, log_dir: &Path, log_level: u8) -> Result<(), BrokerError> {
        let dir = CString::new(log_dir.to_string_lossy().into_owned())
            .map_err(|_| BrokerError::Fatal("log directory contains a nul byte".to_string()))?;
        // SAFETY: `dir` outlives the call; a non-null result is an error text.
        let result = unsafe { (self.initialize)(dir.as_ptr(), c_int::from(log_level)) };
        match self.take_text(result) {
            None => Ok(()),
            Some(message) => Err(BrokerError::Fatal(message)),
        }
    }

    fn set_callback(&self, sink: CallbackSink) -> Result<(), BrokerError> {
        *self.slot.sink.write().unwrap_or_else(PoisonError::into_inner) = Some(sink);
        let context = ptr::from_ref(self.slot).cast_mut().cast::<c_void>();
        // SAFETY: `on_payload` matches the callback signature and `context`
        // points at a `'static` slot.
        let accepted = unsafe { (self.set_callback_ex)(on_payload, context) };
        if accepted {
            Ok(())
        } else {
            Err(BrokerError::Fatal("callback registration refused".to_string()))
        }
    }

    fn clear_callback(&self) {
        *self.slot.sink.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn send_command(&self, command: &[u8]) -> Result<String, BrokerError> {
        let command = CStr::from_bytes_with_nul(command)
            .map_err(|_| BrokerError::InvalidRequest("command is not nul-terminated".to_string()))?;
        // SAFETY: `command` is nul-terminated and outlives the call.
        let result = unsafe { (self.send_command)(command.as_ptr()) };
        self.take_text(result)
            .ok_or_else(|| BrokerError::Transport("command returned no response".to_string()))
    }

    fn uninitialize(&self) -> Result<(), BrokerError> {
        self.clear_callback();
        // SAFETY: no arguments; a non-null result is an error text.
        let result = unsafe { (self.uninitialize)() };
        match self.take_text(result) {
            None => {
                debug!("connector library uninitialized");
                Ok(())
            }
            Some(message) => {
                error!(error = %message, "connector library failed to uninitialize");
                Err(BrokerError::Transport(message))
            }
        }
    }
}

fn missing_symbol(err: libloading::Error) -> BrokerError {
    BrokerError::Fatal(format!("connector library is missing an export: {err}"))
}
