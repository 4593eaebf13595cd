//! C interface
//!
//! Mirrors `include/mtmd-ios.h`. Every function tolerates null pointers and
//! never lets a panic unwind into the host.
//!
//! Errors are reported in two tiers: a return code (`0`/`-1`, or a null
//! context from [`mtmd_ios_init`]) and a per-context message from
//! [`mtmd_ios_get_last_error`]. The message is cleared at the start of every
//! call on the context, so it always describes the most recent call.

#![allow(non_camel_case_types)]

use std::ffi::{c_char, c_float, c_int, CStr, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::ptr;

use tracing::{error, warn};

use crate::chat::Role;
use crate::error::SessionError;
use crate::params::{SessionParams, DEFAULT_SEED};
use crate::session::Session;

/// Opaque session handle
#[derive(Debug)]
pub struct mtmd_ios_context {
    session: Session,
    last_error: Option<CString>,
}

impl mtmd_ios_context {
    fn record(&mut self, result: Result<(), SessionError>) -> c_int {
        match result {
            Ok(()) => 0,
            Err(err) => {
                self.set_error(&err);
                -1
            }
        }
    }

    fn set_error(&mut self, err: &SessionError) {
        warn!(error = %err, "call failed");
        self.last_error = Some(to_c_string(err.to_string()));
    }
}

/// Session parameters, see [`SessionParams`]
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct mtmd_ios_params {
    /// NUL-terminated UTF-8 path of the language model
    pub model_path: *const c_char,
    /// NUL-terminated UTF-8 path of the multimodal projector
    pub mmproj_path: *const c_char,
    /// Tokens generated per turn; `<= 0` runs until end of generation
    pub n_predict: c_int,
    /// Context window size
    pub n_ctx: c_int,
    /// Evaluation threads
    pub n_threads: c_int,
    /// Sampling temperature
    pub temperature: c_float,
    /// Offload the language model to the GPU
    pub use_gpu: bool,
    /// Run the projector on the GPU
    pub mmproj_use_gpu: bool,
    /// Run a warmup evaluation during init
    pub warmup: bool,
}

/// Result of one [`mtmd_ios_loop`] call
#[repr(C)]
#[derive(Debug)]
pub struct mtmd_ios_token {
    /// Generated text owned by the caller, release with [`mtmd_ios_string_free`]; may be null
    pub token: *mut c_char,
    /// Whether generation has ended
    pub is_end: bool,
}

impl mtmd_ios_token {
    fn end() -> Self {
        Self {
            token: ptr::null_mut(),
            is_end: true,
        }
    }
}

/// Wrap a session created from Rust in a C handle
///
/// Lets Rust hosts plug a custom [`Engine`](crate::Engine) into code written
/// against the C interface. Release the handle with [`mtmd_ios_free`].
pub fn into_raw(session: Session) -> *mut mtmd_ios_context {
    Box::into_raw(Box::new(mtmd_ios_context {
        session,
        last_error: None,
    }))
}

/// Default parameters with null paths
#[no_mangle]
pub extern "C" fn mtmd_ios_params_default() -> mtmd_ios_params {
    let defaults = SessionParams::default();
    mtmd_ios_params {
        model_path: ptr::null(),
        mmproj_path: ptr::null(),
        n_predict: defaults.n_predict,
        n_ctx: c_int::try_from(defaults.n_ctx).unwrap_or(c_int::MAX),
        n_threads: defaults.n_threads,
        temperature: defaults.temperature,
        use_gpu: defaults.use_gpu,
        mmproj_use_gpu: defaults.mmproj_use_gpu,
        warmup: defaults.warmup,
    }
}

/// Create a session, returning null on any failure
///
/// No error text is available when this fails; the reason is logged.
///
/// # Safety
///
/// `params` must be null or point to a valid `mtmd_ios_params` whose paths are
/// null or NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn mtmd_ios_init(params: *const mtmd_ios_params) -> *mut mtmd_ios_context {
    let created = catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: caller guarantees `params` is null or valid
        let raw = unsafe { params.as_ref() }
            .ok_or_else(|| SessionError::InvalidArgument("params is null".into()))?;
        // SAFETY: caller guarantees the path pointers
        let params = unsafe { session_params(raw) }?;
        Session::new(&params)
    }));
    match created {
        Ok(Ok(session)) => into_raw(session),
        Ok(Err(err)) => {
            error!(error = %err, "failed to create session");
            ptr::null_mut()
        }
        Err(_) => {
            error!("panic while creating session");
            ptr::null_mut()
        }
    }
}

/// Release a session and everything it owns
///
/// # Safety
///
/// `ctx` must be null or a handle from [`mtmd_ios_init`] or [`into_raw`] that
/// has not been freed.
#[no_mangle]
pub unsafe extern "C" fn mtmd_ios_free(ctx: *mut mtmd_ios_context) {
    if ctx.is_null() {
        return;
    }
    // SAFETY: the handle came from Box::into_raw and is freed exactly once
    let context = unsafe { Box::from_raw(ctx) };
    if catch_unwind(AssertUnwindSafe(move || drop(context))).is_err() {
        error!("panic while releasing session");
    }
}

/// Append an image; returns 0 on success, -1 on failure
///
/// # Safety
///
/// `ctx` must be null or a live handle; `image_path` must be null or a
/// NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn mtmd_ios_prefill_image(
    ctx: *mut mtmd_ios_context,
    image_path: *const c_char,
) -> c_int {
    // SAFETY: forwarded caller guarantees
    unsafe {
        with_context(ctx, -1, |context| {
            let result = path_arg(image_path, "image_path")
                .and_then(|path| context.session.prefill_image(path));
            context.record(result)
        })
    }
}

/// Append a video frame; returns 0 on success, -1 on failure
///
/// # Safety
///
/// Same as [`mtmd_ios_prefill_image`].
#[no_mangle]
pub unsafe extern "C" fn mtmd_ios_prefill_frame(
    ctx: *mut mtmd_ios_context,
    frame_path: *const c_char,
) -> c_int {
    // SAFETY: forwarded caller guarantees
    unsafe {
        with_context(ctx, -1, |context| {
            let result = path_arg(frame_path, "frame_path")
                .and_then(|path| context.session.prefill_frame(path));
            context.record(result)
        })
    }
}

/// Append a chat turn; `role` is `system`, `user` or `assistant`
///
/// Returns 0 on success, -1 on failure.
///
/// # Safety
///
/// `ctx` must be null or a live handle; `text` and `role` must be null or
/// NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn mtmd_ios_prefill_text(
    ctx: *mut mtmd_ios_context,
    text: *const c_char,
    role: *const c_char,
) -> c_int {
    // SAFETY: forwarded caller guarantees
    unsafe {
        with_context(ctx, -1, |context| {
            let result = str_arg(text, "text").and_then(|text| {
                let role: Role = str_arg(role, "role")?.parse()?;
                context.session.prefill_text(text, role)
            });
            context.record(result)
        })
    }
}

/// Generate one token
///
/// `token` is owned by the caller and must be released with
/// [`mtmd_ios_string_free`] when non-null. An error ends generation with a
/// null `token`, `is_end` set and the message in [`mtmd_ios_get_last_error`].
///
/// # Safety
///
/// `ctx` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn mtmd_ios_loop(ctx: *mut mtmd_ios_context) -> mtmd_ios_token {
    // SAFETY: forwarded caller guarantees
    unsafe {
        with_context(ctx, mtmd_ios_token::end(), |context| {
            match context.session.next_token() {
                Ok(token) if token.is_end && token.text.is_empty() => mtmd_ios_token::end(),
                Ok(token) => mtmd_ios_token {
                    token: to_c_string(token.text).into_raw(),
                    is_end: token.is_end,
                },
                Err(err) => {
                    context.set_error(&err);
                    mtmd_ios_token::end()
                }
            }
        })
    }
}

/// Message of the most recent failed call, or null
///
/// The string belongs to the context and stays valid until the next call on
/// it. Do not pass it to [`mtmd_ios_string_free`].
///
/// # Safety
///
/// `ctx` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn mtmd_ios_get_last_error(ctx: *mut mtmd_ios_context) -> *const c_char {
    // SAFETY: caller guarantees `ctx` is null or live
    match unsafe { ctx.as_ref() } {
        Some(context) => context
            .last_error
            .as_ref()
            .map_or(ptr::null(), |message| message.as_ptr()),
        None => ptr::null(),
    }
}

/// Clear the context and start a new conversation; returns 0, or -1 for a null handle
///
/// # Safety
///
/// `ctx` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn mtmd_ios_clean_kv_cache(ctx: *mut mtmd_ios_context) -> c_int {
    // SAFETY: forwarded caller guarantees
    unsafe {
        with_context(ctx, -1, |context| {
            context.session.clear();
            0
        })
    }
}

/// Release a string returned by [`mtmd_ios_loop`]; null is ignored
///
/// # Safety
///
/// `string` must be null or a string from [`mtmd_ios_loop`] not yet released.
#[no_mangle]
pub unsafe extern "C" fn mtmd_ios_string_free(string: *mut c_char) {
    if string.is_null() {
        return;
    }
    // SAFETY: the pointer came from CString::into_raw and is released once
    drop(unsafe { CString::from_raw(string) });
}

/// Run `f` on a live context, clearing the previous error first
unsafe fn with_context<T>(
    ctx: *mut mtmd_ios_context,
    fallback: T,
    f: impl FnOnce(&mut mtmd_ios_context) -> T,
) -> T {
    // SAFETY: caller guarantees `ctx` is null or live and not aliased
    let Some(context) = (unsafe { ctx.as_mut() }) else {
        warn!("call on a null context");
        return fallback;
    };
    context.last_error = None;
    match catch_unwind(AssertUnwindSafe(|| f(&mut *context))) {
        Ok(value) => value,
        Err(_) => {
            error!("panic inside session call");
            context.last_error = Some(to_c_string("internal error: session call panicked".into()));
            fallback
        }
    }
}

unsafe fn session_params(raw: &mtmd_ios_params) -> Result<SessionParams, SessionError> {
    // SAFETY: forwarded caller guarantees
    let model_path = unsafe { path_arg(raw.model_path, "model_path") }?;
    // SAFETY: forwarded caller guarantees
    let mmproj_path = unsafe { path_arg(raw.mmproj_path, "mmproj_path") }?;
    let n_ctx = u32::try_from(raw.n_ctx).map_err(|_| {
        SessionError::InvalidParams(format!("n_ctx must be greater than 0, got {}", raw.n_ctx))
    })?;
    Ok(SessionParams {
        model_path,
        mmproj_path,
        n_predict: raw.n_predict,
        n_ctx,
        n_threads: raw.n_threads,
        temperature: raw.temperature,
        use_gpu: raw.use_gpu,
        mmproj_use_gpu: raw.mmproj_use_gpu,
        warmup: raw.warmup,
        seed: DEFAULT_SEED,
    })
}

unsafe fn str_arg<'a>(ptr: *const c_char, name: &str) -> Result<&'a str, SessionError> {
    if ptr.is_null() {
        return Err(SessionError::InvalidArgument(format!("{name} is null")));
    }
    // SAFETY: caller guarantees a NUL-terminated string
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map_err(|e| SessionError::InvalidArgument(format!("{name} is not valid UTF-8: {e}")))
}

unsafe fn path_arg(ptr: *const c_char, name: &str) -> Result<PathBuf, SessionError> {
    // SAFETY: forwarded caller guarantees
    unsafe { str_arg(ptr, name) }.map(PathBuf::from)
}

/// Convert to a C string, dropping interior NULs
fn to_c_string(text: String) -> CString {
    CString::new(text).unwrap_or_else(|err| {
        let mut bytes = err.into_vec();
        bytes.retain(|&b| b != 0);
        CString::new(bytes).unwrap_or_default()
    })
}
