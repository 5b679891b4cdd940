//! C ABI for linking cloudlet-core as a static library from Android (NDK) or
//! other C/C++ hosts. Hosts drive a session by polling rather than by
//! callback, so no foreign code runs on the runtime threads.

use std::ffi::{c_void, CStr};
use std::net::ToSocketAddrs;
use std::os::raw::{c_char, c_int};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::time;

use crate::manifest::OverlayManifest;
use crate::protocol::{SynthesisOptions, PROTOCOL_VERSION};
use crate::session::{SessionConfig, SessionEvent, SynthesisSession};

/// Event kinds returned by `cloudlet_session_poll`.
pub const CLOUDLET_EVENT_NONE: c_int = 0;
pub const CLOUDLET_EVENT_STATUS: c_int = 1;
pub const CLOUDLET_EVENT_PROGRESS: c_int = 2;
pub const CLOUDLET_EVENT_SUCCESS: c_int = 3;
pub const CLOUDLET_EVENT_FAILURE: c_int = 4;

struct FfiSession {
    runtime: Runtime,
    session: SynthesisSession,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    /// Event that did not fit the caller's buffer, kept for the next poll.
    pending: Option<(c_int, String)>,
}

/// Returns the protocol version. Used so the staticlib exports a C symbol and is linkable.
#[no_mangle]
pub extern "C" fn cloudlet_protocol_version() -> i64 {
    PROTOCOL_VERSION
}

/// Start a synthesis session against `host:port` with the overlay directory
/// at `overlay_dir` (both NUL-terminated UTF-8). Option flags are booleans
/// (nonzero = on). Returns an opaque handle, or null on bad arguments,
/// unresolvable host, or unreadable overlay.
#[no_mangle]
pub extern "C" fn cloudlet_session_start(
    host: *const c_char,
    port: u16,
    overlay_dir: *const c_char,
    display_vnc: c_int,
    early_start: c_int,
    show_statistics: c_int,
) -> *mut c_void {
    if host.is_null() || overlay_dir.is_null() {
        return std::ptr::null_mut();
    }
    let host = match unsafe { CStr::from_ptr(host) }.to_str() {
        Ok(s) => s,
        Err(_) => return std::ptr::null_mut(),
    };
    let overlay_dir = match unsafe { CStr::from_ptr(overlay_dir) }.to_str() {
        Ok(s) => s,
        Err(_) => return std::ptr::null_mut(),
    };
    let addr = match (host, port).to_socket_addrs() {
        Ok(mut addrs) => match addrs.next() {
            Some(addr) => addr,
            None => return std::ptr::null_mut(),
        },
        Err(_) => return std::ptr::null_mut(),
    };
    let manifest = match OverlayManifest::load(overlay_dir) {
        Ok(manifest) => Arc::new(manifest),
        Err(_) => return std::ptr::null_mut(),
    };
    let runtime = match Runtime::new() {
        Ok(runtime) => runtime,
        Err(_) => return std::ptr::null_mut(),
    };
    let config = SessionConfig {
        options: SynthesisOptions {
            display_vnc: display_vnc != 0,
            early_start: early_start != 0,
            show_statistics: show_statistics != 0,
        },
        ..SessionConfig::default()
    };
    let (session, events) = {
        let _guard = runtime.enter();
        SynthesisSession::start(addr, manifest, config)
    };
    Box::into_raw(Box::new(FfiSession {
        runtime,
        session,
        events,
        pending: None,
    })) as *mut c_void
}

/// Wait up to `wait_ms` for the next session event. Returns the event kind,
/// `CLOUDLET_EVENT_NONE` when nothing arrived in time or the session is
/// finished, or -1 on bad arguments or a too-small buffer. The event text
/// (status line, percent as decimal, application name, or failure reason;
/// UTF-8, not NUL-terminated) is copied into `out_text` and its length
/// stored in `out_text_len`. An event that does not fit is kept and
/// redelivered by the next call, so a -1 never loses it. 1024 bytes is
/// plenty.
#[no_mangle]
pub extern "C" fn cloudlet_session_poll(
    h: *mut c_void,
    wait_ms: u64,
    out_text: *mut u8,
    out_text_cap: usize,
    out_text_len: *mut usize,
) -> c_int {
    if h.is_null() || out_text.is_null() || out_text_len.is_null() {
        return -1;
    }
    let ffi = unsafe { &mut *(h as *mut FfiSession) };
    let FfiSession {
        runtime,
        events,
        pending,
        ..
    } = ffi;
    let (kind, text) = match pending.take() {
        Some(kept) => kept,
        None => {
            let event = runtime.block_on(async {
                match time::timeout(Duration::from_millis(wait_ms), events.recv()).await {
                    Ok(event) => event,
                    Err(_) => None,
                }
            });
            match event {
                None => {
                    unsafe { *out_text_len = 0 };
                    return CLOUDLET_EVENT_NONE;
                }
                Some(SessionEvent::Status(text)) => (CLOUDLET_EVENT_STATUS, text),
                Some(SessionEvent::Progress(percent)) => {
                    (CLOUDLET_EVENT_PROGRESS, percent.to_string())
                }
                Some(SessionEvent::Succeeded { app_name }) => (CLOUDLET_EVENT_SUCCESS, app_name),
                Some(SessionEvent::Failed { reason }) => (CLOUDLET_EVENT_FAILURE, reason),
            }
        }
    };
    if text.len() > out_text_cap {
        *pending = Some((kind, text));
        return -1;
    }
    unsafe {
        out_text.copy_from_nonoverlapping(text.as_ptr(), text.len());
        *out_text_len = text.len();
    }
    kind
}

/// Close the session: best-effort finish exchange, then teardown. Safe to
/// call more than once. Returns 0, or -1 if h is null.
#[no_mangle]
pub extern "C" fn cloudlet_session_close(h: *mut c_void) -> c_int {
    if h.is_null() {
        return -1;
    }
    let ffi = unsafe { &mut *(h as *mut FfiSession) };
    let FfiSession {
        runtime, session, ..
    } = ffi;
    runtime.block_on(session.close());
    0
}

/// Destroy the session handle. Call `cloudlet_session_close` first for a
/// graceful finish; destroying alone cancels outright. No-op if h is null.
#[no_mangle]
pub extern "C" fn cloudlet_session_destroy(h: *mut c_void) {
    if h.is_null() {
        return;
    }
    let _ = unsafe { Box::from_raw(h as *mut FfiSession) };
}
