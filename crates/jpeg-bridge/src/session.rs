//! Engine error capture, guarded engine calls and the session lifecycle.
//!
//! The engine reports fatal errors through an `error_exit` callback that must
//! not return. Ours records the failure on the session's [`ErrorManager`] and
//! unwinds with an [`EngineAbort`] marker; [`engine_call`] catches the marker
//! at the boundary of every engine entry point. The controller then reads the
//! recorded [`Outcome`] and turns it into a [`CodecError`]. Warnings are
//! recorded the same way without unwinding.

use std::ffi::c_int;
use std::panic::{self, AssertUnwindSafe};

use mozjpeg_sys::{
    jpeg_common_struct, jpeg_error_mgr, jpeg_std_error, JWRN_HIT_MARKER, JWRN_JPEG_EOF,
};

use crate::registry::Direction;
use crate::types::CodecError;

/// Warnings kept per engine call; corrupt streams can emit one per block.
const MAX_WARNINGS: usize = 16;

/// What stopped a session from the inside.
#[derive(Debug)]
pub(crate) enum Failure {
    /// The engine's own error message.
    Engine(String),
    /// A bridge callback could not continue.
    Bridge(CodecError),
}

/// Result of one engine call, as recorded by the error manager.
#[derive(Debug)]
pub(crate) enum Outcome {
    Ok,
    Warning(String),
    Fatal(Failure),
}

/// Unwind payload marking an engine abort. The reason is on the session.
#[derive(Debug)]
pub(crate) struct EngineAbort;

/// Engine error manager extended with the session's outcome slots.
///
/// `base` must stay the first field: the engine hands callbacks a pointer to
/// it and we cast back to the whole struct.
#[repr(C)]
pub(crate) struct ErrorManager {
    base: jpeg_error_mgr,
    warnings: Vec<String>,
    fatal: Option<Failure>,
    data_ended_early: bool,
}

impl ErrorManager {
    pub(crate) fn new() -> Box<Self> {
        let mut manager = Box::new(Self {
            // SAFETY: all-zero is a valid jpeg_error_mgr (null pointers,
            // `None` callbacks); jpeg_std_error fills it in.
            base: unsafe { std::mem::zeroed() },
            warnings: Vec::new(),
            fatal: None,
            data_ended_early: false,
        });
        unsafe {
            jpeg_std_error(&mut manager.base);
        }
        manager.base.error_exit = Some(error_exit);
        manager.base.emit_message = Some(emit_message);
        manager.base.output_message = Some(output_message);
        manager
    }

    /// Pointer to install as the engine object's `err`.
    pub(crate) fn engine_ptr(&mut self) -> *mut jpeg_error_mgr {
        &mut self.base
    }

    /// The engine ran out of entropy-coded data before the image was
    /// complete. Stays set for the rest of the session.
    pub(crate) fn data_ended_early(&self) -> bool {
        self.data_ended_early
    }

    /// Drain what the engine reported since the last call.
    pub(crate) fn take_outcome(&mut self) -> Outcome {
        let warnings = std::mem::take(&mut self.warnings);
        if let Some(failure) = self.fatal.take() {
            return Outcome::Fatal(failure);
        }
        if warnings.is_empty() {
            Outcome::Ok
        } else {
            Outcome::Warning(warnings.join("; "))
        }
    }
}

/// Record `failure` on the session owning `cinfo` and unwind to the nearest
/// [`engine_call`].
///
/// # Safety
///
/// `cinfo.err` must point at the `base` of a live [`ErrorManager`].
pub(crate) unsafe fn abort(cinfo: &mut jpeg_common_struct, failure: Failure) -> ! {
    let manager = unsafe { &mut *(cinfo.err as *mut ErrorManager) };
    if manager.fatal.is_none() {
        manager.fatal = Some(failure);
    }
    panic::resume_unwind(Box::new(EngineAbort))
}

/// Run one engine entry point, catching an engine abort.
///
/// Panics that are not engine aborts keep unwinding.
pub(crate) fn engine_call<T>(f: impl FnOnce() -> T) -> Result<T, EngineAbort> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Ok(value),
        Err(payload) => match payload.downcast::<EngineAbort>() {
            Ok(abort) => Err(*abort),
            Err(other) => panic::resume_unwind(other),
        },
    }
}

/// Fold one engine call's result into a [`CodecError`].
///
/// `bridge_error` is what the source or destination recorded during the
/// call; it wins over the engine's own report, which is usually just a
/// consequence of it. Engine messages go through `engine_error`.
pub(crate) fn settle<T>(
    result: Result<T, EngineAbort>,
    outcome: Outcome,
    bridge_error: Option<CodecError>,
    engine_error: impl FnOnce(String) -> CodecError,
) -> Result<T, CodecError> {
    let failure = match outcome {
        Outcome::Ok => None,
        Outcome::Warning(message) => {
            log::warn!("JPEG engine warning: {message}");
            None
        }
        Outcome::Fatal(failure) => Some(failure),
    };
    if let Some(err) = bridge_error {
        return Err(err);
    }
    match (failure, result) {
        (Some(Failure::Bridge(err)), _) => Err(err),
        (Some(Failure::Engine(message)), _) => Err(engine_error(message)),
        (None, Ok(value)) => Ok(value),
        (None, Err(EngineAbort)) => Err(CodecError::InternalInvariant(
            "engine aborted without reporting an error".to_string(),
        )),
    }
}

unsafe extern "C-unwind" fn error_exit(cinfo: &mut jpeg_common_struct) {
    let message = unsafe { format_message(cinfo) };
    unsafe { abort(cinfo, Failure::Engine(message)) }
}

unsafe extern "C-unwind" fn emit_message(cinfo: &mut jpeg_common_struct, msg_level: c_int) {
    if msg_level < 0 {
        let message = unsafe { format_message(cinfo) };
        let manager = unsafe { &mut *(cinfo.err as *mut ErrorManager) };
        manager.base.num_warnings += 1;
        if matches!(manager.base.msg_code, JWRN_HIT_MARKER | JWRN_JPEG_EOF) {
            manager.data_ended_early = true;
        }
        if manager.warnings.len() < MAX_WARNINGS {
            manager.warnings.push(message);
        }
    } else if log::log_enabled!(log::Level::Trace) {
        let message = unsafe { format_message(cinfo) };
        log::trace!("engine: {message}");
    }
}

/// Messages reach the caller through [`Outcome`], never stderr.
unsafe extern "C-unwind" fn output_message(_cinfo: &mut jpeg_common_struct) {}

unsafe fn format_message(cinfo: &mut jpeg_common_struct) -> String {
    let (format, code) = {
        let err = unsafe { &*cinfo.err };
        (err.format_message, err.msg_code)
    };
    match format {
        Some(format) => {
            let mut buffer = [0u8; 80];
            unsafe { format(cinfo, &mut buffer) };
            let len = buffer.iter().position(|&b| b == 0).unwrap_or(buffer.len());
            String::from_utf8_lossy(&buffer[..len]).into_owned()
        }
        None => format!("engine error code {code}"),
    }
}

/// Packed output formats this build can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Four-component (RGBA) output.
    pub rgba_output: bool,
}

impl Capabilities {
    /// What this build supports.
    ///
    /// RGBA is assembled from the engine's RGB rows, which every engine
    /// build produces, so it is a constant of the build rather than a
    /// runtime query.
    pub fn linked() -> Self {
        Self { rgba_output: true }
    }
}

/// Packed output formats this build supports.
pub fn capabilities() -> Capabilities {
    Capabilities::linked()
}

/// Whether RGBA decoding is available in this build.
pub fn supports_rgba() -> bool {
    capabilities().rgba_output
}

/// Lifecycle of one decode or encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    /// Engine object created and registered.
    Opened,
    /// Bridges installed, parameters chosen, header read or written.
    Configured,
    /// Scanline transfer in progress.
    Streaming,
    Completed,
    Failed,
}

impl SessionState {
    fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Opened, Configured)
                | (Configured, Streaming)
                | (Streaming, Completed)
                | (Opened | Configured | Streaming, Failed)
        )
    }
}

/// State machine shared by both session kinds, with transition logging.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: SessionState,
    direction: Direction,
}

impl Lifecycle {
    pub(crate) fn new(direction: Direction) -> Self {
        log::debug!("{direction:?} session opened");
        Self {
            state: SessionState::Opened,
            direction,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn advance(&mut self, next: SessionState) -> Result<(), CodecError> {
        if !self.state.can_advance_to(next) {
            return Err(CodecError::InternalInvariant(format!(
                "{:?} session cannot move from {:?} to {:?}",
                self.direction, self.state, next
            )));
        }
        log::debug!("{:?} session {:?} -> {:?}", self.direction, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Mark the session failed. Terminal states are left alone.
    pub(crate) fn fail(&mut self, err: &CodecError) {
        if self.state.can_advance_to(SessionState::Failed) {
            log::debug!("{:?} session failed: {err}", self.direction);
            self.state = SessionState::Failed;
        }
    }
}
