//! Destination bridge: drains the engine's output window into any [`Write`].
//!
//! The engine fills a fixed window and calls back when it is full and once
//! more at the end with the remainder. Write errors are recorded for the
//! controller; the engine is always told to continue, and later output is
//! dropped.

use std::io::{self, Write};

use mozjpeg_sys::{boolean, jpeg_compress_struct, jpeg_destination_mgr};

use crate::registry::{self, Direction};
use crate::session::{self, Failure};
use crate::types::CodecError;

/// Output window size.
pub(crate) const BUFFER_SIZE: usize = 16 * 1024;

/// Per-session output state. Lives at a fixed address for the whole session.
pub(crate) struct DestinationBridge<W> {
    manager: jpeg_destination_mgr,
    writer: W,
    buffer: Box<[u8]>,
    written: u64,
    failure: Option<io::Error>,
}

impl<W: Write> DestinationBridge<W> {
    pub(crate) fn new(writer: W) -> Self {
        // SAFETY: all-zero is a valid jpeg_destination_mgr: null window, no callbacks.
        let mut manager: jpeg_destination_mgr = unsafe { std::mem::zeroed() };
        manager.init_destination = Some(init_destination::<W>);
        manager.empty_output_buffer = Some(empty_output_buffer::<W>);
        manager.term_destination = Some(term_destination::<W>);
        Self {
            manager,
            writer,
            buffer: vec![0; BUFFER_SIZE].into_boxed_slice(),
            written: 0,
            failure: None,
        }
    }

    /// Manager to install as the engine's `dest`.
    pub(crate) fn manager_ptr(&mut self) -> *mut jpeg_destination_mgr {
        &mut self.manager
    }

    /// Bytes accepted by the writer so far.
    pub(crate) fn written(&self) -> u64 {
        self.written
    }

    /// First write error, if any.
    pub(crate) fn take_failure(&mut self) -> Option<CodecError> {
        self.failure.take().map(CodecError::from)
    }

    fn reset(&mut self) {
        self.manager.next_output_byte = self.buffer.as_mut_ptr();
        self.manager.free_in_buffer = self.buffer.len();
    }

    /// Window bytes the engine has filled.
    fn pending(&self) -> usize {
        self.buffer.len() - self.manager.free_in_buffer.min(self.buffer.len())
    }

    fn drain(&mut self, len: usize) {
        if self.failure.is_some() {
            return;
        }
        match self.writer.write_all(&self.buffer[..len]) {
            Ok(()) => self.written += len as u64,
            Err(e) => self.record(e),
        }
    }

    fn finish(&mut self) {
        let pending = self.pending();
        self.drain(pending);
        if self.failure.is_none() {
            if let Err(e) = self.writer.flush() {
                self.record(e);
            }
        }
        self.reset();
        log::debug!("destination wrote {} bytes", self.written);
    }

    fn record(&mut self, err: io::Error) {
        log::debug!("destination write failed: {err}");
        self.failure = Some(err);
    }
}

/// Resolve the bridge state for the session owning `cinfo`.
unsafe fn bridge<'a, W: Write>(cinfo: &mut jpeg_compress_struct) -> &'a mut DestinationBridge<W> {
    match registry::resolve(cinfo.common.client_data, Direction::Encode) {
        // SAFETY: encode handles are only registered for a
        // `DestinationBridge<W>` whose session is inside this engine call.
        Ok(state) => unsafe { &mut *state.cast::<DestinationBridge<W>>().as_ptr() },
        Err(err) => unsafe { session::abort(&mut cinfo.common, Failure::Bridge(err)) },
    }
}

unsafe extern "C-unwind" fn init_destination<W: Write>(cinfo: &mut jpeg_compress_struct) {
    unsafe { bridge::<W>(cinfo) }.reset();
}

unsafe extern "C-unwind" fn empty_output_buffer<W: Write>(
    cinfo: &mut jpeg_compress_struct,
) -> boolean {
    let bridge = unsafe { bridge::<W>(cinfo) };
    // The engine calls this with the window full, whatever free_in_buffer says.
    let len = bridge.buffer.len();
    bridge.drain(len);
    bridge.reset();
    1
}

unsafe extern "C-unwind" fn term_destination<W: Write>(cinfo: &mut jpeg_compress_struct) {
    unsafe { bridge::<W>(cinfo) }.finish();
}
