//! Source bridge: feeds the engine's input manager from any [`Read`].
//!
//! The engine pulls compressed bytes through callbacks. Each callback
//! resolves the session's bridge state through the registry, refills or
//! advances the scratch window, and returns. End of data and read errors are
//! never reported to the engine as failures: we hand it a synthetic end of
//! image marker so it can wind down, and record what happened here for the
//! controller.

use std::ffi::c_long;
use std::io::{self, Read};

use mozjpeg_sys::{boolean, jpeg_decompress_struct, jpeg_resync_to_restart, jpeg_source_mgr};

use crate::registry::{self, Direction};
use crate::session::{self, Failure};
use crate::types::CodecError;

/// Scratch window size.
pub(crate) const BUFFER_SIZE: usize = 16 * 1024;

/// Served in place of real data once the reader is exhausted.
static END_OF_IMAGE: [u8; 2] = [0xFF, 0xD9];

/// Per-session input state. Lives at a fixed address for the whole session.
pub(crate) struct SourceBridge<R> {
    manager: jpeg_source_mgr,
    reader: R,
    buffer: Box<[u8]>,
    delivered: u64,
    end_of_data: bool,
    truncated: bool,
    failure: Option<io::Error>,
}

impl<R: Read> SourceBridge<R> {
    pub(crate) fn new(reader: R) -> Self {
        // SAFETY: all-zero is a valid jpeg_source_mgr: null window, no callbacks.
        let mut manager: jpeg_source_mgr = unsafe { std::mem::zeroed() };
        manager.init_source = Some(init_source::<R>);
        manager.fill_input_buffer = Some(fill_input_buffer::<R>);
        manager.skip_input_data = Some(skip_input_data::<R>);
        manager.resync_to_restart = Some(jpeg_resync_to_restart);
        manager.term_source = Some(term_source::<R>);
        Self {
            manager,
            reader,
            buffer: vec![0; BUFFER_SIZE].into_boxed_slice(),
            delivered: 0,
            end_of_data: false,
            truncated: false,
            failure: None,
        }
    }

    /// Manager to install as the engine's `src`.
    pub(crate) fn manager_ptr(&mut self) -> *mut jpeg_source_mgr {
        &mut self.manager
    }

    /// Compressed bytes handed to the engine so far.
    pub(crate) fn delivered(&self) -> u64 {
        self.delivered
    }

    /// The reader ran dry after the stream had started.
    pub(crate) fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// First read error, if any.
    pub(crate) fn take_failure(&mut self) -> Option<CodecError> {
        self.failure.take().map(CodecError::from)
    }

    fn refill(&mut self) {
        if !self.end_of_data {
            loop {
                match self.reader.read(&mut self.buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        self.delivered += n as u64;
                        self.manager.next_input_byte = self.buffer.as_ptr();
                        self.manager.bytes_in_buffer = n;
                        return;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        self.record(e);
                        break;
                    }
                }
            }
        }
        self.serve_end_marker();
    }

    fn skip(&mut self, count: usize) {
        let available = self.manager.bytes_in_buffer;
        if count <= available {
            // SAFETY: stays within the current window.
            self.manager.next_input_byte = unsafe { self.manager.next_input_byte.add(count) };
            self.manager.bytes_in_buffer -= count;
            return;
        }
        self.manager.bytes_in_buffer = 0;
        if self.end_of_data {
            self.serve_end_marker();
            return;
        }

        let remaining = (count - available) as u64;
        match io::copy(&mut (&mut self.reader).take(remaining), &mut io::sink()) {
            Ok(skipped) => {
                self.delivered += skipped;
                if skipped < remaining {
                    self.serve_end_marker();
                }
            }
            Err(e) => {
                self.record(e);
                self.serve_end_marker();
            }
        }
    }

    fn serve_end_marker(&mut self) {
        if !self.end_of_data {
            log::debug!("source exhausted after {} bytes", self.delivered);
        }
        self.end_of_data = true;
        if self.delivered > 0 {
            self.truncated = true;
        }
        self.manager.next_input_byte = END_OF_IMAGE.as_ptr();
        self.manager.bytes_in_buffer = END_OF_IMAGE.len();
    }

    fn record(&mut self, err: io::Error) {
        log::debug!("source read failed: {err}");
        if self.failure.is_none() {
            self.failure = Some(err);
        }
    }
}

/// Resolve the bridge state for the session owning `cinfo`.
///
/// A handle that no longer resolves aborts the session with an invariant
/// violation; nothing is dereferenced in that case.
unsafe fn bridge<'a, R: Read>(cinfo: &mut jpeg_decompress_struct) -> &'a mut SourceBridge<R> {
    match registry::resolve(cinfo.common.client_data, Direction::Decode) {
        // SAFETY: decode handles are only registered for a `SourceBridge<R>`
        // whose session is still running the engine call we are inside.
        Ok(state) => unsafe { &mut *state.cast::<SourceBridge<R>>().as_ptr() },
        Err(err) => unsafe { session::abort(&mut cinfo.common, Failure::Bridge(err)) },
    }
}

unsafe extern "C-unwind" fn init_source<R: Read>(cinfo: &mut jpeg_decompress_struct) {
    // Validates the handle before any data moves.
    let _ = unsafe { bridge::<R>(cinfo) };
}

unsafe extern "C-unwind" fn fill_input_buffer<R: Read>(
    cinfo: &mut jpeg_decompress_struct,
) -> boolean {
    unsafe { bridge::<R>(cinfo) }.refill();
    1
}

unsafe extern "C-unwind" fn skip_input_data<R: Read>(
    cinfo: &mut jpeg_decompress_struct,
    num_bytes: c_long,
) {
    if num_bytes <= 0 {
        return;
    }
    unsafe { bridge::<R>(cinfo) }.skip(num_bytes as usize);
}

unsafe extern "C-unwind" fn term_source<R: Read>(_cinfo: &mut jpeg_decompress_struct) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn window<R: Read>(bridge: &SourceBridge<R>) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                bridge.manager.next_input_byte,
                bridge.manager.bytes_in_buffer,
            )
        }
    }

    /// Reader that yields one chunk, is interrupted once, then fails.
    struct Flaky {
        calls: usize,
    }

    impl Read for Flaky {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.calls += 1;
            match self.calls {
                1 => {
                    buf[..3].copy_from_slice(&[0xFF, 0xD8, 0xFF]);
                    Ok(3)
                }
                2 => Err(io::Error::new(io::ErrorKind::Interrupted, "again")),
                _ => Err(io::Error::new(io::ErrorKind::ConnectionReset, "gone")),
            }
        }
    }

    #[test]
    fn test_refill_serves_reader_bytes() {
        let mut bridge = SourceBridge::new(Cursor::new(vec![1u8, 2, 3]));
        bridge.refill();
        assert_eq!(window(&bridge), &[1, 2, 3]);
        assert_eq!(bridge.delivered(), 3);
        assert!(!bridge.is_truncated());
    }

    #[test]
    fn test_empty_reader_gets_end_marker_without_truncation() {
        let mut bridge = SourceBridge::new(Cursor::new(Vec::<u8>::new()));
        bridge.refill();
        assert_eq!(window(&bridge), &END_OF_IMAGE);
        assert!(!bridge.is_truncated());
        assert!(bridge.take_failure().is_none());
    }

    #[test]
    fn test_exhausted_reader_is_truncated() {
        let mut bridge = SourceBridge::new(Cursor::new(vec![0xFFu8, 0xD8]));
        bridge.refill();
        bridge.refill();
        assert_eq!(window(&bridge), &END_OF_IMAGE);
        assert!(bridge.is_truncated());
    }

    #[test]
    fn test_read_error_is_recorded_once() {
        let mut bridge = SourceBridge::new(Flaky { calls: 0 });
        bridge.refill();
        assert_eq!(window(&bridge), &[0xFF, 0xD8, 0xFF]);

        // Interrupted is retried, then the hard error is recorded.
        bridge.refill();
        assert_eq!(window(&bridge), &END_OF_IMAGE);
        assert_eq!(bridge.reader.calls, 3);

        bridge.refill();
        assert_eq!(bridge.reader.calls, 3);
        let err = bridge.take_failure().unwrap();
        assert!(matches!(err, CodecError::Io(ref e) if e.kind() == io::ErrorKind::ConnectionReset));
        assert!(bridge.take_failure().is_none());
    }

    #[test]
    fn test_skip_within_window() {
        let mut bridge = SourceBridge::new(Cursor::new(vec![1u8, 2, 3, 4, 5]));
        bridge.refill();
        bridge.skip(2);
        assert_eq!(window(&bridge), &[3, 4, 5]);
    }

    #[test]
    fn test_skip_past_window_consumes_reader() {
        let data: Vec<u8> = (0..=255u8).cycle().take(BUFFER_SIZE + 100).collect();
        let mut bridge = SourceBridge::new(Cursor::new(data.clone()));
        bridge.refill();
        assert_eq!(bridge.manager.bytes_in_buffer, BUFFER_SIZE);

        // Skip the whole window plus 50 bytes still in the reader.
        bridge.skip(BUFFER_SIZE + 50);
        assert_eq!(bridge.manager.bytes_in_buffer, 0);
        bridge.refill();
        assert_eq!(window(&bridge), &data[BUFFER_SIZE + 50..]);
    }

    #[test]
    fn test_skip_past_end_serves_marker() {
        let mut bridge = SourceBridge::new(Cursor::new(vec![1u8, 2, 3]));
        bridge.refill();
        bridge.skip(10);
        assert_eq!(window(&bridge), &END_OF_IMAGE);
        assert!(bridge.is_truncated());
    }
}
