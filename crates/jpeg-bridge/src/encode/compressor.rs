//! One compression session: engine object, error manager and destination
//! bridge.

use std::ffi::c_int;
use std::io::Write;
use std::ptr::NonNull;

use mozjpeg_sys::{
    boolean, jpeg_c_set_int_param, jpeg_component_info, jpeg_compress_struct,
    jpeg_create_compress, jpeg_destroy_compress, jpeg_finish_compress, jpeg_set_defaults,
    jpeg_set_quality, jpeg_simple_progression, jpeg_start_compress, jpeg_write_raw_data,
    jpeg_write_scanlines, JCP_FASTEST, J_COLOR_SPACE, J_INT_PARAM,
};

use super::destination::DestinationBridge;
use crate::adapter::{self, PixelLayout};
use crate::geometry::{PlaneSet, SubsamplingRatio, BLOCK_SIZE};
use crate::registry::{Direction, Registration};
use crate::session::{engine_call, settle, EngineAbort, ErrorManager, Lifecycle, SessionState};
use crate::types::{CodecError, EncodeOptions};

/// Upper bound on scanlines handed over per engine call.
const MAX_BATCH_ROWS: usize = 16;

/// How pixels are handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InputFormat {
    /// Interleaved scanlines; the engine converts colour and downsamples.
    Packed(PixelLayout),
    /// Already-downsampled planes through the raw-data interface.
    /// `None` is a single gray plane.
    Raw(Option<SubsamplingRatio>),
}

impl InputFormat {
    fn engine_params(self) -> (J_COLOR_SPACE, usize, bool) {
        match self {
            InputFormat::Packed(layout) => {
                (layout.engine_colorspace(), layout.engine_channels(), false)
            }
            InputFormat::Raw(None) => (J_COLOR_SPACE::JCS_GRAYSCALE, 1, true),
            InputFormat::Raw(Some(_)) => (J_COLOR_SPACE::JCS_YCbCr, 3, true),
        }
    }
}

pub(crate) struct Compressor<W: Write> {
    cinfo: Box<jpeg_compress_struct>,
    errors: Box<ErrorManager>,
    registration: Option<Registration>,
    destination: NonNull<DestinationBridge<W>>,
    lifecycle: Lifecycle,
}

impl<W: Write> Compressor<W> {
    /// Create the engine object and register the destination bridge.
    pub(crate) fn open(writer: W) -> Result<Self, CodecError> {
        let mut errors = ErrorManager::new();
        let mut destination =
            NonNull::from(Box::leak(Box::new(DestinationBridge::new(writer))));
        let registration = Registration::new(destination.cast(), Direction::Encode);

        // SAFETY: all-zero is the documented pre-create state.
        let mut cinfo: Box<jpeg_compress_struct> = Box::new(unsafe { std::mem::zeroed() });
        cinfo.common.err = errors.engine_ptr();
        cinfo.common.client_data = registration.handle().to_client_data();

        let mut session = Self {
            cinfo,
            errors,
            registration: Some(registration),
            destination,
            lifecycle: Lifecycle::new(Direction::Encode),
        };
        session.call(|cinfo| unsafe { jpeg_create_compress(cinfo) })?;
        // SAFETY: the bridge is heap-pinned until `Drop`.
        session.cinfo.dest = unsafe { destination.as_mut() }.manager_ptr();
        Ok(session)
    }

    fn destination(&mut self) -> &mut DestinationBridge<W> {
        // SAFETY: owned by this session; the engine is not running.
        unsafe { self.destination.as_mut() }
    }

    /// Run one engine entry point. A write failure takes precedence over
    /// whatever the engine reported.
    fn call<T>(
        &mut self,
        f: impl FnOnce(&mut jpeg_compress_struct) -> T,
    ) -> Result<T, CodecError> {
        let cinfo = &mut *self.cinfo;
        let result = engine_call(|| f(cinfo));
        let checked = self.check(result);
        if let Err(err) = &checked {
            self.lifecycle.fail(err);
        }
        checked
    }

    fn check<T>(&mut self, result: Result<T, EngineAbort>) -> Result<T, CodecError> {
        let outcome = self.errors.take_outcome();
        let bridge_error = self.destination().take_failure();
        settle(result, outcome, bridge_error, CodecError::UnsupportedFormat)
    }

    fn components_mut(&mut self) -> &mut [jpeg_component_info] {
        let count = self.cinfo.num_components.max(0) as usize;
        if self.cinfo.comp_info.is_null() || count == 0 {
            return &mut [];
        }
        // SAFETY: allocated by jpeg_set_defaults for the engine object's
        // lifetime; `num_components` entries are initialised.
        unsafe { std::slice::from_raw_parts_mut(self.cinfo.comp_info, count) }
    }

    fn sampling(&mut self) -> Vec<(usize, usize)> {
        self.components_mut()
            .iter()
            .map(|c| (c.h_samp_factor.max(1) as usize, c.v_samp_factor.max(1) as usize))
            .collect()
    }

    /// Describe the input and choose compression parameters.
    pub(crate) fn configure(
        &mut self,
        width: u32,
        height: u32,
        format: InputFormat,
        options: &EncodeOptions,
    ) -> Result<(), CodecError> {
        let (colorspace, channels, raw) = format.engine_params();
        {
            let cinfo = &mut *self.cinfo;
            cinfo.image_width = width;
            cinfo.image_height = height;
            cinfo.input_components = channels as c_int;
            cinfo.in_color_space = colorspace;
        }
        // Extra optimisation passes off: output matches stock libjpeg-turbo.
        self.call(|cinfo| unsafe {
            jpeg_c_set_int_param(cinfo, J_INT_PARAM::JINT_COMPRESS_PROFILE, JCP_FASTEST as c_int)
        })?;
        self.call(|cinfo| unsafe { jpeg_set_defaults(cinfo) })?;
        let quality = options.effective_quality() as c_int;
        self.call(|cinfo| unsafe { jpeg_set_quality(cinfo, quality, 1) })?;
        {
            let cinfo = &mut *self.cinfo;
            cinfo.dct_method = options.dct_method.to_engine();
            cinfo.optimize_coding = options.optimize_coding as boolean;
            cinfo.raw_data_in = raw as boolean;
        }

        let ratio = match format {
            InputFormat::Raw(ratio) => ratio,
            InputFormat::Packed(PixelLayout::Gray) => None,
            InputFormat::Packed(_) => options.subsampling,
        };
        if let Some(ratio) = ratio {
            self.set_subsampling(ratio)?;
        }
        if options.progressive {
            self.call(|cinfo| unsafe { jpeg_simple_progression(cinfo) })?;
        }
        log::debug!(
            "encoding {width}x{height} from {format:?} at quality {quality}, {}",
            match ratio {
                Some(ratio) => ratio.to_string(),
                None => "default sampling".to_string(),
            }
        );
        self.lifecycle.advance(SessionState::Configured)
    }

    fn set_subsampling(&mut self, ratio: SubsamplingRatio) -> Result<(), CodecError> {
        let (h, v) = ratio.divisors();
        match self.components_mut() {
            [y, cb, cr] => {
                y.h_samp_factor = h as c_int;
                y.v_samp_factor = v as c_int;
                for chroma in [cb, cr] {
                    chroma.h_samp_factor = 1;
                    chroma.v_samp_factor = 1;
                }
                Ok(())
            }
            other => {
                let count = other.len();
                Err(self.invariant(format!("cannot subsample {count} components")))
            }
        }
    }

    /// Write the headers and begin compression.
    pub(crate) fn start(&mut self) -> Result<(), CodecError> {
        self.lifecycle.advance(SessionState::Streaming)?;
        self.call(|cinfo| unsafe { jpeg_start_compress(cinfo, 1) })
    }

    /// Hand over interleaved rows of `row_len` bytes, straight from `pixels`.
    pub(crate) fn write_packed(&mut self, pixels: &[u8], row_len: usize) -> Result<(), CodecError> {
        let height = self.cinfo.image_height as usize;
        if pixels.len() < row_len * height {
            return Err(self.invariant(format!(
                "{} bytes cannot hold {height} rows of {row_len}",
                pixels.len()
            )));
        }
        while (self.cinfo.next_scanline as usize) < height {
            let first = self.cinfo.next_scanline as usize;
            let count = MAX_BATCH_ROWS.min(height - first);
            let rows: Vec<*const u8> = (first..first + count)
                .map(|y| pixels[y * row_len..].as_ptr())
                .collect();
            self.write_batch(&rows)?;
        }
        Ok(())
    }

    /// Hand over rows produced by `fill` into a scratch row of `row_len`
    /// engine bytes.
    pub(crate) fn write_converted(
        &mut self,
        row_len: usize,
        mut fill: impl FnMut(usize, &mut [u8]),
    ) -> Result<(), CodecError> {
        let height = self.cinfo.image_height as usize;
        let mut scratch = vec![0u8; row_len * MAX_BATCH_ROWS];
        while (self.cinfo.next_scanline as usize) < height {
            let first = self.cinfo.next_scanline as usize;
            let count = MAX_BATCH_ROWS.min(height - first);
            for (i, row) in scratch.chunks_exact_mut(row_len).take(count).enumerate() {
                fill(first + i, row);
            }
            let rows: Vec<*const u8> = scratch
                .chunks_exact(row_len)
                .take(count)
                .map(|row| row.as_ptr())
                .collect();
            self.write_batch(&rows)?;
        }
        Ok(())
    }

    fn write_batch(&mut self, rows: &[*const u8]) -> Result<(), CodecError> {
        let count = rows.len();
        let written = self.call(|cinfo| unsafe {
            jpeg_write_scanlines(cinfo, rows.as_ptr() as _, count as _)
        })?;
        if written == 0 {
            return Err(self.invariant("engine accepted no scanlines".to_string()));
        }
        Ok(())
    }

    /// Hand over planes one iMCU row at a time.
    ///
    /// Each component's rows are copied into a block-aligned scratch area,
    /// with the last column and row repeated out to the MCU boundary.
    pub(crate) fn write_raw(&mut self, planes: &PlaneSet) -> Result<(), CodecError> {
        let sampling = self.sampling();
        let sources = planes.planes();
        if sources.len() != sampling.len() {
            return Err(self.invariant(format!(
                "{} planes for {} components",
                sources.len(),
                sampling.len()
            )));
        }
        let max_h = self.cinfo.max_h_samp_factor.max(1) as usize;
        let max_v = self.cinfo.max_v_samp_factor.max(1) as usize;
        let lines = max_v * BLOCK_SIZE;
        let mcu_cols = (self.cinfo.image_width as usize).div_ceil(max_h * BLOCK_SIZE);
        let height = self.cinfo.image_height as usize;

        // (rows per iMCU, padded row width, storage) per component
        let mut scratch: Vec<(usize, usize, Vec<u8>)> = sampling
            .iter()
            .map(|&(h, v)| {
                let rows = v * BLOCK_SIZE;
                let width = mcu_cols * h * BLOCK_SIZE;
                (rows, width, vec![0u8; rows * width])
            })
            .collect();

        while (self.cinfo.next_scanline as usize) < height {
            let imcu = self.cinfo.next_scanline as usize / lines;
            let mut component_rows: Vec<Vec<*const u8>> = Vec::with_capacity(scratch.len());
            for ((rows, width, storage), plane) in scratch.iter_mut().zip(&sources) {
                let last = (plane.height() as usize).saturating_sub(1);
                for (r, dst) in storage.chunks_exact_mut(*width).enumerate() {
                    let src_y = (imcu * *rows + r).min(last);
                    adapter::extend_row(plane.row(src_y), dst);
                }
                component_rows.push(storage.chunks_exact(*width).map(|row| row.as_ptr()).collect());
            }
            let image: Vec<*const *const u8> =
                component_rows.iter().map(|rows| rows.as_ptr()).collect();
            let written = self.call(|cinfo| unsafe {
                jpeg_write_raw_data(cinfo, image.as_ptr() as _, lines as _)
            })?;
            if written == 0 {
                return Err(self.invariant("engine accepted no raw data".to_string()));
            }
        }
        Ok(())
    }

    /// Flush the last scan and the end of image marker. Returns bytes written.
    pub(crate) fn finish(mut self) -> Result<u64, CodecError> {
        self.call(|cinfo| unsafe { jpeg_finish_compress(cinfo) })?;
        self.lifecycle.advance(SessionState::Completed)?;
        Ok(self.destination().written())
    }

    fn invariant(&mut self, message: String) -> CodecError {
        let err = CodecError::InternalInvariant(message);
        self.lifecycle.fail(&err);
        err
    }
}

impl<W: Write> Drop for Compressor<W> {
    fn drop(&mut self) {
        // Destroy is valid in any state and runs no destination callbacks.
        let cinfo = &mut *self.cinfo;
        if engine_call(|| unsafe { jpeg_destroy_compress(cinfo) }).is_err() {
            log::error!("engine aborted while releasing an encode session");
        }
        let _ = self.errors.take_outcome();
        // Unregister before the state goes away.
        drop(self.registration.take());
        // SAFETY: leaked in `open`; the engine and registry no longer see it.
        drop(unsafe { Box::from_raw(self.destination.as_ptr()) });
    }
}
