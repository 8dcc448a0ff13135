//! One decompression session: engine object, error manager and source
//! bridge, with the calls that move them through their lifecycle.

use std::ffi::c_int;
use std::io::Read;
use std::ptr::NonNull;

use mozjpeg_sys::{
    boolean, jpeg_calc_output_dimensions, jpeg_component_info, jpeg_create_decompress,
    jpeg_decompress_struct, jpeg_destroy_decompress, jpeg_finish_decompress,
    jpeg_has_multiple_scans, jpeg_read_header, jpeg_read_raw_data, jpeg_read_scanlines,
    jpeg_save_markers, jpeg_start_decompress, J_COLOR_SPACE,
};

use super::scale::ScaleFactor;
use super::source::SourceBridge;
use crate::adapter::PixelLayout;
use crate::geometry::{PlaneSet, SubsamplingRatio, BLOCK_SIZE};
use crate::registry::{Direction, Registration};
use crate::session::{
    engine_call, settle, EngineAbort, ErrorManager, Lifecycle, SessionState,
};
use crate::types::{CodecError, ColorModel, DecodeOptions, ImageInfo, Orientation};

/// APP1, where EXIF lives.
const APP1_MARKER: c_int = 0xE1;

/// `jpeg_read_header` result for a stream with an image.
const HEADER_OK: c_int = 1;

/// Upper bound on scanlines requested per engine call.
const MAX_BATCH_ROWS: usize = 16;

/// Where scanlines read from the engine go.
pub(crate) enum RowSink<'a> {
    /// Straight into a caller buffer, one row every `stride` bytes.
    Direct { buf: &'a mut [u8], stride: usize },
    /// Into scratch, then handed to a converter with the row index.
    Convert(&'a mut dyn FnMut(usize, &[u8])),
}

pub(crate) struct Decompressor<R: Read> {
    cinfo: Box<jpeg_decompress_struct>,
    errors: Box<ErrorManager>,
    registration: Option<Registration>,
    source: NonNull<SourceBridge<R>>,
    lifecycle: Lifecycle,
}

impl<R: Read> Decompressor<R> {
    /// Create the engine object and register the source bridge.
    pub(crate) fn open(reader: R) -> Result<Self, CodecError> {
        let mut errors = ErrorManager::new();
        let mut source = NonNull::from(Box::leak(Box::new(SourceBridge::new(reader))));
        let registration = Registration::new(source.cast(), Direction::Decode);

        // SAFETY: all-zero is the documented pre-create state.
        let mut cinfo: Box<jpeg_decompress_struct> = Box::new(unsafe { std::mem::zeroed() });
        cinfo.common.err = errors.engine_ptr();
        cinfo.common.client_data = registration.handle().to_client_data();

        let mut session = Self {
            cinfo,
            errors,
            registration: Some(registration),
            source,
            lifecycle: Lifecycle::new(Direction::Decode),
        };
        session.call(|cinfo| unsafe { jpeg_create_decompress(cinfo) })?;
        // SAFETY: the bridge is heap-pinned until `Drop`.
        session.cinfo.src = unsafe { source.as_mut() }.manager_ptr();
        Ok(session)
    }

    fn source(&mut self) -> &mut SourceBridge<R> {
        // SAFETY: owned by this session; the engine is not running.
        unsafe { self.source.as_mut() }
    }

    /// Run one engine entry point and fold everything the bridges and the
    /// error manager recorded into a single result.
    ///
    /// Precedence: read failure, then truncation, then the engine's error.
    fn call<T>(
        &mut self,
        f: impl FnOnce(&mut jpeg_decompress_struct) -> T,
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
        let scanline = (self.lifecycle.state() == SessionState::Streaming)
            .then_some(self.cinfo.output_scanline);
        let at = move |err: CodecError| match scanline {
            Some(line) => err.at_scanline(line),
            None => err,
        };
        let outcome = self.errors.take_outcome();
        // Running dry is only an error when the engine still wanted image
        // data; a stream that merely lacks its EOI marker decodes fine.
        let ended_early = self.errors.data_ended_early();
        let bridge_error = self.source().take_failure().or_else(|| {
            (self.source().is_truncated() && ended_early)
                .then(|| at(CodecError::malformed("premature end of JPEG data")))
        });
        settle(result, outcome, bridge_error, |message| at(CodecError::malformed(message)))
    }

    /// Read the stream header. With `save_exif`, APP1 segments are kept for
    /// [`Decompressor::info`].
    pub(crate) fn read_header(&mut self, save_exif: bool) -> Result<(), CodecError> {
        if save_exif {
            self.call(|cinfo| unsafe { jpeg_save_markers(cinfo, APP1_MARKER, 0xFFFF) })?;
        }
        let status = self.call(|cinfo| unsafe { jpeg_read_header(cinfo, 1) })?;
        if status != HEADER_OK {
            let err = CodecError::malformed("stream holds no image");
            self.lifecycle.fail(&err);
            return Err(err);
        }
        let consumed = self.source().delivered();
        log::debug!(
            "read JPEG header: {}x{}, {} components, {consumed} bytes consumed",
            self.cinfo.image_width,
            self.cinfo.image_height,
            self.cinfo.num_components,
        );
        Ok(())
    }

    fn components(&self) -> &[jpeg_component_info] {
        let count = self.cinfo.num_components.max(0) as usize;
        if self.cinfo.comp_info.is_null() || count == 0 {
            return &[];
        }
        // SAFETY: the engine allocates `num_components` entries while reading
        // the header, and they live as long as the engine object.
        unsafe { std::slice::from_raw_parts(self.cinfo.comp_info, count) }
    }

    pub(crate) fn color_model(&self) -> ColorModel {
        match self.cinfo.jpeg_color_space {
            J_COLOR_SPACE::JCS_GRAYSCALE => ColorModel::Gray,
            J_COLOR_SPACE::JCS_YCbCr => ColorModel::YCbCr,
            J_COLOR_SPACE::JCS_RGB => ColorModel::Rgb,
            J_COLOR_SPACE::JCS_CMYK => ColorModel::Cmyk,
            J_COLOR_SPACE::JCS_YCCK => ColorModel::Ycck,
            _ => ColorModel::Unknown,
        }
    }

    /// Subsampling of a three-component stream, if it is a supported ratio.
    pub(crate) fn subsampling(&self) -> Option<SubsamplingRatio> {
        match self.components() {
            [y, cb, cr]
                if (cb.h_samp_factor, cb.v_samp_factor)
                    == (cr.h_samp_factor, cr.v_samp_factor) =>
            {
                SubsamplingRatio::from_sampling(
                    (y.h_samp_factor, y.v_samp_factor),
                    (cb.h_samp_factor, cb.v_samp_factor),
                )
            }
            _ => None,
        }
    }

    fn saved_markers(&self) -> Vec<(u8, &[u8])> {
        let mut markers = Vec::new();
        let mut next = self.cinfo.marker_list;
        while !next.is_null() {
            // SAFETY: the saved-marker list is owned by the engine object and
            // stays valid until it is destroyed.
            let marker = unsafe { &*next };
            let data = if marker.data.is_null() {
                &[][..]
            } else {
                unsafe { std::slice::from_raw_parts(marker.data, marker.data_length as usize) }
            };
            markers.push((marker.marker, data));
            next = marker.next;
        }
        markers
    }

    /// Header summary. Valid after [`Decompressor::read_header`].
    pub(crate) fn info(&self) -> ImageInfo {
        let orientation = self
            .saved_markers()
            .into_iter()
            .filter(|(marker, _)| *marker as c_int == APP1_MARKER)
            .find_map(|(_, data)| super::header::exif_orientation(data))
            .unwrap_or(Orientation::Normal);
        ImageInfo {
            width: self.cinfo.image_width,
            height: self.cinfo.image_height,
            color_model: self.color_model(),
            components: self.cinfo.num_components.clamp(0, u8::MAX as c_int) as u8,
            subsampling: self.subsampling(),
            // SAFETY: the header has been read, so the engine is in a state
            // where this query cannot fail.
            progressive: unsafe { jpeg_has_multiple_scans(&*self.cinfo) } != 0,
            orientation,
        }
    }

    /// Set decompression parameters and compute the output size.
    ///
    /// Returns the output dimensions as computed by the engine.
    pub(crate) fn configure(
        &mut self,
        layout: PixelLayout,
        options: &DecodeOptions,
        raw: bool,
    ) -> Result<(u32, u32), CodecError> {
        let factor = ScaleFactor::select(
            self.cinfo.image_width,
            self.cinfo.image_height,
            options.scale_target,
        );
        {
            let cinfo = &mut *self.cinfo;
            cinfo.out_color_space = layout.engine_colorspace();
            cinfo.dct_method = options.dct_method.to_engine();
            cinfo.do_fancy_upsampling = (!options.disable_fancy_upsampling) as boolean;
            cinfo.do_block_smoothing = (!options.disable_block_smoothing) as boolean;
            cinfo.scale_num = factor.numerator();
            cinfo.scale_denom = factor.denominator();
            cinfo.raw_data_out = raw as boolean;
        }
        self.call(|cinfo| unsafe { jpeg_calc_output_dimensions(cinfo) })?;

        let (width, height) = (self.cinfo.output_width, self.cinfo.output_height);
        let channels = self.cinfo.out_color_components.max(0) as usize;
        if channels != layout.engine_channels() {
            let err = CodecError::InternalInvariant(format!(
                "engine produces {channels} channels, expected {}",
                layout.engine_channels()
            ));
            self.lifecycle.fail(&err);
            return Err(err);
        }
        log::debug!(
            "decoding {}x{} as {layout:?} at {}/{} -> {width}x{height}",
            self.cinfo.image_width,
            self.cinfo.image_height,
            factor.numerator(),
            factor.denominator()
        );
        self.lifecycle.advance(SessionState::Configured)?;
        Ok((width, height))
    }

    /// Begin decompression. Reads the first scan of progressive streams.
    pub(crate) fn start(&mut self) -> Result<(), CodecError> {
        self.lifecycle.advance(SessionState::Streaming)?;
        let started = self.call(|cinfo| unsafe { jpeg_start_decompress(cinfo) })?;
        if started == 0 {
            // Only a suspending source can cause this.
            let err = CodecError::InternalInvariant("decompression suspended".to_string());
            self.lifecycle.fail(&err);
            return Err(err);
        }
        Ok(())
    }

    /// Pull every scanline into `sink`.
    pub(crate) fn read_scanlines(&mut self, sink: RowSink<'_>) -> Result<(), CodecError> {
        let row_len =
            self.cinfo.output_width as usize * self.cinfo.out_color_components.max(0) as usize;
        let height = self.cinfo.output_height as usize;
        let batch = (self.cinfo.rec_outbuf_height.max(1) as usize).min(MAX_BATCH_ROWS);

        match sink {
            RowSink::Direct { buf, stride } => {
                if stride < row_len || buf.len() < stride * height.saturating_sub(1) + row_len {
                    return Err(self.invariant(format!(
                        "output buffer of {} bytes cannot hold {height} rows of {row_len}",
                        buf.len()
                    )));
                }
                while (self.cinfo.output_scanline as usize) < height {
                    let first = self.cinfo.output_scanline as usize;
                    let count = batch.min(height - first);
                    let mut rows: Vec<*mut u8> = (first..first + count)
                        .map(|y| buf[y * stride..].as_mut_ptr())
                        .collect();
                    self.read_batch(&mut rows)?;
                }
            }
            RowSink::Convert(convert) => {
                let mut scratch = vec![0u8; row_len * batch];
                while (self.cinfo.output_scanline as usize) < height {
                    let first = self.cinfo.output_scanline as usize;
                    let count = batch.min(height - first);
                    let mut rows: Vec<*mut u8> = scratch
                        .chunks_exact_mut(row_len)
                        .take(count)
                        .map(|row| row.as_mut_ptr())
                        .collect();
                    let read = self.read_batch(&mut rows)?;
                    for (i, row) in scratch.chunks_exact(row_len).take(read).enumerate() {
                        convert(first + i, row);
                    }
                }
            }
        }
        Ok(())
    }

    fn read_batch(&mut self, rows: &mut [*mut u8]) -> Result<usize, CodecError> {
        let first = self.cinfo.output_scanline;
        let count = rows.len();
        let read = self.call(|cinfo| unsafe {
            jpeg_read_scanlines(cinfo, rows.as_mut_ptr() as _, count as _)
        })?;
        if read == 0 {
            let err = CodecError::malformed("engine returned no scanlines").at_scanline(first);
            self.lifecycle.fail(&err);
            return Err(err);
        }
        Ok(read as usize)
    }

    /// Pull every iMCU row of a raw (planar) decode straight into `planes`.
    ///
    /// The session must have been configured with `raw` set and no scaling.
    pub(crate) fn read_raw(&mut self, planes: &mut PlaneSet) -> Result<(), CodecError> {
        let sampling: Vec<(usize, usize)> = self
            .components()
            .iter()
            .map(|c| (c.h_samp_factor.max(1) as usize, c.v_samp_factor.max(1) as usize))
            .collect();
        let max_h = self.cinfo.max_h_samp_factor.max(1) as usize;
        let max_v = self.cinfo.max_v_samp_factor.max(1) as usize;
        let (image_width, image_height) =
            (self.cinfo.image_width as usize, self.cinfo.image_height as usize);
        let downsampled: Vec<(u32, u32)> = sampling
            .iter()
            .map(|&(h, v)| {
                (
                    (image_width * h).div_ceil(max_h) as u32,
                    (image_height * v).div_ceil(max_v) as u32,
                )
            })
            .collect();
        let lines = max_v * BLOCK_SIZE;
        let mcu_cols = (self.cinfo.output_width as usize).div_ceil(max_h * BLOCK_SIZE);
        let height = self.cinfo.output_height as usize;

        let mut targets = planes.planes_mut();
        if targets.len() != sampling.len() {
            return Err(self.invariant(format!(
                "{} planes for {} components",
                targets.len(),
                sampling.len()
            )));
        }
        for (i, plane) in targets.iter().enumerate() {
            let (h, _) = sampling[i];
            if (plane.width(), plane.height()) != downsampled[i] {
                return Err(self.invariant(format!(
                    "component {i} is {:?}, plane is {}x{}",
                    downsampled[i],
                    plane.width(),
                    plane.height()
                )));
            }
            if plane.stride() < mcu_cols * h * BLOCK_SIZE {
                return Err(self.invariant(format!(
                    "plane {i} stride {} is narrower than {} MCU columns",
                    plane.stride(),
                    mcu_cols
                )));
            }
        }

        while (self.cinfo.output_scanline as usize) < height {
            let imcu = self.cinfo.output_scanline as usize / lines;
            let mut component_rows: Vec<Vec<*mut u8>> = Vec::with_capacity(targets.len());
            for (i, plane) in targets.iter_mut().enumerate() {
                let rows = sampling[i].1 * BLOCK_SIZE;
                let start = imcu * rows;
                let mut pointers = Vec::with_capacity(rows);
                for y in start..start + rows {
                    match plane.padded_row_mut(y) {
                        Some(row) => pointers.push(row.as_mut_ptr()),
                        None => {
                            return Err(self.invariant(format!(
                                "plane {i} has no row {y} for iMCU row {imcu}"
                            )))
                        }
                    }
                }
                component_rows.push(pointers);
            }
            let mut image: Vec<*mut *mut u8> =
                component_rows.iter_mut().map(|rows| rows.as_mut_ptr()).collect();
            let first = self.cinfo.output_scanline;
            let read = self.call(|cinfo| unsafe {
                jpeg_read_raw_data(cinfo, image.as_mut_ptr() as _, lines as _)
            })?;
            if read == 0 {
                let err = CodecError::malformed("engine returned no raw data").at_scanline(first);
                self.lifecycle.fail(&err);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Finish decompression after all scanlines have been read.
    pub(crate) fn finish(mut self) -> Result<(), CodecError> {
        let done = self.call(|cinfo| unsafe { jpeg_finish_decompress(cinfo) })?;
        if done == 0 {
            return Err(self.invariant("decompression suspended at end".to_string()));
        }
        self.lifecycle.advance(SessionState::Completed)
    }

    fn invariant(&mut self, message: String) -> CodecError {
        self.reject(CodecError::InternalInvariant(message))
    }

    /// Mark the session failed with `err` and hand it back.
    pub(crate) fn reject(&mut self, err: CodecError) -> CodecError {
        self.lifecycle.fail(&err);
        err
    }
}

impl<R: Read> Drop for Decompressor<R> {
    fn drop(&mut self) {
        // Destroy is valid on a created, failed or never-created object and
        // runs no source callbacks.
        let cinfo = &mut *self.cinfo;
        if engine_call(|| unsafe { jpeg_destroy_decompress(cinfo) }).is_err() {
            log::error!("engine aborted while releasing a decode session");
        }
        let _ = self.errors.take_outcome();
        // Unregister before the state goes away.
        drop(self.registration.take());
        // SAFETY: leaked in `open`; the engine and registry no longer see it.
        drop(unsafe { Box::from_raw(self.source.as_ptr()) });
    }
}
