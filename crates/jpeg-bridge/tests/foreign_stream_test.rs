//! Decoding streams this crate's encoder never produces (RGB-coded, CMYK,
//! YCCK), and a decode → encode → decode chain starting from a stream
//! written directly through the engine.

use image::{Rgb, RgbImage};
use jpeg_bridge::*;
use mozjpeg_sys::{
    c_int, c_ulong, jpeg_c_set_int_param, jpeg_compress_struct, jpeg_create_compress,
    jpeg_destroy_compress, jpeg_error_mgr, jpeg_finish_compress, jpeg_mem_dest,
    jpeg_set_colorspace, jpeg_set_defaults, jpeg_set_quality, jpeg_start_compress,
    jpeg_std_error, jpeg_write_scanlines, JCP_FASTEST, J_COLOR_SPACE, J_INT_PARAM,
};

/// Encode `pixels` straight through the engine, storing them as `stored`.
fn encode_with_engine(
    pixels: &[u8],
    width: u32,
    height: u32,
    input: J_COLOR_SPACE,
    components: usize,
    stored: J_COLOR_SPACE,
) -> Vec<u8> {
    assert_eq!(pixels.len(), width as usize * height as usize * components);
    // Large enough that the engine never swaps in a buffer of its own.
    let mut out = vec![0u8; 4 << 20];
    let mut out_ptr = out.as_mut_ptr();
    let mut out_len = out.len() as c_ulong;

    unsafe {
        let mut err: jpeg_error_mgr = std::mem::zeroed();
        let mut cinfo: jpeg_compress_struct = std::mem::zeroed();
        cinfo.common.err = jpeg_std_error(&mut err);
        jpeg_create_compress(&mut cinfo);
        jpeg_mem_dest(&mut cinfo, &mut out_ptr, &mut out_len);

        cinfo.image_width = width;
        cinfo.image_height = height;
        cinfo.input_components = components as c_int;
        cinfo.in_color_space = input;
        let profile = JCP_FASTEST as c_int;
        jpeg_c_set_int_param(&mut cinfo, J_INT_PARAM::JINT_COMPRESS_PROFILE, profile);
        jpeg_set_defaults(&mut cinfo);
        jpeg_set_colorspace(&mut cinfo, stored);
        jpeg_set_quality(&mut cinfo, 95, 1);

        jpeg_start_compress(&mut cinfo, 1);
        for row in pixels.chunks_exact(width as usize * components) {
            let rows = [row.as_ptr()];
            jpeg_write_scanlines(&mut cinfo, rows.as_ptr(), 1);
        }
        jpeg_finish_compress(&mut cinfo);
        jpeg_destroy_compress(&mut cinfo);
    }

    assert_eq!(out_ptr, out.as_mut_ptr(), "engine output outgrew the buffer");
    out.truncate(out_len as usize);
    out
}

fn create_rgb_gradient(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        Rgb([
            (x * 255 / width) as u8,
            (y * 255 / height) as u8,
            ((x + y) * 255 / (width + height)) as u8,
        ])
    })
}

fn create_cmyk(width: u32, height: u32) -> Vec<u8> {
    (0..width * height)
        .flat_map(|i| [(i % 256) as u8, 40, 80, 120])
        .collect()
}

fn max_delta(a: &[u8], b: &[u8]) -> u8 {
    assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| x.abs_diff(*y)).max().unwrap_or(0)
}

#[test]
fn test_rgb_coded_stream_decodes_to_packed_rgb() {
    let img = create_rgb_gradient(40, 24);
    let jpeg = encode_with_engine(
        img.as_raw(),
        40,
        24,
        J_COLOR_SPACE::JCS_RGB,
        3,
        J_COLOR_SPACE::JCS_RGB,
    );

    let info = decode_header(jpeg.as_slice()).unwrap();
    assert_eq!(info.color_model, ColorModel::Rgb);
    assert_eq!(info.components, 3);

    let decoded = decode(jpeg.as_slice(), &DecodeOptions::new()).unwrap();
    let rgb = match decoded {
        DecodedImage::Rgb(rgb) => rgb,
        DecodedImage::Planes(_) => panic!("RGB-coded stream decoded to planes"),
    };
    assert_eq!(rgb.dimensions(), (40, 24));
    let delta = max_delta(rgb.as_raw(), img.as_raw());
    assert!(delta <= 8, "max delta {delta}");

    let converted = decode_into_rgb(jpeg.as_slice(), &DecodeOptions::new()).unwrap();
    assert_eq!(converted, rgb);

    let rgba = decode_into_rgba(jpeg.as_slice(), &DecodeOptions::new()).unwrap();
    assert_eq!(rgba.dimensions(), (40, 24));
    assert!(rgba.pixels().all(|p| p[3] == 255));
}

#[test]
fn test_cmyk_stream_is_unsupported() {
    let jpeg = encode_with_engine(
        &create_cmyk(16, 16),
        16,
        16,
        J_COLOR_SPACE::JCS_CMYK,
        4,
        J_COLOR_SPACE::JCS_CMYK,
    );

    let info = decode_header(jpeg.as_slice()).unwrap();
    assert_eq!(info.color_model, ColorModel::Cmyk);
    assert_eq!(info.components, 4);
    assert_eq!(info.subsampling, None);

    let err = decode(jpeg.as_slice(), &DecodeOptions::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedFormat);
    let err = decode_into_rgb(jpeg.as_slice(), &DecodeOptions::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedFormat);
    let err = decode_into_rgba(jpeg.as_slice(), &DecodeOptions::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedFormat);
}

#[test]
fn test_ycck_stream_is_unsupported() {
    let jpeg = encode_with_engine(
        &create_cmyk(16, 16),
        16,
        16,
        J_COLOR_SPACE::JCS_CMYK,
        4,
        J_COLOR_SPACE::JCS_YCCK,
    );

    assert_eq!(decode_header(jpeg.as_slice()).unwrap().color_model, ColorModel::Ycck);
    let err = decode(jpeg.as_slice(), &DecodeOptions::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedFormat);
    let err = decode_into_rgb(jpeg.as_slice(), &DecodeOptions::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedFormat);
}

#[test]
fn test_decode_encode_decode_chain() {
    let (w, h) = (1024, 768);
    let img = create_rgb_gradient(w, h);
    let original = encode_with_engine(
        img.as_raw(),
        w,
        h,
        J_COLOR_SPACE::JCS_RGB,
        3,
        J_COLOR_SPACE::JCS_YCbCr,
    );
    assert_eq!(
        decode_header(original.as_slice()).unwrap().subsampling,
        Some(SubsamplingRatio::Ratio420)
    );

    // decode
    let first = decode(original.as_slice(), &DecodeOptions::new()).unwrap();
    assert_eq!((first.width(), first.height()), (w, h));
    let planes = first.into_planes().unwrap();
    assert_eq!(planes.ratio(), Some(SubsamplingRatio::Ratio420));

    // encode
    let options = EncodeOptions::new().with_quality(90);
    let reencoded = encode_to_vec((&planes).into(), &options).unwrap();
    let info = decode_header(reencoded.as_slice()).unwrap();
    assert_eq!((info.width, info.height), (w, h));
    assert_eq!(info.subsampling, Some(SubsamplingRatio::Ratio420));

    // decode again
    let second = decode(reencoded.as_slice(), &DecodeOptions::new()).unwrap();
    assert_eq!((second.width(), second.height()), (w, h));
    assert_eq!(second.planes().unwrap().ratio(), Some(SubsamplingRatio::Ratio420));

    let before = decode_into_rgb(original.as_slice(), &DecodeOptions::new()).unwrap();
    let after = decode_into_rgb(reencoded.as_slice(), &DecodeOptions::new()).unwrap();
    let delta = max_delta(after.as_raw(), before.as_raw());
    assert!(delta <= 10, "generation loss {delta}");
}
