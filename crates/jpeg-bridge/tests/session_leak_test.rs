//! Every session releases its handle, whether it completes or fails.
//!
//! Kept in its own test binary so no other test's sessions are live while
//! the count is checked.

use std::io::{self, Read, Write};
use std::thread;

use image::{Rgb, RgbImage};
use jpeg_bridge::*;

/// Reader that serves a prefix of `data`, then fails.
struct FailingReader<'a> {
    data: &'a [u8],
}

impl Read for FailingReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.data.is_empty() {
            return Err(io::Error::other("connection reset"));
        }
        let n = self.data.read(buf)?;
        Ok(n)
    }
}

/// Writer that fails after `limit` bytes.
struct FailingWriter {
    limit: usize,
}

impl Write for FailingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.limit == 0 {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"));
        }
        let n = buf.len().min(self.limit);
        self.limit -= n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn sample_jpeg(seed: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(120, 90, |x, y| {
        Rgb([(x + seed) as u8, (y * 2) as u8, ((x ^ y) + seed) as u8])
    });
    encode_to_vec((&img).into(), &EncodeOptions::default()).unwrap()
}

#[test]
fn test_no_session_outlives_its_call() {
    assert_eq!(active_sessions(), 0);

    let workers: Vec<_> = (0..8u32)
        .map(|seed| {
            thread::spawn(move || {
                let jpeg = sample_jpeg(seed);
                let options = DecodeOptions::new();

                assert!(decode(jpeg.as_slice(), &options).is_ok());
                let scaled = options.clone().with_scale_target(30, 30);
                assert!(decode_into_rgb(jpeg.as_slice(), &scaled).is_ok());
                assert!(decode_header(jpeg.as_slice()).is_ok());

                let err = decode(&jpeg[..jpeg.len() / 3], &options).unwrap_err();
                assert_eq!(err.kind(), ErrorKind::MalformedInput);

                let reader = FailingReader {
                    data: &jpeg[..jpeg.len() / 2],
                };
                let err = decode_into_rgb(reader, &options).unwrap_err();
                assert_eq!(err.kind(), ErrorKind::IoFailure);

                let err = decode(&b"not a jpeg at all"[..], &options).unwrap_err();
                assert_eq!(err.kind(), ErrorKind::MalformedInput);

                let img = decode_into_rgb(jpeg.as_slice(), &options).unwrap();
                let writer = FailingWriter { limit: 100 };
                let err = encode(writer, (&img).into(), &EncodeOptions::default()).unwrap_err();
                assert_eq!(err.kind(), ErrorKind::IoFailure);
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(active_sessions(), 0);
}
