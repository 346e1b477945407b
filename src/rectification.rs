//! # Image Rectification Module
//!
//! This module applies a calibration model's remap tables to raw stereo frames.
//!
//! Rectification is a pure function of the frame and the model, the model is never mutated, so
//! independent pairs can be rectified concurrently against one shared model.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use image::RgbImage;

use crate::calibration::{CalibrationModel, RemapTable};
use crate::error::{Error, Result};
use crate::frame::{CameraSide, RawFrame, StereoFrame};

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

/// Rectify a raw stereo pair.
///
/// Both frames must have the model's raw image size, the output has the model's rectified size.
/// Sequence numbers and timestamps are carried over.
pub fn rectify(left: &RawFrame, right: &RawFrame, model: &CalibrationModel) -> Result<StereoFrame> {
    Ok(StereoFrame {
        left: rectify_frame(left, CameraSide::Left, model)?,
        right: rectify_frame(right, CameraSide::Right, model)?,
    })
}

/// Rectify one camera's frame.
pub fn rectify_frame(frame: &RawFrame, side: CameraSide, model: &CalibrationModel) -> Result<RawFrame> {
    let found = frame.dimensions();
    let expected = model.image_size();
    if found != expected {
        return Err(Error::SizeMismatch { expected, found });
    }

    Ok(RawFrame {
        image: remap(&frame.image, model.remap(side)),
        sequence: frame.sequence,
        timestamp: frame.timestamp,
    })
}

/// Sample `image` at every position of `table` with bilinear interpolation.
///
/// Neighbours outside the source image count as black, so pixels mapping outside it come out
/// black.
pub fn remap(image: &RgbImage, table: &RemapTable) -> RgbImage {
    let (src_width, src_height) = (image.width() as i64, image.height() as i64);
    let (width, height) = (table.width(), table.height());
    let src: &[u8] = image;

    let mut rect_img = RgbImage::new(width, height);
    {
        let dst: &mut [u8] = &mut rect_img;
        let map_x = table.map_x();
        let map_y = table.map_y();

        for y in 0..height as usize {
            for x in 0..width as usize {
                let sx = map_x[[y, x]];
                let sy = map_y[[y, x]];

                // Also rejects NaN
                if !(sx > -1.0 && sy > -1.0 && sx < src_width as f32 && sy < src_height as f32) {
                    continue;
                }

                let x0 = sx.floor();
                let y0 = sy.floor();
                let ax = sx - x0;
                let ay = sy - y0;
                let (x0, y0) = (x0 as i64, y0 as i64);

                let taps = [
                    (x0, y0, (1.0 - ax) * (1.0 - ay)),
                    (x0 + 1, y0, ax * (1.0 - ay)),
                    (x0, y0 + 1, (1.0 - ax) * ay),
                    (x0 + 1, y0 + 1, ax * ay),
                ];

                let mut acc = [0.0f32; 3];
                for &(px, py, weight) in &taps {
                    if weight == 0.0 || px < 0 || py < 0 || px >= src_width || py >= src_height {
                        continue;
                    }

                    let i = ((py * src_width + px) * 3) as usize;
                    for c in 0..3 {
                        acc[c] += weight * src[i + c] as f32;
                    }
                }

                let o = (y * width as usize + x) * 3;
                for c in 0..3 {
                    dst[o + c] = acc[c].round().max(0.0).min(255.0) as u8;
                }
            }
        }
    }

    rect_img
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {

    use super::*;
    use crate::calibration::{CalibrationParams, MatrixParams};
    use image::Rgb;
    use std::sync::Arc;
    use std::thread;

    fn matrix(rows: usize, cols: usize, data: Vec<f64>) -> Option<MatrixParams> {
        Some(MatrixParams {
            rows,
            cols,
            dt: None,
            data,
        })
    }

    /// Undistorted model whose rectified principal point is offset by `shift` pixels in x
    fn model(size: (u32, u32), rectified: Option<(u32, u32)>, shift: f64) -> CalibrationModel {
        let (w, h) = (size.0 as f64, size.1 as f64);
        let (rw, rh) = rectified.map(|(a, b)| (a as f64, b as f64)).unwrap_or((w, h));
        let scale = rw / w;

        let k = vec![50.0, 0.0, w / 2.0, 0.0, 50.0, h / 2.0, 0.0, 0.0, 1.0];
        let p = vec![
            50.0 * scale, 0.0, rw / 2.0 + shift, 0.0,
            0.0, 50.0 * scale, rh / 2.0, 0.0,
            0.0, 0.0, 1.0, 0.0,
        ];
        let r = vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];

        CalibrationModel::from_params(&CalibrationParams {
            image_width: Some(size.0),
            image_height: Some(size.1),
            rectified_width: rectified.map(|r| r.0),
            rectified_height: rectified.map(|r| r.1),
            camera_matrix1: matrix(3, 3, k.clone()),
            camera_matrix2: matrix(3, 3, k),
            dist_coeffs1: matrix(5, 1, vec![-0.2, 0.05, 0.001, -0.001, 0.0]),
            dist_coeffs2: matrix(5, 1, vec![0.0; 5]),
            r1: matrix(3, 3, r.clone()),
            r2: matrix(3, 3, r),
            p1: matrix(3, 4, p.clone()),
            p2: matrix(3, 4, p),
        })
        .unwrap()
    }

    fn gradient(width: u32, height: u32) -> RawFrame {
        let mut img = RgbImage::new(width, height);
        for (x, y, p) in img.enumerate_pixels_mut() {
            *p = Rgb([(x * 7 % 256) as u8, (y * 11 % 256) as u8, ((x + y) % 256) as u8]);
        }
        RawFrame::new(img, 99)
    }

    #[test]
    fn test_identity_preserves_image() {
        let model = model((20, 16), None, 0.0);
        let raw = gradient(20, 16);

        // The right camera has no distortion, so it is an identity mapping
        let rect = rectify_frame(&raw, CameraSide::Right, &model).unwrap();
        assert_eq!(rect.image, raw.image);
        assert_eq!(rect.timestamp, 99);
    }

    #[test]
    fn test_rectify_is_deterministic() {
        let model = model((20, 16), None, 0.0);
        let left = gradient(20, 16);
        let right = gradient(20, 16);

        let first = rectify(&left, &right, &model).unwrap();
        let second = rectify(&left, &right, &model).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_size_mismatch() {
        let model = model((20, 16), None, 0.0);
        let left = gradient(20, 16);
        let right = gradient(16, 16);

        match rectify(&left, &right, &model) {
            Err(Error::SizeMismatch { expected, found }) => {
                assert_eq!(expected, (20, 16));
                assert_eq!(found, (16, 16));
            }
            _ => panic!("expected a size mismatch"),
        }
    }

    #[test]
    fn test_output_has_rectified_size() {
        let model = model((40, 30), Some((20, 15)), 0.0);
        let raw = RawFrame::now(RgbImage::from_pixel(40, 30, Rgb([80, 90, 100])));

        let rect = rectify(&raw, &raw, &model).unwrap();
        assert_eq!(rect.left.dimensions(), (20, 15));
        assert_eq!(rect.right.dimensions(), (20, 15));
        // A uniform source stays uniform well inside the borders
        assert_eq!(*rect.right.image.get_pixel(10, 7), Rgb([80, 90, 100]));
    }

    #[test]
    fn test_outside_source_is_black() {
        // Shifting the rectified principal point far right moves every source position off-image
        let model = model((20, 16), None, 1000.0);
        let raw = RawFrame::now(RgbImage::from_pixel(20, 16, Rgb([255, 255, 255])));

        let rect = rectify_frame(&raw, CameraSide::Right, &model).unwrap();
        assert!(rect.image.pixels().all(|p| *p == Rgb([0, 0, 0])));
    }

    #[test]
    fn test_concurrent_rectification() {
        let model = Arc::new(model((20, 16), None, 0.0));
        let raw = gradient(20, 16);
        let expected = rectify(&raw, &raw, &model).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let model = model.clone();
                let raw = raw.clone();
                thread::spawn(move || rectify(&raw, &raw, &model).unwrap())
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), expected);
        }
    }
}
