//! # Calibration Module
//!
//! Loads and validates stereo calibration parameters, as written by the offline stereo
//! calibration tool, and derives the per-pixel remap tables used for rectification.
//!
//! The tables follow the standard pinhole undistort-and-rectify transform: each rectified pixel
//! is taken back through the rectified projection and rectification rotation into normalised
//! camera coordinates, distorted with the plumb bob model (`k1, k2, p1, p2, k3`), and projected
//! through the camera matrix into the raw image.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::fs;
use std::path::Path;

use cv_core::{CameraModel, KeyPoint};
use cv_pinhole::CameraIntrinsics;
use log::{debug, info};
use nalgebra::{Matrix3, Matrix3x4, Point2, Vector2, Vector3};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use serde_any::Format;

use crate::error::{CalibrationLoadError, Error, Result};
use crate::frame::CameraSide;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// A calibration document as stored on disk.
///
/// Every field is optional here so that a missing one can be reported by name, see
/// [`CalibrationModel::from_params`].
#[derive(Clone, Debug, Default, Deserialize)]
pub struct CalibrationParams {
    #[serde(rename = "imageWidth")]
    pub image_width: Option<u32>,

    #[serde(rename = "imageHeight")]
    pub image_height: Option<u32>,

    /// Size of the rectified images, defaults to the raw image size
    #[serde(rename = "rectifiedWidth")]
    pub rectified_width: Option<u32>,

    #[serde(rename = "rectifiedHeight")]
    pub rectified_height: Option<u32>,

    #[serde(rename = "cameraMatrix1")]
    pub camera_matrix1: Option<MatrixParams>,

    #[serde(rename = "cameraMatrix2")]
    pub camera_matrix2: Option<MatrixParams>,

    #[serde(rename = "distCoeffs1")]
    pub dist_coeffs1: Option<MatrixParams>,

    #[serde(rename = "distCoeffs2")]
    pub dist_coeffs2: Option<MatrixParams>,

    #[serde(rename = "R1")]
    pub r1: Option<MatrixParams>,

    #[serde(rename = "R2")]
    pub r2: Option<MatrixParams>,

    #[serde(rename = "P1")]
    pub p1: Option<MatrixParams>,

    #[serde(rename = "P2")]
    pub p2: Option<MatrixParams>,
}

/// A row-major matrix in the layout OpenCV's `FileStorage` uses.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MatrixParams {
    pub rows: usize,
    pub cols: usize,

    /// OpenCV element type, informational only
    #[serde(default)]
    pub dt: Option<String>,

    pub data: Vec<f64>,
}

/// Validated calibration of one camera of the rig.
#[derive(Clone, Debug)]
pub struct CameraCalibration {
    /// Intrinsic matrix of the raw camera
    pub camera_matrix: Matrix3<f64>,

    /// Plumb bob distortion coefficients `k1, k2, p1, p2, k3`
    pub dist_coeffs: [f64; 5],

    /// Rotation from the raw camera frame to the rectified frame
    pub rectification: Matrix3<f64>,

    /// Projection matrix in the rectified frame
    pub projection: Matrix3x4<f64>,

    remap: RemapTable,
}

/// Per-pixel lookup from rectified pixel coordinates to raw pixel coordinates.
///
/// Both maps have shape `(height, width)` of the rectified image.
#[derive(Clone, Debug, PartialEq)]
pub struct RemapTable {
    map_x: Array2<f32>,
    map_y: Array2<f32>,
}

/// Immutable stereo calibration with its precomputed remap tables.
#[derive(Clone, Debug)]
pub struct CalibrationModel {
    image_size: (u32, u32),
    rectified_size: (u32, u32),
    left: CameraCalibration,
    right: CameraCalibration,
}

/// Calibration of one camera in the layout of a ROS `sensor_msgs/CameraInfo` message.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct CameraInfo {
    pub width: u32,
    pub height: u32,
    pub distortion_model: String,
    #[serde(rename = "D")]
    pub d: Vec<f64>,
    #[serde(rename = "K")]
    pub k: [f64; 9],
    #[serde(rename = "R")]
    pub r: [f64; 9],
    #[serde(rename = "P")]
    pub p: [f64; 12],
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl CalibrationModel {
    /// Load a calibration file.
    ///
    /// The format is picked from the extension: `.yml`/`.yaml` (including OpenCV `FileStorage`
    /// output), `.toml` or `.json`.
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::FileNotFound(path.to_path_buf()));
        }

        let format = match path.extension().and_then(|e| e.to_str()) {
            Some("yml") | Some("yaml") => Format::Yaml,
            Some("toml") => Format::Toml,
            Some("json") => Format::Json,
            _ => {
                return Err(CalibrationLoadError::UnsupportedFormat(path.to_path_buf()).into())
            }
        };

        let text = fs::read_to_string(path)?;
        let model = Self::parse(&text, format)?;

        info!(
            "Loaded calibration from {:?} for {}x{} images",
            path, model.image_size.0, model.image_size.1
        );

        Ok(model)
    }

    /// Parse a calibration document held in memory.
    pub fn parse(text: &str, format: Format) -> Result<Self> {
        let params: CalibrationParams = match format {
            Format::Yaml => serde_any::from_str(&strip_opencv_yaml(text), Format::Yaml),
            other => serde_any::from_str(text, other),
        }
        .map_err(CalibrationLoadError::Deserialisation)?;

        Self::from_params(&params)
    }

    /// Validate the parameters and compute the remap tables.
    ///
    /// Fails on the first missing or wrongly shaped field, no model is produced in that case.
    pub fn from_params(params: &CalibrationParams) -> Result<Self> {
        let width = required(params.image_width, "imageWidth")?;
        let height = required(params.image_height, "imageHeight")?;
        if width == 0 || height == 0 {
            return Err(CalibrationLoadError::InvalidImageSize(width, height).into());
        }

        let rectified_size = (
            params.rectified_width.unwrap_or(width),
            params.rectified_height.unwrap_or(height),
        );
        if rectified_size.0 == 0 || rectified_size.1 == 0 {
            return Err(
                CalibrationLoadError::InvalidImageSize(rectified_size.0, rectified_size.1).into(),
            );
        }

        let left = CameraCalibration::from_params(
            CameraFields {
                camera_matrix: ("cameraMatrix1", &params.camera_matrix1),
                dist_coeffs: ("distCoeffs1", &params.dist_coeffs1),
                rectification: ("R1", &params.r1),
                projection: ("P1", &params.p1),
            },
            rectified_size,
        )?;
        let right = CameraCalibration::from_params(
            CameraFields {
                camera_matrix: ("cameraMatrix2", &params.camera_matrix2),
                dist_coeffs: ("distCoeffs2", &params.dist_coeffs2),
                rectification: ("R2", &params.r2),
                projection: ("P2", &params.p2),
            },
            rectified_size,
        )?;

        debug!(
            "Computed {}x{} remap tables for both cameras",
            rectified_size.0, rectified_size.1
        );

        Ok(Self {
            image_size: (width, height),
            rectified_size,
            left,
            right,
        })
    }

    /// `(width, height)` raw frames must have
    pub fn image_size(&self) -> (u32, u32) {
        self.image_size
    }

    /// `(width, height)` of rectified frames
    pub fn rectified_size(&self) -> (u32, u32) {
        self.rectified_size
    }

    pub fn camera(&self, side: CameraSide) -> &CameraCalibration {
        match side {
            CameraSide::Left => &self.left,
            CameraSide::Right => &self.right,
        }
    }

    pub fn remap(&self, side: CameraSide) -> &RemapTable {
        &self.camera(side).remap
    }

    /// Camera info for one side, as published next to rectified images.
    pub fn camera_info(&self, side: CameraSide) -> CameraInfo {
        let camera = self.camera(side);

        let mut k = [0.0; 9];
        let mut r = [0.0; 9];
        let mut p = [0.0; 12];
        for row in 0..3 {
            for col in 0..3 {
                k[row * 3 + col] = camera.camera_matrix[(row, col)];
                r[row * 3 + col] = camera.rectification[(row, col)];
            }
            for col in 0..4 {
                p[row * 4 + col] = camera.projection[(row, col)];
            }
        }

        CameraInfo {
            width: self.image_size.0,
            height: self.image_size.1,
            distortion_model: String::from("plumb_bob"),
            d: camera.dist_coeffs.to_vec(),
            k,
            r,
            p,
        }
    }
}

/// Names and values of one camera's fields, so errors can name the offending one.
struct CameraFields<'a> {
    camera_matrix: (&'static str, &'a Option<MatrixParams>),
    dist_coeffs: (&'static str, &'a Option<MatrixParams>),
    rectification: (&'static str, &'a Option<MatrixParams>),
    projection: (&'static str, &'a Option<MatrixParams>),
}

impl CameraCalibration {
    fn from_params(fields: CameraFields, rectified_size: (u32, u32)) -> Result<Self> {
        let (k_name, k) = fields.camera_matrix;
        let (d_name, d) = fields.dist_coeffs;
        let (r_name, r) = fields.rectification;
        let (p_name, p) = fields.projection;

        let camera_matrix = Matrix3::from_row_slice(&shaped(k, k_name, 3, 3)?);
        let dist_coeffs = distortion(d, d_name)?;
        let rectification = Matrix3::from_row_slice(&shaped(r, r_name, 3, 3)?);
        let projection = Matrix3x4::from_row_slice(&shaped(p, p_name, 3, 4)?);

        if camera_matrix[(0, 0)] == 0.0 || camera_matrix[(1, 1)] == 0.0 {
            return Err(CalibrationLoadError::SingularMatrix(k_name).into());
        }
        if projection[(0, 0)] == 0.0 || projection[(1, 1)] == 0.0 {
            return Err(CalibrationLoadError::SingularMatrix(p_name).into());
        }
        let inv_rectification = rectification
            .try_inverse()
            .ok_or(CalibrationLoadError::SingularMatrix(r_name))?;

        let remap = RemapTable::undistort_rectify(
            &camera_matrix,
            &dist_coeffs,
            &inv_rectification,
            &projection,
            rectified_size,
        );

        Ok(Self {
            camera_matrix,
            dist_coeffs,
            rectification,
            projection,
            remap,
        })
    }
}

impl RemapTable {
    /// Compute the table mapping every rectified pixel to its raw source position.
    fn undistort_rectify(
        camera_matrix: &Matrix3<f64>,
        dist_coeffs: &[f64; 5],
        inv_rectification: &Matrix3<f64>,
        projection: &Matrix3x4<f64>,
        size: (u32, u32),
    ) -> Self {
        let (width, height) = (size.0 as usize, size.1 as usize);

        // Only the left 3x3 block of the projection acts as the rectified camera matrix
        let rectified = CameraIntrinsics {
            focals: Vector2::new(projection[(0, 0)], projection[(1, 1)]),
            principal_point: Point2::new(projection[(0, 2)], projection[(1, 2)]),
            skew: projection[(0, 1)],
        };

        let fx = camera_matrix[(0, 0)];
        let fy = camera_matrix[(1, 1)];
        let skew = camera_matrix[(0, 1)];
        let cx = camera_matrix[(0, 2)];
        let cy = camera_matrix[(1, 2)];
        let [k1, k2, p1, p2, k3] = *dist_coeffs;

        let mut map_x = Array2::<f32>::zeros((height, width));
        let mut map_y = Array2::<f32>::zeros((height, width));

        for v in 0..height {
            for u in 0..width {
                let norm = rectified.calibrate(KeyPoint(Point2::new(u as f64, v as f64)));
                let ray = inv_rectification * Vector3::new(norm.0.x, norm.0.y, 1.0);

                // Rays parallel to the image plane never reach the raw image
                if ray.z.abs() < std::f64::EPSILON {
                    map_x[[v, u]] = -1.0;
                    map_y[[v, u]] = -1.0;
                    continue;
                }

                let x = ray.x / ray.z;
                let y = ray.y / ray.z;

                let x2 = x * x;
                let y2 = y * y;
                let r2 = x2 + y2;
                let xy2 = 2.0 * x * y;
                let radial = 1.0 + ((k3 * r2 + k2) * r2 + k1) * r2;

                let xd = x * radial + p1 * xy2 + p2 * (r2 + 2.0 * x2);
                let yd = y * radial + p1 * (r2 + 2.0 * y2) + p2 * xy2;

                map_x[[v, u]] = (fx * xd + skew * yd + cx) as f32;
                map_y[[v, u]] = (fy * yd + cy) as f32;
            }
        }

        Self { map_x, map_y }
    }

    pub fn width(&self) -> u32 {
        self.map_x.ncols() as u32
    }

    pub fn height(&self) -> u32 {
        self.map_x.nrows() as u32
    }

    /// Raw image position sampled for rectified pixel `(x, y)`.
    pub fn source(&self, x: u32, y: u32) -> (f32, f32) {
        let index = [y as usize, x as usize];
        (self.map_x[index], self.map_y[index])
    }

    pub fn map_x(&self) -> &Array2<f32> {
        &self.map_x
    }

    pub fn map_y(&self) -> &Array2<f32> {
        &self.map_y
    }
}

// -----------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// -----------------------------------------------------------------------------------------------

fn required<T: Copy>(value: Option<T>, field: &'static str) -> Result<T> {
    value.ok_or_else(|| CalibrationLoadError::MissingField(field).into())
}

/// Return the data of `matrix` if it is exactly `rows`x`cols`.
fn shaped(
    matrix: &Option<MatrixParams>,
    field: &'static str,
    rows: usize,
    cols: usize,
) -> Result<Vec<f64>> {
    let matrix = matrix
        .as_ref()
        .ok_or(CalibrationLoadError::MissingField(field))?;

    if matrix.rows != rows || matrix.cols != cols || matrix.data.len() != rows * cols {
        return Err(malformed(matrix, field, (rows, cols)).into());
    }

    Ok(matrix.data.clone())
}

/// Distortion vectors are accepted as a 5x1 column or a 1x5 row.
fn distortion(matrix: &Option<MatrixParams>, field: &'static str) -> Result<[f64; 5]> {
    let matrix = matrix
        .as_ref()
        .ok_or(CalibrationLoadError::MissingField(field))?;

    let shape = (matrix.rows, matrix.cols);
    if (shape != (5, 1) && shape != (1, 5)) || matrix.data.len() != 5 {
        return Err(malformed(matrix, field, (5, 1)).into());
    }

    let mut coeffs = [0.0; 5];
    coeffs.copy_from_slice(&matrix.data);

    Ok(coeffs)
}

fn malformed(
    matrix: &MatrixParams,
    field: &'static str,
    expected: (usize, usize),
) -> CalibrationLoadError {
    CalibrationLoadError::MalformedMatrix {
        field,
        expected,
        found: (matrix.rows, matrix.cols),
        len: matrix.data.len(),
    }
}

/// Turn OpenCV `FileStorage` YAML into plain YAML.
///
/// Drops the `%YAML:1.0` directive, which is not valid YAML, and the `!!opencv-matrix` tags.
fn strip_opencv_yaml(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("%YAML"))
        .map(|line| line.replace("!!opencv-matrix", ""))
        .collect::<Vec<_>>()
        .join("\n")
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {

    use super::*;

    fn matrix(rows: usize, cols: usize, data: &[f64]) -> Option<MatrixParams> {
        Some(MatrixParams {
            rows,
            cols,
            dt: Some(String::from("d")),
            data: data.to_vec(),
        })
    }

    const K: [f64; 9] = [100.0, 0.0, 16.0, 0.0, 100.0, 12.0, 0.0, 0.0, 1.0];
    const I3: [f64; 9] = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];
    const P: [f64; 12] = [100.0, 0.0, 16.0, 0.0, 0.0, 100.0, 12.0, 0.0, 0.0, 0.0, 1.0, 0.0];

    /// Zero distortion, identity rotation and `P = [K | 0]` for both cameras
    fn identity_params() -> CalibrationParams {
        CalibrationParams {
            image_width: Some(32),
            image_height: Some(24),
            rectified_width: None,
            rectified_height: None,
            camera_matrix1: matrix(3, 3, &K),
            camera_matrix2: matrix(3, 3, &K),
            dist_coeffs1: matrix(5, 1, &[0.0; 5]),
            dist_coeffs2: matrix(1, 5, &[0.0; 5]),
            r1: matrix(3, 3, &I3),
            r2: matrix(3, 3, &I3),
            p1: matrix(3, 4, &P),
            p2: matrix(3, 4, &P),
        }
    }

    #[test]
    fn test_identity_remap() {
        let model = CalibrationModel::from_params(&identity_params()).unwrap();
        assert_eq!(model.image_size(), (32, 24));
        assert_eq!(model.rectified_size(), (32, 24));

        for side in &[CameraSide::Left, CameraSide::Right] {
            let table = model.remap(*side);
            assert_eq!((table.width(), table.height()), (32, 24));

            for y in 0..24 {
                for x in 0..32 {
                    let (sx, sy) = table.source(x, y);
                    assert!((sx - x as f32).abs() < 1e-3, "x map at ({}, {}) is {}", x, y, sx);
                    assert!((sy - y as f32).abs() < 1e-3, "y map at ({}, {}) is {}", x, y, sy);
                }
            }
        }
    }

    #[test]
    fn test_missing_p1() {
        let mut params = identity_params();
        params.p1 = None;

        match CalibrationModel::from_params(&params) {
            Err(Error::CalibrationLoad(CalibrationLoadError::MissingField(field))) => {
                assert_eq!(field, "P1")
            }
            _ => panic!("expected P1 to be reported missing"),
        }
    }

    #[test]
    fn test_missing_image_size() {
        let mut params = identity_params();
        params.image_height = None;

        assert!(matches!(
            CalibrationModel::from_params(&params),
            Err(Error::CalibrationLoad(CalibrationLoadError::MissingField("imageHeight")))
        ));
    }

    #[test]
    fn test_malformed_matrices() {
        let mut params = identity_params();
        params.r2 = matrix(3, 4, &P);
        match CalibrationModel::from_params(&params) {
            Err(Error::CalibrationLoad(CalibrationLoadError::MalformedMatrix {
                field,
                expected,
                found,
                ..
            })) => {
                assert_eq!(field, "R2");
                assert_eq!(expected, (3, 3));
                assert_eq!(found, (3, 4));
            }
            _ => panic!("expected R2 to be reported malformed"),
        }

        let mut params = identity_params();
        params.dist_coeffs1 = matrix(4, 1, &[0.0; 4]);
        assert!(matches!(
            CalibrationModel::from_params(&params),
            Err(Error::CalibrationLoad(CalibrationLoadError::MalformedMatrix { field: "distCoeffs1", .. }))
        ));

        // Shape and data length must agree
        let mut params = identity_params();
        params.camera_matrix1 = matrix(3, 3, &[1.0; 8]);
        assert!(matches!(
            CalibrationModel::from_params(&params),
            Err(Error::CalibrationLoad(CalibrationLoadError::MalformedMatrix { field: "cameraMatrix1", len: 8, .. }))
        ));
    }

    #[test]
    fn test_singular_rectification() {
        let mut params = identity_params();
        params.r1 = matrix(3, 3, &[0.0; 9]);

        assert!(matches!(
            CalibrationModel::from_params(&params),
            Err(Error::CalibrationLoad(CalibrationLoadError::SingularMatrix("R1")))
        ));
    }

    #[test]
    fn test_rectified_size_override() {
        let mut params = identity_params();
        params.rectified_width = Some(16);
        params.rectified_height = Some(12);

        let model = CalibrationModel::from_params(&params).unwrap();
        assert_eq!(model.image_size(), (32, 24));
        assert_eq!(model.rectified_size(), (16, 12));
        assert_eq!(model.remap(CameraSide::Left).height(), 12);
    }

    /// Barrel distortion pulls source positions towards the centre less than the ideal ray
    #[test]
    fn test_radial_distortion_moves_corners() {
        let mut params = identity_params();
        params.dist_coeffs1 = matrix(5, 1, &[-0.3, 0.0, 0.0, 0.0, 0.0]);

        let model = CalibrationModel::from_params(&params).unwrap();

        // The principal point maps onto itself
        let (cx, cy) = model.remap(CameraSide::Left).source(16, 12);
        assert!((cx - 16.0).abs() < 1e-3 && (cy - 12.0).abs() < 1e-3);

        // A corner is pulled inwards
        let (sx, sy) = model.remap(CameraSide::Left).source(0, 0);
        assert!(sx > 0.0 && sy > 0.0);

        // The right camera is unaffected
        let (rx, ry) = model.remap(CameraSide::Right).source(0, 0);
        assert!(rx.abs() < 1e-3 && ry.abs() < 1e-3);
    }

    #[test]
    fn test_parse_opencv_yaml() {
        let text = r#"%YAML:1.0
---
imageWidth: 32
imageHeight: 24
cameraMatrix1: !!opencv-matrix
   rows: 3
   cols: 3
   dt: d
   data: [ 100., 0., 16., 0., 100., 12., 0., 0., 1. ]
cameraMatrix2: !!opencv-matrix
   rows: 3
   cols: 3
   dt: d
   data: [ 100., 0., 16., 0., 100., 12., 0., 0., 1. ]
distCoeffs1: !!opencv-matrix
   rows: 5
   cols: 1
   dt: d
   data: [ 0., 0., 0., 0., 0. ]
distCoeffs2: !!opencv-matrix
   rows: 5
   cols: 1
   dt: d
   data: [ 0., 0., 0., 0., 0. ]
R1: !!opencv-matrix
   rows: 3
   cols: 3
   dt: d
   data: [ 1., 0., 0., 0., 1., 0., 0., 0., 1. ]
R2: !!opencv-matrix
   rows: 3
   cols: 3
   dt: d
   data: [ 1., 0., 0., 0., 1., 0., 0., 0., 1. ]
P1: !!opencv-matrix
   rows: 3
   cols: 4
   dt: d
   data: [ 100., 0., 16., 0., 0., 100., 12., 0., 0., 0., 1., 0. ]
P2: !!opencv-matrix
   rows: 3
   cols: 4
   dt: d
   data: [ 100., 0., 16., -6.0e+00, 0., 100., 12., 0., 0., 0., 1., 0. ]
"#;

        let model = CalibrationModel::parse(text, Format::Yaml).unwrap();
        assert_eq!(model.image_size(), (32, 24));
        assert_eq!(model.camera(CameraSide::Right).projection[(0, 3)], -6.0);
    }

    #[test]
    fn test_parse_json_missing_field() {
        let result = CalibrationModel::parse(r#"{ "imageWidth": 32, "imageHeight": 24 }"#, Format::Json);

        assert!(matches!(
            result,
            Err(Error::CalibrationLoad(CalibrationLoadError::MissingField("cameraMatrix1")))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            CalibrationModel::load_file("does/not/exist.yml"),
            Err(Error::FileNotFound(_))
        ));
    }

    #[test]
    fn test_camera_info() {
        let model = CalibrationModel::from_params(&identity_params()).unwrap();
        let info = model.camera_info(CameraSide::Left);

        assert_eq!(info.distortion_model, "plumb_bob");
        assert_eq!((info.width, info.height), (32, 24));
        assert_eq!(info.k, K);
        assert_eq!(info.r, I3);
        assert_eq!(info.p, P);
        assert_eq!(info.d, vec![0.0; 5]);
    }
}
