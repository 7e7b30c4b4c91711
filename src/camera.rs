use crate::config::validate_bounds;
use crate::error::{NerfError, Result};
use crate::vec3::Vec3;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// A ray segment `origin + t * direction` for `t` in `[near, far]`.
///
/// `direction` is not required to be unit length; the integrator scales
/// step lengths by its norm.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Ray {
    origin: Vec3,
    direction: Vec3,
    near: f32,
    far: f32,
}

impl Ray {
    pub fn new(origin: Vec3, direction: Vec3, near: f32, far: f32) -> Result<Self> {
        validate_bounds(near, far)?;
        if !origin.is_finite() || !direction.is_finite() || direction.length() == 0.0 {
            return Err(NerfError::geometry(format!(
                "ray needs a finite origin and a non-zero direction, got {origin:?} {direction:?}"
            )));
        }
        Ok(Self {
            origin,
            direction,
            near,
            far,
        })
    }

    pub fn origin(&self) -> Vec3 {
        self.origin
    }

    pub fn direction(&self) -> Vec3 {
        self.direction
    }

    pub fn near(&self) -> f32 {
        self.near
    }

    pub fn far(&self) -> f32 {
        self.far
    }

    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }
}

/// Pinhole validation camera. Rays leave `pos` through an image plane one
/// unit in front of it; `half_extent` is that plane's half width and height.
#[derive(Clone, Debug)]
pub struct Camera {
    pub width: usize,
    pub height: usize,
    pub pos: Vec3,
    pub near: f32,
    pub far: f32,
    forward: Vec3,
    right: Vec3,
    up: Vec3,
    half_extent: (f32, f32),
}

impl Camera {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pos: Vec3,
        forward: Vec3,
        up: Vec3,
        width: usize,
        height: usize,
        focal: f32,
        near: f32,
        far: f32,
    ) -> Result<Self> {
        validate_bounds(near, far)?;
        if width == 0 || height == 0 {
            return Err(NerfError::geometry("camera needs at least one pixel"));
        }
        if !(focal > 0.0) {
            return Err(NerfError::geometry(format!("focal length {focal} must be positive")));
        }
        let forward = forward.normalize();
        let side = forward.cross(&up.normalize());
        if !(side.length() >= 1e-6) {
            return Err(NerfError::geometry(format!(
                "camera forward {forward:?} and up {up:?} do not span a plane"
            )));
        }
        let right = side.normalize();
        Ok(Self {
            width,
            height,
            pos,
            near,
            far,
            forward,
            right,
            // Re-orthogonalized, so a tilted `up` still gives square pixels.
            up: right.cross(&forward),
            half_extent: (0.5 * width as f32 / focal, 0.5 * height as f32 / focal),
        })
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    /// Unnormalised direction through the center of pixel (`row`, `col`).
    /// Row 0 is the top of the image.
    pub fn ray_dir(&self, row: usize, col: usize) -> Vec3 {
        let (half_w, half_h) = self.half_extent;
        let s = (col as f32 + 0.5) / self.width as f32;
        let t = (row as f32 + 0.5) / self.height as f32;
        self.forward + self.right * ((2.0 * s - 1.0) * half_w) + self.up * ((1.0 - 2.0 * t) * half_h)
    }

    /// Ray for the flat pixel index `row * width + col`.
    pub fn ray(&self, pixel: usize) -> Result<Ray> {
        if pixel >= self.pixel_count() {
            return Err(NerfError::geometry(format!(
                "pixel {pixel} outside a {}x{} image",
                self.width, self.height
            )));
        }
        let dir = self.ray_dir(pixel / self.width, pixel % self.width);
        Ray::new(self.pos, dir.normalize(), self.near, self.far)
    }
}

/// Camera description as stored alongside a trained scene.
#[derive(Clone, Debug, Deserialize)]
pub struct CameraView {
    pub camera_origin: Vec3,
    pub camera_forward: Vec3,
    pub camera_up: Vec3,
    /// (height, width, focal)
    pub hwf: [f32; 3],
    #[serde(default)]
    pub near: Option<f32>,
    #[serde(default)]
    pub far: Option<f32>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ViewFile {
    Many(Vec<CameraView>),
    One(CameraView),
}

impl CameraView {
    /// Builds a camera, optionally resampling the image to `size` (width, height)
    /// while keeping the field of view.
    pub fn camera(
        &self,
        size: Option<(usize, usize)>,
        default_near: f32,
        default_far: f32,
    ) -> Result<Camera> {
        let [h, w, focal] = self.hwf;
        let (width, height) = size.unwrap_or((w.round() as usize, h.round() as usize));
        let scaled_focal = if w > 0.0 { focal * width as f32 / w } else { focal };
        Camera::new(
            self.camera_origin,
            self.camera_forward,
            self.camera_up,
            width,
            height,
            scaled_focal,
            self.near.unwrap_or(default_near),
            self.far.unwrap_or(default_far),
        )
    }
}

/// Reads a single view or a list of views from JSON.
pub fn load_views(path: &Path) -> Result<Vec<CameraView>> {
    let content = fs::read_to_string(path)?;
    parse_views(&content)
}

pub fn parse_views(content: &str) -> Result<Vec<CameraView>> {
    let file: ViewFile = serde_json::from_str(content)?;
    Ok(match file {
        ViewFile::Many(views) => views,
        ViewFile::One(view) => vec![view],
    })
}
