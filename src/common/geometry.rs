use serde::{Deserialize, Serialize};

/// Normalized or pixel 2-D point depending on context.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    pub fn to_pixels(self, width: u32, height: u32) -> Point {
        Point::new(self.x * f64::from(width), self.y * f64::from(height))
    }
}

/// Axis aligned rectangle in full-frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl PixelRect {
    pub const fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    pub const fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }

    /// Map a point normalized to this window into full-frame normalized coordinates.
    pub fn to_frame(&self, point: Point, frame_width: u32, frame_height: u32) -> Point {
        Point::new(
            (f64::from(self.x) + point.x * f64::from(self.w)) / f64::from(frame_width.max(1)),
            (f64::from(self.y) + point.y * f64::from(self.h)) / f64::from(frame_height.max(1)),
        )
    }

    /// Build a rect from a normalized bbox, clamped to the frame.
    pub fn from_normalized(x: f64, y: f64, w: f64, h: f64, width: u32, height: u32) -> Self {
        let fw = f64::from(width);
        let fh = f64::from(height);
        let x0 = (x * fw).clamp(0.0, fw);
        let y0 = (y * fh).clamp(0.0, fh);
        let x1 = ((x + w) * fw).clamp(0.0, fw);
        let y1 = ((y + h) * fh).clamp(0.0, fh);
        Self::new(
            x0 as u32,
            y0 as u32,
            (x1 - x0).max(0.0) as u32,
            (y1 - y0).max(0.0) as u32,
        )
    }
}
