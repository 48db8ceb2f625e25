//! Face boxes and the square crop regions cut around them.

use serde::{Deserialize, Serialize};

/// Axis-aligned box in pixel coordinates: top-left corner plus size.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn iou(&self, other: &Rect) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }

        let inter = (x2 - x1) * (y2 - y1);
        inter / (self.area() + other.area() - inter)
    }

    /// Moves every component `factor` of the way towards `target`.
    pub fn lerp(&self, target: &Rect, factor: f32) -> Rect {
        let mix = |a: f32, b: f32| a + factor * (b - a);
        Rect {
            x: mix(self.x, target.x),
            y: mix(self.y, target.y),
            width: mix(self.width, target.width),
            height: mix(self.height, target.height),
        }
    }
}

/// Square pixel region inside a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub size: u32,
}

impl CropRegion {
    /// Square of side `size * (1 + 2 * margin)` centred on the face, pushed
    /// back inside a `frame_width` x `frame_height` frame and shrunk to its
    /// shorter side when it does not fit.
    pub fn around(face: &Rect, size: f32, margin: f32, frame_width: u32, frame_height: u32) -> Self {
        let limit = frame_width.min(frame_height).max(1);
        let side = (size * (1.0 + 2.0 * margin)).round();
        let side = if side.is_finite() && side >= 1.0 {
            (side as u32).min(limit)
        } else {
            limit
        };

        let (cx, cy) = face.center();
        let place = |center: f32, extent: u32| -> u32 {
            let start = (center - side as f32 / 2.0).round();
            let max_start = (extent - side) as f32;
            start.clamp(0.0, max_start) as u32
        };

        Self {
            x: place(cx, frame_width),
            y: place(cy, frame_height),
            size: side,
        }
    }
}
