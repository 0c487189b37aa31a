/// A detected face. Coordinates are normalized to 0..1.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FaceRegion {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub confidence: f32,
}

impl FaceRegion {
    pub fn is_finite(&self) -> bool {
        [self.x, self.y, self.w, self.h, self.confidence]
            .iter()
            .all(|v| v.is_finite())
    }

    /// Clip the box to the unit square.
    pub fn clamped(&self) -> FaceRegion {
        let x0 = self.x.clamp(0.0, 1.0);
        let y0 = self.y.clamp(0.0, 1.0);
        let x1 = (self.x + self.w).clamp(0.0, 1.0);
        let y1 = (self.y + self.h).clamp(0.0, 1.0);
        FaceRegion {
            x: x0,
            y: y0,
            w: (x1 - x0).max(0.0),
            h: (y1 - y0).max(0.0),
            confidence: self.confidence,
        }
    }

    /// Pixel rectangle `(x0, y0, x1, y1)`, end-exclusive, for an image of
    /// the given size.
    pub fn pixel_bounds(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let to_px = |v: f32, extent: u32| -> u32 {
            (v * extent as f32).round().clamp(0.0, extent as f32) as u32
        };
        (
            to_px(self.x, width),
            to_px(self.y, height),
            to_px(self.x + self.w, width),
            to_px(self.y + self.h, height),
        )
    }

    pub fn area(&self) -> f32 {
        self.w * self.h
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_clips_to_frame() {
        let r = FaceRegion {
            x: -0.1,
            y: 0.8,
            w: 0.3,
            h: 0.5,
            confidence: 0.9,
        }
        .clamped();
        assert_eq!(r.x, 0.0);
        assert!((r.w - 0.2).abs() < 1e-6);
        assert!((r.y + r.h - 1.0).abs() < 1e-6);
    }

    #[test]
    fn pixel_bounds_round_and_clip() {
        let r = FaceRegion {
            x: 0.25,
            y: 0.0,
            w: 1.0,
            h: 0.5,
            confidence: 1.0,
        };
        assert_eq!(r.pixel_bounds(8, 4), (2, 0, 8, 2));
    }
}
