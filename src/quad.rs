//! Clipped quad computation and the GPU-side instance layouts.
//!
//! Every backend draws a rectangle as a four-vertex triangle strip whose
//! corners are derived from the vertex index, so the only per-draw data is a
//! [`QuadInstance`] (or a [`PickInstance`] in the identity pass). The strip's
//! corner order is `(0,0) (1,0) (0,1) (1,1)`.

use bytemuck::{Pod, Zeroable};

use crate::identity::WidgetId;
use crate::types::{Color, Point, Rect};

/// One textured or flat rectangle, already clipped to its frame.
///
/// `uv` holds the sampled sub-rectangle of the texture as
/// `[u_offset, v_offset, u_extent, v_extent]`: the fractional position of the
/// clipped rectangle inside the unclipped one.
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct QuadInstance {
    /// Clipped rectangle `[x, y, w, h]` in virtual-desktop pixels.
    pub rect: [f32; 4],
    /// Texture sub-rectangle in normalized coordinates.
    pub uv: [f32; 4],
    /// Color multiplied with the sampled texel.
    pub color: [f32; 4],
}

impl QuadInstance {
    /// Clip `rect` against `frame` and derive the matching texture window.
    ///
    /// An empty intersection yields a zero-sized quad, which rasterizes to
    /// nothing.
    #[must_use]
    #[expect(clippy::cast_precision_loss)]
    pub fn new(rect: Rect, frame: Rect, color: Color) -> Self {
        let isct = rect.intersect(&frame);
        let uv = if isct.is_empty() {
            [0.0; 4]
        } else {
            // Non-empty intersection implies a positive rect size.
            let (rw, rh) = (rect.w as f32, rect.h as f32);
            [
                (isct.x - rect.x) as f32 / rw,
                (isct.y - rect.y) as f32 / rh,
                isct.w as f32 / rw,
                isct.h as f32 / rh,
            ]
        };
        Self {
            rect: rect_f32(isct),
            uv,
            color,
        }
    }

    /// Whether the quad covers no pixels.
    #[must_use]
    pub fn is_degenerate(&self) -> bool {
        self.rect[2] <= 0.0 || self.rect[3] <= 0.0
    }
}

/// One rectangle of the identity pass.
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct PickInstance {
    /// Clipped rectangle `[x, y, w, h]`.
    pub rect: [f32; 4],
    /// Widget token as `[low, high]` 32-bit halves.
    pub id: [u32; 2],
    /// Keeps the struct 16-byte aligned for uniform and push-constant use.
    pub _pad: [u32; 2],
}

impl PickInstance {
    /// Clip `rect` against `frame` and attach the widget's token.
    #[must_use]
    pub fn new(id: WidgetId, rect: Rect, frame: Rect) -> Self {
        Self {
            rect: rect_f32(rect.intersect(&frame)),
            id: id.to_halves(),
            _pad: [0; 2],
        }
    }
}

/// Per-view transform uniform.
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct ViewUniform {
    /// `[origin_x, origin_y, half_w, half_h]`.
    pub pview: [f32; 4],
}

impl ViewUniform {
    /// Transform mapping a view's rectangle onto the whole target.
    #[must_use]
    pub fn for_view(rect: Rect) -> Self {
        #[expect(clippy::cast_precision_loss)]
        let pview = [
            rect.x as f32,
            rect.y as f32,
            rect.w.max(1) as f32 / 2.0,
            rect.h.max(1) as f32 / 2.0,
        ];
        Self { pview }
    }

    /// Transform mapping the single pixel at `point` onto a 1×1 target.
    #[must_use]
    pub fn for_pick(point: Point) -> Self {
        #[expect(clippy::cast_precision_loss)]
        let pview = [point.x as f32, point.y as f32, 0.5, 0.5];
        Self { pview }
    }

    /// Map a desktop position to normalized device coordinates (Y up).
    ///
    /// Mirrors the vertex shaders; used by tests and CPU-side culling.
    #[must_use]
    pub fn to_ndc(&self, x: f32, y: f32) -> [f32; 2] {
        let [ox, oy, hw, hh] = self.pview;
        [(x - ox) / hw - 1.0, -((y - oy) / hh - 1.0)]
    }
}

#[expect(clippy::cast_precision_loss)]
fn rect_f32(r: Rect) -> [f32; 4] {
    [r.x as f32, r.y as f32, r.w as f32, r.h as f32]
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::WHITE;

    fn assert_close(actual: f32, expected: f32) {
        assert!(
            (actual - expected).abs() < 1e-4,
            "expected {expected}, got {actual}"
        );
    }

    /// Sample position of the pixel center `(px, py)` if the quad covers it.
    fn sample(q: &QuadInstance, px: i32, py: i32) -> Option<[f32; 2]> {
        #[expect(clippy::cast_precision_loss)]
        let (cx, cy) = (px as f32 + 0.5, py as f32 + 0.5);
        let [x, y, w, h] = q.rect;
        if cx < x || cx >= x + w || cy < y || cy >= y + h {
            return None;
        }
        let (fx, fy) = ((cx - x) / w, (cy - y) / h);
        Some([q.uv[0] + fx * q.uv[2], q.uv[1] + fy * q.uv[3]])
    }

    #[test]
    fn covered_pixels_equal_intersection() {
        let rects = [
            Rect::new(0, 0, 20, 20),
            Rect::new(-5, 3, 12, 9),
            Rect::new(7, 7, 1, 1),
            Rect::new(4, -2, 0, 10),
        ];
        let frames = [
            Rect::new(0, 0, 16, 16),
            Rect::new(5, 5, 4, 30),
            Rect::new(-10, -10, 8, 8),
            Rect::new(100, 100, 4, 4),
        ];
        for rect in rects {
            for frame in frames {
                let quad = QuadInstance::new(rect, frame, WHITE);
                let isct = rect.intersect(&frame);
                for py in -12..24 {
                    for px in -12..24 {
                        let covered = sample(&quad, px, py).is_some();
                        assert_eq!(
                            covered,
                            isct.contains(Point::new(px, py)),
                            "rect {rect:?} frame {frame:?} pixel ({px},{py})"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn sampling_matches_cpu_crop() {
        // 40x20 texture drawn at 1:1, clipped to its right half.
        let rect = Rect::new(100, 50, 40, 20);
        let frame = Rect::new(120, 0, 500, 500);
        let quad = QuadInstance::new(rect, frame, WHITE);

        assert_close(quad.uv[0], 0.5);
        assert_close(quad.uv[1], 0.0);
        assert_close(quad.uv[2], 0.5);
        assert_close(quad.uv[3], 1.0);

        // The first covered pixel samples texel column 20 of the source.
        let [u, v] = sample(&quad, 120, 50).unwrap();
        assert_close(u * 40.0, 20.5);
        assert_close(v * 20.0, 0.5);
        assert!(sample(&quad, 119, 50).is_none());
    }

    #[test]
    fn disjoint_frame_is_degenerate() {
        let quad = QuadInstance::new(Rect::new(0, 0, 10, 10), Rect::new(20, 20, 5, 5), WHITE);
        assert!(quad.is_degenerate());
        assert!(quad.uv.iter().all(|c| c.is_finite()));
    }

    #[test]
    fn zero_width_rect_has_no_nan() {
        let quad = QuadInstance::new(Rect::new(0, 0, 0, 10), Rect::new(0, 0, 10, 10), WHITE);
        assert!(quad.is_degenerate());
        assert!(quad.uv.iter().all(|c| c.is_finite()));
    }

    #[test]
    fn view_transform_maps_corners() {
        let u = ViewUniform::for_view(Rect::new(1920, 0, 800, 600));
        assert_eq!(u.to_ndc(1920.0, 0.0), [-1.0, 1.0]);
        assert_eq!(u.to_ndc(2720.0, 600.0), [1.0, -1.0]);
    }

    #[test]
    fn pick_transform_maps_single_pixel() {
        let u = ViewUniform::for_pick(Point::new(10, 10));
        assert_eq!(u.to_ndc(10.0, 10.0), [-1.0, 1.0]);
        assert_eq!(u.to_ndc(11.0, 11.0), [1.0, -1.0]);
    }

    #[test]
    fn instance_sizes_are_gpu_friendly() {
        assert_eq!(std::mem::size_of::<QuadInstance>(), 48);
        assert_eq!(std::mem::size_of::<PickInstance>(), 32);
        assert_eq!(std::mem::size_of::<ViewUniform>(), 16);
    }
}
