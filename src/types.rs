//! Plain geometry and identifier types shared by the renderer contract.

use serde::{Deserialize, Serialize};

/// Linear RGBA color with components in `[0, 1]`.
pub type Color = [f32; 4];

/// Opaque white, the neutral multiplier for textured draws.
pub const WHITE: Color = [1.0, 1.0, 1.0, 1.0];

/// A point in virtual-desktop pixels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    /// Horizontal coordinate.
    pub x: i32,
    /// Vertical coordinate, growing downwards.
    pub y: i32,
}

impl Point {
    /// Construct a point.
    #[must_use]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// An axis-aligned rectangle in virtual-desktop pixels.
///
/// Sizes are never negative for rectangles produced by [`Rect::intersect`];
/// callers may still pass negative sizes, which behave as empty.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    /// Left edge.
    pub x: i32,
    /// Top edge.
    pub y: i32,
    /// Width.
    pub w: i32,
    /// Height.
    pub h: i32,
}

impl Rect {
    /// Construct a rectangle.
    #[must_use]
    pub const fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }

    /// A rectangle at the origin with the given size.
    #[must_use]
    pub fn from_size(w: u32, h: u32) -> Self {
        Self::new(
            0,
            0,
            i32::try_from(w).unwrap_or(i32::MAX),
            i32::try_from(h).unwrap_or(i32::MAX),
        )
    }

    /// Exclusive right edge.
    #[must_use]
    pub const fn end_x(&self) -> i32 {
        self.x.saturating_add(self.w)
    }

    /// Exclusive bottom edge.
    #[must_use]
    pub const fn end_y(&self) -> i32 {
        self.y.saturating_add(self.h)
    }

    /// Top-left corner.
    #[must_use]
    pub const fn pos(&self) -> Point {
        Point::new(self.x, self.y)
    }

    /// Whether the rectangle covers no pixels.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.w <= 0 || self.h <= 0
    }

    /// Whether `p` lies inside the rectangle (right and bottom edges excluded).
    #[must_use]
    pub const fn contains(&self, p: Point) -> bool {
        p.x >= self.x && p.x < self.end_x() && p.y >= self.y && p.y < self.end_y()
    }

    /// Geometric intersection.
    ///
    /// Disjoint rectangles produce a zero-sized rectangle positioned at the
    /// clamped corner, never a negative size.
    #[must_use]
    pub fn intersect(&self, other: &Rect) -> Rect {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let w = (self.end_x().min(other.end_x()) - x).max(0);
        let h = (self.end_y().min(other.end_y()) - y).max(0);
        Rect { x, y, w, h }
    }

    /// Width and height as unsigned values, clamping negatives to zero.
    #[must_use]
    pub fn size(&self) -> (u32, u32) {
        (
            u32::try_from(self.w).unwrap_or(0),
            u32::try_from(self.h).unwrap_or(0),
        )
    }
}

/// Identifies a view.
///
/// A single-window configuration has exactly one view with id
/// [`ViewId::Single`]; multi-display configurations use one
/// [`ViewId::Display`] per physical display.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViewId {
    /// The only view of a windowed configuration.
    Single,
    /// The view covering the display with this index.
    Display(u32),
}

/// Public description of a view, used for routing window events.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ViewInfo {
    /// View identifier.
    pub id: ViewId,
    /// Windowing-layer id of the view's native window.
    pub window_id: u64,
    /// Display rectangle in virtual-desktop pixels.
    pub rect: Rect,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intersect_overlapping() {
        let a = Rect::new(0, 0, 100, 50);
        let b = Rect::new(40, 20, 100, 100);
        assert_eq!(a.intersect(&b), Rect::new(40, 20, 60, 30));
        assert_eq!(b.intersect(&a), Rect::new(40, 20, 60, 30));
    }

    #[test]
    fn intersect_disjoint_is_empty_not_negative() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(50, -30, 10, 10);
        let isct = a.intersect(&b);
        assert!(isct.is_empty());
        assert_eq!((isct.w, isct.h), (0, 0));
    }

    #[test]
    fn intersect_contained() {
        let outer = Rect::new(-100, -100, 1000, 1000);
        let inner = Rect::new(5, 6, 7, 8);
        assert_eq!(outer.intersect(&inner), inner);
    }

    #[test]
    fn contains_excludes_far_edges() {
        let r = Rect::new(10, 10, 5, 5);
        assert!(r.contains(Point::new(10, 10)));
        assert!(r.contains(Point::new(14, 14)));
        assert!(!r.contains(Point::new(15, 10)));
        assert!(!r.contains(Point::new(10, 15)));
    }

    #[test]
    fn size_clamps_negative() {
        assert_eq!(Rect::new(0, 0, -4, 3).size(), (0, 3));
        assert_eq!(Rect::from_size(800, 600), Rect::new(0, 0, 800, 600));
    }
}
