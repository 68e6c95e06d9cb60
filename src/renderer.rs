//! The backend-independent renderer contract.

use crate::arena::Key;
use crate::config::{Compression, DeviceId};
use crate::error::Result;
use crate::format::PixelBuffer;
use crate::identity::WidgetId;
use crate::types::{Color, Point, Rect, ViewId, ViewInfo};

/// Handle to a GPU texture owned by a widget.
///
/// Only the pixel size is public. The handle is deliberately not `Clone`:
/// exactly one owner releases it through [`Renderer::free_texture`]. A handle
/// that is dropped instead keeps its GPU image alive until the renderer
/// itself is dropped.
#[derive(Debug, PartialEq, Eq)]
pub struct Texture {
    key: Key,
    width: u32,
    height: u32,
}

impl Texture {
    pub(crate) fn new(key: Key, width: u32, height: u32) -> Self {
        Self { key, width, height }
    }

    pub(crate) fn key(&self) -> Key {
        self.key
    }

    pub(crate) fn set_size(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }

    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// `(width, height)`.
    #[must_use]
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Outcome of [`Renderer::begin_frame`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    /// Draw calls will be recorded.
    Ready,
    /// The target was stale or minimized; draws of this frame are dropped.
    Skipped,
}

/// A selectable physical device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceEntry {
    /// Vendor and device id, used for [`RendererSettings::device`](crate::RendererSettings::device).
    pub id: DeviceId,
    /// Human-readable name.
    pub name: String,
}

/// Device facts for a settings screen.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Devices the user may choose from.
    pub devices: Vec<DeviceEntry>,
    /// Largest supported texture edge.
    pub max_texture_size: u32,
    /// Compression modes this device can honor.
    pub compressions: Vec<Compression>,
    /// Mode applied to new textures.
    pub current: Compression,
}

/// Operations the widget layer drives, identical for every backend.
///
/// All calls come from one thread. Frame and pick cycles are strictly
/// bracketed: `begin_frame`, any number of `draw_rect`, `end_frame`; and
/// `begin_pick`, any number of `draw_sel_rect`, `end_pick`. Draw calls outside
/// their bracket are ignored.
pub trait Renderer {
    /// Views in creation order.
    fn views(&self) -> Vec<ViewInfo>;

    /// Background color used from the next frame on.
    fn set_clear_color(&mut self, color: Color);

    /// Switch vsync, rebuilding presentation if it changes.
    ///
    /// # Errors
    ///
    /// Returns an error if presentation cannot be rebuilt.
    fn set_vsync(&mut self, vsync: bool) -> Result<()>;

    /// Storage mode for textures created from now on.
    fn set_compression(&mut self, compression: Compression);

    /// Refresh a view's rectangle after a resize or display change.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown views or when presentation cannot be
    /// rebuilt.
    fn update_view(&mut self, id: ViewId, rect: Option<Rect>) -> Result<()>;

    /// Start drawing a frame into `id`.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown views or unrecoverable device failures.
    fn begin_frame(&mut self, id: ViewId) -> Result<FrameStatus>;

    /// Composite `rect` clipped to `frame`; untextured when `texture` is
    /// `None`, otherwise `color` tints the sampled texels.
    fn draw_rect(&mut self, texture: Option<&Texture>, rect: Rect, frame: Rect, color: Color);

    /// Finish and present the frame started on `id`.
    ///
    /// # Errors
    ///
    /// Returns an error when no frame is active on `id` or submission fails.
    fn end_frame(&mut self, id: ViewId) -> Result<()>;

    /// Start a pick pass for the pixel at `point` in `id`.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown views.
    fn begin_pick(&mut self, id: ViewId, point: Point) -> Result<()>;

    /// Add a widget's rectangle to the pick pass.
    fn draw_sel_rect(&mut self, widget: WidgetId, rect: Rect, frame: Rect);

    /// Finish the pick pass, blocking until the GPU result is read back.
    ///
    /// # Errors
    ///
    /// Returns an error when no pick is active on `id` or readback fails.
    fn end_pick(&mut self, id: ViewId) -> Result<Option<WidgetId>>;

    /// Upload an image; `None` if it exceeds the device limit or allocation
    /// fails.
    fn texture_from_image(&mut self, image: &PixelBuffer<'_>) -> Option<Texture>;

    /// Upload a decoded picture, downscaling it to the configured limit.
    fn texture_from_picture(&mut self, image: &PixelBuffer<'_>) -> Option<Texture>;

    /// Upload rendered text; gray coverage becomes white texels with alpha.
    fn texture_from_text(&mut self, image: &PixelBuffer<'_>) -> Option<Texture>;

    /// Replace a texture's contents, keeping the handle; `false` on failure,
    /// in which case the old contents stay.
    fn replace_texture(&mut self, texture: &mut Texture, image: &PixelBuffer<'_>) -> bool;

    /// Release a texture once no in-flight frame can reference it.
    fn free_texture(&mut self, texture: Texture);

    /// Block until every submitted texture upload has completed.
    fn synch_transfers(&mut self);

    /// Device list, texture limit and compression modes.
    fn device_info(&self) -> DeviceInfo;
}
