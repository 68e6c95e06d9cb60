//! Renderer settings consumed at construction.
//!
//! Persistence is owned by the application; this crate only reads the values.
//! All fields are optional in serialized form and fall back to
//! [`RendererSettings::default`].

use serde::{Deserialize, Serialize};

/// Largest picture edge accepted when no explicit limit is configured.
pub const DEFAULT_MAX_PICTURE_RES: u32 = 8192;

/// Texture storage mode requested by the user.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Store textures in their native or 32-bit layout.
    #[default]
    None,
    /// Reduce deep layouts to a 16-bit packed layout.
    Squashed,
    /// Let the driver pick a block-compressed internal format.
    Compressed,
}

/// PCI-style identifier of a physical device.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    /// Vendor id.
    pub vendor: u32,
    /// Device id.
    pub device: u32,
}

/// Settings that shape renderer construction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererSettings {
    /// Synchronize presentation with the display refresh.
    pub vsync: bool,
    /// Texture storage mode for newly created textures.
    pub compression: Compression,
    /// Preferred device; `None` picks automatically.
    pub device: Option<DeviceId>,
    /// Pictures larger than this on either side are downscaled.
    pub max_picture_res: u32,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            vsync: true,
            compression: Compression::None,
            device: None,
            max_picture_res: DEFAULT_MAX_PICTURE_RES,
        }
    }
}

impl RendererSettings {
    /// Edge limit for decoded pictures given the device's texture limit.
    #[must_use]
    pub fn picture_limit(&self, max_texture_size: u32) -> u32 {
        self.max_picture_res.min(max_texture_size).max(1)
    }
}
