//! A multi-backend 2D compositing renderer for a widget toolkit.
//!
//! The widget layer talks to one [`Renderer`] trait; three backends implement
//! it against very different GPU programming models:
//!
//! - [`GlRenderer`] (feature `glow`): an immediate pipeline on OpenGL 3.1,
//!   one draw call per rectangle.
//! - [`WgpuRenderer`] (feature `wgpu`): a buffered pipeline that collects
//!   instances during the frame and encodes them in one pass at the end.
//! - [`VulkanRenderer`] (feature `vulkan`): explicit command buffers, fences
//!   and semaphores with two frames in flight per view, plus a compute-based
//!   pixel format converter.
//!
//! # Drawing
//!
//! Every draw is a rectangle clipped to a frame (see [`QuadInstance`]), either
//! flat-colored or textured and tinted. Rectangles are given in
//! virtual-desktop pixels; each [`View`](view::View) maps its display
//! rectangle onto its window.
//!
//! # Picking
//!
//! Hit testing renders [`WidgetId`] tokens instead of colors into a 1×1
//! integer target placed at the query point and reads the token back. Tokens
//! come from an [`IdentityRegistry`], so decoding never reconstructs a raw
//! address.
//!
//! # Textures
//!
//! Source pixels go through [`negotiate`](format::negotiate), which decides
//! per device whether a layout is uploaded as-is, squashed to 16 bits, or
//! converted to RGBA8 on the CPU or GPU.
//!
//! [`GlRenderer`]: gl::GlRenderer
//! [`WgpuRenderer`]: webgpu::WgpuRenderer
//! [`VulkanRenderer`]: vulkan::VulkanRenderer

pub mod arena;
pub mod config;
pub mod convert;
pub mod error;
pub mod format;
pub mod identity;
pub mod present;
pub mod quad;
mod renderer;
pub mod shaders;
mod types;
pub mod upload;
pub mod view;

#[cfg(feature = "glow")]
pub mod gl;
#[cfg(feature = "vulkan")]
pub mod vulkan;
#[cfg(feature = "wgpu")]
pub mod webgpu;

pub use config::{Compression, DeviceId, RendererSettings};
pub use error::{RendererError, Result};
pub use format::{PixelBuffer, PixelLayout};
pub use identity::{IdentityRegistry, WidgetId};
pub use quad::QuadInstance;
pub use renderer::{DeviceEntry, DeviceInfo, FrameStatus, Renderer, Texture};
pub use types::{Color, Point, Rect, ViewId, ViewInfo, WHITE};
pub use view::{NativeWindow, ViewTarget};
