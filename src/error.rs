//! Error taxonomy shared by every backend.

use crate::types::ViewId;

/// Convenience result type used across the renderer.
pub type Result<T> = std::result::Result<T, RendererError>;

/// Errors surfaced by renderer construction and presentation.
///
/// Per-texture failures are not represented here: texture creation reports
/// them as `None` after logging, so the widget layer can fall back to a
/// placeholder appearance.
#[derive(thiserror::Error, Debug)]
pub enum RendererError {
    /// A native graphics call failed.
    #[error("{call} failed: {detail}")]
    Api {
        /// The native entry point that reported the failure.
        call: &'static str,
        /// Driver-provided error string or code.
        detail: String,
    },

    /// No physical device or adapter satisfies the renderer's requirements.
    #[error("no suitable graphics device found")]
    NoDevice,

    /// A shader failed to compile, validate or link.
    #[error("shader error: {0}")]
    Shader(String),

    /// The view id does not name a view owned by this renderer.
    #[error("unknown view {0:?}")]
    UnknownView(ViewId),

    /// A presentation or frame call arrived in the wrong state.
    #[error("invalid transition: {event} while {state}")]
    InvalidState {
        /// Current state name.
        state: &'static str,
        /// Rejected event name.
        event: &'static str,
    },

    /// A pixel buffer is shorter than its declared geometry.
    #[error("invalid image: {0}")]
    InvalidImage(String),

    /// A presentation surface could not be created or configured.
    #[error("surface error: {0}")]
    Surface(String),
}

impl RendererError {
    /// Build an [`Api`](Self::Api) error and log it with its call site.
    pub fn api(call: &'static str, detail: impl std::fmt::Display) -> Self {
        let detail = detail.to_string();
        tracing::error!(call, code = %detail, "graphics API call failed");
        Self::Api { call, detail }
    }

    /// Build a [`Shader`](Self::Shader) error.
    pub fn shader(msg: impl Into<String>) -> Self {
        Self::Shader(msg.into())
    }

    /// Build an [`InvalidImage`](Self::InvalidImage) error.
    pub fn invalid_image(msg: impl Into<String>) -> Self {
        Self::InvalidImage(msg.into())
    }

    /// Build a [`Surface`](Self::Surface) error.
    pub fn surface(msg: impl Into<String>) -> Self {
        Self::Surface(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_names_call_site() {
        let err = RendererError::api("vkCreateSwapchainKHR", "ERROR_SURFACE_LOST_KHR");
        let text = err.to_string();
        assert!(text.contains("vkCreateSwapchainKHR"));
        assert!(text.contains("ERROR_SURFACE_LOST_KHR"));
    }

    #[test]
    fn display_prefixes_are_stable() {
        assert!(RendererError::shader("x").to_string().starts_with("shader error:"));
        assert!(RendererError::invalid_image("x")
            .to_string()
            .starts_with("invalid image:"));
        assert!(RendererError::surface("x").to_string().starts_with("surface error:"));
    }

    #[test]
    fn invalid_state_mentions_both_sides() {
        let err = RendererError::InvalidState {
            state: "Recording",
            event: "Acquire",
        };
        assert_eq!(err.to_string(), "invalid transition: Acquire while Recording");
    }
}
