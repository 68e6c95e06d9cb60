//! Presentation modes and the per-view frame state machine.
//!
//! The Vulkan backend drives [`PresentState`] explicitly for every view. The
//! GL and wgpu backends let their native APIs own presentation, but share the
//! present-mode choice and the vsync bookkeeping in [`PresentConfig`].

use crate::error::{RendererError, Result};

/// Swap behavior of a presentation target.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PresentMode {
    /// Present immediately; may tear.
    Immediate,
    /// Replace the queued image; no tearing, no blocking.
    Mailbox,
    /// Vsync, but late frames present immediately.
    FifoRelaxed,
    /// Strict vsync queue; always available.
    Fifo,
}

impl PresentMode {
    /// Whether the mode waits for vertical blank.
    #[must_use]
    pub const fn is_synchronized(self) -> bool {
        !matches!(self, Self::Immediate)
    }
}

/// Pick a present mode from those a surface offers.
///
/// Without vsync [`PresentMode::Immediate`] wins when available; otherwise
/// the first available of mailbox, relaxed FIFO and FIFO.
#[must_use]
pub fn choose_present_mode(vsync: bool, available: &[PresentMode]) -> PresentMode {
    if !vsync && available.contains(&PresentMode::Immediate) {
        return PresentMode::Immediate;
    }
    [PresentMode::Mailbox, PresentMode::FifoRelaxed]
        .into_iter()
        .find(|mode| available.contains(mode))
        .unwrap_or(PresentMode::Fifo)
}

/// Vsync setting plus a counter of presentation rebuilds it caused.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PresentConfig {
    vsync: bool,
    generation: u32,
}

impl PresentConfig {
    /// Initial configuration.
    #[must_use]
    pub const fn new(vsync: bool) -> Self {
        Self {
            vsync,
            generation: 0,
        }
    }

    /// Current vsync flag.
    #[must_use]
    pub const fn vsync(&self) -> bool {
        self.vsync
    }

    /// Number of times presentation had to be rebuilt for a vsync change.
    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    /// Record a vsync request; `true` when presentation must be rebuilt.
    pub fn set_vsync(&mut self, vsync: bool) -> bool {
        if self.vsync == vsync {
            return false;
        }
        self.vsync = vsync;
        self.generation = self.generation.wrapping_add(1);
        true
    }
}

/// Stage of a view's frame cycle.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PresentState {
    /// Nothing in progress.
    #[default]
    Idle,
    /// Waiting for a swap image.
    Acquiring,
    /// Recording draw commands into the acquired image.
    Recording,
    /// Commands submitted to the queue.
    Submitted,
    /// Image handed to the presentation engine.
    Presenting,
    /// Rebuilding presentation resources after the target went stale.
    Recreating,
}

/// Input to [`PresentState::advance`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PresentEvent {
    /// Start acquiring an image.
    Acquire,
    /// An image was acquired.
    Acquired,
    /// The target no longer matches the window.
    Stale,
    /// Presentation resources were rebuilt.
    Rebuilt,
    /// Recorded commands were submitted.
    Submit,
    /// The image was queued for presentation.
    Present,
    /// Presentation finished.
    Presented,
}

impl PresentState {
    /// Transition on `event`.
    ///
    /// # Errors
    ///
    /// Returns [`RendererError::InvalidState`] for events the current state
    /// does not accept.
    pub fn advance(self, event: PresentEvent) -> Result<Self> {
        use PresentEvent as E;
        use PresentState as S;
        Ok(match (self, event) {
            (S::Idle, E::Acquire) => S::Acquiring,
            (S::Acquiring, E::Acquired) => S::Recording,
            (S::Idle | S::Acquiring | S::Presenting, E::Stale) => S::Recreating,
            (S::Recreating, E::Rebuilt) => S::Idle,
            (S::Recording, E::Submit) => S::Submitted,
            (S::Submitted, E::Present) => S::Presenting,
            (S::Presenting, E::Presented) => S::Idle,
            (state, event) => {
                return Err(RendererError::InvalidState {
                    state: state.name(),
                    event: event.name(),
                })
            }
        })
    }

    /// In-place variant of [`advance`](Self::advance).
    ///
    /// # Errors
    ///
    /// Same as [`advance`](Self::advance); the state is left unchanged.
    pub fn apply(&mut self, event: PresentEvent) -> Result<()> {
        *self = self.advance(event)?;
        Ok(())
    }

    const fn name(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Acquiring => "Acquiring",
            Self::Recording => "Recording",
            Self::Submitted => "Submitted",
            Self::Presenting => "Presenting",
            Self::Recreating => "Recreating",
        }
    }
}

impl PresentEvent {
    const fn name(self) -> &'static str {
        match self {
            Self::Acquire => "Acquire",
            Self::Acquired => "Acquired",
            Self::Stale => "Stale",
            Self::Rebuilt => "Rebuilt",
            Self::Submit => "Submit",
            Self::Present => "Present",
            Self::Presented => "Presented",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const ALL: [PresentMode; 4] = [
        PresentMode::Immediate,
        PresentMode::Mailbox,
        PresentMode::FifoRelaxed,
        PresentMode::Fifo,
    ];

    #[test]
    fn no_vsync_prefers_immediate() {
        assert_eq!(choose_present_mode(false, &ALL), PresentMode::Immediate);
        assert_eq!(
            choose_present_mode(false, &[PresentMode::Fifo, PresentMode::Mailbox]),
            PresentMode::Mailbox
        );
    }

    #[test]
    fn vsync_never_tears() {
        assert_eq!(choose_present_mode(true, &ALL), PresentMode::Mailbox);
        assert_eq!(
            choose_present_mode(true, &[PresentMode::Immediate, PresentMode::FifoRelaxed]),
            PresentMode::FifoRelaxed
        );
        assert_eq!(choose_present_mode(true, &[]), PresentMode::Fifo);
        for subset in 0..16u8 {
            let available: Vec<_> = ALL
                .iter()
                .enumerate()
                .filter(|(i, _)| subset & (1 << i) != 0)
                .map(|(_, m)| *m)
                .collect();
            assert!(choose_present_mode(true, &available).is_synchronized());
        }
    }

    #[test]
    fn repeated_vsync_is_idempotent() {
        let mut config = PresentConfig::new(false);
        assert!(config.set_vsync(true));
        let after_first = config;
        assert!(!config.set_vsync(true));
        assert_eq!(config, after_first);
        assert_eq!(config.generation(), 1);
        assert_eq!(
            choose_present_mode(config.vsync(), &ALL),
            choose_present_mode(after_first.vsync(), &ALL)
        );
    }

    #[test]
    fn full_frame_cycle() {
        let mut state = PresentState::Idle;
        for event in [
            PresentEvent::Acquire,
            PresentEvent::Acquired,
            PresentEvent::Submit,
            PresentEvent::Present,
            PresentEvent::Presented,
        ] {
            state.apply(event).unwrap();
        }
        assert_eq!(state, PresentState::Idle);
    }

    #[test]
    fn stale_acquire_rebuilds_to_idle() {
        let state = PresentState::Idle
            .advance(PresentEvent::Acquire)
            .and_then(|s| s.advance(PresentEvent::Stale))
            .unwrap();
        assert_eq!(state, PresentState::Recreating);
        assert_eq!(state.advance(PresentEvent::Rebuilt).unwrap(), PresentState::Idle);
    }

    #[test]
    fn stale_present_rebuilds() {
        let state = PresentState::Presenting.advance(PresentEvent::Stale).unwrap();
        assert_eq!(state, PresentState::Recreating);
    }

    #[test]
    fn invalid_transitions_leave_state_untouched() {
        let mut state = PresentState::Recording;
        let err = state.apply(PresentEvent::Acquire).unwrap_err();
        assert!(matches!(
            err,
            RendererError::InvalidState {
                state: "Recording",
                event: "Acquire"
            }
        ));
        assert_eq!(state, PresentState::Recording);
        assert!(PresentState::Recording.advance(PresentEvent::Stale).is_err());
        assert!(PresentState::Submitted.advance(PresentEvent::Acquired).is_err());
    }
}
