//! Views: one render target per window or display.

use std::sync::Arc;

use crate::error::{RendererError, Result};
use crate::types::{Rect, ViewId, ViewInfo};

/// What the renderer needs from a native window regardless of backend.
pub trait NativeWindow {
    /// Identifier the windowing layer uses in its events.
    fn window_id(&self) -> u64;

    /// Current drawable size in physical pixels.
    fn drawable_size(&self) -> (u32, u32);
}

impl<T: NativeWindow + ?Sized> NativeWindow for Arc<T> {
    fn window_id(&self) -> u64 {
        (**self).window_id()
    }

    fn drawable_size(&self) -> (u32, u32) {
        (**self).drawable_size()
    }
}

impl<T: NativeWindow + ?Sized> NativeWindow for &T {
    fn window_id(&self) -> u64 {
        (**self).window_id()
    }

    fn drawable_size(&self) -> (u32, u32) {
        (**self).drawable_size()
    }
}

/// One entry of the window list handed over at construction.
#[derive(Clone, Debug)]
pub struct ViewTarget<W> {
    /// Id of the view to create.
    pub id: ViewId,
    /// Native window the view presents to.
    pub window: W,
    /// Display rectangle; for [`ViewId::Single`] only the size matters and
    /// the live window size is used instead.
    pub rect: Rect,
}

impl<W: NativeWindow> ViewTarget<W> {
    /// A windowed single-view target sized from the live window.
    pub fn single(window: W) -> Self {
        let (w, h) = window.drawable_size();
        Self {
            id: ViewId::Single,
            window,
            rect: Rect::from_size(w, h),
        }
    }
}

/// A live view: window, display rectangle and backend presentation state.
pub struct View<W, P> {
    /// View id.
    pub id: ViewId,
    /// Native window.
    pub window: W,
    /// Display rectangle in virtual-desktop pixels.
    pub rect: Rect,
    /// Backend-owned presentation resources.
    pub present: P,
}

impl<W: NativeWindow, P> View<W, P> {
    /// Public description of the view.
    pub fn info(&self) -> ViewInfo {
        ViewInfo {
            id: self.id,
            window_id: self.window.window_id(),
            rect: self.rect,
        }
    }

    /// Rectangle after a resize.
    ///
    /// The single view follows the live window size; display views take the
    /// arrangement supplied by the caller and keep their rectangle otherwise.
    pub fn resized_rect(&self, arranged: Option<Rect>) -> Rect {
        match (self.id, arranged) {
            (ViewId::Single, _) => {
                let (w, h) = self.window.drawable_size();
                Rect::from_size(w, h)
            }
            (ViewId::Display(_), Some(rect)) => rect,
            (ViewId::Display(_), None) => self.rect,
        }
    }
}

/// Build one view per target, releasing every view already built if one fails.
///
/// `create` builds the presentation state for a window, `release` tears one
/// down. On failure the views created so far are released in reverse order
/// and the error is returned, so no partial set survives.
///
/// # Errors
///
/// Returns the first error from `create`, or
/// [`RendererError::surface`] when `targets` is empty.
pub fn build_views<W, P>(
    targets: Vec<ViewTarget<W>>,
    mut create: impl FnMut(&W, Rect) -> Result<P>,
    mut release: impl FnMut(View<W, P>),
) -> Result<Vec<View<W, P>>> {
    if targets.is_empty() {
        return Err(RendererError::surface("no windows to create views for"));
    }
    let mut views: Vec<View<W, P>> = Vec::with_capacity(targets.len());
    for target in targets {
        match create(&target.window, target.rect) {
            Ok(present) => views.push(View {
                id: target.id,
                window: target.window,
                rect: target.rect,
                present,
            }),
            Err(err) => {
                tracing::warn!(view = ?target.id, %err, "view creation failed, releasing {} views", views.len());
                while let Some(view) = views.pop() {
                    release(view);
                }
                return Err(err);
            }
        }
    }
    Ok(views)
}

/// Index of the view with `id`.
///
/// # Errors
///
/// Returns [`RendererError::UnknownView`] when no view has that id.
pub fn find_view<W, P>(views: &[View<W, P>], id: ViewId) -> Result<usize> {
    views
        .iter()
        .position(|v| v.id == id)
        .ok_or(RendererError::UnknownView(id))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    struct FakeWindow {
        id: u64,
        size: (u32, u32),
    }

    impl NativeWindow for FakeWindow {
        fn window_id(&self) -> u64 {
            self.id
        }

        fn drawable_size(&self) -> (u32, u32) {
            self.size
        }
    }

    /// Counts live presentation resources.
    #[derive(Default)]
    struct Ledger {
        live: RefCell<Vec<u64>>,
        created: RefCell<usize>,
    }

    fn targets(n: u32) -> Vec<ViewTarget<FakeWindow>> {
        (0..n)
            .map(|i| ViewTarget {
                id: ViewId::Display(i),
                window: FakeWindow {
                    id: u64::from(i) + 100,
                    size: (640, 480),
                },
                rect: Rect::new(i32::try_from(i).unwrap() * 640, 0, 640, 480),
            })
            .collect()
    }

    fn build_with_failure(ledger: &Ledger, n: u32, fail_at: Option<usize>) -> Result<Vec<View<FakeWindow, u64>>> {
        build_views(
            targets(n),
            |window, _| {
                let mut created = ledger.created.borrow_mut();
                if Some(*created) == fail_at {
                    return Err(RendererError::api("create_swapchain", "ERROR_OUT_OF_DEVICE_MEMORY"));
                }
                *created += 1;
                ledger.live.borrow_mut().push(window.id);
                Ok(window.id)
            },
            |view| ledger.live.borrow_mut().retain(|&id| id != view.present),
        )
    }

    #[test]
    fn all_views_built_in_order() {
        let ledger = Ledger::default();
        let views = build_with_failure(&ledger, 3, None).unwrap();
        assert_eq!(views.len(), 3);
        assert_eq!(views[2].info().window_id, 102);
        assert_eq!(*ledger.live.borrow(), vec![100, 101, 102]);
    }

    #[test]
    fn failure_releases_every_earlier_view() {
        for fail_at in 0..4 {
            let ledger = Ledger::default();
            let result = build_with_failure(&ledger, 4, Some(fail_at));
            assert!(result.is_err());
            assert_eq!(*ledger.created.borrow(), fail_at);
            assert!(ledger.live.borrow().is_empty(), "leak when view {fail_at} fails");
        }
    }

    #[test]
    fn empty_window_list_is_an_error() {
        let ledger = Ledger::default();
        assert!(build_with_failure(&ledger, 0, None).is_err());
    }

    #[test]
    fn single_view_follows_window_size() {
        let target = ViewTarget::single(FakeWindow { id: 1, size: (800, 600) });
        assert_eq!(target.rect, Rect::new(0, 0, 800, 600));

        let mut view = View {
            id: target.id,
            window: target.window,
            rect: target.rect,
            present: (),
        };
        view.window.size = (1024, 768);
        assert_eq!(view.resized_rect(Some(Rect::new(5, 5, 5, 5))), Rect::new(0, 0, 1024, 768));
    }

    #[test]
    fn display_view_uses_arrangement() {
        let mut views = build_with_failure(&Ledger::default(), 2, None).unwrap();
        let idx = find_view(&views, ViewId::Display(1)).unwrap();
        assert_eq!(views[idx].resized_rect(None), Rect::new(640, 0, 640, 480));
        views[idx].rect = views[idx].resized_rect(Some(Rect::new(0, 480, 1280, 720)));
        assert_eq!(views[idx].info().rect, Rect::new(0, 480, 1280, 720));
        assert!(matches!(
            find_view(&views, ViewId::Single),
            Err(RendererError::UnknownView(ViewId::Single))
        ));
    }
}
