//! Singleton floating query surface.

use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceEvent {
    Trigger,
    FocusLost,
    Escape,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceAction {
    Created,
    Shown,
    Refocused,
    Dismissed,
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SurfaceError {
    #[error("failed to create surface: {0}")]
    CreateFailed(String),
}

pub trait FloatingSurface {
    fn show(&mut self);
    fn hide(&mut self);
    fn focus(&mut self);
    /// Re-renders content, e.g. the latest results, without recreating the surface.
    fn refresh(&mut self);
}

pub trait SurfaceFactory {
    type Surface: FloatingSurface;

    fn create(&mut self) -> Result<Self::Surface, SurfaceError>;
}

/// Creates the surface on first trigger and reuses it afterwards.
///
/// Dismissal hides the instance; it is never dropped while the coordinator lives.
pub struct WindowCoordinator<F: SurfaceFactory> {
    factory: F,
    surface: Option<F::Surface>,
    visible: bool,
    created: usize,
}

impl<F: SurfaceFactory> WindowCoordinator<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            surface: None,
            visible: false,
            created: 0,
        }
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn created_count(&self) -> usize {
        self.created
    }

    pub fn surface(&self) -> Option<&F::Surface> {
        self.surface.as_ref()
    }

    pub fn handle(&mut self, event: SurfaceEvent) -> Result<SurfaceAction, SurfaceError> {
        match event {
            SurfaceEvent::Trigger => self.on_trigger(),
            SurfaceEvent::FocusLost | SurfaceEvent::Escape => Ok(self.dismiss()),
        }
    }

    /// Consumes events on the calling context until every sender is gone.
    pub async fn run(&mut self, events: &mut mpsc::UnboundedReceiver<SurfaceEvent>) {
        while let Some(event) = events.recv().await {
            match self.handle(event) {
                Ok(action) => tracing::debug!(?event, ?action, "surface event handled"),
                Err(error) => tracing::warn!(?event, %error, "surface event failed"),
            }
        }
    }

    fn on_trigger(&mut self) -> Result<SurfaceAction, SurfaceError> {
        let action = if let Some(surface) = self.surface.as_mut() {
            surface.refresh();
            if self.visible {
                SurfaceAction::Refocused
            } else {
                surface.show();
                SurfaceAction::Shown
            }
        } else {
            let mut surface = self.factory.create()?;
            self.created += 1;
            surface.show();
            self.surface = Some(surface);
            SurfaceAction::Created
        };
        if let Some(surface) = self.surface.as_mut() {
            surface.focus();
        }
        self.visible = true;
        Ok(action)
    }

    fn dismiss(&mut self) -> SurfaceAction {
        match self.surface.as_mut() {
            Some(surface) if self.visible => {
                surface.hide();
                self.visible = false;
                SurfaceAction::Dismissed
            }
            _ => SurfaceAction::Ignored,
        }
    }
}
