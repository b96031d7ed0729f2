use std::sync::Arc;

use parking_lot::Mutex;
use searchy_core::hotkey_runtime::{HotkeyDispatcher, MockHotkeyRegistrar};
use searchy_core::window::{
    FloatingSurface, SurfaceError, SurfaceEvent, SurfaceFactory, WindowCoordinator,
};
use tokio::sync::mpsc;

#[derive(Clone, Default)]
struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

struct QuerySurface {
    id: usize,
    journal: Journal,
}

impl FloatingSurface for QuerySurface {
    fn show(&mut self) {
        self.journal.push(format!("show {}", self.id));
    }

    fn hide(&mut self) {
        self.journal.push(format!("hide {}", self.id));
    }

    fn focus(&mut self) {
        self.journal.push(format!("focus {}", self.id));
    }

    fn refresh(&mut self) {
        self.journal.push(format!("refresh {}", self.id));
    }
}

struct QuerySurfaces {
    next_id: usize,
    journal: Journal,
}

impl SurfaceFactory for QuerySurfaces {
    type Surface = QuerySurface;

    fn create(&mut self) -> Result<QuerySurface, SurfaceError> {
        self.next_id += 1;
        self.journal.push(format!("create {}", self.next_id));
        Ok(QuerySurface {
            id: self.next_id,
            journal: self.journal.clone(),
        })
    }
}

#[tokio::test]
async fn hotkey_presses_drive_a_single_reused_surface() {
    let journal = Journal::default();
    let (events, mut rx) = mpsc::unbounded_channel();
    let dispatcher = HotkeyDispatcher::register(
        "Ctrl+Shift+Space",
        Box::new(MockHotkeyRegistrar::default()),
        events.clone(),
    )
    .unwrap();

    dispatcher.trigger();
    dispatcher.trigger();
    events.send(SurfaceEvent::FocusLost).unwrap();
    dispatcher.trigger();
    events.send(SurfaceEvent::Escape).unwrap();
    drop(events);
    drop(dispatcher);

    let mut windows = WindowCoordinator::new(QuerySurfaces {
        next_id: 0,
        journal: journal.clone(),
    });
    windows.run(&mut rx).await;

    assert_eq!(windows.created_count(), 1);
    assert!(!windows.is_visible());
    assert_eq!(
        journal.entries(),
        vec![
            "create 1", "show 1", "focus 1", "refresh 1", "focus 1", "hide 1", "refresh 1",
            "show 1", "focus 1", "hide 1",
        ]
    );
}
