//! Coordinates the single in-flight query and the "Loading..." placeholder.
//!
//! Only the most recent dispatch may produce a visible result. A response is
//! accepted when both its event id and its originating controller match the
//! active dispatch; everything else is stale and dropped without noise.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;

use super::collaborators::LauncherUi;
use super::controller::Controller;
use super::ipc::{EventId, QueryEvent, ResponseMessage};

/// Delay before the placeholder is shown for a pending query.
pub const DEFAULT_LOADING_DELAY: Duration = Duration::from_millis(300);

/// What the caller should do with its UI right after dispatching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderAction {
    /// Keep the launcher open while the worker computes.
    KeepOpen,
}

impl PlaceholderAction {
    pub fn keep_app_open(&self) -> bool {
        matches!(self, PlaceholderAction::KeepOpen)
    }
}

struct ActiveDispatch {
    event_id: EventId,
    controller: Weak<Controller>,
}

impl ActiveDispatch {
    fn matches(&self, event_id: EventId, controller: &Rc<Controller>) -> bool {
        self.event_id == event_id && std::ptr::eq(self.controller.as_ptr(), Rc::as_ptr(controller))
    }
}

pub struct DeferredResultRenderer {
    ui: Rc<dyn LauncherUi>,
    loading_delay: Duration,
    active: RefCell<Option<ActiveDispatch>>,
    loading_timer: RefCell<Option<JoinHandle<()>>>,
}

impl DeferredResultRenderer {
    pub fn new(ui: Rc<dyn LauncherUi>) -> Self {
        Self::with_loading_delay(ui, DEFAULT_LOADING_DELAY)
    }

    pub fn with_loading_delay(ui: Rc<dyn LauncherUi>, loading_delay: Duration) -> Self {
        Self {
            ui,
            loading_delay,
            active: RefCell::new(None),
            loading_timer: RefCell::new(None),
        }
    }

    pub fn loading_delay(&self) -> Duration {
        self.loading_delay
    }

    /// Make `event` the active dispatch and arm the placeholder timer.
    pub fn handle_dispatch(&self, event: &QueryEvent, controller: &Rc<Controller>) -> PlaceholderAction {
        self.cancel_loading_timer();

        let ui = Rc::clone(&self.ui);
        let icon = controller.icon().cloned();
        let delay = self.loading_delay;
        let timer = tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            ui.show_placeholder(icon.as_ref());
        });

        *self.loading_timer.borrow_mut() = Some(timer);
        *self.active.borrow_mut() = Some(ActiveDispatch {
            event_id: event.id,
            controller: Rc::downgrade(controller),
        });

        PlaceholderAction::KeepOpen
    }

    /// Run the action of a response to the active dispatch; drop anything else.
    pub fn handle_response(&self, response: &ResponseMessage, controller: &Rc<Controller>) {
        let event_id = response.event.event_id;
        let accepted = {
            let mut active = self.active.borrow_mut();
            match active.as_ref() {
                Some(current) if current.matches(event_id, controller) => {
                    *active = None;
                    true
                }
                _ => false,
            }
        };

        if !accepted {
            tracing::debug!(
                "[{}] discarding stale response to event {}",
                controller.ext_id(),
                event_id
            );
            return;
        }

        self.cancel_loading_timer();
        self.ui.run_action(&response.action);
        if !response.action.keep_app_open() {
            self.ui.hide();
        }
    }

    /// The query text changed: forget the active dispatch.
    pub fn on_query_change(&self) {
        self.cancel_loading_timer();
        self.active.borrow_mut().take();
    }

    pub fn has_active_dispatch(&self) -> bool {
        self.active
            .borrow()
            .as_ref()
            .is_some_and(|active| active.controller.strong_count() > 0)
    }

    pub fn active_event_id(&self) -> Option<EventId> {
        self.active.borrow().as_ref().map(|active| active.event_id)
    }

    fn cancel_loading_timer(&self) {
        if let Some(timer) = self.loading_timer.borrow_mut().take() {
            timer.abort();
        }
    }
}

impl Drop for DeferredResultRenderer {
    fn drop(&mut self) {
        if let Some(timer) = self.loading_timer.get_mut().take() {
            timer.abort();
        }
    }
}
