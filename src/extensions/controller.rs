//! Host-side session for one connected worker.

use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Map, Value};

use super::debounce::Debouncer;
use super::error::{ExtensionError, ExtensionResult};
use super::ipc::{EventId, MessageChannel, OutboundMessage, QueryEvent, ResponseMessage};
use super::manifest::{ExtensionManifest, IconHandle, MAX_DEBOUNCE_MS};
use super::registry::Registry;
use super::renderer::{DeferredResultRenderer, PlaceholderAction};
use super::ExtensionId;

/// Icon size requested for the loading placeholder.
pub const PLACEHOLDER_ICON_SIZE: u32 = 40;

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

fn next_event_id() -> EventId {
    NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Session configuration accepted on connect.
#[derive(Debug, Clone, Default)]
pub struct ControllerConfig {
    /// Sent to the worker right after the session is accepted.
    pub preferences: Map<String, Value>,
    /// Quiet period before a query reaches the worker.
    pub debounce: Duration,
    /// Shown next to the loading placeholder.
    pub icon: Option<IconHandle>,
}

impl ControllerConfig {
    pub fn from_manifest(
        manifest: &ExtensionManifest,
        extension_dir: &Path,
        overrides: Option<&HashMap<String, Value>>,
    ) -> Self {
        Self {
            preferences: manifest.preferences_with(overrides),
            debounce: Duration::from_millis(manifest.runtime.debounce_ms),
            icon: manifest.load_icon(extension_dir, PLACEHOLDER_ICON_SIZE),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.debounce > Duration::from_millis(MAX_DEBOUNCE_MS) {
            return Err(format!(
                "debounce of {:?} exceeds {} ms",
                self.debounce, MAX_DEBOUNCE_MS
            ));
        }
        if let Some(key) = self.preferences.keys().find(|k| k.is_empty()) {
            return Err(format!("invalid preference key {:?}", key));
        }
        Ok(())
    }
}

/// One connected worker: sends it queries and routes its responses.
pub struct Controller {
    ext_id: ExtensionId,
    config: ControllerConfig,
    channel: MessageChannel,
    debouncer: Debouncer<OutboundMessage>,
    renderer: Rc<DeferredResultRenderer>,
}

impl Controller {
    /// Accept a worker session.
    ///
    /// An invalid configuration refuses the session: the channel is closed and
    /// nothing is registered. Otherwise the controller replaces any previous
    /// registration for `ext_id`, unregisters itself when the channel closes,
    /// and sends the worker its preferences.
    pub fn connect(
        ext_id: impl Into<ExtensionId>,
        config: ControllerConfig,
        channel: MessageChannel,
        registry: &Rc<Registry>,
        renderer: &Rc<DeferredResultRenderer>,
    ) -> ExtensionResult<Rc<Self>> {
        let ext_id = ext_id.into();

        if let Err(message) = config.validate() {
            tracing::warn!("Refusing session for '{}': {}", ext_id, message);
            channel.close();
            return Err(ExtensionError::SessionRefused {
                extension: ext_id,
                message,
            });
        }

        let outbound = channel.clone();
        let debouncer = Debouncer::new(config.debounce, move |message: OutboundMessage| {
            outbound.send(&message);
        });

        let controller = Rc::new(Self {
            ext_id: ext_id.clone(),
            config,
            channel: channel.clone(),
            debouncer,
            renderer: Rc::clone(renderer),
        });

        if registry.register(ext_id.clone(), Rc::clone(&controller)).is_some() {
            tracing::debug!("Extension '{}' reconnected, replacing session", ext_id);
        }

        let weak_registry = Rc::downgrade(registry);
        let weak_controller = Rc::downgrade(&controller);
        channel.set_on_close(move || {
            let Some(controller) = weak_controller.upgrade() else {
                return;
            };
            controller.debouncer.cancel();
            if let Some(registry) = weak_registry.upgrade() {
                if registry.unregister(&controller.ext_id, &controller) {
                    tracing::info!("Extension '{}' disconnected", controller.ext_id);
                }
            }
        });

        let weak_controller = Rc::downgrade(&controller);
        channel.listen(move |message| {
            if let Some(controller) = weak_controller.upgrade() {
                controller.handle_incoming(message);
            }
        });

        channel.send(&OutboundMessage::Preferences {
            preferences: controller.config.preferences.clone(),
        });
        tracing::info!("Extension '{}' connected", controller.ext_id);

        Ok(controller)
    }

    pub fn ext_id(&self) -> &str {
        &self.ext_id
    }

    pub fn icon(&self) -> Option<&IconHandle> {
        self.config.icon.as_ref()
    }

    pub fn preferences(&self) -> &Map<String, Value> {
        &self.config.preferences
    }

    pub fn debounce(&self) -> Duration {
        self.debouncer.interval()
    }

    pub fn channel(&self) -> &MessageChannel {
        &self.channel
    }

    /// Build a query event and hand its message to the debounced sender.
    pub fn dispatch(&self, query: &str, trigger_id: Option<&str>) -> QueryEvent {
        let event = QueryEvent {
            id: next_event_id(),
            query: query.to_string(),
            trigger_id: trigger_id.map(str::to_string),
        };
        tracing::debug!("[{}] dispatching event {}", self.ext_id, event.id);
        self.debouncer.call(event.to_message());
        event
    }

    /// Dispatch a query and make it the renderer's active dispatch.
    pub fn query(self: &Rc<Self>, query: &str, trigger_id: Option<&str>) -> PlaceholderAction {
        let event = self.dispatch(query, trigger_id);
        self.renderer.handle_dispatch(&event, self)
    }

    /// Route one inbound message. Anything but a response is dropped.
    pub fn handle_incoming(self: &Rc<Self>, message: Map<String, Value>) {
        match ResponseMessage::decode(message) {
            Ok(response) => self.renderer.handle_response(&response, self),
            Err(e) => tracing::warn!("[{}] {}", self.ext_id, e),
        }
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("ext_id", &self.ext_id)
            .field("debounce", &self.config.debounce)
            .field("channel", &self.channel)
            .finish()
    }
}
