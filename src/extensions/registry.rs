//! Worker id to live controller.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use super::controller::Controller;
use super::ExtensionId;

#[derive(Default)]
pub struct Registry {
    controllers: RefCell<HashMap<ExtensionId, Rc<Controller>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, ext_id: &str) -> Option<Rc<Controller>> {
        self.controllers.borrow().get(ext_id).cloned()
    }

    /// Register `controller`, returning the one it replaced.
    pub fn register(&self, ext_id: ExtensionId, controller: Rc<Controller>) -> Option<Rc<Controller>> {
        self.controllers.borrow_mut().insert(ext_id, controller)
    }

    /// Remove the registration for `ext_id` only if it is `controller`.
    pub fn unregister(&self, ext_id: &str, controller: &Rc<Controller>) -> bool {
        let removed = {
            let mut controllers = self.controllers.borrow_mut();
            match controllers.get(ext_id) {
                Some(current) if Rc::ptr_eq(current, controller) => controllers.remove(ext_id),
                _ => None,
            }
        };
        // Dropped outside the borrow: the last reference may run drop glue.
        removed.is_some()
    }

    pub fn contains(&self, ext_id: &str) -> bool {
        self.controllers.borrow().contains_key(ext_id)
    }

    pub fn ids(&self) -> Vec<ExtensionId> {
        let mut ids: Vec<_> = self.controllers.borrow().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.controllers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.borrow().is_empty()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("ids", &self.ids()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::testing::{connect_fake, renderer_with, RecordingUi};
    use std::time::Duration;
    use tokio::task::LocalSet;

    #[tokio::test]
    async fn test_stale_unregister_is_noop() {
        LocalSet::new()
            .run_until(async {
                let (_ui, renderer) = renderer_with(RecordingUi::default());
                let registry = Rc::new(Registry::new());
                let scratch = Rc::new(Registry::new());

                let (old, _p1) = connect_fake("demo", Duration::ZERO, &scratch, &renderer).await;
                let (new, _p2) = connect_fake("other", Duration::ZERO, &scratch, &renderer).await;

                assert!(registry.register("demo".into(), Rc::clone(&old)).is_none());
                let replaced = registry.register("demo".into(), Rc::clone(&new));
                assert!(Rc::ptr_eq(&replaced.unwrap(), &old));

                assert!(!registry.unregister("demo", &old));
                assert!(registry.contains("demo"));
                assert!(registry.unregister("demo", &new));
                assert!(registry.is_empty());
            })
            .await;
    }

    #[tokio::test]
    async fn test_ids_are_sorted() {
        LocalSet::new()
            .run_until(async {
                let (_ui, renderer) = renderer_with(RecordingUi::default());
                let registry = Rc::new(Registry::new());
                let mut peers = Vec::new();
                for id in ["zeta", "alpha", "mid"] {
                    peers.push(connect_fake(id, Duration::ZERO, &registry, &renderer).await);
                }
                assert_eq!(registry.len(), 3);
                assert_eq!(registry.ids(), vec!["alpha", "mid", "zeta"]);
            })
            .await;
    }
}
