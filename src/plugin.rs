//! Server extensions loaded at runtime.
//!
//! A [`Plugin`] typically registers listeners on the server bus from
//! [`Plugin::on_load`] and removes them in [`Plugin::on_unload`]. Plugins are
//! kept in load order; hooks run outside the registry lock so they may load or
//! unload other plugins.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use log::info;
use thiserror::Error;

use crate::server::Server;

/// An extension loaded into a [`Server`].
pub trait Plugin: Send + Sync {
    /// Unique identifier of this plugin.
    fn id(&self) -> &str;

    /// Human-readable name used in logs.
    fn name(&self) -> &str { self.id() }

    /// Called once the plugin is registered.
    fn on_load(&self, _server: &Server) {}

    /// Called once the plugin is removed.
    fn on_unload(&self, _server: &Server) {}
}

/// Errors raised by [`PluginManager`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PluginError {
    /// A plugin with this id is already loaded.
    #[error("{0}: is already loaded")]
    AlreadyLoaded(String),
    /// No plugin with this id is loaded.
    #[error("{0}: is not loaded")]
    NotLoaded(String),
}

/// Registry of loaded plugins.
#[derive(Default)]
pub struct PluginManager {
    plugins: Mutex<Vec<Arc<dyn Plugin>>>,
}

impl PluginManager {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    fn plugins(&self) -> MutexGuard<'_, Vec<Arc<dyn Plugin>>> {
        self.plugins.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `plugin` and run its `on_load` hook.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::AlreadyLoaded`] if the id is taken.
    pub fn load(&self, server: &Server, plugin: Arc<dyn Plugin>) -> Result<(), PluginError> {
        {
            let mut plugins = self.plugins();
            if plugins.iter().any(|p| p.id() == plugin.id()) {
                return Err(PluginError::AlreadyLoaded(plugin.id().to_owned()));
            }
            plugins.push(Arc::clone(&plugin));
        }
        info!("Loading plugin {}", plugin.name());
        plugin.on_load(server);
        Ok(())
    }

    /// Remove the plugin registered under `id` and run its `on_unload` hook.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotLoaded`] if no plugin has that id.
    pub fn unload(&self, server: &Server, id: &str) -> Result<Arc<dyn Plugin>, PluginError> {
        let plugin = {
            let mut plugins = self.plugins();
            let index = plugins
                .iter()
                .position(|p| p.id() == id)
                .ok_or_else(|| PluginError::NotLoaded(id.to_owned()))?;
            plugins.remove(index)
        };
        info!("Unloading plugin {}", plugin.name());
        plugin.on_unload(server);
        Ok(plugin)
    }

    /// Unload every plugin, most recently loaded first.
    pub fn unload_all(&self, server: &Server) {
        let drained: Vec<_> = self.plugins().drain(..).rev().collect();
        for plugin in drained {
            info!("Unloading plugin {}", plugin.name());
            plugin.on_unload(server);
        }
    }

    /// Loaded plugin with the given id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins().iter().find(|p| p.id() == id).cloned()
    }

    /// Whether a plugin with the given id is loaded.
    #[must_use]
    pub fn is_loaded(&self, id: &str) -> bool { self.get(id).is_some() }

    /// Ids of loaded plugins, in load order.
    #[must_use]
    pub fn ids(&self) -> Vec<String> { self.plugins().iter().map(|p| p.id().to_owned()).collect() }

    /// Number of loaded plugins.
    #[must_use]
    pub fn len(&self) -> usize { self.plugins().len() }

    /// Whether no plugin is loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.plugins().is_empty() }
}

impl fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugins", &self.ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use rstest::{fixture, rstest};

    use super::*;
    use crate::{bus::ListenerId, event::EventKind};

    /// Registers a listener while loaded and removes it on unload.
    struct Greeter {
        id: &'static str,
        listener: Mutex<Option<ListenerId>>,
    }

    impl Greeter {
        fn new(id: &'static str) -> Arc<Self> {
            Arc::new(Self {
                id,
                listener: Mutex::new(None),
            })
        }
    }

    impl Plugin for Greeter {
        fn id(&self) -> &str { self.id }

        fn on_load(&self, server: &Server) {
            let id = server.events().on(EventKind::Connected, 0, |_| Ok(()));
            *self.listener.lock().expect("listener lock") = Some(id);
        }

        fn on_unload(&self, server: &Server) {
            if let Some(id) = self.listener.lock().expect("listener lock").take() {
                server.events().remove(id);
            }
        }
    }

    #[fixture]
    fn server() -> Server { Server::new() }

    #[rstest]
    fn load_runs_hook_and_registers(server: Server) {
        server.load_plugin(Greeter::new("greeter")).expect("load");
        assert_eq!(server.plugins().ids(), ["greeter"]);
        assert!(server.plugins().is_loaded("greeter"));
        assert_eq!(server.events().listener_count(EventKind::Connected), 1);
    }

    #[rstest]
    fn duplicate_ids_are_rejected(server: Server) {
        server.load_plugin(Greeter::new("greeter")).expect("load");
        assert_eq!(
            server.load_plugin(Greeter::new("greeter")),
            Err(PluginError::AlreadyLoaded("greeter".into()))
        );
        assert_eq!(server.plugins().len(), 1);
    }

    #[rstest]
    fn unload_runs_hook_and_forgets(server: Server) {
        server.load_plugin(Greeter::new("greeter")).expect("load");
        let plugin = server.unload_plugin("greeter").expect("unload");
        assert_eq!(plugin.id(), "greeter");
        assert!(server.plugins().is_empty());
        assert_eq!(server.events().listener_count(EventKind::Connected), 0);
    }

    #[rstest]
    fn unloading_unknown_plugin_fails(server: Server) {
        let err = server.unload_plugin("missing").map(|_| ()).expect_err("not loaded");
        assert_eq!(err, PluginError::NotLoaded("missing".into()));
        assert_eq!(err.to_string(), "missing: is not loaded");
    }

    #[rstest]
    fn unload_all_empties_registry(server: Server) {
        server.load_plugin(Greeter::new("a")).expect("load a");
        server.load_plugin(Greeter::new("b")).expect("load b");
        assert_eq!(server.plugins().ids(), ["a", "b"]);

        server.plugins().unload_all(&server);
        assert!(server.plugins().is_empty());
        assert_eq!(server.events().listener_count(EventKind::Connected), 0);
    }
}
