//! Named applications: task sets a worker can be started for.
//!
//! A worker process needs to rebuild the same registry the submitting side
//! uses. Applications are registered under a name in an `AppRegistry`, and
//! `disq worker <app>` (as well as every child of a process pool) builds its
//! task manager from that name.

pub mod arith;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::config::TaskOptions;
use crate::error::ConfigError;
use crate::manager::TaskManager;

/// Registers an application's tasks on a manager.
pub type AppSetup = Arc<dyn Fn(&mut TaskManager) -> Result<(), ConfigError> + Send + Sync>;

/// One named application.
#[derive(Clone)]
pub struct App {
    name: String,
    options: TaskOptions,
    setup: AppSetup,
}

impl App {
    pub fn new<F>(name: impl Into<String>, setup: F) -> Self
    where
        F: Fn(&mut TaskManager) -> Result<(), ConfigError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            options: TaskOptions::default(),
            setup: Arc::new(setup),
        }
    }

    /// Sets manager-level options the application is built with.
    pub fn with_options(mut self, options: TaskOptions) -> Self {
        self.options = options;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &TaskOptions {
        &self.options
    }

    /// Registers the application's tasks on `manager`.
    pub fn install(&self, manager: &mut TaskManager) -> Result<(), ConfigError> {
        (self.setup)(manager)
    }
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Applications known to this binary.
#[derive(Debug, Clone, Default)]
pub struct AppRegistry {
    apps: BTreeMap<String, App>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in applications.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(arith::app());
        registry
    }

    /// Adds an application, replacing one of the same name.
    pub fn register(&mut self, app: App) -> &mut Self {
        self.apps.insert(app.name.clone(), app);
        self
    }

    pub fn get(&self, name: &str) -> Result<&App, ConfigError> {
        self.apps
            .get(name)
            .ok_or_else(|| ConfigError::UnknownApp(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.apps.keys().map(String::as_str).collect()
    }
}
