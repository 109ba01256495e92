//! Routing commands across a syntax worker and a semantic worker.
//!
//! Each worker keeps its own engine, sequencer and flow control. The router
//! only decides which worker(s) see a command.

use std::collections::HashSet;
use std::sync::Arc;

use crate::client::CommandExecutor;
use crate::engine::SubmitOptions;
use crate::outcome::Outcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Handled by the syntax worker alone.
    Syntax,
    /// State updates both workers need. The syntax worker gets a copy
    /// without a reply; the caller sees the semantic worker's outcome.
    Shared,
    Semantic,
}

#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    syntax: HashSet<String>,
    shared: HashSet<String>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_syntax<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.syntax.extend(commands.into_iter().map(Into::into));
        self
    }

    pub fn with_shared<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.shared.extend(commands.into_iter().map(Into::into));
        self
    }

    /// Shared wins when a command is listed in both sets.
    pub fn route(&self, command: &str) -> Route {
        if self.shared.contains(command) {
            Route::Shared
        } else if self.syntax.contains(command) {
            Route::Syntax
        } else {
            Route::Semantic
        }
    }
}

pub struct RoutedClient {
    syntax: Arc<dyn CommandExecutor>,
    semantic: Arc<dyn CommandExecutor>,
    routes: RouteTable,
}

impl RoutedClient {
    pub fn new(
        syntax: Arc<dyn CommandExecutor>,
        semantic: Arc<dyn CommandExecutor>,
        routes: RouteTable,
    ) -> Self {
        Self {
            syntax,
            semantic,
            routes,
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }
}

impl CommandExecutor for RoutedClient {
    fn submit(&self, name: &str, arguments: serde_json::Value, options: SubmitOptions) -> Outcome {
        match self.routes.route(name) {
            Route::Syntax => self.syntax.submit(name, arguments, options),
            Route::Semantic => self.semantic.submit(name, arguments, options),
            Route::Shared => {
                let copy = SubmitOptions {
                    kind: options.kind,
                    ..SubmitOptions::no_reply()
                };
                // Resolves immediately; nothing to wait on.
                let _ = self.syntax.submit(name, arguments.clone(), copy);
                tracing::trace!(command = %name, "Mirrored shared command to syntax worker");
                self.semantic.submit(name, arguments, options)
            }
        }
    }
}

impl std::fmt::Debug for RoutedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutedClient")
            .field("routes", &self.routes)
            .finish_non_exhaustive()
    }
}
