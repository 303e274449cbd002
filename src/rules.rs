//! Rule script hosting
//!
//! Readings are evaluated by a user-supplied script. The engine only ever
//! talks to the [`RuleHost`] trait, so the embedded runtime is swappable
//! and tests can inject a spy. The production host wraps `rhai`.
//!
//! ## Script contract
//!
//! The script must define a four-parameter entrypoint:
//!
//! ```rhai
//! fn accept_reading_v1(ts, node_id, sensor_id, value) {
//!     if value > 100.0 {
//!         trigger_alert(1, `sensor ${sensor_id} is hot`);
//!         dispatch_action("cooler", "on", 1.0);
//!     }
//! }
//! ```
//!
//! Two host callbacks are available to scripts under stable names:
//! `trigger_alert(id, message)` and `dispatch_action(controller_id,
//! action_id, value)`.

use std::path::PathBuf;
use std::sync::Arc;

use rhai::{AST, Dynamic, Engine, Scope};
use tracing::{debug, warn};

use crate::alert::AlertManager;
use crate::services::dispatch::ActionDispatcher;

/// Name of the script entrypoint invoked once per reading
pub const ENTRYPOINT: &str = "accept_reading_v1";

/// A loaded script runtime the rule engine can drive
///
/// Hosts are single-threaded by contract; the rule engine serializes all
/// calls on its worker and guards the host with a mutex for reloads.
pub trait RuleHost: Send {
    /// Parse and verify the script, making it the active one
    fn load(&mut self) -> anyhow::Result<()>;

    /// Re-read and re-verify the script, swapping it in only on success.
    /// On failure the previously loaded script stays active.
    fn reload(&mut self) -> anyhow::Result<()>;

    /// Feed one reading to the script entrypoint
    fn invoke(&mut self, ts: i64, node_id: &str, sensor_id: &str, value: f64)
    -> anyhow::Result<()>;
}

/// Capabilities exposed to scripts through host callbacks
#[derive(Clone)]
pub struct HostBindings {
    pub alerts: Arc<AlertManager>,
    pub dispatcher: Arc<ActionDispatcher>,
}

/// Rule host backed by the rhai interpreter
pub struct RhaiHost {
    path: PathBuf,
    engine: Engine,
    ast: Option<AST>,
    scope: Scope<'static>,
}

impl RhaiHost {
    pub fn new(path: impl Into<PathBuf>, bindings: HostBindings) -> Self {
        let mut engine = Engine::new();

        let alerts = bindings.alerts;
        engine.register_fn("trigger_alert", move |id: i64, message: &str| {
            let message = message.to_string();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let alerts = alerts.clone();
                    handle.spawn(async move {
                        alerts.trigger(id, &message).await;
                    });
                }
                Err(_) => warn!("alert {id} raised outside the runtime, dropped: {message}"),
            }
        });

        let dispatcher = bindings.dispatcher;
        engine.register_fn(
            "dispatch_action",
            move |controller_id: &str, action_id: &str, value: f64| -> bool {
                dispatcher.dispatch(controller_id, action_id, value)
            },
        );

        Self {
            path: path.into(),
            engine,
            ast: None,
            scope: Scope::new(),
        }
    }

    /// Compile the script file and verify the entrypoint is present with
    /// the expected arity
    fn compile_verified(&self) -> anyhow::Result<AST> {
        if !self.path.is_file() {
            anyhow::bail!("rule script is not a file: {}", self.path.display());
        }

        let ast = self
            .engine
            .compile_file(self.path.clone())
            .map_err(|e| anyhow::anyhow!("failed to compile rule script: {e}"))?;

        let has_entrypoint = ast
            .iter_functions()
            .any(|f| f.name == ENTRYPOINT && f.params.len() == 4);
        if !has_entrypoint {
            anyhow::bail!(
                "rule script {} does not define {ENTRYPOINT}(ts, node_id, sensor_id, value)",
                self.path.display()
            );
        }

        Ok(ast)
    }
}

impl RuleHost for RhaiHost {
    fn load(&mut self) -> anyhow::Result<()> {
        let ast = self.compile_verified()?;

        // Run top-level statements once, the way a fresh interpreter would
        let mut scope = Scope::new();
        self.engine
            .run_ast_with_scope(&mut scope, &ast)
            .map_err(|e| anyhow::anyhow!("failed to run rule script: {e}"))?;

        self.scope = scope;
        self.ast = Some(ast);
        debug!("loaded rule script {}", self.path.display());
        Ok(())
    }

    fn reload(&mut self) -> anyhow::Result<()> {
        let ast = self.compile_verified()?;

        let mut scope = Scope::new();
        self.engine
            .run_ast_with_scope(&mut scope, &ast)
            .map_err(|e| anyhow::anyhow!("failed to run rule script: {e}"))?;

        self.scope = scope;
        self.ast = Some(ast);
        debug!("reloaded rule script {}", self.path.display());
        Ok(())
    }

    fn invoke(
        &mut self,
        ts: i64,
        node_id: &str,
        sensor_id: &str,
        value: f64,
    ) -> anyhow::Result<()> {
        let Some(ast) = &self.ast else {
            anyhow::bail!("rule script has not been loaded");
        };

        self.engine
            .call_fn::<Dynamic>(
                &mut self.scope,
                ast,
                ENTRYPOINT,
                (ts, node_id.to_string(), sensor_id.to_string(), value),
            )
            .map_err(|e| anyhow::anyhow!("rule script evaluation failed: {e}"))?;

        Ok(())
    }
}
