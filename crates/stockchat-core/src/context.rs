use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{Context, Result};
use stockchat_agent::{Agent, build_agents};
use stockchat_common::ServiceConfig;
use stockchat_db::create_engine;
use stockchat_providers::ProviderRegistry;
use tracing::warn;

use crate::tracker::ActivityTracker;

/// Process-wide shared state: configuration, both agents and the activity
/// tracker. Owned by the composition root and passed by reference to the
/// pipeline and the scheduled jobs; there are no hidden globals.
///
/// Each agent lives behind its own swappable slot. Readers clone the inner
/// `Arc`, so rotation replaces a whole agent without disturbing requests
/// already holding the previous instance.
pub struct AppContext {
    config: ServiceConfig,
    sql_agent: RwLock<Arc<Agent>>,
    nlp_agent: RwLock<Arc<Agent>>,
    activity: ActivityTracker,
}

impl AppContext {
    pub fn new(config: ServiceConfig, sql_agent: Agent, nlp_agent: Agent) -> Self {
        Self {
            config,
            sql_agent: RwLock::new(Arc::new(sql_agent)),
            nlp_agent: RwLock::new(Arc::new(nlp_agent)),
            activity: ActivityTracker::new(),
        }
    }

    /// Build the full runtime state from configuration. Any failure here is
    /// fatal: the process must not accept traffic without a live engine and
    /// a constructed agent pair.
    pub fn initialize(config: ServiceConfig) -> Result<Self> {
        let engine =
            create_engine(&config.database_dsn).context("cannot initialize database engine")?;
        engine
            .ping()
            .context("database engine failed its liveness probe")?;

        let registry = ProviderRegistry::with_defaults();
        let (sql_agent, nlp_agent) =
            build_agents(&config, &registry, engine).context("cannot initialize AI agents")?;
        Ok(Self::new(config, sql_agent, nlp_agent))
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn activity(&self) -> &ActivityTracker {
        &self.activity
    }

    pub fn sql_agent(&self) -> Arc<Agent> {
        Arc::clone(
            &self
                .sql_agent
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    pub fn nlp_agent(&self) -> Arc<Agent> {
        Arc::clone(
            &self
                .nlp_agent
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Swap in a freshly built agent pair. Both slots are replaced before
    /// returning so no caller can observe a mixed generation for long, and
    /// never a half-updated agent.
    pub fn replace_agents(&self, sql_agent: Agent, nlp_agent: Agent) {
        *self
            .sql_agent
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(sql_agent);
        *self
            .nlp_agent
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(nlp_agent);
    }

    /// Drop every session's memory in both agents. Used at shutdown.
    pub fn clear_all_memory(&self) {
        self.sql_agent().memory().clear_all_sessions();
        self.nlp_agent().memory().clear_all_sessions();
        if !self.activity.is_empty() {
            warn!(
                "{} tracked sessions discarded with their memory",
                self.activity.len()
            );
        }
    }
}
