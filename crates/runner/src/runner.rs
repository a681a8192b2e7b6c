//! Suite runner: scenarios back to back over one engine

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};
use wsstory_common::Connector;

use crate::config::RunnerConfig;
use crate::engine::{Engine, Failure, RunState, Scenario, ScenarioReport};
use crate::error::{RunnerError, RunnerResult};
use crate::library;
use crate::namespace::Namespace;
use crate::session::Session;
use crate::spec::ScenarioSpec;

/// Token path of the connection fixtures and other defaults
pub const DEFAULTS: &str = "defaults";

/// Result of running a single scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub failure: Option<Failure>,
}

impl From<ScenarioReport> for TestResult {
    fn from(report: ScenarioReport) -> Self {
        Self {
            success: report.state == RunState::Completed,
            error: report.failure.as_ref().map(|f| f.message.clone()),
            name: report.name,
            duration_ms: report.duration_ms,
            failure: report.failure,
        }
    }
}

/// Result of running a suite
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSuiteResult {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub duration_ms: u64,
    pub results: Vec<TestResult>,
}

impl TestSuiteResult {
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

/// Owns the engine and the means to reconnect it
pub struct TestRunner {
    config: RunnerConfig,
    connector: Arc<dyn Connector>,
    engine: Option<Engine>,
}

impl TestRunner {
    /// Runner connecting with the configured transport
    pub fn new(config: RunnerConfig) -> Self {
        let connector = config.connector();
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: RunnerConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            engine: None,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Connect and build the engine on first use
    pub async fn start(&mut self) -> RunnerResult<&mut Engine> {
        if self.engine.is_none() {
            let engine = self.build_engine().await?;
            self.engine = Some(engine);
        }
        self.engine
            .as_mut()
            .ok_or_else(|| RunnerError::Config("engine failed to start".to_string()))
    }

    async fn build_engine(&self) -> RunnerResult<Engine> {
        let mut namespace = Namespace::new();
        library::register(&mut namespace)?;
        namespace.set(DEFAULTS, self.config.defaults_token()?)?;
        namespace.protect(DEFAULTS)?;
        namespace.set(library::RESPONSES, library::canned_responses())?;
        namespace.protect(library::RESPONSES)?;
        namespace.set(library::REQUESTS, library::canned_requests())?;
        namespace.protect(library::REQUESTS)?;

        info!("Connecting to backend");
        let session = Session::connect(self.connector.as_ref(), self.config.session_options()).await?;
        let engine = Engine::new(namespace, session)?;
        engine.check_registry()?;
        Ok(engine)
    }

    /// Namespace of the engine, for registering scenario-specific nodes
    pub async fn namespace_mut(&mut self) -> RunnerResult<&mut Namespace> {
        Ok(self.start().await?.namespace_mut())
    }

    /// Run a list of declarative scenarios
    pub async fn run_specs(&mut self, specs: &[ScenarioSpec]) -> RunnerResult<TestSuiteResult> {
        let scenarios: Vec<Scenario> = specs.iter().map(ScenarioSpec::to_scenario).collect();
        self.run_scenarios(&scenarios).await
    }

    /// Run scenarios carrying `tag`
    pub async fn run_tagged(&mut self, scenarios: &[Scenario], tag: &str) -> RunnerResult<TestSuiteResult> {
        let filtered: Vec<Scenario> = scenarios.iter().filter(|s| s.has_tag(tag)).cloned().collect();
        self.run_scenarios(&filtered).await
    }

    /// Run a specific scenario by name
    pub async fn run_test(&mut self, scenarios: &[Scenario], name: &str) -> RunnerResult<TestResult> {
        let scenario = scenarios
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| RunnerError::SpecParse(format!("Test not found: {}", name)))?;
        self.run_scenario(scenario).await
    }

    /// Run scenarios strictly one after another
    pub async fn run_scenarios(&mut self, scenarios: &[Scenario]) -> RunnerResult<TestSuiteResult> {
        let start = Instant::now();
        let mut results = Vec::with_capacity(scenarios.len());
        let mut passed = 0;
        let mut failed = 0;

        info!("Running {} scenario(s)...", scenarios.len());

        for scenario in scenarios {
            let result = match self.run_scenario(scenario).await {
                Ok(result) => result,
                Err(e) => TestResult {
                    name: scenario.name.clone(),
                    success: false,
                    duration_ms: 0,
                    error: Some(e.to_string()),
                    failure: None,
                },
            };
            if result.success {
                passed += 1;
                info!("✓ {} ({} ms)", result.name, result.duration_ms);
            } else {
                failed += 1;
                error!("✗ {} - {}", result.name, result.error.as_deref().unwrap_or("unknown error"));
            }
            results.push(result);
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        info!("Test Results: {} passed, {} failed ({} ms)", passed, failed, duration_ms);

        Ok(TestSuiteResult {
            total: scenarios.len(),
            passed,
            failed,
            duration_ms,
            results,
        })
    }

    /// Run one scenario, resetting the engine first if a scenario ran before
    pub async fn run_scenario(&mut self, scenario: &Scenario) -> RunnerResult<TestResult> {
        let connector = Arc::clone(&self.connector);
        let engine = self.start().await?;
        if engine.state() != RunState::Idle {
            debug!("Resetting engine before {}", scenario.name);
            engine.reset(connector.as_ref()).await?;
        }
        Ok(engine.run(scenario).await.into())
    }

    /// Close the backend connection
    pub async fn shutdown(&mut self) -> RunnerResult<()> {
        if let Some(mut engine) = self.engine.take() {
            engine.session_mut().close().await?;
        }
        Ok(())
    }
}
