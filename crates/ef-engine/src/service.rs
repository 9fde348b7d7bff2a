//! Request surface: validates synchronously, then streams a spawned run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use ef_optimizer::{select_strategy, DefaultStrategyFactory, StrategyFactory};
use ef_types::{EfResult, EventPayload, RequestError, StrategyKind};

use crate::cache::ModelCache;
use crate::catalog::ConfigurationCatalog;
use crate::channel::{self, ProgressChannel, ProgressPublisher, RunOutcome};
use crate::config::EngineConfig;
use crate::gateway::{EvaluatorGateway, SyntheticGateway};
use crate::pipeline::{Pipeline, UnitError};
use crate::sweep::ScanRange;
use crate::{comparison, sweep};

/// Everything a run needs. Shared by all requests; only the cache is mutable.
pub struct EngineContext {
    pub config: EngineConfig,
    pub catalog: ConfigurationCatalog,
    pub cache: ModelCache,
    pub gateway: Arc<dyn EvaluatorGateway>,
    pub strategies: Arc<dyn StrategyFactory>,
}

impl EngineContext {
    pub fn new(config: EngineConfig, gateway: Arc<dyn EvaluatorGateway>) -> Self {
        Self {
            config,
            catalog: ConfigurationCatalog::default(),
            cache: ModelCache::new(),
            gateway,
            strategies: Arc::new(DefaultStrategyFactory::default()),
        }
    }

    pub fn with_catalog(mut self, catalog: ConfigurationCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_strategies(mut self, strategies: Arc<dyn StrategyFactory>) -> Self {
        self.strategies = strategies;
        self
    }
}

/// Parameters shared by all three request kinds. Unused fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub configuration_id: String,
    #[serde(default)]
    pub iteration_budget: Option<usize>,
    #[serde(default)]
    pub strategies: Option<BTreeSet<StrategyKind>>,
    #[serde(default)]
    pub range: Option<ScanRange>,
}

impl RunRequest {
    pub fn new(configuration_id: impl Into<String>) -> Self {
        Self {
            configuration_id: configuration_id.into(),
            ..Self::default()
        }
    }

    pub fn with_budget(mut self, budget: usize) -> Self {
        self.iteration_budget = Some(budget);
        self
    }

    pub fn with_strategies(mut self, strategies: impl IntoIterator<Item = StrategyKind>) -> Self {
        self.strategies = Some(strategies.into_iter().collect());
        self
    }

    pub fn with_range(mut self, range: ScanRange) -> Self {
        self.range = Some(range);
        self
    }
}

/// Wire envelope: `{"mode": "run" | "compare" | "sweep", ...RunRequest}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum EngineRequest {
    Run(RunRequest),
    Compare(RunRequest),
    Sweep(RunRequest),
}

/// Entry point for pipelines, comparisons and sweeps.
#[derive(Clone)]
pub struct EngineService {
    ctx: Arc<EngineContext>,
    slots: Arc<Semaphore>,
}

impl EngineService {
    /// Engine backed by the analytic gateway.
    pub fn new(config: EngineConfig) -> EfResult<Self> {
        Self::with_context(EngineContext::new(config, Arc::new(SyntheticGateway::new())))
    }

    pub fn with_context(ctx: EngineContext) -> EfResult<Self> {
        ctx.config.validate()?;
        let slots = Arc::new(Semaphore::new(ctx.config.max_active_requests));
        Ok(Self {
            ctx: Arc::new(ctx),
            slots,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    pub fn cache(&self) -> &ModelCache {
        &self.ctx.cache
    }

    pub fn catalog(&self) -> &ConfigurationCatalog {
        &self.ctx.catalog
    }

    /// Drop cached models of a configuration after it changed.
    pub fn invalidate_configuration(&self, configuration_id: &str) -> usize {
        self.ctx.cache.invalidate_configuration(configuration_id)
    }

    pub fn active_requests(&self) -> usize {
        self.ctx.config.max_active_requests - self.slots.available_permits()
    }

    pub fn dispatch(&self, request: EngineRequest) -> Result<ProgressChannel, RequestError> {
        match request {
            EngineRequest::Run(request) => self.run_pipeline(request),
            EngineRequest::Compare(request) => self.run_comparison(request),
            EngineRequest::Sweep(request) => self.run_sweep(request),
        }
    }

    /// One pipeline. A single requested strategy is honored; otherwise the
    /// selection policy decides.
    pub fn run_pipeline(&self, request: RunRequest) -> Result<ProgressChannel, RequestError> {
        let configuration = self.ctx.catalog.get(&request.configuration_id)?.clone();
        let budget = self
            .ctx
            .config
            .check_budget(request.iteration_budget, self.ctx.config.default_iteration_budget)?;
        let strategy = match request.strategies {
            None => select_strategy(&configuration),
            Some(set) => {
                let mut requested = set.into_iter();
                match (requested.next(), requested.next()) {
                    (Some(kind), None) => kind,
                    (None, _) => return Err(RequestError::EmptyStrategySet),
                    (Some(_), Some(_)) => {
                        return Err(RequestError::Malformed {
                            message: "a single run takes at most one strategy".to_string(),
                        })
                    }
                }
            }
        };
        let permit = self.acquire()?;

        let ctx = self.ctx.clone();
        Ok(self.spawn("run", permit, move |publisher| async move {
            let resolved = configuration.resolve();
            let report = Pipeline::new(&ctx, publisher)
                .execute(&resolved, strategy, budget)
                .await?;
            Ok(EventPayload::Pipeline(Box::new(report)))
        }))
    }

    /// All requested strategies (all three when none are given) on one model.
    pub fn run_comparison(&self, request: RunRequest) -> Result<ProgressChannel, RequestError> {
        let configuration = self.ctx.catalog.get(&request.configuration_id)?.clone();
        let budget = self
            .ctx
            .config
            .check_budget(request.iteration_budget, self.ctx.config.default_iteration_budget)?;
        let strategies = request
            .strategies
            .unwrap_or_else(|| StrategyKind::ALL.into_iter().collect());
        if strategies.is_empty() {
            return Err(RequestError::EmptyStrategySet);
        }
        let permit = self.acquire()?;

        let ctx = self.ctx.clone();
        Ok(self.spawn("compare", permit, move |publisher| async move {
            let resolved = configuration.resolve();
            let report = comparison::execute(ctx, resolved, strategies, budget, publisher).await?;
            Ok(EventPayload::Comparison(Box::new(report)))
        }))
    }

    /// Repeat the pipeline over a bond-length grid.
    pub fn run_sweep(&self, request: RunRequest) -> Result<ProgressChannel, RequestError> {
        let configuration = self.ctx.catalog.get(&request.configuration_id)?.clone();
        let config = &self.ctx.config;
        let budget = config.check_budget(request.iteration_budget, config.default_sweep_budget)?;
        let range = request.range.unwrap_or_else(|| {
            ScanRange::new(
                config.default_sweep_start,
                config.default_sweep_end,
                config.default_sweep_steps,
            )
        });
        range.validate(config.max_sweep_steps)?;
        let permit = self.acquire()?;

        let ctx = self.ctx.clone();
        Ok(self.spawn("sweep", permit, move |publisher| async move {
            let report = sweep::execute(ctx, configuration, range, budget, publisher).await?;
            Ok(EventPayload::Sweep(Box::new(report)))
        }))
    }

    fn acquire(&self) -> Result<OwnedSemaphorePermit, RequestError> {
        self.slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| RequestError::TooManyActiveRequests {
                limit: self.ctx.config.max_active_requests,
            })
    }

    /// Open a channel and run `body` on its own task. The permit is released
    /// when the task ends.
    fn spawn<F, Fut>(&self, mode: &'static str, permit: OwnedSemaphorePermit, body: F) -> ProgressChannel
    where
        F: FnOnce(ProgressPublisher) -> Fut,
        Fut: Future<Output = Result<EventPayload, UnitError>> + Send + 'static,
    {
        let run_id = Uuid::new_v4();
        let (publisher, mut channel) = channel::channel(run_id, self.ctx.config.channel_capacity);
        let run = body(publisher.clone());

        let span = info_span!("request", %run_id, mode);
        let task = tokio::spawn(
            async move {
                let _permit = permit;
                info!("request started");
                let outcome = match run.await {
                    Ok(payload) => match publisher.complete(payload).await {
                        Ok(()) => RunOutcome::Completed,
                        Err(_) => RunOutcome::Cancelled,
                    },
                    Err(UnitError::Failed { error, .. }) => {
                        warn!(%error, "request failed");
                        match publisher.fail(&error).await {
                            Ok(()) => RunOutcome::Failed,
                            Err(_) => RunOutcome::Cancelled,
                        }
                    }
                    Err(UnitError::Cancelled) => RunOutcome::Cancelled,
                };
                info!(?outcome, "request finished");
                outcome
            }
            .instrument(span),
        );
        channel.attach(task);
        channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ef_types::{EventStatus, Stage};
    use std::time::Duration;

    fn service(gateway: Arc<SyntheticGateway>, config: EngineConfig) -> EngineService {
        EngineService::with_context(EngineContext::new(config, gateway)).unwrap()
    }

    #[tokio::test]
    async fn pipeline_streams_one_terminal_event() {
        let engine = service(Arc::new(SyntheticGateway::new()), EngineConfig::default());
        let channel = engine.run_pipeline(RunRequest::new("H2").with_budget(20)).unwrap();
        let (events, outcome) = channel.collect().await;
        assert_eq!(outcome, RunOutcome::Completed);

        let mut seen = Vec::new();
        for event in &events {
            if seen.last() != Some(&event.stage) {
                seen.push(event.stage);
            }
        }
        assert_eq!(seen, Stage::ORDER.to_vec());
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

        let last = events.last().unwrap();
        assert!(last.is_terminal());
        assert_eq!(last.status, EventStatus::Complete);
        assert_eq!(last.progress, 100);
        match &last.payload {
            EventPayload::Pipeline(report) => {
                assert_eq!(report.result.iteration_count, report.result.iterations.len());
                assert!(report.result.iteration_count <= 20);
                assert_eq!(report.result.strategy_id, StrategyKind::GradientBased);
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert!(events.iter().enumerate().all(|(i, e)| e.sequence == i as u64));
    }

    #[tokio::test]
    async fn second_run_reuses_the_model() {
        let gateway = Arc::new(SyntheticGateway::new());
        let engine = service(gateway.clone(), EngineConfig::default());

        let mut cached_flags = Vec::new();
        for _ in 0..2 {
            let (events, _) = engine
                .run_pipeline(RunRequest::new("H2").with_budget(5))
                .unwrap()
                .collect()
                .await;
            let flag = events.iter().find_map(|e| match &e.payload {
                EventPayload::Model(summary) => Some(summary.cached),
                _ => None,
            });
            cached_flags.push(flag);
        }
        assert_eq!(cached_flags, vec![Some(false), Some(true)]);
        assert_eq!(gateway.build_calls(), 1);

        assert_eq!(engine.invalidate_configuration("H2"), 1);
        let (events, _) = engine
            .run_pipeline(RunRequest::new("H2").with_budget(5))
            .unwrap()
            .collect()
            .await;
        assert!(events
            .iter()
            .any(|e| matches!(&e.payload, EventPayload::Model(s) if !s.cached)));
        assert_eq!(gateway.build_calls(), 2);
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected_synchronously() {
        let engine = service(Arc::new(SyntheticGateway::new()), EngineConfig::default());

        assert!(matches!(
            engine.run_pipeline(RunRequest::new("He2")),
            Err(RequestError::UnknownConfiguration { .. })
        ));
        assert!(matches!(
            engine.run_pipeline(RunRequest::new("H2").with_budget(0)),
            Err(RequestError::IterationBudgetOutOfRange { .. })
        ));
        assert!(matches!(
            engine.run_comparison(RunRequest::new("H2").with_strategies(Vec::new())),
            Err(RequestError::EmptyStrategySet)
        ));
        assert!(matches!(
            engine.run_sweep(RunRequest::new("H2").with_range(ScanRange::new(2.0, 0.5, 10))),
            Err(RequestError::DegenerateRange { .. })
        ));
        assert!(matches!(
            engine.run_sweep(RunRequest::new("H2").with_range(ScanRange::new(0.5, 2.0, 1))),
            Err(RequestError::StepsOutOfRange { .. })
        ));
        assert_eq!(engine.active_requests(), 0);
    }

    #[tokio::test]
    async fn active_request_limit() {
        let gateway = Arc::new(SyntheticGateway::new().with_latency(Duration::from_millis(5)));
        let engine = service(gateway, EngineConfig::default().with_max_active_requests(1));

        let first = engine.run_pipeline(RunRequest::new("H2").with_budget(50)).unwrap();
        assert!(matches!(
            engine.run_pipeline(RunRequest::new("H2")),
            Err(RequestError::TooManyActiveRequests { limit: 1 })
        ));
        let (_, outcome) = first.collect().await;
        assert_eq!(outcome, RunOutcome::Completed);
        assert!(engine.run_pipeline(RunRequest::new("H2").with_budget(5)).is_ok());
    }

    #[tokio::test]
    async fn cancellation_stops_evaluator_calls() {
        let gateway = Arc::new(SyntheticGateway::new().with_latency(Duration::from_millis(10)));
        let engine = service(gateway.clone(), EngineConfig::default().with_channel_capacity(4));
        let mut channel = engine.run_pipeline(RunRequest::new("H2").with_budget(200)).unwrap();

        let mut iterations = 0;
        while let Some(event) = channel.recv().await {
            if event.iteration().is_some() {
                iterations += 1;
                if iterations == 3 {
                    break;
                }
            }
        }
        channel.close();
        let (rest, outcome) = channel.collect().await;
        assert_eq!(outcome, RunOutcome::Cancelled);
        assert!(rest.iter().all(|e| !e.is_terminal()));

        let calls = gateway.evaluate_calls();
        assert!(calls < 200);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(gateway.evaluate_calls(), calls);
        assert_eq!(engine.active_requests(), 0);
    }

    /// Read until `iterations` iteration events arrived, then close and drain.
    async fn cancel_after(mut channel: ProgressChannel, iterations: usize) -> (Vec<ef_types::ProgressEvent>, RunOutcome) {
        let mut seen = 0;
        while let Some(event) = channel.recv().await {
            if event.iteration().is_some() {
                seen += 1;
                if seen == iterations {
                    break;
                }
            }
        }
        channel.close();
        channel.collect().await
    }

    #[tokio::test]
    async fn cancelling_a_comparison_stops_every_strategy() {
        let gateway = Arc::new(SyntheticGateway::new().with_latency(Duration::from_millis(2)));
        let engine = service(gateway.clone(), EngineConfig::default().with_channel_capacity(4));
        let channel = engine.run_comparison(RunRequest::new("H2").with_budget(200)).unwrap();

        let (rest, outcome) = cancel_after(channel, 5).await;
        assert_eq!(outcome, RunOutcome::Cancelled);
        assert!(rest.iter().all(|e| !e.is_terminal()));

        let calls = gateway.evaluate_calls();
        assert!(calls < 3 * 200);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(gateway.evaluate_calls(), calls);
        assert_eq!(engine.active_requests(), 0);
    }

    #[tokio::test]
    async fn cancelling_a_sweep_skips_remaining_points() {
        let gateway = Arc::new(SyntheticGateway::new().with_latency(Duration::from_millis(1)));
        let engine = service(gateway.clone(), EngineConfig::default().with_channel_capacity(4));
        let request = RunRequest::new("H2")
            .with_budget(50)
            .with_range(ScanRange::new(0.5, 2.0, 10));
        let channel = engine.run_sweep(request).unwrap();

        let (rest, outcome) = cancel_after(channel, 70).await;
        assert_eq!(outcome, RunOutcome::Cancelled);
        assert!(rest.iter().all(|e| !e.is_terminal()));

        let calls = gateway.evaluate_calls();
        assert!(calls < 10 * 50);
        let builds = gateway.build_calls();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(gateway.evaluate_calls(), calls);
        assert_eq!(gateway.build_calls(), builds);
        assert_eq!(engine.active_requests(), 0);
    }

    #[tokio::test]
    async fn evaluator_timeout_fails_the_pipeline() {
        let gateway = Arc::new(SyntheticGateway::new().with_latency(Duration::from_millis(200)));
        let config = EngineConfig::default().with_evaluator_timeout(Duration::from_millis(20));
        let engine = service(gateway, config);

        let (events, outcome) = engine
            .run_pipeline(RunRequest::new("H2").with_budget(5))
            .unwrap()
            .collect()
            .await;
        assert_eq!(outcome, RunOutcome::Failed);
        let last = events.last().unwrap();
        assert!(last.is_terminal());
        match &last.payload {
            EventPayload::Error { message, stage } => {
                assert_eq!(*stage, Stage::Optimize);
                assert!(message.contains("20 ms"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert!(events.iter().all(|e| e.iteration().is_none()));
    }

    #[tokio::test]
    async fn comparison_and_sweep_complete() {
        let engine = service(Arc::new(SyntheticGateway::new()), EngineConfig::default());

        let (events, outcome) = engine
            .run_comparison(RunRequest::new("LiH").with_budget(10))
            .unwrap()
            .collect()
            .await;
        assert_eq!(outcome, RunOutcome::Completed);
        assert!(matches!(
            &events.last().unwrap().payload,
            EventPayload::Comparison(report) if report.results.len() == 3
        ));

        let (events, outcome) = engine
            .run_sweep(RunRequest::new("LiH").with_budget(5).with_range(ScanRange::new(1.2, 2.0, 3)))
            .unwrap()
            .collect()
            .await;
        assert_eq!(outcome, RunOutcome::Completed);
        match &events.last().unwrap().payload {
            EventPayload::Sweep(report) => {
                assert_eq!(report.strategy_id, StrategyKind::DerivativeFree);
                assert_eq!(report.points.len(), 3);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn request_envelope_wire_format() {
        let request: EngineRequest = serde_json::from_str(
            r#"{"mode":"compare","configurationId":"H2","iterationBudget":50,"strategies":["gradient_based","stochastic_perturbation"]}"#,
        )
        .unwrap();
        assert_eq!(
            request,
            EngineRequest::Compare(
                RunRequest::new("H2")
                    .with_budget(50)
                    .with_strategies([StrategyKind::GradientBased, StrategyKind::StochasticPerturbation])
            )
        );

        let sweep: EngineRequest =
            serde_json::from_str(r#"{"mode":"sweep","configurationId":"LiH","range":{"start":1.0,"end":2.5,"steps":4}}"#).unwrap();
        assert!(matches!(sweep, EngineRequest::Sweep(RunRequest { range: Some(_), .. })));
    }
}
