//! Analysis state machine: cache check, fan-out, aggregation, explanation, store.

use std::{fmt, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use anyhow::Result;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use shared_logging::LogLevel;
use tokio::{task::JoinSet, time::Instant};
use uuid::Uuid;

use crate::{
    aggregator::Aggregator,
    archive::is_encrypted_archive,
    cache::{CacheBackend, FileCacheBackend, MemoryCacheBackend, ResultCache},
    config::VigilConfig,
    engines::{BlocklistAdapter, EngineAdapter, HttpTransport, MultiScanAdapter, ReputationAdapter, ReqwestTransport},
    explainer::{fallback_explanation, Explainer},
    heuristic::HeuristicScorer,
    model::{AggregatedVerdict, AnalysisRequest, EngineResult, ErrorKind, ResourceKind},
    telemetry::EngineTelemetry,
};

/// Default global ceiling for one analysis.
pub const DEFAULT_CEILING: Duration = Duration::from_secs(60);
/// Default budget handed to each adapter.
pub const DEFAULT_ENGINE_TIMEOUT: Duration = Duration::from_secs(55);

/// Stages of one analysis, in the order they are entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStage {
    /// Cache lookup.
    CacheCheck,
    /// Adapters running.
    Fanout,
    /// Combining signals.
    Aggregate,
    /// Attaching the explanation.
    Explain,
    /// Writing the cache.
    Store,
    /// Completed after a full run.
    Done,
    /// Completed without fan-out (cache hit or restricted content).
    EarlyExit,
}

impl AnalysisStage {
    /// Snake-case label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::CacheCheck => "cache_check",
            Self::Fanout => "fanout",
            Self::Aggregate => "aggregate",
            Self::Explain => "explain",
            Self::Store => "store",
            Self::Done => "done",
            Self::EarlyExit => "early_exit",
        }
    }
}

impl fmt::Display for AnalysisStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Verdict plus the path taken to produce it.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisOutcome {
    /// Correlation id stamped on logs and events.
    pub analysis_id: String,
    /// Returned verdict.
    pub verdict: AggregatedVerdict,
    /// Stages entered, in order.
    pub stages: Vec<AnalysisStage>,
    /// Whether the verdict came from the cache.
    pub cache_hit: bool,
}

/// Results of one fan-out slot. A slot runs its adapters in order until one succeeds.
#[derive(Default)]
struct SlotLog {
    results: Vec<EngineResult>,
    finished: bool,
}

struct Slot {
    adapters: Vec<Arc<dyn EngineAdapter>>,
    log: Arc<Mutex<SlotLog>>,
}

/// Coordinates the cache, adapters, scorer, aggregator and explainer.
pub struct ThreatOrchestrator {
    primary: Option<Arc<dyn EngineAdapter>>,
    secondary: Option<Arc<dyn EngineAdapter>>,
    blocklist: Option<Arc<dyn EngineAdapter>>,
    cache: ResultCache,
    scorer: HeuristicScorer,
    aggregator: Aggregator,
    explainer: Explainer,
    telemetry: EngineTelemetry,
    ceiling: Duration,
    engine_timeout: Duration,
}

impl fmt::Debug for ThreatOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = |adapter: &Option<Arc<dyn EngineAdapter>>| adapter.as_ref().map(|a| a.name().to_string());
        f.debug_struct("ThreatOrchestrator")
            .field("primary", &name(&self.primary))
            .field("secondary", &name(&self.secondary))
            .field("blocklist", &name(&self.blocklist))
            .field("ceiling", &self.ceiling)
            .field("engine_timeout", &self.engine_timeout)
            .finish_non_exhaustive()
    }
}

impl ThreatOrchestrator {
    /// Builder entry point.
    #[must_use]
    pub fn builder() -> ThreatOrchestratorBuilder {
        ThreatOrchestratorBuilder::default()
    }

    /// Production wiring: reqwest transport, adapters, cache and explainer from `config`.
    pub fn from_config(config: &VigilConfig, telemetry: EngineTelemetry) -> Result<Self> {
        let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new()?);
        Self::from_config_with_transport(config, transport, telemetry)
    }

    /// Same as [`Self::from_config`] over an explicit transport.
    pub fn from_config_with_transport(
        config: &VigilConfig,
        transport: Arc<dyn HttpTransport>,
        telemetry: EngineTelemetry,
    ) -> Result<Self> {
        config.validate()?;
        let backend: Arc<dyn CacheBackend> = match &config.orchestrator.cache_file {
            Some(path) => match FileCacheBackend::open(path) {
                Ok(backend) => Arc::new(backend),
                Err(err) => {
                    let _ = telemetry.log(
                        LogLevel::Warn,
                        "cache.degraded",
                        None,
                        json!({
                            "operation": "open",
                            "path": path.display().to_string(),
                            "error": err.to_string(),
                        }),
                    );
                    Arc::new(MemoryCacheBackend::new())
                }
            },
            None => Arc::new(MemoryCacheBackend::new()),
        };
        let cache = ResultCache::new(backend).with_default_ttl(config.orchestrator.cache_ttl());

        let mut builder = Self::builder()
            .cache(cache)
            .heuristic(HeuristicScorer::new(config.heuristic.clone()))
            .aggregator(Aggregator::new(config.thresholds))
            .explainer(
                Explainer::from_config(&config.explainer, Arc::clone(&transport))
                    .with_thresholds(config.thresholds),
            )
            .telemetry(telemetry)
            .ceiling_timeout(config.orchestrator.ceiling_timeout())
            .engine_timeout(config.orchestrator.engine_timeout());
        if config.reputation.enabled {
            builder = builder.primary(Arc::new(ReputationAdapter::new(
                config.reputation.clone(),
                Arc::clone(&transport),
            )));
        }
        if config.multiscan.enabled {
            builder = builder.secondary(Arc::new(MultiScanAdapter::new(
                config.multiscan.clone(),
                Arc::clone(&transport),
            )));
        }
        if config.blocklist.enabled {
            builder = builder.blocklist(Arc::new(BlocklistAdapter::new(
                config.blocklist.clone(),
                transport,
            )));
        }
        Ok(builder.build())
    }

    /// Cache handle (read access for inspection).
    #[must_use]
    pub const fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Public entry point: analyzes `identifier` of the given kind.
    pub async fn analyze_resource(
        &self,
        kind: ResourceKind,
        identifier: impl Into<String> + Send,
        raw_content: Option<Vec<u8>>,
    ) -> AggregatedVerdict {
        self.analyze(&AnalysisRequest::new(kind, identifier, raw_content))
            .await
    }

    /// Analyzes a request with the cache's default TTL.
    pub async fn analyze(&self, request: &AnalysisRequest) -> AggregatedVerdict {
        self.analyze_traced(request).await.verdict
    }

    /// Analyzes a request, storing a miss for `ttl`.
    pub async fn analyze_with_ttl(&self, request: &AnalysisRequest, ttl: Duration) -> AggregatedVerdict {
        self.run(request, ttl).await.verdict
    }

    /// Analyzes a request and reports the stages taken.
    pub async fn analyze_traced(&self, request: &AnalysisRequest) -> AnalysisOutcome {
        self.run(request, self.cache.default_ttl()).await
    }

    async fn run(&self, request: &AnalysisRequest, ttl: Duration) -> AnalysisOutcome {
        let analysis_id = Uuid::new_v4().to_string();
        let kind = request.kind();
        let mut stages = vec![AnalysisStage::CacheCheck];
        let _ = self.telemetry.log(
            LogLevel::Info,
            "analysis.started",
            Some(&analysis_id),
            json!({ "kind": kind.label(), "name": request.display_name() }),
        );

        match self.cache.get(kind, request.identifier()) {
            Ok(Some(verdict)) => {
                stages.push(AnalysisStage::EarlyExit);
                let _ = self.telemetry.log(
                    LogLevel::Info,
                    "analysis.cache_hit",
                    Some(&analysis_id),
                    json!({ "risk_level": verdict.risk_level.label() }),
                );
                return self.finish(analysis_id, verdict, stages, true).await;
            }
            Ok(None) => {}
            Err(err) => {
                let _ = self.telemetry.log(
                    LogLevel::Warn,
                    "cache.degraded",
                    Some(&analysis_id),
                    json!({ "operation": "get", "error": err.to_string() }),
                );
            }
        }

        if kind == ResourceKind::File && request.raw_content().is_some_and(is_encrypted_archive) {
            stages.push(AnalysisStage::EarlyExit);
            let _ = self.telemetry.log(
                LogLevel::Info,
                "analysis.restricted",
                Some(&analysis_id),
                json!({ "reason": "password-protected archive" }),
            );
            return self
                .finish(analysis_id, Aggregator::restricted(kind), stages, false)
                .await;
        }

        stages.push(AnalysisStage::Fanout);
        let heuristic = self.scorer.score(request);
        if heuristic.alert {
            let _ = self.telemetry.log(
                LogLevel::Info,
                "heuristic.alert",
                Some(&analysis_id),
                json!({
                    "band": heuristic.risk_band.label(),
                    "points": heuristic.points,
                    "patterns": heuristic.matched_patterns,
                }),
            );
        }
        let results = self.fan_out(request, &analysis_id).await;

        stages.push(AnalysisStage::Aggregate);
        let verdict = self.aggregator.aggregate(&results, &heuristic);

        stages.push(AnalysisStage::Explain);
        let explanation = match self
            .explainer
            .try_generate(&verdict, kind, request.display_name())
            .await
        {
            Ok(explanation) => explanation,
            Err(err) => {
                let _ = self.telemetry.log(
                    LogLevel::Warn,
                    "explainer.fallback",
                    Some(&analysis_id),
                    json!({ "error": err.to_string() }),
                );
                fallback_explanation(&verdict, kind, self.aggregator.thresholds())
            }
        };
        let verdict = verdict.explained(explanation);

        stages.push(AnalysisStage::Store);
        if let Err(err) = self.cache.put(kind, request.identifier(), &verdict, ttl) {
            let _ = self.telemetry.log(
                LogLevel::Warn,
                "cache.degraded",
                Some(&analysis_id),
                json!({ "operation": "put", "error": err.to_string() }),
            );
        }
        stages.push(AnalysisStage::Done);
        self.finish(analysis_id, verdict, stages, false).await
    }

    async fn finish(
        &self,
        analysis_id: String,
        verdict: AggregatedVerdict,
        stages: Vec<AnalysisStage>,
        cache_hit: bool,
    ) -> AnalysisOutcome {
        let _ = self.telemetry.log(
            LogLevel::Info,
            "analysis.completed",
            Some(&analysis_id),
            json!({
                "risk_level": verdict.risk_level.label(),
                "max_detection_rate": verdict.max_detection_rate,
                "engines": verdict.engines.len(),
                "failures": verdict.failures.len(),
                "cache_hit": cache_hit,
                "stages": stages.iter().map(|stage| stage.label()).collect::<Vec<_>>(),
            }),
        );
        let payload = json!({ "verdict": verdict, "cache_hit": cache_hit });
        if let Err(err) = self
            .telemetry
            .event("analysis.completed", Some(&analysis_id), payload)
            .await
        {
            let _ = self.telemetry.log(
                LogLevel::Warn,
                "analysis.event_failed",
                Some(&analysis_id),
                json!({ "error": err.to_string() }),
            );
        }
        AnalysisOutcome {
            analysis_id,
            verdict,
            stages,
            cache_hit,
        }
    }

    fn slots(&self, kind: ResourceKind) -> Vec<Slot> {
        let chain: Vec<Arc<dyn EngineAdapter>> = [&self.primary, &self.secondary]
            .into_iter()
            .flatten()
            .filter(|adapter| adapter.supports(kind))
            .cloned()
            .collect();
        let blocklist = self
            .blocklist
            .iter()
            .filter(|adapter| adapter.supports(kind))
            .cloned()
            .collect::<Vec<_>>();
        [chain, blocklist]
            .into_iter()
            .filter(|adapters| !adapters.is_empty())
            .map(|adapters| Slot {
                adapters,
                log: Arc::new(Mutex::new(SlotLog::default())),
            })
            .collect()
    }

    async fn fan_out(&self, request: &AnalysisRequest, analysis_id: &str) -> Vec<EngineResult> {
        let slots = self.slots(request.kind());
        let deadline = Instant::now() + self.ceiling;
        let mut tasks = JoinSet::new();
        for slot in &slots {
            let adapters = slot.adapters.clone();
            let log = Arc::clone(&slot.log);
            let request = request.clone();
            let telemetry = self.telemetry.clone();
            let analysis_id = analysis_id.to_string();
            let budget = self.engine_timeout;
            tasks.spawn(async move {
                let chain = run_chain(&adapters, &request, budget, deadline, &log, &telemetry, &analysis_id);
                let run = AssertUnwindSafe(chain)
                    .catch_unwind()
                    .await;
                let mut log = log.lock();
                if run.is_err() {
                    let source = adapters
                        .get(log.results.len())
                        .map_or("engine", |adapter| adapter.name())
                        .to_string();
                    log.results
                        .push(EngineResult::failure(source, ErrorKind::Unreachable, "adapter task panicked"));
                }
                log.finished = true;
            });
        }

        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    let _ = self.telemetry.log(
                        LogLevel::Warn,
                        "analysis.ceiling_reached",
                        Some(analysis_id),
                        json!({ "ceiling_ms": self.ceiling.as_millis(), "pending": tasks.len() }),
                    );
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    break;
                }
            }
        }

        let mut results = Vec::new();
        for slot in slots {
            let mut log = slot.log.lock();
            if !log.finished {
                if let Some(adapter) = slot.adapters.get(log.results.len()) {
                    log.results.push(EngineResult::failure(
                        adapter.name(),
                        ErrorKind::Timeout,
                        format!("no answer before the {}ms analysis ceiling", self.ceiling.as_millis()),
                    ));
                }
            }
            results.append(&mut log.results);
        }
        results
    }
}

/// Runs adapters in order, moving to the next one only when the previous failed.
/// Each adapter gets `budget` or whatever is left before `deadline`, whichever is shorter.
async fn run_chain(
    adapters: &[Arc<dyn EngineAdapter>],
    request: &AnalysisRequest,
    budget: Duration,
    deadline: Instant,
    log: &Mutex<SlotLog>,
    telemetry: &EngineTelemetry,
    analysis_id: &str,
) {
    for (position, adapter) in adapters.iter().enumerate() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let result = adapter.analyze(request, budget.min(remaining)).await;
        let failed = result.is_failure();
        if let Some(kind) = result.error {
            let _ = telemetry.log(
                LogLevel::Warn,
                "engine.failure",
                Some(analysis_id),
                json!({
                    "source": result.source_name,
                    "error": kind.to_string(),
                    "detail": result.status_text,
                }),
            );
        }
        log.lock().results.push(result);
        if !failed {
            return;
        }
        if let Some(next) = adapters.get(position + 1) {
            let _ = telemetry.log(
                LogLevel::Info,
                "engine.failover",
                Some(analysis_id),
                json!({ "from": adapter.name(), "to": next.name() }),
            );
        }
    }
}

/// Builder for [`ThreatOrchestrator`].
pub struct ThreatOrchestratorBuilder {
    primary: Option<Arc<dyn EngineAdapter>>,
    secondary: Option<Arc<dyn EngineAdapter>>,
    blocklist: Option<Arc<dyn EngineAdapter>>,
    cache: ResultCache,
    scorer: HeuristicScorer,
    aggregator: Aggregator,
    explainer: Explainer,
    telemetry: EngineTelemetry,
    ceiling: Duration,
    engine_timeout: Duration,
}

impl Default for ThreatOrchestratorBuilder {
    fn default() -> Self {
        Self {
            primary: None,
            secondary: None,
            blocklist: None,
            cache: ResultCache::in_memory(),
            scorer: HeuristicScorer::default(),
            aggregator: Aggregator::default(),
            explainer: Explainer::templates_only(),
            telemetry: EngineTelemetry::default(),
            ceiling: DEFAULT_CEILING,
            engine_timeout: DEFAULT_ENGINE_TIMEOUT,
        }
    }
}

impl ThreatOrchestratorBuilder {
    /// Primary reputation source.
    #[must_use]
    pub fn primary(mut self, adapter: Arc<dyn EngineAdapter>) -> Self {
        self.primary = Some(adapter);
        self
    }

    /// Failover source used when the primary fails.
    #[must_use]
    pub fn secondary(mut self, adapter: Arc<dyn EngineAdapter>) -> Self {
        self.secondary = Some(adapter);
        self
    }

    /// Blocklist source, run in parallel with the primary chain.
    #[must_use]
    pub fn blocklist(mut self, adapter: Arc<dyn EngineAdapter>) -> Self {
        self.blocklist = Some(adapter);
        self
    }

    /// Result cache.
    #[must_use]
    pub fn cache(mut self, cache: ResultCache) -> Self {
        self.cache = cache;
        self
    }

    /// Heuristic scorer.
    #[must_use]
    pub fn heuristic(mut self, scorer: HeuristicScorer) -> Self {
        self.scorer = scorer;
        self
    }

    /// Aggregator.
    #[must_use]
    pub const fn aggregator(mut self, aggregator: Aggregator) -> Self {
        self.aggregator = aggregator;
        self
    }

    /// Explainer.
    #[must_use]
    pub fn explainer(mut self, explainer: Explainer) -> Self {
        self.explainer = explainer;
        self
    }

    /// Telemetry handle.
    #[must_use]
    pub fn telemetry(mut self, telemetry: EngineTelemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Global ceiling for one analysis.
    #[must_use]
    pub const fn ceiling_timeout(mut self, ceiling: Duration) -> Self {
        self.ceiling = ceiling;
        self
    }

    /// Budget handed to each adapter.
    #[must_use]
    pub const fn engine_timeout(mut self, timeout: Duration) -> Self {
        self.engine_timeout = timeout;
        self
    }

    /// Finalizes the orchestrator.
    #[must_use]
    pub fn build(self) -> ThreatOrchestrator {
        ThreatOrchestrator {
            primary: self.primary,
            secondary: self.secondary,
            blocklist: self.blocklist,
            cache: self.cache,
            scorer: self.scorer,
            aggregator: self.aggregator,
            explainer: self.explainer,
            telemetry: self.telemetry,
            ceiling: self.ceiling,
            engine_timeout: self.engine_timeout,
        }
    }
}
