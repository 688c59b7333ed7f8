//! The generation pipeline.
//!
//! `generate(style, subject)` either hands the subject back untouched (identity
//! style) or runs upload(subject) alongside resolve(style) + upload(style),
//! then one bounded-retry synthesis call and a download of its output. At most
//! one run is active per pipeline; a second caller gets [`PipelineError::Busy`].

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use restyle_contracts::assets::{GenerationResult, LocalAsset, RemoteAsset};
use restyle_contracts::events::{AssetRole, EventWriter, PipelineEvent};
use restyle_contracts::runs::receipts::{
    build_receipt, receipt_path_for, write_receipt, GenerationReceipt,
};
use restyle_contracts::state::{PipelineStage, PipelineState};
use restyle_contracts::styles::StyleCatalog;
use serde_json::json;
use tokio::sync::watch;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::generation::{AttemptEvent, GenerationClient, RetryPolicy};
use crate::materialize::ResultMaterializer;
use crate::providers::{
    DryrunProvider, ImageProvider, ImageProviderRegistry, ReplicateProvider,
    STYLE_TRANSFER_PROMPT,
};
use crate::resolver::{AssetResolver, Resolution};
use crate::upload::{AssetHost, DryrunHost, TmpFilesHost};
use crate::util::{map_object, now_utc_iso};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutput {
    /// Identity style: the subject exactly as it was passed in.
    Original(LocalAsset),
    Generated(GenerationResult),
}

impl PipelineOutput {
    pub fn path(&self) -> &Path {
        match self {
            PipelineOutput::Original(asset) => asset.path(),
            PipelineOutput::Generated(result) => &result.local_result_path,
        }
    }

    pub fn uri(&self) -> String {
        match self {
            PipelineOutput::Original(asset) => asset.uri().to_string(),
            PipelineOutput::Generated(result) => result.local_asset().file_uri(),
        }
    }
}

struct StyleUpload {
    resolution: Resolution,
    remote: RemoteAsset,
}

/// Holds the single-flight flag for one run. A run dropped before it
/// finished leaves `Failed` behind rather than a stale active state.
struct BusyGuard<'a> {
    flag: &'a AtomicBool,
    state: &'a watch::Sender<PipelineState>,
}

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool, state: &'a watch::Sender<PipelineState>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag, state })
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.state.send_if_modified(|state| {
            if !state.is_active() {
                return false;
            }
            *state = PipelineState::Failed {
                stage: None,
                reason: "run abandoned before completion".to_string(),
            };
            true
        });
        self.flag.store(false, Ordering::Release);
    }
}

pub struct StylePipeline {
    resolver: AssetResolver,
    host: Arc<dyn AssetHost>,
    generator: GenerationClient,
    materializer: ResultMaterializer,
    events: Option<EventWriter>,
    write_receipts: bool,
    state: watch::Sender<PipelineState>,
    busy: AtomicBool,
    selected: Mutex<String>,
}

impl StylePipeline {
    pub fn new(
        resolver: AssetResolver,
        host: Arc<dyn AssetHost>,
        generator: GenerationClient,
        materializer: ResultMaterializer,
    ) -> Self {
        let selected = resolver.catalog().identity().id.clone();
        let (state, _) = watch::channel(PipelineState::Idle);
        Self {
            resolver,
            host,
            generator,
            materializer,
            events: None,
            write_receipts: false,
            state,
            busy: AtomicBool::new(false),
            selected: Mutex::new(selected),
        }
    }

    /// Wires the configured host and provider. `dryrun` stays fully offline.
    pub fn from_config(config: &PipelineConfig, catalog: StyleCatalog) -> Result<Self> {
        let mut registry = ImageProviderRegistry::new();
        registry.register(DryrunProvider::new(config.documents_dir.join("dryrun")));
        if config.provider == "replicate" {
            registry.register(ReplicateProvider::new(&config.replicate)?);
        }
        let provider: Arc<dyn ImageProvider> = registry.get(&config.provider).ok_or_else(|| {
            anyhow!(
                "unknown provider '{}' (available: {}, replicate)",
                config.provider,
                registry.names().join(", ")
            )
        })?;
        let host: Arc<dyn AssetHost> = match config.provider.as_str() {
            "dryrun" => Arc::new(DryrunHost),
            _ => Arc::new(TmpFilesHost::new(&config.upload)),
        };

        let pipeline = Self::new(
            AssetResolver::new(config, catalog),
            host,
            GenerationClient::new(provider, RetryPolicy::from(config.retry)),
            ResultMaterializer::new(config.documents_dir.clone())
                .allow_local_sources(config.provider == "dryrun"),
        );
        Ok(pipeline.with_receipts(config.write_receipts))
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_receipts(mut self, enabled: bool) -> Self {
        self.write_receipts = enabled;
        self
    }

    pub fn catalog(&self) -> &StyleCatalog {
        self.resolver.catalog()
    }

    pub fn current_state(&self) -> PipelineState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    /// Picks the style for [`Self::generate_selected`]. An in-flight run keeps
    /// the style it started with.
    pub fn select_style(&self, style_id: impl Into<String>) {
        *self.selected.lock().unwrap_or_else(|p| p.into_inner()) = style_id.into();
    }

    pub fn selected_style(&self) -> String {
        self.selected
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub async fn generate_selected(
        &self,
        subject: &LocalAsset,
    ) -> Result<PipelineOutput, PipelineError> {
        let style_id = self.selected_style();
        self.generate(&style_id, subject).await
    }

    pub async fn generate(
        &self,
        style_id: &str,
        subject: &LocalAsset,
    ) -> Result<PipelineOutput, PipelineError> {
        let Some(_guard) = BusyGuard::acquire(&self.busy, &self.state) else {
            self.emit(PipelineEvent::PipelineRejected {
                style_id: style_id.to_string(),
            });
            return Err(PipelineError::Busy);
        };
        self.emit(PipelineEvent::PipelineStarted {
            style_id: style_id.to_string(),
            subject: subject.uri().to_string(),
        });

        if self.resolver.catalog().is_identity(style_id) {
            self.set_state(PipelineState::Succeeded {
                result: subject.path().to_path_buf(),
            });
            self.emit(PipelineEvent::PipelineSucceeded {
                style_id: style_id.to_string(),
                result: subject.uri().to_string(),
                identity: true,
            });
            return Ok(PipelineOutput::Original(subject.clone()));
        }

        match self.run(style_id, subject).await {
            Ok(result) => {
                self.set_state(PipelineState::Succeeded {
                    result: result.local_result_path.clone(),
                });
                self.emit(PipelineEvent::PipelineSucceeded {
                    style_id: style_id.to_string(),
                    result: result.local_result_path.to_string_lossy().into_owned(),
                    identity: false,
                });
                Ok(PipelineOutput::Generated(result))
            }
            Err(err) => {
                self.set_state(PipelineState::Failed {
                    stage: err.stage(),
                    reason: err.to_string(),
                });
                self.emit(PipelineEvent::PipelineFailed {
                    style_id: style_id.to_string(),
                    stage: err.stage(),
                    kind: err.kind().to_string(),
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        style_id: &str,
        subject: &LocalAsset,
    ) -> Result<GenerationResult, PipelineError> {
        let started_at = now_utc_iso();
        let (subject_remote, style) =
            tokio::join!(self.upload_subject(subject), self.style_branch(style_id));
        let subject_remote = subject_remote?;
        let style = style?;

        let generated = self
            .generator
            .generate_observed(&subject_remote.url, &style.remote.url, &|event| match event {
                AttemptEvent::Started(attempt) => {
                    self.set_state(PipelineState::Generating {
                        attempt: attempt.attempt_number,
                        max_attempts: attempt.max_attempts,
                    });
                    self.emit(PipelineEvent::GenerationAttempt {
                        attempt: attempt.attempt_number,
                        max_attempts: attempt.max_attempts,
                        provider: self.generator.provider_name().to_string(),
                    });
                }
                AttemptEvent::Failed(attempt, err) if !attempt.is_last() => {
                    self.emit(PipelineEvent::GenerationRetry {
                        attempt: attempt.attempt_number,
                        delay_ms: self.generator.policy().delay.as_millis() as u64,
                        error: err.to_string(),
                    });
                }
                AttemptEvent::Failed(..) => {}
            })
            .await
            .map_err(|err| PipelineError::at(PipelineStage::Generate, err))?;

        self.set_state(PipelineState::Downloading);
        let materialized = self.materializer.materialize(&generated.output_url).await;
        self.generator.discard_output(&generated.output_url).await;
        let result =
            materialized.map_err(|err| PipelineError::at(PipelineStage::Download, err))?;
        self.emit(PipelineEvent::ResultMaterialized {
            remote_output_url: result.remote_output_url.clone(),
            path: result.local_result_path.to_string_lossy().into_owned(),
        });

        if self.write_receipts {
            let receipt = GenerationReceipt {
                style_id: style_id.to_string(),
                effective_style_id: style.resolution.style_id.clone(),
                resolution_tier: style.resolution.tier.to_string(),
                subject_path: subject.path().to_path_buf(),
                subject_url: subject_remote.url.clone(),
                style_url: style.remote.url.clone(),
                attempts: generated.attempts,
                provider: self.generator.provider_name().to_string(),
                started_at,
                finished_at: now_utc_iso(),
            };
            self.write_receipt(&receipt, &result);
        }
        Ok(result)
    }

    async fn upload_subject(&self, subject: &LocalAsset) -> Result<RemoteAsset, PipelineError> {
        self.set_state(PipelineState::UploadingSubject);
        let remote = self
            .host
            .upload(subject)
            .await
            .map_err(|err| PipelineError::at(PipelineStage::UploadSubject, err))?;
        self.emit(PipelineEvent::AssetUploaded {
            role: AssetRole::Subject,
            style_id: None,
            url: remote.url.clone(),
        });
        Ok(remote)
    }

    /// Resolve then upload the style. A failed style upload is retried once,
    /// end to end, with the fallback style; the first error is the one surfaced.
    async fn style_branch(&self, style_id: &str) -> Result<StyleUpload, PipelineError> {
        let resolution = self.resolve_style(style_id).await?;
        let err = match self.upload_style(&resolution).await {
            Ok(remote) => return Ok(StyleUpload { resolution, remote }),
            Err(err) => err,
        };

        let Some(fallback) = self
            .resolver
            .fallback_style_id()
            .filter(|id| *id != resolution.style_id)
            .map(str::to_string)
        else {
            return Err(err);
        };
        self.emit(PipelineEvent::StyleFallback {
            style_id: style_id.to_string(),
            fallback: fallback.clone(),
            reason: err.to_string(),
        });

        let retried = async {
            let mut resolution = self.resolve_style(&fallback).await?;
            let remote = self.upload_style(&resolution).await?;
            resolution.requested = style_id.to_string();
            Ok::<_, PipelineError>(StyleUpload { resolution, remote })
        }
        .await;
        retried.map_err(|_| err)
    }

    async fn resolve_style(&self, style_id: &str) -> Result<Resolution, PipelineError> {
        self.set_state(PipelineState::ResolvingStyle);
        let resolution = self
            .resolver
            .resolve(style_id)
            .await
            .map_err(|err| PipelineError::at(PipelineStage::ResolveStyle, err))?;
        self.emit(PipelineEvent::StyleResolved {
            requested: resolution.requested.clone(),
            style_id: resolution.style_id.clone(),
            tier: resolution.tier.as_str().to_string(),
            fell_back: resolution.fell_back(),
            path: resolution.asset.path().to_string_lossy().into_owned(),
        });
        Ok(resolution)
    }

    async fn upload_style(&self, resolution: &Resolution) -> Result<RemoteAsset, PipelineError> {
        self.set_state(PipelineState::UploadingStyle);
        let remote = self
            .host
            .upload(&resolution.asset)
            .await
            .map_err(|err| PipelineError::at(PipelineStage::UploadStyle, err))?;
        self.emit(PipelineEvent::AssetUploaded {
            role: AssetRole::Style,
            style_id: Some(resolution.style_id.clone()),
            url: remote.url.clone(),
        });
        Ok(remote)
    }

    fn write_receipt(&self, receipt: &GenerationReceipt, result: &GenerationResult) {
        let receipt_path = receipt_path_for(&result.local_result_path);
        let provider_request = map_object(json!({
            "provider": receipt.provider,
            "prompt": STYLE_TRANSFER_PROMPT,
            "image_input": [receipt.subject_url, receipt.style_url],
        }));
        let payload = build_receipt(receipt, result, &receipt_path, &provider_request);
        if let Err(err) = write_receipt(&receipt_path, &payload) {
            self.emit(PipelineEvent::ReceiptFailed {
                path: receipt_path.to_string_lossy().into_owned(),
                error: err.to_string(),
            });
        }
    }

    fn set_state(&self, state: PipelineState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(events) = &self.events {
            // The log never decides the outcome of a run.
            let _ = events.record(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::http::header;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use restyle_contracts::assets::GenerationAttempt;
    use serde_json::Value;
    use tokio::sync::Notify;

    use super::*;
    use crate::config::ReplicateConfig;
    use crate::error::{AttemptError, UploadError};
    use crate::test_support::serve;

    struct Fixture {
        temp: tempfile::TempDir,
        config: PipelineConfig,
        subject: LocalAsset,
    }

    fn fixture() -> anyhow::Result<Fixture> {
        let temp = tempfile::tempdir()?;
        let config = PipelineConfig {
            documents_dir: temp.path().join("documents"),
            bundle_dir: temp.path().join("bundle"),
            install_dir: temp.path().join("install"),
            ..PipelineConfig::default()
        };
        let styles = config.bundle_dir.join("styles");
        std::fs::create_dir_all(&styles)?;
        for id in ["banana", "pirate"] {
            std::fs::write(styles.join(format!("{id}.png")), id.as_bytes())?;
        }
        let subject_path = temp.path().join("a.jpg");
        std::fs::write(&subject_path, b"subject")?;
        Ok(Fixture {
            config,
            subject: LocalAsset::from_path(subject_path),
            temp,
        })
    }

    #[derive(Default)]
    struct FakeHost {
        uploads: Mutex<Vec<String>>,
        reject: Vec<&'static str>,
    }

    impl FakeHost {
        fn rejecting(reject: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                reject,
                ..Self::default()
            })
        }

        fn uploads(&self) -> Vec<String> {
            self.uploads.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AssetHost for FakeHost {
        fn name(&self) -> &str {
            "fake"
        }

        async fn upload(&self, asset: &LocalAsset) -> Result<RemoteAsset, UploadError> {
            let name = asset.file_name().unwrap_or_default().to_string();
            self.uploads.lock().unwrap().push(name.clone());
            if self.reject.contains(&name.as_str()) {
                return Err(UploadError::Status {
                    status: 500,
                    body: format!("rejected {name}"),
                });
            }
            Ok(RemoteAsset::new(format!("https://host/dl/{name}")))
        }
    }

    struct FakeProvider {
        output: Option<PathBuf>,
        gate: Option<Arc<Notify>>,
        calls: AtomicU32,
        styles: Mutex<Vec<String>>,
    }

    impl FakeProvider {
        fn rendering(output: PathBuf) -> Arc<Self> {
            Arc::new(Self {
                output: Some(output),
                gate: None,
                calls: AtomicU32::new(0),
                styles: Mutex::new(Vec::new()),
            })
        }

        fn empty() -> Arc<Self> {
            Arc::new(Self {
                output: None,
                gate: None,
                calls: AtomicU32::new(0),
                styles: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ImageProvider for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }

        async fn predict(&self, attempt: &GenerationAttempt) -> Result<String, AttemptError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.styles.lock().unwrap().push(attempt.style_url.clone());
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            match &self.output {
                Some(path) => Ok(format!("file://{}", path.display())),
                None => Err(AttemptError::MissingOutput),
            }
        }
    }

    fn render(fixture: &Fixture) -> anyhow::Result<PathBuf> {
        let path = fixture.temp.path().join("render.png");
        std::fs::write(&path, b"rendered")?;
        Ok(path)
    }

    fn pipeline(
        fixture: &Fixture,
        host: Arc<dyn AssetHost>,
        provider: Arc<dyn ImageProvider>,
    ) -> StylePipeline {
        StylePipeline::new(
            AssetResolver::new(&fixture.config, StyleCatalog::default()),
            host,
            GenerationClient::new(
                provider,
                RetryPolicy {
                    max_attempts: 3,
                    delay: Duration::from_millis(5),
                },
            ),
            ResultMaterializer::new(fixture.config.documents_dir.clone())
                .allow_local_sources(true),
        )
    }

    fn event_names(events: &EventWriter) -> anyhow::Result<Vec<&'static str>> {
        Ok(events
            .read_events()?
            .iter()
            .map(|row| row.event.name())
            .collect())
    }

    #[tokio::test]
    async fn identity_style_returns_subject_without_any_calls() -> anyhow::Result<()> {
        let fixture = fixture()?;
        let host = FakeHost::rejecting(Vec::new());
        let provider = FakeProvider::empty();
        let pipeline = pipeline(&fixture, host.clone(), provider.clone());

        let subject = LocalAsset::parse("file:///a.jpg");
        let output = pipeline.generate("original", &subject).await?;

        assert_eq!(output, PipelineOutput::Original(subject.clone()));
        assert_eq!(output.uri(), "file:///a.jpg");
        assert!(host.uploads().is_empty());
        assert_eq!(provider.calls(), 0);
        assert_eq!(
            pipeline.current_state(),
            PipelineState::Succeeded {
                result: PathBuf::from("/a.jpg")
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn styled_generation_writes_a_new_local_file() -> anyhow::Result<()> {
        let fixture = fixture()?;
        let host = FakeHost::rejecting(Vec::new());
        let provider = FakeProvider::rendering(render(&fixture)?);
        let events = EventWriter::new(fixture.temp.path().join("events.jsonl"), "s-1");
        let pipeline = pipeline(&fixture, host.clone(), provider.clone())
            .with_events(events.clone())
            .with_receipts(true);

        let output = pipeline.generate("pirate", &fixture.subject).await?;
        let PipelineOutput::Generated(result) = &output else {
            anyhow::bail!("expected a generated result, got {output:?}");
        };

        assert!(result.local_result_path.exists());
        assert_ne!(result.local_result_path, fixture.subject.path());
        assert!(result
            .local_result_path
            .starts_with(&fixture.config.documents_dir));
        assert_eq!(std::fs::read(&result.local_result_path)?, b"rendered");

        let mut uploads = host.uploads();
        uploads.sort();
        assert_eq!(uploads, vec!["a.jpg".to_string(), "pirate.png".to_string()]);
        assert_eq!(provider.calls(), 1);
        assert_eq!(
            pipeline.current_state(),
            PipelineState::Succeeded {
                result: result.local_result_path.clone()
            }
        );

        let receipt: Value = serde_json::from_str(&std::fs::read_to_string(receipt_path_for(
            &result.local_result_path,
        ))?)?;
        assert_eq!(receipt["generation"]["style_id"], json!("pirate"));
        assert_eq!(receipt["generation"]["resolution_tier"], json!("bundled"));
        assert_eq!(receipt["generation"]["attempts"], json!(1));

        let names = event_names(&events)?;
        assert_eq!(names.first(), Some(&"pipeline_started"));
        assert_eq!(names.last(), Some(&"pipeline_succeeded"));
        assert!(names.contains(&"style_resolved"));
        assert_eq!(names.iter().filter(|name| **name == "asset_uploaded").count(), 2);

        let uploads: Vec<_> = events
            .read_events()?
            .into_iter()
            .filter_map(|row| match row.event {
                PipelineEvent::AssetUploaded { role, style_id, .. } => Some((role, style_id)),
                _ => None,
            })
            .collect();
        assert!(uploads.contains(&(AssetRole::Subject, None)));
        assert!(uploads.contains(&(AssetRole::Style, Some("pirate".to_string()))));
        Ok(())
    }

    #[tokio::test]
    async fn second_call_while_in_flight_is_rejected() -> anyhow::Result<()> {
        let fixture = fixture()?;
        let gate = Arc::new(Notify::new());
        let provider = Arc::new(FakeProvider {
            output: Some(render(&fixture)?),
            gate: Some(gate.clone()),
            calls: AtomicU32::new(0),
            styles: Mutex::new(Vec::new()),
        });
        let pipeline = Arc::new(pipeline(
            &fixture,
            FakeHost::rejecting(Vec::new()),
            provider.clone(),
        ));

        let mut states = pipeline.subscribe();
        let running = {
            let pipeline = pipeline.clone();
            let subject = fixture.subject.clone();
            tokio::spawn(async move { pipeline.generate("pirate", &subject).await })
        };
        states
            .wait_for(|state| matches!(state, PipelineState::Generating { .. }))
            .await?;

        let rejected = pipeline.generate("original", &fixture.subject).await;
        assert!(matches!(rejected, Err(PipelineError::Busy)));
        assert!(pipeline.current_state().is_active());

        gate.notify_one();
        let output = running.await??;
        assert!(matches!(output, PipelineOutput::Generated(_)));
        assert_eq!(provider.calls(), 1);

        let again = pipeline.generate("original", &fixture.subject).await?;
        assert_eq!(again.path(), fixture.subject.path());
        Ok(())
    }

    #[tokio::test]
    async fn dropped_run_releases_the_pipeline_and_leaves_a_terminal_state() -> anyhow::Result<()> {
        let fixture = fixture()?;
        let provider = Arc::new(FakeProvider {
            output: Some(render(&fixture)?),
            gate: Some(Arc::new(Notify::new())),
            calls: AtomicU32::new(0),
            styles: Mutex::new(Vec::new()),
        });
        let pipeline = Arc::new(pipeline(
            &fixture,
            FakeHost::rejecting(Vec::new()),
            provider.clone(),
        ));

        let mut states = pipeline.subscribe();
        let running = {
            let pipeline = pipeline.clone();
            let subject = fixture.subject.clone();
            tokio::spawn(async move { pipeline.generate("pirate", &subject).await })
        };
        states
            .wait_for(|state| matches!(state, PipelineState::Generating { .. }))
            .await?;

        running.abort();
        assert!(running.await.is_err_and(|err| err.is_cancelled()));

        assert!(matches!(
            pipeline.current_state(),
            PipelineState::Failed { stage: None, .. }
        ));
        let again = pipeline.generate("original", &fixture.subject).await?;
        assert!(matches!(again, PipelineOutput::Original(_)));
        Ok(())
    }

    #[tokio::test]
    async fn exhausted_generation_reports_three_attempts() -> anyhow::Result<()> {
        let fixture = fixture()?;
        let provider = FakeProvider::empty();
        let events = EventWriter::new(fixture.temp.path().join("events.jsonl"), "s-2");
        let pipeline = pipeline(&fixture, FakeHost::rejecting(Vec::new()), provider.clone())
            .with_events(events.clone());

        let err = pipeline
            .generate("pirate", &fixture.subject)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "generation");
        assert_eq!(err.stage(), Some(PipelineStage::Generate));
        assert_eq!(err.generation().map(|inner| inner.attempts), Some(3));
        assert_eq!(provider.calls(), 3);
        assert!(matches!(
            pipeline.current_state(),
            PipelineState::Failed {
                stage: Some(PipelineStage::Generate),
                ..
            }
        ));

        let names = event_names(&events)?;
        assert_eq!(names.iter().filter(|name| **name == "generation_attempt").count(), 3);
        assert_eq!(names.iter().filter(|name| **name == "generation_retry").count(), 2);
        let last = events.read_events()?.pop().map(|row| row.event);
        assert_eq!(
            last,
            Some(PipelineEvent::PipelineFailed {
                style_id: "pirate".to_string(),
                stage: Some(PipelineStage::Generate),
                kind: "generation".to_string(),
                message: err.to_string(),
            })
        );

        let leftovers = std::fs::read_dir(&fixture.config.documents_dir)
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0);
        Ok(())
    }

    #[tokio::test]
    async fn list_output_reaches_the_materializer_as_its_first_url() -> anyhow::Result<()> {
        let base_slot: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
        let slot = base_slot.clone();
        let router = Router::new()
            .route(
                "/v1/models/google/nano-banana/predictions",
                post(move || {
                    let base = slot.lock().unwrap().clone();
                    async move { Json(json!({ "output": [format!("{base}/out.jpg")] })) }
                }),
            )
            .route(
                "/out.jpg",
                get(|| async { ([(header::CONTENT_TYPE, "image/jpeg")], b"jpeg".to_vec()) }),
            );
        let base = serve(router).await?;
        *base_slot.lock().unwrap() = base.clone();

        let fixture = fixture()?;
        let provider = ReplicateProvider::new(&ReplicateConfig {
            api_base: format!("{base}/v1"),
            model: "google/nano-banana".to_string(),
            api_token: Some("tok".to_string()),
        })?;
        let pipeline = pipeline(&fixture, FakeHost::rejecting(Vec::new()), Arc::new(provider));

        let output = pipeline.generate("pirate", &fixture.subject).await?;
        let PipelineOutput::Generated(result) = output else {
            anyhow::bail!("expected a generated result");
        };
        assert_eq!(result.remote_output_url, format!("{base}/out.jpg"));
        assert_eq!(std::fs::read(&result.local_result_path)?, b"jpeg");
        Ok(())
    }

    #[tokio::test]
    async fn local_file_output_from_a_remote_provider_is_refused() -> anyhow::Result<()> {
        let fixture = fixture()?;
        let secret = fixture.temp.path().join("secret.txt");
        std::fs::write(&secret, b"TOP-SECRET")?;
        let output = format!("file://{}", secret.display());
        let router = Router::new().route(
            "/v1/models/google/nano-banana/predictions",
            post(move || {
                let output = output.clone();
                async move { Json(json!({ "output": output })) }
            }),
        );
        let base = serve(router).await?;

        let provider = ReplicateProvider::new(&ReplicateConfig {
            api_base: format!("{base}/v1"),
            model: "google/nano-banana".to_string(),
            api_token: Some("tok".to_string()),
        })?;
        let pipeline = StylePipeline::new(
            AssetResolver::new(&fixture.config, StyleCatalog::default()),
            FakeHost::rejecting(Vec::new()),
            GenerationClient::new(
                Arc::new(provider),
                RetryPolicy {
                    max_attempts: 1,
                    delay: Duration::from_millis(1),
                },
            ),
            ResultMaterializer::new(fixture.config.documents_dir.clone()),
        );

        let err = pipeline
            .generate("pirate", &fixture.subject)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "generation");
        let copied = std::fs::read_dir(&fixture.config.documents_dir)
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(copied, 0);
        Ok(())
    }

    #[tokio::test]
    async fn failed_style_upload_retries_with_default_style() -> anyhow::Result<()> {
        let fixture = fixture()?;
        let host = FakeHost::rejecting(vec!["pirate.png"]);
        let provider = FakeProvider::rendering(render(&fixture)?);
        let pipeline = pipeline(&fixture, host.clone(), provider.clone());

        pipeline.generate("pirate", &fixture.subject).await?;

        assert!(host.uploads().contains(&"banana.png".to_string()));
        assert_eq!(
            provider.styles.lock().unwrap().clone(),
            vec!["https://host/dl/banana.png".to_string()]
        );
        Ok(())
    }

    #[tokio::test]
    async fn style_branch_surfaces_first_error_when_default_also_fails() -> anyhow::Result<()> {
        let fixture = fixture()?;
        let host = FakeHost::rejecting(vec!["pirate.png", "banana.png"]);
        let provider = FakeProvider::rendering(render(&fixture)?);
        let pipeline = pipeline(&fixture, host, provider.clone());

        let err = pipeline
            .generate("pirate", &fixture.subject)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "upload");
        assert_eq!(err.stage(), Some(PipelineStage::UploadStyle));
        assert!(err.to_string().contains("rejected pirate.png"));
        assert_eq!(provider.calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn subject_upload_failure_wins_over_style_failure() -> anyhow::Result<()> {
        let fixture = fixture()?;
        let host = FakeHost::rejecting(vec!["a.jpg", "pirate.png", "banana.png"]);
        let pipeline = pipeline(&fixture, host, FakeProvider::empty());

        let err = pipeline
            .generate("pirate", &fixture.subject)
            .await
            .unwrap_err();
        assert_eq!(err.stage(), Some(PipelineStage::UploadSubject));
        Ok(())
    }

    #[tokio::test]
    async fn selected_style_drives_generate_selected() -> anyhow::Result<()> {
        let fixture = fixture()?;
        let provider = FakeProvider::rendering(render(&fixture)?);
        let pipeline = pipeline(&fixture, FakeHost::rejecting(Vec::new()), provider.clone());

        assert_eq!(pipeline.selected_style(), "original");
        let output = pipeline.generate_selected(&fixture.subject).await?;
        assert!(matches!(output, PipelineOutput::Original(_)));

        pipeline.select_style("pirate");
        let output = pipeline.generate_selected(&fixture.subject).await?;
        assert!(matches!(output, PipelineOutput::Generated(_)));
        assert_eq!(provider.calls(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn dryrun_config_runs_offline_end_to_end() -> anyhow::Result<()> {
        let fixture = fixture()?;
        let config = PipelineConfig {
            provider: "dryrun".to_string(),
            ..fixture.config.clone()
        };
        let pipeline = StylePipeline::from_config(&config, StyleCatalog::default())?;

        let output = pipeline.generate("banana", &fixture.subject).await?;
        let decoded = image::open(output.path())?;
        assert_eq!(decoded.width(), 64);
        assert!(receipt_path_for(output.path()).exists());

        let scratch = std::fs::read_dir(fixture.config.documents_dir.join("dryrun"))?.count();
        assert_eq!(scratch, 0);
        Ok(())
    }

    #[test]
    fn replicate_without_token_fails_to_build() {
        let config = PipelineConfig {
            provider: "replicate".to_string(),
            ..PipelineConfig::default()
        };
        let err = StylePipeline::from_config(&config, StyleCatalog::default())
            .err()
            .map(|err| err.to_string());
        assert_eq!(err.as_deref(), Some("REPLICATE_API_TOKEN not set"));
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let config = PipelineConfig {
            provider: "midjourney".to_string(),
            ..PipelineConfig::default()
        };
        assert!(StylePipeline::from_config(&config, StyleCatalog::default()).is_err());
    }
}
