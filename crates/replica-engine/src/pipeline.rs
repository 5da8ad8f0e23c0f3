//! Request orchestration.
//!
//! Router (gate) → fan-out {Surveyor, Photographer, Physicist} → barrier →
//! Asset Extractor → Architect → Builder → Healing Loop. Every stage boundary
//! checks the overall deadline. Stage failures that the request can survive
//! are folded into `warnings` and mirrored as `warning` events.

use std::sync::Mutex;
use std::thread;
use std::time::Instant;

use replica_contracts::events::EventWriter;
use replica_contracts::models::{Capability, ModelRegistry, ModelSelector};
use replica_contracts::result::MotionData;
use replica_contracts::runs::cache::ManifestCache;
use replica_contracts::{
    merge_asset_maps, AssetMap, PipelineError, PipelineInput, PipelineResult, RoutingStrategy,
    StepTimings, VisualManifest,
};
use serde_json::json;

use crate::builder::{build, BuildBrief};
use crate::config::PipelineConfig;
use crate::extractor::extract_assets;
use crate::fanout::bounded_map;
use crate::healing::HealingLoop;
use crate::imaging::{decode_reference, load_image};
use crate::photographer::{generate_assets, GenerationOutcome};
use crate::router::Router;
use crate::services::{InlineImage, Services, SourceImage};
use crate::stages::{extract_motion, gate, synthesize_structure};
use crate::surveyor::{SurveyOutcome, Surveyor};
use crate::util::{elapsed_ms, error_chain_text, map_object, push_unique_warning};

#[derive(Debug, Clone, PartialEq, Eq)]
struct StageModels {
    vision: String,
    code: String,
    image: String,
    router: Option<String>,
}

/// A decoded reference selected for measurement.
struct Reference {
    file_index: usize,
    bytes: Vec<u8>,
    source: Option<SourceImage>,
}

pub struct Pipeline {
    config: PipelineConfig,
    services: Services,
    events: EventWriter,
    registry: ModelRegistry,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, services: Services, events: EventWriter) -> Self {
        Self {
            config,
            services,
            events,
            registry: ModelRegistry::new(None),
        }
    }

    pub fn with_registry(mut self, registry: ModelRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventWriter {
        &self.events
    }

    pub fn run(&self, input: &PipelineInput) -> Result<PipelineResult, PipelineError> {
        let started = Instant::now();
        self.events.note(
            "run_started",
            map_object(json!({
                "files": input.files.len(),
                "has_instructions": input.has_instructions(),
                "has_current_code": input.has_current_code(),
            })),
        );
        match self.execute(input, started) {
            Ok(result) => {
                self.events.note(
                    "run_finished",
                    map_object(json!({
                        "mode": result.strategy.mode.as_str(),
                        "files": result.files.len(),
                        "warnings": result.warnings.len(),
                        "fidelity": result.fidelity,
                        "elapsed_ms": elapsed_ms(started),
                    })),
                );
                Ok(result)
            }
            Err(err) => {
                self.events.note(
                    "run_failed",
                    map_object(json!({
                        "kind": err.kind(),
                        "error": err.to_string(),
                        "elapsed_ms": elapsed_ms(started),
                    })),
                );
                Err(err)
            }
        }
    }

    fn execute(
        &self,
        input: &PipelineInput,
        started: Instant,
    ) -> Result<PipelineResult, PipelineError> {
        let mut warnings: Vec<String> = Vec::new();
        let mut timings = StepTimings::default();
        let models = self.resolve_models(&mut warnings)?;

        self.check_deadline(started, "router")?;
        let router = match (&models.router, &self.services.text) {
            (Some(model), Some(text)) => Router::with_model(text.as_ref(), model),
            _ => Router::heuristic(),
        };
        let (routed, router_ms) = self.timed("router", || router.route(input));
        timings.router = router_ms;
        let strategy = routed?;
        self.events.note(
            "route_selected",
            map_object(json!({
                "mode": strategy.mode.as_str(),
                "measure_pixels": strategy.execution_plan.measure_pixels,
                "extract_physics": strategy.execution_plan.extract_physics,
                "generate_assets": strategy
                    .execution_plan
                    .generate_assets
                    .iter()
                    .map(|request| request.name.as_str())
                    .collect::<Vec<_>>(),
                "stages": strategy.execution_plan.stages,
                "reasoning": strategy.reasoning,
            })),
        );

        self.check_deadline(started, "surveyor")?;
        let references = self.decode_references(input, &strategy, &mut warnings);
        let sources: Vec<SourceImage> = references
            .iter()
            .filter_map(|reference| reference.source.clone())
            .collect();

        let cache = self
            .config
            .survey_cache
            .as_ref()
            .map(|path| Mutex::new(ManifestCache::new(path)));
        let fanned = self.fan_out(input, &strategy, &models, &references, cache.as_ref());
        if let Some(cache) = &cache {
            let flushed = cache
                .lock()
                .map_err(|_| anyhow::anyhow!("survey cache lock poisoned"))
                .and_then(|mut cache| cache.flush());
            if let Err(err) = flushed {
                self.warn(
                    &mut warnings,
                    format!("Survey cache flush failed: {}", error_chain_text(&err, 200)),
                );
            }
        }
        let FanOut {
            surveys,
            generation,
            physics,
        } = fanned?;

        let mut manifests: Vec<VisualManifest> = Vec::new();
        if let Some((outcomes, elapsed)) = surveys {
            timings.surveyor = Some(elapsed);
            for outcome in outcomes {
                for warning in outcome.warnings {
                    self.warn(&mut warnings, warning);
                }
                manifests.push(outcome.manifest);
            }
        }
        let mut generated = AssetMap::new();
        if let Some((outcome, elapsed)) = generation {
            timings.photographer = Some(elapsed);
            for warning in outcome.warnings {
                self.warn(&mut warnings, warning);
            }
            generated = outcome.assets;
        }
        let mut motion: Option<Vec<MotionData>> = None;
        if let Some(((rows, motion_warnings), elapsed)) = physics {
            timings.physicist = Some(elapsed);
            for warning in motion_warnings {
                self.warn(&mut warnings, warning);
            }
            motion = rows;
        }

        self.check_deadline(started, "extraction")?;
        let mut extracted = AssetMap::new();
        if manifests.iter().any(VisualManifest::has_structure) {
            let (outcome, elapsed) = self.timed("extraction", || {
                extract_assets(
                    &manifests,
                    &sources,
                    self.services.cropper.as_ref(),
                    self.config.extraction_concurrency,
                    &self.events,
                )
            });
            timings.extraction = Some(elapsed);
            for warning in outcome.warnings {
                self.warn(&mut warnings, warning);
            }
            extracted = outcome.assets;
        }

        self.check_deadline(started, "architect")?;
        let mut structure = None;
        if let Some(architect) = gate(
            "architect",
            self.config.architect_enabled,
            strategy.execution_plan.stages.architect,
            self.services.architect.as_deref(),
            &self.events,
        ) {
            let ((plan, architect_warnings), elapsed) =
                self.timed("architect", || synthesize_structure(architect, input, &manifests));
            timings.architect = Some(elapsed);
            for warning in architect_warnings {
                self.warn(&mut warnings, warning);
            }
            structure = plan;
        }

        let mut brief = BuildBrief::for_input(&models.code, strategy.mode, input);
        brief.assets = merge_asset_maps(&extracted, &generated);
        brief.structure = structure;
        brief.physics = motion.clone();
        let primary = references.iter().find(|reference| reference.source.is_some());
        if strategy.mode.uses_vision() {
            brief.manifests = manifests.clone();
            brief.reference = primary.and_then(|reference| {
                let file = input.files.get(reference.file_index)?;
                Some(InlineImage::new(reference.bytes.clone(), file.mime_type.clone()))
            });
        }

        self.check_deadline(started, "builder")?;
        let (built, builder_ms) =
            self.timed("builder", || build(self.services.code.as_ref(), &brief));
        timings.builder = builder_ms;
        let built = built?;
        for warning in built.warnings {
            self.warn(&mut warnings, warning);
        }
        let mut files = built.files;
        let mut fidelity = None;

        let healing_target = primary
            .and_then(|reference| reference.source.as_ref())
            .and_then(|source| {
                manifests
                    .iter()
                    .find(|manifest| manifest.file_index == source.file_index)
                    .filter(|manifest| manifest.has_structure())
                    .map(|manifest| (source, manifest.canvas))
            });
        if strategy.execution_plan.stages.healing {
            match (&self.services.renderer, healing_target) {
                (Some(renderer), Some((source, canvas))) => {
                    self.check_deadline(started, "healing")?;
                    let healing = HealingLoop {
                        renderer: renderer.as_ref(),
                        code: self.services.code.as_ref(),
                        reference: &source.image,
                        canvas,
                        max_iterations: self.config.heal_iterations(),
                        target: self.config.target_fidelity,
                        events: &self.events,
                    };
                    let (outcome, elapsed) = self.timed("healing", || healing.run(files, &brief));
                    timings.healing = Some(elapsed);
                    for warning in outcome.warnings {
                        self.warn(&mut warnings, warning);
                    }
                    files = outcome.files;
                    fidelity = outcome.fidelity;
                }
                (None, _) => self.skip("healing", "no renderer configured"),
                (Some(_), None) => self.skip("healing", "no surveyed reference image"),
            }
        }

        Ok(PipelineResult {
            files,
            strategy,
            manifests,
            physics: motion,
            warnings,
            step_timings: timings,
            fidelity,
        })
    }

    /// Resolves one model name per stage. Providers the registry does not
    /// know keep the configured name as-is.
    fn resolve_models(&self, warnings: &mut Vec<String>) -> Result<StageModels, PipelineError> {
        let router = match (&self.config.router_model, &self.services.text) {
            (None, _) => None,
            (Some(_), None) => {
                return Err(PipelineError::Configuration(
                    "a router model is configured but no text service is available".to_string(),
                ));
            }
            (Some(requested), Some(text)) => Some(self.resolve_model(
                Some(requested),
                Capability::Text,
                text.name(),
                warnings,
            )?),
        };
        Ok(StageModels {
            vision: self.resolve_model(
                self.config.vision_model.as_deref(),
                Capability::Vision,
                self.services.vision.name(),
                warnings,
            )?,
            code: self.resolve_model(
                self.config.code_model.as_deref(),
                Capability::Code,
                self.services.code.name(),
                warnings,
            )?,
            image: self.resolve_model(
                self.config.image_model.as_deref(),
                Capability::Image,
                self.services.images.name(),
                warnings,
            )?,
            router,
        })
    }

    fn resolve_model(
        &self,
        requested: Option<&str>,
        capability: Capability,
        provider: &str,
        warnings: &mut Vec<String>,
    ) -> Result<String, PipelineError> {
        if self
            .registry
            .by_capability(capability, Some(provider))
            .is_empty()
        {
            let name = requested
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .unwrap_or(provider);
            return Ok(name.to_string());
        }
        let selection = ModelSelector::new(Some(self.registry.clone())).select(
            requested,
            capability,
            Some(provider),
        )?;
        if let Some(reason) = selection.fallback_reason {
            self.events.note(
                "model_fallback",
                map_object(json!({
                    "capability": capability.as_str(),
                    "requested": selection.requested,
                    "selected": selection.model.name,
                    "reason": reason,
                })),
            );
            self.warn(
                warnings,
                format!("{reason} Using '{}'.", selection.model.name),
            );
        }
        Ok(selection.model.name)
    }

    /// Decodes every file the strategy measures. Non-image files and broken
    /// payloads are skipped with a warning.
    fn decode_references(
        &self,
        input: &PipelineInput,
        strategy: &RoutingStrategy,
        warnings: &mut Vec<String>,
    ) -> Vec<Reference> {
        let mut references = Vec::new();
        for &file_index in &strategy.execution_plan.measure_pixels {
            let Some(file) = input.files.get(file_index) else {
                self.warn(warnings, format!("Reference {file_index} does not exist; skipped."));
                continue;
            };
            if !file.is_image() {
                self.warn(
                    warnings,
                    format!(
                        "Reference '{}' is {}, not an image; skipped measurement.",
                        file.filename, file.mime_type
                    ),
                );
                continue;
            }
            let bytes = match decode_reference(file) {
                Ok(bytes) => bytes,
                Err(err) => {
                    self.warn(warnings, error_chain_text(&err, 300));
                    continue;
                }
            };
            let source = match load_image(&bytes) {
                Ok(image) => Some(SourceImage {
                    file_index,
                    mime_type: file.mime_type.clone(),
                    image,
                }),
                Err(err) => {
                    self.warn(
                        warnings,
                        format!(
                            "Reference '{}' could not be decoded to pixels: {}",
                            file.filename,
                            error_chain_text(&err, 300)
                        ),
                    );
                    None
                }
            };
            references.push(Reference {
                file_index,
                bytes,
                source,
            });
        }
        references
    }

    /// Runs the independent stages concurrently and joins them.
    fn fan_out(
        &self,
        input: &PipelineInput,
        strategy: &RoutingStrategy,
        models: &StageModels,
        references: &[Reference],
        cache: Option<&Mutex<ManifestCache>>,
    ) -> Result<FanOut, PipelineError> {
        let plan = &strategy.execution_plan;
        let physicist = gate(
            "physicist",
            self.config.physicist_enabled,
            plan.stages.physicist && !plan.extract_physics.is_empty(),
            self.services.physicist.as_deref(),
            &self.events,
        );

        thread::scope(|scope| -> Result<FanOut, PipelineError> {
            let surveys = (!references.is_empty()).then(|| {
                scope.spawn(|| {
                    self.timed("surveyor", || {
                        let surveyor = Surveyor::new(
                            self.services.vision.as_ref(),
                            &models.vision,
                            &self.config,
                            &self.events,
                        )
                        .with_cache(cache);
                        bounded_map(references, references.len(), |reference| {
                            let file = &input.files[reference.file_index];
                            surveyor.survey_layout(reference.file_index, file, &reference.bytes)
                        })
                    })
                })
            });
            let generation = (!plan.generate_assets.is_empty()).then(|| {
                scope.spawn(|| {
                    self.timed("photographer", || {
                        generate_assets(
                            &plan.generate_assets,
                            input,
                            self.services.images.as_ref(),
                            &models.image,
                            self.services.store.as_ref(),
                            self.config.generation_concurrency,
                            &self.events,
                        )
                    })
                })
            });
            let physics = physicist.map(|stage| {
                scope.spawn(move || {
                    self.timed("physicist", || extract_motion(stage, input, &plan.extract_physics))
                })
            });

            Ok(FanOut {
                surveys: surveys.map(|handle| join(handle, "surveyor")).transpose()?,
                generation: generation
                    .map(|handle| join(handle, "photographer"))
                    .transpose()?,
                physics: physics.map(|handle| join(handle, "physicist")).transpose()?,
            })
        })
    }

    fn timed<T>(&self, stage: &str, run: impl FnOnce() -> T) -> (T, u64) {
        self.events
            .note("stage_started", map_object(json!({ "stage": stage })));
        let started = Instant::now();
        let output = run();
        let elapsed = elapsed_ms(started);
        self.events.note(
            "stage_finished",
            map_object(json!({ "stage": stage, "elapsed_ms": elapsed })),
        );
        (output, elapsed)
    }

    fn skip(&self, stage: &str, reason: &str) {
        self.events.note(
            "stage_skipped",
            map_object(json!({ "stage": stage, "reason": reason })),
        );
    }

    fn warn(&self, warnings: &mut Vec<String>, message: String) {
        if warnings.contains(&message) {
            return;
        }
        self.events
            .note("warning", map_object(json!({ "message": message })));
        push_unique_warning(warnings, message);
    }

    fn check_deadline(&self, started: Instant, stage: &str) -> Result<(), PipelineError> {
        let Some(limit) = self.config.deadline() else {
            return Ok(());
        };
        if started.elapsed() > limit {
            return Err(PipelineError::DeadlineExceeded {
                stage: stage.to_string(),
                limit_ms: limit.as_millis(),
            });
        }
        Ok(())
    }
}

type Timed<T> = (T, u64);

struct FanOut {
    surveys: Option<Timed<Vec<SurveyOutcome>>>,
    generation: Option<Timed<GenerationOutcome>>,
    physics: Option<Timed<(Option<Vec<MotionData>>, Vec<String>)>>,
}

fn join<T>(handle: thread::ScopedJoinHandle<'_, T>, stage: &str) -> Result<T, PipelineError> {
    handle.join().map_err(|_| PipelineError::Catastrophic {
        stage: stage.to_string(),
        message: "stage worker panicked".to_string(),
    })
}
