use std::path::PathBuf;
use std::time::Duration;

use replica_contracts::manifest::Canvas;
use serde::{Deserialize, Serialize};

use crate::util::{non_empty_env, value_as_f64};

const MAX_HEAL_ITERATIONS_CAP: u32 = 10;
const MAX_CONCURRENCY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub fallback_canvas_width: u32,
    pub fallback_canvas_height: u32,
    /// Upscale references whose shorter side is below this before vision
    /// analysis. `None` disables enhancement.
    pub enhance_min_dimension: Option<u32>,
    pub enhance_max_scale: f64,
    pub max_heal_iterations: u32,
    /// Percentage in 0..=100.
    pub target_fidelity: f64,
    pub extraction_concurrency: usize,
    pub generation_concurrency: usize,
    pub architect_enabled: bool,
    pub physicist_enabled: bool,
    pub deadline_ms: Option<u64>,
    pub vision_model: Option<String>,
    pub code_model: Option<String>,
    pub image_model: Option<String>,
    pub router_model: Option<String>,
    pub asset_dir: Option<PathBuf>,
    pub asset_base_url: Option<String>,
    pub render_command: Option<String>,
    pub survey_cache: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fallback_canvas_width: 1440,
            fallback_canvas_height: 900,
            enhance_min_dimension: Some(1024),
            enhance_max_scale: 4.0,
            max_heal_iterations: 2,
            target_fidelity: 95.0,
            extraction_concurrency: 8,
            generation_concurrency: 1,
            architect_enabled: false,
            physicist_enabled: false,
            deadline_ms: None,
            vision_model: None,
            code_model: None,
            image_model: None,
            router_model: None,
            asset_dir: None,
            asset_base_url: None,
            render_command: None,
            survey_cache: None,
        }
    }
}

impl PipelineConfig {
    /// Defaults overlaid with `REPLICA_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(non_empty_env);
        config
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let number = |key: &str, current: f64, min: f64, max: f64| {
            value_as_f64(lookup(key).as_deref(), current, min, max)
        };

        self.fallback_canvas_width = number(
            "REPLICA_FALLBACK_WIDTH",
            self.fallback_canvas_width as f64,
            1.0,
            16_384.0,
        ) as u32;
        self.fallback_canvas_height = number(
            "REPLICA_FALLBACK_HEIGHT",
            self.fallback_canvas_height as f64,
            1.0,
            16_384.0,
        ) as u32;
        if let Some(raw) = lookup("REPLICA_ENHANCE_MIN_DIMENSION") {
            self.enhance_min_dimension = match raw.trim().parse::<u32>() {
                Ok(0) => None,
                Ok(value) => Some(value.min(8192)),
                Err(_) => self.enhance_min_dimension,
            };
        }
        self.enhance_max_scale = number("REPLICA_ENHANCE_MAX_SCALE", self.enhance_max_scale, 1.0, 8.0);
        self.max_heal_iterations = number(
            "REPLICA_MAX_HEAL_ITERATIONS",
            self.max_heal_iterations as f64,
            0.0,
            MAX_HEAL_ITERATIONS_CAP as f64,
        )
        .round() as u32;
        self.target_fidelity = number("REPLICA_TARGET_FIDELITY", self.target_fidelity, 0.0, 100.0);
        self.extraction_concurrency = number(
            "REPLICA_EXTRACTION_CONCURRENCY",
            self.extraction_concurrency as f64,
            1.0,
            MAX_CONCURRENCY as f64,
        )
        .round() as usize;
        self.generation_concurrency = number(
            "REPLICA_GENERATION_CONCURRENCY",
            self.generation_concurrency as f64,
            1.0,
            MAX_CONCURRENCY as f64,
        )
        .round() as usize;
        if let Some(flag) = lookup("REPLICA_ARCHITECT").as_deref().and_then(parse_flag) {
            self.architect_enabled = flag;
        }
        if let Some(flag) = lookup("REPLICA_PHYSICIST").as_deref().and_then(parse_flag) {
            self.physicist_enabled = flag;
        }
        if let Some(raw) = lookup("REPLICA_DEADLINE_MS") {
            self.deadline_ms = raw.trim().parse::<u64>().ok().filter(|value| *value > 0);
        }

        let text = |key: &str, current: &mut Option<String>| {
            if let Some(value) = lookup(key) {
                *current = Some(value);
            }
        };
        text("REPLICA_VISION_MODEL", &mut self.vision_model);
        text("REPLICA_CODE_MODEL", &mut self.code_model);
        text("REPLICA_IMAGE_MODEL", &mut self.image_model);
        text("REPLICA_ROUTER_MODEL", &mut self.router_model);
        text("REPLICA_ASSET_BASE_URL", &mut self.asset_base_url);
        text("REPLICA_RENDER_COMMAND", &mut self.render_command);
        if let Some(dir) = lookup("REPLICA_ASSET_DIR") {
            self.asset_dir = Some(PathBuf::from(dir));
        }
        if let Some(path) = lookup("REPLICA_SURVEY_CACHE") {
            self.survey_cache = Some(PathBuf::from(path));
        }
    }

    pub fn fallback_canvas(&self) -> Canvas {
        Canvas::fallback(
            self.fallback_canvas_width.max(1),
            self.fallback_canvas_height.max(1),
        )
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }

    pub fn heal_iterations(&self) -> u32 {
        self.max_heal_iterations.min(MAX_HEAL_ITERATIONS_CAP)
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
