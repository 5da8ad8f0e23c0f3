//! Bounded render, compare and patch loop.
//!
//! Render → Compare → Decide → (Patch → Render) | Stop. The loop performs at
//! most `max_iterations` Builder re-invocations. Any render, compare or
//! rebuild failure halts it and returns the last file set that rendered.

use image::DynamicImage;
use replica_contracts::events::EventWriter;
use replica_contracts::manifest::Canvas;
use replica_contracts::OutputFile;
use serde_json::json;
use similar::{ChangeTag, TextDiff};

use crate::builder::{build, BuildBrief, PatchContext};
use crate::fidelity::compare;
use crate::services::{CodeService, RenderService};
use crate::util::{error_chain_text, map_object, push_unique_warning, truncate_text};

const DIFF_MAX_CHARS: usize = 4_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealingStop {
    Converged,
    IterationCap,
    Halted,
}

impl HealingStop {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Converged => "converged",
            Self::IterationCap => "iteration_cap",
            Self::Halted => "halted",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealingOutcome {
    pub files: Vec<OutputFile>,
    /// Score of the returned files, when they were rendered.
    pub fidelity: Option<f64>,
    pub rebuilds: u32,
    pub stop: HealingStop,
    pub warnings: Vec<String>,
}

pub struct HealingLoop<'a> {
    pub renderer: &'a dyn RenderService,
    pub code: &'a dyn CodeService,
    pub reference: &'a DynamicImage,
    pub canvas: Canvas,
    pub max_iterations: u32,
    pub target: f64,
    pub events: &'a EventWriter,
}

impl HealingLoop<'_> {
    pub fn run(&self, initial: Vec<OutputFile>, brief: &BuildBrief) -> HealingOutcome {
        let mut current = initial;
        let mut last_good = current.clone();
        let mut fidelity: Option<f64> = None;
        let mut rebuilds = 0u32;
        let mut warnings: Vec<String> = Vec::new();

        loop {
            let screenshot = match self.renderer.render(&current, &self.canvas) {
                Ok(image) if image.width() > 0 && image.height() > 0 => image,
                Ok(_) => {
                    return self.halt(
                        last_good,
                        fidelity,
                        rebuilds,
                        warnings,
                        "compare failed: rendered screenshot is empty".to_string(),
                    );
                }
                Err(err) => {
                    return self.halt(
                        last_good,
                        fidelity,
                        rebuilds,
                        warnings,
                        format!("render failed: {}", error_chain_text(&err, 300)),
                    );
                }
            };
            last_good = current.clone();
            let report = compare(self.reference, &screenshot);
            fidelity = Some(report.score);
            let mut payload = map_object(json!({
                "iteration": rebuilds,
                "score": report.score,
                "target": self.target,
                "hotspots": report.hotspots,
            }));

            let stop = if report.passes(self.target) {
                Some(HealingStop::Converged)
            } else if rebuilds >= self.max_iterations {
                Some(HealingStop::IterationCap)
            } else {
                None
            };
            if let Some(stop) = stop {
                payload.insert("decision".to_string(), json!(stop.as_str()));
                self.events.note("healing_iteration", payload);
                self.events.note(
                    "healing_stopped",
                    map_object(json!({
                        "reason": stop.as_str(),
                        "score": report.score,
                        "rebuilds": rebuilds,
                    })),
                );
                return HealingOutcome {
                    files: current,
                    fidelity,
                    rebuilds,
                    stop,
                    warnings,
                };
            }

            let patch = PatchContext {
                iteration: rebuilds + 1,
                score: report.score,
                target: self.target,
                hotspots: report.hotspots,
                previous_files: current.clone(),
            };
            let rebuilt = match build(self.code, &brief.with_patch(patch)) {
                Ok(outcome) => outcome,
                Err(err) => {
                    return self.halt(
                        last_good,
                        fidelity,
                        rebuilds,
                        warnings,
                        format!("rebuild {} failed: {err}", rebuilds + 1),
                    );
                }
            };
            rebuilds += 1;
            let (changed_lines, diff) = files_diff(&current, &rebuilt.files);
            payload.insert("decision".to_string(), json!("patched"));
            payload.insert("changed_lines".to_string(), json!(changed_lines));
            payload.insert("diff".to_string(), json!(diff));
            self.events.note("healing_iteration", payload);
            for warning in rebuilt.warnings {
                push_unique_warning(&mut warnings, warning);
            }
            current = rebuilt.files;
        }
    }

    fn halt(
        &self,
        files: Vec<OutputFile>,
        fidelity: Option<f64>,
        rebuilds: u32,
        mut warnings: Vec<String>,
        reason: String,
    ) -> HealingOutcome {
        self.events.note(
            "healing_stopped",
            map_object(json!({
                "reason": HealingStop::Halted.as_str(),
                "error": reason,
                "rebuilds": rebuilds,
            })),
        );
        warnings.push(format!(
            "Healing halted after {rebuilds} rebuild(s), {reason}; returning the last rendered files."
        ));
        HealingOutcome {
            files,
            fidelity,
            rebuilds,
            stop: HealingStop::Halted,
            warnings,
        }
    }
}

/// Unified line diff between two file sets and the number of changed lines.
fn files_diff(previous: &[OutputFile], next: &[OutputFile]) -> (usize, String) {
    let mut changed = 0usize;
    let mut rendered = String::new();
    let mut paths: Vec<&str> = next.iter().map(|file| file.path.as_str()).collect();
    for file in previous {
        if !paths.contains(&file.path.as_str()) {
            paths.push(&file.path);
        }
    }
    let content = |files: &[OutputFile], path: &str| -> String {
        files
            .iter()
            .find(|file| file.path == path)
            .map(|file| file.content.clone())
            .unwrap_or_default()
    };
    for path in paths {
        let before = content(previous, path);
        let after = content(next, path);
        let diff = TextDiff::from_lines(&before, &after);
        let file_changes = diff
            .iter_all_changes()
            .filter(|change| change.tag() != ChangeTag::Equal)
            .count();
        if file_changes == 0 {
            continue;
        }
        changed += file_changes;
        rendered.push_str(&diff.unified_diff().header(path, path).to_string());
    }
    (changed, truncate_text(&rendered, DIFF_MAX_CHARS))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use anyhow::{anyhow, bail};
    use image::{DynamicImage, Rgb, RgbImage};
    use replica_contracts::events::{drain_types, EventWriter};
    use replica_contracts::manifest::Canvas;
    use replica_contracts::{OutputFile, PipelineInput, RouteMode};

    use super::{files_diff, HealingLoop, HealingStop};
    use crate::builder::BuildBrief;
    use crate::services::{CodeService, RenderService};

    fn split(inverted: bool) -> DynamicImage {
        let (left, right) = if inverted {
            ([0, 0, 0], [255, 255, 255])
        } else {
            ([255, 255, 255], [0, 0, 0])
        };
        DynamicImage::ImageRgb8(RgbImage::from_fn(120, 80, |x, _| {
            if x < 60 {
                Rgb(left)
            } else {
                Rgb(right)
            }
        }))
    }

    /// Plays back a script of screenshots; once exhausted keeps returning
    /// the last entry.
    struct ScriptedRenderer {
        script: Mutex<VecDeque<Result<DynamicImage, String>>>,
        last: Mutex<Option<Result<DynamicImage, String>>>,
        calls: AtomicUsize,
    }

    impl ScriptedRenderer {
        fn new(script: Vec<Result<DynamicImage, String>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(None),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl RenderService for ScriptedRenderer {
        fn name(&self) -> &str {
            "scripted"
        }

        fn render(&self, _files: &[OutputFile], _canvas: &Canvas) -> anyhow::Result<DynamicImage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut last = self.last.lock().expect("lock");
            if let Some(next) = self.script.lock().expect("lock").pop_front() {
                *last = Some(next);
            }
            match last.clone() {
                Some(Ok(image)) => Ok(image),
                Some(Err(err)) => Err(anyhow!(err)),
                None => bail!("empty script"),
            }
        }
    }

    struct CountingCode {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CodeService for CountingCode {
        fn name(&self) -> &str {
            "counting"
        }

        fn generate(&self, brief: &BuildBrief) -> anyhow::Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                bail!("model overloaded");
            }
            let patch = brief.patch.as_ref().expect("patch context on rebuild");
            assert_eq!(patch.iteration as usize, call);
            assert!(!patch.hotspots.is_empty());
            Ok(format!(
                "{{\"files\":[{{\"path\":\"index.html\",\"content\":\"v{call}\"}}]}}"
            ))
        }
    }

    fn brief() -> BuildBrief {
        BuildBrief::for_input("m", RouteMode::Replicate, &PipelineInput::default())
    }

    fn initial() -> Vec<OutputFile> {
        vec![OutputFile::new("index.html", "v0")]
    }

    fn run_loop(
        renderer: &ScriptedRenderer,
        code: &CountingCode,
        max_iterations: u32,
        events: &EventWriter,
    ) -> super::HealingOutcome {
        let reference = split(false);
        HealingLoop {
            renderer,
            code,
            reference: &reference,
            canvas: Canvas::measured(120, 80),
            max_iterations,
            target: 95.0,
            events,
        }
        .run(initial(), &brief())
    }

    #[test]
    fn stops_at_the_iteration_cap() {
        let renderer = ScriptedRenderer::new(vec![Ok(split(true))]);
        let code = CountingCode {
            calls: AtomicUsize::new(0),
            fail: false,
        };
        let (events, rx) = EventWriter::channel("run");
        let outcome = run_loop(&renderer, &code, 2, &events);
        assert_eq!(outcome.stop, HealingStop::IterationCap);
        assert_eq!(outcome.rebuilds, 2);
        assert_eq!(code.calls.load(Ordering::SeqCst), 2);
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.files[0].content, "v2");
        assert!(outcome.fidelity.unwrap_or(100.0) < 95.0);
        assert_eq!(
            drain_types(&rx),
            vec![
                "healing_iteration",
                "healing_iteration",
                "healing_iteration",
                "healing_stopped"
            ]
        );
    }

    #[test]
    fn converged_output_is_returned_without_rebuilds() {
        let renderer = ScriptedRenderer::new(vec![Ok(split(false))]);
        let code = CountingCode {
            calls: AtomicUsize::new(0),
            fail: false,
        };
        let outcome = run_loop(&renderer, &code, 2, &EventWriter::new("run"));
        assert_eq!(outcome.stop, HealingStop::Converged);
        assert_eq!(outcome.rebuilds, 0);
        assert_eq!(outcome.fidelity, Some(100.0));
        assert_eq!(outcome.files, initial());
    }

    #[test]
    fn zero_iterations_renders_once_and_never_rebuilds() {
        let renderer = ScriptedRenderer::new(vec![Ok(split(true))]);
        let code = CountingCode {
            calls: AtomicUsize::new(0),
            fail: false,
        };
        let outcome = run_loop(&renderer, &code, 0, &EventWriter::new("run"));
        assert_eq!(outcome.stop, HealingStop::IterationCap);
        assert_eq!(code.calls.load(Ordering::SeqCst), 0);
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn render_failure_returns_last_rendered_files() {
        let renderer = ScriptedRenderer::new(vec![
            Ok(split(true)),
            Err("chromium crashed".to_string()),
        ]);
        let code = CountingCode {
            calls: AtomicUsize::new(0),
            fail: false,
        };
        let outcome = run_loop(&renderer, &code, 3, &EventWriter::new("run"));
        assert_eq!(outcome.stop, HealingStop::Halted);
        assert_eq!(code.calls.load(Ordering::SeqCst), 1);
        // v1 was built but never rendered.
        assert_eq!(outcome.files, initial());
        assert!(outcome.fidelity.is_some());
        assert!(outcome.warnings[0].contains("chromium crashed"));
    }

    #[test]
    fn rebuild_failure_halts_with_a_warning() {
        let renderer = ScriptedRenderer::new(vec![Ok(split(true))]);
        let code = CountingCode {
            calls: AtomicUsize::new(0),
            fail: true,
        };
        let outcome = run_loop(&renderer, &code, 2, &EventWriter::new("run"));
        assert_eq!(outcome.stop, HealingStop::Halted);
        assert_eq!(outcome.rebuilds, 0);
        assert_eq!(outcome.files, initial());
        assert!(outcome.warnings[0].contains("model overloaded"));
    }

    #[test]
    fn diff_counts_changed_lines() {
        let before = vec![OutputFile::new("index.html", "a\nb\n")];
        let after = vec![
            OutputFile::new("index.html", "a\nc\n"),
            OutputFile::new("app.css", "x\n"),
        ];
        let (changed, diff) = files_diff(&before, &after);
        assert_eq!(changed, 3);
        assert!(diff.contains("-b"));
        assert!(diff.contains("+c"));
        assert!(diff.contains("+++ app.css"));
        assert_eq!(files_diff(&before, &before).0, 0);
    }
}
