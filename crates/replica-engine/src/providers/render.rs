use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use image::DynamicImage;
use replica_contracts::manifest::Canvas;
use replica_contracts::OutputFile;

use crate::imaging::load_image;
use crate::services::RenderService;
use crate::util::truncate_text;

/// Renders by shelling out to a headless screenshot command such as
/// `chromium --headless --screenshot={output} --window-size={width},{height} file://{input}`.
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    template: Vec<String>,
}

impl CommandRenderer {
    pub fn new(command: &str) -> Result<Self> {
        let template = shell_words::split(command)
            .with_context(|| format!("invalid render command: {command}"))?;
        if template.is_empty() {
            bail!("render command is empty");
        }
        Ok(Self { template })
    }

    fn argv(&self, input: &Path, output: &Path, canvas: &Canvas) -> Vec<String> {
        self.template
            .iter()
            .map(|token| {
                token
                    .replace("{input}", &input.display().to_string())
                    .replace("{output}", &output.display().to_string())
                    .replace("{width}", &canvas.width.to_string())
                    .replace("{height}", &canvas.height.to_string())
            })
            .collect()
    }
}

impl RenderService for CommandRenderer {
    fn name(&self) -> &str {
        "command"
    }

    fn render(&self, files: &[OutputFile], canvas: &Canvas) -> Result<DynamicImage> {
        let scratch = tempfile::tempdir().context("render scratch dir")?;
        let mut entry: Option<PathBuf> = None;
        for file in files {
            let relative = safe_relative(&file.path)
                .with_context(|| format!("refusing to render outside scratch dir: {}", file.path))?;
            let path = scratch.path().join(relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, &file.content)
                .with_context(|| format!("failed to write {}", path.display()))?;
            if entry.is_none() && file.is_html() {
                entry = Some(path);
            }
        }
        let Some(input) = entry else {
            bail!("no HTML entry file to render");
        };
        let output = scratch.path().join("screenshot.png");

        let argv = self.argv(&input, &output, canvas);
        let result = Command::new(&argv[0])
            .args(&argv[1..])
            .current_dir(scratch.path())
            .output()
            .with_context(|| format!("failed to launch render command '{}'", argv[0]))?;
        if !result.status.success() {
            bail!(
                "render command exited with {}: {}",
                result.status,
                truncate_text(String::from_utf8_lossy(&result.stderr).trim(), 512)
            );
        }
        let bytes = fs::read(&output)
            .with_context(|| format!("render command produced no {}", output.display()))?;
        load_image(&bytes)
    }
}

fn safe_relative(path: &str) -> Option<PathBuf> {
    let candidate = Path::new(path.trim());
    let mut out = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!out.as_os_str().is_empty()).then_some(out)
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use replica_contracts::manifest::Canvas;

    use super::{safe_relative, CommandRenderer};

    #[test]
    fn placeholders_are_substituted_per_token() -> anyhow::Result<()> {
        let renderer = CommandRenderer::new("shot --size '{width}x{height}' {input} -o {output}")?;
        let argv = renderer.argv(
            Path::new("/tmp/a/index.html"),
            Path::new("/tmp/a/out.png"),
            &Canvas::measured(1280, 720),
        );
        assert_eq!(
            argv,
            vec!["shot", "--size", "1280x720", "/tmp/a/index.html", "-o", "/tmp/a/out.png"]
        );
        assert!(CommandRenderer::new("   ").is_err());
        assert!(CommandRenderer::new("shot 'unterminated").is_err());
        Ok(())
    }

    #[test]
    fn output_paths_stay_inside_scratch_dir() {
        assert_eq!(safe_relative("src/index.html"), Some(PathBuf::from("src/index.html")));
        assert_eq!(safe_relative("./index.html"), Some(PathBuf::from("index.html")));
        assert_eq!(safe_relative("../escape.html"), None);
        assert_eq!(safe_relative("/etc/passwd"), None);
        assert_eq!(safe_relative(""), None);
    }
}
