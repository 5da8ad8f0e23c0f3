use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::result::{PipelineResult, StepTimings};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub mode: String,
    pub total_files: u64,
    pub total_manifests: u64,
    pub warnings: Vec<String>,
    pub step_timings: StepTimings,
    pub fidelity: Option<f64>,
}

impl RunSummary {
    pub fn from_result(run_id: &str, started_at: &str, result: &PipelineResult) -> Self {
        Self {
            run_id: run_id.to_string(),
            started_at: started_at.to_string(),
            finished_at: now_utc_iso(),
            mode: result.strategy.mode.as_str().to_string(),
            total_files: result.files.len() as u64,
            total_manifests: result.manifests.len() as u64,
            warnings: result.warnings.clone(),
            step_timings: result.step_timings,
            fidelity: result.fidelity,
        }
    }
}

pub fn write_summary(
    path: &Path,
    summary: &RunSummary,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let mut payload = match serde_json::to_value(summary)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    payload.insert("ts".to_string(), Value::String(now_utc_iso()));
    if let Some(extra) = extra {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{write_summary, RunSummary};
    use crate::result::StepTimings;

    #[test]
    fn write_summary_generates_expected_payload() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("out").join("summary.json");

        let summary = RunSummary {
            run_id: "run-123".to_string(),
            started_at: "2026-02-19T00:00:00+00:00".to_string(),
            finished_at: "2026-02-19T00:10:00+00:00".to_string(),
            mode: "REPLICATE".to_string(),
            total_files: 2,
            total_manifests: 1,
            warnings: vec!["Asset generation failed for 'hero'".to_string()],
            step_timings: StepTimings {
                router: 1,
                surveyor: Some(20),
                builder: 30,
                ..StepTimings::default()
            },
            fidelity: Some(96.5),
        };
        let mut extra = Map::new();
        extra.insert("out_dir".to_string(), Value::String("/tmp/out".to_string()));
        write_summary(&path, &summary, Some(&extra))?;

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        assert_eq!(parsed["run_id"], json!("run-123"));
        assert_eq!(parsed["total_files"], json!(2));
        assert_eq!(parsed["step_timings"]["surveyor"], json!(20));
        assert_eq!(parsed["fidelity"], json!(96.5));
        assert_eq!(parsed["out_dir"], json!("/tmp/out"));
        assert!(parsed.get("ts").and_then(Value::as_str).is_some());
        Ok(())
    }
}
