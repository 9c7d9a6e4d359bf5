//! Plan store: YAML plan files under `{data_dir}/plans/`.
//!
//! Plans can be referenced by path or by name. A name resolves to
//! `{plans_dir}/{name}.yaml` (or `.yml`).

use std::path::{Path, PathBuf};

use cadence_core::workflow::definition::{parse_plan_yaml, serialize_plan_yaml, WorkflowError};
use cadence_types::plan::ExecutionPlan;

/// Load and validate a plan from a YAML file.
///
/// An empty `name` falls back to the file stem.
pub async fn load_plan(path: &Path) -> Result<ExecutionPlan, WorkflowError> {
    let content = tokio::fs::read_to_string(path).await?;
    let mut plan = parse_plan_yaml(&content)?;
    if plan.name.trim().is_empty() {
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            plan.name = stem.to_string();
        }
    }
    tracing::debug!(path = %path.display(), steps = plan.len(), "loaded plan");
    Ok(plan)
}

/// Named plans stored in one directory.
#[derive(Debug, Clone)]
pub struct PlanStore {
    dir: PathBuf,
}

impl PlanStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Resolve a plan reference: an existing file path wins, otherwise the
    /// reference is looked up by name in the store.
    pub async fn resolve(&self, reference: &str) -> Option<PathBuf> {
        let direct = PathBuf::from(reference);
        if tokio::fs::try_exists(&direct).await.unwrap_or(false) {
            return Some(direct);
        }
        for ext in ["yaml", "yml"] {
            let candidate = self.dir.join(format!("{reference}.{ext}"));
            if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
                return Some(candidate);
            }
        }
        None
    }

    /// Resolve and load a plan by path or name.
    pub async fn load(&self, reference: &str) -> Result<ExecutionPlan, WorkflowError> {
        match self.resolve(reference).await {
            Some(path) => load_plan(&path).await,
            None => Err(WorkflowError::IoError(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!(
                    "plan '{}' not found (looked in {})",
                    reference,
                    self.dir.display()
                ),
            ))),
        }
    }

    /// Save a plan as `{dir}/{plan.name}.yaml`, creating the directory.
    pub async fn save(&self, plan: &ExecutionPlan) -> Result<PathBuf, WorkflowError> {
        if plan.name.trim().is_empty() {
            return Err(WorkflowError::ValidationError(
                "plan name must not be empty".to_string(),
            ));
        }
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(format!("{}.yaml", plan.name));
        tokio::fs::write(&path, serialize_plan_yaml(plan)?).await?;
        Ok(path)
    }

    /// Names of stored plans, sorted. A missing directory is an empty store.
    pub async fn list(&self) -> Result<Vec<String>, WorkflowError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == "yaml" || e == "yml");
            if is_yaml {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::plan::PlanStep;
    use tempfile::TempDir;

    fn sample() -> ExecutionPlan {
        ExecutionPlan::with_steps(
            "digest",
            vec![
                PlanStep::new("fetch", "demo", "echo"),
                PlanStep::new("sum", "demo", "merge").with_depends_on(["fetch"]),
            ],
        )
    }

    #[tokio::test]
    async fn save_then_load_by_name() {
        let tmp = TempDir::new().unwrap();
        let store = PlanStore::new(tmp.path().join("plans"));

        let path = store.save(&sample()).await.unwrap();
        assert!(path.ends_with("digest.yaml"));

        let loaded = store.load("digest").await.unwrap();
        assert_eq!(loaded, sample());
        assert_eq!(store.list().await.unwrap(), vec!["digest".to_string()]);
    }

    #[tokio::test]
    async fn load_by_direct_path_uses_stem_for_missing_name() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("weekly.yml");
        tokio::fs::write(&path, "steps:\n  - id: a\n    agent_type: demo\n    action: echo\n")
            .await
            .unwrap();

        let store = PlanStore::new(tmp.path().join("plans"));
        let plan = store.load(path.to_str().unwrap()).await.unwrap();
        assert_eq!(plan.name, "weekly");
        assert_eq!(plan.len(), 1);
    }

    #[tokio::test]
    async fn missing_plan_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = PlanStore::new(tmp.path());
        let err = store.load("nope").await.unwrap_err();
        assert!(matches!(err, WorkflowError::IoError(ref e) if e.kind() == std::io::ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn invalid_plan_file_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.yaml");
        tokio::fs::write(&path, "steps: []\n").await.unwrap();
        let err = load_plan(&path).await.unwrap_err();
        assert!(matches!(err, WorkflowError::ValidationError(_)));
    }

    #[tokio::test]
    async fn list_missing_dir_is_empty() {
        let tmp = TempDir::new().unwrap();
        let store = PlanStore::new(tmp.path().join("absent"));
        assert!(store.list().await.unwrap().is_empty());
    }
}
