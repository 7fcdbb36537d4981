//! Task context model: the mutable, versioned state of one unit of agent work.
//!
//! # 構造
//! - `ContextSnapshot`: 可変フィールドの完全なコピー（version / checkpoint に保存される）
//! - `TaskContext`: キー + version + タイムスタンプ + `ContextSnapshot`
//! - `TaskContextPatch`: 部分更新（指定したフィールドだけ変わる）

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::ContextError;
use super::ids::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Blocked,
    Archived,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the agent was doing at the moment of the last write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImmediateContext {
    pub working_on: String,
    pub last_action: String,
    pub next_step: String,
    #[serde(default)]
    pub blockers: Vec<String>,
}

impl ImmediateContext {
    pub fn is_empty(&self) -> bool {
        self.working_on.is_empty()
            && self.last_action.is_empty()
            && self.next_step.is_empty()
            && self.blockers.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TechnicalDecision {
    pub decision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

impl TechnicalDecision {
    pub fn new(decision: impl Into<String>) -> Self {
        Self {
            decision: decision.into(),
            rationale: None,
        }
    }

    pub fn because(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }
}

/// The mutable fields of a TaskContext, materialized in full.
///
/// Version history and checkpoints store this value, never a diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnapshot {
    pub name: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub current_phase: String,
    #[serde(default)]
    pub iteration: u64,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub locked_elements: BTreeSet<String>,
    #[serde(default)]
    pub immediate_context: ImmediateContext,
    #[serde(default)]
    pub key_files: Vec<String>,
    #[serde(default)]
    pub technical_decisions: Vec<TechnicalDecision>,
    #[serde(default)]
    pub resume_prompt: String,
}

impl ContextSnapshot {
    /// A fresh `pending` context with only a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: TaskStatus::Pending,
            current_phase: String::new(),
            iteration: 0,
            score: None,
            locked_elements: BTreeSet::new(),
            immediate_context: ImmediateContext::default(),
            key_files: Vec::new(),
            technical_decisions: Vec::new(),
            resume_prompt: String::new(),
        }
    }

    pub fn validate(&self) -> Result<(), ContextError> {
        if self.name.trim().is_empty() {
            return Err(ContextError::Validation("task name must not be empty".into()));
        }
        validate_score(self.score)
    }
}

/// Current state of a task: the authoritative row of `task_contexts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskContext {
    pub task_id: TaskId,
    pub version: u64,
    #[serde(flatten)]
    pub fields: ContextSnapshot,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskContext {
    pub fn new(task_id: TaskId, fields: ContextSnapshot, now: DateTime<Utc>) -> Self {
        Self {
            task_id,
            version: 1,
            fields,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        self.fields.clone()
    }
}

/// Names of the mutable fields; used for significance checks and audit payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextField {
    Name,
    Status,
    CurrentPhase,
    Iteration,
    Score,
    LockedElements,
    ImmediateContext,
    KeyFiles,
    TechnicalDecisions,
    ResumePrompt,
}

impl ContextField {
    pub fn as_str(self) -> &'static str {
        match self {
            ContextField::Name => "name",
            ContextField::Status => "status",
            ContextField::CurrentPhase => "current_phase",
            ContextField::Iteration => "iteration",
            ContextField::Score => "score",
            ContextField::LockedElements => "locked_elements",
            ContextField::ImmediateContext => "immediate_context",
            ContextField::KeyFiles => "key_files",
            ContextField::TechnicalDecisions => "technical_decisions",
            ContextField::ResumePrompt => "resume_prompt",
        }
    }
}

impl fmt::Display for ContextField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Partial update of a TaskContext.
///
/// `None` は「変更しない」。`score` だけは `Some(None)` でクリアできる。
/// `append_decisions` は既存の technical decisions の末尾に追加される。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskContextPatch {
    pub name: Option<String>,
    pub status: Option<TaskStatus>,
    pub current_phase: Option<String>,
    pub iteration: Option<u64>,
    pub score: Option<Option<f64>>,
    pub locked_elements: Option<BTreeSet<String>>,
    pub immediate_context: Option<ImmediateContext>,
    pub key_files: Option<Vec<String>>,
    pub technical_decisions: Option<Vec<TechnicalDecision>>,
    pub append_decisions: Vec<TechnicalDecision>,
    pub resume_prompt: Option<String>,
}

impl TaskContextPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn current_phase(mut self, phase: impl Into<String>) -> Self {
        self.current_phase = Some(phase.into());
        self
    }

    pub fn iteration(mut self, iteration: u64) -> Self {
        self.iteration = Some(iteration);
        self
    }

    pub fn score(mut self, score: Option<f64>) -> Self {
        self.score = Some(score);
        self
    }

    pub fn locked_elements<I, S>(mut self, elements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.locked_elements = Some(elements.into_iter().map(Into::into).collect());
        self
    }

    pub fn immediate_context(mut self, immediate: ImmediateContext) -> Self {
        self.immediate_context = Some(immediate);
        self
    }

    pub fn key_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_files = Some(files.into_iter().map(Into::into).collect());
        self
    }

    pub fn append_decision(mut self, decision: TechnicalDecision) -> Self {
        self.append_decisions.push(decision);
        self
    }

    pub fn resume_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.resume_prompt = Some(prompt.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields().is_empty()
    }

    /// Fields this patch supplies.
    pub fn fields(&self) -> BTreeSet<ContextField> {
        let mut fields = BTreeSet::new();
        if self.name.is_some() {
            fields.insert(ContextField::Name);
        }
        if self.status.is_some() {
            fields.insert(ContextField::Status);
        }
        if self.current_phase.is_some() {
            fields.insert(ContextField::CurrentPhase);
        }
        if self.iteration.is_some() {
            fields.insert(ContextField::Iteration);
        }
        if self.score.is_some() {
            fields.insert(ContextField::Score);
        }
        if self.locked_elements.is_some() {
            fields.insert(ContextField::LockedElements);
        }
        if self.immediate_context.is_some() {
            fields.insert(ContextField::ImmediateContext);
        }
        if self.key_files.is_some() {
            fields.insert(ContextField::KeyFiles);
        }
        if self.technical_decisions.is_some() || !self.append_decisions.is_empty() {
            fields.insert(ContextField::TechnicalDecisions);
        }
        if self.resume_prompt.is_some() {
            fields.insert(ContextField::ResumePrompt);
        }
        fields
    }

    pub fn validate(&self) -> Result<(), ContextError> {
        if let Some(name) = &self.name
            && name.trim().is_empty()
        {
            return Err(ContextError::Validation("task name must not be empty".into()));
        }
        if let Some(score) = self.score {
            validate_score(score)?;
        }
        Ok(())
    }

    /// Merge into `target`. Omitted fields keep their prior value.
    pub fn apply_to(self, target: &mut ContextSnapshot) {
        if let Some(name) = self.name {
            target.name = name;
        }
        if let Some(status) = self.status {
            target.status = status;
        }
        if let Some(phase) = self.current_phase {
            target.current_phase = phase;
        }
        if let Some(iteration) = self.iteration {
            target.iteration = iteration;
        }
        if let Some(score) = self.score {
            target.score = score;
        }
        if let Some(locked) = self.locked_elements {
            target.locked_elements = locked;
        }
        if let Some(immediate) = self.immediate_context {
            target.immediate_context = immediate;
        }
        if let Some(files) = self.key_files {
            target.key_files = files;
        }
        if let Some(decisions) = self.technical_decisions {
            target.technical_decisions = decisions;
        }
        target.technical_decisions.extend(self.append_decisions);
        if let Some(prompt) = self.resume_prompt {
            target.resume_prompt = prompt;
        }
    }
}

/// A snapshot converts into a patch that overwrites every mutable field (restore).
impl From<ContextSnapshot> for TaskContextPatch {
    fn from(snapshot: ContextSnapshot) -> Self {
        Self {
            name: Some(snapshot.name),
            status: Some(snapshot.status),
            current_phase: Some(snapshot.current_phase),
            iteration: Some(snapshot.iteration),
            score: Some(snapshot.score),
            locked_elements: Some(snapshot.locked_elements),
            immediate_context: Some(snapshot.immediate_context),
            key_files: Some(snapshot.key_files),
            technical_decisions: Some(snapshot.technical_decisions),
            append_decisions: Vec::new(),
            resume_prompt: Some(snapshot.resume_prompt),
        }
    }
}

fn validate_score(score: Option<f64>) -> Result<(), ContextError> {
    match score {
        Some(value) if !value.is_finite() => Err(ContextError::Validation(format!(
            "score must be a finite number, got {value}"
        ))),
        _ => Ok(()),
    }
}

/// Project-scoped singleton shared by every task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalContext {
    #[serde(default)]
    pub hard_rules: Vec<String>,
    #[serde(default)]
    pub tech_stack: Vec<String>,
    #[serde(default)]
    pub key_paths: BTreeMap<String, String>,
    #[serde(default)]
    pub services: BTreeMap<String, String>,
    #[serde(default)]
    pub active_task_id: Option<TaskId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalContextPatch {
    pub hard_rules: Option<Vec<String>>,
    pub tech_stack: Option<Vec<String>>,
    pub key_paths: Option<BTreeMap<String, String>>,
    pub services: Option<BTreeMap<String, String>>,
    pub active_task_id: Option<Option<TaskId>>,
}

impl GlobalContextPatch {
    pub fn is_empty(&self) -> bool {
        self.hard_rules.is_none()
            && self.tech_stack.is_none()
            && self.key_paths.is_none()
            && self.services.is_none()
            && self.active_task_id.is_none()
    }

    pub fn apply_to(self, target: &mut GlobalContext) {
        if let Some(rules) = self.hard_rules {
            target.hard_rules = rules;
        }
        if let Some(stack) = self.tech_stack {
            target.tech_stack = stack;
        }
        if let Some(paths) = self.key_paths {
            target.key_paths = paths;
        }
        if let Some(services) = self.services {
            target.services = services;
        }
        if let Some(active) = self.active_task_id {
            target.active_task_id = active;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> ContextSnapshot {
        let mut s = ContextSnapshot::named("migrate auth");
        s.status = TaskStatus::InProgress;
        s.iteration = 2;
        s.score = Some(0.5);
        s.key_files = vec!["src/auth.rs".into()];
        s.technical_decisions = vec![TechnicalDecision::new("use argon2")];
        s
    }

    #[test]
    fn patch_changes_only_supplied_fields() {
        let mut target = snapshot();
        TaskContextPatch::new()
            .current_phase("testing")
            .append_decision(TechnicalDecision::new("drop md5").because("weak"))
            .apply_to(&mut target);

        assert_eq!(target.current_phase, "testing");
        assert_eq!(target.status, TaskStatus::InProgress);
        assert_eq!(target.iteration, 2);
        assert_eq!(target.technical_decisions.len(), 2);
        assert_eq!(target.technical_decisions[1].rationale.as_deref(), Some("weak"));
    }

    #[test]
    fn patch_reports_supplied_fields() {
        let patch = TaskContextPatch::new()
            .status(TaskStatus::Blocked)
            .append_decision(TechnicalDecision::new("x"));
        let fields: Vec<_> = patch.fields().into_iter().collect();
        assert_eq!(fields, vec![ContextField::Status, ContextField::TechnicalDecisions]);
        assert!(TaskContextPatch::new().is_empty());
    }

    #[test]
    fn score_can_be_cleared() {
        let mut target = snapshot();
        TaskContextPatch::new().score(None).apply_to(&mut target);
        assert_eq!(target.score, None);
    }

    #[test]
    fn snapshot_patch_restores_every_field() {
        let original = snapshot();
        let mut drifted = snapshot();
        drifted.status = TaskStatus::Completed;
        drifted.score = None;
        drifted.iteration = 9;
        drifted.technical_decisions.push(TechnicalDecision::new("later"));

        TaskContextPatch::from(original.clone()).apply_to(&mut drifted);
        assert_eq!(drifted, original);
    }

    #[test]
    fn validation_rejects_blank_name_and_nan_score() {
        assert!(ContextSnapshot::named("  ").validate().is_err());
        let patch = TaskContextPatch::new().score(Some(f64::NAN));
        assert!(patch.validate().is_err());
    }

    #[test]
    fn task_context_serializes_flat_camel_case() {
        let ctx = TaskContext::new(TaskId::new("T1").unwrap(), snapshot(), Utc::now());
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["taskId"], "T1");
        assert_eq!(json["status"], "in_progress");
        assert_eq!(json["keyFiles"][0], "src/auth.rs");
        assert_eq!(json["version"], 1);
    }

    #[test]
    fn global_patch_merges() {
        let mut global = GlobalContext::default();
        GlobalContextPatch {
            hard_rules: Some(vec!["no force push".into()]),
            active_task_id: Some(Some(TaskId::new("T1").unwrap())),
            ..Default::default()
        }
        .apply_to(&mut global);
        assert_eq!(global.hard_rules, vec!["no force push".to_string()]);
        assert_eq!(global.active_task_id.unwrap().as_str(), "T1");
    }
}
