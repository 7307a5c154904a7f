//! The supervisor: a fixed navigate → code → analyze pipeline over the
//! delegation adapters, closed by a report composed by the supervisor model.
//!
//! Stage order is enforced here, not left to the model. The model is asked
//! for two things only: picking the data file when the coder produced
//! several, and writing the final report.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::sync::mpsc;

use super::delegation::{self, is_error_marker, DelegationAdapter, DelegationRequest};
use super::{prompts, AgentRole};
use crate::artifacts::{find_paths, ArtifactKind};
use crate::blueprint::{self, BlueprintReport};
use crate::llm::{ChatMessage, ModelHandle, Role};
use crate::stream::{self, EventSink, StreamEvent};
use crate::threads::{ThreadId, ThreadStore};

/// Stage output shown to the report model is cut to this many chars.
const REPORT_EXCERPT_CHARS: usize = 4000;

/// What happened in one pipeline stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub role: AgentRole,
    pub attempts: usize,
    pub succeeded: bool,
    /// Last text the worker returned (or the error marker).
    pub output: String,
    /// Why the last attempt was rejected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of one supervisor turn.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub stages: Vec<StageRecord>,
    /// Every artifact path the workers reported, data files first.
    pub artifacts: Vec<String>,
    /// Validation findings for the navigator's Blueprint.
    pub blueprint_issues: Vec<String>,
    pub final_text: String,
    /// All configured stages succeeded.
    pub completed: bool,
}

enum Stage {
    Navigate,
    Code { blueprint: String },
    Analyze { data_files: Vec<String> },
    Report,
    Failed(AgentRole),
}

/// Owns the worker adapters and drives them in order.
pub struct SupervisorController {
    model: ModelHandle,
    navigator: DelegationAdapter,
    coder: DelegationAdapter,
    /// `None` runs the reduced collect-only pipeline.
    analyst: Option<DelegationAdapter>,
    threads: ThreadStore,
    artifact_dir: PathBuf,
    stage_attempts: usize,
}

impl SupervisorController {
    pub fn new(
        model: ModelHandle,
        navigator: DelegationAdapter,
        coder: DelegationAdapter,
        analyst: Option<DelegationAdapter>,
        artifact_dir: impl Into<PathBuf>,
        stage_attempts: usize,
    ) -> Self {
        Self {
            model,
            navigator,
            coder,
            analyst,
            threads: ThreadStore::new(),
            artifact_dir: artifact_dir.into(),
            stage_attempts: stage_attempts.max(1),
        }
    }

    pub fn threads(&self) -> &ThreadStore {
        &self.threads
    }

    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    /// The adapters in pipeline order.
    pub fn adapters(&self) -> Vec<&DelegationAdapter> {
        let mut out = vec![&self.navigator, &self.coder];
        out.extend(self.analyst.as_ref());
        out
    }

    /// Forget a conversation here and in every worker.
    pub async fn reset(&self, thread_id: &ThreadId) -> bool {
        let mut existed = self.threads.reset(thread_id).await;
        for adapter in self.adapters() {
            existed |= adapter.worker().threads().reset(thread_id).await;
        }
        existed
    }

    pub async fn run(&self, thread_id: &ThreadId, user_request: &str) -> PipelineReport {
        self.run_streaming(thread_id, user_request, None).await
    }

    /// Run the pipeline for `user_request`. Delegations are reported as
    /// tool events and the final report streams as tokens.
    pub async fn run_streaming(
        &self,
        thread_id: &ThreadId,
        user_request: &str,
        events: Option<EventSink>,
    ) -> PipelineReport {
        let _turn = self.threads.lock_turn(thread_id).await;
        let events = events.as_ref();

        if user_request.trim().is_empty() {
            let final_text = self
                .threads
                .history(thread_id)
                .await
                .into_iter()
                .rev()
                .find(|m| m.role == Role::Assistant)
                .and_then(|m| m.content)
                .unwrap_or_default();
            return PipelineReport {
                stages: Vec::new(),
                artifacts: Vec::new(),
                blueprint_issues: Vec::new(),
                final_text,
                completed: false,
            };
        }

        self.threads
            .append(thread_id, ChatMessage::user(user_request))
            .await;
        tracing::info!(thread = %thread_id, "Supervisor pipeline started");

        let mut stages: Vec<StageRecord> = Vec::new();
        let mut data_paths: Vec<String> = Vec::new();
        let mut image_paths: Vec<String> = Vec::new();
        let mut blueprint_issues: Vec<String> = Vec::new();

        let mut stage = Stage::Navigate;
        let failed = loop {
            stage = match stage {
                Stage::Navigate => {
                    let (record, report) = self
                        .run_stage(
                            &self.navigator,
                            thread_id,
                            events,
                            |feedback| DelegationRequest::Navigate {
                                user_request: with_feedback(user_request, feedback),
                            },
                            accept_blueprint,
                        )
                        .await;
                    let next = match report {
                        Some(report) => {
                            if !report.is_clean() {
                                tracing::warn!(
                                    thread = %thread_id,
                                    "Blueprint has issues, continuing:\n{}",
                                    report.issue_list()
                                );
                            }
                            blueprint_issues = report.issues.iter().map(|i| i.to_string()).collect();
                            Stage::Code {
                                blueprint: record.output.clone(),
                            }
                        }
                        None => Stage::Failed(AgentRole::Navigator),
                    };
                    stages.push(record);
                    next
                }
                Stage::Code { blueprint } => {
                    let dir = self.artifact_dir.clone();
                    let (record, found) = self
                        .run_stage(
                            &self.coder,
                            thread_id,
                            events,
                            |feedback| DelegationRequest::Code {
                                blueprint: blueprint.clone(),
                                user_request: Some(with_feedback(user_request, feedback)),
                                blueprint_issues: blueprint_issues.clone(),
                            },
                            |text| accept_data_files(text, &dir),
                        )
                        .await;
                    let next = match found {
                        Some((data, images)) => {
                            merge(&mut data_paths, data.clone());
                            merge(&mut image_paths, images);
                            if self.analyst.is_some() {
                                Stage::Analyze { data_files: data }
                            } else {
                                Stage::Report
                            }
                        }
                        None => Stage::Failed(AgentRole::Coder),
                    };
                    stages.push(record);
                    next
                }
                Stage::Analyze { data_files } => {
                    let Some(analyst) = self.analyst.as_ref() else {
                        break None;
                    };
                    let data_file_path = self.choose_data_file(user_request, &data_files).await;
                    let dir = self.artifact_dir.clone();
                    let (record, found) = self
                        .run_stage(
                            analyst,
                            thread_id,
                            events,
                            |feedback| DelegationRequest::Analyze {
                                data_file_path: data_file_path.clone(),
                                context: feedback.map(correction),
                            },
                            |text| accept_analysis(text, &dir),
                        )
                        .await;
                    let next = match found {
                        Some(images) => {
                            merge(&mut image_paths, images);
                            Stage::Report
                        }
                        None => Stage::Failed(AgentRole::Analyst),
                    };
                    stages.push(record);
                    next
                }
                Stage::Report => break None,
                Stage::Failed(role) => break Some(role),
            };
        };

        let mut artifacts = data_paths;
        merge(&mut artifacts, image_paths);

        let final_text = match failed {
            Some(role) => {
                let text = failure_report(user_request, &stages, &artifacts, role);
                stream::emit(events, StreamEvent::token(text.clone())).await;
                text
            }
            None => {
                self.compose_report(user_request, &stages, &artifacts, &blueprint_issues, events)
                    .await
            }
        };

        self.threads
            .append(thread_id, ChatMessage::assistant(final_text.clone()))
            .await;
        tracing::info!(
            thread = %thread_id,
            completed = failed.is_none(),
            artifacts = artifacts.len(),
            "Supervisor pipeline finished"
        );

        PipelineReport {
            stages,
            artifacts,
            blueprint_issues,
            final_text,
            completed: failed.is_none(),
        }
    }

    /// Delegate until `accept` takes the answer or attempts run out. A
    /// rejected answer is explained to the worker on the next attempt.
    async fn run_stage<T>(
        &self,
        adapter: &DelegationAdapter,
        thread_id: &ThreadId,
        events: Option<&EventSink>,
        request: impl Fn(Option<&str>) -> DelegationRequest,
        accept: impl Fn(&str) -> Result<T, String>,
    ) -> (StageRecord, Option<T>) {
        let role = adapter.role();
        let mut feedback: Option<String> = None;
        let mut error: Option<String> = None;
        let mut output = String::new();

        for attempt in 1..=self.stage_attempts {
            let outcome = adapter
                .delegate(&request(feedback.as_deref()), thread_id, events.cloned())
                .await;
            output = outcome.text();

            if outcome.is_failure() {
                error = Some(output.clone());
                continue;
            }
            match accept(&output) {
                Ok(value) => {
                    let record = StageRecord {
                        role,
                        attempts: attempt,
                        succeeded: true,
                        output,
                        error: None,
                    };
                    return (record, Some(value));
                }
                Err(reason) => {
                    tracing::warn!(role = %role, attempt, "Stage output rejected: {}", reason);
                    feedback = Some(reason.clone());
                    error = Some(reason);
                }
            }
        }

        let record = StageRecord {
            role,
            attempts: self.stage_attempts,
            succeeded: false,
            output,
            error,
        };
        (record, None)
    }

    /// Pick the file to analyse. With several candidates the supervisor
    /// model chooses through the `delegate_analyst` tool; anything unusable
    /// falls back to the first candidate.
    async fn choose_data_file(&self, user_request: &str, candidates: &[String]) -> String {
        let first = candidates.first().cloned().unwrap_or_default();
        if candidates.len() < 2 {
            return first;
        }
        let Some(definition) = delegation::definition(AgentRole::Analyst) else {
            return first;
        };

        let listing = candidates
            .iter()
            .map(|p| format!("- {}", p))
            .collect::<Vec<_>>()
            .join("\n");
        let messages = vec![
            ChatMessage::system(prompts::supervisor_persona()),
            ChatMessage::user(format!(
                "User request:\n{user_request}\n\n\
                 The coder saved these data files:\n{listing}\n\n\
                 Call delegate_analyst with the one file that best serves the request."
            )),
        ];

        let response = match self.model.chat(&messages, Some(&[definition][..])).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Data file choice failed, using {}: {}", first, e);
                return first;
            }
        };

        let chosen = response
            .tool_calls
            .unwrap_or_default()
            .iter()
            .filter_map(|call| {
                let args = call.parsed_arguments().ok()?;
                DelegationRequest::from_tool_call(&call.function.name, &args).ok()
            })
            .find_map(|request| match request {
                DelegationRequest::Analyze { data_file_path, .. } => Some(data_file_path),
                _ => None,
            });

        match chosen {
            Some(path) if candidates.contains(&path) => path,
            other => {
                tracing::warn!("Supervisor chose {:?}, using {}", other, first);
                first
            }
        }
    }

    /// Stream the final report from the supervisor model and make sure it
    /// names every artifact.
    async fn compose_report(
        &self,
        user_request: &str,
        stages: &[StageRecord],
        artifacts: &[String],
        blueprint_issues: &[String],
        events: Option<&EventSink>,
    ) -> String {
        let messages = vec![
            ChatMessage::system(prompts::supervisor_persona()),
            ChatMessage::user(report_request(user_request, stages, artifacts, blueprint_issues)),
        ];

        let (tx, mut rx) = mpsc::channel::<String>(64);
        let forward = async {
            while let Some(delta) = rx.recv().await {
                stream::emit(events, StreamEvent::token(delta)).await;
            }
        };
        let (result, ()) = tokio::join!(self.model.stream(&messages, tx), forward);

        let mut text = match result {
            Ok(text) if !text.trim().is_empty() => text,
            other => {
                if let Err(e) = other {
                    tracing::warn!("Report composition failed, using summary: {}", e);
                }
                let text = summary_report(user_request, stages, artifacts);
                stream::emit(events, StreamEvent::token(text.clone())).await;
                text
            }
        };

        let missing = missing_artifacts(&text, artifacts);
        if !missing.is_empty() {
            let appendix = artifact_listing("Generated files", &missing);
            let appendix = format!("\n\n{}", appendix);
            stream::emit(events, StreamEvent::token(appendix.clone())).await;
            text.push_str(&appendix);
        }
        text
    }
}

fn accept_blueprint(text: &str) -> Result<BlueprintReport, String> {
    if is_error_marker(text) {
        return Err(text.to_string());
    }
    blueprint::inspect(text).map_err(|e| format!("{}; reply with the Blueprint as one JSON object", e))
}

fn accept_data_files(text: &str, dir: &Path) -> Result<(Vec<String>, Vec<String>), String> {
    if is_error_marker(text) {
        return Err(text.to_string());
    }
    let data = find_paths(text, ArtifactKind::Data, dir);
    if data.is_empty() {
        return Err(
            "no data file path was reported; save the data as JSON or CSV and state the absolute path"
                .to_string(),
        );
    }
    Ok((data, find_paths(text, ArtifactKind::Image, dir)))
}

fn accept_analysis(text: &str, dir: &Path) -> Result<Vec<String>, String> {
    if is_error_marker(text) {
        return Err(text.to_string());
    }
    let mut images = find_paths(text, ArtifactKind::Image, dir);
    let default_chart = dir.join("chart.png");
    if images.is_empty() {
        if !default_chart.is_file() {
            return Err(format!(
                "no chart path was reported; save the chart as an image under {} and state its absolute path",
                dir.display()
            ));
        }
        images.push(default_chart.to_string_lossy().to_string());
    }
    Ok(images)
}

fn correction(problem: &str) -> String {
    format!("Your previous answer could not be used: {problem}. Please correct it.")
}

fn with_feedback(request: &str, feedback: Option<&str>) -> String {
    match feedback {
        None => request.to_string(),
        Some(problem) => format!("{request}\n\n{}", correction(problem)),
    }
}

fn merge(into: &mut Vec<String>, paths: Vec<String>) {
    for path in paths {
        if !into.contains(&path) {
            into.push(path);
        }
    }
}

fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}

fn missing_artifacts(text: &str, artifacts: &[String]) -> Vec<String> {
    artifacts
        .iter()
        .filter(|path| !text.contains(path.as_str()))
        .cloned()
        .collect()
}

/// Bullet list of paths; images are wrapped for inline rendering.
fn artifact_listing(title: &str, paths: &[String]) -> String {
    let mut out = format!("{}:", title);
    for path in paths {
        match ArtifactKind::of(path) {
            Some(ArtifactKind::Image) => {
                out.push_str(&format!("\n- <Render_Image>{}</Render_Image>", path))
            }
            _ => out.push_str(&format!("\n- {}", path)),
        }
    }
    out
}

fn stage_line(stage: &StageRecord) -> String {
    let status = if stage.succeeded { "done" } else { "failed" };
    let first_line = stage.output.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    format!(
        "- {} ({}, {} attempt(s)): {}",
        stage.role.display_name(),
        status,
        stage.attempts,
        excerpt(first_line.trim(), 200)
    )
}

fn report_request(
    user_request: &str,
    stages: &[StageRecord],
    artifacts: &[String],
    blueprint_issues: &[String],
) -> String {
    let mut out = format!("User request:\n{}\n\nStage results:\n", user_request);
    for stage in stages {
        out.push_str(&format!(
            "\n## {}\n{}\n",
            stage.role.display_name(),
            excerpt(&stage.output, REPORT_EXCERPT_CHARS)
        ));
    }
    if !blueprint_issues.is_empty() {
        out.push_str("\nBlueprint issues found during validation:\n");
        for issue in blueprint_issues {
            out.push_str(&format!("- {}\n", issue));
        }
    }
    out.push_str("\nGenerated files:\n");
    for path in artifacts {
        out.push_str(&format!("- {}\n", path));
    }
    out.push_str(
        "\nWrite the final report for the user: list every generated file with its full path \
         and summarise the result of each stage.",
    );
    out
}

/// Report used when the model cannot write one.
fn summary_report(user_request: &str, stages: &[StageRecord], artifacts: &[String]) -> String {
    let mut out = format!("Request: {}\n\nStages:\n", user_request.trim());
    for stage in stages {
        out.push_str(&stage_line(stage));
        out.push('\n');
    }
    out.push('\n');
    out.push_str(&artifact_listing("Generated files", artifacts));
    out
}

fn failure_report(
    user_request: &str,
    stages: &[StageRecord],
    artifacts: &[String],
    failed: AgentRole,
) -> String {
    let reason = stages
        .iter()
        .rev()
        .find(|s| s.role == failed)
        .and_then(|s| s.error.clone())
        .unwrap_or_default();
    let mut out = format!(
        "The pipeline stopped at the {} stage.\n{}\n\n",
        failed.display_name(),
        reason
    );
    out.push_str(&summary_report(user_request, stages, artifacts));
    out
}
