//! Trigger-scan plus rule-driven follow-up automation.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::catalog::{PlaybookCatalog, PlaybookDefinition, PlaybookRule};
use crate::entities::{TargetSource, TaskStatus};
use crate::parser::{DiscoveredService, ServiceParser};
use crate::runtime::factory::TaskFactory;
use crate::runtime::runner::TaskRunner;

/// Priority given to follow-up jobs derived from a playbook run.
pub const DERIVED_JOB_PRIORITY: i64 = 0;

#[derive(Debug, Error)]
pub enum PlaybookError {
    #[error("playbook '{0}' is not defined")]
    NotFound(String),

    #[error("project {project_id} has no targets for playbook '{playbook_id}'")]
    NoTargets { playbook_id: String, project_id: i64 },

    #[error("failed to load project targets: {0}")]
    Targets(#[from] sqlx::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("unknown placeholder '{{{0}}}'")]
    UnknownPlaceholder(String),

    #[error("unbalanced brace in option template")]
    UnbalancedBrace,
}

/// Summary of one playbook run. Derived jobs are queued, not awaited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlaybookReport {
    pub playbook_id: String,
    pub project_id: i64,
    pub targets_scanned: usize,
    pub trigger_failures: usize,
    pub services_found: usize,
    pub tasks_queued: usize,
    /// Matched services whose follow-up could not be created.
    pub services_skipped: usize,
}

#[derive(Clone)]
pub struct PlaybookEngine {
    playbooks: Arc<PlaybookCatalog>,
    targets: Arc<dyn TargetSource>,
    factory: TaskFactory,
    runner: TaskRunner,
    parser: Arc<dyn ServiceParser>,
}

impl PlaybookEngine {
    pub fn new(
        playbooks: Arc<PlaybookCatalog>,
        targets: Arc<dyn TargetSource>,
        factory: TaskFactory,
        runner: TaskRunner,
        parser: Arc<dyn ServiceParser>,
    ) -> Self {
        Self {
            playbooks,
            targets,
            factory,
            runner,
            parser,
        }
    }

    /// Run `playbook_id` against every target of `project_id`.
    ///
    /// Trigger scans run inline, one target at a time. Per-target and
    /// per-service problems are logged and counted in the report; only a
    /// missing playbook, a project without targets or a target lookup
    /// failure abort the run.
    pub async fn run(
        &self,
        playbook_id: &str,
        project_id: i64,
    ) -> Result<PlaybookReport, PlaybookError> {
        let playbook = self
            .playbooks
            .get(playbook_id)
            .ok_or_else(|| PlaybookError::NotFound(playbook_id.to_owned()))?;
        let targets = self.targets.targets_for_project(project_id).await?;
        if targets.is_empty() {
            return Err(PlaybookError::NoTargets {
                playbook_id: playbook_id.to_owned(),
                project_id,
            });
        }
        let rules = compile_rules(playbook);
        info!(
            playbook_id,
            project_id,
            targets = targets.len(),
            rules = rules.len(),
            "playbook started"
        );

        let mut report = PlaybookReport {
            playbook_id: playbook_id.to_owned(),
            project_id,
            ..Default::default()
        };

        let mut services = Vec::new();
        for target in &targets {
            report.targets_scanned += 1;
            match self.scan_target(playbook, target, project_id).await {
                Ok(found) => {
                    debug!(playbook_id, target = %target, services = found.len(), "trigger scan parsed");
                    services.extend(found);
                }
                Err(reason) => {
                    warn!(playbook_id, target = %target, reason = %reason, "trigger scan skipped");
                    report.trigger_failures += 1;
                }
            }
        }
        report.services_found = services.len();

        for service in &services {
            // First matching rule wins; later rules are not consulted.
            let Some(rule) = rules.iter().find(|rule| rule.matches(&service.service_name)) else {
                continue;
            };
            let options = match render_options(&rule.options, service) {
                Ok(options) => options,
                Err(err) => {
                    warn!(playbook_id, rule = %rule.name, host = %service.host, port = %service.port, error = %err, "follow-up skipped");
                    report.services_skipped += 1;
                    continue;
                }
            };
            match self
                .factory
                .enqueue_single(
                    &rule.tool_id,
                    &service.host,
                    &options,
                    Some(project_id),
                    DERIVED_JOB_PRIORITY,
                )
                .await
            {
                Ok(queued) => {
                    info!(
                        playbook_id,
                        rule = %rule.name,
                        host = %service.host,
                        port = %service.port,
                        task_id = %queued.task.id,
                        job_id = %queued.job_id,
                        "follow-up queued"
                    );
                    report.tasks_queued += 1;
                }
                Err(err) => {
                    warn!(playbook_id, rule = %rule.name, host = %service.host, error = %err, "follow-up could not be created");
                    report.services_skipped += 1;
                }
            }
        }

        info!(
            playbook_id,
            project_id,
            services = report.services_found,
            queued = report.tasks_queued,
            "playbook finished"
        );
        Ok(report)
    }

    /// Create and run the trigger task for one target, returning the parsed
    /// services. The error string describes why the target yielded nothing.
    async fn scan_target(
        &self,
        playbook: &PlaybookDefinition,
        target: &str,
        project_id: i64,
    ) -> Result<Vec<DiscoveredService>, String> {
        let trigger = &playbook.trigger;
        let task = self
            .factory
            .create(&trigger.tool_id, target, &trigger.options, Some(project_id))
            .await
            .map_err(|e| format!("trigger task not created: {e}"))?;
        let task = self
            .runner
            .run(task.id)
            .await
            .map_err(|e| format!("trigger task {} did not run: {e}", task.id))?;
        if task.status != TaskStatus::Completed {
            return Err(format!("trigger task {} ended {}", task.id, task.status));
        }

        let Some(xml) = task.xml_output_file.as_deref() else {
            return Ok(Vec::new());
        };
        let non_empty = tokio::fs::metadata(xml)
            .await
            .map(|meta| meta.len() > 0)
            .unwrap_or(false);
        if !non_empty {
            debug!(task_id = %task.id, "trigger produced no structured output");
            return Ok(Vec::new());
        }
        self.parser
            .parse(xml)
            .map_err(|e| format!("trigger output not parsed: {e}"))
    }
}

/// Validate a playbook's rules, logging and dropping malformed ones.
pub fn compile_rules(playbook: &PlaybookDefinition) -> Vec<PlaybookRule> {
    playbook
        .rules
        .iter()
        .enumerate()
        .filter_map(|(index, raw)| match PlaybookRule::from_value(raw) {
            Ok(rule) => Some(rule),
            Err(reason) => {
                warn!(playbook_id = %playbook.id, rule_index = index, reason = %reason, "ignoring malformed rule");
                None
            }
        })
        .collect()
}

/// Substitute `{host}`, `{port}` and `{protocol}` in an option template.
/// `{{` and `}}` produce literal braces.
pub fn render_options(template: &str, service: &DiscoveredService) -> Result<String, RenderError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some('{') | None => return Err(RenderError::UnbalancedBrace),
                        Some(ch) => name.push(ch),
                    }
                }
                let value = match name.as_str() {
                    "host" => &service.host,
                    "port" => &service.port,
                    "protocol" => &service.protocol,
                    _ => return Err(RenderError::UnknownPlaceholder(name.clone())),
                };
                out.push_str(value);
            }
            '}' => return Err(RenderError::UnbalancedBrace),
            other => out.push(other),
        }
    }
    Ok(out)
}
