use std::collections::BTreeSet;
use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Serialize;

use crate::api::{BacklinkKind, WikiReadApi, WikiWriteApi};
use crate::config::{DEFAULT_EDIT_DELAY_MS, RelinkerConfig};
use crate::monitor::HaltToken;
use crate::rewrite::{LinkRewriter, RewritePolicy, TitleMatching};

/// One title move: every link to `old_title` is repointed at `new_title`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameJob {
    old_title: String,
    new_title: String,
    keep_display_text: bool,
    log_message: String,
}

impl RenameJob {
    pub fn new(
        old_title: &str,
        new_title: &str,
        keep_display_text: bool,
        log_template: &str,
    ) -> Result<Self> {
        let old_title = old_title.trim();
        let new_title = new_title.trim();
        if old_title.is_empty() || new_title.is_empty() {
            bail!("rename requires non-empty old and new titles");
        }
        if old_title == new_title {
            bail!("old and new titles are identical: {old_title}");
        }
        Ok(Self {
            log_message: render_log_message(log_template, old_title, new_title),
            old_title: old_title.to_string(),
            new_title: new_title.to_string(),
            keep_display_text,
        })
    }

    pub fn old_title(&self) -> &str {
        &self.old_title
    }

    pub fn new_title(&self) -> &str {
        &self.new_title
    }

    pub fn keep_display_text(&self) -> bool {
        self.keep_display_text
    }

    pub fn log_message(&self) -> &str {
        &self.log_message
    }
}

/// Substitute `{old}` and `{new}` in one pass, so placeholder text inside a
/// title is not expanded again.
pub fn render_log_message(template: &str, old_title: &str, new_title: &str) -> String {
    let mut output = String::with_capacity(template.len() + old_title.len() + new_title.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        output.push_str(&rest[..start]);
        let tail = &rest[start..];
        if let Some(after) = tail.strip_prefix("{old}") {
            output.push_str(old_title);
            rest = after;
        } else if let Some(after) = tail.strip_prefix("{new}") {
            output.push_str(new_title);
            rest = after;
        } else {
            output.push('{');
            rest = &tail[1..];
        }
    }
    output.push_str(rest);
    output
}

#[derive(Debug, Clone)]
pub struct RenameOptions {
    pub matching: TitleMatching,
    /// Pause after every submitted edit, successful or not.
    pub edit_delay: Duration,
    pub dry_run: bool,
}

impl Default for RenameOptions {
    fn default() -> Self {
        Self {
            matching: TitleMatching::default(),
            edit_delay: Duration::from_millis(DEFAULT_EDIT_DELAY_MS),
            dry_run: false,
        }
    }
}

impl RenameOptions {
    pub fn from_config(config: &RelinkerConfig, dry_run: bool) -> Self {
        Self {
            matching: config.title_matching(),
            edit_delay: config.edit_delay(),
            dry_run,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NamespaceFailure {
    pub namespace: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Discovery {
    pub documents: BTreeSet<String>,
    pub failures: Vec<NamespaceFailure>,
}

/// Collect every document that directly links to `title` across `namespaces`.
/// A failing namespace is recorded and skipped.
pub fn discover_documents<A: WikiReadApi>(
    api: &mut A,
    title: &str,
    namespaces: &[String],
) -> Discovery {
    let mut discovery = Discovery::default();
    for namespace in namespaces {
        match api.fetch_backlinks(title, namespace) {
            Ok(entries) => {
                let before = discovery.documents.len();
                discovery.documents.extend(
                    entries
                        .into_iter()
                        .filter(|entry| entry.kind == BacklinkKind::Link)
                        .map(|entry| entry.document),
                );
                tracing::debug!(
                    namespace = %namespace,
                    added = discovery.documents.len() - before,
                    "backlinks fetched"
                );
            }
            Err(error) => {
                tracing::warn!(namespace = %namespace, error = %error, "backlink query failed");
                discovery.failures.push(NamespaceFailure {
                    namespace: namespace.clone(),
                    error: error.to_string(),
                });
            }
        }
    }
    discovery
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageAction {
    Edited,
    WouldEdit,
    Unchanged,
    PermissionDenied,
    FetchFailed,
    SubmitFailed,
    Halted,
}

#[derive(Debug, Clone, Serialize)]
pub struct RenamePageResult {
    pub title: String,
    pub position: usize,
    pub action: PageAction,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RenameReport {
    pub old_title: String,
    pub new_title: String,
    pub log_message: String,
    pub dry_run: bool,
    pub discovered: usize,
    pub namespace_failures: Vec<NamespaceFailure>,
    pub edited: usize,
    pub unchanged: usize,
    pub permission_denied: usize,
    pub failed: usize,
    pub pages: Vec<RenamePageResult>,
    pub halted: Option<String>,
    pub request_count: usize,
}

impl RenameReport {
    fn new(job: &RenameJob, dry_run: bool) -> Self {
        Self {
            old_title: job.old_title.clone(),
            new_title: job.new_title.clone(),
            log_message: job.log_message.clone(),
            dry_run,
            discovered: 0,
            namespace_failures: Vec::new(),
            edited: 0,
            unchanged: 0,
            permission_denied: 0,
            failed: 0,
            pages: Vec::new(),
            halted: None,
            request_count: 0,
        }
    }

    fn record(&mut self, title: &str, position: usize, action: PageAction, detail: Option<String>) {
        match action {
            PageAction::Edited | PageAction::WouldEdit => self.edited += 1,
            PageAction::Unchanged => self.unchanged += 1,
            PageAction::PermissionDenied => self.permission_denied += 1,
            PageAction::FetchFailed | PageAction::SubmitFailed => self.failed += 1,
            PageAction::Halted => {}
        }
        self.pages.push(RenamePageResult {
            title: title.to_string(),
            position,
            action,
            detail,
        });
    }

    /// Record a halt that arrived after the last halt check, such as one
    /// raised during the final post-submit delay. An earlier reason is kept.
    pub fn note_halt(&mut self, halt: &HaltToken) {
        if self.halted.is_none() {
            self.halted = halt.reason().map(|reason| reason.to_string());
        }
    }

    /// Pages an operator has to revisit by hand or with a re-run.
    pub fn failures(&self) -> impl Iterator<Item = &RenamePageResult> {
        self.pages.iter().filter(|page| {
            matches!(
                page.action,
                PageAction::PermissionDenied | PageAction::FetchFailed | PageAction::SubmitFailed
            )
        })
    }
}

/// Discover, rewrite and resubmit every page linking to the job's old title.
///
/// Documents are handled one at a time in title order. Per-document failures
/// are recorded and skipped; only a tripped `halt` token ends the run early,
/// and it is checked before each document and again before each submit.
pub fn run_rename<A: WikiWriteApi>(
    api: &mut A,
    job: &RenameJob,
    namespaces: &[String],
    options: &RenameOptions,
    halt: &HaltToken,
) -> Result<RenameReport> {
    let rewriter = LinkRewriter::new(
        &job.old_title,
        &job.new_title,
        RewritePolicy {
            matching: options.matching,
            keep_display_text: job.keep_display_text,
        },
    )
    .with_context(|| format!("failed to build link pattern for {}", job.old_title))?;

    let mut report = RenameReport::new(job, options.dry_run);
    let discovery = discover_documents(api, &job.old_title, namespaces);
    report.discovered = discovery.documents.len();
    report.namespace_failures = discovery.failures;
    let total = report.discovered;
    tracing::info!(total, old = %job.old_title, "backlinks discovered");

    for (index, title) in discovery.documents.iter().enumerate() {
        let position = index + 1;
        if let Some(reason) = halt.reason() {
            report.halted = Some(reason.to_string());
            break;
        }

        let page = match api.fetch_page(title) {
            Ok(page) => page,
            Err(error) if error.is_permission_denied() => {
                tracing::warn!(title = %title, position, total, "no edit permission; skipped");
                report.record(
                    title,
                    position,
                    PageAction::PermissionDenied,
                    Some(error.to_string()),
                );
                continue;
            }
            Err(error) => {
                tracing::warn!(title = %title, position, total, error = %error, "fetch failed; skipped");
                report.record(
                    title,
                    position,
                    PageAction::FetchFailed,
                    Some(error.to_string()),
                );
                continue;
            }
        };

        let rewritten = rewriter.rewrite(&page.body);
        if rewritten == page.body {
            tracing::debug!(title = %title, position, total, "no matching links");
            report.record(title, position, PageAction::Unchanged, None);
            continue;
        }
        let rewritten = rewritten.into_owned();

        if options.dry_run {
            tracing::info!(title = %title, position, total, "would edit");
            report.record(title, position, PageAction::WouldEdit, None);
            continue;
        }

        if let Some(reason) = halt.reason() {
            report.record(
                title,
                position,
                PageAction::Halted,
                Some(reason.to_string()),
            );
            report.halted = Some(reason.to_string());
            break;
        }

        match api.submit_edit(page, &rewritten, &job.log_message) {
            Ok(()) => {
                tracing::info!(title = %title, position, total, "edited");
                report.record(title, position, PageAction::Edited, None);
            }
            Err(error) => {
                tracing::warn!(title = %title, position, total, error = %error, "edit failed");
                report.record(
                    title,
                    position,
                    PageAction::SubmitFailed,
                    Some(error.to_string()),
                );
            }
        }
        if !options.edit_delay.is_zero() {
            sleep(options.edit_delay);
        }
    }

    report.request_count = api.request_count();
    Ok(report)
}
