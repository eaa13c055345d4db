mod prompt;

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use relinker_core::api::{WikiClient, WikiReadApi};
use relinker_core::config::{
    ConfigPatch, DEFAULT_CONFIG_FILENAME, RelinkerConfig, load_config, parse_list, patch_config,
};
use relinker_core::monitor::{HaltToken, MonitorState, spawn_discussion_monitor};
use relinker_core::rename::{
    Discovery, RenameJob, RenameOptions, RenameReport, discover_documents, run_rename,
};
use tracing_subscriber::EnvFilter;

use crate::prompt::Prompter;

#[derive(Debug, Parser)]
#[command(
    name = "relinker",
    version,
    about = "Repoint wiki links after a page is renamed"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH", default_value = DEFAULT_CONFIG_FILENAME)]
    config: PathBuf,
    #[arg(long, global = true, help = "Print reports as JSON")]
    json: bool,
    #[arg(short, long, global = true, help = "Enable debug logging")]
    verbose: bool,
    #[arg(long, global = true, help = "Fail instead of prompting for missing settings")]
    no_prompt: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    config: PathBuf,
    json: bool,
    no_prompt: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            config: cli.config.clone(),
            json: cli.json,
            no_prompt: cli.no_prompt,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Rewrite every link to OLD so it points at NEW")]
    Rename(RenameArgs),
    #[command(about = "List documents that link to TITLE")]
    Backlinks(BacklinksArgs),
    #[command(about = "Check a document for open discussions once")]
    Discussions(DiscussionsArgs),
}

#[derive(Debug, Args)]
struct RenameArgs {
    old: Option<String>,
    new: Option<String>,
    #[arg(long, help = "Rewrite bare [[OLD]] as [[NEW|OLD]]")]
    keep_display_text: bool,
    #[arg(long, help = "Fetch and rewrite pages without submitting edits")]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct BacklinksArgs {
    title: String,
}

#[derive(Debug, Args)]
struct DiscussionsArgs {
    title: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    dotenvy::dotenv().ok();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Rename(args)) => run_rename_command(&runtime, args),
        Some(Commands::Backlinks(args)) => run_backlinks(&runtime, args),
        Some(Commands::Discussions(args)) => run_discussions(&runtime, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_rename_command(runtime: &RuntimeOptions, args: RenameArgs) -> Result<()> {
    let mut prompter = Prompter::stdio();
    let config = ensure_config(runtime, &mut prompter)?;

    let (old, new, keep_display_text) = match (args.old, args.new) {
        (Some(old), Some(new)) => (old, new, args.keep_display_text),
        (old, new) => {
            if runtime.no_prompt {
                bail!("rename requires OLD and NEW titles");
            }
            let old = match old {
                Some(old) => old,
                None => prompter.ask_required("Old title: ")?,
            };
            let new = match new {
                Some(new) => new,
                None => prompter.ask_required("New title: ")?,
            };
            let keep = args.keep_display_text
                || prompter.confirm("Keep the old title as display text for bare links? (y/n): ")?;
            (old, new, keep)
        }
    };

    let template = config
        .log_template()
        .ok_or_else(|| anyhow::anyhow!("rename.log_template is not configured"))?;
    let job = RenameJob::new(&old, &new, keep_display_text, &template)?;
    let namespaces = config.namespaces();
    let options = RenameOptions::from_config(&config, args.dry_run);
    let mut client = WikiClient::from_config(&config)?;

    let halt = HaltToken::new();
    let monitor = match config.watch_document() {
        Some(title) => Some(spawn_discussion_monitor(
            client.clone(),
            title,
            config.watch_interval(),
            halt.clone(),
        )?),
        None => None,
    };

    let mut report = run_rename(&mut client, &job, &namespaces, &options, &halt)?;
    if let Some(monitor) = monitor {
        let state = monitor.stop();
        tracing::debug!(?state, "discussion monitor stopped");
        if matches!(state, MonitorState::Tripped | MonitorState::Failed) {
            report.note_halt(&halt);
        }
    }

    if runtime.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_rename_report(&report, &namespaces);
    }
    Ok(())
}

fn run_backlinks(runtime: &RuntimeOptions, args: BacklinksArgs) -> Result<()> {
    let title = args.title.trim();
    if title.is_empty() {
        bail!("backlinks requires a non-empty title");
    }
    let config = ensure_config(runtime, &mut Prompter::stdio())?;
    let namespaces = config.namespaces();
    let mut client = WikiClient::from_config(&config)?;
    let discovery = discover_documents(&mut client, title, &namespaces);

    if runtime.json {
        println!("{}", serde_json::to_string_pretty(&discovery)?);
    } else {
        print_discovery(title, &namespaces, &discovery);
        println!("request_count: {}", client.request_count());
    }
    Ok(())
}

fn run_discussions(runtime: &RuntimeOptions, args: DiscussionsArgs) -> Result<()> {
    let config = ensure_config(runtime, &mut Prompter::stdio())?;
    let title = match args.title.or_else(|| config.watch_document()) {
        Some(title) => title,
        None => bail!("discussions requires a TITLE or rename.watch_document"),
    };
    let mut client = WikiClient::from_config(&config)?;
    let open = client.has_open_discussion(&title)?;

    if runtime.json {
        let payload = serde_json::json!({ "title": title, "open": open });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        println!("discussions");
        println!("title: {title}");
        println!("state: {}", if open { "open" } else { "closed" });
    }
    Ok(())
}

/// Load the config file, asking for and persisting any missing required keys.
fn ensure_config<R: BufRead, W: Write>(
    runtime: &RuntimeOptions,
    prompter: &mut Prompter<R, W>,
) -> Result<RelinkerConfig> {
    let config = load_config(&runtime.config)?;
    let missing = config.missing_keys();
    if missing.is_empty() {
        return Ok(config);
    }
    if runtime.no_prompt {
        bail!(
            "missing settings in {}: {}",
            normalize_path(&runtime.config),
            missing.join(", ")
        );
    }

    let first_rename_setup = config.namespaces().is_empty() || config.log_template().is_none();
    let mut patch = ConfigPatch::default();
    if config.domain().is_none() {
        patch.set_domain = Some(prompter.ask_required("Wiki domain (e.g. theseed.io): ")?);
    }
    if config.token().is_none() {
        patch.set_token = Some(prompter.ask_required("API token: ")?);
    }
    if config.namespaces().is_empty() {
        let namespaces = loop {
            let answer = prompter.ask_required("Namespaces to search (comma separated): ")?;
            let parsed = parse_list(&answer);
            if !parsed.is_empty() {
                break parsed;
            }
        };
        patch.set_namespaces = Some(namespaces);
    }
    if config.log_template().is_none() {
        patch.set_log_template =
            Some(prompter.ask_required("Edit summary template ({old} and {new} available): ")?);
    }
    if first_rename_setup && config.watch_document().is_none() {
        patch.set_watch_document = Some(
            prompter.ask("Document to watch for open discussions (blank to disable): ")?,
        );
    }

    if patch_config(&runtime.config, &patch)? {
        println!("saved settings: {}", normalize_path(&runtime.config));
    }
    load_config(&runtime.config)
}

fn print_rename_report(report: &RenameReport, namespaces: &[String]) {
    println!("rename");
    println!("old_title: {}", report.old_title);
    println!("new_title: {}", report.new_title);
    println!("log_message: {}", report.log_message);
    println!("namespaces: {}", namespaces.join(", "));
    println!("dry_run: {}", format_flag(report.dry_run));
    println!("discovered: {}", report.discovered);
    println!("edited: {}", report.edited);
    println!("unchanged: {}", report.unchanged);
    println!("permission_denied: {}", report.permission_denied);
    println!("failed: {}", report.failed);
    println!("request_count: {}", report.request_count);
    for failure in &report.namespace_failures {
        println!("namespace_failure.{}: {}", failure.namespace, failure.error);
    }
    for page in report.failures() {
        println!(
            "needs_attention: [[{}]] ({}/{}) {}",
            page.title,
            page.position,
            report.discovered,
            page.detail.as_deref().unwrap_or("")
        );
    }
    match &report.halted {
        Some(reason) => println!("halted: {reason}"),
        None => println!("halted: no"),
    }
}

fn print_discovery(title: &str, namespaces: &[String], discovery: &Discovery) {
    println!("backlinks");
    println!("target: {title}");
    println!("namespaces: {}", namespaces.join(", "));
    println!("backlinks.count: {}", discovery.documents.len());
    if discovery.documents.is_empty() {
        println!("backlinks: <none>");
    } else {
        for document in &discovery.documents {
            println!("backlinks.document: {document}");
        }
    }
    for failure in &discovery.failures {
        println!("namespace_failure.{}: {}", failure.namespace, failure.error);
    }
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
