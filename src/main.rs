use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use precedent::analyze::{AnalysisReport, AnalysisRequest, Analyzer, StageStatus};
use precedent::config::{Config, TOKEN_ENV};
use precedent::gitlab::GitLabClient;
use precedent::logging;
use precedent::model::{Issue, SearchScope};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "precedent",
    about = "Find closed GitLab issues like yours and the changes that fixed them",
    version
)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Find similar closed issues and suggest changes
    Analyze(AnalyzeArgs),
    /// List open issues assigned to a user
    Issues(IssuesArgs),
    /// Check the GitLab connection and token
    Status,
    /// Show or initialize the config file
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
struct AnalyzeArgs {
    #[arg(long)]
    issue_id: String,
    #[arg(long)]
    title: String,
    /// Minimum similarity between 0 and 1
    #[arg(long)]
    threshold: Option<f64>,
    #[arg(long = "label")]
    labels: Vec<String>,
    #[arg(long)]
    description: Option<String>,
    /// Group to search instead of the configured one
    #[arg(long)]
    group: Option<String>,
    /// Per-request timeout in seconds for each fan-out branch
    #[arg(long)]
    timeout: Option<u64>,
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct IssuesArgs {
    #[arg(long)]
    username: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// Write a config file with default values if none exists
    #[arg(long)]
    init: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let dispatch = logging::build_dispatch(cli.verbose);
    let _guard = tracing::dispatcher::set_default(&dispatch);

    let config = Config::load();
    match cli.command {
        Commands::Analyze(args) => run_analyze(args, config, dispatch).await,
        Commands::Issues(args) => run_issues(args, config).await,
        Commands::Status => run_status(config).await,
        Commands::Config(args) => run_config(args, config),
    }
}

fn client(config: &Config) -> Result<GitLabClient> {
    let token = config.token().with_context(|| {
        format!(
            "No GitLab token configured. Set {} or add \"token\" to {}",
            TOKEN_ENV,
            Config::config_location()
        )
    })?;
    GitLabClient::new(&config.gitlab_url(), &token, config.request_timeout())
}

async fn run_analyze(args: AnalyzeArgs, config: Config, dispatch: tracing::Dispatch) -> Result<()> {
    let store = client(&config)?;
    let mut analyzer = Analyzer::from_config(store, &config, dispatch)?;
    if let Some(group) = args.group.filter(|g| !g.trim().is_empty()) {
        analyzer = analyzer.with_scope(SearchScope::Group(group));
    }

    let request = AnalysisRequest {
        issue_id: args.issue_id,
        issue_title: args.title,
        threshold: args.threshold,
        description: args.description,
        labels: args.labels,
        timeout: args.timeout.map(Duration::from_secs),
    };
    let report = analyzer.analyze(request).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report, analyzer.scope());
    }
    Ok(())
}

async fn run_issues(args: IssuesArgs, config: Config) -> Result<()> {
    let username = args
        .username
        .or_else(|| config.default_username.clone())
        .context("No username given. Pass --username or set \"default_username\" in the config")?;
    let client = client(&config)?;
    let (issues, rate_limit) = client.assigned_issues(&username).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&issues)?);
        return Ok(());
    }

    println!();
    println!("Open issues assigned to {} ({})", username, issues.len());
    println!();
    for issue in &issues {
        print_issue_line(issue);
    }
    if let (Some(remaining), Some(limit)) = (rate_limit.remaining, rate_limit.limit) {
        println!();
        println!("  API rate limit: {}/{} remaining", remaining, limit);
    }
    println!();
    Ok(())
}

async fn run_status(config: Config) -> Result<()> {
    println!();
    println!("  Config:  {}", Config::config_location());
    println!("  GitLab:  {}", config.gitlab_url());
    println!("  Group:   {}", config.group());
    match client(&config) {
        Ok(client) => match client.check_access().await {
            Ok(username) => println!("  Token:   valid (authenticated as {})", username),
            Err(err) => println!("  Token:   rejected ({})", err),
        },
        Err(err) => println!("  Token:   missing ({})", err),
    }
    println!();
    Ok(())
}

fn run_config(args: ConfigArgs, config: Config) -> Result<()> {
    if args.init {
        if !Config::config_path().is_some_and(|p| p.exists()) {
            config.save()?;
            println!("  + Wrote default config to {}", Config::config_location());
        } else {
            println!("  Config already exists at {}", Config::config_location());
        }
        return Ok(());
    }
    println!("# {}", Config::config_location());
    let mut shown = config;
    if shown.token.is_some() {
        shown.token = Some("(set)".to_string());
    }
    println!("{}", serde_json::to_string_pretty(&shown)?);
    Ok(())
}

fn print_issue_line(issue: &Issue) {
    let title = if issue.title.chars().count() > 60 {
        format!("{}...", issue.title.chars().take(57).collect::<String>())
    } else {
        issue.title.clone()
    };
    println!("  #{:<6} {}", issue.iid, title);
    println!("          {}", issue.web_url);
}

fn status_mark(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Completed => "+",
        StageStatus::Pending => ".",
        StageStatus::Failed => "x",
    }
}

fn print_report(report: &AnalysisReport, scope: &SearchScope) {
    println!();
    println!("Searched {}", scope);
    println!(
        "  [{}] similar issues  [{}] merge requests  [{}] suggestions",
        status_mark(report.status.similar_issues),
        status_mark(report.status.merge_requests),
        status_mark(report.status.suggestions),
    );
    if let Some(error) = &report.error {
        println!("  Error: {}", error);
    }

    println!();
    if report.similar_issues.is_empty() {
        println!("No similar closed issues found.");
    } else {
        println!("Similar issues:");
        for (i, candidate) in report.similar_issues.iter().enumerate() {
            println!("  {}. [{:>3}%] #{} {}", i + 1, candidate.percent(), candidate.issue.iid, candidate.issue.title);
            println!("         {}", candidate.issue.web_url);
        }
    }

    if !report.merge_requests.is_empty() {
        println!();
        println!("Merge requests:");
        for resolved in &report.merge_requests {
            let mr = &resolved.merge_request;
            println!("  !{} {} ({} files)", mr.iid, mr.title, mr.changes.len());
            println!("      {}", mr.web_url);
        }
    }

    if !report.suggestions.is_empty() {
        println!();
        println!("Suggested changes:");
        for (i, suggestion) in report.suggestions.iter().enumerate() {
            println!("  {}. [{}] {}: {}", i + 1, suggestion.kind, suggestion.title, suggestion.description);
            for change in &suggestion.specific_changes {
                println!("       {}", change);
            }
            if suggestion.related_files.len() > 1 {
                println!("     also in: {}", suggestion.related_files[1..].join(", "));
            }
            if let Some(source) = &suggestion.source_merge_request {
                println!("     from {}", source);
            }
        }
    }
    println!();
}
