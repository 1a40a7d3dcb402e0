use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::runtime::Runtime;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use reportloom::cli::CommandContext;
use reportloom::cli::commands::run::RunOptions;

#[derive(Parser)]
#[command(name = "reportloom")]
#[command(
    version,
    about = "Resumable multi-stage pipeline for engineering-design reports"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, short, default_value = ".reportloom/config.toml")]
    config: PathBuf,

    #[arg(long)]
    verbose: bool,

    #[arg(long, short)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new report
    Run {
        #[arg(long, short, help = "Problem statement, or @path to read it from a file")]
        input: String,
        #[arg(long = "image", help = "Image attachment (png, jpg, gif, webp); repeatable")]
        images: Vec<PathBuf>,
        #[arg(long, help = "Report ID (generated when omitted)")]
        report_id: Option<String>,
        #[arg(long, help = "Corpus JSON file for retrieval")]
        corpus: Option<PathBuf>,
        #[arg(long, help = "Wait in-process for a clarification answer")]
        wait: bool,
        #[arg(long, env = "REPORTLOOM_ACCOUNT_ID", default_value = "local")]
        account: String,
        #[arg(long, env = "REPORTLOOM_USER_ID", default_value = "local")]
        user: String,
        #[arg(long, help = "Conversation ID (generated when omitted)")]
        conversation: Option<String>,
    },

    /// Answer a pending clarification question
    Answer {
        report_id: String,
        answer: String,
        #[arg(long, help = "Continue the run right after recording the answer")]
        resume: bool,
        #[arg(long, help = "Corpus JSON file for retrieval")]
        corpus: Option<PathBuf>,
    },

    /// Resume a persisted report
    Resume {
        report_id: String,
        #[arg(long, help = "Corpus JSON file for retrieval")]
        corpus: Option<PathBuf>,
        #[arg(long, help = "Wait in-process for a clarification answer")]
        wait: bool,
    },

    /// Show report status
    Status {
        report_id: String,
        #[arg(
            short = 'f',
            long,
            default_value = "text",
            help = "Output format: text, json, yaml"
        )]
        format: String,
    },

    /// Fail reports whose clarification deadline has passed
    Expire,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration (merged from all sources)
    Show {
        #[arg(
            short = 'f',
            long,
            default_value = "text",
            help = "Output format: text (toml), json"
        )]
        format: String,
    },
    /// Show configuration file paths
    Path,
}

/// Set up panic handler for graceful error reporting
fn setup_panic_handler() {
    let default_hook = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |panic_info| {
        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };

        eprintln!("\n\x1b[1;31m━━━ PANIC ━━━\x1b[0m");
        eprintln!("\x1b[31mreportloom encountered an unexpected error:\x1b[0m");
        eprintln!("  {}", message);

        if let Some(location) = panic_info.location() {
            eprintln!(
                "\x1b[90mLocation: {}:{}:{}\x1b[0m",
                location.file(),
                location.line(),
                location.column()
            );
        }
        eprintln!("\x1b[33mCheckpointed reports can be continued with `reportloom resume <id>`.\x1b[0m");
        eprintln!();

        // Backtrace when RUST_BACKTRACE=1
        default_hook(panic_info);
    }));
}

fn main() -> ExitCode {
    setup_panic_handler();

    match run_cli() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("\x1b[31mError:\x1b[0m {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Commands::Config { action } = &cli.command {
        match action {
            ConfigAction::Show { format } => {
                reportloom::cli::commands::config::show(Some(&cli.config), format)?;
            }
            ConfigAction::Path => reportloom::cli::commands::config::path()?,
        }
        return Ok(());
    }

    let ctx = CommandContext::load(Some(&cli.config))?;
    let rt = Runtime::new()?;

    match cli.command {
        Commands::Run {
            input,
            images,
            report_id,
            corpus,
            wait,
            account,
            user,
            conversation,
        } => {
            rt.block_on(reportloom::cli::commands::run::run(
                &ctx,
                RunOptions {
                    input,
                    images,
                    report_id,
                    corpus,
                    wait,
                    account_id: account,
                    user_id: user,
                    conversation_id: conversation,
                },
            ))?;
        }
        Commands::Answer {
            report_id,
            answer,
            resume,
            corpus,
        } => {
            rt.block_on(reportloom::cli::commands::answer::run(
                &ctx, &report_id, &answer, resume, corpus,
            ))?;
        }
        Commands::Resume {
            report_id,
            corpus,
            wait,
        } => {
            rt.block_on(reportloom::cli::commands::resume::run(
                &ctx, &report_id, corpus, wait,
            ))?;
        }
        Commands::Status { report_id, format } => {
            rt.block_on(reportloom::cli::commands::status::run(
                &ctx, &report_id, &format,
            ))?;
        }
        Commands::Expire => {
            rt.block_on(reportloom::cli::commands::expire::run(&ctx))?;
        }
        Commands::Config { .. } => {}
    }

    Ok(())
}
