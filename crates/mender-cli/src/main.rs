//! mender: run untrusted Python/C++ snippets and repair them with an AI fix loop
//!
//! Usage:
//!   mender run broken.py
//!   mender retry --max-attempts 3 main.cpp
//!   mender serve --port 8000

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mender_core::config::default_config_path;
use mender_core::{
    DebugReport, DebugService, ExecutionResult, Language, MenderConfig, NoFixPolicy,
    ProcessSandbox, SessionSummary,
};
use mender_gateway::GatewayServer;

#[derive(Parser, Debug)]
#[command(name = "mender", version, about = "Run and repair Python/C++ snippets")]
struct Cli {
    /// Config file (defaults to $MENDER_CONFIG, then the per-user config)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct SourceArgs {
    /// Source file, or `-` for stdin
    file: PathBuf,

    /// Language (python, cpp); inferred from the file extension if omitted
    #[arg(short, long)]
    language: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a snippet once in the sandbox
    Run {
        #[command(flatten)]
        source: SourceArgs,
        /// Print the execution result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run the safety check only
    Check {
        /// Source file, or `-` for stdin
        file: PathBuf,
    },
    /// Execute once and ask for a single fix on failure
    Debug {
        #[command(flatten)]
        source: SourceArgs,
        #[arg(long)]
        json: bool,
    },
    /// Run the full execute-fix-retry loop
    Retry {
        #[command(flatten)]
        source: SourceArgs,
        /// Attempt budget (1-10, defaults to the configured value)
        #[arg(short = 'n', long)]
        max_attempts: Option<u32>,
        /// Behaviour when no usable fix comes back: retry_unchanged or abort
        #[arg(long, value_name = "POLICY")]
        on_no_fix: Option<NoFixPolicy>,
        #[arg(long)]
        json: bool,
    },
    /// Start the HTTP gateway
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Print the default config as TOML, or write it to a file
    InitConfig {
        /// Destination; `default` means the per-user config path
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = match &cli.command {
        Commands::InitConfig { .. } => MenderConfig::default(),
        _ => load_config(cli.config.as_deref())?,
    };

    match cli.command {
        Commands::Run { source, json } => {
            let (language, code) = load_source(&source)?;
            let service = DebugService::from_config(config);
            let result = service.execute(&language, &code).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_result(&result);
            }
            Ok(exit_for(result.succeeded))
        }
        Commands::Check { file } => {
            let code = read_source(&file)?;
            let service = DebugService::from_config(config);
            let verdict = service.check(&code);
            if verdict.safe {
                println!("safe");
                Ok(ExitCode::SUCCESS)
            } else {
                println!("unsafe: {}", verdict.reason.unwrap_or_default());
                Ok(ExitCode::FAILURE)
            }
        }
        Commands::Debug { source, json } => {
            let (language, code) = load_source(&source)?;
            let service = DebugService::from_config(config);
            let report = service.debug_once(&language, &code).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
            Ok(exit_for(report.result.succeeded))
        }
        Commands::Retry {
            source,
            max_attempts,
            on_no_fix,
            json,
        } => {
            if let Some(policy) = on_no_fix {
                config.retry.on_no_fix = policy;
            }
            let (language, code) = load_source(&source)?;
            let service = DebugService::from_config(config);

            let cancel = CancellationToken::new();
            spawn_ctrl_c(cancel.clone());
            let summary = service
                .run_session_with_cancel(&language, &code, max_attempts, cancel)
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
            Ok(exit_for(summary.succeeded))
        }
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            let sandbox = ProcessSandbox::new(config.sandbox.clone());
            for language in Language::ALL {
                if !sandbox.is_available(language).await {
                    warn!(
                        "{} toolchain '{}' not found; {} requests will fail",
                        language.display_name(),
                        config.sandbox.toolchain_binary(language),
                        language
                    );
                }
            }
            let service = Arc::new(DebugService::from_config(config));

            let shutdown = CancellationToken::new();
            spawn_ctrl_c(shutdown.clone());
            GatewayServer::new(service).serve(shutdown).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::InitConfig { output, force } => init_config(output.as_deref(), force),
    }
}

fn load_config(explicit: Option<&Path>) -> Result<MenderConfig> {
    let (config, source) = MenderConfig::load(explicit)?;
    match &source {
        Some(path) => debug!("Loaded config from {}", path.display()),
        None => debug!("Using built-in config"),
    }
    Ok(config)
}

fn exit_for(succeeded: bool) -> ExitCode {
    if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping");
            cancel.cancel();
        }
    });
}

fn init_config(output: Option<&Path>, force: bool) -> Result<ExitCode> {
    let text = MenderConfig::default().to_toml()?;
    let Some(output) = output else {
        print!("{}", text);
        return Ok(ExitCode::SUCCESS);
    };

    let path = if output == Path::new("default") {
        default_config_path().ok_or_else(|| anyhow!("No config directory on this platform"))?
    } else {
        output.to_path_buf()
    };
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(&path, text).with_context(|| format!("Failed to write {}", path.display()))?;
    eprintln!("Wrote {}", path.display());
    Ok(ExitCode::SUCCESS)
}

/// Language name and code for a source argument
fn load_source(source: &SourceArgs) -> Result<(String, String)> {
    let language = resolve_language(&source.file, source.language.as_deref())?;
    let code = read_source(&source.file)?;
    Ok((language, code))
}

fn resolve_language(file: &Path, explicit: Option<&str>) -> Result<String> {
    if let Some(language) = explicit {
        return Ok(language.to_string());
    }
    file.extension()
        .and_then(|ext| ext.to_str())
        .and_then(Language::from_extension)
        .map(|l| l.as_str().to_string())
        .ok_or_else(|| {
            anyhow!(
                "Cannot infer the language of {}; pass --language ({})",
                file.display(),
                Language::supported_list()
            )
        })
}

fn read_source(file: &Path) -> Result<String> {
    if file == Path::new("-") {
        let mut code = String::new();
        std::io::stdin()
            .read_to_string(&mut code)
            .context("Failed to read code from stdin")?;
        return Ok(code);
    }
    std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))
}

fn print_result(result: &ExecutionResult) {
    print!("{}", result.stdout);
    eprint!("{}", result.stderr);
    if let Some(reason) = &result.failure_reason {
        eprintln!("[mender] {} ({} ms)", reason, result.duration_ms);
    } else if !result.succeeded {
        match result.exit_code {
            Some(code) => eprintln!("[mender] exited with status {}", code),
            None => eprintln!("[mender] failed"),
        }
    }
}

fn print_report(report: &DebugReport) {
    print_result(&report.result);
    for diag in &report.diagnostics {
        eprintln!("[mender] line {}: {}", diag.line, diag.message);
    }
    let Some(fix) = &report.fix else {
        return;
    };
    if !fix.is_usable() {
        warn!("No fix available: {}", fix.explanation);
        return;
    }
    println!("\n--- suggested fix ({}) ---", fix.provider.as_deref().unwrap_or("unknown"));
    println!("{}", fix.explanation);
    if let Some(confidence) = fix.confidence {
        println!("confidence: {:.2}", confidence);
    }
    println!("\n{}", fix.fixed_code);
}

fn print_summary(summary: &SessionSummary) {
    for attempt in &summary.attempts {
        let status = if attempt.succeeded { "ok" } else { "failed" };
        let reason = attempt
            .execution_result
            .failure_reason
            .as_ref()
            .map(|r| format!(" ({})", r))
            .unwrap_or_default();
        eprintln!("attempt {}: {}{}", attempt.index, status, reason);
        if let Some(fix) = attempt.fix.as_ref().filter(|f| f.is_usable()) {
            eprintln!("  fix: {}", fix.explanation);
        }
    }
    eprintln!(
        "session {}: {} after {} attempt(s) in {:.2}s",
        summary.session_id, summary.state, summary.total_attempts, summary.elapsed_seconds
    );
    if summary.succeeded {
        if let Some(last) = summary.attempts.last() {
            print!("{}", last.execution_result.stdout);
        }
        if summary.final_code != summary.initial_code {
            println!("\n--- final code ---\n{}", summary.final_code);
        }
    }
}
