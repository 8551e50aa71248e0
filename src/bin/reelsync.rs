use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use reelsync::app::App;
use reelsync::config::{AppPaths, TOKEN_ENV};
use reelsync::domain::{AssetDescriptor, DownloadTask, TaskKind, UrlTask};
use reelsync::error::ReelError;
use reelsync::library;
use reelsync::output::{JsonOutput, OutputMode, TextOutput};
use reelsync::progress::ConsoleProgress;

#[derive(Parser)]
#[command(name = "reelsync")]
#[command(about = "Search video sites and keep a local library in sync")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true, help = "Directory holding the settings and cache files")]
    data_dir: Option<String>,

    #[arg(long, global = true, env = TOKEN_ENV, hide_env_values = true)]
    token: Option<String>,

    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Search one channel for a keyword or author")]
    Search(SearchArgs),
    #[command(about = "Download a single URL")]
    Get(GetArgs),
    #[command(about = "List new uploads from favorite authors")]
    CheckUpdates(UpdateArgs),
    #[command(about = "List registered channels")]
    Channels,
    #[command(about = "Show or change settings")]
    Settings(SettingsArgs),
    #[command(about = "Show cached metadata for a channel")]
    Cache(CacheArgs),
    #[command(about = "Re-read Hanime1 upload dates for a search and rename old files")]
    RefreshDates(RefreshArgs),
    #[command(about = "Log in to Iwara and save the bearer token")]
    Login(LoginArgs),
    #[command(about = "Forget the saved Iwara token")]
    Logout,
}

#[derive(Args)]
struct SearchArgs {
    channel: String,
    keyword: String,

    #[arg(long, help = "Queue every result not yet on disk")]
    download: bool,
}

#[derive(Args)]
struct GetArgs {
    url: String,

    #[arg(long)]
    channel: Option<String>,

    #[arg(long, value_enum)]
    kind: Option<TaskKind>,
}

#[derive(Args)]
struct UpdateArgs {
    #[arg(long)]
    channel: Option<String>,

    #[arg(long)]
    download: bool,
}

#[derive(Args)]
struct SettingsArgs {
    #[command(subcommand)]
    command: SettingsCommand,
}

#[derive(Subcommand)]
enum SettingsCommand {
    Show,
    Set { key: String, value: String },
}

#[derive(Args)]
struct CacheArgs {
    channel: String,
}

#[derive(Args)]
struct RefreshArgs {
    keyword: String,

    #[arg(long, default_value = "Hanime1")]
    channel: String,
}

#[derive(Args)]
struct LoginArgs {
    #[arg(long)]
    email: String,

    #[arg(long)]
    password: String,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<ReelError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &ReelError) -> u8 {
    match error {
        ReelError::UnknownChannel(_)
        | ReelError::SettingsRead(_)
        | ReelError::SettingsParse(_) => 2,
        ReelError::Transport(_)
        | ReelError::Blocked { .. }
        | ReelError::Status { .. }
        | ReelError::Browser(_)
        | ReelError::MissingTool(_)
        | ReelError::ToolFailed(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };
    let paths = AppPaths::resolve(cli.data_dir.as_deref())?;
    let app = App::open(&paths, cli.token, Arc::new(ConsoleProgress::new()))?;

    let result = match cli.command {
        Commands::Search(args) => run_search(&app, args, mode),
        Commands::Get(args) => run_get(&app, args),
        Commands::CheckUpdates(args) => run_check_updates(&app, args, mode),
        Commands::Channels => {
            let channels = app.channels();
            match mode {
                OutputMode::Json => JsonOutput::print_channels(&channels),
                OutputMode::Text => TextOutput::print_channels(&channels, &app.media_info()),
            }
            .into_diagnostic()
        }
        Commands::Settings(args) => run_settings(&app, args),
        Commands::Cache(args) => {
            let cache = app.get_cache(&args.channel);
            match mode {
                OutputMode::Json => JsonOutput::print_cache(&cache),
                OutputMode::Text => TextOutput::print_cache(&cache),
            }
            .into_diagnostic()
        }
        Commands::RefreshDates(args) => {
            let mut assets = app.search(&args.keyword, &args.channel)?;
            let changed = app.refresh_dates(&args.channel, &mut assets)?;
            print_assets(&assets, mode)?;
            eprintln!("{changed} date(s) updated");
            Ok(())
        }
        Commands::Login(args) => {
            let token = app.login(&args.email, &args.password)?;
            println!("{token}");
            Ok(())
        }
        Commands::Logout => Ok(app.logout()?),
    };
    app.shutdown();
    result
}

fn print_assets(assets: &[AssetDescriptor], mode: OutputMode) -> miette::Result<()> {
    match mode {
        OutputMode::Json => JsonOutput::print_assets(assets),
        OutputMode::Text => TextOutput::print_assets(assets),
    }
    .into_diagnostic()
}

fn run_search(app: &App, args: SearchArgs, mode: OutputMode) -> miette::Result<()> {
    let assets = app.search(&args.keyword, &args.channel)?;
    print_assets(&assets, mode)?;
    if args.download {
        let pending = assets.into_iter().filter(|asset| !library::is_downloaded(asset));
        drain(app, pending.map(DownloadTask::from))?;
    }
    Ok(())
}

fn run_get(app: &App, args: GetArgs) -> miette::Result<()> {
    let mut task = UrlTask::new(&args.url);
    if let Some(channel) = args.channel.as_deref() {
        let channel = app
            .registry()
            .get(channel)
            .ok_or_else(|| ReelError::UnknownChannel(channel.to_string()))?;
        task = task.with_source(channel.name());
    }
    if let Some(kind) = args.kind {
        task = task.with_kind(kind);
    }
    drain(app, std::iter::once(DownloadTask::from(task)))
}

fn run_check_updates(app: &App, args: UpdateArgs, mode: OutputMode) -> miette::Result<()> {
    let channels = match args.channel {
        Some(channel) => vec![channel],
        None => app.registry().channel_names(),
    };
    let mut updates = Vec::new();
    for channel in &channels {
        updates.extend(app.check_updates(channel)?);
    }
    print_assets(&updates, mode)?;
    if args.download {
        drain(app, updates.into_iter().map(DownloadTask::from))?;
    }
    Ok(())
}

fn run_settings(app: &App, args: SettingsArgs) -> miette::Result<()> {
    match args.command {
        SettingsCommand::Show => JsonOutput::print_settings(&app.settings().snapshot()).into_diagnostic(),
        SettingsCommand::Set { key, value } => {
            app.settings()
                .update(|settings| settings.set_value(&key, &value))?;
            JsonOutput::print_settings(&app.settings().snapshot()).into_diagnostic()
        }
    }
}

fn drain(app: &App, tasks: impl Iterator<Item = DownloadTask>) -> miette::Result<()> {
    let mut queued = 0usize;
    for task in tasks {
        if app.enqueue(task) {
            queued += 1;
        }
    }
    if queued == 0 {
        return Ok(());
    }
    app.wait_idle();
    let stats = app.stats();
    TextOutput::print_stats(&stats).into_diagnostic()?;
    if stats.failed + stats.panicked > 0 {
        return Err(miette::Report::msg(format!(
            "{} of {queued} download(s) did not complete",
            stats.failed + stats.panicked
        )));
    }
    Ok(())
}
