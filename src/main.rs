use anyhow::Result;
use clap::Parser;
use conductor::{
    ComponentManifest, LocalMessageBus, LoopbackHub, Orchestrator, OrchestratorConfig,
};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(about = "Dependency-aware launcher and supervisor for multi-component services")]
#[command(version)]
#[command(long_about = "Conductor launches the components declared in its configuration in \
dependency order, keeps them registered with the hub through heartbeats, restarts the ones \
that stop answering and breaks dependency cycles and stuck launches as they appear.")]
struct Args {
    #[arg(short, long, default_value = "conductor.toml", help = "TOML file declaring settings and components")]
    config: String,

    #[arg(short, long, help = "Log at debug level")]
    debug: bool,

    #[arg(short, long, help = "Log at info level")]
    verbose: bool,

    #[arg(short, long, help = "Log errors only")]
    quiet: bool,

    #[arg(long, help = "Validate the configuration file and exit without launching anything")]
    validate_config: bool,

    #[arg(long, help = "Print a documented default configuration and exit")]
    print_config: bool,

    #[arg(long, help = "Print the resolved startup order and exit")]
    dry_run: bool,

    /// Log output format; `pretty` when omitted
    #[arg(long, value_name = "FORMAT", help = "json, pretty or compact")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_default_config()?;
        return Ok(());
    }

    init_logging(&args)?;

    info!("conductor v{} using {}", env!("CARGO_PKG_VERSION"), args.config);

    let config = OrchestratorConfig::load_from_file(&args.config).map_err(|e| {
        error!("Cannot load {}: {}", args.config, e);
        e
    })?;

    if args.validate_config {
        match config.validate() {
            Ok(()) => {
                println!("✓ {} is valid ({} components)", args.config, config.components.len());
                return Ok(());
            }
            Err(e) => {
                error!("Invalid configuration: {}", e);
                eprintln!("✗ {}", e);
                std::process::exit(1);
            }
        }
    }

    let bus_capacity = config.system.event_bus_capacity;
    let orchestrator = Orchestrator::new(
        config,
        Arc::new(LoopbackHub::new()),
        Some(Arc::new(LocalMessageBus::new(bus_capacity))),
    )
    .map_err(|e| {
        error!("Cannot build orchestrator: {}", e);
        e
    })?;

    if args.dry_run {
        let (order, had_cycles) = orchestrator.startup_order();
        if had_cycles {
            println!("! Dependency cycles would be broken at startup");
        }
        println!("Startup order:");
        for (index, id) in order.iter().enumerate() {
            println!("  {}. {}", index + 1, id);
        }
        return Ok(());
    }

    let report = orchestrator.start().await;
    if report.succeeded() < report.total() {
        error!("Components failed to start: {:?}", report.failed());
    }

    let exit_code = orchestrator.run().await?;
    info!("conductor exiting with code {}", exit_code);
    std::process::exit(exit_code);
}

fn init_logging(args: &Args) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let level = match (args.debug, args.verbose, args.quiet) {
        (true, _, _) => "debug",
        (_, true, _) => "info",
        (_, _, true) => "error",
        _ => "warn",
    };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("conductor={}", level)));

    let fmt_layer = match args.log_format.as_deref().unwrap_or("pretty") {
        "json" => fmt::layer()
            .json()
            .with_current_span(false)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        "compact" => fmt::layer().compact().with_target(false).boxed(),
        other => {
            if other != "pretty" {
                eprintln!("Unknown log format '{}', falling back to pretty", other);
            }
            fmt::layer()
                .pretty()
                .with_thread_ids(args.debug)
                .with_file(args.debug)
                .with_line_number(args.debug)
                .boxed()
        }
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .try_init()?;
    Ok(())
}

/// Print the default configuration, with two sample components, in TOML format
fn print_default_config() -> Result<()> {
    let mut config = OrchestratorConfig::default();
    config.components.insert(
        "hermes".to_string(),
        ComponentManifest {
            command: Some("/usr/local/bin/hermes".to_string()),
            args: vec!["--port".to_string(), "9000".to_string()],
            ..Default::default()
        },
    );
    config.components.insert(
        "harmonia".to_string(),
        ComponentManifest {
            dependencies: vec!["hermes".to_string()],
            priority: 10,
            timeout_secs: Some(60),
            command: Some("/usr/local/bin/harmonia".to_string()),
            ..Default::default()
        },
    );

    println!("# Conductor configuration file");
    println!("# Every value below is the default. Any key can be overridden from the");
    println!("# environment, e.g. CONDUCTOR_HEARTBEAT__RETRY_INTERVAL_MS=2000.");
    println!("#");
    println!("# [components.<id>] activation is one of immediate, trigger or manual;");
    println!("# trigger components need a trigger_topic.");
    println!();
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
