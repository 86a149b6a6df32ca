//! # axiom-buffer-host
//!
//! Replays a buffer submission scenario through the host and reports every
//! compositor call and client notification it produced.

use anyhow::{bail, Result};
use clap::Parser;
use log::{error, info, warn};

use axiom_buffer_host::{HostConfig, Scenario, ScenarioReport};

#[derive(Parser)]
#[command(name = "axiom-buffer-host")]
#[command(about = "Replay buffer submission scenarios through the Axiom buffer host")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "~/.config/axiom/buffer-host.toml")]
    config: String,

    /// Scenario to replay (defaults to the built-in double buffering scenario)
    #[arg(short, long)]
    scenario: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Abort on client protocol violations
    #[arg(long)]
    strict: bool,

    /// Pretend the compositor has no presentation-time support
    #[arg(long)]
    no_presentation: bool,

    /// Print the full report as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration before logging so `general.debug` can raise the filter
    let loaded = HostConfig::load(&cli.config);
    let debug = cli.debug || loaded.as_ref().map_or(false, |c| c.general.debug);

    // Initialize logging
    if debug {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    info!("🚀 Starting Axiom buffer host {}", env!("CARGO_PKG_VERSION"));
    info!(
        "🔧 Built {} for {} ({})",
        env!("BUILD_DATE"),
        env!("TARGET_TRIPLE"),
        option_env!("GIT_COMMIT").unwrap_or("unknown commit")
    );

    let mut config = match loaded {
        Ok(config) => {
            info!("✅ Configuration loaded from: {}", cli.config);
            config
        }
        Err(e) => {
            error!("❌ Failed to load configuration: {:#}", e);
            info!("📝 Using default configuration");
            HostConfig::default()
        }
    };

    // Override config with CLI flags
    if cli.strict {
        config.surface.abort_on_violation = true;
        info!("🔒 Strict mode: protocol violations abort");
    }
    if cli.no_presentation {
        config.presentation.enabled = false;
        info!("🚫 Presentation feedback disabled via CLI flag");
    }

    let scenario = match &cli.scenario {
        Some(path) => Scenario::load(path)?,
        None => Scenario::reference(),
    };

    let report = scenario.run(&config);

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }

    if !report.passed() {
        bail!(
            "scenario '{}' failed: {} expectation failures, {} incomplete submissions",
            report.name,
            report.expectation_failures.len(),
            report.outstanding.len()
        );
    }

    Ok(())
}

fn print_summary(report: &ScenarioReport) {
    println!("Scenario: {}", report.name);
    println!("  compositor calls: {}", report.compositor_calls.len());
    println!(
        "  notifications:    {} ({} submissions)",
        report.notifications.len(),
        report.submissions()
    );
    println!("  rejected steps:   {}", report.errors.len());
    println!("  compositor faults: {}", report.faults);

    for failure in &report.errors {
        println!("  step {} rejected: {}", failure.step, failure.message);
    }
    for failure in &report.expectation_failures {
        println!("  step {} FAILED: {}", failure.step, failure.message);
    }
    for commit in &report.outstanding {
        warn!(
            "⏳ {} on {} never completed{}",
            commit.buffer,
            commit.surface,
            if commit.queued { " (still queued)" } else { "" }
        );
    }
}
