//! `pollen` – pollination drone actuator service.
//!
//! 1. Loads `~/.pollen/config.toml`, writing a default file on first run.
//! 2. Wires the serial channel (real ports or the simulated controller), the
//!    classifier bridge and the trigger pipeline.
//! 3. Serves the HTTP/WebSocket API until **Ctrl-C**, then disconnects the
//!    controller.

mod config;

use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use tracing::{error, info, warn};

use pollen_cockpit::{AppState, CockpitServer};
use pollen_hal::{PortProvider, SerialChannel, SerialPollinator, SimPorts, SystemPorts};
use pollen_middleware::EventBus;
use pollen_perception::{ClassificationGateway, ProcessClassifier};
use pollen_runtime::TriggerPipeline;
use pollen_types::PollenError;

use config::Config;

fn main() -> ExitCode {
    // Installed before the runtime exists; the exporter is synchronous.
    let _telemetry = pollen_runtime::telemetry::init_tracing("pollen");

    print_banner();
    let cfg = load_config();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start the async runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(serve(cfg)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "pollen service stopped with an error");
            ExitCode::FAILURE
        }
    }
}

fn load_config() -> Config {
    match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => {
            let mut cfg = Config::default();
            match config::save(&cfg) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            config::apply_env_overrides(&mut cfg);
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    }
}

async fn serve(cfg: Config) -> Result<(), PollenError> {
    let bus = EventBus::default();

    let provider: Arc<dyn PortProvider> = if cfg.simulate {
        println!("  Controller: {}", "simulated".yellow());
        Arc::new(SimPorts::default())
    } else {
        println!("  Controller: {}", "serial".green());
        Arc::new(SystemPorts)
    };
    let channel = Arc::new(SerialChannel::with_bus(cfg.channel_config(), provider, bus.clone()));
    let device = Arc::new(SerialPollinator::new(Arc::clone(&channel)));

    let classifier = ProcessClassifier::new(cfg.classifier_config());
    if classifier.is_available().await {
        info!(script = %cfg.classifier_script.display(), "classifier ready");
    } else {
        warn!(
            script = %cfg.classifier_script.display(),
            model = %cfg.classifier_model.display(),
            "classifier unavailable; frames will be reported unclassified"
        );
    }

    let pipeline = TriggerPipeline::new(Arc::new(classifier), device, cfg.pipeline_config())
        .with_bus(bus.clone());
    let state = AppState::new(Arc::clone(&channel), Arc::new(pipeline), bus);

    if cfg.auto_connect {
        match channel.connect(cfg.serial_port.as_deref()).await {
            Ok(port) => info!(%port, "controller connected at startup"),
            Err(e) => warn!(error = %e, "auto-connect failed; use POST /api/pollination/connect"),
        }
    }

    println!(
        "  API listening on {}\n",
        format!("http://0.0.0.0:{}", cfg.api_port).bold().cyan()
    );

    let result = CockpitServer::new(state)
        .with_port(cfg.api_port)
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            println!();
            println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
        })
        .await;

    channel.disconnect().await;
    println!("{}", "  ✓ Controller disconnected.".green());
    result
}

fn print_banner() {
    println!();
    println!("{}", r#"    ____        ____         "#.bold().yellow());
    println!("{}", r#"   / __ \____  / / /__  ____ "#.bold().yellow());
    println!("{}", r#"  / /_/ / __ \/ / / _ \/ __ \"#.bold().yellow());
    println!("{}", r#" / ____/ /_/ / / /  __/ / / /"#.bold().yellow());
    println!("{}", r#"/_/    \____/_/_/\___/_/ /_/ "#.bold().yellow());
    println!();
    println!(
        "  {} {}",
        "Pollen".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Pollination drone actuator service");
    println!();
}
