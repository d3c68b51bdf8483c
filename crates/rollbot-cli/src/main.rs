//! `rollbot` – interactive shell for one rolling toy.
//!
//! 1. Loads `~/.rollbot/config.toml`, writing defaults on first run.
//! 2. Builds the core over the simulated toy and starts the watchdog.
//! 3. Drops the user into a line REPL (`help` lists the commands).
//! 4. Ctrl-C latches the estop, shuts the core down within the shutdown
//!    bound and exits.

mod config;
mod repl;

use std::sync::Arc;

use colored::Colorize;
use rollbot_hal::{SimDiscovery, SimToy};
use rollbot_runtime::{DEFAULT_SHUTDOWN_TIMEOUT, RollbotContext, telemetry};
use tracing::warn;

/// Address the simulated toy advertises when none is configured.
const SIM_ADDRESS: &str = "sim-0";

fn main() {
    telemetry::init_tracing();
    print_banner();

    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => first_run(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };

    let mut builder = RollbotContext::builder(Arc::new(SimToy::new()))
        .config(cfg.core.clone())
        .discovery(Arc::new(SimDiscovery {
            address: Some(SIM_ADDRESS.to_string()),
        }));
    if let Some(address) = &cfg.address {
        builder = builder.address(address.clone());
    }
    let ctx = match builder.build() {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            eprintln!("{}: {}", "Failed to start the core".red().bold(), e);
            std::process::exit(1);
        }
    };

    let mut watchdog = match ctx.spawn_watchdog(cfg.watchdog()) {
        Ok(runner) => Some(runner),
        Err(e) => {
            warn!(error = %e, "watchdog thread could not start; reconnects are manual");
            None
        }
    };

    let ctx_ctrlc = Arc::clone(&ctx);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping the toy …".yellow().bold());
        if let Err(e) = ctx_ctrlc.dispatcher().estop("operator ctrl-c") {
            warn!(error = %e, "estop on ctrl-c failed");
        }
        let report = ctx_ctrlc.shutdown(DEFAULT_SHUTDOWN_TIMEOUT);
        println!(
            "{}",
            format!(
                "  ✓ Core shut down ({} command(s) cancelled).",
                report.commands_cancelled
            )
            .green()
        );
        std::process::exit(130);
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; use `estop` and `quit` instead");
    }

    println!(
        "  Safety limits: max speed {}, max duration {} ms, min interval {} ms",
        cfg.core.max_speed, cfg.core.max_duration_ms, cfg.core.min_interval_ms
    );
    println!("  Type {} for a list of commands.\n", "help".bold().cyan());

    repl::run(ctx.dispatcher());

    if let Some(mut runner) = watchdog.take() {
        runner.stop();
    }
    let report = ctx.shutdown(DEFAULT_SHUTDOWN_TIMEOUT);
    if report.commands_cancelled > 0 || report.tasks_cancelled > 0 {
        println!(
            "  {} command(s) and {} task(s) cancelled during shutdown.",
            report.commands_cancelled, report.tasks_cancelled
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// First run
// ─────────────────────────────────────────────────────────────────────────────

fn first_run() -> config::Config {
    println!();
    println!("  No configuration found. Let's set up rollbot.\n");

    let mut cfg = config::Config::default();
    let address = prompt_line("  Toy address (empty to discover) []: ", "");
    cfg.address = Some(address).filter(|a| !a.is_empty());

    let speed = prompt_line(
        &format!("  Maximum speed 0-255 [{}]: ", cfg.core.max_speed),
        &cfg.core.max_speed.to_string(),
    );
    match speed.parse::<u8>() {
        Ok(s) => cfg.core.max_speed = s,
        Err(_) => println!(
            "  {} '{}' is not a valid speed, keeping {}",
            "Warning:".yellow(),
            speed,
            cfg.core.max_speed
        ),
    }

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

fn print_banner() {
    println!();
    println!("{}", r#"   ____        ____    __        __ "#.bold().cyan());
    println!("{}", r#"  / __ \____  / / /_  / /  ___  / /_"#.bold().cyan());
    println!("{}", r#" / /_/ / __ \/ / / _ \/ _ \/ _ \/ __/"#.bold().cyan());
    println!("{}", r#"/_/ |_|\____/_/_/_.__/\___/\___/\__/ "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "rollbot".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Safety-gated control for a BLE rolling toy");
    println!();
}

fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::{BufRead, Write};
    print!("{}", msg);
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let t = line.trim().to_string();
            if t.is_empty() { default.to_string() } else { t }
        }
        Err(_) => default.to_string(),
    }
}
