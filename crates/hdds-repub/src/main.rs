// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HDDS Republisher CLI
//!
//! Reads `topic<TAB>payload` lines from stdin, runs them through the
//! configured rules and writes `destination<TAB>payload` lines to stdout.
//! Logs and statistics go to stderr.
//!
//! # Usage
//!
//! ```bash
//! # Run the pipe
//! hdds-repub --config repub.toml < input.tsv > output.tsv
//!
//! # Generate / check configuration
//! hdds-repub gen-config -o repub.toml
//! hdds-repub validate -c repub.toml
//!
//! # Show what the rules make of one message
//! hdds-repub eval -c repub.toml -t sensors/temp -p '{"value": 42}'
//! ```

use clap::{Parser, Subcommand};
use hdds_repub::transport::StdioBroker;
use hdds_repub::{
    ConnectionSupervisor, InboundListener, InboundMessage, ListenerStatsSnapshot,
    PoolStatsSnapshot, ProducerPool, RepubConfig, RuleEngine,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// HDDS Republisher
#[derive(Parser, Debug)]
#[command(name = "hdds-repub")]
#[command(about = "HDDS Republisher - rule-based republishing with reliable delivery")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Statistics reporting interval (seconds, 0 to disable; overrides config)
    #[arg(long)]
    stats_interval: Option<u64>,

    /// Log level (trace, debug, info, warn, error; overrides config)
    #[arg(long)]
    log_level: Option<String>,

    /// Seconds to wait for pending messages on shutdown
    #[arg(long, default_value = "10")]
    flush_timeout: u64,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "repub.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Evaluate the rules against one message
    Eval {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,

        /// Source topic
        #[arg(short, long)]
        topic: String,

        /// Message payload
        #[arg(short, long)]
        payload: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Handle subcommands
    if let Some(cmd) = args.command {
        init_logging(args.log_level.as_deref().unwrap_or("info"));
        return match cmd {
            Commands::GenConfig { output } => cmd_gen_config(output),
            Commands::Validate { config } => cmd_validate(config),
            Commands::Eval {
                config,
                topic,
                payload,
            } => cmd_eval(config, &topic, &payload),
        };
    }

    let Some(config_path) = args.config else {
        eprintln!("Missing --config (use `hdds-repub gen-config` to create one)");
        std::process::exit(2);
    };
    let config = RepubConfig::from_file(&config_path)?;
    init_logging(args.log_level.as_deref().unwrap_or(&config.log_level));

    let stats_interval = args.stats_interval.unwrap_or(config.stats_interval_secs);
    run_pipe(
        config,
        stats_interval,
        Duration::from_secs(args.flush_timeout),
    )
    .await
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_pipe(
    config: RepubConfig,
    stats_interval: u64,
    flush_timeout: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let broker = Arc::new(StdioBroker::new());
    let engine = Arc::new(RuleEngine::from_config(&config.rules)?);

    let mut builder = ProducerPool::builder(Arc::clone(&broker))
        .endpoints(config.sink.endpoints.clone())
        .options(config.sink.pool_options());
    for (destination, schema) in config.sink.load_schemas()? {
        tracing::info!("Destination '{}' uses schema {}", destination, schema.type_name());
        builder = builder.schema(destination, schema);
    }
    let pool = builder.build();

    let source = ConnectionSupervisor::new(
        "source",
        Arc::clone(&broker),
        config.source.endpoints.clone(),
        config.source.connect_timeout(),
    );
    let listener = Arc::new(
        InboundListener::new(source, config.source.topics.clone(), engine, pool.clone())
            .with_options(config.source.listener_options()),
    );

    eprintln!("HDDS Republisher v{} ({})", env!("CARGO_PKG_VERSION"), config.name);
    eprintln!("=====================================");
    for (i, rule) in config.rules.iter().enumerate() {
        eprintln!("Rule [{}] -> {}", i, rule.destination);
    }
    eprintln!();

    let handle = listener.run()?;

    // Stats reporting task
    if stats_interval > 0 {
        let stats_pool = pool.clone();
        let stats_listener = Arc::clone(&listener);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(stats_interval));
            interval.tick().await;
            loop {
                interval.tick().await;
                if !stats_listener.is_running() {
                    break;
                }
                print_stats(&stats_pool.stats(), &stats_listener.stats());
            }
        });
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            eprintln!("\nShutting down...");
        }
        _ = broker.wait_eof() => {
            tracing::info!("End of input");
        }
    }

    handle.stop().await;
    if !pool.flush(flush_timeout).await {
        tracing::warn!(
            "{} messages still pending after {:?}, dropping them",
            pool.pending(),
            flush_timeout
        );
    }

    eprintln!("\nFinal Statistics:");
    print_stats(&pool.stats(), &listener.stats());
    Ok(())
}

fn cmd_gen_config(output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let toml_str = RepubConfig::example().to_toml()?;

    // Add comments
    let content = format!(
        r#"# HDDS Republisher Configuration
# Generated by hdds-repub gen-config
#
# Rule match values: JSON scalars match exactly; strings may be MQTT
# wildcards ("a/+", "a/#"), globs ("temp_*") or regexes ("re:^x$").
# Templates: {{field}} in values, %field% in destinations.

{}
"#,
        toml_str
    );

    std::fs::write(&output, content)?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let result = RepubConfig::from_file(&config_path).and_then(|config| {
        config.sink.load_schemas()?;
        RuleEngine::from_config(&config.rules)?;
        Ok(config)
    });

    match result {
        Ok(config) => {
            println!("Configuration valid!");
            println!();
            println!("Republisher: {}", config.name);
            println!("Source topics: {}", config.source.topics.join(", "));
            println!("Rules: {}", config.rules.len());
            for (i, rule) in config.rules.iter().enumerate() {
                let matches: Vec<String> = rule
                    .matches
                    .iter()
                    .map(|(field, pattern)| format!("{}={}", field, pattern))
                    .collect();
                println!(
                    "  [{}] {} -> {} {}",
                    i,
                    if matches.is_empty() {
                        "*".to_string()
                    } else {
                        matches.join(" ")
                    },
                    rule.destination,
                    if rule.template.is_some() {
                        "(templated)"
                    } else {
                        ""
                    }
                );
            }
            for (destination, path) in &config.sink.schemas {
                println!("Schema: {} <- {}", destination, path.display());
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    }
}

fn cmd_eval(
    config_path: PathBuf,
    topic: &str,
    payload: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = RepubConfig::from_file(&config_path)?;
    let engine = RuleEngine::from_config(&config.rules)?;

    let message = InboundMessage::parse(topic, payload.as_bytes());
    if message.raw {
        println!("(payload is not a JSON object, treated as raw text)");
    }

    let instructions = engine.evaluate(&message);
    if instructions.is_empty() {
        println!("No rule matched.");
    }
    for (destination, value) in instructions {
        println!("{}\t{}", destination, value);
    }
    Ok(())
}

fn print_stats(pool: &PoolStatsSnapshot, listener: &ListenerStatsSnapshot) {
    eprintln!("--- Republisher Statistics ---");
    eprintln!(
        "  Inbound: {} received, {} raw, {} instructions, {} overflowed",
        listener.received, listener.parse_fallbacks, listener.instructions, listener.overflowed
    );
    eprintln!(
        "  Outbound: {} produced, {} sent / {} attempted, {} pending",
        pool.produced, pool.sent, pool.attempted, pool.pending
    );
    eprintln!(
        "  Losses: {} encode failures, {} dropped, {} evicted, {} rejected ({} requeued)",
        pool.encode_failures, pool.dropped, pool.evicted, pool.rejected, pool.requeued
    );
}
