/*
 *    Licensed under the Apache License, Version 2.0 (the "License");
 *    you may not use this file except in compliance with the License.
 *    You may obtain a copy of the License at
 *
 *        http://www.apache.org/licenses/LICENSE-2.0
 *
 *    Unless required by applicable law or agreed to in writing, software
 *    distributed under the License is distributed on an "AS IS" BASIS,
 *    WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *    See the License for the specific language governing permissions and
 *    limitations under the License.
 */

use crate::config::{AppConfig, LogFormat, LoggingConfig};
use crate::consumer::BatchConsumer;
use crate::processor::LogProcessor;
use crate::transport::PublishOptions;
use crate::Error;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::collections::HashMap;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt;

/// What the binary was asked to do
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Consume,
    Publish(PublishArgs),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishArgs {
    pub count: u32,
    pub prefix: String,
    pub priority: u8,
    pub interval: Duration,
    pub headers: HashMap<String, String>,
}

#[derive(Default)]
pub struct Cli {
    pub config: Option<AppConfig>,
    pub action: Option<Action>,
}

pub fn command() -> Command {
    Command::new("batchack")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Consume a broker queue in acknowledged batches, or publish test messages to it.")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Specify the profile path.")
                .global(true),
        )
        .arg(
            Arg::new("validate")
                .short('v')
                .long("validate")
                .help("Only the profile is verified, nothing is started.")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(
            Command::new("consume")
                .about("Consume the configured queue, flushing by size or timeout."),
        )
        .subcommand(
            Command::new("publish")
                .about("Publish numbered messages to the configured queue.")
                .arg(
                    Arg::new("count")
                        .long("count")
                        .value_parser(value_parser!(u32))
                        .default_value("100"),
                )
                .arg(
                    Arg::new("prefix")
                        .long("prefix")
                        .default_value("Message"),
                )
                .arg(
                    Arg::new("priority")
                        .long("priority")
                        .value_parser(value_parser!(u8))
                        .default_value("0"),
                )
                .arg(
                    Arg::new("interval-ms")
                        .long("interval-ms")
                        .help("Delay between two messages, in milliseconds.")
                        .value_parser(value_parser!(u64))
                        .default_value("100"),
                )
                .arg(
                    Arg::new("header")
                        .long("header")
                        .value_name("KEY=VALUE")
                        .help("Message header, may be repeated.")
                        .value_parser(parse_header)
                        .action(ArgAction::Append),
                ),
        )
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {}", raw)),
    }
}

fn action_from_matches(matches: &ArgMatches) -> Option<Action> {
    match matches.subcommand() {
        Some(("consume", _)) => Some(Action::Consume),
        Some(("publish", sub)) => Some(Action::Publish(PublishArgs {
            count: sub.get_one::<u32>("count").copied().unwrap_or(100),
            prefix: sub
                .get_one::<String>("prefix")
                .cloned()
                .unwrap_or_else(|| "Message".to_string()),
            priority: sub.get_one::<u8>("priority").copied().unwrap_or(0),
            interval: Duration::from_millis(
                sub.get_one::<u64>("interval-ms").copied().unwrap_or(100),
            ),
            headers: sub
                .get_many::<(String, String)>("header")
                .map(|headers| headers.cloned().collect())
                .unwrap_or_default(),
        })),
        _ => None,
    }
}

impl Cli {
    pub fn parse(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let matches = command().get_matches();

        let Some(config_path) = matches.get_one::<String>("config") else {
            return Err("missing --config".into());
        };
        let config = match AppConfig::from_file(config_path) {
            Ok(config) => config,
            Err(e) => {
                println!("Failed to load configuration file: {}", e);
                process::exit(1);
            }
        };

        // If you just verify the configuration, exit it
        if matches.get_flag("validate") {
            println!("The config is validated.");
            return Ok(());
        }

        let Some(action) = action_from_matches(&matches) else {
            return Err("missing subcommand, expected consume or publish".into());
        };
        self.action = Some(action);
        self.config = Some(config);
        Ok(())
    }

    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let (Some(config), Some(action)) = (&self.config, &self.action) else {
            return Ok(());
        };
        init_logging(&config.logging);

        match action {
            Action::Consume => consume(config).await?,
            Action::Publish(args) => publish(config, args).await?,
        }
        Ok(())
    }
}

async fn consume(config: &AppConfig) -> Result<(), Error> {
    let transport = config.transport.build()?;
    let consumer = BatchConsumer::new(transport, &config.consumer, Arc::new(LogProcessor))?;

    let token = CancellationToken::new();
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let token_clone = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, exiting...");
            },
            _ = sigterm.recv() => {
                info!("Received SIGTERM, exiting...");
            }
        }

        token_clone.cancel();
    });

    consumer.run(token).await
}

async fn publish(config: &AppConfig, args: &PublishArgs) -> Result<(), Error> {
    let transport = config.transport.build()?;
    transport.connect().await?;

    let queue = config.consumer.queue_options();
    transport.declare_queue(&queue).await?;

    let options = PublishOptions {
        priority: args.priority,
        persistent: true,
        headers: args.headers.clone(),
    };
    for i in 1..=args.count {
        let message = format!("{} {}", args.prefix, i);
        transport
            .publish(&queue.name, message.as_bytes(), &options)
            .await?;
        info!("Published: {}", message);
        if !args.interval.is_zero() {
            tokio::time::sleep(args.interval).await;
        }
    }

    transport.close().await
}

pub fn init_logging(config: &LoggingConfig) {
    let log_level = match config.level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber_builder = fmt::Subscriber::builder().with_max_level(log_level);

    // Check if we need to output logs to a file
    if let Some(file_path) = &config.file_path {
        // Create the file and parent directories if they don't exist
        if let Some(parent) = std::path::Path::new(file_path).parent() {
            std::fs::create_dir_all(parent).ok();
        }

        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)
        {
            Ok(file) => {
                let writer = std::sync::Mutex::new(file);
                let result = match config.format {
                    LogFormat::JSON => tracing::subscriber::set_global_default(
                        subscriber_builder.with_writer(writer).json().finish(),
                    ),
                    LogFormat::PLAIN => tracing::subscriber::set_global_default(
                        subscriber_builder.with_writer(writer).finish(),
                    ),
                };
                if let Err(e) = result {
                    eprintln!("Failed to set log subscriber: {}", e);
                }

                info!("Logging to file: {}", file_path);
                return;
            }
            Err(e) => {
                eprintln!("Failed to open log file {}: {}", file_path, e);
                // Fall back to console logging
            }
        }
    }

    let result = match config.format {
        LogFormat::JSON => {
            tracing::subscriber::set_global_default(subscriber_builder.json().finish())
        }
        LogFormat::PLAIN => tracing::subscriber::set_global_default(subscriber_builder.finish()),
    };
    if let Err(e) = result {
        eprintln!("Failed to set log subscriber: {}", e);
    }
}
