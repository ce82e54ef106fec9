use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Arg, ArgAction, ArgMatches, Command};
use tracing_subscriber::EnvFilter;

use prerender_runtime::{
    orchestrator, DurableEventQueue, FileBlobs, FileKv, RuntimeConfig, RuntimeContainer,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    let matches = Command::new("prerender")
        .version(VERSION)
        .about("Prerenders commerce product pages from the catalog event journal")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Path to a TOML configuration file")
                .global(true),
        )
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .value_name("DIR")
                .help("Directory for durable KV and blob storage")
                .default_value(".prerender")
                .global(true),
        )
        .subcommand(
            Command::new("run")
                .about("Execute one orchestrator invocation and print the result document")
                .arg(
                    Arg::new("option")
                        .short('o')
                        .long("option")
                        .value_name("KEY=VALUE")
                        .help("Override a configuration option")
                        .action(ArgAction::Append),
                ),
        )
        .subcommand(
            Command::new("queue")
                .about("Inspect or clear the durable event queue")
                .subcommand(Command::new("status").about("Show queue size and statistics"))
                .subcommand(Command::new("clear").about("Drop all pending events")),
        )
        .subcommand(
            Command::new("doctor")
                .about("Validate configuration and remote connectivity without mutating anything"),
        )
        .subcommand_required(true)
        .arg_required_else_help(true)
        .get_matches();

    init_tracing();

    let code = match matches.subcommand() {
        Some(("run", sub)) => cmd_run(&matches, sub).await,
        Some(("queue", sub)) => cmd_queue(&matches, sub).await,
        Some(("doctor", _)) => cmd_doctor(&matches).await,
        _ => unreachable!("subcommand required"),
    };
    std::process::exit(code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| match std::env::var("LOG_LEVEL") {
            Ok(level) => EnvFilter::try_new(level),
            Err(_) => EnvFilter::try_new("info"),
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(matches: &ArgMatches, overrides: HashMap<String, String>) -> Option<RuntimeConfig> {
    let file = matches.get_one::<String>("config").map(Path::new);
    match RuntimeConfig::resolve(file, &overrides) {
        Ok(config) => Some(config),
        Err(err) => {
            eprintln!("configuration error: {err}");
            None
        }
    }
}

fn data_dir(matches: &ArgMatches) -> PathBuf {
    PathBuf::from(
        matches
            .get_one::<String>("data-dir")
            .expect("default provided"),
    )
}

fn option_overrides(sub: &ArgMatches) -> HashMap<String, String> {
    sub.get_many::<String>("option")
        .map(|values| {
            values
                .filter_map(|raw| {
                    raw.split_once('=')
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

async fn cmd_run(matches: &ArgMatches, sub: &ArgMatches) -> i32 {
    let Some(config) = load_config(matches, option_overrides(sub)) else {
        return 2;
    };
    let dir = data_dir(matches);
    let kv = Arc::new(FileKv::new(dir.join("kv.json")));
    let blobs = Arc::new(FileBlobs::new(dir.join("blobs")));

    let container = match RuntimeContainer::build(config, kv, blobs).await {
        Ok(container) => container,
        Err(err) => {
            eprintln!("startup error: {err}");
            return 2;
        }
    };

    let result = orchestrator::run(&container).await;
    println!(
        "{}",
        serde_json::to_string_pretty(&result).unwrap_or_else(|_| "{}".to_string())
    );
    match result.status {
        prerender_runtime::RunState::Error => 1,
        _ => 0,
    }
}

async fn cmd_queue(matches: &ArgMatches, sub: &ArgMatches) -> i32 {
    let Some(config) = load_config(matches, HashMap::new()) else {
        return 2;
    };
    let kv = Arc::new(FileKv::new(data_dir(matches).join("kv.json")));
    let queue = DurableEventQueue::new(kv, config.queue);

    match sub.subcommand() {
        Some(("clear", _)) => match queue.clear().await {
            Ok(()) => {
                println!("queue cleared");
                0
            }
            Err(err) => {
                eprintln!("queue error: {err}");
                1
            }
        },
        _ => match queue.status().await {
            Ok(status) => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&status).unwrap_or_else(|_| "{}".to_string())
                );
                0
            }
            Err(err) => {
                eprintln!("queue error: {err}");
                1
            }
        },
    }
}

async fn cmd_doctor(matches: &ArgMatches) -> i32 {
    let Some(config) = load_config(matches, HashMap::new()) else {
        return 2;
    };
    if let Err(err) = config.validate() {
        eprintln!("config check failed: {err}");
        return 1;
    }
    println!("config: ok");

    let dir = data_dir(matches);
    let kv = Arc::new(FileKv::new(dir.join("kv.json")));
    let blobs = Arc::new(FileBlobs::new(dir.join("blobs")));
    let container = match RuntimeContainer::build(config, kv, blobs).await {
        Ok(container) => container,
        Err(err) => {
            eprintln!("catalog configuration check failed: {err}");
            return 1;
        }
    };

    match container.tokens.get_access_token().await {
        Ok(_) => println!("identity: ok"),
        Err(err) => {
            eprintln!("identity check failed: {err}");
            return 1;
        }
    }

    match container.journal.fetch(None, 1).await {
        Ok(page) => println!("journal: ok ({} event(s) visible)", page.events.len()),
        Err(err) => {
            eprintln!("journal check failed: {err}");
            return 1;
        }
    }

    0
}
