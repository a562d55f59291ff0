//! Thin CLI layer: parse args, styled output, and call into cask-core.
//! Crash-proof: panic caught and reported; all errors return Result.

use clap::{Arg, ArgAction, Command};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::env;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

// ---- UI helpers (no-op when stdout isn't a TTY) ----

fn use_color() -> bool {
    std::io::stdout().is_terminal()
        && env::var("NO_COLOR").unwrap_or_default().is_empty()
}

fn success(msg: &str) {
    if use_color() {
        println!("{}", msg.green());
    } else {
        println!("{}", msg);
    }
}

fn error(msg: &str) {
    if use_color() {
        eprintln!("{}", msg.red());
    } else {
        eprintln!("{}", msg);
    }
}

fn info(msg: &str) {
    if use_color() {
        println!("{}", msg.cyan());
    } else {
        println!("{}", msg);
    }
}

fn dim(msg: &str) {
    if use_color() {
        println!("{}", msg.dimmed());
    } else {
        println!("{}", msg);
    }
}

fn spinner(message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    if use_color() {
        bar.set_style(
            ProgressStyle::default_spinner()
                .tick_chars("⠁⠂⠄⠈⠐⠠⠰⠸⠹")
                .template("{spinner:.dim} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(80));
    }
    bar.set_message(message.to_string());
    bar
}

/// Split `alias@range` into alias and specifier; handles scoped names.
fn parse_spec(spec: &str) -> (String, String) {
    if let Some(at) = spec.rfind('@') {
        if at > 0 {
            return (spec[..at].to_string(), spec[at + 1..].to_string());
        }
    }
    (spec.to_string(), "latest".to_string())
}

fn server_prefix(host: &str, port: u16) -> String {
    format!("http://{}:{}", host, port)
}

/// Probe a server. POST /prune is always refused (403), so a 403 with a
/// JSON error body means a live store server.
fn server_is_up(prefix: &str) -> bool {
    match ureq::post(&format!("{}/prune", prefix))
        .timeout(Duration::from_secs(2))
        .send_string("{}")
    {
        Ok(_) => false,
        Err(ureq::Error::Status(code, _)) => code == 403,
        Err(_) => false,
    }
}

fn store_config(matches: &clap::ArgMatches) -> cask_core::StoreConfig {
    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let mut config = cask_core::load_config(&cwd);
    if let Some(dir) = matches.get_one::<String>("store-dir") {
        config.store_dir = PathBuf::from(dir);
    }
    if let Some(registry) = matches.get_one::<String>("registry") {
        config.registry = registry.trim_end_matches('/').to_string();
    }
    if matches.get_flag("offline") {
        config.offline = true;
    }
    config
}

fn local_store(
    config: cask_core::StoreConfig,
) -> Result<Arc<dyn cask_core::StoreController>, String> {
    let resolver = Arc::new(cask_core::RegistryResolver::new(
        &config.registry,
        config.auth_token.clone(),
    ));
    let store = cask_core::create_package_store(resolver, config).map_err(|e| e.to_string())?;
    Ok(Arc::new(store))
}

async fn run_server(matches: &clap::ArgMatches) -> Result<(), String> {
    let host = matches
        .get_one::<String>("host")
        .map(|s| s.as_str())
        .unwrap_or("127.0.0.1");
    let port = *matches.get_one::<u16>("port").unwrap_or(&5813);
    let config = store_config(matches);
    let store_dir = config.store_dir.clone();
    let store = local_store(config)?;

    let mut settings = cask_core::ServerSettings::new(host, port);
    settings.ignore_stop_requests = matches.get_flag("ignore-stop-requests");
    settings.ignore_upload_requests = matches.get_flag("ignore-upload-requests");

    let server = cask_core::create_server(store, settings)
        .await
        .map_err(|e| e.to_string())?;
    info(&format!("Store server listening on {}", server.addr()));
    dim(&format!("Store directory: {}", store_dir.display()));
    cask_core::log(&store_dir, &format!("server listening on {}", server.addr()));

    tokio::select! {
        _ = server.wait_closed() => {}
        _ = tokio::signal::ctrl_c() => {
            info("Shutting down …");
            server.close().await;
        }
    }
    cask_core::log(&store_dir, "server stopped");
    success("Server stopped.");
    Ok(())
}

async fn run_fetch(matches: &clap::ArgMatches) -> Result<(), String> {
    let spec = matches
        .get_one::<String>("package")
        .ok_or("A package spec is required")?;
    let (alias, bare_specifier) = parse_spec(spec);
    let wanted = cask_core::WantedPackage { alias, bare_specifier };
    let opts = cask_core::RequestOptions {
        force: matches.get_flag("force"),
        fetch_raw_manifest: matches.get_flag("manifest"),
    };

    let store: Arc<dyn cask_core::StoreController> =
        if let Some(remote) = matches.get_one::<String>("remote") {
            Arc::new(cask_core::connect_store_controller(remote))
        } else {
            local_store(store_config(matches))?
        };

    let bar = spinner(&format!("Fetching {} …", spec));
    let result = store.request_package(&wanted, &opts).await;
    bar.finish_and_clear();
    let result = result.map_err(|e| e.to_string())?;

    success(&format!("{} ({:?})", result.id, result.resolved_from));
    dim(&format!("Index: {}", result.files_index_file.display()));
    dim(&format!("Files: {}", result.files_index.len()));
    if matches.get_flag("manifest") {
        match result.fetching().await.map_err(|e| e.to_string())? {
            Some(manifest) => println!(
                "{}",
                serde_json::to_string_pretty(&manifest).unwrap_or_else(|_| "{}".to_string())
            ),
            None => dim("No manifest in package."),
        }
    }
    store.close().await;
    Ok(())
}

async fn run_prune(matches: &clap::ArgMatches) -> Result<(), String> {
    let store = local_store(store_config(matches))?;
    let bar = spinner("Pruning store …");
    let report = store.prune().await;
    bar.finish_and_clear();
    let report = report.map_err(|e| e.to_string())?;
    store.close().await;
    success(&format!(
        "Removed {} blob(s), freed {} KB.",
        report.removed_blobs,
        report.freed_bytes / 1024
    ));
    Ok(())
}

fn run_stop(matches: &clap::ArgMatches) -> Result<(), String> {
    let host = matches
        .get_one::<String>("host")
        .map(|s| s.as_str())
        .unwrap_or("127.0.0.1");
    let port = *matches.get_one::<u16>("port").unwrap_or(&5813);
    let prefix = server_prefix(host, port);
    match ureq::post(&format!("{}/stop", prefix))
        .timeout(Duration::from_secs(5))
        .send_string("{}")
    {
        Ok(_) => {
            success("Server stopping.");
            Ok(())
        }
        Err(ureq::Error::Status(403, _)) => {
            Err("Server refuses stop requests (started with --ignore-stop-requests).".to_string())
        }
        Err(e) => Err(format!("No server at {}: {}", prefix, e)),
    }
}

fn run_status(matches: &clap::ArgMatches) -> Result<(), String> {
    let host = matches
        .get_one::<String>("host")
        .map(|s| s.as_str())
        .unwrap_or("127.0.0.1");
    let port = *matches.get_one::<u16>("port").unwrap_or(&5813);
    let prefix = server_prefix(host, port);
    if server_is_up(&prefix) {
        success(&format!("Store server is running at {}.", prefix));
        Ok(())
    } else {
        Err(format!("No store server at {}.", prefix))
    }
}

fn run() -> Result<(), String> {
    let host_arg = Arg::new("host")
        .long("host")
        .help("Server hostname (default: 127.0.0.1)");
    let port_arg = Arg::new("port")
        .long("port")
        .value_parser(clap::value_parser!(u16))
        .help("Server port (default: 5813)");
    let store_dir_arg = Arg::new("store-dir")
        .long("store-dir")
        .help("Store directory (default: CASK_STORE_DIR or ~/.cask-store)");
    let registry_arg = Arg::new("registry")
        .long("registry")
        .help("Registry base URL (default: https://registry.npmjs.org)");
    let offline_arg = Arg::new("offline")
        .long("offline")
        .action(ArgAction::SetTrue)
        .help("Only use the store; fail on misses instead of fetching (or set CASK_OFFLINE=1)");

    let matches = Command::new("cask")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Content-addressable package store with a shared store server")
        .after_help(
            "Examples:\n  cask fetch is-positive@3.1.0\n  cask server --port 5813\n  cask fetch lodash --remote http://127.0.0.1:5813\n  cask prune",
        )
        .subcommand(
            Command::new("server")
                .about("Run the store server")
                .arg(host_arg.clone())
                .arg(port_arg.clone())
                .arg(store_dir_arg.clone())
                .arg(registry_arg.clone())
                .arg(offline_arg.clone())
                .arg(
                    Arg::new("ignore-stop-requests")
                        .long("ignore-stop-requests")
                        .action(ArgAction::SetTrue)
                        .help("Answer POST /stop with 403 and keep running"),
                )
                .arg(
                    Arg::new("ignore-upload-requests")
                        .long("ignore-upload-requests")
                        .action(ArgAction::SetTrue)
                        .help("Answer POST /upload with 403; no side-effects cache writes"),
                ),
        )
        .subcommand(
            Command::new("stop")
                .about("Stop a running store server")
                .arg(host_arg.clone())
                .arg(port_arg.clone()),
        )
        .subcommand(
            Command::new("status")
                .about("Check whether a store server is running")
                .arg(host_arg.clone())
                .arg(port_arg.clone()),
        )
        .subcommand(
            Command::new("fetch")
                .about("Fetch a package into the store (local or via a server)")
                .arg(
                    Arg::new("package")
                        .required(true)
                        .help("Package spec, e.g. lodash@^4.17.0 or lodash"),
                )
                .arg(
                    Arg::new("remote")
                        .long("remote")
                        .help("Store server URL, e.g. http://127.0.0.1:5813; omit for in-process"),
                )
                .arg(
                    Arg::new("force")
                        .long("force")
                        .action(ArgAction::SetTrue)
                        .help("Re-fetch even on a store hit"),
                )
                .arg(
                    Arg::new("manifest")
                        .long("manifest")
                        .action(ArgAction::SetTrue)
                        .help("Also print the package manifest"),
                )
                .arg(store_dir_arg.clone())
                .arg(registry_arg.clone())
                .arg(offline_arg.clone()),
        )
        .subcommand(
            Command::new("prune")
                .about("Remove content blobs referenced by no package")
                .arg(store_dir_arg.clone())
                .arg(registry_arg.clone())
                .arg(offline_arg.clone()),
        )
        .get_matches();

    match matches.subcommand() {
        Some(("stop", sub_m)) => return run_stop(sub_m),
        Some(("status", sub_m)) => return run_status(sub_m),
        _ => {}
    }

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| format!("Failed to start runtime: {}", e))?;
    match matches.subcommand() {
        Some(("server", sub_m)) => runtime.block_on(run_server(sub_m)),
        Some(("fetch", sub_m)) => runtime.block_on(run_fetch(sub_m)),
        Some(("prune", sub_m)) => runtime.block_on(run_prune(sub_m)),
        _ => {
            if use_color() {
                println!("{}", "cask".bright_cyan().bold());
                dim("Content-addressable package store with a shared store server.");
            } else {
                println!("cask — content-addressable package store");
            }
            dim("\nRun `cask --help` for details.");
            Ok(())
        }
    }
}

fn main() {
    if !use_color() {
        colored::control::set_override(false);
    }

    let code = match std::panic::catch_unwind(run) {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            error(&e);
            1
        }
        Err(_) => {
            error("An unexpected error occurred. Please report this issue.");
            1
        }
    };
    std::process::exit(code);
}
