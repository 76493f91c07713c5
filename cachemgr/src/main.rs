use std::collections::BTreeMap;
use std::ffi::OsString;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use cachemgr::bridge::escape::split_tokens;
use cachemgr::config::parse_assignment;
use cachemgr::{
    BuiltinHandler, CACHEMGR_VERSION, ManagerConfig, ProgramSpawner, Status, Supervisor,
    SupervisorHandle, WorkerSpawner, run_worker_from_env,
};

/// Hidden first argument selecting worker mode.
const WORKER_MODE_ARG: &str = "worker";

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("CACHEMGR_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("cachemgr={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[derive(Debug, Default)]
struct Args {
    params: BTreeMap<String, String>,
    start: bool,
    /// External worker program and its arguments.
    worker: Vec<OsString>,
}

fn usage() {
    eprintln!("Usage: cachemgr [-p name=value]... [-d] [-- <worker program> [args...]]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -p name=value    Set a parameter (ping_interval, auto_restart, cli_timeout,");
    eprintln!("                   cli_limit, cli_buffer)");
    eprintln!("  -d               Start the worker immediately");
    eprintln!();
    eprintln!("Without a worker program the built-in worker is used.");
    eprintln!("Console commands: start, stop, kill, status, quit; anything else goes to the worker.");
}

fn parse_args(args: &[OsString]) -> Result<Args, String> {
    let mut parsed = Args::default();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        let arg = args[i].to_str().ok_or("arguments must be valid UTF-8")?;
        match arg {
            "-p" => {
                i += 1;
                let assignment = args
                    .get(i)
                    .and_then(|a| a.to_str())
                    .ok_or("-p requires name=value")?;
                let (name, value) = parse_assignment(assignment).map_err(|e| e.to_string())?;
                parsed.params.insert(name, value);
            }
            "-d" => parsed.start = true,
            "--" => {
                parsed.worker = args[i + 1..].to_vec();
                if parsed.worker.is_empty() {
                    return Err("-- requires a worker program".to_string());
                }
                break;
            }
            "--help" | "-h" => return Err(String::new()),
            other => return Err(format!("unexpected argument: {other}")),
        }
        i += 1;
    }

    Ok(parsed)
}

fn spawner_for(args: &Args) -> anyhow::Result<Arc<dyn WorkerSpawner>> {
    let spawner = match args.worker.split_first() {
        Some((program, rest)) => ProgramSpawner::new(program.clone()).with_args(rest.iter().cloned()),
        None => ProgramSpawner::current_exe([WORKER_MODE_ARG])
            .context("failed to locate own executable for the built-in worker")?,
    };
    Ok(Arc::new(spawner))
}

/// Handle one console line. Returns false when the console should close.
async fn dispatch(handle: &SupervisorHandle, line: &str) -> anyhow::Result<bool> {
    let tokens = match split_tokens(line.as_bytes()) {
        Ok(tokens) => tokens,
        Err(e) => {
            println!("{} {e}", Status::SYNTAX);
            return Ok(true);
        }
    };
    let Some((verb, args)) = tokens.split_first() else {
        return Ok(true);
    };
    let verb = String::from_utf8_lossy(verb);

    match verb.as_ref() {
        "start" => match handle.start().await {
            Ok(()) => println!("{} started", Status::OK),
            Err(e) => println!("{} {e}", Status::CANT),
        },
        "stop" => {
            handle.stop().await?;
            println!("{} stopped", Status::OK);
        }
        "kill" => {
            handle.kill().await?;
            println!("{} killed", Status::OK);
        }
        "status" if args.is_empty() => {
            let status = handle.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        "quit" => return Ok(false),
        _ => match handle.request(&verb, args.iter().cloned()).await {
            Ok(reply) => println!("{} {}", reply.status, reply.message),
            Err(e) => println!("{} {e}", Status::CANT),
        },
    }
    Ok(true)
}

async fn console(handle: &SupervisorHandle) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read console input")? else {
                    tracing::debug!("Console input closed");
                    break;
                };
                if !dispatch(handle, &line).await? {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }
    Ok(())
}

async fn run_manager(args: Args) -> anyhow::Result<()> {
    let config = ManagerConfig::new(spawner_for(&args)?)
        .with_params(&args.params)
        .context("invalid parameter")?;

    tracing::info!(version = CACHEMGR_VERSION, "cachemgr starting");
    let (handle, task) = Supervisor::spawn(config);

    if args.start {
        handle.start().await.context("failed to start worker")?;
    }

    let result = console(&handle).await;
    handle.shutdown().await?;
    task.await.context("supervisor task panicked")?;
    result
}

#[tokio::main]
async fn main() {
    init_tracing();

    let args: Vec<OsString> = std::env::args_os().collect();

    if args.get(1).and_then(|a| a.to_str()) == Some(WORKER_MODE_ARG) {
        if let Err(e) = run_worker_from_env(BuiltinHandler::new()).await {
            tracing::error!(error = %e, "Worker failed");
            process::exit(1);
        }
        return;
    }

    let args = match parse_args(&args) {
        Ok(args) => args,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            usage();
            process::exit(2);
        }
    };

    // Exit directly: a pending console read would hold the runtime open.
    match run_manager(args).await {
        Ok(()) => process::exit(0),
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn os_args(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[test]
    fn parses_params_and_worker_command() {
        let args = parse_args(&os_args(&[
            "cachemgr",
            "-p",
            "cli_timeout=5",
            "-d",
            "-p",
            "auto_restart=off",
            "--",
            "/usr/sbin/worker",
            "-f",
            "x",
        ]))
        .unwrap();
        assert!(args.start);
        assert_eq!(args.params.get("cli_timeout").map(String::as_str), Some("5"));
        assert_eq!(args.params.get("auto_restart").map(String::as_str), Some("off"));
        assert_eq!(args.worker, os_args(&["/usr/sbin/worker", "-f", "x"]));
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(parse_args(&os_args(&["cachemgr", "-p"])).is_err());
        assert!(parse_args(&os_args(&["cachemgr", "-p", "novalue"])).is_err());
        assert!(parse_args(&os_args(&["cachemgr", "--"])).is_err());
        assert!(parse_args(&os_args(&["cachemgr", "extra"])).is_err());
        assert_eq!(parse_args(&os_args(&["cachemgr", "-h"])).unwrap_err(), "");
    }
}
