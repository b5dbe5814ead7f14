//! hlash - CLI entry point
//!
//! Parses the command line into [`Settings`], then hands the selected service
//! verb to the service controller. `run` blocks until a shutdown signal.

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use hlash::config::{parse_duration, DEFAULT_SUBSCRIBE_INTERVAL};
use hlash::service::{ServiceAction, ServiceController};
use hlash::{Hlash, Settings, VERSION};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "hlash")]
#[command(version = VERSION)]
#[command(about = "Clash service wrapper with automatic subscription updates")]
struct Args {
    /// Home directory holding config.yaml
    #[arg(short = 'd', long = "home")]
    home: Option<PathBuf>,

    /// External controller secret
    #[arg(short = 'k', long = "secret")]
    secret: Option<String>,

    /// External controller address
    #[arg(long = "ctl")]
    external_controller: Option<String>,

    /// External controller UI path
    #[arg(long = "ui", default_value = "ui")]
    external_ui: String,

    /// Subscription URL
    #[arg(short = 'u', long = "subscribe")]
    subscribe: Option<String>,

    /// Subscription refresh interval, e.g. 30m or 1h30m
    #[arg(
        short = 't',
        long = "subscribe-interval",
        alias = "subscribe_interval",
        value_parser = parse_interval,
    )]
    subscribe_interval: Option<Duration>,

    /// Run the engine together with the updater
    #[arg(long = "run")]
    run: bool,

    /// Service verb: run, start, stop, restart, install, uninstall, status
    #[arg(short = 's', long = "svc", default_value = "run")]
    svc: String,

    /// Fixed mixed proxy port, 0 keeps the config's ports
    #[arg(short = 'p', long = "mixed-port", alias = "mixedPort", default_value_t = 0)]
    mixed_port: u16,
}

fn parse_interval(value: &str) -> Result<Duration, String> {
    parse_duration(value).map_err(|e| e.to_string())
}

impl Args {
    fn into_settings(self) -> anyhow::Result<Settings> {
        let home = match self.home {
            Some(dir) if dir.is_absolute() => dir,
            Some(dir) => std::env::current_dir()?.join(dir),
            None => std::env::current_dir()?,
        };

        let mut settings = Settings::new(home);
        settings.secret = self.secret;
        settings.external_controller = self.external_controller;
        settings.external_ui = Some(self.external_ui);
        settings.subscribe_url = self.subscribe.unwrap_or_default();
        settings.subscribe_interval = self.subscribe_interval.unwrap_or(DEFAULT_SUBSCRIBE_INTERVAL);
        settings.run_engine = self.run;
        settings.mixed_port = Some(self.mixed_port).filter(|p| *p > 0);
        settings.validate()?;
        Ok(settings)
    }
}

/// Arguments for the installed service: our own minus the service verb, with
/// the home directory pinned to its absolute path
fn service_arguments(args: impl IntoIterator<Item = String>, home: &Path) -> Vec<String> {
    let mut out = Vec::new();
    let mut skip_value = false;
    for arg in args {
        if skip_value {
            skip_value = false;
            continue;
        }
        match arg.as_str() {
            "-s" | "--svc" | "-d" | "--home" => skip_value = true,
            "install" => {}
            _ if ["--svc=", "-s=", "--home=", "-d="]
                .iter()
                .any(|prefix| arg.starts_with(prefix)) => {}
            _ => out.push(arg),
        }
    }
    out.push("-d".to_string());
    out.push(home.display().to_string());
    out
}

/// Valid verbs with a one-line description each
fn actions_help() -> String {
    ServiceAction::ALL
        .iter()
        .map(|a| format!("  {:<10} {}", a.as_str(), a.usage()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().clamp(2, 8))
        .enable_all()
        .thread_name("hlash-worker")
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("hlash=info".parse()?))
        .init();

    let args = Args::parse();
    let action: ServiceAction = match args.svc.parse() {
        Ok(action) => action,
        Err(e) => {
            eprintln!("{}, valid actions:\n{}", e, actions_help());
            std::process::exit(1);
        }
    };

    let settings = match args.into_settings() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };
    debug!("settings: {:?}", settings);

    let arguments = service_arguments(std::env::args().skip(1), settings.home_dir());
    let hlash = Hlash::new(settings);
    let descriptor = hlash.descriptor(arguments);
    let controller = ServiceController::detect(descriptor);

    match controller.execute(action, Arc::new(hlash)).await {
        Ok(message) => {
            if !message.is_empty() {
                println!("{}", message);
            }
            Ok(())
        }
        Err(e) => {
            error!("{} failed: {}", action, e);
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_service_arguments_drop_verb() {
        let home = Path::new("/srv/hlash");
        let args = strings(&["-d", "/srv/hlash", "-s", "install", "-u", "https://example.com/sub", "--run"]);
        assert_eq!(
            service_arguments(args, home),
            strings(&["-u", "https://example.com/sub", "--run", "-d", "/srv/hlash"])
        );

        let args = strings(&["--svc=install", "--run"]);
        assert_eq!(service_arguments(args, home), strings(&["--run", "-d", "/srv/hlash"]));
    }

    #[test]
    fn test_service_arguments_pin_relative_home() {
        let args = strings(&["-d", "data", "-s", "install", "--run"]);
        let settings = Args::parse_from(["hlash", "-d", "/srv/data", "--run"])
            .into_settings()
            .unwrap();
        let installed = service_arguments(args, settings.home_dir());
        assert_eq!(installed, strings(&["--run", "-d", "/srv/data"]));

        // the unit starts inside its working directory; the home must not nest
        let restarted = Args::parse_from(std::iter::once("hlash".to_string()).chain(installed))
            .into_settings()
            .unwrap();
        assert_eq!(restarted.home_dir, settings.home_dir);

        let args = strings(&["--home=data", "install"]);
        assert_eq!(service_arguments(args, Path::new("/srv/data")), strings(&["-d", "/srv/data"]));
    }

    #[test]
    fn test_actions_help_lists_every_verb() {
        let help = actions_help();
        for action in ServiceAction::ALL {
            assert!(help.contains(action.as_str()));
            assert!(help.contains(action.usage()));
        }
    }

    #[test]
    fn test_args_into_settings() {
        let args = Args::parse_from([
            "hlash",
            "-d",
            "/srv/hlash",
            "-u",
            "https://example.com/sub",
            "-t",
            "30m",
            "--run",
            "-p",
            "7891",
        ]);
        assert_eq!(args.svc, "run");

        let settings = args.into_settings().unwrap();
        assert_eq!(settings.home_dir, PathBuf::from("/srv/hlash"));
        assert_eq!(settings.subscribe_interval, Duration::from_secs(1800));
        assert_eq!(settings.mixed_port, Some(7891));
        assert_eq!(settings.external_ui.as_deref(), Some("ui"));
        assert!(settings.run_engine);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let args = Args::parse_from(["hlash", "-d", "/srv/hlash", "-t", "0"]);
        assert!(args.into_settings().is_err());

        assert!(Args::try_parse_from(["hlash", "-t", "soon"]).is_err());
    }
}
