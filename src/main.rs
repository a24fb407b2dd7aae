#[cfg(feature = "notifications")]
mod notification;

use std::env;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use mail_notifier::{Mail, Notifier, NotifierConfig, NotifierEvent};

const PASSWORD_ENV: &str = "MAIL_NOTIFIER_PASSWORD";
const DEFAULT_TOGGLE_SECS: u64 = 30;

fn setup_logging() {
    use std::fs::OpenOptions;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,mail_notifier=debug"));

    // Try to create a log file in the config directory
    let log_file = NotifierConfig::config_dir()
        .ok()
        .filter(|dir| dir.is_dir())
        .map(|dir| dir.join("mail-notifier.log"))
        .and_then(|path| {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)
                .ok()
        });

    build_subscriber(filter, log_file, std::io::stderr).init();
}

/// Console output always; the log file, when there is one, gets a copy.
fn build_subscriber<W>(
    filter: EnvFilter,
    log_file: Option<File>,
    console: W,
) -> impl tracing::Subscriber + Send + Sync
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let file_layer = log_file.map(|file| {
        tracing_subscriber::fmt::layer()
            .with_writer(Mutex::new(file))
            .with_ansi(false)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(tracing_subscriber::fmt::layer().with_writer(console))
}

fn print_usage() {
    eprintln!(
        r#"mail-notifier - Watch an IMAP mailbox for new mail

Usage: mail-notifier [command] [options]

Commands:
    watch       Print new mail until Ctrl-C (default)
    toggle      Start and stop the notifier every --interval seconds
    help        Show this help message

Options:
    --config PATH       Configuration file (default: ~/.config/mail-notifier/config.toml)
    --interval SECS     Toggle interval (default: {DEFAULT_TOGGLE_SECS})

Environment:
    {PASSWORD_ENV}  Password, overriding the configuration file
"#
    );
}

struct Options {
    config: Option<PathBuf>,
    interval: u64,
}

fn parse_options(args: &[String]) -> Result<Options> {
    let mut options = Options {
        config: None,
        interval: DEFAULT_TOGGLE_SECS,
    };

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = iter.next().context("--config needs a path")?;
                options.config = Some(PathBuf::from(path));
            }
            "--interval" => {
                let secs = iter.next().context("--interval needs a number of seconds")?;
                options.interval = secs
                    .parse()
                    .with_context(|| format!("Invalid interval: {}", secs))?;
            }
            other => anyhow::bail!("Unknown option: {}", other),
        }
    }
    Ok(options)
}

fn load_config(options: &Options) -> Result<NotifierConfig> {
    let path = match &options.config {
        Some(path) => path.clone(),
        None => NotifierConfig::config_path()?,
    };
    let mut config = NotifierConfig::load(&path)?;

    if let Ok(password) = env::var(PASSWORD_ENV) {
        config.password = password;
    }
    Ok(config)
}

fn print_mail(mail: &Mail, mailbox: &str) {
    println!(
        "[{}] uid {} {:?} from {}: {}",
        mailbox,
        mail.uid,
        mail.flags.names(),
        mail.display_from(),
        mail.subject()
    );

    #[cfg(feature = "notifications")]
    notification::notify_new_mail(mail, mailbox);
}

/// Handle one event; returns false once the session has ended.
fn handle_event(event: NotifierEvent, mailbox: &str) -> bool {
    match event {
        NotifierEvent::Connected => {
            tracing::info!("Connected");
            true
        }
        NotifierEvent::Mail(mail) => {
            print_mail(&mail, mailbox);
            true
        }
        NotifierEvent::Error(e) => {
            eprintln!("Error: {}", e);
            true
        }
        NotifierEvent::End => {
            tracing::info!("Session ended");
            false
        }
    }
}

async fn drain_until_end(events: &mut mpsc::Receiver<NotifierEvent>, mailbox: &str) {
    while let Some(event) = events.recv().await {
        if !handle_event(event, mailbox) {
            break;
        }
    }
}

async fn run_watch(config: NotifierConfig) -> Result<()> {
    let mailbox = config.mailbox.clone();
    let (mut notifier, mut events) = Notifier::new(config);
    notifier.start();

    loop {
        tokio::select! {
            event = events.recv() => {
                let running = event.is_some_and(|event| handle_event(event, &mailbox));
                if !running {
                    // Session ended on its own; no reconnect
                    return Ok(());
                }
            }
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                tracing::info!("Interrupted, logging out");
                notifier.stop();
                drain_until_end(&mut events, &mailbox).await;
                notifier.wait().await;
                return Ok(());
            }
        }
    }
}

async fn run_toggle(config: NotifierConfig, interval: Duration) -> Result<()> {
    let mailbox = config.mailbox.clone();
    let (mut notifier, mut events) = Notifier::new(config);
    let mut ticker = tokio::time::interval(interval);
    let mut running = false;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if running {
                    tracing::info!("Toggle: stopping");
                    notifier.stop();
                    drain_until_end(&mut events, &mailbox).await;
                    notifier.wait().await;
                } else {
                    tracing::info!("Toggle: starting");
                    notifier.start();
                }
                running = !running;
            }
            event = events.recv() => {
                match event {
                    Some(event) => {
                        if !handle_event(event, &mailbox) {
                            notifier.wait().await;
                            running = false;
                        }
                    }
                    None => return Ok(()),
                }
            }
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                if running {
                    notifier.stop();
                    drain_until_end(&mut events, &mailbox).await;
                }
                notifier.wait().await;
                return Ok(());
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    let (command, rest) = match args.get(1).map(|s| s.as_str()) {
        Some(flag @ ("--help" | "-h")) => (flag, &args[2..]),
        Some(cmd) if !cmd.starts_with('-') => (cmd, &args[2..]),
        _ => ("watch", args.get(1..).unwrap_or_default()),
    };

    match command {
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        "watch" => {
            let options = parse_options(rest)?;
            setup_logging();
            run_watch(load_config(&options)?).await
        }
        "toggle" => {
            let options = parse_options(rest)?;
            setup_logging();
            let interval = Duration::from_secs(options.interval.max(1));
            run_toggle(load_config(&options)?, interval).await
        }
        cmd => {
            eprintln!("Unknown command: {}", cmd);
            print_usage();
            std::process::exit(1);
        }
    }
}
