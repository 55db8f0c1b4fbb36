use anyhow::Context;
use clap::{Parser, Subcommand};
use link_client::{ClientSettings, Clock, FileStorage, LinkAgent, Notice, SystemClock};
use link_protocol::Stage;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(
    name = "linkctl",
    about = "Drive the Telegram bot linking flow from a terminal",
    version
)]
struct Opts {
    /// Directory holding this profile's local storage
    #[arg(long, env = "LINK_DATA_DIR", default_value = ".linkctl")]
    data_dir: PathBuf,

    /// Optional settings file (toml, yaml or json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// State endpoint URL, overriding the settings
    #[arg(long)]
    state_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the local progress record
    Status,
    /// Print this profile's session id
    Session,
    /// Enable two-factor authentication (stage 1 to 2)
    #[command(name = "enable-2fa")]
    EnableTwoFactor {
        /// Code shown by the authenticator app
        code: String,
    },
    /// Generate a fresh link and open the waiting window
    Generate,
    /// Submit the code shown by the bot
    Verify { code: String },
    /// Mark the account as linked
    Finalize,
    /// Unlink the bot
    Unlink,
    /// Cancel a pending link
    Abort,
    /// Force a stage, as the operator tool does
    SetStage { stage: i64 },
    /// Ask the bot to send a test message
    TestMessage,
    /// Poll until the link is confirmed or Ctrl-C
    Watch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let opts = Opts::parse();

    let mut settings =
        ClientSettings::load(opts.config.as_deref()).context("failed to load settings")?;
    if let Some(url) = opts.state_url {
        settings.state_url = url;
    }
    let storage = FileStorage::open(&opts.data_dir)
        .with_context(|| format!("failed to open {}", opts.data_dir.display()))?;
    let agent = LinkAgent::connect(Arc::new(storage), &settings)
        .context("invalid state endpoint url")?;
    let flow = agent.flow();

    match opts.command {
        Command::Status => {
            let record = flow.record();
            println!("{}", serde_json::to_string_pretty(&record)?);
            if let Some(remaining) = record.remaining_ms(SystemClock.now_ms()) {
                println!("window closes in {}s", remaining / 1000);
            }
        }
        Command::Session => println!("{}", agent.session_id()),
        Command::EnableTwoFactor { code } => report(flow.enable_two_factor(&code).await?.stage),
        Command::Generate => {
            let record = flow.generate_link().await?;
            println!("session {} waiting for the bot", agent.session_id());
            report(record.stage);
        }
        Command::Verify { code } => {
            if flow.submit_code(&code).await? {
                // The promotion to stage 6 normally runs on a timer; a one-shot
                // command completes it directly.
                flow.cancel_timers();
                report(flow.finalize().await?.stage);
            } else {
                println!("{}", Notice::CodeMismatch.message());
            }
        }
        Command::Finalize => report(flow.finalize().await?.stage),
        Command::Unlink => report(flow.unlink().await?.stage),
        Command::Abort => report(flow.abort().await?.stage),
        Command::SetStage { stage } => report(flow.admin_set_stage(stage).await.stage),
        Command::TestMessage => {
            flow.send_test_message().await?;
            println!("{}", Notice::TestMessageSent.message());
        }
        Command::Watch => watch(&agent).await?,
    }

    if let Some(failure) = flow.last_sync_error() {
        eprintln!("warning: {} was not synced: {}", failure.action, failure.error);
    }
    Ok(())
}

async fn watch(agent: &LinkAgent) -> anyhow::Result<()> {
    let mut notices = agent.subscribe();
    agent.start();
    info!(session = %agent.session_id(), "watching");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            notice = notices.recv() => {
                let Ok(notice) = notice else { continue };
                println!("{}", notice.message());
                if matches!(
                    notice,
                    Notice::TwoFactorConfirmed | Notice::SessionExpired | Notice::Linked
                ) {
                    break;
                }
            }
        }
    }

    agent.stop();
    Ok(())
}

fn report(stage: Stage) {
    println!("stage {stage}: {}", stage.label());
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
