// bunker-cli - sign Nostr events through a NIP-46 remote signer
//
// The private key stays in the bunker. This tool holds only an ephemeral
// session key, talks to the bunker over NIP-44 encrypted kind-24133 events,
// and publishes what the bunker signs.

mod nip44;
mod nip46;
mod relay;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nostr::nips::nip19::ToBech32;
use nostr::{Event, PublicKey, RelayUrl};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;

use nip46::{
    AuditLog, BunkerSession, BunkerSigner, EventTemplate, SessionError, Timeouts, DEFAULT_MAX_IDLE,
};
use relay::{PublishPolicy, PublishReport, Publisher, WebSocketDialer};

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "bunker-cli")]
#[command(about = "Sign Nostr events through a NIP-46 bunker without holding the key")]
#[command(version)]
struct Cli {
    /// Bunker URI: bunker://<remote-signer-pubkey>?relay=wss://...&secret=TOKEN
    #[arg(short, long, env = "NOSTR_BUNKER", hide_env_values = true)]
    bunker: Option<String>,

    /// Relays signed events are published to (comma-separated)
    #[arg(
        short,
        long,
        default_value = "wss://relay.damus.io,wss://relay.nostr.band,wss://relay.primal.net,wss://nos.lol"
    )]
    relays: String,

    /// Seconds to wait for the bunker handshake
    #[arg(long, default_value_t = 60)]
    connect_timeout: u64,

    /// Seconds to wait for a signature
    #[arg(long, default_value_t = 30)]
    sign_timeout: u64,

    /// Append an audit trail (JSONL) to this file
    #[arg(long, env = "BUNKER_AUDIT_LOG")]
    audit_log: Option<PathBuf>,

    /// Only log warnings and errors
    #[arg(short, long, default_value_t = false)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the bunker and show the user's identity
    Connect,
    /// Check that the bunker answers
    Ping,
    /// Have the bunker sign a text note and print it (not published)
    SignNote {
        /// Note content
        content: String,
    },
    /// Sign a text note and publish it
    Post {
        /// Note content
        content: String,
        /// Wait for relays to acknowledge the event
        #[arg(long)]
        confirm: bool,
        /// Acknowledgements required with --confirm
        #[arg(long, default_value_t = 1)]
        min_acks: usize,
    },
    /// Host many sessions, one command per stdin line:
    /// login <bunker-uri> | whoami <id> | sign <id> <content> | logout <id> | sweep [secs]
    Shell,
}

struct BunkerCli {
    signer: BunkerSigner,
    publisher: Publisher,
    relays: Vec<RelayUrl>,
}

impl BunkerCli {
    fn new(relay_urls: &str, timeouts: Timeouts, audit: AuditLog) -> Self {
        let dialer = Arc::new(WebSocketDialer);
        let relays = relay_urls
            .split(',')
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .filter_map(|url| match RelayUrl::parse(url) {
                Ok(relay) => Some(relay),
                Err(e) => {
                    tracing::warn!(relay = url, error = %e, "Ignoring invalid relay URL");
                    None
                }
            })
            .collect();

        Self {
            signer: BunkerSigner::new(dialer.clone(), Arc::new(Mutex::new(audit)), timeouts),
            publisher: Publisher::new(dialer),
            relays,
        }
    }

    async fn login(&self, bunker_uri: &str) -> Result<Arc<BunkerSession>> {
        eprintln!("🔐 Connecting to bunker...");
        let session = self.signer.login(bunker_uri).await?;
        if let Some(user) = session.user_pubkey() {
            eprintln!("✓ Connected to bunker (user: {})", short_npub(&user));
        }
        Ok(session)
    }

    async fn connect(&self, bunker_uri: &str) -> Result<()> {
        let session = self.login(bunker_uri).await?;
        let user = session
            .get_public_key(Instant::now() + Duration::from_secs(10))
            .await
            .context("Bunker did not report the user key");
        let user = match user {
            Ok(user) => user,
            Err(e) => {
                self.signer.logout(session.id()).await;
                return Err(e);
            }
        };

        println!("=== Bunker Identity ===");
        println!("npub:   {}", user.to_bech32().unwrap_or_default());
        println!("hex:    {}", user.to_hex());
        println!("signer: {}", session.uri().remote_signer.to_hex());
        println!("\nBunker relays:");
        for relay in &session.uri().relays {
            println!("  - {}", relay);
        }

        self.signer.logout(session.id()).await;
        Ok(())
    }

    async fn ping(&self, bunker_uri: &str) -> Result<()> {
        let session = self.login(bunker_uri).await?;
        let started = Instant::now();
        let result = session
            .ping(started + Duration::from_secs(10))
            .await
            .context("Bunker did not answer ping");
        self.signer.logout(session.id()).await;
        result?;

        println!("✓ pong in {} ms", started.elapsed().as_millis());
        Ok(())
    }

    async fn sign_note(&self, bunker_uri: &str, content: &str) -> Result<Event> {
        let session = self.login(bunker_uri).await?;
        let signed = self
            .signer
            .sign(session.id(), EventTemplate::text_note(content))
            .await;
        self.signer.logout(session.id()).await;
        signed
    }

    async fn post(&self, bunker_uri: &str, content: &str, policy: PublishPolicy) -> Result<()> {
        if self.relays.is_empty() {
            anyhow::bail!("No valid relays to publish to. Check --relays.");
        }
        let event = self.sign_note(bunker_uri, content).await?;
        println!("✓ Signed by bunker (event: {})", event.id.to_hex());

        let deadline = Instant::now() + PUBLISH_TIMEOUT;
        match self
            .publisher
            .publish(&event, &self.relays, policy, deadline)
            .await
        {
            Ok(report) => {
                print_report(&report, policy, self.relays.len());
                Ok(())
            }
            Err(relay::PublishError::NotEnoughAcks { report, .. }) => {
                print_report(&report, policy, self.relays.len());
                anyhow::bail!("Event was not acknowledged by enough relays")
            }
            Err(relay::PublishError::Unreachable(report)) => {
                print_report(&report, policy, self.relays.len());
                anyhow::bail!("Event was not sent: no relay could be reached")
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Handle one shell line. Lines run concurrently against one registry.
    async fn run_line(&self, line: &str) -> Result<()> {
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        match command {
            "login" => {
                let session = self.signer.login(rest).await?;
                let user = session.user_pubkey().map(|pk| short_npub(&pk)).unwrap_or_default();
                println!("session {} {}", session.id(), user);
            }
            "whoami" => match self.signer.whoami(rest) {
                Some(user) => println!("{} {}", rest, user.to_bech32().unwrap_or_default()),
                None => println!("{} not logged in", rest),
            },
            "sign" => {
                let (id, content) = rest
                    .split_once(' ')
                    .context("usage: sign <session-id> <content>")?;
                let event = self.signer.sign(id, EventTemplate::text_note(content)).await?;
                println!("{}", serde_json::to_string(&event)?);
            }
            "logout" => {
                if self.signer.logout(rest).await {
                    println!("{} logged out", rest);
                } else {
                    println!("{} not logged in", rest);
                }
            }
            "sweep" => {
                let max_idle = if rest.is_empty() {
                    DEFAULT_MAX_IDLE
                } else {
                    Duration::from_secs(rest.parse().context("usage: sweep [idle-seconds]")?)
                };
                let evicted = self.signer.sweep(max_idle).await;
                println!("evicted {} session(s), {} live", evicted, self.signer.registry().len());
            }
            other => anyhow::bail!("unknown command '{}'", other),
        }
        Ok(())
    }
}

async fn run_shell(cli: Arc<BunkerCli>) -> Result<()> {
    eprintln!("bunker shell: login <bunker-uri> | whoami <id> | sign <id> <content> | logout <id> | sweep [secs]");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tasks = JoinSet::new();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim().to_string();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let cli = Arc::clone(&cli);
        tasks.spawn(async move {
            if let Err(e) = cli.run_line(&line).await {
                let message = match e.downcast_ref::<SessionError>() {
                    Some(err) => err.user_message(),
                    None => format!("{:#}", e),
                };
                println!("❌ {}: {}", line.split(' ').next().unwrap_or_default(), message);
            }
        });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::warn!(error = %e, "Shell task failed");
        }
    }
    cli.signer.shutdown().await;
    Ok(())
}

fn print_report(report: &PublishReport, policy: PublishPolicy, total: usize) {
    match policy {
        PublishPolicy::BestEffort => {
            println!(
                "✓ Sent to {} of {} relays (not confirmed)",
                report.dispatched, total
            );
            for (relay, reason) in &report.unreachable {
                println!("  ✗ {} unreachable: {}", relay, reason);
            }
        }
        PublishPolicy::Acknowledged { .. } => {
            println!(
                "Accepted by {} of {} relays",
                report.accepted.len(),
                total
            );
            for relay in &report.accepted {
                println!("  ✓ {}", relay);
            }
            for (relay, reason) in &report.rejected {
                println!("  ✗ {} rejected: {}", relay, reason);
            }
            for (relay, reason) in &report.unreachable {
                println!("  ✗ {} unreachable: {}", relay, reason);
            }
            for relay in &report.unconfirmed {
                println!("  ? {} did not answer", relay);
            }
        }
    }
}

fn short_npub(pubkey: &PublicKey) -> String {
    let npub = pubkey.to_bech32().unwrap_or_else(|_| pubkey.to_hex());
    npub.chars().take(20).collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let default_filter = if cli.quiet { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // ring is the only provider compiled in; installing it fails only if one already is.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let timeouts = Timeouts {
        connect: Duration::from_secs(cli.connect_timeout),
        sign: Duration::from_secs(cli.sign_timeout),
    };
    let audit = match &cli.audit_log {
        Some(path) => AuditLog::new(path),
        None => AuditLog::disabled(),
    };
    let app = Arc::new(BunkerCli::new(&cli.relays, timeouts, audit));
    let bunker_uri = || {
        cli.bunker
            .as_deref()
            .context("No bunker URI. Pass --bunker or set NOSTR_BUNKER.")
    };

    match &cli.command {
        Commands::Connect => app.connect(bunker_uri()?).await?,
        Commands::Ping => app.ping(bunker_uri()?).await?,
        Commands::SignNote { content } => {
            let event = app.sign_note(bunker_uri()?, content).await?;
            println!("{}", serde_json::to_string_pretty(&event)?);
        }
        Commands::Post {
            content,
            confirm,
            min_acks,
        } => {
            let policy = if *confirm {
                PublishPolicy::Acknowledged {
                    min_acks: *min_acks,
                }
            } else {
                PublishPolicy::BestEffort
            };
            app.post(bunker_uri()?, content, policy).await?;
        }
        Commands::Shell => run_shell(app).await?,
    }

    Ok(())
}
