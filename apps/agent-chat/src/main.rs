#![expect(clippy::print_stdout, reason = "terminal front end writes to stdout")]

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use agent_chat_client::config::normalize_base_url;
use agent_chat_client::{
    AgentApiClient, ChatMessage, ClientConfig, ConnectionState, Conversation, DomainEvent,
    DomainEventKind, FileTokenStore, Role, SessionController, WiringHandlers,
};
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Parser, Debug)]
#[command(name = "agent-chat", about = "Chat with the agent backend and follow live updates")]
struct Cli {
    /// Backend base URL. Defaults to AGENT_CHAT_API_BASE_URL or http://localhost:8787.
    #[arg(long)]
    api_base_url: Option<String>,

    /// Realtime origin. Defaults to the API base URL.
    #[arg(long)]
    ws_url: Option<String>,

    /// Realtime transport path.
    #[arg(long)]
    ws_path: Option<String>,

    /// Directory holding the saved token.
    #[arg(long)]
    token_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in and save the token.
    Login {
        #[arg(long)]
        username: String,
        #[arg(long, env = "AGENT_CHAT_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Forget the saved token.
    Logout,
    /// Interactive chat with live notifications.
    Chat,
    /// Print live notifications until interrupted.
    Listen,
}

/// Realtime callbacks forwarded to the terminal loop.
#[derive(Debug)]
enum UiEvent {
    Status(ConnectionState),
    Domain(DomainEvent),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = resolve_config(&cli)?;
    let store = match config.token_dir.clone() {
        Some(dir) => FileTokenStore::new(dir),
        None => FileTokenStore::default_location()
            .context("no config directory available; set AGENT_CHAT_TOKEN_DIR")?,
    };
    debug!(path = %store.path().display(), "token store");

    let api = config.api_client()?;
    let session = SessionController::new(config, Arc::new(store));

    match cli.command {
        Command::Login { username, password } => login(&session, &api, &username, &password).await,
        Command::Logout => {
            session.logout().await?;
            println!("Logged out.");
            Ok(())
        }
        Command::Chat => chat(&session, &api).await,
        Command::Listen => listen(&session).await,
    }
}

fn resolve_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = ClientConfig::from_env().context("invalid AGENT_CHAT_* environment")?;
    let ws_follows_api = config.ws_url == config.api_base_url;

    if let Some(api_base_url) = &cli.api_base_url {
        config.api_base_url = normalize_base_url(api_base_url)?;
        if ws_follows_api {
            config.ws_url = config.api_base_url.clone();
        }
    }
    if let Some(ws_url) = &cli.ws_url {
        config.ws_url = normalize_base_url(ws_url)?;
    }
    if let Some(ws_path) = &cli.ws_path {
        config.ws_path = ws_path.clone();
    }
    if let Some(token_dir) = &cli.token_dir {
        config.token_dir = Some(token_dir.clone());
    }
    Ok(config)
}

fn ui_handlers(events: &mpsc::UnboundedSender<UiEvent>) -> WiringHandlers {
    let status = events.clone();
    let mut handlers = WiringHandlers::new().on_status(move |state| {
        let _ = status.send(UiEvent::Status(state));
    });
    for kind in DomainEventKind::ALL {
        let domain = events.clone();
        handlers = handlers.on_domain(kind, move |event| {
            let _ = domain.send(UiEvent::Domain(event.clone()));
        });
    }
    handlers
}

async fn login(
    session: &SessionController,
    api: &AgentApiClient,
    username: &str,
    password: &str,
) -> Result<()> {
    let connection = session
        .login(api, username, password, WiringHandlers::new())
        .await
        .context("login failed")?;
    println!("Logged in as {username}.");

    let mut states = connection.watch_state();
    let connected = tokio::time::timeout(
        session.config().handshake_timeout(),
        states.wait_for(|state| *state == ConnectionState::Connected),
    )
    .await
    .is_ok_and(|result| result.is_ok());
    if connected {
        println!("Live updates channel is reachable.");
    } else {
        warn!(url = %connection.url(), "live updates channel did not connect");
        println!("Live updates channel is not reachable yet; chat still works.");
    }

    session.manager().disconnect().await;
    Ok(())
}

async fn chat(session: &SessionController, api: &AgentApiClient) -> Result<()> {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    if !session.bootstrap(ui_handlers(&events_tx)).await? {
        bail!("not logged in; run `agent-chat login` first");
    }

    let mut conversation = Conversation::new();
    for message in conversation.messages() {
        print_message(message);
    }
    prompt()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let token = session.token()?;
                if let Some(appended) = conversation.submit(api, token.as_deref(), &line).await {
                    for message in appended {
                        print_message(message);
                    }
                }
                prompt()?;
            }
            Some(event) = events.recv() => {
                match event {
                    UiEvent::Status(state) => println!("\r[{state}]"),
                    UiEvent::Domain(event) => {
                        let message = conversation.push_domain_event(&event);
                        print!("\r");
                        print_message(message);
                    }
                }
                prompt()?;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!();
    session.manager().disconnect().await;
    Ok(())
}

async fn listen(session: &SessionController) -> Result<()> {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    if !session.bootstrap(ui_handlers(&events_tx)).await? {
        bail!("not logged in; run `agent-chat login` first");
    }

    loop {
        tokio::select! {
            Some(event) = events.recv() => match event {
                UiEvent::Status(state) => println!("[{state}]"),
                UiEvent::Domain(event) => {
                    println!("{}", event.summary());
                    debug!(payload = %event.payload, "domain payload");
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.manager().disconnect().await;
    Ok(())
}

fn print_message(message: &ChatMessage) {
    let speaker = match message.role {
        Role::User => "you",
        Role::Assistant => "agent",
        Role::System => "update",
    };
    println!("{speaker}> {}", message.content);
}

fn prompt() -> Result<()> {
    print!("you> ");
    std::io::stdout().flush()?;
    Ok(())
}
