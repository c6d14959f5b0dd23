use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tether_config::TetherConfig;
use tether_session::{
    Command as SessionCommand, Envelope, RelayLink, RelayServer, Session, SessionError,
};
use tether_wire::{Frame, FrameLanguage, ThreadId, ThreadInfo, ThreadState};
use tokio::net::{TcpListener, TcpStream};

#[derive(Parser)]
#[command(name = "tether", version, about = "Tether CLI (inspect and drive a runtime debug agent)")]
struct Cli {
    /// Config file (defaults to `tether.toml` in the current directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Agent address, overriding the config file
    #[arg(long, global = true)]
    addr: Option<SocketAddr>,
    /// Reach the agent through a relay listening at this address
    #[arg(long, global = true, conflicts_with = "addr")]
    via: Option<SocketAddr>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List threads with their state
    Threads(ThreadsArgs),
    /// Print the stack of a thread
    Stack(StackArgs),
    /// Evaluate an expression in a stack frame
    Eval(EvalArgs),
    /// Issue any session command; each argument is JSON, bare words are strings
    Send(SendArgs),
    /// Serve the JSON relay protocol backed by a direct agent connection
    Relay(RelayArgs),
}

#[derive(Args)]
struct ThreadsArgs {
    /// Emit JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct StackArgs {
    thread: ThreadId,
    /// Emit JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct EvalArgs {
    thread: ThreadId,
    level: u32,
    expression: String,
}

#[derive(Args)]
struct SendArgs {
    /// Command name, e.g. `getThreadStack`
    command: String,
    args: Vec<String>,
}

#[derive(Args)]
struct RelayArgs {
    /// Listen address, overriding `[relay] listen`
    #[arg(long)]
    listen: Option<SocketAddr>,
}

fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            2
        }
    };

    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<i32> {
    let cwd = std::env::current_dir().context("failed to resolve current directory")?;
    let (mut config, _) = tether_config::load(cli.config.as_deref(), &cwd)?;
    if let Some(addr) = cli.addr {
        config.agent.address = addr;
    }
    tether_config::init_tracing(&config.logging);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    runtime.block_on(dispatch(cli.command, cli.via, config))
}

async fn dispatch(command: Command, via: Option<SocketAddr>, config: TetherConfig) -> Result<i32> {
    match command {
        Command::Relay(args) => {
            if via.is_some() {
                anyhow::bail!("`relay` needs a direct agent connection; drop --via");
            }
            serve_relay(&config, args).await
        }
        command => {
            let session = open_session(&config, via).await?;
            let outcome = run_query(&session, command).await;
            session.shutdown();
            match outcome {
                Ok(()) => Ok(0),
                Err(err) => {
                    eprintln!("error: {err}");
                    Ok(1)
                }
            }
        }
    }
}

async fn run_query(session: &Session, command: Command) -> Result<(), SessionError> {
    match command {
        Command::Threads(args) => {
            let rows = threads(session).await?;
            print_threads(&rows, args.json)?;
        }
        Command::Stack(args) => {
            let frames = stack(session, args.thread).await?;
            print_stack(&frames, args.json)?;
        }
        Command::Eval(args) => {
            let envelope = session
                .send_message(
                    SessionCommand::Evaluate,
                    vec![json!(args.thread), json!(args.level), json!(args.expression)],
                )
                .await?;
            let value: String = field(envelope, "value")?;
            println!("{value}");
        }
        Command::Send(args) => {
            let values = args.args.iter().map(|arg| parse_arg(arg)).collect();
            let envelope = session.send(&args.command, values).await?;
            println!("{}", serde_json::to_string_pretty(&envelope)?);
        }
        // Dispatched before a session is opened.
        Command::Relay(_) => {}
    }
    Ok(())
}

async fn open_session(config: &TetherConfig, via: Option<SocketAddr>) -> Result<Session> {
    match via {
        Some(relay) => {
            let stream = TcpStream::connect(relay)
                .await
                .with_context(|| format!("failed to reach relay at {relay}"))?;
            Ok(Session::relay(RelayLink::from_stream(stream)))
        }
        None => {
            let addr = config.agent.address;
            let session = Session::connect(addr, config.agent.client_config())
                .await
                .with_context(|| format!("failed to connect to agent at {addr}"))?;
            Ok(session)
        }
    }
}

async fn serve_relay(config: &TetherConfig, args: RelayArgs) -> Result<i32> {
    let listen = args.listen.unwrap_or(config.relay.listen);
    let session = open_session(config, None).await?;
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to listen on {listen}"))?;
    let local = listener.local_addr()?;
    tracing::info!(
        target: "tether.cli",
        listen = %local,
        agent = %config.agent.address,
        "relay listening"
    );
    eprintln!("relay listening on {local}");

    let closed = session.closed_token();
    loop {
        let (stream, peer) = tokio::select! {
            _ = closed.cancelled() => break,
            accepted = listener.accept() => accepted.context("failed to accept relay client")?,
        };
        let server = RelayServer::new(session.clone());
        tokio::spawn(async move {
            tracing::info!(target: "tether.cli", %peer, "relay client connected");
            match server.serve(RelayLink::from_stream(stream)).await {
                Ok(()) => tracing::info!(target: "tether.cli", %peer, "relay client disconnected"),
                Err(err) => tracing::info!(target: "tether.cli", %peer, error = %err, "relay client dropped"),
            }
        });
    }

    eprintln!("agent connection closed");
    Ok(0)
}

#[derive(Serialize)]
struct ThreadRow {
    id: ThreadId,
    #[serde(flatten)]
    info: ThreadInfo,
}

async fn threads(session: &Session) -> Result<Vec<ThreadRow>, SessionError> {
    let ids: Vec<ThreadId> = field(
        session.send_message(SessionCommand::ListThreadIds, vec![]).await?,
        "threadIds",
    )?;
    // Queue every info request before waiting on any of them.
    let pending: Vec<_> = ids
        .iter()
        .map(|id| session.send_message(SessionCommand::GetThreadInfo, vec![json!(id)]))
        .collect();

    let mut rows = Vec::with_capacity(ids.len());
    for (id, reply) in ids.into_iter().zip(pending) {
        rows.push(ThreadRow {
            id,
            info: field(reply.await?, "thread")?,
        });
    }
    Ok(rows)
}

async fn stack(session: &Session, thread: ThreadId) -> Result<Vec<Frame>, SessionError> {
    let envelope = session
        .send_message(SessionCommand::GetThreadStack, vec![json!(thread)])
        .await?;
    field(envelope, "frames")
}

fn field<T: DeserializeOwned>(mut envelope: Envelope, key: &str) -> Result<T, SessionError> {
    let value = envelope.remove(key).unwrap_or(Value::Null);
    Ok(serde_json::from_value(value)?)
}

fn parse_arg(arg: &str) -> Value {
    serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.to_owned()))
}

fn print_threads(rows: &[ThreadRow], json: bool) -> serde_json::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(rows)?);
        return Ok(());
    }
    for row in rows {
        let mut marks = Vec::new();
        if row.info.flags.suspended {
            marks.push("suspended");
        }
        if row.info.is_daemon {
            marks.push("daemon");
        }
        println!(
            "{:>5}  {:<12} {}{}",
            row.id,
            state_label(row.info.state),
            row.info.name,
            if marks.is_empty() {
                String::new()
            } else {
                format!(" [{}]", marks.join(", "))
            }
        );
    }
    Ok(())
}

fn print_stack(frames: &[Frame], json: bool) -> serde_json::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(frames)?);
        return Ok(());
    }
    for frame in frames {
        let language = match frame.language {
            FrameLanguage::Host => "host".to_owned(),
            FrameLanguage::Tracked => "tracked".to_owned(),
            FrameLanguage::Other(tag) => format!("language {tag}"),
        };
        println!(
            "#{:<3} {}+{} ({language})",
            frame.level, frame.name, frame.offset
        );
    }
    Ok(())
}

fn state_label(state: ThreadState) -> String {
    match state {
        ThreadState::New => "new".into(),
        ThreadState::Terminated => "terminated".into(),
        ThreadState::Runnable => "runnable".into(),
        ThreadState::Blocked => "blocked".into(),
        ThreadState::Waiting => "waiting".into(),
        ThreadState::ObjectWait => "object-wait".into(),
        ThreadState::Parked => "parked".into(),
        ThreadState::Sleeping => "sleeping".into(),
        ThreadState::Unknown(code) => format!("state {code}"),
    }
}
