use std::{path::PathBuf, sync::Arc};

use chatrelay_core::{DEFAULT_RECV_BUFFER_BYTES, DEFAULT_SERVER_PORT, Message};
use chatrelay_server::{
    ChatDatabase, IngestLoop, IngestState, MessageStore, Snapshot, StorageError,
    render::{format_location, format_message, format_peer, format_timestamp},
};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "chatrelay-server")]
struct ServerArgs {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct DatabaseArgs {
    #[arg(long, env = "CHATRELAY_DATABASE", default_value = "chatrelay.db")]
    database: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Receive chat datagrams and persist them until interrupted.
    Serve {
        #[arg(long, env = "CHATRELAY_BIND", default_value_t = format!("0.0.0.0:{DEFAULT_SERVER_PORT}"))]
        bind_address: String,
        #[command(flatten)]
        db: DatabaseArgs,
        /// Keep everything in memory instead of the database file.
        #[arg(long)]
        in_memory: bool,
        #[arg(long, default_value_t = DEFAULT_RECV_BUFFER_BYTES)]
        recv_buffer: usize,
        /// Print each message as it is stored.
        #[arg(long)]
        tail: bool,
    },
    /// List every known peer.
    Peers {
        #[command(flatten)]
        db: DatabaseArgs,
        #[arg(long)]
        json: bool,
    },
    /// Show one peer and the messages it sent.
    Peer {
        name: String,
        #[command(flatten)]
        db: DatabaseArgs,
        #[arg(long)]
        json: bool,
    },
    /// List stored messages in arrival order.
    Messages {
        #[command(flatten)]
        db: DatabaseArgs,
        #[arg(long)]
        sender: Option<String>,
        #[arg(long)]
        room: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = ServerArgs::parse();
    let result = match args.command {
        Command::Serve {
            bind_address,
            db,
            in_memory,
            recv_buffer,
            tail,
        } => serve(&bind_address, db, in_memory, recv_buffer, tail).await,
        Command::Peers { db, json } => list_peers(db, json),
        Command::Peer { name, db, json } => show_peer(&name, db, json),
        Command::Messages {
            db,
            sender,
            room,
            json,
        } => list_messages(db, sender.as_deref(), room.as_deref(), json),
    };

    if let Err(err) = result {
        error!("{}", err);
        std::process::exit(1);
    }
}

async fn serve(
    bind_address: &str,
    db: DatabaseArgs,
    in_memory: bool,
    recv_buffer: usize,
    tail: bool,
) -> Result<(), String> {
    let database = if in_memory {
        ChatDatabase::open_in_memory()
    } else {
        ChatDatabase::open(&db.database)
    }
    .map_err(|err| format!("failed to open database: {}", err))?;

    let ingest = IngestLoop::bind(bind_address, &database)
        .await
        .map_err(|err| format!("failed to bind {}: {}", bind_address, err))?
        .with_recv_buffer(recv_buffer);
    let mut handle = ingest.spawn().map_err(|err| err.to_string())?;
    info!("chat relay accepting datagrams on {}", handle.local_addr());

    let tail_task = tail.then(|| tokio::spawn(tail_messages(database.messages())));

    let finished = tokio::select! {
        state = handle.finished() => Some(state),
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                warn!("failed to listen for ctrl-c: {}", err);
            }
            None
        }
    };
    let outcome = match finished {
        Some(state) => state,
        None => {
            info!("shutdown requested");
            handle.shutdown().await
        }
    };

    if let Some(task) = tail_task {
        task.abort();
    }

    match outcome {
        IngestState::Faulted(reason) => Err(format!("ingest loop faulted: {}", reason)),
        _ => Ok(()),
    }
}

async fn tail_messages(messages: MessageStore) {
    let mut feed = messages.fetch_all();
    let mut printed = match feed.next().await {
        Some(existing) => existing.len(),
        None => return,
    };
    while let Some(snapshot) = feed.next().await {
        for message in snapshot.iter().skip(printed) {
            println!("{}", format_message(message));
        }
        printed = snapshot.len();
    }
}

fn open_existing(db: &DatabaseArgs) -> Result<ChatDatabase, String> {
    if !db.database.exists() {
        return Err(format!("database {} does not exist", db.database.display()));
    }
    ChatDatabase::open(&db.database).map_err(|err| format!("failed to open database: {}", err))
}

fn list_peers(db: DatabaseArgs, json: bool) -> Result<(), String> {
    let database = open_existing(&db)?;
    let peers = database.peers().fetch_all().snapshot();
    if json {
        return print_json(&*peers);
    }
    if peers.is_empty() {
        println!("no peers yet");
    }
    for peer in peers.iter() {
        println!("{}", format_peer(peer));
    }
    Ok(())
}

fn show_peer(name: &str, db: DatabaseArgs, json: bool) -> Result<(), String> {
    let database = open_existing(&db)?;
    let peer = database
        .peers()
        .fetch_by_name(name)
        .map_err(|err: StorageError| err.to_string())?
        .ok_or_else(|| format!("no peer named {:?}", name))?;
    let messages = database.messages().fetch_by_sender(name).snapshot();

    if json {
        return print_json(&serde_json::json!({ "peer": peer, "messages": *messages }));
    }
    println!("name:      {}", peer.name);
    println!("last seen: {}", format_timestamp(peer.timestamp_ms));
    println!("location:  {}", format_location(peer.latitude, peer.longitude));
    println!("messages:  {}", messages.len());
    print_messages(&messages);
    Ok(())
}

fn list_messages(
    db: DatabaseArgs,
    sender: Option<&str>,
    room: Option<&str>,
    json: bool,
) -> Result<(), String> {
    let database = open_existing(&db)?;
    let store = database.messages();
    let messages: Snapshot<Message> = match (sender, room) {
        (Some(sender), Some(room)) => Arc::new(
            store
                .fetch_by_sender(sender)
                .snapshot()
                .iter()
                .filter(|message| message.chatroom == room)
                .cloned()
                .collect(),
        ),
        (Some(sender), None) => store.fetch_by_sender(sender).snapshot(),
        (None, Some(room)) => store.fetch_by_room(room).snapshot(),
        (None, None) => store.fetch_all().snapshot(),
    };

    if json {
        return print_json(&*messages);
    }
    print_messages(&messages);
    Ok(())
}

fn print_messages(messages: &[Message]) {
    for message in messages {
        println!("{}", format_message(message));
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value).map_err(|err| err.to_string())?;
    println!("{}", text);
    Ok(())
}
