//! SQLite-backed peer and message stores.
//!
//! Both stores share one connection behind a mutex. Every write publishes the
//! new snapshot while still holding the lock, so snapshots reach subscribers
//! in the same order the writes hit the database.

use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use chatrelay_core::{Message, Peer};
use rusqlite::{Connection, OptionalExtension, Row, params};
use thiserror::Error;
use tracing::{debug, info};

use crate::feed::{ChangeFeed, FeedPublisher, row_filter};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS peers (
    name TEXT PRIMARY KEY NOT NULL,
    timestamp INTEGER NOT NULL,
    latitude REAL,
    longitude REAL
);
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sender TEXT NOT NULL,
    chatroom TEXT NOT NULL,
    message_text TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    latitude REAL,
    longitude REAL
);
CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages(sender);
";

const PEER_COLUMNS: &str = "name, timestamp, latitude, longitude";
const MESSAGE_COLUMNS: &str =
    "id, sender, chatroom, message_text, timestamp, latitude, longitude";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database lock poisoned")]
    LockPoisoned,
}

type SharedConnection = Arc<Mutex<Connection>>;

fn lock(conn: &SharedConnection) -> Result<MutexGuard<'_, Connection>, StorageError> {
    conn.lock().map_err(|_| StorageError::LockPoisoned)
}

/// Owns the database connection and hands out the two stores built on it.
#[derive(Debug, Clone)]
pub struct ChatDatabase {
    peers: PeerStore,
    messages: MessageStore,
}

impl ChatDatabase {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        info!("opening chat database {}", path.display());
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA)?;
        let peers = query_peers(&conn)?;
        let messages = query_messages(&conn)?;
        debug!(
            "loaded {} peers and {} messages from storage",
            peers.len(),
            messages.len()
        );

        let conn = Arc::new(Mutex::new(conn));
        Ok(Self {
            peers: PeerStore {
                conn: conn.clone(),
                feed: Arc::new(FeedPublisher::new(peers)),
            },
            messages: MessageStore {
                conn,
                feed: Arc::new(FeedPublisher::new(messages)),
            },
        })
    }

    pub fn peers(&self) -> PeerStore {
        self.peers.clone()
    }

    pub fn messages(&self) -> MessageStore {
        self.messages.clone()
    }
}

/// Last known state per peer name.
#[derive(Debug, Clone)]
pub struct PeerStore {
    conn: SharedConnection,
    feed: Arc<FeedPublisher<Peer>>,
}

impl PeerStore {
    /// Inserts the peer, or overwrites timestamp and location of the row
    /// with the same name.
    pub fn upsert(&self, peer: &Peer) -> Result<(), StorageError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO peers (name, timestamp, latitude, longitude)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
                 timestamp = excluded.timestamp,
                 latitude = excluded.latitude,
                 longitude = excluded.longitude",
            params![peer.name, peer.timestamp_ms, peer.latitude, peer.longitude],
        )?;
        let snapshot = query_peers(&conn)?;
        self.feed.publish(snapshot);
        Ok(())
    }

    /// All peers ordered by name, followed by live updates.
    pub fn fetch_all(&self) -> ChangeFeed<Peer> {
        self.feed.subscribe(None)
    }

    pub fn fetch_by_name(&self, name: &str) -> Result<Option<Peer>, StorageError> {
        let conn = lock(&self.conn)?;
        let peer = conn
            .query_row(
                &format!("SELECT {PEER_COLUMNS} FROM peers WHERE name = ?1"),
                params![name],
                peer_from_row,
            )
            .optional()?;
        Ok(peer)
    }

    pub fn len(&self) -> usize {
        self.feed.current().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Append-only log of received messages.
#[derive(Debug, Clone)]
pub struct MessageStore {
    conn: SharedConnection,
    feed: Arc<FeedPublisher<Message>>,
}

impl MessageStore {
    /// Stores the message and returns it with its assigned id. Any id already
    /// set on `message` is ignored.
    pub fn append(&self, message: &Message) -> Result<Message, StorageError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO messages (sender, chatroom, message_text, timestamp, latitude, longitude)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.sender,
                message.chatroom,
                message.text,
                message.timestamp_ms,
                message.latitude,
                message.longitude,
            ],
        )?;
        let stored = Message {
            id: Some(conn.last_insert_rowid()),
            ..message.clone()
        };
        self.feed.modify(|rows| rows.push(stored.clone()));
        debug!(
            "message {:?} appended, {} live subscribers",
            stored.id,
            self.feed.subscriber_count()
        );
        Ok(stored)
    }

    /// Every message in insertion order, followed by live updates.
    pub fn fetch_all(&self) -> ChangeFeed<Message> {
        self.feed.subscribe(None)
    }

    pub fn fetch_by_sender(&self, sender: &str) -> ChangeFeed<Message> {
        let sender = sender.to_owned();
        self.feed
            .subscribe(Some(row_filter(move |message: &Message| message.sender == sender)))
    }

    pub fn fetch_by_room(&self, chatroom: &str) -> ChangeFeed<Message> {
        let chatroom = chatroom.to_owned();
        self.feed.subscribe(Some(row_filter(move |message: &Message| {
            message.chatroom == chatroom
        })))
    }

    pub fn len(&self) -> usize {
        self.feed.current().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn query_peers(conn: &Connection) -> Result<Vec<Peer>, StorageError> {
    let mut stmt = conn.prepare(&format!("SELECT {PEER_COLUMNS} FROM peers ORDER BY name"))?;
    let peers = stmt
        .query_map([], peer_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(peers)
}

fn query_messages(conn: &Connection) -> Result<Vec<Message>, StorageError> {
    let mut stmt = conn.prepare(&format!("SELECT {MESSAGE_COLUMNS} FROM messages ORDER BY id"))?;
    let messages = stmt
        .query_map([], message_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(messages)
}

fn peer_from_row(row: &Row<'_>) -> rusqlite::Result<Peer> {
    Ok(Peer {
        name: row.get(0)?,
        timestamp_ms: row.get(1)?,
        latitude: row.get(2)?,
        longitude: row.get(3)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: Some(row.get(0)?),
        sender: row.get(1)?,
        chatroom: row.get(2)?,
        text: row.get(3)?,
        timestamp_ms: row.get(4)?,
        latitude: row.get(5)?,
        longitude: row.get(6)?,
    })
}
