//! Session registry and identifier allocation for connected players
//!
//! This module owns the only state shared between connections:
//! - Which identifiers are in use, either by a registered player or by a
//!   connection that is still in its handshake
//! - The per-player record (username and last reported state)
//! - The send handle used to reach each player's connection
//!
//! The registry is wrapped in a single `RwLock` (see [`SharedRegistry`]).
//! Broadcasts iterate the registry while holding that lock, so membership
//! cannot change underneath a fan-out.

use crate::error::RelayError;
use log::{debug, info, warn};
use rand::Rng;
use serde_json::Value;
use shared::{default_health, default_rotation, spawn_position, PlayerNotice, PlayerUpdate};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;

/// Random picks tried before falling back to a scan of the pool.
pub const MAX_ALLOCATION_ATTEMPTS: usize = 32;

/// Payloads queued per player before further messages to it are dropped.
///
/// A peer that stops reading fills its queue and then misses messages
/// instead of growing server memory without limit.
pub const OUTBOUND_QUEUE: usize = 256;

/// Send handle feeding a connection's writer task.
pub type Outbound = mpsc::Sender<Vec<u8>>;

/// Registry handle shared by the acceptor and every connection handler.
pub type SharedRegistry = Arc<RwLock<SessionRegistry>>;

/// Picks an identifier in `1..=max_players` that is not in `in_use`.
///
/// Tries a bounded number of random picks, then scans the pool in ascending
/// order, so it always terminates. Fails with `ServerFull` when the pool is
/// exhausted.
pub fn allocate(in_use: &HashSet<String>, max_players: usize) -> Result<String, RelayError> {
    if max_players == 0 {
        return Err(RelayError::ServerFull { max_players });
    }

    if in_use.len() < max_players {
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let candidate = rng.gen_range(1..=max_players).to_string();
            if !in_use.contains(&candidate) {
                return Ok(candidate);
            }
        }
    }

    (1..=max_players)
        .map(|n| n.to_string())
        .find(|candidate| !in_use.contains(candidate))
        .ok_or(RelayError::ServerFull { max_players })
}

/// Server-side state of one connected player
#[derive(Debug)]
pub struct PlayerRecord {
    pub id: String,
    pub addr: SocketAddr,
    /// Name sent by the client during the handshake
    pub username: String,
    /// Last reported position; opaque JSON echoed back to other players
    pub position: Value,
    pub rotation: Value,
    pub health: Value,
    outbound: Outbound,
}

impl PlayerRecord {
    /// Creates a record with the spawn defaults: position `[0,1,0]`,
    /// rotation `0`, health `100`.
    pub fn new(id: String, addr: SocketAddr, username: String, outbound: Outbound) -> Self {
        Self {
            id,
            addr,
            username,
            position: spawn_position(),
            rotation: default_rotation(),
            health: default_health(),
            outbound,
        }
    }

    /// Replaces the stored player state with `update`.
    pub fn apply_update(&mut self, update: PlayerUpdate) {
        self.position = update.position;
        self.rotation = update.rotation;
        self.health = update.health;
    }

    /// Notice announcing this player with its current state.
    pub fn arrival_notice(&self) -> PlayerNotice {
        PlayerNotice::arrival(
            &self.id,
            &self.username,
            self.position.clone(),
            self.health.clone(),
        )
    }

    /// Queues a payload for this player's connection without waiting.
    ///
    /// Fails when the queue is full (the peer is not reading) or once the
    /// connection's writer has gone away.
    pub fn send(&self, payload: Vec<u8>) -> Result<(), TrySendError<Vec<u8>>> {
        self.outbound.try_send(payload)
    }
}

/// Outcome of one fan-out: how many peers got the payload queued and how
/// many were skipped because their queue was full or closed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Mapping from identifier to player record.
///
/// An identifier is a key of `players` exactly when its connection has
/// completed the handshake and has not yet closed. Identifiers handed out to
/// connections still in handshake live in `reserved` and count against
/// capacity.
#[derive(Debug)]
pub struct SessionRegistry {
    players: HashMap<String, PlayerRecord>,
    reserved: HashSet<String>,
    max_players: usize,
}

impl SessionRegistry {
    /// Creates an empty registry with `max_players` identifiers.
    pub fn new(max_players: usize) -> Self {
        Self {
            players: HashMap::new(),
            reserved: HashSet::new(),
            max_players,
        }
    }

    /// Creates an empty registry behind the shared lock.
    pub fn shared(max_players: usize) -> SharedRegistry {
        Arc::new(RwLock::new(Self::new(max_players)))
    }

    /// Size of the identifier pool.
    pub fn max_players(&self) -> usize {
        self.max_players
    }

    /// Reserves a free identifier for a connection entering its handshake.
    pub fn allocate_id(&mut self) -> Result<String, RelayError> {
        let in_use: HashSet<String> = self
            .players
            .keys()
            .chain(self.reserved.iter())
            .cloned()
            .collect();

        let id = allocate(&in_use, self.max_players)?;
        self.reserved.insert(id.clone());
        Ok(id)
    }

    /// Frees an identifier whose handshake failed.
    pub fn release_reservation(&mut self, id: &str) -> bool {
        self.reserved.remove(id)
    }

    /// Adds a player that completed its handshake.
    pub fn register(&mut self, record: PlayerRecord) {
        self.reserved.remove(&record.id);
        info!(
            "Player {} (ID {}) joined from {}",
            record.username, record.id, record.addr
        );
        self.players.insert(record.id.clone(), record);
    }

    /// Removes a player. Dropping the returned record closes its connection.
    pub fn remove(&mut self, id: &str) -> Option<PlayerRecord> {
        self.players.remove(id)
    }

    /// Applies a player update. Returns false if the player is not registered.
    pub fn apply_update(&mut self, id: &str, update: PlayerUpdate) -> bool {
        match self.players.get_mut(id) {
            Some(record) => {
                record.apply_update(update);
                true
            }
            None => false,
        }
    }

    /// Sends `payload` to every registered player except `from`.
    ///
    /// A failed send only counts against that peer; the fan-out continues.
    pub fn broadcast(&self, from: &str, payload: &[u8]) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        for (id, record) in &self.players {
            if id == from {
                continue;
            }

            match record.send(payload.to_vec()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!("Dropped message for player {}: outbound queue full", id);
                    report.failed += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Dropped message for player {}: connection closing", id);
                    report.failed += 1;
                }
            }
        }

        report
    }

    /// Arrival notices for every registered player other than `id`.
    pub fn roster_for(&self, id: &str) -> Vec<PlayerNotice> {
        self.players
            .values()
            .filter(|record| record.id != id)
            .map(PlayerRecord::arrival_notice)
            .collect()
    }

    /// Looks up a registered player.
    pub fn get(&self, id: &str) -> Option<&PlayerRecord> {
        self.players.get(id)
    }

    /// Returns true if `id` belongs to a registered player
    pub fn contains(&self, id: &str) -> bool {
        self.players.contains_key(id)
    }

    /// Registered identifiers in ascending numeric order.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.players.keys().cloned().collect();
        ids.sort_by_key(|id| id.parse::<usize>().unwrap_or(usize::MAX));
        ids
    }

    /// Returns the number of connections still in their handshake
    pub fn reserved_count(&self) -> usize {
        self.reserved.len()
    }

    /// Returns the number of registered players
    pub fn len(&self) -> usize {
        self.players.len()
    }

    /// Returns true if no players are registered
    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}
