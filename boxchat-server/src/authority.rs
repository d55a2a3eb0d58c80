//! The state authority: sole owner of the client table and the ban set.
//!
//! Readers and the acceptor only produce [`Event`]s. This task consumes
//! them one at a time, so no client state is ever shared or locked.
//!
//! Per-client message handling runs these stages in order, stopping at the
//! first one that rejects:
//!
//! 1. unknown client: the connection is closed and an error reported
//! 2. timeout: a client serving a penalty gets a wait notice; once the
//!    penalty has elapsed the flag clears and the same message carries on
//! 3. debounce: a message closer than `debounce` to the last accepted one
//!    is a strike; `ban_threshold` strikes bans the address for good
//! 4. broadcast to every connected client, sender included

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{DEFAULT_DEBOUNCE_SECS, DEFAULT_TIMEOUT_SECS, DEFAULT_WELCOME};
use crate::error::AuthorityError;
use crate::event::{Address, ClientHandle, ConnectionId, Event};
use crate::notice;

/// Strikes that turn a timeout into a permanent ban.
pub const BAN_THRESHOLD: u32 = 3;

/// Abuse-control knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    /// Penalty length after a debounce violation.
    pub timeout: Duration,
    /// Minimum spacing between accepted messages.
    pub debounce: Duration,
    pub ban_threshold: u32,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs_f64(DEFAULT_TIMEOUT_SECS),
            debounce: Duration::from_secs_f64(DEFAULT_DEBOUNCE_SECS),
            ban_threshold: BAN_THRESHOLD,
        }
    }
}

/// One connected, non-banned client.
#[derive(Debug)]
struct ClientRecord {
    handle: ClientHandle,
    /// Last message that passed debounce, or the last violation. `None`
    /// until the first message, which therefore always passes.
    last_message_at: Option<Instant>,
    timed_out: bool,
    strikes: u32,
}

impl ClientRecord {
    fn new(handle: ClientHandle) -> Self {
        Self {
            handle,
            last_message_at: None,
            timed_out: false,
            strikes: 0,
        }
    }
}

/// Read-only view of a client record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSnapshot {
    pub conn_id: ConnectionId,
    pub last_message_at: Option<Instant>,
    pub timed_out: bool,
    pub strikes: u32,
}

/// What processing one event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// New record created and greeted. `replaced` is the connection that
    /// previously held the same address, now closed.
    Welcomed { replaced: Option<ConnectionId> },
    /// Connection from a banned address, closed on arrival.
    RejectedBanned,
    /// Record removed on disconnect.
    Removed,
    /// Disconnect for a client that was already gone.
    AlreadyGone,
    /// Message dropped: the client is still serving a penalty.
    Waiting { remaining: Duration },
    /// Debounce violation below the ban threshold.
    Struck { strikes: u32 },
    /// Debounce violation that reached the ban threshold.
    Banned,
    /// Message relayed to `recipients` clients.
    Broadcast { recipients: usize },
}

pub struct Authority {
    policy: Policy,
    welcome: String,
    clients: HashMap<Address, ClientRecord>,
    banned: HashSet<Address>,
}

impl Authority {
    pub fn new(policy: Policy, welcome: impl Into<String>) -> Self {
        Self {
            policy,
            welcome: welcome.into(),
            clients: HashMap::new(),
            banned: HashSet::new(),
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn is_banned(&self, address: &Address) -> bool {
        self.banned.contains(address)
    }

    pub fn client(&self, address: &Address) -> Option<ClientSnapshot> {
        self.clients.get(address).map(|c| ClientSnapshot {
            conn_id: c.handle.id(),
            last_message_at: c.last_message_at,
            timed_out: c.timed_out,
            strikes: c.strikes,
        })
    }

    /// Spawn the actor loop, returning the producer side of its queue.
    pub fn spawn(self, capacity: usize) -> (mpsc::Sender<Event>, JoinHandle<Self>) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, tokio::spawn(self.run(rx)))
    }

    /// Consume events until every producer is gone. Returns the final
    /// state.
    pub async fn run(mut self, mut events: mpsc::Receiver<Event>) -> Self {
        while let Some(event) = events.recv().await {
            let handle = event.handle();
            tracing::trace!(address = %handle.address(), conn_id = %handle.id(), ?event, "Event");
            if let Err(e) = self.handle(event, Instant::now()) {
                tracing::warn!("{e}");
            }
        }
        tracing::info!(clients = self.clients.len(), banned = self.banned.len(), "Event queue closed, authority stopping");
        self
    }

    /// Apply one event at time `now`.
    pub fn handle(&mut self, event: Event, now: Instant) -> Result<Outcome, AuthorityError> {
        match event {
            Event::Connected(handle) => Ok(self.connected(handle)),
            Event::Disconnected(handle) => Ok(self.disconnected(&handle)),
            Event::NewMessage { handle, text } => self.new_message(&handle, text, now),
        }
    }

    fn connected(&mut self, handle: ClientHandle) -> Outcome {
        let address = handle.address().clone();
        if self.banned.contains(&address) {
            tracing::info!(%address, conn_id = %handle.id(), "Rejected banned client");
            handle.close();
            return Outcome::RejectedBanned;
        }

        handle.write(self.welcome.as_str());
        tracing::info!(%address, conn_id = %handle.id(), "Client connected");

        let id = handle.id();
        let replaced = self
            .clients
            .insert(address.clone(), ClientRecord::new(handle))
            .filter(|old| old.handle.id() != id)
            .map(|old| {
                tracing::info!(%address, conn_id = %old.handle.id(), "Replaced by newer connection");
                old.handle.close();
                old.handle.id()
            });
        Outcome::Welcomed { replaced }
    }

    fn disconnected(&mut self, handle: &ClientHandle) -> Outcome {
        let address = handle.address();
        let live = self
            .clients
            .get(address)
            .is_some_and(|c| c.handle.id() == handle.id());
        if !live {
            return Outcome::AlreadyGone;
        }
        self.clients.remove(address);
        tracing::info!(%address, conn_id = %handle.id(), "Client disconnected");
        Outcome::Removed
    }

    fn new_message(
        &mut self,
        handle: &ClientHandle,
        text: String,
        now: Instant,
    ) -> Result<Outcome, AuthorityError> {
        let address = handle.address().clone();
        let Some(client) = self
            .clients
            .get_mut(&address)
            .filter(|c| c.handle.id() == handle.id())
        else {
            handle.close();
            return Err(AuthorityError::UnknownClient {
                address,
                conn_id: handle.id(),
            });
        };

        let elapsed = client.last_message_at.map(|at| now.saturating_duration_since(at));

        if client.timed_out {
            match elapsed {
                Some(elapsed) if elapsed < self.policy.timeout => {
                    let remaining = self.policy.timeout - elapsed;
                    tracing::info!(%address, ?remaining, "Client still timed out");
                    client.handle.write(notice::still_timed_out(remaining));
                    return Ok(Outcome::Waiting { remaining });
                }
                _ => {
                    tracing::info!(%address, "Timeout lifted");
                    client.timed_out = false;
                }
            }
        }

        if elapsed.is_some_and(|elapsed| elapsed < self.policy.debounce) {
            client.strikes += 1;
            let strikes = client.strikes;

            if strikes >= self.policy.ban_threshold {
                tracing::warn!(%address, strikes, "Banning client");
                client.handle.write(notice::banned());
                client.handle.close();
                self.clients.remove(&address);
                self.banned.insert(address);
                return Ok(Outcome::Banned);
            }

            tracing::info!(%address, strikes, timeout = ?self.policy.timeout, "Timing out client");
            client.timed_out = true;
            client.last_message_at = Some(now);
            client.handle.write(notice::strike(strikes, self.policy.timeout));
            return Ok(Outcome::Struck { strikes });
        }

        client.last_message_at = Some(now);
        tracing::debug!(%address, text = %text, "Broadcasting message");
        for client in self.clients.values() {
            client.handle.write(text.as_str());
        }
        Ok(Outcome::Broadcast {
            recipients: self.clients.len(),
        })
    }
}

impl Default for Authority {
    fn default() -> Self {
        Self::new(Policy::default(), DEFAULT_WELCOME)
    }
}
