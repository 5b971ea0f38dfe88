//! Primary-side replication coordinator.
//!
//! One task owns every follower socket's write half and the offset meter.
//! Connection handlers never touch a follower socket directly — they send
//! events over a channel and, for `WAIT`, await a reply on a one-shot.
//! Grounded on the event-loop shape of a `select`-over-channels registrar
//! (`replicationEventChan` / `replicaRegistrationChan` in
//! `app/services/master.go`), translated into a single `mpsc` carrying a
//! tagged event enum instead of two separate channels.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::protocol::encode::encode_array_of_bulk;
use crate::protocol::frame::{decode_next, Frame};
use crate::replication::offset::OffsetMeter;

pub enum CoordinatorEvent {
    /// A write command was applied locally and must be fanned out verbatim.
    Replicated(Vec<u8>),
    /// A connection just completed the PSYNC handshake; hand its socket
    /// over so the coordinator can own it for the rest of its life.
    RegisterFollower(TcpStream),
    /// A client issued `WAIT`; block until enough acks land or the timeout
    /// expires, then report how many followers acknowledged.
    Wait {
        min_acks: i64,
        timeout_ms: u64,
        resp: oneshot::Sender<i64>,
    },
    FollowerAck(u64),
    FollowerGone(u64),
}

pub struct PrimaryCoordinator {
    events: mpsc::Receiver<CoordinatorEvent>,
    self_tx: mpsc::Sender<CoordinatorEvent>,
    followers: HashMap<u64, OwnedWriteHalf>,
    next_follower_id: u64,
    offset: Arc<OffsetMeter>,
    ever_replicated: bool,
}

impl PrimaryCoordinator {
    pub fn new(offset: Arc<OffsetMeter>) -> (Self, mpsc::Sender<CoordinatorEvent>) {
        let (tx, rx) = mpsc::channel(256);
        let coordinator = Self {
            events: rx,
            self_tx: tx.clone(),
            followers: HashMap::new(),
            next_follower_id: 0,
            offset,
            ever_replicated: false,
        };
        (coordinator, tx)
    }

    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            self.handle(event).await;
        }
    }

    async fn handle(&mut self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::Replicated(frame) => self.on_replicated(frame).await,
            CoordinatorEvent::RegisterFollower(stream) => self.on_register(stream),
            CoordinatorEvent::Wait {
                min_acks,
                timeout_ms,
                resp,
            } => self.on_wait(min_acks, timeout_ms, resp).await,
            CoordinatorEvent::FollowerAck(_) => self.offset.inc_ack_count(),
            CoordinatorEvent::FollowerGone(id) => {
                self.followers.remove(&id);
                info!(follower = id, "follower disconnected");
            }
        }
    }

    async fn on_replicated(&mut self, frame: Vec<u8>) {
        self.ever_replicated = true;
        self.offset.add_to_offset(frame.len() as i64);
        self.broadcast(&frame).await;
    }

    fn on_register(&mut self, stream: TcpStream) {
        let id = self.next_follower_id;
        self.next_follower_id += 1;
        let (read_half, write_half) = stream.into_split();
        self.followers.insert(id, write_half);
        tokio::spawn(follower_reader(id, read_half, self.self_tx.clone()));
        self.offset.inc_ack_count();
        info!(follower = id, "follower registered");
    }

    /// The coordinator's own `REPLCONF GETACK *` probe counts toward the
    /// offset like any other replicated frame, but only a real prior write
    /// flips `ever_replicated` — `WAIT` issued before anything has ever
    /// replicated returns the current follower count immediately instead of
    /// waiting on acks nobody will send for data that was never sent.
    async fn on_wait(&mut self, min_acks: i64, timeout_ms: u64, resp: oneshot::Sender<i64>) {
        if !self.ever_replicated {
            let _ = resp.send(self.followers.len() as i64);
            return;
        }

        self.offset.reset_ack_count();
        let getack = encode_array_of_bulk(&[b"REPLCONF".as_slice(), b"GETACK", b"*"]);
        self.offset.add_to_offset(getack.len() as i64);
        self.broadcast(&getack).await;

        let deadline = tokio::time::sleep(Duration::from_millis(timeout_ms));
        tokio::pin!(deadline);
        loop {
            if self.offset.read_ack_count() >= min_acks {
                break;
            }
            tokio::select! {
                _ = &mut deadline => break,
                event = self.events.recv() => {
                    match event {
                        Some(e) => self.handle(e).await,
                        None => break,
                    }
                }
            }
        }
        let _ = resp.send(self.offset.read_ack_count());
    }

    async fn broadcast(&mut self, frame: &[u8]) {
        let mut gone = Vec::new();
        for (id, sock) in self.followers.iter_mut() {
            if let Err(err) = sock.write_all(frame).await {
                warn!(follower = *id, error = %err, "failed to write to follower, dropping");
                gone.push(*id);
            }
        }
        for id in gone {
            self.followers.remove(&id);
        }
    }
}

/// Reads the inbound half of each follower connection: `REPLCONF ACK`
/// frames feed the ack counter, everything else is logged and dropped.
async fn follower_reader(id: u64, read_half: OwnedReadHalf, tx: mpsc::Sender<CoordinatorEvent>) {
    let mut reader = BufReader::new(read_half);
    loop {
        match decode_next(&mut reader).await {
            Ok(Frame::Command { name, args, .. }) => {
                if name == "replconf" && args.first().is_some_and(|a| a.eq_ignore_ascii_case(b"ack")) {
                    if tx.send(CoordinatorEvent::FollowerAck(id)).await.is_err() {
                        break;
                    }
                }
            }
            Ok(Frame::Eof) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(follower = id, error = %err, "follower stream decode error, disconnecting");
                break;
            }
        }
    }
    let _ = tx.send(CoordinatorEvent::FollowerGone(id)).await;
}
