//! Coin service
//!
//! Runs one [`CommonCoin`] per `sid` over a [`Transport`]. Every coin lives in its own task
//! fed by an inbox; the registry only maps `sid` to the inbox and is never locked while a coin
//! is being driven.
//!
//! A coin is created on the first [`get_coin`](CoinService::get_coin) call or the first
//! message received for its `sid`. Once produced, the coin keeps answering peers for
//! [`linger_period`](CoinConfig::linger_period) and is then discarded. A coin that gives up or
//! is discarded by closing the service releases local callers still waiting for it with
//! [`CoinError`].

use core::fmt;
use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::{
    codec::{self, DecodeError, Wire},
    config::CoinConfig,
    gpa::{index_of, Automaton, NodeId, OutMessages},
    net::Transport,
    Ciphersuite, DkShare, PeerIndex,
};

use super::{Coin, CoinInput, CoinMessage, CommonCoin};

/// Coin service
pub struct CoinService<C: Ciphersuite, T: Transport> {
    inner: Arc<Inner<C, T>>,
}

impl<C: Ciphersuite, T: Transport> Clone for CoinService<C, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<C: Ciphersuite, T: Transport> {
    me: NodeId,
    members: Vec<NodeId>,
    dk: Arc<DkShare<C::Curve>>,
    config: CoinConfig,
    transport: T,
    state: Mutex<State<C>>,
}

struct State<C: Ciphersuite> {
    closed: bool,
    next_generation: u64,
    /// Inbox of every running coin, along with the generation telling apart coins that reuse
    /// the same `sid` after the previous one gave up
    coins: BTreeMap<Vec<u8>, (u64, mpsc::UnboundedSender<Event<C>>)>,
}

enum Event<C: Ciphersuite> {
    Get(oneshot::Sender<Coin>),
    Message { from: NodeId, msg: CoinMessage<C> },
}

/// Coin message along with the seed it belongs to
struct Envelope<C: Ciphersuite> {
    sid: Bytes,
    msg: CoinMessage<C>,
}

impl<C: Ciphersuite> Wire for Envelope<C> {
    fn encode(&self, buf: &mut BytesMut) {
        codec::put_bytes(buf, &self.sid);
        self.msg.encode(buf);
    }
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            sid: codec::get_bytes(buf)?,
            msg: CoinMessage::decode(buf)?,
        })
    }
}

impl<C: Ciphersuite, T: Transport> CoinService<C, T> {
    /// Constructs a service
    ///
    /// `members` must be ordered the same way as public shares in `dk`. Must be called within
    /// tokio runtime context.
    pub fn new(
        members: Vec<NodeId>,
        dk: Arc<DkShare<C::Curve>>,
        transport: T,
        config: CoinConfig,
    ) -> Result<Self, CoinError> {
        config.validate().map_err(Reason::InvalidConfig)?;
        if members.len() != usize::from(dk.n()) {
            return Err(Reason::MembersMismatch.into());
        }
        let me = *members
            .get(usize::from(dk.index()))
            .ok_or(Reason::MembersMismatch)?;
        Ok(Self {
            inner: Arc::new(Inner {
                me,
                members,
                dk,
                config,
                transport,
                state: Mutex::new(State {
                    closed: false,
                    next_generation: 0,
                    coins: BTreeMap::new(),
                }),
            }),
        })
    }

    /// Obtains the coin for `sid`
    ///
    /// Waits until enough members release their coin shares. Fails if the coin is given up or
    /// the service is closed before the coin is ready.
    pub async fn get_coin(&self, sid: &[u8]) -> Result<Coin, CoinError> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(sid, Event::Get(tx))?;
        rx.await.map_err(|_| Reason::Canceled.into())
    }

    /// Handles a message received from member `from`
    ///
    /// Malformed messages are logged and dropped.
    pub fn receive(&self, from: PeerIndex, payload: Bytes) {
        let Some(from_id) = self.inner.members.get(usize::from(from)).copied() else {
            tracing::warn!(from, "coin message from unknown member");
            return;
        };
        let envelope = match Envelope::<C>::from_bytes(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(peer = %from_id, error = %err, "dropping malformed coin message");
                return;
            }
        };
        let event = Event::Message {
            from: from_id,
            msg: envelope.msg,
        };
        if let Err(err) = self.dispatch(&envelope.sid, event) {
            tracing::debug!(peer = %from_id, error = %err, "coin message dropped");
        }
    }

    /// Closes the service
    ///
    /// All coins are discarded, callers waiting for them receive [`CoinError`].
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        state.coins.clear();
    }

    /// Number of coins being run
    pub fn active_coins(&self) -> usize {
        self.inner.state.lock().coins.len()
    }

    fn dispatch(&self, sid: &[u8], event: Event<C>) -> Result<(), CoinError> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(Reason::Closed.into());
        }
        if let Some((_, inbox)) = state.coins.get(sid) {
            match inbox.send(event) {
                Ok(()) => return Ok(()),
                // Coin task has just finished, but hasn't unregistered yet
                Err(mpsc::error::SendError(event)) => return self.spawn(&mut state, sid, event),
            }
        }
        self.spawn(&mut state, sid, event)
    }

    fn spawn(&self, state: &mut State<C>, sid: &[u8], event: Event<C>) -> Result<(), CoinError> {
        let coin = CommonCoin::new(
            self.inner.me,
            self.inner.members.clone(),
            self.inner.dk.clone(),
            sid.to_vec(),
            self.inner.config.resend_period,
            self.inner.config.give_up_timeout,
        )
        .map_err(Reason::Protocol)?;
        let (tx, rx) = mpsc::unbounded_channel();
        // Receiver is alive: it's moved into the task spawned below
        let _ = tx.send(event);
        let generation = state.next_generation;
        state.next_generation += 1;
        state.coins.insert(sid.to_vec(), (generation, tx));
        tokio::spawn(run_coin(self.inner.clone(), coin, rx, generation));
        Ok(())
    }
}

async fn run_coin<C: Ciphersuite, T: Transport>(
    inner: Arc<Inner<C, T>>,
    mut coin: CommonCoin<C>,
    mut inbox: mpsc::UnboundedReceiver<Event<C>>,
    generation: u64,
) {
    let sid = coin.sid().to_vec();
    let mut waiters: Vec<oneshot::Sender<Coin>> = vec![];
    let mut produced_at: Option<tokio::time::Instant> = None;
    let mut ticker = tokio::time::interval(inner.config.resend_period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let out = tokio::select! {
            event = inbox.recv() => match event {
                None => break,
                Some(Event::Get(waiter)) => {
                    waiters.push(waiter);
                    if coin.is_started() {
                        OutMessages::new()
                    } else {
                        match coin.input(CoinInput::Start) {
                            Ok(out) => out,
                            Err(err) => {
                                tracing::error!(error = %err, "coin cannot be started");
                                break;
                            }
                        }
                    }
                }
                Some(Event::Message { from, msg }) => coin.message(from, msg),
            },
            _ = ticker.tick() => {
                let now = tokio::time::Instant::now().into_std();
                match coin.input(CoinInput::Tick(now)) {
                    Ok(out) => out,
                    Err(err) => {
                        tracing::error!(error = %err, "coin tick failed");
                        OutMessages::new()
                    }
                }
            }
        };
        send_all(&*inner, &sid, out);

        if let Some(value) = coin.output() {
            for waiter in waiters.drain(..) {
                let _ = waiter.send(*value);
            }
            let produced_at = *produced_at.get_or_insert_with(tokio::time::Instant::now);
            if produced_at.elapsed() >= inner.config.linger_period {
                break;
            }
        }
        if coin.is_given_up() {
            break;
        }
    }

    // Waiters are dropped here, so they observe cancellation
    let mut state = inner.state.lock();
    if state
        .coins
        .get(&sid)
        .is_some_and(|(registered, _)| *registered == generation)
    {
        state.coins.remove(&sid);
    }
    tracing::debug!(sid = %hex::encode(&sid), "coin task finished");
}

fn send_all<C: Ciphersuite, T: Transport>(
    inner: &Inner<C, T>,
    sid: &[u8],
    out: OutMessages<CoinMessage<C>>,
) {
    for outgoing in out {
        let Some(to) = index_of(&inner.members, &outgoing.to) else {
            continue;
        };
        let envelope = Envelope {
            sid: Bytes::copy_from_slice(sid),
            msg: outgoing.msg,
        };
        inner.transport.send(to, envelope.to_bytes());
    }
}

/// Coin service error
#[derive(Debug)]
pub struct CoinError(Reason);

#[derive(Debug)]
enum Reason {
    Canceled,
    Closed,
    MembersMismatch,
    InvalidConfig(crate::config::InvalidConfig),
    Protocol(crate::gpa::ProtocolError),
}

impl CoinError {
    /// Indicates that the coin was given up or discarded before it was produced
    pub fn is_canceled(&self) -> bool {
        matches!(self.0, Reason::Canceled | Reason::Closed)
    }
}

impl From<Reason> for CoinError {
    fn from(err: Reason) -> Self {
        Self(err)
    }
}

impl fmt::Display for CoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Reason::Canceled => f.write_str("coin canceled"),
            Reason::Closed => f.write_str("coin service is closed"),
            Reason::MembersMismatch => f.write_str("members don't match the key share"),
            Reason::InvalidConfig(_) => f.write_str("invalid config"),
            Reason::Protocol(_) => f.write_str("coin cannot be constructed"),
        }
    }
}

impl std::error::Error for CoinError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.0 {
            Reason::Canceled | Reason::Closed | Reason::MembersMismatch => None,
            Reason::InvalidConfig(err) => Some(err),
            Reason::Protocol(err) => Some(err),
        }
    }
}
