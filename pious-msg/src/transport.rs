// Transport contract consumed by both sides of the protocol: reliable,
// ordered, point-to-point messages between named endpoints. The substrate
// itself is external; ChannelRealm below is the in-process realization used
// by tests and the demo executable.

use crate::SrcDest;
use pious_base::{err, Result};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Clone, Debug)]
pub struct Envelope {
    pub src: SrcDest,
    pub tag: i32,
    pub bytes: Vec<u8>,
}

pub trait Transport {
    fn local(&self) -> SrcDest;

    fn send(&self, dst: SrcDest, tag: i32, bytes: Vec<u8>) -> Result<()>;

    /// Receive the next message matching the given source and/or tag filter,
    /// buffering non-matching messages for later delivery in arrival order.
    /// `None` timeout blocks; an elapsed timeout yields `Ok(None)`.
    fn recv(
        &self,
        from: Option<SrcDest>,
        tag: Option<i32>,
        timeout: Option<Duration>,
    ) -> Result<Option<Envelope>>;
}

/// An in-process message realm. Endpoints are registered once and moved to
/// their owning threads; senders are looked up per message.
#[derive(Clone, Default)]
pub struct ChannelRealm {
    peers: Arc<Mutex<HashMap<SrcDest, Sender<Envelope>>>>,
}

impl ChannelRealm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(&self, id: SrcDest) -> Result<ChannelEndpoint> {
        let (tx, rx) = channel();
        let mut peers = self.peers.lock().map_err(|_| err("realm lock poisoned"))?;
        if peers.insert(id, tx).is_some() {
            return Err(err("endpoint id already registered"));
        }
        Ok(ChannelEndpoint {
            me: id,
            peers: self.peers.clone(),
            rx,
            stashed: RefCell::new(VecDeque::new()),
        })
    }
}

pub struct ChannelEndpoint {
    me: SrcDest,
    peers: Arc<Mutex<HashMap<SrcDest, Sender<Envelope>>>>,
    rx: Receiver<Envelope>,
    // Messages received while waiting for something more specific.
    stashed: RefCell<VecDeque<Envelope>>,
}

fn matches(env: &Envelope, from: Option<SrcDest>, tag: Option<i32>) -> bool {
    from.map_or(true, |f| env.src == f) && tag.map_or(true, |t| env.tag == t)
}

impl Transport for ChannelEndpoint {
    fn local(&self) -> SrcDest {
        self.me
    }

    fn send(&self, dst: SrcDest, tag: i32, bytes: Vec<u8>) -> Result<()> {
        let peers = self.peers.lock().map_err(|_| err("realm lock poisoned"))?;
        let tx = peers.get(&dst).ok_or_else(|| err("unknown destination"))?;
        tx.send(Envelope {
            src: self.me,
            tag,
            bytes,
        })
        .map_err(|_| err("destination endpoint closed"))
    }

    fn recv(
        &self,
        from: Option<SrcDest>,
        tag: Option<i32>,
        timeout: Option<Duration>,
    ) -> Result<Option<Envelope>> {
        let mut stashed = self.stashed.borrow_mut();
        if let Some(pos) = stashed.iter().position(|e| matches(e, from, tag)) {
            return Ok(stashed.remove(pos));
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let env = match deadline {
                None => self.rx.recv().map_err(|_| err("transport realm closed"))?,
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Ok(None);
                    }
                    match self.rx.recv_timeout(d - now) {
                        Ok(env) => env,
                        Err(RecvTimeoutError::Timeout) => return Ok(None),
                        Err(RecvTimeoutError::Disconnected) => {
                            return Err(err("transport realm closed"))
                        }
                    }
                }
            };
            if matches(&env, from, tag) {
                return Ok(Some(env));
            }
            trace!(target: "pious", src = env.src.0, tag = env.tag, "message stashed");
            stashed.push_back(env);
        }
    }
}
