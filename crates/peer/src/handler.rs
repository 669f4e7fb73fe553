//! Demo request handler: answers relayed requests over the wire contract.

use crate::election::Election;
use async_trait::async_trait;
use common::{error::Result, ControlCommand, PeerHandler, RequestKind, WireMessage};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

/// Identity and metadata presented in the handshake query parameters.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    pub client_id: String,
    pub token: String,
    pub world_id: String,
    pub world_title: String,
    pub foundry_version: String,
    pub system_id: String,
    pub system_title: String,
    pub system_version: String,
    pub custom_name: Option<String>,
}

/// Answers `roll`-family requests locally and reports every other known
/// request type as unsupported.
pub struct RelayPeerHandler {
    relay_url: String,
    identity: PeerIdentity,
    election: Arc<Election>,
    rng_state: AtomicU64,
}

impl RelayPeerHandler {
    pub fn new(relay_url: String, identity: PeerIdentity, election: Arc<Election>) -> Self {
        let seed = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(1) as u64 | 1;
        Self {
            relay_url,
            identity,
            election,
            rng_state: AtomicU64::new(seed),
        }
    }

    /// xorshift64: good enough for demo dice, no dependency needed.
    fn next_rand(&self) -> u64 {
        let mut x = self.rng_state.load(Ordering::Relaxed);
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng_state.store(x, Ordering::Relaxed);
        x
    }

    fn roll_die(&self, sides: u64) -> u64 {
        self.next_rand() % sides.max(1) + 1
    }

    /// Roll a `NdM+K` formula. Returns the individual dice and the total.
    fn roll_formula(&self, formula: &str) -> Option<(Vec<u64>, i64)> {
        let (dice_part, modifier) = match formula.split_once('+') {
            Some((dice, bonus)) => (dice, bonus.trim().parse::<i64>().ok()?),
            None => (formula, 0),
        };
        let (count, sides) = dice_part.trim().split_once('d')?;
        let count: u64 = if count.is_empty() { 1 } else { count.parse().ok()? };
        let sides: u64 = sides.parse().ok()?;
        if count == 0 || count > 1000 || sides == 0 {
            return None;
        }
        let rolls: Vec<u64> = (0..count).map(|_| self.roll_die(sides)).collect();
        let total = rolls.iter().sum::<u64>() as i64 + modifier;
        Some((rolls, total))
    }

    fn answer(&self, kind: RequestKind, request_id: &str, rest: &Map<String, Value>) -> WireMessage {
        match kind {
            RequestKind::Roll => {
                let formula = rest
                    .get("formula")
                    .and_then(Value::as_str)
                    .unwrap_or("1d20");
                match self.roll_formula(formula) {
                    Some((rolls, total)) => {
                        let mut payload = Map::new();
                        payload.insert("formula".to_string(), Value::String(formula.to_string()));
                        payload.insert(
                            "rolls".to_string(),
                            Value::Array(rolls.into_iter().map(Value::from).collect()),
                        );
                        payload.insert("result".to_string(), Value::from(total));
                        WireMessage::response(kind, request_id, payload)
                    }
                    None => WireMessage::error_response(
                        kind,
                        request_id,
                        &format!("Invalid roll formula: {formula}"),
                    ),
                }
            }
            other => WireMessage::error_response(
                other,
                request_id,
                &format!("Request type {} is not supported by this peer", other),
            ),
        }
    }
}

#[async_trait]
impl PeerHandler for RelayPeerHandler {
    fn url(&self) -> String {
        let mut url = match Url::parse(&self.relay_url) {
            Ok(url) => url,
            Err(_) => return self.relay_url.clone(),
        };
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("id", &self.identity.client_id);
            query.append_pair("token", &self.identity.token);
            query.append_pair("worldId", &self.identity.world_id);
            query.append_pair("worldTitle", &self.identity.world_title);
            query.append_pair("foundryVersion", &self.identity.foundry_version);
            query.append_pair("systemId", &self.identity.system_id);
            query.append_pair("systemTitle", &self.identity.system_title);
            query.append_pair("systemVersion", &self.identity.system_version);
            if let Some(name) = &self.identity.custom_name {
                query.append_pair("customName", name);
            }
        }
        url.to_string()
    }

    async fn on_message(&self, msg: &str) -> Result<Option<String>> {
        let frame: WireMessage = match serde_json::from_str(msg) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Ignoring malformed frame: {}", e);
                return Ok(None);
            }
        };

        if frame.kind == "pong" {
            return Ok(None);
        }
        let Some(request_id) = frame.request_id.as_deref() else {
            return Ok(None);
        };
        let Some(kind) = RequestKind::from_str(&frame.kind) else {
            debug!("Ignoring frame of unknown type {}", frame.kind);
            return Ok(None);
        };

        // Only the elected primary answers; the relay's waiter runs out
        // to its deadline if every peer stays silent.
        if !self.election.is_primary() {
            debug!("Not primary, leaving {} unanswered", request_id);
            return Ok(None);
        }

        let reply = self.answer(kind, request_id, &frame.rest);
        Ok(Some(serde_json::to_string(&reply)?))
    }

    async fn on_reconnect(&self) {
        info!("Peer {} registered with relay", self.identity.client_id);
    }

    async fn handle_command(&self, cmd: ControlCommand) -> Option<String> {
        match cmd {
            ControlCommand::SetRoster(roster) => {
                if self.election.set_roster(roster) {
                    info!(
                        "Primary changed, this peer {} primary",
                        if self.election.is_primary() { "is now" } else { "is no longer" }
                    );
                }
                None
            }
            ControlCommand::Shutdown => None,
        }
    }
}
