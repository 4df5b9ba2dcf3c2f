//! Handing signed events to public relays
//!
//! Two named policies replace the usual "send and sleep a bit" approach.
//! [`PublishPolicy::BestEffort`] returns once every reachable relay has the
//! event on the wire, without waiting for a verdict.
//! [`PublishPolicy::Acknowledged`] also waits for relays to confirm with `OK`.

use std::sync::Arc;

use nostr::{ClientMessage, Event, RelayMessage, RelayUrl};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::link::{dial_before, RelayDialer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishPolicy {
    /// Write to every relay and return without waiting for `OK`.
    BestEffort,
    /// Wait until at least `min_acks` relays answer `OK true`, or the deadline.
    Acknowledged { min_acks: usize },
}

/// Per-relay outcome of one publication.
///
/// For [`PublishPolicy::BestEffort`] only `dispatched` and `unreachable`
/// are filled in.
#[derive(Debug, Clone, Default)]
pub struct PublishReport {
    /// Relays the event was written to
    pub dispatched: usize,
    pub accepted: Vec<RelayUrl>,
    pub rejected: Vec<(RelayUrl, String)>,
    pub unreachable: Vec<(RelayUrl, String)>,
    /// Took the event but did not answer before the deadline
    pub unconfirmed: Vec<RelayUrl>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PublishError {
    #[error("no relays to publish to")]
    NoRelays,
    #[error("no relay could be reached")]
    Unreachable(PublishReport),
    #[error("only {accepted} of {required} required relays accepted the event")]
    NotEnoughAcks {
        accepted: usize,
        required: usize,
        report: PublishReport,
    },
}

#[derive(Debug)]
enum Delivery {
    /// Written, verdict not awaited
    Sent,
    Accepted,
    Rejected(String),
    Unreachable(String),
    Unconfirmed,
}

impl PublishReport {
    fn record(&mut self, relay: RelayUrl, delivery: Delivery) {
        if !matches!(delivery, Delivery::Unreachable(_)) {
            self.dispatched += 1;
        }
        match delivery {
            Delivery::Sent => {}
            Delivery::Accepted => self.accepted.push(relay),
            Delivery::Rejected(reason) => self.rejected.push((relay, reason)),
            Delivery::Unreachable(reason) => self.unreachable.push((relay, reason)),
            Delivery::Unconfirmed => self.unconfirmed.push(relay),
        }
    }
}

pub struct Publisher {
    dialer: Arc<dyn RelayDialer>,
}

impl Publisher {
    pub fn new(dialer: Arc<dyn RelayDialer>) -> Self {
        Self { dialer }
    }

    /// Send `event` to every relay in `relays` under `policy`.
    ///
    /// Each relay gets its own short-lived link. Nothing outlives `deadline`
    /// except, under [`PublishPolicy::Acknowledged`], the links of relays
    /// that had not answered when enough others already had.
    pub async fn publish(
        &self,
        event: &Event,
        relays: &[RelayUrl],
        policy: PublishPolicy,
        deadline: Instant,
    ) -> Result<PublishReport, PublishError> {
        if relays.is_empty() {
            return Err(PublishError::NoRelays);
        }
        let await_verdict = matches!(policy, PublishPolicy::Acknowledged { .. });

        let mut deliveries = JoinSet::new();
        for relay in relays {
            let dialer = Arc::clone(&self.dialer);
            let event = event.clone();
            let relay = relay.clone();
            deliveries.spawn(async move {
                let delivery =
                    deliver(dialer.as_ref(), &relay, &event, await_verdict, deadline).await;
                debug!(relay = %relay, event_id = %event.id, outcome = ?delivery, "Publish finished");
                (relay, delivery)
            });
        }

        let required = match policy {
            PublishPolicy::BestEffort => None,
            PublishPolicy::Acknowledged { min_acks } => Some(min_acks.max(1)),
        };

        let mut report = PublishReport::default();
        while let Some(joined) = deliveries.join_next().await {
            match joined {
                Ok((relay, delivery)) => report.record(relay, delivery),
                Err(e) => warn!(error = %e, "Publish task failed"),
            }
            if required.is_some_and(|required| report.accepted.len() >= required) {
                // Stragglers keep running and close their own links.
                deliveries.detach_all();
                break;
            }
        }

        let Some(required) = required else {
            if report.dispatched == 0 {
                warn!(event_id = %event.id, "No relay took the event");
                return Err(PublishError::Unreachable(report));
            }
            info!(event_id = %event.id, relays = report.dispatched, "Event sent (best effort)");
            return Ok(report);
        };

        let accepted = report.accepted.len();
        if accepted < required {
            warn!(event_id = %event.id, accepted, required, "Event not acknowledged by enough relays");
            return Err(PublishError::NotEnoughAcks {
                accepted,
                required,
                report,
            });
        }

        info!(event_id = %event.id, accepted, "Event published");
        Ok(report)
    }
}

async fn deliver(
    dialer: &dyn RelayDialer,
    relay: &RelayUrl,
    event: &Event,
    await_verdict: bool,
    deadline: Instant,
) -> Delivery {
    let link = match dial_before(dialer, relay, deadline).await {
        Ok(link) => link,
        Err(e) => return Delivery::Unreachable(e.to_string()),
    };
    let Some(mut messages) = link.messages() else {
        return Delivery::Unreachable("inbound stream unavailable".into());
    };
    if let Err(e) = link.send(&ClientMessage::event(event.clone())).await {
        return Delivery::Unreachable(e.to_string());
    }

    if !await_verdict {
        link.finish(deadline).await;
        return Delivery::Sent;
    }

    let verdict = async {
        while let Some(message) = messages.next().await {
            if let RelayMessage::Ok {
                event_id,
                status,
                message,
            } = message
            {
                if event_id == event.id {
                    return if status {
                        Delivery::Accepted
                    } else {
                        Delivery::Rejected(message.into_owned())
                    };
                }
            }
        }
        Delivery::Unreachable("relay closed the connection".into())
    };

    let delivery = tokio::time::timeout_at(deadline, verdict)
        .await
        .unwrap_or(Delivery::Unconfirmed);
    link.close();
    delivery
}
