//! Per-client subscription sessions on top of the router.
//!
//! A client asks for one event kind (or all of them) and gets a [`Session`]
//! bound to the matching topic. The session ends when the client goes away,
//! delivery to it fails, or the router drops it for falling behind. In every
//! case its binding is removed.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

use futures::Stream;

use crate::error::StreamError;
use crate::router::{MessageRouter, Subscription, SubscriptionId};
use crate::topic::{ALL_EVENTS, APPROVAL, TRANSFER};
use crate::types::NormalizedEvent;

/// Event selection requested by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindFilter {
    Transfer,
    Approval,
    All,
}

impl KindFilter {
    /// Topic pattern the session binds to.
    pub fn pattern(self) -> &'static str {
        match self {
            Self::Transfer => TRANSFER,
            Self::Approval => APPROVAL,
            Self::All => ALL_EVENTS,
        }
    }

    /// Parse an optional request parameter. A missing value is invalid.
    pub fn from_param(param: Option<&str>) -> Result<Self, StreamError> {
        match param {
            Some(raw) => raw.parse(),
            None => Err(StreamError::InvalidFilter(
                "Missing event type parameter.".into(),
            )),
        }
    }
}

impl FromStr for KindFilter {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Transfer" => Ok(Self::Transfer),
            "Approval" => Ok(Self::Approval),
            "All" => Ok(Self::All),
            other => Err(StreamError::InvalidFilter(format!(
                "Invalid event type '{other}'. Must be 'Transfer', 'Approval', or 'All'."
            ))),
        }
    }
}

impl fmt::Display for KindFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transfer => write!(f, "Transfer"),
            Self::Approval => write!(f, "Approval"),
            Self::All => write!(f, "All"),
        }
    }
}

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client disconnected.
    ClientDisconnected,
    /// Writing to the client failed.
    TransportFailed,
    /// The router dropped the session because its queue filled up.
    Overflowed,
    /// The router went away.
    RouterClosed,
}

/// Opens sessions against a shared router.
#[derive(Clone)]
pub struct SubscriptionDispatcher {
    router: MessageRouter,
}

impl SubscriptionDispatcher {
    pub fn new(router: MessageRouter) -> Self {
        Self { router }
    }

    /// Bind a new session for `filter`.
    pub fn open(&self, filter: KindFilter) -> Result<Session, StreamError> {
        let subscription = self.router.subscribe(filter.pattern())?;
        tracing::info!(session = %subscription.id(), %filter, "session opened");
        Ok(Session {
            filter,
            subscription,
        })
    }

    /// Parse the request parameter and open a session.
    pub fn open_param(&self, param: Option<&str>) -> Result<Session, StreamError> {
        self.open(KindFilter::from_param(param)?)
    }

    /// Number of open sessions (and any other router subscriptions).
    pub fn active(&self) -> usize {
        self.router.subscriber_count()
    }
}

/// One client's subscription.
///
/// Usable as a [`Stream`] of events, or driven to completion with
/// [`Session::pump`]. Dropping it removes the binding.
#[derive(Debug)]
pub struct Session {
    filter: KindFilter,
    subscription: Subscription,
}

impl Session {
    pub fn id(&self) -> SubscriptionId {
        self.subscription.id()
    }

    pub fn filter(&self) -> KindFilter {
        self.filter
    }

    /// Wait for the next event.
    pub async fn recv(&mut self) -> Option<NormalizedEvent> {
        self.subscription.recv().await
    }

    /// Deliver events through `deliver` until the client disconnects, a
    /// delivery fails, or the router ends the subscription.
    pub async fn pump<D, F, E>(mut self, disconnected: D, mut deliver: F) -> SessionEnd
    where
        D: Future<Output = ()>,
        F: FnMut(&NormalizedEvent) -> Result<(), E>,
        E: fmt::Display,
    {
        tokio::pin!(disconnected);
        let end = loop {
            tokio::select! {
                biased;
                _ = &mut disconnected => break SessionEnd::ClientDisconnected,
                next = self.subscription.recv() => match next {
                    Some(event) => {
                        if let Err(e) = deliver(&event) {
                            tracing::warn!(session = %self.subscription.id(), error = %e, "delivery failed");
                            break SessionEnd::TransportFailed;
                        }
                    }
                    None if self.subscription.overflowed() => break SessionEnd::Overflowed,
                    None => break SessionEnd::RouterClosed,
                },
            }
        };
        tracing::info!(session = %self.subscription.id(), filter = %self.filter, end = ?end, "session ended");
        self.close();
        end
    }

    /// Remove the binding and discard anything buffered.
    pub fn close(mut self) {
        self.subscription.close();
    }
}

impl Stream for Session {
    type Item = NormalizedEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.subscription).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventFields, EventKind};
    use futures::StreamExt;
    use tokio::sync::oneshot;

    fn transfer(position: u64) -> NormalizedEvent {
        NormalizedEvent {
            kind: EventKind::Transfer,
            position,
            sequence_hint: format!("0xaa:{position:010}"),
            fields: EventFields::Transfer {
                from: "0x1".into(),
                to: "0x2".into(),
                amount: "5".into(),
            },
        }
    }

    fn approval(position: u64) -> NormalizedEvent {
        NormalizedEvent {
            kind: EventKind::Approval,
            position,
            sequence_hint: format!("0xbb:{position:010}"),
            fields: EventFields::Approval {
                owner: "0x1".into(),
                spender: "0x2".into(),
                amount: "5".into(),
            },
        }
    }

    #[test]
    fn filter_parsing() {
        assert_eq!("Transfer".parse::<KindFilter>().unwrap(), KindFilter::Transfer);
        assert_eq!("All".parse::<KindFilter>().unwrap().pattern(), "event.*");
        assert!(matches!(
            "transfer".parse::<KindFilter>(),
            Err(StreamError::InvalidFilter(_))
        ));
        assert!(KindFilter::from_param(None).is_err());
    }

    #[test]
    fn open_param_rejects_without_binding() {
        let router = MessageRouter::new(4);
        let dispatcher = SubscriptionDispatcher::new(router);

        let missing = dispatcher.open_param(None).unwrap_err();
        assert_eq!(missing.to_string(), "Missing event type parameter.");
        assert!(matches!(
            dispatcher.open_param(Some("Swap")),
            Err(StreamError::InvalidFilter(msg)) if msg.contains("'Swap'")
        ));
        assert_eq!(dispatcher.active(), 0);

        let session = dispatcher.open_param(Some("Approval")).unwrap();
        assert_eq!(Session::filter(&session), KindFilter::Approval);
        assert_eq!(dispatcher.active(), 1);
    }

    #[tokio::test]
    async fn approval_session_sees_only_approvals() {
        let router = MessageRouter::new(16);
        let dispatcher = SubscriptionDispatcher::new(router.clone());
        let mut session = dispatcher.open(KindFilter::Approval).unwrap();

        router.publish_event(&transfer(1));
        router.publish_event(&approval(2));

        let got = session.recv().await.unwrap();
        assert_eq!(got.kind, EventKind::Approval);
        assert_eq!(got.position, 2);
    }

    #[tokio::test]
    async fn all_session_sees_both_kinds_in_order() {
        let router = MessageRouter::new(16);
        let dispatcher = SubscriptionDispatcher::new(router.clone());
        let session = dispatcher.open(KindFilter::All).unwrap();

        router.publish_event(&transfer(1));
        router.publish_event(&approval(1));

        let got: Vec<_> = session.take(2).collect().await;
        assert_eq!(got[0].kind, EventKind::Transfer);
        assert_eq!(got[1].kind, EventKind::Approval);
    }

    #[tokio::test]
    async fn pump_stops_on_disconnect_and_unbinds() {
        let router = MessageRouter::new(16);
        let dispatcher = SubscriptionDispatcher::new(router.clone());
        let session = dispatcher.open(KindFilter::Transfer).unwrap();
        assert_eq!(dispatcher.active(), 1);

        router.publish_event(&transfer(7));
        let (tx, rx) = oneshot::channel::<()>();
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();

        let pump = tokio::spawn(session.pump(
            async move {
                let _ = rx.await;
            },
            move |e| seen_tx.send(e.position).map_err(|err| err.to_string()),
        ));

        assert_eq!(seen_rx.recv().await, Some(7));
        tx.send(()).unwrap();
        let end = pump.await.unwrap();

        assert_eq!(end, SessionEnd::ClientDisconnected);
        assert_eq!(dispatcher.active(), 0);
        assert_eq!(router.publish_event(&transfer(8)), 0);
    }

    #[tokio::test]
    async fn pump_stops_on_transport_failure() {
        let router = MessageRouter::new(16);
        let dispatcher = SubscriptionDispatcher::new(router.clone());
        let session = dispatcher.open(KindFilter::All).unwrap();

        router.publish_event(&transfer(1));
        let end = session
            .pump(futures::future::pending(), |_| Err("broken pipe"))
            .await;

        assert_eq!(end, SessionEnd::TransportFailed);
        assert_eq!(dispatcher.active(), 0);
    }

    #[tokio::test]
    async fn pump_reports_overflow() {
        let router = MessageRouter::new(1);
        let dispatcher = SubscriptionDispatcher::new(router.clone());
        let session = dispatcher.open(KindFilter::Transfer).unwrap();

        router.publish_event(&transfer(1));
        router.publish_event(&transfer(2));

        let mut seen = Vec::new();
        let end = session
            .pump(futures::future::pending(), |e| {
                seen.push(e.position);
                Ok::<_, String>(())
            })
            .await;

        assert_eq!(end, SessionEnd::Overflowed);
        assert_eq!(seen, vec![1]);
    }

    #[tokio::test]
    async fn closed_session_receives_nothing() {
        let router = MessageRouter::new(16);
        let dispatcher = SubscriptionDispatcher::new(router.clone());
        let session = dispatcher.open(KindFilter::All).unwrap();
        session.close();

        assert_eq!(router.publish_event(&transfer(1)), 0);
        assert_eq!(dispatcher.active(), 0);
    }
}
