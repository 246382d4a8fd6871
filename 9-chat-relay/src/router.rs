//! Decides where a message goes and enqueues it there.
//!
//! The router keeps no state of its own. Every call resolves destinations
//! from a fresh registry snapshot and then pushes into each destination's
//! outbound queue with [`SessionHandle::send`], which never waits. A slow or
//! dead destination therefore shows up as an entry in the returned
//! [`DeliveryReport`] and never holds up the rest of a fan-out.

use tracing::debug;

use crate::{
    error::{DeliveryError, RouteError},
    message::{Message, MessageKind, Recipient},
    protocol::ServerFrame,
    registry::Registry,
    session::{SessionHandle, fold_name},
};

/// Result of a best-effort fan-out.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failures: Vec<(String, DeliveryError)>,
}

impl DeliveryReport {
    fn single() -> Self {
        Self {
            delivered: 1,
            failures: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Clone)]
pub struct Router {
    registry: Registry,
}

impl Router {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub async fn broadcast(&self, frame: ServerFrame) -> DeliveryReport {
        self.fan_out(None, frame).await
    }

    pub async fn broadcast_except(&self, exclude: &str, frame: ServerFrame) -> DeliveryReport {
        self.fan_out(Some(&fold_name(exclude)), frame).await
    }

    pub async fn direct(&self, to: &str, frame: ServerFrame) -> Result<(), RouteError> {
        let session = self
            .registry
            .lookup(to)
            .await
            .ok_or_else(|| RouteError::NotOnline(to.to_string()))?;
        session.send(frame).map_err(|source| RouteError::Delivery {
            name: session.name().to_string(),
            source,
        })
    }

    /// Pushes the current online list to every session.
    pub async fn sync_user_list(&self) -> DeliveryReport {
        let names = self.registry.snapshot_names().await;
        let message = Message::user_list(&names);
        self.broadcast(ServerFrame::from(&message)).await
    }

    /// Dispatches `message` according to its kind.
    ///
    /// Chat requests, accepts and declines are plain direct deliveries; the
    /// server keeps no record of pending requests.
    pub async fn route(&self, message: &Message) -> Result<DeliveryReport, RouteError> {
        let kind = message.kind();
        if !kind.accepts(message.to()) {
            return Err(RouteError::InvalidRecipient { kind });
        }

        let frame = ServerFrame::from(message);
        match (kind, message.to()) {
            (MessageKind::Quit, _) => Err(RouteError::NotRoutable(kind)),
            (MessageKind::Join | MessageKind::Leave, _) => {
                Ok(self.broadcast_except(message.from(), frame).await)
            }
            (_, Recipient::User(name)) => {
                self.direct(name, frame).await?;
                Ok(DeliveryReport::single())
            }
            (_, Recipient::All) => Ok(self.broadcast(frame).await),
            (_, Recipient::Nobody) => Ok(DeliveryReport::default()),
        }
    }

    async fn fan_out(&self, exclude: Option<&str>, frame: ServerFrame) -> DeliveryReport {
        let sessions = self.registry.snapshot().await;
        let mut report = DeliveryReport::default();
        for session in sessions {
            if exclude.is_some_and(|key| session.key() == key) {
                continue;
            }
            deliver(&session, frame.clone(), &mut report);
        }
        report
    }
}

fn deliver(session: &SessionHandle, frame: ServerFrame, report: &mut DeliveryReport) {
    match session.send(frame) {
        Ok(()) => report.delivered += 1,
        Err(error) => {
            debug!(name = session.name(), %error, "failed to deliver frame");
            report.failures.push((session.name().to_string(), error));
        }
    }
}
