//! Message router
//!
//! Dispatch table keyed by [`MessageKind`]. Every handler registered for a kind
//! runs, in registration order, for each inbound envelope of that kind. A
//! handler that fails or panics is logged and skipped; the others still run.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

use tracing::{error, warn};

use crate::error::Error;
use crate::model::client::ClientId;
use crate::model::envelope::{Envelope, MessageKind};

/// A handler gets the shared context it was registered against plus the envelope.
pub type Handler<C> = Box<dyn FnMut(&mut C, &Envelope) -> Result<(), Error> + Send>;

/// Returned by registration; pass to [`Router::remove_handler`] to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Entry<C> {
    id: HandlerId,
    scope: Option<ClientId>,
    handler: Handler<C>,
}

pub struct Router<C> {
    table: HashMap<MessageKind, Vec<Entry<C>>>,
    next_id: u64,
}

impl<C> Default for Router<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Router<C> {
    pub fn new() -> Self {
        Self {
            table: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn add_handler<F>(&mut self, kind: MessageKind, handler: F) -> HandlerId
    where
        F: FnMut(&mut C, &Envelope) -> Result<(), Error> + Send + 'static,
    {
        self.insert(kind, None, Box::new(handler))
    }

    /// Like [`Router::add_handler`], but only fires for envelopes sent by `from`.
    pub fn add_scoped_handler<F>(&mut self, kind: MessageKind, from: ClientId, handler: F) -> HandlerId
    where
        F: FnMut(&mut C, &Envelope) -> Result<(), Error> + Send + 'static,
    {
        self.insert(kind, Some(from), Box::new(handler))
    }

    fn insert(&mut self, kind: MessageKind, scope: Option<ClientId>, handler: Handler<C>) -> HandlerId {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        self.table.entry(kind).or_default().push(Entry { id, scope, handler });
        id
    }

    /// Returns whether a handler was registered under `id`.
    pub fn remove_handler(&mut self, id: HandlerId) -> bool {
        for entries in self.table.values_mut() {
            if let Some(pos) = entries.iter().position(|e| e.id == id) {
                entries.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn handler_count(&self, kind: MessageKind) -> usize {
        self.table.get(&kind).map_or(0, Vec::len)
    }

    /// Run every matching handler for `envelope`, returning how many ran.
    pub fn dispatch(&mut self, ctx: &mut C, envelope: &Envelope) -> usize {
        let kind = envelope.kind();
        let Some(entries) = self.table.get_mut(&kind) else {
            return 0;
        };

        let mut invoked = 0;
        for entry in entries.iter_mut() {
            if entry.scope.as_ref().is_some_and(|s| *s != envelope.from) {
                continue;
            }
            invoked += 1;

            let handler = &mut entry.handler;
            match panic::catch_unwind(AssertUnwindSafe(|| handler(ctx, envelope))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("{} handler from {} failed: {}", kind, envelope.from, e),
                Err(_) => error!("{} handler from {} panicked", kind, envelope.from),
            }
        }

        invoked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use crate::model::envelope::{SdpPayload, Signal};

    fn envelope(kind: MessageKind, from: &str) -> Envelope {
        let payload = SdpPayload { sdp: "x".into() };
        let signal = match kind {
            MessageKind::Offer => Signal::Offer(payload),
            MessageKind::Answer => Signal::Answer(payload),
            MessageKind::NewIceCandidate => Signal::candidate(crate::model::sdp::IceCandidate::new("c")),
        };
        Envelope::new(
            ClientId::new("me").unwrap(),
            ClientId::new(from).unwrap(),
            signal,
        )
    }

    #[test]
    fn dispatches_in_registration_order_and_by_kind() {
        let mut router: Router<Vec<&'static str>> = Router::new();
        router.add_handler(MessageKind::Offer, |log, _| {
            log.push("h1");
            Ok(())
        });
        router.add_handler(MessageKind::Offer, |log, _| {
            log.push("h2");
            Ok(())
        });
        router.add_handler(MessageKind::Answer, |log, _| {
            log.push("h3");
            Ok(())
        });

        let mut log = Vec::new();
        let invoked = router.dispatch(&mut log, &envelope(MessageKind::Offer, "a"));

        assert_eq!(invoked, 2);
        assert_eq!(log, vec!["h1", "h2"]);
    }

    #[test]
    fn failing_and_panicking_handlers_do_not_stop_others() {
        let mut router: Router<Vec<&'static str>> = Router::new();
        router.add_handler(MessageKind::Offer, |_, env| {
            Err(ProtocolError::Unexpected {
                kind: "offer",
                from: env.from.clone(),
                reason: "test".into(),
            }
            .into())
        });
        router.add_handler(MessageKind::Offer, |_, _| panic!("boom"));
        router.add_handler(MessageKind::Offer, |log, _| {
            log.push("last");
            Ok(())
        });

        let mut log = Vec::new();
        assert_eq!(router.dispatch(&mut log, &envelope(MessageKind::Offer, "a")), 3);
        assert_eq!(log, vec!["last"]);
    }

    #[test]
    fn scoped_handlers_only_see_their_sender() {
        let mut router: Router<Vec<String>> = Router::new();
        router.add_scoped_handler(MessageKind::Answer, ClientId::new("222").unwrap(), |log, env| {
            log.push(env.from.to_string());
            Ok(())
        });

        let mut log = Vec::new();
        assert_eq!(router.dispatch(&mut log, &envelope(MessageKind::Answer, "333")), 0);
        assert_eq!(router.dispatch(&mut log, &envelope(MessageKind::Answer, "222")), 1);
        assert_eq!(log, vec!["222".to_string()]);
    }

    #[test]
    fn removed_handlers_stop_firing() {
        let mut router: Router<u32> = Router::new();
        let id = router.add_handler(MessageKind::NewIceCandidate, |n, _| {
            *n += 1;
            Ok(())
        });

        let mut count = 0;
        router.dispatch(&mut count, &envelope(MessageKind::NewIceCandidate, "a"));
        assert!(router.remove_handler(id));
        assert!(!router.remove_handler(id));
        router.dispatch(&mut count, &envelope(MessageKind::NewIceCandidate, "a"));

        assert_eq!(count, 1);
        assert_eq!(router.handler_count(MessageKind::NewIceCandidate), 0);
    }
}
