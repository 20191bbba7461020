// Address -> handler registry with round-robin selection
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::message::Message;

/// Identifies one registration. Ids grow monotonically with registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub enum Endpoint {
    Mailbox(mpsc::UnboundedSender<Message>),
    Reply,
}

/// Which registrations a lookup may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Local,
    /// Frames arriving from a remote peer: local-only registrations are hidden.
    Remote,
}

#[derive(Debug)]
pub struct Registration {
    id: HandlerId,
    address: String,
    local_only: bool,
    timeout: Option<Duration>,
    identity: Option<usize>,
    endpoint: Endpoint,
}

impl Registration {
    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_local_only(&self) -> bool {
        self.local_only
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn visible(&self, visibility: Visibility) -> bool {
        visibility == Visibility::Local || !self.local_only
    }
}

#[derive(Debug, Default)]
struct AddressEntry {
    handlers: Vec<Arc<Registration>>,
    cursor: usize,
}

#[derive(Debug, Default)]
pub struct Registry {
    entries: DashMap<String, AddressEntry>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a registration. `identity` names the handler instance behind it;
    /// registering the same identity twice on one address returns the
    /// existing entry and `false`.
    pub fn register(
        &self,
        address: &str,
        endpoint: Endpoint,
        identity: Option<usize>,
        local_only: bool,
        timeout: Option<Duration>,
    ) -> (Arc<Registration>, bool) {
        let mut entry = self.entries.entry(address.to_string()).or_default();
        if let Some(identity) = identity {
            if let Some(existing) = entry
                .handlers
                .iter()
                .find(|r| r.identity == Some(identity))
            {
                return (Arc::clone(existing), false);
            }
        }
        let registration = Arc::new(Registration {
            id: HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1),
            address: address.to_string(),
            local_only,
            timeout,
            identity,
            endpoint,
        });
        entry.handlers.push(Arc::clone(&registration));
        (registration, true)
    }

    /// Removes the registration `id` from `address`; `None` if it was not there.
    pub fn unregister(&self, address: &str, id: HandlerId) -> Option<Arc<Registration>> {
        let removed = {
            let mut entry = self.entries.get_mut(address)?;
            let pos = entry.handlers.iter().position(|r| r.id == id)?;
            let removed = entry.handlers.remove(pos);
            // Keep the cursor on the entry that would have been selected next.
            if pos < entry.cursor {
                entry.cursor -= 1;
            }
            if entry.cursor >= entry.handlers.len() {
                entry.cursor = 0;
            }
            removed
        };
        self.entries.remove_if(address, |_, e| e.handlers.is_empty());
        Some(removed)
    }

    pub fn handlers_for(&self, address: &str) -> Vec<Arc<Registration>> {
        self.entries
            .get(address)
            .map(|e| e.handlers.clone())
            .unwrap_or_default()
    }

    pub fn visible_handlers(&self, address: &str, visibility: Visibility) -> Vec<Arc<Registration>> {
        self.entries
            .get(address)
            .map(|e| {
                e.handlers
                    .iter()
                    .filter(|r| r.visible(visibility))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Round-robin selection for point-to-point delivery. Entries hidden by
    /// `visibility` are skipped; the cursor advances past the chosen entry.
    pub fn next_for_send(&self, address: &str, visibility: Visibility) -> Option<Arc<Registration>> {
        let mut entry = self.entries.get_mut(address)?;
        let n = entry.handlers.len();
        for step in 0..n {
            let idx = (entry.cursor + step) % n;
            if entry.handlers[idx].visible(visibility) {
                let chosen = Arc::clone(&entry.handlers[idx]);
                entry.cursor = (idx + 1) % n;
                return Some(chosen);
            }
        }
        None
    }

    /// Whether a remote peer could be routed to `address` on this node.
    pub fn has_cluster_visible(&self, address: &str) -> bool {
        self.entries
            .get(address)
            .map(|e| e.handlers.iter().any(|r| !r.local_only))
            .unwrap_or(false)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.entries.contains_key(address)
    }

    pub fn addresses(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.iter().map(|e| e.handlers.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) -> usize {
        let n = self.len();
        self.entries.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mailbox() -> Endpoint {
        let (tx, _rx) = mpsc::unbounded_channel();
        Endpoint::Mailbox(tx)
    }

    fn ids(regs: &[Arc<Registration>]) -> Vec<HandlerId> {
        regs.iter().map(|r| r.id()).collect()
    }

    #[test]
    fn handlers_for_unknown_address_is_empty() {
        let reg = Registry::new();
        assert!(reg.handlers_for("nowhere").is_empty());
        assert!(reg.next_for_send("nowhere", Visibility::Local).is_none());
    }

    #[test]
    fn same_identity_registers_once() {
        let reg = Registry::new();
        let (a, created_a) = reg.register("addr", mailbox(), Some(7), false, None);
        let (b, created_b) = reg.register("addr", mailbox(), Some(7), false, None);
        assert!(created_a);
        assert!(!created_b);
        assert_eq!(a.id(), b.id());
        assert_eq!(reg.len(), 1);

        let (_, other_address) = reg.register("other", mailbox(), Some(7), false, None);
        assert!(other_address);
    }

    #[test]
    fn unregister_removes_exact_pairing_and_drops_empty_address() {
        let reg = Registry::new();
        let (a, _) = reg.register("addr", mailbox(), Some(1), false, None);
        let (b, _) = reg.register("addr", mailbox(), Some(2), false, None);

        assert!(reg.unregister("other", a.id()).is_none());
        assert_eq!(reg.unregister("addr", a.id()).map(|r| r.id()), Some(a.id()));
        assert!(reg.unregister("addr", a.id()).is_none());
        assert_eq!(ids(&reg.handlers_for("addr")), vec![b.id()]);

        reg.unregister("addr", b.id());
        assert!(!reg.contains("addr"));
        assert!(reg.is_empty());
    }

    #[test]
    fn round_robin_cycles_in_registration_order() {
        let reg = Registry::new();
        let regs: Vec<_> = (0..3)
            .map(|i| reg.register("rr", mailbox(), Some(i), false, None).0)
            .collect();
        let picked: Vec<_> = (0..7)
            .map(|_| reg.next_for_send("rr", Visibility::Local).unwrap().id())
            .collect();
        let expected: Vec<_> = (0..7).map(|i| regs[i % 3].id()).collect();
        assert_eq!(picked, expected);
    }

    #[test]
    fn removal_keeps_rotation_fair() {
        let reg = Registry::new();
        let regs: Vec<_> = (0..3)
            .map(|i| reg.register("rr", mailbox(), Some(i), false, None).0)
            .collect();
        reg.next_for_send("rr", Visibility::Local);
        reg.next_for_send("rr", Visibility::Local);
        // cursor is on regs[2]; removing regs[0] must not make it skip ahead
        reg.unregister("rr", regs[0].id());

        let next = reg.next_for_send("rr", Visibility::Local).unwrap();
        assert_eq!(next.id(), regs[2].id());
        let next = reg.next_for_send("rr", Visibility::Local).unwrap();
        assert_eq!(next.id(), regs[1].id());
    }

    #[test]
    fn remote_lookups_skip_local_only() {
        let reg = Registry::new();
        let (local, _) = reg.register("mixed", mailbox(), Some(1), true, None);
        let (shared, _) = reg.register("mixed", mailbox(), Some(2), false, None);

        for _ in 0..4 {
            let picked = reg.next_for_send("mixed", Visibility::Remote).unwrap();
            assert_eq!(picked.id(), shared.id());
        }
        assert_eq!(ids(&reg.visible_handlers("mixed", Visibility::Remote)), vec![shared.id()]);
        assert_eq!(
            ids(&reg.visible_handlers("mixed", Visibility::Local)),
            vec![local.id(), shared.id()]
        );
        assert!(reg.has_cluster_visible("mixed"));

        let reg = Registry::new();
        reg.register("hidden", mailbox(), Some(1), true, None);
        assert!(!reg.has_cluster_visible("hidden"));
        assert!(reg.next_for_send("hidden", Visibility::Remote).is_none());
    }
}
