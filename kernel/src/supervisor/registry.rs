//! Worker registry: identity allocation, inboxes and the spawn tree.

use std::collections::HashMap;

use crate::mailbox::Mailbox;
use crate::message::Id;

/// Append-only record of every spawned worker.
///
/// Entries are never removed while the tree is alive, so ids stay unique
/// for the lifetime of the process.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    parents: HashMap<Id, Id>,
    inboxes: HashMap<Id, Mailbox>,
    prev_id: Id,
}

impl Registry {
    /// Allocates the next id, records its parent and creates its inbox.
    pub(crate) fn register(&mut self, parent: Id) -> (Id, Mailbox) {
        let id = self.prev_id.next();
        self.prev_id = id;
        let inbox = Mailbox::new();
        self.inboxes.insert(id, inbox.clone());
        self.parents.insert(id, parent);
        (id, inbox)
    }

    pub(crate) fn inbox(&self, id: Id) -> Option<Mailbox> {
        self.inboxes.get(&id).cloned()
    }

    pub(crate) fn parent(&self, id: Id) -> Option<Id> {
        self.parents.get(&id).copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.inboxes.len()
    }

    /// Whether `caller` may block waiting on a reply from `callee`.
    ///
    /// Unsupervised callers may always block. Workers may only block on a
    /// strict ancestor, found by walking the parent chain up to the root.
    pub(crate) fn can_block(&self, caller: Id, callee: Id) -> bool {
        if caller.is_unsupervised() {
            return true;
        }

        let mut current = caller;
        // A chain can never be longer than the number of registered workers.
        for _ in 0..=self.parents.len() {
            if current.is_supervisor() {
                return false;
            }
            let Some(parent) = self.parent(current) else {
                return false;
            };
            if parent == callee {
                return true;
            }
            current = parent;
        }
        false
    }
}
