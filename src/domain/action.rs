//! Action list management.
//!
//! An [`Action`] is one cryptographic operation bound to the envelope; the
//! [`ActionList`] keeps them kind-grouped (all Hash actions contiguous, all
//! KeyExchange actions contiguous, and so on) so `find` can return the start
//! of a kind-homogeneous run. Associations between actions are id-based weak
//! references, never aliasing pointers, so the backing storage is free to
//! reallocate.

use crate::crypto::CryptoHandle;
use crate::domain::types::{ActionId, SizeHint};
use crate::infra::error::{EnvelopeError, EnvelopeResult};

/// Kind of cryptographic operation an action performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// Public-key based key exchange (one per recipient).
    KeyExchangePkc,
    /// Conventional (password / shared key) key exchange.
    KeyExchangeConventional,
    /// Content encryption with the session key.
    Encrypt,
    /// Payload hashing.
    Hash,
    /// Signature over a hash action's digest.
    Sign,
}

impl ActionKind {
    /// Grouping rank; the list keeps runs ordered by this so find can stop
    /// at the first match of a later rank.
    fn rank(self) -> u8 {
        match self {
            ActionKind::KeyExchangePkc => 0,
            ActionKind::KeyExchangeConventional => 1,
            ActionKind::Encrypt => 2,
            ActionKind::Hash => 3,
            ActionKind::Sign => 4,
        }
    }

    /// Whether an action of this kind requires a controller (an associated
    /// action pointing at it) before the envelope may commit.
    fn needs_controller_by_default(self) -> bool {
        matches!(self, ActionKind::Hash | ActionKind::Encrypt)
    }
}

/// One cryptographic operation bound to the envelope.
pub struct Action {
    pub kind: ActionKind,
    pub handle: CryptoHandle,
    /// Weak back-reference to the action this one depends on: a Sign
    /// action's hash, a KeyExchange action's session-key Encrypt action.
    pub associated: Option<ActionId>,
    /// True until this action is paired with its controller. An action still
    /// needing a controller at commit time is an orphan.
    pub needs_controller: bool,
    /// Cached wire-encoding size, computed once inputs are final. `Unknown`
    /// forces indefinite-length encoding for the enclosing structure.
    pub encoded_size: SizeHint,
    /// Set once this action's wire component has been emitted.
    pub emitted: bool,
}

/// Kind-grouped list of actions. Actions are never removed, so every
/// `ActionId` handed out stays valid for the life of the list.
#[derive(Default)]
pub struct ActionList {
    actions: Vec<Action>,
    /// Emission order, kept grouped by kind rank.
    order: Vec<ActionId>,
}

impl ActionList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Append an action at the tail of its kind's run (creating the run if
    /// this is the first action of its kind).
    pub fn add(&mut self, kind: ActionKind, handle: CryptoHandle) -> ActionId {
        let id = ActionId(self.actions.len());
        self.actions.push(Action {
            kind,
            handle,
            associated: None,
            needs_controller: kind.needs_controller_by_default(),
            encoded_size: SizeHint::Unknown,
            emitted: false,
        });
        let insert_at = self
            .order
            .iter()
            .position(|other| self.actions[other.0].kind.rank() > kind.rank())
            .unwrap_or(self.order.len());
        self.order.insert(insert_at, id);
        id
    }

    /// First action of the given kind, walking the kind-homogeneous run.
    pub fn find(&self, kind: ActionKind) -> Option<ActionId> {
        self.order
            .iter()
            .copied()
            .find(|id| self.actions[id.0].kind == kind)
    }

    /// All actions of one kind, in emission order.
    pub fn of_kind(&self, kind: ActionKind) -> Vec<ActionId> {
        self.order
            .iter()
            .copied()
            .filter(|id| self.actions[id.0].kind == kind)
            .collect()
    }

    /// Iterate all ids in emission order.
    pub fn ids(&self) -> impl Iterator<Item = ActionId> + '_ {
        self.order.iter().copied()
    }

    pub fn get(&self, id: ActionId) -> &Action {
        &self.actions[id.0]
    }

    pub fn get_mut(&mut self, id: ActionId) -> &mut Action {
        &mut self.actions[id.0]
    }

    /// Record that `child` depends on `parent`: the child keeps a weak
    /// back-reference and the parent no longer needs a controller.
    pub fn link(&mut self, parent: ActionId, child: ActionId) {
        self.actions[child.0].associated = Some(parent);
        self.actions[parent.0].needs_controller = false;
    }

    /// Mark an action as self-controlled (e.g. a lone hash in a
    /// DigestedData envelope, or a session key supplied directly).
    pub fn clear_controller_requirement(&mut self, id: ActionId) {
        self.actions[id.0].needs_controller = false;
    }

    /// Commit-time validation: every action must have found its controller.
    pub fn validate(&self) -> EnvelopeResult<()> {
        for id in &self.order {
            let action = &self.actions[id.0];
            if action.needs_controller {
                return Err(EnvelopeError::Orphan(format!(
                    "{:?} {} was never paired with a controlling action",
                    action.kind, id
                )));
            }
        }
        Ok(())
    }
}
