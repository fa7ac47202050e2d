//! Derives board notifications from consecutive session views and fans
//! them out to subscribed handlers.

use std::collections::BTreeMap;

use boardsync_core::{BoardEvent, EventKind, Side, Snapshot, SessionView};

/// Handle returned by [`EventNotifier::on`]; pass it back to `off`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

/// Handlers run while the session is locked. They must not call back into
/// the session that invoked them.
pub type EventHandler = Box<dyn FnMut(&SessionView, &BoardEvent) + Send>;

pub struct EventNotifier {
    // Ids grow monotonically, so map order is registration order.
    handlers: BTreeMap<EventKind, BTreeMap<HandlerId, EventHandler>>,
    next_handler: u64,
    last_snapshot: Snapshot,
    last_turn: Side,
}

impl EventNotifier {
    /// Start from the given view. Nothing is emitted for the initial state.
    pub fn seeded(view: &SessionView) -> Self {
        Self {
            handlers: BTreeMap::new(),
            next_handler: 0,
            last_snapshot: view.snapshot.clone(),
            last_turn: view.turn,
        }
    }

    pub fn on<F>(&mut self, kind: EventKind, handler: F) -> HandlerId
    where
        F: FnMut(&SessionView, &BoardEvent) + Send + 'static,
    {
        let id = HandlerId(self.next_handler);
        self.next_handler += 1;
        let _ = self
            .handlers
            .entry(kind)
            .or_default()
            .insert(id, Box::new(handler));
        id
    }

    /// Remove a handler. Returns false if it was not registered for `kind`.
    pub fn off(&mut self, kind: EventKind, id: HandlerId) -> bool {
        let Some(list) = self.handlers.get_mut(&kind) else {
            return false;
        };
        let removed = list.remove(&id).is_some();
        if list.is_empty() {
            let _ = self.handlers.remove(&kind);
        }
        removed
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map_or(0, BTreeMap::len)
    }

    /// Deliver one event to every handler of its kind, in registration order.
    pub fn emit(&mut self, view: &SessionView, event: &BoardEvent) {
        if let Some(list) = self.handlers.get_mut(&event.kind()) {
            for handler in list.values_mut() {
                handler(view, event);
            }
        }
    }

    /// Diff `view` against the last observed state and emit what changed:
    /// `board_update` if the snapshot moved, then `game_over` whenever the
    /// game is terminal, otherwise a turn event if the mover changed.
    ///
    /// The mover is not tracked while terminal, so leaving the terminal
    /// state only announces a side that differs from the last one announced.
    pub fn on_state_changed(&mut self, view: &SessionView) -> Vec<BoardEvent> {
        let mut emitted = Vec::new();

        if view.snapshot != self.last_snapshot {
            self.last_snapshot = view.snapshot.clone();
            emitted.push(BoardEvent::BoardUpdate);
        }

        if view.game_over {
            emitted.push(BoardEvent::GameOver);
        } else if view.turn != self.last_turn {
            self.last_turn = view.turn;
            emitted.push(BoardEvent::TurnChanged { side: view.turn });
        }

        for event in &emitted {
            self.emit(view, event);
        }
        emitted
    }
}

impl std::fmt::Debug for EventNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: BTreeMap<_, _> = self
            .handlers
            .iter()
            .map(|(kind, list)| (kind.as_str(), list.len()))
            .collect();
        f.debug_struct("EventNotifier")
            .field("handlers", &counts)
            .field("last_turn", &self.last_turn)
            .finish_non_exhaustive()
    }
}
