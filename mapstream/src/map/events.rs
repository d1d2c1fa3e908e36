//! Typed events and a subscription registry

use super::options::OptionKey;
use super::tile::TileKey;
use super::MapId;

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    MapAdded(MapId),
    MapRemoved(MapId),
    Cleared,
    ZIndicesChanged(Vec<MapId>),
    VisibilityChanged(Vec<MapId>),
    /// Fired before option changes are applied
    PrepareChange { map_ids: Vec<MapId>, keys: Vec<OptionKey> },
    ImmediateChange { map_ids: Vec<MapId>, keys: Vec<OptionKey> },
    AnimatedChange { map_ids: Vec<MapId>, keys: Vec<OptionKey> },
    TileLoaded(TileKey),
    TileError { key: TileKey, message: String },
    TileRemoved(TileKey),
    FirstTileLoadedForMap(MapId),
    AllRequestedTilesLoadedForMap(MapId),
    MapEnteredViewport(MapId),
    MapLeftViewport(MapId),
    ImageInfoNeeded(MapId),
    ImageInfoLoaded(MapId),
    ImageInfoError { map_id: MapId, message: String },
}

/// Discriminant used to filter subscriptions
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum EventKind {
    MapAdded,
    MapRemoved,
    Cleared,
    ZIndicesChanged,
    VisibilityChanged,
    PrepareChange,
    ImmediateChange,
    AnimatedChange,
    TileLoaded,
    TileError,
    TileRemoved,
    FirstTileLoadedForMap,
    AllRequestedTilesLoadedForMap,
    MapEnteredViewport,
    MapLeftViewport,
    ImageInfoNeeded,
    ImageInfoLoaded,
    ImageInfoError,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::MapAdded(_) => EventKind::MapAdded,
            Event::MapRemoved(_) => EventKind::MapRemoved,
            Event::Cleared => EventKind::Cleared,
            Event::ZIndicesChanged(_) => EventKind::ZIndicesChanged,
            Event::VisibilityChanged(_) => EventKind::VisibilityChanged,
            Event::PrepareChange { .. } => EventKind::PrepareChange,
            Event::ImmediateChange { .. } => EventKind::ImmediateChange,
            Event::AnimatedChange { .. } => EventKind::AnimatedChange,
            Event::TileLoaded(_) => EventKind::TileLoaded,
            Event::TileError { .. } => EventKind::TileError,
            Event::TileRemoved(_) => EventKind::TileRemoved,
            Event::FirstTileLoadedForMap(_) => EventKind::FirstTileLoadedForMap,
            Event::AllRequestedTilesLoadedForMap(_) => EventKind::AllRequestedTilesLoadedForMap,
            Event::MapEnteredViewport(_) => EventKind::MapEnteredViewport,
            Event::MapLeftViewport(_) => EventKind::MapLeftViewport,
            Event::ImageInfoNeeded(_) => EventKind::ImageInfoNeeded,
            Event::ImageInfoLoaded(_) => EventKind::ImageInfoLoaded,
            Event::ImageInfoError { .. } => EventKind::ImageInfoError,
        }
    }
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct SubscriptionId(u64);

type Listener = Box<dyn FnMut(&Event)>;

struct Subscription {
    id: SubscriptionId,
    kind: Option<EventKind>,
    listener: Listener,
}

/// Single-threaded listener registry
#[derive(Default)]
pub struct EventBus {
    subscriptions: Vec<Subscription>,
    next_id: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen to every event
    pub fn subscribe(&mut self, listener: impl FnMut(&Event) + 'static) -> SubscriptionId {
        self.add(None, Box::new(listener))
    }

    /// Listen to a single kind of event
    pub fn subscribe_to(&mut self, kind: EventKind, listener: impl FnMut(&Event) + 'static) -> SubscriptionId {
        self.add(Some(kind), Box::new(listener))
    }

    fn add(&mut self, kind: Option<EventKind>, listener: Listener) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscriptions.push(Subscription { id, kind, listener });
        id
    }

    /// Returns false if the id was unknown
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.id != id);
        self.subscriptions.len() != before
    }

    pub fn emit(&mut self, event: &Event) {
        let kind = event.kind();
        for sub in &mut self.subscriptions {
            if sub.kind.is_none_or(|k| k == kind) {
                (sub.listener)(event);
            }
        }
    }

    pub fn emit_all(&mut self, events: impl IntoIterator<Item = Event>) {
        for event in events {
            self.emit(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_filtered_subscription() {
        let mut bus = EventBus::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe_to(EventKind::MapAdded, move |e| sink.borrow_mut().push(e.clone()));

        bus.emit(&Event::MapAdded("a".into()));
        bus.emit(&Event::MapRemoved("a".into()));
        assert_eq!(*seen.borrow(), vec![Event::MapAdded("a".into())]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let mut bus = EventBus::new();
        let count = Rc::new(RefCell::new(0));
        let c = count.clone();
        let id = bus.subscribe(move |_| *c.borrow_mut() += 1);
        bus.emit(&Event::Cleared);
        assert!(bus.unsubscribe(id));
        bus.emit(&Event::Cleared);
        assert_eq!(*count.borrow(), 1);
        assert!(!bus.unsubscribe(id));
    }
}
