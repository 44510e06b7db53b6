use crate::filter::{FilterError, Term};
use crate::id::{Entity, Id, Role, ON_ADD, ON_CREATE_TRIGGER, THIS, WILDCARD};
use crate::index::{TableId, TriggerId};
use crate::world::World;
use derivative::Derivative;
use downcast_rs::{impl_downcast, Downcast};
use fxhash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use thiserror::Error;
use tracing::trace;

/// Maximum number of events a single trigger may subscribe to.
pub const TRIGGER_EVENT_COUNT_MAX: usize = 8;

/// Opaque user context attached to a trigger; downcast to the concrete type
/// inside the callback.
pub trait TriggerContext: Downcast {}
impl_downcast!(TriggerContext);
impl<T: std::any::Any> TriggerContext for T {}

/// The data delivered to a trigger callback for one dispatch.
pub struct TriggerFrame<'a> {
    /// Event that fired.
    pub event: Id,
    /// Concrete id the trigger resolved to (wildcard registrations receive
    /// the matched id, not the pattern).
    pub id: Id,
    /// Entity the event concerns when no table frame is available.
    pub entity: Entity,
    pub entities: &'a [Entity],
    pub table: Option<TableId>,
    pub row: usize,
    pub count: usize,
    /// Column data of `id` for the affected rows, when the id carries data.
    pub column: Option<&'a [u8]>,
    pub size: usize,
    /// Entity backing the invoked trigger.
    pub trigger_entity: Entity,
    pub ctx: Option<&'a mut dyn TriggerContext>,
}

pub type TriggerAction = Box<dyn FnMut(&mut TriggerFrame<'_>)>;

/// A single-term reactive callback bound to one or more events.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Trigger {
    pub(crate) id: TriggerId,
    pub(crate) term: Term,
    #[derivative(Debug = "ignore")]
    action: TriggerAction,
    #[derivative(Debug = "ignore")]
    ctx: Option<Box<dyn TriggerContext>>,
    events: SmallVec<[Id; 4]>,
    pub(crate) entity: Entity,
}

impl Trigger {
    pub fn id(&self) -> TriggerId { self.id }

    pub fn term(&self) -> &Term { &self.term }

    pub fn events(&self) -> &[Id] { &self.events }

    pub fn entity(&self) -> Entity { self.entity }
}

/// Specification for [`World::trigger_init`].
#[derive(Derivative)]
#[derivative(Debug, Default)]
pub struct TriggerDesc {
    pub term: Option<Term>,
    pub events: Vec<Id>,
    #[derivative(Debug = "ignore")]
    pub callback: Option<TriggerAction>,
    #[derivative(Debug = "ignore")]
    pub ctx: Option<Box<dyn TriggerContext>>,
    /// Existing entity to back the trigger; allocated when absent.
    pub entity: Option<Entity>,
    /// Replay current rows for iterable events on registration.
    pub retrigger: bool,
}

#[derive(Error, Debug)]
pub enum TriggerInitError {
    #[error("invalid term: {0}")]
    Term(#[from] FilterError),
    #[error("trigger subject must be This")]
    SubjectNotThis,
    #[error("trigger must have at least one event")]
    NoEvents,
    #[error("trigger has more than {TRIGGER_EVENT_COUNT_MAX} events")]
    TooManyEvents,
    #[error("trigger is missing a callback")]
    MissingCallback,
}

/// Per-event, per-id trigger dispatch tables. Typically hosted by the world,
/// but any object may embed one.
#[derive(Debug, Default)]
pub struct Observable {
    events: FxHashMap<u64, FxHashMap<u64, FxHashSet<TriggerId>>>,
}

impl Observable {
    pub fn new() -> Self { Self::default() }

    /// Registers a trigger for `(event, id)`. Returns true when this is the
    /// first trigger ever registered for the id under this event.
    fn register(&mut self, event: Id, id: Id, trigger: TriggerId) -> bool {
        let ids = self.events.entry(event.raw()).or_default();
        let set = ids.entry(id.raw()).or_default();
        let first = set.is_empty();
        set.insert(trigger);
        first
    }

    /// Removes a trigger, pruning empty id and event buckets.
    fn unregister(&mut self, event: Id, id: Id, trigger: TriggerId) {
        if let Some(ids) = self.events.get_mut(&event.raw()) {
            if let Some(set) = ids.get_mut(&id.raw()) {
                set.remove(&trigger);
                if set.is_empty() {
                    ids.remove(&id.raw());
                }
            }
            if ids.is_empty() {
                self.events.remove(&event.raw());
            }
        }
    }

    fn triggers_for(&self, event: Id, id: Id) -> Option<&FxHashSet<TriggerId>> {
        self.events
            .get(&event.raw())
            .and_then(|ids| ids.get(&id.raw()))
            .filter(|set| !set.is_empty())
    }
}

#[derive(Derivative, Default)]
#[derivative(Debug)]
pub(crate) struct TriggerStore {
    #[derivative(Debug = "ignore")]
    slots: Vec<Option<Trigger>>,
}

impl TriggerStore {
    fn insert(&mut self, mut trigger: Trigger) -> TriggerId {
        let id = TriggerId(self.slots.len() as u32);
        trigger.id = id;
        self.slots.push(Some(trigger));
        id
    }

    pub fn get(&self, id: TriggerId) -> Option<&Trigger> {
        self.slots.get(id.0 as usize).and_then(|slot| slot.as_ref())
    }

    fn take(&mut self, id: TriggerId) -> Option<Trigger> {
        self.slots.get_mut(id.0 as usize).and_then(|slot| slot.take())
    }

    fn put_back(&mut self, trigger: Trigger) {
        let slot = trigger.id.0 as usize;
        self.slots[slot] = Some(trigger);
    }
}

impl World {
    /// Registers a reactive trigger: finalises its term, allocates a backing
    /// entity, registers it under each event, and announces the first
    /// registration for an id with an `ON_CREATE_TRIGGER` meta-event.
    pub fn trigger_init(&mut self, desc: TriggerDesc) -> Result<TriggerId, TriggerInitError> {
        let TriggerDesc {
            term,
            events,
            callback,
            ctx,
            entity,
            retrigger,
        } = desc;

        let mut term = term.ok_or(TriggerInitError::Term(FilterError::MissingPredicate))?;
        term.finalize()?;

        // Triggers for specific entities are not supported.
        if term.subj.entity != THIS {
            return Err(TriggerInitError::SubjectNotThis);
        }
        if events.is_empty() {
            return Err(TriggerInitError::NoEvents);
        }
        if events.len() > TRIGGER_EVENT_COUNT_MAX {
            return Err(TriggerInitError::TooManyEvents);
        }
        let action = callback.ok_or(TriggerInitError::MissingCallback)?;

        let entity = entity.unwrap_or_else(|| self.entity_new());
        let term_id = term.id;

        let trigger = Trigger {
            id: TriggerId(0),
            term,
            action,
            ctx,
            events: SmallVec::from_slice(&events),
            entity,
        };
        let tid = self.triggers.insert(trigger);
        self.entity_triggers.insert(entity.raw(), tid);

        for &event in &events {
            // Announce first-subscription before the trigger enters the
            // bucket, so observer indexes can react and the new trigger does
            // not observe its own registration.
            let first = self.observable.triggers_for(event, term_id).is_none();
            if first {
                self.triggers_notify(&[term_id], ON_CREATE_TRIGGER, entity, None, 0, 0);
            }
            self.observable.register(event, term_id, tid);
        }

        trace!(trigger = tid.0, id = ?term_id, "created trigger");

        if retrigger {
            self.retrigger(tid, &events);
        }

        Ok(tid)
    }

    /// Replays historical rows for iterable events. Table membership is
    /// replayable for `ON_ADD`.
    fn retrigger(&mut self, tid: TriggerId, events: &[Id]) {
        if !events.contains(&ON_ADD) {
            return;
        }

        let pattern = match self.triggers.get(tid) {
            Some(trigger) => trigger.term.id,
            None => return,
        };

        let tables: Vec<TableId> = self
            .store
            .iter()
            .filter(|table| {
                table.count() > 0 && table.ids().iter().any(|&id| pattern.matches(id))
            })
            .map(|table| table.id())
            .collect();

        for table in tables {
            let concrete = self
                .store
                .table(table)
                .ids()
                .iter()
                .copied()
                .find(|&id| pattern.matches(id))
                .unwrap();
            let count = self.store.table(table).count();
            self.invoke_trigger(tid, concrete, ON_ADD, Id::NULL, Some(table), 0, count);
        }
    }

    /// Unregisters and drops a trigger; its context is released with it.
    pub fn trigger_fini(&mut self, tid: TriggerId) {
        let trigger = match self.triggers.take(tid) {
            Some(trigger) => trigger,
            None => return,
        };

        for &event in trigger.events.iter() {
            self.observable.unregister(event, trigger.term.id, tid);
        }
        self.entity_triggers.remove(&trigger.entity.raw());
        // Dropping the trigger frees its context.
    }

    pub fn trigger(&self, tid: TriggerId) -> Option<&Trigger> { self.triggers.get(tid) }

    /// Dispatches an event for a set of ids to every matching trigger.
    ///
    /// Each id notifies the triggers registered for it exactly; pair ids
    /// additionally fan out to `(rel, *)`, `(*, obj)` and `(*, *)`, plain
    /// ids to the plain wildcard. Trigger invocation order within one id is
    /// arbitrary.
    pub fn triggers_notify(
        &mut self,
        ids: &[Id],
        event: Id,
        entity: Entity,
        table: Option<TableId>,
        row: usize,
        count: usize,
    ) {
        if self.observable.events.get(&event.raw()).is_none() {
            return;
        }

        for &id in ids {
            let mut targets: SmallVec<[Id; 4]> = SmallVec::new();
            targets.push(id);
            if id.is_pair() {
                targets.push(Id::pair(id.relation(), WILDCARD));
                targets.push(Id::pair(WILDCARD, id.object()));
                targets.push(Id::pair(WILDCARD, WILDCARD));
            } else {
                targets.push(WILDCARD);
            }
            targets.dedup();

            for target in targets {
                let triggers: SmallVec<[TriggerId; 4]> =
                    match self.observable.triggers_for(event, target) {
                        Some(set) => set.iter().copied().collect(),
                        None => continue,
                    };

                for tid in triggers {
                    self.invoke_trigger(tid, id, event, entity, table, row, count);
                }
            }
        }
    }

    fn invoke_trigger(
        &mut self,
        tid: TriggerId,
        id: Id,
        event: Id,
        entity: Entity,
        table: Option<TableId>,
        row: usize,
        count: usize,
    ) {
        let mut trigger = match self.triggers.take(tid) {
            Some(trigger) => trigger,
            None => return,
        };

        {
            let (entities, column, size): (&[Entity], Option<&[u8]>, usize) = match table {
                Some(table) if count > 0 => {
                    let t = self.store.table(table);
                    let entities = &t.entities()[row..row + count];
                    let mut column = None;
                    let mut size = 0;
                    if !id.has_role(Role::Case) {
                        if let Some(index) = t.index_of(id) {
                            if index < t.column_count() && t.column(index).size() > 0 {
                                size = t.column(index).size();
                                let bytes = t.column(index).bytes();
                                column = Some(&bytes[row * size..(row + count) * size]);
                            }
                        }
                    }
                    (entities, column, size)
                }
                _ => (&[], None, 0),
            };

            let mut frame = TriggerFrame {
                event,
                id,
                entity,
                entities,
                table,
                row,
                count,
                column,
                size,
                trigger_entity: trigger.entity,
                ctx: trigger.ctx.as_deref_mut(),
            };

            (trigger.action)(&mut frame);
        }

        self.triggers.put_back(trigger);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::World;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn world() -> World {
        let _ = tracing_subscriber::fmt::try_init();
        World::new()
    }

    fn counting_trigger(
        term: Term,
        events: Vec<Id>,
    ) -> (TriggerDesc, Rc<RefCell<Vec<(Id, Id, usize)>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        let desc = TriggerDesc {
            term: Some(term),
            events,
            callback: Some(Box::new(move |frame| {
                sink.borrow_mut().push((frame.event, frame.id, frame.count));
            })),
            ..TriggerDesc::default()
        };
        (desc, log)
    }

    #[test]
    fn trigger_fires_on_add() {
        let mut world = world();
        let pos = Id::new(40);

        let (desc, log) = counting_trigger(Term::new(pos), vec![ON_ADD]);
        world.trigger_init(desc).unwrap();

        let e = world.entity_new();
        world.add_id(e, pos).unwrap();

        let log = log.borrow();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0], (ON_ADD, pos, 1));
    }

    #[test]
    fn trigger_requires_this_subject() {
        let mut world = world();
        let pos = Id::new(40);
        let other = world.entity_new();

        let (mut desc, _) = counting_trigger(Term::new(pos), vec![ON_ADD]);
        desc.term = Some(Term::new(pos).with_subject(other));
        assert!(matches!(
            world.trigger_init(desc),
            Err(TriggerInitError::SubjectNotThis)
        ));
    }

    #[test]
    fn wildcard_pair_trigger_resolves_concrete_id() {
        let mut world = world();
        let eats = Id::new(50);
        let apples = Id::new(51);
        let likes = Id::new(52);

        let (desc, log) =
            counting_trigger(Term::new(Id::pair(eats, WILDCARD)), vec![ON_ADD]);
        world.trigger_init(desc).unwrap();

        let e = world.entity_new();
        world.add_id(e, Id::pair(eats, apples)).unwrap();
        world.add_id(e, Id::pair(likes, apples)).unwrap();

        let log = log.borrow();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].1, Id::pair(eats, apples));
    }

    #[test]
    fn unregistered_trigger_stops_firing() {
        let mut world = world();
        let pos = Id::new(40);

        let (desc, log) = counting_trigger(Term::new(pos), vec![ON_ADD]);
        let tid = world.trigger_init(desc).unwrap();
        world.trigger_fini(tid);

        let e = world.entity_new();
        world.add_id(e, pos).unwrap();
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn remove_event_fires_before_data_is_gone() {
        let mut world = world();
        let pos = Id::new(40);
        world.register_component(pos, 4);

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let desc = TriggerDesc {
            term: Some(Term::new(pos)),
            events: vec![crate::id::ON_REMOVE],
            callback: Some(Box::new(move |frame| {
                let bytes = frame.column.expect("column data should still exist");
                sink.borrow_mut().push(bytes.to_vec());
            })),
            ..TriggerDesc::default()
        };
        world.trigger_init(desc).unwrap();

        let e = world.entity_new();
        world.add_id(e, pos).unwrap();
        world.set(e, pos, &7u32.to_le_bytes()).unwrap();
        world.remove_id(e, pos).unwrap();

        assert_eq!(&*seen.borrow(), &[7u32.to_le_bytes().to_vec()]);
    }

    #[test]
    fn retrigger_replays_existing_rows() {
        let mut world = world();
        let pos = Id::new(40);

        let e1 = world.entity_new();
        let e2 = world.entity_new();
        world.add_id(e1, pos).unwrap();
        world.add_id(e2, pos).unwrap();

        let (mut desc, log) = counting_trigger(Term::new(pos), vec![ON_ADD]);
        desc.retrigger = true;
        world.trigger_init(desc).unwrap();

        let log = log.borrow();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0], (ON_ADD, pos, 2));
    }

    #[test]
    fn first_registration_emits_meta_event() {
        let mut world = world();
        let pos = Id::new(40);

        let (meta_desc, meta_log) =
            counting_trigger(Term::new(WILDCARD), vec![ON_CREATE_TRIGGER]);
        world.trigger_init(meta_desc).unwrap();

        let (desc, _) = counting_trigger(Term::new(pos), vec![ON_ADD]);
        world.trigger_init(desc).unwrap();

        let log = meta_log.borrow();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, ON_CREATE_TRIGGER);
        assert_eq!(log[0].1, pos);
    }

    #[test]
    fn context_is_delivered() {
        let mut world = world();
        let pos = Id::new(40);

        struct Counter(u32);

        let desc = TriggerDesc {
            term: Some(Term::new(pos)),
            events: vec![ON_ADD],
            ctx: Some(Box::new(Counter(0))),
            callback: Some(Box::new(|frame| {
                let counter = frame
                    .ctx
                    .as_mut()
                    .unwrap()
                    .downcast_mut::<Counter>()
                    .unwrap();
                counter.0 += 1;
            })),
            ..TriggerDesc::default()
        };
        let tid = world.trigger_init(desc).unwrap();

        let e = world.entity_new();
        world.add_id(e, pos).unwrap();

        let trigger = world.trigger(tid).unwrap();
        let counter = trigger_ctx::<Counter>(trigger);
        assert_eq!(counter.0, 1);
    }

    fn trigger_ctx<T: 'static>(trigger: &Trigger) -> &T {
        trigger
            .ctx
            .as_ref()
            .expect("trigger has no context")
            .downcast_ref::<T>()
            .expect("context type mismatch")
    }
}
