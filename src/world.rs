use crate::entity::{BlockAllocator, EntityAllocator, EntityLocation};
use crate::event::{Subscribers, WorldEvent};
use crate::filter::MatchCtx;
use crate::graph::TableStore;
use crate::id::{Entity, Id, Role, HI_COMPONENT_ID, LAST_BUILTIN, ON_ADD, ON_REMOVE};
use crate::index::{QueryId, TableId, TriggerId};
use crate::query::{QueryEvent, QueryStore};
use crate::table::ComponentRegistry;
use crate::trigger::{Observable, TriggerStore};
use crossbeam_channel::Sender;
use derivative::Derivative;
use fxhash::{FxHashMap, FxHashSet};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EntityMutationError {
    #[error("entity does not exist")]
    DoesNotExist,
    #[error("id does not carry component data")]
    NotAComponent,
}

/// Hook invoked when a system-bound query transitions between zero and
/// non-zero active tables.
pub type SystemActivateAction = Box<dyn FnMut(Entity, bool)>;

/// A factory for worlds sharing one entity-id space.
///
/// Entities created in worlds of the same universe never collide, which
/// keeps ids meaningful across world merges.
#[derive(Debug)]
pub struct Universe {
    allocator: Arc<Mutex<BlockAllocator>>,
}

impl Universe {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Universe {
            allocator: Arc::new(Mutex::new(BlockAllocator::new())),
        }
    }

    pub fn create_world(&self) -> World {
        World::with_allocator(EntityAllocator::new(self.allocator.clone()))
    }
}

/// Change channels queries subscribe to: `(relation, id)` pairs that force a
/// full rematch when an entity participating in them changes.
#[derive(Debug, Default)]
struct Monitors {
    registered: FxHashMap<(u64, u64), FxHashSet<QueryId>>,
    dirty: FxHashSet<(u64, u64)>,
}

/// Owns every subsystem of the store: the table graph, the query set, the
/// trigger registry, the entity index and the component registry.
///
/// All operations take the world explicitly; there is no global state.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct World {
    pub(crate) store: TableStore,
    pub(crate) components: ComponentRegistry,
    pub(crate) entities: EntityAllocator,
    pub(crate) queries: QueryStore,
    pub(crate) triggers: TriggerStore,
    pub(crate) observable: Observable,
    pub(crate) entity_triggers: FxHashMap<u64, TriggerId>,
    #[derivative(Debug = "ignore")]
    pub(crate) subscribers: Subscribers,
    pub(crate) watched: FxHashSet<u32>,
    monitors: Monitors,
    /// True inside an iteration window; structural mutation is rejected.
    pub(crate) is_readonly: bool,
    #[derivative(Debug = "ignore")]
    system_activate: Option<SystemActivateAction>,
    next_component_id: u64,
}

impl World {
    /// Creates a world with its own private entity-id space. See also
    /// [`Universe::create_world`].
    pub fn new() -> Self {
        Self::with_allocator(EntityAllocator::new(Arc::new(Mutex::new(BlockAllocator::new()))))
    }

    fn with_allocator(entities: EntityAllocator) -> Self {
        let components = ComponentRegistry::default();
        let store = TableStore::new(&components);
        World {
            store,
            components,
            entities,
            queries: QueryStore::default(),
            triggers: TriggerStore::default(),
            observable: Observable::new(),
            entity_triggers: FxHashMap::default(),
            subscribers: Subscribers::new(),
            watched: FxHashSet::default(),
            monitors: Monitors::default(),
            is_readonly: false,
            system_activate: None,
            next_component_id: LAST_BUILTIN.raw() + 1,
        }
    }

    #[inline]
    pub fn store(&self) -> &TableStore { &self.store }

    #[inline]
    pub(crate) fn store_mut(&mut self) -> &mut TableStore { &mut self.store }

    #[inline]
    pub fn components(&self) -> &ComponentRegistry { &self.components }

    #[inline]
    pub fn components_mut(&mut self) -> &mut ComponentRegistry { &mut self.components }

    /// Registers `id` as a data-bearing component of `size` bytes.
    pub fn register_component(&mut self, id: Id, size: usize) {
        self.components.register_component(id, size);
    }

    /// Registers a named type: a list of ids usable behind constraint
    /// markers, `OWNED` expansion and switch columns.
    pub fn register_type(&mut self, id: Id, ids: Vec<Id>) {
        self.components.register_type(id, ids);
    }

    /// Allocates an id from the low range, eligible for dense edge storage.
    pub fn new_component_id(&mut self) -> Id {
        let id = self.next_component_id;
        assert!(id < HI_COMPONENT_ID, "low component id space exhausted");
        self.next_component_id += 1;
        Id::new(id)
    }

    /// Whether the world is inside an iteration window.
    pub fn is_readonly(&self) -> bool { self.is_readonly }

    /// Subscribes to structural event notifications.
    pub fn subscribe(&mut self, sender: Sender<WorldEvent>) { self.subscribers.push(sender); }

    /// Installs the system activation hook fired on 0↔non-0 active-table
    /// transitions of system-bound queries.
    pub fn set_system_activate(&mut self, hook: SystemActivateAction) {
        self.system_activate = Some(hook);
    }

    pub(crate) fn system_activate(&mut self, system: Entity, active: bool) {
        if let Some(mut hook) = self.system_activate.take() {
            hook(system, active);
            self.system_activate = Some(hook);
        }
    }

    pub(crate) fn match_ctx(&self) -> MatchCtx<'_> {
        MatchCtx {
            store: &self.store,
            components: &self.components,
            entities: &self.entities,
        }
    }

    /// Read-only view handed to user-supplied rankers and comparators.
    pub fn view(&self) -> WorldView<'_> { WorldView { ctx: self.match_ctx() } }

    // -- entities ---------------------------------------------------------

    /// Creates an empty entity. It occupies no table until an id is added.
    pub fn entity_new(&mut self) -> Entity { self.entities.allocate() }

    pub fn is_alive(&self, entity: Entity) -> bool { self.entities.is_alive(entity) }

    /// Live handle for an id whose generation was stripped (e.g. a pair
    /// half). Returns the input when the number was never allocated.
    pub fn resolve(&self, id: Id) -> Entity {
        self.entities.resolve(id.number()).unwrap_or(id)
    }

    /// The id list of the table the entity lives in.
    pub fn entity_type(&self, entity: Entity) -> &[Id] {
        match self.entities.get_location(entity.number()) {
            Some(location) => self.store.table(location.table()).ids(),
            None => &[],
        }
    }

    pub fn entity_table(&self, entity: Entity) -> Option<TableId> {
        self.entities.get_location(entity.number()).map(|l| l.table())
    }

    pub fn has_id(&self, entity: Entity, id: Id) -> bool {
        self.entity_type(entity).iter().any(|&t| id.matches(t))
    }

    /// Marks an entity as participating in a reference or parent monitor.
    pub fn set_watch(&mut self, entity: Id) { self.watched.insert(entity.number()); }

    pub fn is_watched(&self, entity: Entity) -> bool {
        self.watched.contains(&entity.number())
    }

    // -- monitors ---------------------------------------------------------

    /// Subscribes a query to the `(relation, id)` change channel.
    pub(crate) fn monitor_register(&mut self, relation: Id, id: Id, query: QueryId) {
        self.monitors
            .registered
            .entry((relation.raw(), id.raw()))
            .or_default()
            .insert(query);
    }

    fn mark_monitors_dirty(&mut self, entity: Entity, changed: &[Id]) {
        let ty: SmallVec<[Id; 16]> = SmallVec::from_slice(self.entity_type(entity));
        for &c in changed {
            self.monitors.dirty.insert((0, c.raw()));
            if c.is_pair() {
                let relation = c.relation().raw();
                for &t in ty.iter() {
                    self.monitors.dirty.insert((relation, t.raw()));
                }
            }
        }
    }

    /// Flushes dirty monitors: queries subscribed to a dirtied channel are
    /// told to rematch.
    pub(crate) fn eval_monitors(&mut self) {
        if self.monitors.dirty.is_empty() {
            return;
        }
        let dirty: Vec<(u64, u64)> = self.monitors.dirty.drain().collect();

        let mut rematch: FxHashSet<QueryId> = FxHashSet::default();
        for ((relation, id), queries) in self.monitors.registered.iter() {
            for &(dirty_relation, dirty_id) in &dirty {
                if *relation == dirty_relation && Id::new(*id).matches(Id::new(dirty_id)) {
                    rematch.extend(queries.iter().copied());
                    break;
                }
            }
        }

        for query in rematch {
            // Registrations of finalised queries linger; skip them.
            if self.queries.contains(query) {
                self.query_notify(query, QueryEvent::TableRematch);
            }
        }
    }

    // -- mutation ---------------------------------------------------------

    pub fn add_id(&mut self, entity: Entity, id: Id) -> Result<(), EntityMutationError> {
        self.add_ids(entity, &[id])
    }

    /// Adds ids to an entity, moving its row along the table graph's add
    /// edges. Fires `ON_ADD` triggers for every id that changed the type and
    /// raises empty/non-empty query events for the affected tables.
    pub fn add_ids(&mut self, entity: Entity, ids: &[Id]) -> Result<(), EntityMutationError> {
        assert!(!self.is_readonly, "world is in a read-only iteration window");
        if !self.is_alive(entity) {
            return Err(EntityMutationError::DoesNotExist);
        }

        let location = self.entities.get_location(entity.number());
        let src = location.map_or(TableId::ROOT, |l| l.table());

        let mut added: SmallVec<[Id; 8]> = SmallVec::new();
        let dst = self.traverse_add(src, ids, Some(&mut added));

        let row = self.commit(entity, location, src, dst);

        if let Some(row) = row {
            // Cases do not move the entity; write them into the switch
            // column of the destination table.
            let case_ids: SmallVec<[Id; 4]> = added
                .iter()
                .copied()
                .filter(|id| id.has_role(Role::Case))
                .collect();
            for case in case_ids {
                let sw_index = self
                    .store
                    .table(dst)
                    .switch_from_case(case, &self.components)
                    .expect("case id does not belong to any switch column");
                let table = self.store.table_mut(dst);
                table
                    .switch_column_mut(sw_index)
                    .set(row, case.component().raw());
            }
        }

        if !added.is_empty() {
            if self.is_watched(entity) {
                self.mark_monitors_dirty(entity, &added);
            }
            match row {
                Some(row) => self.triggers_notify(&added, ON_ADD, entity, Some(dst), row, 1),
                None => self.triggers_notify(&added, ON_ADD, entity, None, 0, 0),
            }
        }

        Ok(())
    }

    pub fn remove_id(&mut self, entity: Entity, id: Id) -> Result<(), EntityMutationError> {
        self.remove_ids(entity, &[id])
    }

    /// Removes ids from an entity, moving its row along the remove edges.
    /// `ON_REMOVE` triggers fire before the move, while the data still
    /// exists. Ids the entity does not have are skipped.
    pub fn remove_ids(&mut self, entity: Entity, ids: &[Id]) -> Result<(), EntityMutationError> {
        assert!(!self.is_readonly, "world is in a read-only iteration window");
        if !self.is_alive(entity) {
            return Err(EntityMutationError::DoesNotExist);
        }

        let location = match self.entities.get_location(entity.number()) {
            Some(location) => location,
            None => return Ok(()),
        };
        let src = location.table();

        let mut removed: SmallVec<[Id; 8]> = SmallVec::new();
        let dst = self.traverse_remove(src, ids, Some(&mut removed));

        if !removed.is_empty() {
            self.triggers_notify(&removed, ON_REMOVE, entity, Some(src), location.row(), 1);
        }

        let row = self.commit(entity, Some(location), src, dst);

        // Removing a case clears the switch value; the row itself stays.
        if let Some(row) = row {
            let case_ids: SmallVec<[Id; 4]> = removed
                .iter()
                .copied()
                .filter(|id| id.has_role(Role::Case))
                .collect();
            for case in case_ids {
                if let Some(sw_index) = self
                    .store
                    .table(dst)
                    .switch_from_case(case, &self.components)
                {
                    let sw = self.store.table_mut(dst).switch_column_mut(sw_index);
                    if sw.get(row) == case.component().raw() {
                        sw.set(row, 0);
                    }
                }
            }
        }

        if !removed.is_empty() && self.is_watched(entity) {
            self.mark_monitors_dirty(entity, &removed);
        }

        Ok(())
    }

    /// Moves the entity's row from `src` to `dst`, updating locations and
    /// raising activation events. Returns the entity's row in `dst`.
    fn commit(
        &mut self,
        entity: Entity,
        location: Option<EntityLocation>,
        src: TableId,
        dst: TableId,
    ) -> Option<usize> {
        if let Some(location) = location {
            if src == dst {
                return Some(location.row());
            }

            let row = location.row();
            let (new_row, moved) = {
                let (src_table, dst_table) = self.store.pair_mut(src, dst);
                crate::table::move_row(src_table, dst_table, row)
            };

            if let Some(moved) = moved {
                self.entities
                    .set_location(moved.number(), Some(EntityLocation::new(src, row)));
            }
            self.entities
                .set_location(entity.number(), Some(EntityLocation::new(dst, new_row)));

            if self.store.table(src).count() == 0 {
                self.table_activation(src, false);
            }
            if self.store.table(dst).count() == 1 {
                self.table_activation(dst, true);
            }

            self.subscribers.send(WorldEvent::EntityMoved(entity, dst));
            Some(new_row)
        } else {
            if dst == TableId::ROOT {
                return None;
            }
            let new_row = self.store.table_mut(dst).push_row(entity);
            self.entities
                .set_location(entity.number(), Some(EntityLocation::new(dst, new_row)));

            if self.store.table(dst).count() == 1 {
                self.table_activation(dst, true);
            }

            self.subscribers.send(WorldEvent::EntityMoved(entity, dst));
            Some(new_row)
        }
    }

    /// Notifies the queries matched with a table that it became empty or
    /// non-empty.
    fn table_activation(&mut self, table: TableId, active: bool) {
        let queries = self.store.table(table).queries.clone();
        let event = if active {
            QueryEvent::TableNonEmpty(table)
        } else {
            QueryEvent::TableEmpty(table)
        };
        for query in queries {
            self.query_notify(query, event);
        }
    }

    /// Writes component data for an entity, adding the id if absent.
    pub fn set(&mut self, entity: Entity, id: Id, bytes: &[u8]) -> Result<(), EntityMutationError> {
        if !self.has_id(entity, id) {
            self.add_id(entity, id)?;
        }

        let location = self
            .entities
            .get_location(entity.number())
            .ok_or(EntityMutationError::NotAComponent)?;
        let table = self.store.table_mut(location.table());
        let column = table
            .index_of(id)
            .filter(|&i| i < table.column_count() && table.column(i).size() > 0)
            .ok_or(EntityMutationError::NotAComponent)?;

        table.set_bytes(location.row(), column, bytes);
        Ok(())
    }

    /// Reads component data for an entity; `None` for tags and absent ids.
    pub fn get(&self, entity: Entity, id: Id) -> Option<&[u8]> {
        let location = self.entities.get_location(entity.number())?;
        let table = self.store.table(location.table());
        let column = table.index_of(id)?;
        table.get_bytes(location.row(), column)
    }

    /// Toggles the bitset-tracked enabled state of a component on one row,
    /// adding the bitset column on first use.
    pub fn enable(
        &mut self,
        entity: Entity,
        id: Id,
        enabled: bool,
    ) -> Result<(), EntityMutationError> {
        let disabled = id.component().with_role(Role::Disabled);
        if !self.has_id(entity, disabled) {
            self.add_id(entity, disabled)?;
        }

        let location = self
            .entities
            .get_location(entity.number())
            .ok_or(EntityMutationError::DoesNotExist)?;
        let table = self.store.table_mut(location.table());
        let index = table.index_of(disabled).unwrap() - table.bs_column_offset();
        table.bitset_column_mut(index).set(location.row(), enabled);
        Ok(())
    }

    pub fn is_enabled(&self, entity: Entity, id: Id) -> bool {
        let disabled = id.component().with_role(Role::Disabled);
        match self.entities.get_location(entity.number()) {
            Some(location) => {
                let table = self.store.table(location.table());
                match table.index_of(disabled) {
                    Some(index) => table
                        .bitset_column(index - table.bs_column_offset())
                        .get(location.row()),
                    None => true,
                }
            }
            None => true,
        }
    }

    /// The active case of a switch on an entity, if any.
    pub fn case_of(&self, entity: Entity, switch_id: Id) -> Option<Id> {
        let location = self.entities.get_location(entity.number())?;
        let table = self.store.table(location.table());
        let switch = switch_id.component().with_role(Role::Switch);
        let index = table.index_of(switch)? - table.sw_column_offset();
        let value = table.switch_column(index).get(location.row());
        if value == 0 {
            None
        } else {
            Some(Id::new(value))
        }
    }

    /// Destroys an entity: fires `ON_REMOVE` for its ids, releases its row,
    /// finalises any trigger it backs and recycles the id.
    pub fn delete(&mut self, entity: Entity) -> bool {
        assert!(!self.is_readonly, "world is in a read-only iteration window");
        if !self.is_alive(entity) {
            return false;
        }

        if let Some(location) = self.entities.get_location(entity.number()) {
            let table = location.table();
            let ids: SmallVec<[Id; 16]> =
                SmallVec::from_slice(self.store.table(table).ids());

            if !ids.is_empty() {
                self.triggers_notify(&ids, ON_REMOVE, entity, Some(table), location.row(), 1);
                if self.is_watched(entity) {
                    self.mark_monitors_dirty(entity, &ids);
                }
            }

            let moved = self.store.table_mut(table).swap_remove_row(location.row());
            if let Some(moved) = moved {
                self.entities
                    .set_location(moved.number(), Some(EntityLocation::new(table, location.row())));
            }
            if self.store.table(table).count() == 0 {
                self.table_activation(table, false);
            }
        }

        if let Some(&trigger) = self.entity_triggers.get(&entity.raw()) {
            self.trigger_fini(trigger);
        }

        trace!(?entity, "deleted entity");
        self.entities.free(entity);
        self.subscribers.send(WorldEvent::EntityDestroyed(entity));
        true
    }
}

impl Default for World {
    fn default() -> Self { Self::new() }
}

/// Read-only world access for user callbacks: rankers, comparators and other
/// code that must not mutate during evaluation.
#[derive(Copy, Clone)]
pub struct WorldView<'a> {
    pub(crate) ctx: MatchCtx<'a>,
}

impl<'a> WorldView<'a> {
    pub fn entity_type(&self, entity: Entity) -> &'a [Id] { self.ctx.type_of(entity) }

    pub fn resolve(&self, id: Id) -> Entity { self.ctx.resolve(id) }

    /// Reads component data through the view.
    pub fn get(&self, entity: Entity, id: Id) -> Option<&'a [u8]> {
        let location = self.ctx.entities.get_location(entity.number())?;
        let table = self.ctx.store.table(location.table());
        let column = table.index_of(id)?;
        table.get_bytes(location.row(), column)
    }

    pub fn component_size(&self, id: Id) -> Option<usize> {
        self.ctx.components.component_size(id)
    }
}
