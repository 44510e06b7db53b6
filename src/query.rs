use crate::filter::{match_filter_multi, CachedType, Filter, FilterError, Oper, SetMask, Term};
use crate::id::{Entity, Id, Role, CHILD_OF, IS_A, THIS};
use crate::index::{QueryId, TableId};
use crate::world::{World, WorldView};
use derivative::Derivative;
use fxhash::FxHashMap;
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::ops::{BitOr, BitOrAssign};
use thiserror::Error;
use tracing::trace;

/// Row comparator installed by `order_by`. Receives the entity and the raw
/// bytes of the ordered component for both rows.
pub type OrderByAction = Box<dyn Fn(Entity, &[u8], Entity, &[u8]) -> Ordering + Send + Sync>;

/// Table ranker installed by `group_by`. Receives the grouping component and
/// the table's id list, and yields the table's rank.
pub type GroupRankAction = Box<dyn Fn(&WorldView<'_>, Id, &[Id]) -> i32 + Send + Sync>;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryFlags(u32);

impl QueryFlags {
    pub const NONE: QueryFlags = QueryFlags(0);
    /// Query has `This` subjects and therefore matches tables.
    pub const NEEDS_TABLES: QueryFlags = QueryFlags(1 << 0);
    /// Query may resolve terms on entities other than the row entity.
    pub const HAS_REFS: QueryFlags = QueryFlags(1 << 1);
    pub const HAS_OPTIONAL: QueryFlags = QueryFlags(1 << 2);
    /// At least one term is writable; iteration bumps dirty counters.
    pub const HAS_OUT_COLUMNS: QueryFlags = QueryFlags(1 << 3);
    pub const IS_SUBQUERY: QueryFlags = QueryFlags(1 << 4);
    pub const IS_ORPHANED: QueryFlags = QueryFlags(1 << 5);
    pub const MATCH_DISABLED: QueryFlags = QueryFlags(1 << 6);
    pub const MATCH_PREFAB: QueryFlags = QueryFlags(1 << 7);
    /// Query has wildcard pair terms.
    pub const HAS_PAIRS: QueryFlags = QueryFlags(1 << 8);

    #[inline]
    pub fn contains(self, other: QueryFlags) -> bool { self.0 & other.0 == other.0 }
}

impl BitOr for QueryFlags {
    type Output = QueryFlags;
    #[inline]
    fn bitor(self, rhs: QueryFlags) -> QueryFlags { QueryFlags(self.0 | rhs.0) }
}

impl BitOrAssign for QueryFlags {
    #[inline]
    fn bitor_assign(&mut self, rhs: QueryFlags) { self.0 |= rhs.0 }
}

/// Index of a cached-table entry in one of the query's two lists.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TableSlot {
    Active(usize),
    Empty(usize),
}

/// A switch term matched against a table, resolved to the switch column that
/// owns the case.
#[derive(Copy, Clone, Debug)]
pub(crate) struct SparseColumn {
    /// Term slot in the cached type.
    pub term: usize,
    /// Raw case value to iterate.
    pub case: u64,
    /// Index into the table's switch columns.
    pub sw_index: usize,
}

/// A term whose id is toggled by a bitset column of the table.
#[derive(Copy, Clone, Debug)]
pub(crate) struct BitsetColumn {
    /// Index into the table's bitset columns.
    pub bs_index: usize,
}

/// Per-(query, table) cache entry.
#[derive(Debug)]
pub(crate) struct CachedTable {
    pub table: Option<TableId>,
    pub ty: CachedType,
    pub rank: i32,
    /// Dirty-state snapshot for change detection; lazily created.
    pub monitor: Option<Vec<u32>>,
    pub sparse_columns: Vec<SparseColumn>,
    pub bitset_columns: Vec<BitsetColumn>,
}

/// A contiguous run of globally-sorted rows inside one active table.
#[derive(Copy, Clone, Debug)]
pub(crate) struct TableSlice {
    /// Index of the cached table in the active list.
    pub slot: usize,
    pub start_row: usize,
    pub count: usize,
}

/// Events a query reacts to. See
/// [`World::query_notify`](crate::world::World)-driven notification fan-out.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueryEvent {
    /// A new table exists; run the matcher against it.
    TableMatch(TableId),
    /// A table is being deleted; drop all entries for it.
    TableUnmatch(TableId),
    /// Something the query depends on changed; re-match every table.
    TableRematch,
    /// A matched table became empty.
    TableEmpty(TableId),
    /// A matched table gained its first entity.
    TableNonEmpty(TableId),
    /// The parent query went away; only legal for subqueries.
    Orphan,
}

/// Specification for [`World::query_init`].
#[derive(Derivative)]
#[derivative(Debug, Default)]
pub struct QueryDesc {
    pub terms: Vec<Term>,
    pub name: Option<String>,
    /// Match against the parent's tables instead of the world.
    pub parent: Option<QueryId>,
    /// System entity to activate when the query gains or loses its first
    /// non-empty table.
    pub system: Option<Entity>,
    #[derivative(Debug = "ignore")]
    pub order_by: Option<(Id, OrderByAction)>,
    #[derivative(Debug = "ignore")]
    pub group_by: Option<(Id, GroupRankAction)>,
}

#[derive(Error, Debug)]
pub enum QueryInitError {
    #[error("invalid filter: {0}")]
    Filter(#[from] FilterError),
    #[error("parent query does not exist")]
    UnknownParent,
}

/// A persistent match-cache over the table graph.
///
/// Matched tables are partitioned into an active list and an empty list;
/// `table_indices` maps a table to its entries in either. The partitions are
/// maintained incrementally through [`QueryEvent`] notifications.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Query {
    pub(crate) id: QueryId,
    pub(crate) filter: Filter,
    pub(crate) flags: QueryFlags,
    pub(crate) tables: Vec<CachedTable>,
    pub(crate) empty_tables: Vec<CachedTable>,
    pub(crate) table_indices: FxHashMap<TableId, SmallVec<[TableSlot; 1]>>,
    pub(crate) match_count: i32,
    pub(crate) prev_match_count: i32,
    pub(crate) subqueries: Vec<QueryId>,
    pub(crate) parent: Option<QueryId>,
    pub(crate) system: Option<Entity>,
    /// Slot index + 1 of the cascade term, when present.
    pub(crate) cascade_by: Option<usize>,
    pub(crate) rank_on_component: Id,
    #[derivative(Debug = "ignore")]
    pub(crate) group_ranker: Option<GroupRankAction>,
    pub(crate) sort_on_component: Id,
    #[derivative(Debug = "ignore")]
    pub(crate) compare: Option<OrderByAction>,
    pub(crate) table_slices: Vec<TableSlice>,
    pub(crate) needs_reorder: bool,
    pub(crate) constraints_satisfied: bool,
}

impl Query {
    fn new(id: QueryId, filter: Filter, system: Option<Entity>) -> Query {
        Query {
            id,
            filter,
            flags: QueryFlags::NONE,
            tables: Vec::new(),
            empty_tables: Vec::new(),
            table_indices: FxHashMap::default(),
            match_count: 0,
            prev_match_count: -1,
            subqueries: Vec::new(),
            parent: None,
            system,
            cascade_by: None,
            rank_on_component: Id::NULL,
            group_ranker: None,
            sort_on_component: Id::NULL,
            compare: None,
            table_slices: Vec::new(),
            needs_reorder: false,
            constraints_satisfied: true,
        }
    }

    pub fn id(&self) -> QueryId { self.id }

    pub fn flags(&self) -> QueryFlags { self.flags }

    pub fn filter(&self) -> &Filter { &self.filter }

    pub fn is_orphaned(&self) -> bool { self.flags.contains(QueryFlags::IS_ORPHANED) }

    /// Number of matched tables currently holding entities.
    pub fn active_table_count(&self) -> usize { self.tables.len() }

    pub fn empty_table_count(&self) -> usize { self.empty_tables.len() }

    /// The stored index entries for a table, empty when unmatched.
    pub fn table_slots(&self, table: TableId) -> &[TableSlot] {
        self.table_indices.get(&table).map_or(&[], |slots| slots.as_slice())
    }

    /// Resolves a stored slot back to the table its entry caches.
    pub fn slot_table(&self, slot: TableSlot) -> Option<TableId> {
        match slot {
            TableSlot::Active(i) => self.tables.get(i).and_then(|entry| entry.table),
            TableSlot::Empty(i) => self.empty_tables.get(i).and_then(|entry| entry.table),
        }
    }

    fn list(&self, slot: TableSlot) -> &CachedTable {
        match slot {
            TableSlot::Active(i) => &self.tables[i],
            TableSlot::Empty(i) => &self.empty_tables[i],
        }
    }

    /// Relocates the cached entry at `slot` to the tail of the other list
    /// (or drops it when `drop_entry`), rewriting the displaced entry's
    /// bookkeeping. Returns the new slot of the moved entry.
    fn move_table(&mut self, table: TableId, slot: TableSlot, drop_entry: bool) -> TableSlot {
        let (index, activate) = match slot {
            TableSlot::Empty(i) => (i, true),
            TableSlot::Active(i) => (i, false),
        };

        let src_len = if activate { self.empty_tables.len() } else { self.tables.len() };
        let last_src_index = src_len - 1;

        // The last entry of the source list is relocated into the vacated
        // position; rewrite the one stored index that pointed at it.
        if index != last_src_index {
            let last = if activate {
                &self.empty_tables[last_src_index]
            } else {
                &self.tables[last_src_index]
            };
            let last_table = last.table.expect("stub entries are never relocated");

            let slots = self
                .table_indices
                .get_mut(&last_table)
                .expect("relocated table missing from table_indices");

            let mut rewritten = false;
            for entry in slots.iter_mut() {
                match (*entry, activate) {
                    (TableSlot::Empty(i), true) if i == last_src_index => {
                        *entry = TableSlot::Empty(index);
                        rewritten = true;
                        break;
                    }
                    (TableSlot::Active(i), false) if i == last_src_index => {
                        *entry = TableSlot::Active(index);
                        rewritten = true;
                        break;
                    }
                    _ => {}
                }
            }
            debug_assert!(rewritten, "no index entry matched the relocated table");
        }

        let entry = if activate {
            self.empty_tables.swap_remove(index)
        } else {
            self.tables.swap_remove(index)
        };
        debug_assert_eq!(entry.table, Some(table));

        if drop_entry {
            // Entry freed; report where it came from for completeness.
            return slot;
        }

        if activate {
            self.tables.push(entry);
            TableSlot::Active(self.tables.len() - 1)
        } else {
            self.empty_tables.push(entry);
            TableSlot::Empty(self.empty_tables.len() - 1)
        }
    }

    /// Moves all entries for `table` between the empty and active lists.
    /// Returns how many entries moved, or `None` when the table is unknown
    /// (legal only for subqueries).
    fn activate_table(&mut self, table: TableId, active: bool) -> Option<usize> {
        if !self.table_indices.contains_key(&table) {
            return None;
        }

        let mut activated = 0;
        let mut cursor = 0;
        loop {
            let slots = match self.table_indices.get(&table) {
                Some(slots) => slots,
                None => break,
            };
            if cursor >= slots.len() {
                break;
            }
            let slot = slots[cursor];

            let wants_move = match slot {
                TableSlot::Empty(_) => active,
                TableSlot::Active(_) => !active,
            };
            if !wants_move {
                cursor += 1;
                continue;
            }

            debug_assert_eq!(self.list(slot).table, Some(table));
            let new_slot = self.move_table(table, slot, false);
            let slots = self.table_indices.get_mut(&table).unwrap();
            slots[cursor] = new_slot;
            activated += 1;
            cursor += 1;
        }

        if activated > 0 {
            // Reordering is deferred to iterator construction; doing it here
            // would sort once per activated table.
            self.needs_reorder = true;
        }
        Some(activated)
    }

    fn unmatch_table(&mut self, table: TableId) {
        loop {
            let slot = match self.table_indices.get(&table).and_then(|s| s.first().copied()) {
                Some(slot) => slot,
                None => break,
            };
            self.table_indices.get_mut(&table).unwrap().remove(0);
            self.move_table(table, slot, true);
        }
        self.table_indices.remove(&table);
    }

    fn clear_tables(&mut self) -> Vec<TableId> {
        let tables: Vec<TableId> = self.table_indices.keys().copied().collect();
        self.tables.clear();
        self.empty_tables.clear();
        self.table_indices.clear();
        self.table_slices.clear();
        tables
    }

    /// Stable-sorts the active list by rank and rewrites the stored indices
    /// to match the new positions.
    pub(crate) fn order_ranked_tables(&mut self) {
        if self.group_ranker.is_some() {
            let mut order: Vec<usize> = (0..self.tables.len()).collect();
            order.sort_by_key(|&i| self.tables[i].rank);

            let mut reordered = Vec::with_capacity(self.tables.len());
            let mut new_index = vec![0usize; self.tables.len()];
            for (new_i, &old_i) in order.iter().enumerate() {
                new_index[old_i] = new_i;
            }
            // Drain in old order, then place according to the permutation.
            let mut old: Vec<Option<CachedTable>> =
                self.tables.drain(..).map(Some).collect();
            for &old_i in &order {
                reordered.push(old[old_i].take().unwrap());
            }
            self.tables = reordered;

            for slots in self.table_indices.values_mut() {
                for slot in slots.iter_mut() {
                    if let TableSlot::Active(i) = *slot {
                        *slot = TableSlot::Active(new_index[i]);
                    }
                }
            }
        }
        self.needs_reorder = false;
    }
}

/// Walks a type from the tail looking for `ChildOf` pairs whose parent also
/// holds the ranked component; every level contributes one plus the parent's
/// own depth. Recursion is bounded by the height of the hierarchy.
pub fn rank_by_depth(view: &WorldView<'_>, component: Id, ty: &[Id]) -> i32 {
    let mut result = 0;

    for &id in ty.iter().rev() {
        if id.has_relation(CHILD_OF) {
            let parent_ty = view.entity_type(view.resolve(id.object()));
            if parent_ty.iter().any(|&c| c == component) {
                result += 1;
                result += rank_by_depth(view, component, parent_ty);
                break;
            }
        } else if !id.has_any_role() {
            // No more parents after this.
            break;
        }
    }

    result
}

/// Slab of queries owned by a world.
#[derive(Derivative, Default)]
#[derivative(Debug)]
pub(crate) struct QueryStore {
    #[derivative(Debug = "ignore")]
    slots: Vec<Option<Query>>,
}

impl QueryStore {
    pub fn insert(&mut self, mut query: Query) -> QueryId {
        let id = QueryId(self.slots.len() as u32);
        query.id = id;
        self.slots.push(Some(query));
        id
    }

    pub fn reserve_id(&self) -> QueryId { QueryId(self.slots.len() as u32) }

    pub fn get(&self, id: QueryId) -> &Query {
        self.slots[id.0 as usize].as_ref().expect("query does not exist")
    }

    pub fn get_mut(&mut self, id: QueryId) -> &mut Query {
        self.slots[id.0 as usize].as_mut().expect("query does not exist")
    }

    pub fn take(&mut self, id: QueryId) -> Query {
        self.slots[id.0 as usize].take().expect("query does not exist")
    }

    pub fn put_back(&mut self, query: Query) {
        let slot = query.id.0 as usize;
        debug_assert!(self.slots[slot].is_none());
        self.slots[slot] = Some(query);
    }

    pub fn remove(&mut self, id: QueryId) -> Query {
        self.slots[id.0 as usize].take().expect("query does not exist")
    }

    pub fn contains(&self, id: QueryId) -> bool {
        self.slots
            .get(id.0 as usize)
            .map_or(false, |slot| slot.is_some())
    }

    pub fn ids(&self) -> Vec<QueryId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(i, _)| QueryId(i as u32))
            .collect()
    }
}

fn process_signature(world: &mut World, query: &mut Query) {
    let mut cascade_by = None;
    let mut rank_on = Id::NULL;
    let mut flags = query.flags;
    let mut watch: SmallVec<[Id; 4]> = SmallVec::new();

    if query.filter.match_prefab {
        flags |= QueryFlags::MATCH_PREFAB;
    }
    if query.filter.match_disabled {
        flags |= QueryFlags::MATCH_DISABLED;
    }

    let mut slot = 0;
    let mut in_or = false;
    for term in query.filter.terms.iter() {
        if term.inout != crate::filter::InOut::In {
            flags |= QueryFlags::HAS_OUT_COLUMNS;
        }
        if term.oper == Oper::Optional {
            flags |= QueryFlags::HAS_OPTIONAL;
        }
        if term.subj.entity == THIS {
            flags |= QueryFlags::NEEDS_TABLES;
        }

        if term.subj.set.contains(SetMask::CASCADE) && term.oper == Oper::Optional {
            cascade_by = Some(slot + 1);
            rank_on = term.id;
        }

        if term.subj.entity != THIS
            && !term.subj.entity.is_null()
            && term.subj.set == SetMask::SELF
        {
            watch.push(term.subj.entity);
        }

        if term.oper == Oper::Or {
            if !in_or {
                in_or = true;
                slot += 1;
            }
        } else {
            in_or = false;
            slot += 1;
        }
    }

    if query.filter.has_refs() {
        flags |= QueryFlags::HAS_REFS;
    }
    if query.filter.has_wildcard_pairs() {
        flags |= QueryFlags::HAS_PAIRS;
    }

    query.flags = flags;
    query.cascade_by = cascade_by;
    if !rank_on.is_null() {
        query.rank_on_component = rank_on;
    }

    for entity in watch {
        world.set_watch(entity);
    }

    if !query.flags.contains(QueryFlags::IS_SUBQUERY) {
        register_monitors(world, query);
    }
}

/// Monitors let a query hear about changes it cannot resolve incrementally:
/// cascade terms re-rank when a parent moves, reference terms re-resolve
/// when a watched entity changes.
fn register_monitors(world: &mut World, query: &Query) {
    for term in query.filter.terms.iter() {
        if term.oper == Oper::Or {
            continue;
        }
        let subj = &term.subj;
        if subj.set.contains(SetMask::SUPERSET)
            && subj.set.contains(SetMask::CASCADE)
            && subj.relation != IS_A
        {
            if subj.relation != IS_A {
                world.monitor_register(subj.relation, term.id, query.id);
            }
            world.monitor_register(Id::NULL, term.id, query.id);
        } else if subj.set.contains(SetMask::SUPERSET) || subj.entity != THIS {
            world.monitor_register(Id::NULL, term.id, query.id);
        }
    }
}

fn satisfy_constraints(world: &World, filter: &Filter) -> bool {
    let ctx = world.match_ctx();
    for term in filter.terms.iter() {
        let subj = &term.subj;
        if subj.entity != THIS && subj.set.contains(SetMask::SELF) {
            let ty = ctx.type_of(ctx.resolve(subj.entity));
            let has = ty.iter().any(|&id| term.id.matches(id));
            if has {
                if term.oper == Oper::Not {
                    return false;
                }
            } else if term.oper != Oper::Not {
                return false;
            }
        }
    }
    true
}

impl World {
    /// Creates a query from a descriptor: builds and normalises the filter,
    /// derives flags, registers monitors, matches existing tables (or the
    /// parent's tables for subqueries) and applies ordering and grouping.
    pub fn query_init(&mut self, desc: QueryDesc) -> Result<QueryId, QueryInitError> {
        let QueryDesc {
            terms,
            name,
            parent,
            system,
            order_by,
            group_by,
        } = desc;

        let mut filter = Filter::new(terms)?;
        filter.name = name;

        if let Some(parent) = parent {
            if !self.queries.contains(parent) {
                return Err(QueryInitError::UnknownParent);
            }
        }

        let qid = self.queries.reserve_id();
        let mut query = Query::new(qid, filter, system);

        if let Some(parent) = parent {
            query.flags |= QueryFlags::IS_SUBQUERY;
            query.parent = Some(parent);
        }

        // A system that names itself as a subject must own the component.
        if let Some(system) = system {
            let subject_ids: Vec<Id> = query
                .filter
                .terms
                .iter()
                .filter(|t| t.subj.entity == system)
                .map(|t| t.id)
                .collect();
            for id in subject_ids {
                let _ = self.add_id(system, id);
            }
        }

        process_signature(self, &mut query);

        if query.cascade_by.is_some() {
            query.group_ranker = Some(Box::new(rank_by_depth));
        }

        trace!(query = qid.0, name = ?query.filter.name, "created query");

        self.queries.insert(query);

        match parent {
            None => {
                if self.queries.get(qid).flags.contains(QueryFlags::NEEDS_TABLES) {
                    self.match_tables(qid);
                } else {
                    // Stub match that pre-resolves references so everything
                    // is processed when the query is first evaluated.
                    self.match_table(qid, None);
                }
            }
            Some(parent) => self.add_subquery(parent, qid),
        }

        let mut query = self.queries.take(qid);
        query.constraints_satisfied = satisfy_constraints(self, &query.filter);
        if query.group_ranker.is_some() {
            query.needs_reorder = true;
        }
        self.queries.put_back(query);

        if let Some((component, compare)) = order_by {
            self.query_order_by(qid, component, compare);
        }
        if let Some((component, ranker)) = group_by {
            self.query_group_by(qid, component, ranker);
        }

        Ok(qid)
    }

    /// Tears a query down: detaches it from its parent, orphans its
    /// subqueries and releases its table caches.
    pub fn query_fini(&mut self, qid: QueryId) {
        let query = self.queries.remove(qid);

        if query.flags.contains(QueryFlags::IS_SUBQUERY)
            && !query.flags.contains(QueryFlags::IS_ORPHANED)
        {
            if let Some(parent) = query.parent {
                let parent = self.queries.get_mut(parent);
                parent.subqueries.retain(|sub| *sub != qid);
            }
        }

        for sub in query.subqueries.iter() {
            self.query_notify(*sub, QueryEvent::Orphan);
        }

        for table in query.table_indices.keys() {
            self.store.table_mut(*table).queries.retain(|q| *q != qid);
        }
    }

    pub fn query(&self, qid: QueryId) -> &Query { self.queries.get(qid) }

    /// Routes a cache-maintenance event to a query and cascades it to the
    /// query's subqueries.
    pub fn query_notify(&mut self, qid: QueryId, event: QueryEvent) {
        let mut cascade = true;

        match event {
            QueryEvent::TableMatch(table) => {
                cascade = self.match_table(qid, Some(table));
            }
            QueryEvent::TableUnmatch(table) => {
                let mut query = self.queries.take(qid);
                query.unmatch_table(table);
                self.queries.put_back(query);
                self.store.table_mut(table).queries.retain(|q| *q != qid);
            }
            QueryEvent::TableRematch => {
                self.rematch_tables(qid);
            }
            QueryEvent::TableEmpty(table) => {
                self.activate_table(qid, table, false);
            }
            QueryEvent::TableNonEmpty(table) => {
                self.activate_table(qid, table, true);
            }
            QueryEvent::Orphan => {
                let query = self.queries.get_mut(qid);
                assert!(
                    query.flags.contains(QueryFlags::IS_SUBQUERY),
                    "orphan event on a root query"
                );
                query.flags |= QueryFlags::IS_ORPHANED;
                query.parent = None;
            }
        }

        if cascade {
            let subqueries = self.queries.get(qid).subqueries.clone();
            for sub in subqueries {
                self.query_notify(sub, event);
            }
        }
    }

    /// Fans a query event out to every query in the world.
    pub fn notify_queries(&mut self, event: QueryEvent) {
        for qid in self.queries.ids() {
            // Subqueries are notified through their parents.
            if self
                .queries
                .get(qid)
                .flags
                .contains(QueryFlags::IS_SUBQUERY)
            {
                continue;
            }
            self.query_notify(qid, event);
        }
    }

    fn match_tables(&mut self, qid: QueryId) {
        for i in 0..self.store.len() {
            self.match_table(qid, Some(TableId(i as u32)));
        }
    }

    fn rematch_tables(&mut self, qid: QueryId) {
        let mut query = self.queries.take(qid);
        let tables = query.clear_tables();
        self.queries.put_back(query);
        for table in tables {
            self.store.table_mut(table).queries.retain(|q| *q != qid);
        }
        self.match_tables(qid);
    }

    /// Runs the matcher for one table (or the stub) and inserts the cache
    /// entries. Returns whether anything matched.
    fn match_table(&mut self, qid: QueryId, table: Option<TableId>) -> bool {
        let mut query = self.queries.take(qid);

        let matches = {
            let ctx = self.match_ctx();
            match_filter_multi(&ctx, &query.filter, table.map(|t| self.store.table(t)))
        };
        let matched = !matches.is_empty();

        for ty in matches {
            self.insert_table(&mut query, table, ty);
        }

        self.queries.put_back(query);

        if matched {
            if let Some(table) = table {
                let queries = &mut self.store.table_mut(table).queries;
                if !queries.contains(&qid) {
                    queries.push(qid);
                }
            }
        }
        matched
    }

    fn insert_table(&mut self, query: &mut Query, table: Option<TableId>, ty: CachedType) {
        let mut sparse_columns = Vec::new();
        let mut bitset_columns = Vec::new();
        let mut rank = 0;

        if let Some(tid) = table {
            let t = self.store.table(tid);

            for (slot, &id) in ty.ids.iter().enumerate() {
                if id.has_role(Role::Case) {
                    let sw_index = t
                        .switch_from_case(id, &self.components)
                        .expect("case id without a matching switch column");
                    sparse_columns.push(SparseColumn {
                        term: slot,
                        case: id.component().raw(),
                        sw_index,
                    });
                }
                let disabled = id.component().with_role(Role::Disabled);
                if let Some(index) = t.index_of(disabled) {
                    bitset_columns.push(BitsetColumn {
                        bs_index: index - t.bs_column_offset(),
                    });
                }
            }

            if let Some(ranker) = &query.group_ranker {
                let view = self.view();
                rank = ranker(&view, query.rank_on_component, self.store.table(tid).ids());
            }
        }

        let empty = table.map_or(true, |t| self.store.table(t).count() == 0);
        let entry = CachedTable {
            table,
            ty,
            rank,
            monitor: None,
            sparse_columns,
            bitset_columns,
        };

        let slot = if empty {
            query.empty_tables.push(entry);
            TableSlot::Empty(query.empty_tables.len() - 1)
        } else {
            query.tables.push(entry);
            TableSlot::Active(query.tables.len() - 1)
        };

        if let Some(tid) = table {
            query.table_indices.entry(tid).or_default().push(slot);
        }
    }

    fn activate_table(&mut self, qid: QueryId, table: TableId, active: bool) {
        let mut query = self.queries.take(qid);
        let system = query.system;
        let prev_active = query.tables.len();

        let activated = query.activate_table(table, active);

        // Unknown tables can only show up for subqueries, which hear about
        // every event of their parent.
        debug_assert!(
            activated.is_some() || query.flags.contains(QueryFlags::IS_SUBQUERY),
            "activation event for an unmatched table"
        );

        let transition = if activated.unwrap_or(0) > 0 {
            if active && prev_active == 0 && !query.tables.is_empty() {
                Some(true)
            } else if !active && query.tables.is_empty() && prev_active > 0 {
                Some(false)
            } else {
                None
            }
        } else {
            None
        };

        self.queries.put_back(query);

        if let (Some(system), Some(state)) = (system, transition) {
            self.system_activate(system, state);
        }
    }

    fn add_subquery(&mut self, parent: QueryId, sub: QueryId) {
        self.queries.get_mut(parent).subqueries.push(sub);

        let active: Vec<TableId> = self
            .queries
            .get(parent)
            .tables
            .iter()
            .filter_map(|t| t.table)
            .collect();
        let empty: Vec<TableId> = self
            .queries
            .get(parent)
            .empty_tables
            .iter()
            .filter_map(|t| t.table)
            .collect();

        for table in active {
            self.match_table(sub, Some(table));
            self.activate_table(sub, table, true);
        }
        for table in empty {
            self.match_table(sub, Some(table));
        }
    }

    /// Installs a per-row comparator; iteration will visit rows in sorted
    /// order, re-sorting tables whose dirty state moved.
    pub fn query_order_by(&mut self, qid: QueryId, component: Id, compare: OrderByAction) {
        {
            let query = self.queries.get_mut(qid);
            assert!(!query.is_orphaned(), "query is orphaned");
            assert!(
                query.flags.contains(QueryFlags::NEEDS_TABLES),
                "order_by requires a table-bound query"
            );
            query.sort_on_component = component;
            query.compare = Some(compare);
            query.table_slices.clear();
        }

        self.sort_tables(qid);

        let mut query = self.queries.take(qid);
        if query.table_slices.is_empty() {
            build_sorted_tables(self, &mut query);
        }
        self.queries.put_back(query);
    }

    /// Installs a table ranker; matched tables are grouped by rank and
    /// iterated in ascending rank order.
    pub fn query_group_by(&mut self, qid: QueryId, component: Id, ranker: GroupRankAction) {
        {
            let query = self.queries.get_mut(qid);
            assert!(!query.is_orphaned(), "query is orphaned");
            assert!(
                query.flags.contains(QueryFlags::NEEDS_TABLES),
                "group_by requires a table-bound query"
            );
            query.rank_on_component = component;
            query.group_ranker = Some(ranker);
        }

        self.group_tables(qid);

        let mut query = self.queries.take(qid);
        query.order_ranked_tables();
        build_sorted_tables(self, &mut query);
        self.queries.put_back(query);
    }

    /// Recomputes the rank of every matched table.
    pub(crate) fn group_tables(&mut self, qid: QueryId) {
        let mut query = self.queries.take(qid);
        if let Some(ranker) = &query.group_ranker {
            let view = self.view();
            for entry in query.tables.iter_mut().chain(query.empty_tables.iter_mut()) {
                if let Some(table) = entry.table {
                    entry.rank = ranker(&view, query.rank_on_component, self.store.table(table).ids());
                }
            }
        }
        query.needs_reorder = true;
        self.queries.put_back(query);
    }

    /// True when any matched table changed since the last iteration, or the
    /// set of matched tables itself changed.
    pub fn query_changed(&self, qid: QueryId) -> bool {
        let query = self.queries.get(qid);
        assert!(!query.is_orphaned(), "query is orphaned");

        if query.match_count != query.prev_match_count {
            return true;
        }
        for entry in query.tables.iter() {
            let table = match entry.table {
                Some(table) => table,
                None => continue,
            };
            let dirty = self.store.table(table).dirty_state();
            match &entry.monitor {
                None => return true,
                Some(monitor) => {
                    if dirty.iter().zip(monitor.iter()).any(|(a, b)| a != b) {
                        return true;
                    }
                }
            }
        }
        false
    }

    pub fn query_orphaned(&self, qid: QueryId) -> bool { self.queries.get(qid).is_orphaned() }

    /// Snapshots every active table's dirty state as the new change-detection
    /// baseline.
    pub(crate) fn tables_reset_dirty(&mut self, qid: QueryId) {
        let mut query = self.queries.take(qid);
        query.prev_match_count = query.match_count;
        for entry in query.tables.iter_mut() {
            if let Some(table) = entry.table {
                entry.monitor = Some(self.store.table(table).monitor());
            }
        }
        self.queries.put_back(query);
    }

    /// Sorts dirty tables in place and rebuilds the sorted slices when
    /// anything moved.
    pub(crate) fn sort_tables(&mut self, qid: QueryId) {
        let mut query = self.queries.take(qid);

        if query.compare.is_none() {
            self.queries.put_back(query);
            return;
        }

        let sort_on = query.sort_on_component;
        let mut tables_sorted = false;

        for entry in query.tables.iter_mut() {
            let tid = match entry.table {
                Some(tid) => tid,
                None => continue,
            };

            let mut is_dirty = false;
            if entry.monitor.is_none() {
                // A table matched since the last iteration is always dirty.
                entry.monitor = Some(self.store.table(tid).monitor());
                is_dirty = true;
            }

            let monitor = entry.monitor.as_ref().unwrap();
            let dirty_state = self.store.table(tid).dirty_state();
            is_dirty = is_dirty || dirty_state[0] != monitor[0];

            let mut column = None;
            if !sort_on.is_null() {
                match self.store.table(tid).index_of(sort_on) {
                    Some(index) => {
                        if index < self.store.table(tid).column_count() {
                            is_dirty = is_dirty
                                || dirty_state.get(index + 1) != monitor.get(index + 1);
                            column = Some(index);
                        }
                    }
                    None => {
                        // Sorted component is shared from a base; rows never
                        // reorder within the table.
                        continue;
                    }
                }
            }

            if is_dirty {
                let table = self.store.table_mut(tid);
                let compare = query.compare.as_ref().unwrap();
                sort_table(table, column, compare);
                tables_sorted = true;
            }
        }

        if tables_sorted || query.match_count != query.prev_match_count {
            query.order_ranked_tables();
            build_sorted_tables(self, &mut query);
            query.match_count += 1;
        }

        self.queries.put_back(query);
    }
}

fn column_bytes<'t>(table: &'t crate::table::Table, row: usize, column: Option<usize>) -> &'t [u8] {
    match column {
        Some(c) => table.get_bytes(row, c).unwrap_or(&[]),
        None => &[],
    }
}

fn qsort_partition(
    table: &mut crate::table::Table,
    column: Option<usize>,
    lo: i32,
    hi: i32,
    compare: &OrderByAction,
) -> i32 {
    let p = ((hi + lo) / 2) as usize;
    let mut pivot: Vec<u8> = column_bytes(table, p, column).to_vec();
    let mut pivot_e = table.entities()[p];
    let mut i = lo - 1;
    let mut j = hi + 1;

    loop {
        loop {
            i += 1;
            let e = table.entities()[i as usize];
            if compare(e, column_bytes(table, i as usize, column), pivot_e, &pivot)
                != Ordering::Less
            {
                break;
            }
        }
        loop {
            j -= 1;
            let e = table.entities()[j as usize];
            if compare(e, column_bytes(table, j as usize, column), pivot_e, &pivot)
                != Ordering::Greater
            {
                break;
            }
        }

        if i >= j {
            return j;
        }

        table.swap_rows(i as usize, j as usize);

        if p == i as usize {
            pivot = column_bytes(table, j as usize, column).to_vec();
            pivot_e = table.entities()[j as usize];
        } else if p == j as usize {
            pivot = column_bytes(table, i as usize, column).to_vec();
            pivot_e = table.entities()[i as usize];
        }
    }
}

fn qsort_rows(
    table: &mut crate::table::Table,
    column: Option<usize>,
    lo: i32,
    hi: i32,
    compare: &OrderByAction,
) {
    if hi - lo < 1 {
        return;
    }
    let p = qsort_partition(table, column, lo, hi, compare);
    qsort_rows(table, column, lo, p, compare);
    qsort_rows(table, column, p + 1, hi, compare);
}

fn sort_table(table: &mut crate::table::Table, column: Option<usize>, compare: &OrderByAction) {
    let count = table.count();
    if count < 2 {
        return;
    }
    qsort_rows(table, column, 0, count as i32 - 1, compare);
}

/// One cursor of the k-way merge used to build sorted slices.
struct SortHelper {
    slot: usize,
    row: usize,
    count: usize,
    shared: Option<Vec<u8>>,
    column: Option<usize>,
}

fn build_sorted_table_range(
    world: &World,
    query: &mut Query,
    start: usize,
    end: usize,
) {
    let component = query.sort_on_component;
    // Taken out so the comparator does not alias the slice vector below.
    let compare = match query.compare.take() {
        Some(compare) => compare,
        None => return,
    };

    let mut helpers: Vec<SortHelper> = Vec::with_capacity(end - start);
    for slot in start..end {
        let tid = match query.tables[slot].table {
            Some(tid) => tid,
            None => continue,
        };
        let table = world.store().table(tid);
        if table.count() == 0 {
            continue;
        }

        let (column, shared) = if component.is_null() {
            (None, None)
        } else if let Some(index) = table.index_of(component) {
            (Some(index), None)
        } else {
            // The component is satisfied by a base entity; all rows share
            // one value.
            let ctx = world.match_ctx();
            let view = world.view();
            let holder = crate::filter::shared_component_holder(&ctx, table.ids(), component);
            let bytes = holder
                .and_then(|holder| view.get(holder, component).map(|b| b.to_vec()))
                .expect("order_by component unresolvable for matched table");
            (None, Some(bytes))
        };

        helpers.push(SortHelper {
            slot,
            row: 0,
            count: table.count(),
            shared,
            column,
        });
    }

    loop {
        // Select the helper with the smallest current row.
        let mut min: Option<usize> = None;
        for (h, helper) in helpers.iter().enumerate() {
            if helper.row >= helper.count {
                continue;
            }
            match min {
                None => min = Some(h),
                Some(m) => {
                    let (em, bm);
                    let (eh, bh);
                    {
                        let mh = &helpers[m];
                        let table = world
                            .store()
                            .table(query.tables[mh.slot].table.unwrap());
                        em = table.entities()[mh.row];
                        bm = match &mh.shared {
                            Some(bytes) => bytes.clone(),
                            None => column_bytes(table, mh.row, mh.column).to_vec(),
                        };
                    }
                    {
                        let table = world
                            .store()
                            .table(query.tables[helper.slot].table.unwrap());
                        eh = table.entities()[helper.row];
                        bh = match &helper.shared {
                            Some(bytes) => bytes.clone(),
                            None => column_bytes(table, helper.row, helper.column).to_vec(),
                        };
                    }
                    if compare(em, &bm, eh, &bh) == Ordering::Greater {
                        min = Some(h);
                    }
                }
            }
        }

        let min = match min {
            Some(min) => min,
            None => break,
        };

        let helper = &mut helpers[min];
        let extend = match query.table_slices.last_mut() {
            Some(slice) if slice.slot == helper.slot => {
                slice.count += 1;
                true
            }
            _ => false,
        };
        if !extend {
            query.table_slices.push(TableSlice {
                slot: helper.slot,
                start_row: helper.row,
                count: 1,
            });
        }
        helper.row += 1;
    }

    query.compare = Some(compare);
}

/// Rebuilds the sorted slices: a k-way merge per rank band, emitted in
/// ascending rank order.
pub(crate) fn build_sorted_tables(world: &World, query: &mut Query) {
    query.table_slices.clear();

    let count = query.tables.len();
    let mut start = 0;
    let mut rank = query.tables.first().map_or(0, |t| t.rank);
    for i in 0..count {
        let table_rank = query.tables[i].rank;
        if rank != table_rank {
            if start != i {
                build_sorted_table_range(world, query, start, i);
                start = i;
            }
            rank = table_rank;
        }
    }
    if start != count {
        build_sorted_table_range(world, query, start, count);
    }
}
