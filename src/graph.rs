use crate::event::WorldEvent;
use crate::id::{Id, Role, HI_COMPONENT_ID, IS_A, CHILD_OF, MODULE};
use crate::index::TableId;
use crate::query::QueryEvent;
use crate::table::{ComponentRegistry, Table, TableFlags};
use crate::world::World;
use fxhash::FxHashMap;
use smallvec::SmallVec;
use tracing::trace;

/// A directed connection in the table graph: where adding or removing one id
/// leads from a table.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct Edge {
    pub add: Option<TableId>,
    pub remove: Option<TableId>,
}

/// Per-table edge storage.
///
/// Ids below [`HI_COMPONENT_ID`] land in a dense array indexed by id; higher
/// ids (entities, pairs, role-flagged ids) go through a hashmap. The split is
/// hidden behind one get/ensure interface.
#[derive(Debug, Default)]
pub struct EdgeMap {
    lo: Option<Box<[Edge]>>,
    hi: FxHashMap<u64, Edge>,
}

impl EdgeMap {
    pub fn new() -> Self { Self::default() }

    pub(crate) fn get(&self, id: Id) -> Option<Edge> {
        let raw = id.raw();
        if raw < HI_COMPONENT_ID {
            self.lo.as_ref().map(|lo| lo[raw as usize])
        } else {
            self.hi.get(&raw).copied()
        }
    }

    pub(crate) fn ensure(&mut self, id: Id) -> &mut Edge {
        let raw = id.raw();
        if raw < HI_COMPONENT_ID {
            let lo = self
                .lo
                .get_or_insert_with(|| vec![Edge::default(); HI_COMPONENT_ID as usize].into());
            &mut lo[raw as usize]
        } else {
            self.hi.entry(raw).or_default()
        }
    }

    /// Every edge with at least one endpoint set.
    pub(crate) fn occupied(&self) -> Vec<(Id, Edge)> {
        let mut out = Vec::new();
        if let Some(lo) = &self.lo {
            for (i, edge) in lo.iter().enumerate() {
                if edge.add.is_some() || edge.remove.is_some() {
                    out.push((Id::new(i as u64), *edge));
                }
            }
        }
        for (raw, edge) in &self.hi {
            if edge.add.is_some() || edge.remove.is_some() {
                out.push((Id::new(*raw), *edge));
            }
        }
        out
    }

    pub(crate) fn clear(&mut self) {
        self.lo = None;
        self.hi.clear();
    }
}

/// Owns every table of a world, deduplicated by sorted id list.
#[derive(Debug)]
pub struct TableStore {
    tables: Vec<Table>,
    table_map: FxHashMap<Box<[Id]>, TableId>,
}

impl TableStore {
    pub(crate) fn new(registry: &ComponentRegistry) -> Self {
        let root = Table::new(TableId::ROOT, Box::from([]), registry);
        TableStore {
            tables: vec![root],
            table_map: FxHashMap::default(),
        }
    }

    #[inline]
    pub fn table(&self, id: TableId) -> &Table { &self.tables[id] }

    #[inline]
    pub(crate) fn table_mut(&mut self, id: TableId) -> &mut Table { &mut self.tables[id] }

    pub fn len(&self) -> usize { self.tables.len() }

    pub fn is_empty(&self) -> bool { self.tables.is_empty() }

    pub fn iter(&self) -> impl Iterator<Item = &Table> { self.tables.iter() }

    pub fn table_ids(&self) -> impl Iterator<Item = TableId> + '_ {
        (0..self.tables.len()).map(|i| TableId(i as u32))
    }

    /// Mutable access to two distinct tables at once, for row moves.
    pub(crate) fn pair_mut(&mut self, a: TableId, b: TableId) -> (&mut Table, &mut Table) {
        assert_ne!(a, b);
        let (lo, hi, flip) = if a.0 < b.0 { (a, b, false) } else { (b, a, true) };
        let (head, tail) = self.tables.split_at_mut(hi.0 as usize);
        let first = &mut head[lo.0 as usize];
        let second = &mut tail[0];
        if flip {
            (second, first)
        } else {
            (first, second)
        }
    }

    pub(crate) fn lookup(&self, ids: &[Id]) -> Option<TableId> {
        self.table_map.get(ids).copied()
    }
}

fn is_ordered(ids: &[Id]) -> bool {
    let mut prev = Id::NULL;
    for &id in ids {
        if id <= prev {
            return false;
        }
        prev = id;
    }
    true
}

#[cfg(debug_assertions)]
fn verify_constraints(registry: &ComponentRegistry, ids: &[Id]) {
    for i in (0..ids.len()).rev() {
        let marker = ids[i];
        let role = match marker.role() {
            Some(role @ Role::Not) | Some(role @ Role::Or) | Some(role @ Role::Xor) => role,
            _ => break,
        };

        let ty = registry
            .type_of(marker)
            .expect("constraint marker must be applied to a registered type");

        let mut matches = 0;
        for &id in &ids[..i] {
            if id.has_any_role() {
                break;
            }
            if ty.contains(&id) {
                matches += 1;
            }
        }

        match role {
            Role::Or => assert!(matches >= 1, "OR constraint violated by {:?}", ids),
            // At most one: a table may carry the marker before any member
            // arrives; adding a second member replaces the first.
            Role::Xor => assert!(matches <= 1, "XOR constraint violated by {:?}", ids),
            Role::Not => assert!(matches == 0, "NOT constraint violated by {:?}", ids),
            _ => unreachable!(),
        }
    }
}

impl World {
    /// Returns the unique table whose id list equals the sorted, deduplicated
    /// image of `ids`, creating it on first need.
    ///
    /// Creating a table notifies every existing query with a `TableMatch`
    /// event, so this must not run inside an iteration window.
    pub fn table_find_or_create(&mut self, ids: &[Id]) -> TableId {
        if ids.is_empty() {
            return TableId::ROOT;
        }

        let mut scratch: SmallVec<[Id; 16]>;
        let ordered: &[Id] = if is_ordered(ids) {
            ids
        } else {
            scratch = SmallVec::from_slice(ids);
            scratch.sort();
            scratch.dedup();
            &scratch
        };

        if let Some(table) = self.store.lookup(ordered) {
            return table;
        }

        assert!(!self.is_readonly, "cannot create tables during iteration");

        #[cfg(debug_assertions)]
        verify_constraints(&self.components, ordered);

        self.create_table(ordered.into())
    }

    /// Convenience over [`table_find_or_create`](Self::table_find_or_create)
    /// resolving a registered type id.
    pub fn table_from_type(&mut self, type_id: Id) -> TableId {
        let ids: Vec<Id> = self
            .components
            .type_of(type_id)
            .expect("unknown type id")
            .to_vec();
        self.table_find_or_create(&ids)
    }

    fn create_table(&mut self, ids: Box<[Id]>) -> TableId {
        let tid = TableId(self.store.tables.len() as u32);
        let mut table = Table::new(tid, ids.clone(), &self.components);

        // Own ids point their add edge at the table itself; single-id tables
        // get a remove edge straight back to the root.
        for &id in ids.iter() {
            let edge = table.edges.ensure(id);
            edge.add = Some(tid);
            if ids.len() == 1 {
                edge.remove = Some(TableId::ROOT);
            }
        }

        let mut extra = TableFlags::NONE;
        for &id in table.ids() {
            if id.has_relation(CHILD_OF) {
                if self.has_id(self.resolve(id.object()), MODULE) {
                    extra |= TableFlags::HAS_BUILTINS | TableFlags::HAS_MODULE;
                }
            }
            if id.has_relation(CHILD_OF) || id.has_relation(IS_A) {
                self.set_watch(id.object());
            }
        }
        table.add_flags(extra);

        trace!(table = tid.0, ids = ?table.ids(), "created table");

        self.store.tables.push(table);
        self.store.table_map.insert(ids, tid);
        self.subscribers.send(WorldEvent::TableCreated(tid));

        self.notify_queries(QueryEvent::TableMatch(tid));

        tid
    }

    fn find_xor_replace(&self, node: TableId, add: Id) -> Option<Id> {
        let table = self.store.table(node);
        if !table.flags().contains(TableFlags::HAS_XOR) {
            return None;
        }

        let ids = table.ids();
        let mut xor_type: Option<&[Id]> = None;
        for &id in ids.iter().rev() {
            if id.has_role(Role::Xor) {
                if let Some(ty) = self.components.type_of(id) {
                    if ty.contains(&add.component()) {
                        xor_type = Some(ty);
                    }
                }
            } else if let Some(ty) = xor_type {
                if ty.contains(&id) {
                    return Some(id);
                }
            }
        }
        None
    }

    fn find_or_create_include(&mut self, node: TableId, add: Id) -> TableId {
        // Adding a case does not move the entity; the switch column absorbs
        // the change.
        if add.has_role(Role::Case) {
            assert!(
                self.store.table(node).flags().contains(TableFlags::HAS_SWITCH),
                "case id added to table without switch column"
            );
            return node;
        }

        let replace = self.find_xor_replace(node, add);

        let ids = self.store.table(node).ids();
        let mut next_ids: SmallVec<[Id; 16]> = SmallVec::with_capacity(ids.len() + 1);
        let mut added = false;
        for &id in ids {
            if Some(id) == replace {
                continue;
            }
            if id > add && !added {
                next_ids.push(add);
                added = true;
            }
            next_ids.push(id);
        }
        if !added {
            next_ids.push(add);
        }

        let result = self.table_find_or_create(&next_ids);
        if result != node {
            let edge = self.store.table_mut(result).edges.ensure(add);
            if edge.remove.is_none() {
                edge.remove = Some(node);
            }
        }
        result
    }

    fn find_or_create_exclude(&mut self, node: TableId, remove: Id) -> TableId {
        let ids = self.store.table(node).ids();
        let next_ids: SmallVec<[Id; 16]> =
            ids.iter().copied().filter(|id| *id != remove).collect();

        let result = self.table_find_or_create(&next_ids);
        if result != node {
            let edge = self.store.table_mut(result).edges.ensure(remove);
            if edge.add.is_none() {
                edge.add = Some(node);
            }
        }
        result
    }

    /// Walks the add edges from `node` for every id in `to_add`, creating
    /// missing successor tables on the way. Ids that changed the table (or
    /// carry the `CASE` role) are appended to `added`.
    ///
    /// Adding an `IsA` pair discovers `OWNED` components on the base entity
    /// and chains one further traversal for them. Owned ids that themselves
    /// introduce `IsA` edges are not chased to a fixed point.
    pub fn traverse_add(
        &mut self,
        node: TableId,
        to_add: &[Id],
        mut added: Option<&mut SmallVec<[Id; 8]>>,
    ) -> TableId {
        let mut node = node;
        let mut owned: SmallVec<[Id; 8]> = SmallVec::new();

        for &id in to_add {
            assert!(!id.is_null(), "cannot add id 0");

            let next = match self.store.table(node).edges.get(id).and_then(|e| e.add) {
                Some(next) => next,
                None => {
                    let next = self.find_or_create_include(node, id);
                    self.store.table_mut(node).edges.ensure(id).add = Some(next);
                    next
                }
            };

            let has_case = id.has_role(Role::Case);
            if let Some(out) = added.as_mut() {
                if node != next || has_case {
                    out.push(id);
                }
            }

            if node != next && id.has_relation(IS_A) {
                self.find_owned_components(id.object(), &mut owned);
            }

            node = next;
        }

        if !owned.is_empty() {
            node = self.traverse_add(node, &owned, added);
        }

        node
    }

    /// Walks the remove edges from `node` for every id in `to_remove`. Ids
    /// absent from the table are skipped.
    pub fn traverse_remove(
        &mut self,
        node: TableId,
        to_remove: &[Id],
        mut removed: Option<&mut SmallVec<[Id; 8]>>,
    ) -> TableId {
        let mut node = node;

        for &id in to_remove {
            assert!(!id.is_null(), "cannot remove id 0");

            let edge = self.store.table(node).edges.get(id).unwrap_or_default();
            let next = match edge.remove {
                Some(next) => next,
                None => {
                    if edge.add == Some(node) {
                        // Table owns the id but the exclude edge was never
                        // taken; synthesise the successor.
                        let next = self.find_or_create_exclude(node, id);
                        self.store.table_mut(node).edges.ensure(id).remove = Some(next);
                        next
                    } else {
                        // Add edge does not loop back, so the table does not
                        // have this id.
                        continue;
                    }
                }
            };

            let has_case = id.has_role(Role::Case);
            if let Some(out) = removed.as_mut() {
                if node != next || has_case {
                    out.push(id);
                }
            }

            node = next;
        }

        node
    }

    /// Discovers `OWNED` components on a base entity, following nested `IsA`
    /// relations.
    fn find_owned_components(&self, base: Id, owned: &mut SmallVec<[Id; 8]>) {
        let base = self.resolve(base);
        let ty: SmallVec<[Id; 16]> = SmallVec::from_slice(self.entity_type(base));

        for id in ty {
            if id.has_relation(IS_A) {
                self.find_owned_components(id.object(), owned);
            } else if id.has_role(Role::Owned) {
                let component = id.component();
                if let Some(ty) = self.components.type_of(component) {
                    owned.extend(ty.iter().copied());
                } else {
                    owned.push(component);
                }
            }
        }
    }

    /// Single-id convenience over [`traverse_add`](Self::traverse_add).
    pub fn table_add_id(&mut self, table: TableId, id: Id) -> TableId {
        self.traverse_add(table, &[id], None)
    }

    /// Single-id convenience over [`traverse_remove`](Self::traverse_remove).
    pub fn table_remove_id(&mut self, table: TableId, id: Id) -> TableId {
        self.traverse_remove(table, &[id], None)
    }

    /// Severs both directions of every edge adjacent to `table` so it can be
    /// retired.
    pub fn table_clear_edges(&mut self, table: TableId) {
        let edges = self.store.table(table).edges.occupied();

        for (id, edge) in &edges {
            if let Some(add) = edge.add {
                if add != table {
                    self.store.table_mut(add).edges.ensure(*id).remove = None;
                }
            }
            if let Some(remove) = edge.remove {
                if remove != table {
                    self.store.table_mut(remove).edges.ensure(*id).add = None;
                }
            }
        }

        self.store.table_mut(table).edges.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::World;

    fn world() -> World {
        let _ = tracing_subscriber::fmt::try_init();
        World::new()
    }

    #[test]
    fn find_or_create_is_idempotent() {
        let mut world = world();
        let a = Id::new(40);
        let b = Id::new(41);

        let t1 = world.table_find_or_create(&[a, b]);
        let t2 = world.table_find_or_create(&[a, b]);
        assert_eq!(t1, t2);

        // Unsorted input with duplicates resolves to the same table.
        let t3 = world.table_find_or_create(&[b, a, b]);
        assert_eq!(t1, t3);
    }

    #[test]
    fn empty_ids_yield_root() {
        let mut world = world();
        assert_eq!(world.table_find_or_create(&[]), TableId::ROOT);
    }

    #[test]
    fn own_ids_have_self_add_edges() {
        let mut world = world();
        let a = Id::new(40);
        let t = world.table_find_or_create(&[a]);

        let edge = world.store().table(t).edges.get(a).unwrap();
        assert_eq!(edge.add, Some(t));
        assert_eq!(edge.remove, Some(TableId::ROOT));
    }

    #[test]
    fn add_remove_round_trip() {
        let mut world = world();
        let a = Id::new(40);
        let b = Id::new(41);

        let t_a = world.table_add_id(TableId::ROOT, a);
        let t_ab = world.table_add_id(t_a, b);
        assert_eq!(world.store().table(t_ab).ids(), &[a, b]);

        let t_b = world.table_remove_id(t_ab, a);
        assert_eq!(world.store().table(t_b).ids(), &[b]);

        // Back-link created by the remove traversal.
        let edge = world.store().table(t_ab).edges.get(a).unwrap();
        assert_eq!(edge.remove, Some(t_b));
    }

    #[test]
    fn removing_absent_id_is_noop() {
        let mut world = world();
        let a = Id::new(40);
        let t_a = world.table_add_id(TableId::ROOT, a);
        assert_eq!(world.table_remove_id(t_a, Id::new(99)), t_a);
    }

    #[test]
    fn add_then_remove_returns_to_start() {
        let mut world = world();
        let a = Id::new(40);
        let b = Id::new(41);
        let t_a = world.table_add_id(TableId::ROOT, a);

        let t_ab = world.table_add_id(t_a, b);
        assert_eq!(world.table_remove_id(t_ab, b), t_a);
    }

    #[test]
    fn xor_member_is_replaced() {
        let mut world = world();
        let c1 = Id::new(60);
        let c2 = Id::new(61);
        let movement = Id::new(62);
        world.components_mut().register_type(movement, vec![c1, c2]);

        let marker = movement.with_role(Role::Xor);
        let base = world.table_find_or_create(&[Id::new(40), marker]);

        let with_c1 = world.table_add_id(base, c1);
        assert!(world.store().table(with_c1).ids().contains(&c1));

        let with_c2 = world.table_add_id(with_c1, c2);
        let ids = world.store().table(with_c2).ids();
        assert!(ids.contains(&c2));
        assert!(!ids.contains(&c1));
    }

    #[test]
    fn isa_pulls_owned_components() {
        let mut world = world();
        let pos = Id::new(40);
        let base = world.entity_new();
        world.add_id(base, pos.with_role(Role::Owned)).unwrap();

        let t = world.table_add_id(TableId::ROOT, Id::pair(IS_A, base));
        let ids = world.store().table(t).ids();
        assert!(ids.contains(&pos));
        assert!(ids.iter().any(|id| id.has_relation(IS_A)));
    }

    #[test]
    fn clear_edges_severs_backlinks() {
        let mut world = world();
        let a = Id::new(40);
        let b = Id::new(41);
        let t_a = world.table_add_id(TableId::ROOT, a);
        let t_ab = world.table_add_id(t_a, b);

        world.table_clear_edges(t_ab);

        assert!(world.store().table(t_a).edges.get(b).unwrap_or_default().add.is_none());
    }
}
