use crate::bitset::Bitset;
use crate::graph::EdgeMap;
use crate::id::{Entity, Id, Role, DISABLED, IS_A, LAST_BUILTIN, MODULE, PREFAB};
use crate::index::{QueryId, TableId};
use crate::switch::SwitchList;
use fxhash::FxHashMap;
use std::ops::{BitOr, BitOrAssign};

/// Sizes and type definitions for component ids.
///
/// A data-bearing id has a registered size; ids without one are tags. Type
/// definitions back the `XOR`/`OR`/`NOT` constraint markers, `OWNED`
/// expansion and switch/case resolution.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    sizes: FxHashMap<u32, usize>,
    types: FxHashMap<u32, Box<[Id]>>,
}

impl ComponentRegistry {
    /// Registers `id` as a component carrying `size` bytes per row.
    pub fn register_component(&mut self, id: Id, size: usize) {
        self.sizes.insert(id.number(), size);
    }

    /// Registers `id` as a type: a named list of ids usable behind the
    /// constraint roles and `SWITCH` columns.
    pub fn register_type(&mut self, id: Id, mut ids: Vec<Id>) {
        ids.sort();
        self.types.insert(id.number(), ids.into_boxed_slice());
    }

    /// Per-row data size of an id, or `None` for tags and markers.
    ///
    /// For a pair the relation decides; when the relation is a tag the
    /// object's component type applies instead.
    pub fn component_size(&self, id: Id) -> Option<usize> {
        if id.is_pair() {
            self.sizes
                .get(&id.relation().number())
                .or_else(|| self.sizes.get(&id.object().number()))
                .copied()
                .filter(|size| *size > 0)
        } else if id.has_any_role() {
            None
        } else {
            self.sizes.get(&id.number()).copied().filter(|size| *size > 0)
        }
    }

    pub fn type_of(&self, id: Id) -> Option<&[Id]> {
        self.types.get(&id.component().number()).map(|t| &**t)
    }
}

/// Bit flags describing properties of a table's id list.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TableFlags(u32);

impl TableFlags {
    pub const NONE: TableFlags = TableFlags(0);
    pub const HAS_BUILTINS: TableFlags = TableFlags(1 << 0);
    pub const HAS_MODULE: TableFlags = TableFlags(1 << 1);
    pub const IS_PREFAB: TableFlags = TableFlags(1 << 2);
    pub const IS_DISABLED: TableFlags = TableFlags(1 << 3);
    pub const HAS_XOR: TableFlags = TableFlags(1 << 4);
    pub const HAS_BASE: TableFlags = TableFlags(1 << 5);
    pub const HAS_SWITCH: TableFlags = TableFlags(1 << 6);
    pub const HAS_DISABLED: TableFlags = TableFlags(1 << 7);
    pub const HAS_COMPONENT_DATA: TableFlags = TableFlags(1 << 8);

    #[inline]
    pub fn contains(self, other: TableFlags) -> bool { self.0 & other.0 == other.0 }
}

impl BitOr for TableFlags {
    type Output = TableFlags;
    #[inline]
    fn bitor(self, rhs: TableFlags) -> TableFlags { TableFlags(self.0 | rhs.0) }
}

impl BitOrAssign for TableFlags {
    #[inline]
    fn bitor_assign(&mut self, rhs: TableFlags) { self.0 |= rhs.0 }
}

/// Storage for one data-bearing id: a flat byte array of `size`-byte rows.
/// Tag ids keep a zero-sized placeholder so column indices line up with id
/// list positions.
#[derive(Debug, Default)]
pub struct Column {
    size: usize,
    data: Vec<u8>,
}

impl Column {
    fn new(size: usize) -> Self {
        Column {
            size,
            data: Vec::new(),
        }
    }

    #[inline]
    pub fn size(&self) -> usize { self.size }

    #[inline]
    pub fn bytes(&self) -> &[u8] { &self.data }

    #[inline]
    pub fn elem(&self, row: usize) -> &[u8] {
        &self.data[row * self.size..(row + 1) * self.size]
    }

    #[inline]
    pub fn elem_mut(&mut self, row: usize) -> &mut [u8] {
        &mut self.data[row * self.size..(row + 1) * self.size]
    }

    fn push_zeroed(&mut self) {
        if self.size > 0 {
            self.data.resize(self.data.len() + self.size, 0);
        }
    }

    fn swap_remove(&mut self, row: usize) {
        if self.size == 0 {
            return;
        }
        let last = self.data.len() / self.size - 1;
        if row != last {
            let (head, tail) = self.data.split_at_mut(last * self.size);
            head[row * self.size..(row + 1) * self.size].copy_from_slice(&tail[..self.size]);
        }
        self.data.truncate(last * self.size);
    }

    fn swap(&mut self, a: usize, b: usize) {
        if self.size == 0 || a == b {
            return;
        }
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        let (head, tail) = self.data.split_at_mut(hi * self.size);
        head[lo * self.size..(lo + 1) * self.size].swap_with_slice(&mut tail[..self.size]);
    }
}

/// The canonical container for all entities whose attached ids are exactly a
/// given id list.
///
/// A table owns one column per data-bearing id, plus switch and bitset
/// columns for `SWITCH` and `DISABLED` role ids, its add/remove edges into
/// the table graph, and a per-column dirty counter (`dirty_state[0]` tracks
/// entity moves).
#[derive(Debug)]
pub struct Table {
    pub(crate) id: TableId,
    ids: Box<[Id]>,
    flags: TableFlags,
    column_count: usize,
    sw_column_offset: usize,
    bs_column_offset: usize,
    entities: Vec<Entity>,
    columns: Vec<Column>,
    sw_columns: Vec<SwitchList>,
    bs_columns: Vec<Bitset>,
    dirty_state: Vec<u32>,
    pub(crate) queries: Vec<QueryId>,
    pub(crate) edges: EdgeMap,
}

fn data_column_count(ids: &[Id], registry: &ComponentRegistry) -> usize {
    let mut count = 0;
    for (i, id) in ids.iter().enumerate() {
        if registry.component_size(*id).is_some() {
            count = i + 1;
        }
    }
    count
}

fn compute_flags(ids: &[Id], has_data: bool) -> TableFlags {
    let mut flags = TableFlags::NONE;
    for &id in ids.iter() {
        if id.component() <= LAST_BUILTIN && !id.has_any_role() {
            flags |= TableFlags::HAS_BUILTINS;
        }
        if id == MODULE {
            flags |= TableFlags::HAS_BUILTINS | TableFlags::HAS_MODULE;
        }
        if id == PREFAB {
            flags |= TableFlags::IS_PREFAB | TableFlags::IS_DISABLED;
        }
        if id == DISABLED {
            flags |= TableFlags::IS_DISABLED;
        }
        if id.has_role(Role::Xor) {
            flags |= TableFlags::HAS_XOR;
        }
        if id.has_role(Role::Switch) {
            flags |= TableFlags::HAS_SWITCH;
        }
        if id.has_role(Role::Disabled) {
            flags |= TableFlags::HAS_DISABLED;
        }
        if id.has_relation(IS_A) {
            flags |= TableFlags::HAS_BASE;
        }
    }
    if has_data {
        flags |= TableFlags::HAS_COMPONENT_DATA;
    }
    flags
}

impl Table {
    pub(crate) fn new(id: TableId, ids: Box<[Id]>, registry: &ComponentRegistry) -> Table {
        let column_count = data_column_count(&ids, registry);
        let columns = ids[..column_count]
            .iter()
            .map(|id| Column::new(registry.component_size(*id).unwrap_or(0)))
            .collect::<Vec<_>>();

        let sw_column_offset = ids
            .iter()
            .position(|id| id.has_role(Role::Switch))
            .unwrap_or(0);
        let sw_count = ids.iter().filter(|id| id.has_role(Role::Switch)).count();
        let bs_column_offset = ids
            .iter()
            .position(|id| id.has_role(Role::Disabled))
            .unwrap_or(0);
        let bs_count = ids.iter().filter(|id| id.has_role(Role::Disabled)).count();

        let has_data = columns.iter().any(|c| c.size > 0);
        let flags = compute_flags(&ids, has_data);

        Table {
            id,
            flags,
            column_count,
            sw_column_offset,
            bs_column_offset,
            entities: Vec::new(),
            dirty_state: vec![0; column_count + 1],
            sw_columns: (0..sw_count).map(|_| SwitchList::new()).collect(),
            bs_columns: (0..bs_count).map(|_| Bitset::new()).collect(),
            columns,
            queries: Vec::new(),
            edges: EdgeMap::new(),
            ids,
        }
    }

    #[inline]
    pub fn id(&self) -> TableId { self.id }

    #[inline]
    pub fn ids(&self) -> &[Id] { &self.ids }

    #[inline]
    pub fn flags(&self) -> TableFlags { self.flags }

    pub(crate) fn add_flags(&mut self, flags: TableFlags) { self.flags |= flags; }

    #[inline]
    pub fn count(&self) -> usize { self.entities.len() }

    #[inline]
    pub fn entities(&self) -> &[Entity] { &self.entities }

    #[inline]
    pub fn column_count(&self) -> usize { self.column_count }

    #[inline]
    pub fn sw_column_count(&self) -> usize { self.sw_columns.len() }

    #[inline]
    pub fn sw_column_offset(&self) -> usize { self.sw_column_offset }

    #[inline]
    pub fn bs_column_offset(&self) -> usize { self.bs_column_offset }

    /// Position of `id` in this table's id list.
    pub fn index_of(&self, id: Id) -> Option<usize> { self.ids.iter().position(|x| *x == id) }

    /// The table reached by adding `id`, when that edge was traversed.
    pub fn add_edge(&self, id: Id) -> Option<TableId> {
        self.edges.get(id).and_then(|e| e.add)
    }

    /// The table reached by removing `id`, when that edge was traversed.
    pub fn remove_edge(&self, id: Id) -> Option<TableId> {
        self.edges.get(id).and_then(|e| e.remove)
    }

    #[inline]
    pub fn column(&self, index: usize) -> &Column { &self.columns[index] }

    #[inline]
    pub(crate) fn switch_column(&self, index: usize) -> &SwitchList { &self.sw_columns[index] }

    #[inline]
    pub(crate) fn switch_column_mut(&mut self, index: usize) -> &mut SwitchList {
        &mut self.sw_columns[index]
    }

    #[inline]
    pub(crate) fn bitset_column(&self, index: usize) -> &Bitset { &self.bs_columns[index] }

    #[inline]
    pub(crate) fn bitset_column_mut(&mut self, index: usize) -> &mut Bitset {
        &mut self.bs_columns[index]
    }

    /// Per-column change counters; slot 0 tracks entity moves.
    #[inline]
    pub fn dirty_state(&self) -> &[u32] { &self.dirty_state }

    /// Snapshot of the dirty state, used by queries for change detection.
    pub fn monitor(&self) -> Vec<u32> { self.dirty_state.clone() }

    /// Bumps the change counter of a column; 0 marks an entity move.
    pub(crate) fn mark_dirty(&mut self, state_index: usize) {
        self.dirty_state[state_index] += 1;
    }

    /// Resolves which switch column owns the given `CASE` id.
    pub(crate) fn switch_from_case(
        &self,
        case: Id,
        registry: &ComponentRegistry,
    ) -> Option<usize> {
        let case = case.component();
        for i in 0..self.sw_columns.len() {
            let sw_id = self.ids[self.sw_column_offset + i];
            debug_assert!(sw_id.has_role(Role::Switch));
            if let Some(ty) = registry.type_of(sw_id) {
                if ty.contains(&case) {
                    return Some(i);
                }
            }
        }
        None
    }

    /// Appends a row for `entity`, zero-initialising its column data.
    pub(crate) fn push_row(&mut self, entity: Entity) -> usize {
        let row = self.entities.len();
        self.entities.push(entity);
        for column in &mut self.columns {
            column.push_zeroed();
        }
        for sw in &mut self.sw_columns {
            sw.push();
        }
        for bs in &mut self.bs_columns {
            bs.push(true);
        }
        self.dirty_state[0] += 1;
        row
    }

    /// Removes a row, relocating the last row into its place. Returns the
    /// entity that was relocated, if any.
    pub(crate) fn swap_remove_row(&mut self, row: usize) -> Option<Entity> {
        self.entities.swap_remove(row);
        for column in &mut self.columns {
            column.swap_remove(row);
        }
        for sw in &mut self.sw_columns {
            sw.swap_remove(row);
        }
        for bs in &mut self.bs_columns {
            bs.swap_remove(row);
        }
        self.dirty_state[0] += 1;
        self.entities.get(row).copied()
    }

    /// Swaps two whole rows, all columns included.
    pub(crate) fn swap_rows(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.entities.swap(a, b);
        for column in &mut self.columns {
            column.swap(a, b);
        }
        for sw in &mut self.sw_columns {
            sw.swap(a, b);
        }
        for bs in &mut self.bs_columns {
            bs.swap(a, b);
        }
        self.dirty_state[0] += 1;
    }

    /// Reads the data of one row in one column, `None` for tags.
    pub fn get_bytes(&self, row: usize, column: usize) -> Option<&[u8]> {
        let col = self.columns.get(column)?;
        if col.size == 0 {
            return None;
        }
        Some(col.elem(row))
    }

    /// Writes one row of one column and bumps its change counter.
    pub(crate) fn set_bytes(&mut self, row: usize, column: usize, bytes: &[u8]) {
        let col = &mut self.columns[column];
        assert_eq!(bytes.len(), col.size, "component size mismatch");
        col.elem_mut(row).copy_from_slice(bytes);
        self.dirty_state[column + 1] += 1;
    }
}

/// Moves a row from `src` to `dst`, copying data for ids both tables share.
/// Returns the row in `dst` and the entity relocated inside `src`, if any.
pub(crate) fn move_row(
    src: &mut Table,
    dst: &mut Table,
    row: usize,
) -> (usize, Option<Entity>) {
    let entity = src.entities[row];
    let new_row = dst.push_row(entity);

    for (dst_i, dst_id) in dst.ids[..dst.column_count].iter().enumerate() {
        if dst.columns[dst_i].size == 0 {
            continue;
        }
        if let Some(src_i) = src.ids[..src.column_count].iter().position(|id| id == dst_id) {
            if src.columns[src_i].size > 0 {
                let bytes = src.columns[src_i].elem(row);
                dst.columns[dst_i].elem_mut(new_row).copy_from_slice(bytes);
            }
        }
    }

    for (dst_i, dst_id) in dst
        .ids
        .iter()
        .filter(|id| id.has_role(crate::id::Role::Switch))
        .enumerate()
    {
        if let Some(src_i) = src
            .ids
            .iter()
            .filter(|id| id.has_role(crate::id::Role::Switch))
            .position(|id| id == dst_id)
        {
            let value = src.sw_columns[src_i].get(row);
            dst.sw_columns[dst_i].set(new_row, value);
        }
    }

    for (dst_i, dst_id) in dst
        .ids
        .iter()
        .filter(|id| id.has_role(crate::id::Role::Disabled))
        .enumerate()
    {
        if let Some(src_i) = src
            .ids
            .iter()
            .filter(|id| id.has_role(crate::id::Role::Disabled))
            .position(|id| id == dst_id)
        {
            let value = src.bs_columns[src_i].get(row);
            dst.bs_columns[dst_i].set(new_row, value);
        }
    }

    let moved = src.swap_remove_row(row);
    (new_row, moved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ComponentRegistry {
        let mut reg = ComponentRegistry::default();
        reg.register_component(Id::new(40), 8);
        reg.register_component(Id::new(41), 4);
        reg
    }

    #[test]
    fn data_columns_follow_registry() {
        let reg = registry();
        let ids: Box<[Id]> = vec![Id::new(40), Id::new(41), Id::new(42)].into();
        let table = Table::new(TableId(1), ids, &reg);

        assert_eq!(table.column_count(), 2);
        assert_eq!(table.column(0).size(), 8);
        assert_eq!(table.column(1).size(), 4);
        assert_eq!(table.dirty_state().len(), 3);
    }

    #[test]
    fn push_and_swap_remove_rows() {
        let reg = registry();
        let ids: Box<[Id]> = vec![Id::new(41)].into();
        let mut table = Table::new(TableId(1), ids, &reg);

        let e1 = Id::new(1000);
        let e2 = Id::new(1001);
        table.push_row(e1);
        table.push_row(e2);
        table.set_bytes(0, 0, &1u32.to_le_bytes());
        table.set_bytes(1, 0, &2u32.to_le_bytes());

        let moved = table.swap_remove_row(0);
        assert_eq!(moved, Some(e2));
        assert_eq!(table.count(), 1);
        assert_eq!(table.get_bytes(0, 0), Some(&2u32.to_le_bytes()[..]));
    }

    #[test]
    fn move_row_copies_shared_columns() {
        let reg = registry();
        let mut src = Table::new(TableId(1), vec![Id::new(41)].into(), &reg);
        let mut dst = Table::new(TableId(2), vec![Id::new(40), Id::new(41)].into(), &reg);

        let e = Id::new(1000);
        src.push_row(e);
        src.set_bytes(0, 0, &7u32.to_le_bytes());

        let (new_row, moved) = move_row(&mut src, &mut dst, 0);
        assert_eq!(new_row, 0);
        assert_eq!(moved, None);
        assert_eq!(src.count(), 0);
        assert_eq!(dst.entities(), &[e]);
        assert_eq!(dst.get_bytes(0, 1), Some(&7u32.to_le_bytes()[..]));
        assert_eq!(dst.get_bytes(0, 0), Some(&0u64.to_le_bytes()[..]));
    }

    #[test]
    fn dirty_state_tracks_writes_and_moves() {
        let reg = registry();
        let mut table = Table::new(TableId(1), vec![Id::new(41)].into(), &reg);
        let baseline = table.monitor();

        table.push_row(Id::new(1000));
        assert_ne!(table.dirty_state()[0], baseline[0]);

        let baseline = table.monitor();
        table.set_bytes(0, 0, &5u32.to_le_bytes());
        assert_eq!(table.dirty_state()[0], baseline[0]);
        assert_ne!(table.dirty_state()[1], baseline[1]);
    }

    #[test]
    fn prefab_flag_set() {
        let reg = registry();
        let table = Table::new(TableId(1), vec![PREFAB, Id::new(40)].into(), &reg);
        assert!(table.flags().contains(TableFlags::IS_PREFAB));
        assert!(table.flags().contains(TableFlags::IS_DISABLED));
    }
}
