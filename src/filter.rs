use crate::entity::EntityAllocator;
use crate::graph::TableStore;
use crate::id::{Entity, Id, Role, DISABLED, IS_A, PREFAB, THIS};
use crate::table::{ComponentRegistry, Table, TableFlags};
use smallvec::SmallVec;
use thiserror::Error;

/// Which entities a term's subject may be substituted with.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SetMask(u8);

impl SetMask {
    pub const DEFAULT: SetMask = SetMask(0);
    pub const SELF: SetMask = SetMask(1);
    pub const SUPERSET: SetMask = SetMask(2);
    pub const SUBSET: SetMask = SetMask(4);
    pub const CASCADE: SetMask = SetMask(8);

    #[inline]
    pub fn contains(self, other: SetMask) -> bool { self.0 & other.0 == other.0 }

    #[inline]
    pub fn union(self, other: SetMask) -> SetMask { SetMask(self.0 | other.0) }
}

/// Term operators.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Oper {
    And,
    Or,
    Optional,
    Not,
}

impl Default for Oper {
    fn default() -> Self { Oper::And }
}

/// Access direction of a term.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InOut {
    Default,
    InOut,
    In,
    Out,
}

impl Default for InOut {
    fn default() -> Self { InOut::Default }
}

/// Describes one position of a term: predicate, subject or object.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TermRef {
    pub entity: Id,
    pub is_variable: bool,
    pub set: SetMask,
    /// Relation followed for `SUPERSET` substitution; defaults to `IsA`.
    pub relation: Id,
    pub min_depth: i32,
    pub max_depth: i32,
}

impl Default for TermRef {
    fn default() -> Self {
        TermRef {
            entity: Id::NULL,
            is_variable: false,
            set: SetMask::DEFAULT,
            relation: Id::NULL,
            min_depth: 0,
            max_depth: 0,
        }
    }
}

/// One condition of a filter.
#[derive(Clone, Debug, Default)]
pub struct Term {
    pub id: Id,
    pub pred: TermRef,
    pub subj: TermRef,
    pub obj: TermRef,
    pub oper: Oper,
    pub inout: InOut,
}

impl Term {
    pub fn new(id: Id) -> Term {
        Term {
            id,
            subj: TermRef {
                entity: THIS,
                ..TermRef::default()
            },
            ..Term::default()
        }
    }

    pub fn with_oper(mut self, oper: Oper) -> Term {
        self.oper = oper;
        self
    }

    pub fn with_inout(mut self, inout: InOut) -> Term {
        self.inout = inout;
        self
    }

    pub fn with_subject(mut self, entity: Id) -> Term {
        self.subj.entity = entity;
        self
    }

    pub fn with_set(mut self, set: SetMask) -> Term {
        self.subj.set = set;
        self
    }

    pub fn with_relation(mut self, relation: Id) -> Term {
        self.subj.relation = relation;
        self
    }

    /// True for pair terms with a wildcard in either position.
    pub fn is_wildcard_pair(&self) -> bool {
        if !self.id.is_pair() {
            return false;
        }
        let obj = self.id.object();
        obj.is_null() || obj.number() == crate::id::WILDCARD.number()
            || self.id.relation().number() == crate::id::WILDCARD.number()
    }

    pub(crate) fn finalize(&mut self) -> Result<(), FilterError> {
        if self.pred.is_variable || self.subj.is_variable || self.obj.is_variable {
            return Err(FilterError::VariableNotSupported);
        }
        if self.pred.set.contains(SetMask::SUBSET)
            || self.subj.set.contains(SetMask::SUBSET)
            || self.obj.set.contains(SetMask::SUBSET)
        {
            return Err(FilterError::SubSetNotSupported);
        }
        if self.pred.set != SetMask::DEFAULT || self.obj.set != SetMask::DEFAULT {
            return Err(FilterError::NonDefaultSet);
        }

        if self.id.is_null() {
            if self.pred.entity.is_null() {
                return Err(FilterError::MissingPredicate);
            }
            self.id = if self.obj.entity.is_null() {
                self.pred.entity
            } else {
                Id::pair(self.pred.entity, self.obj.entity)
            };
        } else if self.pred.entity.is_null() {
            self.pred.entity = if self.id.is_pair() { self.id.relation() } else { self.id };
        }

        if self.subj.entity.is_null() {
            self.subj.entity = THIS;
        }
        if self.subj.set == SetMask::DEFAULT {
            self.subj.set = SetMask::SELF;
        }
        if self.subj.set.contains(SetMask::SUPERSET) && self.subj.relation.is_null() {
            self.subj.relation = IS_A;
        }
        // If self is excluded from the traversal, start at depth 1.
        if self.subj.min_depth == 0 && !self.subj.set.contains(SetMask::SELF) {
            self.subj.min_depth = 1;
        }

        Ok(())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FilterError {
    #[error("variables are not supported")]
    VariableNotSupported,
    #[error("subset substitution is not supported")]
    SubSetNotSupported,
    #[error("predicate and object must use the default set")]
    NonDefaultSet,
    #[error("term is missing a predicate")]
    MissingPredicate,
}

/// An ordered list of terms matched against tables.
#[derive(Clone, Debug, Default)]
pub struct Filter {
    pub(crate) terms: Vec<Term>,
    pub(crate) name: Option<String>,
    pub(crate) match_prefab: bool,
    pub(crate) match_disabled: bool,
}

impl Filter {
    pub fn new(mut terms: Vec<Term>) -> Result<Filter, FilterError> {
        for term in &mut terms {
            term.finalize()?;
        }

        let mentions = |id: Id| {
            terms.iter().any(|t| {
                t.id == id && matches!(t.oper, Oper::And | Oper::Or | Oper::Optional)
            })
        };
        let match_prefab = mentions(PREFAB);
        let match_disabled = mentions(DISABLED);

        Ok(Filter {
            terms,
            name: None,
            match_prefab,
            match_disabled,
        })
    }

    pub fn named(mut self, name: impl Into<String>) -> Filter {
        self.name = Some(name.into());
        self
    }

    pub fn terms(&self) -> &[Term] { &self.terms }

    /// Number of term slots after contiguous `Or` groups collapse into one.
    pub fn term_count_actual(&self) -> usize {
        let mut count = 0;
        let mut i = 0;
        while i < self.terms.len() {
            count += 1;
            if self.terms[i].oper == Oper::Or {
                while i < self.terms.len() && self.terms[i].oper == Oper::Or {
                    i += 1;
                }
            } else {
                i += 1;
            }
        }
        count
    }

    /// Whether any term can resolve to an entity other than the row entity.
    pub(crate) fn has_refs(&self) -> bool {
        self.terms.iter().any(|term| {
            if term.oper == Oper::Not && term.subj.entity.is_null() {
                return true;
            }
            // A specific subject, or a subject substitutable through a
            // superset traversal, can produce references.
            !term.subj.entity.is_null()
                && (term.subj.entity != THIS || term.subj.set != SetMask::SELF)
        })
    }

    pub(crate) fn has_wildcard_pairs(&self) -> bool {
        self.terms.iter().any(Term::is_wildcard_pair)
    }
}

/// Per-(query, table) match result: for each term slot the concrete id
/// matched, the subject it resolved on (`NULL` = the row entity), the
/// component size, and the column index inside the table (−1 when the term
/// is absent or satisfied by a shared entity).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CachedType {
    pub ids: Vec<Id>,
    pub subjects: Vec<Entity>,
    pub sizes: Vec<usize>,
    pub type_map: Vec<i32>,
}

impl CachedType {
    fn push(&mut self, id: Id, subject: Entity, size: usize, column: i32) {
        self.ids.push(id);
        self.subjects.push(subject);
        self.sizes.push(size);
        self.type_map.push(column);
    }
}

/// Read-only view of the world state the matcher needs: tables, component
/// sizes and entity locations.
#[derive(Copy, Clone)]
pub(crate) struct MatchCtx<'a> {
    pub store: &'a TableStore,
    pub components: &'a ComponentRegistry,
    pub entities: &'a EntityAllocator,
}

const EMPTY_TYPE: &[Id] = &[];

impl<'a> MatchCtx<'a> {
    /// The id list of the table an entity lives in.
    pub fn type_of(&self, entity: Entity) -> &'a [Id] {
        match self.entities.get_location(entity.number()) {
            Some(location) => self.store.table(location.table()).ids(),
            None => EMPTY_TYPE,
        }
    }

    /// Re-attaches the live generation to a bare entity number.
    pub fn resolve(&self, entity: Id) -> Entity {
        self.entities.resolve(entity.number()).unwrap_or(entity)
    }
}

struct TermMatch {
    id: Id,
    subject: Entity,
    size: usize,
    column: i32,
}

fn find_in_ids(ids: &[Id], pattern: Id) -> Option<(usize, Id)> {
    ids.iter()
        .position(|id| pattern.matches(*id))
        .map(|i| (i, ids[i]))
}

/// A `CASE` pattern matches the switch column whose type owns the case.
fn find_case_in_ids(
    ctx: &MatchCtx<'_>,
    ids: &[Id],
    pattern: Id,
) -> Option<(usize, Id)> {
    let case = pattern.component();
    for (i, id) in ids.iter().enumerate() {
        if !id.has_role(Role::Switch) {
            continue;
        }
        if let Some(ty) = ctx.components.type_of(*id) {
            if ty.contains(&case) {
                return Some((i, pattern));
            }
        }
    }
    None
}

/// Searches for `pattern` on entities reachable from `ids` over `relation`
/// pairs, within the depth bounds. Returns the holder entity.
fn search_relation(
    ctx: &MatchCtx<'_>,
    ids: &[Id],
    pattern: Id,
    relation: Id,
    depth: i32,
    min_depth: i32,
    max_depth: i32,
) -> Option<(Entity, Id)> {
    for &id in ids {
        if !id.has_relation(relation) {
            continue;
        }
        let base = ctx.resolve(id.object());
        let base_ids = ctx.type_of(base);

        if depth + 1 >= min_depth {
            if let Some((_, concrete)) = find_in_ids(base_ids, pattern) {
                return Some((base, concrete));
            }
        }
        if max_depth == 0 || depth + 1 < max_depth {
            if let Some(found) =
                search_relation(ctx, base_ids, pattern, relation, depth + 1, min_depth, max_depth)
            {
                return Some(found);
            }
        }
    }
    None
}

/// Finds the base entity a table inherits `component` from over `IsA`,
/// used by ordered iteration when the sort component is shared.
pub(crate) fn shared_component_holder(
    ctx: &MatchCtx<'_>,
    ids: &[Id],
    component: Id,
) -> Option<Entity> {
    search_relation(ctx, ids, component, IS_A, 0, 1, 0).map(|(holder, _)| holder)
}

/// Decides whether one term is satisfied. `pin` overrides the term's id with
/// a concrete id, used for wildcard expansion.
fn match_term(
    ctx: &MatchCtx<'_>,
    term: &Term,
    table_ids: Option<&[Id]>,
    pin: Option<Id>,
) -> Option<TermMatch> {
    let pattern = pin.unwrap_or(term.id);

    let (ids, this) = if term.subj.entity == THIS {
        (table_ids?, true)
    } else {
        (ctx.type_of(ctx.resolve(term.subj.entity)), false)
    };

    if term.subj.set.contains(SetMask::SELF) && term.subj.min_depth <= 0 {
        let found = if pattern.has_role(Role::Case) {
            find_case_in_ids(ctx, ids, pattern)
        } else {
            find_in_ids(ids, pattern)
        };
        if let Some((index, concrete)) = found {
            let size = ctx.components.component_size(concrete).unwrap_or(0);
            return Some(TermMatch {
                id: concrete,
                subject: if this { Id::NULL } else { ctx.resolve(term.subj.entity) },
                size,
                column: if this { index as i32 } else { -1 },
            });
        }
    }

    if term.subj.set.contains(SetMask::SUPERSET) {
        if let Some((holder, concrete)) = search_relation(
            ctx,
            ids,
            pattern,
            term.subj.relation,
            0,
            term.subj.min_depth,
            term.subj.max_depth,
        ) {
            let size = ctx.components.component_size(concrete).unwrap_or(0);
            return Some(TermMatch {
                id: concrete,
                subject: holder,
                size,
                column: -1,
            });
        }
    }

    None
}

/// Matches a filter against a table's id list and produces the cached type,
/// or `None` on mismatch. `table` of `None` is the stub match used to
/// pre-resolve references for queries without `This` subjects.
pub(crate) fn match_filter(
    ctx: &MatchCtx<'_>,
    filter: &Filter,
    table: Option<&Table>,
    pin: Option<(usize, Id)>,
) -> Option<CachedType> {
    if let Some(table) = table {
        let flags = table.flags();
        if flags.contains(TableFlags::IS_PREFAB) && !filter.match_prefab {
            return None;
        }
        if flags.contains(TableFlags::IS_DISABLED) && !filter.match_disabled {
            return None;
        }
    }

    let table_ids = table.map(Table::ids);
    let mut out = CachedType::default();

    let mut i = 0;
    while i < filter.terms.len() {
        let term = &filter.terms[i];

        if term.oper == Oper::Or {
            let mut matched = None;
            while i < filter.terms.len() && filter.terms[i].oper == Oper::Or {
                if matched.is_none() {
                    matched = match_term(ctx, &filter.terms[i], table_ids, None);
                }
                i += 1;
            }
            let m = matched?;
            out.push(m.id, m.subject, m.size, m.column);
            continue;
        }

        let term_pin = pin.and_then(|(t, id)| if t == i { Some(id) } else { None });
        let matched = match_term(ctx, term, table_ids, term_pin);
        match term.oper {
            Oper::And => {
                let m = matched?;
                out.push(m.id, m.subject, m.size, m.column);
            }
            Oper::Not => {
                if matched.is_some() {
                    return None;
                }
                out.push(term.id, Id::NULL, 0, -1);
            }
            Oper::Optional => match matched {
                Some(m) => out.push(m.id, m.subject, m.size, m.column),
                None => out.push(term.id, Id::NULL, 0, -1),
            },
            Oper::Or => unreachable!(),
        }
        i += 1;
    }

    Some(out)
}

/// All cached types a table produces for a filter: wildcard terms expand to
/// one match per concrete id they resolve to.
pub(crate) fn match_filter_multi(
    ctx: &MatchCtx<'_>,
    filter: &Filter,
    table: Option<&Table>,
) -> SmallVec<[CachedType; 1]> {
    let mut out = SmallVec::new();

    let wildcard_term = filter.terms.iter().position(|term| {
        term.is_wildcard_pair() && term.subj.entity == THIS && term.oper != Oper::Not
    });

    let (term_index, table) = match (wildcard_term, table) {
        (Some(t), Some(table)) => (t, table),
        _ => {
            if let Some(cached) = match_filter(ctx, filter, table, None) {
                out.push(cached);
            }
            return out;
        }
    };

    let pattern = filter.terms[term_index].id;
    for &id in table.ids() {
        if pattern.matches(id) {
            if let Some(cached) = match_filter(ctx, filter, Some(table), Some((term_index, id))) {
                out.push(cached);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{Role, WILDCARD};
    use crate::world::World;

    fn world() -> World {
        let _ = tracing_subscriber::fmt::try_init();
        World::new()
    }

    fn match_table(world: &World, filter: &Filter, table: crate::index::TableId) -> Option<CachedType> {
        let ctx = world.match_ctx();
        match_filter(&ctx, filter, Some(world.store().table(table)), None)
    }

    #[test]
    fn finalize_defaults_subject_to_this_self() {
        let filter = Filter::new(vec![Term::new(Id::new(40))]).unwrap();
        let term = &filter.terms()[0];
        assert_eq!(term.subj.entity, THIS);
        assert_eq!(term.subj.set, SetMask::SELF);
    }

    #[test]
    fn superset_without_self_starts_at_depth_one() {
        let filter = Filter::new(vec![
            Term::new(Id::new(40)).with_set(SetMask::SUPERSET)
        ])
        .unwrap();
        let term = &filter.terms()[0];
        assert_eq!(term.subj.min_depth, 1);
        assert_eq!(term.subj.relation, IS_A);
    }

    #[test]
    fn variables_are_rejected() {
        let mut term = Term::new(Id::new(40));
        term.subj.is_variable = true;
        assert_eq!(Filter::new(vec![term]).unwrap_err(), FilterError::VariableNotSupported);
    }

    #[test]
    fn and_term_matches_own_id() {
        let mut world = world();
        let pos = Id::new(40);
        world.register_component(pos, 8);
        let t = world.table_find_or_create(&[pos]);

        let filter = Filter::new(vec![Term::new(pos)]).unwrap();
        let cached = match_table(&world, &filter, t).unwrap();
        assert_eq!(cached.ids, vec![pos]);
        assert_eq!(cached.type_map, vec![0]);
        assert_eq!(cached.sizes, vec![8]);
        assert_eq!(cached.subjects, vec![Id::NULL]);
    }

    #[test]
    fn not_term_rejects_presence() {
        let mut world = world();
        let pos = Id::new(40);
        let vel = Id::new(41);
        let t = world.table_find_or_create(&[pos, vel]);

        let filter =
            Filter::new(vec![Term::new(pos), Term::new(vel).with_oper(Oper::Not)]).unwrap();
        assert!(match_table(&world, &filter, t).is_none());

        let t2 = world.table_find_or_create(&[pos]);
        let cached = match_table(&world, &filter, t2).unwrap();
        assert_eq!(cached.type_map, vec![0, -1]);
    }

    #[test]
    fn optional_never_rejects() {
        let mut world = world();
        let pos = Id::new(40);
        let vel = Id::new(41);
        let t = world.table_find_or_create(&[pos]);

        let filter =
            Filter::new(vec![Term::new(pos), Term::new(vel).with_oper(Oper::Optional)]).unwrap();
        let cached = match_table(&world, &filter, t).unwrap();
        assert_eq!(cached.type_map, vec![0, -1]);
    }

    #[test]
    fn or_group_collapses_to_one_slot() {
        let mut world = world();
        let pos = Id::new(40);
        let vel = Id::new(41);
        let mass = Id::new(42);
        let t = world.table_find_or_create(&[pos, mass]);

        let filter = Filter::new(vec![
            Term::new(pos),
            Term::new(vel).with_oper(Oper::Or),
            Term::new(mass).with_oper(Oper::Or),
        ])
        .unwrap();
        assert_eq!(filter.term_count_actual(), 2);

        let cached = match_table(&world, &filter, t).unwrap();
        assert_eq!(cached.ids, vec![pos, mass]);

        let t2 = world.table_find_or_create(&[pos]);
        assert!(match_table(&world, &filter, t2).is_none());
    }

    #[test]
    fn superset_resolves_on_base() {
        let mut world = world();
        let pos = Id::new(40);
        world.register_component(pos, 8);

        let base = world.entity_new();
        world.add_id(base, pos).unwrap();
        let instance = world.entity_new();
        world.add_id(instance, Id::pair(IS_A, base)).unwrap();

        let filter = Filter::new(vec![
            Term::new(pos).with_set(SetMask::SELF.union(SetMask::SUPERSET))
        ])
        .unwrap();

        let t = world.entity_table(instance).unwrap();
        let cached = match_table(&world, &filter, t).unwrap();
        assert_eq!(cached.type_map, vec![-1]);
        assert_eq!(cached.subjects, vec![base]);
    }

    #[test]
    fn prefab_tables_excluded_by_default() {
        let mut world = world();
        let pos = Id::new(40);
        let t = world.table_find_or_create(&[pos, PREFAB]);

        let filter = Filter::new(vec![Term::new(pos)]).unwrap();
        assert!(match_table(&world, &filter, t).is_none());

        let filter = Filter::new(vec![Term::new(pos), Term::new(PREFAB)]).unwrap();
        assert!(filter.match_prefab);
        assert!(match_table(&world, &filter, t).is_some());
    }

    #[test]
    fn wildcard_pair_expands_per_concrete_id() {
        let mut world = world();
        let eats = Id::new(50);
        let apples = Id::new(51);
        let pears = Id::new(52);
        let t = world.table_find_or_create(&[
            Id::pair(eats, apples),
            Id::pair(eats, pears),
        ]);

        let filter = Filter::new(vec![Term::new(Id::pair(eats, WILDCARD))]).unwrap();
        let ctx = world.match_ctx();
        let matches = match_filter_multi(&ctx, &filter, Some(world.store().table(t)));
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].ids, vec![Id::pair(eats, apples)]);
        assert_eq!(matches[1].ids, vec![Id::pair(eats, pears)]);
    }

    #[test]
    fn specific_subject_is_shared_reference() {
        let mut world = world();
        let config = Id::new(40);
        world.register_component(config, 4);
        let holder = world.entity_new();
        world.add_id(holder, config).unwrap();

        let filter = Filter::new(vec![Term::new(config).with_subject(holder)]).unwrap();
        let ctx = world.match_ctx();
        let cached = match_filter(&ctx, &filter, None, None).unwrap();
        assert_eq!(cached.type_map, vec![-1]);
        assert_eq!(cached.subjects, vec![holder]);
    }

    #[test]
    fn switch_case_term_matches_case_role() {
        let mut world = world();
        let walking = Id::new(60);
        let running = Id::new(61);
        let movement = Id::new(62);
        world.register_type(movement, vec![walking, running]);

        let t = world.table_find_or_create(&[
            Id::new(40),
            movement.with_role(Role::Switch),
        ]);

        let filter = Filter::new(vec![
            Term::new(movement.with_role(Role::Switch))
        ])
        .unwrap();
        assert!(match_table(&world, &filter, t).is_some());

        // A CASE term resolves to the switch column that owns the case.
        let filter = Filter::new(vec![
            Term::new(walking.with_role(Role::Case))
        ])
        .unwrap();
        let cached = match_table(&world, &filter, t).unwrap();
        assert_eq!(cached.ids, vec![walking.with_role(Role::Case)]);
        assert_eq!(cached.type_map, vec![1]);

        let filter = Filter::new(vec![
            Term::new(Id::new(99).with_role(Role::Case))
        ])
        .unwrap();
        assert!(match_table(&world, &filter, t).is_none());
    }
}
