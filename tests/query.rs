use std::cell::RefCell;
use std::cmp::Ordering;
use std::convert::TryInto;
use std::rc::Rc;
use trellis_ecs::prelude::*;
use trellis_ecs::TableSlot;

fn world() -> World {
    let _ = tracing_subscriber::fmt::try_init();
    World::new()
}

fn query(world: &mut World, terms: Vec<Term>) -> trellis_ecs::QueryId {
    world
        .query_init(QueryDesc {
            terms,
            ..QueryDesc::default()
        })
        .unwrap()
}

fn collect_entities(world: &mut World, q: trellis_ecs::QueryId) -> Vec<Entity> {
    let mut out = Vec::new();
    let mut it = world.query_iter(q);
    while it.next() {
        out.extend_from_slice(it.entities());
    }
    out
}

#[test]
fn query_matches_existing_and_new_tables() {
    let mut world = world();
    let pos = Id::new(40);
    let vel = Id::new(41);

    let e1 = world.entity_new();
    world.add_id(e1, pos).unwrap();

    let q = query(&mut world, vec![Term::new(pos)]);
    assert_eq!(collect_entities(&mut world, q), vec![e1]);

    // A table created after the query is matched incrementally.
    let e2 = world.entity_new();
    world.add_ids(e2, &[pos, vel]).unwrap();
    let mut found = collect_entities(&mut world, q);
    found.sort();
    let mut expect = vec![e1, e2];
    expect.sort();
    assert_eq!(found, expect);
}

#[test]
fn empty_nonempty_transition_updates_indices() {
    let mut world = world();
    let pos = Id::new(40);

    let sys = world.entity_new();
    let activations: Rc<RefCell<Vec<bool>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = activations.clone();
    world.set_system_activate(Box::new(move |_, active| {
        sink.borrow_mut().push(active);
    }));

    let q = world
        .query_init(QueryDesc {
            terms: vec![Term::new(pos)],
            system: Some(sys),
            ..QueryDesc::default()
        })
        .unwrap();

    let e = world.entity_new();
    world.add_id(e, pos).unwrap();
    let table = world.entity_table(e).unwrap();

    {
        let query = world.query(q);
        let slots = query.table_slots(table);
        assert_eq!(slots.len(), 1);
        assert!(matches!(slots[0], TableSlot::Active(_)));
        assert_eq!(query.slot_table(slots[0]), Some(table));
    }
    assert_eq!(&*activations.borrow(), &[true]);

    // Empty the table again.
    world.remove_id(e, pos).unwrap();
    {
        let query = world.query(q);
        let slots = query.table_slots(table);
        assert_eq!(slots.len(), 1);
        assert!(matches!(slots[0], TableSlot::Empty(_)));
        assert_eq!(query.slot_table(slots[0]), Some(table));
        assert_eq!(query.active_table_count(), 0);
        assert_eq!(query.empty_table_count(), 1);
    }
    assert_eq!(&*activations.borrow(), &[true, false]);
}

#[test]
fn paged_iteration_respects_table_crossings() {
    let mut world = world();
    let pos = Id::new(40);
    let a = Id::new(41);
    let b = Id::new(42);
    let c = Id::new(43);

    // 7 entities across 4 tables of sizes 3, 2, 1, 1.
    let mut entities = Vec::new();
    for _ in 0..3 {
        let e = world.entity_new();
        world.add_id(e, pos).unwrap();
        entities.push(e);
    }
    for _ in 0..2 {
        let e = world.entity_new();
        world.add_ids(e, &[pos, a]).unwrap();
        entities.push(e);
    }
    let e = world.entity_new();
    world.add_ids(e, &[pos, b]).unwrap();
    entities.push(e);
    let e = world.entity_new();
    world.add_ids(e, &[pos, c]).unwrap();
    entities.push(e);

    let q = query(&mut world, vec![Term::new(pos)]);

    let mut visited = Vec::new();
    let mut it = world.query_iter_page(q, 2, 4);
    while it.next() {
        visited.extend_from_slice(it.entities());
    }
    drop(it);

    assert_eq!(visited, entities[2..6].to_vec());

    // Offset past the end yields nothing.
    let mut it = world.query_iter_page(q, 10, 0);
    assert!(!it.next());
}

#[test]
fn cascade_ranks_shallow_to_deep() {
    let mut world = world();
    let pos = Id::new(40);

    let parent = world.entity_new();
    world.add_id(parent, pos).unwrap();

    let child = world.entity_new();
    world.add_ids(child, &[pos, Id::pair(CHILD_OF, parent)]).unwrap();

    let grandchild = world.entity_new();
    world.add_ids(grandchild, &[pos, Id::pair(CHILD_OF, child)]).unwrap();

    let q = query(
        &mut world,
        vec![
            Term::new(pos),
            Term::new(pos)
                .with_set(SetMask::SUPERSET.union(SetMask::CASCADE))
                .with_relation(CHILD_OF)
                .with_oper(Oper::Optional),
        ],
    );

    assert_eq!(
        collect_entities(&mut world, q),
        vec![parent, child, grandchild]
    );
}

#[test]
fn order_by_sorts_across_tables() {
    let mut world = world();
    let value = Id::new(40);
    let tag = Id::new(41);
    world.register_component(value, 4);

    let mut spawn = |world: &mut World, v: u32, tagged: bool| {
        let e = world.entity_new();
        if tagged {
            world.add_ids(e, &[value, tag]).unwrap();
        } else {
            world.add_id(e, value).unwrap();
        }
        world.set(e, value, &v.to_le_bytes()).unwrap();
        e
    };

    let e5 = spawn(&mut world, 5, false);
    let e1 = spawn(&mut world, 1, false);
    let e3 = spawn(&mut world, 3, true);
    let e2 = spawn(&mut world, 2, true);

    let compare: trellis_ecs::OrderByAction = Box::new(|_, a, _, b| {
        let a = u32::from_le_bytes(a.try_into().unwrap());
        let b = u32::from_le_bytes(b.try_into().unwrap());
        a.cmp(&b)
    });

    let q = world
        .query_init(QueryDesc {
            terms: vec![Term::new(value)],
            order_by: Some((value, compare)),
            ..QueryDesc::default()
        })
        .unwrap();

    assert_eq!(collect_entities(&mut world, q), vec![e1, e2, e3, e5]);

    // Mutating the sorted component re-sorts on the next iteration.
    world.set(e1, value, &9u32.to_le_bytes()).unwrap();
    assert_eq!(collect_entities(&mut world, q), vec![e2, e3, e5, e1]);
}

#[test]
fn order_by_entity_id() {
    let mut world = world();
    let pos = Id::new(40);

    let e1 = world.entity_new();
    let e2 = world.entity_new();
    world.add_id(e2, pos).unwrap();
    world.add_id(e1, pos).unwrap();

    let compare: trellis_ecs::OrderByAction =
        Box::new(|a: Entity, _, b: Entity, _| a.cmp(&b));

    let q = world
        .query_init(QueryDesc {
            terms: vec![Term::new(pos)],
            order_by: Some((Id::NULL, compare)),
            ..QueryDesc::default()
        })
        .unwrap();

    assert_eq!(collect_entities(&mut world, q), vec![e1, e2]);
}

#[test]
fn worker_partitions_cover_all_rows_disjointly() {
    let mut world = world();
    let pos = Id::new(40);
    let tag = Id::new(41);

    for _ in 0..5 {
        let e = world.entity_new();
        world.add_id(e, pos).unwrap();
    }
    for _ in 0..3 {
        let e = world.entity_new();
        world.add_ids(e, &[pos, tag]).unwrap();
    }

    let q = query(&mut world, vec![Term::new(pos)]);
    let mut single = collect_entities(&mut world, q);

    let total = 2;
    let mut sharded = Vec::new();
    for current in 0..total {
        let mut it = world.query_iter(q);
        while it.next_worker(current, total) {
            sharded.extend_from_slice(it.entities());
        }
    }

    // Union of worker shards equals the single-worker iteration.
    single.sort();
    let mut union = sharded.clone();
    union.sort();
    let before_dedup = union.len();
    union.dedup();
    assert_eq!(union.len(), before_dedup, "worker ranges must be disjoint");
    assert_eq!(union, single);
}

#[test]
fn bitset_columns_narrow_iteration() {
    let mut world = world();
    let pos = Id::new(40);

    let mut spawn = |world: &mut World, enabled: bool| {
        let e = world.entity_new();
        world.add_id(e, pos).unwrap();
        world.enable(e, pos, enabled).unwrap();
        e
    };

    let e1 = spawn(&mut world, true);
    let _e2 = spawn(&mut world, false);
    let e3 = spawn(&mut world, true);

    let q = query(&mut world, vec![Term::new(pos)]);
    assert_eq!(collect_entities(&mut world, q), vec![e1, e3]);
}

#[test]
fn switch_case_iteration_visits_matching_rows() {
    let mut world = world();
    let walking = Id::new(60);
    let running = Id::new(61);
    let movement = Id::new(62);
    world.register_type(movement, vec![walking, running]);

    let mut spawn = |world: &mut World, case: Id| {
        let e = world.entity_new();
        world.add_id(e, movement.with_role(Role::Switch)).unwrap();
        world.add_id(e, case.with_role(Role::Case)).unwrap();
        e
    };

    let e1 = spawn(&mut world, walking);
    let _e2 = spawn(&mut world, running);
    let e3 = spawn(&mut world, walking);

    let q = query(&mut world, vec![Term::new(walking.with_role(Role::Case))]);

    let mut found = Vec::new();
    let mut it = world.query_iter(q);
    while it.next() {
        assert_eq!(it.count(), 1);
        found.extend_from_slice(it.entities());
    }
    drop(it);

    found.sort();
    let mut expect = vec![e1, e3];
    expect.sort();
    assert_eq!(found, expect);
}

#[test]
fn wildcard_query_matches_table_once_per_pair() {
    let mut world = world();
    let eats = Id::new(50);
    let apples = Id::new(51);
    let pears = Id::new(52);

    let e = world.entity_new();
    world
        .add_ids(e, &[Id::pair(eats, apples), Id::pair(eats, pears)])
        .unwrap();
    let table = world.entity_table(e).unwrap();

    let q = query(&mut world, vec![Term::new(Id::pair(eats, WILDCARD))]);

    // The table is matched once per concrete pair.
    assert_eq!(world.query(q).table_slots(table).len(), 2);

    let mut matched_ids = Vec::new();
    let mut it = world.query_iter(q);
    while it.next() {
        matched_ids.push(it.term_id(0));
    }
    drop(it);
    matched_ids.sort();
    assert_eq!(
        matched_ids,
        vec![Id::pair(eats, apples), Id::pair(eats, pears)]
    );

    // Emptying the table relocates both entries; the swap-with-last
    // bookkeeping must keep every stored index valid.
    world.remove_id(e, Id::pair(eats, pears)).unwrap();
    {
        let query = world.query(q);
        let slots = query.table_slots(table);
        assert_eq!(slots.len(), 2);
        for slot in slots {
            assert!(matches!(*slot, TableSlot::Empty(_)));
            assert_eq!(query.slot_table(*slot), Some(table));
        }
    }

    let mut frames = 0;
    let mut it = world.query_iter(q);
    while it.next() {
        frames += 1;
        assert_eq!(it.term_id(0), Id::pair(eats, apples));
    }
    drop(it);
    assert_eq!(frames, 1);
}

#[test]
fn query_changed_tracks_writes_and_matches() {
    let mut world = world();
    let pos = Id::new(40);
    world.register_component(pos, 4);

    let e = world.entity_new();
    world.add_id(e, pos).unwrap();

    // Read-only terms: a writable query dirties its own columns while
    // iterating and would always report change.
    let q = query(&mut world, vec![Term::new(pos).with_inout(InOut::In)]);
    assert!(world.query_changed(q), "fresh queries report change");

    let mut it = world.query_iter(q);
    while it.next() {}
    drop(it);
    assert!(!world.query_changed(q));

    world.set(e, pos, &1u32.to_le_bytes()).unwrap();
    assert!(world.query_changed(q));

    let mut it = world.query_iter(q);
    while it.next() {}
    drop(it);
    assert!(!world.query_changed(q));

    let e2 = world.entity_new();
    world.add_id(e2, pos).unwrap();
    assert!(world.query_changed(q));
}

#[test]
fn out_columns_mark_tables_dirty() {
    let mut world = world();
    let pos = Id::new(40);
    world.register_component(pos, 4);

    let e = world.entity_new();
    world.add_id(e, pos).unwrap();

    let read_only = query(
        &mut world,
        vec![Term::new(pos).with_inout(InOut::In)],
    );
    let writer = query(&mut world, vec![Term::new(pos)]);

    // Drain the read-only query so its baseline is current.
    let mut it = world.query_iter(read_only);
    while it.next() {}
    drop(it);
    assert!(!world.query_changed(read_only));

    // Iterating the writer bumps the column's dirty counter.
    let mut it = world.query_iter(writer);
    while it.next() {}
    drop(it);
    assert!(world.query_changed(read_only));
}

#[test]
fn subquery_matches_parent_tables_and_orphans() {
    let mut world = world();
    let pos = Id::new(40);
    let vel = Id::new(41);

    let e1 = world.entity_new();
    world.add_id(e1, pos).unwrap();
    let e2 = world.entity_new();
    world.add_ids(e2, &[pos, vel]).unwrap();

    let parent = query(&mut world, vec![Term::new(pos)]);
    let sub = world
        .query_init(QueryDesc {
            terms: vec![Term::new(pos), Term::new(vel)],
            parent: Some(parent),
            ..QueryDesc::default()
        })
        .unwrap();

    assert_eq!(collect_entities(&mut world, sub), vec![e2]);

    world.query_fini(parent);
    assert!(world.query_orphaned(sub));
}

#[test]
fn reference_queries_rematch_when_base_changes() {
    let mut world = world();
    let pos = Id::new(40);
    world.register_component(pos, 4);

    let base = world.entity_new();
    world.set(base, pos, &7u32.to_le_bytes()).unwrap();

    let inst = world.entity_new();
    world.add_id(inst, Id::pair(IS_A, base)).unwrap();

    let q = query(
        &mut world,
        vec![Term::new(pos).with_set(SetMask::SELF.union(SetMask::SUPERSET))],
    );

    // Instance matches through the base, as a shared reference.
    let mut it = world.query_iter(q);
    let mut found = Vec::new();
    while it.next() {
        found.extend_from_slice(it.entities());
        if it.term_column(0) == -1 {
            assert_eq!(it.reference(0), Some(&7u32.to_le_bytes()[..]));
        }
    }
    drop(it);
    assert!(found.contains(&inst));

    // Removing the component from the base forces a rematch that drops the
    // instance table.
    world.remove_id(base, pos).unwrap();
    assert!(!collect_entities(&mut world, q).contains(&inst));
}

#[test]
fn interrupted_iteration_stops() {
    let mut world = world();
    let pos = Id::new(40);
    let tag = Id::new(41);

    let e1 = world.entity_new();
    world.add_id(e1, pos).unwrap();
    let e2 = world.entity_new();
    world.add_ids(e2, &[pos, tag]).unwrap();

    let q = query(&mut world, vec![Term::new(pos)]);

    let mut frames = 0;
    let mut it = world.query_iter(q);
    while it.next() {
        frames += 1;
        let by = it.entities()[0];
        it.set_interrupted(by);
    }
    assert_eq!(frames, 1);
    assert_eq!(it.interrupted_by(), Some(e1));
}

#[test]
fn optional_term_exposes_missing_column() {
    let mut world = world();
    let pos = Id::new(40);
    let vel = Id::new(41);
    world.register_component(pos, 4);
    world.register_component(vel, 4);

    let e1 = world.entity_new();
    world.add_id(e1, pos).unwrap();
    let e2 = world.entity_new();
    world.add_ids(e2, &[pos, vel]).unwrap();

    let q = query(
        &mut world,
        vec![Term::new(pos), Term::new(vel).with_oper(Oper::Optional)],
    );

    let mut seen = Vec::new();
    let mut it = world.query_iter(q);
    while it.next() {
        seen.push((it.entities()[0], it.column(1).is_some()));
    }
    drop(it);

    seen.sort_by_key(|(e, _)| *e);
    let mut expect = vec![(e1, false), (e2, true)];
    expect.sort_by_key(|(e, _)| *e);
    assert_eq!(seen, expect);
}

#[test]
fn or_terms_match_either_component() {
    let mut world = world();
    let pos = Id::new(40);
    let vel = Id::new(41);
    let mass = Id::new(42);

    let e1 = world.entity_new();
    world.add_ids(e1, &[pos, vel]).unwrap();
    let e2 = world.entity_new();
    world.add_ids(e2, &[pos, mass]).unwrap();
    let e3 = world.entity_new();
    world.add_id(e3, pos).unwrap();

    let q = query(
        &mut world,
        vec![
            Term::new(pos),
            Term::new(vel).with_oper(Oper::Or),
            Term::new(mass).with_oper(Oper::Or),
        ],
    );

    let mut found = collect_entities(&mut world, q);
    found.sort();
    let mut expect = vec![e1, e2];
    expect.sort();
    assert_eq!(found, expect);
}

#[test]
fn ordering_is_stable_under_rank_and_sort() {
    let mut world = world();
    let value = Id::new(40);
    world.register_component(value, 4);

    let parent = world.entity_new();
    world.set(parent, value, &30u32.to_le_bytes()).unwrap();

    // Two children under one parent, sorted within their rank band.
    let c1 = world.entity_new();
    world.add_ids(c1, &[value, Id::pair(CHILD_OF, parent)]).unwrap();
    world.set(c1, value, &20u32.to_le_bytes()).unwrap();
    let c2 = world.entity_new();
    world.add_ids(c2, &[value, Id::pair(CHILD_OF, parent)]).unwrap();
    world.set(c2, value, &10u32.to_le_bytes()).unwrap();

    let compare: trellis_ecs::OrderByAction = Box::new(|_, a, _, b| {
        let a = u32::from_le_bytes(a.try_into().unwrap());
        let b = u32::from_le_bytes(b.try_into().unwrap());
        a.cmp(&b)
    });

    let q = world
        .query_init(QueryDesc {
            terms: vec![
                Term::new(value),
                Term::new(value)
                    .with_set(SetMask::SUPERSET.union(SetMask::CASCADE))
                    .with_relation(CHILD_OF)
                    .with_oper(Oper::Optional),
            ],
            order_by: Some((value, compare)),
            ..QueryDesc::default()
        })
        .unwrap();

    // Rank bands are emitted shallow-to-deep; rows sort inside each band.
    assert_eq!(collect_entities(&mut world, q), vec![parent, c2, c1]);
}

#[test]
fn comparator_sees_ordering_consistently() {
    // Sanity check on the Ordering-based comparator contract.
    let compare: trellis_ecs::OrderByAction = Box::new(|_, a, _, b| {
        u32::from_le_bytes(a.try_into().unwrap())
            .cmp(&u32::from_le_bytes(b.try_into().unwrap()))
    });
    assert_eq!(
        compare(Id::NULL, &1u32.to_le_bytes(), Id::NULL, &2u32.to_le_bytes()),
        Ordering::Less
    );
}
