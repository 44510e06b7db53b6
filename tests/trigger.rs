use std::cell::RefCell;
use std::rc::Rc;
use trellis_ecs::prelude::*;

fn world() -> World {
    let _ = tracing_subscriber::fmt::try_init();
    World::new()
}

type Log = Rc<RefCell<Vec<(Id, Id)>>>;

fn logging_trigger(world: &mut World, term: Term, events: Vec<Id>) -> Log {
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    let sink = log.clone();
    world
        .trigger_init(TriggerDesc {
            term: Some(term),
            events,
            callback: Some(Box::new(move |frame| {
                sink.borrow_mut().push((frame.event, frame.id));
            })),
            ..TriggerDesc::default()
        })
        .unwrap();
    log
}

#[test]
fn wildcard_object_matches_any_relation() {
    let mut world = world();
    let eats = Id::new(50);
    let likes = Id::new(51);
    let apples = Id::new(52);
    let pears = Id::new(53);

    let log = logging_trigger(
        &mut world,
        Term::new(Id::pair(WILDCARD, apples)),
        vec![ON_ADD],
    );

    let e = world.entity_new();
    world.add_id(e, Id::pair(eats, apples)).unwrap();
    world.add_id(e, Id::pair(likes, apples)).unwrap();
    world.add_id(e, Id::pair(eats, pears)).unwrap();

    let log = log.borrow();
    assert_eq!(
        &**log,
        &[
            (ON_ADD, Id::pair(eats, apples)),
            (ON_ADD, Id::pair(likes, apples)),
        ]
    );
}

#[test]
fn full_wildcard_pair_sees_every_pair_but_no_plain_ids() {
    let mut world = world();
    let eats = Id::new(50);
    let apples = Id::new(52);
    let pos = Id::new(40);

    let log = logging_trigger(
        &mut world,
        Term::new(Id::pair(WILDCARD, WILDCARD)),
        vec![ON_ADD],
    );

    let e = world.entity_new();
    world.add_id(e, pos).unwrap();
    world.add_id(e, Id::pair(eats, apples)).unwrap();

    let log = log.borrow();
    assert_eq!(&**log, &[(ON_ADD, Id::pair(eats, apples))]);
}

#[test]
fn plain_wildcard_sees_plain_ids() {
    let mut world = world();
    let pos = Id::new(40);
    let eats = Id::new(50);
    let apples = Id::new(52);

    let log = logging_trigger(&mut world, Term::new(WILDCARD), vec![ON_ADD]);

    let e = world.entity_new();
    world.add_id(e, pos).unwrap();
    world.add_id(e, Id::pair(eats, apples)).unwrap();

    let log = log.borrow();
    assert_eq!(&**log, &[(ON_ADD, pos)]);
}

#[test]
fn delete_fires_remove_for_every_id() {
    let mut world = world();
    let pos = Id::new(40);
    let vel = Id::new(41);

    let log = logging_trigger(&mut world, Term::new(WILDCARD), vec![ON_REMOVE]);

    let e = world.entity_new();
    world.add_ids(e, &[pos, vel]).unwrap();
    world.delete(e);

    let log = log.borrow();
    assert_eq!(&**log, &[(ON_REMOVE, pos), (ON_REMOVE, vel)]);
}

#[test]
fn trigger_dies_with_backing_entity() {
    let mut world = world();
    let pos = Id::new(40);

    let backing = world.entity_new();
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    let sink = log.clone();
    let tid = world
        .trigger_init(TriggerDesc {
            term: Some(Term::new(pos)),
            events: vec![ON_ADD],
            entity: Some(backing),
            callback: Some(Box::new(move |frame| {
                sink.borrow_mut().push((frame.event, frame.id));
            })),
            ..TriggerDesc::default()
        })
        .unwrap();

    world.delete(backing);
    assert!(world.trigger(tid).is_none());

    let e = world.entity_new();
    world.add_id(e, pos).unwrap();
    assert!(log.borrow().is_empty());
}

#[test]
fn triggers_observe_both_sides_of_a_move() {
    let mut world = world();
    let pos = Id::new(40);
    let vel = Id::new(41);

    let adds = logging_trigger(&mut world, Term::new(vel), vec![ON_ADD]);
    let removes = logging_trigger(&mut world, Term::new(vel), vec![ON_REMOVE]);

    let e = world.entity_new();
    world.add_id(e, pos).unwrap();
    world.add_id(e, vel).unwrap();
    world.remove_id(e, vel).unwrap();

    assert_eq!(&**adds.borrow(), &[(ON_ADD, vel)]);
    assert_eq!(&**removes.borrow(), &[(ON_REMOVE, vel)]);
}
