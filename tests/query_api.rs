use phalanx::prelude::*;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct Pos(f32, f32, f32);
#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct Rot(f32, f32, f32);
#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct Vel(f32, f32, f32);
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Flag;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn collect(query: Query, world: &mut World) -> Vec<Entity> {
    let mut entities = Vec::new();
    query.for_each_entity(world, |e| entities.push(e));
    entities
}

#[test]
fn all_and_not_terms_filter_archetypes() {
    init();
    let mut world = World::new();
    let pos = world.register::<Pos>();
    let flag = world.register::<Flag>();

    let mut tagged = Vec::new();
    for i in 0..10 {
        let e = world.create().unwrap();
        world.add(e, pos).unwrap();
        if i % 2 == 0 {
            world.add(e, flag).unwrap();
            tagged.push(e);
        }
    }

    let with_flag = world.query().all(pos).all(flag).build();
    let without_flag = world.query().all(pos).no(flag).build();
    assert_eq!(with_flag.count(&mut world), 5);
    assert_eq!(without_flag.count(&mut world), 5);

    let yielded = collect(without_flag, &mut world);
    assert!(yielded.iter().all(|e| !tagged.contains(e)));
}

#[test]
fn incremental_match_picks_up_new_archetypes() {
    init();
    let mut world = World::new();
    let pos = world.register::<Pos>();
    let flag = world.register::<Flag>();
    let rot = world.register::<Rot>();

    let entities: Vec<Entity> = (0..10)
        .map(|_| {
            let e = world.create().unwrap();
            world.add(e, pos).unwrap();
            e
        })
        .collect();

    let query = world.query().all(pos).no(flag).build();
    assert_eq!(collect(query, &mut world).len(), 10);

    for e in entities.iter().take(3) {
        world.add(*e, flag).unwrap();
    }
    assert_eq!(collect(query, &mut world).len(), 7);

    // a brand-new archetype appears after the query was first matched
    let extra = world.create().unwrap();
    world.add(extra, pos).unwrap();
    world.add(extra, rot).unwrap();
    let yielded = collect(query, &mut world);
    assert_eq!(yielded.len(), 8);
    assert!(yielded.contains(&extra));
}

#[test]
fn unchanged_worlds_yield_identical_sequences() {
    init();
    let mut world = World::new();
    let pos = world.register::<Pos>();
    let rot = world.register::<Rot>();

    for i in 0..20 {
        let e = world.create().unwrap();
        world.add(e, pos).unwrap();
        if i % 3 == 0 {
            world.add(e, rot).unwrap();
        }
    }

    let query = world.query().all(pos).build();
    let first = collect(query, &mut world);
    let second = collect(query, &mut world);
    assert_eq!(first, second);
    assert_eq!(first.len(), 20);
}

#[test]
fn change_filter_tracks_set_but_not_sset() {
    init();
    let mut world = World::new();
    let pos = world.register::<Pos>();

    let entities: Vec<Entity> = (0..100)
        .map(|_| {
            let e = world.create().unwrap();
            world.add(e, pos).unwrap();
            e
        })
        .collect();

    let query = world.query().all(pos).changed(pos).build();

    // the first run observes everything
    assert_eq!(collect(query, &mut world).len(), 100);
    // nothing was written since
    assert_eq!(collect(query, &mut world).len(), 0);

    // one write re-yields the whole containing chunk
    world.set_as(entities[7], pos, Pos(1.0, 0.0, 0.0));
    let yielded = collect(query, &mut world);
    assert!(!yielded.is_empty());
    assert!(yielded.contains(&entities[7]));
    assert_eq!(collect(query, &mut world).len(), 0);

    // a silent set stays invisible
    world.sset_as(entities[7], pos, Pos(2.0, 0.0, 0.0));
    assert_eq!(collect(query, &mut world).len(), 0);
    assert_eq!(
        world.get_as::<Pos>(entities[7], pos),
        Some(&Pos(2.0, 0.0, 0.0))
    );
}

#[test]
fn writes_through_a_view_trigger_change_filters() {
    init();
    let mut world = World::new();
    let pos = world.register::<Pos>();

    for _ in 0..10 {
        let e = world.create().unwrap();
        world.add(e, pos).unwrap();
    }

    let writer = world.query().all_mut(pos).build();
    let watcher = world.query().all(pos).changed(pos).build();

    assert_eq!(collect(watcher, &mut world).len(), 10);
    assert_eq!(collect(watcher, &mut world).len(), 0);

    writer.for_each_chunk(&mut world, |mut view| {
        for p in view.column_mut::<Pos>(0) {
            p.0 += 1.0;
        }
    });
    assert_eq!(collect(watcher, &mut world).len(), 10);
    assert_eq!(collect(watcher, &mut world).len(), 0);
}

#[test]
fn any_terms_accept_either_component() {
    init();
    let mut world = World::new();
    let pos = world.register::<Pos>();
    let rot = world.register::<Rot>();
    let vel = world.register::<Vel>();

    let a = world.create().unwrap();
    world.add(a, pos).unwrap();
    world.add(a, rot).unwrap();

    let b = world.create().unwrap();
    world.add(b, pos).unwrap();
    world.add(b, vel).unwrap();

    let c = world.create().unwrap();
    world.add(c, pos).unwrap();

    let query = world.query().all(pos).any(rot).any(vel).build();
    let yielded = collect(query, &mut world);
    assert_eq!(yielded.len(), 2);
    assert!(yielded.contains(&a));
    assert!(yielded.contains(&b));
}

#[test]
fn disabled_entities_are_skipped_by_default() {
    init();
    let mut world = World::new();
    let pos = world.register::<Pos>();

    let entities: Vec<Entity> = (0..6)
        .map(|_| {
            let e = world.create().unwrap();
            world.add(e, pos).unwrap();
            e
        })
        .collect();
    world.enable(entities[1], false);
    world.enable(entities[4], false);

    let enabled = world.query().all(pos).build();
    let disabled = world
        .query()
        .all(pos)
        .constraint(Constraint::Disabled)
        .build();
    let everyone = world.query().all(pos).constraint(Constraint::All).build();

    assert_eq!(enabled.count(&mut world), 4);
    assert_eq!(disabled.count(&mut world), 2);
    assert_eq!(everyone.count(&mut world), 6);

    let yielded = collect(disabled, &mut world);
    assert!(yielded.contains(&entities[1]));
    assert!(yielded.contains(&entities[4]));

    world.enable(entities[1], true);
    assert_eq!(enabled.count(&mut world), 5);
    assert_eq!(disabled.count(&mut world), 1);
}

#[test]
fn equivalent_queries_are_interned_once() {
    init();
    let mut world = World::new();
    let pos = world.register::<Pos>();
    let rot = world.register::<Rot>();

    let a = world.query().all(pos).no(rot).build();
    let b = world.query().no(rot).all(pos).build();
    assert_eq!(a, b);

    let c = world.query().all(pos).all(rot).build();
    assert_ne!(a, c);
}

#[test]
fn group_by_orders_the_archetype_cache() {
    init();
    let mut world = World::new();
    let pos = world.register::<Pos>();
    let rot = world.register::<Rot>();
    let vel = world.register::<Vel>();

    // archetype creation order deliberately differs from group order
    let wide = world.create().unwrap();
    world.add(wide, vel).unwrap();
    world.add(wide, rot).unwrap();
    world.add(wide, pos).unwrap();

    let narrow = world.create().unwrap();
    world.add(narrow, pos).unwrap();

    let middle = world.create().unwrap();
    world.add(middle, rot).unwrap();
    world.add(middle, pos).unwrap();

    fn by_component_count(ids: &[Entity], _group_by: Entity) -> u64 { ids.len() as u64 }

    let query = world
        .query()
        .all(pos)
        .group_by(pos, by_component_count)
        .build();
    let yielded = collect(query, &mut world);
    assert_eq!(yielded, vec![narrow, middle, wide]);
}

#[test]
fn pair_wildcard_terms_match_any_target() {
    init();
    let mut world = World::new();
    let likes = world.register::<Pos>();
    let apple = world.create().unwrap();
    let pear = world.create().unwrap();

    let a = world.create().unwrap();
    world.add(a, Entity::pair(likes, apple)).unwrap();
    let b = world.create().unwrap();
    world.add(b, Entity::pair(likes, pear)).unwrap();
    let c = world.create().unwrap();
    world.add(c, likes).unwrap();

    let anyone = world
        .query()
        .all(Entity::pair(likes, Entity::WILDCARD))
        .build();
    let yielded = collect(anyone, &mut world);
    assert_eq!(yielded.len(), 2);
    assert!(yielded.contains(&a));
    assert!(yielded.contains(&b));

    let apple_only = world.query().all(Entity::pair(likes, apple)).build();
    assert_eq!(collect(apple_only, &mut world), vec![a]);
}

#[test]
fn match_now_without_iteration_updates_the_cache() {
    init();
    let mut world = World::new();
    let pos = world.register::<Pos>();

    let query = world.query().all(pos).build();
    assert!(query.is_empty(&mut world));

    let e = world.create().unwrap();
    world.add(e, pos).unwrap();
    query.match_now(&mut world);
    assert_eq!(query.count(&mut world), 1);
}
