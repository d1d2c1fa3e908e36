//! Property tests for tier nesting and z-order bookkeeping

mod support;

use std::collections::HashSet;

use proptest::prelude::*;

use mapstream::geo::{Bbox, Projection};
use mapstream::map::list::{Selection, WarpedMapList};
use mapstream::map::options::MapOptions;
use mapstream::map::requirements::{find_maps, Tier};
use mapstream::{MapId, MapSystemConfig, Viewport};
use support::square_map;

fn plate_carree_list() -> WarpedMapList {
    let mut list = WarpedMapList::default();
    list.set_default_options(MapOptions {
        projection: Some(Projection::Equirectangular),
        ..Default::default()
    });
    list
}

fn list_with(maps: &[(f64, f64, f64)]) -> WarpedMapList {
    let mut list = plate_carree_list();
    for (i, (x, y, size)) in maps.iter().enumerate() {
        list.add_map(square_map(&format!("m{i}"), [*x, *y], *size)).unwrap();
    }
    list
}

fn assert_dense_z(list: &WarpedMapList) {
    let mut seen: Vec<usize> = list
        .get_map_ids(&Selection::all())
        .iter()
        .map(|id| list.get_z_index(id).unwrap())
        .collect();
    seen.sort();
    assert_eq!(seen, (0..list.len()).collect::<Vec<_>>());
}

#[derive(Clone, Debug)]
enum Op {
    Front(usize),
    Back(usize),
    Forward(usize),
    Backward(usize),
    Remove(usize),
    Add,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..8).prop_map(Op::Front),
        (0usize..8).prop_map(Op::Back),
        (0usize..8).prop_map(Op::Forward),
        (0usize..8).prop_map(Op::Backward),
        (0usize..8).prop_map(Op::Remove),
        Just(Op::Add),
    ]
}

proptest! {
    #[test]
    fn tiers_are_nested(
        maps in prop::collection::vec((-50.0f64..50.0, -50.0f64..50.0, 0.1f64..20.0), 1..12),
        center in (-60.0f64..60.0, -60.0f64..60.0),
        scale in 0.001f64..0.5,
        size in (50u32..800, 50u32..800),
        rotation in 0.0f64..std::f64::consts::TAU,
    ) {
        let list = list_with(&maps);
        let viewport = Viewport::new([center.0, center.1], scale, size.0, size.1, Projection::Equirectangular)
            .with_rotation(rotation);

        let config = MapSystemConfig::default();
        let tiers: Vec<HashSet<MapId>> = Tier::ALL
            .iter()
            .map(|tier| find_maps(&list, &viewport, tier.buffer_ratio(&config)).into_iter().collect())
            .collect();
        for pair in tiers.windows(2) {
            prop_assert!(pair[0].is_subset(&pair[1]));
        }
    }

    #[test]
    fn z_indices_stay_a_permutation(ops in prop::collection::vec(op(), 1..30)) {
        let mut list = list_with(&[(0.0, 0.0, 1.0), (2.0, 0.0, 1.0), (4.0, 0.0, 1.0), (6.0, 0.0, 1.0), (8.0, 0.0, 1.0)]);
        let mut next = 5;
        for op in ops {
            let ids = list.ordered_ids();
            let pick = |i: usize| -> Vec<MapId> {
                if ids.is_empty() { Vec::new() } else { vec![ids[i % ids.len()].clone()] }
            };
            match op {
                Op::Front(i) => list.bring_to_front(&pick(i)),
                Op::Back(i) => list.send_to_back(&pick(i)),
                Op::Forward(i) => list.bring_forward(&pick(i)),
                Op::Backward(i) => list.send_backward(&pick(i)),
                Op::Remove(i) => {
                    for id in pick(i) {
                        list.remove_map_by_id(&id).unwrap();
                    }
                }
                Op::Add => {
                    list.add_map(square_map(&format!("m{next}"), [next as f64 * 2.0, 0.0], 1.0)).unwrap();
                    next += 1;
                }
            }
            assert_dense_z(&list);
        }
    }
}

#[test]
fn test_add_then_remove_restores_list() {
    let mut list = list_with(&[(0.0, 0.0, 1.0), (5.0, 5.0, 1.0)]);
    let before = list.ordered_ids();
    let index_len = list.spatial_index().unwrap().len();

    let id = list.add_map(square_map("extra", [20.0, 20.0], 2.0)).unwrap();
    assert_eq!(list.get_z_index(&id), Some(2));
    list.remove_map_by_id(&id).unwrap();

    assert_eq!(list.ordered_ids(), before);
    assert_eq!(list.spatial_index().unwrap().len(), index_len);
    assert!(list.get_map_ids(&Selection::in_bbox(Bbox::new(19.0, 19.0, 23.0, 23.0))).is_empty());
    assert_dense_z(&list);
}

#[test]
fn test_closer_maps_come_first() {
    let list = list_with(&[(40.0, 0.0, 2.0), (0.0, 0.0, 2.0), (20.0, 0.0, 2.0)]);
    let viewport = Viewport::new([1.0, 1.0], 0.1, 200, 200, Projection::Equirectangular);
    assert_eq!(find_maps(&list, &viewport, 1000.0), vec!["m1", "m2", "m0"]);
}
