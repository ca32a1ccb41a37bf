use matrixcompare::assert_scalar_eq;
use mortise::error::SearchError;
use mortise::proptest::point_cloud;
use mortise::search::{PatchUpdateStrategy, SearchSettings, SpatialProximityIndex};
use nalgebra::{point, Point2};
use proptest::prelude::*;

#[test]
fn nearest_primary_node_is_found() {
    let positions = vec![
        point![0.0, 0.0],
        point![1.0, 0.0],
        point![2.0, 0.0],
        point![0.9, 1.0],
        point![2.2, 1.0],
    ];
    let mut index = SpatialProximityIndex::from_node_sets(vec![3, 4], vec![0, 1, 2], &SearchSettings::default());
    index.refresh(&positions, true).unwrap();

    assert_eq!(index.nearest_of(3), Some(1));
    assert_eq!(index.nearest_of(4), Some(2));
    assert_scalar_eq!(index.distance_to(3).unwrap(), 1.01f64.sqrt(), comp = abs, tol = 1e-14);
    // Not a secondary node
    assert_eq!(index.nearest_of(0), None);
}

#[test]
fn ties_are_broken_by_lowest_node_index() {
    let positions = vec![point![1.0, 0.0], point![-1.0, 0.0], point![0.0, 1.0], point![0.0, -1.0]];
    // Listed in reverse, so that the answer does not depend on the input order
    let mut index = SpatialProximityIndex::from_node_sets(vec![2, 3], vec![1, 0], &SearchSettings::default());
    index.refresh(&positions, true).unwrap();
    assert_eq!(index.nearest_of(2), Some(0));
    assert_eq!(index.nearest_of(3), Some(0));
}

#[test]
fn node_in_both_sets_skips_itself() {
    let positions = vec![point![0.0, 0.0], point![0.5, 0.0], point![3.0, 0.0]];
    let mut index = SpatialProximityIndex::from_node_sets(vec![0], vec![0, 1, 2], &SearchSettings::default());
    index.refresh(&positions, true).unwrap();
    assert_eq!(index.nearest_of(0), Some(1));
}

#[test]
fn secondary_node_without_candidates_is_an_error() {
    let positions = vec![point![0.0, 0.0]];
    let mut index = SpatialProximityIndex::<f64>::from_node_sets(vec![0], vec![0], &SearchSettings::default());
    assert_eq!(
        index.refresh(&positions, true),
        Err(SearchError::NoCandidate { secondary_node: 0 })
    );
}

#[test]
fn stale_patches_are_rebuilt_on_request() {
    let settings = SearchSettings {
        patch_size: 1,
        patch_update_strategy: PatchUpdateStrategy::Never,
        ..SearchSettings::default()
    };
    let mut positions = vec![point![0.0, 0.0], point![10.0, 0.0], point![0.1, 0.0]];
    let mut index = SpatialProximityIndex::from_node_sets(vec![2], vec![0, 1], &settings);
    index.refresh(&positions, false).unwrap();
    assert_eq!(index.nearest_of(2), Some(0));

    // The secondary node moves next to node 1, but its patch only holds node 0
    positions[2] = point![9.9, 0.0];
    index.refresh(&positions, false).unwrap();
    assert_eq!(index.nearest_of(2), Some(0));
    assert_scalar_eq!(index.max_patch_percentage(), 100.0);

    index.refresh(&positions, true).unwrap();
    assert_eq!(index.nearest_of(2), Some(1));
}

fn brute_force_nearest(positions: &[Point2<f64>], secondary: usize, primary: &[usize]) -> Option<usize> {
    primary
        .iter()
        .copied()
        .filter(|&p| p != secondary)
        .min_by(|&a, &b| {
            let da = (positions[a] - positions[secondary]).norm_squared();
            let db = (positions[b] - positions[secondary]).norm_squared();
            da.partial_cmp(&db).unwrap().then(a.cmp(&b))
        })
}

proptest! {
    #[test]
    fn nearest_matches_brute_force(
        secondary_points in point_cloud(12),
        primary_points in point_cloud(12),
        patch_size in 1usize..6,
        strategy in prop_oneof![Just(PatchUpdateStrategy::Auto), Just(PatchUpdateStrategy::Iteration)],
    ) {
        let settings = SearchSettings { patch_size, patch_update_strategy: strategy, ..SearchSettings::default() };
        let positions: Vec<_> = secondary_points.iter().chain(&primary_points).copied().collect();
        let secondary: Vec<usize> = (0..secondary_points.len()).collect();
        let primary: Vec<usize> = (secondary_points.len()..positions.len()).collect();

        let mut index = SpatialProximityIndex::from_node_sets(secondary.clone(), primary.clone(), &settings);
        index.refresh(&positions, false).unwrap();
        for &node in &secondary {
            prop_assert_eq!(index.nearest_of(node), brute_force_nearest(&positions, node, &primary));
        }
    }
}
