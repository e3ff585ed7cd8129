// Property tests for measurement merging and the session state machine

use chrono::Utc;
use locator::state::{merge_measurement, SessionState};
use locator::{ConnectionState, Measurement, NearbyObject, PeerIdentity, RemovalReason, Vector3};
use proptest::prelude::*;
use uuid::Uuid;

fn arb_direction() -> impl Strategy<Value = Vector3> {
    (-1.0f32..1.0, -1.0f32..1.0, -1.0f32..1.0)
        .prop_filter("non-degenerate", |(x, y, z)| x * x + y * y + z * z > 0.01)
        .prop_map(|(x, y, z)| Vector3::new(x, y, z))
}

fn arb_measurement() -> impl Strategy<Value = Measurement> {
    (
        proptest::option::of(0.0f32..50.0),
        proptest::option::of(arb_direction()),
    )
        .prop_map(|(distance, direction)| Measurement {
            distance,
            direction: direction.and_then(|d| d.normalized()),
            updated_at: Utc::now(),
        })
}

fn arb_object() -> impl Strategy<Value = NearbyObject> {
    (
        proptest::option::of(0.0f32..50.0),
        proptest::option::of(arb_direction()),
    )
        .prop_map(|(distance, direction)| NearbyObject::new(distance, direction))
}

fn ranging_state() -> SessionState {
    let mut state = SessionState::new();
    let peer = PeerIdentity::new("beta");
    state.begin_search(Uuid::new_v4());
    state.transport_connected(&peer);
    state.token_exchanged();
    state.ranging();
    state
}

proptest! {
    #[test]
    fn distance_only_update_preserves_direction(previous in arb_measurement(), distance in 0.0f32..50.0) {
        let merged = merge_measurement(Some(&previous), &NearbyObject::new(Some(distance), None)).unwrap();
        prop_assert_eq!(merged.distance, Some(distance));
        prop_assert_eq!(merged.direction, previous.direction);
    }

    #[test]
    fn direction_only_update_preserves_distance(previous in arb_measurement(), direction in arb_direction()) {
        let merged = merge_measurement(Some(&previous), &NearbyObject::new(None, Some(direction))).unwrap();
        prop_assert_eq!(merged.distance, previous.distance);
        prop_assert_eq!(merged.direction, direction.normalized());
    }

    #[test]
    fn merged_direction_is_unit_length(previous in proptest::option::of(arb_measurement()), object in arb_object()) {
        if let Some(merged) = merge_measurement(previous.as_ref(), &object) {
            if let Some(direction) = merged.direction {
                prop_assert!((direction.length() - 1.0).abs() < 1e-4);
            }
            if let Some(distance) = merged.distance {
                prop_assert!(distance >= 0.0);
            }
        }
    }

    #[test]
    fn negative_distance_never_stored(previous in arb_measurement(), distance in -50.0f32..-0.001) {
        let merged = merge_measurement(Some(&previous), &NearbyObject::new(Some(distance), None));
        prop_assert_eq!(merged.and_then(|m| m.distance), previous.distance);
    }

    #[test]
    fn removal_always_clears_measurement(
        updates in proptest::collection::vec(arb_object(), 0..8),
        suspend in any::<bool>(),
        reason in prop_oneof![
            Just(RemovalReason::Timeout),
            Just(RemovalReason::PeerEnded),
            Just(RemovalReason::Unknown),
        ],
    ) {
        let mut state = ranging_state();
        for update in &updates {
            state.apply_update(std::slice::from_ref(update));
        }
        if suspend {
            state.suspend();
        }

        prop_assert!(state.lost(reason));
        prop_assert!(state.snapshot().measurement.is_none());
        prop_assert!(!state.state().is_ranging());
    }

    #[test]
    fn suspend_resume_leaves_measurement_untouched(updates in proptest::collection::vec(arb_object(), 1..8)) {
        let mut state = ranging_state();
        for update in &updates {
            state.apply_update(std::slice::from_ref(update));
        }
        let before = state.snapshot().measurement.clone();

        prop_assert!(state.suspend());
        prop_assert!(state.resume());
        prop_assert_eq!(state.state(), &ConnectionState::Ranging);
        prop_assert_eq!(state.snapshot().measurement.clone(), before);
    }

    #[test]
    fn ranging_requires_a_token(connect_first in any::<bool>()) {
        let mut state = SessionState::new();
        let peer = PeerIdentity::new("beta");
        state.begin_search(Uuid::new_v4());
        if connect_first {
            state.transport_connected(&peer);
        }

        // Without token_exchanged, ranging can never be entered
        prop_assert!(!state.ranging());
        prop_assert!(!state.state().is_ranging());
    }
}
