//! Picks up to `N` relays for a Gateway by great-circle distance, with a
//! tie-break that prefers located relays over unlocated ones (C7). Pure
//! selection and diffing logic; the temporal debouncing of presence churn
//! before a `relays_presence` push is a timer concern owned by the Gateway
//! Channel actor that calls this crate, not by the functions here.

use model::{GeoLocation, Relay, RelayId};
use rand::seq::SliceRandom;
use rand::Rng;

/// Default target relay count per Gateway, per §4.7's recommendation.
pub const DEFAULT_COUNT: usize = 2;

/// Default coalescing window for raw presence churn before a
/// `relays_presence` push is computed. Test-overridable by constructing
/// the Gateway Channel with a different duration.
pub const DEFAULT_DEBOUNCE_MS: u64 = 50;

fn haversine_km(a: GeoLocation, b: GeoLocation) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;

    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);

    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// Selects up to `n` relays for a Gateway at `gateway_location` (or
/// unlocated), using `rng` for the tie-breaking shuffle. See [`select`]
/// for the non-deterministic convenience wrapper used outside tests.
pub fn select_with_rng(
    gateway_location: Option<GeoLocation>,
    relays: &[Relay],
    n: usize,
    rng: &mut impl Rng,
) -> Vec<Relay> {
    let (mut located, mut unlocated): (Vec<Relay>, Vec<Relay>) =
        relays.iter().cloned().partition(|r| r.location.is_some());

    match gateway_location {
        Some(gw) => {
            located.sort_by(|a, b| {
                let da = haversine_km(gw, a.location.expect("partitioned as located"));
                let db = haversine_km(gw, b.location.expect("partitioned as located"));
                da.total_cmp(&db)
            });

            let mut selected: Vec<Relay> = located.into_iter().take(n).collect();
            if selected.len() < n {
                unlocated.shuffle(rng);
                selected.extend(unlocated.into_iter().take(n - selected.len()));
            }
            selected
        }
        None => {
            located.shuffle(rng);
            unlocated.shuffle(rng);
            located.extend(unlocated);
            located.into_iter().take(n).collect()
        }
    }
}

/// Convenience wrapper over [`select_with_rng`] using the thread-local RNG.
pub fn select(gateway_location: Option<GeoLocation>, relays: &[Relay], n: usize) -> Vec<Relay> {
    select_with_rng(gateway_location, relays, n, &mut rand::thread_rng())
}

/// The `{connected, disconnected_ids}` pair pushed as `relays_presence`
/// when a recomputed selection differs from the previous one.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionDiff {
    pub connected: Vec<Relay>,
    pub disconnected_ids: Vec<RelayId>,
}

/// Diffs a freshly recomputed selection against the one last pushed.
/// `disconnected_ids` is every id present in `previous` but absent from
/// `current` — relays that dropped out of the Gateway's selection, not
/// necessarily relays that went offline.
pub fn diff(previous: &[Relay], current: &[Relay]) -> SelectionDiff {
    let current_ids: std::collections::HashSet<RelayId> = current.iter().map(|r| r.id).collect();
    let disconnected_ids = previous
        .iter()
        .map(|r| r.id)
        .filter(|id| !current_ids.contains(id))
        .collect();

    SelectionDiff {
        connected: current.to_vec(),
        disconnected_ids,
    }
}

#[cfg(test)]
mod tests {
    use model::RelayId;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    fn relay(id: u128, location: Option<GeoLocation>) -> Relay {
        Relay {
            id: RelayId::from_u128(id),
            kind: model::RelayKind::Turn,
            addr: "127.0.0.1:3478".to_string(),
            username: "u".to_string(),
            password: "p".to_string(),
            expires_at: chrono::Utc::now(),
            location,
        }
    }

    fn loc(lat: f64, lon: f64) -> GeoLocation {
        GeoLocation { lat, lon }
    }

    #[test]
    fn picks_the_two_closest_relays_by_great_circle_distance() {
        let gateway = loc(29.69, -95.90); // Houston
        let kansas = relay(1, Some(loc(38.0, -97.0)));
        let mexico = relay(2, Some(loc(20.59, -100.39)));
        let sydney = relay(3, Some(loc(-33.87, 151.21)));

        let selected = select_with_rng(
            Some(gateway),
            &[kansas.clone(), mexico.clone(), sydney.clone()],
            2,
            &mut StdRng::seed_from_u64(0),
        );

        let ids: Vec<_> = selected.iter().map(|r| r.id).collect();
        assert!(ids.contains(&kansas.id));
        assert!(ids.contains(&mexico.id));
        assert!(!ids.contains(&sydney.id));
    }

    #[test]
    fn falls_back_to_unlocated_relays_when_not_enough_located_ones() {
        let gateway = loc(29.69, -95.90);
        let kansas = relay(1, Some(loc(38.0, -97.0)));
        let unlocated = relay(2, None);

        let selected = select_with_rng(
            Some(gateway),
            &[kansas.clone(), unlocated.clone()],
            2,
            &mut StdRng::seed_from_u64(1),
        );

        assert_eq!(selected.len(), 2);
        assert!(selected.iter().any(|r| r.id == kansas.id));
        assert!(selected.iter().any(|r| r.id == unlocated.id));
    }

    #[test]
    fn unlocated_gateway_prefers_located_relays_first() {
        let located = relay(1, Some(loc(1.0, 1.0)));
        let unlocated = relay(2, None);

        let selected = select_with_rng(
            None,
            &[unlocated.clone(), located.clone()],
            1,
            &mut StdRng::seed_from_u64(2),
        );

        assert_eq!(selected, vec![located]);
    }

    #[test]
    fn diff_reports_only_ids_dropped_from_the_selection() {
        let a = relay(1, None);
        let b = relay(2, None);
        let c = relay(3, None);

        let result = diff(&[a.clone(), b.clone()], &[b.clone(), c.clone()]);

        assert_eq!(result.connected, vec![b, c]);
        assert_eq!(result.disconnected_ids, vec![a.id]);
    }

    #[test]
    fn diff_against_empty_previous_has_no_disconnects() {
        let a = relay(1, None);

        let result = diff(&[], &[a.clone()]);

        assert!(result.disconnected_ids.is_empty());
    }

    #[test]
    fn reconnect_with_same_id_produces_no_net_diff() {
        let a = relay(1, None);

        let result = diff(&[a.clone()], &[a.clone()]);

        assert!(result.disconnected_ids.is_empty());
        assert_eq!(result.connected, vec![a]);
    }
}
