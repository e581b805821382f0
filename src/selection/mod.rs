// src/selection/mod.rs

//! The geo-aware, weighted mirror selection engine (C8, §4.8). Pure and
//! synchronous: callers resolve `FileInfo`, candidate mirrors, and client
//! geo through the cache (C3) and geo resolver (C4) beforehand.

pub mod distance;

use crate::config::FallbackMirror;
use crate::model::{ClientGeo, Mirror};
use distance::haversine_km;
use rand::Rng;
use rand::seq::SliceRandom;

const DEFAULT_TRUNCATE: usize = 5;

/// Why a candidate mirror was excluded from the result, in the priority
/// order the filtering step evaluates them (§4.8 step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusionReason {
    InvalidUrl,
    Disabled,
    Down,
    SizeMismatch,
    ContinentOnly,
    CountryOnly,
    AsOnly,
}

impl ExclusionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExclusionReason::InvalidUrl => "Invalid URL",
            ExclusionReason::Disabled => "Disabled",
            ExclusionReason::Down => "Down",
            ExclusionReason::SizeMismatch => "File size mismatch",
            ExclusionReason::ContinentOnly => "Continent only",
            ExclusionReason::CountryOnly => "Country only",
            ExclusionReason::AsOnly => "AS only",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExcludedMirror {
    pub mirror: Mirror,
    pub reason: ExclusionReason,
}

#[derive(Debug, Clone)]
pub struct SelectedMirror {
    pub mirror: Mirror,
    pub distance_km: Option<f64>,
    pub computed_score: f64,
    /// Percentage weight (0-100-ish) assigned by the probabilistic ordering
    /// step; `None` for mirrors appended behind the weighted pool.
    pub weight: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct SelectionResult {
    pub selected: Vec<SelectedMirror>,
    pub excluded: Vec<ExcludedMirror>,
    /// True when the requested path has no `FileInfo` at all (§4.8 resolve
    /// step failing outright — distinct from "no eligible mirror").
    pub file_absent: bool,
    /// True when a configured fallback mirror was used because no eligible
    /// mirror carries the requested file, matching the glossary's definition
    /// of `Fallback`. The no-geo random-shuffle path is not a fallback in
    /// this sense (§8 scenario 3) even though it takes a similar "give up
    /// on scoring" branch internally.
    pub fallback: bool,
}

/// A mirror carrying the requested path, with the size it reports for that
/// path (hydrated from C3's `PerMirrorFile` table).
pub struct Candidate {
    pub mirror: Mirror,
    pub reported_size: i64,
}

/// Parameters controlling the selection algorithm (§4.8, §6 config).
pub struct SelectionParams<'a> {
    pub file_size: i64,
    pub client: &'a ClientGeo,
    pub want_mirrorlist: bool,
    pub weight_distribution_range: f64,
    pub max_link_headers: usize,
    pub fallbacks: &'a [FallbackMirror],
}

/// Runs the selection algorithm against a pre-filtered candidate set.
pub fn select<R: Rng>(
    candidates: Vec<Candidate>,
    params: &SelectionParams,
    rng: &mut R,
) -> SelectionResult {
    let (mut passed, mut excluded) = filter(candidates, params.file_size, params.client);

    if passed.is_empty() {
        // The file does not exist on any mirror at the right size, whether
        // because nobody claims it at all or every carrier got excluded
        // (e.g. size mismatch) — either way, fall back to configured
        // fallback mirrors (§4.8 "Absent-file fallback").
        let (fallback_selected, fallback_excluded) = absent_file_fallback(params);
        excluded.extend(fallback_excluded);
        return SelectionResult {
            selected: fallback_selected,
            excluded,
            file_absent: false,
            fallback: true,
        };
    }

    if !params.client.is_valid() {
        passed.shuffle(rng);
        let mut selected: Vec<SelectedMirror> = passed
            .into_iter()
            .map(|m| SelectedMirror {
                mirror: m,
                distance_km: None,
                computed_score: 0.0,
                weight: None,
            })
            .collect();
        if !params.want_mirrorlist {
            selected.truncate(DEFAULT_TRUNCATE);
        }
        return SelectionResult {
            selected,
            excluded,
            file_absent: false,
            fallback: false,
        };
    }

    let (client_lat, client_lon) = params.client.coordinates().unwrap();
    let distances: Vec<f64> = passed
        .iter()
        .map(|m| haversine_km(client_lat, client_lon, m.latitude as f64, m.longitude as f64))
        .collect();

    let closest = distances
        .iter()
        .cloned()
        .fold(f64::INFINITY, f64::min)
        .max(f64::MIN_POSITIVE);
    let far = distances.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    let mut scored: Vec<(Mirror, f64, f64)> = passed
        .into_iter()
        .zip(distances)
        .map(|(mirror, dist)| {
            let score = compute_score(
                &mirror,
                dist,
                closest,
                far,
                params.client,
                params.weight_distribution_range,
            );
            (mirror, dist, score)
        })
        .collect();

    scored.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

    let base = far.floor() - 0.0; // base baseline recomputed per-mirror below for pool membership

    let mut pool: Vec<(usize, f64)> = Vec::new();
    for (idx, (_, dist, score)) in scored.iter().enumerate() {
        let per_mirror_base = far.floor() - dist.floor();
        if *score >= per_mirror_base {
            pool.push((idx, score - per_mirror_base));
        }
    }
    let _ = base;

    let total_pool_weight: f64 = pool.iter().map(|(_, w)| w).sum();
    let mut weights: Vec<Option<u32>> = vec![None; scored.len()];

    if total_pool_weight > 0.0 {
        let mut remaining = pool.clone();
        let mut order = Vec::new();
        while !remaining.is_empty() {
            let total: f64 = remaining.iter().map(|(_, w)| w).sum();
            let mut pick = rng.gen_range(0.0..total.max(f64::MIN_POSITIVE));
            let mut chosen_pos = remaining.len() - 1;
            for (pos, (_, w)) in remaining.iter().enumerate() {
                if pick < *w {
                    chosen_pos = pos;
                    break;
                }
                pick -= w;
            }
            let (idx, w) = remaining.remove(chosen_pos);
            order.push(idx);
            weights[idx] = Some(((100.0 * w / total_pool_weight).round()) as u32);
        }
        // Non-pool mirrors keep score order, appended after the weighted pool.
        let pool_indices: std::collections::HashSet<usize> =
            pool.iter().map(|(i, _)| *i).collect();
        let mut final_order = order;
        for idx in 0..scored.len() {
            if !pool_indices.contains(&idx) {
                final_order.push(idx);
            }
        }
        reorder(&mut scored, &mut weights, &final_order);
    }

    let mut selected: Vec<SelectedMirror> = scored
        .into_iter()
        .zip(weights)
        .map(|((mirror, dist, score), weight)| SelectedMirror {
            mirror,
            distance_km: Some(dist),
            computed_score: score,
            weight,
        })
        .collect();

    if !params.want_mirrorlist {
        selected.truncate(params.max_link_headers.max(DEFAULT_TRUNCATE).min(DEFAULT_TRUNCATE));
    }

    SelectionResult {
        selected,
        excluded,
        file_absent: false,
        fallback: false,
    }
}

fn reorder(
    scored: &mut Vec<(Mirror, f64, f64)>,
    weights: &mut Vec<Option<u32>>,
    order: &[usize],
) {
    let mut new_scored = Vec::with_capacity(scored.len());
    let mut new_weights = Vec::with_capacity(weights.len());
    for &idx in order {
        new_scored.push(scored[idx].clone());
        new_weights.push(weights[idx]);
    }
    *scored = new_scored;
    *weights = new_weights;
}

/// §4.8 step 5: per-mirror administrative/geo-affinity score.
fn compute_score(
    mirror: &Mirror,
    distance: f64,
    closest: f64,
    far: f64,
    client: &ClientGeo,
    weight_distribution_range: f64,
) -> f64 {
    let base = far.floor() - distance.floor();
    let mut score = base;

    if distance <= closest * weight_distribution_range {
        score += (base - (distance / closest) * closest).max(0.0);
    } else if client.country_code() == mirror.primary_country() {
        score += (base - (distance / closest) * closest).max(0.0) / 2.0;
    } else if mirror
        .country_codes
        .iter()
        .skip(1)
        .any(|c| Some(c.as_str()) == client.country_code())
    {
        score += base - closest;
    }

    if client.as_num() == Some(mirror.asnum) {
        score += base / 2.0;
    }

    let admin_bias = ((score * (mirror.score as f64 / 100.0)) + 0.5).floor().max(1.0);
    score += admin_bias;

    score
}

/// §4.8 step 2: exclusion filter, evaluated in priority order.
fn filter(
    candidates: Vec<Candidate>,
    file_size: i64,
    client: &ClientGeo,
) -> (Vec<Mirror>, Vec<ExcludedMirror>) {
    let mut passed = Vec::new();
    let mut excluded = Vec::new();

    for candidate in candidates {
        let mirror = candidate.mirror;
        let reason = exclusion_reason(&mirror, candidate.reported_size, file_size, client);
        match reason {
            Some(reason) => excluded.push(ExcludedMirror { mirror, reason }),
            None => passed.push(mirror),
        }
    }

    (passed, excluded)
}

fn exclusion_reason(
    mirror: &Mirror,
    reported_size: i64,
    file_size: i64,
    client: &ClientGeo,
) -> Option<ExclusionReason> {
    if !(mirror.http_url.starts_with("http://") || mirror.http_url.starts_with("https://")) {
        return Some(ExclusionReason::InvalidUrl);
    }
    if !mirror.enabled {
        return Some(ExclusionReason::Disabled);
    }
    if !mirror.is_up() {
        return Some(ExclusionReason::Down);
    }
    if reported_size != file_size {
        return Some(ExclusionReason::SizeMismatch);
    }
    if mirror.continent_only
        && (!client.is_valid() || client.continent_code() != Some(mirror.continent_code.as_str()))
    {
        return Some(ExclusionReason::ContinentOnly);
    }
    if mirror.country_only
        && (!client.is_valid()
            || !client
                .country_code()
                .is_some_and(|cc| mirror.country_codes.iter().any(|c| c == cc)))
    {
        return Some(ExclusionReason::CountryOnly);
    }
    if mirror.as_only && (!client.is_valid() || client.as_num() != Some(mirror.asnum)) {
        return Some(ExclusionReason::AsOnly);
    }
    None
}

/// §4.8 "Absent-file fallback": configured fallback mirrors, filtered by
/// client continent/country, in configuration order.
fn absent_file_fallback(params: &SelectionParams) -> (Vec<SelectedMirror>, Vec<ExcludedMirror>) {
    let selected = params
        .fallbacks
        .iter()
        .filter(|f| {
            let country_ok = f.country_code.is_empty()
                || params.client.country_code() == Some(f.country_code.as_str());
            let continent_ok = f.continent_code.is_empty()
                || params.client.continent_code() == Some(f.continent_code.as_str());
            country_ok && continent_ok
        })
        .map(|f| SelectedMirror {
            mirror: fallback_as_mirror(f),
            distance_km: None,
            computed_score: 0.0,
            weight: None,
        })
        .collect();
    (selected, Vec::new())
}

fn fallback_as_mirror(fallback: &FallbackMirror) -> Mirror {
    let mut mirror = Mirror::new(0, "fallback", fallback.url.clone());
    mirror.enabled = true;
    mirror.http_up = true;
    mirror.country_codes = if fallback.country_code.is_empty() {
        Vec::new()
    } else {
        vec![fallback.country_code.clone()]
    };
    mirror.continent_code = fallback.continent_code.clone();
    mirror
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    fn mirror(id: u64, country: &str, lat: f32, lon: f32) -> Mirror {
        let mut m = Mirror::new(id, format!("m{id}"), "http://example.org");
        m.enabled = true;
        m.http_up = true;
        m.latitude = lat;
        m.longitude = lon;
        m.country_codes = vec![country.to_string()];
        m
    }

    fn client(lat: f64, lon: f64, country: &str) -> ClientGeo {
        ClientGeo::Valid {
            country_code: country.to_string(),
            continent_code: "EU".to_string(),
            city: String::new(),
            country_name: String::new(),
            latitude: lat,
            longitude: lon,
            as_name: String::new(),
            as_num: 0,
        }
    }

    #[test]
    fn happy_redirect_prefers_closest_mirror() {
        let m1 = mirror(1, "FR", 48.85, 2.35);
        let m2 = mirror(2, "DE", 52.52, 13.40);
        let candidates = vec![
            Candidate {
                mirror: m1,
                reported_size: 100,
            },
            Candidate {
                mirror: m2,
                reported_size: 100,
            },
        ];
        let client_geo = client(48.85, 2.35, "FR");
        let params = SelectionParams {
            file_size: 100,
            client: &client_geo,
            want_mirrorlist: false,
            weight_distribution_range: 1.5,
            max_link_headers: 5,
            fallbacks: &[],
        };
        let mut rng = SmallRng::seed_from_u64(42);
        let result = select(candidates, &params, &mut rng);
        assert!(result.excluded.is_empty());
        assert_eq!(result.selected.len(), 2);
        assert_eq!(result.selected[0].mirror.id, 1);
    }

    #[test]
    fn size_mismatch_is_excluded() {
        let m1 = mirror(1, "FR", 48.85, 2.35);
        let m2 = mirror(2, "DE", 52.52, 13.40);
        let candidates = vec![
            Candidate {
                mirror: m1,
                reported_size: 99,
            },
            Candidate {
                mirror: m2,
                reported_size: 100,
            },
        ];
        let client_geo = client(48.85, 2.35, "FR");
        let params = SelectionParams {
            file_size: 100,
            client: &client_geo,
            want_mirrorlist: false,
            weight_distribution_range: 1.5,
            max_link_headers: 5,
            fallbacks: &[],
        };
        let mut rng = SmallRng::seed_from_u64(1);
        let result = select(candidates, &params, &mut rng);
        assert_eq!(result.excluded.len(), 1);
        assert_eq!(result.excluded[0].mirror.id, 1);
        assert_eq!(result.excluded[0].reason, ExclusionReason::SizeMismatch);
        assert_eq!(result.selected.len(), 1);
        assert_eq!(result.selected[0].mirror.id, 2);
    }

    #[test]
    fn invalid_client_geo_falls_back_to_shuffle_and_truncates() {
        let candidates: Vec<Candidate> = (1..=8)
            .map(|id| Candidate {
                mirror: mirror(id, "FR", 0.0, 0.0),
                reported_size: 100,
            })
            .collect();
        let client_geo = ClientGeo::Invalid;
        let params = SelectionParams {
            file_size: 100,
            client: &client_geo,
            want_mirrorlist: false,
            weight_distribution_range: 1.5,
            max_link_headers: 5,
            fallbacks: &[],
        };
        let mut rng = SmallRng::seed_from_u64(7);
        let result = select(candidates, &params, &mut rng);
        assert!(!result.fallback);
        assert_eq!(result.selected.len(), 5);
    }

    #[test]
    fn as_affinity_adds_exactly_half_base() {
        let mut m_a = mirror(1, "FR", 49.0, 2.0);
        m_a.asnum = 64512;
        let mut m_b = mirror(2, "FR", 49.0, 2.0);
        m_b.asnum = 99999;
        let candidates = vec![
            Candidate {
                mirror: m_a.clone(),
                reported_size: 100,
            },
            Candidate {
                mirror: m_b.clone(),
                reported_size: 100,
            },
        ];
        let mut client_geo = client(48.0, 1.0, "FR");
        if let ClientGeo::Valid { as_num, .. } = &mut client_geo {
            *as_num = 64512;
        }
        let params = SelectionParams {
            file_size: 100,
            client: &client_geo,
            want_mirrorlist: true,
            weight_distribution_range: 1.5,
            max_link_headers: 5,
            fallbacks: &[],
        };
        let mut rng = SmallRng::seed_from_u64(3);
        let result = select(candidates, &params, &mut rng);
        let score_a = result
            .selected
            .iter()
            .find(|s| s.mirror.id == 1)
            .unwrap()
            .computed_score;
        let score_b = result
            .selected
            .iter()
            .find(|s| s.mirror.id == 2)
            .unwrap()
            .computed_score;
        let distance = haversine_km(48.0, 1.0, 49.0, 2.0);
        let base = distance.floor() - distance.floor();
        assert!((score_a - score_b - base / 2.0).abs() < 1e-6);
    }

    proptest! {
        #[test]
        fn weighted_pool_percentages_sum_to_roughly_100(
            lats in proptest::collection::vec(-80.0f32..80.0, 2..6),
            lons in proptest::collection::vec(-170.0f32..170.0, 2..6),
            client_lat in -80.0f64..80.0,
            client_lon in -170.0f64..170.0,
            seed in any::<u64>(),
        ) {
            let n = lats.len().min(lons.len());
            let candidates: Vec<Candidate> = (0..n)
                .map(|i| Candidate {
                    mirror: mirror((i + 1) as u64, "FR", lats[i], lons[i]),
                    reported_size: 100,
                })
                .collect();
            let client_geo = client(client_lat, client_lon, "FR");
            let params = SelectionParams {
                file_size: 100,
                client: &client_geo,
                want_mirrorlist: true,
                weight_distribution_range: 1.5,
                max_link_headers: 5,
                fallbacks: &[],
            };
            let mut rng = SmallRng::seed_from_u64(seed);
            let result = select(candidates, &params, &mut rng);

            let weighted: Vec<u32> = result.selected.iter().filter_map(|s| s.weight).collect();
            if !weighted.is_empty() {
                let total: i64 = weighted.iter().map(|w| *w as i64).sum();
                prop_assert!((total - 100).abs() <= weighted.len() as i64);
            }
        }
    }
}
