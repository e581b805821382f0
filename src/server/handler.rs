// src/server/handler.rs

//! The download request handler (C10, §6): sanitizes the requested path,
//! hydrates candidates through the cache (C3), geolocates the client (C4),
//! runs selection (C8), renders the outcome, and logs the download line.

use super::response::{choose_mode, link_headers, to_html, to_json, RenderMode};
use super::state::AppState;
use crate::error::MirrorbitsError;
use crate::model::ClientGeo;
use crate::selection::{select, Candidate, SelectionParams, SelectionResult};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::{error, warn};

/// Rejects `..` segments and collapses `.`/empty segments, always returning
/// a leading-slash path matching `FileInfo::path`'s convention (§4.8 "path
/// sanitization").
pub fn sanitize_path(raw: &str) -> Result<String, MirrorbitsError> {
    let mut segments = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(MirrorbitsError::OutsideRepository),
            s => segments.push(s),
        }
    }
    Ok(format!("/{}", segments.join("/")))
}

pub async fn download(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    axum::extract::Path(path): axum::extract::Path<String>,
) -> Response {
    let path = match sanitize_path(&path) {
        Ok(p) => p,
        Err(e) => return e.status_code().into_response(),
    };

    let config = state.config.get();
    let client_ip = client_ip(&headers, peer);
    let client_geo = state.geo.lookup(client_ip);

    let want_mirrorlist = query.get("mirrorlist").map(|v| v == "1").unwrap_or(false);
    let accepts_json = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("application/json"));

    let result = match resolve_and_select(&state, &path, &client_geo, want_mirrorlist, &config).await {
        Ok(r) => r,
        Err(e) => {
            log_line(&state, &method, 500, &path, client_ip, None, Some(&e.to_string())).await;
            return e.status_code().into_response();
        }
    };

    let Some(result) = result else {
        log_line(&state, &method, 404, &path, client_ip, None, None).await;
        return StatusCode::NOT_FOUND.into_response();
    };

    if result.selected.is_empty() {
        log_line(&state, &method, 404, &path, client_ip, None, None).await;
        return StatusCode::NOT_FOUND.into_response();
    }

    for excluded in &result.excluded {
        crate::metrics::SELECTION_EXCLUSIONS
            .with_label_values(&[excluded.reason.as_str()])
            .inc();
    }

    let mode = choose_mode(config.output_mode, want_mirrorlist, accepts_json);
    let file_size = cached_file_size(&state, &path).await;
    let status = if mode == RenderMode::Redirect { 302 } else { 200 };
    record_download(&state, &method, &result, &path, client_ip, client_geo.as_num(), status).await;

    match mode {
        RenderMode::Redirect => {
            crate::metrics::REDIRECTS_TOTAL.inc();
            let primary = &result.selected[0];
            let location = format!("{}{}", primary.mirror.http_url, path);
            let mut response = (StatusCode::FOUND, ()).into_response();
            if let Ok(value) = header::HeaderValue::from_str(&location) {
                response.headers_mut().insert(header::LOCATION, value);
            }
            let links = link_headers(&result, &path, config.max_link_headers);
            response.headers_mut().extend(links);
            response
        }
        RenderMode::Json => axum::Json(to_json(&path, file_size, &result)).into_response(),
        RenderMode::Html => (
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            to_html(&path, &result),
        )
            .into_response(),
    }
}

async fn resolve_and_select(
    state: &AppState,
    path: &str,
    client_geo: &ClientGeo,
    want_mirrorlist: bool,
    config: &crate::config::Config,
) -> crate::error::Result<Option<SelectionResult>> {
    let Some(file_info) = state.cache.file_info(path).await? else {
        return Ok(None);
    };

    let mirror_ids = state.cache.mirrors_for_path(path).await?;
    let mut candidates = Vec::with_capacity(mirror_ids.len());
    for id in mirror_ids {
        let Some(mirror) = state.cache.mirror(id).await? else {
            continue;
        };
        let reported_size = state
            .cache
            .per_mirror_file_size(id, path)
            .await?
            .unwrap_or(-1);
        candidates.push(Candidate {
            mirror,
            reported_size,
        });
    }

    let params = SelectionParams {
        file_size: file_info.size,
        client: client_geo,
        want_mirrorlist,
        weight_distribution_range: config.weight_distribution_range,
        max_link_headers: config.max_link_headers,
        fallbacks: &config.fallbacks,
    };
    let mut rng = SmallRng::from_entropy();
    Ok(Some(select(candidates, &params, &mut rng)))
}

async fn cached_file_size(state: &AppState, path: &str) -> i64 {
    state
        .cache
        .file_info(path)
        .await
        .ok()
        .flatten()
        .map(|f| f.size)
        .unwrap_or(0)
}

/// Extracts the client address, honoring `X-Forwarded-For` when present, as
/// the daemon typically sits behind a reverse proxy (§6).
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> std::net::IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(peer.ip())
}

async fn record_download(
    state: &AppState,
    method: &Method,
    result: &SelectionResult,
    path: &str,
    client_ip: std::net::IpAddr,
    client_as_num: Option<u32>,
    status: u16,
) {
    let primary = &result.selected[0];
    log_line(
        state,
        method,
        status,
        path,
        client_ip,
        Some((primary, result.fallback, client_as_num)),
        None,
    )
    .await;

    let bucket = chrono::Utc::now().format("%Y-%m-%d").to_string();
    let file_key = format!("STATS_FILE_{bucket}");
    let mirror_key = format!("STATS_MIRROR_{bucket}");
    let bytes_key = format!("STATS_MIRROR_BYTES_{bucket}");
    if let Err(e) = state.store.hincrby(&file_key, path, 1).await {
        warn!(error = %e, "failed to increment file stats counter");
    }
    if let Err(e) = state
        .store
        .hincrby(&mirror_key, &primary.mirror.id.to_string(), 1)
        .await
    {
        warn!(error = %e, "failed to increment mirror stats counter");
    }
    let size = cached_file_size(state, path).await;
    if let Err(e) = state
        .store
        .hincrby(&bytes_key, &primary.mirror.id.to_string(), size)
        .await
    {
        warn!(error = %e, "failed to increment mirror byte counter");
    }
}

/// Emits the download log line in the exact format consumed by log
/// analysis tooling (§6):
/// `<method> <status> "<path>" ip:<ip> mirror:<id>[ fallback:true] [sameasn:<n>] asn:<n> distance:<km>km countries:<cc,cc>`
///
/// `sameasn:<n>` denotes AS affinity specifically — the client's own ASN
/// matching the selected mirror's, not merely the mirror having an ASN.
async fn log_line(
    state: &AppState,
    method: &Method,
    status: u16,
    path: &str,
    client_ip: std::net::IpAddr,
    selection: Option<(&crate::selection::SelectedMirror, bool, Option<u32>)>,
    error_message: Option<&str>,
) {
    let line = format_line(method, status, path, client_ip, selection, error_message);

    if let Some((selected, ..)) = selection
        && let Err(e) = crate::admin::log_line(&state.store, selected.mirror.id, &line, 100).await
    {
        error!(error = %e, "failed to append mirror log line");
    }
    tracing::info!(target: "download", "{line}");
}

fn format_line(
    method: &Method,
    status: u16,
    path: &str,
    client_ip: std::net::IpAddr,
    selection: Option<(&crate::selection::SelectedMirror, bool, Option<u32>)>,
    error_message: Option<&str>,
) -> String {
    match (selection, error_message) {
        (Some((selected, fallback, client_as_num)), _) => {
            let asnum = selected.mirror.asnum;
            let sameasn = if client_as_num == Some(asnum) && asnum != 0 {
                format!(" sameasn:{asnum}")
            } else {
                String::new()
            };
            let distance = selected.distance_km.map(|d| format!(" distance:{d:.0}km")).unwrap_or_default();
            let countries = selected.mirror.country_codes.join(",");
            let fallback_tag = if fallback { " fallback:true" } else { "" };
            format!(
                "{method} {status} \"{path}\" ip:{client_ip} mirror:{id}{fallback_tag}{sameasn} asn:{asnum}{distance} countries:{countries}",
                id = selected.mirror.id,
            )
        }
        (None, Some(message)) => {
            format!("{method} {status} \"{path}\" ip:{client_ip} error:{message}")
        }
        (None, None) => {
            format!("{method} {status} \"{path}\" ip:{client_ip}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_path_rejects_parent_traversal() {
        assert!(sanitize_path("/foo/../../etc/passwd").is_err());
    }

    #[test]
    fn sanitize_path_collapses_empty_segments() {
        assert_eq!(sanitize_path("//foo//bar.iso").unwrap(), "/foo/bar.iso");
    }

    #[test]
    fn sanitize_path_handles_root() {
        assert_eq!(sanitize_path("/").unwrap(), "/");
    }

    fn selected_with_asnum(asnum: u32) -> crate::selection::SelectedMirror {
        let mut mirror = crate::model::Mirror::new(1, "m1", "http://m1.example.org");
        mirror.asnum = asnum;
        crate::selection::SelectedMirror {
            mirror,
            distance_km: None,
            computed_score: 0.0,
            weight: None,
        }
    }

    #[test]
    fn sameasn_tag_only_appears_when_client_asn_matches_mirror_asn() {
        let selected = selected_with_asnum(64512);
        let line = format_line(
            &Method::GET,
            302,
            "/linux/distro.iso",
            "127.0.0.1".parse().unwrap(),
            Some((&selected, false, Some(64512))),
            None,
        );
        assert!(line.contains("sameasn:64512"));
    }

    #[test]
    fn sameasn_tag_absent_when_mirror_has_an_asnum_but_client_asn_differs() {
        let selected = selected_with_asnum(64512);
        let line = format_line(
            &Method::GET,
            302,
            "/linux/distro.iso",
            "127.0.0.1".parse().unwrap(),
            Some((&selected, false, Some(99999))),
            None,
        );
        assert!(!line.contains("sameasn:"));
    }

    #[test]
    fn sameasn_tag_absent_when_client_asn_is_unknown() {
        let selected = selected_with_asnum(64512);
        let line = format_line(
            &Method::GET,
            302,
            "/linux/distro.iso",
            "127.0.0.1".parse().unwrap(),
            Some((&selected, false, None)),
            None,
        );
        assert!(!line.contains("sameasn:"));
    }
}
