// src/server/response.rs

//! Rendering the outcome of a selection into a redirect, JSON body, or a
//! minimal HTML mirror list (§6). The HTML/JS templating layer proper is a
//! named external collaborator — this renders a bare-bones page, not a
//! themed one.

use crate::config::OutputMode;
use crate::selection::SelectionResult;
use axum::http::{HeaderMap, HeaderValue};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    Redirect,
    Json,
    Html,
}

/// Chooses how to render a selection result, per §6: `mirrorlist=1` or
/// `Accept: application/json` force the mirror-list form; `OutputMode`
/// overrides both when set to `json` or `redirect`.
pub fn choose_mode(output_mode: OutputMode, wants_mirrorlist: bool, accepts_json: bool) -> RenderMode {
    match output_mode {
        OutputMode::Json => RenderMode::Json,
        OutputMode::Redirect => RenderMode::Redirect,
        OutputMode::Auto => {
            if accepts_json {
                RenderMode::Json
            } else if wants_mirrorlist {
                RenderMode::Html
            } else {
                RenderMode::Redirect
            }
        }
    }
}

#[derive(Serialize)]
pub struct JsonMirror {
    pub id: u64,
    pub http_url: String,
    pub country_codes: Vec<String>,
    pub custom_data: String,
    pub distance_km: Option<f64>,
    pub weight: Option<u32>,
}

#[derive(Serialize)]
pub struct JsonExcluded {
    pub id: u64,
    pub name: String,
    pub reason: &'static str,
}

#[derive(Serialize)]
pub struct JsonResponse {
    pub path: String,
    pub size: i64,
    pub fallback: bool,
    pub mirrors: Vec<JsonMirror>,
    pub excluded: Vec<JsonExcluded>,
}

pub fn to_json(path: &str, file_size: i64, result: &SelectionResult) -> JsonResponse {
    JsonResponse {
        path: path.to_string(),
        size: file_size,
        fallback: result.fallback,
        mirrors: result
            .selected
            .iter()
            .map(|s| JsonMirror {
                id: s.mirror.id,
                http_url: s.mirror.http_url.clone(),
                country_codes: s.mirror.country_codes.clone(),
                custom_data: s.mirror.custom_data.clone(),
                distance_km: s.distance_km,
                weight: s.weight,
            })
            .collect(),
        excluded: result
            .excluded
            .iter()
            .map(|e| JsonExcluded {
                id: e.mirror.id,
                name: e.mirror.name.clone(),
                reason: e.reason.as_str(),
            })
            .collect(),
    }
}

pub fn to_html(path: &str, result: &SelectionResult) -> String {
    let mut body = String::new();
    body.push_str("<!doctype html><html><head><title>mirrorbits</title></head><body>\n");
    body.push_str(&format!("<h1>Mirrors for {path}</h1>\n<ul>\n"));
    for selected in &result.selected {
        let weight = selected.weight.map(|w| w.to_string()).unwrap_or_else(|| "-".into());
        body.push_str(&format!(
            "<li><a href=\"{url}{path}\">{url}{path}</a> (weight {weight})</li>\n",
            url = selected.mirror.http_url
        ));
    }
    body.push_str("</ul>\n</body></html>\n");
    body
}

/// Bounded `Link` header entries listing the top alternates (§6).
pub fn link_headers(result: &SelectionResult, path: &str, max: usize) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (rank, selected) in result.selected.iter().take(max).enumerate() {
        let weight = selected.weight.unwrap_or(0);
        let value = format!(
            "<{url}{path}>; rel=\"duplicate\"; pri={pri}; weight={weight}",
            url = selected.mirror.http_url,
            pri = rank + 1,
        );
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.append(axum::http::header::LINK, value);
        }
    }
    headers
}
