use std::time::{Duration, Instant};

use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse},
    Json,
};
use log::warn;
use sysinfo::{get_current_pid, System};

use crate::state::SharedState;

const MEMORY_CACHE_TTL: Duration = Duration::from_secs(5);

// ---------- Online count ----------

pub async fn get_online_count(State(state): State<SharedState>) -> impl IntoResponse {
    let window_secs = state.liveness.window().duration().as_secs();
    match state.liveness.count_online().await {
        Ok(count) => (
            StatusCode::OK,
            Json(serde_json::json!({ "count": count, "window_secs": window_secs })),
        )
            .into_response(),
        Err(e) => {
            warn!("Online count query failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

// ---------- Status ----------

async fn process_memory_bytes(state: &SharedState) -> u64 {
    let mut cache = state.memory_cache.lock().await;
    if let Some((bytes, at)) = *cache {
        if at.elapsed() < MEMORY_CACHE_TTL {
            return bytes;
        }
    }
    let bytes = tokio::task::spawn_blocking(|| {
        let mut sys = System::new_all();
        sys.refresh_all();
        get_current_pid()
            .ok()
            .and_then(|pid| sys.process(pid))
            .map(|p| p.memory())
            .unwrap_or(0)
    })
    .await
    .unwrap_or(0);
    *cache = Some((bytes, Instant::now()));
    bytes
}

pub async fn get_status(State(state): State<SharedState>) -> impl IntoResponse {
    let online = match state.liveness.count_online().await {
        Ok(count) => Some(count),
        Err(e) => {
            warn!("Online count query failed: {}", e);
            None
        }
    };
    let memory_bytes = process_memory_bytes(&state).await;
    let json = serde_json::json!({
        "online": online,
        "window_secs": state.liveness.window().duration().as_secs(),
        "store": state.store_backend,
        "ingest": state.ingest.snapshot(),
        "aggregator": state.aggregator_stats.snapshot(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "started_at_utc": state.started_at_utc,
        "memory_bytes": memory_bytes,
    });
    Json(json)
}

// ---------- Status page ----------

const STATUS_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="UTF-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1.0" />
  <title>Doniai Presence</title>
  <style>
    body { font-family: system-ui, sans-serif; display: flex; flex-direction: column; align-items: center; justify-content: center; min-height: 100vh; margin: 0; background: #0f0f0f; color: #e0e0e0; }
    h1 { font-weight: 300; font-size: 1.5rem; letter-spacing: 0.1em; text-transform: uppercase; margin-bottom: 0.5rem; }
    #count { font-size: 3rem; font-variant-numeric: tabular-nums; }
    .muted { font-size: 0.875rem; color: #888; margin-top: 1rem; }
    .row { font-size: 0.875rem; display: flex; gap: 3rem; justify-content: center; margin-top: 0.5rem; }
    .col { display: flex; flex-direction: column; align-items: center; }
    .label { color: #888; margin-bottom: 0.15rem; }
    .val { font-variant-numeric: tabular-nums; min-width: 4em; text-align: center; }
  </style>
</head>
<body>
  <h1>Doniai Presence</h1>
  <p class="muted">Online</p>
  <p id="count">—</p>
  <div class="row">
    <div class="col"><span class="label">Queued</span><span id="queued" class="val">—</span></div>
    <div class="col"><span class="label">Dropped</span><span id="dropped" class="val">—</span></div>
    <div class="col"><span class="label">Flushes</span><span id="flushes" class="val">—</span></div>
    <div class="col"><span class="label">Uptime</span><span id="uptime" class="val">—</span></div>
  </div>
  <script>
    function formatUptime(secs) {
      if (secs < 60) return secs + 's';
      if (secs < 3600) return Math.floor(secs / 60) + 'm';
      if (secs < 86400) return Math.floor(secs / 3600) + 'h ' + Math.floor((secs % 3600) / 60) + 'm';
      return Math.floor(secs / 86400) + 'd ' + Math.floor((secs % 86400) / 3600) + 'h';
    }
    function update() {
      fetch(window.location.origin + '/api/status').then(r => {
        if (!r.ok) throw new Error(r.status);
        return r.json();
      }).then(d => {
        document.getElementById('count').textContent = d.online == null ? '?' : String(d.online);
        document.getElementById('queued').textContent = String(d.ingest.queued);
        document.getElementById('dropped').textContent = String(d.ingest.dropped);
        document.getElementById('flushes').textContent = String(d.aggregator.flushes);
        document.getElementById('uptime').textContent = formatUptime(d.uptime_secs || 0);
      }).catch(() => {
        document.getElementById('count').textContent = '?';
      });
    }
    update();
    setInterval(update, 3000);
  </script>
</body>
</html>"#;

pub async fn status_page_handler() -> Html<&'static str> {
    Html(STATUS_HTML)
}
