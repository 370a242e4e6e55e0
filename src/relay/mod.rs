//! Signaling relay: identities connect to `/signal/{id}` and exchange
//! offers, answers, ICE candidates and hangups addressed by participant id.

mod hub;
mod message;
mod websocket;

use std::convert::Infallible;
use std::sync::Arc;

use serde_json::json;
use warp::Filter;

use crate::config::Config;

pub use hub::RelayHub;
pub use message::SignalMessage;

pub fn signal_route(
    hub: Arc<RelayHub>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path("signal")
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_hub(hub))
        .map(|raw_id: String, ws: warp::ws::Ws, hub: Arc<RelayHub>| {
            let id = urlencoding::decode(&raw_id)
                .map(|id| id.into_owned())
                .unwrap_or(raw_id);
            ws.on_upgrade(move |socket| websocket::handle_signal_socket(socket, id, hub))
        })
}

pub fn health_check(
    hub: Arc<RelayHub>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_hub(hub))
        .and_then(|hub: Arc<RelayHub>| async move {
            let online = hub.online().await.len();
            Ok::<_, Infallible>(warp::reply::json(&json!({
                "status": "healthy",
                "service": "proctor-session relay",
                "version": env!("CARGO_PKG_VERSION"),
                "identities": online
            })))
        })
}

pub fn config_endpoint(
    config: &Config,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let ice_servers: Vec<serde_json::Value> = config
        .signaling
        .stun_servers
        .iter()
        .map(|url| json!({ "urls": [url] }))
        .chain(config.signaling.turn_servers.iter().map(|turn| {
            json!({
                "urls": turn.urls,
                "username": turn.username,
                "credential": turn.credential
            })
        }))
        .collect();

    let body = json!({
        "signalingUrl": config.signaling.url,
        "iceServers": ice_servers,
        "liveness": {
            "matchThreshold": config.liveness.match_threshold,
            "intervalMs": config.liveness.interval.as_millis() as u64
        },
        "recording": {
            "minDurationSecs": config.recording.min_duration.as_secs(),
            "maxDurationSecs": config.recording.max_duration.as_secs(),
            "videoBitrate": config.recording.video_bitrate
        }
    });

    warp::path("config")
        .and(warp::path::end())
        .and(warp::get())
        .map(move || warp::reply::json(&body))
}

/// All relay routes.
pub fn routes(
    hub: Arc<RelayHub>,
    config: &Config,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    signal_route(hub.clone())
        .or(health_check(hub))
        .or(config_endpoint(config))
        .with(warp::trace::request())
}

fn with_hub(
    hub: Arc<RelayHub>,
) -> impl Filter<Extract = (Arc<RelayHub>,), Error = Infallible> + Clone {
    warp::any().map(move || hub.clone())
}
