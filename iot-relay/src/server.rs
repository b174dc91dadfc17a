use std::{sync::atomic::Ordering, time::Instant};

use axum::{
    Json, Router,
    extract::{Path, Request, State},
    http::{StatusCode, header::CONTENT_TYPE},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use protocol::{
    BlinkArgs, ColorArgs, Command, CommandAction, DeviceSummary, HeadingArgs, PathArgs,
    PathShape, RollArgs, STATUS_DONE,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{error::RelayError, relay::Relay, sessions::ControllerInfo};

mod handlers;
mod socket;

use handlers::*;

pub const CHANNEL_ROUTE: &str = "/iot/channel";
/// Side length sent with every path command issued over HTTP.
const PATH_SIDE_LENGTH: f64 = 3.0;

#[derive(Clone, Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ErrorResponse {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn build_relay_app(relay: Relay) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler))
        .route("/iot/controllers", get(list_controllers_handler))
        .route("/iot/devices/{controller_id}", get(list_devices_handler))
        .route(
            "/bb8/connect/{controller_id}/{device_id}",
            get(connect_handler),
        )
        .route(
            "/bb8/roll/{controller_id}/{device_id}/{speed}/{heading}",
            get(roll_handler),
        )
        .route(
            "/bb8/heading/{controller_id}/{device_id}/{heading}",
            get(heading_handler),
        )
        .route(
            "/bb8/color/{controller_id}/{device_id}/{color}",
            get(color_handler),
        )
        .route(
            "/bb8/blink/{controller_id}/{device_id}/{enabled}/{period}/{color}",
            get(blink_handler),
        )
        .route(
            "/bb8/path/{controller_id}/{device_id}/{speed}/{shape}",
            get(path_handler),
        )
        .route(CHANNEL_ROUTE, get(socket::channel_handler))
        .layer(middleware::from_fn(access_log_middleware))
        .with_state(relay)
}

fn relay_error(err: RelayError) -> ApiError {
    (
        err.status_code(),
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

fn invalid_param(name: &str, value: &str) -> ApiError {
    relay_error(RelayError::InvalidCommand(format!(
        "invalid {name}: {value}"
    )))
}

fn parse_decimal<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ApiError> {
    value.trim().parse().map_err(|_| invalid_param(name, value))
}

/// Speeds and headings may be fractional, as joystick clients compute them.
fn parse_number(name: &str, value: &str) -> Result<f64, ApiError> {
    match value.trim().parse::<f64>() {
        Ok(number) if number.is_finite() => Ok(number),
        _ => Err(invalid_param(name, value)),
    }
}

/// Colors arrive as bare hex digits, optionally with a `#` or `0x` prefix.
fn parse_hex_color(value: &str) -> Result<u32, ApiError> {
    let digits = value.trim();
    let digits = digits
        .strip_prefix('#')
        .or_else(|| digits.strip_prefix("0x"))
        .unwrap_or(digits);
    match u32::from_str_radix(digits, 16) {
        Ok(color) if color <= 0xFF_FF_FF => Ok(color),
        _ => Err(invalid_param("color", value)),
    }
}

fn parse_path_shape(value: &str) -> PathShape {
    if value.eq_ignore_ascii_case("square") {
        PathShape::Square
    } else {
        PathShape::Stop
    }
}
