use super::*;

pub(super) async fn access_log_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let uri = request.uri().to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = started.elapsed().as_millis();
    if path != CHANNEL_ROUTE {
        info!(
            method = %method,
            uri = %uri,
            status = status.as_u16(),
            elapsed_ms = elapsed_ms,
            "http access"
        );
    }
    response
}

pub(super) async fn healthz_handler() -> Json<StatusResponse> {
    Json(StatusResponse { status: "ok" })
}

pub(super) async fn metrics_handler(State(relay): State<Relay>) -> impl IntoResponse {
    let connected_controllers = relay.sessions().len().await;
    let pending_results = relay.router().pending_count().await;
    let metrics = relay.router().metrics();
    let text = format!(
        concat!(
            "iot_relay_uptime_seconds {}\n",
            "iot_relay_connected_controllers {}\n",
            "iot_relay_pending_results {}\n",
            "iot_relay_commands_sent_total {}\n",
            "iot_relay_command_results_ok_total {}\n",
            "iot_relay_command_results_error_total {}\n"
        ),
        metrics.started_at.elapsed().as_secs(),
        connected_controllers,
        pending_results,
        metrics.commands_sent_total.load(Ordering::Relaxed),
        metrics.results_ok_total.load(Ordering::Relaxed),
        metrics.results_error_total.load(Ordering::Relaxed),
    );
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        text,
    )
}

pub(super) async fn list_controllers_handler(
    State(relay): State<Relay>,
) -> Json<Vec<ControllerInfo>> {
    Json(relay.sessions().connected_controllers().await)
}

pub(super) async fn list_devices_handler(
    State(relay): State<Relay>,
    Path(controller_id): Path<String>,
) -> Result<Json<Vec<DeviceSummary>>, ApiError> {
    relay
        .sessions()
        .available_devices(&controller_id)
        .await
        .map(Json)
        .map_err(relay_error)
}

pub(super) async fn connect_handler(
    State(relay): State<Relay>,
    Path((controller_id, device_id)): Path<(String, String)>,
) -> Result<Json<String>, ApiError> {
    let command = Command::new(device_id, CommandAction::Connect).with_result();
    match relay.router().send_command(&controller_id, command).await {
        Ok(Some(result)) => Ok(Json(result.status)),
        Ok(None) => Ok(Json(STATUS_DONE.to_string())),
        Err(err) => {
            warn!(controller_id = %controller_id, "connect failed: {err}");
            Err(relay_error(err))
        }
    }
}

pub(super) async fn roll_handler(
    State(relay): State<Relay>,
    Path((controller_id, device_id, speed, heading)): Path<(String, String, String, String)>,
) -> Result<Json<&'static str>, ApiError> {
    let action = CommandAction::Roll(RollArgs {
        speed: parse_number("speed", &speed)?,
        heading: parse_number("heading", &heading)?,
    });
    fire_and_forget(&relay, &controller_id, device_id, action).await
}

pub(super) async fn heading_handler(
    State(relay): State<Relay>,
    Path((controller_id, device_id, heading)): Path<(String, String, String)>,
) -> Result<Json<&'static str>, ApiError> {
    let action = CommandAction::Heading(HeadingArgs {
        heading: parse_number("heading", &heading)?,
    });
    fire_and_forget(&relay, &controller_id, device_id, action).await
}

pub(super) async fn color_handler(
    State(relay): State<Relay>,
    Path((controller_id, device_id, color)): Path<(String, String, String)>,
) -> Result<Json<&'static str>, ApiError> {
    let action = CommandAction::Color(ColorArgs {
        color: parse_hex_color(&color)?,
    });
    fire_and_forget(&relay, &controller_id, device_id, action).await
}

pub(super) async fn blink_handler(
    State(relay): State<Relay>,
    Path((controller_id, device_id, enabled, period, color)): Path<(
        String,
        String,
        String,
        String,
        String,
    )>,
) -> Result<Json<&'static str>, ApiError> {
    let action = CommandAction::Blink(BlinkArgs {
        enabled: enabled == "true",
        period: parse_decimal("period", &period)?,
        color: parse_hex_color(&color)?,
    });
    fire_and_forget(&relay, &controller_id, device_id, action).await
}

pub(super) async fn path_handler(
    State(relay): State<Relay>,
    Path((controller_id, device_id, speed, shape)): Path<(String, String, String, String)>,
) -> Result<Json<&'static str>, ApiError> {
    let action = CommandAction::Path(PathArgs {
        speed: parse_number("speed", &speed)?,
        shape: parse_path_shape(&shape),
        length: PATH_SIDE_LENGTH,
    });
    fire_and_forget(&relay, &controller_id, device_id, action).await
}

async fn fire_and_forget(
    relay: &Relay,
    controller_id: &str,
    device_id: String,
    action: CommandAction,
) -> Result<Json<&'static str>, ApiError> {
    relay
        .router()
        .send_command(controller_id, Command::new(device_id, action))
        .await
        .map_err(relay_error)?;
    Ok(Json(STATUS_DONE))
}
