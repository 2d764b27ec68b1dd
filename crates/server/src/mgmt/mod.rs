//! Management and device-stream listener
//!
//! One port serves both protocols. Every connection first passes the
//! session layer, then sends one NUL-terminated frame. A frame whose path
//! resolves to a management operation is answered with a single JSON line
//! and the connection closes; a frame matching `bus/<bus>/<dev>` promotes
//! the connection into a stream session (see [`stream`]).

pub mod router;
pub mod stream;

use crate::service::ServerCtx;
use crate::vbus::VirtualDevice;
use anyhow::Result;
use common::{SecureReader, SecureWriter};
use protocol::{MAX_REQUEST_SIZE, Problem, encode_reply, parse_request};
use router::Route;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Serialize)]
struct OkReply {
    ok: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BusListReply {
    buses: Vec<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BusCreateReply {
    bus_id: u32,
}

#[derive(Serialize)]
struct DeviceAddReply {
    id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceEntry {
    bus_id: u32,
    dev_id: String,
    vid: u16,
    pid: u16,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Serialize)]
struct DeviceListReply {
    devices: Vec<DeviceEntry>,
}

#[derive(Deserialize)]
struct DeviceAddPayload {
    #[serde(rename = "type")]
    kind: String,
}

impl DeviceEntry {
    fn from_device(device: &VirtualDevice) -> Self {
        Self {
            bus_id: device.bus_id(),
            dev_id: device.dev_id().to_string(),
            vid: device.bundle().vendor_id,
            pid: device.bundle().product_id,
            kind: device.kind().to_string(),
        }
    }
}

/// Accept loop for the management/stream port.
pub async fn run(ctx: Arc<ServerCtx>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("management accept failed: {}", e);
                        continue;
                    }
                };
                debug!(%peer, "management connection");
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(ctx, socket).await {
                        debug!(%peer, "management connection ended: {:#}", e);
                    }
                });
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn handle_connection(ctx: Arc<ServerCtx>, socket: tokio::net::TcpStream) -> Result<()> {
    socket.set_nodelay(true).ok();
    let (mut reader, mut writer) = ctx.establish(socket).await?;

    let frame = match tokio::time::timeout(
        ctx.limits.request_timeout,
        reader.read_until_nul(MAX_REQUEST_SIZE),
    )
    .await
    {
        Ok(Ok(Some(frame))) => frame,
        Ok(Ok(None)) => return Ok(()), // closed without a request
        Ok(Err(e)) => {
            reply(&mut writer, &Problem::bad_request(e.to_string())).await;
            return Ok(());
        }
        Err(_) => {
            reply(&mut writer, &Problem::timeout("no request within deadline")).await;
            return Ok(());
        }
    };

    let request = match parse_request(&frame) {
        Ok(request) => request,
        Err(e) => {
            reply(&mut writer, &Problem::bad_request(e.to_string())).await;
            return Ok(());
        }
    };

    let route = match router::route(request.path) {
        Ok(route) => route,
        Err(problem) => {
            reply(&mut writer, &problem).await;
            return Ok(());
        }
    };

    if let Route::StreamActivate { bus, dev } = route {
        return stream::run_stream(&ctx, bus, dev, reader, writer).await;
    }

    let payload = request.payload.to_vec();
    let outcome = tokio::time::timeout(
        ctx.limits.request_timeout,
        dispatch(&ctx, route, &payload),
    )
    .await
    .unwrap_or_else(|_| Err(Problem::timeout("request processing exceeded deadline")));

    match outcome {
        Ok(value) => reply(&mut writer, &value).await,
        Err(problem) => reply(&mut writer, &problem).await,
    }
    Ok(())
}

async fn reply<T: Serialize>(writer: &mut SecureWriter, value: &T) {
    match encode_reply(value) {
        Ok(line) => {
            let _ = writer.write_all(&line).await;
            let _ = writer.flush().await;
        }
        Err(e) => warn!("failed to encode reply: {}", e),
    }
    let _ = writer.shutdown().await;
}

/// Execute one management operation.
async fn dispatch(ctx: &Arc<ServerCtx>, route: Route, payload: &[u8]) -> Result<Value, Problem> {
    let registry = &ctx.registry;
    match route {
        Route::Ping => to_value(&OkReply { ok: true }),

        Route::BusList => to_value(&BusListReply {
            buses: registry.list_buses().await,
        }),

        Route::BusCreate => {
            let requested = match payload_str(payload)? {
                "" => None,
                text => Some(parse_decimal(text, "bus id")?),
            };
            let bus_id = registry
                .create_bus(requested)
                .await
                .map_err(|e| e.to_problem())?;
            to_value(&BusCreateReply { bus_id })
        }

        Route::BusRemove => {
            let id = parse_decimal(payload_str(payload)?, "bus id")?;
            registry.remove_bus(id).await.map_err(|e| e.to_problem())?;
            to_value(&OkReply { ok: true })
        }

        Route::DeviceList { bus } => {
            let bus = registry
                .bus(bus)
                .await
                .ok_or_else(|| Problem::not_found(format!("no such bus: {bus}")))?;
            let devices = bus
                .list()
                .iter()
                .map(|device| DeviceEntry::from_device(device))
                .collect();
            to_value(&DeviceListReply { devices })
        }

        Route::DeviceAdd { bus } => {
            let kind = parse_device_kind(payload)?;
            let device = registry
                .add_device(bus, &kind)
                .await
                .map_err(|e| e.to_problem())?;
            to_value(&DeviceAddReply { id: device.busid() })
        }

        Route::DeviceRemove { bus } => {
            let dev = parse_decimal(payload_str(payload)?, "device id")?;
            registry
                .remove_device(bus, dev)
                .await
                .map_err(|e| e.to_problem())?;
            to_value(&OkReply { ok: true })
        }

        Route::StreamActivate { .. } => {
            unreachable!("stream activation is handled before dispatch")
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, Problem> {
    serde_json::to_value(value).map_err(|e| Problem::internal(e.to_string()))
}

fn payload_str(payload: &[u8]) -> Result<&str, Problem> {
    std::str::from_utf8(payload)
        .map(str::trim)
        .map_err(|_| Problem::bad_request("payload is not UTF-8"))
}

fn parse_decimal(text: &str, what: &str) -> Result<u32, Problem> {
    if text.is_empty() {
        return Err(Problem::bad_request(format!("missing {what}")));
    }
    text.parse()
        .map_err(|_| Problem::bad_request(format!("invalid {what}: '{text}'")))
}

/// Device kind payload: a bare kind string or JSON `{"type":"…"}`.
fn parse_device_kind(payload: &[u8]) -> Result<String, Problem> {
    let text = payload_str(payload)?;
    if text.is_empty() {
        return Err(Problem::bad_request("missing device kind"));
    }
    if text.starts_with('{') {
        let parsed: DeviceAddPayload = serde_json::from_str(text)
            .map_err(|e| Problem::bad_request(format!("invalid device payload: {e}")))?;
        Ok(parsed.kind)
    } else {
        Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::PluginSet;
    use crate::service::Limits;
    use crate::vbus::Registry;
    use std::time::Duration;

    fn test_ctx() -> Arc<ServerCtx> {
        Arc::new(ServerCtx {
            registry: Arc::new(Registry::new(
                PluginSet::builtin(),
                Duration::from_secs(5),
                64,
            )),
            auth: None,
            limits: Limits::default(),
        })
    }

    #[test]
    fn test_parse_device_kind() {
        assert_eq!(parse_device_kind(b"keyboard").unwrap(), "keyboard");
        assert_eq!(parse_device_kind(b"  mouse \n").unwrap(), "mouse");
        assert_eq!(
            parse_device_kind(b"{\"type\":\"gamepad\"}").unwrap(),
            "gamepad"
        );
        assert_eq!(parse_device_kind(b"").unwrap_err().status, 400);
        assert_eq!(parse_device_kind(b"{\"kind\":\"x\"}").unwrap_err().status, 400);
    }

    #[tokio::test]
    async fn test_dispatch_ping() {
        let ctx = test_ctx();
        let value = dispatch(&ctx, Route::Ping, b"").await.unwrap();
        assert_eq!(value, serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_dispatch_bus_lifecycle() {
        let ctx = test_ctx();

        let created = dispatch(&ctx, Route::BusCreate, b"").await.unwrap();
        assert_eq!(created, serde_json::json!({"busId": 1}));

        let listed = dispatch(&ctx, Route::BusList, b"").await.unwrap();
        assert_eq!(listed, serde_json::json!({"buses": [1]}));

        // Duplicate explicit id conflicts.
        let err = dispatch(&ctx, Route::BusCreate, b"1").await.unwrap_err();
        assert_eq!(err.status, 409);
        assert_eq!(err.title, "already-exists");

        let removed = dispatch(&ctx, Route::BusRemove, b"1").await.unwrap();
        assert_eq!(removed, serde_json::json!({"ok": true}));

        // Removing again yields the same error both times.
        let e1 = dispatch(&ctx, Route::BusRemove, b"1").await.unwrap_err();
        let e2 = dispatch(&ctx, Route::BusRemove, b"1").await.unwrap_err();
        assert_eq!(e1.status, 404);
        assert_eq!(e1, e2);
    }

    #[tokio::test]
    async fn test_dispatch_device_add_and_list() {
        let ctx = test_ctx();
        let created = dispatch(&ctx, Route::BusCreate, b"80000").await.unwrap();
        assert_eq!(created, serde_json::json!({"busId": 80000}));

        let added = dispatch(&ctx, Route::DeviceAdd { bus: 80000 }, b"keyboard")
            .await
            .unwrap();
        assert_eq!(added, serde_json::json!({"id": "80000-1"}));

        let listed = dispatch(&ctx, Route::DeviceList { bus: 80000 }, b"")
            .await
            .unwrap();
        let devices = listed.get("devices").unwrap().as_array().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0]["busId"], 80000);
        assert_eq!(devices[0]["devId"], "1");
        assert_eq!(devices[0]["type"], "keyboard");

        let err = dispatch(&ctx, Route::DeviceAdd { bus: 80000 }, b"warpdrive")
            .await
            .unwrap_err();
        assert_eq!(err.status, 400);

        let removed = dispatch(&ctx, Route::DeviceRemove { bus: 80000 }, b"1")
            .await
            .unwrap();
        assert_eq!(removed, serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_dispatch_errors() {
        let ctx = test_ctx();
        assert_eq!(
            dispatch(&ctx, Route::DeviceList { bus: 7 }, b"")
                .await
                .unwrap_err()
                .status,
            404
        );
        assert_eq!(
            dispatch(&ctx, Route::BusRemove, b"").await.unwrap_err().status,
            400
        );
        assert_eq!(
            dispatch(&ctx, Route::BusCreate, b"not-a-number")
                .await
                .unwrap_err()
                .status,
            400
        );
    }
}
