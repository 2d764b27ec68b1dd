//! Device stream sessions
//!
//! A connection whose first frame is `bus/<bus>/<dev>` is promoted to a
//! stream session: the single input source and feedback sink for that
//! device. After promotion the wire carries plugin-framed bytes in both
//! directions with no further framing from the core.
//!
//! The session splits into the input pump (this task: client frames →
//! `set_input`) and a spawned feedback pump (`next_feedback` → client).
//! Closing the transport unbinds the session but leaves the device; the
//! report freezes at its last value and feedback resumes buffering.

use crate::service::ServerCtx;
use crate::vbus::{BindError, SessionId, VirtualDevice};
use anyhow::Result;
use common::{SecureReader, SecureWriter};
use protocol::{Problem, encode_reply};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Upper bound on one plugin input frame (preamble + variable part)
const MAX_INPUT_FRAME: usize = 64 * 1024;

/// Promote a connection into a stream session bound to `bus`/`dev`.
pub async fn run_stream(
    ctx: &Arc<ServerCtx>,
    bus: u32,
    dev: u32,
    mut reader: SecureReader,
    mut writer: SecureWriter,
) -> Result<()> {
    let device = match ctx.registry.find_device(bus, dev).await {
        Ok(device) => device,
        Err(e) => {
            reply_problem(&mut writer, &e.to_problem()).await;
            return Ok(());
        }
    };

    let session: SessionId = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
    match device.bind_stream(session) {
        Ok(()) => {}
        Err(BindError::Conflict) => {
            warn!(device = %device.busid(), "stream activation conflict");
            let problem =
                Problem::conflict(format!("device {} already has a stream session", device.busid()));
            reply_problem(&mut writer, &problem).await;
            return Ok(());
        }
        Err(BindError::Removed) => {
            let problem = Problem::not_found(format!("no such device: {}", device.busid()));
            reply_problem(&mut writer, &problem).await;
            return Ok(());
        }
    }
    info!(device = %device.busid(), session, "stream session bound");

    let feedback_task = tokio::spawn(feedback_pump(device.clone(), session, writer));

    let pump_result = input_pump(&device, &mut reader).await;
    if let Err(e) = &pump_result {
        warn!(device = %device.busid(), session, "stream input error: {:#}", e);
    }

    device.unbind_stream(session);
    // The unbind wakes the feedback pump; give it a moment to finish.
    let _ = tokio::time::timeout(Duration::from_secs(1), feedback_task).await;
    info!(device = %device.busid(), session, "stream session closed");
    Ok(())
}

/// Client → device: decode plugin frames into input reports.
async fn input_pump(device: &Arc<VirtualDevice>, reader: &mut SecureReader) -> Result<()> {
    let plugin = device.plugin().clone();
    let preamble_len = plugin.input_preamble();
    anyhow::ensure!(preamble_len > 0, "plugin declares empty input preamble");

    let mut preamble = vec![0u8; preamble_len];
    loop {
        tokio::select! {
            read = reader.read_exact(&mut preamble) => {
                if read.is_err() {
                    // Client hung up; the device stays, input freezes.
                    return Ok(());
                }
            }
            _ = device.wait_removed() => return Ok(()),
        }

        let total = plugin.input_frame_len(&preamble)?;
        anyhow::ensure!(
            (preamble_len..=MAX_INPUT_FRAME).contains(&total),
            "plugin frame length {total} out of bounds"
        );
        let mut frame = preamble.clone();
        frame.resize(total, 0);
        if total > preamble_len {
            reader.read_exact(&mut frame[preamble_len..]).await?;
        }

        let report = plugin.decode_input(&frame)?;
        device.set_input(report);
    }
}

/// Device → client: deliver queued feedback frames in order.
async fn feedback_pump(device: Arc<VirtualDevice>, session: SessionId, mut writer: SecureWriter) {
    while let Some(frame) = device.next_feedback(session).await {
        if writer.write_all(&frame).await.is_err() {
            debug!(device = %device.busid(), session, "feedback write failed");
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn reply_problem(writer: &mut SecureWriter, problem: &Problem) {
    if let Ok(line) = encode_reply(problem) {
        let _ = writer.write_all(&line).await;
        let _ = writer.flush().await;
    }
    let _ = writer.shutdown().await;
}
