//! USB/IP endpoint
//!
//! Listens for USB/IP initiators and drives each connection through the
//! three phases of the device-side protocol: the OP phase (device listing
//! and import), the URB loop (submit/unlink against the bound virtual
//! device), and detach (initiated by the peer closing the transport, by a
//! forced device removal, or by server shutdown).
//!
//! Per attachment the connection splits into three tasks: the reader owns
//! the transport and the in-flight table, a servicer completes
//! interrupt-IN submits from the device's input cell in arrival order, and
//! a writer serializes all replies onto the transport.

pub mod control;

use crate::service::ServerCtx;
use crate::usbip::control::{ControlResult, handle_control};
use crate::vbus::{VirtualDevice, next_input};
use anyhow::{Context, Result, bail};
use common::{SecureReader, SecureWriter};
use protocol::usbip::{
    OP_REQ_DEVLIST, OP_REQ_IMPORT, OP_STATUS_ERROR, ST_CONNRESET, ST_NODEV, ST_PIPE,
    USBIP_DIR_IN, USBIP_DIR_OUT,
};
use protocol::{
    HeaderBasic, OpHeader, SetupPacket, URB_HEADER_SIZE, UrbRequest, UrbRetSubmit,
    USBIP_VERSION, decode_busid, encode_op_devlist_reply, encode_op_import_reply,
    encode_ret_submit, encode_ret_unlink, parse_urb_request,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Bound on a single URB transfer buffer
const MAX_TRANSFER: usize = 2 * 1024 * 1024;

/// An interrupt-IN submit awaiting input
struct QueuedUrb {
    basic: HeaderBasic,
    buflen: usize,
}

/// In-flight interrupt-IN URBs: the FIFO of not-yet-serviced submits plus
/// the one the servicer currently holds (with its cancel channel).
#[derive(Default)]
struct InFlight {
    queue: VecDeque<QueuedUrb>,
    head: Option<(u32, oneshot::Sender<i32>)>,
}

/// Accept loop for the USB/IP port.
pub async fn run(ctx: Arc<ServerCtx>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("usbip accept failed: {}", e);
                        continue;
                    }
                };
                debug!(%peer, "usbip connection");
                let ctx = ctx.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(ctx, socket, shutdown).await {
                        debug!(%peer, "usbip connection ended: {:#}", e);
                    }
                });
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn handle_connection(
    ctx: Arc<ServerCtx>,
    socket: tokio::net::TcpStream,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    socket.set_nodelay(true).ok();
    let (mut reader, mut writer) = ctx.establish(socket).await?;

    // OP phase: serve devlist requests until an import succeeds or the
    // peer goes away.
    let device: Arc<VirtualDevice> = loop {
        let mut header_bytes = [0u8; 8];
        tokio::select! {
            read = reader.read_exact(&mut header_bytes) => {
                if read.is_err() {
                    return Ok(()); // peer closed between requests
                }
            }
            _ = shutdown.changed() => return Ok(()),
        }
        let header = OpHeader::read_from(&mut &header_bytes[..])?;
        if header.version != USBIP_VERSION {
            let reply = OpHeader::reply(header.code & 0x7FFF, OP_STATUS_ERROR);
            let mut out = Vec::new();
            reply.write_to(&mut out)?;
            writer.write_all(&out).await?;
            bail!("unsupported USB/IP version {:#06x}", header.version);
        }
        match header.code {
            OP_REQ_DEVLIST => {
                let devices = ctx.registry.all_devices().await;
                let records: Vec<_> = devices.iter().map(|d| d.record()).collect();
                info!(count = records.len(), "devlist requested");
                writer.write_all(&encode_op_devlist_reply(&records)?).await?;
            }
            OP_REQ_IMPORT => {
                let mut busid_bytes = [0u8; 32];
                reader.read_exact(&mut busid_bytes).await?;
                let busid = decode_busid(&busid_bytes);
                let Some(device) = ctx.registry.lookup_busid(&busid).await else {
                    warn!(%busid, "import of unknown device");
                    writer.write_all(&encode_op_import_reply(None)?).await?;
                    return Ok(());
                };
                if !device.try_attach() {
                    warn!(%busid, "import refused, device already attached");
                    writer.write_all(&encode_op_import_reply(None)?).await?;
                    return Ok(());
                }
                info!(%busid, "device imported");
                writer
                    .write_all(&encode_op_import_reply(Some(&device.record()))?)
                    .await?;
                break device;
            }
            code => {
                let reply = OpHeader::reply(code & 0x7FFF, OP_STATUS_ERROR);
                let mut out = Vec::new();
                reply.write_to(&mut out)?;
                writer.write_all(&out).await?;
                bail!("unknown OP code {:#06x}", code);
            }
        }
    };

    let result = run_attachment(&ctx, device.clone(), reader, writer, shutdown).await;
    device.detach();
    info!(device = %device.busid(), "attachment closed");
    result
}

/// Drive the URB loop for one imported device.
async fn run_attachment(
    ctx: &Arc<ServerCtx>,
    device: Arc<VirtualDevice>,
    mut reader: SecureReader,
    writer: SecureWriter,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let shared = Arc::new(Mutex::new(InFlight::default()));
    let notify = Arc::new(Notify::new());
    let (writer_tx, writer_rx) = mpsc::channel::<Vec<u8>>(128);
    let (done_tx, done_rx) = watch::channel(false);

    let writer_task = tokio::spawn(write_loop(writer, writer_rx));
    let servicer_task = tokio::spawn(service_interrupt_in(
        device.clone(),
        shared.clone(),
        notify.clone(),
        writer_tx.clone(),
        done_rx,
        shutdown.clone(),
    ));

    let in_ep = device.bundle().in_endpoint as u32;
    let out_ep = device.bundle().out_endpoint.map(|ep| ep as u32);

    let read_result: Result<()> = async {
        loop {
            let mut frame = [0u8; URB_HEADER_SIZE];
            tokio::select! {
                read = reader.read_exact(&mut frame) => {
                    if read.is_err() {
                        debug!(device = %device.busid(), "initiator detached");
                        return Ok(());
                    }
                }
                _ = device.wait_removed() => {
                    debug!(device = %device.busid(), "device removed, forcing detach");
                    return Ok(());
                }
                _ = shutdown.changed() => return Ok(()),
            }

            match parse_urb_request(&frame)? {
                UrbRequest::Submit(basic, cmd) => {
                    let buflen = cmd.transfer_buffer_length.max(0) as usize;
                    if buflen > MAX_TRANSFER {
                        bail!("transfer buffer of {} bytes exceeds limit", buflen);
                    }
                    let payload = if basic.direction == USBIP_DIR_OUT && buflen > 0 {
                        let mut payload = vec![0u8; buflen];
                        reader.read_exact(&mut payload).await.context("OUT payload")?;
                        payload
                    } else {
                        Vec::new()
                    };

                    if basic.ep == 0 {
                        let setup = SetupPacket::parse(&cmd.setup);
                        let reply = match handle_control(&device, &setup, &payload) {
                            ControlResult::In(data) => {
                                let n = data.len().min(buflen);
                                encode_ret_submit(&basic, &UrbRetSubmit::success(n as i32), &data[..n])
                            }
                            ControlResult::Ok => encode_ret_submit(
                                &basic,
                                &UrbRetSubmit::success(payload.len() as i32),
                                &[],
                            ),
                            ControlResult::Stall => {
                                encode_ret_submit(&basic, &UrbRetSubmit::error(ST_PIPE), &[])
                            }
                        };
                        if writer_tx.send(reply).await.is_err() {
                            return Ok(());
                        }
                    } else if basic.direction == USBIP_DIR_IN && basic.ep == in_ep {
                        shared
                            .lock()
                            .unwrap()
                            .queue
                            .push_back(QueuedUrb { basic, buflen });
                        notify.notify_one();
                    } else if basic.direction == USBIP_DIR_OUT && Some(basic.ep) == out_ep {
                        let frame = device.plugin().encode_feedback(&payload);
                        device.queue_feedback(frame);
                        let reply = encode_ret_submit(
                            &basic,
                            &UrbRetSubmit::success(payload.len() as i32),
                            &[],
                        );
                        if writer_tx.send(reply).await.is_err() {
                            return Ok(());
                        }
                    } else {
                        debug!(ep = basic.ep, direction = basic.direction, "submit to unknown endpoint");
                        let reply = encode_ret_submit(&basic, &UrbRetSubmit::error(ST_PIPE), &[]);
                        if writer_tx.send(reply).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                UrbRequest::Unlink(basic, unlink) => {
                    let target = unlink.unlink_seqnum;
                    enum Unlinked {
                        Head(oneshot::Sender<i32>),
                        Queued(QueuedUrb),
                        Unknown,
                    }
                    let unlinked = {
                        let mut inflight = shared.lock().unwrap();
                        if inflight.head.as_ref().is_some_and(|(seq, _)| *seq == target) {
                            let (_, cancel) = inflight.head.take().expect("checked above");
                            Unlinked::Head(cancel)
                        } else if let Some(pos) = inflight
                            .queue
                            .iter()
                            .position(|urb| urb.basic.seqnum == target)
                        {
                            Unlinked::Queued(inflight.queue.remove(pos).expect("checked above"))
                        } else {
                            Unlinked::Unknown
                        }
                    };
                    match unlinked {
                        Unlinked::Head(cancel) => {
                            // The servicer answers the submit with -ECONNRESET.
                            let _ = cancel.send(ST_CONNRESET);
                        }
                        Unlinked::Queued(urb) => {
                            let reply = encode_ret_submit(
                                &urb.basic,
                                &UrbRetSubmit::error(ST_CONNRESET),
                                &[],
                            );
                            if writer_tx.send(reply).await.is_err() {
                                return Ok(());
                            }
                        }
                        Unlinked::Unknown => {}
                    }
                    if writer_tx.send(encode_ret_unlink(&basic, 0)).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
    .await;

    // Signal the servicer, give it the drain window, then let the writer
    // flush whatever completions made it into the channel.
    let _ = done_tx.send(true);
    let drain = ctx.limits.drain_timeout;
    if tokio::time::timeout(drain, servicer_task).await.is_err() {
        warn!(device = %device.busid(), "URB servicer did not drain in time");
    }
    drop(writer_tx);
    let _ = tokio::time::timeout(Duration::from_secs(1), writer_task).await;

    read_result
}

async fn write_loop(mut writer: SecureWriter, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(frame) = rx.recv().await {
        if writer.write_all(&frame).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// What ended the wait for one interrupt-IN submit
enum Completion {
    Report(Arc<Vec<u8>>),
    Status(i32),
    Silent,
}

/// Complete interrupt-IN submits in arrival order from the input cell.
async fn service_interrupt_in(
    device: Arc<VirtualDevice>,
    shared: Arc<Mutex<InFlight>>,
    notify: Arc<Notify>,
    writer_tx: mpsc::Sender<Vec<u8>>,
    mut done: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut input_rx = device.subscribe_input();
    // The zero report is published as version 1, so the first poll on a
    // fresh attachment completes immediately even without a stream.
    let mut last_seen = 0u64;

    loop {
        let notified = notify.notified();
        let next = shared.lock().unwrap().queue.pop_front();
        let Some(urb) = next else {
            tokio::select! {
                _ = notified => continue,
                _ = device.wait_removed() => break,
                _ = done.changed() => break,
                _ = shutdown.changed() => break,
            }
        };

        let (cancel_tx, mut cancel_rx) = oneshot::channel::<i32>();
        shared.lock().unwrap().head = Some((urb.basic.seqnum, cancel_tx));

        let completion = tokio::select! {
            biased;
            status = &mut cancel_rx => Completion::Status(status.unwrap_or(ST_CONNRESET)),
            _ = device.wait_removed() => Completion::Status(ST_NODEV),
            _ = shutdown.changed() => Completion::Status(ST_NODEV),
            _ = done.changed() => Completion::Silent,
            report = next_input(&mut input_rx, &mut last_seen) => match report {
                Some(report) => Completion::Report(report),
                None => Completion::Status(ST_NODEV),
            },
        };
        shared.lock().unwrap().head = None;

        match completion {
            Completion::Report(report) => {
                let n = report.len().min(urb.buflen);
                let reply =
                    encode_ret_submit(&urb.basic, &UrbRetSubmit::success(n as i32), &report[..n]);
                if writer_tx.send(reply).await.is_err() {
                    break;
                }
            }
            Completion::Status(status) => {
                let reply = encode_ret_submit(&urb.basic, &UrbRetSubmit::error(status), &[]);
                if writer_tx.send(reply).await.is_err() {
                    break;
                }
                if status == ST_NODEV {
                    drain_with_status(&shared, &writer_tx, ST_NODEV).await;
                    break;
                }
            }
            Completion::Silent => break,
        }
    }

    // Forced detach completes whatever is still queued.
    if device.is_removed() {
        drain_with_status(&shared, &writer_tx, ST_NODEV).await;
    }
}

async fn drain_with_status(
    shared: &Arc<Mutex<InFlight>>,
    writer_tx: &mpsc::Sender<Vec<u8>>,
    status: i32,
) {
    loop {
        let next = shared.lock().unwrap().queue.pop_front();
        let Some(urb) = next else { break };
        let reply = encode_ret_submit(&urb.basic, &UrbRetSubmit::error(status), &[]);
        if writer_tx.send(reply).await.is_err() {
            break;
        }
    }
}
