//! Virtual device state
//!
//! A `VirtualDevice` carries the per-instance runtime state the three
//! actors share: the current interrupt-IN report (a versioned cell), the
//! bounded feedback queue toward the stream client, the single bound
//! stream session, and the USB/IP attachment flag. Every mutation is
//! guarded by one internal lock with short critical sections; waiting is
//! done outside the lock on `watch` and `Notify` primitives.

use crate::plugin::{DescriptorBundle, DevicePlugin, Direction};
use protocol::{DeviceRecord, InterfaceRecord};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, watch};
use tracing::{debug, warn};

/// Identifier of a bound stream session, unique per process
pub type SessionId = u64;

/// Versioned input report published to the USB/IP side.
///
/// The plugin zero report is published as version 1, so a reader whose
/// `last_seen` counter starts at 0 observes it immediately: an
/// interrupt-IN submit against a device that never saw a `set_input`
/// completes with the zero report instead of pending. Every `set_input`
/// increments the version, which is how `next_input` distinguishes
/// "fresh since my last read" from "already seen".
#[derive(Clone)]
pub struct InputFrame {
    pub version: u64,
    pub report: Arc<Vec<u8>>,
}

/// Why a stream bind attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindError {
    /// Another session already holds the device
    Conflict,
    /// The device was removed
    Removed,
}

struct DeviceState {
    stream: Option<SessionId>,
    /// Set on first bind; a claimed device survives the pending-claim timer
    claimed: bool,
    attached: bool,
    removed: bool,
    feedback: VecDeque<Vec<u8>>,
    feedback_dropped: u64,
}

pub struct VirtualDevice {
    bus_id: u32,
    dev_id: u32,
    plugin: Arc<dyn DevicePlugin>,
    bundle: DescriptorBundle,
    input_tx: watch::Sender<InputFrame>,
    state: Mutex<DeviceState>,
    feedback_notify: Notify,
    removed_notify: Notify,
    feedback_capacity: usize,
}

impl std::fmt::Debug for VirtualDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualDevice")
            .field("bus_id", &self.bus_id)
            .field("dev_id", &self.dev_id)
            .finish()
    }
}

impl VirtualDevice {
    pub fn new(
        bus_id: u32,
        dev_id: u32,
        plugin: Arc<dyn DevicePlugin>,
        feedback_capacity: usize,
    ) -> Self {
        let bundle = plugin.descriptors();
        let zero = InputFrame {
            version: 1,
            report: Arc::new(plugin.zero_report()),
        };
        let (input_tx, _) = watch::channel(zero);
        Self {
            bus_id,
            dev_id,
            plugin,
            bundle,
            input_tx,
            state: Mutex::new(DeviceState {
                stream: None,
                claimed: false,
                attached: false,
                removed: false,
                feedback: VecDeque::new(),
                feedback_dropped: 0,
            }),
            feedback_notify: Notify::new(),
            removed_notify: Notify::new(),
            feedback_capacity,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.plugin.kind()
    }

    pub fn plugin(&self) -> &Arc<dyn DevicePlugin> {
        &self.plugin
    }

    pub fn bundle(&self) -> &DescriptorBundle {
        &self.bundle
    }

    pub fn bus_id(&self) -> u32 {
        self.bus_id
    }

    pub fn dev_id(&self) -> u32 {
        self.dev_id
    }

    /// The `<bus>-<dev>` identity used on the USB/IP wire
    pub fn busid(&self) -> String {
        format!("{}-{}", self.bus_id, self.dev_id)
    }

    /// The devid field of URB headers for this device.
    ///
    /// The kernel forms this as `busnum << 16 | devnum` in wrapping C
    /// arithmetic; bus ids above 65535 wrap the same way here.
    pub fn devid(&self) -> u32 {
        self.bus_id.wrapping_shl(16) | self.dev_id
    }

    /// The exported-device record advertised to initiators
    pub fn record(&self) -> DeviceRecord {
        DeviceRecord {
            path: format!("/sys/devices/viiper/vhub/{}", self.busid()),
            busid: self.busid(),
            busnum: self.bus_id,
            devnum: self.dev_id,
            speed: self.bundle.speed,
            vendor_id: self.bundle.vendor_id,
            product_id: self.bundle.product_id,
            bcd_device: self.bundle.bcd_device,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            configuration_value: 1,
            num_configurations: 1,
            interfaces: vec![InterfaceRecord {
                class: self.bundle.interface_class,
                subclass: self.bundle.interface_subclass,
                protocol: self.bundle.interface_protocol,
            }],
        }
    }

    /// Replace the current input report and wake all `next_input` waiters.
    pub fn set_input(&self, report: Vec<u8>) {
        self.input_tx.send_modify(|frame| {
            frame.version += 1;
            frame.report = Arc::new(report);
        });
    }

    /// The report as of now, without version bookkeeping (GET_REPORT path).
    pub fn current_report(&self) -> Arc<Vec<u8>> {
        self.input_tx.borrow().report.clone()
    }

    /// Subscribe to input updates. Pair the receiver with a `last_seen`
    /// counter starting at 0 and pass both to [`next_input`].
    pub fn subscribe_input(&self) -> watch::Receiver<InputFrame> {
        self.input_tx.subscribe()
    }

    /// Queue one feedback frame for the bound stream.
    ///
    /// The buffer is bounded; on overflow the oldest frame is discarded
    /// and the overflow counter incremented.
    pub fn queue_feedback(&self, frame: Vec<u8>) {
        {
            let mut st = self.state.lock().unwrap();
            if st.removed {
                return;
            }
            if st.feedback.len() >= self.feedback_capacity {
                st.feedback.pop_front();
                st.feedback_dropped += 1;
                warn!(
                    device = %self.busid(),
                    dropped = st.feedback_dropped,
                    "feedback queue overflow, dropped oldest frame"
                );
            }
            st.feedback.push_back(frame);
        }
        self.feedback_notify.notify_waiters();
    }

    /// Await the next feedback frame for `session`.
    ///
    /// Returns None once the session is no longer bound or the device is
    /// removed; frames queued before the bind are delivered first.
    pub async fn next_feedback(&self, session: SessionId) -> Option<Vec<u8>> {
        loop {
            let notified = self.feedback_notify.notified();
            {
                let mut st = self.state.lock().unwrap();
                if st.removed || st.stream != Some(session) {
                    return None;
                }
                if let Some(frame) = st.feedback.pop_front() {
                    return Some(frame);
                }
            }
            notified.await;
        }
    }

    pub fn feedback_dropped(&self) -> u64 {
        self.state.lock().unwrap().feedback_dropped
    }

    /// Atomically claim the device for a stream session.
    pub fn bind_stream(&self, session: SessionId) -> Result<(), BindError> {
        let mut st = self.state.lock().unwrap();
        if st.removed {
            return Err(BindError::Removed);
        }
        if st.stream.is_some() {
            return Err(BindError::Conflict);
        }
        st.stream = Some(session);
        st.claimed = true;
        debug!(device = %self.busid(), session, "stream bound");
        Ok(())
    }

    /// Release the device if `session` is the current holder; idempotent.
    pub fn unbind_stream(&self, session: SessionId) {
        let changed = {
            let mut st = self.state.lock().unwrap();
            if st.stream == Some(session) {
                st.stream = None;
                true
            } else {
                false
            }
        };
        if changed {
            debug!(device = %self.busid(), session, "stream unbound");
            // Wake the feedback pump so it observes the unbind.
            self.feedback_notify.notify_waiters();
        }
    }

    pub fn has_stream(&self) -> bool {
        self.state.lock().unwrap().stream.is_some()
    }

    pub fn is_claimed(&self) -> bool {
        self.state.lock().unwrap().claimed
    }

    /// Claim the single USB/IP attachment slot.
    pub fn try_attach(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.removed || st.attached {
            return false;
        }
        st.attached = true;
        true
    }

    /// Release the attachment slot (initiator detached or transport lost).
    pub fn detach(&self) {
        self.state.lock().unwrap().attached = false;
    }

    pub fn is_attached(&self) -> bool {
        self.state.lock().unwrap().attached
    }

    /// Mark the device removed, waking every waiter. Terminal and
    /// idempotent: the USB/IP driver drains with `-ENODEV` and the stream
    /// pumps close when they observe it.
    pub fn mark_removed(&self) {
        {
            let mut st = self.state.lock().unwrap();
            st.removed = true;
        }
        self.removed_notify.notify_waiters();
        self.feedback_notify.notify_waiters();
    }

    /// Removal check-and-mark used by the pending-claim timer: removes
    /// only if no stream ever bound, atomically with respect to
    /// [`bind_stream`].
    pub fn mark_removed_if_unclaimed(&self) -> bool {
        let won = {
            let mut st = self.state.lock().unwrap();
            if st.claimed || st.removed {
                false
            } else {
                st.removed = true;
                true
            }
        };
        if won {
            self.removed_notify.notify_waiters();
            self.feedback_notify.notify_waiters();
        }
        won
    }

    pub fn is_removed(&self) -> bool {
        self.state.lock().unwrap().removed
    }

    /// Resolve when the device is removed.
    pub async fn wait_removed(&self) {
        loop {
            let notified = self.removed_notify.notified();
            if self.is_removed() {
                return;
            }
            notified.await;
        }
    }

    /// Size of the interrupt report in a direction, from the plugin.
    pub fn report_size(&self, direction: Direction) -> usize {
        self.plugin.report_size(direction)
    }
}

/// Await an input report fresher than `*last_seen`.
///
/// Level-triggered with latest-value semantics: if a `set_input` happened
/// since the caller's last read, the call returns immediately; otherwise
/// it parks until the next one. Returns None when the device is gone.
pub async fn next_input(
    rx: &mut watch::Receiver<InputFrame>,
    last_seen: &mut u64,
) -> Option<Arc<Vec<u8>>> {
    loop {
        {
            let frame = rx.borrow_and_update();
            if frame.version > *last_seen {
                *last_seen = frame.version;
                return Some(frame.report.clone());
            }
        }
        if rx.changed().await.is_err() {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{KeyboardPlugin, MousePlugin};
    use std::time::Duration;

    fn mouse_device() -> VirtualDevice {
        VirtualDevice::new(1, 1, Arc::new(MousePlugin), 4)
    }

    #[test]
    fn test_identity() {
        let device = VirtualDevice::new(80000, 1, Arc::new(KeyboardPlugin), 64);
        assert_eq!(device.busid(), "80000-1");
        assert_eq!(device.devid(), 80000u32.wrapping_shl(16) | 1);
        let record = device.record();
        assert_eq!(record.busid, "80000-1");
        assert_eq!(record.interfaces.len(), 1);
        assert_eq!(record.interfaces[0].class, 3);
    }

    #[test]
    fn test_bind_is_single_assignment() {
        let device = mouse_device();
        assert!(device.bind_stream(1).is_ok());
        assert_eq!(device.bind_stream(2), Err(BindError::Conflict));

        // Unbind by the wrong session is a no-op
        device.unbind_stream(2);
        assert!(device.has_stream());

        device.unbind_stream(1);
        assert!(!device.has_stream());
        // Idempotent
        device.unbind_stream(1);
        assert!(!device.has_stream());

        // Re-bind after explicit unbind is allowed
        assert!(device.bind_stream(2).is_ok());
    }

    #[test]
    fn test_bind_after_removal_fails() {
        let device = mouse_device();
        device.mark_removed();
        assert_eq!(device.bind_stream(1), Err(BindError::Removed));
    }

    #[test]
    fn test_claim_timer_race() {
        let device = mouse_device();
        // Bind wins by any margin: the timer check must not remove.
        assert!(device.bind_stream(1).is_ok());
        assert!(!device.mark_removed_if_unclaimed());
        assert!(!device.is_removed());

        // An unbound, never-claimed device is removed.
        let other = mouse_device();
        assert!(other.mark_removed_if_unclaimed());
        assert!(other.is_removed());

        // Unbind does not reset the claim.
        device.unbind_stream(1);
        assert!(!device.mark_removed_if_unclaimed());
    }

    #[test]
    fn test_feedback_overflow_drops_oldest() {
        let device = mouse_device();
        device.bind_stream(7).unwrap();
        for i in 0..6u8 {
            device.queue_feedback(vec![i]);
        }
        assert_eq!(device.feedback_dropped(), 2);
        let st = device.state.lock().unwrap();
        assert_eq!(st.feedback.front().unwrap(), &vec![2u8]);
        assert_eq!(st.feedback.len(), 4);
    }

    #[test]
    fn test_attach_slot_is_exclusive() {
        let device = mouse_device();
        assert!(device.try_attach());
        assert!(!device.try_attach());
        device.detach();
        assert!(device.try_attach());
    }

    #[tokio::test]
    async fn test_next_input_before_any_set_input_yields_zero_report() {
        // No stream, no set_input: the zero report is already published
        // and a fresh waiter must not park.
        let device = mouse_device();
        let mut rx = device.subscribe_input();
        let mut last_seen = 0u64;
        let report = tokio::time::timeout(
            Duration::from_secs(1),
            next_input(&mut rx, &mut last_seen),
        )
        .await
        .expect("zero report must complete immediately")
        .unwrap();
        assert_eq!(*report, vec![0u8; 5]);
        assert_eq!(last_seen, 1);

        // Having consumed it, the next read parks until real input.
        let pending = tokio::time::timeout(
            Duration::from_millis(50),
            next_input(&mut rx, &mut last_seen),
        )
        .await;
        assert!(pending.is_err(), "expected next_input to block");
    }

    #[tokio::test]
    async fn test_next_input_is_level_triggered() {
        let device = Arc::new(mouse_device());

        // A report set before the waiter arrives is returned immediately.
        device.set_input(vec![1, 2, 3, 4, 5]);
        let mut rx = device.subscribe_input();
        let mut last_seen = 0u64;
        let report = next_input(&mut rx, &mut last_seen).await.unwrap();
        assert_eq!(*report, vec![1, 2, 3, 4, 5]);

        // Nothing new: the next call parks.
        let pending = tokio::time::timeout(
            Duration::from_millis(50),
            next_input(&mut rx, &mut last_seen),
        )
        .await;
        assert!(pending.is_err(), "expected next_input to block");

        // A fresh set_input wakes it with the latest value.
        let waiter = {
            let device = device.clone();
            let mut rx = device.subscribe_input();
            let mut seen = last_seen;
            tokio::spawn(async move { next_input(&mut rx, &mut seen).await.map(|r| (*r).clone()) })
        };
        tokio::task::yield_now().await;
        device.set_input(vec![9, 0, 0, 0, 0]);
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.unwrap(), vec![9, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_next_input_collapses_to_latest() {
        let device = mouse_device();
        device.set_input(vec![1, 0, 0, 0, 0]);
        device.set_input(vec![2, 0, 0, 0, 0]);
        device.set_input(vec![3, 0, 0, 0, 0]);

        let mut rx = device.subscribe_input();
        let mut last_seen = 0u64;
        let report = next_input(&mut rx, &mut last_seen).await.unwrap();
        assert_eq!(*report, vec![3, 0, 0, 0, 0]);
        assert_eq!(last_seen, 4);
    }

    #[tokio::test]
    async fn test_feedback_delivery_and_unbind() {
        let device = Arc::new(mouse_device());
        device.bind_stream(5).unwrap();

        device.queue_feedback(vec![0xAA]);
        assert_eq!(device.next_feedback(5).await, Some(vec![0xAA]));

        // Unbind wakes and terminates the waiter.
        let waiter = {
            let device = device.clone();
            tokio::spawn(async move { device.next_feedback(5).await })
        };
        tokio::task::yield_now().await;
        device.unbind_stream(5);
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn test_feedback_queued_before_bind_is_delivered() {
        let device = mouse_device();
        device.queue_feedback(vec![0x01]);
        device.queue_feedback(vec![0x02]);

        device.bind_stream(9).unwrap();
        assert_eq!(device.next_feedback(9).await, Some(vec![0x01]));
        assert_eq!(device.next_feedback(9).await, Some(vec![0x02]));
    }

    #[tokio::test]
    async fn test_wait_removed() {
        let device = Arc::new(mouse_device());
        let waiter = {
            let device = device.clone();
            tokio::spawn(async move { device.wait_removed().await })
        };
        tokio::task::yield_now().await;
        device.mark_removed();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
