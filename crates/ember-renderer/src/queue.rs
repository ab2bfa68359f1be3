//! Command queues and fences
//!
//! Each [`CommandQueue`] owns a GPU timeline: a worker thread that executes
//! submitted command lists strictly in submission order and completes fence
//! values as it reaches them. The CPU synchronizes with the timeline only
//! through [`Fence`]s.

use crossbeam::channel::{self, Sender};
use ember_core::{ember_debug, EmberError, ErrorContext, LogCategory, Result};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::command::{Command, CommandContext};
use crate::device::GraphicsDevice;
use crate::executor::{self, QueueMessage};

/// Monotonic completion counter shared between a queue and its waiters
#[derive(Debug, Default)]
pub struct Fence {
    completed: AtomicU64,
    poisoned: AtomicBool,
    lock: Mutex<()>,
    condvar: Condvar,
}

impl Fence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completed_value(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    pub fn is_complete(&self, value: u64) -> bool {
        self.completed_value() >= value
    }

    /// Advance the completed value; never moves backwards
    pub(crate) fn complete(&self, value: u64) {
        self.completed.fetch_max(value, Ordering::AcqRel);
        let _guard = self.lock.lock();
        self.condvar.notify_all();
    }

    /// Block until the completed value reaches `value`
    pub fn wait(&self, value: u64) {
        if self.is_complete(value) {
            return;
        }
        let mut guard = self.lock.lock();
        while !self.is_complete(value) {
            self.condvar.wait(&mut guard);
        }
    }

    /// Wait with a deadline; returns whether `value` was reached
    pub fn wait_timeout(&self, value: u64, timeout: Duration) -> bool {
        if self.is_complete(value) {
            return true;
        }
        let mut guard = self.lock.lock();
        while !self.is_complete(value) {
            if self.condvar.wait_for(&mut guard, timeout).timed_out() {
                return self.is_complete(value);
            }
        }
        true
    }

    /// Release every waiter; used when the device is removed
    pub(crate) fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
        self.complete(u64::MAX);
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Direct,
    Compute,
    Copy,
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueKind::Direct => f.write_str("direct"),
            QueueKind::Compute => f.write_str("compute"),
            QueueKind::Copy => f.write_str("copy"),
        }
    }
}

/// Submits closed command contexts to a GPU timeline
pub struct CommandQueue {
    kind: QueueKind,
    device: GraphicsDevice,
    fence: Arc<Fence>,
    last_signaled: u64,
    sender: Option<Sender<QueueMessage>>,
    worker: Option<JoinHandle<()>>,
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("kind", &self.kind)
            .field("last_signaled", &self.last_signaled)
            .field("completed", &self.fence.completed_value())
            .finish()
    }
}

impl CommandQueue {
    #[tracing::instrument(skip(device))]
    pub fn new(device: &GraphicsDevice, kind: QueueKind) -> Result<Self> {
        device.check_alive()?;

        let fence = Arc::new(Fence::new());
        device.register_fence(&fence);

        let (sender, receiver) = channel::unbounded();
        let latency = Duration::from_micros(device.config().simulated_gpu_latency_us);
        let worker = {
            let device = device.clone();
            let fence = fence.clone();
            std::thread::Builder::new()
                .name(format!("ember-{}-queue", kind))
                .spawn(move || executor::run(device, fence, receiver, latency))?
        };

        tracing::debug!("Created {} command queue", kind);
        Ok(Self {
            kind,
            device: device.clone(),
            fence,
            last_signaled: 0,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn fence(&self) -> &Arc<Fence> {
        &self.fence
    }

    fn send(&self, message: QueueMessage) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| EmberError::contract(format!("The {} queue is shut down", self.kind)))?;
        sender.send(message).map_err(|_| {
            self.device.mark_removed("GPU timeline stopped");
            EmberError::device_removed(format!("The {} queue timeline stopped", self.kind))
        })
    }

    /// Submit a closed context. Execution is asynchronous; the context is
    /// done once the next signaled fence value completes.
    pub fn execute(&mut self, ctx: &mut CommandContext) -> Result<()> {
        self.device.check_alive()?;
        let commands: Vec<Command> = ctx.take_for_submission()?;
        let count = commands.len();

        self.send(QueueMessage::Execute(commands))?;
        ctx.mark_submitted(self.fence.clone(), self.last_signaled + 1);

        ember_debug!(
            LogCategory::Queue,
            "Submitted '{}' ({} commands) to the {} queue",
            ctx.name(),
            count,
            self.kind
        );
        Ok(())
    }

    /// Enqueue a fence signal after all work submitted so far
    pub fn signal(&mut self) -> Result<u64> {
        self.device.check_alive()?;
        let value = self.last_signaled + 1;
        self.send(QueueMessage::Signal(value))?;
        self.last_signaled = value;
        Ok(value)
    }

    /// Make this queue's timeline wait for `fence` to reach `value`
    pub fn gpu_wait(&mut self, fence: &Arc<Fence>, value: u64) -> Result<()> {
        self.device.check_alive()?;
        self.send(QueueMessage::Wait {
            fence: fence.clone(),
            value,
        })
    }

    /// Block until the timeline has reached `value`
    pub fn wait_for_fence(&self, value: u64) -> Result<()> {
        if value > self.last_signaled {
            return Err(EmberError::contract(format!(
                "Waiting for fence value {} that was never signaled (last {})",
                value, self.last_signaled
            ))
            .with_context(
                ErrorContext::new("wait_for_fence", "CommandQueue")
                    .with_metadata("queue", self.kind),
            ));
        }

        self.fence.wait(value);
        self.device.check_alive()
    }

    /// Block until the most recently signaled value completed
    pub fn wait_for_gpu(&self) -> Result<()> {
        self.wait_for_fence(self.last_signaled)
    }

    /// Signal and wait, draining everything submitted so far
    pub fn wait_for_idle(&mut self) -> Result<()> {
        let value = self.signal()?;
        self.wait_for_fence(value)
    }

    pub fn is_fence_complete(&self, value: u64) -> bool {
        self.fence.is_complete(value)
    }

    pub fn completed_fence_value(&self) -> u64 {
        self.fence.completed_value()
    }

    pub fn last_signaled_value(&self) -> u64 {
        self.last_signaled
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain what is queued and exit
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("The {} queue timeline panicked", self.kind);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::DeviceConfig;
    use pretty_assertions::assert_eq;
    use std::thread;

    fn device() -> GraphicsDevice {
        GraphicsDevice::new(DeviceConfig::default()).unwrap()
    }

    #[test]
    fn test_fence_is_monotonic() {
        let fence = Fence::new();
        fence.complete(5);
        fence.complete(3);
        assert_eq!(fence.completed_value(), 5);
        assert!(fence.is_complete(4));
        assert!(!fence.is_complete(6));
    }

    #[test]
    fn test_fence_wakes_waiter() {
        let fence = Arc::new(Fence::new());
        let waiter = {
            let fence = fence.clone();
            thread::spawn(move || fence.wait(2))
        };
        fence.complete(1);
        fence.complete(2);
        waiter.join().unwrap();
        assert!(!fence.wait_timeout(3, Duration::from_millis(10)));
    }

    #[test]
    fn test_signal_then_wait_for_gpu() {
        let device = device();
        let mut queue = CommandQueue::new(&device, QueueKind::Direct).unwrap();

        let value = queue.signal().unwrap();
        assert_eq!(value, 1);
        queue.wait_for_gpu().unwrap();
        assert!(queue.completed_fence_value() >= value);
    }

    #[test]
    fn test_wait_for_unsignaled_value_is_rejected() {
        let device = device();
        let queue = CommandQueue::new(&device, QueueKind::Direct).unwrap();
        assert!(queue.wait_for_fence(1).unwrap_err().is_contract_violation());
    }

    #[test]
    fn test_execute_requires_closed_context() {
        let device = device();
        let mut queue = CommandQueue::new(&device, QueueKind::Direct).unwrap();
        let mut ctx = CommandContext::new(&device, "open");

        assert!(queue.execute(&mut ctx).is_err());
        ctx.close().unwrap();
        queue.execute(&mut ctx).unwrap();
        assert!(ctx.state().is_submitted());

        // Submitting twice is a contract violation
        assert!(queue.execute(&mut ctx).is_err());

        // Reset waits for the fence of the submission
        assert!(ctx.reset().is_err());
        queue.signal().unwrap();
        queue.wait_for_gpu().unwrap();
        ctx.reset().unwrap();
        assert!(ctx.state().is_recording());
    }

    #[test]
    fn test_device_removal_wakes_waiters() {
        let device = device();
        let mut queue = CommandQueue::new(&device, QueueKind::Direct).unwrap();
        let fence = Arc::new(Fence::new());
        device.register_fence(&fence);

        // The timeline blocks on a fence nobody will signal
        queue.gpu_wait(&fence, 1).unwrap();
        let value = queue.signal().unwrap();

        let remover = {
            let device = device.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                device.mark_removed("simulated hang");
            })
        };

        let err = queue.wait_for_fence(value).unwrap_err();
        assert!(matches!(err, EmberError::DeviceRemoved { .. }));
        assert!(queue.fence().is_poisoned());
        remover.join().unwrap();

        assert!(queue.signal().is_err());
    }

    #[test]
    fn test_cross_queue_wait_orders_timelines() {
        let device = device();
        let mut copy = CommandQueue::new(&device, QueueKind::Copy).unwrap();
        let mut direct = CommandQueue::new(&device, QueueKind::Direct).unwrap();

        let upload_done = copy.signal().unwrap();
        direct.gpu_wait(copy.fence(), upload_done).unwrap();
        let value = direct.signal().unwrap();
        direct.wait_for_fence(value).unwrap();

        assert!(copy.is_fence_complete(upload_done));
    }
}
