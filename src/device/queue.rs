/*
    An out-of-order command queue.

    Every command carries an explicit wait list of events and produces a new
    event of its own. There is no implicit ordering between commands: two
    commands without a dependency may run at the same time on different workers.
    That is what lets independent reduction chains make progress concurrently
    while the host thread is free to do other things.

    Commands are handed to the workers in submission order. A worker that picks
    up a command first blocks on the command's wait list. Since a wait list can
    only contain events of commands that were submitted earlier (or events that
    are already complete), every dependency has already been picked up by some
    worker when we start waiting on it, so this can't deadlock no matter how
    few workers there are.

    A command that panics marks its event as failed, and everything downstream
    of a failed event fails as well without running.
*/
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::device::buffer::DeviceBuffer;
use crate::device::kernel::Kernel;
use crate::error::{KdeError, Result};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum EventStatus {
    Queued,
    Complete,
    Failed,
}

struct EventState {
    status: Mutex<EventStatus>,
    signal: Condvar,
    label: &'static str,
}

/// Completion handle of a device command.
#[derive(Clone)]
pub struct Event {
    state: Arc<EventState>,
}

impl Event {
    fn queued(label: &'static str) -> Event {
        Event {
            state: Arc::new(EventState {
                status: Mutex::new(EventStatus::Queued),
                signal: Condvar::new(),
                label,
            }),
        }
    }

    /// An event that is complete from the start. Handy as an empty dependency.
    pub fn completed() -> Event {
        let event = Event::queued("user");
        event.set(EventStatus::Complete);
        event
    }

    fn set(&self, status: EventStatus) {
        let mut current = self.state.status.lock();
        *current = status;
        self.state.signal.notify_all();
    }

    pub fn is_complete(&self) -> bool {
        *self.state.status.lock() == EventStatus::Complete
    }

    fn is_settled(&self) -> bool {
        *self.state.status.lock() != EventStatus::Queued
    }

    pub fn label(&self) -> &'static str {
        self.state.label
    }

    /// Blocks the calling thread until the command finished.
    pub fn wait(&self) -> Result<()> {
        let mut status = self.state.status.lock();
        while *status == EventStatus::Queued {
            self.state.signal.wait(&mut status);
        }
        match *status {
            EventStatus::Complete => Ok(()),
            _ => Err(KdeError::DeviceUnavailable(format!("command '{}' failed", self.state.label))),
        }
    }

    pub fn wait_all(events: &[Event]) -> Result<()> {
        for event in events {
            event.wait()?;
        }
        Ok(())
    }
}

type Work = Box<dyn FnOnce() + Send + 'static>;

struct Command {
    wait_list: Vec<Event>,
    work: Work,
    event: Event,
}

pub struct CommandQueue {
    sender: Mutex<Option<Sender<Command>>>,
    workers: Vec<JoinHandle<()>>,
    in_flight: Mutex<Vec<Event>>,
}

fn worker_loop(receiver: Arc<Mutex<Receiver<Command>>>) {
    loop {
        let command = {
            let receiver = receiver.lock();
            receiver.recv()
        };
        let Ok(command) = command else {
            // Queue was dropped
            return;
        };
        if Event::wait_all(&command.wait_list).is_err() {
            command.event.set(EventStatus::Failed);
            continue;
        }
        match catch_unwind(AssertUnwindSafe(command.work)) {
            Ok(()) => command.event.set(EventStatus::Complete),
            Err(_) => {
                tracing::error!(command = command.event.label(), "device command panicked");
                command.event.set(EventStatus::Failed)
            }
        }
    }
}

impl CommandQueue {
    pub fn new(n_workers: usize) -> Result<CommandQueue> {
        let (sender, receiver) = channel::<Command>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = Vec::with_capacity(n_workers.max(1));
        for i in 0..n_workers.max(1) {
            let receiver = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("kde-device-{}", i))
                .spawn(move || worker_loop(receiver))
                .map_err(|e| KdeError::DeviceUnavailable(format!("cannot start device worker: {}", e)))?;
            workers.push(handle);
        }
        Ok(CommandQueue {
            sender: Mutex::new(Some(sender)),
            workers,
            in_flight: Mutex::new(Vec::new()),
        })
    }

    pub fn enqueue<F>(&self, label: &'static str, wait_list: &[Event], work: F) -> Result<Event>
    where
        F: FnOnce() + Send + 'static,
    {
        let event = Event::queued(label);
        let command = Command { wait_list: wait_list.to_vec(), work: Box::new(work), event: event.clone() };
        {
            let sender = self.sender.lock();
            let sender = sender
                .as_ref()
                .ok_or_else(|| KdeError::DeviceUnavailable("command queue was shut down".into()))?;
            sender
                .send(command)
                .map_err(|_| KdeError::DeviceUnavailable("all device workers are gone".into()))?;
        }
        let mut in_flight = self.in_flight.lock();
        if in_flight.len() >= 64 {
            in_flight.retain(|e| !e.is_settled());
        }
        in_flight.push(event.clone());
        Ok(event)
    }

    /// Runs `body` once for every work item id in `0..global_size`.
    pub fn enqueue_kernel<F>(&self, kernel: &Kernel, global_size: usize, wait_list: &[Event], body: F) -> Result<Event>
    where
        F: Fn(usize) + Send + 'static,
    {
        self.enqueue(kernel.name(), wait_list, move || {
            for gid in 0..global_size {
                body(gid);
            }
        })
    }

    pub fn write_buffer<T>(&self, buffer: &DeviceBuffer<T>, offset: usize, data: Vec<T>, wait_list: &[Event]) -> Result<Event>
    where
        T: Copy + Default + Send + Sync + 'static,
    {
        if offset + data.len() > buffer.len() {
            return Err(KdeError::InvalidArgument(format!(
                "write of {} elements at offset {} overflows a buffer of {}",
                data.len(),
                offset,
                buffer.len()
            )));
        }
        let target = buffer.clone();
        self.enqueue("write_buffer", wait_list, move || {
            target.write()[offset..offset + data.len()].copy_from_slice(&data);
        })
    }

    /// Blocking read. Returns once every event in `wait_list` is complete.
    pub fn read_buffer<T>(&self, buffer: &DeviceBuffer<T>, offset: usize, len: usize, wait_list: &[Event]) -> Result<Vec<T>>
    where
        T: Copy + Default,
    {
        Event::wait_all(wait_list)?;
        let data = buffer.read();
        if offset + len > data.len() {
            return Err(KdeError::InvalidArgument(format!(
                "read of {} elements at offset {} overflows a buffer of {}",
                len,
                offset,
                data.len()
            )));
        }
        Ok(data[offset..offset + len].to_vec())
    }

    /// Waits for everything that was submitted so far.
    pub fn finish(&self) -> Result<()> {
        let pending: Vec<Event> = std::mem::take(&mut *self.in_flight.lock());
        Event::wait_all(&pending)
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        // Dropping the sender ends the worker loops once they drained the channel
        self.sender.lock().take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
