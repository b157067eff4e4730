//! The cooperative task runtime. A task is a bounded input mailbox, a
//! reducer over private state, and the output mailboxes of its children;
//! running it means folding every received message through the reducer and
//! forwarding whatever comes back, under back-pressure from a bounded
//! output buffer.

use crate::error::TaskError;
use crate::message::Message;
use crate::queue::Queue;

use crossbeam::channel::{bounded, select, Receiver, Select, Sender};
use log::debug;
use std::thread;
use std::thread::JoinHandle;

/// A pure state transition: one message in, optionally one message (or a
/// `Batch`, flattened by the runtime) out.
pub type Reducer = Box<dyn FnMut(Message) -> Option<Message> + Send>;

/// Handle to a spawned task: its input mailbox, its output mailbox and a
/// shutdown line.
pub struct TaskHandle {
    input: Sender<Message>,
    output: Receiver<Message>,
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn send(&self, m: Message) -> Result<(), TaskError> {
        self.input.send(m)?;
        Ok(())
    }

    /// A clone of the input mailbox, for writers that outlive this handle.
    pub fn sender(&self) -> Sender<Message> {
        self.input.clone()
    }

    pub fn output(&self) -> &Receiver<Message> {
        &self.output
    }

    /// Signal shutdown and wait for the task and its children to exit.
    pub fn shutdown(self) {
        let _ = self.shutdown.send(());
        let _ = self.handle.join();
    }
}

/// Spawn a task in its own thread. Child outputs are folded into this
/// task's reducer alongside its own input; a shutdown signal propagates to
/// every child.
pub fn spawn(
    name: &'static str,
    capacity: usize,
    reducer: Reducer,
    children: Vec<TaskHandle>,
) -> TaskHandle {
    let (s_input, r_input) = bounded(capacity);
    let (s_output, r_output) = bounded(capacity);
    let (s_shutdown, r_shutdown) = bounded(1);
    let handle = thread::spawn(move || {
        let mut task = Task {
            name,
            reducer,
            children,
            buffer: Queue::with_capacity(capacity),
        };
        task.run(r_input, s_output, r_shutdown);
    });
    TaskHandle {
        input: s_input,
        output: r_output,
        shutdown: s_shutdown,
        handle,
    }
}

struct Task {
    name: &'static str,
    reducer: Reducer,
    children: Vec<TaskHandle>,
    buffer: Queue<Message>,
}

impl Task {
    fn run(&mut self, input: Receiver<Message>, output: Sender<Message>, shutdown: Receiver<()>) {
        let mut input_alive = true;
        let mut child_alive = vec![true; self.children.len()];

        loop {
            let mut sel = Select::new();
            let shutdown_idx = sel.recv(&shutdown);

            // a full buffer stops all reading until the output drains
            let can_read = !self.buffer.is_full();

            let pending = self.buffer.peek().cloned();
            let send_idx = match pending {
                Some(_) => Some(sel.send(&output)),
                None => None,
            };
            let input_idx = if input_alive && can_read {
                Some(sel.recv(&input))
            } else {
                None
            };
            let mut child_ops = Vec::new();
            if can_read {
                for (i, c) in self.children.iter().enumerate() {
                    if child_alive[i] {
                        child_ops.push((sel.recv(&c.output), i));
                    }
                }
            }

            if send_idx.is_none() && input_idx.is_none() && child_ops.is_empty() {
                debug!("[{}] all sources disconnected", self.name);
                break;
            }

            let op = sel.select();
            let idx = op.index();

            let received = if idx == shutdown_idx {
                let _ = op.recv(&shutdown);
                debug!("[{}] shutting down", self.name);
                break;
            } else if Some(idx) == send_idx {
                let m = pending.expect("a send op is only registered with a pending message");
                match op.send(&output, m) {
                    Ok(()) => {
                        self.buffer.pop();
                        continue;
                    }
                    Err(_) => {
                        debug!("[{}] output disconnected", self.name);
                        break;
                    }
                }
            } else if Some(idx) == input_idx {
                match op.recv(&input) {
                    Ok(m) => m,
                    Err(_) => {
                        input_alive = false;
                        continue;
                    }
                }
            } else {
                let ordinal = child_ops
                    .iter()
                    .find(|(s, _)| *s == idx)
                    .map(|(_, i)| *i)
                    .expect("selected index belongs to a registered source");
                match op.recv(&self.children[ordinal].output) {
                    Ok(m) => m,
                    Err(_) => {
                        child_alive[ordinal] = false;
                        continue;
                    }
                }
            };

            if let Some(out) = (self.reducer)(received) {
                if !self.enqueue(out, &output, &shutdown) {
                    break;
                }
            }
        }

        for c in self.children.drain(..) {
            c.shutdown();
        }
    }

    /// Flatten a reducer result into the bounded buffer, blocking on the
    /// output when the buffer is full. Returns false on shutdown or a
    /// closed output.
    fn enqueue(&mut self, msg: Message, output: &Sender<Message>, shutdown: &Receiver<()>) -> bool {
        match msg {
            Message::Batch(msgs) => {
                for m in msgs {
                    if !self.enqueue(m, output, shutdown) {
                        return false;
                    }
                }
                true
            }
            m => {
                while self.buffer.is_full() {
                    if !self.flush_front(output, shutdown) {
                        return false;
                    }
                }
                self.buffer.push(m);
                true
            }
        }
    }

    fn flush_front(&mut self, output: &Sender<Message>, shutdown: &Receiver<()>) -> bool {
        let front = match self.buffer.peek() {
            Some(m) => m.clone(),
            None => return true,
        };
        select! {
            send(output, front) -> res => {
                if res.is_err() {
                    debug!("[{}] output disconnected", self.name);
                    return false;
                }
                self.buffer.pop();
                true
            }
            recv(shutdown) -> _ => {
                debug!("[{}] shutting down while draining", self.name);
                false
            }
        }
    }
}
