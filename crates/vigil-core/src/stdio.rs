//! Child-side ends of the stdio queue bridge.
//!
//! Inside a spawned child, stdin carries JSON-line messages from the parent
//! and stdout carries messages back. [`ChildIo`] turns both streams into
//! queues: a reader thread routes `stop` messages to the control queue and
//! everything else to the inbound queue; the outbound queue writes each
//! message as one line.
//!
//! The parent only sends inbound messages the child asked for. Readers call
//! [`MessageQueue::request`] with the number of messages they can take;
//! [`PullQueue`] turns that into demand lines and acknowledges every message
//! it hands out.

use std::fmt;
use std::io::{BufRead, BufReader, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, VigilError};
use crate::process::write_line;
use crate::queue::{LocalQueue, Message, MessageQueue, SharedQueue};

/// Queues of a child process.
#[derive(Debug, Clone)]
pub struct ChildIo {
    /// Messages from the parent
    pub inbound: SharedQueue,
    /// Control messages from the parent
    pub control: SharedQueue,
    /// Messages to the parent
    pub outbound: SharedQueue,
}

impl ChildIo {
    /// Bridge the process' own stdin and stdout.
    pub fn attach_stdio() -> Result<Self> {
        Self::new(BufReader::new(std::io::stdin()), std::io::stdout())
    }

    /// Bridge arbitrary streams.
    pub fn new<R, W>(reader: R, writer: W) -> Result<Self>
    where
        R: BufRead + Send + 'static,
        W: Write + Send + 'static,
    {
        let control = LocalQueue::shared("child:control");
        let outbound: SharedQueue = Arc::new(WriterQueue::new("child:outbound", writer));
        let inbound: SharedQueue = Arc::new(PullQueue::new("child:inbound", Arc::clone(&outbound)));

        let routed_inbound = Arc::clone(&inbound);
        let routed_control = Arc::clone(&control);
        thread::Builder::new()
            .name("vigil-stdin".into())
            .spawn(move || route_lines(reader, &routed_inbound, &routed_control))
            .map_err(|e| VigilError::internal(format!("starting stdin reader: {e}")))?;

        Ok(Self {
            inbound,
            control,
            outbound,
        })
    }
}

fn route_lines<R: BufRead>(reader: R, inbound: &SharedQueue, control: &SharedQueue) {
    for line in reader.lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let message = match serde_json::from_str::<Message>(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "discarding malformed parent message");
                continue;
            }
        };
        let target = if message.is_stop() { control } else { inbound };
        if target.put(message).is_err() {
            break;
        }
    }
    debug!("parent input closed");
    inbound.close();
}

/// Inbound queue filled by the parent on request.
///
/// `outstanding` counts messages asked for and not handed out yet, whether
/// still with the parent or already buffered here.
#[derive(Debug)]
pub struct PullQueue {
    buffer: LocalQueue,
    parent: SharedQueue,
    outstanding: AtomicUsize,
}

impl PullQueue {
    /// Queue sending its demand and acknowledgements through `parent`.
    pub fn new(name: impl Into<String>, parent: SharedQueue) -> Self {
        Self {
            buffer: LocalQueue::new(name),
            parent,
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Messages asked for and not handed out yet.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

impl MessageQueue for PullQueue {
    fn put(&self, message: Message) -> Result<()> {
        self.buffer.put(message)
    }

    fn try_get(&self) -> Result<Option<Message>> {
        let Some(message) = self.buffer.try_get()? else {
            return Ok(None);
        };
        let _ = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
        if let Err(e) = self.parent.put(Message::ack()) {
            debug!(error = %e, "acknowledgement not sent");
        }
        Ok(Some(message))
    }

    fn len(&self) -> usize {
        self.buffer.len()
    }

    fn close(&self) {
        self.buffer.close();
    }

    fn is_closed(&self) -> bool {
        self.buffer.is_closed()
    }

    fn request(&self, count: usize) -> Result<()> {
        if self.is_closed() {
            return Err(VigilError::queue_closed(self.buffer.name()));
        }
        let outstanding = self.outstanding();
        if count <= outstanding {
            return Ok(());
        }
        let extra = count - outstanding;
        self.parent.put(Message::demand(extra))?;
        self.outstanding.fetch_add(extra, Ordering::SeqCst);
        Ok(())
    }
}

/// Outbound queue writing JSON lines to a stream.
///
/// Never holds messages: `len` is always zero and `try_get` always empty.
pub struct WriterQueue<W: Write + Send> {
    name: String,
    writer: Mutex<W>,
    closed: AtomicBool,
}

impl<W: Write + Send> WriterQueue<W> {
    pub fn new(name: impl Into<String>, writer: W) -> Self {
        Self {
            name: name.into(),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        }
    }
}

impl<W: Write + Send> fmt::Debug for WriterQueue<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterQueue")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<W: Write + Send> MessageQueue for WriterQueue<W> {
    fn put(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(VigilError::queue_closed(&self.name));
        }
        let mut writer = self.writer.lock();
        let written = write_line(&mut *writer, &message).and_then(|()| writer.flush());
        if written.is_err() {
            self.closed.store(true, Ordering::SeqCst);
            return Err(VigilError::queue_closed(&self.name));
        }
        Ok(())
    }

    fn try_get(&self) -> Result<Option<Message>> {
        Ok(None)
    }

    fn len(&self) -> usize {
        0
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
