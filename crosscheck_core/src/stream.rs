use std::io::{BufRead, BufReader, Read};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, error};

/// Lifecycle of a [`StreamConsumer`] drain cycle.
///
/// A child process pipe has bounded capacity: if the supervising thread
/// blocks in `wait()` while the child fills its pipe, both sides block
/// forever. The consumer's worker thread drains the pipe independently of
/// the exit wait, and this state machine coordinates the handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Idle between invocations, ready for `attach`.
    Waiting,
    /// Worker is draining an attached stream.
    Consuming,
    /// Owner observed process exit; worker finishes the remaining drain.
    ShouldStopConsuming,
    /// Terminal: `terminate` was called, the worker has exited.
    Finished,
    /// Terminal: an invalid transition or an I/O failure occurred.
    Error,
}

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("invalid {op} on stream consumer '{name}' in state {from:?}")]
    InvalidTransition {
        name: &'static str,
        from: ConsumerState,
        op: &'static str,
    },

    #[error("stream consumer '{0}' entered the error state")]
    ConsumerFailed(&'static str),

    #[error("stream consumer lock poisoned")]
    Poisoned,
}

struct Inner {
    state: ConsumerState,
    stream: Option<Box<dyn Read + Send>>,
    lines: Vec<String>,
    output_ready: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    /// Signals the worker that a stream was attached, that exit was
    /// notified, or that the consumer is shutting down.
    work_pending: Condvar,
    /// Signals the owner that a full drain cycle completed (or failed).
    output_ready: Condvar,
}

/// Per-stream worker that drains a subprocess pipe concurrently with the
/// owner's exit wait.
///
/// Exactly one owner thread and one worker thread per instance. Created
/// once, reused across many invocations via `attach`/`collect_output`,
/// destroyed by `terminate`. Captured output is never observable before
/// both the exit notification and the worker's final drain have happened.
pub struct StreamConsumer {
    name: &'static str,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl StreamConsumer {
    pub fn new(name: &'static str) -> Self {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: ConsumerState::Waiting,
                stream: None,
                lines: Vec::new(),
                output_ready: false,
            }),
            work_pending: Condvar::new(),
            output_ready: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("stream-consumer-{name}"))
            .spawn(move || worker_loop(&worker_shared, name))
            .ok();
        if worker.is_none() {
            error!(consumer = name, "failed to spawn stream consumer worker");
        }
        Self {
            name,
            shared,
            worker,
        }
    }

    /// Hand a freshly opened pipe to the worker. Only valid from `Waiting`;
    /// clears the previous cycle's captured lines.
    pub fn attach(&self, stream: Box<dyn Read + Send>) -> Result<(), StreamError> {
        let mut inner = self
            .shared
            .inner
            .lock()
            .map_err(|_| StreamError::Poisoned)?;
        if inner.state != ConsumerState::Waiting {
            let from = inner.state;
            inner.state = ConsumerState::Error;
            inner.output_ready = true;
            self.shared.output_ready.notify_all();
            return Err(StreamError::InvalidTransition {
                name: self.name,
                from,
                op: "attach",
            });
        }
        inner.lines.clear();
        inner.output_ready = false;
        inner.stream = Some(stream);
        inner.state = ConsumerState::Consuming;
        self.shared.work_pending.notify_all();
        Ok(())
    }

    /// Tell the worker the child has exited, so the current drain is final.
    pub fn notify_process_exited(&self) -> Result<(), StreamError> {
        let mut inner = self
            .shared
            .inner
            .lock()
            .map_err(|_| StreamError::Poisoned)?;
        match inner.state {
            ConsumerState::Consuming => {
                inner.state = ConsumerState::ShouldStopConsuming;
                self.shared.work_pending.notify_all();
                Ok(())
            }
            from => {
                inner.state = ConsumerState::Error;
                inner.output_ready = true;
                self.shared.output_ready.notify_all();
                Err(StreamError::InvalidTransition {
                    name: self.name,
                    from,
                    op: "notify_process_exited",
                })
            }
        }
    }

    /// Block until the worker finished its final drain, then return an
    /// owned snapshot of the captured lines. The internal buffer is reused
    /// on the next `attach`, so the snapshot can never be mutated later.
    ///
    /// Must only be called after `attach` plus `notify_process_exited` for
    /// the current cycle.
    pub fn collect_output(&self) -> Result<Vec<String>, StreamError> {
        let mut inner = self
            .shared
            .inner
            .lock()
            .map_err(|_| StreamError::Poisoned)?;
        while !inner.output_ready {
            inner = self
                .shared
                .output_ready
                .wait(inner)
                .map_err(|_| StreamError::Poisoned)?;
        }
        if inner.state == ConsumerState::Error {
            // Leave the ready flag set so repeated collects keep failing
            // fast instead of blocking.
            return Err(StreamError::ConsumerFailed(self.name));
        }
        inner.output_ready = false;
        Ok(inner.lines.clone())
    }

    /// Shut the worker down and join it.
    pub fn terminate(&mut self) {
        if let Ok(mut inner) = self.shared.inner.lock() {
            inner.state = ConsumerState::Finished;
            self.shared.work_pending.notify_all();
            self.shared.output_ready.notify_all();
        }
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!(consumer = self.name, "stream consumer worker panicked");
            }
        }
    }
}

impl Drop for StreamConsumer {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn worker_loop(shared: &Shared, name: &'static str) {
    loop {
        // Wait for an attached stream or shutdown.
        let stream = {
            let mut inner = match shared.inner.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            loop {
                match inner.state {
                    ConsumerState::Finished => return,
                    ConsumerState::Consuming | ConsumerState::ShouldStopConsuming
                        if inner.stream.is_some() =>
                    {
                        break;
                    }
                    _ => {}
                }
                inner = match shared.work_pending.wait(inner) {
                    Ok(guard) => guard,
                    Err(_) => return,
                };
            }
            inner.stream.take()
        };
        let Some(stream) = stream else { continue };

        // Drain to EOF without holding the lock across reads, so the owner
        // can notify exit or terminate at any time.
        let mut failed = false;
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            match line {
                Ok(line) => {
                    let Ok(mut inner) = shared.inner.lock() else {
                        return;
                    };
                    inner.lines.push(line);
                    if inner.state == ConsumerState::Finished {
                        inner.output_ready = true;
                        shared.output_ready.notify_all();
                        return;
                    }
                }
                Err(e) => {
                    error!(consumer = name, "stream read failed: {e}");
                    failed = true;
                    break;
                }
            }
        }

        // EOF (or failure). Hold publication until the owner has signalled
        // process exit, so output is never observable mid-cycle. The ready
        // signal is released on every path, including errors, so the owner
        // is never left blocked in collect_output.
        let mut inner = match shared.inner.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        while inner.state == ConsumerState::Consuming {
            inner = match shared.work_pending.wait(inner) {
                Ok(guard) => guard,
                Err(_) => return,
            };
        }
        let finished = inner.state == ConsumerState::Finished;
        if !finished && inner.state != ConsumerState::Error {
            inner.state = if failed {
                ConsumerState::Error
            } else {
                ConsumerState::Waiting
            };
        }
        inner.output_ready = true;
        shared.output_ready.notify_all();
        debug!(consumer = name, lines = inner.lines.len(), "drain cycle complete");
        if finished {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::mpsc;
    use std::time::Duration;

    /// A `Read` fed over a channel, so tests can control exactly when data
    /// and EOF arrive relative to the exit notification.
    struct ChannelReader {
        rx: mpsc::Receiver<Vec<u8>>,
        pending: Vec<u8>,
    }

    impl ChannelReader {
        fn pair() -> (mpsc::Sender<Vec<u8>>, Self) {
            let (tx, rx) = mpsc::channel();
            (
                tx,
                Self {
                    rx,
                    pending: Vec::new(),
                },
            )
        }
    }

    impl Read for ChannelReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pending.is_empty() {
                match self.rx.recv() {
                    Ok(chunk) if chunk.is_empty() => return Ok(0),
                    Ok(chunk) => self.pending = chunk,
                    // Sender dropped: EOF.
                    Err(_) => return Ok(0),
                }
            }
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }
    }

    #[test]
    fn collects_lines_in_order_exactly_once() {
        let mut consumer = StreamConsumer::new("test-order");
        consumer
            .attach(Box::new(Cursor::new(b"one\ntwo\nthree\n".to_vec())))
            .unwrap();
        consumer.notify_process_exited().unwrap();
        let lines = consumer.collect_output().unwrap();
        assert_eq!(lines, vec!["one", "two", "three"]);

        // Reuse the same consumer for a second cycle: the previous
        // cycle's lines must not leak into the new snapshot.
        consumer
            .attach(Box::new(Cursor::new(b"four\n".to_vec())))
            .unwrap();
        consumer.notify_process_exited().unwrap();
        assert_eq!(consumer.collect_output().unwrap(), vec!["four"]);
        consumer.terminate();
    }

    #[test]
    fn exit_notified_before_any_output_still_completes() {
        let (tx, reader) = ChannelReader::pair();
        let mut consumer = StreamConsumer::new("test-early-exit");
        consumer.attach(Box::new(reader)).unwrap();
        consumer.notify_process_exited().unwrap();

        // Data shows up only after the exit notification.
        tx.send(b"late line\n".to_vec()).unwrap();
        drop(tx); // EOF

        assert_eq!(consumer.collect_output().unwrap(), vec!["late line"]);
        consumer.terminate();
    }

    #[test]
    fn output_not_published_before_exit_notification() {
        let (tx, reader) = ChannelReader::pair();
        let mut consumer = StreamConsumer::new("test-hold");
        consumer.attach(Box::new(reader)).unwrap();
        tx.send(b"early\n".to_vec()).unwrap();
        drop(tx); // worker reaches EOF well before exit is notified

        thread::sleep(Duration::from_millis(50));
        consumer.notify_process_exited().unwrap();
        assert_eq!(consumer.collect_output().unwrap(), vec!["early"]);
        consumer.terminate();
    }

    #[test]
    fn attach_while_consuming_is_an_invalid_transition() {
        let (tx, reader) = ChannelReader::pair();
        let mut consumer = StreamConsumer::new("test-invalid");
        consumer.attach(Box::new(reader)).unwrap();
        let err = consumer
            .attach(Box::new(Cursor::new(Vec::new())))
            .unwrap_err();
        assert!(matches!(err, StreamError::InvalidTransition { .. }));

        // The error state still releases the ready signal, so the owner
        // is not left blocked.
        assert!(matches!(
            consumer.collect_output(),
            Err(StreamError::ConsumerFailed(_))
        ));

        // Unblock the worker's read before joining it.
        drop(tx);
        consumer.terminate();
    }

    #[test]
    fn terminate_joins_worker_from_idle() {
        let mut consumer = StreamConsumer::new("test-idle-shutdown");
        consumer.terminate();
        assert!(consumer.worker.is_none());
    }

    #[test]
    fn defensive_copy_survives_reuse() {
        let mut consumer = StreamConsumer::new("test-snapshot");
        consumer
            .attach(Box::new(Cursor::new(b"snapshot\n".to_vec())))
            .unwrap();
        consumer.notify_process_exited().unwrap();
        let snapshot = consumer.collect_output().unwrap();

        consumer
            .attach(Box::new(Cursor::new(b"replacement\n".to_vec())))
            .unwrap();
        consumer.notify_process_exited().unwrap();
        let _ = consumer.collect_output().unwrap();

        assert_eq!(snapshot, vec!["snapshot"]);
        consumer.terminate();
    }
}
