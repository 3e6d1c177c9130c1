use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use super::{Address, Backend, Message, Reply};
use crate::{FrontendError, Result};

enum Command {
    Request(Message, mpsc::Sender<Result<Reply>>),
    Post(Message),
    Shutdown,
}

/// Runs a backend on its own thread and talks to it over channels.
///
/// Requests and posts are delivered to the worker in the order they were
/// issued; output produced by the worker is queued until [`Backend::poll`]
/// picks it up.
pub struct ChannelBackend {
    address: Address,
    commands: mpsc::Sender<Command>,
    events: mpsc::Receiver<Message>,
    worker: Option<thread::JoinHandle<()>>,
}

/// Moves `backend` onto a worker thread that advances it every `tick`.
pub fn spawn<B>(mut backend: B, tick: Duration) -> ChannelBackend
where
    B: Backend + 'static,
{
    let address = backend.address();
    let (command_tx, command_rx) = mpsc::channel::<Command>();
    let (event_tx, event_rx) = mpsc::channel::<Message>();

    let worker = thread::spawn(move || loop {
        match command_rx.recv_timeout(tick) {
            Ok(Command::Request(msg, reply_tx)) => {
                let _ = reply_tx.send(backend.request(msg));
            }
            Ok(Command::Post(msg)) => {
                if let Err(err) = backend.post(msg) {
                    warn!(%err, "backend rejected posted message");
                }
            }
            Ok(Command::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                debug!(?address, "backend worker shutting down");
                break;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                while let Some(msg) = backend.poll() {
                    if event_tx.send(msg).is_err() {
                        return;
                    }
                }
            }
        }
    });

    ChannelBackend {
        address,
        commands: command_tx,
        events: event_rx,
        worker: Some(worker),
    }
}

impl Backend for ChannelBackend {
    fn address(&self) -> Address {
        self.address
    }

    fn request(&mut self, msg: Message) -> Result<Reply> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.commands
            .send(Command::Request(msg, reply_tx))
            .map_err(|_| FrontendError::msg("backend worker is gone"))?;
        reply_rx
            .recv()
            .map_err(|_| FrontendError::msg("backend worker dropped the request"))?
    }

    fn post(&mut self, msg: Message) -> Result<()> {
        self.commands
            .send(Command::Post(msg))
            .map_err(|_| FrontendError::msg("backend worker is gone"))
    }

    fn poll(&mut self) -> Option<Message> {
        self.events.try_recv().ok()
    }
}

impl Drop for ChannelBackend {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
