use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{CommandRunner, NOTHING_TO_COLLECT};
use crate::Result;

const KILL_POLL: Duration = Duration::from_millis(10);
// How long `collect` waits for output pipes to close after the shell exits.
const READER_GRACE: Duration = Duration::from_millis(100);

/// Runs shellouts through the platform shell.
#[derive(Debug)]
pub struct ProcessRunner {
    permitted: bool,
    child: Option<Child>,
    readers: Vec<JoinHandle<()>>,
    output: Arc<Mutex<Vec<u8>>>,
    exit: Option<i32>,
}

impl ProcessRunner {
    pub fn new(permitted: bool) -> Self {
        Self {
            permitted,
            child: None,
            readers: Vec::new(),
            output: Arc::default(),
            exit: None,
        }
    }

    fn shell(line: &str) -> Command {
        #[cfg(windows)]
        {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(line);
            cmd
        }
        #[cfg(not(windows))]
        {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(line);
            cmd
        }
    }

    fn drain<R: Read + Send + 'static>(&mut self, source: Option<R>) {
        let Some(mut source) = source else {
            return;
        };
        let sink = Arc::clone(&self.output);
        self.readers.push(thread::spawn(move || {
            let mut chunk = [0u8; 4096];
            loop {
                match source.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => match sink.lock() {
                        Ok(mut out) => out.extend_from_slice(&chunk[..n]),
                        Err(_) => break,
                    },
                }
            }
        }));
    }

    fn reap(&mut self, code: i32) {
        self.child = None;
        self.exit = Some(code);
    }

    /// Joins the output readers. A reader whose pipe is still held open,
    /// typically by a background grandchild, is left behind after a short
    /// grace period.
    fn finish_readers(&mut self) {
        let deadline = Instant::now() + READER_GRACE;
        while self.readers.iter().any(|reader| !reader.is_finished()) && Instant::now() < deadline {
            thread::sleep(KILL_POLL);
        }
        for reader in self.readers.drain(..) {
            if reader.is_finished() {
                let _ = reader.join();
            } else {
                debug!("shellout output pipe still open after exit; not waiting for it");
            }
        }
    }

    fn poll_exit(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                self.reap(status.code().unwrap_or(-1));
                false
            }
            Ok(None) => true,
            Err(err) => {
                warn!(?err, "failed to poll shellout");
                self.reap(-1);
                false
            }
        }
    }
}

impl CommandRunner for ProcessRunner {
    fn permitted(&self, command: &str, _parameters: &str) -> bool {
        let command = command.trim();
        !command.is_empty() && !command.ends_with('&') && self.permitted
    }

    fn execute(&mut self, command: &str, parameters: &str) -> Result<()> {
        if self.child.is_some() {
            warn!("previous shellout still running; it is no longer tracked");
            self.kill(Duration::ZERO, false)?;
            self.child = None;
        }
        let line = format!("{command} {parameters}");
        let line = line.trim();
        self.exit = None;
        self.readers.clear();
        self.output = Arc::default();

        let mut child = Self::shell(line)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        debug!(pid = child.id(), line, "spawned shellout");
        let (stdout, stderr) = (child.stdout.take(), child.stderr.take());
        self.child = Some(child);
        self.drain(stdout);
        self.drain(stderr);
        Ok(())
    }

    fn running(&mut self) -> bool {
        self.poll_exit()
    }

    fn collect(&mut self) -> (i32, String) {
        if self.poll_exit() {
            return (-1, String::new());
        }
        match self.exit.take() {
            Some(code) => {
                self.finish_readers();
                let output = self
                    .output
                    .lock()
                    .map(|out| String::from_utf8_lossy(&out).into_owned())
                    .unwrap_or_default();
                (code, output)
            }
            None => (NOTHING_TO_COLLECT, String::new()),
        }
    }

    fn kill(&mut self, timeout: Duration, force: bool) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        while self.poll_exit() {
            if Instant::now() >= deadline {
                if !force {
                    return Ok(false);
                }
                if let Some(child) = self.child.as_mut() {
                    child.kill()?;
                    let status = child.wait()?;
                    self.reap(status.code().unwrap_or(-1));
                }
                return Ok(true);
            }
            thread::sleep(KILL_POLL);
        }
        Ok(true)
    }
}

impl Drop for ProcessRunner {
    fn drop(&mut self) {
        if self.child.is_some() {
            let _ = self.kill(Duration::from_secs(1), true);
        }
    }
}
