// src/gps/client.rs
//! Streaming gpsd client: one socket, one read loop, one listener

use super::gpsd::{
    parse_gpsd_json, Command, FeedEvent, GpsdObject, PollReport, VersionInfo, WatchInfo,
};
use crate::{
    config::{ConnectionConfig, COMMAND_TIMEOUT, CONNECT_TIMEOUT},
    error::{GpsError, Result},
    lock,
};
use std::{
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{oneshot, Mutex as AsyncMutex},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

/// Longest line accepted from gpsd; longer ones are skipped
const MAX_LINE_LEN: u64 = 64 * 1024;

/// Receives every streamed object; registered with [`GpsdClient::set_listener`]
pub type EventListener = Arc<dyn Fn(FeedEvent) + Send + Sync>;

struct PendingCommand {
    expects: &'static str,
    reply: oneshot::Sender<Result<GpsdObject>>,
}

type PendingSlot = Arc<Mutex<Option<PendingCommand>>>;

pub struct GpsdClient {
    address: String,
    writer: AsyncMutex<Option<OwnedWriteHalf>>,
    reader: Mutex<Option<BufReader<OwnedReadHalf>>>,
    listener: Arc<RwLock<Option<EventListener>>>,
    pending: PendingSlot,
    read_task: Mutex<Option<JoinHandle<()>>>,
    command_timeout: Duration,
}

impl GpsdClient {
    /// Open a connection to a gpsd daemon
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let address = ConnectionConfig::new(host, port).socket_address();

        let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(GpsError::Connection(format!(
                    "Failed to connect to gpsd at {}: {}",
                    address, e
                )))
            }
            Err(_) => {
                return Err(GpsError::Connection(format!(
                    "Timed out connecting to gpsd at {}",
                    address
                )))
            }
        };
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            address,
            writer: AsyncMutex::new(Some(write_half)),
            reader: Mutex::new(Some(BufReader::new(read_half))),
            listener: Arc::new(RwLock::new(None)),
            pending: Arc::new(Mutex::new(None)),
            read_task: Mutex::new(None),
            command_timeout: COMMAND_TIMEOUT,
        })
    }

    /// How long a command waits for its acknowledgement
    pub fn with_command_timeout(mut self, command_timeout: Duration) -> Self {
        self.command_timeout = command_timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Register the event listener. Only one listener is kept; the last one wins.
    pub fn set_listener<F>(&self, listener: F)
    where
        F: Fn(FeedEvent) + Send + Sync + 'static,
    {
        *self.listener.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(listener));
    }

    /// Spawn the read loop on the current Tokio runtime
    pub fn start(&self) -> Result<()> {
        let mut task = lock(&self.read_task);
        if task.is_some() {
            return Ok(());
        }

        let reader = lock(&self.reader)
            .take()
            .ok_or_else(|| GpsError::Connection("gpsd client is stopped".to_string()))?;

        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| GpsError::Connection(format!("No runtime for gpsd read loop: {}", e)))?;

        *task = Some(handle.spawn(read_loop(
            reader,
            Arc::clone(&self.listener),
            Arc::clone(&self.pending),
        )));
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        lock(&self.read_task).is_some()
    }

    pub async fn issue_version(&self) -> Result<VersionInfo> {
        match self.command(Command::Version).await? {
            GpsdObject::Version(info) => Ok(info),
            other => Err(unexpected_response("VERSION", &other)),
        }
    }

    pub async fn issue_watch(&self, enable_json: bool, enable_nmea: bool) -> Result<WatchInfo> {
        let command = Command::Watch {
            enable_json,
            enable_nmea,
        };
        match self.command(command).await? {
            GpsdObject::Watch(info) => Ok(info),
            other => Err(unexpected_response("WATCH", &other)),
        }
    }

    pub async fn issue_poll(&self) -> Result<PollReport> {
        match self.command(Command::Poll).await? {
            GpsdObject::Poll(report) => Ok(report),
            other => Err(unexpected_response("POLL", &other)),
        }
    }

    /// Send a command and wait for the read loop to deliver its acknowledgement
    async fn command(&self, command: Command) -> Result<GpsdObject> {
        let expects = command.response_class();

        // Held for the whole exchange so acknowledgements cannot be mismatched
        let mut writer = self.writer.lock().await;
        let stream = writer
            .as_mut()
            .ok_or_else(|| GpsError::Connection("gpsd client is stopped".to_string()))?;

        if !self.is_started() {
            return Err(GpsError::Protocol(format!(
                "Cannot issue {} before the read loop is started",
                expects
            )));
        }

        let (reply, response) = oneshot::channel();
        *lock(&self.pending) = Some(PendingCommand { expects, reply });

        if let Err(e) = stream.write_all(command.to_line().as_bytes()).await {
            lock(&self.pending).take();
            return Err(GpsError::Connection(format!(
                "Failed to send {} command: {}",
                expects, e
            )));
        }

        match timeout(self.command_timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GpsError::Connection(format!(
                "Connection closed before {} was acknowledged",
                expects
            ))),
            Err(_) => {
                lock(&self.pending).take();
                Err(GpsError::Protocol(format!(
                    "Timed out after {:?} waiting for {} response",
                    self.command_timeout, expects
                )))
            }
        }
    }

    /// Close the socket and end the read loop. Safe to call repeatedly,
    /// and before `start`.
    pub async fn stop(&self) {
        let task = lock(&self.read_task).take();
        if let Some(task) = task {
            task.abort();
            // Wait so no listener call can still be running once we return
            let _ = task.await;
        }

        lock(&self.reader).take();

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
            debug!("Disconnected from gpsd at {}", self.address);
        }

        fail_pending(&self.pending, "gpsd client stopped");
    }
}

fn unexpected_response(expected: &str, got: &GpsdObject) -> GpsError {
    GpsError::Protocol(format!("Expected {} response, got {:?}", expected, got))
}

fn fail_pending(pending: &PendingSlot, reason: &str) {
    if let Some(command) = lock(pending).take() {
        let _ = command
            .reply
            .send(Err(GpsError::Connection(reason.to_string())));
    }
}

async fn read_loop(
    mut reader: BufReader<OwnedReadHalf>,
    listener: Arc<RwLock<Option<EventListener>>>,
    pending: PendingSlot,
) {
    let mut buf = Vec::new();
    let mut skipping = false;

    loop {
        buf.clear();
        match (&mut reader).take(MAX_LINE_LEN).read_until(b'\n', &mut buf).await {
            Ok(0) => {
                info!("gpsd closed the connection");
                break;
            }
            Ok(_) => {
                let complete = buf.last() == Some(&b'\n');
                if skipping {
                    skipping = !complete;
                    continue;
                }
                if !complete && buf.len() as u64 >= MAX_LINE_LEN {
                    warn!("Skipping gpsd line longer than {} bytes", MAX_LINE_LEN);
                    skipping = true;
                    continue;
                }

                let line = String::from_utf8_lossy(&buf);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line.starts_with('$') || line.starts_with('!') {
                    debug!("NMEA: {}", line);
                    continue;
                }

                match parse_gpsd_json(line) {
                    Ok(object) => dispatch(object, &listener, &pending),
                    Err(e) => warn!("Skipping gpsd line: {}", e),
                }
            }
            Err(e) => {
                warn!("Error reading from gpsd: {}", e);
                break;
            }
        }
    }

    fail_pending(&pending, "gpsd connection closed");
}

fn dispatch(
    object: GpsdObject,
    listener: &RwLock<Option<EventListener>>,
    pending: &PendingSlot,
) {
    match object {
        GpsdObject::Event(event) => {
            let callback = listener
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            match callback {
                Some(callback) => callback(event),
                None => debug!("No listener registered, dropping {:?}", event),
            }
        }
        GpsdObject::Error(message) => match lock(pending).take() {
            Some(command) => {
                let _ = command.reply.send(Err(GpsError::Protocol(format!(
                    "gpsd rejected {}: {}",
                    command.expects, message
                ))));
            }
            None => warn!("gpsd error: {}", message),
        },
        GpsdObject::Other(class) => debug!("Ignoring gpsd {} object", class),
        response => {
            let class = response.response_class().unwrap_or("?");
            let mut slot = lock(pending);
            if slot.as_ref().map_or(false, |command| command.expects == class) {
                if let Some(command) = slot.take() {
                    let _ = command.reply.send(Ok(response));
                }
                return;
            }
            drop(slot);

            match response {
                GpsdObject::Version(info) => info!("Connected to gpsd version: {}", info.release),
                other => debug!("Unsolicited {} response: {:?}", class, other),
            }
        }
    }
}
