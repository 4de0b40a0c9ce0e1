//! Engine running as a separate process.
//!
//! The engine reads requests on file descriptor 3 and writes replies on
//! descriptor 4; its standard streams are inherited. Every payload is a
//! netstring holding one tagged [`Record`]. While waiting for the answer to
//! a request the adapter keeps servicing `?` records, which are commands
//! the engine issues back into the tree.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use super::{EngineAdapter, EngineError};
use crate::infrastructure::config::DebugSettings;
use crate::message::{Headers, Message};
use crate::protocol::{decode_frame, encode_frame, NetstringCodec, ProtocolError, Record};
use crate::worker::{CommandIssuer, WorkerError};

/// How to launch an engine process.
#[derive(Debug, Clone)]
pub struct SubprocessConfig {
    /// Engine executable.
    pub program: PathBuf,
    /// Arguments passed to it.
    pub args: Vec<String>,
    /// Time the engine gets to exit after its request pipe closes.
    pub exit_grace: Duration,
}

/// Adapter speaking the tagged netstring protocol over a pair of streams.
pub struct SubprocessEngine<R, W> {
    reader: FramedRead<R, NetstringCodec>,
    writer: Option<FramedWrite<W, NetstringCodec>>,
    commands: CommandIssuer,
    child: Option<Child>,
    exit_grace: Duration,
    debug: DebugSettings,
}

impl<R, W> std::fmt::Debug for SubprocessEngine<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubprocessEngine")
            .field("worker", &self.commands.id())
            .field("pid", &self.child.as_ref().and_then(Child::id))
            .field("open", &self.writer.is_some())
            .finish_non_exhaustive()
    }
}

impl<R, W> SubprocessEngine<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Wraps already-connected streams: `reader` carries engine output and
    /// `writer` carries requests.
    pub fn from_streams(reader: R, writer: W, commands: CommandIssuer, debug: DebugSettings) -> Self {
        Self {
            reader: FramedRead::new(reader, NetstringCodec::default()),
            writer: Some(FramedWrite::new(writer, NetstringCodec::default())),
            commands,
            child: None,
            exit_grace: Duration::ZERO,
            debug,
        }
    }

    async fn send(&mut self, record: Record) -> Result<(), EngineError> {
        let writer = self.writer.as_mut().ok_or(EngineError::EndOfStream)?;
        writer.send(record.to_bytes()).await?;
        Ok(())
    }

    async fn next_record(&mut self) -> Result<Record, EngineError> {
        let next = tokio::select! {
            biased;
            () = self.commands.cancellation().cancelled() => return Err(EngineError::Cancelled),
            next = self.reader.next() => next,
        };
        match next {
            Some(raw) => Ok(Record::parse(raw?)?),
            None => Err(EngineError::EndOfStream),
        }
    }

    /// Reads until a terminal record, answering engine commands on the way.
    async fn read_reply(&mut self) -> Result<Bytes, EngineError> {
        loop {
            match self.next_record().await? {
                Record::Ok(payload) => return Ok(payload),
                Record::Error(text) => return Err(EngineError::Script(text)),
                Record::Command(frame) => self.answer_command(frame).await?,
                other => return Err(ProtocolError::UnexpectedTag(other.tag()).into()),
            }
        }
    }

    async fn answer_command(&mut self, frame: Bytes) -> Result<(), EngineError> {
        let reply = match decode_frame(frame) {
            Ok(request) => {
                if self.debug.trace_engine {
                    info!(
                        worker = %self.commands.id(),
                        kind = %request.headers.kind,
                        to = %request.headers.to,
                        "Engine issued command"
                    );
                }
                match self.commands.issue(request).await {
                    Ok(reply) => reply,
                    Err(WorkerError::Cancelled) => return Err(EngineError::Cancelled),
                    Err(e) => Message::new(Headers::error(e.to_string())),
                }
            }
            Err(e) => {
                warn!(worker = %self.commands.id(), error = %e, "Malformed engine command");
                Message::new(Headers::error(e.to_string()))
            }
        };
        let frame = encode_frame(&reply)?.freeze();
        self.send(Record::Reply(frame)).await
    }
}

#[cfg(unix)]
impl SubprocessEngine<tokio::net::unix::pipe::Receiver, tokio::net::unix::pipe::Sender> {
    /// Launches the engine process with its request pipe on descriptor 3
    /// and its reply pipe on descriptor 4.
    ///
    /// # Errors
    ///
    /// Fails if the pipes cannot be created or the process cannot start.
    pub fn spawn(
        config: &SubprocessConfig,
        commands: CommandIssuer,
        debug: DebugSettings,
    ) -> Result<Self, EngineError> {
        use std::os::fd::{AsRawFd, OwnedFd};
        use tokio::net::unix::pipe;

        let (request_read, request_write) = std::io::pipe()?;
        let (reply_read, reply_write) = std::io::pipe()?;

        let mut command = tokio::process::Command::new(&config.program);
        command.args(&config.args).kill_on_drop(true);

        let request_fd = request_read.as_raw_fd();
        let reply_fd = reply_write.as_raw_fd();
        // SAFETY: the hook only makes async-signal-safe calls on descriptors
        // that stay open in the parent until `spawn` returns.
        unsafe {
            command.pre_exec(move || engine_fds::install(request_fd, reply_fd));
        }

        let child = command.spawn()?;
        debug!(
            worker = %commands.id(),
            pid = child.id(),
            program = %config.program.display(),
            "Engine process started"
        );
        if debug.track_handles {
            info!(worker = %commands.id(), "+1 engine process");
        }

        // The child holds its own copies; ours must close so each side sees
        // end of stream when the other goes away.
        drop(request_read);
        drop(reply_write);

        let writer = pipe::Sender::from_owned_fd(OwnedFd::from(request_write))?;
        let reader = pipe::Receiver::from_owned_fd(OwnedFd::from(reply_read))?;

        let mut engine = Self::from_streams(reader, writer, commands, debug);
        engine.child = Some(child);
        engine.exit_grace = config.exit_grace;
        Ok(engine)
    }
}

#[cfg(not(unix))]
impl SubprocessEngine<tokio::io::Empty, tokio::io::Sink> {
    /// Subprocess engines need descriptor inheritance, which this platform
    /// lacks.
    ///
    /// # Errors
    ///
    /// Always fails with [`EngineError::Unsupported`].
    pub fn spawn(
        _config: &SubprocessConfig,
        _commands: CommandIssuer,
        _debug: DebugSettings,
    ) -> Result<Self, EngineError> {
        Err(EngineError::Unsupported("subprocess engines"))
    }
}

#[cfg(unix)]
mod engine_fds {
    use std::io;
    use std::os::fd::RawFd;

    const REQUEST_FD: RawFd = 3;
    const REPLY_FD: RawFd = 4;

    fn check(ret: libc::c_int) -> io::Result<libc::c_int> {
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret)
        }
    }

    /// Runs in the child between fork and exec.
    ///
    /// Both descriptors are first moved above 4 so neither can be clobbered
    /// by the other's `dup2`. `dup2` clears close-on-exec on the targets.
    pub(super) fn install(request: RawFd, reply: RawFd) -> io::Result<()> {
        // SAFETY: plain descriptor syscalls, valid between fork and exec.
        unsafe {
            let request_tmp = check(libc::fcntl(request, libc::F_DUPFD, REPLY_FD + 1))?;
            let reply_tmp = check(libc::fcntl(reply, libc::F_DUPFD, REPLY_FD + 1))?;
            check(libc::dup2(request_tmp, REQUEST_FD))?;
            check(libc::dup2(reply_tmp, REPLY_FD))?;
            libc::close(request_tmp);
            libc::close(reply_tmp);
        }
        Ok(())
    }
}

#[async_trait]
impl<R, W> EngineAdapter for SubprocessEngine<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn evaluate(&mut self, source: &[u8]) -> Result<(), EngineError> {
        self.send(Record::Evaluate(Bytes::copy_from_slice(source)))
            .await?;
        self.read_reply().await.map(drop)
    }

    async fn command(&mut self, frame: Bytes) -> Result<Bytes, EngineError> {
        self.send(Record::Command(frame)).await?;
        self.read_reply().await
    }

    fn metered_replies(&self) -> bool {
        true
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = SinkExt::<Bytes>::close(&mut writer).await {
                debug!(worker = %self.commands.id(), error = %e, "Request pipe already closed");
            }
        }
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let worker = self.commands.id();
        match tokio::time::timeout(self.exit_grace, child.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!(worker = %worker, %status, "Engine process exited");
            }
            Err(_) => {
                warn!(worker = %worker, grace = ?self.exit_grace, "Engine process did not exit, killing");
                child.kill().await?;
            }
        }
        if self.debug.track_handles {
            info!(worker = %worker, "-1 engine process");
        }
        Ok(())
    }
}
