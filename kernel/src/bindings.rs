//! Built-in worker exposing host bindings to engines.
//!
//! Requests are `system` messages whose body is `params-JSON [0x01 payload]`
//! and whose params name a `method`. Synchronous requests are answered with
//! an `ok` reply carrying the result or an `error` reply carrying the
//! failure text. An asynchronous `readFile` streams the file back to the
//! sender's port in chunks instead.

use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};
use url::Url;

use crate::message::{Headers, Message, MessageType};
use crate::protocol::DELIMITER;
use crate::supervisor::PortClosed;
use crate::worker::{CommandIssuer, WorkerContext, WorkerError};

/// Bytes read from disk per streamed `send` message.
pub const READ_CHUNK: usize = 1024;

/// Body prefix of every streamed chunk: empty params and the delimiter.
const CHUNK_PREFIX: &[u8] = b"{}\x01";

/// Failure of a single binding call.
#[derive(Debug, Error)]
pub enum BindingError {
    /// The params JSON is malformed or misses a field.
    #[error("{0}")]
    Params(#[from] serde_json::Error),

    /// No binding has this name.
    #[error("unrecognized method: {0:?}")]
    UnknownMethod(String),

    /// Only `system` messages carry binding calls.
    #[error("unrecognized message type {0}")]
    UnsupportedType(MessageType),

    /// Filesystem failure.
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// A location or base is not a valid URL.
    #[error("{0}")]
    Url(#[from] url::ParseError),

    /// The worker stopped while streaming.
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

#[derive(Deserialize)]
struct Params {
    method: String,
}

#[derive(Deserialize)]
struct LocationParams {
    location: String,
}

#[derive(Deserialize)]
struct ResolveUrlParams {
    base: String,
    location: String,
}

/// Components of a parsed URL, named like the WHATWG `URL` accessors.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParsedUrl {
    /// Scheme followed by `:`.
    pub protocol: String,
    /// `scheme://host`.
    pub origin: String,
    /// Host name with an explicit port, if any.
    pub host: String,
    /// Host name alone.
    pub hostname: String,
    /// Explicit port, or empty.
    pub port: String,
    /// Escaped path.
    pub pathname: String,
    /// `?` followed by the query.
    pub search: String,
    /// `#` followed by the fragment.
    pub hash: String,
    /// The serialized URL.
    pub href: String,
}

impl From<&Url> for ParsedUrl {
    fn from(url: &Url) -> Self {
        let hostname = url.host_str().unwrap_or_default().to_owned();
        let host = match url.port() {
            Some(port) => format!("{hostname}:{port}"),
            None => hostname.clone(),
        };
        Self {
            protocol: format!("{}:", url.scheme()),
            origin: format!("{}://{host}", url.scheme()),
            port: url.port().map(|p| p.to_string()).unwrap_or_default(),
            pathname: url.path().to_owned(),
            search: format!("?{}", url.query().unwrap_or_default()),
            hash: format!("#{}", url.fragment().unwrap_or_default()),
            href: url.as_str().to_owned(),
            host,
            hostname,
        }
    }
}

/// Splits a request body into its params JSON and the payload after the
/// delimiter.
#[must_use]
pub fn split_body(body: &Bytes) -> (Bytes, Bytes) {
    match body.iter().position(|&b| b == DELIMITER) {
        Some(at) => (body.slice(..at), body.slice(at + 1..)),
        None => (body.clone(), Bytes::new()),
    }
}

/// Runs the binding named `method`.
///
/// # Errors
///
/// Fails with the binding's own error, or [`BindingError::UnknownMethod`].
pub async fn call(method: &str, params: &[u8], payload: &[u8]) -> Result<Bytes, BindingError> {
    match method {
        "readFile" => {
            let LocationParams { location } = serde_json::from_slice(params)?;
            Ok(Bytes::from(tokio::fs::read(location).await?))
        }
        "realPath" => {
            let LocationParams { location } = serde_json::from_slice(params)?;
            let path = real_path(Path::new(&location)).await?;
            Ok(Bytes::from(path.to_string_lossy().into_owned()))
        }
        "getLocation" => {
            let cwd = std::env::current_dir()?;
            Ok(Bytes::from(format!("file://{}/", cwd.display())))
        }
        "resolveUrl" => {
            let ResolveUrlParams { base, location } = serde_json::from_slice(params)?;
            let resolved = Url::parse(&base)?.join(&location)?;
            Ok(Bytes::from(String::from(resolved)))
        }
        "parseUrl" => {
            let LocationParams { location } = serde_json::from_slice(params)?;
            let url = Url::parse(&location)?;
            Ok(Bytes::from(serde_json::to_vec(&ParsedUrl::from(&url))?))
        }
        "computeSha512" => Ok(Bytes::copy_from_slice(&Sha512::digest(payload))),
        other => Err(BindingError::UnknownMethod(other.to_owned())),
    }
}

/// Resolves symlinks and dot segments. Relative inputs stay relative to
/// the working directory unless resolution leads outside it.
async fn real_path(location: &Path) -> std::io::Result<PathBuf> {
    let resolved = tokio::fs::canonicalize(location).await?;
    if location.is_absolute() {
        return Ok(resolved);
    }
    let cwd = tokio::fs::canonicalize(std::env::current_dir()?).await?;
    match resolved.strip_prefix(&cwd) {
        Ok(relative) if relative.as_os_str().is_empty() => Ok(PathBuf::from(".")),
        Ok(relative) => Ok(relative.to_path_buf()),
        Err(_) => Ok(resolved),
    }
}

async fn call_sync(request: &Message) -> Result<Bytes, BindingError> {
    if request.headers.kind != MessageType::System {
        return Err(BindingError::UnsupportedType(request.headers.kind));
    }
    let (params, payload) = split_body(&request.body);
    let Params { method } = serde_json::from_slice(&params)?;
    call(&method, &params, &payload).await
}

/// Worker body of the bindings worker.
///
/// # Errors
///
/// Returns the cancellation error that ended the worker, after every file
/// stream it started has finished.
pub async fn run_bindings_worker(ctx: WorkerContext) -> Result<(), WorkerError> {
    let streams = TaskTracker::new();
    let outcome = serve(&ctx, &streams).await;
    streams.close();
    streams.wait().await;
    outcome
}

async fn serve(ctx: &WorkerContext, streams: &TaskTracker) -> Result<(), WorkerError> {
    loop {
        for request in ctx.fetch().await? {
            if request.headers.sync {
                answer(ctx, request).await;
            } else {
                dispatch(ctx, streams, request);
            }
        }
    }
}

async fn answer(ctx: &WorkerContext, mut request: Message) {
    if !request.expects_reply() {
        debug!(worker = %ctx.id(), from = %request.headers.from, "Dropping refused binding call");
        return;
    }
    let reply = match call_sync(&request).await {
        Ok(body) => Message::new(request.headers.reply(MessageType::Ok)).with_body(body),
        Err(e) => {
            debug!(worker = %ctx.id(), error = %e, "Binding call failed");
            let mut headers = request.headers.reply(MessageType::Error);
            headers.error = Some(e.to_string());
            Message::new(headers)
        }
    };
    request.respond(reply);
}

fn dispatch(ctx: &WorkerContext, streams: &TaskTracker, mut request: Message) {
    match request.headers.kind {
        MessageType::Terminate => ctx.terminate(),
        MessageType::System => {
            let (params, _) = split_body(&request.body);
            let method = match serde_json::from_slice::<Params>(&params) {
                Ok(Params { method }) => method,
                Err(e) => {
                    warn!(worker = %ctx.id(), error = %e, "Malformed binding request");
                    return;
                }
            };
            if method != "readFile" {
                debug!(worker = %ctx.id(), method = %method, "Ignoring asynchronous binding call");
                return;
            }

            let route = request.headers.reply(MessageType::Send);
            let outbound = ctx.commands();
            let location = match serde_json::from_slice::<LocationParams>(&params) {
                Ok(LocationParams { location }) => location,
                Err(e) => {
                    let mut headers = route;
                    headers.kind = MessageType::Error;
                    headers.error = Some(e.to_string());
                    if let Err(e) = outbound.deliver(Message::new(headers)) {
                        debug!(worker = %ctx.id(), error = %e, "Could not report bad stream request");
                    }
                    return;
                }
            };

            request.respond_with(MessageType::Ack);
            let closed = ctx.port_closed(route.to, route.port).ok();
            streams.spawn(stream_file(outbound, route, location, closed));
        }
        other => debug!(worker = %ctx.id(), kind = %other, "Ignoring message"),
    }
}

/// Streams the file at `location` along `route` until it ends, the port
/// closes or the worker stops. Ends with `ok`, or `error` on failure.
async fn stream_file(
    outbound: CommandIssuer,
    route: Headers,
    location: String,
    closed: Option<PortClosed>,
) {
    let worker = outbound.id();
    let cancel = outbound.cancellation().clone();
    let port_closed = async move {
        match closed {
            Some(closed) => {
                let _ = closed.wait().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    let outcome = tokio::select! {
        biased;
        () = cancel.cancelled() => return,
        () = port_closed => {
            debug!(worker = %worker, port = %route.port, "Port closed, file stream stopped");
            return;
        }
        outcome = send_chunks(&outbound, &route, &location) => outcome,
    };

    let mut last = route;
    match outcome {
        Ok(()) => last.kind = MessageType::Ok,
        Err(e) => {
            last.kind = MessageType::Error;
            last.error = Some(e.to_string());
        }
    }
    if let Err(e) = outbound.deliver(Message::new(last)) {
        debug!(worker = %worker, error = %e, "File stream ended after worker stopped");
    }
}

async fn send_chunks(
    outbound: &CommandIssuer,
    route: &Headers,
    location: &str,
) -> Result<(), BindingError> {
    let mut file = File::open(location).await?;
    let mut chunk = vec![0; READ_CHUNK];
    loop {
        let read = file.read(&mut chunk).await?;
        if read == 0 {
            return Ok(());
        }
        let mut body = BytesMut::with_capacity(CHUNK_PREFIX.len() + read);
        body.extend_from_slice(CHUNK_PREFIX);
        body.extend_from_slice(&chunk[..read]);
        outbound.deliver(Message::new(route.clone()).with_body(body.freeze()))?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::config::DebugSettings;
    use crate::message::Id;
    use crate::supervisor::Supervisor;
    use std::io::Write;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const PATIENCE: Duration = Duration::from_secs(5);

    fn body(params: &str, payload: &[u8]) -> Bytes {
        let mut body = BytesMut::from(params.as_bytes());
        if !payload.is_empty() {
            body.extend_from_slice(&[DELIMITER]);
            body.extend_from_slice(payload);
        }
        body.freeze()
    }

    async fn call_body(raw: Bytes) -> Result<Bytes, BindingError> {
        let (params, payload) = split_body(&raw);
        let Params { method } = serde_json::from_slice(&params)?;
        call(&method, &params, &payload).await
    }

    #[test]
    fn split_body_separates_payload() {
        let (params, payload) = split_body(&Bytes::from_static(b"{\"a\":1}\x01\x00\x01"));
        assert_eq!(&params[..], b"{\"a\":1}");
        assert_eq!(&payload[..], b"\x00\x01");

        let (params, payload) = split_body(&Bytes::from_static(b"{}"));
        assert_eq!(&params[..], b"{}");
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn read_file_and_real_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"export default 1;").unwrap();
        let location = file.path().to_string_lossy().into_owned();
        let params = serde_json::json!({ "method": "readFile", "location": location }).to_string();

        let contents = call_body(body(&params, b"")).await.unwrap();
        assert_eq!(&contents[..], b"export default 1;");

        let params = serde_json::json!({ "method": "realPath", "location": location }).to_string();
        let real = call_body(body(&params, b"")).await.unwrap();
        let expected = std::fs::canonicalize(file.path()).unwrap();
        assert_eq!(String::from_utf8_lossy(&real), expected.to_string_lossy());
    }

    #[tokio::test]
    async fn real_path_keeps_relative_locations_relative() {
        // Tests run from the package root.
        for location in ["Cargo.toml", "./src/../Cargo.toml"] {
            let params = serde_json::json!({ "method": "realPath", "location": location }).to_string();
            let real = call_body(body(&params, b"")).await.unwrap();
            assert_eq!(&real[..], b"Cargo.toml", "{location}");
        }

        let params = r#"{"method":"realPath","location":"src/.."}"#;
        assert_eq!(&call_body(body(params, b"")).await.unwrap()[..], b".");
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let params = r#"{"method":"readFile","location":"/nonexistent/vatvisor/file.js"}"#;
        let err = call_body(body(params, b"")).await.unwrap_err();
        assert!(matches!(err, BindingError::Io(_)));
    }

    #[tokio::test]
    async fn get_location_is_a_directory_url() {
        let location = call_body(body(r#"{"method":"getLocation"}"#, b"")).await.unwrap();
        let location = String::from_utf8(location.to_vec()).unwrap();
        assert!(location.starts_with("file://"));
        assert!(location.ends_with('/'));
    }

    #[tokio::test]
    async fn resolve_url_joins_relative_locations() {
        let params = r#"{"method":"resolveUrl","base":"file:///app/src/main.js","location":"../lib/util.js"}"#;
        let resolved = call_body(body(params, b"")).await.unwrap();
        assert_eq!(&resolved[..], b"file:///app/lib/util.js");
    }

    #[tokio::test]
    async fn parse_url_reports_components() {
        let params =
            r#"{"method":"parseUrl","location":"https://example.com:8443/a/b?x=1#frag"}"#;
        let parsed = call_body(body(params, b"")).await.unwrap();
        let parsed: ParsedUrl = serde_json::from_slice(&parsed).unwrap();
        assert_eq!(
            parsed,
            ParsedUrl {
                protocol: "https:".into(),
                origin: "https://example.com:8443".into(),
                host: "example.com:8443".into(),
                hostname: "example.com".into(),
                port: "8443".into(),
                pathname: "/a/b".into(),
                search: "?x=1".into(),
                hash: "#frag".into(),
                href: "https://example.com:8443/a/b?x=1#frag".into(),
            }
        );
    }

    #[tokio::test]
    async fn sha512_hashes_the_payload_only() {
        let digest = call_body(body(r#"{"method":"computeSha512"}"#, b"abc")).await.unwrap();
        assert_eq!(digest.len(), 64);
        assert_eq!(&digest[..], Sha512::digest(b"abc").as_slice());
        assert!(hex::encode(&digest).starts_with("ddaf35a193617aba"));
    }

    #[tokio::test]
    async fn unknown_method_is_named() {
        let err = call_body(body(r#"{"method":"launchMissiles"}"#, b"")).await.unwrap_err();
        assert_eq!(err.to_string(), r#"unrecognized method: "launchMissiles""#);
    }

    #[tokio::test]
    async fn worker_answers_sync_calls_and_rejects_other_types() {
        let supervisor = Supervisor::new(DebugSettings::default());
        supervisor.start();
        let bindings = supervisor.spawn(Id::SUPERVISOR, run_bindings_worker);

        let (request, reply) = Message::request(
            Headers::new(MessageType::System)
                .with_from(Id::DRIVER)
                .with_to(bindings),
        );
        supervisor
            .deliver(request.with_body(body(r#"{"method":"computeSha512"}"#, b"abc")))
            .unwrap();
        let reply = timeout(PATIENCE, reply).await.unwrap().unwrap();
        assert_eq!(reply.headers.kind, MessageType::Ok);
        assert_eq!(reply.headers.to, Id::DRIVER);
        assert_eq!(reply.body.len(), 64);

        let (request, reply) = Message::request(
            Headers::new(MessageType::Send)
                .with_from(Id::DRIVER)
                .with_to(bindings),
        );
        supervisor.deliver(request).unwrap();
        let reply = timeout(PATIENCE, reply).await.unwrap().unwrap();
        assert_eq!(reply.error_text(), Some("unrecognized message type send"));

        supervisor.stop();
        timeout(PATIENCE, supervisor.wait()).await.unwrap();
    }

    async fn collect(
        ctx: WorkerContext,
        seen: mpsc::UnboundedSender<Message>,
    ) -> Result<(), WorkerError> {
        loop {
            for message in ctx.fetch().await? {
                let _ = seen.send(message);
            }
        }
    }

    #[tokio::test]
    async fn async_read_file_streams_chunks_to_the_port() {
        let contents: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&contents).unwrap();
        let location = file.path().to_string_lossy().into_owned();

        let supervisor = Supervisor::new(DebugSettings::default());
        supervisor.start();
        let bindings = supervisor.spawn(Id::SUPERVISOR, run_bindings_worker);
        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        let reader = supervisor.spawn(Id::SUPERVISOR, move |ctx| collect(ctx, seen_tx));
        let port = Id::new(7);
        let opened = timeout(PATIENCE, supervisor.open_port(reader, port).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(opened.headers.kind, MessageType::Ok);

        let params = serde_json::json!({ "method": "readFile", "location": location }).to_string();
        let (request, ack) = Message::acknowledged(
            Headers::new(MessageType::System)
                .with_from(reader)
                .with_to(bindings)
                .with_port(port),
        );
        supervisor.deliver(request.with_body(params)).unwrap();
        let ack = timeout(PATIENCE, ack).await.unwrap().unwrap();
        assert_eq!(ack.headers.kind, MessageType::Ack);

        let mut streamed = Vec::new();
        let mut chunks = 0;
        loop {
            let message = timeout(PATIENCE, seen.recv()).await.unwrap().unwrap();
            assert_eq!(message.headers.port, port);
            assert_eq!(message.headers.from, bindings);
            match message.headers.kind {
                MessageType::Send => {
                    let (params, chunk) = split_body(&message.body);
                    assert_eq!(&params[..], b"{}");
                    assert!(chunk.len() <= READ_CHUNK);
                    streamed.extend_from_slice(&chunk);
                    chunks += 1;
                }
                MessageType::Ok => break,
                other => panic!("unexpected {other} message"),
            }
        }
        assert_eq!(streamed, contents);
        assert!(chunks >= 3);

        supervisor.stop();
        timeout(PATIENCE, supervisor.wait()).await.unwrap();
    }

    #[tokio::test]
    async fn async_read_of_missing_file_reports_error() {
        let supervisor = Supervisor::new(DebugSettings::default());
        supervisor.start();
        let bindings = supervisor.spawn(Id::SUPERVISOR, run_bindings_worker);
        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        let reader = supervisor.spawn(Id::SUPERVISOR, move |ctx| collect(ctx, seen_tx));

        let message = Message::new(
            Headers::new(MessageType::System)
                .with_from(reader)
                .with_to(bindings),
        )
        .with_body(r#"{"method":"readFile","location":"/nonexistent/vatvisor"}"#);
        supervisor.deliver(message).unwrap();

        let last = timeout(PATIENCE, seen.recv()).await.unwrap().unwrap();
        assert_eq!(last.headers.kind, MessageType::Error);
        assert!(last.error_text().is_some_and(|text| !text.is_empty()));

        supervisor.stop();
        timeout(PATIENCE, supervisor.wait()).await.unwrap();
    }
}
