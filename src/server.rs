//! The control socket.
//!
//! A root-only Unix socket carrying newline-delimited JSON requests for
//! the three lock operations. Connections are the lock endpoints: each
//! one gets an id for its lifetime, and the connection dropping is the
//! endpoint-invalidation signal the arbiter's crash-release path runs on.

use std::{
    io::{BufRead, BufReader, Write},
    os::unix::net::{UnixListener, UnixStream},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    sync::mpsc::Sender,
    thread,
};

use anyhow::{Context, Error};
use log::{debug, info, warn};
use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};

use crate::{
    locks::EndpointId,
    watch::{ControlReply, ControlRequest, Event},
};

static NEXT_ENDPOINT: AtomicU64 = AtomicU64::new(1);

/// Binds the control socket and serves it from background threads.
/// Requests are forwarded to the control thread; nothing is decided here.
pub fn spawn(socket_path: PathBuf, tx: Sender<Event>) -> Result<thread::JoinHandle<()>, Error> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create '{}'", parent.display()))?;
    }
    match std::fs::remove_file(&socket_path) {
        Ok(()) => debug!("removed stale socket '{}'", socket_path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).context(format!("Failed to clear '{}'", socket_path.display()));
        }
    }

    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("Failed to bind '{}'", socket_path.display()))?;
    info!("control socket at '{}'", socket_path.display());

    let handle = thread::spawn(move || {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let endpoint = NEXT_ENDPOINT.fetch_add(1, Ordering::Relaxed);
                    let tx = tx.clone();
                    thread::spawn(move || serve_connection(stream, endpoint, tx));
                }
                Err(e) => {
                    warn!("control socket accept failed: {e}");
                    break;
                }
            }
        }
    });
    Ok(handle)
}

fn peer_is_root(stream: &UnixStream) -> bool {
    match getsockopt(stream, PeerCredentials) {
        Ok(creds) => creds.uid() == 0,
        Err(e) => {
            warn!("could not read peer credentials: {e}");
            false
        }
    }
}

fn serve_connection(stream: UnixStream, endpoint: EndpointId, tx: Sender<Event>) {
    let root = peer_is_root(&stream);
    let mut writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(e) => {
            warn!("endpoint {endpoint}: {e}");
            return;
        }
    };

    for line in BufReader::new(stream).lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        let reply = handle_line(&line, endpoint, root, &tx);
        if write_reply(&mut writer, &reply).is_err() {
            break;
        }
    }

    // The connection is gone; whatever it held is crash-released.
    let _ = tx.send(Event::EndpointDead(endpoint));
    debug!("endpoint {endpoint} disconnected");
}

fn handle_line(line: &str, endpoint: EndpointId, root: bool, tx: &Sender<Event>) -> ControlReply {
    let request: ControlRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            debug!("endpoint {endpoint}: bad request: {e}");
            return ControlReply::NotPermitted;
        }
    };
    if !root {
        return ControlReply::NotPermitted;
    }

    let (reply_tx, reply_rx) = std::sync::mpsc::channel();
    if tx
        .send(Event::Control {
            endpoint,
            request,
            reply: reply_tx,
        })
        .is_err()
    {
        return ControlReply::Busy { device: None };
    }
    reply_rx.recv().unwrap_or(ControlReply::Busy { device: None })
}

fn write_reply(writer: &mut UnixStream, reply: &ControlReply) -> std::io::Result<()> {
    let mut line = serde_json::to_string(reply).expect("replies always serialize");
    line.push('\n');
    writer.write_all(line.as_bytes())
}

/// Client side of the protocol, used by the one-shot update path to
/// coordinate with a running daemon.
pub struct ControlClient {
    stream: UnixStream,
    reader: BufReader<UnixStream>,
}

impl ControlClient {
    /// Connects if a daemon is listening; `None` means standalone
    /// operation.
    pub fn connect(socket_path: &Path) -> Option<ControlClient> {
        let stream = UnixStream::connect(socket_path).ok()?;
        let reader = BufReader::new(stream.try_clone().ok()?);
        Some(ControlClient { stream, reader })
    }

    pub fn request(&mut self, request: &ControlRequest) -> Result<ControlReply, Error> {
        let mut line = serde_json::to_string(request).context("Failed to encode request")?;
        line.push('\n');
        self.stream
            .write_all(line.as_bytes())
            .context("Failed to send request")?;

        let mut reply = String::new();
        self.reader
            .read_line(&mut reply)
            .context("Failed to read reply")?;
        serde_json::from_str(&reply).context("Failed to decode reply")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tempfile::TempDir;

    use crate::watch::{ControlReply, ControlRequest};

    /// Round-trips a request through the real socket machinery, with the
    /// test thread standing in for the control thread.
    #[test]
    fn test_lock_round_trip() {
        let tmp = TempDir::new().unwrap();
        let socket_path = tmp.path().join("bosun.sock");
        let (tx, rx) = std::sync::mpsc::channel();
        let _server = spawn(socket_path.clone(), tx).unwrap();

        // Answer one control request the way the controller would.
        let responder = thread::spawn(move || loop {
            match rx.recv_timeout(Duration::from_secs(5)) {
                Ok(Event::Control { reply, request, .. }) => {
                    assert_eq!(
                        request,
                        ControlRequest::LockVolume {
                            bsdname: "sda2".into()
                        }
                    );
                    let _ = reply.send(ControlReply::Ok);
                    break;
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        });

        let mut client = ControlClient::connect(&socket_path).expect("daemon socket");
        let reply = client
            .request(&ControlRequest::LockVolume {
                bsdname: "sda2".into(),
            })
            .unwrap();

        // The test runs as whatever uid the build uses; a root run sees
        // the request granted, a non-root run sees it refused.
        if nix::unistd::geteuid().is_root() {
            assert_eq!(reply, ControlReply::Ok);
            responder.join().unwrap();
        } else {
            assert_eq!(reply, ControlReply::NotPermitted);
        }
    }

    #[test]
    fn test_disconnect_sends_endpoint_death() {
        let tmp = TempDir::new().unwrap();
        let socket_path = tmp.path().join("bosun.sock");
        let (tx, rx) = std::sync::mpsc::channel();
        let _server = spawn(socket_path.clone(), tx).unwrap();

        let client = ControlClient::connect(&socket_path).expect("daemon socket");
        drop(client);

        match rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Event::EndpointDead(_)) => {}
            other => panic!("expected endpoint death, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_daemon_means_standalone() {
        let tmp = TempDir::new().unwrap();
        assert!(ControlClient::connect(&tmp.path().join("absent.sock")).is_none());
    }
}
