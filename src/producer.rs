//! Producer side of the rendezvous socket.
//!
//! One connection per process, shared by every presenting thread. Connect
//! attempts are throttled to roughly once a second at 60 fps; while
//! connected, every present probes the socket with a single nonblocking
//! one-byte `recv`. A received byte is the broker's kick and carries no
//! payload; EOF or a hard error drops the connection so the capture engine
//! falls back to idle.

use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::socket::{
    self, AddressFamily, ControlMessage, MsgFlags, SockFlag, SockType, UnixAddr,
};
use once_cell::sync::Lazy;

use crate::protocol::{ApiKind, ClientInfo, Message, TextureInfo};
use crate::{CaptureError, Result, lock};

/// Minimum spacing between connect attempts while disconnected, roughly one
/// attempt per 60 presents at 60 fps.
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

static CONNECTION: Lazy<Mutex<Connection>> =
    Lazy::new(|| Mutex::new(Connection::new(crate::protocol::SOCKET_PATH)));

/// Force the singleton into existence during layer negotiation.
pub fn init() {
    Lazy::force(&CONNECTION);
}

/// Throttled connect / liveness probe; returns whether a broker is connected.
pub fn update_socket() -> bool {
    lock(&CONNECTION).update()
}

pub fn send_texture_info(info: &TextureInfo, fds: &[BorrowedFd<'_>]) -> Result<()> {
    lock(&CONNECTION).send_texture_info(info, fds)
}

pub fn start_capture() {
    lock(&CONNECTION).capturing = true;
}

pub fn stop_capture() {
    lock(&CONNECTION).capturing = false;
}

pub fn is_capturing() -> bool {
    lock(&CONNECTION).capturing
}

/// Producer connection state. The process singleton wraps one of these; tests
/// construct their own against a private socket path.
pub struct Connection {
    path: PathBuf,
    sock: Option<OwnedFd>,
    pub capturing: bool,
    last_attempt: Option<Instant>,
}

impl Connection {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sock: None,
            capturing: false,
            last_attempt: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.sock.is_some()
    }

    /// Called once per present. Probes a live connection, or makes a paced
    /// connect attempt when there is none.
    pub fn update(&mut self) -> bool {
        if let Some(sock) = &self.sock {
            let mut byte = [0u8; 1];
            match socket::recv(sock.as_raw_fd(), &mut byte, MsgFlags::MSG_DONTWAIT) {
                Ok(0) => {
                    debug!("capture broker closed the connection");
                    self.disconnect();
                }
                Ok(_) => {} // kick byte, value irrelevant
                Err(err) if err == Errno::EAGAIN || err == Errno::EWOULDBLOCK => {}
                Err(err) => {
                    debug!("capture socket probe failed: {err}");
                    self.disconnect();
                }
            }
        } else {
            let due = self
                .last_attempt
                .is_none_or(|attempt| attempt.elapsed() >= RETRY_INTERVAL);
            if due {
                self.last_attempt = Some(Instant::now());
                if self.try_connect() {
                    self.send_client_info();
                }
            }
        }
        self.sock.is_some()
    }

    /// One nonblocking connect attempt against the rendezvous path.
    pub fn try_connect(&mut self) -> bool {
        let sock = match socket::socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        ) {
            Ok(sock) => sock,
            Err(err) => {
                debug!("socket creation failed: {err}");
                return false;
            }
        };
        let addr = match unix_addr(&self.path) {
            Ok(addr) => addr,
            Err(err) => {
                warn!("bad rendezvous path {}: {err}", self.path.display());
                return false;
            }
        };
        match socket::connect(sock.as_raw_fd(), &addr) {
            Ok(()) => {
                info!("connected to capture broker at {}", self.path.display());
                self.sock = Some(sock);
                true
            }
            Err(_) => false, // no broker listening; retried on a later tick
        }
    }

    fn send_client_info(&mut self) {
        let info = ClientInfo::for_current_process(ApiKind::Vulkan);
        if let Err(err) = self.send(&Message::Client(info), &[]) {
            warn!("failed to announce capture client: {err}");
            self.disconnect();
        }
    }

    /// Ship texture metadata plus its DMA-BUF fds as one `SCM_RIGHTS`
    /// message. Any send failure drops the connection.
    pub fn send_texture_info(&mut self, info: &TextureInfo, fds: &[BorrowedFd<'_>]) -> Result<()> {
        if fds.len() != info.nfd as usize {
            return Err(CaptureError::Protocol("fd count does not match nfd"));
        }
        self.send(&Message::Texture(*info), fds).inspect_err(|_| {
            self.sock = None;
            self.capturing = false;
        })
    }

    fn send(&self, message: &Message, fds: &[BorrowedFd<'_>]) -> Result<()> {
        let Some(sock) = &self.sock else {
            return Err(CaptureError::NotConnected);
        };
        let frame = message.encode()?;
        let raw_fds: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
        let iov = [std::io::IoSlice::new(&frame)];
        let scm_rights = [ControlMessage::ScmRights(&raw_fds)];
        let cmsgs: &[ControlMessage<'_>] = if raw_fds.is_empty() { &[] } else { &scm_rights };
        socket::sendmsg::<()>(
            sock.as_raw_fd(),
            &iov,
            cmsgs,
            MsgFlags::MSG_NOSIGNAL,
            None,
        )?;
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.sock = None; // drop closes the fd
        self.capturing = false;
    }
}

fn unix_addr(path: &Path) -> Result<UnixAddr> {
    Ok(UnixAddr::new(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DRM_FORMAT_MOD_INVALID, MAX_PLANES, TEXTURE_INFO_SIZE};
    use nix::sys::socket::ControlMessageOwned;
    use std::fs::File;
    use std::io::IoSliceMut;
    use std::os::fd::{AsFd, FromRawFd};
    use std::os::unix::net::UnixListener;

    fn test_path(tag: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "vkcapture-producer-{}-{tag}.sock",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        path
    }

    fn texture_info() -> TextureInfo {
        TextureInfo {
            width: 64,
            height: 64,
            format: 0,
            flip: false,
            nfd: 1,
            strides: [256, 0, 0, 0],
            offsets: [0; MAX_PLANES],
            modifier: DRM_FORMAT_MOD_INVALID,
            winid: 0,
        }
    }

    #[test]
    fn connect_attempts_are_paced_by_the_retry_interval() {
        let path = test_path("throttle");
        let mut conn = Connection::new(&path);
        // no broker yet: the first call attempts immediately and fails
        assert!(!conn.update());
        assert!(conn.last_attempt.is_some());

        // broker appears, but the interval has not elapsed: still throttled
        let _listener = UnixListener::bind(&path).unwrap();
        assert!(!conn.update());

        // once the interval has passed the next call connects
        conn.last_attempt = Some(Instant::now() - RETRY_INTERVAL);
        assert!(conn.update());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn connects_and_announces_itself() {
        let path = test_path("announce");
        let listener = UnixListener::bind(&path).unwrap();

        let mut conn = Connection::new(&path);
        assert!(conn.update());

        let (stream, _) = listener.accept().unwrap();
        let mut frame = [0u8; TEXTURE_INFO_SIZE];
        let mut iov = [IoSliceMut::new(&mut frame)];
        let msg =
            socket::recvmsg::<()>(stream.as_raw_fd(), &mut iov, None, MsgFlags::empty()).unwrap();
        let bytes = msg.bytes;
        let _ = msg;
        drop(iov);
        let received = Message::decode(&frame[..bytes]).unwrap();
        match received {
            Message::Client(info) => {
                assert_eq!(info.pid, std::process::id());
                assert_eq!(info.api_kind(), Some(ApiKind::Vulkan));
            }
            other => panic!("unexpected message {other:?}"),
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn texture_info_carries_the_fd() {
        let path = test_path("texinfo");
        let listener = UnixListener::bind(&path).unwrap();

        let mut conn = Connection::new(&path);
        assert!(conn.update());
        let (stream, _) = listener.accept().unwrap();

        let payload = File::open("/dev/null").unwrap();
        conn.send_texture_info(&texture_info(), &[payload.as_fd()])
            .unwrap();

        // skip the ClientInfo announcement
        let mut frame = [0u8; TEXTURE_INFO_SIZE];
        let mut iov = [IoSliceMut::new(&mut frame)];
        socket::recvmsg::<()>(stream.as_raw_fd(), &mut iov, None, MsgFlags::empty()).unwrap();

        let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_PLANES]);
        let mut iov = [IoSliceMut::new(&mut frame)];
        let msg = socket::recvmsg::<()>(
            stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::empty(),
        )
        .unwrap();
        assert_eq!(msg.bytes, TEXTURE_INFO_SIZE);
        let mut fd_count = 0;
        for cmsg in msg.cmsgs().unwrap() {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                fd_count += fds.len();
                for fd in fds {
                    unsafe { OwnedFd::from_raw_fd(fd) }; // close our copy
                }
            }
        }
        assert_eq!(fd_count, 1);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn fd_count_mismatch_is_rejected_locally() {
        let mut conn = Connection::new(test_path("mismatch"));
        let err = conn.send_texture_info(&texture_info(), &[]).unwrap_err();
        assert!(matches!(err, CaptureError::Protocol(_)));
    }

    #[test]
    fn eof_probe_disconnects() {
        let path = test_path("eof");
        let listener = UnixListener::bind(&path).unwrap();
        let mut conn = Connection::new(&path);
        assert!(conn.update());
        conn.capturing = true;

        let (stream, _) = listener.accept().unwrap();
        drop(stream);
        drop(listener);

        // probe observes EOF and drops the connection
        assert!(!conn.update());
        assert!(!conn.capturing);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn kick_byte_is_consumed_without_disconnecting() {
        let path = test_path("kick");
        let listener = UnixListener::bind(&path).unwrap();
        let mut conn = Connection::new(&path);
        assert!(conn.update());

        let (stream, _) = listener.accept().unwrap();
        socket::send(stream.as_raw_fd(), &[1u8], MsgFlags::empty()).unwrap();

        assert!(conn.update());
        assert!(conn.is_connected());
        let _ = std::fs::remove_file(&path);
    }
}
