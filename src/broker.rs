//! Consumer-side broker: accepts producer connections on the rendezvous
//! socket and tracks what each one last shared.
//!
//! One background thread owns all socket I/O. The client list sits behind a
//! mutex so the host's render tick (see [`crate::source`]) can snapshot the
//! selected client's texture state without ever observing a half-applied
//! update. Buffer fds are owned (`OwnedFd`) and therefore closed exactly
//! once, either on client cleanup or when a newer `TextureInfo` supersedes
//! them.

use std::io::IoSliceMut;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::socket::{
    self, AddressFamily, Backlog, ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixAddr,
};

use crate::protocol::{
    CLIENT_INFO_SIZE, ClientInfo, MAX_FRAME_SIZE, MAX_PLANES, MSG_CLIENT_INFO, MSG_TEXTURE_INFO,
    SOCKET_PATH, TEXTURE_INFO_SIZE, TextureInfo,
};
use crate::{Result, lock};

/// One connected producer and the latest state it shipped.
pub struct Client {
    pub id: u64,
    pub sock: OwnedFd,
    pub info: Option<ClientInfo>,
    pub texture: Option<TextureInfo>,
    buf_fds: [Option<OwnedFd>; MAX_PLANES],
    /// Bumped on every accepted `TextureInfo`; the source adapter reimports
    /// whenever it observes a change.
    pub buf_id: u64,
}

impl Client {
    fn new(id: u64, sock: OwnedFd) -> Self {
        Self {
            id,
            sock,
            info: None,
            texture: None,
            buf_fds: [None, None, None, None],
            buf_id: 0,
        }
    }

    /// Borrowed plane fds, in plane order. Length equals `texture.nfd`.
    pub fn plane_fds(&self) -> Vec<BorrowedFd<'_>> {
        self.buf_fds
            .iter()
            .flatten()
            .map(|fd| fd.as_fd())
            .collect()
    }

    pub fn describe(&self) -> String {
        match &self.info {
            Some(info) => format!("{} (pid {})", info.exe_name(), info.pid),
            None => format!("client {}", self.id),
        }
    }
}

pub(crate) struct Shared {
    pub clients: Mutex<Vec<Client>>,
    quit: AtomicBool,
}

/// The broker server. Binding spawns the poll thread; dropping (or calling
/// [`Broker::shutdown`]) stops it, drops every client and unlinks the socket.
pub struct Broker {
    shared: Arc<Shared>,
    path: PathBuf,
    thread: Option<JoinHandle<()>>,
}

impl Broker {
    /// Bind the well-known rendezvous socket.
    pub fn start() -> Result<Self> {
        Self::bind(SOCKET_PATH)
    }

    /// Bind an explicit path (the host may relocate the rendezvous point).
    pub fn bind(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        // a stale socket file from a crashed broker would fail the bind
        let _ = std::fs::remove_file(&path);

        let listener = socket::socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        let addr = UnixAddr::new(path.as_path())?;
        socket::bind(listener.as_raw_fd(), &addr)?;
        socket::listen(&listener, Backlog::new(1)?)?;
        info!("capture broker listening on {}", path.display());

        let shared = Arc::new(Shared {
            clients: Mutex::new(Vec::new()),
            quit: AtomicBool::new(false),
        });
        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("vkcapture-broker".into())
            .spawn(move || run_loop(listener, thread_shared))?;

        Ok(Self {
            shared,
            path,
            thread: Some(thread),
        })
    }

    pub(crate) fn shared(&self) -> Arc<Shared> {
        self.shared.clone()
    }

    /// Snapshot accessor for hosts that list connected producers.
    pub fn with_clients<R>(&self, read: impl FnOnce(&[Client]) -> R) -> R {
        read(&lock(&self.shared.clients))
    }

    pub fn shutdown(&mut self) {
        self.shared.quit.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loop(listener: OwnedFd, shared: Arc<Shared>) {
    let mut next_client_id: u64 = 1;

    while !shared.quit.load(Ordering::Relaxed) {
        // Snapshot (id, fd) pairs so the poll itself runs unlocked; only this
        // thread ever closes client sockets, so the raw fds stay valid.
        let mut entries: Vec<(Option<u64>, RawFd)> = vec![(None, listener.as_raw_fd())];
        entries.extend(
            lock(&shared.clients)
                .iter()
                .map(|client| (Some(client.id), client.sock.as_raw_fd())),
        );

        let mut poll_fds: Vec<PollFd> = entries
            .iter()
            .map(|&(_, fd)| PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, PollFlags::POLLIN))
            .collect();

        match poll(&mut poll_fds, PollTimeout::from(1000u16)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(err) => {
                error!("broker poll failed: {err}");
                break;
            }
        }

        let ready: Vec<Option<u64>> = entries
            .iter()
            .zip(&poll_fds)
            .filter(|(_, poll_fd)| {
                poll_fd
                    .revents()
                    .is_some_and(|revents| !revents.is_empty())
            })
            .map(|(&(id, _), _)| id)
            .collect();

        for id in ready {
            match id {
                None => accept_client(&listener, &shared, &mut next_client_id),
                Some(id) => service_client(&shared, id),
            }
        }
    }

    // shutdown: every client drops here, closing its socket and buffer fds
    lock(&shared.clients).clear();
}

fn accept_client(listener: &OwnedFd, shared: &Arc<Shared>, next_client_id: &mut u64) {
    match socket::accept4(
        listener.as_raw_fd(),
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
    ) {
        Ok(raw) => {
            let sock = unsafe { OwnedFd::from_raw_fd(raw) };
            let id = *next_client_id;
            *next_client_id += 1;
            info!("capture client {id} connected");
            lock(&shared.clients).push(Client::new(id, sock));
        }
        Err(err) if err == Errno::EAGAIN || err == Errno::EWOULDBLOCK => {}
        Err(err) => warn!("accept failed: {err}"),
    }
}

enum ClientAction {
    Keep,
    Drop,
}

fn service_client(shared: &Arc<Shared>, id: u64) {
    let mut clients = lock(&shared.clients);
    let Some(index) = clients.iter().position(|client| client.id == id) else {
        return;
    };
    match drain_client(&mut clients[index]) {
        ClientAction::Keep => {}
        ClientAction::Drop => {
            let client = clients.remove(index);
            info!("capture client {} removed", client.describe());
            // client drops here: socket and any buffer fds are closed, and
            // the next poll set no longer contains it
        }
    }
}

/// Read messages until the socket would block. Any malformed message drops
/// the client on the spot, closing whatever fds it just delivered.
fn drain_client(client: &mut Client) -> ClientAction {
    let mut frame = [0u8; MAX_FRAME_SIZE];
    loop {
        let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_PLANES]);
        let (bytes, fds) = {
            let mut iov = [IoSliceMut::new(&mut frame)];
            let msg = match socket::recvmsg::<()>(
                client.sock.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_CMSG_CLOEXEC,
            ) {
                Ok(msg) => msg,
                Err(err) if err == Errno::EAGAIN || err == Errno::EWOULDBLOCK => {
                    return ClientAction::Keep;
                }
                Err(Errno::ECONNRESET) => return ClientAction::Drop,
                Err(err) => {
                    warn!("recvmsg from client {} failed: {err}", client.id);
                    return ClientAction::Drop;
                }
            };

            // Take ownership of delivered fds first so every error path below
            // closes them.
            let mut fds: Vec<OwnedFd> = Vec::new();
            let Ok(cmsgs) = msg.cmsgs() else {
                return ClientAction::Drop;
            };
            for cmsg in cmsgs {
                match cmsg {
                    ControlMessageOwned::ScmRights(raw_fds) => fds.extend(
                        raw_fds
                            .into_iter()
                            .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }),
                    ),
                    _ => {
                        warn!("unexpected control message from client {}", client.id);
                        return ClientAction::Drop;
                    }
                }
            }
            (msg.bytes, fds)
        };

        if bytes == 0 {
            return ClientAction::Drop; // EOF
        }

        match frame[0] {
            MSG_CLIENT_INFO => {
                if bytes != CLIENT_INFO_SIZE || !fds.is_empty() {
                    return ClientAction::Drop;
                }
                match bincode::deserialize(&frame[1..bytes]) {
                    Ok(info) => client.info = Some(info),
                    Err(_) => return ClientAction::Drop,
                }
                debug!("client {} is {}", client.id, client.describe());
                // one message per wake for the identity handshake
                return ClientAction::Keep;
            }
            MSG_TEXTURE_INFO => {
                if bytes != TEXTURE_INFO_SIZE {
                    return ClientAction::Drop;
                }
                let info: TextureInfo = match bincode::deserialize(&frame[1..bytes]) {
                    Ok(info) => info,
                    Err(_) => return ClientAction::Drop,
                };
                let nfd = info.nfd as usize;
                if nfd == 0 || nfd > MAX_PLANES || fds.len() != nfd {
                    warn!(
                        "client {} announced {} fds but delivered {}",
                        client.id,
                        info.nfd,
                        fds.len()
                    );
                    return ClientAction::Drop; // delivered fds close with the vec
                }
                // supersede: the old fds close as they are overwritten
                client.buf_fds = [None, None, None, None];
                for (slot, fd) in client.buf_fds.iter_mut().zip(fds) {
                    *slot = Some(fd);
                }
                client.texture = Some(info);
                client.buf_id += 1;
                debug!(
                    "client {} shared {}x{} texture (buf {})",
                    client.id, info.width, info.height, client.buf_id
                );
            }
            _ => return ClientAction::Drop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ApiKind, DRM_FORMAT_MOD_INVALID, Message};
    use std::fs::File;
    use std::io::IoSlice;
    use std::os::unix::net::UnixStream;
    use std::time::{Duration, Instant};

    fn test_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("vkcapture-broker-{}-{tag}.sock", std::process::id()))
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting on broker");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn texture_info(nfd: u8) -> TextureInfo {
        TextureInfo {
            width: 640,
            height: 480,
            format: 0,
            flip: false,
            nfd,
            strides: [2560, 0, 0, 0],
            offsets: [0; MAX_PLANES],
            modifier: DRM_FORMAT_MOD_INVALID,
            winid: 0,
        }
    }

    fn send_client_info(stream: &UnixStream, pid: u32) {
        let frame = Message::Client(ClientInfo::new(pid, "test-producer", ApiKind::Vulkan))
            .encode()
            .unwrap();
        socket::sendmsg::<()>(
            stream.as_raw_fd(),
            &[IoSlice::new(&frame)],
            &[],
            MsgFlags::empty(),
            None,
        )
        .unwrap();
    }

    fn send_texture(stream: &UnixStream, info: &TextureInfo, fds: &[RawFd]) {
        let frame = Message::Texture(*info).encode().unwrap();
        let cmsg = [socket::ControlMessage::ScmRights(fds)];
        socket::sendmsg::<()>(
            stream.as_raw_fd(),
            &[IoSlice::new(&frame)],
            &cmsg,
            MsgFlags::empty(),
            None,
        )
        .unwrap();
    }

    #[test]
    fn registers_clients_and_their_metadata() {
        let broker = Broker::bind(test_path("register")).unwrap();
        let stream = UnixStream::connect(test_path("register")).unwrap();
        send_client_info(&stream, 4242);

        let shared = broker.shared();
        wait_until(|| {
            lock(&shared.clients)
                .first()
                .and_then(|c| c.info)
                .is_some_and(|info| info.pid == 4242)
        });
        broker.with_clients(|clients| {
            assert_eq!(clients.len(), 1);
            assert_eq!(clients[0].buf_id, 0);
            assert!(clients[0].texture.is_none());
        });
    }

    #[test]
    fn texture_updates_bump_buf_id_and_replace_fds() {
        let broker = Broker::bind(test_path("bufid")).unwrap();
        let stream = UnixStream::connect(test_path("bufid")).unwrap();
        send_client_info(&stream, 1);

        let file = File::open("/dev/null").unwrap();
        send_texture(&stream, &texture_info(1), &[file.as_raw_fd()]);
        let shared = broker.shared();
        wait_until(|| lock(&shared.clients).first().is_some_and(|c| c.buf_id == 1));

        // identical metadata again still advances buf_id
        send_texture(&stream, &texture_info(1), &[file.as_raw_fd()]);
        wait_until(|| lock(&shared.clients).first().is_some_and(|c| c.buf_id == 2));

        broker.with_clients(|clients| {
            let client = &clients[0];
            assert_eq!(client.plane_fds().len(), 1);
            assert_eq!(client.texture.unwrap().width, 640);
        });
    }

    #[test]
    fn fd_count_mismatch_drops_the_client() {
        let broker = Broker::bind(test_path("mismatch")).unwrap();
        let stream = UnixStream::connect(test_path("mismatch")).unwrap();
        send_client_info(&stream, 2);

        let shared = broker.shared();
        wait_until(|| !lock(&shared.clients).is_empty());

        // claims two planes, delivers one fd
        let file = File::open("/dev/null").unwrap();
        send_texture(&stream, &texture_info(2), &[file.as_raw_fd()]);
        wait_until(|| lock(&shared.clients).is_empty());
    }

    #[test]
    fn unknown_discriminants_drop_the_client() {
        let broker = Broker::bind(test_path("unknown")).unwrap();
        let stream = UnixStream::connect(test_path("unknown")).unwrap();
        send_client_info(&stream, 3);
        let shared = broker.shared();
        wait_until(|| !lock(&shared.clients).is_empty());

        socket::sendmsg::<()>(
            stream.as_raw_fd(),
            &[IoSlice::new(&[0xAAu8; 16])],
            &[],
            MsgFlags::empty(),
            None,
        )
        .unwrap();
        wait_until(|| lock(&shared.clients).is_empty());
    }

    #[test]
    fn reconnect_gets_a_fresh_identity() {
        let path = test_path("reconnect");
        let broker = Broker::bind(&path).unwrap();
        let shared = broker.shared();

        let stream = UnixStream::connect(&path).unwrap();
        send_client_info(&stream, 7);
        wait_until(|| !lock(&shared.clients).is_empty());
        let first_id = lock(&shared.clients)[0].id;

        drop(stream); // EOF cleans the record up
        wait_until(|| lock(&shared.clients).is_empty());

        let stream = UnixStream::connect(&path).unwrap();
        send_client_info(&stream, 7);
        wait_until(|| !lock(&shared.clients).is_empty());
        let second_id = lock(&shared.clients)[0].id;

        assert_ne!(first_id, second_id);
        broker.with_clients(|clients| assert_eq!(clients[0].buf_id, 0));
    }

    #[test]
    fn shutdown_unlinks_the_socket() {
        let path = test_path("shutdown");
        let mut broker = Broker::bind(&path).unwrap();
        assert!(path.exists());
        broker.shutdown();
        assert!(!path.exists());
        assert!(UnixStream::connect(&path).is_err());
    }
}
