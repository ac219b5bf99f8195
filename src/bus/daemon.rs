//! TCP bus daemon routing group multicasts between node processes.
//!
//! One acceptor task takes new member connections, one servant task per
//! member moves frames between its socket and the router task, and the
//! router task owns group membership.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;

use crate::bus::BusEvent;
use crate::utils::{
    StripeKvError, safe_tcp_read, safe_tcp_write, tcp_bind_with_retry,
};

use bytes::{Bytes, BytesMut};

use serde::{Deserialize, Serialize};

use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Frames exchanged between the daemon and remote endpoints.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub(crate) enum BusMsg {
    /// Endpoint -> Daemon: first frame, naming the member.
    Hello { name: String },

    /// Daemon -> Endpoint: name accepted.
    Welcome,

    /// Daemon -> Endpoint: name rejected.
    Refused { reason: String },

    /// Endpoint -> Daemon: join a group.
    Join { group: String },

    /// Endpoint -> Daemon: leave a group.
    Leave { group: String },

    /// Endpoint -> Daemon: multicast to groups.
    Multicast { groups: Vec<String>, payload: Bytes },

    /// Daemon -> Endpoint: something happened on the bus.
    Event(BusEvent),

    /// Endpoint -> Daemon: leaving the bus.
    Bye,
}

/// Reads one frame from a member connection.
pub(crate) async fn read_msg(
    read_buf: &mut BytesMut,
    conn_read: &mut OwnedReadHalf,
) -> Result<BusMsg, StripeKvError> {
    safe_tcp_read(read_buf, conn_read).await
}

/// Writes one frame to a member connection; see `safe_tcp_write`.
pub(crate) fn write_msg(
    write_buf: &mut BytesMut,
    write_buf_cursor: &mut usize,
    conn_write: &OwnedWriteHalf,
    msg: Option<&BusMsg>,
) -> Result<bool, StripeKvError> {
    safe_tcp_write(write_buf, write_buf_cursor, conn_write, msg)
}

/// Writes one frame, waiting for writability until it is fully sent.
pub(crate) async fn write_msg_blocking(
    conn_write: &OwnedWriteHalf,
    msg: &BusMsg,
) -> Result<(), StripeKvError> {
    let mut write_buf = BytesMut::new();
    let mut write_buf_cursor = 0;
    let mut done =
        write_msg(&mut write_buf, &mut write_buf_cursor, conn_write, Some(msg))?;
    while !done {
        conn_write.writable().await?;
        done = write_msg(&mut write_buf, &mut write_buf_cursor, conn_write, None)?;
    }
    Ok(())
}

/// Sender side of every member's outgoing frame channel.
type MemberSends = flashmap::ReadHandle<String, mpsc::UnboundedSender<BusMsg>>;

/// The bus daemon.
pub struct BusDaemon {
    /// Address actually bound.
    local_addr: SocketAddr,

    /// Join handle of the acceptor thread.
    acceptor_handle: JoinHandle<()>,

    /// Join handle of the router thread.
    router_handle: JoinHandle<()>,

    /// Termination signal for internal threads.
    tx_stop: watch::Sender<bool>,
}

// BusDaemon public API implementation
impl BusDaemon {
    /// Binds the listening socket and spawns the acceptor and router
    /// threads.
    pub async fn new_and_setup(
        bind_addr: SocketAddr,
    ) -> Result<Self, StripeKvError> {
        let (tx_recv, rx_recv) = mpsc::unbounded_channel();
        let (tx_sends_write, tx_sends_read) =
            flashmap::new::<String, mpsc::UnboundedSender<BusMsg>>();
        let (tx_stop, rx_stop) = watch::channel(false);

        let listener = tcp_bind_with_retry(bind_addr, 10).await?;
        let local_addr = listener.local_addr()?;

        let acceptor_handle = tokio::spawn(Self::acceptor_thread(
            listener,
            tx_recv,
            tx_sends_write,
            rx_stop.clone(),
        ));
        let router_handle =
            tokio::spawn(Self::router_thread(rx_recv, tx_sends_read, rx_stop));

        Ok(BusDaemon {
            local_addr,
            acceptor_handle,
            router_handle,
            tx_stop,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves until the termination signal fires, then stops all threads.
    pub async fn run(
        self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), StripeKvError> {
        pf_info!("bus daemon serving on '{}'", self.local_addr);
        while !*rx_term.borrow() {
            if rx_term.changed().await.is_err() {
                break;
            }
        }
        self.shutdown().await
    }

    /// Stops all threads and waits for them to exit.
    pub async fn shutdown(self) -> Result<(), StripeKvError> {
        self.tx_stop.send(true)?;
        self.acceptor_handle.await?;
        self.router_handle.await?;
        pf_info!("bus daemon on '{}' stopped", self.local_addr);
        Ok(())
    }
}

// BusDaemon acceptor thread implementation
impl BusDaemon {
    /// Performs the hello handshake and registers a new member.
    async fn accept_new_member(
        mut conn_read: OwnedReadHalf,
        conn_write: OwnedWriteHalf,
        addr: SocketAddr,
        tx_recv: mpsc::UnboundedSender<(String, BusMsg)>,
        tx_sends: &mut flashmap::WriteHandle<
            String,
            mpsc::UnboundedSender<BusMsg>,
        >,
        servant_handles: &mut HashMap<String, JoinHandle<()>>,
        tx_exit: mpsc::UnboundedSender<String>,
    ) -> Result<(), StripeKvError> {
        let mut read_buf = BytesMut::new();
        let hello = time::timeout(
            Duration::from_secs(5),
            read_msg(&mut read_buf, &mut conn_read),
        )
        .await
        .map_err(|_| StripeKvError::msg("hello handshake timed out"))??;
        let name = match hello {
            BusMsg::Hello { name } => name,
            msg => {
                return logged_err!(
                    "expected hello from '{}', got {:?}",
                    addr,
                    msg
                );
            }
        };

        let duplicate = {
            let mut tx_sends_guard = tx_sends.guard();
            let closed = tx_sends_guard.get(&name).map(|s| s.is_closed());
            match closed {
                Some(true) => {
                    // this name has left before, garbage collect it now
                    tx_sends_guard.remove(name.clone());
                    servant_handles.remove(&name);
                    false
                }
                Some(false) => true,
                None => false,
            }
        };
        if duplicate {
            let reason = format!("duplicate member name '{}'", name);
            write_msg_blocking(
                &conn_write,
                &BusMsg::Refused {
                    reason: reason.clone(),
                },
            )
            .await?;
            return logged_err!("{}", reason);
        }
        write_msg_blocking(&conn_write, &BusMsg::Welcome).await?;
        pf_debug!("accepted bus member '{}' from '{}'", name, addr);

        let (tx_send, rx_send) = mpsc::unbounded_channel();
        {
            let mut tx_sends_guard = tx_sends.guard();
            tx_sends_guard.insert(name.clone(), tx_send);
            tx_sends_guard.publish();
        }

        let servant_handle = tokio::spawn(Self::servant_thread(
            name.clone(),
            conn_read,
            conn_write,
            read_buf,
            tx_recv,
            rx_send,
            tx_exit,
        ));
        servant_handles.insert(name, servant_handle);
        Ok(())
    }

    /// Acceptor thread function.
    async fn acceptor_thread(
        listener: TcpListener,
        tx_recv: mpsc::UnboundedSender<(String, BusMsg)>,
        mut tx_sends: flashmap::WriteHandle<
            String,
            mpsc::UnboundedSender<BusMsg>,
        >,
        mut rx_stop: watch::Receiver<bool>,
    ) {
        pf_debug!("acceptor thread spawned");

        // exit channel for getting notified about termination of servants
        let (tx_exit, mut rx_exit) = mpsc::unbounded_channel();
        let mut servant_handles = HashMap::new();

        loop {
            tokio::select! {
                // new member connection
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            pf_warn!("error accepting member connection: {}", e);
                            continue;
                        }
                    };
                    let (conn_read, conn_write) = stream.into_split();
                    if let Err(e) = Self::accept_new_member(
                        conn_read,
                        conn_write,
                        addr,
                        tx_recv.clone(),
                        &mut tx_sends,
                        &mut servant_handles,
                        tx_exit.clone(),
                    ).await {
                        pf_error!("error accepting new member: {}", e);
                    }
                },

                // a servant thread exits
                name = rx_exit.recv() => {
                    let Some(name) = name else { break };
                    let mut tx_sends_guard = tx_sends.guard();
                    if tx_sends_guard.contains_key(&name) {
                        tx_sends_guard.remove(name.clone());
                    }
                    servant_handles.remove(&name);
                },

                _ = rx_stop.changed() => break,
            }
        }

        for (_, handle) in servant_handles.drain() {
            handle.abort();
        }
        pf_debug!("acceptor thread exited");
    }
}

// BusDaemon servant thread implementation
impl BusDaemon {
    /// Per-member frame mover thread function.
    async fn servant_thread(
        name: String,
        mut conn_read: OwnedReadHalf,
        conn_write: OwnedWriteHalf,
        mut read_buf: BytesMut,
        tx_recv: mpsc::UnboundedSender<(String, BusMsg)>,
        mut rx_send: mpsc::UnboundedReceiver<BusMsg>,
        tx_exit: mpsc::UnboundedSender<String>,
    ) {
        pf_debug!("servant thread for '{}' spawned", name);

        let mut write_buf = BytesMut::new();
        let mut write_buf_cursor = 0;

        let mut retrying = false;
        loop {
            tokio::select! {
                // gets a frame to send to the member
                msg = rx_send.recv(), if !retrying => {
                    let Some(msg) = msg else { break };
                    match write_msg(
                        &mut write_buf,
                        &mut write_buf_cursor,
                        &conn_write,
                        Some(&msg),
                    ) {
                        Ok(true) => {}
                        Ok(false) => {
                            pf_debug!("should start retrying send -> '{}'", name);
                            retrying = true;
                        }
                        Err(e) => {
                            pf_warn!("error sending -> '{}': {}", name, e);
                            break;
                        }
                    }
                },

                // retrying last unsuccessful send
                _ = conn_write.writable(), if retrying => {
                    match write_msg(
                        &mut write_buf,
                        &mut write_buf_cursor,
                        &conn_write,
                        None,
                    ) {
                        Ok(true) => retrying = false,
                        Ok(false) => {}
                        Err(e) => {
                            pf_warn!("error retrying send -> '{}': {}", name, e);
                            break;
                        }
                    }
                },

                // receives a frame from the member
                msg = read_msg(&mut read_buf, &mut conn_read) => {
                    match msg {
                        Ok(BusMsg::Bye) => break,
                        Ok(msg) => {
                            if let Err(e) = tx_recv.send((name.clone(), msg)) {
                                pf_error!("error forwarding from '{}': {}", name, e);
                            }
                        }
                        Err(_) => break, // member probably exited ungracefully
                    }
                },
            }
        }

        // the router cleans up memberships on behalf of the gone member
        if let Err(e) = tx_recv.send((name.clone(), BusMsg::Bye)) {
            pf_error!("error sending bye for '{}': {}", name, e);
        }
        if let Err(e) = tx_exit.send(name.clone()) {
            pf_error!("error sending exit signal for '{}': {}", name, e);
        }
        pf_debug!("servant thread for '{}' exited", name);
    }
}

// BusDaemon router thread implementation
impl BusDaemon {
    fn deliver(tx_sends: &MemberSends, member: &str, event: BusEvent) {
        let tx_sends_guard = tx_sends.guard();
        if let Some(tx_send) = tx_sends_guard.get(member) {
            if tx_send.send(BusMsg::Event(event)).is_err() {
                pf_debug!("member '{}' gone while delivering", member);
            }
        }
    }

    fn notify_group(
        groups: &HashMap<String, BTreeSet<String>>,
        tx_sends: &MemberSends,
        group: &str,
        event: BusEvent,
    ) {
        if let Some(members) = groups.get(group) {
            for member in members {
                Self::deliver(tx_sends, member, event.clone());
            }
        }
    }

    fn route(
        groups: &mut HashMap<String, BTreeSet<String>>,
        tx_sends: &MemberSends,
        sender: String,
        msg: BusMsg,
    ) {
        match msg {
            BusMsg::Join { group } => {
                if groups.entry(group.clone()).or_default().insert(sender.clone())
                {
                    let event = BusEvent::Joined {
                        group: group.clone(),
                        member: sender,
                    };
                    Self::notify_group(groups, tx_sends, &group, event);
                }
            }

            BusMsg::Leave { group } => {
                if groups
                    .get_mut(&group)
                    .is_some_and(|members| members.remove(&sender))
                {
                    let event = BusEvent::Left {
                        group: group.clone(),
                        member: sender,
                    };
                    Self::notify_group(groups, tx_sends, &group, event);
                }
            }

            BusMsg::Multicast {
                groups: targets,
                payload,
            } => {
                let mut members = BTreeSet::new();
                for group in &targets {
                    if let Some(m) = groups.get(group) {
                        members.extend(m.iter().filter(|m| **m != sender));
                    }
                }
                for member in members {
                    Self::deliver(
                        tx_sends,
                        member,
                        BusEvent::Message {
                            sender: sender.clone(),
                            payload: payload.clone(),
                        },
                    );
                }
            }

            BusMsg::Bye => {
                let left: Vec<String> = groups
                    .iter_mut()
                    .filter_map(|(g, members)| {
                        members.remove(&sender).then(|| g.clone())
                    })
                    .collect();
                for group in left {
                    let event = BusEvent::Left {
                        group: group.clone(),
                        member: sender.clone(),
                    };
                    Self::notify_group(groups, tx_sends, &group, event);
                }
            }

            msg => {
                pf_warn!("unexpected frame from '{}': {:?}", sender, msg);
            }
        }
    }

    /// Router thread function.
    async fn router_thread(
        mut rx_recv: mpsc::UnboundedReceiver<(String, BusMsg)>,
        tx_sends: MemberSends,
        mut rx_stop: watch::Receiver<bool>,
    ) {
        pf_debug!("router thread spawned");
        let mut groups: HashMap<String, BTreeSet<String>> = HashMap::new();

        loop {
            tokio::select! {
                msg = rx_recv.recv() => {
                    let Some((sender, msg)) = msg else { break };
                    Self::route(&mut groups, &tx_sends, sender, msg);
                },

                _ = rx_stop.changed() => break,
            }
        }

        pf_debug!("router thread exited");
    }
}
