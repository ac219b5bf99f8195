//! Bus endpoint connected to a `BusDaemon` over TCP.

use std::net::SocketAddr;

use crate::bus::daemon::{BusMsg, read_msg, write_msg, write_msg_blocking};
use crate::bus::{BusEvent, MulticastBus};
use crate::utils::{StripeKvError, tcp_connect_with_retry};

use async_trait::async_trait;

use bytes::{Bytes, BytesMut};

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{self, mpsc};
use tokio::task::JoinHandle;

/// Bus member talking to a remote daemon.
pub struct RemoteEndpoint {
    /// My member name.
    name: String,

    /// Receiver side of the recv channel.
    rx_recv: sync::Mutex<mpsc::UnboundedReceiver<BusEvent>>,

    /// Sender side of the send channel.
    tx_send: mpsc::UnboundedSender<BusMsg>,

    /// Messenger thread join handle.
    messenger_handle: JoinHandle<()>,
}

// RemoteEndpoint public API implementation
impl RemoteEndpoint {
    /// Connects to the daemon, registers under `name`, and spawns the
    /// messenger thread.
    pub async fn new_and_setup(
        daemon: SocketAddr,
        name: impl Into<String>,
    ) -> Result<Self, StripeKvError> {
        let name = name.into();
        pf_debug!("connecting to bus daemon '{}' as '{}'...", daemon, name);
        let stream = tcp_connect_with_retry(daemon, 10).await?;
        let (mut conn_read, conn_write) = stream.into_split();

        write_msg_blocking(&conn_write, &BusMsg::Hello { name: name.clone() })
            .await?;
        let mut read_buf = BytesMut::new();
        match read_msg(&mut read_buf, &mut conn_read).await? {
            BusMsg::Welcome => {}
            BusMsg::Refused { reason } => {
                return logged_err!("bus daemon refused '{}': {}", name, reason);
            }
            msg => {
                return logged_err!("unexpected handshake reply {:?}", msg);
            }
        }

        let (tx_recv, rx_recv) = mpsc::unbounded_channel();
        let (tx_send, rx_send) = mpsc::unbounded_channel();
        let messenger_handle = tokio::spawn(Self::messenger_thread(
            name.clone(),
            conn_read,
            conn_write,
            read_buf,
            tx_recv,
            rx_send,
        ));

        Ok(RemoteEndpoint {
            name,
            rx_recv: sync::Mutex::new(rx_recv),
            tx_send,
            messenger_handle,
        })
    }

    fn send_msg(&self, msg: BusMsg) -> Result<(), StripeKvError> {
        self.tx_send
            .send(msg)
            .map_err(|e| StripeKvError::msg(format!("bus send failed: {}", e)))
    }

    /// Says goodbye to the daemon and waits for the messenger to finish.
    pub async fn disconnect(self) -> Result<(), StripeKvError> {
        self.send_msg(BusMsg::Bye)?;
        drop(self.tx_send);
        self.messenger_handle.await?;
        Ok(())
    }
}

#[async_trait]
impl MulticastBus for RemoteEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    async fn join(&self, group: &str) -> Result<(), StripeKvError> {
        self.send_msg(BusMsg::Join {
            group: group.into(),
        })
    }

    async fn leave(&self, group: &str) -> Result<(), StripeKvError> {
        self.send_msg(BusMsg::Leave {
            group: group.into(),
        })
    }

    async fn multicast(
        &self,
        groups: &[&str],
        payload: Bytes,
    ) -> Result<(), StripeKvError> {
        self.send_msg(BusMsg::Multicast {
            groups: groups.iter().map(|g| g.to_string()).collect(),
            payload,
        })
    }

    async fn receive(&self) -> Result<BusEvent, StripeKvError> {
        match self.rx_recv.lock().await.recv().await {
            Some(event) => Ok(event),
            None => logged_err!("bus connection of '{}' closed", self.name),
        }
    }
}

// RemoteEndpoint messenger thread implementation
impl RemoteEndpoint {
    /// Frame listener and sender thread function.
    async fn messenger_thread(
        name: String,
        mut conn_read: OwnedReadHalf,
        conn_write: OwnedWriteHalf,
        mut read_buf: BytesMut,
        tx_recv: mpsc::UnboundedSender<BusEvent>,
        mut rx_send: mpsc::UnboundedReceiver<BusMsg>,
    ) {
        pf_debug!("messenger thread of '{}' spawned", name);

        let mut write_buf = BytesMut::new();
        let mut write_buf_cursor = 0;

        let mut retrying = false;
        loop {
            tokio::select! {
                // gets a frame to send to the daemon
                msg = rx_send.recv(), if !retrying => {
                    let Some(msg) = msg else { break };
                    let bye = msg == BusMsg::Bye;
                    match write_msg(
                        &mut write_buf,
                        &mut write_buf_cursor,
                        &conn_write,
                        Some(&msg),
                    ) {
                        Ok(true) if bye => break,
                        Ok(true) => {}
                        Ok(false) => {
                            pf_debug!("should start retrying bus send");
                            retrying = true;
                        }
                        Err(e) => {
                            pf_error!("error sending to bus: {}", e);
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
                            pf_error!("error retrying bus send: {}", e);
                            break;
                        }
                    }
                },

                // receives a frame from the daemon
                msg = read_msg(&mut read_buf, &mut conn_read) => {
                    match msg {
                        Ok(BusMsg::Event(event)) => {
                            if tx_recv.send(event).is_err() {
                                break; // endpoint dropped
                            }
                        }
                        Ok(msg) => {
                            pf_warn!("unexpected frame from bus daemon: {:?}", msg);
                        }
                        Err(e) => {
                            pf_warn!("bus connection lost: {}", e);
                            break;
                        }
                    }
                },
            }
        }

        pf_debug!("messenger thread of '{}' exited", name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusDaemon, CLIENT_GROUP, COORD_GROUP};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn daemon_routes_between_endpoints() -> Result<(), StripeKvError> {
        let daemon = BusDaemon::new_and_setup("127.0.0.1:42281".parse()?).await?;
        let addr = daemon.local_addr();

        let coord = RemoteEndpoint::new_and_setup(addr, "coord0").await?;
        coord.join(COORD_GROUP).await?;
        coord.join(CLIENT_GROUP).await?;
        for group in [COORD_GROUP, CLIENT_GROUP] {
            assert_eq!(
                coord.receive().await?,
                BusEvent::Joined {
                    group: group.into(),
                    member: "coord0".into()
                }
            );
        }

        assert!(RemoteEndpoint::new_and_setup(addr, "coord0").await.is_err());

        let client = RemoteEndpoint::new_and_setup(addr, "client0").await?;
        client.join(CLIENT_GROUP).await?;
        assert_eq!(
            coord.receive().await?,
            BusEvent::Joined {
                group: CLIENT_GROUP.into(),
                member: "client0".into()
            }
        );
        client
            .multicast(&[COORD_GROUP], Bytes::from_static(b"\x00"))
            .await?;
        assert_eq!(
            coord.receive().await?,
            BusEvent::Message {
                sender: "client0".into(),
                payload: Bytes::from_static(b"\x00")
            }
        );

        client.disconnect().await?;
        assert_eq!(
            coord.receive().await?,
            BusEvent::Left {
                group: CLIENT_GROUP.into(),
                member: "client0".into()
            }
        );

        daemon.shutdown().await?;
        Ok(())
    }
}
