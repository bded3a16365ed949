//! L2CAP sequential-packet channel carrying accessory control frames.

use std::{sync::Arc, time::Duration};

use bluer::{
   AddressType,
   l2cap::{SeqPacket, Socket, SocketAddr},
};
use log::{debug, warn};
use tokio::{
   sync::{mpsc, oneshot},
   task::JoinSet,
   time,
};

use crate::{
   accessory::{AccessoryError, TimeoutLayer},
   address::Address,
   error::{Error, Result},
   transport::Packet,
};

/// PSM of the accessory control channel
pub const PSM_CONTROL: u16 = 0x1001;
/// Maximum transmission unit for L2CAP packets
const L2CAP_MTU: usize = 672;
/// Timeout for write operations
const WRITE_TIMEOUT: Duration = Duration::from_secs(25);
/// Timeout for connection attempts
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

struct Outgoing {
   data: Packet,
   then: oneshot::Sender<Result<()>>,
}

/// Receiver half of a control channel. `None` once the peer closed it.
#[derive(Debug)]
pub struct L2CapReceiver {
   rx: mpsc::Receiver<Packet>,
}

impl L2CapReceiver {
   pub async fn recv(&mut self) -> Option<Packet> {
      self.rx.recv().await
   }
}

/// Sender half of a control channel. Cheaply cloneable.
#[derive(Clone)]
pub struct L2CapSender {
   tx: mpsc::Sender<Outgoing>,
}

impl L2CapSender {
   pub fn is_connected(&self) -> bool {
      !self.tx.is_closed()
   }

   pub async fn send(&self, data: &[u8]) -> Result<()> {
      let closed = || Error::from(AccessoryError::ConnectionLost);
      let (tx, rx) = oneshot::channel();
      self
         .tx
         .send(Outgoing {
            data: Packet::from_slice(data),
            then: tx,
         })
         .await
         .map_err(|_| closed())?;

      time::timeout(WRITE_TIMEOUT, rx)
         .await
         .map_err(|_| AccessoryError::Timeout(TimeoutLayer::Transport))?
         .map_err(|_| closed())?
   }
}

pub async fn connect(
   jset: &mut JoinSet<()>,
   address: Address,
) -> Result<(L2CapReceiver, L2CapSender)> {
   debug!("Creating L2CAP socket for {address}");

   let socket = Socket::new_seq_packet()?;
   let addr = SocketAddr::new(address.into(), AddressType::BrEdr, PSM_CONTROL);
   debug!("Connecting to {address}:{PSM_CONTROL:#06x}");

   let seq_packet = time::timeout(CONNECT_TIMEOUT, socket.connect(addr))
      .await
      .map_err(|_| AccessoryError::Timeout(TimeoutLayer::Connection))??;

   let (cmd_tx, cmd_rx) = mpsc::channel(128);
   let (in_tx, in_rx) = mpsc::channel(128);

   let seq_packet = Arc::new(seq_packet);
   jset.spawn(recv_loop(address, in_tx, seq_packet.clone()));
   jset.spawn(send_loop(address, cmd_rx, seq_packet));

   Ok((L2CapReceiver { rx: in_rx }, L2CapSender { tx: cmd_tx }))
}

async fn recv_loop(adr: Address, tx: mpsc::Sender<Packet>, sp: Arc<SeqPacket>) {
   let mut stack = [0u8; L2CAP_MTU];
   while let Ok(n) = sp.recv(&mut stack).await {
      if n == 0 {
         warn!("{adr}: control channel closed by peer");
         return;
      }
      let recvd = &stack[..n];
      debug!("← {adr}: {}", hex::encode(recvd));
      if tx.send(Packet::from_slice(recvd)).await.is_err() {
         return;
      }
      stack[..n].fill(0);
   }
}

async fn send_loop(adr: Address, mut rx: mpsc::Receiver<Outgoing>, sp: Arc<SeqPacket>) {
   while let Some(Outgoing { data, then }) = rx.recv().await {
      debug!("→ {adr}: {}", hex::encode(&data));
      if let Err(e) = sp.send(&data).await {
         warn!("{adr}: failed to send frame: {e}");
         let _ = then.send(Err(Error::Io(e)));
      } else {
         let _ = then.send(Ok(()));
      }
   }
   debug!("{adr}: control channel released");
}
