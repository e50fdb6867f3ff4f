use std::{net::SocketAddr, sync::Arc};
use bytes::BytesMut;
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tracing::Instrument;
use crate::{
    block::{Block, BlockInfo},
    torrent::TorrentContext,
    ID,
};

mod handshake;
pub(crate) mod message;
mod session;
pub mod state;

pub use session::PeerSession;
pub use handshake::{Handshake, HandshakeCodec, HANDSHAKE_LEN};
use state::SessionState;

pub(crate) type Result<T> = std::result::Result<T, PeerError>;
pub type PeerRx = mpsc::UnboundedReceiver<PeerCommand>;
pub type PeerTx = mpsc::UnboundedSender<PeerCommand>;

#[derive(thiserror::Error, Debug)]
pub enum PeerError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake with wrong protocol")]
    WrongProtocol,

    #[error("handshake with wrong info-hash")]
    WrongInfoHash,

    #[error("no handshake received")]
    NoHandshake,

    #[error("invalid message id: {0}")]
    InvalidMessageId(u8),

    #[error("frame of {0} bytes exceeds limit")]
    Oversized(usize),

    #[error("bitfield not the first message")]
    UnexpectedBitfield,

    #[error("invalid message payload")]
    InvalidMessage,

    #[error("request out of range")]
    OutOfRangeRequest,

    #[error("inbound request queue overflow")]
    TooManyRequests,

    #[error("connection budget exhausted")]
    AtCapacity,

    #[error("connection timeout")]
    Timeout,

    #[error("peer idle for too long")]
    Idle,

    #[error("channel closed: {0}")]
    Channel(String),

}

impl<T> From<mpsc::error::SendError<T>> for PeerError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        PeerError::Channel(e.to_string())
    }
}

// Whether the error indicates a misbehaving peer (backoff applies) or
// just a broken transport (silent close).
impl PeerError {
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            PeerError::WrongProtocol
                | PeerError::WrongInfoHash
                | PeerError::InvalidMessageId(_)
                | PeerError::Oversized(_)
                | PeerError::UnexpectedBitfield
                | PeerError::InvalidMessage
                | PeerError::OutOfRangeRequest
                | PeerError::TooManyRequests
        )
    }
}

pub enum PeerCommand {

    // A piece we verified; advertise or cancel as appropriate.
    PieceWritten(usize),

    // A block read from disk, ready to send.
    BlockRead(Block),

    // Another peer delivered this block first; cancel if we hold it.
    BlockArrived(BlockInfo),

    // Choke round decision.
    Choke(bool),

    Shutdown,

}

// An inbound connection whose handshake the engine already consumed,
// along with whatever else was in the read buffer.
pub struct InboundPeer {

    pub stream: TcpStream,

    pub read_buf: BytesMut,

    pub remote_id: ID,

}

#[derive(Debug)]
pub struct PeerHandle {

    pub peer_tx: PeerTx,

    // Taken on shutdown to join the task.
    pub session_handle: Option<JoinHandle<()>>,

    // Last state reported by the session task.
    pub state: SessionState,

    pub id: Option<ID>,

}

impl PeerHandle {
    pub fn start_session(
        address: SocketAddr,
        ctx: Arc<TorrentContext>,
        inbound: Option<InboundPeer>,
    ) -> Self {

        let (mut session, peer_tx) = PeerSession::new(address, ctx);
        let session_handle = tokio::spawn(
            async move {
                if let Err(e) = session.run(inbound).await {
                    tracing::debug!("session ended: {}", e);
                    session.handle_error(&e).await;
                }
                session.disconnect().await;
            }
            .instrument(tracing::info_span!("peer", addr = %address)),
        );

        PeerHandle {
            peer_tx,
            session_handle: Some(session_handle),
            state: SessionState::default(),
            id: None,
        }
    }
}
