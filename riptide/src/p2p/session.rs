use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{atomic::Ordering, Arc},
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::mpsc,
    time::{self, Duration, Instant},
};
use tokio_util::codec::{Framed, FramedParts};
use crate::{
    block::{Block, BlockInfo},
    disk::DiskCommand,
    picker::Receipt,
    torrent::{CommandToTorrent, TorrentContext},
    Bitfield, BLOCK_SIZE,
};
use super::{handshake::*, message::*, state::*, InboundPeer, PeerCommand, PeerError, PeerRx, PeerTx, Result};

type MessageSink = SplitSink<Framed<TcpStream, MessageCodec>, Message>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// A peer silent for this long is closed; we speak up shortly before
// we would hit it ourselves.
const IDLE_TIMEOUT: Duration = Duration::from_secs(120);
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(110);

// Unanswered requests are returned to the pool after this long,
// doubling per expiry for consistently slow peers.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(240);

// Cap on queued requests from the remote side.
const MAX_INBOUND_REQUESTS: usize = 64;

#[derive(Debug)]
pub struct PeerSession {

    address: SocketAddr,

    ctx: Arc<TorrentContext>,

    peer_rx: PeerRx,

    // Handed to the disk task for read replies.
    peer_tx: PeerTx,

    // Blocks the peer asked us for.
    requests_in: HashSet<BlockInfo>,

    // Blocks we asked the peer for, with request times for expiry.
    requests_out: HashMap<BlockInfo, Instant>,

    // Pieces the peer advertises.
    bitfield: Bitfield,

    state: SessionState,

    request_timeout: Duration,

    last_message_in: Instant,

    last_message_out: Instant,

    // Bitfield is only legal as the very first message.
    first_message: bool,

    // Set when the session died of a protocol violation.
    violation: bool,

}

impl PeerSession {

    pub fn new(address: SocketAddr, ctx: Arc<TorrentContext>) -> (PeerSession, PeerTx) {

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let bitfield = Bitfield::repeat(false, ctx.info.num_pieces as usize);

        (
            PeerSession {
                address,
                ctx,
                peer_rx,
                peer_tx: peer_tx.clone(),
                requests_in: HashSet::new(),
                requests_out: HashMap::new(),
                bitfield,
                state: SessionState::default(),
                request_timeout: REQUEST_TIMEOUT,
                last_message_in: Instant::now(),
                last_message_out: Instant::now(),
                first_message: true,
                violation: false,
            },
            peer_tx,
        )
    }

    pub async fn run(&mut self, inbound: Option<InboundPeer>) -> Result<()> {

        let socket = match inbound {
            Some(peer) => self.accept(peer).await?,
            None => self.connect().await?,
        };

        // Established connections count against the global budget for
        // as long as the session lives.
        let _conn_permit = self
            .ctx
            .connections
            .try_acquire()
            .ok_or(PeerError::AtCapacity)?;

        self.state.update(|state| state.conn_state = ConnState::Active);
        tracing::debug!("peer connected");
        self.drive(socket).await
    }

    // Outbound dial. The half-open permit covers TCP connect and the
    // handshake exchange, per the global cap.
    async fn connect(&mut self) -> Result<Framed<TcpStream, MessageCodec>> {

        let _half_open = self.ctx.half_open.acquire().await;
        self.state.update(|state| state.conn_state = ConnState::Connecting);

        let stream = time::timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(self.address))
            .await
            .map_err(|_| PeerError::Timeout)??;

        self.state.update(|state| state.conn_state = ConnState::Handshaking);
        let mut socket = Framed::new(stream, HandshakeCodec);
        socket
            .send(Handshake::new(self.ctx.id, self.ctx.client_id))
            .await?;

        let handshake = time::timeout(HANDSHAKE_TIMEOUT, socket.next())
            .await
            .map_err(|_| PeerError::Timeout)?
            .ok_or(PeerError::NoHandshake)??;
        if handshake.info_hash != self.ctx.id {
            return Err(PeerError::WrongInfoHash);
        }

        self.ctx.torrent_tx.send(CommandToTorrent::PeerConnected {
            address: self.address,
            id: handshake.peer_id,
        })?;

        Ok(message_framed(socket, Default::default()))
    }

    // Inbound connection: the engine validated the handshake against
    // our info-hash and read it off the socket already; we reply and
    // pick up from whatever else was buffered.
    async fn accept(&mut self, peer: InboundPeer) -> Result<Framed<TcpStream, MessageCodec>> {

        self.state.update(|state| state.conn_state = ConnState::Handshaking);
        let mut socket = Framed::new(peer.stream, HandshakeCodec);
        socket
            .send(Handshake::new(self.ctx.id, self.ctx.client_id))
            .await?;

        self.ctx.torrent_tx.send(CommandToTorrent::PeerConnected {
            address: self.address,
            id: peer.remote_id,
        })?;

        Ok(message_framed(socket, peer.read_buf))
    }

    async fn drive(&mut self, socket: Framed<TcpStream, MessageCodec>) -> Result<()> {

        let (mut sink, mut stream) = socket.split();
        let mut ticker = time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        // Tell the peer what we have; nothing to say with no pieces.
        let own = self.ctx.picker.own_bitfield().await;
        if own.any() {
            self.send_message(&mut sink, Message::Bitfield(own)).await?;
        }

        loop {
            tokio::select! {

                msg = stream.next() => {
                    let msg = match msg {
                        Some(msg) => msg?,
                        // Remote closed the connection.
                        None => return Ok(()),
                    };
                    self.last_message_in = Instant::now();
                    self.handle_msg(&mut sink, msg).await?;
                }

                Some(cmd) = self.peer_rx.recv() => {
                    match cmd {

                        PeerCommand::BlockRead(block) => self.send_block(&mut sink, block).await?,

                        PeerCommand::PieceWritten(idx) => self.handle_written_piece(&mut sink, idx).await?,

                        PeerCommand::BlockArrived(block) => {
                            // Endgame: someone else delivered it first.
                            if self.requests_out.remove(&block).is_some() {
                                self.send_message(&mut sink, Message::Cancel(block)).await?;
                            }
                        }

                        PeerCommand::Choke(choke) => self.set_choking(&mut sink, choke).await?,

                        PeerCommand::Shutdown => {
                            tracing::debug!("session shutdown");
                            // Flush cancels so the swarm can reassign
                            // our outstanding requests promptly.
                            for block in self.requests_out.keys() {
                                sink.send(Message::Cancel(*block)).await.ok();
                            }
                            return Ok(());
                        }
                    }
                }

                now = ticker.tick() => self.tick(&mut sink, now).await?,

            }
        }
    }

    #[inline]
    async fn send_message(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::trace!("send: {}", msg);
        self.last_message_out = Instant::now();
        sink.send(msg).await
    }

    async fn handle_msg(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::trace!("read: {}", msg);

        // The bitfield window closes after the first real message.
        let first = std::mem::replace(&mut self.first_message, false);

        match msg {

            Message::Bitfield(bitfield) => {
                if !first {
                    return Err(PeerError::UnexpectedBitfield);
                }
                self.handle_bitfield(sink, bitfield).await?;
            }

            Message::KeepAlive => {}

            Message::Choke => {
                if !self.state.peer_choking {
                    self.state.update(|state| state.peer_choking = true);
                    self.free_requests_out().await;
                }
            }

            Message::Unchoke => {
                if self.state.peer_choking {
                    self.state.update(|state| state.peer_choking = false);
                    self.make_requests(sink).await?;
                }
            }

            Message::Interested => {
                self.state.update(|state| state.peer_interested = true);
            }

            Message::NotInterested => {
                self.state.update(|state| state.peer_interested = false);
            }

            Message::Have { idx } => self.handle_have(sink, idx).await?,

            Message::Request(request) => self.handle_request(request).await?,

            Message::Block(block) => self.handle_block(sink, block).await?,

            Message::Cancel(block) => {
                self.requests_in.remove(&block);
            }

            // No DHT; parsed so well-behaved peers are not punished.
            Message::Port { .. } => {}

        }

        Ok(())
    }

    async fn handle_bitfield(&mut self, sink: &mut MessageSink, mut bitfield: Bitfield) -> Result<()> {
        // The wire pads to a byte boundary.
        if bitfield.len() < self.ctx.info.num_pieces as usize {
            return Err(PeerError::InvalidMessage);
        }
        bitfield.resize(self.ctx.info.num_pieces as usize, false);
        tracing::debug!(
            "peer has {}/{} pieces",
            bitfield.count_ones(),
            self.ctx.info.num_pieces
        );

        let interested = self
            .ctx
            .picker
            .piece_picker
            .write()
            .await
            .register_bitfield(&bitfield);
        self.state.update(|state| state.num_pieces = bitfield.count_ones());
        self.bitfield = bitfield;
        self.update_interest(sink, interested).await
    }

    async fn handle_have(&mut self, sink: &mut MessageSink, idx: u32) -> Result<()> {
        if idx >= self.ctx.info.num_pieces {
            return Err(PeerError::InvalidMessage);
        }
        if self.bitfield[idx as usize] {
            return Ok(());
        }
        self.bitfield.set(idx as usize, true);
        self.state.update(|state| state.num_pieces += 1);

        let interested = self
            .ctx
            .picker
            .piece_picker
            .write()
            .await
            .peer_has(idx as usize);
        self.update_interest(sink, interested).await
    }

    async fn handle_request(&mut self, request: BlockInfo) -> Result<()> {

        // While choking we simply ignore requests; slow peers may not
        // have seen the choke yet.
        if self.state.am_choking {
            tracing::debug!("request whilst choked: {:?}", request);
            return Ok(());
        }
        if request.len > BLOCK_SIZE
            || !self
                .ctx
                .info
                .block_in_bounds(request.piece_idx, request.offset, request.len)
        {
            return Err(PeerError::OutOfRangeRequest);
        }
        // Only verified pieces are ever served; the peer learned what
        // we have from our bitfield and have messages.
        if !self
            .ctx
            .picker
            .piece_picker
            .read()
            .await
            .own_bitfield()[request.piece_idx]
        {
            tracing::warn!("request for unverified piece: {:?}", request);
            return Err(PeerError::OutOfRangeRequest);
        }
        if self.requests_in.contains(&request) {
            tracing::debug!("duplicate request: {:?}", request);
            return Ok(());
        }
        if self.requests_in.len() >= MAX_INBOUND_REQUESTS {
            return Err(PeerError::TooManyRequests);
        }

        self.requests_in.insert(request);
        self.ctx.disk_tx.send(DiskCommand::ReadBlock {
            id: self.ctx.id,
            block: request,
            tx: self.peer_tx.clone(),
        })?;
        Ok(())
    }

    async fn handle_block(&mut self, sink: &mut MessageSink, block: Block) -> Result<()> {

        let info = block.info();
        if self.requests_out.remove(&info).is_none() {
            tracing::debug!("unsolicited block: {:?}", info);
            return Ok(());
        }

        // Download tokens, global bucket first.
        self.ctx.global_rate.down.acquire_all(info.len).await;
        self.ctx.torrent_rate.down.acquire_all(info.len).await;

        match self.ctx.picker.received_block(&info).await {

            Some(Receipt::First { duplicates }) => {
                if duplicates {
                    // Cancel the endgame copies held by other peers.
                    self.ctx.torrent_tx.send(CommandToTorrent::EndgameBlock {
                        block: info,
                        from: self.address,
                    })?;
                }
                self.state
                    .update(|state| state.throughput.down += info.len as u64);
                self.ctx
                    .counters
                    .downloaded
                    .fetch_add(info.len as u64, Ordering::AcqRel);
                self.ctx.disk_tx.send(DiskCommand::WriteBlock {
                    id: self.ctx.id,
                    block,
                    from: self.address,
                })?;
            }

            Some(Receipt::Duplicate) => {
                tracing::trace!("duplicate block: {:?}", info);
            }

            // The piece already verified; an endgame straggler.
            None => tracing::trace!("block for retired piece: {:?}", info),
        }

        self.make_requests(sink).await
    }

    // A verified request served from disk.
    async fn send_block(&mut self, sink: &mut MessageSink, block: Block) -> Result<()> {
        let request = block.info();
        if !self.requests_in.remove(&request) {
            // Cancelled while the read was in flight.
            tracing::trace!("read for dropped request: {:?}", request);
            return Ok(());
        }

        // Upload tokens before the bytes leave.
        self.ctx.global_rate.up.acquire_all(request.len).await;
        self.ctx.torrent_rate.up.acquire_all(request.len).await;

        self.send_message(sink, Message::Block(block)).await?;
        self.state
            .update(|state| state.throughput.up += request.len as u64);
        self.ctx
            .counters
            .uploaded
            .fetch_add(request.len as u64, Ordering::AcqRel);
        Ok(())
    }

    // We verified a piece: advertise it, or cancel our own outstanding
    // requests for it if the peer beat us to the whole piece.
    async fn handle_written_piece(&mut self, sink: &mut MessageSink, idx: usize) -> Result<()> {

        if !self.bitfield[idx] {
            self.send_message(sink, Message::Have { idx: idx as u32 })
                .await?;
        }
        let stale: Vec<BlockInfo> = self
            .requests_out
            .keys()
            .filter(|block| block.piece_idx == idx)
            .copied()
            .collect();
        for block in stale {
            self.requests_out.remove(&block);
            self.send_message(sink, Message::Cancel(block)).await?;
        }
        Ok(())
    }

    async fn set_choking(&mut self, sink: &mut MessageSink, choke: bool) -> Result<()> {
        if self.state.am_choking == choke {
            return Ok(());
        }
        self.state.update(|state| state.am_choking = choke);
        if choke {
            // Queued requests die with the unchoke.
            self.requests_in.clear();
            self.send_message(sink, Message::Choke).await
        } else {
            self.send_message(sink, Message::Unchoke).await
        }
    }

    // Keep the request pipeline full: refill once it falls under half
    // of the per-peer cap.
    async fn make_requests(&mut self, sink: &mut MessageSink) -> Result<()> {

        if self.state.peer_choking || !self.state.am_interested {
            return Ok(());
        }
        // Paused torrents serve but do not request.
        if self.ctx.paused.load(Ordering::Acquire) {
            return Ok(());
        }
        let target = self.ctx.limits.max_requests_per_peer();
        if !self.requests_out.is_empty() && self.requests_out.len() * 2 >= target {
            return Ok(());
        }

        let current: HashSet<BlockInfo> = self.requests_out.keys().copied().collect();
        let blocks = self
            .ctx
            .picker
            .pick_blocks(&current, target, &self.bitfield)
            .await;

        let now = Instant::now();
        for block in blocks {
            tracing::trace!("requesting {:?}", block);
            self.requests_out.insert(block, now);
            self.send_message(sink, Message::Request(block)).await?;
        }
        Ok(())
    }

    // Return all in-flight requests to the pool (peer choked us).
    async fn free_requests_out(&mut self) {
        tracing::debug!("freeing {} requested blocks", self.requests_out.len());
        for (block, _) in self.requests_out.drain() {
            self.ctx.picker.free_block(&block).await;
        }
    }

    async fn update_interest(&mut self, sink: &mut MessageSink, interested: bool) -> Result<()> {
        if !self.state.am_interested && interested {
            self.state.update(|state| state.am_interested = true);
            self.send_message(sink, Message::Interested).await?;
            if !self.state.peer_choking {
                self.make_requests(sink).await?;
            }
        } else if self.state.am_interested && !interested {
            self.state.update(|state| state.am_interested = false);
            self.send_message(sink, Message::NotInterested).await?;
        }
        Ok(())
    }

    async fn tick(&mut self, sink: &mut MessageSink, now: Instant) -> Result<()> {

        if now.duration_since(self.last_message_in) >= IDLE_TIMEOUT {
            return Err(PeerError::Idle);
        }
        if now.duration_since(self.last_message_out) >= KEEP_ALIVE_INTERVAL {
            self.send_message(sink, Message::KeepAlive).await?;
        }

        // Expire requests the peer has sat on; they go back to the
        // pool and the peer's score drops. Slow peers get a longer
        // leash rather than a hammering of reissues.
        let timeout = self.request_timeout;
        let expired: Vec<BlockInfo> = self
            .requests_out
            .iter()
            .filter(|(_, requested)| now.duration_since(**requested) >= timeout)
            .map(|(block, _)| *block)
            .collect();
        if !expired.is_empty() {
            tracing::debug!("{} requests expired", expired.len());
            for block in &expired {
                self.requests_out.remove(block);
                self.ctx.picker.free_block(block).await;
            }
            self.state
                .update(|state| state.reliability -= expired.len() as i32);
            self.request_timeout = (self.request_timeout * 2).min(MAX_REQUEST_TIMEOUT);
            self.make_requests(sink).await?;
        }

        // Fresh throughput numbers for the choker.
        self.ctx
            .torrent_tx
            .send(CommandToTorrent::PeerState {
                address: self.address,
                state: self.state,
            })
            .ok();
        self.state.changed = false;
        self.state.tick();

        Ok(())
    }

    pub(super) async fn handle_error(&mut self, e: &PeerError) {
        if e.is_protocol_violation() {
            tracing::warn!("protocol violation: {}", e);
            self.violation = true;
        }
    }

    pub(super) async fn disconnect(&mut self) {

        self.state.update(|state| state.conn_state = ConnState::Closed);

        for (block, _) in self.requests_out.drain() {
            self.ctx.picker.free_block(&block).await;
        }
        if self.bitfield.any() {
            self.ctx
                .picker
                .piece_picker
                .write()
                .await
                .unregister_bitfield(&self.bitfield);
        }

        self.ctx
            .torrent_tx
            .send(CommandToTorrent::PeerState {
                address: self.address,
                state: self.state,
            })
            .ok();
        self.ctx
            .torrent_tx
            .send(CommandToTorrent::PeerDisconnected {
                address: self.address,
                violation: self.violation,
            })
            .ok();
    }
}

// Swap the handshake codec for the message codec, keeping any bytes
// that were read beyond the handshake.
fn message_framed(
    socket: Framed<TcpStream, HandshakeCodec>,
    mut carried: bytes::BytesMut,
) -> Framed<TcpStream, MessageCodec> {
    let old = socket.into_parts();
    carried.extend_from_slice(&old.read_buf);
    let mut parts = FramedParts::new::<Message>(old.io, MessageCodec);
    parts.read_buf = carried;
    Framed::from_parts(parts)
}
