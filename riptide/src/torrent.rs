use std::{
    collections::HashMap,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{
    sync::{mpsc, oneshot},
    time::{self, Duration, Instant},
};
use tracing::Instrument;
use crate::{
    block::BlockInfo,
    budget::Gate,
    choker::{ChokeCandidate, Choker, CHOKE_INTERVAL},
    config::{Limits, Settings},
    disk::{AllocationError, DiskCommand, DiskTx},
    events::{Event, EventErrorKind, EventTx, TorrentSnapshot},
    metainfo::MetaInfo,
    p2p::{state::ConnState, InboundPeer, PeerCommand, PeerHandle},
    picker::Picker,
    rate::RatePair,
    resume::{ResumeRecord, ResumeStore, TorrentPrefs},
    store::StoreInfo,
    tracker::{AnnounceParams, Event as TrackerEvent, HttpOverrides, Tracker},
    Bitfield, ID,
};

// Peer targets per torrent; the global connection budget caps further.
const MIN_PEERS: usize = 5;
const MAX_PEERS: usize = 100;

// Misbehaving endpoints are not re-dialled for this long.
const PEER_BACKOFF: Duration = Duration::from_secs(5 * 60);

// Hash-failing contributors are closed after this many strikes.
const MAX_STRIKES: u32 = 3;

// Dial attempts per endpoint before we give up on it.
const RECONNECT_BUDGET: u32 = 3;

// Dirty resume state reaches disk at least this often.
const RESUME_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

// Best-effort stopped announce on the way down.
const STOP_ANNOUNCE_BUDGET: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel error: {0}")]
    Channel(String),

}

impl<T> From<mpsc::error::SendError<T>> for TorrentError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        TorrentError::Channel(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TorrentError>;
pub type TorrentTx = mpsc::UnboundedSender<CommandToTorrent>;
pub type TorrentRx = mpsc::UnboundedReceiver<CommandToTorrent>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorrentState {
    Stopped,
    CheckingFiles,
    Downloading,
    Seeding,
    Error(String),
}

impl std::fmt::Display for TorrentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TorrentState::Stopped => write!(f, "stopped"),
            TorrentState::CheckingFiles => write!(f, "checking files"),
            TorrentState::Downloading => write!(f, "downloading"),
            TorrentState::Seeding => write!(f, "seeding"),
            TorrentState::Error(reason) => write!(f, "error: {}", reason),
        }
    }
}

pub enum CommandToTorrent {

    // User operations, relayed by the engine.
    Start,
    Pause,
    Stop,
    Reset,

    // Peer task reports.
    PeerConnected { address: SocketAddr, id: ID },
    PeerDisconnected { address: SocketAddr, violation: bool },
    PeerState { address: SocketAddr, state: crate::p2p::state::SessionState },

    // Disk task reports.
    PieceWritten {
        idx: usize,
        valid: bool,
        contributors: Vec<SocketAddr>,
    },
    StorageFailure(String),

    // First copy of an endgame block arrived; cancel the others.
    EndgameBlock { block: BlockInfo, from: SocketAddr },

    // An accepted connection whose handshake matched our info-hash.
    InboundPeer { peer: InboundPeer, address: SocketAddr },

    // Engine-selected eviction when the connection budget overflows.
    DropPeer(SocketAddr),

    // Engine polling for the progress tick.
    Status { tx: oneshot::Sender<TorrentStatus> },

    Shutdown,

}

pub struct TorrentStatus {

    pub snapshot: TorrentSnapshot,

    // The engine's eviction candidate when the connection cap is hit,
    // with its combined transfer rate.
    pub slowest_peer: Option<(SocketAddr, u64)>,

}

// Monotonic per-torrent transfer totals, shared with peer tasks.
#[derive(Debug, Default)]
pub struct TransferCounters {

    pub uploaded: AtomicU64,

    pub downloaded: AtomicU64,

}

// Read-mostly state shared between the coordinator and its peer tasks.
#[derive(Debug)]
pub struct TorrentContext {

    pub id: ID,

    pub client_id: ID,

    pub picker: Picker,

    pub torrent_tx: TorrentTx,

    pub disk_tx: DiskTx,

    pub info: StoreInfo,

    pub limits: Arc<Limits>,

    pub global_rate: Arc<RatePair>,

    pub torrent_rate: Arc<RatePair>,

    pub half_open: Arc<Gate>,

    pub connections: Arc<Gate>,

    // Paused torrents keep serving but stop requesting.
    pub paused: AtomicBool,

    pub counters: TransferCounters,

    pub listen_address: SocketAddr,

}

pub struct TorrentParams {

    pub metainfo: MetaInfo,

    pub client_id: ID,

    pub listen_address: SocketAddr,

    pub download_dir: PathBuf,

    pub prefs: TorrentPrefs,

    pub settings: Settings,

    pub limits: Arc<Limits>,

    pub global_rate: Arc<RatePair>,

    pub half_open: Arc<Gate>,

    pub connections: Arc<Gate>,

    pub disk_tx: DiskTx,

    pub events: EventTx,

    pub resume: ResumeStore,

    pub resume_record: Option<ResumeRecord>,

}

pub struct TorrentHandle {

    pub torrent_tx: TorrentTx,

    pub handle: tokio::task::JoinHandle<()>,

    pub name: String,

}

pub struct Torrent {

    ctx: Arc<TorrentContext>,

    state: TorrentState,

    peers: HashMap<SocketAddr, PeerHandle>,

    // Tracker tiers; within a tier the head is the last known-good.
    trackers: Vec<Vec<Tracker>>,

    // Announced peers we have not dialled yet.
    available: Vec<SocketAddr>,

    // Endpoints we will not dial before the deadline.
    backoff: HashMap<SocketAddr, Instant>,

    strikes: HashMap<SocketAddr, u32>,

    dial_attempts: HashMap<SocketAddr, u32>,

    torrent_rx: TorrentRx,

    events: EventTx,

    resume: ResumeStore,

    resume_dirty: bool,

    last_resume_flush: Instant,

    choker: Choker,

    announced_complete: bool,

    prefs: TorrentPrefs,

    name: String,

    // Random per run, sent to trackers.
    key: u32,

    // Piece hashes, handed to the disk task at allocation.
    hashes: Vec<ID>,

    // Pending resume bitfield to verify at startup.
    resume_bitfield: Option<Bitfield>,

}

impl Torrent {

    pub fn spawn(params: TorrentParams) -> TorrentHandle {
        let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();
        let name = params.metainfo.name().to_string();
        let id = params.metainfo.info_hash();
        let mut torrent = Torrent::new(params, torrent_tx.clone(), torrent_rx);

        let handle = tokio::spawn(
            async move {
                if let Err(e) = torrent.run().await {
                    tracing::error!("torrent task ended with error: {}", e);
                }
            }
            .instrument(tracing::info_span!("torrent", id = %hex::encode(id))),
        );

        TorrentHandle {
            torrent_tx,
            handle,
            name,
        }
    }

    fn new(params: TorrentParams, torrent_tx: TorrentTx, torrent_rx: TorrentRx) -> Self {

        let metainfo = &params.metainfo;
        let info = StoreInfo::new(metainfo, params.download_dir.clone());

        let mut trackers: Vec<Vec<Tracker>> = Vec::new();
        for tier in metainfo.tracker_tiers() {
            let mut tier_trackers = Vec::new();
            for url in tier {
                let overrides = match url.host_str() {
                    Some(host) => HttpOverrides {
                        headers: params.settings.headers_for(host),
                        cookies: params.settings.cookies_for(host),
                    },
                    None => HttpOverrides::default(),
                };
                match Tracker::new(url.clone(), overrides) {
                    Ok(tracker) => tier_trackers.push(tracker),
                    Err(e) => tracing::warn!("skipping tracker {}: {}", url, e),
                }
            }
            if !tier_trackers.is_empty() {
                trackers.push(tier_trackers);
            }
        }

        // Resume counters seed the monotonic totals.
        let counters = TransferCounters::default();
        let mut resume_bitfield = None;
        if let Some(record) = &params.resume_record {
            counters
                .uploaded
                .store(record.uploaded, Ordering::Release);
            counters
                .downloaded
                .store(record.downloaded, Ordering::Release);
            let mut bf = Bitfield::from_vec(record.bitfield.clone());
            if bf.len() >= info.num_pieces as usize {
                bf.resize(info.num_pieces as usize, false);
                if bf.any() {
                    resume_bitfield = Some(bf);
                }
            }
        }

        let ctx = Arc::new(TorrentContext {
            id: metainfo.info_hash(),
            client_id: params.client_id,
            picker: Picker::new(
                info.num_pieces,
                info.piece_len,
                info.last_piece_len,
                params.limits.max_pieces_to_request(),
            ),
            torrent_tx,
            disk_tx: params.disk_tx,
            info,
            limits: params.limits,
            global_rate: params.global_rate,
            torrent_rate: Arc::new(RatePair::unlimited()),
            half_open: params.half_open,
            connections: params.connections,
            paused: AtomicBool::new(false),
            counters,
            listen_address: params.listen_address,
        });

        Torrent {
            ctx,
            state: TorrentState::Stopped,
            peers: HashMap::new(),
            trackers,
            available: Vec::new(),
            backoff: HashMap::new(),
            strikes: HashMap::new(),
            dial_attempts: HashMap::new(),
            torrent_rx,
            events: params.events,
            resume: params.resume,
            resume_dirty: false,
            last_resume_flush: Instant::now(),
            choker: Choker::default(),
            announced_complete: false,
            prefs: params.prefs,
            name: params.metainfo.name().to_string(),
            key: rand::random(),
            hashes: params.metainfo.piece_hashes(),
            resume_bitfield,
        }
    }

    async fn run(&mut self) -> Result<()> {

        self.allocate().await;

        if matches!(self.state, TorrentState::Error(_)) {
            tracing::warn!("torrent starting in error state");
        } else if !self.prefs.paused {
            self.start().await;
        }

        let mut ticker = time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let mut seconds: u64 = 0;

        loop {
            tokio::select! {

                Some(cmd) = self.torrent_rx.recv() => {
                    if self.handle_command(cmd).await? {
                        break;
                    }
                }

                now = ticker.tick() => {
                    seconds += 1;
                    self.tick(now, seconds).await;
                }
            }
        }

        Ok(())
    }

    // Hand the torrent to the disk task and fold the verified bitfield
    // into the picker. Storage failures are terminal until reset.
    async fn allocate(&mut self) {

        if self.resume_bitfield.is_some() {
            self.set_state(TorrentState::CheckingFiles);
        }

        let (tx, rx) = oneshot::channel();
        let cmd = DiskCommand::NewTorrent {
            id: self.ctx.id,
            info: self.ctx.info.clone(),
            piece_hashes: self.piece_hashes(),
            resume: self.resume_bitfield.take(),
            torrent_tx: self.ctx.torrent_tx.clone(),
            tx,
        };
        if self.ctx.disk_tx.send(cmd).is_err() {
            self.fail("disk task unavailable".to_string());
            return;
        }

        match rx.await {
            Ok(Ok(verified)) => {
                let num_verified = verified.count_ones();
                if num_verified > 0 {
                    tracing::info!("{} pieces verified from resume data", num_verified);
                }
                self.ctx
                    .picker
                    .piece_picker
                    .write()
                    .await
                    .set_own_bitfield(verified);
                self.set_state(TorrentState::Stopped);
            }
            Ok(Err(e)) => {
                let reason = match &e {
                    AllocationError::DuplicateTorrent => e.to_string(),
                    AllocationError::Io(io) => format!("allocation failed: {}", io),
                };
                self.fail(reason);
            }
            Err(_) => self.fail("disk task dropped the allocation".to_string()),
        }
    }

    fn piece_hashes(&self) -> Vec<ID> {
        self.hashes.clone()
    }

    async fn handle_command(&mut self, cmd: CommandToTorrent) -> Result<bool> {

        match cmd {

            CommandToTorrent::Start => self.start().await,

            CommandToTorrent::Pause => {
                tracing::info!("pausing");
                self.ctx.paused.store(true, Ordering::Release);
            }

            CommandToTorrent::Stop => self.stop().await,

            CommandToTorrent::Reset => {
                if matches!(self.state, TorrentState::Error(_)) {
                    self.set_state(TorrentState::Stopped);
                }
            }

            CommandToTorrent::PeerConnected { address, id } => {
                if let Some(peer) = self.peers.get_mut(&address) {
                    peer.id = Some(id);
                }
                self.dial_attempts.remove(&address);
            }

            CommandToTorrent::PeerDisconnected { address, violation } => {
                self.peers.remove(&address);
                if violation {
                    tracing::info!("backing off misbehaving peer {}", address);
                    self.backoff.insert(address, Instant::now() + PEER_BACKOFF);
                }
            }

            CommandToTorrent::PeerState { address, state } => {
                if let Some(peer) = self.peers.get_mut(&address) {
                    peer.state = state;
                }
            }

            CommandToTorrent::PieceWritten {
                idx,
                valid,
                contributors,
            } => self.handle_piece_written(idx, valid, contributors).await,

            CommandToTorrent::StorageFailure(reason) => {
                self.close_all_peers().await;
                self.fail(reason);
            }

            CommandToTorrent::EndgameBlock { block, from } => {
                for (address, peer) in self.peers.iter() {
                    if *address != from {
                        peer.peer_tx.send(PeerCommand::BlockArrived(block)).ok();
                    }
                }
            }

            CommandToTorrent::InboundPeer { peer, address } => {
                self.admit_inbound(peer, address);
            }

            CommandToTorrent::DropPeer(address) => {
                if let Some(peer) = self.peers.get(&address) {
                    tracing::info!("dropping peer {} to free a connection slot", address);
                    peer.peer_tx.send(PeerCommand::Shutdown).ok();
                }
            }

            CommandToTorrent::Status { tx } => {
                let _ = tx.send(self.status().await);
            }

            CommandToTorrent::Shutdown => {
                self.stop().await;
                return Ok(true);
            }
        }

        Ok(false)
    }

    async fn tick(&mut self, now: Instant, seconds: u64) {

        // Settings changes land on the shared limits; the picker's
        // in-progress cap follows on the next tick.
        self.ctx
            .picker
            .set_max_partial(self.ctx.limits.max_pieces_to_request());

        let active = matches!(
            self.state,
            TorrentState::Downloading | TorrentState::Seeding
        );

        if active && !self.ctx.paused.load(Ordering::Acquire) {
            self.backoff.retain(|_, deadline| *deadline > now);

            // Regular announce cadence, pulled forward when starved.
            let needs_peers =
                self.available.is_empty() && self.peers.len() < MIN_PEERS;
            let due = self
                .trackers
                .first()
                .and_then(|tier| tier.first())
                .map(|tracker| {
                    tracker.should_announce(now.into_std())
                        || (needs_peers && tracker.can_announce(now.into_std()))
                })
                .unwrap_or(false);
            if due {
                let peers = self.announce(None).await;
                self.add_available(peers);
            }

            self.connect_to_peers();
        }

        if active && seconds % CHOKE_INTERVAL.as_secs() == 0 {
            self.run_choke_round();
        }

        if self.resume_dirty
            && now.duration_since(self.last_resume_flush) >= RESUME_FLUSH_INTERVAL
        {
            self.flush_resume().await;
        }
    }

    async fn start(&mut self) {

        match self.state {
            TorrentState::Downloading | TorrentState::Seeding => {
                // Already running; just lift a pause.
                self.ctx.paused.store(false, Ordering::Release);
                return;
            }
            TorrentState::Error(_) | TorrentState::CheckingFiles => return,
            TorrentState::Stopped => {}
        }

        tracing::info!("starting");
        self.ctx.paused.store(false, Ordering::Release);
        let all = self.ctx.picker.piece_picker.read().await.all();
        if all {
            self.announced_complete = true;
            self.set_state(TorrentState::Seeding);
        } else {
            self.set_state(TorrentState::Downloading);
        }

        let peers = self.announce(Some(TrackerEvent::Started)).await;
        self.add_available(peers);
        self.connect_to_peers();
    }

    async fn stop(&mut self) {

        if matches!(self.state, TorrentState::Stopped) {
            return;
        }
        tracing::info!("stopping");

        // Best-effort stopped announce; trackers that dawdle are cut off.
        let _ = time::timeout(
            STOP_ANNOUNCE_BUDGET,
            self.announce(Some(TrackerEvent::Stopped)),
        )
        .await;

        self.close_all_peers().await;
        self.available.clear();
        self.flush_resume().await;
        if !matches!(self.state, TorrentState::Error(_)) {
            self.set_state(TorrentState::Stopped);
        }
    }

    async fn close_all_peers(&mut self) {
        tracing::info!("disconnecting {} peers", self.peers.len());
        for peer in self.peers.values() {
            peer.peer_tx.send(PeerCommand::Shutdown).ok();
        }
        for (_, mut peer) in self.peers.drain() {
            if let Some(handle) = peer.session_handle.take() {
                handle.await.ok();
            }
        }
    }

    // Try tiers in order; within a tier the first responder is
    // promoted to the head (BEP-12).
    async fn announce(&mut self, event: Option<TrackerEvent>) -> Vec<SocketAddr> {

        let params = self.announce_params(event).await;

        for tier in self.trackers.iter_mut() {
            for i in 0..tier.len() {
                match tier[i].announce(params).await {
                    Ok(peers) => {
                        tier[..=i].rotate_right(1);
                        self.resume_dirty = true;
                        return peers;
                    }
                    Err(e) => {
                        tracing::warn!("tracker {} failed: {}", tier[i].url, e);
                    }
                }
            }
        }

        if event.is_some() || !self.trackers.is_empty() {
            self.events.send(Event::Error {
                id: Some(self.ctx.id),
                kind: EventErrorKind::Tracker,
                message: "all trackers failed".to_string(),
            });
        }
        Vec::new()
    }

    async fn announce_params(&self, event: Option<TrackerEvent>) -> AnnounceParams {
        let left = self
            .ctx
            .info
            .total_len
            .saturating_sub(self.verified_bytes().await);
        AnnounceParams {
            info_hash: self.ctx.id,
            client_id: self.ctx.client_id,
            port: self.ctx.listen_address.port(),
            uploaded: self.ctx.counters.uploaded.load(Ordering::Acquire),
            downloaded: self.ctx.counters.downloaded.load(Ordering::Acquire),
            left,
            event,
            num_want: if event == Some(TrackerEvent::Stopped) {
                Some(0)
            } else {
                None
            },
            key: self.key,
        }
    }

    // Fold announced peers in, dropping ourselves, connected peers,
    // backed-off endpoints and duplicates.
    fn add_available(&mut self, peers: Vec<SocketAddr>) {
        let now = Instant::now();
        for address in peers {
            if address == self.ctx.listen_address {
                continue;
            }
            if self.peers.contains_key(&address) || self.available.contains(&address) {
                continue;
            }
            if self.backoff.get(&address).map_or(false, |deadline| *deadline > now) {
                continue;
            }
            self.available.push(address);
        }
        tracing::debug!(
            "{} candidate peers, {} connected",
            self.available.len(),
            self.peers.len()
        );
    }

    fn connect_to_peers(&mut self) {

        while self.peers.len() < MAX_PEERS && !self.ctx.connections.is_full() {
            let Some(address) = self.available.pop() else {
                break;
            };
            let attempts = self.dial_attempts.entry(address).or_insert(0);
            if *attempts >= RECONNECT_BUDGET {
                continue;
            }
            *attempts += 1;

            tracing::debug!("dialling {}", address);
            let handle = PeerHandle::start_session(address, Arc::clone(&self.ctx), None);
            self.peers.insert(address, handle);
        }
    }

    fn admit_inbound(&mut self, peer: InboundPeer, address: SocketAddr) {

        if self.peers.contains_key(&address) {
            tracing::debug!("duplicate inbound connection from {}", address);
            return;
        }
        if self
            .backoff
            .get(&address)
            .map_or(false, |deadline| *deadline > Instant::now())
        {
            tracing::debug!("rejecting backed-off peer {}", address);
            return;
        }

        let handle = PeerHandle::start_session(address, Arc::clone(&self.ctx), Some(peer));
        self.peers.insert(address, handle);
    }

    async fn handle_piece_written(
        &mut self,
        idx: usize,
        valid: bool,
        contributors: Vec<SocketAddr>,
    ) {

        if !valid {
            self.ctx.picker.piece_rejected(idx).await;
            self.events.send(Event::Error {
                id: Some(self.ctx.id),
                kind: EventErrorKind::Integrity,
                message: format!("piece {} failed verification", idx),
            });
            for address in contributors {
                let strikes = self.strikes.entry(address).or_insert(0);
                *strikes += 1;
                tracing::info!("peer {} strike {}/{}", address, strikes, MAX_STRIKES);
                if *strikes >= MAX_STRIKES {
                    if let Some(peer) = self.peers.get(&address) {
                        peer.peer_tx.send(PeerCommand::Shutdown).ok();
                    }
                    self.backoff
                        .insert(address, Instant::now() + PEER_BACKOFF);
                }
            }
            return;
        }

        self.ctx.picker.piece_verified(idx).await;
        self.resume_dirty = true;
        self.events.send(Event::PieceVerified {
            id: self.ctx.id,
            piece: idx,
        });

        for peer in self.peers.values() {
            peer.peer_tx.send(PeerCommand::PieceWritten(idx)).ok();
        }

        let missing = self.ctx.picker.missing_pieces().await;
        tracing::info!("piece {} verified, {} pieces remain", idx, missing);

        if missing == 0 {
            if !self.announced_complete {
                self.announced_complete = true;
                self.announce(Some(TrackerEvent::Completed)).await;
            }
            self.set_state(TorrentState::Seeding);
            self.flush_resume().await;
        }
    }

    fn run_choke_round(&mut self) {

        let seeding = matches!(self.state, TorrentState::Seeding);
        let candidates: Vec<ChokeCandidate> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.state.conn_state == ConnState::Active)
            .map(|(address, peer)| ChokeCandidate {
                address: *address,
                rate: if seeding {
                    peer.state.throughput.up.avg()
                } else {
                    peer.state.throughput.down.avg()
                },
                interested: peer.state.peer_interested,
            })
            .collect();
        if candidates.is_empty() {
            return;
        }

        let decision = self.choker.run_round(candidates, &mut rand::thread_rng());
        for address in &decision.unchoke {
            if let Some(peer) = self.peers.get(address) {
                peer.peer_tx.send(PeerCommand::Choke(false)).ok();
            }
        }
        for address in &decision.choke {
            if let Some(peer) = self.peers.get(address) {
                peer.peer_tx.send(PeerCommand::Choke(true)).ok();
            }
        }
    }

    async fn verified_bytes(&self) -> u64 {
        let have = self.ctx.picker.own_bitfield().await;
        let mut verified = have.count_ones() as u64 * self.ctx.info.piece_len as u64;
        let last = self.ctx.info.num_pieces as usize - 1;
        if have[last] {
            verified -= (self.ctx.info.piece_len - self.ctx.info.last_piece_len) as u64;
        }
        verified
    }

    async fn status(&self) -> TorrentStatus {

        let verified_size = self.verified_bytes().await;
        let mut download_rate = 0;
        let mut upload_rate = 0;
        let mut peers_active = 0;
        let mut slowest: Option<(SocketAddr, u64)> = None;

        for (address, peer) in self.peers.iter() {
            if peer.state.conn_state != ConnState::Active {
                continue;
            }
            peers_active += 1;
            let down = peer.state.throughput.down.avg();
            let up = peer.state.throughput.up.avg();
            download_rate += down;
            upload_rate += up;
            let rate = down + up;
            if slowest.map_or(true, |(_, slowest_rate)| rate < slowest_rate) {
                slowest = Some((*address, rate));
            }
        }

        TorrentStatus {
            snapshot: TorrentSnapshot {
                id: self.ctx.id,
                name: self.name.clone(),
                total_size: self.ctx.info.total_len,
                verified_size,
                download_rate,
                upload_rate,
                peers_active,
                peers_total: self.peers.len(),
                state: self.state.clone(),
                priority: self.prefs.priority,
            },
            slowest_peer: slowest,
        }
    }

    async fn flush_resume(&mut self) {

        let have = self.ctx.picker.own_bitfield().await;
        let record = ResumeRecord {
            info_hash: self.ctx.id.to_vec(),
            bitfield: have.as_raw_slice().to_vec(),
            uploaded: self.ctx.counters.uploaded.load(Ordering::Acquire),
            downloaded: self.ctx.counters.downloaded.load(Ordering::Acquire),
            trackers: self
                .trackers
                .iter()
                .filter_map(|tier| tier.first())
                .map(|tracker| tracker.url.to_string())
                .collect(),
            prefs: self.prefs.clone(),
        };
        if let Err(e) = self.resume.save(&record) {
            tracing::error!("failed to write resume record: {}", e);
        } else {
            self.resume_dirty = false;
            self.last_resume_flush = Instant::now();
        }
    }

    fn set_state(&mut self, state: TorrentState) {
        if self.state == state {
            return;
        }
        tracing::info!("state: {} -> {}", self.state, state);
        self.state = state.clone();
        self.events.send(Event::StateChanged {
            id: self.ctx.id,
            state,
        });
    }

    fn fail(&mut self, reason: String) {
        self.events.send(Event::Error {
            id: Some(self.ctx.id),
            kind: EventErrorKind::Storage,
            message: reason.clone(),
        });
        self.set_state(TorrentState::Error(reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use bencode::Value;
    use crate::events;

    fn sample_metainfo() -> MetaInfo {
        let mut info = BTreeMap::new();
        info.insert(b"length".to_vec(), Value::Int(40_000));
        info.insert(b"name".to_vec(), "sample.bin".into());
        info.insert(b"piece length".to_vec(), Value::Int(16_384));
        info.insert(b"pieces".to_vec(), Value::Bytes(vec![0xaa; 60]));
        let mut root = BTreeMap::new();
        root.insert(b"announce".to_vec(), "http://tracker.example/announce".into());
        root.insert(b"info".to_vec(), Value::Dict(info));
        MetaInfo::from_bytes(&bencode::encode(&Value::Dict(root))).expect("valid metainfo")
    }

    fn test_torrent(dir: &std::path::Path) -> (Torrent, events::EventRx) {
        let settings = Settings::default();
        let (events_tx, events_rx) = events::channel();
        let (disk_tx, _disk_rx) = mpsc::unbounded_channel();
        let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();
        let params = TorrentParams {
            metainfo: sample_metainfo(),
            client_id: [1; 20],
            listen_address: "127.0.0.1:6881".parse().expect("valid address"),
            download_dir: dir.to_path_buf(),
            prefs: TorrentPrefs::default(),
            limits: Arc::new(Limits::new(&settings)),
            settings,
            global_rate: Arc::new(RatePair::unlimited()),
            half_open: Gate::new(50),
            connections: Gate::new(200),
            disk_tx,
            events: events_tx,
            resume: ResumeStore::new(dir.join("resume")),
            resume_record: None,
        };
        (Torrent::new(params, torrent_tx, torrent_rx), events_rx)
    }

    #[tokio::test]
    async fn test_add_available_filters() {
        let dir = tempfile::tempdir().unwrap();
        let (mut torrent, _events) = test_torrent(dir.path());

        let own = torrent.ctx.listen_address;
        let backed_off: SocketAddr = "10.0.0.2:6881".parse().unwrap();
        torrent
            .backoff
            .insert(backed_off, Instant::now() + PEER_BACKOFF);

        let fresh: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        torrent.add_available(vec![own, backed_off, fresh, fresh]);
        assert_eq!(torrent.available, vec![fresh]);
    }

    #[tokio::test]
    async fn test_verified_bytes_accounts_for_short_last_piece() {
        let dir = tempfile::tempdir().unwrap();
        let (torrent, _events) = test_torrent(dir.path());

        // 3 pieces: 16384 + 16384 + 7232 = 40000.
        assert_eq!(torrent.verified_bytes().await, 0);
        torrent.ctx.picker.piece_verified(0).await;
        assert_eq!(torrent.verified_bytes().await, 16_384);
        torrent.ctx.picker.piece_verified(2).await;
        assert_eq!(torrent.verified_bytes().await, 16_384 + 7_232);
        torrent.ctx.picker.piece_verified(1).await;
        assert_eq!(torrent.verified_bytes().await, 40_000);
    }

    #[tokio::test]
    async fn test_three_strikes_backs_peer_off() {
        let dir = tempfile::tempdir().unwrap();
        let (mut torrent, mut events) = test_torrent(dir.path());
        let offender: SocketAddr = "10.0.0.3:6881".parse().unwrap();

        for _ in 0..MAX_STRIKES {
            torrent
                .handle_piece_written(0, false, vec![offender])
                .await;
        }
        assert!(torrent.backoff.contains_key(&offender));
        // Backed-off endpoints are not re-admitted.
        torrent.add_available(vec![offender]);
        assert!(torrent.available.is_empty());

        // Each rejection surfaced an integrity error event.
        let mut integrity_errors = 0u32;
        while let Ok(event) = events.try_recv() {
            if let Event::Error { kind, .. } = event {
                if kind == EventErrorKind::Integrity {
                    integrity_errors += 1;
                }
            }
        }
        assert_eq!(integrity_errors, MAX_STRIKES);
    }

    #[tokio::test]
    async fn test_state_change_emits_event() {
        let dir = tempfile::tempdir().unwrap();
        let (mut torrent, mut events) = test_torrent(dir.path());

        torrent.set_state(TorrentState::Downloading);
        torrent.set_state(TorrentState::Downloading);
        torrent.set_state(TorrentState::Seeding);

        let mut changes = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let Event::StateChanged { state, .. } = event {
                changes.push(state);
            }
        }
        assert_eq!(
            changes,
            vec![TorrentState::Downloading, TorrentState::Seeding]
        );
    }
}
