use std::{
    collections::HashMap,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
};
use futures::StreamExt;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{self, Duration},
};
use tokio_util::codec::Framed;
use crate::{
    budget::Gate,
    config::{generate_client_id, Limits, Settings},
    disk::{spawn_disk, DiskCommand, DiskTx},
    events::{self, Event, EventErrorKind, EventRx, EventTx, TorrentSnapshot},
    metainfo::MetaInfo,
    p2p::{Handshake, HandshakeCodec, InboundPeer},
    rate::RatePair,
    resume::{ResumeStore, TorrentPrefs},
    torrent::{CommandToTorrent, Torrent, TorrentParams, TorrentStatus, TorrentTx},
    ID,
};

const SETTINGS_FILE: &str = "settings.bencode";
const RESUME_DIR: &str = "resume";

const INBOUND_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub enum EngineCommand {

    Add {
        paths: Vec<PathBuf>,
        download_dir: Option<PathBuf>,
        prefs: Option<TorrentPrefs>,
        tx: oneshot::Sender<AddReport>,
    },

    Remove { ids: Vec<ID>, delete_files: bool },

    Start { ids: Vec<ID> },

    Pause { ids: Vec<ID> },

    Stop { ids: Vec<ID> },

    // Clears a torrent's Error state back to Stopped.
    Reset { ids: Vec<ID> },

    Snapshot { tx: oneshot::Sender<Vec<TorrentSnapshot>> },

    UpdateSettings(Settings),

    Shutdown { tx: oneshot::Sender<()> },

}

// Outcome of an add request, per file.
#[derive(Debug, Default)]
pub struct AddReport {

    pub added: usize,

    // Already-known torrents.
    pub skipped: usize,

    pub failed: usize,

    pub errors: Vec<(PathBuf, String)>,

}

// The host's grip on a running engine: commands in, events out.
pub struct EngineHandle {

    pub cmd_tx: mpsc::UnboundedSender<EngineCommand>,

    pub events: EventRx,

    pub handle: JoinHandle<()>,

}

impl EngineHandle {

    pub async fn add_torrents(
        &self,
        paths: Vec<PathBuf>,
        download_dir: Option<PathBuf>,
        prefs: Option<TorrentPrefs>,
    ) -> AddReport {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(EngineCommand::Add {
                paths,
                download_dir,
                prefs,
                tx,
            })
            .is_err()
        {
            return AddReport::default();
        }
        rx.await.unwrap_or_default()
    }

    pub fn start(&self, ids: Vec<ID>) {
        self.cmd_tx.send(EngineCommand::Start { ids }).ok();
    }

    pub fn pause(&self, ids: Vec<ID>) {
        self.cmd_tx.send(EngineCommand::Pause { ids }).ok();
    }

    pub fn stop(&self, ids: Vec<ID>) {
        self.cmd_tx.send(EngineCommand::Stop { ids }).ok();
    }

    pub fn reset(&self, ids: Vec<ID>) {
        self.cmd_tx.send(EngineCommand::Reset { ids }).ok();
    }

    pub fn remove(&self, ids: Vec<ID>, delete_files: bool) {
        self.cmd_tx
            .send(EngineCommand::Remove { ids, delete_files })
            .ok();
    }

    pub async fn snapshot(&self) -> Vec<TorrentSnapshot> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(EngineCommand::Snapshot { tx }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub fn update_settings(&self, settings: Settings) {
        self.cmd_tx.send(EngineCommand::UpdateSettings(settings)).ok();
    }

    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    pub async fn shutdown(self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(EngineCommand::Shutdown { tx }).is_ok() {
            rx.await.ok();
        }
        self.handle.await.ok();
    }
}

struct TorrentEntry {

    torrent_tx: TorrentTx,

    handle: JoinHandle<()>,

    name: String,

}

// Owns the fleet: global budgets, the listener, disk task, settings
// and resume persistence. One command loop, one tick per second.
pub struct Engine {

    settings: Settings,

    state_dir: PathBuf,

    client_id: ID,

    limits: Arc<Limits>,

    global_rate: Arc<RatePair>,

    half_open: Arc<Gate>,

    connections: Arc<Gate>,

    torrents: HashMap<ID, TorrentEntry>,

    resume: ResumeStore,

    events: EventTx,

    cmd_rx: mpsc::UnboundedReceiver<EngineCommand>,

    disk_tx: DiskTx,

    disk_handle: Option<JoinHandle<()>>,

    listen_address: SocketAddr,

    // Latest per-torrent status, for snapshots and peer eviction.
    statuses: HashMap<ID, TorrentStatus>,

}

impl Engine {

    // Loads settings from the state directory (or defaults) and starts
    // the engine task. Port 0 listens on an ephemeral port.
    pub fn spawn(state_dir: PathBuf, listen_port: u16) -> std::io::Result<EngineHandle> {
        let settings = Settings::load(&state_dir.join(SETTINGS_FILE))?;
        Ok(Self::spawn_with_settings(state_dir, listen_port, settings))
    }

    pub fn spawn_with_settings(
        state_dir: PathBuf,
        listen_port: u16,
        mut settings: Settings,
    ) -> EngineHandle {

        settings.clamp();
        let (events_tx, events_rx) = events::channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (disk_handle, disk_tx) = spawn_disk();

        let engine = Engine {
            limits: Arc::new(Limits::new(&settings)),
            global_rate: Arc::new(RatePair::new(settings.max_download, settings.max_upload)),
            half_open: Gate::new(settings.max_half_open),
            connections: Gate::new(settings.max_connections),
            torrents: HashMap::new(),
            resume: ResumeStore::new(state_dir.join(RESUME_DIR)),
            events: events_tx,
            cmd_rx,
            disk_tx,
            disk_handle: Some(disk_handle),
            listen_address: SocketAddr::new([0, 0, 0, 0].into(), listen_port),
            statuses: HashMap::new(),
            client_id: generate_client_id(),
            state_dir,
            settings,
        };

        let handle = tokio::spawn(engine.run());

        EngineHandle {
            cmd_tx,
            events: events_rx,
            handle,
        }
    }

    async fn run(mut self) {

        // Inbound connections go through a handshake reader before
        // they are routed to a torrent by info-hash.
        let (inbound_tx, mut inbound_rx) =
            mpsc::unbounded_channel::<(TcpStream, bytes::BytesMut, Handshake, SocketAddr)>();

        let listener = match TcpListener::bind(self.listen_address).await {
            Ok(listener) => {
                if let Ok(addr) = listener.local_addr() {
                    self.listen_address = addr;
                }
                tracing::info!("listening on {}", self.listen_address);
                Some(listener)
            }
            Err(e) => {
                tracing::error!("cannot listen for peers: {}", e);
                self.events.send(Event::Error {
                    id: None,
                    kind: EventErrorKind::Network,
                    message: format!("cannot listen for peers: {}", e),
                });
                None
            }
        };

        let mut ticker = time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {

                accepted = accept(&listener) => {
                    if let Some((stream, address)) = accepted {
                        spawn_handshake_reader(stream, address, inbound_tx.clone());
                    }
                }

                Some((stream, read_buf, handshake, address)) = inbound_rx.recv() => {
                    self.route_inbound(stream, read_buf, handshake, address);
                }

                Some(cmd) = self.cmd_rx.recv() => {
                    match cmd {

                        EngineCommand::Add { paths, download_dir, prefs, tx } => {
                            let report = self.add_torrents(paths, download_dir, prefs);
                            let _ = tx.send(report);
                        }

                        EngineCommand::Remove { ids, delete_files } => self.remove(ids, delete_files),

                        EngineCommand::Start { ids } => self.relay(&ids, || CommandToTorrent::Start),

                        EngineCommand::Pause { ids } => self.relay(&ids, || CommandToTorrent::Pause),

                        EngineCommand::Stop { ids } => self.relay(&ids, || CommandToTorrent::Stop),

                        EngineCommand::Reset { ids } => self.relay(&ids, || CommandToTorrent::Reset),

                        EngineCommand::Snapshot { tx } => {
                            let _ = tx.send(self.snapshots());
                        }

                        EngineCommand::UpdateSettings(settings) => self.apply_settings(settings).await,

                        EngineCommand::Shutdown { tx } => {
                            self.shutdown().await;
                            let _ = tx.send(());
                            return;
                        }
                    }
                }

                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    fn add_torrents(
        &mut self,
        paths: Vec<PathBuf>,
        download_dir: Option<PathBuf>,
        prefs: Option<TorrentPrefs>,
    ) -> AddReport {

        let mut report = AddReport::default();
        for path in paths {

            let metainfo = match MetaInfo::load(&path) {
                Ok(metainfo) => metainfo,
                Err(e) => {
                    tracing::warn!("cannot add {:?}: {}", path, e);
                    self.events.send(Event::Error {
                        id: None,
                        kind: EventErrorKind::Metainfo,
                        message: format!("{:?}: {}", path, e),
                    });
                    report.failed += 1;
                    report.errors.push((path, e.to_string()));
                    continue;
                }
            };

            let id = metainfo.info_hash();
            if self.torrents.contains_key(&id) {
                tracing::info!("torrent {} already added", metainfo.info_hash_hex());
                report.skipped += 1;
                continue;
            }
            if let Some(date) = metainfo.creation_date_fmt() {
                tracing::debug!("torrent created {}", date);
            }

            let download_dir = download_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(&self.settings.default_download_path));

            let resume_record = self.resume.load(&id).unwrap_or_else(|e| {
                tracing::warn!("ignoring resume record for {}: {}", hex::encode(id), e);
                None
            });

            // Explicit preferences win over persisted ones.
            let mut prefs = prefs
                .clone()
                .or_else(|| resume_record.as_ref().map(|r| r.prefs.clone()))
                .unwrap_or_default();
            prefs.download_dir = download_dir.display().to_string();
            if !self.settings.auto_start_on_add {
                prefs.paused = true;
            }

            if self.settings.copy_torrent_file {
                copy_torrent_file(&path, &download_dir);
            }

            let name = metainfo.name().to_string();
            let handle = Torrent::spawn(TorrentParams {
                metainfo,
                client_id: self.client_id,
                listen_address: self.listen_address,
                download_dir,
                prefs,
                settings: self.settings.clone(),
                limits: Arc::clone(&self.limits),
                global_rate: Arc::clone(&self.global_rate),
                half_open: Arc::clone(&self.half_open),
                connections: Arc::clone(&self.connections),
                disk_tx: self.disk_tx.clone(),
                events: self.events.clone(),
                resume: self.resume.clone(),
                resume_record,
            });

            self.events.send(Event::TorrentAdded {
                id,
                name: name.clone(),
            });
            self.torrents.insert(
                id,
                TorrentEntry {
                    torrent_tx: handle.torrent_tx,
                    handle: handle.handle,
                    name,
                },
            );
            report.added += 1;
        }

        report
    }

    fn remove(&mut self, ids: Vec<ID>, delete_files: bool) {
        for id in ids {
            let Some(entry) = self.torrents.remove(&id) else {
                tracing::warn!("cannot remove unknown torrent {}", hex::encode(id));
                continue;
            };
            tracing::info!("removing torrent {}", entry.name);
            entry.torrent_tx.send(CommandToTorrent::Shutdown).ok();
            let disk_tx = self.disk_tx.clone();
            tokio::spawn(async move {
                entry.handle.await.ok();
                disk_tx
                    .send(DiskCommand::RemoveTorrent { id, delete_files })
                    .ok();
            });
            if let Err(e) = self.resume.remove(&id) {
                tracing::warn!("cannot remove resume record: {}", e);
            }
            self.statuses.remove(&id);
        }
    }

    fn relay(&self, ids: &[ID], cmd: impl Fn() -> CommandToTorrent) {
        for id in ids {
            match self.torrents.get(id) {
                Some(entry) => {
                    entry.torrent_tx.send(cmd()).ok();
                }
                None => tracing::warn!("unknown torrent {}", hex::encode(id)),
            }
        }
    }

    // Live settings application: caps shrink or grow on the next
    // scheduling tick of whoever reads them.
    async fn apply_settings(&mut self, mut settings: Settings) {

        settings.clamp();
        self.limits.apply(&settings);
        self.half_open.set_max(settings.max_half_open);
        self.connections.set_max(settings.max_connections);
        self.global_rate.down.set_rate(settings.max_download).await;
        self.global_rate.up.set_rate(settings.max_upload).await;

        if let Err(e) = settings.save(&self.state_dir.join(SETTINGS_FILE)) {
            tracing::error!("cannot persist settings: {}", e);
        }
        self.settings = settings;
    }

    fn snapshots(&self) -> Vec<TorrentSnapshot> {
        self.statuses
            .values()
            .map(|status| status.snapshot.clone())
            .collect()
    }

    async fn tick(&mut self) {

        // Refresh per-torrent statuses; a torrent that does not answer
        // promptly keeps its previous entry.
        for (id, entry) in self.torrents.iter() {
            let (tx, rx) = oneshot::channel();
            if entry
                .torrent_tx
                .send(CommandToTorrent::Status { tx })
                .is_err()
            {
                continue;
            }
            match time::timeout(Duration::from_millis(100), rx).await {
                Ok(Ok(status)) => {
                    self.statuses.insert(*id, status);
                }
                _ => {}
            }
        }

        if !self.torrents.is_empty() {
            self.events.send(Event::ProgressTick {
                torrents: self.snapshots(),
            });
        }
    }

    // An inbound handshake either matches a torrent or the connection
    // dies here.
    fn route_inbound(
        &mut self,
        stream: TcpStream,
        read_buf: bytes::BytesMut,
        handshake: Handshake,
        address: SocketAddr,
    ) {

        let Some(entry) = self.torrents.get(&handshake.info_hash) else {
            tracing::debug!(
                "dropping inbound peer {} with unknown info-hash {}",
                address,
                hex::encode(handshake.info_hash)
            );
            return;
        };

        // At the connection cap the slowest established peer makes
        // room for the newcomer.
        if self.connections.is_full() {
            if let Some((victim_id, victim)) = self
                .statuses
                .iter()
                .filter_map(|(id, status)| status.slowest_peer.map(|peer| (*id, peer)))
                .min_by_key(|(_, (_, rate))| *rate)
                .map(|(id, (address, _))| (id, address))
            {
                tracing::info!("evicting slowest peer {} to admit {}", victim, address);
                if let Some(victim_entry) = self.torrents.get(&victim_id) {
                    victim_entry
                        .torrent_tx
                        .send(CommandToTorrent::DropPeer(victim))
                        .ok();
                }
            } else {
                tracing::debug!("connection budget full, rejecting {}", address);
                return;
            }
        }

        entry
            .torrent_tx
            .send(CommandToTorrent::InboundPeer {
                peer: InboundPeer {
                    stream,
                    read_buf,
                    remote_id: handshake.peer_id,
                },
                address,
            })
            .ok();
    }

    async fn shutdown(&mut self) {

        tracing::info!("engine shutting down");
        for entry in self.torrents.values() {
            entry.torrent_tx.send(CommandToTorrent::Shutdown).ok();
        }
        for (_, entry) in self.torrents.drain() {
            entry.handle.await.ok();
        }

        self.disk_tx.send(DiskCommand::Shutdown).ok();
        if let Some(handle) = self.disk_handle.take() {
            handle.await.ok();
        }

        if let Err(e) = self.settings.save(&self.state_dir.join(SETTINGS_FILE)) {
            tracing::error!("cannot persist settings: {}", e);
        }
    }
}

async fn accept(listener: &Option<TcpListener>) -> Option<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => match listener.accept().await {
            Ok(accepted) => Some(accepted),
            Err(e) => {
                tracing::warn!("inbound connection error: {}", e);
                None
            }
        },
        // No listener; never resolves so the select loop ignores it.
        None => std::future::pending().await,
    }
}

// Reads the 68-byte handshake off a fresh inbound connection, keeping
// any extra buffered bytes for the session's message codec.
fn spawn_handshake_reader(
    stream: TcpStream,
    address: SocketAddr,
    inbound_tx: mpsc::UnboundedSender<(TcpStream, bytes::BytesMut, Handshake, SocketAddr)>,
) {
    tokio::spawn(async move {
        let mut socket = Framed::new(stream, HandshakeCodec);
        let handshake = match time::timeout(INBOUND_HANDSHAKE_TIMEOUT, socket.next()).await {
            Ok(Some(Ok(handshake))) => handshake,
            Ok(Some(Err(e))) => {
                tracing::debug!("bad inbound handshake from {}: {}", address, e);
                return;
            }
            Ok(None) | Err(_) => {
                tracing::debug!("inbound peer {} sent no handshake", address);
                return;
            }
        };
        let parts = socket.into_parts();
        inbound_tx
            .send((parts.io, parts.read_buf, handshake, address))
            .ok();
    });
}

fn copy_torrent_file(path: &std::path::Path, download_dir: &std::path::Path) {
    let Some(file_name) = path.file_name() else {
        return;
    };
    let target = download_dir.join(file_name);
    if target == path {
        return;
    }
    if let Err(e) = std::fs::create_dir_all(download_dir)
        .and_then(|_| std::fs::copy(path, &target).map(|_| ()))
    {
        tracing::warn!("cannot copy torrent file to {:?}: {}", target, e);
    }
}
