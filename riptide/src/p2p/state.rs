use crate::stats::ThroughputStats;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConnState {
    Connecting,
    Handshaking,
    Active,
    Closed,
}

// A closed peer is never revived; reconnection builds a fresh state.
#[derive(Debug, Clone, Copy)]
pub struct SessionState {

    pub conn_state: ConnState,

    // Whether we are serving the peer's requests.
    pub am_choking: bool,

    // Whether we want the peer's pieces.
    pub am_interested: bool,

    // Whether the peer is serving our requests.
    pub peer_choking: bool,

    pub peer_interested: bool,

    pub throughput: ThroughputStats,

    // Pieces in the peer's bitfield.
    pub num_pieces: usize,

    // Drops when requests expire unanswered; feeds peer scoring.
    pub reliability: i32,

    pub changed: bool,

}

impl Default for SessionState {
    fn default() -> SessionState {
        SessionState {
            conn_state: ConnState::Connecting,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            throughput: ThroughputStats::default(),
            num_pieces: 0,
            reliability: 0,
            changed: false,
        }
    }
}

impl SessionState {

    pub fn tick(&mut self) {
        self.throughput.tick();
    }

    #[inline(always)]
    pub fn update(&mut self, f: impl FnOnce(&mut SessionState)) {
        f(self);
        self.changed = true;
    }
}
