//! The node state machine.
//!
//! [`Node`] owns every piece of protocol state - peers, rumor logs,
//! routing, archives, the in-flight download, the active search, and the
//! DHT overlay - and advances it from three inputs: inbound datagrams,
//! timer deadlines, and user commands. It never touches the network
//! itself; outbound packets accumulate in an outbox and user-facing
//! notifications in an event queue, both drained by the runtime after
//! every input. One input runs to completion before the next is looked
//! at, so no lock exists anywhere in the crate.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::Rng;
use tracing::{debug, info, warn};

use murmur_core::{
    sha1_digest, OriginId, Peer, ShaDigest, ANTI_ENTROPY_SECS, DEFAULT_BUDGET, DEFAULT_HOP_LIMIT,
    DEFAULT_RING_SPOTS, MAX_BUDGET, MONGER_TIMEOUT_SECS, RETRANSMIT_SECS, ROUTE_RUMOR_SECS,
    SEARCH_EXPAND_SECS, SEARCH_RESULT_TARGET,
};
use murmur_dht::{ring::ring_hash_name, DhtStatusMap, FingerTable};
use murmur_proto::{
    Direct, DirectPayload, Membership, Packet, PacketError, Rumor, SearchMatch, SearchRequest,
    StatusVector, TransferRequest,
};
use murmur_store::{
    ArchiveKind, Download, DownloadMode, DownloadStep, FileArchive, RumorStore, SharedFile,
};

use crate::event::{Command, Event};
use crate::peers::PeerTable;
use crate::routing::RoutingTable;
use crate::search::{split_budget, ActiveSearch, FoundFile};
use crate::NodeError;

/// Static configuration of one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's origin id.
    pub origin: OriginId,
    /// The address/port the node's socket is bound to.
    pub self_peer: Peer,
    /// When set, chat traffic is not forwarded through this node.
    pub no_forward: bool,
    /// Directory downloads and DHT copies are written to.
    pub download_dir: PathBuf,
    /// Ring size for the DHT overlay (power of two).
    pub n_spots: u32,
    /// DHT storage budget in kilobytes (rounded down to a multiple of 20).
    pub dht_size_limit_kb: u64,
}

impl NodeConfig {
    /// Configuration with protocol defaults for the given identity.
    pub fn new(origin: OriginId, self_peer: Peer) -> Self {
        Self {
            origin,
            self_peer,
            no_forward: false,
            download_dir: PathBuf::from("."),
            n_spots: DEFAULT_RING_SPOTS,
            dht_size_limit_kb: murmur_core::DEFAULT_DHT_SIZE_LIMIT_KB,
        }
    }

    fn dht_limit_kb(&self) -> u64 {
        // Budget is granted in 20 KB units.
        (self.dht_size_limit_kb / 20) * 20
    }
}

/// A DHT-triggered fetch waiting for the download slot.
#[derive(Debug)]
struct PendingFetch {
    target: OriginId,
    metafile: ShaDigest,
    file_name: String,
    mode: DownloadMode,
}

/// Timer deadlines the node is waiting on.
#[derive(Debug)]
struct Timers {
    /// Outstanding mongering sends, oldest first.
    monger: VecDeque<Instant>,
    /// Pending block-request retransmission.
    retransmit: Option<Instant>,
    /// Next search budget expansion.
    search: Option<Instant>,
    /// Next unconditional status exchange.
    anti_entropy: Instant,
    /// Next periodic route rumor.
    route: Instant,
}

impl Timers {
    fn new(now: Instant) -> Self {
        Self {
            monger: VecDeque::new(),
            retransmit: None,
            search: None,
            anti_entropy: now + Duration::from_secs(ANTI_ENTROPY_SECS),
            route: now + Duration::from_secs(ROUTE_RUMOR_SECS),
        }
    }
}

/// The murmur node.
pub struct Node {
    config: NodeConfig,
    rng: StdRng,
    /// Next sequence number for rumors this node originates.
    seq_no: u32,
    /// Next sequence number for membership announcements.
    dht_seq_no: u32,
    peers: PeerTable,
    rumors: RumorStore,
    routing: RoutingTable,
    archive: FileArchive,
    download: Option<Download>,
    pending_fetches: VecDeque<PendingFetch>,
    search: Option<ActiveSearch>,
    dht_status: DhtStatusMap,
    fingers: Option<FingerTable>,
    wants_dht: bool,
    joined_dht: bool,
    timers: Timers,
    outbox: Vec<(Peer, Packet)>,
    events: Vec<Event>,
}

impl Node {
    /// Creates a node. The caller learns initial peers, then calls
    /// [`Node::broadcast_own_route`] once to announce itself.
    pub fn new(config: NodeConfig, rng: StdRng, now: Instant) -> Self {
        let mut rumors = RumorStore::new();
        rumors.register(&config.origin);
        Self {
            rng,
            seq_no: 1,
            dht_seq_no: 1,
            peers: PeerTable::new(),
            rumors,
            routing: RoutingTable::new(),
            archive: FileArchive::new(),
            download: None,
            pending_fetches: VecDeque::new(),
            search: None,
            dht_status: DhtStatusMap::new(),
            fingers: None,
            wants_dht: false,
            joined_dht: false,
            timers: Timers::new(now),
            outbox: Vec::new(),
            events: Vec::new(),
            config,
        }
    }

    /// This node's origin id.
    pub fn origin(&self) -> &OriginId {
        &self.config.origin
    }

    /// The known peers.
    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    /// The routing table.
    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    /// The rumor archive.
    pub fn rumors(&self) -> &RumorStore {
        &self.rumors
    }

    /// The file archive.
    pub fn archive(&self) -> &FileArchive {
        &self.archive
    }

    /// True while a download is active.
    pub fn downloading(&self) -> bool {
        self.download.is_some()
    }

    /// True once this node is a DHT member.
    pub fn joined_dht(&self) -> bool {
        self.joined_dht
    }

    /// The finger table, while DHT participation is enabled.
    pub fn fingers(&self) -> Option<&FingerTable> {
        self.fingers.as_ref()
    }

    /// Drains packets queued for the wire.
    pub fn take_outbox(&mut self) -> Vec<(Peer, Packet)> {
        std::mem::take(&mut self.outbox)
    }

    /// Drains user-facing notifications.
    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    /// Seeds a peer quietly; used to pre-populate the node's port-range
    /// neighbors before the first route broadcast.
    pub fn learn_peer(&mut self, peer: Peer) -> bool {
        self.peers.learn(peer)
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Queues a packet, applying the no-forward gate: a no-forward node
    /// still sends statuses, its own messages, and anything without chat
    /// text.
    fn send(&mut self, to: Peer, packet: Packet) {
        if self.config.no_forward {
            let allowed = match &packet {
                Packet::Status(_) => true,
                Packet::Rumor(r) => r.origin == self.config.origin || r.text.is_none(),
                Packet::Direct(d) => {
                    d.origin == self.config.origin
                        || !matches!(d.payload, DirectPayload::Chat(_))
                }
                _ => true,
            };
            if !allowed {
                debug!(to = %to, "no-forward mode suppressed chat send");
                return;
            }
        }
        self.outbox.push((to, packet));
    }

    fn send_status(&mut self, to: Peer) {
        let status = self.rumors.status();
        self.send(to, Packet::Status(status));
    }

    fn send_status_to_random(&mut self, exclude: Option<Peer>) {
        if let Some(peer) = self.peers.pick_random_excluding(exclude, &mut self.rng) {
            self.send_status(peer);
        }
    }

    /// Sends a rumor to one random peer and arms a mongering timer.
    fn monger(&mut self, rumor: Rumor, exclude: Option<Peer>, now: Instant) {
        if let Some(peer) = self.peers.pick_random_excluding(exclude, &mut self.rng) {
            debug!(peer = %peer, origin = %rumor.origin, seq = rumor.seq, "mongering rumor");
            self.send(peer, Packet::Rumor(rumor));
            self.timers
                .monger
                .push_back(now + Duration::from_secs(MONGER_TIMEOUT_SECS));
        }
    }

    fn broadcast(&mut self, packet: Packet, exclude: Option<Peer>) {
        for peer in self.peers.all().to_vec() {
            if Some(peer) != exclude {
                self.send(peer, packet.clone());
            }
        }
    }

    /// Routes a point-to-point packet toward an origin via the routing
    /// table; drops it (with a log line) when no route exists.
    fn send_routed(&mut self, dest: &OriginId, packet: Packet) {
        match self.routing.next_hop(dest) {
            Some(peer) => self.send(peer, packet),
            None => warn!(dest = %dest, "no route for packet, dropping"),
        }
    }

    // ========================================================================
    // Datagram intake
    // ========================================================================

    /// Feeds one inbound datagram through triage.
    pub fn handle_datagram(&mut self, bytes: &[u8], from: Peer, now: Instant) {
        self.peers.learn(from);

        match Packet::from_bytes(bytes) {
            Ok(Packet::Transfer(transfer)) => self.handle_transfer(transfer, now),
            Ok(Packet::Direct(direct)) => self.handle_direct(direct, from, now),
            Ok(Packet::Search(search)) => self.handle_search_request(search, from),
            Ok(Packet::Rumor(rumor)) => self.handle_rumor(rumor, from, now),
            Ok(Packet::Membership(membership)) => self.handle_membership(membership, from),
            Ok(Packet::Status(status)) => self.handle_status(status, from),
            Err(PacketError::Unrecognized) | Err(PacketError::Malformed(_)) => {
                // Unintelligible datagrams prompt the sender with our
                // status so reconciliation can recover whatever was meant.
                debug!(from = %from, "unclassifiable datagram, answering with status");
                self.send_status(from);
            }
        }
    }

    // ========================================================================
    // Gossip
    // ========================================================================

    fn handle_rumor(&mut self, rumor: Rumor, from: Peer, now: Instant) {
        self.rumors.register(&rumor.origin);
        let expected = self.rumors.next_expected(&rumor.origin);

        if rumor.seq != expected {
            // One behind with no last-hop annotation means the rumor came
            // straight from its origin; worth a routing update even though
            // the rumor itself is stale.
            if rumor.seq + 1 == expected && rumor.last_hop.is_none() {
                self.update_route(&rumor.origin, from);
            }
            debug!(
                origin = %rumor.origin,
                seq = rumor.seq,
                expected,
                "unexpected sequence, dropping rumor"
            );
            self.send_status(from);
            return;
        }

        self.update_route(&rumor.origin, from);

        // The prior hop is a peer too.
        if let Some(hop) = rumor.last_hop {
            self.peers.learn(hop);
        }

        // Archive with the last hop rewritten to the direct sender, so any
        // onward copy (monger or reconciliation) already carries it.
        let mut stored = rumor.clone();
        stored.last_hop = Some(from);
        self.rumors.accept(&stored);

        if let Some(text) = &rumor.text {
            self.events.push(Event::ChatMessage {
                origin: rumor.origin.clone(),
                text: text.clone(),
            });
        }

        // Status goes back to the sender before any onward monger step.
        self.send_status(from);

        if stored.text.is_some() {
            self.monger(stored, Some(from), now);
        } else {
            // Route rumors flood rather than monger.
            self.broadcast(Packet::Rumor(stored), Some(from));
        }
    }

    fn handle_status(&mut self, their_status: StatusVector, from: Peer) {
        // Any status frees the oldest outstanding mongering slot.
        self.timers.monger.pop_front();

        // A status can introduce origins we have never heard of.
        for origin in their_status.keys() {
            self.rumors.register(origin);
        }

        let my_status = self.rumors.status();

        // First origin where we are ahead: send the rumor they want next.
        for (origin, mine) in &my_status {
            let theirs = their_status.get(origin).copied().unwrap_or(1);
            if *mine > theirs {
                if let Some(rumor) = self.rumors.get(origin, theirs).cloned() {
                    debug!(origin = %origin, seq = theirs, peer = %from, "reconciliation send");
                    self.send(from, Packet::Rumor(rumor));
                    return;
                }
            }
        }

        // First origin where they are ahead: ask by sending our status.
        for (origin, theirs) in &their_status {
            let mine = my_status.get(origin).copied().unwrap_or(1);
            if *theirs > mine {
                self.send_status(from);
                return;
            }
        }

        // In sync: flip a coin to keep rumormongering alive.
        if self.rng.gen_bool(0.5) {
            self.send_status_to_random(Some(from));
        }
    }

    fn update_route(&mut self, origin: &OriginId, via: Peer) {
        if *origin == self.config.origin {
            return;
        }
        if self.routing.update(origin, via) {
            self.events.push(Event::NewOrigin(origin.clone()));
        }
    }

    // ========================================================================
    // Point-to-point
    // ========================================================================

    fn handle_direct(&mut self, direct: Direct, from: Peer, now: Instant) {
        if direct.dest == self.config.origin {
            self.deliver_direct(direct, from, now);
            return;
        }

        if !self.config.no_forward && direct.hop_limit > 1 {
            let mut onward = direct;
            onward.hop_limit -= 1;
            let dest = onward.dest.clone();
            self.send_routed(&dest, Packet::Direct(onward));
        }
        // Exhausted hop limits (and no-forward chat) drop silently.
    }

    fn deliver_direct(&mut self, direct: Direct, from: Peer, now: Instant) {
        match direct.payload {
            DirectPayload::Chat(text) => {
                self.events.push(Event::PrivateMessage {
                    origin: direct.origin,
                    text,
                });
            }
            DirectPayload::BlockRequest(hash) => {
                debug!(origin = %direct.origin, hash = %hash, "block request");
                match self.archive.find_block(&hash) {
                    Ok(data) if !data.is_empty() => {
                        let reply = Packet::Direct(Direct {
                            dest: direct.origin,
                            origin: self.config.origin.clone(),
                            hop_limit: DEFAULT_HOP_LIMIT,
                            payload: DirectPayload::BlockReply { hash, data },
                        });
                        // Replies return over the path the request took.
                        self.send(from, reply);
                    }
                    Ok(_) => debug!(hash = %hash, "no block found"),
                    Err(err) => warn!(hash = %hash, error = %err, "block lookup failed"),
                }
            }
            DirectPayload::BlockReply { hash, data } => {
                self.handle_block_reply(direct.origin, hash, data, now);
            }
            DirectPayload::SearchReply { query, matches } => {
                self.handle_search_reply(direct.origin, query, matches);
            }
        }
    }

    // ========================================================================
    // Download engine
    // ========================================================================

    fn handle_block_reply(&mut self, origin: OriginId, hash: ShaDigest, data: Vec<u8>, now: Instant) {
        let Some(download) = &self.download else {
            debug!("block reply with no download active");
            return;
        };

        // Wrong origin or wrong hash: not the reply we are waiting for.
        if origin != download.target || hash != download.expected {
            debug!(origin = %origin, hash = %hash, "unrequested block reply");
            return;
        }
        // Corrupt payload: drop and let the retransmit timer re-ask.
        if sha1_digest(&data) != hash {
            warn!(hash = %hash, "block reply failed hash verification");
            return;
        }

        let download = self.download.as_mut().expect("checked above");
        let first_reply = download.total_blocks() == 0;

        match download.apply_verified(&data) {
            Ok(DownloadStep::RequestNext(next)) => {
                // The metafile reveals the file's size; DHT fetches that
                // cannot fit under the budget at all are abandoned here.
                if first_reply {
                    let blocks = download.total_blocks();
                    let cost_kb = (blocks + 1) * 8;
                    let mode = download.mode;
                    if mode != DownloadMode::User && cost_kb > self.config.dht_limit_kb() {
                        warn!(
                            name = %download.logical_name,
                            cost_kb,
                            "file exceeds DHT budget, abandoning fetch"
                        );
                        self.download = None;
                        self.timers.retransmit = None;
                        self.start_next_pending_fetch(now);
                        return;
                    }
                }
                let target = self.download.as_ref().expect("still active").target.clone();
                self.send_block_request(&target, next);
                self.timers.retransmit = Some(now + Duration::from_secs(RETRANSMIT_SECS));
            }
            Ok(DownloadStep::Complete(file)) => {
                let mode = self.download.as_ref().expect("still active").mode;
                self.download = None;
                self.timers.retransmit = None;
                self.finish_download(file, mode);
                self.start_next_pending_fetch(now);
            }
            Err(err) => {
                warn!(error = %err, "download failed, abandoning");
                self.download = None;
                self.timers.retransmit = None;
                self.start_next_pending_fetch(now);
            }
        }
    }

    fn send_block_request(&mut self, target: &OriginId, hash: ShaDigest) {
        let request = Packet::Direct(Direct {
            dest: target.clone(),
            origin: self.config.origin.clone(),
            hop_limit: DEFAULT_HOP_LIMIT,
            payload: DirectPayload::BlockRequest(hash),
        });
        self.send_routed(target, request);
    }

    /// Begins a download, or queues it when the slot is busy (DHT fetches
    /// only; user downloads are rejected instead).
    fn start_fetch(
        &mut self,
        target: OriginId,
        metafile: ShaDigest,
        file_name: String,
        mode: DownloadMode,
        now: Instant,
    ) {
        if self.download.is_some() {
            debug!(name = %file_name, "download slot busy, queueing fetch");
            self.pending_fetches.push_back(PendingFetch {
                target,
                metafile,
                file_name,
                mode,
            });
            return;
        }

        info!(name = %file_name, target = %target, mode = ?mode, "starting download");
        let download = Download::new(
            target.clone(),
            metafile,
            file_name,
            mode,
            &self.config.download_dir,
        );
        self.send_block_request(&target, metafile);
        self.download = Some(download);
        self.timers.retransmit = Some(now + Duration::from_secs(RETRANSMIT_SECS));
    }

    fn start_next_pending_fetch(&mut self, now: Instant) {
        if let Some(fetch) = self.pending_fetches.pop_front() {
            self.start_fetch(fetch.target, fetch.metafile, fetch.file_name, fetch.mode, now);
        }
    }

    fn finish_download(&mut self, file: SharedFile, mode: DownloadMode) {
        info!(name = %file.name, path = %file.path.display(), "download complete");
        match mode {
            DownloadMode::User => {
                self.events.push(Event::DownloadComplete {
                    path: file.path.clone(),
                });
            }
            DownloadMode::DhtPrimaryFetch => {
                self.store_dht_file(file.clone(), ArchiveKind::DhtPrimary);
                // A primary copy begets a redundant copy one behind us.
                self.push_redundancy_of(&file);
            }
            DownloadMode::DhtRedundantFetch => {
                self.store_dht_file(file, ArchiveKind::DhtRedundant);
            }
        }
    }

    /// Inserts a fetched file into a DHT archive, evicting cold files
    /// until the budget holds.
    fn store_dht_file(&mut self, file: SharedFile, kind: ArchiveKind) {
        let evicted = self
            .archive
            .evict_for(self.config.dht_limit_kb(), file.storage_cost_kb());
        for old in evicted {
            if let Err(err) = std::fs::remove_file(&old.path) {
                warn!(path = %old.path.display(), error = %err, "failed to unlink evicted file");
            }
        }
        self.archive.insert(kind, file);
    }

    /// Sends a redundant-copy transfer of one of our primaries to the
    /// current predecessor.
    fn push_redundancy_of(&mut self, file: &SharedFile) {
        let Some(fingers) = &self.fingers else { return };
        let one_behind = fingers.one_behind().clone();
        if one_behind == self.config.origin {
            return; // singleton ring, nobody to hold the copy
        }
        let transfer = Packet::Transfer(TransferRequest {
            origin: self.config.origin.clone(),
            file_name: file.name.clone(),
            file_hash: ring_hash_name(&file.name, self.config.n_spots),
            block_list_hash: file.metafile_hash,
            redundant: Some(one_behind.clone()),
        });
        self.send_routed(&one_behind, transfer);
    }

    // ========================================================================
    // Search
    // ========================================================================

    fn handle_search_request(&mut self, search: SearchRequest, from: Peer) {
        if search.origin == self.config.origin {
            return; // our own flood came back around
        }

        if self.joined_dht {
            self.handle_dht_search(search);
            return;
        }

        // Token match against local shares, case-insensitively.
        let tokens: Vec<String> = search
            .query
            .split_whitespace()
            .map(str::to_lowercase)
            .collect();
        let matches: Vec<SearchMatch> = self
            .archive
            .files(ArchiveKind::Local)
            .filter(|file| {
                let name = file.name.to_lowercase();
                tokens.iter().any(|t| name.contains(t))
            })
            .map(|file| SearchMatch {
                name: file.name.clone(),
                metafile: file.metafile_hash,
            })
            .collect();

        debug!(query = %search.query, hits = matches.len(), "search request");
        let reply = Packet::Direct(Direct {
            dest: search.origin.clone(),
            origin: self.config.origin.clone(),
            hop_limit: DEFAULT_HOP_LIMIT,
            payload: DirectPayload::SearchReply {
                query: search.query.clone(),
                matches,
            },
        });
        self.send(from, reply);

        // Pass the remaining budget along.
        let remaining = search.budget.saturating_sub(1);
        if remaining > 0 {
            self.send_by_budget(SearchRequest {
                budget: remaining,
                ..search
            });
        }
    }

    /// DHT-mode search: the query is an exact filename routed to its owner.
    fn handle_dht_search(&mut self, search: SearchRequest) {
        let Some(fingers) = &self.fingers else { return };
        let k = ring_hash_name(&search.query, self.config.n_spots);

        let answerable =
            fingers.owns(k) || self.archive.contains(ArchiveKind::DhtRedundant, &search.query);
        if answerable {
            let matches: Vec<SearchMatch> = [ArchiveKind::DhtPrimary, ArchiveKind::DhtRedundant]
                .iter()
                .filter_map(|&kind| self.archive.get(kind, &search.query))
                .map(|file| SearchMatch {
                    name: file.name.clone(),
                    metafile: file.metafile_hash,
                })
                .collect();
            debug!(query = %search.query, hits = matches.len(), "answering DHT search");
            let reply = Packet::Direct(Direct {
                dest: search.origin.clone(),
                origin: self.config.origin.clone(),
                hop_limit: DEFAULT_HOP_LIMIT,
                payload: DirectPayload::SearchReply {
                    query: search.query.clone(),
                    matches,
                },
            });
            let dest = search.origin.clone();
            self.send_routed(&dest, reply);
            return;
        }

        // Not ours: push the request one finger closer to the owner.
        if let Some(via) = fingers.route_for(k).cloned() {
            self.send_routed(&via, Packet::Search(search));
        }
    }

    fn send_by_budget(&mut self, search: SearchRequest) {
        let shares = split_budget(search.budget, self.peers.all());
        for (peer, share) in shares {
            debug!(peer = %peer, budget = share, "search fanout");
            self.send(
                peer,
                Packet::Search(SearchRequest {
                    origin: search.origin.clone(),
                    query: search.query.clone(),
                    budget: share,
                }),
            );
        }
    }

    fn handle_search_reply(&mut self, origin: OriginId, query: String, matches: Vec<SearchMatch>) {
        let Some(search) = &mut self.search else { return };
        if query != search.query || origin == self.config.origin {
            return; // reply for a search that is no longer running
        }

        for m in matches {
            let found = FoundFile {
                metafile: m.metafile,
                holder: origin.clone(),
            };
            if search.record(&m.name, found) {
                self.events.push(Event::SearchResult {
                    file_name: m.name,
                    metafile: m.metafile,
                    holder: origin.clone(),
                });
            }
        }
    }

    fn on_search_tick(&mut self, now: Instant) {
        let Some(search) = &mut self.search else { return };

        let doubled = search.budget * 2;
        if search.results.len() < SEARCH_RESULT_TARGET && doubled <= MAX_BUDGET {
            search.budget = doubled;
            info!(query = %search.query, budget = doubled, "expanding search");
            let request = SearchRequest {
                origin: self.config.origin.clone(),
                query: search.query.clone(),
                budget: doubled,
            };
            self.send_by_budget(request);
            self.timers.search = Some(now + Duration::from_secs(SEARCH_EXPAND_SECS));
        } else {
            let results = search.results.len();
            info!(query = %search.query, results, "search finished");
            self.search = None;
            self.timers.search = None;
            self.events.push(Event::SearchFinished { results });
        }
    }

    // ========================================================================
    // DHT membership
    // ========================================================================

    fn handle_membership(&mut self, m: Membership, from: Peer) {
        let fresh = self.dht_status.apply(&m.origin, m.seq, m.wants_join);
        if !fresh {
            debug!(origin = %m.origin, seq = m.seq, "stale membership announcement");
            return;
        }
        if m.origin == self.config.origin {
            return; // our own announcement flooded back
        }

        self.update_route(&m.origin, from);

        if m.wants_join {
            self.handle_join(&m, from);
        } else {
            self.handle_leave(&m);
        }

        // Direct announcements flood onward once, marked against re-flood.
        if !m.broadcast {
            let mut onward = m;
            onward.broadcast = true;
            self.broadcast(Packet::Membership(onward), Some(from));
        }
    }

    fn handle_join(&mut self, m: &Membership, from: Peer) {
        if self.wants_dht {
            self.add_dht_member(&m.origin);
            if !self.joined_dht {
                // First contact with another member makes us a member too.
                self.joined_dht = true;
                self.events.push(Event::JoinedDht);
                let seq = self.next_dht_seq();
                let announce = Membership {
                    origin: self.config.origin.clone(),
                    seq,
                    wants_join: true,
                    broadcast: false,
                    replacement: None,
                    one_behind: None,
                };
                self.dht_status
                    .apply(&self.config.origin.clone(), seq, true);
                self.broadcast(Packet::Membership(announce), None);
            }
        }

        // A direct announcement earns the joiner a catch-up snapshot.
        if !m.broadcast {
            for (origin, seq, wants_join) in self.dht_status.snapshot() {
                if origin == m.origin {
                    continue;
                }
                self.send(
                    from,
                    Packet::Membership(Membership {
                        origin,
                        seq,
                        wants_join,
                        broadcast: true,
                        replacement: None,
                        one_behind: None,
                    }),
                );
            }
        }
    }

    fn handle_leave(&mut self, m: &Membership) {
        let Some(replacement) = &m.replacement else {
            // A plain "not joining" announcement carries no handoff.
            return;
        };
        let Some(fingers) = &mut self.fingers else { return };

        fingers.replace_member(&m.origin, replacement);

        if *replacement == self.config.origin {
            // We are the successor: inherit the leaver's predecessor and
            // re-seed redundancy for our (now larger) primary set.
            if let Some(one_behind) = &m.one_behind {
                info!(one_behind = %one_behind, "inheriting predecessor from leaver");
                fingers.set_one_behind(one_behind.clone());
            }
            let primaries: Vec<SharedFile> = self
                .archive
                .files(ArchiveKind::DhtPrimary)
                .cloned()
                .collect();
            for file in primaries {
                self.push_redundancy_of(&file);
            }
        }
    }

    fn add_dht_member(&mut self, origin: &OriginId) {
        let Some(fingers) = &mut self.fingers else { return };
        let update = fingers.add_node(origin);
        if update.successor_displaced {
            // Our redundant copies now belong to the new successor's
            // predecessor relationship; drop them.
            info!(origin = %origin, "successor displaced, clearing redundancy archive");
            for file in self.archive.clear_redundant() {
                if let Err(err) = std::fs::remove_file(&file.path) {
                    warn!(path = %file.path.display(), error = %err, "failed to unlink redundant file");
                }
            }
        }
    }

    fn next_dht_seq(&mut self) -> u32 {
        let seq = self.dht_seq_no;
        self.dht_seq_no += 1;
        seq
    }

    /// Enables or disables DHT participation (the user checkbox).
    fn set_dht_participation(&mut self, join: bool) {
        if join {
            if self.wants_dht {
                return;
            }
            self.wants_dht = true;
            self.fingers = Some(FingerTable::new(
                self.config.n_spots,
                self.config.origin.clone(),
            ));

            // Fold in everyone already known to want membership.
            let joiners: Vec<OriginId> = self.dht_status.joiners().cloned().collect();
            let had_joiners = !joiners.is_empty();
            for origin in joiners {
                self.add_dht_member(&origin);
            }
            if had_joiners && !self.joined_dht {
                self.joined_dht = true;
                self.events.push(Event::JoinedDht);
            }

            let seq = self.next_dht_seq();
            self.dht_status.apply(&self.config.origin.clone(), seq, true);
            self.broadcast(
                Packet::Membership(Membership {
                    origin: self.config.origin.clone(),
                    seq,
                    wants_join: true,
                    broadcast: false,
                    replacement: None,
                    one_behind: None,
                }),
                None,
            );
        } else {
            if !self.wants_dht {
                return;
            }
            self.leave_dht();
        }
    }

    fn leave_dht(&mut self) {
        let (replacement, one_behind) = match &self.fingers {
            Some(fingers) => (fingers.successor().clone(), fingers.one_behind().clone()),
            None => (self.config.origin.clone(), self.config.origin.clone()),
        };

        // Hand every primary to its next owner before announcing; the new
        // owner fetches the blocks from us, so the archives stay servable
        // until those fetches finish.
        if self.joined_dht && replacement != self.config.origin {
            let primaries: Vec<SharedFile> = self
                .archive
                .files(ArchiveKind::DhtPrimary)
                .cloned()
                .collect();
            for file in primaries {
                let k = ring_hash_name(&file.name, self.config.n_spots);
                let transfer = Packet::Transfer(TransferRequest {
                    origin: self.config.origin.clone(),
                    file_name: file.name.clone(),
                    file_hash: k,
                    block_list_hash: file.metafile_hash,
                    redundant: None,
                });
                let via = self
                    .fingers
                    .as_ref()
                    .and_then(|f| f.route_for(k).cloned())
                    .unwrap_or_else(|| replacement.clone());
                self.send_routed(&via, transfer);
            }
        }

        let seq = self.next_dht_seq();
        self.dht_status.apply(&self.config.origin.clone(), seq, false);
        self.broadcast(
            Packet::Membership(Membership {
                origin: self.config.origin.clone(),
                seq,
                wants_join: false,
                broadcast: false,
                replacement: Some(replacement),
                one_behind: Some(one_behind),
            }),
            None,
        );

        self.wants_dht = false;
        self.joined_dht = false;
        // The table is kept for routing only: handoff transfers that
        // bounce back before peers hear the announcement still need a way
        // forward, and our blocks stay servable for the new owners'
        // fetches. A re-join rebuilds it from scratch.
        self.events.push(Event::LeftDht);
    }

    // ========================================================================
    // DHT file placement
    // ========================================================================

    fn handle_transfer(&mut self, transfer: TransferRequest, now: Instant) {
        let Some(fingers) = &self.fingers else {
            debug!(name = %transfer.file_name, "transfer request while not participating");
            return;
        };

        if let Some(redundant_for) = &transfer.redundant {
            if *redundant_for == self.config.origin {
                if transfer.origin == self.config.origin {
                    return; // our own copy, nothing to fetch
                }
                // We hold the copy: pull the contents from the sender.
                self.start_fetch(
                    transfer.origin,
                    transfer.block_list_hash,
                    transfer.file_name,
                    DownloadMode::DhtRedundantFetch,
                    now,
                );
            } else {
                // In transit: keep it moving toward its holder.
                let dest = redundant_for.clone();
                self.send_routed(&dest, Packet::Transfer(transfer));
            }
            return;
        }

        // Ownership only applies to members; a node that has left keeps
        // relaying so its own handoff transfers still reach their owner.
        if self.joined_dht && fingers.owns(transfer.file_hash) {
            if transfer.origin == self.config.origin {
                return; // already ours
            }
            self.start_fetch(
                transfer.origin,
                transfer.block_list_hash,
                transfer.file_name,
                DownloadMode::DhtPrimaryFetch,
                now,
            );
        } else if let Some(via) = fingers.route_for(transfer.file_hash).cloned() {
            self.send_routed(&via, Packet::Transfer(transfer));
        }
    }

    /// Places a just-shared file onto the ring.
    fn place_shared_file(&mut self, file: &SharedFile) {
        let Some(fingers) = &self.fingers else { return };
        if !self.joined_dht {
            return;
        }
        let k = ring_hash_name(&file.name, self.config.n_spots);

        if fingers.owns(k) {
            // Ours: keep a DHT copy on disk beside the local share.
            let cost = file.storage_cost_kb();
            if cost > self.config.dht_limit_kb() {
                warn!(name = %file.name, cost_kb = cost, "file exceeds DHT budget, not placing");
                return;
            }
            let dht_path = self
                .config
                .download_dir
                .join(format!("dht_{}", file.name));
            if let Err(err) = std::fs::copy(&file.path, &dht_path) {
                warn!(name = %file.name, error = %err, "failed to copy file into DHT archive");
                return;
            }
            let mut copy = file.clone();
            copy.path = dht_path;
            self.store_dht_file(copy.clone(), ArchiveKind::DhtPrimary);
            self.push_redundancy_of(&copy);
        } else {
            let transfer = Packet::Transfer(TransferRequest {
                origin: self.config.origin.clone(),
                file_name: file.name.clone(),
                file_hash: k,
                block_list_hash: file.metafile_hash,
                redundant: None,
            });
            if let Some(via) = fingers.route_for(k).cloned() {
                self.send_routed(&via, transfer);
            }
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Applies one user command.
    pub fn handle_command(&mut self, command: Command, now: Instant) {
        match command {
            Command::SendChat(text) => self.send_chat(text, now),
            Command::SendPrivate { dest, text } => {
                if let Err(err) = self.send_private(dest, text) {
                    self.reject(err);
                }
            }
            Command::LearnPeer(peer) => {
                if self.peers.learn(peer) {
                    info!(peer = %peer, "learned peer");
                    self.broadcast_own_route();
                }
            }
            Command::ShareFile(path) => match self.share_file(&path) {
                Ok(hash) => info!(path = %path.display(), hash = %hash, "sharing file"),
                Err(err) => self.reject(err),
            },
            Command::Download {
                target,
                metafile,
                file_name,
            } => {
                if let Err(err) = self.start_user_download(target, metafile, file_name, now) {
                    self.reject(err);
                }
            }
            Command::Search(query) => self.start_search(query, now),
            Command::SetDhtParticipation(join) => self.set_dht_participation(join),
            Command::AddPeer(_) | Command::Shutdown => {
                // Resolved by the runtime before reaching the core.
            }
        }
    }

    fn reject(&mut self, err: NodeError) {
        warn!(error = %err, "command rejected");
        self.events.push(Event::Rejected {
            reason: err.to_string(),
        });
    }

    /// Originates a chat rumor and starts mongering it.
    pub fn send_chat(&mut self, text: String, now: Instant) {
        let rumor = Rumor {
            origin: self.config.origin.clone(),
            seq: self.next_seq(),
            text: Some(text),
            last_hop: None,
        };
        self.rumors.accept(&rumor);
        self.monger(rumor, None, now);
    }

    /// Sends a private message toward its destination.
    pub fn send_private(&mut self, dest: OriginId, text: String) -> Result<(), NodeError> {
        if self.routing.next_hop(&dest).is_none() {
            return Err(NodeError::UnknownTargetNode(dest));
        }
        let packet = Packet::Direct(Direct {
            dest: dest.clone(),
            origin: self.config.origin.clone(),
            hop_limit: DEFAULT_HOP_LIMIT,
            payload: DirectPayload::Chat(text),
        });
        self.send_routed(&dest, packet);
        Ok(())
    }

    /// Chunks a file into the local archive (and onto the ring when this
    /// node is a DHT member). Returns the metafile hash.
    pub fn share_file(&mut self, path: &std::path::Path) -> Result<ShaDigest, NodeError> {
        let file = SharedFile::scan(path)?;
        let hash = file.metafile_hash;
        self.archive.insert(ArchiveKind::Local, file.clone());
        self.place_shared_file(&file);
        Ok(hash)
    }

    /// Starts a user download; at most one may be active.
    pub fn start_user_download(
        &mut self,
        target: OriginId,
        metafile: ShaDigest,
        file_name: String,
        now: Instant,
    ) -> Result<(), NodeError> {
        if self.download.is_some() {
            return Err(NodeError::DownloadInProgress);
        }
        if self.routing.next_hop(&target).is_none() {
            return Err(NodeError::UnknownTargetNode(target));
        }
        // Only the final path component names the output.
        let logical = file_name
            .rsplit('/')
            .next()
            .unwrap_or(&file_name)
            .to_string();
        self.start_fetch(target, metafile, logical, DownloadMode::User, now);
        Ok(())
    }

    /// Starts an expanding-ring search at the default budget.
    pub fn start_search(&mut self, query: String, now: Instant) {
        info!(query = %query, budget = DEFAULT_BUDGET, "starting search");
        self.search = Some(ActiveSearch::new(query.clone(), DEFAULT_BUDGET));
        self.send_by_budget(SearchRequest {
            origin: self.config.origin.clone(),
            query,
            budget: DEFAULT_BUDGET,
        });
        self.timers.search = Some(now + Duration::from_secs(SEARCH_EXPAND_SECS));
    }

    /// Originates a route rumor and sends it to every known peer.
    pub fn broadcast_own_route(&mut self) {
        let rumor = Rumor {
            origin: self.config.origin.clone(),
            seq: self.next_seq(),
            text: None,
            last_hop: None,
        };
        self.rumors.accept(&rumor);
        self.broadcast(Packet::Rumor(rumor), None);
    }

    fn next_seq(&mut self) -> u32 {
        let seq = self.seq_no;
        self.seq_no += 1;
        seq
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// The earliest deadline the runtime should wake the node at.
    pub fn next_deadline(&self) -> Instant {
        let mut deadline = self.timers.anti_entropy.min(self.timers.route);
        if let Some(front) = self.timers.monger.front() {
            deadline = deadline.min(*front);
        }
        if let Some(retransmit) = self.timers.retransmit {
            deadline = deadline.min(retransmit);
        }
        if let Some(search) = self.timers.search {
            deadline = deadline.min(search);
        }
        deadline
    }

    /// Fires every timer whose deadline has passed.
    pub fn on_deadline(&mut self, now: Instant) {
        while self
            .timers
            .monger
            .front()
            .is_some_and(|deadline| *deadline <= now)
        {
            self.timers.monger.pop_front();
            self.on_monger_timeout();
        }

        if self.timers.retransmit.is_some_and(|d| d <= now) {
            self.on_retransmit(now);
        }

        if self.timers.search.is_some_and(|d| d <= now) {
            self.on_search_tick(now);
        }

        if self.timers.anti_entropy <= now {
            self.timers.anti_entropy = now + Duration::from_secs(ANTI_ENTROPY_SECS);
            self.send_status_to_random(None);
        }

        if self.timers.route <= now {
            self.timers.route = now + Duration::from_secs(ROUTE_RUMOR_SECS);
            self.broadcast_own_route();
        }
    }

    /// A mongering send went unanswered; maybe keep the rumor moving.
    fn on_monger_timeout(&mut self) {
        if self.rng.gen_bool(0.5) {
            self.send_status_to_random(None);
        }
    }

    /// Re-asks for the block the download is stuck on.
    fn on_retransmit(&mut self, now: Instant) {
        let Some(download) = &self.download else {
            self.timers.retransmit = None;
            return;
        };
        let target = download.target.clone();
        let expected = download.expected;
        debug!(target = %target, hash = %expected, "retransmitting block request");
        self.send_block_request(&target, expected);
        self.timers.retransmit = Some(now + Duration::from_secs(RETRANSMIT_SECS));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn test_node(origin: &str, port: u16) -> Node {
        test_node_at(origin, port, Instant::now())
    }

    fn test_node_at(origin: &str, port: u16, now: Instant) -> Node {
        let config = NodeConfig::new(origin.into(), Peer::localhost(port));
        Node::new(config, StdRng::seed_from_u64(1), now)
    }

    #[test]
    fn test_own_rumor_archived_on_chat() {
        let mut node = test_node("me", 40000);
        node.peers.learn(Peer::localhost(40001));
        node.send_chat("hello".into(), Instant::now());

        assert_eq!(node.rumors().next_expected(&"me".into()), 2);
        let out = node.take_outbox();
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].1, Packet::Rumor(ref r) if r.seq == 1));
    }

    #[test]
    fn test_accepted_rumor_sends_status_then_forwards() {
        let mut node = test_node("me", 40000);
        let sender = Peer::localhost(40001);
        let other = Peer::localhost(40002);
        node.peers.learn(sender);
        node.peers.learn(other);

        let rumor = Packet::Rumor(Rumor {
            origin: "them".into(),
            seq: 1,
            text: Some("yo".into()),
            last_hop: None,
        });
        node.handle_datagram(&rumor.to_vec(), sender, Instant::now());

        let out = node.take_outbox();
        // Status to the sender first, then the monger copy.
        assert!(matches!(out[0], (peer, Packet::Status(_)) if peer == sender));
        let (monger_peer, monger_packet) = &out[1];
        assert_eq!(*monger_peer, other);
        match monger_packet {
            Packet::Rumor(r) => assert_eq!(r.last_hop, Some(sender)),
            other => panic!("expected rumor, got {other:?}"),
        }

        let events = node.take_events();
        assert!(events.contains(&Event::ChatMessage {
            origin: "them".into(),
            text: "yo".into()
        }));
    }

    #[test]
    fn test_unexpected_seq_answers_with_status() {
        let mut node = test_node("me", 40000);
        let sender = Peer::localhost(40001);

        let rumor = Packet::Rumor(Rumor {
            origin: "them".into(),
            seq: 3,
            text: Some("early".into()),
            last_hop: None,
        });
        node.handle_datagram(&rumor.to_vec(), sender, Instant::now());

        assert_eq!(node.rumors().next_expected(&"them".into()), 1);
        let out = node.take_outbox();
        assert!(matches!(out[0], (peer, Packet::Status(_)) if peer == sender));
    }

    #[test]
    fn test_no_forward_gate() {
        let mut config = NodeConfig::new("me".into(), Peer::localhost(40000));
        config.no_forward = true;
        let mut node = Node::new(config, StdRng::seed_from_u64(1), Instant::now());
        node.peers.learn(Peer::localhost(40001));

        // A foreign chat rumor is not re-sent...
        node.send(
            Peer::localhost(40001),
            Packet::Rumor(Rumor {
                origin: "them".into(),
                seq: 1,
                text: Some("secret".into()),
                last_hop: None,
            }),
        );
        assert!(node.take_outbox().is_empty());

        // ...but route rumors, own rumors, and statuses are.
        node.send(
            Peer::localhost(40001),
            Packet::Rumor(Rumor {
                origin: "them".into(),
                seq: 1,
                text: None,
                last_hop: None,
            }),
        );
        node.send_status(Peer::localhost(40001));
        assert_eq!(node.take_outbox().len(), 2);
    }

    #[test]
    fn test_hop_limit_exhaustion_drops() {
        let mut node = test_node("me", 40000);
        node.peers.learn(Peer::localhost(40001));
        // Give the node a route so a forward would be possible.
        node.routing.update(&"far".into(), Peer::localhost(40001));

        let packet = Packet::Direct(Direct {
            dest: "far".into(),
            origin: "src".into(),
            hop_limit: 1,
            payload: DirectPayload::Chat("dying".into()),
        });
        node.handle_datagram(&packet.to_vec(), Peer::localhost(40002), Instant::now());
        assert!(node.take_outbox().is_empty());
    }

    #[test]
    fn test_forward_decrements_hop_limit() {
        let mut node = test_node("me", 40000);
        let hop = Peer::localhost(40001);
        node.peers.learn(hop);
        node.routing.update(&"far".into(), hop);

        let packet = Packet::Direct(Direct {
            dest: "far".into(),
            origin: "src".into(),
            hop_limit: 10,
            payload: DirectPayload::Chat("onward".into()),
        });
        node.handle_datagram(&packet.to_vec(), Peer::localhost(40002), Instant::now());

        let out = node.take_outbox();
        assert_eq!(out.len(), 1);
        match &out[0].1 {
            Packet::Direct(d) => assert_eq!(d.hop_limit, 9),
            other => panic!("expected direct, got {other:?}"),
        }
    }

    #[test]
    fn test_download_slot_is_exclusive() {
        let mut node = test_node("me", 40000);
        node.routing.update(&"them".into(), Peer::localhost(40001));
        let hash = sha1_digest(b"meta");

        node.start_user_download("them".into(), hash, "a.bin".into(), Instant::now())
            .unwrap();
        let err = node
            .start_user_download("them".into(), hash, "b.bin".into(), Instant::now())
            .unwrap_err();
        assert!(matches!(err, NodeError::DownloadInProgress));
    }

    #[test]
    fn test_download_unknown_target_rejected() {
        let mut node = test_node("me", 40000);
        let err = node
            .start_user_download(
                "stranger".into(),
                sha1_digest(b"m"),
                "x".into(),
                Instant::now(),
            )
            .unwrap_err();
        assert!(matches!(err, NodeError::UnknownTargetNode(_)));
    }

    #[test]
    fn test_monger_timeout_coin() {
        let mut node = test_node("me", 40000);
        node.peers.learn(Peer::localhost(40001));

        // Over many timeouts roughly half continue with a status.
        let mut sent = 0;
        for _ in 0..200 {
            node.on_monger_timeout();
            sent += node.take_outbox().len();
        }
        assert!((60..=140).contains(&sent), "coin flip badly skewed: {sent}");
    }

    #[test]
    fn test_deadline_bookkeeping() {
        let start = Instant::now();
        let mut node = test_node_at("me", 40000, start);
        node.peers.learn(Peer::localhost(40001));

        // Nothing armed: next deadline is the anti-entropy tick.
        assert_eq!(
            node.next_deadline(),
            start + Duration::from_secs(ANTI_ENTROPY_SECS)
        );

        // A mongered rumor arms the 2-second timer.
        node.send_chat("tick".into(), start);
        assert_eq!(
            node.next_deadline(),
            start + Duration::from_secs(MONGER_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_anti_entropy_rearms() {
        let start = Instant::now();
        let mut node = test_node_at("me", 40000, start);
        node.peers.learn(Peer::localhost(40001));

        let tick = start + Duration::from_secs(ANTI_ENTROPY_SECS);
        node.on_deadline(tick);
        let out = node.take_outbox();
        assert!(matches!(out[0].1, Packet::Status(_)));
        assert_eq!(
            node.timers.anti_entropy,
            tick + Duration::from_secs(ANTI_ENTROPY_SECS)
        );
    }
}
