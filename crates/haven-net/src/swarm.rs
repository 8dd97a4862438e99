use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use haven_shared::types::{BlockUpdate, SnodeRecord, SwarmInfo, INVALID_SWARM_ID};
use haven_shared::{Ed25519Pubkey, LegacyPubkey, UserPubkey, X25519Pubkey};

/// XOR-fold of the 64 hex chars after the 2-char network tag, 16 chars at a
/// time, each chunk read as a big-endian u64. The walk is over the *hex*
/// representation; this is wire-compatible with every deployed client.
pub fn fold_xor_u64(pk: &UserPubkey) -> u64 {
    let hex = pk.to_hex();
    let key_hex = &hex[2..];
    let mut res = 0u64;
    for start in (0..key_hex.len()).step_by(16) {
        let chunk = &key_hex[start..key_hex.len().min(start + 16)];
        res ^= u64::from_str_radix(chunk, 16).unwrap_or(0);
    }
    res
}

/// Maps a recipient pubkey onto the swarm whose id is nearest on the u64
/// ring. `INVALID_SWARM_ID` is reserved and never a candidate; ties break
/// toward the smaller swarm id.
pub fn swarm_for_pubkey(all_swarms: &[SwarmInfo], pk: &UserPubkey) -> u64 {
    let res = fold_xor_u64(pk);

    // The id space wraps just below the sentinel.
    const MAX_ID: u64 = INVALID_SWARM_ID - 1;

    let mut cur_best = INVALID_SWARM_ID;
    let mut cur_min = u64::MAX;

    // The roster is not required to be sorted; track the ring edges in the
    // same pass.
    let mut leftmost = INVALID_SWARM_ID;
    let mut rightmost = 0u64;

    for si in all_swarms {
        if si.swarm_id == INVALID_SWARM_ID {
            continue;
        }

        let dist = si.swarm_id.abs_diff(res);
        if dist < cur_min || (dist == cur_min && si.swarm_id < cur_best) {
            cur_best = si.swarm_id;
            cur_min = dist;
        }

        leftmost = leftmost.min(si.swarm_id);
        rightmost = rightmost.max(si.swarm_id);
    }

    if cur_best == INVALID_SWARM_ID {
        return INVALID_SWARM_ID;
    }

    // Wrap-around: the ring closes between the rightmost id and the
    // leftmost one going through MAX_ID.
    if res > rightmost {
        // res may sit on the sentinel itself; wrap like the id ring does.
        let dist = MAX_ID.wrapping_sub(res).wrapping_add(leftmost);
        if dist < cur_min {
            cur_best = leftmost;
        }
    } else if res < leftmost {
        let dist = res + (MAX_ID - rightmost);
        if dist < cur_min {
            cur_best = rightmost;
        }
    }

    cur_best
}

/// What changed for us between two consecutive roster snapshots.
#[derive(Debug, Default, Clone)]
pub struct SwarmEvents {
    pub our_swarm_id: u64,
    pub our_swarm_members: Vec<SnodeRecord>,
    /// Snodes that joined our swarm (excluding ourselves).
    pub new_snodes: Vec<SnodeRecord>,
    /// Swarm ids that did not exist anywhere in the previous roster.
    pub new_swarms: Vec<u64>,
    /// Our previous swarm no longer exists; its data must be pushed out.
    pub dissolved: bool,
}

impl Default for SwarmState {
    fn default() -> Self {
        Self {
            block: BlockUpdate::default(),
            our_swarm_id: INVALID_SWARM_ID,
            swarm_peers: Vec::new(),
            all_nodes: HashMap::new(),
            ed25519_index: HashMap::new(),
            x25519_index: HashMap::new(),
        }
    }
}

/// One immutable roster snapshot. Readers clone the `Arc` handle and keep
/// working against a consistent view; writers build a whole new state.
pub struct SwarmState {
    pub block: BlockUpdate,
    pub our_swarm_id: u64,
    /// Members of our swarm, excluding ourselves.
    pub swarm_peers: Vec<SnodeRecord>,
    // Every funded node (active or decommissioned) by primary identity,
    // with side indexes resolving the other key types back to it.
    all_nodes: HashMap<LegacyPubkey, SnodeRecord>,
    ed25519_index: HashMap<Ed25519Pubkey, LegacyPubkey>,
    x25519_index: HashMap<X25519Pubkey, LegacyPubkey>,
}

impl SwarmState {
    fn build(block: BlockUpdate, our_legacy: &LegacyPubkey) -> Self {
        let mut all_nodes = HashMap::new();
        for swarm in &block.swarms {
            for sn in &swarm.snodes {
                all_nodes.insert(sn.pubkey_legacy, sn.clone());
            }
        }
        for sn in &block.decommissioned {
            all_nodes.entry(sn.pubkey_legacy).or_insert_with(|| sn.clone());
        }

        let mut ed25519_index = HashMap::new();
        let mut x25519_index = HashMap::new();
        for (pk, sn) in &all_nodes {
            ed25519_index.insert(sn.pubkey_ed25519, *pk);
            x25519_index.insert(sn.pubkey_x25519, *pk);
        }

        let (our_swarm_id, swarm_peers) = block
            .swarms
            .iter()
            .find(|si| si.snodes.iter().any(|sn| &sn.pubkey_legacy == our_legacy))
            .map(|si| {
                let peers = si
                    .snodes
                    .iter()
                    .filter(|sn| &sn.pubkey_legacy != our_legacy)
                    .cloned()
                    .collect();
                (si.swarm_id, peers)
            })
            .unwrap_or((INVALID_SWARM_ID, Vec::new()));

        Self {
            block,
            our_swarm_id,
            swarm_peers,
            all_nodes,
            ed25519_index,
            x25519_index,
        }
    }

    pub fn swarms(&self) -> &[SwarmInfo] {
        &self.block.swarms
    }

    /// Full membership of our own swarm, ourselves included.
    pub fn our_swarm_members(&self) -> &[SnodeRecord] {
        self.block
            .swarms
            .iter()
            .find(|si| si.swarm_id == self.our_swarm_id)
            .map(|si| si.snodes.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_swarm_known(&self, swarm_id: u64) -> bool {
        self.block.swarms.iter().any(|si| si.swarm_id == swarm_id)
    }

    pub fn find_node(&self, pk: &LegacyPubkey) -> Option<&SnodeRecord> {
        self.all_nodes.get(pk)
    }

    pub fn find_node_by_ed25519(&self, pk: &Ed25519Pubkey) -> Option<&SnodeRecord> {
        self.ed25519_index.get(pk).and_then(|lk| self.find_node(lk))
    }

    pub fn find_node_by_x25519(&self, pk: &X25519Pubkey) -> Option<&SnodeRecord> {
        self.x25519_index.get(pk).and_then(|lk| self.find_node(lk))
    }

    pub fn swarm_id_for(&self, pk: &UserPubkey) -> u64 {
        swarm_for_pubkey(&self.block.swarms, pk)
    }

    /// The full membership of the swarm owning `pk`.
    pub fn snodes_for_pubkey(&self, pk: &UserPubkey) -> Vec<SnodeRecord> {
        let swarm_id = self.swarm_id_for(pk);
        self.block
            .swarms
            .iter()
            .find(|si| si.swarm_id == swarm_id)
            .map(|si| si.snodes.clone())
            .unwrap_or_default()
    }

    pub fn is_pubkey_for_us(&self, pk: &UserPubkey) -> bool {
        self.our_swarm_id != INVALID_SWARM_ID && self.our_swarm_id == self.swarm_id_for(pk)
    }

    /// Diff an incoming roster against this snapshot.
    pub fn derive_swarm_events(&self, new_swarms: &[SwarmInfo], us: &LegacyPubkey) -> SwarmEvents {
        let mut events = SwarmEvents {
            our_swarm_id: INVALID_SWARM_ID,
            ..Default::default()
        };

        let Some(ours) = new_swarms
            .iter()
            .find(|si| si.snodes.iter().any(|sn| &sn.pubkey_legacy == us))
        else {
            // Not in any swarm; nothing to do.
            return events;
        };

        events.our_swarm_id = ours.swarm_id;
        events.our_swarm_members = ours.snodes.clone();

        if self.our_swarm_id == INVALID_SWARM_ID {
            // First assignment; no previous membership to diff against.
            return events;
        }

        if self.our_swarm_id != ours.swarm_id {
            // Moved. If the old swarm is gone entirely we must push our
            // data out to its new owners.
            events.dissolved = !new_swarms
                .iter()
                .any(|si| si.swarm_id == self.our_swarm_id);
            return events;
        }

        // Same swarm: look for new members and for brand-new swarms.
        for sn in &ours.snodes {
            if &sn.pubkey_legacy != us && !self.swarm_peers.contains(sn) {
                events.new_snodes.push(sn.clone());
            }
        }

        for si in new_swarms {
            if !self.is_swarm_known(si.swarm_id) {
                events.new_swarms.push(si.swarm_id);
            }
        }

        events
    }
}

/// During reorgs the daemon returns `0.0.0.0`/`0` for nodes it has lost
/// contact data for; carry the previous known-good values forward.
pub fn apply_swarm_changes(incoming: &mut [SwarmInfo], previous: &SwarmState) {
    let mut updates = 0usize;
    for swarm in incoming.iter_mut() {
        for snode in swarm.snodes.iter_mut() {
            let Some(prior) = previous.find_node(&snode.pubkey_legacy) else {
                continue;
            };
            if snode.has_default_ip() && !prior.has_default_ip() {
                snode.ip = prior.ip;
                updates += 1;
            }
            if snode.port_https == 0 && prior.port_https != 0 {
                snode.port_https = prior.port_https;
                updates += 1;
            }
            if snode.port_mq == 0 && prior.port_mq != 0 {
                snode.port_mq = prior.port_mq;
                updates += 1;
            }
        }
    }
    if updates > 0 {
        debug!(updates, "Carried forward contact data the daemon dropped");
    }
}

/// Single-writer, many-readers handle to the current roster snapshot.
pub struct SwarmTracker {
    us: LegacyPubkey,
    state: RwLock<Arc<SwarmState>>,
}

impl SwarmTracker {
    pub fn new(us: LegacyPubkey) -> Self {
        Self {
            us,
            state: RwLock::new(Arc::new(SwarmState::default())),
        }
    }

    pub fn our_pubkey(&self) -> &LegacyPubkey {
        &self.us
    }

    /// The current snapshot; the returned handle stays consistent for as
    /// long as the caller holds it.
    pub fn snapshot(&self) -> Arc<SwarmState> {
        self.state.read().clone()
    }

    /// True once we have been assigned to a swarm.
    pub fn ready(&self) -> bool {
        self.snapshot().our_swarm_id != INVALID_SWARM_ID
    }

    /// Diffs, merges and atomically publishes an incoming block update.
    pub fn apply_block_update(&self, mut update: BlockUpdate) -> SwarmEvents {
        let prev = self.snapshot();

        let events = prev.derive_swarm_events(&update.swarms, &self.us);
        apply_swarm_changes(&mut update.swarms, &prev);

        if events.our_swarm_id == INVALID_SWARM_ID {
            warn!("We are not currently an active service node");
        } else if prev.our_swarm_id == INVALID_SWARM_ID {
            info!(swarm = events.our_swarm_id, "Started in swarm");
        } else if prev.our_swarm_id != events.our_swarm_id {
            info!(swarm = events.our_swarm_id, "Moved into a new swarm");
        }
        if events.dissolved {
            info!("Our previous swarm was dissolved");
        }
        for sn in &events.new_snodes {
            info!(peer = %sn.pubkey_legacy, "New snode joined our swarm");
        }
        for id in &events.new_swarms {
            debug!(swarm = id, "Detected a new swarm");
        }

        let next = Arc::new(SwarmState::build(update, &self.us));
        *self.state.write() = next;

        events
    }
}
