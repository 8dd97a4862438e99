use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use haven_net::derive_tester_testee;
use haven_shared::types::{count_missing_data, Message, SnodeRecord};
use haven_shared::LegacyPubkey;

use crate::node::{now_ms, Node};
use crate::storage_test::evaluate_test_answer;

/// Poll cadence while the daemon is still syncing (or we have no swarm).
const SYNC_POLL: Duration = Duration::from_secs(1);
/// Steady-state poll cadence.
const STEADY_POLL: Duration = Duration::from_secs(5);

/// Polls the daemon for the authoritative roster, publishes snapshot
/// updates, reacts to swarm membership changes and drives the tester side
/// of the storage-test protocol.
pub async fn run(node: Arc<Node>) {
    let mut last_height = 0u64;
    loop {
        let steady = match tick(&node, &mut last_height).await {
            Ok(steady) => steady,
            Err(e) => {
                warn!(error = %e, "Swarm update failed");
                false
            }
        };
        tokio::time::sleep(if steady { STEADY_POLL } else { SYNC_POLL }).await;
    }
}

async fn tick(node: &Arc<Node>, last_height: &mut u64) -> Result<bool, haven_net::NetError> {
    let update = node.daemon.get_service_nodes().await?;

    let (missing, total) = count_missing_data(&update);
    let syncing = total == 0 || missing * 2 > total;
    if syncing {
        debug!(missing, total, "Daemon roster still incomplete");
    }

    let height = update.height;
    let block_hash = update.block_hash.clone();
    let new_block = height > *last_height;

    let events = node.tracker.apply_block_update(update);
    if new_block && !block_hash.is_empty() {
        node.block_hashes.lock().insert(height, block_hash.clone());
        *last_height = height;
    }

    node.store.expire(now_ms());

    if events.dissolved {
        salvage_data(node).await;
    } else if !events.new_snodes.is_empty() {
        seed_new_peers(node, &events.new_snodes).await;
    }

    if new_block && node.tracker.ready() {
        initiate_storage_test(node, height, &block_hash).await;
    }

    Ok(!syncing && node.tracker.ready())
}

/// Our old swarm is gone: every message we hold now belongs to some other
/// swarm, so push each to its new owners.
async fn salvage_data(node: &Arc<Node>) {
    let snapshot = node.tracker.snapshot();
    let us = node.identity.legacy_pubkey();

    let mut batches: HashMap<LegacyPubkey, (SnodeRecord, Vec<Message>)> = HashMap::new();
    for msg in node.store.get_all() {
        for sn in snapshot.snodes_for_pubkey(&msg.recipient) {
            if sn.pubkey_legacy == us {
                continue;
            }
            batches
                .entry(sn.pubkey_legacy)
                .or_insert_with(|| (sn.clone(), Vec::new()))
                .1
                .push(msg.clone());
        }
    }

    info!(targets = batches.len(), "Swarm dissolved; pushing data to new owners");
    for (_, (sn, batch)) in batches {
        if let Err(e) = node.peers.push_data(&sn, &batch).await {
            warn!(peer = %sn.pubkey_legacy, error = %e, "Data push failed");
        }
    }
}

/// A node that just joined our swarm starts empty; hand it everything we
/// currently hold.
async fn seed_new_peers(node: &Arc<Node>, new_snodes: &[SnodeRecord]) {
    let batch = node.store.get_all();
    if batch.is_empty() {
        return;
    }
    for sn in new_snodes {
        debug!(peer = %sn.pubkey_legacy, count = batch.len(), "Seeding new swarm member");
        if let Err(e) = node.peers.push_data(sn, &batch).await {
            warn!(peer = %sn.pubkey_legacy, error = %e, "Seeding push failed");
        }
    }
}

/// Tester side: when the block elects us, probe the testee for a message
/// we hold ourselves and record the verdict.
async fn initiate_storage_test(node: &Arc<Node>, height: u64, block_hash: &str) {
    let snapshot = node.tracker.snapshot();
    let members = snapshot.our_swarm_members();
    let Some((tester, testee)) = derive_tester_testee(block_hash, members) else {
        return;
    };
    let us = node.identity.legacy_pubkey();
    if tester != us || testee == us {
        return;
    }
    let Some(target) = snapshot.find_node(&testee).cloned() else {
        return;
    };

    let messages = node.store.get_all();
    if messages.is_empty() {
        debug!("No messages to test with");
        return;
    }
    let probe = &messages[(height as usize) % messages.len()];

    debug!(testee = %testee, height, "Initiating storage test");
    match node.peers.storage_test(&target, height, &probe.hash).await {
        Ok(answer) => {
            let status = answer
                .get("status")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("");
            if status == "wrong request" {
                // The testee disagrees about the pairing; height windows
                // may differ by a block. Not a verdict either way.
                debug!(testee = %testee, "Storage test reported wrong request");
                return;
            }
            let passed = evaluate_test_answer(&answer, &probe.data);
            node.stats.record_storage_test(now_ms(), testee, passed);
            if !passed {
                info!(testee = %testee, height, "Storage test failed");
            }
        }
        Err(e) => {
            warn!(testee = %testee, error = %e, "Storage test unreachable");
            node.stats.record_storage_test(now_ms(), testee, false);
        }
    }
}
