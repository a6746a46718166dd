//! Per-command message handlers.
//!
//! Each handler mutates peer state under the state lock, then performs
//! sends and delegate callbacks with the lock released; a handler error is
//! a protocol violation that terminates the connection. Callbacks fire on
//! the reader thread in wire order.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::chain::{locator, MerkleBlock};
use crate::error::PeerError;
use crate::peer::delegate::PeerDelegate;
use crate::peer::{unix_time, BlockAssembly, PeerStatus, PingCallback, Shared};
use crate::pow::{display_hex, Hash256};
use crate::wire::constants::{MAX_GETDATA_HASHES, SERVICES_NODE_NETWORK, TX_MAX_SIZE};
use crate::wire::message::{
    AssetReply, Command, InvType, InvVector, Message, PeerAddress, RawTx, RejectMessage,
    VersionMessage,
};
use crate::wire::payload;

/// Dispatches one decoded message.
///
/// A merkleblock awaiting transactions is terminated by any non-tx
/// message: the pending block is abandoned, the message still processes,
/// and the exchange counts as a protocol error.
pub(crate) fn handle_message(
    shared: &Shared,
    delegate: &Arc<dyn PeerDelegate>,
    message: Message,
) -> Result<(), PeerError> {
    let abandoned = if matches!(message, Message::Tx(_)) {
        false
    } else {
        let mut st = shared.state.lock().unwrap();
        match std::mem::replace(&mut st.assembly, BlockAssembly::Idle) {
            BlockAssembly::AwaitingTx { block, pending } => {
                warn!(
                    "[{}] incomplete merkleblock {}, expected {} more tx",
                    shared.log_id(),
                    display_hex(&block.sha256d_hash()),
                    pending.len()
                );
                true
            }
            BlockAssembly::Idle => false,
        }
    };

    let result = match message {
        Message::Version(version) => handle_version(shared, delegate, version),
        Message::Verack => handle_verack(shared, delegate),
        Message::Addr(entries) => handle_addr(shared, delegate, entries),
        Message::Inv(entries) => handle_inv(shared, delegate, entries),
        Message::Tx(tx) => handle_tx(shared, delegate, tx),
        Message::Headers(headers) => handle_headers(shared, delegate, headers),
        Message::GetAddr => handle_getaddr(shared),
        Message::GetData(entries) => handle_getdata(shared, delegate, entries),
        Message::NotFound(entries) => handle_notfound(shared, delegate, entries),
        Message::Ping(nonce) => handle_ping(shared, nonce),
        Message::Pong(nonce) => handle_pong(shared, nonce),
        Message::MerkleBlock(block) => handle_merkleblock(shared, delegate, block),
        Message::Reject(reject) => handle_reject(shared, delegate, reject),
        Message::FeeFilter(fee) => handle_feefilter(shared, delegate, fee),
        Message::AssetData(reply) => handle_assetdata(shared, reply),
        Message::AssetNotFound(names) => handle_asset_not_found(shared, names),
        Message::Ignored { command, length } => {
            debug!(
                "[{}] dropping {:?}, length {}, not handled",
                shared.log_id(),
                command,
                length
            );
            Ok(())
        }
    };

    if abandoned {
        result?;
        return Err(PeerError::Protocol("incomplete merkleblock"));
    }
    result
}

fn handle_version(
    shared: &Shared,
    delegate: &Arc<dyn PeerDelegate>,
    version: VersionMessage,
) -> Result<(), PeerError> {
    {
        let mut st = shared.state.lock().unwrap();
        st.version = version.version;
        st.remote_services = version.services;
        st.remote_timestamp = version.timestamp;
        st.useragent = version.user_agent;
        st.lastblock = version.start_height;
        info!(
            "[{}] got version {}, useragent: \"{}\"",
            shared.log_id(),
            st.version,
            st.useragent
        );
    }

    shared.send_verack();
    maybe_connected(shared, delegate);
    Ok(())
}

fn handle_verack(shared: &Shared, delegate: &Arc<dyn PeerDelegate>) -> Result<(), PeerError> {
    let first = {
        let mut st = shared.state.lock().unwrap();
        if st.got_verack {
            debug!("[{}] got unexpected verack", shared.log_id());
            false
        } else {
            if let Some(started) = st.start_time.take() {
                // verack round trip seeds the ping time
                st.ping_time = started.elapsed().as_secs_f64();
                debug!("[{}] got verack in {:.6}s", shared.log_id(), st.ping_time);
            }
            st.got_verack = true;
            true
        }
    };

    if first {
        maybe_connected(shared, delegate);
    }
    Ok(())
}

/// Fires the connected hook once both verack flags are set.
fn maybe_connected(shared: &Shared, delegate: &Arc<dyn PeerDelegate>) {
    let completed = {
        let mut st = shared.state.lock().unwrap();
        if st.status == PeerStatus::Connecting && st.sent_verack && st.got_verack {
            shared.disconnect_at.disable();
            st.status = PeerStatus::Connected;
            info!(
                "[{}] handshake completed, lastblock: {}",
                shared.log_id(),
                st.lastblock
            );
            true
        } else {
            false
        }
    };

    if completed {
        delegate.connected();
    }
}

fn handle_addr(
    shared: &Shared,
    delegate: &Arc<dyn PeerDelegate>,
    entries: Vec<PeerAddress>,
) -> Result<(), PeerError> {
    // anti-tarpitting: don't accept unsolicited addresses
    if !shared.state.lock().unwrap().sent_getaddr {
        debug!("[{}] ignoring unsolicited addr", shared.log_id());
        return Ok(());
    }
    if entries.len() > 1000 {
        warn!(
            "[{}] dropping addr message, {} is too many addresses, max is 1000",
            shared.log_id(),
            entries.len()
        );
        return Ok(());
    }

    info!("[{}] got addr with {} address(es)", shared.log_id(), entries.len());
    let now = unix_time();

    let peers: Vec<PeerAddress> = entries
        .into_iter()
        .filter_map(|mut peer| {
            if peer.services & SERVICES_NODE_NETWORK == 0 {
                return None; // can't serve full blocks
            }
            if !peer.is_ipv4() {
                return None;
            }
            // unknown or future-dated addresses become 5 days old, and
            // everything ages a further 2 hours before forwarding
            if peer.timestamp > now + 10 * 60 || peer.timestamp == 0 {
                peer.timestamp = now - 5 * 24 * 60 * 60;
            }
            peer.timestamp = peer.timestamp.saturating_sub(2 * 60 * 60);
            Some(peer)
        })
        .collect();

    if !peers.is_empty() {
        delegate.relayed_peers(peers);
    }
    Ok(())
}

fn handle_inv(
    shared: &Shared,
    delegate: &Arc<dyn PeerDelegate>,
    entries: Vec<InvVector>,
) -> Result<(), PeerError> {
    if entries.len() > MAX_GETDATA_HASHES {
        return Err(PeerError::Protocol("too many inv items"));
    }

    info!("[{}] got inv with {} item(s)", shared.log_id(), entries.len());

    let mut tx_hashes: Vec<Hash256> = Vec::new();
    let mut block_hashes: Vec<Hash256> = Vec::new();
    for entry in &entries {
        // inv messages only announce transactions and blocks
        match entry.inv_type() {
            Some(InvType::Tx) => tx_hashes.push(entry.hash),
            Some(InvType::Block) => block_hashes.push(entry.hash),
            _ => {}
        }
    }
    let tx_count = tx_hashes.len();

    let mut known: Vec<Hash256> = Vec::new();
    let mut request: Option<(Vec<Hash256>, Vec<Hash256>)> = None;
    let mut pipeline: Option<[Hash256; 2]> = None;
    let mut mempool_flush: Option<PingCallback> = None;

    {
        let mut st = shared.state.lock().unwrap();

        if tx_count > 0 && !st.sent_filter && !st.sent_mempool && !st.sent_getblocks {
            return Err(PeerError::Protocol("got inv message before loading a filter"));
        }
        if tx_count > 10_000 {
            return Err(PeerError::Protocol("too many transactions in inv"));
        }

        let current_height = shared
            .current_block_height
            .load(std::sync::atomic::Ordering::Acquire) as usize;
        if current_height > 0
            && block_hashes.len() > 2
            && block_hashes.len() < 500
            && current_height + st.known_block_hashes.len() + block_hashes.len()
                < st.lastblock as usize
        {
            return Err(PeerError::Protocol("non-standard inv"));
        }

        if !st.sent_filter && !st.sent_getblocks {
            block_hashes.clear();
        }
        if block_hashes.len() == 1 && st.last_block_hash == block_hashes[0] {
            block_hashes.clear();
        }
        if block_hashes.len() == 1 {
            st.last_block_hash = block_hashes[0];
        }

        // remember block hashes in case we need to re-request them with an
        // updated bloom filter
        st.known_block_hashes.extend_from_slice(&block_hashes);
        while st.known_block_hashes.len() > MAX_GETDATA_HASHES {
            let third = st.known_block_hashes.len() / 3;
            st.known_block_hashes.drain(..third);
        }

        if shared
            .needs_filter_update
            .load(std::sync::atomic::Ordering::Acquire)
        {
            block_hashes.clear();
        }

        let mut unknown: Vec<Hash256> = Vec::new();
        for hash in tx_hashes {
            if st.known_tx_set.contains(&hash) {
                known.push(hash);
            } else {
                unknown.push(hash);
            }
        }
        st.add_known_tx_hashes(&unknown);

        if !unknown.is_empty() || !block_hashes.is_empty() {
            request = Some((unknown, block_hashes.clone()));
        }

        // pipeline the next window when a full 500-hash inv arrived
        if block_hashes.len() >= 500 {
            pipeline = Some([block_hashes[block_hashes.len() - 1], block_hashes[0]]);
        }

        if tx_count > 0 && st.mempool_callback.is_some() {
            mempool_flush = st.mempool_callback.take();
            shared.mempool_at.disable();
        }
    }

    for hash in known {
        delegate.has_tx(hash);
    }
    if let Some((tx, blocks)) = request {
        shared.send_getdata(&tx, &blocks);
    }
    if let Some(locators) = pipeline {
        shared.send_getblocks(&locators, [0u8; 32]);
    }
    if let Some(callback) = mempool_flush {
        info!("[{}] got initial mempool response", shared.log_id());
        shared.send_ping(Some(callback));
    }

    Ok(())
}

fn handle_tx(
    shared: &Shared,
    delegate: &Arc<dyn PeerDelegate>,
    tx: RawTx,
) -> Result<(), PeerError> {
    {
        let st = shared.state.lock().unwrap();
        if !st.sent_filter && !st.sent_getdata {
            return Err(PeerError::Protocol("got tx message before loading a filter"));
        }
    }

    let tx_hash = tx.hash;
    debug!("[{}] got tx: {}", shared.log_id(), display_hex(&tx_hash));
    delegate.relayed_tx(tx);

    let completed = {
        let mut st = shared.state.lock().unwrap();
        let drained = match &mut st.assembly {
            BlockAssembly::AwaitingTx { pending, .. } => {
                if let Some(at) = pending.iter().rposition(|hash| *hash == tx_hash) {
                    pending.remove(at);
                }
                pending.is_empty()
            }
            BlockAssembly::Idle => false,
        };

        if drained {
            match std::mem::replace(&mut st.assembly, BlockAssembly::Idle) {
                BlockAssembly::AwaitingTx { block, .. } => Some(block),
                BlockAssembly::Idle => None,
            }
        } else {
            None
        }
    };

    if let Some(block) = completed {
        // that was the last matched tx: the merkleblock is complete
        delegate.relayed_block(block);
    }
    Ok(())
}

fn handle_headers(
    shared: &Shared,
    delegate: &Arc<dyn PeerDelegate>,
    headers: Vec<crate::chain::Header>,
) -> Result<(), PeerError> {
    info!("[{}] got {} header(s)", shared.log_id(), headers.len());

    let earliest_key_time = shared
        .earliest_key_time
        .load(std::sync::atomic::Ordering::Acquire);

    match locator::assess(&headers, shared.network, earliest_key_time, &*shared.hasher) {
        Ok(locator::NextRequest::GetBlocks { locators }) => {
            // request blocks for the remainder of the chain
            shared.send_getblocks(&locators, [0u8; 32]);
        }
        Ok(locator::NextRequest::GetHeaders { locators }) => {
            shared.send_getheaders(&locators, [0u8; 32]);
        }
        Err(locator::NonStandardHeaders) => {
            return Err(PeerError::Protocol("non-standard headers message"));
        }
    }

    let now = unix_time() as u32;
    for header in headers {
        let block = MerkleBlock::from_header(header);
        if !block.is_valid(now) {
            warn!(
                "[{}] invalid block header: {}",
                shared.log_id(),
                display_hex(&block.sha256d_hash())
            );
            return Err(PeerError::Protocol("invalid block header"));
        }
        delegate.relayed_block(block);
    }
    Ok(())
}

fn handle_getaddr(shared: &Shared) -> Result<(), PeerError> {
    debug!("[{}] got getaddr", shared.log_id());
    // we relay no addresses of our own
    shared.send_message(Command::Addr, &payload::build_empty_addr_payload());
    Ok(())
}

fn handle_getdata(
    shared: &Shared,
    delegate: &Arc<dyn PeerDelegate>,
    entries: Vec<InvVector>,
) -> Result<(), PeerError> {
    if entries.len() > MAX_GETDATA_HASHES {
        warn!(
            "[{}] dropping getdata message, {} is too many items, max is {}",
            shared.log_id(),
            entries.len(),
            MAX_GETDATA_HASHES
        );
        return Ok(());
    }

    debug!("[{}] got getdata with {} item(s)", shared.log_id(), entries.len());
    let mut notfound: Vec<InvVector> = Vec::new();

    for entry in entries {
        match entry.inv_type() {
            Some(InvType::Tx) => {
                let served = delegate
                    .requested_tx(entry.hash)
                    .filter(|tx| tx.bytes.len() < TX_MAX_SIZE);
                match served {
                    Some(tx) => {
                        info!("[{}] publishing tx: {}", shared.log_id(), display_hex(&tx.hash));
                        shared.send_message(Command::Tx, &tx.bytes);
                    }
                    None => notfound.push(entry),
                }
            }
            _ => notfound.push(entry),
        }
    }

    if !notfound.is_empty() {
        shared.send_message(Command::NotFound, &payload::build_notfound_payload(&notfound));
    }
    Ok(())
}

fn handle_notfound(
    shared: &Shared,
    delegate: &Arc<dyn PeerDelegate>,
    entries: Vec<InvVector>,
) -> Result<(), PeerError> {
    if entries.len() > MAX_GETDATA_HASHES {
        warn!(
            "[{}] dropping notfound message, {} is too many items, max is {}",
            shared.log_id(),
            entries.len(),
            MAX_GETDATA_HASHES
        );
        return Ok(());
    }

    info!("[{}] got notfound with {} item(s)", shared.log_id(), entries.len());

    let mut tx_hashes: Vec<Hash256> = Vec::new();
    let mut block_hashes: Vec<Hash256> = Vec::new();
    for entry in entries {
        match entry.inv_type() {
            Some(InvType::Tx) => tx_hashes.push(entry.hash),
            Some(InvType::Block) | Some(InvType::FilteredBlock) => block_hashes.push(entry.hash),
            _ => {}
        }
    }

    delegate.notfound(tx_hashes, block_hashes);
    Ok(())
}

fn handle_ping(shared: &Shared, nonce: u64) -> Result<(), PeerError> {
    debug!("[{}] got ping", shared.log_id());
    shared.send_message(Command::Pong, &payload::build_nonce_payload(nonce));
    Ok(())
}

fn handle_pong(shared: &Shared, nonce: u64) -> Result<(), PeerError> {
    let callback = {
        let mut st = shared.state.lock().unwrap();

        if nonce != st.nonce {
            warn!(
                "[{}] pong message has wrong nonce: {}, expected: {}",
                shared.log_id(),
                nonce,
                st.nonce
            );
            return Err(PeerError::Protocol("pong with wrong nonce"));
        }
        if st.pong_callbacks.is_empty() {
            return Err(PeerError::Protocol("got unexpected pong"));
        }

        if let Some(started) = st.start_time.take() {
            let round_trip = started.elapsed().as_secs_f64();
            // 50% low pass filter on current ping time
            st.ping_time = if st.ping_time == f64::MAX {
                round_trip
            } else {
                st.ping_time * 0.5 + round_trip * 0.5
            };
            debug!("[{}] got pong in {:.6}s", shared.log_id(), round_trip);
        } else {
            debug!("[{}] got pong", shared.log_id());
        }

        st.pong_callbacks.pop_front().flatten()
    };

    if let Some(callback) = callback {
        callback(true);
    }
    Ok(())
}

fn handle_merkleblock(
    shared: &Shared,
    delegate: &Arc<dyn PeerDelegate>,
    block: MerkleBlock,
) -> Result<(), PeerError> {
    // Raven nodes don't serve arbitrary transactions; after a merkleblock
    // the remote sends tx messages for the matched hashes, and a non-tx
    // message means the block is complete.
    if !block.is_valid(unix_time() as u32) {
        warn!(
            "[{}] invalid merkleblock: {}",
            shared.log_id(),
            display_hex(&block.sha256d_hash())
        );
        return Err(PeerError::Protocol("invalid merkleblock"));
    }

    let deliver = {
        let mut st = shared.state.lock().unwrap();
        if !st.sent_filter && !st.sent_getdata {
            return Err(PeerError::Protocol(
                "got merkleblock message before loading a filter",
            ));
        }

        let mut pending: Vec<Hash256> = block
            .tx_hashes()
            .into_iter()
            .filter(|hash| !st.known_tx_set.contains(hash))
            .collect();
        // reverse order for more efficient removal as tx arrive
        pending.reverse();

        if pending.is_empty() {
            Some(block)
        } else {
            st.assembly = BlockAssembly::AwaitingTx { block, pending };
            None
        }
    };

    if let Some(block) = deliver {
        delegate.relayed_block(block);
    }
    Ok(())
}

fn handle_reject(
    shared: &Shared,
    delegate: &Arc<dyn PeerDelegate>,
    reject: RejectMessage,
) -> Result<(), PeerError> {
    match reject.tx_hash {
        Some(tx_hash) => {
            warn!(
                "[{}] rejected {} code: {:#x} reason: \"{}\" txid: {}",
                shared.log_id(),
                reject.command,
                reject.code,
                reject.reason,
                display_hex(&tx_hash)
            );
            delegate.rejected_tx(tx_hash, reject.code);
        }
        None => {
            warn!(
                "[{}] rejected {} code: {:#x} reason: \"{}\"",
                shared.log_id(),
                reject.command,
                reject.code,
                reject.reason
            );
        }
    }
    Ok(())
}

fn handle_feefilter(
    shared: &Shared,
    delegate: &Arc<dyn PeerDelegate>,
    fee_per_kb: u64,
) -> Result<(), PeerError> {
    info!("[{}] got feefilter with rate {}", shared.log_id(), fee_per_kb);
    shared.state.lock().unwrap().fee_per_kb = fee_per_kb;
    delegate.set_fee_per_kb(fee_per_kb);
    Ok(())
}

fn handle_assetdata(shared: &Shared, reply: AssetReply) -> Result<(), PeerError> {
    let Some(callback) = shared.state.lock().unwrap().asset_callback.take() else {
        debug!("[{}] dropping assetdata, no request outstanding", shared.log_id());
        return Ok(());
    };

    match reply {
        AssetReply::NotFound => {
            info!("[{}] asset not found", shared.log_id());
            callback(None);
        }
        AssetReply::Found(asset) => {
            info!("[{}] got asset data for [{}]", shared.log_id(), asset.name);
            callback(Some(asset));
        }
    }

    // the callback stays armed unless a newer request replaced it
    let mut st = shared.state.lock().unwrap();
    if st.asset_callback.is_none() {
        st.asset_callback = Some(callback);
    }
    Ok(())
}

fn handle_asset_not_found(shared: &Shared, names: Vec<String>) -> Result<(), PeerError> {
    let Some(callback) = shared.state.lock().unwrap().asset_callback.take() else {
        debug!("[{}] dropping asstnotfound, no request outstanding", shared.log_id());
        return Ok(());
    };

    for name in names {
        info!("[{}] asset {} not found", shared.log_id(), name);
        callback(Some(Default::default()));
    }

    let mut st = shared.state.lock().unwrap();
    if st.asset_callback.is_none() {
        st.asset_callback = Some(callback);
    }
    Ok(())
}
