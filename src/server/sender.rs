//! Data sender thread: the fan-out half of the streaming pipeline.
//!
//! Each tick drains pending command responses, pulls a batch of tracked
//! frames from the broadcast channel, and sends every client the messages
//! its subscription selects. The batch size adapts so one round costs about
//! `MaxTimeSpentWithProcessingMs`; when the producer's ring buffer laps the
//! sender, the sender skips ahead instead of chasing evicted data. Quiet
//! periods are bridged with STATUS keep-alives at half the client socket
//! timeout so idle connections stay warm.

use super::{
    log_dynamic, ServerState, CLIENT_SOCKET_TIMEOUT, DELAY_BETWEEN_RETRY_ATTEMPTS,
    DELAY_ON_NO_NEW_FRAMES, DELAY_ON_SENDING_ERROR, NO_CLIENT_SLEEP, NUMBER_OF_RETRY_ATTEMPTS,
    SAMPLING_SKIPPING_MARGIN_SEC,
};
use crate::frame::TrackedFrame;
use crate::igtl::status_ok_message;
use crate::server::registry::Client;
use log::{debug, error, info, warn};
use std::io::Write;

pub(crate) fn run(state: &ServerState) {
    state.sender.set_running(true);

    let channel = state
        .channels
        .resolve_broadcast(&state.config.output_channel_id);
    if channel.is_none() {
        warn!("there are no channels to broadcast, only command processing is available");
    }

    // Resume point for the frame stream. Zero means "start from the
    // channel's most recent data when the next client appears".
    let mut last_sent_ts = 0.0f64;
    if let Some(channel) = &channel {
        if let Ok(ts) = channel.most_recent_timestamp() {
            last_sent_ts = ts;
        }
    }

    let mut last_processing_time_per_frame_ms = -1.0f64;
    let mut elapsed_since_last_packet_sec = 0.0f64;

    while state.connection.is_requested() && state.sender.is_requested() {
        if state.registry.is_empty() {
            std::thread::sleep(NO_CLIENT_SLEEP);
            // Next client starts from the most recent data, not the past.
            last_sent_ts = 0.0;
            continue;
        }

        // Command replies go out ahead of this tick's frames.
        for response in state.processor.drain_responses() {
            let timestamp = state
                .clock
                .universal_from_system(state.clock.system_time());
            let Some(message) = state.factory.pack_command_response(&response, timestamp) else {
                error!("failed to create a message from a command response");
                continue;
            };
            let wire = message.pack();

            if response.is_broadcast() {
                info!("broadcast command reply: {}", message.device_name);
                state.registry.with_clients(|clients| {
                    for client in clients.iter() {
                        if !send_with_retry(client, &wire) {
                            warn!(
                                "message reply cannot be sent to client {}, probably client has been disconnected",
                                client.id
                            );
                        }
                    }
                });
            } else {
                info!("send command reply: {}", message.device_name);
                let client_id = response.client_id();
                state.registry.with_clients(|clients| {
                    match clients.iter().find(|c| c.id == client_id) {
                        Some(client) => {
                            if !send_with_retry(client, &wire) {
                                warn!("message reply cannot be sent to client {client_id}");
                            }
                        }
                        None => warn!(
                            "message reply cannot be sent to client {client_id}, probably client has been disconnected"
                        ),
                    }
                });
            }
        }

        let round_start = state.clock.system_time();

        // Batch size: keep one round near the processing budget. Sub-ms
        // frames count as 1 ms to avoid dividing by ~zero.
        if last_processing_time_per_frame_ms < 1.0 {
            last_processing_time_per_frame_ms = 1.0;
        }
        let frames_to_get = ((state.config.max_time_spent_with_processing_ms
            / last_processing_time_per_frame_ms) as usize)
            .max(1)
            .min(state.config.max_number_of_messages_to_send);

        let mut frames: Vec<TrackedFrame> = Vec::new();
        if let Some(channel) = &channel {
            if !channel.data_available() {
                log_dynamic(
                    state.grace_period_log_level(),
                    "no data is broadcast, as no data is available yet",
                );
            } else if let Ok(oldest_ts) = channel.oldest_timestamp() {
                if last_sent_ts < oldest_ts {
                    info!(
                        "broadcasting resumed; no data was available between {last_sent_ts:.3}s and {oldest_ts:.3}s, nothing was sent for that period"
                    );
                    last_sent_ts = oldest_ts + SAMPLING_SKIPPING_MARGIN_SEC;
                }
                match channel.tracked_frames(last_sent_ts, frames_to_get) {
                    Ok(batch) => frames = batch,
                    Err(err) => {
                        error!(
                            "failed to get tracked frame list (last sent timestamp {last_sent_ts:.6}): {err}"
                        );
                        std::thread::sleep(DELAY_ON_SENDING_ERROR);
                    }
                }
            }
        }

        if frames.is_empty() {
            std::thread::sleep(DELAY_ON_NO_NEW_FRAMES);
            elapsed_since_last_packet_sec += state.clock.system_time() - round_start;
            if elapsed_since_last_packet_sec * 1000.0
                > CLIENT_SOCKET_TIMEOUT.as_millis() as f64 / 2.0
            {
                keep_alive(state);
                elapsed_since_last_packet_sec = 0.0;
            }
            continue;
        }

        let frame_count = frames.len();
        for mut frame in frames {
            send_tracked_frame(state, &mut frame);
            elapsed_since_last_packet_sec = 0.0;
            last_sent_ts = frame.timestamp;
        }

        let round_ms = (state.clock.system_time() - round_start) * 1000.0;
        last_processing_time_per_frame_ms = round_ms / frame_count as f64;
    }

    state.sender.set_running(false);
}

/// Fan one frame out to every connected client. Holds the roster lock for
/// the whole round so no socket can be closed mid-send; clients whose
/// socket has died are pruned in place and iteration continues.
fn send_tracked_frame(state: &ServerState, frame: &mut TrackedFrame) {
    if let Some(repository) = &state.repository {
        repository.set_transforms(frame);
    }

    // The wire carries UTC; the local timestamp is restored afterwards so
    // buffer bookkeeping keeps using the monotonic clock.
    let local_ts = frame.timestamp;
    frame.timestamp = state.clock.universal_from_system(local_ts);

    state.registry.with_clients(|clients| {
        let mut i = 0;
        while i < clients.len() {
            let client = &clients[i];
            let subscription = client
                .subscription
                .effective(&state.config.default_client_info);
            let messages = state.factory.pack_frame_messages(
                &subscription,
                frame,
                state.repository.as_ref(),
                state.config.send_valid_transforms_only,
            );

            let mut disconnected = false;
            for message in &messages {
                if !send_with_retry(client, &message.pack()) {
                    debug!(
                        "client disconnected - could not send {} message to client (device name: {}, timestamp: {:.6})",
                        message.device_type, message.device_name, message.timestamp
                    );
                    disconnected = true;
                    break;
                }
            }

            if disconnected {
                let removed = clients.remove(i);
                let _ = removed.stream.shutdown(std::net::Shutdown::Both);
                info!("client disconnected ({})", removed.peer);
                info!("number of connected clients: {}", clients.len());
                continue;
            }
            i += 1;
        }
    });

    frame.timestamp = local_ts;
}

/// Empty STATUS_OK to every client; send failures prune like frame sends.
fn keep_alive(state: &ServerState) {
    let timestamp = state
        .clock
        .universal_from_system(state.clock.system_time());
    let wire = status_ok_message(timestamp).pack();

    state.registry.with_clients(|clients| {
        let mut i = 0;
        while i < clients.len() {
            if !send_with_retry(&clients[i], &wire) {
                let removed = clients.remove(i);
                let _ = removed.stream.shutdown(std::net::Shutdown::Both);
                debug!("client disconnected - could not send keep-alive message");
                info!("client disconnected ({})", removed.peer);
                info!("number of connected clients: {}", clients.len());
                continue;
            }
            i += 1;
        }
    });
    debug!("keep-alive packet sent to clients");
}

/// Push one packed message down a client socket.
///
/// Timeouts and zero-length writes are retried with a fixed delay; the
/// whole buffer must go out for the send to count. Returns false when the
/// client should be treated as disconnected.
fn send_with_retry(client: &Client, wire: &[u8]) -> bool {
    let mut stream = &client.stream;
    let mut written = 0usize;
    let mut attempts = 0usize;

    while written < wire.len() {
        match stream.write(&wire[written..]) {
            Ok(0) => {
                attempts += 1;
                if attempts >= NUMBER_OF_RETRY_ATTEMPTS {
                    return false;
                }
                std::thread::sleep(DELAY_BETWEEN_RETRY_ATTEMPTS);
            }
            Ok(n) => written += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                attempts += 1;
                if attempts >= NUMBER_OF_RETRY_ATTEMPTS {
                    return false;
                }
                std::thread::sleep(DELAY_BETWEEN_RETRY_ATTEMPTS);
            }
            Err(_) => return false,
        }
    }
    true
}
