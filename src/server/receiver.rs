//! Data receiver thread: the fan-in half of the streaming pipeline.
//!
//! Each tick snapshots the roster and attempts to read one message header
//! per client. The 500 ms socket timeout bounds how long a tick can block
//! on any one client, which in turn bounds shutdown latency. Malformed or
//! unknown messages are skipped with the connection retained; disconnect
//! detection is the sender's job.

use super::{ServerState, NO_CLIENT_SLEEP};
use crate::command::{prefix_from_device_name, uid_from_device_name, CommandRequest};
use crate::igtl::header::MessageHeader;
use crate::igtl::{check_body_crc, status_ok_message, Subscription, HEADER_SIZE};
use log::{debug, error, warn};
use std::io::{Read, Write};
use std::net::TcpStream;

/// Upper bound on an inbound body; everything clients legitimately send
/// (subscriptions, command XML) is far below this.
const MAX_INBOUND_BODY_SIZE: u64 = 4 * 1024 * 1024;

/// Extra timeout windows granted to finish a partially received unit.
const PARTIAL_READ_GRACE_ATTEMPTS: usize = 4;

enum ReadOutcome {
    Complete,
    /// Timeout with nothing read: the no-data tick.
    NoData,
    /// Peer closed the socket.
    Closed,
    /// Bytes arrived but the unit never completed.
    Incomplete(usize),
    Error(std::io::Error),
}

fn read_full(stream: &mut TcpStream, buf: &mut [u8]) -> ReadOutcome {
    let mut filled = 0usize;
    let mut grace = 0usize;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return ReadOutcome::Closed,
            Ok(n) => filled += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                if filled == 0 {
                    return ReadOutcome::NoData;
                }
                grace += 1;
                if grace >= PARTIAL_READ_GRACE_ATTEMPTS {
                    return ReadOutcome::Incomplete(filled);
                }
            }
            Err(err) => return ReadOutcome::Error(err),
        }
    }
    ReadOutcome::Complete
}

/// Read and discard `count` body bytes (unknown or skippable messages).
fn skip_body(stream: &mut TcpStream, count: u64) {
    let mut remaining = count;
    let mut scratch = [0u8; 4096];
    while remaining > 0 {
        let chunk = remaining.min(scratch.len() as u64) as usize;
        match read_full(stream, &mut scratch[..chunk]) {
            ReadOutcome::Complete => remaining -= chunk as u64,
            _ => return,
        }
    }
}

fn read_body(stream: &mut TcpStream, header: &MessageHeader) -> Option<Vec<u8>> {
    if header.body_size > MAX_INBOUND_BODY_SIZE {
        warn!(
            "{} message declares an implausible body of {} bytes, skipping",
            header.device_type, header.body_size
        );
        return None;
    }
    let mut body = vec![0u8; header.body_size as usize];
    match read_full(stream, &mut body) {
        ReadOutcome::Complete => Some(body),
        _ => {
            warn!("failed to read {} message body", header.device_type);
            None
        }
    }
}

pub(crate) fn run(state: &ServerState) {
    state.receiver.set_running(true);

    while state.connection.is_requested() && state.receiver.is_requested() {
        let clients = state.registry.snapshot();
        if clients.is_empty() {
            std::thread::sleep(NO_CLIENT_SLEEP);
            continue;
        }

        for mut client in clients {
            let now = state.clock.system_time();
            state.registry.expire_command_uids(client.id, now);

            let mut header_buf = [0u8; HEADER_SIZE];
            match read_full(&mut client.stream, &mut header_buf) {
                ReadOutcome::Complete => {}
                ReadOutcome::NoData => continue,
                ReadOutcome::Closed => {
                    debug!("client {} closed its socket", client.id);
                    continue;
                }
                ReadOutcome::Incomplete(got) => {
                    warn!(
                        "client {} sent a truncated header ({got} of {HEADER_SIZE} bytes)",
                        client.id
                    );
                    continue;
                }
                ReadOutcome::Error(err) => {
                    debug!("receive error from client {}: {err}", client.id);
                    continue;
                }
            }

            let header = match MessageHeader::unpack(&header_buf) {
                Ok(header) => header,
                Err(err) => {
                    warn!("undecodable message header from client {}: {err}", client.id);
                    continue;
                }
            };

            state.registry.touch_command_time(client.id, now);
            dispatch(state, &mut client.stream, client.id, &header);
        }
    }

    state.receiver.set_running(false);
}

fn dispatch(state: &ServerState, stream: &mut TcpStream, client_id: u64, header: &MessageHeader) {
    match header.device_type.as_str() {
        "CLIENTINFO" => {
            let Some(body) = checked_body(state, stream, header) else {
                return;
            };
            let xml = match crate::igtl::body::parse_string(&body) {
                Ok(xml) => xml,
                Err(err) => {
                    warn!("CLIENTINFO body unpacking failed: {err}");
                    return;
                }
            };
            match Subscription::from_xml(&xml) {
                Ok(subscription) => {
                    state.registry.apply_subscription(client_id, subscription);
                }
                Err(err) => warn!("invalid CLIENTINFO from client {client_id}: {err}"),
            }
        }
        "GET_STATUS" => {
            // Just a ping; skip the body and answer immediately.
            skip_body(stream, header.body_size);
            let timestamp = state
                .clock
                .universal_from_system(state.clock.system_time());
            if let Err(err) = stream.write_all(&status_ok_message(timestamp).pack()) {
                debug!("failed to answer GET_STATUS for client {client_id}: {err}");
            }
        }
        "STRING" => {
            let Some(body) = checked_body(state, stream, header) else {
                return;
            };
            let command_xml = match crate::igtl::body::parse_string(&body) {
                Ok(xml) => xml,
                Err(err) => {
                    error!("STRING message unpacking failed: {err}");
                    return;
                }
            };

            let device_name = if header.device_name.is_empty() {
                error!("received command message from an unnamed device");
                "UNKNOWN"
            } else {
                header.device_name.as_str()
            };
            let prefix = prefix_from_device_name(device_name).to_string();
            let uid = uid_from_device_name(device_name).to_string();

            if !uid.is_empty() && !state.registry.register_command_uid(client_id, &uid) {
                warn!(
                    "already received a command with id = {uid} from client id = {client_id}; this repeated command will be ignored"
                );
                return;
            }

            state.processor.queue_command(CommandRequest {
                client_id,
                command_xml,
                device_prefix: prefix,
                uid,
            });
        }
        "GET_IMGMETA" => {
            skip_body(stream, header.body_size);
            state
                .processor
                .queue_get_image_meta(client_id, header.device_name.clone());
        }
        "GET_IMAGE" => {
            skip_body(stream, header.body_size);
            if header.device_name.is_empty() {
                error!("GET_IMAGE request does not name the image to acquire");
                return;
            }
            state
                .processor
                .queue_get_image(client_id, header.device_name.clone());
        }
        other => {
            warn!(
                "unknown message received, skipping (device type: {other}, device name: {})",
                header.device_name
            );
            skip_body(stream, header.body_size);
        }
    }
}

/// Read a body and, when configured, verify its CRC before use.
fn checked_body(
    state: &ServerState,
    stream: &mut TcpStream,
    header: &MessageHeader,
) -> Option<Vec<u8>> {
    let body = read_body(stream, header)?;
    if state.config.crc_check_enabled {
        if let Err(err) = check_body_crc(header, &body) {
            warn!("{err}");
            return None;
        }
    }
    Some(body)
}
