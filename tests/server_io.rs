//! End-to-end socket tests: a real server, real TCP clients, and either
//! buffer-backed or scripted channels feeding the sender.

use parking_lot::Mutex;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tarang_server::buffer::{
    FrameBuffer, ImageFormat, ImageFrame, ImageOrientation, ImageType, ItemStatus, PixelType,
    StreamPayload,
};
use tarang_server::channel::{BufferChannel, ChannelRegistry, FrameChannel};
use tarang_server::command::CommandResponse;
use tarang_server::config::ServerConfig;
use tarang_server::frame::TrackedFrame;
use tarang_server::igtl::body::pack_string;
use tarang_server::igtl::header::{IgtlMessage, MessageHeader, HEADER_SIZE};
use tarang_server::igtl::{ImageStream, Subscription};
use tarang_server::math::{rotation_z, Matrix4x4};
use tarang_server::IgtlServer;

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn base_config(port: u16, defaults: Subscription) -> ServerConfig {
    ServerConfig {
        listening_port: port,
        output_channel_id: "TestChannel".to_string(),
        missing_input_grace_period_sec: 60.0,
        max_time_spent_with_processing_ms: 50.0,
        max_number_of_messages_to_send: 100,
        send_valid_transforms_only: true,
        crc_check_enabled: false,
        default_client_info: defaults,
        simulated_source: None,
    }
}

fn image_defaults() -> Subscription {
    Subscription {
        message_types: vec!["IMAGE".to_string()],
        image_streams: vec![ImageStream {
            name: "Image".to_string(),
            embedded_transform_to_frame: "Reference".to_string(),
        }],
        ..Default::default()
    }
}

fn transform_defaults() -> Subscription {
    Subscription {
        message_types: vec!["TRANSFORM".to_string()],
        transform_names: vec!["ProbeToReference".to_string()],
        ..Default::default()
    }
}

fn connect(port: u16) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => {
                stream
                    .set_read_timeout(Some(Duration::from_millis(500)))
                    .unwrap();
                return stream;
            }
            Err(_) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(20))
            }
            Err(err) => panic!("cannot connect to server: {err}"),
        }
    }
}

/// Read one header+body unit; None on a quiet timeout.
fn read_message(stream: &mut TcpStream) -> Option<(MessageHeader, Vec<u8>)> {
    let mut header_buf = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        match stream.read(&mut header_buf[filled..]) {
            Ok(0) => return None,
            Ok(n) => filled += n,
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                if filled == 0 {
                    return None;
                }
            }
            Err(_) => return None,
        }
    }
    let header = MessageHeader::unpack(&header_buf).unwrap();
    let mut body = vec![0u8; header.body_size as usize];
    let mut got = 0;
    while got < body.len() {
        match stream.read(&mut body[got..]) {
            Ok(0) => return None,
            Ok(n) => got += n,
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut => {}
            Err(_) => return None,
        }
    }
    Some((header, body))
}

/// Collect messages until the predicate matches or the deadline passes.
fn wait_for_message(
    stream: &mut TcpStream,
    deadline: Duration,
    mut predicate: impl FnMut(&MessageHeader, &[u8]) -> bool,
) -> Option<(MessageHeader, Vec<u8>)> {
    let until = Instant::now() + deadline;
    while Instant::now() < until {
        if let Some((header, body)) = read_message(stream) {
            if predicate(&header, &body) {
                return Some((header, body));
            }
        }
    }
    None
}

fn test_image_format(width: usize, height: usize) -> ImageFormat {
    ImageFormat {
        size: [width, height, 1],
        pixel_type: PixelType::U8,
        components: 1,
        image_type: ImageType::BMode,
        orientation: ImageOrientation::Mf,
    }
}

/// Background producer writing image+pose frames on a fixed cadence.
struct Producer {
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Producer {
    fn start(
        video: Arc<FrameBuffer>,
        tool: Arc<FrameBuffer>,
        clock: Arc<tarang_server::Clock>,
        width: usize,
        height: usize,
        period: Duration,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = Arc::clone(&stop);
        let format = test_image_format(width, height);
        let thread = std::thread::spawn(move || {
            let mut index = 0u64;
            while !stop_clone.load(Ordering::Relaxed) {
                let now = clock.system_time();
                let _ = video.add(
                    StreamPayload::Image(ImageFrame::new(
                        format,
                        vec![index as u8; format.frame_bytes()],
                    )),
                    index,
                    now,
                    Some(now),
                    ItemStatus::Ok,
                    None,
                );
                let _ = tool.add(
                    StreamPayload::Transform(rotation_z(index as f64 * 0.01)),
                    index,
                    now,
                    Some(now),
                    ItemStatus::Ok,
                    None,
                );
                index += 1;
                std::thread::sleep(period);
            }
        });
        Self {
            stop,
            thread: Some(thread),
        }
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn buffer_backed_server(
    port: u16,
    defaults: Subscription,
    width: usize,
    height: usize,
    period: Duration,
) -> (IgtlServer, Producer) {
    let video = Arc::new(FrameBuffer::with_capacity("TestVideo", 100));
    let tool = Arc::new(FrameBuffer::with_capacity("TestTool", 100));
    let mut channels = ChannelRegistry::new();
    channels.register(Arc::new(
        BufferChannel::new("TestChannel")
            .with_video(Arc::clone(&video))
            .with_tool("ProbeToReference", Arc::clone(&tool)),
    ));

    let server = IgtlServer::new(base_config(port, defaults), channels);
    let producer = Producer::start(video, tool, server.clock(), width, height, period);
    (server, producer)
}

#[test]
fn test_single_client_receives_image_stream() {
    let port = free_port();
    let (mut server, _producer) = buffer_backed_server(
        port,
        image_defaults(),
        32,
        16,
        Duration::from_millis(20),
    );
    server.start().unwrap();

    let mut client = connect(port);
    let (header, body) = wait_for_message(&mut client, Duration::from_secs(5), |header, _| {
        header.device_type == "IMAGE"
    })
    .expect("no IMAGE message arrived");

    assert_eq!(header.device_name, "Image");
    // 72-byte image subheader plus one byte per pixel.
    assert_eq!(body.len(), 72 + 32 * 16);
    // Outbound timestamps are UTC wall clock.
    let offset = server.clock().universal_from_system(0.0);
    assert!(header.timestamp > offset - 1.0);

    server.stop();
}

#[test]
fn test_clientinfo_switches_subscription() {
    let port = free_port();
    let (mut server, _producer) = buffer_backed_server(
        port,
        image_defaults(),
        16,
        16,
        Duration::from_millis(20),
    );
    server.start().unwrap();

    // Client B stays on server defaults (IMAGE).
    let mut client_b = connect(port);
    // Client A subscribes to TRANSFORM/ProbeToReference only.
    let mut client_a = connect(port);
    let client_info = r#"<ClientInfo>
        <MessageTypes><Message Type="TRANSFORM"/></MessageTypes>
        <TransformNames><Transform Name="ProbeToReference"/></TransformNames>
      </ClientInfo>"#;
    let update = IgtlMessage::new("CLIENTINFO", "", 0.0, pack_string(client_info));
    client_a.write_all(&update.pack()).unwrap();

    let (header, body) = wait_for_message(&mut client_a, Duration::from_secs(5), |header, _| {
        header.device_type == "TRANSFORM"
    })
    .expect("client A never received a TRANSFORM");
    assert_eq!(header.device_name, "ProbeToReference");
    assert_eq!(body.len(), 48);

    // After the switch, client A gets no further images.
    let mut post_switch_images = 0;
    let until = Instant::now() + Duration::from_millis(800);
    while Instant::now() < until {
        if let Some((header, _)) = read_message(&mut client_a) {
            if header.device_type == "IMAGE" {
                post_switch_images += 1;
            }
        }
    }
    assert_eq!(post_switch_images, 0);

    // Client B still streams images.
    assert!(wait_for_message(&mut client_b, Duration::from_secs(5), |header, _| {
        header.device_type == "IMAGE"
    })
    .is_some());

    server.stop();
}

#[test]
fn test_keep_alive_when_no_data() {
    let port = free_port();
    // No channels at all: command-only mode.
    let server_config = base_config(port, image_defaults());
    let mut server = IgtlServer::new(server_config, ChannelRegistry::new());
    server.start().unwrap();

    let mut client = connect(port);
    let mut status_count = 0;
    let mut image_count = 0;
    let until = Instant::now() + Duration::from_millis(1500);
    while Instant::now() < until {
        if let Some((header, _)) = read_message(&mut client) {
            match header.device_type.as_str() {
                "STATUS" => status_count += 1,
                "IMAGE" => image_count += 1,
                _ => {}
            }
        }
    }

    // Keep-alives arrive at roughly half the socket timeout (250 ms).
    assert!(status_count >= 3, "only {status_count} keep-alives seen");
    assert_eq!(image_count, 0);

    server.stop();
}

#[test]
fn test_get_status_is_answered_immediately() {
    let port = free_port();
    let (mut server, _producer) = buffer_backed_server(
        port,
        transform_defaults(),
        8,
        8,
        Duration::from_millis(50),
    );
    server.start().unwrap();

    let mut client = connect(port);
    let probe = IgtlMessage::new("GET_STATUS", "", 0.0, Vec::new());
    client.write_all(&probe.pack()).unwrap();

    assert!(wait_for_message(&mut client, Duration::from_secs(3), |header, _| {
        header.device_type == "STATUS"
    })
    .is_some());

    server.stop();
}

#[test]
fn test_duplicate_command_executes_once() {
    let port = free_port();
    let (mut server, _producer) = buffer_backed_server(
        port,
        transform_defaults(),
        8,
        8,
        Duration::from_millis(50),
    );

    let executions = Arc::new(AtomicUsize::new(0));
    let executions_clone = Arc::clone(&executions);
    server.processor().register_handler(
        "Probe",
        Box::new(
            move |request: &tarang_server::command::CommandRequest,
                  _ctx: &tarang_server::command::HandlerContext| {
                executions_clone.fetch_add(1, Ordering::SeqCst);
                vec![CommandResponse::String {
                    client_id: request.client_id,
                    success: true,
                    message: "done".to_string(),
                    device_name: request.response_device_name(),
                }]
            },
        ),
    );
    server.start().unwrap();

    let mut client = connect(port);
    let command = IgtlMessage::new(
        "STRING",
        "Cmd_42",
        0.0,
        pack_string(r#"<Command Name="Probe"/>"#),
    );
    client.write_all(&command.pack()).unwrap();
    client.write_all(&command.pack()).unwrap();

    let (header, body) = wait_for_message(&mut client, Duration::from_secs(5), |header, _| {
        header.device_type == "STRING"
    })
    .expect("no command reply arrived");
    assert_eq!(header.device_name, "Cmd_42");
    let reply = tarang_server::igtl::body::parse_string(&body).unwrap();
    assert!(reply.contains("Status=\"SUCCESS\""));

    // Give the second (duplicate) command time to have been processed.
    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    server.stop();
}

#[test]
fn test_image_command_response_broadcasts_to_all_clients() {
    let port = free_port();
    let config = base_config(port, transform_defaults());
    let mut server = IgtlServer::new(config, ChannelRegistry::new());

    let format = test_image_format(4, 4);
    server.processor().register_handler(
        "Snapshot",
        Box::new(
            move |request: &tarang_server::command::CommandRequest,
                  _ctx: &tarang_server::command::HandlerContext| {
                vec![CommandResponse::Image {
                    client_id: request.client_id,
                    image_name: String::new(),
                    image: ImageFrame::new(format, vec![9; format.frame_bytes()]),
                    image_to_reference: Matrix4x4::identity(),
                }]
            },
        ),
    );
    server.start().unwrap();

    let mut requester = connect(port);
    let mut bystander = connect(port);

    let command = IgtlMessage::new(
        "STRING",
        "Snap_1",
        0.0,
        pack_string(r#"<Command Name="Snapshot"/>"#),
    );
    requester.write_all(&command.pack()).unwrap();

    for (who, stream) in [("requester", &mut requester), ("bystander", &mut bystander)] {
        let received = wait_for_message(stream, Duration::from_secs(5), |header, _| {
            header.device_type == "IMAGE"
        });
        assert!(received.is_some(), "{who} did not receive the broadcast image");
        let (header, body) = received.unwrap();
        assert_eq!(header.device_name, "ServerImage");
        assert_eq!(body.len(), 72 + 16);
    }

    server.stop();
}

#[test]
fn test_stalled_client_is_evicted_and_stream_continues() {
    let port = free_port();
    // Large frames at a fast cadence so a non-reading client backs up fast.
    let (mut server, _producer) = buffer_backed_server(
        port,
        image_defaults(),
        512,
        512,
        Duration::from_millis(20),
    );
    server.start().unwrap();

    let healthy = connect(port);
    let stalled = connect(port);

    let deadline = Instant::now() + Duration::from_secs(5);
    while server.num_connected_clients() < 2 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(server.num_connected_clients(), 2);

    // Healthy client keeps draining in the background; the stalled one
    // never reads a byte.
    let healthy_images = Arc::new(AtomicUsize::new(0));
    let reader_done = Arc::new(AtomicBool::new(false));
    let counter = Arc::clone(&healthy_images);
    let done = Arc::clone(&reader_done);
    let mut healthy_reader = healthy.try_clone().unwrap();
    let reader = std::thread::spawn(move || {
        while !done.load(Ordering::Relaxed) {
            if let Some((header, _)) = read_message(&mut healthy_reader) {
                if header.device_type == "IMAGE" {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    });

    // Send timeouts are 500 ms with 10 retries, so eviction can take a
    // handful of seconds once the socket buffers fill.
    let deadline = Instant::now() + Duration::from_secs(30);
    while server.num_connected_clients() > 1 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(100));
    }
    assert_eq!(
        server.num_connected_clients(),
        1,
        "stalled client was not evicted"
    );

    let images_after_eviction = healthy_images.load(Ordering::Relaxed);
    let deadline = Instant::now() + Duration::from_secs(10);
    while healthy_images.load(Ordering::Relaxed) <= images_after_eviction
        && Instant::now() < deadline
    {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(
        healthy_images.load(Ordering::Relaxed) > images_after_eviction,
        "healthy client stopped receiving after the eviction"
    );

    drop(stalled);
    reader_done.store(true, Ordering::Relaxed);
    server.stop();
    let _ = reader.join();
}

#[test]
fn test_graceful_stop_quiesces_workers() {
    let port = free_port();
    let (mut server, _producer) = buffer_backed_server(
        port,
        image_defaults(),
        16,
        16,
        Duration::from_millis(20),
    );
    server.start().unwrap();
    assert!(server.is_running());

    let _client = connect(port);
    std::thread::sleep(Duration::from_millis(300));

    let stop_started = Instant::now();
    server.stop();
    assert!(stop_started.elapsed() < Duration::from_secs(2));
    assert!(!server.is_running());
}

/// Scripted channel for the producer-overrun scenario: a fixed 0.1 s frame
/// cadence whose available window can be swapped, with every batch request
/// recorded.
struct ScriptedChannel {
    window: Mutex<(f64, f64)>,
    requests: Mutex<Vec<f64>>,
}

impl ScriptedChannel {
    fn new(oldest: f64, latest: f64) -> Self {
        Self {
            window: Mutex::new((oldest, latest)),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn jump_window(&self, oldest: f64, latest: f64) {
        *self.window.lock() = (oldest, latest);
    }
}

impl FrameChannel for ScriptedChannel {
    fn id(&self) -> &str {
        "TestChannel"
    }

    fn has_video_source(&self) -> bool {
        false
    }

    fn data_available(&self) -> bool {
        true
    }

    fn oldest_timestamp(&self) -> tarang_server::Result<f64> {
        Ok(self.window.lock().0)
    }

    fn most_recent_timestamp(&self) -> tarang_server::Result<f64> {
        Ok(self.window.lock().1)
    }

    fn tracked_frames(
        &self,
        after_ts: f64,
        max_frames: usize,
    ) -> tarang_server::Result<Vec<TrackedFrame>> {
        self.requests.lock().push(after_ts);
        let (oldest, latest) = *self.window.lock();
        let mut frames = Vec::new();
        let mut ts = (after_ts.max(oldest - 0.1) * 10.0).floor() / 10.0 + 0.1;
        while ts <= latest && frames.len() < max_frames {
            if ts > after_ts && ts >= oldest {
                let mut frame = TrackedFrame::new(ts);
                frame.set_transform("ProbeToReference", rotation_z(ts), ItemStatus::Ok);
                frames.push(frame);
            }
            ts += 0.1;
        }
        Ok(frames)
    }
}

#[test]
fn test_producer_overrun_skips_ahead() {
    let port = free_port();
    let channel = Arc::new(ScriptedChannel::new(10.0, 12.0));
    let mut channels = ChannelRegistry::new();
    channels.register(Arc::clone(&channel) as Arc<dyn FrameChannel>);

    let mut server = IgtlServer::new(base_config(port, transform_defaults()), channels);
    server.start().unwrap();
    let offset = server.clock().universal_from_system(0.0);

    let mut client = connect(port);
    let mut received: Vec<f64> = Vec::new();

    // Drain the initial window.
    let until = Instant::now() + Duration::from_secs(3);
    while Instant::now() < until {
        if let Some((header, _)) = read_message(&mut client) {
            if header.device_type == "TRANSFORM" {
                received.push(header.timestamp - offset);
            }
        }
        if received.iter().any(|&ts| ts > 11.9) {
            break;
        }
    }
    assert!(!received.is_empty(), "no frames from the initial window");

    // The producer laps the sender: the available window jumps forward.
    channel.jump_window(20.0, 22.0);
    let until = Instant::now() + Duration::from_secs(5);
    while Instant::now() < until {
        if let Some((header, _)) = read_message(&mut client) {
            if header.device_type == "TRANSFORM" {
                received.push(header.timestamp - offset);
            }
        }
        if received.iter().any(|&ts| ts > 21.9) {
            break;
        }
    }

    // Nothing between the two windows was ever delivered, and the resume
    // point honors the skip margin past the new oldest timestamp.
    assert!(
        !received.iter().any(|&ts| ts > 12.05 && ts < 20.15),
        "frames from the evicted gap were delivered: {received:?}"
    );
    assert!(received.iter().any(|&ts| ts > 20.15 && ts < 22.05));
    let requests = channel.requests.lock().clone();
    assert!(
        requests.iter().any(|&ts| (ts - 20.1).abs() < 1.0e-6),
        "no batch request resumed at oldest + margin: {requests:?}"
    );

    server.stop();
}
