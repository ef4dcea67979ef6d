//! Pattern generator frames relayed to a UDP receiver on loopback

use frame_relay::capture::{PatternGenerator, PixelFormat, VideoFormat};
use frame_relay::transmit::{SendFailurePolicy, Transmitter, TransmitterOptions, UdpConnector};
use frame_relay::{CaptureLoop, LoopConfig, LoopState};
use std::net::UdpSocket;
use std::thread;
use std::time::Duration;

#[test]
fn test_generator_frames_reach_receiver() {
    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    receiver
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let dest = receiver.local_addr().unwrap();

    let transmitter = Transmitter::connect(
        UdpConnector::new(0, false),
        dest,
        TransmitterOptions {
            policy: SendFailurePolicy::Abort,
            ..Default::default()
        },
    )
    .unwrap();

    let mut relay = CaptureLoop::new(
        PatternGenerator::new(Duration::from_millis(10)),
        transmitter,
        LoopConfig {
            requested_format: VideoFormat::new(PixelFormat::RGB565, 160, 80, 320),
            dequeue_timeout: Some(Duration::from_secs(1)),
            memory_limit: None,
        },
    );
    let shutdown = relay.shutdown_handle();

    let worker = thread::spawn(move || {
        let result = relay.run();
        (result, relay.state(), relay.stats())
    });

    let mut datagram = vec![0u8; 65_536];
    let mut first_frames = Vec::new();
    for _ in 0..3 {
        let (len, _) = receiver.recv_from(&mut datagram).unwrap();
        first_frames.push(datagram[..len].to_vec());
    }

    shutdown.shutdown();
    let (result, state, stats) = worker.join().unwrap();

    result.unwrap();
    assert_eq!(state, LoopState::Stopped);
    assert!(first_frames.iter().all(|frame| frame.len() == 25_600));
    // The bars scroll, so consecutive frames differ
    assert_ne!(first_frames[0], first_frames[1]);
    assert!(stats.frames_sent >= 3);
    assert_eq!(stats.send_errors, 0);
}
