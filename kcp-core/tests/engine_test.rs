//! Core-only integration tests, no tokio dependency

use bytes::{Bytes, BytesMut};
use kcp_core::constants::*;
use kcp_core::{KcpCoreConfig, KcpCoreError, KcpEngine, KcpHeader, NodeDelayConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Send all output packets from one engine into another engine's input.
fn transfer(src: &mut KcpEngine, dst: &mut KcpEngine) {
    for packet in src.drain_output() {
        let _ = dst.input(packet);
    }
}

/// Flush both sides and deliver everything in both directions.
fn round(client: &mut KcpEngine, server: &mut KcpEngine) {
    client.flush().unwrap();
    transfer(client, server);
    server.flush().unwrap();
    transfer(server, client);
}

fn fastest() -> KcpCoreConfig {
    KcpCoreConfig {
        nodelay: NodeDelayConfig::fastest(),
        ..Default::default()
    }
}

#[test]
fn test_basic_send_recv() {
    let config = KcpCoreConfig::default();
    let mut client = KcpEngine::new(1, config.clone());
    let mut server = KcpEngine::new(1, config);

    client.send(Bytes::from("hello")).unwrap();
    assert_eq!(client.wait_snd(), 1);

    client.flush().unwrap();
    transfer(&mut client, &mut server);

    let msg = server.recv().unwrap().expect("should receive data");
    assert_eq!(msg, Bytes::from("hello"));
    assert!(server.recv().unwrap().is_none());

    // ACK back to the client empties its send buffer
    server.flush().unwrap();
    transfer(&mut server, &mut client);
    assert_eq!(client.wait_snd(), 0);
}

#[test]
fn test_nothing_leaves_before_flush() {
    let mut client = KcpEngine::new(1, KcpCoreConfig::default());
    client.send(Bytes::from("queued")).unwrap();
    assert!(client.drain_output().is_empty());

    client.send(Bytes::new()).unwrap();
    assert_eq!(client.wait_snd(), 1);
}

#[test]
fn test_stats() {
    let config = KcpCoreConfig::default();
    let mut client = KcpEngine::new(2, config.clone());
    let mut server = KcpEngine::new(2, config);

    client.send(Bytes::from("stats test")).unwrap();
    round(&mut client, &mut server);
    let _ = server.recv().unwrap();

    let stats = client.stats();
    assert_eq!(stats.bytes_sent, 10);
    assert!(stats.packets_sent > 0);
    assert!(stats.packets_received > 0);

    let stats = server.stats();
    assert_eq!(stats.bytes_received, 10);
    assert!(stats.packets_received > 0);
}

#[test]
fn test_large_message() {
    let config = KcpCoreConfig::default();
    let mut client = KcpEngine::new(3, config.clone());
    let mut server = KcpEngine::new(3, config);

    // Larger than MSS (1400 - 24 = 1376 bytes), so three fragments
    let data: Vec<u8> = (0..4000u32).map(|i| i as u8).collect();
    client.send(Bytes::from(data.clone())).unwrap();
    assert_eq!(client.wait_snd(), 3);

    // Slow start admits one segment first, then grows
    let mut received = None;
    for _ in 0..10 {
        round(&mut client, &mut server);
        if let Some(msg) = server.recv().unwrap() {
            received = Some(msg);
            break;
        }
    }

    let msg = received.expect("should receive large message");
    assert_eq!(msg.len(), 4000);
    assert_eq!(&msg[..], &data[..]);
}

#[test]
fn test_message_size_limit() {
    let mut client = KcpEngine::new(4, KcpCoreConfig::default());
    let limit = client.max_message_size();
    assert_eq!(limit, 1376 * 127);

    client.send(Bytes::from(vec![0u8; limit])).unwrap();

    let err = client.send(Bytes::from(vec![0u8; limit + 1])).unwrap_err();
    assert!(matches!(err, KcpCoreError::Buffer { .. }));
}

#[test]
fn test_stream_mode_has_no_boundaries() {
    let config = KcpCoreConfig {
        stream_mode: true,
        ..fastest()
    };
    let mut client = KcpEngine::new(5, config.clone());
    let mut server = KcpEngine::new(5, config);
    assert_eq!(client.max_message_size(), usize::MAX);

    let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    client.send(Bytes::from(data.clone())).unwrap();
    round(&mut client, &mut server);

    let mut collected = BytesMut::new();
    while let Some(chunk) = server.recv().unwrap() {
        assert!(chunk.len() <= server.mss() as usize);
        collected.extend_from_slice(&chunk);
    }
    assert_eq!(&collected[..], &data[..]);
}

#[test]
fn test_conv_mismatch() {
    let config = KcpCoreConfig::default();
    let mut client = KcpEngine::new(100, config.clone());
    let mut server = KcpEngine::new(999, config); // different conv

    client.send(Bytes::from("mismatch")).unwrap();
    client.flush().unwrap();

    for packet in client.drain_output() {
        let err = server.input(packet).unwrap_err();
        assert!(matches!(err, KcpCoreError::Protocol { .. }));
    }

    let msg = server.recv().unwrap();
    assert!(msg.is_none(), "server should not receive data with mismatched conv");
}

#[test]
fn test_short_datagram_rejected() {
    let mut server = KcpEngine::new(6, KcpCoreConfig::default());
    let err = server.input(Bytes::from_static(&[0u8; 10])).unwrap_err();
    assert!(matches!(err, KcpCoreError::Protocol { .. }));
}

#[test]
fn test_out_of_order_delivery() {
    let mut client = KcpEngine::new(7, fastest());
    let mut server = KcpEngine::new(7, fastest());

    client.send(Bytes::from("first")).unwrap();
    client.flush().unwrap();
    let first = client.drain_output();

    client.send(Bytes::from("second")).unwrap();
    client.flush().unwrap();
    let second = client.drain_output();

    for packet in second {
        server.input(packet).unwrap();
    }
    assert!(server.recv().unwrap().is_none(), "gap must hold back later data");

    for packet in first {
        server.input(packet).unwrap();
    }
    assert_eq!(server.recv().unwrap().unwrap(), Bytes::from("first"));
    assert_eq!(server.recv().unwrap().unwrap(), Bytes::from("second"));
}

#[test]
fn test_fast_retransmit_on_duplicate_acks() {
    let mut client = KcpEngine::new(8, fastest());
    let mut server = KcpEngine::new(8, fastest());

    let mut packets = Vec::new();
    for i in 0..4 {
        client.send(Bytes::from(format!("msg-{i}"))).unwrap();
        client.flush().unwrap();
        packets.push(client.drain_output());
    }

    // Lose the first segment, deliver the rest one ACK at a time
    for batch in packets.into_iter().skip(1) {
        for packet in batch {
            server.input(packet).unwrap();
        }
        server.flush().unwrap();
        transfer(&mut server, &mut client);
    }
    assert!(server.recv().unwrap().is_none());

    client.flush().unwrap();
    assert_eq!(client.stats().fast_retransmissions, 1);
    transfer(&mut client, &mut server);

    for i in 0..4 {
        let msg = server.recv().unwrap().expect("retransmitted data");
        assert_eq!(msg, Bytes::from(format!("msg-{i}")));
    }
}

#[test]
fn test_lossy_link_delivers_everything_in_order() {
    let config = KcpCoreConfig {
        nodelay: NodeDelayConfig::fast(),
        ..Default::default()
    };
    let mut client = KcpEngine::new(9, config.clone());
    let mut server = KcpEngine::new(9, config);
    let mut rng = StdRng::seed_from_u64(7);

    let messages: Vec<Bytes> = (0..20).map(|i| Bytes::from(format!("packet {i}"))).collect();
    for msg in &messages {
        client.send(msg.clone()).unwrap();
    }

    let mut received = Vec::new();
    for _ in 0..2000 {
        client.advance_clock(50);
        server.advance_clock(50);
        client.update().unwrap();
        server.update().unwrap();

        for packet in client.drain_output() {
            if !rng.gen_bool(0.3) {
                let _ = server.input(packet);
            }
        }
        for packet in server.drain_output() {
            if !rng.gen_bool(0.3) {
                let _ = client.input(packet);
            }
        }

        while let Some(msg) = server.recv().unwrap() {
            received.push(msg);
        }
        if received.len() == messages.len() {
            break;
        }
    }

    assert_eq!(received, messages);
    assert!(client.stats().retransmissions > 0);
}

#[test]
fn test_dead_link_after_max_retries() {
    let config = KcpCoreConfig {
        max_retries: 3,
        ..Default::default()
    };
    let mut client = KcpEngine::new(10, config);

    client.send(Bytes::from("into the void")).unwrap();
    client.update().unwrap();
    client.drain_output();

    let mut lost = false;
    for _ in 0..10 {
        client.advance_clock(5000);
        match client.update() {
            Ok(()) => {}
            Err(KcpCoreError::ConnectionLost) => {
                lost = true;
                break;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
        client.drain_output();
    }

    assert!(lost);
    assert!(client.is_dead());
}

#[test]
fn test_window_probe_is_answered() {
    let mut client = KcpEngine::new(11, KcpCoreConfig::default());
    let mut server = KcpEngine::new(11, KcpCoreConfig::default());

    client.keep_alive_probe();
    client.flush().unwrap();
    let probe = client.drain_output();
    assert_eq!(probe.len(), 1);
    let mut wire = probe[0].clone();
    assert_eq!(KcpHeader::decode(&mut wire).unwrap().cmd, IKCP_CMD_WASK);

    server.input(probe[0].clone()).unwrap();
    server.flush().unwrap();
    let reply = server.drain_output();
    assert_eq!(reply.len(), 1);
    let mut wire = reply[0].clone();
    let header = KcpHeader::decode(&mut wire).unwrap();
    assert_eq!(header.cmd, IKCP_CMD_WINS);
    assert_eq!(header.wnd as u32, IKCP_WND_RCV);
}
