//! End-to-end tests over real sockets: handshakes, authentication,
//! publisher/player relay, the HTTP tunnel, and publisher reconnect.
//!
//! Each test starts its own server on a fixed port with an isolated
//! context, connects with plain `TcpStream`s and asserts on the wire.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use md5::{Digest, Md5};

use rtsp_relay::config::ServerConfig;
use rtsp_relay::events::{Credential, EventHooks};
use rtsp_relay::media::source::MediaSource;
use rtsp_relay::media::MediaTuple;
use rtsp_relay::{Context, Server};

const SDP: &str = "v=0\r\n\
    o=- 0 0 IN IP4 127.0.0.1\r\n\
    s=Relay\r\n\
    t=0 0\r\n\
    m=video 0 RTP/AVP 96\r\n\
    a=rtpmap:96 H264/90000\r\n\
    a=control:trackID=0\r\n";

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(3)))
        .unwrap();
    stream
}

fn send(stream: &mut TcpStream, request: &str) {
    stream.write_all(request.as_bytes()).expect("send request");
}

/// Read one response: head up to CRLFCRLF plus a `Content-Length` body.
fn read_response(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(1) => head.push(byte[0]),
            _ => break,
        }
    }
    let mut response = String::from_utf8_lossy(&head).into_owned();

    if let Some(len) = response
        .lines()
        .find(|l| l.to_lowercase().starts_with("content-length:"))
        .and_then(|l| l.split(':').nth(1))
        .and_then(|v| v.trim().parse::<usize>().ok())
    {
        if len > 0 {
            let mut body = vec![0u8; len];
            if stream.read_exact(&mut body).is_ok() {
                response.push_str(&String::from_utf8_lossy(&body));
            }
        }
    }
    response
}

/// Read one `$`-framed interleaved frame.
fn read_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).expect("frame header");
    assert_eq!(header[0], 0x24, "interleaved magic");
    let len = u16::from_be_bytes([header[2], header[3]]) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).expect("frame payload");
    (header[1], payload)
}

fn header_value<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    response
        .lines()
        .find(|l| l.to_lowercase().starts_with(&format!("{}:", name.to_lowercase())))
        .and_then(|l| l.split_once(':'))
        .map(|(_, v)| v.trim())
}

fn session_id(response: &str) -> String {
    header_value(response, "Session")
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
        .expect("session header")
}

fn register_test_source(ctx: &Context) -> Arc<MediaSource> {
    let src = MediaSource::new("rtsp", MediaTuple::new("", "live", "cam1"));
    src.set_sdp(SDP);
    ctx.registry.regist(&src).unwrap();
    src
}

fn start_server(port: u16, config: ServerConfig, hooks: EventHooks) -> Server {
    let mut server = Server::with_config(&format!("127.0.0.1:{}", port), config, hooks);
    server.start().expect("server start");
    server
}

fn quick_wait_config() -> ServerConfig {
    ServerConfig {
        max_stream_wait_ms: 300,
        ..ServerConfig::default()
    }
}

#[test]
fn s1_options_lists_all_methods() {
    let server = start_server(18601, quick_wait_config(), EventHooks::default());
    let _keep = server.is_running();

    let mut stream = connect(18601);
    send(
        &mut stream,
        "OPTIONS rtsp://127.0.0.1:18601/live/cam1 RTSP/1.0\r\nCSeq: 1\r\n\r\n",
    );
    let resp = read_response(&mut stream);
    assert!(resp.starts_with("RTSP/1.0 200 OK"), "{}", resp);
    assert!(resp.contains("CSeq: 1\r\n"), "CSeq echo: {}", resp);
    assert_eq!(
        header_value(&resp, "Public"),
        Some("OPTIONS, DESCRIBE, SETUP, TEARDOWN, PLAY, PAUSE, ANNOUNCE, RECORD, SET_PARAMETER, GET_PARAMETER"),
    );
    assert!(header_value(&resp, "Date").unwrap().ends_with("GMT"));
}

#[test]
fn s2_s3_digest_challenge_then_authorized_describe() {
    let mut hooks = EventHooks::default();
    hooks.on_realm = Some(Box::new(|_info, invoker| invoker("zlm".to_string())));
    hooks.on_credential = Some(Box::new(|realm, user, _cleartext, invoker| {
        assert_eq!(realm, "zlm");
        invoker(if user == "u" {
            Some(Credential::Plain("p".to_string()))
        } else {
            None
        });
    }));
    let server = start_server(18602, quick_wait_config(), hooks);
    let _src = register_test_source(server.context());

    let uri = "rtsp://127.0.0.1:18602/live/cam1";
    let mut stream = connect(18602);

    // S2: no Authorization → 401 with a fresh 32-char digest nonce.
    send(
        &mut stream,
        &format!("DESCRIBE {} RTSP/1.0\r\nCSeq: 1\r\nAccept: application/sdp\r\n\r\n", uri),
    );
    let resp = read_response(&mut stream);
    assert!(resp.starts_with("RTSP/1.0 401 Unauthorized"), "{}", resp);
    let challenge = header_value(&resp, "WWW-Authenticate").expect("challenge");
    assert!(challenge.contains("Digest realm=\"zlm\""), "{}", challenge);
    let nonce = challenge
        .split("nonce=\"")
        .nth(1)
        .and_then(|r| r.split('"').next())
        .expect("nonce");
    assert_eq!(nonce.len(), 32);

    // S3: the connection stayed open; retry with the digest response.
    let ha1 = md5_hex(&format!("u:zlm:p"));
    let response = md5_hex(&format!(
        "{}:{}:{}",
        ha1,
        nonce,
        md5_hex(&format!("DESCRIBE:{}", uri))
    ));
    send(
        &mut stream,
        &format!(
            "DESCRIBE {} RTSP/1.0\r\nCSeq: 2\r\nAuthorization: Digest username=\"u\",realm=\"zlm\",nonce=\"{}\",uri=\"{}\",response=\"{}\"\r\n\r\n",
            uri, nonce, uri, response
        ),
    );
    let resp = read_response(&mut stream);
    assert!(resp.starts_with("RTSP/1.0 200 OK"), "{}", resp);
    assert!(resp.contains("CSeq: 2\r\n"));
    assert_eq!(header_value(&resp, "Content-Base"), Some(&format!("{}/", uri)[..]));
    assert_eq!(header_value(&resp, "Content-Type"), Some("application/sdp"));
    assert!(resp.contains("m=video"), "SDP body present: {}", resp);
}

#[test]
fn s4_s5_setup_play_teardown_over_tcp() {
    let server = start_server(18603, quick_wait_config(), EventHooks::default());
    let _src = register_test_source(server.context());

    let base = "rtsp://127.0.0.1:18603/live/cam1";
    let mut stream = connect(18603);

    send(
        &mut stream,
        &format!("DESCRIBE {} RTSP/1.0\r\nCSeq: 2\r\n\r\n", base),
    );
    let describe = read_response(&mut stream);
    assert!(describe.starts_with("RTSP/1.0 200 OK"), "{}", describe);
    let sid = session_id(&describe);
    assert_eq!(sid.len(), 12);

    // S4: SETUP over TCP echoes the interleaved pair and an ssrc.
    send(
        &mut stream,
        &format!(
            "SETUP {}/trackID=0 RTSP/1.0\r\nCSeq: 3\r\nTransport: RTP/AVP/TCP;unicast;interleaved=0-1\r\nSession: {}\r\n\r\n",
            base, sid
        ),
    );
    let setup = read_response(&mut stream);
    assert!(setup.starts_with("RTSP/1.0 200 OK"), "{}", setup);
    let transport = header_value(&setup, "Transport").expect("transport");
    assert!(transport.starts_with("RTP/AVP/TCP;unicast;interleaved=0-1;ssrc="), "{}", transport);
    assert_eq!(session_id(&setup), sid, "session id constant after assignment");

    // S5: PLAY carries RTP-Info and a Range anchored at the live edge.
    send(
        &mut stream,
        &format!("PLAY {} RTSP/1.0\r\nCSeq: 4\r\nSession: {}\r\n\r\n", base, sid),
    );
    let play = read_response(&mut stream);
    assert!(play.starts_with("RTSP/1.0 200 OK"), "{}", play);
    assert_eq!(header_value(&play, "Range"), Some("npt=0.00"));
    let rtp_info = header_value(&play, "RTP-Info").expect("rtp-info");
    assert!(rtp_info.starts_with(&format!("url={}/trackID=0;seq=", base)), "{}", rtp_info);
    assert!(rtp_info.contains(";rtptime="), "{}", rtp_info);

    send(
        &mut stream,
        &format!("TEARDOWN {} RTSP/1.0\r\nCSeq: 5\r\nSession: {}\r\n\r\n", base, sid),
    );
    let teardown = read_response(&mut stream);
    assert!(teardown.starts_with("RTSP/1.0 200 OK"), "{}", teardown);

    // The server closes after TEARDOWN.
    let mut byte = [0u8; 1];
    assert_eq!(stream.read(&mut byte).unwrap_or(0), 0, "connection closed");
}

#[test]
fn mismatched_session_id_gets_454() {
    let server = start_server(18604, quick_wait_config(), EventHooks::default());
    let _src = register_test_source(server.context());

    let base = "rtsp://127.0.0.1:18604/live/cam1";
    let mut stream = connect(18604);
    send(&mut stream, &format!("DESCRIBE {} RTSP/1.0\r\nCSeq: 1\r\n\r\n", base));
    let _ = read_response(&mut stream);

    send(
        &mut stream,
        &format!("PLAY {} RTSP/1.0\r\nCSeq: 2\r\nSession: WRONGSESSION\r\n\r\n", base),
    );
    let resp = read_response(&mut stream);
    assert!(resp.starts_with("RTSP/1.0 454 Session Not Found"), "{}", resp);
    assert_eq!(header_value(&resp, "Connection"), Some("Close"));
}

#[test]
fn duplicate_track_setup_fails_the_connection() {
    let server = start_server(18605, quick_wait_config(), EventHooks::default());
    let _src = register_test_source(server.context());

    let base = "rtsp://127.0.0.1:18605/live/cam1";
    let mut stream = connect(18605);
    send(&mut stream, &format!("DESCRIBE {} RTSP/1.0\r\nCSeq: 1\r\n\r\n", base));
    let sid = session_id(&read_response(&mut stream));

    let setup = format!(
        "SETUP {}/trackID=0 RTSP/1.0\r\nCSeq: 2\r\nTransport: RTP/AVP/TCP;unicast;interleaved=0-1\r\nSession: {}\r\n\r\n",
        base, sid
    );
    send(&mut stream, &setup);
    assert!(read_response(&mut stream).starts_with("RTSP/1.0 200 OK"));

    // Second SETUP on the same track: no reply, connection dies.
    send(&mut stream, &setup.replace("CSeq: 2", "CSeq: 3"));
    let resp = read_response(&mut stream);
    assert!(!resp.contains("200 OK"), "second setup must not succeed: {}", resp);
}

#[test]
fn forced_transport_rejects_mismatch_with_461() {
    let config = ServerConfig {
        forced_transport: Some(rtsp_relay::session::transport::TransportKind::Udp),
        ..quick_wait_config()
    };
    let server = start_server(18606, config, EventHooks::default());
    let _src = register_test_source(server.context());

    let base = "rtsp://127.0.0.1:18606/live/cam1";
    let mut stream = connect(18606);
    send(&mut stream, &format!("DESCRIBE {} RTSP/1.0\r\nCSeq: 1\r\n\r\n", base));
    let sid = session_id(&read_response(&mut stream));

    send(
        &mut stream,
        &format!(
            "SETUP {}/trackID=0 RTSP/1.0\r\nCSeq: 2\r\nTransport: RTP/AVP/TCP;unicast;interleaved=0-1\r\nSession: {}\r\n\r\n",
            base, sid
        ),
    );
    let resp = read_response(&mut stream);
    assert!(resp.starts_with("RTSP/1.0 461 Unsupported Transport"), "{}", resp);
    assert_eq!(header_value(&resp, "Connection"), Some("Close"));
}

#[test]
fn describe_unknown_stream_times_out_with_404() {
    let server = start_server(18607, quick_wait_config(), EventHooks::default());
    let _ = server.is_running();

    let mut stream = connect(18607);
    send(
        &mut stream,
        "DESCRIBE rtsp://127.0.0.1:18607/live/absent RTSP/1.0\r\nCSeq: 1\r\n\r\n",
    );
    let resp = read_response(&mut stream);
    assert!(resp.starts_with("RTSP/1.0 404 Stream Not Found"), "{}", resp);
    assert_eq!(header_value(&resp, "Connection"), Some("Close"));
}

/// Publisher pushes interleaved RTP; a player on a second connection
/// receives an SR (NTP anchor first), an SDES, then the RTP frame.
#[test]
fn publisher_to_player_relay_over_tcp() {
    let server = start_server(18608, quick_wait_config(), EventHooks::default());
    let _ = server.context();

    let base = "rtsp://127.0.0.1:18608/live/cam1";

    // Publisher handshake.
    let mut pusher = connect(18608);
    send(
        &mut pusher,
        &format!(
            "ANNOUNCE {} RTSP/1.0\r\nCSeq: 1\r\nContent-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{}",
            base,
            SDP.len(),
            SDP
        ),
    );
    let announce = read_response(&mut pusher);
    assert!(announce.starts_with("RTSP/1.0 200 OK"), "{}", announce);
    let push_sid = session_id(&announce);

    send(
        &mut pusher,
        &format!(
            "SETUP {}/trackID=0 RTSP/1.0\r\nCSeq: 2\r\nTransport: RTP/AVP/TCP;unicast;interleaved=0-1\r\nSession: {}\r\n\r\n",
            base, push_sid
        ),
    );
    assert!(read_response(&mut pusher).starts_with("RTSP/1.0 200 OK"));

    send(
        &mut pusher,
        &format!("RECORD {} RTSP/1.0\r\nCSeq: 3\r\nRange: npt=0.000-\r\nSession: {}\r\n\r\n", base, push_sid),
    );
    let record = read_response(&mut pusher);
    assert!(record.starts_with("RTSP/1.0 200 OK"), "{}", record);
    assert!(header_value(&record, "RTP-Info").unwrap().contains("trackID=0"));

    // Player handshake.
    let mut player = connect(18608);
    send(&mut player, &format!("DESCRIBE {} RTSP/1.0\r\nCSeq: 1\r\n\r\n", base));
    let describe = read_response(&mut player);
    assert!(describe.starts_with("RTSP/1.0 200 OK"), "{}", describe);
    let play_sid = session_id(&describe);
    assert_ne!(play_sid, push_sid);

    send(
        &mut player,
        &format!(
            "SETUP {}/trackID=0 RTSP/1.0\r\nCSeq: 2\r\nTransport: RTP/AVP/TCP;unicast;interleaved=0-1\r\nSession: {}\r\n\r\n",
            base, play_sid
        ),
    );
    assert!(read_response(&mut player).starts_with("RTSP/1.0 200 OK"));
    send(
        &mut player,
        &format!("PLAY {} RTSP/1.0\r\nCSeq: 3\r\nSession: {}\r\n\r\n", base, play_sid),
    );
    assert!(read_response(&mut player).starts_with("RTSP/1.0 200 OK"));
    // The PLAY reply is written before the ring attach; give the player
    // session a moment to finish attaching.
    std::thread::sleep(Duration::from_millis(200));

    // Push one RTP packet through the pusher's interleaved channel 0.
    let mut rtp = vec![0x80u8, 0x60, 0x00, 0x07]; // V=2, PT=96, seq=7
    rtp.extend_from_slice(&3000u32.to_be_bytes()); // timestamp
    rtp.extend_from_slice(&0xCAFEBABEu32.to_be_bytes()); // ssrc
    rtp.extend_from_slice(b"payload");
    let mut frame = vec![0x24, 0, 0, rtp.len() as u8];
    frame.extend_from_slice(&rtp);
    pusher.write_all(&frame).unwrap();

    // The player sees the forced SR + SDES on channel 1, then the RTP
    // packet on channel 0, unchanged.
    let (ch, sr) = read_frame(&mut player);
    assert_eq!(ch, 1);
    assert_eq!(sr[1], 200, "sender report first");
    let (ch, sdes) = read_frame(&mut player);
    assert_eq!(ch, 1);
    assert_eq!(sdes[1], 202, "sdes follows the sr");
    let (ch, relayed) = read_frame(&mut player);
    assert_eq!(ch, 0);
    assert_eq!(relayed, rtp, "rtp relayed verbatim");
}

/// S6 plus the at-most-one-publisher invariant: a second concurrent
/// ANNOUNCE is refused with 406, but after a network drop the pusher
/// re-acquires the stream within the grace window.
#[test]
fn s6_publisher_conflict_and_reconnect() {
    let config = ServerConfig {
        continue_push_ms: 3_000,
        ..quick_wait_config()
    };
    let server = start_server(18609, config, EventHooks::default());
    let _ = server.context();

    let base = "rtsp://127.0.0.1:18609/live/cam1";
    let announce = |cseq: u32| {
        format!(
            "ANNOUNCE {} RTSP/1.0\r\nCSeq: {}\r\nContent-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{}",
            base,
            cseq,
            SDP.len(),
            SDP
        )
    };

    let mut first = connect(18609);
    send(&mut first, &announce(1));
    assert!(read_response(&mut first).starts_with("RTSP/1.0 200 OK"));

    // Concurrent second publisher: 406.
    let mut second = connect(18609);
    send(&mut second, &announce(1));
    let resp = read_response(&mut second);
    assert!(resp.starts_with("RTSP/1.0 406 Not Acceptable"), "{}", resp);

    // Network drop (no TEARDOWN), then reconnect inside the grace.
    drop(first);
    std::thread::sleep(Duration::from_millis(300));

    let mut third = connect(18609);
    send(&mut third, &announce(1));
    let resp = read_response(&mut third);
    assert!(
        resp.starts_with("RTSP/1.0 200 OK"),
        "reconnect within grace must succeed: {}",
        resp
    );
}

/// HTTP tunnel: RTSP requests base64-fed through a POST reach the getter
/// session, whose socket carries the replies.
#[test]
fn http_tunnel_pairs_getter_and_poster() {
    let server = start_server(18610, quick_wait_config(), EventHooks::default());
    let _src = register_test_source(server.context());

    let mut getter = connect(18610);
    send(
        &mut getter,
        "GET /live/cam1 HTTP/1.0\r\nx-sessioncookie: tunnel-0001\r\nAccept: application/x-rtsp-tunnelled\r\n\r\n",
    );
    let resp = read_response(&mut getter);
    assert!(resp.starts_with("HTTP/1.0 200 OK"), "{}", resp);
    assert_eq!(header_value(&resp, "Content-Type"), Some("application/x-rtsp-tunnelled"));
    assert_eq!(header_value(&resp, "Cache-Control"), Some("no-store"));
    assert_eq!(header_value(&resp, "Pragma"), Some("no-store"));

    let mut poster = connect(18610);
    send(
        &mut poster,
        "POST /live/cam1 HTTP/1.0\r\nx-sessioncookie: tunnel-0001\r\nContent-Length: 32767\r\n\r\n",
    );
    let resp = read_response(&mut poster);
    assert!(resp.starts_with("HTTP/1.0 200 OK"), "{}", resp);

    // Feed an OPTIONS request through the tunnel, split mid-quantum.
    let encoded = base64::engine::general_purpose::STANDARD
        .encode("OPTIONS rtsp://127.0.0.1:18610/live/cam1 RTSP/1.0\r\nCSeq: 9\r\n\r\n");
    let (a, b) = encoded.split_at(encoded.len() / 2 + 1);
    poster.write_all(a.as_bytes()).unwrap();
    poster.flush().unwrap();
    std::thread::sleep(Duration::from_millis(100));
    poster.write_all(b.as_bytes()).unwrap();

    // The reply arrives on the getter connection.
    let resp = read_response(&mut getter);
    assert!(resp.starts_with("RTSP/1.0 200 OK"), "{}", resp);
    assert!(resp.contains("CSeq: 9\r\n"), "{}", resp);
    assert!(resp.contains("Public:"), "{}", resp);
}

#[test]
fn unknown_method_gets_403_and_close() {
    let server = start_server(18611, quick_wait_config(), EventHooks::default());
    let _ = server.is_running();

    let mut stream = connect(18611);
    send(
        &mut stream,
        "FROBNICATE rtsp://127.0.0.1:18611/live/cam1 RTSP/1.0\r\nCSeq: 1\r\n\r\n",
    );
    let resp = read_response(&mut stream);
    assert!(resp.starts_with("RTSP/1.0 403 Forbidden"), "{}", resp);

    let mut byte = [0u8; 1];
    assert_eq!(stream.read(&mut byte).unwrap_or(0), 0, "connection closed");
}

#[test]
fn get_parameter_is_a_keepalive_noop() {
    let server = start_server(18612, quick_wait_config(), EventHooks::default());
    let _src = register_test_source(server.context());

    let base = "rtsp://127.0.0.1:18612/live/cam1";
    let mut stream = connect(18612);
    send(&mut stream, &format!("DESCRIBE {} RTSP/1.0\r\nCSeq: 1\r\n\r\n", base));
    let sid = session_id(&read_response(&mut stream));

    send(
        &mut stream,
        &format!("GET_PARAMETER {} RTSP/1.0\r\nCSeq: 2\r\nSession: {}\r\n\r\n", base, sid),
    );
    let resp = read_response(&mut stream);
    assert!(resp.starts_with("RTSP/1.0 200 OK"), "{}", resp);
    assert_eq!(session_id(&resp), sid);
}
