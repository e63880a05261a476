mod common;

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::common::{description, eventually, packet, RawConn, TestServer};
    use pretty_assertions::assert_eq;
    use rtspio::format::rtp::RTPPacket;
    use rtspio::format::rtsp::server::{ServerConfig, SessionState};
    use rtspio::format::rtsp::{Method, Request, SessionDescription, StatusCode, TransportHeader};

    fn announce(url: &str, description: &SessionDescription) -> Request {
        Request::new(Method::Announce, url).with_body("application/sdp", description.marshal())
    }

    #[tokio::test]
    async fn test_options() {
        let server = TestServer::start(ServerConfig::default()).await;
        let mut conn = RawConn::connect(server.addr).await;

        let res = conn.request(Request::new(Method::Options, "*")).await;
        assert_eq!(res.status, StatusCode::OK);
        let public = res.headers.get("Public").unwrap();
        for method in ["DESCRIBE", "SETUP", "PLAY", "RECORD", "TEARDOWN"] {
            assert!(public.contains(method), "{} missing from {}", method, public);
        }
        assert!(res.headers.contains("Server"));
        assert!(res.headers.contains("Date"));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_session_required() {
        let server = TestServer::start(ServerConfig::default()).await;
        let mut conn = RawConn::connect(server.addr).await;
        let url = server.url("live");

        let res = conn.request(Request::new(Method::Play, url.as_str())).await;
        assert_eq!(res.status, StatusCode::SESSION_NOT_FOUND);

        let res = conn
            .request(Request::new(Method::Play, url.as_str()).with_header("Session", "0123456789ABCDEF"))
            .await;
        assert_eq!(res.status, StatusCode::SESSION_NOT_FOUND);

        let res = conn.request(Request::new(Method::Describe, url.as_str())).await;
        assert_eq!(res.status, StatusCode::NOT_FOUND);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_announce_setup_record() {
        let server = TestServer::start(ServerConfig::default()).await;
        let mut conn = RawConn::connect(server.addr).await;
        let url = server.url("pub");

        let res = conn.request(announce(&url, &description(1))).await;
        assert_eq!(res.status, StatusCode::OK);
        let id = res.headers.session_id().unwrap().to_string();
        assert!(res.headers.get("Session").unwrap().contains(";timeout=60"));
        let session = server.handle.session(&id).unwrap();
        assert_eq!(session.state(), SessionState::PreRecord);

        let res = conn
            .request(
                Request::new(Method::Setup, format!("{}/trackID=0", url))
                    .with_header("Session", id.as_str())
                    .with_header("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1;mode=record"),
            )
            .await;
        assert_eq!(res.status, StatusCode::OK);
        let reply = TransportHeader::parse(res.headers.get("Transport").unwrap()).unwrap();
        assert_eq!(reply.interleaved, Some((0, 1)));
        assert_eq!(session.state(), SessionState::PreRecord);

        let res = conn
            .request(Request::new(Method::Record, url.as_str()).with_header("Session", id.as_str()))
            .await;
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(session.state(), SessionState::Recording);

        let res = conn
            .request(announce(&url, &description(1)).with_header("Session", id.as_str()))
            .await;
        assert_eq!(res.status, StatusCode::METHOD_NOT_VALID_IN_THIS_STATE);
        assert_eq!(session.state(), SessionState::Recording);

        conn.send_frame(0, &packet(7).marshal().unwrap()).await;
        conn.send_frame(0, &packet(8).marshal().unwrap()).await;
        let state = server.state.clone();
        assert!(eventually(|| state.recorded.lock().len() == 2).await);
        assert_eq!(*server.state.recorded.lock(), vec![(0, 7), (0, 8)]);

        let res = conn
            .request(Request::new(Method::Teardown, url.as_str()).with_header("Session", id.as_str()))
            .await;
        assert_eq!(res.status, StatusCode::OK);
        assert!(server.handle.session(&id).is_none());
        assert!(session.is_closed());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_announce_rejects_missing_sdp() {
        let server = TestServer::start(ServerConfig::default()).await;
        let mut conn = RawConn::connect(server.addr).await;

        let req = Request::new(Method::Announce, server.url("pub")).with_body("text/plain", "hello");
        let res = conn.request(req).await;
        assert_eq!(res.status, StatusCode::BAD_REQUEST);
        assert!(server.handle.sessions().is_empty());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_record_needs_every_media() {
        let server = TestServer::start(ServerConfig::default()).await;
        let mut conn = RawConn::connect(server.addr).await;
        let url = server.url("pub");

        let res = conn.request(announce(&url, &description(2))).await;
        let id = res.headers.session_id().unwrap().to_string();

        let res = conn
            .request(
                Request::new(Method::Setup, format!("{}/trackID=1", url))
                    .with_header("Session", id.as_str())
                    .with_header("Transport", "RTP/AVP/TCP;unicast;mode=record"),
            )
            .await;
        assert_eq!(res.status, StatusCode::OK);

        let res = conn
            .request(Request::new(Method::Record, url.as_str()).with_header("Session", id.as_str()))
            .await;
        assert_eq!(res.status, StatusCode::METHOD_NOT_VALID_IN_THIS_STATE);
        assert_eq!(server.handle.session(&id).unwrap().state(), SessionState::PreRecord);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_read_over_interleaved_tcp() {
        let server = TestServer::start(ServerConfig::default()).await;
        let stream = server.state.publish("cam", description(2));
        let mut conn = RawConn::connect(server.addr).await;
        let url = server.url("cam");

        let res = conn.request(Request::new(Method::Describe, url.as_str())).await;
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(res.headers.get("Content-Base"), Some(format!("{}/", url).as_str()));
        let sdp = SessionDescription::parse(std::str::from_utf8(&res.body).unwrap()).unwrap();
        assert_eq!(sdp.media.len(), 2);
        assert_eq!(sdp.media[1].control(), Some("trackID=1"));

        let res = conn
            .request(
                Request::new(Method::Setup, format!("{}/trackID=0", url))
                    .with_header("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1"),
            )
            .await;
        assert_eq!(res.status, StatusCode::OK);
        let id = res.headers.session_id().unwrap().to_string();

        // the same media twice is refused
        let res = conn
            .request(
                Request::new(Method::Setup, format!("{}/trackID=0", url))
                    .with_header("Session", id.as_str())
                    .with_header("Transport", "RTP/AVP/TCP;unicast;interleaved=4-5"),
            )
            .await;
        assert_eq!(res.status, StatusCode::BAD_REQUEST);

        let res = conn
            .request(
                Request::new(Method::Setup, format!("{}/trackID=1", url))
                    .with_header("Session", id.as_str())
                    .with_header("Transport", "RTP/AVP/TCP;unicast;interleaved=2-3"),
            )
            .await;
        assert_eq!(res.status, StatusCode::OK);

        // a publishing method on a reading session
        let res = conn
            .request(Request::new(Method::Record, url.as_str()).with_header("Session", id.as_str()))
            .await;
        assert_eq!(res.status, StatusCode::METHOD_NOT_VALID_IN_THIS_STATE);

        let res = conn
            .request(Request::new(Method::Play, url.as_str()).with_header("Session", id.as_str()))
            .await;
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(stream.reader_count(), 1);

        for seq in 0..5u16 {
            stream.write_packet_rtp((seq % 2) as usize, &packet(seq)).unwrap();
        }
        for seq in 0..5u16 {
            let frame = conn.next_frame().await;
            assert_eq!(frame.channel, if seq % 2 == 0 { 0 } else { 2 });
            assert_eq!(RTPPacket::parse(&frame.payload).unwrap().sequence_number, seq);
        }

        let res = conn
            .request(Request::new(Method::Pause, url.as_str()).with_header("Session", id.as_str()))
            .await;
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(stream.reader_count(), 0);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_unsupported_transports() {
        let server = TestServer::start(ServerConfig::default()).await;
        server.state.publish("cam", description(1));
        let mut conn = RawConn::connect(server.addr).await;
        let url = format!("{}/trackID=0", server.url("cam"));

        let res = conn
            .request(
                Request::new(Method::Setup, url.as_str())
                    .with_header("Transport", "RTP/AVP;unicast;client_port=5000-5001"),
            )
            .await;
        assert_eq!(res.status, StatusCode::UNSUPPORTED_TRANSPORT);

        let res = conn
            .request(Request::new(Method::Setup, url.as_str()).with_header("Transport", "RTP/AVP;multicast"))
            .await;
        assert_eq!(res.status, StatusCode::UNSUPPORTED_TRANSPORT);

        let res = conn.request(Request::new(Method::Setup, url.as_str())).await;
        assert_eq!(res.status, StatusCode::BAD_REQUEST);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_connection_loss_closes_tcp_sessions() {
        let server = TestServer::start(ServerConfig::default()).await;
        server.state.publish("cam", description(1));

        let id = {
            let mut conn = RawConn::connect(server.addr).await;
            let res = conn
                .request(
                    Request::new(Method::Setup, format!("{}/trackID=0", server.url("cam")))
                        .with_header("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1"),
                )
                .await;
            assert_eq!(res.status, StatusCode::OK);
            res.headers.session_id().unwrap().to_string()
        };

        let handle = server.handle.clone();
        assert!(eventually(|| handle.session(&id).is_none()).await);
        let state = server.state.clone();
        assert!(eventually(|| state.closed_sessions.lock().contains(&id)).await);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_stream_close_ends_readers() {
        let server = TestServer::start(ServerConfig::default()).await;
        let stream = server.state.publish("cam", description(1));
        let mut conn = RawConn::connect(server.addr).await;
        let url = server.url("cam");

        let res = conn
            .request(
                Request::new(Method::Setup, format!("{}/trackID=0", url))
                    .with_header("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1"),
            )
            .await;
        let id = res.headers.session_id().unwrap().to_string();
        let res = conn
            .request(Request::new(Method::Play, url.as_str()).with_header("Session", id.as_str()))
            .await;
        assert_eq!(res.status, StatusCode::OK);

        stream.close();
        assert!(stream.write_packet_rtp(0, &packet(1)).is_err());
        assert!(server.handle.session(&id).is_none());

        // interleaved packets can't flow anymore, so the connection ends
        assert!(conn.closed_by_peer().await);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_method_not_implemented() {
        let server = TestServer::start(ServerConfig::default()).await;
        let mut conn = RawConn::connect(server.addr).await;

        let res = conn
            .request(Request::new(Method::Other("FLUSH".into()), server.url("cam")))
            .await;
        assert_eq!(res.status, StatusCode::NOT_IMPLEMENTED);

        // the connection stays usable
        let res = conn.request(Request::new(Method::Options, "*")).await;
        assert_eq!(res.status, StatusCode::OK);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_refused_requests_keep_session_state() {
        let server = TestServer::start(ServerConfig::default()).await;
        let stream = server.state.publish("cam", description(1));
        let mut conn = RawConn::connect(server.addr).await;
        let url = server.url("cam");

        let res = conn
            .request(
                Request::new(Method::Setup, format!("{}/trackID=0", url))
                    .with_header("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1"),
            )
            .await;
        let id = res.headers.session_id().unwrap().to_string();
        let session = server.handle.session(&id).unwrap();

        // handler answers 404
        let res = conn
            .request(
                Request::new(Method::Setup, format!("{}/trackID=0", server.url("elsewhere")))
                    .with_header("Session", id.as_str())
                    .with_header("Transport", "RTP/AVP/TCP;unicast;interleaved=2-3"),
            )
            .await;
        assert_eq!(res.status, StatusCode::NOT_FOUND);
        assert_eq!(session.state(), SessionState::PreRead);
        assert_eq!(session.setup_medias(), vec![0]);

        // handler fails
        server.state.refuse_play.store(true, Ordering::SeqCst);
        let res = conn
            .request(Request::new(Method::Play, url.as_str()).with_header("Session", id.as_str()))
            .await;
        assert_eq!(res.status, StatusCode::BAD_REQUEST);
        assert_eq!(session.state(), SessionState::PreRead);
        assert_eq!(stream.reader_count(), 0);

        server.state.refuse_play.store(false, Ordering::SeqCst);
        let res = conn
            .request(Request::new(Method::Play, url.as_str()).with_header("Session", id.as_str()))
            .await;
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(session.state(), SessionState::Playing);
        assert_eq!(stream.reader_count(), 1);

        server.stop().await;
    }

    fn udp_config() -> ServerConfig {
        ServerConfig {
            udp_rtp_address: Some("127.0.0.1:0".into()),
            udp_rtcp_address: Some("127.0.0.1:0".into()),
            session_timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }

    async fn setup_udp(server: &TestServer, ports: &str) -> String {
        let mut conn = RawConn::connect(server.addr).await;
        let res = conn
            .request(
                Request::new(Method::Setup, format!("{}/trackID=0", server.url("cam")))
                    .with_header("Transport", format!("RTP/AVP;unicast;client_port={}", ports)),
            )
            .await;
        assert_eq!(res.status, StatusCode::OK);
        res.headers.session_id().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_detached_udp_session_is_reaped() {
        let server = TestServer::start(udp_config()).await;
        server.state.publish("cam", description(1));

        let id = setup_udp(&server, "41000-41001").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let session = server.handle.session(&id).expect("detached session survives its connection");
        assert_eq!(session.state(), SessionState::PreRead);

        let handle = server.handle.clone();
        assert!(eventually(|| handle.session(&id).is_none()).await);
        assert!(session.is_closed());
        let state = server.state.clone();
        assert!(eventually(|| state.closed_sessions.lock().contains(&id)).await);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_detached_udp_session_resumes() {
        let server = TestServer::start(udp_config()).await;
        let stream = server.state.publish("cam", description(1));

        let id = setup_udp(&server, "41002-41003").await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut conn = RawConn::connect(server.addr).await;
        let url = server.url("cam");
        let res = conn
            .request(Request::new(Method::Play, url.as_str()).with_header("Session", id.as_str()))
            .await;
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(res.headers.session_id(), Some(id.as_str()));
        assert_eq!(stream.reader_count(), 1);

        // owned again: outlives the session timeout while the client keeps talking
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(250)).await;
            let res = conn
                .request(Request::new(Method::GetParameter, url.as_str()).with_header("Session", id.as_str()))
                .await;
            assert_eq!(res.status, StatusCode::OK);
        }
        assert!(server.handle.session(&id).is_some());

        let res = conn
            .request(Request::new(Method::Teardown, url.as_str()).with_header("Session", id.as_str()))
            .await;
        assert_eq!(res.status, StatusCode::OK);
        assert!(server.handle.session(&id).is_none());

        server.stop().await;
    }
}
