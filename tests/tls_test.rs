mod common;

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use futures::FutureExt;
    use parking_lot::Mutex;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
    use tokio::net::TcpStream;

    use super::common::{description, eventually, packet, TestServer};
    use rtspio::format::rtsp::dial::DialFn;
    use rtspio::format::rtsp::server::ServerConfig;
    use rtspio::format::rtsp::{Client, ClientOptions, Transport};

    fn tls_configs() -> (Arc<rustls::ServerConfig>, Arc<rustls::ClientConfig>) {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_der: CertificateDer<'static> = cert.der().clone();
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let server = rustls::ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der.clone()], key_der)
            .unwrap();

        let mut roots = rustls::RootCertStore::empty();
        roots.add(cert_der).unwrap();
        let client = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();

        (Arc::new(server), Arc::new(client))
    }

    /// Connects every address to the test server.
    fn pinned_dialer(addr: SocketAddr) -> DialFn {
        Arc::new(move |_host: String| async move { TcpStream::connect(addr).await }.boxed())
    }

    #[tokio::test]
    async fn test_read_over_rtsps() {
        let (server_tls, client_tls) = tls_configs();
        let server = TestServer::start(ServerConfig {
            tls_config: Some(server_tls),
            ..Default::default()
        })
        .await;
        let stream = server.state.publish("cam", description(1));

        // rtsps only carries interleaved media
        let mut client = Client::new(
            ClientOptions::new()
                .with_tls_config(client_tls)
                .with_dialer(pinned_dialer(server.addr)),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        client.on_packet_rtp_any(move |media, pkt| s.lock().push((media, pkt.sequence_number)));

        let url = format!("rtsps://localhost:{}/cam", server.addr.port());
        client.start_reading(&url).await.unwrap();
        assert_eq!(client.transport(), Some(Transport::Tcp));
        assert_eq!(client.session_transport(), Some(Transport::Tcp));

        for seq in 0..5u16 {
            stream.write_packet_rtp(0, &packet(seq)).unwrap();
        }
        let s = seen.clone();
        assert!(eventually(|| s.lock().len() == 5).await);
        assert_eq!(*seen.lock(), (0..5u16).map(|seq| (0, seq)).collect::<Vec<_>>());

        client.close().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_plain_client_fails_against_tls_server() {
        let (server_tls, _) = tls_configs();
        let server = TestServer::start(ServerConfig {
            tls_config: Some(server_tls),
            read_timeout: Duration::from_secs(1),
            ..Default::default()
        })
        .await;
        server.state.publish("cam", description(1));

        let mut client = Client::new(ClientOptions::new().with_read_timeout(Duration::from_secs(2)));
        assert!(client.start_reading(&server.url("cam")).await.is_err());

        server.stop().await;
    }

    #[test]
    fn test_tls_excludes_udp() {
        let (server_tls, _) = tls_configs();
        let config = ServerConfig {
            tls_config: Some(server_tls),
            udp_rtp_address: Some("127.0.0.1:0".into()),
            udp_rtcp_address: Some("127.0.0.1:0".into()),
            ..Default::default()
        };
        struct Nothing;
        impl rtspio::format::rtsp::ServerHandler for Nothing {}
        assert!(rtspio::format::rtsp::Server::new(config, Nothing).is_err());
    }
}
