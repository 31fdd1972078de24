use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use cyfr_server::api::{serve_on, AppState};
use cyfr_server::{spawn_hub, RelayHub, ServerConfig};
use cyfr_shared::protocol::{ClientEnvelope, ServerEnvelope, SignalKind};
use cyfr_shared::PeerId;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_relay(max_peers: usize) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = ServerConfig {
        max_peers,
        ..ServerConfig::default()
    };
    let state = AppState {
        hub: spawn_hub(RelayHub::new(max_peers)),
        config: Arc::new(config),
    };
    tokio::spawn(serve_on(listener, state));
    addr
}

struct TestPeer {
    socket: Socket,
    id: PeerId,
    welcome_peers: Vec<PeerId>,
}

impl TestPeer {
    async fn connect(addr: SocketAddr) -> Self {
        let (socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .unwrap();
        let mut peer = Self {
            socket,
            id: PeerId::from(""),
            welcome_peers: Vec::new(),
        };
        match peer.recv().await {
            ServerEnvelope::Welcome { peer_id, peers } => {
                peer.id = peer_id;
                peer.welcome_peers = peers;
            }
            other => panic!("expected welcome, got {other:?}"),
        }
        peer
    }

    async fn send(&mut self, envelope: ClientEnvelope) {
        self.send_text(envelope.to_json().unwrap()).await;
    }

    async fn send_text(&mut self, text: String) {
        self.socket.send(Message::Text(text)).await.unwrap();
    }

    async fn recv(&mut self) -> ServerEnvelope {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.socket.next())
                .await
                .expect("timed out waiting for relay")
                .expect("relay closed the socket")
                .unwrap();
            if let Message::Text(text) = frame {
                return ServerEnvelope::from_json(&text).unwrap();
            }
        }
    }

    async fn expect_silence(&mut self) {
        let next = tokio::time::timeout(Duration::from_millis(200), self.socket.next()).await;
        assert!(next.is_err(), "unexpected frame: {next:?}");
    }
}

#[tokio::test]
async fn test_join_sequence() {
    let addr = start_relay(0).await;

    let mut a = TestPeer::connect(addr).await;
    assert!(a.welcome_peers.is_empty());

    let b = TestPeer::connect(addr).await;
    assert_eq!(b.welcome_peers, vec![a.id.clone()]);

    assert_eq!(a.recv().await, ServerEnvelope::PeerJoined { peer_id: b.id.clone() });
}

#[tokio::test]
async fn test_offer_is_forwarded_verbatim() {
    let addr = start_relay(0).await;
    let mut a = TestPeer::connect(addr).await;
    let mut b = TestPeer::connect(addr).await;
    a.recv().await; // peer-joined

    let offer = json!({"type": "offer", "sdp": "v=0\r\no=- 1 2 IN IP4 0.0.0.0\r\n"});
    a.send(ClientEnvelope::signal(SignalKind::Offer, b.id.clone(), offer.clone()))
        .await;

    let (kind, from, payload) = b.recv().await.into_signal().unwrap();
    assert_eq!(kind, SignalKind::Offer);
    assert_eq!(from, a.id);
    assert_eq!(payload, offer);
}

#[tokio::test]
async fn test_bad_envelopes_do_not_kill_the_link() {
    let addr = start_relay(0).await;
    let mut a = TestPeer::connect(addr).await;
    let mut b = TestPeer::connect(addr).await;
    a.recv().await;

    a.send_text(r#"{"type":"teleport"}"#.into()).await;
    a.send_text("{not json".into()).await;
    a.send(ClientEnvelope::Chat {
        message: "still here".into(),
    })
    .await;

    match b.recv().await {
        ServerEnvelope::Chat {
            from_peer_id,
            username,
            message,
            ..
        } => {
            assert_eq!(from_peer_id, a.id);
            assert_eq!(username, a.id.to_string());
            assert_eq!(message, "still here");
        }
        other => panic!("expected chat, got {other:?}"),
    }
    a.expect_silence().await;
}

#[tokio::test]
async fn test_rename_and_peer_list() {
    let addr = start_relay(0).await;
    let mut a = TestPeer::connect(addr).await;
    let mut b = TestPeer::connect(addr).await;
    a.recv().await;

    b.send(ClientEnvelope::SetUsername {
        username: "bob".into(),
    })
    .await;
    assert_eq!(
        a.recv().await,
        ServerEnvelope::PeerUpdated {
            peer_id: b.id.clone(),
            username: "bob".into(),
        }
    );

    a.send(ClientEnvelope::GetPeers).await;
    match a.recv().await {
        ServerEnvelope::PeerList { peers } => {
            assert_eq!(peers.len(), 1);
            assert_eq!(peers[0].peer_id, b.id);
            assert_eq!(peers[0].username.as_deref(), Some("bob"));
        }
        other => panic!("expected peer-list, got {other:?}"),
    }
}

#[tokio::test]
async fn test_disconnect_announces_leave_once() {
    let addr = start_relay(0).await;
    let mut c = TestPeer::connect(addr).await;
    let mut d = TestPeer::connect(addr).await;
    c.recv().await;

    d.send(ClientEnvelope::signal(
        SignalKind::Offer,
        c.id.clone(),
        json!({"sdp": "x"}),
    ))
    .await;
    c.recv().await;

    let c_id = c.id.clone();
    c.socket.close(None).await.unwrap();
    drop(c);

    assert_eq!(d.recv().await, ServerEnvelope::PeerLeft { peer_id: c_id });
    d.expect_silence().await;
}

#[tokio::test]
async fn test_full_relay_refuses_upgrade() {
    let addr = start_relay(1).await;
    let _a = TestPeer::connect(addr).await;

    let result = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await;
    assert!(result.is_err(), "second peer should be refused");
}
