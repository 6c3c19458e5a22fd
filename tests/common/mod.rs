//! Shared helpers for driving a broker through in-process connections

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;

use tidemq::broker::{Broker, Outbound, TransportLink};
use tidemq::config::Config;
use tidemq::persistence::{DurableStore, MemoryStore};
use tidemq::protocol::{
    ConnAck, Connect, Packet, Publish, QoS, SubAck, Subscribe, SubscribeFilter, Will,
};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);
pub const QUIET_PERIOD: Duration = Duration::from_millis(200);

pub async fn start_broker() -> Arc<Broker> {
    start_with_config(Config::default()).await
}

pub async fn start_with_config(config: Config) -> Arc<Broker> {
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    Broker::start(&config, store).await.unwrap()
}

/// A broker joined to the cluster carried by `store`
pub async fn start_cluster_node(store: Arc<dyn DurableStore>, node_id: &str) -> Arc<Broker> {
    let mut config = Config::default();
    config.cluster.enabled = true;
    config.cluster.node_id = Some(node_id.to_string());
    Broker::start(&config, store).await.unwrap()
}

/// Wait until a condition holds, polling
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until `count` subscriptions on a broker match `topic`
pub async fn wait_for_subscribers(broker: &Broker, topic: &str, count: usize) {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    loop {
        let matched = broker.registry().match_subscribers(topic).await.unwrap();
        if matched.len() == count {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "expected {} subscribers for '{}', have {}",
            count,
            topic,
            matched.len()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Test-side MQTT client speaking decoded packets
pub struct TestClient {
    link: TransportLink,
}

impl TestClient {
    pub fn attach(broker: &Arc<Broker>) -> Self {
        Self {
            link: broker.attach(),
        }
    }

    /// Attach and complete a CONNECT handshake
    pub async fn connect(broker: &Arc<Broker>, client_id: &str, clean_session: bool) -> Self {
        let mut client = Self::attach(broker);
        let ack = client
            .handshake(Connect {
                client_id: client_id.to_string(),
                clean_session,
                ..Default::default()
            })
            .await;
        assert_eq!(ack, ConnAck::accepted(ack.session_present));
        client
    }

    pub async fn connect_with_will(broker: &Arc<Broker>, client_id: &str, will: Will) -> Self {
        let mut client = Self::attach(broker);
        let ack = client
            .handshake(Connect {
                client_id: client_id.to_string(),
                will: Some(will),
                ..Default::default()
            })
            .await;
        assert_eq!(ack, ConnAck::accepted(false));
        client
    }

    pub async fn handshake(&mut self, connect: Connect) -> ConnAck {
        self.send(Packet::Connect(Box::new(connect))).await;
        match self.recv().await {
            Some(Packet::ConnAck(ack)) => ack,
            other => panic!("Expected CONNACK, got {:?}", other),
        }
    }

    pub async fn send(&self, packet: Packet) {
        assert!(self.link.send(packet).await, "connection worker is gone");
    }

    /// Next packet, or None on close or timeout
    pub async fn recv(&mut self) -> Option<Packet> {
        match timeout(RECV_TIMEOUT, self.link.recv()).await {
            Ok(Some(Outbound::Packet(packet))) => Some(packet),
            _ => None,
        }
    }

    pub async fn recv_publish(&mut self) -> Publish {
        match self.recv().await {
            Some(Packet::Publish(publish)) => publish,
            other => panic!("Expected PUBLISH, got {:?}", other),
        }
    }

    /// Assert nothing arrives for a short while
    pub async fn expect_silence(&mut self) {
        if let Ok(Some(frame)) = timeout(QUIET_PERIOD, self.link.recv()).await {
            panic!("Expected no traffic, got {:?}", frame);
        }
    }

    /// Wait for the broker to close the connection
    pub async fn expect_close(&mut self) {
        loop {
            match timeout(RECV_TIMEOUT, self.link.recv()).await {
                Ok(Some(Outbound::Close)) | Ok(None) => return,
                Ok(Some(Outbound::Packet(_))) => continue,
                Err(_) => panic!("connection was not closed"),
            }
        }
    }

    pub async fn subscribe(&mut self, filter: &str, qos: QoS) -> SubAck {
        self.send(Packet::Subscribe(Subscribe {
            packet_id: 1,
            filters: vec![SubscribeFilter {
                filter: filter.to_string(),
                qos,
            }],
        }))
        .await;
        match self.recv().await {
            Some(Packet::SubAck(ack)) => ack,
            other => panic!("Expected SUBACK, got {:?}", other),
        }
    }

    pub async fn publish(&self, topic: &str, payload: &'static [u8], qos: QoS, packet_id: u16) {
        let mut publish = Publish::new(topic, Bytes::from_static(payload), qos);
        if qos != QoS::AtMostOnce {
            publish = publish.with_packet_id(packet_id);
        }
        self.send(Packet::Publish(publish)).await;
    }

    pub async fn publish_retained(&self, topic: &str, payload: &'static [u8], qos: QoS) {
        let mut publish = Publish::new(topic, Bytes::from_static(payload), qos).with_retain(true);
        if qos != QoS::AtMostOnce {
            publish = publish.with_packet_id(100);
        }
        self.send(Packet::Publish(publish)).await;
    }

    /// Round-trip a PINGREQ so everything sent before it has been handled
    pub async fn sync(&mut self) {
        self.send(Packet::PingReq).await;
        loop {
            match self.recv().await {
                Some(Packet::PingResp) => return,
                Some(_) => continue,
                None => panic!("no PINGRESP"),
            }
        }
    }

    pub async fn disconnect(mut self) {
        self.send(Packet::Disconnect).await;
        self.expect_close().await;
    }

    /// Drop the transport without DISCONNECT
    pub fn drop_transport(self) {
        drop(self.link);
    }
}
