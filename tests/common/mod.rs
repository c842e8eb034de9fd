//! Shared helpers: a scripted OpenFlow device over loopback TCP.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use ofctl::codec::{
    Body, DescStats, FeaturesReply, MessageType, MeterFeatures, OfCodec, OfMessage, OfVersion,
    PortDesc, StatsBody, StatsReply, StatsType, SwitchConfig, MISS_SEND_LEN_FULL, REPLY_MORE,
};
use ofctl::{Config, Controller, DefaultDriverProvider, Dpid, SwitchRegistry};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(5);

/// Find an available port for testing
pub async fn find_available_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Loopback config on a free port.
pub async fn test_config() -> Config {
    let mut config = Config::default().with_ports(vec![find_available_port().await]);
    config.openflow.bind_address = "127.0.0.1".into();
    config
}

/// Controller running on the test's runtime.
pub fn start_controller(config: Config) -> Controller {
    let mut controller = Controller::new(config);
    controller
        .start(vec![], Arc::new(DefaultDriverProvider))
        .unwrap();
    controller
}

/// Poll until `dpid` is registered.
pub async fn wait_connected(registry: &SwitchRegistry, dpid: Dpid) {
    timeout(WAIT, async {
        while registry.get_switch(dpid).is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("switch never connected");
}

pub fn port(port_no: u32) -> PortDesc {
    PortDesc {
        port_no,
        name: format!("eth{port_no}"),
        ..PortDesc::default()
    }
}

/// Device end of a control channel.
pub struct FakeSwitch<S = TcpStream> {
    pub version: OfVersion,
    stream: S,
    codec: OfCodec,
    buf: BytesMut,
}

impl FakeSwitch {
    pub async fn connect(addr: SocketAddr, version: OfVersion) -> Self {
        let stream = timeout(WAIT, TcpStream::connect(addr))
            .await
            .expect("connect timed out")
            .expect("connect failed");
        Self::over(stream, version)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> FakeSwitch<S> {
    pub fn over(stream: S, version: OfVersion) -> Self {
        Self {
            version,
            stream,
            codec: OfCodec::new(),
            buf: BytesMut::new(),
        }
    }

    pub async fn send(&mut self, body: Body, xid: u32) {
        self.send_msg(OfMessage::new(self.version, xid, body)).await;
    }

    pub async fn send_msg(&mut self, msg: OfMessage) {
        let mut out = BytesMut::new();
        self.codec.encode(&msg, &mut out).unwrap();
        self.stream.write_all(&out).await.unwrap();
    }

    /// Next message, or `None` once the controller closed the channel.
    pub async fn recv(&mut self) -> Option<OfMessage> {
        timeout(WAIT, async {
            loop {
                if let Some(msg) = self.codec.decode(&mut self.buf).unwrap() {
                    return Some(msg);
                }
                match self.stream.read_buf(&mut self.buf).await {
                    Ok(0) | Err(_) => return None,
                    Ok(_) => {}
                }
            }
        })
        .await
        .expect("no message from controller")
    }

    /// Skip ahead to the next message of `msg_type`.
    pub async fn expect(&mut self, msg_type: MessageType) -> OfMessage {
        loop {
            let msg = self.recv().await.expect("controller closed the channel");
            if msg.msg_type() == msg_type {
                return msg;
            }
        }
    }

    /// Skip ahead to the next stats request of `stats_type`.
    pub async fn expect_stats_request(&mut self, stats_type: StatsType) -> OfMessage {
        loop {
            let msg = self.expect(MessageType::StatsRequest).await;
            if let Body::StatsRequest(req) = &msg.body {
                if req.stats_type == stats_type {
                    return msg;
                }
            }
        }
    }

    /// Drain until the controller closes.
    pub async fn expect_closed(&mut self) {
        while self.recv().await.is_some() {}
    }

    pub async fn hello(&mut self) {
        self.send_msg(OfMessage::hello(self.version, 1)).await;
        self.expect(MessageType::Hello).await;
    }

    pub async fn features(&mut self, dpid: u64, n_buffers: u32, ports: Vec<PortDesc>) {
        let req = self.expect(MessageType::FeaturesRequest).await;
        let ports = if self.version == OfVersion::Of10 {
            ports
        } else {
            Vec::new()
        };
        self.send(
            Body::FeaturesReply(FeaturesReply {
                datapath_id: dpid,
                n_buffers,
                n_tables: 4,
                ports,
                ..FeaturesReply::default()
            }),
            req.xid,
        )
        .await;
    }

    pub async fn port_desc(&mut self, ports: Vec<PortDesc>) {
        let req = self.expect_stats_request(StatsType::PortDesc).await;
        if ports.is_empty() {
            self.stats_reply(req.xid, StatsType::PortDesc, StatsBody::PortDesc(Vec::new()), false)
                .await;
            return;
        }
        let mut chunks = ports.chunks(2).peekable();
        while let Some(chunk) = chunks.next() {
            let more = chunks.peek().is_some();
            self.stats_reply(req.xid, StatsType::PortDesc, StatsBody::PortDesc(chunk.to_vec()), more)
                .await;
        }
    }

    pub async fn config(&mut self) {
        let req = self.expect(MessageType::GetConfigRequest).await;
        self.send(
            Body::GetConfigReply(SwitchConfig {
                flags: 0,
                miss_send_len: MISS_SEND_LEN_FULL,
            }),
            req.xid,
        )
        .await;
    }

    pub async fn meter_features(&mut self, features: MeterFeatures) {
        let req = self.expect_stats_request(StatsType::MeterFeatures).await;
        self.stats_reply(req.xid, StatsType::MeterFeatures, StatsBody::MeterFeatures(features), false)
            .await;
    }

    pub async fn description(&mut self, mfr: &str) {
        let req = self.expect_stats_request(StatsType::Desc).await;
        self.stats_reply(
            req.xid,
            StatsType::Desc,
            StatsBody::Desc(DescStats {
                mfr_desc: mfr.to_string(),
                hw_desc: "fake".to_string(),
                ..DescStats::default()
            }),
            false,
        )
        .await;
    }

    pub async fn stats_reply(&mut self, xid: u32, stats_type: StatsType, body: StatsBody, more: bool) {
        self.send(
            Body::StatsReply(StatsReply {
                stats_type,
                flags: if more { REPLY_MORE } else { 0 },
                body,
            }),
            xid,
        )
        .await;
    }

    /// Full 1.3 handshake, answering the meter features request.
    pub async fn handshake_of13(&mut self, dpid: u64, ports: Vec<PortDesc>) {
        self.hello().await;
        self.features(dpid, 256, Vec::new()).await;
        self.port_desc(ports).await;
        self.config().await;
        self.meter_features(MeterFeatures {
            max_meter: 16,
            ..MeterFeatures::default()
        })
        .await;
        self.description("Acme").await;
    }

    /// Full 1.0 handshake.
    pub async fn handshake_of10(&mut self, dpid: u64, ports: Vec<PortDesc>) {
        self.hello().await;
        self.features(dpid, 0, ports).await;
        self.config().await;
        self.description("Acme").await;
    }
}
