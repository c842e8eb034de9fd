//! One task per device connection.
//!
//! The task owns the socket halves, the [`ChannelHandler`] and the timers.
//! Everything the handler wants written comes back through the command
//! channel, so writes keep the order in which they were produced.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};

use super::dispatch::{lane_for, run_consumer, DispatchLanes};
use crate::codec::{OfCodec, OfMessage};
use crate::config::{DispatchConfig, OpenFlowConfig};
use crate::error::{OfError, Result};
use crate::protocol::{ChannelContext, ChannelEvent, ChannelHandler, DispatchItem};
use crate::registry::SwitchRegistry;
use crate::switch::{ChannelCommand, ChannelSender};

const READ_BUFFER: usize = 16 * 1024;

/// Drive a connection until it closes, then clean up.
pub(crate) async fn serve_connection<S>(
    stream: S,
    remote: String,
    peer_certificate: Option<Vec<u8>>,
    ctx: ChannelContext,
    dispatch: DispatchConfig,
    shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (cmd_tx, commands) = mpsc::unbounded_channel();
    let config = ctx.config.clone();
    let registry = ctx.registry.clone();
    let mut handler = ChannelHandler::new(ctx, ChannelSender::new(cmd_tx), remote, peer_certificate);

    let (queue, lanes) = DispatchLanes::new(&dispatch);
    let consumer = tokio::spawn(run_consumer(lanes, registry.clone()));

    let (reader, writer) = tokio::io::split(stream);
    let mut conn = Connection {
        reader,
        writer,
        commands,
        queue,
        registry,
        shutdown,
        codec: OfCodec::new(),
        read_buf: BytesMut::with_capacity(READ_BUFFER),
        write_buf: BytesMut::with_capacity(READ_BUFFER),
    };

    handler.start();
    match conn.run(&mut handler, &config).await {
        Ok(()) => tracing::debug!("Connection {} closed", handler),
        Err(e) if e.is_benign_disconnect() => {
            tracing::debug!("Connection {} dropped: {}", handler, e);
        }
        Err(e) => tracing::warn!("Closing {} in {}: {}", handler, handler.state(), e),
    }

    conn.flush_pending().await;
    let _ = conn.writer.shutdown().await;
    drop(conn);
    // No dispatch may reach the registry once the device is removed.
    consumer.abort();
    let _ = consumer.await;
    handler.on_disconnect();
}

struct Connection<S> {
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    commands: mpsc::UnboundedReceiver<ChannelCommand>,
    queue: DispatchLanes<DispatchItem>,
    registry: Arc<SwitchRegistry>,
    shutdown: watch::Receiver<bool>,
    codec: OfCodec,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> Connection<S> {
    async fn run(&mut self, handler: &mut ChannelHandler, config: &OpenFlowConfig) -> Result<()> {
        if *self.shutdown.borrow() {
            return Ok(());
        }

        let idle_interval = config.idle_interval().max(Duration::from_millis(1));
        let read_timeout = config.read_timeout();
        let max_idle_retry = config.max_idle_retry.max(1);

        let handshake = tokio::time::sleep(config.handshake_timeout());
        tokio::pin!(handshake);
        let mut handshake_armed = true;

        let mut idle = tokio::time::interval_at(Instant::now() + idle_interval, idle_interval);
        idle.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_read = Instant::now();
        let mut idle_ticks: u32 = 0;

        loop {
            let meter_deadline = handler.meter_deadline();
            let paused = self.queue.is_paused();

            tokio::select! {
                biased;

                _ = self.shutdown.changed() => {
                    tracing::debug!("Shutdown reached {}", handler);
                    return Ok(());
                }

                cmd = self.commands.recv() => match cmd {
                    Some(ChannelCommand::Send(msgs)) => self.write(&msgs).await?,
                    Some(ChannelCommand::Close) | None => return Ok(()),
                },

                permit = self.queue.reserve(), if paused => match permit {
                    Ok(permit) => self.queue.send_backlog(permit),
                    Err(_) => return Ok(()),
                },

                read = self.reader.read_buf(&mut self.read_buf), if !paused => {
                    if read? == 0 {
                        return Err(OfError::Io(io::ErrorKind::UnexpectedEof.into()));
                    }
                    last_read = Instant::now();
                    idle_ticks = 0;
                    while let Some(msg) = self.codec.decode(&mut self.read_buf)? {
                        handler.process_event(ChannelEvent::Message(msg))?;
                        for item in handler.take_dispatch() {
                            let lane = lane_for(&self.registry, &item);
                            self.queue.push(item, lane);
                        }
                    }
                }

                () = &mut handshake, if handshake_armed => {
                    handshake_armed = false;
                    handler.process_event(ChannelEvent::HandshakeTimeout)?;
                }

                () = sleep_until(meter_deadline), if meter_deadline.is_some() => {
                    handler.process_event(ChannelEvent::MeterTimeout)?;
                }

                _ = idle.tick() => {
                    let silent = last_read.elapsed();
                    if silent >= read_timeout {
                        return Err(OfError::IdleReadTimeout);
                    }
                    handler.evict_expired_roles();
                    if silent >= idle_interval {
                        idle_ticks += 1;
                        if idle_ticks % max_idle_retry == 0 {
                            handler.process_event(ChannelEvent::Idle)?;
                        }
                    }
                }
            }
        }
    }

    /// Best effort: write what the handler queued before the loop ended.
    async fn flush_pending(&mut self) {
        let mut pending = Vec::new();
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                ChannelCommand::Send(msgs) => pending.extend(msgs),
                ChannelCommand::Close => break,
            }
        }
        if !pending.is_empty() {
            let _ = self.write(&pending).await;
        }
    }

    async fn write(&mut self, msgs: &[OfMessage]) -> Result<()> {
        self.write_buf.clear();
        for msg in msgs {
            if let Err(e) = self.codec.encode(msg, &mut self.write_buf) {
                tracing::warn!("Dropping unencodable {:?}: {}", msg.msg_type(), e);
            }
        }
        if self.write_buf.is_empty() {
            return Ok(());
        }
        self.writer.write_all(&self.write_buf).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use tokio::io::DuplexStream;

    use crate::codec::{
        Body, DescStats, FeaturesReply, MessageType, OfVersion, PortDesc, StatsBody, StatsReply,
        StatsType, SwitchConfig, MISS_SEND_LEN_FULL,
    };
    use crate::registry::{PacketListener, SwitchListener};
    use crate::switch::Dpid;

    struct Device {
        stream: DuplexStream,
        codec: OfCodec,
        buf: BytesMut,
    }

    impl Device {
        async fn send(&mut self, msgs: &[OfMessage]) {
            let mut out = BytesMut::new();
            self.codec.encode_batch(msgs, &mut out).unwrap();
            self.stream.write_all(&out).await.unwrap();
        }

        async fn recv(&mut self) -> Option<OfMessage> {
            loop {
                if let Some(msg) = self.codec.decode(&mut self.buf).unwrap() {
                    return Some(msg);
                }
                if self.stream.read_buf(&mut self.buf).await.ok()? == 0 {
                    return None;
                }
            }
        }

        async fn recv_type(&mut self, msg_type: MessageType) -> OfMessage {
            loop {
                let msg = self.recv().await.expect("connection closed");
                if msg.msg_type() == msg_type {
                    return msg;
                }
            }
        }
    }

    fn of10_handshake(dpid: u64) -> Vec<OfMessage> {
        let v = OfVersion::Of10;
        vec![
            OfMessage::hello(v, 1),
            OfMessage::new(
                v,
                2,
                Body::FeaturesReply(FeaturesReply {
                    datapath_id: dpid,
                    n_tables: 1,
                    ports: vec![PortDesc {
                        port_no: 1,
                        name: "eth1".into(),
                        ..PortDesc::default()
                    }],
                    ..FeaturesReply::default()
                }),
            ),
            OfMessage::new(
                v,
                3,
                Body::GetConfigReply(SwitchConfig {
                    flags: 0,
                    miss_send_len: MISS_SEND_LEN_FULL,
                }),
            ),
            OfMessage::new(
                v,
                4,
                Body::StatsReply(StatsReply {
                    stats_type: StatsType::Desc,
                    flags: 0,
                    body: StatsBody::Desc(DescStats {
                        mfr_desc: "Acme".into(),
                        ..DescStats::default()
                    }),
                }),
            ),
        ]
    }

    fn spawn(
        config: OpenFlowConfig,
    ) -> (Arc<SwitchRegistry>, Device, watch::Sender<bool>, tokio::task::JoinHandle<()>) {
        let registry = Arc::new(SwitchRegistry::new(&DispatchConfig::default()));
        let ctx = ChannelContext::new(registry.clone()).with_config(config);
        let (controller_side, device_side) = tokio::io::duplex(64 * 1024);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(serve_connection(
            controller_side,
            "device:6653".into(),
            None,
            ctx,
            DispatchConfig {
                queue_size: 16,
                ..DispatchConfig::default()
            },
            shutdown_rx,
        ));
        let device = Device {
            stream: device_side,
            codec: OfCodec::new(),
            buf: BytesMut::new(),
        };
        (registry, device, shutdown_tx, task)
    }

    async fn wait_connected(registry: &SwitchRegistry, dpid: Dpid) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.get_switch(dpid).is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("switch never connected");
    }

    #[tokio::test]
    async fn test_handshake_over_stream() {
        let (registry, mut device, _shutdown, task) = spawn(OpenFlowConfig::default());
        device.send(&of10_handshake(0x42)).await;
        wait_connected(&registry, Dpid(0x42)).await;

        let sw = registry.get_switch(Dpid(0x42)).unwrap();
        assert_eq!(sw.desc().mfr_desc, "Acme");
        assert_eq!(sw.ports().len(), 1);

        // EOF removes the switch.
        drop(device);
        task.await.unwrap();
        assert!(registry.get_switch(Dpid(0x42)).is_none());
    }

    #[tokio::test]
    async fn test_echo_answered_once_active() {
        let (registry, mut device, _shutdown, _task) = spawn(OpenFlowConfig::default());
        device.send(&of10_handshake(0x43)).await;
        wait_connected(&registry, Dpid(0x43)).await;

        let payload = Bytes::from_static(b"ping");
        device
            .send(&[OfMessage::new(OfVersion::Of10, 77, Body::EchoRequest(payload.clone()))])
            .await;
        let reply = device.recv_type(MessageType::EchoReply).await;
        assert_eq!(reply.xid, 77);
        assert_eq!(reply.body, Body::EchoReply(payload));
    }

    #[tokio::test]
    async fn test_illegal_message_closes() {
        let (registry, mut device, _shutdown, task) = spawn(OpenFlowConfig::default());
        let v = OfVersion::Of10;
        device
            .send(&[
                OfMessage::hello(v, 1),
                OfMessage::new(
                    v,
                    2,
                    Body::GetConfigReply(SwitchConfig {
                        flags: 0,
                        miss_send_len: MISS_SEND_LEN_FULL,
                    }),
                ),
            ])
            .await;
        task.await.unwrap();
        assert!(registry.connected_dpids().is_empty());
        // Controller HELLO then FEATURES_REQUEST, then EOF.
        assert_eq!(device.recv().await.unwrap().msg_type(), MessageType::Hello);
        assert_eq!(
            device.recv().await.unwrap().msg_type(),
            MessageType::FeaturesRequest
        );
        assert!(device.recv().await.is_none());
    }

    #[derive(Default)]
    struct Timeline(parking_lot::Mutex<Vec<&'static str>>);

    impl PacketListener for Timeline {
        fn handle_packet(&self, _: Dpid, _: &OfMessage) {
            self.0.lock().push("packet");
        }
    }

    impl SwitchListener for Timeline {
        fn switch_removed(&self, _: Dpid) {
            self.0.lock().push("removed");
        }
    }

    #[tokio::test]
    async fn test_no_dispatch_after_removal() {
        let (registry, mut device, _shutdown, task) = spawn(OpenFlowConfig::default());
        let timeline = Arc::new(Timeline::default());
        registry.add_packet_listener(0, timeline.clone());
        registry.add_switch_listener(timeline.clone());

        device.send(&of10_handshake(0x45)).await;
        wait_connected(&registry, Dpid(0x45)).await;

        let packets: Vec<_> = (0..64u32)
            .map(|i| {
                let mut body = vec![0u8; 22];
                body.extend_from_slice(&0x0800u16.to_be_bytes());
                OfMessage::new(
                    OfVersion::Of10,
                    100 + i,
                    Body::Opaque {
                        msg_type: MessageType::PacketIn,
                        payload: Bytes::from(body),
                    },
                )
            })
            .collect();
        device.send(&packets).await;
        drop(device);
        task.await.unwrap();

        let timeline = timeline.0.lock();
        assert_eq!(timeline.last(), Some(&"removed"));
        assert_eq!(timeline.iter().filter(|e| **e == "removed").count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_active_connection() {
        let (registry, mut device, shutdown, task) = spawn(OpenFlowConfig::default());
        device.send(&of10_handshake(0x44)).await;
        wait_connected(&registry, Dpid(0x44)).await;

        shutdown.send(true).unwrap();
        task.await.unwrap();
        assert!(registry.get_switch(Dpid(0x44)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_times_out() {
        let config = OpenFlowConfig {
            handshake_timeout_ms: 60_000,
            idle_interval_ms: 1_000,
            read_timeout_ms: 5_000,
            ..OpenFlowConfig::default()
        };
        let (_registry, mut device, _shutdown, task) = spawn(config);
        // Nothing but HELLO.
        device.send(&[OfMessage::hello(OfVersion::Of13, 1)]).await;
        tokio::time::timeout(Duration::from_secs(30), task)
            .await
            .expect("connection should close")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timer_closes_stalled_device() {
        let config = OpenFlowConfig {
            handshake_timeout_ms: 2_000,
            idle_interval_ms: 60_000,
            read_timeout_ms: 120_000,
            ..OpenFlowConfig::default()
        };
        let (registry, _device, _shutdown, task) = spawn(config);
        tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .expect("handshake timer should fire")
            .unwrap();
        assert!(registry.connected_dpids().is_empty());
    }
}
