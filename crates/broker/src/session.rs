//! MQTT listener and per-session loop.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use rumqttc::mqttbytes::v4::{ConnectReturnCode, Packet, SubAck, SubscribeReasonCode, UnsubAck};
use rumqttc::mqttbytes::QoS;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use mqmesh_core::cache::SessionControl;
use mqmesh_core::SessionHandle;

use crate::engine::{Engine, PublishOutcome};
use crate::fanout::{ClientHandle, OutboundMessage};
use crate::policy::Principal;
use crate::protocol::{self, MAX_PACKET_SIZE};
use crate::{Error, Result};

/// The MQTT listener. Accepts TCP connections and runs one task per session.
pub struct MqttServer {
    engine: Arc<Engine>,
}

impl MqttServer {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Accept connections until the shutdown signal flips.
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!(addr = %listener.local_addr()?, "MQTT listener started");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    debug!(%addr, "accepted connection");
                    let engine = Arc::clone(&self.engine);
                    tokio::spawn(async move {
                        if let Err(e) = run_session(engine, stream).await {
                            debug!(%addr, "session ended: {e}");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    info!("MQTT listener stopping");
                    return Ok(());
                }
            }
        }
    }
}

async fn run_session(engine: Arc<Engine>, stream: TcpStream) -> Result<()> {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut read_buf = BytesMut::with_capacity(4096);

    // First packet must be CONNECT.
    let packet = protocol::read_packet(&mut reader, &mut read_buf, MAX_PACKET_SIZE).await?;
    let connect = match packet {
        Packet::Connect(connect) => connect,
        other => {
            return Err(Error::UnexpectedPacket {
                expected: "Connect".to_string(),
                got: format!("{other:?}"),
            })
        }
    };

    let client_id = connect.client_id.clone();
    let keep_alive = connect.keep_alive;
    let username = connect
        .login
        .as_ref()
        .map(|l| l.username.clone())
        .unwrap_or_default();
    let password = connect
        .login
        .as_ref()
        .map(|l| l.password.clone())
        .unwrap_or_default();

    let principal = match engine
        .policy()
        .authenticate(&client_id, &username, &password)
        .await
    {
        Some(principal) => principal,
        None => {
            warn!(client_id, "authentication failed");
            let connack = protocol::connack(ConnectReturnCode::BadUserNamePassword);
            protocol::write_packet(&mut writer, connack).await?;
            return Err(Error::AuthenticationFailed);
        }
    };

    protocol::write_packet(&mut writer, protocol::connack(ConnectReturnCode::Success)).await?;

    let (out_tx, out_rx) = mpsc::channel::<OutboundMessage>(100);
    let client_handle = ClientHandle::new(&client_id, out_tx);
    let (session_handle, ctl_rx) = SessionHandle::new();

    engine
        .handle_connected(&client_id, &principal, session_handle.clone())
        .await;
    info!(client_id, "client connected");

    let result = client_loop(
        &engine,
        &client_id,
        &principal,
        keep_alive,
        &client_handle,
        reader,
        writer,
        read_buf,
        out_rx,
        ctl_rx,
    )
    .await;

    engine.fanout().cleanup_client(&client_id, &client_handle.tx);
    engine
        .handle_disconnected(&client_id, &principal, &session_handle)
        .await;
    info!(client_id, "client disconnected");
    result
}

#[allow(clippy::too_many_arguments)]
async fn client_loop(
    engine: &Arc<Engine>,
    client_id: &str,
    principal: &Principal,
    keep_alive: u16,
    client_handle: &ClientHandle,
    mut reader: ReadHalf<TcpStream>,
    mut writer: WriteHalf<TcpStream>,
    mut read_buf: BytesMut,
    mut out_rx: mpsc::Receiver<OutboundMessage>,
    mut ctl_rx: mpsc::Receiver<SessionControl>,
) -> Result<()> {
    // MQTT spec: drop the connection after 1.5 x keep_alive of silence.
    // keep_alive 0 disables the timeout.
    let timeout = if keep_alive > 0 {
        Some(Duration::from_secs((keep_alive as u64 * 3) / 2))
    } else {
        None
    };

    loop {
        let turn = async {
            tokio::select! {
                ctl = ctl_rx.recv() => {
                    match ctl {
                        Some(SessionControl::Close) | None => {
                            debug!(client_id, "session closed by control request");
                            Err(Error::ClosedByPolicy)
                        }
                    }
                }

                msg = out_rx.recv() => {
                    match msg {
                        Some(msg) => {
                            let publish = protocol::publish(&msg.topic, &msg.payload);
                            protocol::write_packet(&mut writer, publish).await?;
                            Ok(false)
                        }
                        None => Ok(true),
                    }
                }

                packet = protocol::read_packet(&mut reader, &mut read_buf, MAX_PACKET_SIZE) => {
                    match packet? {
                        Packet::Publish(publish) => {
                            let outcome = engine
                                .handle_publish(principal, &publish.topic, &publish.payload)
                                .await;
                            if outcome == PublishOutcome::Close {
                                return Err(Error::ClosedByPolicy);
                            }
                            Ok(false)
                        }
                        Packet::Subscribe(subscribe) => {
                            let mut codes = Vec::with_capacity(subscribe.filters.len());
                            let mut violation = false;
                            let mut accepted = Vec::new();
                            for filter in &subscribe.filters {
                                if engine.policy().authorize_subscribe(principal, &filter.path).await {
                                    engine.fanout().subscribe(&filter.path, client_handle.clone());
                                    accepted.push(filter.path.clone());
                                    codes.push(SubscribeReasonCode::Success(QoS::AtMostOnce));
                                } else {
                                    warn!(client_id, filter = %filter.path, "subscribe ACL violation");
                                    codes.push(SubscribeReasonCode::Failure);
                                    violation = true;
                                }
                            }
                            let suback = Packet::SubAck(SubAck::new(subscribe.pkid, codes));
                            protocol::write_packet(&mut writer, suback).await?;
                            if violation {
                                return Err(Error::ClosedByPolicy);
                            }
                            engine.handle_subscribed(principal, &accepted).await;
                            Ok(false)
                        }
                        Packet::Unsubscribe(unsubscribe) => {
                            engine.fanout().unsubscribe(client_id, &unsubscribe.topics);
                            let unsuback = Packet::UnsubAck(UnsubAck { pkid: unsubscribe.pkid });
                            protocol::write_packet(&mut writer, unsuback).await?;
                            Ok(false)
                        }
                        Packet::PingReq => {
                            protocol::write_packet(&mut writer, Packet::PingResp).await?;
                            Ok(false)
                        }
                        Packet::Disconnect => Ok(true),
                        other => {
                            debug!(client_id, "ignoring packet: {other:?}");
                            Ok(false)
                        }
                    }
                }
            }
        };

        let done = match timeout {
            Some(limit) => match tokio::time::timeout(limit, turn).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!(client_id, keep_alive, "keep-alive timeout, disconnecting");
                    return Err(Error::Protocol("keep-alive timeout".to_string()));
                }
            },
            None => turn.await?,
        };

        if done {
            return Ok(());
        }
    }
}
