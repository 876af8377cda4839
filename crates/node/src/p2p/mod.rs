//! Overlay node: ping/pong gossip, approval exchange and piece transfer over
//! libp2p request-response, one protocol per message kind.

mod codec;

pub use codec::{FrameCodec, MAX_FRAME_SIZE};

use crate::approval::ApprovalService;
use crate::error::{SpError, SpResult};
use crate::interfaces::{ApprovalCollector, SecondaryClient, Signer};
use crate::peers::PeerDirectory;
use crate::peerstore::PeerStore;
use crate::receiver::PieceReceiver;
use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use libp2p::{
    identity,
    multiaddr::Protocol,
    noise,
    request_response::{
        self, Event as RequestResponseEvent, Message as RequestResponseMessage,
        OutboundRequestId, ProtocolSupport, ResponseChannel,
    },
    swarm::{dial_opts::DialOpts, DialError, NetworkBehaviour, Swarm, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, StreamProtocol, Transport,
};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use strata_protocol::{
    Ack, ApprovalRequest, ApprovalResponse, DonePieceRequest, DonePieceResponse, NodeInfo,
    PieceCommand, PieceReply, Ping, Pong, PutPieceRequest, ReplicatePieceApproval,
    APPROVAL_REQUEST_PROTOCOL, APPROVAL_RESPONSE_PROTOCOL, PING_PROTOCOL, PONG_PROTOCOL,
    REPLICATE_PIECE_PROTOCOL,
};
use strata_protocol::signature::verify_signature;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, info, warn};

const COMMAND_CHANNEL_SIZE: usize = 256;
const PIECE_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

type OneWay<Req> = request_response::Behaviour<FrameCodec<Req, Ack>>;

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "NodeEvent")]
pub struct NodeBehaviour {
    pub ping: OneWay<Ping>,
    pub pong: OneWay<Pong>,
    pub approval_request: OneWay<ApprovalRequest>,
    pub approval_response: OneWay<ApprovalResponse>,
    pub piece: request_response::Behaviour<FrameCodec<PieceCommand, PieceReply>>,
}

#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
pub enum NodeEvent {
    Ping(RequestResponseEvent<Ping, Ack>),
    Pong(RequestResponseEvent<Pong, Ack>),
    ApprovalRequest(RequestResponseEvent<ApprovalRequest, Ack>),
    ApprovalResponse(RequestResponseEvent<ApprovalResponse, Ack>),
    Piece(RequestResponseEvent<PieceCommand, PieceReply>),
}

impl From<RequestResponseEvent<Ping, Ack>> for NodeEvent {
    fn from(v: RequestResponseEvent<Ping, Ack>) -> Self {
        Self::Ping(v)
    }
}
impl From<RequestResponseEvent<Pong, Ack>> for NodeEvent {
    fn from(v: RequestResponseEvent<Pong, Ack>) -> Self {
        Self::Pong(v)
    }
}
impl From<RequestResponseEvent<ApprovalRequest, Ack>> for NodeEvent {
    fn from(v: RequestResponseEvent<ApprovalRequest, Ack>) -> Self {
        Self::ApprovalRequest(v)
    }
}
impl From<RequestResponseEvent<ApprovalResponse, Ack>> for NodeEvent {
    fn from(v: RequestResponseEvent<ApprovalResponse, Ack>) -> Self {
        Self::ApprovalResponse(v)
    }
}
impl From<RequestResponseEvent<PieceCommand, PieceReply>> for NodeEvent {
    fn from(v: RequestResponseEvent<PieceCommand, PieceReply>) -> Self {
        Self::Piece(v)
    }
}

fn one_way<Req>(protocol: &'static str) -> OneWay<Req>
where
    Req: serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
{
    request_response::Behaviour::new(
        std::iter::once((StreamProtocol::new(protocol), ProtocolSupport::Full)),
        request_response::Config::default(),
    )
}

enum Outbound {
    Ping(Ping),
    Pong(Pong),
    ApprovalRequest(ReplicatePieceApproval),
    ApprovalResponse(ReplicatePieceApproval),
    Piece(PieceCommand, oneshot::Sender<SpResult<PieceReply>>),
}

impl Outbound {
    fn fail(self, reason: &str) {
        if let Outbound::Piece(_, reply) = self {
            let _ = reply.send(Err(SpError::Network(reason.to_string())));
        }
    }
}

enum Command {
    Send { peer: PeerId, message: Outbound },
    BroadcastApproval {
        approval: ReplicatePieceApproval,
        reply: oneshot::Sender<usize>,
    },
    RespondPiece {
        channel: ResponseChannel<PieceReply>,
        reply: PieceReply,
    },
    Listeners { reply: oneshot::Sender<Vec<Multiaddr>> },
}

#[derive(Debug, Clone)]
pub struct OverlayConfig {
    pub listen: Multiaddr,
    pub bootstrap: Vec<(PeerId, Multiaddr)>,
    pub ping_period: Duration,
    /// Inbound approval and piece requests handled at once.
    pub max_inbound: usize,
}

pub struct Node {
    peer_id: PeerId,
    swarm: Swarm<NodeBehaviour>,
    config: OverlayConfig,
    peers: Arc<PeerDirectory>,
    peerstore: PeerStore,
    approvals: Arc<ApprovalService>,
    receiver: Arc<PieceReceiver>,
    signer: Arc<dyn Signer>,
    commands_tx: mpsc::Sender<Command>,
    commands_rx: mpsc::Receiver<Command>,
    pending_pieces: HashMap<OutboundRequestId, oneshot::Sender<SpResult<PieceReply>>>,
    queued: HashMap<PeerId, Vec<Outbound>>,
    remote_addrs: HashMap<PeerId, Multiaddr>,
    inbound_limit: Arc<Semaphore>,
}

/// Cloneable access to a running node.
#[derive(Clone)]
pub struct P2pHandle {
    peer_id: PeerId,
    commands: mpsc::Sender<Command>,
    approvals: Arc<ApprovalService>,
}

#[allow(clippy::too_many_arguments)]
pub fn build_node(
    keypair: identity::Keypair,
    config: OverlayConfig,
    peers: Arc<PeerDirectory>,
    peerstore: PeerStore,
    approvals: Arc<ApprovalService>,
    receiver: Arc<PieceReceiver>,
    signer: Arc<dyn Signer>,
) -> anyhow::Result<(Node, P2pHandle)> {
    let peer_id = PeerId::from(keypair.public());

    let noise_config = noise::Config::new(&keypair)
        .map_err(|e| anyhow::anyhow!("Noise key generation failed: {e}"))?;
    let tcp_transport = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true).port_reuse(true));
    let transport = libp2p::dns::tokio::Transport::system(tcp_transport)
        .context("failed to read system dns config")?
        .upgrade(libp2p::core::upgrade::Version::V1Lazy)
        .authenticate(noise_config)
        .multiplex(yamux::Config::default())
        .boxed();

    let piece = request_response::Behaviour::new(
        std::iter::once((
            StreamProtocol::new(REPLICATE_PIECE_PROTOCOL),
            ProtocolSupport::Full,
        )),
        request_response::Config::default().with_request_timeout(PIECE_REQUEST_TIMEOUT),
    );
    let behaviour = NodeBehaviour {
        ping: one_way(PING_PROTOCOL),
        pong: one_way(PONG_PROTOCOL),
        approval_request: one_way(APPROVAL_REQUEST_PROTOCOL),
        approval_response: one_way(APPROVAL_RESPONSE_PROTOCOL),
        piece,
    };

    let swarm = Swarm::new(
        transport,
        behaviour,
        peer_id,
        libp2p::swarm::Config::with_tokio_executor()
            .with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT),
    );

    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
    let inbound_limit = Arc::new(Semaphore::new(config.max_inbound.max(1)));
    let handle = P2pHandle {
        peer_id,
        commands: commands_tx.clone(),
        approvals: approvals.clone(),
    };
    let node = Node {
        peer_id,
        swarm,
        config,
        peers,
        peerstore,
        approvals,
        receiver,
        signer,
        commands_tx,
        commands_rx,
        pending_pieces: HashMap::new(),
        queued: HashMap::new(),
        remote_addrs: HashMap::new(),
        inbound_limit,
    };
    Ok((node, handle))
}

impl Node {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> anyhow::Result<()> {
        self.swarm.listen_on(self.config.listen.clone())?;
        for (peer, addr) in self.config.bootstrap.clone() {
            if peer == self.peer_id {
                continue;
            }
            if let Err(err) = self.peerstore.add_addrs(&peer, std::slice::from_ref(&addr)) {
                warn!(peer = %peer, error = %err, "Failed to store bootstrap address");
            }
            info!(peer = %peer, address = %addr, "Added bootstrap peer");
        }

        let mut ticker = tokio::time::interval(self.config.ping_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received, stopping p2p node");
                    break;
                }
                _ = ticker.tick() => {
                    self.gossip_ping().await;
                }
                Some(command) = self.commands_rx.recv() => {
                    self.handle_command(command);
                }
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event);
                }
            }
        }
        for (_, queue) in self.queued.drain() {
            for msg in queue {
                msg.fail("node stopped");
            }
        }
        for (_, reply) in self.pending_pieces.drain() {
            let _ = reply.send(Err(SpError::Network("node stopped".into())));
        }
        Ok(())
    }

    async fn gossip_ping(&mut self) {
        let mut ping = Ping {
            sp_operator_address: self.signer.operator_address(),
            signature: Vec::new(),
        };
        ping.signature = match self.signer.sign_p2p_ping(&ping).await {
            Ok(sig) => sig,
            Err(err) => {
                warn!(error = %err, "Failed to sign ping");
                return;
            }
        };
        let targets = match self.peerstore.peers() {
            Ok(peers) => peers,
            Err(err) => {
                warn!(error = %err, "Failed to list peer store");
                return;
            }
        };
        for peer in targets {
            if peer == self.peer_id {
                continue;
            }
            debug!(peer = %peer, "Broadcast ping to peer");
            self.send(peer, Outbound::Ping(ping.clone()));
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send { peer, message } => self.send(peer, message),
            Command::BroadcastApproval { approval, reply } => {
                let targets = self.peerstore.peers().unwrap_or_default();
                let mut sent = 0;
                for peer in targets {
                    if peer == self.peer_id {
                        continue;
                    }
                    self.send(peer, Outbound::ApprovalRequest(approval.clone()));
                    sent += 1;
                }
                debug!(object_id = ?approval.object_id(), peers = sent, "Broadcast approval request");
                let _ = reply.send(sent);
            }
            Command::RespondPiece { channel, reply } => {
                if self.swarm.behaviour_mut().piece.send_response(channel, reply).is_err() {
                    warn!("Piece requester went away before the reply");
                }
            }
            Command::Listeners { reply } => {
                let _ = reply.send(self.swarm.listeners().cloned().collect());
            }
        }
    }

    fn send(&mut self, peer: PeerId, message: Outbound) {
        if peer == self.peer_id {
            message.fail("refusing to send to self");
            return;
        }
        if self.swarm.is_connected(&peer) {
            self.dispatch(peer, message);
            return;
        }
        let first = !self.queued.contains_key(&peer);
        self.queued.entry(peer).or_default().push(message);
        if !first {
            return;
        }
        let addrs = self.peerstore.addrs(&peer).unwrap_or_default();
        match self.swarm.dial(DialOpts::peer_id(peer).addresses(addrs).build()) {
            Ok(()) => {}
            Err(DialError::DialPeerConditionFalse(_)) => {}
            Err(err) => {
                warn!(peer = %peer, error = %err, "Failed to init stream");
                self.fail_queued(peer, &err.to_string());
            }
        }
    }

    fn dispatch(&mut self, peer: PeerId, message: Outbound) {
        let behaviour = self.swarm.behaviour_mut();
        match message {
            Outbound::Ping(ping) => {
                behaviour.ping.send_request(&peer, ping);
            }
            Outbound::Pong(pong) => {
                behaviour.pong.send_request(&peer, pong);
            }
            Outbound::ApprovalRequest(approval) => {
                behaviour.approval_request.send_request(&peer, ApprovalRequest(approval));
            }
            Outbound::ApprovalResponse(approval) => {
                behaviour.approval_response.send_request(&peer, ApprovalResponse(approval));
            }
            Outbound::Piece(command, reply) => {
                let id = behaviour.piece.send_request(&peer, command);
                self.pending_pieces.insert(id, reply);
            }
        }
    }

    fn fail_queued(&mut self, peer: PeerId, reason: &str) {
        if let Some(queue) = self.queued.remove(&peer) {
            for msg in queue {
                msg.fail(reason);
            }
        }
        self.peer_failed(peer);
    }

    fn peer_failed(&mut self, peer: PeerId) {
        let pruned = self.peers.delete_peer(&peer);
        self.forget(pruned);
    }

    fn forget(&mut self, pruned: Vec<PeerId>) {
        for id in pruned {
            if let Err(err) = self.peerstore.remove_peer(&id) {
                warn!(peer = %id, error = %err, "Failed to remove pruned peer");
            }
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<NodeEvent>) {
        match event {
            SwarmEvent::Behaviour(NodeEvent::Ping(event)) => match event {
                RequestResponseEvent::Message {
                    peer,
                    message: RequestResponseMessage::Request { request, channel, .. },
                    ..
                } => self.on_ping(peer, request, channel),
                other => self.on_one_way_event("ping", other),
            },
            SwarmEvent::Behaviour(NodeEvent::Pong(event)) => match event {
                RequestResponseEvent::Message {
                    peer,
                    message: RequestResponseMessage::Request { request, channel, .. },
                    ..
                } => self.on_pong(peer, request, channel),
                other => self.on_one_way_event("pong", other),
            },
            SwarmEvent::Behaviour(NodeEvent::ApprovalRequest(event)) => match event {
                RequestResponseEvent::Message {
                    peer,
                    message: RequestResponseMessage::Request { request, channel, .. },
                    ..
                } => self.on_approval_request(peer, request.0, channel),
                other => self.on_one_way_event("approval_request", other),
            },
            SwarmEvent::Behaviour(NodeEvent::ApprovalResponse(event)) => match event {
                RequestResponseEvent::Message {
                    peer,
                    message: RequestResponseMessage::Request { request, channel, .. },
                    ..
                } => self.on_approval_response(peer, request.0, channel),
                other => self.on_one_way_event("approval_response", other),
            },
            SwarmEvent::Behaviour(NodeEvent::Piece(event)) => self.on_piece_event(event),
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(address = %address, "Listening");
            }
            SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                debug!(peer = %peer_id, endpoint = ?endpoint, "Connection established");
                self.remote_addrs
                    .insert(peer_id, endpoint.get_remote_address().clone());
                if let Some(queue) = self.queued.remove(&peer_id) {
                    for msg in queue {
                        self.dispatch(peer_id, msg);
                    }
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                cause,
                num_established,
                ..
            } => {
                debug!(peer = %peer_id, cause = ?cause, "Connection closed");
                if num_established == 0 {
                    self.remote_addrs.remove(&peer_id);
                }
            }
            SwarmEvent::IncomingConnectionError { error, .. } => {
                warn!(error = %error, "Incoming connection error");
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                warn!(peer = ?peer_id, error = %error, "Outgoing connection error");
                if let Some(peer) = peer_id {
                    if !self.swarm.is_connected(&peer) {
                        self.fail_queued(peer, &error.to_string());
                    }
                }
            }
            _ => {}
        }
    }

    fn on_one_way_event<Req>(&mut self, protocol: &'static str, event: RequestResponseEvent<Req, Ack>) {
        match event {
            RequestResponseEvent::Message { peer, .. } => {
                debug!(peer = %peer, protocol, "Message acknowledged");
            }
            RequestResponseEvent::OutboundFailure { peer, error, .. } => {
                info!(peer = %peer, protocol, error = %error, "Failed to send msg");
                self.peer_failed(peer);
            }
            RequestResponseEvent::InboundFailure { peer, error, .. } => {
                debug!(peer = %peer, protocol, error = %error, "Inbound failure");
            }
            RequestResponseEvent::ResponseSent { .. } => {}
        }
    }

    fn ack(&mut self, protocol: &'static str, channel: ResponseChannel<Ack>) {
        let behaviour = self.swarm.behaviour_mut();
        let sent = match protocol {
            PING_PROTOCOL => behaviour.ping.send_response(channel, Ack),
            PONG_PROTOCOL => behaviour.pong.send_response(channel, Ack),
            APPROVAL_REQUEST_PROTOCOL => behaviour.approval_request.send_response(channel, Ack),
            _ => behaviour.approval_response.send_response(channel, Ack),
        };
        if sent.is_err() {
            debug!(protocol, "Peer closed before ack");
        }
    }

    fn on_ping(&mut self, peer: PeerId, ping: Ping, channel: ResponseChannel<Ack>) {
        if peer == self.peer_id {
            return;
        }
        if let Err(err) = verify_signature(&ping.sp_operator_address, &ping.sign_bytes(), &ping.signature) {
            warn!(remote = %peer, error = %err, "Failed to verify ping msg signature");
            self.peer_failed(peer);
            return;
        }
        self.ack(PING_PROTOCOL, channel);
        let addr = self.remote_addrs.get(&peer).cloned();
        if let Some(addr) = &addr {
            if let Err(err) = self.peerstore.add_addrs(&peer, std::slice::from_ref(addr)) {
                warn!(peer = %peer, error = %err, "Failed to store peer address");
            }
        }
        let pruned = self
            .peers
            .add_peer(peer, &ping.sp_operator_address.to_lowercase(), addr);
        self.forget(pruned);

        let nodes = pong_nodes(
            self.peerstore.all().unwrap_or_default(),
            self.peer_id,
            self.swarm.listeners().cloned().collect(),
        );
        let signer = self.signer.clone();
        let commands = self.commands_tx.clone();
        tokio::spawn(async move {
            let mut pong = Pong {
                sp_operator_address: signer.operator_address(),
                signature: Vec::new(),
                nodes,
            };
            match signer.sign_p2p_pong(&pong).await {
                Ok(sig) => pong.signature = sig,
                Err(err) => {
                    warn!(remote = %peer, error = %err, "Failed to sign pong msg");
                    return;
                }
            }
            let _ = commands
                .send(Command::Send {
                    peer,
                    message: Outbound::Pong(pong),
                })
                .await;
        });
    }

    fn on_pong(&mut self, peer: PeerId, pong: Pong, channel: ResponseChannel<Ack>) {
        if let Err(err) = verify_signature(&pong.sp_operator_address, &pong.sign_bytes(), &pong.signature) {
            warn!(remote = %peer, error = %err, "Failed to verify pong msg signature");
            self.peer_failed(peer);
            return;
        }
        self.ack(PONG_PROTOCOL, channel);
        let addr = self.remote_addrs.get(&peer).cloned();
        let pruned = self
            .peers
            .add_peer(peer, &pong.sp_operator_address.to_lowercase(), addr);
        self.forget(pruned);

        for node in pong.nodes {
            let Ok(id) = node.node_id.parse::<PeerId>() else {
                continue;
            };
            if id == self.peer_id {
                continue;
            }
            let addrs: Vec<Multiaddr> = node
                .multi_addr
                .iter()
                .filter_map(|a| a.parse().ok())
                .collect();
            if let Err(err) = self.peerstore.add_addrs(&id, &addrs) {
                warn!(peer = %id, error = %err, "Failed to store gossiped peer");
            }
        }
    }

    fn on_approval_request(&mut self, peer: PeerId, request: ReplicatePieceApproval, channel: ResponseChannel<Ack>) {
        self.ack(APPROVAL_REQUEST_PROTOCOL, channel);
        let approvals = self.approvals.clone();
        let commands = self.commands_tx.clone();
        let limit = self.inbound_limit.clone();
        tokio::spawn(async move {
            let Ok(_permit) = limit.acquire_owned().await else {
                return;
            };
            let object_id = request.object_id();
            match approvals.on_request(request).await {
                Ok(Some(response)) => {
                    info!(remote = %peer, object_id = ?object_id, "Response to approval request");
                    let _ = commands
                        .send(Command::Send {
                            peer,
                            message: Outbound::ApprovalResponse(response),
                        })
                        .await;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(remote = %peer, object_id = ?object_id, error = %err, "Ignore approval request");
                }
            }
        });
    }

    fn on_approval_response(&mut self, peer: PeerId, response: ReplicatePieceApproval, channel: ResponseChannel<Ack>) {
        let object_id = response.object_id();
        match self.approvals.on_response(response) {
            Ok(()) => {
                self.ack(APPROVAL_RESPONSE_PROTOCOL, channel);
                debug!(remote = %peer, object_id = ?object_id, "Notified approval response");
            }
            Err(err) => {
                warn!(remote = %peer, object_id = ?object_id, error = %err, "Ignore approval response");
            }
        }
    }

    fn on_piece_event(&mut self, event: RequestResponseEvent<PieceCommand, PieceReply>) {
        match event {
            RequestResponseEvent::Message { peer, message, .. } => match message {
                RequestResponseMessage::Request { request, channel, .. } => {
                    let receiver = self.receiver.clone();
                    let commands = self.commands_tx.clone();
                    let limit = self.inbound_limit.clone();
                    tokio::spawn(async move {
                        let Ok(_permit) = limit.acquire_owned().await else {
                            return;
                        };
                        let reply = match request {
                            PieceCommand::Put(req) => PieceReply::Put(receiver.handle_put(req).await),
                            PieceCommand::Done(req) => PieceReply::Done(receiver.handle_done(req).await),
                        };
                        debug!(peer = %peer, "Served piece command");
                        let _ = commands.send(Command::RespondPiece { channel, reply }).await;
                    });
                }
                RequestResponseMessage::Response {
                    request_id,
                    response,
                } => {
                    if let Some(reply) = self.pending_pieces.remove(&request_id) {
                        let _ = reply.send(Ok(response));
                    }
                }
            },
            RequestResponseEvent::OutboundFailure {
                peer,
                request_id,
                error,
                ..
            } => {
                warn!(peer = %peer, error = %error, "Piece outbound failure");
                if let Some(reply) = self.pending_pieces.remove(&request_id) {
                    let _ = reply.send(Err(SpError::Network(error.to_string())));
                }
                self.peer_failed(peer);
            }
            RequestResponseEvent::InboundFailure { peer, error, .. } => {
                warn!(peer = %peer, error = %error, "Piece inbound failure");
            }
            RequestResponseEvent::ResponseSent { peer, .. } => {
                debug!(peer = %peer, "Piece response sent");
            }
        }
    }
}

impl P2pHandle {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    async fn command(&self, command: Command) -> SpResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SpError::Network("p2p node is not running".into()))
    }

    pub async fn listeners(&self) -> SpResult<Vec<Multiaddr>> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Listeners { reply }).await?;
        rx.await
            .map_err(|_| SpError::Network("p2p node is not running".into()))
    }

    async fn piece(&self, endpoint: &str, command: PieceCommand) -> SpResult<PieceReply> {
        let peer: PeerId = endpoint
            .parse()
            .map_err(|e| SpError::InvalidParameters(format!("endpoint {endpoint}: {e}")))?;
        let (reply, rx) = oneshot::channel();
        self.command(Command::Send {
            peer,
            message: Outbound::Piece(command, reply),
        })
        .await?;
        rx.await
            .map_err(|_| SpError::Network("p2p node dropped the request".into()))?
    }
}

#[async_trait]
impl ApprovalCollector for P2pHandle {
    async fn get_secondary_replicate_piece_approval(
        &self,
        approval: ReplicatePieceApproval,
        expected: usize,
        timeout: Duration,
    ) -> SpResult<Vec<ReplicatePieceApproval>> {
        self.approvals
            .collect(approval, expected, timeout, |signed| async move {
                let (reply, rx) = oneshot::channel();
                self.command(Command::BroadcastApproval {
                    approval: signed,
                    reply,
                })
                .await?;
                let sent = rx.await.unwrap_or(0);
                debug!(peers = sent, "Approval request broadcast");
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl SecondaryClient for P2pHandle {
    async fn put_piece(&self, endpoint: &str, req: PutPieceRequest) -> SpResult<()> {
        match self.piece(endpoint, PieceCommand::Put(req)).await? {
            PieceReply::Put(resp) if resp.accepted => Ok(()),
            PieceReply::Put(resp) => Err(SpError::Network(format!("{endpoint} refused piece: {}", resp.error))),
            PieceReply::Done(_) => Err(SpError::Network(format!("{endpoint} answered out of turn"))),
        }
    }

    async fn done_piece(&self, endpoint: &str, req: DonePieceRequest) -> SpResult<DonePieceResponse> {
        match self.piece(endpoint, PieceCommand::Done(req)).await? {
            PieceReply::Done(resp) if resp.error.is_empty() => Ok(resp),
            PieceReply::Done(resp) => Err(SpError::Network(format!("{endpoint} failed piece: {}", resp.error))),
            PieceReply::Put(_) => Err(SpError::Network(format!("{endpoint} answered out of turn"))),
        }
    }
}

/// Peers a pong advertises: every stored peer plus this node at its listen
/// addresses.
fn pong_nodes(known: Vec<(PeerId, Vec<Multiaddr>)>, local: PeerId, listeners: Vec<Multiaddr>) -> Vec<NodeInfo> {
    let mut nodes: Vec<NodeInfo> = known
        .into_iter()
        .filter(|(id, _)| *id != local)
        .map(|(id, addrs)| NodeInfo {
            node_id: id.to_string(),
            multi_addr: addrs.iter().map(|a| a.to_string()).collect(),
        })
        .collect();
    nodes.push(NodeInfo {
        node_id: local.to_string(),
        multi_addr: listeners.iter().map(|a| a.to_string()).collect(),
    });
    nodes
}

/// secp256k1 overlay identity from a hex secret.
pub fn identity_from_hex(secret: &str) -> anyhow::Result<identity::Keypair> {
    let trimmed = secret.trim();
    let raw = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let mut bytes = hex::decode(raw).context("p2p private key is not hex")?;
    let key = identity::secp256k1::SecretKey::try_from_bytes(&mut bytes)
        .map_err(|e| anyhow::anyhow!("invalid p2p private key: {e}"))?;
    Ok(identity::Keypair::from(identity::secp256k1::Keypair::from(key)))
}

pub fn socket_multiaddr(addr: SocketAddr) -> Multiaddr {
    let mut out = Multiaddr::empty();
    match addr.ip() {
        IpAddr::V4(ip) => out.push(Protocol::Ip4(ip)),
        IpAddr::V6(ip) => out.push(Protocol::Ip6(ip)),
    }
    out.push(Protocol::Tcp(addr.port()));
    out
}

/// Accepts a multiaddr or `ip:port` / `host:port`; host names resolve now.
pub async fn resolve_address(addr: &str) -> anyhow::Result<Multiaddr> {
    let addr = addr.trim();
    if addr.starts_with('/') {
        return addr
            .parse::<Multiaddr>()
            .map_err(|e| anyhow::anyhow!("invalid multiaddr {addr}: {e}"));
    }
    let resolved = tokio::net::lookup_host(addr)
        .await
        .with_context(|| format!("failed to resolve {addr}"))?
        .next()
        .with_context(|| format!("{addr} resolved to no address"))?;
    Ok(socket_multiaddr(resolved))
}

/// Parses a `peer_id@host:port` bootstrap entry.
pub async fn parse_bootstrap(entry: &str) -> anyhow::Result<(PeerId, Multiaddr)> {
    let (id, host) = entry
        .split_once('@')
        .with_context(|| format!("bootstrap entry {entry} is not peer_id@host:port"))?;
    let peer: PeerId = id
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bootstrap peer id {id}: {e}"))?;
    Ok((peer, resolve_address(host).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listen_address_forms() {
        assert_eq!(
            resolve_address("127.0.0.1:9933").await.expect("ip"),
            "/ip4/127.0.0.1/tcp/9933".parse::<Multiaddr>().expect("multiaddr")
        );
        assert_eq!(
            resolve_address("/ip4/0.0.0.0/tcp/0").await.expect("multiaddr"),
            "/ip4/0.0.0.0/tcp/0".parse::<Multiaddr>().expect("multiaddr")
        );
        assert!(resolve_address("no-port").await.is_err());
    }

    #[tokio::test]
    async fn bootstrap_entries() {
        let peer = PeerId::random();
        let (id, addr) = parse_bootstrap(&format!("{peer}@127.0.0.1:9000"))
            .await
            .expect("bootstrap");
        assert_eq!(id, peer);
        assert_eq!(addr.to_string(), "/ip4/127.0.0.1/tcp/9000");
        assert!(parse_bootstrap("127.0.0.1:9000").await.is_err());
        assert!(parse_bootstrap("nope@127.0.0.1:9000").await.is_err());
    }

    #[test]
    fn identity_is_stable_for_a_secret() {
        let secret = "0x".to_string() + &"11".repeat(32);
        let a = identity_from_hex(&secret).expect("identity");
        let b = identity_from_hex(&secret).expect("identity");
        assert_eq!(a.public().to_peer_id(), b.public().to_peer_id());
        assert!(identity_from_hex("zz").is_err());
        assert!(identity_from_hex(&"00".repeat(32)).is_err());
    }

    #[test]
    fn pong_advertises_self_once() {
        let local = PeerId::random();
        let other = PeerId::random();
        let other_addr: Multiaddr = "/ip4/10.0.0.2/tcp/9000".parse().expect("multiaddr");
        let listen: Multiaddr = "/ip4/127.0.0.1/tcp/9933".parse().expect("multiaddr");
        let nodes = pong_nodes(
            vec![(other, vec![other_addr.clone()]), (local, vec![other_addr])],
            local,
            vec![listen.clone()],
        );
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].node_id, other.to_string());
        let own: Vec<_> = nodes.iter().filter(|n| n.node_id == local.to_string()).collect();
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].multi_addr, vec![listen.to_string()]);
    }
}
