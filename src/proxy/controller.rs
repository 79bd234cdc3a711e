//! The proxy controller.
//!
//! One task owns both endpoints and the session state, and decides for
//! every inbound message whether to forward it, synthesize a response,
//! buffer it, or drop it. Clients come and go; the server-side session
//! stays up from the first successful registration until the server
//! drops us or the proxy shuts down.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::irc::Message;

use super::endpoint::Endpoint;
use super::session::{Phase, SessionState};
use super::{Control, Dialer, PROXY_NAME};

/// Progress of a reconnecting client's NICK/USER exchange. The commands
/// are accepted but never forwarded — the server already knows us.
#[derive(Debug, Default)]
struct Reattach {
    got_nick: bool,
    got_user: bool,
}

/// The proxy: two endpoints, one session, one event loop.
pub struct Proxy<D, C> {
    session: SessionState,
    config: ServerConfig,
    have_network: bool,
    dialer: D,
    connections: mpsc::Receiver<C>,
    control: mpsc::Receiver<Control>,
    client: Option<Endpoint>,
    server: Option<Endpoint>,
    reattach: Option<Reattach>,
}

/// Receive from an endpoint that may not exist; an absent endpoint never
/// yields, so its select branch stays quiet.
async fn recv_from(endpoint: &mut Option<Endpoint>) -> Option<Message> {
    match endpoint {
        Some(endpoint) => endpoint.recv().await,
        None => std::future::pending().await,
    }
}

fn notice(text: &str) -> Message {
    Message::new(Some(PROXY_NAME), "NOTICE", &["*", text])
}

impl<D, C> Proxy<D, C>
where
    D: Dialer,
    C: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(
        config: ServerConfig,
        dialer: D,
        connections: mpsc::Receiver<C>,
        control: mpsc::Receiver<Control>,
        backlog_limit: usize,
    ) -> Self {
        Self {
            session: SessionState::new(backlog_limit),
            config,
            have_network: true,
            dialer,
            connections,
            control,
            client: None,
            server: None,
            reattach: None,
        }
    }

    /// Run until shutdown. Recoverable errors never unwind out of here;
    /// they show up as NOTICEs on the client connection and log lines.
    pub async fn run(mut self) {
        info!(server = %self.config.addr(), "idler proxy running");

        loop {
            tokio::select! {
                maybe_conn = self.connections.recv() => match maybe_conn {
                    Some(stream) => self.on_client_connect(stream).await,
                    None => break, // host listener went away
                },

                maybe_ctl = self.control.recv() => match maybe_ctl {
                    Some(Control::Shutdown) | None => break,
                    Some(ctl) => self.on_control(ctl),
                },

                msg = recv_from(&mut self.client) => match msg {
                    Some(msg) => self.on_client_message(msg),
                    None => {
                        debug!("client endpoint closed");
                        self.client = None;
                        self.client_departed();
                    }
                },

                msg = recv_from(&mut self.server) => match msg {
                    Some(msg) => self.on_server_message(msg),
                    None => self.on_server_gone(),
                },
            }
        }

        if let Some(server) = &self.server {
            server.send(Message::new(None, "QUIT", &["irc-idler shutting down"]));
        }
        info!("idler proxy stopped");
        // Dropping self closes both endpoints.
    }

    // ── Connections ──────────────────────────────────────────────

    async fn on_client_connect(&mut self, stream: C) {
        if self.client.is_some() {
            // One client at a time; the newer connection loses. This also
            // covers a reconnect racing an unsettled server handshake.
            info!("rejecting second client connection");
            let reject = Endpoint::new(stream, "client");
            reject.send(notice("Another client is already connected"));
            return;
        }

        if !self.have_network {
            info!("rejecting client: no network");
            let reject = Endpoint::new(stream, "client");
            reject.send(notice("Network is unavailable; try again later"));
            return;
        }

        if self.server.is_some() {
            // Live idled session: attach the client and wait for its
            // NICK/USER, then replay instead of re-registering.
            info!("client reconnected to idled session");
            self.client = Some(Endpoint::new(stream, "client"));
            self.reattach = Some(Reattach::default());
            return;
        }

        // Fresh session: dial the server.
        info!(server = %self.config.addr(), "client connected, dialing server");
        let client = Endpoint::new(stream, "client");
        match self.dialer.dial(&self.config).await {
            Ok(upstream) => {
                self.server = Some(Endpoint::new(upstream, "server"));
                self.client = Some(client);
                self.session.client_connected();
            }
            Err(e) => {
                warn!("server dial failed: {e}");
                let text = format!("Cannot reach the IRC server: {e}");
                client.send(notice(&text));
                // client drops here; the NOTICE flushes on close.
            }
        }
    }

    fn client_departed(&mut self) {
        self.reattach = None;
        self.session.pending_nick = None;
        match self.session.phase {
            Phase::Registered => {
                info!("client disconnected; idling session");
                self.session.client_gone();
            }
            // A reconnect attempt died mid-replay; keep idling.
            Phase::ClientAbsent => {}
            _ => {
                // No idling a half-registered session.
                if self.server.take().is_some() {
                    info!("client left before registration; dropping server");
                }
                self.session.reset();
            }
        }
    }

    fn on_server_gone(&mut self) {
        warn!("server connection lost");
        self.server = None;
        if let Some(client) = self.client.take() {
            // The session is unrecoverable; the client must start over.
            client.send(notice("Server connection lost"));
        }
        self.reattach = None;
        self.session.reset();
    }

    fn on_control(&mut self, ctl: Control) {
        match ctl {
            Control::GetServerConfig(reply) => {
                let _ = reply.send(self.config.clone());
            }
            Control::SetServerConfig(config) => {
                info!(server = %config.addr(), "dial target changed; tearing down session");
                self.config = config;
                self.teardown();
            }
            Control::HaveNetwork(up) => {
                info!(have_network = up, "network availability changed");
                self.have_network = up;
            }
            // Handled in the run loop.
            Control::Shutdown => {}
        }
    }

    fn teardown(&mut self) {
        self.client = None;
        self.server = None;
        self.reattach = None;
        self.session.reset();
    }

    // ── Client → server ──────────────────────────────────────────

    fn on_client_message(&mut self, msg: Message) {
        if self.reattach.is_some() {
            self.on_reattach_message(msg);
            return;
        }

        match msg.command.as_str() {
            "NICK" => {
                if let Some(nick) = msg.params.first() {
                    match self.session.phase {
                        Phase::ClientHandshaking | Phase::ServerHandshaking => {
                            self.session.record_nick(nick);
                        }
                        Phase::Registered => {
                            self.session.pending_nick = Some(nick.clone());
                        }
                        _ => {}
                    }
                }
                self.send_to_server(msg);
            }

            "USER" => {
                if matches!(
                    self.session.phase,
                    Phase::ClientHandshaking | Phase::ServerHandshaking
                ) {
                    self.session.record_user(msg.clone());
                }
                self.send_to_server(msg);
            }

            "JOIN" => {
                // IRC allows comma-separated channel lists: JOIN #a,#b,#c.
                // Channels the session already sits in replay from cache;
                // the rest go upstream one JOIN each. A JOIN carrying keys
                // is passed through untouched.
                if msg.params.len() != 1 {
                    self.send_to_server(msg);
                    return;
                }
                let channels: Vec<String> = msg.params[0]
                    .split(',')
                    .filter(|c| !c.is_empty())
                    .map(str::to_owned)
                    .collect();
                for channel in channels {
                    match self.session.replay_channel(&channel) {
                        Some(replay) => {
                            debug!(channel = %channel, "serving JOIN from cache");
                            for m in replay {
                                self.send_to_client(m);
                            }
                            for m in self.session.drain_backlog(&channel) {
                                self.send_to_client(m);
                            }
                        }
                        None => {
                            self.send_to_server(Message::new(None, "JOIN", &[&channel]));
                        }
                    }
                }
            }

            "QUIT" => {
                // Not forwarded: staying on while the client quits is the
                // whole point. Drop the client, keep the session.
                info!("client sent QUIT; session stays up");
                self.client = None;
                self.client_departed();
            }

            _ => self.send_to_server(msg),
        }
    }

    /// A reconnecting client re-sends NICK and USER; both are swallowed,
    /// and once both have arrived the cached handshake replays.
    fn on_reattach_message(&mut self, msg: Message) {
        match msg.command.as_str() {
            "NICK" | "USER" => {
                let Some(reattach) = self.reattach.as_mut() else {
                    return;
                };
                if msg.command == "NICK" {
                    reattach.got_nick = true;
                } else {
                    reattach.got_user = true;
                }
                if reattach.got_nick && reattach.got_user {
                    self.reattach = None;
                    self.session.client_returned();
                    for m in self.session.snapshot_handshake() {
                        self.send_to_client(m);
                    }
                    if !self.session.seen_motd {
                        // Nothing cached to replay; fetch a fresh copy.
                        self.send_to_server(Message::new(None, "MOTD", &[]));
                    }
                    info!(nick = %self.session.nick, "replayed handshake to client");
                }
            }
            "QUIT" => {
                info!("client quit during replay; session stays up");
                self.client = None;
                self.client_departed();
            }
            // Anything else from a registered client passes through.
            _ => self.send_to_server(msg),
        }
    }

    // ── Server → client ──────────────────────────────────────────

    fn on_server_message(&mut self, msg: Message) {
        // Liveness first: the proxy, not the client, answers server PINGs,
        // and does so before reacting to anything later.
        if msg.command == "PING" {
            let mut pong = msg;
            pong.command = "PONG".into();
            pong.prefix = None;
            self.send_to_server(pong);
            return;
        }

        match msg.command.as_str() {
            // RPL_WELCOME: registration complete. The first parameter is
            // the nick the server actually granted.
            "001" => {
                self.session
                    .record_welcome(msg.params.first().map(String::as_str));
                self.forward_to_client(msg);
            }

            // RPL_YOURHOST / RPL_CREATED / RPL_MYINFO: cache for replay.
            "002" | "003" => {
                self.session.record_welcome_info(msg.clone());
                self.forward_to_client(msg);
            }
            "004" => {
                self.session.record_welcome_info(msg.clone());
                self.forward_to_client(msg);
                if !self.session.seen_motd {
                    // Solicit the MOTD so the cache fills for later replay.
                    self.send_to_server(Message::new(None, "MOTD", &[]));
                }
            }

            // ERR_NICKNAMEINUSE: mid-handshake it reopens the nick
            // exchange; post-registration it voids the pending change.
            "433" => {
                if self.session.phase == Phase::ServerHandshaking {
                    self.session.nick_rejected();
                } else {
                    self.session.pending_nick = None;
                }
                self.forward_to_client(msg);
            }

            // MOTD sequence: cache and forward.
            "375" => {
                self.session.begin_motd(msg.clone());
                self.forward_to_client(msg);
            }
            "372" => {
                self.session.append_motd(msg.clone());
                self.forward_to_client(msg);
            }
            "376" => {
                self.session.end_motd(msg.clone());
                self.forward_to_client(msg);
            }

            // RPL_TOPIC / RPL_NAMEREPLY / RPL_ENDOFNAMES: per-channel cache.
            "332" => {
                if let Some(channel) = msg.params.get(1).cloned() {
                    self.session.record_topic(&channel, msg.clone());
                }
                self.forward_to_client(msg);
            }
            "353" => {
                if let Some(channel) = msg.params.get(2).cloned() {
                    self.session.record_names(&channel, msg.clone());
                }
                self.forward_to_client(msg);
            }
            "366" => {
                if let Some(channel) = msg.params.get(1).cloned() {
                    self.session.end_names(&channel, msg.clone());
                }
                self.forward_to_client(msg);
            }

            "JOIN" => {
                if self.is_own_prefix(&msg) {
                    if let Some(channel) = msg.params.first().cloned() {
                        self.session.record_join(&channel, msg.clone());
                    }
                }
                self.forward_to_client(msg);
            }

            "PART" => {
                if self.is_own_prefix(&msg) {
                    if let Some(channel) = msg.params.first().cloned() {
                        self.session.record_part(&channel);
                    }
                }
                self.forward_to_client(msg);
            }

            "KICK" => {
                let kicked_us = msg
                    .params
                    .get(1)
                    .is_some_and(|n| n.eq_ignore_ascii_case(&self.session.nick));
                if kicked_us {
                    if let Some(channel) = msg.params.first().cloned() {
                        self.session.record_part(&channel);
                    }
                }
                self.forward_to_client(msg);
            }

            "NICK" => {
                if self.is_own_prefix(&msg) {
                    if let Some(new_nick) = msg.params.first().cloned() {
                        self.session.record_nick_change(&new_nick);
                        self.session.pending_nick = None;
                    }
                }
                self.forward_to_client(msg);
            }

            "TOPIC" => {
                if let (Some(channel), Some(text)) =
                    (msg.params.first().cloned(), msg.params.get(1).cloned())
                {
                    let prefix = msg.prefix.clone();
                    self.session
                        .record_topic_change(&channel, &text, prefix.as_deref());
                }
                self.forward_to_client(msg);
            }

            _ => self.forward_to_client(msg),
        }
    }

    fn is_own_prefix(&self, msg: &Message) -> bool {
        msg.prefix_nick()
            .is_some_and(|n| !self.session.nick.is_empty() && n.eq_ignore_ascii_case(&self.session.nick))
    }

    // ── Plumbing ─────────────────────────────────────────────────

    fn send_to_server(&self, msg: Message) {
        if let Some(server) = &self.server {
            server.send(msg);
        }
    }

    fn send_to_client(&self, msg: Message) {
        if let Some(client) = &self.client {
            client.send(msg);
        }
    }

    /// Forward a server message to the client if one is attached;
    /// otherwise backlog channel traffic and drop the rest.
    fn forward_to_client(&mut self, msg: Message) {
        if self.client.is_some() {
            self.send_to_client(msg);
            return;
        }
        if msg.command == "PRIVMSG" || msg.command == "NOTICE" {
            if let Some(target) = msg.params.first().cloned() {
                if target.starts_with('#') || target.starts_with('&') {
                    self.session.push_backlog(&target, msg);
                }
            }
        }
        // Everything else seen while the client is away is dropped.
    }
}
