//! Session bookkeeping.
//!
//! [`SessionState`] is the proxy's memory of the server-side session:
//! registration progress, the negotiated nick, joined channels with their
//! cached join/topic/names replies, and the cached MOTD. It is owned and
//! mutated by the controller only; nothing here touches I/O.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::irc::Message;

use super::PROXY_NAME;

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No client, no server.
    ClientUnconnected,
    /// Client connected, collecting NICK/USER.
    ClientHandshaking,
    /// NICK and USER sent to the server, waiting for 001.
    ServerHandshaking,
    /// Server welcomed us; normal forwarding.
    Registered,
    /// Client went away; the proxy is idling the server session.
    ClientAbsent,
}

/// Cached state for one joined channel.
#[derive(Debug, Default)]
pub struct ChannelState {
    /// Canonical name, cased as the server reported it.
    pub name: String,
    /// Still on the channel from the server's point of view.
    pub joined: bool,
    /// The server's JOIN line for us, replayed verbatim on rejoin.
    join_msg: Option<Message>,
    /// Cached 332 topic reply.
    topic: Option<Message>,
    /// Cached 353 names replies, in order.
    names: Vec<Message>,
    /// Cached 366 end-of-names.
    end_of_names: Option<Message>,
    /// The names list is complete; a fresh 353 restarts it.
    names_done: bool,
    /// Messages seen while the client was away (ring buffer).
    backlog: VecDeque<Message>,
}

/// The proxy's view of the server-side session.
#[derive(Debug)]
pub struct SessionState {
    pub phase: Phase,
    /// The negotiated nickname (empty until accepted).
    pub nick: String,
    /// The USER command as the client sent it.
    pub user: Option<Message>,
    /// A post-registration NICK forwarded upstream, awaiting the server's
    /// confirming echo (or a 433 denial).
    pub pending_nick: Option<String>,
    /// Whether a full MOTD sequence has been received.
    pub seen_motd: bool,
    /// Joined channels, keyed by lowercased name.
    channels: HashMap<String, ChannelState>,
    /// Cached MOTD lines, 375 through 376 inclusive.
    motd: Vec<Message>,
    /// Cached 002/003/004 welcome replies.
    welcome: Vec<Message>,
    /// Per-channel backlog capacity; 0 disables backlogging.
    backlog_limit: usize,
}

fn chan_key(name: &str) -> String {
    name.to_ascii_lowercase()
}

impl SessionState {
    pub fn new(backlog_limit: usize) -> Self {
        Self {
            phase: Phase::ClientUnconnected,
            nick: String::new(),
            user: None,
            pending_nick: None,
            seen_motd: false,
            channels: HashMap::new(),
            motd: Vec::new(),
            welcome: Vec::new(),
            backlog_limit,
        }
    }

    /// Forget everything. Used when the server connection is lost —
    /// nothing cached can be trusted to still be true.
    pub fn reset(&mut self) {
        let limit = self.backlog_limit;
        *self = SessionState::new(limit);
    }

    // ── Registration ─────────────────────────────────────────────

    /// A client attached while no session existed.
    pub fn client_connected(&mut self) {
        self.phase = Phase::ClientHandshaking;
    }

    pub fn record_nick(&mut self, nick: &str) {
        self.nick = nick.to_owned();
        if self.phase == Phase::ClientHandshaking && self.user.is_some() {
            self.phase = Phase::ServerHandshaking;
        }
    }

    pub fn record_user(&mut self, msg: Message) {
        self.user = Some(msg);
        if self.phase == Phase::ClientHandshaking && !self.nick.is_empty() {
            self.phase = Phase::ServerHandshaking;
        }
    }

    /// The server accepted registration (001). Its first parameter is the
    /// nick the server actually granted.
    pub fn record_welcome(&mut self, granted_nick: Option<&str>) {
        if let Some(nick) = granted_nick {
            self.nick = nick.to_owned();
        }
        self.phase = Phase::Registered;
    }

    /// The server rejected our nick (433) mid-handshake; wait for the
    /// client to pick another.
    pub fn nick_rejected(&mut self) {
        if self.phase == Phase::ServerHandshaking {
            self.phase = Phase::ClientHandshaking;
            self.nick.clear();
        }
    }

    /// The server confirmed a nick change for us.
    pub fn record_nick_change(&mut self, new_nick: &str) {
        let old = std::mem::replace(&mut self.nick, new_nick.to_owned());
        // Cached JOIN lines carry the old nick in their prefix; rewrite them
        // so a later replay doesn't resurrect it.
        for chan in self.channels.values_mut() {
            if let Some(join) = &mut chan.join_msg {
                if join.prefix_nick().is_some_and(|n| n.eq_ignore_ascii_case(&old)) {
                    let rest = join
                        .prefix
                        .as_deref()
                        .and_then(|p| p.find('!').map(|i| p[i..].to_owned()))
                        .unwrap_or_default();
                    join.prefix = Some(format!("{new_nick}{rest}"));
                }
            }
        }
    }

    pub fn client_gone(&mut self) {
        if self.phase == Phase::Registered {
            self.phase = Phase::ClientAbsent;
        }
    }

    pub fn client_returned(&mut self) {
        if self.phase == Phase::ClientAbsent {
            self.phase = Phase::Registered;
        }
    }

    // ── Welcome / MOTD caches ────────────────────────────────────

    /// Cache one of the 002/003/004 replies for replay.
    pub fn record_welcome_info(&mut self, msg: Message) {
        if self.welcome.iter().all(|m| m.command != msg.command) {
            self.welcome.push(msg);
        }
    }

    pub fn begin_motd(&mut self, msg: Message) {
        self.motd.clear();
        self.motd.push(msg);
    }

    pub fn append_motd(&mut self, msg: Message) {
        if !self.motd.is_empty() {
            self.motd.push(msg);
        }
    }

    pub fn end_motd(&mut self, msg: Message) {
        if !self.motd.is_empty() {
            self.motd.push(msg);
            self.seen_motd = true;
        }
    }

    // ── Channel caches ───────────────────────────────────────────

    pub fn record_join(&mut self, name: &str, msg: Message) {
        let chan = self.channels.entry(chan_key(name)).or_default();
        chan.name = name.to_owned();
        chan.joined = true;
        chan.join_msg = Some(msg);
    }

    /// Explicit PART (or KICK) evicts the cache entry; a rejoin goes to
    /// the server again.
    pub fn record_part(&mut self, name: &str) {
        if self.channels.remove(&chan_key(name)).is_some() {
            debug!(channel = name, "evicted channel cache");
        }
    }

    pub fn record_topic(&mut self, name: &str, msg: Message) {
        if let Some(chan) = self.channels.get_mut(&chan_key(name)) {
            chan.topic = Some(msg);
        }
    }

    /// A live TOPIC change; recast as the 332 reply we'd replay.
    pub fn record_topic_change(&mut self, name: &str, text: &str, server_prefix: Option<&str>) {
        if let Some(chan) = self.channels.get_mut(&chan_key(name)) {
            chan.topic = Some(Message::new(
                server_prefix,
                "332",
                &[self.nick.as_str(), chan.name.as_str(), text],
            ));
        }
    }

    pub fn record_names(&mut self, name: &str, msg: Message) {
        if let Some(chan) = self.channels.get_mut(&chan_key(name)) {
            if chan.names_done {
                // A NAMES refresh: restart the list rather than appending.
                chan.names.clear();
                chan.end_of_names = None;
                chan.names_done = false;
            }
            chan.names.push(msg);
        }
    }

    pub fn end_names(&mut self, name: &str, msg: Message) {
        if let Some(chan) = self.channels.get_mut(&chan_key(name)) {
            chan.end_of_names = Some(msg);
            chan.names_done = true;
        }
    }

    pub fn is_joined(&self, name: &str) -> bool {
        self.channels
            .get(&chan_key(name))
            .is_some_and(|c| c.joined)
    }

    // ── Backlog ──────────────────────────────────────────────────

    /// Buffer a channel message seen while the client is away. Oldest
    /// lines fall off once the channel hits the configured capacity.
    pub fn push_backlog(&mut self, name: &str, msg: Message) {
        if self.backlog_limit == 0 {
            return;
        }
        if let Some(chan) = self.channels.get_mut(&chan_key(name)) {
            if !chan.joined {
                return;
            }
            chan.backlog.push_back(msg);
            while chan.backlog.len() > self.backlog_limit {
                chan.backlog.pop_front();
            }
        }
    }

    pub fn drain_backlog(&mut self, name: &str) -> Vec<Message> {
        self.channels
            .get_mut(&chan_key(name))
            .map(|chan| chan.backlog.drain(..).collect())
            .unwrap_or_default()
    }

    // ── Replay ───────────────────────────────────────────────────

    /// The burst a reconnecting client receives in place of a server
    /// handshake: a proxy-authored 001, the cached 002/003/004 (or
    /// placeholders), then the cached MOTD.
    pub fn snapshot_handshake(&self) -> Vec<Message> {
        let nick = self.nick.as_str();
        let mut out = Vec::new();

        let greeting = format!("Welcome back to IRC Idler, {nick}");
        out.push(Message::new(
            Some(PROXY_NAME),
            "001",
            &[nick, greeting.as_str()],
        ));

        if self.welcome.len() == 3 {
            out.extend(self.welcome.iter().cloned());
        } else {
            out.push(Message::new(
                Some(PROXY_NAME),
                "002",
                &[nick, "Your host is irc-idler"],
            ));
            out.push(Message::new(
                Some(PROXY_NAME),
                "003",
                &[nick, "This server was created a while back"],
            ));
            out.push(Message::new(
                Some(PROXY_NAME),
                "004",
                &[nick, PROXY_NAME, "irc-idler-0.1.0", "0", "0"],
            ));
        }

        out.extend(self.motd.iter().cloned());
        out
    }

    /// The cached join sequence for a channel the session already sits in:
    /// JOIN line, topic, names, end-of-names. Cached lines are replayed
    /// verbatim; missing ones are synthesized so a client that re-joins a
    /// half-cached channel is never left hanging.
    pub fn replay_channel(&self, name: &str) -> Option<Vec<Message>> {
        let chan = self.channels.get(&chan_key(name)).filter(|c| c.joined)?;
        let mut out = Vec::new();

        match &chan.join_msg {
            Some(join) => out.push(join.clone()),
            None => out.push(Message::new(
                Some(self.nick.as_str()),
                "JOIN",
                &[chan.name.as_str()],
            )),
        }
        if let Some(topic) = &chan.topic {
            out.push(topic.clone());
        }
        out.extend(chan.names.iter().cloned());
        match &chan.end_of_names {
            Some(end) => out.push(end.clone()),
            None => out.push(Message::new(
                Some(PROXY_NAME),
                "366",
                &[self.nick.as_str(), chan.name.as_str(), "End of /NAMES list"],
            )),
        }

        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn registered_session() -> SessionState {
        let mut s = SessionState::new(0);
        s.client_connected();
        s.record_nick("alice");
        s.record_user(Message::parse("USER alice 0 * :Alice").unwrap());
        s.record_welcome(Some("alice"));
        s
    }

    fn join_sandstorm(s: &mut SessionState) {
        s.record_join(
            "#sandstorm",
            Message::parse(":alice JOIN #sandstorm").unwrap(),
        );
        s.record_topic(
            "#sandstorm",
            Message::parse(":irc.example.com 332 alice #sandstorm :Welcome to #sandstorm!").unwrap(),
        );
        s.record_names(
            "#sandstorm",
            Message::parse(":irc.example.com 353 alice = #sandstorm :alice").unwrap(),
        );
        s.record_names(
            "#sandstorm",
            Message::parse(":irc.example.com 353 alice = #sandstorm :bob").unwrap(),
        );
        s.end_names(
            "#sandstorm",
            Message::parse(":irc.example.com 366 alice #sandstorm :End of NAMES list").unwrap(),
        );
    }

    // ── Registration phases ──────────────────────────────────────

    #[test]
    fn nick_then_user_advances_to_server_handshake() {
        let mut s = SessionState::new(0);
        s.client_connected();
        assert_eq!(s.phase, Phase::ClientHandshaking);
        s.record_nick("alice");
        assert_eq!(s.phase, Phase::ClientHandshaking);
        s.record_user(Message::parse("USER alice 0 * :Alice").unwrap());
        assert_eq!(s.phase, Phase::ServerHandshaking);
    }

    #[test]
    fn user_then_nick_advances_too() {
        let mut s = SessionState::new(0);
        s.client_connected();
        s.record_user(Message::parse("USER alice 0 * :Alice").unwrap());
        assert_eq!(s.phase, Phase::ClientHandshaking);
        s.record_nick("alice");
        assert_eq!(s.phase, Phase::ServerHandshaking);
    }

    #[test]
    fn welcome_registers_and_syncs_nick() {
        let mut s = SessionState::new(0);
        s.client_connected();
        s.record_nick("alice_");
        s.record_user(Message::parse("USER alice 0 * :Alice").unwrap());
        s.record_welcome(Some("alice"));
        assert_eq!(s.phase, Phase::Registered);
        assert_eq!(s.nick, "alice");
    }

    #[test]
    fn nick_rejection_reopens_client_handshake() {
        let mut s = SessionState::new(0);
        s.client_connected();
        s.record_nick("alice");
        s.record_user(Message::parse("USER alice 0 * :Alice").unwrap());
        s.nick_rejected();
        assert_eq!(s.phase, Phase::ClientHandshaking);
        assert!(s.nick.is_empty());
        // A fresh NICK picks the handshake back up.
        s.record_nick("alice2");
        assert_eq!(s.phase, Phase::ServerHandshaking);
    }

    #[test]
    fn client_gone_and_back() {
        let mut s = registered_session();
        s.client_gone();
        assert_eq!(s.phase, Phase::ClientAbsent);
        s.client_returned();
        assert_eq!(s.phase, Phase::Registered);
    }

    // ── Channel caches ───────────────────────────────────────────

    #[test]
    fn join_marks_channel_joined() {
        let mut s = registered_session();
        join_sandstorm(&mut s);
        assert!(s.is_joined("#sandstorm"));
        // Case-insensitive lookup.
        assert!(s.is_joined("#SandStorm"));
        assert!(!s.is_joined("#other"));
    }

    #[test]
    fn part_evicts_channel() {
        let mut s = registered_session();
        join_sandstorm(&mut s);
        s.record_part("#sandstorm");
        assert!(!s.is_joined("#sandstorm"));
        assert_eq!(s.replay_channel("#sandstorm"), None);
    }

    #[test]
    fn replay_channel_is_cached_sequence() {
        let mut s = registered_session();
        join_sandstorm(&mut s);
        let replay = s.replay_channel("#sandstorm").unwrap();
        let wires: Vec<String> = replay.iter().map(|m| m.to_wire()).collect();
        assert_eq!(
            wires,
            vec![
                ":alice JOIN #sandstorm",
                ":irc.example.com 332 alice #sandstorm :Welcome to #sandstorm!",
                ":irc.example.com 353 alice = #sandstorm alice",
                ":irc.example.com 353 alice = #sandstorm bob",
                ":irc.example.com 366 alice #sandstorm :End of NAMES list",
            ]
        );
    }

    #[test]
    fn replay_synthesizes_missing_pieces() {
        let mut s = registered_session();
        // Joined but the server never finished the names burst.
        s.record_join(
            "#limbo",
            Message::parse(":alice JOIN #limbo").unwrap(),
        );
        let replay = s.replay_channel("#limbo").unwrap();
        assert_eq!(replay.first().unwrap().to_wire(), ":alice JOIN #limbo");
        let end = replay.last().unwrap();
        assert_eq!(end.command, "366");
        assert_eq!(end.params[1], "#limbo");
    }

    #[test]
    fn names_refresh_restarts_list() {
        let mut s = registered_session();
        join_sandstorm(&mut s);
        // A later NAMES refresh must not duplicate the cached entries.
        s.record_names(
            "#sandstorm",
            Message::parse(":irc.example.com 353 alice = #sandstorm :alice bob carol").unwrap(),
        );
        s.end_names(
            "#sandstorm",
            Message::parse(":irc.example.com 366 alice #sandstorm :End of NAMES list").unwrap(),
        );
        let replay = s.replay_channel("#sandstorm").unwrap();
        let names: Vec<_> = replay.iter().filter(|m| m.command == "353").collect();
        assert_eq!(names.len(), 1);
        assert_eq!(names[0].params[3], "alice bob carol");
    }

    #[test]
    fn topic_change_updates_cache() {
        let mut s = registered_session();
        join_sandstorm(&mut s);
        s.record_topic_change("#sandstorm", "new topic", Some("bob!b@h"));
        let replay = s.replay_channel("#sandstorm").unwrap();
        let topic = replay.iter().find(|m| m.command == "332").unwrap();
        assert_eq!(topic.params, vec!["alice", "#sandstorm", "new topic"]);
    }

    #[test]
    fn nick_change_rewrites_cached_join_prefix() {
        let mut s = registered_session();
        s.record_join(
            "#sandstorm",
            Message::parse(":alice!alice@host JOIN #sandstorm").unwrap(),
        );
        s.record_nick_change("alicia");
        assert_eq!(s.nick, "alicia");
        let replay = s.replay_channel("#sandstorm").unwrap();
        assert_eq!(
            replay[0].prefix.as_deref(),
            Some("alicia!alice@host")
        );
    }

    // ── MOTD / handshake snapshot ────────────────────────────────

    #[test]
    fn snapshot_replays_cached_welcome_and_motd() {
        let mut s = registered_session();
        s.record_welcome_info(
            Message::parse(":irc.example.com 002 alice :Your host is irc.example.com").unwrap(),
        );
        s.record_welcome_info(
            Message::parse(":irc.example.com 003 alice :This server was created today").unwrap(),
        );
        s.record_welcome_info(
            Message::parse(":irc.example.com 004 alice irc.example.com mock-0.1 0 0").unwrap(),
        );
        s.begin_motd(Message::parse(":irc.example.com 375 alice :- motd start").unwrap());
        s.append_motd(Message::parse(":irc.example.com 372 alice :- Hello, World").unwrap());
        s.end_motd(Message::parse(":irc.example.com 376 alice :End MOTD.").unwrap());
        assert!(s.seen_motd);

        let wires: Vec<String> = s
            .snapshot_handshake()
            .iter()
            .map(|m| m.to_wire())
            .collect();
        assert_eq!(
            wires,
            vec![
                ":irc-idler 001 alice :Welcome back to IRC Idler, alice",
                ":irc.example.com 002 alice :Your host is irc.example.com",
                ":irc.example.com 003 alice :This server was created today",
                ":irc.example.com 004 alice irc.example.com mock-0.1 0 0",
                ":irc.example.com 375 alice :- motd start",
                ":irc.example.com 372 alice :- Hello, World",
                ":irc.example.com 376 alice :End MOTD.",
            ]
        );
    }

    #[test]
    fn snapshot_without_cache_uses_placeholders() {
        let s = registered_session();
        let burst = s.snapshot_handshake();
        let commands: Vec<_> = burst.iter().map(|m| m.command.as_str()).collect();
        // 001 plus the placeholder triplet; no MOTD was ever seen.
        assert_eq!(commands, vec!["001", "002", "003", "004"]);
        assert_eq!(
            burst[0].params[1],
            "Welcome back to IRC Idler, alice"
        );
    }

    // ── Backlog ──────────────────────────────────────────────────

    #[test]
    fn backlog_drops_oldest_at_capacity() {
        let mut s = SessionState::new(2);
        s.client_connected();
        s.record_nick("alice");
        s.record_user(Message::parse("USER alice 0 * :Alice").unwrap());
        s.record_welcome(Some("alice"));
        join_sandstorm(&mut s);

        for text in ["one", "two", "three"] {
            s.push_backlog(
                "#sandstorm",
                Message::new(Some("bob!b@h"), "PRIVMSG", &["#sandstorm", text]),
            );
        }
        let drained = s.drain_backlog("#sandstorm");
        let texts: Vec<_> = drained.iter().map(|m| m.params[1].as_str()).collect();
        assert_eq!(texts, vec!["two", "three"]);
        // Drained means gone.
        assert!(s.drain_backlog("#sandstorm").is_empty());
    }

    #[test]
    fn backlog_disabled_at_zero() {
        let mut s = registered_session();
        join_sandstorm(&mut s);
        s.push_backlog(
            "#sandstorm",
            Message::new(Some("bob"), "PRIVMSG", &["#sandstorm", "hi"]),
        );
        assert!(s.drain_backlog("#sandstorm").is_empty());
    }

    #[test]
    fn reset_forgets_everything() {
        let mut s = registered_session();
        join_sandstorm(&mut s);
        s.reset();
        assert_eq!(s.phase, Phase::ClientUnconnected);
        assert!(s.nick.is_empty());
        assert!(!s.is_joined("#sandstorm"));
        assert!(!s.seen_motd);
    }
}
