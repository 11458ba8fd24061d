//! Network handling for the buzzer server
//!
//! Line-delimited JSON over TCP. Each connection gets a reader loop that maps
//! client messages onto the buzz service and a writer task draining the
//! connection's outbound channel (replies and room events share it, so a
//! client sees them in the order they were produced).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use buzzer_core::round::{parse_number, parse_timestamp, BuzzResponse};
use buzzer_core::{
    BuzzEngine, BuzzService, ClientMessage, Collaborators, EngineConfig, RoundSnapshot, ServerMessage,
    SystemTime,
};
use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::filter::Directive;

use crate::error::ServerError;
use crate::hub::Hub;
use crate::metrics::{LogLevel, Metrics, MetricsSink, ServerStatus};

/// Default listen address
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:4002";

/// Env var holding the secret that lets a later join claim admin rights
const ADMIN_TOKEN_VAR: &str = "BUZZ_ADMIN_TOKEN";

/// What a connection has told us about itself
#[derive(Debug, Default)]
struct Session {
    conn_id: String,
    room_id: Option<String>,
    player_id: Option<String>,
    is_admin: bool,
}

/// Shared server state
pub struct Server {
    service: BuzzService,
    hub: Arc<Hub>,
    metrics: Arc<RwLock<Metrics>>,
    next_conn: AtomicU64,
    admin_token: Option<String>,
}

/// One room as shown on the dashboard
#[derive(Debug, Clone, PartialEq)]
pub struct RoomOverview {
    pub room_id: String,
    pub connections: usize,
    pub round: RoundSnapshot,
}

impl Server {
    pub fn new(config: EngineConfig, metrics: Arc<RwLock<Metrics>>, runtime: Handle) -> Self {
        let hub = Arc::new(Hub::new());
        let collaborators = Collaborators::new(hub.clone(), Arc::new(MetricsSink(Arc::clone(&metrics))));
        let engine = BuzzEngine::new(config, Arc::new(SystemTime), collaborators);
        Self {
            service: BuzzService::new(Arc::new(engine), runtime),
            hub,
            metrics,
            next_conn: AtomicU64::new(1),
            admin_token: None,
        }
    }

    /// Secret a join must present to claim admin rights in a room it did not open
    pub fn with_admin_token(mut self, token: Option<String>) -> Self {
        self.admin_token = token.filter(|t| !t.is_empty());
        self
    }

    /// Open rooms with their connection count and round state
    pub fn room_overview(&self) -> Vec<RoomOverview> {
        let engine = self.engine();
        engine
            .room_ids()
            .into_iter()
            .filter_map(|room_id| {
                let round = engine.snapshot(&room_id)?;
                Some(RoomOverview {
                    connections: self.hub.room_size(&room_id),
                    room_id,
                    round,
                })
            })
            .collect()
    }

    fn admin_token_matches(&self, presented: Option<&str>) -> bool {
        matches!((self.admin_token.as_deref(), presented), (Some(expected), Some(given)) if expected == given)
    }

    fn engine(&self) -> &BuzzEngine {
        self.service.engine()
    }

    /// Accept connections until the listener fails
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, peer).await {
                    warn!("Connection from {} ended with error: {}", peer, e);
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), ServerError> {
        let conn_id = format!("conn-{}", self.next_conn.fetch_add(1, Ordering::Relaxed));
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", conn_id, e);
        }
        let (read_half, mut write_half) = stream.into_split();

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        self.hub.connect(&conn_id, tx);
        info!("Client connected: {} ({})", conn_id, peer);
        self.metrics.write().connection_opened(&conn_id, &peer.to_string());

        let writer = tokio::spawn(async move {
            while let Some(mut line) = rx.recv().await {
                line.push('\n');
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let mut session = Session {
            conn_id: conn_id.clone(),
            ..Session::default()
        };
        let mut lines = BufReader::new(read_half).lines();
        let result = loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if let Some(reply) = self.handle_line(&mut session, &line) {
                        match encode(&reply) {
                            Ok(encoded) => {
                                self.hub.send_to(&conn_id, encoded);
                            }
                            Err(e) => warn!("Failed to encode reply for {}: {}", conn_id, e),
                        }
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(ServerError::from(e)),
            }
        };

        self.close_session(&session);
        writer.abort();
        result
    }

    /// Decode one line and act on it
    fn handle_line(&self, session: &mut Session, line: &str) -> Option<ServerMessage> {
        match serde_json::from_str::<ClientMessage>(line) {
            Ok(message) => self.dispatch(session, message),
            Err(e) => {
                debug!("Malformed message from {}: {}", session.conn_id, e);
                self.metrics
                    .write()
                    .log(LogLevel::Warning, format!("Malformed message from {}", session.conn_id));
                Some(error(format!("invalid message: {}", e)))
            }
        }
    }

    fn dispatch(&self, session: &mut Session, message: ClientMessage) -> Option<ServerMessage> {
        let conn_id = session.conn_id.as_str();

        if message.requires_admin() && !session.is_admin {
            return Some(error("admin_required"));
        }

        match message {
            ClientMessage::Sync { client_timestamp } => {
                let reply = self.engine().accept_sync(conn_id, parse_timestamp(&client_timestamp));
                Some(ServerMessage::SyncReply(reply))
            }

            ClientMessage::SyncReport { offset, rtt } => {
                self.engine()
                    .accept_sync_report(conn_id, parse_number(&offset), parse_number(&rtt));
                None
            }

            ClientMessage::Ping { client_timestamp } => {
                let result = self.engine().accept_ping(conn_id, parse_timestamp(&client_timestamp));
                Some(ServerMessage::Pong(result))
            }

            ClientMessage::Join {
                room_id,
                player_id,
                pseudonym,
                admin,
                admin_token,
            } => {
                if session.room_id.is_some() {
                    return Some(error("already_joined"));
                }
                let engine = self.engine();
                let opened = engine.open_room(&room_id);
                if opened {
                    self.metrics.write().log(LogLevel::Info, format!("Room opened: {}", room_id));
                }
                // The opener hosts the room; anyone else needs the configured token
                if admin && !opened && !self.admin_token_matches(admin_token.as_deref()) {
                    warn!("{} tried to claim admin in {} without the token", player_id, room_id);
                    self.metrics
                        .write()
                        .log(LogLevel::Warning, format!("Admin claim refused: {} in {}", player_id, room_id));
                    return Some(error("admin_required"));
                }
                engine.register_player(&room_id, &player_id, &pseudonym, Some(conn_id), admin);
                self.hub.join(conn_id, &room_id);
                self.metrics.write().open_rooms = engine.room_ids().len();

                info!("{} joined {} as {} (admin={})", player_id, room_id, pseudonym, admin);
                session.room_id = Some(room_id.clone());
                session.player_id = Some(player_id.clone());
                session.is_admin = admin;
                Some(ServerMessage::Joined { room_id, player_id })
            }

            ClientMessage::Buzz { client_timestamp } => {
                let (Some(room_id), Some(player_id)) = (&session.room_id, &session.player_id) else {
                    return Some(error("not_joined"));
                };
                let response = match self
                    .service
                    .accept_buzz(room_id, player_id, parse_timestamp(&client_timestamp))
                {
                    Ok(_) => {
                        self.metrics.write().buzz_accepted();
                        BuzzResponse::received()
                    }
                    Err(rejection) => {
                        self.metrics.write().buzz_rejected(rejection.code());
                        BuzzResponse::rejected(&rejection)
                    }
                };
                Some(ServerMessage::BuzzResponse(response))
            }

            admin_message => {
                let Some(room_id) = session.room_id.as_deref() else {
                    return Some(error("not_joined"));
                };
                self.dispatch_admin(room_id, admin_message)
            }
        }
    }

    fn dispatch_admin(&self, room_id: &str, message: ClientMessage) -> Option<ServerMessage> {
        let engine = self.engine();
        let applied = match message {
            ClientMessage::JudgmentStart => self.service.accept_judgment_start(room_id).map(|_| ()),
            ClientMessage::JudgmentEnd { outcome } => {
                self.service.accept_judgment_end(room_id, outcome).map(|_| ())
            }
            ClientMessage::Reset => {
                return (!engine.accept_reset(room_id)).then(|| error("room_missing"));
            }
            ClientMessage::Pause { paused } => {
                return (!engine.set_paused(room_id, paused)).then(|| error("room_missing"));
            }
            ClientMessage::QuestionChanged => {
                return (!engine.mark_question_changed(room_id)).then(|| error("room_missing"));
            }
            other => {
                debug!("Unexpected admin dispatch: {:?}", other);
                return None;
            }
        };
        applied.err().map(|e| error(e.code()))
    }

    /// Tear down everything a connection owned
    fn close_session(&self, session: &Session) {
        let room = self.hub.disconnect(&session.conn_id);
        let engine = self.engine();
        engine.accept_disconnect(&session.conn_id);

        if let Some(room_id) = room {
            if self.hub.room_size(&room_id) == 0 && engine.close_room(&room_id) {
                self.metrics.write().log(LogLevel::Info, format!("Room closed: {}", room_id));
            }
        }

        info!("Client disconnected: {}", session.conn_id);
        let mut m = self.metrics.write();
        m.open_rooms = engine.room_ids().len();
        m.connection_closed(&session.conn_id);
    }
}

fn encode(message: &ServerMessage) -> Result<String, ServerError> {
    Ok(serde_json::to_string(message)?)
}

fn error(message: impl Into<String>) -> ServerMessage {
    ServerMessage::Error {
        message: message.into(),
    }
}

/// Bind address from `BIND_ADDR`, falling back to the default
fn bind_addr() -> Result<SocketAddr, ServerError> {
    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
    addr.parse().map_err(|_| ServerError::InvalidAddress(addr))
}

/// Bind the listener and build the server, reporting into the metrics store
pub async fn start(metrics: Arc<RwLock<Metrics>>) -> Result<(Arc<Server>, TcpListener), ServerError> {
    let config = EngineConfig::from_env();
    let addr = bind_addr()?;

    info!("Buzzer server starting...");
    info!(
        "Engine: min delay {}ms, default RTT {}ms, penalty {}ms",
        config.min_buzz_delay_ms, config.default_rtt_ms, config.default_penalty_ms
    );

    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            let mut m = metrics.write();
            m.status = ServerStatus::Error;
            m.log(LogLevel::Error, format!("Bind {} failed: {}", addr, e));
            return Err(e.into());
        }
    };

    {
        let mut m = metrics.write();
        m.bind_addr = addr.to_string();
        m.status = ServerStatus::Running;
        m.log(LogLevel::Info, format!("Listening on {}", addr));
    }
    info!("Listening on {}", addr);

    let admin_token = std::env::var(ADMIN_TOKEN_VAR).ok();
    if admin_token.is_none() {
        info!("{} not set: only room openers get admin rights", ADMIN_TOKEN_VAR);
    }
    let server = Server::new(config, Arc::clone(&metrics), Handle::current()).with_admin_token(admin_token);
    Ok((Arc::new(server), listener))
}

fn directive(value: &str) -> Result<Directive, ServerError> {
    value.parse().map_err(|e| ServerError::Logging(format!("{}: {}", value, e)))
}

/// Run with plain logging (no dashboard)
pub async fn run_with_logging(metrics: Arc<RwLock<Metrics>>) -> Result<(), ServerError> {
    // Initialize tracing for logging mode
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(directive("buzzer_core=info")?)
                .add_directive(directive("buzzer_server=info")?),
        )
        .try_init()
        .map_err(|e| ServerError::Logging(e.to_string()))?;

    let (server, listener) = start(metrics).await?;
    server.serve(listener).await
}
