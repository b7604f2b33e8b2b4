//! # Loopback Server
//!
//! Accept connections on an ephemeral port, parse RESP commands, and answer
//! them from a test handler or the built-in defaults.

use std::collections::HashMap;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::debug;

use rkv_common::{encode_reply, read_frame, Frame, ProtocolVersion, Reply, ReplyDecoder};

/// First server-side client id handed out; session `n` gets `BASE + n`.
const CLIENT_ID_BASE: i64 = 100;

/// What the server does with one command.
#[derive(Debug, Clone)]
pub enum Response {
    Reply(Reply),
    /// Read the command and never answer it.
    Silent,
    /// Answer after sleeping.
    Delay(Duration, Reply),
    /// Close the connection without answering.
    Close,
}

impl From<Reply> for Response {
    fn from(reply: Reply) -> Self {
        Response::Reply(reply)
    }
}

/// Snapshot of one accepted connection.
#[derive(Debug, Clone)]
pub struct Session {
    /// Accept order, starting at 0.
    pub index: usize,
    pub client_id: i64,
    pub protocol: ProtocolVersion,
    pub name: Option<String>,
    pub tracking: bool,
    /// Arguments of the last `CLIENT TRACKING` command after `TRACKING`.
    pub tracking_args: Vec<String>,
}

/// One command as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedCommand {
    pub session: usize,
    pub args: Vec<Bytes>,
}

impl LoggedCommand {
    /// Command words joined by spaces, lossily decoded.
    pub fn line(&self) -> String {
        self.args
            .iter()
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// True when the first words equal `words`, ignoring ASCII case.
    pub fn is(&self, words: &[&str]) -> bool {
        words.len() <= self.args.len()
            && words
                .iter()
                .zip(&self.args)
                .all(|(word, arg)| arg.eq_ignore_ascii_case(word.as_bytes()))
    }
}

/// Test handler; `None` falls through to the defaults.
pub type Handler = Arc<dyn Fn(&Session, &[Bytes]) -> Option<Response> + Send + Sync>;

/// Server behavior switches.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Answer `HELLO`; when false the server behaves like a RESP2-only peer.
    pub hello: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions { hello: true }
    }
}

struct SessionSlot {
    info: Session,
    writer: Arc<Mutex<TcpStream>>,
}

struct ServerState {
    options: ServerOptions,
    handler: Handler,
    sessions: Mutex<Vec<SessionSlot>>,
    log: Mutex<Vec<LoggedCommand>>,
    store: Mutex<HashMap<Bytes, Bytes>>,
    shutdown: AtomicBool,
}

/// Loopback server; shuts down and closes every session on drop.
pub struct MockServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
}

impl MockServer {
    /// Starts a server answering everything from the defaults.
    pub fn start() -> io::Result<MockServer> {
        Self::start_with(ServerOptions::default(), |_, _| None)
    }

    /// Starts a server with a scripted handler.
    pub fn with_handler<F>(handler: F) -> io::Result<MockServer>
    where
        F: Fn(&Session, &[Bytes]) -> Option<Response> + Send + Sync + 'static,
    {
        Self::start_with(ServerOptions::default(), handler)
    }

    pub fn start_with<F>(options: ServerOptions, handler: F) -> io::Result<MockServer>
    where
        F: Fn(&Session, &[Bytes]) -> Option<Response> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let state = Arc::new(ServerState {
            options,
            handler: Arc::new(handler),
            sessions: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
            store: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        });

        let accept_state = Arc::clone(&state);
        thread::spawn(move || accept_loop(listener, accept_state));
        debug!(%addr, "mock server listening");
        Ok(MockServer { addr, state })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `host:port` form for client configuration.
    pub fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    /// Every command received so far, in arrival order.
    pub fn commands(&self) -> Vec<LoggedCommand> {
        self.state.log.lock().clone()
    }

    /// Commands received on one session.
    pub fn commands_for(&self, session: usize) -> Vec<LoggedCommand> {
        self.state
            .log
            .lock()
            .iter()
            .filter(|cmd| cmd.session == session)
            .cloned()
            .collect()
    }

    /// Number of received commands whose first words match `words`.
    pub fn count(&self, words: &[&str]) -> usize {
        self.state.log.lock().iter().filter(|cmd| cmd.is(words)).count()
    }

    pub fn clear_log(&self) {
        self.state.log.lock().clear();
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.state
            .sessions
            .lock()
            .iter()
            .map(|slot| slot.info.clone())
            .collect()
    }

    pub fn session(&self, index: usize) -> Option<Session> {
        self.state.session(index)
    }

    /// Writes an out-of-band push to one session, encoded for its protocol.
    pub fn push(&self, session: usize, items: Vec<Reply>) -> io::Result<()> {
        let (writer, protocol) = {
            let sessions = self.state.sessions.lock();
            let slot = sessions
                .get(session)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such session"))?;
            (Arc::clone(&slot.writer), slot.info.protocol)
        };
        write_reply(&writer, &Reply::Push(items), protocol)
    }

    /// Closes every open session from the server side.
    pub fn disconnect_all(&self) {
        for slot in self.state.sessions.lock().iter() {
            let _ = slot.writer.lock().shutdown(Shutdown::Both);
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.state.shutdown.store(true, Ordering::SeqCst);
        self.disconnect_all();
        // Wake the acceptor so it observes the flag.
        let _ = TcpStream::connect_timeout(&self.addr, Duration::from_millis(100));
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

fn accept_loop(listener: TcpListener, state: Arc<ServerState>) {
    for stream in listener.incoming() {
        if state.shutdown.load(Ordering::SeqCst) {
            break;
        }
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                debug!(error = %err, "accept failed");
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        let session_state = Arc::clone(&state);
        thread::spawn(move || {
            if let Err(err) = serve_session(stream, session_state) {
                debug!(error = %err, "session ended with error");
            }
        });
    }
}

fn serve_session(stream: TcpStream, state: Arc<ServerState>) -> io::Result<()> {
    let mut reader = stream.try_clone()?;
    let writer = Arc::new(Mutex::new(stream));
    let index = {
        let mut sessions = state.sessions.lock();
        let index = sessions.len();
        sessions.push(SessionSlot {
            info: Session {
                index,
                client_id: CLIENT_ID_BASE + index as i64,
                protocol: ProtocolVersion::Resp2,
                name: None,
                tracking: false,
                tracking_args: Vec::new(),
            },
            writer: Arc::clone(&writer),
        });
        index
    };
    debug!(session = index, "session accepted");

    let mut decoder = ReplyDecoder::new(ProtocolVersion::Resp2);
    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        let frame = match read_frame(&mut reader, &mut buf, &mut decoder) {
            Ok(Some(Frame::Reply(reply))) => reply,
            Ok(Some(Frame::Push(_))) | Ok(None) => break,
            Err(err) => {
                debug!(session = index, error = %err, "unreadable command");
                break;
            }
        };

        let protocol = state.protocol_of(index);
        let args = match command_args(frame) {
            Some(args) if !args.is_empty() => args,
            _ => {
                write_reply(&writer, &Reply::error("ERR Protocol error: expected array of bulk strings"), protocol)?;
                continue;
            }
        };
        state.log.lock().push(LoggedCommand {
            session: index,
            args: args.clone(),
        });

        let response = match state.session(index) {
            Some(snapshot) => (state.handler)(&snapshot, &args),
            None => None,
        };
        let response = match response {
            Some(response) => response,
            None => state.default_response(index, &args),
        };

        let protocol = state.protocol_of(index);
        match response {
            Response::Reply(reply) => write_reply(&writer, &reply, protocol)?,
            Response::Silent => {}
            Response::Delay(pause, reply) => {
                thread::sleep(pause);
                write_reply(&writer, &reply, protocol)?;
            }
            Response::Close => {
                let _ = writer.lock().shutdown(Shutdown::Both);
                break;
            }
        }
    }

    debug!(session = index, "session closed");
    Ok(())
}

fn command_args(frame: Reply) -> Option<Vec<Bytes>> {
    match frame {
        Reply::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Reply::BulkString(data) => Some(data),
                _ => None,
            })
            .collect(),
        _ => None,
    }
}

fn write_reply(writer: &Mutex<TcpStream>, reply: &Reply, protocol: ProtocolVersion) -> io::Result<()> {
    let mut out = Vec::with_capacity(64);
    encode_reply(reply, protocol, &mut out);
    let mut stream = writer.lock();
    stream.write_all(&out)?;
    stream.flush()
}

fn eq_ignore_ascii_case(arg: &[u8], word: &str) -> bool {
    arg.eq_ignore_ascii_case(word.as_bytes())
}

fn text(arg: &[u8]) -> String {
    String::from_utf8_lossy(arg).into_owned()
}

impl ServerState {
    fn session(&self, index: usize) -> Option<Session> {
        self.sessions.lock().get(index).map(|slot| slot.info.clone())
    }

    fn protocol_of(&self, index: usize) -> ProtocolVersion {
        self.sessions
            .lock()
            .get(index)
            .map(|slot| slot.info.protocol)
            .unwrap_or_default()
    }

    fn update(&self, index: usize, apply: impl FnOnce(&mut Session)) {
        if let Some(slot) = self.sessions.lock().get_mut(index) {
            apply(&mut slot.info);
        }
    }

    fn default_response(&self, index: usize, args: &[Bytes]) -> Response {
        let verb = &args[0];
        if eq_ignore_ascii_case(verb, "HELLO") {
            return self.handle_hello(index, args);
        }
        if eq_ignore_ascii_case(verb, "CLIENT") {
            return self.handle_client(index, args);
        }
        if eq_ignore_ascii_case(verb, "PING") {
            return match args.len() {
                1 => Reply::simple("PONG").into(),
                2 => Reply::bulk(args[1].clone()).into(),
                _ => Reply::error("ERR wrong number of arguments for 'ping' command").into(),
            };
        }
        if eq_ignore_ascii_case(verb, "ECHO") && args.len() == 2 {
            return Reply::bulk(args[1].clone()).into();
        }
        if eq_ignore_ascii_case(verb, "QUIT") {
            return Response::Close;
        }
        if eq_ignore_ascii_case(verb, "GET") && args.len() == 2 {
            return match self.store.lock().get(&args[1]) {
                Some(value) => Reply::bulk(value.clone()).into(),
                None => Reply::Nil.into(),
            };
        }
        if eq_ignore_ascii_case(verb, "SET") && args.len() == 3 {
            self.store.lock().insert(args[1].clone(), args[2].clone());
            return Reply::simple("OK").into();
        }
        if eq_ignore_ascii_case(verb, "DEL") && args.len() >= 2 {
            let mut store = self.store.lock();
            let removed = args[1..].iter().filter(|key| store.remove(*key).is_some()).count();
            return Reply::Integer(removed as i64).into();
        }
        if eq_ignore_ascii_case(verb, "INCR") && args.len() == 2 {
            let mut store = self.store.lock();
            let current = match store.get(&args[1]) {
                Some(value) => match std::str::from_utf8(value).ok().and_then(|v| v.parse::<i64>().ok()) {
                    Some(number) => number,
                    None => {
                        return Reply::error("ERR value is not an integer or out of range").into()
                    }
                },
                None => 0,
            };
            let next = current + 1;
            store.insert(args[1].clone(), Bytes::from(next.to_string()));
            return Reply::Integer(next).into();
        }

        Reply::error(format!("ERR unknown command '{}'", text(verb))).into()
    }

    fn handle_hello(&self, index: usize, args: &[Bytes]) -> Response {
        if !self.options.hello {
            return Reply::error("ERR unknown command 'HELLO'").into();
        }
        let protocol = match args.get(1).map(|arg| arg.as_ref()) {
            None | Some(b"2") => ProtocolVersion::Resp2,
            Some(b"3") => ProtocolVersion::Resp3,
            Some(_) => return Reply::error("NOPROTO unsupported protocol version").into(),
        };
        self.update(index, |session| session.protocol = protocol);
        let client_id = CLIENT_ID_BASE + index as i64;
        Reply::Map(vec![
            (Reply::bulk("server"), Reply::bulk("rkv-testkit")),
            (Reply::bulk("version"), Reply::bulk("7.2.0")),
            (Reply::bulk("proto"), Reply::Integer(protocol.as_u8() as i64)),
            (Reply::bulk("id"), Reply::Integer(client_id)),
            (Reply::bulk("mode"), Reply::bulk("standalone")),
            (Reply::bulk("role"), Reply::bulk("master")),
            (Reply::bulk("modules"), Reply::Array(Vec::new())),
        ])
        .into()
    }

    fn handle_client(&self, index: usize, args: &[Bytes]) -> Response {
        let sub = match args.get(1) {
            Some(sub) => sub,
            None => return Reply::error("ERR wrong number of arguments for 'client' command").into(),
        };
        if eq_ignore_ascii_case(sub, "ID") {
            return Reply::Integer(CLIENT_ID_BASE + index as i64).into();
        }
        if eq_ignore_ascii_case(sub, "SETNAME") && args.len() == 3 {
            let name = text(&args[2]);
            self.update(index, |session| session.name = Some(name));
            return Reply::simple("OK").into();
        }
        if eq_ignore_ascii_case(sub, "GETNAME") {
            return match self.session(index).and_then(|session| session.name) {
                Some(name) => Reply::bulk(name).into(),
                None => Reply::Nil.into(),
            };
        }
        if eq_ignore_ascii_case(sub, "TRACKING") && args.len() >= 3 {
            let on = if eq_ignore_ascii_case(&args[2], "ON") {
                true
            } else if eq_ignore_ascii_case(&args[2], "OFF") {
                false
            } else {
                return Reply::error("ERR syntax error").into();
            };
            let rest: Vec<String> = args[2..].iter().map(|arg| text(arg)).collect();
            self.update(index, |session| {
                session.tracking = on;
                session.tracking_args = rest;
            });
            return Reply::simple("OK").into();
        }
        Reply::error(format!("ERR unknown subcommand '{}'", text(sub))).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rkv_common::{encode_args, ReplyDecoder};
    use std::io::Read;

    fn roundtrip(stream: &mut TcpStream, args: &[&[u8]], decoder: &mut ReplyDecoder, buf: &mut BytesMut) -> Reply {
        let mut out = Vec::new();
        encode_args(args, &mut out);
        stream.write_all(&out).unwrap();
        match read_frame(stream, buf, decoder).unwrap().unwrap() {
            Frame::Reply(reply) => reply,
            Frame::Push(items) => panic!("unexpected push {:?}", items),
        }
    }

    #[test]
    fn defaults_answer_ping_and_store() {
        let server = MockServer::start().unwrap();
        let mut stream = TcpStream::connect(server.addr()).unwrap();
        let mut decoder = ReplyDecoder::new(ProtocolVersion::Resp2);
        let mut buf = BytesMut::new();

        assert_eq!(roundtrip(&mut stream, &[b"PING"], &mut decoder, &mut buf), Reply::simple("PONG"));
        assert_eq!(roundtrip(&mut stream, &[b"SET", b"k", b"v"], &mut decoder, &mut buf), Reply::simple("OK"));
        assert_eq!(roundtrip(&mut stream, &[b"GET", b"k"], &mut decoder, &mut buf), Reply::bulk("v"));
        assert_eq!(roundtrip(&mut stream, &[b"GET", b"missing"], &mut decoder, &mut buf), Reply::Nil);
        assert_eq!(server.count(&["GET"]), 2);
    }

    #[test]
    fn hello_switches_session_protocol() {
        let server = MockServer::start().unwrap();
        let mut stream = TcpStream::connect(server.addr()).unwrap();
        let mut decoder = ReplyDecoder::new(ProtocolVersion::Resp3);
        let mut buf = BytesMut::new();

        let reply = roundtrip(&mut stream, &[b"HELLO", b"3"], &mut decoder, &mut buf);
        assert!(matches!(reply, Reply::Map(_)));
        assert_eq!(server.session(0).unwrap().protocol, ProtocolVersion::Resp3);
        assert_eq!(roundtrip(&mut stream, &[b"GET", b"none"], &mut decoder, &mut buf), Reply::Nil);
    }

    #[test]
    fn close_response_ends_session() {
        let server = MockServer::with_handler(|_, _| Some(Response::Close)).unwrap();
        let mut stream = TcpStream::connect(server.addr()).unwrap();
        let mut out = Vec::new();
        encode_args(&[b"PING"], &mut out);
        stream.write_all(&out).unwrap();
        let mut byte = [0u8; 1];
        assert_eq!(stream.read(&mut byte).unwrap_or(0), 0);
    }
}
