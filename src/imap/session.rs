//! Session State Machine (spec.md §4.4): per-client IMAP state transitions
//! and command dispatch. Greeted -> Unauth on accept; Unauth -> Auth on a
//! successful LOGIN; any state -> Terminated on LOGOUT or EOF.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::auth::Authenticator;
use crate::errors::{AppError, AppResult};
use crate::imap::connection::FramedConnection;
use crate::model::{ImapRequest, WorkerDescriptor};
use crate::proxy::router::{ProxyRouter, ProxySession};
use crate::rpc::client::CommandArgs;

const GREETING: &str = "* OK [CAPABILITY IMAP4rev1 AUTH=PLAIN] distmail ready";
const CAPABILITY_LINE: &str = "* CAPABILITY IMAP4rev1 AUTH=PLAIN";
const BAD_COMMAND: &str = "BAD Received invalid IMAP command";

const PROXIED_COMMANDS: &[&str] = &["SELECT", "CREATE", "DELETE", "LIST", "APPEND", "EXPUNGE", "STORE"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Unauth,
    Auth,
    Terminated,
}

/// Shared, read-only dependencies every session task needs. Cheap to clone;
/// each field is already an `Arc`.
#[derive(Clone)]
pub struct SessionContext {
    pub authenticator: Arc<dyn Authenticator>,
    pub workers: Arc<[WorkerDescriptor]>,
    pub router: Arc<ProxyRouter>,
}

enum Outcome {
    Continue,
    Terminate,
}

struct ClientSession {
    state: SessionState,
    client_addr: String,
    user_name: String,
    proxy: Option<ProxySession>,
}

/// Drive one accepted connection from greeting to termination.
pub async fn run<S>(stream: S, client_addr: String, ctx: SessionContext) -> AppResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = FramedConnection::new(stream);
    conn.send(GREETING).await?;

    let mut session = ClientSession {
        state: SessionState::Unauth,
        client_addr,
        user_name: String::new(),
        proxy: None,
    };

    loop {
        let Some(req) = conn.receive_request().await? else {
            if let Some(proxy) = session.proxy.as_mut() {
                let _ = proxy.session_done(false).await;
            }
            return Ok(());
        };

        if req.command.is_empty() {
            conn.send(&format!("{} {BAD_COMMAND}", req.tag)).await?;
            continue;
        }

        match handle(&mut session, &req, &mut conn, &ctx).await {
            Ok(Outcome::Continue) => {}
            Ok(Outcome::Terminate) => return Ok(()),
            Err(AppError::Config(msg)) => {
                tracing::error!(error = %msg, "configuration error handling command");
                conn.send(&format!("{} NO internal error", req.tag)).await?;
            }
            Err(e) => {
                if let Some(reply) = e.to_imap_reply() {
                    conn.send(&format!("{} {reply}", req.tag)).await?;
                } else {
                    return Err(e);
                }
            }
        }
    }
}

async fn handle<S>(
    session: &mut ClientSession,
    req: &ImapRequest,
    conn: &mut FramedConnection<S>,
    ctx: &SessionContext,
) -> AppResult<Outcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match req.command.as_str() {
        "CAPABILITY" => handle_capability(req, conn).await,
        "STARTTLS" => {
            conn.send(&format!("{} BAD TLS is already active", req.tag)).await?;
            Ok(Outcome::Continue)
        }
        "LOGOUT" => handle_logout(session, req, conn).await,
        "LOGIN" => handle_login(session, req, conn, ctx).await,
        cmd if PROXIED_COMMANDS.contains(&cmd) => handle_proxied(session, req, conn, &ctx.router).await,
        _ => {
            conn.send(&format!("{} {BAD_COMMAND}", req.tag)).await?;
            Ok(Outcome::Continue)
        }
    }
}

async fn handle_capability<S>(req: &ImapRequest, conn: &mut FramedConnection<S>) -> AppResult<Outcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if !req.payload.is_empty() {
        conn.send(&format!("{} {BAD_COMMAND}", req.tag)).await?;
        return Ok(Outcome::Continue);
    }
    conn.send(CAPABILITY_LINE).await?;
    conn.send(&format!("{} OK CAPABILITY completed", req.tag)).await?;
    Ok(Outcome::Continue)
}

async fn handle_logout<S>(
    session: &mut ClientSession,
    req: &ImapRequest,
    conn: &mut FramedConnection<S>,
) -> AppResult<Outcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if !req.payload.is_empty() {
        conn.send(&format!("{} {BAD_COMMAND}", req.tag)).await?;
        return Ok(Outcome::Continue);
    }
    if let Some(proxy) = session.proxy.as_mut() {
        let _ = proxy.session_done(true).await;
    }
    conn.send("* BYE distmail distributor signing off").await?;
    conn.send(&format!("{} OK LOGOUT completed", req.tag)).await?;
    session.state = SessionState::Terminated;
    Ok(Outcome::Terminate)
}

async fn handle_login<S>(
    session: &mut ClientSession,
    req: &ImapRequest,
    conn: &mut FramedConnection<S>,
    ctx: &SessionContext,
) -> AppResult<Outcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if session.state == SessionState::Auth {
        conn.send(&format!(
            "{} BAD Command LOGIN cannot be executed in this state",
            req.tag
        ))
        .await?;
        return Ok(Outcome::Continue);
    }

    let args = req.args();
    if args.len() != 2 {
        conn.send(&format!("{} {BAD_COMMAND}", req.tag)).await?;
        return Ok(Outcome::Continue);
    }
    let (user, pass) = (args[0], args[1]);

    let authenticated = match ctx
        .authenticator
        .authenticate_plain(user, pass, &session.client_addr)
        .await
    {
        Ok(a) => a,
        Err(AppError::AuthFailed(_)) => {
            conn.send(&format!("{} NO Name and / or password wrong", req.tag)).await?;
            return Ok(Outcome::Continue);
        }
        Err(e) => return Err(e),
    };

    let primary = crate::auth::get_worker_for_user(&ctx.workers, authenticated.user_id)?.clone();
    let secondary = primary
        .secondary_name
        .as_ref()
        .and_then(|name| ctx.workers.iter().find(|w| &w.name == name).cloned());

    let proxy = ProxySession::login(
        &ctx.router,
        primary,
        secondary,
        authenticated.session_id,
        user.to_owned(),
    )
    .await?;

    session.proxy = Some(proxy);
    session.user_name = user.to_owned();
    session.state = SessionState::Auth;
    conn.send(&format!("{} OK LOGIN completed", req.tag)).await?;
    Ok(Outcome::Continue)
}

async fn handle_proxied<S>(
    session: &mut ClientSession,
    req: &ImapRequest,
    conn: &mut FramedConnection<S>,
    router: &ProxyRouter,
) -> AppResult<Outcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if session.state != SessionState::Auth {
        conn.send(&format!("{} {BAD_COMMAND}", req.tag)).await?;
        return Ok(Outcome::Continue);
    }
    let proxy = session
        .proxy
        .as_mut()
        .expect("Auth state implies an open proxy session");

    let cmd = CommandArgs {
        text: req.to_line(),
        session_id: proxy.session_id.clone(),
        user_name: proxy.user_name.clone(),
    };

    if req.command == "APPEND" {
        let first = proxy.tunnel(router, "APPEND", cmd.clone(), None).await?;
        let Some(awaited) = first.awaited_num_bytes else {
            conn.send(&first.text).await?;
            return Ok(Outcome::Continue);
        };
        conn.send("+ Ready for literal data").await?;
        let literal = conn.read_exact_bytes(awaited as usize).await?;
        let second = proxy.tunnel(router, "APPEND", cmd, Some(literal)).await?;
        conn.send(&second.text).await?;
    } else {
        let reply = proxy.tunnel(router, &req.command, cmd, None).await?;
        conn.send(&reply.text).await?;
    }
    Ok(Outcome::Continue)
}

/// End-to-end session tests (spec.md §8): a plain `tokio::io::duplex` pair
/// stands in for the client-facing connection (`run` never does TLS itself
/// — that happens in the binaries' accept loops), while the worker side is
/// a real TCP loopback listener under internal mTLS, certs generated with
/// `rcgen` off a shared root the way `tls.rs`'s own tests do.
#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use prost::Message;
    use rcgen::{BasicConstraints, Certificate, CertificateParams, IsCa, KeyPair};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;

    use super::*;
    use crate::auth::file_store::FileAuthenticator;
    use crate::rpc::{AwaitLiteral, Command, PrepareReply, Reply, SessionDoneReply};
    use crate::rpc::{wire, MethodId};

    fn write_pem(dir: &tempfile::TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn make_ca(dir: &tempfile::TempDir) -> (std::path::PathBuf, Certificate, KeyPair) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key).unwrap();
        let path = write_pem(dir, "ca.crt", cert.pem().as_str());
        (path, cert, key)
    }

    fn ca_signed_leaf(
        dir: &tempfile::TempDir,
        stem: &str,
        ca_cert: &Certificate,
        ca_key: &KeyPair,
    ) -> (std::path::PathBuf, std::path::PathBuf) {
        let key = KeyPair::generate().unwrap();
        let params = CertificateParams::new(vec!["127.0.0.1".to_string()]).unwrap();
        let cert = params.signed_by(&key, ca_cert, ca_key).unwrap();
        let cert_path = write_pem(dir, &format!("{stem}.crt"), cert.pem().as_str());
        let key_path = write_pem(dir, &format!("{stem}.key"), key.serialize_pem().as_str());
        (cert_path, key_path)
    }

    /// One shared root CA, one leaf for the worker (server) side, one leaf
    /// for the router (client) side — a real mTLS chain, not two unrelated
    /// self-signed certs.
    fn internal_configs(dir: &tempfile::TempDir) -> (Arc<rustls::ServerConfig>, Arc<rustls::ClientConfig>) {
        let (ca_path, ca_cert, ca_key) = make_ca(dir);
        let (worker_cert, worker_key) = ca_signed_leaf(dir, "worker", &ca_cert, &ca_key);
        let (router_cert, router_key) = ca_signed_leaf(dir, "router", &ca_cert, &ca_key);

        let server_tls = crate::tls::build_internal_server_config(&ca_path, &worker_cert, &worker_key).unwrap();
        let client_tls = crate::tls::build_internal_client_config(&ca_path, &router_cert, &router_key).unwrap();
        (server_tls, client_tls)
    }

    async fn file_authenticator(dir: &tempfile::TempDir, contents: &str) -> Arc<dyn Authenticator> {
        let path = dir.path().join("users.txt");
        tokio::fs::write(&path, contents).await.unwrap();
        Arc::new(FileAuthenticator::load(&path, ':').await.unwrap())
    }

    fn worker(name: &str, addr: SocketAddr, secondary_name: Option<&str>) -> WorkerDescriptor {
        WorkerDescriptor {
            name: name.to_owned(),
            public_addr: "0.0.0.0:1430".to_owned(),
            internal_addr: addr.to_string(),
            user_start: 1,
            user_end: 100,
            secondary_name: secondary_name.map(str::to_owned),
        }
    }

    async fn send_line(stream: &mut BufReader<DuplexStream>, line: &str) {
        stream.write_all(format!("{line}\r\n").as_bytes()).await.unwrap();
    }

    async fn recv_line(stream: &mut BufReader<DuplexStream>) -> String {
        let mut buf = String::new();
        stream.read_line(&mut buf).await.unwrap();
        while buf.ends_with('\n') || buf.ends_with('\r') {
            buf.pop();
        }
        buf
    }

    /// A minimal `NodeService` stub: accepts one mTLS connection and answers
    /// SELECT with a canned OK, APPEND with the two-round literal protocol
    /// (checking the literal bytes match `expected_literal`), and
    /// Prepare/SessionDone with empty acks, looping until the router closes
    /// the connection.
    async fn run_fake_worker(listener: TcpListener, acceptor: TlsAcceptor, expected_literal: Vec<u8>) {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut stream = acceptor.accept(tcp).await.unwrap();
        loop {
            let Some((method, payload)) = wire::read_request(&mut stream).await.unwrap() else {
                return;
            };
            match method {
                MethodId::Select => {
                    let cmd = Command::decode(payload.as_slice()).unwrap();
                    let tag = cmd.text.split_whitespace().next().unwrap();
                    let reply = Reply {
                        text: format!("{tag} OK SELECT completed"),
                        is_append: None,
                    };
                    wire::write_response_ok(&mut stream, &reply).await.unwrap();
                }
                MethodId::Append => {
                    let cmd = Command::decode(payload.as_slice()).unwrap();
                    let tag = cmd.text.split_whitespace().next().unwrap().to_owned();
                    if cmd.literal.is_none() {
                        let reply = Reply {
                            text: String::new(),
                            is_append: Some(AwaitLiteral {
                                awaited_num_bytes: expected_literal.len() as u32,
                            }),
                        };
                        wire::write_response_ok(&mut stream, &reply).await.unwrap();
                    } else {
                        assert_eq!(cmd.literal.as_deref(), Some(expected_literal.as_slice()));
                        let reply = Reply {
                            text: format!("{tag} OK APPEND completed"),
                            is_append: None,
                        };
                        wire::write_response_ok(&mut stream, &reply).await.unwrap();
                    }
                }
                MethodId::Prepare => {
                    wire::write_response_ok(&mut stream, &PrepareReply {}).await.unwrap();
                }
                MethodId::SessionDone => {
                    wire::write_response_ok(&mut stream, &SessionDoneReply {}).await.unwrap();
                }
                other => panic!("fake worker received unexpected method {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn capability_completes_without_authentication() {
        let dir = tempfile::tempdir().unwrap();
        let (_, client_tls) = internal_configs(&dir);
        let ctx = SessionContext {
            authenticator: file_authenticator(&dir, "alice:secret\n").await,
            workers: Arc::from(Vec::<WorkerDescriptor>::new()),
            router: Arc::new(ProxyRouter::new(client_tls)),
        };

        let (client, server) = tokio::io::duplex(4096);
        let _server_task = tokio::spawn(run(server, "10.0.0.1:4000".to_owned(), ctx));
        let mut client = BufReader::new(client);

        assert_eq!(recv_line(&mut client).await, GREETING);
        send_line(&mut client, "a1 CAPABILITY").await;
        assert_eq!(recv_line(&mut client).await, CAPABILITY_LINE);
        assert_eq!(recv_line(&mut client).await, "a1 OK CAPABILITY completed");
    }

    #[tokio::test]
    async fn login_with_wrong_password_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (_, client_tls) = internal_configs(&dir);
        let ctx = SessionContext {
            authenticator: file_authenticator(&dir, "alice:secret\n").await,
            workers: Arc::from(Vec::<WorkerDescriptor>::new()),
            router: Arc::new(ProxyRouter::new(client_tls)),
        };

        let (client, server) = tokio::io::duplex(4096);
        let _server_task = tokio::spawn(run(server, "10.0.0.1:4000".to_owned(), ctx));
        let mut client = BufReader::new(client);

        assert_eq!(recv_line(&mut client).await, GREETING);
        send_line(&mut client, "a1 LOGIN alice wrong").await;
        assert_eq!(recv_line(&mut client).await, "a1 NO Name and / or password wrong");

        send_line(&mut client, "a2 CAPABILITY").await;
        assert_eq!(recv_line(&mut client).await, CAPABILITY_LINE);
        assert_eq!(recv_line(&mut client).await, "a2 OK CAPABILITY completed");
    }

    #[tokio::test]
    async fn login_then_select_tunnels_to_the_owning_worker() {
        let dir = tempfile::tempdir().unwrap();
        let (server_tls, client_tls) = internal_configs(&dir);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _worker_task = tokio::spawn(run_fake_worker(listener, TlsAcceptor::from(server_tls), Vec::new()));

        let ctx = SessionContext {
            authenticator: file_authenticator(&dir, "alice:secret\n").await,
            workers: Arc::from(vec![worker("w1", addr, None)]),
            router: Arc::new(ProxyRouter::new(client_tls)),
        };

        let (client, server) = tokio::io::duplex(8192);
        let _server_task = tokio::spawn(run(server, "10.0.0.1:4000".to_owned(), ctx));
        let mut client = BufReader::new(client);

        assert_eq!(recv_line(&mut client).await, GREETING);
        send_line(&mut client, "a1 LOGIN alice secret").await;
        assert_eq!(recv_line(&mut client).await, "a1 OK LOGIN completed");

        send_line(&mut client, "a2 SELECT INBOX").await;
        assert_eq!(recv_line(&mut client).await, "a2 OK SELECT completed");
    }

    #[tokio::test]
    async fn append_two_phase_literal_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let (server_tls, client_tls) = internal_configs(&dir);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let literal = b"hello".to_vec();
        let _worker_task = tokio::spawn(run_fake_worker(
            listener,
            TlsAcceptor::from(server_tls),
            literal.clone(),
        ));

        let ctx = SessionContext {
            authenticator: file_authenticator(&dir, "alice:secret\n").await,
            workers: Arc::from(vec![worker("w1", addr, None)]),
            router: Arc::new(ProxyRouter::new(client_tls)),
        };

        let (client, server) = tokio::io::duplex(8192);
        let _server_task = tokio::spawn(run(server, "10.0.0.1:4000".to_owned(), ctx));
        let mut client = BufReader::new(client);

        assert_eq!(recv_line(&mut client).await, GREETING);
        send_line(&mut client, "a1 LOGIN alice secret").await;
        assert_eq!(recv_line(&mut client).await, "a1 OK LOGIN completed");

        send_line(&mut client, "a2 APPEND INBOX {5}").await;
        assert_eq!(recv_line(&mut client).await, "+ Ready for literal data");
        client.write_all(&literal).await.unwrap();
        assert_eq!(recv_line(&mut client).await, "a2 OK APPEND completed");
    }

    #[tokio::test]
    async fn login_fails_over_to_secondary_when_primary_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let (server_tls, client_tls) = internal_configs(&dir);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _worker_task = tokio::spawn(run_fake_worker(listener, TlsAcceptor::from(server_tls), Vec::new()));

        // Nothing listens here: every dial attempt against it fails immediately,
        // forcing the router to fail over to the secondary on the very first LOGIN.
        let unreachable = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();

        let primary = worker("primary", unreachable, Some("secondary"));
        let secondary = worker("secondary", addr, Some("primary"));
        let ctx = SessionContext {
            authenticator: file_authenticator(&dir, "alice:secret\n").await,
            workers: Arc::from(vec![primary, secondary]),
            router: Arc::new(ProxyRouter::new(client_tls)),
        };

        let (client, server) = tokio::io::duplex(8192);
        let _server_task = tokio::spawn(run(server, "10.0.0.1:4000".to_owned(), ctx));
        let mut client = BufReader::new(client);

        assert_eq!(recv_line(&mut client).await, GREETING);
        send_line(&mut client, "a1 LOGIN alice secret").await;
        assert_eq!(recv_line(&mut client).await, "a1 OK LOGIN completed");

        send_line(&mut client, "a2 SELECT INBOX").await;
        assert_eq!(recv_line(&mut client).await, "a2 OK SELECT completed");
    }
}
